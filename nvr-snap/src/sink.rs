// Copyright 2024 nvr-snap Authors
// SPDX-License-Identifier: Apache-2.0

//! Snapshot persistence
//!
//! Captured images are handed to a [`SnapshotSink`] as exact byte
//! sequences, with no trailing padding.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Snapshot sink trait
pub trait SnapshotSink: Send + Sync {
    /// Store the image captured from `channel`
    fn store(&self, channel: u32, image: &[u8]) -> io::Result<()>;
}

/// Sink writing `chn_<id>.jpg` files into a directory
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    /// Create the sink, creating the directory if needed
    pub fn new<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Path an image of `channel` is written to
    pub fn path_for(&self, channel: u32) -> PathBuf {
        self.dir.join(format!("chn_{channel}.jpg"))
    }
}

impl SnapshotSink for DirectorySink {
    fn store(&self, channel: u32, image: &[u8]) -> io::Result<()> {
        fs::write(self.path_for(channel), image)
    }
}

/// Sink keeping stored images in memory
#[derive(Default)]
pub struct MemorySink {
    images: Mutex<Vec<(u32, Vec<u8>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything stored so far, in store order
    pub fn images(&self) -> Vec<(u32, Vec<u8>)> {
        self.images.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SnapshotSink for MemorySink {
    fn store(&self, channel: u32, image: &[u8]) -> io::Result<()> {
        self.images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((channel, image.to_vec()));
        Ok(())
    }
}
