// Copyright 2024 nvr-snap Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture buffers
//!
//! [`CaptureBuffer`] is the growable byte buffer handed to the device for a
//! still capture. It tracks the allocated capacity separately from the
//! logical length of the image it holds. [`BufferPool`] keeps buffers
//! around between fan-out rounds so a high-frequency capture loop does not
//! reallocate on every round.

use std::sync::Mutex;

use log::debug;

use crate::error::CaptureError;
use crate::protocol::CAPTURE_BUFFER_FLOOR;

/// Growable capture buffer
///
/// Invariant: `len() <= capacity()`. After a successful capture `len()` is
/// exactly the number of bytes the device reported writing.
#[derive(Debug, Default)]
pub struct CaptureBuffer {
    /// Allocated region; its length is the capacity offered to the device
    data: Vec<u8>,
    /// Logical image length
    len: usize,
}

impl CaptureBuffer {
    /// Create an empty buffer with no capacity
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer with `capacity` writable bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            len: 0,
        }
    }

    /// Allocated size offered to the device
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Logical image length
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Image bytes, without trailing unused capacity
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Grow the capacity to at least `capacity` bytes.
    ///
    /// Existing content is discarded: an image is never partially valid
    /// across capture attempts.
    pub fn grow_to(&mut self, capacity: usize) {
        self.len = 0;
        if capacity > self.data.len() {
            self.data.clear();
            self.data.resize(capacity, 0);
        }
    }

    /// Hand out the whole allocated region for the device to write into.
    ///
    /// The logical length is reset, since the region is about to be
    /// overwritten.
    pub fn writable(&mut self) -> &mut [u8] {
        self.len = 0;
        &mut self.data
    }

    /// Record the number of bytes the device wrote
    pub fn set_len(&mut self, len: usize) -> Result<(), CaptureError> {
        if len > self.data.len() {
            return Err(CaptureError::InvalidSize {
                written: len,
                capacity: self.data.len(),
            });
        }
        self.len = len;
        Ok(())
    }

    /// Forget the current image, keeping the allocation
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Copy the image out
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    /// Take the image, dropping trailing unused capacity
    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.truncate(self.len);
        self.data.shrink_to_fit();
        self.data
    }
}

impl AsRef<[u8]> for CaptureBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Capacity of newly allocated buffers
    pub initial_capacity: usize,
    /// Maximum number of idle buffers kept for reuse
    pub max_idle: usize,
    /// Largest buffer kept on release; bigger ones are dropped
    pub max_retained_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_capacity: CAPTURE_BUFFER_FLOOR,
            max_idle: 64,
            max_retained_capacity: 4 * CAPTURE_BUFFER_FLOOR,
        }
    }
}

impl PoolConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_idle == 0 {
            return Err("Pool must keep at least one idle buffer".to_string());
        }
        if self.max_retained_capacity < self.initial_capacity {
            return Err(format!(
                "Retained capacity {} is below the initial capacity {}",
                self.max_retained_capacity, self.initial_capacity
            ));
        }
        Ok(())
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers allocated because the pool was empty
    pub allocations: u64,
    /// Buffers handed out from the idle list
    pub reuses: u64,
    /// Buffers dropped on release because the idle list was full or the
    /// buffer had grown past the retained capacity
    pub discards: u64,
}

/// Pool of reusable capture buffers
///
/// A buffer taken from the pool is owned by exactly one caller until it is
/// released back.
pub struct BufferPool {
    config: PoolConfig,
    idle: Mutex<Vec<CaptureBuffer>>,
    stats: Mutex<PoolStats>,
}

impl BufferPool {
    /// Create a new pool
    pub fn new(config: PoolConfig) -> Result<Self, String> {
        config.validate()?;
        Ok(Self {
            config,
            idle: Mutex::new(Vec::new()),
            stats: Mutex::new(PoolStats::default()),
        })
    }

    /// Take a buffer, reusing an idle one when available
    pub fn acquire(&self) -> CaptureBuffer {
        let reused = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        match reused {
            Some(buffer) => {
                stats.reuses += 1;
                buffer
            }
            None => {
                stats.allocations += 1;
                CaptureBuffer::with_capacity(self.config.initial_capacity)
            }
        }
    }

    /// Return a buffer to the pool
    pub fn release(&self, mut buffer: CaptureBuffer) {
        buffer.clear();
        if buffer.capacity() > self.config.max_retained_capacity {
            debug!(
                "Dropping pooled buffer of {} bytes (retain limit {})",
                buffer.capacity(),
                self.config.max_retained_capacity
            );
            self.stats.lock().unwrap_or_else(|e| e.into_inner()).discards += 1;
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.config.max_idle {
            idle.push(buffer);
        } else {
            self.stats.lock().unwrap_or_else(|e| e.into_inner()).discards += 1;
        }
    }

    /// Number of idle buffers
    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Get statistics
    pub fn stats(&self) -> PoolStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
