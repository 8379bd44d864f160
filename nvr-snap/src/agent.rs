// Copyright 2024 nvr-snap Authors
// SPDX-License-Identifier: Apache-2.0

//! Snapshot agent
//!
//! Ties the pieces together: log in, discover enabled channels, then run
//! capture rounds and hand every captured image to the sink.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::Serialize;

use crate::buffer::{BufferPool, PoolConfig};
use crate::capture::{CaptureConfig, StillCapture};
use crate::channels::{list_enabled_channels, Channel};
use crate::device::DeviceRuntime;
use crate::error::AgentError;
use crate::fanout::{FanOut, FanOutConfig, RoundOutcomes};
use crate::protocol::{Credentials, DEFAULT_PORT};
use crate::session::Session;
use crate::sink::SnapshotSink;

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Device address
    pub address: String,
    /// Device port
    pub port: u16,
    /// Login credentials
    pub credentials: Credentials,
    /// Directory snapshots are written to
    pub output_dir: PathBuf,
    /// Number of rounds to run (0 runs until stopped)
    pub rounds: u32,
    /// Minimum time between round starts
    pub interval: Duration,
    /// Capture protocol configuration
    pub capture: CaptureConfig,
    /// Fan-out configuration
    pub fanout: FanOutConfig,
    /// Buffer pool configuration
    pub pool: PoolConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: "192.168.1.64".to_string(),
            port: DEFAULT_PORT,
            credentials: Credentials::new("admin", ""),
            output_dir: PathBuf::from("./snapshots"),
            rounds: 1,
            interval: Duration::from_secs(1),
            capture: CaptureConfig::default(),
            fanout: FanOutConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

/// Per-channel entry of a round report
#[derive(Debug, Clone, Serialize)]
pub struct ChannelReport {
    pub channel: u32,
    pub success: bool,
    pub bytes: usize,
    pub elapsed_ms: u64,
    pub stored: bool,
    pub error: Option<String>,
}

/// Summary of one capture round
#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub round: u64,
    pub elapsed_ms: u64,
    pub captured: usize,
    pub failed: usize,
    pub channels: Vec<ChannelReport>,
}

/// Snapshot agent
pub struct SnapAgent {
    config: AgentConfig,
    session: Session,
    fanout: FanOut,
    sink: Arc<dyn SnapshotSink>,
    channels: Vec<Channel>,
    rounds_run: u64,
}

impl SnapAgent {
    /// Create a new agent
    pub fn new(
        config: AgentConfig,
        runtime: Arc<DeviceRuntime>,
        sink: Arc<dyn SnapshotSink>,
    ) -> Result<Self, AgentError> {
        let capture = StillCapture::new(config.capture.clone()).map_err(AgentError::Config)?;
        let pool = BufferPool::new(config.pool.clone()).map_err(AgentError::Config)?;
        let fanout = FanOut::new(capture, config.fanout.clone()).with_pool(pool);

        Ok(Self {
            config,
            session: Session::new(runtime),
            fanout,
            sink,
            channels: Vec::new(),
            rounds_run: 0,
        })
    }

    /// Log in and discover channels
    pub fn start(&mut self) -> Result<(), AgentError> {
        let credentials = &self.config.credentials;
        self.session.login(
            &self.config.address,
            self.config.port,
            &credentials.user,
            &credentials.password,
        )?;
        self.discover()?;
        info!("Snapshot agent started");
        Ok(())
    }

    /// Log out
    pub fn stop(&mut self) {
        if self.session.is_connected() {
            self.session.logout();
            info!("Snapshot agent stopped after {} round(s)", self.rounds_run);
        }
    }

    /// Run one capture round over every discovered channel.
    ///
    /// If every channel fails, the session is re-established once before
    /// returning so the next round starts from a fresh login.
    pub fn run_round(&mut self) -> Result<RoundReport, AgentError> {
        if !self.session.is_connected() {
            self.reconnect()?;
        }

        let start = Instant::now();
        let outcomes = self.fanout.run(&self.session, &self.channels);
        self.rounds_run += 1;
        let report = self.persist(&outcomes, start.elapsed());

        if report.captured == 0 && report.failed > 0 {
            warn!("Every channel failed in round {}, logging in again", report.round);
            if let Err(e) = self.reconnect() {
                warn!("Re-login failed: {e}");
            }
        }
        Ok(report)
    }

    /// Enabled channels found at the last discovery
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Get the session
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Get configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Number of rounds run so far
    pub fn rounds_run(&self) -> u64 {
        self.rounds_run
    }

    fn discover(&mut self) -> Result<(), AgentError> {
        self.channels = list_enabled_channels(&self.session)?;
        let ids: Vec<u32> = self.channels.iter().map(|c| c.id).collect();
        info!("Online channels: {ids:?}");
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), AgentError> {
        self.session.relogin()?;
        self.discover()
    }

    fn persist(&self, outcomes: &RoundOutcomes, elapsed: Duration) -> RoundReport {
        let channels: Vec<ChannelReport> = outcomes
            .values()
            .map(|outcome| {
                let stored = outcome.success
                    && match self.sink.store(outcome.channel.id, &outcome.bytes) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("Storing channel {} failed: {e}", outcome.channel.id);
                            false
                        }
                    };
                ChannelReport {
                    channel: outcome.channel.id,
                    success: outcome.success,
                    bytes: outcome.bytes.len(),
                    elapsed_ms: outcome.elapsed.as_millis() as u64,
                    stored,
                    error: outcome.error.as_ref().map(|e| e.label()),
                }
            })
            .collect();

        let captured = channels.iter().filter(|c| c.success).count();
        RoundReport {
            round: self.rounds_run,
            elapsed_ms: elapsed.as_millis() as u64,
            captured,
            failed: channels.len() - captured,
            channels,
        }
    }
}

impl Drop for SnapAgent {
    fn drop(&mut self) {
        self.stop();
    }
}
