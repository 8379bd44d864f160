// Copyright 2024 nvr-snap Authors
// SPDX-License-Identifier: Apache-2.0

//! Fan-out orchestrator
//!
//! Runs the still capture protocol on a set of channels and joins on all of
//! them. Each task owns its own buffer; the session is only borrowed. A
//! failing channel is recorded in its own outcome and never cancels or
//! affects the others.

use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::buffer::{BufferPool, CaptureBuffer};
use crate::capture::StillCapture;
use crate::channels::Channel;
use crate::error::CaptureError;
use crate::session::Session;

/// How capture tasks reach the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dispatch {
    /// One thread per channel, all sharing the session handle
    #[default]
    Parallel,
    /// One worker thread draining a channel queue, for device libraries
    /// that do not allow concurrent calls on a handle
    Serialized,
}

/// Fan-out configuration
#[derive(Debug, Clone, Default)]
pub struct FanOutConfig {
    pub dispatch: Dispatch,
}

/// Result of capturing one channel in a round
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub channel: Channel,
    pub success: bool,
    /// Image bytes; empty on failure
    pub bytes: Vec<u8>,
    pub error: Option<CaptureError>,
    /// Time spent in the capture protocol
    pub elapsed: Duration,
}

impl CaptureOutcome {
    fn captured(channel: Channel, bytes: Vec<u8>, elapsed: Duration) -> Self {
        Self {
            channel,
            success: true,
            bytes,
            error: None,
            elapsed,
        }
    }

    fn failed(channel: Channel, error: CaptureError, elapsed: Duration) -> Self {
        Self {
            channel,
            success: false,
            bytes: Vec::new(),
            error: Some(error),
            elapsed,
        }
    }
}

/// Outcomes of one round, keyed by channel id
pub type RoundOutcomes = BTreeMap<u32, CaptureOutcome>;

/// Capture every channel with default settings and fresh buffers
pub fn capture_all(session: &Session, channels: &[Channel]) -> RoundOutcomes {
    FanOut::new(StillCapture::default(), FanOutConfig::default()).run(session, channels)
}

/// Fan-out orchestrator
pub struct FanOut {
    capture: StillCapture,
    config: FanOutConfig,
    /// Buffers reused across rounds; fresh buffers per task when unset
    pool: Option<BufferPool>,
}

impl FanOut {
    /// Create an orchestrator allocating a fresh buffer per task
    pub fn new(capture: StillCapture, config: FanOutConfig) -> Self {
        Self {
            capture,
            config,
            pool: None,
        }
    }

    /// Reuse buffers from `pool` across rounds
    pub fn with_pool(mut self, pool: BufferPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Get the buffer pool, if any
    pub fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    /// Get the capture executor
    pub fn capture(&self) -> &StillCapture {
        &self.capture
    }

    /// Capture all `channels` and wait for every task to finish.
    ///
    /// Returns one outcome per distinct channel id.
    pub fn run(&self, session: &Session, channels: &[Channel]) -> RoundOutcomes {
        let start = Instant::now();
        let outcomes = match self.config.dispatch {
            Dispatch::Parallel => self.run_parallel(session, channels),
            Dispatch::Serialized => self.run_serialized(session, channels),
        };

        let captured = outcomes.values().filter(|o| o.success).count();
        info!(
            "Captured {captured}/{} channels in {} ms",
            outcomes.len(),
            start.elapsed().as_millis()
        );
        outcomes
    }

    fn run_parallel(&self, session: &Session, channels: &[Channel]) -> RoundOutcomes {
        thread::scope(|scope| {
            let tasks: Vec<_> = channels
                .iter()
                .map(|&channel| (channel, scope.spawn(move || self.capture_one(session, channel))))
                .collect();

            tasks
                .into_iter()
                .map(|(channel, task)| {
                    let outcome = task.join().unwrap_or_else(|_| {
                        warn!("Capture task for channel {} panicked", channel.id);
                        CaptureOutcome::failed(channel, CaptureError::WorkerPanicked, Duration::ZERO)
                    });
                    (channel.id, outcome)
                })
                .collect()
        })
    }

    fn run_serialized(&self, session: &Session, channels: &[Channel]) -> RoundOutcomes {
        let (queue_tx, queue_rx) = flume::unbounded::<Channel>();
        let (result_tx, result_rx) = flume::unbounded::<CaptureOutcome>();
        for &channel in channels {
            if let Err(e) = queue_tx.send(channel) {
                warn!("Could not queue channel {}: {e}", channel.id);
            }
        }
        drop(queue_tx);

        thread::scope(|scope| {
            let worker = scope.spawn(move || {
                for channel in queue_rx.iter() {
                    if result_tx.send(self.capture_one(session, channel)).is_err() {
                        break;
                    }
                }
            });
            if worker.join().is_err() {
                warn!("Serialized capture worker panicked");
            }
        });

        let mut outcomes: RoundOutcomes = result_rx
            .drain()
            .map(|outcome| (outcome.channel.id, outcome))
            .collect();
        for &channel in channels {
            outcomes.entry(channel.id).or_insert_with(|| {
                CaptureOutcome::failed(channel, CaptureError::WorkerPanicked, Duration::ZERO)
            });
        }
        outcomes
    }

    fn capture_one(&self, session: &Session, channel: Channel) -> CaptureOutcome {
        let start = Instant::now();
        match &self.pool {
            Some(pool) => {
                let mut buffer = pool.acquire();
                let result = self.capture.capture_fresh(session, channel.id, &mut buffer);
                let outcome = match result {
                    Ok(_) => CaptureOutcome::captured(channel, buffer.to_vec(), start.elapsed()),
                    Err(e) => CaptureOutcome::failed(channel, e, start.elapsed()),
                };
                pool.release(buffer);
                outcome
            }
            None => {
                let mut buffer = CaptureBuffer::new();
                match self.capture.capture_fresh(session, channel.id, &mut buffer) {
                    Ok(_) => CaptureOutcome::captured(channel, buffer.into_vec(), start.elapsed()),
                    Err(e) => CaptureOutcome::failed(channel, e, start.elapsed()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::buffer::PoolConfig;
    use crate::capture::CaptureConfig;
    use crate::channels::list_enabled_channels;
    use crate::device::stub::{ChannelBehavior, StubConfig, StubDevice};
    use crate::device::{DeviceRuntime, RuntimeConfig};
    use crate::error::{SdkError, SdkErrorKind};

    fn connected(config: StubConfig) -> (Arc<StubDevice>, Session) {
        let device = Arc::new(StubDevice::new(config));
        let runtime = DeviceRuntime::init(device.clone(), RuntimeConfig::default()).unwrap();
        let mut session = Session::new(runtime);
        session.login("10.0.0.2", 8000, "admin", "admin").unwrap();
        (device, session)
    }

    #[test]
    fn test_capture_all_succeeds() {
        let (_device, session) = connected(StubConfig::with_enabled_slots(4));
        let channels = list_enabled_channels(&session).unwrap();
        let outcomes = capture_all(&session, &channels);

        assert_eq!(outcomes.len(), 4);
        for (id, outcome) in &outcomes {
            assert_eq!(*id, outcome.channel.id);
            assert!(outcome.success);
            assert_eq!(outcome.bytes.len(), 256 * 1024);
            assert!(outcome.error.is_none());
        }
    }

    #[test]
    fn test_failure_is_isolated() {
        let (device, session) = connected(StubConfig::with_enabled_slots(6));
        let channels = list_enabled_channels(&session).unwrap();
        let broken = channels[3].id;
        let offline = SdkError::new(4, SdkErrorKind::ChannelOffline);
        device.set_behavior(broken, ChannelBehavior::Fail(offline));

        let outcomes = capture_all(&session, &channels);
        assert_eq!(outcomes.len(), 6);
        let failed = &outcomes[&broken];
        assert!(!failed.success);
        assert!(failed.bytes.is_empty());
        assert_eq!(failed.error, Some(CaptureError::DeviceError(offline)));
        assert_eq!(outcomes.values().filter(|o| o.success).count(), 5);
    }

    #[test]
    fn test_serialized_dispatch() {
        let (device, session) = connected(StubConfig {
            capture_delay: Duration::from_millis(5),
            ..StubConfig::with_enabled_slots(4)
        });
        let channels = list_enabled_channels(&session).unwrap();
        let fanout = FanOut::new(
            StillCapture::default(),
            FanOutConfig {
                dispatch: Dispatch::Serialized,
            },
        );

        let outcomes = fanout.run(&session, &channels);
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.values().all(|o| o.success));
        assert_eq!(device.peak_concurrency(), 1);
    }

    #[test]
    fn test_parallel_dispatch_overlaps() {
        let (device, session) = connected(StubConfig {
            capture_delay: Duration::from_millis(200),
            ..StubConfig::with_enabled_slots(4)
        });
        let channels = list_enabled_channels(&session).unwrap();
        let outcomes = capture_all(&session, &channels);
        assert!(outcomes.values().all(|o| o.success));
        assert!(device.peak_concurrency() > 1);
    }

    #[test]
    fn test_pooled_buffers_are_reused() {
        let (_device, session) = connected(StubConfig::with_enabled_slots(3));
        let channels = list_enabled_channels(&session).unwrap();
        let pool = BufferPool::new(PoolConfig::default()).unwrap();
        let fanout = FanOut::new(StillCapture::default(), FanOutConfig::default()).with_pool(pool);

        for _ in 0..3 {
            let outcomes = fanout.run(&session, &channels);
            assert!(outcomes.values().all(|o| o.success && o.bytes.len() == 256 * 1024));
        }
        let pool = fanout.pool().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.allocations + stats.reuses, 9);
        assert!(stats.allocations <= 3);
        assert_eq!(pool.idle() as u64, stats.allocations);
    }

    #[test]
    fn test_pool_does_not_keep_ceiling_sized_buffers() {
        let (device, session) = connected(StubConfig::with_enabled_slots(4));
        let channels = list_enabled_channels(&session).unwrap();
        for channel in &channels {
            device.set_behavior(channel.id, ChannelBehavior::AlwaysTooSmall { hint: None });
        }
        let capture = StillCapture::new(CaptureConfig {
            buffer_ceiling: 16 * 1024 * 1024,
            ..Default::default()
        })
        .unwrap();
        let pool = BufferPool::new(PoolConfig::default()).unwrap();
        let fanout = FanOut::new(capture, FanOutConfig::default()).with_pool(pool);

        let outcomes = fanout.run(&session, &channels);
        assert!(outcomes.values().all(|o| matches!(
            o.error,
            Some(CaptureError::BufferLimitExceeded {
                limit: 16_777_216,
                ..
            })
        )));

        let pool = fanout.pool().unwrap();
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.stats().discards, 4);
    }

    #[test]
    fn test_not_connected_marks_every_channel_failed() {
        let (_device, mut session) = connected(StubConfig::with_enabled_slots(2));
        let channels = list_enabled_channels(&session).unwrap();
        session.logout();
        let outcomes = capture_all(&session, &channels);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .values()
            .all(|o| o.error == Some(CaptureError::NotConnected)));
    }

    #[test]
    fn test_empty_channel_list() {
        let (_device, session) = connected(StubConfig::default());
        assert!(capture_all(&session, &[]).is_empty());
    }
}
