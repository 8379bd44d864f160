// Copyright 2024 nvr-snap Authors
// SPDX-License-Identifier: Apache-2.0

//! Still capture protocol
//!
//! Captures a JPEG still from one channel into a caller-owned
//! [`CaptureBuffer`]. When the device reports the buffer as too small, the
//! buffer is grown (to the size the device asked for, or double the current
//! capacity when it gives no hint) and the capture is retried, up to a hard
//! capacity ceiling. Every other device failure ends the call.

use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::buffer::CaptureBuffer;
use crate::error::{CaptureError, IFrameError};
use crate::protocol::*;
use crate::session::Session;

/// Capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Minimum buffer capacity before the first attempt
    pub buffer_floor: usize,
    /// Hard ceiling on buffer growth
    pub buffer_ceiling: usize,
    /// JPEG parameters sent with each capture
    pub jpeg: JpegParams,
    /// Stream to force a key frame on before capturing (`capture_fresh` only)
    pub key_frame: Option<StreamType>,
    /// Delay between a successful key frame request and the capture
    pub settle: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_floor: CAPTURE_BUFFER_FLOOR,
            buffer_ceiling: CAPTURE_BUFFER_CEILING,
            jpeg: JpegParams::default(),
            key_frame: None,
            settle: Duration::from_millis(DEFAULT_SETTLE_MS),
        }
    }
}

impl CaptureConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_floor == 0 {
            return Err("Buffer floor cannot be zero".to_string());
        }
        if self.buffer_ceiling < self.buffer_floor {
            return Err(format!(
                "Buffer ceiling {} is below the floor {}",
                self.buffer_ceiling, self.buffer_floor
            ));
        }
        Ok(())
    }
}

/// Capacity to retry with after a buffer-too-small response
///
/// Uses the size the device asked for when it is larger than the current
/// capacity, otherwise doubles.
pub fn next_capacity(current: usize, required: Option<usize>) -> usize {
    match required {
        Some(required) if required > current => required,
        _ => current.saturating_mul(2).max(1),
    }
}

/// Request a fresh key frame on `channel`.
///
/// Best effort: callers typically wait a few tens of milliseconds and then
/// capture whether or not this succeeded.
pub fn force_key_frame(
    session: &Session,
    channel: u32,
    stream: StreamType,
) -> Result<(), IFrameError> {
    let handle = session.handle().ok_or(IFrameError::NotConnected)?;
    session
        .client()
        .force_key_frame(handle, channel, stream)
        .map_err(|source| IFrameError::Rejected { channel, source })
}

/// Capture with the default configuration
pub fn capture(
    session: &Session,
    channel: u32,
    buffer: &mut CaptureBuffer,
) -> Result<usize, CaptureError> {
    StillCapture::default().capture(session, channel, buffer)
}

/// Still capture executor
#[derive(Debug, Clone, Default)]
pub struct StillCapture {
    config: CaptureConfig,
}

impl StillCapture {
    /// Create a new executor
    pub fn new(config: CaptureConfig) -> Result<Self, String> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Get configuration
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Capture a still from `channel` into `buffer`.
    ///
    /// On success the buffer's logical length is exactly the number of bytes
    /// the device wrote, which is also returned.
    pub fn capture(
        &self,
        session: &Session,
        channel: u32,
        buffer: &mut CaptureBuffer,
    ) -> Result<usize, CaptureError> {
        let handle = session.handle().ok_or(CaptureError::NotConnected)?;

        if buffer.capacity() < self.config.buffer_floor {
            buffer.grow_to(self.config.buffer_floor);
        }

        let client = session.client();
        let mut attempt = 1u32;
        loop {
            let capacity = buffer.capacity();
            let status = client
                .capture_still(handle, channel, &self.config.jpeg, buffer.writable())
                .map_err(|e| {
                    warn!("Capture failed on channel {channel}: {e}");
                    CaptureError::DeviceError(e)
                })?;

            match status {
                StillStatus::Written(0) => {
                    warn!("Channel {channel} returned an empty image");
                    return Err(CaptureError::EmptyImage);
                }
                StillStatus::Written(written) => {
                    buffer.set_len(written)?;
                    debug!("Captured channel {channel}: {written} bytes after {attempt} attempt(s)");
                    return Ok(written);
                }
                StillStatus::BufferTooSmall { required } => {
                    let target = self.grow_target(capacity, required)?;
                    debug!(
                        "Channel {channel}: buffer of {capacity} bytes too small (hint {required:?}), growing to {target}"
                    );
                    buffer.grow_to(target);
                    attempt += 1;
                }
            }
        }
    }

    /// Force a key frame, let the encoder settle, then capture.
    ///
    /// Without a configured key frame stream this is a plain capture. A
    /// rejected key frame request is logged and the capture goes ahead.
    pub fn capture_fresh(
        &self,
        session: &Session,
        channel: u32,
        buffer: &mut CaptureBuffer,
    ) -> Result<usize, CaptureError> {
        if let Some(stream) = self.config.key_frame {
            match force_key_frame(session, channel, stream) {
                Ok(()) => {
                    if !self.config.settle.is_zero() {
                        thread::sleep(self.config.settle);
                    }
                }
                Err(e) => warn!("Key frame request failed, capturing anyway: {e}"),
            }
        }
        self.capture(session, channel, buffer)
    }

    /// Capture into a fresh buffer and return the image bytes
    pub fn snapshot(&self, session: &Session, channel: u32) -> Result<Vec<u8>, CaptureError> {
        let mut buffer = CaptureBuffer::new();
        self.capture_fresh(session, channel, &mut buffer)?;
        Ok(buffer.into_vec())
    }

    fn grow_target(&self, current: usize, required: Option<usize>) -> Result<usize, CaptureError> {
        let limit = self.config.buffer_ceiling;
        if let Some(required) = required.filter(|&r| r > limit) {
            return Err(CaptureError::BufferLimitExceeded { required, limit });
        }

        let target = next_capacity(current, required);
        if target <= limit {
            Ok(target)
        } else if current < limit {
            Ok(limit)
        } else {
            Err(CaptureError::BufferLimitExceeded {
                required: target,
                limit,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use crate::device::{DeviceClient, DeviceRuntime, RuntimeConfig};
    use crate::error::{SdkError, SdkErrorKind};

    /// Device answering capture calls from a fixed script
    struct ScriptedDevice {
        script: Mutex<VecDeque<Result<StillStatus, SdkError>>>,
        capacities: Mutex<Vec<usize>>,
        key_frame_result: Result<(), SdkError>,
    }

    impl ScriptedDevice {
        fn new(script: Vec<Result<StillStatus, SdkError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                capacities: Mutex::new(Vec::new()),
                key_frame_result: Ok(()),
            }
        }

        fn capacities(&self) -> Vec<usize> {
            self.capacities.lock().unwrap().clone()
        }
    }

    impl DeviceClient for ScriptedDevice {
        fn init(&self, _config: &RuntimeConfig) -> Result<(), SdkError> {
            Ok(())
        }

        fn cleanup(&self) {}

        fn connect(&self, _params: &LoginParams) -> Result<DeviceHandle, SdkError> {
            Ok(DeviceHandle(7))
        }

        fn disconnect(&self, _handle: DeviceHandle) -> Result<(), SdkError> {
            Ok(())
        }

        fn query_channel_config(&self, _handle: DeviceHandle) -> Result<ChannelConfig, SdkError> {
            Ok(ChannelConfig::default())
        }

        fn force_key_frame(
            &self,
            _handle: DeviceHandle,
            _channel: u32,
            _stream: StreamType,
        ) -> Result<(), SdkError> {
            self.key_frame_result
        }

        fn capture_still(
            &self,
            _handle: DeviceHandle,
            _channel: u32,
            _params: &JpegParams,
            buf: &mut [u8],
        ) -> Result<StillStatus, SdkError> {
            self.capacities.lock().unwrap().push(buf.len());
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(StillStatus::Written(16)));
            if let Ok(StillStatus::Written(n)) = next {
                for (i, byte) in buf.iter_mut().take(n).enumerate() {
                    *byte = i as u8;
                }
            }
            next
        }
    }

    fn session_for(device: Arc<ScriptedDevice>) -> Session {
        let runtime = DeviceRuntime::init(device, RuntimeConfig::default()).unwrap();
        let mut session = Session::new(runtime);
        session.login("10.0.0.2", 8000, "admin", "admin").unwrap();
        session
    }

    fn small_config() -> CaptureConfig {
        CaptureConfig {
            buffer_floor: 1024,
            buffer_ceiling: 64 * 1024,
            settle: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_next_capacity() {
        assert_eq!(next_capacity(1024, Some(5000)), 5000);
        assert_eq!(next_capacity(1024, None), 2048);
        assert_eq!(next_capacity(1024, Some(512)), 2048);
        assert_eq!(next_capacity(1024, Some(1024)), 2048);
        assert_eq!(next_capacity(0, None), 1);
    }

    #[test]
    fn test_config_validation() {
        CaptureConfig::default().validate().unwrap();
        let invalid = CaptureConfig {
            buffer_floor: 2048,
            buffer_ceiling: 1024,
            ..Default::default()
        };
        assert!(invalid.validate().is_err());
        assert!(StillCapture::new(invalid).is_err());
    }

    #[test]
    fn test_not_connected() {
        let device = Arc::new(ScriptedDevice::new(vec![]));
        let runtime = DeviceRuntime::init(device.clone(), RuntimeConfig::default()).unwrap();
        let session = Session::new(runtime);
        let mut buffer = CaptureBuffer::new();
        assert_eq!(
            capture(&session, 1, &mut buffer),
            Err(CaptureError::NotConnected)
        );
        assert!(device.capacities().is_empty());
    }

    #[test]
    fn test_buffer_primed_to_floor() {
        let device = Arc::new(ScriptedDevice::new(vec![Ok(StillStatus::Written(100))]));
        let session = session_for(device.clone());
        let mut buffer = CaptureBuffer::new();

        let written = capture(&session, 1, &mut buffer).unwrap();
        assert_eq!(written, 100);
        assert_eq!(device.capacities(), vec![CAPTURE_BUFFER_FLOOR]);
        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.as_bytes().len(), 100);
    }

    #[test]
    fn test_larger_buffer_is_kept() {
        let device = Arc::new(ScriptedDevice::new(vec![Ok(StillStatus::Written(10))]));
        let session = session_for(device.clone());
        let mut buffer = CaptureBuffer::with_capacity(3 * CAPTURE_BUFFER_FLOOR);
        capture(&session, 1, &mut buffer).unwrap();
        assert_eq!(device.capacities(), vec![3 * CAPTURE_BUFFER_FLOOR]);
    }

    #[test]
    fn test_growth_uses_device_hint() {
        let device = Arc::new(ScriptedDevice::new(vec![
            Ok(StillStatus::BufferTooSmall {
                required: Some(5000),
            }),
            Ok(StillStatus::Written(4321)),
        ]));
        let session = session_for(device.clone());
        let capture = StillCapture::new(small_config()).unwrap();
        let mut buffer = CaptureBuffer::new();

        assert_eq!(capture.capture(&session, 1, &mut buffer), Ok(4321));
        assert_eq!(device.capacities(), vec![1024, 5000]);
        assert_eq!(buffer.len(), 4321);
        assert_eq!(buffer.capacity(), 5000);
    }

    #[test]
    fn test_growth_doubles_without_hint() {
        let device = Arc::new(ScriptedDevice::new(vec![
            Ok(StillStatus::BufferTooSmall { required: None }),
            Ok(StillStatus::BufferTooSmall { required: Some(10) }),
            Ok(StillStatus::BufferTooSmall { required: None }),
            Ok(StillStatus::Written(3000)),
        ]));
        let session = session_for(device.clone());
        let capture = StillCapture::new(small_config()).unwrap();
        let mut buffer = CaptureBuffer::new();

        capture.capture(&session, 1, &mut buffer).unwrap();
        let capacities = device.capacities();
        assert_eq!(capacities, vec![1024, 2048, 4096, 8192]);
        assert!(capacities.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(buffer.len(), 3000);
    }

    #[test]
    fn test_growth_stops_at_ceiling() {
        let script = (0..32)
            .map(|_| Ok(StillStatus::BufferTooSmall { required: None }))
            .collect();
        let device = Arc::new(ScriptedDevice::new(script));
        let session = session_for(device.clone());
        let capture = StillCapture::new(CaptureConfig {
            buffer_floor: 1000,
            buffer_ceiling: 5000,
            ..small_config()
        })
        .unwrap();
        let mut buffer = CaptureBuffer::new();

        let err = capture.capture(&session, 1, &mut buffer).unwrap_err();
        assert_eq!(
            err,
            CaptureError::BufferLimitExceeded {
                required: 10_000,
                limit: 5000
            }
        );
        assert_eq!(device.capacities(), vec![1000, 2000, 4000, 5000]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_hint_above_ceiling_fails_fast() {
        let device = Arc::new(ScriptedDevice::new(vec![Ok(StillStatus::BufferTooSmall {
            required: Some(1 << 30),
        })]));
        let session = session_for(device.clone());
        let capture = StillCapture::new(small_config()).unwrap();
        let mut buffer = CaptureBuffer::new();

        let err = capture.capture(&session, 1, &mut buffer).unwrap_err();
        assert!(matches!(err, CaptureError::BufferLimitExceeded { .. }));
        assert_eq!(device.capacities().len(), 1);
    }

    #[test]
    fn test_device_error_is_terminal() {
        let offline = SdkError::new(18, SdkErrorKind::ChannelOffline);
        let device = Arc::new(ScriptedDevice::new(vec![Err(offline)]));
        let session = session_for(device.clone());
        let mut buffer = CaptureBuffer::new();

        assert_eq!(
            capture(&session, 1, &mut buffer),
            Err(CaptureError::DeviceError(offline))
        );
        assert_eq!(device.capacities().len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_empty_image_is_an_error() {
        let device = Arc::new(ScriptedDevice::new(vec![Ok(StillStatus::Written(0))]));
        let session = session_for(device);
        let mut buffer = CaptureBuffer::new();
        assert_eq!(
            capture(&session, 1, &mut buffer),
            Err(CaptureError::EmptyImage)
        );
    }

    #[test]
    fn test_overreported_size_is_an_error() {
        let device = Arc::new(ScriptedDevice::new(vec![Ok(StillStatus::Written(
            CAPTURE_BUFFER_FLOOR + 1,
        ))]));
        let session = session_for(device);
        let mut buffer = CaptureBuffer::new();
        let err = capture(&session, 1, &mut buffer).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidSize { .. }));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_capture_fresh_ignores_key_frame_failure() {
        let mut device = ScriptedDevice::new(vec![Ok(StillStatus::Written(64))]);
        device.key_frame_result = Err(SdkError::new(23, SdkErrorKind::Other));
        let session = session_for(Arc::new(device));
        let capture = StillCapture::new(CaptureConfig {
            key_frame: Some(StreamType::Main),
            ..small_config()
        })
        .unwrap();

        assert!(matches!(
            force_key_frame(&session, 1, StreamType::Main),
            Err(IFrameError::Rejected { channel: 1, .. })
        ));
        let bytes = capture.snapshot(&session, 1).unwrap();
        assert_eq!(bytes.len(), 64);
    }

    #[test]
    fn test_force_key_frame_requires_connection() {
        let device = Arc::new(ScriptedDevice::new(vec![]));
        let runtime = DeviceRuntime::init(device, RuntimeConfig::default()).unwrap();
        let session = Session::new(runtime);
        assert_eq!(
            force_key_frame(&session, 1, StreamType::Sub),
            Err(IFrameError::NotConnected)
        );
    }
}
