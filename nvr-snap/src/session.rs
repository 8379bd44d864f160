// Copyright 2024 nvr-snap Authors
// SPDX-License-Identifier: Apache-2.0

//! Device session
//!
//! A [`Session`] owns at most one logged-in device handle. Logging in again
//! logs the previous handle out first, and the handle is released when the
//! session is dropped.
//!
//! Captures borrow the session immutably and may run concurrently; login
//! and logout need `&mut self`, so the borrow checker keeps them from
//! overlapping with captures in flight.

use std::sync::Arc;

use log::{info, warn};

use crate::device::{DeviceClient, DeviceRuntime};
use crate::error::{SdkErrorKind, SessionError};
use crate::protocol::{Credentials, DeviceHandle, LoginParams};

/// Session to one device
pub struct Session {
    /// Process-scoped device library
    runtime: Arc<DeviceRuntime>,
    /// Active device handle
    handle: Option<DeviceHandle>,
    /// Address of the device last logged in to
    address: Option<String>,
    /// Port of the device last logged in to
    port: u16,
    /// Credentials of the last login
    credentials: Option<Credentials>,
}

impl Session {
    /// Create an empty session
    pub fn new(runtime: Arc<DeviceRuntime>) -> Self {
        Self {
            runtime,
            handle: None,
            address: None,
            port: 0,
            credentials: None,
        }
    }

    /// Log in to a device.
    ///
    /// Any handle held from a previous login is logged out first. A single
    /// attempt is made; reconnection is left to the device library.
    pub fn login(
        &mut self,
        address: &str,
        port: u16,
        user: &str,
        password: &str,
    ) -> Result<(), SessionError> {
        self.logout();

        if !self.runtime.is_initialized() {
            warn!("Login to {address}:{port} refused: device runtime not initialized");
            return Err(SessionError::NotInitialized);
        }

        let params = LoginParams {
            address: address.to_string(),
            port,
            credentials: Credentials::new(user, password),
        };

        match self.runtime.client().connect(&params) {
            Ok(handle) => {
                info!("Logged in to {address}:{port} (handle {handle})");
                self.handle = Some(handle);
                self.address = Some(params.address);
                self.port = port;
                self.credentials = Some(params.credentials);
                Ok(())
            }
            Err(source) => {
                warn!("Login to {address}:{port} failed: {source}");
                let address = format!("{address}:{port}");
                Err(match source.kind {
                    SdkErrorKind::BadCredentials => SessionError::Auth { address, source },
                    _ => SessionError::Connection { address, source },
                })
            }
        }
    }

    /// Log in again with the address and credentials of the last login
    pub fn relogin(&mut self) -> Result<(), SessionError> {
        let (Some(address), Some(credentials)) = (self.address.clone(), self.credentials.clone())
        else {
            return Err(SessionError::NeverLoggedIn);
        };
        let port = self.port;
        self.login(&address, port, &credentials.user, &credentials.password)
    }

    /// Log out. Does nothing if not logged in.
    pub fn logout(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.runtime.client().disconnect(handle) {
                warn!("Logout of handle {handle} reported: {e}");
            } else {
                info!("Logged out (handle {handle})");
            }
        }
    }

    /// Check if a device handle is held
    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// Active device handle
    pub fn handle(&self) -> Option<DeviceHandle> {
        self.handle
    }

    /// Address of the device last logged in to
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Device client backing this session
    pub fn client(&self) -> &dyn DeviceClient {
        self.runtime.client()
    }

    /// Runtime backing this session
    pub fn runtime(&self) -> &Arc<DeviceRuntime> {
        &self.runtime
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.logout();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::stub::{StubConfig, StubDevice};
    use crate::device::RuntimeConfig;

    fn setup(config: StubConfig) -> (Arc<StubDevice>, Arc<DeviceRuntime>) {
        let device = Arc::new(StubDevice::new(config));
        let runtime = DeviceRuntime::init(device.clone(), RuntimeConfig::default()).unwrap();
        (device, runtime)
    }

    #[test]
    fn test_login_logout() {
        let (device, runtime) = setup(StubConfig::default());
        let mut session = Session::new(runtime);
        assert!(!session.is_connected());

        session.login("10.0.0.2", 8000, "admin", "admin").unwrap();
        assert!(session.is_connected());
        assert_eq!(session.address(), Some("10.0.0.2"));
        assert_eq!(device.live_handles(), 1);

        session.logout();
        assert!(!session.is_connected());
        assert_eq!(device.live_handles(), 0);
    }

    #[test]
    fn test_relogin_replaces_handle() {
        let (device, runtime) = setup(StubConfig::default());
        let mut session = Session::new(runtime);

        session.login("10.0.0.2", 8000, "admin", "admin").unwrap();
        let first = session.handle();
        session.login("10.0.0.2", 8000, "admin", "admin").unwrap();

        assert_ne!(session.handle(), first);
        assert_eq!(device.live_handles(), 1);
        assert_eq!(device.connects(), 2);
        assert_eq!(device.disconnects(), 1);
    }

    #[test]
    fn test_logout_is_idempotent() {
        let (device, runtime) = setup(StubConfig::default());
        let mut session = Session::new(runtime);
        session.logout();
        session.login("10.0.0.2", 8000, "admin", "admin").unwrap();
        session.logout();
        session.logout();
        assert_eq!(device.disconnects(), 1);
        assert!(!session.is_connected());
    }

    #[test]
    fn test_bad_credentials() {
        let (device, runtime) = setup(StubConfig::default());
        let mut session = Session::new(runtime);
        let err = session.login("10.0.0.2", 8000, "admin", "wrong").unwrap_err();
        assert!(matches!(err, SessionError::Auth { .. }));
        assert!(!session.is_connected());
        assert_eq!(device.live_handles(), 0);
    }

    #[test]
    fn test_unreachable_device() {
        let (_device, runtime) = setup(StubConfig {
            unreachable: true,
            ..Default::default()
        });
        let mut session = Session::new(runtime);
        let err = session.login("10.0.0.9", 8000, "admin", "admin").unwrap_err();
        assert!(matches!(err, SessionError::Connection { .. }));
    }

    #[test]
    fn test_failed_relogin_drops_previous_handle() {
        let (device, runtime) = setup(StubConfig::default());
        let mut session = Session::new(runtime);
        session.login("10.0.0.2", 8000, "admin", "admin").unwrap();
        assert!(session.login("10.0.0.2", 8000, "admin", "wrong").is_err());
        assert!(!session.is_connected());
        assert_eq!(device.live_handles(), 0);
    }

    #[test]
    fn test_login_requires_initialized_runtime() {
        let device = Arc::new(StubDevice::new(StubConfig::default()));
        let runtime = Arc::new(DeviceRuntime::new(device, RuntimeConfig::default()));
        let mut session = Session::new(runtime);
        let err = session.login("10.0.0.2", 8000, "admin", "admin").unwrap_err();
        assert_eq!(err, SessionError::NotInitialized);
    }

    #[test]
    fn test_drop_logs_out() {
        let (device, runtime) = setup(StubConfig::default());
        {
            let mut session = Session::new(runtime);
            session.login("10.0.0.2", 8000, "admin", "admin").unwrap();
            assert_eq!(device.live_handles(), 1);
        }
        assert_eq!(device.live_handles(), 0);
        assert_eq!(device.disconnects(), 1);
    }

    #[test]
    fn test_relogin_uses_last_credentials() {
        let (device, runtime) = setup(StubConfig::default());
        let mut session = Session::new(runtime);
        assert_eq!(session.relogin(), Err(SessionError::NeverLoggedIn));

        session.login("10.0.0.2", 8000, "admin", "admin").unwrap();
        device.expire_sessions();
        session.relogin().unwrap();
        assert!(session.is_connected());
        assert_eq!(device.live_handles(), 1);
    }
}
