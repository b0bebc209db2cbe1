use crate::executor::{Attempt, TransportError};
use crate::input::DeviceFingerprint;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session could not be opened: {0}")]
    Open(String),
    #[error("Session command failed: {0}")]
    Command(String),
    #[error("No vendor session implementation is available")]
    Unavailable,
}

/// The vendor session protocol, seen from the fuzzer.
///
/// Implementations own the encryption and framing details; the fuzzer only
/// opens sessions by fingerprint and exchanges command payloads.
pub trait SessionCapability: Send {
    type Handle: Send;

    fn open(&mut self, fingerprint: &DeviceFingerprint) -> Result<Self::Handle, SessionError>;

    /// `Ok(None)` means the device did not answer in time.
    fn send_command(
        &mut self,
        handle: &mut Self::Handle,
        cmd: u32,
        payload: &[u8],
    ) -> Result<Option<JsonValue>, SessionError>;

    fn is_valid(&self, _handle: &Self::Handle) -> bool {
        true
    }
}

/// Capability used when no vendor implementation is linked into the binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableSession;

impl SessionCapability for UnavailableSession {
    type Handle = ();

    fn open(&mut self, _fingerprint: &DeviceFingerprint) -> Result<(), SessionError> {
        Err(SessionError::Unavailable)
    }

    fn send_command(
        &mut self,
        _handle: &mut (),
        _cmd: u32,
        _payload: &[u8],
    ) -> Result<Option<JsonValue>, SessionError> {
        Err(SessionError::Unavailable)
    }
}

/// Holds at most one open session, keyed by device fingerprint.
///
/// A different fingerprint or an invalid handle replaces the session wholesale.
/// All access goes through `&mut self`, so requests to the device are strictly
/// ordered.
pub struct SessionManager<C: SessionCapability> {
    capability: C,
    active: Option<(DeviceFingerprint, C::Handle)>,
    sessions_opened: u64,
}

impl<C: SessionCapability> SessionManager<C> {
    pub fn new(capability: C) -> Self {
        Self {
            capability,
            active: None,
            sessions_opened: 0,
        }
    }

    pub fn active_fingerprint(&self) -> Option<&DeviceFingerprint> {
        self.active.as_ref().map(|(fingerprint, _)| fingerprint)
    }

    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened
    }

    pub fn capability(&self) -> &C {
        &self.capability
    }

    pub fn invalidate(&mut self) {
        if let Some((fingerprint, _)) = self.active.take() {
            tracing::debug!(device = %fingerprint, "Session invalidated");
        }
    }

    fn ensure(&mut self, fingerprint: &DeviceFingerprint) -> Result<(), SessionError> {
        if let Some((current, handle)) = &self.active {
            if current == fingerprint && self.capability.is_valid(handle) {
                return Ok(());
            }
        }
        self.invalidate();
        tracing::info!(device = %fingerprint, "Opening vendor session");
        let handle = self.capability.open(fingerprint)?;
        self.active = Some((fingerprint.clone(), handle));
        self.sessions_opened += 1;
        Ok(())
    }

    /// Sends one command through the session for `fingerprint`, opening it first if needed.
    pub fn send(
        &mut self,
        fingerprint: &DeviceFingerprint,
        cmd: u32,
        payload: &[u8],
    ) -> Result<Option<JsonValue>, SessionError> {
        self.ensure(fingerprint)?;
        match self.active.as_mut() {
            Some((_, handle)) => self.capability.send_command(handle, cmd, payload),
            None => Err(SessionError::Open(format!("no session for {fingerprint}"))),
        }
    }
}

/// Session half of the transport: one attempt per call, retries live in the messenger.
pub struct SessionTransport<C: SessionCapability> {
    manager: SessionManager<C>,
}

impl<C: SessionCapability> SessionTransport<C> {
    pub fn new(capability: C) -> Self {
        Self {
            manager: SessionManager::new(capability),
        }
    }

    pub fn manager(&self) -> &SessionManager<C> {
        &self.manager
    }

    pub fn attempt(&mut self, fingerprint: &DeviceFingerprint, cmd: u32, content: &[u8]) -> Attempt {
        if content.trim_ascii().is_empty() {
            return Attempt::Closed;
        }
        match self.manager.send(fingerprint, cmd, content) {
            Ok(Some(reply)) => Attempt::Reply(render_reply(&reply)),
            Ok(None) => Attempt::Silent,
            Err(SessionError::Unavailable) => {
                Attempt::Fault(TransportError::Session(SessionError::Unavailable.to_string()))
            }
            Err(e) => {
                tracing::warn!(device = %fingerprint, error = %e, "Session fault, reinitialising");
                self.manager.invalidate();
                Attempt::RetryableFault(TransportError::Session(e.to_string()))
            }
        }
    }
}

fn render_reply(reply: &JsonValue) -> String {
    match reply {
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}
