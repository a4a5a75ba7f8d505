//! Kill switch for cooperative flow cancellation.

use crate::core::KillType;
use crate::errors::FlowError;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tracing::warn;

/// Shared kill state for one flow run.
///
/// Requests only escalate: once `All` is requested a later `Current` request
/// is ignored. The first reason is kept.
#[derive(Default)]
pub struct KillSwitch {
    /// Requested kill type, stored as `KillType::as_u8`.
    kill_type: AtomicU8,
    /// The reason of the first request.
    reason: RwLock<Option<String>>,
    /// Set while the controller is inside a sweep that may be interrupted.
    interruptible: AtomicBool,
}

impl KillSwitch {
    /// Creates a switch with no kill requested.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a kill.
    ///
    /// Returns true if the request raised the kill type.
    pub fn request(&self, kind: KillType, reason: impl Into<String>) -> bool {
        let previous = KillType::from_u8(self.kill_type.fetch_max(kind.as_u8(), Ordering::SeqCst));
        if kind <= previous {
            return false;
        }

        let mut current = self.reason.write();
        if current.is_none() {
            *current = Some(reason.into());
        }
        warn!(kill_type = %kind, "Kill requested");
        true
    }

    /// Returns the requested kill type.
    #[must_use]
    pub fn kill_type(&self) -> KillType {
        KillType::from_u8(self.kill_type.load(Ordering::SeqCst))
    }

    /// Returns whether any kill has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.kill_type().is_requested()
    }

    /// Returns the reason of the first request, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Opens an interruptible window that closes when the guard drops.
    #[must_use]
    pub fn interruptible(&self) -> InterruptWindow<'_> {
        self.interruptible.store(true, Ordering::SeqCst);
        InterruptWindow { switch: self }
    }

    /// Returns whether an interruptible window is open.
    #[must_use]
    pub fn is_interruptible(&self) -> bool {
        self.interruptible.load(Ordering::SeqCst)
    }

    /// Fails with [`FlowError::Killed`] when a kill was requested while an
    /// interruptible window is open.
    ///
    /// Outside a window the request is only recorded and acted on at the next
    /// checkpoint.
    pub fn checkpoint(&self) -> Result<(), FlowError> {
        if self.is_requested() && self.is_interruptible() {
            return Err(FlowError::Killed(
                self.reason().unwrap_or_else(|| self.kill_type().to_string()),
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn reset(&self) {
        self.kill_type.store(KillType::None.as_u8(), Ordering::SeqCst);
        self.interruptible.store(false, Ordering::SeqCst);
        *self.reason.write() = None;
    }
}

impl std::fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KillSwitch")
            .field("kill_type", &self.kill_type())
            .field("reason", &self.reason())
            .field("interruptible", &self.is_interruptible())
            .finish()
    }
}

/// Guard for an interruptible window; closes the window on drop.
#[derive(Debug)]
pub struct InterruptWindow<'a> {
    switch: &'a KillSwitch,
}

impl Drop for InterruptWindow<'_> {
    fn drop(&mut self) {
        self.switch.interruptible.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_default_not_requested() {
        let switch = KillSwitch::new();
        assert!(!switch.is_requested());
        assert_eq!(switch.kill_type(), KillType::None);
        assert!(switch.reason().is_none());
    }

    #[test]
    fn test_request_escalates_only() {
        let switch = KillSwitch::new();
        assert!(switch.request(KillType::Current, "SIGTERM"));
        assert!(switch.request(KillType::All, "operator"));
        assert!(!switch.request(KillType::Current, "SIGTERM again"));

        assert_eq!(switch.kill_type(), KillType::All);
        // First reason wins
        assert_eq!(switch.reason(), Some("SIGTERM".to_string()));
    }

    #[test]
    fn test_checkpoint_only_inside_window() {
        let switch = KillSwitch::new();
        switch.request(KillType::Current, "SIGTERM");
        assert!(switch.checkpoint().is_ok());

        {
            let _window = switch.interruptible();
            assert!(matches!(switch.checkpoint(), Err(FlowError::Killed(_))));
        }

        assert!(!switch.is_interruptible());
        assert!(switch.checkpoint().is_ok());
    }

    #[test]
    fn test_window_without_request() {
        let switch = KillSwitch::new();
        let _window = switch.interruptible();
        assert!(switch.checkpoint().is_ok());
    }

    #[test]
    fn test_reset() {
        let switch = KillSwitch::new();
        switch.request(KillType::All, "test");
        switch.reset();
        assert!(!switch.is_requested());
        assert!(switch.reason().is_none());
    }
}
