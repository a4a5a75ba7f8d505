//! Cooperative cancellation of a running flow.
//!
//! This module provides:
//! - KillSwitch, the shared kill request polled by the controller
//! - InterruptWindow, the guard bracketing an interruptible sweep
//! - A SIGTERM listener feeding the switch

mod kill;
mod signals;

pub use kill::{InterruptWindow, KillSwitch};
pub use signals::spawn_sigterm_listener;
