//! Link lifecycle state shared by senders and receivers.
//!
//! ```text
//! ┌─────────────┐  first op   ┌─────────┐  attached  ┌────────┐
//! │Uninitialized├────────────►│ Opening ├───────────►│ Active │
//! └─────────────┘             └──┬───▲──┘            └───┬────┘
//!                     open failed│   │ transient loss    │
//!                                ▼   └───────────────────┤
//!                           ┌─────────┐  fatal loss      │
//!                           │ Errored │◄─────────────────┘
//!                           └─────────┘
//!        close(): any state ──► Closing ──► Closed
//! ```

use std::time::SystemTime;

/// Lifecycle state of a managed link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No underlying link was requested yet.
    Uninitialized,
    /// An underlying link is being created.
    Opening,
    /// The underlying link is attached.
    Active,
    /// The manager is shutting down.
    Closing,
    /// The manager is shut down; every call fails.
    Closed,
    /// The last link failed with a non-transient error. The next operation
    /// that needs the link tries to open a new one.
    Errored,
}

impl LinkState {
    /// Whether new operations are refused.
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Closing | LinkState::Closed)
    }
}

/// Snapshot published by a receiver for caller-side fast checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    /// Current lifecycle state.
    pub state: LinkState,
    /// Session bound to the link, once attached.
    pub session_id: Option<String>,
    /// When the session lock expires.
    pub session_locked_until: Option<SystemTime>,
    /// The session lock is gone; the link can never be used again.
    pub session_lock_lost: bool,
}

impl LinkStatus {
    pub(crate) fn new() -> Self {
        Self {
            state: LinkState::Uninitialized,
            session_id: None,
            session_locked_until: None,
            session_lock_lost: false,
        }
    }

    /// Whether operations may still be attempted.
    pub fn is_usable(&self) -> bool {
        !self.session_lock_lost && !self.state.is_terminal()
    }
}
