//! Outcome of a session teardown.

use serde::Serialize;

use super::{SessionEvent, Shared, state::ShutdownStep};

/// What happened while a session was torn down.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Steps in the order they completed.
    pub steps: Vec<ShutdownStep>,
    /// Requests and PDUs released while flushing.
    pub flushed: usize,
    /// The receive engine overran the stop timeout and was aborted.
    pub receive_aborted: bool,
    /// The transmit engine overran the stop timeout and was aborted.
    pub transmit_aborted: bool,
}

impl ShutdownReport {
    pub(super) fn record(&mut self, shared: &Shared, step: ShutdownStep) {
        log::debug!("shutdown step complete: session_id={}, step={step}", shared.id);
        self.steps.push(step);
        shared.emit(SessionEvent::Shutdown(step));
    }

    /// Whether both engines stopped without being aborted.
    #[must_use]
    pub fn is_clean(&self) -> bool { !(self.receive_aborted || self.transmit_aborted) }
}
