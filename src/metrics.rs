//! Metric helpers for the initiator.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. With the `metrics` feature
//! disabled every helper compiles to a no-op.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking live sessions.
pub const SESSIONS_ACTIVE: &str = "iscsi_sessions_active";
/// Name of the counter tracking PDUs moved over the wire.
pub const PDUS_TOTAL: &str = "iscsi_pdus_total";
/// Name of the counter tracking connection-level errors.
pub const ERRORS_TOTAL: &str = "iscsi_errors_total";
/// Name of the counter tracking NOP-Outs sent on an idle link.
pub const IDLE_NOPS_TOTAL: &str = "iscsi_idle_nops_total";

/// Direction of PDU flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// PDUs received from the target.
    Inbound,
    /// PDUs sent to the target.
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), expect(dead_code, reason = "labels are only emitted with metrics"))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the live sessions gauge.
pub fn inc_sessions() {
    #[cfg(feature = "metrics")]
    gauge!(SESSIONS_ACTIVE).increment(1.0);
}

/// Decrement the live sessions gauge.
pub fn dec_sessions() {
    #[cfg(feature = "metrics")]
    gauge!(SESSIONS_ACTIVE).decrement(1.0);
}

/// Record a PDU for the given direction.
pub fn inc_pdus(direction: Direction) {
    #[cfg(feature = "metrics")]
    counter!(PDUS_TOTAL, "direction" => direction.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = direction;
}

/// Record a connection-level error.
pub fn inc_errors() {
    #[cfg(feature = "metrics")]
    counter!(ERRORS_TOTAL).increment(1);
}

/// Record an idle NOP-Out.
pub fn inc_idle_nops() {
    #[cfg(feature = "metrics")]
    counter!(IDLE_NOPS_TOTAL).increment(1);
}
