//! Error taxonomy for the session engine.
//!
//! - [`FramingError`]: malformed or over-limit PDUs. Fatal to the current
//!   connection, never to the session.
//! - [`TransportError`]: byte-stream failures, classified by [`ErrorClass`]
//!   into ephemeral, broken-pipe and hard failures.
//! - [`SessionError`]: failures of the public session API.
//! - [`ConfigError`]: rejected configuration values.
//!
//! Per-request failures are reported through
//! [`RequestError`](crate::completion::RequestError); protocol
//! inconsistencies such as a regressive window are recovered locally and
//! never surface here.

use std::io;

use thiserror::Error;

/// Wire-level problems found while framing a PDU.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// Advertised data segment exceeds the negotiated receive limit.
    #[error("data segment exceeds max length: {size} > {max}")]
    OversizedSegment {
        /// Advertised DataSegmentLength.
        size: usize,
        /// Negotiated MaxRecvDataSegmentLength.
        max: usize,
    },
    /// Outbound data segment does not fit the 24-bit length field.
    #[error("data segment of {size} bytes cannot be encoded")]
    SegmentTooLarge {
        /// Length of the rejected data segment.
        size: usize,
    },
    /// Additional header segment longer than 255 words.
    #[error("additional header segment of {size} bytes cannot be encoded")]
    AhsTooLong {
        /// Length of the rejected AHS.
        size: usize,
    },
    /// Header digest did not match.
    #[error("header digest mismatch: expected {expected:#x}, got {actual:#x}")]
    HeaderDigest {
        /// Digest computed locally.
        expected: u32,
        /// Digest received on the wire.
        actual: u32,
    },
    /// Data digest did not match.
    #[error("data digest mismatch: expected {expected:#x}, got {actual:#x}")]
    DataDigest {
        /// Digest computed locally.
        expected: u32,
        /// Digest received on the wire.
        actual: u32,
    },
    /// Body shorter than the layout computed from the header.
    #[error("truncated pdu: have {have}, need {need}")]
    Truncated {
        /// Bytes available.
        have: usize,
        /// Bytes the layout requires.
        need: usize,
    },
}

/// How the engine reacts to a transport failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Try again on the same connection.
    Ephemeral,
    /// The peer is gone; requeue and take the link down.
    BrokenPipe,
    /// The socket is unusable; take the link down and fail tracked sends.
    Hard,
}

/// Failure reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the stream before any byte of the read arrived.
    #[error("connection closed by peer")]
    Closed,
    /// The stream ended part-way through an all-or-nothing read.
    #[error("short read: {received} of {expected} bytes")]
    Partial {
        /// Bytes read before the stream ended.
        received: usize,
        /// Bytes requested.
        expected: usize,
    },
    /// The transport has already been shut down or released.
    #[error("transport released")]
    Released,
    /// A write failed after part of the frame reached the stream. The
    /// target's framing is lost, so the link cannot be reused.
    #[error("write failed after {written} bytes: {source}")]
    Torn {
        /// Bytes of the frame already written.
        written: usize,
        /// The failure that interrupted the write.
        #[source]
        source: io::Error,
    },
    /// Underlying I/O failure.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Classify the failure for the transmit engine's recovery table.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::io;
    ///
    /// use iscsi_initiator::error::{ErrorClass, TransportError};
    ///
    /// let err = TransportError::from(io::Error::from(io::ErrorKind::BrokenPipe));
    /// assert_eq!(err.class(), ErrorClass::BrokenPipe);
    /// ```
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Closed | Self::Partial { .. } | Self::Torn { .. } => ErrorClass::BrokenPipe,
            Self::Released => ErrorClass::Hard,
            Self::Io(err) => match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut => {
                    ErrorClass::Ephemeral
                }
                io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::UnexpectedEof => ErrorClass::BrokenPipe,
                _ => ErrorClass::Hard,
            },
        }
    }
}

/// Configuration values rejected by [`SessionConfig::validated`](crate::config::SessionConfig::validated).
#[non_exhaustive]
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A data-segment limit was zero or above the 24-bit maximum.
    #[error("invalid {field}: {value}; must be between 512 and {max}", max = crate::byte_order::MAX_U24)]
    InvalidSegmentLength {
        /// Name of the offending field.
        field: &'static str,
        /// Rejected value.
        value: u32,
    },
    /// `max_burst_length` was zero.
    #[error("max_burst_length must be >= 1")]
    InvalidBurstLength,
    /// `pool_capacity` was too small to run both engines.
    #[error("pool capacity {0} too small; must be >= 2")]
    InvalidPoolCapacity(usize),
    /// The idle interval or stop timeout was zero.
    #[error("{0} must be non-zero")]
    ZeroDuration(&'static str),
}

/// Failures of the public [`Session`](crate::session::Session) API.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session has stopped and accepts no further work.
    #[error("session stopped")]
    Stopped,
    /// The operation is not valid in the current lifecycle state.
    #[error("operation invalid in state {0}")]
    InvalidState(crate::session::SessionState),
    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Transport failure while connecting or reconnecting.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A PDU could not be framed.
    #[error(transparent)]
    Framing(#[from] FramingError),
    /// No NOP-In reply arrived in time.
    #[error("ping timed out")]
    PingTimeout,
    /// The connection failed before the awaited reply arrived.
    #[error("connection lost")]
    ConnectionLost,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(io::ErrorKind::WouldBlock, ErrorClass::Ephemeral)]
    #[case(io::ErrorKind::Interrupted, ErrorClass::Ephemeral)]
    #[case(io::ErrorKind::BrokenPipe, ErrorClass::BrokenPipe)]
    #[case(io::ErrorKind::ConnectionReset, ErrorClass::BrokenPipe)]
    #[case(io::ErrorKind::PermissionDenied, ErrorClass::Hard)]
    fn io_errors_are_classified(#[case] kind: io::ErrorKind, #[case] expected: ErrorClass) {
        assert_eq!(TransportError::from(io::Error::from(kind)).class(), expected);
    }

    #[test]
    fn short_reads_count_as_broken_pipe() {
        let err = TransportError::Partial {
            received: 3,
            expected: 48,
        };
        assert_eq!(err.class(), ErrorClass::BrokenPipe);
        assert_eq!(err.to_string(), "short read: 3 of 48 bytes");
    }
}
