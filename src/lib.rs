#![doc(html_root_url = "https://docs.rs/iscsi-initiator/latest")]
//! Session engine for an iSCSI initiator.
//!
//! The crate multiplexes SCSI requests from many callers onto one TCP
//! connection to an iSCSI target. It owns PDU framing, command-window
//! accounting, request/response correlation, R2T-driven write data, idle
//! probing and an ordered connection lifecycle. Login negotiation, SCSI
//! command construction and the checksum algorithms themselves are left to
//! the caller.
//!
//! Start with [`SessionBuilder`] and a [`Transport`].

pub mod backoff;
pub mod byte_order;
pub mod completion;
pub mod config;
pub mod correlation;
pub mod digest;
pub mod error;
pub mod metrics;
pub mod pdu;
pub mod queue;
mod receive;
pub mod sequence;
pub mod session;
mod transmit;
pub mod transport;

pub use backoff::BackoffConfig;
pub use completion::{Completion, RequestError, RequestHandle, RequestResult};
pub use config::{CmdSnPolicy, SessionConfig};
pub use digest::Digests;
pub use error::{ConfigError, ErrorClass, FramingError, SessionError, TransportError};
pub use metrics::{Direction, ERRORS_TOTAL, IDLE_NOPS_TOTAL, PDUS_TOTAL, SESSIONS_ACTIVE};
pub use pdu::{Bhs, Opcode, Pdu};
pub use session::{
    Session,
    SessionBuilder,
    SessionEvent,
    SessionId,
    SessionRegistry,
    SessionState,
    ShutdownReport,
    ShutdownStep,
    StatsSnapshot,
};
pub use transport::{Connector, StreamTransport, TcpConnector, TcpTransport, Transport};
