//! Utilities for driving an
//! [`iscsi_initiator::Session`] against a scripted in-memory target.
//!
//! ```rust,no_run
//! use iscsi_initiator::Session;
//! use iscsi_testing::{pair, pdus};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (transport, target) = pair();
//! let session = Session::builder().start(transport)?;
//! session.send_control(pdus::login_request())?;
//! let login = target.next_sent().await;
//! # let _ = login;
//! # Ok(())
//! # }
//! ```

pub mod logging;
pub mod macros;
pub mod pdus;
pub mod target;

pub use logging::{LoggerHandle, logger};
pub use target::{ScriptedConnector, ScriptedTransport, TargetHandle, TransportCall, pair};

/// Result type for fallible tests.
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;
