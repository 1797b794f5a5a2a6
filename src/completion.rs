//! Completion handles connecting submitted requests to their responses.
//!
//! A tracked PDU carries the sending half ([`Completer`]); the submitter
//! keeps the receiving half ([`RequestHandle`]). The engine never inspects
//! the consumer's state behind the handle; it only resolves it.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::pdu::Pdu;

/// Successful completion of a tracked request.
#[derive(Debug)]
pub struct Completion {
    /// PDU that completed the request (SCSI Response, final Data-In, or
    /// Task Management Response).
    pub response: Pdu,
    /// Data-In payload accumulated for the request, in arrival order.
    pub data: Bytes,
}

/// Reasons a tracked request can fail.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// The session was shut down deliberately.
    #[error("session closed")]
    SessionClosed,
    /// The connection was lost and could not be re-established.
    #[error("connection lost")]
    ConnectionLost,
    /// A hard transport error occurred while sending; the caller decides
    /// whether to resubmit.
    #[error("transport failed while sending; retry required")]
    RetryRequired,
    /// The target rejected the PDU.
    #[error("rejected by target: reason {reason:#04x}")]
    Rejected {
        /// Reject reason code from byte 2 of the Reject PDU.
        reason: u8,
    },
    /// The target aborted the task through an asynchronous message.
    #[error("aborted by target: async event {event}")]
    Aborted {
        /// AsyncEvent code.
        event: u8,
    },
}

impl RequestError {
    /// Whether resubmitting the request on a healthy session may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool { matches!(self, Self::ConnectionLost | Self::RetryRequired) }
}

/// Result delivered through a [`RequestHandle`].
pub type RequestResult = Result<Completion, RequestError>;

/// Sending half of a completion, owned by the tracked PDU.
#[derive(Debug)]
pub struct Completer(oneshot::Sender<RequestResult>);

impl Completer {
    /// Create a linked completer/handle pair.
    #[must_use]
    pub fn pair() -> (Self, RequestHandle) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), RequestHandle { rx })
    }

    /// Resolve the request; a dropped handle is ignored.
    pub fn complete(self, result: RequestResult) {
        if self.0.send(result).is_err() {
            tracing::debug!("request handle dropped before completion");
        }
    }
}

/// Future resolving once the engine completes or fails the request.
#[derive(Debug)]
#[must_use = "dropping the handle discards the request outcome"]
pub struct RequestHandle {
    rx: oneshot::Receiver<RequestResult>,
}

impl Future for RequestHandle {
    type Output = RequestResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A completer dropped without resolving only happens when the
        // session is torn down around it.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(RequestError::SessionClosed)))
    }
}
