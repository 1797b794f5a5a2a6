//! Assertion macros shared by integration tests.

/// Await the next PDU written by the initiator, panicking with the call
/// site if none arrives within a second.
#[macro_export]
macro_rules! sent_expect {
    ($target:expr) => {{
        $target
            .next_sent_within(::std::time::Duration::from_secs(1))
            .await
            .expect(concat!("no pdu sent at ", file!(), ":", line!()))
    }};
    ($target:expr, $msg:expr) => {{
        let m = ::std::format!("{msg} at {}:{}", file!(), line!(), msg = $msg);
        $target
            .next_sent_within(::std::time::Duration::from_secs(1))
            .await
            .expect(&m)
    }};
}

/// Await a request handle with a one-second bound and panic on timeout.
#[macro_export]
macro_rules! complete_expect {
    ($handle:expr) => {{
        ::tokio::time::timeout(::std::time::Duration::from_secs(1), $handle)
            .await
            .expect(concat!("request did not complete at ", file!(), ":", line!()))
    }};
}

pub use crate::{complete_expect, sent_expect};
