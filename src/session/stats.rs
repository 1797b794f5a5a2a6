//! Per-session statistics and the process-wide live-session count.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

use super::SessionId;

/// Sessions started and not yet through teardown step 6.
static LIVE_SESSIONS: AtomicU64 = AtomicU64::new(0);

/// Accounts for one session in [`active_session_count`] and the
/// `SESSIONS_ACTIVE` gauge until it is released with the session's
/// resources.
#[derive(Debug)]
pub(crate) struct SessionLease {
    id: SessionId,
}

impl SessionLease {
    pub(crate) fn acquire(id: SessionId) -> Self {
        let live = LIVE_SESSIONS.fetch_add(1, Ordering::Relaxed) + 1;
        crate::metrics::inc_sessions();
        log::debug!("session lease acquired: session_id={id}, live={live}");
        Self { id }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let live = LIVE_SESSIONS.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        crate::metrics::dec_sessions();
        log::debug!("session lease released: session_id={}, live={live}", self.id);
    }
}

/// Sessions currently holding resources in this process.
#[must_use]
pub fn active_session_count() -> u64 { LIVE_SESSIONS.load(Ordering::Relaxed) }

/// Counters updated by the engines without locking.
#[derive(Debug, Default)]
pub struct SessionStats {
    pdus_sent: AtomicU64,
    pdus_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    unmatched: AtomicU64,
    window_rejections: AtomicU64,
    idle_nops: AtomicU64,
    restarts: AtomicU64,
    last_send_ms: AtomicU64,
    last_receive_ms: AtomicU64,
}

/// Serializable copy of [`SessionStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub pdus_sent: u64,
    pub pdus_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub unmatched: u64,
    pub window_rejections: u64,
    pub idle_nops: u64,
    pub restarts: u64,
    /// Milliseconds since the Unix epoch of the last send, if any.
    pub last_send_ms: Option<u64>,
    /// Milliseconds since the Unix epoch of the last receive, if any.
    pub last_receive_ms: Option<u64>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

fn nonzero(value: u64) -> Option<u64> { (value != 0).then_some(value) }

impl SessionStats {
    pub(crate) fn record_sent(&self, bytes: usize) {
        self.pdus_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_send_ms.store(now_ms(), Ordering::Relaxed);
        crate::metrics::inc_pdus(crate::metrics::Direction::Outbound);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.pdus_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_receive_ms.store(now_ms(), Ordering::Relaxed);
        crate::metrics::inc_pdus(crate::metrics::Direction::Inbound);
    }

    pub(crate) fn record_unmatched(&self) { self.unmatched.fetch_add(1, Ordering::Relaxed); }

    pub(crate) fn record_window_rejection(&self) {
        self.window_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_idle_nop(&self) {
        self.idle_nops.fetch_add(1, Ordering::Relaxed);
        crate::metrics::inc_idle_nops();
    }

    pub(crate) fn record_restart(&self) { self.restarts.fetch_add(1, Ordering::Relaxed); }

    /// Copy every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pdus_sent: self.pdus_sent.load(Ordering::Relaxed),
            pdus_received: self.pdus_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            window_rejections: self.window_rejections.load(Ordering::Relaxed),
            idle_nops: self.idle_nops.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            last_send_ms: nonzero(self.last_send_ms.load(Ordering::Relaxed)),
            last_receive_ms: nonzero(self.last_receive_ms.load(Ordering::Relaxed)),
        }
    }
}
