//! State shared by the controller, both engines and session handles.

use std::sync::{
    Mutex,
    MutexGuard,
    PoisonError,
    atomic::{AtomicBool, Ordering},
};

use dashmap::DashMap;
use tokio::sync::{Notify, broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::{SessionEvent, SessionId, SessionState, stats::SessionStats};
use crate::{
    completion::RequestError,
    config::SessionConfig,
    correlation::HeldRequests,
    pdu::{Pdu, PduPool},
    queue::{QueueKind, QueueSet},
    sequence::SequenceTracker,
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) id: SessionId,
    pub(crate) config: SessionConfig,
    tracker: Mutex<SequenceTracker>,
    pub(crate) queues: QueueSet,
    pub(crate) held: HeldRequests,
    pub(crate) pool: PduPool,
    pub(crate) stats: SessionStats,
    /// Wakes the transmit engine when work arrives or the window opens.
    pub(crate) wake: Notify,
    pub(crate) pings: DashMap<u32, oneshot::Sender<Pdu>>,
    full_feature: AtomicBool,
    draining_after_loss: AtomicBool,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    link_error: Mutex<Option<String>>,
    /// Cancelled once the session is stopped.
    pub(crate) closed: CancellationToken,
}

impl Shared {
    pub(crate) fn new(id: SessionId, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id,
            tracker: Mutex::new(SequenceTracker::new(config.initial_cmd_sn)),
            pool: PduPool::new(config.pool_capacity),
            config,
            queues: QueueSet::default(),
            held: HeldRequests::default(),
            stats: SessionStats::default(),
            wake: Notify::new(),
            pings: DashMap::new(),
            full_feature: AtomicBool::new(false),
            draining_after_loss: AtomicBool::new(false),
            state,
            events,
            link_error: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    pub(crate) fn tracker(&self) -> MutexGuard<'_, SequenceTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last connection failure reported by an engine.
    pub(crate) fn link_error(&self) -> MutexGuard<'_, Option<String>> {
        self.link_error.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_full_feature(&self) -> bool { self.full_feature.load(Ordering::Acquire) }

    pub(crate) fn set_full_feature(&self, on: bool) {
        self.full_feature.store(on, Ordering::Release);
        if on {
            self.wake.notify_one();
        }
    }

    pub(crate) fn state(&self) -> SessionState { *self.state.borrow() }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<SessionState> { self.state.subscribe() }

    pub(crate) fn set_state(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            log::info!("session state changed: session_id={}, state={next}", self.id);
            self.emit(SessionEvent::StateChanged(next));
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> { self.events.subscribe() }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    pub(crate) fn mark_link_lost(&self, lost: bool) {
        self.draining_after_loss.store(lost, Ordering::Release);
    }

    /// Error used when flushing outstanding requests.
    pub(crate) fn flush_error(&self) -> RequestError {
        if self.draining_after_loss.load(Ordering::Acquire) {
            RequestError::ConnectionLost
        } else {
            RequestError::SessionClosed
        }
    }

    /// Place a new outbound PDU on its send queue.
    pub(crate) fn enqueue(&self, pdu: Pdu) {
        self.queues.get(QueueSet::route(&pdu)).push_back(pdu);
        self.wake.notify_one();
    }

    /// Put PDUs back at the head of their send queues, keeping their order.
    pub(crate) fn requeue_front(&self, pdus: Vec<Pdu>) {
        let mut immediate = Vec::new();
        let mut write_data = Vec::new();
        let mut command = Vec::new();
        for pdu in pdus {
            match QueueSet::route(&pdu) {
                QueueKind::Immediate => immediate.push(pdu),
                QueueKind::WriteData => write_data.push(pdu),
                QueueKind::Command | QueueKind::Response => command.push(pdu),
            }
        }
        self.queues.immediate.push_front_all(immediate);
        self.queues.write_data.push_front_all(write_data);
        self.queues.command.push_front_all(command);
        self.wake.notify_one();
    }

    /// Fail every queued and held request with `err`, returning how many
    /// PDUs were released.
    pub(crate) fn flush(&self, err: &RequestError) -> usize {
        let mut released = self.queues.drain_all();
        released.extend(self.held.drain());
        let count = released.len();
        for pdu in released {
            pdu.fail(err.clone());
        }
        self.pings.clear();
        count
    }
}
