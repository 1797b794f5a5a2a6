//! Ordered PDU queues shared by the session engines.
//!
//! Each [`PduQueue`] owns its PDUs behind its own mutex, held only for the
//! duration of a push or pop. Waiting is built in: [`PduQueue::pop_wait`]
//! parks on a [`Notify`] until an item arrives, so producers never toggle
//! "non-empty" flags by hand. FIFO order holds within a queue; priority
//! across the send queues is decided by the transmit engine.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::Notify;

use crate::pdu::{Location, Pdu, PduId};

/// Identity of a session queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Immediate PDUs (I bit set, NOP-Out replies, login).
    Immediate,
    /// Data-Out continuation PDUs generated from R2T.
    WriteData,
    /// Non-immediate commands gated by the command window.
    Command,
    /// Login, Text and Logout responses awaiting the control consumer.
    Response,
}

/// FIFO of PDUs with built-in waiting.
#[derive(Debug)]
pub struct PduQueue {
    kind: QueueKind,
    items: Mutex<VecDeque<Pdu>>,
    ready: Notify,
}

impl PduQueue {
    #[must_use]
    pub fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            items: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> QueueKind { self.kind }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Pdu>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append at the tail.
    pub fn push_back(&self, mut pdu: Pdu) {
        pdu.set_location(Location::Queued(self.kind));
        self.lock().push_back(pdu);
        self.ready.notify_one();
    }

    /// Insert at the head, ahead of everything already queued.
    pub fn push_front(&self, mut pdu: Pdu) {
        pdu.set_location(Location::Queued(self.kind));
        self.lock().push_front(pdu);
        self.ready.notify_one();
    }

    /// Insert `pdus` at the head, preserving their relative order.
    pub fn push_front_all(&self, pdus: Vec<Pdu>) {
        if pdus.is_empty() {
            return;
        }
        let mut items = self.lock();
        for mut pdu in pdus.into_iter().rev() {
            pdu.set_location(Location::Queued(self.kind));
            items.push_front(pdu);
        }
        drop(items);
        self.ready.notify_one();
    }

    /// Remove the head, if any.
    pub fn pop(&self) -> Option<Pdu> {
        let mut pdu = self.lock().pop_front()?;
        pdu.set_location(Location::Detached);
        Some(pdu)
    }

    /// Remove the head only if `admit` accepts it.
    pub fn pop_if(&self, admit: impl FnOnce(&Pdu) -> bool) -> Option<Pdu> {
        let mut items = self.lock();
        if !items.front().is_some_and(admit) {
            return None;
        }
        let mut pdu = items.pop_front()?;
        drop(items);
        pdu.set_location(Location::Detached);
        Some(pdu)
    }

    /// Wait until the queue yields a PDU.
    pub async fn pop_wait(&self) -> Pdu {
        loop {
            let notified = self.ready.notified();
            if let Some(pdu) = self.pop() {
                return pdu;
            }
            notified.await;
        }
    }

    /// Remove and return every queued PDU.
    pub fn drain(&self) -> Vec<Pdu> {
        let drained: Vec<Pdu> = self.lock().drain(..).collect();
        drained
            .into_iter()
            .map(|mut pdu| {
                pdu.set_location(Location::Detached);
                pdu
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize { self.lock().len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.lock().is_empty() }

    fn census_into(&self, out: &mut Vec<(PduId, Location)>) {
        out.extend(self.lock().iter().map(|pdu| (pdu.id(), pdu.location())));
    }
}

/// The four session queues.
#[derive(Debug)]
pub struct QueueSet {
    pub immediate: PduQueue,
    pub write_data: PduQueue,
    pub command: PduQueue,
    pub response: PduQueue,
}

impl Default for QueueSet {
    fn default() -> Self {
        Self {
            immediate: PduQueue::new(QueueKind::Immediate),
            write_data: PduQueue::new(QueueKind::WriteData),
            command: PduQueue::new(QueueKind::Command),
            response: PduQueue::new(QueueKind::Response),
        }
    }
}

impl QueueSet {
    /// Look up a queue by identity.
    #[must_use]
    pub fn get(&self, kind: QueueKind) -> &PduQueue {
        match kind {
            QueueKind::Immediate => &self.immediate,
            QueueKind::WriteData => &self.write_data,
            QueueKind::Command => &self.command,
            QueueKind::Response => &self.response,
        }
    }

    /// Send queue an outbound PDU belongs on.
    #[must_use]
    pub fn route(pdu: &Pdu) -> QueueKind {
        match pdu.opcode() {
            Ok(crate::pdu::Opcode::DataOut) => QueueKind::WriteData,
            _ if pdu.header().is_immediate() => QueueKind::Immediate,
            _ => QueueKind::Command,
        }
    }

    /// Whether any send queue holds work.
    #[must_use]
    pub fn has_outbound(&self) -> bool {
        !(self.immediate.is_empty() && self.write_data.is_empty() && self.command.is_empty())
    }

    /// Drain every queue, send queues first.
    pub fn drain_all(&self) -> Vec<Pdu> {
        let mut all = self.immediate.drain();
        all.extend(self.write_data.drain());
        all.extend(self.command.drain());
        all.extend(self.response.drain());
        all
    }

    /// List every queued PDU with its location tag.
    #[must_use]
    pub fn census(&self) -> Vec<(PduId, Location)> {
        let mut out = Vec::new();
        for queue in [&self.immediate, &self.write_data, &self.command, &self.response] {
            queue.census_into(&mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, time::Duration};

    use proptest::prelude::*;

    use super::*;
    use crate::pdu::{Bhs, Opcode};

    fn pdu(op: Opcode) -> Pdu { Pdu::new(Bhs::new(op)) }

    #[test]
    fn fifo_with_front_insertion() {
        let queue = PduQueue::new(QueueKind::Command);
        let a = pdu(Opcode::ScsiCommand);
        let b = pdu(Opcode::ScsiCommand);
        let c = pdu(Opcode::ScsiCommand);
        let (ida, idb, idc) = (a.id(), b.id(), c.id());
        queue.push_back(a);
        queue.push_back(b);
        queue.push_front(c);
        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|p| p.id()).collect();
        assert_eq!(order, vec![idc, ida, idb]);
    }

    #[test]
    fn push_front_all_keeps_relative_order() {
        let queue = PduQueue::new(QueueKind::Command);
        let tail = pdu(Opcode::ScsiCommand);
        let tail_id = tail.id();
        queue.push_back(tail);
        let batch: Vec<Pdu> = (0..3).map(|_| pdu(Opcode::ScsiCommand)).collect();
        let mut expected: Vec<_> = batch.iter().map(Pdu::id).collect();
        expected.push(tail_id);
        queue.push_front_all(batch);
        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|p| p.id()).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn location_tracks_membership() {
        let queue = PduQueue::new(QueueKind::Immediate);
        queue.push_back(pdu(Opcode::NopOut));
        let mut census = Vec::new();
        queue.census_into(&mut census);
        assert_eq!(census[0].1, Location::Queued(QueueKind::Immediate));
        let popped = queue.pop().expect("queued");
        assert_eq!(popped.location(), Location::Detached);
    }

    #[test]
    fn routes_by_opcode_and_immediate_flag() {
        let mut login = Bhs::new(Opcode::Login);
        login.set_immediate(true);
        assert_eq!(QueueSet::route(&Pdu::new(login)), QueueKind::Immediate);
        assert_eq!(QueueSet::route(&pdu(Opcode::DataOut)), QueueKind::WriteData);
        assert_eq!(QueueSet::route(&pdu(Opcode::ScsiCommand)), QueueKind::Command);
    }

    #[tokio::test]
    async fn pop_wait_wakes_on_push() {
        let queue = Arc::new(PduQueue::new(QueueKind::Response));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop_wait().await.id() })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let item = pdu(Opcode::LoginResponse);
        let id = item.id();
        queue.push_back(item);
        assert_eq!(waiter.await.expect("join"), id);
    }

    #[derive(Clone, Debug)]
    enum Step {
        Push(usize),
        PushFront(usize),
        Move(usize, usize),
        Pop(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0usize..4).prop_map(Step::Push),
            (0usize..4).prop_map(Step::PushFront),
            (0usize..4, 0usize..4).prop_map(|(a, b)| Step::Move(a, b)),
            (0usize..4).prop_map(Step::Pop),
        ]
    }

    const KINDS: [QueueKind; 4] = [
        QueueKind::Immediate,
        QueueKind::WriteData,
        QueueKind::Command,
        QueueKind::Response,
    ];

    proptest! {
        #[test]
        fn no_pdu_is_ever_in_two_queues(
            scripts in proptest::collection::vec(proptest::collection::vec(step(), 1..40), 2..5)
        ) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .build()
                .expect("runtime");
            rt.block_on(async move {
                let set = Arc::new(QueueSet::default());
                let mut tasks = Vec::new();
                for script in scripts {
                    let set = Arc::clone(&set);
                    tasks.push(tokio::spawn(async move {
                        let mut created = 0usize;
                        let mut completed = 0usize;
                        for step in script {
                            match step {
                                Step::Push(q) => {
                                    set.get(KINDS[q]).push_back(pdu(Opcode::ScsiCommand));
                                    created += 1;
                                }
                                Step::PushFront(q) => {
                                    set.get(KINDS[q]).push_front(pdu(Opcode::ScsiCommand));
                                    created += 1;
                                }
                                Step::Move(from, to) => {
                                    if let Some(p) = set.get(KINDS[from]).pop() {
                                        set.get(KINDS[to]).push_back(p);
                                    }
                                }
                                Step::Pop(q) => {
                                    if set.get(KINDS[q]).pop().is_some() {
                                        completed += 1;
                                    }
                                }
                            }
                            let census = set.census();
                            let unique: HashSet<_> = census.iter().map(|(id, _)| *id).collect();
                            assert_eq!(unique.len(), census.len(), "pdu linked twice");
                            tokio::task::yield_now().await;
                        }
                        (created, completed)
                    }));
                }
                let mut created = 0;
                let mut completed = 0;
                for task in tasks {
                    let (c, d) = task.await.expect("task");
                    created += c;
                    completed += d;
                }
                let census = set.census();
                assert_eq!(census.len(), created - completed);
                for (_, location) in census {
                    assert!(matches!(location, Location::Queued(_)));
                }
            });
        }
    }
}
