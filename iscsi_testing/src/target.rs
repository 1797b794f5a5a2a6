//! A scripted in-memory iSCSI target.
//!
//! [`pair`] returns a [`ScriptedTransport`] to hand to the session and a
//! [`TargetHandle`] the test drives: it feeds inbound PDUs, inspects what
//! the initiator sent, and injects failures.

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use iscsi_initiator::{
    digest::Digests,
    error::TransportError,
    pdu::{Pdu, codec},
    transport::{Connector, Transport},
};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};

/// Largest data segment the handle will decode from sent frames.
const DECODE_LIMIT: usize = 0x00ff_ffff;

/// One call the session made on the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCall {
    /// `send` with the total number of bytes offered.
    Send(usize),
    ShutdownRead,
    Close,
}

enum SendFault {
    Fail(io::ErrorKind),
    Tear { written: usize, kind: io::ErrorKind },
}

enum Inbound {
    Data(Bytes),
    Error(io::ErrorKind),
    Eof,
}

struct Reader {
    rx: mpsc::UnboundedReceiver<Inbound>,
    buf: BytesMut,
    eof: bool,
}

struct State {
    reader: AsyncMutex<Reader>,
    calls: Mutex<Vec<TransportCall>>,
    send_faults: Mutex<VecDeque<SendFault>>,
    stalled: watch::Sender<bool>,
    sent_tx: mpsc::UnboundedSender<Bytes>,
    read_shut: watch::Sender<bool>,
    closed: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> { mutex.lock().unwrap_or_else(PoisonError::into_inner) }

impl State {
    fn record(&self, call: TransportCall) { lock(&self.calls).push(call); }
}

/// Transport half handed to the session under test.
#[derive(Clone)]
pub struct ScriptedTransport {
    state: Arc<State>,
}

/// Test half of a scripted connection.
pub struct TargetHandle {
    state: Arc<State>,
    inbound: mpsc::UnboundedSender<Inbound>,
    sent: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
    digests: Digests,
}

/// Create a connected transport and target handle.
#[must_use]
pub fn pair() -> (ScriptedTransport, TargetHandle) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let state = Arc::new(State {
        reader: AsyncMutex::new(Reader {
            rx: inbound_rx,
            buf: BytesMut::new(),
            eof: false,
        }),
        calls: Mutex::new(Vec::new()),
        send_faults: Mutex::new(VecDeque::new()),
        stalled: watch::Sender::new(false),
        sent_tx,
        read_shut: watch::Sender::new(false),
        closed: watch::Sender::new(false),
    });
    let transport = ScriptedTransport {
        state: Arc::clone(&state),
    };
    let handle = TargetHandle {
        state,
        inbound: inbound_tx,
        sent: AsyncMutex::new(sent_rx),
        digests: Digests::none(),
    };
    (transport, handle)
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, segments: &[Bytes]) -> Result<(), TransportError> {
        let len = segments.iter().map(Bytes::len).sum();
        self.state.record(TransportCall::Send(len));
        if *self.state.closed.borrow() {
            return Err(TransportError::Released);
        }
        match lock(&self.state.send_faults).pop_front() {
            Some(SendFault::Fail(kind)) => return Err(io::Error::from(kind).into()),
            Some(SendFault::Tear { written, kind }) => {
                return Err(TransportError::Torn {
                    written: written.min(len),
                    source: io::Error::from(kind),
                });
            }
            None => {}
        }
        let mut stalled = self.state.stalled.subscribe();
        // Sender is owned by `state`, which outlives this borrow.
        let _ = stalled.wait_for(|stalled| !*stalled).await;

        let mut frame = BytesMut::with_capacity(len);
        for segment in segments {
            frame.extend_from_slice(segment);
        }
        let _ = self.state.sent_tx.send(frame.freeze());
        Ok(())
    }

    async fn recv_exact(&self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut read_shut = self.state.read_shut.subscribe();
        let mut reader = self.state.reader.lock().await;
        loop {
            if reader.buf.len() >= buf.len() {
                buf.copy_from_slice(&reader.buf[..buf.len()]);
                reader.buf.advance(buf.len());
                return Ok(());
            }
            if reader.eof || *read_shut.borrow() {
                return Err(short_read(reader.buf.len(), buf.len()));
            }
            let next = tokio::select! {
                next = reader.rx.recv() => next,
                _ = read_shut.changed() => continue,
            };
            match next {
                Some(Inbound::Data(bytes)) => reader.buf.extend_from_slice(&bytes),
                Some(Inbound::Error(kind)) => return Err(io::Error::from(kind).into()),
                Some(Inbound::Eof) | None => reader.eof = true,
            }
        }
    }

    async fn shutdown_read(&self) -> Result<(), TransportError> {
        self.state.record(TransportCall::ShutdownRead);
        self.state.read_shut.send_replace(true);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.record(TransportCall::Close);
        self.state.read_shut.send_replace(true);
        self.state.closed.send_replace(true);
        Ok(())
    }
}

fn short_read(received: usize, expected: usize) -> TransportError {
    if received == 0 {
        TransportError::Closed
    } else {
        TransportError::Partial { received, expected }
    }
}

impl TargetHandle {
    /// Decode sent frames with `digests` instead of none.
    #[must_use]
    pub fn with_digests(mut self, digests: Digests) -> Self {
        self.digests = digests;
        self
    }

    /// Deliver `pdu` to the initiator.
    pub fn push(&self, pdu: &Pdu) { self.push_raw(codec::encode(pdu, &self.digests).to_bytes()); }

    /// Deliver raw bytes to the initiator.
    pub fn push_raw(&self, bytes: Bytes) { let _ = self.inbound.send(Inbound::Data(bytes)); }

    /// Make the next read fail with `kind`.
    pub fn fail_recv(&self, kind: io::ErrorKind) { let _ = self.inbound.send(Inbound::Error(kind)); }

    /// End the inbound stream as if the target closed the connection.
    pub fn hang_up(&self) { let _ = self.inbound.send(Inbound::Eof); }

    /// Make the next send fail with `kind`.
    pub fn fail_next_send(&self, kind: io::ErrorKind) { lock(&self.state.send_faults).push_back(SendFault::Fail(kind)); }

    /// Make the next send fail with `kind` after `written` bytes went out.
    /// The partial bytes are not delivered to the handle.
    pub fn tear_next_send(&self, written: usize, kind: io::ErrorKind) {
        lock(&self.state.send_faults).push_back(SendFault::Tear { written, kind });
    }

    /// Block sends until [`release_sends`](Self::release_sends).
    pub fn stall_sends(&self) { self.state.stalled.send_replace(true); }

    pub fn release_sends(&self) { self.state.stalled.send_replace(false); }

    /// Wait for the next PDU the initiator wrote.
    ///
    /// Returns `None` once the transport is gone and nothing is buffered.
    pub async fn next_sent(&self) -> Option<Pdu> {
        let frame = self.sent.lock().await.recv().await?;
        self.decode(frame)
    }

    /// Like [`next_sent`](Self::next_sent), giving up after `limit`.
    pub async fn next_sent_within(&self, limit: Duration) -> Option<Pdu> {
        tokio::time::timeout(limit, self.next_sent()).await.ok().flatten()
    }

    /// Take every PDU written so far without waiting.
    pub fn drain_sent(&self) -> Vec<Pdu> {
        let Ok(mut sent) = self.sent.try_lock() else {
            return Vec::new();
        };
        let mut pdus = Vec::new();
        while let Ok(frame) = sent.try_recv() {
            pdus.extend(self.decode(frame));
        }
        pdus
    }

    fn decode(&self, frame: Bytes) -> Option<Pdu> {
        let mut buf = BytesMut::from(&frame[..]);
        codec::decode_frame(&mut buf, &self.digests, DECODE_LIMIT).ok().flatten()
    }

    /// Every transport call in order.
    #[must_use]
    pub fn calls(&self) -> Vec<TransportCall> { lock(&self.state.calls).clone() }

    /// Whether the session closed the transport.
    #[must_use]
    pub fn is_closed(&self) -> bool { *self.state.closed.borrow() }
}

/// Connector that hands out pre-scripted transports in order.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    outcomes: Arc<Mutex<VecDeque<Result<ScriptedTransport, io::ErrorKind>>>>,
    attempts: Arc<Mutex<usize>>,
}

impl ScriptedConnector {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Queue a successful connection returning `transport`.
    pub fn succeed_with(&self, transport: ScriptedTransport) { lock(&self.outcomes).push_back(Ok(transport)); }

    /// Queue a failed connection attempt.
    pub fn fail_with(&self, kind: io::ErrorKind) { lock(&self.outcomes).push_back(Err(kind)); }

    /// Number of `connect` calls so far.
    #[must_use]
    pub fn attempts(&self) -> usize { *lock(&self.attempts) }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError> {
        *lock(&self.attempts) += 1;
        match lock(&self.outcomes).pop_front() {
            Some(Ok(transport)) => Ok(Arc::new(transport)),
            Some(Err(kind)) => Err(io::Error::from(kind).into()),
            None => Err(io::Error::from(io::ErrorKind::ConnectionRefused).into()),
        }
    }
}
