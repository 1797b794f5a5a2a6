//! Protocol Data Units and their buffers.
//!
//! A [`Pdu`] owns its header, additional header segment and data segment.
//! Payloads are [`Bytes`], so a write payload split across several Data-Out
//! PDUs shares one reference-counted buffer. Queue membership is tracked by
//! ownership: a `Pdu` lives in exactly one queue, the held-request table, or
//! an engine's local scope, and returns its pool slot when dropped.

pub mod codec;
pub mod header;
pub mod opcode;
pub mod pool;

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
pub use header::{BHS_LEN, Bhs};
pub use opcode::{Opcode, UnknownOpcode};
pub use pool::{PduPool, PoolClosed, PoolSlot};

use crate::{
    byte_order::MAX_U24,
    completion::{Completer, RequestError, RequestHandle, RequestResult},
    error::FramingError,
    queue::QueueKind,
    sequence::RESERVED_TAG,
};

static NEXT_PDU_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a PDU buffer, used for diagnostics and
/// membership checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PduId(u64);

impl PduId {
    fn next() -> Self { Self(NEXT_PDU_ID.fetch_add(1, Ordering::Relaxed)) }

    /// Return the inner value.
    #[must_use]
    pub fn as_u64(self) -> u64 { self.0 }
}

/// Where a PDU currently lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    /// Owned by an engine or the caller; in no queue.
    Detached,
    /// Linked on one of the session queues.
    Queued(QueueKind),
    /// Sent and awaiting its response in the held-request table.
    Held,
}

/// Per-request state carried by tracked PDUs.
#[derive(Debug)]
pub struct RequestContext {
    completer: Completer,
    write_data: Option<Bytes>,
    data_in: BytesMut,
}

impl RequestContext {
    pub(crate) fn new(completer: Completer, write_data: Option<Bytes>) -> Self {
        Self {
            completer,
            write_data,
            data_in: BytesMut::new(),
        }
    }

    /// Outbound payload served in response to R2T.
    #[must_use]
    pub fn write_data(&self) -> Option<&Bytes> { self.write_data.as_ref() }

    pub(crate) fn append_data_in(&mut self, data: &[u8]) { self.data_in.extend_from_slice(data); }
}

/// One protocol message in flight.
#[derive(Debug)]
pub struct Pdu {
    id: PduId,
    header: Bhs,
    ahs: Bytes,
    data: Bytes,
    header_digest: Option<u32>,
    data_digest: Option<u32>,
    context: Option<RequestContext>,
    sequenced: bool,
    location: Location,
    slot: Option<PoolSlot>,
}

impl Pdu {
    /// Create a PDU with an empty AHS and data segment.
    ///
    /// # Examples
    ///
    /// ```
    /// use iscsi_initiator::pdu::{Bhs, Opcode, Pdu};
    ///
    /// let pdu = Pdu::new(Bhs::new(Opcode::ScsiCommand));
    /// assert_eq!(pdu.opcode(), Ok(Opcode::ScsiCommand));
    /// assert!(pdu.data().is_empty());
    /// ```
    #[must_use]
    pub fn new(header: Bhs) -> Self {
        let mut pdu = Self {
            id: PduId::next(),
            header,
            ahs: Bytes::new(),
            data: Bytes::new(),
            header_digest: None,
            data_digest: None,
            context: None,
            sequenced: false,
            location: Location::Detached,
            slot: None,
        };
        pdu.header.set_data_segment_length(0);
        pdu.header.set_ahs_words(0);
        pdu
    }

    /// Attach a data segment, updating `DataSegmentLength`.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::SegmentTooLarge`] if `data` does not fit the
    /// 24-bit length field.
    pub fn with_data(mut self, data: Bytes) -> Result<Self, FramingError> {
        self.set_data(data)?;
        Ok(self)
    }

    /// Replace the data segment, updating `DataSegmentLength`.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::SegmentTooLarge`] if `data` does not fit the
    /// 24-bit length field.
    pub fn set_data(&mut self, data: Bytes) -> Result<(), FramingError> {
        let len = u32::try_from(data.len())
            .ok()
            .filter(|len| *len <= MAX_U24)
            .ok_or(FramingError::SegmentTooLarge { size: data.len() })?;
        self.header.set_data_segment_length(len);
        self.data = data;
        Ok(())
    }

    /// Attach an additional header segment, zero-padded to a word boundary.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::AhsTooLong`] above 255 words.
    pub fn with_ahs(mut self, ahs: &[u8]) -> Result<Self, FramingError> {
        let padded = codec::padded_len(ahs.len());
        let words = u8::try_from(padded / 4).map_err(|_| FramingError::AhsTooLong { size: ahs.len() })?;
        let mut buf = BytesMut::zeroed(padded);
        buf[..ahs.len()].copy_from_slice(ahs);
        self.header.set_ahs_words(words);
        self.ahs = buf.freeze();
        Ok(self)
    }

    pub(crate) fn from_wire(
        header: Bhs,
        ahs: Bytes,
        data: Bytes,
        header_digest: Option<u32>,
        data_digest: Option<u32>,
    ) -> Self {
        Self {
            id: PduId::next(),
            header,
            ahs,
            data,
            header_digest,
            data_digest,
            context: None,
            sequenced: false,
            location: Location::Detached,
            slot: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> PduId { self.id }

    #[must_use]
    pub fn header(&self) -> &Bhs { &self.header }

    pub fn header_mut(&mut self) -> &mut Bhs { &mut self.header }

    /// Decode the opcode.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownOpcode`] for unhandled values.
    pub fn opcode(&self) -> Result<Opcode, UnknownOpcode> { self.header.opcode() }

    #[must_use]
    pub fn itt(&self) -> u32 { self.header.itt() }

    #[must_use]
    pub fn ahs(&self) -> &Bytes { &self.ahs }

    #[must_use]
    pub fn data(&self) -> &Bytes { &self.data }

    /// Header digest received with this PDU, if digests were enabled.
    #[must_use]
    pub fn header_digest(&self) -> Option<u32> { self.header_digest }

    /// Data digest received with this PDU, if digests were enabled.
    #[must_use]
    pub fn data_digest(&self) -> Option<u32> { self.data_digest }

    /// Whether a completion handle is attached.
    #[must_use]
    pub fn is_tracked(&self) -> bool { self.context.is_some() }

    #[must_use]
    pub fn context(&self) -> Option<&RequestContext> { self.context.as_ref() }

    pub(crate) fn context_mut(&mut self) -> Option<&mut RequestContext> { self.context.as_mut() }

    /// Attach a completion handle and return the caller's half.
    pub(crate) fn track(&mut self, write_data: Option<Bytes>) -> RequestHandle {
        let (completer, handle) = Completer::pair();
        self.context = Some(RequestContext::new(completer, write_data));
        handle
    }

    /// Resolve the attached request successfully with `response`.
    ///
    /// The response leaves the pool here; the consumer may keep it as long
    /// as it likes.
    pub(crate) fn complete_with(mut self, mut response: Pdu) {
        response.release_slot();
        if let Some(ctx) = self.context.take() {
            let RequestContext {
                completer, data_in, ..
            } = ctx;
            completer.complete(Ok(crate::completion::Completion {
                response,
                data: data_in.freeze(),
            }));
        }
    }

    /// Resolve the attached request with `err`. Untracked PDUs are simply
    /// released.
    pub(crate) fn fail(mut self, err: RequestError) {
        if let Some(ctx) = self.context.take() {
            let result: RequestResult = Err(err);
            ctx.completer.complete(result);
        }
    }

    /// Whether a CmdSN has been stamped on the current connection.
    #[must_use]
    pub fn is_sequenced(&self) -> bool { self.sequenced }

    pub(crate) fn mark_sequenced(&mut self, sequenced: bool) { self.sequenced = sequenced; }

    #[must_use]
    pub fn location(&self) -> Location { self.location }

    pub(crate) fn set_location(&mut self, location: Location) { self.location = location; }

    pub(crate) fn attach_slot(&mut self, slot: PoolSlot) { self.slot = Some(slot); }

    /// Return the pool slot early, e.g. before handing the PDU to a consumer.
    pub(crate) fn release_slot(&mut self) { self.slot = None; }

    /// Whether the PDU counts against a session pool.
    #[must_use]
    pub fn holds_slot(&self) -> bool { self.slot.is_some() }

    /// Turn a target's NOP-In ping into the matching NOP-Out reply in place.
    ///
    /// TTT, LUN and ping data are kept; ITT becomes reserved and the
    /// sequence and reserved fields are cleared for the transmit engine to
    /// stamp.
    pub(crate) fn into_nop_out_reply(mut self) -> Self {
        let header = &mut self.header;
        header.set_opcode(Opcode::NopOut);
        header.set_immediate(true);
        header.set_flags(opcode::FINAL_FLAG);
        header.as_bytes_mut()[2..4].fill(0);
        header.set_itt(RESERVED_TAG);
        header.clear(24..BHS_LEN);
        self.header_digest = None;
        self.data_digest = None;
        self.sequenced = false;
        self
    }
}
