//! PDU framing: length computation, encoding and decoding.
//!
//! Wire layout of one PDU:
//!
//! ```text
//! +-----+-----+----------------+------+---------+----------------+
//! | BHS | AHS | header digest? | data | padding | data digest?   |
//! | 48  | 4*n | 4              | DSL  | 0..3    | 4 (if DSL > 0) |
//! +-----+-----+----------------+------+---------+----------------+
//! ```
//!
//! [`FrameLayout`] derives every length from the BHS alone so the receive
//! engine can issue exactly two reads per PDU.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{BHS_LEN, Bhs, Pdu};
use crate::{
    byte_order::{read_network_u32, write_network_u32},
    digest::Digests,
    error::FramingError,
};

const PADDING: [u8; 3] = [0; 3];

/// Round `len` up to the next multiple of four.
#[must_use]
pub fn padded_len(len: usize) -> usize { (len + 3) & !3 }

/// Byte counts of every section following the BHS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    pub ahs_len: usize,
    pub header_digest_len: usize,
    pub data_len: usize,
    pub padded_data_len: usize,
    pub data_digest_len: usize,
}

impl FrameLayout {
    /// Compute the layout advertised by `header` under `digests`.
    ///
    /// # Examples
    ///
    /// ```
    /// use iscsi_initiator::{
    ///     digest::Digests,
    ///     pdu::{Bhs, Opcode, codec::FrameLayout},
    /// };
    ///
    /// let mut bhs = Bhs::new(Opcode::DataIn);
    /// bhs.set_data_segment_length(5);
    /// let layout = FrameLayout::from_header(&bhs, &Digests::none());
    /// assert_eq!(layout.body_len(), 8);
    /// ```
    #[must_use]
    pub fn from_header(header: &Bhs, digests: &Digests) -> Self {
        let data_len = header.data_segment_length() as usize;
        Self {
            ahs_len: header.ahs_len(),
            header_digest_len: digests.header_len(),
            data_len,
            padded_data_len: padded_len(data_len),
            data_digest_len: digests.data_len(data_len),
        }
    }

    /// Bytes following the BHS.
    #[must_use]
    pub fn body_len(&self) -> usize {
        self.ahs_len + self.header_digest_len + self.padded_data_len + self.data_digest_len
    }

    /// Bytes of the whole PDU, BHS included.
    #[must_use]
    pub fn total_len(&self) -> usize { BHS_LEN + self.body_len() }

    /// Reject data segments above the negotiated receive limit.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::OversizedSegment`] when the advertised data
    /// segment is larger than `max_data_segment`.
    pub fn check_limit(&self, max_data_segment: usize) -> Result<(), FramingError> {
        // The AHS length is a one-byte word count, so it never exceeds 1020
        // bytes, and each digest is four. Only the data segment is unbounded.
        if self.data_len > max_data_segment {
            return Err(FramingError::OversizedSegment {
                size: self.data_len,
                max: max_data_segment,
            });
        }
        Ok(())
    }

    fn data_start(&self) -> usize { self.ahs_len + self.header_digest_len }
}

/// An encoded PDU as a short list of buffers.
///
/// The data segment is shared with the source [`Pdu`] rather than copied.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    segments: Vec<Bytes>,
}

impl Frame {
    #[must_use]
    pub fn segments(&self) -> &[Bytes] { &self.segments }

    /// Total encoded length.
    #[must_use]
    pub fn len(&self) -> usize { self.segments.iter().map(Bytes::len).sum() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Concatenate the segments into one buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len());
        for segment in &self.segments {
            out.extend_from_slice(segment);
        }
        out.freeze()
    }
}

/// Encode `pdu` with the configured digests.
#[must_use]
pub fn encode(pdu: &Pdu, digests: &Digests) -> Frame {
    let header = pdu.header().as_bytes();
    let ahs = pdu.ahs();
    let mut head = BytesMut::with_capacity(BHS_LEN + ahs.len() + digests.header_len());
    head.put_slice(header);
    head.put_slice(ahs);
    if let Some(digest) = digests.header_digest(&[&header[..], &ahs[..]]) {
        head.put_slice(&write_network_u32(digest));
    }

    let mut segments = vec![head.freeze()];
    let data = pdu.data();
    if !data.is_empty() {
        let pad = &PADDING[..padded_len(data.len()) - data.len()];
        segments.push(data.clone());
        let mut tail = BytesMut::with_capacity(pad.len() + digests.data_len(data.len()));
        tail.put_slice(pad);
        if let Some(digest) = digests.data_digest(&[&data[..], pad]) {
            tail.put_slice(&write_network_u32(digest));
        }
        if !tail.is_empty() {
            segments.push(tail.freeze());
        }
    }
    Frame { segments }
}

fn u32_at(body: &[u8], offset: usize) -> u32 {
    let mut field = [0u8; 4];
    field.copy_from_slice(&body[offset..offset + 4]);
    read_network_u32(field)
}

/// Build a PDU from its BHS and the body read according to `layout`,
/// verifying digests.
///
/// # Errors
///
/// Returns [`FramingError::Truncated`] when `body` is shorter than the
/// layout and a digest error when a received digest does not match.
pub fn decode(header: Bhs, body: Bytes, digests: &Digests) -> Result<Pdu, FramingError> {
    let layout = FrameLayout::from_header(&header, digests);
    if body.len() < layout.body_len() {
        return Err(FramingError::Truncated {
            have: body.len(),
            need: layout.body_len(),
        });
    }
    let ahs = body.slice(..layout.ahs_len);
    let header_digest = match digests.header_digest(&[&header.as_bytes()[..], &ahs[..]]) {
        Some(expected) => {
            let actual = u32_at(&body, layout.ahs_len);
            if actual != expected {
                return Err(FramingError::HeaderDigest { expected, actual });
            }
            Some(actual)
        }
        None => None,
    };

    let start = layout.data_start();
    let data = body.slice(start..start + layout.data_len);
    let padding = body.slice(start + layout.data_len..start + layout.padded_data_len);
    let data_digest = if layout.data_digest_len > 0 {
        let expected = digests.data_digest(&[&data[..], &padding[..]]).unwrap_or_default();
        let actual = u32_at(&body, start + layout.padded_data_len);
        if actual != expected {
            return Err(FramingError::DataDigest { expected, actual });
        }
        Some(actual)
    } else {
        None
    };
    Ok(Pdu::from_wire(header, ahs, data, header_digest, data_digest))
}

/// Decode one complete PDU from the front of `src`, if available.
///
/// Returns `Ok(None)` when `src` does not yet hold a whole PDU; consumed
/// bytes are removed from `src` only on success.
///
/// # Errors
///
/// Returns the same errors as [`decode`] and [`FrameLayout::check_limit`].
pub fn decode_frame(
    src: &mut BytesMut,
    digests: &Digests,
    max_data_segment: usize,
) -> Result<Option<Pdu>, FramingError> {
    if src.len() < BHS_LEN {
        return Ok(None);
    }
    let mut raw = [0u8; BHS_LEN];
    raw.copy_from_slice(&src[..BHS_LEN]);
    let header = Bhs::from(raw);
    let layout = FrameLayout::from_header(&header, digests);
    layout.check_limit(max_data_segment)?;
    if src.len() < layout.total_len() {
        return Ok(None);
    }
    src.advance(BHS_LEN);
    let body = src.split_to(layout.body_len()).freeze();
    decode(header, body, digests).map(Some)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{digest::DigestFn, pdu::Opcode};

    fn xor_digest(bytes: &[u8], seed: u32) -> u32 {
        bytes.iter().enumerate().fold(seed, |acc, (i, b)| {
            acc.rotate_left(5) ^ (u32::from(*b) << ((i % 4) * 8))
        })
    }

    const DIGEST: DigestFn = xor_digest;

    fn both() -> Digests {
        Digests {
            header: Some(DIGEST),
            data: Some(DIGEST),
        }
    }

    fn command(data: &'static [u8], ahs: &[u8]) -> Pdu {
        let mut header = Bhs::new(Opcode::ScsiCommand);
        header.set_itt(0x10);
        Pdu::new(header)
            .with_ahs(ahs)
            .and_then(|p| p.with_data(Bytes::from_static(data)))
            .expect("valid pdu")
    }

    #[rstest]
    #[case::zero_length(command(b"", &[]), Digests::none())]
    #[case::with_ahs(command(b"abc", &[9, 9, 9, 9, 9, 9]), Digests::none())]
    #[case::with_digests(command(b"payload!!", &[]), both())]
    fn encoded_pdu_decodes_to_original(#[case] pdu: Pdu, #[case] digests: Digests) {
        let frame = encode(&pdu, &digests);
        let mut buf = BytesMut::from(&frame.to_bytes()[..]);
        assert_eq!(frame.len() % 4, 0);

        let decoded = decode_frame(&mut buf, &digests, 8192)
            .expect("decodes")
            .expect("complete frame");
        assert!(buf.is_empty());
        assert_eq!(decoded.opcode(), pdu.opcode());
        assert_eq!(decoded.header().data_segment_length(), pdu.header().data_segment_length());
        assert_eq!(decoded.data(), pdu.data());
        assert_eq!(decoded.ahs(), pdu.ahs());
        assert_eq!(decoded.itt(), 0x10);
    }

    #[test]
    fn layout_counts_every_section() {
        let pdu = command(b"12345", &[1, 2, 3, 4]);
        let layout = FrameLayout::from_header(pdu.header(), &both());
        assert_eq!(
            layout,
            FrameLayout {
                ahs_len: 4,
                header_digest_len: 4,
                data_len: 5,
                padded_data_len: 8,
                data_digest_len: 4,
            }
        );
        assert_eq!(layout.total_len(), encode(&pdu, &both()).len());
    }

    #[test]
    fn data_is_shared_not_copied() {
        let pdu = command(b"shared", &[]);
        let frame = encode(&pdu, &Digests::none());
        assert_eq!(frame.segments()[1].as_ptr(), pdu.data().as_ptr());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let pdu = command(b"abcdef", &[]);
        let bytes = encode(&pdu, &Digests::none()).to_bytes();
        let mut buf = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert!(matches!(decode_frame(&mut buf, &Digests::none(), 8192), Ok(None)));
        assert_eq!(buf.len(), bytes.len() - 1);
    }

    #[test]
    fn oversized_segment_is_rejected() {
        let pdu = command(b"0123456789", &[]);
        let mut buf = BytesMut::from(&encode(&pdu, &Digests::none()).to_bytes()[..]);
        let err = decode_frame(&mut buf, &Digests::none(), 8).expect_err("too large");
        assert_eq!(err, FramingError::OversizedSegment { size: 10, max: 8 });
    }

    #[test]
    fn non_data_sections_are_bounded_by_the_header() {
        let mut header = Bhs::new(Opcode::ScsiCommand);
        header.set_ahs_words(u8::MAX);
        let layout = FrameLayout::from_header(&header, &both());
        assert_eq!(layout.check_limit(0), Ok(()));
        assert_eq!(layout.body_len(), 255 * 4 + 4);
    }

    #[test]
    fn corrupted_header_digest_is_detected() {
        let pdu = command(b"abc", &[]);
        let mut raw = BytesMut::from(&encode(&pdu, &both()).to_bytes()[..]);
        raw[20] ^= 0xff;
        let err = decode_frame(&mut raw, &both(), 8192).expect_err("digest mismatch");
        assert!(matches!(err, FramingError::HeaderDigest { .. }));
    }

    #[test]
    fn corrupted_data_digest_is_detected() {
        let pdu = command(b"abc", &[]);
        let mut raw = BytesMut::from(&encode(&pdu, &both()).to_bytes()[..]);
        raw[BHS_LEN + 4] ^= 0x01;
        let err = decode_frame(&mut raw, &both(), 8192).expect_err("digest mismatch");
        assert!(matches!(err, FramingError::DataDigest { .. }));
    }
}
