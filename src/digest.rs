//! Optional header and data digest hooks.
//!
//! The engine never implements a checksum itself. Callers plug in the
//! negotiated algorithm (typically CRC32C) as a plain function pointer; an
//! absent hook disables that digest.

/// Digest function: `(bytes, seed) -> digest`.
pub type DigestFn = fn(&[u8], u32) -> u32;

/// Seed passed to every digest computation.
pub const DIGEST_SEED: u32 = 0xffff_ffff;

/// Size of a digest on the wire.
pub const DIGEST_LEN: usize = 4;

/// Negotiated digest hooks for one connection.
#[derive(Clone, Copy, Default)]
pub struct Digests {
    pub header: Option<DigestFn>,
    pub data: Option<DigestFn>,
}

impl std::fmt::Debug for Digests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Digests")
            .field("header", &self.header.is_some())
            .field("data", &self.data.is_some())
            .finish()
    }
}

impl Digests {
    /// Digests disabled on both channels.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            header: None,
            data: None,
        }
    }

    /// Bytes occupied by the header digest, if enabled.
    #[must_use]
    pub fn header_len(&self) -> usize { if self.header.is_some() { DIGEST_LEN } else { 0 } }

    /// Bytes occupied by the data digest for a segment of `data_len` bytes.
    ///
    /// No data digest is sent for an empty data segment.
    #[must_use]
    pub fn data_len(&self, data_len: usize) -> usize {
        if self.data.is_some() && data_len > 0 {
            DIGEST_LEN
        } else {
            0
        }
    }

    /// Compute the header digest over the concatenated segments.
    #[must_use]
    pub fn header_digest(&self, parts: &[&[u8]]) -> Option<u32> {
        self.header.map(|digest| fold(digest, parts))
    }

    /// Compute the data digest over the concatenated segments.
    #[must_use]
    pub fn data_digest(&self, parts: &[&[u8]]) -> Option<u32> {
        self.data.map(|digest| fold(digest, parts))
    }
}

fn fold(digest: DigestFn, parts: &[&[u8]]) -> u32 {
    parts.iter().fold(DIGEST_SEED, |seed, part| digest(part, seed))
}
