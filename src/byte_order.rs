//! Helpers for explicit network byte-order conversions.
//!
//! These helpers keep Clippy expectations scoped to the conversion points so
//! protocol code can remain explicit about wire endianness without repeating
//! lint annotations. iSCSI carries every multi-byte field in network order,
//! including the 24-bit `DataSegmentLength`.

/// Largest value representable by a 24-bit length field.
pub const MAX_U24: u32 = 0x00ff_ffff;

/// Serialise a `u32` in network byte order (big-endian).
///
/// # Examples
///
/// ```
/// use iscsi_initiator::byte_order::write_network_u32;
///
/// assert_eq!(write_network_u32(0x1234_5678), [0x12, 0x34, 0x56, 0x78]);
/// ```
#[must_use]
pub fn write_network_u32(value: u32) -> [u8; 4] {
    #[expect(
        clippy::big_endian_bytes,
        reason = "Network byte order requires big-endian bytes."
    )]
    value.to_be_bytes()
}

/// Parse a network-order `u32` from its on-wire representation.
///
/// # Examples
///
/// ```
/// use iscsi_initiator::byte_order::read_network_u32;
///
/// assert_eq!(read_network_u32([0x12, 0x34, 0x56, 0x78]), 0x1234_5678);
/// ```
#[must_use]
pub fn read_network_u32(bytes: [u8; 4]) -> u32 {
    #[expect(
        clippy::big_endian_bytes,
        reason = "Network byte order requires big-endian bytes."
    )]
    u32::from_be_bytes(bytes)
}

/// Serialise the low 24 bits of `value` in network byte order.
///
/// Bits above the 24th are discarded; callers validate lengths against
/// [`MAX_U24`] before encoding.
///
/// # Examples
///
/// ```
/// use iscsi_initiator::byte_order::write_network_u24;
///
/// assert_eq!(write_network_u24(0x0012_3456), [0x12, 0x34, 0x56]);
/// ```
#[must_use]
pub fn write_network_u24(value: u32) -> [u8; 3] {
    let [_, hi, mid, lo] = write_network_u32(value & MAX_U24);
    [hi, mid, lo]
}

/// Parse a network-order 24-bit field into a `u32`.
///
/// # Examples
///
/// ```
/// use iscsi_initiator::byte_order::read_network_u24;
///
/// assert_eq!(read_network_u24([0x12, 0x34, 0x56]), 0x0012_3456);
/// ```
#[must_use]
pub fn read_network_u24(bytes: [u8; 3]) -> u32 {
    let [hi, mid, lo] = bytes;
    read_network_u32([0, hi, mid, lo])
}
