//! Big-endian integer encoding for frame prefixes and Thrift headers.
//!
//! The length prefix, the version word, the name length, the sequence id
//! and the exception struct fields are all big-endian on the wire.
#![expect(
    clippy::big_endian_bytes,
    reason = "The frame prefix and Thrift binary protocol are big-endian."
)]

/// Encode a length prefix or Thrift version word.
///
/// ```
/// use relayframe::byte_order::write_network_u32;
///
/// assert_eq!(write_network_u32(0x8001_0001), [0x80, 0x01, 0x00, 0x01]);
/// ```
#[must_use]
pub fn write_network_u32(value: u32) -> [u8; 4] { value.to_be_bytes() }

/// Decode a length prefix or Thrift version word.
#[must_use]
pub fn read_network_u32(bytes: [u8; 4]) -> u32 { u32::from_be_bytes(bytes) }

/// Encode a Thrift `i32` (name length, sequence id, enum value).
#[must_use]
pub fn write_network_i32(value: i32) -> [u8; 4] { value.to_be_bytes() }

/// Decode a Thrift `i32`.
#[must_use]
pub fn read_network_i32(bytes: [u8; 4]) -> i32 { i32::from_be_bytes(bytes) }

/// Encode a Thrift field id.
#[must_use]
pub fn write_network_i16(value: i16) -> [u8; 2] { value.to_be_bytes() }

/// The Thrift `i32` starting at `offset`, or `None` if `bytes` ends first.
///
/// ```
/// use relayframe::byte_order::read_i32_at;
///
/// let header = [0x80, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x03];
/// assert_eq!(read_i32_at(&header, 4), Some(3));
/// assert_eq!(read_i32_at(&header, 6), None);
/// ```
#[must_use]
pub fn read_i32_at(bytes: &[u8], offset: usize) -> Option<i32> {
    let raw = bytes.get(offset..offset.checked_add(4)?)?;
    raw.try_into().ok().map(read_network_i32)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn strict_version_word_for_a_call() {
        let word = write_network_u32(0x8001_0000 | 1);
        assert_eq!(word, [0x80, 0x01, 0x00, 0x01]);
        assert_eq!(read_network_u32(word), 0x8001_0001);
    }

    #[test]
    fn negative_sequence_ids_survive() {
        assert_eq!(write_network_i32(-2), [0xff, 0xff, 0xff, 0xfe]);
        assert_eq!(read_network_i32([0xff, 0xff, 0xff, 0xfe]), -2);
        assert_eq!(write_network_i16(2), [0x00, 0x02]);
    }

    #[rstest]
    #[case(&[0, 0, 0, 7], 0, Some(7))]
    #[case(&[9, 0, 0, 0, 8], 1, Some(8))]
    #[case(&[0, 0, 1], 0, None)]
    #[case(&[0, 0, 0, 1], 2, None)]
    #[case(&[0, 0, 0, 1], usize::MAX, None)]
    fn reads_i32_at_offset(#[case] bytes: &[u8], #[case] offset: usize, #[case] expected: Option<i32>) {
        assert_eq!(read_i32_at(bytes, offset), expected);
    }
}
