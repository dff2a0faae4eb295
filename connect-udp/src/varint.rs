use crate::error::DatagramError;
use bytes::BufMut;

/// Largest value a QUIC variable-length integer can carry, 2^62 - 1
pub const VARINT_MAX: u64 = (1 << 62) - 1;

/// Encoded length of the given value as a variable-length integer
/// https://www.rfc-editor.org/rfc/rfc9000.html#section-16
pub fn varint_len(value: u64) -> Result<usize, DatagramError> {
  match value {
    0..=0x3f => Ok(1),
    0x40..=0x3fff => Ok(2),
    0x4000..=0x3fff_ffff => Ok(4),
    0x4000_0000..=VARINT_MAX => Ok(8),
    _ => Err(DatagramError::VarintOverflow(value)),
  }
}

/// Append the value to the buffer as a variable-length integer.
/// The two most significant bits of the first byte encode the length.
pub fn encode_varint<B: BufMut>(value: u64, buf: &mut B) -> Result<(), DatagramError> {
  match varint_len(value)? {
    1 => buf.put_u8(value as u8),
    2 => buf.put_u16(0x4000 | value as u16),
    4 => buf.put_u32(0x8000_0000 | value as u32),
    _ => buf.put_u64(0xc000_0000_0000_0000 | value),
  }
  Ok(())
}

/// Decode a variable-length integer from the head of the buffer.
/// Returns the value and the number of consumed bytes, or `None` if the buffer is truncated.
pub fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
  let first = *buf.first()?;
  let len = 1usize << (first >> 6);
  if buf.len() < len {
    return None;
  }
  let value = buf[1..len]
    .iter()
    .fold((first & 0x3f) as u64, |acc, b| (acc << 8) | *b as u64);
  Some((value, len))
}
