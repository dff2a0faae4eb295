use crate::{
  error::DatagramError,
  trace::*,
  varint::{decode_varint, encode_varint},
};
use bytes::{BufMut, Bytes, BytesMut};

/// Context ID for UDP payloads in HTTP Datagrams.
/// https://www.rfc-editor.org/rfc/rfc9298.html#section-4
pub const UDP_PAYLOAD_CONTEXT_ID: u64 = 0;

/// Wrap a UDP payload into an HTTP Datagram payload: Context ID (0) followed by the UDP payload
pub fn encode_udp_payload(payload: &[u8]) -> Bytes {
  let mut buf = BytesMut::with_capacity(payload.len() + 1);
  // context id 0 always fits in a single byte
  let _ = encode_varint(UDP_PAYLOAD_CONTEXT_ID, &mut buf);
  buf.put_slice(payload);
  buf.freeze()
}

/// Extract the UDP payload from an HTTP Datagram payload.
/// Datagrams with an unknown context id must be dropped by the caller.
pub fn decode_udp_payload(datagram: Bytes) -> Result<Bytes, DatagramError> {
  let Some((context_id, len)) = decode_varint(&datagram) else {
    return Err(DatagramError::Truncated);
  };
  if context_id != UDP_PAYLOAD_CONTEXT_ID {
    debug!("Dropping datagram with context id {context_id}");
    return Err(DatagramError::UnknownContextId(context_id));
  }
  Ok(datagram.slice(len..))
}
