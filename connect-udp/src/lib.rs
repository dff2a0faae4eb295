mod datagram;
mod error;
mod template;
mod varint;

#[allow(unused)]
pub(crate) mod trace {
  pub(crate) use tracing::{debug, error, info, trace, warn};
}

pub use datagram::{UDP_PAYLOAD_CONTEXT_ID, decode_udp_payload, encode_udp_payload};
pub use error::{DatagramError, TemplateError};
pub use template::UriTemplate;
pub use varint::{VARINT_MAX, decode_varint, encode_varint, varint_len};
