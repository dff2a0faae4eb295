/// Port used when the target URL or the proxy template carries no port
pub const DEFAULT_PORT: u16 = 443;

/// ALPN identifier negotiated with both the proxy and the target
pub const H3_ALPN: &str = "h3";

/// Initial QUIC packet size of the connection to the proxy
pub const INITIAL_PACKET_SIZE: u16 = 1350;

/// Upper bound of the initial QUIC packet size of the connection to the target.
/// An outer connection at 1350 bytes accepts DATAGRAM frames of about 1312 bytes,
/// which must hold the inner packet plus the quarter stream id and the context id.
pub const INNER_INITIAL_PACKET_SIZE: u16 = 1280;

/// Environment variable naming the NSS key log file
pub const KEY_LOG_FILE_ENV: &str = "SSLKEYLOGFILE";

/// Capacity of the packet channels between a tunnel handle and its relay, in packets
pub const TUNNEL_CHANNEL_CAPACITY: usize = 1024;

/// Template variable for the target host
/// https://www.rfc-editor.org/rfc/rfc9298.html#section-2
pub const TARGET_HOST_VARIABLE: &str = "target_host";

/// Template variable for the target port
pub const TARGET_PORT_VARIABLE: &str = "target_port";

/// Header announcing capsule protocol support on the CONNECT-UDP request stream
pub const CAPSULE_PROTOCOL_HEADER: &str = "capsule-protocol";

pub mod log_event_names {
  /// Event name for the tunnel establishment log
  pub const TUNNEL_ESTABLISHED: &str = "tunnel_established";
}
