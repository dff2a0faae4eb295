mod client;
mod config;
mod constants;
mod endpoint;
mod error;
mod inner;
mod keylog;
mod request;
mod tunnel;

#[allow(unused)]
pub(crate) mod trace {
  pub(crate) use tracing::{debug, error, info, trace, warn};
}

pub use client::{MasqueClient, MasqueClientBuilder, MasqueClientBuilderError};
pub use config::{SecurityConfig, TransportConfig};
pub use constants::{DEFAULT_PORT, H3_ALPN, INITIAL_PACKET_SIZE, INNER_INITIAL_PACKET_SIZE, KEY_LOG_FILE_ENV};
pub use endpoint::{AddressResolver, SystemResolver, TargetEndpoint, resolve_endpoint};
pub use error::{MasqueBuildError, MasqueError, Stage};
pub use inner::{InnerConnection, InnerDialer, QuicInnerDialer};
pub use keylog::{KeyLogCoordinator, KeyLogSink};
pub use request::{Dial, FetchedResponse, SendRequest, execute};
pub use tunnel::{MasqueTunnelDialer, ProxyCapability, TunnelDialer, TunnelHandle, TunnelRelay, tunnel_channel};
