mod masque;
mod socket;

use crate::{
  config::{SecurityConfig, TransportConfig},
  constants::{TARGET_HOST_VARIABLE, TARGET_PORT_VARIABLE, TUNNEL_CHANNEL_CAPACITY},
  endpoint::TargetEndpoint,
  error::MasqueError,
  trace::*,
};
use bytes::Bytes;
use connect_udp::UriTemplate;
use std::{
  fmt, io,
  net::SocketAddr,
  sync::Mutex,
  task::{Context, Poll},
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, DropGuard};

pub use masque::MasqueTunnelDialer;
pub(crate) use socket::TunnelSocket;

/* ---------------------------------------------------------- */
#[derive(Debug, Clone)]
/// URI template of the proxy's UDP proxying endpoint
pub struct ProxyCapability {
  template: UriTemplate,
}

impl ProxyCapability {
  /// Parse the template. It must reference both `target_host` and `target_port`.
  pub fn parse(template: &str) -> Result<Self, MasqueError> {
    let template = UriTemplate::parse(template).map_err(|e| MasqueError::InvalidCapability(e.to_string()))?;
    for var in [TARGET_HOST_VARIABLE, TARGET_PORT_VARIABLE] {
      if !template.has_variable(var) {
        return Err(MasqueError::InvalidCapability(format!("template lacks variable {var}")));
      }
    }
    Ok(Self { template })
  }

  /// Expand the template for the target into the request URI sent to the proxy
  pub fn expand(&self, target: &TargetEndpoint) -> Result<http::Uri, MasqueError> {
    let port = target.port().to_string();
    let expanded = self
      .template
      .expand(&[(TARGET_HOST_VARIABLE, target.host()), (TARGET_PORT_VARIABLE, &port)])
      .map_err(|e| MasqueError::InvalidCapability(e.to_string()))?;
    let uri = expanded
      .parse::<http::Uri>()
      .map_err(|e| MasqueError::InvalidCapability(format!("{expanded}: {e}")))?;
    if uri.authority().is_none() {
      return Err(MasqueError::InvalidCapability(format!("{expanded}: no proxy host")));
    }
    Ok(uri)
  }

  pub fn template(&self) -> &UriTemplate {
    &self.template
  }
}

impl std::str::FromStr for ProxyCapability {
  type Err = MasqueError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

/* ---------------------------------------------------------- */
/// Opens a tunnel through a UDP proxy
#[async_trait::async_trait]
pub trait TunnelDialer: Send + Sync {
  /// Open a tunnel to `target` (resolved as `target_addr`) through the proxy described by `capability`.
  /// The returned handle behaves as a UDP socket connected to `target_addr`.
  async fn open_tunnel(
    &self,
    capability: &ProxyCapability,
    target: &TargetEndpoint,
    target_addr: SocketAddr,
    security: &SecurityConfig,
    transport: &TransportConfig,
  ) -> Result<TunnelHandle, MasqueError>;
}

/// Create a connected pair of a tunnel handle and the relay side serving it.
/// Dropping the handle cancels the relay's session token.
pub fn tunnel_channel(local_addr: SocketAddr, peer_addr: SocketAddr) -> (TunnelHandle, TunnelRelay) {
  let session = CancellationToken::new();
  let (outgoing_tx, outgoing_rx) = mpsc::channel(TUNNEL_CHANNEL_CAPACITY);
  let (incoming_tx, incoming_rx) = mpsc::channel(TUNNEL_CHANNEL_CAPACITY);
  let handle = TunnelHandle {
    local_addr,
    peer_addr,
    outgoing: outgoing_tx,
    incoming: Mutex::new(incoming_rx),
    _session_guard: session.clone().drop_guard(),
  };
  let relay = TunnelRelay {
    outgoing: outgoing_rx,
    incoming: incoming_tx,
    session,
  };
  (handle, relay)
}

/* ---------------------------------------------------------- */
/// Datagram channel to the target through the proxy, usable in place of a UDP socket
pub struct TunnelHandle {
  /// Local address of the tunnel
  local_addr: SocketAddr,
  /// Target address the tunnel forwards to
  peer_addr: SocketAddr,
  /// Packets towards the target
  outgoing: mpsc::Sender<Bytes>,
  /// Packets from the target
  incoming: Mutex<mpsc::Receiver<Bytes>>,
  /// Releases the proxy session when the handle is dropped
  _session_guard: DropGuard,
}

impl fmt::Debug for TunnelHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TunnelHandle")
      .field("local_addr", &self.local_addr)
      .field("peer_addr", &self.peer_addr)
      .finish()
  }
}

impl TunnelHandle {
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn peer_addr(&self) -> SocketAddr {
    self.peer_addr
  }

  /// Send a packet to the target without waiting.
  /// A packet is silently dropped when the relay is congested, as a UDP socket would do.
  pub fn try_send(&self, packet: Bytes) -> io::Result<()> {
    match self.outgoing.try_send(packet) {
      Ok(()) => Ok(()),
      Err(TrySendError::Full(_)) => {
        trace!("Tunnel to {} is congested, dropping packet", self.peer_addr);
        Ok(())
      }
      Err(TrySendError::Closed(_)) => Err(io::Error::new(io::ErrorKind::BrokenPipe, "tunnel closed")),
    }
  }

  /// Poll for a packet from the target. `None` means the tunnel is closed.
  pub fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
    let mut incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
    incoming.poll_recv(cx)
  }

  /// Receive a packet from the target
  pub async fn recv(&self) -> Option<Bytes> {
    std::future::poll_fn(|cx| self.poll_recv(cx)).await
  }
}

/* ---------------------------------------------------------- */
/// Relay side of a tunnel, held by the tunnel engine
pub struct TunnelRelay {
  /// Packets sent by the handle
  outgoing: mpsc::Receiver<Bytes>,
  /// Packets delivered to the handle
  incoming: mpsc::Sender<Bytes>,
  session: CancellationToken,
}

impl TunnelRelay {
  /// Next packet the handle sent towards the target, `None` once the handle is gone
  pub async fn recv(&mut self) -> Option<Bytes> {
    self.outgoing.recv().await
  }

  /// Deliver a packet from the target to the handle. Returns false if the handle is gone.
  pub fn deliver(&self, packet: Bytes) -> bool {
    match self.incoming.try_send(packet) {
      Ok(()) => true,
      Err(TrySendError::Full(_)) => {
        trace!("Tunnel receive queue is full, dropping packet");
        true
      }
      Err(TrySendError::Closed(_)) => false,
    }
  }

  /// Token cancelled when the handle is dropped
  pub fn session(&self) -> &CancellationToken {
    &self.session
  }
}
