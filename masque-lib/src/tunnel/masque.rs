use super::{ProxyCapability, TunnelDialer, TunnelHandle, tunnel_channel};
use crate::{
  config::{SecurityConfig, TransportConfig},
  constants::{CAPSULE_PROTOCOL_HEADER, DEFAULT_PORT},
  endpoint::{AddressResolver, SystemResolver, TargetEndpoint},
  error::MasqueError,
  trace::*,
};
use bytes::{Buf, Bytes};
use connect_udp::{decode_udp_payload, encode_udp_payload, varint_len};
use h3_datagram::datagram_handler::HandleDatagramsExt;
use std::{
  future::poll_fn,
  net::{Ipv4Addr, Ipv6Addr, SocketAddr},
  sync::Arc,
};

/// Tunnel dialer speaking CONNECT-UDP (RFC 9298) over HTTP/3 to the proxy
#[derive(Clone)]
pub struct MasqueTunnelDialer {
  /// Resolver for the proxy host
  resolver: Arc<dyn AddressResolver>,
}

impl Default for MasqueTunnelDialer {
  fn default() -> Self {
    Self::new(Arc::new(SystemResolver))
  }
}

impl MasqueTunnelDialer {
  pub fn new(resolver: Arc<dyn AddressResolver>) -> Self {
    Self { resolver }
  }
}

/// Proxy endpoint from the authority of the expanded template
fn proxy_endpoint(request_uri: &http::Uri) -> Result<TargetEndpoint, MasqueError> {
  let host = request_uri
    .host()
    .ok_or_else(|| MasqueError::InvalidCapability(format!("{request_uri}: no proxy host")))?;
  let host = host.trim_start_matches('[').trim_end_matches(']');
  Ok(TargetEndpoint::new(host, request_uri.port_u16().unwrap_or(DEFAULT_PORT)))
}

/// Whether an HTTP datagram payload of `len` bytes fits into a DATAGRAM frame of the proxy connection,
/// once prefixed with the quarter stream id. `None` means the proxy accepts no datagrams.
fn fits_datagram(len: usize, quarter_stream_id: u64, max_datagram_size: Option<usize>) -> bool {
  let Ok(prefix_len) = varint_len(quarter_stream_id) else {
    return false;
  };
  max_datagram_size.is_some_and(|max| prefix_len + len <= max)
}

#[async_trait::async_trait]
impl TunnelDialer for MasqueTunnelDialer {
  async fn open_tunnel(
    &self,
    capability: &ProxyCapability,
    target: &TargetEndpoint,
    target_addr: SocketAddr,
    security: &SecurityConfig,
    transport: &TransportConfig,
  ) -> Result<TunnelHandle, MasqueError> {
    let request_uri = capability.expand(target)?;
    let proxy = proxy_endpoint(&request_uri)?;
    let proxy_addr = self.resolver.resolve(&proxy).await?;
    debug!("Opening tunnel to {} via proxy {} ({})", target, proxy, proxy_addr);

    /* ------------------------------------------- */
    // QUIC connection to the proxy
    let client_config = security.build_quinn_client(transport).map_err(MasqueError::tunnel)?;
    let bind_addr = if proxy_addr.is_ipv6() {
      SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
    } else {
      SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
    };
    let endpoint = quinn::Endpoint::client(bind_addr).map_err(MasqueError::tunnel)?;
    let local_addr = endpoint.local_addr().map_err(MasqueError::tunnel)?;
    let connection = endpoint
      .connect_with(client_config, proxy_addr, proxy.host())
      .map_err(MasqueError::tunnel)?
      .await
      .map_err(MasqueError::tunnel)?;
    debug!("QUIC connection established to proxy {}", proxy_addr);

    /* ------------------------------------------- */
    // HTTP/3 extended CONNECT with :protocol = connect-udp
    let mut builder = h3::client::builder();
    builder.enable_datagram(true);
    let (mut driver, mut send_request) = builder
      .build::<_, _, Bytes>(h3_quinn::Connection::new(connection.clone()))
      .await
      .map_err(MasqueError::tunnel)?;

    let mut request = http::Request::builder()
      .method(http::Method::CONNECT)
      .uri(request_uri)
      .header(CAPSULE_PROTOCOL_HEADER, "?1")
      .body(())
      .map_err(MasqueError::tunnel)?;
    request.extensions_mut().insert(h3::ext::Protocol::CONNECT_UDP);

    let mut stream = send_request.send_request(request).await.map_err(MasqueError::tunnel)?;
    let response = tokio::select! {
      res = stream.recv_response() => res.map_err(MasqueError::tunnel)?,
      err = poll_fn(|cx| driver.poll_close(cx)) => {
        return Err(MasqueError::tunnel(format!("proxy connection closed: {err}")));
      }
    };
    if !response.status().is_success() {
      return Err(MasqueError::tunnel(format!("proxy rejected the tunnel with status {}", response.status())));
    }

    /* ------------------------------------------- */
    // Relay between the handle and the HTTP datagram flow of the request stream
    let stream_id = stream.id();
    let quarter_stream_id = stream_id.into_inner() / 4;
    let mut datagram_sender = driver.get_datagram_sender(stream_id);
    let mut datagram_reader = driver.get_datagram_reader();
    let (handle, mut relay) = tunnel_channel(local_addr, target_addr);

    tokio::spawn(async move {
      // dropping the last request sender lets h3 close the connection
      let _send_request = send_request;
      let session = relay.session().clone();
      loop {
        tokio::select! {
          _ = session.cancelled() => {
            debug!("Tunnel released");
            break;
          }
          err = poll_fn(|cx| driver.poll_close(cx)) => {
            warn!("Proxy connection closed: {err}");
            break;
          }
          packet = relay.recv() => {
            let Some(packet) = packet else {
              break;
            };
            let datagram = encode_udp_payload(&packet);
            if !fits_datagram(datagram.len(), quarter_stream_id, connection.max_datagram_size()) {
              // oversized packets are lost as on a UDP path
              debug!("Dropping {}-byte packet above the tunnel datagram size", packet.len());
              continue;
            }
            if let Err(e) = datagram_sender.send_datagram(datagram) {
              warn!("Failed to send datagram to proxy: {e}");
              break;
            }
          }
          datagram = datagram_reader.read_datagram() => {
            let datagram = match datagram {
              Ok(datagram) => datagram,
              Err(e) => {
                warn!("Failed to read datagram from proxy: {e}");
                break;
              }
            };
            if datagram.stream_id() != stream_id {
              continue;
            }
            let payload = Bytes::copy_from_slice(datagram.payload().chunk());
            match decode_udp_payload(payload) {
              Ok(packet) => {
                if !relay.deliver(packet) {
                  break;
                }
              }
              Err(e) => debug!("Dropping datagram from proxy: {e}"),
            }
          }
        }
      }
      // closing the request stream ends the tunnel on the proxy side
      drop(stream);
      connection.close(quinn::VarInt::from_u32(0), b"tunnel released");
      endpoint.wait_idle().await;
    });

    Ok(handle)
  }
}
