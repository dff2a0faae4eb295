use crate::{
  config::{SecurityConfig, TransportConfig},
  endpoint::TargetEndpoint,
  error::MasqueError,
  request::{FetchedResponse, SendRequest},
  trace::*,
  tunnel::{TunnelHandle, TunnelSocket},
};
use bytes::{BufMut, BytesMut};
use std::{future::poll_fn, net::SocketAddr, sync::Arc};

/// Performs a handshake with the target over an already opened tunnel
#[async_trait::async_trait]
pub trait InnerDialer: Send + Sync {
  /// Connection to the target, consumed by a single request
  type Connection: SendRequest;

  /// Dial the target using the tunnel as the packet channel.
  /// The tunnel is owned by the dial, so dropping the returned future releases it.
  async fn dial_over(
    &self,
    tunnel: TunnelHandle,
    target: &TargetEndpoint,
    target_addr: SocketAddr,
    security: &SecurityConfig,
    transport: &TransportConfig,
  ) -> Result<Self::Connection, MasqueError>;
}

#[derive(Debug, Clone, Copy, Default)]
/// Inner dialer establishing a QUIC connection through the tunnel
pub struct QuicInnerDialer;

#[async_trait::async_trait]
impl InnerDialer for QuicInnerDialer {
  type Connection = InnerConnection;

  async fn dial_over(
    &self,
    tunnel: TunnelHandle,
    target: &TargetEndpoint,
    target_addr: SocketAddr,
    security: &SecurityConfig,
    transport: &TransportConfig,
  ) -> Result<InnerConnection, MasqueError> {
    let client_config = security
      .build_quinn_client(transport)
      .map_err(MasqueError::inner_handshake)?;

    let socket = Arc::new(TunnelSocket::new(tunnel));
    let endpoint = quinn::Endpoint::new_with_abstract_socket(
      quinn::EndpointConfig::default(),
      None,
      socket,
      Arc::new(quinn::TokioRuntime),
    )
    .map_err(MasqueError::inner_handshake)?;

    let connection = endpoint
      .connect_with(client_config, target_addr, target.host())
      .map_err(MasqueError::inner_handshake)?
      .await
      .map_err(MasqueError::inner_handshake)?;
    debug!("Inner QUIC connection established to {} ({})", target, target_addr);

    Ok(InnerConnection { endpoint, connection })
  }
}

/* ---------------------------------------------------------- */
/// QUIC connection to the target running over a tunnel
pub struct InnerConnection {
  /// Endpoint bound to the tunnel, kept alive with the connection
  endpoint: quinn::Endpoint,
  connection: quinn::Connection,
}

impl InnerConnection {
  /// Negotiated ALPN protocol, if any
  pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
    self
      .connection
      .handshake_data()
      .and_then(|data| data.downcast::<quinn::crypto::rustls::HandshakeData>().ok())
      .and_then(|data| data.protocol)
  }
}

#[async_trait::async_trait]
impl SendRequest for InnerConnection {
  /// Send the request over HTTP/3 and collect the whole response body
  async fn send_request(&mut self, request: http::Request<()>) -> Result<FetchedResponse, MasqueError> {
    if let Some(alpn) = self.alpn_protocol() {
      debug!("Negotiated ALPN with target: {}", String::from_utf8_lossy(&alpn));
    }
    let (mut driver, mut send_request) = h3::client::new(h3_quinn::Connection::new(self.connection.clone()))
      .await
      .map_err(MasqueError::request)?;

    let exchange = async {
      let mut stream = send_request.send_request(request).await.map_err(MasqueError::request)?;
      stream.finish().await.map_err(MasqueError::request)?;
      let response = stream.recv_response().await.map_err(MasqueError::request)?;
      debug!("Received response headers: {:?}", response.headers());

      let mut body = BytesMut::new();
      while let Some(chunk) = stream.recv_data().await.map_err(MasqueError::request)? {
        body.put(chunk);
      }
      Ok::<_, MasqueError>(FetchedResponse::new(response.status(), body.freeze()))
    };

    let res = tokio::select! {
      res = exchange => res,
      err = poll_fn(|cx| driver.poll_close(cx)) => Err(MasqueError::request(format!("connection closed: {err}"))),
    };

    self.connection.close(quinn::VarInt::from_u32(0), b"done");
    self.endpoint.wait_idle().await;
    res
  }
}
