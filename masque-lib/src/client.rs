use crate::{
  config::{SecurityConfig, TransportConfig},
  constants::log_event_names,
  endpoint::{AddressResolver, TargetEndpoint, resolve_endpoint},
  error::{MasqueError, Stage},
  inner::InnerDialer,
  keylog::KeyLogCoordinator,
  request::{Dial, FetchedResponse, execute},
  trace::*,
  tunnel::{ProxyCapability, TunnelDialer},
};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/* ---------------------------------------------------------- */
/// Client fetching a URL over HTTP/3 through a UDP proxy.
/// The tunnel and the inner connection are dialed lazily when the request needs a connection.
#[derive(derive_builder::Builder)]
#[builder(pattern = "owned")]
pub struct MasqueClient<T, I, R> {
  /// Capability template of the proxy
  capability: ProxyCapability,
  /// Base TLS settings, copied for each handshake
  #[builder(default)]
  security: SecurityConfig,
  /// Base QUIC transport settings, copied for each handshake
  #[builder(default)]
  transport: TransportConfig,
  /// Optional key logging
  #[builder(default)]
  key_log: KeyLogCoordinator,
  /// Opens the tunnel through the proxy
  tunnel_dialer: T,
  /// Dials the target over the tunnel
  inner_dialer: I,
  /// Resolves the target address
  resolver: R,
}

impl<T, I, R> MasqueClient<T, I, R>
where
  T: TunnelDialer,
  I: InnerDialer,
  R: AddressResolver,
{
  /// Fetch the URL through the proxy.
  /// The URL is validated before any network activity.
  pub async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<FetchedResponse, MasqueError> {
    let target = resolve_endpoint(url)?;
    let dialer = TunneledDial { client: self, target };
    execute(url, &dialer, cancel).await
  }
}

/* ---------------------------------------------------------- */
/// Dial callback handed to the request executor: opens the tunnel, then dials the target through it
struct TunneledDial<'a, T, I, R> {
  client: &'a MasqueClient<T, I, R>,
  target: TargetEndpoint,
}

#[async_trait::async_trait]
impl<'a, T, I, R> Dial for TunneledDial<'a, T, I, R>
where
  T: TunnelDialer,
  I: InnerDialer,
  R: AddressResolver,
{
  type Connection = I::Connection;

  async fn dial(&self, cancel: &CancellationToken, authority: &str) -> Result<I::Connection, MasqueError> {
    let client = self.client;
    let target = &self.target;
    debug!("Dialing {authority} through the proxy");

    let target_addr = cancellable(cancel, Stage::TunnelDial, client.resolver.resolve(target)).await?;

    // tunnel handshake
    let tunnel_security = client.key_log.attach(&client.security)?;
    let tunnel_transport = client.transport.for_tunnel();
    let tunnel = cancellable(
      cancel,
      Stage::TunnelDial,
      client
        .tunnel_dialer
        .open_tunnel(&client.capability, target, target_addr, &tunnel_security, &tunnel_transport),
    )
    .await?;
    info!(
      name: log_event_names::TUNNEL_ESTABLISHED,
      "dialed connection: {} <-> {}",
      tunnel.local_addr(),
      target_addr
    );

    // inner handshake, owning the tunnel from here on
    let inner_security = client.key_log.attach(&client.security)?;
    let inner_transport = client.transport.for_inner();
    cancellable(
      cancel,
      Stage::InnerDial,
      client
        .inner_dialer
        .dial_over(tunnel, target, target_addr, &inner_security, &inner_transport),
    )
    .await
  }
}

/// Run the future unless the token is cancelled first.
/// On cancellation the future is dropped, releasing whatever it holds.
async fn cancellable<F, O>(cancel: &CancellationToken, stage: Stage, fut: F) -> Result<O, MasqueError>
where
  F: Future<Output = Result<O, MasqueError>>,
{
  tokio::select! {
    biased;
    _ = cancel.cancelled() => {
      debug!("Cancelled during {stage}");
      Err(MasqueError::Cancelled(stage))
    }
    res = fut => res,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    request::SendRequest,
    tunnel::{TunnelHandle, TunnelRelay, tunnel_channel},
  };
  use bytes::Bytes;
  use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
  };

  use tracing_subscriber::{fmt, prelude::*};

  fn init_logger() {
    let pkg_name = env!("CARGO_PKG_NAME").replace('-', "_");
    let stdio_layer = fmt::layer()
      .with_line_number(true)
      .with_filter(tracing_subscriber::filter::filter_fn(move |metadata| {
        metadata.target().starts_with(&pkg_name) || metadata.level() <= &tracing::Level::INFO
      }));
    let _ = tracing_subscriber::registry().with(stdio_layer).try_init();
  }

  const TEMPLATE: &str = "https://proxy.example:4443/masque{?target_host,target_port}";
  const TARGET_ADDR: &str = "93.184.215.14:443";

  type Events = Arc<Mutex<Vec<&'static str>>>;

  struct FixedResolver(SocketAddr);

  #[async_trait::async_trait]
  impl AddressResolver for FixedResolver {
    async fn resolve(&self, _endpoint: &TargetEndpoint) -> Result<SocketAddr, MasqueError> {
      Ok(self.0)
    }
  }

  /* ------------------------------------------- */
  #[derive(Default)]
  struct TunnelRecord {
    request_uri: Option<String>,
    target: Option<TargetEndpoint>,
    security: Option<SecurityConfig>,
    transport: Option<TransportConfig>,
  }

  struct FakeTunnelDialer {
    events: Events,
    unreachable: bool,
    record: Arc<Mutex<TunnelRecord>>,
    relays: Arc<Mutex<Vec<TunnelRelay>>>,
  }

  #[async_trait::async_trait]
  impl TunnelDialer for FakeTunnelDialer {
    async fn open_tunnel(
      &self,
      capability: &ProxyCapability,
      target: &TargetEndpoint,
      target_addr: SocketAddr,
      security: &SecurityConfig,
      transport: &TransportConfig,
    ) -> Result<TunnelHandle, MasqueError> {
      self.events.lock().unwrap().push("tunnel");
      {
        let mut record = self.record.lock().unwrap();
        record.request_uri = Some(capability.expand(target)?.to_string());
        record.target = Some(target.clone());
        record.security = Some(security.clone());
        record.transport = Some(*transport);
      }
      if self.unreachable {
        return Err(MasqueError::TunnelEstablishmentFailure("proxy unreachable".to_string()));
      }
      let (handle, relay) = tunnel_channel("127.0.0.1:50000".parse().unwrap(), target_addr);
      self.relays.lock().unwrap().push(relay);
      Ok(handle)
    }
  }

  /* ------------------------------------------- */
  #[derive(Default)]
  struct InnerRecord {
    tunnel_peer: Option<SocketAddr>,
    security: Option<SecurityConfig>,
    transport: Option<TransportConfig>,
  }

  enum InnerBehavior {
    Connect,
    /// Cancel the shared token and never finish the handshake
    CancelAndHang(CancellationToken),
  }

  struct FakeInnerDialer {
    events: Events,
    behavior: InnerBehavior,
    record: Arc<Mutex<InnerRecord>>,
  }

  struct FakeConnection {
    events: Events,
  }

  #[async_trait::async_trait]
  impl SendRequest for FakeConnection {
    async fn send_request(&mut self, request: http::Request<()>) -> Result<FetchedResponse, MasqueError> {
      self.events.lock().unwrap().push("request");
      assert_eq!(request.method(), http::Method::GET);
      Ok(FetchedResponse::new(
        http::StatusCode::OK,
        Bytes::from_static(b"<!doctype html><title>Example Domain</title>"),
      ))
    }
  }

  #[async_trait::async_trait]
  impl InnerDialer for FakeInnerDialer {
    type Connection = FakeConnection;

    async fn dial_over(
      &self,
      tunnel: TunnelHandle,
      _target: &TargetEndpoint,
      _target_addr: SocketAddr,
      security: &SecurityConfig,
      transport: &TransportConfig,
    ) -> Result<FakeConnection, MasqueError> {
      self.events.lock().unwrap().push("inner");
      {
        let mut record = self.record.lock().unwrap();
        record.tunnel_peer = Some(tunnel.peer_addr());
        record.security = Some(security.clone());
        record.transport = Some(*transport);
      }
      match &self.behavior {
        InnerBehavior::Connect => Ok(FakeConnection {
          events: self.events.clone(),
        }),
        InnerBehavior::CancelAndHang(token) => {
          token.cancel();
          let _tunnel = tunnel;
          std::future::pending().await
        }
      }
    }
  }

  /* ------------------------------------------- */
  struct Harness {
    events: Events,
    tunnel_record: Arc<Mutex<TunnelRecord>>,
    inner_record: Arc<Mutex<InnerRecord>>,
    relays: Arc<Mutex<Vec<TunnelRelay>>>,
    client: MasqueClient<FakeTunnelDialer, FakeInnerDialer, FixedResolver>,
  }

  struct HarnessOptions {
    unreachable: bool,
    behavior: InnerBehavior,
    security: SecurityConfig,
    transport: TransportConfig,
    key_log: KeyLogCoordinator,
  }

  impl Default for HarnessOptions {
    fn default() -> Self {
      Self {
        unreachable: false,
        behavior: InnerBehavior::Connect,
        security: SecurityConfig::default(),
        transport: TransportConfig::default(),
        key_log: KeyLogCoordinator::disabled(),
      }
    }
  }

  fn harness(options: HarnessOptions) -> Harness {
    let events = Events::default();
    let tunnel_record = Arc::new(Mutex::new(TunnelRecord::default()));
    let inner_record = Arc::new(Mutex::new(InnerRecord::default()));
    let relays = Arc::new(Mutex::new(Vec::new()));

    let client = MasqueClientBuilder::default()
      .capability(ProxyCapability::parse(TEMPLATE).unwrap())
      .security(options.security)
      .transport(options.transport)
      .key_log(options.key_log)
      .tunnel_dialer(FakeTunnelDialer {
        events: events.clone(),
        unreachable: options.unreachable,
        record: tunnel_record.clone(),
        relays: relays.clone(),
      })
      .inner_dialer(FakeInnerDialer {
        events: events.clone(),
        behavior: options.behavior,
        record: inner_record.clone(),
      })
      .resolver(FixedResolver(TARGET_ADDR.parse().unwrap()))
      .build()
      .unwrap();

    Harness {
      events,
      tunnel_record,
      inner_record,
      relays,
      client,
    }
  }

  fn temp_key_log(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("rmasque-client-{}-{}", std::process::id(), name))
  }

  #[tokio::test]
  async fn test_tunneled_fetch() {
    init_logger();
    let h = harness(HarnessOptions {
      security: SecurityConfig::default().with_skip_verify(true),
      ..Default::default()
    });
    let response = h
      .client
      .fetch("https://example.com/", &CancellationToken::new())
      .await
      .unwrap();

    assert_eq!(response.status(), http::StatusCode::OK);
    assert!(!response.body().is_empty());
    assert_eq!(*h.events.lock().unwrap(), vec!["tunnel", "inner", "request"]);

    let tunnel = h.tunnel_record.lock().unwrap();
    assert_eq!(tunnel.target, Some(TargetEndpoint::new("example.com", 443)));
    assert_eq!(
      tunnel.request_uri.as_deref(),
      Some("https://proxy.example:4443/masque?target_host=example.com&target_port=443")
    );
    assert!(tunnel.security.as_ref().unwrap().skip_verify);

    let inner = h.inner_record.lock().unwrap();
    assert_eq!(inner.tunnel_peer, Some(TARGET_ADDR.parse().unwrap()));
    assert!(inner.security.as_ref().unwrap().skip_verify);
  }

  #[tokio::test]
  async fn test_transport_configs_per_handshake() {
    let base = TransportConfig {
      datagrams_enabled: false,
      initial_packet_size: 1350,
      path_mtu_discovery: true,
      max_idle_timeout: None,
    };
    let h = harness(HarnessOptions {
      transport: base,
      ..Default::default()
    });
    h.client
      .fetch("https://example.com/", &CancellationToken::new())
      .await
      .unwrap();

    let tunnel = h.tunnel_record.lock().unwrap().transport.unwrap();
    assert!(tunnel.datagrams_enabled);
    let inner = h.inner_record.lock().unwrap().transport.unwrap();
    assert!(!inner.path_mtu_discovery);
    assert_eq!(inner.initial_packet_size, 1280);
    assert_eq!(h.client.transport, base);
  }

  #[tokio::test]
  async fn test_key_log_sinks_are_not_shared() {
    let path = temp_key_log("not-shared");
    let _ = std::fs::remove_file(&path);
    let h = harness(HarnessOptions {
      key_log: KeyLogCoordinator::new(&path),
      ..Default::default()
    });
    h.client
      .fetch("https://example.com/", &CancellationToken::new())
      .await
      .unwrap();

    let tunnel_sink = h.tunnel_record.lock().unwrap().security.as_ref().unwrap().key_log.clone().unwrap();
    let inner_sink = h.inner_record.lock().unwrap().security.as_ref().unwrap().key_log.clone().unwrap();
    assert!(!Arc::ptr_eq(&tunnel_sink, &inner_sink));
    assert!(h.client.security.key_log.is_none());
    let _ = std::fs::remove_file(&path);
  }

  #[tokio::test]
  async fn test_unopenable_key_log_aborts_before_dialing() {
    let path = temp_key_log("no-such-dir").join("keys.log");
    let h = harness(HarnessOptions {
      key_log: KeyLogCoordinator::new(&path),
      ..Default::default()
    });
    let res = h.client.fetch("https://example.com/", &CancellationToken::new()).await;

    assert!(matches!(res, Err(MasqueError::DiagnosticSinkUnavailable { .. })));
    assert!(h.events.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_malformed_url_never_dials() {
    let h = harness(HarnessOptions::default());
    let res = h.client.fetch("http://ex ample.com/", &CancellationToken::new()).await;

    assert!(matches!(res, Err(MasqueError::MalformedEndpoint { .. })));
    assert!(h.events.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_unreachable_proxy_skips_inner_dial() {
    let h = harness(HarnessOptions {
      unreachable: true,
      ..Default::default()
    });
    let res = h.client.fetch("https://example.com/", &CancellationToken::new()).await;

    assert!(matches!(res, Err(MasqueError::TunnelEstablishmentFailure(_))));
    assert_eq!(*h.events.lock().unwrap(), vec!["tunnel"]);
    assert!(h.inner_record.lock().unwrap().security.is_none());
  }

  #[tokio::test]
  async fn test_cancel_during_inner_dial_releases_tunnel() {
    let cancel = CancellationToken::new();
    let h = harness(HarnessOptions {
      behavior: InnerBehavior::CancelAndHang(cancel.clone()),
      ..Default::default()
    });
    let res = h.client.fetch("https://example.com/", &cancel).await;

    match res {
      Err(e) => {
        assert!(e.is_cancelled());
        assert!(matches!(e, MasqueError::Cancelled(Stage::InnerDial)));
      }
      Ok(_) => panic!("fetch must fail on cancellation"),
    }
    assert_eq!(*h.events.lock().unwrap(), vec!["tunnel", "inner"]);

    let relays = h.relays.lock().unwrap();
    assert_eq!(relays.len(), 1);
    assert!(relays[0].session().is_cancelled());
  }

  #[tokio::test]
  async fn test_cancel_before_dial() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let h = harness(HarnessOptions::default());
    let res = h.client.fetch("https://example.com/", &cancel).await;

    assert!(matches!(res, Err(MasqueError::Cancelled(Stage::TunnelDial))));
    assert!(h.events.lock().unwrap().is_empty());
  }
}
