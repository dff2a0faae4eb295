use crate::{
  constants::{H3_ALPN, INITIAL_PACKET_SIZE, INNER_INITIAL_PACKET_SIZE},
  keylog::KeyLogSink,
  trace::*,
};
use rustls::{
  DigitallySignedStruct, SignatureScheme,
  client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
  crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
  pki_types::{CertificateDer, ServerName, UnixTime},
};
use std::{sync::Arc, time::Duration};

/* ---------------------------------------------------------- */
#[derive(Debug, Clone)]
/// TLS settings of a single handshake.
/// The tunnel and the inner handshake each hold their own instance, patched per dial attempt.
pub struct SecurityConfig {
  /// Skip server certificate verification
  pub skip_verify: bool,
  /// ALPN protocol identifiers in preference order
  pub alpn_protocols: Vec<String>,
  /// Sink for TLS secrets, attached at dial time
  pub key_log: Option<Arc<KeyLogSink>>,
}

impl Default for SecurityConfig {
  fn default() -> Self {
    Self {
      skip_verify: false,
      alpn_protocols: vec![H3_ALPN.to_string()],
      key_log: None,
    }
  }
}

impl SecurityConfig {
  /// Set whether to skip server certificate verification
  pub fn with_skip_verify(mut self, skip_verify: bool) -> Self {
    self.skip_verify = skip_verify;
    self
  }

  /// Build the rustls client config
  pub(crate) fn build_rustls(&self) -> Result<rustls::ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone()).with_protocol_versions(&[&rustls::version::TLS13])?;

    let mut config = if self.skip_verify {
      warn!("Server certificate verification is disabled");
      builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification::new(provider)))
        .with_no_client_auth()
    } else {
      let mut roots = rustls::RootCertStore::empty();
      roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
      builder.with_root_certificates(roots).with_no_client_auth()
    };

    config.alpn_protocols = self.alpn_protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
    if let Some(key_log) = &self.key_log {
      config.key_log = key_log.clone() as Arc<dyn rustls::KeyLog>;
    }
    Ok(config)
  }

  /// Build the quinn client config combining this TLS config and the given transport config
  pub(crate) fn build_quinn_client(&self, transport: &TransportConfig) -> Result<quinn::ClientConfig, anyhow::Error> {
    let tls = self.build_rustls()?;
    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(Arc::new(transport.build_quinn()?));
    Ok(client_config)
  }
}

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// QUIC transport settings of a single connection
pub struct TransportConfig {
  /// Accept QUIC DATAGRAM frames (RFC 9221)
  pub datagrams_enabled: bool,
  /// Initial packet size in bytes, at least 1200
  pub initial_packet_size: u16,
  /// Probe the path MTU
  pub path_mtu_discovery: bool,
  /// Idle timeout, quinn's default when `None`
  pub max_idle_timeout: Option<Duration>,
}

impl Default for TransportConfig {
  fn default() -> Self {
    Self {
      datagrams_enabled: true,
      initial_packet_size: INITIAL_PACKET_SIZE,
      path_mtu_discovery: true,
      max_idle_timeout: None,
    }
  }
}

impl TransportConfig {
  /// Copy for the tunnel connection, which carries the proxied packets in datagrams
  pub fn for_tunnel(&self) -> Self {
    Self {
      datagrams_enabled: true,
      ..*self
    }
  }

  /// Copy for the inner connection.
  /// PMTUD over the tunnel would probe the datagram frame size of the outer connection, not a real path.
  /// Inner packets are capped so that they fit into the DATAGRAM frames of the outer connection.
  pub fn for_inner(&self) -> Self {
    Self {
      path_mtu_discovery: false,
      initial_packet_size: self.initial_packet_size.min(INNER_INITIAL_PACKET_SIZE),
      ..*self
    }
  }

  pub(crate) fn build_quinn(&self) -> Result<quinn::TransportConfig, anyhow::Error> {
    let mut transport = quinn::TransportConfig::default();
    transport.initial_mtu(self.initial_packet_size);
    if !self.path_mtu_discovery {
      transport.mtu_discovery_config(None);
    }
    if !self.datagrams_enabled {
      transport.datagram_receive_buffer_size(None);
    }
    if let Some(timeout) = self.max_idle_timeout {
      transport.max_idle_timeout(Some(quinn::IdleTimeout::try_from(timeout)?));
    }
    Ok(transport)
  }
}

/* ---------------------------------------------------------- */
#[derive(Debug)]
/// Certificate verifier accepting any server certificate, while still checking handshake signatures
struct SkipServerVerification {
  provider: Arc<CryptoProvider>,
}

impl SkipServerVerification {
  fn new(provider: Arc<CryptoProvider>) -> Self {
    Self { provider }
  }
}

impl ServerCertVerifier for SkipServerVerification {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer<'_>,
    _intermediates: &[CertificateDer<'_>],
    _server_name: &ServerName<'_>,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, rustls::Error> {
    verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, rustls::Error> {
    verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.provider.signature_verification_algorithms.supported_schemes()
  }
}
