//! Target endpoint resolution
//!
//! Extracts `host[:port]` from a URL (or a bare `host[:port]` authority) and resolves it to a socket address at dial time.

use crate::{constants::DEFAULT_PORT, error::MasqueError, trace::*};
use std::{fmt, net::SocketAddr};

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// Host and port of the target. The port is always concrete.
pub struct TargetEndpoint {
  /// Host name or IP literal, without brackets for IPv6
  host: String,
  port: u16,
}

impl TargetEndpoint {
  /// Create a new endpoint
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self { host: host.into(), port }
  }
  pub fn host(&self) -> &str {
    &self.host
  }
  pub fn port(&self) -> u16 {
    self.port
  }
  /// `host:port` with brackets around IPv6 literals
  pub fn authority(&self) -> String {
    if self.host.contains(':') {
      format!("[{}]:{}", self.host, self.port)
    } else {
      format!("{}:{}", self.host, self.port)
    }
  }
}

impl fmt::Display for TargetEndpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.authority())
  }
}

/// Parse the URL and extract its host and port, defaulting the port to 443 when absent.
/// A present but non-numeric or out of range port is malformed.
pub fn resolve_endpoint(input: &str) -> Result<TargetEndpoint, MasqueError> {
  let malformed = |reason: String| MasqueError::MalformedEndpoint {
    input: input.to_string(),
    reason,
  };
  let uri = input.parse::<http::Uri>().map_err(|e| malformed(e.to_string()))?;
  let authority = uri.authority().ok_or_else(|| malformed("missing host".to_string()))?;
  let (host, port) = split_host_port(authority.as_str()).map_err(|e| malformed(e.to_string()))?;
  let port = port.unwrap_or(DEFAULT_PORT);
  debug!("Resolved endpoint of {input}: host={host}, port={port}");
  Ok(TargetEndpoint::new(host, port))
}

/// Split an authority into host and optional port.
/// An empty port (`host:`) counts as absent.
fn split_host_port(authority: &str) -> Result<(&str, Option<u16>), &'static str> {
  let host_port = authority.rsplit_once('@').map(|(_, hp)| hp).unwrap_or(authority);

  let (host, port) = if let Some(rest) = host_port.strip_prefix('[') {
    let (host, after) = rest.split_once(']').ok_or("unterminated IPv6 literal")?;
    match after {
      "" => (host, None),
      after => (host, Some(after.strip_prefix(':').ok_or("unexpected characters after IPv6 literal")?)),
    }
  } else {
    match host_port.rsplit_once(':') {
      Some((host, port)) => (host, Some(port)),
      None => (host_port, None),
    }
  };

  if host.is_empty() {
    return Err("empty host");
  }
  let port = match port {
    None | Some("") => None,
    Some(port) => Some(port.parse::<u16>().map_err(|_| "invalid port")?),
  };
  Ok((host, port))
}

/* ---------------------------------------------------------- */
/// Resolves an endpoint to the socket address used for dialing
#[async_trait::async_trait]
pub trait AddressResolver: Send + Sync {
  async fn resolve(&self, endpoint: &TargetEndpoint) -> Result<SocketAddr, MasqueError>;
}

#[derive(Debug, Clone, Copy, Default)]
/// Resolver using the system resolver via tokio
pub struct SystemResolver;

#[async_trait::async_trait]
impl AddressResolver for SystemResolver {
  async fn resolve(&self, endpoint: &TargetEndpoint) -> Result<SocketAddr, MasqueError> {
    let failure = |reason: String| MasqueError::AddressResolutionFailure {
      host: endpoint.host().to_string(),
      reason,
    };
    let mut addrs = tokio::net::lookup_host((endpoint.host(), endpoint.port()))
      .await
      .map_err(|e| failure(e.to_string()))?;
    let addr = addrs.next().ok_or_else(|| failure("no address found".to_string()))?;
    debug!("{} resolved to {}", endpoint, addr);
    Ok(addr)
  }
}
