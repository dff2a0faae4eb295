use std::{fmt, path::PathBuf};

/// Stage of the tunneled fetch, used to classify cancellations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  /// Resolving the target and opening the tunnel through the proxy
  TunnelDial,
  /// Handshaking with the target over the tunnel
  InnerDial,
  /// Exchanging the request and response
  Request,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Stage::TunnelDial => write!(f, "tunnel dial"),
      Stage::InnerDial => write!(f, "inner dial"),
      Stage::Request => write!(f, "request"),
    }
  }
}

/// Errors that happens during the tunneled fetch
#[derive(thiserror::Error, Debug)]
pub enum MasqueError {
  /* --------------------------------------- */
  #[error("Malformed endpoint {input:?}: {reason}")]
  MalformedEndpoint { input: String, reason: String },

  #[error("Failed to resolve address of {host}: {reason}")]
  AddressResolutionFailure { host: String, reason: String },

  /* --------------------------------------- */
  /// Key log file was requested but cannot be opened
  #[error("Failed to open key log file {path:?}: {source}")]
  DiagnosticSinkUnavailable { path: PathBuf, source: std::io::Error },

  /* --------------------------------------- */
  #[error("Invalid proxy capability template: {0}")]
  InvalidCapability(String),

  #[error("Failed to establish the tunnel: {0}")]
  TunnelEstablishmentFailure(String),

  #[error("Inner handshake failed: {0}")]
  InnerHandshakeFailure(String),

  #[error("Request failed: {0}")]
  RequestFailure(String),

  /* --------------------------------------- */
  #[error("Cancelled during {0}")]
  Cancelled(Stage),
}

impl MasqueError {
  /// Check if the error was caused by cancellation
  pub fn is_cancelled(&self) -> bool {
    matches!(self, MasqueError::Cancelled(_))
  }

  pub(crate) fn tunnel(e: impl fmt::Display) -> Self {
    MasqueError::TunnelEstablishmentFailure(e.to_string())
  }

  pub(crate) fn inner_handshake(e: impl fmt::Display) -> Self {
    MasqueError::InnerHandshakeFailure(e.to_string())
  }

  pub(crate) fn request(e: impl fmt::Display) -> Self {
    MasqueError::RequestFailure(e.to_string())
  }
}

/// Errors that happens during building the client
#[derive(thiserror::Error, Debug)]
pub enum MasqueBuildError {
  /// Client builder error
  #[error("Client builder error: {0}")]
  MasqueClientBuilderError(#[from] crate::client::MasqueClientBuilderError),
}
