/// Error for RFC 6570 URI templates
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
  #[error("Invalid URI template: {0}")]
  Invalid(#[from] iri_string::template::Error),
  #[error("Failed to write the expansion of {0}")]
  Expansion(String),
}

/// Error for HTTP Datagram payloads carrying UDP proxying data
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DatagramError {
  #[error("Datagram is too short to contain a context id")]
  Truncated,
  #[error("Unknown context id: {0}")]
  UnknownContextId(u64),
  #[error("Value {0} exceeds the variable-length integer range")]
  VarintOverflow(u64),
}
