use crate::{
  error::{MasqueError, Stage},
  trace::*,
};
use bytes::Bytes;
use std::borrow::Cow;
use tokio_util::sync::CancellationToken;

/* ---------------------------------------------------------- */
#[derive(Debug, Clone)]
/// Status and fully read body of a response
pub struct FetchedResponse {
  status: http::StatusCode,
  body: Bytes,
}

impl FetchedResponse {
  pub fn new(status: http::StatusCode, body: Bytes) -> Self {
    Self { status, body }
  }
  pub fn status(&self) -> http::StatusCode {
    self.status
  }
  pub fn body(&self) -> &Bytes {
    &self.body
  }
  /// Body as text, with invalid UTF-8 replaced
  pub fn body_text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }
}

/* ---------------------------------------------------------- */
/// Application transport able to carry a request
#[async_trait::async_trait]
pub trait SendRequest: Send {
  async fn send_request(&mut self, request: http::Request<()>) -> Result<FetchedResponse, MasqueError>;
}

/// Dial callback invoked by the executor when it needs a connection for the logical address.
/// The executor knows nothing about how the connection is reached.
#[async_trait::async_trait]
pub trait Dial: Send + Sync {
  type Connection: SendRequest;
  async fn dial(&self, cancel: &CancellationToken, authority: &str) -> Result<Self::Connection, MasqueError>;
}

/// Issue a single GET to the URL over a connection obtained from the dialer, and read the whole body
pub async fn execute<D: Dial>(url: &str, dialer: &D, cancel: &CancellationToken) -> Result<FetchedResponse, MasqueError> {
  let malformed = |reason: String| MasqueError::MalformedEndpoint {
    input: url.to_string(),
    reason,
  };
  let uri = url.parse::<http::Uri>().map_err(|e| malformed(e.to_string()))?;
  let authority = uri
    .authority()
    .ok_or_else(|| malformed("missing host".to_string()))?
    .to_string();
  let request = http::Request::get(uri).body(()).map_err(|e| malformed(e.to_string()))?;

  let mut connection = dialer.dial(cancel, &authority).await?;
  debug!("Connection to {authority} is ready, sending request");

  tokio::select! {
    biased;
    _ = cancel.cancelled() => Err(MasqueError::Cancelled(Stage::Request)),
    res = connection.send_request(request) => res,
  }
}
