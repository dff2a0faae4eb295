use crate::{config::SecurityConfig, error::MasqueError, trace::*};
use std::{
  ffi::OsString,
  fmt::Write as _,
  fs::{File, OpenOptions},
  io::Write,
  path::{Path, PathBuf},
  sync::{Arc, Mutex},
};

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, Default)]
/// Optional TLS secret logging shared by the tunnel and the inner handshakes.
/// Every handshake attempt opens its own append handle to the same file.
pub struct KeyLogCoordinator {
  path: Option<PathBuf>,
}

impl KeyLogCoordinator {
  /// No key logging
  pub fn disabled() -> Self {
    Self { path: None }
  }

  /// Log secrets to the given file
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: Some(path.into()) }
  }

  /// Build from the value of the `SSLKEYLOGFILE` variable, where unset or empty disables logging
  pub fn from_env_value(value: Option<OsString>) -> Self {
    match value {
      Some(v) if !v.is_empty() => Self::new(v),
      _ => Self::disabled(),
    }
  }

  /// Key log file path if enabled
  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  /// Open a fresh sink for a single handshake attempt
  pub fn open_sink(&self) -> Result<Option<Arc<KeyLogSink>>, MasqueError> {
    let Some(path) = &self.path else {
      return Ok(None);
    };
    let sink = KeyLogSink::open(path)?;
    debug!("Opened key log file {:?}", path);
    Ok(Some(Arc::new(sink)))
  }

  /// Clone the security config and attach a fresh sink to the copy.
  /// The base config is never touched.
  pub fn attach(&self, base: &SecurityConfig) -> Result<SecurityConfig, MasqueError> {
    let mut config = base.clone();
    if let Some(sink) = self.open_sink()? {
      config.key_log = Some(sink);
    }
    Ok(config)
  }
}

/* ---------------------------------------------------------- */
#[derive(Debug)]
/// Append-mode writer of NSS key log records
/// https://firefox-source-docs.mozilla.org/security/nss/legacy/key_log_format/index.html
pub struct KeyLogSink {
  path: PathBuf,
  file: Mutex<File>,
}

impl KeyLogSink {
  fn open(path: &Path) -> Result<Self, MasqueError> {
    let mut options = OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    {
      use std::os::unix::fs::OpenOptionsExt;
      options.mode(0o600);
    }
    let file = options.open(path).map_err(|source| MasqueError::DiagnosticSinkUnavailable {
      path: path.to_path_buf(),
      source,
    })?;
    Ok(Self {
      path: path.to_path_buf(),
      file: Mutex::new(file),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Write a single record in one call so that records from concurrent handshakes never interleave
  fn write_record(&self, label: &str, client_random: &[u8], secret: &[u8]) {
    let mut line = String::with_capacity(label.len() + 2 * (client_random.len() + secret.len()) + 3);
    line.push_str(label);
    line.push(' ');
    for b in client_random {
      let _ = write!(line, "{b:02x}");
    }
    line.push(' ');
    for b in secret {
      let _ = write!(line, "{b:02x}");
    }
    line.push('\n');

    let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
    if let Err(e) = file.write_all(line.as_bytes()) {
      warn!("Failed to write key log to {:?}: {}", self.path, e);
    }
  }
}

impl rustls::KeyLog for KeyLogSink {
  fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
    self.write_record(label, client_random, secret);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rustls::KeyLog;

  fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("rmasque-keylog-{}-{}", std::process::id(), name))
  }

  #[test]
  fn test_disabled_attaches_nothing() {
    let coordinator = KeyLogCoordinator::from_env_value(None);
    assert!(coordinator.path().is_none());
    let config = coordinator.attach(&SecurityConfig::default()).unwrap();
    assert!(config.key_log.is_none());

    let coordinator = KeyLogCoordinator::from_env_value(Some(OsString::new()));
    assert!(coordinator.path().is_none());
  }

  #[test]
  fn test_nss_record_format() {
    let path = temp_path("format");
    let _ = std::fs::remove_file(&path);

    let sink = KeyLogCoordinator::new(&path).open_sink().unwrap().unwrap();
    sink.log("CLIENT_HANDSHAKE_TRAFFIC_SECRET", &[0x01, 0xab], &[0xff, 0x00, 0x10]);

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents, "CLIENT_HANDSHAKE_TRAFFIC_SECRET 01ab ff0010\n");
    let _ = std::fs::remove_file(&path);
  }

  #[test]
  fn test_each_handshake_gets_independent_sink() {
    let path = temp_path("independent");
    let _ = std::fs::remove_file(&path);
    let coordinator = KeyLogCoordinator::new(&path);
    let base = SecurityConfig::default();

    let tunnel = coordinator.attach(&base).unwrap();
    let inner = coordinator.attach(&base).unwrap();
    assert!(base.key_log.is_none());

    let tunnel_sink = tunnel.key_log.clone().unwrap();
    let inner_sink = inner.key_log.clone().unwrap();
    assert!(!Arc::ptr_eq(&tunnel_sink, &inner_sink));

    tunnel_sink.log("TUNNEL_SENTINEL", &[0x01], &[0x02]);
    inner_sink.log("INNER_SENTINEL", &[0x03], &[0x04]);
    tunnel_sink.log("TUNNEL_SENTINEL", &[0x05], &[0x06]);

    // appended in write order, each record intact
    let contents = std::fs::read_to_string(&path).unwrap();
    let lines = contents.lines().collect::<Vec<_>>();
    assert_eq!(
      lines,
      vec!["TUNNEL_SENTINEL 01 02", "INNER_SENTINEL 03 04", "TUNNEL_SENTINEL 05 06"]
    );
    let _ = std::fs::remove_file(&path);
  }

  #[test]
  fn test_separate_files_do_not_cross() {
    let tunnel_path = temp_path("tunnel-only");
    let inner_path = temp_path("inner-only");
    let _ = std::fs::remove_file(&tunnel_path);
    let _ = std::fs::remove_file(&inner_path);

    let base = SecurityConfig::default();
    let tunnel = KeyLogCoordinator::new(&tunnel_path).attach(&base).unwrap();
    let inner = KeyLogCoordinator::new(&inner_path).attach(&tunnel).unwrap();

    tunnel.key_log.as_ref().unwrap().log("TUNNEL_SENTINEL", &[0xaa], &[0xbb]);
    inner.key_log.as_ref().unwrap().log("INNER_SENTINEL", &[0xcc], &[0xdd]);

    assert_eq!(std::fs::read_to_string(&tunnel_path).unwrap(), "TUNNEL_SENTINEL aa bb\n");
    assert_eq!(std::fs::read_to_string(&inner_path).unwrap(), "INNER_SENTINEL cc dd\n");
    assert_eq!(inner.key_log.as_ref().unwrap().path(), inner_path.as_path());
    let _ = std::fs::remove_file(&tunnel_path);
    let _ = std::fs::remove_file(&inner_path);
  }

  #[test]
  fn test_unopenable_file_is_fatal() {
    let path = temp_path("missing-dir").join("nested").join("keys.log");
    let res = KeyLogCoordinator::new(&path).attach(&SecurityConfig::default());
    match res {
      Err(MasqueError::DiagnosticSinkUnavailable { path: p, .. }) => assert_eq!(p, path),
      other => panic!("unexpected result: {other:?}"),
    }
  }
}
