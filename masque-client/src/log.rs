#![allow(unused)]
pub use tracing::{debug, error, info, warn};

use std::str::FromStr;
use tracing_subscriber::{fmt, prelude::*};

/// Initialize the logger writing to stderr.
/// Crates in this workspace emit at the `RUST_LOG` level, dependencies only at INFO or above.
pub fn init_logger() {
  let level_string = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
  let level = tracing::Level::from_str(level_string.as_str()).unwrap_or(tracing::Level::INFO);

  // prefix shared by the binary and the library crates of this workspace
  let passed_pkg_names = [env!("CARGO_PKG_NAME").replace('-', "_")];

  let stdio_layer = fmt::layer()
    .with_writer(std::io::stderr)
    .with_line_number(false)
    .with_thread_ids(false)
    .with_thread_names(false)
    .with_target(level > tracing::Level::INFO)
    .with_level(true)
    .compact()
    .with_filter(tracing_subscriber::filter::filter_fn(move |metadata| {
      (passed_pkg_names
        .iter()
        .any(|pkg_name| metadata.target().starts_with(pkg_name))
        && metadata.level() <= &level)
        || metadata.level() <= &tracing::Level::INFO.min(level)
    }));

  let reg = tracing_subscriber::registry().with(stdio_layer);
  reg.init();
}
