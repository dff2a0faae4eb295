mod config;
mod log;

use crate::{
  config::{Opts, parse_opts},
  log::*,
};
use rmasque_lib::*;
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
  init_logger();

  let opts = match parse_opts() {
    Ok(opts) => opts,
    Err(e) => {
      error!("Invalid options: {e}");
      std::process::exit(1);
    }
  };

  let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
  runtime_builder.enable_all();
  runtime_builder.thread_name("rmasque");
  let runtime = match runtime_builder.build() {
    Ok(runtime) => runtime,
    Err(e) => {
      error!("Failed to build the async runtime: {e}");
      std::process::exit(1);
    }
  };

  let exit_code = runtime.block_on(async {
    match run(opts).await {
      Ok(()) => 0,
      Err(e) => {
        error!("{e}");
        1
      }
    }
  });
  std::process::exit(exit_code);
}

/// Fetch the URL through the proxy and print the result
async fn run(opts: Opts) -> Result<(), anyhow::Error> {
  let capability = ProxyCapability::parse(&opts.template)?;
  if let Some(path) = opts.key_log.path() {
    info!("Logging TLS secrets to {:?}", path);
  }

  let client = MasqueClientBuilder::default()
    .capability(capability)
    .security(SecurityConfig::default().with_skip_verify(opts.insecure))
    .key_log(opts.key_log)
    .tunnel_dialer(MasqueTunnelDialer::default())
    .inner_dialer(QuicInnerDialer)
    .resolver(SystemResolver)
    .build()
    .map_err(MasqueBuildError::from)?;

  let cancel_token = CancellationToken::new();
  tokio::spawn({
    let cancel_token = cancel_token.clone();
    async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Interrupted, cancelling");
        cancel_token.cancel();
      }
    }
  });

  let response = client.fetch(&opts.url, &cancel_token).await?;
  info!("HTTP status: {}", response.status().as_u16());
  info!("{}", response.body_text());
  Ok(())
}
