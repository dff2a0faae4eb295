use anyhow::anyhow;
use clap::{Arg, ArgAction, builder::NonEmptyStringValueParser, error::ErrorKind};
use rmasque_lib::{KEY_LOG_FILE_ENV, KeyLogCoordinator};

/// Parsed options
pub struct Opts {
  /// URI template of the proxy's UDP proxying endpoint
  pub template: String,
  /// Skip certificate verification of both the proxy and the target
  pub insecure: bool,
  /// URL to fetch
  pub url: String,
  /// Key logging requested through the environment
  pub key_log: KeyLogCoordinator,
}

fn command() -> clap::Command {
  let _ = include_str!("../../Cargo.toml");
  clap::command!()
    .arg(
      Arg::new("template")
        .long("template")
        .short('t')
        .value_name("TEMPLATE")
        .required(true)
        .value_parser(NonEmptyStringValueParser::new())
        .help("URI template of the proxy like https://proxy.example:4443/masque{?target_host,target_port}"),
    )
    .arg(
      Arg::new("insecure")
        .long("insecure")
        .action(ArgAction::SetTrue)
        .help("Skip TLS certificate verification"),
    )
    .arg(Arg::new("url").value_name("URL").required(true).help("URL to fetch through the proxy"))
    .after_help(format!(
      "Set {KEY_LOG_FILE_ENV} to a file path to log TLS secrets of both the proxy and the target connections."
    ))
}

/// Parse arg values passed from cli
pub fn parse_opts() -> Result<Opts, anyhow::Error> {
  let mut command = command();
  let matches = match command.try_get_matches_from_mut(std::env::args_os()) {
    Ok(matches) => matches,
    Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
    Err(e) => {
      eprint!("{}", error_text(&mut command, &e));
      std::process::exit(e.exit_code());
    }
  };

  ///////////////////////////////////
  let template = matches
    .get_one::<String>("template")
    .ok_or_else(|| anyhow!("template is required"))?
    .to_owned();
  let insecure = matches.get_flag("insecure");
  let url = matches
    .get_one::<String>("url")
    .ok_or_else(|| anyhow!("url is required"))?
    .to_owned();
  let key_log = KeyLogCoordinator::from_env_value(std::env::var_os(KEY_LOG_FILE_ENV));

  Ok(Opts {
    template,
    insecure,
    url,
    key_log,
  })
}

/// Error text of a usage error, always followed by the usage line
fn error_text(command: &mut clap::Command, e: &clap::Error) -> String {
  let text = e.render().to_string();
  if text.contains("Usage:") {
    text
  } else {
    format!("{text}\n{}\n", command.render_usage())
  }
}
