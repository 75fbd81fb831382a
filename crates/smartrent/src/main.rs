mod cli;
mod commands;
mod error;
mod output;

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use smartrent_config::{Config, LogLevel, Profile};
use smartrent_core::{Controller, ControllerConfig};

use crate::cli::{Cli, Command, GlobalOpts};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = smartrent_config::load_config_or_default();
    init_tracing(cli.global.verbose, configured_level(&cli.global, &cfg));

    if let Err(err) = run(cli, cfg).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

/// The profile's log level, else the global default.
fn configured_level(global: &GlobalOpts, cfg: &Config) -> LogLevel {
    let name = cfg.active_profile_name(global.profile.as_deref());
    cfg.profiles
        .get(&name)
        .and_then(|p| p.log_level)
        .unwrap_or(cfg.defaults.log_level)
}

fn init_tracing(verbosity: u8, configured: LogLevel) {
    let filter = match verbosity {
        0 => configured.as_filter(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli, cfg: Config) -> Result<(), CliError> {
    let profile_name = cfg.active_profile_name(cli.global.profile.as_deref());

    match cli.command {
        // Local commands never open a session.
        Command::Config(args) => commands::config_cmd::handle(args, &cfg, &profile_name, &cli.global),
        Command::Totp => commands::totp::handle(&cfg, &profile_name, &cli.global),
        Command::Completions { shell } => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "smartrent", &mut std::io::stdout());
            Ok(())
        }

        cmd => {
            let config = build_controller_config(&cfg, &profile_name, &cli.global, &cmd)?;
            let controller = Controller::connect(config)
                .await
                .map_err(|e| CliError::from(e).for_profile(&profile_name))?;

            tracing::debug!(command = ?cmd, "dispatching command");
            let result = commands::dispatch(cmd, &controller, &cli.global).await;
            controller.shutdown().await;
            result.map_err(|e| e.for_profile(&profile_name))
        }
    }
}

/// Build a `ControllerConfig` from the profile and CLI overrides.
fn build_controller_config(
    cfg: &Config,
    profile_name: &str,
    global: &GlobalOpts,
    cmd: &Command,
) -> Result<ControllerConfig, CliError> {
    let mut profile = match cfg.profile(profile_name) {
        Ok(profile) => profile.clone(),
        Err(_) if global.email.is_some() => Profile::default(),
        Err(e) if global.profile.is_some() => return Err(e.into()),
        Err(_) => {
            return Err(CliError::NoConfig {
                path: smartrent_config::config_path().display().to_string(),
            });
        }
    };
    if let Some(ref email) = global.email {
        profile.email.clone_from(email);
    }

    // A single-device command only needs that device; skip discovery.
    if profile.device_ids.is_empty() {
        if let Some(id) = cmd.target_device() {
            profile.device_ids = vec![id.to_owned()];
        }
    }

    let mut config = smartrent_config::profile_to_controller_config(&profile, profile_name, &cfg.defaults)?;
    config.connect_timeout = Duration::from_secs(global.timeout);
    Ok(config)
}
