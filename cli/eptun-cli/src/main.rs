//! Entry point: loads the config, installs the global subscriber, and
//! runs one session to completion.

mod cli;

use anyhow::{Context as _, Result};
use clap::Parser as _;
use cli::Cli;
use eptun_config::SessionConfig;
use eptun_logging::{StderrSink, StdoutSink};
use eptun_session::SessionError;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) =
        eptun_logging::setup_global_subscriber(&config.logging.window_level, Arc::new(StdoutSink), Arc::new(StderrSink))
    {
        eprintln!("failed to install logging: {e}");
        return ExitCode::FAILURE;
    }

    if cli.dry_run {
        info!(?config, "config validated successfully, dry run requested");
        return ExitCode::SUCCESS;
    }

    let binary_dir = match std::env::current_exe()
        .context("failed to determine the running executable's directory")
        .and_then(|p| {
            p.parent()
                .map(Path::to_path_buf)
                .context("executable path has no parent directory")
        }) {
        Ok(dir) => dir,
        Err(e) => {
            error!(error = %e, "could not determine the binary directory");
            return ExitCode::FAILURE;
        }
    };
    let config_dir = match cli
        .config
        .parent()
        .map(Path::to_path_buf)
        .context("config path has no parent directory")
    {
        Ok(dir) => dir,
        Err(e) => {
            error!(error = %e, "could not determine the config directory");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            ctrl_c_cancel.cancel();
        }
    });

    match eptun_session::run(&config, &binary_dir, &config_dir, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "session ended with an error");
            exit_code_for(&e)
        }
    }
}

fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let text = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("failed to read config file {}", cli.config.display()))?;
    let mut config = SessionConfig::load(&text).context("failed to validate config")?;

    if cli.bypass_cn {
        config.bypass_cn = true;
    } else if cli.no_bypass_cn {
        config.bypass_cn = false;
    }

    Ok(config)
}

fn exit_code_for(e: &SessionError) -> ExitCode {
    match e {
        SessionError::HelperFailed { code: Some(code) } if *code >= 0 && *code < 256 => {
            ExitCode::from(*code as u8)
        }
        _ => ExitCode::FAILURE,
    }
}
