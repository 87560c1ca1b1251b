mod capabilities;
mod channel;
mod checks;
mod child;
mod cli;
mod config;
mod context;
mod error;
mod exec;
mod handshake;
mod idmap;
mod rootfs;
mod sandbox;
mod seccomp;
mod spawner;
mod stack;
mod utils;

use clap::Parser;
use cli::Cli;
use config::IsolationConfig;
use context::HostContext;
use error::SpawnError;
use sandbox::Sandbox;
use std::process::ExitCode;
use tracing::{debug, error};
use tracing_subscriber::{EnvFilter, fmt};

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let config = IsolationConfig::from(Cli::parse());
    init_logging(config.debug);

    match HostContext::init() {
        Ok(context) => debug!(
            ruid = %context.ruid(),
            euid = %context.euid(),
            rgid = %context.rgid(),
            egid = %context.egid(),
            level = %context.privilege_level(),
            "host context"
        ),
        Err(error) => {
            error!("{error:#}");
            return ExitCode::FAILURE;
        }
    }

    debug!(?config, "configuration");

    let result = Sandbox::new(config).and_then(|sandbox| sandbox.spawn());

    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(error) => {
            report(&error);
            ExitCode::from(u8::try_from(error.exit_code()).unwrap_or(1))
        }
    }
}

fn report(error: &SpawnError) {
    match error {
        SpawnError::Setup(inner) => error!("{inner:#}"),
        SpawnError::Handshake(inner) => error!("{error}: {inner}"),
        // The child reports its own failures before exiting.
        SpawnError::Child(_) => debug!("{error}"),
    }
}
