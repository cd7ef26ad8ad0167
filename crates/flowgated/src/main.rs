//! flowgated — the flowgate bootstrap controller.
//!
//! One binary for every role of a deployment:
//! - `up`: probe the store, run the initializer once, then supervise the
//!   API server and scheduler as restart-always child processes
//! - `standalone`: the same startup graph with every role in this process
//! - `version` / `webserver` / `scheduler`: the role keywords a supervised
//!   child is started with
//! - `probe`: one bounded readiness probe of the store
//!
//! # Usage
//!
//! ```text
//! FLOWGATE__STORE__URL=postgres://flowgate:secret@db/flowgate \
//! _FLOWGATE_DB_UPGRADE=true _FLOWGATE_WWW_USER_CREATE=true \
//! _FLOWGATE_WWW_USER_PASSWORD=secret flowgated up
//! ```

mod deploy;
mod exit;
mod roles;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use flowgate_core::Settings;

const DEFAULT_FILTER: &str = "info,flowgated=debug,flowgate=debug";
const LOG_FORMAT_ENV: &str = "FLOWGATE_LOG_FORMAT";

#[derive(Parser)]
#[command(name = "flowgated", about = "flowgate bootstrap controller")]
struct Cli {
    /// TOML settings file; environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a deployment: store probe, initializer, supervised servers.
    Up,
    /// Run every role in this process (embedded or in-memory stores).
    Standalone,
    /// Initializer role: bootstrap when requested, then print the version.
    Version,
    /// API/UI server role.
    Webserver,
    /// Scheduler loop role.
    Scheduler,
    /// Probe the store once within the configured attempt budget.
    Probe,
    /// Print the effective settings as TOML.
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit::exit_code(&e);
            error!(error = %format!("{e:#}"), code, "flowgated failed");
            eprintln!("error: {e:#}");
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Up => deploy::run_up(settings).await,
        Command::Standalone => deploy::run_standalone(settings).await,
        Command::Version => roles::run_version(&settings).await,
        Command::Webserver => roles::run_webserver(&settings).await,
        Command::Scheduler => roles::run_scheduler(&settings).await,
        Command::Probe => roles::run_probe(&settings).await,
        Command::Config => roles::print_config(settings),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}
