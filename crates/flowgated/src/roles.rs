//! Single-role entry points, selected by the command keyword a supervised
//! child is started with.

use anyhow::Context;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use flowgate_api::ApiState;
use flowgate_core::{ReadinessState, Settings};
use flowgate_health::{ReadinessProber, ReadinessTarget};
use flowgate_init::Initializer;
use flowgate_scheduler::SchedulerLoop;
use flowgate_store::{MetaStore, redact_url};

use crate::exit::Fatal;

// ── Shared ─────────────────────────────────────────────────────

pub fn open_store(settings: &Settings) -> anyhow::Result<MetaStore> {
    let store = MetaStore::connect(&settings.store.url)
        .with_context(|| format!("opening store {}", redact_url(&settings.store.url)))?;
    info!(backend = store.backend(), url = %redact_url(&settings.store.url), "store opened");
    Ok(store)
}

/// Probe `store` within the readiness budget.
pub async fn wait_for_store(store: &MetaStore, settings: &Settings) -> anyhow::Result<()> {
    let mut prober = ReadinessProber::new(&settings.readiness);
    match prober.probe(store).await {
        ReadinessState::Ready => Ok(()),
        _ => Err(Fatal::StoreUnreachable {
            target: store.describe(),
            attempts: prober.attempts_made(),
            reason: prober.last_error().unwrap_or("unknown").to_string(),
        }
        .into()),
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

/// A shutdown channel flipped by [`shutdown_signal`].
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    let signal_tx = tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_tx.send_replace(true);
    });
    (tx, rx)
}

// ── Roles ──────────────────────────────────────────────────────

/// `version`: bootstrap the store when either first-run flag is set, then
/// print the version.
pub async fn run_version(settings: &Settings) -> anyhow::Result<()> {
    let bootstrap = &settings.bootstrap;
    if bootstrap.db_upgrade || bootstrap.user_create {
        let store = open_store(settings)?;
        wait_for_store(&store, settings).await?;
        let report = Initializer::new(store.clone(), bootstrap.clone())
            .initialize()
            .await;
        store.close().await;
        let report = report?;
        if !report.changed() {
            info!(schema_version = report.schema_version, "store already initialized");
        }
    }
    println!("{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

/// `webserver`: serve the API until a shutdown signal.
pub async fn run_webserver(settings: &Settings) -> anyhow::Result<()> {
    let store = open_store(settings)?;
    wait_for_store(&store, settings).await?;

    let listener = flowgate_api::bind(settings).await?;
    let (_tx, shutdown) = shutdown_channel();
    let result = flowgate_api::serve(listener, ApiState::new(store.clone(), settings), shutdown).await;
    store.close().await;
    result?;
    info!("API server stopped");
    Ok(())
}

/// `scheduler`: run the scheduler loop until a shutdown signal.
pub async fn run_scheduler(settings: &Settings) -> anyhow::Result<()> {
    let store = open_store(settings)?;
    wait_for_store(&store, settings).await?;

    let (_tx, shutdown) = shutdown_channel();
    let result = SchedulerLoop::new(store.clone(), settings).run(shutdown).await;
    store.close().await;
    result?;
    info!("scheduler stopped");
    Ok(())
}

/// `probe`: report store readiness as one JSON line.
pub async fn run_probe(settings: &Settings) -> anyhow::Result<()> {
    let store = open_store(settings)?;
    let mut prober = ReadinessProber::new(&settings.readiness);
    let state = prober.probe(&store).await;
    store.close().await;

    println!(
        "{}",
        json!({
            "target": store.describe(),
            "state": state,
            "attempts": prober.attempts_made(),
            "error": prober.last_error(),
        })
    );
    if state.is_ready() {
        Ok(())
    } else {
        Err(Fatal::StoreUnreachable {
            target: store.describe(),
            attempts: prober.attempts_made(),
            reason: prober.last_error().unwrap_or("unknown").to_string(),
        }
        .into())
    }
}

/// `config`: the effective settings, with the admin password masked.
pub fn print_config(mut settings: Settings) -> anyhow::Result<()> {
    if settings.bootstrap.password.is_some() {
        settings.bootstrap.password = Some("<redacted>".to_string());
    }
    settings.store.url = redact_url(&settings.store.url);
    print!("{}", toml::to_string_pretty(&settings)?);
    Ok(())
}
