//! Whole-deployment modes built on the startup graph.
//!
//! ```text
//! store ─► initializer ─┬─► api_server
//!                       └─► scheduler_loop
//! ```
//!
//! `up` runs the initializer and both servers as child processes; the
//! servers stay under restart-always supervision until shutdown.
//! `standalone` runs every role as a task in this process over one shared
//! store handle.

use anyhow::{Context, bail};
use tokio::sync::watch;
use tracing::{info, warn};

use flowgate_api::ApiState;
use flowgate_core::{ServiceRole, Settings};
use flowgate_init::{InitError, Initializer};
use flowgate_scheduler::SchedulerLoop;
use flowgate_store::{MetaStore, StoreError, latest_version};
use flowgate_supervisor::{
    ChildCommand, ControlPlaneSupervisor, StartupGraph, StartupReport, SupervisionPolicy,
    run_once_within,
};

use crate::exit::Fatal;
use crate::roles::{open_store, shutdown_channel, wait_for_store};

const STORE_DEPS: &[ServiceRole] = &[ServiceRole::Store];
const SERVER_DEPS: &[ServiceRole] = &[ServiceRole::Store, ServiceRole::Initializer];

/// Turn the first failed node into an error carrying its exit code.
fn check_report(report: &StartupReport) -> anyhow::Result<()> {
    match report.first_failure() {
        Some((role, reason)) => Err(Fatal::Startup {
            role,
            reason: reason.to_string(),
        }
        .into()),
        None => Ok(()),
    }
}

// ── up ─────────────────────────────────────────────────────────

/// Start a deployment of supervised child processes.
///
/// Children each open their own store connection, so the store must be
/// one several processes can share.
pub async fn run_up(settings: Settings) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    if store.backend() != "postgres" {
        bail!(
            "`up` runs each role in its own process and needs a postgres:// store; \
             use `standalone` for the {} backend",
            store.backend()
        );
    }
    info!(examples = settings.core.load_examples, "deployment starting");

    let supervisor =
        ControlPlaneSupervisor::new(SupervisionPolicy::from_settings(&settings.health, &settings.supervisor));
    let (_shutdown_tx, shutdown) = shutdown_channel();

    let init_cmd = ChildCommand::for_role(ServiceRole::Initializer, &settings)?;
    let api_cmd = ChildCommand::for_role(ServiceRole::ApiServer, &settings)?;
    let sched_cmd = ChildCommand::for_role(ServiceRole::SchedulerLoop, &settings)?;

    let graph = StartupGraph::new()
        .node(ServiceRole::Store, &[], {
            let store = store.clone();
            let settings = settings.clone();
            move || async move { wait_for_store(&store, &settings).await }
        })
        .node(ServiceRole::Initializer, STORE_DEPS, {
            let store = store.clone();
            let shutdown = shutdown.clone();
            let limit = settings.supervisor.init_timeout;
            move || async move {
                run_once_within(&init_cmd, limit, shutdown).await?;
                // The child succeeds without touching the schema when both
                // bootstrap flags are off; the servers still need it current.
                ensure_schema_current(&store).await
            }
        })
        .node(ServiceRole::ApiServer, SERVER_DEPS, {
            let supervisor = supervisor.clone();
            move || async move { Ok(supervisor.start(api_cmd).await?) }
        })
        .node(ServiceRole::SchedulerLoop, SERVER_DEPS, {
            let supervisor = supervisor.clone();
            move || async move { Ok(supervisor.start(sched_cmd).await?) }
        });

    let report = graph.run().await?;
    if let Err(e) = check_report(&report) {
        supervisor.stop_all().await;
        store.close().await;
        return Err(e);
    }
    info!(started = ?report.started(), "deployment up");

    let mut shutdown = shutdown;
    let _ = shutdown.wait_for(|stop| *stop).await;

    info!("stopping control plane");
    supervisor.stop_all().await;
    store.close().await;
    info!("deployment stopped");
    Ok(())
}

async fn ensure_schema_current(store: &MetaStore) -> anyhow::Result<()> {
    match store.ensure_schema_current().await {
        Ok(version) => {
            info!(schema_version = version, "schema current");
            Ok(())
        }
        Err(StoreError::SchemaNotMigrated(_)) => {
            let current = store.schema_version().await?;
            Err(InitError::SchemaOutdated {
                current,
                latest: latest_version(),
            }
            .into())
        }
        Err(e) => Err(e.into()),
    }
}

// ── standalone ─────────────────────────────────────────────────

/// Run every role in this process until a shutdown signal.
pub async fn run_standalone(settings: Settings) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let (shutdown_tx, _shutdown) = shutdown_channel();
    info!(
        backend = store.backend(),
        examples = settings.core.load_examples,
        "standalone deployment starting"
    );

    let report = standalone_graph(store.clone(), settings, shutdown_tx).run().await;
    store.close().await;

    check_report(&report?)?;
    info!("standalone deployment stopped");
    Ok(())
}

/// The in-process startup graph.
///
/// Server nodes run until `shutdown` flips to true. There is no restart
/// supervision in one process, so a server that stops for any reason flips
/// it for its sibling too.
pub fn standalone_graph(
    store: MetaStore,
    settings: Settings,
    shutdown: watch::Sender<bool>,
) -> StartupGraph {
    StartupGraph::new()
        .node(ServiceRole::Store, &[], {
            let store = store.clone();
            let settings = settings.clone();
            move || async move { wait_for_store(&store, &settings).await }
        })
        .node(ServiceRole::Initializer, STORE_DEPS, {
            let store = store.clone();
            let bootstrap = settings.bootstrap.clone();
            move || async move {
                Initializer::new(store, bootstrap)
                    .initialize()
                    .await
                    .context("bootstrap")?;
                Ok(())
            }
        })
        .node(ServiceRole::ApiServer, SERVER_DEPS, {
            let state = ApiState::new(store.clone(), &settings);
            let settings = settings.clone();
            let shutdown = shutdown.clone();
            move || async move {
                let result = match flowgate_api::bind(&settings).await {
                    Ok(listener) => flowgate_api::serve(listener, state, shutdown.subscribe()).await,
                    Err(e) => Err(e),
                };
                stop_sibling(&shutdown, ServiceRole::ApiServer);
                Ok(result?)
            }
        })
        .node(ServiceRole::SchedulerLoop, SERVER_DEPS, {
            let scheduler = SchedulerLoop::new(store, &settings);
            move || async move {
                let result = scheduler.run(shutdown.subscribe()).await;
                stop_sibling(&shutdown, ServiceRole::SchedulerLoop);
                Ok(result?)
            }
        })
}

fn stop_sibling(shutdown: &watch::Sender<bool>, role: ServiceRole) {
    if !shutdown.send_replace(true) {
        warn!(%role, "server stopped before shutdown, stopping the rest");
    }
}
