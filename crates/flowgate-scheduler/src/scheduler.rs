//! SchedulerLoop — heartbeat, definition sync and run emission on a tick.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use flowgate_core::config::CoreSettings;
use flowgate_core::{ServiceRole, Settings};
use flowgate_store::{MetaStore, StoreError, Timestamp, WorkflowRun, epoch_secs};

use crate::definitions::{SyncReport, sync_definitions};
use crate::error::{SchedulerError, SchedulerResult};
use crate::schedule::Schedule;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub sync: SyncReport,
    /// Run ids queued by this tick.
    pub runs_queued: Vec<String>,
}

/// The scheduler role.
pub struct SchedulerLoop {
    store: MetaStore,
    core: CoreSettings,
    tick: Duration,
}

impl SchedulerLoop {
    pub fn new(store: MetaStore, settings: &Settings) -> Self {
        Self {
            store,
            core: settings.core.clone(),
            tick: settings.scheduler.tick,
        }
    }

    /// One scheduling pass at time `now`.
    pub async fn tick(&self, now: Timestamp) -> SchedulerResult<TickReport> {
        self.store
            .record_heartbeat(ServiceRole::SchedulerLoop.as_str(), now)
            .await?;

        let sync = sync_definitions(&self.store, &self.core, now).await?;

        let mut runs_queued = Vec::new();
        for def in self.store.list_workflows().await? {
            if def.is_paused {
                continue;
            }
            let Some(expr) = def.schedule.as_deref() else {
                continue;
            };
            let schedule = match expr.parse::<Schedule>() {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(workflow = %def.id, error = %e, "skipping workflow");
                    continue;
                }
            };

            let last = self.store.latest_run(&def.id).await?.map(|r| r.logical_ts);
            if !schedule.is_due(last, now) {
                continue;
            }
            let run = WorkflowRun::scheduled(&def.id, now);
            if self.store.insert_run(&run).await? {
                debug!(workflow = %def.id, run_id = %run.run_id, %schedule, "run queued");
                runs_queued.push(run.run_id);
            }
        }

        if !runs_queued.is_empty() || !sync.created.is_empty() || !sync.removed.is_empty() {
            info!(
                queued = runs_queued.len(),
                created = sync.created.len(),
                removed = sync.removed.len(),
                "scheduler tick"
            );
        }
        Ok(TickReport { sync, runs_queued })
    }

    /// Tick until `shutdown` flips to true.
    ///
    /// Refuses to start on an unmigrated schema. Errors inside a tick are
    /// logged and the next tick proceeds.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> SchedulerResult<()> {
        let version = self.store.ensure_schema_current().await.map_err(|e| match e {
            StoreError::SchemaNotMigrated(msg) => SchedulerError::SchemaNotReady(msg),
            other => SchedulerError::Store(other),
        })?;
        info!(
            tick_secs = self.tick.as_secs_f64(),
            schema_version = version,
            examples = self.core.load_examples,
            "scheduler loop started"
        );

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(epoch_secs()).await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
                _ = stopped(&mut shutdown) => {
                    info!("scheduler loop shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Resolves once shutdown is requested, even if it was requested before the
/// call, or once the sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    use flowgate_store::MIGRATIONS;

    async fn migrated_store() -> MetaStore {
        let store = MetaStore::in_memory().unwrap();
        for m in MIGRATIONS {
            store.apply_migration(m).await.unwrap();
        }
        store
    }

    fn settings(load_examples: bool, paused: bool) -> Settings {
        let mut s = Settings::default();
        s.core.load_examples = load_examples;
        s.core.workflows_paused_at_creation = paused;
        s.scheduler.tick = Duration::from_millis(20);
        s
    }

    #[tokio::test]
    async fn paused_workflows_get_no_runs() {
        let store = migrated_store().await;
        let sched = SchedulerLoop::new(store.clone(), &settings(true, true));
        let report = sched.tick(1000).await.unwrap();
        assert!(!report.sync.created.is_empty());
        assert!(report.runs_queued.is_empty());
    }

    #[tokio::test]
    async fn unpaused_workflows_run_once_per_period() {
        let store = migrated_store().await;
        let sched = SchedulerLoop::new(store.clone(), &settings(true, false));

        let first = sched.tick(1000).await.unwrap();
        assert_eq!(first.runs_queued.len(), first.sync.created.len());
        assert!(first.runs_queued.contains(&"scheduled__example_hourly_report__1000".to_string()));

        // Thirty minutes later only the 30m example is due again.
        let second = sched.tick(1000 + 1800).await.unwrap();
        assert_eq!(
            second.runs_queued,
            vec!["scheduled__example_short_interval__2800".to_string()]
        );

        // The @once example never runs again.
        let later = sched.tick(1000 + 30 * 86400).await.unwrap();
        assert!(!later.runs_queued.iter().any(|r| r.contains("example_setup_once")));
        assert_eq!(store.list_runs("example_setup_once").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_tick_twice_queues_nothing_new() {
        let store = migrated_store().await;
        let sched = SchedulerLoop::new(store, &settings(true, false));
        sched.tick(5000).await.unwrap();
        assert!(sched.tick(5000).await.unwrap().runs_queued.is_empty());
    }

    #[tokio::test]
    async fn examples_disabled_means_none_stored() {
        let store = migrated_store().await;
        let sched = SchedulerLoop::new(store.clone(), &settings(false, false));
        sched.tick(1000).await.unwrap();
        assert!(store.list_workflows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tick_writes_heartbeat() {
        let store = migrated_store().await;
        let sched = SchedulerLoop::new(store.clone(), &settings(false, true));
        sched.tick(4242).await.unwrap();
        assert_eq!(
            store
                .latest_heartbeat(ServiceRole::SchedulerLoop.as_str())
                .await
                .unwrap(),
            Some(4242)
        );
    }

    #[tokio::test]
    async fn run_refuses_unmigrated_schema() {
        let store = MetaStore::in_memory().unwrap();
        let sched = SchedulerLoop::new(store, &settings(true, true));
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(
            sched.run(rx).await,
            Err(SchedulerError::SchemaNotReady(_))
        ));
    }

    #[tokio::test]
    async fn run_ticks_until_shutdown() {
        let store = migrated_store().await;
        let sched = SchedulerLoop::new(store.clone(), &settings(true, true));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { sched.run(rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(
            store
                .latest_heartbeat(ServiceRole::SchedulerLoop.as_str())
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn run_returns_when_shutdown_was_already_requested() {
        let store = migrated_store().await;
        let sched = SchedulerLoop::new(store, &settings(false, true));
        let (tx, rx) = watch::channel(false);
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), sched.run(rx))
            .await
            .unwrap()
            .unwrap();
    }
}
