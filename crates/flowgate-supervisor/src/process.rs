//! ProcessHandle — one supervised, restart-always role process.
//!
//! A background task owns the child. It probes liveness on every interval,
//! restarts the child on exit or sustained probe failure, and publishes the
//! lifecycle state on a watch channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use flowgate_core::{HealthStatus, ProcessState, ServiceRole};
use flowgate_health::{HealthTracker, ProbeResult, http_probe};

use crate::command::{ChildCommand, HealthProbe};
use crate::policy::{Backoff, RestartHistory, SupervisionPolicy};

/// Counters shared between the handle and its supervision task.
#[derive(Debug, Default)]
struct Counters {
    restarts: AtomicU32,
    pid: AtomicU32,
}

/// Handle to a supervised process.
pub struct ProcessHandle {
    role: ServiceRole,
    state_rx: watch::Receiver<ProcessState>,
    counters: Arc<Counters>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProcessHandle {
    /// Spawn the supervision task. The first launch happens immediately.
    pub fn spawn(command: ChildCommand, policy: SupervisionPolicy) -> Self {
        let role = command.role;
        let (state_tx, state_rx) = watch::channel(ProcessState::Starting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let task = tokio::spawn(supervise(
            command,
            policy,
            counters.clone(),
            state_tx,
            shutdown_rx,
        ));

        Self {
            role,
            state_rx,
            counters,
            shutdown_tx,
            task,
        }
    }

    pub fn role(&self) -> ServiceRole {
        self.role
    }

    pub fn state(&self) -> ProcessState {
        *self.state_rx.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state_rx.clone()
    }

    /// Restarts performed so far.
    pub fn restart_count(&self) -> u32 {
        self.counters.restarts.load(Ordering::SeqCst)
    }

    /// OS pid of the current child, if one is running.
    pub fn pid(&self) -> Option<u32> {
        match self.counters.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Wait until the process reaches `state`, or the timeout passes.
    pub async fn wait_for(&self, state: ProcessState, timeout: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == state))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Terminate the child (SIGTERM, then SIGKILL after the grace period) and
    /// end supervision.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(role = %self.role, error = %e, "supervision task panicked");
        }
    }
}

/// Why one incarnation of the child ended.
enum Ended {
    Exited(Option<i32>),
    Unhealthy,
    Shutdown,
}

async fn supervise(
    command: ChildCommand,
    policy: SupervisionPolicy,
    counters: Arc<Counters>,
    state_tx: watch::Sender<ProcessState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let role = command.role;
    let mut backoff = Backoff::new(policy.restart);
    let mut history = RestartHistory::new(policy.alert_window, policy.alert_threshold);

    loop {
        state_tx.send_replace(ProcessState::Starting);

        let ended = match command.spawn() {
            Ok(mut child) => {
                let pid = child.id().unwrap_or(0);
                counters.pid.store(pid, Ordering::SeqCst);
                info!(%role, pid, "process started");

                let ended = watch_child(
                    &command,
                    &policy,
                    &mut child,
                    &state_tx,
                    &mut backoff,
                    &mut shutdown,
                )
                .await;
                match ended {
                    Ended::Exited(_) => {}
                    Ended::Unhealthy | Ended::Shutdown => {
                        terminate(role, &mut child, policy.grace_period).await;
                    }
                }
                counters.pid.store(0, Ordering::SeqCst);
                ended
            }
            Err(e) => {
                error!(%role, error = %e, "process failed to start");
                Ended::Exited(None)
            }
        };

        match ended {
            Ended::Shutdown => break,
            Ended::Exited(code) => {
                warn!(%role, ?code, "process exited unexpectedly");
                state_tx.send_replace(ProcessState::Unhealthy);
                // Let watchers see Unhealthy before it is replaced.
                tokio::task::yield_now().await;
            }
            Ended::Unhealthy => {
                warn!(%role, "process unhealthy, restarting");
            }
        }

        state_tx.send_replace(ProcessState::Restarting);
        let restarts = counters.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        if history.record(Instant::now()) {
            error!(
                %role,
                restarts = history.recent(),
                window = ?policy.alert_window,
                total_restarts = restarts,
                "restart storm: process keeps failing"
            );
        }

        let delay = backoff.next_delay();
        debug!(%role, ?delay, restarts, "waiting before restart");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
    }

    state_tx.send_replace(ProcessState::Stopped);
    info!(%role, "process stopped");
}

/// Probe one running child until it exits, turns unhealthy, or shutdown.
async fn watch_child(
    command: &ChildCommand,
    policy: &SupervisionPolicy,
    child: &mut Child,
    state_tx: &watch::Sender<ProcessState>,
    backoff: &mut Backoff,
    shutdown: &mut watch::Receiver<bool>,
) -> Ended {
    let role = command.role;
    let started = Instant::now();
    let mut tracker = HealthTracker::new(policy.unhealthy_threshold);
    let mut reached_healthy = false;
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + policy.probe_interval,
        policy.probe_interval,
    );
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Shutdown requested before the child even started.
    if *shutdown.borrow() {
        return Ended::Shutdown;
    }

    loop {
        tokio::select! {
            status = child.wait() => {
                return Ended::Exited(status.ok().and_then(|s| s.code()));
            }
            _ = shutdown.changed() => {
                return Ended::Shutdown;
            }
            _ = ticker.tick() => {}
        }

        // The tick won the race, so the child had not exited when polled.
        let result = match &command.probe {
            HealthProbe::ProcessAlive => ProbeResult::Healthy,
            HealthProbe::Http { address, path } => {
                http_probe(address, path, policy.probe_timeout).await
            }
        };

        if result != ProbeResult::Healthy
            && !reached_healthy
            && started.elapsed() < policy.start_period
        {
            debug!(%role, ?result, "probe failed during start period");
            continue;
        }

        match tracker.record(result) {
            HealthStatus::Healthy => {
                if !reached_healthy {
                    reached_healthy = true;
                    backoff.reset();
                    info!(%role, "process healthy");
                }
                if *state_tx.borrow() != ProcessState::Healthy {
                    state_tx.send_replace(ProcessState::Healthy);
                }
            }
            HealthStatus::Unhealthy => {
                state_tx.send_replace(ProcessState::Unhealthy);
                return Ended::Unhealthy;
            }
            HealthStatus::Unknown => {}
        }
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(role: ServiceRole, child: &mut Child, grace: Duration) {
    let signalled = child.id().is_some_and(send_sigterm);
    if signalled {
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            debug!(%role, ?status, "process exited after SIGTERM");
            return;
        }
        warn!(%role, ?grace, "process ignored SIGTERM, killing");
    }
    if let Err(e) = child.kill().await {
        debug!(%role, error = %e, "kill failed, process already gone");
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: `pid` belongs to a child we spawned and have not reaped.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> bool {
    false
}
