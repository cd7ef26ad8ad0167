//! ControlPlaneSupervisor — owns the supervised control-plane processes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use flowgate_core::{ProcessState, ServiceRole};

use crate::command::ChildCommand;
use crate::error::{SupervisorError, SupervisorResult};
use crate::policy::SupervisionPolicy;
use crate::process::ProcessHandle;

/// Point-in-time view of one supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStatus {
    pub role: ServiceRole,
    pub state: ProcessState,
    pub restarts: u32,
    pub pid: Option<u32>,
}

/// Supervises at most one process per control-plane role.
#[derive(Clone)]
pub struct ControlPlaneSupervisor {
    policy: SupervisionPolicy,
    processes: Arc<RwLock<HashMap<ServiceRole, ProcessHandle>>>,
}

impl ControlPlaneSupervisor {
    pub fn new(policy: SupervisionPolicy) -> Self {
        Self {
            policy,
            processes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start supervising `command.role`.
    pub async fn start(&self, command: ChildCommand) -> SupervisorResult<()> {
        let role = command.role;
        let mut processes = self.processes.write().await;
        if processes.contains_key(&role) {
            return Err(SupervisorError::AlreadySupervised(role));
        }
        info!(%role, program = %command.program().display(), "supervising process");
        processes.insert(role, ProcessHandle::spawn(command, self.policy.clone()));
        Ok(())
    }

    pub async fn status(&self, role: ServiceRole) -> SupervisorResult<ProcessStatus> {
        let processes = self.processes.read().await;
        let handle = processes
            .get(&role)
            .ok_or(SupervisorError::NotSupervised(role))?;
        Ok(ProcessStatus {
            role,
            state: handle.state(),
            restarts: handle.restart_count(),
            pid: handle.pid(),
        })
    }

    /// Status of every supervised process, ordered by role.
    pub async fn statuses(&self) -> Vec<ProcessStatus> {
        let processes = self.processes.read().await;
        let mut all: Vec<ProcessStatus> = processes
            .iter()
            .map(|(role, handle)| ProcessStatus {
                role: *role,
                state: handle.state(),
                restarts: handle.restart_count(),
                pid: handle.pid(),
            })
            .collect();
        all.sort_by_key(|s| s.role);
        all
    }

    /// Watch one process's lifecycle.
    pub async fn subscribe(
        &self,
        role: ServiceRole,
    ) -> SupervisorResult<tokio::sync::watch::Receiver<ProcessState>> {
        let processes = self.processes.read().await;
        processes
            .get(&role)
            .map(ProcessHandle::subscribe)
            .ok_or(SupervisorError::NotSupervised(role))
    }

    /// Stop one process and forget it.
    pub async fn stop(&self, role: ServiceRole) -> SupervisorResult<()> {
        let handle = self
            .processes
            .write()
            .await
            .remove(&role)
            .ok_or(SupervisorError::NotSupervised(role))?;
        handle.stop().await;
        Ok(())
    }

    /// Stop everything concurrently; each process gets its own grace period.
    pub async fn stop_all(&self) {
        let handles: Vec<ProcessHandle> = self
            .processes
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        let count = handles.len();
        let mut tasks = tokio::task::JoinSet::new();
        for handle in handles {
            tasks.spawn(handle.stop());
        }
        while tasks.join_next().await.is_some() {}
        info!(count, "all supervised processes stopped");
    }
}
