//! How a role process is launched and probed.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use flowgate_core::{ServiceRole, Settings};

use crate::error::{SupervisorError, SupervisorResult};

/// Liveness check for a running role process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthProbe {
    /// GET `path` on `address` must answer 2xx.
    Http { address: String, path: String },
    /// Alive as long as the process has not exited.
    ProcessAlive,
}

/// A command line plus environment for one role.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    pub role: ServiceRole,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub probe: HealthProbe,
}

impl ChildCommand {
    pub fn new(role: ServiceRole, program: impl Into<PathBuf>) -> Self {
        Self {
            role,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            probe: HealthProbe::ProcessAlive,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn probe(mut self, probe: HealthProbe) -> Self {
        self.probe = probe;
        self
    }

    /// `<program> <keyword>` for a control-plane role, carrying the whole
    /// configuration surface in its environment.
    ///
    /// The program is `supervisor.program` when set, else the running binary.
    pub fn for_role(role: ServiceRole, settings: &Settings) -> SupervisorResult<Self> {
        let keyword = role.command_keyword().ok_or_else(|| SupervisorError::Spawn {
            role,
            reason: "role has no command keyword".into(),
        })?;
        let program = match &settings.supervisor.program {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(|e| SupervisorError::Program(e.to_string()))?,
        };

        let probe = match role {
            ServiceRole::ApiServer => HealthProbe::Http {
                address: settings.webserver.probe_addr(),
                path: "/health".into(),
            },
            _ => HealthProbe::ProcessAlive,
        };

        let mut cmd = ChildCommand::new(role, program).arg(keyword).probe(probe);
        cmd.env = settings.to_env();
        Ok(cmd)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Start the process. It is killed if the handle is dropped.
    pub fn spawn(&self) -> SupervisorResult<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn {
                role: self.role,
                reason: format!("{}: {e}", self.program.display()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_server_gets_http_probe_and_keyword() {
        let mut settings = Settings::default();
        settings.supervisor.program = Some(PathBuf::from("/usr/local/bin/flowgated"));
        settings.webserver.port = 9090;

        let cmd = ChildCommand::for_role(ServiceRole::ApiServer, &settings).unwrap();
        assert_eq!(cmd.program(), Path::new("/usr/local/bin/flowgated"));
        assert_eq!(cmd.args, vec!["webserver".to_string()]);
        assert_eq!(
            cmd.probe,
            HealthProbe::Http {
                address: "127.0.0.1:9090".into(),
                path: "/health".into()
            }
        );
        assert!(
            cmd.env
                .iter()
                .any(|(k, v)| k == "FLOWGATE__WEBSERVER__PORT" && v == "9090")
        );
    }

    #[test]
    fn scheduler_is_probed_by_process_liveness() {
        let mut settings = Settings::default();
        settings.supervisor.program = Some(PathBuf::from("flowgated"));
        let cmd = ChildCommand::for_role(ServiceRole::SchedulerLoop, &settings).unwrap();
        assert_eq!(cmd.args, vec!["scheduler".to_string()]);
        assert_eq!(cmd.probe, HealthProbe::ProcessAlive);
    }

    #[test]
    fn store_role_cannot_be_launched() {
        let err = ChildCommand::for_role(ServiceRole::Store, &Settings::default()).unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { role: ServiceRole::Store, .. }));
    }

    #[test]
    fn program_defaults_to_running_binary() {
        let cmd = ChildCommand::for_role(ServiceRole::Initializer, &Settings::default()).unwrap();
        assert_eq!(cmd.program(), std::env::current_exe().unwrap());
        assert_eq!(cmd.args, vec!["version".to_string()]);
    }

    #[tokio::test]
    async fn spawn_reports_missing_program() {
        let cmd = ChildCommand::new(ServiceRole::SchedulerLoop, "/nonexistent/flowgated");
        assert!(matches!(cmd.spawn(), Err(SupervisorError::Spawn { .. })));
    }
}
