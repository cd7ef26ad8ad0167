//! Restart and alerting policy for supervised processes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use flowgate_core::config::{HealthSettings, SupervisorSettings};

/// Exponential restart delay bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (0-based): `initial * 2^attempt`,
    /// capped at `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Tracks consecutive restarts for one process.
#[derive(Debug)]
pub struct Backoff {
    policy: RestartPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RestartPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay for the next restart; each call grows the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Back to the initial delay once the process proved healthy.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Sliding window of restart times used to detect restart storms.
#[derive(Debug)]
pub struct RestartHistory {
    window: Duration,
    threshold: u32,
    restarts: VecDeque<Instant>,
}

impl RestartHistory {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            window,
            threshold,
            restarts: VecDeque::new(),
        }
    }

    /// Record a restart at `now`. Returns true when more than `threshold`
    /// restarts fall inside the window.
    pub fn record(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.restarts.front() {
            if now.duration_since(oldest) > self.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.restarts.push_back(now);
        self.restarts.len() > self.threshold as usize
    }

    /// Restarts currently inside the window.
    pub fn recent(&self) -> usize {
        self.restarts.len()
    }
}

/// Everything a supervision task needs to judge and restart its process.
#[derive(Debug, Clone)]
pub struct SupervisionPolicy {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub unhealthy_threshold: u32,
    pub start_period: Duration,
    pub restart: RestartPolicy,
    pub alert_window: Duration,
    pub alert_threshold: u32,
    pub grace_period: Duration,
}

impl SupervisionPolicy {
    /// Restart delays are capped at the health interval, so a process that
    /// keeps dying is relaunched within one interval of its exit.
    pub fn from_settings(health: &HealthSettings, supervisor: &SupervisorSettings) -> Self {
        let max = supervisor.restart_delay_max.min(health.interval);
        Self {
            probe_interval: health.interval,
            probe_timeout: health.timeout,
            unhealthy_threshold: health.unhealthy_threshold,
            start_period: health.start_period,
            restart: RestartPolicy {
                initial: supervisor.restart_delay.min(max),
                max,
            },
            alert_window: supervisor.alert_window,
            alert_threshold: supervisor.alert_threshold,
            grace_period: supervisor.grace_period,
        }
    }
}

impl Default for SupervisionPolicy {
    fn default() -> Self {
        Self::from_settings(&HealthSettings::default(), &SupervisorSettings::default())
    }
}
