//! Bounded readiness probing.
//!
//! A [`ReadinessProber`] checks a dependency until it answers or the attempt
//! budget runs out. Every attempt is capped by its own timeout so a hung
//! connection cannot stall the probe past `attempts * (timeout + interval)`.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use flowgate_core::ReadinessState;
use flowgate_core::config::ReadinessSettings;
use flowgate_store::MetaStore;

/// Something a deployment has to wait for before starting dependents.
pub trait ReadinessTarget: Send + Sync {
    /// Human-readable name used in logs.
    fn describe(&self) -> String;

    /// One connectivity check. `Err` carries the reason for the log line.
    fn check(&self) -> impl Future<Output = Result<(), String>> + Send;
}

impl ReadinessTarget for MetaStore {
    fn describe(&self) -> String {
        format!("{} metadata store", self.backend())
    }

    fn check(&self) -> impl Future<Output = Result<(), String>> + Send {
        async move { self.ping().await.map_err(|e| e.to_string()) }
    }
}

/// A plain TCP endpoint, such as a database host before any driver is
/// involved.
#[derive(Debug, Clone)]
pub struct TcpTarget {
    address: String,
}

impl TcpTarget {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl ReadinessTarget for TcpTarget {
    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }

    fn check(&self) -> impl Future<Output = Result<(), String>> + Send {
        async move {
            tokio::net::TcpStream::connect(&self.address)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        }
    }
}

/// Repeatedly checks a target with a fixed interval and attempt budget.
pub struct ReadinessProber {
    interval: Duration,
    attempts: u32,
    timeout: Duration,
    state_tx: watch::Sender<ReadinessState>,
    attempts_made: u32,
    last_error: Option<String>,
}

impl ReadinessProber {
    pub fn new(settings: &ReadinessSettings) -> Self {
        Self::with_policy(settings.interval, settings.attempts, settings.timeout)
    }

    /// `attempts` counts every check, including the first; it is raised to 1.
    pub fn with_policy(interval: Duration, attempts: u32, timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(ReadinessState::Unknown);
        Self {
            interval,
            attempts: attempts.max(1),
            timeout,
            state_tx,
            attempts_made: 0,
            last_error: None,
        }
    }

    pub fn state(&self) -> ReadinessState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions from another task.
    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.state_tx.subscribe()
    }

    /// Checks performed by the most recent [`probe`](Self::probe).
    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    /// Reason the last failed check gave, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Probe until the target answers or the budget is spent.
    ///
    /// The first check runs immediately; later ones are spaced by the
    /// interval. Returns `Ready` or `Unreachable`, never blocks past the
    /// budget.
    pub async fn probe<T: ReadinessTarget>(&mut self, target: &T) -> ReadinessState {
        let name = target.describe();
        self.attempts_made = 0;
        self.last_error = None;
        self.state_tx.send_replace(ReadinessState::Probing);

        for attempt in 1..=self.attempts {
            if attempt > 1 {
                tokio::time::sleep(self.interval).await;
            }
            self.attempts_made = attempt;

            let outcome = match tokio::time::timeout(self.timeout, target.check()).await {
                Ok(result) => result,
                Err(_) => Err(format!("no answer within {:?}", self.timeout)),
            };

            match outcome {
                Ok(()) => {
                    info!(target_name = %name, attempt, "dependency ready");
                    self.state_tx.send_replace(ReadinessState::Ready);
                    return ReadinessState::Ready;
                }
                Err(reason) => {
                    debug!(
                        target_name = %name,
                        attempt,
                        of = self.attempts,
                        %reason,
                        "readiness check failed"
                    );
                    self.last_error = Some(reason);
                }
            }
        }

        warn!(
            target_name = %name,
            attempts = self.attempts,
            reason = self.last_error.as_deref().unwrap_or("unknown"),
            "dependency unreachable"
        );
        self.state_tx.send_replace(ReadinessState::Unreachable);
        ReadinessState::Unreachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    /// Fails until it has been called `succeed_on` times.
    struct Flaky {
        calls: AtomicU32,
        succeed_on: u32,
    }

    impl Flaky {
        fn new(succeed_on: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                succeed_on,
            }
        }
    }

    impl ReadinessTarget for Flaky {
        fn describe(&self) -> String {
            "flaky".into()
        }

        fn check(&self) -> impl Future<Output = Result<(), String>> + Send {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let ok = self.succeed_on != 0 && n >= self.succeed_on;
            async move { if ok { Ok(()) } else { Err(format!("call {n} refused")) } }
        }
    }

    /// Never answers.
    struct Hung;

    impl ReadinessTarget for Hung {
        fn describe(&self) -> String {
            "hung".into()
        }

        fn check(&self) -> impl Future<Output = Result<(), String>> + Send {
            std::future::pending()
        }
    }

    fn fast(attempts: u32) -> ReadinessProber {
        ReadinessProber::with_policy(Duration::from_millis(10), attempts, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn ready_on_first_attempt() {
        let mut prober = fast(5);
        assert_eq!(prober.state(), ReadinessState::Unknown);

        let state = prober.probe(&Flaky::new(1)).await;
        assert_eq!(state, ReadinessState::Ready);
        assert_eq!(prober.attempts_made(), 1);
        assert_eq!(prober.state(), ReadinessState::Ready);
    }

    #[tokio::test]
    async fn retries_until_ready() {
        let mut prober = fast(5);
        let target = Flaky::new(3);
        assert_eq!(prober.probe(&target).await, ReadinessState::Ready);
        assert_eq!(prober.attempts_made(), 3);
        assert_eq!(target.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let mut prober = fast(4);
        let target = Flaky::new(0);
        assert_eq!(prober.probe(&target).await, ReadinessState::Unreachable);
        assert_eq!(target.calls.load(Ordering::SeqCst), 4);
        assert_eq!(prober.last_error(), Some("call 4 refused"));
    }

    #[tokio::test]
    async fn hung_target_is_bounded_by_timeout() {
        let mut prober = fast(3);
        let started = Instant::now();
        assert_eq!(prober.probe(&Hung).await, ReadinessState::Unreachable);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(prober.last_error().unwrap().contains("no answer"));
    }

    #[tokio::test]
    async fn zero_attempts_still_checks_once() {
        let mut prober = fast(0);
        let target = Flaky::new(1);
        assert_eq!(prober.probe(&target).await, ReadinessState::Ready);
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribers_see_final_state() {
        let mut prober = fast(1);
        let rx = prober.subscribe();
        prober.probe(&Flaky::new(0)).await;
        assert_eq!(*rx.borrow(), ReadinessState::Unreachable);
    }

    #[tokio::test]
    async fn in_memory_store_is_ready() {
        let store = MetaStore::in_memory().unwrap();
        let mut prober = fast(1);
        assert_eq!(prober.probe(&store).await, ReadinessState::Ready);
    }

    #[tokio::test]
    async fn closed_tcp_port_is_unreachable() {
        let mut prober = fast(2);
        let target = TcpTarget::new("127.0.0.1:1");
        assert_eq!(prober.probe(&target).await, ReadinessState::Unreachable);
        assert_eq!(target.describe(), "tcp://127.0.0.1:1");
    }
}
