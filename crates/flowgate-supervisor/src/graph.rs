//! StartupGraph — explicit dependency ordering between roles.
//!
//! Each node runs only after every dependency's runner returned `Ok`. A
//! failed dependency marks its dependents `Skipped`, transitively, so a store
//! that never becomes ready means no server role is ever started.
//!
//! Nodes with no path between them run concurrently.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use flowgate_core::ServiceRole;

use crate::error::{GraphError, GraphResult};

type NodeFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Runner = Box<dyn FnOnce() -> NodeFuture + Send>;

/// How a node ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    Succeeded,
    Failed(String),
    /// Never started because a dependency did not succeed.
    Skipped { failed_dependency: ServiceRole },
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, NodeOutcome::Succeeded)
    }
}

/// Result of running a graph.
#[derive(Debug, Default)]
pub struct StartupReport {
    outcomes: BTreeMap<ServiceRole, NodeOutcome>,
    started: Vec<ServiceRole>,
}

impl StartupReport {
    pub fn outcome(&self, role: ServiceRole) -> Option<&NodeOutcome> {
        self.outcomes.get(&role)
    }

    pub fn outcomes(&self) -> impl Iterator<Item = (ServiceRole, &NodeOutcome)> {
        self.outcomes.iter().map(|(role, outcome)| (*role, outcome))
    }

    /// Roles in the order their runners were started.
    pub fn started(&self) -> &[ServiceRole] {
        &self.started
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.values().all(NodeOutcome::is_success)
    }

    /// The first failed node in role order, with its message.
    pub fn first_failure(&self) -> Option<(ServiceRole, &str)> {
        self.outcomes.iter().find_map(|(role, outcome)| match outcome {
            NodeOutcome::Failed(msg) => Some((*role, msg.as_str())),
            _ => None,
        })
    }
}

struct Node {
    role: ServiceRole,
    depends_on: Vec<ServiceRole>,
    runner: Runner,
}

/// A DAG of role runners.
#[derive(Default)]
pub struct StartupGraph {
    nodes: Vec<Node>,
}

impl StartupGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Validation happens in [`validate`](Self::validate) and
    /// [`run`](Self::run).
    pub fn node<F, Fut>(mut self, role: ServiceRole, depends_on: &[ServiceRole], runner: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.nodes.push(Node {
            role,
            depends_on: depends_on.to_vec(),
            runner: Box::new(move || Box::pin(runner())),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check for duplicates, unknown dependencies and cycles. Returns a
    /// topological order.
    pub fn validate(&self) -> GraphResult<Vec<ServiceRole>> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.role) {
                return Err(GraphError::DuplicateNode(node.role));
            }
        }
        for node in &self.nodes {
            for dep in &node.depends_on {
                if !seen.contains(dep) {
                    return Err(GraphError::MissingDependency {
                        node: node.role,
                        dependency: *dep,
                    });
                }
            }
        }

        // Kahn's algorithm; role order breaks ties so the result is stable.
        let mut remaining: BTreeMap<ServiceRole, HashSet<ServiceRole>> = self
            .nodes
            .iter()
            .map(|n| (n.role, n.depends_on.iter().copied().collect()))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while !remaining.is_empty() {
            let ready: Vec<ServiceRole> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(role, _)| *role)
                .collect();
            if ready.is_empty() {
                let stuck = remaining.keys().next().copied().unwrap_or(ServiceRole::Store);
                return Err(GraphError::Cycle(stuck));
            }
            for role in ready {
                remaining.remove(&role);
                for deps in remaining.values_mut() {
                    deps.remove(&role);
                }
                order.push(role);
            }
        }
        Ok(order)
    }

    /// Run every node, honoring dependencies, and wait for all of them.
    pub async fn run(self) -> GraphResult<StartupReport> {
        let order = self.validate()?;
        debug!(?order, "startup graph validated");

        let mut done: HashMap<ServiceRole, watch::Sender<Option<bool>>> = self
            .nodes
            .iter()
            .map(|n| (n.role, watch::channel(None).0))
            .collect();
        let waits: Vec<Vec<(ServiceRole, watch::Receiver<Option<bool>>)>> = self
            .nodes
            .iter()
            .map(|n| {
                n.depends_on
                    .iter()
                    .filter_map(|dep| done.get(dep).map(|tx| (*dep, tx.subscribe())))
                    .collect()
            })
            .collect();

        // Each sender moves into its node's task; a task that dies drops it,
        // which its dependents read as failure.
        let mut tasks = JoinSet::new();
        for (node, deps) in self.nodes.into_iter().zip(waits) {
            let Some(tx) = done.remove(&node.role) else {
                continue;
            };
            tasks.spawn(run_node(node.role, deps, node.runner, tx));
        }

        let mut report = StartupReport::default();
        let mut started: Vec<(Instant, ServiceRole)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((role, started_at, outcome)) => {
                    if let Some(at) = started_at {
                        started.push((at, role));
                    }
                    report.outcomes.insert(role, outcome);
                }
                Err(e) => error!(error = %e, "startup node task failed"),
            }
        }
        started.sort();
        report.started = started.into_iter().map(|(_, role)| role).collect();
        Ok(report)
    }
}

async fn run_node(
    role: ServiceRole,
    deps: Vec<(ServiceRole, watch::Receiver<Option<bool>>)>,
    runner: Runner,
    done: watch::Sender<Option<bool>>,
) -> (ServiceRole, Option<Instant>, NodeOutcome) {
    for (dep, mut rx) in deps {
        let succeeded = match rx.wait_for(Option::is_some).await {
            Ok(value) => *value == Some(true),
            Err(_) => false,
        };
        if !succeeded {
            warn!(%role, dependency = %dep, "dependency did not succeed, skipping");
            done.send_replace(Some(false));
            return (role, None, NodeOutcome::Skipped { failed_dependency: dep });
        }
    }

    let started_at = Instant::now();
    info!(%role, "starting");
    // A separate task so a panicking runner fails only its own node.
    let outcome = match tokio::spawn(runner()).await {
        Ok(Ok(())) => {
            info!(%role, "completed");
            NodeOutcome::Succeeded
        }
        Ok(Err(e)) => {
            let msg = format!("{e:#}");
            error!(%role, error = %msg, "failed");
            NodeOutcome::Failed(msg)
        }
        Err(e) => {
            error!(%role, error = %e, "runner panicked");
            NodeOutcome::Failed(e.to_string())
        }
    };
    done.send_replace(Some(outcome.is_success()));
    (role, Some(started_at), outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use ServiceRole::*;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn record(log: &Log, entry: &'static str) {
        log.lock().unwrap().push(entry);
    }

    /// The deployment's shape, with each runner logging start and end.
    fn deployment(log: &Log, store_ok: bool, init_ok: bool) -> StartupGraph {
        let (l1, l2, l3, l4) = (log.clone(), log.clone(), log.clone(), log.clone());
        StartupGraph::new()
            .node(Store, &[], move || async move {
                record(&l1, "store");
                tokio::time::sleep(Duration::from_millis(30)).await;
                if store_ok { Ok(()) } else { anyhow::bail!("store unreachable") }
            })
            .node(Initializer, &[Store], move || async move {
                record(&l2, "init:start");
                tokio::time::sleep(Duration::from_millis(30)).await;
                record(&l2, "init:end");
                if init_ok { Ok(()) } else { anyhow::bail!("migration failed") }
            })
            .node(ApiServer, &[Store, Initializer], move || async move {
                record(&l3, "api");
                Ok(())
            })
            .node(SchedulerLoop, &[Store, Initializer], move || async move {
                record(&l4, "scheduler");
                Ok(())
            })
    }

    #[test]
    fn validate_orders_topologically() {
        let log = Log::default();
        let order = deployment(&log, true, true).validate().unwrap();
        assert_eq!(order, vec![Store, Initializer, ApiServer, SchedulerLoop]);
    }

    #[test]
    fn validate_rejects_duplicates() {
        let graph = StartupGraph::new()
            .node(Store, &[], || async { Ok(()) })
            .node(Store, &[], || async { Ok(()) });
        assert_eq!(graph.validate(), Err(GraphError::DuplicateNode(Store)));
    }

    #[test]
    fn validate_rejects_missing_dependency() {
        let graph = StartupGraph::new().node(ApiServer, &[Initializer], || async { Ok(()) });
        assert_eq!(
            graph.validate(),
            Err(GraphError::MissingDependency {
                node: ApiServer,
                dependency: Initializer
            })
        );
    }

    #[test]
    fn validate_rejects_cycles() {
        let graph = StartupGraph::new()
            .node(Initializer, &[ApiServer], || async { Ok(()) })
            .node(ApiServer, &[Initializer], || async { Ok(()) });
        assert!(matches!(graph.validate(), Err(GraphError::Cycle(_))));
    }

    #[tokio::test]
    async fn servers_start_strictly_after_initializer() {
        let log = Log::default();
        let report = deployment(&log, true, true).run().await.unwrap();
        assert!(report.all_succeeded());

        let entries = log.lock().unwrap().clone();
        let pos = |e: &str| entries.iter().position(|x| *x == e).unwrap();
        assert!(pos("store") < pos("init:start"));
        assert!(pos("init:end") < pos("api"));
        assert!(pos("init:end") < pos("scheduler"));

        assert_eq!(&report.started()[..2], &[Store, Initializer]);
        assert_eq!(report.started().len(), 4);
    }

    #[tokio::test]
    async fn unreachable_store_starts_nothing_else() {
        let log = Log::default();
        let report = deployment(&log, false, true).run().await.unwrap();

        assert!(matches!(report.outcome(Store), Some(NodeOutcome::Failed(_))));
        assert_eq!(
            report.outcome(Initializer),
            Some(&NodeOutcome::Skipped { failed_dependency: Store })
        );
        assert!(matches!(report.outcome(ApiServer), Some(NodeOutcome::Skipped { .. })));
        assert!(matches!(report.outcome(SchedulerLoop), Some(NodeOutcome::Skipped { .. })));
        assert_eq!(report.started(), &[Store]);
        assert_eq!(*log.lock().unwrap(), vec!["store"]);
    }

    #[tokio::test]
    async fn failed_initializer_blocks_servers() {
        let log = Log::default();
        let report = deployment(&log, true, false).run().await.unwrap();

        assert_eq!(report.first_failure(), Some((Initializer, "migration failed")));
        assert_eq!(
            report.outcome(ApiServer),
            Some(&NodeOutcome::Skipped { failed_dependency: Initializer })
        );
        assert!(!log.lock().unwrap().contains(&"api"));
        assert!(!log.lock().unwrap().contains(&"scheduler"));
    }

    #[tokio::test]
    async fn panicking_runner_fails_its_node() {
        let graph = StartupGraph::new()
            .node(Store, &[], || async {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .node(Initializer, &[Store], || async { Ok(()) });
        let report = graph.run().await.unwrap();
        assert!(matches!(report.outcome(Store), Some(NodeOutcome::Failed(_))));
        assert!(matches!(report.outcome(Initializer), Some(NodeOutcome::Skipped { .. })));
    }

    #[tokio::test]
    async fn invalid_graph_runs_nothing() {
        let log = Log::default();
        let l = log.clone();
        let graph = StartupGraph::new().node(ApiServer, &[Store], move || async move {
            record(&l, "api");
            Ok(())
        });
        assert!(graph.run().await.is_err());
        assert!(log.lock().unwrap().is_empty());
    }
}
