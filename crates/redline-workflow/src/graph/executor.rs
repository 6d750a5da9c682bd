use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use redline_core::config::{ErrorPolicy, WorkflowConfig};
use redline_core::error::{RedlineError, Result};
use redline_core::types::RunId;

use super::edge::Route;
use super::node::NodeBody;
use super::state::{NodeFailure, StateUpdate, WorkflowState, ERROR_FIELD};
use super::Graph;

/// One node invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRun {
    pub node: String,
    /// Scheduling step the node ran in, starting at 1.
    pub step: usize,
    pub succeeded: bool,
    pub elapsed_ms: u64,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every branch reached a terminal point.
    Completed,
    /// A failed node blocked its downstream.
    Halted,
    /// The step guard stopped the run.
    StepLimit,
    /// The overall deadline expired.
    DeadlineExceeded,
}

/// Result of executing a graph.
#[derive(Debug, Clone)]
pub struct ExecutionResult<S> {
    pub run_id: RunId,
    /// Final state, including recorded failures.
    pub state: S,
    /// Node invocations in scheduling order.
    pub runs: Vec<NodeRun>,
    pub status: RunStatus,
    pub total_elapsed_ms: u64,
}

impl<S> ExecutionResult<S> {
    /// Number of times `node` ran.
    pub fn visits(&self, node: &str) -> usize {
        self.runs.iter().filter(|r| r.node == node).count()
    }

    /// Whether every node that ran succeeded and the run completed.
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed && self.runs.iter().all(|r| r.succeeded)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_steps: usize,
    pub node_timeout: Option<Duration>,
    pub deadline: Option<Duration>,
    pub on_error: ErrorPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&WorkflowConfig::default())
    }
}

impl From<&WorkflowConfig> for ExecutorConfig {
    fn from(config: &WorkflowConfig) -> Self {
        let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        Self {
            max_steps: config.max_steps,
            node_timeout: secs(config.node_timeout_secs),
            deadline: secs(config.deadline_secs),
            on_error: config.on_error,
        }
    }
}

impl ExecutorConfig {
    pub fn with_on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }
}

/// Aborts every spawned node task when dropped, so an early return cancels
/// siblings still in flight.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Runs graphs step by step.
#[derive(Debug, Clone, Default)]
pub struct GraphExecutor {
    config: ExecutorConfig,
}

impl GraphExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute `graph` from its entry points.
    ///
    /// Node failures are recorded into the state and the run continues to a
    /// terminal point. Structural failures (invalid graph, panicked node, or a
    /// node returning a structural error) abort the run and cancel any node
    /// still in flight.
    pub async fn run<S: WorkflowState>(
        &self,
        graph: &Graph<S>,
        initial: S,
    ) -> Result<ExecutionResult<S>> {
        graph.validate()?;

        let run_id = RunId::new();
        let start = Instant::now();
        let deadline = self
            .config
            .deadline
            .map(|d| tokio::time::Instant::now() + d);

        let mut state = initial;
        let mut runs = Vec::new();
        let mut frontier: Vec<String> = graph.entry_points().to_vec();
        let mut arrivals: Vec<HashSet<String>> = vec![HashSet::new(); graph.joins().len()];
        let mut halted = false;
        let mut step = 0;

        info!(run_id = %run_id, entry = ?frontier, "Starting workflow run");

        let status = loop {
            if frontier.is_empty() {
                break if halted {
                    RunStatus::Halted
                } else {
                    RunStatus::Completed
                };
            }
            if step >= self.config.max_steps {
                warn!(run_id = %run_id, max_steps = self.config.max_steps, pending = ?frontier, "Step limit reached");
                break RunStatus::StepLimit;
            }
            step += 1;

            let step_start = Instant::now();
            let StepOutcome { completed, expired } =
                self.run_step(graph, &state, &frontier, step, deadline).await?;

            // Merge in scheduling order, not completion order.
            let mut written: HashSet<String> = HashSet::new();
            let mut proceed: Vec<&str> = Vec::new();

            for (name, outcome, elapsed_ms) in completed {
                let node = graph
                    .node(&name)
                    .ok_or_else(|| RedlineError::Graph(format!("unknown node '{}'", name)))?;

                let (succeeded, blocks) = match outcome.and_then(|update| {
                    check_writes(node.name.as_str(), &update, |f| node.may_write(f), &written)
                        .map(|fields| (update, fields))
                }) {
                    Ok((update, fields)) => {
                        written.extend(fields.into_iter().filter(|f| f != ERROR_FIELD));
                        state.apply(update);
                        debug!(run_id = %run_id, node = %name, step, elapsed_ms, "Node complete");
                        (true, false)
                    }
                    Err(e) if e.is_structural() => {
                        error!(run_id = %run_id, node = %name, error = %e, "Structural failure, aborting run");
                        return Err(e);
                    }
                    Err(e) => {
                        warn!(run_id = %run_id, node = %name, step, error = %e, "Node failed");
                        let contract = matches!(
                            e,
                            RedlineError::WriteContract { .. } | RedlineError::WriteConflict { .. }
                        );
                        state.record_failure(NodeFailure::new(name.clone(), &e));
                        (false, contract || self.config.on_error == ErrorPolicy::Halt)
                    }
                };

                runs.push(NodeRun {
                    node: name.clone(),
                    step,
                    succeeded,
                    elapsed_ms,
                });

                if blocks {
                    halted = true;
                } else {
                    proceed.push(node.name.as_str());
                }
            }

            if !expired.is_empty() {
                let deadline_ms = self.config.deadline.map_or(0, |d| d.as_millis() as u64);
                let err = RedlineError::DeadlineExceeded { deadline_ms };
                error!(run_id = %run_id, step, pending = ?expired, "Workflow deadline exceeded");
                let elapsed_ms = step_start.elapsed().as_millis() as u64;
                for name in expired {
                    state.record_failure(NodeFailure::new(name.clone(), &err));
                    runs.push(NodeRun {
                        node: name,
                        step,
                        succeeded: false,
                        elapsed_ms,
                    });
                }
                break RunStatus::DeadlineExceeded;
            }

            frontier = next_frontier(graph, &state, &proceed, &mut arrivals)?;
        };

        let total_elapsed_ms = start.elapsed().as_millis() as u64;
        info!(run_id = %run_id, ?status, steps = step, total_elapsed_ms, "Workflow run finished");

        Ok(ExecutionResult {
            run_id,
            state,
            runs,
            status,
            total_elapsed_ms,
        })
    }

    /// Run every frontier node concurrently. Finished nodes come back in
    /// frontier order; nodes still running when the deadline passes are
    /// aborted and listed in `expired`.
    async fn run_step<S: WorkflowState>(
        &self,
        graph: &Graph<S>,
        state: &S,
        frontier: &[String],
        step: usize,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<StepOutcome<S::Update>> {
        let mut guard = AbortOnDrop(Vec::with_capacity(frontier.len()));
        let mut pending = FuturesUnordered::new();

        for (idx, name) in frontier.iter().enumerate() {
            let node = graph
                .node(name)
                .ok_or_else(|| RedlineError::Graph(format!("unknown node '{}'", name)))?;
            let view = state.view(&node.reads);
            let timeout = node.timeout.or(self.config.node_timeout);

            debug!(node = %name, step, "Node start");
            let handle = tokio::spawn(run_node(node.body(), view, timeout, name.clone()));
            guard.0.push(handle.abort_handle());
            pending.push(async move { (idx, handle.await) });
        }

        let mut slots: Vec<Option<(Result<S::Update>, u64)>> =
            (0..frontier.len()).map(|_| None).collect();

        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => break,
                },
                None => pending.next().await,
            };

            let Some((idx, joined)) = next else { break };
            match joined {
                Ok(outcome) => slots[idx] = Some(outcome),
                Err(e) => {
                    let msg = if e.is_panic() {
                        format!("{} panicked", frontier[idx])
                    } else {
                        format!("{} was cancelled", frontier[idx])
                    };
                    return Err(RedlineError::NodePanicked(msg));
                }
            }
        }
        drop(guard);

        let mut outcome = StepOutcome {
            completed: Vec::with_capacity(frontier.len()),
            expired: Vec::new(),
        };
        for (name, slot) in frontier.iter().cloned().zip(slots) {
            match slot {
                Some((result, ms)) => outcome.completed.push((name, result, ms)),
                None => outcome.expired.push(name),
            }
        }
        Ok(outcome)
    }
}

/// Results of one step.
struct StepOutcome<U> {
    completed: Vec<(String, Result<U>, u64)>,
    expired: Vec<String>,
}

async fn run_node<S: WorkflowState>(
    body: Arc<dyn NodeBody<S>>,
    view: S,
    timeout: Option<Duration>,
    name: String,
) -> (Result<S::Update>, u64) {
    let start = Instant::now();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, body.run(view)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RedlineError::NodeTimeout {
                node: name,
                timeout_ms: limit.as_millis() as u64,
            }),
        },
        None => body.run(view).await,
    };
    (outcome, start.elapsed().as_millis() as u64)
}

/// Validate an update's fields against the node's write contract and the
/// fields already written earlier in the same step.
fn check_writes<U: StateUpdate>(
    node: &str,
    update: &U,
    may_write: impl Fn(&str) -> bool,
    written: &HashSet<String>,
) -> Result<Vec<String>> {
    let fields = update.fields();
    for field in &fields {
        if !may_write(field) {
            return Err(RedlineError::WriteContract {
                node: node.to_string(),
                field: field.clone(),
            });
        }
        if field != ERROR_FIELD && written.contains(field) {
            return Err(RedlineError::WriteConflict {
                node: node.to_string(),
                field: field.clone(),
            });
        }
    }
    Ok(fields)
}

/// Derive the next step's nodes from the nodes that may proceed, in order.
fn next_frontier<S: WorkflowState>(
    graph: &Graph<S>,
    state: &S,
    proceed: &[&str],
    arrivals: &mut [HashSet<String>],
) -> Result<Vec<String>> {
    let mut next: Vec<String> = Vec::new();
    let push = |name: &str, next: &mut Vec<String>| {
        if name != super::END && !next.iter().any(|n| n == name) {
            next.push(name.to_string());
        }
    };

    for &name in proceed {
        for edge in graph.edges_from(name) {
            push(&edge.to, &mut next);
        }

        for (join, arrived) in graph.joins().iter().zip(arrivals.iter_mut()) {
            if join.sources.iter().any(|s| s == name) {
                arrived.insert(name.to_string());
                if join.sources.iter().all(|s| arrived.contains(s)) {
                    arrived.clear();
                    push(&join.target, &mut next);
                }
            }
        }

        if let Some(cond) = graph.conditional_from(name) {
            match cond.route(state) {
                Route::End => debug!(node = %name, "Route to end"),
                Route::Next(target) => {
                    if graph.node(&target).is_none() {
                        return Err(RedlineError::Graph(format!(
                            "conditional edge from '{}' routed to unknown node '{}'",
                            name, target
                        )));
                    }
                    debug!(node = %name, next = %target, "Conditional route");
                    push(&target, &mut next);
                }
            }
        }
    }

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::edge::{ConditionalEdge, END};
    use crate::graph::node::Node;
    use crate::graph::state::StateMap;
    use serde_json::json;

    fn set(key: &'static str, value: serde_json::Value) -> Node<StateMap> {
        Node::new(key, move |_s: StateMap| {
            let value = value.clone();
            async move { Ok(StateMap::new().with(key, value)) }
        })
    }

    fn failing(name: &'static str) -> Node<StateMap> {
        Node::new(name, move |_s: StateMap| async move {
            Err(RedlineError::capability(name, "HTTP 500"))
        })
    }

    fn executor() -> GraphExecutor {
        GraphExecutor::default()
    }

    #[test]
    fn test_config_from_workflow() {
        let cfg = ExecutorConfig::from(&WorkflowConfig {
            max_steps: 10,
            node_timeout_secs: 0,
            deadline_secs: 60,
            on_error: ErrorPolicy::Continue,
        });
        assert_eq!(cfg.max_steps, 10);
        assert!(cfg.node_timeout.is_none());
        assert_eq!(cfg.deadline, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_sequential_run() {
        let mut g = Graph::new();
        g.add_node(set("a", json!(1)))
            .add_node(set("b", json!(2)))
            .add_edge("a", "b")
            .add_edge("b", END)
            .set_entry_point("a");

        let result = executor().run(&g, StateMap::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.state.get("b"), Some(&json!(2)));
        let order: Vec<_> = result.runs.iter().map(|r| (r.node.as_str(), r.step)).collect();
        assert_eq!(order, vec![("a", 1), ("b", 2)]);
        assert!(result.succeeded());
    }

    #[tokio::test]
    async fn test_fan_out_join() {
        let mut g = Graph::new();
        g.add_node(set("x", json!("x")))
            .add_node(set("y", json!("y")))
            .add_node(Node::new("sum", |s: StateMap| async move {
                let both = format!("{}{}", s.get_str("x").unwrap_or(""), s.get_str("y").unwrap_or(""));
                Ok(StateMap::new().with("sum", json!(both)))
            }))
            .add_join(["x", "y"], "sum")
            .set_entry_point("x")
            .set_entry_point("y");

        let result = executor().run(&g, StateMap::new()).await.unwrap();
        assert_eq!(result.state.get_str("sum"), Some("xy"));
        assert_eq!(result.visits("sum"), 1);
        assert_eq!(result.runs[2].step, 2);
    }

    #[tokio::test]
    async fn test_loop_back_reinvokes_node() {
        let mut g = Graph::new();
        g.add_node(Node::new("count", |s: StateMap| async move {
            let n = s.get("n").and_then(|v| v.as_u64()).unwrap_or(0);
            Ok(StateMap::new().with("n", json!(n + 1)))
        }))
        .add_conditional_edge(ConditionalEdge::new("count", |s: &StateMap| {
            if s.get("n").and_then(|v| v.as_u64()) < Some(3) {
                Route::to("count")
            } else {
                Route::End
            }
        }))
        .set_entry_point("count");

        let result = executor().run(&g, StateMap::new()).await.unwrap();
        assert_eq!(result.state.get("n"), Some(&json!(3)));
        assert_eq!(result.visits("count"), 3);
    }

    #[tokio::test]
    async fn test_failure_recorded_and_halts_downstream() {
        let mut g = Graph::new();
        g.add_node(failing("write"))
            .add_node(set("publish", json!("done")))
            .add_edge("write", "publish")
            .set_entry_point("write");

        let result = executor().run(&g, StateMap::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Halted);
        assert!(result.state.get("publish").is_none());
        let failures = result.state.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].node, "write");
    }

    #[tokio::test]
    async fn test_continue_policy_keeps_going() {
        let mut g = Graph::new();
        g.add_node(failing("write"))
            .add_node(set("publish", json!("done")))
            .add_edge("write", "publish")
            .set_entry_point("write");

        let exec = GraphExecutor::new(ExecutorConfig::default().with_on_error(ErrorPolicy::Continue));
        let result = exec.run(&g, StateMap::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.state.get_str("publish"), Some("done"));
        assert_eq!(result.state.failures().len(), 1);
        assert!(!result.succeeded());
    }

    #[tokio::test]
    async fn test_write_contract_violation_blocks_even_on_continue() {
        let mut g = Graph::new();
        g.add_node(set("sneaky", json!(1)).with_writes(["allowed"]))
            .add_node(set("after", json!(1)))
            .add_edge("sneaky", "after")
            .set_entry_point("sneaky");

        let exec = GraphExecutor::new(ExecutorConfig::default().with_on_error(ErrorPolicy::Continue));
        let result = exec.run(&g, StateMap::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Halted);
        assert!(result.state.get("sneaky").is_none());
        assert!(result.state.get("after").is_none());
        assert!(result.state.failures()[0].message.contains("undeclared field 'sneaky'"));
    }

    #[tokio::test]
    async fn test_same_step_conflict_rejects_later_node() {
        let writer = |name: &'static str| {
            Node::new(name, move |_s: StateMap| async move {
                Ok(StateMap::new().with("shared", json!(name)))
            })
        };
        let mut g = Graph::new();
        g.add_node(writer("first"))
            .add_node(writer("second"))
            .set_entry_point("first")
            .set_entry_point("second");

        let result = executor().run(&g, StateMap::new()).await.unwrap();
        assert_eq!(result.state.get_str("shared"), Some("first"));
        let failures = result.state.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].node, "second");
    }

    #[tokio::test]
    async fn test_node_timeout_is_recorded() {
        let mut g = Graph::new();
        g.add_node(
            Node::new("slow", |_s: StateMap| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(StateMap::new())
            })
            .with_timeout(Duration::from_millis(20)),
        )
        .set_entry_point("slow");

        let result = executor().run(&g, StateMap::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Halted);
        assert!(result.state.failures()[0].message.contains("timeout"));
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let mut g = Graph::new();
        g.add_node(Node::new("slow", |_s: StateMap| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(StateMap::new())
        }))
        .set_entry_point("slow");

        let mut config = ExecutorConfig::default();
        config.deadline = Some(Duration::from_millis(20));
        let result = GraphExecutor::new(config).run(&g, StateMap::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::DeadlineExceeded);
        assert!(result.state.failures()[0].message.contains("deadline (20ms)"));
    }

    #[tokio::test]
    async fn test_deadline_keeps_finished_siblings() {
        let mut g = Graph::new();
        g.add_node(set("fast", json!("done")))
            .add_node(Node::new("slow", |_s: StateMap| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(StateMap::new().with("slow", json!("done")))
            }))
            .add_node(set("after", json!(1)))
            .add_edge("fast", "after")
            .set_entry_point("fast")
            .set_entry_point("slow");

        let mut config = ExecutorConfig::default();
        config.deadline = Some(Duration::from_millis(50));
        let result = GraphExecutor::new(config).run(&g, StateMap::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::DeadlineExceeded);
        assert_eq!(result.state.get_str("fast"), Some("done"));
        assert!(result.state.get("after").is_none());
        let failures = result.state.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].node, "slow");
        assert!(failures[0].message.contains("50ms"));
        assert_eq!(result.visits("fast"), 1);
        assert!(result.runs.iter().any(|r| r.node == "slow" && !r.succeeded));
    }

    #[tokio::test]
    async fn test_step_limit_stops_infinite_loop() {
        let mut g = Graph::new();
        g.add_node(set("spin", json!(true)))
            .add_edge("spin", "spin")
            .set_entry_point("spin");

        let mut config = ExecutorConfig::default();
        config.max_steps = 7;
        let result = GraphExecutor::new(config).run(&g, StateMap::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::StepLimit);
        assert_eq!(result.visits("spin"), 7);
    }

    #[tokio::test]
    async fn test_structural_error_aborts() {
        let mut g = Graph::new();
        g.add_node(Node::new("aggregate", |_s: StateMap| async {
            Err(RedlineError::EmptyAggregation)
        }))
        .set_entry_point("aggregate");

        let err = executor().run(&g, StateMap::new()).await.unwrap_err();
        assert!(matches!(err, RedlineError::EmptyAggregation));
    }

    #[tokio::test]
    async fn test_panic_is_structural() {
        let mut g = Graph::new();
        g.add_node(Node::new("boom", |s: StateMap| async move {
            if s.get("never").is_none() {
                panic!("boom");
            }
            Ok(StateMap::new())
        }))
        .set_entry_point("boom");

        let err = executor().run(&g, StateMap::new()).await.unwrap_err();
        assert!(matches!(err, RedlineError::NodePanicked(m) if m.contains("boom")));
    }

    #[tokio::test]
    async fn test_route_to_unknown_node_is_structural() {
        let mut g = Graph::new();
        g.add_node(set("a", json!(1)))
            .add_conditional_edge(ConditionalEdge::new("a", |_: &StateMap| Route::to("nowhere")))
            .set_entry_point("a");

        let err = executor().run(&g, StateMap::new()).await.unwrap_err();
        assert!(matches!(err, RedlineError::Graph(_)));
    }

    #[tokio::test]
    async fn test_view_restricted_to_reads() {
        let mut g = Graph::new();
        g.add_node(
            Node::new("peek", |s: StateMap| async move {
                let saw_secret = s.get("secret").is_some();
                Ok(StateMap::new().with("saw_secret", json!(saw_secret)))
            })
            .with_reads(["document"]),
        )
        .set_entry_point("peek");

        let initial = StateMap::new()
            .with("document", json!("v0"))
            .with("secret", json!("s"));
        let result = executor().run(&g, initial).await.unwrap();
        assert_eq!(result.state.get("saw_secret"), Some(&json!(false)));
        assert_eq!(result.state.get_str("secret"), Some("s"));
    }
}
