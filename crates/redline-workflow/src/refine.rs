//! Quality-gated refinement loop.
//!
//! ```text
//! draft -> review.<dim>* -> gate -+-> publish -> end
//!              ^                  +-> revise --+
//!              +-----------------------------------+
//!                                 +-> end (exhausted)
//! ```
//!
//! Reviewers run concurrently and each writes its own `feedback.<dim>` slot.
//! The gate counts completed review rounds and decides what runs next.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use redline_core::config::{AppConfig, ModelConfig};
use redline_core::error::{RedlineError, Result};
use redline_core::traits::{Capability, LlmClient};
use redline_core::types::CapabilityInput;

use crate::capability::LlmCapability;
use crate::gate::{evaluate_gate, high_marker, low_marker, GateResult};
use crate::graph::state::wants;
use crate::graph::{
    ConditionalEdge, ExecutionResult, ExecutorConfig, Graph, GraphExecutor, Node, NodeFailure,
    Route, StateUpdate, WorkflowState, ERROR_FIELD,
};

pub const DRAFT_NODE: &str = "draft";
pub const GATE_NODE: &str = "gate";
pub const REVISE_NODE: &str = "revise";
pub const PUBLISH_NODE: &str = "publish";

/// Executor steps one failing round takes: review, gate, revise.
const STEPS_PER_ROUND: usize = 3;

/// Node name of the reviewer for `dimension`.
pub fn review_node(dimension: &str) -> String {
    format!("review.{}", dimension)
}

/// Where the loop currently is. `Published` and `Exhausted` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Drafting,
    Reviewing,
    Revising,
    Publishing,
    Published,
    Exhausted,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Drafting => "drafting",
            Self::Reviewing => "reviewing",
            Self::Revising => "revising",
            Self::Publishing => "publishing",
            Self::Published => "published",
            Self::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DraftState {
    pub brief: String,
    pub document: String,
    /// Completed review rounds.
    pub iteration: usize,
    pub max_iterations: usize,
    /// Latest feedback per dimension.
    pub feedback: BTreeMap<String, String>,
    pub gate: Option<GateResult>,
    pub phase: Phase,
    pub errors: Vec<NodeFailure>,
}

impl DraftState {
    /// Start from a project brief.
    pub fn from_brief(brief: impl Into<String>, max_iterations: usize) -> Self {
        Self {
            brief: brief.into(),
            max_iterations,
            phase: Phase::Drafting,
            ..Default::default()
        }
    }

    /// Start from an existing document, skipping the draft step.
    pub fn from_document(document: impl Into<String>, max_iterations: usize) -> Self {
        Self {
            document: document.into(),
            max_iterations,
            phase: Phase::Reviewing,
            ..Default::default()
        }
    }

    pub fn is_published(&self) -> bool {
        self.phase == Phase::Published
    }

    pub fn is_exhausted(&self) -> bool {
        self.phase == Phase::Exhausted
    }
}

#[derive(Debug, Default)]
pub struct DraftUpdate {
    pub document: Option<String>,
    pub feedback: Vec<(String, String)>,
    /// Drop all feedback before applying `feedback`.
    pub clear_feedback: bool,
    pub iteration: Option<usize>,
    pub gate: Option<GateResult>,
    pub phase: Option<Phase>,
    pub errors: Vec<NodeFailure>,
}

impl StateUpdate for DraftUpdate {
    fn fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        if self.document.is_some() {
            fields.push("document".to_string());
        }
        if self.clear_feedback {
            fields.push("feedback".to_string());
        }
        fields.extend(self.feedback.iter().map(|(dim, _)| format!("feedback.{}", dim)));
        if self.iteration.is_some() {
            fields.push("iteration".to_string());
        }
        if self.gate.is_some() {
            fields.push("gate".to_string());
        }
        if self.phase.is_some() {
            fields.push("phase".to_string());
        }
        if !self.errors.is_empty() {
            fields.push(ERROR_FIELD.to_string());
        }
        fields
    }
}

impl WorkflowState for DraftState {
    type Update = DraftUpdate;

    fn apply(&mut self, update: DraftUpdate) {
        if let Some(document) = update.document {
            self.document = document;
        }
        if update.clear_feedback {
            self.feedback.clear();
        }
        self.feedback.extend(update.feedback);
        if let Some(iteration) = update.iteration {
            self.iteration = iteration;
        }
        if let Some(gate) = update.gate {
            self.gate = Some(gate);
        }
        if let Some(phase) = update.phase {
            self.phase = phase;
        }
        self.errors.extend(update.errors);
    }

    fn view(&self, reads: &[String]) -> Self {
        let mut view = Self {
            phase: self.phase,
            ..Default::default()
        };
        if wants(reads, "brief") {
            view.brief = self.brief.clone();
        }
        if wants(reads, "document") {
            view.document = self.document.clone();
        }
        if wants(reads, "iteration") {
            view.iteration = self.iteration;
        }
        if wants(reads, "max_iterations") {
            view.max_iterations = self.max_iterations;
        }
        if wants(reads, "feedback") {
            view.feedback = self.feedback.clone();
        }
        if wants(reads, "gate") {
            view.gate = self.gate.clone();
        }
        if wants(reads, ERROR_FIELD) {
            view.errors = self.errors.clone();
        }
        view
    }

    fn record_failure(&mut self, failure: NodeFailure) {
        self.errors.push(failure);
    }
}

/// Which step the loop starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Draft,
    Review,
}

const DRAFT_INSTRUCTION: &str =
    "Write a complete technical design document for the project described in the brief.";
const REVISE_INSTRUCTION: &str =
    "Revise the document so that it addresses every point in the feedback. Return the full revised document.";
const PUBLISH_INSTRUCTION: &str =
    "Format the document for publication. Keep the content unchanged. Return the full formatted document.";

fn review_instruction(dimension: &str) -> String {
    format!(
        "Review the document for {dim} quality. List concrete problems and how to fix them. \
         End your feedback with exactly one of these lines:\n{high}\n{low}",
        dim = dimension,
        high = high_marker(dimension),
        low = low_marker(dimension),
    )
}

/// Draft, review, revise until every quality dimension passes or the
/// iteration cap is reached.
pub struct RefineLoop {
    drafter: Option<Arc<dyn Capability>>,
    reviewers: Vec<(String, Arc<dyn Capability>)>,
    editor: Arc<dyn Capability>,
    publisher: Arc<dyn Capability>,
    max_iterations: usize,
    executor: ExecutorConfig,
}

impl RefineLoop {
    pub fn new(editor: Arc<dyn Capability>, publisher: Arc<dyn Capability>) -> Self {
        Self {
            drafter: None,
            reviewers: Vec::new(),
            editor,
            publisher,
            max_iterations: 5,
            executor: ExecutorConfig::default(),
        }
    }

    /// Build the loop described by `[refine]` with LLM-backed roles.
    pub fn from_config(config: &AppConfig, llm: Arc<dyn LlmClient>) -> Self {
        let role = |name: &str, prompt: String, model: &ModelConfig| -> Arc<dyn Capability> {
            Arc::new(LlmCapability::new(name, llm.clone(), model.clone(), prompt))
        };
        let model = &config.model;

        let mut refine = Self::new(
            role(
                "editor",
                "You are a senior technical editor revising a design document based on reviewer feedback.".into(),
                model,
            ),
            role(
                "publisher",
                "You are a technical publisher preparing a design document for release.".into(),
                model,
            ),
        )
        .with_drafter(role(
            "drafter",
            "You are a solution architect writing technical design documents.".into(),
            model,
        ))
        .with_max_iterations(config.refine.max_iterations)
        .with_executor(ExecutorConfig::from(&config.workflow));

        for dimension in &config.refine.dimensions {
            let prompt = dimension.prompt.clone().unwrap_or_else(|| {
                format!(
                    "You are an expert reviewer focused on {} aspects of technical design documents.",
                    dimension.name
                )
            });
            let reviewer = role(&review_node(&dimension.name), prompt, model);
            refine = refine.with_reviewer(dimension.name.clone(), reviewer);
        }
        refine
    }

    pub fn with_drafter(mut self, drafter: Arc<dyn Capability>) -> Self {
        self.drafter = Some(drafter);
        self
    }

    pub fn with_reviewer(mut self, dimension: impl Into<String>, reviewer: Arc<dyn Capability>) -> Self {
        self.reviewers.push((dimension.into(), reviewer));
        self
    }

    /// Values below 1 are raised to 1.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_executor(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    /// Dimensions in registered order.
    pub fn dimensions(&self) -> Vec<String> {
        self.reviewers.iter().map(|(d, _)| d.clone()).collect()
    }

    /// Run from a project brief, starting with a draft.
    pub async fn draft(&self, brief: impl Into<String>) -> Result<ExecutionResult<DraftState>> {
        let graph = self.build_graph(Entry::Draft)?;
        self.execute(&graph, DraftState::from_brief(brief, self.max_iterations))
            .await
    }

    /// Run from an existing document, starting with a review round.
    pub async fn refine(&self, document: impl Into<String>) -> Result<ExecutionResult<DraftState>> {
        let graph = self.build_graph(Entry::Review)?;
        self.execute(&graph, DraftState::from_document(document, self.max_iterations))
            .await
    }

    async fn execute(
        &self,
        graph: &Graph<DraftState>,
        initial: DraftState,
    ) -> Result<ExecutionResult<DraftState>> {
        info!(
            dimensions = ?self.dimensions(),
            max_iterations = self.max_iterations,
            "Starting refinement"
        );

        let mut config = self.executor.clone();
        config.max_steps = config
            .max_steps
            .max(STEPS_PER_ROUND * self.max_iterations + 2);
        let result = GraphExecutor::new(config).run(graph, initial).await?;

        let state = &result.state;
        match state.phase {
            Phase::Published => info!(iteration = state.iteration, "Document published"),
            Phase::Exhausted => warn!(
                iteration = state.iteration,
                failing = ?state.gate.as_ref().map(|g| g.failing()),
                "Quality gate not met within iteration cap"
            ),
            phase => warn!(%phase, errors = state.errors.len(), "Refinement stopped early"),
        }

        Ok(result)
    }

    fn build_graph(&self, entry: Entry) -> Result<Graph<DraftState>> {
        if self.reviewers.is_empty() {
            return Err(RedlineError::Graph("refinement needs at least one reviewer".into()));
        }

        let dimensions = self.dimensions();
        let review_nodes: Vec<String> = dimensions.iter().map(|d| review_node(d)).collect();
        let mut graph = Graph::new();

        match entry {
            Entry::Draft => {
                let drafter = self
                    .drafter
                    .clone()
                    .ok_or_else(|| RedlineError::Graph("no drafter configured".into()))?;
                graph.add_node(draft_node(drafter));
                graph.set_entry_point(DRAFT_NODE);
                for name in &review_nodes {
                    graph.add_edge(DRAFT_NODE, name.clone());
                }
            }
            Entry::Review => {
                for name in &review_nodes {
                    graph.set_entry_point(name.clone());
                }
            }
        }

        for (dimension, reviewer) in &self.reviewers {
            graph.add_node(reviewer_node(dimension.clone(), reviewer.clone()));
        }
        graph.add_node(gate_node(dimensions.clone()));
        graph.add_node(revise_node(self.editor.clone(), dimensions));
        graph.add_node(publish_node(self.publisher.clone()));

        graph.add_join(review_nodes.clone(), GATE_NODE);
        graph.add_conditional_edge(ConditionalEdge::new(GATE_NODE, |state: &DraftState| {
            match state.phase {
                Phase::Publishing => Route::to(PUBLISH_NODE),
                Phase::Revising => Route::to(REVISE_NODE),
                _ => Route::End,
            }
        }));
        for name in &review_nodes {
            graph.add_edge(REVISE_NODE, name.clone());
        }

        Ok(graph)
    }
}

fn draft_node(drafter: Arc<dyn Capability>) -> Node<DraftState> {
    Node::new(DRAFT_NODE, move |state: DraftState| {
        let drafter = drafter.clone();
        async move {
            let input = CapabilityInput::new(DRAFT_INSTRUCTION).with("brief", state.brief);
            let document = drafter.invoke(input).await?;
            Ok(DraftUpdate {
                document: Some(document),
                phase: Some(Phase::Reviewing),
                ..Default::default()
            })
        }
    })
    .with_reads(["brief"])
    .with_writes(["document", "phase"])
}

/// A failed reviewer leaves empty feedback, which the gate reads as LOW.
fn reviewer_node(dimension: String, reviewer: Arc<dyn Capability>) -> Node<DraftState> {
    let field = format!("feedback.{}", dimension);
    Node::new(review_node(&dimension), move |state: DraftState| {
        let reviewer = reviewer.clone();
        let dimension = dimension.clone();
        async move {
            let input = CapabilityInput::new(review_instruction(&dimension))
                .with("document", state.document);
            let mut update = DraftUpdate::default();
            let feedback = match reviewer.invoke(input).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(dimension = %dimension, error = %e, "Reviewer failed");
                    update.errors.push(NodeFailure::new(review_node(&dimension), &e));
                    String::new()
                }
            };
            update.feedback.push((dimension, feedback));
            Ok(update)
        }
    })
    .with_reads(["document"])
    .with_writes([field])
}

fn gate_node(dimensions: Vec<String>) -> Node<DraftState> {
    Node::new(GATE_NODE, move |state: DraftState| {
        let dimensions = dimensions.clone();
        async move {
            let gate = evaluate_gate(&dimensions, &state.feedback);
            let iteration = state.iteration + 1;
            let phase = if gate.passed() {
                Phase::Publishing
            } else if iteration >= state.max_iterations {
                Phase::Exhausted
            } else {
                Phase::Revising
            };
            info!(iteration, passed = gate.passed(), failing = ?gate.failing(), %phase, "Quality gate");
            Ok(DraftUpdate {
                iteration: Some(iteration),
                gate: Some(gate),
                phase: Some(phase),
                ..Default::default()
            })
        }
    })
    .with_reads(["feedback", "iteration", "max_iterations"])
    .with_writes(["iteration", "gate", "phase"])
}

fn revise_node(editor: Arc<dyn Capability>, dimensions: Vec<String>) -> Node<DraftState> {
    Node::new(REVISE_NODE, move |state: DraftState| {
        let editor = editor.clone();
        let dimensions = dimensions.clone();
        async move {
            let feedback = dimensions
                .iter()
                .filter_map(|d| state.feedback.get(d))
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join("\n");
            let input = CapabilityInput::new(REVISE_INSTRUCTION)
                .with("document", state.document)
                .with("feedback", feedback);
            let document = editor.invoke(input).await?;
            Ok(DraftUpdate {
                document: Some(document),
                clear_feedback: true,
                phase: Some(Phase::Reviewing),
                ..Default::default()
            })
        }
    })
    .with_reads(["document", "feedback"])
    .with_writes(["document", "feedback", "phase"])
}

fn publish_node(publisher: Arc<dyn Capability>) -> Node<DraftState> {
    Node::new(PUBLISH_NODE, move |state: DraftState| {
        let publisher = publisher.clone();
        async move {
            let input = CapabilityInput::new(PUBLISH_INSTRUCTION).with("document", state.document);
            let document = publisher.invoke(input).await?;
            Ok(DraftUpdate {
                document: Some(document),
                phase: Some(Phase::Published),
                ..Default::default()
            })
        }
    })
    .with_reads(["document"])
    .with_writes(["document", "phase"])
}
