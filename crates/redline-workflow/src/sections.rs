//! Per-section generate/review/improve pipeline.
//!
//! Each section of a markdown template goes through
//! `generate -> review -> improve -> finalize -> router`; the router either
//! advances `current_index` and loops back to `generate`, or ends the run.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use redline_core::config::AppConfig;
use redline_core::error::{RedlineError, Result};
use redline_core::traits::{Capability, LlmClient};
use redline_core::types::CapabilityInput;
use redline_ingest::{assemble, split_sections, Section};

use crate::capability::LlmCapability;
use crate::graph::state::wants;
use crate::graph::{
    ConditionalEdge, ExecutionResult, ExecutorConfig, Graph, GraphExecutor, Node, NodeFailure,
    Route, StateUpdate, WorkflowState, ERROR_FIELD,
};

pub const GENERATE_NODE: &str = "generate";
pub const REVIEW_NODE: &str = "review";
pub const IMPROVE_NODE: &str = "improve";
pub const FINALIZE_NODE: &str = "finalize";
pub const ROUTER_NODE: &str = "router";

/// Nodes visited per section.
const NODES_PER_SECTION: usize = 5;

/// One unit of work: a section header, the prompt describing what it should
/// contain, and the committed content once finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionTask {
    pub header: String,
    pub prompt: String,
    pub content: Option<String>,
}

impl SectionTask {
    pub fn new(header: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            prompt: prompt.into(),
            content: None,
        }
    }
}

impl From<Section> for SectionTask {
    fn from(section: Section) -> Self {
        Self::new(section.header, section.body)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SectionState {
    pub sections: Vec<SectionTask>,
    pub current_index: usize,
    pub generated: Option<String>,
    pub feedback: Option<String>,
    pub improved: Option<String>,
    pub finished: bool,
    pub errors: Vec<NodeFailure>,
}

impl SectionState {
    pub fn new(sections: Vec<SectionTask>) -> Self {
        Self {
            sections,
            ..Default::default()
        }
    }

    fn current(&self) -> Option<&SectionTask> {
        self.sections.get(self.current_index)
    }
}

#[derive(Debug, Default)]
pub struct SectionUpdate {
    pub generated: Option<String>,
    pub feedback: Option<String>,
    pub improved: Option<String>,
    /// Content to commit at the given section index.
    pub commit: Option<(usize, String)>,
    pub current_index: Option<usize>,
    /// Clear `generated`, `feedback` and `improved` for the next section.
    pub reset_scratch: bool,
    pub finished: Option<bool>,
    pub errors: Vec<NodeFailure>,
}

impl StateUpdate for SectionUpdate {
    fn fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        let mut push = |set: bool, name: &str| {
            if set && !fields.iter().any(|f| f == name) {
                fields.push(name.to_string());
            }
        };
        push(self.generated.is_some() || self.reset_scratch, "generated");
        push(self.feedback.is_some() || self.reset_scratch, "feedback");
        push(self.improved.is_some() || self.reset_scratch, "improved");
        push(self.commit.is_some(), "sections");
        push(self.current_index.is_some(), "current_index");
        push(self.finished.is_some(), "finished");
        push(!self.errors.is_empty(), ERROR_FIELD);
        fields
    }
}

impl WorkflowState for SectionState {
    type Update = SectionUpdate;

    fn apply(&mut self, update: SectionUpdate) {
        if update.reset_scratch {
            self.generated = None;
            self.feedback = None;
            self.improved = None;
        }
        if let Some(generated) = update.generated {
            self.generated = Some(generated);
        }
        if let Some(feedback) = update.feedback {
            self.feedback = Some(feedback);
        }
        if let Some(improved) = update.improved {
            self.improved = Some(improved);
        }
        if let Some((index, content)) = update.commit {
            if let Some(task) = self.sections.get_mut(index) {
                task.content = Some(content);
            }
        }
        if let Some(index) = update.current_index {
            self.current_index = index;
        }
        if let Some(finished) = update.finished {
            self.finished = finished;
        }
        self.errors.extend(update.errors);
    }

    fn view(&self, reads: &[String]) -> Self {
        let mut view = Self::default();
        if wants(reads, "sections") {
            view.sections = self.sections.clone();
        }
        if wants(reads, "current_index") {
            view.current_index = self.current_index;
        }
        if wants(reads, "generated") {
            view.generated = self.generated.clone();
        }
        if wants(reads, "feedback") {
            view.feedback = self.feedback.clone();
        }
        if wants(reads, "improved") {
            view.improved = self.improved.clone();
        }
        if wants(reads, "finished") {
            view.finished = self.finished;
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

/// Runs the per-section pipeline over a list of sections.
pub struct SectionPipeline {
    generator: Arc<dyn Capability>,
    reviewer: Arc<dyn Capability>,
    improver: Arc<dyn Capability>,
    executor: ExecutorConfig,
}

impl SectionPipeline {
    pub fn new(
        generator: Arc<dyn Capability>,
        reviewer: Arc<dyn Capability>,
        improver: Arc<dyn Capability>,
    ) -> Self {
        Self {
            generator,
            reviewer,
            improver,
            executor: ExecutorConfig::default(),
        }
    }

    /// LLM-backed roles; the error policy comes from `[sections]` or
    /// `[workflow]`.
    pub fn from_config(config: &AppConfig, llm: Arc<dyn LlmClient>) -> Self {
        let role = |name: &str, prompt: &str| -> Arc<dyn Capability> {
            Arc::new(LlmCapability::new(name, llm.clone(), config.model.clone(), prompt))
        };
        Self::new(
            role(
                "writer",
                "You are a technical writer producing one section of a design document.",
            ),
            role(
                "reviewer",
                "You are a critical reviewer of technical design documents. Point out gaps, errors, and unclear statements.",
            ),
            role(
                "editor",
                "You are an editor improving a document section based on review feedback.",
            ),
        )
        .with_executor(
            ExecutorConfig::from(&config.workflow).with_on_error(config.sections_error_policy()),
        )
    }

    pub fn with_executor(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    pub fn build_graph(&self) -> Graph<SectionState> {
        let mut graph = Graph::new();
        graph
            .add_node(generate_node(self.generator.clone()))
            .add_node(review_node(self.reviewer.clone()))
            .add_node(improve_node(self.improver.clone()))
            .add_node(finalize_node())
            .add_node(router_node())
            .set_entry_point(GENERATE_NODE)
            .add_edge(GENERATE_NODE, REVIEW_NODE)
            .add_edge(REVIEW_NODE, IMPROVE_NODE)
            .add_edge(IMPROVE_NODE, FINALIZE_NODE)
            .add_edge(FINALIZE_NODE, ROUTER_NODE)
            .add_conditional_edge(ConditionalEdge::new(ROUTER_NODE, |state: &SectionState| {
                if state.finished {
                    Route::End
                } else {
                    Route::to(GENERATE_NODE)
                }
            }));
        graph
    }

    /// Process every section in order.
    pub async fn run(&self, sections: Vec<SectionTask>) -> Result<ExecutionResult<SectionState>> {
        if sections.is_empty() {
            return Err(RedlineError::NoSections);
        }

        // The step guard must leave room for every section.
        let mut config = self.executor.clone();
        config.max_steps = config.max_steps.max(sections.len() * NODES_PER_SECTION);

        info!(sections = sections.len(), on_error = ?config.on_error, "Starting section pipeline");
        let graph = self.build_graph();
        GraphExecutor::new(config)
            .run(&graph, SectionState::new(sections))
            .await
    }

    /// Split a markdown template, run the pipeline, and reassemble. Sections
    /// that were never finalized keep their original body.
    pub async fn generate_document(
        &self,
        markdown: &str,
    ) -> Result<(String, ExecutionResult<SectionState>)> {
        let originals = split_sections(markdown);
        let tasks = originals.iter().cloned().map(SectionTask::from).collect();
        let result = self.run(tasks).await?;

        let assembled: Vec<Section> = originals
            .into_iter()
            .zip(&result.state.sections)
            .map(|(original, task)| match &task.content {
                Some(content) => Section::new(original.header, content.clone()),
                None => original,
            })
            .collect();

        Ok((assemble(&assembled), result))
    }
}

fn missing(node: &str, what: &str) -> RedlineError {
    RedlineError::capability(node, format!("no {} to work from", what))
}

fn generate_node(generator: Arc<dyn Capability>) -> Node<SectionState> {
    Node::new(GENERATE_NODE, move |state: SectionState| {
        let generator = generator.clone();
        async move {
            let task = state
                .current()
                .ok_or_else(|| missing(GENERATE_NODE, "section"))?;
            debug!(index = state.current_index, header = %task.header, "Generating section");
            let input = CapabilityInput::new("Write the content of this section. Return only the section body.")
                .with("section", task.header.clone())
                .with("requirements", task.prompt.clone());
            let generated = generator.invoke(input).await?;
            Ok(SectionUpdate {
                generated: Some(generated),
                ..Default::default()
            })
        }
    })
    .with_reads(["sections", "current_index"])
    .with_writes(["generated"])
}

fn review_node(reviewer: Arc<dyn Capability>) -> Node<SectionState> {
    Node::new(REVIEW_NODE, move |state: SectionState| {
        let reviewer = reviewer.clone();
        async move {
            let header = state.current().map(|t| t.header.clone()).unwrap_or_default();
            let content = state
                .generated
                .ok_or_else(|| missing(REVIEW_NODE, "generated content"))?;
            let input = CapabilityInput::new("Review this section and list concrete improvements.")
                .with("section", header)
                .with("content", content);
            let feedback = reviewer.invoke(input).await?;
            Ok(SectionUpdate {
                feedback: Some(feedback),
                ..Default::default()
            })
        }
    })
    .with_reads(["sections", "current_index", "generated"])
    .with_writes(["feedback"])
}

fn improve_node(improver: Arc<dyn Capability>) -> Node<SectionState> {
    Node::new(IMPROVE_NODE, move |state: SectionState| {
        let improver = improver.clone();
        async move {
            let content = state
                .generated
                .ok_or_else(|| missing(IMPROVE_NODE, "generated content"))?;
            let feedback = state
                .feedback
                .ok_or_else(|| missing(IMPROVE_NODE, "feedback"))?;
            let input = CapabilityInput::new("Rewrite the section so that it addresses the feedback. Return only the section body.")
                .with("content", content)
                .with("feedback", feedback);
            let improved = improver.invoke(input).await?;
            Ok(SectionUpdate {
                improved: Some(improved),
                ..Default::default()
            })
        }
    })
    .with_reads(["generated", "feedback"])
    .with_writes(["improved"])
}

/// Commits the improved content, or the generated content when improvement
/// did not happen.
fn finalize_node() -> Node<SectionState> {
    Node::new(FINALIZE_NODE, |state: SectionState| async move {
        let index = state.current_index;
        let content = state
            .improved
            .or(state.generated)
            .ok_or_else(|| missing(FINALIZE_NODE, "content"))?;
        Ok(SectionUpdate {
            commit: Some((index, content)),
            ..Default::default()
        })
    })
    .with_reads(["current_index", "generated", "improved"])
    .with_writes(["sections"])
}

fn router_node() -> Node<SectionState> {
    Node::new(ROUTER_NODE, |state: SectionState| async move {
        let next = state.current_index + 1;
        if next < state.sections.len() {
            debug!(next, "Advancing to next section");
            Ok(SectionUpdate {
                current_index: Some(next),
                reset_scratch: true,
                ..Default::default()
            })
        } else {
            Ok(SectionUpdate {
                finished: Some(true),
                ..Default::default()
            })
        }
    })
    .with_reads(["sections", "current_index"])
    .with_writes(["current_index", "generated", "feedback", "improved", "finished"])
}
