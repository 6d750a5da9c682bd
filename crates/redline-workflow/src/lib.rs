pub mod aggregate;
pub mod capability;
pub mod gate;
pub mod graph;
pub mod refine;
pub mod review;
pub mod sections;

pub use aggregate::{aggregate, AggregationRecord, ConsolidatedReport};
pub use capability::{capability_node, parse_analysis, LlmAnalyst, LlmCapability};
pub use gate::{evaluate_gate, parse_verdict, GateResult};
pub use graph::{
    ConditionalEdge, Edge, ExecutionResult, ExecutorConfig, Graph, GraphExecutor, Node, NodeFailure,
    NodeRun, Route, RunStatus, StateMap, StateUpdate, WorkflowState, END,
};
pub use refine::{DraftState, Phase, RefineLoop};
pub use review::{ReviewPanel, ReviewState};
pub use sections::{SectionPipeline, SectionState, SectionTask};
