use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use redline_core::config::{ErrorPolicy, ReviewMode};
use redline_core::error::RedlineError;
use redline_core::traits::{Capability, LlmClient};
use redline_core::types::{Analysis, Severity};
use redline_test_utils::{config_from_toml, fixture_file, ScriptedCapability, ScriptedLlm, StaticAnalyst};
use redline_workflow::graph::{ExecutorConfig, Graph, GraphExecutor, RunStatus, StateMap};
use redline_workflow::refine::{GATE_NODE, PUBLISH_NODE, REVISE_NODE};
use redline_workflow::sections::{FINALIZE_NODE, GENERATE_NODE, IMPROVE_NODE, REVIEW_NODE};
use redline_workflow::{
    aggregate, capability_node, AggregationRecord, Phase, RefineLoop, ReviewPanel, SectionPipeline,
    SectionTask,
};

const DIMENSIONS: [&str; 5] = ["General", "Security", "Infrastructure", "Data", "Compliance"];

fn high(dim: &str) -> Arc<ScriptedCapability> {
    Arc::new(ScriptedCapability::always(dim, &format!("Looks solid.\n{} Quality: HIGH", dim)))
}

fn refine_loop(security: Arc<ScriptedCapability>, editor: Arc<ScriptedCapability>) -> RefineLoop {
    let publisher = Arc::new(ScriptedCapability::echo("publisher", "document"));
    DIMENSIONS.iter().fold(RefineLoop::new(editor, publisher), |r, dim| {
        let reviewer: Arc<dyn Capability> = if *dim == "Security" {
            security.clone()
        } else {
            high(dim)
        };
        r.with_reviewer(*dim, reviewer)
    })
}

#[tokio::test]
async fn test_sequential_graph_is_deterministic() {
    let build = || {
        let mut graph = Graph::new();
        graph
            .add_node(capability_node(
                "outline",
                Arc::new(ScriptedCapability::always("outline", "1. Intro 2. Design")),
                "Outline the document",
                &["topic"],
                &["outline"],
            ))
            .add_node(capability_node(
                "write",
                Arc::new(ScriptedCapability::always("write", "Full text")),
                "Write the document",
                &["topic", "outline"],
                &["document"],
            ))
            .set_entry_point("outline")
            .add_edge("outline", "write");
        graph
    };

    let initial = StateMap::new().with("topic", serde_json::json!("payments"));
    let executor = GraphExecutor::default();
    let first = executor.run(&build(), initial.clone()).await.unwrap();
    let second = executor.run(&build(), initial).await.unwrap();

    assert_eq!(first.state, second.state);
    assert_eq!(first.state.get_str("document"), Some("Full text"));
    assert_eq!(first.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_fan_out_order_ignores_completion_timing() {
    let run = |delays: [u64; 3]| async move {
        let names = ["enterprise", "security", "aws"];
        let panel = names
            .iter()
            .zip(delays)
            .fold(ReviewPanel::new(ReviewMode::Parallel), |p, (name, ms)| {
                p.with_analyst(Arc::new(
                    StaticAnalyst::rated(name, Severity::Medium).with_delay(Duration::from_millis(ms)),
                ))
            });
        panel.review("doc", None).await.unwrap().state.report.unwrap()
    };

    let a = run([40, 5, 20]).await;
    let b = run([5, 20, 40]).await;

    assert_eq!(a.findings, b.findings);
    assert_eq!(a.recommendations, b.recommendations);
    assert_eq!(
        a.findings,
        vec![
            "[enterprise] enterprise finding",
            "[security] security finding",
            "[aws] aws finding"
        ]
    );
}

#[test]
fn test_severity_band_boundaries() {
    let report = |severities: &[Severity]| {
        let records: BTreeMap<String, AggregationRecord> = severities
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let name = format!("p{}", i);
                (name.clone(), AggregationRecord::from_analysis(name, Analysis::new(*s)))
            })
            .collect();
        let order: Vec<String> = records.keys().cloned().collect();
        aggregate(&order, &records).unwrap()
    };

    use Severity::*;
    // 7 / 5 = 1.4
    assert_eq!(report(&[Low, Low, Low, Medium, Medium]).overall_severity, Low);
    assert_eq!(report(&[Low, Medium]).overall_severity, Medium);
    assert_eq!(report(&[Medium, High]).overall_severity, High);
    assert_eq!(report(&[High, High]).overall_severity, High);
}

#[test]
fn test_empty_aggregation_is_an_error() {
    let err = aggregate(&[], &BTreeMap::new()).unwrap_err();
    assert!(matches!(err, RedlineError::EmptyAggregation));
}

#[tokio::test]
async fn test_all_high_publishes_on_first_round() {
    let editor = Arc::new(ScriptedCapability::always("editor", "v1"));
    let result = refine_loop(high("Security"), editor.clone())
        .refine("v0")
        .await
        .unwrap();

    assert_eq!(result.state.phase, Phase::Published);
    assert_eq!(result.state.iteration, 1);
    assert_eq!(result.state.document, "v0");
    assert_eq!(editor.calls(), 0);
    assert_eq!(result.visits(PUBLISH_NODE), 1);
}

#[tokio::test]
async fn test_persistent_low_exhausts_at_cap() {
    let security = Arc::new(ScriptedCapability::always(
        "Security",
        "No threat model.\nSecurity Quality: LOW",
    ));
    let editor = Arc::new(ScriptedCapability::sequence("editor", &["v1", "v2", "v3", "v4"]));
    let result = refine_loop(security.clone(), editor.clone())
        .refine("v0")
        .await
        .unwrap();

    assert_eq!(result.state.phase, Phase::Exhausted);
    assert_eq!(result.state.iteration, 5);
    assert_eq!(result.state.document, "v4");
    assert_eq!(editor.calls(), 4);
    assert_eq!(security.calls(), 5);
    assert_eq!(result.visits(GATE_NODE), 5);
    assert_eq!(result.visits(PUBLISH_NODE), 0);
    assert!(result.state.feedback["Security"].ends_with("Security Quality: LOW"));
}

#[tokio::test]
async fn test_gate_fails_closed_on_malformed_marker() {
    let security = Arc::new(ScriptedCapability::sequence(
        "Security",
        &["Security quality: high", "Security Quality: HIGH"],
    ));
    let editor = Arc::new(ScriptedCapability::always("editor", "v1"));
    let result = refine_loop(security, editor.clone())
        .refine("v0")
        .await
        .unwrap();

    assert_eq!(result.visits(REVISE_NODE), 1);
    assert_eq!(result.state.iteration, 2);
    assert_eq!(result.state.phase, Phase::Published);
    assert_eq!(result.state.document, "v1");

    // The editor saw the feedback of every dimension, in dimension order.
    let inputs = editor.inputs();
    let feedback = inputs[0].get("feedback").unwrap();
    let general = feedback.find("General Quality").unwrap();
    let security = feedback.find("Security quality").unwrap();
    let compliance = feedback.find("Compliance Quality").unwrap();
    assert!(general < security && security < compliance);
}

#[tokio::test]
async fn test_failed_reviewer_counts_as_low() {
    let security = Arc::new(ScriptedCapability::failing("Security", "HTTP 503"));
    let editor = Arc::new(ScriptedCapability::always("editor", "v1"));
    let result = refine_loop(security, editor)
        .with_max_iterations(2)
        .refine("v0")
        .await
        .unwrap();

    assert_eq!(result.state.phase, Phase::Exhausted);
    assert_eq!(result.state.errors.len(), 2);
    assert!(result.state.errors.iter().all(|e| e.node == "review.Security"));
}

#[tokio::test]
async fn test_section_router_visits_each_section_once() {
    let generator = Arc::new(ScriptedCapability::echo("writer", "section"));
    let pipeline = SectionPipeline::new(
        generator.clone(),
        Arc::new(ScriptedCapability::always("reviewer", "Add a diagram.")),
        Arc::new(ScriptedCapability::echo("editor", "content")),
    );
    let tasks = ["# Overview", "# Design", "# Operations"]
        .iter()
        .map(|h| SectionTask::new(*h, "Describe it"))
        .collect();

    let result = pipeline.run(tasks).await.unwrap();

    for node in [GENERATE_NODE, REVIEW_NODE, IMPROVE_NODE, FINALIZE_NODE] {
        assert_eq!(result.visits(node), 3, "{}", node);
    }
    assert_eq!(result.state.current_index, 2);
    let generated_for: Vec<String> = generator
        .inputs()
        .iter()
        .map(|i| i.get("section").unwrap().to_string())
        .collect();
    assert_eq!(generated_for, ["# Overview", "# Design", "# Operations"]);
    assert_eq!(
        result.state.sections[2].content.as_deref(),
        Some("# Operations")
    );
}

#[tokio::test]
async fn test_section_pipeline_continue_policy() {
    let pipeline = SectionPipeline::new(
        Arc::new(ScriptedCapability::sequence("writer", &["one", "two"])),
        Arc::new(ScriptedCapability::failing("reviewer", "HTTP 500")),
        Arc::new(ScriptedCapability::always("editor", "better")),
    )
    .with_executor(ExecutorConfig::default().with_on_error(ErrorPolicy::Continue));

    let (document, result) = pipeline
        .generate_document("# A\nWrite A.\n# B\nWrite B.")
        .await
        .unwrap();

    // review failed twice, improve had no feedback twice
    assert_eq!(result.state.errors.len(), 4);
    assert_eq!(document, "# A\n\none\n\n# B\n\ntwo");
}

#[tokio::test]
async fn test_slow_analyst_times_out_into_failure_record() {
    let panel = ReviewPanel::new(ReviewMode::Parallel)
        .with_executor(ExecutorConfig {
            node_timeout: Some(Duration::from_millis(50)),
            ..ExecutorConfig::default()
        })
        .with_analyst(Arc::new(StaticAnalyst::rated("fast", Severity::Low)))
        .with_analyst(Arc::new(
            StaticAnalyst::rated("slow", Severity::High).with_delay(Duration::from_secs(5)),
        ));

    let result = panel.review("doc", None).await.unwrap();
    let report = result.state.report.unwrap();
    assert_eq!(report.failed_participants, vec!["slow"]);
    assert_eq!(report.overall_severity, Severity::Low);
    assert!(result.state.errors[0].message.contains("timeout"));
}

#[tokio::test]
async fn test_all_analysts_failing_aborts_review() {
    let panel = ReviewPanel::new(ReviewMode::Parallel)
        .with_analyst(Arc::new(StaticAnalyst::failing("a", "HTTP 500")))
        .with_analyst(Arc::new(StaticAnalyst::failing("b", "HTTP 500")));
    assert!(matches!(
        panel.review("doc", None).await,
        Err(RedlineError::EmptyAggregation)
    ));
}

#[tokio::test]
async fn test_review_document_from_disk_with_llm_analysts() {
    let (_dir, path) = fixture_file("design.md", b"# Design\nSingle region, no backups.\n");
    let document = redline_ingest::load_document(&path).unwrap();

    let config = config_from_toml(
        r#"
[model]
model_id = "test-model"
"#,
    );
    let reply = r#"```json
{"findings": ["No backups"], "recommendations": ["Add backups"], "severity": "HIGH", "confidence": 0.9}
```"#;
    let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm::new(&[reply; 5]));
    let panel = ReviewPanel::from_config(&config, llm);
    assert_eq!(panel.participants().len(), 5);

    let result = panel
        .review(document.text, Some(path.display().to_string()))
        .await
        .unwrap();
    let report = result.state.report.unwrap();

    assert_eq!(report.overall_severity, Severity::High);
    assert_eq!(report.findings.len(), 5);
    assert_eq!(report.findings[0], "[enterprise] No backups");
    assert!(report.failed_participants.is_empty());
}

#[test]
fn test_unsupported_input_rejected_before_run() {
    let (_dir, path) = fixture_file("design.doc", b"\xd0\xcf\x11\xe0");
    let err = redline_ingest::load_document(&path).unwrap_err();
    assert!(matches!(err, RedlineError::UnsupportedFormat(_)));
    assert!(err.is_unsupported_input());
}
