use std::io::Write;

use redline_core::config::{AppConfig, ErrorPolicy, ReviewMode};
use redline_core::error::RedlineError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[model]
provider = "anthropic"
model_id = "claude-sonnet-4-20250514"
api_key = "sk-test-key"
max_tokens = 4096
temperature = 0.5

[model.retry]
max_retries = 2

[[fallback_models]]
provider = "openai"
model_id = "gpt-4o"
api_key = "sk-fallback"

[workflow]
max_steps = 50
node_timeout_secs = 30
deadline_secs = 0
on_error = "continue"

[review]
mode = "sequential"

[[review.participants]]
name = "security"
prompt = "You are a security architect."

[[review.participants]]
name = "aws"

[review.participants.model]
provider = "openai"
model_id = "gpt-4o-mini"

[refine]
max_iterations = 3

[[refine.dimensions]]
name = "Security"

[[refine.dimensions]]
name = "Cost"
prompt = "You care about cloud spend."

[sections]
on_error = "halt"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "anthropic");
    assert_eq!(config.model.model_id, "claude-sonnet-4-20250514");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.model.max_tokens, 4096);
    assert_eq!(config.model.retry.as_ref().map(|r| r.max_retries), Some(2));
    assert_eq!(config.fallback_models.len(), 1);

    assert_eq!(config.workflow.max_steps, 50);
    assert_eq!(config.workflow.deadline_secs, 0);
    assert_eq!(config.workflow.on_error, ErrorPolicy::Continue);

    assert_eq!(config.review.mode, ReviewMode::Sequential);
    assert_eq!(config.review.participants.len(), 2);
    assert!(config.review.participants[0].model.is_none());
    let aws_model = config.review.participants[1].model.as_ref().expect("override");
    assert_eq!(aws_model.model_id, "gpt-4o-mini");

    assert_eq!(config.refine.max_iterations, 3);
    assert_eq!(config.refine.dimensions[1].name, "Cost");
    assert_eq!(config.sections_error_policy(), ErrorPolicy::Halt);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("REDLINE_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[model]
model_id = "test-model"
api_key = "${REDLINE_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("REDLINE_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[model]
model_id = "llama3.2"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.workflow.node_timeout_secs, 300);
    assert_eq!(config.workflow.deadline_secs, 3600);
    assert_eq!(config.workflow.on_error, ErrorPolicy::Halt);
    assert_eq!(config.review.mode, ReviewMode::Parallel);
    assert_eq!(config.review.participants.len(), 5);
    assert_eq!(config.refine.dimensions.len(), 5);
    assert!(config.fallback_models.is_empty());
    assert!(config.sections.on_error.is_none());
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = AppConfig::load(&dir.path().join("redline.toml")).unwrap_err();
    assert!(matches!(err, RedlineError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_config_is_config_error() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[workflow]\nmax_steps = 10\n").expect("write toml");

    // [model] is required
    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, RedlineError::Config(_)));
    assert!(err.is_structural());
}
