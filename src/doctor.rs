use std::collections::HashSet;

use redline_core::config::AppConfig;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

pub fn run_doctor(config: &AppConfig) {
    let checks = vec![
        check_api_key(config),
        check_fallbacks(config),
        check_participants(config),
        check_dimensions(config),
        check_limits(config),
    ];

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
}

fn has_key(key: Option<&String>) -> bool {
    key.map_or(false, |k| !k.is_empty() && !k.starts_with("${"))
}

fn check_api_key(config: &AppConfig) -> CheckResult {
    let provider = &config.model.provider;
    let needs_key = provider != "ollama";

    if !needs_key || has_key(config.model.api_key.as_ref()) {
        CheckResult {
            label: "API Key".into(),
            ok: true,
            detail: format!("Configured for {} ({})", config.model.model_id, provider),
        }
    } else {
        CheckResult {
            label: "API Key".into(),
            ok: false,
            detail: format!("No API key set for provider '{}'", provider),
        }
    }
}

fn check_fallbacks(config: &AppConfig) -> CheckResult {
    let missing: Vec<&str> = config
        .fallback_models
        .iter()
        .filter(|m| m.provider != "ollama" && !has_key(m.api_key.as_ref()))
        .map(|m| m.model_id.as_str())
        .collect();

    if !missing.is_empty() {
        CheckResult {
            label: "Fallbacks".into(),
            ok: false,
            detail: format!("No API key for: {}", missing.join(", ")),
        }
    } else if config.fallback_models.is_empty() {
        CheckResult {
            label: "Fallbacks".into(),
            ok: true,
            detail: "None configured".into(),
        }
    } else {
        CheckResult {
            label: "Fallbacks".into(),
            ok: true,
            detail: format!("{} configured", config.fallback_models.len()),
        }
    }
}

/// Names that are empty or repeated.
fn bad_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut bad = Vec::new();
    for name in names {
        if name.trim().is_empty() {
            bad.push("(empty name)".to_string());
        } else if !seen.insert(name) {
            bad.push(format!("'{}' repeated", name));
        }
    }
    bad
}

fn check_participants(config: &AppConfig) -> CheckResult {
    let participants = &config.review.participants;
    let bad = bad_names(participants.iter().map(|p| p.name.as_str()));

    if participants.is_empty() {
        CheckResult {
            label: "Review".into(),
            ok: false,
            detail: "No participants configured".into(),
        }
    } else if !bad.is_empty() {
        CheckResult {
            label: "Review".into(),
            ok: false,
            detail: bad.join(", "),
        }
    } else {
        let names: Vec<&str> = participants.iter().map(|p| p.name.as_str()).collect();
        CheckResult {
            label: "Review".into(),
            ok: true,
            detail: format!("{:?} mode: {}", config.review.mode, names.join(", ")),
        }
    }
}

fn check_dimensions(config: &AppConfig) -> CheckResult {
    let dimensions = &config.refine.dimensions;
    let bad = bad_names(dimensions.iter().map(|d| d.name.as_str()));

    if dimensions.is_empty() {
        CheckResult {
            label: "Quality gate".into(),
            ok: false,
            detail: "No dimensions configured".into(),
        }
    } else if !bad.is_empty() {
        CheckResult {
            label: "Quality gate".into(),
            ok: false,
            detail: bad.join(", "),
        }
    } else if config.refine.max_iterations == 0 {
        CheckResult {
            label: "Quality gate".into(),
            ok: false,
            detail: "max_iterations must be at least 1".into(),
        }
    } else {
        let names: Vec<&str> = dimensions.iter().map(|d| d.name.as_str()).collect();
        CheckResult {
            label: "Quality gate".into(),
            ok: true,
            detail: format!(
                "{} (max {} rounds)",
                names.join(", "),
                config.refine.max_iterations
            ),
        }
    }
}

fn check_limits(config: &AppConfig) -> CheckResult {
    let wf = &config.workflow;

    if wf.max_steps == 0 {
        return CheckResult {
            label: "Limits".into(),
            ok: false,
            detail: "max_steps is 0, no node can run".into(),
        };
    }
    if wf.deadline_secs > 0 && wf.node_timeout_secs > wf.deadline_secs {
        return CheckResult {
            label: "Limits".into(),
            ok: false,
            detail: format!(
                "node_timeout_secs ({}) > deadline_secs ({})",
                wf.node_timeout_secs, wf.deadline_secs
            ),
        };
    }

    let secs = |s: u64| if s == 0 { "none".to_string() } else { format!("{}s", s) };
    CheckResult {
        label: "Limits".into(),
        ok: true,
        detail: format!(
            "{} steps, node timeout {}, deadline {}, on_error {:?} (sections {:?})",
            wf.max_steps,
            secs(wf.node_timeout_secs),
            secs(wf.deadline_secs),
            wf.on_error,
            config.sections_error_policy()
        ),
    }
}
