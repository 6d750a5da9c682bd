use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// One markdown section: its header line and the trimmed body below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub header: String,
    pub body: String,
}

impl Section {
    pub fn new(header: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            body: body.into(),
        }
    }
}

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#+\s+\S").expect("valid header regex"))
}

fn is_fence(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

/// Split markdown into sections, one per header line.
///
/// Header lines inside fenced code blocks are body text. Anything before the
/// first header is dropped.
pub fn split_sections(markdown: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;
    let mut in_fence = false;

    for line in markdown.lines() {
        if is_fence(line) {
            in_fence = !in_fence;
        } else if !in_fence && header_re().is_match(line) {
            if let Some((header, body)) = current.take() {
                sections.push(Section::new(header, body.join("\n").trim()));
            }
            current = Some((line.trim_end().to_string(), Vec::new()));
            continue;
        }

        if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }

    if let Some((header, body)) = current {
        sections.push(Section::new(header, body.join("\n").trim()));
    }

    sections
}

/// Join sections back into one document: `header + "\n\n" + body` per
/// section, separated by a blank line.
pub fn assemble(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|s| format!("{}\n\n{}", s.header, s.body))
        .collect::<Vec<_>>()
        .join("\n\n")
}
