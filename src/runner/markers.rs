//! Worker output parsing: progress markers, artifacts, summary, JSON
//!
//! Workers report progress by printing marker lines on stdout:
//!
//! ```text
//! [STAGE] implement
//! [PROGRESS] 40
//! ```
//!
//! Markers are advisory. Malformed markers are treated as ordinary output.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static STAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[STAGE\]\s+(\S.*?)\s*$").unwrap());

static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[PROGRESS\]\s+(\d{1,3}(?:\.\d+)?)\s*%?\s*$").unwrap());

static ARTIFACT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:[-*]\s+)?(?:created|modified|updated|wrote|added)(?:\s+file)?\s*:?\s+`?([\w./-]+[\w/-])`?",
    )
    .unwrap()
});

/// A progress marker found in worker output
#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    Stage(String),
    Progress(f64),
}

/// Parse a single output line as a marker
pub fn parse_marker(line: &str) -> Option<Marker> {
    if let Some(caps) = STAGE_RE.captures(line) {
        return Some(Marker::Stage(caps[1].to_string()));
    }
    if let Some(caps) = PROGRESS_RE.captures(line) {
        let value: f64 = caps[1].parse().ok()?;
        return Some(Marker::Progress(value.clamp(0.0, 100.0)));
    }
    None
}

/// Files the worker says it created or modified, in order, without duplicates
pub fn extract_artifacts<'a>(lines: impl IntoIterator<Item = &'a String>) -> Vec<String> {
    let mut artifacts: Vec<String> = Vec::new();
    for line in lines {
        if let Some(caps) = ARTIFACT_RE.captures(line) {
            let path = caps[1].to_string();
            if !artifacts.contains(&path) {
                artifacts.push(path);
            }
        }
    }
    artifacts
}

/// Last meaningful line of output
pub fn summarize<'a>(lines: impl DoubleEndedIterator<Item = &'a String>) -> Option<String> {
    lines
        .rev()
        .map(|l| l.trim())
        .find(|l| !l.is_empty() && !l.starts_with("```") && parse_marker(l).is_none())
        .map(String::from)
}

/// Extract a JSON object from worker output
///
/// Looks in ```json fences, then bare fences, then the whole text, then the
/// first balanced `{...}` span.
pub fn extract_json(text: &str) -> Option<Value> {
    fenced_json(text, "```json")
        .or_else(|| fenced_json(text, "```"))
        .or_else(|| serde_json::from_str::<Value>(text.trim()).ok())
        .or_else(|| balanced_object(text))
        .filter(|v| v.is_object())
}

fn fenced_json(text: &str, fence: &str) -> Option<Value> {
    let mut rest = text;
    while let Some(start) = rest.find(fence) {
        let after = &rest[start + fence.len()..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        let end = body.find("```")?;
        if let Ok(value) = serde_json::from_str::<Value>(body[..end].trim()) {
            return Some(value);
        }
        rest = &body[end + 3..];
    }
    None
}

fn balanced_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return serde_json::from_str(&text[start..start + i + 1]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// The marker protocol as explained to workers
pub fn protocol_description() -> &'static str {
    "Report progress on stdout using marker lines:\n\
     [STAGE] <stage name>   when you begin a stage\n\
     [PROGRESS] <0-100>     for progress within the current stage\n\
     Mention each file you touch as `Created: <path>` or `Modified: <path>`."
}
