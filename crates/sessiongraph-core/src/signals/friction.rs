//! Friction detectors
//!
//! Each detector walks the raw entries of one segment and counts a single
//! pattern of struggle.

use std::collections::HashMap;

use crate::graph::Outcome;
use crate::session::{EntryKind, SessionEntry};

use super::SignalConfig;

pub(crate) const REPHRASE_WEIGHT: f64 = 0.3;
pub(crate) const CHURN_WEIGHT: f64 = 0.1;
pub(crate) const TOOL_LOOP_WEIGHT: f64 = 0.25;
pub(crate) const ABANDONED_RESTART_WEIGHT: f64 = 0.4;
pub(crate) const SILENT_TERMINATION_WEIGHT: f64 = 0.2;

/// Runs of consecutive user messages with no tool call in between
pub fn rephrasing_cascades(entries: &[SessionEntry], config: &SignalConfig) -> u32 {
    let mut cascades = 0;
    let mut run = 0u32;

    for message in entries.iter().filter_map(SessionEntry::message) {
        if message.is_user() {
            run += 1;
        } else if message.is_tool_result() || !message.tool_calls().is_empty() {
            if run >= config.rephrase_threshold {
                cascades += 1;
            }
            run = 0;
        }
    }
    if run >= config.rephrase_threshold {
        cascades += 1;
    }
    cascades
}

/// Model switches plus files read repeatedly
pub fn context_churn(entries: &[SessionEntry], config: &SignalConfig) -> u32 {
    let mut switches = 0;
    let mut current_model: Option<&str> = None;
    let mut reads: HashMap<&str, u32> = HashMap::new();

    for entry in entries {
        match &entry.kind {
            EntryKind::ModelChange { model_id, .. } => {
                if current_model.is_some_and(|m| m != model_id.as_str()) {
                    switches += 1;
                }
                current_model = Some(model_id.as_str());
            }
            EntryKind::Message { message } => {
                if current_model.is_none() {
                    current_model = message.model.as_deref();
                }
                for call in message.tool_calls() {
                    if !is_read_tool(&call.name) {
                        continue;
                    }
                    if let Some(path) = call.path() {
                        *reads.entry(path).or_default() += 1;
                    }
                }
            }
            _ => {}
        }
    }

    let reread = reads
        .values()
        .filter(|count| **count >= config.reread_threshold)
        .count() as u32;
    switches + reread
}

/// Tool and error-class pairs that failed repeatedly
pub fn tool_loops(entries: &[SessionEntry], config: &SignalConfig) -> u32 {
    let mut failures: HashMap<(String, String), u32> = HashMap::new();

    for message in entries.iter().filter_map(SessionEntry::message) {
        if !(message.is_tool_result() && message.is_error) {
            continue;
        }
        let tool = message.tool_name.clone().unwrap_or_default();
        *failures.entry((tool, error_class(&message.text()))).or_default() += 1;
    }

    failures
        .values()
        .filter(|count| **count >= config.tool_loop_threshold)
        .count() as u32
}

/// Segment ended badly and the agent never wrapped up in prose
pub fn silent_termination(entries: &[SessionEntry], outcome: Outcome) -> bool {
    if outcome == Outcome::Success {
        return false;
    }

    let last = entries.iter().rev().find_map(SessionEntry::message);
    !last.is_some_and(|m| m.is_assistant() && m.has_text() && m.tool_calls().is_empty())
}

/// Coarse class of a tool error: first line, lowercased, quoted parts and digits dropped
pub fn error_class(text: &str) -> String {
    let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");

    let mut class = String::new();
    let mut in_quote = false;
    for c in first_line.chars() {
        match c {
            '\'' | '"' | '`' => in_quote = !in_quote,
            _ if in_quote || c.is_ascii_digit() => {}
            _ if c.is_alphanumeric() => class.extend(c.to_lowercase()),
            _ => class.push(' '),
        }
    }
    class.split_whitespace().take(6).collect::<Vec<_>>().join(" ")
}

fn is_read_tool(name: &str) -> bool {
    matches!(name.to_lowercase().as_str(), "read" | "read_file" | "view" | "cat")
}
