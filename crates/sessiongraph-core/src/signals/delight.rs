//! Delight detectors

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::graph::{NodeContent, Outcome};
use crate::session::SessionEntry;

use super::SignalConfig;

pub(crate) const RECOVERY_WEIGHT: f64 = 0.3;
pub(crate) const ONE_SHOT_WEIGHT: f64 = 0.4;
pub(crate) const PRAISE_WEIGHT: f64 = 0.3;

const PRAISE_PATTERN: &str = r"(?i)\b(thanks|thank you|perfect|awesome|excellent|brilliant|amazing|well done|great (job|work)|nice (job|work)|love it|works now|that did it)\b";

fn praise_regex() -> Option<&'static Regex> {
    static PRAISE: OnceLock<Option<Regex>> = OnceLock::new();
    PRAISE.get_or_init(|| Regex::new(PRAISE_PATTERN).ok()).as_ref()
}

/// Tool errors fixed by a later successful call of the same tool before the user spoke
pub fn resilient_recoveries(entries: &[SessionEntry]) -> u32 {
    let mut recoveries = 0;
    let mut failing: HashSet<&str> = HashSet::new();

    for message in entries.iter().filter_map(SessionEntry::message) {
        if message.is_user() {
            failing.clear();
            continue;
        }
        if !message.is_tool_result() {
            continue;
        }

        let tool = message.tool_name.as_deref().unwrap_or("");
        if message.is_error {
            failing.insert(tool);
        } else if failing.remove(tool) {
            recoveries += 1;
        }
    }
    recoveries
}

/// A non-trivial task finished successfully from a single user prompt
pub fn one_shot_success(entries: &[SessionEntry], content: &NodeContent, config: &SignalConfig) -> bool {
    if content.outcome != Outcome::Success {
        return false;
    }

    let messages = entries.iter().filter_map(SessionEntry::message);
    let (user_turns, tool_calls) = messages.fold((0usize, 0usize), |(users, calls), m| {
        (users + m.is_user() as usize, calls + m.tool_calls().len())
    });

    let complex = tool_calls >= config.one_shot_min_tool_calls
        || content.files_touched.len() >= config.one_shot_min_files;
    complex && user_turns == 1
}

/// User messages that express satisfaction
pub fn explicit_praise(entries: &[SessionEntry]) -> u32 {
    let Some(praise) = praise_regex() else {
        return 0;
    };

    entries
        .iter()
        .filter_map(SessionEntry::message)
        .filter(|m| m.is_user() && praise.is_match(&m.text()))
        .count() as u32
}
