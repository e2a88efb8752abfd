//! Friction and delight signals
//!
//! Scores how a segment went for the person driving the agent. Scoring is a
//! pure function of the node, its predecessor in the same project and the raw
//! segment entries; [`SignalEngine`] adds the store lookup and write-back.

mod delight;
mod friction;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::{DelightSignals, FrictionSignals, GraphStore, Node, NodeSignals, Outcome};
use crate::session::SessionEntry;

pub use delight::{explicit_praise, one_shot_success, resilient_recoveries};
pub use friction::{context_churn, error_class, rephrasing_cascades, silent_termination, tool_loops};

/// Detector thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Maximum gap between an abandoned node and its restart
    pub abandoned_restart_minutes: i64,
    /// Consecutive user messages that make a rephrasing cascade
    pub rephrase_threshold: u32,
    /// Reads of one file that count as churn
    pub reread_threshold: u32,
    /// Failures of one tool with one error class that make a loop
    pub tool_loop_threshold: u32,
    pub one_shot_min_tool_calls: usize,
    pub one_shot_min_files: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            abandoned_restart_minutes: 30,
            rephrase_threshold: 3,
            reread_threshold: 3,
            tool_loop_threshold: 3,
            one_shot_min_tool_calls: 5,
            one_shot_min_files: 3,
        }
    }
}

impl SignalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.abandoned_restart_minutes <= 0 {
            return Err(Error::Configuration(
                "signals.abandoned_restart_minutes must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("signals.rephrase_threshold", self.rephrase_threshold),
            ("signals.reread_threshold", self.reread_threshold),
            ("signals.tool_loop_threshold", self.tool_loop_threshold),
        ] {
            if value < 2 {
                return Err(Error::Configuration(format!("{name} must be at least 2, got {value}")));
            }
        }
        Ok(())
    }
}

/// Whether `node` restarts work its predecessor abandoned shortly before
///
/// Requires the same project, an abandoned predecessor, a gap within the
/// configured window and at least one file touched by both.
pub fn abandoned_restart(node: &Node, predecessor: Option<&Node>, config: &SignalConfig) -> bool {
    let Some(prev) = predecessor else {
        return false;
    };
    if prev.content.outcome != Outcome::Abandoned
        || prev.classification.project != node.classification.project
    {
        return false;
    }

    let gap = node.metadata.timestamp - prev.metadata.timestamp;
    if gap < Duration::zero() || gap > Duration::minutes(config.abandoned_restart_minutes) {
        return false;
    }

    prev.content
        .files_touched
        .iter()
        .any(|f| node.content.files_touched.contains(f))
}

/// Compute friction and delight for one node
///
/// Manual flags are not produced here; the caller keeps whatever is stored.
pub fn compute_signals(
    node: &Node,
    predecessor: Option<&Node>,
    entries: &[SessionEntry],
    config: &SignalConfig,
) -> NodeSignals {
    let mut friction = FrictionSignals {
        score: 0.0,
        rephrasing_cascades: rephrasing_cascades(entries, config),
        context_churn: context_churn(entries, config),
        tool_loops: tool_loops(entries, config),
        abandoned_restart: abandoned_restart(node, predecessor, config),
        silent_termination: silent_termination(entries, node.content.outcome),
    };
    friction.score = (friction::REPHRASE_WEIGHT * friction.rephrasing_cascades as f64
        + friction::CHURN_WEIGHT * friction.context_churn as f64
        + friction::TOOL_LOOP_WEIGHT * friction.tool_loops as f64
        + friction::ABANDONED_RESTART_WEIGHT * flag(friction.abandoned_restart)
        + friction::SILENT_TERMINATION_WEIGHT * flag(friction.silent_termination))
    .clamp(0.0, 1.0);

    let mut delight = DelightSignals {
        score: 0.0,
        resilient_recoveries: resilient_recoveries(entries),
        one_shot_success: one_shot_success(entries, &node.content, config),
        explicit_praise: explicit_praise(entries),
    };
    delight.score = (delight::RECOVERY_WEIGHT * delight.resilient_recoveries as f64
        + delight::ONE_SHOT_WEIGHT * flag(delight.one_shot_success)
        + delight::PRAISE_WEIGHT * delight.explicit_praise as f64)
        .clamp(0.0, 1.0);

    NodeSignals {
        friction,
        delight,
        manual_flags: Vec::new(),
    }
}

fn flag(value: bool) -> f64 {
    if value { 1.0 } else { 0.0 }
}

/// Evaluates nodes against the store and writes their signals back
#[derive(Debug, Clone)]
pub struct SignalEngine {
    store: GraphStore,
    config: SignalConfig,
}

impl SignalEngine {
    pub fn new(store: GraphStore, config: SignalConfig) -> Self {
        Self { store, config }
    }

    /// Score `node` against its predecessor and store the result
    ///
    /// Returns the signals as stored, manual flags included.
    pub async fn evaluate(&self, node: &Node, entries: &[SessionEntry]) -> Result<NodeSignals> {
        let predecessor = self
            .store
            .find_previous_project_node(&node.classification.project, node.metadata.timestamp)
            .await?;

        let mut signals = compute_signals(node, predecessor.as_ref(), entries, &self.config);
        self.store.set_signals(&node.id, &signals).await?;

        signals.manual_flags = node
            .signals
            .as_ref()
            .map(|s| s.manual_flags.clone())
            .unwrap_or_default();

        debug!(
            node_id = %node.id,
            predecessor = predecessor.as_ref().map(|p| p.id.as_str()).unwrap_or("-"),
            friction = signals.friction.score,
            delight = signals.delight.score,
            "Signals evaluated"
        );
        Ok(signals)
    }
}
