//! Pattern aggregation
//!
//! Folds per-node observations into [`AggregatedInsight`] rows keyed by type,
//! model, tool and normalized pattern text. Model quirks and tool errors are
//! kept from their first sighting; free-text wins, failures and lessons only
//! once they recur in a second node.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::Result;
use crate::graph::{
    insight_id, normalize_pattern, AggregatedInsight, GraphStore, InsightType, Node, NodeFilters,
    Severity,
};

/// Nodes read per aggregation run
const SCAN_LIMIT: usize = 10_000;

/// Free-text patterns need this many distinct nodes
const MIN_TEXT_FREQUENCY: u32 = 2;

/// Frequency at which confidence saturates
const CONFIDENT_FREQUENCY: f64 = 5.0;

struct Accumulator {
    insight_type: InsightType,
    model: Option<String>,
    tool: Option<String>,
    pattern: String,
    severity: Severity,
    workaround: Option<String>,
    /// (timestamp, node id), one entry per node
    seen: Vec<(DateTime<Utc>, String)>,
}

#[derive(Default)]
struct Aggregator {
    by_id: BTreeMap<String, Accumulator>,
}

impl Aggregator {
    #[allow(clippy::too_many_arguments)]
    fn observe(
        &mut self,
        node: &Node,
        insight_type: InsightType,
        model: Option<&str>,
        tool: Option<&str>,
        pattern: &str,
        severity: Severity,
        workaround: Option<&str>,
    ) {
        if normalize_pattern(pattern).is_empty() {
            return;
        }
        let id = insight_id(insight_type, model, tool, pattern);
        let acc = self.by_id.entry(id).or_insert_with(|| Accumulator {
            insight_type,
            model: model.map(str::to_string),
            tool: tool.map(str::to_string),
            pattern: pattern.trim().to_string(),
            severity,
            workaround: None,
            seen: Vec::new(),
        });

        acc.severity = acc.severity.max(severity);
        if let Some(workaround) = workaround {
            acc.workaround = Some(workaround.to_string());
        }
        if !acc.seen.iter().any(|(_, id)| id == &node.id) {
            acc.seen.push((node.metadata.timestamp, node.id.clone()));
        }
    }

    fn finish(self) -> Vec<AggregatedInsight> {
        self.by_id
            .into_iter()
            .filter_map(|(id, mut acc)| {
                let frequency = acc.seen.len() as u32;
                let free_text = matches!(
                    acc.insight_type,
                    InsightType::Win | InsightType::Failure | InsightType::Lesson
                );
                if free_text && frequency < MIN_TEXT_FREQUENCY {
                    return None;
                }

                acc.seen.sort();
                let first_seen = acc.seen.first()?.0;
                let last_seen = acc.seen.last()?.0;

                Some(AggregatedInsight {
                    id,
                    insight_type: acc.insight_type,
                    model: acc.model,
                    tool: acc.tool,
                    pattern: acc.pattern,
                    frequency,
                    confidence: (frequency as f64 / CONFIDENT_FREQUENCY).min(1.0),
                    severity: acc.severity,
                    workaround: acc.workaround,
                    examples: acc.seen.into_iter().map(|(_, id)| id).collect(),
                    first_seen,
                    last_seen,
                    prompt: None,
                })
            })
            .collect()
    }
}

/// Aggregate observations across nodes
pub fn aggregate_insights(nodes: &[Node]) -> Vec<AggregatedInsight> {
    let mut aggregator = Aggregator::default();

    for node in nodes {
        let obs = &node.observations;
        for quirk in &obs.model_quirks {
            aggregator.observe(
                node,
                InsightType::Quirk,
                Some(&quirk.model),
                None,
                &quirk.observation,
                quirk.severity,
                quirk.workaround.as_deref(),
            );
        }
        for error in &obs.tool_use_errors {
            aggregator.observe(
                node,
                InsightType::ToolError,
                error.model.as_deref(),
                Some(&error.tool),
                &error.error_type,
                Severity::Medium,
                None,
            );
        }
        for win in &obs.prompting_wins {
            aggregator.observe(node, InsightType::Win, None, None, win, Severity::Low, None);
        }
        for failure in &obs.prompting_failures {
            aggregator.observe(node, InsightType::Failure, None, None, failure, Severity::Medium, None);
        }
        for (_, lesson) in node.lessons.iter() {
            aggregator.observe(node, InsightType::Lesson, None, None, &lesson.summary, Severity::Low, None);
        }
    }

    aggregator.finish()
}

/// Recompute insights from every active node
pub async fn run_pattern_aggregation(store: &GraphStore) -> Result<usize> {
    let nodes = store.list_nodes(&NodeFilters::default(), SCAN_LIMIT).await?;
    let insights = aggregate_insights(&nodes);

    for insight in &insights {
        store.upsert_insight(insight).await?;
    }

    info!(nodes = nodes.len(), insights = insights.len(), "Pattern aggregation complete");
    Ok(insights.len())
}
