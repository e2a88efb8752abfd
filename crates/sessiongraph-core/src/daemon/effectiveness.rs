//! Prompt effectiveness measurement
//!
//! For every insight with an active mitigating prompt, compares how often
//! the pattern occurred per session in the window before the prompt was
//! added with the window after it.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EffectivenessConfig;
use crate::error::Result;
use crate::graph::{AggregatedInsight, GraphStore, PromptEffectiveness};

/// Two-sided critical value at the 5% level
pub const Z_CRITICAL: f64 = 1.96;

/// Occurrence and session counts for one side of the comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounts {
    pub occurrences: u32,
    pub sessions: u32,
}

impl WindowCounts {
    /// Occurrences per session, zero without sessions
    pub fn rate(&self) -> f64 {
        if self.sessions == 0 {
            0.0
        } else {
            self.occurrences as f64 / self.sessions as f64
        }
    }
}

/// z statistic for the difference between two proportions
///
/// `None` when either sample is empty or the pooled variance is zero.
pub fn two_proportion_z(x1: u32, n1: u32, x2: u32, n2: u32) -> Option<f64> {
    if n1 == 0 || n2 == 0 {
        return None;
    }
    // a session can show a pattern several times; count it once
    let (x1, x2) = (x1.min(n1) as f64, x2.min(n2) as f64);
    let (n1, n2) = (n1 as f64, n2 as f64);

    let pooled = (x1 + x2) / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if se == 0.0 {
        return None;
    }
    Some((x1 / n1 - x2 / n2) / se)
}

/// Build a measurement from before/after counts
pub fn measure(
    insight_id: &str,
    prompt_version: &str,
    before: WindowCounts,
    after: WindowCounts,
    min_sessions: u32,
    measured_at: DateTime<Utc>,
) -> PromptEffectiveness {
    let before_rate = before.rate();
    let after_rate = after.rate();
    let improvement_pct = if before_rate > 0.0 {
        (before_rate - after_rate) / before_rate * 100.0
    } else {
        0.0
    };

    let enough_sessions = before.sessions >= min_sessions && after.sessions >= min_sessions;
    let statistically_significant = enough_sessions
        && two_proportion_z(before.occurrences, before.sessions, after.occurrences, after.sessions)
            .is_some_and(|z| z.abs() >= Z_CRITICAL);

    PromptEffectiveness {
        id: Uuid::new_v4().to_string(),
        insight_id: insight_id.to_string(),
        prompt_version: prompt_version.to_string(),
        before_occurrences: before.occurrences,
        before_sessions: before.sessions,
        after_occurrences: after.occurrences,
        after_sessions: after.sessions,
        before_rate,
        after_rate,
        improvement_pct,
        statistically_significant,
        measured_at,
    }
}

async fn measure_insight(
    store: &GraphStore,
    insight: &AggregatedInsight,
    config: &EffectivenessConfig,
    now: DateTime<Utc>,
) -> Result<Option<PromptEffectiveness>> {
    let Some(prompt) = &insight.prompt else {
        return Ok(None);
    };
    let added = prompt.added_at;
    if now <= added {
        return Ok(None);
    }

    let window = Duration::days(config.window_days);
    let before_start = added - window;
    let after_end = (added + window).min(now);

    let before = WindowCounts {
        occurrences: store.insight_occurrences_between(&insight.id, before_start, added).await?,
        sessions: store.sessions_between(before_start, added).await?,
    };
    let after = WindowCounts {
        occurrences: store.insight_occurrences_between(&insight.id, added, after_end).await?,
        sessions: store.sessions_between(added, after_end).await?,
    };

    Ok(Some(measure(
        &insight.id,
        &prompt.version,
        before,
        after,
        config.min_sessions,
        now,
    )))
}

/// Measure every insight that has a prompt and record the results
pub async fn run_effectiveness(
    store: &GraphStore,
    config: &EffectivenessConfig,
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut recorded = 0;
    for insight in store.insights_with_prompts().await? {
        let Some(measurement) = measure_insight(store, &insight, config, now).await? else {
            debug!(insight_id = %insight.id, "Prompt too recent to measure");
            continue;
        };
        store.record_effectiveness(&measurement).await?;
        recorded += 1;
    }

    info!(measured = recorded, "Effectiveness measurement complete");
    Ok(recorded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::test_support::sample_node;
    use crate::graph::{insight_id, InsightPrompt, InsightType, Outcome, Severity};
    use crate::storage::Database;

    fn counts(occurrences: u32, sessions: u32) -> WindowCounts {
        WindowCounts { occurrences, sessions }
    }

    #[test]
    fn test_z_statistic() {
        // 40/100 vs 10/100
        let z = two_proportion_z(40, 100, 10, 100).unwrap();
        assert!((z - 4.9).abs() < 0.05, "z = {z}");

        assert_eq!(two_proportion_z(0, 0, 1, 10), None);
        assert_eq!(two_proportion_z(0, 10, 0, 10), None);
    }

    #[test]
    fn test_significance_requires_minimum_sessions() {
        let now = Utc::now();
        let significant = measure("i", "v1", counts(40, 100), counts(10, 100), 10, now);
        assert!(significant.statistically_significant);
        assert!((significant.improvement_pct - 75.0).abs() < 1e-9);

        let too_few = measure("i", "v1", counts(4, 5), counts(0, 5), 10, now);
        assert!(!too_few.statistically_significant);
        assert!((too_few.improvement_pct - 100.0).abs() < 1e-9);

        let no_change = measure("i", "v1", counts(20, 100), counts(19, 100), 10, now);
        assert!(!no_change.statistically_significant);
    }

    #[test]
    fn test_no_baseline_means_no_improvement() {
        let m = measure("i", "v1", counts(0, 20), counts(3, 20), 10, Utc::now());
        assert_eq!(m.improvement_pct, 0.0);
        assert_eq!(m.before_rate, 0.0);
        assert!((m.after_rate - 0.15).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_run_measures_prompted_insights() {
        let db = Database::in_memory().await.unwrap();
        let store = GraphStore::new(db.pool().clone());
        let now = Utc::now();
        let added = now - Duration::days(5);

        let before = sample_node("webapp", Outcome::Failed, added - Duration::days(2));
        let after = sample_node("webapp", Outcome::Success, added + Duration::days(2));
        for node in [&before, &after] {
            store.create_node(node, None).await.unwrap();
        }

        let id = insight_id(InsightType::Quirk, Some("gpt-x"), None, "rewrites files");
        store
            .upsert_insight(&AggregatedInsight {
                id: id.clone(),
                insight_type: InsightType::Quirk,
                model: Some("gpt-x".to_string()),
                tool: None,
                pattern: "rewrites files".to_string(),
                frequency: 1,
                confidence: 0.2,
                severity: Severity::Medium,
                workaround: None,
                examples: vec![before.id.clone()],
                first_seen: before.metadata.timestamp,
                last_seen: before.metadata.timestamp,
                prompt: None,
            })
            .await
            .unwrap();

        // no prompt yet
        assert_eq!(run_effectiveness(&store, &EffectivenessConfig::default(), now).await.unwrap(), 0);

        store
            .set_insight_prompt(
                &id,
                &InsightPrompt {
                    text: "Edit with diffs only".to_string(),
                    version: "p1".to_string(),
                    added_at: added,
                },
            )
            .await
            .unwrap();
        assert_eq!(run_effectiveness(&store, &EffectivenessConfig::default(), now).await.unwrap(), 1);

        let measured = store.latest_effectiveness(&id).await.unwrap().unwrap();
        assert_eq!(measured.before_occurrences, 1);
        assert_eq!(measured.after_occurrences, 0);
        assert_eq!(measured.prompt_version, "p1");
        assert!(!measured.statistically_significant);
    }
}
