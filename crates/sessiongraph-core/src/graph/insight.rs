//! Aggregated insights and prompt effectiveness
//!
//! Insights are recomputed periodically from node observations. The insight
//! id is a hash of what the pattern is about, so a recompute updates the
//! existing row instead of adding another one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::storage::{format_timestamp, parse_optional_timestamp, parse_timestamp};

use super::node::Severity;
use super::store::GraphStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    Quirk,
    Win,
    Failure,
    ToolError,
    Lesson,
}

impl InsightType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quirk => "quirk",
            Self::Win => "win",
            Self::Failure => "failure",
            Self::ToolError => "tool_error",
            Self::Lesson => "lesson",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quirk" => Some(Self::Quirk),
            "win" => Some(Self::Win),
            "failure" => Some(Self::Failure),
            "tool_error" => Some(Self::ToolError),
            "lesson" => Some(Self::Lesson),
            _ => None,
        }
    }
}

/// Mitigating prompt text attached to an insight by an operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightPrompt {
    pub text: String,
    pub version: String,
    pub added_at: DateTime<Utc>,
}

/// A recurring pattern observed across nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedInsight {
    pub id: String,
    pub insight_type: InsightType,
    pub model: Option<String>,
    pub tool: Option<String>,
    pub pattern: String,
    pub frequency: u32,
    pub confidence: f64,
    pub severity: Severity,
    pub workaround: Option<String>,
    /// Node ids showing the pattern, oldest first
    pub examples: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub prompt: Option<InsightPrompt>,
}

/// Stable id for an insight: type, model, tool and normalized pattern
pub fn insight_id(insight_type: InsightType, model: Option<&str>, tool: Option<&str>, pattern: &str) -> String {
    let normalized = normalize_pattern(pattern);
    let mut hasher = Sha256::new();
    for part in [insight_type.as_str(), model.unwrap_or(""), tool.unwrap_or(""), normalized.as_str()] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Lowercase, strip punctuation and collapse whitespace
pub fn normalize_pattern(pattern: &str) -> String {
    pattern
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Before/after comparison of an insight's occurrence rate around its prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptEffectiveness {
    pub id: String,
    pub insight_id: String,
    pub prompt_version: String,
    pub before_occurrences: u32,
    pub before_sessions: u32,
    pub after_occurrences: u32,
    pub after_sessions: u32,
    pub before_rate: f64,
    pub after_rate: f64,
    /// Relative drop in occurrence rate, in percent
    pub improvement_pct: f64,
    pub statistically_significant: bool,
    pub measured_at: DateTime<Utc>,
}

impl GraphStore {
    /// Insert or refresh an insight and link its example nodes
    ///
    /// Operator-managed prompt fields are never touched here.
    pub async fn upsert_insight(&self, insight: &AggregatedInsight) -> Result<()> {
        let now = format_timestamp(Utc::now());
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO aggregated_insights (
                id, insight_type, model, tool, pattern, frequency, confidence, severity,
                workaround, examples, first_seen, last_seen, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                frequency = excluded.frequency,
                confidence = excluded.confidence,
                severity = excluded.severity,
                workaround = COALESCE(excluded.workaround, workaround),
                examples = excluded.examples,
                first_seen = MIN(first_seen, excluded.first_seen),
                last_seen = MAX(last_seen, excluded.last_seen),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&insight.id)
        .bind(insight.insight_type.as_str())
        .bind(&insight.model)
        .bind(&insight.tool)
        .bind(&insight.pattern)
        .bind(insight.frequency as i64)
        .bind(insight.confidence)
        .bind(insight.severity.as_str())
        .bind(&insight.workaround)
        .bind(serde_json::to_string(&insight.examples)?)
        .bind(format_timestamp(insight.first_seen))
        .bind(format_timestamp(insight.last_seen))
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        for node_id in &insight.examples {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO insight_nodes (insight_id, node_id, observed_at)
                SELECT ?, n.id, n.timestamp FROM nodes n
                WHERE n.id = ?
                ORDER BY n.version DESC
                LIMIT 1
                "#,
            )
            .bind(&insight.id)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(insight_id = %insight.id, frequency = insight.frequency, "Insight upserted");
        Ok(())
    }

    pub async fn get_insight(&self, id: &str) -> Result<Option<AggregatedInsight>> {
        let row: Option<InsightRow> = sqlx::query_as("SELECT * FROM aggregated_insights WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        row.map(InsightRow::into_insight).transpose()
    }

    /// Insights by descending frequency, optionally of one type
    pub async fn list_insights(&self, insight_type: Option<InsightType>, limit: usize) -> Result<Vec<AggregatedInsight>> {
        let rows: Vec<InsightRow> = sqlx::query_as(
            r#"
            SELECT * FROM aggregated_insights
            WHERE ? IS NULL OR insight_type = ?
            ORDER BY frequency DESC, last_seen DESC
            LIMIT ?
            "#,
        )
        .bind(insight_type.map(|t| t.as_str()))
        .bind(insight_type.map(|t| t.as_str()))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(InsightRow::into_insight).collect()
    }

    /// Insights that have an active mitigating prompt
    pub async fn insights_with_prompts(&self) -> Result<Vec<AggregatedInsight>> {
        let rows: Vec<InsightRow> = sqlx::query_as(
            r#"
            SELECT * FROM aggregated_insights
            WHERE prompt_included = 1 AND prompt_added_at IS NOT NULL
            ORDER BY prompt_added_at ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(InsightRow::into_insight).collect()
    }

    /// Attach a mitigating prompt to an insight
    pub async fn set_insight_prompt(&self, insight_id: &str, prompt: &InsightPrompt) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE aggregated_insights
            SET prompt_text = ?, prompt_version = ?, prompt_added_at = ?,
                prompt_included = 1, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&prompt.text)
        .bind(&prompt.version)
        .bind(format_timestamp(prompt.added_at))
        .bind(format_timestamp(Utc::now()))
        .bind(insight_id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Validation(format!("insight '{insight_id}' not found")));
        }
        info!(insight_id = %insight_id, version = %prompt.version, "Insight prompt attached");
        Ok(())
    }

    /// Occurrences of an insight among nodes timestamped in `[from, to)`
    pub async fn insight_occurrences_between(
        &self,
        insight_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u32> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM insight_nodes
            WHERE insight_id = ? AND observed_at >= ? AND observed_at < ?
            "#,
        )
        .bind(insight_id)
        .bind(format_timestamp(from))
        .bind(format_timestamp(to))
        .fetch_one(self.pool())
        .await?;
        Ok(count as u32)
    }

    /// Distinct sessions with at least one node timestamped in `[from, to)`
    pub async fn sessions_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<u32> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(DISTINCT session_file) FROM nodes
            WHERE version = 1 AND timestamp >= ? AND timestamp < ?
            "#,
        )
        .bind(format_timestamp(from))
        .bind(format_timestamp(to))
        .fetch_one(self.pool())
        .await?;
        Ok(count as u32)
    }

    pub async fn record_effectiveness(&self, measurement: &PromptEffectiveness) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO prompt_effectiveness (
                id, insight_id, prompt_version,
                before_occurrences, before_sessions, after_occurrences, after_sessions,
                before_rate, after_rate, improvement_pct, statistically_significant, measured_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&measurement.id)
        .bind(&measurement.insight_id)
        .bind(&measurement.prompt_version)
        .bind(measurement.before_occurrences as i64)
        .bind(measurement.before_sessions as i64)
        .bind(measurement.after_occurrences as i64)
        .bind(measurement.after_sessions as i64)
        .bind(measurement.before_rate)
        .bind(measurement.after_rate)
        .bind(measurement.improvement_pct)
        .bind(measurement.statistically_significant)
        .bind(format_timestamp(measurement.measured_at))
        .execute(self.pool())
        .await?;

        info!(
            insight_id = %measurement.insight_id,
            improvement_pct = measurement.improvement_pct,
            significant = measurement.statistically_significant,
            "Prompt effectiveness recorded"
        );
        Ok(())
    }

    /// Most recent measurement for an insight
    pub async fn latest_effectiveness(&self, insight_id: &str) -> Result<Option<PromptEffectiveness>> {
        let row: Option<EffectivenessRow> = sqlx::query_as(
            r#"
            SELECT * FROM prompt_effectiveness
            WHERE insight_id = ?
            ORDER BY measured_at DESC
            LIMIT 1
            "#,
        )
        .bind(insight_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(EffectivenessRow::into_effectiveness))
    }
}

/// Database row for aggregated_insights table
#[derive(Debug, FromRow)]
#[allow(dead_code)]
struct InsightRow {
    id: String,
    insight_type: String,
    model: Option<String>,
    tool: Option<String>,
    pattern: String,
    frequency: i64,
    confidence: f64,
    severity: String,
    workaround: Option<String>,
    examples: String,
    first_seen: String,
    last_seen: String,
    prompt_text: Option<String>,
    prompt_included: bool,
    prompt_version: Option<String>,
    prompt_added_at: Option<String>,
    updated_at: String,
}

impl InsightRow {
    fn into_insight(self) -> Result<AggregatedInsight> {
        let insight_type = InsightType::parse(&self.insight_type)
            .ok_or_else(|| Error::Validation(format!("unknown insight type '{}'", self.insight_type)))?;

        let prompt = match (self.prompt_included, self.prompt_text, self.prompt_version) {
            (true, Some(text), Some(version)) => Some(InsightPrompt {
                text,
                version,
                added_at: parse_optional_timestamp(self.prompt_added_at.as_deref())
                    .unwrap_or_else(|| parse_timestamp(&self.updated_at)),
            }),
            _ => None,
        };

        Ok(AggregatedInsight {
            id: self.id,
            insight_type,
            model: self.model,
            tool: self.tool,
            pattern: self.pattern,
            frequency: self.frequency as u32,
            confidence: self.confidence,
            severity: Severity::parse(&self.severity),
            workaround: self.workaround,
            examples: serde_json::from_str(&self.examples)?,
            first_seen: parse_timestamp(&self.first_seen),
            last_seen: parse_timestamp(&self.last_seen),
            prompt,
        })
    }
}

/// Database row for prompt_effectiveness table
#[derive(Debug, FromRow)]
struct EffectivenessRow {
    id: String,
    insight_id: String,
    prompt_version: String,
    before_occurrences: i64,
    before_sessions: i64,
    after_occurrences: i64,
    after_sessions: i64,
    before_rate: f64,
    after_rate: f64,
    improvement_pct: f64,
    statistically_significant: bool,
    measured_at: String,
}

impl EffectivenessRow {
    fn into_effectiveness(self) -> PromptEffectiveness {
        PromptEffectiveness {
            id: self.id,
            insight_id: self.insight_id,
            prompt_version: self.prompt_version,
            before_occurrences: self.before_occurrences as u32,
            before_sessions: self.before_sessions as u32,
            after_occurrences: self.after_occurrences as u32,
            after_sessions: self.after_sessions as u32,
            before_rate: self.before_rate,
            after_rate: self.after_rate,
            improvement_pct: self.improvement_pct,
            statistically_significant: self.statistically_significant,
            measured_at: parse_timestamp(&self.measured_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use chrono::TimeZone;

    async fn setup_test_store() -> GraphStore {
        let db = Database::in_memory().await.expect("Failed to create database");
        GraphStore::new(db.pool().clone())
    }

    fn insight(pattern: &str, frequency: u32) -> AggregatedInsight {
        let at = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        AggregatedInsight {
            id: insight_id(InsightType::Quirk, Some("gpt-x"), None, pattern),
            insight_type: InsightType::Quirk,
            model: Some("gpt-x".to_string()),
            tool: None,
            pattern: pattern.to_string(),
            frequency,
            confidence: 0.5,
            severity: Severity::Medium,
            workaround: None,
            examples: Vec::new(),
            first_seen: at,
            last_seen: at,
            prompt: None,
        }
    }

    #[test]
    fn test_insight_id_is_stable_under_normalization() {
        let a = insight_id(InsightType::Quirk, Some("m"), None, "Ignores  the AGENTS.md file!");
        let b = insight_id(InsightType::Quirk, Some("m"), None, "ignores the agents md file");
        let c = insight_id(InsightType::Failure, Some("m"), None, "ignores the agents md file");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[tokio::test]
    async fn test_upsert_updates_in_place_and_keeps_prompt() {
        let store = setup_test_store().await;
        let first = insight("Forgets to run tests", 2);
        store.upsert_insight(&first).await.unwrap();

        let prompt = InsightPrompt {
            text: "Always run the test suite before finishing.".to_string(),
            version: "p1".to_string(),
            added_at: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        };
        store.set_insight_prompt(&first.id, &prompt).await.unwrap();

        let mut again = insight("forgets to run tests", 5);
        again.confidence = 0.8;
        store.upsert_insight(&again).await.unwrap();

        let all = store.list_insights(None, 10).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].frequency, 5);
        assert_eq!(all[0].prompt.as_ref().map(|p| p.version.as_str()), Some("p1"));
        assert_eq!(store.insights_with_prompts().await.unwrap().len(), 1);
        assert!(store
            .list_insights(Some(InsightType::Win), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_effectiveness_round_trip() {
        let store = setup_test_store().await;
        let base = insight("loops on lint errors", 3);
        store.upsert_insight(&base).await.unwrap();

        let measurement = PromptEffectiveness {
            id: "m1".to_string(),
            insight_id: base.id.clone(),
            prompt_version: "p1".to_string(),
            before_occurrences: 12,
            before_sessions: 40,
            after_occurrences: 2,
            after_sessions: 38,
            before_rate: 0.3,
            after_rate: 2.0 / 38.0,
            improvement_pct: 82.5,
            statistically_significant: true,
            measured_at: Utc::now(),
        };
        store.record_effectiveness(&measurement).await.unwrap();

        let latest = store.latest_effectiveness(&base.id).await.unwrap().unwrap();
        assert_eq!(latest.after_occurrences, 2);
        assert!(latest.statistically_significant);
        assert!(store.latest_effectiveness("none").await.unwrap().is_none());
    }
}
