//! Agent traffic capture.
//!
//! Every prompt (`in`) and output chunk (`out`) lands in `agent_logs`,
//! with token counts when the agent's stream format exposes them.

use serde::Deserialize;
use sqlx::PgPool;

use crate::error::Result;
use crate::models::LogDirection;

/// Token/model metadata parsed out of a structured stream line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub model: Option<String>,
}

#[derive(Deserialize)]
struct StreamLine {
    #[serde(default)]
    input_tokens: Option<i32>,
    #[serde(default)]
    output_tokens: Option<i32>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Deserialize)]
struct StreamUsage {
    #[serde(default)]
    input_tokens: Option<i32>,
    #[serde(default)]
    output_tokens: Option<i32>,
}

/// Best-effort parse of a JSON stream line for token counts. Plain-text
/// lines simply produce no counts.
pub fn parse_token_counts(line: &str) -> TokenCounts {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return TokenCounts::default();
    }
    let Ok(parsed) = serde_json::from_str::<StreamLine>(trimmed) else {
        return TokenCounts::default();
    };
    let (input, output) = match parsed.usage {
        Some(usage) => (
            usage.input_tokens.or(parsed.input_tokens),
            usage.output_tokens.or(parsed.output_tokens),
        ),
        None => (parsed.input_tokens, parsed.output_tokens),
    };
    TokenCounts {
        input_tokens: input,
        output_tokens: output,
        model: parsed.model,
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry<'a> {
    pub engine_id: &'a str,
    pub session_id: &'a str,
    pub car_id: &'a str,
    pub direction: LogDirection,
    pub content: &'a str,
    pub tokens: TokenCounts,
    pub latency_ms: Option<i64>,
}

#[derive(Clone)]
pub struct AgentLogStore {
    pool: PgPool,
}

impl AgentLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, entry: LogEntry<'_>) -> Result<()> {
        let token_count = match (entry.tokens.input_tokens, entry.tokens.output_tokens) {
            (None, None) => None,
            (input, output) => Some(input.unwrap_or(0) + output.unwrap_or(0)),
        };
        sqlx::query(
            r#"
            INSERT INTO agent_logs
                (engine_id, session_id, car_id, direction, content,
                 input_tokens, output_tokens, token_count, model, latency_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.engine_id)
        .bind(entry.session_id)
        .bind(entry.car_id)
        .bind(entry.direction.as_str())
        .bind(entry.content)
        .bind(entry.tokens.input_tokens)
        .bind(entry.tokens.output_tokens)
        .bind(token_count)
        .bind(entry.tokens.model.as_deref().unwrap_or(""))
        .bind(entry.latency_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
