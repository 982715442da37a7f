//! Inter-agent messaging bus.
//!
//! Durable point-to-point and broadcast messages with per-recipient
//! acknowledgement, threading, and priority ordering. Delivery is by
//! polling: consumers call `inbox` once per loop iteration; the bus never
//! blocks on anything but the store.

use sqlx::PgPool;
use tracing::debug;

use crate::error::{RailyardError, Result};
use crate::ids;
use crate::models::{Message, MessagePriority, BROADCAST};

/// Priority rank for inbox ordering; threads stay chronological.
const PRIORITY_RANK: &str =
    "CASE m.priority WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 WHEN 'normal' THEN 2 ELSE 3 END";

#[derive(Debug, Clone, Default)]
pub struct SendMessage {
    pub from_agent: String,
    pub to_agent: String,
    pub subject: String,
    pub body: String,
    pub car_id: Option<String>,
    pub thread_id: Option<String>,
    pub priority: MessagePriority,
}

#[derive(Clone)]
pub struct MessageService {
    pool: PgPool,
}

impl MessageService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append a message; returns its id.
    pub async fn send(&self, msg: SendMessage) -> Result<String> {
        if msg.to_agent.is_empty() {
            return Err(RailyardError::validation("message recipient must not be empty"));
        }
        let id = ids::message_id();
        sqlx::query(
            r#"
            INSERT INTO messages (id, from_agent, to_agent, subject, body, car_id, thread_id, priority)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&id)
        .bind(&msg.from_agent)
        .bind(&msg.to_agent)
        .bind(&msg.subject)
        .bind(&msg.body)
        .bind(&msg.car_id)
        .bind(&msg.thread_id)
        .bind(msg.priority.as_str())
        .execute(&self.pool)
        .await?;
        debug!(id = %id, to = %msg.to_agent, subject = %msg.subject, "sent message");
        Ok(id)
    }

    /// Unacknowledged messages addressed to `agent`, plus broadcasts this
    /// agent has not acknowledged yet. Most urgent first, then oldest.
    pub async fn inbox(&self, agent: &str) -> Result<Vec<Message>> {
        let sql = format!(
            r#"
            SELECT m.* FROM messages m
            WHERE (m.to_agent = $1 AND NOT m.acknowledged)
               OR (m.to_agent = '{BROADCAST}' AND NOT EXISTS (
                      SELECT 1 FROM message_acks a
                      WHERE a.message_id = m.id AND a.agent = $1))
            ORDER BY {PRIORITY_RANK}, m.created_at ASC
            "#
        );
        let messages = sqlx::query_as::<_, Message>(&sql)
            .bind(agent)
            .fetch_all(&self.pool)
            .await?;
        Ok(messages)
    }

    /// Acknowledge a message as `agent`. Idempotent. For a broadcast the
    /// acknowledgement is recorded for this agent only and the message
    /// stays live for everyone else.
    pub async fn ack(&self, message_id: &str, agent: &str) -> Result<()> {
        let message = self.fetch(message_id).await?;

        sqlx::query(
            "INSERT INTO message_acks (message_id, agent) VALUES ($1, $2)
             ON CONFLICT (message_id, agent) DO NOTHING",
        )
        .bind(message_id)
        .bind(agent)
        .execute(&self.pool)
        .await?;

        if !message.is_broadcast() && message.to_agent == agent {
            sqlx::query("UPDATE messages SET acknowledged = TRUE WHERE id = $1")
                .bind(message_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Reply to a message: same thread (the parent's thread, or the parent
    /// itself when it started one), addressed back to the sender.
    pub async fn reply(&self, parent_id: &str, from: &str, body: &str) -> Result<String> {
        let parent = self.fetch(parent_id).await?;
        let thread_id = parent.thread_id.unwrap_or_else(|| parent.id.clone());
        let subject = if parent.subject.starts_with("Re: ") {
            parent.subject.clone()
        } else {
            format!("Re: {}", parent.subject)
        };
        self.send(SendMessage {
            from_agent: from.to_string(),
            to_agent: parent.from_agent,
            subject,
            body: body.to_string(),
            car_id: parent.car_id,
            thread_id: Some(thread_id),
            priority: parent.priority,
        })
        .await
    }

    /// All messages sharing a thread, oldest first. The thread root is the
    /// message whose id equals the thread id.
    pub async fn thread(&self, thread_id: &str) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT m.* FROM messages m
             WHERE m.thread_id = $1 OR m.id = $1
             ORDER BY m.created_at ASC",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    pub async fn fetch(&self, id: &str) -> Result<Message> {
        sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RailyardError::not_found("message", id))
    }

    /// Count of undelivered traffic, for status reporting.
    pub async fn queue_depth(&self) -> Result<i64> {
        let (depth,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE NOT acknowledged")
                .fetch_one(&self.pool)
                .await?;
        Ok(depth)
    }
}
