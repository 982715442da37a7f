//! Idempotent schema migrations.
//!
//! Every statement is safe to re-run; processes apply the full list at
//! startup rather than tracking migration versions.

use sqlx::PgPool;
use tracing::debug;

pub const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS cars (
        id            VARCHAR PRIMARY KEY,
        title         VARCHAR NOT NULL,
        description   VARCHAR NOT NULL DEFAULT '',
        car_type      VARCHAR NOT NULL DEFAULT 'task',
        status        VARCHAR NOT NULL DEFAULT 'open',
        priority      INTEGER NOT NULL DEFAULT 2,
        track         VARCHAR NOT NULL,
        assignee      VARCHAR NOT NULL DEFAULT '',
        parent_id     VARCHAR REFERENCES cars(id),
        branch        VARCHAR NOT NULL,
        base_branch   VARCHAR NOT NULL DEFAULT 'main',
        design_notes  VARCHAR NOT NULL DEFAULT '',
        acceptance    VARCHAR NOT NULL DEFAULT '',
        created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
        claimed_at    TIMESTAMPTZ,
        completed_at  TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS car_deps (
        car_id      VARCHAR NOT NULL REFERENCES cars(id),
        blocked_by  VARCHAR NOT NULL REFERENCES cars(id),
        kind        VARCHAR NOT NULL DEFAULT 'blocks',
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (car_id, blocked_by)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS car_progress (
        id             BIGSERIAL PRIMARY KEY,
        car_id         VARCHAR NOT NULL REFERENCES cars(id),
        engine_id      VARCHAR NOT NULL,
        session_id     VARCHAR NOT NULL DEFAULT '',
        cycle          INTEGER NOT NULL DEFAULT 0,
        note           VARCHAR NOT NULL,
        files_changed  VARCHAR NOT NULL DEFAULT '',
        created_at     TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tracks (
        name           VARCHAR PRIMARY KEY,
        language       VARCHAR NOT NULL DEFAULT '',
        conventions    JSONB NOT NULL DEFAULT '{}',
        system_prompt  VARCHAR NOT NULL DEFAULT '',
        file_patterns  JSONB NOT NULL DEFAULT '[]',
        engine_slots   INTEGER NOT NULL DEFAULT 1,
        active         BOOLEAN NOT NULL DEFAULT TRUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS engines (
        id             VARCHAR PRIMARY KEY,
        track          VARCHAR NOT NULL,
        role           VARCHAR NOT NULL DEFAULT 'engine',
        status         VARCHAR NOT NULL DEFAULT 'idle',
        current_car    VARCHAR NOT NULL DEFAULT '',
        session_id     VARCHAR NOT NULL DEFAULT '',
        started_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
        last_activity  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id            VARCHAR PRIMARY KEY,
        from_agent    VARCHAR NOT NULL,
        to_agent      VARCHAR NOT NULL,
        subject       VARCHAR NOT NULL,
        body          VARCHAR NOT NULL DEFAULT '',
        car_id        VARCHAR,
        thread_id     VARCHAR,
        priority      VARCHAR NOT NULL DEFAULT 'normal',
        acknowledged  BOOLEAN NOT NULL DEFAULT FALSE,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_acks (
        message_id  VARCHAR NOT NULL REFERENCES messages(id),
        agent       VARCHAR NOT NULL,
        acked_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (message_id, agent)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS agent_logs (
        id             BIGSERIAL PRIMARY KEY,
        engine_id      VARCHAR NOT NULL,
        session_id     VARCHAR NOT NULL,
        car_id         VARCHAR NOT NULL DEFAULT '',
        direction      VARCHAR NOT NULL,
        content        VARCHAR NOT NULL,
        input_tokens   INTEGER,
        output_tokens  INTEGER,
        token_count    INTEGER,
        model          VARCHAR NOT NULL DEFAULT '',
        latency_ms     BIGINT,
        created_at     TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reindex_jobs (
        id              VARCHAR PRIMARY KEY,
        track           VARCHAR NOT NULL,
        trigger_commit  VARCHAR NOT NULL,
        status          VARCHAR NOT NULL DEFAULT 'pending',
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_cars_track_status ON cars (track, status, priority, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_cars_parent ON cars (parent_id)",
    "CREATE INDEX IF NOT EXISTS idx_car_deps_blocked_by ON car_deps (blocked_by)",
    "CREATE INDEX IF NOT EXISTS idx_car_progress_car ON car_progress (car_id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_to_agent ON messages (to_agent, acknowledged, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_agent_logs_session ON agent_logs (session_id)",
];

pub async fn run(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in STATEMENTS {
        debug!(
            "applying migration statement: {}",
            statement.split_whitespace().take(6).collect::<Vec<_>>().join(" ")
        );
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
