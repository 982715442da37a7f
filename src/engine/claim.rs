//! Atomic claim: take the single most urgent ready car on a track.
//!
//! One statement, one transaction: a CTE selects the first eligible row
//! with `FOR UPDATE SKIP LOCKED`, the outer UPDATE flips it to `claimed`.
//! Concurrent engines on the same track can never obtain the same row;
//! losers simply see no row and re-enter the loop.

use sqlx::PgPool;
use tracing::debug;

use crate::cars::READY_CONDITION;
use crate::error::{RailyardError, Result};
use crate::models::Car;

/// Postgres error codes that mean "another claimer got there first".
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";

fn as_claim_loss(e: sqlx::Error) -> RailyardError {
    let contended = e
        .as_database_error()
        .and_then(|db| db.code())
        .map(|code| {
            code == SERIALIZATION_FAILURE || code == DEADLOCK_DETECTED || code == LOCK_NOT_AVAILABLE
        })
        .unwrap_or(false);
    if contended {
        RailyardError::ClaimLost
    } else {
        RailyardError::Store(e)
    }
}

pub async fn claim_next(pool: &PgPool, track: &str, engine_id: &str) -> Result<Option<Car>> {
    let sql = format!(
        r#"
        WITH next AS (
            SELECT c.id FROM cars c
            WHERE {READY_CONDITION} AND c.track = $1
            ORDER BY c.priority ASC, c.created_at ASC
            LIMIT 1
            FOR UPDATE OF c SKIP LOCKED
        )
        UPDATE cars
        SET status = 'claimed', assignee = $2, claimed_at = now(), updated_at = now()
        FROM next
        WHERE cars.id = next.id
        RETURNING cars.*
        "#
    );

    let mut tx = pool.begin().await?;
    let claimed = sqlx::query_as::<_, Car>(&sql)
        .bind(track)
        .bind(engine_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(as_claim_loss)?;
    tx.commit().await.map_err(as_claim_loss)?;

    if let Some(car) = &claimed {
        debug!(car = %car.id, engine = %engine_id, "claimed car");
    }
    Ok(claimed)
}
