//! Execution row persistence
//!
//! One row per execution; the nested payload travels as a JSON column, the
//! fields the service filters on (status, cancel flag, timestamps) are real
//! columns.

use folio_common::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{Execution, ExecutionData, ExecutionStatus};

/// Save an execution (insert or update)
///
/// The cancel flag is deliberately left out of the update set: the worker
/// saves progress with a snapshot loaded before any stop request, and must
/// not overwrite the flag a stop wrote in the meantime. Only
/// [`request_cancel`] and [`clear_cancel`] touch that column after insert.
pub async fn save_execution(pool: &SqlitePool, execution: &Execution) -> Result<()> {
    let execution_id = execution.execution_id.to_string();
    let engine_id = execution.engine_id.to_string();
    let user_id = execution.user_id.to_string();
    let status = serde_json::to_string(&execution.status)
        .map_err(|e| folio_common::Error::Internal(format!("Failed to serialize status: {}", e)))?;
    let data = serde_json::to_string(&execution.data)
        .map_err(|e| folio_common::Error::Internal(format!("Failed to serialize data: {}", e)))?;
    let created_at = execution.created_at.to_rfc3339();
    let completed_at = execution.completed_at.map(|dt| dt.to_rfc3339());

    sqlx::query(
        r#"
        INSERT INTO executions (
            execution_id, engine_id, user_id, status, data,
            cancel_requested, created_at, completed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(execution_id) DO UPDATE SET
            status = excluded.status,
            data = excluded.data,
            completed_at = excluded.completed_at
        "#,
    )
    .bind(&execution_id)
    .bind(&engine_id)
    .bind(&user_id)
    .bind(&status)
    .bind(&data)
    .bind(execution.cancel_requested as i64)
    .bind(&created_at)
    .bind(&completed_at)
    .execute(pool)
    .await?;

    Ok(())
}

fn execution_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Execution> {
    let execution_id: String = row.get("execution_id");
    let execution_id = Uuid::parse_str(&execution_id)
        .map_err(|e| folio_common::Error::Internal(format!("Failed to parse execution_id: {}", e)))?;

    let engine_id: String = row.get("engine_id");
    let engine_id = Uuid::parse_str(&engine_id)
        .map_err(|e| folio_common::Error::Internal(format!("Failed to parse engine_id: {}", e)))?;

    let user_id: String = row.get("user_id");
    let user_id = Uuid::parse_str(&user_id)
        .map_err(|e| folio_common::Error::Internal(format!("Failed to parse user_id: {}", e)))?;

    let status: String = row.get("status");
    let status: ExecutionStatus = serde_json::from_str(&status)
        .map_err(|e| folio_common::Error::Internal(format!("Failed to deserialize status: {}", e)))?;

    let data: String = row.get("data");
    let data: ExecutionData = serde_json::from_str(&data)
        .map_err(|e| folio_common::Error::Internal(format!("Failed to deserialize data: {}", e)))?;

    let created_at: String = row.get("created_at");
    let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| folio_common::Error::Internal(format!("Failed to parse created_at: {}", e)))?
        .with_timezone(&chrono::Utc);

    let completed_at: Option<String> = row.get("completed_at");
    let completed_at = completed_at
        .map(|s| chrono::DateTime::parse_from_rfc3339(&s))
        .transpose()
        .map_err(|e| folio_common::Error::Internal(format!("Failed to parse completed_at: {}", e)))?
        .map(|dt| dt.with_timezone(&chrono::Utc));

    Ok(Execution {
        execution_id,
        engine_id,
        user_id,
        status,
        data,
        cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
        created_at,
        completed_at,
    })
}

/// Load an execution by id
pub async fn load_execution(pool: &SqlitePool, execution_id: Uuid) -> Result<Option<Execution>> {
    let row = sqlx::query(
        r#"
        SELECT execution_id, engine_id, user_id, status, data,
               cancel_requested, created_at, completed_at
        FROM executions
        WHERE execution_id = ?
        "#,
    )
    .bind(execution_id.to_string())
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(Some(execution_from_row(&row)?)),
        None => Ok(None),
    }
}

/// Flip the cancellation flag on a live execution
///
/// Workers poll this flag between node and chapter boundaries.
pub async fn request_cancel(pool: &SqlitePool, execution_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE executions SET cancel_requested = 1 WHERE execution_id = ?")
        .bind(execution_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Clear the cancellation flag ahead of a resume dispatch
pub async fn clear_cancel(pool: &SqlitePool, execution_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE executions SET cancel_requested = 0 WHERE execution_id = ?")
        .bind(execution_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Read the current cancellation flag
pub async fn cancel_requested(pool: &SqlitePool, execution_id: Uuid) -> Result<bool> {
    let flag: Option<i64> =
        sqlx::query_scalar("SELECT cancel_requested FROM executions WHERE execution_id = ?")
            .bind(execution_id.to_string())
            .fetch_optional(pool)
            .await?;
    Ok(flag.unwrap_or(0) != 0)
}

/// Executions that are not yet terminal
pub async fn load_live_executions(pool: &SqlitePool) -> Result<Vec<Execution>> {
    let rows = sqlx::query(
        r#"
        SELECT execution_id, engine_id, user_id, status, data,
               cancel_requested, created_at, completed_at
        FROM executions
        WHERE status NOT IN ('"completed"', '"cancelled"', '"failed"')
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(execution_from_row).collect()
}

/// Fail executions orphaned by a process restart
///
/// With the in-process queue a background worker dies with the process, so
/// any non-terminal execution found at startup will never progress. The
/// durable backend keeps its jobs, so this sweep is skipped there.
pub async fn reconcile_interrupted(pool: &SqlitePool) -> Result<usize> {
    let live = load_live_executions(pool).await?;
    let count = live.len();
    for mut execution in live {
        execution.record_error("Interrupted by service restart");
        execution.transition_to(ExecutionStatus::Failed);
        save_execution(pool, &execution).await?;
        tracing::warn!(
            execution_id = %execution.execution_id,
            "Marked interrupted execution as failed"
        );
    }
    Ok(count)
}
