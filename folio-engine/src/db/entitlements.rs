//! Caller entitlement checks
//!
//! Every orchestrator operation authorizes the caller's api key before any
//! side effect. Failures are synchronous; no job or execution is created.

use chrono::{DateTime, Utc};
use folio_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// One caller's standing: identity, active flag, usage against quota
#[derive(Debug, Clone)]
pub struct Entitlement {
    pub api_key: String,
    pub user_id: Uuid,
    pub active: bool,
    pub executions_used: i64,
    /// None means unlimited
    pub execution_quota: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Entitlement {
    pub fn has_capacity(&self) -> bool {
        match self.execution_quota {
            Some(quota) => self.executions_used < quota,
            None => true,
        }
    }
}

/// Look up an api key
pub async fn lookup_api_key(pool: &SqlitePool, api_key: &str) -> Result<Option<Entitlement>> {
    let row = sqlx::query(
        r#"
        SELECT api_key, user_id, active, executions_used, execution_quota, created_at
        FROM entitlements
        WHERE api_key = ?
        "#,
    )
    .bind(api_key)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let user_id: String = row.get("user_id");
            let user_id = Uuid::parse_str(&user_id)
                .map_err(|e| Error::Internal(format!("Failed to parse user_id: {}", e)))?;

            let created_at: String = row.get("created_at");
            let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| Error::Internal(format!("Failed to parse created_at: {}", e)))?
                .with_timezone(&chrono::Utc);

            Ok(Some(Entitlement {
                api_key: row.get("api_key"),
                user_id,
                active: row.get::<i64, _>("active") != 0,
                executions_used: row.get("executions_used"),
                execution_quota: row.get("execution_quota"),
                created_at,
            }))
        }
        None => Ok(None),
    }
}

/// Authorize a caller for starting or controlling executions
///
/// Missing or unknown key is Unauthorized; an inactive account or exhausted
/// quota is Forbidden.
pub async fn authorize(pool: &SqlitePool, api_key: Option<&str>) -> Result<Entitlement> {
    let api_key = match api_key {
        Some(key) if !key.trim().is_empty() => key,
        _ => return Err(Error::Unauthorized("missing api key".to_string())),
    };

    let entitlement = lookup_api_key(pool, api_key)
        .await?
        .ok_or_else(|| Error::Unauthorized("unknown api key".to_string()))?;

    if !entitlement.active {
        return Err(Error::Forbidden("account is disabled".to_string()));
    }
    if !entitlement.has_capacity() {
        return Err(Error::Forbidden("execution quota exhausted".to_string()));
    }

    Ok(entitlement)
}

/// Count one execution against the caller's quota
pub async fn record_usage(pool: &SqlitePool, api_key: &str) -> Result<()> {
    sqlx::query("UPDATE entitlements SET executions_used = executions_used + 1 WHERE api_key = ?")
        .bind(api_key)
        .execute(pool)
        .await?;
    Ok(())
}

/// Insert or update an entitlement (seeding and tests)
pub async fn upsert_entitlement(pool: &SqlitePool, entitlement: &Entitlement) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO entitlements (
            api_key, user_id, active, executions_used, execution_quota, created_at
        ) VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(api_key) DO UPDATE SET
            active = excluded.active,
            executions_used = excluded.executions_used,
            execution_quota = excluded.execution_quota
        "#,
    )
    .bind(&entitlement.api_key)
    .bind(entitlement.user_id.to_string())
    .bind(entitlement.active as i64)
    .bind(entitlement.executions_used)
    .bind(entitlement.execution_quota)
    .bind(entitlement.created_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}
