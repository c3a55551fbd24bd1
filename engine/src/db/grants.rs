/// Permission grant persistence
///
/// One row per (principal, tool). Granting again replaces the previous
/// level atomically via upsert, so concurrent grants for the same pair
/// land on exactly one row with a single winner.
use sdk::errors::CoreError;
use sdk::types::PermissionLevel;
use sqlx::{Row, SqlitePool};

use super::{db_err, now_secs};

/// Grant repository for database operations
pub struct GrantRepository {
    pool: SqlitePool,
}

impl GrantRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Grant a permission level, replacing any existing grant for the pair
    pub async fn upsert(
        &self,
        principal: &str,
        tool_id: &str,
        level: PermissionLevel,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO grants (principal, tool_id, level, granted_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT (principal, tool_id) DO UPDATE SET level = excluded.level, \
             granted_at = excluded.granted_at",
        )
        .bind(principal)
        .bind(tool_id)
        .bind(level.as_str())
        .bind(now_secs())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Effective level held by a principal for a tool. No grant row means
    /// no permission.
    pub async fn level_for(
        &self,
        principal: &str,
        tool_id: &str,
    ) -> Result<PermissionLevel, CoreError> {
        let row = sqlx::query("SELECT level FROM grants WHERE principal = ? AND tool_id = ?")
            .bind(principal)
            .bind(tool_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row
            .map(|r| PermissionLevel::parse(&r.get::<String, _>("level")))
            .unwrap_or(PermissionLevel::None))
    }

    /// Remove a grant. Revoking an absent grant is a no-op.
    pub async fn revoke(&self, principal: &str, tool_id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM grants WHERE principal = ? AND tool_id = ?")
            .bind(principal)
            .bind(tool_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// All grants held by a principal, for inspection
    pub async fn list_for_principal(
        &self,
        principal: &str,
    ) -> Result<Vec<(String, PermissionLevel)>, CoreError> {
        let rows = sqlx::query(
            "SELECT tool_id, level FROM grants WHERE principal = ? ORDER BY granted_at",
        )
        .bind(principal)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.get::<String, _>("tool_id"),
                    PermissionLevel::parse(&r.get::<String, _>("level")),
                )
            })
            .collect())
    }
}
