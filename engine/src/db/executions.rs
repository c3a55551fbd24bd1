/// Execution record persistence
///
/// Append-only ledger of tool invocations. A record moves through
/// pending -> running -> one terminal status, and never leaves a
/// terminal status. Transitions are guarded at the SQL level with
/// `WHERE status = ?` so two writers cannot both advance the same row.
use sdk::errors::CoreError;
use sdk::types::ResourceUsage;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use super::{db_err, now_secs};

/// Execution lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    Killed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Killed => "killed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            "cancelled" => Some(Self::Cancelled),
            "killed" => Some(Self::Killed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub tool_id: String,
    pub principal: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub status: ExecutionStatus,
    pub error_kind: Option<String>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub usage: ResourceUsage,
    /// Terminal records are immutable; a correction is a new record
    /// pointing back at the one it amends.
    pub corrects: Option<String>,
}

/// Execution repository for database operations
pub struct ExecutionRepository {
    pool: SqlitePool,
}

impl ExecutionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a new pending record
    pub async fn create(
        &self,
        id: &str,
        tool_id: &str,
        principal: &str,
        input: &serde_json::Value,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO executions (id, tool_id, principal, input, status, started_at) \
             VALUES (?, ?, ?, ?, 'pending', ?)",
        )
        .bind(id)
        .bind(tool_id)
        .bind(principal)
        .bind(input.to_string())
        .bind(now_secs())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Open a correction record for an already-terminal execution
    pub async fn create_correction(
        &self,
        id: &str,
        corrects: &str,
    ) -> Result<(), CoreError> {
        let prior = self
            .get(corrects)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("execution '{}'", corrects)))?;
        if !prior.status.is_terminal() {
            return Err(CoreError::Validation(format!(
                "Execution '{}' is not terminal and cannot be corrected",
                corrects
            )));
        }

        sqlx::query(
            "INSERT INTO executions (id, tool_id, principal, input, status, started_at, corrects) \
             VALUES (?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(id)
        .bind(&prior.tool_id)
        .bind(&prior.principal)
        .bind(prior.input.to_string())
        .bind(now_secs())
        .bind(corrects)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// pending -> running. Fails if the record already moved on.
    pub async fn mark_running(&self, id: &str) -> Result<(), CoreError> {
        let result =
            sqlx::query("UPDATE executions SET status = 'running' WHERE id = ? AND status = 'pending'")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::Validation(format!(
                "Execution '{}' is not pending",
                id
            )));
        }
        Ok(())
    }

    /// Move a running (or still-pending) record to a terminal status,
    /// attaching output, error classification, and measured usage in the
    /// same statement. A record that is already terminal is left alone.
    pub async fn finish(
        &self,
        id: &str,
        status: ExecutionStatus,
        output: Option<&serde_json::Value>,
        error_kind: Option<&str>,
        usage: &ResourceUsage,
    ) -> Result<(), CoreError> {
        if !status.is_terminal() {
            return Err(CoreError::Validation(format!(
                "'{}' is not a terminal status",
                status.as_str()
            )));
        }

        let result = sqlx::query(
            "UPDATE executions SET status = ?, output = ?, error_kind = ?, ended_at = ?, \
             cpu_ms = ?, max_memory_bytes = ?, wall_ms = ? \
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(status.as_str())
        .bind(output.map(|o| o.to_string()))
        .bind(error_kind)
        .bind(now_secs())
        .bind(usage.cpu_ms as i64)
        .bind(usage.max_memory_bytes as i64)
        .bind(usage.wall_ms as i64)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::Validation(format!(
                "Execution '{}' is already terminal",
                id
            )));
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>, CoreError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(row_to_record).transpose()
    }

    /// Recent executions of a tool, newest first. Feeds routing history.
    pub async fn recent_for_tool(
        &self,
        tool_id: &str,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>, CoreError> {
        let rows = sqlx::query(
            "SELECT * FROM executions WHERE tool_id = ? ORDER BY started_at DESC, id DESC LIMIT ?",
        )
        .bind(tool_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// Recent executions by a principal, newest first
    pub async fn recent_for_principal(
        &self,
        principal: &str,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>, CoreError> {
        let rows = sqlx::query(
            "SELECT * FROM executions WHERE principal = ? ORDER BY started_at DESC, id DESC LIMIT ?",
        )
        .bind(principal)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(row_to_record).collect()
    }
}

fn row_to_record(r: sqlx::sqlite::SqliteRow) -> Result<ExecutionRecord, CoreError> {
    let status_raw: String = r.get("status");
    let status = ExecutionStatus::parse(&status_raw)
        .ok_or_else(|| CoreError::Database(format!("unknown execution status '{}'", status_raw)))?;
    let input = serde_json::from_str(&r.get::<String, _>("input"))
        .map_err(|e| CoreError::Database(format!("corrupt execution input: {}", e)))?;
    let output = r
        .get::<Option<String>, _>("output")
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| CoreError::Database(format!("corrupt execution output: {}", e)))?;

    Ok(ExecutionRecord {
        id: r.get("id"),
        tool_id: r.get("tool_id"),
        principal: r.get("principal"),
        input,
        output,
        status,
        error_kind: r.get("error_kind"),
        started_at: r.get("started_at"),
        ended_at: r.get("ended_at"),
        usage: ResourceUsage {
            cpu_ms: r.get::<i64, _>("cpu_ms") as u64,
            max_memory_bytes: r.get::<i64, _>("max_memory_bytes") as u64,
            wall_ms: r.get::<i64, _>("wall_ms") as u64,
        },
        corrects: r.get("corrects"),
    })
}
