/// Tool catalog persistence
///
/// Repository for the tools table. Identity (id, name, version) is
/// immutable after registration; schema and required permission are
/// mutable via explicit update; removal is a soft retire so execution
/// history keeps valid references.
use sdk::errors::CoreError;
use sdk::types::PermissionLevel;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use super::{db_err, now_secs};

/// Specification supplied at registration time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Capability tags the registry can page over
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub input_schema: serde_json::Value,
    pub output_schema: serde_json::Value,
    pub required_permission: PermissionLevel,
    /// Where invocations are dispatched (command, URL, or agent id)
    pub dispatch_target: String,
}

/// A registered tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub input_schema: serde_json::Value,
    pub output_schema: serde_json::Value,
    pub required_permission: PermissionLevel,
    pub dispatch_target: String,
    pub enabled: bool,
    pub retired: bool,
    pub registered_at: i64,
}

/// Cursor for restartable capability paging: position after
/// (registered_at, id) of the last row seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPageCursor {
    pub registered_at: i64,
    pub id: String,
}

/// Tool repository for database operations
pub struct ToolRepository {
    pool: SqlitePool,
}

impl ToolRepository {
    /// Create a new tool repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new tool row
    ///
    /// Returns `DuplicateTool` when (name, version) is already present,
    /// enforced by the unique index rather than a read-then-write check so
    /// concurrent registrations cannot race past validation.
    pub async fn insert(&self, id: &str, spec: &ToolSpec) -> Result<(), CoreError> {
        let now = now_secs();
        let capabilities = serde_json::to_string(&spec.capabilities)
            .map_err(|e| CoreError::Validation(format!("Unserializable capabilities: {}", e)))?;

        let result = sqlx::query(
            "INSERT INTO tools (id, name, version, description, capabilities, input_schema, \
             output_schema, required_permission, dispatch_target, enabled, retired, registered_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, 0, ?)",
        )
        .bind(id)
        .bind(&spec.name)
        .bind(&spec.version)
        .bind(&spec.description)
        .bind(&capabilities)
        .bind(spec.input_schema.to_string())
        .bind(spec.output_schema.to_string())
        .bind(spec.required_permission.as_str())
        .bind(&spec.dispatch_target)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(CoreError::DuplicateTool {
                    name: spec.name.clone(),
                    version: spec.version.clone(),
                })
            }
            Err(e) => Err(db_err(e)),
        }
    }

    /// Fetch a tool by id, including retired ones. Callers decide whether
    /// retired tools count as found.
    pub async fn get(&self, tool_id: &str) -> Result<Option<Tool>, CoreError> {
        let row = sqlx::query("SELECT * FROM tools WHERE id = ?")
            .bind(tool_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(row_to_tool).transpose()
    }

    /// Update the mutable parts of a tool: schema and required permission
    pub async fn update_contract(
        &self,
        tool_id: &str,
        input_schema: &serde_json::Value,
        output_schema: &serde_json::Value,
        required_permission: PermissionLevel,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE tools SET input_schema = ?, output_schema = ?, required_permission = ? \
             WHERE id = ? AND retired = 0",
        )
        .bind(input_schema.to_string())
        .bind(output_schema.to_string())
        .bind(required_permission.as_str())
        .bind(tool_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("tool '{}'", tool_id)));
        }
        Ok(())
    }

    /// Enable or disable a tool without retiring it
    pub async fn set_enabled(&self, tool_id: &str, enabled: bool) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE tools SET enabled = ? WHERE id = ? AND retired = 0")
            .bind(enabled as i32)
            .bind(tool_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("tool '{}'", tool_id)));
        }
        Ok(())
    }

    /// Soft-delete a tool. The row stays so execution history keeps a
    /// valid reference; resolution treats retired tools as not found.
    pub async fn retire(&self, tool_id: &str) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE tools SET retired = 1, enabled = 0 WHERE id = ?")
            .bind(tool_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("tool '{}'", tool_id)));
        }
        Ok(())
    }

    /// One page of enabled, non-retired tools carrying a capability tag
    ///
    /// Ordered by (registered_at, id) so pagination is deterministic and
    /// restartable: pass the cursor from the last row of the previous page.
    pub async fn page_by_capability(
        &self,
        tag: &str,
        cursor: Option<&ToolPageCursor>,
        page_size: i64,
    ) -> Result<Vec<Tool>, CoreError> {
        // Tags are stored as a JSON array; match on the quoted element
        let pattern = format!("%\"{}\"%", tag.replace(['"', '%', '_'], ""));

        let (after_ts, after_id) = match cursor {
            Some(c) => (c.registered_at, c.id.clone()),
            None => (i64::MIN, String::new()),
        };

        let rows = sqlx::query(
            "SELECT * FROM tools \
             WHERE enabled = 1 AND retired = 0 AND capabilities LIKE ? \
               AND (registered_at > ? OR (registered_at = ? AND id > ?)) \
             ORDER BY registered_at ASC, id ASC \
             LIMIT ?",
        )
        .bind(&pattern)
        .bind(after_ts)
        .bind(after_ts)
        .bind(&after_id)
        .bind(page_size)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(row_to_tool).collect()
    }
}

fn row_to_tool(r: sqlx::sqlite::SqliteRow) -> Result<Tool, CoreError> {
    let capabilities: Vec<String> =
        serde_json::from_str(&r.get::<String, _>("capabilities")).unwrap_or_default();
    let input_schema = serde_json::from_str(&r.get::<String, _>("input_schema"))
        .map_err(|e| CoreError::Database(format!("corrupt input_schema: {}", e)))?;
    let output_schema = serde_json::from_str(&r.get::<String, _>("output_schema"))
        .map_err(|e| CoreError::Database(format!("corrupt output_schema: {}", e)))?;

    Ok(Tool {
        id: r.get("id"),
        name: r.get("name"),
        version: r.get("version"),
        description: r.get("description"),
        capabilities,
        input_schema,
        output_schema,
        required_permission: PermissionLevel::parse(&r.get::<String, _>("required_permission")),
        dispatch_target: r.get("dispatch_target"),
        enabled: r.get::<i64, _>("enabled") != 0,
        retired: r.get::<i64, _>("retired") != 0,
        registered_at: r.get("registered_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tempfile::TempDir;

    fn spec(name: &str, version: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            version: version.to_string(),
            description: String::new(),
            capabilities: vec!["text".to_string()],
            input_schema: serde_json::json!({"type": "object"}),
            output_schema: serde_json::json!({"type": "object"}),
            required_permission: PermissionLevel::Execute,
            dispatch_target: "builtin:echo".to_string(),
        }
    }

    async fn setup() -> (TempDir, Database) {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("test.db")).await.unwrap();
        (temp, db)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let (_temp, db) = setup().await;
        let repo = db.tools();

        repo.insert("tool-1", &spec("echo", "1")).await.unwrap();
        let tool = repo.get("tool-1").await.unwrap().unwrap();
        assert_eq!(tool.name, "echo");
        assert_eq!(tool.required_permission, PermissionLevel::Execute);
        assert!(!tool.retired);
    }

    #[tokio::test]
    async fn test_duplicate_name_version_rejected() {
        let (_temp, db) = setup().await;
        let repo = db.tools();

        repo.insert("tool-1", &spec("echo", "1")).await.unwrap();
        let err = repo.insert("tool-2", &spec("echo", "1")).await.unwrap_err();
        assert!(matches!(err, CoreError::DuplicateTool { .. }));

        // Registry still contains exactly one echo v1
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tools WHERE name = 'echo' AND version = '1'")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_same_name_different_version_allowed() {
        let (_temp, db) = setup().await;
        let repo = db.tools();

        repo.insert("tool-1", &spec("echo", "1")).await.unwrap();
        repo.insert("tool-2", &spec("echo", "2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_retire_is_soft() {
        let (_temp, db) = setup().await;
        let repo = db.tools();

        repo.insert("tool-1", &spec("echo", "1")).await.unwrap();
        repo.retire("tool-1").await.unwrap();

        // Row still present, flagged retired
        let tool = repo.get("tool-1").await.unwrap().unwrap();
        assert!(tool.retired);
        assert!(!tool.enabled);
    }

    #[tokio::test]
    async fn test_update_contract_on_retired_tool_fails() {
        let (_temp, db) = setup().await;
        let repo = db.tools();

        repo.insert("tool-1", &spec("echo", "1")).await.unwrap();
        repo.retire("tool-1").await.unwrap();

        let err = repo
            .update_contract(
                "tool-1",
                &serde_json::json!({}),
                &serde_json::json!({}),
                PermissionLevel::Read,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_capability_paging_is_deterministic_and_restartable() {
        let (_temp, db) = setup().await;
        let repo = db.tools();

        for i in 0..5 {
            repo.insert(&format!("tool-{}", i), &spec(&format!("t{}", i), "1"))
                .await
                .unwrap();
        }
        // One tool outside the capability
        let mut other = spec("other", "1");
        other.capabilities = vec!["image".to_string()];
        repo.insert("tool-x", &other).await.unwrap();

        let first = repo.page_by_capability("text", None, 3).await.unwrap();
        assert_eq!(first.len(), 3);

        let cursor = ToolPageCursor {
            registered_at: first[2].registered_at,
            id: first[2].id.clone(),
        };
        let second = repo
            .page_by_capability("text", Some(&cursor), 3)
            .await
            .unwrap();
        assert_eq!(second.len(), 2);

        // Restarting from the beginning yields exactly the same first page
        let restarted = repo.page_by_capability("text", None, 3).await.unwrap();
        let ids: Vec<_> = first.iter().map(|t| &t.id).collect();
        let restarted_ids: Vec<_> = restarted.iter().map(|t| &t.id).collect();
        assert_eq!(ids, restarted_ids);

        // No overlap between pages, and the image tool never appears
        for t in first.iter().chain(second.iter()) {
            assert_ne!(t.id, "tool-x");
        }
    }

    #[tokio::test]
    async fn test_retired_tools_excluded_from_paging() {
        let (_temp, db) = setup().await;
        let repo = db.tools();

        repo.insert("tool-1", &spec("echo", "1")).await.unwrap();
        repo.retire("tool-1").await.unwrap();

        let page = repo.page_by_capability("text", None, 10).await.unwrap();
        assert!(page.is_empty());
    }
}
