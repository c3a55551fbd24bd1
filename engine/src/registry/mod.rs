/// Tool Registry
///
/// Front door for the tool catalog: registration, resolution with
/// permission enforcement, grants, and the execution ledger around each
/// invocation. Every resolve checks the caller's grant against the
/// tool's required level; there is no bypass for whoever registered the
/// tool.
use sdk::errors::CoreError;
use sdk::types::{PermissionLevel, ResourceUsage};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{
    Database, ExecutionRecord, ExecutionStatus, Tool, ToolPageCursor, ToolSpec,
};

pub struct ToolRegistry {
    db: std::sync::Arc<Database>,
}

impl ToolRegistry {
    pub fn new(db: std::sync::Arc<Database>) -> Self {
        Self { db }
    }

    /// Register a new tool and return its id
    pub async fn register(&self, spec: &ToolSpec) -> Result<String, CoreError> {
        validate_spec(spec)?;

        let id = Uuid::new_v4().to_string();
        self.db.tools().insert(&id, spec).await?;
        info!(
            tool_id = %id,
            name = %spec.name,
            version = %spec.version,
            "Registered tool"
        );
        Ok(id)
    }

    /// Resolve a tool for a principal, enforcing its required permission
    ///
    /// Retired and disabled tools resolve the same way missing ones do,
    /// so callers cannot distinguish a tool that never existed from one
    /// that was withdrawn.
    pub async fn resolve(&self, principal: &str, tool_id: &str) -> Result<Tool, CoreError> {
        let tool = self
            .db
            .tools()
            .get(tool_id)
            .await?
            .filter(|t| t.enabled && !t.retired)
            .ok_or_else(|| CoreError::NotFound(format!("tool '{}'", tool_id)))?;

        let held = self.db.grants().level_for(principal, tool_id).await?;
        if held < tool.required_permission {
            debug!(
                principal = %principal,
                tool_id = %tool_id,
                required = %tool.required_permission.as_str(),
                held = %held.as_str(),
                "Permission check failed"
            );
            return Err(CoreError::PermissionDenied {
                principal: principal.to_string(),
                tool_id: tool_id.to_string(),
                required: tool.required_permission,
                held,
            });
        }
        Ok(tool)
    }

    /// Replace a tool's schemas and required permission. Identity fields
    /// stay fixed for the life of the record.
    pub async fn update_contract(
        &self,
        tool_id: &str,
        input_schema: &serde_json::Value,
        output_schema: &serde_json::Value,
        required_permission: PermissionLevel,
    ) -> Result<(), CoreError> {
        ensure_object(input_schema, "input_schema")?;
        ensure_object(output_schema, "output_schema")?;
        self.db
            .tools()
            .update_contract(tool_id, input_schema, output_schema, required_permission)
            .await?;
        info!(tool_id = %tool_id, "Updated tool contract");
        Ok(())
    }

    /// Retire a tool while keeping its row for the execution ledger
    pub async fn retire(&self, tool_id: &str) -> Result<(), CoreError> {
        self.db.tools().retire(tool_id).await?;
        info!(tool_id = %tool_id, "Retired tool");
        Ok(())
    }

    /// Grant a permission level to a principal for a live tool
    pub async fn grant(
        &self,
        principal: &str,
        tool_id: &str,
        level: PermissionLevel,
    ) -> Result<(), CoreError> {
        let exists = self
            .db
            .tools()
            .get(tool_id)
            .await?
            .filter(|t| !t.retired)
            .is_some();
        if !exists {
            return Err(CoreError::NotFound(format!("tool '{}'", tool_id)));
        }
        self.db.grants().upsert(principal, tool_id, level).await?;
        info!(
            principal = %principal,
            tool_id = %tool_id,
            level = %level.as_str(),
            "Granted permission"
        );
        Ok(())
    }

    pub async fn revoke(&self, principal: &str, tool_id: &str) -> Result<(), CoreError> {
        self.db.grants().revoke(principal, tool_id).await?;
        info!(principal = %principal, tool_id = %tool_id, "Revoked permission");
        Ok(())
    }

    /// One page of live tools carrying a capability tag
    pub async fn list_by_capability(
        &self,
        tag: &str,
        cursor: Option<&ToolPageCursor>,
        page_size: i64,
    ) -> Result<Vec<Tool>, CoreError> {
        if tag.trim().is_empty() {
            return Err(CoreError::Validation("Capability tag is empty".to_string()));
        }
        self.db
            .tools()
            .page_by_capability(tag, cursor, page_size.clamp(1, 100))
            .await
    }

    /// Open the execution ledger entry for an invocation the principal is
    /// allowed to make. Returns the execution id; the caller drives the
    /// record through running to a terminal status.
    pub async fn begin_execution(
        &self,
        principal: &str,
        tool_id: &str,
        input: &serde_json::Value,
    ) -> Result<String, CoreError> {
        self.resolve(principal, tool_id).await?;
        ensure_object(input, "input")?;

        let execution_id = Uuid::new_v4().to_string();
        self.db
            .executions()
            .create(&execution_id, tool_id, principal, input)
            .await?;
        self.db.executions().mark_running(&execution_id).await?;
        debug!(execution_id = %execution_id, tool_id = %tool_id, "Execution started");
        Ok(execution_id)
    }

    /// Ledger a sandbox run under a synthetic target id
    ///
    /// Sandbox commands are not catalog entries, so this skips tool
    /// resolution but still leaves the same audit trail as a tool
    /// invocation.
    pub async fn ledger_sandbox_run(
        &self,
        execution_id: &str,
        target: &str,
        principal: &str,
        input: &serde_json::Value,
    ) -> Result<(), CoreError> {
        self.db
            .executions()
            .create(execution_id, target, principal, input)
            .await?;
        self.db.executions().mark_running(execution_id).await?;
        debug!(execution_id = %execution_id, target = %target, "Sandbox run ledgered");
        Ok(())
    }

    /// Close an execution ledger entry
    pub async fn finish_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        output: Option<&serde_json::Value>,
        error_kind: Option<&str>,
        usage: &ResourceUsage,
    ) -> Result<(), CoreError> {
        self.db
            .executions()
            .finish(execution_id, status, output, error_kind, usage)
            .await?;
        debug!(
            execution_id = %execution_id,
            status = %status.as_str(),
            "Execution finished"
        );
        Ok(())
    }

    pub async fn execution(&self, id: &str) -> Result<Option<ExecutionRecord>, CoreError> {
        self.db.executions().get(id).await
    }

    /// Recent execution history for a tool, used by routing to estimate
    /// how the tool has been behaving
    pub async fn recent_executions(
        &self,
        tool_id: &str,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>, CoreError> {
        self.db.executions().recent_for_tool(tool_id, limit).await
    }
}

fn validate_spec(spec: &ToolSpec) -> Result<(), CoreError> {
    if spec.name.trim().is_empty() {
        return Err(CoreError::Validation("Tool name is empty".to_string()));
    }
    if spec.version.trim().is_empty() {
        return Err(CoreError::Validation("Tool version is empty".to_string()));
    }
    if spec.dispatch_target.trim().is_empty() {
        return Err(CoreError::Validation(format!(
            "Tool '{}' has no dispatch target",
            spec.name
        )));
    }
    if spec.capabilities.iter().any(|c| c.trim().is_empty()) {
        return Err(CoreError::Validation(format!(
            "Tool '{}' has an empty capability tag",
            spec.name
        )));
    }
    ensure_object(&spec.input_schema, "input_schema")?;
    ensure_object(&spec.output_schema, "output_schema")?;
    Ok(())
}

fn ensure_object(value: &serde_json::Value, what: &str) -> Result<(), CoreError> {
    if !value.is_object() {
        return Err(CoreError::Validation(format!(
            "{} must be a JSON object",
            what
        )));
    }
    Ok(())
}
