// Drover Task Orchestration Engine
// Main entry point for the drover binary

use anyhow::Context;
use clap::Parser;
use drover_engine::cli::{Cli, Command, ScopeAction, ToolAction};
use drover_engine::config::Config;
use drover_engine::db::ToolSpec;
use drover_engine::telemetry::{init_telemetry, init_telemetry_with, LogFormat};
use drover_engine::Engine;
use sdk::errors::DroverErrorExt;
use sdk::types::{PermissionLevel, TaskSpec};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Basic telemetry first, before config is loaded
    init_telemetry();
    tracing::info!("Drover Engine v{}", env!("CARGO_PKG_VERSION"));

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // Re-initialize with the config-driven level and format (RUST_LOG wins)
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with(level, LogFormat::resolve(&config.core.log_format));

    let engine = Engine::bootstrap(&config).await?;
    let json = cli.json;

    match cli.command {
        Command::Submit {
            goal,
            scope,
            principal,
            deadline_ms,
            tool,
            tool_input,
            detach,
        } => {
            let scope_id = resolve_scope(&engine, &scope).await?;
            let mut task = TaskSpec::new(goal, scope_id, principal);
            task.deadline_ms = deadline_ms;
            task.tool_id = tool;
            task.tool_input = tool_input
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("parsing --tool-input JSON")?;

            if detach {
                let (task_id, handle) = engine.orchestrator.submit_detached(task)?;
                println!("Submitted task {}", task_id);
                // The engine lives in this process, so stay up until the
                // detached task lands; its outcome is durably recorded,
                // not printed
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "Detached task join failed");
                }
            } else {
                let outcome = engine.orchestrator.submit(task).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                } else {
                    println!("Task {} {:?}", outcome.task_id, outcome.status);
                    if !outcome.result.is_empty() {
                        println!("{}", outcome.result);
                    }
                    if let Some(kind) = &outcome.error_kind {
                        println!("Error kind: {}", kind);
                    }
                }
            }
        }

        Command::Tools { action } => match action {
            ToolAction::Register { spec } => {
                let raw = std::fs::read_to_string(&spec)
                    .with_context(|| format!("reading {}", spec.display()))?;
                let spec: ToolSpec =
                    serde_json::from_str(&raw).context("parsing tool spec JSON")?;
                let id = engine.registry.register(&spec).await.map_err(hinted)?;
                println!("Registered tool {}", id);
            }
            ToolAction::List { capability, limit } => {
                let tools = engine
                    .registry
                    .list_by_capability(&capability, None, limit)
                    .await
                    .map_err(hinted)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&tools)?);
                } else if tools.is_empty() {
                    println!("No tools with capability '{}'", capability);
                } else {
                    for tool in tools {
                        println!(
                            "{}  {} v{}  [{}]",
                            tool.id,
                            tool.name,
                            tool.version,
                            tool.capabilities.join(", ")
                        );
                    }
                }
            }
            ToolAction::Grant {
                principal,
                tool_id,
                level,
            } => {
                engine
                    .registry
                    .grant(&principal, &tool_id, PermissionLevel::parse(&level))
                    .await
                    .map_err(hinted)?;
                println!("Granted {} on {} to {}", level, tool_id, principal);
            }
            ToolAction::Revoke { principal, tool_id } => {
                engine
                    .registry
                    .revoke(&principal, &tool_id)
                    .await
                    .map_err(hinted)?;
                println!("Revoked {} on {}", principal, tool_id);
            }
            ToolAction::Retire { tool_id } => {
                engine.registry.retire(&tool_id).await.map_err(hinted)?;
                println!("Retired tool {}", tool_id);
            }
        },

        Command::History { principal, limit } => {
            let records = engine
                .db
                .executions()
                .recent_for_principal(&principal, limit)
                .await
                .map_err(hinted)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No executions for '{}'", principal);
            } else {
                for rec in records {
                    println!(
                        "{}  {}  {}  {}",
                        rec.id,
                        rec.tool_id,
                        rec.status.as_str(),
                        rec.error_kind.as_deref().unwrap_or("-")
                    );
                }
            }
        }

        Command::Scopes { action } => match action {
            ScopeAction::Create { name, parent } => {
                let id = engine
                    .guild
                    .create_scope(&name, parent.as_deref())
                    .await
                    .map_err(hinted)?;
                println!("Created scope {}", id);
            }
            ScopeAction::Inherit { child, parent } => {
                engine.guild.inherit(&child, &parent).await.map_err(hinted)?;
                println!("Scope {} now inherits from {}", child, parent);
            }
        },
    }

    engine.db.close().await?;
    Ok(())
}

/// Resolve a scope by id or name, creating it by name when absent
async fn resolve_scope(engine: &Engine, scope: &str) -> anyhow::Result<String> {
    if let Some(existing) = engine.db.memory().get_scope(scope).await.map_err(hinted)? {
        return Ok(existing.id);
    }
    if let Some(existing) = engine
        .db
        .memory()
        .find_scope_by_name(scope)
        .await
        .map_err(hinted)?
    {
        return Ok(existing.id);
    }
    Ok(engine.guild.create_scope(scope, None).await.map_err(hinted)?)
}

/// Attach the user-facing hint to an engine error on the way out
fn hinted(e: sdk::errors::CoreError) -> anyhow::Error {
    let hint = e.user_hint().to_string();
    anyhow::Error::new(e).context(hint)
}
