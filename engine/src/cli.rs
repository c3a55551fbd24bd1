//! CLI interface for Drover
//!
//! This module provides the command-line interface using clap's derive
//! API. It defines all commands and global flags for driving the engine.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Drover Task Orchestration Engine
///
/// Routes agent tasks across direct inference, registered tools, and
/// sandboxed commands, with scoped memory behind all of it.
#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Submit a task and wait for its outcome
    Submit {
        /// The task goal
        goal: String,

        /// Scope the task runs in (created if missing)
        #[arg(short, long, default_value = "default")]
        scope: String,

        /// Principal the task runs as
        #[arg(short, long, default_value = "cli")]
        principal: String,

        /// Deadline in milliseconds
        #[arg(long, default_value = "120000")]
        deadline_ms: u64,

        /// Tool to attach (id from `drover tools list`)
        #[arg(long)]
        tool: Option<String>,

        /// Tool input as JSON, e.g. '{"method":"run","params":{}}'
        #[arg(long, requires = "tool")]
        tool_input: Option<String>,

        /// Detach: return the task id without waiting
        #[arg(long)]
        detach: bool,
    },

    /// Manage the tool catalog
    Tools {
        #[command(subcommand)]
        action: ToolAction,
    },

    /// Show recent executions for a principal
    History {
        /// Principal whose history to show
        #[arg(short, long, default_value = "cli")]
        principal: String,

        /// Number of executions to show
        #[arg(short, long, default_value = "10")]
        limit: i64,
    },

    /// Manage memory scopes
    Scopes {
        #[command(subcommand)]
        action: ScopeAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ToolAction {
    /// Register a tool from a JSON spec file
    Register {
        /// Path to the tool spec JSON
        spec: PathBuf,
    },

    /// List tools carrying a capability tag
    List {
        /// Capability tag to filter by
        capability: String,

        /// Page size
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Grant a permission level on a tool
    Grant {
        principal: String,
        tool_id: String,
        /// none, read, execute, or admin
        level: String,
    },

    /// Revoke a principal's grant on a tool
    Revoke {
        principal: String,
        tool_id: String,
    },

    /// Retire a tool from the catalog
    Retire { tool_id: String },
}

#[derive(Subcommand, Debug)]
pub enum ScopeAction {
    /// Create a scope, optionally under a parent
    Create {
        name: String,

        #[arg(long)]
        parent: Option<String>,
    },

    /// Link an existing scope under a parent
    Inherit { child: String, parent: String },
}
