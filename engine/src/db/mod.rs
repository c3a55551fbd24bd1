/// Database module for SQLite persistence
///
/// This module provides database operations for the tool catalog,
/// permission grants, execution records, and memory records. It uses sqlx
/// with parameterized queries and WAL mode for better concurrency.
///
/// The relational store is mandatory: the core refuses to start without
/// it. Only the similarity (embedding) backend is optional.
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

pub mod executions;
pub mod grants;
pub mod memory;
pub mod tools;

// Re-export commonly used types
pub use executions::{ExecutionRecord, ExecutionRepository, ExecutionStatus};
pub use grants::GrantRepository;
pub use memory::{MemoryRecord, MemoryRepository, Scope};
pub use tools::{Tool, ToolPageCursor, ToolRepository, ToolSpec};

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Enable WAL mode for better concurrency
    /// 3. Run migrations to set up the schema
    ///
    /// SQLite with WAL mode automatically recovers from unclean shutdowns
    /// when the database is reopened; during graceful shutdown, call
    /// `close()` to checkpoint the WAL.
    pub async fn new(db_path: &Path) -> Result<Self> {
        info!("Initializing database at: {}", db_path.display());

        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        // Configure SQLite connection with WAL mode
        let connection_string = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .disable_statement_logging();

        // Create connection pool
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        debug!("Database connection established");

        let db = Self { pool };

        // Run migrations
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    ///
    /// Migrations are embedded at compile time and are idempotent; they can
    /// be run multiple times safely.
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::raw_sql(include_str!("../../migrations/001_initial.sql"))
            .execute(&self.pool)
            .await
            .context("Failed to execute migration 001_initial.sql")?;

        sqlx::raw_sql(include_str!("../../migrations/002_fts_memory.sql"))
            .execute(&self.pool)
            .await
            .context("Failed to execute migration 002_fts_memory.sql")?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Flush the WAL to disk
    ///
    /// This should be called during graceful shutdown to ensure all
    /// pending writes are persisted to the database file.
    pub async fn flush_wal(&self) -> Result<()> {
        info!("Flushing WAL to disk");

        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("Failed to flush WAL")?;

        debug!("WAL flushed successfully");
        Ok(())
    }

    /// Close the database connection
    ///
    /// This flushes the WAL and closes all connections in the pool.
    /// Should be called during shutdown.
    pub async fn close(&self) -> Result<()> {
        info!("Closing database connection");

        self.flush_wal().await?;
        self.pool.close().await;

        info!("Database connection closed");
        Ok(())
    }

    /// Create a tool repository
    pub fn tools(&self) -> ToolRepository {
        ToolRepository::new(self.pool.clone())
    }

    /// Create a grant repository
    pub fn grants(&self) -> GrantRepository {
        GrantRepository::new(self.pool.clone())
    }

    /// Create an execution repository
    pub fn executions(&self) -> ExecutionRepository {
        ExecutionRepository::new(self.pool.clone())
    }

    /// Create a memory repository
    pub fn memory(&self) -> MemoryRepository {
        MemoryRepository::new(self.pool.clone())
    }
}

/// Map a sqlx error onto the core taxonomy, preserving the message
pub(crate) fn db_err(e: sqlx::Error) -> sdk::errors::CoreError {
    sdk::errors::CoreError::Database(e.to_string())
}

/// Current unix timestamp in seconds
pub(crate) fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
