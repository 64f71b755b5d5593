/// SQLite persistence layer
///
/// Stores workflow definitions, workflow-scoped secrets, and archived runs.
/// Definitions and run snapshots are stored as JSON for flexibility while
/// keeping indexed lookup fields for structured queries.

use crate::workflow::types::{WorkflowDefinition, WorkflowRun};
use anyhow::Result;
use chrono::{Duration, Utc};
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;
use uuid::Uuid;

/// SQLite-backed storage manager
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    pool: SqlitePool,
}

impl WorkflowStorage {
    /// Create new storage instance with database connection
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the storage schema
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_secrets (
                workflow_id TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (workflow_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_archive (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                snapshot JSON NOT NULL,
                created_at TEXT NOT NULL,
                finished_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_run_archive_workflow
            ON run_archive(workflow_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- workflow definitions ----

    /// Store a new workflow definition or update an existing one
    pub async fn save_workflow(&self, definition: &WorkflowDefinition) -> Result<()> {
        let definition_json = serde_json::to_string(definition)?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, definition, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&definition.id)
        .bind(&definition.name)
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retrieve a workflow definition by ID
    pub async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                let definition: WorkflowDefinition = serde_json::from_str(&definition_json)?;
                Ok(Some(definition))
            }
            None => Ok(None),
        }
    }

    /// List all workflows with basic metadata
    pub async fn list_workflows(&self) -> Result<Vec<WorkflowMetadata>> {
        let rows = sqlx::query(
            "SELECT id, name, created_at, updated_at FROM workflows ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut workflows = Vec::new();
        for row in rows {
            workflows.push(WorkflowMetadata {
                id: row.get("id"),
                name: row.get("name"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            });
        }

        Ok(workflows)
    }

    /// Load all workflow definitions for registry initialization
    pub async fn load_all_workflows(&self) -> Result<HashMap<String, WorkflowDefinition>> {
        let rows = sqlx::query("SELECT id, definition FROM workflows")
            .fetch_all(&self.pool)
            .await?;

        let mut workflows = HashMap::new();
        for row in rows {
            let id: String = row.get("id");
            let definition_json: String = row.get("definition");
            let definition: WorkflowDefinition = serde_json::from_str(&definition_json)?;
            workflows.insert(id, definition);
        }

        Ok(workflows)
    }

    /// Delete a workflow definition and its secrets
    pub async fn delete_workflow(&self, id: &str) -> Result<bool> {
        sqlx::query("DELETE FROM workflow_secrets WHERE workflow_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // ---- workflow secrets ----

    /// Store or replace a secret value scoped to a workflow
    pub async fn put_secret(&self, workflow_id: &str, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_secrets (workflow_id, name, value)
            VALUES (?, ?, ?)
            ON CONFLICT(workflow_id, name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(workflow_id)
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a secret; true if it existed
    pub async fn delete_secret(&self, workflow_id: &str, name: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM workflow_secrets WHERE workflow_id = ? AND name = ?",
        )
        .bind(workflow_id)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Secret names for a workflow (values are never listed back out)
    pub async fn list_secret_names(&self, workflow_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT name FROM workflow_secrets WHERE workflow_id = ? ORDER BY name",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("name")).collect())
    }

    /// Load all secret values for binding into a new run's scope
    pub async fn load_secrets(&self, workflow_id: &str) -> Result<HashMap<String, String>> {
        let rows = sqlx::query(
            "SELECT name, value FROM workflow_secrets WHERE workflow_id = ?",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        let mut secrets = HashMap::new();
        for row in rows {
            secrets.insert(row.get("name"), row.get("value"));
        }
        Ok(secrets)
    }

    // ---- run archive ----

    /// Archive a terminal run snapshot
    pub async fn archive_run(&self, run: &WorkflowRun) -> Result<()> {
        let snapshot_json = serde_json::to_string(run)?;

        sqlx::query(
            r#"
            INSERT INTO run_archive (id, workflow_id, status, snapshot, created_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                snapshot = excluded.snapshot,
                finished_at = excluded.finished_at
            "#,
        )
        .bind(run.id.to_string())
        .bind(&run.workflow_id)
        .bind(format!("{:?}", run.status))
        .bind(&snapshot_json)
        .bind(run.created_at.to_rfc3339())
        .bind(run.finished_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retrieve an archived run snapshot by ID
    pub async fn get_archived_run(&self, id: Uuid) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query("SELECT snapshot FROM run_archive WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let snapshot_json: String = row.get("snapshot");
                let run: WorkflowRun = serde_json::from_str(&snapshot_json)?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    /// Most recently finished archived runs
    pub async fn list_archived_runs(&self, limit: i64) -> Result<Vec<WorkflowRun>> {
        let rows = sqlx::query(
            "SELECT snapshot FROM run_archive ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut runs = Vec::new();
        for row in rows {
            let snapshot_json: String = row.get("snapshot");
            runs.push(serde_json::from_str(&snapshot_json)?);
        }
        Ok(runs)
    }

    /// Delete archived runs older than the retention window
    pub async fn prune_archived(&self, retention_days: u32) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::days(retention_days as i64)).to_rfc3339();
        let result = sqlx::query("DELETE FROM run_archive WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let pruned = result.rows_affected();
        if pruned > 0 {
            tracing::info!("🧹 Pruned {} archived runs past retention", pruned);
        }
        Ok(pruned)
    }
}

/// Basic workflow metadata for listing operations
#[derive(Debug, serde::Serialize)]
pub struct WorkflowMetadata {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}
