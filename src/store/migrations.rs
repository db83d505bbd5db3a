//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS boards (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS board_members (
            board_id TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
            user_id TEXT NOT NULL,
            PRIMARY KEY (board_id, user_id)
        );
        CREATE INDEX IF NOT EXISTS idx_board_members_user ON board_members(user_id);

        CREATE TABLE IF NOT EXISTS columns (
            id TEXT PRIMARY KEY,
            board_id TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            position INTEGER NOT NULL DEFAULT 0,
            auto_run INTEGER NOT NULL DEFAULT 0,
            agent_type TEXT NOT NULL DEFAULT '',
            agent_model TEXT NOT NULL DEFAULT 'smart',
            prompt_template TEXT NOT NULL DEFAULT '',
            on_success_column_id TEXT NOT NULL DEFAULT '',
            on_failure_column_id TEXT NOT NULL DEFAULT '',
            max_loop_count INTEGER NOT NULL DEFAULT 3
        );
        CREATE INDEX IF NOT EXISTS idx_columns_board ON columns(board_id);

        CREATE TABLE IF NOT EXISTS cards (
            id TEXT PRIMARY KEY,
            column_id TEXT NOT NULL REFERENCES columns(id),
            board_id TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
            title TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            labels TEXT NOT NULL DEFAULT '[]',
            priority TEXT NOT NULL DEFAULT 'medium',
            assignee_id TEXT,
            agent_status TEXT NOT NULL DEFAULT ''
                CHECK (agent_status IN ('', 'pending', 'running', 'completed', 'failed')),
            position INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_cards_column ON cards(column_id);
        CREATE INDEX IF NOT EXISTS idx_cards_board ON cards(board_id);

        CREATE TABLE IF NOT EXISTS card_comments (
            id TEXT PRIMARY KEY,
            card_id TEXT NOT NULL REFERENCES cards(id) ON DELETE CASCADE,
            user_id TEXT NOT NULL,
            content TEXT NOT NULL,
            is_agent_output INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_card_comments_card ON card_comments(card_id);

        CREATE TABLE IF NOT EXISTS workers (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE,
            hostname TEXT NOT NULL DEFAULT '',
            worker_version TEXT NOT NULL DEFAULT '',
            capabilities TEXT NOT NULL DEFAULT '["agent"]',
            status TEXT NOT NULL DEFAULT 'online'
                CHECK (status IN ('online', 'stale', 'offline')),
            last_heartbeat TEXT,
            registered_at TEXT NOT NULL DEFAULT (datetime('now')),
            max_concurrent_tasks INTEGER NOT NULL DEFAULT 1
        );
        CREATE INDEX IF NOT EXISTS idx_workers_user ON workers(user_id);
        CREATE INDEX IF NOT EXISTS idx_workers_status ON workers(status);

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            task_type TEXT NOT NULL CHECK (task_type IN (
                'agent_run', 'jira_import', 'jira_push', 'jira_sync',
                'gitlab_link', 'gitlab_create_project', 'gitlab_push',
                'board_plan', 'card_gen'
            )),
            board_id TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
            card_id TEXT REFERENCES cards(id) ON DELETE SET NULL,
            created_by TEXT NOT NULL,
            assigned_to TEXT,
            claimed_by_worker TEXT REFERENCES workers(id),
            agent_type TEXT NOT NULL DEFAULT '',
            agent_model TEXT NOT NULL DEFAULT 'smart',
            prompt_text TEXT NOT NULL DEFAULT '',
            payload TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN (
                'pending', 'claimed', 'running', 'completed', 'failed', 'cancelled'
            )),
            priority INTEGER NOT NULL DEFAULT 0,
            source_column_id TEXT NOT NULL DEFAULT '',
            target_column_id TEXT NOT NULL DEFAULT '',
            failure_column_id TEXT NOT NULL DEFAULT '',
            loop_count INTEGER NOT NULL DEFAULT 0,
            max_loop_count INTEGER NOT NULL DEFAULT 3,
            error_summary TEXT NOT NULL DEFAULT '',
            output_comment_id TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            claimed_at TEXT,
            started_at TEXT,
            completed_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS idx_tasks_board ON tasks(board_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_card ON tasks(card_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_claimed_by ON tasks(claimed_by_worker);
        CREATE INDEX IF NOT EXISTS idx_tasks_card_source ON tasks(card_id, source_column_id);
    "#,
}];

/// Run all pending migrations against the given connection.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Storage(format!("create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                StoreError::Storage(format!(
                    "migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            conn.execute(
                "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
                libsql::params![migration.version, migration.name],
            )
            .await
            .map_err(|e| StoreError::Storage(format!("record migration: {e}")))?;
        }
    }

    Ok(())
}

async fn get_current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Storage(format!("read migration version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row
            .get(0)
            .map_err(|e| StoreError::Storage(format!("parse migration version: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(StoreError::Storage(format!("read migration version: {e}"))),
    }
}
