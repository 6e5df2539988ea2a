//! Version-tracked schema migrations.
//!
//! Each migration has a version number and SQL. `run()` checks the current
//! version in `_migrations` and applies only the new ones sequentially. The
//! shared store and the per-agent local cache each have their own list.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Shared store schema: the card queue, the agent registry, continuity
/// state, and the merged experience log.
static SHARED_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS jobs (
            correlation_id TEXT PRIMARY KEY,
            idempotency_key TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 50,
            cost_center TEXT NOT NULL DEFAULT 'general',
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            result TEXT,
            worker TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_idempotency ON jobs(idempotency_key);
        CREATE INDEX IF NOT EXISTS idx_jobs_status_prio ON jobs(status, priority DESC);

        CREATE TRIGGER IF NOT EXISTS jobs_touch_updated
        AFTER UPDATE ON jobs
        BEGIN
            UPDATE jobs SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE correlation_id = OLD.correlation_id;
        END;

        CREATE TABLE IF NOT EXISTS agents (
            agent_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            coding_id TEXT
        );

        CREATE TABLE IF NOT EXISTS active_plans (
            agent_id TEXT PRIMARY KEY,
            plan_name TEXT NOT NULL,
            content TEXT NOT NULL,
            current_step INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cognitive_snapshots (
            agent_id TEXT PRIMARY KEY,
            memory_dump TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS experience_log (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            context TEXT NOT NULL,
            success INTEGER NOT NULL,
            details TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_experience_agent ON experience_log(agent_id);
    "#,
}];

/// Local cache schema: the agent's private mirror of claimed work plus its
/// append-only event log awaiting sync.
static LOCAL_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS local_jobs (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            payload TEXT NOT NULL,
            result TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS event_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            context TEXT NOT NULL,
            success INTEGER NOT NULL,
            details TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_event_log_synced ON event_log(synced);
    "#,
}];

/// Run all pending shared-store migrations.
pub async fn run_shared(conn: &Connection) -> Result<(), DatabaseError> {
    run(conn, SHARED_MIGRATIONS).await
}

/// Run all pending local-cache migrations.
pub async fn run_local(conn: &Connection) -> Result<(), DatabaseError> {
    run(conn, LOCAL_MIGRATIONS).await
}

async fn run(conn: &Connection, migrations: &[Migration]) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current = current_version(conn).await?;

    for migration in migrations.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration {} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;

        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| {
            DatabaseError::Migration(format!(
                "Failed to record migration {}: {e}",
                migration.version
            ))
        })?;

        tracing::debug!(version = migration.version, name = migration.name, "Applied migration");
    }

    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read _migrations: {e}")))?;

    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(e.to_string())),
        None => Ok(0),
    }
}
