use anyhow::{Context, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;

const GOVERNANCE_SCHEMA_META_TABLE: &str = "
CREATE TABLE IF NOT EXISTS governance_schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";
const GOVERNANCE_SCHEMA_VERSION_KEY: &str = "governance_schema_version";
const GOVERNANCE_SCHEMA_VERSION: u32 = 1;

/// Open a pooled connection to the governance database file.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("create governance db directory")?;
    }
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .context("open governance database")?;
    sqlx::query("PRAGMA journal_mode = WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&pool)
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// Open an in-memory pool, mainly for tests and embedding callers.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .context("open in-memory governance database")?;
    init_schema(&pool).await?;
    Ok(pool)
}

async fn ensure_schema_version(pool: &SqlitePool) -> Result<()> {
    sqlx::query(GOVERNANCE_SCHEMA_META_TABLE)
        .execute(pool)
        .await
        .context("create governance_schema_meta table")?;

    let stored_version: Option<(String,)> =
        sqlx::query_as("SELECT value FROM governance_schema_meta WHERE key = $1")
            .bind(GOVERNANCE_SCHEMA_VERSION_KEY)
            .fetch_optional(pool)
            .await
            .context("load governance schema version")?;

    if let Some((value,)) = stored_version {
        let parsed = value
            .parse::<u32>()
            .with_context(|| format!("invalid governance schema version value: {value}"))?;
        anyhow::ensure!(
            parsed == GOVERNANCE_SCHEMA_VERSION,
            "incompatible governance schema version: stored={parsed}, expected={GOVERNANCE_SCHEMA_VERSION}. \
compatibility is disabled; remove governance DB and restart."
        );
        return Ok(());
    }

    let legacy_table_count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*)
         FROM sqlite_master
         WHERE type = 'table'
           AND name IN ('decisions', 'hitl_queue', 'documents', 'audit_log', 'work_items')",
    )
    .fetch_one(pool)
    .await
    .context("detect legacy governance tables")?;

    if legacy_table_count.0 > 0 {
        anyhow::bail!(
            "legacy governance database detected without schema version metadata. \
compatibility is disabled; remove governance DB and restart."
        );
    }

    sqlx::query("INSERT INTO governance_schema_meta (key, value) VALUES ($1, $2)")
        .bind(GOVERNANCE_SCHEMA_VERSION_KEY)
        .bind(GOVERNANCE_SCHEMA_VERSION.to_string())
        .execute(pool)
        .await
        .context("persist governance schema version")?;

    Ok(())
}

/// Create all governance tables and indexes.
///
/// The audit_log table is append-only by construction: no code path issues
/// UPDATE or DELETE against it.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await?;

    ensure_schema_version(pool).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS decisions (
             decision_id      TEXT PRIMARY KEY,
             agent_id         TEXT NOT NULL,
             agent_role       TEXT,
             user_id          TEXT NOT NULL,
             organization_id  TEXT NOT NULL,
             request_context  TEXT,
             rendered_prompt  TEXT,
             response         TEXT NOT NULL,
             reasoning        TEXT,
             confidence       REAL NOT NULL,
             risk             REAL NOT NULL,
             hitl_required    INTEGER NOT NULL DEFAULT 0,
             status           TEXT NOT NULL,
             rollback_eligible INTEGER NOT NULL DEFAULT 0,
             rollback_data    TEXT,
             shadow           INTEGER NOT NULL DEFAULT 0,
             cost             REAL NOT NULL DEFAULT 0,
             tokens_used      INTEGER NOT NULL DEFAULT 0,
             tags             TEXT NOT NULL DEFAULT '[]',
             category         TEXT NOT NULL,
             execution_result TEXT,
             execution_error  TEXT,
             executed_at      TEXT,
             rolled_back_at   TEXT,
             rolled_back_by   TEXT,
             created_at       TEXT NOT NULL,
             updated_at       TEXT NOT NULL
         )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_decisions_status
             ON decisions(status, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS hitl_queue (
             id               TEXT PRIMARY KEY,
             decision_id      TEXT NOT NULL,
             agent_id         TEXT NOT NULL,
             user_id          TEXT NOT NULL,
             organization_id  TEXT NOT NULL,
             summary          TEXT NOT NULL,
             recommendation   TEXT,
             confidence       REAL NOT NULL,
             risk             REAL NOT NULL,
             reason           TEXT NOT NULL,
             triggers         TEXT NOT NULL DEFAULT '[]',
             status           TEXT NOT NULL,
             priority         TEXT NOT NULL,
             sla_deadline     TEXT NOT NULL,
             is_overdue       INTEGER NOT NULL DEFAULT 0,
             assigned_to      TEXT,
             assigned_at      TEXT,
             assigned_by      TEXT,
             reviewed_by      TEXT,
             review_decision  TEXT,
             review_notes     TEXT,
             modifications    TEXT,
             notification_attempts INTEGER NOT NULL DEFAULT 0,
             notified_at      TEXT,
             escalated_to     TEXT,
             escalation_reason TEXT,
             escalation_hops  INTEGER NOT NULL DEFAULT 0,
             created_at       TEXT NOT NULL,
             reviewed_at      TEXT,
             resolved_at      TEXT
         )",
    )
    .execute(pool)
    .await?;

    // One open review entry per decision, enforced in the schema.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_hitl_open_decision
             ON hitl_queue(decision_id)
             WHERE status IN ('pending', 'notified', 'in_review', 'escalated')",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS documents (
             document_id      TEXT PRIMARY KEY,
             owner_id         TEXT NOT NULL,
             agent_id         TEXT NOT NULL,
             doc_type         TEXT NOT NULL,
             payload          TEXT NOT NULL,
             status           TEXT NOT NULL,
             recipient        TEXT,
             events           TEXT NOT NULL DEFAULT '[]',
             created_at       TEXT NOT NULL,
             approval_requested_at TEXT,
             approved_at      TEXT,
             sent_at          TEXT,
             exported_at      TEXT,
             filed_at         TEXT,
             updated_at       TEXT NOT NULL
         )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS audit_log (
             id               TEXT PRIMARY KEY,
             timestamp        TEXT NOT NULL,
             action           TEXT NOT NULL,
             actor_kind       TEXT NOT NULL,
             actor_id         TEXT NOT NULL,
             target_type      TEXT,
             target_id        TEXT,
             organization_id  TEXT,
             context          TEXT,
             success          INTEGER NOT NULL DEFAULT 1,
             severity         TEXT NOT NULL,
             error            TEXT
         )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_audit_timestamp
             ON audit_log(timestamp, id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_audit_target
             ON audit_log(target_type, target_id, timestamp)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS work_items (
             id               TEXT PRIMARY KEY,
             agent_id         TEXT NOT NULL,
             action_type      TEXT NOT NULL,
             payload          TEXT NOT NULL DEFAULT '{}',
             status           TEXT NOT NULL,
             metrics          TEXT NOT NULL DEFAULT '{}',
             notes            TEXT,
             created_at       TEXT NOT NULL,
             updated_at       TEXT NOT NULL,
             completed_at     TEXT
         )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_work_items_status
             ON work_items(status, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
