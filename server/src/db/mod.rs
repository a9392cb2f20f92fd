//! Database initialization and the session repository.
//!
//! SYSTEM CONTEXT
//! ==============
//! Startup uses this module to create the shared SQLx pool and enforce schema
//! migrations before accepting websocket/API traffic. Routes and the
//! checkpoint worker only see the `Repository` trait, so they can be tested
//! against an in-memory implementation.
//!
//! VERSIONING
//! ==========
//! A session write carries the document version the client computed. The
//! stored row is replaced only when that version is not lower than the stored
//! one; otherwise the write is reported as not applied and the stored row is
//! returned unchanged.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::services::persistence::env_parse;

const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

/// Initialize the `PostgreSQL` connection pool and run migrations.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS))
        .connect(database_url)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    Ok(pool)
}

// =============================================================================
// ROWS
// =============================================================================

/// A stored session document.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub data: Value,
    pub version: i64,
    pub updated_at: OffsetDateTime,
}

/// Result of a versioned session write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOutcome {
    /// False when the stored version was newer and the row was left alone.
    pub applied: bool,
    pub version: i64,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub session_id: String,
    pub name: String,
    pub data: Value,
    pub preview_png: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    pub id: Uuid,
    pub name: String,
    pub created_at: OffsetDateTime,
    pub has_preview: bool,
}

// =============================================================================
// REPOSITORY
// =============================================================================

#[async_trait]
pub trait Repository: Send + Sync {
    async fn load_session(&self, session_id: &str) -> Result<Option<StoredSession>, sqlx::Error>;

    async fn save_session(
        &self,
        session_id: &str,
        data: &Value,
        version: i64,
        user_id: Option<&str>,
    ) -> Result<SaveOutcome, sqlx::Error>;

    async fn count_snapshots(&self, session_id: &str) -> Result<i64, sqlx::Error>;

    async fn insert_snapshot(&self, snapshot: NewSnapshot) -> Result<SnapshotRow, sqlx::Error>;

    /// Newest first.
    async fn list_snapshots(&self, session_id: &str) -> Result<Vec<SnapshotRow>, sqlx::Error>;
}

/// Postgres-backed repository.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn load_session(&self, session_id: &str) -> Result<Option<StoredSession>, sqlx::Error> {
        let row = sqlx::query_as::<_, (Value, i64, OffsetDateTime)>(
            "SELECT data, version, updated_at FROM sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(data, version, updated_at)| StoredSession { data, version, updated_at }))
    }

    async fn save_session(
        &self,
        session_id: &str,
        data: &Value,
        version: i64,
        user_id: Option<&str>,
    ) -> Result<SaveOutcome, sqlx::Error> {
        // The fallback SELECT reads the pre-statement snapshot, which is the
        // stored row exactly when the upsert was skipped.
        let (version, updated_at, applied) = sqlx::query_as::<_, (i64, OffsetDateTime, bool)>(
            "WITH upsert AS (
                INSERT INTO sessions (id, data, version, updated_at, updated_by)
                VALUES ($1, $2, $3, now(), $4)
                ON CONFLICT (id) DO UPDATE
                    SET data = EXCLUDED.data,
                        version = EXCLUDED.version,
                        updated_at = EXCLUDED.updated_at,
                        updated_by = EXCLUDED.updated_by
                    WHERE sessions.version <= EXCLUDED.version
                RETURNING version, updated_at
            )
            SELECT version, updated_at, TRUE FROM upsert
            UNION ALL
            SELECT version, updated_at, FALSE FROM sessions
            WHERE id = $1 AND NOT EXISTS (SELECT 1 FROM upsert)",
        )
        .bind(session_id)
        .bind(data)
        .bind(version)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(SaveOutcome { applied, version, updated_at })
    }

    async fn count_snapshots(&self, session_id: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM session_snapshots WHERE session_id = $1")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await
    }

    async fn insert_snapshot(&self, snapshot: NewSnapshot) -> Result<SnapshotRow, sqlx::Error> {
        let id = Uuid::new_v4();
        let has_preview = snapshot.preview_png.is_some();
        let created_at: OffsetDateTime = sqlx::query_scalar(
            "INSERT INTO session_snapshots (id, session_id, name, data, preview_png)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING created_at",
        )
        .bind(id)
        .bind(&snapshot.session_id)
        .bind(&snapshot.name)
        .bind(&snapshot.data)
        .bind(snapshot.preview_png.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Ok(SnapshotRow { id, name: snapshot.name, created_at, has_preview })
    }

    async fn list_snapshots(&self, session_id: &str) -> Result<Vec<SnapshotRow>, sqlx::Error> {
        let rows = sqlx::query_as::<_, (Uuid, String, OffsetDateTime, bool)>(
            "SELECT id, name, created_at, preview_png IS NOT NULL
             FROM session_snapshots
             WHERE session_id = $1
             ORDER BY created_at DESC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, name, created_at, has_preview)| SnapshotRow { id, name, created_at, has_preview })
            .collect())
    }
}
