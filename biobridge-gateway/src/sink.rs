//! Persistence of enrollment outcomes.
//!
//! The orchestrator hands every terminal outcome to a [`RecordSink`]. Sink
//! failures are logged by the caller and never change an enrollment's result.

use std::path::Path;

use async_trait::async_trait;
use biobridge_core::{DeviceId, EnrollmentRecord, IdentityId, RecordOutcome};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination for enrollment records.
#[async_trait]
pub trait RecordSink: Send + Sync + 'static {
    async fn record(&self, record: &EnrollmentRecord) -> Result<(), SinkError>;
}

// ============================================================================
// SQLite
// ============================================================================

/// Stores records in the `enrollment_records` table.
#[derive(Clone, Debug)]
pub struct SqliteRecordSink {
    pool: SqlitePool,
}

impl SqliteRecordSink {
    /// Open or create the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Use an existing pool, creating the table if needed.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, SinkError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS enrollment_records (
                id TEXT PRIMARY KEY,
                identity_id TEXT NOT NULL,
                outcome TEXT NOT NULL,
                ts TEXT NOT NULL,
                quality_score INTEGER,
                external_id TEXT,
                device_id INTEGER,
                detail TEXT
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_enrollment_records_identity ON enrollment_records(identity_id)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Most recent records first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<EnrollmentRecord>, SinkError> {
        let rows = sqlx::query(
            r#"
            SELECT id, identity_id, outcome, ts, quality_score, external_id, device_id, detail
            FROM enrollment_records
            ORDER BY ts DESC
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Records for one identity, oldest first.
    pub async fn for_identity(&self, identity_id: &IdentityId) -> Result<Vec<EnrollmentRecord>, SinkError> {
        let rows = sqlx::query(
            r#"
            SELECT id, identity_id, outcome, ts, quality_score, external_id, device_id, detail
            FROM enrollment_records
            WHERE identity_id = ?1
            ORDER BY ts ASC
            "#,
        )
        .bind(identity_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

#[async_trait]
impl RecordSink for SqliteRecordSink {
    async fn record(&self, record: &EnrollmentRecord) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            INSERT INTO enrollment_records (
                id, identity_id, outcome, ts, quality_score, external_id, device_id, detail
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.identity_id.as_str())
        .bind(record.outcome.as_str())
        .bind(record.ts.to_rfc3339())
        .bind(record.quality_score.map(i64::from))
        .bind(record.external_id.as_deref())
        .bind(record.device_id.map(|d| i64::from(d.as_u32())))
        .bind(record.detail.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<EnrollmentRecord, sqlx::Error> {
    let id_str: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| sqlx::Error::Decode(format!("Invalid record id: {}", e).into()))?;

    let outcome_str: String = row.try_get("outcome")?;
    let outcome = RecordOutcome::parse(&outcome_str)
        .ok_or_else(|| sqlx::Error::Decode(format!("Invalid outcome: {}", outcome_str).into()))?;

    let ts_str: String = row.try_get("ts")?;
    let ts = DateTime::parse_from_rfc3339(&ts_str)
        .map_err(|e| sqlx::Error::Decode(format!("Invalid ts: {}", e).into()))?
        .with_timezone(&Utc);

    let quality_score = row
        .try_get::<Option<i64>, _>("quality_score")?
        .and_then(|q| u8::try_from(q).ok());
    let device_id = row
        .try_get::<Option<i64>, _>("device_id")?
        .and_then(|d| u32::try_from(d).ok())
        .map(DeviceId::new);

    Ok(EnrollmentRecord {
        id,
        identity_id: IdentityId::new(row.try_get::<String, _>("identity_id")?),
        outcome,
        ts,
        quality_score,
        external_id: row.try_get("external_id")?,
        device_id,
        detail: row.try_get("detail")?,
    })
}

// ============================================================================
// Log-only
// ============================================================================

/// Logs records instead of storing them (`--no-persist`).
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingRecordSink;

#[async_trait]
impl RecordSink for TracingRecordSink {
    async fn record(&self, record: &EnrollmentRecord) -> Result<(), SinkError> {
        tracing::info!(
            identity = %record.identity_id,
            outcome = record.outcome.as_str(),
            quality = ?record.quality_score,
            external_id = ?record.external_id,
            device = ?record.device_id,
            detail = ?record.detail,
            "Enrollment record"
        );
        Ok(())
    }
}
