//! SQLite storage backend implementation
//!
//! This module provides a SQLite-based implementation of the `Backend` trait.
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers are not blocked by the single writer
//! - **Connection pooling**: Workers and connection handlers share one pool
//! - **Migrations**: Schema versioning with sqlx, applied by `bootstrap`
//!
//! Multi-statement writes run inside a transaction since the pool hands out
//! several connections to tasks running in parallel.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument};

use super::backend::Backend;
use super::error::{StorageError, StorageResult};
use super::schema::{AgentRecord, HealthTransition, MetricRow, PendingAlert, StatusRecord};

/// Oldest SQLite release with `INSERT ... ON CONFLICT DO UPDATE`
pub const MIN_SQLITE_VERSION: (u32, u32, u32) = (3, 24, 0);

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    retention_days: u32,
}

impl SqliteBackend {
    /// Open (and create if missing) the database file
    ///
    /// Refuses engines older than [`MIN_SQLITE_VERSION`]. The schema is not
    /// touched until [`Backend::bootstrap`] runs.
    #[instrument(skip_all)]
    pub async fn open(db_path: impl AsRef<Path>, retention_days: u32) -> StorageResult<Self> {
        let db_path = db_path.as_ref();

        info!("opening SQLite database at {}", db_path.display());

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        let (version,): (String,) = sqlx::query_as("SELECT sqlite_version()")
            .fetch_one(&pool)
            .await?;

        if !is_supported_version(&version) {
            pool.close().await;
            return Err(StorageError::UnsupportedVersion(version));
        }

        debug!("SQLite engine version {version}");

        Ok(Self {
            pool,
            retention_days,
        })
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.pool.is_closed() {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Parse a `major.minor.patch` version string and compare it against
/// [`MIN_SQLITE_VERSION`]
pub fn is_supported_version(version: &str) -> bool {
    let mut parts = version
        .trim()
        .split('.')
        .map(|part| part.parse::<u32>().ok());

    let major = parts.next().flatten();
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);

    match major {
        Some(major) => (major, minor, patch) >= MIN_SQLITE_VERSION,
        None => false,
    }
}

fn status_from_row(row: &sqlx::sqlite::SqliteRow) -> StatusRecord {
    StatusRecord {
        ident: row.get("ident"),
        module: row.get("module"),
        status: row.get("status"),
        message: row.get("message"),
        updated_at: row.get("updated_at"),
    }
}

const UPSERT_STATUS: &str = r#"
    INSERT INTO analytics_status (ident, module, status, message, updated_at)
    VALUES (?, ?, ?, ?, ?)
    ON CONFLICT (ident, module) DO UPDATE SET
        status = excluded.status,
        message = excluded.message,
        updated_at = excluded.updated_at
"#;

#[async_trait]
impl Backend for SqliteBackend {
    #[instrument(skip(self))]
    async fn bootstrap(&self) -> StorageResult<()> {
        self.ensure_open()?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database schema ready");

        Ok(())
    }

    async fn shutdown(&self) -> StorageResult<()> {
        self.ensure_open()?;
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cleanup(&self) -> StorageResult<()> {
        self.ensure_open()?;

        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(self.retention_days)))
            .timestamp_millis();

        let result = sqlx::query("DELETE FROM metric WHERE recorded_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        debug!("deleted {} expired metric samples", result.rows_affected());

        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA optimize").execute(&self.pool).await?;

        Ok(())
    }

    async fn get_pending_alerts(&self) -> StorageResult<Vec<PendingAlert>> {
        self.ensure_open()?;

        let rows = sqlx::query(
            r#"
            SELECT id, ident, module, previous_status, status, message, created_at
            FROM alert
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| PendingAlert {
                id: row.get("id"),
                ident: row.get("ident"),
                module: row.get("module"),
                previous_status: row.get("previous_status"),
                status: row.get("status"),
                message: row.get("message"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn mark_alerts_sent(&self, ids: &[i64]) -> StorageResult<()> {
        self.ensure_open()?;

        if ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM alert WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn list_all_status_records(&self) -> StorageResult<Vec<StatusRecord>> {
        self.ensure_open()?;

        let rows = sqlx::query(
            "SELECT ident, module, status, message, updated_at FROM analytics_status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(status_from_row).collect())
    }

    async fn get_status_record(
        &self,
        ident: &str,
        module: &str,
    ) -> StorageResult<Option<StatusRecord>> {
        self.ensure_open()?;

        let row = sqlx::query(
            r#"
            SELECT ident, module, status, message, updated_at
            FROM analytics_status
            WHERE ident = ? AND module = ?
            "#,
        )
        .bind(ident)
        .bind(module)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(status_from_row))
    }

    async fn upsert_status_record(&self, record: &StatusRecord) -> StorageResult<()> {
        self.ensure_open()?;

        sqlx::query(UPSERT_STATUS)
            .bind(&record.ident)
            .bind(&record.module)
            .bind(record.status)
            .bind(&record.message)
            .bind(record.updated_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    #[instrument(skip_all, fields(ident = %record.ident, module = %record.module))]
    async fn process_status_update(
        &self,
        record: &StatusRecord,
        transition: &HealthTransition,
    ) -> StorageResult<()> {
        self.ensure_open()?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(UPSERT_STATUS)
            .bind(&record.ident)
            .bind(&record.module)
            .bind(record.status)
            .bind(&record.message)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await?;

        if transition.should_alert() {
            sqlx::query(
                r#"
                INSERT INTO alert (ident, module, previous_status, status, message, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&transition.ident)
            .bind(&transition.module)
            .bind(transition.previous)
            .bind(transition.current)
            .bind(&transition.message)
            .bind(transition.at)
            .execute(&mut *tx)
            .await?;

            debug!(
                "queued alert for status change {:?} -> {}",
                transition.previous, transition.current
            );
        }

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_agent(&self, agent: &AgentRecord) -> StorageResult<()> {
        self.ensure_open()?;

        sqlx::query(
            r#"
            INSERT INTO agent (ident, remote_ip, version, last_seen)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (ident) DO UPDATE SET
                remote_ip = excluded.remote_ip,
                version = excluded.version,
                last_seen = excluded.last_seen
            "#,
        )
        .bind(&agent.ident)
        .bind(&agent.remote_ip)
        .bind(&agent.version)
        .bind(agent.last_seen)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, metrics), fields(count = metrics.len()))]
    async fn insert_metrics(&self, metrics: Vec<MetricRow>) -> StorageResult<()> {
        self.ensure_open()?;

        if metrics.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for metric in metrics {
            sqlx::query(
                r#"
                INSERT INTO metric (
                    ident, module, subject, metric, value, format, min, max, recorded_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&metric.ident)
            .bind(&metric.module)
            .bind(&metric.subject)
            .bind(&metric.metric)
            .bind(metric.value)
            .bind(&metric.format)
            .bind(metric.min)
            .bind(metric.max)
            .bind(metric.recorded_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
