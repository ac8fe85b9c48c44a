use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

use crate::notifications::{LifecycleEvent, Notification, Severity};
use crate::types::{PredictionRecord, PredictionValue, Tier};

/// SQLite journal for predictions and lifecycle events
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Initialize database with schema
    pub async fn new(db_path: &str) -> Result<Self> {
        info!("Initializing SQLite database at: {}", db_path);

        let options = SqliteConnectOptions::from_str(db_path)?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.create_schema().await?;

        info!("Database initialized successfully");
        Ok(db)
    }

    /// Private in-memory database. A single connection, since every
    /// connection to `sqlite::memory:` is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.create_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS predictions (
                id TEXT PRIMARY KEY,
                tier TEXT NOT NULL,
                model_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                predicted_value TEXT NOT NULL,
                actual_value TEXT,
                resolved_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_predictions_tier_created ON predictions(tier, created_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lifecycle_events (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                severity TEXT NOT NULL,
                tier TEXT,
                kind TEXT NOT NULL,
                event_data TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_lifecycle_events_timestamp ON lifecycle_events(timestamp)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn insert_prediction(&self, record: &PredictionRecord) -> Result<()> {
        let actual_json = record.actual_value.as_ref().map(|v| v.to_json()).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO predictions (id, tier, model_id, created_at, predicted_value, actual_value, resolved_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.tier.as_str())
        .bind(&record.model_id)
        .bind(record.created_at.to_rfc3339())
        .bind(record.predicted_value.to_json()?)
        .bind(actual_json)
        .bind(record.resolved_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Journal an outcome. Only unresolved rows are touched.
    pub async fn resolve_prediction(
        &self,
        id: &str,
        actual_value: &PredictionValue,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE predictions
            SET actual_value = ?, resolved_at = ?
            WHERE id = ? AND actual_value IS NULL
            "#,
        )
        .bind(actual_value.to_json()?)
        .bind(resolved_at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Newest `limit` predictions of a tier, returned oldest first
    pub async fn load_predictions(&self, tier: Tier, limit: usize) -> Result<Vec<PredictionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tier, model_id, created_at, predicted_value, actual_value, resolved_at
            FROM predictions
            WHERE tier = ?
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(tier.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows.iter().map(parse_prediction).collect::<Result<Vec<_>>>()?;
        records.reverse();
        Ok(records)
    }

    pub async fn prediction_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM predictions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }

    pub async fn insert_event(&self, notification: &Notification) -> Result<()> {
        let severity_str = match notification.severity {
            Severity::Info => "Info",
            Severity::Warning => "Warning",
        };
        let event_json = serde_json::to_string(&notification.event)?;

        sqlx::query(
            r#"
            INSERT INTO lifecycle_events (id, timestamp, severity, tier, kind, event_data)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&notification.id)
        .bind(notification.timestamp.to_rfc3339())
        .bind(severity_str)
        .bind(notification.event.tier().map(|t| t.as_str()))
        .bind(notification.event.kind())
        .bind(event_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Newest first
    pub async fn get_recent_events(&self, limit: usize) -> Result<Vec<Notification>> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp, severity, event_data
            FROM lifecycle_events
            ORDER BY timestamp DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut notifications = Vec::new();
        for row in rows {
            let severity = match row.get::<String, _>("severity").as_str() {
                "Warning" => Severity::Warning,
                _ => Severity::Info,
            };
            let event_json: String = row.get("event_data");
            let event: LifecycleEvent = serde_json::from_str(&event_json)?;

            notifications.push(Notification {
                id: row.get("id"),
                timestamp: DateTime::parse_from_rfc3339(row.get("timestamp"))?.with_timezone(&Utc),
                severity,
                event,
            });
        }

        Ok(notifications)
    }

    /// Drop resolved predictions and events older than `keep_days`
    pub async fn cleanup_old_data(&self, keep_days: i64) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::days(keep_days);

        sqlx::query("DELETE FROM predictions WHERE created_at < ? AND actual_value IS NOT NULL")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;

        sqlx::query("DELETE FROM lifecycle_events WHERE timestamp < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;

        info!("Cleaned up data older than {} days", keep_days);
        Ok(())
    }
}

fn parse_prediction(row: &SqliteRow) -> Result<PredictionRecord> {
    let tier_str: String = row.get("tier");
    let created_at: String = row.get("created_at");
    let predicted_json: String = row.get("predicted_value");
    let actual_json: Option<String> = row.get("actual_value");
    let resolved_at: Option<String> = row.get("resolved_at");

    Ok(PredictionRecord {
        id: row.get("id"),
        tier: Tier::from_str(&tier_str)?,
        model_id: row.get("model_id"),
        created_at: parse_timestamp(&created_at)?,
        predicted_value: PredictionValue::from_json(&predicted_json)?,
        actual_value: actual_json.as_deref().map(PredictionValue::from_json).transpose()?,
        resolved_at: resolved_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| anyhow!("Invalid timestamp {}: {}", s, e))
}
