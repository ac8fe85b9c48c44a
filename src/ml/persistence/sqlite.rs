use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use super::{ArtifactMetadata, ModelArtifact, ModelMetrics, ModelStore, RegistryError};
use crate::types::{ModelKind, Tier};

/// Model artifacts as rows in `model_artifacts` with payloads as files under `models_dir`
pub struct SqliteModelStore {
    pool: SqlitePool,
    models_dir: PathBuf,
}

impl SqliteModelStore {
    pub async fn new(pool: SqlitePool, models_dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let store = Self {
            pool,
            models_dir: models_dir.into(),
        };
        store.ensure_models_dir()?;
        store.create_schema().await?;
        Ok(store)
    }

    fn ensure_models_dir(&self) -> Result<(), RegistryError> {
        std::fs::create_dir_all(&self.models_dir)?;
        Ok(())
    }

    async fn create_schema(&self) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS model_artifacts (
                tier TEXT NOT NULL,
                version INTEGER NOT NULL,
                trained_at TEXT NOT NULL,
                training_window_size INTEGER NOT NULL,
                model_kinds TEXT NOT NULL,
                metrics_json TEXT NOT NULL,
                data_digest TEXT NOT NULL,
                payload_digest TEXT NOT NULL,
                model_path TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (tier, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_model_artifacts_active ON model_artifacts(tier, is_active)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn model_path(&self, tier: Tier, version: u64) -> PathBuf {
        self.models_dir.join(format!("{}_v{}.bin", tier.as_str(), version))
    }

    fn parse_metadata(row: &SqliteRow) -> Result<ArtifactMetadata, RegistryError> {
        let tier_str: String = row.get("tier");
        let trained_at_str: String = row.get("trained_at");
        let kinds_json: String = row.get("model_kinds");
        let metrics_json: String = row.get("metrics_json");

        let kinds: Vec<String> = serde_json::from_str(&kinds_json)?;
        let model_kinds = kinds
            .iter()
            .map(|k| ModelKind::from_str(k))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RegistryError::Corrupt(e.to_string()))?;

        Ok(ArtifactMetadata {
            tier: Tier::from_str(&tier_str).map_err(|e| RegistryError::Corrupt(e.to_string()))?,
            version: row.get::<i64, _>("version") as u64,
            trained_at: DateTime::parse_from_rfc3339(&trained_at_str)
                .map_err(|e| RegistryError::Corrupt(e.to_string()))?
                .with_timezone(&Utc),
            training_window_size: row.get::<i64, _>("training_window_size") as usize,
            model_kinds,
            metrics: ModelMetrics::from_json(&metrics_json)?,
            data_digest: row.get("data_digest"),
            payload_digest: row.get("payload_digest"),
        })
    }

    fn load_artifact(row: &SqliteRow) -> Result<ModelArtifact, RegistryError> {
        let metadata = Self::parse_metadata(row)?;
        let model_path: String = row.get("model_path");
        let payload = read_payload(Path::new(&model_path))?;
        debug!("Loaded {} model v{} from {}", metadata.tier, metadata.version, model_path);
        Ok(ModelArtifact { metadata, payload })
    }
}

fn read_payload(path: &Path) -> Result<Vec<u8>, RegistryError> {
    if !path.exists() {
        return Err(RegistryError::Corrupt(format!("Model file not found: {}", path.display())));
    }
    Ok(std::fs::read(path)?)
}

const SELECT_COLUMNS: &str = "SELECT tier, version, trained_at, training_window_size, model_kinds, \
     metrics_json, data_digest, payload_digest, model_path, is_active FROM model_artifacts";

#[async_trait]
impl ModelStore for SqliteModelStore {
    async fn put(&self, artifact: &ModelArtifact) -> Result<(), RegistryError> {
        let metadata = &artifact.metadata;
        let model_path = self.model_path(metadata.tier, metadata.version);

        // Payload lands before the row so an active row always has a file behind it
        self.ensure_models_dir()?;
        tokio::fs::write(&model_path, &artifact.payload).await?;

        let kinds: Vec<&str> = metadata.model_kinds.iter().map(|k| k.as_str()).collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE model_artifacts SET is_active = 0 WHERE tier = ?")
            .bind(metadata.tier.as_str())
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO model_artifacts
                (tier, version, trained_at, training_window_size, model_kinds, metrics_json,
                 data_digest, payload_digest, model_path, is_active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(metadata.tier.as_str())
        .bind(metadata.version as i64)
        .bind(metadata.trained_at.to_rfc3339())
        .bind(metadata.training_window_size as i64)
        .bind(serde_json::to_string(&kinds)?)
        .bind(metadata.metrics.to_json()?)
        .bind(&metadata.data_digest)
        .bind(&metadata.payload_digest)
        .bind(model_path.to_string_lossy().to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!("Saved {} model v{} to {}", metadata.tier, metadata.version, model_path.display());
        Ok(())
    }

    async fn get(&self, tier: Tier) -> Result<Option<ModelArtifact>, RegistryError> {
        let row = sqlx::query(&format!("{} WHERE tier = ? AND is_active = 1 LIMIT 1", SELECT_COLUMNS))
            .bind(tier.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::load_artifact).transpose()
    }

    async fn get_version(&self, tier: Tier, version: u64) -> Result<Option<ModelArtifact>, RegistryError> {
        let row = sqlx::query(&format!("{} WHERE tier = ? AND version = ?", SELECT_COLUMNS))
            .bind(tier.as_str())
            .bind(version as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::load_artifact).transpose()
    }

    async fn list_versions(&self, tier: Tier) -> Result<Vec<ArtifactMetadata>, RegistryError> {
        let rows = sqlx::query(&format!("{} WHERE tier = ? ORDER BY version DESC", SELECT_COLUMNS))
            .bind(tier.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::parse_metadata).collect()
    }

    async fn set_active(&self, tier: Tier, version: u64) -> Result<(), RegistryError> {
        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM model_artifacts WHERE tier = ? AND version = ?")
            .bind(tier.as_str())
            .bind(version as i64)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(RegistryError::NotFound { tier, version });
        }

        sqlx::query("UPDATE model_artifacts SET is_active = CASE WHEN version = ? THEN 1 ELSE 0 END WHERE tier = ?")
            .bind(version as i64)
            .bind(tier.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Activated {} model v{}", tier, version);
        Ok(())
    }

    async fn delete_version(&self, tier: Tier, version: u64) -> Result<bool, RegistryError> {
        let row = sqlx::query("SELECT model_path, is_active FROM model_artifacts WHERE tier = ? AND version = ?")
            .bind(tier.as_str())
            .bind(version as i64)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(false);
        };
        if row.get::<i64, _>("is_active") == 1 {
            return Err(RegistryError::ActiveVersion { tier, version });
        }

        let model_path: String = row.get("model_path");
        sqlx::query("DELETE FROM model_artifacts WHERE tier = ? AND version = ?")
            .bind(tier.as_str())
            .bind(version as i64)
            .execute(&self.pool)
            .await?;

        if let Err(e) = tokio::fs::remove_file(&model_path).await {
            debug!("Model file {} already gone: {}", model_path, e);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::persistence::{payload_digest, ModelRegistry};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;

    async fn store(dir: &Path) -> SqliteModelStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteModelStore::new(pool, dir.join("models")).await.unwrap()
    }

    fn artifact(tier: Tier, version: u64, payload: &[u8]) -> ModelArtifact {
        ModelArtifact {
            metadata: ArtifactMetadata {
                tier,
                version,
                trained_at: Utc::now(),
                training_window_size: 42,
                model_kinds: vec![ModelKind::LogisticRegression, ModelKind::XGBoost],
                metrics: ModelMetrics { accuracy: Some(0.61), train_samples: 42, ..Default::default() },
                data_digest: "0123456789abcdef".to_string(),
                payload_digest: payload_digest(payload),
            },
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        let saved = artifact(Tier::Intermediate, 1, b"weights-v1");
        store.put(&saved).await.unwrap();

        let loaded = store.get(Tier::Intermediate).await.unwrap().unwrap();
        assert_eq!(loaded.payload, saved.payload);
        assert_eq!(loaded.metadata.version, 1);
        assert_eq!(loaded.metadata.model_kinds, saved.metadata.model_kinds);
        assert_eq!(loaded.metadata.metrics, saved.metadata.metrics);
        assert!(loaded.verify().is_ok());
        assert!(dir.path().join("models/intermediate_v1.bin").exists());
    }

    #[tokio::test]
    async fn test_new_version_deactivates_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        store.put(&artifact(Tier::Basic, 1, b"a")).await.unwrap();
        store.put(&artifact(Tier::Basic, 2, b"b")).await.unwrap();

        assert_eq!(store.get(Tier::Basic).await.unwrap().unwrap().metadata.version, 2);
        let versions: Vec<u64> = store.list_versions(Tier::Basic).await.unwrap().iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![2, 1]);

        store.set_active(Tier::Basic, 1).await.unwrap();
        assert_eq!(store.get(Tier::Basic).await.unwrap().unwrap().payload, b"a".to_vec());
    }

    #[tokio::test]
    async fn test_delete_refuses_active_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        store.put(&artifact(Tier::Basic, 1, b"a")).await.unwrap();
        store.put(&artifact(Tier::Basic, 2, b"b")).await.unwrap();

        assert!(matches!(
            store.delete_version(Tier::Basic, 2).await,
            Err(RegistryError::ActiveVersion { version: 2, .. })
        ));
        assert!(store.delete_version(Tier::Basic, 1).await.unwrap());
        assert!(!store.delete_version(Tier::Basic, 1).await.unwrap());
        assert!(!dir.path().join("models/basic_v1.bin").exists());
    }

    #[tokio::test]
    async fn test_registry_over_sqlite_detects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store(dir.path()).await);
        let registry = ModelRegistry::new(store.clone());
        registry.put(artifact(Tier::Advanced, 1, b"lstm")).await.unwrap();

        std::fs::remove_file(dir.path().join("models/advanced_v1.bin")).unwrap();
        assert!(matches!(registry.get(Tier::Advanced).await, Err(RegistryError::Corrupt(_))));
    }
}
