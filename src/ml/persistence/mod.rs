pub mod sqlite;

pub use sqlite::SqliteModelStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::trainer::{TrainedModel, TrainingWindow};
use crate::types::{ModelKind, Tier};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Model {tier} v{version} not found")]
    NotFound { tier: Tier, version: u64 },

    #[error("Cannot delete active model {tier} v{version}")]
    ActiveVersion { tier: Tier, version: u64 },

    #[error("Payload digest mismatch for {tier} v{version}")]
    Integrity { tier: Tier, version: u64 },

    #[error("Corrupt model record: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Model metadata and metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub accuracy: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1_score: Option<f64>,
    pub train_samples: usize,
    pub test_samples: usize,
}

impl ModelMetrics {
    pub fn to_json(&self) -> Result<String, RegistryError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub tier: Tier,
    /// Monotonic per tier, starting at 1
    pub version: u64,
    pub trained_at: DateTime<Utc>,
    pub training_window_size: usize,
    pub model_kinds: Vec<ModelKind>,
    pub metrics: ModelMetrics,
    pub data_digest: String,
    pub payload_digest: String,
}

/// Opaque trained payload plus its version stamp
#[derive(Debug, Clone, PartialEq)]
pub struct ModelArtifact {
    pub metadata: ArtifactMetadata,
    pub payload: Vec<u8>,
}

impl ModelArtifact {
    pub fn version(&self) -> u64 {
        self.metadata.version
    }

    pub fn tier(&self) -> Tier {
        self.metadata.tier
    }

    pub fn verify(&self) -> Result<(), RegistryError> {
        if payload_digest(&self.payload) != self.metadata.payload_digest {
            return Err(RegistryError::Integrity {
                tier: self.metadata.tier,
                version: self.metadata.version,
            });
        }
        Ok(())
    }
}

pub fn payload_digest(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Durable key-value home for model artifacts.
///
/// `put` stores a version and makes it the tier's active one; older versions
/// stay retrievable for rollback until deleted.
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn put(&self, artifact: &ModelArtifact) -> Result<(), RegistryError>;
    async fn get(&self, tier: Tier) -> Result<Option<ModelArtifact>, RegistryError>;
    async fn get_version(&self, tier: Tier, version: u64) -> Result<Option<ModelArtifact>, RegistryError>;
    /// Newest first
    async fn list_versions(&self, tier: Tier) -> Result<Vec<ArtifactMetadata>, RegistryError>;
    async fn set_active(&self, tier: Tier, version: u64) -> Result<(), RegistryError>;
    async fn delete_version(&self, tier: Tier, version: u64) -> Result<bool, RegistryError>;
}

#[derive(Default)]
struct TierVersions {
    versions: BTreeMap<u64, ModelArtifact>,
    active: Option<u64>,
}

/// Store for tests and `--ephemeral` runs. Nothing survives the process.
#[derive(Default)]
pub struct InMemoryModelStore {
    tiers: RwLock<HashMap<Tier, TierVersions>>,
}

impl InMemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModelStore for InMemoryModelStore {
    async fn put(&self, artifact: &ModelArtifact) -> Result<(), RegistryError> {
        let mut tiers = self.tiers.write().await;
        let entry = tiers.entry(artifact.tier()).or_default();
        entry.versions.insert(artifact.version(), artifact.clone());
        entry.active = Some(artifact.version());
        Ok(())
    }

    async fn get(&self, tier: Tier) -> Result<Option<ModelArtifact>, RegistryError> {
        let tiers = self.tiers.read().await;
        Ok(tiers
            .get(&tier)
            .and_then(|t| t.active.and_then(|v| t.versions.get(&v)))
            .cloned())
    }

    async fn get_version(&self, tier: Tier, version: u64) -> Result<Option<ModelArtifact>, RegistryError> {
        let tiers = self.tiers.read().await;
        Ok(tiers.get(&tier).and_then(|t| t.versions.get(&version)).cloned())
    }

    async fn list_versions(&self, tier: Tier) -> Result<Vec<ArtifactMetadata>, RegistryError> {
        let tiers = self.tiers.read().await;
        Ok(tiers
            .get(&tier)
            .map(|t| t.versions.values().rev().map(|a| a.metadata.clone()).collect())
            .unwrap_or_default())
    }

    async fn set_active(&self, tier: Tier, version: u64) -> Result<(), RegistryError> {
        let mut tiers = self.tiers.write().await;
        let entry = tiers.entry(tier).or_default();
        if !entry.versions.contains_key(&version) {
            return Err(RegistryError::NotFound { tier, version });
        }
        entry.active = Some(version);
        Ok(())
    }

    async fn delete_version(&self, tier: Tier, version: u64) -> Result<bool, RegistryError> {
        let mut tiers = self.tiers.write().await;
        let Some(entry) = tiers.get_mut(&tier) else {
            return Ok(false);
        };
        if entry.active == Some(version) {
            return Err(RegistryError::ActiveVersion { tier, version });
        }
        Ok(entry.versions.remove(&version).is_some())
    }
}

/// Tracks the active model version per tier on top of a [`ModelStore`].
///
/// Only the retrain coordinator mutates it while the loop runs.
pub struct ModelRegistry {
    store: Arc<dyn ModelStore>,
    active: RwLock<HashMap<Tier, ArtifactMetadata>>,
}

impl ModelRegistry {
    pub fn new(store: Arc<dyn ModelStore>) -> Self {
        Self {
            store,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Warm the active-version cache from the store
    pub async fn load(&self) -> Result<(), RegistryError> {
        let mut active = self.active.write().await;
        for tier in Tier::ALL {
            if let Some(artifact) = self.store.get(tier).await? {
                info!("Active {} model: v{} trained {}", tier, artifact.version(), artifact.metadata.trained_at);
                active.insert(tier, artifact.metadata);
            }
        }
        Ok(())
    }

    pub async fn put(&self, artifact: ModelArtifact) -> Result<(), RegistryError> {
        self.store.put(&artifact).await?;
        self.active.write().await.insert(artifact.tier(), artifact.metadata);
        Ok(())
    }

    /// Active artifact for a tier, integrity-checked
    pub async fn get(&self, tier: Tier) -> Result<Option<ModelArtifact>, RegistryError> {
        match self.store.get(tier).await? {
            Some(artifact) => {
                artifact.verify()?;
                Ok(Some(artifact))
            }
            None => Ok(None),
        }
    }

    pub async fn active(&self, tier: Tier) -> Option<ArtifactMetadata> {
        self.active.read().await.get(&tier).cloned()
    }

    pub async fn active_version(&self, tier: Tier) -> Option<u64> {
        self.active.read().await.get(&tier).map(|m| m.version)
    }

    /// Next version for a tier: one past the highest version ever stored
    pub async fn next_version(&self, tier: Tier) -> Result<u64, RegistryError> {
        let latest = self.store.list_versions(tier).await?.iter().map(|m| m.version).max();
        let active = self.active_version(tier).await;
        Ok(latest.max(active).unwrap_or(0) + 1)
    }

    /// Stamp a freshly trained model with the next version and activate it
    pub async fn commit(
        &self,
        window: &TrainingWindow,
        trained: TrainedModel,
        trained_at: DateTime<Utc>,
    ) -> Result<ModelArtifact, RegistryError> {
        let version = self.next_version(window.tier).await?;
        let artifact = ModelArtifact {
            metadata: ArtifactMetadata {
                tier: window.tier,
                version,
                trained_at,
                training_window_size: window.len(),
                model_kinds: window.model_kinds.clone(),
                metrics: trained.metrics,
                data_digest: window.digest(),
                payload_digest: payload_digest(&trained.payload),
            },
            payload: trained.payload,
        };

        self.put(artifact.clone()).await?;
        info!("Activated {} model v{} ({} training records)", window.tier, version, window.len());
        Ok(artifact)
    }

    /// Re-activate an older version
    pub async fn rollback(&self, tier: Tier, version: u64) -> Result<ArtifactMetadata, RegistryError> {
        let artifact = self
            .store
            .get_version(tier, version)
            .await?
            .ok_or(RegistryError::NotFound { tier, version })?;
        artifact.verify()?;

        self.store.set_active(tier, version).await?;
        self.active.write().await.insert(tier, artifact.metadata.clone());
        info!("Rolled back {} model to v{}", tier, version);
        Ok(artifact.metadata)
    }

    pub async fn history(&self, tier: Tier) -> Result<Vec<ArtifactMetadata>, RegistryError> {
        self.store.list_versions(tier).await
    }

    /// Delete all but the newest `keep` versions. Neither the active version
    /// nor the highest stored one is deleted; the latter anchors `next_version`.
    pub async fn cleanup_old_versions(&self, tier: Tier, keep: usize) -> Result<usize, RegistryError> {
        let versions = self.store.list_versions(tier).await?;
        let active = self.active_version(tier).await;
        let newest = versions.iter().map(|m| m.version).max();

        let mut deleted = 0;
        for metadata in versions.iter().skip(keep) {
            if Some(metadata.version) == active || Some(metadata.version) == newest {
                continue;
            }
            match self.store.delete_version(tier, metadata.version).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to delete {} v{}: {}", tier, metadata.version, e),
            }
        }

        if deleted > 0 {
            info!("Cleaned up {} old versions of {} model", deleted, tier);
        }
        Ok(deleted)
    }
}
