use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

use super::persistence::ModelMetrics;
use crate::types::{ModelKind, PredictionRecord, Tier};

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("Not enough training samples: {available} < {required}")]
    InsufficientData { available: usize, required: usize },

    #[error("Training was cancelled")]
    Cancelled,

    #[error("Training timed out after {0}s")]
    Timeout(u64),

    #[error("Trainer process failed: {0}")]
    Process(String),

    #[error("Training failed: {0}")]
    Failed(String),
}

/// Everything a trainer gets to fit a tier's models
#[derive(Debug, Clone, Serialize)]
pub struct TrainingWindow {
    pub tier: Tier,
    pub model_kinds: Vec<ModelKind>,
    /// Tiers whose predictions are included, the trained tier and everything below it
    pub covers: Vec<Tier>,
    pub start: Option<DateTime<Utc>>,
    pub end: DateTime<Utc>,
    pub records: Vec<PredictionRecord>,
}

impl TrainingWindow {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Content hash of the window, for reproducibility
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for record in &self.records {
            hasher.update(record.id.as_bytes());
            hasher.update(record.predicted_value.to_string().as_bytes());
            if let Some(actual) = &record.actual_value {
                hasher.update(actual.to_string().as_bytes());
            }
        }
        hex::encode(&hasher.finalize()[..8])
    }
}

/// Trainer output before the registry stamps a version on it
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub payload: Vec<u8>,
    pub metrics: ModelMetrics,
}

/// Cooperative cancellation flag handed to every training run
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// The ML layer. Fits the models of a tier to a training window.
///
/// Calls may take arbitrarily long and run on a background task. Implementations
/// that can stop early should watch `cancel`; any internal fallback to simpler
/// models is the trainer's business, the coordinator only sees success or failure.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Trainer: Send + Sync {
    async fn train(
        &self,
        tier: Tier,
        window: TrainingWindow,
        cancel: CancelToken,
    ) -> Result<TrainedModel, TrainingError>;
}

/// Bounds every call of the wrapped trainer
pub struct TimeoutTrainer<T> {
    inner: T,
    timeout: Duration,
}

impl<T: Trainer> TimeoutTrainer<T> {
    pub fn new(inner: T, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<T: Trainer> Trainer for TimeoutTrainer<T> {
    async fn train(
        &self,
        tier: Tier,
        window: TrainingWindow,
        cancel: CancelToken,
    ) -> Result<TrainedModel, TrainingError> {
        match tokio::time::timeout(self.timeout, self.inner.train(tier, window, cancel.clone())).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(TrainingError::Timeout(self.timeout.as_secs()))
            }
        }
    }
}

#[async_trait]
impl Trainer for Arc<dyn Trainer> {
    async fn train(
        &self,
        tier: Tier,
        window: TrainingWindow,
        cancel: CancelToken,
    ) -> Result<TrainedModel, TrainingError> {
        self.as_ref().train(tier, window, cancel).await
    }
}
