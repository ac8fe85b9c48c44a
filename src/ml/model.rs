use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::persistence::ModelMetrics;
use super::trainer::{CancelToken, TrainedModel, Trainer, TrainingError, TrainingWindow};
use crate::types::{PredictionValue, Tier};

/// Fitted baseline, persisted as the artifact payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BaselineWeights {
    /// Most frequent outcome label plus the observed label frequencies
    Majority {
        label: String,
        frequencies: BTreeMap<String, usize>,
    },
    /// Mean of the observed numeric outcomes
    Mean { mean: Decimal },
}

impl BaselineWeights {
    pub fn predict(&self) -> PredictionValue {
        match self {
            BaselineWeights::Majority { label, .. } => PredictionValue::label(label.clone()),
            BaselineWeights::Mean { mean } => PredictionValue::numeric(*mean),
        }
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, TrainingError> {
        serde_json::from_slice(payload).map_err(|e| TrainingError::Failed(e.to_string()))
    }
}

/// In-process trainer for deployments without an external ML stack.
/// Fits the majority outcome label, or the mean outcome for numeric tiers.
pub struct BaselineTrainer {
    min_training_samples: usize,
}

impl BaselineTrainer {
    pub fn new(min_training_samples: usize) -> Self {
        Self { min_training_samples }
    }

    /// Fit from resolved records only
    pub fn fit(&self, window: &TrainingWindow) -> Result<(BaselineWeights, ModelMetrics), TrainingError> {
        let outcomes: Vec<&PredictionValue> = window.records.iter().filter_map(|r| r.actual_value.as_ref()).collect();
        let n = outcomes.len();
        if n < self.min_training_samples.max(1) {
            return Err(TrainingError::InsufficientData {
                available: n,
                required: self.min_training_samples.max(1),
            });
        }

        let numeric: Vec<Decimal> = outcomes.iter().filter_map(|v| v.as_numeric()).collect();
        if numeric.len() == n {
            let mean = numeric.iter().copied().sum::<Decimal>() / Decimal::from(n);
            debug!("{} baseline mean {} over {} outcomes", window.tier, mean, n);
            return Ok((
                BaselineWeights::Mean { mean },
                ModelMetrics {
                    train_samples: n,
                    ..Default::default()
                },
            ));
        }

        let mut frequencies: BTreeMap<String, usize> = BTreeMap::new();
        for outcome in &outcomes {
            *frequencies.entry(outcome.to_string()).or_insert(0) += 1;
        }

        // Ties go to the lexically smallest label so fits are reproducible
        let (label, count) = frequencies
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(label, count)| (label.clone(), *count))
            .ok_or(TrainingError::InsufficientData { available: 0, required: 1 })?;

        let accuracy = count as f64 / n as f64;
        Ok((
            BaselineWeights::Majority { label, frequencies },
            ModelMetrics {
                accuracy: Some(accuracy),
                train_samples: n,
                ..Default::default()
            },
        ))
    }
}

impl Default for BaselineTrainer {
    fn default() -> Self {
        Self::new(30)
    }
}

#[async_trait]
impl Trainer for BaselineTrainer {
    async fn train(
        &self,
        tier: Tier,
        window: TrainingWindow,
        cancel: CancelToken,
    ) -> Result<TrainedModel, TrainingError> {
        if cancel.is_cancelled() {
            return Err(TrainingError::Cancelled);
        }

        let (weights, metrics) = self.fit(&window)?;
        let payload = serde_json::to_vec(&weights).map_err(|e| TrainingError::Failed(e.to_string()))?;

        info!(
            "Baseline {} model trained: {} samples{}",
            tier,
            metrics.train_samples,
            metrics.accuracy.map(|a| format!(", {:.1}% in-sample", a * 100.0)).unwrap_or_default()
        );
        Ok(TrainedModel { payload, metrics })
    }
}
