use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::profiles::RetrainProfile;
use crate::types::{ModelKind, Tier};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub profile: RetrainProfile,
    pub tiers: TierTable,
    pub evaluation: EvaluationSettings,
    pub coordinator: CoordinatorSettings,
    pub storage: StorageSettings,
    pub trainer: TrainerSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            profile: RetrainProfile::Reference,
            tiers: TierTable::reference(),
            evaluation: EvaluationSettings::default(),
            coordinator: CoordinatorSettings::default(),
            storage: StorageSettings::default(),
            trainer: TrainerSettings::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn tier(&self, tier: Tier) -> &TierSettings {
        self.tiers.get(tier)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Per-tier validation
        for tier in Tier::ALL {
            let settings = self.tier(tier);
            if settings.interval_secs == 0 {
                errors.push(format!("{}: interval_secs must be > 0", tier));
            }
            if settings.models.is_empty() {
                errors.push(format!("{}: models must not be empty", tier));
            }
            if settings.accuracy_threshold <= 0.0 || settings.accuracy_threshold > 1.0 {
                errors.push(format!("{}: accuracy_threshold must be between 0 and 1", tier));
            }
            if settings.min_samples == 0 {
                errors.push(format!("{}: min_samples must be > 0", tier));
            }
            match (settings.window_size, settings.window_secs) {
                (None, None) => errors.push(format!(
                    "{}: one of window_size or window_secs must be set", tier
                )),
                (Some(size), _) if size < settings.min_samples => errors.push(format!(
                    "{}: window_size ({}) must be >= min_samples ({})",
                    tier, size, settings.min_samples
                )),
                (_, Some(0)) => errors.push(format!("{}: window_secs must be > 0", tier)),
                _ => {}
            }
            if settings.tolerance < Decimal::ZERO {
                errors.push(format!("{}: tolerance must be >= 0", tier));
            }
        }

        // Cross-tier invariants
        for pair in Tier::ALL.windows(2) {
            let (lower, higher) = (self.tier(pair[0]), self.tier(pair[1]));
            if higher.interval_secs <= lower.interval_secs {
                errors.push(format!(
                    "{}: interval_secs must be longer than {}", pair[1], pair[0]
                ));
            }
            let lower_models: BTreeSet<ModelKind> = lower.models.iter().copied().collect();
            let higher_models: BTreeSet<ModelKind> = higher.models.iter().copied().collect();
            if !higher_models.is_superset(&lower_models) {
                errors.push(format!(
                    "{}: models must include every model of {}", pair[1], pair[0]
                ));
            }
        }

        // Evaluation validation
        if self.evaluation.sample_interval_secs == 0 {
            errors.push("evaluation.sample_interval_secs must be > 0".to_string());
        }
        if self.evaluation.degraded_samples == 0 {
            errors.push("evaluation.degraded_samples must be >= 1".to_string());
        }
        if self.evaluation.improvement_threshold < 0.0 {
            errors.push("evaluation.improvement_threshold must be >= 0".to_string());
        }

        // Coordinator validation
        if self.coordinator.tick_secs == 0 {
            errors.push("coordinator.tick_secs must be > 0".to_string());
        }
        if self.coordinator.max_concurrent_trainings == Some(0) {
            errors.push("coordinator.max_concurrent_trainings must be >= 1".to_string());
        }
        if self.coordinator.signal_buffer == 0 || self.coordinator.event_buffer == 0 {
            errors.push("coordinator buffers must be > 0".to_string());
        }

        // Storage validation
        if self.storage.keep_versions == 0 {
            errors.push("storage.keep_versions must be >= 1".to_string());
        }
        for tier in Tier::ALL {
            if let Some(size) = self.tier(tier).window_size {
                if self.storage.max_records_per_tier < size {
                    errors.push(format!(
                        "storage.max_records_per_tier ({}) must cover the {} window ({})",
                        self.storage.max_records_per_tier, tier, size
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierTable {
    pub basic: TierSettings,
    pub intermediate: TierSettings,
    pub advanced: TierSettings,
}

impl TierTable {
    pub fn get(&self, tier: Tier) -> &TierSettings {
        match tier {
            Tier::Basic => &self.basic,
            Tier::Intermediate => &self.intermediate,
            Tier::Advanced => &self.advanced,
        }
    }
}

/// How predictions are compared with outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    /// Exact-match rate, for classification tiers
    ExactMatch,
    /// Fraction of predictions within `tolerance` of the actual value
    Tolerance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSettings {
    /// Wall-clock retrain cadence
    pub interval_secs: u64,
    pub models: Vec<ModelKind>,
    /// Minimum acceptable rolling accuracy
    pub accuracy_threshold: f64,
    /// Most recent N resolved predictions considered by the evaluator
    pub window_size: Option<usize>,
    /// Only predictions created within this many seconds are considered
    pub window_secs: Option<u64>,
    pub min_samples: usize,
    pub scoring: ScoringMode,
    pub tolerance: Decimal,
    /// Tolerance is a fraction of |actual| instead of an absolute band
    pub relative_tolerance: bool,
    /// How far back the training window reaches; everything when unset
    pub training_lookback_secs: Option<u64>,
}

impl TierSettings {
    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.interval_secs as i64)
    }

    pub fn window_duration(&self) -> Option<chrono::Duration> {
        self.window_secs.map(|secs| chrono::Duration::seconds(secs as i64))
    }

    pub fn training_lookback(&self) -> Option<chrono::Duration> {
        self.training_lookback_secs.map(|secs| chrono::Duration::seconds(secs as i64))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSettings {
    /// Cadence of the accuracy sampler
    pub sample_interval_secs: u64,
    /// Consecutive low samples required before a degraded trigger
    pub degraded_samples: u32,
    /// Samples kept per tier for trend analysis
    pub history_len: usize,
    /// Minimum change in mean accuracy to call a trend improving or degrading
    pub improvement_threshold: f64,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            sample_interval_secs: 300,
            degraded_samples: 2,
            history_len: 100,
            improvement_threshold: 0.02,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    /// Resolution of the scheduler timers
    pub tick_secs: u64,
    /// Global cap on simultaneous training runs; unlimited when unset
    pub max_concurrent_trainings: Option<usize>,
    pub signal_buffer: usize,
    pub event_buffer: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            max_concurrent_trainings: None,
            signal_buffer: 256,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    pub database_url: String,
    pub models_dir: String,
    /// Model versions kept per tier by cleanup
    pub keep_versions: usize,
    /// Resolved predictions retained per tier in memory
    pub max_records_per_tier: usize,
    /// Journal rows older than this are purged at startup
    pub journal_retention_days: i64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./retrainer.db".to_string(),
            models_dir: "./model_weights".to_string(),
            keep_versions: 5,
            max_records_per_tier: 1000,
            journal_retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainerSettings {
    /// External training program; the built-in baseline trainer is used when unset
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_secs: Option<u64>,
}
