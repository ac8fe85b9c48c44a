use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::runtime::{ScoringMode, TierSettings, TierTable};
use crate::types::ModelKind;

/// Retraining profiles tuned for different market cadences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainProfile {
    /// Hourly / 6-hourly / daily retraining
    Reference,
    /// 15 minute / hourly / 4-hourly retraining with stricter thresholds
    Aggressive,
    /// User-defined settings
    Custom,
}

impl RetrainProfile {
    pub fn name(&self) -> &str {
        match self {
            Self::Reference => "Reference (1h / 6h / 24h)",
            Self::Aggressive => "Aggressive (15m / 1h / 4h)",
            Self::Custom => "Custom",
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Self::Reference =>
                "Basic retrains hourly, Intermediate every 6 hours, Advanced daily.",
            Self::Aggressive =>
                "Fast cadence for volatile markets. Higher accuracy thresholds, more Trainer load.",
            Self::Custom =>
                "User-defined custom settings.",
        }
    }

    /// Tier table for the profile; `Custom` starts from the reference table
    pub fn tiers(&self) -> TierTable {
        match self {
            Self::Reference | Self::Custom => TierTable::reference(),
            Self::Aggressive => TierTable::aggressive(),
        }
    }
}

impl TierTable {
    pub fn reference() -> Self {
        Self {
            basic: TierSettings {
                interval_secs: 3600,
                models: vec![ModelKind::LogisticRegression],
                accuracy_threshold: 0.55,
                window_size: Some(100),
                window_secs: None,
                min_samples: 50,
                scoring: ScoringMode::ExactMatch,
                tolerance: Decimal::ZERO,
                relative_tolerance: false,
                training_lookback_secs: Some(7 * 24 * 3600),
            },
            intermediate: TierSettings {
                interval_secs: 6 * 3600,
                models: vec![ModelKind::LogisticRegression, ModelKind::XGBoost],
                accuracy_threshold: 0.55,
                window_size: Some(200),
                window_secs: None,
                min_samples: 50,
                scoring: ScoringMode::ExactMatch,
                tolerance: Decimal::ZERO,
                relative_tolerance: false,
                training_lookback_secs: Some(30 * 24 * 3600),
            },
            advanced: TierSettings {
                interval_secs: 24 * 3600,
                models: vec![ModelKind::LogisticRegression, ModelKind::XGBoost, ModelKind::LSTM],
                accuracy_threshold: 0.60,
                window_size: Some(500),
                window_secs: None,
                min_samples: 100,
                scoring: ScoringMode::Tolerance,
                tolerance: Decimal::new(2, 2), // within 2% of actual
                relative_tolerance: true,
                training_lookback_secs: None,
            },
        }
    }

    pub fn aggressive() -> Self {
        let mut table = Self::reference();
        table.basic.interval_secs = 15 * 60;
        table.basic.accuracy_threshold = 0.60;
        table.basic.window_size = Some(60);
        table.basic.min_samples = 30;
        table.intermediate.interval_secs = 3600;
        table.intermediate.accuracy_threshold = 0.60;
        table.advanced.interval_secs = 4 * 3600;
        table.advanced.accuracy_threshold = 0.65;
        table
    }
}
