use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::types::Tier;

const MIN_TREND_SAMPLES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Degrading,
    Stable,
    InsufficientData,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Trend::Improving => "improving",
            Trend::Degrading => "degrading",
            Trend::Stable => "stable",
            Trend::InsufficientData => "insufficient_data",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    pub trend: Trend,
    /// Recent mean minus older mean; 0 without enough samples
    pub improvement: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccuracySample {
    pub at: DateTime<Utc>,
    pub accuracy: f64,
}

/// Bounded history of sampled accuracies per tier
#[derive(Debug, Clone)]
pub struct PerformanceHistory {
    samples: HashMap<Tier, VecDeque<AccuracySample>>,
    capacity: usize,
    improvement_threshold: f64,
}

impl PerformanceHistory {
    pub fn new(capacity: usize, improvement_threshold: f64) -> Self {
        Self {
            samples: HashMap::new(),
            capacity: capacity.max(1),
            improvement_threshold,
        }
    }

    pub fn record(&mut self, tier: Tier, at: DateTime<Utc>, accuracy: f64) {
        let samples = self.samples.entry(tier).or_default();
        samples.push_back(AccuracySample { at, accuracy });
        while samples.len() > self.capacity {
            samples.pop_front();
        }
    }

    pub fn samples(&self, tier: Tier) -> Vec<AccuracySample> {
        self.samples.get(&tier).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    pub fn latest(&self, tier: Tier) -> Option<AccuracySample> {
        self.samples.get(&tier).and_then(|s| s.back().copied())
    }

    /// Compares the mean of the newer half of the history against the older half
    pub fn trend(&self, tier: Tier) -> TrendReport {
        let samples: Vec<f64> = self
            .samples
            .get(&tier)
            .map(|s| s.iter().map(|s| s.accuracy).collect())
            .unwrap_or_default();

        if samples.len() < MIN_TREND_SAMPLES {
            return TrendReport {
                trend: Trend::InsufficientData,
                improvement: 0.0,
                samples: samples.len(),
            };
        }

        let mid = samples.len() / 2;
        let older = mean(&samples[..mid]);
        let recent = mean(&samples[samples.len() - mid..]);
        let improvement = recent - older;

        let trend = if improvement > self.improvement_threshold {
            Trend::Improving
        } else if improvement < -self.improvement_threshold {
            Trend::Degrading
        } else {
            Trend::Stable
        };

        TrendReport {
            trend,
            improvement,
            samples: samples.len(),
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
