use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Tier;

/// Value produced by a model or observed as ground truth
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionValue {
    /// Classification output, e.g. BUY / SELL / HOLD
    Label(String),
    /// Continuous output, e.g. a price target
    Numeric(Decimal),
}

impl PredictionValue {
    pub fn label(value: impl Into<String>) -> Self {
        PredictionValue::Label(value.into())
    }

    pub fn numeric(value: Decimal) -> Self {
        PredictionValue::Numeric(value)
    }

    pub fn as_numeric(&self) -> Option<Decimal> {
        match self {
            PredictionValue::Numeric(v) => Some(*v),
            PredictionValue::Label(_) => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl fmt::Display for PredictionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PredictionValue::Label(label) => write!(f, "{}", label),
            PredictionValue::Numeric(value) => write!(f, "{}", value),
        }
    }
}

/// A single prediction and, once known, its outcome.
///
/// Created unresolved at prediction time. Resolved exactly once by the
/// [`PredictionLog`](crate::ml::PredictionLog) and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: String,
    pub tier: Tier,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub predicted_value: PredictionValue,
    pub actual_value: Option<PredictionValue>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl PredictionRecord {
    pub fn new(
        tier: Tier,
        model_id: impl Into<String>,
        predicted_value: PredictionValue,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tier,
            model_id: model_id.into(),
            created_at,
            predicted_value,
            actual_value: None,
            resolved_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.actual_value.is_some()
    }
}

/// Ground truth for a previously logged prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub id: String,
    pub actual_value: PredictionValue,
    pub resolved_at: DateTime<Utc>,
}
