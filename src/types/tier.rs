use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Retraining profile. Ordered: every tier supersedes the tiers below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Basic,
    Intermediate,
    Advanced,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Basic, Tier::Intermediate, Tier::Advanced];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Basic => "basic",
            Tier::Intermediate => "intermediate",
            Tier::Advanced => "advanced",
        }
    }

    /// Tiers ordered highest first, the order in which simultaneous work is started.
    pub fn descending() -> impl Iterator<Item = Tier> {
        Self::ALL.into_iter().rev()
    }

    pub fn supersedes(&self, other: Tier) -> bool {
        *self > other
    }

    /// Lower tiers whose model scope this tier covers
    pub fn superseded(&self) -> Vec<Tier> {
        Self::ALL.into_iter().filter(|t| self.supersedes(*t)).collect()
    }

    /// Higher tiers that cover this tier
    pub fn superseding(&self) -> Vec<Tier> {
        Self::ALL.into_iter().filter(|t| t.supersedes(*self)).collect()
    }

    pub fn index(&self) -> usize {
        match self {
            Tier::Basic => 0,
            Tier::Intermediate => 1,
            Tier::Advanced => 2,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Tier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "basic" | "tier1" => Ok(Tier::Basic),
            "intermediate" | "tier2" => Ok(Tier::Intermediate),
            "advanced" | "tier3" => Ok(Tier::Advanced),
            _ => Err(anyhow::anyhow!("Unknown tier: {}", s)),
        }
    }
}

/// Model family trained by a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    LogisticRegression,
    #[serde(rename = "xgboost")]
    XGBoost,
    #[serde(rename = "lstm")]
    LSTM,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::LogisticRegression => "logistic_regression",
            ModelKind::XGBoost => "xgboost",
            ModelKind::LSTM => "lstm",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "logistic_regression" => Ok(ModelKind::LogisticRegression),
            "xgboost" => Ok(ModelKind::XGBoost),
            "lstm" => Ok(ModelKind::LSTM),
            _ => Err(anyhow::anyhow!("Unknown model kind: {}", s)),
        }
    }
}

/// What caused a retrain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrainTrigger {
    Scheduled,
    Degraded,
    Manual,
}

impl fmt::Display for RetrainTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrainTrigger::Scheduled => write!(f, "Scheduled"),
            RetrainTrigger::Degraded => write!(f, "Degraded"),
            RetrainTrigger::Manual => write!(f, "Manual"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supersession_follows_order() {
        assert!(Tier::Advanced.supersedes(Tier::Basic));
        assert!(Tier::Advanced.supersedes(Tier::Intermediate));
        assert!(!Tier::Basic.supersedes(Tier::Basic));
        assert!(!Tier::Intermediate.supersedes(Tier::Advanced));

        assert_eq!(Tier::Advanced.superseded(), vec![Tier::Basic, Tier::Intermediate]);
        assert_eq!(Tier::Basic.superseding(), vec![Tier::Intermediate, Tier::Advanced]);
        assert!(Tier::Basic.superseded().is_empty());
    }

    #[test]
    fn test_descending_order() {
        let order: Vec<Tier> = Tier::descending().collect();
        assert_eq!(order, vec![Tier::Advanced, Tier::Intermediate, Tier::Basic]);
    }

    #[test]
    fn test_tier_from_str() {
        assert_eq!(Tier::from_str("Basic").unwrap(), Tier::Basic);
        assert_eq!(Tier::from_str("tier3").unwrap(), Tier::Advanced);
        assert!(Tier::from_str("expert").is_err());
    }

    #[test]
    fn test_model_kind_from_str() {
        assert_eq!(ModelKind::from_str("xgboost").unwrap(), ModelKind::XGBoost);
        assert_eq!(ModelKind::from_str("lstm").unwrap(), ModelKind::LSTM);
        assert!(ModelKind::from_str("unknown").is_err());
    }
}
