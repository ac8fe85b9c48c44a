use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::PredictionLog;
use crate::config::{ScoringMode, TierSettings, TierTable};
use crate::engine::Clock;
use crate::types::{PredictionRecord, PredictionValue, Tier};

/// Rolling accuracy of a tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Evaluation {
    Score { accuracy: f64, samples: usize },
    /// Too few resolved predictions to judge; never reported as 0 or 1
    InsufficientData { available: usize, required: usize },
}

impl Evaluation {
    pub fn accuracy(&self) -> Option<f64> {
        match self {
            Evaluation::Score { accuracy, .. } => Some(*accuracy),
            Evaluation::InsufficientData { .. } => None,
        }
    }

    pub fn is_below(&self, threshold: f64) -> bool {
        self.accuracy().map_or(false, |a| a < threshold)
    }

    pub fn is_insufficient(&self) -> bool {
        matches!(self, Evaluation::InsufficientData { .. })
    }

    pub fn insufficient(required: usize) -> Self {
        Evaluation::InsufficientData { available: 0, required }
    }
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Evaluation::Score { accuracy, samples } => {
                write!(f, "{:.1}% over {} predictions", accuracy * 100.0, samples)
            }
            Evaluation::InsufficientData { available, required } => {
                write!(f, "insufficient data ({}/{})", available, required)
            }
        }
    }
}

/// Computes rolling accuracy straight from the prediction log.
/// Holds no state between calls.
pub struct AccuracyEvaluator {
    log: Arc<PredictionLog>,
    tiers: TierTable,
    clock: Arc<dyn Clock>,
}

impl AccuracyEvaluator {
    pub fn new(log: Arc<PredictionLog>, tiers: TierTable, clock: Arc<dyn Clock>) -> Self {
        Self { log, tiers, clock }
    }

    pub fn evaluate(&self, tier: Tier) -> Evaluation {
        self.evaluate_since(tier, None)
    }

    /// Accuracy over predictions created strictly after `since`
    pub fn evaluate_since(&self, tier: Tier, since: Option<DateTime<Utc>>) -> Evaluation {
        let settings = self.tiers.get(tier);
        let window_start = settings.window_duration().map(|d| self.clock.now() - d);
        let created_after = match (since, window_start) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        let records = self.log.recent_resolved(tier, created_after, settings.window_size);
        score_records(settings, &records)
    }

    pub fn settings(&self, tier: Tier) -> &TierSettings {
        self.tiers.get(tier)
    }
}

/// Scores already-selected resolved records under a tier's policy
pub fn score_records(settings: &TierSettings, records: &[PredictionRecord]) -> Evaluation {
    if records.len() < settings.min_samples {
        return Evaluation::InsufficientData {
            available: records.len(),
            required: settings.min_samples,
        };
    }

    let hits = records
        .iter()
        .filter(|r| match &r.actual_value {
            Some(actual) => is_hit(settings, &r.predicted_value, actual),
            None => false,
        })
        .count();

    Evaluation::Score {
        accuracy: hits as f64 / records.len() as f64,
        samples: records.len(),
    }
}

/// Whether a prediction counts as correct. Mismatched value kinds are misses.
pub fn is_hit(settings: &TierSettings, predicted: &PredictionValue, actual: &PredictionValue) -> bool {
    match settings.scoring {
        ScoringMode::ExactMatch => predicted == actual,
        ScoringMode::Tolerance => match (predicted.as_numeric(), actual.as_numeric()) {
            (Some(p), Some(a)) => {
                let band = if settings.relative_tolerance {
                    settings.tolerance * a.abs()
                } else {
                    settings.tolerance
                };
                (p - a).abs() <= band
            }
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ManualClock;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn basic_tiers(window: usize, min_samples: usize) -> TierTable {
        let mut tiers = TierTable::reference();
        tiers.basic.window_size = Some(window);
        tiers.basic.min_samples = min_samples;
        tiers
    }

    fn log_labels(log: &PredictionLog, tier: Tier, start: DateTime<Utc>, outcomes: &[bool]) {
        for (i, correct) in outcomes.iter().enumerate() {
            let id = format!("{}-{}", tier, i);
            let record = PredictionRecord::new(
                tier,
                "m1",
                PredictionValue::label("BUY"),
                start + Duration::seconds(i as i64),
            )
            .with_id(&id);
            log.append(record).unwrap();
            let actual = if *correct { "BUY" } else { "SELL" };
            log.resolve(&id, PredictionValue::label(actual), start).unwrap();
        }
    }

    #[test]
    fn test_empty_log_is_insufficient_not_zero() {
        let clock = Arc::new(ManualClock::default());
        let evaluator = AccuracyEvaluator::new(Arc::new(PredictionLog::new()), basic_tiers(100, 50), clock);

        let evaluation = evaluator.evaluate(Tier::Basic);
        assert_eq!(evaluation, Evaluation::InsufficientData { available: 0, required: 50 });
        assert_eq!(evaluation.accuracy(), None);
        assert!(!evaluation.is_below(0.55));
    }

    #[test]
    fn test_unresolved_predictions_are_ignored() {
        let clock = Arc::new(ManualClock::default());
        let log = Arc::new(PredictionLog::new());
        for i in 0..80 {
            let record = PredictionRecord::new(Tier::Basic, "m1", PredictionValue::label("BUY"), clock.now())
                .with_id(format!("p{}", i));
            log.append(record).unwrap();
        }

        let evaluator = AccuracyEvaluator::new(log, basic_tiers(100, 50), clock);
        assert!(evaluator.evaluate(Tier::Basic).is_insufficient());
    }

    #[test]
    fn test_exact_match_rate() {
        let clock = Arc::new(ManualClock::default());
        let log = Arc::new(PredictionLog::new());
        let outcomes: Vec<bool> = (0..100).map(|i| i % 5 < 2).collect(); // 40% correct
        log_labels(&log, Tier::Basic, clock.now(), &outcomes);

        let evaluator = AccuracyEvaluator::new(log, basic_tiers(100, 50), clock);
        let evaluation = evaluator.evaluate(Tier::Basic);
        assert_eq!(evaluation, Evaluation::Score { accuracy: 0.4, samples: 100 });
        assert!(evaluation.is_below(0.55));
    }

    #[test]
    fn test_window_uses_most_recent_records() {
        let clock = Arc::new(ManualClock::default());
        let log = Arc::new(PredictionLog::new());
        // 50 misses followed by 50 hits
        let outcomes: Vec<bool> = (0..100).map(|i| i >= 50).collect();
        log_labels(&log, Tier::Basic, clock.now(), &outcomes);

        let evaluator = AccuracyEvaluator::new(log, basic_tiers(50, 10), clock);
        assert_eq!(evaluator.evaluate(Tier::Basic).accuracy(), Some(1.0));
    }

    #[test]
    fn test_evaluate_since_only_counts_fresh_predictions() {
        let clock = Arc::new(ManualClock::default());
        let log = Arc::new(PredictionLog::new());
        let start = clock.now();
        log_labels(&log, Tier::Basic, start, &vec![true; 60]);

        let evaluator = AccuracyEvaluator::new(log, basic_tiers(100, 50), clock);
        let cutoff = start + Duration::seconds(30);
        assert_eq!(
            evaluator.evaluate_since(Tier::Basic, Some(cutoff)),
            Evaluation::InsufficientData { available: 29, required: 50 }
        );
    }

    #[test]
    fn test_duration_window() {
        let clock = Arc::new(ManualClock::default());
        let log = Arc::new(PredictionLog::new());
        log_labels(&log, Tier::Basic, clock.now() - Duration::hours(2), &vec![false; 20]);
        log_labels(&log, Tier::Intermediate, clock.now(), &vec![true; 20]);

        let mut tiers = basic_tiers(100, 10);
        tiers.basic.window_size = None;
        tiers.basic.window_secs = Some(3600);
        let evaluator = AccuracyEvaluator::new(log, tiers, clock);
        assert!(evaluator.evaluate(Tier::Basic).is_insufficient());
    }

    #[test]
    fn test_tolerance_band() {
        let mut settings = TierTable::reference().advanced;
        settings.scoring = ScoringMode::Tolerance;
        settings.tolerance = dec!(0.02);
        settings.relative_tolerance = true;

        let actual = PredictionValue::numeric(dec!(100));
        assert!(is_hit(&settings, &PredictionValue::numeric(dec!(101.5)), &actual));
        assert!(is_hit(&settings, &PredictionValue::numeric(dec!(98)), &actual));
        assert!(!is_hit(&settings, &PredictionValue::numeric(dec!(103)), &actual));
        assert!(!is_hit(&settings, &PredictionValue::label("BUY"), &actual));

        settings.relative_tolerance = false;
        settings.tolerance = dec!(5);
        assert!(is_hit(&settings, &PredictionValue::numeric(dec!(104)), &actual));
    }
}
