use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::clock::Clock;
use super::coordinator::{CoordinatorStatus, Signal, TierPhase};
use crate::ml::{AccuracyEvaluator, PredictionLog};
use crate::types::Tier;

/// Samples every tier's accuracy on a fixed cadence and forwards the results
/// to the coordinator. Also trims the prediction log to its retention cap.
pub struct AccuracySampler {
    evaluator: Arc<AccuracyEvaluator>,
    log: Arc<PredictionLog>,
    status: watch::Receiver<CoordinatorStatus>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    max_records_per_tier: usize,
}

impl AccuracySampler {
    pub fn new(
        evaluator: Arc<AccuracyEvaluator>,
        log: Arc<PredictionLog>,
        status: watch::Receiver<CoordinatorStatus>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        max_records_per_tier: usize,
    ) -> Self {
        Self {
            evaluator,
            log,
            status,
            clock,
            interval,
            max_records_per_tier,
        }
    }

    /// One sample per tier not currently training. Only predictions made after
    /// the tier was last trained count.
    pub fn sample(&self) -> Vec<Signal> {
        let status = self.status.borrow().clone();
        Tier::ALL
            .iter()
            .filter_map(|tier| status.tier(*tier))
            .filter(|state| state.phase != TierPhase::Training)
            .map(|state| Signal::Sampled {
                tier: state.tier,
                evaluation: self.evaluator.evaluate_since(state.tier, state.last_trained_at),
                generation: state.generation,
            })
            .collect()
    }

    pub async fn run(self, signals: mpsc::Sender<Signal>) {
        info!("Accuracy sampler started (every {}s)", self.interval.as_secs());
        loop {
            self.clock.sleep(self.interval).await;

            for tier in Tier::ALL {
                self.log.prune(tier, self.max_records_per_tier);
            }

            for signal in self.sample() {
                if let Signal::Sampled { tier, evaluation, .. } = &signal {
                    debug!("{} accuracy: {}", tier, evaluation);
                }
                if signals.send(signal).await.is_err() {
                    info!("Accuracy sampler stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierTable;
    use crate::engine::{ManualClock, TierState};
    use crate::ml::{Evaluation, PerformanceHistory};
    use crate::types::{PredictionRecord, PredictionValue};
    use chrono::{DateTime, Utc};

    fn status(last_trained_basic: Option<DateTime<Utc>>, basic_phase: TierPhase) -> CoordinatorStatus {
        let history = PerformanceHistory::new(10, 0.02);
        let tiers = Tier::ALL
            .iter()
            .map(|tier| {
                let mut state = TierState::new(*tier, 1);
                if *tier == Tier::Basic {
                    state.last_trained_at = last_trained_basic;
                    state.phase = basic_phase;
                    state.generation = 3;
                }
                state
            })
            .collect();
        CoordinatorStatus {
            paused: false,
            trainings_in_progress: 0,
            prediction_log_size: 0,
            tiers,
            trends: Tier::ALL.iter().map(|t| (*t, history.trend(*t))).collect(),
            updated_at: Utc::now(),
        }
    }

    fn sampler(log: Arc<PredictionLog>, status: CoordinatorStatus, clock: Arc<ManualClock>) -> AccuracySampler {
        let mut tiers = TierTable::reference();
        tiers.basic.min_samples = 2;
        tiers.basic.window_size = Some(10);
        let evaluator = Arc::new(AccuracyEvaluator::new(log.clone(), tiers, clock.clone()));
        let (_tx, rx) = watch::channel(status);
        AccuracySampler::new(evaluator, log, rx, clock, Duration::from_secs(60), 1000)
    }

    #[test]
    fn test_samples_carry_generation() {
        let clock = Arc::new(ManualClock::default());
        let sampler = sampler(Arc::new(PredictionLog::new()), status(None, TierPhase::Idle), clock);

        let signals = sampler.sample();
        assert_eq!(signals.len(), 3);
        assert!(matches!(signals[0], Signal::Sampled { tier: Tier::Basic, generation: 3, .. }));
    }

    #[test]
    fn test_training_tiers_are_not_sampled() {
        let clock = Arc::new(ManualClock::default());
        let sampler = sampler(Arc::new(PredictionLog::new()), status(None, TierPhase::Training), clock);
        let signals = sampler.sample();
        assert_eq!(signals.len(), 2);
        assert!(!signals.iter().any(|s| matches!(s, Signal::Sampled { tier: Tier::Basic, .. })));
    }

    #[test]
    fn test_only_predictions_after_last_training_count() {
        let clock = Arc::new(ManualClock::default());
        let log = Arc::new(PredictionLog::new());
        let trained_at = clock.now();
        for (i, offset) in [-10i64, -5, 5, 10].iter().enumerate() {
            let id = format!("p{}", i);
            let created = trained_at + chrono::Duration::seconds(*offset);
            log.append(PredictionRecord::new(Tier::Basic, "m", PredictionValue::label("BUY"), created).with_id(&id))
                .unwrap();
            log.resolve(&id, PredictionValue::label("SELL"), created).unwrap();
        }

        let sampler = sampler(log, status(Some(trained_at), TierPhase::Idle), clock);
        match &sampler.sample()[0] {
            Signal::Sampled { evaluation, .. } => {
                assert_eq!(*evaluation, Evaluation::Score { accuracy: 0.0, samples: 2 })
            }
            other => panic!("unexpected signal {:?}", other),
        }
    }
}
