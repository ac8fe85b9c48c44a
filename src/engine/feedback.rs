use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::clock::Clock;
use super::coordinator::{CoordinatorHandle, RetrainCoordinator};
use super::sampler::AccuracySampler;
use super::scheduler::TierScheduler;
use crate::config::RuntimeConfig;
use crate::database::Database;
use crate::ml::{AccuracyEvaluator, ModelRegistry, PredictionLog, Trainer};
use crate::notifications::{EventBus, NotificationManager};
use crate::types::Tier;

/// A running feedback loop: scheduler, sampler and coordinator tasks wired
/// to one prediction log and registry
pub struct FeedbackLoop {
    handle: CoordinatorHandle,
    log: Arc<PredictionLog>,
    registry: Arc<ModelRegistry>,
    notifications: Arc<NotificationManager>,
    coordinator: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl FeedbackLoop {
    pub async fn start(
        config: Arc<RuntimeConfig>,
        log: Arc<PredictionLog>,
        registry: Arc<ModelRegistry>,
        trainer: Arc<dyn Trainer>,
        clock: Arc<dyn Clock>,
        database: Option<Arc<Database>>,
    ) -> Self {
        Self::launch(config, log, registry, trainer, clock, database, true).await
    }

    /// Coordinator only: no timers and no sampling, so nothing trains unless
    /// triggered through the handle
    pub async fn start_manual(
        config: Arc<RuntimeConfig>,
        log: Arc<PredictionLog>,
        registry: Arc<ModelRegistry>,
        trainer: Arc<dyn Trainer>,
        clock: Arc<dyn Clock>,
        database: Option<Arc<Database>>,
    ) -> Self {
        Self::launch(config, log, registry, trainer, clock, database, false).await
    }

    async fn launch(
        config: Arc<RuntimeConfig>,
        log: Arc<PredictionLog>,
        registry: Arc<ModelRegistry>,
        trainer: Arc<dyn Trainer>,
        clock: Arc<dyn Clock>,
        database: Option<Arc<Database>>,
        automatic: bool,
    ) -> Self {
        let events = EventBus::new(config.coordinator.event_buffer);
        let notifications = Arc::new(NotificationManager::new(database));
        let notifier = Arc::clone(&notifications).spawn(events.subscribe());

        let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();
        let (coordinator, handle) = RetrainCoordinator::new(
            Arc::clone(&config),
            Arc::clone(&log),
            Arc::clone(&registry),
            trainer,
            Arc::clone(&clock),
            events,
            scheduler_tx,
        )
        .await;

        let mut background = vec![notifier];
        if automatic {
            let initial = handle.status();
            let scheduler = TierScheduler::new(
                &config.tiers,
                |tier: Tier| initial.tier(tier).and_then(|s| s.last_trained_at),
                Arc::clone(&clock),
                Duration::from_secs(config.coordinator.tick_secs),
            );

            let evaluator =
                Arc::new(AccuracyEvaluator::new(Arc::clone(&log), config.tiers.clone(), Arc::clone(&clock)));
            let sampler = AccuracySampler::new(
                evaluator,
                Arc::clone(&log),
                handle.watch_status(),
                Arc::clone(&clock),
                Duration::from_secs(config.evaluation.sample_interval_secs),
                config.storage.max_records_per_tier,
            );

            background.push(tokio::spawn(scheduler.run(handle.signals(), scheduler_rx)));
            background.push(tokio::spawn(sampler.run(handle.signals())));
        } else {
            // Acks go nowhere without a scheduler
            drop(scheduler_rx);
        }
        let coordinator = tokio::spawn(coordinator.run());

        info!(
            "Feedback loop running ({}): {} predictions in log, profile {}",
            if automatic { "scheduled" } else { "manual only" },
            log.len(),
            config.profile.name()
        );

        Self {
            handle,
            log,
            registry,
            notifications,
            coordinator,
            background,
        }
    }

    pub fn handle(&self) -> &CoordinatorHandle {
        &self.handle
    }

    pub fn log(&self) -> &Arc<PredictionLog> {
        &self.log
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn notifications(&self) -> &Arc<NotificationManager> {
        &self.notifications
    }

    /// Stop the coordinator, cancelling in-flight training, then the timers
    pub async fn shutdown(self) -> Result<()> {
        if self.handle.shutdown().await.is_err() {
            warn!("Coordinator already stopped");
        }
        self.coordinator.await?;
        for task in &self.background {
            task.abort();
        }
        // Aborted tasks resolve with a cancellation error
        futures::future::join_all(self.background).await;
        info!("Feedback loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ManualClock;
    use crate::ml::{BaselineTrainer, InMemoryModelStore};
    use crate::notifications::LifecycleEvent;
    use crate::types::{PredictionRecord, PredictionValue};

    #[tokio::test]
    async fn test_manual_loop_trains_only_the_requested_tier() {
        let clock = Arc::new(ManualClock::default());
        let log = Arc::new(PredictionLog::new());
        for i in 0..40 {
            let id = format!("p{}", i);
            let created = clock.now() - chrono::Duration::seconds(40 - i);
            log.append(PredictionRecord::new(Tier::Basic, "m", PredictionValue::label("BUY"), created).with_id(&id))
                .unwrap();
            log.resolve(&id, PredictionValue::label("BUY"), created).unwrap();
        }
        let registry = Arc::new(ModelRegistry::new(Arc::new(InMemoryModelStore::new())));

        for _ in 0..10 {
            let feedback = FeedbackLoop::start_manual(
                Arc::new(RuntimeConfig::default()),
                log.clone(),
                registry.clone(),
                Arc::new(BaselineTrainer::default()),
                clock.clone(),
                None,
            )
            .await;
            let mut events = feedback.handle().subscribe();
            feedback.handle().trigger(Tier::Advanced).await.unwrap();

            let outcome = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    match events.recv().await.unwrap().event {
                        LifecycleEvent::TrainingStarted { tier, .. } => assert_eq!(tier, Tier::Advanced),
                        LifecycleEvent::TriggerDropped { tier, reason, .. } => panic!("{} dropped: {}", tier, reason),
                        event @ (LifecycleEvent::TrainingSucceeded { .. } | LifecycleEvent::TrainingFailed { .. }) => {
                            return event
                        }
                        _ => {}
                    }
                }
            })
            .await
            .unwrap();

            assert!(matches!(outcome, LifecycleEvent::TrainingSucceeded { tier: Tier::Advanced, .. }));
            feedback.shutdown().await.unwrap();
        }
        assert_eq!(registry.active_version(Tier::Advanced).await, Some(10));
        assert!(registry.active_version(Tier::Basic).await.is_none());
    }

    #[tokio::test]
    async fn test_first_tick_runs_every_tier_then_shuts_down() {
        let registry = Arc::new(ModelRegistry::new(Arc::new(InMemoryModelStore::new())));
        let feedback = FeedbackLoop::start(
            Arc::new(RuntimeConfig::default()),
            Arc::new(PredictionLog::new()),
            registry,
            Arc::new(BaselineTrainer::default()),
            Arc::new(ManualClock::default()),
            None,
        )
        .await;

        // Never-trained tiers are due immediately; an empty log makes every run fail
        let mut status = feedback.handle().watch_status();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !status.borrow_and_update().tiers.iter().all(|s| s.last_failure.is_some()) {
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        assert_eq!(feedback.handle().status().trainings_in_progress, 0);
        feedback.shutdown().await.unwrap();
    }
}
