use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::scheduler::SchedulerCommand;
use crate::config::RuntimeConfig;
use crate::ml::{
    CancelToken, Evaluation, ModelRegistry, PerformanceHistory, PredictionLog, TrainedModel, Trainer, TrainingError,
    TrainingWindow, TrendReport,
};
use crate::notifications::{DeferReason, DropReason, EventBus, LifecycleEvent, Notification};
use crate::types::{RetrainTrigger, Tier};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("Retrain coordinator has stopped")]
    Stopped,
}

/// Everything the coordinator reacts to, processed one at a time
#[derive(Debug)]
pub enum Signal {
    Due { tier: Tier },
    Sampled { tier: Tier, evaluation: Evaluation, generation: u64 },
    Manual { tier: Tier },
    Abort { tier: Tier },
    Pause,
    Resume,
    Finished { tier: Tier, result: Result<TrainedModel, TrainingError> },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierPhase {
    Idle,
    /// A trigger is waiting for a superseding run or a free slot
    Pending,
    Training,
    /// Passed through on success; samples of the previous generation are stale
    Cooldown,
}

impl fmt::Display for TierPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TierPhase::Idle => "idle",
            TierPhase::Pending => "pending",
            TierPhase::Training => "training",
            TierPhase::Cooldown => "cooldown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub error: String,
}

/// Coordinator-owned state of one tier
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierState {
    pub tier: Tier,
    pub phase: TierPhase,
    pub last_trained_at: Option<DateTime<Utc>>,
    pub last_retrain_trigger: Option<RetrainTrigger>,
    pub current_accuracy: Evaluation,
    pub active_model_version: Option<u64>,
    pub consecutive_low_samples: u32,
    pub generation: u64,
    pub pending: Option<RetrainTrigger>,
    pub training_started_at: Option<DateTime<Utc>>,
    pub last_failure: Option<FailureRecord>,
    pub aborting: bool,
}

impl TierState {
    pub fn new(tier: Tier, min_samples: usize) -> Self {
        Self {
            tier,
            phase: TierPhase::Idle,
            last_trained_at: None,
            last_retrain_trigger: None,
            current_accuracy: Evaluation::insufficient(min_samples),
            active_model_version: None,
            consecutive_low_samples: 0,
            generation: 0,
            pending: None,
            training_started_at: None,
            last_failure: None,
            aborting: false,
        }
    }

    pub fn is_training(&self) -> bool {
        self.phase == TierPhase::Training
    }
}

/// Point-in-time view of the feedback loop
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub paused: bool,
    pub trainings_in_progress: usize,
    pub prediction_log_size: usize,
    pub tiers: Vec<TierState>,
    pub trends: BTreeMap<Tier, TrendReport>,
    pub updated_at: DateTime<Utc>,
}

impl CoordinatorStatus {
    pub fn tier(&self, tier: Tier) -> Option<&TierState> {
        self.tiers.iter().find(|s| s.tier == tier)
    }
}

/// Cloneable front door to a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    signals: mpsc::Sender<Signal>,
    status: watch::Receiver<CoordinatorStatus>,
    events: EventBus,
}

impl CoordinatorHandle {
    async fn send(&self, signal: Signal) -> Result<(), CoordinatorError> {
        self.signals.send(signal).await.map_err(|_| CoordinatorError::Stopped)
    }

    /// Retrain now, bypassing schedule and debounce
    pub async fn trigger(&self, tier: Tier) -> Result<(), CoordinatorError> {
        self.send(Signal::Manual { tier }).await
    }

    pub async fn abort(&self, tier: Tier) -> Result<(), CoordinatorError> {
        self.send(Signal::Abort { tier }).await
    }

    pub async fn pause(&self) -> Result<(), CoordinatorError> {
        self.send(Signal::Pause).await
    }

    pub async fn resume(&self) -> Result<(), CoordinatorError> {
        self.send(Signal::Resume).await
    }

    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        self.send(Signal::Shutdown).await
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<CoordinatorStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    pub fn signals(&self) -> mpsc::Sender<Signal> {
        self.signals.clone()
    }
}

struct RunHandle {
    cancel: CancelToken,
    window: TrainingWindow,
    started_at: DateTime<Utc>,
}

/// The control loop. Single writer of every [`TierState`] and the only
/// mutator of the [`ModelRegistry`] while running.
pub struct RetrainCoordinator {
    config: Arc<RuntimeConfig>,
    log: Arc<PredictionLog>,
    registry: Arc<ModelRegistry>,
    trainer: Arc<dyn Trainer>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    scheduler: mpsc::UnboundedSender<SchedulerCommand>,
    states: HashMap<Tier, TierState>,
    runs: HashMap<Tier, RunHandle>,
    history: PerformanceHistory,
    paused: bool,
    signals_tx: mpsc::Sender<Signal>,
    signals_rx: mpsc::Receiver<Signal>,
    status_tx: watch::Sender<CoordinatorStatus>,
}

impl RetrainCoordinator {
    /// Build the coordinator with tier state seeded from the registry's active models
    pub async fn new(
        config: Arc<RuntimeConfig>,
        log: Arc<PredictionLog>,
        registry: Arc<ModelRegistry>,
        trainer: Arc<dyn Trainer>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        scheduler: mpsc::UnboundedSender<SchedulerCommand>,
    ) -> (Self, CoordinatorHandle) {
        let mut active = HashMap::new();
        for tier in Tier::ALL {
            if let Some(metadata) = registry.active(tier).await {
                active.insert(tier, metadata);
            }
        }

        let mut states = HashMap::new();
        for tier in Tier::ALL {
            let mut state = TierState::new(tier, config.tier(tier).min_samples);
            state.active_model_version = active.get(&tier).map(|m| m.version);
            // A higher tier's run satisfied this one too
            state.last_trained_at = std::iter::once(tier)
                .chain(tier.superseding())
                .filter_map(|t| active.get(&t).map(|m| m.trained_at))
                .max();
            states.insert(tier, state);
        }

        let (signals_tx, signals_rx) = mpsc::channel(config.coordinator.signal_buffer.max(1));
        let history = PerformanceHistory::new(config.evaluation.history_len, config.evaluation.improvement_threshold);

        let initial = CoordinatorStatus {
            paused: false,
            trainings_in_progress: 0,
            prediction_log_size: log.len(),
            tiers: Tier::ALL.iter().filter_map(|t| states.get(t).cloned()).collect(),
            trends: Tier::ALL.iter().map(|t| (*t, history.trend(*t))).collect(),
            updated_at: clock.now(),
        };
        let (status_tx, status_rx) = watch::channel(initial);

        let handle = CoordinatorHandle {
            signals: signals_tx.clone(),
            status: status_rx,
            events: events.clone(),
        };

        let coordinator = Self {
            config,
            log,
            registry,
            trainer,
            clock,
            events,
            scheduler,
            states,
            runs: HashMap::new(),
            history,
            paused: false,
            signals_tx,
            signals_rx,
            status_tx,
        };
        (coordinator, handle)
    }

    pub fn state(&self, tier: Tier) -> Option<&TierState> {
        self.states.get(&tier)
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn history(&self) -> &PerformanceHistory {
        &self.history
    }

    /// Process signals until shutdown
    pub async fn run(mut self) {
        info!("Retrain coordinator started");
        while self.process_next().await {}
        info!("Retrain coordinator stopped");
    }

    /// Receive and handle one signal. False once shut down.
    pub async fn process_next(&mut self) -> bool {
        match self.signals_rx.recv().await {
            Some(signal) => self.handle(signal).await,
            None => false,
        }
    }

    /// Apply one signal to tier state. False on shutdown.
    pub async fn handle(&mut self, signal: Signal) -> bool {
        match signal {
            Signal::Due { tier } => {
                self.publish(LifecycleEvent::TierDue { tier });
                self.trigger(tier, RetrainTrigger::Scheduled);
            }
            Signal::Sampled { tier, evaluation, generation } => self.on_sample(tier, evaluation, generation),
            Signal::Manual { tier } => self.trigger(tier, RetrainTrigger::Manual),
            Signal::Abort { tier } => self.abort(tier),
            Signal::Pause => {
                if !self.paused {
                    self.paused = true;
                    self.publish(LifecycleEvent::LoopPaused);
                }
            }
            Signal::Resume => {
                if self.paused {
                    self.paused = false;
                    self.publish(LifecycleEvent::LoopResumed);
                }
            }
            Signal::Finished { tier, result } => self.on_finished(tier, result).await,
            Signal::Shutdown => {
                for (tier, run) in &self.runs {
                    info!("Cancelling {} training for shutdown", tier);
                    run.cancel.cancel();
                }
                self.publish_status();
                return false;
            }
        }
        self.publish_status();
        true
    }

    fn state_mut(&mut self, tier: Tier) -> &mut TierState {
        self.states
            .entry(tier)
            .or_insert_with(|| TierState::new(tier, 1))
    }

    fn phase(&self, tier: Tier) -> TierPhase {
        self.states.get(&tier).map_or(TierPhase::Idle, |s| s.phase)
    }

    fn publish(&self, event: LifecycleEvent) {
        self.events.publish(event, self.clock.now());
    }

    fn ack(&self, command: SchedulerCommand) {
        // Scheduler gone means shutdown is underway
        let _ = self.scheduler.send(command);
    }

    fn publish_status(&self) {
        let status = CoordinatorStatus {
            paused: self.paused,
            trainings_in_progress: self.runs.len(),
            prediction_log_size: self.log.len(),
            tiers: Tier::ALL.iter().filter_map(|t| self.states.get(t).cloned()).collect(),
            trends: Tier::ALL.iter().map(|t| (*t, self.history.trend(*t))).collect(),
            updated_at: self.clock.now(),
        };
        self.status_tx.send_replace(status);
    }

    fn on_sample(&mut self, tier: Tier, evaluation: Evaluation, generation: u64) {
        let now = self.clock.now();
        let threshold = self.config.tier(tier).accuracy_threshold;
        let needed = self.config.evaluation.degraded_samples.max(1);

        let state = self.state_mut(tier);
        if generation != state.generation {
            debug!("Discarding stale {} sample (generation {} != {})", tier, generation, state.generation);
            return;
        }

        state.current_accuracy = evaluation;
        if evaluation.is_below(threshold) {
            state.consecutive_low_samples += 1;
        } else {
            // InsufficientData breaks the streak as well
            state.consecutive_low_samples = 0;
        }
        let degraded = state.consecutive_low_samples >= needed;
        if degraded {
            state.consecutive_low_samples = 0;
        }

        if let Some(accuracy) = evaluation.accuracy() {
            self.history.record(tier, now, accuracy);
            if degraded {
                self.publish(LifecycleEvent::TierDegraded { tier, accuracy, threshold });
                self.trigger(tier, RetrainTrigger::Degraded);
            }
        }
    }

    fn trigger(&mut self, tier: Tier, trigger: RetrainTrigger) {
        let now = self.clock.now();
        let (aborting, phase) = {
            let state = self.state_mut(tier);
            (state.aborting, state.phase)
        };

        let dropped = if aborting {
            Some(DropReason::Aborting)
        } else if phase == TierPhase::Training {
            Some(DropReason::AlreadyTraining)
        } else if trigger != RetrainTrigger::Manual && self.paused {
            Some(DropReason::Paused)
        } else {
            None
        };

        if let Some(reason) = dropped {
            // While training the due stays unacknowledged and coalesces into the run
            if trigger == RetrainTrigger::Scheduled && reason != DropReason::AlreadyTraining {
                self.ack(SchedulerCommand::Consumed { tier, at: now });
            }
            debug!("{} {} trigger dropped: {}", tier, trigger, reason);
            self.publish(LifecycleEvent::TriggerDropped { tier, trigger, reason });
            return;
        }

        let state = self.state_mut(tier);
        let merged = match state.pending {
            Some(RetrainTrigger::Manual) => RetrainTrigger::Manual,
            _ => trigger,
        };

        match self.blocked_by(tier, merged) {
            Some(reason) => {
                let state = self.state_mut(tier);
                state.phase = TierPhase::Pending;
                state.pending = Some(merged);
                self.publish(LifecycleEvent::TrainingDeferred { tier, trigger, reason });
            }
            None => self.start_training(tier, merged),
        }
    }

    /// Why a trigger cannot start right now
    fn blocked_by(&self, tier: Tier, trigger: RetrainTrigger) -> Option<DeferReason> {
        if trigger != RetrainTrigger::Manual {
            if let Some(by) = tier.superseding().into_iter().rev().find(|t| self.phase(*t) == TierPhase::Training) {
                return Some(DeferReason::Superseded { by });
            }
        }
        match self.config.coordinator.max_concurrent_trainings {
            Some(limit) if self.runs.len() >= limit => Some(DeferReason::Capacity { limit }),
            _ => None,
        }
    }

    fn training_window(&self, tier: Tier) -> TrainingWindow {
        let settings = self.config.tier(tier);
        let end = self.clock.now();
        let start = settings.training_lookback().map(|lookback| end - lookback);
        let covers: Vec<Tier> = Tier::ALL.iter().copied().filter(|t| *t <= tier).collect();
        let records = self.log.resolved_for_tiers(&covers, start);

        TrainingWindow {
            tier,
            model_kinds: settings.models.clone(),
            covers,
            start,
            end,
            records,
        }
    }

    fn start_training(&mut self, tier: Tier, trigger: RetrainTrigger) {
        let window = self.training_window(tier);
        let started_at = self.clock.now();
        let cancel = CancelToken::new();

        let state = self.state_mut(tier);
        state.phase = TierPhase::Training;
        state.pending = None;
        state.last_retrain_trigger = Some(trigger);
        state.consecutive_low_samples = 0;
        state.training_started_at = Some(started_at);

        info!("Starting {} training ({}, {} records)", tier, trigger, window.len());
        self.publish(LifecycleEvent::TrainingStarted { tier, trigger, window_size: window.len() });

        self.runs.insert(
            tier,
            RunHandle {
                cancel: cancel.clone(),
                window: window.clone(),
                started_at,
            },
        );

        let trainer = Arc::clone(&self.trainer);
        let signals = self.signals_tx.clone();
        tokio::spawn(async move {
            let run = tokio::spawn(async move { trainer.train(tier, window, cancel).await });
            // A panicking trainer still reports back, so the tier never stays in Training
            let result = match run.await {
                Ok(result) => result,
                Err(e) => Err(TrainingError::Failed(format!("trainer task panicked: {}", e))),
            };
            if signals.send(Signal::Finished { tier, result }).await.is_err() {
                debug!("Coordinator gone before {} training finished", tier);
            }
        });
    }

    async fn on_finished(&mut self, tier: Tier, result: Result<TrainedModel, TrainingError>) {
        let Some(run) = self.runs.remove(&tier) else {
            warn!("Ignoring completion of {} training that is not in flight", tier);
            return;
        };
        let now = self.clock.now();
        self.state_mut(tier).aborting = false;

        let committed = match result {
            Ok(trained) => self
                .registry
                .commit(&run.window, trained, now)
                .await
                .map_err(|e| format!("registry commit failed: {}", e)),
            Err(e) => Err(e.to_string()),
        };

        match committed {
            Ok(artifact) => {
                let version = artifact.version();
                let min_samples = self.config.tier(tier).min_samples;
                let state = self.state_mut(tier);
                state.phase = TierPhase::Cooldown;
                state.last_trained_at = Some(now);
                state.active_model_version = Some(version);
                state.current_accuracy = Evaluation::insufficient(min_samples);
                state.consecutive_low_samples = 0;
                state.generation += 1;
                state.training_started_at = None;
                state.last_failure = None;

                self.ack(SchedulerCommand::Trained { tier, at: now });
                self.publish(LifecycleEvent::TrainingSucceeded {
                    tier,
                    version,
                    duration_ms: (now - run.started_at).num_milliseconds(),
                });

                self.satisfy_lower_tiers(tier, version, now);

                let state = self.state_mut(tier);
                state.phase = if state.pending.is_some() { TierPhase::Pending } else { TierPhase::Idle };
            }
            Err(message) => {
                error!("{} training failed: {}", tier, message);
                let state = self.state_mut(tier);
                state.phase = TierPhase::Idle;
                state.training_started_at = None;
                state.last_failure = Some(FailureRecord { at: now, error: message.clone() });

                self.ack(SchedulerCommand::Consumed { tier, at: now });
                self.publish(LifecycleEvent::TrainingFailed { tier, error: message });
            }
        }

        self.drain_pending();
    }

    /// Lower tiers count as trained by a higher tier's run
    fn satisfy_lower_tiers(&mut self, tier: Tier, version: u64, at: DateTime<Utc>) {
        for lower in tier.superseded() {
            let min_samples = self.config.tier(lower).min_samples;
            let state = self.state_mut(lower);
            if state.is_training() {
                continue;
            }

            state.last_trained_at = Some(at);
            state.current_accuracy = Evaluation::insufficient(min_samples);
            state.consecutive_low_samples = 0;
            state.generation += 1;
            if state.pending != Some(RetrainTrigger::Manual) {
                state.pending = None;
                state.phase = TierPhase::Idle;
            }

            self.ack(SchedulerCommand::Trained { tier: lower, at });
            self.publish(LifecycleEvent::TierSatisfied { tier: lower, by: tier, version });
        }
    }

    /// Start waiting triggers that can run now, highest tier first
    fn drain_pending(&mut self) {
        for tier in Tier::descending() {
            let Some(trigger) = self.states.get(&tier).and_then(|s| s.pending) else {
                continue;
            };
            if self.phase(tier) != TierPhase::Pending {
                continue;
            }
            if self.blocked_by(tier, trigger).is_none() {
                self.start_training(tier, trigger);
            }
        }
    }

    fn abort(&mut self, tier: Tier) {
        let now = self.clock.now();
        let state = self.state_mut(tier);
        match state.phase {
            TierPhase::Pending => {
                state.pending = None;
                state.phase = TierPhase::Idle;
                info!("Cleared pending {} trigger", tier);
                self.ack(SchedulerCommand::Consumed { tier, at: now });
            }
            TierPhase::Training => {
                state.pending = None;
                state.aborting = true;
                if let Some(run) = self.runs.get(&tier) {
                    info!("Aborting {} training", tier);
                    run.cancel.cancel();
                }
            }
            TierPhase::Idle | TierPhase::Cooldown => debug!("Nothing to abort for {} tier", tier),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ManualClock;
    use crate::ml::trainer::MockTrainer;
    use crate::ml::{InMemoryModelStore, ModelMetrics, ModelStore};
    use crate::types::{PredictionRecord, PredictionValue};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct Harness {
        coordinator: RetrainCoordinator,
        handle: CoordinatorHandle,
        events: broadcast::Receiver<Notification>,
        scheduler: mpsc::UnboundedReceiver<SchedulerCommand>,
        registry: Arc<ModelRegistry>,
        log: Arc<PredictionLog>,
    }

    async fn harness_with(config: RuntimeConfig, trainer: Arc<dyn Trainer>) -> Harness {
        let log = Arc::new(PredictionLog::new());
        let registry = Arc::new(ModelRegistry::new(Arc::new(InMemoryModelStore::new())));
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let bus = EventBus::new(256);
        let events = bus.subscribe();
        let (scheduler_tx, scheduler) = mpsc::unbounded_channel();
        let (coordinator, handle) = RetrainCoordinator::new(
            Arc::new(config),
            log.clone(),
            registry.clone(),
            trainer,
            clock,
            bus,
            scheduler_tx,
        )
        .await;
        Harness { coordinator, handle, events, scheduler, registry, log }
    }

    fn ok_trainer() -> Arc<dyn Trainer> {
        let mut trainer = MockTrainer::new();
        trainer.expect_train().returning(|_, _, _| {
            Ok(TrainedModel { payload: b"model".to_vec(), metrics: ModelMetrics::default() })
        });
        Arc::new(trainer)
    }

    fn failing_trainer() -> Arc<dyn Trainer> {
        let mut trainer = MockTrainer::new();
        trainer
            .expect_train()
            .returning(|_, _, _| Err(TrainingError::Failed("diverged".to_string())));
        Arc::new(trainer)
    }

    /// Blocks every run until released; counts calls per tier
    struct GatedTrainer {
        gate: Semaphore,
        calls: [AtomicUsize; 3],
    }

    impl GatedTrainer {
        fn new() -> Arc<Self> {
            Arc::new(Self { gate: Semaphore::new(0), calls: Default::default() })
        }

        fn release(&self) {
            self.gate.add_permits(16);
        }

        fn calls(&self, tier: Tier) -> usize {
            self.calls[tier.index()].load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Trainer for GatedTrainer {
        async fn train(&self, tier: Tier, _: TrainingWindow, cancel: CancelToken) -> Result<TrainedModel, TrainingError> {
            self.calls[tier.index()].fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                permit = self.gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                    Ok(TrainedModel { payload: vec![tier.index() as u8], metrics: ModelMetrics::default() })
                }
                _ = cancel.cancelled() => Err(TrainingError::Cancelled),
            }
        }
    }

    fn drain(events: &mut broadcast::Receiver<Notification>) -> Vec<LifecycleEvent> {
        let mut out = Vec::new();
        while let Ok(n) = events.try_recv() {
            out.push(n.event);
        }
        out
    }

    fn low(accuracy: f64) -> Evaluation {
        Evaluation::Score { accuracy, samples: 100 }
    }

    async fn finish_next(h: &mut Harness) {
        tokio::time::timeout(Duration::from_secs(2), h.coordinator.process_next()).await.unwrap();
    }

    #[tokio::test]
    async fn test_two_low_samples_trigger_exactly_once() {
        let mut h = harness_with(RuntimeConfig::default(), ok_trainer()).await;

        h.coordinator.handle(Signal::Sampled { tier: Tier::Basic, evaluation: low(0.4), generation: 0 }).await;
        assert_eq!(h.coordinator.state(Tier::Basic).unwrap().phase, TierPhase::Idle);
        h.coordinator.handle(Signal::Sampled { tier: Tier::Basic, evaluation: low(0.4), generation: 0 }).await;

        let events = drain(&mut h.events);
        let started = events.iter().filter(|e| matches!(e, LifecycleEvent::TrainingStarted { .. })).count();
        assert_eq!(started, 1);
        assert!(events.iter().any(|e| matches!(e, LifecycleEvent::TierDegraded { tier: Tier::Basic, .. })));
        assert!(h.coordinator.state(Tier::Basic).unwrap().is_training());
    }

    #[tokio::test]
    async fn test_low_then_normal_does_not_trigger() {
        let mut h = harness_with(RuntimeConfig::default(), ok_trainer()).await;

        for accuracy in [0.4, 0.7, 0.4] {
            h.coordinator.handle(Signal::Sampled { tier: Tier::Basic, evaluation: low(accuracy), generation: 0 }).await;
        }
        h.coordinator
            .handle(Signal::Sampled { tier: Tier::Basic, evaluation: Evaluation::insufficient(50), generation: 0 })
            .await;
        h.coordinator.handle(Signal::Sampled { tier: Tier::Basic, evaluation: low(0.4), generation: 0 }).await;

        assert!(!drain(&mut h.events).iter().any(|e| matches!(e, LifecycleEvent::TrainingStarted { .. })));
        assert_eq!(h.coordinator.state(Tier::Basic).unwrap().consecutive_low_samples, 1);
    }

    #[tokio::test]
    async fn test_success_bumps_version_and_resets_accuracy() {
        let mut h = harness_with(RuntimeConfig::default(), ok_trainer()).await;
        h.coordinator.handle(Signal::Manual { tier: Tier::Basic }).await;
        finish_next(&mut h).await;

        let state = h.coordinator.state(Tier::Basic).unwrap();
        assert_eq!(state.phase, TierPhase::Idle);
        assert_eq!(state.active_model_version, Some(1));
        assert_eq!(state.generation, 1);
        assert!(state.current_accuracy.is_insufficient());
        assert!(state.last_trained_at.is_some());
        assert_eq!(h.registry.active_version(Tier::Basic).await, Some(1));
        assert!(matches!(h.scheduler.try_recv(), Ok(SchedulerCommand::Trained { tier: Tier::Basic, .. })));
        assert_eq!(h.handle.status().tier(Tier::Basic).unwrap().active_model_version, Some(1));
    }

    #[tokio::test]
    async fn test_stale_generation_samples_are_discarded() {
        let mut h = harness_with(RuntimeConfig::default(), ok_trainer()).await;
        h.coordinator.handle(Signal::Manual { tier: Tier::Basic }).await;
        finish_next(&mut h).await;

        h.coordinator.handle(Signal::Sampled { tier: Tier::Basic, evaluation: low(0.1), generation: 0 }).await;
        let state = h.coordinator.state(Tier::Basic).unwrap();
        assert!(state.current_accuracy.is_insufficient());
        assert_eq!(state.consecutive_low_samples, 0);
    }

    #[tokio::test]
    async fn test_failure_records_and_leaves_registry_alone() {
        let mut h = harness_with(RuntimeConfig::default(), failing_trainer()).await;
        h.coordinator.handle(Signal::Due { tier: Tier::Intermediate }).await;
        finish_next(&mut h).await;

        let state = h.coordinator.state(Tier::Intermediate).unwrap();
        assert_eq!(state.phase, TierPhase::Idle);
        assert!(state.last_failure.as_ref().unwrap().error.contains("diverged"));
        assert_eq!(state.active_model_version, None);
        assert_eq!(h.registry.active_version(Tier::Intermediate).await, None);
        assert!(matches!(h.scheduler.try_recv(), Ok(SchedulerCommand::Consumed { tier: Tier::Intermediate, .. })));
        assert!(drain(&mut h.events).iter().any(|e| matches!(e, LifecycleEvent::TrainingFailed { .. })));
    }

    #[tokio::test]
    async fn test_trigger_while_training_is_dropped() {
        let trainer = GatedTrainer::new();
        let mut h = harness_with(RuntimeConfig::default(), trainer.clone()).await;
        h.coordinator.handle(Signal::Manual { tier: Tier::Basic }).await;
        h.coordinator.handle(Signal::Due { tier: Tier::Basic }).await;
        h.coordinator.handle(Signal::Manual { tier: Tier::Basic }).await;

        let dropped = drain(&mut h.events)
            .into_iter()
            .filter(|e| matches!(e, LifecycleEvent::TriggerDropped { reason: DropReason::AlreadyTraining, .. }))
            .count();
        assert_eq!(dropped, 2);
        // Coalesced due is not acknowledged until the run ends
        assert!(h.scheduler.try_recv().is_err());

        trainer.release();
        finish_next(&mut h).await;
        assert_eq!(trainer.calls(Tier::Basic), 1);
    }

    #[tokio::test]
    async fn test_higher_tier_run_satisfies_deferred_lower_trigger() {
        let trainer = GatedTrainer::new();
        let mut h = harness_with(RuntimeConfig::default(), trainer.clone()).await;
        h.coordinator.handle(Signal::Due { tier: Tier::Advanced }).await;
        h.coordinator.handle(Signal::Due { tier: Tier::Basic }).await;

        let basic = h.coordinator.state(Tier::Basic).unwrap();
        assert_eq!(basic.phase, TierPhase::Pending);
        assert_eq!(basic.pending, Some(RetrainTrigger::Scheduled));

        trainer.release();
        finish_next(&mut h).await;

        let advanced_trained = h.coordinator.state(Tier::Advanced).unwrap().last_trained_at;
        for tier in [Tier::Basic, Tier::Intermediate] {
            let state = h.coordinator.state(tier).unwrap();
            assert_eq!(state.phase, TierPhase::Idle);
            assert_eq!(state.last_trained_at, advanced_trained);
            assert_eq!(trainer.calls(tier), 0);
            assert_eq!(h.registry.active_version(tier).await, None);
        }
        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(e, LifecycleEvent::TrainingDeferred { tier: Tier::Basic, .. })));
        assert_eq!(events.iter().filter(|e| matches!(e, LifecycleEvent::TierSatisfied { .. })).count(), 2);
    }

    #[tokio::test]
    async fn test_deferred_lower_trigger_runs_after_higher_failure() {
        let mut h = harness_with(RuntimeConfig::default(), failing_trainer()).await;
        h.coordinator.handle(Signal::Due { tier: Tier::Advanced }).await;
        h.coordinator.handle(Signal::Due { tier: Tier::Basic }).await;
        assert_eq!(h.coordinator.state(Tier::Basic).unwrap().phase, TierPhase::Pending);

        finish_next(&mut h).await;
        let basic = h.coordinator.state(Tier::Basic).unwrap();
        assert_eq!(basic.phase, TierPhase::Training);
        assert_eq!(basic.last_retrain_trigger, Some(RetrainTrigger::Scheduled));
    }

    #[tokio::test]
    async fn test_manual_trigger_is_not_superseded() {
        let trainer = GatedTrainer::new();
        let mut h = harness_with(RuntimeConfig::default(), trainer.clone()).await;
        h.coordinator.handle(Signal::Manual { tier: Tier::Advanced }).await;
        h.coordinator.handle(Signal::Manual { tier: Tier::Basic }).await;
        assert!(h.coordinator.state(Tier::Basic).unwrap().is_training());
        assert_eq!(h.handle.status().trainings_in_progress, 2);
    }

    #[tokio::test]
    async fn test_capacity_cap_queues_highest_tier_first() {
        let trainer = GatedTrainer::new();
        let mut config = RuntimeConfig::default();
        config.coordinator.max_concurrent_trainings = Some(1);
        let mut h = harness_with(config, trainer.clone()).await;

        h.coordinator.handle(Signal::Manual { tier: Tier::Basic }).await;
        h.coordinator.handle(Signal::Manual { tier: Tier::Intermediate }).await;
        h.coordinator.handle(Signal::Manual { tier: Tier::Advanced }).await;
        assert_eq!(h.coordinator.state(Tier::Advanced).unwrap().phase, TierPhase::Pending);
        assert_eq!(h.coordinator.state(Tier::Intermediate).unwrap().phase, TierPhase::Pending);

        trainer.release();
        finish_next(&mut h).await;

        assert!(h.coordinator.state(Tier::Advanced).unwrap().is_training());
        assert_eq!(h.coordinator.state(Tier::Intermediate).unwrap().phase, TierPhase::Pending);
    }

    #[tokio::test]
    async fn test_paused_drops_automatic_triggers_only() {
        let mut h = harness_with(RuntimeConfig::default(), ok_trainer()).await;
        h.coordinator.handle(Signal::Pause).await;
        h.coordinator.handle(Signal::Due { tier: Tier::Basic }).await;
        assert!(matches!(h.scheduler.try_recv(), Ok(SchedulerCommand::Consumed { tier: Tier::Basic, .. })));
        assert_eq!(h.coordinator.state(Tier::Basic).unwrap().phase, TierPhase::Idle);

        h.coordinator.handle(Signal::Manual { tier: Tier::Basic }).await;
        assert!(h.coordinator.state(Tier::Basic).unwrap().is_training());

        let events = drain(&mut h.events);
        assert!(events.contains(&LifecycleEvent::LoopPaused));
        assert!(events.iter().any(|e| matches!(e, LifecycleEvent::TriggerDropped { reason: DropReason::Paused, .. })));
        assert!(h.handle.status().paused);
    }

    #[tokio::test]
    async fn test_handle_pause_and_resume() {
        let mut h = harness_with(RuntimeConfig::default(), ok_trainer()).await;
        h.handle.pause().await.unwrap();
        finish_next(&mut h).await;
        assert!(h.coordinator.is_paused());

        h.handle.resume().await.unwrap();
        finish_next(&mut h).await;
        assert!(!h.coordinator.is_paused());
        assert!(drain(&mut h.events).ends_with(&[LifecycleEvent::LoopPaused, LifecycleEvent::LoopResumed]));
    }

    #[tokio::test]
    async fn test_abort_cancels_and_rejects_until_return() {
        let trainer = GatedTrainer::new();
        let mut h = harness_with(RuntimeConfig::default(), trainer.clone()).await;
        h.coordinator.handle(Signal::Manual { tier: Tier::Intermediate }).await;
        h.coordinator.handle(Signal::Abort { tier: Tier::Intermediate }).await;
        assert!(h.coordinator.state(Tier::Intermediate).unwrap().aborting);

        h.coordinator.handle(Signal::Manual { tier: Tier::Intermediate }).await;
        assert!(drain(&mut h.events)
            .iter()
            .any(|e| matches!(e, LifecycleEvent::TriggerDropped { reason: DropReason::Aborting, .. })));

        finish_next(&mut h).await;
        let state = h.coordinator.state(Tier::Intermediate).unwrap();
        assert!(!state.aborting);
        assert_eq!(state.phase, TierPhase::Idle);
        assert!(state.last_failure.as_ref().unwrap().error.contains("cancelled"));
    }

    #[tokio::test]
    async fn test_training_window_covers_lower_tiers() {
        let mut trainer = MockTrainer::new();
        trainer
            .expect_train()
            .withf(|tier, window, _| {
                *tier == Tier::Intermediate && window.covers == vec![Tier::Basic, Tier::Intermediate] && window.len() == 2
            })
            .times(1)
            .returning(|_, _, _| Ok(TrainedModel { payload: vec![1], metrics: ModelMetrics::default() }));
        let mut config = RuntimeConfig::default();
        config.tiers.intermediate.training_lookback_secs = None;
        let mut h = harness_with(config, Arc::new(trainer)).await;

        let now = Utc::now();
        for (i, tier) in [Tier::Basic, Tier::Intermediate, Tier::Advanced].into_iter().enumerate() {
            let id = format!("p{}", i);
            h.log
                .append(PredictionRecord::new(tier, "m", PredictionValue::label("BUY"), now).with_id(&id))
                .unwrap();
            h.log.resolve(&id, PredictionValue::label("BUY"), now).unwrap();
        }
        h.log
            .append(PredictionRecord::new(Tier::Basic, "m", PredictionValue::label("BUY"), now).with_id("open"))
            .unwrap();

        h.coordinator.handle(Signal::Manual { tier: Tier::Intermediate }).await;
        finish_next(&mut h).await;
        assert_eq!(h.coordinator.state(Tier::Intermediate).unwrap().active_model_version, Some(1));
    }

    #[tokio::test]
    async fn test_restart_anchors_lower_tiers_on_active_higher_tier() {
        let store: Arc<dyn ModelStore> = Arc::new(InMemoryModelStore::new());
        let trained_at = Utc::now() - chrono::Duration::minutes(30);
        let window = |tier: Tier| TrainingWindow {
            tier,
            model_kinds: Vec::new(),
            covers: vec![tier],
            start: None,
            end: trained_at,
            records: Vec::new(),
        };
        let model = || TrainedModel { payload: vec![1], metrics: ModelMetrics::default() };

        let before = ModelRegistry::new(Arc::clone(&store));
        before.commit(&window(Tier::Basic), model(), trained_at - chrono::Duration::hours(2)).await.unwrap();
        before.commit(&window(Tier::Advanced), model(), trained_at).await.unwrap();

        let registry = Arc::new(ModelRegistry::new(store));
        registry.load().await.unwrap();
        let (scheduler_tx, _scheduler) = mpsc::unbounded_channel();
        let (coordinator, handle) = RetrainCoordinator::new(
            Arc::new(RuntimeConfig::default()),
            Arc::new(PredictionLog::new()),
            registry,
            ok_trainer(),
            Arc::new(ManualClock::default()),
            EventBus::new(16),
            scheduler_tx,
        )
        .await;

        for tier in Tier::ALL {
            assert_eq!(coordinator.state(tier).unwrap().last_trained_at, Some(trained_at), "{}", tier);
        }
        let basic = coordinator.state(Tier::Basic).unwrap();
        assert_eq!(basic.active_model_version, Some(1));
        assert!(coordinator.state(Tier::Intermediate).unwrap().active_model_version.is_none());
        assert_eq!(handle.status().tier(Tier::Intermediate).unwrap().last_trained_at, Some(trained_at));
    }
}
