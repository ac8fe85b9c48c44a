use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::clock::Clock;
use super::coordinator::Signal;
use crate::config::TierTable;
use crate::types::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimerState {
    Idle,
    Due,
}

/// Acknowledgements from the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerCommand {
    /// The due signal was handled without a training run. Ignored unless Due.
    Consumed { tier: Tier, at: DateTime<Utc> },
    /// The tier counts as trained at `at`. Always re-anchors.
    Trained { tier: Tier, at: DateTime<Utc> },
}

/// Fixed-interval timer of one tier
#[derive(Debug, Clone)]
pub struct TierTimer {
    tier: Tier,
    interval: Duration,
    state: TimerState,
    /// None until the tier has an anchor; such a tier is due on the first poll
    next_due_at: Option<DateTime<Utc>>,
}

impl TierTimer {
    pub fn new(tier: Tier, interval: Duration, last_trained_at: Option<DateTime<Utc>>) -> Self {
        Self {
            tier,
            interval,
            state: TimerState::Idle,
            next_due_at: last_trained_at.map(|t| t + interval),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.next_due_at
    }

    /// True exactly on the Idle -> Due edge
    pub fn poll(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == TimerState::Due {
            return false;
        }
        let due = self.next_due_at.map_or(true, |next| now >= next);
        if due {
            self.state = TimerState::Due;
        }
        due
    }

    pub fn consume(&mut self, at: DateTime<Utc>) {
        if self.state == TimerState::Due {
            self.state = TimerState::Idle;
            self.next_due_at = Some(at + self.interval);
        }
    }

    pub fn trained(&mut self, at: DateTime<Utc>) {
        self.state = TimerState::Idle;
        self.next_due_at = Some(at + self.interval);
    }
}

/// One timer per tier. Emits `Signal::Due` on each Idle -> Due edge; never
/// starts training itself.
pub struct TierScheduler {
    timers: Vec<TierTimer>,
    clock: Arc<dyn Clock>,
    tick: std::time::Duration,
}

impl TierScheduler {
    pub fn new(
        tiers: &TierTable,
        last_trained: impl Fn(Tier) -> Option<DateTime<Utc>>,
        clock: Arc<dyn Clock>,
        tick: std::time::Duration,
    ) -> Self {
        // Highest tier first so simultaneous dues reach the coordinator in that order
        let timers = Tier::descending()
            .map(|tier| TierTimer::new(tier, tiers.get(tier).interval(), last_trained(tier)))
            .collect();
        Self { timers, clock, tick }
    }

    pub fn timer(&self, tier: Tier) -> Option<&TierTimer> {
        self.timers.iter().find(|t| t.tier == tier)
    }

    /// Tiers that became due at `now`, highest first
    pub fn poll(&mut self, now: DateTime<Utc>) -> Vec<Tier> {
        self.timers.iter_mut().filter_map(|t| t.poll(now).then_some(t.tier)).collect()
    }

    pub fn apply(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Consumed { tier, at } => {
                if let Some(timer) = self.timers.iter_mut().find(|t| t.tier == tier) {
                    timer.consume(at);
                }
            }
            SchedulerCommand::Trained { tier, at } => {
                if let Some(timer) = self.timers.iter_mut().find(|t| t.tier == tier) {
                    timer.trained(at);
                    debug!("{} timer re-anchored, next due {:?}", tier, timer.next_due_at);
                }
            }
        }
    }

    /// Tick until the coordinator goes away
    pub async fn run(
        mut self,
        signals: mpsc::Sender<Signal>,
        mut commands: mpsc::UnboundedReceiver<SchedulerCommand>,
    ) {
        info!("Tier scheduler started (tick {}s)", self.tick.as_secs_f64());
        let clock = Arc::clone(&self.clock);
        loop {
            for tier in self.poll(clock.now()) {
                debug!("{} tier due", tier);
                if signals.send(Signal::Due { tier }).await.is_err() {
                    return;
                }
            }

            tokio::select! {
                _ = clock.sleep(self.tick) => {}
                command = commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
            }
        }
        info!("Tier scheduler stopped");
    }
}
