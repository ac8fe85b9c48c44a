use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::types::{RetrainTrigger, Tier};

/// Notification severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
}

/// Why a trigger was thrown away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    AlreadyTraining,
    Paused,
    Aborting,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::AlreadyTraining => "already training",
            DropReason::Paused => "feedback loop paused",
            DropReason::Aborting => "abort in progress",
        };
        write!(f, "{}", s)
    }
}

/// Why a trigger is waiting instead of starting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeferReason {
    /// A higher tier is training and its run covers this tier
    Superseded { by: Tier },
    /// Global training cap reached
    Capacity { limit: usize },
}

/// Retraining lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LifecycleEvent {
    TierDue {
        tier: Tier,
    },
    TierDegraded {
        tier: Tier,
        accuracy: f64,
        threshold: f64,
    },
    TrainingStarted {
        tier: Tier,
        trigger: RetrainTrigger,
        window_size: usize,
    },
    TrainingSucceeded {
        tier: Tier,
        version: u64,
        duration_ms: i64,
    },
    TrainingFailed {
        tier: Tier,
        error: String,
    },
    TriggerDropped {
        tier: Tier,
        trigger: RetrainTrigger,
        reason: DropReason,
    },
    TrainingDeferred {
        tier: Tier,
        trigger: RetrainTrigger,
        reason: DeferReason,
    },
    /// A lower tier counted as trained by a higher tier's run
    TierSatisfied {
        tier: Tier,
        by: Tier,
        version: u64,
    },
    LoopPaused,
    LoopResumed,
}

impl LifecycleEvent {
    pub fn tier(&self) -> Option<Tier> {
        match self {
            LifecycleEvent::TierDue { tier }
            | LifecycleEvent::TierDegraded { tier, .. }
            | LifecycleEvent::TrainingStarted { tier, .. }
            | LifecycleEvent::TrainingSucceeded { tier, .. }
            | LifecycleEvent::TrainingFailed { tier, .. }
            | LifecycleEvent::TriggerDropped { tier, .. }
            | LifecycleEvent::TrainingDeferred { tier, .. }
            | LifecycleEvent::TierSatisfied { tier, .. } => Some(*tier),
            LifecycleEvent::LoopPaused | LifecycleEvent::LoopResumed => None,
        }
    }

    /// Stable snake_case name, used as the journal's `kind` column
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::TierDue { .. } => "tier_due",
            LifecycleEvent::TierDegraded { .. } => "tier_degraded",
            LifecycleEvent::TrainingStarted { .. } => "training_started",
            LifecycleEvent::TrainingSucceeded { .. } => "training_succeeded",
            LifecycleEvent::TrainingFailed { .. } => "training_failed",
            LifecycleEvent::TriggerDropped { .. } => "trigger_dropped",
            LifecycleEvent::TrainingDeferred { .. } => "training_deferred",
            LifecycleEvent::TierSatisfied { .. } => "tier_satisfied",
            LifecycleEvent::LoopPaused => "loop_paused",
            LifecycleEvent::LoopResumed => "loop_resumed",
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            LifecycleEvent::TierDegraded { .. } | LifecycleEvent::TrainingFailed { .. } => Severity::Warning,
            _ => Severity::Info,
        }
    }

    /// Get a human-readable title for this event
    pub fn title(&self) -> String {
        match self {
            LifecycleEvent::TierDue { tier } => format!("{} retrain due", tier),
            LifecycleEvent::TierDegraded { tier, accuracy, threshold } => format!(
                "{} accuracy degraded: {:.1}% < {:.1}%",
                tier,
                accuracy * 100.0,
                threshold * 100.0
            ),
            LifecycleEvent::TrainingStarted { tier, trigger, window_size } => {
                format!("{} training started ({}, {} records)", tier, trigger, window_size)
            }
            LifecycleEvent::TrainingSucceeded { tier, version, duration_ms } => {
                format!("{} model v{} trained in {}ms", tier, version, duration_ms)
            }
            LifecycleEvent::TrainingFailed { tier, error } => format!("{} training failed: {}", tier, error),
            LifecycleEvent::TriggerDropped { tier, trigger, reason } => {
                format!("{} {} trigger dropped: {}", tier, trigger, reason)
            }
            LifecycleEvent::TrainingDeferred { tier, trigger, reason } => match reason {
                DeferReason::Superseded { by } => format!("{} {} trigger deferred to {} run", tier, trigger, by),
                DeferReason::Capacity { limit } => {
                    format!("{} {} trigger waiting for a slot ({} max)", tier, trigger, limit)
                }
            },
            LifecycleEvent::TierSatisfied { tier, by, version } => {
                format!("{} satisfied by {} model v{}", tier, by, version)
            }
            LifecycleEvent::LoopPaused => "Feedback loop paused".to_string(),
            LifecycleEvent::LoopResumed => "Feedback loop resumed".to_string(),
        }
    }
}

/// A timestamped lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub event: LifecycleEvent,
}

impl Notification {
    pub fn new(event: LifecycleEvent, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            severity: event.default_severity(),
            event,
        }
    }
}

/// Broadcast stream of lifecycle events. Publishing never blocks; slow
/// subscribers lag and lose the oldest events instead.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Notification>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: LifecycleEvent, at: DateTime<Utc>) {
        debug!("Event: {}", event.kind());
        // No subscribers is fine
        let _ = self.tx.send(Notification::new(event, at));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

/// Logs lifecycle events and keeps a bounded history, optionally journaling
/// them to the database
pub struct NotificationManager {
    notifications: Arc<RwLock<Vec<Notification>>>,
    database: Option<Arc<crate::database::Database>>,
    max_notifications: usize,
}

impl NotificationManager {
    pub fn new(database: Option<Arc<crate::database::Database>>) -> Self {
        Self {
            notifications: Arc::new(RwLock::new(Vec::new())),
            database,
            max_notifications: 500,
        }
    }

    pub async fn record(&self, notification: Notification) {
        let title = notification.event.title();
        match notification.severity {
            Severity::Warning => warn!("{}", title),
            Severity::Info => info!("{}", title),
        }

        let mut notifications = self.notifications.write().await;
        notifications.insert(0, notification.clone());
        if notifications.len() > self.max_notifications {
            notifications.truncate(self.max_notifications);
        }
        drop(notifications);

        if let Some(db) = &self.database {
            if let Err(e) = db.insert_event(&notification).await {
                error!("Failed to save lifecycle event to database: {}", e);
            }
        }
    }

    /// Drain a bus subscription until the bus closes
    pub fn spawn(self: Arc<Self>, mut rx: broadcast::Receiver<Notification>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => self.record(notification).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Notification subscriber lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Newest first
    pub async fn get_all(&self) -> Vec<Notification> {
        self.notifications.read().await.clone()
    }

    pub async fn get_recent(&self, limit: usize) -> Vec<Notification> {
        let notifications = self.notifications.read().await;
        notifications.iter().take(limit).cloned().collect()
    }

    pub async fn for_tier(&self, tier: Tier) -> Vec<Notification> {
        let notifications = self.notifications.read().await;
        notifications.iter().filter(|n| n.event.tier() == Some(tier)).cloned().collect()
    }
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_severity_defaults() {
        let degraded = LifecycleEvent::TierDegraded { tier: Tier::Basic, accuracy: 0.4, threshold: 0.55 };
        assert_eq!(degraded.default_severity(), Severity::Warning);
        assert_eq!(degraded.title(), "basic accuracy degraded: 40.0% < 55.0%");

        let due = LifecycleEvent::TierDue { tier: Tier::Advanced };
        assert_eq!(due.default_severity(), Severity::Info);
        assert_eq!(LifecycleEvent::LoopPaused.tier(), None);
    }

    #[test]
    fn test_event_json_shape() {
        let event = LifecycleEvent::TriggerDropped {
            tier: Tier::Intermediate,
            trigger: RetrainTrigger::Scheduled,
            reason: DropReason::AlreadyTraining,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "TriggerDropped");
        assert_eq!(json["data"]["reason"], "already_training");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(LifecycleEvent::LoopResumed, Utc::now());
    }

    #[tokio::test]
    async fn test_manager_drains_bus() {
        let bus = EventBus::new(16);
        let manager = Arc::new(NotificationManager::new(None));
        let handle = Arc::clone(&manager).spawn(bus.subscribe());

        bus.publish(LifecycleEvent::TierDue { tier: Tier::Basic }, Utc::now());
        bus.publish(LifecycleEvent::TierDue { tier: Tier::Advanced }, Utc::now());
        drop(bus);
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        let all = manager.get_all().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event.tier(), Some(Tier::Advanced));
        assert_eq!(manager.for_tier(Tier::Basic).await.len(), 1);
        assert_eq!(manager.get_recent(1).await.len(), 1);
    }
}
