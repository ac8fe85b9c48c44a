pub mod clock;
pub mod coordinator;
pub mod feedback;
pub mod sampler;
pub mod scheduler;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{
    CoordinatorError, CoordinatorHandle, CoordinatorStatus, FailureRecord, RetrainCoordinator, Signal, TierPhase,
    TierState,
};
pub use feedback::FeedbackLoop;
pub use sampler::AccuracySampler;
pub use scheduler::{SchedulerCommand, TierScheduler, TierTimer, TimerState};
