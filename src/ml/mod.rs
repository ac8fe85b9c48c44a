pub mod command;
pub mod evaluator;
pub mod model;
pub mod performance;
pub mod persistence;
pub mod tracker;
pub mod trainer;

pub use command::CommandTrainer;
pub use evaluator::{AccuracyEvaluator, Evaluation};
pub use model::{BaselineTrainer, BaselineWeights};
pub use performance::{PerformanceHistory, Trend, TrendReport};
pub use persistence::{
    ArtifactMetadata, InMemoryModelStore, ModelArtifact, ModelMetrics, ModelRegistry, ModelStore, RegistryError,
    SqliteModelStore,
};
pub use tracker::{LogError, PredictionLog, PredictionQuery};
pub use trainer::{CancelToken, TimeoutTrainer, TrainedModel, Trainer, TrainingError, TrainingWindow};
