use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::persistence::ModelMetrics;
use super::trainer::{CancelToken, TrainedModel, Trainer, TrainingError, TrainingWindow};
use crate::types::Tier;

const STDERR_TAIL: usize = 512;

/// Delegates training to an external program.
///
/// The training window is written to the child's stdin as JSON and whatever the
/// child prints on stdout becomes the model payload. A non-zero exit is a
/// failed training run. The child is killed when the run is cancelled.
pub struct CommandTrainer {
    program: String,
    args: Vec<String>,
}

impl CommandTrainer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Trainer for CommandTrainer {
    async fn train(
        &self,
        tier: Tier,
        window: TrainingWindow,
        cancel: CancelToken,
    ) -> Result<TrainedModel, TrainingError> {
        let input = serde_json::to_vec(&window).map_err(|e| TrainingError::Failed(e.to_string()))?;
        let models: Vec<&str> = window.model_kinds.iter().map(|k| k.as_str()).collect();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("RETRAINER_TIER", tier.as_str())
            .env("RETRAINER_MODELS", models.join(","))
            .env("RETRAINER_SAMPLES", window.len().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| TrainingError::Process(format!("Failed to spawn {}: {}", self.program, e)))?;
        debug!("Spawned trainer {} (pid {:?}) for {} tier", self.program, child.id(), tier);

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| TrainingError::Process("Failed to capture stdin".to_string()))?;
        let writer = tokio::spawn(async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        });

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| TrainingError::Process(format!("Failed to wait for trainer: {}", e)))?
            }
            _ = cancel.cancelled() => {
                warn!("Killing {} trainer for {} tier", self.program, tier);
                writer.abort();
                return Err(TrainingError::Cancelled);
            }
        };

        // A child that exits without draining stdin breaks the pipe; its exit status decides
        if let Ok(Err(e)) = writer.await {
            debug!("Trainer closed stdin early: {}", e);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.trim().chars().rev().take(STDERR_TAIL).collect::<Vec<_>>().into_iter().rev().collect();
            return Err(TrainingError::Process(format!("{} exited with {}: {}", self.program, output.status, tail)));
        }
        if output.stdout.is_empty() {
            return Err(TrainingError::Failed(format!("{} produced no model payload", self.program)));
        }

        info!("External {} training finished: {} byte payload", tier, output.stdout.len());
        Ok(TrainedModel {
            payload: output.stdout,
            metrics: ModelMetrics {
                train_samples: window.len(),
                ..Default::default()
            },
        })
    }
}
