use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::engine::Clock;
use crate::ml::{LogError, PredictionLog};
use crate::types::{Outcome, PredictionRecord, PredictionValue, Tier};

/// One line of the observation feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Observation {
    Predict {
        #[serde(default)]
        id: Option<String>,
        tier: Tier,
        model_id: String,
        value: PredictionValue,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    Resolve {
        id: String,
        actual: PredictionValue,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
}

/// Producer of predictions and outcomes
#[async_trait]
pub trait ObservationSource: Send {
    /// Next observation, or None once the source is exhausted
    async fn next(&mut self) -> Result<Option<Observation>>;
}

/// Newline-delimited JSON observations. Blank lines and `#` comments are
/// skipped; malformed lines are logged and skipped.
pub struct JsonLinesSource<R> {
    lines: Lines<BufReader<R>>,
    line_no: usize,
}

impl<R: AsyncRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            line_no: 0,
        }
    }
}

impl JsonLinesSource<tokio::fs::File> {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open observation feed {}", path.display()))?;
        Ok(Self::new(file))
    }
}

impl JsonLinesSource<tokio::io::Stdin> {
    pub fn stdin() -> Self {
        Self::new(tokio::io::stdin())
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ObservationSource for JsonLinesSource<R> {
    async fn next(&mut self) -> Result<Option<Observation>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(observation) => return Ok(Some(observation)),
                Err(e) => warn!("Skipping malformed observation on line {}: {}", self.line_no, e),
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub appended: usize,
    pub resolved: usize,
    pub rejected: usize,
}

/// Applies observations to the prediction log and mirrors them to the journal
pub struct Ingestor {
    log: Arc<PredictionLog>,
    database: Option<Arc<Database>>,
    clock: Arc<dyn Clock>,
}

impl Ingestor {
    pub fn new(log: Arc<PredictionLog>, database: Option<Arc<Database>>, clock: Arc<dyn Clock>) -> Self {
        Self { log, database, clock }
    }

    pub async fn apply(&self, observation: Observation) -> Result<(), LogError> {
        match observation {
            Observation::Predict { id, tier, model_id, value, at } => {
                let mut record = PredictionRecord::new(tier, model_id, value, at.unwrap_or_else(|| self.clock.now()));
                if let Some(id) = id {
                    record = record.with_id(id);
                }
                self.log.append(record.clone())?;
                if let Some(db) = &self.database {
                    if let Err(e) = db.insert_prediction(&record).await {
                        warn!("Failed to journal prediction {}: {}", record.id, e);
                    }
                }
            }
            Observation::Resolve { id, actual, at } => {
                let outcome = Outcome {
                    id,
                    actual_value: actual,
                    resolved_at: at.unwrap_or_else(|| self.clock.now()),
                };
                self.record_outcome(outcome).await?;
            }
        }
        Ok(())
    }

    pub async fn record_outcome(&self, outcome: Outcome) -> Result<(), LogError> {
        self.log
            .resolve(&outcome.id, outcome.actual_value.clone(), outcome.resolved_at)?;
        if let Some(db) = &self.database {
            if let Err(e) = db
                .resolve_prediction(&outcome.id, &outcome.actual_value, outcome.resolved_at)
                .await
            {
                warn!("Failed to journal outcome for {}: {}", outcome.id, e);
            }
        }
        Ok(())
    }

    /// Drain a source into the log. Log misuse is counted, never fatal.
    pub async fn pump(&self, source: &mut dyn ObservationSource) -> Result<IngestStats> {
        let mut stats = IngestStats::default();
        while let Some(observation) = source.next().await? {
            let is_predict = matches!(observation, Observation::Predict { .. });
            match self.apply(observation).await {
                Ok(()) if is_predict => stats.appended += 1,
                Ok(()) => stats.resolved += 1,
                Err(e) => {
                    debug!("Rejected observation: {}", e);
                    stats.rejected += 1;
                }
            }
        }
        info!(
            "Observation feed drained: {} predictions, {} outcomes, {} rejected",
            stats.appended, stats.resolved, stats.rejected
        );
        Ok(stats)
    }
}
