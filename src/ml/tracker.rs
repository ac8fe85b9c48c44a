use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{PredictionRecord, PredictionValue, Tier};

const SHARD_COUNT: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("Prediction {0} already exists")]
    DuplicateId(String),

    #[error("Prediction {0} not found")]
    NotFound(String),

    #[error("Prediction {0} is already resolved")]
    AlreadyResolved(String),

    #[error("Invalid prediction record {0}: {1}")]
    InvalidRecord(String, String),
}

struct Entry {
    record: PredictionRecord,
    appended_seq: u64,
    resolved_seq: Option<u64>,
}

impl Entry {
    /// The record as it looked when the log was at `seq`
    fn as_of(&self, seq: u64) -> Option<PredictionRecord> {
        if self.appended_seq > seq {
            return None;
        }
        match self.resolved_seq {
            Some(resolved) if resolved > seq => {
                let mut record = self.record.clone();
                record.actual_value = None;
                record.resolved_at = None;
                Some(record)
            }
            _ => Some(self.record.clone()),
        }
    }
}

/// Append-only store of predictions and their outcomes.
///
/// Records are spread over independently locked shards keyed by id, so
/// concurrent producers only contend when they hit the same shard. Every write
/// is stamped with a sequence number; reads filter on the sequence observed at
/// call time, which gives each query a snapshot that later appends and
/// resolutions do not leak into.
pub struct PredictionLog {
    shards: Vec<RwLock<HashMap<String, Entry>>>,
    seq: AtomicU64,
}

impl PredictionLog {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            seq: AtomicU64::new(0),
        }
    }

    fn shard(&self, id: &str) -> &RwLock<HashMap<String, Entry>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Store a new unresolved prediction
    pub fn append(&self, record: PredictionRecord) -> Result<(), LogError> {
        if record.is_resolved() || record.resolved_at.is_some() {
            return Err(LogError::InvalidRecord(
                record.id,
                "new predictions must be unresolved".to_string(),
            ));
        }

        let mut shard = self.shard(&record.id).write();
        if shard.contains_key(&record.id) {
            return Err(LogError::DuplicateId(record.id));
        }

        let appended_seq = self.next_seq();
        debug!("Logged prediction {} for {} tier", record.id, record.tier);
        shard.insert(record.id.clone(), Entry { record, appended_seq, resolved_seq: None });
        Ok(())
    }

    /// Attach the ground truth to a prediction. A second resolution is rejected.
    pub fn resolve(
        &self,
        id: &str,
        actual_value: PredictionValue,
        resolved_at: DateTime<Utc>,
    ) -> Result<PredictionRecord, LogError> {
        let mut shard = self.shard(id).write();
        let entry = shard.get_mut(id).ok_or_else(|| LogError::NotFound(id.to_string()))?;
        if entry.record.is_resolved() {
            return Err(LogError::AlreadyResolved(id.to_string()));
        }

        entry.record.actual_value = Some(actual_value);
        entry.record.resolved_at = Some(resolved_at);
        entry.resolved_seq = Some(self.next_seq());
        Ok(entry.record.clone())
    }

    /// Bulk-load previously journaled records, resolved or not. Duplicates are skipped.
    pub fn restore(&self, records: impl IntoIterator<Item = PredictionRecord>) -> usize {
        let mut restored = 0;
        for record in records {
            let mut shard = self.shard(&record.id).write();
            if shard.contains_key(&record.id) {
                warn!("Skipping duplicate journaled prediction {}", record.id);
                continue;
            }
            let seq = self.next_seq();
            let resolved_seq = record.is_resolved().then_some(seq);
            shard.insert(record.id.clone(), Entry { record, appended_seq: seq, resolved_seq });
            restored += 1;
        }
        restored
    }

    pub fn get(&self, id: &str) -> Option<PredictionRecord> {
        self.shard(id).read().get(id).map(|e| e.record.clone())
    }

    /// Records of `tier` created at or after `since`, oldest first, as of call time
    pub fn query(&self, tier: Tier, since: Option<DateTime<Utc>>, limit: Option<usize>) -> PredictionQuery {
        let mut records = self.snapshot(|r| r.tier == tier && since.map_or(true, |s| r.created_at >= s));
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        PredictionQuery { records: records.into() }
    }

    /// The most recent `limit` resolved records of `tier` created strictly after
    /// `created_after`, oldest first
    pub fn recent_resolved(
        &self,
        tier: Tier,
        created_after: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Vec<PredictionRecord> {
        let mut records = self.snapshot(|r| {
            r.tier == tier && r.is_resolved() && created_after.map_or(true, |after| r.created_at > after)
        });
        if let Some(limit) = limit {
            let skip = records.len().saturating_sub(limit);
            records.drain(..skip);
        }
        records
    }

    /// Resolved records of any of `tiers` created strictly after `created_after`
    pub fn resolved_for_tiers(&self, tiers: &[Tier], created_after: Option<DateTime<Utc>>) -> Vec<PredictionRecord> {
        self.snapshot(|r| {
            tiers.contains(&r.tier) && r.is_resolved() && created_after.map_or(true, |after| r.created_at > after)
        })
    }

    /// Drop the oldest resolved records of `tier` so at most `keep` remain.
    /// Unresolved predictions are never pruned.
    pub fn prune(&self, tier: Tier, keep: usize) -> usize {
        let resolved = self.snapshot(|r| r.tier == tier && r.is_resolved());
        let excess = resolved.len().saturating_sub(keep);
        for record in resolved.iter().take(excess) {
            self.shard(&record.id).write().remove(&record.id);
        }
        if excess > 0 {
            debug!("Pruned {} resolved predictions from {} tier", excess, tier);
        }
        excess
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self, filter: impl Fn(&PredictionRecord) -> bool) -> Vec<PredictionRecord> {
        let as_of = self.seq.load(Ordering::Acquire);
        let mut ordered: Vec<(u64, PredictionRecord)> = Vec::new();
        for shard in &self.shards {
            let shard = shard.read();
            ordered.extend(
                shard
                    .values()
                    .filter_map(|e| e.as_of(as_of).map(|r| (e.appended_seq, r)))
                    .filter(|(_, r)| filter(r)),
            );
        }
        ordered.sort_by(|(seq_a, a), (seq_b, b)| a.created_at.cmp(&b.created_at).then(seq_a.cmp(seq_b)));
        ordered.into_iter().map(|(_, r)| r).collect()
    }
}

impl Default for PredictionLog {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time view of log records. Iterating it again starts over.
#[derive(Debug, Clone)]
pub struct PredictionQuery {
    records: Arc<[PredictionRecord]>,
}

impl PredictionQuery {
    pub fn iter(&self) -> std::slice::Iter<'_, PredictionRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<'a> IntoIterator for &'a PredictionQuery {
    type Item = &'a PredictionRecord;
    type IntoIter = std::slice::Iter<'a, PredictionRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
