mod aggregate;
mod cursor;
mod query;

use std::{sync::Arc, time::Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    config::Config,
    error::{Result, TelemetryError},
    keys,
    storage::{RocksBackend, StorageBackend},
};

pub use aggregate::{AggregateTotals, DIMENSIONS};
pub use cursor::{CursorState, ShardCursor};
pub use query::{DayRange, Facet, ListPage};

// Immutable after creation; removed only by expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub event_type: String,
    pub rule_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruleset_id: Option<String>,
    pub severity: String,
    pub score_delta: f64,
    pub install_id: String,
    pub session_id: String,
    pub origin: String,
    pub domain: String,
    pub page: String,
    pub user_agent: String,
    pub timestamp_ms: i64,
    pub day: String,
    pub shard: u32,
    pub expires_at: i64,
    pub payload: PayloadBlob,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadBlob {
    pub body: String,
    // SHA-256 of the untruncated body.
    pub hash: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointerRecord {
    pub event_id: String,
    pub day: String,
    pub shard: u32,
    pub reverse_ts: String,
    pub timestamp_ms: i64,
    pub expires_at: i64,
    pub payload_hash: String,
    pub payload_truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored { event_id: String },
    /// An earlier attempt durably stored this event; answered as success so
    /// client retries stay idempotent.
    Duplicate { event_id: String },
}

pub struct TelemetryStore {
    backend: Arc<dyn StorageBackend>,
    event_shards: u32,
    counter_shards: u32,
    aggregate_ttl_days: i64,
    page_limit: usize,
    max_page_limit: usize,
}

impl TelemetryStore {
    pub fn open(config: &Config) -> Result<Self> {
        let backend = Arc::new(RocksBackend::open(config.event_store_path())?);
        Ok(Self::with_backend(backend, config))
    }

    pub fn with_backend(backend: Arc<dyn StorageBackend>, config: &Config) -> Self {
        Self {
            backend,
            event_shards: config.event_shards.max(1),
            counter_shards: config.counter_shards.max(1),
            aggregate_ttl_days: config.aggregate_ttl_days,
            page_limit: config.page_limit,
            max_page_limit: config.max_page_limit,
        }
    }

    pub fn event_shards(&self) -> u32 {
        self.event_shards
    }

    pub(crate) fn backend(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.backend)
    }

    pub(crate) fn clamp_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.page_limit)
            .clamp(1, self.max_page_limit)
    }

    // The conditional primary insert is the idempotency point: a
    // pre-existing key short-circuits before any pointer, index, or counter
    // write. Projection and counter failures after a fresh insert are
    // logged, not surfaced; the primary record is the source of truth.
    pub fn ingest(&self, record: EventRecord) -> Result<IngestOutcome> {
        let started = Instant::now();
        let reverse_ts = keys::reverse_timestamp(record.timestamp_ms);
        let primary_key = keys::event_key(&record.day, record.shard, &reverse_ts, &record.event_id);
        let value = serde_json::to_vec(&record)?;

        if !self.backend.put_if_absent(&primary_key, &value)? {
            counter!("threatdbx_ingest_duplicates_total").increment(1);
            return Ok(IngestOutcome::Duplicate {
                event_id: record.event_id,
            });
        }

        let pointer = PointerRecord {
            event_id: record.event_id.clone(),
            day: record.day.clone(),
            shard: record.shard,
            reverse_ts: reverse_ts.clone(),
            timestamp_ms: record.timestamp_ms,
            expires_at: record.expires_at,
            payload_hash: record.payload.hash.clone(),
            payload_truncated: record.payload.truncated,
        };
        self.write_projections(&record, &pointer, &reverse_ts);
        aggregate::apply(
            self.backend.as_ref(),
            &record,
            self.counter_shards,
            self.aggregate_ttl_days,
        );

        counter!("threatdbx_ingest_total").increment(1);
        histogram!("threatdbx_ingest_duration_seconds").record(started.elapsed().as_secs_f64());
        Ok(IngestOutcome::Stored {
            event_id: record.event_id,
        })
    }

    // Unconditional writes: the conditional primary insert already rejected
    // true duplicates upstream.
    fn write_projections(&self, record: &EventRecord, pointer: &PointerRecord, reverse_ts: &str) {
        let pointer_bytes = match serde_json::to_vec(pointer) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(event_id = %record.event_id, "failed to encode pointer record: {err}");
                return;
            }
        };

        if let Err(err) = self
            .backend
            .put(&keys::pointer_key(&record.event_id), &pointer_bytes)
        {
            warn!(event_id = %record.event_id, "pointer write failed: {err}");
        }

        let facets = [
            (keys::PREFIX_INDEX_INSTALL, record.install_id.as_str()),
            (keys::PREFIX_INDEX_DOMAIN, record.domain.as_str()),
            (keys::PREFIX_INDEX_RULE, record.rule_id.as_str()),
            (keys::PREFIX_INDEX_SEVERITY, record.severity.as_str()),
        ];
        for (kind, value) in facets {
            if value.is_empty() {
                continue;
            }
            let key = keys::index_key(kind, value, &record.day, reverse_ts, &record.event_id);
            if let Err(err) = self.backend.put(&key, &pointer_bytes) {
                warn!(
                    event_id = %record.event_id,
                    index = kind,
                    "facet index write failed: {err}"
                );
            }
        }
    }

    // A pointer whose primary record is gone is a distinct failure, not
    // partial data.
    pub fn get_event(&self, event_id: &str) -> Result<(PointerRecord, EventRecord)> {
        let pointer_bytes = self
            .backend
            .get(&keys::pointer_key(event_id))?
            .ok_or(TelemetryError::NotFound)?;
        let pointer: PointerRecord = serde_json::from_slice(&pointer_bytes)?;
        if pointer.expires_at <= Utc::now().timestamp() {
            return Err(TelemetryError::NotFound);
        }

        let primary_key = keys::event_key(
            &pointer.day,
            pointer.shard,
            &pointer.reverse_ts,
            &pointer.event_id,
        );
        let record_bytes = self
            .backend
            .get(&primary_key)?
            .ok_or(TelemetryError::DanglingPointer)?;
        let record: EventRecord = serde_json::from_slice(&record_bytes)?;
        Ok((pointer, record))
    }

    pub fn dimension_totals(
        &self,
        day: &str,
        dimension: &str,
    ) -> Result<std::collections::BTreeMap<String, AggregateTotals>> {
        aggregate::dimension_totals(self.backend.as_ref(), day, dimension)
    }

    pub fn domain_rollup(
        &self,
        domain: &str,
    ) -> Result<std::collections::BTreeMap<String, AggregateTotals>> {
        aggregate::domain_rollup(self.backend.as_ref(), domain, self.counter_shards)
    }
}
