use std::collections::BTreeMap;

use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use tracing::warn;

use crate::{
    error::Result,
    keys,
    storage::{AggregateRecord, RangeQuery, StorageBackend},
    store::EventRecord,
};

// The plain three dimensions are origin-scoped; the global- variants are
// origin-agnostic.
pub const DIMENSIONS: &[&str] = &[
    "domain",
    "rule",
    "severity",
    "rule-trend",
    "domain-trend",
    "global-domain",
    "global-severity",
    "global-rule",
];

const VALUE_SEP: char = '\u{1F}';

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregateTotals {
    pub count: u64,
    pub score_sum: f64,
}

fn scoped(origin: &str, value: &str) -> String {
    format!("{origin}{VALUE_SEP}{value}")
}

fn trend(value: &str, severity: &str) -> String {
    format!("{value}{VALUE_SEP}{severity}")
}

// Each add is independent and commutative; a failed cell is logged and
// skipped, never rolled back.
pub fn apply(
    backend: &dyn StorageBackend,
    record: &EventRecord,
    counter_shards: u32,
    aggregate_ttl_days: i64,
) {
    let now = Utc::now().timestamp();
    let expires_at = record.timestamp_ms / 1000 + aggregate_ttl_days * 86_400;
    let origin = record.origin.as_str();

    let updates: [(&str, String); 8] = [
        ("domain", scoped(origin, &record.domain)),
        ("rule", scoped(origin, &record.rule_id)),
        ("severity", scoped(origin, &record.severity)),
        ("rule-trend", scoped(origin, &trend(&record.rule_id, &record.severity))),
        (
            "domain-trend",
            scoped(origin, &trend(&record.domain, &record.severity)),
        ),
        ("global-domain", record.domain.clone()),
        ("global-severity", record.severity.clone()),
        ("global-rule", record.rule_id.clone()),
    ];

    // Counter shard is hashed from the dimension value, so distinct hot
    // values land on different partitions instead of contending on one.
    for (dimension, value) in &updates {
        let shard = keys::shard_of(value, counter_shards);
        let key = keys::aggregate_key(&record.day, dimension, shard, value);
        if let Err(err) =
            backend.atomic_add(&key, 1, record.score_delta, expires_at, now)
        {
            counter!("threatdbx_aggregate_failures_total").increment(1);
            warn!(
                event_id = %record.event_id,
                dimension,
                "aggregate update failed: {err}"
            );
        }
    }

    // Cross-day rollup: partitioned by domain, day as the sort value.
    let rollup = keys::rollup_key(
        keys::shard_of(&record.domain, counter_shards),
        &record.domain,
        &record.day,
    );
    if let Err(err) = backend.atomic_add(&rollup, 1, record.score_delta, expires_at, now) {
        counter!("threatdbx_aggregate_failures_total").increment(1);
        warn!(event_id = %record.event_id, "domain rollup update failed: {err}");
    }
}

// Collapses counter shards back into per-value totals.
pub fn dimension_totals(
    backend: &dyn StorageBackend,
    day: &str,
    dimension: &str,
) -> Result<BTreeMap<String, AggregateTotals>> {
    let prefix = keys::aggregate_dimension_prefix(day, dimension);
    let mut totals: BTreeMap<String, AggregateTotals> = BTreeMap::new();
    let mut after: Option<Vec<u8>> = None;

    loop {
        let page = backend.range(RangeQuery {
            prefix: &prefix,
            after: after.as_deref(),
            upper: None,
            limit: 512,
        })?;
        for (key, value) in &page.entries {
            let record: AggregateRecord = serde_json::from_slice(value)?;
            // Key shape: agg day dimension cshard value...
            let segments = keys::split_segments(key);
            let value_name = segments.get(4..).map(|s| s.join("\u{1F}")).unwrap_or_default();
            let entry = totals.entry(value_name).or_default();
            entry.count += record.count;
            entry.score_sum += record.score_sum;
        }
        match page.next {
            Some(next) => after = Some(next),
            None => break,
        }
    }

    Ok(totals)
}

pub fn domain_rollup(
    backend: &dyn StorageBackend,
    domain: &str,
    counter_shards: u32,
) -> Result<BTreeMap<String, AggregateTotals>> {
    let shard = keys::shard_of(domain, counter_shards);
    let prefix = keys::rollup_partition_prefix(shard, domain);
    let mut totals: BTreeMap<String, AggregateTotals> = BTreeMap::new();
    let mut after: Option<Vec<u8>> = None;

    loop {
        let page = backend.range(RangeQuery {
            prefix: &prefix,
            after: after.as_deref(),
            upper: None,
            limit: 512,
        })?;
        for (key, value) in &page.entries {
            let record: AggregateRecord = serde_json::from_slice(value)?;
            let segments = keys::split_segments(key);
            let Some(day) = segments.last() else {
                continue;
            };
            let entry = totals.entry(day.clone()).or_default();
            entry.count += record.count;
            entry.score_sum += record.score_sum;
        }
        match page.next {
            Some(next) => after = Some(next),
            None => break,
        }
    }

    Ok(totals)
}
