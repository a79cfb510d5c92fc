use std::{collections::HashSet, time::Duration};

use chrono::Utc;
use futures::future::join_all;
use tokio::{task, time::timeout};
use tracing::warn;

use crate::{
    error::{Result, TelemetryError},
    keys,
    storage::{RangeQuery, StorageBackend},
    store::{
        EventRecord, PointerRecord, TelemetryStore,
        cursor::{self, CursorState, ShardCursor},
    },
};

pub const FANOUT_BATCH: usize = 2;

// A timed-out shard contributes nothing this call; its cursor is carried
// forward and retried on the next page.
const SHARD_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Inclusive, validated calendar-day range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayRange {
    pub start: String,
    pub end: String,
}

impl DayRange {
    pub fn new(start: &str, end: &str, max_span_days: i64) -> Result<Self> {
        let start_date = keys::parse_day(start)
            .ok_or_else(|| TelemetryError::InvalidDayRange(format!("bad start day {start:?}")))?;
        let end_date = keys::parse_day(end)
            .ok_or_else(|| TelemetryError::InvalidDayRange(format!("bad end day {end:?}")))?;
        if start_date > end_date {
            return Err(TelemetryError::InvalidDayRange(format!(
                "start day {start} is after end day {end}"
            )));
        }
        let span = (end_date - start_date).num_days() + 1;
        if span > max_span_days {
            return Err(TelemetryError::InvalidDayRange(format!(
                "range spans {span} days, maximum is {max_span_days}"
            )));
        }
        Ok(Self {
            start: keys::format_day(start_date),
            end: keys::format_day(end_date),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facet {
    Install,
    Domain,
    Rule,
    Severity,
}

impl Facet {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "install" => Ok(Self::Install),
            "domain" => Ok(Self::Domain),
            "rule" => Ok(Self::Rule),
            "severity" => Ok(Self::Severity),
            other => Err(TelemetryError::InvalidQuery(format!(
                "unknown facet {other:?}"
            ))),
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            Self::Install => keys::PREFIX_INDEX_INSTALL,
            Self::Domain => keys::PREFIX_INDEX_DOMAIN,
            Self::Rule => keys::PREFIX_INDEX_RULE,
            Self::Severity => keys::PREFIX_INDEX_SEVERITY,
        }
    }
}

#[derive(Debug)]
pub struct ListPage {
    pub items: Vec<EventRecord>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone)]
enum ShardProgress {
    Fresh,
    // Resume strictly after this native key.
    Resumed(Vec<u8>),
    Exhausted,
}

// Native key and shard are kept so a truncated page can rewind each shard's
// cursor to its last returned item.
struct MergedItem {
    sort_key: (String, String),
    shard: u32,
    native_key: Vec<u8>,
    record: EventRecord,
}

struct ShardPage {
    items: Vec<(Vec<u8>, EventRecord)>,
    next: Option<Vec<u8>>,
}

impl TelemetryStore {
    pub async fn list_day_range(
        &self,
        range: &DayRange,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<ListPage> {
        let shards = self.event_shards() as usize;
        let per_shard_cap = limit.div_ceil(FANOUT_BATCH).max(1);

        let (mut day, mut progress) = match cursor {
            None => (range.end.clone(), vec![ShardProgress::Fresh; shards]),
            Some(encoded) => match cursor::decode(encoded)? {
                CursorState::FanOut {
                    day,
                    per_shard,
                    exhausted,
                } => {
                    // A cursor minted against a different range is clamped
                    // into this one rather than rejected.
                    let day = keys::clamp_day(&day, &range.start, &range.end);
                    let mut progress = vec![ShardProgress::Fresh; shards];
                    for shard in exhausted {
                        if let Some(slot) = progress.get_mut(shard as usize) {
                            *slot = ShardProgress::Exhausted;
                        }
                    }
                    for entry in per_shard {
                        if let Some(slot) = progress.get_mut(entry.shard as usize) {
                            *slot = ShardProgress::Resumed(cursor::decode_native_key(&entry.after)?);
                        }
                    }
                    (day, progress)
                }
                CursorState::Partition { .. } => return Err(TelemetryError::InvalidCursor),
            },
        };

        // Rewind anchors: each shard's position at the start of the current
        // day, used when truncation drops everything a shard contributed.
        let mut day_start_progress = progress.clone();
        let mut merged: Vec<MergedItem> = Vec::new();

        loop {
            let active: Vec<(u32, Option<Vec<u8>>)> = progress
                .iter()
                .enumerate()
                .filter_map(|(shard, state)| match state {
                    ShardProgress::Fresh => Some((shard as u32, None)),
                    ShardProgress::Resumed(after) => Some((shard as u32, Some(after.clone()))),
                    ShardProgress::Exhausted => None,
                })
                .collect();

            if active.is_empty() {
                if day == range.start {
                    return Ok(finish(merged, limit, None));
                }
                day = keys::prev_day(&day).ok_or_else(|| {
                    TelemetryError::InvalidDayRange(format!("cannot step before day {day}"))
                })?;
                progress = vec![ShardProgress::Fresh; shards];
                day_start_progress = progress.clone();
                continue;
            }

            let mut stalled = true;
            let mut limit_reached = false;
            for batch in active.chunks(FANOUT_BATCH) {
                let handles: Vec<_> = batch
                    .iter()
                    .map(|(shard, after)| {
                        let backend = self.backend();
                        let day = day.clone();
                        let after = after.clone();
                        let shard = *shard;
                        task::spawn_blocking(move || {
                            query_event_shard(
                                backend.as_ref(),
                                &day,
                                shard,
                                after.as_deref(),
                                per_shard_cap,
                            )
                        })
                    })
                    .collect();

                let results = join_all(
                    handles
                        .into_iter()
                        .map(|handle| timeout(SHARD_QUERY_TIMEOUT, handle)),
                )
                .await;

                for ((shard, _), outcome) in batch.iter().zip(results) {
                    let page = match outcome {
                        Err(_elapsed) => {
                            warn!(shard, day = %day, "shard query timed out; cursor carried forward");
                            continue;
                        }
                        Ok(Err(join_err)) => {
                            return Err(TelemetryError::Storage(join_err.to_string()));
                        }
                        Ok(Ok(result)) => result?,
                    };
                    stalled = false;
                    progress[*shard as usize] = match &page.next {
                        Some(next) => ShardProgress::Resumed(next.clone()),
                        None => ShardProgress::Exhausted,
                    };
                    merge_shard_page(&mut merged, *shard, page.items);
                }

                if merged.len() >= limit {
                    limit_reached = true;
                    break;
                }
            }

            if limit_reached || (stalled && !active.is_empty()) {
                let state = encode_fanout_state(
                    &day,
                    &merged,
                    limit,
                    &progress,
                    &day_start_progress,
                );
                let encoded = cursor::encode(&state)?;
                return Ok(finish(merged, limit, Some(encoded)));
            }
        }
    }

    // newest=true iterates days newest-to-oldest; otherwise one ascending
    // range scan covers the whole span.
    pub async fn list_facet(
        &self,
        facet: Facet,
        value: &str,
        range: &DayRange,
        limit: usize,
        newest: bool,
        cursor: Option<&str>,
    ) -> Result<ListPage> {
        if value.trim().is_empty() {
            return Err(TelemetryError::InvalidQuery(
                "facet value cannot be empty".to_string(),
            ));
        }
        if newest {
            self.list_facet_newest(facet, value, range, limit, cursor)
                .await
        } else {
            self.list_facet_ascending(facet, value, range, limit, cursor)
                .await
        }
    }

    async fn list_facet_ascending(
        &self,
        facet: Facet,
        value: &str,
        range: &DayRange,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<ListPage> {
        let kind = facet.prefix();
        let after = match cursor {
            None => keys::index_day_prefix(kind, value, &range.start),
            Some(encoded) => match cursor::decode(encoded)? {
                CursorState::Partition {
                    after: Some(after), ..
                } => cursor::decode_native_key(&after)?,
                CursorState::Partition { after: None, .. } => {
                    keys::index_day_prefix(kind, value, &range.start)
                }
                CursorState::FanOut { .. } => return Err(TelemetryError::InvalidCursor),
            },
        };
        let upper = keys::next_day(&range.end)
            .map(|next| keys::index_day_prefix(kind, value, &next))
            .ok_or_else(|| {
                TelemetryError::InvalidDayRange(format!("cannot step past day {}", range.end))
            })?;

        let backend = self.backend();
        let prefix = keys::index_partition_prefix(kind, value);
        let page = task::spawn_blocking(move || {
            backend.range(RangeQuery {
                prefix: &prefix,
                after: Some(&after),
                upper: Some(&upper),
                limit,
            })
        })
        .await
        .map_err(|err| TelemetryError::Storage(err.to_string()))??;

        let next = page.next.clone();
        let items = self.resolve_index_entries(page.entries).await?;
        let cursor = match next {
            Some(key) => Some(cursor::encode(&CursorState::Partition {
                day: range.start.clone(),
                after: Some(cursor::encode_native_key(&key)),
            })?),
            None => None,
        };
        Ok(ListPage { items, cursor })
    }

    async fn list_facet_newest(
        &self,
        facet: Facet,
        value: &str,
        range: &DayRange,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<ListPage> {
        let kind = facet.prefix();
        let (mut day, mut after) = match cursor {
            None => (range.end.clone(), None),
            Some(encoded) => match cursor::decode(encoded)? {
                CursorState::Partition { day, after } => {
                    let day = keys::clamp_day(&day, &range.start, &range.end);
                    let after = after
                        .map(|encoded| cursor::decode_native_key(&encoded))
                        .transpose()?;
                    (day, after)
                }
                CursorState::FanOut { .. } => return Err(TelemetryError::InvalidCursor),
            },
        };

        let mut items: Vec<EventRecord> = Vec::new();
        loop {
            let remaining = limit - items.len();
            let prefix = keys::index_day_prefix(kind, value, &day);
            let backend = self.backend();
            let scan_after = after.clone();
            let page = task::spawn_blocking(move || {
                backend.range(RangeQuery {
                    prefix: &prefix,
                    after: scan_after.as_deref(),
                    upper: None,
                    limit: remaining,
                })
            })
            .await
            .map_err(|err| TelemetryError::Storage(err.to_string()))??;

            let next = page.next.clone();
            items.extend(self.resolve_index_entries(page.entries).await?);

            match next {
                Some(key) => {
                    if items.len() >= limit {
                        let cursor = cursor::encode(&CursorState::Partition {
                            day,
                            after: Some(cursor::encode_native_key(&key)),
                        })?;
                        return Ok(ListPage {
                            items,
                            cursor: Some(cursor),
                        });
                    }
                    // Resolution dropped entries; keep draining this day.
                    after = Some(key);
                }
                None => {
                    if day == range.start {
                        return Ok(ListPage {
                            items,
                            cursor: None,
                        });
                    }
                    let previous = keys::prev_day(&day).ok_or_else(|| {
                        TelemetryError::InvalidDayRange(format!("cannot step before day {day}"))
                    })?;
                    if items.len() >= limit {
                        let cursor = cursor::encode(&CursorState::Partition {
                            day: previous,
                            after: None,
                        })?;
                        return Ok(ListPage {
                            items,
                            cursor: Some(cursor),
                        });
                    }
                    day = previous;
                    after = None;
                }
            }
        }
    }

    // Index entries hold pointer payloads; expired records and dangling
    // index rows are skipped, not errors.
    async fn resolve_index_entries(
        &self,
        entries: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<Vec<EventRecord>> {
        let backend = self.backend();
        task::spawn_blocking(move || {
            let now = Utc::now().timestamp();
            let mut records = Vec::with_capacity(entries.len());
            for (_, value) in entries {
                let pointer: PointerRecord = match serde_json::from_slice(&value) {
                    Ok(pointer) => pointer,
                    Err(err) => {
                        warn!("skipping undecodable index entry: {err}");
                        continue;
                    }
                };
                if pointer.expires_at <= now {
                    continue;
                }
                let primary = keys::event_key(
                    &pointer.day,
                    pointer.shard,
                    &pointer.reverse_ts,
                    &pointer.event_id,
                );
                match backend.get(&primary)? {
                    Some(bytes) => match serde_json::from_slice(&bytes) {
                        Ok(record) => records.push(record),
                        Err(err) => warn!(
                            event_id = %pointer.event_id,
                            "skipping undecodable primary record: {err}"
                        ),
                    },
                    None => warn!(
                        event_id = %pointer.event_id,
                        "index entry points at a missing primary record"
                    ),
                }
            }
            Ok(records)
        })
        .await
        .map_err(|err| TelemetryError::Storage(err.to_string()))?
    }
}

fn query_event_shard(
    backend: &dyn StorageBackend,
    day: &str,
    shard: u32,
    after: Option<&[u8]>,
    cap: usize,
) -> Result<ShardPage> {
    let prefix = keys::event_partition_prefix(day, shard);
    let page = backend.range(RangeQuery {
        prefix: &prefix,
        after,
        upper: None,
        limit: cap,
    })?;

    let now = Utc::now().timestamp();
    let mut items = Vec::with_capacity(page.entries.len());
    for (key, value) in page.entries {
        let record: EventRecord = match serde_json::from_slice(&value) {
            Ok(record) => record,
            Err(err) => {
                warn!(shard, "skipping undecodable event record: {err}");
                continue;
            }
        };
        if record.expires_at <= now {
            continue;
        }
        items.push((key, record));
    }
    Ok(ShardPage {
        items,
        next: page.next,
    })
}

// Stable two-list merge on (reverse_ts, event_id): existing items win ties,
// neither input is ever re-sorted.
fn merge_shard_page(merged: &mut Vec<MergedItem>, shard: u32, items: Vec<(Vec<u8>, EventRecord)>) {
    if items.is_empty() {
        return;
    }
    let incoming: Vec<MergedItem> = items
        .into_iter()
        .map(|(native_key, record)| MergedItem {
            sort_key: (
                keys::reverse_timestamp(record.timestamp_ms),
                record.event_id.clone(),
            ),
            shard,
            native_key,
            record,
        })
        .collect();

    let mut result = Vec::with_capacity(merged.len() + incoming.len());
    let mut existing = std::mem::take(merged).into_iter().peekable();
    let mut fresh = incoming.into_iter().peekable();
    loop {
        match (existing.peek(), fresh.peek()) {
            (Some(a), Some(b)) => {
                if a.sort_key <= b.sort_key {
                    result.push(existing.next().expect("peeked existing item"));
                } else {
                    result.push(fresh.next().expect("peeked fresh item"));
                }
            }
            (Some(_), None) => result.push(existing.next().expect("peeked existing item")),
            (None, Some(_)) => result.push(fresh.next().expect("peeked fresh item")),
            (None, None) => break,
        }
    }
    *merged = result;
}

// Shards whose fetched items were partially dropped are rewound to their
// last returned item so nothing is lost between pages.
fn encode_fanout_state(
    day: &str,
    merged: &[MergedItem],
    limit: usize,
    progress: &[ShardProgress],
    day_start_progress: &[ShardProgress],
) -> CursorState {
    let cut = merged.len().min(limit);
    let (returned, dropped) = merged.split_at(cut);
    let dropped_shards: HashSet<u32> = dropped.iter().map(|item| item.shard).collect();

    let mut per_shard = Vec::new();
    let mut exhausted = Vec::new();
    for (shard, state) in progress.iter().enumerate() {
        let shard = shard as u32;
        if dropped_shards.contains(&shard) {
            // Only same-day items are valid rewind targets; a key from a
            // newer day would scan past the current day's partition.
            match returned
                .iter()
                .rev()
                .find(|item| item.shard == shard && item.record.day == day)
            {
                Some(item) => per_shard.push(ShardCursor {
                    shard,
                    after: cursor::encode_native_key(&item.native_key),
                }),
                // Everything this shard contributed was dropped: rewind to
                // its position at the start of the day.
                None => match day_start_progress.get(shard as usize) {
                    Some(ShardProgress::Resumed(after)) => per_shard.push(ShardCursor {
                        shard,
                        after: cursor::encode_native_key(after),
                    }),
                    // Fresh at day start: omit from both lists.
                    _ => {}
                },
            }
            continue;
        }
        match state {
            ShardProgress::Resumed(after) => per_shard.push(ShardCursor {
                shard,
                after: cursor::encode_native_key(after),
            }),
            ShardProgress::Exhausted => exhausted.push(shard),
            ShardProgress::Fresh => {}
        }
    }

    CursorState::FanOut {
        day: day.to_string(),
        per_shard,
        exhausted,
    }
}

fn finish(merged: Vec<MergedItem>, limit: usize, cursor: Option<String>) -> ListPage {
    let items = merged
        .into_iter()
        .take(limit)
        .map(|item| item.record)
        .collect();
    ListPage { items, cursor }
}
