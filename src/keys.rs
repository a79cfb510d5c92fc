use chrono::{DateTime, NaiveDate};
use sha2::{Digest, Sha256};

// Separator sorts below every printable ASCII byte, so segment boundaries
// never reorder a lexicographic scan.
pub const SEP: u8 = 0x1F;

// 14 decimal digits of milliseconds, safely past year 5000.
pub const MAX_TIMESTAMP_MS: i64 = 99_999_999_999_999;

const REVERSE_TS_WIDTH: usize = 14;
const DAY_FORMAT: &str = "%Y-%m-%d";

pub const PREFIX_EVENT: &str = "evt";
pub const PREFIX_POINTER: &str = "ptr";
pub const PREFIX_INDEX_INSTALL: &str = "idx-install";
pub const PREFIX_INDEX_DOMAIN: &str = "idx-domain";
pub const PREFIX_INDEX_RULE: &str = "idx-rule";
pub const PREFIX_INDEX_SEVERITY: &str = "idx-severity";
pub const PREFIX_AGGREGATE: &str = "agg";
pub const PREFIX_AGGREGATE_ROLLUP: &str = "agg-rollup";

// SHA-256 prefix rather than DefaultHasher: the mapping must never move
// between processes or compiler versions.
pub fn shard_of(key: &str, shards: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(buf) % u64::from(shards.max(1))) as u32
}

pub fn day_bucket(timestamp_ms: i64) -> String {
    DateTime::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.format(DAY_FORMAT).to_string())
        .unwrap_or_else(|| "1970-01-01".to_string())
}

/// Ascending lexicographic order equals descending chronological order.
pub fn reverse_timestamp(timestamp_ms: i64) -> String {
    let clamped = timestamp_ms.clamp(0, MAX_TIMESTAMP_MS);
    format!("{:0width$}", MAX_TIMESTAMP_MS - clamped, width = REVERSE_TS_WIDTH)
}

pub fn normalize_timestamp(raw: i64) -> Option<i64> {
    if raw <= 0 {
        return None;
    }
    // Anything below 1e10 is a plausible epoch-seconds value (through 2286).
    let millis = if raw < 10_000_000_000 { raw * 1000 } else { raw };
    (millis <= MAX_TIMESTAMP_MS).then_some(millis)
}

pub fn parse_day(day: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(day, DAY_FORMAT).ok()
}

pub fn format_day(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

pub fn prev_day(day: &str) -> Option<String> {
    parse_day(day)?.pred_opt().map(format_day)
}

pub fn next_day(day: &str) -> Option<String> {
    parse_day(day)?.succ_opt().map(format_day)
}

// ISO day strings compare lexicographically in calendar order.
pub fn clamp_day(day: &str, start: &str, end: &str) -> String {
    if day < start {
        start.to_string()
    } else if day > end {
        end.to_string()
    } else {
        day.to_string()
    }
}

fn key_with_segments(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::new();
    let mut iter = parts.iter();
    if let Some(first) = iter.next() {
        key.extend_from_slice(first.as_bytes());
    }
    for part in iter {
        key.push(SEP);
        key.extend_from_slice(part.as_bytes());
    }
    key
}

fn with_trailing_sep(mut key: Vec<u8>) -> Vec<u8> {
    key.push(SEP);
    key
}

fn shard_segment(shard: u32) -> String {
    format!("{shard:04}")
}

// evt <day> <shard> <rev_ts> <event_id>
pub fn event_key(day: &str, shard: u32, reverse_ts: &str, event_id: &str) -> Vec<u8> {
    key_with_segments(&[PREFIX_EVENT, day, &shard_segment(shard), reverse_ts, event_id])
}

pub fn event_partition_prefix(day: &str, shard: u32) -> Vec<u8> {
    with_trailing_sep(key_with_segments(&[
        PREFIX_EVENT,
        day,
        &shard_segment(shard),
    ]))
}

pub fn pointer_key(event_id: &str) -> Vec<u8> {
    key_with_segments(&[PREFIX_POINTER, event_id])
}

// <kind> <value> <day> <rev_ts> <event_id>
pub fn index_key(kind: &str, value: &str, day: &str, reverse_ts: &str, event_id: &str) -> Vec<u8> {
    key_with_segments(&[kind, value, day, reverse_ts, event_id])
}

pub fn index_partition_prefix(kind: &str, value: &str) -> Vec<u8> {
    with_trailing_sep(key_with_segments(&[kind, value]))
}

pub fn index_day_prefix(kind: &str, value: &str, day: &str) -> Vec<u8> {
    with_trailing_sep(key_with_segments(&[kind, value, day]))
}

// agg <day> <dimension> <cshard> <value>; dimension precedes the counter
// shard so one prefix scan covers a whole dimension for a day.
pub fn aggregate_key(day: &str, dimension: &str, counter_shard: u32, value: &str) -> Vec<u8> {
    key_with_segments(&[
        PREFIX_AGGREGATE,
        day,
        dimension,
        &shard_segment(counter_shard),
        value,
    ])
}

pub fn aggregate_dimension_prefix(day: &str, dimension: &str) -> Vec<u8> {
    with_trailing_sep(key_with_segments(&[PREFIX_AGGREGATE, day, dimension]))
}

// agg-rollup <cshard> <domain> <day>
pub fn rollup_key(counter_shard: u32, domain: &str, day: &str) -> Vec<u8> {
    key_with_segments(&[
        PREFIX_AGGREGATE_ROLLUP,
        &shard_segment(counter_shard),
        domain,
        day,
    ])
}

pub fn rollup_partition_prefix(counter_shard: u32, domain: &str) -> Vec<u8> {
    with_trailing_sep(key_with_segments(&[
        PREFIX_AGGREGATE_ROLLUP,
        &shard_segment(counter_shard),
        domain,
    ]))
}

pub fn split_segments(key: &[u8]) -> Vec<String> {
    key.split(|b| *b == SEP)
        .map(|seg| String::from_utf8_lossy(seg).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_bucket_is_utc_calendar_day() {
        // 2026-08-01T12:00:00Z
        assert_eq!(day_bucket(1_785_585_600_000), "2026-08-01");
        // One millisecond before midnight stays on the previous day.
        assert_eq!(day_bucket(1_785_628_799_999), "2026-08-01");
        assert_eq!(day_bucket(1_785_628_800_000), "2026-08-02");
    }

    #[test]
    fn shard_assignment_is_deterministic() {
        let a = shard_of("evt-123", 8);
        let b = shard_of("evt-123", 8);
        assert_eq!(a, b);
        assert!(a < 8);
        assert_eq!(shard_of("anything", 1), 0);
    }

    #[test]
    fn reverse_timestamps_order_newest_first() {
        let older = reverse_timestamp(1_000);
        let newer = reverse_timestamp(2_000);
        assert_eq!(older.len(), REVERSE_TS_WIDTH);
        assert!(newer < older, "newer events must sort before older ones");
    }

    #[test]
    fn timestamp_normalization_accepts_seconds_and_millis() {
        assert_eq!(normalize_timestamp(1_785_585_600), Some(1_785_585_600_000));
        assert_eq!(
            normalize_timestamp(1_785_585_600_000),
            Some(1_785_585_600_000)
        );
        assert_eq!(normalize_timestamp(0), None);
        assert_eq!(normalize_timestamp(-5), None);
        assert_eq!(normalize_timestamp(MAX_TIMESTAMP_MS + 1), None);
    }

    #[test]
    fn day_arithmetic_crosses_month_boundaries() {
        assert_eq!(prev_day("2026-08-01").as_deref(), Some("2026-07-31"));
        assert_eq!(next_day("2026-07-31").as_deref(), Some("2026-08-01"));
        assert_eq!(prev_day("not-a-day"), None);
    }

    #[test]
    fn clamp_day_corrects_out_of_range_cursors() {
        assert_eq!(clamp_day("2026-08-05", "2026-08-01", "2026-08-10"), "2026-08-05");
        assert_eq!(clamp_day("2026-07-01", "2026-08-01", "2026-08-10"), "2026-08-01");
        assert_eq!(clamp_day("2026-09-01", "2026-08-01", "2026-08-10"), "2026-08-10");
    }

    #[test]
    fn shards_spread_approximately_uniformly() {
        use rand::{Rng, SeedableRng, rngs::StdRng};

        let mut rng = StdRng::seed_from_u64(7);
        let shards = 8u32;
        let mut counts = vec![0usize; shards as usize];
        for _ in 0..8_000 {
            let id: String = (0..16).map(|_| rng.gen_range('a'..='z')).collect();
            counts[shard_of(&id, shards) as usize] += 1;
        }
        // Expected 1000 per shard; allow generous slack.
        for count in counts {
            assert!((600..=1_400).contains(&count), "skewed shard: {count}");
        }
    }

    #[test]
    fn event_keys_sort_newest_first_within_a_partition() {
        let newer = event_key("2026-08-01", 3, &reverse_timestamp(2_000), "a");
        let older = event_key("2026-08-01", 3, &reverse_timestamp(1_000), "a");
        assert!(newer < older);
        let prefix = event_partition_prefix("2026-08-01", 3);
        assert!(newer.starts_with(prefix.as_slice()));
        assert!(older.starts_with(prefix.as_slice()));
    }
}
