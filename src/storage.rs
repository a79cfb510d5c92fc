use std::path::PathBuf;

use parking_lot::Mutex;
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TelemetryError};

// Mutated only through atomic_add; expires_at is set on first touch and
// never overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub count: u64,
    pub score_sum: f64,
    pub expires_at: i64,
    pub updated_at: i64,
}

// next is the native resume cursor: the last returned key, valid as the
// after argument of a follow-up scan.
#[derive(Debug, Default)]
pub struct RangePage {
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    pub next: Option<Vec<u8>>,
}

// Ascending lexicographic scan within prefix, strictly after `after`,
// strictly below `upper`.
#[derive(Debug, Clone, Copy)]
pub struct RangeQuery<'a> {
    pub prefix: &'a [u8],
    pub after: Option<&'a [u8]>,
    pub upper: Option<&'a [u8]>,
    pub limit: usize,
}

pub trait StorageBackend: Send + Sync {
    /// Returns `false` without writing when the exact key already exists.
    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn atomic_add(
        &self,
        key: &[u8],
        count_delta: u64,
        score_delta: f64,
        expires_at_if_absent: i64,
        now: i64,
    ) -> Result<()>;

    fn range(&self, query: RangeQuery<'_>) -> Result<RangePage>;
}

pub struct RocksBackend {
    db: DBWithThreadMode<MultiThreaded>,
    write_lock: Mutex<()>,
}

impl RocksBackend {
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DBWithThreadMode::<MultiThreaded>::open(&options, path)
            .map_err(|err| TelemetryError::Storage(err.to_string()))?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map_err(|err| TelemetryError::Storage(err.to_string()))
    }
}

impl StorageBackend for RocksBackend {
    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let _guard = self.write_lock.lock();
        if self.get_raw(key)?.is_some() {
            return Ok(false);
        }
        self.db
            .put(key, value)
            .map_err(|err| TelemetryError::Storage(err.to_string()))?;
        Ok(true)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db
            .put(key, value)
            .map_err(|err| TelemetryError::Storage(err.to_string()))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_raw(key)
    }

    fn atomic_add(
        &self,
        key: &[u8],
        count_delta: u64,
        score_delta: f64,
        expires_at_if_absent: i64,
        now: i64,
    ) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut record = match self.get_raw(key)? {
            Some(bytes) => serde_json::from_slice::<AggregateRecord>(&bytes)?,
            None => AggregateRecord {
                count: 0,
                score_sum: 0.0,
                expires_at: expires_at_if_absent,
                updated_at: now,
            },
        };
        record.count += count_delta;
        record.score_sum += score_delta;
        record.updated_at = now;
        self.db
            .put(key, serde_json::to_vec(&record)?)
            .map_err(|err| TelemetryError::Storage(err.to_string()))
    }

    fn range(&self, query: RangeQuery<'_>) -> Result<RangePage> {
        let start: Vec<u8> = match query.after {
            Some(after) => after.to_vec(),
            None => query.prefix.to_vec(),
        };
        let iter = self
            .db
            .iterator(IteratorMode::From(start.as_slice(), Direction::Forward));

        let mut entries = Vec::new();
        let mut has_more = false;
        for item in iter {
            let (key, value) = item.map_err(|err| TelemetryError::Storage(err.to_string()))?;
            if !key.starts_with(query.prefix) {
                break;
            }
            if let Some(after) = query.after {
                if key.as_ref() == after {
                    continue;
                }
            }
            if let Some(upper) = query.upper {
                if key.as_ref() >= upper {
                    break;
                }
            }
            if entries.len() == query.limit {
                has_more = true;
                break;
            }
            entries.push((key.into_vec(), value.into_vec()));
        }

        let next = if has_more {
            entries.last().map(|(key, _)| key.clone())
        } else {
            None
        };
        Ok(RangePage { entries, next })
    }
}
