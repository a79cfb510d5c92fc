use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, TelemetryError};

const CURSOR_VERSION: &str = "v1";
const CHECKSUM_SALT: &str = "threatdbx-cursor";
const CHECKSUM_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CursorState {
    // Fan-out: shards absent from both lists have not been touched for
    // this day yet.
    FanOut {
        day: String,
        #[serde(default)]
        per_shard: Vec<ShardCursor>,
        #[serde(default)]
        exhausted: Vec<u32>,
    },
    // Facet query: one native cursor per day (per range in ascending mode).
    Partition {
        day: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCursor {
    pub shard: u32,
    // Base64 of the shard's native resume key.
    pub after: String,
}

pub fn encode_native_key(key: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(key)
}

pub fn decode_native_key(encoded: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| TelemetryError::InvalidCursor)
}

pub fn encode(state: &CursorState) -> Result<String> {
    let payload = serde_json::to_vec(state)?;
    let body = URL_SAFE_NO_PAD.encode(&payload);
    Ok(format!("{CURSOR_VERSION}.{body}.{}", checksum(&payload)))
}

pub fn decode(cursor: &str) -> Result<CursorState> {
    let mut parts = cursor.splitn(3, '.');
    let (version, body, sum) = match (parts.next(), parts.next(), parts.next()) {
        (Some(v), Some(b), Some(s)) => (v, b, s),
        _ => return Err(TelemetryError::InvalidCursor),
    };
    if version != CURSOR_VERSION {
        return Err(TelemetryError::InvalidCursor);
    }
    let payload = URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|_| TelemetryError::InvalidCursor)?;
    if checksum(&payload) != sum {
        return Err(TelemetryError::InvalidCursor);
    }
    serde_json::from_slice(&payload).map_err(|_| TelemetryError::InvalidCursor)
}

fn checksum(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(CHECKSUM_SALT.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..CHECKSUM_LEN].to_string()
}
