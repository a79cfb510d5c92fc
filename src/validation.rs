use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::{
    config::Config,
    error::{Result, TelemetryError},
    keys,
    store::{EventRecord, PayloadBlob},
};

pub const UNKNOWN_DOMAIN: &str = "UNKNOWN";
const SIGNATURE_VERSION: &str = "v1";

// Everything is optional at the wire level; the validator decides what is
// required.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub event_id: Option<String>,
    pub install_id: Option<String>,
    pub session_id: Option<String>,
    pub severity: Option<String>,
    pub rule_id: Option<String>,
    pub ruleset_id: Option<String>,
    pub score_delta: Option<Value>,
    pub timestamp_ms: Option<i64>,
    // Epoch-seconds fallback from older sensor builds.
    pub timestamp: Option<i64>,
    pub origin: Option<String>,
    pub page: Option<String>,
    pub user_agent: Option<String>,
    pub payload: Option<Value>,
}

pub struct Validator {
    score_cap: f64,
    payload_budget_bytes: usize,
    max_request_bytes: usize,
    event_shards: u32,
    event_ttl_days: i64,
    signing_key: Option<String>,
}

impl Validator {
    pub fn from_config(config: &Config) -> Self {
        Self {
            score_cap: config.score_cap,
            payload_budget_bytes: config.payload_budget_bytes,
            max_request_bytes: config.max_request_bytes,
            event_shards: config.event_shards,
            event_ttl_days: config.event_ttl_days,
            signing_key: config.ingest_signing_key.clone(),
        }
    }

    pub fn max_request_bytes(&self) -> usize {
        self.max_request_bytes
    }

    pub fn ensure_request_size(&self, body_len: usize) -> Result<()> {
        if body_len > self.max_request_bytes {
            return Err(TelemetryError::PayloadTooLarge(self.max_request_bytes));
        }
        Ok(())
    }

    // Keyed SHA-256 over the canonical pipe-joined string, hex-encoded,
    // compared in constant time.
    pub fn verify_signature(&self, raw: &RawEvent, signature: Option<&str>) -> Result<()> {
        let Some(key) = self.signing_key.as_deref() else {
            return Ok(());
        };
        let Some(signature) = signature else {
            return Err(TelemetryError::InvalidSignature);
        };

        let expected = hex::encode(Sha256::digest(
            format!("{key}|{}", self.canonical_string(raw)).as_bytes(),
        ));
        if expected.as_bytes().ct_eq(signature.as_bytes()).into() {
            Ok(())
        } else {
            Err(TelemetryError::InvalidSignature)
        }
    }

    pub fn canonical_string(&self, raw: &RawEvent) -> String {
        let timestamp_ms = raw
            .timestamp_ms
            .or(raw.timestamp)
            .and_then(keys::normalize_timestamp)
            .unwrap_or(0);
        [
            SIGNATURE_VERSION.to_string(),
            raw.event_id.clone().unwrap_or_default(),
            timestamp_ms.to_string(),
            raw.install_id.clone().unwrap_or_default(),
            raw.session_id.clone().unwrap_or_default(),
            raw.event_type.clone().unwrap_or_default(),
            raw.rule_id.clone().unwrap_or_default(),
            raw.severity.clone().unwrap_or_default(),
            format_score(score_value(raw.score_delta.as_ref())),
        ]
        .join("|")
    }

    pub fn validate(&self, raw: RawEvent) -> Result<EventRecord> {
        let event_type = required(raw.event_type, "type")?;
        let event_id = required(raw.event_id, "eventId")?;
        let install_id = required(raw.install_id, "installId")?;
        let severity = required(raw.severity, "severity")?;
        let rule_id = required(raw.rule_id, "ruleId")?;
        let timestamp_ms = raw
            .timestamp_ms
            .or(raw.timestamp)
            .and_then(keys::normalize_timestamp)
            .ok_or(TelemetryError::MissingField("timestampMs"))?;

        let page = raw.page.unwrap_or_default();
        let domain = derive_domain(&page);
        let score_delta = score_value(raw.score_delta.as_ref()).clamp(0.0, self.score_cap);
        let day = keys::day_bucket(timestamp_ms);
        let shard = keys::shard_of(&event_id, self.event_shards);
        let expires_at = timestamp_ms / 1000 + self.event_ttl_days * 86_400;
        let payload = self.build_payload(raw.payload);

        Ok(EventRecord {
            event_id,
            event_type,
            rule_id,
            ruleset_id: raw.ruleset_id,
            severity,
            score_delta,
            install_id,
            session_id: raw.session_id.unwrap_or_default(),
            origin: raw.origin.unwrap_or_default(),
            domain,
            page,
            user_agent: raw.user_agent.unwrap_or_default(),
            timestamp_ms,
            day,
            shard,
            expires_at,
            payload,
        })
    }

    fn build_payload(&self, payload: Option<Value>) -> PayloadBlob {
        let body = match payload {
            Some(Value::String(text)) => text,
            Some(value) => value.to_string(),
            None => String::new(),
        };
        let hash = hex::encode(Sha256::digest(body.as_bytes()));
        if body.len() <= self.payload_budget_bytes {
            return PayloadBlob {
                body,
                hash,
                truncated: false,
            };
        }
        let mut cut = self.payload_budget_bytes;
        while cut > 0 && !body.is_char_boundary(cut) {
            cut -= 1;
        }
        PayloadBlob {
            body: body[..cut].to_string(),
            hash,
            truncated: true,
        }
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String> {
    match value {
        // Control characters are rejected outright: these fields become key
        // segments, and an embedded 0x1F would let a client forge rows inside
        // another partition.
        Some(v) if v.chars().any(|c| c.is_ascii_control()) => {
            Err(TelemetryError::InvalidField(field))
        }
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(TelemetryError::MissingField(field)),
    }
}

fn score_value(raw: Option<&Value>) -> f64 {
    let value = match raw {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        // "NaN" and "inf" parse successfully; non-finite scores would poison
        // aggregate sums, so they collapse to zero like any other junk input.
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    if value.is_finite() { value } else { 0.0 }
}

fn format_score(score: f64) -> String {
    if score.fract() == 0.0 && score.abs() < 1e15 {
        format!("{}", score as i64)
    } else {
        format!("{score}")
    }
}

/// Top two labels of the page URL's host, lowercased; unparsable input maps
/// to [`UNKNOWN_DOMAIN`].
pub fn derive_domain(page: &str) -> String {
    let Some(rest) = page.split_once("://").map(|(_, rest)| rest) else {
        return UNKNOWN_DOMAIN.to_string();
    };
    let host = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .rsplit('@')
        .next()
        .unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default().to_lowercase();
    // The derived domain is also a key segment.
    if host.chars().any(|c| c.is_ascii_control()) {
        return UNKNOWN_DOMAIN.to_string();
    }
    if host.is_empty() || host.parse::<std::net::IpAddr>().is_ok() {
        return if host.is_empty() {
            UNKNOWN_DOMAIN.to_string()
        } else {
            host
        };
    }
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    match labels.len() {
        0 => UNKNOWN_DOMAIN.to_string(),
        1 => labels[0].to_string(),
        n => format!("{}.{}", labels[n - 2], labels[n - 1]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> Validator {
        let mut config = Config::default();
        config.score_cap = 50.0;
        config.payload_budget_bytes = 16;
        Validator::from_config(&config)
    }

    fn raw_event() -> RawEvent {
        serde_json::from_value(json!({
            "type": "dom.injection",
            "eventId": "E1",
            "installId": "I1",
            "sessionId": "S1",
            "severity": "HIGH",
            "ruleId": "R1",
            "scoreDelta": 9999,
            "timestampMs": 1_785_585_600_000i64,
            "origin": "ext",
            "page": "https://shop.Example.COM:8443/cart?x=1",
            "userAgent": "ua"
        }))
        .unwrap()
    }

    #[test]
    fn derives_day_shard_domain_and_clamps_score() {
        let record = validator().validate(raw_event()).unwrap();
        assert_eq!(record.day, "2026-08-01");
        assert_eq!(record.domain, "example.com");
        assert!((record.score_delta - 50.0).abs() < f64::EPSILON);
        assert!(record.shard < crate::config::DEFAULT_EVENT_SHARDS);
        assert_eq!(record.expires_at, 1_785_585_600 + 90 * 86_400);
    }

    #[test]
    fn non_finite_scores_collapse_to_zero() {
        for junk in ["NaN", "inf", "-inf", "infinity"] {
            let mut raw = raw_event();
            raw.score_delta = Some(json!(junk));
            let record = validator().validate(raw).unwrap();
            assert_eq!(record.score_delta, 0.0, "scoreDelta {junk:?}");
            // The stored record must survive a JSON round trip; a NaN score
            // would serialize as null and make the event unreadable.
            let bytes = serde_json::to_vec(&record).unwrap();
            let back: EventRecord = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(back.score_delta, 0.0);
        }

        let mut raw = raw_event();
        raw.score_delta = Some(json!("-3"));
        let record = validator().validate(raw).unwrap();
        assert_eq!(record.score_delta, 0.0);
    }

    #[test]
    fn control_characters_in_key_fields_are_rejected() {
        let mut raw = raw_event();
        raw.install_id = Some("victim\u{1F}2026-08-02".to_string());
        let err = validator().validate(raw).unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidField("installId")));

        let mut raw = raw_event();
        raw.event_id = Some("evt\n1".to_string());
        let err = validator().validate(raw).unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidField("eventId")));

        let mut raw = raw_event();
        raw.severity = Some("HIGH\u{1F}X".to_string());
        assert!(validator().validate(raw).is_err());

        // A crafted host never leaks separators into the domain dimension.
        assert_eq!(
            derive_domain("https://evil\u{1F}example.com/"),
            UNKNOWN_DOMAIN
        );
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let mut raw = raw_event();
        raw.install_id = None;
        let err = validator().validate(raw).unwrap_err();
        assert!(matches!(err, TelemetryError::MissingField("installId")));

        let mut raw = raw_event();
        raw.severity = Some("   ".to_string());
        let err = validator().validate(raw).unwrap_err();
        assert!(matches!(err, TelemetryError::MissingField("severity")));
    }

    #[test]
    fn accepts_epoch_seconds_fallback() {
        let mut raw = raw_event();
        raw.timestamp_ms = None;
        raw.timestamp = Some(1_785_585_600);
        let record = validator().validate(raw).unwrap();
        assert_eq!(record.timestamp_ms, 1_785_585_600_000);

        let mut raw = raw_event();
        raw.timestamp_ms = None;
        raw.timestamp = None;
        let err = validator().validate(raw).unwrap_err();
        assert!(matches!(err, TelemetryError::MissingField("timestampMs")));
    }

    #[test]
    fn payload_is_truncated_but_hash_covers_full_body() {
        let mut raw = raw_event();
        raw.payload = Some(json!("0123456789abcdefOVERFLOW"));
        let record = validator().validate(raw).unwrap();
        assert!(record.payload.truncated);
        assert_eq!(record.payload.body, "0123456789abcdef");
        let full_hash = hex::encode(Sha256::digest(b"0123456789abcdefOVERFLOW"));
        assert_eq!(record.payload.hash, full_hash);
    }

    #[test]
    fn domain_derivation_handles_edge_cases() {
        assert_eq!(derive_domain("https://a.b.example.org/x"), "example.org");
        assert_eq!(derive_domain("http://localhost:3000/"), "localhost");
        assert_eq!(derive_domain("not a url"), UNKNOWN_DOMAIN);
        assert_eq!(derive_domain(""), UNKNOWN_DOMAIN);
        assert_eq!(derive_domain("https://127.0.0.1:8080/"), "127.0.0.1");
    }

    #[test]
    fn signature_verification_is_enforced_when_configured() {
        let mut config = Config::default();
        config.ingest_signing_key = Some("secret".to_string());
        let validator = Validator::from_config(&config);
        let raw = raw_event();

        let canonical = validator.canonical_string(&raw);
        let good = hex::encode(Sha256::digest(format!("secret|{canonical}").as_bytes()));

        validator
            .verify_signature(&raw, Some(&good))
            .expect("valid signature accepted");
        assert!(matches!(
            validator.verify_signature(&raw, Some("deadbeef")),
            Err(TelemetryError::InvalidSignature)
        ));
        assert!(matches!(
            validator.verify_signature(&raw, None),
            Err(TelemetryError::InvalidSignature)
        ));
    }

    #[test]
    fn oversize_bodies_are_rejected_before_parsing() {
        let mut config = Config::default();
        config.max_request_bytes = 64;
        let validator = Validator::from_config(&config);
        validator.ensure_request_size(64).unwrap();
        assert!(matches!(
            validator.ensure_request_size(65),
            Err(TelemetryError::PayloadTooLarge(64))
        ));
    }

    #[test]
    fn unsigned_deployments_skip_verification() {
        let validator = validator();
        validator.verify_signature(&raw_event(), None).unwrap();
    }
}
