// Display joins are strictly best-effort: a missing pack, unreadable file,
// or unknown rule never fails a query, the item just carries no display.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Display {
    pub title: String,
    pub one_line: String,
    pub locale: String,
}

// Flat title/oneLine is the base text; i18n holds per-locale overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackEntry {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    one_line: Option<String>,
    #[serde(default)]
    i18n: HashMap<String, LocaleText>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocaleText {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    one_line: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RulepackDoc {
    #[serde(default)]
    rules: Vec<PackEntry>,
    #[serde(default)]
    signals: Vec<PackEntry>,
    #[serde(default)]
    combos: Vec<PackEntry>,
}

impl RulepackDoc {
    fn find(&self, rule_id: &str) -> Option<&PackEntry> {
        self.rules
            .iter()
            .chain(self.signals.iter())
            .chain(self.combos.iter())
            .find(|entry| entry.id == rule_id)
    }
}

struct CacheEntry {
    // None caches a load failure so a missing pack is not re-read on every
    // request.
    doc: Option<Arc<RulepackDoc>>,
    loaded_at: Instant,
}

// Refreshes race freely; last writer wins, every writer loads the same file.
pub struct RulepackCache {
    dir: PathBuf,
    ttl: Duration,
    default_locale: String,
    fallback_locale: String,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl RulepackCache {
    pub fn new(config: &Config) -> Self {
        Self {
            dir: config.rulepack_dir(),
            ttl: Duration::from_secs(config.rulepack_ttl_secs.max(0) as u64),
            default_locale: config.default_locale.clone(),
            fallback_locale: config.fallback_locale.clone(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Walks the locale chain requested -> fallback -> default -> en ->
    /// en-US, then the entry's flat base text.
    pub fn display(
        &self,
        ruleset_id: &str,
        rule_id: &str,
        requested_locale: Option<&str>,
    ) -> Option<Display> {
        let doc = self.load(ruleset_id)?;
        let entry = doc.find(rule_id)?;

        let mut chain: Vec<&str> = Vec::with_capacity(5);
        for locale in [
            requested_locale.unwrap_or(""),
            self.fallback_locale.as_str(),
            self.default_locale.as_str(),
            "en",
            "en-US",
        ] {
            if !locale.is_empty() && !chain.contains(&locale) {
                chain.push(locale);
            }
        }

        for locale in &chain {
            if let Some(text) = entry.i18n.get(*locale) {
                if let (Some(title), Some(one_line)) = (&text.title, &text.one_line) {
                    return Some(Display {
                        title: title.clone(),
                        one_line: one_line.clone(),
                        locale: (*locale).to_string(),
                    });
                }
            }
        }

        match (&entry.title, &entry.one_line) {
            (Some(title), Some(one_line)) => Some(Display {
                title: title.clone(),
                one_line: one_line.clone(),
                locale: self.default_locale.clone(),
            }),
            _ => None,
        }
    }

    fn load(&self, ruleset_id: &str) -> Option<Arc<RulepackDoc>> {
        if !valid_pack_id(ruleset_id) {
            debug!(ruleset_id, "rejecting suspicious rulepack id");
            return None;
        }

        {
            let entries = self.entries.lock();
            if let Some(entry) = entries.get(ruleset_id) {
                if entry.loaded_at.elapsed() < self.ttl {
                    return entry.doc.clone();
                }
            }
        }

        let doc = read_pack(&self.dir.join(format!("{ruleset_id}.json")))
            .map_err(|err| warn!(ruleset_id, "failed to load rulepack: {err}"))
            .ok()
            .map(Arc::new);

        let mut entries = self.entries.lock();
        entries.insert(
            ruleset_id.to_string(),
            CacheEntry {
                doc: doc.clone(),
                loaded_at: Instant::now(),
            },
        );
        doc
    }

    #[cfg(test)]
    fn backdate(&self, ruleset_id: &str, age: Duration) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(ruleset_id) {
            entry.loaded_at = Instant::now() - age;
        }
    }
}

fn read_pack(path: &Path) -> std::io::Result<RulepackDoc> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(std::io::Error::other)
}

// Pack ids become file names; keep them to a conservative charset.
fn valid_pack_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !id.contains("..")
}

// Explicit locale query parameter first, then the primary language subtag
// of Accept-Language, then the configured default.
pub fn resolve_locale<'a>(
    query_locale: Option<&'a str>,
    accept_language: Option<&'a str>,
    default_locale: &'a str,
) -> &'a str {
    if let Some(locale) = query_locale {
        let locale = locale.trim();
        if !locale.is_empty() {
            return locale;
        }
    }
    if let Some(header) = accept_language {
        // "fr-CH,fr;q=0.9" resolves to "fr": bundles are keyed by language,
        // not by region.
        let primary = header
            .split(',')
            .next()
            .and_then(|part| part.split(';').next())
            .map(str::trim)
            .and_then(|tag| tag.split(['-', '_']).next())
            .unwrap_or("");
        if !primary.is_empty() && primary != "*" {
            return primary;
        }
    }
    default_locale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    fn cache_with_pack(body: &str) -> (TempDir, RulepackCache) {
        let dir = TempDir::new().expect("tempdir");
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        fs::create_dir_all(config.rulepack_dir()).expect("rulepack dir");
        fs::write(config.rulepack_dir().join("pack-1.json"), body).expect("write pack");
        let cache = RulepackCache::new(&config);
        (dir, cache)
    }

    const PACK: &str = r#"{
        "rules": [
            {
                "id": "rule.phish",
                "title": "Phishing page",
                "oneLine": "A known phishing page was blocked",
                "i18n": {
                    "de": {"title": "Phishing-Seite", "oneLine": "Eine Phishing-Seite wurde blockiert"},
                    "en-US": {"title": "Phishing page", "oneLine": "Blocked a known phishing page"}
                }
            }
        ],
        "signals": [
            {"id": "sig.obfuscation", "title": "Obfuscated script", "oneLine": "Heavily obfuscated script detected"}
        ]
    }"#;

    #[test]
    fn resolves_requested_locale() {
        let (_dir, cache) = cache_with_pack(PACK);
        let display = cache
            .display("pack-1", "rule.phish", Some("de"))
            .expect("display");
        assert_eq!(display.title, "Phishing-Seite");
        assert_eq!(display.locale, "de");
    }

    #[test]
    fn falls_back_through_locale_chain() {
        let (_dir, cache) = cache_with_pack(PACK);
        // "fr" is absent; chain lands on the en-US bundle.
        let display = cache
            .display("pack-1", "rule.phish", Some("fr"))
            .expect("display");
        assert_eq!(display.one_line, "Blocked a known phishing page");
        assert_eq!(display.locale, "en-US");
    }

    #[test]
    fn flat_text_is_the_last_resort() {
        let (_dir, cache) = cache_with_pack(PACK);
        let display = cache
            .display("pack-1", "sig.obfuscation", Some("de"))
            .expect("display");
        assert_eq!(display.title, "Obfuscated script");
        assert_eq!(display.locale, "en");
    }

    #[test]
    fn unknown_rule_and_missing_pack_yield_none() {
        let (_dir, cache) = cache_with_pack(PACK);
        assert!(cache.display("pack-1", "rule.unknown", None).is_none());
        assert!(cache.display("pack-2", "rule.phish", None).is_none());
        assert!(cache.display("../etc/passwd", "rule.phish", None).is_none());
    }

    #[test]
    fn expired_entries_are_reloaded() {
        let (dir, cache) = cache_with_pack(PACK);
        assert!(cache.display("pack-1", "rule.phish", None).is_some());

        let path = dir.path().join("rulepacks/pack-1.json");
        fs::write(
            &path,
            r#"{"rules": [{"id": "rule.phish", "title": "Updated", "oneLine": "Updated line"}]}"#,
        )
        .expect("rewrite pack");

        // Within the TTL the stale document is still served.
        let display = cache.display("pack-1", "rule.phish", None).expect("display");
        assert_eq!(display.title, "Phishing page");

        cache.backdate("pack-1", Duration::from_secs(3600));
        let display = cache.display("pack-1", "rule.phish", None).expect("display");
        assert_eq!(display.title, "Updated");
    }

    #[test]
    fn locale_resolution_order() {
        assert_eq!(resolve_locale(Some("de"), Some("fr"), "en"), "de");
        assert_eq!(resolve_locale(None, Some("fr-CH,fr;q=0.9"), "en"), "fr");
        assert_eq!(resolve_locale(None, Some("de_AT"), "en"), "de");
        assert_eq!(resolve_locale(Some("  "), Some("*"), "en"), "en");
        assert_eq!(resolve_locale(None, None, "en"), "en");
    }
}
