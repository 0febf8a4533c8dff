use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tracing::debug;
use url::Url;

use crate::{
    AcquisitionConfig, AcquisitionError, AcquisitionEvent, Component, CredentialPolicy, EventSink,
    Result,
};

/// One cookie as persisted and injected. Fields the browser reported beyond
/// name/value/domain/path are kept in `extra` but never injected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CookieEntry {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    // Unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_path() -> String {
    "/".to_string()
}

impl CookieEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: default_path(),
            expiry: None,
            extra: serde_json::Map::new(),
        }
    }
}

// Replaced wholesale on save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(rename = "url")]
    pub target_host: String,
    pub cookies: Vec<CookieEntry>,
    #[serde(rename = "save_time", with = "iso_time")]
    pub saved_at: DateTime<Utc>,
    #[serde(default, with = "iso_time::option")]
    pub expires_at: Option<DateTime<Utc>>,
    // Only ever built for a single fetch, never written to disk.
    #[serde(skip)]
    pub basic_auth: Option<BasicAuth>,
}

#[derive(Clone, PartialEq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl CredentialRecord {
    pub fn from_cookie_string(
        host: &str,
        raw: &str,
        now: DateTime<Utc>,
        policy: &CredentialPolicy,
    ) -> (Self, Vec<String>) {
        let parsed = parse_cookie_string(raw, host);
        let record = Self {
            target_host: host.to_string(),
            cookies: parsed.entries,
            saved_at: now,
            expires_at: Some(now + to_chrono(policy.fallback_horizon)),
            basic_auth: None,
        };
        (record, parsed.rejected)
    }

    pub fn basic(host: &str, username: &str, password: &str, now: DateTime<Utc>) -> Self {
        Self {
            target_host: host.to_string(),
            cookies: Vec::new(),
            saved_at: now,
            expires_at: None,
            basic_auth: Some(BasicAuth {
                username: username.to_string(),
                password: password.to_string(),
            }),
        }
    }

    pub fn from_session(
        host: &str,
        session_cookies: &[SessionCookie],
        now: DateTime<Utc>,
        policy: &CredentialPolicy,
    ) -> Self {
        let cookies: Vec<CookieEntry> = session_cookies.iter().map(SessionCookie::to_entry).collect();

        let expires_at = cookies
            .iter()
            .filter_map(|c| c.expiry)
            .min()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(|| now + to_chrono(policy.fallback_horizon));

        Self {
            target_host: host.to_string(),
            cookies,
            saved_at: now,
            expires_at: Some(expires_at),
            basic_auth: None,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => now < expires_at - to_chrono(grace),
            None => false,
        }
    }

    pub fn header_value(&self) -> String {
        self.cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    // None for session-only cookies
    pub expires: Option<f64>,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: Option<String>,
}

impl SessionCookie {
    fn to_entry(&self) -> CookieEntry {
        let mut extra = serde_json::Map::new();
        extra.insert("httpOnly".to_string(), self.http_only.into());
        extra.insert("secure".to_string(), self.secure.into());
        if let Some(same_site) = &self.same_site {
            extra.insert("sameSite".to_string(), same_site.clone().into());
        }

        CookieEntry {
            name: self.name.clone(),
            value: self.value.clone(),
            domain: self.domain.clone(),
            path: if self.path.is_empty() { default_path() } else { self.path.clone() },
            expiry: self.expires.filter(|e| *e > 0.0).map(|e| e as i64),
            extra,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedCookies {
    pub entries: Vec<CookieEntry>,
    pub rejected: Vec<String>,
}

/// Splits on `;`, then on the first `=` of each pair. Segments without `=`
/// or with an empty name land in `rejected`.
pub fn parse_cookie_string(raw: &str, domain: &str) -> ParsedCookies {
    let mut parsed = ParsedCookies::default();

    for pair in raw.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }

        match pair.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                parsed.entries.push(CookieEntry::new(name.trim(), value.trim(), domain));
            }
            _ => parsed.rejected.push(pair.to_string()),
        }
    }

    parsed
}

pub fn host_key(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_ascii_lowercase())
}

#[derive(Debug, Clone)]
struct CachedCredential {
    record: CredentialRecord,
    modified: Option<SystemTime>,
}

// One JSON file per host, cached and revalidated against the file on read
pub struct CookieStore {
    dir: PathBuf,
    policy: CredentialPolicy,
    cache: RwLock<HashMap<String, CachedCredential>>,
    events: Arc<dyn EventSink>,
}

impl CookieStore {
    pub fn new(dir: impl Into<PathBuf>, policy: CredentialPolicy, events: Arc<dyn EventSink>) -> Self {
        Self {
            dir: dir.into(),
            policy,
            cache: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn from_config(config: &AcquisitionConfig, events: Arc<dyn EventSink>) -> Self {
        Self::new(config.cookie_dir.clone(), config.credentials.clone(), events)
    }

    pub fn path_for(&self, host: &str) -> PathBuf {
        let file_name: String = host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }

    // Missing or malformed files read as absent
    pub fn load(&self, host: &str) -> Option<CredentialRecord> {
        let path = self.path_for(host);
        let modified = match std::fs::metadata(&path) {
            Ok(meta) => meta.modified().ok(),
            Err(_) => {
                self.forget(host);
                return None;
            }
        };

        if let Ok(cache) = self.cache.read() {
            if let Some(cached) = cache.get(host) {
                if cached.modified.is_some() && cached.modified == modified {
                    return Some(cached.record.clone());
                }
            }
        }

        let record = match std::fs::read_to_string(&path)
            .map_err(AcquisitionError::from)
            .and_then(|content| serde_json::from_str::<CredentialRecord>(&content).map_err(AcquisitionError::from))
        {
            Ok(record) => record,
            Err(e) => {
                debug!(host, path = %path.display(), error = %e, "ignoring unreadable credential file");
                self.forget(host);
                return None;
            }
        };

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(host.to_string(), CachedCredential { record: record.clone(), modified });
        }
        Some(record)
    }

    pub fn is_valid(&self, record: &CredentialRecord) -> bool {
        record.is_valid_at(Utc::now(), self.policy.grace_window)
    }

    // Expired or cookie-less records are reported and treated as absent
    pub fn valid_credential(&self, host: &str) -> Option<CredentialRecord> {
        let record = self.load(host)?;

        let reason = if record.cookies.is_empty() {
            Some("record holds no cookies")
        } else if !self.is_valid(&record) {
            Some("expired or inside grace window")
        } else {
            None
        };

        match reason {
            Some(reason) => {
                let err = AcquisitionError::CredentialInvalid {
                    host: host.to_string(),
                    reason: reason.to_string(),
                };
                self.events.emit(AcquisitionEvent::CredentialRejected {
                    host: host.to_string(),
                    reason: err.to_string(),
                });
                None
            }
            None => Some(record),
        }
    }

    pub fn save_manual(&self, host: &str, raw_cookie_string: &str) -> Option<CredentialRecord> {
        let (record, rejected) =
            CredentialRecord::from_cookie_string(host, raw_cookie_string, Utc::now(), &self.policy);

        for segment in rejected {
            self.events.emit(AcquisitionEvent::ParseFailed {
                component: Component::CookieStore,
                reason: format!("dropping cookie segment without '=': {}", segment),
            });
        }

        self.persist_or_report(record)
    }

    pub fn save_from_session(&self, host: &str, session_cookies: &[SessionCookie]) -> Option<CredentialRecord> {
        let record = CredentialRecord::from_session(host, session_cookies, Utc::now(), &self.policy);
        self.persist_or_report(record)
    }

    fn persist_or_report(&self, record: CredentialRecord) -> Option<CredentialRecord> {
        let host = record.target_host.clone();

        if record.cookies.is_empty() {
            self.events.emit(AcquisitionEvent::CredentialSaveFailed {
                host,
                reason: "no valid cookies to save".to_string(),
            });
            return None;
        }

        match self.persist(&record) {
            Ok(()) => {
                self.events.emit(AcquisitionEvent::CredentialSaved {
                    host,
                    cookies: record.cookies.len(),
                });
                Some(record)
            }
            Err(e) => {
                self.events.emit(AcquisitionEvent::CredentialSaveFailed {
                    host,
                    reason: e.to_string(),
                });
                None
            }
        }
    }

    fn persist(&self, record: &CredentialRecord) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let path = self.path_for(&record.target_host);
        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(&path, json)?;

        let modified = std::fs::metadata(&path).ok().and_then(|m| m.modified().ok());
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(
                record.target_host.clone(),
                CachedCredential { record: record.clone(), modified },
            );
        }
        Ok(())
    }

    fn forget(&self, host: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(host);
        }
    }
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::zero())
}

// Writes RFC 3339, and reads the naive local timestamps of older files
mod iso_time {
    use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(value: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
            return Some(dt.with_timezone(&Utc));
        }
        let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
        Local.from_local_datetime(&naive).earliest().map(|dt| dt.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(dt) => serializer.serialize_some(&dt.to_rfc3339()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => parse(&raw)
                    .map(Some)
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw))),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingSink;
    use std::path::Path;

    fn store(dir: &Path) -> (CookieStore, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (CookieStore::new(dir, CredentialPolicy::default(), sink.clone()), sink)
    }

    #[test]
    fn test_parse_cookie_string() {
        let parsed = parse_cookie_string("a=1; b=2", "example.com");

        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[0].name, "a");
        assert_eq!(parsed.entries[0].value, "1");
        assert_eq!(parsed.entries[1].name, "b");
        assert_eq!(parsed.entries[1].domain, "example.com");
        assert_eq!(parsed.entries[1].path, "/");
        assert!(parsed.rejected.is_empty());
    }

    #[test]
    fn test_parse_splits_on_first_equals() {
        let parsed = parse_cookie_string("sid_guard=abc%7C1=2; ttwid=1|x", "toutiao.com");

        assert_eq!(parsed.entries[0].name, "sid_guard");
        assert_eq!(parsed.entries[0].value, "abc%7C1=2");
        assert_eq!(parsed.entries[1].value, "1|x");
    }

    #[test]
    fn test_parse_drops_malformed_segments() {
        let parsed = parse_cookie_string("a=1; novaluehere; ; =orphan; b=", "example.com");

        let names: Vec<_> = parsed.entries.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(parsed.entries[1].value, "");
        assert_eq!(parsed.rejected, vec!["novaluehere".to_string(), "=orphan".to_string()]);
    }

    #[test]
    fn test_validity_boundary() {
        let now = Utc::now();
        let grace = Duration::from_secs(300);
        let record = CredentialRecord {
            target_host: "example.com".to_string(),
            cookies: vec![CookieEntry::new("a", "1", "example.com")],
            saved_at: now,
            expires_at: Some(now + ChronoDuration::minutes(10)),
            basic_auth: None,
        };
        let boundary = now + ChronoDuration::minutes(5);

        assert!(!record.is_valid_at(boundary, grace));
        assert!(record.is_valid_at(boundary - ChronoDuration::milliseconds(1), grace));
        assert!(!record.is_valid_at(boundary + ChronoDuration::seconds(1), grace));

        let no_expiry = CredentialRecord { expires_at: None, ..record };
        assert!(!no_expiry.is_valid_at(now, grace));
    }

    #[test]
    fn test_save_manual_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());

        let saved = store.save_manual("so.toutiao.com", "tt_webid=75; csrftoken=c8").unwrap();
        let loaded = store.load("so.toutiao.com").unwrap();

        assert_eq!(loaded.cookies, parse_cookie_string("tt_webid=75; csrftoken=c8", "so.toutiao.com").entries);
        assert_eq!(loaded.target_host, "so.toutiao.com");
        assert_eq!(loaded.expires_at, saved.expires_at);
        assert!(store.is_valid(&loaded));

        let horizon = loaded.expires_at.unwrap() - loaded.saved_at;
        assert_eq!(horizon, ChronoDuration::days(7));
    }

    #[test]
    fn test_save_overwrites_without_merge() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());

        store.save_manual("example.com", "a=1; b=2").unwrap();
        store.save_manual("example.com", "c=3").unwrap();

        let loaded = store.load("example.com").unwrap();
        assert_eq!(loaded.cookies.len(), 1);
        assert_eq!(loaded.cookies[0].name, "c");
    }

    #[test]
    fn test_save_with_nothing_parseable_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (store, sink) = store(dir.path());

        assert!(store.save_manual("example.com", "novaluehere").is_none());
        assert!(store.load("example.com").is_none());
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, AcquisitionEvent::CredentialSaveFailed { .. })));
    }

    #[test]
    fn test_save_failure_is_not_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let (store, _) = store(&blocker);

        assert!(store.save_manual("example.com", "a=1").is_none());
    }

    #[test]
    fn test_load_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());

        assert!(store.load("missing.com").is_none());

        std::fs::write(store.path_for("broken.com"), "{ not json").unwrap();
        assert!(store.load("broken.com").is_none());
    }

    #[test]
    fn test_load_accepts_naive_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        let json = r#"{
            "url": "https://seekingalpha.com/news",
            "cookies": [{"name": "a", "value": "1", "domain": "seekingalpha.com", "path": "/", "sameSite": "Lax"}],
            "save_time": "2025-11-18T10:00:00.123456",
            "expires_at": null
        }"#;
        std::fs::write(store.path_for("seekingalpha.com"), json).unwrap();

        let loaded = store.load("seekingalpha.com").unwrap();
        assert_eq!(loaded.cookies[0].extra.get("sameSite").unwrap(), "Lax");
        assert!(loaded.expires_at.is_none());
        assert!(!store.is_valid(&loaded));
        assert!(store.valid_credential("seekingalpha.com").is_none());
    }

    #[test]
    fn test_save_from_session_uses_earliest_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        let soon = Utc::now().timestamp() + 3600;
        let later = soon + 86_400;

        let cookies = vec![
            SessionCookie {
                name: "sid".into(),
                value: "x".into(),
                domain: ".example.com".into(),
                path: "/".into(),
                expires: Some(later as f64),
                http_only: true,
                secure: true,
                same_site: Some("Strict".into()),
            },
            SessionCookie {
                name: "csrf".into(),
                value: "y".into(),
                domain: ".example.com".into(),
                path: "".into(),
                expires: Some(soon as f64),
                http_only: false,
                secure: false,
                same_site: None,
            },
            SessionCookie {
                name: "tmp".into(),
                value: "z".into(),
                domain: ".example.com".into(),
                path: "/".into(),
                expires: None,
                http_only: false,
                secure: false,
                same_site: None,
            },
        ];

        let record = store.save_from_session("example.com", &cookies).unwrap();
        assert_eq!(record.expires_at.unwrap().timestamp(), soon);
        assert_eq!(record.cookies[1].path, "/");
        assert_eq!(record.cookies[0].extra.get("httpOnly").unwrap(), true);
    }

    #[test]
    fn test_save_from_session_without_expiry_uses_horizon() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        let cookies = vec![SessionCookie {
            name: "tmp".into(),
            value: "z".into(),
            domain: "example.com".into(),
            path: "/".into(),
            expires: Some(-1.0),
            http_only: false,
            secure: false,
            same_site: None,
        }];

        let record = store.save_from_session("example.com", &cookies).unwrap();
        assert_eq!(record.expires_at.unwrap() - record.saved_at, ChronoDuration::days(7));
    }

    #[test]
    fn test_valid_credential_rejects_expired() {
        let dir = tempfile::tempdir().unwrap();
        let (store, sink) = store(dir.path());
        let expired = CredentialRecord {
            target_host: "example.com".into(),
            cookies: vec![CookieEntry::new("a", "1", "example.com")],
            saved_at: Utc::now() - ChronoDuration::days(8),
            expires_at: Some(Utc::now() + ChronoDuration::minutes(2)),
            basic_auth: None,
        };
        store.persist(&expired).unwrap();

        assert!(store.valid_credential("example.com").is_none());
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, AcquisitionEvent::CredentialRejected { .. })));
    }

    #[test]
    fn test_header_value_and_host_key() {
        let (record, _) = CredentialRecord::from_cookie_string(
            "example.com",
            "a=1; b=2",
            Utc::now(),
            &CredentialPolicy::default(),
        );
        assert_eq!(record.header_value(), "a=1; b=2");

        let url = Url::parse("https://So.Toutiao.com/search?keyword=x").unwrap();
        assert_eq!(host_key(&url).as_deref(), Some("so.toutiao.com"));
    }

    #[test]
    fn test_basic_auth_is_never_serialized() {
        let record = CredentialRecord::basic("intranet.example.com", "analyst", "s3cret", Utc::now());

        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("s3cret"));
        assert!(!json.contains("analyst"));
        assert!(!format!("{:?}", record).contains("s3cret"));

        let parsed: CredentialRecord = serde_json::from_str(&json).unwrap();
        assert!(parsed.basic_auth.is_none());
        assert!(parsed.cookies.is_empty());
    }
}
