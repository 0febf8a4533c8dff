use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cookies::{host_key, CredentialRecord};
use crate::extractor::{ContentExtractor, ContentRecord};
use crate::rate_limiter::Pacer;
use crate::search::{SearchCandidate, SearchMode, SearchSource};
use crate::{
    AcquisitionConfig, AcquisitionError, AcquisitionEvent, CredentialPolicy, EventSink, JobState, Result,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryJob {
    pub query: String,
    #[serde(default)]
    pub mode: SearchMode,
}

impl QueryJob {
    pub fn new(query: impl Into<String>, mode: SearchMode) -> Self {
        Self {
            query: query.into(),
            mode,
        }
    }
}

/// A page fetched directly, without a search step. Credentials given here
/// are used for this fetch only. A cookie string wins over a username and
/// password, which only the plain HTTP fetcher sends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageTarget {
    pub url: String,
    #[serde(default)]
    pub cookie: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TargetFile {
    Many(Vec<PageTarget>),
    One(PageTarget),
}

// One target object or an array of them
pub fn load_page_targets(path: impl AsRef<Path>) -> Result<Vec<PageTarget>> {
    let raw = std::fs::read_to_string(path)?;
    let targets = match serde_json::from_str::<TargetFile>(&raw)? {
        TargetFile::Many(targets) => targets,
        TargetFile::One(target) => vec![target],
    };
    Ok(targets)
}

// Running total of body characters gathered for one job
struct Budget {
    limit: Option<usize>,
    used: usize,
}

impl Budget {
    fn new(limit: Option<usize>) -> Self {
        Self { limit, used: 0 }
    }

    // The record that crossed the limit is kept
    fn exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.used > limit)
    }

    fn add(&mut self, record: &ContentRecord) {
        self.used += record.budget_len();
    }
}

// Drives query jobs through search and extraction on a fixed number of workers
pub struct AcquisitionOrchestrator {
    config: Arc<AcquisitionConfig>,
    search: Arc<dyn SearchSource>,
    extractor: Arc<ContentExtractor>,
    pacer: Arc<Pacer>,
    events: Arc<dyn EventSink>,
}

impl Clone for AcquisitionOrchestrator {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            search: self.search.clone(),
            extractor: self.extractor.clone(),
            pacer: self.pacer.clone(),
            events: self.events.clone(),
        }
    }
}

impl AcquisitionOrchestrator {
    pub fn new(
        config: Arc<AcquisitionConfig>,
        search: Arc<dyn SearchSource>,
        extractor: Arc<ContentExtractor>,
        pacer: Arc<Pacer>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            search,
            extractor,
            pacer,
            events,
        }
    }

    // Keyed by query in input order; repeated queries share one entry
    pub async fn acquire(&self, jobs: Vec<QueryJob>) -> IndexMap<String, Vec<ContentRecord>> {
        let mut results: IndexMap<String, Vec<ContentRecord>> = IndexMap::new();
        for job in &jobs {
            results.entry(job.query.clone()).or_default();
        }

        if jobs.is_empty() {
            return results;
        }

        let worker_count = self.config.workers.max(1).min(jobs.len());
        let queue = Arc::new(Mutex::new(jobs.into_iter().enumerate().collect::<VecDeque<_>>()));
        let (tx, mut rx) = mpsc::channel(worker_count * 2);

        info!("Starting {} workers for {} queries", worker_count, results.len());

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let orchestrator = self.clone();
            let queue = queue.clone();
            let tx = tx.clone();

            workers.spawn(async move {
                loop {
                    let next = match queue.lock() {
                        Ok(mut queue) => queue.pop_front(),
                        Err(_) => None,
                    };
                    let Some((index, job)) = next else {
                        break;
                    };

                    debug!("Worker {} took query {}", worker_id, job.query);
                    let records = orchestrator.acquire_job(&job).await;

                    if tx.send((index, job.query, records)).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut finished = Vec::new();
        while let Some(result) = rx.recv().await {
            finished.push(result);
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }

        finished.sort_by_key(|(index, _, _)| *index);
        for (_, query, records) in finished {
            results.entry(query).or_default().extend(records);
        }

        results
    }

    /// Searches one query and extracts its candidates in order until the
    /// candidates run out or the token budget is spent. Never fails: a
    /// search error or a browser that will not start ends the job early
    /// with whatever was gathered.
    pub async fn acquire_job(&self, job: &QueryJob) -> Vec<ContentRecord> {
        self.set_state(job, JobState::Pending);
        self.pacer.before_search().await;

        self.set_state(job, JobState::Searching);
        let candidates = match self.search.search(&job.query, job.mode).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Search for {} failed: {}", job.query, e);
                self.set_state(job, JobState::Done);
                return Vec::new();
            }
        };

        self.set_state(job, JobState::Extracting);
        let records = self.extract_within_budget(job, candidates).await;

        info!("Query {} produced {} records", job.query, records.len());
        self.set_state(job, JobState::Done);
        records
    }

    async fn extract_within_budget(&self, job: &QueryJob, candidates: Vec<SearchCandidate>) -> Vec<ContentRecord> {
        let mut budget = Budget::new(self.config.token_budget);
        let mut records = Vec::new();

        'candidates: for candidate in candidates {
            if budget.exhausted() {
                self.report_budget(job, &budget);
                break;
            }

            if candidate.inline_content().is_none() {
                self.pacer.before_fetch(&candidate.url).await;
            }

            match self.extractor.extract(&candidate).await {
                Ok(extracted) => {
                    for record in extracted {
                        if budget.exhausted() {
                            self.report_budget(job, &budget);
                            break 'candidates;
                        }
                        budget.add(&record);
                        records.push(record);
                    }
                }
                Err(e) if e.is_fatal_for_job() => {
                    error!("Aborting query {}: {}", job.query, e);
                    break;
                }
                Err(e) => debug!("Skipping {}: {}", candidate.url, e),
            }
        }

        records
    }

    pub async fn acquire_pages(&self, targets: Vec<PageTarget>) -> IndexMap<String, Vec<ContentRecord>> {
        let mut results = IndexMap::new();

        for target in targets {
            let records = match self.acquire_page(&target).await {
                Ok(records) => records,
                Err(e) => {
                    warn!("Target {} failed: {}", target.url, e);
                    Vec::new()
                }
            };
            results.entry(target.url.clone()).or_insert_with(Vec::new).extend(records);
        }

        results
    }

    async fn acquire_page(&self, target: &PageTarget) -> Result<Vec<ContentRecord>> {
        let url = Url::parse(target.url.trim())
            .map_err(|e| AcquisitionError::InvalidUrl(format!("{}: {}", target.url, e)))?;

        let candidate = SearchCandidate::new(target.description.clone().unwrap_or_default(), url.clone());

        self.pacer.before_fetch(&url).await;

        match target_credential(target, &url, &self.config.credentials) {
            Some(credential) => self.extractor.extract_with(&candidate, Some(&credential)).await,
            None => self.extractor.extract(&candidate).await,
        }
    }

    fn set_state(&self, job: &QueryJob, state: JobState) {
        self.events.emit(AcquisitionEvent::JobStateChanged {
            query: job.query.clone(),
            state,
        });
    }

    fn report_budget(&self, job: &QueryJob, budget: &Budget) {
        self.events.emit(AcquisitionEvent::BudgetReached {
            query: job.query.clone(),
            accumulated: budget.used,
            budget: budget.limit.unwrap_or_default(),
        });
    }
}

fn target_credential(target: &PageTarget, url: &Url, policy: &CredentialPolicy) -> Option<CredentialRecord> {
    let host = host_key(url)?;

    if let Some(raw) = target.cookie.as_deref().filter(|c| !c.trim().is_empty()) {
        let (record, rejected) = CredentialRecord::from_cookie_string(&host, raw, Utc::now(), policy);
        if !rejected.is_empty() {
            debug!("Dropped {} malformed cookie segments for {}", rejected.len(), host);
        }
        if !record.cookies.is_empty() {
            return Some(record);
        }
    }

    match (target.username.as_deref(), target.password.as_deref()) {
        (Some(username), Some(password)) if !username.is_empty() => {
            Some(CredentialRecord::basic(&host, username, password, Utc::now()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn record(body: &str) -> ContentRecord {
        ContentRecord {
            title: "t".to_string(),
            url: Url::parse("https://example.com/").unwrap(),
            body: body.to_string(),
            published_at: None,
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn test_budget_keeps_crossing_record() {
        let mut budget = Budget::new(Some(10));
        assert!(!budget.exhausted());

        budget.add(&record("123456"));
        assert!(!budget.exhausted());

        budget.add(&record("1234"));
        assert!(!budget.exhausted(), "exactly at the limit is still within it");

        budget.add(&record("x"));
        assert!(budget.exhausted());
    }

    #[test]
    fn test_budget_counts_characters_not_bytes() {
        let mut budget = Budget::new(Some(3));
        budget.add(&record("新能源"));
        assert_eq!(budget.used, 3);
        assert!(!budget.exhausted());
    }

    #[test]
    fn test_unlimited_budget_never_exhausts() {
        let mut budget = Budget::new(None);
        budget.add(&record(&"x".repeat(10_000)));
        assert!(!budget.exhausted());
    }

    #[test]
    fn test_load_targets_accepts_object_or_array() {
        let dir = tempfile::tempdir().unwrap();

        let single = dir.path().join("single.json");
        std::fs::File::create(&single)
            .unwrap()
            .write_all(br#"{"url": "https://example.com/a", "cookie": "sid=1", "description": "A"}"#)
            .unwrap();
        let targets = load_page_targets(&single).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].cookie.as_deref(), Some("sid=1"));

        let many = dir.path().join("many.json");
        std::fs::write(
            &many,
            r#"[{"url": "https://example.com/a"}, {"url": "https://example.com/b", "username": "analyst", "password": "pw"}]"#,
        )
        .unwrap();
        let targets = load_page_targets(&many).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[1].url, "https://example.com/b");
        assert!(targets[1].description.is_none());
        assert_eq!(targets[1].username.as_deref(), Some("analyst"));
    }

    #[test]
    fn test_target_cookie_wins_over_basic_auth() {
        let url = Url::parse("https://intranet.example.com/report").unwrap();
        let policy = CredentialPolicy::default();

        let both = PageTarget {
            url: url.to_string(),
            cookie: Some("sid=1".to_string()),
            username: Some("analyst".to_string()),
            password: Some("pw".to_string()),
            description: None,
        };
        let credential = target_credential(&both, &url, &policy).unwrap();
        assert_eq!(credential.header_value(), "sid=1");
        assert!(credential.basic_auth.is_none());

        let password_only = PageTarget { cookie: Some("   ".to_string()), ..both.clone() };
        let credential = target_credential(&password_only, &url, &policy).unwrap();
        assert!(credential.cookies.is_empty());
        assert_eq!(credential.basic_auth.unwrap().username, "analyst");

        let anonymous = PageTarget { url: url.to_string(), ..Default::default() };
        assert!(target_credential(&anonymous, &url, &policy).is_none());
    }

    #[test]
    fn test_query_job_mode_defaults_to_web() {
        let job: QueryJob = serde_json::from_str(r#"{"query": "电池"}"#).unwrap();
        assert_eq!(job.mode, SearchMode::Web);
    }
}
