use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{Cookie, CookieParam};
use chromiumoxide::Page;
use futures::StreamExt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use url::Url;

use crate::cookies::{host_key, CookieEntry, CookieStore, CredentialRecord, SessionCookie};
use crate::parser::PageDocument;
use crate::{AcquisitionConfig, AcquisitionError, AcquisitionEvent, EventSink, Result};

static PROFILE_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub headless: bool,
    // Fixed wait after navigation so client-side rendering can finish
    pub settle: Duration,
}

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub url: Url,
    pub markup: String,
    pub fetched_at: DateTime<Utc>,
    pub authenticated: bool,
}

impl RenderedPage {
    pub fn document(&self) -> PageDocument {
        PageDocument::parse(&self.markup)
    }
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    // Fresh, isolated session per call
    async fn fetch(
        &self,
        url: &Url,
        credential: Option<&CredentialRecord>,
        options: FetchOptions,
    ) -> Result<RenderedPage>;
}

// One browser with a throwaway profile per fetch, always torn down
pub struct ChromeFetcher {
    config: Arc<AcquisitionConfig>,
    sessions: SessionPool,
    events: Arc<dyn EventSink>,
}

// Caps how many browser sessions are alive at once
#[derive(Clone)]
pub struct SessionPool {
    slots: Arc<Semaphore>,
}

impl SessionPool {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_sessions.max(1))),
        }
    }

    // The slot is held until `work` completes, teardown included
    pub async fn run<T, F>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| AcquisitionError::BrowserLaunch("session pool closed".to_string()))?;
        work.await
    }
}

impl Clone for ChromeFetcher {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            sessions: self.sessions.clone(),
            events: self.events.clone(),
        }
    }
}

impl ChromeFetcher {
    pub fn new(config: Arc<AcquisitionConfig>, events: Arc<dyn EventSink>) -> Self {
        let sessions = SessionPool::new(config.max_browser_sessions);
        Self {
            config,
            sessions,
            events,
        }
    }

    fn browser_config(&self, headless: bool, profile_dir: &Path) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .user_data_dir(profile_dir)
            .no_sandbox()
            .request_timeout(self.config.navigation_timeout)
            .arg(format!("--user-agent={}", self.config.user_agent));

        if !headless {
            builder = builder.with_head();
        }

        if let Some(path) = &self.config.chrome_executable {
            builder = builder.chrome_executable(path);
        }

        for arg in &self.config.browser_args {
            builder = builder.arg(arg);
        }

        builder.build().map_err(AcquisitionError::BrowserLaunch)
    }

    async fn launch(&self, url: &Url, headless: bool) -> Result<BrowserSession> {
        let profile_dir = std::env::temp_dir().join(format!(
            "acquisition-profile-{}-{}",
            std::process::id(),
            PROFILE_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let config = self.browser_config(headless, &profile_dir)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AcquisitionError::BrowserLaunch(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                trace!(?event, "cdp handler event");
            }
        });

        self.events.emit(AcquisitionEvent::SessionStarted {
            url: url.to_string(),
            headless,
        });

        Ok(BrowserSession {
            browser,
            handler,
            profile_dir,
            started: Instant::now(),
            url: url.to_string(),
        })
    }

    async fn render(
        &self,
        session: &BrowserSession,
        url: &Url,
        credential: Option<&CredentialRecord>,
        settle: Duration,
    ) -> Result<String> {
        let page = session
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| AcquisitionError::fetch(url, e))?;

        let injected = match credential {
            Some(credential) => self.inject_cookies(&page, &credential.cookies).await,
            None => 0,
        };

        page.goto(url.as_str())
            .await
            .map_err(|e| AcquisitionError::fetch(url, e))?;

        if needs_reload(injected) {
            page.reload()
                .await
                .map_err(|e| AcquisitionError::fetch(url, e))?;
        }

        tokio::time::sleep(settle).await;

        page.content()
            .await
            .map_err(|e| AcquisitionError::fetch(url, e))
    }

    async fn inject_cookies(&self, page: &Page, cookies: &[CookieEntry]) -> usize {
        let injected = inject_each(cookies, self.events.as_ref(), |param| async move {
            page.set_cookie(param).await.map(|_| ()).map_err(|e| e.to_string())
        })
        .await;

        debug!("Injected {}/{} cookies", injected, cookies.len());
        injected
    }

    // Headed browser; waits for a manual login, then reads the cookies
    pub async fn capture_session(&self, url: &Url, wait: Duration) -> Result<Vec<SessionCookie>> {
        self.sessions
            .run(async {
                let session = self.launch(url, false).await?;
                let outcome = capture_cookies(&session, url, wait).await;
                session.close(self.events.as_ref()).await;
                outcome
            })
            .await
    }
}

// Same-site, http-only and secure flags never reach the browser
pub fn cookie_param(entry: &CookieEntry) -> std::result::Result<CookieParam, String> {
    CookieParam::builder()
        .name(entry.name.clone())
        .value(entry.value.clone())
        .domain(entry.domain.clone())
        .path(entry.path.clone())
        .build()
}

// A cookie that cannot be built or is refused is reported and skipped
pub async fn inject_each<F, Fut>(entries: &[CookieEntry], events: &dyn EventSink, mut set: F) -> usize
where
    F: FnMut(CookieParam) -> Fut,
    Fut: Future<Output = std::result::Result<(), String>>,
{
    let mut injected = 0;

    for entry in entries {
        let outcome = match cookie_param(entry) {
            Ok(param) => set(param).await,
            Err(reason) => Err(reason),
        };

        match outcome {
            Ok(()) => injected += 1,
            Err(reason) => events.emit(AcquisitionEvent::CookieInjectionSkipped {
                name: entry.name.clone(),
                reason,
            }),
        }
    }

    injected
}

// Cookies set on about:blank only take effect on the next request
pub fn needs_reload(injected: usize) -> bool {
    injected > 0
}

async fn capture_cookies(session: &BrowserSession, url: &Url, wait: Duration) -> Result<Vec<SessionCookie>> {
    let page = session
        .browser
        .new_page(url.as_str())
        .await
        .map_err(|e| AcquisitionError::fetch(url, e))?;

    tokio::time::sleep(wait).await;

    let cookies = page
        .get_cookies()
        .await
        .map_err(|e| AcquisitionError::fetch(url, e))?;

    Ok(cookies.into_iter().map(session_cookie).collect())
}

fn session_cookie(cookie: Cookie) -> SessionCookie {
    SessionCookie {
        name: cookie.name,
        value: cookie.value,
        domain: cookie.domain,
        path: cookie.path,
        expires: if cookie.session || cookie.expires <= 0.0 {
            None
        } else {
            Some(cookie.expires)
        },
        http_only: cookie.http_only,
        secure: cookie.secure,
        same_site: cookie.same_site.map(|s| format!("{:?}", s)),
    }
}

#[async_trait]
impl PageFetcher for ChromeFetcher {
    async fn fetch(
        &self,
        url: &Url,
        credential: Option<&CredentialRecord>,
        options: FetchOptions,
    ) -> Result<RenderedPage> {
        if credential.is_some_and(|c| c.cookies.is_empty() && c.basic_auth.is_some()) {
            debug!("Basic auth for {} is only sent by the HTTP fetcher", url);
        }

        let markup = self
            .sessions
            .run(async {
                let session = self.launch(url, options.headless).await?;
                let outcome = self.render(&session, url, credential, options.settle).await;
                session.close(self.events.as_ref()).await;
                outcome
            })
            .await?;

        Ok(RenderedPage {
            url: url.clone(),
            markup,
            fetched_at: Utc::now(),
            authenticated: credential.is_some(),
        })
    }
}

struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
    profile_dir: PathBuf,
    started: Instant,
    url: String,
}

impl BrowserSession {
    async fn close(mut self, events: &dyn EventSink) {
        if let Err(e) = self.browser.close().await {
            debug!("Browser close failed for {}: {}", self.url, e);
        }
        if let Err(e) = self.browser.wait().await {
            debug!("Browser wait failed for {}: {}", self.url, e);
        }
        self.handler.abort();

        if let Err(e) = tokio::fs::remove_dir_all(&self.profile_dir).await {
            trace!("Could not remove profile {:?}: {}", self.profile_dir, e);
        }

        events.emit(AcquisitionEvent::SessionEnded {
            url: self.url,
            elapsed: self.started.elapsed(),
        });
    }
}

// Resolves the stored credential for each URL's host; shared by search and extraction
#[derive(Clone)]
pub struct PageLoader {
    fetcher: Arc<dyn PageFetcher>,
    cookies: Arc<CookieStore>,
    headless: bool,
    events: Arc<dyn EventSink>,
}

impl PageLoader {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        cookies: Arc<CookieStore>,
        headless: bool,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            fetcher,
            cookies,
            headless,
            events,
        }
    }

    pub fn cookies(&self) -> &Arc<CookieStore> {
        &self.cookies
    }

    // A missing or expired credential downgrades to an anonymous fetch
    pub async fn load(&self, url: &Url, settle: Duration) -> Result<RenderedPage> {
        let credential = host_key(url).and_then(|host| self.cookies.valid_credential(&host));
        self.load_with(url, credential.as_ref(), settle).await
    }

    pub async fn load_with(
        &self,
        url: &Url,
        credential: Option<&CredentialRecord>,
        settle: Duration,
    ) -> Result<RenderedPage> {
        self.events.emit(AcquisitionEvent::FetchAttempt {
            url: url.to_string(),
            authenticated: credential.is_some(),
        });

        let options = FetchOptions {
            headless: self.headless,
            settle,
        };

        match self.fetcher.fetch(url, credential, options).await {
            Ok(page) => Ok(page),
            Err(e) => {
                self.events.emit(AcquisitionEvent::FetchFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingSink;
    use crate::CredentialPolicy;
    use std::sync::Mutex;

    struct EchoFetcher {
        seen: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl PageFetcher for EchoFetcher {
        async fn fetch(
            &self,
            url: &Url,
            credential: Option<&CredentialRecord>,
            _options: FetchOptions,
        ) -> Result<RenderedPage> {
            self.seen.lock().unwrap().push((url.to_string(), credential.is_some()));
            if url.path() == "/broken" {
                return Err(AcquisitionError::fetch(url, "navigation timed out"));
            }
            Ok(RenderedPage {
                url: url.clone(),
                markup: "<p>ok</p>".to_string(),
                fetched_at: Utc::now(),
                authenticated: credential.is_some(),
            })
        }
    }

    fn loader(dir: &std::path::Path, sink: Arc<RecordingSink>) -> (PageLoader, Arc<EchoFetcher>) {
        let fetcher = Arc::new(EchoFetcher { seen: Mutex::new(Vec::new()) });
        let cookies = Arc::new(CookieStore::new(dir, CredentialPolicy::default(), sink.clone()));
        (PageLoader::new(fetcher.clone(), cookies, true, sink), fetcher)
    }

    #[tokio::test]
    async fn test_loader_attaches_valid_credential() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let (loader, fetcher) = loader(dir.path(), sink.clone());

        loader.cookies().save_manual("news.example.com", "sid=abc").unwrap();

        let url = Url::parse("https://news.example.com/a/1").unwrap();
        let page = loader.load(&url, Duration::ZERO).await.unwrap();
        assert!(page.authenticated);

        let other = Url::parse("https://other.example.com/").unwrap();
        let page = loader.load(&other, Duration::ZERO).await.unwrap();
        assert!(!page.authenticated);

        let seen = fetcher.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].1);
        assert!(!seen[1].1);
    }

    fn captured_entry(name: &str) -> CookieEntry {
        let mut entry = CookieEntry::new(name, "v", ".toutiao.com");
        entry.path = "/search".to_string();
        entry.expiry = Some(1_900_000_000);
        entry.extra.insert("httpOnly".to_string(), true.into());
        entry.extra.insert("secure".to_string(), true.into());
        entry.extra.insert("sameSite".to_string(), "Lax".into());
        entry
    }

    #[test]
    fn test_cookie_param_keeps_only_name_value_domain_path() {
        let param = cookie_param(&captured_entry("ttwid")).unwrap();

        assert_eq!(param.name, "ttwid");
        assert_eq!(param.value, "v");
        assert_eq!(param.domain.as_deref(), Some(".toutiao.com"));
        assert_eq!(param.path.as_deref(), Some("/search"));
        assert!(param.secure.is_none());
        assert!(param.http_only.is_none());
        assert!(param.same_site.is_none());
        assert!(param.expires.is_none());
        assert!(param.url.is_none());
    }

    #[tokio::test]
    async fn test_refused_cookie_is_skipped_and_rest_injected() {
        let sink = RecordingSink::default();
        let entries = vec![captured_entry("a"), captured_entry("refused"), captured_entry("b")];
        let mut offered = Vec::new();

        let injected = inject_each(&entries, &sink, |param| {
            offered.push(param.name.clone());
            let refused = param.name == "refused";
            async move {
                if refused {
                    Err("Invalid cookie fields".to_string())
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(injected, 2);
        assert_eq!(offered, vec!["a", "refused", "b"]);
        let skipped: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                AcquisitionEvent::CookieInjectionSkipped { name, .. } => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(skipped, vec!["refused"]);
    }

    #[test]
    fn test_reload_only_after_injection() {
        assert!(!needs_reload(0));
        assert!(needs_reload(1));
        assert!(needs_reload(12));
    }

    #[tokio::test]
    async fn test_session_pool_caps_concurrent_sessions() {
        let pool = SessionPool::new(2);
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let live = live.clone();
            let peak = peak.clone();
            tasks.spawn(async move {
                pool.run(async {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    live.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_session_pool_releases_slot_on_failure() {
        let pool = SessionPool::new(1);

        let failed: Result<()> = pool
            .run(async { Err(AcquisitionError::BrowserLaunch("chrome not found".to_string())) })
            .await;
        assert!(failed.is_err());

        let next = tokio::time::timeout(Duration::from_secs(1), pool.run(async { Ok(7) })).await;
        assert_eq!(next.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_loader_reports_fetch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let (loader, _) = loader(dir.path(), sink.clone());

        let url = Url::parse("https://news.example.com/broken").unwrap();
        assert!(loader.load(&url, Duration::ZERO).await.is_err());

        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, AcquisitionEvent::FetchFailed { .. })));
    }
}
