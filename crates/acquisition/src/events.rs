use std::fmt;
use std::time::Duration;
use tracing::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    CookieStore,
    PageFetcher,
    SearchAdapter,
    ContentExtractor,
    Orchestrator,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::CookieStore => "cookie_store",
            Component::PageFetcher => "page_fetcher",
            Component::SearchAdapter => "search_adapter",
            Component::ContentExtractor => "content_extractor",
            Component::Orchestrator => "orchestrator",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Searching,
    Extracting,
    Done,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Searching => "searching",
            JobState::Extracting => "extracting",
            JobState::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionEvent {
    SessionStarted { url: String, headless: bool },
    SessionEnded { url: String, elapsed: Duration },
    FetchAttempt { url: String, authenticated: bool },
    FetchFailed { url: String, reason: String },
    CookieInjectionSkipped { name: String, reason: String },
    CredentialSaved { host: String, cookies: usize },
    CredentialRejected { host: String, reason: String },
    CredentialSaveFailed { host: String, reason: String },
    ParseSucceeded { component: Component, items: usize },
    ParseFailed { component: Component, reason: String },
    PacingDelay { stage: &'static str, delay: Duration },
    JobStateChanged { query: String, state: JobState },
    BudgetReached { query: String, accumulated: usize, budget: usize },
}

impl AcquisitionEvent {
    pub fn level(&self) -> Level {
        match self {
            AcquisitionEvent::FetchFailed { .. }
            | AcquisitionEvent::ParseFailed { .. }
            | AcquisitionEvent::CredentialSaveFailed { .. }
            | AcquisitionEvent::CookieInjectionSkipped { .. } => Level::WARN,
            AcquisitionEvent::SessionStarted { .. }
            | AcquisitionEvent::SessionEnded { .. }
            | AcquisitionEvent::PacingDelay { .. }
            | AcquisitionEvent::ParseSucceeded { .. } => Level::DEBUG,
            _ => Level::INFO,
        }
    }

    pub fn component(&self) -> Component {
        match self {
            AcquisitionEvent::SessionStarted { .. }
            | AcquisitionEvent::SessionEnded { .. }
            | AcquisitionEvent::FetchAttempt { .. }
            | AcquisitionEvent::FetchFailed { .. }
            | AcquisitionEvent::CookieInjectionSkipped { .. } => Component::PageFetcher,
            AcquisitionEvent::CredentialSaved { .. }
            | AcquisitionEvent::CredentialRejected { .. }
            | AcquisitionEvent::CredentialSaveFailed { .. } => Component::CookieStore,
            AcquisitionEvent::ParseSucceeded { component, .. }
            | AcquisitionEvent::ParseFailed { component, .. } => *component,
            AcquisitionEvent::PacingDelay { .. }
            | AcquisitionEvent::JobStateChanged { .. }
            | AcquisitionEvent::BudgetReached { .. } => Component::Orchestrator,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: AcquisitionEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

macro_rules! emit_at {
    ($level:expr, $($rest:tt)+) => {
        match $level {
            Level::ERROR => tracing::error!($($rest)+),
            Level::WARN => tracing::warn!($($rest)+),
            Level::INFO => tracing::info!($($rest)+),
            Level::DEBUG => tracing::debug!($($rest)+),
            _ => tracing::trace!($($rest)+),
        }
    };
}

impl EventSink for TracingSink {
    fn emit(&self, event: AcquisitionEvent) {
        let level = event.level();
        let component = event.component().as_str();

        match event {
            AcquisitionEvent::SessionStarted { url, headless } => {
                emit_at!(level, component, %url, headless, "browser session started")
            }
            AcquisitionEvent::SessionEnded { url, elapsed } => {
                emit_at!(level, component, %url, elapsed_ms = elapsed.as_millis() as u64, "browser session closed")
            }
            AcquisitionEvent::FetchAttempt { url, authenticated } => {
                emit_at!(level, component, %url, authenticated, "fetching page")
            }
            AcquisitionEvent::FetchFailed { url, reason } => {
                emit_at!(level, component, %url, %reason, "fetch failed")
            }
            AcquisitionEvent::CookieInjectionSkipped { name, reason } => {
                emit_at!(level, component, cookie = %name, %reason, "skipping cookie")
            }
            AcquisitionEvent::CredentialSaved { host, cookies } => {
                emit_at!(level, component, %host, cookies, "credential saved")
            }
            AcquisitionEvent::CredentialRejected { host, reason } => {
                emit_at!(level, component, %host, %reason, "credential not usable, fetching unauthenticated")
            }
            AcquisitionEvent::CredentialSaveFailed { host, reason } => {
                emit_at!(level, component, %host, %reason, "credential save failed")
            }
            AcquisitionEvent::ParseSucceeded { items, .. } => {
                emit_at!(level, component, items, "parsed")
            }
            AcquisitionEvent::ParseFailed { reason, .. } => {
                emit_at!(level, component, %reason, "parse failed, skipping item")
            }
            AcquisitionEvent::PacingDelay { stage, delay } => {
                emit_at!(level, component, stage, delay_ms = delay.as_millis() as u64, "pacing")
            }
            AcquisitionEvent::JobStateChanged { query, state } => {
                emit_at!(level, component, %query, %state, "job state")
            }
            AcquisitionEvent::BudgetReached { query, accumulated, budget } => {
                emit_at!(level, component, %query, accumulated, budget, "token budget reached")
            }
        }
    }
}
