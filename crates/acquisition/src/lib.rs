pub mod api_search;
pub mod browser;
pub mod client;
pub mod config;
pub mod cookies;
pub mod error;
pub mod events;
pub mod extractor;
pub mod orchestrator;
pub mod parser;
pub mod rate_limiter;
pub mod search;

pub use api_search::*;
pub use browser::*;
pub use client::*;
pub use config::*;
pub use cookies::*;
pub use error::*;
pub use events::*;
pub use extractor::*;
pub use orchestrator::*;
pub use parser::*;
pub use rate_limiter::*;
pub use search::*;

use indexmap::IndexMap;
use std::sync::Arc;

pub struct Acquisition {
    config: Arc<AcquisitionConfig>,
    fetcher: Arc<dyn PageFetcher>,
    cookies: Arc<CookieStore>,
    pacer: Arc<Pacer>,
    events: Arc<dyn EventSink>,
}

impl Acquisition {
    // Headless Chrome and tracing output
    pub fn new(config: AcquisitionConfig) -> Result<Self> {
        let config = Arc::new(config);
        let events: Arc<dyn EventSink> = Arc::new(TracingSink);
        let fetcher = Arc::new(ChromeFetcher::new(config.clone(), events.clone()));
        Self::with_parts(config, fetcher, events)
    }

    pub fn with_parts(
        config: Arc<AcquisitionConfig>,
        fetcher: Arc<dyn PageFetcher>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;

        let cookies = Arc::new(CookieStore::from_config(&config, events.clone()));
        let pacer = Arc::new(Pacer::new(config.pacing.clone(), events.clone()));

        Ok(Self {
            config,
            fetcher,
            cookies,
            pacer,
            events,
        })
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    pub fn cookies(&self) -> Arc<CookieStore> {
        self.cookies.clone()
    }

    pub fn loader(&self) -> PageLoader {
        PageLoader::new(
            self.fetcher.clone(),
            self.cookies.clone(),
            self.config.headless,
            self.events.clone(),
        )
    }

    pub fn extractor(&self) -> ContentExtractor {
        ContentExtractor::new(self.loader(), self.config.clone(), self.events.clone())
    }

    pub fn aggregator_search(&self) -> AggregatorSearch {
        AggregatorSearch::new(self.loader(), self.config.clone(), self.events.clone())
    }

    pub fn market_news(&self) -> MarketNewsFeed {
        MarketNewsFeed::new(self.loader(), self.config.clone(), self.events.clone())
    }

    pub fn api_search(&self) -> Result<ApiSearch> {
        ApiSearch::new(self.config.clone(), self.events.clone())
    }

    pub fn orchestrator(&self, search: Arc<dyn SearchSource>) -> AcquisitionOrchestrator {
        AcquisitionOrchestrator::new(
            self.config.clone(),
            search,
            Arc::new(self.extractor()),
            self.pacer.clone(),
            self.events.clone(),
        )
    }

    pub async fn acquire(&self, jobs: Vec<QueryJob>) -> IndexMap<String, Vec<ContentRecord>> {
        self.orchestrator(Arc::new(self.aggregator_search()))
            .acquire(jobs)
            .await
    }

    pub async fn market_headlines(&self) -> Result<Vec<ContentRecord>> {
        let feed = self.market_news();
        let candidates = feed.search("", SearchMode::News).await?;
        let extractor = self.extractor();

        let mut records = Vec::new();
        for candidate in candidates {
            self.pacer.before_fetch(&candidate.url).await;
            match extractor.extract(&candidate).await {
                Ok(extracted) => records.extend(extracted),
                Err(e) if e.is_fatal_for_job() => return Err(e),
                Err(e) => tracing::debug!("Skipping {}: {}", candidate.url, e),
            }
        }
        Ok(records)
    }

    pub async fn acquire_pages(&self, targets: Vec<PageTarget>) -> IndexMap<String, Vec<ContentRecord>> {
        self.orchestrator(Arc::new(self.aggregator_search()))
            .acquire_pages(targets)
            .await
    }
}
