use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use url::{form_urlencoded, Url};

use crate::browser::PageLoader;
use crate::parser::{fragment_text, PageDocument};
use crate::{AcquisitionConfig, AcquisitionError, AcquisitionEvent, Component, EventSink, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Web,
    News,
    Financial,
}

impl SearchMode {
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "news" => SearchMode::News,
            "financial" | "finance" => SearchMode::Financial,
            _ => SearchMode::Web,
        }
    }
}

impl FromStr for SearchMode {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::parse_lenient(s))
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SearchMode::Web => "web",
            SearchMode::News => "news",
            SearchMode::Financial => "financial",
        };
        f.write_str(s)
    }
}

// With `content` set, extraction skips the fetch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchCandidate {
    pub title: String,
    pub url: Url,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub source_payload: Value,
}

#[derive(Debug, Deserialize)]
struct ResultPayload {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    data: Option<ResultData>,
}

#[derive(Debug, Deserialize)]
struct ResultData {
    #[serde(default)]
    open_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

// The two payload layouts the result page is known to emit
#[derive(Debug, PartialEq)]
enum ResultLink {
    // data.open_url with data.title
    Nested { link: String, title: Option<String> },
    // top-level url, or data.url when that is the only link
    Flat { link: String, title: Option<String> },
}

impl ResultPayload {
    fn into_link(self) -> Option<ResultLink> {
        let data = self.data.unwrap_or(ResultData {
            open_url: None,
            url: None,
            title: None,
        });

        if let Some(link) = non_empty(data.open_url) {
            return Some(ResultLink::Nested {
                link,
                title: data.title.or(self.title),
            });
        }

        non_empty(self.url)
            .or_else(|| non_empty(data.url))
            .map(|link| ResultLink::Flat {
                link,
                title: self.title.or(data.title),
            })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl SearchCandidate {
    pub fn new(title: impl Into<String>, url: Url) -> Self {
        Self {
            title: title.into(),
            url,
            published_at: None,
            content: None,
            source_payload: Value::Null,
        }
    }

    pub fn inline_content(&self) -> Option<&str> {
        self.content.as_deref().filter(|c| !c.trim().is_empty())
    }

    /// Decodes one embedded result payload. `open_url` wins over any other
    /// link; a payload with no recognizable link is rejected. Relative links
    /// resolve against `base`, and a missing title falls back to
    /// `fallback_title`.
    pub fn from_payload(payload: Value, base: &Url, fallback_title: &str) -> Result<Self> {
        let decoded: ResultPayload = serde_json::from_value(payload.clone())?;

        let (link, title) = match decoded.into_link() {
            Some(ResultLink::Nested { link, title }) | Some(ResultLink::Flat { link, title }) => {
                (link, title)
            }
            None => {
                return Err(AcquisitionError::ParseError(
                    "result payload has neither data.open_url nor url".to_string(),
                ))
            }
        };

        let url = base
            .join(link.trim())
            .map_err(|e| AcquisitionError::InvalidUrl(format!("{}: {}", link, e)))?;

        let title = title
            .map(|t| fragment_text(&t))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| fallback_title.to_string());

        Ok(Self {
            source_payload: payload,
            ..Self::new(title, url)
        })
    }
}

#[async_trait]
pub trait SearchSource: Send + Sync {
    // An empty result is not an error
    async fn search(&self, query: &str, mode: SearchMode) -> Result<Vec<SearchCandidate>>;
}

// Results are embedded as JSON inside marked <script> elements
pub struct AggregatorSearch {
    loader: PageLoader,
    config: Arc<AcquisitionConfig>,
    events: Arc<dyn EventSink>,
}

impl AggregatorSearch {
    pub fn new(loader: PageLoader, config: Arc<AcquisitionConfig>, events: Arc<dyn EventSink>) -> Self {
        Self {
            loader,
            config,
            events,
        }
    }

    pub fn search_url(&self, query: &str, mode: SearchMode) -> Result<Url> {
        let surface = &self.config.search;
        let params = match mode {
            SearchMode::Web => &surface.web_params,
            SearchMode::News => &surface.news_params,
            SearchMode::Financial => &surface.financial_params,
        };

        let encoded: String = form_urlencoded::byte_serialize(query.as_bytes()).collect();
        let raw = format!(
            "{}?{}",
            surface.base_url.trim_end_matches('?'),
            params.replace("{query}", &encoded)
        );

        Url::parse(&raw).map_err(|e| AcquisitionError::InvalidUrl(format!("{}: {}", raw, e)))
    }

    // Payloads are decoded one by one; a bad one is reported and skipped
    pub fn parse_results(&self, markup: &str, page_url: &Url, query: &str) -> Vec<SearchCandidate> {
        let document = PageDocument::parse(markup);

        let payloads = match document.select_raw(&self.config.search.result_script_selector) {
            Ok(payloads) => payloads,
            Err(e) => {
                self.report_failure(e.to_string());
                return Vec::new();
            }
        };

        let mut candidates = Vec::new();
        for raw in payloads {
            let decoded = serde_json::from_str::<Value>(raw.trim())
                .map_err(AcquisitionError::from)
                .and_then(|value| SearchCandidate::from_payload(value, page_url, query));

            match decoded {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => self.report_failure(e.to_string()),
            }
        }

        self.events.emit(AcquisitionEvent::ParseSucceeded {
            component: Component::SearchAdapter,
            items: candidates.len(),
        });
        candidates
    }

    fn report_failure(&self, reason: String) {
        self.events.emit(AcquisitionEvent::ParseFailed {
            component: Component::SearchAdapter,
            reason,
        });
    }
}

#[async_trait]
impl SearchSource for AggregatorSearch {
    async fn search(&self, query: &str, mode: SearchMode) -> Result<Vec<SearchCandidate>> {
        let url = self.search_url(query, mode)?;
        debug!("Searching {} ({}) via {}", query, mode, url);

        let page = self.loader.load(&url, self.config.search.settle_interval).await?;
        let candidates = self.parse_results(&page.markup, &page.url, query);

        info!("Search for {} returned {} candidates", query, candidates.len());
        Ok(candidates)
    }
}

#[derive(Debug, Deserialize)]
struct NewsListing {
    #[serde(default)]
    data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct NewsItem {
    attributes: NewsAttributes,
    links: NewsLinks,
}

#[derive(Debug, Deserialize)]
struct NewsAttributes {
    title: String,
    #[serde(rename = "publishOn", default)]
    publish_on: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NewsLinks {
    #[serde(rename = "self")]
    self_link: String,
}

// The query is ignored; every call returns the current top of the feed
pub struct MarketNewsFeed {
    loader: PageLoader,
    config: Arc<AcquisitionConfig>,
    events: Arc<dyn EventSink>,
}

impl MarketNewsFeed {
    pub fn new(loader: PageLoader, config: Arc<AcquisitionConfig>, events: Arc<dyn EventSink>) -> Self {
        Self {
            loader,
            config,
            events,
        }
    }

    pub fn parse_listing(&self, markup: &str) -> Result<Vec<SearchCandidate>> {
        let base = Url::parse(&self.config.market_news.site_base)?;
        let listing = decode_listing(markup)?;

        let mut candidates = Vec::new();
        for item in listing.data {
            if candidates.len() >= self.config.market_news.limit {
                break;
            }

            let decoded = serde_json::from_value::<NewsItem>(item.clone())
                .map_err(AcquisitionError::from)
                .and_then(|news| {
                    let url = base.join(&news.links.self_link)?;
                    Ok(SearchCandidate {
                        published_at: news.attributes.publish_on,
                        source_payload: item,
                        ..SearchCandidate::new(news.attributes.title, url)
                    })
                });

            match decoded {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => self.events.emit(AcquisitionEvent::ParseFailed {
                    component: Component::SearchAdapter,
                    reason: e.to_string(),
                }),
            }
        }

        self.events.emit(AcquisitionEvent::ParseSucceeded {
            component: Component::SearchAdapter,
            items: candidates.len(),
        });
        Ok(candidates)
    }
}

// Raw JSON, a browser's <pre> viewer, or plain page text
fn decode_listing(markup: &str) -> Result<NewsListing> {
    if let Ok(listing) = serde_json::from_str::<NewsListing>(markup.trim()) {
        return Ok(listing);
    }

    let text = {
        let document = PageDocument::parse(markup);
        document
            .select_raw("pre")?
            .into_iter()
            .next()
            .unwrap_or_else(|| document.text())
    };

    serde_json::from_str(text.trim()).map_err(AcquisitionError::from)
}

#[async_trait]
impl SearchSource for MarketNewsFeed {
    async fn search(&self, _query: &str, _mode: SearchMode) -> Result<Vec<SearchCandidate>> {
        let url = Url::parse(&self.config.market_news.listing_url)?;
        let page = self.loader.load(&url, self.config.settle_for(url.host_str().unwrap_or_default())).await?;
        self.parse_listing(&page.markup)
    }
}
