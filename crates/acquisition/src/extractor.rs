use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::browser::{PageLoader, RenderedPage};
use crate::cookies::CredentialRecord;
use crate::search::SearchCandidate;
use crate::{AcquisitionConfig, AcquisitionError, AcquisitionEvent, Component, EventSink, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub title: String,
    pub url: Url,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl ContentRecord {
    // Counted against the token budget
    pub fn budget_len(&self) -> usize {
        self.body.chars().count()
    }
}

pub struct ContentExtractor {
    loader: PageLoader,
    config: Arc<AcquisitionConfig>,
    events: Arc<dyn EventSink>,
}

impl ContentExtractor {
    pub fn new(loader: PageLoader, config: Arc<AcquisitionConfig>, events: Arc<dyn EventSink>) -> Self {
        Self {
            loader,
            config,
            events,
        }
    }

    pub async fn extract(&self, candidate: &SearchCandidate) -> Result<Vec<ContentRecord>> {
        if let Some(record) = self.inline_record(candidate) {
            return Ok(vec![record]);
        }

        let settle = self.config.settle_for(candidate.url.host_str().unwrap_or_default());
        let page = self.loader.load(&candidate.url, settle).await?;
        self.records_from_page(candidate, &page)
    }

    pub async fn extract_with(
        &self,
        candidate: &SearchCandidate,
        credential: Option<&CredentialRecord>,
    ) -> Result<Vec<ContentRecord>> {
        if let Some(record) = self.inline_record(candidate) {
            return Ok(vec![record]);
        }

        let settle = self.config.settle_for(candidate.url.host_str().unwrap_or_default());
        let page = self.loader.load_with(&candidate.url, credential, settle).await?;
        self.records_from_page(candidate, &page)
    }

    // Text the search source already delivered needs no fetch
    fn inline_record(&self, candidate: &SearchCandidate) -> Option<ContentRecord> {
        let body = candidate.inline_content()?;

        self.events.emit(AcquisitionEvent::ParseSucceeded {
            component: Component::ContentExtractor,
            items: 1,
        });
        Some(ContentRecord {
            title: candidate.title.clone(),
            url: candidate.url.clone(),
            body: body.trim().to_string(),
            published_at: candidate.published_at.clone(),
            fetched_at: Utc::now(),
        })
    }

    /// One record per non-empty body marker. Without any, a single record
    /// holds the whole page's visible text. A page with no visible text at
    /// all is a parse error.
    pub fn records_from_page(&self, candidate: &SearchCandidate, page: &RenderedPage) -> Result<Vec<ContentRecord>> {
        let selector = self.config.body_selector_for(page.url.host_str().unwrap_or_default());
        let document = page.document();

        let title = if candidate.title.trim().is_empty() {
            document.title().unwrap_or_else(|| candidate.url.to_string())
        } else {
            candidate.title.clone()
        };

        let sections = match document.select_text(selector) {
            Ok(sections) => sections,
            Err(e) => {
                self.events.emit(AcquisitionEvent::ParseFailed {
                    component: Component::ContentExtractor,
                    reason: e.to_string(),
                });
                Vec::new()
            }
        };

        let mut bodies: Vec<String> = sections.into_iter().filter(|s| !s.is_empty()).collect();

        if bodies.is_empty() {
            debug!("No body marker {} on {}, keeping full page text", selector, page.url);
            let text = document.text();
            if text.is_empty() {
                let err = AcquisitionError::ParseError(format!("{} has no visible text", page.url));
                self.events.emit(AcquisitionEvent::ParseFailed {
                    component: Component::ContentExtractor,
                    reason: err.to_string(),
                });
                return Err(err);
            }
            bodies.push(text);
        }

        let records: Vec<ContentRecord> = bodies
            .into_iter()
            .map(|body| ContentRecord {
                title: title.clone(),
                url: candidate.url.clone(),
                body,
                published_at: candidate.published_at.clone(),
                fetched_at: page.fetched_at,
            })
            .collect();

        self.events.emit(AcquisitionEvent::ParseSucceeded {
            component: Component::ContentExtractor,
            items: records.len(),
        });
        Ok(records)
    }
}
