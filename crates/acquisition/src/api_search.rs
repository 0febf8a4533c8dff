use async_trait::async_trait;
use reqwest::Client as ReqwestClient;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::search::{SearchCandidate, SearchMode, SearchSource};
use crate::{AcquisitionConfig, AcquisitionError, AcquisitionEvent, Component, EventSink, Result};

const AUTH_HEADER: &str = "X-Appbuilder-Authorization";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    references: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Reference {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

pub struct ApiSearch {
    client: ReqwestClient,
    config: Arc<AcquisitionConfig>,
    events: Arc<dyn EventSink>,
}

impl ApiSearch {
    pub fn new(config: Arc<AcquisitionConfig>, events: Arc<dyn EventSink>) -> Result<Self> {
        let client = ReqwestClient::builder()
            .user_agent(&config.user_agent)
            .timeout(config.search_api.timeout)
            .build()?;

        Ok(Self { client, config, events })
    }

    pub fn request_body(&self, query: &str) -> Value {
        let api = &self.config.search_api;
        json!({
            "messages": [{ "content": query, "role": "user" }],
            "search_source": api.search_source,
            "resource_type_filter": [{ "type": "web", "top_k": api.top_k }],
            "search_recency_filter": api.recency,
        })
    }

    // References are decoded one by one; one without a usable link is skipped
    pub fn parse_references(&self, response: Value, query: &str) -> Result<Vec<SearchCandidate>> {
        let response: SearchResponse = serde_json::from_value(response)?;

        let mut candidates = Vec::new();
        for raw in response.references {
            let decoded = serde_json::from_value::<Reference>(raw.clone())
                .map_err(AcquisitionError::from)
                .and_then(|reference| candidate_from_reference(reference, raw, query));

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

fn candidate_from_reference(reference: Reference, raw: Value, query: &str) -> Result<SearchCandidate> {
    let link = reference
        .url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| AcquisitionError::ParseError("search reference has no url".to_string()))?;
    let url = Url::parse(link.trim()).map_err(|e| AcquisitionError::InvalidUrl(format!("{}: {}", link, e)))?;

    let title = reference
        .title
        .map(|t| unescape(&t))
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| query.to_string());

    let content = reference
        .content
        .map(|c| unescape(&c))
        .filter(|c| !c.trim().is_empty())
        .or_else(|| reference.snippet.map(|s| unescape(&s)));

    Ok(SearchCandidate {
        published_at: reference.date.filter(|d| !d.is_empty()),
        content,
        source_payload: raw,
        ..SearchCandidate::new(title, url)
    })
}

// The API percent-encodes its text fields; undecodable ones are kept as sent
fn unescape(value: &str) -> String {
    urlencoding::decode(value)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

#[async_trait]
impl SearchSource for ApiSearch {
    async fn search(&self, query: &str, mode: SearchMode) -> Result<Vec<SearchCandidate>> {
        let api = &self.config.search_api;
        let key = api
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AcquisitionError::Config("search_api.api_key is not set".to_string()))?;

        let endpoint = Url::parse(&api.endpoint)?;
        debug!("Searching {} ({}) via {}", query, mode, endpoint);

        let response: Value = self
            .client
            .post(endpoint.as_str())
            .header(AUTH_HEADER, format!("Bearer {}", key))
            .json(&self.request_body(query))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let candidates = self.parse_references(response, query)?;
        info!("Search API returned {} candidates for {}", candidates.len(), query);
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingSink;

    fn search(sink: Arc<RecordingSink>) -> ApiSearch {
        ApiSearch::new(Arc::new(AcquisitionConfig::default()), sink).unwrap()
    }

    #[test]
    fn test_request_body_carries_filters() {
        let body = search(Arc::new(RecordingSink::default())).request_body("锂电池龙头企业");

        assert_eq!(body["messages"][0]["content"], "锂电池龙头企业");
        assert_eq!(body["search_source"], "baidu_search_v2");
        assert_eq!(body["resource_type_filter"][0]["top_k"], 5);
        assert_eq!(body["search_recency_filter"], "year");
    }

    #[test]
    fn test_references_are_unescaped_and_bad_ones_skipped() {
        let sink = Arc::new(RecordingSink::default());
        let search = search(sink.clone());

        let response = json!({
            "references": [
                {
                    "url": "https://news.example.com/a",
                    "title": "%E6%96%B0%E8%83%BD%E6%BA%90",
                    "content": "%E9%94%80%E9%87%8F%E5%A2%9E%E9%95%BF",
                    "date": "2026-10-18 09:30:00"
                },
                { "title": "no link" },
                { "url": "https://news.example.com/b", "snippet": "short" }
            ]
        });

        let candidates = search.parse_references(response, "q").unwrap();
        assert_eq!(candidates.len(), 2);

        assert_eq!(candidates[0].title, "新能源");
        assert_eq!(candidates[0].content.as_deref(), Some("销量增长"));
        assert_eq!(candidates[0].published_at.as_deref(), Some("2026-10-18 09:30:00"));

        assert_eq!(candidates[1].title, "q");
        assert_eq!(candidates[1].inline_content(), Some("short"));
        assert!(candidates[1].published_at.is_none());

        assert!(sink.events().iter().any(|e| matches!(
            e,
            AcquisitionEvent::ParseFailed { component: Component::SearchAdapter, .. }
        )));
    }

    #[tokio::test]
    async fn test_missing_key_is_config_error() {
        let search = search(Arc::new(RecordingSink::default()));
        assert!(matches!(
            search.search("q", SearchMode::Web).await,
            Err(AcquisitionError::Config(_))
        ));
    }
}
