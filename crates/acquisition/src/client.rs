use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use encoding_rs::{Encoding, UTF_8};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, COOKIE};
use reqwest::{Client as ReqwestClient, Response};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::browser::{FetchOptions, PageFetcher, RenderedPage};
use crate::cookies::CredentialRecord;
use crate::{AcquisitionConfig, AcquisitionError, HttpConfig, Result};

// Plain HTTP fetcher; the settle interval is ignored
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: ReqwestClient,
    config: Arc<HttpConfig>,
}

impl HttpFetcher {
    pub fn new(config: &AcquisitionConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();

        for (key, value) in &config.http.headers {
            headers.insert(
                HeaderName::from_bytes(key.as_bytes())
                    .map_err(|e| AcquisitionError::Config(e.to_string()))?,
                HeaderValue::from_str(value).map_err(|e| AcquisitionError::Config(e.to_string()))?,
            );
        }

        let client = ReqwestClient::builder()
            .user_agent(&config.user_agent)
            .timeout(config.http.timeout)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(config.http.max_redirects as usize))
            .build()?;

        Ok(Self {
            client,
            config: Arc::new(config.http.clone()),
        })
    }

    // Basic auth only goes out when there are no cookies
    pub async fn fetch_text(&self, url: &Url, credential: Option<&CredentialRecord>) -> Result<String> {
        debug!("Fetching URL: {}", url);

        let mut request = self.client.get(url.as_str());
        if let Some(credential) = credential {
            let header = credential.header_value();
            if !header.is_empty() {
                request = request.header(COOKIE, header);
            } else if let Some(auth) = &credential.basic_auth {
                request = request.basic_auth(&auth.username, Some(&auth.password));
            }
        }

        let response = request.send().await?.error_for_status()?;

        let content_type = match response.headers().get(CONTENT_TYPE) {
            Some(value) => {
                let value = value.to_str().unwrap_or("").to_string();
                if !self.is_allowed_content_type(&value) {
                    return Err(AcquisitionError::UnsupportedContentType(value));
                }
                Some(value)
            }
            None => None,
        };

        if let Some(content_length) = response.content_length() {
            if content_length > self.config.max_content_size as u64 {
                return Err(AcquisitionError::ContentTooLarge {
                    size: content_length as usize,
                    max: self.config.max_content_size,
                });
            }
        }

        let bytes = self.stream_limited(response).await?;

        info!("Fetched {} bytes from {}", bytes.len(), url);
        Ok(decode_body(&bytes, content_type.as_deref()))
    }

    async fn stream_limited(&self, response: Response) -> Result<Bytes> {
        let mut bytes = BytesMut::new();
        let mut stream = response.bytes_stream();
        let max_size = self.config.max_content_size;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;

            if bytes.len() + chunk.len() > max_size {
                return Err(AcquisitionError::ContentTooLarge {
                    size: bytes.len() + chunk.len(),
                    max: max_size,
                });
            }

            bytes.extend_from_slice(&chunk);
        }

        Ok(bytes.freeze())
    }

    fn is_allowed_content_type(&self, content_type: &str) -> bool {
        self.config
            .allowed_content_types
            .iter()
            .any(|allowed| content_type.starts_with(allowed.as_str()))
    }
}

/// Decodes with the header charset, then a `<meta>` charset near the top of
/// the document, then UTF-8. A byte-order mark overrides all of them.
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> String {
    let encoding = content_type
        .and_then(charset_label)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .or_else(|| sniff_meta_charset(bytes))
        .unwrap_or(UTF_8);

    let (text, used, had_errors) = encoding.decode(bytes);
    if had_errors {
        debug!("Malformed {} sequences replaced while decoding", used.name());
    }
    text.into_owned()
}

fn charset_label(content_type: &str) -> Option<String> {
    let lower = content_type.to_ascii_lowercase();
    let start = lower.find("charset=")? + "charset=".len();

    let label: String = lower[start..]
        .trim_start_matches(['"', '\''])
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
        .collect();

    (!label.is_empty()).then_some(label)
}

fn sniff_meta_charset(bytes: &[u8]) -> Option<&'static Encoding> {
    let head = &bytes[..bytes.len().min(1024)];
    let head = String::from_utf8_lossy(head);
    charset_label(&head).and_then(|label| Encoding::for_label(label.as_bytes()))
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &Url,
        credential: Option<&CredentialRecord>,
        _options: FetchOptions,
    ) -> Result<RenderedPage> {
        let markup = self
            .fetch_text(url, credential)
            .await
            .map_err(|e| AcquisitionError::fetch(url, e))?;

        Ok(RenderedPage {
            url: url.clone(),
            markup,
            fetched_at: Utc::now(),
            authenticated: credential.is_some(),
        })
    }
}
