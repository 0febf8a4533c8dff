use thiserror::Error;

#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to launch browser: {0}")]
    BrowserLaunch(String),

    #[error("Fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Credential for {host} is not usable: {reason}")]
    CredentialInvalid { host: String, reason: String },

    #[error("Content too large: {size} bytes (max: {max})")]
    ContentTooLarge { size: usize, max: usize },

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl AcquisitionError {
    pub fn fetch(url: impl ToString, reason: impl ToString) -> Self {
        Self::Fetch {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    // Only a browser that will not start ends the whole job
    pub fn is_fatal_for_job(&self) -> bool {
        matches!(self, Self::BrowserLaunch(_))
    }
}

pub type Result<T> = std::result::Result<T, AcquisitionError>;
