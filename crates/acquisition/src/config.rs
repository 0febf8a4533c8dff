use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36 Edg/142.0.0.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub user_agent: String,
    pub browser_args: Vec<String>,
    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
    #[serde(with = "duration_secs")]
    pub navigation_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub settle_interval: Duration,
    pub max_browser_sessions: usize,
    pub cookie_dir: PathBuf,
    pub credentials: CredentialPolicy,
    pub pacing: PacingConfig,
    pub search: SearchSurfaceConfig,
    pub search_api: SearchApiConfig,
    pub market_news: MarketNewsConfig,
    // Article-body marker for hosts without a site rule
    pub body_selector: String,
    pub site_rules: Vec<SiteRule>,
    pub http: HttpConfig,
    pub workers: usize,
    pub token_budget: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialPolicy {
    #[serde(with = "duration_secs")]
    pub grace_window: Duration,
    #[serde(with = "duration_secs")]
    pub fallback_horizon: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    #[serde(with = "duration_secs")]
    pub search_delay_min: Duration,
    #[serde(with = "duration_secs")]
    pub search_delay_max: Duration,
    #[serde(with = "duration_secs")]
    pub fetch_delay_min: Duration,
    #[serde(with = "duration_secs")]
    pub fetch_delay_max: Duration,
    // Per-host cap, on top of the jittered delays
    pub requests_per_minute: Option<u32>,
}

/// Query URL templates of the aggregator's result page. `{query}` is replaced
/// with the percent-encoded query.
///
/// The aggregator has no finance tab of its own. `news_params` and
/// `financial_params` both open the information tab and differ only in how
/// the tab switch is attributed (`source=search_subtab_switch` against
/// `source=input`), so the two modes return the same result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSurfaceConfig {
    pub base_url: String,
    pub result_script_selector: String,
    pub web_params: String,
    pub news_params: String,
    pub financial_params: String,
    #[serde(with = "duration_secs")]
    pub settle_interval: Duration,
}

// Keyed web-search API; results arrive with their page text already attached
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchApiConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub search_source: String,
    pub top_k: usize,
    // "week", "month", "semiyear" or "year"
    pub recency: String,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketNewsConfig {
    pub site_base: String,
    pub listing_url: String,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteRule {
    pub host_suffix: String,
    pub body_selector: String,
    #[serde(default, with = "option_duration_secs")]
    pub settle_interval: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub max_redirects: u32,
    pub max_content_size: usize,
    pub allowed_content_types: Vec<String>,
    pub headers: Vec<(String, String)>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            browser_args: vec![
                "--disable-gpu".to_string(),
                "--disable-dev-shm-usage".to_string(),
                "--disable-blink-features=AutomationControlled".to_string(),
            ],
            headless: true,
            chrome_executable: None,
            navigation_timeout: Duration::from_secs(60),
            settle_interval: Duration::from_secs(15),
            max_browser_sessions: 4,
            cookie_dir: PathBuf::from("./res/cookies"),
            credentials: CredentialPolicy::default(),
            pacing: PacingConfig::default(),
            search: SearchSurfaceConfig::default(),
            search_api: SearchApiConfig::default(),
            market_news: MarketNewsConfig::default(),
            body_selector: "div.article-content".to_string(),
            site_rules: vec![
                SiteRule {
                    host_suffix: "toutiao.com".to_string(),
                    body_selector: "div.article-content".to_string(),
                    settle_interval: None,
                },
                SiteRule {
                    host_suffix: "seekingalpha.com".to_string(),
                    body_selector: "div[data-test-id='content-container']".to_string(),
                    settle_interval: Some(Duration::from_secs(10)),
                },
            ],
            http: HttpConfig::default(),
            workers: 4,
            token_budget: None,
        }
    }
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            grace_window: Duration::from_secs(5 * 60),
            fallback_horizon: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            search_delay_min: Duration::from_secs(1),
            search_delay_max: Duration::from_secs(3),
            fetch_delay_min: Duration::from_secs(3),
            fetch_delay_max: Duration::from_secs(10),
            requests_per_minute: None,
        }
    }
}

impl PacingConfig {
    // No sleeping at all
    pub fn none() -> Self {
        Self {
            search_delay_min: Duration::ZERO,
            search_delay_max: Duration::ZERO,
            fetch_delay_min: Duration::ZERO,
            fetch_delay_max: Duration::ZERO,
            requests_per_minute: None,
        }
    }
}

impl Default for SearchSurfaceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://so.toutiao.com/search".to_string(),
            result_script_selector: "script[data-for='s-result-json']".to_string(),
            web_params: "dvpf=pc&source=input&keyword={query}&page_num=0&pd=synthesis".to_string(),
            news_params: "dvpf=pc&source=search_subtab_switch&keyword={query}&pd=information&action_type=search_subtab_switch&page_num=0&search_id=&from=news&cur_tab_title=news".to_string(),
            financial_params: "dvpf=pc&source=input&keyword={query}&page_num=0&pd=information&action_type=search_subtab_switch&search_id=&from=news&cur_tab_title=news".to_string(),
            settle_interval: Duration::from_secs(15),
        }
    }
}

impl Default for SearchApiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://qianfan.baidubce.com/v2/ai_search/web_search".to_string(),
            api_key: None,
            search_source: "baidu_search_v2".to_string(),
            top_k: 5,
            recency: "year".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl Default for MarketNewsConfig {
    fn default() -> Self {
        Self {
            site_base: "https://seekingalpha.com".to_string(),
            listing_url: "https://seekingalpha.com/api/v3/news?fields[news]=title%2Cdate%2Ccomment_count%2Ccontent%2CprimaryTickers%2CsecondaryTickers%2Ctag%2CgettyImageUrl%2CpublishOn&fields[tag]=slug%2Cname&filter[category]=market-news%3A%3Aall&filter[since]=0&filter[until]=0&include=primaryTickers%2CsecondaryTickers&isMounting=true&page[size]=25&page[number]=1".to_string(),
            limit: 10,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_redirects: 5,
            max_content_size: 10 * 1024 * 1024, // 10MB
            allowed_content_types: vec![
                "text/html".to_string(),
                "text/plain".to_string(),
                "application/xhtml+xml".to_string(),
                "application/json".to_string(),
            ],
            headers: vec![
                ("Accept".to_string(), "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string()),
                ("Accept-Language".to_string(), "zh-CN,zh;q=0.9,en;q=0.8".to_string()),
            ],
        }
    }
}

impl AcquisitionConfig {
    pub fn polite() -> Self {
        Self {
            workers: 1,
            max_browser_sessions: 1,
            pacing: PacingConfig {
                search_delay_min: Duration::from_secs(3),
                search_delay_max: Duration::from_secs(8),
                fetch_delay_min: Duration::from_secs(8),
                fetch_delay_max: Duration::from_secs(20),
                requests_per_minute: Some(4),
            },
            ..Default::default()
        }
    }

    // Unparseable values are ignored
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("ACQ_SEARCH_API_KEY") {
            if !key.trim().is_empty() {
                self.search_api.api_key = Some(key);
            }
        }

        if let Ok(ua) = std::env::var("ACQ_USER_AGENT") {
            self.user_agent = ua;
        }

        if let Ok(headless) = std::env::var("ACQ_HEADLESS") {
            if let Ok(headless) = headless.parse() {
                self.headless = headless;
            }
        }

        if let Ok(path) = std::env::var("ACQ_CHROME_EXECUTABLE") {
            self.chrome_executable = Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("ACQ_COOKIE_DIR") {
            self.cookie_dir = PathBuf::from(path);
        }

        if let Ok(secs) = std::env::var("ACQ_SETTLE_SECS") {
            if let Ok(secs) = secs.parse() {
                self.settle_interval = Duration::from_secs(secs);
                self.search.settle_interval = Duration::from_secs(secs);
            }
        }

        if let Ok(workers) = std::env::var("ACQ_WORKERS") {
            if let Ok(workers) = workers.parse() {
                self.workers = workers;
            }
        }

        if let Ok(sessions) = std::env::var("ACQ_MAX_BROWSER_SESSIONS") {
            if let Ok(sessions) = sessions.parse() {
                self.max_browser_sessions = sessions;
            }
        }

        if let Ok(budget) = std::env::var("ACQ_TOKEN_BUDGET") {
            if let Ok(budget) = budget.parse() {
                self.token_budget = Some(budget);
            }
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.workers == 0 {
            return Err(crate::AcquisitionError::Config("workers must be at least 1".to_string()));
        }
        if self.max_browser_sessions == 0 {
            return Err(crate::AcquisitionError::Config(
                "max_browser_sessions must be at least 1".to_string(),
            ));
        }
        if self.pacing.search_delay_min > self.pacing.search_delay_max
            || self.pacing.fetch_delay_min > self.pacing.fetch_delay_max
        {
            return Err(crate::AcquisitionError::Config(
                "pacing minimum exceeds maximum".to_string(),
            ));
        }
        if self.search_api.top_k == 0 {
            return Err(crate::AcquisitionError::Config("search_api.top_k must be positive".to_string()));
        }
        if self.pacing.requests_per_minute == Some(0) {
            return Err(crate::AcquisitionError::Config(
                "requests_per_minute must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_cookie_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cookie_dir = dir.into();
        self
    }

    pub fn with_pacing(mut self, pacing: PacingConfig) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_token_budget(mut self, budget: usize) -> Self {
        self.token_budget = Some(budget);
        self
    }

    pub fn with_head(mut self) -> Self {
        self.headless = false;
        self
    }

    // Matching site rule first, then the global default
    pub fn settle_for(&self, host: &str) -> Duration {
        self.site_rule_for(host)
            .and_then(|rule| rule.settle_interval)
            .unwrap_or(self.settle_interval)
    }

    pub fn body_selector_for(&self, host: &str) -> &str {
        self.site_rule_for(host)
            .map(|rule| rule.body_selector.as_str())
            .unwrap_or(&self.body_selector)
    }

    pub fn site_rule_for(&self, host: &str) -> Option<&SiteRule> {
        self.site_rules
            .iter()
            .find(|rule| host == rule.host_suffix || host.ends_with(&format!(".{}", rule.host_suffix)))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_rule_matches_subdomains() {
        let config = AcquisitionConfig::default();

        let rule = config.site_rule_for("www.toutiao.com").unwrap();
        assert_eq!(rule.body_selector, "div.article-content");
        assert!(config.site_rule_for("toutiao.com").is_some());
        assert!(config.site_rule_for("nottoutiao.com").is_none());
    }

    #[test]
    fn test_settle_interval_per_site() {
        let config = AcquisitionConfig::default();

        assert_eq!(config.settle_for("seekingalpha.com"), Duration::from_secs(10));
        assert_eq!(config.settle_for("example.com"), config.settle_interval);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = AcquisitionConfig::polite();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: AcquisitionConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.workers, 1);
        assert_eq!(parsed.pacing.requests_per_minute, Some(4));
        assert_eq!(parsed.credentials.grace_window, Duration::from_secs(300));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let parsed: AcquisitionConfig = serde_json::from_str(r#"{"workers": 2}"#).unwrap();

        assert_eq!(parsed.workers, 2);
        assert!(parsed.headless);
        assert_eq!(parsed.site_rules.len(), 2);
    }

    #[test]
    fn test_search_modes_have_distinct_templates() {
        let search = SearchSurfaceConfig::default();

        assert!(search.web_params.contains("pd=synthesis"));
        assert!(search.news_params.contains("pd=information"));
        assert!(search.financial_params.contains("pd=information"));
        assert_ne!(search.news_params, search.financial_params);
        assert_ne!(search.web_params, search.news_params);
    }

    #[test]
    fn test_search_api_key_from_json() {
        let parsed: AcquisitionConfig =
            serde_json::from_str(r#"{"search_api": {"api_key": "k-123", "top_k": 8}}"#).unwrap();

        assert_eq!(parsed.search_api.api_key.as_deref(), Some("k-123"));
        assert_eq!(parsed.search_api.top_k, 8);
        assert_eq!(parsed.search_api.recency, "year");
        assert_eq!(parsed.search_api.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_inverted_pacing() {
        let mut config = AcquisitionConfig::default();
        config.pacing.fetch_delay_min = Duration::from_secs(20);

        assert!(config.validate().is_err());
        assert!(AcquisitionConfig::default().validate().is_ok());
    }
}
