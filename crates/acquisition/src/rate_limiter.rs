use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use rand::Rng;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::{AcquisitionEvent, EventSink, PacingConfig};

pub type HostLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

// Random delay before every search and page fetch, plus an optional per-host cap
pub struct Pacer {
    config: PacingConfig,
    host_limiters: Arc<RwLock<HashMap<String, Arc<HostLimiter>>>>,
    events: Arc<dyn EventSink>,
}

impl Pacer {
    pub fn new(config: PacingConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            host_limiters: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub async fn before_search(&self) {
        let delay = jittered(self.config.search_delay_min, self.config.search_delay_max);
        self.sleep("search", delay).await;
    }

    pub async fn before_fetch(&self, url: &Url) {
        self.wait_for_host(url).await;
        let delay = jittered(self.config.fetch_delay_min, self.config.fetch_delay_max);
        self.sleep("fetch", delay).await;
    }

    async fn sleep(&self, stage: &'static str, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        self.events.emit(AcquisitionEvent::PacingDelay { stage, delay });
        tokio::time::sleep(delay).await;
    }

    async fn wait_for_host(&self, url: &Url) {
        let Some(rpm) = self.config.requests_per_minute.and_then(NonZeroU32::new) else {
            return;
        };
        let Some(host) = url.host_str() else {
            return;
        };

        debug!("Checking rate limit for host: {}", host);

        let limiter = {
            let mut limiters = self.host_limiters.write().await;

            limiters
                .entry(host.to_string())
                .or_insert_with(|| {
                    let quota = Quota::per_minute(rpm).allow_burst(nonzero_ext::nonzero!(1u32));
                    Arc::new(GovernorRateLimiter::direct(quota))
                })
                .clone()
        };

        limiter.until_ready().await;
    }

    pub async fn hosts_tracked(&self) -> usize {
        self.host_limiters.read().await.len()
    }
}

fn jittered(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingSink;

    #[test]
    fn test_jitter_stays_in_range() {
        let min = Duration::from_millis(100);
        let max = Duration::from_millis(300);

        for _ in 0..100 {
            let delay = jittered(min, max);
            assert!(delay >= min && delay <= max);
        }

        assert_eq!(jittered(max, min), max);
    }

    #[tokio::test]
    async fn test_zero_pacing_does_not_sleep_or_emit() {
        let sink = Arc::new(RecordingSink::default());
        let pacer = Pacer::new(PacingConfig::none(), sink.clone());
        let url = Url::parse("https://example.com/a").unwrap();

        let start = std::time::Instant::now();
        pacer.before_search().await;
        pacer.before_fetch(&url).await;
        assert!(start.elapsed() < Duration::from_millis(50));
        assert!(sink.events().is_empty());
        assert_eq!(pacer.hosts_tracked().await, 0);
    }

    #[tokio::test]
    async fn test_pacing_emits_delay_event() {
        let sink = Arc::new(RecordingSink::default());
        let config = PacingConfig {
            search_delay_min: Duration::from_millis(5),
            search_delay_max: Duration::from_millis(10),
            ..PacingConfig::none()
        };
        let pacer = Pacer::new(config, sink.clone());

        pacer.before_search().await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], AcquisitionEvent::PacingDelay { stage: "search", .. }));
    }

    #[tokio::test]
    async fn test_host_limiters_are_per_host() {
        let sink = Arc::new(RecordingSink::default());
        let config = PacingConfig {
            requests_per_minute: Some(60),
            ..PacingConfig::none()
        };
        let pacer = Pacer::new(config, sink);

        pacer.before_fetch(&Url::parse("https://example.com/1").unwrap()).await;
        pacer.before_fetch(&Url::parse("https://other.com/1").unwrap()).await;

        assert_eq!(pacer.hosts_tracked().await, 2);
    }
}
