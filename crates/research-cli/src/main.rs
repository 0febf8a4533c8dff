use acquisition::{
    host_key, load_page_targets, Acquisition, AcquisitionConfig, ChromeFetcher, EventSink, HttpFetcher,
    PageFetcher, QueryJob, SearchSource, TracingSink,
};
use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

mod cli;
mod config;

use cli::{Cli, Commands, CookieCommands, SearchBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "acquisition=info,research=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = config::load(cli.config.as_deref())?;
    if cli.polite {
        let polite = AcquisitionConfig::polite();
        config.max_browser_sessions = polite.max_browser_sessions;
        config = config.with_pacing(polite.pacing).with_workers(polite.workers);
    }
    if cli.headed {
        config = config.with_head();
    }
    if let Some(dir) = &cli.cookie_dir {
        config = config.with_cookie_dir(dir);
    }

    match cli.command {
        Commands::Acquire {
            queries,
            mode,
            source,
            budget,
            workers,
            output,
        } => {
            if let Some(budget) = budget {
                config = config.with_token_budget(budget);
            }
            if let Some(workers) = workers {
                config = config.with_workers(workers);
            }

            let acquisition = build(config, cli.http)?;
            let jobs = queries.into_iter().map(|q| QueryJob::new(q, mode)).collect();
            let search: Arc<dyn SearchSource> = match source {
                SearchBackend::Aggregator => Arc::new(acquisition.aggregator_search()),
                SearchBackend::Api => Arc::new(acquisition.api_search()?),
            };
            let results = acquisition.orchestrator(search).acquire(jobs).await;

            let total: usize = results.values().map(Vec::len).sum();
            tracing::info!("Acquired {} records for {} queries", total, results.len());
            write_output(&results, output.as_deref())
        }
        Commands::News { limit, output } => {
            if let Some(limit) = limit {
                config.market_news.limit = limit;
            }

            let acquisition = build(config, cli.http)?;
            let records = acquisition.market_headlines().await?;
            write_output(&records, output.as_deref())
        }
        Commands::Pages { map, output } => {
            let targets = load_page_targets(&map)
                .with_context(|| format!("loading targets from {}", map.display()))?;

            let acquisition = build(config, cli.http)?;
            let results = acquisition.acquire_pages(targets).await;
            write_output(&results, output.as_deref())
        }
        Commands::Cookie { command } => run_cookie(command, config, cli.http).await,
    }
}

fn build(config: AcquisitionConfig, http: bool) -> anyhow::Result<Acquisition> {
    let config = Arc::new(config);
    let events: Arc<dyn EventSink> = Arc::new(TracingSink);

    let fetcher: Arc<dyn PageFetcher> = if http {
        Arc::new(HttpFetcher::new(&config)?)
    } else {
        Arc::new(ChromeFetcher::new(config.clone(), events.clone()))
    };

    Ok(Acquisition::with_parts(config, fetcher, events)?)
}

async fn run_cookie(command: CookieCommands, config: AcquisitionConfig, http: bool) -> anyhow::Result<()> {
    match command {
        CookieCommands::Set { url, cookie } => {
            let host = parse_host(&url)?;
            let acquisition = build(config, http)?;

            let record = acquisition
                .cookies()
                .save_manual(&host, &cookie)
                .with_context(|| format!("no credential saved for {}", host))?;
            println!("Saved {} cookies for {}", record.cookies.len(), host);
            Ok(())
        }
        CookieCommands::Login { url, wait } => {
            let target = Url::parse(&url).with_context(|| format!("invalid URL {}", url))?;
            let host = parse_host(&url)?;
            let config = Arc::new(config);
            let events: Arc<dyn EventSink> = Arc::new(TracingSink);

            let browser = ChromeFetcher::new(config.clone(), events.clone());
            println!("Log in within {} seconds in the opened browser window", wait);
            let cookies = browser
                .capture_session(&target, Duration::from_secs(wait))
                .await?;

            let acquisition = Acquisition::with_parts(config, Arc::new(browser), events)?;
            let record = acquisition
                .cookies()
                .save_from_session(&host, &cookies)
                .with_context(|| format!("no credential saved for {}", host))?;
            println!("Saved {} cookies for {}", record.cookies.len(), host);
            Ok(())
        }
        CookieCommands::Check { url } => {
            let host = parse_host(&url)?;
            let acquisition = build(config, http)?;

            match acquisition.cookies().valid_credential(&host) {
                Some(record) => {
                    let expires = record
                        .expires_at
                        .map(|e| e.to_rfc3339())
                        .unwrap_or_else(|| "unknown".to_string());
                    println!("{}: valid, {} cookies, expires {}", host, record.cookies.len(), expires);
                }
                None => println!("{}: no usable credential", host),
            }
            Ok(())
        }
    }
}

fn parse_host(url: &str) -> anyhow::Result<String> {
    let parsed = Url::parse(url).with_context(|| format!("invalid URL {}", url))?;
    host_key(&parsed).with_context(|| format!("URL {} has no host", url))
}

fn write_output<T: Serialize>(value: &T, path: Option<&Path>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
            tracing::info!("Wrote results to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
