use acquisition::SearchMode;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "research", version, about = "Query-driven web acquisition for industry research")]
pub struct Cli {
    #[arg(long, global = true, help = "JSON config file (defaults to ./research.json when present)")]
    pub config: Option<PathBuf>,
    #[arg(long, global = true, help = "Show the browser window")]
    pub headed: bool,
    #[arg(long, global = true, help = "Fetch with plain HTTP instead of a browser")]
    pub http: bool,
    #[arg(long, global = true, help = "Directory holding per-host credential files")]
    pub cookie_dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Single worker and browser session, with longer delays")]
    pub polite: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Search each query and extract the result pages
    Acquire {
        #[arg(required = true)]
        queries: Vec<String>,
        #[arg(long, default_value = "web", help = "web, news or financial")]
        mode: SearchMode,
        #[arg(long, value_enum, default_value_t = SearchBackend::Aggregator)]
        source: SearchBackend,
        #[arg(long, help = "Stop a query once its text exceeds this many characters")]
        budget: Option<usize>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Fetch the latest market headlines
    News {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Fetch pages listed in a JSON target file
    Pages {
        #[arg(long)]
        map: PathBuf,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    Cookie {
        #[command(subcommand)]
        command: CookieCommands,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SearchBackend {
    /// Rendered aggregator result pages
    Aggregator,
    /// Keyed search API (needs ACQ_SEARCH_API_KEY or search_api.api_key)
    Api,
}

#[derive(Subcommand, Debug)]
pub enum CookieCommands {
    /// Store a raw `name=value; ...` cookie string for the URL's host
    Set { url: String, cookie: String },
    /// Open a browser, wait for a manual login, then store its cookies
    Login {
        url: String,
        #[arg(long, default_value_t = 30, help = "Seconds to wait before reading cookies")]
        wait: u64,
    },
    /// Report whether a usable credential exists for the URL's host
    Check { url: String },
}
