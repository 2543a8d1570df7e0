//! search-tap — binary entrypoint.
//! Parses the CLI, opens the store, then runs one acquisition loop per filter until
//! SIGINT / SIGTERM.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use search_tap::config::{
    load_config_default, load_config_from, AcquireConfig, Credentials, TapConfig,
};
use search_tap::ingest::archive::{RotatingArchive, TeeSink, DEFAULT_MAX_PER_FILE};
use search_tap::ingest::providers::twitter::{TwitterSearchClient, DEFAULT_API_BASE};
use search_tap::ingest::{
    spawn_loops, AcquisitionLoop, FileStore, Filter, ResultSink, ResultType, SearchClient,
    SharedCooldown, WatermarkStore,
};

#[derive(Parser)]
#[command(name = "search-tap", version)]
#[command(about = "Query a search API and store results incrementally, resuming from the last seen id")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull results from the paginated search API.
    Search(SearchArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum ResultTypeArg {
    Mixed,
    Recent,
    Popular,
}

impl From<ResultTypeArg> for ResultType {
    fn from(v: ResultTypeArg) -> Self {
        match v {
            ResultTypeArg::Mixed => ResultType::Mixed,
            ResultTypeArg::Recent => ResultType::Recent,
            ResultTypeArg::Popular => ResultType::Popular,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
#[value(rename_all = "UPPER")]
enum Verbosity {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
    Fatal,
}

impl Verbosity {
    fn directive(self) -> &'static str {
        match self {
            Verbosity::Debug => "debug",
            Verbosity::Info => "info",
            Verbosity::Warn => "warn",
            Verbosity::Error | Verbosity::Critical | Verbosity::Fatal => "error",
        }
    }
}

#[derive(clap::Args)]
struct SearchArgs {
    /// Search query, including operators.
    #[arg(short, long)]
    query: Option<String>,
    /// "latitude,longitude,radius" with radius in mi or km, e.g. 37.781157,-122.398720,1mi
    #[arg(short, long)]
    geocode: Option<String>,
    /// ISO 639-1 language code.
    #[arg(short, long)]
    lang: Option<String>,
    #[arg(short, long, value_enum, ignore_case = true, default_value = "mixed")]
    result_type: ResultTypeArg,
    /// TOML/JSON file with an [acquire] table and [[filters]]; each filter gets its own loop.
    /// Defaults to $TAP_CONFIG_PATH, then config/tap.toml, then config/tap.json.
    #[arg(long)]
    filters: Option<PathBuf>,
    /// Mandatory sleep in seconds before every search call.
    #[arg(short, long)]
    wait: Option<f64>,
    /// Ignore stored watermarks and start from the newest results.
    #[arg(short, long)]
    clean: bool,

    #[arg(long, env = "TAP_CONSUMER_KEY")]
    consumer_key: Option<String>,
    #[arg(long, env = "TAP_CONSUMER_SECRET", hide_env_values = true)]
    consumer_secret: Option<String>,
    #[arg(long, env = "TAP_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
    #[arg(long, env = "TAP_API_BASE", default_value = DEFAULT_API_BASE)]
    api_base: String,

    /// Store directory.
    #[arg(short = 'd', long = "db", env = "TAP_STORE", default_value = "data")]
    store: PathBuf,
    /// Name of the watermark collection.
    #[arg(long, default_value = "queries")]
    queries_collection: String,
    /// Name of the record collection.
    #[arg(long, default_value = "tweets")]
    tweets_collection: String,
    /// Also append every record to rotating JSON-lines files under this directory.
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "TAP_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
    #[arg(short, long, value_enum, ignore_case = true, default_value = "WARN")]
    verbosity: Verbosity,
    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(verbosity: Verbosity, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

/// Merge the flag-built filter with the file's filters; flags override file tuning.
fn resolve_config(args: &SearchArgs) -> Result<TapConfig> {
    let mut cfg = match &args.filters {
        Some(p) => load_config_from(p)?,
        None => load_config_default()?,
    };
    if args.query.is_some() || args.geocode.is_some() {
        cfg.filters.insert(
            0,
            Filter {
                query: args.query.clone(),
                geocode: args.geocode.clone(),
                lang: args.lang.clone(),
                result_type: args.result_type.into(),
            },
        );
    }
    if let Some(w) = args.wait {
        cfg.acquire.pacing_secs = w;
    }
    if args.clean {
        cfg.acquire.clean_start = true;
    }
    let cfg = cfg.validated()?;
    if cfg.filters.is_empty() {
        return Err(anyhow!("a query or a geocode is required (or --filters)"));
    }
    Ok(cfg)
}

async fn access_token(args: &SearchArgs) -> Result<String> {
    let creds = Credentials {
        consumer_key: args.consumer_key.clone(),
        consumer_secret: args.consumer_secret.clone(),
        access_token: args.access_token.clone(),
    }
    .validate()?;
    if let Some(t) = creds.access_token {
        return Ok(t);
    }
    tracing::warn!("no access token provided, obtaining one now");
    let (Some(key), Some(secret)) = (creds.consumer_key, creds.consumer_secret) else {
        return Err(anyhow!("consumer key and secret are required"));
    };
    let token = TwitterSearchClient::obtain_access_token(&args.api_base, &key, &secret)
        .await
        .context("obtaining access token")?;
    tracing::warn!(access_token = %token, "access token obtained; pass it with --access-token next time");
    Ok(token)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::error!(error = ?e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run_search(args: SearchArgs) -> Result<()> {
    let cfg = resolve_config(&args)?;
    let acquire: AcquireConfig = cfg.acquire.clone();

    if let Some(addr) = args.metrics_addr {
        search_tap::metrics::install(addr)?;
    }

    let token = access_token(&args).await?;
    let client: Arc<dyn SearchClient> = Arc::new(TwitterSearchClient::new(
        args.api_base.clone(),
        token,
        acquire.page_size,
    ));

    let store = Arc::new(
        FileStore::open(&args.store, &args.queries_collection, &args.tweets_collection)
            .context("couldn't open the store, check --db")?,
    );
    let watermarks: Arc<dyn WatermarkStore> = store.clone();
    let sink: Arc<dyn ResultSink> = match &args.archive_dir {
        Some(dir) => Arc::new(TeeSink::new(
            store.clone(),
            Arc::new(RotatingArchive::open(dir, DEFAULT_MAX_PER_FILE)?),
        )),
        None => store.clone(),
    };

    let cancel = CancellationToken::new();
    let cooldown = SharedCooldown::new();
    let loops = cfg
        .filters
        .into_iter()
        .map(|f| {
            AcquisitionLoop::new(
                f,
                acquire.clone(),
                client.clone(),
                watermarks.clone(),
                sink.clone(),
                cooldown.clone(),
                cancel.clone(),
            )
        })
        .collect::<Vec<_>>();
    tracing::info!(loops = loops.len(), "starting acquisition");
    let mut set = spawn_loops(loops);

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::warn!("shutdown signal received, shutting down");
            cancel.cancel();
        });
    }

    let mut first_err = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(summary)) => tracing::info!(
                filter = %summary.filter,
                walks = summary.walks,
                records = summary.records,
                "loop finished"
            ),
            Ok(Err(e)) => {
                tracing::error!(error = ?e, "loop failed to start");
                cancel.cancel();
                first_err.get_or_insert(e);
            }
            Err(e) => {
                tracing::error!(error = ?e, "loop task panicked");
                cancel.cancel();
                first_err.get_or_insert(anyhow!(e));
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let Command::Search(args) = cli.command;
    init_tracing(args.verbosity, args.log_json);

    match run_search(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "fatal");
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}
