//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use coalescer_service::config::Config;
use coalescer_service::coordinator::{CallError, Fingerprint, RequestCoordinator};
use coalescer_service::fetch::{FetchError, FetchResponse, HttpFetcher};
use coalescer_service::metrics;
use coalescer_service::store::{FilesystemStore, StoreConfig};

use crate::logging;

/// The request name used when none is configured.
///
/// A stable name lets persistent stores serve responses across invocations.
const DEFAULT_REQUEST_NAME: &str = "fetch";

/// Coalescer commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch URLs, coalescing duplicates and caching responses in the configured store.
    Fetch {
        /// The URLs to fetch.
        #[arg(required = true, value_name = "URL")]
        urls: Vec<String>,
    },

    /// Remove expired values from the filesystem store.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the fingerprint of a request.
    Fingerprint {
        /// The request arguments as JSON.
        #[arg(value_name = "ARGS_JSON")]
        args: String,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(version, about, bin_name = "coalescer")]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We're still single-threaded at this point, the runtime is started below.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, hostname);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure metrics")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("coalescer")
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    match cli.command {
        Command::Fetch { urls } => runtime.block_on(fetch(&config, urls))?,
        Command::Cleanup { dry_run } => cleanup(&config, dry_run)?,
        Command::Fingerprint { args } => println!("{}", fingerprint(&config, &args)?),
    }

    Ok(())
}

fn request_name(config: &Config) -> &str {
    config
        .request_name
        .as_deref()
        .unwrap_or(DEFAULT_REQUEST_NAME)
}

/// Fetches all `urls` concurrently and prints one line per URL, in order.
async fn fetch(config: &Config, urls: Vec<String>) -> Result<()> {
    let store = config
        .store
        .open::<FetchResponse>()
        .await
        .with_context(|| format!("failed to open {} store", config.store.backend_name()))?;
    let fetcher = HttpFetcher::new(&config.fetch).context("failed to create HTTP client")?;
    let coordinator = RequestCoordinator::new(fetcher.into_executor(), store)
        .with_request_name(request_name(config));

    let results =
        futures::future::join_all(urls.iter().map(|url| coordinator.call(url.clone()))).await;

    let mut failures = 0;
    for (url, result) in urls.iter().zip(results) {
        if result.is_err() {
            failures += 1;
        }
        println!("{}", format_result(url, &result));
    }

    if failures > 0 {
        bail!("{failures} of {} fetches failed", urls.len());
    }
    Ok(())
}

fn format_result(url: &str, result: &Result<FetchResponse, CallError<FetchError>>) -> String {
    match result {
        Ok(response) => format!("{} {} {}", response.status, response.body.len(), url),
        Err(err) => format!("error {url}: {err}"),
    }
}

fn cleanup(config: &Config, dry_run: bool) -> Result<()> {
    let StoreConfig::Filesystem(store_config) = &config.store else {
        bail!(
            "cleanup is only supported for the filesystem store, not {}",
            config.store.backend_name()
        );
    };

    let store = FilesystemStore::<serde_json::Value>::from_config(store_config)
        .context("failed to open filesystem store")?;
    let stats = store
        .cleanup(dry_run)
        .context("failed to clean up filesystem store")?;

    let verb = if dry_run { "Would remove" } else { "Removed" };
    println!(
        "{verb} {} files ({} bytes), retained {} files ({} bytes)",
        stats.removed_files, stats.removed_bytes, stats.retained_files, stats.retained_bytes
    );
    Ok(())
}

fn fingerprint(config: &Config, args: &str) -> Result<Fingerprint> {
    let args: serde_json::Value =
        serde_json::from_str(args).context("arguments are not valid JSON")?;
    Fingerprint::compute(request_name(config), &args).context("failed to compute fingerprint")
}
