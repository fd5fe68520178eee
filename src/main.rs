//! # Image Harvester CLI (`image-harvester`)
//!
//! Searches Flickr for each query, downloads the results over a bounded
//! worker pool, and records every attempt in `<prefix>.csv` and
//! `<prefix>.jsonl` under the output directory.
//!
//! ## Usage
//!
//! ```bash
//! export FLICKR_API_KEY=...
//! image-harvester --query "smiski" --query "smiski figure" \
//!     --out-dir data/raw/smiski --label smiski --cc-only
//! image-harvester --query "figurine" --out-dir data/raw/non_smiski --label non_smiski
//! ```
//!
//! `--label` must name one of the two classes (`--positive-class`,
//! `--negative-class`; `smiski` and `non_smiski` by default).
//!
//! ## Exit status
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Run completed (individual skips are not failures) |
//! | 1 | Run-level failure (output directory, manifest I/O) |
//! | 2 | Configuration error, including a missing `FLICKR_API_KEY` or a label outside the two classes |
//! | 130 | Interrupted; files and rows already written are kept |

use anyhow::Context;
use clap::Parser;
use image_harvester::config::{credential_from_env, HarvestConfig};
use image_harvester::harvest::{ConfigError, FlickrProvider, HarvestPipeline, HttpFetcher, PipelineError};
use image_harvester::traits::LicenseFilter;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Build a labelled image dataset from Flickr search results.
#[derive(Parser, Debug)]
#[command(name = "image-harvester", version)]
struct Cli {
    /// Search term; repeat for several queries (run sequentially).
    #[arg(short, long = "query", required = true)]
    queries: Vec<String>,

    /// Directory receiving images and both manifest files.
    #[arg(short, long)]
    out_dir: PathBuf,

    /// Class label written on every manifest row; one of the two classes.
    #[arg(short, long)]
    label: String,

    /// Name of the positive class.
    #[arg(long, default_value = "smiski")]
    positive_class: String,

    /// Name of the negative class.
    #[arg(long, default_value = "non_smiski")]
    negative_class: String,

    /// Maximum results per query.
    #[arg(long, default_value_t = 500)]
    limit: usize,

    /// Minimum accepted image width in pixels.
    #[arg(long, default_value_t = 256)]
    min_width: u32,

    /// Minimum accepted image height in pixels.
    #[arg(long, default_value_t = 256)]
    min_height: u32,

    /// Maximum simultaneous downloads.
    #[arg(short, long, default_value_t = 16)]
    concurrency: usize,

    /// Maximum simultaneous connections to one host.
    #[arg(long, default_value_t = 8)]
    per_host: usize,

    /// Only request openly licensed images.
    #[arg(long)]
    cc_only: bool,

    /// File stem of the manifest files.
    #[arg(long, default_value = "download_manifest")]
    manifest_prefix: String,

    /// Pause between queries, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    query_pause_ms: u64,
}

impl From<Cli> for HarvestConfig {
    fn from(cli: Cli) -> Self {
        HarvestConfig {
            queries: cli.queries,
            out_dir: cli.out_dir,
            label: cli.label,
            classes: [cli.positive_class, cli.negative_class],
            limit: cli.limit,
            min_width: cli.min_width,
            min_height: cli.min_height,
            concurrency: cli.concurrency,
            per_host: cli.per_host,
            license: if cli.cc_only {
                LicenseFilter::Open
            } else {
                LicenseFilter::Any
            },
            manifest_prefix: cli.manifest_prefix,
            query_pause: Duration::from_millis(cli.query_pause_ms),
        }
    }
}

async fn run(config: HarvestConfig, api_key: String) -> anyhow::Result<()> {
    let provider = FlickrProvider::new(api_key).context("failed to build search client")?;
    let fetcher = HttpFetcher::new(config.per_host).context("failed to build download client")?;
    let pipeline = HarvestPipeline::new(provider, fetcher, config);

    let result = pipeline.execute().await?;
    info!(
        candidates = result.stats.candidates,
        accepted = result.stats.accepted,
        skipped = result.stats.skipped,
        total_ms = result.stats.total_duration_ms,
        manifest = %result.jsonl_path.display(),
        "Harvest finished"
    );
    Ok(())
}

fn config_error(e: ConfigError) -> ExitCode {
    error!("{}", e);
    ExitCode::from(2)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = HarvestConfig::from(Cli::parse());
    if let Err(e) = config.validate() {
        return config_error(e);
    }
    let api_key = match credential_from_env() {
        Ok(key) => key,
        Err(e) => return config_error(e),
    };

    tokio::select! {
        result = run(config, api_key) => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) if matches!(e.downcast_ref::<PipelineError>(), Some(PipelineError::Config(_))) => {
                error!("{:#}", e);
                ExitCode::from(2)
            }
            Err(e) => {
                error!("Harvest failed: {:#}", e);
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; files and manifest rows written so far are kept");
            ExitCode::from(130)
        }
    }
}
