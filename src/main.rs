use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use raster_worker::config::{generate_worker_id, ProcessingConfig, WorkerConfig};
use raster_worker::node::Node;
use raster_worker::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "raster-worker")]
#[command(version)]
#[command(about = "Pull-based GeoTIFF processing worker for an HTTP job queue")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Claim and process jobs until interrupted
    Run(WorkerArgs),

    /// Validate the configuration and print a summary
    CheckConfig {
        #[command(flatten)]
        worker: WorkerArgs,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(clap::Args, Debug)]
struct WorkerArgs {
    /// Base URL of the job queue API
    #[arg(long, env = "API_BASE_URL", default_value = "http://localhost:5000")]
    api_base_url: String,

    /// Token sent as `Authorization: Worker <token>`
    #[arg(long, env = "WORKER_AUTH_TOKEN", default_value = "", hide_env_values = true)]
    auth_token: String,

    /// Worker identity (default: worker-<8 hex>)
    #[arg(long, env = "WORKER_ID")]
    worker_id: Option<String>,

    /// Seconds between claim attempts when the queue is empty
    #[arg(long, env = "POLL_INTERVAL", default_value = "5")]
    poll_interval: u64,

    /// Seconds between lease heartbeats
    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value = "30")]
    heartbeat_interval: u64,

    /// Seconds the queue keeps a lease without a heartbeat
    #[arg(long, env = "LEASE_TIMEOUT", default_value = "120")]
    lease_timeout: u64,

    /// Upper bound in seconds on one job's processing
    #[arg(long, env = "MAX_PROCESSING_TIME", default_value = "3600")]
    max_processing_time: u64,

    /// Jobs processed at the same time
    #[arg(long, env = "CONCURRENT_JOBS", default_value = "1")]
    concurrent_jobs: usize,

    /// Per-file download ceiling in bytes
    #[arg(long, env = "MAX_FILE_SIZE", default_value = "104857600")]
    max_file_size: u64,

    /// Parent directory for job workspaces (default: system temp dir)
    #[arg(long, env = "TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Seconds before an API request times out
    #[arg(long, env = "API_TIMEOUT", default_value = "30")]
    api_timeout: u64,

    /// Attempts for delivering complete/fail
    #[arg(long, env = "MAX_RETRY_ATTEMPTS", default_value = "3")]
    max_retry_attempts: u32,

    // === Processing ===
    /// Longest side of converted images, in pixels
    #[arg(long, env = "MAX_IMAGE_SIZE", default_value = "4096")]
    max_image_size: u32,

    /// Quality hint recorded in the metadata
    #[arg(long, env = "COMPRESSION_QUALITY", default_value = "85")]
    compression_quality: u8,

    #[arg(long, env = "GENERATE_THUMBNAILS", default_value_t = true, action = clap::ArgAction::Set)]
    generate_thumbnails: bool,

    #[arg(long, env = "THUMBNAIL_SIZE", default_value = "256")]
    thumbnail_size: u32,

    #[arg(long, env = "INCLUDE_STATISTICS", default_value_t = true, action = clap::ArgAction::Set)]
    include_statistics: bool,

    #[arg(long, env = "PRESERVE_TRANSPARENCY", default_value_t = true, action = clap::ArgAction::Set)]
    preserve_transparency: bool,

    #[arg(long, env = "REPROJECT_BOUNDS", default_value_t = true, action = clap::ArgAction::Set)]
    reproject_bounds: bool,

    // === Logging ===
    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, default_value = "text")]
    log_format: LogFormat,
}

impl WorkerArgs {
    fn to_config(&self) -> WorkerConfig {
        let defaults = WorkerConfig::default();
        WorkerConfig {
            worker_id: self.worker_id.clone().unwrap_or_else(generate_worker_id),
            api_base_url: self.api_base_url.clone(),
            auth_token: self.auth_token.clone(),
            api_timeout_ms: self.api_timeout.saturating_mul(1000),
            poll_interval_ms: self.poll_interval.saturating_mul(1000),
            heartbeat_interval_ms: self.heartbeat_interval.saturating_mul(1000),
            lease_timeout_ms: self.lease_timeout.saturating_mul(1000),
            max_processing_time_ms: self.max_processing_time.saturating_mul(1000),
            max_concurrent_jobs: self.concurrent_jobs,
            max_file_size: self.max_file_size,
            temp_dir: self
                .temp_dir
                .clone()
                .unwrap_or_else(|| defaults.temp_dir.clone()),
            terminal_retry_attempts: self.max_retry_attempts,
            processing: ProcessingConfig {
                max_image_size: self.max_image_size,
                compression_quality: self.compression_quality,
                generate_thumbnails: self.generate_thumbnails,
                thumbnail_size: self.thumbnail_size,
                include_statistics: self.include_statistics,
                preserve_transparency: self.preserve_transparency,
                reproject_bounds: self.reproject_bounds,
            },
            ..defaults
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ConfigCheckOutput {
    valid: bool,
    issues: Vec<String>,
    summary: ConfigSummary,
}

#[derive(Serialize)]
struct ConfigSummary {
    worker_id: String,
    api_url: String,
    poll_interval_secs: u64,
    heartbeat_interval_secs: u64,
    lease_timeout_secs: u64,
    max_processing_time_secs: u64,
    max_file_size_mb: u64,
    concurrent_jobs: usize,
    temp_dir: String,
    max_image_size: u32,
    generate_thumbnails: bool,
    include_statistics: bool,
}

impl ConfigSummary {
    fn from_config(config: &WorkerConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            api_url: config.api_base_url.clone(),
            poll_interval_secs: config.poll_interval().as_secs(),
            heartbeat_interval_secs: config.heartbeat_interval().as_secs(),
            lease_timeout_secs: config.lease_timeout().as_secs(),
            max_processing_time_secs: config.max_processing_time().as_secs(),
            max_file_size_mb: config.max_file_size / (1024 * 1024),
            concurrent_jobs: config.max_concurrent_jobs,
            temp_dir: config.temp_dir.display().to_string(),
            max_image_size: config.processing.max_image_size,
            generate_thumbnails: config.processing.generate_thumbnails,
            include_statistics: config.processing.include_statistics,
        }
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&args.log_level, &args.log_format);

    let config = args.to_config();
    let node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            tracing::error!(error = %e, "Worker configuration rejected");
            return Err(e.into());
        }
    };

    let shutdown = install_shutdown_handler();
    let summary = node.run(shutdown).await;
    if summary.undelivered > 0 {
        tracing::warn!(
            undelivered = summary.undelivered,
            "Some terminal transitions were never delivered"
        );
    }
    Ok(())
}

fn check_config(args: WorkerArgs, output: &OutputFormat) -> Result<bool, Box<dyn std::error::Error>> {
    let config = args.to_config();
    let issues: Vec<String> = config.issues().iter().map(|i| i.to_string()).collect();
    let report = ConfigCheckOutput {
        valid: issues.is_empty(),
        issues,
        summary: ConfigSummary::from_config(&config),
    };

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => {
            println!("Worker Configuration");
            println!("{}", "=".repeat(40));
            println!("Valid: {}", report.valid);
            if !report.issues.is_empty() {
                println!();
                println!("Issues:");
                for issue in &report.issues {
                    println!("  - {}", issue);
                }
            }
            let s = &report.summary;
            println!();
            println!("{:<24} {}", "Worker ID:", s.worker_id);
            println!("{:<24} {}", "API URL:", s.api_url);
            println!("{:<24} {}s", "Poll interval:", s.poll_interval_secs);
            println!("{:<24} {}s", "Heartbeat interval:", s.heartbeat_interval_secs);
            println!("{:<24} {}s", "Lease timeout:", s.lease_timeout_secs);
            println!("{:<24} {}s", "Max processing time:", s.max_processing_time_secs);
            println!("{:<24} {}MB", "Max file size:", s.max_file_size_mb);
            println!("{:<24} {}", "Concurrent jobs:", s.concurrent_jobs);
            println!("{:<24} {}", "Temp dir:", s.temp_dir);
            println!("{:<24} {}", "Max image size:", s.max_image_size);
            println!("{:<24} {}", "Thumbnails:", s.generate_thumbnails);
            println!("{:<24} {}", "Statistics:", s.include_statistics);
        }
    }
    Ok(report.valid)
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(worker_args) => {
            run_worker(worker_args).await?;
        }
        Commands::CheckConfig { worker, output } => {
            if !check_config(worker, &output)? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
