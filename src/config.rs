use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

const MIN_FILE_SIZE_LIMIT: u64 = 1024 * 1024;

/// Configuration errors detected at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("API base URL is required")]
    MissingBaseUrl,

    #[error("Worker auth token is required")]
    MissingAuthToken,

    #[error(
        "Heartbeat interval ({heartbeat_ms}ms) must be shorter than the lease timeout ({lease_ms}ms)"
    )]
    HeartbeatNotShorterThanLease { heartbeat_ms: u64, lease_ms: u64 },

    #[error("Poll interval must be greater than zero")]
    ZeroPollInterval,

    #[error("Heartbeat interval must be greater than zero")]
    ZeroHeartbeatInterval,

    #[error("Concurrent jobs must be at least 1")]
    NoConcurrency,

    #[error("Max file size too small ({0} bytes, minimum 1MiB)")]
    MaxFileSizeTooSmall(u64),

    #[error("Thumbnail size must be greater than zero")]
    ZeroThumbnailSize,

    #[error("Max image size must be greater than zero")]
    ZeroMaxImageSize,

    #[error("No write permission to temp directory: {0}")]
    TempDirNotWritable(PathBuf),
}

/// Output knobs for the processing pipeline.
///
/// These are worker-wide defaults; a job's input payload may override some
/// of them (see [`crate::pipeline::JobOptions`]).
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    /// Longest side of the converted image, in pixels
    pub max_image_size: u32,
    /// Quality hint carried into the metadata record
    pub compression_quality: u8,
    pub generate_thumbnails: bool,
    pub thumbnail_size: u32,
    pub include_statistics: bool,
    /// Emit grey+alpha images with missing pixels fully transparent
    pub preserve_transparency: bool,
    /// Add WGS84 bounds to the metadata record when the CRS is supported
    pub reproject_bounds: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_image_size: 4096,
            compression_quality: 85,
            generate_thumbnails: true,
            thumbnail_size: 256,
            include_statistics: true,
            preserve_transparency: true,
            reproject_bounds: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub api_base_url: String,
    pub auth_token: String,
    pub api_timeout_ms: u64,
    /// Per-request timeout for file downloads and uploads
    pub transfer_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Lease timeout enforced by the queue backend
    pub lease_timeout_ms: u64,
    /// Upper bound from claim to terminal transition
    pub max_processing_time_ms: u64,
    pub max_concurrent_jobs: usize,
    pub max_file_size: u64,
    pub temp_dir: PathBuf,
    /// Attempts for delivering `complete`/`fail` before raising an alert
    pub terminal_retry_attempts: u32,
    pub terminal_retry_delay_ms: u64,
    pub processing: ProcessingConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: generate_worker_id(),
            api_base_url: "http://localhost:5000".to_string(),
            auth_token: String::new(),
            api_timeout_ms: 30_000,
            transfer_timeout_ms: 120_000,
            poll_interval_ms: 5_000,
            heartbeat_interval_ms: 30_000,
            lease_timeout_ms: 120_000,
            max_processing_time_ms: 3_600_000,
            max_concurrent_jobs: 1,
            max_file_size: 100 * 1024 * 1024,
            temp_dir: std::env::temp_dir(),
            terminal_retry_attempts: 3,
            terminal_retry_delay_ms: 1_000,
            processing: ProcessingConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(api_base_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            auth_token: auth_token.into(),
            ..Default::default()
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Back-off applied after an unexpected error in the worker loop itself.
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.saturating_mul(2))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn max_processing_time(&self) -> Duration {
        Duration::from_millis(self.max_processing_time_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn terminal_retry_delay(&self) -> Duration {
        Duration::from_millis(self.terminal_retry_delay_ms)
    }

    /// Every configuration problem, in a stable order.
    pub fn issues(&self) -> Vec<ConfigError> {
        let mut issues = Vec::new();

        if self.api_base_url.trim().is_empty() {
            issues.push(ConfigError::MissingBaseUrl);
        }
        if self.auth_token.trim().is_empty() {
            issues.push(ConfigError::MissingAuthToken);
        }
        if self.heartbeat_interval_ms >= self.lease_timeout_ms {
            issues.push(ConfigError::HeartbeatNotShorterThanLease {
                heartbeat_ms: self.heartbeat_interval_ms,
                lease_ms: self.lease_timeout_ms,
            });
        }
        if self.poll_interval_ms == 0 {
            issues.push(ConfigError::ZeroPollInterval);
        }
        if self.heartbeat_interval_ms == 0 {
            issues.push(ConfigError::ZeroHeartbeatInterval);
        }
        if self.max_concurrent_jobs < 1 {
            issues.push(ConfigError::NoConcurrency);
        }
        if self.max_file_size < MIN_FILE_SIZE_LIMIT {
            issues.push(ConfigError::MaxFileSizeTooSmall(self.max_file_size));
        }
        if self.processing.thumbnail_size == 0 {
            issues.push(ConfigError::ZeroThumbnailSize);
        }
        if self.processing.max_image_size == 0 {
            issues.push(ConfigError::ZeroMaxImageSize);
        }
        if !temp_dir_writable(&self.temp_dir) {
            issues.push(ConfigError::TempDirNotWritable(self.temp_dir.clone()));
        }

        issues
    }

    /// Startup check. Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.issues().into_iter().next() {
            Some(issue) => Err(issue),
            None => Ok(()),
        }
    }
}

/// `worker-` followed by eight hex characters.
pub fn generate_worker_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}

fn temp_dir_writable(dir: &std::path::Path) -> bool {
    tempfile::Builder::new()
        .prefix(".raster-worker-probe")
        .tempfile_in(dir)
        .is_ok()
}
