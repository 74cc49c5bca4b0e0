use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::config::WorkerConfig;
use crate::lease::job::{ErrorRecord, Job};

/// Errors talking to the queue backend or to object storage.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("unexpected response from {url}: {reason}")]
    Protocol { url: String, reason: String },

    #[error("invalid auth token header value")]
    InvalidToken,

    #[error("transfer exceeded size limit: {received} > {limit} bytes")]
    TooLarge { received: u64, limit: u64 },

    #[error("file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Response wrapper used by every queue endpoint: `{success, data}`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: Option<bool>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ClaimData {
    job: Option<Job>,
}

#[derive(Debug, Deserialize)]
struct InputListing {
    #[serde(default)]
    files: Vec<RemoteFile>,
}

fn unknown_file_name() -> String {
    "unknown".to_string()
}

/// One entry of a job's input listing.
///
/// Entries the backend could not resolve carry `error` instead of a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    #[serde(default = "unknown_file_name")]
    pub file_name: String,
    #[serde(default)]
    pub file_key: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub file_key: String,
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTicket {
    pub upload_url: String,
    pub file_key: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// HTTP client for the job queue API.
///
/// Cheap to clone; clones share one connection pool, so concurrent job
/// supervisors can each hold a copy. Every call is addressed by job id and
/// carries no other mutable state.
#[derive(Debug, Clone)]
pub struct LeaseClient {
    http: reqwest::Client,
    base_url: String,
    api_timeout: Duration,
    transfer_timeout: Duration,
}

impl LeaseClient {
    pub fn new(config: &WorkerConfig) -> Result<Self, LeaseError> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Worker {}", config.auth_token))
            .map_err(|_| LeaseError::InvalidToken)?;
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| LeaseError::Transport {
                url: config.api_base_url.clone(),
                source: e,
            })?;

        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_timeout: config.api_timeout(),
            transfer_timeout: config.transfer_timeout(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn job_url(&self, job_id: &str, action: &str) -> String {
        self.url(&format!("/api/internal/geo-jobs/{}/{}", job_id, action))
    }

    /// Request exactly one unclaimed job.
    ///
    /// `Ok(None)` means the queue had nothing to hand out; errors are
    /// reserved for transport and protocol failures.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>, LeaseError> {
        let url = self.url("/api/internal/geo-jobs/claim");
        let response = self
            .http
            .post(&url)
            .timeout(self.api_timeout)
            .json(&json!({ "workerId": worker_id }))
            .send()
            .await
            .map_err(|e| transport(&url, e))?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let envelope: Envelope<ClaimData> = read_json(&url, response).await?;
        if envelope.success == Some(false) {
            return Ok(None);
        }

        let job = envelope.data.and_then(|d| d.job);
        if let Some(ref job) = job {
            tracing::info!(job_id = %job.id, task_type = %job.task_type, worker_id, "Claimed job");
        } else {
            tracing::debug!(worker_id, "No jobs available");
        }
        Ok(job)
    }

    /// Extend the lease on `job_id`.
    pub async fn heartbeat(&self, job_id: &str, worker_id: &str) -> Result<(), LeaseError> {
        let url = self.job_url(job_id, "heartbeat");
        self.patch(&url, json!({ "workerId": worker_id })).await
    }

    /// Best-effort progress report. Failures are logged and swallowed.
    pub async fn progress(&self, job_id: &str, worker_id: &str, percent: u8, message: &str) {
        let url = self.job_url(job_id, "progress");
        let body = json!({
            "progress": percent,
            "message": message,
            "workerId": worker_id,
        });
        if let Err(e) = self.patch(&url, body).await {
            tracing::warn!(job_id, percent, error = %e, "Failed to update job progress");
        }
    }

    /// Mark `job_id` completed.
    pub async fn complete<P: Serialize + ?Sized>(
        &self,
        job_id: &str,
        payload: &P,
        artifact_keys: &[String],
    ) -> Result<(), LeaseError> {
        let url = self.job_url(job_id, "complete");
        let body = json!({
            "outputPayload": payload,
            "outputKeys": artifact_keys,
        });
        self.patch(&url, body).await
    }

    /// Mark `job_id` failed.
    pub async fn fail(&self, job_id: &str, record: &ErrorRecord) -> Result<(), LeaseError> {
        let url = self.job_url(job_id, "fail");
        self.patch(&url, json!({ "error": record })).await
    }

    /// List the input files of a job with their download URLs.
    pub async fn input_files(&self, job_id: &str) -> Result<Vec<RemoteFile>, LeaseError> {
        let url = self.url(&format!("/api/geo-jobs/{}/download/input", job_id));
        let response = self
            .http
            .get(&url)
            .timeout(self.api_timeout)
            .send()
            .await
            .map_err(|e| transport(&url, e))?;

        let envelope: Envelope<InputListing> = read_json(&url, response).await?;
        Ok(envelope.data.map(|d| d.files).unwrap_or_default())
    }

    /// Exchange artifact metadata for a signed upload URL.
    pub async fn upload_url(&self, request: &UploadRequest) -> Result<UploadTicket, LeaseError> {
        let url = self.url("/api/internal/geo-jobs/upload-url");
        let response = self
            .http
            .post(&url)
            .timeout(self.api_timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| transport(&url, e))?;

        let envelope: Envelope<UploadTicket> = read_json(&url, response).await?;
        match (envelope.success, envelope.data) {
            (Some(false), _) | (_, None) => Err(LeaseError::Protocol {
                url,
                reason: format!("no upload URL issued for {}", request.file_key),
            }),
            (_, Some(ticket)) => Ok(ticket),
        }
    }

    /// Stream `url` into `dest`, aborting once more than `max_bytes` arrive.
    ///
    /// On any failure the partially written file is removed before returning.
    pub async fn download(&self, url: &str, dest: &Path, max_bytes: u64) -> Result<u64, LeaseError> {
        let result = self.download_inner(url, dest, max_bytes).await;
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(dest).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %dest.display(), error = %e, "Failed to remove partial download");
                }
            }
        }
        result
    }

    async fn download_inner(
        &self,
        url: &str,
        dest: &Path,
        max_bytes: u64,
    ) -> Result<u64, LeaseError> {
        let response = self
            .http
            .get(url)
            .timeout(self.transfer_timeout)
            .send()
            .await
            .map_err(|e| transport(url, e))?;
        let response = check_status(url, response).await?;

        if let Some(len) = response.content_length() {
            if len > max_bytes {
                return Err(LeaseError::TooLarge {
                    received: len,
                    limit: max_bytes,
                });
            }
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transport(url, e))?;
            received += chunk.len() as u64;
            if received > max_bytes {
                return Err(LeaseError::TooLarge {
                    received,
                    limit: max_bytes,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        tracing::debug!(url, bytes = received, path = %dest.display(), "Download finished");
        Ok(received)
    }

    /// Stream the file at `path` to a signed upload URL.
    pub async fn upload(&self, url: &str, path: &Path, content_type: &str) -> Result<(), LeaseError> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let response = self
            .http
            .put(url)
            .timeout(self.transfer_timeout)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await
            .map_err(|e| transport(url, e))?;
        check_status(url, response).await?;
        Ok(())
    }

    async fn patch(&self, url: &str, body: serde_json::Value) -> Result<(), LeaseError> {
        let response = self
            .http
            .patch(url)
            .timeout(self.api_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport(url, e))?;
        check_status(url, response).await?;
        Ok(())
    }
}

fn transport(url: &str, source: reqwest::Error) -> LeaseError {
    LeaseError::Transport {
        url: url.to_string(),
        source,
    }
}

async fn check_status(url: &str, response: Response) -> Result<Response, LeaseError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(LeaseError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

async fn read_json<T: DeserializeOwned>(url: &str, response: Response) -> Result<T, LeaseError> {
    let response = check_status(url, response).await?;
    let bytes = response.bytes().await.map_err(|e| transport(url, e))?;
    serde_json::from_slice(&bytes).map_err(|e| LeaseError::Protocol {
        url: url.to_string(),
        reason: e.to_string(),
    })
}
