//! Durable storage for job outputs.
//!
//! Objects are keyed `{job_id}/{sha256}` so re-uploading the same output
//! for the same job (e.g. after a retried attempt) overwrites rather than
//! duplicates. Download URLs are time-limited.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use conductor_core::clock::{to_chrono, Clock};
use conductor_core::job::ArtifactRef;
use sha2::{Digest, Sha256};

/// Default lifetime of a presigned download URL: 1 hour.
pub const DEFAULT_URL_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Artifact upload failed: {0}")]
    Upload(String),

    #[error("Could not create download URL: {0}")]
    Presign(String),
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store one output of `job_id` and return its reference.
    async fn put(
        &self,
        job_id: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<ArtifactRef, ArtifactError>;
}

/// Object key for an output: stable per (job, content).
pub fn object_key(job_id: &str, bytes: &[u8]) -> String {
    format!("{job_id}/{:x}", Sha256::digest(bytes))
}

// ---------------------------------------------------------------------------
// S3
// ---------------------------------------------------------------------------

/// Artifact store backed by an S3 bucket.
pub struct S3ArtifactStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    url_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl S3ArtifactStore {
    pub fn new(
        client: aws_sdk_s3::Client,
        bucket: impl Into<String>,
        url_ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            url_ttl,
            clock,
        }
    }

    /// Build a client from the ambient AWS configuration (env, profile, IMDS).
    pub async fn from_env(bucket: impl Into<String>, url_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_s3::Client::new(&config), bucket, url_ttl, clock)
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn put(
        &self,
        job_id: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<ArtifactRef, ArtifactError> {
        let key = object_key(job_id, &bytes);
        let size_bytes = bytes.len() as u64;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| ArtifactError::Upload(aws_sdk_s3::error::DisplayErrorContext(e).to_string()))?;

        let presign = PresigningConfig::expires_in(self.url_ttl)
            .map_err(|e| ArtifactError::Presign(e.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .presigned(presign)
            .await
            .map_err(|e| ArtifactError::Presign(aws_sdk_s3::error::DisplayErrorContext(e).to_string()))?;

        tracing::debug!(job_id, key = %key, size_bytes, "Stored artifact in S3");

        Ok(ArtifactRef {
            locator: format!("s3://{}/{}", self.bucket, key),
            download_url: request.uri().to_string(),
            content_type: content_type.to_string(),
            size_bytes,
            expires_at: self.clock.now() + to_chrono(self.url_ttl),
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local artifact store for tests and single-process runs.
#[derive(Debug)]
pub struct MemoryArtifactStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    /// Number of upcoming `put` calls that fail.
    failures: AtomicU32,
    url_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl MemoryArtifactStore {
    pub fn new(url_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            failures: AtomicU32::new(0),
            url_ttl,
            clock,
        }
    }

    /// Make the next `n` uploads fail.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Bytes and content type stored under `locator`.
    pub fn get(&self, locator: &str) -> Option<(Vec<u8>, String)> {
        let key = locator.strip_prefix("mem://")?;
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        job_id: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<ArtifactRef, ArtifactError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ArtifactError::Upload("injected failure".into()));
        }

        let key = object_key(job_id, &bytes);
        let size_bytes = bytes.len() as u64;
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), (bytes, content_type.to_string()));

        Ok(ArtifactRef {
            locator: format!("mem://{key}"),
            download_url: format!("memory://artifacts/{key}"),
            content_type: content_type.to_string(),
            size_bytes,
            expires_at: self.clock.now() + to_chrono(self.url_ttl),
        })
    }
}
