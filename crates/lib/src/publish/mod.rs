//! Object-store publishing.
//!
//! A publisher uploads one byte buffer to `bucket/key` and returns the
//! identifier the store assigned to the new object version. An upload only
//! counts as successful once that identifier is known.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Mutex;

use reqwest::header::{CONTENT_TYPE, ETAG};
use thiserror::Error;
use tracing::{debug, info};

const VERSION_ID_HEADER: &str = "x-amz-version-id";

/// Errors that can occur while publishing an object.
#[derive(Debug, Error)]
pub enum PublishError {
  #[error("declared length {declared} does not match payload length {actual}")]
  LengthMismatch { declared: u64, actual: u64 },

  #[error("upload to {url} failed: {source}")]
  Request {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("upload to {url} failed: HTTP {status}: {body}")]
  Status { url: String, status: u16, body: String },

  /// The store accepted the upload but did not identify the stored version.
  #[error("store returned no version identifier for {bucket}/{key}")]
  MissingVersion { bucket: String, key: String },
}

/// Uploads build archives to an object store.
pub trait Publisher: Send + Sync {
  /// Create or overwrite `bucket/key` and return the stored version identifier.
  fn upload(
    &self,
    bucket: &str,
    key: &str,
    data: Vec<u8>,
    length: u64,
  ) -> impl Future<Output = Result<String, PublishError>> + Send;
}

fn check_length(data: &[u8], declared: u64) -> Result<(), PublishError> {
  let actual = data.len() as u64;
  if actual != declared {
    return Err(PublishError::LengthMismatch { declared, actual });
  }
  Ok(())
}

/// Publishes with plain HTTP `PUT {endpoint}/{bucket}/{key}` requests, as
/// understood by S3-compatible stores.
#[derive(Debug, Clone)]
pub struct HttpPublisher {
  client: reqwest::Client,
  endpoint: String,
}

impl HttpPublisher {
  pub fn new(endpoint: impl Into<String>) -> Self {
    Self {
      client: reqwest::Client::new(),
      endpoint: endpoint.into(),
    }
  }

  fn object_url(&self, bucket: &str, key: &str) -> String {
    format!("{}/{}/{}", self.endpoint.trim_end_matches('/'), bucket, key)
  }
}

impl Publisher for HttpPublisher {
  async fn upload(&self, bucket: &str, key: &str, data: Vec<u8>, length: u64) -> Result<String, PublishError> {
    check_length(&data, length)?;

    let url = self.object_url(bucket, key);
    info!(url = %url, size = length, "uploading archive");

    let response = self
      .client
      .put(&url)
      .header(CONTENT_TYPE, "application/gzip")
      .body(data)
      .send()
      .await
      .map_err(|source| PublishError::Request {
        url: url.clone(),
        source,
      })?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(PublishError::Status {
        url,
        status: status.as_u16(),
        body,
      });
    }

    let headers = response.headers();
    let version = [VERSION_ID_HEADER, ETAG.as_str()]
      .iter()
      .filter_map(|name| headers.get(*name))
      .filter_map(|value| value.to_str().ok())
      .map(|value| value.trim().trim_matches('"').to_string())
      .find(|value| !value.is_empty())
      .ok_or_else(|| PublishError::MissingVersion {
        bucket: bucket.to_string(),
        key: key.to_string(),
      })?;

    debug!(url = %url, version = %version, "upload confirmed");
    Ok(version)
  }
}

/// An in-process object store.
///
/// Every upload gets a fresh version identifier (`v1`, `v2`, ...).
#[derive(Debug, Default)]
pub struct MemoryPublisher {
  objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
  uploads: Mutex<u64>,
}

impl MemoryPublisher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
    let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
    objects.get(&(bucket.to_string(), key.to_string())).cloned()
  }

  /// All stored `(bucket, key)` pairs in sorted order.
  pub fn keys(&self) -> Vec<(String, String)> {
    let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
    objects.keys().cloned().collect()
  }
}

impl Publisher for MemoryPublisher {
  async fn upload(&self, bucket: &str, key: &str, data: Vec<u8>, length: u64) -> Result<String, PublishError> {
    check_length(&data, length)?;

    let version = {
      let mut uploads = self.uploads.lock().unwrap_or_else(|e| e.into_inner());
      *uploads += 1;
      format!("v{}", *uploads)
    };

    let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
    objects.insert((bucket.to_string(), key.to_string()), data);

    debug!(bucket, key, version = %version, "stored object in memory");
    Ok(version)
  }
}
