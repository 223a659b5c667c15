//! Source artifact fetching.
//!
//! This module handles downloading artifact tarballs, verifying their content
//! digest, and unpacking them into a build workspace. The digest is checked
//! before anything is written, so a mismatch never reaches the build.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::archive::{self, PackError};
use crate::consts::DEFAULT_FETCH_RETRIES;

/// Errors that can occur while fetching an artifact.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("invalid artifact url {url}: {message}")]
  InvalidUrl { url: String, message: String },

  /// The HTTP request failed before a response was received.
  #[error("fetch failed for {url}: {source}")]
  Request {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("fetch failed for {url}: HTTP {status}")]
  Status { url: String, status: u16 },

  #[error("unsupported digest {0:?}, expected sha256:<hex> or sha512:<hex>")]
  UnsupportedDigest(String),

  #[error("digest mismatch for {url}: expected {expected}, got {actual}")]
  DigestMismatch {
    url: String,
    expected: String,
    actual: String,
  },

  #[error("failed to unpack artifact: {0}")]
  Unpack(#[from] PackError),
}

impl FetchError {
  /// Transport failures and server-side errors are worth another attempt.
  fn is_retryable(&self) -> bool {
    match self {
      FetchError::Request { .. } => true,
      FetchError::Status { status, .. } => *status >= 500 || *status == 429,
      _ => false,
    }
  }
}

/// Produces a populated local directory from an artifact URL and digest.
pub trait ArtifactFetcher: Send + Sync {
  fn fetch(&self, url: &str, digest: &str, dest: &Path) -> impl Future<Output = Result<(), FetchError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DigestAlgorithm {
  Sha256,
  Sha512,
}

impl DigestAlgorithm {
  fn hash(self, data: &[u8]) -> String {
    match self {
      DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
      DigestAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
    }
  }
}

/// Split `<algorithm>:<hex>` into its parts.
fn parse_digest(digest: &str) -> Result<(DigestAlgorithm, String), FetchError> {
  let unsupported = || FetchError::UnsupportedDigest(digest.to_string());

  let (algorithm, hex) = digest.split_once(':').ok_or_else(unsupported)?;
  let algorithm = match algorithm {
    "sha256" => DigestAlgorithm::Sha256,
    "sha512" => DigestAlgorithm::Sha512,
    _ => return Err(unsupported()),
  };

  if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
    return Err(unsupported());
  }

  Ok((algorithm, hex.to_ascii_lowercase()))
}

/// Replace the host (and optionally the port) of `url`.
///
/// Used when the source server advertises a cluster-internal hostname that
/// is not reachable from where the fetch runs.
pub fn override_host(url: &str, host: &str) -> Result<String, FetchError> {
  let invalid = |message: String| FetchError::InvalidUrl {
    url: url.to_string(),
    message,
  };

  let mut parsed = reqwest::Url::parse(url).map_err(|e| invalid(e.to_string()))?;

  let (name, port) = match host.rsplit_once(':') {
    Some((name, port)) => match port.parse::<u16>() {
      Ok(port) => (name, Some(port)),
      Err(_) => (host, None),
    },
    None => (host, None),
  };

  parsed.set_host(Some(name)).map_err(|e| invalid(e.to_string()))?;
  if port.is_some() {
    parsed
      .set_port(port)
      .map_err(|()| invalid(format!("cannot set port on {}", url)))?;
  }

  Ok(parsed.to_string())
}

/// Fetches `.tar.gz` artifacts over HTTP.
#[derive(Debug, Clone)]
pub struct HttpArtifactFetcher {
  client: reqwest::Client,
  retries: u32,
  retry_delay: Duration,
  host_override: Option<String>,
}

impl HttpArtifactFetcher {
  pub fn new() -> Self {
    Self {
      client: reqwest::Client::new(),
      retries: DEFAULT_FETCH_RETRIES,
      retry_delay: Duration::from_secs(1),
      host_override: None,
    }
  }

  /// Number of additional attempts after a retryable failure.
  pub fn retries(mut self, retries: u32) -> Self {
    self.retries = retries;
    self
  }

  /// Base delay between attempts; attempt `n` waits `n * delay`.
  pub fn retry_delay(mut self, delay: Duration) -> Self {
    self.retry_delay = delay;
    self
  }

  pub fn host_override(mut self, host: Option<String>) -> Self {
    self.host_override = host;
    self
  }

  async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
    let mut attempt = 0u32;
    loop {
      match self.download_once(url).await {
        Ok(bytes) => return Ok(bytes),
        Err(e) if attempt < self.retries && e.is_retryable() => {
          attempt += 1;
          warn!(url = %url, attempt, error = %e, "artifact download failed, retrying");
          tokio::time::sleep(self.retry_delay * attempt).await;
        }
        Err(e) => return Err(e),
      }
    }
  }

  async fn download_once(&self, url: &str) -> Result<Vec<u8>, FetchError> {
    let request_error = |source| FetchError::Request {
      url: url.to_string(),
      source,
    };

    let response = self.client.get(url).send().await.map_err(request_error)?;

    if !response.status().is_success() {
      return Err(FetchError::Status {
        url: url.to_string(),
        status: response.status().as_u16(),
      });
    }

    let bytes = response.bytes().await.map_err(request_error)?;
    Ok(bytes.to_vec())
  }
}

impl Default for HttpArtifactFetcher {
  fn default() -> Self {
    Self::new()
  }
}

impl ArtifactFetcher for HttpArtifactFetcher {
  async fn fetch(&self, url: &str, digest: &str, dest: &Path) -> Result<(), FetchError> {
    let (algorithm, expected) = parse_digest(digest)?;

    let url = match &self.host_override {
      Some(host) => override_host(url, host)?,
      None => url.to_string(),
    };

    info!(url = %url, "fetching artifact");
    let bytes = self.download(&url).await?;

    let actual = algorithm.hash(&bytes);
    if actual != expected {
      return Err(FetchError::DigestMismatch {
        url,
        expected,
        actual,
      });
    }
    debug!(url = %url, size = bytes.len(), "digest verified");

    let dest = dest.to_path_buf();
    let entries = tokio::task::spawn_blocking(move || archive::unpack(bytes.as_slice(), &dest))
      .await
      .map_err(|e| PackError::Task(e.to_string()))??;

    info!(url = %url, entries, "artifact unpacked");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn artifact_tarball() -> Vec<u8> {
    let src = TempDir::new().unwrap();
    std::fs::write(src.path().join("flake.nix"), "{ outputs = _: { }; }").unwrap();
    archive::compress(src.path(), Vec::new()).unwrap()
  }

  fn sha256(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
  }

  fn fetcher(retries: u32) -> HttpArtifactFetcher {
    HttpArtifactFetcher::new().retries(retries).retry_delay(Duration::ZERO)
  }

  #[test]
  fn parse_digest_variants() {
    assert_eq!(
      parse_digest("sha256:ABCdef01").unwrap(),
      (DigestAlgorithm::Sha256, "abcdef01".to_string())
    );
    assert_eq!(parse_digest("sha512:00").unwrap().0, DigestAlgorithm::Sha512);
    assert!(matches!(parse_digest("md5:00"), Err(FetchError::UnsupportedDigest(_))));
    assert!(matches!(parse_digest("abcdef"), Err(FetchError::UnsupportedDigest(_))));
    assert!(matches!(parse_digest("sha256:"), Err(FetchError::UnsupportedDigest(_))));
    assert!(matches!(parse_digest("sha256:xyz"), Err(FetchError::UnsupportedDigest(_))));
  }

  #[test]
  fn override_host_replaces_host_and_port() {
    let url = "http://source-controller.flux-system.svc.cluster.local./gitrepository/default/demo/abc.tar.gz";
    assert_eq!(
      override_host(url, "localhost:8080").unwrap(),
      "http://localhost:8080/gitrepository/default/demo/abc.tar.gz"
    );
    assert_eq!(
      override_host("https://x/a.tgz", "example.com").unwrap(),
      "https://example.com/a.tgz"
    );
  }

  #[test]
  fn override_host_rejects_invalid_url() {
    assert!(matches!(
      override_host("not a url", "localhost"),
      Err(FetchError::InvalidUrl { .. })
    ));
  }

  #[tokio::test]
  async fn fetch_downloads_and_unpacks() {
    let tarball = artifact_tarball();
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("GET", "/a.tgz")
      .with_status(200)
      .with_body(&tarball)
      .expect(1)
      .create_async()
      .await;

    let dest = TempDir::new().unwrap();
    fetcher(0)
      .fetch(&format!("{}/a.tgz", server.url()), &sha256(&tarball), dest.path())
      .await
      .unwrap();

    mock.assert_async().await;
    assert!(dest.path().join("flake.nix").exists());
  }

  #[tokio::test]
  async fn fetch_rejects_digest_mismatch() {
    let tarball = artifact_tarball();
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", "/a.tgz")
      .with_status(200)
      .with_body(&tarball)
      .create_async()
      .await;

    let dest = TempDir::new().unwrap();
    let result = fetcher(0)
      .fetch(&format!("{}/a.tgz", server.url()), &sha256(b"other"), dest.path())
      .await;

    assert!(matches!(result, Err(FetchError::DigestMismatch { .. })));
    assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
  }

  #[tokio::test]
  async fn fetch_retries_server_errors() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("GET", "/a.tgz")
      .with_status(503)
      .expect(3)
      .create_async()
      .await;

    let dest = TempDir::new().unwrap();
    let result = fetcher(2)
      .fetch(&format!("{}/a.tgz", server.url()), "sha256:00", dest.path())
      .await;

    mock.assert_async().await;
    assert!(matches!(result, Err(FetchError::Status { status: 503, .. })));
  }

  #[tokio::test]
  async fn fetch_does_not_retry_client_errors() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("GET", "/a.tgz")
      .with_status(404)
      .expect(1)
      .create_async()
      .await;

    let dest = TempDir::new().unwrap();
    let result = fetcher(3)
      .fetch(&format!("{}/a.tgz", server.url()), "sha256:00", dest.path())
      .await;

    mock.assert_async().await;
    assert!(matches!(result, Err(FetchError::Status { status: 404, .. })));
  }

  #[tokio::test]
  async fn fetch_rejects_unsupported_digest_before_download() {
    let mut server = mockito::Server::new_async().await;
    let mock = server.mock("GET", "/a.tgz").expect(0).create_async().await;

    let dest = TempDir::new().unwrap();
    let result = fetcher(0)
      .fetch(&format!("{}/a.tgz", server.url()), "md5:00", dest.path())
      .await;

    mock.assert_async().await;
    assert!(matches!(result, Err(FetchError::UnsupportedDigest(_))));
  }
}
