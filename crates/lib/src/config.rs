//! Configuration for fluxnix.
//!
//! Configuration is read from a TOML file (by default
//! `$XDG_CONFIG_HOME/fluxnix/config.toml`). Every field has a default, and a
//! few deployment-specific values can be overridden from the environment:
//!
//! | Variable                      | Field               |
//! |-------------------------------|---------------------|
//! | `FLUXNIX_PUBLISH_ENDPOINT`    | `publish.endpoint`  |
//! | `FLUXNIX_PUBLISH_BUCKET`      | `publish.bucket`    |
//! | `FLUXNIX_BUILD_TIMEOUT`       | `build.timeout`     |
//! | `SOURCE_CONTROLLER_LOCALHOST` | `fetch.host_override` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{APP_NAME, DEFAULT_BUILD_COMMAND, DEFAULT_FETCH_RETRIES};

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config {}: {source}", path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config {}: {source}", path.display())]
  Parse {
    path: PathBuf,
    #[source]
    source: Box<toml::de::Error>,
  },

  #[error("invalid duration {value:?}: {source}")]
  InvalidDuration {
    value: String,
    #[source]
    source: humantime::DurationError,
  },

  #[error("no publish endpoint configured (set publish.endpoint or FLUXNIX_PUBLISH_ENDPOINT)")]
  MissingEndpoint,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
  pub build: BuildConfig,
  pub fetch: FetchConfig,
  pub publish: PublishConfig,
  pub workspace: WorkspaceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
  /// Build program followed by leading arguments.
  pub command: Vec<String>,
  /// Passed to every build after the fixed flags.
  pub extra_args: Vec<String>,
  /// Human readable duration, e.g. `"30m"`.
  pub timeout: Option<String>,
}

impl Default for BuildConfig {
  fn default() -> Self {
    Self {
      command: vec![DEFAULT_BUILD_COMMAND.to_string()],
      extra_args: Vec::new(),
      timeout: None,
    }
  }
}

impl BuildConfig {
  pub fn timeout(&self) -> Result<Option<Duration>, ConfigError> {
    self
      .timeout
      .as_deref()
      .map(|value| {
        humantime::parse_duration(value).map_err(|source| ConfigError::InvalidDuration {
          value: value.to_string(),
          source,
        })
      })
      .transpose()
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
  pub retries: u32,
  /// Replaces the host of artifact URLs.
  pub host_override: Option<String>,
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self {
      retries: DEFAULT_FETCH_RETRIES,
      host_override: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublishConfig {
  pub endpoint: Option<String>,
  pub bucket: String,
}

impl Default for PublishConfig {
  fn default() -> Self {
    Self {
      endpoint: None,
      bucket: APP_NAME.to_string(),
    }
  }
}

impl PublishConfig {
  pub fn endpoint(&self) -> Result<&str, ConfigError> {
    self.endpoint.as_deref().ok_or(ConfigError::MissingEndpoint)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceConfig {
  /// Parent directory for build workspaces. Defaults to the system temp dir.
  pub root: Option<PathBuf>,
}

impl Config {
  /// Parse a config file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source: Box::new(source),
    })
  }

  /// Load the config the way the CLI does.
  ///
  /// An explicit `path` must exist. Without one, the default location is
  /// used if present, otherwise defaults apply. Environment overrides are
  /// applied last.
  pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
    let mut config = match path {
      Some(path) => Self::load(path)?,
      None => {
        let default = default_path();
        if default.exists() {
          Self::load(&default)?
        } else {
          Self::default()
        }
      }
    };
    config.apply_env();
    config.build.timeout()?;
    Ok(config)
  }

  fn apply_env(&mut self) {
    if let Some(endpoint) = env_var("FLUXNIX_PUBLISH_ENDPOINT") {
      self.publish.endpoint = Some(endpoint);
    }
    if let Some(bucket) = env_var("FLUXNIX_PUBLISH_BUCKET") {
      self.publish.bucket = bucket;
    }
    if let Some(timeout) = env_var("FLUXNIX_BUILD_TIMEOUT") {
      self.build.timeout = Some(timeout);
    }
    if let Some(host) = env_var("SOURCE_CONTROLLER_LOCALHOST") {
      self.fetch.host_override = Some(host);
    }
  }
}

/// Non-empty value of an environment variable.
fn env_var(name: &str) -> Option<String> {
  std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Returns the default config file location.
pub fn default_path() -> PathBuf {
  let config_home = std::env::var("XDG_CONFIG_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| {
      std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".config")
    });
  config_home.join(APP_NAME).join("config.toml")
}
