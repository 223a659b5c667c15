use std::future::Future;
use std::path::{Path, PathBuf};

use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use super::workspace::Workspace;
use super::{PublishOutcome, ReconcileError, Stage, object_key};
use crate::archive::{self, PackError};
use crate::cancel::CancelToken;
use crate::consts::PRIMARY_OUTPUT;
use crate::fetch::ArtifactFetcher;
use crate::nix::{BuildExecutor, BuildResult, LogEntry};
use crate::publish::Publisher;
use crate::source::{Artifact, ObjectRef};

/// Runs fetch, build, package and publish for one artifact at a time.
///
/// The pipeline holds no per-run state, so one instance can serve
/// concurrent runs for different objects.
#[derive(Debug)]
pub struct ReconcilePipeline<F, B, P> {
  fetcher: F,
  builder: B,
  publisher: P,
  bucket: String,
  extra_args: Vec<String>,
  work_root: Option<PathBuf>,
}

impl<F, B, P> ReconcilePipeline<F, B, P>
where
  F: ArtifactFetcher,
  B: BuildExecutor,
  P: Publisher,
{
  pub fn new(fetcher: F, builder: B, publisher: P, bucket: impl Into<String>) -> Self {
    Self {
      fetcher,
      builder,
      publisher,
      bucket: bucket.into(),
      extra_args: Vec::new(),
      work_root: None,
    }
  }

  /// Arguments passed to every build after the fixed nix flags.
  pub fn extra_args(mut self, extra_args: Vec<String>) -> Self {
    self.extra_args = extra_args;
    self
  }

  /// Directory that holds run workspaces. Defaults to the system temp dir.
  pub fn work_root(mut self, root: Option<PathBuf>) -> Self {
    self.work_root = root;
    self
  }

  pub fn fetcher(&self) -> &F {
    &self.fetcher
  }

  pub fn builder(&self) -> &B {
    &self.builder
  }

  pub fn publisher(&self) -> &P {
    &self.publisher
  }

  pub fn bucket(&self) -> &str {
    &self.bucket
  }

  /// Build `artifact` and publish the `out` output of the result.
  ///
  /// Nothing is published unless every earlier stage succeeded, and the
  /// run's workspace is gone by the time this returns.
  pub async fn run(
    &self,
    object: &ObjectRef,
    artifact: &Artifact,
    cancel: &CancelToken,
  ) -> Result<PublishOutcome, ReconcileError> {
    let span = info_span!("reconcile", object = %object, revision = %artifact.revision);

    async {
      info!(stage = %Stage::Idle, "new revision detected");
      match self.run_stages(object, artifact, cancel).await {
        Ok(outcome) => {
          info!(
            stage = %Stage::Done,
            key = %outcome.key,
            version = %outcome.version,
            size = outcome.size,
            "artifact published"
          );
          Ok(outcome)
        }
        Err(e) => {
          warn!(stage = %Stage::Failed, failed_at = %e.stage(), error = %e, "reconcile failed");
          Err(e)
        }
      }
    }
    .instrument(span)
    .await
  }

  async fn run_stages(
    &self,
    object: &ObjectRef,
    artifact: &Artifact,
    cancel: &CancelToken,
  ) -> Result<PublishOutcome, ReconcileError> {
    let workspace = Workspace::create(&object.name, self.work_root.as_deref()).map_err(ReconcileError::Workspace)?;

    debug!(stage = %Stage::Fetching, url = %artifact.url, "stage started");
    until_cancelled(
      cancel,
      Stage::Fetching,
      self.fetcher.fetch(&artifact.url, &artifact.digest, workspace.path()),
    )
    .await?;

    // The builder watches the token itself and reaps nix when it fires.
    check_cancelled(cancel, Stage::Building)?;
    debug!(stage = %Stage::Building, "stage started");
    let installables = vec![workspace.path().to_string_lossy().to_string()];
    let mut sink = |entry: LogEntry| forward_log(&entry);
    let results = self
      .builder
      .execute(Some(&mut sink), &self.extra_args, &installables, cancel)
      .await?;
    let output = primary_output(results)?;

    debug!(stage = %Stage::Packaging, output = %output.display(), "stage started");
    let archive = until_cancelled(cancel, Stage::Packaging, package(output)).await?;
    let size = archive.len() as u64;

    debug!(stage = %Stage::Publishing, size, "stage started");
    let key = object_key(object, &artifact.revision);
    let version = until_cancelled(
      cancel,
      Stage::Publishing,
      self.publisher.upload(&self.bucket, &key, archive, size),
    )
    .await?;

    Ok(PublishOutcome {
      bucket: self.bucket.clone(),
      key,
      version,
      size,
    })
  }
}

fn check_cancelled(cancel: &CancelToken, stage: Stage) -> Result<(), ReconcileError> {
  if cancel.is_cancelled() {
    return Err(ReconcileError::Cancelled { stage });
  }
  Ok(())
}

/// Drive `work` unless `cancel` fires first, in which case `work` is dropped.
async fn until_cancelled<T, E>(
  cancel: &CancelToken,
  stage: Stage,
  work: impl Future<Output = Result<T, E>>,
) -> Result<T, ReconcileError>
where
  ReconcileError: From<E>,
{
  check_cancelled(cancel, stage)?;
  tokio::select! {
    biased;
    _ = cancel.cancelled() => Err(ReconcileError::Cancelled { stage }),
    result = work => Ok(result?),
  }
}

/// The `out` path of the only build result.
fn primary_output(results: Vec<BuildResult>) -> Result<PathBuf, ReconcileError> {
  let [result]: [BuildResult; 1] = results
    .try_into()
    .map_err(|results: Vec<BuildResult>| ReconcileError::UnexpectedResultCount(results.len()))?;

  let BuildResult {
    derivation_path,
    mut outputs,
  } = result;
  outputs.remove(PRIMARY_OUTPUT).ok_or(ReconcileError::MissingOutput {
    derivation: derivation_path,
  })
}

/// Compress `dir` into memory on the blocking pool.
async fn package(dir: PathBuf) -> Result<Vec<u8>, PackError> {
  tokio::task::spawn_blocking(move || archive::compress(Path::new(&dir), Vec::new()))
    .await
    .map_err(|e| PackError::Task(e.to_string()))?
}

/// Re-emit a nix log message through tracing.
///
/// Nix verbosity runs from 0 (error) to 7 (vomit).
fn forward_log(entry: &LogEntry) {
  if entry.action != "msg" {
    trace!(action = %entry.action, id = entry.id, text = %entry.text, "nix activity");
    return;
  }
  let Some(message) = entry.message() else {
    return;
  };

  match entry.level {
    0 => error!(target: "nix", "{}", message),
    1 => warn!(target: "nix", "{}", message),
    2 | 3 => info!(target: "nix", "{}", message),
    4 | 5 => debug!(target: "nix", "{}", message),
    _ => trace!(target: "nix", "{}", message),
  }
}
