//! Implementation of the `fluxnix reconcile` command.
//!
//! Treats the command line as one update event for a tracked source: the
//! previous revision (if any) is the old state and the given artifact is the
//! new one. The pipeline only runs when the revision actually changed.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use tracing::debug;

use fluxnix_lib::cancel::CancelToken;
use fluxnix_lib::config::Config;
use fluxnix_lib::fetch::HttpArtifactFetcher;
use fluxnix_lib::nix::NixBuilder;
use fluxnix_lib::publish::{HttpPublisher, MemoryPublisher, Publisher};
use fluxnix_lib::reconcile::{PublishOutcome, ReconcileError, ReconcilePipeline, Reconciler};
use fluxnix_lib::source::{Artifact, ObjectRef, TrackedObject, UpdateEvent};

use crate::output::{format_bytes, print_info, print_json, print_stat, print_success};

#[derive(Debug, Args)]
pub struct ReconcileArgs {
  /// Namespace of the tracked source
  #[arg(long, default_value = "default")]
  pub namespace: String,

  /// Name of the tracked source
  #[arg(long)]
  pub name: String,

  /// Artifact download URL
  #[arg(long)]
  pub url: String,

  /// Artifact digest, e.g. sha256:<hex>
  #[arg(long)]
  pub digest: String,

  /// Revision the artifact was produced from
  #[arg(long)]
  pub revision: String,

  /// Revision that was last built, if any
  #[arg(long)]
  pub previous_revision: Option<String>,

  /// Keep the archive in memory instead of uploading it
  #[arg(long)]
  pub dry_run: bool,
}

impl ReconcileArgs {
  fn event(self) -> UpdateEvent<TrackedObject> {
    let object = ObjectRef::new(self.namespace, self.name);
    let current = Artifact {
      url: self.url,
      digest: self.digest,
      revision: self.revision,
    };
    let previous = self.previous_revision.map(|revision| Artifact {
      revision,
      ..current.clone()
    });

    UpdateEvent {
      old: Some(TrackedObject::new(object.clone(), previous)),
      new: Some(TrackedObject::new(object, Some(current))),
    }
  }
}

pub fn cmd_reconcile(config: Option<&Path>, args: ReconcileArgs) -> Result<()> {
  let config = Config::resolve(config).context("Failed to load configuration")?;
  debug!(config = ?config, "configuration loaded");
  let dry_run = args.dry_run;
  let event = args.event();

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let outcome = if dry_run {
    print_info("Dry run: the archive will not be uploaded");
    let reconciler = reconciler(&config, MemoryPublisher::new())?;
    rt.block_on(run(&reconciler, &event))
  } else {
    let endpoint = config.publish.endpoint()?;
    let reconciler = reconciler(&config, HttpPublisher::new(endpoint))?;
    rt.block_on(run(&reconciler, &event))
  };

  let outcome = outcome.map_err(|e| {
    let stage = e.stage();
    anyhow::Error::new(e).context(format!("Reconcile failed during {}", stage))
  })?;

  match outcome {
    None => {
      print_info("Revision unchanged, nothing to build");
      Ok(())
    }
    Some(outcome) => {
      print_success(&format!("Published {}/{}", outcome.bucket, outcome.key));
      print_stat("Version", &outcome.version);
      print_stat("Size", &format_bytes(outcome.size));
      print_json(&outcome)
    }
  }
}

fn reconciler<P: Publisher>(config: &Config, publisher: P) -> Result<Reconciler<HttpArtifactFetcher, NixBuilder, P>> {
  let fetcher = HttpArtifactFetcher::new()
    .retries(config.fetch.retries)
    .host_override(config.fetch.host_override.clone());
  let builder = NixBuilder::with_command(config.build.command.clone()).timeout(config.build.timeout()?);

  let pipeline = ReconcilePipeline::new(fetcher, builder, publisher, config.publish.bucket.clone())
    .extra_args(config.build.extra_args.clone())
    .work_root(config.workspace.root.clone());
  Ok(Reconciler::new(pipeline))
}

async fn run<P: Publisher>(
  reconciler: &Reconciler<HttpArtifactFetcher, NixBuilder, P>,
  event: &UpdateEvent<TrackedObject>,
) -> Result<Option<PublishOutcome>, ReconcileError> {
  let cancel = CancelToken::new();
  super::cancel_on_ctrl_c(&cancel);
  reconciler.on_update(event, &cancel).await
}
