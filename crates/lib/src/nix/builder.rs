//! `nix build` orchestration.
//!
//! The builder runs nix as a child process, captures the JSON result from
//! stdout and, when a log sink is supplied, decodes the structured log stream
//! from stderr while the build is running. Both pipes are drained
//! concurrently with the process wait so a chatty build can never block on a
//! full pipe buffer.

use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::consts::DEFAULT_BUILD_COMMAND;
use crate::nix::log::{LogEntry, parse_log_line};
use crate::nix::types::{BuildError, BuildResult};

/// Receives decoded log entries in stream order.
pub type LogSink<'a> = dyn FnMut(LogEntry) + Send + 'a;

/// Flags that precede every build. `build` must come after the global
/// `--experimental-features` flag and before the build-specific ones.
const BUILD_PREAMBLE: &[&str] = &[
  "--experimental-features",
  "nix-command flakes",
  "build",
  "--log-format",
  "internal-json",
  "--no-link",
  "--json",
];

/// Assemble the full argument vector for a build.
///
/// Order is `prefix`, the fixed preamble, `extra_args`, then `installables`.
pub fn build_args(prefix: &[String], extra_args: &[String], installables: &[String]) -> Vec<String> {
  let mut args = Vec::with_capacity(prefix.len() + BUILD_PREAMBLE.len() + extra_args.len() + installables.len());
  args.extend(prefix.iter().cloned());
  args.extend(BUILD_PREAMBLE.iter().map(|s| s.to_string()));
  args.extend(extra_args.iter().cloned());
  args.extend(installables.iter().cloned());
  args
}

/// Something that can build installables into store paths.
pub trait BuildExecutor: Send + Sync {
  /// Build `installables` and return one result per built derivation.
  ///
  /// Cardinality is not checked here; callers validate what they asked for.
  fn execute(
    &self,
    sink: Option<&mut LogSink<'_>>,
    extra_args: &[String],
    installables: &[String],
    cancel: &CancelToken,
  ) -> impl Future<Output = Result<Vec<BuildResult>, BuildError>> + Send;
}

/// Runs builds with the nix command line.
#[derive(Debug, Clone)]
pub struct NixBuilder {
  /// Program followed by any leading arguments, e.g. `["nix"]`.
  command: Vec<String>,
  timeout: Option<Duration>,
}

impl NixBuilder {
  pub fn new() -> Self {
    Self::with_command(vec![DEFAULT_BUILD_COMMAND.to_string()])
  }

  pub fn with_command(command: Vec<String>) -> Self {
    Self { command, timeout: None }
  }

  /// Kill the build if it runs longer than `timeout`.
  pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn command(&self) -> &[String] {
    &self.command
  }
}

impl Default for NixBuilder {
  fn default() -> Self {
    Self::new()
  }
}

impl BuildExecutor for NixBuilder {
  async fn execute(
    &self,
    sink: Option<&mut LogSink<'_>>,
    extra_args: &[String],
    installables: &[String],
    cancel: &CancelToken,
  ) -> Result<Vec<BuildResult>, BuildError> {
    let (program, prefix) = self.command.split_first().ok_or(BuildError::EmptyCommand)?;
    let args = build_args(prefix, extra_args, installables);

    info!(program = %program, installables = ?installables, "starting build");
    debug!(args = ?args, "build arguments");

    let stderr_mode = if sink.is_some() { Stdio::piped() } else { Stdio::null() };

    let mut command = Command::new(program);
    command
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(stderr_mode)
      .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| BuildError::Spawn {
      program: program.clone(),
      source,
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let finished = tokio::select! {
      done = run_to_completion(&mut child, stdout, stderr, sink) => Ok(done),
      _ = cancel.cancelled() => Err(BuildError::Cancelled),
      _ = deadline(self.timeout) => Err(BuildError::TimedOut(self.timeout.unwrap_or_default())),
    };

    let (status, output) = match finished {
      Ok(done) => done,
      Err(err) => {
        warn!(program = %program, reason = %err, "killing build process");
        if let Err(e) = child.kill().await {
          warn!(program = %program, error = %e, "failed to kill build process");
        }
        return Err(err);
      }
    };

    let status = status.map_err(|source| BuildError::Wait {
      program: program.clone(),
      source,
    })?;

    if !status.success() {
      return Err(BuildError::ExitStatus {
        program: program.clone(),
        code: status.code(),
      });
    }

    let output = output?;
    let results: Vec<BuildResult> = serde_json::from_slice(&output).map_err(BuildError::Decode)?;

    info!(results = results.len(), "build finished");
    Ok(results)
  }
}

/// Wait for the process while draining both of its pipes.
///
/// Returns only after the process exited and both streams hit EOF.
async fn run_to_completion(
  child: &mut Child,
  stdout: Option<ChildStdout>,
  stderr: Option<ChildStderr>,
  sink: Option<&mut LogSink<'_>>,
) -> (std::io::Result<ExitStatus>, std::io::Result<Vec<u8>>) {
  let (status, output, ()) = tokio::join!(child.wait(), read_output(stdout), drain_logs(stderr, sink));
  (status, output)
}

async fn read_output(stdout: Option<ChildStdout>) -> std::io::Result<Vec<u8>> {
  let mut buf = Vec::new();
  if let Some(mut stdout) = stdout {
    stdout.read_to_end(&mut buf).await?;
  }
  Ok(buf)
}

/// Decode `@nix` lines from stderr and hand them to `sink`.
///
/// Undecodable lines are logged and skipped; they never end the stream.
async fn drain_logs(stderr: Option<ChildStderr>, sink: Option<&mut LogSink<'_>>) {
  let (Some(stderr), Some(sink)) = (stderr, sink) else {
    return;
  };

  let mut reader = BufReader::new(stderr);
  let mut line = Vec::new();
  let mut delivered = 0usize;

  loop {
    line.clear();
    match reader.read_until(b'\n', &mut line).await {
      Ok(0) => break,
      Ok(_) => {}
      Err(e) => {
        warn!(error = %e, "failed to read build log stream");
        break;
      }
    }

    match parse_log_line(&line) {
      None => {}
      Some(Ok(entry)) => {
        sink(entry);
        delivered += 1;
      }
      Some(Err(e)) => {
        let text = String::from_utf8_lossy(&line);
        warn!(error = %e, line = %text.trim_end(), "failed to parse log line");
      }
    }
  }

  debug!(entries = delivered, "build log stream drained");
}

async fn deadline(timeout: Option<Duration>) {
  match timeout {
    Some(timeout) => tokio::time::sleep(timeout).await,
    None => std::future::pending().await,
  }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
  use std::time::Instant;

  use tracing_test::traced_test;

  use super::*;
  use crate::testutil::fake_nix;

  fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn build_args_order() {
    let args = build_args(
      &strings(&["--offline"]),
      &strings(&["--no-use-registries"]),
      &strings(&["/tmp/src", "/tmp/src"]),
    );

    assert_eq!(
      args,
      strings(&[
        "--offline",
        "--experimental-features",
        "nix-command flakes",
        "build",
        "--log-format",
        "internal-json",
        "--no-link",
        "--json",
        "--no-use-registries",
        "/tmp/src",
        "/tmp/src",
      ])
    );
  }

  #[tokio::test]
  async fn execute_returns_all_results() {
    let nix = fake_nix(
      r#"echo '[{"drvPath":"/nix/store/a-hello.drv","outputs":{"out":"/nix/store/a-hello"}},{"drvPath":"/nix/store/b-cowsay.drv","outputs":{"out":"/nix/store/b-cowsay","man":"/nix/store/b-cowsay-man"}}]'"#,
    );

    let results = nix
      .builder
      .execute(None, &[], &strings(&["#hello", "#cowsay"]), &CancelToken::new())
      .await
      .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].derivation_path, "/nix/store/a-hello.drv");
    assert_eq!(results[1].outputs["man"], std::path::PathBuf::from("/nix/store/b-cowsay-man"));
  }

  #[tokio::test]
  async fn execute_fails_on_nonzero_exit() {
    let nix = fake_nix("echo '[]'; exit 1");

    let result = nix.builder.execute(None, &[], &strings(&["#hello"]), &CancelToken::new()).await;

    assert!(matches!(result, Err(BuildError::ExitStatus { code: Some(1), .. })));
  }

  #[tokio::test]
  async fn execute_fails_on_nonzero_exit_with_sink() {
    let nix = fake_nix("echo '@nix {\"action\":\"msg\",\"lvl\":0,\"msg\":\"boom\"}' >&2; exit 1");
    let mut entries = Vec::new();
    let mut sink = |entry: LogEntry| entries.push(entry);

    let result = nix
      .builder
      .execute(Some(&mut sink), &[], &strings(&["#hello"]), &CancelToken::new())
      .await;

    assert!(matches!(result, Err(BuildError::ExitStatus { code: Some(1), .. })));
    assert_eq!(entries.len(), 1);
  }

  #[tokio::test]
  #[traced_test]
  async fn execute_skips_malformed_log_lines() {
    let nix = fake_nix(
      r#"
echo 'plain text is ignored' >&2
echo '@nix {"action":"msg",' >&2
echo '@nix {"action":"msg","lvl":3,"msg":"hello"}' >&2
echo '[]'
"#,
    );
    let mut entries = Vec::new();
    let mut sink = |entry: LogEntry| entries.push(entry);

    let results = nix
      .builder
      .execute(Some(&mut sink), &[], &[], &CancelToken::new())
      .await
      .unwrap();

    assert!(results.is_empty());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message().as_deref(), Some("hello"));
    assert!(logs_contain("failed to parse log line"));
  }

  #[tokio::test]
  async fn execute_passes_arguments_in_order() {
    let nix = fake_nix(r#"for arg in "$@"; do echo "$arg"; done > "$(dirname "$0")/args.txt"; echo '[]'"#);

    nix
      .builder
      .execute(
        None,
        &strings(&["--rebuild"]),
        &strings(&["/src", "/src"]),
        &CancelToken::new(),
      )
      .await
      .unwrap();

    let recorded = std::fs::read_to_string(nix.dir.path().join("args.txt")).unwrap();
    let recorded: Vec<&str> = recorded.lines().collect();
    assert_eq!(
      recorded,
      vec![
        "--experimental-features",
        "nix-command flakes",
        "build",
        "--log-format",
        "internal-json",
        "--no-link",
        "--json",
        "--rebuild",
        "/src",
        "/src",
      ]
    );
  }

  #[tokio::test]
  async fn execute_drains_large_log_stream() {
    // Well past the 64 KiB pipe buffer.
    let nix = fake_nix(
      r#"
i=0
while [ $i -lt 3000 ]; do
  echo "@nix {\"action\":\"msg\",\"lvl\":5,\"msg\":\"line $i of a rather long and repetitive build log\"}" >&2
  i=$((i+1))
done
echo '[]'
"#,
    );
    let mut count = 0usize;
    let mut sink = |_entry: LogEntry| count += 1;

    let result = tokio::time::timeout(
      Duration::from_secs(30),
      nix.builder.execute(Some(&mut sink), &[], &[], &CancelToken::new()),
    )
    .await
    .expect("build should not deadlock");

    assert!(result.unwrap().is_empty());
    assert_eq!(count, 3000);
  }

  #[tokio::test]
  async fn execute_rejects_invalid_result() {
    let nix = fake_nix("echo 'not json'");

    let result = nix.builder.execute(None, &[], &[], &CancelToken::new()).await;

    assert!(matches!(result, Err(BuildError::Decode(_))));
  }

  #[tokio::test]
  async fn execute_reports_spawn_failure() {
    let builder = NixBuilder::with_command(strings(&["/nonexistent/bin/nix"]));

    let result = builder.execute(None, &[], &[], &CancelToken::new()).await;

    assert!(matches!(result, Err(BuildError::Spawn { .. })));
  }

  #[tokio::test]
  async fn execute_rejects_empty_command() {
    let builder = NixBuilder::with_command(Vec::new());

    let result = builder.execute(None, &[], &[], &CancelToken::new()).await;

    assert!(matches!(result, Err(BuildError::EmptyCommand)));
  }

  #[tokio::test]
  async fn execute_kills_build_on_cancel() {
    let nix = fake_nix("exec sleep 30");
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      trigger.cancel();
    });

    let started = Instant::now();
    let mut sink = |_entry: LogEntry| {};
    let result = nix.builder.execute(Some(&mut sink), &[], &[], &cancel).await;

    assert!(matches!(result, Err(BuildError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(10));
  }

  #[tokio::test]
  async fn execute_kills_build_on_timeout() {
    let nix = fake_nix("exec sleep 30");
    let builder = nix.builder.clone().timeout(Some(Duration::from_millis(200)));

    let started = Instant::now();
    let result = builder.execute(None, &[], &[], &CancelToken::new()).await;

    assert!(matches!(result, Err(BuildError::TimedOut(_))));
    assert!(started.elapsed() < Duration::from_secs(10));
  }
}
