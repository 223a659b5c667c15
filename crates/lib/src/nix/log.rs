//! Nix `internal-json` log protocol.
//!
//! With `--log-format internal-json`, nix writes one structured record per
//! stderr line, prefixed by `@nix `. Anything else on stderr is free-form
//! output and is ignored by the parser.
//!
//! Records form a tree: activities started with `action: "start"` carry an
//! `id`, and nested activities point back at it through `parent`.

use serde::{Deserialize, Serialize};

use crate::consts::NIX_LOG_PREFIX;

/// Source location attached to errors and traces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
  #[serde(default)]
  pub line: Option<u32>,
  #[serde(default)]
  pub column: Option<u32>,
  #[serde(default)]
  pub file: Option<String>,
}

/// One frame of an evaluation error trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTrace {
  #[serde(flatten)]
  pub position: LogPosition,
  #[serde(default)]
  pub raw_msg: Option<String>,
}

/// `msg` and `raw_msg` are strings in current nix releases, numbers in some older ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogMessage {
  Code(i64),
  Text(String),
}

impl std::fmt::Display for LogMessage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      LogMessage::Code(code) => write!(f, "{}", code),
      LogMessage::Text(text) => f.write_str(text),
    }
  }
}

/// A single structured diagnostic emitted during a build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
  #[serde(flatten)]
  pub position: LogPosition,

  #[serde(default)]
  pub id: u64,
  #[serde(default)]
  pub parent: u64,

  /// `msg`, `start`, `stop` or `result`.
  #[serde(default)]
  pub action: String,
  #[serde(rename = "lvl", default)]
  pub level: u8,
  #[serde(default)]
  pub msg: Option<LogMessage>,
  #[serde(default)]
  pub raw_msg: Option<LogMessage>,
  /// Activity or result type code.
  #[serde(rename = "type", default)]
  pub kind: u32,
  #[serde(default)]
  pub text: String,
  #[serde(default)]
  pub fields: Vec<serde_json::Value>,
  #[serde(default)]
  pub trace: Vec<LogTrace>,
}

impl LogEntry {
  /// Human readable text of the entry, if it has any.
  pub fn message(&self) -> Option<String> {
    if let Some(msg) = &self.msg {
      return Some(msg.to_string());
    }
    if !self.text.is_empty() {
      return Some(self.text.clone());
    }
    None
  }
}

/// Decode one stderr line.
///
/// Returns `None` when the line does not carry the `@nix ` marker, and
/// `Some(Err(_))` when it does but the payload is not a valid record.
pub fn parse_log_line(line: &[u8]) -> Option<Result<LogEntry, serde_json::Error>> {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  let payload = line.strip_prefix(NIX_LOG_PREFIX)?;
  Some(serde_json::from_slice(payload))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_message_entry() {
    let entry = parse_log_line(br#"@nix {"action":"msg","level":3,"lvl":3,"msg":"hello"}"#)
      .unwrap()
      .unwrap();

    assert_eq!(entry.action, "msg");
    assert_eq!(entry.level, 3);
    assert_eq!(entry.msg, Some(LogMessage::Text("hello".to_string())));
    assert_eq!(entry.message().as_deref(), Some("hello"));
  }

  #[test]
  fn parse_activity_start() {
    let line = br#"@nix {"action":"start","id":4217,"level":0,"parent":4200,"text":"building '/nix/store/abc-hello.drv'","type":105,"fields":["/nix/store/abc-hello.drv","",1,1]}"#;
    let entry = parse_log_line(line).unwrap().unwrap();

    assert_eq!(entry.id, 4217);
    assert_eq!(entry.parent, 4200);
    assert_eq!(entry.kind, 105);
    assert_eq!(entry.fields.len(), 4);
    assert_eq!(entry.fields[0], serde_json::json!("/nix/store/abc-hello.drv"));
    assert_eq!(entry.message().as_deref(), Some("building '/nix/store/abc-hello.drv'"));
  }

  #[test]
  fn parse_error_with_trace() {
    let line = br#"@nix {"action":"msg","column":5,"file":"/src/flake.nix","level":0,"line":12,"msg":"error: undefined variable","raw_msg":"undefined variable","trace":[{"column":null,"file":null,"line":null,"raw_msg":"while evaluating"}]}"#;
    let entry = parse_log_line(line).unwrap().unwrap();

    assert_eq!(entry.position.line, Some(12));
    assert_eq!(entry.position.column, Some(5));
    assert_eq!(entry.position.file.as_deref(), Some("/src/flake.nix"));
    assert_eq!(entry.raw_msg, Some(LogMessage::Text("undefined variable".to_string())));
    assert_eq!(entry.trace.len(), 1);
    assert_eq!(entry.trace[0].raw_msg.as_deref(), Some("while evaluating"));
    assert_eq!(entry.trace[0].position, LogPosition::default());
  }

  #[test]
  fn parse_numeric_message() {
    let entry = parse_log_line(br#"@nix {"action":"msg","msg":7}"#).unwrap().unwrap();
    assert_eq!(entry.msg, Some(LogMessage::Code(7)));
  }

  #[test]
  fn unprefixed_line_is_skipped() {
    assert!(parse_log_line(b"warning: Git tree is dirty").is_none());
    assert!(parse_log_line(b"").is_none());
  }

  #[test]
  fn malformed_payload_is_an_error() {
    assert!(parse_log_line(b"@nix {not json").unwrap().is_err());
  }

  #[test]
  fn trailing_newline_is_ignored() {
    let entry = parse_log_line(b"@nix {\"action\":\"stop\",\"id\":1}\r\n").unwrap().unwrap();
    assert_eq!(entry.action, "stop");
    assert_eq!(entry.id, 1);
  }
}
