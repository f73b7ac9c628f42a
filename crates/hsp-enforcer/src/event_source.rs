//! Replay event source.
//!
//! Stands in for the kernel interception hook: reads one JSON-encoded
//! [`AccessEvent`] per line from a file or stdin. Paths are canonicalized
//! before the event is handed on. Blank lines are skipped. Malformed lines
//! and events with non-canonical paths are logged and skipped, so one bad
//! record does not stop the replay.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::warn;

use hsp_engine::{AccessEvent, ResolvedAction, ResourceKind, Verdict};

pub type BoxedReader = Box<dyn AsyncBufRead + Unpin + Send>;

pub struct EventSource<R> {
    lines: Lines<R>,
    line_no: usize,
    skipped: usize,
}

impl EventSource<BoxedReader> {
    /// Read from `path`, or from stdin when `path` is `None` or `-`.
    pub async fn open(path: Option<&Path>) -> Result<Self> {
        let reader: BoxedReader = match path {
            Some(p) if p != Path::new("-") => {
                let file = tokio::fs::File::open(p)
                    .await
                    .with_context(|| format!("failed to open event file {}", p.display()))?;
                Box::new(BufReader::new(file))
            }
            _ => Box::new(BufReader::new(tokio::io::stdin())),
        };
        Ok(Self::new(reader))
    }
}

impl<R: AsyncBufRead + Unpin> EventSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
            skipped: 0,
        }
    }

    /// The next well-formed event with its line number, or `None` at end of
    /// input.
    pub async fn next_event(&mut self) -> Result<Option<(usize, AccessEvent)>> {
        while let Some(line) = self
            .lines
            .next_line()
            .await
            .context("failed to read event stream")?
        {
            self.line_no += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event = match serde_json::from_str::<AccessEvent>(line) {
                Ok(event) => event,
                Err(e) => {
                    self.skipped += 1;
                    warn!(line = self.line_no, error = %e, "skipping malformed access event");
                    continue;
                }
            };
            match event.canonicalize() {
                Ok(event) => return Ok(Some((self.line_no, event))),
                Err(e) => {
                    self.skipped += 1;
                    warn!(line = self.line_no, error = %e, "skipping access event with invalid path");
                }
            }
        }
        Ok(None)
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

/// One verdict as written back to the event consumer.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerdictLine<'a> {
    pub line: usize,
    pub resource_kind: ResourceKind,
    pub action: ResolvedAction,
    pub policy_name: &'a str,
    pub rule_id: Option<u32>,
    pub audited: bool,
}

impl<'a> VerdictLine<'a> {
    pub fn new(line: usize, event: &AccessEvent, verdict: &'a Verdict) -> Self {
        Self {
            line,
            resource_kind: event.kind(),
            action: verdict.action,
            policy_name: verdict.policy_name(),
            rule_id: verdict.rule_id().map(|id| id.index),
            audited: verdict.audited,
        }
    }
}
