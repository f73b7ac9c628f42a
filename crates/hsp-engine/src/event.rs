use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use audit_log::{ProcessContext, ResourceKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("{field} '{path}' must be absolute")]
    NotAbsolute { field: &'static str, path: String },

    #[error("{field} '{path}' must not contain '.' or '..' components")]
    RelativeComponent { field: &'static str, path: String },
}

/// Collapse repeated and trailing separators. Relative paths and `.`/`..`
/// components are rejected rather than resolved.
fn canonical_path(field: &'static str, path: &str) -> Result<String, EventError> {
    if !path.starts_with('/') {
        return Err(EventError::NotAbsolute {
            field,
            path: path.to_string(),
        });
    }
    let mut out = String::with_capacity(path.len());
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if component == "." || component == ".." {
            return Err(EventError::RelativeComponent {
                field,
                path: path.to_string(),
            });
        }
        out.push('/');
        out.push_str(component);
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// One intercepted operation, delivered by the event source and consumed by
/// a single decision.
///
/// The payload is a tagged variant, so an event's kind and payload shape can
/// never disagree. On the wire the tag and body appear as `resourceKind` and
/// `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessEvent {
    #[serde(flatten)]
    pub payload: AccessPayload,
    #[serde(default)]
    pub process: ProcessIdentity,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl AccessEvent {
    pub fn new(payload: AccessPayload, process: ProcessIdentity) -> Self {
        Self {
            payload,
            process,
            timestamp: Utc::now(),
        }
    }

    /// A file access by an unidentified process.
    pub fn file(path: impl Into<String>, operation: FileOp) -> Self {
        Self::new(
            AccessPayload::File(FileAccess {
                path: path.into(),
                operation,
            }),
            ProcessIdentity::default(),
        )
    }

    /// An outbound connection attempt by an unidentified process.
    pub fn network(protocol: Protocol, destination: impl Into<String>, port: Option<u16>) -> Self {
        Self::new(
            AccessPayload::Network(NetworkAccess {
                protocol,
                destination: destination.into(),
                port,
            }),
            ProcessIdentity::default(),
        )
    }

    /// A program execution by an unidentified parent.
    pub fn exec<I, S>(executable: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            AccessPayload::Process(ProcessExec {
                executable: executable.into(),
                args: args.into_iter().map(Into::into).collect(),
            }),
            ProcessIdentity::default(),
        )
    }

    /// Attribute the event to a process.
    pub fn with_process(mut self, pid: u32, executable: impl Into<String>) -> Self {
        self.process = ProcessIdentity {
            pid,
            executable: executable.into(),
            container_id: None,
        };
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.payload.kind()
    }

    /// Bring every path a matcher compares into canonical form.
    ///
    /// Matchers compare paths as strings, so `/etc//shadow` and
    /// `/etc/shadow` must not reach them as different values. An event
    /// whose file path or executable cannot be canonicalized without
    /// resolving it against the filesystem is malformed.
    pub fn canonicalize(mut self) -> Result<Self, EventError> {
        match &mut self.payload {
            AccessPayload::File(f) => f.path = canonical_path("path", &f.path)?,
            AccessPayload::Process(p) => {
                p.executable = canonical_path("executable", &p.executable)?
            }
            AccessPayload::Network(_) => {}
        }
        // An unattributed event carries no executable.
        if !self.process.executable.is_empty() {
            self.process.executable =
                canonical_path("process executable", &self.process.executable)?;
        }
        Ok(self)
    }

    /// JSON snapshot of the payload body, as embedded in alerts.
    pub fn payload_snapshot(&self) -> serde_json::Value {
        let body = match &self.payload {
            AccessPayload::File(f) => serde_json::to_value(f),
            AccessPayload::Network(n) => serde_json::to_value(n),
            AccessPayload::Process(p) => serde_json::to_value(p),
        };
        body.unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resourceKind", content = "payload")]
pub enum AccessPayload {
    File(FileAccess),
    Network(NetworkAccess),
    Process(ProcessExec),
}

impl AccessPayload {
    pub fn kind(&self) -> ResourceKind {
        match self {
            AccessPayload::File(_) => ResourceKind::File,
            AccessPayload::Network(_) => ResourceKind::Network,
            AccessPayload::Process(_) => ResourceKind::Process,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAccess {
    pub path: String,
    #[serde(default)]
    pub operation: FileOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAccess {
    pub protocol: Protocol,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExec {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Identity of the process that attempted the operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessIdentity {
    pub pid: u32,
    #[serde(default)]
    pub executable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

impl From<&ProcessIdentity> for ProcessContext {
    fn from(p: &ProcessIdentity) -> Self {
        ProcessContext {
            pid: p.pid,
            executable: p.executable.clone(),
            container_id: p.container_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FileOp {
    #[default]
    Read,
    Write,
    Delete,
}

impl FromStr for FileOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(FileOp::Read),
            "write" => Ok(FileOp::Write),
            "delete" => Ok(FileOp::Delete),
            _ => Err(s.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Raw,
    Http,
    Https,
}

impl Protocol {
    /// Whether a rule written for `self` applies to traffic of `other`.
    /// Application protocols ride on TCP, so a TCP rule covers them.
    pub fn covers(self, other: Protocol) -> bool {
        self == other || (self == Protocol::Tcp && other.is_application())
    }

    pub fn is_application(self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }

    pub fn carries_ports(self) -> bool {
        !matches!(self, Protocol::Icmp | Protocol::Raw)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Raw => "raw",
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            "raw" => Ok(Protocol::Raw),
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            _ => Err(s.to_string()),
        }
    }
}
