//! Typed, pre-validated matchers for each resource kind.
//!
//! Matchers are only constructed through their validating constructors, so a
//! value of these types is always well-formed for its kind. Each matcher also
//! reports a static [`Specificity`] used to order competing rules.

use std::fmt;
use std::net::IpAddr;

use globset::{GlobBuilder, GlobMatcher};
use regex::Regex;
use thiserror::Error;

use audit_log::ResourceKind;

use crate::event::{AccessPayload, FileAccess, FileOp, NetworkAccess, ProcessExec, Protocol};

/// Characters that start a glob meta-sequence.
const GLOB_META: &[char] = &['*', '?', '[', '{', '\\'];

#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("path '{0}' must be absolute")]
    NotAbsolute(String),

    #[error("path '{0}' must not contain '.' or '..' components")]
    RelativeComponent(String),

    #[error("path '{0}' contains a repeated '/'")]
    RepeatedSeparator(String),

    #[error("invalid glob '{pattern}': {source}")]
    Glob {
        pattern: String,
        source: globset::Error,
    },

    #[error("invalid argument pattern '{pattern}': {source}")]
    ArgsPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("unsupported protocol '{0}'")]
    UnknownProtocol(String),

    #[error("unknown file operation '{0}'")]
    UnknownOperation(String),

    #[error("invalid destination '{0}'")]
    InvalidDestination(String),

    #[error("port 0 is not a valid destination port")]
    ZeroPort,

    #[error("protocol '{0}' does not carry ports")]
    PortlessProtocol(Protocol),
}

/// How narrowly a matcher selects events. Larger is more specific.
///
/// The three components are compared lexicographically; what each one
/// measures depends on the resource kind (see the per-kind `specificity`
/// methods).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specificity {
    primary: u32,
    secondary: u32,
    tertiary: u32,
}

impl Specificity {
    fn new(primary: usize, secondary: usize, tertiary: usize) -> Self {
        Self {
            primary: primary as u32,
            secondary: secondary as u32,
            tertiary: tertiary as u32,
        }
    }
}

/// A compiled matcher tagged with its resource kind.
#[derive(Debug, Clone)]
pub enum Matcher {
    File(FileMatcher),
    Network(NetworkMatcher),
    Process(ProcessMatcher),
}

impl Matcher {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Matcher::File(_) => ResourceKind::File,
            Matcher::Network(_) => ResourceKind::Network,
            Matcher::Process(_) => ResourceKind::Process,
        }
    }

    pub fn specificity(&self) -> Specificity {
        match self {
            Matcher::File(m) => m.specificity(),
            Matcher::Network(m) => m.specificity(),
            Matcher::Process(m) => m.specificity(),
        }
    }

    /// Payloads of a different kind never match.
    pub fn matches(&self, payload: &AccessPayload) -> bool {
        match (self, payload) {
            (Matcher::File(m), AccessPayload::File(f)) => m.matches(f),
            (Matcher::Network(m), AccessPayload::Network(n)) => m.matches(n),
            (Matcher::Process(m), AccessPayload::Process(p)) => m.matches(p),
            _ => false,
        }
    }
}

/// Canonical text form; two matchers with equal text select the same events.
impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::File(m) => fmt::Display::fmt(m, f),
            Matcher::Network(m) => fmt::Display::fmt(m, f),
            Matcher::Process(m) => fmt::Display::fmt(m, f),
        }
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Reject relative paths, `.`/`..` components and repeated separators.
/// Events are canonicalized before matching, so a rule path that is not
/// canonical could never match.
pub fn validate_absolute(path: &str) -> Result<(), MatcherError> {
    if !path.starts_with('/') {
        return Err(MatcherError::NotAbsolute(path.to_string()));
    }
    if path.split('/').any(|c| c == "." || c == "..") {
        return Err(MatcherError::RelativeComponent(path.to_string()));
    }
    if path.contains("//") {
        return Err(MatcherError::RepeatedSeparator(path.to_string()));
    }
    Ok(())
}

/// A directory prefix, normalized to end with `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DirPrefix {
    dir: String,
    recursive: bool,
}

impl DirPrefix {
    fn new(dir: &str, recursive: bool) -> Result<Self, MatcherError> {
        validate_absolute(dir)?;
        let mut dir = dir.to_string();
        if !dir.ends_with('/') {
            dir.push('/');
        }
        Ok(Self { dir, recursive })
    }

    /// Non-recursive directories only cover their direct children.
    fn contains(&self, path: &str) -> bool {
        match path.strip_prefix(self.dir.as_str()) {
            Some(rest) if !rest.is_empty() => self.recursive || !rest.contains('/'),
            _ => false,
        }
    }

    fn rank(&self) -> usize {
        if self.recursive {
            1
        } else {
            2
        }
    }
}

#[derive(Debug, Clone)]
enum PathTarget {
    Exact(String),
    Directory(DirPrefix),
    Pattern {
        source: String,
        glob: GlobMatcher,
        literal_prefix: usize,
    },
}

/// Matches file accesses by path and, optionally, operation.
#[derive(Debug, Clone)]
pub struct FileMatcher {
    target: PathTarget,
    /// Sorted and deduplicated; empty means every operation.
    operations: Vec<FileOp>,
}

impl FileMatcher {
    pub fn exact(path: &str) -> Result<Self, MatcherError> {
        validate_absolute(path)?;
        Ok(Self::with_target(PathTarget::Exact(path.to_string())))
    }

    pub fn directory(dir: &str, recursive: bool) -> Result<Self, MatcherError> {
        Ok(Self::with_target(PathTarget::Directory(DirPrefix::new(
            dir, recursive,
        )?)))
    }

    /// `*` stays within one path segment; `**` crosses segments. A pattern
    /// without any glob syntax is treated as an exact path.
    pub fn pattern(pattern: &str) -> Result<Self, MatcherError> {
        validate_absolute(pattern)?;
        let literal_prefix = pattern.find(GLOB_META).unwrap_or(pattern.len());
        if literal_prefix == pattern.len() {
            return Self::exact(pattern);
        }
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|source| MatcherError::Glob {
                pattern: pattern.to_string(),
                source,
            })?
            .compile_matcher();
        Ok(Self::with_target(PathTarget::Pattern {
            source: pattern.to_string(),
            glob,
            literal_prefix,
        }))
    }

    pub fn with_operations(mut self, mut operations: Vec<FileOp>) -> Self {
        operations.sort();
        operations.dedup();
        self.operations = operations;
        self
    }

    fn with_target(target: PathTarget) -> Self {
        Self {
            target,
            operations: Vec::new(),
        }
    }

    pub fn matches(&self, access: &FileAccess) -> bool {
        if !self.operations.is_empty() && !self.operations.contains(&access.operation) {
            return false;
        }
        let path = access.path.as_str();
        match &self.target {
            PathTarget::Exact(p) => p == path,
            PathTarget::Directory(d) => d.contains(path),
            PathTarget::Pattern {
                source,
                glob,
                literal_prefix,
            } => path.starts_with(&source[..*literal_prefix]) && glob.is_match(path),
        }
    }

    /// Longest literal path prefix first, then exact > directory > glob,
    /// then operation-restricted over unrestricted.
    pub fn specificity(&self) -> Specificity {
        let (literal, form) = match &self.target {
            PathTarget::Exact(p) => (p.len(), 4),
            PathTarget::Directory(d) => (d.dir.len(), d.rank()),
            PathTarget::Pattern { literal_prefix, .. } => (*literal_prefix, 3),
        };
        Specificity::new(literal, form, usize::from(!self.operations.is_empty()))
    }
}

impl fmt::Display for FileMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            PathTarget::Exact(p) => write!(f, "file:path={p}")?,
            PathTarget::Directory(d) => write!(f, "file:dir={} recursive={}", d.dir, d.recursive)?,
            PathTarget::Pattern { source, .. } => write!(f, "file:pattern={source}")?,
        }
        if !self.operations.is_empty() {
            write!(f, " ops={:?}", self.operations)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostMatch {
    /// Lowercased hostname or IP literal.
    Exact(String),
    /// `*.example.com`, stored as `.example.com`; never matches the apex.
    Suffix(String),
}

fn valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

impl HostMatch {
    fn parse(destination: &str) -> Result<Self, MatcherError> {
        let lowered = destination.trim().to_ascii_lowercase();
        if let Some(suffix) = lowered.strip_prefix("*.") {
            if valid_hostname(suffix) {
                return Ok(HostMatch::Suffix(format!(".{suffix}")));
            }
        } else if lowered.parse::<IpAddr>().is_ok() || valid_hostname(&lowered) {
            return Ok(HostMatch::Exact(lowered));
        }
        Err(MatcherError::InvalidDestination(destination.to_string()))
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            HostMatch::Exact(h) => h.eq_ignore_ascii_case(host),
            HostMatch::Suffix(s) => {
                host.len() > s.len()
                    && host.is_char_boundary(host.len() - s.len())
                    && host[host.len() - s.len()..].eq_ignore_ascii_case(s)
            }
        }
    }
}

/// Matches connection attempts by protocol and, optionally, destination and
/// port.
#[derive(Debug, Clone)]
pub struct NetworkMatcher {
    protocol: Protocol,
    destination: Option<HostMatch>,
    port: Option<u16>,
}

impl NetworkMatcher {
    pub fn new(
        protocol: &str,
        destination: Option<&str>,
        port: Option<u16>,
    ) -> Result<Self, MatcherError> {
        let protocol: Protocol = protocol
            .parse()
            .map_err(MatcherError::UnknownProtocol)?;
        if let Some(port) = port {
            if port == 0 {
                return Err(MatcherError::ZeroPort);
            }
            if !protocol.carries_ports() {
                return Err(MatcherError::PortlessProtocol(protocol));
            }
        }
        let destination = destination.map(HostMatch::parse).transpose()?;
        Ok(Self {
            protocol,
            destination,
            port,
        })
    }

    pub fn matches(&self, access: &NetworkAccess) -> bool {
        if !self.protocol.covers(access.protocol) {
            return false;
        }
        if let Some(port) = self.port {
            if access.port != Some(port) {
                return false;
            }
        }
        match &self.destination {
            Some(host) => host.matches(&access.destination),
            None => true,
        }
    }

    /// Exact destination > wildcard > any, then longer host literal, then a
    /// pinned port and an application-level protocol.
    pub fn specificity(&self) -> Specificity {
        let (tier, literal) = match &self.destination {
            Some(HostMatch::Exact(h)) => (2, h.len()),
            Some(HostMatch::Suffix(s)) => (1, s.len()),
            None => (0, 0),
        };
        let refinement =
            usize::from(self.port.is_some()) * 2 + usize::from(self.protocol.is_application());
        Specificity::new(tier, literal, refinement)
    }
}

impl fmt::Display for NetworkMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "network:protocol={}", self.protocol)?;
        match &self.destination {
            Some(HostMatch::Exact(h)) => write!(f, " destination={h}")?,
            Some(HostMatch::Suffix(s)) => write!(f, " destination=*{s}")?,
            None => {}
        }
        if let Some(port) = self.port {
            write!(f, " port={port}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum ExecTarget {
    Exact(String),
    Directory(DirPrefix),
}

#[derive(Debug, Clone)]
enum ArgsMatch {
    Any,
    Exact(Vec<String>),
    /// Anchored regex over the space-joined argument list.
    Pattern { source: String, regex: Regex },
}

/// Matches program executions by executable and, optionally, arguments.
#[derive(Debug, Clone)]
pub struct ProcessMatcher {
    target: ExecTarget,
    args: ArgsMatch,
}

impl ProcessMatcher {
    pub fn executable(path: &str) -> Result<Self, MatcherError> {
        validate_absolute(path)?;
        Ok(Self {
            target: ExecTarget::Exact(path.to_string()),
            args: ArgsMatch::Any,
        })
    }

    pub fn directory(dir: &str, recursive: bool) -> Result<Self, MatcherError> {
        Ok(Self {
            target: ExecTarget::Directory(DirPrefix::new(dir, recursive)?),
            args: ArgsMatch::Any,
        })
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = ArgsMatch::Exact(args);
        self
    }

    pub fn with_args_pattern(mut self, pattern: &str) -> Result<Self, MatcherError> {
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
            MatcherError::ArgsPattern {
                pattern: pattern.to_string(),
                source,
            }
        })?;
        self.args = ArgsMatch::Pattern {
            source: pattern.to_string(),
            regex,
        };
        Ok(self)
    }

    pub fn matches(&self, exec: &ProcessExec) -> bool {
        let target_matches = match &self.target {
            ExecTarget::Exact(p) => *p == exec.executable,
            ExecTarget::Directory(d) => d.contains(&exec.executable),
        };
        if !target_matches {
            return false;
        }
        match &self.args {
            ArgsMatch::Any => true,
            ArgsMatch::Exact(args) => *args == exec.args,
            ArgsMatch::Pattern { regex, .. } => regex.is_match(&exec.args.join(" ")),
        }
    }

    /// Exact executable > directory, exact args > pattern > none, then the
    /// longer path.
    pub fn specificity(&self) -> Specificity {
        let (form, literal) = match &self.target {
            ExecTarget::Exact(p) => (3, p.len()),
            ExecTarget::Directory(d) => (d.rank(), d.dir.len()),
        };
        let args = match self.args {
            ArgsMatch::Exact(_) => 2,
            ArgsMatch::Pattern { .. } => 1,
            ArgsMatch::Any => 0,
        };
        Specificity::new(form, args, literal)
    }
}

impl fmt::Display for ProcessMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            ExecTarget::Exact(p) => write!(f, "process:executable={p}")?,
            ExecTarget::Directory(d) => {
                write!(f, "process:dir={} recursive={}", d.dir, d.recursive)?
            }
        }
        match &self.args {
            ArgsMatch::Any => Ok(()),
            ArgsMatch::Exact(args) => write!(f, " args={args:?}"),
            ArgsMatch::Pattern { source, .. } => write!(f, " args_pattern={source}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(path: &str) -> FileAccess {
        FileAccess {
            path: path.to_string(),
            operation: FileOp::Read,
        }
    }

    fn http(host: &str) -> NetworkAccess {
        NetworkAccess {
            protocol: Protocol::Http,
            destination: host.to_string(),
            port: Some(80),
        }
    }

    fn exec(exe: &str, args: &[&str]) -> ProcessExec {
        ProcessExec {
            executable: exe.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    // ---- file ----

    #[test]
    fn file_exact() {
        let m = FileMatcher::exact("/etc/shadow").unwrap();
        assert!(m.matches(&read("/etc/shadow")));
        assert!(!m.matches(&read("/etc/shadow-")));
        assert!(!m.matches(&read("/etc/hosts")));
    }

    #[test]
    fn file_directory_recursion() {
        let flat = FileMatcher::directory("/etc", false).unwrap();
        assert!(flat.matches(&read("/etc/passwd")));
        assert!(!flat.matches(&read("/etc/ssh/sshd_config")));
        assert!(!flat.matches(&read("/etc")));

        let deep = FileMatcher::directory("/etc/", true).unwrap();
        assert!(deep.matches(&read("/etc/ssh/sshd_config")));
        assert!(!deep.matches(&read("/etcetera/x")));
    }

    #[test]
    fn file_glob_star_stays_in_segment() {
        let m = FileMatcher::pattern("/etc/*").unwrap();
        assert!(m.matches(&read("/etc/shadow")));
        assert!(!m.matches(&read("/etc/ssh/sshd_config")));

        let deep = FileMatcher::pattern("/var/log/**").unwrap();
        assert!(deep.matches(&read("/var/log/nginx/access.log")));
    }

    #[test]
    fn file_glob_without_meta_is_exact() {
        let m = FileMatcher::pattern("/etc/hosts").unwrap();
        assert_eq!(m.to_string(), "file:path=/etc/hosts");
    }

    #[test]
    fn file_operations_filter() {
        let m = FileMatcher::exact("/etc/passwd")
            .unwrap()
            .with_operations(vec![FileOp::Write, FileOp::Delete, FileOp::Write]);
        assert!(!m.matches(&read("/etc/passwd")));
        assert!(m.matches(&FileAccess {
            path: "/etc/passwd".into(),
            operation: FileOp::Write
        }));
        assert_eq!(m.to_string(), "file:path=/etc/passwd ops=[Write, Delete]");
    }

    #[test]
    fn file_paths_must_be_anchored() {
        assert!(matches!(
            FileMatcher::exact("etc/shadow"),
            Err(MatcherError::NotAbsolute(_))
        ));
        assert!(matches!(
            FileMatcher::directory("/etc/../root", true),
            Err(MatcherError::RelativeComponent(_))
        ));
        assert!(matches!(
            FileMatcher::exact("/etc//shadow"),
            Err(MatcherError::RepeatedSeparator(_))
        ));
        assert!(matches!(
            FileMatcher::pattern("/etc/[abc"),
            Err(MatcherError::Glob { .. })
        ));
    }

    #[test]
    fn exact_file_outranks_glob_in_same_directory() {
        let exact = FileMatcher::exact("/etc/shadow").unwrap();
        let glob = FileMatcher::pattern("/etc/*").unwrap();
        assert!(exact.specificity() > glob.specificity());

        let longer_glob = FileMatcher::pattern("/etc/ssh/*").unwrap();
        let dir = FileMatcher::directory("/etc", true).unwrap();
        assert!(longer_glob.specificity() > dir.specificity());
    }

    // ---- network ----

    #[test]
    fn network_protocol_only() {
        let m = NetworkMatcher::new("http", None, None).unwrap();
        assert!(m.matches(&http("example.com")));
        assert!(!m.matches(&NetworkAccess {
            protocol: Protocol::Udp,
            destination: "example.com".into(),
            port: Some(53),
        }));
    }

    #[test]
    fn network_destination_forms() {
        let exact = NetworkMatcher::new("http", Some("Allowed-Site.com"), None).unwrap();
        assert!(exact.matches(&http("allowed-site.com")));
        assert!(!exact.matches(&http("example.com")));

        let wildcard = NetworkMatcher::new("tcp", Some("*.example.com"), Some(80)).unwrap();
        assert!(wildcard.matches(&http("api.example.com")));
        assert!(!wildcard.matches(&http("example.com")));
        assert!(!wildcard.matches(&NetworkAccess {
            port: Some(443),
            ..http("api.example.com")
        }));
    }

    #[test]
    fn network_validation() {
        assert!(matches!(
            NetworkMatcher::new("sctp", None, None),
            Err(MatcherError::UnknownProtocol(_))
        ));
        assert!(matches!(
            NetworkMatcher::new("icmp", None, Some(7)),
            Err(MatcherError::PortlessProtocol(Protocol::Icmp))
        ));
        assert!(matches!(
            NetworkMatcher::new("tcp", None, Some(0)),
            Err(MatcherError::ZeroPort)
        ));
        assert!(matches!(
            NetworkMatcher::new("http", Some("bad host!"), None),
            Err(MatcherError::InvalidDestination(_))
        ));
        assert!(NetworkMatcher::new("udp", Some("10.0.0.1"), Some(53)).is_ok());
    }

    #[test]
    fn network_specificity_prefers_named_destination() {
        let any = NetworkMatcher::new("http", None, None).unwrap();
        let wildcard = NetworkMatcher::new("http", Some("*.site.com"), None).unwrap();
        let exact = NetworkMatcher::new("http", Some("allowed-site.com"), None).unwrap();
        assert!(exact.specificity() > wildcard.specificity());
        assert!(wildcard.specificity() > any.specificity());
    }

    // ---- process ----

    #[test]
    fn process_executable_and_args() {
        let any_args = ProcessMatcher::executable("/bin/ping").unwrap();
        assert!(any_args.matches(&exec("/bin/ping", &["-c", "1", "google.com"])));
        assert!(!any_args.matches(&exec("/bin/ls", &["/"])));

        let exact_args = ProcessMatcher::executable("/bin/ls")
            .unwrap()
            .with_args(vec!["/".into()]);
        assert!(exact_args.matches(&exec("/bin/ls", &["/"])));
        assert!(!exact_args.matches(&exec("/bin/ls", &["-la", "/"])));

        let pattern = ProcessMatcher::executable("/bin/ping")
            .unwrap()
            .with_args_pattern(r"-c \d+ .*")
            .unwrap();
        assert!(pattern.matches(&exec("/bin/ping", &["-c", "1", "google.com"])));
        assert!(!pattern.matches(&exec("/bin/ping", &["google.com"])));
    }

    #[test]
    fn process_directory() {
        let m = ProcessMatcher::directory("/usr/sbin", false).unwrap();
        assert!(m.matches(&exec("/usr/sbin/iptables", &[])));
        assert!(!m.matches(&exec("/usr/bin/ls", &[])));
    }

    #[test]
    fn process_exact_args_outrank_prefix() {
        let dir = ProcessMatcher::directory("/bin", true).unwrap();
        let exe = ProcessMatcher::executable("/bin/ls").unwrap();
        let exe_args = ProcessMatcher::executable("/bin/ls")
            .unwrap()
            .with_args(vec!["/".into()]);
        assert!(exe.specificity() > dir.specificity());
        assert!(exe_args.specificity() > exe.specificity());
    }

    #[test]
    fn invalid_args_pattern_rejected() {
        let err = ProcessMatcher::executable("/bin/sh")
            .unwrap()
            .with_args_pattern("(unclosed")
            .unwrap_err();
        assert!(matches!(err, MatcherError::ArgsPattern { .. }));
    }

    #[test]
    fn kind_mismatch_never_matches() {
        let m = Matcher::File(FileMatcher::exact("/bin/ls").unwrap());
        assert!(!m.matches(&AccessPayload::Process(exec("/bin/ls", &[]))));
    }
}
