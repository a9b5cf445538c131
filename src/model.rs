use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

const PROVISIONAL_PREFIX: &str = "provisional:";
const LOCAL_PREFIX: &str = "local:";

/// Identifier of one tracked operation.
///
/// Remote ids are assigned by the service when it accepts a submission.
/// Provisional ids only exist between submission and acceptance and are
/// never persisted. Local ids name container actions, which complete
/// synchronously and are never polled.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationId {
    Remote(String),
    Provisional(String),
    Local(String),
}

impl OperationId {
    pub fn remote(raw: impl Into<String>) -> Self {
        Self::Remote(raw.into())
    }

    pub fn provisional() -> Self {
        Self::Provisional(nanoid::nanoid!(12))
    }

    pub fn local() -> Self {
        Self::Local(nanoid::nanoid!(12))
    }

    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Some(rest) = trimmed.strip_prefix(PROVISIONAL_PREFIX) {
            return Self::Provisional(rest.to_string());
        }
        if let Some(rest) = trimmed.strip_prefix(LOCAL_PREFIX) {
            return Self::Local(rest.to_string());
        }
        Self::Remote(trimmed.to_string())
    }

    pub fn raw(&self) -> &str {
        match self {
            Self::Remote(raw) | Self::Provisional(raw) | Self::Local(raw) => raw,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(raw) => f.write_str(raw),
            Self::Provisional(raw) => write!(f, "{PROVISIONAL_PREFIX}{raw}"),
            Self::Local(raw) => write!(f, "{LOCAL_PREFIX}{raw}"),
        }
    }
}

impl Serialize for OperationId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for OperationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::parse(&value))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Build,
    Pull,
    ContainerAction,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Pull => "pull",
            Self::ContainerAction => "container-action",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "build" | "builds" => Some(Self::Build),
            "pull" | "pulls" => Some(Self::Pull),
            "container-action" | "container" => Some(Self::ContainerAction),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl Phase {
    /// Position in the forward-only ordering. Both terminal phases share a rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Succeeded | Self::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Listings that depend on operation outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Images,
    Containers,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Images => "images",
            Self::Containers => "containers",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    MissingBuildContextFile,
    SyntaxError,
    ImageNotFound,
    Unclassified,
}

impl FailureCategory {
    pub fn code(self) -> &'static str {
        match self {
            Self::MissingBuildContextFile => "missing-build-context-file",
            Self::SyntaxError => "syntax-error",
            Self::ImageNotFound => "image-not-found",
            Self::Unclassified => "unclassified",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::MissingBuildContextFile => "Missing file in build context",
            Self::SyntaxError => "Build specification syntax error",
            Self::ImageNotFound => "Image not found",
            Self::Unclassified => "Failed",
        }
    }

    pub fn remediation(self) -> &'static str {
        match self {
            Self::MissingBuildContextFile => {
                "Add the missing file to the build context, or edit the build specification so it no longer references it."
            }
            Self::SyntaxError => "Edit the build specification and fix the malformed instruction.",
            Self::ImageNotFound => {
                "Check the image name and tag, and that the registry allows pulling it."
            }
            Self::Unclassified => "Inspect the trailing log lines below for the cause.",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl LogLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: None,
        }
    }

    pub fn at(text: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: Some(timestamp.into()),
        }
    }

    /// Content hash used to recognise a line already held by a record.
    pub fn identity(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.timestamp.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(self.text.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub kind: OperationKind,
    pub target: String,
    pub phase: Phase,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub log_lines: Vec<LogLine>,
    #[serde(default)]
    pub failure_category: Option<FailureCategory>,
    pub revision: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub verified_by_listing: bool,
}

impl StatusRecord {
    pub fn pending(kind: OperationKind, target: impl Into<String>, revision: u64) -> Self {
        Self {
            kind,
            target: target.into(),
            phase: Phase::Pending,
            started_at: Some(Utc::now()),
            finished_at: None,
            log_lines: Vec::new(),
            failure_category: None,
            revision,
            error: None,
            verified_by_listing: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Moves the record into a terminal phase, stamping `finished_at` if unset.
    pub fn finish(&mut self, phase: Phase) {
        if !phase.is_terminal() {
            return;
        }
        self.phase = phase;
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
        if phase != Phase::Failed {
            self.failure_category = None;
        }
    }

    /// Restores the `finished_at` / `failure_category` invariants after a
    /// record was assembled from loosely-typed input.
    pub fn normalize(&mut self) {
        if self.phase.is_terminal() {
            if self.finished_at.is_none() {
                self.finished_at = Some(Utc::now());
            }
        } else {
            self.finished_at = None;
        }
        if self.phase != Phase::Failed {
            self.failure_category = None;
        }
    }

    /// Turns a remote `success:false` into a success after the target was
    /// found in a fresh listing.
    pub fn mark_verified_success(&mut self) {
        self.log_lines.push(LogLine::new(format!(
            "opwatch: remote reported failure but {} is present in the listing; treating as succeeded",
            self.target
        )));
        self.phase = Phase::Succeeded;
        self.failure_category = None;
        self.verified_by_listing = true;
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn trailing_lines(&self, count: usize) -> Vec<String> {
        let skip = self.log_lines.len().saturating_sub(count);
        self.log_lines
            .iter()
            .skip(skip)
            .map(|line| line.text.clone())
            .collect()
    }
}

/// Parses the timestamp shapes the remote emits: RFC 3339 with an offset,
/// or a naive ISO timestamp that is implicitly UTC.
pub fn parse_remote_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

pub fn unix_millis(at: DateTime<Utc>) -> u64 {
    at.timestamp_millis().max(0) as u64
}
