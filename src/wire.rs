//! Remote payload shapes and their conversion into [`StatusRecord`]s.

use crate::model::{
    LogLine, OperationId, OperationKind, Phase, StatusRecord, parse_remote_timestamp, unix_millis,
};
use serde::Deserialize;
use serde_json::Value;

const OPERATION_ID_KEYS: [&str; 4] = ["/operation_id", "/build_id", "/pull_id", "/_id"];

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RemoteStatus {
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(default, rename = "_id")]
    pub object_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub logs: Option<Vec<RemoteLog>>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub image_tag: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum RemoteLog {
    Entry {
        #[serde(default)]
        log: Option<String>,
        #[serde(default)]
        timestamp: Option<String>,
    },
    Text(String),
}

impl RemoteLog {
    fn into_line(self) -> Option<LogLine> {
        match self {
            RemoteLog::Entry { log, timestamp } => log.map(|text| LogLine { text, timestamp }),
            RemoteLog::Text(text) => Some(LogLine::new(text)),
        }
    }
}

impl RemoteStatus {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn id(&self) -> Option<&str> {
        self.operation_id
            .as_deref()
            .or(self.object_id.as_deref())
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Maps the remote status vocabulary onto [`Phase`]. Unknown values are
    /// treated as still running so polling continues.
    pub fn phase(&self) -> Phase {
        let status = self
            .status
            .as_deref()
            .map(|s| s.trim().to_ascii_lowercase())
            .unwrap_or_default();
        match status.as_str() {
            "pending" | "queued" | "accepted" => Phase::Pending,
            "completed" | "complete" | "done" | "succeeded" | "success" => {
                if self.success == Some(false) {
                    Phase::Failed
                } else {
                    Phase::Succeeded
                }
            }
            "failed" | "error" | "errored" => Phase::Failed,
            _ => Phase::InProgress,
        }
    }

    pub fn target(&self) -> Option<&str> {
        self.image_tag
            .as_deref()
            .or(self.image.as_deref())
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn into_record(
        self,
        kind: OperationKind,
        fallback_target: &str,
        revision: u64,
    ) -> StatusRecord {
        let phase = self.phase();
        let target = self
            .target()
            .map(str::to_string)
            .unwrap_or_else(|| fallback_target.to_string());
        let mut log_lines: Vec<LogLine> = self
            .logs
            .unwrap_or_default()
            .into_iter()
            .filter_map(RemoteLog::into_line)
            .collect();
        let error = self
            .error
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty());
        if phase == Phase::Failed {
            if let Some(message) = error.as_deref() {
                if !log_lines.iter().any(|line| line.text.contains(message)) {
                    log_lines.push(LogLine::new(format!("ERROR: {message}")));
                }
            }
        }

        let mut record = StatusRecord {
            kind,
            target,
            phase,
            started_at: self.started_at.as_deref().and_then(parse_remote_timestamp),
            finished_at: self.finished_at.as_deref().and_then(parse_remote_timestamp),
            log_lines,
            failure_category: None,
            revision,
            error,
            verified_by_listing: false,
        };
        record.normalize();
        record
    }

    /// Revision for a record that arrives through a bulk history load: the
    /// moment it last changed on the remote side.
    pub fn history_revision(&self) -> u64 {
        self.finished_at
            .as_deref()
            .and_then(parse_remote_timestamp)
            .or_else(|| self.started_at.as_deref().and_then(parse_remote_timestamp))
            .map(unix_millis)
            .unwrap_or(0)
    }
}

pub fn pointer_as_str<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Pulls the operation id out of a submission response.
pub fn extract_operation_id(body: &Value) -> Option<String> {
    OPERATION_ID_KEYS
        .iter()
        .find_map(|key| pointer_as_str(body, key))
        .map(str::to_string)
}

/// Reads a history payload. Accepts a bare array or an object wrapping the
/// array under `pulls`, `builds`, `items` or `history`.
pub fn parse_history(kind: OperationKind, body: &Value) -> Vec<(OperationId, StatusRecord)> {
    let entries = match body {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => ["pulls", "builds", "items", "history"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    };

    entries
        .iter()
        .filter_map(|entry| {
            let remote = RemoteStatus::from_value(entry.clone()).ok()?;
            let id = remote.id()?.to_string();
            let revision = remote.history_revision();
            let record = remote.into_record(kind, "", revision);
            Some((OperationId::remote(id), record))
        })
        .collect()
}

/// Reads a listing payload (`{images: [...]}`, `{containers: [...]}` or a
/// bare array).
pub fn parse_listing(key: &str, body: &Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map
            .get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Whether an image listing holds `target` (`name[:tag]`, tag defaults to
/// `latest`).
pub fn listing_contains_image(items: &[Value], target: &str) -> bool {
    let wanted = normalize_image_ref(target);
    if wanted.is_empty() {
        return false;
    }
    items.iter().any(|item| {
        let tags = ["/tags", "/RepoTags", "/repo_tags"]
            .iter()
            .filter_map(|key| item.pointer(key).and_then(Value::as_array))
            .flatten()
            .filter_map(Value::as_str);
        let named = match (pointer_as_str(item, "/name"), pointer_as_str(item, "/tag")) {
            (Some(name), Some(tag)) => Some(format!("{name}:{tag}")),
            (Some(name), None) => Some(name.to_string()),
            _ => None,
        };
        tags.map(str::to_string)
            .chain(named)
            .any(|candidate| normalize_image_ref(&candidate) == wanted)
    })
}

fn normalize_image_ref(raw: &str) -> String {
    let trimmed = raw.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        return trimmed;
    }
    let last_segment = trimmed.rsplit('/').next().unwrap_or(&trimmed);
    if last_segment.contains(':') || last_segment.contains('@') {
        trimmed
    } else {
        format!("{trimmed}:latest")
    }
}
