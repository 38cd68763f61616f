//! Allocation and stream data model.
//!
//! Types here mirror the control plane's JSON shapes (PascalCase field
//! names) so they deserialize directly from API responses. Snapshots are
//! never mutated after a fetch; the reconciler only ever replaces them.

use std::collections::BTreeMap;
use std::str::FromStr;

use allocsync_id::{AllocationId, NodeId};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};

/// Allocation snapshot as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    #[serde(rename = "ID")]
    pub id: AllocationId,

    #[serde(rename = "Name", default)]
    pub name: String,

    #[serde(rename = "NodeID")]
    pub node_id: NodeId,

    #[serde(rename = "JobID", default)]
    pub job_id: String,

    #[serde(rename = "TaskGroup", default)]
    pub task_group: String,

    #[serde(rename = "ClientStatus")]
    pub client_status: ClientStatus,

    /// Task names, sorted.
    #[serde(
        rename = "TaskStates",
        default,
        deserialize_with = "task_names",
        serialize_with = "serialize_task_names"
    )]
    pub tasks: Vec<String>,
}

impl Allocation {
    /// Whether the allocation counts as live for reconciliation.
    pub fn is_live(&self) -> bool {
        self.client_status.is_live()
    }
}

fn task_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let states: Option<BTreeMap<String, IgnoredAny>> = Option::deserialize(deserializer)?;
    Ok(states.map(|s| s.into_keys().collect()).unwrap_or_default())
}

fn serialize_task_names<S>(tasks: &[String], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeMap;

    let mut map = serializer.serialize_map(Some(tasks.len()))?;
    for task in tasks {
        map.serialize_entry(task, &serde_json::json!({}))?;
    }
    map.end()
}

/// Client-reported allocation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Pending,
    Running,
    Restarting,
    Complete,
    Failed,
    Lost,
    #[serde(other)]
    Unknown,
}

impl ClientStatus {
    /// Only running and restarting allocations are tracked.
    pub fn is_live(&self) -> bool {
        matches!(self, ClientStatus::Running | ClientStatus::Restarting)
    }
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientStatus::Pending => write!(f, "pending"),
            ClientStatus::Running => write!(f, "running"),
            ClientStatus::Restarting => write!(f, "restarting"),
            ClientStatus::Complete => write!(f, "complete"),
            ClientStatus::Failed => write!(f, "failed"),
            ClientStatus::Lost => write!(f, "lost"),
            ClientStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Membership change detected by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationEvent {
    Added(Allocation),
    Removed(Allocation),
}

impl AllocationEvent {
    /// The allocation snapshot carried by the event.
    pub fn allocation(&self) -> &Allocation {
        match self {
            AllocationEvent::Added(a) | AllocationEvent::Removed(a) => a,
        }
    }

    pub fn into_allocation(self) -> Allocation {
        match self {
            AllocationEvent::Added(a) | AllocationEvent::Removed(a) => a,
        }
    }
}

/// Task log stream selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogType {
    Stdout,
    Stderr,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Stdout => "stdout",
            LogType::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for LogType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(LogType::Stdout),
            "stderr" => Ok(LogType::Stderr),
            other => Err(format!("unknown log type: {other}")),
        }
    }
}

/// Where a stream offset is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Origin {
    #[default]
    Start,
    End,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Start => "start",
            Origin::End => "end",
        }
    }
}

/// Out-of-band file notification carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    Deleted,
    Truncated,
}

impl FileEvent {
    /// Parse the wire representation; unknown values yield `None`.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "file deleted" => Some(FileEvent::Deleted),
            "file truncated" => Some(FileEvent::Truncated),
            _ => None,
        }
    }
}

/// Chunk of streamed bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    /// Offset of the end of this chunk within the file.
    pub offset: i64,

    pub data: Bytes,

    /// File the chunk was read from.
    pub file: String,

    pub file_event: Option<FileEvent>,
}

impl StreamFrame {
    /// Build a data frame.
    pub fn new(offset: i64, data: impl Into<Bytes>, file: impl Into<String>) -> Self {
        Self {
            offset,
            data: data.into(),
            file: file.into(),
            file_event: None,
        }
    }

    /// Number of payload bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Metadata about a file inside an allocation directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "IsDir", default)]
    pub is_dir: bool,

    #[serde(rename = "Size", default)]
    pub size: i64,

    #[serde(rename = "FileMode", default)]
    pub file_mode: String,

    #[serde(rename = "ModTime")]
    pub mod_time: DateTime<Utc>,

    #[serde(rename = "ContentType", default)]
    pub content_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const ALLOCATION_JSON: &str = r#"{
        "ID": "5456bd7a-9fc0-c0dd-6131-cbee77f57577",
        "EvalID": "5456bd7a-9fc0-c0dd-6131-cbee77f57577",
        "Name": "example.cache[0]",
        "NodeID": "fb2170a8-257d-3c64-b14d-bc06cc94e34c",
        "JobID": "example",
        "TaskGroup": "cache",
        "DesiredStatus": "run",
        "ClientStatus": "running",
        "TaskStates": {
            "redis": { "State": "running", "Failed": false },
            "sidecar": { "State": "running", "Failed": false }
        },
        "CreateIndex": 9,
        "ModifyIndex": 13
    }"#;

    #[test]
    fn test_allocation_deserialization() {
        let alloc: Allocation = serde_json::from_str(ALLOCATION_JSON).unwrap();

        assert_eq!(alloc.id.as_str(), "5456bd7a-9fc0-c0dd-6131-cbee77f57577");
        assert_eq!(alloc.node_id.as_str(), "fb2170a8-257d-3c64-b14d-bc06cc94e34c");
        assert_eq!(alloc.job_id, "example");
        assert_eq!(alloc.task_group, "cache");
        assert_eq!(alloc.client_status, ClientStatus::Running);
        assert_eq!(alloc.tasks, vec!["redis", "sidecar"]);
        assert!(alloc.is_live());
    }

    #[test]
    fn test_allocation_without_task_states() {
        let json = r#"{
            "ID": "a1",
            "NodeID": "n1",
            "ClientStatus": "pending",
            "TaskStates": null
        }"#;

        let alloc: Allocation = serde_json::from_str(json).unwrap();
        assert!(alloc.tasks.is_empty());
        assert!(!alloc.is_live());
    }

    #[rstest]
    #[case("pending", ClientStatus::Pending, false)]
    #[case("running", ClientStatus::Running, true)]
    #[case("restarting", ClientStatus::Restarting, true)]
    #[case("complete", ClientStatus::Complete, false)]
    #[case("failed", ClientStatus::Failed, false)]
    #[case("lost", ClientStatus::Lost, false)]
    #[case("evicted", ClientStatus::Unknown, false)]
    fn test_client_status_liveness(
        #[case] raw: &str,
        #[case] status: ClientStatus,
        #[case] live: bool,
    ) {
        let parsed: ClientStatus = serde_json::from_str(&format!("\"{raw}\"")).unwrap();
        assert_eq!(parsed, status);
        assert_eq!(parsed.is_live(), live);
    }

    #[test]
    fn test_file_info_deserialization() {
        let json = r#"{
            "Name": "redis.stdout.0",
            "IsDir": false,
            "Size": 1024,
            "FileMode": "-rw-r--r--",
            "ModTime": "2016-03-15T15:40:56.822238153-07:00",
            "ContentType": "text/plain; charset=utf-8"
        }"#;

        let info: FileInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.name, "redis.stdout.0");
        assert_eq!(info.size, 1024);
        assert_eq!(info.file_mode, "-rw-r--r--");
        assert_eq!(info.mod_time.to_rfc3339(), "2016-03-15T22:40:56.822238153+00:00");
    }

    #[test]
    fn test_log_type_parse() {
        assert_eq!("stderr".parse::<LogType>().unwrap(), LogType::Stderr);
        assert!("stdin".parse::<LogType>().is_err());
    }

    #[test]
    fn test_file_event_from_wire() {
        assert_eq!(FileEvent::from_wire("file deleted"), Some(FileEvent::Deleted));
        assert_eq!(FileEvent::from_wire("file truncated"), Some(FileEvent::Truncated));
        assert_eq!(FileEvent::from_wire(""), None);
    }
}
