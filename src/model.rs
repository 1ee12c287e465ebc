//! Core data model.
//!
//! A request is one unit of submitted work. It owns an ordered list of
//! operations (the steps), and each operation owns the files it acts on.
//! These are plain values; how they are stored lives in `storage` and `db`.

pub mod summary;

pub use summary::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Engine-assigned surrogate key of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub i64);

/// Engine-assigned surrogate key of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub i64);

/// Engine-assigned surrogate key of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub i64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Status vocabularies
// ---------------------------------------------------------------------------

/// Lifecycle status of a request.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum RequestStatus {
    /// Eligible for claiming.
    #[default]
    Waiting,
    /// Claimed by a worker.
    Assigned,
    Done,
    Failed,
    /// Cancelled. Never reactivated by a later put.
    Canceled,
    /// Handed off to an external scheduler, pending its callback.
    Scheduled,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 6] = [
        RequestStatus::Waiting,
        RequestStatus::Assigned,
        RequestStatus::Done,
        RequestStatus::Failed,
        RequestStatus::Canceled,
        RequestStatus::Scheduled,
    ];

    /// Statuses after which no worker will touch the request again.
    pub const FINAL: [RequestStatus; 3] = [
        RequestStatus::Done,
        RequestStatus::Failed,
        RequestStatus::Canceled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Waiting => "Waiting",
            RequestStatus::Assigned => "Assigned",
            RequestStatus::Done => "Done",
            RequestStatus::Failed => "Failed",
            RequestStatus::Canceled => "Canceled",
            RequestStatus::Scheduled => "Scheduled",
        }
    }

    /// Can a caller move a request from self to `to`?
    pub fn can_transition_to(self, to: RequestStatus) -> bool {
        use RequestStatus::*;
        match (self, to) {
            // cancellation is accepted from anywhere, including itself
            (_, Canceled) => true,
            (Canceled, _) => false,
            (Waiting, Assigned)
            | (Assigned, Waiting | Done | Failed | Scheduled)
            | (Scheduled, Waiting | Assigned | Done | Failed)
            | (Done | Failed, Waiting) => true,
            _ => false,
        }
    }
}

/// Lifecycle status of an operation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum OperationStatus {
    /// Next in line for its request.
    Waiting,
    Assigned,
    /// Accepted, waiting for the preceding steps.
    #[default]
    Queued,
    Done,
    Failed,
    Canceled,
    Scheduled,
}

impl OperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Waiting => "Waiting",
            OperationStatus::Assigned => "Assigned",
            OperationStatus::Queued => "Queued",
            OperationStatus::Done => "Done",
            OperationStatus::Failed => "Failed",
            OperationStatus::Canceled => "Canceled",
            OperationStatus::Scheduled => "Scheduled",
        }
    }

    /// Can a handler be invoked on an operation in this status?
    pub fn is_runnable(self) -> bool {
        matches!(
            self,
            OperationStatus::Waiting | OperationStatus::Assigned | OperationStatus::Queued
        )
    }
}

/// Status of a single target file.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum FileStatus {
    #[default]
    Waiting,
    Done,
    Failed,
    Scheduled,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Waiting => "Waiting",
            FileStatus::Done => "Done",
            FileStatus::Failed => "Failed",
            FileStatus::Scheduled => "Scheduled",
        }
    }
}

/// Checksum algorithm recorded for a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumType {
    #[serde(rename = "ADLER32")]
    Adler32,
    #[serde(rename = "MD5")]
    Md5,
    #[serde(rename = "SHA1")]
    Sha1,
    #[default]
    #[serde(rename = "")]
    None,
}

impl ChecksumType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumType::Adler32 => "ADLER32",
            ChecksumType::Md5 => "MD5",
            ChecksumType::Sha1 => "SHA1",
            ChecksumType::None => "",
        }
    }
}

macro_rules! status_text {
    ($ty:ty, $label:literal, [$($variant:ident),+ $(,)?]) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                $(
                    if s == <$ty>::$variant.as_str() {
                        return Ok(<$ty>::$variant);
                    }
                )+
                Err(Error::Other(format!("unknown {}: {s:?}", $label)))
            }
        }
    };
}

status_text!(RequestStatus, "request status", [Waiting, Assigned, Done, Failed, Canceled, Scheduled]);
status_text!(
    OperationStatus,
    "operation status",
    [Waiting, Assigned, Queued, Done, Failed, Canceled, Scheduled]
);
status_text!(FileStatus, "file status", [Waiting, Done, Failed, Scheduled]);
status_text!(ChecksumType, "checksum type", [Adler32, Md5, Sha1, None]);

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A unit of work submitted by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Request {
    /// Unset until the request is first persisted.
    pub request_id: Option<RequestId>,

    /// Producer-chosen, globally unique.
    pub name: String,

    pub status: RequestStatus,
    pub owner_dn: Option<String>,
    pub owner_group: Option<String>,

    /// External correlation key (the job that produced the request).
    pub job_id: Option<i64>,

    pub setup: Option<String>,
    pub source_component: Option<String>,

    /// Last error text.
    pub error: Option<String>,

    pub creation_time: DateTime<Utc>,
    pub submit_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,

    /// Steps, kept sorted by `order`.
    pub operations: Vec<Operation>,
}

impl Default for Request {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            request_id: None,
            name: String::new(),
            status: RequestStatus::Waiting,
            owner_dn: None,
            owner_group: None,
            job_id: None,
            setup: None,
            source_component: None,
            error: None,
            creation_time: now,
            submit_time: now,
            last_update: now,
            operations: Vec::new(),
        }
    }
}

impl Request {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn owner(mut self, dn: impl Into<String>, group: impl Into<String>) -> Self {
        self.owner_dn = Some(dn.into());
        self.owner_group = Some(group.into());
        self
    }

    pub fn job_id(mut self, job_id: i64) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn setup(mut self, setup: impl Into<String>) -> Self {
        self.setup = Some(setup.into());
        self
    }

    pub fn source_component(mut self, component: impl Into<String>) -> Self {
        self.source_component = Some(component.into());
        self
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.add_operation(operation);
        self
    }

    /// Append a step. Its order is one past the current last step and never
    /// changes afterwards.
    pub fn add_operation(&mut self, mut operation: Operation) -> &mut Operation {
        operation.order = self.next_order();
        operation.request_id = self.request_id;
        self.operations.push(operation);
        let last = self.operations.len() - 1;
        &mut self.operations[last]
    }

    /// Give steps that were never stored an order after the last stored
    /// step. Among themselves they keep any order they were given, then
    /// list position. Trees parsed from JSON usually carry no orders.
    pub fn sequence_new_operations(&mut self) {
        let mut next = self
            .operations
            .iter()
            .filter(|op| op.operation_id.is_some())
            .map(|op| op.order + 1)
            .max()
            .unwrap_or(0);
        let mut fresh: Vec<&mut Operation> = self
            .operations
            .iter_mut()
            .filter(|op| op.operation_id.is_none())
            .collect();
        fresh.sort_by_key(|op| op.order);
        for op in fresh {
            op.order = next;
            next += 1;
        }
        self.operations.sort_by_key(|op| op.order);
    }

    fn next_order(&self) -> i32 {
        self.operations
            .iter()
            .map(|op| op.order + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn operation(&self, id: OperationId) -> Option<&Operation> {
        self.operations
            .iter()
            .find(|op| op.operation_id == Some(id))
    }

    /// Render the request tree as descriptive text.
    pub fn digest(&self) -> String {
        let mut out = format!(
            "{} [{}] id={} job={} owner={}@{}\n",
            self.name,
            self.status,
            self.request_id
                .map_or_else(|| "-".to_string(), |id| id.to_string()),
            self.job_id.map_or_else(|| "-".to_string(), |j| j.to_string()),
            self.owner_dn.as_deref().unwrap_or("-"),
            self.owner_group.as_deref().unwrap_or("-"),
        );
        if let Some(ref error) = self.error {
            out.push_str(&format!("  error: {error}\n"));
        }

        for op in &self.operations {
            out.push_str(&format!(
                "  {}:{} [{}] source={} target={}\n",
                op.order,
                op.op_type,
                op.status,
                op.source_se.as_deref().unwrap_or("-"),
                op.target_se.as_deref().unwrap_or("-"),
            ));
            if let Some(ref error) = op.error {
                out.push_str(&format!("    error: {error}\n"));
            }
            for file in &op.files {
                out.push_str(&format!(
                    "    {} [{}] attempt={}",
                    file.lfn, file.status, file.attempt
                ));
                if let Some(ref error) = file.error {
                    out.push_str(&format!(" error={error}"));
                }
                out.push('\n');
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// One step of a request, interpreted by the handler registered for its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Operation {
    pub operation_id: Option<OperationId>,
    pub request_id: Option<RequestId>,

    /// Selects the handler (e.g. "ReplicateAndRegister").
    #[serde(rename = "type")]
    pub op_type: String,

    /// Position within the request. Set once, when the step is added.
    pub order: i32,

    pub status: OperationStatus,
    pub target_se: Option<String>,
    pub source_se: Option<String>,
    pub catalog: Option<String>,

    /// Opaque to the queue; only the handler reads it.
    pub arguments: Option<String>,

    pub error: Option<String>,
    pub creation_time: DateTime<Utc>,
    pub submit_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,

    pub files: Vec<File>,
}

impl Default for Operation {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            operation_id: None,
            request_id: None,
            op_type: String::new(),
            order: 0,
            status: OperationStatus::Queued,
            target_se: None,
            source_se: None,
            catalog: None,
            arguments: None,
            error: None,
            creation_time: now,
            submit_time: now,
            last_update: now,
            files: Vec::new(),
        }
    }
}

impl Operation {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            ..Self::default()
        }
    }

    pub fn status(mut self, status: OperationStatus) -> Self {
        self.status = status;
        self
    }

    pub fn target_se(mut self, se: impl Into<String>) -> Self {
        self.target_se = Some(se.into());
        self
    }

    pub fn source_se(mut self, se: impl Into<String>) -> Self {
        self.source_se = Some(se.into());
        self
    }

    pub fn catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    pub fn arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = Some(arguments.into());
        self
    }

    pub fn with_file(mut self, file: File) -> Self {
        self.files.push(file);
        self
    }

    /// Record a failure on the step.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = OperationStatus::Failed;
        self.error = Some(error.into());
    }
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

/// A target artifact of an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct File {
    pub file_id: Option<FileId>,
    pub operation_id: Option<OperationId>,

    /// Logical file name.
    pub lfn: String,
    /// Physical location, if known.
    pub pfn: Option<String>,

    pub checksum_type: ChecksumType,
    pub checksum: Option<String>,
    pub guid: Option<String>,
    pub size: u64,
    pub status: FileStatus,

    /// Retries of this target so far.
    pub attempt: u32,

    pub error: Option<String>,
}

impl File {
    pub fn new(lfn: impl Into<String>) -> Self {
        Self {
            lfn: lfn.into(),
            ..Self::default()
        }
    }

    pub fn pfn(mut self, pfn: impl Into<String>) -> Self {
        self.pfn = Some(pfn.into());
        self
    }

    pub fn checksum(mut self, kind: ChecksumType, value: impl Into<String>) -> Self {
        self.checksum_type = kind;
        self.checksum = Some(value.into());
        self
    }

    pub fn guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = Some(guid.into());
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Put the target back in line for another attempt.
    pub fn retry(&mut self) {
        self.attempt += 1;
        self.status = FileStatus::Waiting;
        self.error = None;
    }
}
