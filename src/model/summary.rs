//! Read-side projections returned by the query surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{FileStatus, OperationStatus, RequestId, RequestStatus};

/// Flat view of a request row, fields in a fixed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub request_id: RequestId,
    pub status: RequestStatus,
    pub name: String,
    pub job_id: Option<i64>,
    pub owner_dn: Option<String>,
    pub owner_group: Option<String>,
    pub setup: Option<String>,
    pub source_component: Option<String>,
    pub creation_time: DateTime<Utc>,
    pub submit_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

/// How a caller refers to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestRef {
    Name(String),
    Id(RequestId),
}

impl From<&str> for RequestRef {
    fn from(name: &str) -> Self {
        RequestRef::Name(name.to_string())
    }
}

impl From<String> for RequestRef {
    fn from(name: String) -> Self {
        RequestRef::Name(name)
    }
}

impl From<RequestId> for RequestRef {
    fn from(id: RequestId) -> Self {
        RequestRef::Id(id)
    }
}

impl std::fmt::Display for RequestRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestRef::Name(name) => write!(f, "'{name}'"),
            RequestRef::Id(id) => write!(f, "RequestID={id}"),
        }
    }
}

/// Result of a job-keyed batch lookup. Every queried job appears in exactly
/// one of the two maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLookup<T> {
    pub successful: BTreeMap<i64, T>,
    pub failed: BTreeMap<i64, String>,
}

impl<T> JobLookup<T> {
    /// Split `jobs` into the ones present in `found` and the rest.
    pub fn partition(jobs: &[i64], found: BTreeMap<i64, T>) -> Self {
        let failed = jobs
            .iter()
            .filter(|job| !found.contains_key(job))
            .map(|job| (*job, "Request not found".to_string()))
            .collect();
        Self {
            successful: found,
            failed,
        }
    }
}

/// Status histograms over the whole store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub request: BTreeMap<RequestStatus, u64>,
    /// Keyed by operation type, then status.
    pub operation: BTreeMap<String, BTreeMap<OperationStatus, u64>>,
    pub file: BTreeMap<FileStatus, u64>,
}

/// Selection for `get_request_names`.
#[derive(Debug, Clone, Default)]
pub struct NamesFilter {
    /// Empty means the final statuses.
    pub statuses: Vec<RequestStatus>,
    /// Defaults to 100.
    pub limit: Option<usize>,
    /// Only requests updated strictly after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only requests updated strictly before this instant.
    pub until: Option<DateTime<Utc>>,
}

impl NamesFilter {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn statuses(&self) -> Vec<RequestStatus> {
        if self.statuses.is_empty() {
            RequestStatus::FINAL.to_vec()
        } else {
            self.statuses.clone()
        }
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_puts_every_job_in_one_map() {
        let found = BTreeMap::from([(1, "req-1".to_string())]);
        let lookup = JobLookup::partition(&[1, 2, 3], found);
        assert_eq!(lookup.successful.len(), 1);
        assert_eq!(lookup.failed.keys().copied().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(lookup.failed[&2], "Request not found");
    }

    #[test]
    fn names_filter_defaults_to_final_statuses() {
        let filter = NamesFilter::default();
        assert_eq!(filter.statuses(), RequestStatus::FINAL.to_vec());
        assert_eq!(filter.limit(), 100);
    }
}
