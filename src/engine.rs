//! Core engine. The public API for enqueueing, claiming and inspecting
//! requests on the embedded SQLite store.
//!
//! Every method runs in exactly one storage transaction and returns fully
//! materialized values. Claims are single conditional writes, so concurrent
//! engines on the same database file never hand out one request twice.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::model::*;
use crate::storage::{Storage, TxContext};
use crate::telemetry::{NoopMonitor, PutOutcome, QueueMonitor};

/// The request queue engine. Owns the storage and enforces all invariants.
pub struct Engine {
    storage: Storage,
    config: QueueConfig,
    monitor: Arc<dyn QueueMonitor>,
}

impl Engine {
    /// Create an engine with in-memory storage (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            storage: Storage::in_memory()?,
            config: QueueConfig::default(),
            monitor: Arc::new(NoopMonitor),
        })
    }

    /// Create an engine backed by a database file, creating it if needed.
    pub fn open(path: impl AsRef<Path>, config: QueueConfig) -> Result<Self> {
        let path = path.as_ref();
        let storage = Storage::open(path, config.busy_timeout)
            .map_err(|e| Error::Config(format!("cannot open {}: {e}", path.display())))?;
        Ok(Self {
            storage,
            config,
            monitor: Arc::new(NoopMonitor),
        })
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn QueueMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Create or update a request tree, keyed by its name.
    ///
    /// A stored request with the same name but another identity is a
    /// `DuplicateName`. A stored request that was cancelled is left alone and
    /// its id returned. Otherwise the whole tree is written and the assigned
    /// ids are copied back into `request`.
    pub fn put_request(&mut self, request: &mut Request) -> Result<RequestId> {
        validate_name(&request.name)?;
        let mut staged = request.clone();
        staged.last_update = Utc::now();

        let result = self.storage.with_transaction("put_request", |ctx| {
            put_in(ctx, &mut staged)
        });
        finish_put(self.monitor.as_ref(), request, staged, result)
    }

    // -----------------------------------------------------------------------
    // Claim
    // -----------------------------------------------------------------------

    /// Claim a request by name. Fails with `AlreadyAssigned` if another
    /// worker holds it.
    pub fn get_request(&mut self, name: &str) -> Result<Request> {
        let now = Utc::now();
        let (request, from) = self.storage.with_transaction("get_request", |ctx| {
            let (id, status) = find_in(ctx, name)?;
            claim_named_in(ctx, id, name, status, now)
        })?;
        self.claimed("named", &[(from, &request)]);
        Ok(request)
    }

    /// Read a request by name without changing it.
    pub fn peek_request(&self, name: &str) -> Result<Request> {
        self.storage.with_read("peek_request", |ctx| {
            let (id, _) = find_in(ctx, name)?;
            ctx.load_request(id)
        })
    }

    /// Claim one Waiting request picked at random from the oldest and
    /// newest windows. `None` when nothing is Waiting.
    pub fn claim_next(&mut self) -> Result<Option<Request>> {
        let now = Utc::now();
        let (oldest, newest) = (self.config.oldest_window, self.config.newest_window);
        let claimed = self.storage.with_transaction("claim_next", |ctx| {
            for id in candidates_in(ctx, oldest, newest)? {
                // Lost races just move on to the next candidate.
                if ctx.claim_waiting(id, now)? {
                    return ctx.load_request(id).map(Some);
                }
            }
            Ok(None)
        })?;

        if let Some(ref request) = claimed {
            self.claimed("anonymous", &[(RequestStatus::Waiting, request)]);
        }
        Ok(claimed)
    }

    /// Same selection as [`Engine::claim_next`] without claiming.
    pub fn peek_next(&self) -> Result<Option<Request>> {
        let (oldest, newest) = (self.config.oldest_window, self.config.newest_window);
        self.storage.with_read("peek_next", |ctx| {
            match candidates_in(ctx, oldest, newest)?.first() {
                Some(id) => ctx.load_request(*id).map(Some),
                None => Ok(None),
            }
        })
    }

    /// Read up to `n` Waiting requests, oldest first. With `claim`, only the
    /// requests this call actually flipped to Assigned are returned.
    pub fn get_bulk_requests(
        &mut self,
        n: usize,
        claim: bool,
    ) -> Result<BTreeMap<RequestId, Request>> {
        validate_bulk(n)?;
        let now = Utc::now();
        let op = if claim { "get_bulk_requests" } else { "peek_bulk_requests" };
        let requests = self.storage.with_transaction(op, |ctx| {
            let selected = ctx.waiting_window(true, n)?;
            let ids = if claim {
                ctx.claim_waiting_batch(&selected, now)?
            } else {
                selected
            };
            ids.into_iter()
                .map(|id| Ok::<_, Error>((id, ctx.load_request(id)?)))
                .collect::<Result<BTreeMap<_, _>>>()
        })?;

        if claim {
            let claimed: Vec<_> = requests
                .values()
                .map(|request| (RequestStatus::Waiting, request))
                .collect();
            self.claimed("bulk", &claimed);
        }
        Ok(requests)
    }

    /// Claim the request owning the given operation, typically one handed
    /// to an external scheduler. `None` if no such operation exists.
    pub fn get_scheduled_request(&mut self, operation_id: OperationId) -> Result<Option<Request>> {
        let now = Utc::now();
        let claimed = self.storage.with_transaction("get_scheduled_request", |ctx| {
            let Some(request_id) = ctx.scheduled_request(operation_id)? else {
                return Ok(None);
            };
            let name = ctx
                .request_name(request_id)?
                .ok_or_else(|| Error::NotFound(format!("RequestID={request_id}")))?;
            let (id, status) = find_in(ctx, &name)?;
            claim_named_in(ctx, id, &name, status, now).map(Some)
        })?;

        if let Some((ref request, from)) = claimed {
            self.claimed("named", &[(from, request)]);
        }
        Ok(claimed.map(|(request, _)| request))
    }

    fn claimed(&self, mode: &'static str, requests: &[(RequestStatus, &Request)]) {
        report_claims(self.monitor.as_ref(), mode, requests);
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Mark a request Canceled. Accepted from any status, including
    /// Canceled and Done.
    pub fn cancel_request(&mut self, name: &str) -> Result<RequestId> {
        let now = Utc::now();
        let (id, from) = self.storage.with_transaction("cancel_request", |ctx| {
            let (id, status) = find_in(ctx, name)?;
            ctx.set_status(name, RequestStatus::Canceled, now)?;
            Ok((id, status))
        })?;
        self.monitor.status_changed(from, RequestStatus::Canceled);
        info!(name, %id, from = from.as_str(), "request canceled");
        Ok(id)
    }

    /// Remove a request with all its operations and files. Deleting an
    /// unknown name succeeds.
    pub fn delete_request(&mut self, name: &str) -> Result<()> {
        let deleted = self.storage.with_transaction("delete_request", |ctx| {
            match ctx.find_request(name)? {
                Some((id, _)) => ctx.delete_request(id).map(|_| Some(id)),
                None => Ok(None),
            }
        })?;
        match deleted {
            Some(id) => info!(name, %id, "request deleted"),
            None => debug!(name, "delete of unknown request ignored"),
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_request_status(&self, name: &str) -> Result<RequestStatus> {
        self.storage
            .with_read("get_request_status", |ctx| find_in(ctx, name))
            .map(|(_, status)| status)
    }

    /// Status of each requested file within the request. Files that are not
    /// part of the request (or an unknown request) map to `None`.
    pub fn get_request_file_status(
        &self,
        request: &RequestRef,
        lfns: &[String],
    ) -> Result<BTreeMap<String, Option<FileStatus>>> {
        let found = self
            .storage
            .with_read("get_request_file_status", |ctx| ctx.file_statuses(request, lfns))?;
        Ok(file_status_map(lfns, found))
    }

    pub fn get_request_info(&self, request: &RequestRef) -> Result<RequestInfo> {
        self.storage
            .with_read("get_request_info", |ctx| ctx.request_info(request))?
            .ok_or_else(|| Error::NotFound(format!("request {request}")))
    }

    pub fn get_request_name(&self, id: RequestId) -> Result<String> {
        self.storage
            .with_read("get_request_name", |ctx| ctx.request_name(id))?
            .ok_or_else(|| Error::NotFound(format!("no request found for RequestID={id}")))
    }

    /// Names of requests in the filter's statuses, least recently updated
    /// first.
    pub fn get_request_names(&self, filter: &NamesFilter) -> Result<Vec<String>> {
        self.storage
            .with_read("get_request_names", |ctx| ctx.request_names(filter))
    }

    pub fn get_request_names_for_jobs(&self, jobs: &[i64]) -> Result<JobLookup<String>> {
        validate_jobs(jobs)?;
        let rows = self
            .storage
            .with_read("get_request_names_for_jobs", |ctx| ctx.requests_for_jobs(jobs))?;
        let found = rows.into_iter().map(|(job, _, name)| (job, name)).collect();
        Ok(JobLookup::partition(jobs, found))
    }

    pub fn read_requests_for_jobs(&self, jobs: &[i64]) -> Result<JobLookup<Request>> {
        validate_jobs(jobs)?;
        let found = self.storage.with_read("read_requests_for_jobs", |ctx| {
            ctx.requests_for_jobs(jobs)?
                .into_iter()
                .map(|(job, id, _)| Ok::<_, Error>((job, ctx.load_request(id)?)))
                .collect::<Result<BTreeMap<_, _>>>()
        })?;
        Ok(JobLookup::partition(jobs, found))
    }

    pub fn get_db_summary(&self) -> Result<QueueSummary> {
        self.storage.with_read("get_db_summary", |ctx| ctx.summary())
    }

    /// Text rendering of the named request. Empty if it does not exist.
    pub fn get_digest(&self, name: &str) -> Result<String> {
        match self.peek_request(name) {
            Ok(request) => Ok(request.digest()),
            Err(Error::NotFound(_)) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction bodies
// ---------------------------------------------------------------------------

fn find_in(ctx: &TxContext, name: &str) -> Result<(RequestId, RequestStatus)> {
    ctx.find_request(name)?
        .ok_or_else(|| Error::NotFound(format!("request '{name}'")))
}

fn put_in(
    ctx: &TxContext,
    request: &mut Request,
) -> Result<(RequestId, PutOutcome, Option<RequestStatus>)> {
    match ctx.find_request(&request.name)? {
        Some((existing, _)) if request.request_id != Some(existing) => Err(Error::DuplicateName {
            name: request.name.clone(),
            existing,
        }),
        Some((existing, RequestStatus::Canceled)) => {
            Ok((existing, PutOutcome::Canceled, Some(RequestStatus::Canceled)))
        }
        Some((existing, status)) => {
            ctx.update_request(existing, request)?;
            Ok((existing, PutOutcome::Updated, Some(status)))
        }
        None => {
            if let Some(id) = request.request_id {
                return Err(Error::NotFound(format!(
                    "RequestID={id} is not stored under '{}'",
                    request.name
                )));
            }
            let id = ctx.insert_request(request)?;
            Ok((id, PutOutcome::Created, None))
        }
    }
}

fn claim_named_in(
    ctx: &TxContext,
    id: RequestId,
    name: &str,
    status: RequestStatus,
    now: DateTime<Utc>,
) -> Result<(Request, RequestStatus)> {
    if status == RequestStatus::Assigned || !ctx.claim_unassigned(id, now)? {
        return Err(Error::AlreadyAssigned(name.to_string()));
    }
    Ok((ctx.load_request(id)?, status))
}

fn candidates_in(ctx: &TxContext, oldest: usize, newest: usize) -> Result<Vec<RequestId>> {
    Ok(claim_candidates(
        ctx.waiting_window(true, oldest)?,
        ctx.waiting_window(false, newest)?,
    ))
}

// ---------------------------------------------------------------------------
// Helpers shared with the Postgres backend
// ---------------------------------------------------------------------------

/// Union of the two windows without duplicates, in random order. Trying the
/// candidates in this order is a uniform pick that falls through to the next
/// one when a concurrent claim wins first.
pub(crate) fn claim_candidates(oldest: Vec<RequestId>, newest: Vec<RequestId>) -> Vec<RequestId> {
    let mut seen = HashSet::new();
    let mut pool: Vec<RequestId> = oldest
        .into_iter()
        .chain(newest)
        .filter(|id| seen.insert(*id))
        .collect();
    pool.shuffle(&mut rand::rng());
    pool
}

/// Report a finished put and, unless the stored request was canceled, copy
/// the persisted tree back to the caller.
pub(crate) fn finish_put(
    monitor: &dyn QueueMonitor,
    request: &mut Request,
    staged: Request,
    result: Result<(RequestId, PutOutcome, Option<RequestStatus>)>,
) -> Result<RequestId> {
    match result {
        Ok((id, PutOutcome::Canceled, _)) => {
            monitor.request_put(PutOutcome::Canceled);
            info!(name = %request.name, %id, "request is canceled, put ignored");
            Ok(id)
        }
        Ok((id, outcome, previous)) => {
            monitor.request_put(outcome);
            if let Some(from) = previous.filter(|from| *from != staged.status) {
                monitor.status_changed(from, staged.status);
            }
            debug!(name = %staged.name, %id, outcome = outcome.as_str(), "request stored");
            *request = staged;
            Ok(id)
        }
        Err(e) => {
            monitor.request_put(match e {
                Error::DuplicateName { .. } => PutOutcome::Duplicate,
                _ => PutOutcome::Error,
            });
            Err(e)
        }
    }
}

pub(crate) fn report_claims(
    monitor: &dyn QueueMonitor,
    mode: &'static str,
    requests: &[(RequestStatus, &Request)],
) {
    monitor.requests_claimed(mode, requests.len());
    for (from, request) in requests {
        monitor.status_changed(*from, RequestStatus::Assigned);
        debug!(mode, name = %request.name, id = ?request.request_id, "request claimed");
    }
}

pub(crate) fn file_status_map(
    lfns: &[String],
    found: Vec<(String, FileStatus)>,
) -> BTreeMap<String, Option<FileStatus>> {
    let mut statuses: BTreeMap<String, Option<FileStatus>> =
        lfns.iter().map(|lfn| (lfn.clone(), None)).collect();
    for (lfn, status) in found {
        statuses.insert(lfn, Some(status));
    }
    statuses
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidArgument("request name must not be empty".into()));
    }
    Ok(())
}

pub(crate) fn validate_bulk(n: usize) -> Result<()> {
    if n == 0 {
        return Err(Error::InvalidArgument("bulk size must be at least 1".into()));
    }
    Ok(())
}

pub(crate) fn validate_jobs(jobs: &[i64]) -> Result<()> {
    if jobs.is_empty() {
        return Err(Error::InvalidArgument("no job ids given".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_are_deduplicated() {
        let oldest = vec![RequestId(1), RequestId(2), RequestId(3)];
        let newest = vec![RequestId(3), RequestId(4)];
        let mut pool = claim_candidates(oldest, newest);
        pool.sort();
        assert_eq!(pool, vec![RequestId(1), RequestId(2), RequestId(3), RequestId(4)]);
    }

    #[test]
    fn unknown_files_default_to_none() {
        let lfns = vec!["/a".to_string(), "/b".to_string()];
        let map = file_status_map(&lfns, vec![("/a".to_string(), FileStatus::Done)]);
        assert_eq!(map["/a"], Some(FileStatus::Done));
        assert_eq!(map["/b"], None);
    }

    #[test]
    fn put_rejects_blank_name() {
        let mut engine = Engine::in_memory().unwrap();
        let mut request = Request::new("  ");
        match engine.put_request(&mut request) {
            Err(Error::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
    }
}
