//! Request queue operations on Postgres.
//!
//! Same contracts as the embedded engine. Each public method runs in one
//! `pool.begin()` transaction; an early return drops it, which rolls back.
//! Reads that load a whole tree run in a REPEATABLE READ snapshot, since the
//! request, operation and file SELECTs must agree with each other.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Postgres, Transaction};
use std::collections::{BTreeMap, HashSet};

use crate::engine::{
    claim_candidates, file_status_map, finish_put, report_claims, validate_bulk, validate_jobs,
    validate_name,
};
use crate::error::{Error, Result};
use crate::model::*;
use crate::telemetry::PutOutcome;

impl super::Db {
    /// Read-only transaction over a single snapshot.
    async fn snapshot(&self) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Create or update a request tree, keyed by its name.
    pub async fn put_request(&self, request: &mut Request) -> Result<RequestId> {
        validate_name(&request.name)?;
        let mut staged = request.clone();
        staged.last_update = Utc::now();

        let result = async {
            let mut tx = self.pool.begin().await?;
            let outcome = put_in(&mut tx, &mut staged).await?;
            tx.commit().await?;
            Ok::<_, Error>(outcome)
        }
        .await
        .inspect_err(|e: &Error| e.trace_rollback("put_request"));

        finish_put(self.monitor.as_ref(), request, staged, result)
    }

    // -----------------------------------------------------------------------
    // Claim
    // -----------------------------------------------------------------------

    /// Claim a request by name. Fails with `AlreadyAssigned` if another
    /// worker holds it.
    pub async fn get_request(&self, name: &str) -> Result<Request> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let (request, from) = claim_by_name_in(&mut tx, name, now)
            .await
            .inspect_err(|e| e.trace_rollback("get_request"))?;
        tx.commit().await?;

        report_claims(self.monitor.as_ref(), "named", &[(from, &request)]);
        Ok(request)
    }

    pub async fn peek_request(&self, name: &str) -> Result<Request> {
        let mut tx = self.snapshot().await?;
        let (id, _) = find_in(&mut tx, name, false).await?;
        let request = load_request(&mut tx, id).await?;
        tx.commit().await?;
        Ok(request)
    }

    /// Claim one Waiting request picked at random from the oldest and
    /// newest windows.
    pub async fn claim_next(&self) -> Result<Option<Request>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let candidates = candidates_in(
            &mut tx,
            self.config.oldest_window,
            self.config.newest_window,
        )
        .await?;

        let mut claimed = None;
        for id in candidates {
            // READ COMMITTED re-checks the condition after waiting on a row
            // lock, so a lost race shows up as zero rows here.
            if claim_in(&mut tx, id, "Status = 'Waiting'", now).await? {
                claimed = Some(load_request(&mut tx, id).await?);
                break;
            }
        }
        tx.commit().await?;

        if let Some(ref request) = claimed {
            report_claims(
                self.monitor.as_ref(),
                "anonymous",
                &[(RequestStatus::Waiting, request)],
            );
        }
        Ok(claimed)
    }

    pub async fn peek_next(&self) -> Result<Option<Request>> {
        let mut tx = self.snapshot().await?;
        let candidates = candidates_in(
            &mut tx,
            self.config.oldest_window,
            self.config.newest_window,
        )
        .await?;
        let request = match candidates.first() {
            Some(id) => Some(load_request(&mut tx, *id).await?),
            None => None,
        };
        tx.commit().await?;
        Ok(request)
    }

    /// Read up to `n` Waiting requests, oldest first, optionally claiming
    /// them in one batched update.
    pub async fn get_bulk_requests(
        &self,
        n: usize,
        claim: bool,
    ) -> Result<BTreeMap<RequestId, Request>> {
        validate_bulk(n)?;
        let now = Utc::now();
        // Claimed rows stay locked until commit; a plain read needs the snapshot.
        let mut tx = if claim {
            self.pool.begin().await?
        } else {
            self.snapshot().await?
        };
        let selected = waiting_window(&mut tx, true, n).await?;
        let ids = if claim {
            claim_waiting_batch(&mut tx, &selected, now).await?
        } else {
            selected
        };
        let mut requests = BTreeMap::new();
        for id in ids {
            requests.insert(id, load_request(&mut tx, id).await?);
        }
        tx.commit().await?;

        if claim {
            let claimed: Vec<_> = requests
                .values()
                .map(|request| (RequestStatus::Waiting, request))
                .collect();
            report_claims(self.monitor.as_ref(), "bulk", &claimed);
        }
        Ok(requests)
    }

    /// Claim the request owning the given operation.
    pub async fn get_scheduled_request(&self, operation_id: OperationId) -> Result<Option<Request>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let name: Option<String> = sqlx::query_scalar(
            "SELECT r.RequestName FROM Request r
             JOIN Operation o ON o.RequestID = r.RequestID
             WHERE o.OperationID = $1",
        )
        .bind(operation_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(name) = name else {
            return Ok(None);
        };

        let (request, from) = claim_by_name_in(&mut tx, &name, now)
            .await
            .inspect_err(|e| e.trace_rollback("get_scheduled_request"))?;
        tx.commit().await?;

        report_claims(self.monitor.as_ref(), "named", &[(from, &request)]);
        Ok(Some(request))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Mark a request Canceled. Accepted from any status.
    pub async fn cancel_request(&self, name: &str) -> Result<RequestId> {
        let mut tx = self.pool.begin().await?;
        let (id, from) = find_in(&mut tx, name, true).await?;
        sqlx::query("UPDATE Request SET Status = 'Canceled', LastUpdate = $1 WHERE RequestID = $2")
            .bind(Utc::now())
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.monitor.status_changed(from, RequestStatus::Canceled);
        tracing::info!(name, %id, from = from.as_str(), "request canceled");
        Ok(id)
    }

    /// Remove a request with all its operations and files. Unknown names
    /// are ignored.
    pub async fn delete_request(&self, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let Some((id, _)) = find_optional(&mut tx, name, true).await? else {
            tracing::debug!(name, "delete of unknown request ignored");
            return Ok(());
        };

        sqlx::query(
            "DELETE FROM File WHERE OperationID IN
                (SELECT OperationID FROM Operation WHERE RequestID = $1)",
        )
        .bind(id.0)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM Operation WHERE RequestID = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM Request WHERE RequestID = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(name, %id, "request deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_request_status(&self, name: &str) -> Result<RequestStatus> {
        let mut conn = self.pool.acquire().await?;
        find_in(&mut conn, name, false)
            .await
            .map(|(_, status)| status)
    }

    pub async fn get_request_file_status(
        &self,
        request: &RequestRef,
        lfns: &[String],
    ) -> Result<BTreeMap<String, Option<FileStatus>>> {
        let (name, id) = match request {
            RequestRef::Name(name) => (Some(name.as_str()), None),
            RequestRef::Id(id) => (None, Some(id.0)),
        };
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT f.LFN, f.Status FROM File f
             JOIN Operation o ON f.OperationID = o.OperationID
             JOIN Request r ON o.RequestID = r.RequestID
             WHERE ($1::text IS NULL OR r.RequestName = $1)
               AND ($2::bigint IS NULL OR r.RequestID = $2)
               AND f.LFN = ANY($3)
             ORDER BY o.\"Order\" ASC, f.FileID ASC",
        )
        .bind(name)
        .bind(id)
        .bind(lfns)
        .fetch_all(&self.pool)
        .await?;

        let found = rows
            .into_iter()
            .map(|(lfn, status)| Ok::<_, Error>((lfn, status.parse::<FileStatus>()?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(file_status_map(lfns, found))
    }

    pub async fn get_request_info(&self, request: &RequestRef) -> Result<RequestInfo> {
        let row: Option<RequestRow> = match request {
            RequestRef::Name(name) => {
                sqlx::query_as(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM Request WHERE RequestName = $1"
                ))
                .bind(name)
                .fetch_optional(&self.pool)
                .await?
            }
            RequestRef::Id(id) => {
                sqlx::query_as(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM Request WHERE RequestID = $1"
                ))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.ok_or_else(|| Error::NotFound(format!("request {request}")))?
            .try_into_info()
    }

    pub async fn get_request_name(&self, id: RequestId) -> Result<String> {
        let name: Option<String> =
            sqlx::query_scalar("SELECT RequestName FROM Request WHERE RequestID = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        name.ok_or_else(|| Error::NotFound(format!("no request found for RequestID={id}")))
    }

    /// Names of requests in the filter's statuses, least recently updated
    /// first.
    pub async fn get_request_names(&self, filter: &NamesFilter) -> Result<Vec<String>> {
        let statuses: Vec<String> = filter
            .statuses()
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();
        let names = sqlx::query_scalar(
            "SELECT RequestName FROM Request
             WHERE Status = ANY($1)
               AND ($2::timestamptz IS NULL OR LastUpdate > $2)
               AND ($3::timestamptz IS NULL OR LastUpdate < $3)
             ORDER BY LastUpdate ASC, RequestID ASC
             LIMIT $4",
        )
        .bind(statuses)
        .bind(filter.since)
        .bind(filter.until)
        .bind(filter.limit() as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    pub async fn get_request_names_for_jobs(&self, jobs: &[i64]) -> Result<JobLookup<String>> {
        validate_jobs(jobs)?;
        let mut conn = self.pool.acquire().await?;
        let found = requests_for_jobs(&mut conn, jobs)
            .await?
            .into_iter()
            .map(|(job, _, name)| (job, name))
            .collect();
        Ok(JobLookup::partition(jobs, found))
    }

    pub async fn read_requests_for_jobs(&self, jobs: &[i64]) -> Result<JobLookup<Request>> {
        validate_jobs(jobs)?;
        let mut tx = self.snapshot().await?;
        let mut found = BTreeMap::new();
        for (job, id, _) in requests_for_jobs(&mut tx, jobs).await? {
            found.insert(job, load_request(&mut tx, id).await?);
        }
        tx.commit().await?;
        Ok(JobLookup::partition(jobs, found))
    }

    pub async fn get_db_summary(&self) -> Result<QueueSummary> {
        let mut tx = self.snapshot().await?;
        let mut summary = QueueSummary::default();

        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT Status, COUNT(*) FROM Request GROUP BY Status")
                .fetch_all(&mut *tx)
                .await?;
        for (status, count) in rows {
            summary.request.insert(status.parse()?, count as u64);
        }

        let rows: Vec<(String, String, i64)> =
            sqlx::query_as("SELECT Type, Status, COUNT(*) FROM Operation GROUP BY Type, Status")
                .fetch_all(&mut *tx)
                .await?;
        for (op_type, status, count) in rows {
            summary
                .operation
                .entry(op_type)
                .or_default()
                .insert(status.parse()?, count as u64);
        }

        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT Status, COUNT(*) FROM File GROUP BY Status")
                .fetch_all(&mut *tx)
                .await?;
        for (status, count) in rows {
            summary.file.insert(status.parse()?, count as u64);
        }

        tx.commit().await?;
        Ok(summary)
    }

    /// Text rendering of the named request. Empty if it does not exist.
    pub async fn get_digest(&self, name: &str) -> Result<String> {
        match self.peek_request(name).await {
            Ok(request) => Ok(request.digest()),
            Err(Error::NotFound(_)) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction bodies
// ---------------------------------------------------------------------------

async fn find_optional(
    conn: &mut PgConnection,
    name: &str,
    lock: bool,
) -> Result<Option<(RequestId, RequestStatus)>> {
    let sql = if lock {
        "SELECT RequestID, Status FROM Request WHERE RequestName = $1 FOR UPDATE"
    } else {
        "SELECT RequestID, Status FROM Request WHERE RequestName = $1"
    };
    let row: Option<(i64, String)> = sqlx::query_as(sql)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|(id, status)| Ok::<_, Error>((RequestId(id), status.parse::<RequestStatus>()?)))
        .transpose()
}

async fn find_in(
    conn: &mut PgConnection,
    name: &str,
    lock: bool,
) -> Result<(RequestId, RequestStatus)> {
    find_optional(conn, name, lock)
        .await?
        .ok_or_else(|| Error::NotFound(format!("request '{name}'")))
}

async fn put_in(
    conn: &mut PgConnection,
    request: &mut Request,
) -> Result<(RequestId, PutOutcome, Option<RequestStatus>)> {
    match find_optional(conn, &request.name, true).await? {
        Some((existing, _)) if request.request_id != Some(existing) => Err(Error::DuplicateName {
            name: request.name.clone(),
            existing,
        }),
        Some((existing, RequestStatus::Canceled)) => {
            Ok((existing, PutOutcome::Canceled, Some(RequestStatus::Canceled)))
        }
        Some((existing, status)) => {
            update_request(conn, existing, request).await?;
            Ok((existing, PutOutcome::Updated, Some(status)))
        }
        None => {
            if let Some(id) = request.request_id {
                return Err(Error::NotFound(format!(
                    "RequestID={id} is not stored under '{}'",
                    request.name
                )));
            }
            let id = insert_request(conn, request).await?;
            Ok((id, PutOutcome::Created, None))
        }
    }
}

async fn claim_by_name_in(
    conn: &mut PgConnection,
    name: &str,
    now: DateTime<Utc>,
) -> Result<(Request, RequestStatus)> {
    let (id, status) = find_in(conn, name, true).await?;
    if status == RequestStatus::Assigned || !claim_in(conn, id, "Status <> 'Assigned'", now).await? {
        return Err(Error::AlreadyAssigned(name.to_string()));
    }
    Ok((load_request(conn, id).await?, status))
}

async fn candidates_in(
    conn: &mut PgConnection,
    oldest: usize,
    newest: usize,
) -> Result<Vec<RequestId>> {
    let oldest = waiting_window(conn, true, oldest).await?;
    let newest = waiting_window(conn, false, newest).await?;
    Ok(claim_candidates(oldest, newest))
}

async fn waiting_window(
    conn: &mut PgConnection,
    oldest_first: bool,
    limit: usize,
) -> Result<Vec<RequestId>> {
    let direction = if oldest_first { "ASC" } else { "DESC" };
    let ids: Vec<i64> = sqlx::query_scalar(&format!(
        "SELECT RequestID FROM Request WHERE Status = 'Waiting'
         ORDER BY LastUpdate {direction}, RequestID {direction} LIMIT $1"
    ))
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids.into_iter().map(RequestId).collect())
}

async fn claim_in(
    conn: &mut PgConnection,
    id: RequestId,
    condition: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let rows_affected = sqlx::query(&format!(
        "UPDATE Request SET Status = 'Assigned', LastUpdate = $1
         WHERE RequestID = $2 AND {condition}"
    ))
    .bind(now)
    .bind(id.0)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows_affected == 1)
}

async fn claim_waiting_batch(
    conn: &mut PgConnection,
    ids: &[RequestId],
    now: DateTime<Utc>,
) -> Result<Vec<RequestId>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let raw: Vec<i64> = ids.iter().map(|id| id.0).collect();
    let claimed: Vec<i64> = sqlx::query_scalar(
        "UPDATE Request SET Status = 'Assigned', LastUpdate = $1
         WHERE Status = 'Waiting' AND RequestID = ANY($2)
         RETURNING RequestID",
    )
    .bind(now)
    .bind(raw)
    .fetch_all(&mut *conn)
    .await?;
    Ok(claimed.into_iter().map(RequestId).collect())
}

async fn requests_for_jobs(
    conn: &mut PgConnection,
    jobs: &[i64],
) -> Result<Vec<(i64, RequestId, String)>> {
    let rows: Vec<(i64, i64, String)> = sqlx::query_as(
        "SELECT JobID, RequestID, RequestName FROM Request
         WHERE JobID = ANY($1) ORDER BY RequestID ASC",
    )
    .bind(jobs)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(job, id, name)| (job, RequestId(id), name))
        .collect())
}

async fn insert_request(conn: &mut PgConnection, request: &mut Request) -> Result<RequestId> {
    let id: Option<i64> = sqlx::query_scalar(
        "INSERT INTO Request (
            RequestName, Status, JobID, OwnerDN, OwnerGroup, DIRACSetup,
            SourceComponent, CreationTime, SubmitTime, LastUpdate, Error
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (RequestName) DO NOTHING
        RETURNING RequestID",
    )
    .bind(&request.name)
    .bind(request.status.as_str())
    .bind(request.job_id)
    .bind(&request.owner_dn)
    .bind(&request.owner_group)
    .bind(&request.setup)
    .bind(&request.source_component)
    .bind(request.creation_time)
    .bind(request.submit_time)
    .bind(request.last_update)
    .bind(&request.error)
    .fetch_optional(&mut *conn)
    .await?;

    // The name was free at lookup; a concurrent put committed it since.
    let Some(id) = id else {
        let (existing, _) = find_in(conn, &request.name, false).await?;
        return Err(Error::DuplicateName {
            name: request.name.clone(),
            existing,
        });
    };

    let id = RequestId(id);
    request.request_id = Some(id);
    save_operations(conn, id, &mut request.operations).await?;
    Ok(id)
}

async fn update_request(conn: &mut PgConnection, id: RequestId, request: &mut Request) -> Result<()> {
    sqlx::query(
        "UPDATE Request SET
            Status = $1, JobID = $2, OwnerDN = $3, OwnerGroup = $4, DIRACSetup = $5,
            SourceComponent = $6, SubmitTime = $7, LastUpdate = $8, Error = $9
         WHERE RequestID = $10",
    )
    .bind(request.status.as_str())
    .bind(request.job_id)
    .bind(&request.owner_dn)
    .bind(&request.owner_group)
    .bind(&request.setup)
    .bind(&request.source_component)
    .bind(request.submit_time)
    .bind(request.last_update)
    .bind(&request.error)
    .bind(id.0)
    .execute(&mut *conn)
    .await?;
    save_operations(conn, id, &mut request.operations).await
}

/// Update operations carrying an id, insert the rest, delete stored ones no
/// longer in the tree. `Order` is written on insert only.
async fn save_operations(
    conn: &mut PgConnection,
    request_id: RequestId,
    operations: &mut [Operation],
) -> Result<()> {
    let kept: HashSet<i64> = operations
        .iter()
        .filter_map(|op| op.operation_id.map(|id| id.0))
        .collect();
    let stored: Vec<i64> =
        sqlx::query_scalar("SELECT OperationID FROM Operation WHERE RequestID = $1")
            .bind(request_id.0)
            .fetch_all(&mut *conn)
            .await?;
    let orphans: Vec<i64> = stored.into_iter().filter(|id| !kept.contains(id)).collect();
    if !orphans.is_empty() {
        sqlx::query("DELETE FROM File WHERE OperationID = ANY($1)")
            .bind(&orphans)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM Operation WHERE OperationID = ANY($1)")
            .bind(&orphans)
            .execute(&mut *conn)
            .await?;
    }

    for op in operations.iter_mut() {
        op.request_id = Some(request_id);
        let op_id = match op.operation_id {
            Some(op_id) => {
                let rows_affected = sqlx::query(
                    "UPDATE Operation SET
                        Type = $1, Status = $2, TargetSE = $3, SourceSE = $4, Catalog = $5,
                        Arguments = $6, SubmitTime = $7, LastUpdate = $8, Error = $9
                     WHERE OperationID = $10 AND RequestID = $11",
                )
                .bind(&op.op_type)
                .bind(op.status.as_str())
                .bind(&op.target_se)
                .bind(&op.source_se)
                .bind(&op.catalog)
                .bind(&op.arguments)
                .bind(op.submit_time)
                .bind(op.last_update)
                .bind(&op.error)
                .bind(op_id.0)
                .bind(request_id.0)
                .execute(&mut *conn)
                .await?
                .rows_affected();
                if rows_affected == 0 {
                    return Err(Error::NotFound(format!(
                        "operation {op_id} in request {request_id}"
                    )));
                }
                op_id
            }
            None => {
                let op_id: i64 = sqlx::query_scalar(
                    "INSERT INTO Operation (
                        RequestID, Type, \"Order\", Status, TargetSE, SourceSE, Catalog,
                        Arguments, CreationTime, SubmitTime, LastUpdate, Error
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                    RETURNING OperationID",
                )
                .bind(request_id.0)
                .bind(&op.op_type)
                .bind(op.order)
                .bind(op.status.as_str())
                .bind(&op.target_se)
                .bind(&op.source_se)
                .bind(&op.catalog)
                .bind(&op.arguments)
                .bind(op.creation_time)
                .bind(op.submit_time)
                .bind(op.last_update)
                .bind(&op.error)
                .fetch_one(&mut *conn)
                .await?;
                let op_id = OperationId(op_id);
                op.operation_id = Some(op_id);
                op_id
            }
        };
        save_files(conn, op_id, &mut op.files).await?;
    }
    Ok(())
}

async fn save_files(
    conn: &mut PgConnection,
    operation_id: OperationId,
    files: &mut [File],
) -> Result<()> {
    let kept: HashSet<i64> = files
        .iter()
        .filter_map(|file| file.file_id.map(|id| id.0))
        .collect();
    let stored: Vec<i64> = sqlx::query_scalar("SELECT FileID FROM File WHERE OperationID = $1")
        .bind(operation_id.0)
        .fetch_all(&mut *conn)
        .await?;
    let orphans: Vec<i64> = stored.into_iter().filter(|id| !kept.contains(id)).collect();
    if !orphans.is_empty() {
        sqlx::query("DELETE FROM File WHERE FileID = ANY($1)")
            .bind(&orphans)
            .execute(&mut *conn)
            .await?;
    }

    for file in files.iter_mut() {
        file.operation_id = Some(operation_id);
        let size = i64::try_from(file.size)
            .map_err(|_| Error::InvalidArgument(format!("file size {} out of range", file.size)))?;
        match file.file_id {
            Some(file_id) => {
                let rows_affected = sqlx::query(
                    "UPDATE File SET
                        LFN = $1, PFN = $2, ChecksumType = $3, Checksum = $4, GUID = $5,
                        Size = $6, Status = $7, Attempt = $8, Error = $9
                     WHERE FileID = $10 AND OperationID = $11",
                )
                .bind(&file.lfn)
                .bind(&file.pfn)
                .bind(file.checksum_type.as_str())
                .bind(&file.checksum)
                .bind(&file.guid)
                .bind(size)
                .bind(file.status.as_str())
                .bind(file.attempt as i32)
                .bind(&file.error)
                .bind(file_id.0)
                .bind(operation_id.0)
                .execute(&mut *conn)
                .await?
                .rows_affected();
                if rows_affected == 0 {
                    return Err(Error::NotFound(format!(
                        "file {file_id} in operation {operation_id}"
                    )));
                }
            }
            None => {
                let file_id: i64 = sqlx::query_scalar(
                    "INSERT INTO File (
                        OperationID, LFN, PFN, ChecksumType, Checksum, GUID, Size,
                        Status, Attempt, Error
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    RETURNING FileID",
                )
                .bind(operation_id.0)
                .bind(&file.lfn)
                .bind(&file.pfn)
                .bind(file.checksum_type.as_str())
                .bind(&file.checksum)
                .bind(&file.guid)
                .bind(size)
                .bind(file.status.as_str())
                .bind(file.attempt as i32)
                .bind(&file.error)
                .fetch_one(&mut *conn)
                .await?;
                file.file_id = Some(FileId(file_id));
            }
        }
    }
    Ok(())
}

/// Load a request with all its operations and files.
async fn load_request(conn: &mut PgConnection, id: RequestId) -> Result<Request> {
    let row: Option<RequestRow> = sqlx::query_as(&format!(
        "SELECT {REQUEST_COLUMNS} FROM Request WHERE RequestID = $1"
    ))
    .bind(id.0)
    .fetch_optional(&mut *conn)
    .await?;
    let mut request = row
        .ok_or_else(|| Error::NotFound(format!("RequestID={id}")))?
        .try_into_request()?;

    let op_rows: Vec<OperationRow> = sqlx::query_as(
        "SELECT OperationID AS operation_id, RequestID AS request_id, Type AS op_type,
                \"Order\" AS op_order, Status AS status, TargetSE AS target_se,
                SourceSE AS source_se, Catalog AS catalog, Arguments AS arguments,
                CreationTime AS creation_time, SubmitTime AS submit_time,
                LastUpdate AS last_update, Error AS error
         FROM Operation WHERE RequestID = $1
         ORDER BY \"Order\" ASC, OperationID ASC",
    )
    .bind(id.0)
    .fetch_all(&mut *conn)
    .await?;

    let file_rows: Vec<FileRow> = sqlx::query_as(
        "SELECT f.FileID AS file_id, f.OperationID AS operation_id, f.LFN AS lfn, f.PFN AS pfn,
                f.ChecksumType AS checksum_type, f.Checksum AS checksum, f.GUID AS guid,
                f.Size AS size, f.Status AS status, f.Attempt AS attempt, f.Error AS error
         FROM File f JOIN Operation o ON f.OperationID = o.OperationID
         WHERE o.RequestID = $1
         ORDER BY f.FileID ASC",
    )
    .bind(id.0)
    .fetch_all(&mut *conn)
    .await?;

    let mut files: BTreeMap<i64, Vec<File>> = BTreeMap::new();
    for row in file_rows {
        files
            .entry(row.operation_id)
            .or_default()
            .push(row.try_into_file()?);
    }
    for row in op_rows {
        let mut op = row.try_into_operation()?;
        if let Some(op_id) = op.operation_id {
            op.files = files.remove(&op_id.0).unwrap_or_default();
        }
        request.operations.push(op);
    }
    Ok(request)
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

const REQUEST_COLUMNS: &str = "RequestID AS request_id, RequestName AS request_name, \
     Status AS status, JobID AS job_id, OwnerDN AS owner_dn, OwnerGroup AS owner_group, \
     DIRACSetup AS setup, SourceComponent AS source_component, \
     CreationTime AS creation_time, SubmitTime AS submit_time, \
     LastUpdate AS last_update, Error AS error";

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct RequestRow {
    request_id: i64,
    request_name: String,
    status: String,
    job_id: Option<i64>,
    owner_dn: Option<String>,
    owner_group: Option<String>,
    setup: Option<String>,
    source_component: Option<String>,
    creation_time: DateTime<Utc>,
    submit_time: DateTime<Utc>,
    last_update: DateTime<Utc>,
    error: Option<String>,
}

impl RequestRow {
    fn try_into_request(self) -> Result<Request> {
        Ok(Request {
            request_id: Some(RequestId(self.request_id)),
            name: self.request_name,
            status: self.status.parse()?,
            owner_dn: self.owner_dn,
            owner_group: self.owner_group,
            job_id: self.job_id,
            setup: self.setup,
            source_component: self.source_component,
            error: self.error,
            creation_time: self.creation_time,
            submit_time: self.submit_time,
            last_update: self.last_update,
            operations: Vec::new(),
        })
    }

    fn try_into_info(self) -> Result<RequestInfo> {
        Ok(RequestInfo {
            request_id: RequestId(self.request_id),
            status: self.status.parse()?,
            name: self.request_name,
            job_id: self.job_id,
            owner_dn: self.owner_dn,
            owner_group: self.owner_group,
            setup: self.setup,
            source_component: self.source_component,
            creation_time: self.creation_time,
            submit_time: self.submit_time,
            last_update: self.last_update,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    operation_id: i64,
    request_id: i64,
    op_type: String,
    op_order: i32,
    status: String,
    target_se: Option<String>,
    source_se: Option<String>,
    catalog: Option<String>,
    arguments: Option<String>,
    creation_time: DateTime<Utc>,
    submit_time: DateTime<Utc>,
    last_update: DateTime<Utc>,
    error: Option<String>,
}

impl OperationRow {
    fn try_into_operation(self) -> Result<Operation> {
        Ok(Operation {
            operation_id: Some(OperationId(self.operation_id)),
            request_id: Some(RequestId(self.request_id)),
            op_type: self.op_type,
            order: self.op_order,
            status: self.status.parse()?,
            target_se: self.target_se,
            source_se: self.source_se,
            catalog: self.catalog,
            arguments: self.arguments,
            error: self.error,
            creation_time: self.creation_time,
            submit_time: self.submit_time,
            last_update: self.last_update,
            files: Vec::new(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct FileRow {
    file_id: i64,
    operation_id: i64,
    lfn: Option<String>,
    pfn: Option<String>,
    checksum_type: String,
    checksum: Option<String>,
    guid: Option<String>,
    size: i64,
    status: String,
    attempt: i32,
    error: Option<String>,
}

impl FileRow {
    fn try_into_file(self) -> Result<File> {
        Ok(File {
            file_id: Some(FileId(self.file_id)),
            operation_id: Some(OperationId(self.operation_id)),
            lfn: self.lfn.unwrap_or_default(),
            pfn: self.pfn,
            checksum_type: self.checksum_type.parse()?,
            checksum: self.checksum,
            guid: self.guid,
            size: u64::try_from(self.size).unwrap_or(0),
            status: self.status.parse()?,
            attempt: u32::try_from(self.attempt).unwrap_or(0),
            error: self.error,
        })
    }
}
