//! SQLite storage layer.
//!
//! Single source of truth for requests, operations and files when running
//! on the embedded backend. WAL mode for concurrent readers, a busy timeout
//! so competing writers wait instead of failing. All access goes through
//! the engine, one transaction per call.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::*;

/// Storage backend. Owns the SQLite connection.
pub struct Storage {
    conn: Connection,
}

/// Handle for performing storage operations within a transaction.
///
/// Everything done through one context commits together or not at all.
pub(crate) struct TxContext<'a> {
    tx: &'a Connection,
}

impl TxContext<'_> {
    pub fn find_request(&self, name: &str) -> Result<Option<(RequestId, RequestStatus)>> {
        find_request_on(self.tx, name)
    }

    pub fn insert_request(&self, request: &mut Request) -> Result<RequestId> {
        insert_request_on(self.tx, request)
    }

    pub fn update_request(&self, id: RequestId, request: &mut Request) -> Result<()> {
        update_request_on(self.tx, id, request)
    }

    pub fn load_request(&self, id: RequestId) -> Result<Request> {
        load_request_on(self.tx, id)
    }

    pub fn waiting_window(&self, oldest_first: bool, limit: usize) -> Result<Vec<RequestId>> {
        waiting_window_on(self.tx, oldest_first, limit)
    }

    pub fn claim_waiting(&self, id: RequestId, now: DateTime<Utc>) -> Result<bool> {
        claim_on(self.tx, id, "Status = 'Waiting'", now)
    }

    pub fn claim_unassigned(&self, id: RequestId, now: DateTime<Utc>) -> Result<bool> {
        claim_on(self.tx, id, "Status <> 'Assigned'", now)
    }

    pub fn claim_waiting_batch(
        &self,
        ids: &[RequestId],
        now: DateTime<Utc>,
    ) -> Result<Vec<RequestId>> {
        claim_waiting_batch_on(self.tx, ids, now)
    }

    pub fn set_status(&self, name: &str, status: RequestStatus, now: DateTime<Utc>) -> Result<usize> {
        set_status_on(self.tx, name, status, now)
    }

    pub fn delete_request(&self, id: RequestId) -> Result<()> {
        delete_request_on(self.tx, id)
    }

    pub fn request_name(&self, id: RequestId) -> Result<Option<String>> {
        request_name_on(self.tx, id)
    }

    pub fn scheduled_request(&self, operation_id: OperationId) -> Result<Option<RequestId>> {
        scheduled_request_on(self.tx, operation_id)
    }

    pub fn request_names(&self, filter: &NamesFilter) -> Result<Vec<String>> {
        request_names_on(self.tx, filter)
    }

    pub fn file_statuses(
        &self,
        request: &RequestRef,
        lfns: &[String],
    ) -> Result<Vec<(String, FileStatus)>> {
        file_statuses_on(self.tx, request, lfns)
    }

    pub fn request_info(&self, request: &RequestRef) -> Result<Option<RequestInfo>> {
        request_info_on(self.tx, request)
    }

    pub fn requests_for_jobs(&self, jobs: &[i64]) -> Result<Vec<(i64, RequestId, String)>> {
        requests_for_jobs_on(self.tx, jobs)
    }

    pub fn summary(&self) -> Result<QueueSummary> {
        summary_on(self.tx)
    }
}

impl Storage {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut storage = Self { conn };
        storage.init(busy_timeout)?;
        Ok(storage)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut storage = Self { conn };
        storage.init(Duration::from_secs(5))?;
        Ok(storage)
    }

    fn init(&mut self, busy_timeout: Duration) -> Result<()> {
        self.conn.busy_timeout(busy_timeout)?;
        // WAL mode for concurrent readers
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS Request (
                RequestID       INTEGER PRIMARY KEY AUTOINCREMENT,
                RequestName     TEXT NOT NULL UNIQUE,
                Status          TEXT NOT NULL DEFAULT 'Waiting'
                                CHECK (Status IN ('Waiting', 'Assigned', 'Done', 'Failed', 'Canceled', 'Scheduled')),
                JobID           INTEGER,
                OwnerDN         TEXT,
                OwnerGroup      TEXT,
                DIRACSetup      TEXT,
                SourceComponent BLOB,
                CreationTime    TEXT NOT NULL,
                SubmitTime      TEXT NOT NULL,
                LastUpdate      TEXT NOT NULL,
                Error           TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_request_status ON Request(Status, LastUpdate);
            CREATE INDEX IF NOT EXISTS idx_request_job ON Request(JobID)
                WHERE JobID IS NOT NULL;

            CREATE TABLE IF NOT EXISTS Operation (
                OperationID     INTEGER PRIMARY KEY AUTOINCREMENT,
                RequestID       INTEGER NOT NULL REFERENCES Request(RequestID) ON DELETE CASCADE,
                Type            TEXT NOT NULL,
                \"Order\"         INTEGER NOT NULL,
                Status          TEXT NOT NULL DEFAULT 'Queued'
                                CHECK (Status IN ('Waiting', 'Assigned', 'Queued', 'Done', 'Failed', 'Canceled', 'Scheduled')),
                TargetSE        TEXT,
                SourceSE        TEXT,
                Catalog         TEXT,
                Arguments       BLOB,
                CreationTime    TEXT NOT NULL,
                SubmitTime      TEXT NOT NULL,
                LastUpdate      TEXT NOT NULL,
                Error           TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_operation_request ON Operation(RequestID, \"Order\");

            CREATE TABLE IF NOT EXISTS File (
                FileID          INTEGER PRIMARY KEY AUTOINCREMENT,
                OperationID     INTEGER NOT NULL REFERENCES Operation(OperationID) ON DELETE CASCADE,
                LFN             TEXT,
                PFN             TEXT,
                ChecksumType    TEXT NOT NULL DEFAULT ''
                                CHECK (ChecksumType IN ('ADLER32', 'MD5', 'SHA1', '')),
                Checksum        TEXT,
                GUID            TEXT,
                Size            INTEGER NOT NULL DEFAULT 0,
                Status          TEXT NOT NULL DEFAULT 'Waiting'
                                CHECK (Status IN ('Waiting', 'Done', 'Failed', 'Scheduled')),
                Attempt         INTEGER NOT NULL DEFAULT 0,
                Error           TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_file_lfn ON File(LFN);
            CREATE INDEX IF NOT EXISTS idx_file_operation ON File(OperationID);
            ",
        )?;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Execute a closure within a write transaction.
    ///
    /// The write lock is taken up front (BEGIN IMMEDIATE) so a read inside
    /// the closure can never be invalidated by another writer before the
    /// closure's own write. Commits if the closure returns Ok; on Err the
    /// transaction is dropped, which rolls it back.
    pub(crate) fn with_transaction<F, T>(&mut self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut TxContext) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut ctx = TxContext { tx: &tx };
        match f(&mut ctx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                e.trace_rollback(op);
                Err(e)
            }
        }
    }

    /// Execute a read-only closure within a deferred transaction, so every
    /// query it makes sees the same snapshot.
    pub(crate) fn with_read<F, T>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&TxContext) -> Result<T>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let ctx = TxContext { tx: &tx };
        match f(&ctx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                e.trace_rollback(op);
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Inner functions accept &Connection so they work with both
// Connection (auto-commit) and Transaction (deref to Connection).
// ---------------------------------------------------------------------------

fn find_request_on(conn: &Connection, name: &str) -> Result<Option<(RequestId, RequestStatus)>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT RequestID, Status FROM Request WHERE RequestName = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    row.map(|(id, status)| Ok::<_, Error>((RequestId(id), status.parse::<RequestStatus>()?)))
        .transpose()
}

fn insert_request_on(conn: &Connection, request: &mut Request) -> Result<RequestId> {
    conn.execute(
        "INSERT INTO Request (
            RequestName, Status, JobID, OwnerDN, OwnerGroup, DIRACSetup,
            SourceComponent, CreationTime, SubmitTime, LastUpdate, Error
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            request.name,
            request.status.as_str(),
            request.job_id,
            request.owner_dn,
            request.owner_group,
            request.setup,
            request.source_component,
            ts(request.creation_time),
            ts(request.submit_time),
            ts(request.last_update),
            request.error,
        ],
    )?;
    let id = RequestId(conn.last_insert_rowid());
    request.request_id = Some(id);
    save_operations_on(conn, id, &mut request.operations)?;
    Ok(id)
}

fn update_request_on(conn: &Connection, id: RequestId, request: &mut Request) -> Result<()> {
    conn.execute(
        "UPDATE Request SET
            Status = ?1, JobID = ?2, OwnerDN = ?3, OwnerGroup = ?4, DIRACSetup = ?5,
            SourceComponent = ?6, SubmitTime = ?7, LastUpdate = ?8, Error = ?9
         WHERE RequestID = ?10",
        params![
            request.status.as_str(),
            request.job_id,
            request.owner_dn,
            request.owner_group,
            request.setup,
            request.source_component,
            ts(request.submit_time),
            ts(request.last_update),
            request.error,
            id.0,
        ],
    )?;
    save_operations_on(conn, id, &mut request.operations)
}

/// Bring the stored operations of a request in line with `operations`:
/// update the ones carrying an id, insert the rest, delete stored ones that
/// are no longer present. `Order` is written on insert only.
fn save_operations_on(
    conn: &Connection,
    request_id: RequestId,
    operations: &mut [Operation],
) -> Result<()> {
    let kept: HashSet<i64> = operations
        .iter()
        .filter_map(|op| op.operation_id.map(|id| id.0))
        .collect();
    let stored = ids_on(
        conn,
        "SELECT OperationID FROM Operation WHERE RequestID = ?1",
        request_id.0,
    )?;
    for orphan in stored.into_iter().filter(|id| !kept.contains(id)) {
        conn.execute("DELETE FROM File WHERE OperationID = ?1", params![orphan])?;
        conn.execute("DELETE FROM Operation WHERE OperationID = ?1", params![orphan])?;
    }

    for op in operations.iter_mut() {
        op.request_id = Some(request_id);
        let op_id = match op.operation_id {
            Some(op_id) => {
                let updated = conn.execute(
                    "UPDATE Operation SET
                        Type = ?1, Status = ?2, TargetSE = ?3, SourceSE = ?4, Catalog = ?5,
                        Arguments = ?6, SubmitTime = ?7, LastUpdate = ?8, Error = ?9
                     WHERE OperationID = ?10 AND RequestID = ?11",
                    params![
                        op.op_type,
                        op.status.as_str(),
                        op.target_se,
                        op.source_se,
                        op.catalog,
                        op.arguments,
                        ts(op.submit_time),
                        ts(op.last_update),
                        op.error,
                        op_id.0,
                        request_id.0,
                    ],
                )?;
                if updated == 0 {
                    return Err(Error::NotFound(format!(
                        "operation {op_id} in request {request_id}"
                    )));
                }
                op_id
            }
            None => {
                conn.execute(
                    "INSERT INTO Operation (
                        RequestID, Type, \"Order\", Status, TargetSE, SourceSE, Catalog,
                        Arguments, CreationTime, SubmitTime, LastUpdate, Error
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        request_id.0,
                        op.op_type,
                        op.order,
                        op.status.as_str(),
                        op.target_se,
                        op.source_se,
                        op.catalog,
                        op.arguments,
                        ts(op.creation_time),
                        ts(op.submit_time),
                        ts(op.last_update),
                        op.error,
                    ],
                )?;
                let op_id = OperationId(conn.last_insert_rowid());
                op.operation_id = Some(op_id);
                op_id
            }
        };
        save_files_on(conn, op_id, &mut op.files)?;
    }
    Ok(())
}

fn save_files_on(conn: &Connection, operation_id: OperationId, files: &mut [File]) -> Result<()> {
    let kept: HashSet<i64> = files
        .iter()
        .filter_map(|file| file.file_id.map(|id| id.0))
        .collect();
    let stored = ids_on(
        conn,
        "SELECT FileID FROM File WHERE OperationID = ?1",
        operation_id.0,
    )?;
    for orphan in stored.into_iter().filter(|id| !kept.contains(id)) {
        conn.execute("DELETE FROM File WHERE FileID = ?1", params![orphan])?;
    }

    for file in files.iter_mut() {
        file.operation_id = Some(operation_id);
        let size = i64::try_from(file.size)
            .map_err(|_| Error::InvalidArgument(format!("file size {} out of range", file.size)))?;
        match file.file_id {
            Some(file_id) => {
                let updated = conn.execute(
                    "UPDATE File SET
                        LFN = ?1, PFN = ?2, ChecksumType = ?3, Checksum = ?4, GUID = ?5,
                        Size = ?6, Status = ?7, Attempt = ?8, Error = ?9
                     WHERE FileID = ?10 AND OperationID = ?11",
                    params![
                        file.lfn,
                        file.pfn,
                        file.checksum_type.as_str(),
                        file.checksum,
                        file.guid,
                        size,
                        file.status.as_str(),
                        file.attempt,
                        file.error,
                        file_id.0,
                        operation_id.0,
                    ],
                )?;
                if updated == 0 {
                    return Err(Error::NotFound(format!(
                        "file {file_id} in operation {operation_id}"
                    )));
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO File (
                        OperationID, LFN, PFN, ChecksumType, Checksum, GUID, Size,
                        Status, Attempt, Error
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        operation_id.0,
                        file.lfn,
                        file.pfn,
                        file.checksum_type.as_str(),
                        file.checksum,
                        file.guid,
                        size,
                        file.status.as_str(),
                        file.attempt,
                        file.error,
                    ],
                )?;
                file.file_id = Some(FileId(conn.last_insert_rowid()));
            }
        }
    }
    Ok(())
}

fn ids_on(conn: &Connection, sql: &str, key: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params![key], |row| row.get(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;
    Ok(ids)
}

/// Load a request with all its operations and files.
fn load_request_on(conn: &Connection, id: RequestId) -> Result<Request> {
    let row = conn
        .query_row(
            &format!("SELECT {REQUEST_COLUMNS} FROM Request WHERE RequestID = ?1"),
            params![id.0],
            RequestRow::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("RequestID={id}")))?;
    let mut request = row.try_into_request()?;

    let mut stmt = conn.prepare(
        "SELECT OperationID, RequestID, Type, \"Order\", Status, TargetSE, SourceSE, Catalog,
                Arguments, CreationTime, SubmitTime, LastUpdate, Error
         FROM Operation WHERE RequestID = ?1 ORDER BY \"Order\" ASC, OperationID ASC",
    )?;
    let op_rows = stmt
        .query_map(params![id.0], OperationRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut file_stmt = conn.prepare(
        "SELECT FileID, OperationID, LFN, PFN, ChecksumType, Checksum, GUID, Size,
                Status, Attempt, Error
         FROM File WHERE OperationID = ?1 ORDER BY FileID ASC",
    )?;
    for op_row in op_rows {
        let mut op = op_row.try_into_operation()?;
        if let Some(op_id) = op.operation_id {
            let file_rows = file_stmt
                .query_map(params![op_id.0], FileRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            op.files = file_rows
                .into_iter()
                .map(FileRow::try_into_file)
                .collect::<Result<_>>()?;
        }
        request.operations.push(op);
    }

    Ok(request)
}

fn waiting_window_on(conn: &Connection, oldest_first: bool, limit: usize) -> Result<Vec<RequestId>> {
    let direction = if oldest_first { "ASC" } else { "DESC" };
    let mut stmt = conn.prepare(&format!(
        "SELECT RequestID FROM Request WHERE Status = 'Waiting'
         ORDER BY LastUpdate {direction}, RequestID {direction} LIMIT ?1"
    ))?;
    let ids = stmt
        .query_map(params![limit as i64], |row| row.get(0).map(RequestId))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Conditional claim: flips the row to Assigned only if `condition` still
/// holds. Returns whether this call won the row.
fn claim_on(conn: &Connection, id: RequestId, condition: &str, now: DateTime<Utc>) -> Result<bool> {
    let updated = conn.execute(
        &format!(
            "UPDATE Request SET Status = 'Assigned', LastUpdate = ?1
             WHERE RequestID = ?2 AND {condition}"
        ),
        params![ts(now), id.0],
    )?;
    Ok(updated == 1)
}

fn claim_waiting_batch_on(
    conn: &Connection,
    ids: &[RequestId],
    now: DateTime<Utc>,
) -> Result<Vec<RequestId>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "UPDATE Request SET Status = 'Assigned', LastUpdate = ?
         WHERE Status = 'Waiting' AND RequestID IN ({})
         RETURNING RequestID",
        placeholders(ids.len())
    );
    let mut values: Vec<Value> = Vec::with_capacity(ids.len() + 1);
    values.push(ts(now).into());
    values.extend(ids.iter().map(|id| Value::from(id.0)));

    let mut stmt = conn.prepare(&sql)?;
    let claimed = stmt
        .query_map(params_from_iter(values), |row| row.get(0).map(RequestId))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(claimed)
}

fn set_status_on(
    conn: &Connection,
    name: &str,
    status: RequestStatus,
    now: DateTime<Utc>,
) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE Request SET Status = ?1, LastUpdate = ?2 WHERE RequestName = ?3",
        params![status.as_str(), ts(now), name],
    )?)
}

/// Explicit cascade: files, then operations, then the request.
fn delete_request_on(conn: &Connection, id: RequestId) -> Result<()> {
    conn.execute(
        "DELETE FROM File WHERE OperationID IN
            (SELECT OperationID FROM Operation WHERE RequestID = ?1)",
        params![id.0],
    )?;
    conn.execute("DELETE FROM Operation WHERE RequestID = ?1", params![id.0])?;
    conn.execute("DELETE FROM Request WHERE RequestID = ?1", params![id.0])?;
    Ok(())
}

fn request_name_on(conn: &Connection, id: RequestId) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT RequestName FROM Request WHERE RequestID = ?1",
            params![id.0],
            |row| row.get(0),
        )
        .optional()?)
}

fn scheduled_request_on(conn: &Connection, operation_id: OperationId) -> Result<Option<RequestId>> {
    Ok(conn
        .query_row(
            "SELECT RequestID FROM Operation WHERE OperationID = ?1",
            params![operation_id.0],
            |row| row.get(0).map(RequestId),
        )
        .optional()?)
}

fn request_names_on(conn: &Connection, filter: &NamesFilter) -> Result<Vec<String>> {
    let statuses = filter.statuses();
    let mut sql = format!(
        "SELECT RequestName FROM Request WHERE Status IN ({})",
        placeholders(statuses.len())
    );
    let mut values: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
    if let Some(since) = filter.since {
        sql.push_str(" AND LastUpdate > ?");
        values.push(ts(since));
    }
    if let Some(until) = filter.until {
        sql.push_str(" AND LastUpdate < ?");
        values.push(ts(until));
    }
    sql.push_str(&format!(
        " ORDER BY LastUpdate ASC, RequestID ASC LIMIT {}",
        filter.limit()
    ));

    let mut stmt = conn.prepare(&sql)?;
    let names = stmt
        .query_map(params_from_iter(values), |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(names)
}

fn file_statuses_on(
    conn: &Connection,
    request: &RequestRef,
    lfns: &[String],
) -> Result<Vec<(String, FileStatus)>> {
    if lfns.is_empty() {
        return Ok(Vec::new());
    }
    let (column, key) = match request {
        RequestRef::Name(name) => ("r.RequestName", Value::Text(name.clone())),
        RequestRef::Id(id) => ("r.RequestID", Value::Integer(id.0)),
    };
    let sql = format!(
        "SELECT f.LFN, f.Status FROM File f
         JOIN Operation o ON f.OperationID = o.OperationID
         JOIN Request r ON o.RequestID = r.RequestID
         WHERE {column} = ? AND f.LFN IN ({})
         ORDER BY o.\"Order\" ASC, f.FileID ASC",
        placeholders(lfns.len())
    );
    let values = std::iter::once(key).chain(lfns.iter().cloned().map(Value::Text));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(lfn, status)| Ok::<_, Error>((lfn, status.parse::<FileStatus>()?)))
        .collect()
}

fn request_info_on(conn: &Connection, request: &RequestRef) -> Result<Option<RequestInfo>> {
    let row = match request {
        RequestRef::Name(name) => conn
            .query_row(
                &format!("SELECT {REQUEST_COLUMNS} FROM Request WHERE RequestName = ?1"),
                params![name],
                RequestRow::from_row,
            )
            .optional()?,
        RequestRef::Id(id) => conn
            .query_row(
                &format!("SELECT {REQUEST_COLUMNS} FROM Request WHERE RequestID = ?1"),
                params![id.0],
                RequestRow::from_row,
            )
            .optional()?,
    };
    row.map(RequestRow::try_into_info).transpose()
}

fn requests_for_jobs_on(conn: &Connection, jobs: &[i64]) -> Result<Vec<(i64, RequestId, String)>> {
    if jobs.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT JobID, RequestID, RequestName FROM Request
         WHERE JobID IN ({}) ORDER BY RequestID ASC",
        placeholders(jobs.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(jobs.iter()), |row| {
            Ok((row.get(0)?, RequestId(row.get(1)?), row.get(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn summary_on(conn: &Connection) -> Result<QueueSummary> {
    let mut summary = QueueSummary::default();

    let mut stmt = conn.prepare("SELECT Status, COUNT(*) FROM Request GROUP BY Status")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (status, count) in rows {
        summary.request.insert(status.parse()?, count as u64);
    }

    let mut stmt =
        conn.prepare("SELECT Type, Status, COUNT(*) FROM Operation GROUP BY Type, Status")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (op_type, status, count) in rows {
        summary
            .operation
            .entry(op_type)
            .or_insert_with(BTreeMap::new)
            .insert(status.parse()?, count as u64);
    }

    let mut stmt = conn.prepare("SELECT Status, COUNT(*) FROM File GROUP BY Status")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (status, count) in rows {
        summary.file.insert(status.parse()?, count as u64);
    }

    Ok(summary)
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

const REQUEST_COLUMNS: &str = "RequestID, RequestName, Status, JobID, OwnerDN, OwnerGroup, \
     DIRACSetup, SourceComponent, CreationTime, SubmitTime, LastUpdate, Error";

/// Raw request columns; statuses and timestamps still as text.
struct RequestRow {
    id: i64,
    name: String,
    status: String,
    job_id: Option<i64>,
    owner_dn: Option<String>,
    owner_group: Option<String>,
    setup: Option<String>,
    source_component: Option<String>,
    creation_time: String,
    submit_time: String,
    last_update: String,
    error: Option<String>,
}

impl RequestRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            status: row.get(2)?,
            job_id: row.get(3)?,
            owner_dn: row.get(4)?,
            owner_group: row.get(5)?,
            setup: row.get(6)?,
            source_component: row.get(7)?,
            creation_time: row.get(8)?,
            submit_time: row.get(9)?,
            last_update: row.get(10)?,
            error: row.get(11)?,
        })
    }

    fn try_into_request(self) -> Result<Request> {
        Ok(Request {
            request_id: Some(RequestId(self.id)),
            name: self.name,
            status: self.status.parse()?,
            owner_dn: self.owner_dn,
            owner_group: self.owner_group,
            job_id: self.job_id,
            setup: self.setup,
            source_component: self.source_component,
            error: self.error,
            creation_time: parse_ts(&self.creation_time)?,
            submit_time: parse_ts(&self.submit_time)?,
            last_update: parse_ts(&self.last_update)?,
            operations: Vec::new(),
        })
    }

    fn try_into_info(self) -> Result<RequestInfo> {
        Ok(RequestInfo {
            request_id: RequestId(self.id),
            status: self.status.parse()?,
            name: self.name,
            job_id: self.job_id,
            owner_dn: self.owner_dn,
            owner_group: self.owner_group,
            setup: self.setup,
            source_component: self.source_component,
            creation_time: parse_ts(&self.creation_time)?,
            submit_time: parse_ts(&self.submit_time)?,
            last_update: parse_ts(&self.last_update)?,
        })
    }
}

struct OperationRow {
    id: i64,
    request_id: i64,
    op_type: String,
    order: i32,
    status: String,
    target_se: Option<String>,
    source_se: Option<String>,
    catalog: Option<String>,
    arguments: Option<String>,
    creation_time: String,
    submit_time: String,
    last_update: String,
    error: Option<String>,
}

impl OperationRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            request_id: row.get(1)?,
            op_type: row.get(2)?,
            order: row.get(3)?,
            status: row.get(4)?,
            target_se: row.get(5)?,
            source_se: row.get(6)?,
            catalog: row.get(7)?,
            arguments: row.get(8)?,
            creation_time: row.get(9)?,
            submit_time: row.get(10)?,
            last_update: row.get(11)?,
            error: row.get(12)?,
        })
    }

    fn try_into_operation(self) -> Result<Operation> {
        Ok(Operation {
            operation_id: Some(OperationId(self.id)),
            request_id: Some(RequestId(self.request_id)),
            op_type: self.op_type,
            order: self.order,
            status: self.status.parse()?,
            target_se: self.target_se,
            source_se: self.source_se,
            catalog: self.catalog,
            arguments: self.arguments,
            error: self.error,
            creation_time: parse_ts(&self.creation_time)?,
            submit_time: parse_ts(&self.submit_time)?,
            last_update: parse_ts(&self.last_update)?,
            files: Vec::new(),
        })
    }
}

struct FileRow {
    id: i64,
    operation_id: i64,
    lfn: Option<String>,
    pfn: Option<String>,
    checksum_type: String,
    checksum: Option<String>,
    guid: Option<String>,
    size: i64,
    status: String,
    attempt: u32,
    error: Option<String>,
}

impl FileRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            operation_id: row.get(1)?,
            lfn: row.get(2)?,
            pfn: row.get(3)?,
            checksum_type: row.get(4)?,
            checksum: row.get(5)?,
            guid: row.get(6)?,
            size: row.get(7)?,
            status: row.get(8)?,
            attempt: row.get(9)?,
            error: row.get(10)?,
        })
    }

    fn try_into_file(self) -> Result<File> {
        Ok(File {
            file_id: Some(FileId(self.id)),
            operation_id: Some(OperationId(self.operation_id)),
            lfn: self.lfn.unwrap_or_default(),
            pfn: self.pfn,
            checksum_type: self.checksum_type.parse()?,
            checksum: self.checksum,
            guid: self.guid,
            size: u64::try_from(self.size).unwrap_or(0),
            status: self.status.parse()?,
            attempt: self.attempt,
            error: self.error,
        })
    }
}

/// Fixed-width UTC timestamps, so text order is time order.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("invalid timestamp {raw:?}: {e}")))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (Storage, RequestId) {
        let mut storage = Storage::in_memory().unwrap();
        let mut request = Request::new("seed").with_operation(
            Operation::new("ReplicateAndRegister")
                .with_file(File::new("/lfn/1"))
                .with_file(File::new("/lfn/2")),
        );
        let id = storage
            .with_transaction("test", |ctx| ctx.insert_request(&mut request))
            .unwrap();
        (storage, id)
    }

    fn count(storage: &Storage, table: &str) -> i64 {
        storage
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn insert_assigns_ids_through_the_tree() {
        let (storage, id) = seeded();
        let loaded = storage.with_read("test", |ctx| ctx.load_request(id)).unwrap();
        assert_eq!(loaded.request_id, Some(id));
        let op = &loaded.operations[0];
        assert!(op.operation_id.is_some());
        assert_eq!(op.request_id, Some(id));
        assert!(op.files.iter().all(|f| f.operation_id == op.operation_id));
        assert_eq!(op.files.len(), 2);
    }

    #[test]
    fn delete_removes_children_first() {
        let (mut storage, id) = seeded();
        storage
            .with_transaction("test", |ctx| ctx.delete_request(id))
            .unwrap();
        assert_eq!(count(&storage, "Request"), 0);
        assert_eq!(count(&storage, "Operation"), 0);
        assert_eq!(count(&storage, "File"), 0);
    }

    #[test]
    fn failed_closure_rolls_back() {
        let (mut storage, id) = seeded();
        let result: Result<()> = storage.with_transaction("test", |ctx| {
            ctx.delete_request(id)?;
            Err(Error::Other("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(count(&storage, "Request"), 1);
        assert_eq!(count(&storage, "File"), 2);
    }

    #[test]
    fn update_never_rewrites_order() {
        let (mut storage, id) = seeded();
        let mut loaded = storage.with_read("test", |ctx| ctx.load_request(id)).unwrap();
        loaded.operations[0].order = 7;
        storage
            .with_transaction("test", |ctx| ctx.update_request(id, &mut loaded))
            .unwrap();
        let reloaded = storage.with_read("test", |ctx| ctx.load_request(id)).unwrap();
        assert_eq!(reloaded.operations[0].order, 0);
    }

    #[test]
    fn conditional_claim_only_wins_once() {
        let (mut storage, id) = seeded();
        let now = Utc::now();
        let first = storage
            .with_transaction("test", |ctx| ctx.claim_waiting(id, now))
            .unwrap();
        let second = storage
            .with_transaction("test", |ctx| ctx.claim_waiting(id, now))
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn timestamps_sort_as_text() {
        let early = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = early + chrono::Duration::microseconds(1);
        assert!(ts(early) < ts(late));
        assert_eq!(parse_ts(&ts(late)).unwrap(), late);
    }
}
