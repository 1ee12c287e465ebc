//! Backend-neutral async queue interface.
//!
//! The agent and the CLI talk to a [`RequestQueue`]; which store sits behind
//! it is decided once, from the configured database URL.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::config::{Config, StoreLocation};
use crate::db::Db;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::model::*;
use crate::telemetry::QueueMonitor;

/// The full queue surface. Every call is one transaction on the store.
#[async_trait]
pub trait RequestQueue: Send + Sync {
    async fn put_request(&self, request: &mut Request) -> Result<RequestId>;

    async fn get_request(&self, name: &str) -> Result<Request>;

    async fn peek_request(&self, name: &str) -> Result<Request>;

    async fn claim_next(&self) -> Result<Option<Request>>;

    async fn peek_next(&self) -> Result<Option<Request>>;

    async fn get_bulk_requests(&self, n: usize, claim: bool)
    -> Result<BTreeMap<RequestId, Request>>;

    async fn get_scheduled_request(&self, operation_id: OperationId) -> Result<Option<Request>>;

    async fn get_request_name(&self, id: RequestId) -> Result<String>;

    async fn get_request_names(&self, filter: &NamesFilter) -> Result<Vec<String>>;

    async fn cancel_request(&self, name: &str) -> Result<RequestId>;

    async fn delete_request(&self, name: &str) -> Result<()>;

    async fn get_request_status(&self, name: &str) -> Result<RequestStatus>;

    async fn get_request_file_status(
        &self,
        request: &RequestRef,
        lfns: &[String],
    ) -> Result<BTreeMap<String, Option<FileStatus>>>;

    async fn get_request_info(&self, request: &RequestRef) -> Result<RequestInfo>;

    async fn get_request_names_for_jobs(&self, jobs: &[i64]) -> Result<JobLookup<String>>;

    async fn read_requests_for_jobs(&self, jobs: &[i64]) -> Result<JobLookup<Request>>;

    async fn get_db_summary(&self) -> Result<QueueSummary>;

    async fn get_digest(&self, name: &str) -> Result<String>;
}

/// Open the store named by `config.database_url`.
pub async fn open_queue(
    config: &Config,
    monitor: Arc<dyn QueueMonitor>,
) -> Result<Arc<dyn RequestQueue>> {
    match StoreLocation::parse(&config.database_url)? {
        StoreLocation::SqliteMemory => {
            info!("using in-memory SQLite store");
            let engine = Engine::in_memory()?
                .with_config(config.queue.clone())
                .with_monitor(monitor);
            Ok(Arc::new(SharedEngine::new(engine)))
        }
        StoreLocation::Sqlite(path) => {
            info!(path = %path.display(), "using SQLite store");
            let engine = Engine::open(&path, config.queue.clone())?.with_monitor(monitor);
            Ok(Arc::new(SharedEngine::new(engine)))
        }
        StoreLocation::Postgres(url) => {
            info!("using Postgres store");
            let db = Db::connect(url.expose_secret(), config.queue.clone())
                .await?
                .with_monitor(monitor);
            db.migrate().await?;
            Ok(Arc::new(db))
        }
    }
}

// ---------------------------------------------------------------------------
// SQLite engine adapter
// ---------------------------------------------------------------------------

/// An [`Engine`] shared between tasks. Calls run on the blocking pool.
#[derive(Clone)]
pub struct SharedEngine {
    engine: Arc<Mutex<Engine>>,
}

impl SharedEngine {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
        }
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Engine) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || {
            let mut engine = engine
                .lock()
                .map_err(|_| Error::Other("engine lock poisoned".to_string()))?;
            f(&mut engine)
        })
        .await
        .map_err(|e| Error::Other(format!("engine task failed: {e}")))?
    }
}

#[async_trait]
impl RequestQueue for SharedEngine {
    async fn put_request(&self, request: &mut Request) -> Result<RequestId> {
        let mut staged = request.clone();
        let (id, staged) = self
            .call(move |engine| {
                let id = engine.put_request(&mut staged)?;
                Ok((id, staged))
            })
            .await?;
        *request = staged;
        Ok(id)
    }

    async fn get_request(&self, name: &str) -> Result<Request> {
        let name = name.to_string();
        self.call(move |engine| engine.get_request(&name)).await
    }

    async fn peek_request(&self, name: &str) -> Result<Request> {
        let name = name.to_string();
        self.call(move |engine| engine.peek_request(&name)).await
    }

    async fn claim_next(&self) -> Result<Option<Request>> {
        self.call(|engine| engine.claim_next()).await
    }

    async fn peek_next(&self) -> Result<Option<Request>> {
        self.call(|engine| engine.peek_next()).await
    }

    async fn get_bulk_requests(
        &self,
        n: usize,
        claim: bool,
    ) -> Result<BTreeMap<RequestId, Request>> {
        self.call(move |engine| engine.get_bulk_requests(n, claim))
            .await
    }

    async fn get_scheduled_request(&self, operation_id: OperationId) -> Result<Option<Request>> {
        self.call(move |engine| engine.get_scheduled_request(operation_id))
            .await
    }

    async fn get_request_name(&self, id: RequestId) -> Result<String> {
        self.call(move |engine| engine.get_request_name(id)).await
    }

    async fn get_request_names(&self, filter: &NamesFilter) -> Result<Vec<String>> {
        let filter = filter.clone();
        self.call(move |engine| engine.get_request_names(&filter))
            .await
    }

    async fn cancel_request(&self, name: &str) -> Result<RequestId> {
        let name = name.to_string();
        self.call(move |engine| engine.cancel_request(&name)).await
    }

    async fn delete_request(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.call(move |engine| engine.delete_request(&name)).await
    }

    async fn get_request_status(&self, name: &str) -> Result<RequestStatus> {
        let name = name.to_string();
        self.call(move |engine| engine.get_request_status(&name))
            .await
    }

    async fn get_request_file_status(
        &self,
        request: &RequestRef,
        lfns: &[String],
    ) -> Result<BTreeMap<String, Option<FileStatus>>> {
        let request = request.clone();
        let lfns = lfns.to_vec();
        self.call(move |engine| engine.get_request_file_status(&request, &lfns))
            .await
    }

    async fn get_request_info(&self, request: &RequestRef) -> Result<RequestInfo> {
        let request = request.clone();
        self.call(move |engine| engine.get_request_info(&request))
            .await
    }

    async fn get_request_names_for_jobs(&self, jobs: &[i64]) -> Result<JobLookup<String>> {
        let jobs = jobs.to_vec();
        self.call(move |engine| engine.get_request_names_for_jobs(&jobs))
            .await
    }

    async fn read_requests_for_jobs(&self, jobs: &[i64]) -> Result<JobLookup<Request>> {
        let jobs = jobs.to_vec();
        self.call(move |engine| engine.read_requests_for_jobs(&jobs))
            .await
    }

    async fn get_db_summary(&self) -> Result<QueueSummary> {
        self.call(|engine| engine.get_db_summary()).await
    }

    async fn get_digest(&self, name: &str) -> Result<String> {
        let name = name.to_string();
        self.call(move |engine| engine.get_digest(&name)).await
    }
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[async_trait]
impl RequestQueue for Db {
    async fn put_request(&self, request: &mut Request) -> Result<RequestId> {
        Db::put_request(self, request).await
    }

    async fn get_request(&self, name: &str) -> Result<Request> {
        Db::get_request(self, name).await
    }

    async fn peek_request(&self, name: &str) -> Result<Request> {
        Db::peek_request(self, name).await
    }

    async fn claim_next(&self) -> Result<Option<Request>> {
        Db::claim_next(self).await
    }

    async fn peek_next(&self) -> Result<Option<Request>> {
        Db::peek_next(self).await
    }

    async fn get_bulk_requests(
        &self,
        n: usize,
        claim: bool,
    ) -> Result<BTreeMap<RequestId, Request>> {
        Db::get_bulk_requests(self, n, claim).await
    }

    async fn get_scheduled_request(&self, operation_id: OperationId) -> Result<Option<Request>> {
        Db::get_scheduled_request(self, operation_id).await
    }

    async fn get_request_name(&self, id: RequestId) -> Result<String> {
        Db::get_request_name(self, id).await
    }

    async fn get_request_names(&self, filter: &NamesFilter) -> Result<Vec<String>> {
        Db::get_request_names(self, filter).await
    }

    async fn cancel_request(&self, name: &str) -> Result<RequestId> {
        Db::cancel_request(self, name).await
    }

    async fn delete_request(&self, name: &str) -> Result<()> {
        Db::delete_request(self, name).await
    }

    async fn get_request_status(&self, name: &str) -> Result<RequestStatus> {
        Db::get_request_status(self, name).await
    }

    async fn get_request_file_status(
        &self,
        request: &RequestRef,
        lfns: &[String],
    ) -> Result<BTreeMap<String, Option<FileStatus>>> {
        Db::get_request_file_status(self, request, lfns).await
    }

    async fn get_request_info(&self, request: &RequestRef) -> Result<RequestInfo> {
        Db::get_request_info(self, request).await
    }

    async fn get_request_names_for_jobs(&self, jobs: &[i64]) -> Result<JobLookup<String>> {
        Db::get_request_names_for_jobs(self, jobs).await
    }

    async fn read_requests_for_jobs(&self, jobs: &[i64]) -> Result<JobLookup<Request>> {
        Db::read_requests_for_jobs(self, jobs).await
    }

    async fn get_db_summary(&self) -> Result<QueueSummary> {
        Db::get_db_summary(self).await
    }

    async fn get_digest(&self, name: &str) -> Result<String> {
        Db::get_digest(self, name).await
    }
}
