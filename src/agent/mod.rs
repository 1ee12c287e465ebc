//! Worker harness: claim requests, run their operations, persist the result.
//!
//! Each cycle bulk-claims a batch of Waiting requests and processes every
//! request in its own task. All tasks are joined before the cycle ends; they
//! share nothing but the queue.

pub mod handler;

pub use handler::{HandlerRegistry, OperationHandler};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::model::{Operation, OperationStatus, Request, RequestStatus};
use crate::queue::RequestQueue;
use crate::telemetry::QueueMonitor;
use crate::telemetry::request::{record_status_transition, start_request_span};

/// Configuration for the agent loop.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Pause between cycles.
    pub polling_interval: Duration,
    /// Stop after this many cycles. 0 = run until stopped.
    pub max_cycles: u64,
    /// Requests claimed per cycle.
    pub bulk_size: usize,
    /// The loop stops before the next cycle once this file exists.
    pub stop_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(120),
            max_cycles: 500,
            bulk_size: 10,
            stop_file: None,
        }
    }
}

impl AgentConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            polling_interval: config.polling_interval,
            max_cycles: config.max_cycles,
            bulk_size: config.bulk_size,
            stop_file: None,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Requests claimed this cycle.
    pub claimed: usize,
    /// Final status of each processed request, counted.
    pub outcomes: BTreeMap<RequestStatus, usize>,
    /// Requests whose processing failed outright (store error, panic).
    pub errors: usize,
}

/// The agent loop.
pub struct RequestAgent {
    queue: Arc<dyn RequestQueue>,
    registry: Arc<HandlerRegistry>,
    monitor: Arc<dyn QueueMonitor>,
    config: AgentConfig,
    shutdown: Arc<Notify>,
}

impl Clone for RequestAgent {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            registry: Arc::clone(&self.registry),
            monitor: Arc::clone(&self.monitor),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl RequestAgent {
    pub fn new(
        queue: Arc<dyn RequestQueue>,
        registry: HandlerRegistry,
        monitor: Arc<dyn QueueMonitor>,
        config: AgentConfig,
    ) -> Self {
        Self {
            queue,
            registry: Arc::new(registry),
            monitor,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the loop to stop after the current cycle.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run cycles until shutdown, the stop file, or `max_cycles`. Returns the
    /// number of cycles executed.
    pub async fn run(&self) -> Result<u64> {
        info!(
            bulk_size = self.config.bulk_size,
            max_cycles = self.config.max_cycles,
            handlers = ?self.registry.operation_types(),
            "agent started"
        );

        let mut cycles = 0u64;
        loop {
            if self.stop_requested() {
                info!("stop file present, agent stopping");
                break;
            }

            if let Err(e) = self.execute_cycle().await {
                error!("cycle failed: {e}");
            }
            cycles += 1;

            if self.config.max_cycles > 0 && cycles >= self.config.max_cycles {
                info!(cycles, "max cycles reached, agent stopping");
                break;
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("agent shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.polling_interval) => {}
            }
        }
        Ok(cycles)
    }

    fn stop_requested(&self) -> bool {
        self.config
            .stop_file
            .as_ref()
            .is_some_and(|path| path.exists())
    }

    /// Claim a batch and process it, one task per request.
    pub async fn execute_cycle(&self) -> Result<CycleReport> {
        let started = Instant::now();
        let requests = self
            .queue
            .get_bulk_requests(self.config.bulk_size, true)
            .await?;

        let mut report = CycleReport {
            claimed: requests.len(),
            ..CycleReport::default()
        };

        let mut tasks = JoinSet::new();
        for request in requests.into_values() {
            let agent = self.clone();
            tasks.spawn(async move { agent.process_request(request).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(status)) => *report.outcomes.entry(status).or_default() += 1,
                Ok(Err(e)) => {
                    error!("request processing failed: {e}");
                    report.errors += 1;
                }
                Err(e) => {
                    error!("request task aborted: {e}");
                    report.errors += 1;
                }
            }
        }

        self.monitor.cycle_finished(report.claimed, started.elapsed());
        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                errors = report.errors,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "cycle finished"
            );
        }
        Ok(report)
    }

    /// Run the request's operations in order and store the outcome.
    async fn process_request(&self, mut request: Request) -> Result<RequestStatus> {
        let span = start_request_span(&request.name, request.request_id);

        async {
            let from = request.status;
            request.operations.sort_by_key(|op| op.order);

            let (status, error) = self.run_operations(&mut request.operations).await;
            request.status = status;
            if error.is_some() {
                request.error = error;
            }
            if !from.can_transition_to(status) {
                warn!(from = from.as_str(), to = status.as_str(), "unexpected status transition");
            }
            record_status_transition(&span, from, status);

            self.queue.put_request(&mut request).await?;
            Ok(status)
        }
        .instrument(span.clone())
        .await
    }

    /// Returns the request's next status and, on failure, the error text.
    async fn run_operations(
        &self,
        operations: &mut [Operation],
    ) -> (RequestStatus, Option<String>) {
        for op in operations.iter_mut() {
            match op.status {
                OperationStatus::Failed => return (RequestStatus::Failed, op.error.clone()),
                OperationStatus::Scheduled => return (RequestStatus::Scheduled, None),
                status if !status.is_runnable() => continue,
                _ => {}
            }

            let Some(handler) = self.registry.get(&op.op_type) else {
                warn!(operation_type = %op.op_type, "no handler for operation type");
                let error = format!("no handler for operation type '{}'", op.op_type);
                op.fail(error.clone());
                self.monitor.operation_handled(&op.op_type, "unroutable");
                return (RequestStatus::Failed, Some(error));
            };

            if let Err(e) = handler.execute(op).await {
                let error = format!("{}: {e}", op.op_type);
                op.fail(e.to_string());
                self.monitor.operation_handled(&op.op_type, "error");
                return (RequestStatus::Failed, Some(error));
            }
            op.last_update = chrono::Utc::now();

            match op.status {
                OperationStatus::Done => {
                    self.monitor.operation_handled(&op.op_type, "done");
                }
                OperationStatus::Scheduled => {
                    self.monitor.operation_handled(&op.op_type, "scheduled");
                    return (RequestStatus::Scheduled, None);
                }
                OperationStatus::Failed => {
                    self.monitor.operation_handled(&op.op_type, "failed");
                    return (RequestStatus::Failed, op.error.clone());
                }
                _ => {
                    self.monitor.operation_handled(&op.op_type, "pending");
                    return (RequestStatus::Waiting, None);
                }
            }
        }
        (RequestStatus::Done, None)
    }
}
