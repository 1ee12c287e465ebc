//! # rmsq
//!
//! Request Management queue: durable storage and claiming of multi-step
//! data-management requests (Request → Operation → File).
//!
//! Two stores sit behind one [`queue::RequestQueue`] interface: an embedded
//! SQLite engine ([`engine::Engine`]) and Postgres ([`db::Db`]). The
//! [`agent`] claims Waiting requests in bulk and runs their operations
//! through registered handlers.

pub mod agent;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod queue;
mod storage;
pub mod telemetry;
