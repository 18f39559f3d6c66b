//! Persistence layer — libSQL-backed storage for jobs, files, events,
//! sessions, retry runs, and settings.

pub mod libsql_store;
pub mod migrations;
pub mod traits;

pub use libsql_store::LibSqlStore;
pub use traits::{FileStatusCounts, JobStore, NewEvent};
