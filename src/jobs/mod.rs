//! Job domain model — requests, jobs, files, events, and projections.

pub mod model;

pub use model::{
    FileStatus, Job, JobEvent, JobFile, JobStatus, ProcessOptions, ProcessRequest, RetryRun,
    RetrySelector, Session, event_types,
};
