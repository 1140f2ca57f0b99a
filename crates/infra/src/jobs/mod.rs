//! Background job lifecycle: registry, timeout policies and the timeout checker.
//!
//! ## Components
//!
//! - `JobStatusService`: job metadata and the active/completed/creation indexes
//! - `JobTimeoutService`: per-job timeout policy, attempt counters, detection
//!   and retry of timed-out jobs
//! - `TimeoutCheckerJob`: background loop driving the timeout scan
//! - `JobTracker`: the reporting surface other workers use
//! - `JobServices`: builds all of the above over one store
//!
//! Everything lives in a [`KvStore`](crate::kv_store::KvStore); see
//! [`keys`] for the layout.

pub mod checker;
pub mod error;
pub mod keys;
pub mod services;
pub mod status;
pub mod timeout;
pub mod tracker;
pub mod types;

pub use checker::{CheckerStats, TimeoutCheckerJob};
pub use error::JobError;
pub use services::JobServices;
pub use status::{JobStatusService, RegistryStats};
pub use timeout::{JobTimeoutService, TimeoutReason};
pub use tracker::JobTracker;
pub use types::{JobMetadata, JobStatus, TimeoutConfig, TimeoutResult};
