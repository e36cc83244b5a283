//! flowgrid-scheduler: run materialization and the scheduler loop.
//!
//! Reads schedulable [`Deployment`](flowgrid_state::Deployment)s from a
//! [`DeploymentCatalog`](flowgrid_state::DeploymentCatalog), evaluates their
//! schedules and inserts the missing Scheduled runs into a
//! [`RunStore`](flowgrid_state::RunStore).
//!
//! # Architecture
//!
//! ```text
//! Scheduler (paging loop, watch-based stop)
//!   ├── DeploymentCatalog::list_schedulable (pages of deployment_batch_size)
//!   └── Materializer (per deployment, up to max_concurrency at once)
//!       ├── flowgrid_recurrence::evaluate
//!       ├── RunStore::find_existing (skip what is already there)
//!       └── RunStore::insert_runs (chunks of insert_batch_size)
//! ```

pub mod error;
pub mod materializer;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use materializer::{MaterializeReport, Materializer, MaterializerConfig};
pub use scheduler::{LoopPhase, PassReport, Scheduler, SchedulerConfig};
