//! flowgrid-housekeeping: periodic passes that keep run states honest.
//!
//! # Services
//!
//! - **`late_runs`**: Scheduled runs past their start plus a grace period
//!   become Late
//! - **`pause_expirations`**: Paused runs past their deadline become Failed
//! - **`cancellation_cleanup`**: unfinished descendants of Cancelled runs
//!   become Cancelled
//!
//! Every service implements [`LoopService`] and is driven by
//! [`run_service`], usually through a [`ServiceManager`] that owns the
//! shared stop signal. All state changes go through
//! [`Lifecycle`](flowgrid_lifecycle::Lifecycle), so a run that another
//! writer moved first shows up as a skipped transition rather than an error.

pub mod cancellation_cleanup;
pub mod error;
pub mod late_runs;
pub mod pause_expirations;
pub mod service;

pub use cancellation_cleanup::{CancellationCleanup, CancellationCleanupConfig};
pub use error::{HousekeepingError, HousekeepingResult};
pub use late_runs::{LateRuns, LateRunsConfig};
pub use pause_expirations::{PauseExpirations, PauseExpirationsConfig};
pub use service::{LoopService, PassStats, ServiceManager, run_service};
