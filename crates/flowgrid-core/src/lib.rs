//! flowgrid daemon settings.
//!
//! Only the `flowgridd` binary reads these; the scheduling and lifecycle
//! crates take plain config structs.

pub mod error;
pub mod settings;

pub use error::{ConfigError, ConfigResult};
pub use settings::{
    CancellationCleanupSettings, ENV_PREFIX, LateRunsSettings, LogFormat, LoggingSettings,
    PauseExpirationsSettings, ResolvedSettings, SchedulerSettings, ServicesSettings, Settings,
    StoreSettings,
};
