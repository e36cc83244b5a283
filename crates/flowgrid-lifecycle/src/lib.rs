//! Run lifecycle state machine.
//!
//! [`Lifecycle`] is the only writer of run states. It commits transitions
//! through a [`RunStore`](flowgrid_state::RunStore), which checks them
//! against the transition table, the caller's expected source state and the
//! deployment's concurrency limit, and then runs post-commit
//! [`TransitionHook`]s.
//!
//! # Components
//!
//! - **`machine`**: transition orchestration, retries, terminal events
//! - **`hooks`**: the post-commit hook trait

pub mod error;
pub mod hooks;
pub mod machine;

pub use error::{TransitionError, TransitionResult};
pub use hooks::TransitionHook;
pub use machine::Lifecycle;
