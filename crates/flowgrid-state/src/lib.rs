//! flowgrid-state: run store, run types and lifecycle events.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for runs and deployments behind the [`RunStore`] and
//! [`DeploymentCatalog`] traits.
//!
//! # Architecture
//!
//! Domain types are JSON-serialized into redb's `&[u8]` value columns. A
//! separate `run_keys` table maps `{deployment_id}|{idempotency_key}` to a
//! run id and is what makes scheduled inserts skip-on-conflict.
//!
//! Transitions are validated against [`StateType::can_transition_to`] and the
//! caller's [`Expected`] source state inside the same write transaction that
//! stores them. That transaction also maintains the `running_slots` table,
//! which enforces each deployment's concurrency limit.

pub mod backoff;
pub mod error;
pub mod events;
#[cfg(any(test, feature = "testing"))]
pub mod fault;
pub mod store;
pub mod tables;
pub mod traits;
pub mod types;

pub use backoff::RetryPolicy;
pub use error::{StateError, StateResult};
pub use events::{BroadcastSink, Event, EventSink, LogSink, NullSink};
pub use store::StateStore;
pub use traits::{DeploymentCatalog, RunStore};
pub use types::*;
