//! Fire-and-forget notifications about scheduling and run lifecycle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::types::{DeploymentId, RunId, StateType};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// One chunk of runs was inserted for a deployment.
    RunsScheduled {
        deployment_id: DeploymentId,
        count: usize,
        first: DateTime<Utc>,
        last: DateTime<Utc>,
    },
    /// A run reached Completed, Failed, Crashed or Cancelled.
    RunTerminal {
        run_id: RunId,
        deployment_id: Option<DeploymentId>,
        state: StateType,
        timestamp: DateTime<Utc>,
    },
    /// A deployment failed to materialize on consecutive passes.
    SchedulingFailed {
        deployment_id: DeploymentId,
        consecutive_failures: u32,
        error: String,
    },
    /// A post-commit hook returned an error. The transition stands.
    HookFailed {
        run_id: RunId,
        hook: String,
        error: String,
    },
}

/// Destination for [`Event`]s. `emit` must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Fans events out to in-process subscribers.
///
/// Slow subscribers lag and lose events; emitting never waits.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Event>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: Event) {
        // No receivers is not an error.
        let _ = self.tx.send(event);
    }
}

/// Writes events to the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: Event) {
        match &event {
            Event::RunsScheduled {
                deployment_id,
                count,
                first,
                last,
            } => info!(%deployment_id, count, %first, %last, "runs scheduled"),
            Event::RunTerminal {
                run_id,
                state,
                timestamp,
                ..
            } => info!(%run_id, %state, %timestamp, "run finished"),
            Event::SchedulingFailed {
                deployment_id,
                consecutive_failures,
                error,
            } => warn!(%deployment_id, consecutive_failures, %error, "scheduling keeps failing"),
            Event::HookFailed { run_id, hook, error } => {
                warn!(%run_id, %hook, %error, "transition hook failed")
            }
        }
    }
}
