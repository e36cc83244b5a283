//! Domain types persisted by the run store.
//!
//! Runs, their states and the deployments that produce them. All types are
//! serializable to/from JSON for storage in redb tables.

use chrono::{DateTime, Utc};
use flowgrid_recurrence::{BoundsOverride, Schedule};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StateError, StateResult};

/// Unique identifier for a run.
pub type RunId = Uuid;

/// Unique identifier for a deployment.
pub type DeploymentId = String;

// ── State ─────────────────────────────────────────────────────────

/// Kind of a run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    Scheduled,
    Late,
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Crashed,
    Cancelled,
}

impl StateType {
    pub const ALL: [StateType; 9] = [
        StateType::Scheduled,
        StateType::Late,
        StateType::Pending,
        StateType::Running,
        StateType::Paused,
        StateType::Completed,
        StateType::Failed,
        StateType::Crashed,
        StateType::Cancelled,
    ];

    /// Completed, Failed, Crashed and Cancelled runs never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StateType::Completed | StateType::Failed | StateType::Crashed | StateType::Cancelled
        )
    }

    /// Whether a run in `self` may move to `next`.
    pub fn can_transition_to(self, next: StateType) -> bool {
        use StateType::*;
        matches!(
            (self, next),
            (Scheduled, Pending | Cancelled | Late)
                | (Late, Pending | Cancelled)
                | (Pending, Running | Cancelled | Crashed)
                | (Running, Completed | Failed | Crashed | Paused | Cancelled)
                | (Paused, Running | Cancelled | Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StateType::Scheduled => "SCHEDULED",
            StateType::Late => "LATE",
            StateType::Pending => "PENDING",
            StateType::Running => "RUNNING",
            StateType::Paused => "PAUSED",
            StateType::Completed => "COMPLETED",
            StateType::Failed => "FAILED",
            StateType::Crashed => "CRASHED",
            StateType::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for StateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a run's state history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub kind: StateType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Only meaningful on Paused states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_deadline: Option<DateTime<Utc>>,
}

impl State {
    pub fn new(kind: StateType, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            timestamp,
            message: None,
            pause_deadline: None,
        }
    }

    /// A Paused state that expires at `deadline`.
    pub fn paused_until(timestamp: DateTime<Utc>, deadline: DateTime<Utc>) -> Self {
        Self {
            pause_deadline: Some(deadline),
            ..Self::new(StateType::Paused, timestamp)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// What a caller last read of a run, re-checked when its transition commits.
///
/// [`Expected::any`] checks nothing beyond the transition table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Expected {
    pub kind: Option<StateType>,
    /// The current pause deadline must fall at or before this instant.
    pub pause_deadline_by: Option<DateTime<Utc>>,
}

impl Expected {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn state(kind: StateType) -> Self {
        Self {
            kind: Some(kind),
            pause_deadline_by: None,
        }
    }

    pub fn pause_expired_by(mut self, at: DateTime<Utc>) -> Self {
        self.pause_deadline_by = Some(at);
        self
    }

    pub fn holds(&self, current: &State) -> bool {
        self.kind.is_none_or(|kind| current.kind == kind)
            && self
                .pause_deadline_by
                .is_none_or(|by| current.pause_deadline.is_some_and(|d| d <= by))
    }
}

// ── Deployment ────────────────────────────────────────────────────

/// A schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub name: String,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub paused: bool,
    /// Maximum number of simultaneously Running runs.
    #[serde(default)]
    pub concurrency_limit: Option<u32>,
    #[serde(default)]
    pub bounds: BoundsOverride,
    /// Copied onto every materialized run.
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(id: impl Into<DeploymentId>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            schedule: None,
            paused: false,
            concurrency_limit: None,
            bounds: BoundsOverride::default(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Has a schedule and is not paused.
    pub fn is_schedulable(&self) -> bool {
        !self.paused && self.schedule.is_some()
    }
}

// ── Run ───────────────────────────────────────────────────────────

/// A single execution attempt of a deployment or an ad-hoc unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    #[serde(default)]
    pub deployment_id: Option<DeploymentId>,
    pub name: String,
    pub scheduled_time: DateTime<Utc>,
    pub state: State,
    /// Prior states, oldest first. Append-only.
    #[serde(default)]
    pub history: Vec<State>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parent_run_id: Option<RunId>,
    #[serde(default)]
    pub task_key: Option<String>,
    #[serde(default)]
    pub dynamic_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn state_type(&self) -> StateType {
        self.state.kind
    }

    /// Move to `next`, pushing the current state onto the history.
    ///
    /// Leaves the run untouched when the transition is not allowed.
    pub fn apply(&mut self, next: State) -> StateResult<()> {
        self.apply_if(&Expected::any(), next)
    }

    /// Like [`apply`](Self::apply), but also rejects the move when the
    /// current state no longer matches `expected`.
    pub fn apply_if(&mut self, expected: &Expected, next: State) -> StateResult<()> {
        if !expected.holds(&self.state) || !self.state.kind.can_transition_to(next.kind) {
            return Err(StateError::IllegalTransition {
                run_id: self.id,
                from: Some(self.state.kind),
                to: next.kind,
            });
        }
        self.updated_at = next.timestamp;
        let prev = std::mem::replace(&mut self.state, next);
        self.history.push(prev);
        Ok(())
    }
}

/// Key guarding against duplicate scheduled runs of one deployment.
pub fn idempotency_key(deployment_id: &str, scheduled_time: DateTime<Utc>) -> String {
    format!("scheduled {deployment_id} {}", scheduled_time.to_rfc3339())
}

/// A run to be inserted by the materializer, born Scheduled.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRun {
    pub name: String,
    pub scheduled_time: DateTime<Utc>,
    pub idempotency_key: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl NewRun {
    /// A Scheduled run of `deployment` at `scheduled_time`.
    pub fn scheduled(
        deployment: &Deployment,
        scheduled_time: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: format!(
                "{}-{}",
                deployment.name,
                scheduled_time.format("%Y%m%dT%H%M%SZ")
            ),
            scheduled_time,
            idempotency_key: idempotency_key(&deployment.id, scheduled_time),
            tags: deployment.tags.clone(),
            created_at,
        }
    }

    pub(crate) fn into_run(self, deployment_id: &str) -> Run {
        Run {
            id: Uuid::new_v4(),
            deployment_id: Some(deployment_id.to_string()),
            name: self.name,
            scheduled_time: self.scheduled_time,
            state: State::new(StateType::Scheduled, self.created_at),
            history: Vec::new(),
            idempotency_key: Some(self.idempotency_key),
            tags: self.tags,
            parent_run_id: None,
            task_key: None,
            dynamic_key: None,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

/// A validated direct-creation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCreate {
    #[serde(default)]
    pub id: Option<RunId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub deployment_id: Option<DeploymentId>,
    /// The run this one belongs to.
    #[serde(default)]
    pub parent_run_id: Option<RunId>,
    #[serde(default)]
    pub task_key: Option<String>,
    #[serde(default)]
    pub dynamic_key: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Pending when absent. Only Pending and Running are accepted.
    #[serde(default)]
    pub state: Option<State>,
}

impl RunCreate {
    /// Build the run, rejecting initial states other than Pending and Running.
    pub fn into_run(self, now: DateTime<Utc>) -> StateResult<Run> {
        let id = self.id.unwrap_or_else(Uuid::new_v4);
        let state = self
            .state
            .unwrap_or_else(|| State::new(StateType::Pending, now));
        if !matches!(state.kind, StateType::Pending | StateType::Running) {
            return Err(StateError::IllegalTransition {
                run_id: id,
                from: None,
                to: state.kind,
            });
        }
        let name = self.name.unwrap_or_else(|| match &self.task_key {
            Some(task_key) => format!("{task_key}-{}", &id.simple().to_string()[..8]),
            None => format!("run-{}", &id.simple().to_string()[..8]),
        });
        Ok(Run {
            id,
            deployment_id: self.deployment_id,
            name,
            scheduled_time: state.timestamp,
            state,
            history: Vec::new(),
            idempotency_key: None,
            tags: self.tags,
            parent_run_id: self.parent_run_id,
            task_key: self.task_key,
            dynamic_key: self.dynamic_key,
            created_at: now,
            updated_at: now,
        })
    }
}

// ── Queries ───────────────────────────────────────────────────────

/// Selection criteria for [`query_runs`](crate::RunStore::query_runs).
///
/// Results are ordered by scheduled time, then id. `limit` and `offset`
/// page through the matches.
#[derive(Debug, Clone, PartialEq)]
pub struct RunFilter {
    pub deployment_id: Option<DeploymentId>,
    /// Any state when empty.
    pub states: Vec<StateType>,
    /// Strictly before.
    pub scheduled_before: Option<DateTime<Utc>>,
    /// At or before.
    pub pause_deadline_before: Option<DateTime<Utc>>,
    pub parent_run_id: Option<RunId>,
    /// Last state change at or after.
    pub updated_since: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            deployment_id: None,
            states: Vec::new(),
            scheduled_before: None,
            pause_deadline_before: None,
            parent_run_id: None,
            updated_since: None,
            limit: 200,
            offset: 0,
        }
    }
}

impl RunFilter {
    pub fn in_states(states: impl IntoIterator<Item = StateType>) -> Self {
        Self {
            states: states.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn for_deployment(mut self, deployment_id: impl Into<DeploymentId>) -> Self {
        self.deployment_id = Some(deployment_id.into());
        self
    }

    pub fn scheduled_before(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_before = Some(at);
        self
    }

    pub fn pause_deadline_before(mut self, at: DateTime<Utc>) -> Self {
        self.pause_deadline_before = Some(at);
        self
    }

    pub fn children_of(mut self, parent: RunId) -> Self {
        self.parent_run_id = Some(parent);
        self
    }

    pub fn updated_since(mut self, at: DateTime<Utc>) -> Self {
        self.updated_since = Some(at);
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    pub fn matches(&self, run: &Run) -> bool {
        if let Some(id) = &self.deployment_id {
            if run.deployment_id.as_ref() != Some(id) {
                return false;
            }
        }
        if !self.states.is_empty() && !self.states.contains(&run.state.kind) {
            return false;
        }
        if let Some(before) = self.scheduled_before {
            if run.scheduled_time >= before {
                return false;
            }
        }
        if let Some(before) = self.pause_deadline_before {
            match run.state.pause_deadline {
                Some(deadline) if deadline <= before => {}
                _ => return false,
            }
        }
        if let Some(parent) = self.parent_run_id {
            if run.parent_run_id != Some(parent) {
                return false;
            }
        }
        if let Some(since) = self.updated_since {
            if run.updated_at < since {
                return false;
            }
        }
        true
    }
}

/// One page of schedulable deployments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeploymentPage {
    pub deployments: Vec<Deployment>,
    /// Pass back to get the next page; `None` once the catalog is exhausted.
    pub next_page_token: Option<String>,
}
