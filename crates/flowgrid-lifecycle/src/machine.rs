//! Applies run state transitions through the store.
//!
//! The store validates and commits each transition atomically. After the
//! commit the lifecycle runs the registered hooks in order and emits
//! `RunTerminal` for terminal states. Hook failures are logged and emitted
//! as `HookFailed`; the committed transition is kept.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowgrid_state::{
    Event, EventSink, Expected, NullSink, RetryPolicy, Run, RunCreate, RunId, RunStore, State,
    StateType,
};
use tracing::{debug, info, warn};

use crate::error::{TransitionError, TransitionResult};
use crate::hooks::TransitionHook;

#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<dyn RunStore>,
    events: Arc<dyn EventSink>,
    hooks: Vec<Arc<dyn TransitionHook>>,
    retry: RetryPolicy,
}

impl Lifecycle {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self {
            store,
            events: Arc::new(NullSink),
            hooks: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn TransitionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Move `run_id` to `proposed`.
    ///
    /// Fails with `IllegalTransition` (run unchanged) when the table forbids
    /// the move, with `ConcurrencyLimit` when entering Running would exceed
    /// the deployment's limit, and with `StoreUnavailable` once transient
    /// store errors outlast the retry policy.
    pub async fn transition(&self, run_id: RunId, proposed: State) -> TransitionResult<Run> {
        self.transition_from(run_id, Expected::any(), proposed).await
    }

    /// Like [`transition`](Self::transition), but only if the run is still
    /// in the state the caller read. A mismatch is an `IllegalTransition`.
    pub async fn transition_from(
        &self,
        run_id: RunId,
        expected: Expected,
        proposed: State,
    ) -> TransitionResult<Run> {
        let to = proposed.kind;
        let run = self
            .retry
            .retry("commit_transition", || {
                self.store.commit_transition(run_id, expected, proposed.clone())
            })
            .await
            .map_err(|e| TransitionError::from_store(e, self.retry.max_attempts.max(1)))?;

        let previous = run.history.last().map(|s| s.kind);
        debug!(%run_id, from = ?previous, %to, "run transitioned");
        self.after_commit(previous, &run).await;
        Ok(run)
    }

    /// Shorthand for [`transition`](Self::transition) with a plain state.
    pub async fn transition_to(
        &self,
        run_id: RunId,
        kind: StateType,
        timestamp: DateTime<Utc>,
        message: Option<&str>,
    ) -> TransitionResult<Run> {
        let mut state = State::new(kind, timestamp);
        state.message = message.map(str::to_string);
        self.transition(run_id, state).await
    }

    /// Create a run from a direct request (Pending or Running).
    pub async fn create(&self, request: RunCreate) -> TransitionResult<Run> {
        let run = self
            .retry
            .retry("create_run", || self.store.create_run(request.clone()))
            .await
            .map_err(|e| TransitionError::from_store(e, self.retry.max_attempts.max(1)))?;
        if run.history.is_empty() {
            self.after_commit(None, &run).await;
        }
        Ok(run)
    }

    async fn after_commit(&self, previous: Option<StateType>, run: &Run) {
        for hook in &self.hooks {
            if let Err(e) = hook.after_commit(previous, run).await {
                warn!(run_id = %run.id, hook = hook.name(), error = %e, "transition hook failed");
                self.events.emit(Event::HookFailed {
                    run_id: run.id,
                    hook: hook.name().to_string(),
                    error: format!("{e:#}"),
                });
            }
        }

        if run.state.is_terminal() {
            info!(run_id = %run.id, state = %run.state.kind, "run reached terminal state");
            self.events.emit(Event::RunTerminal {
                run_id: run.id,
                deployment_id: run.deployment_id.clone(),
                state: run.state.kind,
                timestamp: run.state.timestamp,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use flowgrid_state::fault::FaultInjectingStore;
    use flowgrid_state::{BroadcastSink, Deployment, StateStore};
    use std::time::Duration;

    fn store() -> Arc<StateStore> {
        Arc::new(StateStore::open_in_memory().unwrap())
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    struct FailingHook;

    #[async_trait]
    impl TransitionHook for FailingHook {
        fn name(&self) -> &str {
            "failing"
        }

        async fn after_commit(&self, _: Option<StateType>, _: &Run) -> anyhow::Result<()> {
            anyhow::bail!("hook exploded")
        }
    }

    #[tokio::test]
    async fn pause_and_resume_appends_two_history_entries() {
        let lifecycle = Lifecycle::new(store());
        let run = lifecycle
            .create(RunCreate {
                state: Some(State::new(StateType::Running, Utc::now())),
                ..Default::default()
            })
            .await
            .unwrap();
        let before = run.history.len();

        let now = Utc::now();
        lifecycle
            .transition(run.id, State::paused_until(now, now + TimeDelta::hours(1)))
            .await
            .unwrap();
        let resumed = lifecycle
            .transition_to(run.id, StateType::Running, Utc::now(), None)
            .await
            .unwrap();

        assert_eq!(resumed.state_type(), StateType::Running);
        assert_eq!(resumed.history.len(), before + 2);
        assert_eq!(resumed.history[before].kind, StateType::Running);
        assert_eq!(resumed.history[before + 1].kind, StateType::Paused);
    }

    #[tokio::test]
    async fn every_illegal_pair_is_rejected_and_leaves_state_unchanged() {
        // Reach each source state through legal moves, then try every
        // forbidden target.
        let paths: &[&[StateType]] = &[
            &[StateType::Pending],
            &[StateType::Pending, StateType::Running],
            &[StateType::Pending, StateType::Running, StateType::Paused],
            &[StateType::Pending, StateType::Running, StateType::Completed],
            &[StateType::Pending, StateType::Running, StateType::Failed],
            &[StateType::Pending, StateType::Crashed],
            &[StateType::Pending, StateType::Cancelled],
        ];
        let lifecycle = Lifecycle::new(store());

        for path in paths {
            let source = *path.last().unwrap();
            for target in StateType::ALL {
                if source.can_transition_to(target) {
                    continue;
                }
                let mut run = lifecycle.create(RunCreate::default()).await.unwrap();
                for step in &path[1..] {
                    run = lifecycle
                        .transition_to(run.id, *step, Utc::now(), None)
                        .await
                        .unwrap();
                }

                let err = lifecycle
                    .transition_to(run.id, target, Utc::now(), None)
                    .await
                    .unwrap_err();
                assert!(err.is_illegal(), "{source} -> {target}: {err}");

                let stored = lifecycle.store().get_run(run.id).await.unwrap().unwrap();
                assert_eq!(stored, run, "{source} -> {target} modified the run");
            }
        }
    }

    #[tokio::test]
    async fn unknown_run_is_reported() {
        let lifecycle = Lifecycle::new(store());
        let err = lifecycle
            .transition_to(uuid::Uuid::new_v4(), StateType::Running, Utc::now(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn transient_store_errors_are_retried() {
        let flaky = Arc::new(FaultInjectingStore::new(store()));
        let lifecycle = Lifecycle::new(flaky.clone()).with_retry(fast_retry());
        let run = lifecycle.create(RunCreate::default()).await.unwrap();

        flaky.fail_transitions(2);
        let updated = lifecycle
            .transition_to(run.id, StateType::Running, Utc::now(), None)
            .await
            .unwrap();
        assert_eq!(updated.state_type(), StateType::Running);
        assert_eq!(flaky.transition_calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_store_unavailable() {
        let flaky = Arc::new(FaultInjectingStore::new(store()));
        let lifecycle = Lifecycle::new(flaky.clone()).with_retry(fast_retry());
        let run = lifecycle.create(RunCreate::default()).await.unwrap();

        flaky.fail_transitions(10);
        let err = lifecycle
            .transition_to(run.id, StateType::Running, Utc::now(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::StoreUnavailable { attempts: 3, .. }));

        let stored = flaky.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.state_type(), StateType::Pending);
    }

    #[tokio::test]
    async fn hook_failure_keeps_transition_and_emits_event() {
        let sink = Arc::new(BroadcastSink::new(16));
        let mut events = sink.subscribe();
        let lifecycle = Lifecycle::new(store())
            .with_events(sink.clone())
            .with_hook(Arc::new(FailingHook));
        let run = lifecycle.create(RunCreate::default()).await.unwrap();
        // Creation also runs hooks.
        assert!(matches!(events.recv().await.unwrap(), Event::HookFailed { .. }));

        let updated = lifecycle
            .transition_to(run.id, StateType::Running, Utc::now(), None)
            .await
            .unwrap();
        assert_eq!(updated.state_type(), StateType::Running);
        match events.recv().await.unwrap() {
            Event::HookFailed { run_id, hook, error } => {
                assert_eq!(run_id, run.id);
                assert_eq!(hook, "failing");
                assert!(error.contains("hook exploded"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminal_transition_emits_run_terminal() {
        let sink = Arc::new(BroadcastSink::new(16));
        let mut events = sink.subscribe();
        let lifecycle = Lifecycle::new(store()).with_events(sink.clone());
        let run = lifecycle.create(RunCreate::default()).await.unwrap();

        lifecycle
            .transition_to(run.id, StateType::Running, Utc::now(), None)
            .await
            .unwrap();
        lifecycle
            .transition_to(run.id, StateType::Completed, Utc::now(), Some("done"))
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            Event::RunTerminal { run_id, state, .. } => {
                assert_eq!(run_id, run.id);
                assert_eq!(state, StateType::Completed);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_expected_state_is_rejected() {
        let lifecycle = Lifecycle::new(store());
        let run = lifecycle.create(RunCreate::default()).await.unwrap();
        lifecycle
            .transition_to(run.id, StateType::Running, Utc::now(), None)
            .await
            .unwrap();

        let err = lifecycle
            .transition_from(
                run.id,
                Expected::state(StateType::Pending),
                State::new(StateType::Cancelled, Utc::now()),
            )
            .await
            .unwrap_err();
        assert!(err.is_illegal(), "{err}");
        let stored = lifecycle.store().get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.state_type(), StateType::Running);
    }

    #[tokio::test]
    async fn concurrency_limit_blocks_extra_running_runs() {
        let store = store();
        let mut deployment = Deployment::new("etl", "etl", Utc::now());
        deployment.concurrency_limit = Some(1);
        store.put_deployment(&deployment).unwrap();
        let lifecycle = Lifecycle::new(store.clone()).with_retry(fast_retry());

        let mut runs = Vec::new();
        for _ in 0..2 {
            let run = lifecycle
                .create(RunCreate {
                    deployment_id: Some("etl".into()),
                    ..Default::default()
                })
                .await
                .unwrap();
            runs.push(run);
        }

        lifecycle
            .transition_to(runs[0].id, StateType::Running, Utc::now(), None)
            .await
            .unwrap();
        let err = lifecycle
            .transition_to(runs[1].id, StateType::Running, Utc::now(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::ConcurrencyLimit { limit: 1, .. }));
        assert_eq!(store.occupied_slots("etl").unwrap(), 1);

        let now = Utc::now();
        lifecycle
            .transition(runs[0].id, State::paused_until(now, now + TimeDelta::minutes(5)))
            .await
            .unwrap();
        assert_eq!(store.occupied_slots("etl").unwrap(), 0);

        lifecycle
            .transition_to(runs[1].id, StateType::Running, Utc::now(), None)
            .await
            .unwrap();
        lifecycle
            .transition_to(runs[1].id, StateType::Crashed, Utc::now(), None)
            .await
            .unwrap();
        assert_eq!(store.occupied_slots("etl").unwrap(), 0);
    }
}
