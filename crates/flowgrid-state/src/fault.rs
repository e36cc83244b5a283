//! A [`RunStore`] wrapper that records calls and injects failures.
//!
//! Enabled by the `testing` feature; used by the scheduler, lifecycle and
//! housekeeping tests to drive retry and partial-failure paths.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{StateError, StateResult};
use crate::traits::RunStore;
use crate::types::{Expected, NewRun, Run, RunCreate, RunFilter, RunId, State};

#[derive(Debug, Default, Clone, Copy)]
struct InsertFault {
    /// Inserts to let through before failing.
    pass: u32,
    /// Failures still to inject; `u32::MAX` means always.
    fail: u32,
}

#[derive(Debug, Default)]
struct Plan {
    insert_failures: HashMap<String, InsertFault>,
    transition_failures: u32,
    query_failures: u32,
    query_race: Option<State>,
    insert_calls: Vec<(String, usize)>,
    transition_calls: usize,
}

pub struct FaultInjectingStore<S> {
    inner: S,
    plan: Mutex<Plan>,
}

impl<S: RunStore> FaultInjectingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            plan: Mutex::new(Plan::default()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn plan(&self) -> MutexGuard<'_, Plan> {
        self.plan.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `times` inserts for `deployment_id` with a transient error.
    pub fn fail_inserts(&self, deployment_id: &str, times: u32) {
        self.fail_inserts_after(deployment_id, 0, times);
    }

    /// Let `pass` inserts through, then fail the next `times`.
    pub fn fail_inserts_after(&self, deployment_id: &str, pass: u32, times: u32) {
        self.plan()
            .insert_failures
            .insert(deployment_id.to_string(), InsertFault { pass, fail: times });
    }

    /// Fail every insert for `deployment_id` with a transient error.
    pub fn fail_inserts_always(&self, deployment_id: &str) {
        self.fail_inserts(deployment_id, u32::MAX);
    }

    pub fn heal_inserts(&self, deployment_id: &str) {
        self.plan().insert_failures.remove(deployment_id);
    }

    pub fn fail_transitions(&self, times: u32) {
        self.plan().transition_failures = times;
    }

    pub fn fail_queries(&self, times: u32) {
        self.plan().query_failures = times;
    }

    /// On the next `query_runs`, move the first returned run to `state`
    /// after the page is read, as a concurrent writer would.
    pub fn race_next_query(&self, state: State) {
        self.plan().query_race = Some(state);
    }

    /// Sizes of the insert calls that reached the inner store, per deployment.
    pub fn insert_batches(&self, deployment_id: &str) -> Vec<usize> {
        self.plan()
            .insert_calls
            .iter()
            .filter(|(id, _)| id == deployment_id)
            .map(|(_, n)| *n)
            .collect()
    }

    /// Number of `commit_transition` calls, failed ones included.
    pub fn transition_calls(&self) -> usize {
        self.plan().transition_calls
    }

    fn take_insert_failure(&self, deployment_id: &str) -> bool {
        let mut plan = self.plan();
        let Some(fault) = plan.insert_failures.get_mut(deployment_id) else {
            return false;
        };
        if take(&mut fault.pass) {
            return false;
        }
        fault.fail == u32::MAX || take(&mut fault.fail)
    }
}

fn take(counter: &mut u32) -> bool {
    if *counter == 0 {
        false
    } else {
        *counter -= 1;
        true
    }
}

#[async_trait]
impl<S: RunStore> RunStore for FaultInjectingStore<S> {
    async fn insert_runs(&self, deployment_id: &str, runs: Vec<NewRun>) -> StateResult<usize> {
        if self.take_insert_failure(deployment_id) {
            return Err(StateError::Unavailable("injected insert failure".into()));
        }
        {
            let mut plan = self.plan();
            plan.insert_calls.push((deployment_id.to_string(), runs.len()));
        }
        self.inner.insert_runs(deployment_id, runs).await
    }

    async fn find_existing(
        &self,
        deployment_id: &str,
        keys: &[String],
    ) -> StateResult<HashSet<String>> {
        self.inner.find_existing(deployment_id, keys).await
    }

    async fn commit_transition(
        &self,
        run_id: RunId,
        expected: Expected,
        proposed: State,
    ) -> StateResult<Run> {
        let fail = {
            let mut plan = self.plan();
            plan.transition_calls += 1;
            take(&mut plan.transition_failures)
        };
        if fail {
            return Err(StateError::Unavailable("injected transition failure".into()));
        }
        self.inner.commit_transition(run_id, expected, proposed).await
    }

    async fn query_runs(&self, filter: &RunFilter) -> StateResult<Vec<Run>> {
        let fail = take(&mut self.plan().query_failures);
        if fail {
            return Err(StateError::Unavailable("injected query failure".into()));
        }
        let runs = self.inner.query_runs(filter).await?;
        let race = self.plan().query_race.take();
        if let (Some(state), Some(first)) = (race, runs.first()) {
            self.inner
                .commit_transition(first.id, Expected::any(), state)
                .await?;
        }
        Ok(runs)
    }

    async fn get_run(&self, run_id: RunId) -> StateResult<Option<Run>> {
        self.inner.get_run(run_id).await
    }

    async fn create_run(&self, request: RunCreate) -> StateResult<Run> {
        self.inner.create_run(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;
    use crate::types::StateType;
    use chrono::Utc;

    #[tokio::test]
    async fn injected_failures_run_out() {
        let store = FaultInjectingStore::new(StateStore::open_in_memory().unwrap());
        store.fail_inserts("etl", 1);

        assert!(store.insert_runs("etl", Vec::new()).await.is_err());
        assert_eq!(store.insert_runs("etl", Vec::new()).await.unwrap(), 0);
        assert_eq!(store.insert_batches("etl"), vec![0]);
    }

    #[tokio::test]
    async fn failures_can_start_after_some_successes() {
        let store = FaultInjectingStore::new(StateStore::open_in_memory().unwrap());
        store.fail_inserts_after("etl", 1, u32::MAX);

        assert!(store.insert_runs("etl", Vec::new()).await.is_ok());
        assert!(store.insert_runs("etl", Vec::new()).await.is_err());
        assert!(store.insert_runs("etl", Vec::new()).await.is_err());
        assert!(store.insert_runs("other", Vec::new()).await.is_ok());
    }

    #[tokio::test]
    async fn raced_query_returns_the_page_it_read() {
        let store = FaultInjectingStore::new(StateStore::open_in_memory().unwrap());
        let run = store.create_run(RunCreate::default()).await.unwrap();
        store.race_next_query(State::new(StateType::Running, Utc::now()));

        let page = store.query_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(page, vec![run.clone()]);
        let stored = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.state_type(), StateType::Running);

        // Only the next query races.
        let again = store.query_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(again, vec![stored]);
    }
}
