//! StateStore: redb-backed run and deployment persistence.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! `run_keys` table is the uniqueness index behind skip-on-conflict inserts.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::collections::HashSet;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, Table};
use tracing::{debug, trace};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::traits::{DeploymentCatalog, RunStore};
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe run store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(RUNS).map_err(map_err!(Table))?;
        txn.open_table(RUN_KEYS).map_err(map_err!(Table))?;
        txn.open_table(RUNNING_SLOTS).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or replace a deployment.
    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        let value = serde_json::to_vec(deployment).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            table
                .insert(deployment.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment_id = %deployment.id, "deployment stored");
        Ok(())
    }

    pub fn get_deployment(&self, id: &str) -> StateResult<Option<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let deployment: Deployment =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(deployment))
            }
            None => Ok(None),
        }
    }

    /// All deployments, schedulable or not, ordered by id.
    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let deployment: Deployment =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(deployment);
        }
        Ok(results)
    }

    fn schedulable_page(
        &self,
        page_token: Option<&str>,
        page_size: usize,
    ) -> StateResult<DeploymentPage> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut deployments = Vec::new();
        if page_size == 0 {
            return Ok(DeploymentPage::default());
        }
        let entries = match page_token {
            Some(token) => table.range::<&str>((Bound::Excluded(token), Bound::Unbounded)),
            None => table.iter(),
        }
        .map_err(map_err!(Read))?;
        for entry in entries {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let deployment: Deployment =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if !deployment.is_schedulable() {
                continue;
            }
            deployments.push(deployment);
            if deployments.len() == page_size {
                break;
            }
        }
        let next_page_token = if deployments.len() == page_size {
            deployments.last().map(|d| d.id.clone())
        } else {
            None
        };
        Ok(DeploymentPage {
            deployments,
            next_page_token,
        })
    }

    /// Runs of `deployment_id` currently holding a concurrency slot.
    pub fn occupied_slots(&self, deployment_id: &str) -> StateResult<usize> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNNING_SLOTS).map_err(map_err!(Table))?;
        let (start, end) = slot_range(deployment_id);
        let mut occupied = 0;
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            entry.map_err(map_err!(Read))?;
            occupied += 1;
        }
        Ok(occupied)
    }

    // ── Runs ───────────────────────────────────────────────────────

    fn load_run(&self, run_id: RunId) -> StateResult<Option<Run>> {
        let key = run_id.to_string();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let run: Run =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    fn insert_batch(&self, deployment_id: &str, runs: Vec<NewRun>) -> StateResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut inserted = 0;
        {
            let mut runs_table = txn.open_table(RUNS).map_err(map_err!(Table))?;
            let mut keys_table = txn.open_table(RUN_KEYS).map_err(map_err!(Table))?;
            for new_run in runs {
                let entry = run_key_entry(deployment_id, &new_run.idempotency_key);
                if keys_table
                    .get(entry.as_str())
                    .map_err(map_err!(Read))?
                    .is_some()
                {
                    trace!(%deployment_id, key = %new_run.idempotency_key, "run exists, skipped");
                    continue;
                }
                let run = new_run.into_run(deployment_id);
                let id = run.id.to_string();
                let value = serde_json::to_vec(&run).map_err(map_err!(Serialize))?;
                runs_table
                    .insert(id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                keys_table
                    .insert(entry.as_str(), id.as_str())
                    .map_err(map_err!(Write))?;
                inserted += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%deployment_id, inserted, "runs inserted");
        Ok(inserted)
    }

    fn existing_keys(&self, deployment_id: &str, keys: &[String]) -> StateResult<HashSet<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUN_KEYS).map_err(map_err!(Table))?;
        let mut found = HashSet::new();
        for key in keys {
            let entry = run_key_entry(deployment_id, key);
            if table.get(entry.as_str()).map_err(map_err!(Read))?.is_some() {
                found.insert(key.clone());
            }
        }
        Ok(found)
    }

    /// Read, validate and write back inside one write transaction. An
    /// illegal transition drops the transaction uncommitted.
    fn apply_transition(
        &self,
        run_id: RunId,
        expected: Expected,
        proposed: State,
    ) -> StateResult<Run> {
        let key = run_id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let run = {
            let mut table = txn.open_table(RUNS).map_err(map_err!(Table))?;
            let mut run: Run = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::RunNotFound(run_id)),
            };
            let from = run.state.kind;
            run.apply_if(&expected, proposed)?;
            if let Some(deployment_id) = &run.deployment_id {
                let mut slots = txn.open_table(RUNNING_SLOTS).map_err(map_err!(Table))?;
                let deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
                sync_slot(
                    &mut slots,
                    &deployments,
                    deployment_id,
                    &key,
                    Some(from),
                    run.state.kind,
                )?;
            }
            let value = serde_json::to_vec(&run).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            run
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%run_id, state = %run.state.kind, "transition committed");
        Ok(run)
    }

    fn select_runs(&self, filter: &RunFilter) -> StateResult<Vec<Run>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNS).map_err(map_err!(Table))?;
        let mut matched = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let run: Run = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if filter.matches(&run) {
                matched.push(run);
            }
        }
        matched.sort_by(|a, b| {
            a.scheduled_time
                .cmp(&b.scheduled_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(matched
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    /// The existence check and the insert share one write transaction, so
    /// concurrent creates with the same id yield a single run.
    fn insert_created(&self, request: RunCreate) -> StateResult<Run> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let run = {
            let mut table = txn.open_table(RUNS).map_err(map_err!(Table))?;
            if let Some(id) = request.id {
                let key = id.to_string();
                if let Some(guard) = table.get(key.as_str()).map_err(map_err!(Read))? {
                    let existing: Run =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    debug!(run_id = %id, "run already exists");
                    return Ok(existing);
                }
            }
            let run = request.into_run(Utc::now())?;
            let key = run.id.to_string();
            if let Some(deployment_id) = &run.deployment_id {
                let mut slots = txn.open_table(RUNNING_SLOTS).map_err(map_err!(Table))?;
                let deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
                sync_slot(
                    &mut slots,
                    &deployments,
                    deployment_id,
                    &key,
                    None,
                    run.state.kind,
                )?;
            }
            let value = serde_json::to_vec(&run).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            run
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(run_id = %run.id, state = %run.state.kind, "run created");
        Ok(run)
    }
}

/// Take or give back the concurrency slot of a run moving `from` -> `to`.
///
/// A slot is held while Running. Entering Running fails with
/// `ConcurrencyLimit` when the deployment's slots are all taken.
fn sync_slot(
    slots: &mut Table<'_, &'static str, &'static str>,
    deployments: &Table<'_, &'static str, &'static [u8]>,
    deployment_id: &str,
    run_id: &str,
    from: Option<StateType>,
    to: StateType,
) -> StateResult<()> {
    let was_running = from == Some(StateType::Running);
    let entry = slot_entry(deployment_id, run_id);
    if to == StateType::Running && !was_running {
        let limit = match deployments.get(deployment_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let deployment: Deployment =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                deployment.concurrency_limit
            }
            None => None,
        };
        if let Some(limit) = limit {
            let (start, end) = slot_range(deployment_id);
            let mut occupied = 0usize;
            for held in slots
                .range(start.as_str()..end.as_str())
                .map_err(map_err!(Read))?
            {
                held.map_err(map_err!(Read))?;
                occupied += 1;
            }
            if occupied >= limit as usize {
                debug!(%deployment_id, %run_id, limit, "concurrency limit reached");
                return Err(StateError::ConcurrencyLimit {
                    deployment_id: deployment_id.to_string(),
                    limit,
                });
            }
        }
        slots
            .insert(entry.as_str(), run_id)
            .map_err(map_err!(Write))?;
        trace!(%deployment_id, %run_id, "concurrency slot taken");
    } else if was_running && to != StateType::Running {
        slots.remove(entry.as_str()).map_err(map_err!(Write))?;
        trace!(%deployment_id, %run_id, "concurrency slot released");
    }
    Ok(())
}

#[async_trait]
impl RunStore for StateStore {
    async fn insert_runs(&self, deployment_id: &str, runs: Vec<NewRun>) -> StateResult<usize> {
        self.insert_batch(deployment_id, runs)
    }

    async fn find_existing(
        &self,
        deployment_id: &str,
        keys: &[String],
    ) -> StateResult<HashSet<String>> {
        self.existing_keys(deployment_id, keys)
    }

    async fn commit_transition(
        &self,
        run_id: RunId,
        expected: Expected,
        proposed: State,
    ) -> StateResult<Run> {
        self.apply_transition(run_id, expected, proposed)
    }

    async fn query_runs(&self, filter: &RunFilter) -> StateResult<Vec<Run>> {
        self.select_runs(filter)
    }

    async fn get_run(&self, run_id: RunId) -> StateResult<Option<Run>> {
        self.load_run(run_id)
    }

    async fn create_run(&self, request: RunCreate) -> StateResult<Run> {
        self.insert_created(request)
    }
}

#[async_trait]
impl DeploymentCatalog for StateStore {
    async fn list_schedulable(
        &self,
        page_token: Option<&str>,
        page_size: usize,
    ) -> StateResult<DeploymentPage> {
        self.schedulable_page(page_token, page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeDelta, TimeZone};
    use flowgrid_recurrence::ScheduleSpec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn scheduled_deployment(id: &str) -> Deployment {
        Deployment::new(id, format!("{id}-name"), t0())
            .with_schedule(ScheduleSpec::interval(3600).build().unwrap())
    }

    fn new_runs(deployment: &Deployment, hours: &[i64]) -> Vec<NewRun> {
        hours
            .iter()
            .map(|h| NewRun::scheduled(deployment, t0() + TimeDelta::hours(*h), t0()))
            .collect()
    }

    // ── Deployments ────────────────────────────────────────────────

    #[test]
    fn deployment_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let deployment = scheduled_deployment("etl");
        store.put_deployment(&deployment).unwrap();

        assert_eq!(store.get_deployment("etl").unwrap(), Some(deployment));
        assert!(store.get_deployment("missing").unwrap().is_none());
    }

    #[tokio::test]
    async fn list_schedulable_pages_by_id() {
        let store = StateStore::open_in_memory().unwrap();
        for id in ["a", "b", "c", "d", "e"] {
            store.put_deployment(&scheduled_deployment(id)).unwrap();
        }
        let mut paused = scheduled_deployment("bb");
        paused.paused = true;
        store.put_deployment(&paused).unwrap();
        store
            .put_deployment(&Deployment::new("cc", "no schedule", t0()))
            .unwrap();

        let first = store.list_schedulable(None, 2).await.unwrap();
        let ids: Vec<_> = first.deployments.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(first.next_page_token.as_deref(), Some("b"));

        let second = store.list_schedulable(Some("b"), 2).await.unwrap();
        let ids: Vec<_> = second.deployments.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d"]);

        let third = store.list_schedulable(Some("d"), 2).await.unwrap();
        assert_eq!(third.deployments.len(), 1);
        assert!(third.next_page_token.is_none());

        // A token that is not itself a stored id starts after its sort position.
        let between = store.list_schedulable(Some("bz"), 10).await.unwrap();
        let ids: Vec<_> = between.deployments.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "e"]);
    }

    // ── Runs ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_runs_skips_existing_keys() {
        let store = StateStore::open_in_memory().unwrap();
        let deployment = scheduled_deployment("etl");

        let inserted = store
            .insert_runs("etl", new_runs(&deployment, &[1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(inserted, 3);

        let inserted = store
            .insert_runs("etl", new_runs(&deployment, &[3, 4]))
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let runs = store
            .query_runs(&RunFilter::default().for_deployment("etl"))
            .await
            .unwrap();
        assert_eq!(runs.len(), 4);
        assert!(runs.iter().all(|r| r.state_type() == StateType::Scheduled));
        assert!(runs.windows(2).all(|w| w[0].scheduled_time < w[1].scheduled_time));
    }

    #[tokio::test]
    async fn find_existing_is_scoped_to_deployment() {
        let store = StateStore::open_in_memory().unwrap();
        let etl = scheduled_deployment("etl");
        store.insert_runs("etl", new_runs(&etl, &[1])).await.unwrap();

        let key = idempotency_key("etl", t0() + TimeDelta::hours(1));
        let other = idempotency_key("etl", t0() + TimeDelta::hours(2));
        let found = store
            .find_existing("etl", &[key.clone(), other])
            .await
            .unwrap();
        assert_eq!(found, HashSet::from([key.clone()]));

        let found = store.find_existing("report", &[key]).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn commit_transition_appends_history() {
        let store = StateStore::open_in_memory().unwrap();
        let run = store.create_run(RunCreate::default()).await.unwrap();

        let updated = store
            .commit_transition(run.id, Expected::any(), State::new(StateType::Running, Utc::now()))
            .await
            .unwrap();
        assert_eq!(updated.state_type(), StateType::Running);
        assert_eq!(updated.history.len(), 1);

        let stored = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored, updated);
    }

    #[tokio::test]
    async fn illegal_transition_is_not_persisted() {
        let store = StateStore::open_in_memory().unwrap();
        let run = store.create_run(RunCreate::default()).await.unwrap();

        let err = store
            .commit_transition(
                run.id,
                Expected::any(),
                State::new(StateType::Completed, Utc::now()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition { .. }));
        assert_eq!(store.get_run(run.id).await.unwrap(), Some(run));
    }

    #[tokio::test]
    async fn transition_of_unknown_run_fails() {
        let store = StateStore::open_in_memory().unwrap();
        let id = uuid::Uuid::new_v4();
        let err = store
            .commit_transition(id, Expected::any(), State::new(StateType::Running, Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::RunNotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn transition_from_a_stale_state_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let run = store
            .create_run(RunCreate {
                state: Some(State::new(StateType::Running, t0())),
                ..Default::default()
            })
            .await
            .unwrap();
        let paused = store
            .commit_transition(
                run.id,
                Expected::state(StateType::Running),
                State::paused_until(t0(), t0() + TimeDelta::minutes(5)),
            )
            .await
            .unwrap();
        let resumed = store
            .commit_transition(
                run.id,
                Expected::any(),
                State::new(StateType::Running, t0() + TimeDelta::minutes(1)),
            )
            .await
            .unwrap();
        assert_eq!(resumed.history.len(), paused.history.len() + 1);

        // A reader that saw the pause tries to fail the run.
        let err = store
            .commit_transition(
                run.id,
                Expected::state(StateType::Paused)
                    .pause_expired_by(t0() + TimeDelta::hours(1)),
                State::new(StateType::Failed, t0() + TimeDelta::hours(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::IllegalTransition {
                from: Some(StateType::Running),
                to: StateType::Failed,
                ..
            }
        ));
        assert_eq!(store.get_run(run.id).await.unwrap(), Some(resumed));
    }

    #[tokio::test]
    async fn pause_deadline_is_rechecked_on_commit() {
        let store = StateStore::open_in_memory().unwrap();
        let run = store
            .create_run(RunCreate {
                state: Some(State::new(StateType::Running, t0())),
                ..Default::default()
            })
            .await
            .unwrap();
        let deadline = t0() + TimeDelta::minutes(30);
        let paused = store
            .commit_transition(run.id, Expected::any(), State::paused_until(t0(), deadline))
            .await
            .unwrap();

        let early =
            Expected::state(StateType::Paused).pause_expired_by(deadline - TimeDelta::minutes(1));
        let err = store
            .commit_transition(run.id, early, State::new(StateType::Failed, deadline))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition { .. }));
        assert_eq!(store.get_run(run.id).await.unwrap(), Some(paused));

        let due = Expected::state(StateType::Paused).pause_expired_by(deadline);
        let failed = store
            .commit_transition(run.id, due, State::new(StateType::Failed, deadline))
            .await
            .unwrap();
        assert_eq!(failed.state_type(), StateType::Failed);
    }

    #[tokio::test]
    async fn concurrency_limit_is_enforced_on_entering_running() {
        let store = StateStore::open_in_memory().unwrap();
        let mut deployment = scheduled_deployment("etl");
        deployment.concurrency_limit = Some(1);
        store.put_deployment(&deployment).unwrap();
        let pending = || RunCreate {
            deployment_id: Some("etl".into()),
            ..Default::default()
        };
        let first = store.create_run(pending()).await.unwrap();
        let second = store.create_run(pending()).await.unwrap();

        let running = State::new(StateType::Running, t0());
        store
            .commit_transition(first.id, Expected::any(), running.clone())
            .await
            .unwrap();
        assert_eq!(store.occupied_slots("etl").unwrap(), 1);

        let err = store
            .commit_transition(second.id, Expected::any(), running.clone())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::ConcurrencyLimit { ref deployment_id, limit: 1 } if deployment_id == "etl"
        ));
        assert_eq!(store.get_run(second.id).await.unwrap(), Some(second.clone()));

        // Creating straight into Running takes a slot too.
        let err = store
            .create_run(RunCreate {
                state: Some(running.clone()),
                ..pending()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::ConcurrencyLimit { .. }));

        let later = t0() + TimeDelta::minutes(1);
        store
            .commit_transition(
                first.id,
                Expected::any(),
                State::paused_until(later, later + TimeDelta::hours(1)),
            )
            .await
            .unwrap();
        assert_eq!(store.occupied_slots("etl").unwrap(), 0);

        store
            .commit_transition(second.id, Expected::any(), running.clone())
            .await
            .unwrap();
        store
            .commit_transition(second.id, Expected::any(), State::new(StateType::Completed, later))
            .await
            .unwrap();
        assert_eq!(store.occupied_slots("etl").unwrap(), 0);

        store
            .commit_transition(first.id, Expected::any(), State::new(StateType::Running, later))
            .await
            .unwrap();
        assert_eq!(store.occupied_slots("etl").unwrap(), 1);
        // Slots are counted per deployment.
        assert_eq!(store.occupied_slots("et").unwrap(), 0);
    }

    #[tokio::test]
    async fn runs_without_a_limit_take_unbounded_slots() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&scheduled_deployment("etl")).unwrap();
        for _ in 0..3 {
            store
                .create_run(RunCreate {
                    deployment_id: Some("etl".into()),
                    state: Some(State::new(StateType::Running, t0())),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        assert_eq!(store.occupied_slots("etl").unwrap(), 3);
    }

    #[tokio::test]
    async fn create_run_with_known_id_returns_existing() {
        let store = StateStore::open_in_memory().unwrap();
        let first = store.create_run(RunCreate::default()).await.unwrap();
        let again = store
            .create_run(RunCreate {
                id: Some(first.id),
                name: Some("other".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(again, first);
    }

    #[tokio::test]
    async fn recreating_a_progressed_run_keeps_its_state() {
        let store = StateStore::open_in_memory().unwrap();
        let created = store.create_run(RunCreate::default()).await.unwrap();
        let running = store
            .commit_transition(created.id, Expected::any(), State::new(StateType::Running, t0()))
            .await
            .unwrap();

        let again = store
            .create_run(RunCreate {
                id: Some(created.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(again, running);
        assert_eq!(again.history.len(), 1);
        assert_eq!(store.get_run(created.id).await.unwrap(), Some(running));
    }

    #[tokio::test]
    async fn query_runs_filters_and_pages() {
        let store = StateStore::open_in_memory().unwrap();
        let deployment = scheduled_deployment("etl");
        store
            .insert_runs("etl", new_runs(&deployment, &[1, 2, 3, 4, 5]))
            .await
            .unwrap();

        let before = RunFilter::in_states([StateType::Scheduled])
            .scheduled_before(t0() + TimeDelta::hours(4));
        assert_eq!(store.query_runs(&before).await.unwrap().len(), 3);

        let page = store
            .query_runs(&before.clone().page(2, 2))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].scheduled_time, t0() + TimeDelta::hours(3));

        let none = RunFilter::in_states([StateType::Running]);
        assert!(store.query_runs(&none).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn query_runs_by_parent() {
        let store = StateStore::open_in_memory().unwrap();
        let parent = store.create_run(RunCreate::default()).await.unwrap();
        for key in ["a", "b"] {
            store
                .create_run(RunCreate {
                    parent_run_id: Some(parent.id),
                    task_key: Some(key.into()),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let children = store
            .query_runs(&RunFilter::default().children_of(parent.id))
            .await
            .unwrap();
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowgrid.redb");
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        let run_id = {
            let store = StateStore::open(&path).unwrap();
            store.put_deployment(&scheduled_deployment("etl")).unwrap();
            rt.block_on(store.create_run(RunCreate::default()))
                .unwrap()
                .id
        };

        let store = StateStore::open(&path).unwrap();
        assert!(store.get_deployment("etl").unwrap().is_some());
        assert!(rt.block_on(store.get_run(run_id)).unwrap().is_some());
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_deployments().unwrap().is_empty());
        assert!(store.select_runs(&RunFilter::default()).unwrap().is_empty());
    }
}
