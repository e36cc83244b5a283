//! Storage seams used by the scheduler, lifecycle and housekeeping crates.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StateResult;
use crate::types::{DeploymentPage, Expected, NewRun, Run, RunCreate, RunFilter, RunId, State};

/// Persistent run storage.
///
/// Implementations must keep idempotency keys unique per deployment and must
/// validate and apply a transition inside a single write transaction.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert runs in one transaction. Runs whose idempotency key already
    /// exists for the deployment are skipped. Returns how many were inserted.
    async fn insert_runs(&self, deployment_id: &str, runs: Vec<NewRun>) -> StateResult<usize>;

    /// The subset of `keys` already present for the deployment.
    async fn find_existing(
        &self,
        deployment_id: &str,
        keys: &[String],
    ) -> StateResult<HashSet<String>>;

    /// Validate `proposed` against the run's current state and apply it.
    ///
    /// A current state that no longer matches `expected` is rejected as an
    /// illegal transition, checked in the same transaction as the write.
    async fn commit_transition(
        &self,
        run_id: RunId,
        expected: Expected,
        proposed: State,
    ) -> StateResult<Run>;

    /// One page of runs matching `filter`.
    async fn query_runs(&self, filter: &RunFilter) -> StateResult<Vec<Run>>;

    async fn get_run(&self, run_id: RunId) -> StateResult<Option<Run>>;

    /// Create a run from a direct request. An existing run with the same id
    /// is returned unchanged.
    async fn create_run(&self, request: RunCreate) -> StateResult<Run>;
}

/// Read access to deployments.
#[async_trait]
pub trait DeploymentCatalog: Send + Sync {
    /// Schedulable deployments ordered by id, starting after `page_token`.
    async fn list_schedulable(
        &self,
        page_token: Option<&str>,
        page_size: usize,
    ) -> StateResult<DeploymentPage>;
}

#[async_trait]
impl<T: RunStore + ?Sized> RunStore for Arc<T> {
    async fn insert_runs(&self, deployment_id: &str, runs: Vec<NewRun>) -> StateResult<usize> {
        (**self).insert_runs(deployment_id, runs).await
    }

    async fn find_existing(
        &self,
        deployment_id: &str,
        keys: &[String],
    ) -> StateResult<HashSet<String>> {
        (**self).find_existing(deployment_id, keys).await
    }

    async fn commit_transition(
        &self,
        run_id: RunId,
        expected: Expected,
        proposed: State,
    ) -> StateResult<Run> {
        (**self).commit_transition(run_id, expected, proposed).await
    }

    async fn query_runs(&self, filter: &RunFilter) -> StateResult<Vec<Run>> {
        (**self).query_runs(filter).await
    }

    async fn get_run(&self, run_id: RunId) -> StateResult<Option<Run>> {
        (**self).get_run(run_id).await
    }

    async fn create_run(&self, request: RunCreate) -> StateResult<Run> {
        (**self).create_run(request).await
    }
}
