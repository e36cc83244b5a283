//! Post-commit transition hooks.

use async_trait::async_trait;
use flowgrid_state::{Run, StateType};

/// Called after a transition has been committed.
///
/// An error is reported but never undoes the transition.
#[async_trait]
pub trait TransitionHook: Send + Sync {
    fn name(&self) -> &str;

    /// `previous` is `None` for runs that were just created.
    async fn after_commit(&self, previous: Option<StateType>, run: &Run) -> anyhow::Result<()>;
}
