//! State handlers and the pending guard

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::entity::{ProcessState, StatefulEntity};

/// What a handler decided for the entity it was given
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome<S> {
    /// Move to the given state (must be a legal edge)
    Transition(S),
    /// Transient failure, try again later in the same state
    Retry(String),
    /// Unrecoverable, move to the failure state now
    Fatal(String),
}

impl<S: ProcessState> StepOutcome<S> {
    pub fn retry(reason: impl Into<String>) -> Self {
        StepOutcome::Retry(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        StepOutcome::Fatal(reason.into())
    }
}

/// Work for one state of one process
///
/// The handler owns the entity for the duration of the call and may mutate
/// it; mutations are persisted only when it returns `Ok`.
#[async_trait]
pub trait StateHandler<T: StatefulEntity>: Send + Sync {
    async fn handle(&self, entity: &mut T) -> anyhow::Result<StepOutcome<T::State>>;
}

pub type HandlerFuture<'a, S> =
    Pin<Box<dyn Future<Output = anyhow::Result<StepOutcome<S>>> + Send + 'a>>;

/// Adapts a plain function plus a shared context into a [`StateHandler`]
pub struct FnHandler<C, T: StatefulEntity> {
    ctx: Arc<C>,
    f: for<'a> fn(&'a C, &'a mut T) -> HandlerFuture<'a, T::State>,
}

impl<C, T: StatefulEntity> FnHandler<C, T> {
    pub fn new(ctx: Arc<C>, f: for<'a> fn(&'a C, &'a mut T) -> HandlerFuture<'a, T::State>) -> Self {
        Self { ctx, f }
    }
}

#[async_trait]
impl<C, T> StateHandler<T> for FnHandler<C, T>
where
    C: Send + Sync + 'static,
    T: StatefulEntity,
{
    async fn handle(&self, entity: &mut T) -> anyhow::Result<StepOutcome<T::State>> {
        (self.f)(&self.ctx, entity).await
    }
}

/// Decides whether an entity must wait for an external event before its
/// handler may run
pub trait PendingGuard<T>: Send + Sync {
    fn is_pending(&self, entity: &T) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NeverPending;

impl<T> PendingGuard<T> for NeverPending {
    fn is_pending(&self, _entity: &T) -> bool {
        false
    }
}

impl<T, F> PendingGuard<T> for F
where
    F: Fn(&T) -> bool + Send + Sync,
{
    fn is_pending(&self, entity: &T) -> bool {
        self(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::fixtures::{Job, JobState};

    struct Ctx {
        suffix: &'static str,
    }

    fn relabel<'a>(ctx: &'a Ctx, job: &'a mut Job) -> HandlerFuture<'a, JobState> {
        Box::pin(async move {
            job.label.push_str(ctx.suffix);
            Ok(StepOutcome::Transition(JobState::Running))
        })
    }

    #[tokio::test]
    async fn test_fn_handler_runs_with_context() {
        let handler = FnHandler::new(Arc::new(Ctx { suffix: "-x" }), relabel);
        let mut job = Job::new("a", JobState::Queued, 0);

        let outcome = handler.handle(&mut job).await.unwrap();

        assert_eq!(outcome, StepOutcome::Transition(JobState::Running));
        assert_eq!(job.label, "a-x");
    }

    #[test]
    fn test_closure_guard() {
        let guard = |job: &Job| job.label == "wait";
        assert!(guard.is_pending(&Job::new("wait", JobState::Queued, 0)));
        assert!(!guard.is_pending(&Job::new("go", JobState::Queued, 0)));
        assert!(!PendingGuard::<Job>::is_pending(
            &NeverPending,
            &Job::new("wait", JobState::Queued, 0)
        ));
    }
}
