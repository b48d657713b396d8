//! Lease-respecting command executor
//!
//! Services mutate entities outside the manager loop (inbound protocol
//! messages, user commands). They take the lease first, exactly like a
//! manager claim, so a command and a handler never race on one entity.
//! A command that finds the entity leased returns `Busy`; callers retry
//! later and never bypass the lease.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::error::EngineError;
use super::graph::StateGraph;
use crate::clock::Clock;
use crate::entity::{EntityId, StatefulEntity};
use crate::events::{EventPublisher, ProcessEvent};
use crate::store::{EntityStore, StoreError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("Entity {0} is busy, retry later")]
    Busy(EntityId),

    #[error("Entity not found: {0}")]
    NotFound(EntityId),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Busy(_) => "BUSY",
            CommandError::NotFound(_) => "NOT_FOUND",
            CommandError::Engine(e) => e.code(),
        }
    }
}

impl From<StoreError> for CommandError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => CommandError::NotFound(id),
            StoreError::LeaseConflict { id, .. } => CommandError::Busy(id),
            other => CommandError::Engine(EngineError::Store(other)),
        }
    }
}

/// Picks the graph governing an entity, e.g. by its role
pub type GraphSelector<T> = fn(&T) -> Arc<StateGraph<<T as StatefulEntity>::State>>;

pub struct CommandExecutor<T: StatefulEntity> {
    store: Arc<dyn EntityStore<T>>,
    graph_of: GraphSelector<T>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventPublisher>,
    holder: String,
    lease_duration: Duration,
}

impl<T: StatefulEntity> CommandExecutor<T> {
    pub fn new(
        store: Arc<dyn EntityStore<T>>,
        graph_of: GraphSelector<T>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventPublisher>,
        participant: &str,
    ) -> Self {
        Self {
            store,
            graph_of,
            clock,
            events,
            holder: format!("{participant}-svc-{}", ulid::Ulid::new()),
            lease_duration: Duration::from_secs(10),
        }
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn store(&self) -> &Arc<dyn EntityStore<T>> {
        &self.store
    }

    /// Persist a new entity; no lease is needed before anyone else knows it
    pub async fn create(&self, entity: T) -> Result<EntityId, CommandError> {
        let id = entity.id();
        if self.store.find(&id).await?.is_some() {
            return Err(EngineError::Store(StoreError::AlreadyExists(id)).into());
        }
        let graph = (self.graph_of)(&entity);
        let state = graph.state_of(&entity)?;
        self.store.upsert(entity.clone()).await?;
        if graph.is_announced(state) {
            self.announce(&entity, state);
        }
        debug!(entity_id = %id, kind = T::KIND, state = %state, "Entity created");
        Ok(id)
    }

    /// Lease, load, mutate, save and release
    ///
    /// `mutate` gets the entity, its graph and the current time. Its changes
    /// are persisted only when it returns `Ok`; the lease is released either
    /// way.
    pub async fn execute<R, E, F>(&self, id: &EntityId, mutate: F) -> Result<R, E>
    where
        F: FnOnce(&mut T, &StateGraph<T::State>, i64) -> Result<R, E> + Send,
        E: From<CommandError>,
    {
        let now = self.clock.now_millis();
        self.store
            .acquire_lease(id, &self.holder, self.lease_duration, now)
            .await
            .map_err(CommandError::from)?;

        let entity = match self.store.find(id).await {
            Ok(Some(entity)) => entity,
            Ok(None) => {
                self.release(id).await;
                return Err(CommandError::NotFound(*id).into());
            }
            Err(e) => {
                self.release(id).await;
                return Err(CommandError::from(e).into());
            }
        };

        let graph = (self.graph_of)(&entity);
        let before = entity.state();
        let mut working = entity;
        let result = match mutate(&mut working, graph.as_ref(), now) {
            Ok(r) => r,
            Err(e) => {
                self.release(id).await;
                return Err(e);
            }
        };

        if let Err(e) = self.store.save_and_release(working.clone(), &self.holder).await {
            self.release(id).await;
            return Err(CommandError::from(e).into());
        }

        if let (Some(from), Some(to)) = (before, working.state())
            && from != to
            && graph.is_announced(to)
        {
            self.announce(&working, from);
        }
        Ok(result)
    }

    fn announce(&self, entity: &T, from: T::State) {
        let event = ProcessEvent::for_entity(
            &self.holder,
            entity,
            from,
            false,
            entity.meta().updated_at,
        );
        if let Err(e) = self.events.publish(event) {
            warn!(entity_id = %entity.id(), error = %e, "Event publish failed");
        }
    }

    async fn release(&self, id: &EntityId) {
        if let Err(e) = self.store.release_lease(id, &self.holder).await {
            warn!(entity_id = %id, error = %e, "Lease release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entity::fixtures::{Job, JobState};
    use crate::events::NoopEventPublisher;
    use crate::store::InMemoryEntityStore;
    use std::sync::LazyLock;

    static GRAPH: LazyLock<Arc<StateGraph<JobState>>> = LazyLock::new(|| {
        Arc::new(
            StateGraph::new(
                "job",
                JobState::Queued,
                &[JobState::Done, JobState::Failed],
                &[
                    (JobState::Queued, JobState::Running),
                    (JobState::Running, JobState::Done),
                ],
            )
            .with_escape_to(&[JobState::Failed]),
        )
    });

    fn graph_of(_job: &Job) -> Arc<StateGraph<JobState>> {
        GRAPH.clone()
    }

    fn executor() -> (Arc<InMemoryEntityStore<Job>>, CommandExecutor<Job>) {
        let clock = Arc::new(ManualClock::new(500));
        let store = Arc::new(InMemoryEntityStore::with_clock(clock.clone()));
        let exec = CommandExecutor::new(
            store.clone(),
            graph_of,
            clock,
            Arc::new(NoopEventPublisher),
            "p1",
        );
        (store, exec)
    }

    #[tokio::test]
    async fn test_execute_transitions_and_releases() {
        let (store, exec) = executor();
        let id = exec.create(Job::new("j", JobState::Queued, 0)).await.unwrap();

        exec.execute(&id, |job: &mut Job, graph, now| {
            graph.apply(job, JobState::Running, now)?;
            Ok::<_, CommandError>(())
        })
        .await
        .unwrap();

        let job = store.find(&id).await.unwrap().unwrap();
        assert_eq!(job.state(), Some(JobState::Running));
        assert_eq!(job.meta.state_timestamp, 500);
        assert!(job.meta.lease.is_none());
    }

    #[tokio::test]
    async fn test_execute_busy_under_foreign_lease() {
        let (store, exec) = executor();
        let id = exec.create(Job::new("j", JobState::Queued, 0)).await.unwrap();
        store
            .acquire_lease(&id, "manager", Duration::from_secs(30), 500)
            .await
            .unwrap();

        let err = exec
            .execute(&id, |_job: &mut Job, _graph, _now| Ok::<_, CommandError>(()))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::Busy(id));
        assert_eq!(err.code(), "BUSY");
        // the foreign lease is untouched
        let job = store.find(&id).await.unwrap().unwrap();
        assert_eq!(job.meta.lease.unwrap().holder, "manager");
    }

    #[tokio::test]
    async fn test_failed_mutation_is_discarded_and_lease_released() {
        let (store, exec) = executor();
        let id = exec.create(Job::new("j", JobState::Queued, 0)).await.unwrap();

        let err = exec
            .execute(&id, |job: &mut Job, graph, now| {
                job.label = "changed".into();
                graph.apply(job, JobState::Done, now)?;
                Ok::<_, CommandError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ILLEGAL_TRANSITION");

        let job = store.find(&id).await.unwrap().unwrap();
        assert_eq!(job.label, "j");
        assert!(job.meta.lease.is_none());
    }

    #[tokio::test]
    async fn test_missing_and_duplicate() {
        let (_store, exec) = executor();
        let missing = EntityId::new();
        let err = exec
            .execute(&missing, |_job: &mut Job, _graph, _now| Ok::<_, CommandError>(()))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::NotFound(missing));

        let job = Job::new("j", JobState::Queued, 0);
        exec.create(job.clone()).await.unwrap();
        assert!(exec.create(job).await.is_err());
    }
}
