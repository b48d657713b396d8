//! State Machine Manager
//!
//! Drives the entities of one process role through their graph. One tick:
//!
//! 1. per actionable state, claim a batch of due entities (claim = lease)
//! 2. park entities the pending guard holds back
//! 3. run the state handler, bounded parallelism within the batch
//! 4. write back the outcome and release the lease in one store call
//!
//! Handler errors and panics never escape a tick. They become a retry with
//! the capped backoff, and the handler's mutations are discarded.

use futures::{FutureExt, StreamExt, stream};
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::EngineError;
use super::graph::StateGraph;
use super::handler::{NeverPending, PendingGuard, StateHandler, StepOutcome};
use super::retry::RetryPolicy;
use crate::clock::{Clock, SystemClock, duration_millis};
use crate::entity::{EntityId, ProcessState, StatefulEntity};
use crate::events::{EventPublisher, NoopEventPublisher, ProcessEvent};
use crate::store::{ClaimRequest, Criterion, EntityStore};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Entities claimed per state per tick
    pub batch_size: usize,
    /// Pause between ticks
    pub iteration_wait: Duration,
    pub lease_duration: Duration,
    /// Handlers running concurrently within one batch; 1 = sequential
    pub parallelism: usize,
    pub retry: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            iteration_wait: Duration::from_secs(1),
            lease_duration: Duration::from_secs(60),
            parallelism: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Handlers, guard and claim filter of one process role
pub struct StateMachine<T: StatefulEntity> {
    name: String,
    graph: Arc<StateGraph<T::State>>,
    failure_state: T::State,
    handlers: HashMap<T::State, Arc<dyn StateHandler<T>>>,
    guard: Arc<dyn PendingGuard<T>>,
    filter: Vec<Criterion>,
}

impl<T: StatefulEntity> StateMachine<T> {
    pub fn new(
        name: impl Into<String>,
        graph: Arc<StateGraph<T::State>>,
        failure_state: T::State,
    ) -> Result<Self, EngineError> {
        if !graph.is_terminal(failure_state) {
            return Err(EngineError::Registration(format!(
                "failure state {failure_state} is not terminal"
            )));
        }
        Ok(Self {
            name: name.into(),
            graph,
            failure_state,
            handlers: HashMap::new(),
            guard: Arc::new(NeverPending),
            filter: Vec::new(),
        })
    }

    /// Register the handler for `state`
    pub fn on(
        mut self,
        state: T::State,
        handler: impl StateHandler<T> + 'static,
    ) -> Result<Self, EngineError> {
        if self.graph.is_terminal(state) {
            return Err(EngineError::Registration(format!(
                "{}: terminal state {state} cannot have a handler",
                self.name
            )));
        }
        if self.handlers.insert(state, Arc::new(handler)).is_some() {
            return Err(EngineError::Registration(format!(
                "{}: duplicate handler for {state}",
                self.name
            )));
        }
        Ok(self)
    }

    pub fn with_guard(mut self, guard: impl PendingGuard<T> + 'static) -> Self {
        self.guard = Arc::new(guard);
        self
    }

    /// Restrict claims to entities matching `filter`, e.g. one role
    pub fn with_filter(mut self, filter: Vec<Criterion>) -> Self {
        self.filter = filter;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &Arc<StateGraph<T::State>> {
        &self.graph
    }

    pub fn failure_state(&self) -> T::State {
        self.failure_state
    }

    /// States with a handler, in code order
    pub fn actionable_states(&self) -> Vec<T::State> {
        T::State::all()
            .iter()
            .copied()
            .filter(|s| self.handlers.contains_key(s))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Transitioned,
    Retried,
    Failed,
    Parked,
    /// Outcome computed but the write-back failed; the lease was released
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord<S> {
    pub id: EntityId,
    pub from: S,
    pub to: S,
    pub kind: StepKind,
}

/// What one tick did
#[derive(Debug, Clone)]
pub struct TickReport<S> {
    pub steps: Vec<StepRecord<S>>,
}

impl<S> Default for TickReport<S> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<S: Copy> TickReport<S> {
    pub fn claimed(&self) -> usize {
        self.steps.len()
    }

    pub fn count(&self, kind: StepKind) -> usize {
        self.steps.iter().filter(|s| s.kind == kind).count()
    }

    /// Edges actually taken and persisted
    pub fn edges(&self) -> impl Iterator<Item = (S, S)> + '_ {
        self.steps
            .iter()
            .filter(|s| matches!(s.kind, StepKind::Transitioned | StepKind::Failed))
            .map(|s| (s.from, s.to))
    }
}

enum Disposition<S> {
    Handled(StepOutcome<S>),
    Unexpected(String),
}

struct Runner {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct StateMachineManager<T: StatefulEntity> {
    machine: Arc<StateMachine<T>>,
    store: Arc<dyn EntityStore<T>>,
    config: ManagerConfig,
    holder: String,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventPublisher>,
    runner: Mutex<Option<Runner>>,
}

impl<T: StatefulEntity> StateMachineManager<T> {
    pub fn new(
        machine: StateMachine<T>,
        store: Arc<dyn EntityStore<T>>,
        config: ManagerConfig,
        participant: &str,
    ) -> Self {
        let holder = format!("{participant}-{}-{}", machine.name, ulid::Ulid::new());
        Self {
            machine: Arc::new(machine),
            store,
            config,
            holder,
            clock: Arc::new(SystemClock),
            events: Arc::new(NoopEventPublisher),
            runner: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Lease holder id used for every claim of this manager
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn machine(&self) -> &StateMachine<T> {
        &self.machine
    }

    pub fn is_running(&self) -> bool {
        self.runner.lock().map(|r| r.is_some()).unwrap_or(false)
    }

    /// Spawn the polling loop; a second call while running is a no-op
    pub fn start(self: &Arc<Self>) {
        let Ok(mut runner) = self.runner.lock() else {
            error!(machine = %self.machine.name, "Runner lock poisoned, not starting");
            return;
        };
        if runner.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!(
                machine = %manager.machine.name,
                holder = %manager.holder,
                batch_size = manager.config.batch_size,
                iteration_wait_ms = manager.config.iteration_wait.as_millis() as u64,
                "State machine manager started"
            );
            loop {
                let report = manager.tick().await;
                if report.claimed() > 0 {
                    debug!(
                        machine = %manager.machine.name,
                        claimed = report.claimed(),
                        transitioned = report.count(StepKind::Transitioned),
                        retried = report.count(StepKind::Retried),
                        failed = report.count(StepKind::Failed),
                        "Tick complete"
                    );
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(manager.config.iteration_wait) => {}
                }
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            info!(machine = %manager.machine.name, "State machine manager stopped");
        });

        *runner = Some(Runner { shutdown, handle });
    }

    /// Signal the loop and wait for the in-flight tick to finish
    pub async fn stop(&self) {
        let runner = match self.runner.lock() {
            Ok(mut r) => r.take(),
            Err(_) => None,
        };
        if let Some(runner) = runner {
            let _ = runner.shutdown.send(true);
            if let Err(e) = runner.handle.await {
                error!(machine = %self.machine.name, error = %e, "Manager task ended abnormally");
            }
        }
    }

    /// Run exactly one iteration over every actionable state
    ///
    /// States are claimed in code order, so an entity released into a later
    /// state is picked up again within the same tick.
    pub async fn tick(&self) -> TickReport<T::State> {
        let mut report = TickReport::default();
        let parallelism = self.config.parallelism.max(1);

        for state in self.machine.actionable_states() {
            let claim = ClaimRequest {
                state: state.code(),
                filter: &self.machine.filter,
                max: self.config.batch_size,
                holder: &self.holder,
                lease_duration: self.config.lease_duration,
                now: self.clock.now_millis(),
            };
            let batch = match self.store.next_not_leased(&claim).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(
                        machine = %self.machine.name,
                        state = %state,
                        error = %e,
                        "Claim failed"
                    );
                    continue;
                }
            };
            if batch.is_empty() {
                continue;
            }

            let steps: Vec<StepRecord<T::State>> = stream::iter(batch)
                .map(|entity| self.process(state, entity))
                .buffer_unordered(parallelism)
                .collect()
                .await;
            report.steps.extend(steps);
        }
        report
    }

    async fn process(&self, from: T::State, entity: T) -> StepRecord<T::State> {
        let id = entity.id();

        if self.machine.guard.is_pending(&entity) {
            let mut parked = entity;
            let meta = parked.meta_mut();
            meta.pending = true;
            meta.updated_at = self.clock.now_millis();
            debug!(machine = %self.machine.name, entity_id = %id, state = %from, "Entity parked as pending");
            return self.write_back(parked, from, from, StepKind::Parked).await;
        }

        let Some(handler) = self.machine.handlers.get(&from).cloned() else {
            self.release(&id).await;
            return StepRecord {
                id,
                from,
                to: from,
                kind: StepKind::Abandoned,
            };
        };

        let mut working = entity.clone();
        let result = AssertUnwindSafe(handler.handle(&mut working))
            .catch_unwind()
            .await;

        let (subject, disposition) = match result {
            Ok(Ok(outcome)) => (working, Disposition::Handled(outcome)),
            Ok(Err(e)) => {
                error!(
                    machine = %self.machine.name,
                    entity_id = %id,
                    state = %from,
                    error = %e,
                    "Handler failed"
                );
                (entity, Disposition::Unexpected(format!("{e:#}")))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    machine = %self.machine.name,
                    entity_id = %id,
                    state = %from,
                    panic = %message,
                    "Handler panicked"
                );
                (entity, Disposition::Unexpected(format!("handler panicked: {message}")))
            }
        };

        let now = self.clock.now_millis();
        match disposition {
            Disposition::Handled(StepOutcome::Transition(next)) => {
                let mut subject = subject;
                match self.machine.graph.apply(&mut subject, next, now) {
                    Ok(_) => {
                        info!(
                            machine = %self.machine.name,
                            entity_id = %id,
                            from = %from,
                            to = %next,
                            "Transitioned"
                        );
                        self.write_back(subject, from, next, StepKind::Transitioned)
                            .await
                    }
                    Err(e) => {
                        error!(
                            machine = %self.machine.name,
                            entity_id = %id,
                            error = %e,
                            "Handler requested an illegal transition"
                        );
                        self.fail(subject, from, e.to_string(), now).await
                    }
                }
            }
            Disposition::Handled(StepOutcome::Retry(reason)) => {
                let attempt = subject.meta().retry_count.saturating_add(1);
                let delay = self.config.retry.backoff(attempt);
                self.retry(subject, from, reason, delay, now).await
            }
            Disposition::Unexpected(reason) => {
                let delay = self.config.retry.capped();
                self.retry(subject, from, reason, delay, now).await
            }
            Disposition::Handled(StepOutcome::Fatal(reason)) => {
                self.fail(subject, from, reason, now).await
            }
        }
    }

    async fn retry(
        &self,
        mut subject: T,
        from: T::State,
        reason: String,
        delay: Duration,
        now: i64,
    ) -> StepRecord<T::State> {
        let policy = &self.config.retry;
        let attempt = subject.meta().retry_count.saturating_add(1);

        if policy.is_exhausted(attempt) {
            let reason = format!("{reason} (gave up after {} retries)", policy.max_retries);
            let record = self.fail_in_place(&mut subject, from, reason, now);
            subject.meta_mut().retry_count = policy.max_retries;
            return self.write_back(subject, from, record.to, record.kind).await;
        }

        warn!(
            machine = %self.machine.name,
            entity_id = %subject.id(),
            state = %from,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Retry scheduled"
        );
        let meta = subject.meta_mut();
        meta.retry_count = attempt;
        meta.state_timestamp = now.saturating_add(duration_millis(delay));
        meta.error_detail = Some(reason);
        meta.updated_at = now;
        self.write_back(subject, from, from, StepKind::Retried).await
    }

    async fn fail(
        &self,
        mut subject: T,
        from: T::State,
        reason: String,
        now: i64,
    ) -> StepRecord<T::State> {
        let record = self.fail_in_place(&mut subject, from, reason, now);
        self.write_back(subject, from, record.to, record.kind).await
    }

    fn fail_in_place(
        &self,
        subject: &mut T,
        from: T::State,
        reason: String,
        now: i64,
    ) -> StepRecord<T::State> {
        let failure = self.machine.failure_state;
        error!(
            machine = %self.machine.name,
            entity_id = %subject.id(),
            from = %from,
            to = %failure,
            reason = %reason,
            "Process failed"
        );
        let meta = subject.meta_mut();
        meta.transition(failure.code(), now);
        meta.error_detail = Some(reason);
        StepRecord {
            id: subject.id(),
            from,
            to: failure,
            kind: StepKind::Failed,
        }
    }

    /// Persist, release, and announce
    async fn write_back(
        &self,
        subject: T,
        from: T::State,
        to: T::State,
        kind: StepKind,
    ) -> StepRecord<T::State> {
        let id = subject.id();
        let announce = match kind {
            StepKind::Failed => true,
            StepKind::Transitioned => self.machine.graph.is_announced(to),
            _ => false,
        };
        let event = announce.then(|| {
            ProcessEvent::for_entity(
                &self.machine.name,
                &subject,
                from,
                kind == StepKind::Failed,
                subject.meta().updated_at,
            )
        });

        if let Err(e) = self.store.save_and_release(subject, &self.holder).await {
            error!(
                machine = %self.machine.name,
                entity_id = %id,
                error = %e,
                "Write-back failed, outcome dropped"
            );
            self.release(&id).await;
            return StepRecord {
                id,
                from,
                to: from,
                kind: StepKind::Abandoned,
            };
        }

        if let Some(event) = event
            && let Err(e) = self.events.publish(event)
        {
            warn!(machine = %self.machine.name, entity_id = %id, error = %e, "Event publish failed");
        }
        StepRecord { id, from, to, kind }
    }

    async fn release(&self, id: &EntityId) {
        if let Err(e) = self.store.release_lease(id, &self.holder).await {
            warn!(machine = %self.machine.name, entity_id = %id, error = %e, "Lease release failed");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entity::fixtures::{Job, JobState};
    use crate::events::{BroadcastEventPublisher, PublishError};
    use crate::state_machine::handler::{FnHandler, HandlerFuture};
    use crate::store::{InMemoryEntityStore, StoreError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn graph() -> Arc<StateGraph<JobState>> {
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
            .with_escape_to(&[JobState::Failed])
            .with_announced(&[JobState::Done]),
        )
    }

    #[derive(Default)]
    struct Script {
        calls: AtomicUsize,
    }

    fn start<'a>(ctx: &'a Script, job: &'a mut Job) -> HandlerFuture<'a, JobState> {
        Box::pin(async move {
            ctx.calls.fetch_add(1, Ordering::SeqCst);
            match job.label.as_str() {
                "retry" => Ok(StepOutcome::retry("not yet")),
                "fatal" => Ok(StepOutcome::fatal("bad input")),
                "illegal" => Ok(StepOutcome::Transition(JobState::Done)),
                "error" => {
                    job.label = "mutated".into();
                    anyhow::bail!("connection reset")
                }
                "panic" => {
                    job.label = "mutated".into();
                    panic!("handler bug")
                }
                _ => {
                    job.label.push_str("+started");
                    Ok(StepOutcome::Transition(JobState::Running))
                }
            }
        })
    }

    fn finish<'a>(_ctx: &'a Script, _job: &'a mut Job) -> HandlerFuture<'a, JobState> {
        Box::pin(async move { Ok(StepOutcome::Transition(JobState::Done)) })
    }

    struct Fixture {
        store: Arc<InMemoryEntityStore<Job>>,
        clock: Arc<ManualClock>,
        script: Arc<Script>,
        manager: Arc<StateMachineManager<Job>>,
    }

    fn fixture_with(config: ManagerConfig, guard: Option<fn(&Job) -> bool>) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(InMemoryEntityStore::<Job>::with_clock(clock.clone()));
        let script = Arc::new(Script::default());
        let mut machine = StateMachine::new("jobs", graph(), JobState::Failed)
            .unwrap()
            .on(JobState::Queued, FnHandler::new(script.clone(), start))
            .unwrap()
            .on(JobState::Running, FnHandler::new(script.clone(), finish))
            .unwrap();
        if let Some(guard) = guard {
            machine = machine.with_guard(guard);
        }
        let manager = StateMachineManager::new(machine, store.clone(), config, "test")
            .with_clock(clock.clone());
        Fixture {
            store,
            clock,
            script,
            manager: Arc::new(manager),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            ManagerConfig {
                retry: RetryPolicy {
                    max_retries: 2,
                    base_delay: Duration::from_millis(100),
                    max_delay: Duration::from_millis(1_000),
                },
                ..ManagerConfig::default()
            },
            None,
        )
    }

    async fn add(f: &Fixture, label: &str) -> EntityId {
        let job = Job::new(label, JobState::Queued, f.clock.now_millis());
        let id = job.id();
        f.store.upsert(job).await.unwrap();
        id
    }

    async fn load(f: &Fixture, id: EntityId) -> Job {
        f.store.find(&id).await.unwrap().unwrap()
    }

    #[test]
    fn test_registration_rules() {
        let script = Arc::new(Script::default());
        assert!(StateMachine::<Job>::new("jobs", graph(), JobState::Running).is_err());

        let machine = StateMachine::<Job>::new("jobs", graph(), JobState::Failed).unwrap();
        assert!(
            machine
                .on(JobState::Done, FnHandler::new(script.clone(), finish))
                .is_err()
        );

        let machine = StateMachine::<Job>::new("jobs", graph(), JobState::Failed)
            .unwrap()
            .on(JobState::Queued, FnHandler::new(script.clone(), start))
            .unwrap();
        assert!(
            machine
                .on(JobState::Queued, FnHandler::new(script, start))
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_tick_walks_the_graph() {
        let f = fixture();
        let id = add(&f, "ok").await;

        // Queued is claimed before Running, so one tick walks both edges
        let first = f.manager.tick().await;
        let edges: Vec<_> = first.steps.iter().map(|s| (s.from, s.to)).collect();
        assert_eq!(
            edges,
            vec![
                (JobState::Queued, JobState::Running),
                (JobState::Running, JobState::Done)
            ]
        );
        let job = load(&f, id).await;
        assert_eq!(job.state(), Some(JobState::Done));
        assert_eq!(job.label, "ok+started");
        assert!(job.meta.lease.is_none());

        // terminal states are never polled
        let idle = f.manager.tick().await;
        assert_eq!(idle.claimed(), 0);
    }

    #[tokio::test]
    async fn test_retry_backoff_then_failure() {
        let f = fixture();
        let id = add(&f, "retry").await;

        f.manager.tick().await;
        let job = load(&f, id).await;
        assert_eq!(job.meta.retry_count, 1);
        assert_eq!(job.meta.state_timestamp, 1_100);
        assert_eq!(job.meta.error_detail.as_deref(), Some("not yet"));

        // not due yet
        assert_eq!(f.manager.tick().await.claimed(), 0);

        f.clock.advance(Duration::from_millis(100));
        f.manager.tick().await;
        let job = load(&f, id).await;
        assert_eq!(job.meta.retry_count, 2);
        assert_eq!(job.meta.state_timestamp, 1_100 + 200);

        f.clock.advance(Duration::from_millis(200));
        let report = f.manager.tick().await;
        assert_eq!(report.count(StepKind::Failed), 1);
        let job = load(&f, id).await;
        assert_eq!(job.state(), Some(JobState::Failed));
        assert_eq!(job.meta.retry_count, 2);
        assert!(job.meta.error_detail.unwrap().contains("not yet"));
        assert_eq!(f.script.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_and_illegal_transition_fail_immediately() {
        let f = fixture();
        let fatal = add(&f, "fatal").await;
        let illegal = add(&f, "illegal").await;

        let report = f.manager.tick().await;
        assert_eq!(report.count(StepKind::Failed), 2);

        let job = load(&f, fatal).await;
        assert_eq!(job.state(), Some(JobState::Failed));
        assert_eq!(job.meta.error_detail.as_deref(), Some("bad input"));

        let job = load(&f, illegal).await;
        assert_eq!(job.state(), Some(JobState::Failed));
        assert!(job.meta.error_detail.unwrap().contains("QUEUED -> DONE"));

        for (from, to) in report.edges() {
            assert!(graph().allows(from, to), "{from} -> {to}");
        }
    }

    #[tokio::test]
    async fn test_handler_error_discards_mutations_and_uses_capped_backoff() {
        let f = fixture();
        let id = add(&f, "error").await;

        let report = f.manager.tick().await;
        assert_eq!(report.count(StepKind::Retried), 1);

        let job = load(&f, id).await;
        assert_eq!(job.label, "error");
        assert_eq!(job.meta.retry_count, 1);
        assert_eq!(job.meta.state_timestamp, 1_000 + 1_000);
        assert!(job.meta.error_detail.unwrap().contains("connection reset"));
        assert!(job.meta.lease.is_none());
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_retry_and_releases_lease() {
        let f = fixture();
        let id = add(&f, "panic").await;

        let report = f.manager.tick().await;
        assert_eq!(report.count(StepKind::Retried), 1);

        let job = load(&f, id).await;
        assert_eq!(job.label, "panic");
        assert_eq!(job.state(), Some(JobState::Queued));
        assert!(job.meta.error_detail.unwrap().contains("handler bug"));
        assert!(job.meta.lease.is_none());
    }

    #[tokio::test]
    async fn test_pending_guard_parks_without_touching_retry() {
        let f = fixture_with(ManagerConfig::default(), Some(|job: &Job| job.label == "wait"));
        let mut job = Job::new("wait", JobState::Queued, 1_000);
        job.meta.retry_count = 1;
        let id = job.id();
        f.store.upsert(job).await.unwrap();

        let report = f.manager.tick().await;
        assert_eq!(report.count(StepKind::Parked), 1);
        assert_eq!(f.script.calls.load(Ordering::SeqCst), 0);

        let job = load(&f, id).await;
        assert!(job.meta.pending);
        assert_eq!(job.meta.retry_count, 1);
        assert_eq!(job.meta.state_timestamp, 1_000);
        assert!(job.meta.lease.is_none());

        // parked entities are not claimed again
        assert_eq!(f.manager.tick().await.claimed(), 0);
    }

    #[tokio::test]
    async fn test_events_for_announced_states_and_failures() {
        let f = fixture();
        let events = Arc::new(BroadcastEventPublisher::new(16));
        let mut rx = events.subscribe();
        let manager = StateMachineManager::new(
            StateMachine::new("jobs", graph(), JobState::Failed)
                .unwrap()
                .on(JobState::Queued, FnHandler::new(f.script.clone(), start))
                .unwrap()
                .on(JobState::Running, FnHandler::new(f.script.clone(), finish))
                .unwrap(),
            f.store.clone(),
            ManagerConfig::default(),
            "test",
        )
        .with_clock(f.clock.clone())
        .with_events(events.clone());

        add(&f, "ok").await;
        add(&f, "fatal").await;
        manager.tick().await;
        manager.tick().await;

        let mut seen = Vec::new();
        while let Ok(e) = rx.try_recv() {
            seen.push((e.state, e.failed));
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![("DONE".to_string(), false), ("FAILED".to_string(), true)]
        );
    }

    struct FailingPublisher;

    impl EventPublisher for FailingPublisher {
        fn publish(&self, _event: ProcessEvent) -> Result<(), PublishError> {
            Err(PublishError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_roll_back() {
        let f = fixture();
        let manager = StateMachineManager::new(
            StateMachine::new("jobs", graph(), JobState::Failed)
                .unwrap()
                .on(JobState::Queued, FnHandler::new(f.script.clone(), start))
                .unwrap(),
            f.store.clone(),
            ManagerConfig::default(),
            "test",
        )
        .with_clock(f.clock.clone())
        .with_events(Arc::new(FailingPublisher));
        let id = add(&f, "fatal").await;

        manager.tick().await;
        assert_eq!(load(&f, id).await.state(), Some(JobState::Failed));
    }

    #[tokio::test]
    async fn test_foreign_lease_is_skipped() {
        let f = fixture();
        let id = add(&f, "ok").await;
        f.store
            .acquire_lease(&id, "other-instance", Duration::from_secs(10), 1_000)
            .await
            .unwrap();

        assert_eq!(f.manager.tick().await.claimed(), 0);

        f.clock.advance(Duration::from_secs(10));
        let report = f.manager.tick().await;
        assert_eq!(report.count(StepKind::Transitioned), 2);
        assert_eq!(load(&f, id).await.state(), Some(JobState::Done));
    }

    struct Thief {
        store: Arc<InMemoryEntityStore<Job>>,
    }

    fn steal<'a>(ctx: &'a Thief, job: &'a mut Job) -> HandlerFuture<'a, JobState> {
        Box::pin(async move {
            ctx.store
                .acquire_lease(&job.id(), "thief", Duration::from_secs(60), 1_000)
                .await?;
            Ok(StepOutcome::Transition(JobState::Running))
        })
    }

    #[tokio::test]
    async fn test_lost_lease_abandons_outcome() {
        let f = fixture();
        let id = add(&f, "ok").await;

        // a zero-length lease lets another holder take over mid-flight
        let config = ManagerConfig {
            lease_duration: Duration::ZERO,
            ..ManagerConfig::default()
        };
        let thief = Arc::new(Thief {
            store: f.store.clone(),
        });
        let machine = StateMachine::new("jobs", graph(), JobState::Failed)
            .unwrap()
            .on(JobState::Queued, FnHandler::new(thief, steal))
            .unwrap();
        let manager = StateMachineManager::new(machine, f.store.clone(), config, "test")
            .with_clock(f.clock.clone());

        let report = manager.tick().await;
        assert_eq!(report.count(StepKind::Abandoned), 1);
        let job = load(&f, id).await;
        assert_eq!(job.state(), Some(JobState::Queued));
        assert_eq!(job.meta.lease.unwrap().holder, "thief");
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let f = fixture_with(
            ManagerConfig {
                iteration_wait: Duration::from_millis(5),
                ..ManagerConfig::default()
            },
            None,
        );
        let id = add(&f, "ok").await;

        f.manager.start();
        assert!(f.manager.is_running());
        for _ in 0..200 {
            if load(&f, id).await.state() == Some(JobState::Done) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        f.manager.stop().await;

        assert!(!f.manager.is_running());
        assert_eq!(load(&f, id).await.state(), Some(JobState::Done));
    }

    #[tokio::test]
    async fn test_claim_errors_do_not_abort_tick() {
        struct Broken;

        #[async_trait::async_trait]
        impl EntityStore<Job> for Broken {
            async fn find(&self, _id: &EntityId) -> Result<Option<Job>, StoreError> {
                Ok(None)
            }
            async fn upsert(&self, _entity: Job) -> Result<(), StoreError> {
                Ok(())
            }
            async fn delete(&self, _id: &EntityId) -> Result<(), StoreError> {
                Ok(())
            }
            async fn next_not_leased(
                &self,
                _claim: &ClaimRequest<'_>,
            ) -> Result<Vec<Job>, StoreError> {
                Err(StoreError::Backend("offline".into()))
            }
            async fn acquire_lease(
                &self,
                id: &EntityId,
                _holder: &str,
                _duration: Duration,
                _now: i64,
            ) -> Result<crate::entity::Lease, StoreError> {
                Err(StoreError::NotFound(*id))
            }
            async fn release_lease(&self, _id: &EntityId, _holder: &str) -> Result<(), StoreError> {
                Ok(())
            }
            async fn save_and_release(&self, _entity: Job, _holder: &str) -> Result<(), StoreError> {
                Ok(())
            }
            async fn query(
                &self,
                _query: &crate::store::QuerySpec,
            ) -> Result<Vec<Job>, StoreError> {
                Ok(Vec::new())
            }
        }

        let f = fixture();
        let machine = StateMachine::new("jobs", graph(), JobState::Failed)
            .unwrap()
            .on(JobState::Queued, FnHandler::new(f.script.clone(), start))
            .unwrap();
        let manager =
            StateMachineManager::new(machine, Arc::new(Broken), ManagerConfig::default(), "t");
        assert_eq!(manager.tick().await.claimed(), 0);
    }
}
