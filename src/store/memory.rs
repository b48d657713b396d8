//! In-memory Entity Store
//!
//! Mutex-guarded map. Every operation, including claim-and-lease, runs under
//! the one lock, which gives the same atomicity a database provides with row
//! locks. Used by tests, the demo binary, and single-instance deployments.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::query::{QuerySpec, matches_all};
use super::{ClaimRequest, EntityStore, StoreError};
use crate::clock::{Clock, SystemClock};
use crate::entity::{EntityId, Lease, StatefulEntity};

pub struct InMemoryEntityStore<T> {
    entities: Mutex<HashMap<EntityId, T>>,
    clock: Arc<dyn Clock>,
}

impl<T: StatefulEntity> InMemoryEntityStore<T> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// The clock decides lease liveness for `delete`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entities: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<EntityId, T>>, StoreError> {
        self.entities
            .lock()
            .map_err(|_| StoreError::Backend("entity map lock poisoned".to_string()))
    }
}

impl<T: StatefulEntity> Default for InMemoryEntityStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: StatefulEntity> EntityStore<T> for InMemoryEntityStore<T> {
    async fn find(&self, id: &EntityId) -> Result<Option<T>, StoreError> {
        Ok(self.lock()?.get(id).cloned())
    }

    async fn upsert(&self, mut entity: T) -> Result<(), StoreError> {
        let mut entities = self.lock()?;
        let id = entity.id();
        let lease = entities.get(&id).and_then(|e| e.meta().lease.clone());
        entity.meta_mut().lease = lease;
        entities.insert(id, entity);
        Ok(())
    }

    async fn delete(&self, id: &EntityId) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut entities = self.lock()?;
        let entity = entities.get(id).ok_or(StoreError::NotFound(*id))?;

        if let Some(reason) = entity.deletion_blocker() {
            return Err(StoreError::DeletionRefused { id: *id, reason });
        }
        if let Some(lease) = &entity.meta().lease
            && !lease.is_expired(now)
        {
            return Err(StoreError::LeaseConflict {
                id: *id,
                holder: lease.holder.clone(),
            });
        }

        entities.remove(id);
        Ok(())
    }

    async fn next_not_leased(&self, claim: &ClaimRequest<'_>) -> Result<Vec<T>, StoreError> {
        if claim.max == 0 {
            return Ok(Vec::new());
        }
        let mut entities = self.lock()?;

        let mut candidates: Vec<(i64, EntityId)> = Vec::new();
        for entity in entities.values() {
            let meta = entity.meta();
            if meta.state != claim.state || meta.pending || !meta.is_due(claim.now) {
                continue;
            }
            // any live lease excludes, the claimant's own included
            if meta.lease.as_ref().is_some_and(|l| !l.is_expired(claim.now)) {
                continue;
            }
            if !matches_all(claim.filter, entity)? {
                continue;
            }
            candidates.push((meta.state_timestamp, meta.id));
        }

        // oldest first; the ULID breaks ties in creation order
        candidates.sort_unstable();
        candidates.truncate(claim.max);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(entity) = entities.get_mut(&id) {
                entity.meta_mut().lease =
                    Some(Lease::new(claim.holder, claim.now, claim.lease_duration));
                claimed.push(entity.clone());
            }
        }
        Ok(claimed)
    }

    async fn acquire_lease(
        &self,
        id: &EntityId,
        holder: &str,
        duration: Duration,
        now: i64,
    ) -> Result<Lease, StoreError> {
        let mut entities = self.lock()?;
        let entity = entities.get_mut(id).ok_or(StoreError::NotFound(*id))?;

        if let Some(existing) = &entity.meta().lease
            && existing.blocks(holder, now)
        {
            return Err(StoreError::LeaseConflict {
                id: *id,
                holder: existing.holder.clone(),
            });
        }

        let lease = Lease::new(holder, now, duration);
        entity.meta_mut().lease = Some(lease.clone());
        Ok(lease)
    }

    async fn release_lease(&self, id: &EntityId, holder: &str) -> Result<(), StoreError> {
        let mut entities = self.lock()?;
        let entity = entities.get_mut(id).ok_or(StoreError::NotFound(*id))?;

        match &entity.meta().lease {
            None => Ok(()),
            Some(lease) if lease.is_held_by(holder) => {
                entity.meta_mut().lease = None;
                Ok(())
            }
            Some(lease) => Err(StoreError::LeaseConflict {
                id: *id,
                holder: lease.holder.clone(),
            }),
        }
    }

    async fn save_and_release(&self, mut entity: T, holder: &str) -> Result<(), StoreError> {
        let mut entities = self.lock()?;
        let id = entity.id();
        let stored = entities.get(&id).ok_or(StoreError::NotFound(id))?;

        match &stored.meta().lease {
            Some(lease) if lease.is_held_by(holder) => {}
            Some(lease) => {
                return Err(StoreError::LeaseConflict {
                    id,
                    holder: lease.holder.clone(),
                });
            }
            None => {
                return Err(StoreError::LeaseConflict {
                    id,
                    holder: "<none>".to_string(),
                });
            }
        }

        entity.meta_mut().lease = None;
        entities.insert(id, entity);
        Ok(())
    }

    async fn query(&self, query: &QuerySpec) -> Result<Vec<T>, StoreError> {
        let snapshot: Vec<T> = self.lock()?.values().cloned().collect();
        Ok(query.apply(snapshot)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entity::ProcessState;
    use crate::entity::fixtures::{Job, JobState};
    use crate::store::query::{Criterion, SortOrder};
    use proptest::prelude::*;
    use std::collections::HashSet;

    const LEASE: Duration = Duration::from_secs(60);

    fn claim<'a>(holder: &'a str, max: usize, now: i64) -> ClaimRequest<'a> {
        ClaimRequest {
            state: JobState::Queued.code(),
            filter: &[],
            max,
            holder,
            lease_duration: LEASE,
            now,
        }
    }

    async fn seeded(store: &InMemoryEntityStore<Job>, timestamps: &[i64]) -> Vec<EntityId> {
        let mut ids = Vec::new();
        for (i, ts) in timestamps.iter().enumerate() {
            let job = Job::new(&format!("job-{i}"), JobState::Queued, *ts);
            ids.push(job.id());
            store.upsert(job).await.unwrap();
        }
        ids
    }

    #[tokio::test]
    async fn test_next_not_leased_oldest_first_and_claims() {
        let store = InMemoryEntityStore::new();
        // inserted out of order: t3, t1, t2
        let ids = seeded(&store, &[300, 100, 200]).await;
        let (t3, t1, t2) = (ids[0], ids[1], ids[2]);

        let first = store.next_not_leased(&claim("w1", 1, 1_000)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id(), t1);
        assert_eq!(first[0].meta.lease.as_ref().unwrap().holder, "w1");

        // second call before release skips the leased one
        let second = store.next_not_leased(&claim("w2", 1, 1_000)).await.unwrap();
        assert_eq!(second[0].id(), t2);

        let third = store.next_not_leased(&claim("w3", 5, 1_000)).await.unwrap();
        assert_eq!(third.iter().map(|j| j.id()).collect::<Vec<_>>(), vec![t3]);
    }

    #[tokio::test]
    async fn test_next_not_leased_skips_not_due_pending_and_other_states() {
        let store = InMemoryEntityStore::new();
        let due = Job::new("due", JobState::Queued, 100);
        let later = Job::new("later", JobState::Queued, 5_000);
        let mut parked = Job::new("parked", JobState::Queued, 50);
        parked.meta.pending = true;
        let running = Job::new("running", JobState::Running, 10);
        let due_id = due.id();

        for job in [due, later, parked, running] {
            store.upsert(job).await.unwrap();
        }

        let claimed = store.next_not_leased(&claim("w", 10, 1_000)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id(), due_id);
    }

    #[tokio::test]
    async fn test_next_not_leased_applies_filter() {
        let store = InMemoryEntityStore::new();
        seeded(&store, &[1, 2]).await;
        let special = Job::new("special", JobState::Queued, 3);
        let special_id = special.id();
        store.upsert(special).await.unwrap();

        let filter = [Criterion::equal("label", "special")];
        let request = ClaimRequest {
            filter: &filter,
            ..claim("w", 10, 1_000)
        };
        let claimed = store.next_not_leased(&request).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id(), special_id);
    }

    #[tokio::test]
    async fn test_lease_self_heals_after_expiry() {
        let store = InMemoryEntityStore::new();
        let id = seeded(&store, &[0]).await[0];

        store
            .acquire_lease(&id, "worker-a", Duration::from_millis(500), 1_000)
            .await
            .unwrap();

        let err = store
            .acquire_lease(&id, "worker-b", Duration::from_millis(500), 1_200)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::LeaseConflict {
                id,
                holder: "worker-a".into()
            }
        );
        assert!(
            store
                .next_not_leased(&claim("worker-b", 1, 1_200))
                .await
                .unwrap()
                .is_empty()
        );

        // worker-a never releases; after the duration worker-b gets in
        let lease = store
            .acquire_lease(&id, "worker-b", Duration::from_millis(500), 1_500)
            .await
            .unwrap();
        assert_eq!(lease.holder, "worker-b");
    }

    #[tokio::test]
    async fn test_reacquire_by_holder_extends() {
        let store = InMemoryEntityStore::new();
        let id = seeded(&store, &[0]).await[0];

        let first = store
            .acquire_lease(&id, "w", Duration::from_millis(500), 1_000)
            .await
            .unwrap();
        let second = store
            .acquire_lease(&id, "w", Duration::from_millis(500), 1_400)
            .await
            .unwrap();
        assert_eq!(first.expires_at, 1_500);
        assert_eq!(second.expires_at, 1_900);

        // claims never hand back a live lease, even to its holder
        let claimed = store.next_not_leased(&claim("w", 1, 1_450)).await.unwrap();
        assert!(claimed.is_empty());
        let claimed = store.next_not_leased(&claim("w", 1, 1_900)).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_claims_by_one_holder_advance() {
        let store = InMemoryEntityStore::new();
        let ids = seeded(&store, &[100, 200, 300]).await;

        let first = store.next_not_leased(&claim("mgr", 1, 1_000)).await.unwrap();
        let second = store.next_not_leased(&claim("mgr", 1, 1_000)).await.unwrap();
        let third = store.next_not_leased(&claim("mgr", 1, 1_000)).await.unwrap();
        assert_eq!(first[0].id(), ids[0]);
        assert_eq!(second[0].id(), ids[1]);
        assert_eq!(third[0].id(), ids[2]);
        assert!(
            store
                .next_not_leased(&claim("mgr", 1, 1_000))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_release_by_non_holder_fails() {
        let store = InMemoryEntityStore::new();
        let id = seeded(&store, &[0]).await[0];
        store.acquire_lease(&id, "a", LEASE, 0).await.unwrap();

        assert!(matches!(
            store.release_lease(&id, "b").await,
            Err(StoreError::LeaseConflict { .. })
        ));
        store.release_lease(&id, "a").await.unwrap();
        assert!(store.find(&id).await.unwrap().unwrap().meta.lease.is_none());
        // releasing again is harmless
        store.release_lease(&id, "a").await.unwrap();
    }

    #[tokio::test]
    async fn test_save_and_release_requires_lease() {
        let store = InMemoryEntityStore::new();
        let id = seeded(&store, &[0]).await[0];
        let mut job = store.find(&id).await.unwrap().unwrap();
        job.label = "changed".into();

        assert!(matches!(
            store.save_and_release(job.clone(), "w").await,
            Err(StoreError::LeaseConflict { .. })
        ));

        store.acquire_lease(&id, "w", LEASE, 0).await.unwrap();
        store.save_and_release(job, "w").await.unwrap();

        let saved = store.find(&id).await.unwrap().unwrap();
        assert_eq!(saved.label, "changed");
        assert!(saved.meta.lease.is_none());
    }

    #[tokio::test]
    async fn test_upsert_preserves_lease() {
        let store = InMemoryEntityStore::new();
        let id = seeded(&store, &[0]).await[0];
        store.acquire_lease(&id, "w", LEASE, 0).await.unwrap();

        let mut job = store.find(&id).await.unwrap().unwrap();
        job.meta.lease = None;
        store.upsert(job).await.unwrap();

        let stored = store.find(&id).await.unwrap().unwrap();
        assert_eq!(stored.meta.lease.unwrap().holder, "w");
    }

    #[tokio::test]
    async fn test_delete_refusals() {
        let clock = Arc::new(ManualClock::new(0));
        let store = InMemoryEntityStore::with_clock(clock.clone());

        let mut locked = Job::new("locked", JobState::Done, 0);
        locked.locked = true;
        let locked_id = locked.id();
        store.upsert(locked).await.unwrap();
        assert!(matches!(
            store.delete(&locked_id).await,
            Err(StoreError::DeletionRefused { .. })
        ));

        let id = seeded(&store, &[0]).await[0];
        store
            .acquire_lease(&id, "w", Duration::from_millis(100), 0)
            .await
            .unwrap();
        assert!(matches!(
            store.delete(&id).await,
            Err(StoreError::LeaseConflict { .. })
        ));

        clock.advance(Duration::from_millis(100));
        store.delete(&id).await.unwrap();
        assert!(store.find(&id).await.unwrap().is_none());
        assert!(matches!(
            store.delete(&id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_query_filter_sort_page() {
        let store = InMemoryEntityStore::new();
        seeded(&store, &[30, 10, 20]).await;

        let all = store
            .query(&QuerySpec::all().sorted_by("stateTimestamp", SortOrder::Desc))
            .await
            .unwrap();
        let stamps: Vec<i64> = all.iter().map(|j| j.meta.state_timestamp).collect();
        assert_eq!(stamps, vec![30, 20, 10]);

        let page = store
            .query(
                &QuerySpec::all()
                    .sorted_by("stateTimestamp", SortOrder::Asc)
                    .page(1, 1),
            )
            .await
            .unwrap();
        assert_eq!(page[0].meta.state_timestamp, 20);

        let err = store
            .query(&QuerySpec::filtered(vec![Criterion::equal("nope", 1i64)]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_QUERY");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn property_concurrent_claims_are_exclusive(
            entities in 1usize..40,
            workers in 2usize..8,
            batch in 1usize..6,
        ) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .expect("runtime");

            rt.block_on(async move {
                let store = Arc::new(InMemoryEntityStore::<Job>::new());
                for i in 0..entities {
                    store
                        .upsert(Job::new(&format!("job-{i}"), JobState::Queued, i as i64))
                        .await
                        .unwrap();
                }

                let mut tasks = Vec::new();
                for w in 0..workers {
                    let store = store.clone();
                    tasks.push(tokio::spawn(async move {
                        let holder = format!("worker-{w}");
                        let mut seen = Vec::new();
                        loop {
                            let request = ClaimRequest {
                                state: JobState::Queued.code(),
                                filter: &[],
                                max: batch,
                                holder: &holder,
                                lease_duration: LEASE,
                                now: 1_000,
                            };
                            let claimed = store.next_not_leased(&request).await.unwrap();
                            if claimed.is_empty() {
                                break;
                            }
                            seen.extend(claimed.into_iter().map(|j| j.id()));
                            tokio::task::yield_now().await;
                        }
                        seen
                    }));
                }

                let mut all = HashSet::new();
                let mut total = 0;
                for task in tasks {
                    for id in task.await.unwrap() {
                        total += 1;
                        prop_assert!(all.insert(id), "entity {} claimed twice", id);
                    }
                }
                prop_assert_eq!(total, entities);
                Ok(())
            })?;
        }
    }
}
