use std::{sync::Arc, time::Duration};

use futures::future::try_join_all;
use infrared::{ProjectId, ProjectSpec, ProjectSummary, SimulationBackend};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    config::Config,
    error::Error,
    executor::purge_geometry,
    lease::{LeaseRegistry, SlotStatus},
    store::KeyValueStore,
};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SlotReport {
    pub id: ProjectId,
    pub name: String,
    pub status: Option<SlotStatus>,
}

/// Keeps enough clean, idle backend projects around for the workers.
///
/// Only slots without a status or marked `needs_cleanup` are touched, and
/// only after claiming them through the registry, so running this alongside
/// live jobs is safe.
pub struct PoolMaintainer {
    backend: Arc<dyn SimulationBackend>,
    registry: LeaseRegistry,
    prefix: String,
    min_idle: usize,
    batch_size: usize,
    template: ProjectSpec,
}

impl PoolMaintainer {
    pub fn new(
        config: &Config,
        backend: Arc<dyn SimulationBackend>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            backend,
            registry: LeaseRegistry::new(store, config.lease.into()),
            prefix: config.pool.project_prefix.clone(),
            min_idle: config.pool.min_idle,
            batch_size: config.worker.batch_size,
            template: ProjectSpec {
                name: String::new(),
                resolution: config.tiling.resolution,
                south_west_lat: config.pool.south_west_lat,
                south_west_lon: config.pool.south_west_lon,
                size: config.tiling.simulated_size(),
            },
        }
    }

    async fn slots(&self) -> Result<Vec<ProjectSummary>, Error> {
        let projects = self.backend.projects().await?;
        Ok(projects
            .into_iter()
            .filter(|p| p.name.starts_with(&self.prefix))
            .collect())
    }

    /// Removes every geometry object from `slot`; anything left over is a
    /// failure.
    async fn purge(&self, slot: &ProjectId) -> Result<(), Error> {
        let snapshot = self.backend.root_snapshot(slot).await?;
        let outcome = purge_geometry(self.backend.as_ref(), &snapshot, self.batch_size).await?;
        if !outcome.is_complete() {
            return Err(Error::CleanupFailed(slot.to_string()));
        }
        Ok(())
    }

    async fn provision(&self) -> Result<ProjectId, Error> {
        let spec = ProjectSpec {
            name: format!("{}_{:032x}", self.prefix, fastrand::u128(..)),
            ..self.template.clone()
        };
        let slot = self.backend.create_project(&spec).await?;
        // new projects come with default geometry
        self.purge(&slot).await?;
        self.registry.release(&slot, SlotStatus::Idle).await?;
        info!(%slot, name = %spec.name, "provisioned slot");
        Ok(slot)
    }

    async fn discard(&self, slot: &ProjectId) -> Result<(), Error> {
        self.backend.delete_project(slot).await?;
        self.registry.forget(slot).await
    }

    /// Hands a claimed slot back as `needs_cleanup` so a later run retries it
    /// instead of finding it busy forever.
    async fn requeue(&self, slot: &ProjectId) {
        if let Err(err) = self.registry.release(slot, SlotStatus::NeedsCleanup).await {
            warn!(%slot, ?err, "failed to requeue slot, it stays busy");
        }
    }

    /// Cleans a slot that was found in `from`. Returns false when someone
    /// else claimed it first.
    ///
    /// Every error path leaves the slot `needs_cleanup` or gone, never `busy`.
    async fn clean(&self, slot: &ProjectId, from: Option<SlotStatus>) -> Result<bool, Error> {
        if !self.registry.transition(slot, from, SlotStatus::Busy).await? {
            return Ok(false);
        }
        match self.purge(slot).await {
            Ok(()) => {
                if let Err(err) = self.registry.release(slot, SlotStatus::Idle).await {
                    self.requeue(slot).await;
                    return Err(err);
                }
                debug!(%slot, "slot cleaned");
            }
            Err(err) => {
                warn!(%slot, ?err, "cleanup failed, replacing slot");
                if let Err(err) = self.discard(slot).await {
                    // the top-up in ensure_pool covers the missing idle slot
                    self.requeue(slot).await;
                    return Err(err);
                }
                self.provision().await?;
            }
        }
        Ok(true)
    }

    pub async fn report(&self) -> Result<Vec<SlotReport>, Error> {
        let slots = self.slots().await?;
        try_join_all(slots.into_iter().map(|slot| async move {
            let status = self.registry.status(&slot.id).await?;
            Ok::<_, Error>(SlotReport {
                id: slot.id,
                name: slot.name,
                status,
            })
        }))
        .await
    }

    /// Cleans used slots, tops the pool up to the configured minimum of idle
    /// slots and reports the state of every slot.
    pub async fn ensure_pool(&self) -> Result<Vec<SlotReport>, Error> {
        for slot in self.slots().await? {
            let status = self.registry.status(&slot.id).await?;
            if !matches!(status, None | Some(SlotStatus::NeedsCleanup)) {
                continue;
            }
            match self.clean(&slot.id, status).await {
                Ok(true) => {}
                Ok(false) => debug!(slot = %slot.id, "slot claimed elsewhere"),
                Err(err) => warn!(slot = %slot.id, ?err, "slot maintenance failed"),
            }
        }

        let idle = self
            .report()
            .await?
            .iter()
            .filter(|s| s.status == Some(SlotStatus::Idle))
            .count();
        if idle < self.min_idle {
            info!(idle, min_idle = self.min_idle, "topping up slot pool");
            for _ in idle..self.min_idle {
                self.provision().await?;
            }
        }
        self.report().await
    }

    pub async fn run(&self, interval: Duration, cancel_token: CancellationToken) {
        async {
            loop {
                match self.ensure_pool().await {
                    Ok(report) => {
                        let idle = report
                            .iter()
                            .filter(|s| s.status == Some(SlotStatus::Idle))
                            .count();
                        info!(slots = report.len(), idle, "pool maintained");
                    }
                    Err(err) => warn!(?err, "pool maintenance failed"),
                }
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
        .instrument(info_span!("pool"))
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use geo::{LineString, Polygon};
    use infrared::BuildingSpec;

    use super::*;
    use crate::{
        store::MemoryStore,
        testing::{self, FakeBackend},
    };

    /// Rejects writes of an idle status while `refuse_idle` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        refuse_idle: AtomicBool,
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get_raw(&self, key: &str) -> Result<Option<String>, Error> {
            self.inner.get_raw(key).await
        }

        async fn put_raw(
            &self,
            key: &str,
            value: &str,
            ttl: Option<Duration>,
        ) -> Result<(), Error> {
            if self.refuse_idle.load(Ordering::SeqCst) && value.contains("\"idle\"") {
                let err = redis::RedisError::from((redis::ErrorKind::IoError, "connection reset"));
                return Err(err.into());
            }
            self.inner.put_raw(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<(), Error> {
            self.inner.delete(key).await
        }

        async fn compare_and_set(
            &self,
            key: &str,
            expected: Option<&str>,
            new: &str,
        ) -> Result<bool, Error> {
            self.inner.compare_and_set(key, expected, new).await
        }

        async fn incr(&self, key: &str) -> Result<i64, Error> {
            self.inner.incr(key).await
        }
    }

    struct Harness {
        backend: Arc<FakeBackend>,
        registry: LeaseRegistry,
        maintainer: PoolMaintainer,
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemoryStore::new()))
    }

    fn harness_with(store: Arc<dyn KeyValueStore>) -> Harness {
        let backend = Arc::new(FakeBackend::new(700.0));
        let config = testing::config();
        Harness {
            registry: LeaseRegistry::new(store.clone(), config.lease.into()),
            maintainer: PoolMaintainer::new(&config, backend.clone(), store),
            backend,
        }
    }

    async fn add_building(backend: &FakeBackend, slot: &ProjectId) {
        let snapshot = backend.root_snapshot(slot).await.unwrap();
        let footprint = Polygon::new(
            LineString::from(vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 0.0)]),
            vec![],
        );
        let building = BuildingSpec {
            footprint,
            height: 10.0,
            building_use: "residential".to_string(),
        };
        backend.create_buildings(&snapshot, &[building]).await.unwrap();
    }

    fn is_slot_name(name: &str) -> bool {
        name.strip_prefix("CUT_")
            .is_some_and(|hex| hex.len() == 32 && hex.chars().all(|c| c.is_ascii_hexdigit()))
    }

    #[tokio::test]
    async fn empty_pool_is_provisioned() {
        let h = harness();
        let report = h.maintainer.ensure_pool().await.unwrap();
        assert_eq!(report.len(), 2);
        for slot in &report {
            assert!(is_slot_name(&slot.name), "{}", slot.name);
            assert_eq!(slot.status, Some(SlotStatus::Idle));
            assert!(!h.backend.has_street(&slot.id).await);
        }

        // a second run has nothing to do
        let again = h.maintainer.ensure_pool().await.unwrap();
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn used_slots_are_cleaned() {
        let h = harness();
        let slot = h.backend.add_project("CUT_used").await;
        add_building(&h.backend, &slot).await;
        h.registry.release(&slot, SlotStatus::NeedsCleanup).await.unwrap();

        h.maintainer.ensure_pool().await.unwrap();
        assert_eq!(h.registry.status(&slot).await.unwrap(), Some(SlotStatus::Idle));
        assert!(h.backend.buildings(&slot).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_slots_are_adopted() {
        let h = harness();
        let slot = h.backend.add_project("CUT_found").await;
        h.backend.add_street(&slot).await;
        let other = h.backend.add_project("not a slot").await;

        let report = h.maintainer.ensure_pool().await.unwrap();
        assert_eq!(h.registry.status(&slot).await.unwrap(), Some(SlotStatus::Idle));
        assert!(!h.backend.has_street(&slot).await);
        assert_eq!(h.registry.status(&other).await.unwrap(), None);
        assert!(report.iter().all(|s| s.id != other));
    }

    #[tokio::test]
    async fn busy_slots_are_left_alone() {
        let h = harness();
        let slot = h.backend.add_project("CUT_busy").await;
        add_building(&h.backend, &slot).await;
        h.registry.release(&slot, SlotStatus::Busy).await.unwrap();

        let report = h.maintainer.ensure_pool().await.unwrap();
        assert_eq!(h.registry.status(&slot).await.unwrap(), Some(SlotStatus::Busy));
        assert_eq!(h.backend.buildings(&slot).await.len(), 1);
        // the busy slot does not count towards the idle minimum
        assert_eq!(report.len(), 3);
    }

    #[tokio::test]
    async fn failed_cleanup_replaces_slot() {
        let h = harness();
        let broken = h.backend.add_project("CUT_broken").await;
        add_building(&h.backend, &broken).await;
        h.backend.break_project(&broken).await;
        h.registry.release(&broken, SlotStatus::NeedsCleanup).await.unwrap();

        let report = h.maintainer.ensure_pool().await.unwrap();
        assert_eq!(h.backend.deleted_projects().await, vec![broken.clone()]);
        assert_eq!(h.registry.status(&broken).await.unwrap(), None);
        assert_eq!(report.len(), 2);
        assert!(
            report
                .iter()
                .all(|s| s.id != broken && s.status == Some(SlotStatus::Idle))
        );
    }

    #[tokio::test]
    async fn undeletable_slot_is_requeued() {
        let h = harness();
        let broken = h.backend.add_project("CUT_broken").await;
        add_building(&h.backend, &broken).await;
        h.backend.break_project(&broken).await;
        h.backend.set_fail_project_deletes(true).await;
        h.registry.release(&broken, SlotStatus::NeedsCleanup).await.unwrap();

        let report = h.maintainer.ensure_pool().await.unwrap();
        assert_eq!(
            h.registry.status(&broken).await.unwrap(),
            Some(SlotStatus::NeedsCleanup)
        );
        let idle = report
            .iter()
            .filter(|s| s.status == Some(SlotStatus::Idle))
            .count();
        assert_eq!(idle, 2);

        // a second run retries it instead of stacking replacements
        let report = h.maintainer.ensure_pool().await.unwrap();
        assert_eq!(report.len(), 3);
        assert_eq!(
            h.registry.status(&broken).await.unwrap(),
            Some(SlotStatus::NeedsCleanup)
        );

        h.backend.set_fail_project_deletes(false).await;
        let report = h.maintainer.ensure_pool().await.unwrap();
        assert_eq!(h.backend.deleted_projects().await, vec![broken.clone()]);
        assert_eq!(h.registry.status(&broken).await.unwrap(), None);
        assert!(report.iter().all(|s| s.id != broken));
    }

    #[tokio::test]
    async fn failed_idle_write_requeues_slot() {
        let store = Arc::new(FlakyStore::default());
        let h = harness_with(store.clone());
        let slot = h.backend.add_project("CUT_used").await;
        add_building(&h.backend, &slot).await;
        h.registry.release(&slot, SlotStatus::NeedsCleanup).await.unwrap();

        store.refuse_idle.store(true, Ordering::SeqCst);
        let cleaned = h
            .maintainer
            .clean(&slot, Some(SlotStatus::NeedsCleanup))
            .await;
        assert!(cleaned.is_err());
        assert_eq!(
            h.registry.status(&slot).await.unwrap(),
            Some(SlotStatus::NeedsCleanup)
        );

        store.refuse_idle.store(false, Ordering::SeqCst);
        h.maintainer.ensure_pool().await.unwrap();
        assert_eq!(h.registry.status(&slot).await.unwrap(), Some(SlotStatus::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_on_cancel() {
        let h = harness();
        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(650)).await;
                token.cancel();
            }
        };
        tokio::join!(h.maintainer.run(Duration::from_secs(300), token), canceller);
        assert_eq!(h.backend.project_names().await.len(), 2);
    }
}
