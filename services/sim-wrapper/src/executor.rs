use std::{sync::Arc, time::Duration};

use geojson::FeatureCollection;
use infrared::{BatchOutcome, BuildingSpec, ProjectId, SimulationBackend, SnapshotId};
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    georef::Georeferencer,
    lease::{LeaseGuard, SlotStatus},
    retry::{self, Backoff},
    store::{KeyValueStore, StoreExt, cache_key},
    task::{SimParams, SimulationTask},
};

/// Deletes every geometry object in `snapshot`, `batch_size` objects per
/// request. Returns the combined outcome; per-object failures are counted,
/// not raised.
pub async fn purge_geometry(
    backend: &dyn SimulationBackend,
    snapshot: &SnapshotId,
    batch_size: usize,
) -> Result<BatchOutcome, Error> {
    let objects = backend.geometry_objects(snapshot).await?;
    let mut outcome = BatchOutcome::default();
    for chunk in objects.chunks(batch_size.max(1)) {
        outcome.merge(backend.delete_geometry(snapshot, chunk).await?);
    }
    debug!(
        %snapshot,
        deleted = outcome.succeeded.len(),
        failed = outcome.failed,
        "purged geometry"
    );
    Ok(outcome)
}

pub struct TileExecutor {
    backend: Arc<dyn SimulationBackend>,
    store: Arc<dyn KeyValueStore>,
    georef: Georeferencer,
    poll: Backoff,
    cache_ttl: Duration,
    batch_size: usize,
}

impl TileExecutor {
    pub fn new(
        backend: Arc<dyn SimulationBackend>,
        store: Arc<dyn KeyValueStore>,
        georef: Georeferencer,
        poll: Backoff,
        cache_ttl: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            backend,
            store,
            georef,
            poll,
            cache_ttl,
            batch_size,
        }
    }

    /// Runs `task` on the leased slot. The slot is marked for cleanup
    /// afterwards whatever the outcome.
    pub async fn execute(
        &self,
        lease: LeaseGuard,
        task: &SimulationTask,
    ) -> Result<FeatureCollection, Error> {
        let result = self.run(lease.slot(), task).await;
        if let Err(err) = &result {
            warn!(slot = %lease.slot(), ?err, "tile failed");
        }
        let slot = lease.slot().clone();
        if let Err(err) = lease.release(SlotStatus::NeedsCleanup).await {
            warn!(%slot, ?err, "failed to mark slot for cleanup");
        }
        result
    }

    async fn run(&self, slot: &ProjectId, task: &SimulationTask) -> Result<FeatureCollection, Error> {
        let key = task.content_key();
        match self.store.get::<FeatureCollection>(&cache_key(&key)).await {
            Ok(Some(hit)) => {
                info!(%key, "tile result served from cache");
                return Ok(hit);
            }
            Ok(None) => {}
            Err(err) => warn!(%key, ?err, "cache lookup failed"),
        }

        let snapshot = self.backend.root_snapshot(slot).await?;
        let purged = purge_geometry(self.backend.as_ref(), &snapshot, self.batch_size).await?;
        if !purged.is_complete() {
            warn!(%slot, failed = purged.failed, "stale geometry left in slot");
        }

        self.push_buildings(&snapshot, task).await?;

        if task.params == SimParams::Sun {
            self.backend.activate_sunlight(slot).await?;
        }
        let handle = self
            .backend
            .run_analysis(&snapshot, &task.params.analysis())
            .await?;
        debug!(%slot, %handle, "analysis triggered");

        let backend = self.backend.as_ref();
        let raw = retry::poll(self.poll, |_| backend.analysis_output(&snapshot, &handle))
            .await?
            .ok_or(Error::ResultTimeout {
                attempts: self.poll.attempts,
            })?;

        let result = self.georef.georeference(&raw, &task.frame)?;
        if !result.features.is_empty() {
            if let Err(err) = self
                .store
                .put(&cache_key(&key), &result, Some(self.cache_ttl))
                .await
            {
                warn!(%key, ?err, "failed to cache tile result");
            }
        }
        Ok(result)
    }

    async fn push_buildings(&self, snapshot: &SnapshotId, task: &SimulationTask) -> Result<(), Error> {
        let local = task
            .buildings
            .translate(-task.frame.origin_x, -task.frame.origin_y);
        let specs: Vec<BuildingSpec> = local.buildings.iter().flat_map(|b| b.explode()).collect();
        let mut outcome = BatchOutcome::default();
        for chunk in specs.chunks(self.batch_size.max(1)) {
            outcome.merge(self.backend.create_buildings(snapshot, chunk).await?);
        }
        if !outcome.is_complete() {
            warn!(
                %snapshot,
                created = outcome.succeeded.len(),
                failed = outcome.failed,
                "some buildings were not created"
            );
        }
        Ok(())
    }
}
