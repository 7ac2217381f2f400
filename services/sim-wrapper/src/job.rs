use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use geojson::FeatureCollection;
use infrared::{ProjectId, SimulationBackend};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex, Semaphore},
    task::JoinSet,
};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    crs::Utm,
    error::Error,
    geometry::{self, Region},
    executor::TileExecutor,
    georef::Georeferencer,
    lease::LeaseRegistry,
    store::{KeyValueStore, StoreExt, counter_key, job_key, unit_key},
    task::{SimKind, SimParams, SimulationTask},
    tiler::Tiler,
};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Success,
    Failure,
}

/// Stored outcome of one tile.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Success { result: FeatureCollection },
    Failure { error: String },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct JobRecord {
    kind: SimKind,
    units: usize,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct JobStatus {
    pub job_id: String,
    pub kind: SimKind,
    pub state: JobState,
    pub completed: usize,
    pub total: usize,
    pub progress: f64,
}

/// Any failure decides the job, even with units still pending.
pub fn aggregate(units: &[UnitState]) -> (JobState, usize) {
    let succeeded = units
        .iter()
        .filter(|u| matches!(u, UnitState::Success { .. }))
        .count();
    let state = if units.iter().any(|u| matches!(u, UnitState::Failure { .. })) {
        JobState::Failure
    } else if succeeded < units.len() {
        JobState::Pending
    } else {
        JobState::Success
    };
    (state, succeeded)
}

/// Merges all tile results, dissolving equal values across tile seams.
pub fn unify(results: &[FeatureCollection]) -> Result<FeatureCollection, Error> {
    let mut areas = Vec::new();
    for result in results {
        areas.extend(geometry::from_feature_collection(result)?);
    }
    Ok(geometry::to_feature_collection(&geometry::dissolve(areas)))
}

pub struct JobCoordinator {
    backend: Arc<dyn SimulationBackend>,
    store: Arc<dyn KeyValueStore>,
    registry: LeaseRegistry,
    executor: Arc<TileExecutor>,
    tiler: Tiler,
    utm: Utm,
    project_prefix: String,
    job_ttl: Duration,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
}

impl JobCoordinator {
    pub fn new(
        config: &Config,
        backend: Arc<dyn SimulationBackend>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let utm = Utm::new(config.tiling.utm_zone, config.tiling.northern);
        let executor = TileExecutor::new(
            backend.clone(),
            store.clone(),
            Georeferencer::new(utm, config.tiling.simulated_size()),
            config.poll.into(),
            config.cache.ttl,
            config.worker.batch_size,
        );
        Self {
            registry: LeaseRegistry::new(store.clone(), config.lease.into()),
            executor: Arc::new(executor),
            tiler: Tiler::new(&config.tiling),
            utm,
            project_prefix: config.pool.project_prefix.clone(),
            job_ttl: config.cache.job_ttl,
            permits: Arc::new(Semaphore::new(config.worker.concurrency.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            backend,
            store,
        }
    }

    async fn candidates(&self) -> Result<Vec<ProjectId>, Error> {
        let projects = self.backend.projects().await?;
        Ok(projects
            .into_iter()
            .filter(|p| p.name.starts_with(&self.project_prefix))
            .map(|p| p.id)
            .collect())
    }

    /// Tiles the WGS84 `buildings` and starts one unit of work per tile.
    pub async fn submit(
        &self,
        buildings: &FeatureCollection,
        params: SimParams,
    ) -> Result<String, Error> {
        params.validate()?;
        let region = Region::from_feature_collection(buildings)?;
        let tiles = {
            let forward = self.utm.to_projected()?;
            let projected = region.try_map_coords(|c| forward.convert(c))?;
            self.tiler.tile(&projected)
        };
        if tiles.is_empty() {
            return Err(Error::EmptyRegion);
        }
        let candidates = Arc::new(self.candidates().await?);

        let job_id = Uuid::now_v7().to_string();
        let ttl = Some(self.job_ttl);
        let record = JobRecord {
            kind: params.kind(),
            units: tiles.len(),
            created_at: Utc::now(),
        };
        self.store.put(&job_key(&job_id), &record, ttl).await?;
        for index in 0..tiles.len() {
            self.store
                .put(&unit_key(&job_id, index), &UnitState::Pending, ttl)
                .await?;
        }
        if let Err(err) = self.store.incr(&counter_key(params.kind().as_str())).await {
            warn!(?err, "failed to count request");
        }
        info!(
            %job_id,
            kind = %params.kind(),
            tiles = tiles.len(),
            slots = candidates.len(),
            "job submitted"
        );

        let mut tasks = self.tasks.lock().await;
        // reap finished units so the set does not grow without bound
        while tasks.try_join_next().is_some() {}
        for (index, tile) in tiles.into_iter().enumerate() {
            let task = SimulationTask {
                frame: tile.frame,
                buildings: tile.buildings,
                params,
            };
            let span = info_span!("tile", job = %job_id, row = tile.row, col = tile.col);
            let unit = unit_key(&job_id, index);
            let registry = self.registry.clone();
            let executor = self.executor.clone();
            let store = self.store.clone();
            let permits = self.permits.clone();
            let candidates = candidates.clone();
            tasks.spawn(
                async move {
                    let outcome = AssertUnwindSafe(async {
                        let _permit = permits
                            .acquire_owned()
                            .await
                            .map_err(|_| Error::ShuttingDown)?;
                        let lease = registry.acquire(&candidates).await?;
                        debug!(slot = %lease.slot(), "running tile");
                        executor.execute(lease, &task).await
                    })
                    .catch_unwind()
                    .await;
                    let state = match outcome {
                        Ok(Ok(result)) => UnitState::Success { result },
                        Ok(Err(err)) => {
                            warn!(?err, "tile failed");
                            UnitState::Failure {
                                error: err.to_string(),
                            }
                        }
                        Err(payload) => {
                            let message = panic_message(payload.as_ref());
                            error!(%message, "tile panicked");
                            UnitState::Failure {
                                error: format!("tile panicked: {message}"),
                            }
                        }
                    };
                    if let Err(err) = store.put(&unit, &state, ttl).await {
                        error!(?err, "failed to record tile outcome");
                    }
                }
                .instrument(span),
            );
        }
        Ok(job_id)
    }

    async fn units(&self, job_id: &str) -> Result<(JobRecord, Vec<UnitState>), Error> {
        let record: JobRecord = self
            .store
            .get(&job_key(job_id))
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        let mut units = Vec::with_capacity(record.units);
        for index in 0..record.units {
            let unit = self.store.get(&unit_key(job_id, index)).await?;
            units.push(unit.unwrap_or(UnitState::Pending));
        }
        Ok((record, units))
    }

    pub async fn status(&self, job_id: &str) -> Result<JobStatus, Error> {
        let (record, units) = self.units(job_id).await?;
        let (state, completed) = aggregate(&units);
        Ok(JobStatus {
            job_id: job_id.to_string(),
            kind: record.kind,
            state,
            completed,
            total: units.len(),
            progress: completed as f64 / units.len().max(1) as f64,
        })
    }

    pub async fn result(&self, job_id: &str) -> Result<FeatureCollection, Error> {
        let (_, units) = self.units(job_id).await?;
        if aggregate(&units).0 != JobState::Success {
            return Err(Error::JobNotReady(job_id.to_string()));
        }
        let results: Vec<FeatureCollection> = units
            .into_iter()
            .filter_map(|u| match u {
                UnitState::Success { result } => Some(result),
                _ => None,
            })
            .collect();
        unify(&results)
    }

    pub async fn request_count(&self, kind: SimKind) -> Result<i64, Error> {
        let count = self.store.get_raw(&counter_key(kind.as_str())).await?;
        Ok(count.and_then(|c| c.parse().ok()).unwrap_or(0))
    }

    /// Waits for every unit spawned so far.
    pub async fn drain(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(res) = tasks.join_next().await {
            if let Err(err) = res {
                error!(?err, "tile task panicked");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
