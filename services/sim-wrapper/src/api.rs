use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{MatchedPath, Path, State},
    http::{Request, StatusCode},
    routing::{get, post},
};
use geojson::FeatureCollection;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::{classify::ServerErrorsFailureClass, trace::TraceLayer};
use tracing::{Span, info};

use crate::{
    config::ApiConfig,
    error::Error,
    job::{JobCoordinator, JobState, JobStatus},
    maintenance::{PoolMaintainer, SlotReport},
    task::{SimKind, SimParams},
};

#[derive(Clone)]
pub struct AxumContext {
    jobs: Arc<JobCoordinator>,
    pool: Arc<PoolMaintainer>,
}

pub struct Api {
    address: SocketAddr,
    context: AxumContext,
}

impl Api {
    pub fn new(config: ApiConfig, jobs: Arc<JobCoordinator>, pool: Arc<PoolMaintainer>) -> Self {
        Self {
            address: config.address,
            context: AxumContext { jobs, pool },
        }
    }

    pub fn router(context: AxumContext) -> Router {
        Router::new()
            .route("/jobs/wind", post(submit_wind))
            .route("/jobs/sun", post(submit_sun))
            .route("/jobs/{id}", get(job_status))
            .route("/jobs/{id}/results", get(job_results))
            .route("/requests/{kind}", get(request_count))
            .route("/slots", get(slots))
            .route("/health_check", get(health_check))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(|req: &Request<_>| {
                        let matched_path = req
                            .extensions()
                            .get::<MatchedPath>()
                            .map(MatchedPath::as_str);
                        tracing::info_span!("req", method = ?req.method(), matched_path)
                    })
                    .on_failure(
                        |err: ServerErrorsFailureClass, _latency: Duration, _span: &Span| {
                            tracing::error!(error = ?err, "request failed");
                        },
                    ),
            )
            .with_state(context)
    }

    pub async fn run(self, cancel_token: CancellationToken) -> anyhow::Result<()> {
        info!(api.addr = ?self.address, "api listening");
        let listener = tokio::net::TcpListener::bind(self.address).await?;
        axum::serve(listener, Self::router(self.context))
            .with_graceful_shutdown(cancel_token.cancelled_owned())
            .await?;
        Ok(())
    }
}

#[derive(Deserialize, Debug)]
pub struct WindRequest {
    pub buildings: FeatureCollection,
    pub wind_speed: u32,
    pub wind_direction: u32,
}

#[derive(Deserialize, Debug)]
pub struct SunRequest {
    pub buildings: FeatureCollection,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct JobCreated {
    pub job_id: String,
}

/// OGC API Processes status vocabulary.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OgcStatus {
    Running,
    Failed,
    Successful,
}

impl From<JobState> for OgcStatus {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Pending => OgcStatus::Running,
            JobState::Failure => OgcStatus::Failed,
            JobState::Success => OgcStatus::Successful,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct StatusResponse {
    pub job_id: String,
    pub status: OgcStatus,
    pub progress: f64,
    pub completed: usize,
    pub total: usize,
}

impl From<JobStatus> for StatusResponse {
    fn from(status: JobStatus) -> Self {
        Self {
            job_id: status.job_id,
            status: status.state.into(),
            progress: status.progress,
            completed: status.completed,
            total: status.total,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct RequestCount {
    pub kind: SimKind,
    pub count: i64,
}

async fn submit(
    context: &AxumContext,
    buildings: &FeatureCollection,
    params: SimParams,
) -> Result<(StatusCode, Json<JobCreated>), Error> {
    let job_id = context.jobs.submit(buildings, params).await?;
    Ok((StatusCode::ACCEPTED, Json(JobCreated { job_id })))
}

pub async fn submit_wind(
    State(context): State<AxumContext>,
    Json(req): Json<WindRequest>,
) -> Result<(StatusCode, Json<JobCreated>), Error> {
    let params = SimParams::Wind {
        wind_speed: req.wind_speed,
        wind_direction: req.wind_direction,
    };
    submit(&context, &req.buildings, params).await
}

pub async fn submit_sun(
    State(context): State<AxumContext>,
    Json(req): Json<SunRequest>,
) -> Result<(StatusCode, Json<JobCreated>), Error> {
    submit(&context, &req.buildings, SimParams::Sun).await
}

pub async fn job_status(
    State(context): State<AxumContext>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, Error> {
    Ok(Json(context.jobs.status(&id).await?.into()))
}

pub async fn job_results(
    State(context): State<AxumContext>,
    Path(id): Path<String>,
) -> Result<Json<FeatureCollection>, Error> {
    Ok(Json(context.jobs.result(&id).await?))
}

pub async fn request_count(
    State(context): State<AxumContext>,
    Path(kind): Path<String>,
) -> Result<Json<RequestCount>, Error> {
    let kind: SimKind = kind.parse()?;
    let count = context.jobs.request_count(kind).await?;
    Ok(Json(RequestCount { kind, count }))
}

pub async fn slots(State(context): State<AxumContext>) -> Result<Json<Vec<SlotReport>>, Error> {
    Ok(Json(context.pool.report().await?))
}

pub async fn health_check() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use axum::response::IntoResponse;
    use geo::Coord;

    use super::*;
    use crate::{
        crs::Utm,
        geometry::{Bounds, Building, DEFAULT_USE, Region},
        store::MemoryStore,
        testing::{self, FakeBackend},
    };

    async fn context() -> AxumContext {
        let backend = Arc::new(FakeBackend::new(700.0));
        backend.add_project("CUT_one").await;
        let store = Arc::new(MemoryStore::new());
        let config = testing::config();
        AxumContext {
            jobs: Arc::new(JobCoordinator::new(&config, backend.clone(), store.clone())),
            pool: Arc::new(PoolMaintainer::new(&config, backend, store)),
        }
    }

    fn buildings() -> FeatureCollection {
        let inverse = Utm::new(32, true).to_geographic().unwrap();
        Region {
            buildings: vec![Building {
                footprint: Bounds::new(565_100.0, 5_934_100.0, 565_120.0, 5_934_130.0)
                    .to_multi_polygon(),
                height: 20.0,
                building_use: DEFAULT_USE.to_string(),
            }],
        }
        .try_map_coords(|c: Coord<f64>| inverse.convert(c))
        .unwrap()
        .to_feature_collection()
    }

    #[tokio::test(start_paused = true)]
    async fn submitted_job_reports_ogc_status() {
        let context = context().await;
        let req = WindRequest {
            buildings: buildings(),
            wind_speed: 15,
            wind_direction: 270,
        };
        let (code, Json(created)) = submit_wind(State(context.clone()), Json(req))
            .await
            .unwrap();
        assert_eq!(code, StatusCode::ACCEPTED);
        context.jobs.drain().await;

        let Json(status) = job_status(State(context.clone()), Path(created.job_id.clone()))
            .await
            .unwrap();
        assert_eq!(status.status, OgcStatus::Successful);
        assert_eq!(status.total, 1);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "successful");

        let Json(results) = job_results(State(context.clone()), Path(created.job_id))
            .await
            .unwrap();
        assert!(!results.features.is_empty());

        let Json(count) = request_count(State(context), Path("wind".to_string()))
            .await
            .unwrap();
        assert_eq!(count.count, 1);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let context = context().await;
        let missing = job_status(State(context.clone()), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);

        let bad_kind = request_count(State(context.clone()), Path("rain".to_string()))
            .await
            .unwrap_err();
        assert_eq!(bad_kind.into_response().status(), StatusCode::BAD_REQUEST);

        let req = WindRequest {
            buildings: buildings(),
            wind_speed: 15,
            wind_direction: 400,
        };
        let invalid = submit_wind(State(context), Json(req)).await.unwrap_err();
        assert_eq!(invalid.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn job_states_use_ogc_vocabulary() {
        assert_eq!(OgcStatus::from(JobState::Pending), OgcStatus::Running);
        assert_eq!(
            serde_json::to_string(&OgcStatus::Failed).unwrap(),
            "\"failed\""
        );
    }

    #[tokio::test]
    async fn health_check_is_ok() {
        assert_eq!(health_check().await, "ok");
    }
}
