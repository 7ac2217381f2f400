use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no idle backend project after {attempts} attempts")]
    NoIdleResource { attempts: u32 },
    #[error("backend: {0}")]
    Backend(#[from] infrared::Error),
    #[error("result extent {width}x{height} does not match simulated tile size {expected}")]
    ResultDimensions {
        width: f64,
        height: f64,
        expected: f64,
    },
    #[error("malformed result grid: {0}")]
    MalformedResult(String),
    #[error("reprojection: {0}")]
    Projection(String),
    #[error("service is shutting down")]
    ShuttingDown,
    #[error("result not available after {attempts} polls")]
    ResultTimeout { attempts: u32 },
    #[error("cleanup of project {0} failed")]
    CleanupFailed(String),
    #[error("no buildings in region")]
    EmptyRegion,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("job {0} has not succeeded")]
    JobNotReady(String),
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("geojson: {0}")]
    GeoJson(#[from] Box<geojson::Error>),
}

impl From<geojson::Error> for Error {
    fn from(err: geojson::Error) -> Self {
        Error::GeoJson(Box::new(err))
    }
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::EmptyRegion | Error::InvalidRequest(_) | Error::GeoJson(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::JobNotFound(_) => StatusCode::NOT_FOUND,
            Error::JobNotReady(_) => StatusCode::CONFLICT,
            Error::NoIdleResource { .. } | Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Error::Backend(_) | Error::ResultTimeout { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(serde_json::json!({ "description": self.to_string() }));
        (status, body).into_response()
    }
}
