use async_trait::async_trait;
use reqwest::{StatusCode, header};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::{
    Error, SimulationBackend, query, schema,
    types::{
        Analysis, AnalysisHandle, BatchOutcome, BuildingSpec, GeometryObject, ProjectId,
        ProjectSpec, ProjectSummary, RawResult, SnapshotId,
    },
};

const USER_COOKIE: &str = "InFraReDClientUuid";
const TOKEN_COOKIE: &str = "InFraReD";

#[derive(Clone, Debug)]
struct Session {
    user: String,
    cookie: String,
}

/// GraphQL client for the simulation backend.
///
/// Logs in lazily on first use and once more whenever the backend rejects the
/// session.
pub struct InfraredClient {
    client: reqwest::Client,
    url: String,
    username: String,
    password: String,
    session: RwLock<Option<Session>>,
}

impl InfraredClient {
    pub fn new(
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            session: RwLock::new(None),
        }
    }

    async fn login(&self) -> Result<Session, Error> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "username": self.username, "password": self.password }))
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(Error::Login(response.status()));
        }
        let cookie = |name: &'static str| {
            response
                .cookies()
                .find(|c| c.name() == name)
                .map(|c| c.value().to_string())
                .ok_or(Error::MissingCookie(name))
        };
        let session = Session {
            user: cookie(USER_COOKIE)?,
            cookie: format!("{TOKEN_COOKIE}={}", cookie(TOKEN_COOKIE)?),
        };
        debug!(user = %session.user, "logged in to simulation backend");
        Ok(session)
    }

    async fn session(&self) -> Result<Session, Error> {
        if let Some(session) = self.session.read().await.as_ref() {
            return Ok(session.clone());
        }
        let mut guard = self.session.write().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = self.login().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn post(
        &self,
        session: &Session,
        operation: &str,
        document: &str,
    ) -> Result<Value, Error> {
        trace!(operation, "executing backend query");
        let response = self
            .client
            .post(format!("{}/api", self.url))
            .header(header::COOKIE, &session.cookie)
            .header(header::ORIGIN, &self.url)
            .json(&json!({ "query": document }))
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(Error::Unauthorized),
            status => {
                return Err(Error::Status {
                    operation: operation.to_string(),
                    status,
                });
            }
        }
        let body: Value = response.json().await?;
        if let Some(errors) = body.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                let messages = errors
                    .iter()
                    .map(|e| {
                        e.get("message")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| e.to_string())
                    })
                    .collect::<Vec<_>>();
                if messages.iter().any(|m| m.to_lowercase().contains("unauthor")) {
                    return Err(Error::Unauthorized);
                }
                // batched mutations report per-alias failures next to partial data
                if body.get("data").is_none_or(Value::is_null) {
                    return Err(Error::GraphQl {
                        operation: operation.to_string(),
                        messages,
                    });
                }
                debug!(operation, ?messages, "backend reported partial errors");
            }
        }
        Ok(body)
    }

    /// Runs `document`, refreshing the session once if it was rejected.
    async fn execute(&self, operation: &str, document: String) -> Result<(Session, Value), Error> {
        let session = self.session().await?;
        match self.post(&session, operation, &document).await {
            Err(err) if err.is_auth() => {
                warn!(operation, "backend session rejected, logging in again");
                let fresh = self.login().await?;
                *self.session.write().await = Some(fresh.clone());
                let body = self.post(&fresh, operation, &document).await?;
                Ok((fresh, body))
            }
            result => result.map(|body| (session, body)),
        }
    }

    async fn user(&self) -> Result<String, Error> {
        Ok(self.session().await?.user)
    }
}

#[async_trait]
impl SimulationBackend for InfraredClient {
    async fn projects(&self) -> Result<Vec<ProjectSummary>, Error> {
        let user = self.user().await?;
        let op = "getProjectsByUserUuid";
        let (session, body) = self.execute(op, query::projects(&user)).await?;
        let schema = schema::infrared_schema(&body, op)?;
        Ok(schema::projects(&schema, &session.user))
    }

    async fn create_project(&self, spec: &ProjectSpec) -> Result<ProjectId, Error> {
        let user = self.user().await?;
        let op = "createNewProject";
        let (_, body) = self.execute(op, query::create_project(&user, spec)).await?;
        schema::payload(&body, op)?
            .get("uuid")
            .and_then(Value::as_str)
            .map(ProjectId::from)
            .ok_or_else(|| Error::malformed(op, "uuid"))
    }

    async fn delete_project(&self, project: &ProjectId) -> Result<(), Error> {
        let user = self.user().await?;
        let op = "deleteProject";
        let (_, body) = self.execute(op, query::delete_project(&user, project)).await?;
        schema::payload(&body, op)?;
        Ok(())
    }

    async fn root_snapshot(&self, project: &ProjectId) -> Result<SnapshotId, Error> {
        let op = "getSnapshotsByProjectUuid";
        let (session, body) = self.execute(op, query::snapshots(project)).await?;
        let schema = schema::infrared_schema(&body, op)?;
        schema::root_snapshot(&schema, &session.user, project)
            .ok_or_else(|| Error::malformed(op, "snapshots"))
    }

    async fn geometry_objects(
        &self,
        snapshot: &SnapshotId,
    ) -> Result<Vec<GeometryObject>, Error> {
        let op = "getSnapshotGeometryObjects";
        let (_, body) = self.execute(op, query::geometry_objects(snapshot)).await?;
        let schema = schema::infrared_schema(&body, op)?;
        Ok(schema::geometry_objects(&schema))
    }

    async fn create_buildings(
        &self,
        snapshot: &SnapshotId,
        buildings: &[BuildingSpec],
    ) -> Result<BatchOutcome, Error> {
        if buildings.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let (_, body) = self
            .execute("createNewBuilding", query::create_buildings(snapshot, buildings))
            .await?;
        Ok(schema::batch_outcome(&body, buildings.len()))
    }

    async fn delete_geometry(
        &self,
        snapshot: &SnapshotId,
        objects: &[GeometryObject],
    ) -> Result<BatchOutcome, Error> {
        if objects.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let (_, body) = self
            .execute("deleteGeometry", query::delete_geometry(snapshot, objects))
            .await?;
        Ok(schema::batch_outcome(&body, objects.len()))
    }

    async fn activate_sunlight(&self, project: &ProjectId) -> Result<(), Error> {
        let user = self.user().await?;
        let op = "modifyProject";
        let (_, body) = self.execute(op, query::activate_sunlight(&user, project)).await?;
        schema::payload(&body, op)?;
        Ok(())
    }

    async fn run_analysis(
        &self,
        snapshot: &SnapshotId,
        analysis: &Analysis,
    ) -> Result<AnalysisHandle, Error> {
        let op = match analysis {
            Analysis::WindComfort { .. } => "runServiceWindComfort",
            Analysis::SunlightHours => "runServiceSunlightHours",
        };
        let (_, body) = self.execute(op, query::run_analysis(snapshot, analysis)).await?;
        schema::payload(&body, op)?
            .get("uuid")
            .and_then(Value::as_str)
            .map(AnalysisHandle::from)
            .ok_or_else(|| Error::malformed(op, "uuid"))
    }

    async fn analysis_output(
        &self,
        snapshot: &SnapshotId,
        handle: &AnalysisHandle,
    ) -> Result<Option<RawResult>, Error> {
        let op = "getAnalysisOutput";
        let (_, body) = self.execute(op, query::analysis_output(snapshot, handle)).await?;
        match schema::infrared_schema(&body, op) {
            Ok(schema) => schema::analysis_output(&schema),
            // still computing
            Err(Error::Unsuccessful(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
