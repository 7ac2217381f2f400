//! Client for the urban microclimate simulation backend.
//!
//! The backend exposes a GraphQL API organised around projects. Each project
//! covers a fixed square area, holds one root snapshot with geometry, and runs
//! analyses against that snapshot.

use async_trait::async_trait;

mod client;
mod error;
pub mod query;
pub mod schema;
mod types;

pub use client::InfraredClient;
pub use error::Error;
pub use types::*;

/// Operations the simulation service needs from the backend.
///
/// Implemented by [`InfraredClient`]; tests substitute an in-memory fake.
#[async_trait]
pub trait SimulationBackend: Send + Sync {
    async fn projects(&self) -> Result<Vec<ProjectSummary>, Error>;

    async fn create_project(&self, spec: &ProjectSpec) -> Result<ProjectId, Error>;

    async fn delete_project(&self, project: &ProjectId) -> Result<(), Error>;

    async fn root_snapshot(&self, project: &ProjectId) -> Result<SnapshotId, Error>;

    async fn geometry_objects(&self, snapshot: &SnapshotId) -> Result<Vec<GeometryObject>, Error>;

    /// Creates all `buildings` in one request. Individual creations may fail
    /// without failing the call.
    async fn create_buildings(
        &self,
        snapshot: &SnapshotId,
        buildings: &[BuildingSpec],
    ) -> Result<BatchOutcome, Error>;

    async fn delete_geometry(
        &self,
        snapshot: &SnapshotId,
        objects: &[GeometryObject],
    ) -> Result<BatchOutcome, Error>;

    /// Enables the sunlight hours service for a project. Required once
    /// before a sunlight analysis can be triggered.
    async fn activate_sunlight(&self, project: &ProjectId) -> Result<(), Error>;

    async fn run_analysis(
        &self,
        snapshot: &SnapshotId,
        analysis: &Analysis,
    ) -> Result<AnalysisHandle, Error>;

    /// `Ok(None)` while the analysis is still running.
    async fn analysis_output(
        &self,
        snapshot: &SnapshotId,
        handle: &AnalysisHandle,
    ) -> Result<Option<RawResult>, Error>;
}
