//! In-memory stand-in for the simulation backend.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use infrared::{
    Analysis, AnalysisHandle, BatchOutcome, BuildingSpec, GeometryKind, GeometryObject, ProjectId,
    ProjectSpec, ProjectSummary, RawResult, SimulationBackend, SnapshotId,
};
use tokio::sync::Mutex;

use crate::config::Config;

/// Production defaults with short retry budgets.
pub fn config() -> Config {
    serde_json::from_value(serde_json::json!({
        "redis_url": "redis://localhost",
        "backend": { "url": "http://backend", "username": "u", "password": "p" },
        "lease": { "attempts": 3, "initial": 1.0, "max": 30.0 },
        "poll": { "attempts": 3, "initial": 1.0, "max": 30.0 },
        "pool": { "min_idle": 2 },
    }))
    .expect("valid test config")
}

struct FakeProject {
    name: String,
    snapshot: SnapshotId,
    objects: Vec<(GeometryObject, Option<BuildingSpec>)>,
    sunlight: bool,
}

#[derive(Default)]
struct State {
    next_id: usize,
    projects: HashMap<ProjectId, FakeProject>,
    analyses: HashMap<AnalysisHandle, usize>,
    create_calls: usize,
    ready_after: usize,
    result_size: f64,
    result_value: f64,
    fail_analyses: bool,
    fail_project_deletes: bool,
    broken: Vec<ProjectId>,
    deleted_projects: Vec<ProjectId>,
}

impl State {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn project_by_snapshot(&mut self, snapshot: &SnapshotId) -> Option<&mut FakeProject> {
        self.projects.values_mut().find(|p| &p.snapshot == snapshot)
    }
}

pub struct FakeBackend {
    state: Mutex<State>,
    panic_analyses: AtomicBool,
}

impl FakeBackend {
    /// Results cover a square of `result_size` metres filled with 0.4.
    pub fn new(result_size: f64) -> Self {
        Self {
            state: Mutex::new(State {
                result_size,
                result_value: 0.4,
                ..State::default()
            }),
            panic_analyses: AtomicBool::new(false),
        }
    }

    pub async fn add_project(&self, name: &str) -> ProjectId {
        let mut state = self.state.lock().await;
        let id = ProjectId::from(state.id("project"));
        let snapshot = SnapshotId::from(state.id("snapshot"));
        state.projects.insert(
            id.clone(),
            FakeProject {
                name: name.to_string(),
                snapshot,
                objects: Vec::new(),
                sunlight: false,
            },
        );
        id
    }

    pub async fn add_street(&self, project: &ProjectId) {
        let mut state = self.state.lock().await;
        let id = state.id("street");
        if let Some(p) = state.projects.get_mut(project) {
            p.objects.push((
                GeometryObject {
                    id,
                    kind: GeometryKind::StreetSegment,
                },
                None,
            ));
        }
    }

    pub async fn has_street(&self, project: &ProjectId) -> bool {
        let state = self.state.lock().await;
        state.projects.get(project).is_some_and(|p| {
            p.objects
                .iter()
                .any(|(o, _)| o.kind == GeometryKind::StreetSegment)
        })
    }

    pub async fn buildings(&self, project: &ProjectId) -> Vec<BuildingSpec> {
        let state = self.state.lock().await;
        state
            .projects
            .get(project)
            .map(|p| p.objects.iter().filter_map(|(_, b)| b.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn project_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.projects.values().map(|p| p.name.clone()).collect()
    }

    pub async fn deleted_projects(&self) -> Vec<ProjectId> {
        self.state.lock().await.deleted_projects.clone()
    }

    pub async fn create_calls(&self) -> usize {
        self.state.lock().await.create_calls
    }

    pub async fn analyses(&self) -> usize {
        self.state.lock().await.analyses.len()
    }

    pub async fn sunlight_active(&self, project: &ProjectId) -> bool {
        let state = self.state.lock().await;
        state.projects.get(project).is_some_and(|p| p.sunlight)
    }

    pub async fn set_ready_after(&self, polls: usize) {
        self.state.lock().await.ready_after = polls;
    }

    pub async fn set_result_size(&self, size: f64) {
        self.state.lock().await.result_size = size;
    }

    pub async fn set_fail_analyses(&self, fail: bool) {
        self.state.lock().await.fail_analyses = fail;
    }

    pub async fn set_fail_project_deletes(&self, fail: bool) {
        self.state.lock().await.fail_project_deletes = fail;
    }

    /// Starting an analysis panics from now on.
    pub fn set_panic_analyses(&self, panic: bool) {
        self.panic_analyses.store(panic, Ordering::SeqCst);
    }

    /// Geometry deletions in `project` fail from now on.
    pub async fn break_project(&self, project: &ProjectId) {
        self.state.lock().await.broken.push(project.clone());
    }
}

fn not_found(what: &str) -> infrared::Error {
    infrared::Error::Unsuccessful(format!("{what} not found"))
}

#[async_trait]
impl SimulationBackend for FakeBackend {
    async fn projects(&self) -> Result<Vec<ProjectSummary>, infrared::Error> {
        let state = self.state.lock().await;
        let mut projects: Vec<_> = state
            .projects
            .iter()
            .map(|(id, p)| ProjectSummary {
                id: id.clone(),
                name: p.name.clone(),
            })
            .collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    async fn create_project(&self, spec: &ProjectSpec) -> Result<ProjectId, infrared::Error> {
        let id = self.add_project(&spec.name).await;
        // fresh projects come with a default street
        self.add_street(&id).await;
        Ok(id)
    }

    async fn delete_project(&self, project: &ProjectId) -> Result<(), infrared::Error> {
        let mut state = self.state.lock().await;
        if state.fail_project_deletes {
            return Err(infrared::Error::Unsuccessful("deleteProject".to_string()));
        }
        state
            .projects
            .remove(project)
            .ok_or_else(|| not_found("project"))?;
        state.deleted_projects.push(project.clone());
        Ok(())
    }

    async fn root_snapshot(&self, project: &ProjectId) -> Result<SnapshotId, infrared::Error> {
        let state = self.state.lock().await;
        state
            .projects
            .get(project)
            .map(|p| p.snapshot.clone())
            .ok_or_else(|| not_found("project"))
    }

    async fn geometry_objects(
        &self,
        snapshot: &SnapshotId,
    ) -> Result<Vec<GeometryObject>, infrared::Error> {
        let mut state = self.state.lock().await;
        let project = state
            .project_by_snapshot(snapshot)
            .ok_or_else(|| not_found("snapshot"))?;
        Ok(project.objects.iter().map(|(o, _)| o.clone()).collect())
    }

    async fn create_buildings(
        &self,
        snapshot: &SnapshotId,
        buildings: &[BuildingSpec],
    ) -> Result<BatchOutcome, infrared::Error> {
        let mut state = self.state.lock().await;
        state.create_calls += 1;
        let ids: Vec<String> = (0..buildings.len()).map(|_| state.id("building")).collect();
        let project = state
            .project_by_snapshot(snapshot)
            .ok_or_else(|| not_found("snapshot"))?;
        for (id, building) in ids.iter().zip(buildings) {
            project.objects.push((
                GeometryObject {
                    id: id.clone(),
                    kind: GeometryKind::Building,
                },
                Some(building.clone()),
            ));
        }
        Ok(BatchOutcome {
            succeeded: ids,
            failed: 0,
        })
    }

    async fn delete_geometry(
        &self,
        snapshot: &SnapshotId,
        objects: &[GeometryObject],
    ) -> Result<BatchOutcome, infrared::Error> {
        let mut state = self.state.lock().await;
        let broken = state
            .projects
            .iter()
            .any(|(id, p)| &p.snapshot == snapshot && state.broken.contains(id));
        if broken {
            return Err(infrared::Error::Unsuccessful("deleteBuilding".to_string()));
        }
        let project = state
            .project_by_snapshot(snapshot)
            .ok_or_else(|| not_found("snapshot"))?;
        let mut outcome = BatchOutcome::default();
        for object in objects {
            let before = project.objects.len();
            project.objects.retain(|(o, _)| o.id != object.id);
            if project.objects.len() < before {
                outcome.succeeded.push(object.id.clone());
            } else {
                outcome.failed += 1;
            }
        }
        Ok(outcome)
    }

    async fn activate_sunlight(&self, project: &ProjectId) -> Result<(), infrared::Error> {
        let mut state = self.state.lock().await;
        let project = state
            .projects
            .get_mut(project)
            .ok_or_else(|| not_found("project"))?;
        project.sunlight = true;
        Ok(())
    }

    async fn run_analysis(
        &self,
        snapshot: &SnapshotId,
        analysis: &Analysis,
    ) -> Result<AnalysisHandle, infrared::Error> {
        if self.panic_analyses.load(Ordering::SeqCst) {
            panic!("analysis blew up");
        }
        let mut state = self.state.lock().await;
        if state.fail_analyses {
            return Err(infrared::Error::Unsuccessful("runService".to_string()));
        }
        let project = state
            .project_by_snapshot(snapshot)
            .ok_or_else(|| not_found("snapshot"))?;
        if *analysis == Analysis::SunlightHours && !project.sunlight {
            return Err(infrared::Error::Unsuccessful(
                "runServiceSunlightHours".to_string(),
            ));
        }
        let handle = AnalysisHandle::from(state.id("analysis"));
        state.analyses.insert(handle.clone(), 0);
        Ok(handle)
    }

    async fn analysis_output(
        &self,
        _snapshot: &SnapshotId,
        handle: &AnalysisHandle,
    ) -> Result<Option<RawResult>, infrared::Error> {
        let mut state = self.state.lock().await;
        let ready_after = state.ready_after;
        let polls = state
            .analyses
            .get_mut(handle)
            .ok_or_else(|| not_found("analysis"))?;
        *polls += 1;
        if *polls <= ready_after {
            return Ok(None);
        }
        let size = state.result_size;
        Ok(Some(RawResult {
            north: size,
            east: size,
            south: 0.0,
            west: 0.0,
            resolution_x: 9,
            resolution_y: 9,
            data: vec![vec![state.result_value; 8]; 8],
        }))
    }
}
