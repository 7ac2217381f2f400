//! GraphQL documents understood by the backend.
//!
//! Every interpolated value goes through [`quote`] or is a number, so user
//! supplied names and geometry can never break out of a string literal.

use crate::types::{
    Analysis, AnalysisHandle, BuildingSpec, GeometryKind, GeometryObject, ProjectId, ProjectSpec,
    SnapshotId,
};

pub const WIND_COMFORT_ANALYSIS: &str = "Wind Comfort (0)";
pub const SUNLIGHT_HOURS_ANALYSIS: &str = "Sunlight Hours (0)";

/// Quotes `value` as a GraphQL string literal. JSON string escaping is a
/// subset of what GraphQL accepts.
pub fn quote(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Prefix used to alias the n-th mutation of a batched document.
pub fn alias(index: usize) -> String {
    format!("op{index}")
}

pub fn projects(user: &str) -> String {
    format!(
        "query {{ getProjectsByUserUuid(uuid: {user}) {{ success infraredSchema }} }}",
        user = quote(user)
    )
}

pub fn create_project(user: &str, spec: &ProjectSpec) -> String {
    format!(
        "mutation {{ createNewProject(name: {name} analysisGridResolution: {res} \
         southWestLatitude: {lat} southWestLongitude: {lon} latitudeDeltaM: {size} \
         longitudeDeltaM: {size} userUuid: {user}) {{ success uuid }} }}",
        name = quote(&spec.name),
        res = spec.resolution,
        lat = spec.south_west_lat,
        lon = spec.south_west_lon,
        size = spec.size,
        user = quote(user),
    )
}

pub fn delete_project(user: &str, project: &ProjectId) -> String {
    format!(
        "mutation {{ deleteProject(uuid: {project} userUuid: {user}) {{ success }} }}",
        project = quote(project.as_str()),
        user = quote(user),
    )
}

pub fn snapshots(project: &ProjectId) -> String {
    format!(
        "query {{ getSnapshotsByProjectUuid(uuid: {project}) {{ success infraredSchema }} }}",
        project = quote(project.as_str())
    )
}

pub fn geometry_objects(snapshot: &SnapshotId) -> String {
    format!(
        "query {{ getSnapshotGeometryObjects(uuid: {snapshot}) {{ success infraredSchema }} }}",
        snapshot = quote(snapshot.as_str())
    )
}

/// One document creating every building in `buildings`, each mutation aliased
/// with [`alias`] so per-object results can be told apart.
pub fn create_buildings(snapshot: &SnapshotId, buildings: &[BuildingSpec]) -> String {
    let mut doc = String::from("mutation {");
    for (i, building) in buildings.iter().enumerate() {
        let geometry = geojson::Geometry::new(geojson::Value::from(&building.footprint));
        doc.push_str(&format!(
            " {alias}: createNewBuilding(use: {use_} height: {height} category: \"site\" \
             geometry: {geometry} snapshotUuid: {snapshot}) {{ success uuid }}",
            alias = alias(i),
            use_ = quote(&building.building_use),
            height = building.height,
            geometry = quote(&geometry.to_string()),
            snapshot = quote(snapshot.as_str()),
        ));
    }
    doc.push_str(" }");
    doc
}

pub fn delete_geometry(snapshot: &SnapshotId, objects: &[GeometryObject]) -> String {
    let mut doc = String::from("mutation {");
    for (i, object) in objects.iter().enumerate() {
        let mutation = match object.kind {
            GeometryKind::Building => "deleteBuilding",
            GeometryKind::StreetSegment => "deleteStreetSegment",
        };
        doc.push_str(&format!(
            " {alias}: {mutation}(uuid: {id} snapshotUuid: {snapshot}) {{ success }}",
            alias = alias(i),
            id = quote(&object.id),
            snapshot = quote(snapshot.as_str()),
        ));
    }
    doc.push_str(" }");
    doc
}

/// Sunlight hours only run once the project's session settings enable them.
pub fn activate_sunlight(user: &str, project: &ProjectId) -> String {
    let settings = serde_json::json!({
        "mode": "context",
        "analysis": [{
            "name": "Sunlight Hours",
            "version": 0,
            "parameters": [],
            "uuid": null,
            "index": "0",
        }],
    });
    format!(
        "mutation {{ modifyProject(uuid: {project} sessionSettings: {settings} userUuid: {user}) {{ success }} }}",
        project = quote(project.as_str()),
        settings = quote(&settings.to_string()),
        user = quote(user),
    )
}

pub fn run_analysis(snapshot: &SnapshotId, analysis: &Analysis) -> String {
    match analysis {
        Analysis::WindComfort {
            wind_direction,
            wind_speed,
        } => format!(
            "mutation {{ runServiceWindComfort(snapshotUuid: {snapshot} analysisName: {name} \
             windDirection: {wind_direction} windSpeed: {wind_speed}) {{ success uuid }} }}",
            snapshot = quote(snapshot.as_str()),
            name = quote(WIND_COMFORT_ANALYSIS),
        ),
        Analysis::SunlightHours => format!(
            "mutation {{ runServiceSunlightHours(snapshotUuid: {snapshot} analysisName: {name}) \
             {{ success uuid }} }}",
            snapshot = quote(snapshot.as_str()),
            name = quote(SUNLIGHT_HOURS_ANALYSIS),
        ),
    }
}

pub fn analysis_output(snapshot: &SnapshotId, handle: &AnalysisHandle) -> String {
    format!(
        "query {{ getAnalysisOutput(uuid: {handle} snapshotUuid: {snapshot}) {{ success infraredSchema }} }}",
        handle = quote(handle.as_str()),
        snapshot = quote(snapshot.as_str()),
    )
}
