//! Extraction of typed values from the backend's `infraredSchema` payloads.
//!
//! The schema is a deeply nested tree keyed by uuids
//! (`clients.<user>.projects.<project>.snapshots.<snapshot>...`). Depending on
//! the endpoint it arrives either as an object or as a JSON encoded string.

use serde_json::{Map, Value};

use crate::{
    Error,
    types::{
        BatchOutcome, GeometryKind, GeometryObject, ProjectId, ProjectSummary, RawResult,
        SnapshotId,
    },
};

/// Returns `data.<operation>` after checking its `success` flag.
pub fn payload<'a>(response: &'a Value, operation: &str) -> Result<&'a Value, Error> {
    let payload = response
        .get("data")
        .and_then(|data| data.get(operation))
        .filter(|payload| !payload.is_null())
        .ok_or_else(|| Error::malformed(operation, "data"))?;
    match payload.get("success").and_then(Value::as_bool) {
        Some(false) => Err(Error::Unsuccessful(operation.to_string())),
        _ => Ok(payload),
    }
}

/// Returns the decoded `infraredSchema` of `data.<operation>`.
pub fn infrared_schema(response: &Value, operation: &str) -> Result<Value, Error> {
    let schema = payload(response, operation)?
        .get("infraredSchema")
        .ok_or_else(|| Error::malformed(operation, "infraredSchema"))?;
    match schema {
        Value::String(encoded) => Ok(serde_json::from_str(encoded)?),
        other => Ok(other.clone()),
    }
}

fn user_projects<'a>(schema: &'a Value, user: &str) -> Option<&'a Map<String, Value>> {
    schema
        .get("clients")?
        .get(user)?
        .get("projects")?
        .as_object()
}

/// All projects owned by `user`. A user without projects yields an empty list.
pub fn projects(schema: &Value, user: &str) -> Vec<ProjectSummary> {
    let Some(projects) = user_projects(schema, user) else {
        return Vec::new();
    };
    projects
        .iter()
        .map(|(id, project)| ProjectSummary {
            id: ProjectId::from(id.as_str()),
            name: project
                .get("projectName")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
        .collect()
}

/// Projects are created with exactly one snapshot, which is the root.
pub fn root_snapshot(schema: &Value, user: &str, project: &ProjectId) -> Option<SnapshotId> {
    user_projects(schema, user)?
        .get(project.as_str())?
        .get("snapshots")?
        .as_object()?
        .keys()
        .next()
        .map(|id| SnapshotId::from(id.as_str()))
}

/// Depth-first search for the first object holding `key`.
fn find_containing<'a>(value: &'a Value, key: &str) -> Option<&'a Map<String, Value>> {
    match value {
        Value::Object(map) if map.contains_key(key) => Some(map),
        Value::Object(map) => map.values().find_map(|v| find_containing(v, key)),
        Value::Array(items) => items.iter().find_map(|v| find_containing(v, key)),
        _ => None,
    }
}

pub fn geometry_objects(schema: &Value) -> Vec<GeometryObject> {
    let Some(objects) = find_containing(schema, "geometryObjects")
        .and_then(|parent| parent.get("geometryObjects"))
        .and_then(Value::as_object)
    else {
        return Vec::new();
    };
    objects
        .iter()
        .map(|(id, object)| {
            let kind = match object.get("type").and_then(Value::as_str) {
                Some("streetSegment") => GeometryKind::StreetSegment,
                _ => GeometryKind::Building,
            };
            GeometryObject {
                id: id.clone(),
                kind,
            }
        })
        .collect()
}

/// Collects the per-alias results of a batched mutation. Creations report
/// their new uuid, deletions only a success flag, in which case the alias is
/// recorded instead.
pub fn batch_outcome(response: &Value, count: usize) -> BatchOutcome {
    let data = response.get("data");
    let mut outcome = BatchOutcome::default();
    for i in 0..count {
        let alias = crate::query::alias(i);
        let entry = data.and_then(|data| data.get(&alias));
        let succeeded = entry
            .and_then(|e| e.get("success"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if succeeded {
            let id = entry
                .and_then(|e| e.get("uuid"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(alias);
            outcome.succeeded.push(id);
        } else {
            outcome.failed += 1;
        }
    }
    outcome
}

/// The analysis output if the backend has finished computing it.
pub fn analysis_output(schema: &Value) -> Result<Option<RawResult>, Error> {
    let Some(output) = find_containing(schema, "analysisOutputData") else {
        return Ok(None);
    };
    if output["analysisOutputData"].is_null() {
        return Ok(None);
    }
    let raw = serde_json::from_value(Value::Object(output.clone()))?;
    Ok(Some(raw))
}
