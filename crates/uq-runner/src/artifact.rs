//! Run identities and the artifact file names that carry them.
//!
//! A campaign artifact is named `{geometry}_ep{NN}_al{NNN}.json`; the merger
//! recovers the identity from the name alone. Single runs have no identity
//! and get a random token instead.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::config::GeometryKind;

pub const ARTIFACT_EXTENSION: &str = "json";

/// Glob selecting campaign artifacts in an output directory.
pub const DEFAULT_ARTIFACT_PATTERN: &str = "*_ep[0-9]*_al[0-9]*.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunIdentity {
    pub epistemic_index: usize,
    pub aleatory_index: usize,
}

impl RunIdentity {
    pub fn new(epistemic_index: usize, aleatory_index: usize) -> Self {
        Self {
            epistemic_index,
            aleatory_index,
        }
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep{:02}/al{:03}", self.epistemic_index, self.aleatory_index)
    }
}

pub fn group_name(geometry: &str, identity: RunIdentity) -> String {
    format!(
        "{}_ep{:02}_al{:03}",
        geometry, identity.epistemic_index, identity.aleatory_index
    )
}

pub fn artifact_file_name(geometry: GeometryKind, identity: Option<RunIdentity>) -> String {
    match identity {
        Some(id) => format!("{}.{}", group_name(geometry.as_str(), id), ARTIFACT_EXTENSION),
        None => format!(
            "{}_{}.{}",
            geometry.as_str(),
            Uuid::new_v4().simple(),
            ARTIFACT_EXTENSION
        ),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub geometry: String,
    pub identity: RunIdentity,
}

impl ArtifactName {
    pub fn group_name(&self) -> String {
        group_name(&self.geometry, self.identity)
    }
}

pub fn parse_artifact_file_name(file_name: &str) -> Option<ArtifactName> {
    let stem = file_name
        .strip_suffix(ARTIFACT_EXTENSION)?
        .strip_suffix('.')?;
    let (head, aleatory) = stem.rsplit_once("_al")?;
    let (geometry, epistemic) = head.rsplit_once("_ep")?;
    if geometry.is_empty() || !is_index(epistemic) || !is_index(aleatory) {
        return None;
    }
    Some(ArtifactName {
        geometry: geometry.to_string(),
        identity: RunIdentity::new(epistemic.parse().ok()?, aleatory.parse().ok()?),
    })
}

fn is_index(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
}

/// Checks the minimum artifact layout: a `solution` group holding `grid`
/// and `T` arrays of equal, non-zero length, either directly or inside one
/// domain group such as `solution/flame`.
pub fn check_solution_tree(artifact: &Value) -> Result<(), String> {
    let solution = artifact
        .get("solution")
        .and_then(Value::as_object)
        .ok_or_else(|| "missing 'solution' group".to_string())?;
    if let Some(result) = check_profile(solution) {
        return result;
    }
    for (name, child) in solution {
        if let Some(group) = child.as_object() {
            if let Some(result) = check_profile(group) {
                return result.map_err(|e| format!("solution/{}: {}", name, e));
            }
        }
    }
    Err("'solution' group has no 'grid' and 'T' arrays".to_string())
}

fn check_profile(group: &Map<String, Value>) -> Option<Result<(), String>> {
    let grid = group.get("grid")?;
    let temperature = group.get("T")?;
    Some(match (grid.as_array(), temperature.as_array()) {
        (Some(g), Some(_)) if g.is_empty() => Err("'grid' is empty".to_string()),
        (Some(g), Some(t)) if g.len() == t.len() => Ok(()),
        (Some(g), Some(t)) => Err(format!(
            "'grid' has {} points but 'T' has {}",
            g.len(),
            t.len()
        )),
        _ => Err("'grid' and 'T' must be arrays".to_string()),
    })
}
