//! Consolidation of per-run artifacts into one dataset.
//!
//! The merge is all-or-nothing up to the write: nothing is deleted unless
//! every selected artifact made it into the written output.

use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::artifact::{parse_artifact_file_name, ArtifactName};
use crate::error::{CleanupFailure, MergeError};
use crate::fsutil::atomic_create_json_pretty;

pub const DATASET_SCHEMA: &str = "consolidated_dataset_v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAttributes {
    pub source_filename: String,
    pub epistemic_index: usize,
    pub aleatory_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetGroup {
    pub attributes: GroupAttributes,
    /// The artifact, copied verbatim.
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedDataset {
    pub schema_version: String,
    pub created_at: DateTime<Utc>,
    pub source_directory: PathBuf,
    pub groups: BTreeMap<String, DatasetGroup>,
}

impl ConsolidatedDataset {
    pub fn load(path: &Path) -> Result<Self, MergeError> {
        let bytes = fs::read(path).map_err(|source| MergeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| MergeError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeSummary {
    pub output: PathBuf,
    pub groups: usize,
    pub removed: usize,
    /// Matched file names that are not artifact names; left in place.
    pub skipped: Vec<String>,
}

struct Selected {
    file_name: String,
    path: PathBuf,
    name: ArtifactName,
}

pub fn merge(
    directory: &Path,
    output_path: &Path,
    pattern: &str,
) -> Result<MergeSummary, MergeError> {
    merge_with_removal(directory, output_path, pattern, |path| fs::remove_file(path))
}

fn merge_with_removal(
    directory: &Path,
    output_path: &Path,
    pattern: &str,
    remove_input: impl Fn(&Path) -> io::Result<()>,
) -> Result<MergeSummary, MergeError> {
    if output_path.exists() {
        return Err(MergeError::OutputExists {
            path: output_path.to_path_buf(),
        });
    }
    let matcher = Pattern::new(pattern).map_err(|source| MergeError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })?;
    let no_input = || MergeError::NoInput {
        directory: directory.to_path_buf(),
        pattern: pattern.to_string(),
    };

    let candidates = scan(directory, &matcher)?;
    if candidates.is_empty() {
        return Err(no_input());
    }

    let mut selected = Vec::new();
    let mut skipped = Vec::new();
    for (file_name, path) in candidates {
        match parse_artifact_file_name(&file_name) {
            Some(name) => selected.push(Selected {
                file_name,
                path,
                name,
            }),
            None => {
                warn!(file = %file_name, "skipping file that is not an artifact name");
                skipped.push(file_name);
            }
        }
    }
    if selected.is_empty() {
        return Err(no_input());
    }

    let mut owners: BTreeMap<String, &str> = BTreeMap::new();
    for item in &selected {
        let group = item.name.group_name();
        if let Some(first) = owners.get(&group) {
            return Err(MergeError::DuplicateGroup {
                group,
                first: first.to_string(),
                second: item.file_name.clone(),
            });
        }
        owners.insert(group, &item.file_name);
    }

    let mut groups = BTreeMap::new();
    for item in &selected {
        let bytes = fs::read(&item.path).map_err(|source| MergeError::Read {
            path: item.path.clone(),
            source,
        })?;
        let content: Value = serde_json::from_slice(&bytes).map_err(|source| MergeError::Decode {
            path: item.path.clone(),
            source,
        })?;
        groups.insert(
            item.name.group_name(),
            DatasetGroup {
                attributes: GroupAttributes {
                    source_filename: item.file_name.clone(),
                    epistemic_index: item.name.identity.epistemic_index,
                    aleatory_index: item.name.identity.aleatory_index,
                },
                content,
            },
        );
    }

    let dataset = ConsolidatedDataset {
        schema_version: DATASET_SCHEMA.to_string(),
        created_at: Utc::now(),
        source_directory: directory.to_path_buf(),
        groups,
    };
    publish(output_path, &dataset)?;
    info!(
        output = %output_path.display(),
        directory = %directory.display(),
        groups = dataset.groups.len(),
        skipped = skipped.len(),
        "merged artifacts"
    );

    let failures = remove_inputs(selected.iter().map(|item| item.path.as_path()), remove_input);
    if !failures.is_empty() {
        return Err(MergeError::Cleanup {
            output: output_path.to_path_buf(),
            failures,
        });
    }

    Ok(MergeSummary {
        output: output_path.to_path_buf(),
        groups: dataset.groups.len(),
        removed: selected.len(),
        skipped,
    })
}

/// Writes the dataset without replacing anything that appeared at
/// `output_path` since the up-front check.
fn publish(output_path: &Path, dataset: &ConsolidatedDataset) -> Result<(), MergeError> {
    atomic_create_json_pretty(output_path, dataset).map_err(|source| {
        if source.kind() == io::ErrorKind::AlreadyExists {
            MergeError::OutputExists {
                path: output_path.to_path_buf(),
            }
        } else {
            MergeError::Write {
                path: output_path.to_path_buf(),
                source,
            }
        }
    })
}

/// Attempts every removal and collects the ones that failed.
fn remove_inputs<'a>(
    paths: impl Iterator<Item = &'a Path>,
    remove_input: impl Fn(&Path) -> io::Result<()>,
) -> Vec<CleanupFailure> {
    let mut failures = Vec::new();
    for path in paths {
        if let Err(source) = remove_input(path) {
            warn!(file = %path.display(), error = %source, "failed to remove merged artifact");
            failures.push(CleanupFailure {
                path: path.to_path_buf(),
                source,
            });
        }
    }
    failures
}

/// Regular files directly inside `directory` whose name matches, sorted by
/// name. Hidden files (such as staging files) never match.
fn scan(directory: &Path, matcher: &Pattern) -> Result<Vec<(String, PathBuf)>, MergeError> {
    let options = MatchOptions {
        require_literal_leading_dot: true,
        ..MatchOptions::new()
    };
    let mut found = Vec::new();
    for entry in WalkDir::new(directory)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|source| MergeError::Scan {
            directory: directory.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if matcher.matches_with(name, options) {
            found.push((name.to_string(), entry.path().to_path_buf()));
        }
    }
    Ok(found)
}
