//! Patient records: the transplantation plan produced by the feature-space
//! search.

use crate::layout::read_json;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Plan for one host. Written once by the search and consumed by the
/// transplanter.
///
/// Serialised flat, with the per-category feature counts of the adversarial
/// feature set alongside the named fields:
///
/// ```json
/// {"host": "...", "organs": ["..."], "score": 1.2, "margin": 0.5, ...,
///  "intents": 3, "urls": 7, ...}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    /// Path of the original host sample
    pub host: PathBuf,
    /// Ice box locations of the selected organs
    pub organs: Vec<PathBuf>,
    /// Decision score before the attack
    pub score: f64,
    pub margin: f64,
    /// Distance from the initial score to `-margin`
    pub target_perturbation: f64,
    /// Feature-space score change achieved by the selected organs
    pub organ_contribution: f64,
    pub distortion_l1: f64,
    /// Per-category feature counts of the host before the attack
    #[serde(default)]
    pub feature_stats_start: BTreeMap<String, usize>,
    #[serde(flatten)]
    pub feature_counts: BTreeMap<String, usize>,
}

impl PatientRecord {
    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }

    /// File name of the host sample.
    pub fn host_name(&self) -> String {
        self.host
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Host name a record file belongs to (`records/<host>.record.json`).
pub fn host_name_from_record_path(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    file_name
        .strip_suffix(".record.json")
        .map(str::to_string)
        .unwrap_or(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::write_json_atomic;
    use tempfile::TempDir;

    #[test]
    fn test_counts_are_flattened() {
        let record = PatientRecord {
            host: PathBuf::from("/apps/MAL.apk"),
            organs: vec![PathBuf::from("/ice/a/D")],
            score: 0.5,
            margin: 0.25,
            target_perturbation: 0.75,
            organ_contribution: -0.8,
            distortion_l1: 2.0,
            feature_stats_start: BTreeMap::from([("urls".to_string(), 1)]),
            feature_counts: BTreeMap::from([("urls".to_string(), 3), ("intents".to_string(), 1)]),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["urls"], 3);
        assert_eq!(value["host"], "/apps/MAL.apk");

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("MAL.apk.record.json");
        write_json_atomic(&path, &record).unwrap();
        let loaded = PatientRecord::load(&path).unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.host_name(), "MAL.apk");
    }

    #[test]
    fn test_host_name_from_record_path() {
        assert_eq!(
            host_name_from_record_path(Path::new("/out/records/MAL.apk.record.json")),
            "MAL.apk"
        );
        assert_eq!(host_name_from_record_path(Path::new("/out/records/odd.json")), "odd.json");
    }
}
