//! Organ harvesting and the persistent organ cache (the "ice box").
//!
//! An organ is the code slice implementing one benign feature, carved out of
//! a donor app. Each (feature, donor) pair lives in its own directory:
//!
//! ```text
//! <ice_box>/<feature dir>/<donor app>/
//!     classes.txt   classes referenced by the slice (written by the extractor)
//!     organ.json    cached organ, present once harvesting succeeded
//!     failed        marker, present once harvesting failed
//! ```
//!
//! `organ.json` and `failed` are terminal and mutually exclusive. Both are
//! written through a temporary file and renamed into place, so workers racing
//! on the same pair can duplicate work but never leave a torn file behind.

use crate::config::Config;
use crate::error::{ApgError, OracleError};
use crate::features::{
    app_name, is_dangerous_permission, organ_dir_name, permission_features, slice_feature_type,
    to_j_feature, FeatureDict,
};
use crate::layout::{read_json, write_atomic, write_json_atomic};
use crate::model::LinearModel;
use crate::oracle::{read_class_list, SliceExtraction, SliceStatus, Toolchain};
use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::TempDir;
use walkdir::WalkDir;

/// Current `organ.json` schema.
pub const ORGAN_SCHEMA_VERSION: u32 = 1;

const ORGAN_FILE: &str = "organ.json";
const FAILED_MARKER: &str = "failed";
const CLASSES_FILE: &str = "classes.txt";

/// A harvested code fragment contributing one target feature plus any side
/// effect features the toolchain introduces alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organ {
    /// Target feature key
    pub feature: String,
    pub donor: PathBuf,
    /// Every feature the organ introduces, target included
    pub feature_dict: FeatureDict,
    pub classes: BTreeSet<String>,
    pub permissions: BTreeSet<String>,
    /// The slice needs auxiliary scaffolding to run
    pub needs_vein: bool,
    pub dangerous_permissions: bool,
    /// Seconds spent harvesting
    pub extraction_time: f64,
    /// Ice box directory of this (feature, donor) pair
    pub location: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct OrganFile {
    schema_version: u32,
    organ: Organ,
}

impl Organ {
    fn new(feature: &str, donor: &Path, location: PathBuf) -> Self {
        Self {
            feature: feature.to_string(),
            donor: donor.to_path_buf(),
            feature_dict: FeatureDict::new(),
            classes: BTreeSet::new(),
            permissions: BTreeSet::new(),
            needs_vein: false,
            dangerous_permissions: false,
            extraction_time: 0.0,
            location,
        }
    }

    /// Load the organ cached in an ice box directory.
    pub fn load(location: &Path) -> Result<Self> {
        let path = location.join(ORGAN_FILE);
        let file: OrganFile = read_json(&path)?;
        if file.schema_version != ORGAN_SCHEMA_VERSION {
            return Err(ApgError::SchemaVersion {
                kind: "organ",
                found: file.schema_version,
                expected: ORGAN_SCHEMA_VERSION,
            }
            .into());
        }
        Ok(file.organ)
    }

    /// Persist the organ into its ice box directory.
    pub fn save(&self) -> Result<()> {
        write_json_atomic(
            &self.location.join(ORGAN_FILE),
            &OrganFile {
                schema_version: ORGAN_SCHEMA_VERSION,
                organ: self.clone(),
            },
        )
    }

    /// Fill in the permission set and dangerous flag from the feature dict.
    fn count_permissions(&mut self) {
        self.permissions = permission_features(&self.feature_dict).cloned().collect();
        self.dangerous_permissions = self.permissions.iter().any(|p| is_dangerous_permission(p));
    }
}

/// Harvests organs from donors and serves them from the ice box.
#[derive(Debug, Clone)]
pub struct OrganCatalog {
    ice_box: PathBuf,
    template_apk: PathBuf,
    tools: Toolchain,
}

impl OrganCatalog {
    pub fn new(config: &Config, tools: Toolchain) -> Self {
        Self {
            ice_box: config.ice_box.clone(),
            template_apk: config.template_apk(),
            tools,
        }
    }

    /// Ice box directory for a (feature, donor) pair.
    pub fn location(&self, feature: &str, donor: &Path) -> PathBuf {
        let (_, j_feature) = to_j_feature(feature);
        self.ice_box
            .join(organ_dir_name(&j_feature))
            .join(app_name(donor))
    }

    /// Donors from the training set containing `feature`, in sample order.
    ///
    /// Fails with [`ApgError::UnknownFeature`] when the feature is not one of
    /// the model's benign features, which means the wrong model is in use.
    pub fn search_for_organ(
        feature: &str,
        model: &LinearModel,
        limit: Option<usize>,
    ) -> crate::error::Result<Vec<PathBuf>> {
        if !model.benign_weights().any(|w| w.feature == feature) {
            return Err(ApgError::UnknownFeature {
                feature: feature.to_string(),
            });
        }

        let donors = model
            .train
            .iter()
            .filter(|s| s.features.get(feature).is_some_and(|v| *v != 0.0))
            .map(|s| s.sample_path.clone());
        Ok(match limit {
            Some(n) => donors.take(n).collect(),
            None => donors.collect(),
        })
    }

    /// Harvest the organ implementing `feature` from `donor`.
    ///
    /// Returns `Ok(None)` when the organ is unavailable: a previous attempt
    /// failed, the donor is missing, or a tool timed out, exited non-zero or
    /// could not isolate the feature. Other errors propagate.
    pub fn harvest_organ_from_donor(&self, feature: &str, donor: &Path) -> Result<Option<Organ>> {
        let location = self.location(feature, donor);
        let failed_marker = location.join(FAILED_MARKER);

        if failed_marker.exists() {
            tracing::warn!(
                "Previously failed to extract organ for feature {} from {}",
                feature,
                donor.display()
            );
            return Ok(None);
        }

        if location.join(ORGAN_FILE).exists() {
            tracing::debug!(
                "Already extracted organ for feature {} from {}",
                feature,
                donor.display()
            );
            return Organ::load(&location).map(Some);
        }

        if !donor.is_file() {
            tracing::warn!("Donor app not found: {}", donor.display());
            return Ok(None);
        }

        fs::create_dir_all(&location)
            .with_context(|| format!("Failed to create {}", location.display()))?;

        let start = Instant::now();
        let failure_occurred = || -> Result<Option<Organ>> {
            write_atomic(&failed_marker, b"")?;
            tracing::warn!(
                "Organ harvest failed after {:.1}s",
                start.elapsed().as_secs_f64()
            );
            Ok(None)
        };

        let (category, j_feature) = to_j_feature(feature);
        tracing::debug!("Extracting {} from {}...", j_feature, donor.display());

        let mut organ = Organ::new(feature, donor, location.clone());
        match self
            .tools
            .extract_slice(donor, &j_feature, slice_feature_type(&category))
        {
            Ok(SliceExtraction::Extracted(SliceStatus::Sliced)) => {
                tracing::info!("Organ harvest successful!");
            }
            Ok(SliceExtraction::Extracted(SliceStatus::NeedsVein)) => {
                tracing::info!("Organ harvest successful, but needs vein");
                organ.needs_vein = true;
            }
            Ok(SliceExtraction::NotFound) => return failure_occurred(),
            Err(e) if e.is_transient() => {
                tracing::warn!("Slice extraction failed: {}", e);
                return failure_occurred();
            }
            Err(e) => return Err(e.into()),
        }

        organ.classes = read_class_list(&location.join(CLASSES_FILE))
            .into_iter()
            .collect();

        // Weigh the organ by injecting it into the blank template
        fs::create_dir_all(self.tools.tmp_dir())?;
        let operating_room = TempDir::new_in(self.tools.tmp_dir())
            .context("Failed to create operating room")?;
        let template = operating_room.path().join("template.apk");
        fs::copy(&self.template_apk, &template).with_context(|| {
            format!("Failed to copy template {}", self.template_apk.display())
        })?;

        match self.tools.inject_into_template(&template, &location) {
            Ok(true) => tracing::debug!("Injection to template completed successfully"),
            Ok(false) => return failure_occurred(),
            Err(e) if e.is_transient() => {
                tracing::warn!("Template injection failed: {}", e);
                return failure_occurred();
            }
            Err(e) => return Err(e.into()),
        }

        let post_op = operating_room.path().join("sootOutput").join("template.apk");
        organ.feature_dict = match self.tools.extract_features(&post_op) {
            Ok(features) => features,
            Err(e) if e.downcast_ref::<OracleError>().is_some_and(OracleError::is_transient) => {
                tracing::warn!("Feature extraction of the weighed organ failed: {:#}", e);
                return failure_occurred();
            }
            Err(e) => return Err(e),
        };
        organ.count_permissions();
        organ.extraction_time = start.elapsed().as_secs_f64();
        tracing::info!("Extraction time: {:.1}s", organ.extraction_time);

        organ.save()?;
        Ok(Some(organ))
    }

    /// Harvest organs for the `organ_depth` most benign features from up to
    /// `donor_depth` donors each, across `threads` workers.
    ///
    /// A failed harvest never stops the batch. Returns the number of organs
    /// available afterwards.
    pub fn mass_organ_harvest(
        &self,
        model: &LinearModel,
        organ_depth: usize,
        donor_depth: usize,
        threads: usize,
    ) -> Result<usize> {
        tracing::info!("Attempting to extract the necessary organs...");

        let mut jobs: Vec<(String, PathBuf)> = Vec::new();
        for weight in model.benign_weights().take(organ_depth) {
            tracing::debug!("Searching for {} in donors...", weight.feature);
            let donors = Self::search_for_organ(&weight.feature, model, Some(donor_depth))?;
            tracing::debug!("Found {} in {} donor(s)", weight.feature, donors.len());
            jobs.extend(donors.into_iter().map(|d| (weight.feature.clone(), d)));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .context("Failed to build harvest thread pool")?;

        let harvested = pool.install(|| {
            jobs.par_iter()
                .filter(|(feature, donor)| match self.harvest_organ_from_donor(feature, donor) {
                    Ok(organ) => organ.is_some(),
                    Err(e) => {
                        tracing::error!(
                            "Harvest of {} from {} fell over: {:#}",
                            feature,
                            donor.display(),
                            e
                        );
                        false
                    }
                })
                .count()
        });

        tracing::info!("Harvested {}/{} organs", harvested, jobs.len());
        Ok(harvested)
    }

    /// Every successfully harvested organ for the given features, ordered by
    /// feature then donor.
    pub fn fetch_harvested(&self, features: &[String]) -> Vec<Organ> {
        let mut organs = Vec::new();
        for feature in features {
            let (_, j_feature) = to_j_feature(feature);
            let feature_dir = self.ice_box.join(organ_dir_name(&j_feature));

            let mut locations: Vec<PathBuf> = WalkDir::new(&feature_dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_dir())
                .map(|e| e.into_path())
                .filter(|p| p.join(ORGAN_FILE).is_file() && !p.join(FAILED_MARKER).exists())
                .collect();
            locations.sort();

            for location in locations {
                match Organ::load(&location) {
                    Ok(organ) => organs.push(organ),
                    Err(e) => tracing::warn!(
                        "Skipping unreadable organ in {}: {:#}",
                        location.display(),
                        e
                    ),
                }
            }
        }
        tracing::info!("Fetched {} harvested organs", organs.len());
        organs
    }
}
