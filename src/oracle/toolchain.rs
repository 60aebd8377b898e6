//! Typed operations over the raw toolchain oracles.

use super::parsing::{
    parse_avg_cc, parse_injection_trailer, parse_slice_status, template_injection_done,
};
use super::{CommandOracle, InjectionTrailer, Oracle, SliceStatus};
use crate::config::Config;
use crate::error::OracleError;
use crate::features::{feature_dict_from_json, FeatureDict};
use anyhow::{Context, Result};
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use walkdir::WalkDir;

/// Result of a slice extraction attempt that ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceExtraction {
    Extracted(SliceStatus),
    /// The extractor ran but could not isolate the feature.
    NotFound,
}

/// The set of external tools the engine drives, with the configuration they
/// need. Cheap to clone; shared read-only across workers.
#[derive(Clone)]
pub struct Toolchain {
    /// Carves a feature's code slice out of a donor
    pub slice_extractor: Arc<dyn Oracle>,
    /// Transplants organs into a host
    pub injector: Arc<dyn Oracle>,
    /// Transplants a single organ into the blank template app
    pub template_injector: Arc<dyn Oracle>,
    pub resigner: Arc<dyn Oracle>,
    /// Static feature extractor
    pub feature_extractor: Arc<dyn Oracle>,
    pub cc_calculator: Arc<dyn Oracle>,
    pub class_lister: Arc<dyn Oracle>,
    settings: ToolSettings,
}

#[derive(Debug, Clone)]
struct ToolSettings {
    android_sdk: PathBuf,
    ice_box: PathBuf,
    mined_slices: PathBuf,
    opaque_pred: PathBuf,
    tmp_dir: PathBuf,
    extractor_timeout: Duration,
    cc_calculator_timeout: Duration,
    class_lister_timeout: Duration,
    feature_extractor_timeout: Duration,
    template_injector_timeout: Duration,
    injector_timeout: Duration,
    resigner_timeout: Duration,
}

impl ToolSettings {
    fn from_config(config: &Config) -> Self {
        Self {
            android_sdk: config.android_sdk.clone(),
            ice_box: config.ice_box.clone(),
            mined_slices: config.mined_slices.clone(),
            opaque_pred: config.opaque_pred.clone(),
            tmp_dir: config.tmp_dir.clone(),
            extractor_timeout: config.extractor_timeout(),
            cc_calculator_timeout: config.cc_calculator_timeout(),
            class_lister_timeout: config.class_lister_timeout(),
            feature_extractor_timeout: config.feature_extractor_timeout(),
            template_injector_timeout: config.template_injector_timeout(),
            injector_timeout: config.injector_timeout(),
            resigner_timeout: config.resigner_timeout(),
        }
    }
}

impl std::fmt::Debug for Toolchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolchain")
            .field("slice_extractor", &self.slice_extractor.name())
            .field("injector", &self.injector.name())
            .field("template_injector", &self.template_injector.name())
            .field("resigner", &self.resigner.name())
            .field("feature_extractor", &self.feature_extractor.name())
            .field("settings", &self.settings)
            .finish()
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl Toolchain {
    /// Bind every oracle to its native tool as described by `config`.
    pub fn from_config(config: &Config) -> Self {
        let java = |jar: &Path| -> Arc<dyn Oracle> {
            Arc::new(CommandOracle::java_component(&config.java, jar))
        };
        let drebin = CommandOracle::new("drebin", config.feature_extractor_interpreter.clone())
            .arg("./drebin.py")
            .current_dir(&config.feature_extractor);

        Self {
            slice_extractor: java(&config.extractor),
            injector: java(&config.injector),
            template_injector: java(&config.template_injector),
            resigner: java(&config.resigner),
            feature_extractor: Arc::new(drebin),
            cc_calculator: java(&config.cc_calculator),
            class_lister: java(&config.class_lister),
            settings: ToolSettings::from_config(config),
        }
    }

    /// Replace individual oracles, keeping the settings from `config`.
    pub fn with_oracles(config: &Config, oracles: ToolOracles) -> Self {
        Self {
            slice_extractor: oracles.slice_extractor,
            injector: oracles.injector,
            template_injector: oracles.template_injector,
            resigner: oracles.resigner,
            feature_extractor: oracles.feature_extractor,
            cc_calculator: oracles.cc_calculator,
            class_lister: oracles.class_lister,
            settings: ToolSettings::from_config(config),
        }
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.settings.tmp_dir
    }

    /// Run the static feature extractor on an app and return its features.
    ///
    /// The extractor writes `results/<hash>.json` into a scratch directory; the
    /// content-hash field is dropped from the returned dict.
    pub fn extract_features(&self, app: &Path) -> Result<FeatureDict> {
        let app = fs::canonicalize(app)
            .with_context(|| format!("App not found: {}", app.display()))?;
        fs::create_dir_all(&self.settings.tmp_dir)?;
        let output_dir = TempDir::new_in(&self.settings.tmp_dir)
            .context("Failed to create feature extraction directory")?;

        self.feature_extractor.run(
            &[path_arg(&app), path_arg(output_dir.path())],
            Some(self.settings.feature_extractor_timeout),
        )?;

        let results_file = WalkDir::new(output_dir.path().join("results"))
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .find(|p| p.extension().is_some_and(|ext| ext == "json"))
            .ok_or_else(|| {
                OracleError::malformed(
                    self.feature_extractor.name(),
                    format!("no results JSON for {}", app.display()),
                )
            })?;

        tracing::debug!("Extractor results in: {}", results_file.display());
        let raw: BTreeMap<String, serde_json::Value> =
            serde_json::from_slice(&fs::read(&results_file)?).map_err(|e| {
                OracleError::malformed(self.feature_extractor.name(), e.to_string())
            })?;
        Ok(feature_dict_from_json(raw))
    }

    /// Carve the slice implementing `j_feature` out of `donor` into the ice box.
    ///
    /// Timeouts and non-zero exits are returned as transient [`OracleError`]s.
    pub fn extract_slice(
        &self,
        donor: &Path,
        j_feature: &str,
        feature_type: &str,
    ) -> Result<SliceExtraction, OracleError> {
        // The extractor concatenates the feature directory onto this path
        let mut ice_box = path_arg(&self.settings.ice_box);
        if !ice_box.ends_with(std::path::MAIN_SEPARATOR) {
            ice_box.push(std::path::MAIN_SEPARATOR);
        }
        let report = self.slice_extractor.run(
            &[
                j_feature.to_string(),
                path_arg(donor),
                feature_type.to_string(),
                ice_box,
                path_arg(&self.settings.android_sdk),
            ],
            Some(self.settings.extractor_timeout),
        )?;

        match parse_slice_status(&report.lines()) {
            Some(status) => Ok(SliceExtraction::Extracted(status)),
            None => {
                let lines = report.lines();
                let tail = lines[lines.len().saturating_sub(3)..].join(" | ");
                tracing::info!("Slice extraction unsuccessful: {}", tail);
                Ok(SliceExtraction::NotFound)
            }
        }
    }

    /// Inject an organ into a copy of the template app. Returns whether the
    /// template injector reported completion.
    pub fn inject_into_template(&self, template: &Path, organ_dir: &Path) -> Result<bool, OracleError> {
        let report = self.template_injector.run(
            &[
                path_arg(template),
                path_arg(organ_dir),
                path_arg(&self.settings.android_sdk),
            ],
            Some(self.settings.template_injector_timeout),
        )?;
        Ok(template_injection_done(&report.lines()))
    }

    /// Transplant the organs into a host.
    pub fn inject(
        &self,
        host: &Path,
        organ_dirs: &str,
        output_dir: &Path,
        permission_file: Option<&Path>,
    ) -> Result<InjectionTrailer, OracleError> {
        let mut args = vec![
            path_arg(host),
            organ_dirs.to_string(),
            path_arg(output_dir),
            path_arg(&self.settings.android_sdk),
            path_arg(&self.settings.mined_slices),
            path_arg(&self.settings.opaque_pred),
        ];
        if let Some(perm) = permission_file {
            args.push(path_arg(perm));
        }
        tracing::info!("Performing organ transplantation!");
        let report = self.injector.run(&args, Some(self.settings.injector_timeout))?;
        parse_injection_trailer(self.injector.name(), &report.lines())
    }

    /// Re-sign an app in place.
    pub fn resign(&self, app: &Path) -> Result<(), OracleError> {
        self.resigner.run(
            &["--overwrite".to_string(), "-a".to_string(), path_arg(app)],
            Some(self.settings.resigner_timeout),
        )?;
        Ok(())
    }

    /// Average cyclomatic complexity, or `-1.0` when it cannot be computed.
    pub fn average_cc(&self, app: &Path) -> f64 {
        match self.cc_calculator.run(
            &[path_arg(app), path_arg(&self.settings.android_sdk)],
            Some(self.settings.cc_calculator_timeout),
        ) {
            Ok(report) => parse_avg_cc(&report.lines()).unwrap_or(-1.0),
            Err(e) => {
                tracing::warn!("CC calculation failed for {}: {}", app.display(), e);
                -1.0
            }
        }
    }

    /// Classes contained in an app; empty when the lister fails.
    pub fn list_classes(&self, app: &Path, out_file: &Path) -> FxHashSet<String> {
        if let Err(e) = self.class_lister.run(
            &[
                path_arg(app),
                path_arg(&self.settings.android_sdk),
                path_arg(out_file),
            ],
            Some(self.settings.class_lister_timeout),
        ) {
            tracing::warn!("Class listing failed for {}: {}", app.display(), e);
        }
        read_class_list(out_file)
    }
}

/// Oracles for [`Toolchain::with_oracles`].
pub struct ToolOracles {
    pub slice_extractor: Arc<dyn Oracle>,
    pub injector: Arc<dyn Oracle>,
    pub template_injector: Arc<dyn Oracle>,
    pub resigner: Arc<dyn Oracle>,
    pub feature_extractor: Arc<dyn Oracle>,
    pub cc_calculator: Arc<dyn Oracle>,
    pub class_lister: Arc<dyn Oracle>,
}

/// Read a newline-separated class list; missing file means no classes.
pub(crate) fn read_class_list(path: &Path) -> FxHashSet<String> {
    fs::read_to_string(path)
        .map(|contents| {
            contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
