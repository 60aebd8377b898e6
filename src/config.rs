//! Experiment configuration.
//!
//! A single immutable [`Config`] is loaded once from YAML, validated, and then
//! passed by reference to every component.

use crate::error::{ApgError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Serialized target model
    pub model: PathBuf,

    // Toolchain components
    pub java: String,
    pub extractor: PathBuf,
    pub injector: PathBuf,
    pub template_injector: PathBuf,
    pub cc_calculator: PathBuf,
    pub class_lister: PathBuf,
    pub resigner: PathBuf,
    /// Directory containing `drebin.py`
    pub feature_extractor: PathBuf,
    pub feature_extractor_interpreter: String,

    // Timeouts, in seconds
    pub extractor_timeout: u64,
    pub cc_calculator_timeout: u64,
    pub class_lister_timeout: u64,
    pub feature_extractor_timeout: u64,
    pub template_injector_timeout: u64,
    pub injector_timeout: u64,
    pub resigner_timeout: u64,

    // Injection inputs
    pub android_sdk: PathBuf,
    pub template_path: PathBuf,
    pub mined_slices: PathBuf,
    pub opaque_pred: PathBuf,

    // Storage
    pub tmp_dir: PathBuf,
    pub ice_box: PathBuf,
    pub results_dir: PathBuf,
    pub goodware_location: PathBuf,
    /// Apps stored with a radix (radix 3: `root/0/0/A/00A384545.apk`)
    pub storage_radix: usize,

    // Retry and worker pools
    pub tries: u32,
    pub nprocs_preload: usize,
    pub nprocs_evasion: usize,
    pub nprocs_transplant: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: PathBuf::from("data/models/svm.json"),
            java: "java".to_string(),
            extractor: PathBuf::from("components/extractor.jar"),
            injector: PathBuf::from("components/injector.jar"),
            template_injector: PathBuf::from("components/templateinjector.jar"),
            cc_calculator: PathBuf::from("components/cccalculator.jar"),
            class_lister: PathBuf::from("components/classlister.jar"),
            resigner: PathBuf::from("apk-signer.jar"),
            feature_extractor: PathBuf::new(),
            feature_extractor_interpreter: "python2".to_string(),
            extractor_timeout: 300,
            cc_calculator_timeout: 600,
            class_lister_timeout: 180,
            feature_extractor_timeout: 600,
            template_injector_timeout: 600,
            injector_timeout: 3600,
            resigner_timeout: 120,
            android_sdk: PathBuf::new(),
            template_path: PathBuf::from("template"),
            mined_slices: PathBuf::from("mined-slices"),
            opaque_pred: PathBuf::from("opaque-preds/sootOutput"),
            tmp_dir: std::env::temp_dir(),
            ice_box: PathBuf::from("ice-box"),
            results_dir: PathBuf::from("results"),
            goodware_location: PathBuf::new(),
            storage_radix: 0,
            tries: 1,
            nprocs_preload: 8,
            nprocs_evasion: 12,
            nprocs_transplant: 8,
        }
    }
}

impl Config {
    /// Load and validate a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ApgError::path_not_found(path));
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)
            .map_err(|e| ApgError::configuration(format!("invalid YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tries == 0 {
            return Err(ApgError::configuration("tries must be greater than 0"));
        }
        for (name, size) in [
            ("nprocs_preload", self.nprocs_preload),
            ("nprocs_evasion", self.nprocs_evasion),
            ("nprocs_transplant", self.nprocs_transplant),
        ] {
            if size == 0 {
                return Err(ApgError::configuration(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        for (name, secs) in [
            ("extractor_timeout", self.extractor_timeout),
            ("cc_calculator_timeout", self.cc_calculator_timeout),
            ("class_lister_timeout", self.class_lister_timeout),
            ("feature_extractor_timeout", self.feature_extractor_timeout),
            ("template_injector_timeout", self.template_injector_timeout),
            ("injector_timeout", self.injector_timeout),
            ("resigner_timeout", self.resigner_timeout),
        ] {
            if secs == 0 {
                return Err(ApgError::configuration(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        Ok(())
    }

    pub fn extractor_timeout(&self) -> Duration {
        Duration::from_secs(self.extractor_timeout)
    }

    pub fn cc_calculator_timeout(&self) -> Duration {
        Duration::from_secs(self.cc_calculator_timeout)
    }

    pub fn class_lister_timeout(&self) -> Duration {
        Duration::from_secs(self.class_lister_timeout)
    }

    pub fn feature_extractor_timeout(&self) -> Duration {
        Duration::from_secs(self.feature_extractor_timeout)
    }

    pub fn template_injector_timeout(&self) -> Duration {
        Duration::from_secs(self.template_injector_timeout)
    }

    pub fn injector_timeout(&self) -> Duration {
        Duration::from_secs(self.injector_timeout)
    }

    pub fn resigner_timeout(&self) -> Duration {
        Duration::from_secs(self.resigner_timeout)
    }

    /// Blank application that organs are test-injected into.
    pub fn template_apk(&self) -> PathBuf {
        self.template_path.join("template.apk")
    }

    /// Output directory of a tagged run.
    pub fn run_dir(&self, run_tag: &str) -> PathBuf {
        self.results_dir.join(run_tag)
    }

    /// Host preload cache.
    pub fn host_cache_dir(&self) -> PathBuf {
        self.tmp_dir.join("hosts")
    }
}
