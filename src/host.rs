//! The malware sample under attack.

use crate::config::Config;
use crate::features::{permission_features, FeatureDict};
use crate::layout::{read_json, write_json_atomic};
use crate::oracle::Toolchain;
use anyhow::{Context, Result};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Class list file written by the class lister into the scratch directory.
const CLASSES_FILE: &str = "all_classes.txt";

/// Static analysis results for a host, cached so a preload pass makes later
/// loads cheap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostProfile {
    pub name: String,
    pub path: PathBuf,
    pub features: FeatureDict,
    pub permissions: BTreeSet<String>,
    pub classes: BTreeSet<String>,
    pub size: u64,
    pub avg_cc: f64,
}

/// A host loaded for attack, owning a scratch directory that is removed when
/// the host is dropped.
#[derive(Debug)]
pub struct Host {
    pub name: String,
    /// Original sample location
    pub path: PathBuf,
    pub features: FeatureDict,
    /// Declared permission features (`*android_permission*` keys)
    pub permissions: FxHashSet<String>,
    /// Referenced class names
    pub classes: FxHashSet<String>,
    pub size: u64,
    pub avg_cc: f64,
    scratch: TempDir,
}

impl Host {
    /// Load a host, reusing cached analysis results when available.
    pub fn load(path: &Path, config: &Config, tools: &Toolchain) -> Result<Self> {
        let profile = HostProfile::load_or_analyze(path, config, tools)?;
        Self::from_profile(profile, &config.tmp_dir)
    }

    /// Build a host from an existing profile, copying the sample into a fresh
    /// scratch directory under `tmp_dir`.
    pub fn from_profile(profile: HostProfile, tmp_dir: &Path) -> Result<Self> {
        fs::create_dir_all(tmp_dir)
            .with_context(|| format!("Failed to create {}", tmp_dir.display()))?;
        let scratch = TempDir::new_in(tmp_dir).context("Failed to create host scratch directory")?;
        let working_copy = scratch.path().join(&profile.name);
        fs::copy(&profile.path, &working_copy).with_context(|| {
            format!(
                "Failed to copy {} into {}",
                profile.path.display(),
                scratch.path().display()
            )
        })?;

        Ok(Self {
            name: profile.name,
            path: profile.path,
            features: profile.features,
            permissions: profile.permissions.into_iter().collect(),
            classes: profile.classes.into_iter().collect(),
            size: profile.size,
            avg_cc: profile.avg_cc,
            scratch,
        })
    }

    /// Scratch directory reclaimed when the host is dropped.
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Working copy of the sample inside the scratch directory.
    pub fn working_copy(&self) -> PathBuf {
        self.scratch.path().join(&self.name)
    }
}

impl HostProfile {
    /// Run the toolchain over a sample.
    pub fn analyze(path: &Path, config: &Config, tools: &Toolchain) -> Result<Self> {
        if !path.is_file() {
            anyhow::bail!("Host sample not found: {}", path.display());
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("Host path has no file name: {}", path.display()))?;

        let features = tools
            .extract_features(path)
            .with_context(|| format!("Feature extraction failed for {name}"))?;
        let permissions = permission_features(&features).cloned().collect();

        fs::create_dir_all(&config.tmp_dir)?;
        let lister_dir = TempDir::new_in(&config.tmp_dir)?;
        let classes = tools
            .list_classes(path, &lister_dir.path().join(CLASSES_FILE))
            .into_iter()
            .collect();

        let size = fs::metadata(path)?.len();
        let avg_cc = tools.average_cc(path);

        Ok(Self {
            name,
            path: path.to_path_buf(),
            features,
            permissions,
            classes,
            size,
            avg_cc,
        })
    }

    /// Cached profile path for a sample.
    pub fn cache_path(config: &Config, path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        config.host_cache_dir().join(format!("{name}.host.json"))
    }

    /// Load a cached profile, or analyze the sample and cache the result.
    pub fn load_or_analyze(path: &Path, config: &Config, tools: &Toolchain) -> Result<Self> {
        let cache = Self::cache_path(config, path);
        if cache.exists() {
            match read_json::<HostProfile>(&cache) {
                Ok(profile) if profile.path == path => {
                    tracing::debug!("Host {} loaded from cache", profile.name);
                    return Ok(profile);
                }
                Ok(_) => tracing::warn!("Host cache {} belongs to another sample", cache.display()),
                Err(e) => tracing::warn!("Ignoring unreadable host cache {}: {:#}", cache.display(), e),
            }
        }

        let profile = Self::analyze(path, config, tools)?;
        write_json_atomic(&cache, &profile)?;
        Ok(profile)
    }
}
