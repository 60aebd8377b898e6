//! On-disk layout of an experiment's output directory and the atomic write
//! helpers every persisted artifact goes through.
//!
//! Writers never modify a file in place: content is written to a temporary
//! file in the destination directory and renamed over the final path, so a
//! concurrent reader (or a second worker racing on the same key) observes
//! either nothing or a complete file.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::features::app_name;

/// Subdirectories of a run's output directory.
pub const SUCCESS_DIR: &str = "success";
pub const FAILURE_DIR: &str = "failure";
pub const RECORDS_DIR: &str = "records";
pub const ADV_FEATURES_DIR: &str = "adv-features";
pub const POSTOP_DIR: &str = "postop";

/// Paths of everything persisted for a run.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Create the root and all subdirectories.
    pub fn create(&self) -> Result<()> {
        for dir in [
            SUCCESS_DIR,
            FAILURE_DIR,
            RECORDS_DIR,
            ADV_FEATURES_DIR,
            POSTOP_DIR,
        ] {
            let path = self.root.join(dir);
            fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `records/<host>.record.json`
    pub fn record_path(&self, host_name: &str) -> PathBuf {
        self.root
            .join(RECORDS_DIR)
            .join(format!("{host_name}.record.json"))
    }

    /// `adv-features/<host>.adv.json`
    pub fn adv_features_path(&self, host_name: &str) -> PathBuf {
        self.root
            .join(ADV_FEATURES_DIR)
            .join(format!("{host_name}.adv.json"))
    }

    /// `success/report-<host>.json`
    pub fn success_path(&self, host_name: &str) -> PathBuf {
        self.root
            .join(SUCCESS_DIR)
            .join(format!("report-{host_name}.json"))
    }

    /// `failure/<app name>.txt`; keyed by app name so the record path, the
    /// host path and the host name all resolve to the same log.
    pub fn failure_path(&self, host: &Path) -> PathBuf {
        self.root
            .join(FAILURE_DIR)
            .join(format!("{}.txt", app_name(host)))
    }

    /// `postop/<host>.adv`
    pub fn postop_path(&self, host_name: &str) -> PathBuf {
        self.root.join(POSTOP_DIR).join(format!("{host_name}.adv"))
    }

    /// All patient records, sorted by path.
    pub fn records(&self) -> Vec<PathBuf> {
        list_files(&self.root.join(RECORDS_DIR), ".record.json")
    }

    /// All adversarial feature dumps, sorted by path.
    pub fn adv_feature_files(&self) -> Vec<PathBuf> {
        list_files(&self.root.join(ADV_FEATURES_DIR), ".adv.json")
    }

    /// App names with a failure log.
    pub fn failed_apps(&self) -> Vec<String> {
        list_files(&self.root.join(FAILURE_DIR), ".txt")
            .iter()
            .map(|p| app_name(p))
            .collect()
    }

    /// Persist a failure log entry for a host, replacing any previous one.
    pub fn log_failure(&self, host: &Path, message: &str) -> Result<()> {
        let path = self.failure_path(host);
        tracing::error!("{}", message);
        tracing::error!("Writing log to {}", path.display());
        write_atomic(&path, format!("{} @ {}\n", app_name(host), message).as_bytes())
    }

    /// Remove a stale failure log; returns whether one existed.
    pub fn clear_failure(&self, host: &Path) -> Result<bool> {
        let path = self.failure_path(host);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

fn list_files(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().ends_with(suffix))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Resolve a sample's path from its name, honouring a storage radix
/// (radix 3: `root/0/0/A/00A384545.apk`).
pub fn resolve_sample_filename(root: &Path, name: &str, radix: usize, ext: &str) -> PathBuf {
    let stem = name.split('.').next().unwrap_or(name);
    let mut path = root.to_path_buf();
    for c in stem.chars().take(radix) {
        path.push(c.to_string());
    }
    path.push(format!("{stem}.{ext}"));
    path
}

/// Write bytes atomically: temporary file in the same directory, then rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut temp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    temp.write_all(contents)?;
    temp.flush()?;
    temp.persist(path)
        .with_context(|| format!("Failed to move temp file to {}", path.display()))?;
    Ok(())
}

/// Serialise `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json)
}

/// Write JSON only if nothing exists at `path` yet.
pub fn write_json_once<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    write_json_atomic(path, value)?;
    Ok(true)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Move a file, falling back to copy + remove across filesystems.
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    let temp = to.with_extension("tmp");
    fs::copy(from, &temp)
        .with_context(|| format!("Failed to copy {} to {}", from.display(), temp.display()))?;
    fs::rename(&temp, to)?;
    fs::remove_file(from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let layout = OutputLayout::new("/out");
        assert_eq!(
            layout.record_path("AB.apk"),
            PathBuf::from("/out/records/AB.apk.record.json")
        );
        assert_eq!(
            layout.success_path("AB.apk"),
            PathBuf::from("/out/success/report-AB.apk.json")
        );
        assert_eq!(
            layout.failure_path(Path::new("/out/records/AB.apk.record.json")),
            PathBuf::from("/out/failure/AB.txt")
        );
        assert_eq!(
            layout.failure_path(Path::new("/apps/AB.apk")),
            PathBuf::from("/out/failure/AB.txt")
        );
        assert_eq!(layout.postop_path("AB.apk"), PathBuf::from("/out/postop/AB.apk.adv"));
    }

    #[test]
    fn test_failure_log_roundtrip() {
        let dir = TempDir::new().unwrap();
        let layout = OutputLayout::new(dir.path());
        layout.create().unwrap();

        let host = Path::new("/apps/CAFE.apk");
        layout.log_failure(host, "boom").unwrap();
        let contents = fs::read_to_string(layout.failure_path(host)).unwrap();
        assert_eq!(contents, "CAFE @ boom\n");
        assert_eq!(layout.failed_apps(), vec!["CAFE".to_string()]);

        assert!(layout.clear_failure(host).unwrap());
        assert!(!layout.clear_failure(host).unwrap());
        assert!(layout.failed_apps().is_empty());
    }

    #[test]
    fn test_resolve_sample_filename() {
        let root = Path::new("/goodware");
        assert_eq!(
            resolve_sample_filename(root, "00A384545", 3, "apk"),
            PathBuf::from("/goodware/0/0/A/00A384545.apk")
        );
        assert_eq!(
            resolve_sample_filename(root, "00A384545.apk", 0, "apk"),
            PathBuf::from("/goodware/00A384545.apk")
        );
    }

    #[test]
    fn test_write_json_once_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.json");
        assert!(write_json_once(&path, &1).unwrap());
        assert!(!write_json_once(&path, &2).unwrap());
        let value: i32 = read_json(&path).unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.json");
        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
