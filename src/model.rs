//! The target linear classifier.
//!
//! The engine treats the classifier as an opaque scoring oracle through the
//! [`Classifier`] trait. [`LinearModel`] is the concrete implementation: a
//! fitted linear model (coefficients + intercept) serialised as JSON together
//! with the training and test samples the attack needs for donor search and
//! true-positive selection.

use crate::error::{ApgError, Result};
use crate::features::FeatureDict;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Current model file schema.
pub const MODEL_SCHEMA_VERSION: u32 = 1;

/// Feature -> classifier weight.
pub type WeightMap = HashMap<String, f64>;

/// Predicted class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Benign,
    Malware,
}

/// Read-only scoring oracle shared by every worker.
pub trait Classifier: Send + Sync {
    /// Signed distance from the decision boundary; positive means malware.
    fn decision_function(&self, features: &FeatureDict) -> f64;

    /// Weight of every feature known to the classifier.
    fn weights(&self) -> &WeightMap;

    /// Project a feature dict onto the classifier's dense feature space.
    fn dense_vector(&self, features: &FeatureDict) -> Vec<f64>;

    fn predict(&self, features: &FeatureDict) -> Label {
        if self.decision_function(features) > 0.0 {
            Label::Malware
        } else {
            Label::Benign
        }
    }
}

/// A feature with its column index and learned weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedWeight {
    pub feature: String,
    pub index: usize,
    pub weight: f64,
}

/// A labelled sample from the model's dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub sample_path: PathBuf,
    #[serde(default)]
    pub sha256: Option<String>,
    /// 1 = malware, 0 = goodware.
    pub label: u8,
    #[serde(default)]
    pub features: FeatureDict,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelFile {
    schema_version: u32,
    feature_names: Vec<String>,
    coefficients: Vec<f64>,
    intercept: f64,
    #[serde(default)]
    train: Vec<Sample>,
    #[serde(default)]
    test: Vec<Sample>,
}

/// Fitted linear model.
#[derive(Debug, Clone)]
pub struct LinearModel {
    feature_names: Vec<String>,
    coefficients: Vec<f64>,
    intercept: f64,
    columns: HashMap<String, usize>,
    weight_dict: WeightMap,
    feature_weights: Vec<RankedWeight>,
    pub train: Vec<Sample>,
    pub test: Vec<Sample>,
}

impl LinearModel {
    /// Build a model from parallel name/coefficient lists.
    pub fn new(feature_names: Vec<String>, coefficients: Vec<f64>, intercept: f64) -> Result<Self> {
        if feature_names.len() != coefficients.len() {
            return Err(ApgError::invalid_model(format!(
                "{} feature names but {} coefficients",
                feature_names.len(),
                coefficients.len()
            )));
        }

        let columns: HashMap<String, usize> = feature_names
            .iter()
            .enumerate()
            .map(|(i, f)| (f.clone(), i))
            .collect();
        if columns.len() != feature_names.len() {
            return Err(ApgError::invalid_model("duplicate feature names"));
        }

        let weight_dict = feature_names
            .iter()
            .cloned()
            .zip(coefficients.iter().copied())
            .collect();

        let mut feature_weights: Vec<RankedWeight> = feature_names
            .iter()
            .zip(&coefficients)
            .enumerate()
            .map(|(index, (feature, weight))| RankedWeight {
                feature: feature.clone(),
                index,
                weight: *weight,
            })
            .collect();
        // Stable: equal weights keep column order
        feature_weights.sort_by(|a, b| a.weight.total_cmp(&b.weight));

        Ok(Self {
            feature_names,
            coefficients,
            intercept,
            columns,
            weight_dict,
            feature_weights,
            train: Vec::new(),
            test: Vec::new(),
        })
    }

    /// Attach the training/test samples.
    pub fn with_samples(mut self, train: Vec<Sample>, test: Vec<Sample>) -> Self {
        self.train = train;
        self.test = test;
        self
    }

    /// Load a model file written by [`LinearModel::save`].
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model file {}", path.display()))?;
        let file: ModelFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse model file {}", path.display()))?;
        if file.schema_version != MODEL_SCHEMA_VERSION {
            return Err(ApgError::SchemaVersion {
                kind: "model",
                found: file.schema_version,
                expected: MODEL_SCHEMA_VERSION,
            }
            .into());
        }
        let model = Self::new(file.feature_names, file.coefficients, file.intercept)?;
        tracing::debug!(
            "Loaded model with {} features ({} train / {} test samples)",
            model.feature_names.len(),
            file.train.len(),
            file.test.len()
        );
        Ok(model.with_samples(file.train, file.test))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let file = ModelFile {
            schema_version: MODEL_SCHEMA_VERSION,
            feature_names: self.feature_names.clone(),
            coefficients: self.coefficients.clone(),
            intercept: self.intercept,
            train: self.train.clone(),
            test: self.test.clone(),
        };
        crate::layout::write_json_atomic(path, &file)
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    /// Benign-leaning weights (strictly negative), most influential first.
    pub fn benign_weights(&self) -> impl Iterator<Item = &RankedWeight> {
        self.feature_weights.iter().filter(|w| w.weight < 0.0)
    }

    /// Malware-leaning weights (strictly positive), most influential first.
    pub fn malicious_weights(&self) -> impl Iterator<Item = &RankedWeight> {
        self.feature_weights.iter().rev().filter(|w| w.weight > 0.0)
    }
}

impl Classifier for LinearModel {
    fn decision_function(&self, features: &FeatureDict) -> f64 {
        features
            .iter()
            .filter_map(|(k, v)| self.weight_dict.get(k).map(|w| w * v))
            .sum::<f64>()
            + self.intercept
    }

    fn weights(&self) -> &WeightMap {
        &self.weight_dict
    }

    fn dense_vector(&self, features: &FeatureDict) -> Vec<f64> {
        let mut dense = vec![0.0; self.feature_names.len()];
        for (key, value) in features {
            if let Some(i) = self.columns.get(key) {
                dense[*i] = *value;
            }
        }
        dense
    }
}
