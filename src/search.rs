//! Greedy feature-space evasion search.
//!
//! Organs are picked one at a time, best contribution first, and their
//! features merged into a working copy of the host's features until the
//! classifier score drops to `-margin`. Nothing physical happens here: the
//! output is an adversarial feature estimate plus a [`PatientRecord`]
//! telling the transplanter which organs to graft.

use crate::config::Config;
use crate::features::{category_counts, FeatureDict};
use crate::host::Host;
use crate::layout::{write_json_atomic, OutputLayout};
use crate::model::{Classifier, Label};
use crate::organ::Organ;
use crate::oracle::Toolchain;
use crate::ranker::contributions;
use crate::record::PatientRecord;
use anyhow::Result;
use rustc_hash::FxHashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Initial target {host} is not predicted as malware (score {score})")]
    HostNotMalicious { host: String, score: f64 },

    #[error("Ran out of organs for {host} after {selected} selection(s): score {score} > -{margin}")]
    PoolExhausted {
        host: String,
        score: f64,
        margin: f64,
        selected: usize,
    },
}

/// Result of a successful search.
#[derive(Debug, Clone)]
pub struct Evasion {
    /// Estimated adversarial features
    pub features: FeatureDict,
    /// Selected organs, one per target feature, in first-selection order
    pub organs: Vec<Organ>,
    pub initial_score: f64,
    pub final_score: f64,
    pub iterations: usize,
}

/// Greedy best-first organ selection against a read-only classifier.
pub struct GreedyEvasionSearch<'a, C: Classifier + ?Sized> {
    model: &'a C,
    margin: f64,
}

impl<'a, C: Classifier + ?Sized> GreedyEvasionSearch<'a, C> {
    pub fn new(model: &'a C, margin: f64) -> Self {
        Self { model, margin }
    }

    /// Run the search for a host described by its features and classes.
    pub fn run(
        &self,
        host_name: &str,
        mut features: FeatureDict,
        host_classes: &FxHashSet<String>,
        candidates: &[Organ],
    ) -> std::result::Result<Evasion, SearchError> {
        let initial_score = self.model.decision_function(&features);
        if self.model.predict(&features) == Label::Benign {
            return Err(SearchError::HostNotMalicious {
                host: host_name.to_string(),
                score: initial_score,
            });
        }

        let weights = self.model.weights();
        let mut pool: Vec<&Organ> = candidates.iter().collect();
        let mut selected: Vec<Organ> = Vec::new();
        let mut score = initial_score;
        let mut iterations = 0;

        while score > -self.margin {
            if pool.is_empty() {
                return Err(SearchError::PoolExhausted {
                    host: host_name.to_string(),
                    score,
                    margin: self.margin,
                    selected: selected.len(),
                });
            }

            // Stable: ties keep their current pool order
            let mut ranked: Vec<(f64, &Organ)> = pool
                .iter()
                .map(|o| (contributions(o, weights, &features, host_classes), *o))
                .collect();
            ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
            pool = ranked.iter().map(|(_, o)| *o).collect();

            let best = pool.remove(0);
            tracing::debug!(
                "Selected organ for {} from {} ({:.4})",
                best.feature,
                best.location.display(),
                ranked[0].0
            );

            // Last selection for a feature wins, keeping its first position
            match selected.iter_mut().find(|o| o.feature == best.feature) {
                Some(slot) => *slot = best.clone(),
                None => selected.push(best.clone()),
            }
            features.extend(best.feature_dict.iter().map(|(k, v)| (k.clone(), *v)));

            score = self.model.decision_function(&features);
            iterations += 1;
        }

        Ok(Evasion {
            features,
            organs: selected,
            initial_score,
            final_score: score,
            iterations,
        })
    }
}

/// Whether a host already has a patient record.
pub enum SearchStatus {
    AlreadyGenerated,
    Generated(PatientRecord),
}

/// Generate the adversarial feature estimate and patient record for a host.
///
/// A host that already has an adversarial feature dump or record is skipped.
pub fn make_evasive<C: Classifier + ?Sized>(
    malware: &Path,
    model: &C,
    organs: &[Organ],
    margin: f64,
    layout: &OutputLayout,
    config: &Config,
    tools: &Toolchain,
) -> Result<SearchStatus> {
    let host_name = malware
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let span = tracing::info_span!("host", name = %host_name);
    let _enter = span.enter();

    let record_path = layout.record_path(&host_name);
    let features_path = layout.adv_features_path(&host_name);
    if record_path.exists() || features_path.exists() {
        tracing::debug!("Patient record already generated");
        return Ok(SearchStatus::AlreadyGenerated);
    }

    tracing::info!("Loading host malware...");
    let host = Host::load(malware, config, tools)?;
    tracing::info!("Host {} loaded!", host.name);

    let search = GreedyEvasionSearch::new(model, margin);
    let l1_original: f64 = host.features.values().sum();
    let evasion = search.run(&host.name, host.features.clone(), &host.classes, organs)?;
    let l1_adv: f64 = evasion.features.values().sum();

    let target_perturbation = (evasion.initial_score + margin).abs();
    tracing::info!(
        "{} - {} = -{}",
        evasion.initial_score,
        target_perturbation,
        margin
    );
    tracing::info!(
        "New score: {} (< -{}) after {} iteration(s)",
        evasion.final_score,
        margin,
        evasion.iterations
    );

    write_json_atomic(&features_path, &evasion.features)?;

    let record = PatientRecord {
        host: malware.to_path_buf(),
        organs: evasion.organs.iter().map(|o| o.location.clone()).collect(),
        score: evasion.initial_score,
        margin,
        target_perturbation,
        organ_contribution: evasion.final_score - evasion.initial_score,
        distortion_l1: l1_adv - l1_original,
        feature_stats_start: category_counts(&host.features),
        feature_counts: category_counts(&evasion.features),
    };
    write_json_atomic(&record_path, &record)?;

    Ok(SearchStatus::Generated(record))
}
