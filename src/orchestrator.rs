//! Experiment driver: sequences harvesting, the feature-space attack and
//! transplantation across every true-positive host.

use crate::config::Config;
use crate::error::ApgError;
use crate::host::HostProfile;
use crate::layout::{read_json, resolve_sample_filename, write_json_atomic, write_json_once, OutputLayout};
use crate::metrics::{percentile, ModelPerformance};
use crate::model::{Classifier, Label, LinearModel, Sample};
use crate::oracle::Toolchain;
use crate::organ::{Organ, OrganCatalog};
use crate::retry::{RetryController, RetryVerdict};
use crate::search::{make_evasive, SearchStatus};
use crate::transplant::Transplanter;
use anyhow::{Context, Result};
use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Phase and tuning switches for a run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub run_tag: String,
    /// `low`, `high`, or the percentage of benign scores the adversarial
    /// score must beat
    pub confidence: String,
    pub organ_depth: usize,
    pub donor_depth: usize,
    pub harvest: bool,
    pub preload: bool,
    pub serial: bool,
    pub rerun_past_failures: bool,
    pub skip_feature_space: bool,
    pub transplant: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            run_tag: "apg".to_string(),
            confidence: "25".to_string(),
            organ_depth: 100,
            donor_depth: 10,
            harvest: false,
            preload: false,
            serial: false,
            rerun_past_failures: false,
            skip_feature_space: false,
            transplant: false,
        }
    }
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub output_dir: PathBuf,
    pub margin: f64,
    pub true_positives: usize,
    pub organs_harvested: usize,
    pub organs_available: usize,
    pub records_generated: usize,
    pub records_existing: usize,
    pub search_failures: usize,
    pub transplant_succeeded: usize,
    pub transplant_skipped: usize,
    pub transplant_failed: usize,
}

#[derive(Serialize)]
struct Confidence<'a> {
    confidence: &'a str,
    margin: f64,
}

#[derive(Serialize)]
struct NumberOfApps {
    train: usize,
    test: usize,
    tps: usize,
}

#[derive(Serialize)]
struct RunReport<'a> {
    model_performance: ModelPerformance,
    confidence: Confidence<'a>,
    number_of_apps: NumberOfApps,
    start_time: String,
}

/// Resolve a confidence level into a margin.
///
/// For a percentage `N` the margin is the absolute value of the
/// `(100 - N)`th percentile of the benign scores, so an adversarial score
/// below `-margin` is more benign than `N`% of known goodware. `low` means a
/// margin of zero and `high` is shorthand for 25.
pub fn resolve_confidence_level(confidence: &str, benign_scores: &[f64]) -> crate::error::Result<f64> {
    let level = match confidence {
        "low" => return Ok(0.0),
        "high" => 25.0,
        other => other
            .parse::<f64>()
            .map_err(|_| ApgError::configuration(format!("Unknown confidence level: {other}")))?,
    };
    percentile(benign_scores, 100.0 - level)
        .map(f64::abs)
        .ok_or_else(|| {
            ApgError::configuration(format!(
                "Cannot resolve confidence {confidence} over {} benign score(s)",
                benign_scores.len()
            ))
        })
}

/// Test samples labelled malware that the model also flags.
pub fn true_positives<'m, C: Classifier + ?Sized>(model: &C, test: &'m [Sample]) -> Vec<&'m Sample> {
    test.iter()
        .filter(|s| s.label == 1 && model.predict(&s.features) == Label::Malware)
        .collect()
}

fn thread_pool(threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .context("Failed to build thread pool")
}

pub struct Orchestrator {
    config: Config,
    model: LinearModel,
    tools: Toolchain,
}

impl Orchestrator {
    pub fn new(config: Config, model: LinearModel, tools: Toolchain) -> Self {
        Self {
            config,
            model,
            tools,
        }
    }

    /// Load the model named in the configuration and bind the real toolchain.
    pub fn from_config(config: Config) -> Result<Self> {
        let model = LinearModel::load(&config.model)?;
        let tools = Toolchain::from_config(&config);
        Ok(Self::new(config, model, tools))
    }

    pub fn model(&self) -> &LinearModel {
        &self.model
    }

    pub fn catalog(&self) -> OrganCatalog {
        OrganCatalog::new(&self.config, self.tools.clone())
    }

    fn benign_feature_names(&self) -> Vec<String> {
        self.model.benign_weights().map(|w| w.feature.clone()).collect()
    }

    /// Harvest organs for the top benign features.
    pub fn harvest(&self, organ_depth: usize, donor_depth: usize) -> Result<usize> {
        self.catalog().mass_organ_harvest(
            &self.model,
            organ_depth,
            donor_depth,
            self.config.nprocs_evasion,
        )
    }

    /// Run the phases selected in `opts`.
    pub fn run(&self, opts: &RunOptions) -> Result<RunSummary> {
        let layout = OutputLayout::new(self.config.run_dir(&opts.run_tag));
        layout.create()?;
        tracing::info!("Output directory: {}", layout.root().display());

        let mut summary = RunSummary {
            output_dir: layout.root().to_path_buf(),
            ..RunSummary::default()
        };

        if opts.harvest {
            summary.organs_harvested = self.harvest(opts.organ_depth, opts.donor_depth)?;
        }

        // True positives and confidence margin
        let scores: Vec<f64> = self
            .model
            .test
            .iter()
            .map(|s| self.model.decision_function(&s.features))
            .collect();
        let y_pred: Vec<u8> = scores.iter().map(|s| u8::from(*s > 0.0)).collect();
        let y_true: Vec<u8> = self.model.test.iter().map(|s| s.label).collect();

        let tps = true_positives(&self.model, &self.model.test);
        let tp_shas: Vec<&str> = tps.iter().filter_map(|s| s.sha256.as_deref()).collect();
        let mut tp_hosts: Vec<PathBuf> = tps.iter().map(|s| s.sample_path.clone()).collect();
        write_json_atomic(&layout.root().join("tp_shas.json"), &tp_shas)?;
        write_json_atomic(&layout.root().join("tp_hosts.json"), &tp_hosts)?;
        summary.true_positives = tp_hosts.len();

        let benign_scores: Vec<f64> = scores.iter().copied().filter(|s| *s < 0.0).collect();
        let margin = resolve_confidence_level(&opts.confidence, &benign_scores)?;
        summary.margin = margin;
        tracing::info!(
            "Using confidence attack w/ margin: {} ({}%)",
            margin,
            opts.confidence
        );

        let report = RunReport {
            model_performance: ModelPerformance::compute(&y_true, &y_pred, &scores),
            confidence: Confidence {
                confidence: &opts.confidence,
                margin,
            },
            number_of_apps: NumberOfApps {
                train: self.model.train.len(),
                test: self.model.test.len(),
                tps: tps.len(),
            },
            start_time: Utc::now().to_rfc3339(),
        };
        tracing::info!(
            "Performance before attack: {}",
            serde_json::to_string(&report.model_performance)?
        );

        let benign_features = self.benign_feature_names();
        write_json_atomic(&layout.root().join("benign-features.json"), &benign_features)?;

        // Some failures are non-deterministic; retry hosts from the failure log
        if opts.rerun_past_failures {
            tp_hosts = layout
                .failed_apps()
                .iter()
                .map(|name| {
                    resolve_sample_filename(
                        &self.config.goodware_location,
                        name,
                        self.config.storage_radix,
                        "apk",
                    )
                })
                .collect();
            tracing::warn!("Rerunning {} failed attempts!", tp_hosts.len());
        }

        write_json_once(&layout.root().join("run.json"), &report)?;

        if opts.preload {
            self.preload(&tp_hosts)?;
        }

        if !opts.skip_feature_space {
            tracing::info!("Fetching harvested organs...");
            let depth = opts.organ_depth.min(benign_features.len());
            let organs = self.catalog().fetch_harvested(&benign_features[..depth]);
            summary.organs_available = organs.len();

            self.feature_space_attack(&tp_hosts, &organs, margin, &layout, opts.serial, &mut summary)?;
            self.bundle_adv_features(&layout)?;
        }

        if opts.transplant {
            self.transplant_all(&layout, opts, &mut summary)?;
        }

        Ok(summary)
    }

    /// Analyze every host up front so later loads hit the cache.
    fn preload(&self, hosts: &[PathBuf]) -> Result<()> {
        tracing::info!("Commencing preload...");
        thread_pool(self.config.nprocs_preload)?.install(|| {
            hosts.par_iter().for_each(|host| {
                if let Err(e) = HostProfile::load_or_analyze(host, &self.config, &self.tools) {
                    tracing::warn!("Preload of {} failed: {:#}", host.display(), e);
                }
            })
        });
        Ok(())
    }

    fn feature_space_attack(
        &self,
        hosts: &[PathBuf],
        organs: &[Organ],
        margin: f64,
        layout: &OutputLayout,
        serial: bool,
        summary: &mut RunSummary,
    ) -> Result<()> {
        tracing::info!("Commencing feature space evasion...");
        let attack = |host: &PathBuf| -> Option<bool> {
            match make_evasive(host, &self.model, organs, margin, layout, &self.config, &self.tools) {
                Ok(SearchStatus::Generated(_)) => Some(true),
                Ok(SearchStatus::AlreadyGenerated) => Some(false),
                Err(e) => {
                    tracing::error!("Feature space attack on {} failed: {:#}", host.display(), e);
                    None
                }
            }
        };

        let results: Vec<Option<bool>> = if serial {
            tracing::info!("Running attack in serial...");
            hosts.iter().map(attack).collect()
        } else {
            tracing::info!("Running attack in parallel...");
            thread_pool(self.config.nprocs_evasion)?.install(|| hosts.par_iter().map(attack).collect())
        };

        summary.records_generated = results.iter().filter(|r| **r == Some(true)).count();
        summary.records_existing = results.iter().filter(|r| **r == Some(false)).count();
        summary.search_failures = results.iter().filter(|r| r.is_none()).count();
        tracing::info!("Patient records generated.");
        Ok(())
    }

    /// Bundle adversarial feature dumps into `X.adv.json`, `y.adv.json` and
    /// `meta.adv.json` in the run directory.
    pub fn bundle_adv_features(&self, layout: &OutputLayout) -> Result<usize> {
        tracing::info!("Bundling adv features into new dataset...");
        let files = layout.adv_feature_files();

        let mut features = Vec::with_capacity(files.len());
        let mut meta = Vec::with_capacity(files.len());
        for path in &files {
            let dict: BTreeMap<String, f64> = read_json(path)?;
            features.push(dict);
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let sha = name.split('.').next().unwrap_or_default().to_string();
            meta.push(BTreeMap::from([("sha256".to_string(), sha)]));
        }
        let labels = vec![1u8; features.len()];

        write_json_atomic(&layout.root().join("X.adv.json"), &features)?;
        write_json_atomic(&layout.root().join("y.adv.json"), &labels)?;
        write_json_atomic(&layout.root().join("meta.adv.json"), &meta)?;
        Ok(features.len())
    }

    fn transplant_all(&self, layout: &OutputLayout, opts: &RunOptions, summary: &mut RunSummary) -> Result<()> {
        let records = layout.records();
        let transplanter = Transplanter::new(&self.model, layout, &self.config, &self.tools);
        let controller = RetryController::new(layout, self.config.tries, opts.rerun_past_failures);

        let process = |record: &PathBuf| -> RetryVerdict {
            tracing::info!("{}", "-".repeat(70));
            match controller.run(record, || transplanter.transplant(record)) {
                Ok(verdict) => verdict,
                Err(e) => RetryVerdict::Fatal {
                    attempts: 0,
                    reason: format!("{e:#}"),
                },
            }
        };

        let verdicts: Vec<RetryVerdict> = if opts.serial {
            tracing::info!("Running transplant in serial...");
            records.iter().map(process).collect()
        } else {
            tracing::info!("Running transplant in parallel...");
            thread_pool(self.config.nprocs_transplant)?.install(|| records.par_iter().map(process).collect())
        };

        for verdict in &verdicts {
            match verdict {
                RetryVerdict::Succeeded { .. } => summary.transplant_succeeded += 1,
                RetryVerdict::AlreadySucceeded | RetryVerdict::PreviouslyFailed => {
                    summary.transplant_skipped += 1
                }
                RetryVerdict::Exhausted { .. } | RetryVerdict::Fatal { .. } => summary.transplant_failed += 1,
            }
        }
        tracing::info!("Transplant completed.");
        tracing::info!("Results in: {}", layout.root().display());
        Ok(())
    }
}
