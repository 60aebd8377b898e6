//! Problem-space transplantation.
//!
//! Executes a patient record on the real artifact. Each attempt walks
//! LOADED -> INJECTED -> RESIGNED -> VERIFIED and ends in a
//! [`TransplantOutcome`]. Toolchain hiccups and verification misses are
//! retryable; unparseable tool output and anything unexpected are fatal.

use crate::config::Config;
use crate::error::OracleError;
use crate::features::{category_counts, permission_file_entry, FeatureDict};
use crate::host::Host;
use crate::layout::{move_file, write_atomic, write_json_atomic, OutputLayout};
use crate::metrics::Distortion;
use crate::model::{Classifier, Label};
use crate::organ::Organ;
use crate::oracle::Toolchain;
use crate::record::{host_name_from_record_path, PatientRecord};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Features the injection toolchain is known to fabricate. They are dropped
/// from a transplanted app's features unless the host or an organ really
/// has them.
pub const SOOT_DENYLIST: [&str; 40] = [
    "api_calls::android/media/AudioRecord",
    "api_calls::android/telephony/TelephonyManager;->getSubscriberId",
    "api_calls::java/net/DatagramSocket",
    "api_calls::java/net/MulticastSocket",
    "api_calls::java/net/NetworkInterface",
    "api_permissions::android_permission_READ_PHONE_STATE",
    "api_permissions::android_permission_RECORD_AUDIO",
    "interesting_calls::getCellLocation",
    "interesting_calls::getCellSignalStrength",
    "interesting_calls::getDeviceId",
    "interesting_calls::getNetworkCountryIso",
    "interesting_calls::getSimCountryIso",
    "interesting_calls::getSubscriberId",
    "interesting_calls::getWifiState",
    "interesting_calls::sendSMS",
    "interesting_calls::setWifiEnabled",
    "urls::http://apache_org/xml/features/validation/dynamic",
    "urls::http://apache_org/xml/features/validation/schema",
    "urls::http://java_sun_com/jaxp/xpath/dom",
    "urls::http://javax_xml_XMLConstants/feature/secure-processing",
    "urls::http://javax_xml_transform_dom_DOMResult/feature",
    "urls::http://javax_xml_transform_dom_DOMSource/feature",
    "urls::http://javax_xml_transform_sax_SAXResult/feature",
    "urls::http://javax_xml_transform_sax_SAXSource/feature",
    "urls::http://javax_xml_transform_sax_SAXTransformerFactory/feature",
    "urls::http://javax_xml_transform_sax_SAXTransformerFactory/feature/xmlfilter",
    "urls::http://javax_xml_transform_stream_StreamResult/feature",
    "urls::http://javax_xml_transform_stream_StreamSource/feature",
    "urls::http://relaxng_org/ns/structure/1_0",
    "urls::http://www_w3_org/2001/XMLSchema",
    "urls::http://www_w3_org/2001/XMLSchema-instance",
    "urls::http://www_w3_org/2003/11/xpath-datatypes",
    "urls::http://www_w3_org/TR/REC-xml",
    "urls::http://www_w3_org/xmlns/2000/",
    "urls::http://xml_org/sax/features/namespace-prefixes",
    "urls::http://xml_org/sax/features/namespaces",
    "urls::http://xml_org/sax/features/validation",
    "urls::http://xml_org/sax/properties/declaration-handler",
    "urls::http://xml_org/sax/properties/lexical-handler",
    "urls::http://xmlpull_org/v1/doc/features_html",
];

/// Remove toolchain-fabricated features from `generated`.
///
/// A denylisted feature survives only if it was present before the attack or
/// was declared as an organ side effect.
pub fn soot_filter(
    original: &FeatureDict,
    mut generated: FeatureDict,
    side_effects: &BTreeSet<String>,
) -> FeatureDict {
    generated.retain(|k, _| {
        !SOOT_DENYLIST.contains(&k.as_str()) || original.contains_key(k) || side_effects.contains(k)
    });
    generated
}

/// Write the injector's permission file, one manifest permission per line.
pub fn write_permission_file(path: &Path, permissions: &BTreeSet<String>) -> anyhow::Result<()> {
    let mut contents = String::new();
    for permission in permissions {
        contents.push_str(&permission_file_entry(permission));
        contents.push('\n');
    }
    write_atomic(path, contents.as_bytes())
}

/// Stage a transplantation attempt is working on; failures carry it as a suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransplantStage {
    Loaded,
    Injected,
    Resigned,
    Verified,
}

impl fmt::Display for TransplantStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransplantStage::Loaded => "LOADED",
            TransplantStage::Injected => "INJECTED",
            TransplantStage::Resigned => "RESIGNED",
            TransplantStage::Verified => "VERIFIED",
        };
        f.write_str(s)
    }
}

/// Audit record of a successful transplantation, written to
/// `success/report-<host>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransplantReport {
    pub status: String,
    pub host: String,
    /// Final adversarial artifact
    pub post_op_host: PathBuf,
    pub sha256: String,
    pub score: f64,
    pub prediction: Label,
    pub distortion_l0: f64,
    pub distortion_l1: f64,
    pub distortion_l2: f64,
    pub distortion_linf: f64,
    pub feature_stats_start: BTreeMap<String, usize>,
    pub feature_stats_final: BTreeMap<String, usize>,
    pub cc_start: f64,
    pub cc_final: f64,
    pub cc_difference: f64,
    pub classes_start: i64,
    pub classes_final: i64,
    pub classes_difference: i64,
    pub size_start: u64,
    pub size_final: u64,
    pub size_difference: i64,
    /// Seconds spent in the injector
    pub time_injection: f64,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub time_taken: f64,
    pub time_organ_extractions: Vec<f64>,
    pub time_taken_with_harvesting: f64,
}

/// Terminal state of one transplantation attempt.
#[derive(Debug, Clone)]
pub enum TransplantOutcome {
    Success(Box<TransplantReport>),
    /// Known non-deterministic toolchain behaviour; worth another attempt.
    RetryableFailure(String),
    FatalFailure(String),
}

enum Failure {
    Retryable(String),
    Fatal(String),
}

impl Failure {
    /// Classify a toolchain error: timeouts and crashes are retryable,
    /// everything else is fatal.
    fn from_oracle(stage: TransplantStage, e: OracleError) -> Self {
        if e.is_transient() {
            Failure::Retryable(format!("{e} [{stage}]"))
        } else {
            Failure::Fatal(format!("{e} [{stage}]"))
        }
    }

    fn from_anyhow(stage: TransplantStage, e: anyhow::Error) -> Self {
        match e.downcast_ref::<OracleError>() {
            Some(oracle) if oracle.is_transient() => {
                Failure::Retryable(format!("{e:#} [{stage}]"))
            }
            _ => Failure::Fatal(format!("{e:#} [{stage}]")),
        }
    }
}

/// Runs patient records against the real toolchain.
pub struct Transplanter<'a, C: Classifier + ?Sized> {
    model: &'a C,
    layout: &'a OutputLayout,
    config: &'a Config,
    tools: &'a Toolchain,
}

impl<'a, C: Classifier + ?Sized> Transplanter<'a, C> {
    pub fn new(model: &'a C, layout: &'a OutputLayout, config: &'a Config, tools: &'a Toolchain) -> Self {
        Self {
            model,
            layout,
            config,
            tools,
        }
    }

    /// Perform the transplant described by a patient record.
    pub fn transplant(&self, record_path: &Path) -> TransplantOutcome {
        let span = tracing::info_span!("host", name = %host_name_from_record_path(record_path));
        let _enter = span.enter();

        match self.attempt(record_path) {
            Ok(report) => TransplantOutcome::Success(Box::new(report)),
            Err(Failure::Retryable(msg)) => TransplantOutcome::RetryableFailure(msg),
            Err(Failure::Fatal(msg)) => TransplantOutcome::FatalFailure(msg),
        }
    }

    fn attempt(&self, record_path: &Path) -> Result<TransplantReport, Failure> {
        let started = Instant::now();
        let time_start = Utc::now();

        // LOADED
        let mut stage = TransplantStage::Loaded;
        let record = PatientRecord::load(record_path).map_err(|e| Failure::from_anyhow(stage, e))?;
        let host = Host::load(&record.host, self.config, self.tools)
            .map_err(|e| Failure::from_anyhow(stage, e))?;
        tracing::info!("Host {} ready for operation!", host.name);

        let mut organs: Vec<Organ> = Vec::new();
        for location in &record.organs {
            let organ = Organ::load(location).map_err(|e| Failure::from_anyhow(stage, e))?;
            match organs.iter_mut().find(|o| o.feature == organ.feature) {
                Some(slot) => *slot = organ,
                None => organs.push(organ),
            }
        }

        let x_original = self.model.dense_vector(&host.features);

        let surplus_permissions: BTreeSet<String> = organs
            .iter()
            .flat_map(|o| o.permissions.iter())
            .filter(|p| !host.permissions.contains(*p))
            .cloned()
            .collect();

        let side_effects: BTreeSet<String> = organs
            .iter()
            .flat_map(|o| o.feature_dict.keys().filter(move |k| **k != o.feature))
            .cloned()
            .collect();

        tracing::info!(
            "Adding the following features:\n{}",
            organs.iter().map(|o| o.feature.as_str()).collect::<Vec<_>>().join("\n")
        );
        tracing::info!("Including the following side-effects: {:?}", side_effects);

        let perm_file = host.scratch_dir().join("permissions.txt");
        tracing::info!(
            "Injection requires {} surplus permission(s): {:?}",
            surplus_permissions.len(),
            surplus_permissions
        );
        write_permission_file(&perm_file, &surplus_permissions)
            .map_err(|e| Failure::from_anyhow(stage, e))?;

        let apks = organs
            .iter()
            .map(|o| o.location.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(",");
        tracing::debug!("Final organs to implant: {}", apks);

        // INJECTED
        stage = TransplantStage::Injected;
        let output_location = host.scratch_dir().join("postop");
        fs::create_dir_all(&output_location)
            .map_err(|e| Failure::Fatal(format!("Failed to create {}: {e}", output_location.display())))?;
        let injection_start = Instant::now();
        let trailer = self
            .tools
            .inject(&host.working_copy(), &apks, &output_location, Some(&perm_file))
            .map_err(|e| Failure::from_oracle(stage, e))?;
        let time_injection = injection_start.elapsed().as_secs_f64();
        tracing::debug!("Injection completed successfully");

        let post_op_host = output_location.join(&host.name);
        if !post_op_host.is_file() {
            return Err(Failure::Fatal(format!(
                "Injector reported success but produced no {} [{stage}]",
                post_op_host.display()
            )));
        }

        // RESIGNED
        stage = TransplantStage::Resigned;
        self.tools
            .resign(&post_op_host)
            .map_err(|e| Failure::from_oracle(stage, e))?;
        tracing::debug!("Final apk signed");

        // VERIFIED
        stage = TransplantStage::Verified;
        tracing::debug!("Verifying adversarial features...");
        let generated = self
            .tools
            .extract_features(&post_op_host)
            .map_err(|e| Failure::from_anyhow(stage, e))?;
        let new_adv_dict = soot_filter(&host.features, generated, &side_effects);

        let score = self.model.decision_function(&new_adv_dict);
        let prediction = self.model.predict(&new_adv_dict);
        tracing::debug!("Final score: {}", score);
        tracing::debug!("Final class prediction {:?}", prediction);

        if prediction != Label::Benign {
            return Err(Failure::Retryable(format!(
                "Generated program still predicted as malware (score {score})"
            )));
        }

        let missing: Vec<&str> = organs
            .iter()
            .map(|o| o.feature.as_str())
            .filter(|f| !new_adv_dict.contains_key(*f))
            .collect();
        if !missing.is_empty() {
            return Err(Failure::Retryable(format!(
                "Something went wrong, couldn't find all the features: missing {missing:?}"
            )));
        }
        tracing::info!("All intended features are present!");

        // Results
        let x_adv = self.model.dense_vector(&new_adv_dict);
        let distortion = Distortion::between(&x_original, &x_adv);

        let artifact = fs::read(&post_op_host)
            .map_err(|e| Failure::Fatal(format!("Failed to read {}: {e} [{stage}]", post_op_host.display())))?;
        let size_final = artifact.len() as u64;
        let sha256 = format!("{:x}", Sha256::digest(&artifact));

        let final_path = self.layout.postop_path(&host.name);
        move_file(&post_op_host, &final_path).map_err(|e| Failure::from_anyhow(stage, e))?;

        let time_taken = started.elapsed().as_secs_f64();
        let harvest_times: Vec<f64> = organs.iter().map(|o| o.extraction_time).collect();
        let cc_final = trailer.avg_cc as f64;
        let classes_start = host.classes.len() as i64;

        let report = TransplantReport {
            status: "Success".to_string(),
            host: host.name.clone(),
            post_op_host: final_path,
            sha256,
            score,
            prediction,
            distortion_l0: distortion.l0,
            distortion_l1: distortion.l1,
            distortion_l2: distortion.l2,
            distortion_linf: distortion.linf,
            feature_stats_start: category_counts(&host.features),
            feature_stats_final: category_counts(&new_adv_dict),
            cc_start: host.avg_cc,
            cc_final,
            cc_difference: cc_final - host.avg_cc,
            classes_start,
            classes_final: trailer.classes,
            classes_difference: trailer.classes - classes_start,
            size_start: host.size,
            size_final,
            size_difference: size_final as i64 - host.size as i64,
            time_injection,
            time_start,
            time_end: Utc::now(),
            time_taken,
            time_taken_with_harvesting: time_taken + harvest_times.iter().sum::<f64>(),
            time_organ_extractions: harvest_times,
        };

        let report_path = self.layout.success_path(&host.name);
        tracing::info!("Writing report to {}", report_path.display());
        write_json_atomic(&report_path, &report)
            .with_context(|| format!("Failed to write report for {}", host.name))
            .map_err(|e| Failure::from_anyhow(stage, e))?;

        // A previous attempt may have failed
        if let Err(e) = self.layout.clear_failure(&host.path) {
            tracing::warn!("Could not remove stale failure log: {:#}", e);
        }

        tracing::info!("Time taken: {:.1}s", time_taken);
        tracing::info!(
            "Final size is {} bytes - size increased by {} bytes",
            report.size_final,
            report.size_difference
        );
        tracing::info!(
            "Final CC of the malware {} - CC difference {}",
            report.cc_final,
            report.cc_difference
        );
        Ok(report)
    }
}
