//! Mock toolchain for unit tests.
//!
//! Apps are JSON files holding their own feature dict, so the mock extractor
//! can "analyze" them and the mock injector can merge organs into a host by
//! merging dicts.

use crate::config::Config;
use crate::error::OracleError;
use crate::features::{organ_dir_name, FeatureDict};
use crate::layout::write_atomic;
use crate::oracle::{FnOracle, Oracle, OracleReport, ToolOracles, Toolchain};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const ORGAN_FEATURES: &str = "features.json";

/// Slice the mock extractor produces for a dotted feature name.
#[derive(Debug, Clone, Default)]
pub struct MockSlice {
    pub features: FeatureDict,
    pub classes: Vec<String>,
}

pub fn dict(entries: &[(&str, f64)]) -> FeatureDict {
    entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

pub fn write_app(path: &Path, features: &FeatureDict) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, serde_json::to_vec(features).unwrap()).unwrap();
}

pub fn read_app(path: &Path) -> FeatureDict {
    serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
}

pub fn transient(tool: &str) -> OracleError {
    OracleError::NonZeroExit {
        tool: tool.to_string(),
        code: Some(1),
        stderr: "boom".to_string(),
    }
}

/// Oracles backed by closures, kept concretely typed for call counting.
pub struct MockTools {
    pub slice_extractor: Arc<FnOracle>,
    pub injector: Arc<FnOracle>,
    pub template_injector: Arc<FnOracle>,
    pub resigner: Arc<FnOracle>,
    pub feature_extractor: Arc<FnOracle>,
    pub cc_calculator: Arc<FnOracle>,
    pub class_lister: Arc<FnOracle>,
    /// Extra features the injector adds to every transplanted host
    pub injector_noise: Arc<Mutex<FeatureDict>>,
}

impl MockTools {
    pub fn new(slices: HashMap<String, MockSlice>) -> Self {
        let slices = Arc::new(slices);
        let injector_noise = Arc::new(Mutex::new(FeatureDict::new()));

        let slice_extractor = {
            let slices = Arc::clone(&slices);
            FnOracle::new("extractor", move |args: &[String]| {
                let j_feature = &args[0];
                let donor = Path::new(&args[1]);
                match slices.get(j_feature) {
                    Some(slice) => {
                        let dir = PathBuf::from(&args[3])
                            .join(organ_dir_name(j_feature))
                            .join(crate::features::app_name(donor));
                        fs::create_dir_all(&dir).unwrap();
                        // Renamed into place so concurrent harvests never read a torn slice
                        write_atomic(&dir.join("classes.txt"), slice.classes.join("\n").as_bytes()).unwrap();
                        write_atomic(&dir.join(ORGAN_FEATURES), &serde_json::to_vec(&slice.features).unwrap())
                            .unwrap();
                        Ok(OracleReport::from_stdout(
                            "Now writing files into folder :) \nDependencies exported and slice\n",
                        ))
                    }
                    None => Ok(OracleReport::from_stdout(
                        "Sorry, it was not possible to retrieve the intended feature from this application :( \n",
                    )),
                }
            })
        };

        let template_injector = FnOracle::new("templateinjector", |args: &[String]| {
            let template = Path::new(&args[0]);
            let organ = Path::new(&args[1]);
            let out = template.parent().unwrap().join("sootOutput");
            fs::create_dir_all(&out).unwrap();
            fs::copy(organ.join(ORGAN_FEATURES), out.join("template.apk")).unwrap();
            Ok(OracleReport::from_stdout("Injection done :) \nexcluded\n"))
        });

        let injector = {
            let noise = Arc::clone(&injector_noise);
            FnOracle::new("injector", move |args: &[String]| {
                let host = Path::new(&args[0]);
                let mut features = read_app(host);
                for organ in args[1].split(',').filter(|s| !s.is_empty()) {
                    let organ_features: FeatureDict =
                        serde_json::from_slice(&fs::read(Path::new(organ).join(ORGAN_FEATURES)).unwrap())
                            .unwrap();
                    features.extend(organ_features);
                }
                features.extend(noise.lock().unwrap().clone());
                let out = Path::new(&args[2]).join(host.file_name().unwrap());
                write_app(&out, &features);
                Ok(OracleReport::from_stdout(
                    "AVG CC final :5\nThe number of Application classes at the end is 42\nInjection done :) \n",
                ))
            })
        };

        let feature_extractor = FnOracle::new("drebin", |args: &[String]| {
            let features = read_app(Path::new(&args[0]));
            let results = Path::new(&args[1]).join("results");
            fs::create_dir_all(&results).unwrap();
            fs::write(results.join("app.json"), serde_json::to_vec(&features).unwrap()).unwrap();
            Ok(OracleReport::default())
        });

        let class_lister = FnOracle::new("classlister", |args: &[String]| {
            fs::write(&args[2], "com.host.Main\ncom.host.Util\n").unwrap();
            Ok(OracleReport::default())
        });

        Self {
            slice_extractor: Arc::new(slice_extractor),
            injector: Arc::new(injector),
            template_injector: Arc::new(template_injector),
            resigner: Arc::new(FnOracle::new("resigner", |_| Ok(OracleReport::default()))),
            feature_extractor: Arc::new(feature_extractor),
            cc_calculator: Arc::new(FnOracle::new("cccalculator", |_| {
                Ok(OracleReport::from_stdout("Now calculating...\nAVG found :3\n"))
            })),
            class_lister: Arc::new(class_lister),
            injector_noise,
        }
    }

    pub fn toolchain(&self, config: &Config) -> Toolchain {
        Toolchain::with_oracles(
            config,
            ToolOracles {
                slice_extractor: Arc::clone(&self.slice_extractor) as Arc<dyn Oracle>,
                injector: Arc::clone(&self.injector) as Arc<dyn Oracle>,
                template_injector: Arc::clone(&self.template_injector) as Arc<dyn Oracle>,
                resigner: Arc::clone(&self.resigner) as Arc<dyn Oracle>,
                feature_extractor: Arc::clone(&self.feature_extractor) as Arc<dyn Oracle>,
                cc_calculator: Arc::clone(&self.cc_calculator) as Arc<dyn Oracle>,
                class_lister: Arc::clone(&self.class_lister) as Arc<dyn Oracle>,
            },
        )
    }
}

/// Config rooted in a temporary directory, with a template app in place.
pub fn test_config(dir: &TempDir) -> Config {
    let root = dir.path();
    let config = Config {
        tmp_dir: root.join("tmp"),
        ice_box: root.join("ice-box"),
        results_dir: root.join("results"),
        template_path: root.join("template"),
        goodware_location: root.join("apps"),
        ..Config::default()
    };
    write_app(&config.template_apk(), &FeatureDict::new());
    config
}

pub const EVIL: &str = "urls::http://evil_com";
pub const ORGAN_A: &str = "urls::http://a_com";
pub const ORGAN_B: &str = "urls::http://b_com";
pub const NOISE: &str = "api_calls::android/media/AudioRecord";
pub const MALICIOUS_EXTRA: &str = "api_calls::android/telephony/SmsManager";

/// A host scoring +0.5 and two harvestable organs: A worth -0.4 and B worth
/// -0.2 per unit, added twice. Transplanting both lands the host at -0.3.
pub struct Scenario {
    pub dir: TempDir,
    pub config: Config,
    pub mocks: MockTools,
    pub model: crate::model::LinearModel,
    pub layout: crate::layout::OutputLayout,
    pub malware: PathBuf,
    pub donors: Vec<PathBuf>,
}

impl Scenario {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let mocks = MockTools::new(HashMap::from([
            (
                "http://a.com".to_string(),
                MockSlice {
                    features: dict(&[(ORGAN_A, 1.0)]),
                    classes: vec!["com.donor.A".to_string()],
                },
            ),
            (
                "http://b.com".to_string(),
                MockSlice {
                    features: dict(&[(ORGAN_B, 2.0)]),
                    classes: vec!["com.donor.B".to_string()],
                },
            ),
        ]));

        let donors = vec![
            config.goodware_location.join("DONORA.apk"),
            config.goodware_location.join("DONORB.apk"),
        ];
        write_app(&donors[0], &dict(&[(ORGAN_A, 1.0)]));
        write_app(&donors[1], &dict(&[(ORGAN_B, 1.0)]));

        let train = vec![
            crate::model::Sample {
                sample_path: donors[0].clone(),
                sha256: None,
                label: 0,
                features: dict(&[(ORGAN_A, 1.0)]),
            },
            crate::model::Sample {
                sample_path: donors[1].clone(),
                sha256: None,
                label: 0,
                features: dict(&[(ORGAN_B, 1.0)]),
            },
        ];

        let malware = config.goodware_location.join("MAL.apk");
        write_app(&malware, &dict(&[(EVIL, 1.0)]));
        let test = vec![crate::model::Sample {
            sample_path: malware.clone(),
            sha256: Some("MAL".to_string()),
            label: 1,
            features: dict(&[(EVIL, 1.0)]),
        }];

        let model = crate::model::LinearModel::new(
            vec![
                EVIL.to_string(),
                ORGAN_A.to_string(),
                ORGAN_B.to_string(),
                NOISE.to_string(),
                MALICIOUS_EXTRA.to_string(),
            ],
            vec![0.5, -0.4, -0.2, 1.0, 2.0],
            0.0,
        )
        .unwrap()
        .with_samples(train, test);

        let layout = crate::layout::OutputLayout::new(config.run_dir("test"));
        layout.create().unwrap();

        Self {
            dir,
            config,
            mocks,
            model,
            layout,
            malware,
            donors,
        }
    }

    pub fn tools(&self) -> Toolchain {
        self.mocks.toolchain(&self.config)
    }

    pub fn catalog(&self) -> crate::organ::OrganCatalog {
        crate::organ::OrganCatalog::new(&self.config, self.tools())
    }

    /// Harvest both organs into the ice box.
    pub fn harvest(&self) -> Vec<crate::organ::Organ> {
        let catalog = self.catalog();
        vec![
            catalog.harvest_organ_from_donor(ORGAN_A, &self.donors[0]).unwrap().unwrap(),
            catalog.harvest_organ_from_donor(ORGAN_B, &self.donors[1]).unwrap().unwrap(),
        ]
    }

    /// Harvest, search and return the patient record path.
    pub fn record(&self) -> PathBuf {
        let organs = self.harvest();
        crate::search::make_evasive(
            &self.malware,
            &self.model,
            &organs,
            0.25,
            &self.layout,
            &self.config,
            &self.tools(),
        )
        .unwrap();
        self.layout.record_path("MAL.apk")
    }
}
