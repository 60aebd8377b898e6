//! APG - Problem-space adversarial program generation.
//!
//! Harvests code "organs" carrying benign-leaning features out of goodware
//! donors, searches feature space for the set of organs that pushes a
//! malware host across a linear classifier's decision boundary, then
//! physically transplants them and verifies the result.
//!
//! # Example
//!
//! ```no_run
//! use apg::{Config, Orchestrator, RunOptions};
//!
//! let config = Config::load("config.yml".as_ref()).unwrap();
//! let orchestrator = Orchestrator::from_config(config).unwrap();
//! let summary = orchestrator
//!     .run(&RunOptions {
//!         harvest: true,
//!         transplant: true,
//!         ..RunOptions::default()
//!     })
//!     .unwrap();
//! println!("{} adversarial apps", summary.transplant_succeeded);
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod features;
pub mod host;
pub mod layout;
pub mod metrics;
pub mod model;
pub mod oracle;
pub mod orchestrator;
pub mod organ;
pub mod ranker;
pub mod record;
pub mod retry;
pub mod search;
pub mod transplant;

#[cfg(test)]
mod test_support;

// Re-export commonly used types at crate root
pub use config::Config;
pub use error::{ApgError, OracleError};
pub use features::FeatureDict;
pub use layout::OutputLayout;
pub use model::{Classifier, Label, LinearModel, Sample};
pub use oracle::{FnOracle, Oracle, OracleReport, ToolOracles, Toolchain};
pub use orchestrator::{Orchestrator, RunOptions, RunSummary};
pub use organ::{Organ, OrganCatalog};
pub use record::PatientRecord;
pub use retry::{RetryController, RetryVerdict};
pub use search::{make_evasive, GreedyEvasionSearch, SearchError, SearchStatus};
pub use transplant::{TransplantOutcome, TransplantReport, Transplanter};
