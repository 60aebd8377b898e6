use crate::orchestrator::RunOptions;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "apg")]
#[command(about = "Problem-space adversarial program generation via organ transplantation")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// YAML experiment configuration
    #[arg(short, long, global = true, default_value = "config.yml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Harvest organs for the most benign features into the ice box
    Harvest {
        #[command(flatten)]
        depth: DepthArgs,
    },

    /// Run the feature-space attack and write patient records
    Attack {
        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        depth: DepthArgs,

        /// Analyze every host before the attack starts
        #[arg(long)]
        preload: bool,
    },

    /// Transplant organs into hosts from existing patient records
    Transplant {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Harvest, attack and transplant in one go
    Run {
        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        depth: DepthArgs,

        /// Analyze every host before the attack starts
        #[arg(long)]
        preload: bool,

        /// Reuse the organs already in the ice box
        #[arg(long)]
        skip_harvest: bool,

        /// Go straight to transplantation using existing records
        #[arg(long)]
        skip_feature_space: bool,
    },
}

#[derive(ClapArgs, Debug, Clone)]
pub struct DepthArgs {
    /// Number of benign features to harvest organs for
    #[arg(long, default_value_t = 100)]
    pub organ_depth: usize,

    /// Number of donors to try per feature
    #[arg(long, default_value_t = 10)]
    pub donor_depth: usize,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct RunArgs {
    /// Name of the output directory under the results directory
    #[arg(short = 't', long, default_value = "apg")]
    pub run_tag: String,

    /// Attack confidence: low, high or a percentage of goodware to outscore
    #[arg(short = 'k', long, default_value = "25")]
    pub confidence: String,

    /// Disable worker pools
    #[arg(long)]
    pub serial: bool,

    /// Retry hosts that failed in an earlier run
    #[arg(long)]
    pub rerun_past_failures: bool,
}

impl Command {
    /// Phase selection for the orchestrator.
    pub fn run_options(&self) -> Option<RunOptions> {
        let base = |run: &RunArgs| RunOptions {
            run_tag: run.run_tag.clone(),
            confidence: run.confidence.clone(),
            serial: run.serial,
            rerun_past_failures: run.rerun_past_failures,
            ..RunOptions::default()
        };
        match self {
            Command::Harvest { .. } => None,
            Command::Attack { run, depth, preload } => Some(RunOptions {
                organ_depth: depth.organ_depth,
                donor_depth: depth.donor_depth,
                preload: *preload,
                ..base(run)
            }),
            Command::Transplant { run } => Some(RunOptions {
                skip_feature_space: true,
                transplant: true,
                ..base(run)
            }),
            Command::Run {
                run,
                depth,
                preload,
                skip_harvest,
                skip_feature_space,
            } => Some(RunOptions {
                organ_depth: depth.organ_depth,
                donor_depth: depth.donor_depth,
                harvest: !skip_harvest,
                preload: *preload,
                skip_feature_space: *skip_feature_space,
                transplant: true,
                ..base(run)
            }),
        }
    }
}
