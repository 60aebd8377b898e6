use anyhow::{Context, Result};
use apg::cli::{self, Command};
use apg::{Config, Orchestrator, RunSummary};
use clap::Parser;
use colored::Colorize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

fn print_summary(summary: &RunSummary, opts: &apg::RunOptions) {
    println!("{}", "APG run summary".bright_white().bold());
    println!("  output:        {}", summary.output_dir.display());
    println!("  margin:        {}", summary.margin);
    println!("  tps:           {}", summary.true_positives);
    if opts.harvest {
        println!("  harvested:     {}", summary.organs_harvested);
    }
    if !opts.skip_feature_space {
        println!("  organs:        {}", summary.organs_available);
        println!(
            "  records:       {} new, {} existing, {}",
            summary.records_generated.to_string().green(),
            summary.records_existing,
            format!("{} failed", summary.search_failures).red()
        );
    }
    if opts.transplant {
        println!(
            "  transplants:   {}, {} skipped, {}",
            format!("{} succeeded", summary.transplant_succeeded).bright_green().bold(),
            summary.transplant_skipped,
            format!("{} failed", summary.transplant_failed).bright_red().bold()
        );
    }
}

fn main() -> Result<()> {
    let args = cli::Args::parse();

    // RUST_LOG wins over the verbose flag
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if args.verbose {
        EnvFilter::new("apg=debug")
    } else {
        EnvFilter::new("apg=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    debug!("Logging initialized (verbose={})", args.verbose);

    eprintln!("APG v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    let orchestrator = Orchestrator::from_config(config)?;

    match &args.command {
        Command::Harvest { depth } => {
            let harvested = orchestrator.harvest(depth.organ_depth, depth.donor_depth)?;
            println!("{} {}", "Organs harvested:".bright_white().bold(), harvested);
        }
        command => {
            if let Some(opts) = command.run_options() {
                let summary = orchestrator.run(&opts)?;
                print_summary(&summary, &opts);
            }
        }
    }

    Ok(())
}
