// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, Context, Error, Result};
use clap::Parser;
use log::{info, warn};
use methylprep::annotation::AnnotationResolver;
use methylprep::assemble::AssemblyOptions;
use methylprep::config::PipelineConfig;
use methylprep::types::SkipKind;
use methylprep::{output, raw, run_pipeline};
use std::time::Instant;

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting methylprep with args: {:?}", cli_args);

    // --- 1. Configuration ---
    let mut config = PipelineConfig::load_toml_path(&cli_args.config)
        .with_context(|| format!("Failed to load config {}", cli_args.config.display()))?;
    if let Some(threads) = cli_args.threads {
        config.threads = Some(threads);
    }
    if let Some(seed) = cli_args.seed {
        config.seed = seed;
    }
    if cli_args.delete_raw {
        config.delete_raw_after_assembly = true;
    }
    config
        .validate()
        .with_context(|| format!("Invalid config {}", cli_args.config.display()))?;
    info!(
        "Using {} worker threads, seed {}, {:?} imputation{}.",
        config.worker_threads(),
        config.seed,
        config.imputation.strategy,
        if config.imputation.enabled { "" } else { " (disabled)" }
    );

    // --- 2. Annotation ---
    let resolver = AnnotationResolver::from_config(&config.annotation)?;

    // --- 3. Sample Sheet ---
    let (records, sheet_failures) =
        raw::read_sample_sheet(&cli_args.sample_sheet, config.label_column.as_deref())?;
    if records.is_empty() {
        return Err(anyhow!(
            "No usable arrays listed in sample sheet {} ({} rows rejected)",
            cli_args.sample_sheet.display(),
            sheet_failures.len()
        ));
    }

    // --- 4. Pipeline ---
    let mut options = AssemblyOptions::from_config(&config);
    options.show_progress = true;
    let run = run_pipeline(records, sheet_failures, &resolver, &config, &options)?;

    let failures = &run.report.sample_failures;
    if !failures.is_empty() {
        warn!(
            "{} arrays were skipped: {} unreadable, {} lost a barcode collision. See {}.report.json.",
            failures.len(),
            failures.count(SkipKind::Parse),
            failures.count(SkipKind::Collision),
            cli_args.output_prefix
        );
    }
    for failure in &run.report.project_failures {
        warn!(
            "Project {} was dropped after {}: {}",
            failure.project, failure.stage, failure.message
        );
    }

    // --- 5. Write Outputs ---
    info!(
        "Writing results to files with prefix '{}'...",
        cli_args.output_prefix
    );
    output::write_run(&cli_args.output_prefix, &run)?;

    info!(
        "methylprep finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

// --- Module Implementations ---

mod cli {
    use clap::Parser;
    use std::path::PathBuf;

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Methylation array preprocessing and cohort reconciliation.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        #[arg(short, long, required = true)]
        pub(crate) config: PathBuf,

        #[arg(short = 's', long = "sample-sheet", required = true)]
        pub(crate) sample_sheet: PathBuf,

        #[arg(short, long = "out", required = true)]
        pub(crate) output_prefix: String,

        #[arg(short = 't', long)]
        pub(crate) threads: Option<usize>,

        #[arg(long)]
        pub(crate) seed: Option<u64>,

        #[arg(long, default_value_t = false)]
        pub(crate) delete_raw: bool,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,
    }
}
