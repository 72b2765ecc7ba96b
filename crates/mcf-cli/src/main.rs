use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use mcf_sync::{report_runs_markdown, ReconcileConfig, ReconcilePipeline, SortOrder};
use tracing::{subscriber::set_global_default, Level};
use tracing_subscriber::EnvFilter;

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .compact()
        .finish();

    let _ = set_global_default(subscriber);
}

#[derive(Debug, Parser)]
#[command(name = "mcf-cli")]
#[command(about = "Missing Contact Finder: list contacts present in a comparison corpus but absent from the master")]
struct Cli {
    /// Config file (defaults to $MCF_CONFIG, then ./mcf.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Less log output (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    quiet: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the corpora once and write the run outputs
    Run(RunArgs),
    /// Summarize the most recent runs as markdown
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Print the canonical form of each phone value
    Canonicalize { values: Vec<String> },
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Master corpus directory (repeatable, replaces configured roots)
    #[arg(long = "master")]
    master: Vec<PathBuf>,
    /// Comparison corpus directory (repeatable, replaces configured roots)
    #[arg(long = "compare")]
    compare: Vec<PathBuf>,
    #[arg(long = "out")]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    sort: Option<SortOrder>,
    #[arg(long)]
    batch_size: Option<usize>,
    /// Keep duplicate names as-is instead of numbering them
    #[arg(long)]
    no_unique_names: bool,
}

impl RunArgs {
    fn apply(self, config: &mut ReconcileConfig) {
        if !self.master.is_empty() {
            config.master_dirs = self.master;
        }
        if !self.compare.is_empty() {
            config.compare_dirs = self.compare;
        }
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if let Some(sort) = self.sort {
            config.sort = sort;
        }
        if let Some(size) = self.batch_size {
            config.batch_size = size;
        }
        if self.no_unique_names {
            config.unique_names = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(1u8.saturating_add(cli.verbose).saturating_sub(cli.quiet));

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let mut config = ReconcileConfig::resolve(cli.config.as_deref())?;
            args.apply(&mut config);
            let summary = ReconcilePipeline::new(config).run_once().await?;
            let stats = &summary.stats;
            println!(
                "run complete: run_id={} missing={} outputs={}",
                summary.run_id, stats.missing, summary.run_dir
            );
            println!(
                "  master: {} total, {} unique | comparison: {} total, {} unique, {} filtered",
                stats.total_master,
                stats.unique_master,
                stats.total_compare,
                stats.unique_compare,
                stats.filtered_compare
            );
            println!(
                "  files: {} seen, {} processed, {} failed, {} skipped",
                stats.total_files, stats.processed_files, stats.failed_files, stats.skipped_files
            );
            for error in &summary.file_errors {
                println!("  failed [{}] {}: {}", error.corpus, error.path, error.message);
            }
        }
        Commands::Report { runs } => {
            let config = ReconcileConfig::resolve(cli.config.as_deref())?;
            println!("{}", report_runs_markdown(runs, &config.output_dir)?);
        }
        Commands::Canonicalize { values } => {
            for value in values {
                match mcf_core::canonicalize_phone(&value) {
                    Some(phone) => println!("{value}\t{phone}"),
                    None => println!("{value}\trejected"),
                }
            }
        }
    }

    Ok(())
}
