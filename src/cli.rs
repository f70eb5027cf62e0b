use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands::{
    self, CommandReport, list::ListOptions, resume::ResumeOptions, run_stage::RunStageOptions,
    start::StartOptions,
};

#[derive(Debug, Parser)]
#[command(
    name = "mediatidy",
    about = "Reorganize an unstructured media export into a deduplicated, dated library",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a run against an input/output root pair and execute all stages
    Start {
        /// Root of the unstructured export to ingest
        input_root: String,
        /// Root of the organized library to produce
        output_root: String,
        /// Plan every stage but mutate nothing
        #[arg(long)]
        dry_run: bool,
        /// Chattier progress details
        #[arg(long)]
        verbose: bool,
    },
    /// Execute a single stage of an existing run, by name or index
    RunStage {
        run_id: String,
        stage: String,
        /// Recompute even if the stage already completed
        #[arg(long)]
        force: bool,
    },
    /// Continue a paused or failed run at its first incomplete stage
    Resume {
        run_id: String,
        /// Restart from an explicit stage instead
        #[arg(long)]
        from_stage: Option<String>,
    },
    /// Request a cooperative pause at the next stage boundary
    Pause { run_id: String },
    /// Request a cooperative cancel at the next stage boundary
    Cancel { run_id: String },
    /// Fail runs left in `running` by a crashed process
    CancelOrphans,
    /// Per-stage status of one run
    Status { run_id: String },
    /// Recent runs, newest first
    List {
        /// Only runs with this status
        #[arg(long)]
        status: Option<String>,
        /// Maximum number of runs to show
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn print_report(report: &CommandReport) {
    for detail in &report.details {
        println!("{detail}");
    }
    for issue in &report.issues {
        eprintln!("issue: {issue}");
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let report = match cli.command {
        Commands::Start {
            input_root,
            output_root,
            dry_run,
            verbose,
        } => commands::start::run(&StartOptions {
            input_root,
            output_root,
            dry_run,
            verbose,
        })?,
        Commands::RunStage {
            run_id,
            stage,
            force,
        } => commands::run_stage::run(&RunStageOptions {
            run_id,
            stage,
            force,
        })?,
        Commands::Resume { run_id, from_stage } => {
            commands::resume::run(&ResumeOptions { run_id, from_stage })?
        }
        Commands::Pause { run_id } => commands::pause::run(&run_id)?,
        Commands::Cancel { run_id } => commands::cancel::run(&run_id)?,
        Commands::CancelOrphans => commands::cancel_orphans::run()?,
        Commands::Status { run_id } => commands::status::run(&run_id)?,
        Commands::List { status, limit } => commands::list::run(&ListOptions { status, limit })?,
    };

    print_report(&report);
    if !report.ok {
        std::process::exit(1);
    }
    Ok(())
}
