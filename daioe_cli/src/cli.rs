use std::path::PathBuf;
use std::time::Instant;

use clap::{command, Args, Parser, Subcommand};
use daioe::catalog::{inspect, OutputCatalog};
use daioe::config::{Breakdown, Config};
use daioe::Daioe;
use enum_dispatch::enum_dispatch;
use log::info;
use spinners::{Spinner, Spinners};

use crate::display::{
    display_catalog, display_combine_summary, display_fetch_summary, display_hierarchy_summary,
    display_pipeline_summary, display_shape,
};
use crate::error::DaioeCliResult;

const DEFAULT_PROGRESS_SPINNER: Spinners = Spinners::Dots;
const COMPLETE_PROGRESS_STRING: &str = "✔";
const RUNNING_TAIL_STRING: &str = "...";

fn start_spinner(quiet: bool, message: &str) -> Option<Spinner> {
    (!quiet).then(|| {
        Spinner::with_timer(
            DEFAULT_PROGRESS_SPINNER,
            message.to_string() + RUNNING_TAIL_STRING,
        )
    })
}

fn stop_spinner(sp: Option<Spinner>) {
    if let Some(mut s) = sp {
        s.stop_with_symbol(COMPLETE_PROGRESS_STRING);
    }
}

/// Trait that defines what to run when a given subcommand is invoked.
#[enum_dispatch]
pub trait RunCommand {
    async fn run(&self, config: Config) -> DaioeCliResult<()>;
}

/// The `pull` command downloads every configured source table into the raw extract directory.
#[derive(Args, Debug)]
pub struct PullCommand {
    #[arg(long, help = "Maximum number of tables downloaded at once")]
    max_workers: Option<usize>,
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for PullCommand {
    async fn run(&self, mut config: Config) -> DaioeCliResult<()> {
        info!("Running `pull` subcommand");
        if let Some(max_workers) = self.max_workers {
            config.fetch.max_workers = max_workers;
        }
        let start = Instant::now();
        let sp = start_spinner(self.quiet, "Downloading tables");
        let summary = Daioe::new_with_config(config).pull().await;
        stop_spinner(sp);
        display_fetch_summary(&summary);
        println!("Total time: {:.2}s", start.elapsed().as_secs_f64());
        Ok(())
    }
}

/// The `combine` command merges raw extracts and resolves duplicate observations.
#[derive(Args, Debug)]
pub struct CombineCommand {
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for CombineCommand {
    async fn run(&self, config: Config) -> DaioeCliResult<()> {
        info!("Running `combine` subcommand");
        let sp = start_spinner(self.quiet, "Combining raw extracts");
        let summary = Daioe::new_with_config(config).combine();
        stop_spinner(sp);
        display_combine_summary(&summary?);
        Ok(())
    }
}

/// The `hierarchy` command rolls the combined table up to every classification level.
#[derive(Args, Debug)]
pub struct HierarchyCommand {
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for HierarchyCommand {
    async fn run(&self, config: Config) -> DaioeCliResult<()> {
        info!("Running `hierarchy` subcommand");
        let sp = start_spinner(self.quiet, "Building hierarchy");
        let summary = Daioe::new_with_config(config).hierarchy();
        stop_spinner(sp);
        display_hierarchy_summary(&summary?);
        Ok(())
    }
}

/// The `run` command joins exposure onto employment counts and writes the aggregated table.
#[derive(Args, Debug)]
pub struct RunPipelineCommand {
    #[arg(short = 'o', long, help = "Output file, overriding the configured one")]
    output: Option<PathBuf>,
    #[arg(long, help = "Print the row and column count of the written table")]
    inspect: bool,
    #[arg(long, value_name = "pooled|age_sex", help = "Demographic breakdown of the weights [default: pooled]")]
    breakdown: Option<Breakdown>,
    #[arg(long, help = "Local path or URL of the exposure CSV")]
    exposure: Option<String>,
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for RunPipelineCommand {
    async fn run(&self, mut config: Config) -> DaioeCliResult<()> {
        info!("Running `run` subcommand");
        if let Some(breakdown) = self.breakdown {
            config.pipeline.breakdown = breakdown;
        }
        if let Some(exposure) = &self.exposure {
            config.exposure_source = exposure.clone();
        }
        let daioe = Daioe::new_with_config(config);
        let sp = start_spinner(self.quiet, "Running exposure pipeline");
        let summary = daioe.run(self.output.as_deref()).await;
        stop_spinner(sp);
        let summary = summary?;
        display_pipeline_summary(&summary);
        if self.inspect {
            let (rows, columns) = inspect(&daioe.scan_output(Some(&summary.path))?)?;
            display_shape(rows, columns);
        }
        Ok(())
    }
}

/// The `summary` command lists the levels, sexes, ages and years present in an output table.
#[derive(Args, Debug)]
pub struct SummaryCommand {
    #[arg(index = 1, help = "Output table to summarise, defaults to the configured one")]
    file: Option<PathBuf>,
}

impl RunCommand for SummaryCommand {
    async fn run(&self, config: Config) -> DaioeCliResult<()> {
        info!("Running `summary` subcommand");
        let output = Daioe::new_with_config(config).scan_output(self.file.as_deref())?;
        let (rows, columns) = inspect(&output)?;
        let catalog = OutputCatalog::load(&output)?;
        display_shape(rows, columns);
        display_catalog(&catalog);
        Ok(())
    }
}

/// The entrypoint for the CLI.
#[derive(Parser, Debug)]
#[command(version, about="Employment-weighted AI exposure by occupation", long_about = None, name="daioe")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    #[arg(
        short = 'q',
        long = "quiet",
        help = "\
            Do not print progress bar to stdout. Results and logs (when `RUST_LOG`\n\
            is set) will still be printed.",
        global = true
    )]
    quiet: bool,
}

/// Commands contains the list of subcommands avaliable for use in the CLI.
/// Each command implements the RunCommand trait.
#[derive(Subcommand, Debug)]
#[enum_dispatch(RunCommand)]
pub enum Commands {
    /// Download source tables
    Pull(PullCommand),
    /// Merge raw extracts, newest source winning on conflicts
    Combine(CombineCommand),
    /// Aggregate the combined table to all four classification levels
    Hierarchy(HierarchyCommand),
    /// Run the exposure pipeline and write the output table
    Run(RunPipelineCommand),
    /// Summarise an output table
    Summary(SummaryCommand),
}
