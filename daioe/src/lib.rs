use std::path::Path;

use log::debug;
use polars::prelude::LazyFrame;

use crate::config::Config;
use crate::error::Result;
use crate::fetch::{fetch_all, FetchSummary, TableSpec};
use crate::pipeline::{CombineSummary, HierarchySummary, PipelineSummary};
use crate::pxweb::PxWebFetcher;

// Re-exports
pub use column_names as COL;

// Modules
pub mod aggregate;
pub mod catalog;
pub mod column_names;
pub mod config;
pub mod error;
pub mod exposure;
pub mod extend;
pub mod fetch;
pub mod hierarchy;
pub mod parquet;
pub mod pipeline;
pub mod pxweb;
pub mod resolve;

/// Entry point to every stage, holding the configuration they share
pub struct Daioe {
    pub config: Config,
}

impl Daioe {
    /// Setup with default configuration
    pub fn new() -> Self {
        Self::new_with_config(Config::default())
    }

    /// Setup with custom configuration
    pub fn new_with_config(config: Config) -> Self {
        debug!("config: {config:?}");
        Self { config }
    }

    /// Download every configured table into the raw extract directory
    pub async fn pull(&self) -> FetchSummary {
        let fetcher = PxWebFetcher::from_config(&self.config.fetch);
        fetch_all(
            &fetcher,
            TableSpec::from_config(&self.config.fetch),
            &self.config.raw_dir(),
            self.config.fetch.max_workers,
        )
        .await
    }

    pub fn combine(&self) -> Result<CombineSummary> {
        pipeline::run_combine(&self.config)
    }

    pub fn hierarchy(&self) -> Result<HierarchySummary> {
        pipeline::run_hierarchy(&self.config)
    }

    /// Run the exposure pipeline, writing to `output` when given
    pub async fn run(&self, output: Option<&Path>) -> Result<PipelineSummary> {
        pipeline::run_pipeline(&self.config, output).await
    }

    /// Lazily scan a written output table
    pub fn scan_output(&self, path: Option<&Path>) -> Result<LazyFrame> {
        match path {
            Some(path) => parquet::scan_parquet(path),
            None => parquet::scan_parquet(self.config.output_path()),
        }
    }
}

impl Default for Daioe {
    fn default() -> Self {
        Self::new()
    }
}
