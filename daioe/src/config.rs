use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Paths and knobs for every stage. The core never resolves paths on its own: everything it
/// reads or writes comes from here.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Raw extracts are `<data_dir>/raw/<raw_prefix>*.parquet`
    pub raw_prefix: String,
    pub combined_file: String,
    pub hierarchy_file: String,
    pub name_map_file: PathBuf,
    /// Local path or http(s) URL of the exposure CSV
    pub exposure_source: String,
    pub output_file: String,
    pub pipeline: PipelineOptions,
    pub fetch: FetchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: "data".into(),
            raw_prefix: "ssyk12".into(),
            combined_file: "ssyk12_combined_cleaned.parquet".into(),
            hierarchy_file: "ssyk12_aggregated_ssyk4_to_ssyk1.parquet".into(),
            name_map_file: "structure_ssyk12.csv".into(),
            exposure_source: "https://raw.githubusercontent.com/joseph-data/07_translate_ssyk/main/\
                03_translated_files/daioe_ssyk2012_translated.csv"
                .into(),
            output_file: "daioe_scb_all_levels.parquet".into(),
            pipeline: PipelineOptions::default(),
            fetch: FetchConfig::default(),
        }
    }
}

impl Config {
    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.data_dir.join("processed")
    }

    pub fn combined_path(&self) -> PathBuf {
        self.processed_dir().join(&self.combined_file)
    }

    pub fn hierarchy_path(&self) -> PathBuf {
        self.processed_dir().join(&self.hierarchy_file)
    }

    pub fn output_path(&self) -> PathBuf {
        self.data_dir.join(&self.output_file)
    }

    /// Re-roots every relative data path under `root`.
    pub fn with_root<P: AsRef<Path>>(mut self, root: P) -> Self {
        self.data_dir = root.as_ref().join(&self.data_dir);
        self.name_map_file = root.as_ref().join(&self.name_map_file);
        self
    }
}

/// How age and sex are treated when weighting exposure by employment.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Breakdown {
    /// Keep one row per (code, age, sex, year). Percentiles are then ranked within each
    /// (year, level, age, sex) slice rather than across the whole (year, level).
    AgeSex,
    /// Sum counts over age and sex per (code, year); ranks span the whole (year, level).
    #[default]
    Pooled,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineOptions {
    pub min_year: i64,
    /// Drop armed-forces occupations (level-1 code "0")
    pub drop_code1_zero: bool,
    pub add_percentiles: bool,
    pub pct_scale: f64,
    pub descending: bool,
    pub metric_prefix: String,
    pub exposure_code_column: String,
    pub breakdown: Breakdown,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            min_year: 2014,
            drop_code1_zero: true,
            add_percentiles: true,
            pct_scale: 100.0,
            descending: false,
            metric_prefix: "daioe_".into(),
            exposure_code_column: "ssyk2012_4".into(),
            breakdown: Breakdown::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    pub base_url: String,
    pub language: String,
    pub max_workers: usize,
    /// Table id (also the output file stem) to PxWeb table path
    pub tables: BTreeMap<String, String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let tables = [
            ("ssyk96_05_to_13", "AM/AM0208/AM0208E/Yreg34"),
            ("ssyk12_14_to_18", "AM/AM0208/AM0208E/YREG51"),
            ("ssyk12_19_to_21", "AM/AM0208/AM0208E/YREG51N"),
            ("ssyk12_20_to_24", "AM/AM0208/AM0208E/YREG51BAS"),
        ]
        .into_iter()
        .map(|(id, path)| (id.to_string(), path.to_string()))
        .collect();
        Self {
            base_url: "https://api.scb.se/OV0104/v1/doris".into(),
            language: "en".into(),
            max_workers: 8,
            tables,
        }
    }
}
