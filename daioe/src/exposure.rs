//! Exposure source loading and the join of exposure metrics onto level-4 employment counts.

use std::collections::HashSet;

use itertools::Itertools;
use log::{debug, info};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::config::{Breakdown, PipelineOptions};
use crate::error::{DaioeError, Result};
use crate::hierarchy::{prefix_expr, validate_code_width, Level, CODE_WIDTH};
use crate::parquet::{read_csv_bytes_as_strings, require_columns, scan_csv_as_strings};
use crate::COL;

/// The four output fields derived from one exposure metric.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MetricColumns {
    pub metric: String,
    pub avg: String,
    pub wavg: String,
    pub pctl_avg: String,
    pub pctl_wavg: String,
}

impl MetricColumns {
    pub fn new(metric: &str) -> Self {
        Self {
            metric: metric.to_string(),
            avg: format!("{metric}_avg"),
            wavg: format!("{metric}_wavg"),
            pctl_avg: format!("pctl_{metric}_avg"),
            pctl_wavg: format!("pctl_{metric}_wavg"),
        }
    }

    fn derived(&self) -> [&str; 4] {
        [
            self.avg.as_str(),
            self.wavg.as_str(),
            self.pctl_avg.as_str(),
            self.pctl_wavg.as_str(),
        ]
    }
}

/// Exposure metrics found in a source, each mapped to its derived output columns. Built once
/// from the source schema and checked for name collisions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MetricSet {
    pub prefix: String,
    metrics: Vec<MetricColumns>,
}

impl MetricSet {
    pub fn discover(columns: &[String], prefix: &str) -> Result<Self> {
        let metrics = columns
            .iter()
            .filter(|c| c.starts_with(prefix))
            .map(|c| MetricColumns::new(c))
            .collect_vec();
        if metrics.is_empty() {
            return Err(DaioeError::NoMetrics(prefix.to_string()));
        }
        let mut seen: HashSet<&str> = columns.iter().map(|c| c.as_str()).collect();
        for name in metrics.iter().flat_map(|m| m.derived()) {
            if !seen.insert(name) {
                return Err(DaioeError::ColumnCollision(name.to_string()));
            }
        }
        debug!("Metrics: {:?}", metrics.iter().map(|m| &m.metric).collect_vec());
        Ok(Self {
            prefix: prefix.to_string(),
            metrics,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricColumns> {
        self.metrics.iter()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn get(&self, metric: &str) -> Option<&MetricColumns> {
        self.metrics.iter().find(|m| m.metric == metric)
    }

    pub fn metric_names(&self) -> Vec<&str> {
        self.metrics.iter().map(|m| m.metric.as_str()).collect()
    }

    /// Output column order: keys, weight sum, every avg/wavg pair, then every percentile pair.
    pub fn output_columns(&self, with_percentiles: bool) -> Vec<String> {
        let mut columns = [
            COL::LEVEL,
            COL::SSYK_CODE,
            COL::AGE,
            COL::SEX,
            COL::YEAR,
            COL::WEIGHT_SUM,
        ]
        .iter()
        .map(|c| c.to_string())
        .collect_vec();
        columns.extend(
            self.metrics
                .iter()
                .flat_map(|m| [m.avg.clone(), m.wavg.clone()]),
        );
        if with_percentiles {
            columns.extend(
                self.metrics
                    .iter()
                    .flat_map(|m| [m.pctl_avg.clone(), m.pctl_wavg.clone()]),
            );
        }
        columns
    }
}

/// Read the raw exposure CSV from a local path or an http(s) URL. All columns come back as
/// strings.
pub async fn load_exposure(source: &str) -> Result<DataFrame> {
    info!("Loading exposure source {source}");
    if source.starts_with("http://") || source.starts_with("https://") {
        let bytes = reqwest::get(source)
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        read_csv_bytes_as_strings(bytes.to_vec())
    } else {
        Ok(scan_csv_as_strings(source)?.collect()?)
    }
}

/// Validate the raw exposure table and normalise it to `code_4, year, <metrics...>`, keeping
/// only years from `min_year` on.
pub fn prepare_exposure(raw: DataFrame, options: &PipelineOptions) -> Result<(LazyFrame, MetricSet)> {
    let columns = raw
        .get_column_names()
        .iter()
        .map(|c| c.to_string())
        .collect_vec();
    require_columns(
        &columns,
        &[options.exposure_code_column.as_str(), COL::YEAR],
        "exposure source",
    )?;
    let metrics = MetricSet::discover(&columns, &options.metric_prefix)?;

    let mut select = vec![
        col(&options.exposure_code_column)
            .cast(DataType::String)
            .alias(COL::CODE_4),
        col(COL::YEAR).cast(DataType::Int64),
    ];
    select.extend(
        metrics
            .iter()
            .map(|m| col(&m.metric).cast(DataType::Float64)),
    );
    let df = raw.lazy().select(select).collect()?;
    validate_code_width(&df, COL::CODE_4, CODE_WIDTH, "exposure source")?;

    let duplicated = df
        .clone()
        .lazy()
        .group_by([col(COL::CODE_4), col(COL::YEAR)])
        .agg([len().cast(DataType::Int64).alias("_n")])
        .filter(col("_n").gt(lit(1i64)))
        .sort_by_exprs(
            [col(COL::CODE_4), col(COL::YEAR)],
            SortMultipleOptions::default(),
        )
        .collect()?;
    if duplicated.height() > 0 {
        let examples = duplicated
            .column(COL::CODE_4)?
            .str()?
            .into_iter()
            .zip(duplicated.column(COL::YEAR)?.i64()?)
            .take(5)
            .map(|(code, year)| {
                format!(
                    "{}/{}",
                    code.unwrap_or("<null>"),
                    year.map(|y| y.to_string()).unwrap_or_default()
                )
            })
            .collect_vec();
        return Err(DaioeError::DuplicateKeys {
            table: "exposure source".into(),
            pairs: duplicated.height(),
            examples,
        });
    }
    info!(
        "Exposure source: {} rows, {} metrics",
        df.height(),
        metrics.len()
    );
    Ok((
        df.lazy().filter(col(COL::YEAR).gt_eq(lit(options.min_year))),
        metrics,
    ))
}

/// Level-4 rows of the hierarchy table (selected by code length), summed into the
/// `total_count` weight at the requested breakdown.
pub fn level4_counts(hierarchy: LazyFrame, breakdown: Breakdown) -> LazyFrame {
    let level4 = hierarchy
        .with_column(col(COL::SSYK_CODE).cast(DataType::String))
        .filter(
            col(COL::SSYK_CODE)
                .str()
                .len_chars()
                .eq(lit(CODE_WIDTH as u32)),
        );
    let total = col(COL::COUNT).sum().alias(COL::TOTAL_COUNT);
    match breakdown {
        Breakdown::AgeSex => level4
            .group_by([
                col(COL::YEAR),
                col(COL::SSYK_CODE),
                col(COL::AGE),
                col(COL::SEX),
            ])
            .agg([total])
            .select([
                col(COL::YEAR),
                col(COL::SSYK_CODE),
                col(COL::AGE),
                col(COL::SEX),
                col(COL::TOTAL_COUNT),
            ]),
        Breakdown::Pooled => level4
            .group_by([col(COL::YEAR), col(COL::SSYK_CODE)])
            .agg([total])
            .select([
                col(COL::YEAR),
                col(COL::SSYK_CODE),
                lit(COL::POOLED).alias(COL::AGE),
                lit(COL::POOLED).alias(COL::SEX),
                col(COL::TOTAL_COUNT),
            ]),
    }
}

/// Left join exposure onto counts by (year, level-4 code). Count rows without exposure keep
/// null metrics. Adds the `code_1..code_4` prefix columns.
pub fn join_exposure(counts: LazyFrame, exposure: LazyFrame) -> LazyFrame {
    counts
        .join(
            exposure,
            [col(COL::YEAR), col(COL::SSYK_CODE)],
            [col(COL::YEAR), col(COL::CODE_4)],
            JoinArgs::new(JoinType::Left),
        )
        .with_columns(
            Level::iter()
                .map(|level| prefix_expr(col(COL::SSYK_CODE), level).alias(level.code_column()))
                .collect_vec(),
        )
}
