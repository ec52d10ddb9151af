//! Simple and employment-weighted exposure means per hierarchy group, with within-group
//! percentile ranks.

use itertools::Itertools;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::exposure::MetricSet;
use crate::hierarchy::Level;
use crate::COL;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PercentileOptions {
    /// Percentiles span `0..=scale`
    pub scale: f64,
    pub descending: bool,
}

impl Default for PercentileOptions {
    fn default() -> Self {
        Self {
            scale: 100.0,
            descending: false,
        }
    }
}

/// Columns a percentile is ranked within. Age and sex are constant under a pooled breakdown,
/// so this reduces to (year, level) there.
pub fn rank_partition() -> Vec<Expr> {
    vec![col(COL::YEAR), col(COL::LEVEL), col(COL::AGE), col(COL::SEX)]
}

/// Percentile of `column` within `partition`: average rank under ties, mapped through
/// `(rank - 1) / (n - 1)` onto `0..=scale`, where `n` is the number of rows in the partition.
///
/// A partition with a single row yields 0. Null values get a null percentile but still count
/// towards `n`.
pub fn percentile_expr(column: &str, partition: &[Expr], options: &PercentileOptions) -> Expr {
    let rank = col(column)
        .rank(
            RankOptions {
                method: RankMethod::Average,
                descending: options.descending,
            },
            None,
        )
        .over(partition);
    let n = len().over(partition).cast(DataType::Float64);
    let relative = when(n.clone().gt(lit(1.0)))
        .then((rank - lit(1.0)) / (n - lit(1.0)))
        .otherwise(lit(0.0));
    when(col(column).is_not_null())
        .then(relative * lit(options.scale))
        .otherwise(lit(Null {}))
}

/// Group the joined table at `level` and compute, per metric, the unweighted mean and the
/// `weight_col`-weighted mean. Percentile columns are added when `percentiles` is set.
pub fn aggregate_level(
    joined: LazyFrame,
    metrics: &MetricSet,
    level: Level,
    weight_col: &str,
    percentiles: Option<&PercentileOptions>,
) -> LazyFrame {
    let weight = col(weight_col);
    let mut aggs = vec![weight.clone().sum().alias(COL::WEIGHT_SUM)];
    for m in metrics.iter() {
        aggs.push(col(&m.metric).mean().alias(&m.avg));
        // Rows without exposure carry no weight here; null when the group has none at all
        let covered = weight.clone().filter(col(&m.metric).is_not_null()).sum();
        aggs.push(
            when(col(&m.metric).count().gt(lit(0)))
                .then((col(&m.metric) * weight.clone()).sum() / covered)
                .otherwise(lit(Null {}))
                .alias(&m.wavg),
        );
    }

    let out = joined
        .group_by([
            col(level.code_column()).alias(COL::SSYK_CODE),
            col(COL::AGE),
            col(COL::SEX),
            col(COL::YEAR),
        ])
        .agg(aggs)
        .with_column(lit(level.to_string()).alias(COL::LEVEL));

    let out = match percentiles {
        Some(options) => {
            let partition = rank_partition();
            out.with_columns(
                metrics
                    .iter()
                    .flat_map(|m| {
                        [
                            percentile_expr(&m.avg, &partition, options).alias(&m.pctl_avg),
                            percentile_expr(&m.wavg, &partition, options).alias(&m.pctl_wavg),
                        ]
                    })
                    .collect_vec(),
            )
        }
        None => out,
    };
    out.select(
        metrics
            .output_columns(percentiles.is_some())
            .iter()
            .map(|c| col(c))
            .collect_vec(),
    )
}

/// Aggregate every level (finest first), stack them and sort by (level, year, ssyk_code).
pub fn build_all_levels(
    joined: LazyFrame,
    metrics: &MetricSet,
    weight_col: &str,
    percentiles: Option<&PercentileOptions>,
) -> PolarsResult<LazyFrame> {
    let levels = Level::finest_first()
        .map(|level| aggregate_level(joined.clone(), metrics, level, weight_col, percentiles))
        .collect_vec();
    Ok(concat(levels, UnionArgs::default())?.sort_by_exprs(
        [
            col(COL::LEVEL),
            col(COL::YEAR),
            col(COL::SSYK_CODE),
            col(COL::AGE),
            col(COL::SEX),
        ],
        SortMultipleOptions::default(),
    ))
}
