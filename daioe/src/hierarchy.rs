//! Derive the four nested SSYK levels from level-4 codes, roll counts up to each level and attach
//! occupation names.

use std::path::Path;

use itertools::Itertools;
use log::{info, warn};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use crate::error::{DaioeError, Result};
use crate::parquet::{column_names, read_parquet, require_columns, scan_csv_as_strings};
use crate::COL;

/// Width of a full (level-4) classification code.
pub const CODE_WIDTH: usize = 4;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
pub enum Level {
    #[strum(serialize = "SSYK1")]
    #[serde(rename = "SSYK1")]
    Ssyk1,
    #[strum(serialize = "SSYK2")]
    #[serde(rename = "SSYK2")]
    Ssyk2,
    #[strum(serialize = "SSYK3")]
    #[serde(rename = "SSYK3")]
    Ssyk3,
    #[strum(serialize = "SSYK4")]
    #[serde(rename = "SSYK4")]
    Ssyk4,
}

impl Level {
    /// Number of leading code characters identifying a group at this level.
    pub fn width(self) -> usize {
        match self {
            Level::Ssyk1 => 1,
            Level::Ssyk2 => 2,
            Level::Ssyk3 => 3,
            Level::Ssyk4 => 4,
        }
    }

    /// Prefix column holding this level's code in the joined exposure table.
    pub fn code_column(self) -> &'static str {
        match self {
            Level::Ssyk1 => COL::CODE_1,
            Level::Ssyk2 => COL::CODE_2,
            Level::Ssyk3 => COL::CODE_3,
            Level::Ssyk4 => COL::CODE_4,
        }
    }

    pub fn finest_first() -> impl Iterator<Item = Level> {
        Level::iter().rev()
    }
}

/// Left prefix of `code` at `level` as an expression.
pub fn prefix_expr(code: Expr, level: Level) -> Expr {
    code.str().slice(lit(0i64), lit(level.width() as u64))
}

/// Fails with `InvalidCode` when any value of `column` is null or not exactly `width` characters.
pub fn validate_code_width(df: &DataFrame, column: &str, width: usize, table: &str) -> Result<()> {
    let invalid = df
        .clone()
        .lazy()
        .filter(
            col(column)
                .is_null()
                .or(col(column).str().len_chars().neq(lit(width as u32))),
        )
        .select([col(column).fill_null(lit("<null>")).unique_stable()])
        .limit(5)
        .collect()?;
    if invalid.height() == 0 {
        return Ok(());
    }
    let examples = invalid
        .column(column)?
        .str()?
        .into_no_null_iter()
        .map(String::from)
        .collect_vec();
    Err(DaioeError::InvalidCode {
        table: table.to_string(),
        expected: width,
        examples,
    })
}

/// Load the resolved extract, normalise dtypes and reject codes that are not level-4 codes.
pub fn load_resolved<P: AsRef<Path>>(path: P) -> Result<DataFrame> {
    let df = read_parquet(&path)?;
    let names = df
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect_vec();
    require_columns(&names, &COL::REQUIRED_RAW, "resolved extract")?;
    let df = df
        .lazy()
        .with_columns([
            col(COL::CODE).cast(DataType::String),
            col(COL::AGE).cast(DataType::String),
            col(COL::SEX).cast(DataType::String),
            col(COL::YEAR).cast(DataType::Int64),
            col(COL::COUNT).cast(DataType::Int64),
        ])
        .collect()?;
    validate_code_width(&df, COL::CODE, CODE_WIDTH, "resolved extract")?;
    info!("Input schema: {:?}", df.schema());
    Ok(df)
}

/// Sum counts per (code prefix, age, sex, year) for every level and stack the four tables.
/// Output columns: `level, ssyk_code, age, sex, year, count`.
pub fn build_hierarchy(resolved: LazyFrame) -> Result<LazyFrame> {
    let levels = Level::finest_first()
        .map(|level| {
            resolved
                .clone()
                .group_by([
                    prefix_expr(col(COL::CODE), level).alias(COL::SSYK_CODE),
                    col(COL::AGE),
                    col(COL::SEX),
                    col(COL::YEAR),
                ])
                .agg([col(COL::COUNT).sum().alias(COL::COUNT)])
                .select([
                    lit(level.to_string()).alias(COL::LEVEL),
                    col(COL::SSYK_CODE),
                    col(COL::AGE),
                    col(COL::SEX),
                    col(COL::YEAR),
                    col(COL::COUNT),
                ])
        })
        .collect_vec();
    Ok(concat(levels, UnionArgs::default())?)
}

/// Load the `code,name` structure file, trimming codes and keeping the first name per code.
pub fn load_name_map<P: AsRef<Path>>(path: P) -> Result<LazyFrame> {
    let lf = scan_csv_as_strings(path)?;
    require_columns(
        &column_names(&lf)?,
        &[COL::NAME_MAP_CODE, COL::NAME_MAP_NAME],
        "name map",
    )?;
    Ok(lf
        .select([
            col(COL::NAME_MAP_CODE).str().strip_chars(lit(Null {})),
            col(COL::NAME_MAP_NAME),
        ])
        .with_row_index("_row", None)
        .filter(col("_row").eq(col("_row").min().over([col(COL::NAME_MAP_CODE)])))
        .select([col(COL::NAME_MAP_CODE), col(COL::NAME_MAP_NAME)]))
}

/// Left join occupation names on `ssyk_code`. Codes without a name keep a null `occupation`.
pub fn map_occupation_names(hierarchy: LazyFrame, names: LazyFrame) -> LazyFrame {
    let names = names.select([
        col(COL::NAME_MAP_CODE).alias("_name_code"),
        col(COL::NAME_MAP_NAME).alias(COL::OCCUPATION),
    ]);
    hierarchy.join(
        names,
        [col(COL::SSYK_CODE)],
        [col("_name_code")],
        JoinArgs::new(JoinType::Left),
    )
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnmappedCode {
    pub level: String,
    pub ssyk_code: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct MappingDiagnostics {
    pub unmapped_rows: i64,
    pub unique_codes: i64,
    pub unmapped_codes: Vec<UnmappedCode>,
}

pub fn mapping_diagnostics(df: &DataFrame) -> Result<MappingDiagnostics> {
    let stats = df
        .clone()
        .lazy()
        .select([
            col(COL::OCCUPATION)
                .is_null()
                .sum()
                .cast(DataType::Int64)
                .alias("unmapped_rows"),
            col(COL::SSYK_CODE)
                .n_unique()
                .cast(DataType::Int64)
                .alias("unique_codes"),
        ])
        .collect()?;
    let unmapped = df
        .clone()
        .lazy()
        .filter(col(COL::OCCUPATION).is_null())
        .select([col(COL::LEVEL), col(COL::SSYK_CODE)])
        .unique(None, UniqueKeepStrategy::Any)
        .sort_by_exprs(
            [col(COL::LEVEL), col(COL::SSYK_CODE)],
            SortMultipleOptions::default(),
        )
        .collect()?;
    let unmapped_codes = unmapped
        .column(COL::LEVEL)?
        .str()?
        .into_iter()
        .zip(unmapped.column(COL::SSYK_CODE)?.str()?)
        .map(|(level, code)| UnmappedCode {
            level: level.unwrap_or_default().to_string(),
            ssyk_code: code.unwrap_or_default().to_string(),
        })
        .collect_vec();

    let diagnostics = MappingDiagnostics {
        unmapped_rows: stats.column("unmapped_rows")?.i64()?.get(0).unwrap_or(0),
        unique_codes: stats.column("unique_codes")?.i64()?.get(0).unwrap_or(0),
        unmapped_codes,
    };
    info!(
        "Mapping diagnostics: unmapped_rows={}, unique_codes={}",
        diagnostics.unmapped_rows, diagnostics.unique_codes
    );
    if !diagnostics.unmapped_codes.is_empty() {
        warn!(
            "Unmapped SSYK codes: {}",
            diagnostics
                .unmapped_codes
                .iter()
                .map(|u| format!("{}:{}", u.level, u.ssyk_code))
                .join(", ")
        );
    }
    Ok(diagnostics)
}

/// Row count per level label, sorted by label.
pub fn rows_per_level(df: &DataFrame) -> Result<Vec<(String, usize)>> {
    let counts = df
        .clone()
        .lazy()
        .group_by([col(COL::LEVEL)])
        .agg([len().cast(DataType::UInt64).alias("rows")])
        .sort_by_exprs([col(COL::LEVEL)], SortMultipleOptions::default())
        .collect()?;
    Ok(counts
        .column(COL::LEVEL)?
        .str()?
        .into_no_null_iter()
        .zip(counts.column("rows")?.u64()?.into_no_null_iter())
        .map(|(level, rows)| (level.to_string(), rows as usize))
        .collect())
}
