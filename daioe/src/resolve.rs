//! Merge raw extracts, report duplicate and conflicting identities, and resolve them so that the
//! newest source wins.

use std::path::{Path, PathBuf};

use itertools::Itertools;
use log::{debug, info};
use nonempty::NonEmpty;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{DaioeError, Result};
use crate::parquet::{column_names, require_columns, scan_parquet};
use crate::COL;

const ROW_INDEX: &str = "_row";

/// One raw extract tagged with its recency. `rank` 0 is the newest source.
#[derive(Clone)]
pub struct SourceTable {
    pub name: String,
    pub rank: i64,
    pub frame: LazyFrame,
}

impl SourceTable {
    pub fn new(name: impl Into<String>, rank: i64, frame: LazyFrame) -> Self {
        Self {
            name: name.into(),
            rank,
            frame,
        }
    }
}

/// Counts describing how much the sources overlap before resolution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DuplicateReport {
    pub total_rows: i64,
    /// Rows belonging to an identity group with more than one row
    pub duplicate_rows: i64,
    /// Identity groups with more than one row
    pub duplicate_groups: i64,
    /// Identity groups whose `count` values disagree
    pub conflict_groups: i64,
    /// Rows left after resolution (one per identity)
    pub resolved_rows: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct YearSummary {
    pub min: i64,
    pub max: i64,
    pub rows_per_year: Vec<(i64, usize)>,
}

fn identity_exprs() -> Vec<Expr> {
    COL::IDENTITY.iter().map(|c| col(c)).collect()
}

/// List `<prefix>*.parquet` files in `dir`, newest first. File names are expected to embed the
/// period they cover, so a descending name sort puts the most recent extract first.
pub fn list_sources_newest_first<P: AsRef<Path>>(dir: P, prefix: &str) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Err(DaioeError::MissingInput(dir.to_path_buf()));
    }
    let entries = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    Ok(entries
        .into_iter()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with(prefix) && name.ends_with(".parquet"))
                .unwrap_or(false)
        })
        .sorted_by(|a, b| b.file_name().cmp(&a.file_name()))
        .collect())
}

/// Scan every extract in `dir` lazily, ranking them by recency.
pub fn load_sources<P: AsRef<Path>>(dir: P, prefix: &str) -> Result<NonEmpty<SourceTable>> {
    let files = list_sources_newest_first(&dir, prefix)?;
    info!("Files found: {}", files.len());
    for (rank, path) in files.iter().enumerate().take(10) {
        info!("  {rank:02}: {}", path.display());
    }
    if files.len() > 10 {
        info!("  ... +{} more", files.len() - 10);
    }
    let sources = files
        .iter()
        .enumerate()
        .map(|(rank, path)| {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            Ok(SourceTable::new(name, rank as i64, scan_parquet(path)?))
        })
        .collect::<Result<Vec<_>>>()?;
    NonEmpty::from_vec(sources).ok_or_else(|| DaioeError::NoSources {
        dir: dir.as_ref().to_path_buf(),
        prefix: prefix.to_string(),
    })
}

/// Union all sources with provenance columns. Every source must carry the required raw columns;
/// `occupation` is carried only when all sources have it.
pub fn tagged_union(sources: &NonEmpty<SourceTable>) -> Result<LazyFrame> {
    let mut carry_occupation = true;
    for source in sources.iter() {
        let names = column_names(&source.frame)?;
        require_columns(&names, &COL::REQUIRED_RAW, &source.name)?;
        carry_occupation &= names.iter().any(|c| c == COL::OCCUPATION);
    }
    debug!("Carrying occupation labels: {carry_occupation}");

    let mut values = vec![col(COL::CODE).cast(DataType::String)];
    if carry_occupation {
        values.push(col(COL::OCCUPATION).cast(DataType::String));
    }
    values.extend([
        col(COL::AGE).cast(DataType::String),
        col(COL::SEX).cast(DataType::String),
        col(COL::YEAR).cast(DataType::Int64),
        col(COL::COUNT).cast(DataType::Int64),
    ]);

    let frames = sources
        .iter()
        .map(|source| {
            source.frame.clone().select(values.clone()).with_columns([
                lit(source.name.clone()).alias(COL::SOURCE_FILE),
                lit(source.rank).alias(COL::SOURCE_RANK),
            ])
        })
        .collect_vec();
    Ok(concat(frames, UnionArgs::default())?)
}

fn scalar_i64(df: &DataFrame, name: &str) -> Result<i64> {
    Ok(df.column(name)?.i64()?.get(0).unwrap_or(0))
}

/// Evaluates the duplicate and conflict counts of a tagged union in a single aggregate query.
pub fn duplicate_report(union: &LazyFrame) -> Result<DuplicateReport> {
    let n = col("_n");
    let stats = union
        .clone()
        .group_by(identity_exprs())
        .agg([
            len().cast(DataType::Int64).alias("_n"),
            col(COL::COUNT)
                .n_unique()
                .cast(DataType::Int64)
                .alias("_n_unique"),
        ])
        .select([
            len().cast(DataType::Int64).alias("groups"),
            n.clone().sum().cast(DataType::Int64).alias("total_rows"),
            n.clone()
                .gt(lit(1))
                .sum()
                .cast(DataType::Int64)
                .alias("duplicate_groups"),
            when(n.clone().gt(lit(1)))
                .then(n.clone())
                .otherwise(lit(0i64))
                .sum()
                .cast(DataType::Int64)
                .alias("duplicate_rows"),
            col("_n_unique")
                .gt(lit(1))
                .sum()
                .cast(DataType::Int64)
                .alias("conflict_groups"),
        ])
        .collect()?;

    let report = DuplicateReport {
        total_rows: scalar_i64(&stats, "total_rows")?,
        duplicate_rows: scalar_i64(&stats, "duplicate_rows")?,
        duplicate_groups: scalar_i64(&stats, "duplicate_groups")?,
        conflict_groups: scalar_i64(&stats, "conflict_groups")?,
        resolved_rows: scalar_i64(&stats, "groups")?,
    };
    info!("Duplicate rows flagged: {}", report.duplicate_rows);
    info!("Duplicate identity groups: {}", report.duplicate_groups);
    info!("Conflicting count groups: {}", report.conflict_groups);
    Ok(report)
}

/// Keep one row per identity: the one from the lowest `source_rank`, and among equal ranks the
/// first in union order. Provenance columns are dropped.
pub fn resolve(union: LazyFrame) -> Result<LazyFrame> {
    let keys = identity_exprs();
    let values = column_names(&union)?
        .into_iter()
        .filter(|c| c != COL::SOURCE_FILE && c != COL::SOURCE_RANK)
        .map(|c| col(&c))
        .collect_vec();
    Ok(union
        .with_row_index(ROW_INDEX, None)
        .filter(col(COL::SOURCE_RANK).eq(col(COL::SOURCE_RANK).min().over(&keys)))
        .filter(col(ROW_INDEX).eq(col(ROW_INDEX).min().over(&keys)))
        .select(values))
}

/// Year range and rows per year of a resolved table. `None` for an empty table.
pub fn year_summary(df: &DataFrame) -> Result<Option<YearSummary>> {
    let by_year = df
        .clone()
        .lazy()
        .filter(col(COL::YEAR).is_not_null())
        .group_by([col(COL::YEAR)])
        .agg([len().alias("rows")])
        .sort_by_exprs([col(COL::YEAR)], SortMultipleOptions::default())
        .collect()?;
    let rows_per_year = by_year
        .column(COL::YEAR)?
        .i64()?
        .into_no_null_iter()
        .zip(by_year.column("rows")?.cast(&DataType::UInt64)?.u64()?.into_no_null_iter())
        .map(|(year, rows)| (year, rows as usize))
        .collect_vec();
    Ok(match (rows_per_year.first(), rows_per_year.last()) {
        (Some((min, _)), Some((max, _))) => Some(YearSummary {
            min: *min,
            max: *max,
            rows_per_year: rows_per_year.clone(),
        }),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use nonempty::nonempty;
    use polars::df;
    use tempfile::TempDir;

    use super::*;
    use crate::parquet::write_parquet;

    fn extract(codes: &[&str], years: &[i64], counts: &[i64]) -> LazyFrame {
        let n = codes.len();
        df!(
            COL::CODE => codes,
            COL::AGE => vec!["18-24"; n],
            COL::SEX => vec!["men"; n],
            COL::YEAR => years,
            COL::COUNT => counts
        )
        .unwrap()
        .lazy()
    }

    fn counts_of(df: &DataFrame) -> Vec<i64> {
        df.column(COL::COUNT)
            .unwrap()
            .i64()
            .unwrap()
            .into_no_null_iter()
            .collect()
    }

    #[test]
    fn test_newest_source_wins() -> anyhow::Result<()> {
        let sources = nonempty![
            SourceTable::new("s2", 0, extract(&["A"], &[2020], &[15])),
            SourceTable::new("s1", 1, extract(&["A"], &[2020], &[10])),
        ];
        let union = tagged_union(&sources)?;
        let report = duplicate_report(&union)?;
        assert_eq!(
            report,
            DuplicateReport {
                total_rows: 2,
                duplicate_rows: 2,
                duplicate_groups: 1,
                conflict_groups: 1,
                resolved_rows: 1,
            }
        );
        let resolved = resolve(union)?.collect()?;
        assert_eq!(resolved.height(), 1);
        assert_eq!(counts_of(&resolved), vec![15]);
        assert!(resolved.column(COL::SOURCE_RANK).is_err());
        assert!(resolved.column(COL::SOURCE_FILE).is_err());
        Ok(())
    }

    #[test]
    fn test_rank_beats_union_order() -> anyhow::Result<()> {
        // The older source comes first in the union but must still lose
        let sources = nonempty![
            SourceTable::new("old", 3, extract(&["A", "B"], &[2020, 2020], &[1, 2])),
            SourceTable::new("new", 0, extract(&["A"], &[2020], &[9])),
        ];
        let resolved = resolve(tagged_union(&sources)?)?
            .sort_by_exprs([col(COL::CODE)], SortMultipleOptions::default())
            .collect()?;
        assert_eq!(counts_of(&resolved), vec![9, 2]);
        Ok(())
    }

    #[test]
    fn test_equal_rank_keeps_first_row() -> anyhow::Result<()> {
        let sources = nonempty![SourceTable::new(
            "only",
            0,
            extract(&["A", "A", "A"], &[2021, 2021, 2021], &[7, 8, 7])
        )];
        let union = tagged_union(&sources)?;
        let report = duplicate_report(&union)?;
        assert_eq!(report.duplicate_rows, 3);
        assert_eq!(report.conflict_groups, 1);
        assert_eq!(counts_of(&resolve(union)?.collect()?), vec![7]);
        Ok(())
    }

    #[test]
    fn test_identity_is_unique_after_resolution() -> anyhow::Result<()> {
        let sources = nonempty![
            SourceTable::new("a", 0, extract(&["A", "B", "C"], &[2020, 2020, 2021], &[1, 2, 3])),
            SourceTable::new("b", 1, extract(&["A", "B", "C"], &[2020, 2021, 2021], &[1, 5, 6])),
            SourceTable::new("c", 2, extract(&["A", "D"], &[2020, 2020], &[1, 1])),
        ];
        let union = tagged_union(&sources)?;
        let report = duplicate_report(&union)?;
        // A/2020 agrees everywhere, C/2021 disagrees
        assert_eq!(report.duplicate_groups, 2);
        assert_eq!(report.conflict_groups, 1);
        assert_eq!(report.duplicate_rows, 5);

        let resolved = resolve(union)?.collect()?;
        let unique = resolved
            .clone()
            .lazy()
            .unique(None, UniqueKeepStrategy::Any)
            .collect()?;
        assert_eq!(resolved.height() as i64, report.resolved_rows);
        assert_eq!(unique.height(), resolved.height());
        Ok(())
    }

    #[test]
    fn test_missing_count_column_is_rejected() {
        let frame = df!(
            COL::CODE => &["A"],
            COL::AGE => &["18-24"],
            COL::SEX => &["men"],
            COL::YEAR => &[2020i64]
        )
        .unwrap()
        .lazy();
        let sources = nonempty![SourceTable::new("broken.parquet", 0, frame)];
        match tagged_union(&sources) {
            Err(DaioeError::MissingColumns { table, missing }) => {
                assert_eq!(table, "broken.parquet");
                assert_eq!(missing, vec![COL::COUNT.to_string()]);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("validation should fail"),
        }
    }

    #[test]
    fn test_occupation_carried_only_when_everywhere() -> anyhow::Result<()> {
        let labelled = extract(&["A"], &[2020], &[1])
            .with_column(lit("Managers").alias(COL::OCCUPATION));
        let first = SourceTable::new("a", 0, labelled.clone());
        let second = SourceTable::new("b", 1, labelled);
        let sources = nonempty![first, second];
        let names = column_names(&tagged_union(&sources)?)?;
        assert!(names.iter().any(|c| c == COL::OCCUPATION));

        let sources = nonempty![
            SourceTable::new("a", 0, extract(&["A"], &[2020], &[1])
                .with_column(lit("Managers").alias(COL::OCCUPATION))),
            SourceTable::new("b", 1, extract(&["A"], &[2020], &[1])),
        ];
        let names = column_names(&tagged_union(&sources)?)?;
        assert!(!names.iter().any(|c| c == COL::OCCUPATION));
        Ok(())
    }

    #[test]
    fn test_sources_listed_newest_first() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        for name in ["ssyk12_14_to_18", "ssyk12_20_to_24", "ssyk12_19_to_21", "ssyk96_05_to_13"] {
            let mut df = extract(&["A"], &[2020], &[1]).collect()?;
            write_parquet(dir.path().join(format!("{name}.parquet")), &mut df)?;
        }
        let sources = load_sources(dir.path(), "ssyk12")?;
        let names = sources.iter().map(|s| s.name.as_str()).collect_vec();
        assert_eq!(
            names,
            vec![
                "ssyk12_20_to_24.parquet",
                "ssyk12_19_to_21.parquet",
                "ssyk12_14_to_18.parquet"
            ]
        );
        assert_eq!(sources.iter().map(|s| s.rank).collect_vec(), vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_no_sources_is_an_error() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        assert!(matches!(
            load_sources(dir.path(), "ssyk12"),
            Err(DaioeError::NoSources { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_year_summary() -> anyhow::Result<()> {
        let df = extract(&["A", "B", "C"], &[2021, 2019, 2021], &[1, 2, 3]).collect()?;
        let summary = year_summary(&df)?.unwrap();
        assert_eq!(summary.min, 2019);
        assert_eq!(summary.max, 2021);
        assert_eq!(summary.rows_per_year, vec![(2019, 1), (2021, 2)]);
        Ok(())
    }
}
