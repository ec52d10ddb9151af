//! Carry the last known year of a series forward so it covers the years of a reference series.

use itertools::Itertools;
use log::debug;
use polars::prelude::*;

use crate::error::{DaioeError, Result};
use crate::parquet::column_names;

const TARGET_MAX: &str = "_target_max";
const REFERENCE_MAX: &str = "_reference_max";

fn no_keys() -> Vec<Expr> {
    vec![]
}

fn scalar_max(df: &DataFrame, name: &str) -> Result<Option<i64>> {
    Ok(df.column(name)?.i64()?.get(0))
}

/// Append copies of `target`'s latest year for every year in
/// `max(target.year) + 1 ..= max(reference.year)`, keeping `target`'s column order.
///
/// Existing rows are never altered. When the reference does not reach past the target the range
/// is empty and `target` comes back with the same rows, so applying this twice with the same
/// reference adds nothing the second time. Only the two maxima are evaluated here; the
/// replication itself stays lazy.
pub fn extend_years_to_match(
    target: LazyFrame,
    reference: LazyFrame,
    year_col: &str,
) -> Result<LazyFrame> {
    let columns = column_names(&target)?;
    let year_dtype = {
        let mut target = target.clone();
        target
            .schema()?
            .get(year_col)
            .cloned()
            .ok_or_else(|| DaioeError::MissingColumns {
                table: "series to extend".into(),
                missing: vec![year_col.to_string()],
            })?
    };
    if !column_names(&reference)?.iter().any(|c| c == year_col) {
        return Err(DaioeError::MissingColumns {
            table: "reference series".into(),
            missing: vec![year_col.to_string()],
        });
    }

    let bounds = target
        .clone()
        .select([col(year_col).max().cast(DataType::Int64).alias(TARGET_MAX)])
        .join(
            reference.select([col(year_col).max().cast(DataType::Int64).alias(REFERENCE_MAX)]),
            no_keys(),
            no_keys(),
            JoinArgs::new(JoinType::Cross),
        )
        .collect()?;
    let (target_max, reference_max) = match (
        scalar_max(&bounds, TARGET_MAX)?,
        scalar_max(&bounds, REFERENCE_MAX)?,
    ) {
        (Some(t), Some(r)) if r > t => (t, r),
        _ => return Ok(target),
    };
    debug!("Extending '{year_col}' from {target_max} to {reference_max}");

    let missing_years = Series::new(year_col, ((target_max + 1)..=reference_max).collect_vec())
        .cast(&year_dtype)?
        .into_frame()
        .lazy();
    let latest = target
        .clone()
        .filter(col(year_col).eq(col(year_col).max()))
        .select(
            columns
                .iter()
                .filter(|c| c.as_str() != year_col)
                .map(|c| col(c))
                .collect_vec(),
        );
    let replicated = latest
        .join(
            missing_years,
            no_keys(),
            no_keys(),
            JoinArgs::new(JoinType::Cross),
        )
        .select(columns.iter().map(|c| col(c)).collect_vec());

    Ok(concat([target, replicated], UnionArgs::default())?)
}
