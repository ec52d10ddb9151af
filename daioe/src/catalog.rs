//! Dimension values available in an output table. Built once by the caller and passed to
//! whatever needs the choices (filters, summaries).

use itertools::Itertools;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::parquet::{column_names, require_columns};
use crate::COL;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct OutputCatalog {
    pub levels: Vec<String>,
    pub sexes: Vec<String>,
    pub ages: Vec<String>,
    pub years: Vec<i64>,
}

fn unique_sorted(lf: &LazyFrame, column: &str) -> Result<Series> {
    let df = lf
        .clone()
        .select([col(column)
            .drop_nulls()
            .unique()
            .sort(SortOptions::default())])
        .collect()?;
    Ok(df.column(column)?.clone())
}

fn unique_strings(lf: &LazyFrame, column: &str) -> Result<Vec<String>> {
    let series = unique_sorted(lf, column)?.cast(&DataType::String)?;
    Ok(series
        .str()?
        .into_no_null_iter()
        .map(String::from)
        .collect_vec())
}

impl OutputCatalog {
    pub fn load(output: &LazyFrame) -> Result<Self> {
        require_columns(
            &column_names(output)?,
            &[COL::LEVEL, COL::SEX, COL::AGE, COL::YEAR],
            "output table",
        )?;
        let years = unique_sorted(output, COL::YEAR)?.cast(&DataType::Int64)?;
        Ok(Self {
            levels: unique_strings(output, COL::LEVEL)?,
            sexes: unique_strings(output, COL::SEX)?,
            ages: unique_strings(output, COL::AGE)?,
            years: years.i64()?.into_no_null_iter().collect(),
        })
    }
}

/// Row and column counts of a lazy table. Only a length is evaluated, not the table itself.
pub fn inspect(lf: &LazyFrame) -> Result<(usize, usize)> {
    let rows = lf
        .clone()
        .select([len().cast(DataType::UInt64).alias("rows")])
        .collect()?;
    let rows = rows.column("rows")?.u64()?.get(0).unwrap_or(0) as usize;
    Ok((rows, column_names(lf)?.len()))
}

#[cfg(test)]
mod tests {
    use polars::df;

    use super::*;

    #[test]
    fn test_catalog_values_are_unique_and_sorted() -> anyhow::Result<()> {
        let lf = df!(
            COL::LEVEL => &["SSYK4", "SSYK1", "SSYK4"],
            COL::SEX => &["women", "men", "women"],
            COL::AGE => &["25-29", "18-24", "25-29"],
            COL::YEAR => &[2024i64, 2023, 2024],
            "weight_sum" => &[1i64, 2, 3]
        )?
        .lazy();
        let catalog = OutputCatalog::load(&lf)?;
        assert_eq!(
            catalog,
            OutputCatalog {
                levels: vec!["SSYK1".into(), "SSYK4".into()],
                sexes: vec!["men".into(), "women".into()],
                ages: vec!["18-24".into(), "25-29".into()],
                years: vec![2023, 2024],
            }
        );
        assert_eq!(inspect(&lf)?, (3, 5));
        Ok(())
    }

    #[test]
    fn test_catalog_requires_dimensions() {
        let lf = df!(COL::LEVEL => &["SSYK4"]).unwrap().lazy();
        assert!(OutputCatalog::load(&lf).is_err());
    }
}
