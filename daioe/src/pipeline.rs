//! Stage orchestration. Each stage builds its lazy plan from the components, evaluates it once
//! and persists the result to the path given by [`Config`].

use std::path::{Path, PathBuf};

use itertools::Itertools;
use log::{debug, info};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::aggregate::{build_all_levels, PercentileOptions};
use crate::config::{Config, PipelineOptions};
use crate::error::Result;
use crate::exposure::{join_exposure, level4_counts, load_exposure, prepare_exposure, MetricSet};
use crate::extend::extend_years_to_match;
use crate::hierarchy::{
    build_hierarchy, load_name_map, load_resolved, map_occupation_names, mapping_diagnostics,
    rows_per_level, MappingDiagnostics,
};
use crate::parquet::{column_names, require_columns, scan_parquet, write_parquet};
use crate::resolve::{
    duplicate_report, load_sources, resolve, tagged_union, year_summary, DuplicateReport,
    YearSummary,
};
use crate::COL;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CombineSummary {
    pub sources: Vec<String>,
    pub report: DuplicateReport,
    pub years: Option<YearSummary>,
    pub path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HierarchySummary {
    pub rows: usize,
    pub rows_per_level: Vec<(String, usize)>,
    pub diagnostics: MappingDiagnostics,
    pub path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PipelineSummary {
    pub rows: usize,
    pub columns: Vec<String>,
    pub metrics: Vec<String>,
    pub path: PathBuf,
}

/// The unevaluated exposure pipeline and the metrics it aggregates.
pub struct PipelinePlan {
    pub plan: LazyFrame,
    pub metrics: MetricSet,
}

/// Merge the raw extracts under `raw_dir`, report duplicates and write the resolved table.
pub fn run_combine(config: &Config) -> Result<CombineSummary> {
    let sources = load_sources(config.raw_dir(), &config.raw_prefix)?;
    let names = sources.iter().map(|s| s.name.clone()).collect_vec();
    let union = tagged_union(&sources)?;
    let mut report = duplicate_report(&union)?;

    let mut resolved = resolve(union)?.collect()?;
    report.resolved_rows = resolved.height() as i64;
    let years = year_summary(&resolved)?;
    if let Some(years) = &years {
        info!("Years: {} - {}", years.min, years.max);
    }

    let path = config.combined_path();
    write_parquet(&path, &mut resolved)?;
    info!("Saved {} rows to {}", resolved.height(), path.display());
    Ok(CombineSummary {
        sources: names,
        report,
        years,
        path,
    })
}

/// Roll the resolved table up to every level, attach occupation names and write it.
pub fn run_hierarchy(config: &Config) -> Result<HierarchySummary> {
    let resolved = load_resolved(config.combined_path())?;
    let names = load_name_map(&config.name_map_file)?;
    let mut df = map_occupation_names(build_hierarchy(resolved.lazy())?, names)
        .sort_by_exprs(
            [
                col(COL::LEVEL),
                col(COL::SSYK_CODE),
                col(COL::YEAR),
                col(COL::AGE),
                col(COL::SEX),
            ],
            SortMultipleOptions::default(),
        )
        .collect()?;

    let rows_per_level = rows_per_level(&df)?;
    for (level, rows) in &rows_per_level {
        info!("{level}: {rows} rows");
    }
    let diagnostics = mapping_diagnostics(&df)?;

    let path = config.hierarchy_path();
    write_parquet(&path, &mut df)?;
    info!("Saved {} rows to {}", df.height(), path.display());
    Ok(HierarchySummary {
        rows: df.height(),
        rows_per_level,
        diagnostics,
        path,
    })
}

/// Compose the exposure pipeline over a hierarchy table without evaluating it.
///
/// Exposure is carried forward to the last year of the counts, joined onto the level-4 counts,
/// filtered by `min_year` (and armed-forces codes when configured), then aggregated at every
/// level.
pub fn build_pipeline(
    hierarchy: LazyFrame,
    exposure_raw: DataFrame,
    options: &PipelineOptions,
) -> Result<PipelinePlan> {
    require_columns(
        &column_names(&hierarchy)?,
        &[
            COL::LEVEL,
            COL::SSYK_CODE,
            COL::AGE,
            COL::SEX,
            COL::YEAR,
            COL::COUNT,
        ],
        "hierarchy table",
    )?;
    let (exposure, metrics) = prepare_exposure(exposure_raw, options)?;
    debug!("Metrics: {:?}", metrics.metric_names());

    let counts = level4_counts(hierarchy, options.breakdown);
    let exposure = extend_years_to_match(exposure, counts.clone(), COL::YEAR)?;
    let mut joined =
        join_exposure(counts, exposure).filter(col(COL::YEAR).gt_eq(lit(options.min_year)));
    if options.drop_code1_zero {
        joined = joined.filter(col(COL::CODE_1).neq(lit("0")));
    }

    let percentiles = options.add_percentiles.then(|| PercentileOptions {
        scale: options.pct_scale,
        descending: options.descending,
    });
    let plan = build_all_levels(joined, &metrics, COL::TOTAL_COUNT, percentiles.as_ref())?;
    Ok(PipelinePlan { plan, metrics })
}

/// Run the exposure pipeline end to end. The plan is evaluated once and written to `output`
/// (or the configured output path). Nothing is written if any stage fails.
pub async fn run_pipeline(config: &Config, output: Option<&Path>) -> Result<PipelineSummary> {
    let hierarchy = scan_parquet(config.hierarchy_path())?;
    let exposure_raw = load_exposure(&config.exposure_source).await?;
    let PipelinePlan { plan, metrics } = build_pipeline(hierarchy, exposure_raw, &config.pipeline)?;

    let mut df = plan.collect()?;
    let path = output.map(Path::to_path_buf).unwrap_or_else(|| config.output_path());
    write_parquet(&path, &mut df)?;
    info!("Output rows: {}, columns: {}", df.height(), df.width());
    info!("Saved to {}", path.display());
    Ok(PipelineSummary {
        rows: df.height(),
        columns: df
            .get_column_names()
            .iter()
            .map(|c| c.to_string())
            .collect(),
        metrics: metrics
            .metric_names()
            .into_iter()
            .map(String::from)
            .collect(),
        path,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use polars::df;
    use tempfile::TempDir;

    use super::*;
    use crate::error::DaioeError;
    use crate::parquet::read_parquet;

    const NAME_MAP: &str = "code,name\n1,Managers\n11,Chief executives\n111,Legislators\n\
        1111,Legislators\n1112,Senior officials\n2,Professionals\n";
    const EXPOSURE: &str = "ssyk2012_4,year,daioe_genai\n1111,2022,1.0\n1112,2022,3.0\n\
        2111,2022,5.0\n0110,2022,9.0\n1111,2010,100.0\n";

    fn setup() -> anyhow::Result<(TempDir, Config)> {
        let dir = tempfile::tempdir()?;
        let mut config = Config::default().with_root(dir.path());
        config.exposure_source = dir
            .path()
            .join("exposure.csv")
            .to_string_lossy()
            .to_string();
        fs::write(&config.exposure_source, EXPOSURE)?;
        fs::write(&config.name_map_file, NAME_MAP)?;

        let mut newer = df!(
            COL::CODE => ["1111", "1112", "2111", "0110"],
            COL::AGE => ["16-24"; 4],
            COL::SEX => ["men"; 4],
            COL::YEAR => [2023i64; 4],
            COL::COUNT => [10i64, 30, 20, 5]
        )?;
        let mut older = df!(
            COL::CODE => ["1111", "1111"],
            COL::AGE => ["16-24", "16-24"],
            COL::SEX => ["men", "men"],
            COL::YEAR => [2023i64, 2022],
            COL::COUNT => [99i64, 7]
        )?;
        write_parquet(config.raw_dir().join("ssyk12_20_to_23.parquet"), &mut newer)?;
        write_parquet(config.raw_dir().join("ssyk12_14_to_18.parquet"), &mut older)?;
        Ok((dir, config))
    }

    fn f64_at(df: &DataFrame, level: &str, year: i64, code: &str, column: &str) -> Option<f64> {
        let row = df
            .clone()
            .lazy()
            .filter(
                col(COL::LEVEL)
                    .eq(lit(level))
                    .and(col(COL::YEAR).eq(lit(year)))
                    .and(col(COL::SSYK_CODE).eq(lit(code))),
            )
            .collect()
            .unwrap();
        assert_eq!(row.height(), 1, "{level} {year} {code}");
        row.column(column).unwrap().f64().unwrap().get(0)
    }

    #[tokio::test]
    async fn test_stages_end_to_end() -> anyhow::Result<()> {
        let (_dir, config) = setup()?;

        let combined = run_combine(&config)?;
        assert_eq!(
            combined.sources,
            vec!["ssyk12_20_to_23.parquet", "ssyk12_14_to_18.parquet"]
        );
        assert_eq!(combined.report.total_rows, 6);
        assert_eq!(combined.report.conflict_groups, 1);
        assert_eq!(combined.report.resolved_rows, 5);
        assert_eq!(combined.years.as_ref().map(|y| (y.min, y.max)), Some((2022, 2023)));

        let hierarchy = run_hierarchy(&config)?;
        assert!(hierarchy.diagnostics.unmapped_rows > 0);
        assert!(hierarchy.path.exists());

        let summary = run_pipeline(&config, None).await?;
        assert_eq!(summary.metrics, vec!["daioe_genai"]);
        assert_eq!(summary.path, config.output_path());
        // 2022: one code per level; 2023: 1111/1112/2111 roll up to 3, 2, 2, 2 codes
        assert_eq!(summary.rows, 13);

        let out = read_parquet(&summary.path)?;
        let codes = out.column(COL::SSYK_CODE)?.str()?;
        assert!(codes.into_no_null_iter().all(|c| !c.starts_with('0')));
        assert_eq!(out.column(COL::LEVEL)?.str()?.get(0), Some("SSYK1"));
        assert_eq!(out.column(COL::YEAR)?.i64()?.get(0), Some(2022));

        // Exposure for 2022 carried to 2023, weighted by the newer counts (10 and 30)
        assert_eq!(f64_at(&out, "SSYK1", 2023, "1", "daioe_genai_avg"), Some(2.0));
        assert_eq!(f64_at(&out, "SSYK1", 2023, "1", "daioe_genai_wavg"), Some(2.5));
        assert_eq!(f64_at(&out, "SSYK1", 2023, "1", "pctl_daioe_genai_avg"), Some(0.0));
        assert_eq!(f64_at(&out, "SSYK1", 2023, "2", "pctl_daioe_genai_avg"), Some(100.0));
        assert_eq!(f64_at(&out, "SSYK4", 2022, "1111", "pctl_daioe_genai_wavg"), Some(0.0));
        Ok(())
    }

    #[tokio::test]
    async fn test_output_override_and_no_percentiles() -> anyhow::Result<()> {
        let (dir, mut config) = setup()?;
        config.pipeline.add_percentiles = false;
        run_combine(&config)?;
        run_hierarchy(&config)?;

        let output = dir.path().join("custom.parquet");
        let summary = run_pipeline(&config, Some(&output)).await?;
        assert!(output.exists());
        assert!(!config.output_path().exists());
        assert!(!summary.columns.iter().any(|c| c.starts_with("pctl_")));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_run_writes_nothing() -> anyhow::Result<()> {
        let (_dir, config) = setup()?;
        run_combine(&config)?;
        run_hierarchy(&config)?;
        fs::write(&config.exposure_source, "ssyk2012_4,year,daioe_genai\n111,2022,1.0\n")?;

        let result = run_pipeline(&config, None).await;
        assert!(matches!(result, Err(DaioeError::InvalidCode { .. })));
        assert!(!config.output_path().exists());
        Ok(())
    }

    #[test]
    fn test_missing_hierarchy_column_is_fatal() -> anyhow::Result<()> {
        let hierarchy = df!(
            COL::LEVEL => ["SSYK4"],
            COL::SSYK_CODE => ["1111"],
            COL::YEAR => [2023i64],
            COL::COUNT => [1i64]
        )?;
        let exposure = df!(
            "ssyk2012_4" => ["1111"],
            COL::YEAR => ["2023"],
            "daioe_genai" => ["1.0"]
        )?;
        let result = build_pipeline(hierarchy.lazy(), exposure, &PipelineOptions::default());
        assert!(matches!(result, Err(DaioeError::MissingColumns { .. })));
        Ok(())
    }

    #[test]
    fn test_default_breakdown_pools_age_and_sex() -> anyhow::Result<()> {
        let hierarchy = || {
            df!(
                COL::LEVEL => ["SSYK4", "SSYK4", "SSYK1"],
                COL::SSYK_CODE => ["1111", "1111", "1"],
                COL::AGE => ["16-24", "25-34", "16-24"],
                COL::SEX => ["men", "women", "men"],
                COL::YEAR => [2023i64, 2023, 2023],
                COL::COUNT => [10i64, 30, 40]
            )
        };
        let exposure = df!(
            "ssyk2012_4" => ["1111"],
            COL::YEAR => ["2023"],
            "daioe_genai" => ["2.0"]
        )?;

        let out = build_pipeline(
            hierarchy()?.lazy(),
            exposure.clone(),
            &PipelineOptions::default(),
        )?
        .plan
            .collect()?;
        // One row per level, ranked across the whole (year, level)
        assert_eq!(out.height(), 4);
        let ages = out.column(COL::AGE)?.str()?;
        assert!(ages.into_no_null_iter().all(|a| a == COL::POOLED));
        let weights = out.column(COL::WEIGHT_SUM)?.cast(&DataType::Int64)?;
        assert!(weights.i64()?.into_no_null_iter().all(|w| w == 40));

        let options = PipelineOptions {
            breakdown: crate::config::Breakdown::AgeSex,
            ..Default::default()
        };
        let out = build_pipeline(hierarchy()?.lazy(), exposure, &options)?
            .plan
            .collect()?;
        // Each age/sex slice keeps its own row and weight at every level
        assert_eq!(out.height(), 8);
        let weights = out.column(COL::WEIGHT_SUM)?.cast(&DataType::Int64)?;
        assert!(weights.i64()?.into_no_null_iter().all(|w| w == 10 || w == 30));
        Ok(())
    }
}
