//! Bounded-concurrency download of source tables into the raw extract directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use log::{error, info};
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::config::FetchConfig;
use crate::error::{DaioeError, Result};
use crate::parquet::write_parquet;

/// A remote table to download and the extract id it is stored under.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub id: String,
    pub path: String,
}

impl TableSpec {
    pub fn new(id: &str, path: &str) -> Self {
        Self {
            id: id.to_string(),
            path: path.to_string(),
        }
    }

    pub fn from_config(config: &FetchConfig) -> Vec<Self> {
        config
            .tables
            .iter()
            .map(|(id, path)| Self::new(id, path))
            .collect()
    }
}

/// Something that can turn a table description into raw extract rows.
pub trait TableFetcher {
    async fn fetch(&self, table: &TableSpec) -> Result<DataFrame>;
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Http,
    Payload,
    Roles,
    Validation,
    Write,
    Other,
}

impl From<&DaioeError> for FetchErrorKind {
    fn from(err: &DaioeError) -> Self {
        match err {
            DaioeError::Http(_) => FetchErrorKind::Http,
            DaioeError::Payload(_) | DaioeError::SerdeJSONError(_) => FetchErrorKind::Payload,
            DaioeError::AmbiguousRole { .. } | DaioeError::MissingRole { .. } => {
                FetchErrorKind::Roles
            }
            DaioeError::IOError(_) | DaioeError::Join(_) => FetchErrorKind::Write,
            e if e.is_validation() => FetchErrorKind::Validation,
            _ => FetchErrorKind::Other,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchOutcome {
    Success {
        rows: usize,
        path: PathBuf,
        fetched_at: DateTime<Utc>,
    },
    Failed {
        kind: FetchErrorKind,
        message: String,
    },
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success { .. })
    }
}

/// Outcome per table id.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct FetchSummary(pub BTreeMap<String, FetchOutcome>);

impl FetchSummary {
    pub fn as_flags(&self) -> BTreeMap<String, bool> {
        self.0
            .iter()
            .map(|(id, outcome)| (id.clone(), outcome.is_success()))
            .collect()
    }

    pub fn succeeded(&self) -> usize {
        self.0.values().filter(|o| o.is_success()).count()
    }

    pub fn total(&self) -> usize {
        self.0.len()
    }
}

async fn fetch_and_write<F: TableFetcher>(
    fetcher: &F,
    table: &TableSpec,
    out_dir: &Path,
) -> Result<(usize, PathBuf)> {
    info!("Processing: {}", table.id);
    let mut df = fetcher.fetch(table).await?;
    let rows = df.height();
    let path = out_dir.join(format!("{}.parquet", table.id));
    let path = tokio::task::spawn_blocking(move || write_parquet(&path, &mut df).map(|_| path))
        .await??;
    Ok((rows, path))
}

/// Fetch every table with at most `max_workers` in flight, writing each to
/// `out_dir/<id>.parquet`. A failing table is recorded in the summary and does not stop the
/// others.
pub async fn fetch_all<F: TableFetcher>(
    fetcher: &F,
    tables: Vec<TableSpec>,
    out_dir: &Path,
    max_workers: usize,
) -> FetchSummary {
    let outcomes = stream::iter(tables)
        .map(|table| async move {
            let outcome = match fetch_and_write(fetcher, &table, out_dir).await {
                Ok((rows, path)) => {
                    info!("Saved: {} ({rows} rows)", path.display());
                    FetchOutcome::Success {
                        rows,
                        path,
                        fetched_at: Utc::now(),
                    }
                }
                Err(err) => {
                    error!("FAILED: {} -> {err}", table.id);
                    FetchOutcome::Failed {
                        kind: (&err).into(),
                        message: err.to_string(),
                    }
                }
            };
            (table.id, outcome)
        })
        .buffer_unordered(max_workers.max(1))
        .collect::<Vec<_>>()
        .await;
    let summary = FetchSummary(outcomes.into_iter().collect());
    info!("Success: {}/{}", summary.succeeded(), summary.total());
    summary
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use polars::prelude::*;

    use super::*;

    #[derive(Default)]
    struct FakeFetcher {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl TableFetcher for FakeFetcher {
        async fn fetch(&self, table: &TableSpec) -> Result<DataFrame> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            for _ in 0..5 {
                tokio::task::yield_now().await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match table.path.as_str() {
                "broken" => Err(DaioeError::Payload("no data array".into())),
                "ambiguous" => Err(DaioeError::AmbiguousRole {
                    role: "Occupation".into(),
                    variables: vec!["Yrke".into(), "Yrke2012".into()],
                }),
                _ => Ok(df!(
                    "code" => ["2111", "2112"],
                    "occupation" => ["Physicists", "Meteorologists"],
                    "age" => ["16-24", "16-24"],
                    "sex" => ["men", "women"],
                    "year" => [2024i64, 2024],
                    "count" => [10i64, 20]
                )?),
            }
        }
    }

    fn tables() -> Vec<TableSpec> {
        vec![
            TableSpec::new("ssyk12_14_to_18", "ok/a"),
            TableSpec::new("ssyk12_19_to_21", "broken"),
            TableSpec::new("ssyk12_20_to_23", "ok/b"),
            TableSpec::new("ssyk12_23_to_24", "ambiguous"),
        ]
    }

    #[tokio::test]
    async fn test_failures_are_isolated() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fetcher = FakeFetcher::default();
        let summary = fetch_all(&fetcher, tables(), dir.path(), 2).await;

        assert_eq!(summary.total(), 4);
        assert_eq!(summary.succeeded(), 2);
        let flags = summary.as_flags();
        assert_eq!(flags["ssyk12_14_to_18"], true);
        assert_eq!(flags["ssyk12_19_to_21"], false);
        assert!(dir.path().join("ssyk12_14_to_18.parquet").exists());
        assert!(dir.path().join("ssyk12_20_to_23.parquet").exists());
        assert!(!dir.path().join("ssyk12_19_to_21.parquet").exists());

        match &summary.0["ssyk12_23_to_24"] {
            FetchOutcome::Failed { kind, .. } => assert_eq!(*kind, FetchErrorKind::Roles),
            other => panic!("expected failure, got {other:?}"),
        }
        match &summary.0["ssyk12_14_to_18"] {
            FetchOutcome::Success { rows, .. } => assert_eq!(*rows, 2),
            other => panic!("expected success, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_worker_bound_is_respected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fetcher = FakeFetcher::default();
        let tables = (0..6)
            .map(|i| TableSpec::new(&format!("t{i}"), "ok"))
            .collect();
        let summary = fetch_all(&fetcher, tables, dir.path(), 2).await;
        assert_eq!(summary.succeeded(), 6);
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 2);
        Ok(())
    }

    #[test]
    fn test_tables_from_config() {
        let tables = TableSpec::from_config(&FetchConfig::default());
        assert_eq!(tables.len(), 4);
        assert!(tables
            .iter()
            .any(|t| t.id == "ssyk12_14_to_18" && t.path == "AM/AM0208/AM0208E/YREG51"));
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() -> anyhow::Result<()> {
        let outcome = FetchOutcome::Failed {
            kind: FetchErrorKind::Http,
            message: "timeout".into(),
        };
        let value = serde_json::to_value(&outcome)?;
        assert_eq!(value["status"], "failed");
        assert_eq!(value["kind"], "http");
        Ok(())
    }
}
