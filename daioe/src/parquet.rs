//! Reading and writing the columnar files exchanged between stages.

use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use itertools::Itertools;
use log::{debug, info};
use polars::prelude::*;

use crate::error::{DaioeError, Result};

/// Lazily scan a parquet file, failing with the expected path if it does not exist.
pub fn scan_parquet<P: AsRef<Path>>(path: P) -> Result<LazyFrame> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(DaioeError::MissingInput(path.to_path_buf()));
    }
    debug!("Scanning parquet {}", path.display());
    Ok(LazyFrame::scan_parquet(path, ScanArgsParquet::default())?)
}

pub fn read_parquet<P: AsRef<Path>>(path: P) -> Result<DataFrame> {
    Ok(scan_parquet(path)?.collect()?)
}

/// Write `df` as zstd-compressed parquet, creating parent directories as needed. The file is
/// written beside the target and renamed into place, so an existing output is only replaced by a
/// complete one.
pub fn write_parquet<P: AsRef<Path>>(path: P, df: &mut DataFrame) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let partial = path.with_extension("parquet.partial");
    let written = File::create(&partial).map_err(DaioeError::from).and_then(|file| {
        ParquetWriter::new(file)
            .with_compression(ParquetCompression::Zstd(None))
            .finish(df)
            .map_err(DaioeError::from)
    });
    if let Err(err) = written {
        let _ = std::fs::remove_file(&partial);
        return Err(err);
    }
    std::fs::rename(&partial, path)?;
    info!("Wrote {} rows to {}", df.height(), path.display());
    Ok(())
}

/// Scan a CSV with every column read as a string. Callers cast what they need, so codes with
/// leading zeros survive.
pub fn scan_csv_as_strings<P: AsRef<Path>>(path: P) -> Result<LazyFrame> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(DaioeError::MissingInput(path.to_path_buf()));
    }
    Ok(LazyCsvReader::new(path)
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .finish()?)
}

/// Same as `scan_csv_as_strings` for an in-memory CSV body.
pub fn read_csv_bytes_as_strings(bytes: Vec<u8>) -> Result<DataFrame> {
    Ok(CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .into_reader_with_file_handle(Cursor::new(bytes))
        .finish()?)
}

/// Column names of a lazy frame. Resolves the schema only; no data is read.
pub fn column_names(lf: &LazyFrame) -> Result<Vec<String>> {
    let mut lf = lf.clone();
    let schema = lf.schema()?;
    Ok(schema.iter_names().map(|name| name.to_string()).collect())
}

/// Fails with `MissingColumns` listing every required column absent from `columns`.
pub fn require_columns(columns: &[String], required: &[&str], table: &str) -> Result<()> {
    let missing = required
        .iter()
        .filter(|req| !columns.iter().any(|c| c == *req))
        .map(|req| req.to_string())
        .sorted()
        .collect_vec();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(DaioeError::MissingColumns {
            table: table.to_string(),
            missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use polars::df;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_parquet_write_then_scan() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("nested").join("table.parquet");
        let mut df = df!("code" => &["0110", "2111"], "count" => &[3i64, 4])?;
        write_parquet(&path, &mut df)?;
        let read = read_parquet(&path)?;
        assert_eq!(read, df);
        assert!(!path.with_extension("parquet.partial").exists());
        Ok(())
    }

    #[test]
    fn test_missing_parquet_reports_path() {
        match scan_parquet("/definitely/not/here.parquet") {
            Err(DaioeError::MissingInput(path)) => {
                assert_eq!(path, Path::new("/definitely/not/here.parquet"))
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("missing file should fail"),
        }
    }

    #[test]
    fn test_csv_keeps_leading_zeros() -> anyhow::Result<()> {
        let df = read_csv_bytes_as_strings(b"code,name\n0110,Officers\n2111,Physicists\n".to_vec())?;
        let codes: Vec<&str> = df.column("code")?.str()?.into_no_null_iter().collect();
        assert_eq!(codes, vec!["0110", "2111"]);
        Ok(())
    }

    #[test]
    fn test_require_columns() {
        let columns = vec!["code".to_string(), "year".to_string()];
        assert!(require_columns(&columns, &["code", "year"], "t").is_ok());
        match require_columns(&columns, &["year", "sex", "count"], "raw") {
            Err(DaioeError::MissingColumns { table, missing }) => {
                assert_eq!(table, "raw");
                assert_eq!(missing, vec!["count".to_string(), "sex".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
