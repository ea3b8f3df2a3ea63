//! Reads data-source files and detects which record shape each one uses.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde_json::Value;
use thiserror::Error;

use crate::diagnostics::{CompileDiagnostic, DiagnosticCode, DiagnosticSink};
use crate::records::{
    parse_simple_record, parse_table_rows, RawPathRecord, ScalingPathRecord, SourceRecord,
};
use crate::settings::FieldNames;

#[derive(Debug, Error)]
pub enum SourceLoadError {
    #[error("failed to read upgrade data from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to list upgrade data folder {path:?}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Records parsed from one data source, plus whatever went wrong reading it.
#[derive(Debug, Clone, Default)]
pub struct LoadedSource {
    pub origin: String,
    pub records: Vec<SourceRecord>,
    pub diagnostics: Vec<CompileDiagnostic>,
}

impl LoadedSource {
    /// Normalizes every record; conversion diagnostics are appended.
    pub fn into_raw(self) -> (Vec<RawPathRecord>, Vec<CompileDiagnostic>) {
        let LoadedSource {
            origin,
            records,
            mut diagnostics,
        } = self;
        let mut raw = Vec::with_capacity(records.len());
        for record in records {
            let (converted, notes) = record.into_raw(&origin);
            diagnostics.extend(notes);
            raw.extend(converted);
        }
        (raw, diagnostics)
    }
}

/// Parses one JSON document. Never fails: unreadable content becomes a
/// diagnostic and an empty record list.
pub fn parse_source_str(json: &str, origin: &str, names: &FieldNames) -> LoadedSource {
    let mut sink = DiagnosticSink::default();
    let stem = origin_stem(origin);
    let records = match serde_json::from_str::<Value>(json) {
        Ok(root) => detect_records(root, &stem, origin, names, &mut sink),
        Err(err) => {
            sink.push(CompileDiagnostic::new(
                DiagnosticCode::SourceUnreadable,
                origin,
                None,
                format!("invalid JSON: {err}"),
            ));
            Vec::new()
        }
    };
    LoadedSource {
        origin: origin.to_string(),
        records,
        diagnostics: sink.into_inner(),
    }
}

pub fn load_source_file(path: &Path, names: &FieldNames) -> Result<LoadedSource, SourceLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| SourceLoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_source_str(&contents, &path.display().to_string(), names))
}

/// Loads every `*.json` file below `folder`, in sorted path order. Files that
/// cannot be read are reported as diagnostics rather than aborting the scan.
pub fn scan_data_folder(folder: &Path, names: &FieldNames) -> Result<Vec<LoadedSource>, SourceLoadError> {
    let mut files = Vec::new();
    collect_json_files(folder, &mut files)?;
    files.sort();

    let mut sources = Vec::with_capacity(files.len());
    for file in files {
        match load_source_file(&file, names) {
            Ok(source) => sources.push(source),
            Err(err) => {
                let origin = file.display().to_string();
                let mut sink = DiagnosticSink::default();
                sink.push(CompileDiagnostic::new(
                    DiagnosticCode::SourceUnreadable,
                    &origin,
                    None,
                    err.to_string(),
                ));
                sources.push(LoadedSource {
                    origin,
                    records: Vec::new(),
                    diagnostics: sink.into_inner(),
                });
            }
        }
    }
    tracing::info!(
        target: "upgrade::catalog",
        folder = %folder.display(),
        files = sources.len(),
        "upgrade_sources.scanned"
    );
    Ok(sources)
}

fn collect_json_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), SourceLoadError> {
    let entries = fs::read_dir(dir).map_err(|source| SourceLoadError::Scan {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| SourceLoadError::Scan {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            collect_json_files(&path, out)?;
        } else if path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
        {
            out.push(path);
        }
    }
    Ok(())
}

fn origin_stem(origin: &str) -> String {
    Path::new(origin)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(origin)
        .to_string()
}

fn is_scaling_shape(value: &Value) -> bool {
    value.get("LevelOverrides").is_some()
}

fn is_table_rows(rows: &[Value]) -> bool {
    !rows.is_empty()
        && rows
            .iter()
            .all(|row| row.get("UpgradeResourceCosts").is_some() && !is_scaling_shape(row))
}

fn detect_records(
    root: Value,
    stem: &str,
    origin: &str,
    names: &FieldNames,
    sink: &mut DiagnosticSink,
) -> Vec<SourceRecord> {
    match root {
        Value::Array(rows) if is_table_rows(&rows) => {
            let (record, notes) = parse_table_rows(&rows, stem, origin);
            sink.extend(notes);
            vec![SourceRecord::TableRows(record)]
        }
        Value::Array(entries) => entries
            .iter()
            .enumerate()
            .filter_map(|(position, entry)| {
                let fallback = format!("{stem}#{position}");
                read_single(entry, &fallback, origin, names, sink)
            })
            .collect(),
        single @ Value::Object(_) => read_single(&single, stem, origin, names, sink)
            .into_iter()
            .collect(),
        _ => {
            sink.push(CompileDiagnostic::new(
                DiagnosticCode::UnsupportedShape,
                origin,
                None,
                "root must be an object or an array",
            ));
            Vec::new()
        }
    }
}

fn read_single(
    value: &Value,
    fallback_path_id: &str,
    origin: &str,
    names: &FieldNames,
    sink: &mut DiagnosticSink,
) -> Option<SourceRecord> {
    if is_scaling_shape(value) {
        return match serde_json::from_value::<ScalingPathRecord>(value.clone()) {
            Ok(record) => {
                let path_id = record
                    .path_id
                    .clone()
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(|| fallback_path_id.to_string());
                Some(SourceRecord::Scaling { path_id, record })
            }
            Err(err) => {
                sink.push(CompileDiagnostic::new(
                    DiagnosticCode::UnsupportedShape,
                    origin,
                    Some(fallback_path_id),
                    format!("scaling record skipped: {err}"),
                ));
                None
            }
        };
    }

    match parse_simple_record(value, fallback_path_id, names, origin) {
        Ok((record, notes)) => {
            sink.extend(notes);
            Some(SourceRecord::Simple(record))
        }
        Err(reason) => {
            sink.push(CompileDiagnostic::new(
                DiagnosticCode::UnsupportedShape,
                origin,
                Some(fallback_path_id),
                format!("record skipped: {reason}"),
            ));
            None
        }
    }
}
