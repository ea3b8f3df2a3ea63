use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use bevy::prelude::Resource;
use crossbeam_channel::{unbounded, Receiver};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;

use crate::catalog::{CatalogCompiler, CompileReport};
use crate::diagnostics::CompileDiagnostic;
use crate::settings::FieldNames;
use crate::sources::{scan_data_folder, SourceLoadError};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to watch upgrade data folder {path:?}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Filesystem watcher over the upgrade data folder. Change notifications are
/// forwarded through a channel and drained by the reload system.
#[derive(Resource)]
pub struct CatalogWatcher {
    _watcher: Mutex<RecommendedWatcher>,
    receiver: Receiver<PathBuf>,
    folder: PathBuf,
}

impl CatalogWatcher {
    pub fn watch(folder: &Path) -> Result<Self, WatchError> {
        let (sender, receiver) = unbounded();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for path in event.paths {
                    let _ = sender.send(path);
                }
            }
            Err(err) => tracing::warn!(target: "upgrade::reload", error = %err, "watcher.error"),
        })
        .map_err(|source| WatchError::Watch {
            path: folder.to_path_buf(),
            source,
        })?;
        watcher
            .watch(folder, RecursiveMode::Recursive)
            .map_err(|source| WatchError::Watch {
                path: folder.to_path_buf(),
                source,
            })?;
        tracing::info!(target: "upgrade::reload", folder = %folder.display(), "watcher.started");
        Ok(Self {
            _watcher: Mutex::new(watcher),
            receiver,
            folder: folder.to_path_buf(),
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Drains queued notifications and returns the distinct JSON files touched.
    pub fn take_changes(&self) -> Vec<PathBuf> {
        let mut changed: Vec<PathBuf> = self
            .receiver
            .try_iter()
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
            })
            .collect();
        changed.sort();
        changed.dedup();
        changed
    }
}

/// Where the catalog comes from and what the last rebuild reported.
#[derive(Resource, Debug, Clone, Default)]
pub struct CatalogReloadState {
    pub folder: Option<PathBuf>,
    pub field_names: FieldNames,
    pub dirty: bool,
    pub reloads: u64,
    pub skipped_unchanged: u64,
    pub last_fingerprint: u64,
    pub last_diagnostics: Vec<CompileDiagnostic>,
}

impl CatalogReloadState {
    pub fn new(folder: Option<PathBuf>, field_names: FieldNames) -> Self {
        Self {
            folder,
            field_names,
            ..Default::default()
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

/// Scans `folder` and compiles everything found into a fresh catalog.
pub fn recompile_catalog(
    compiler: &mut CatalogCompiler,
    folder: &Path,
    field_names: &FieldNames,
) -> Result<CompileReport, SourceLoadError> {
    let sources = scan_data_folder(folder, field_names)?;
    Ok(compiler.compile_sources(sources))
}
