use std::sync::Arc;

use bevy::prelude::*;

use crate::catalog::CatalogCompiler;
use crate::events::{emit_upgrade_telemetry, UpgradeEventLog};
use crate::registry::ProgressionRegistry;
use crate::reload::{recompile_catalog, CatalogReloadState, CatalogWatcher};
use crate::settings::UpgradeSettingsHandle;

/// Number of frames the headless app has run.
#[derive(Resource, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProgressionFrame(pub u64);

pub fn advance_frame(mut frame: ResMut<ProgressionFrame>) {
    frame.0 += 1;
}

/// Rebuilds the catalog when the data folder changed or a reload was
/// requested, and swaps it into the registry if its content differs.
pub fn reload_catalog_on_change(
    watcher: Option<Res<CatalogWatcher>>,
    mut state: ResMut<CatalogReloadState>,
    mut compiler: ResMut<CatalogCompiler>,
    mut registry: ResMut<ProgressionRegistry>,
) {
    if let Some(watcher) = watcher {
        let changed = watcher.take_changes();
        if !changed.is_empty() {
            tracing::info!(target: "upgrade::reload", files = changed.len(), "catalog.sources_changed");
            state.dirty = true;
        }
    }
    if !state.dirty {
        return;
    }
    state.dirty = false;
    let Some(folder) = state.folder.clone() else {
        return;
    };

    let report = match recompile_catalog(&mut compiler, &folder, &state.field_names) {
        Ok(report) => report,
        Err(err) => {
            tracing::warn!(target: "upgrade::reload", error = %err, "catalog.reload_failed");
            return;
        }
    };
    state.last_diagnostics = report.diagnostics;
    let fingerprint = report.catalog.fingerprint();
    state.last_fingerprint = fingerprint;
    if fingerprint == registry.catalog().fingerprint() {
        state.skipped_unchanged += 1;
        tracing::debug!(target: "upgrade::reload", fingerprint, "catalog.reload_unchanged");
        return;
    }
    registry.replace_catalog(Arc::new(report.catalog));
    state.reloads += 1;
}

pub fn advance_upgrade_timers(
    settings: Res<UpgradeSettingsHandle>,
    mut registry: ResMut<ProgressionRegistry>,
) {
    let completed = registry.advance_timers(settings.config().frame_seconds());
    if completed > 0 {
        tracing::debug!(target: "upgrade::registry", completed, "upgrade.timers_completed");
    }
}

/// Drains registry notifications into the event log and the telemetry stream.
pub fn publish_upgrade_events(
    frame: Res<ProgressionFrame>,
    mut registry: ResMut<ProgressionRegistry>,
    mut log: ResMut<UpgradeEventLog>,
) {
    let events = registry.drain_events();
    if events.is_empty() {
        return;
    }
    emit_upgrade_telemetry(frame.0, &events);
    log.record(events);
}
