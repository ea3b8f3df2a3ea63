//! Tiered upgrade progression for game entities.
//!
//! The [`CatalogCompiler`] turns per-path level overrides and scaling
//! segments into gap-free [`UpgradeCatalog`]s; the [`ProgressionRegistry`]
//! tracks entity levels and drives upgrade timers against that catalog.
//! [`build_headless_app`] wires both into a Bevy app advanced by [`run_frame`].

pub mod catalog;
pub mod diagnostics;
mod events;
pub mod hashing;
pub mod ledger;
pub mod merge;
pub mod metrics;
pub mod records;
mod registry;
pub mod reload;
mod resource_types;
pub mod scaling;
pub mod scheduler;
pub mod settings;
mod snapshot;
pub mod sources;
mod systems;

use std::sync::Arc;

use bevy::prelude::*;

pub use catalog::{CatalogCompiler, CompileReport, LevelRequirement, PathCatalog, UpgradeCatalog};
pub use diagnostics::{CompileDiagnostic, DiagnosticCode, DiagnosticSeverity};
pub use events::{emit_upgrade_telemetry, UpgradeEvent, UpgradeEventLog};
pub use ledger::{InMemoryLedger, LedgerError, ResourceAmounts, ResourceCosts, ResourceLedger};
pub use merge::{can_merge, check_merge, handle_merge, MergeMode, MergeOutcome, MergeRejection};
pub use metrics::ProgressionMetrics;
pub use records::{LevelOverride, RawPathRecord, SourceRecord};
pub use registry::{
    EntityId, OwnerHandle, PendingUpgrade, ProgressionRegistry, Registration, RegistryCounters,
    TimerAdjustment, TrackedEntity, UpgradableAspect, UpgradableCategory, UpgradeQuote,
    UpgradeRejection,
};
pub use reload::{recompile_catalog, CatalogReloadState, CatalogWatcher, WatchError};
pub use resource_types::{ResourceIndex, ResourceTypeTable};
pub use scaling::{
    CustomScalingContext, CustomScalingRegistry, RawSegment, ScalingMode, ScalingSegment,
    SeriesTarget,
};
pub use scheduler::{FiredTimer, TickScheduler, TimerToken, UpgradeScheduler};
pub use settings::{
    load_upgrade_settings_from_env, FieldNames, SettingsError, UpgradeSettings,
    UpgradeSettingsHandle, UpgradeSettingsMetadata,
};
pub use snapshot::SnapshotError;
pub use sources::{load_source_file, parse_source_str, scan_data_folder, LoadedSource, SourceLoadError};
pub use systems::ProgressionFrame;

/// Construct a Bevy [`App`] using settings from `UPGRADE_SETTINGS_PATH` or the builtin defaults.
pub fn build_headless_app() -> App {
    let (settings, metadata) = load_upgrade_settings_from_env();
    let mut app = build_headless_app_with_settings(settings);
    app.insert_resource(metadata);
    app
}

/// Construct a Bevy [`App`] with the upgrade frame pipeline.
///
/// The catalog is compiled from the settings' data folder once at build time;
/// a missing folder yields an empty catalog. When `watch_data_folder` is set,
/// file changes trigger a rebuild at the start of the next frame.
pub fn build_headless_app_with_settings(settings: Arc<UpgradeSettings>) -> App {
    let mut app = App::new();

    let mut compiler = CatalogCompiler::new();
    let mut reload_state = CatalogReloadState::new(
        Some(settings.data_folder().to_path_buf()),
        settings.field_names().clone(),
    );
    let catalog = match recompile_catalog(&mut compiler, settings.data_folder(), settings.field_names()) {
        Ok(report) => {
            reload_state.last_fingerprint = report.catalog.fingerprint();
            reload_state.last_diagnostics = report.diagnostics;
            Arc::new(report.catalog)
        }
        Err(err) => {
            tracing::warn!(
                target: "upgrade::catalog",
                error = %err,
                "upgrade_catalog.initial_load_failed"
            );
            UpgradeCatalog::empty()
        }
    };

    if settings.watch_data_folder() {
        match CatalogWatcher::watch(settings.data_folder()) {
            Ok(watcher) => {
                app.insert_resource(watcher);
            }
            Err(err) => tracing::warn!(target: "upgrade::reload", error = %err, "watcher.unavailable"),
        }
    }

    app.insert_resource(UpgradeEventLog::with_capacity(settings.event_log_capacity()))
        .insert_resource(UpgradeSettingsHandle::new(settings))
        .insert_resource(ProgressionRegistry::new(catalog))
        .insert_resource(compiler)
        .insert_resource(reload_state)
        .insert_resource(ProgressionFrame::default())
        .insert_resource(ProgressionMetrics::default())
        .add_plugins(MinimalPlugins)
        .add_systems(
            Update,
            (
                systems::advance_frame,
                systems::reload_catalog_on_change,
                systems::advance_upgrade_timers,
                systems::publish_upgrade_events,
                metrics::collect_progression_metrics,
            )
                .chain(),
        );

    app
}

/// Execute a single frame.
///
/// Runs the chained systems configured in [`build_headless_app_with_settings`]
/// (frame counter → catalog reload → timers → events → metrics).
pub fn run_frame(app: &mut App) {
    app.update();
}
