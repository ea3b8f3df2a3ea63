mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use progression_core::{
    build_headless_app_with_settings, run_frame, CatalogReloadState, ProgressionMetrics,
    ProgressionRegistry, UpgradeSettings,
};
use serde_json::{json, Value};

fn copy_catalog(from: &Path, to: &Path) -> Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&target)?;
            copy_catalog(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

fn raise_barracks_costs(folder: &Path) -> Result<()> {
    let file = folder.join("barracks.json");
    let mut record: Value = serde_json::from_str(&fs::read_to_string(&file)?)?;
    record["CostScalingSegments"]["stone"] = json!({
        "ScalingSegments": [
            { "StartLevel": 1, "EndLevel": 5, "ScalingMode": "Constant", "ConstantCost": 25 }
        ]
    });
    fs::write(&file, serde_json::to_string_pretty(&record)?)?;
    Ok(())
}

#[test]
fn reload_swaps_catalog_without_touching_running_upgrades() -> Result<()> {
    let data = tempfile::tempdir()?;
    copy_catalog(&common::catalog_dir(), data.path())?;
    let settings = UpgradeSettings::default()
        .with_data_folder(data.path())
        .with_frame_seconds(1.0);
    let mut app = build_headless_app_with_settings(Arc::new(settings));
    let resources = common::amounts(&[("wood", 1_000), ("stone", 1_000)]);

    let (running, idle) = {
        let mut registry = app.world.resource_mut::<ProgressionRegistry>();
        let running = registry.register("barracks", 1);
        let idle = registry.register("barracks", 1);
        assert!(registry.request_upgrade(running, 1, &resources));
        (running, idle)
    };
    run_frame(&mut app);
    let before = app.world.resource::<ProgressionRegistry>().catalog().fingerprint();

    raise_barracks_costs(data.path())?;
    app.world.resource_mut::<CatalogReloadState>().mark_dirty();
    run_frame(&mut app);

    let state = app.world.resource::<CatalogReloadState>();
    assert_eq!(state.reloads, 1);
    assert!(state.last_diagnostics.is_empty());

    let registry = app.world.resource::<ProgressionRegistry>();
    assert_ne!(registry.catalog().fingerprint(), before);
    assert_eq!(
        registry.in_progress_cost(running).and_then(|costs| costs.get("stone")),
        Some(&10)
    );
    assert_eq!(
        registry
            .get_next_level_cost(idle)
            .and_then(|costs| costs.get("stone").copied()),
        Some(25)
    );
    assert_eq!(registry.upgrade_time_remaining(running), Some(18.0));
    assert_eq!(
        app.world.resource::<ProgressionMetrics>().catalog_fingerprint,
        registry.catalog().fingerprint()
    );
    Ok(())
}

#[test]
fn unchanged_sources_do_not_replace_the_catalog() -> Result<()> {
    let data = tempfile::tempdir()?;
    copy_catalog(&common::catalog_dir(), data.path())?;
    let settings = UpgradeSettings::default().with_data_folder(data.path());
    let mut app = build_headless_app_with_settings(Arc::new(settings));
    let before = Arc::clone(app.world.resource::<ProgressionRegistry>().catalog());

    app.world.resource_mut::<CatalogReloadState>().mark_dirty();
    run_frame(&mut app);

    let state = app.world.resource::<CatalogReloadState>();
    assert_eq!(state.reloads, 0);
    assert_eq!(state.skipped_unchanged, 1);
    let after = app.world.resource::<ProgressionRegistry>().catalog();
    assert!(Arc::ptr_eq(&before, after));
    Ok(())
}

#[test]
fn missing_folder_starts_with_an_empty_catalog() {
    let missing = common::fixtures_dir().join("does_not_exist");
    let settings = UpgradeSettings::default().with_data_folder(missing);
    let mut app = build_headless_app_with_settings(Arc::new(settings));
    run_frame(&mut app);

    let registry = app.world.resource::<ProgressionRegistry>();
    assert!(registry.catalog().is_empty());
    assert_eq!(app.world.resource::<ProgressionMetrics>().catalog_paths, 0);
}
