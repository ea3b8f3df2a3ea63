#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Once};

use progression_core::{ResourceAmounts, UpgradeSettings};

static INIT: Once = Once::new();

pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

pub fn catalog_dir() -> PathBuf {
    fixtures_dir().join("catalog")
}

pub fn broken_catalog_dir() -> PathBuf {
    fixtures_dir().join("catalog_broken")
}

/// Points `UPGRADE_SETTINGS_PATH` at the fixture settings file.
pub fn ensure_test_settings() -> PathBuf {
    let settings_path = fixtures_dir().join("test_upgrade_settings.json");
    INIT.call_once(|| {
        debug_assert!(
            settings_path.exists(),
            "missing test upgrade settings at {}",
            settings_path.display()
        );
        std::env::set_var("UPGRADE_SETTINGS_PATH", &settings_path);
    });
    settings_path
}

/// Fixture settings with the data folder resolved to an absolute path.
pub fn fixture_settings() -> Arc<UpgradeSettings> {
    let settings = UpgradeSettings::from_file(&fixtures_dir().join("test_upgrade_settings.json"))
        .expect("fixture settings parse")
        .with_data_folder(catalog_dir());
    Arc::new(settings)
}

pub fn amounts(entries: &[(&str, i64)]) -> ResourceAmounts {
    entries
        .iter()
        .map(|(name, amount)| (name.to_string(), *amount))
        .collect()
}
