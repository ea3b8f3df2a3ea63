use std::{
    env, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use bevy::prelude::Resource;
use serde::Deserialize;
use thiserror::Error;

pub const BUILTIN_UPGRADE_SETTINGS: &str = include_str!("data/upgrade_settings.json");

/// Key names used by the simple (flat per-level) data-source shape.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FieldNames {
    pub upgrade_path: String,
    pub levels: String,
    pub resources: String,
    pub resource_type: String,
    pub resource_amount: String,
    pub upgrade_seconds: String,
    pub upgrade_locked: String,
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            upgrade_path: "UpgradePath".into(),
            levels: "Levels".into(),
            resources: "Resources".into(),
            resource_type: "Type".into(),
            resource_amount: "Amount".into(),
            upgrade_seconds: "UpgradeSeconds".into(),
            upgrade_locked: "UpgradeLocked".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpgradeSettings {
    data_folder: PathBuf,
    field_names: FieldNames,
    frame_seconds: f32,
    event_log_capacity: usize,
    watch_data_folder: bool,
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            data_folder: PathBuf::from("data/upgrades"),
            field_names: FieldNames::default(),
            frame_seconds: 1.0,
            event_log_capacity: 128,
            watch_data_folder: false,
        }
    }
}

impl UpgradeSettings {
    pub fn builtin() -> Arc<Self> {
        Arc::new(
            Self::from_json_str(BUILTIN_UPGRADE_SETTINGS)
                .expect("builtin upgrade settings should parse"),
        )
    }

    pub fn from_json_str(json: &str) -> Result<Self, SettingsError> {
        let mut settings: UpgradeSettings = serde_json::from_str(json)?;
        settings.normalize();
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn data_folder(&self) -> &Path {
        &self.data_folder
    }

    pub fn field_names(&self) -> &FieldNames {
        &self.field_names
    }

    pub fn frame_seconds(&self) -> f32 {
        self.frame_seconds
    }

    pub fn event_log_capacity(&self) -> usize {
        self.event_log_capacity
    }

    pub fn watch_data_folder(&self) -> bool {
        self.watch_data_folder
    }

    pub fn with_data_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.data_folder = folder.into();
        self
    }

    pub fn with_frame_seconds(mut self, seconds: f32) -> Self {
        self.frame_seconds = seconds;
        self.normalize();
        self
    }

    pub fn with_watch_data_folder(mut self, watch: bool) -> Self {
        self.watch_data_folder = watch;
        self
    }

    fn normalize(&mut self) {
        if !self.frame_seconds.is_finite() || self.frame_seconds < 0.0 {
            self.frame_seconds = 0.0;
        }
        self.event_log_capacity = self.event_log_capacity.max(1);
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to parse upgrade settings: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read upgrade settings from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Resource, Debug, Clone)]
pub struct UpgradeSettingsHandle(pub Arc<UpgradeSettings>);

impl UpgradeSettingsHandle {
    pub fn new(settings: Arc<UpgradeSettings>) -> Self {
        Self(settings)
    }

    pub fn config(&self) -> &UpgradeSettings {
        &self.0
    }

    pub fn get(&self) -> Arc<UpgradeSettings> {
        Arc::clone(&self.0)
    }

    pub fn replace_from_json(&mut self, json: &str) -> Result<Arc<UpgradeSettings>, SettingsError> {
        let parsed = UpgradeSettings::from_json_str(json)?;
        let shared = Arc::new(parsed);
        self.0 = Arc::clone(&shared);
        Ok(shared)
    }
}

#[derive(Resource, Debug, Clone)]
pub struct UpgradeSettingsMetadata {
    path: Option<PathBuf>,
}

impl UpgradeSettingsMetadata {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }
}

/// Loads settings from `UPGRADE_SETTINGS_PATH`, falling back to the builtin
/// defaults when the variable is unset or the file cannot be used.
pub fn load_upgrade_settings_from_env() -> (Arc<UpgradeSettings>, UpgradeSettingsMetadata) {
    let Some(path) = env::var("UPGRADE_SETTINGS_PATH").ok().map(PathBuf::from) else {
        tracing::info!(target: "upgrade::config", "upgrade_settings.loaded=builtin");
        return (UpgradeSettings::builtin(), UpgradeSettingsMetadata::new(None));
    };

    match UpgradeSettings::from_file(&path) {
        Ok(settings) => {
            tracing::info!(
                target: "upgrade::config",
                path = %path.display(),
                "upgrade_settings.loaded=file"
            );
            (Arc::new(settings), UpgradeSettingsMetadata::new(Some(path)))
        }
        Err(err) => {
            tracing::warn!(
                target: "upgrade::config",
                path = %path.display(),
                error = %err,
                "upgrade_settings.load_failed"
            );
            tracing::info!(target: "upgrade::config", "upgrade_settings.loaded=builtin");
            (UpgradeSettings::builtin(), UpgradeSettingsMetadata::new(None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_settings_use_default_field_names() {
        let settings = UpgradeSettings::builtin();
        assert_eq!(settings.field_names(), &FieldNames::default());
        assert_eq!(settings.frame_seconds(), 1.0);
        assert_eq!(settings.event_log_capacity(), 128);
        assert!(!settings.watch_data_folder());
    }

    #[test]
    fn partial_field_names_keep_defaults() {
        let settings = UpgradeSettings::from_json_str(
            r#"{"field_names": {"levels": "Tiers", "resource_amount": "Qty"}, "frame_seconds": -3}"#,
        )
        .expect("settings parse");
        assert_eq!(settings.field_names().levels, "Tiers");
        assert_eq!(settings.field_names().resource_amount, "Qty");
        assert_eq!(settings.field_names().upgrade_path, "UpgradePath");
        assert_eq!(settings.frame_seconds(), 0.0);
    }

    #[test]
    fn handle_replaces_shared_settings() {
        let mut handle = UpgradeSettingsHandle::new(UpgradeSettings::builtin());
        let before = handle.get();
        handle
            .replace_from_json(r#"{"frame_seconds": 0.5}"#)
            .expect("replacement parses");
        assert_eq!(before.frame_seconds(), 1.0);
        assert_eq!(handle.config().frame_seconds(), 0.5);
    }
}
