//! Serializable contract types for the upgrade progression runtime.
//!
//! The registry itself lives in `progression_core`; this crate only carries
//! the plain data a host needs to persist or ship registry state.

use ahash::RandomState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{BuildHasher, Hasher};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SnapshotHeader {
    pub slot_count: u32,
    pub entity_count: u32,
    pub pending_count: u32,
    pub catalog_fingerprint: u64,
    pub hash: u64,
}

impl SnapshotHeader {
    pub fn new(
        slot_count: usize,
        entity_count: usize,
        pending_count: usize,
        catalog_fingerprint: u64,
    ) -> Self {
        Self {
            slot_count: slot_count as u32,
            entity_count: entity_count as u32,
            pending_count: pending_count as u32,
            catalog_fingerprint,
            hash: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedEntityState {
    pub index: u32,
    pub generation: u32,
    pub path_id: String,
    pub level: u32,
    pub category: u8,
    pub aspect: u8,
    pub owner: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingUpgradeState {
    pub index: u32,
    pub requested_level_increase: u32,
    pub total_seconds: f32,
    pub remaining_seconds: f32,
    pub resource_costs: BTreeMap<String, i64>,
}

/// Full registry state: slot generations, the free-slot stack and every
/// live entity with its in-flight upgrade, if any.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RegistrySnapshot {
    pub header: SnapshotHeader,
    pub slot_generations: Vec<u32>,
    pub free_slots: Vec<u32>,
    pub entities: Vec<TrackedEntityState>,
    pub pending: Vec<PendingUpgradeState>,
}

impl RegistrySnapshot {
    pub fn finalize(mut self) -> Self {
        let hash = hash_snapshot(&self);
        self.header.hash = hash;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UpgradeEventKind {
    LevelChanged = 0,
    UpgradeStarted = 1,
    UpgradeCanceled = 2,
    UpgradeTimeChanged = 3,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpgradeEventState {
    pub kind: UpgradeEventKind,
    pub entity_index: u32,
    pub entity_generation: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_level: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_level: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds: Option<f32>,
}

/// Telemetry frame emitted once per drained event batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpgradeTelemetryFrame {
    pub frame: u64,
    pub events: Vec<UpgradeEventState>,
}

pub const UPGRADE_TELEMETRY_TOPIC: &str = "upgrade.telemetry";

#[derive(Debug, thiserror::Error)]
pub enum SnapshotCodecError {
    #[error("failed to encode registry snapshot: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode registry snapshot: {0}")]
    Decode(#[source] bincode::Error),
    #[error("registry snapshot hash mismatch (header {expected:#x}, computed {actual:#x})")]
    HashMismatch { expected: u64, actual: u64 },
}

pub fn hash_snapshot(snapshot: &RegistrySnapshot) -> u64 {
    let mut clone = snapshot.clone();
    clone.header.hash = 0;
    let encoded = bincode::serialize(&clone).expect("snapshot serialization for hashing");
    let mut hasher = RandomState::with_seeds(0, 0, 0, 0).build_hasher();
    hasher.write(&encoded);
    hasher.finish()
}

pub fn encode_snapshot(snapshot: &RegistrySnapshot) -> Result<Vec<u8>, SnapshotCodecError> {
    bincode::serialize(snapshot).map_err(SnapshotCodecError::Encode)
}

/// Decodes a snapshot and verifies the header hash when one was recorded.
pub fn decode_snapshot(bytes: &[u8]) -> Result<RegistrySnapshot, SnapshotCodecError> {
    let snapshot: RegistrySnapshot =
        bincode::deserialize(bytes).map_err(SnapshotCodecError::Decode)?;
    if snapshot.header.hash != 0 {
        let actual = hash_snapshot(&snapshot);
        if actual != snapshot.header.hash {
            return Err(SnapshotCodecError::HashMismatch {
                expected: snapshot.header.hash,
                actual,
            });
        }
    }
    Ok(snapshot)
}
