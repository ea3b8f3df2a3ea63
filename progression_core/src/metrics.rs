use bevy::prelude::*;

use crate::registry::ProgressionRegistry;
use crate::systems::ProgressionFrame;

#[derive(Resource, Default, Debug, Clone, PartialEq)]
pub struct ProgressionMetrics {
    pub frame: u64,
    pub live_entities: usize,
    pub upgrading: usize,
    pub free_slots: usize,
    pub started: u64,
    pub completed: u64,
    pub canceled: u64,
    pub rejected: u64,
    pub catalog_paths: usize,
    pub catalog_fingerprint: u64,
}

pub fn collect_progression_metrics(
    frame: Res<ProgressionFrame>,
    registry: Res<ProgressionRegistry>,
    mut metrics: ResMut<ProgressionMetrics>,
) {
    let counters = registry.counters();
    metrics.frame = frame.0;
    metrics.live_entities = registry.live_count();
    metrics.upgrading = registry.upgrading_count();
    metrics.free_slots = registry.free_slot_count();
    metrics.started = counters.started;
    metrics.completed = counters.completed + counters.immediate;
    metrics.canceled = counters.canceled;
    metrics.rejected = counters.rejected;
    metrics.catalog_paths = registry.catalog().len();
    metrics.catalog_fingerprint = registry.catalog().fingerprint();
}
