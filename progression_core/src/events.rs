use std::collections::VecDeque;

use bevy::prelude::Resource;
use log::debug;
use progression_schema::{
    UpgradeEventKind, UpgradeEventState, UpgradeTelemetryFrame, UPGRADE_TELEMETRY_TOPIC,
};

use crate::registry::EntityId;

/// Outbound notification queued by the registry, in operation order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpgradeEvent {
    LevelChanged {
        entity: EntityId,
        old_level: u32,
        new_level: u32,
    },
    UpgradeStarted {
        entity: EntityId,
        total_seconds: f32,
    },
    UpgradeCanceled {
        entity: EntityId,
        current_level: u32,
    },
    UpgradeTimeChanged {
        entity: EntityId,
        delta_seconds: f32,
    },
}

impl UpgradeEvent {
    pub fn entity(&self) -> EntityId {
        match self {
            UpgradeEvent::LevelChanged { entity, .. }
            | UpgradeEvent::UpgradeStarted { entity, .. }
            | UpgradeEvent::UpgradeCanceled { entity, .. }
            | UpgradeEvent::UpgradeTimeChanged { entity, .. } => *entity,
        }
    }

    pub fn kind(&self) -> UpgradeEventKind {
        match self {
            UpgradeEvent::LevelChanged { .. } => UpgradeEventKind::LevelChanged,
            UpgradeEvent::UpgradeStarted { .. } => UpgradeEventKind::UpgradeStarted,
            UpgradeEvent::UpgradeCanceled { .. } => UpgradeEventKind::UpgradeCanceled,
            UpgradeEvent::UpgradeTimeChanged { .. } => UpgradeEventKind::UpgradeTimeChanged,
        }
    }

    pub fn to_state(&self) -> UpgradeEventState {
        let entity = self.entity();
        let mut state = UpgradeEventState {
            kind: self.kind(),
            entity_index: entity.index(),
            entity_generation: entity.generation(),
            old_level: None,
            new_level: None,
            seconds: None,
        };
        match *self {
            UpgradeEvent::LevelChanged {
                old_level,
                new_level,
                ..
            } => {
                state.old_level = Some(old_level);
                state.new_level = Some(new_level);
            }
            UpgradeEvent::UpgradeStarted { total_seconds, .. } => {
                state.seconds = Some(total_seconds);
            }
            UpgradeEvent::UpgradeCanceled { current_level, .. } => {
                state.new_level = Some(current_level);
            }
            UpgradeEvent::UpgradeTimeChanged { delta_seconds, .. } => {
                state.seconds = Some(delta_seconds);
            }
        }
        state
    }
}

/// Bounded history of drained events for hosts that poll instead of observing.
#[derive(Resource, Debug, Clone)]
pub struct UpgradeEventLog {
    capacity: usize,
    events: VecDeque<UpgradeEvent>,
    total_recorded: u64,
}

impl Default for UpgradeEventLog {
    fn default() -> Self {
        Self::with_capacity(128)
    }
}

impl UpgradeEventLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity),
            total_recorded: 0,
        }
    }

    pub fn record(&mut self, events: impl IntoIterator<Item = UpgradeEvent>) {
        for event in events {
            if self.events.len() == self.capacity {
                self.events.pop_front();
            }
            self.events.push_back(event);
            self.total_recorded += 1;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &UpgradeEvent> {
        self.events.iter()
    }

    pub fn for_entity(&self, entity: EntityId) -> impl Iterator<Item = &UpgradeEvent> {
        self.events.iter().filter(move |event| event.entity() == entity)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// Writes one telemetry frame to the debug log. Empty batches are skipped.
pub fn emit_upgrade_telemetry(frame: u64, events: &[UpgradeEvent]) {
    if events.is_empty() {
        return;
    }
    let frame = UpgradeTelemetryFrame {
        frame,
        events: events.iter().map(UpgradeEvent::to_state).collect(),
    };
    if let Ok(payload) = serde_json::to_string(&frame) {
        debug!(target: UPGRADE_TELEMETRY_TOPIC, "{} {}", UPGRADE_TELEMETRY_TOPIC, payload);
    }
}
