use std::{collections::HashSet, sync::Arc};

use progression_schema::{
    decode_snapshot, encode_snapshot, PendingUpgradeState, RegistrySnapshot, SnapshotCodecError,
    SnapshotHeader, TrackedEntityState,
};
use thiserror::Error;

use crate::catalog::UpgradeCatalog;
use crate::registry::{
    EntityId, OwnerHandle, PendingUpgrade, ProgressionRegistry, Slot, TrackedEntity,
    UpgradableAspect, UpgradableCategory,
};
use crate::scheduler::UpgradeScheduler;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Codec(#[from] SnapshotCodecError),
    #[error("slot {0} is outside the snapshot's slot table")]
    SlotOutOfRange(u32),
    #[error("slot {0} is listed more than once")]
    DuplicateSlot(u32),
    #[error("entity in slot {index} has generation {found}, slot table says {expected}")]
    GenerationMismatch { index: u32, expected: u32, found: u32 },
    #[error("slot {0} is neither live nor free")]
    SlotUnaccounted(u32),
    #[error("pending upgrade for slot {0} has no live entity")]
    PendingWithoutEntity(u32),
}

impl<S: UpgradeScheduler> ProgressionRegistry<S> {
    /// Captures slots, the free stack, live entities and in-flight upgrades
    /// with their remaining time.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let slot_generations: Vec<u32> = self.slots.iter().map(|slot| slot.generation).collect();
        let mut entities = Vec::new();
        let mut pending = Vec::new();
        for (id, entity) in self.iter() {
            entities.push(TrackedEntityState {
                index: id.index(),
                generation: id.generation(),
                path_id: entity.path_id.clone(),
                level: entity.current_level,
                category: entity.category.as_u8(),
                aspect: entity.aspect.as_u8(),
                owner: entity.owner.map(|owner| owner.0),
            });
            if let Some(upgrade) = &entity.pending {
                pending.push(PendingUpgradeState {
                    index: id.index(),
                    requested_level_increase: upgrade.requested_level_increase,
                    total_seconds: upgrade.total_seconds,
                    remaining_seconds: self
                        .scheduler
                        .remaining(upgrade.timer_token)
                        .unwrap_or(0.0),
                    resource_costs: upgrade.resource_cost_snapshot.clone(),
                });
            }
        }

        RegistrySnapshot {
            header: SnapshotHeader::new(
                slot_generations.len(),
                entities.len(),
                pending.len(),
                self.catalog.fingerprint(),
            ),
            slot_generations,
            free_slots: self.free_slots.clone(),
            entities,
            pending,
        }
        .finalize()
    }

    pub fn encode_snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(encode_snapshot(&self.snapshot())?)
    }

    /// Rebuilds a registry from a snapshot, rescheduling every pending upgrade
    /// on `scheduler` with its remaining time. Level-change events are not
    /// replayed.
    pub fn restore_from_snapshot(
        snapshot: &RegistrySnapshot,
        catalog: Arc<UpgradeCatalog>,
        mut scheduler: S,
    ) -> Result<Self, SnapshotError> {
        let slot_count = snapshot.slot_generations.len();
        let mut slots: Vec<Slot> = snapshot
            .slot_generations
            .iter()
            .map(|generation| Slot {
                generation: *generation,
                entity: None,
            })
            .collect();

        let mut accounted = HashSet::with_capacity(slot_count);
        for free in &snapshot.free_slots {
            if *free as usize >= slot_count {
                return Err(SnapshotError::SlotOutOfRange(*free));
            }
            if !accounted.insert(*free) {
                return Err(SnapshotError::DuplicateSlot(*free));
            }
        }

        for state in &snapshot.entities {
            let Some(slot) = slots.get_mut(state.index as usize) else {
                return Err(SnapshotError::SlotOutOfRange(state.index));
            };
            if !accounted.insert(state.index) {
                return Err(SnapshotError::DuplicateSlot(state.index));
            }
            if slot.generation != state.generation {
                return Err(SnapshotError::GenerationMismatch {
                    index: state.index,
                    expected: slot.generation,
                    found: state.generation,
                });
            }
            slot.entity = Some(TrackedEntity {
                path_id: state.path_id.clone(),
                current_level: state.level,
                category: UpgradableCategory::from_u8(state.category),
                aspect: UpgradableAspect::from_u8(state.aspect),
                owner: state.owner.map(OwnerHandle),
                pending: None,
            });
        }

        if let Some(missing) = (0..slot_count as u32).find(|index| !accounted.contains(index)) {
            return Err(SnapshotError::SlotUnaccounted(missing));
        }

        for state in &snapshot.pending {
            let Some(slot) = slots.get_mut(state.index as usize) else {
                return Err(SnapshotError::PendingWithoutEntity(state.index));
            };
            let id = EntityId::new(state.index, slot.generation);
            let Some(entity) = slot.entity.as_mut() else {
                return Err(SnapshotError::PendingWithoutEntity(state.index));
            };
            let token = scheduler.schedule(state.remaining_seconds, id);
            entity.pending = Some(PendingUpgrade {
                requested_level_increase: state.requested_level_increase,
                total_seconds: state.total_seconds,
                resource_cost_snapshot: state.resource_costs.clone(),
                timer_token: token,
            });
        }

        if snapshot.header.catalog_fingerprint != catalog.fingerprint() {
            tracing::warn!(
                target: "upgrade::registry",
                snapshot = snapshot.header.catalog_fingerprint,
                catalog = catalog.fingerprint(),
                "snapshot.catalog_changed"
            );
        }

        Ok(Self::from_parts(
            catalog,
            scheduler,
            slots,
            snapshot.free_slots.clone(),
        ))
    }

    pub fn restore_from_bytes(
        bytes: &[u8],
        catalog: Arc<UpgradeCatalog>,
        scheduler: S,
    ) -> Result<Self, SnapshotError> {
        let snapshot = decode_snapshot(bytes)?;
        Self::restore_from_snapshot(&snapshot, catalog, scheduler)
    }
}
