//! Runtime upgrade state for registered entities.
//!
//! Entities live in a slot table addressed by generational [`EntityId`]s.
//! Each entity is either idle or has exactly one [`PendingUpgrade`] whose
//! timer is owned by the registry's [`UpgradeScheduler`]. All mutation is
//! expected on one thread; notifications are queued and drained by the host.

use std::{fmt, sync::Arc};

use bevy::prelude::Resource;
use thiserror::Error;

use crate::catalog::{LevelRequirement, PathCatalog, UpgradeCatalog};
use crate::events::UpgradeEvent;
use crate::ledger::{ResourceAmounts, ResourceCosts, ResourceLedger};
use crate::resource_types::ResourceIndex;
use crate::scheduler::{FiredTimer, TickScheduler, TimerToken, UpgradeScheduler};

/// Opaque handle to a tracked entity. A freed slot is reused under the same
/// index with a bumped generation, so stale handles never alias new entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId {
    index: u32,
    generation: u32,
}

impl EntityId {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UpgradableCategory {
    #[default]
    None = 0,
    Unit = 1,
    Building = 2,
    Equipment = 3,
}

impl UpgradableCategory {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => UpgradableCategory::Unit,
            2 => UpgradableCategory::Building,
            3 => UpgradableCategory::Equipment,
            _ => UpgradableCategory::None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UpgradableAspect {
    #[default]
    None = 0,
    Level = 1,
    Tier = 2,
    Rank = 3,
    Star = 4,
}

impl UpgradableAspect {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => UpgradableAspect::Level,
            2 => UpgradableAspect::Tier,
            3 => UpgradableAspect::Rank,
            4 => UpgradableAspect::Star,
            _ => UpgradableAspect::None,
        }
    }
}

/// Host-side owner of one or more tracked entities (an actor, a player unit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub path_id: String,
    pub initial_level: u32,
    pub category: UpgradableCategory,
    pub aspect: UpgradableAspect,
    pub owner: Option<OwnerHandle>,
}

impl Registration {
    pub fn new(path_id: impl Into<String>, initial_level: u32) -> Self {
        Self {
            path_id: path_id.into(),
            initial_level,
            category: UpgradableCategory::None,
            aspect: UpgradableAspect::None,
            owner: None,
        }
    }

    pub fn category(mut self, category: UpgradableCategory) -> Self {
        self.category = category;
        self
    }

    pub fn aspect(mut self, aspect: UpgradableAspect) -> Self {
        self.aspect = aspect;
        self
    }

    pub fn owner(mut self, owner: OwnerHandle) -> Self {
        self.owner = Some(owner);
        self
    }
}

/// In-flight upgrade. Costs are captured at request time and never re-read
/// from the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpgrade {
    pub requested_level_increase: u32,
    pub total_seconds: f32,
    pub resource_cost_snapshot: ResourceCosts,
    pub timer_token: TimerToken,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEntity {
    pub(crate) path_id: String,
    pub(crate) current_level: u32,
    pub(crate) category: UpgradableCategory,
    pub(crate) aspect: UpgradableAspect,
    pub(crate) owner: Option<OwnerHandle>,
    pub(crate) pending: Option<PendingUpgrade>,
}

impl TrackedEntity {
    pub(crate) fn from_registration(registration: Registration) -> Self {
        Self {
            path_id: registration.path_id,
            current_level: registration.initial_level,
            category: registration.category,
            aspect: registration.aspect,
            owner: registration.owner,
            pending: None,
        }
    }

    pub fn path_id(&self) -> &str {
        &self.path_id
    }

    pub fn current_level(&self) -> u32 {
        self.current_level
    }

    pub fn category(&self) -> UpgradableCategory {
        self.category
    }

    pub fn aspect(&self) -> UpgradableAspect {
        self.aspect
    }

    pub fn owner(&self) -> Option<OwnerHandle> {
        self.owner
    }

    pub fn pending(&self) -> Option<&PendingUpgrade> {
        self.pending.as_ref()
    }

    pub fn is_upgrading(&self) -> bool {
        self.pending.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Slot {
    pub(crate) generation: u32,
    pub(crate) entity: Option<TrackedEntity>,
}

/// What a validated upgrade will cost and where it ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeQuote {
    pub from_level: u32,
    pub to_level: u32,
    pub total_costs: ResourceCosts,
    pub total_seconds: i64,
}

impl UpgradeQuote {
    pub fn level_increase(&self) -> u32 {
        self.to_level - self.from_level
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpgradeRejection {
    #[error("entity {0} is not registered")]
    UnknownEntity(EntityId),
    #[error("entity {0} is already upgrading")]
    AlreadyUpgrading(EntityId),
    #[error("level increase {0} must be positive")]
    NonPositiveIncrease(i32),
    #[error("upgrade path '{0}' is not in the catalog")]
    UnknownPath(String),
    #[error("target level {target} exceeds max level {max}")]
    ExceedsMaxLevel { target: i64, max: u32 },
    #[error("level {0} is locked")]
    LevelLocked(u32),
    #[error("resource '{0}' was not offered")]
    MissingResource(String),
    #[error("needs {required} of '{resource}', {available} available")]
    InsufficientResource {
        resource: String,
        required: i64,
        available: i64,
    },
    #[error("summed upgrade time from level {from} to {to} overflows")]
    DurationOverflow { from: u32, to: u32 },
}

/// Result of [`ProgressionRegistry::tick_timer`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimerAdjustment {
    Remaining(f32),
    Completed,
    NotUpgrading,
}

impl TimerAdjustment {
    pub const SENTINEL: f32 = -1.0;

    /// Remaining seconds, or `-1` once the upgrade completed or when none was running.
    pub fn as_seconds(self) -> f32 {
        match self {
            TimerAdjustment::Remaining(seconds) => seconds,
            TimerAdjustment::Completed | TimerAdjustment::NotUpgrading => Self::SENTINEL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounters {
    pub registered: u64,
    pub unregistered: u64,
    pub started: u64,
    pub completed: u64,
    pub immediate: u64,
    pub canceled: u64,
    pub rejected: u64,
}

pub struct ProgressionRegistry<S: UpgradeScheduler = TickScheduler> {
    pub(crate) catalog: Arc<UpgradeCatalog>,
    pub(crate) slots: Vec<Slot>,
    pub(crate) free_slots: Vec<u32>,
    pub(crate) scheduler: S,
    events: Vec<UpgradeEvent>,
    counters: RegistryCounters,
}

impl<S: UpgradeScheduler> Resource for ProgressionRegistry<S> {}

impl<S: UpgradeScheduler> fmt::Debug for ProgressionRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressionRegistry")
            .field("catalog_paths", &self.catalog.len())
            .field("slots", &self.slots.len())
            .field("free_slots", &self.free_slots)
            .field("pending_events", &self.events.len())
            .field("counters", &self.counters)
            .finish()
    }
}

impl ProgressionRegistry<TickScheduler> {
    pub fn new(catalog: Arc<UpgradeCatalog>) -> Self {
        Self::with_scheduler(catalog, TickScheduler::new())
    }
}

impl<S: UpgradeScheduler> ProgressionRegistry<S> {
    pub fn with_scheduler(catalog: Arc<UpgradeCatalog>, scheduler: S) -> Self {
        Self {
            catalog,
            slots: Vec::new(),
            free_slots: Vec::new(),
            scheduler,
            events: Vec::new(),
            counters: RegistryCounters::default(),
        }
    }

    pub(crate) fn from_parts(
        catalog: Arc<UpgradeCatalog>,
        scheduler: S,
        slots: Vec<Slot>,
        free_slots: Vec<u32>,
    ) -> Self {
        Self {
            catalog,
            slots,
            free_slots,
            scheduler,
            events: Vec::new(),
            counters: RegistryCounters::default(),
        }
    }

    pub fn catalog(&self) -> &Arc<UpgradeCatalog> {
        &self.catalog
    }

    /// Publishes a freshly compiled catalog. In-flight upgrades keep the
    /// costs and durations they were started with.
    pub fn replace_catalog(&mut self, catalog: Arc<UpgradeCatalog>) {
        let missing = self
            .iter()
            .filter(|(_, entity)| catalog.path(&entity.path_id).is_none())
            .count();
        if missing > 0 {
            tracing::warn!(
                target: "upgrade::registry",
                missing,
                "registered entities reference paths absent from the new catalog"
            );
        }
        tracing::info!(
            target: "upgrade::registry",
            previous = self.catalog.fingerprint(),
            next = catalog.fingerprint(),
            "upgrade_catalog.swapped"
        );
        self.catalog = catalog;
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn counters(&self) -> &RegistryCounters {
        &self.counters
    }

    pub fn register(&mut self, path_id: &str, initial_level: u32) -> EntityId {
        self.register_with(Registration::new(path_id, initial_level))
    }

    pub fn register_with(&mut self, registration: Registration) -> EntityId {
        if self.catalog.path(&registration.path_id).is_none() {
            tracing::warn!(
                target: "upgrade::registry",
                path_id = %registration.path_id,
                "registering entity on a path missing from the catalog"
            );
        }
        let entity = TrackedEntity::from_registration(registration);
        let index = loop {
            let Some(index) = self.free_slots.pop() else {
                self.slots.push(Slot::default());
                break (self.slots.len() - 1) as u32;
            };
            let slot = &self.slots[index as usize];
            debug_assert!(slot.entity.is_none(), "free slot {index} still holds a live entity");
            if slot.entity.is_none() {
                break index;
            }
            tracing::warn!(target: "upgrade::registry", index, "free_slot.live_entity_skipped");
        };
        let slot = &mut self.slots[index as usize];
        slot.entity = Some(entity);
        let id = EntityId::new(index, slot.generation);
        self.counters.registered += 1;
        tracing::trace!(
            target: "upgrade::registry",
            entity = %id,
            live = self.live_count(),
            "entity.registered"
        );
        id
    }

    /// Frees the entity's slot, cancelling any running upgrade first.
    /// Freeing an id that is not live is a programming error.
    pub fn unregister(&mut self, id: EntityId) -> bool {
        if self.get(id).is_none() {
            debug_assert!(false, "unregister of entity {id} that is not live");
            tracing::warn!(target: "upgrade::registry", entity = %id, "unregister.not_live");
            return false;
        }
        self.cancel(id);
        let slot = &mut self.slots[id.index as usize];
        slot.entity = None;
        slot.generation = slot.generation.wrapping_add(1);
        debug_assert!(
            !self.free_slots.contains(&id.index),
            "slot {} freed twice",
            id.index
        );
        self.free_slots.push(id.index);
        self.counters.unregistered += 1;
        tracing::trace!(
            target: "upgrade::registry",
            entity = %id,
            live = self.live_count(),
            "entity.unregistered"
        );
        true
    }

    pub fn get(&self, id: EntityId) -> Option<&TrackedEntity> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entity.as_ref())
    }

    fn get_mut(&mut self, id: EntityId) -> Option<&mut TrackedEntity> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entity.as_mut())
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &TrackedEntity)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entity
                .as_ref()
                .map(|entity| (EntityId::new(index as u32, slot.generation), entity))
        })
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }

    pub fn upgrading_count(&self) -> usize {
        self.iter().filter(|(_, entity)| entity.is_upgrading()).count()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn free_slot_count(&self) -> usize {
        self.free_slots.len()
    }

    fn path_for(&self, id: EntityId) -> Option<(&TrackedEntity, &PathCatalog)> {
        let entity = self.get(id)?;
        let path = self.catalog.path(&entity.path_id)?;
        Some((entity, path))
    }

    /// Validates an upgrade of `level_increase` levels against `available`,
    /// summing the cost of every traversed level.
    pub fn check_upgrade(
        &self,
        id: EntityId,
        level_increase: i32,
        available: &ResourceAmounts,
    ) -> Result<UpgradeQuote, UpgradeRejection> {
        let entity = self.get(id).ok_or(UpgradeRejection::UnknownEntity(id))?;
        if entity.is_upgrading() {
            return Err(UpgradeRejection::AlreadyUpgrading(id));
        }
        if level_increase <= 0 {
            return Err(UpgradeRejection::NonPositiveIncrease(level_increase));
        }
        let path = self
            .catalog
            .path(&entity.path_id)
            .ok_or_else(|| UpgradeRejection::UnknownPath(entity.path_id.clone()))?;
        let target = i64::from(entity.current_level) + i64::from(level_increase);
        if target > i64::from(path.max_level()) {
            return Err(UpgradeRejection::ExceedsMaxLevel {
                target,
                max: path.max_level(),
            });
        }
        let to_level = target as u32;

        let mut total_costs = ResourceCosts::new();
        let mut total_seconds = 0i64;
        for level in entity.current_level + 1..=to_level {
            let Some(requirement) = path.level(level) else {
                continue;
            };
            if requirement.locked {
                return Err(UpgradeRejection::LevelLocked(level));
            }
            for (index, amount) in requirement.costs() {
                let name = self.resource_name(index);
                let Some(offered) = available.get(name) else {
                    return Err(UpgradeRejection::MissingResource(name.to_string()));
                };
                let total = total_costs.entry(name.to_string()).or_insert(0);
                *total = total.checked_add(amount).ok_or_else(|| {
                    UpgradeRejection::InsufficientResource {
                        resource: name.to_string(),
                        required: i64::MAX,
                        available: *offered,
                    }
                })?;
            }
            total_seconds = total_seconds
                .checked_add(requirement.upgrade_seconds)
                .ok_or(UpgradeRejection::DurationOverflow {
                    from: entity.current_level,
                    to: to_level,
                })?;
        }

        for (resource, required) in &total_costs {
            let offered = available.get(resource).copied().unwrap_or(0);
            if *required > offered {
                return Err(UpgradeRejection::InsufficientResource {
                    resource: resource.clone(),
                    required: *required,
                    available: offered,
                });
            }
        }

        Ok(UpgradeQuote {
            from_level: entity.current_level,
            to_level,
            total_costs,
            total_seconds,
        })
    }

    pub fn can_upgrade(&self, id: EntityId, level_increase: i32, available: &ResourceAmounts) -> bool {
        match self.check_upgrade(id, level_increase, available) {
            Ok(_) => true,
            Err(reason) => {
                tracing::debug!(
                    target: "upgrade::registry",
                    entity = %id,
                    level_increase,
                    %reason,
                    "upgrade.rejected"
                );
                false
            }
        }
    }

    /// Validates and starts an upgrade. Zero-duration upgrades apply at once.
    pub fn request_upgrade(&mut self, id: EntityId, level_increase: i32, available: &ResourceAmounts) -> bool {
        match self.check_upgrade(id, level_increase, available) {
            Ok(quote) => {
                self.start_upgrade(id, quote);
                true
            }
            Err(reason) => {
                self.counters.rejected += 1;
                tracing::debug!(
                    target: "upgrade::registry",
                    entity = %id,
                    level_increase,
                    %reason,
                    "upgrade.rejected"
                );
                false
            }
        }
    }

    /// Like [`request_upgrade`](Self::request_upgrade), but reads balances
    /// from `ledger` and debits the summed costs once the upgrade is accepted.
    /// A rejected request leaves the ledger as it found it.
    pub fn request_upgrade_with_ledger<L: ResourceLedger + ?Sized>(
        &mut self,
        id: EntityId,
        level_increase: i32,
        ledger: &mut L,
    ) -> Result<UpgradeQuote, UpgradeRejection> {
        let mut offered = ResourceAmounts::new();
        if let Some((entity, path)) = self.path_for(id) {
            let last = entity
                .current_level
                .saturating_add(level_increase.max(0) as u32)
                .min(path.max_level());
            for level in entity.current_level.saturating_add(1)..=last {
                for (index, _) in path.level(level).into_iter().flat_map(LevelRequirement::costs) {
                    let name = self.resource_name(index);
                    if let Some(amount) = ledger.available(name) {
                        offered.insert(name.to_string(), amount);
                    }
                }
            }
        }

        let quote = match self.check_upgrade(id, level_increase, &offered) {
            Ok(quote) => quote,
            Err(reason) => {
                self.counters.rejected += 1;
                return Err(reason);
            }
        };
        if let Some((resource, required)) = quote
            .total_costs
            .iter()
            .find(|(resource, amount)| !ledger.has_at_least(resource, **amount))
        {
            self.counters.rejected += 1;
            return Err(UpgradeRejection::InsufficientResource {
                resource: resource.clone(),
                required: *required,
                available: ledger.available(resource).unwrap_or(0),
            });
        }
        let mut debited: Vec<(&str, i64)> = Vec::with_capacity(quote.total_costs.len());
        for (resource, amount) in &quote.total_costs {
            if let Err(err) = ledger.debit(resource, *amount) {
                tracing::warn!(target: "upgrade::registry", entity = %id, error = %err, "ledger.debit_failed");
                for (refunded, refund) in debited {
                    ledger.credit(refunded, refund);
                }
                self.counters.rejected += 1;
                return Err(UpgradeRejection::InsufficientResource {
                    resource: resource.clone(),
                    required: *amount,
                    available: ledger.available(resource).unwrap_or(0),
                });
            }
            debited.push((resource, *amount));
        }
        self.start_upgrade(id, quote.clone());
        Ok(quote)
    }

    fn start_upgrade(&mut self, id: EntityId, quote: UpgradeQuote) {
        if quote.total_seconds <= 0 {
            self.counters.immediate += 1;
            self.set_level(id, quote.to_level);
            return;
        }
        let total_seconds = quote.total_seconds as f32;
        let token = self.scheduler.schedule(total_seconds, id);
        let Some(entity) = self.get_mut(id) else {
            self.scheduler.cancel(token);
            return;
        };
        entity.pending = Some(PendingUpgrade {
            requested_level_increase: quote.level_increase(),
            total_seconds,
            resource_cost_snapshot: quote.total_costs,
            timer_token: token,
        });
        self.counters.started += 1;
        self.events.push(UpgradeEvent::UpgradeStarted {
            entity: id,
            total_seconds,
        });
        tracing::debug!(
            target: "upgrade::registry",
            entity = %id,
            from = quote.from_level,
            to = quote.to_level,
            total_seconds,
            "upgrade.started"
        );
    }

    fn set_level(&mut self, id: EntityId, new_level: u32) {
        let Some(entity) = self.get_mut(id) else {
            return;
        };
        let old_level = entity.current_level;
        entity.current_level = new_level;
        self.events.push(UpgradeEvent::LevelChanged {
            entity: id,
            old_level,
            new_level,
        });
    }

    /// Completes the entity's running upgrade. Stale or idle ids are ignored.
    pub fn on_timer_fired(&mut self, id: EntityId) -> bool {
        let Some(token) = self
            .get(id)
            .and_then(TrackedEntity::pending)
            .map(|pending| pending.timer_token)
        else {
            return false;
        };
        self.scheduler.cancel(token);
        self.complete(id)
    }

    fn complete(&mut self, id: EntityId) -> bool {
        let Some(entity) = self.get_mut(id) else {
            return false;
        };
        let Some(pending) = entity.pending.take() else {
            return false;
        };
        let new_level = entity
            .current_level
            .saturating_add(pending.requested_level_increase);
        self.counters.completed += 1;
        self.set_level(id, new_level);
        true
    }

    /// Stops a running upgrade without changing the level. No-op when idle.
    pub fn cancel(&mut self, id: EntityId) -> bool {
        let Some(entity) = self.get_mut(id) else {
            return false;
        };
        let Some(pending) = entity.pending.take() else {
            return false;
        };
        let current_level = entity.current_level;
        self.scheduler.cancel(pending.timer_token);
        self.counters.canceled += 1;
        self.events.push(UpgradeEvent::UpgradeCanceled {
            entity: id,
            current_level,
        });
        tracing::debug!(target: "upgrade::registry", entity = %id, current_level, "upgrade.canceled");
        true
    }

    /// Shifts the running timer by `delta_seconds` (negative speeds it up).
    /// A timer pushed to zero or below completes the upgrade immediately.
    pub fn tick_timer(&mut self, id: EntityId, delta_seconds: f32) -> TimerAdjustment {
        let Some(token) = self
            .get(id)
            .and_then(TrackedEntity::pending)
            .map(|pending| pending.timer_token)
        else {
            return TimerAdjustment::NotUpgrading;
        };
        let remaining = self.scheduler.remaining(token).unwrap_or(0.0);
        let adjusted = (remaining + delta_seconds).max(0.0);
        self.events.push(UpgradeEvent::UpgradeTimeChanged {
            entity: id,
            delta_seconds,
        });
        self.scheduler.cancel(token);

        if adjusted > 0.0 {
            let restarted = self.scheduler.schedule(adjusted, id);
            if let Some(pending) = self.get_mut(id).and_then(|entity| entity.pending.as_mut()) {
                pending.timer_token = restarted;
            }
            TimerAdjustment::Remaining(adjusted)
        } else {
            self.complete(id);
            TimerAdjustment::Completed
        }
    }

    /// Advances the scheduler and completes every upgrade whose timer expired.
    pub fn advance_timers(&mut self, seconds: f32) -> usize {
        let mut completed = 0;
        for fired in self.scheduler.advance(seconds) {
            if self.accepts_fired(&fired) && self.complete(fired.entity) {
                completed += 1;
            }
        }
        completed
    }

    fn accepts_fired(&self, fired: &FiredTimer) -> bool {
        self.get(fired.entity)
            .and_then(TrackedEntity::pending)
            .is_some_and(|pending| pending.timer_token == fired.token)
    }

    pub fn drain_events(&mut self) -> Vec<UpgradeEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn pending_events(&self) -> &[UpgradeEvent] {
        &self.events
    }

    pub fn get_current_level(&self, id: EntityId) -> Option<u32> {
        self.get(id).map(TrackedEntity::current_level)
    }

    pub fn get_max_level(&self, id: EntityId) -> Option<u32> {
        self.path_for(id).map(|(_, path)| path.max_level())
    }

    /// The level after the current one, if the path has it.
    pub fn get_next_level(&self, id: EntityId) -> Option<u32> {
        let (entity, path) = self.path_for(id)?;
        let next = entity.current_level.checked_add(1)?;
        (next <= path.max_level()).then_some(next)
    }

    pub fn get_definition_for_level(&self, id: EntityId, level: u32) -> Option<&LevelRequirement> {
        self.path_for(id).and_then(|(_, path)| path.level(level))
    }

    pub fn get_next_level_cost(&self, id: EntityId) -> Option<ResourceCosts> {
        let next = self.get_next_level(id)?;
        let requirement = self.get_definition_for_level(id, next)?;
        Some(self.catalog.named_costs(requirement))
    }

    pub fn get_next_level_time(&self, id: EntityId) -> Option<i64> {
        let next = self.get_next_level(id)?;
        self.get_definition_for_level(id, next)
            .map(|requirement| requirement.upgrade_seconds)
    }

    pub fn definitions_for_path(&self, path_id: &str) -> Option<&[LevelRequirement]> {
        self.catalog.path(path_id).map(|path| path.levels.as_slice())
    }

    /// Summed costs for the next `level_increase` levels, ignoring locks and balances.
    pub fn total_cost_for_increase(&self, id: EntityId, level_increase: u32) -> Option<ResourceCosts> {
        let (entity, path) = self.path_for(id)?;
        let target = entity.current_level.checked_add(level_increase)?;
        if level_increase == 0 || target > path.max_level() {
            return None;
        }
        let mut totals = ResourceCosts::new();
        for level in entity.current_level + 1..=target {
            for (index, amount) in path.level(level)?.costs() {
                let total = totals.entry(self.resource_name(index).to_string()).or_insert(0);
                *total = total.checked_add(amount)?;
            }
        }
        Some(totals)
    }

    pub fn total_time_for_increase(&self, id: EntityId, level_increase: u32) -> Option<i64> {
        let (entity, path) = self.path_for(id)?;
        let target = entity.current_level.checked_add(level_increase)?;
        if level_increase == 0 || target > path.max_level() {
            return None;
        }
        (entity.current_level + 1..=target).try_fold(0i64, |total, level| {
            total.checked_add(path.level(level)?.upgrade_seconds)
        })
    }

    pub fn is_upgrading(&self, id: EntityId) -> bool {
        self.get(id).is_some_and(TrackedEntity::is_upgrading)
    }

    pub fn upgrade_time_remaining(&self, id: EntityId) -> Option<f32> {
        let pending = self.get(id)?.pending()?;
        self.scheduler.remaining(pending.timer_token)
    }

    pub fn in_progress_total_time(&self, id: EntityId) -> Option<f32> {
        self.get(id)?.pending().map(|pending| pending.total_seconds)
    }

    pub fn in_progress_level_increase(&self, id: EntityId) -> Option<u32> {
        self.get(id)?
            .pending()
            .map(|pending| pending.requested_level_increase)
    }

    pub fn in_progress_cost(&self, id: EntityId) -> Option<&ResourceCosts> {
        self.get(id)?
            .pending()
            .map(|pending| &pending.resource_cost_snapshot)
    }

    pub fn resource_type_index(&self, name: &str) -> Option<ResourceIndex> {
        self.catalog.resource_types().index_of(name)
    }

    pub fn resource_type_name(&self, index: ResourceIndex) -> Option<&str> {
        self.catalog.resource_types().name(index)
    }

    fn resource_name(&self, index: ResourceIndex) -> &str {
        self.resource_type_name(index).unwrap_or_default()
    }

    pub fn find_by_owner_and_aspect(&self, owner: OwnerHandle, aspect: UpgradableAspect) -> Option<EntityId> {
        self.iter()
            .find(|(_, entity)| entity.owner == Some(owner) && entity.aspect == aspect)
            .map(|(id, _)| id)
    }

    pub fn find_by_owner_and_category(
        &self,
        owner: OwnerHandle,
        category: UpgradableCategory,
    ) -> Option<EntityId> {
        self.iter()
            .find(|(_, entity)| entity.owner == Some(owner) && entity.category == category)
            .map(|(id, _)| id)
    }

    pub fn entities_by_aspect(&self, aspect: UpgradableAspect, level_filter: Option<u32>) -> Vec<EntityId> {
        self.iter()
            .filter(|(_, entity)| entity.aspect == aspect)
            .filter(|(_, entity)| level_filter.map_or(true, |level| entity.current_level == level))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn entities_by_path(&self, path_id: &str, level_filter: Option<u32>) -> Vec<EntityId> {
        self.iter()
            .filter(|(_, entity)| entity.path_id == path_id)
            .filter(|(_, entity)| level_filter.map_or(true, |level| entity.current_level == level))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn entities_by_owner(&self, owner: OwnerHandle) -> Vec<EntityId> {
        self.iter()
            .filter(|(_, entity)| entity.owner == Some(owner))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn level_for_owner(&self, owner: OwnerHandle, aspect: UpgradableAspect) -> Option<u32> {
        self.find_by_owner_and_aspect(owner, aspect)
            .and_then(|id| self.get_current_level(id))
    }

    /// Routes a request to the owner's entity with the given aspect.
    pub fn request_upgrade_for_owner(
        &mut self,
        owner: OwnerHandle,
        aspect: UpgradableAspect,
        level_increase: i32,
        available: &ResourceAmounts,
    ) -> bool {
        match self.find_by_owner_and_aspect(owner, aspect) {
            Some(id) => self.request_upgrade(id, level_increase, available),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogCompiler;
    use crate::ledger::{InMemoryLedger, LedgerError};
    use crate::records::{LevelOverride, RawPathRecord};

    fn level(level: i64, wood: i64, seconds: i64) -> LevelOverride {
        LevelOverride {
            level,
            resource_costs: vec![("wood".into(), wood)],
            upgrade_seconds: Some(seconds),
            locked: false,
        }
    }

    /// keep: wood 5/10/15/20/25/30, seconds 0/0/10/30/60/90, level 5 locked.
    /// shrine: level 1 costs gold, seconds 0.
    fn catalog() -> Arc<UpgradeCatalog> {
        let mut locked = level(5, 30, 90);
        locked.locked = true;
        let keep = RawPathRecord::new("keep", 5)
            .with_override(level(0, 5, 0))
            .with_override(level(1, 10, 0))
            .with_override(level(2, 15, 10))
            .with_override(level(3, 20, 30))
            .with_override(level(4, 25, 60))
            .with_override(locked);
        let shrine = RawPathRecord::new("shrine", 1)
            .with_override(level(0, 1, 0))
            .with_override(LevelOverride {
                level: 1,
                resource_costs: vec![("gold".into(), 3)],
                upgrade_seconds: Some(0),
                locked: false,
            });
        Arc::new(CatalogCompiler::new().compile(vec![keep, shrine]).catalog)
    }

    fn wood(amount: i64) -> ResourceAmounts {
        ResourceAmounts::from([("wood".to_string(), amount)])
    }

    #[test]
    fn slot_reuse_returns_same_index_with_new_generation() {
        let mut registry = ProgressionRegistry::new(catalog());
        let first = registry.register("keep", 0);
        let other = registry.register("keep", 0);
        assert!(registry.unregister(first));
        let reused = registry.register("keep", 1);
        assert_eq!(reused.index(), first.index());
        assert_ne!(reused, first);
        assert_ne!(reused, other);
        assert_eq!(registry.get_current_level(first), None);
        assert_eq!(registry.get_current_level(reused), Some(1));
        assert_eq!(registry.slot_count(), 2);
    }

    #[test]
    fn multi_level_upgrade_pays_every_level() {
        let mut registry = ProgressionRegistry::new(catalog());
        let id = registry.register("keep", 0);
        assert!(!registry.can_upgrade(id, 2, &wood(24)));
        assert_eq!(
            registry.check_upgrade(id, 2, &wood(24)),
            Err(UpgradeRejection::InsufficientResource {
                resource: "wood".into(),
                required: 25,
                available: 24
            })
        );
        let quote = registry.check_upgrade(id, 2, &wood(25)).expect("affordable");
        assert_eq!(quote.total_seconds, 10);
        assert_eq!(quote.to_level, 2);
    }

    #[test]
    fn rejection_reasons_follow_check_order() {
        let mut registry = ProgressionRegistry::new(catalog());
        let id = registry.register("keep", 4);
        let stale = EntityId::new(42, 0);
        assert_eq!(
            registry.check_upgrade(stale, 1, &wood(100)),
            Err(UpgradeRejection::UnknownEntity(stale))
        );
        assert_eq!(
            registry.check_upgrade(id, 0, &wood(100)),
            Err(UpgradeRejection::NonPositiveIncrease(0))
        );
        assert_eq!(
            registry.check_upgrade(id, 2, &wood(100)),
            Err(UpgradeRejection::ExceedsMaxLevel { target: 6, max: 5 })
        );
        assert_eq!(
            registry.check_upgrade(id, 1, &wood(100)),
            Err(UpgradeRejection::LevelLocked(5))
        );

        let shrine = registry.register("shrine", 0);
        assert_eq!(
            registry.check_upgrade(shrine, 1, &wood(100)),
            Err(UpgradeRejection::MissingResource("gold".into()))
        );
        let lost = registry.register("nowhere", 0);
        assert_eq!(
            registry.check_upgrade(lost, 1, &wood(100)),
            Err(UpgradeRejection::UnknownPath("nowhere".into()))
        );
    }

    #[test]
    fn timed_upgrade_completes_when_timer_fires() {
        let mut registry = ProgressionRegistry::new(catalog());
        let id = registry.register("keep", 2);
        assert_eq!(registry.get_next_level_time(id), Some(30));
        assert!(registry.request_upgrade(id, 1, &wood(100)));
        assert!(registry.is_upgrading(id));
        assert_eq!(registry.in_progress_total_time(id), Some(30.0));
        assert_eq!(
            registry.in_progress_cost(id),
            Some(&ResourceCosts::from([("wood".to_string(), 20)]))
        );

        assert_eq!(registry.advance_timers(29.0), 0);
        assert_eq!(registry.upgrade_time_remaining(id), Some(1.0));
        assert_eq!(registry.advance_timers(1.0), 1);
        assert_eq!(registry.get_current_level(id), Some(3));
        assert!(!registry.is_upgrading(id));
        assert_eq!(
            registry.drain_events(),
            vec![
                UpgradeEvent::UpgradeStarted {
                    entity: id,
                    total_seconds: 30.0
                },
                UpgradeEvent::LevelChanged {
                    entity: id,
                    old_level: 2,
                    new_level: 3
                },
            ]
        );
    }

    #[test]
    fn zero_duration_upgrade_applies_immediately() {
        let mut registry = ProgressionRegistry::new(catalog());
        let id = registry.register("keep", 0);
        assert!(registry.request_upgrade(id, 1, &wood(10)));
        assert_eq!(registry.get_current_level(id), Some(1));
        assert!(!registry.is_upgrading(id));
        assert_eq!(registry.scheduler().pending_count(), 0);
    }

    #[test]
    fn second_request_while_upgrading_is_rejected() {
        let mut registry = ProgressionRegistry::new(catalog());
        let id = registry.register("keep", 1);
        assert!(registry.request_upgrade(id, 1, &wood(1_000)));
        assert!(!registry.request_upgrade(id, 1, &wood(1_000)));
        assert_eq!(
            registry.check_upgrade(id, 1, &wood(1_000)),
            Err(UpgradeRejection::AlreadyUpgrading(id))
        );
        assert_eq!(registry.counters().rejected, 1);
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut registry = ProgressionRegistry::new(catalog());
        let id = registry.register("keep", 1);
        assert!(!registry.cancel(id));
        assert!(registry.request_upgrade(id, 1, &wood(100)));
        registry.drain_events();

        assert!(registry.cancel(id));
        assert!(!registry.cancel(id));
        assert_eq!(
            registry.drain_events(),
            vec![UpgradeEvent::UpgradeCanceled {
                entity: id,
                current_level: 1
            }]
        );
        assert_eq!(registry.advance_timers(100.0), 0);
        assert_eq!(registry.get_current_level(id), Some(1));
    }

    #[test]
    fn stale_timer_after_unregister_is_ignored() {
        let mut registry = ProgressionRegistry::new(catalog());
        let id = registry.register("keep", 2);
        assert!(registry.request_upgrade(id, 1, &wood(100)));
        assert!(registry.unregister(id));
        assert!(!registry.on_timer_fired(id));
        assert_eq!(registry.scheduler().pending_count(), 0);

        let reused = registry.register("keep", 2);
        assert_eq!(reused.index(), id.index());
        assert!(!registry.on_timer_fired(id));
        assert_eq!(registry.get_current_level(reused), Some(2));
    }

    #[test]
    fn tick_timer_restarts_or_completes() {
        let mut registry = ProgressionRegistry::new(catalog());
        let id = registry.register("keep", 2);
        assert_eq!(registry.tick_timer(id, 5.0), TimerAdjustment::NotUpgrading);
        assert!(registry.request_upgrade(id, 1, &wood(100)));

        assert_eq!(registry.tick_timer(id, -10.0), TimerAdjustment::Remaining(20.0));
        assert_eq!(registry.upgrade_time_remaining(id), Some(20.0));
        assert_eq!(registry.tick_timer(id, 5.0).as_seconds(), 25.0);

        let adjustment = registry.tick_timer(id, -30.0);
        assert_eq!(adjustment, TimerAdjustment::Completed);
        assert_eq!(adjustment.as_seconds(), -1.0);
        assert_eq!(registry.get_current_level(id), Some(3));
        assert_eq!(registry.scheduler().pending_count(), 0);
    }

    #[test]
    fn ledger_request_debits_summed_costs() {
        let mut registry = ProgressionRegistry::new(catalog());
        let id = registry.register("keep", 0);
        let mut ledger = InMemoryLedger::new().with_balance("wood", 30);
        let quote = registry
            .request_upgrade_with_ledger(id, 2, &mut ledger)
            .expect("affordable");
        assert_eq!(quote.total_costs.get("wood"), Some(&25));
        assert_eq!(ledger.get("wood"), 5);
        assert!(registry.is_upgrading(id));

        let other = registry.register("keep", 0);
        assert!(registry
            .request_upgrade_with_ledger(other, 1, &mut ledger)
            .is_err());
        assert_eq!(ledger.get("wood"), 5);
    }

    #[test]
    fn queries_report_not_found_instead_of_panicking() {
        let mut registry = ProgressionRegistry::new(catalog());
        let top = registry.register("keep", 5);
        assert_eq!(registry.get_next_level(top), None);
        assert_eq!(registry.get_next_level_cost(top), None);
        assert_eq!(registry.get_definition_for_level(top, 9), None);
        assert_eq!(registry.total_cost_for_increase(top, 1), None);

        let low = registry.register("keep", 0);
        assert_eq!(
            registry.get_next_level_cost(low),
            Some(ResourceCosts::from([("wood".to_string(), 10)]))
        );
        assert_eq!(
            registry.total_cost_for_increase(low, 3),
            Some(ResourceCosts::from([("wood".to_string(), 45)]))
        );
        assert_eq!(registry.total_time_for_increase(low, 3), Some(40));
        assert_eq!(registry.definitions_for_path("keep").map(<[_]>::len), Some(6));
        assert_eq!(registry.resource_type_index("wood"), Some(0));
        assert_eq!(registry.resource_type_name(0), Some("wood"));
    }

    #[test]
    fn tagged_queries_filter_by_owner_aspect_and_level() {
        let mut registry = ProgressionRegistry::new(catalog());
        let owner = OwnerHandle(7);
        let tier = registry.register_with(
            Registration::new("keep", 1)
                .aspect(UpgradableAspect::Tier)
                .category(UpgradableCategory::Building)
                .owner(owner),
        );
        let star = registry.register_with(
            Registration::new("shrine", 0)
                .aspect(UpgradableAspect::Star)
                .owner(owner),
        );
        registry.register_with(Registration::new("keep", 1).aspect(UpgradableAspect::Tier));

        assert_eq!(registry.find_by_owner_and_aspect(owner, UpgradableAspect::Star), Some(star));
        assert_eq!(
            registry.find_by_owner_and_category(owner, UpgradableCategory::Building),
            Some(tier)
        );
        assert_eq!(registry.entities_by_aspect(UpgradableAspect::Tier, None).len(), 2);
        assert_eq!(registry.entities_by_aspect(UpgradableAspect::Tier, Some(2)).len(), 0);
        assert_eq!(registry.entities_by_path("keep", Some(1)).len(), 2);
        assert_eq!(registry.entities_by_owner(owner), vec![tier, star]);
        assert_eq!(registry.level_for_owner(owner, UpgradableAspect::Tier), Some(1));
        assert!(registry.request_upgrade_for_owner(owner, UpgradableAspect::Tier, 1, &wood(15)));
        assert!(registry.is_upgrading(tier));
    }

    #[test]
    fn replaced_catalog_does_not_touch_pending_snapshot() {
        let mut registry = ProgressionRegistry::new(catalog());
        let id = registry.register("keep", 2);
        assert!(registry.request_upgrade(id, 1, &wood(100)));
        let cheaper = RawPathRecord::new("keep", 3)
            .with_override(level(0, 1, 0))
            .with_override(level(1, 1, 0))
            .with_override(level(2, 1, 0))
            .with_override(level(3, 1, 0));
        registry.replace_catalog(Arc::new(CatalogCompiler::new().compile(vec![cheaper]).catalog));
        assert_eq!(registry.in_progress_cost(id).and_then(|c| c.get("wood")), Some(&20));
        assert_eq!(registry.in_progress_total_time(id), Some(30.0));
    }

    fn gold_level(level: i64, gold: i64, seconds: i64) -> LevelOverride {
        LevelOverride {
            level,
            resource_costs: vec![("gold".into(), gold)],
            upgrade_seconds: Some(seconds),
            locked: false,
        }
    }

    #[test]
    fn summed_costs_and_times_that_overflow_are_rejected() {
        let vault = RawPathRecord::new("vault", 2)
            .with_override(gold_level(0, 1, 0))
            .with_override(gold_level(1, i64::MAX, 5))
            .with_override(gold_level(2, 1, 5));
        let epoch = RawPathRecord::new("epoch", 2)
            .with_override(gold_level(0, 1, 0))
            .with_override(gold_level(1, 1, i64::MAX))
            .with_override(gold_level(2, 1, 5));
        let catalog = CatalogCompiler::new().compile(vec![vault, epoch]).catalog;
        let mut registry = ProgressionRegistry::new(Arc::new(catalog));
        let rich = ResourceAmounts::from([("gold".to_string(), i64::MAX)]);

        let vault = registry.register("vault", 0);
        assert_eq!(
            registry.check_upgrade(vault, 2, &rich),
            Err(UpgradeRejection::InsufficientResource {
                resource: "gold".into(),
                required: i64::MAX,
                available: i64::MAX
            })
        );
        assert!(!registry.request_upgrade(vault, 2, &rich));
        assert_eq!(registry.total_cost_for_increase(vault, 2), None);
        assert_eq!(registry.total_time_for_increase(vault, 2), Some(10));

        let epoch = registry.register("epoch", 0);
        assert_eq!(
            registry.check_upgrade(epoch, 2, &rich),
            Err(UpgradeRejection::DurationOverflow { from: 0, to: 2 })
        );
        assert_eq!(registry.total_time_for_increase(epoch, 2), None);
        assert_eq!(registry.counters().rejected, 1);
        assert!(!registry.is_upgrading(vault));
        assert!(!registry.is_upgrading(epoch));
    }

    #[test]
    fn highest_registrable_level_never_overflows() {
        let mut registry = ProgressionRegistry::new(catalog());
        let id = registry.register("keep", u32::MAX);
        assert_eq!(registry.get_max_level(id), Some(5));
        assert_eq!(registry.get_next_level(id), None);
        assert_eq!(registry.get_next_level_cost(id), None);
        assert_eq!(registry.get_next_level_time(id), None);
        assert_eq!(registry.total_cost_for_increase(id, 1), None);
        assert!(matches!(
            registry.check_upgrade(id, 1, &wood(100)),
            Err(UpgradeRejection::ExceedsMaxLevel { .. })
        ));

        let mut ledger = InMemoryLedger::new().with_balance("wood", 100);
        assert!(registry
            .request_upgrade_with_ledger(id, i32::MAX, &mut ledger)
            .is_err());
        assert_eq!(ledger.get("wood"), 100);
    }

    /// Reports every balance but refuses to debit one resource.
    struct RefusingLedger {
        inner: InMemoryLedger,
        refuse: &'static str,
    }

    impl ResourceLedger for RefusingLedger {
        fn available(&self, resource: &str) -> Option<i64> {
            self.inner.available(resource)
        }

        fn debit(&mut self, resource: &str, amount: i64) -> Result<(), LedgerError> {
            if resource == self.refuse {
                return Err(LedgerError::Insufficient {
                    resource: resource.to_string(),
                    available: 0,
                    requested: amount,
                });
            }
            self.inner.debit(resource, amount)
        }

        fn credit(&mut self, resource: &str, amount: i64) {
            self.inner.credit(resource, amount);
        }
    }

    #[test]
    fn failed_ledger_debit_refunds_earlier_debits() {
        let forge = RawPathRecord::new("forge", 1)
            .with_override(level(0, 1, 0))
            .with_override(LevelOverride {
                level: 1,
                resource_costs: vec![("wood".into(), 4), ("stone".into(), 6)],
                upgrade_seconds: Some(10),
                locked: false,
            });
        let catalog = CatalogCompiler::new().compile(vec![forge]).catalog;
        let mut registry = ProgressionRegistry::new(Arc::new(catalog));
        let id = registry.register("forge", 0);
        let mut ledger = RefusingLedger {
            inner: InMemoryLedger::new()
                .with_balance("stone", 50)
                .with_balance("wood", 50),
            refuse: "wood",
        };

        let err = registry
            .request_upgrade_with_ledger(id, 1, &mut ledger)
            .expect_err("wood debit is refused");
        assert!(matches!(err, UpgradeRejection::InsufficientResource { ref resource, .. } if resource == "wood"));
        assert_eq!(ledger.inner.get("stone"), 50);
        assert_eq!(ledger.inner.get("wood"), 50);
        assert!(!registry.is_upgrading(id));
        assert_eq!(registry.scheduler().pending_count(), 0);
        assert_eq!(registry.counters().rejected, 1);
        assert!(registry.drain_events().is_empty());
    }

    #[test]
    fn short_ledger_is_not_debited_at_all() {
        let mut registry = ProgressionRegistry::new(catalog());
        let id = registry.register("keep", 0);
        let mut ledger = InMemoryLedger::new().with_balance("wood", 20);
        assert!(registry.request_upgrade_with_ledger(id, 2, &mut ledger).is_err());
        assert_eq!(ledger.get("wood"), 20);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "not live")]
    fn double_unregister_panics_in_debug() {
        let mut registry = ProgressionRegistry::new(catalog());
        let id = registry.register("keep", 0);
        registry.unregister(id);
        registry.unregister(id);
    }
}
