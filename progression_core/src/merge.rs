//! Combining several tracked entities into one upgraded entity.

use std::collections::HashSet;

use thiserror::Error;

use crate::ledger::ResourceAmounts;
use crate::registry::{EntityId, ProgressionRegistry, UpgradeRejection};
use crate::scheduler::UpgradeScheduler;

/// Which properties merged entities must share, on top of aspect and category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeMode {
    /// Same path, any level.
    Combine,
    /// Same path and same level.
    Merge,
    /// Same level, any path.
    Fuse,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MergeRejection {
    #[error("merge group size {0} must be positive")]
    NonPositiveCount(i32),
    #[error("merge needs {needed} entities, {provided} provided")]
    NotEnoughEntities { needed: usize, provided: usize },
    #[error("entity {0} is not registered")]
    UnknownEntity(EntityId),
    #[error("entity {0} appears more than once")]
    DuplicateEntity(EntityId),
    #[error("entities {0} and {1} have different aspects")]
    AspectMismatch(EntityId, EntityId),
    #[error("entities {0} and {1} have different categories")]
    CategoryMismatch(EntityId, EntityId),
    #[error("entities {0} and {1} follow different upgrade paths")]
    PathMismatch(EntityId, EntityId),
    #[error("entities {0} and {1} are at different levels")]
    LevelMismatch(EntityId, EntityId),
    #[error("merged entity cannot upgrade: {0}")]
    Upgrade(#[from] UpgradeRejection),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// First entity of every merged group, each raised by one level.
    pub upgraded: Vec<EntityId>,
    /// Entities folded into an upgraded one and unregistered.
    pub consumed: Vec<EntityId>,
}

/// Checks that the first `count` entities of `ids` can be merged under `mode`.
pub fn check_merge<S: UpgradeScheduler>(
    registry: &ProgressionRegistry<S>,
    ids: &[EntityId],
    count: i32,
    mode: MergeMode,
) -> Result<(), MergeRejection> {
    if count <= 0 {
        return Err(MergeRejection::NonPositiveCount(count));
    }
    let needed = count as usize;
    if ids.len() < needed {
        return Err(MergeRejection::NotEnoughEntities {
            needed,
            provided: ids.len(),
        });
    }

    let group = &ids[..needed];
    let mut seen = HashSet::with_capacity(needed);
    for id in group {
        if !seen.insert(*id) {
            return Err(MergeRejection::DuplicateEntity(*id));
        }
    }

    for pair in group.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let left = registry.get(a).ok_or(MergeRejection::UnknownEntity(a))?;
        let right = registry.get(b).ok_or(MergeRejection::UnknownEntity(b))?;
        if left.aspect() != right.aspect() {
            return Err(MergeRejection::AspectMismatch(a, b));
        }
        if left.category() != right.category() {
            return Err(MergeRejection::CategoryMismatch(a, b));
        }
        let same_path = left.path_id() == right.path_id();
        let same_level = left.current_level() == right.current_level();
        match mode {
            MergeMode::Combine if !same_path => return Err(MergeRejection::PathMismatch(a, b)),
            MergeMode::Merge if !same_path => return Err(MergeRejection::PathMismatch(a, b)),
            MergeMode::Merge | MergeMode::Fuse if !same_level => {
                return Err(MergeRejection::LevelMismatch(a, b))
            }
            _ => {}
        }
    }
    if needed == 1 && !registry.contains(group[0]) {
        return Err(MergeRejection::UnknownEntity(group[0]));
    }
    Ok(())
}

pub fn can_merge<S: UpgradeScheduler>(
    registry: &ProgressionRegistry<S>,
    ids: &[EntityId],
    count: i32,
    mode: MergeMode,
) -> bool {
    check_merge(registry, ids, count, mode).is_ok()
}

/// Merges `ids` in consecutive groups of `count`: the first entity of each
/// group is upgraded by one level and the rest are unregistered. Groups keep
/// being merged while enough entities remain and each upgrade succeeds.
/// Costs of earlier groups are deducted from `available` before later ones.
pub fn handle_merge<S: UpgradeScheduler>(
    registry: &mut ProgressionRegistry<S>,
    ids: &[EntityId],
    count: i32,
    mode: MergeMode,
    available: &ResourceAmounts,
) -> Result<MergeOutcome, MergeRejection> {
    check_merge(registry, ids, count, mode)?;
    let group_size = count as usize;
    let mut remaining_resources = available.clone();
    let mut outcome = MergeOutcome::default();

    for group in ids.chunks_exact(group_size) {
        if !outcome.upgraded.is_empty() && check_merge(registry, group, count, mode).is_err() {
            break;
        }
        let target = group[0];
        let quote = match registry.check_upgrade(target, 1, &remaining_resources) {
            Ok(quote) => quote,
            Err(reason) if outcome.upgraded.is_empty() => return Err(reason.into()),
            Err(_) => break,
        };
        if !registry.request_upgrade(target, 1, &remaining_resources) {
            break;
        }
        for (resource, amount) in &quote.total_costs {
            if let Some(balance) = remaining_resources.get_mut(resource) {
                *balance -= amount;
            }
        }
        for consumed in &group[1..] {
            registry.unregister(*consumed);
            outcome.consumed.push(*consumed);
        }
        outcome.upgraded.push(target);
    }

    tracing::debug!(
        target: "upgrade::registry",
        ?mode,
        upgraded = outcome.upgraded.len(),
        consumed = outcome.consumed.len(),
        "merge.handled"
    );
    Ok(outcome)
}
