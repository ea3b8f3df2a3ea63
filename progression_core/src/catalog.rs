//! Compiles raw path records into gap-free per-level requirement tables.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    hash::Hasher,
    sync::Arc,
};

use bevy::prelude::Resource;
use serde::Serialize;

use crate::diagnostics::{CompileDiagnostic, DiagnosticCode, DiagnosticSink};
use crate::hashing::FnvHasher;
use crate::ledger::ResourceCosts;
use crate::records::RawPathRecord;
use crate::resource_types::{ResourceIndex, ResourceTypeTable};
use crate::scaling::{
    CustomScalingRegistry, RawSegment, ScalingError, ScalingEvaluator, ScalingMode,
    ScalingSegment, SegmentModeError, SeriesTarget,
};
use crate::sources::LoadedSource;

/// Highest max level a path may declare. Compilation allocates one slot per level.
pub const MAX_PATH_LEVEL: u32 = 10_000;

/// Cost and duration for reaching one level from the level below it.
///
/// `resource_indices` and `resource_costs` are parallel and never contain
/// the same index twice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LevelRequirement {
    pub resource_indices: Vec<ResourceIndex>,
    pub resource_costs: Vec<i64>,
    pub upgrade_seconds: i64,
    pub locked: bool,
}

impl LevelRequirement {
    pub fn cost_of(&self, resource: ResourceIndex) -> Option<i64> {
        self.resource_indices
            .iter()
            .position(|index| *index == resource)
            .map(|position| self.resource_costs[position])
    }

    pub fn set_cost(&mut self, resource: ResourceIndex, amount: i64) {
        match self
            .resource_indices
            .iter()
            .position(|index| *index == resource)
        {
            Some(position) => self.resource_costs[position] = amount,
            None => {
                self.resource_indices.push(resource);
                self.resource_costs.push(amount);
            }
        }
    }

    pub fn remove_cost(&mut self, resource: ResourceIndex) -> Option<i64> {
        let position = self
            .resource_indices
            .iter()
            .position(|index| *index == resource)?;
        self.resource_indices.remove(position);
        Some(self.resource_costs.remove(position))
    }

    pub fn costs(&self) -> impl Iterator<Item = (ResourceIndex, i64)> + '_ {
        self.resource_indices
            .iter()
            .copied()
            .zip(self.resource_costs.iter().copied())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathCatalog {
    pub path_id: String,
    pub levels: Vec<LevelRequirement>,
}

impl PathCatalog {
    pub fn max_level(&self) -> u32 {
        self.levels.len().saturating_sub(1) as u32
    }

    pub fn level(&self, level: u32) -> Option<&LevelRequirement> {
        self.levels.get(level as usize)
    }
}

/// Immutable compile output. Published behind an `Arc` and replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpgradeCatalog {
    paths: BTreeMap<String, PathCatalog>,
    resource_types: ResourceTypeTable,
    fingerprint: u64,
}

impl UpgradeCatalog {
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn path(&self, path_id: &str) -> Option<&PathCatalog> {
        self.paths.get(path_id)
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathCatalog> {
        self.paths.values()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn resource_types(&self) -> &ResourceTypeTable {
        &self.resource_types
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Converts a requirement's indices back into resource names.
    pub fn named_costs(&self, requirement: &LevelRequirement) -> ResourceCosts {
        requirement
            .costs()
            .filter_map(|(index, amount)| {
                self.resource_types
                    .name(index)
                    .map(|name| (name.to_string(), amount))
            })
            .collect()
    }

    fn compute_fingerprint(&self) -> u64 {
        let mut hasher = FnvHasher::new();
        for path in self.paths.values() {
            hasher.write_str_field(&path.path_id);
            hasher.write_u64(path.levels.len() as u64);
            for level in &path.levels {
                for (index, amount) in level.costs() {
                    hasher.write_str_field(self.resource_types.name(index).unwrap_or_default());
                    hasher.write_i64(amount);
                }
                hasher.write_i64(level.upgrade_seconds);
                hasher.write_u8(level.locked as u8);
            }
        }
        hasher.finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompileReport {
    pub catalog: UpgradeCatalog,
    pub diagnostics: Vec<CompileDiagnostic>,
    pub processed_levels: usize,
}

impl CompileReport {
    pub fn structural_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|diagnostic| diagnostic.is_structural())
            .count()
    }

    pub fn has_code(&self, code: DiagnosticCode) -> bool {
        self.diagnostics.iter().any(|diagnostic| diagnostic.code == code)
    }
}

/// Owns the process-wide resource type table and the custom scaling hooks.
#[derive(Resource, Debug, Default)]
pub struct CatalogCompiler {
    resource_types: ResourceTypeTable,
    custom: CustomScalingRegistry,
}

impl CatalogCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_custom_functions(custom: CustomScalingRegistry) -> Self {
        Self {
            resource_types: ResourceTypeTable::new(),
            custom,
        }
    }

    pub fn custom_functions_mut(&mut self) -> &mut CustomScalingRegistry {
        &mut self.custom
    }

    pub fn resource_types(&self) -> &ResourceTypeTable {
        &self.resource_types
    }

    pub fn compile_sources(&mut self, sources: Vec<LoadedSource>) -> CompileReport {
        let mut records = Vec::new();
        let mut loader_diagnostics = Vec::new();
        for source in sources {
            let (raw, diagnostics) = source.into_raw();
            records.extend(raw);
            loader_diagnostics.extend(diagnostics);
        }
        let mut report = self.compile(records);
        loader_diagnostics.append(&mut report.diagnostics);
        report.diagnostics = loader_diagnostics;
        report
    }

    pub fn compile(&mut self, records: Vec<RawPathRecord>) -> CompileReport {
        let mut sink = DiagnosticSink::default();
        let mut paths: BTreeMap<String, PathCatalog> = BTreeMap::new();
        let mut processed_levels = 0;

        for record in records {
            if record.path_id.trim().is_empty() {
                sink.push(CompileDiagnostic::new(
                    DiagnosticCode::EmptyPath,
                    &record.origin,
                    None,
                    "record has no path id",
                ));
                continue;
            }
            let Some((path, processed)) = self.compile_path(&record, &mut sink) else {
                continue;
            };
            processed_levels += processed;
            if paths.insert(path.path_id.clone(), path).is_some() {
                sink.push(CompileDiagnostic::new(
                    DiagnosticCode::DuplicatePath,
                    &record.origin,
                    Some(&record.path_id),
                    "path defined again; the earlier definition is discarded",
                ));
            }
        }

        let mut catalog = UpgradeCatalog {
            paths,
            resource_types: self.resource_types.clone(),
            fingerprint: 0,
        };
        catalog.fingerprint = catalog.compute_fingerprint();
        tracing::info!(
            target: "upgrade::catalog",
            paths = catalog.len(),
            processed_levels,
            fingerprint = catalog.fingerprint,
            "upgrade_catalog.compiled"
        );
        CompileReport {
            catalog,
            diagnostics: sink.into_inner(),
            processed_levels,
        }
    }

    fn compile_path(
        &mut self,
        record: &RawPathRecord,
        sink: &mut DiagnosticSink,
    ) -> Option<(PathCatalog, usize)> {
        let path_id = record.path_id.as_str();
        let origin = record.origin.as_str();

        match record.overrides.first() {
            Some(first) if first.level == 0 => {}
            Some(first) => {
                sink.push(CompileDiagnostic::new(
                    DiagnosticCode::MissingLevelZero,
                    origin,
                    Some(path_id),
                    format!(
                        "first level override declares level {}; level 0 must come first",
                        first.level
                    ),
                ));
                return None;
            }
            None => {
                sink.push(CompileDiagnostic::new(
                    DiagnosticCode::MissingLevelZero,
                    origin,
                    Some(path_id),
                    "no level overrides; level 0 must be defined explicitly",
                ));
                return None;
            }
        }

        if record.max_level > MAX_PATH_LEVEL {
            sink.push(CompileDiagnostic::new(
                DiagnosticCode::MaxLevelOutOfRange,
                origin,
                Some(path_id),
                format!(
                    "max level {} is above the limit of {MAX_PATH_LEVEL}",
                    record.max_level
                ),
            ));
            return None;
        }
        let mut work = PathWork::new(record.max_level);

        for level_override in &record.overrides {
            let level = match u32::try_from(level_override.level) {
                Ok(level) if level <= record.max_level => level,
                _ => {
                    sink.push(CompileDiagnostic::new(
                        DiagnosticCode::LevelOutOfRange,
                        origin,
                        Some(path_id),
                        format!(
                            "override for level {} is outside 0..={}",
                            level_override.level, record.max_level
                        ),
                    ));
                    continue;
                }
            };
            let slot = &mut work.levels[level as usize];
            slot.touched = true;
            slot.locked = level_override.locked;
            for (resource, amount) in &level_override.resource_costs {
                let index = self.resource_types.intern(resource);
                slot.requirement.set_cost(index, *amount);
                if *amount >= 0 {
                    work.seeds.entry(index).or_insert(*amount);
                }
            }
            if let Some(seconds) = level_override.upgrade_seconds {
                slot.seconds = Some(seconds);
                if seconds >= 0 && work.time_seed.is_none() {
                    work.time_seed = Some(seconds);
                }
            }
        }

        let evaluator = ScalingEvaluator::new(&self.custom, path_id);
        let mut seen_series = HashSet::new();
        for (resource, segments) in &record.cost_segments {
            if !seen_series.insert(resource.as_str()) {
                sink.push(CompileDiagnostic::new(
                    DiagnosticCode::MalformedSegment,
                    origin,
                    Some(path_id),
                    format!("scaling for resource '{resource}' listed twice; later list ignored"),
                ));
                continue;
            }
            let Some(index) = self.resource_types.index_of(resource) else {
                unseeded(sink, origin, path_id, resource);
                continue;
            };
            let Some(seed) = work.seeds.get(&index).copied() else {
                unseeded(sink, origin, path_id, resource);
                continue;
            };
            let series = SeriesTarget::Resource(resource);
            let segments = resolve_segments(segments, &self.custom, series, origin, path_id, sink);
            apply_series(
                &mut work,
                &segments,
                seed,
                record.max_level,
                series,
                &evaluator,
                &SeriesSlot::Resource(index),
                origin,
                path_id,
                sink,
            );
        }

        if !record.time_segments.is_empty() {
            let series = SeriesTarget::Time;
            let segments =
                resolve_segments(&record.time_segments, &self.custom, series, origin, path_id, sink);
            let seed = work.time_seed.unwrap_or(0);
            apply_series(
                &mut work,
                &segments,
                seed,
                record.max_level,
                series,
                &evaluator,
                &SeriesSlot::Time,
                origin,
                path_id,
                sink,
            );
        }

        let processed = work.levels.iter().filter(|level| level.touched).count();
        if processed == 0 {
            sink.push(CompileDiagnostic::new(
                DiagnosticCode::EmptyPath,
                origin,
                Some(path_id),
                "no level was processed; path omitted",
            ));
            return None;
        }

        let levels = work
            .levels
            .into_iter()
            .enumerate()
            .map(|(level, slot)| finalize_level(level, slot, &self.resource_types, origin, path_id, sink))
            .collect();
        Some((
            PathCatalog {
                path_id: path_id.to_string(),
                levels,
            },
            processed,
        ))
    }
}

fn unseeded(sink: &mut DiagnosticSink, origin: &str, path_id: &str, resource: &str) {
    sink.push(CompileDiagnostic::new(
        DiagnosticCode::UnseededResource,
        origin,
        Some(path_id),
        format!("scaling for resource '{resource}' has no non-negative override to start from"),
    ));
}

#[derive(Debug, Default)]
struct LevelWork {
    requirement: LevelRequirement,
    seconds: Option<i64>,
    locked: bool,
    touched: bool,
}

#[derive(Debug)]
struct PathWork {
    levels: Vec<LevelWork>,
    seeds: HashMap<ResourceIndex, i64>,
    time_seed: Option<i64>,
}

impl PathWork {
    fn new(max_level: u32) -> Self {
        Self {
            levels: (0..=max_level).map(|_| LevelWork::default()).collect(),
            seeds: HashMap::new(),
            time_seed: None,
        }
    }
}

enum SeriesSlot {
    Resource(ResourceIndex),
    Time,
}

impl SeriesSlot {
    fn explicit(&self, level: &LevelWork) -> Option<i64> {
        match self {
            SeriesSlot::Resource(index) => level.requirement.cost_of(*index),
            SeriesSlot::Time => level.seconds,
        }
    }

    fn store(&self, level: &mut LevelWork, value: i64) {
        match self {
            SeriesSlot::Resource(index) => level.requirement.set_cost(*index, value),
            SeriesSlot::Time => level.seconds = Some(value),
        }
    }
}

/// Resolved segment, or `None` for one that was skipped but still occupies
/// its level range.
type ResolvedSegment = (i64, i64, Option<ScalingSegment>);

fn resolve_segments(
    raw: &[RawSegment],
    custom: &CustomScalingRegistry,
    series: SeriesTarget<'_>,
    origin: &str,
    path_id: &str,
    sink: &mut DiagnosticSink,
) -> Vec<ResolvedSegment> {
    let mut ordered: Vec<&RawSegment> = raw.iter().collect();
    ordered.sort_by_key(|segment| segment.start_level);
    ordered
        .into_iter()
        .map(|segment| {
            let resolved = match segment.resolve_mode() {
                Ok(ScalingMode::Custom { function }) if !custom.contains(&function) => {
                    sink.push(CompileDiagnostic::new(
                        DiagnosticCode::UnknownCustomFunction,
                        origin,
                        Some(path_id),
                        format!(
                            "{series} segment {}..={} uses unregistered function '{function}'; skipped",
                            segment.start_level, segment.end_level
                        ),
                    ));
                    None
                }
                Ok(mode) => u32::try_from(segment.start_level)
                    .ok()
                    .zip(u32::try_from(segment.end_level).ok())
                    .map(|(start_level, end_level)| ScalingSegment {
                        start_level,
                        end_level,
                        mode,
                    }),
                Err(err) => {
                    let code = match err {
                        SegmentModeError::UnknownMode(_) => DiagnosticCode::UnknownScalingMode,
                        _ => DiagnosticCode::MalformedSegment,
                    };
                    sink.push(CompileDiagnostic::new(
                        code,
                        origin,
                        Some(path_id),
                        format!(
                            "{series} segment {}..={} skipped: {err}",
                            segment.start_level, segment.end_level
                        ),
                    ));
                    None
                }
            };
            (segment.start_level, segment.end_level, resolved)
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn apply_series(
    work: &mut PathWork,
    segments: &[ResolvedSegment],
    seed: i64,
    max_level: u32,
    series: SeriesTarget<'_>,
    evaluator: &ScalingEvaluator<'_>,
    slot: &SeriesSlot,
    origin: &str,
    path_id: &str,
    sink: &mut DiagnosticSink,
) {
    let mut previous = seed;
    let mut expected_start: i64 = 1;

    for (start, end, segment) in segments {
        let (start, end) = (*start, *end);
        if start != expected_start || end < start {
            sink.push(CompileDiagnostic::new(
                DiagnosticCode::NonContiguousSegment,
                origin,
                Some(path_id),
                format!(
                    "{series} segment {start}..={end} does not continue at level {expected_start}; series aborted"
                ),
            ));
            return;
        }
        if end > i64::from(max_level) {
            sink.push(CompileDiagnostic::new(
                DiagnosticCode::SegmentBeyondMaxLevel,
                origin,
                Some(path_id),
                format!("{series} segment {start}..={end} runs past max level {max_level}; series aborted"),
            ));
            return;
        }
        expected_start = end + 1;

        let Some(segment) = segment else {
            continue;
        };
        for level in segment.start_level..=segment.end_level {
            let explicit = slot.explicit(&work.levels[level as usize]);
            if let Some(rebase) = explicit.filter(|value| *value > 0) {
                work.levels[level as usize].touched = true;
                previous = rebase;
                continue;
            }
            let scaled = match evaluator.evaluate(segment, previous, level, series) {
                Ok(value) => value,
                Err(err) => {
                    let code = match err {
                        ScalingError::OutOfRange { .. } => DiagnosticCode::ValueOutOfRange,
                        ScalingError::UnknownCustomFunction(_) => DiagnosticCode::UnknownCustomFunction,
                    };
                    sink.push(CompileDiagnostic::new(
                        code,
                        origin,
                        Some(path_id),
                        format!(
                            "{series} level {level}: {err}; levels {level}..={} of this segment left unscaled",
                            segment.end_level
                        ),
                    ));
                    break;
                }
            };
            let level_work = &mut work.levels[level as usize];
            level_work.touched = true;
            if explicit != Some(0) {
                slot.store(level_work, scaled);
            }
            previous = scaled;
        }
    }

    if expected_start <= i64::from(max_level) {
        sink.push(CompileDiagnostic::new(
            DiagnosticCode::SeriesIncomplete,
            origin,
            Some(path_id),
            format!(
                "{series} segments stop at level {}; levels up to {max_level} are not scaled",
                expected_start - 1
            ),
        ));
    }
}

fn finalize_level(
    level: usize,
    slot: LevelWork,
    resource_types: &ResourceTypeTable,
    origin: &str,
    path_id: &str,
    sink: &mut DiagnosticSink,
) -> LevelRequirement {
    let LevelWork {
        mut requirement,
        seconds,
        locked,
        ..
    } = slot;

    let unresolved: Vec<ResourceIndex> = requirement
        .costs()
        .filter(|(_, amount)| *amount < 0)
        .map(|(index, _)| index)
        .collect();
    for index in unresolved {
        requirement.remove_cost(index);
        sink.push(CompileDiagnostic::new(
            DiagnosticCode::UnresolvedSentinel,
            origin,
            Some(path_id),
            format!(
                "level {level} cost for '{}' was left to scaling but no segment covered it; dropped",
                resource_types.name(index).unwrap_or("?")
            ),
        ));
    }

    requirement.upgrade_seconds = match seconds {
        Some(seconds) if seconds < 0 => {
            sink.push(CompileDiagnostic::new(
                DiagnosticCode::UnresolvedSentinel,
                origin,
                Some(path_id),
                format!("level {level} upgrade time was left to scaling but no segment covered it; using 0"),
            ));
            0
        }
        Some(seconds) => seconds,
        None => 0,
    };
    requirement.locked = locked;
    debug_assert!(
        {
            let mut seen = HashSet::new();
            requirement.resource_indices.iter().all(|index| seen.insert(*index))
        },
        "duplicate resource index in level requirement"
    );
    requirement
}
