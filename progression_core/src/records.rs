//! Data-source record shapes and their normalization into [`RawPathRecord`].
//!
//! Three shapes are accepted: the flat per-level list (key names taken from
//! [`FieldNames`]), the scaling shape with level overrides plus scaling
//! segments, and table rows exported one row per level.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::catalog::MAX_PATH_LEVEL;
use crate::diagnostics::{CompileDiagnostic, DiagnosticCode, DiagnosticSink};
use crate::scaling::RawSegment;
use crate::settings::FieldNames;

/// Explicit values for one level. Resource values: `0` frees the level,
/// positive values rebase the series, negative values defer to scaling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LevelOverride {
    pub level: i64,
    pub resource_costs: Vec<(String, i64)>,
    pub upgrade_seconds: Option<i64>,
    pub locked: bool,
}

/// The single intermediate form every data source is converted into.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPathRecord {
    pub path_id: String,
    pub origin: String,
    pub max_level: u32,
    pub overrides: Vec<LevelOverride>,
    pub cost_segments: Vec<(String, Vec<RawSegment>)>,
    pub time_segments: Vec<RawSegment>,
}

impl RawPathRecord {
    pub fn new(path_id: impl Into<String>, max_level: u32) -> Self {
        Self {
            path_id: path_id.into(),
            origin: "<memory>".into(),
            max_level,
            ..Default::default()
        }
    }

    pub fn with_override(mut self, level_override: LevelOverride) -> Self {
        self.overrides.push(level_override);
        self
    }

    pub fn with_cost_segments(mut self, resource: impl Into<String>, segments: Vec<RawSegment>) -> Self {
        self.cost_segments.push((resource.into(), segments));
        self
    }

    pub fn with_time_segments(mut self, segments: Vec<RawSegment>) -> Self {
        self.time_segments = segments;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleLevel {
    pub resources: Vec<(String, i64)>,
    pub upgrade_seconds: i64,
    pub locked: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimplePathRecord {
    pub path_id: String,
    pub levels: Vec<SimpleLevel>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScalingPathRecord {
    #[serde(rename = "UpgradePathId")]
    pub path_id: Option<String>,
    #[serde(rename = "MaxLevel")]
    pub max_level: Option<i64>,
    #[serde(rename = "LevelOverrides")]
    pub level_overrides: Vec<Value>,
    #[serde(rename = "CostScalingSegments")]
    pub cost_scaling_segments: BTreeMap<String, Value>,
    #[serde(rename = "TimeScalingSegments")]
    pub time_scaling_segments: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub name: String,
    pub resource_costs: Vec<(String, i64)>,
    pub upgrade_seconds: i64,
    pub locked: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TablePathRecord {
    pub path_id: String,
    pub rows: Vec<TableRow>,
}

/// One path definition as read from a data source, tagged by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRecord {
    Simple(SimplePathRecord),
    Scaling { path_id: String, record: ScalingPathRecord },
    TableRows(TablePathRecord),
}

impl SourceRecord {
    pub fn path_id(&self) -> &str {
        match self {
            SourceRecord::Simple(record) => &record.path_id,
            SourceRecord::Scaling { path_id, .. } => path_id,
            SourceRecord::TableRows(record) => &record.path_id,
        }
    }

    pub fn shape(&self) -> &'static str {
        match self {
            SourceRecord::Simple(_) => "simple",
            SourceRecord::Scaling { .. } => "scaling",
            SourceRecord::TableRows(_) => "table",
        }
    }

    /// Converts to the compiler's intermediate form. Entries that cannot be
    /// read are skipped and reported; a record whose max level cannot be
    /// represented yields no path at all.
    pub fn into_raw(self, origin: &str) -> (Option<RawPathRecord>, Vec<CompileDiagnostic>) {
        let mut sink = DiagnosticSink::default();
        let raw = match self {
            SourceRecord::Simple(record) => {
                let levels = record
                    .levels
                    .into_iter()
                    .map(|level| (level.resources, level.upgrade_seconds, level.locked));
                Some(explicit_levels_to_raw(record.path_id, origin, levels, &mut sink))
            }
            SourceRecord::TableRows(record) => {
                let rows = record
                    .rows
                    .into_iter()
                    .map(|row| (row.resource_costs, row.upgrade_seconds, row.locked));
                Some(explicit_levels_to_raw(record.path_id, origin, rows, &mut sink))
            }
            SourceRecord::Scaling { path_id, record } => {
                scaling_to_raw(path_id, origin, record, &mut sink)
            }
        };
        (raw, sink.into_inner())
    }
}

fn explicit_levels_to_raw(
    path_id: String,
    origin: &str,
    levels: impl Iterator<Item = (Vec<(String, i64)>, i64, bool)>,
    sink: &mut DiagnosticSink,
) -> RawPathRecord {
    let mut raw = RawPathRecord {
        path_id,
        origin: origin.to_string(),
        ..Default::default()
    };
    for (level, (resource_costs, upgrade_seconds, locked)) in levels.enumerate() {
        if resource_costs.is_empty() {
            sink.push(CompileDiagnostic::new(
                DiagnosticCode::EmptyLevel,
                origin,
                Some(&raw.path_id),
                format!("level {level} defines no resource costs; kept as a zero-cost level"),
            ));
        }
        raw.overrides.push(LevelOverride {
            level: level as i64,
            resource_costs,
            upgrade_seconds: Some(upgrade_seconds),
            locked,
        });
    }
    raw.max_level = raw.overrides.len().saturating_sub(1) as u32;
    raw
}

fn scaling_to_raw(
    path_id: String,
    origin: &str,
    record: ScalingPathRecord,
    sink: &mut DiagnosticSink,
) -> Option<RawPathRecord> {
    let declared = record.max_level.unwrap_or(1);
    let max_level = match u32::try_from(declared) {
        Ok(max_level) if max_level <= MAX_PATH_LEVEL => max_level,
        _ => {
            sink.push(CompileDiagnostic::new(
                DiagnosticCode::MaxLevelOutOfRange,
                origin,
                Some(&path_id),
                format!("MaxLevel {declared} is outside 0..={MAX_PATH_LEVEL}; path skipped"),
            ));
            return None;
        }
    };
    let mut raw = RawPathRecord {
        path_id,
        origin: origin.to_string(),
        max_level,
        ..Default::default()
    };

    for (position, value) in record.level_overrides.iter().enumerate() {
        match parse_level_override(value) {
            Ok(level_override) => raw.overrides.push(level_override),
            Err(reason) => sink.push(CompileDiagnostic::new(
                DiagnosticCode::MalformedLevel,
                origin,
                Some(&raw.path_id),
                format!("level override #{position} skipped: {reason}"),
            )),
        }
    }

    for (resource, value) in record.cost_scaling_segments {
        let segments = match value.get("ScalingSegments").and_then(Value::as_array) {
            Some(segments) => segments,
            None => {
                sink.push(CompileDiagnostic::new(
                    DiagnosticCode::MalformedSegment,
                    origin,
                    Some(&raw.path_id),
                    format!("cost scaling for '{resource}' has no 'ScalingSegments' array"),
                ));
                continue;
            }
        };
        let parsed = parse_segments(segments, &resource, origin, &raw.path_id, sink);
        raw.cost_segments.push((resource, parsed));
    }

    raw.time_segments = parse_segments(
        &record.time_scaling_segments,
        "upgrade time",
        origin,
        &raw.path_id,
        sink,
    );
    Some(raw)
}

fn parse_segments(
    values: &[Value],
    series: &str,
    origin: &str,
    path_id: &str,
    sink: &mut DiagnosticSink,
) -> Vec<RawSegment> {
    values
        .iter()
        .enumerate()
        .filter_map(|(position, value)| {
            match serde_json::from_value::<RawSegment>(value.clone()) {
                Ok(segment) => Some(segment),
                Err(err) => {
                    sink.push(CompileDiagnostic::new(
                        DiagnosticCode::MalformedSegment,
                        origin,
                        Some(path_id),
                        format!("segment #{position} for {series} skipped: {err}"),
                    ));
                    None
                }
            }
        })
        .collect()
}

fn parse_level_override(value: &Value) -> Result<LevelOverride, String> {
    let object = value.as_object().ok_or("not an object")?;
    let level = object
        .get("UpgradeLevel")
        .and_then(as_integer)
        .ok_or("missing 'UpgradeLevel'")?;

    let mut resource_costs = Vec::new();
    if let Some(costs) = object.get("UpgradeResourceCosts") {
        let costs = costs
            .as_object()
            .ok_or("'UpgradeResourceCosts' is not an object")?;
        for (name, amount) in costs {
            let amount = as_integer(amount)
                .ok_or_else(|| format!("cost for '{name}' is not a number"))?;
            resource_costs.push((name.clone(), amount));
        }
    }

    Ok(LevelOverride {
        level,
        resource_costs,
        upgrade_seconds: object.get("UpgradeSeconds").and_then(as_integer),
        locked: object
            .get("bUpgradeLocked")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

/// Reads a simple-shape path object using the configured key names.
pub fn parse_simple_record(
    value: &Value,
    fallback_path_id: &str,
    names: &FieldNames,
    origin: &str,
) -> Result<(SimplePathRecord, Vec<CompileDiagnostic>), String> {
    let object = value.as_object().ok_or("path entry is not an object")?;
    let path_id = object
        .get(&names.upgrade_path)
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .unwrap_or(fallback_path_id)
        .to_string();
    let levels = object
        .get(&names.levels)
        .and_then(Value::as_array)
        .ok_or_else(|| format!("missing '{}' array", names.levels))?;

    let mut sink = DiagnosticSink::default();
    let mut parsed = Vec::with_capacity(levels.len());
    for (index, level) in levels.iter().enumerate() {
        let Some(level_object) = level.as_object() else {
            sink.push(CompileDiagnostic::new(
                DiagnosticCode::MalformedLevel,
                origin,
                Some(&path_id),
                format!("level {index} is not an object; kept as a zero-cost level"),
            ));
            parsed.push(SimpleLevel {
                resources: Vec::new(),
                upgrade_seconds: 0,
                locked: false,
            });
            continue;
        };

        let mut resources = Vec::new();
        let entries = level_object
            .get(&names.resources)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for entry in entries {
            let resource = entry
                .get(&names.resource_type)
                .and_then(Value::as_str)
                .filter(|name| !name.trim().is_empty());
            let amount = entry.get(&names.resource_amount).and_then(as_integer);
            match (resource, amount) {
                (Some(resource), Some(amount)) => {
                    merge_cost(&mut resources, resource, amount);
                }
                _ => sink.push(CompileDiagnostic::new(
                    DiagnosticCode::MalformedResource,
                    origin,
                    Some(&path_id),
                    format!(
                        "level {index} resource entry needs '{}' and '{}'",
                        names.resource_type, names.resource_amount
                    ),
                )),
            }
        }

        parsed.push(SimpleLevel {
            resources,
            upgrade_seconds: level_object
                .get(&names.upgrade_seconds)
                .and_then(as_integer)
                .unwrap_or(0),
            locked: level_object
                .get(&names.upgrade_locked)
                .and_then(Value::as_bool)
                .unwrap_or(false),
        });
    }

    Ok((
        SimplePathRecord {
            path_id,
            levels: parsed,
        },
        sink.into_inner(),
    ))
}

/// Reads table rows (one row per level, in order) for a path named after the table.
pub fn parse_table_rows(
    rows: &[Value],
    path_id: &str,
    origin: &str,
) -> (TablePathRecord, Vec<CompileDiagnostic>) {
    let mut sink = DiagnosticSink::default();
    let mut parsed = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        let name = row
            .get("Name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| index.to_string());
        let mut resource_costs = Vec::new();
        match row.get("UpgradeResourceCosts").and_then(Value::as_object) {
            Some(costs) => {
                for (resource, amount) in costs {
                    match as_integer(amount) {
                        Some(amount) => merge_cost(&mut resource_costs, resource, amount),
                        None => sink.push(CompileDiagnostic::new(
                            DiagnosticCode::MalformedResource,
                            origin,
                            Some(path_id),
                            format!("row '{name}' cost for '{resource}' is not a number"),
                        )),
                    }
                }
            }
            None => sink.push(CompileDiagnostic::new(
                DiagnosticCode::MalformedLevel,
                origin,
                Some(path_id),
                format!("row '{name}' has no 'UpgradeResourceCosts' object"),
            )),
        }
        parsed.push(TableRow {
            name,
            resource_costs,
            upgrade_seconds: row
                .get("UpgradeSeconds")
                .and_then(as_integer)
                .unwrap_or(0),
            locked: row
                .get("bUpgradeLocked")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        });
    }
    (
        TablePathRecord {
            path_id: path_id.to_string(),
            rows: parsed,
        },
        sink.into_inner(),
    )
}

fn merge_cost(costs: &mut Vec<(String, i64)>, resource: &str, amount: i64) {
    match costs.iter_mut().find(|(name, _)| name == resource) {
        Some((_, existing)) => *existing = existing.saturating_add(amount),
        None => costs.push((resource.to_string(), amount)),
    }
}

pub(crate) fn as_integer(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|number| number.round() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn simple_record_honours_custom_field_names() {
        let names = FieldNames {
            levels: "Tiers".into(),
            resource_amount: "Qty".into(),
            ..FieldNames::default()
        };
        let value = json!({
            "UpgradePath": "farm",
            "Tiers": [
                {"Resources": [{"Type": "wood", "Qty": 10}], "UpgradeSeconds": 0},
                {"Resources": [{"Type": "wood", "Qty": 15}, {"Type": "wood", "Qty": 5}], "UpgradeSeconds": 30, "UpgradeLocked": true}
            ]
        });
        let (record, diagnostics) =
            parse_simple_record(&value, "fallback", &names, "farm.json").expect("parses");
        assert!(diagnostics.is_empty());
        assert_eq!(record.path_id, "farm");
        assert_eq!(record.levels.len(), 2);
        assert_eq!(record.levels[1].resources, vec![("wood".to_string(), 20)]);
        assert!(record.levels[1].locked);
        assert_eq!(record.levels[1].upgrade_seconds, 30);
    }

    #[test]
    fn simple_record_without_levels_is_rejected() {
        let value = json!({"UpgradePath": "farm"});
        let err = parse_simple_record(&value, "farm", &FieldNames::default(), "farm.json")
            .expect_err("levels are required");
        assert!(err.contains("Levels"));
    }

    #[test]
    fn explicit_levels_normalize_to_overrides() {
        let record = SourceRecord::TableRows(TablePathRecord {
            path_id: "walls".into(),
            rows: vec![
                TableRow {
                    name: "L0".into(),
                    resource_costs: vec![("stone".into(), 50)],
                    upgrade_seconds: 0,
                    locked: false,
                },
                TableRow {
                    name: "L1".into(),
                    resource_costs: Vec::new(),
                    upgrade_seconds: 20,
                    locked: false,
                },
            ],
        });
        let (raw, diagnostics) = record.into_raw("walls.json");
        let raw = raw.expect("table rows always convert");
        assert_eq!(raw.max_level, 1);
        assert_eq!(raw.overrides[1].level, 1);
        assert_eq!(raw.overrides[1].upgrade_seconds, Some(20));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, DiagnosticCode::EmptyLevel);
    }

    #[test]
    fn scaling_record_skips_malformed_entries() {
        let record: ScalingPathRecord = serde_json::from_value(json!({
            "UpgradePathId": "barracks",
            "MaxLevel": 3,
            "LevelOverrides": [
                {"UpgradeLevel": 0, "UpgradeResourceCosts": {"wood": 10}, "UpgradeSeconds": 5},
                {"UpgradeResourceCosts": {"wood": 99}},
                "garbage"
            ],
            "CostScalingSegments": {
                "wood": {"ScalingSegments": [
                    {"StartLevel": 1, "EndLevel": 3, "ScalingMode": "Linear", "LinearSlope": 5}
                ]},
                "stone": 12
            },
            "TimeScalingSegments": [
                {"StartLevel": "one", "EndLevel": 3}
            ]
        }))
        .expect("record parses");
        let (raw, diagnostics) = SourceRecord::Scaling {
            path_id: "barracks".into(),
            record,
        }
        .into_raw("barracks.json");
        let raw = raw.expect("max level is in range");

        assert_eq!(raw.max_level, 3);
        assert_eq!(raw.overrides.len(), 1);
        assert_eq!(raw.cost_segments.len(), 1);
        assert!(raw.time_segments.is_empty());
        let codes: Vec<_> = diagnostics.iter().map(|d| d.code).collect();
        assert_eq!(
            codes,
            vec![
                DiagnosticCode::MalformedLevel,
                DiagnosticCode::MalformedLevel,
                DiagnosticCode::MalformedSegment,
                DiagnosticCode::MalformedSegment,
            ]
        );
    }

    #[test]
    fn unrepresentable_max_level_skips_the_path() {
        for declared in [json!(4_294_967_296i64), json!(-3), json!(MAX_PATH_LEVEL + 1)] {
            let record: ScalingPathRecord = serde_json::from_value(json!({
                "UpgradePathId": "hall",
                "MaxLevel": declared,
                "LevelOverrides": [{"UpgradeLevel": 0, "UpgradeResourceCosts": {"wood": 1}}]
            }))
            .expect("record parses");
            let (raw, diagnostics) = SourceRecord::Scaling {
                path_id: "hall".into(),
                record,
            }
            .into_raw("hall.json");

            assert!(raw.is_none(), "MaxLevel {declared} produced a path");
            assert_eq!(diagnostics.len(), 1);
            assert_eq!(diagnostics[0].code, DiagnosticCode::MaxLevelOutOfRange);
            assert!(diagnostics[0].message.contains(&declared.to_string()));
        }
    }
}
