use std::{collections::HashMap, fmt, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

/// How a segment derives each level's value from the previous level's value.
///
/// `Polynomial` is a running recurrence (`previous * coeff + offset`); `power`
/// is carried through from data files but does not take part in evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingMode {
    Constant { cost: f64 },
    Linear { slope: f64 },
    Exponential { rate: f64 },
    Polynomial { coeff: f64, power: f64, offset: f64 },
    Custom { function: String },
}

impl ScalingMode {
    pub fn label(&self) -> &'static str {
        match self {
            ScalingMode::Constant { .. } => "constant",
            ScalingMode::Linear { .. } => "linear",
            ScalingMode::Exponential { .. } => "exponential",
            ScalingMode::Polynomial { .. } => "polynomial",
            ScalingMode::Custom { .. } => "custom",
        }
    }
}

/// Inclusive level range evaluated with one scaling mode.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingSegment {
    pub start_level: u32,
    pub end_level: u32,
    pub mode: ScalingMode,
}

/// Segment as it appears in a data file, before its mode is resolved.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RawSegment {
    #[serde(rename = "StartLevel")]
    pub start_level: i64,
    #[serde(rename = "EndLevel")]
    pub end_level: i64,
    #[serde(rename = "ScalingMode")]
    pub mode: Option<String>,
    #[serde(rename = "ConstantCost")]
    pub constant_cost: Option<f64>,
    #[serde(rename = "LinearSlope")]
    pub linear_slope: Option<f64>,
    #[serde(rename = "ExpRate")]
    pub exp_rate: Option<f64>,
    #[serde(rename = "PolyCoeff")]
    pub poly_coeff: Option<f64>,
    #[serde(rename = "PolyPower")]
    pub poly_power: Option<f64>,
    #[serde(rename = "PolyOffset")]
    pub poly_offset: Option<f64>,
    #[serde(rename = "CustomFunctionName")]
    pub custom_function: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SegmentModeError {
    #[error("segment has no scaling mode")]
    MissingMode,
    #[error("unknown scaling mode '{0}'")]
    UnknownMode(String),
    #[error("custom scaling segment has no function name")]
    MissingCustomFunction,
}

impl RawSegment {
    pub fn resolve_mode(&self) -> Result<ScalingMode, SegmentModeError> {
        let Some(mode) = self.mode.as_deref() else {
            return Err(SegmentModeError::MissingMode);
        };
        let mode = mode.trim();
        if mode.eq_ignore_ascii_case("constant") {
            Ok(ScalingMode::Constant {
                cost: self.constant_cost.unwrap_or(0.0),
            })
        } else if mode.eq_ignore_ascii_case("linear") {
            Ok(ScalingMode::Linear {
                slope: self.linear_slope.unwrap_or(0.0),
            })
        } else if mode.eq_ignore_ascii_case("exponential") {
            Ok(ScalingMode::Exponential {
                rate: self.exp_rate.unwrap_or(1.0),
            })
        } else if mode.eq_ignore_ascii_case("polynomial") {
            Ok(ScalingMode::Polynomial {
                coeff: self.poly_coeff.unwrap_or(1.0),
                power: self.poly_power.unwrap_or(1.0),
                offset: self.poly_offset.unwrap_or(0.0),
            })
        } else if mode.eq_ignore_ascii_case("custom") {
            match self.custom_function.as_deref().map(str::trim) {
                Some(name) if !name.is_empty() => Ok(ScalingMode::Custom {
                    function: name.to_string(),
                }),
                _ => Err(SegmentModeError::MissingCustomFunction),
            }
        } else {
            Err(SegmentModeError::UnknownMode(mode.to_string()))
        }
    }
}

/// Which value series a segment is scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesTarget<'a> {
    Resource(&'a str),
    Time,
}

impl fmt::Display for SeriesTarget<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeriesTarget::Resource(name) => write!(f, "resource '{name}'"),
            SeriesTarget::Time => write!(f, "upgrade time"),
        }
    }
}

/// Arguments handed to a registered custom scaling function.
#[derive(Debug, Clone, Copy)]
pub struct CustomScalingContext<'a> {
    pub path_id: &'a str,
    pub level: u32,
    pub series: SeriesTarget<'a>,
    pub previous: i64,
}

pub type CustomScalingFn = dyn Fn(&CustomScalingContext<'_>) -> i64 + Send + Sync;

/// Named hooks that `Custom` segments delegate to.
#[derive(Clone, Default)]
pub struct CustomScalingRegistry {
    functions: HashMap<String, Arc<CustomScalingFn>>,
}

impl fmt::Debug for CustomScalingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("CustomScalingRegistry")
            .field("functions", &names)
            .finish()
    }
}

impl CustomScalingRegistry {
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&CustomScalingContext<'_>) -> i64 + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CustomScalingFn>> {
        self.functions.get(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScalingError {
    #[error("custom scaling function '{0}' is not registered")]
    UnknownCustomFunction(String),
    #[error("{mode} scaling from {previous} leaves the representable cost range")]
    OutOfRange { mode: &'static str, previous: i64 },
}

/// Evaluates segments for one path.
pub struct ScalingEvaluator<'a> {
    custom: &'a CustomScalingRegistry,
    path_id: &'a str,
}

impl<'a> ScalingEvaluator<'a> {
    pub fn new(custom: &'a CustomScalingRegistry, path_id: &'a str) -> Self {
        Self { custom, path_id }
    }

    pub fn evaluate(
        &self,
        segment: &ScalingSegment,
        previous: i64,
        level: u32,
        series: SeriesTarget<'_>,
    ) -> Result<i64, ScalingError> {
        let function = match &segment.mode {
            ScalingMode::Custom { function } => function,
            builtin => {
                return evaluate_builtin(builtin, previous).ok_or(ScalingError::OutOfRange {
                    mode: builtin.label(),
                    previous,
                })
            }
        };
        let hook = self
            .custom
            .get(function)
            .ok_or_else(|| ScalingError::UnknownCustomFunction(function.clone()))?;
        Ok(hook(&CustomScalingContext {
            path_id: self.path_id,
            level,
            series,
            previous,
        }))
    }
}

/// 2^63. Scaled values must stay strictly below it in magnitude; `i64::MAX as f64`
/// rounds up to this value and would saturate on the cast back.
const SCALED_LIMIT: f64 = 9_223_372_036_854_775_808.0;

/// Evaluates every mode except `Custom`, which needs a hook. Returns `None`
/// for `Custom` and for results that are not finite or do not fit in `i64`.
pub fn evaluate_builtin(mode: &ScalingMode, previous: i64) -> Option<i64> {
    let previous = previous as f64;
    let value = match mode {
        ScalingMode::Constant { cost } => *cost,
        ScalingMode::Linear { slope } => previous + slope,
        ScalingMode::Exponential { rate } => previous * rate,
        ScalingMode::Polynomial { coeff, offset, .. } => previous * coeff + offset,
        ScalingMode::Custom { .. } => return None,
    };
    let value = value.round();
    (value.is_finite() && value.abs() < SCALED_LIMIT).then_some(value as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(mode: ScalingMode) -> ScalingSegment {
        ScalingSegment {
            start_level: 1,
            end_level: 5,
            mode,
        }
    }

    #[test]
    fn builtin_modes_follow_running_value() {
        assert_eq!(
            evaluate_builtin(&ScalingMode::Constant { cost: 42.4 }, 900),
            Some(42)
        );
        assert_eq!(
            evaluate_builtin(&ScalingMode::Linear { slope: 10.0 }, 30),
            Some(40)
        );
        assert_eq!(
            evaluate_builtin(&ScalingMode::Exponential { rate: 1.5 }, 25),
            Some(38)
        );
        assert_eq!(
            evaluate_builtin(
                &ScalingMode::Polynomial {
                    coeff: 2.0,
                    power: 7.0,
                    offset: 5.0
                },
                10
            ),
            Some(25)
        );
    }

    #[test]
    fn unrepresentable_results_are_rejected() {
        assert_eq!(
            evaluate_builtin(&ScalingMode::Exponential { rate: 2.0 }, i64::MAX / 2 + 1),
            None
        );
        assert_eq!(
            evaluate_builtin(&ScalingMode::Constant { cost: f64::NAN }, 1),
            None
        );
        assert_eq!(
            evaluate_builtin(&ScalingMode::Linear { slope: f64::INFINITY }, 1),
            None
        );

        let custom = CustomScalingRegistry::default();
        let evaluator = ScalingEvaluator::new(&custom, "vault");
        let seg = segment(ScalingMode::Exponential { rate: 1e30 });
        assert_eq!(
            evaluator.evaluate(&seg, 10, 2, SeriesTarget::Resource("gold")),
            Err(ScalingError::OutOfRange {
                mode: "exponential",
                previous: 10
            })
        );
    }

    #[test]
    fn polynomial_power_is_inert() {
        let low = ScalingMode::Polynomial {
            coeff: 1.2,
            power: 1.0,
            offset: 3.0,
        };
        let high = ScalingMode::Polynomial {
            coeff: 1.2,
            power: 4.0,
            offset: 3.0,
        };
        assert_eq!(evaluate_builtin(&low, 50), evaluate_builtin(&high, 50));
    }

    #[test]
    fn custom_mode_calls_registered_hook() {
        let mut custom = CustomScalingRegistry::default();
        custom.register("double_plus_level", |ctx: &CustomScalingContext<'_>| {
            ctx.previous * 2 + ctx.level as i64
        });
        let evaluator = ScalingEvaluator::new(&custom, "barracks");
        let seg = segment(ScalingMode::Custom {
            function: "double_plus_level".into(),
        });
        assert_eq!(
            evaluator.evaluate(&seg, 10, 3, SeriesTarget::Resource("wood")),
            Ok(23)
        );
    }

    #[test]
    fn missing_custom_hook_is_reported() {
        let custom = CustomScalingRegistry::default();
        let evaluator = ScalingEvaluator::new(&custom, "barracks");
        let seg = segment(ScalingMode::Custom {
            function: "nope".into(),
        });
        assert_eq!(
            evaluator.evaluate(&seg, 10, 3, SeriesTarget::Time),
            Err(ScalingError::UnknownCustomFunction("nope".into()))
        );
    }

    #[test]
    fn raw_segment_mode_resolution() {
        let raw: RawSegment = serde_json::from_str(
            r#"{"StartLevel": 1, "EndLevel": 4, "ScalingMode": "Linear", "LinearSlope": 12.5}"#,
        )
        .expect("segment parses");
        assert_eq!(raw.resolve_mode(), Ok(ScalingMode::Linear { slope: 12.5 }));

        let unknown = RawSegment {
            mode: Some("HardCoded".into()),
            ..Default::default()
        };
        assert_eq!(
            unknown.resolve_mode(),
            Err(SegmentModeError::UnknownMode("HardCoded".into()))
        );

        let custom = RawSegment {
            mode: Some("Custom".into()),
            ..Default::default()
        };
        assert_eq!(
            custom.resolve_mode(),
            Err(SegmentModeError::MissingCustomFunction)
        );
    }
}
