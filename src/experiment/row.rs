//! Rows and value sets: what the engine moves to for each view.
//!
//! A [`ValueSet`] is the list of targets for one axis. A [`Row`] maps each axis
//! of a view to its value set. Rows are built before a run and only change
//! through [`Row::translate`], which the engine calls between stacks to apply
//! drift correction.
//!
//! Value sets have a compact text form used by configuration files and the
//! CLI:
//!
//! | text              | meaning                                   |
//! |-------------------|-------------------------------------------|
//! | `12.5`            | single position                           |
//! | `1;4;9`           | explicit list                             |
//! | `0:2:10`          | stepped range `start:step:end`            |
//! | `0-100@25`        | continuous sweep `start-end@speed`        |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};
use std::str::FromStr;

use crate::error::{AppResult, DaqError};
pub use crate::hardware::setup::AxisId;

/// Step count reported by a continuous sweep when used as a loop bound.
///
/// The number of frames a sweep produces is only known once the axis stops.
pub const CONTINUOUS_STEPS: usize = 999;

/// Largest number of positions a stepped range may expand to.
pub const MAX_STEPPED_POSITIONS: usize = 1_000_000;

/// A point or offset in stage space, microns.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    #[allow(missing_docs)]
    pub x: f64,
    #[allow(missing_docs)]
    pub y: f64,
    #[allow(missing_docs)]
    pub z: f64,
}

impl Vector3 {
    /// The origin.
    pub const ZERO: Vector3 = Vector3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    #[allow(missing_docs)]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean length.
    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

impl Add for Vector3 {
    type Output = Vector3;
    fn add(self, rhs: Vector3) -> Vector3 {
        Vector3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vector3 {
    type Output = Vector3;
    fn sub(self, rhs: Vector3) -> Vector3 {
        Vector3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Vector3 {
    type Output = Vector3;
    fn mul(self, rhs: f64) -> Vector3 {
        Vector3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl Neg for Vector3 {
    type Output = Vector3;
    fn neg(self) -> Vector3 {
        Vector3::new(-self.x, -self.y, -self.z)
    }
}

impl fmt::Display for Vector3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

/// How the positions of a [`ValueSet`] are visited.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SweepMode {
    /// Stop at each listed position.
    Discrete,
    /// Stop at evenly spaced positions `step` apart.
    Stepped {
        /// Distance between neighbouring positions (always positive)
        step: f64,
    },
    /// Move from the first to the last position at constant speed.
    Continuous {
        /// Sweep velocity, units per second
        speed: f64,
    },
}

/// Target positions for one axis within a row.
///
/// Always holds at least one value. A continuous sweep holds exactly its start
/// and end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ValueSetRepr", into = "String")]
pub struct ValueSet {
    values: Vec<f64>,
    mode: SweepMode,
}

impl ValueSet {
    /// A single position.
    pub fn single(value: f64) -> Self {
        Self {
            values: vec![value],
            mode: SweepMode::Discrete,
        }
    }

    /// An explicit, non-empty list of positions.
    pub fn discrete(values: Vec<f64>) -> AppResult<Self> {
        if values.is_empty() {
            return Err(DaqError::Configuration(
                "a value set requires at least one position".into(),
            ));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DaqError::Configuration(
                "value set positions must be finite".into(),
            ));
        }
        Ok(Self {
            values,
            mode: SweepMode::Discrete,
        })
    }

    /// Evenly stepped positions from `start` to `end` inclusive.
    ///
    /// The count is `round(|end - start| / step) + 1`, at most
    /// [`MAX_STEPPED_POSITIONS`]; the first and last values are exactly
    /// `start` and `end`.
    pub fn stepped(start: f64, end: f64, step: f64) -> AppResult<Self> {
        if !(step.is_finite() && step > 0.0) {
            return Err(DaqError::Configuration(format!(
                "step size must be positive, got {}",
                step
            )));
        }
        if !(start.is_finite() && end.is_finite()) {
            return Err(DaqError::Configuration(
                "stepped range bounds must be finite".into(),
            ));
        }

        let intervals = ((end - start).abs() / step).round();
        if !(intervals.is_finite() && intervals < MAX_STEPPED_POSITIONS as f64) {
            return Err(DaqError::Configuration(format!(
                "stepping from {} to {} by {} exceeds {} positions",
                start, end, step, MAX_STEPPED_POSITIONS
            )));
        }
        let count = intervals as usize + 1;
        if count == 1 {
            return Ok(Self {
                values: vec![start],
                mode: SweepMode::Stepped { step },
            });
        }

        let direction = if end >= start { 1.0 } else { -1.0 };
        let mut values = Vec::with_capacity(count);
        values.push(start);
        for i in 1..count - 1 {
            values.push(start + direction * step * i as f64);
        }
        values.push(end);

        Ok(Self {
            values,
            mode: SweepMode::Stepped { step },
        })
    }

    /// A constant-velocity sweep from `start` to `end`.
    pub fn continuous(start: f64, end: f64, speed: f64) -> AppResult<Self> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(DaqError::Configuration(format!(
                "sweep speed must be positive, got {}",
                speed
            )));
        }
        Ok(Self {
            values: vec![start, end],
            mode: SweepMode::Continuous { speed },
        })
    }

    /// How the positions are visited.
    pub fn mode(&self) -> SweepMode {
        self.mode
    }

    /// First position.
    pub fn start(&self) -> f64 {
        self.values[0]
    }

    /// Last position.
    pub fn end(&self) -> f64 {
        self.values[self.values.len() - 1]
    }

    /// Step size for stepped ranges.
    pub fn step_size(&self) -> Option<f64> {
        match self.mode {
            SweepMode::Stepped { step } => Some(step),
            _ => None,
        }
    }

    /// Sweep velocity for continuous sweeps.
    pub fn speed(&self) -> Option<f64> {
        match self.mode {
            SweepMode::Continuous { speed } => Some(speed),
            _ => None,
        }
    }

    /// Whether this is a continuous sweep.
    pub fn is_continuous(&self) -> bool {
        matches!(self.mode, SweepMode::Continuous { .. })
    }

    /// Number of positions when used as a loop bound.
    ///
    /// Continuous sweeps report [`CONTINUOUS_STEPS`].
    pub fn steps(&self) -> usize {
        if self.is_continuous() {
            CONTINUOUS_STEPS
        } else {
            self.values.len()
        }
    }

    /// Number of positions for dataset size estimates; a sweep counts as one.
    pub fn estimated_steps(&self) -> usize {
        if self.is_continuous() {
            1
        } else {
            self.values.len()
        }
    }

    /// The positions. A sweep yields its start and end.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Shift every position by `by`.
    pub fn translate(&mut self, by: f64) {
        for value in &mut self.values {
            *value += by;
        }
    }
}

impl fmt::Display for ValueSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.values.len() == 1 {
            return write!(f, "{:.3}", self.values[0]);
        }
        match self.mode {
            SweepMode::Continuous { speed } => {
                write!(f, "{:.3}-{:.3}@{:.1}", self.start(), self.end(), speed)
            }
            SweepMode::Stepped { step } => {
                write!(f, "{:.3}:{:.3}:{:.3}", self.start(), step, self.end())
            }
            SweepMode::Discrete => {
                let parts: Vec<String> = self.values.iter().map(|v| format!("{:.3}", v)).collect();
                write!(f, "{}", parts.join(";"))
            }
        }
    }
}

fn parse_number(input: &str, part: &str) -> AppResult<f64> {
    part.trim()
        .parse::<f64>()
        .map_err(|e| DaqError::ValueSetParse {
            input: input.to_string(),
            reason: format!("'{}': {}", part.trim(), e),
        })
}

impl FromStr for ValueSet {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.is_empty() {
            return Err(DaqError::ValueSetParse {
                input: s.to_string(),
                reason: "empty value set".into(),
            });
        }

        let invalid = |e: DaqError| DaqError::ValueSetParse {
            input: s.to_string(),
            reason: e.to_string(),
        };

        if let Some((range, speed)) = text.split_once('@') {
            // A leading '-' is a sign, not the range separator.
            let dash = range
                .get(1..)
                .and_then(|rest| rest.find('-'))
                .map(|i| i + 1)
                .ok_or_else(|| DaqError::ValueSetParse {
                    input: s.to_string(),
                    reason: "expected start-end@speed".into(),
                })?;
            let start = parse_number(s, &range[..dash])?;
            let end = parse_number(s, &range[dash + 1..])?;
            let speed = parse_number(s, speed)?;
            return ValueSet::continuous(start, end, speed).map_err(invalid);
        }

        if text.contains(':') {
            let parts: Vec<&str> = text.split(':').collect();
            if parts.len() != 3 {
                return Err(DaqError::ValueSetParse {
                    input: s.to_string(),
                    reason: "expected start:step:end".into(),
                });
            }
            let start = parse_number(s, parts[0])?;
            let step = parse_number(s, parts[1])?;
            let end = parse_number(s, parts[2])?;
            return ValueSet::stepped(start, end, step).map_err(invalid);
        }

        if text.contains(';') {
            let values = text
                .split(';')
                .filter(|part| !part.trim().is_empty())
                .map(|part| parse_number(s, part))
                .collect::<AppResult<Vec<f64>>>()?;
            return ValueSet::discrete(values).map_err(invalid);
        }

        let value = parse_number(s, text)?;
        ValueSet::discrete(vec![value]).map_err(invalid)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ValueSetRepr {
    Number(f64),
    Text(String),
}

impl TryFrom<ValueSetRepr> for ValueSet {
    type Error = DaqError;

    fn try_from(repr: ValueSetRepr) -> Result<Self, Self::Error> {
        match repr {
            ValueSetRepr::Number(v) => ValueSet::discrete(vec![v]),
            ValueSetRepr::Text(text) => text.parse(),
        }
    }
}

// Full-precision text in the same grammar `FromStr` accepts. Stepped ranges
// keep their `start:step:end` form even when they collapse to one position.
impl From<ValueSet> for String {
    fn from(set: ValueSet) -> String {
        match set.mode {
            SweepMode::Continuous { speed } => {
                format!("{}-{}@{}", set.start(), set.end(), speed)
            }
            SweepMode::Stepped { step } => format!("{}:{}:{}", set.start(), step, set.end()),
            SweepMode::Discrete => set
                .values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(";"),
        }
    }
}

/// One view: the value set for every axis involved.
///
/// Never empty. Axis order follows [`AxisId`]'s ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<AxisId, ValueSet>", into = "BTreeMap<AxisId, ValueSet>")]
pub struct Row {
    sets: BTreeMap<AxisId, ValueSet>,
}

impl Row {
    /// Build a row from per-axis value sets.
    pub fn new(sets: impl IntoIterator<Item = (AxisId, ValueSet)>) -> AppResult<Self> {
        let sets: BTreeMap<AxisId, ValueSet> = sets.into_iter().collect();
        if sets.is_empty() {
            return Err(DaqError::Configuration(
                "a row must reference at least one axis".into(),
            ));
        }
        Ok(Self { sets })
    }

    /// Build a row from per-axis text descriptions.
    pub fn parse<'a>(sets: impl IntoIterator<Item = (AxisId, &'a str)>) -> AppResult<Self> {
        let parsed = sets
            .into_iter()
            .map(|(axis, text)| Ok((axis, text.parse::<ValueSet>()?)))
            .collect::<AppResult<Vec<_>>>()?;
        Self::new(parsed)
    }

    /// A single-slice view at a fixed position.
    pub fn at(x: f64, y: f64, z: f64, theta: f64) -> Self {
        Self {
            sets: BTreeMap::from([
                (AxisId::X, ValueSet::single(x)),
                (AxisId::Y, ValueSet::single(y)),
                (AxisId::Z, ValueSet::single(z)),
                (AxisId::Theta, ValueSet::single(theta)),
            ]),
        }
    }

    /// A stack along Z at a fixed X/Y/theta.
    pub fn stack(x: f64, y: f64, z: ValueSet, theta: f64) -> Self {
        Self {
            sets: BTreeMap::from([
                (AxisId::X, ValueSet::single(x)),
                (AxisId::Y, ValueSet::single(y)),
                (AxisId::Z, z),
                (AxisId::Theta, ValueSet::single(theta)),
            ]),
        }
    }

    /// Replace or remove one axis's value set.
    ///
    /// Removing the last axis is refused.
    pub fn set_value_set(&mut self, axis: AxisId, set: Option<ValueSet>) -> AppResult<()> {
        match set {
            Some(set) => {
                self.sets.insert(axis, set);
            }
            None => {
                if self.sets.len() == 1 && self.sets.contains_key(&axis) {
                    return Err(DaqError::Configuration(
                        "a row must reference at least one axis".into(),
                    ));
                }
                self.sets.remove(&axis);
            }
        }
        Ok(())
    }

    /// The value set for `axis`.
    pub fn value_set(&self, axis: AxisId) -> Option<&ValueSet> {
        self.sets.get(&axis)
    }

    /// Axes referenced by this row.
    pub fn axes(&self) -> impl Iterator<Item = AxisId> + '_ {
        self.sets.keys().copied()
    }

    /// Axes and value sets.
    pub fn iter(&self) -> impl Iterator<Item = (AxisId, &ValueSet)> {
        self.sets.iter().map(|(axis, set)| (*axis, set))
    }

    /// Text form of one axis's value set.
    pub fn describe(&self, axis: AxisId) -> Option<String> {
        self.sets.get(&axis).map(ToString::to_string)
    }

    /// Slice count: the product of every axis's step count.
    pub fn depth(&self) -> usize {
        self.sets.values().map(ValueSet::steps).product()
    }

    /// Slice count for size estimates, counting sweeps as one.
    pub fn estimated_depth(&self) -> usize {
        self.sets.values().map(ValueSet::estimated_steps).product()
    }

    /// First Z position, if the row moves Z.
    pub fn z_start(&self) -> Option<f64> {
        self.value_set(AxisId::Z).map(ValueSet::start)
    }

    /// Last Z position, if the row moves Z.
    pub fn z_end(&self) -> Option<f64> {
        self.value_set(AxisId::Z).map(ValueSet::end)
    }

    /// Z step size for stepped stacks.
    pub fn z_step(&self) -> Option<f64> {
        self.value_set(AxisId::Z).and_then(ValueSet::step_size)
    }

    /// Z sweep velocity for continuous stacks.
    pub fn z_velocity(&self) -> Option<f64> {
        self.value_set(AxisId::Z).and_then(ValueSet::speed)
    }

    /// Whether Z is swept at constant velocity.
    pub fn is_z_continuous(&self) -> bool {
        self.value_set(AxisId::Z)
            .map(ValueSet::is_continuous)
            .unwrap_or(false)
    }

    /// Whether the row captures a single frame.
    pub fn is_single_slice(&self) -> bool {
        match self.value_set(AxisId::Z) {
            None => true,
            Some(z) => z.start() == z.end(),
        }
    }

    /// Starting X position.
    pub fn x(&self) -> Option<f64> {
        self.value_set(AxisId::X).map(ValueSet::start)
    }

    /// Starting Y position.
    pub fn y(&self) -> Option<f64> {
        self.value_set(AxisId::Y).map(ValueSet::start)
    }

    /// Starting rotation.
    pub fn theta(&self) -> Option<f64> {
        self.value_set(AxisId::Theta).map(ValueSet::start)
    }

    /// Shift the X, Y and Z targets. Axes the row does not use are ignored.
    pub fn translate(&mut self, by: Vector3) {
        for (axis, delta) in [(AxisId::X, by.x), (AxisId::Y, by.y), (AxisId::Z, by.z)] {
            if let Some(set) = self.sets.get_mut(&axis) {
                set.translate(delta);
            }
        }
    }
}

impl TryFrom<BTreeMap<AxisId, ValueSet>> for Row {
    type Error = DaqError;

    fn try_from(sets: BTreeMap<AxisId, ValueSet>) -> Result<Self, Self::Error> {
        Row::new(sets)
    }
}

impl From<Row> for BTreeMap<AxisId, ValueSet> {
    fn from(row: Row) -> Self {
        row.sets
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .sets
            .iter()
            .map(|(axis, set)| format!("{}={}", axis, set))
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}
