//! Position-grid generation.
//!
//! Expands per-axis `min:step:max` ranges into one row per grid point, each
//! carrying the same Z value set. Used to tile a sample with views.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::experiment::row::{AxisId, Row, ValueSet};

/// Range for one grid axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridAxis {
    /// Axis the range applies to
    pub axis: AxisId,
    /// First value
    pub min: f64,
    /// Spacing between values
    pub step: f64,
    /// Upper bound; included when it falls on the grid
    pub max: f64,
}

impl GridAxis {
    /// Values visited along this axis: `min + step*i` while not past `max`.
    pub fn values(&self) -> AppResult<Vec<f64>> {
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(DaqError::Configuration(format!(
                "grid step for {} must be positive, got {}",
                self.axis, self.step
            )));
        }
        if self.max < self.min {
            return Err(DaqError::Configuration(format!(
                "grid range for {} is empty ({} > {})",
                self.axis, self.min, self.max
            )));
        }
        // Tolerate accumulated float error at the upper bound.
        let count = ((self.max - self.min) / self.step + 1e-9).floor() as usize + 1;
        Ok((0..count)
            .map(|i| self.min + self.step * i as f64)
            .collect())
    }
}

/// Cartesian product of the grid axes, first axis outermost.
///
/// Every generated row also gets `z` when given. Grid axes override `z` if
/// they name Z themselves.
pub fn rows_from_ranges(ranges: &[GridAxis], z: Option<&ValueSet>) -> AppResult<Vec<Row>> {
    if ranges.is_empty() && z.is_none() {
        return Err(DaqError::Configuration(
            "grid needs at least one range or a Z value set".into(),
        ));
    }

    let mut points: Vec<Vec<(AxisId, f64)>> = vec![Vec::new()];
    for range in ranges {
        let values = range.values()?;
        points = points
            .into_iter()
            .flat_map(|prefix| {
                values.iter().map(move |v| {
                    let mut next = prefix.clone();
                    next.push((range.axis, *v));
                    next
                })
            })
            .collect();
    }

    points
        .into_iter()
        .map(|point| {
            let mut sets: Vec<(AxisId, ValueSet)> = Vec::with_capacity(point.len() + 1);
            if let Some(z) = z {
                sets.push((AxisId::Z, z.clone()));
            }
            sets.extend(point.into_iter().map(|(axis, v)| (axis, ValueSet::single(v))));
            Row::new(sets)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_is_ordered_outer_to_inner() {
        let rows = rows_from_ranges(
            &[
                GridAxis {
                    axis: AxisId::X,
                    min: 0.0,
                    step: 100.0,
                    max: 100.0,
                },
                GridAxis {
                    axis: AxisId::Y,
                    min: 0.0,
                    step: 50.0,
                    max: 100.0,
                },
            ],
            Some(&ValueSet::stepped(0.0, 4.0, 2.0).unwrap()),
        )
        .unwrap();

        assert_eq!(rows.len(), 6);
        let xy: Vec<(f64, f64)> = rows
            .iter()
            .map(|r| (r.x().unwrap(), r.y().unwrap()))
            .collect();
        assert_eq!(
            xy,
            vec![
                (0.0, 0.0),
                (0.0, 50.0),
                (0.0, 100.0),
                (100.0, 0.0),
                (100.0, 50.0),
                (100.0, 100.0)
            ]
        );
        assert!(rows.iter().all(|r| r.depth() == 3));
    }

    #[test]
    fn upper_bound_included_despite_float_error() {
        let axis = GridAxis {
            axis: AxisId::Theta,
            min: 0.0,
            step: 0.1,
            max: 0.3,
        };
        assert_eq!(axis.values().unwrap().len(), 4);
    }

    #[test]
    fn rejects_bad_ranges() {
        let bad = GridAxis {
            axis: AxisId::X,
            min: 1.0,
            step: 0.0,
            max: 2.0,
        };
        assert!(rows_from_ranges(&[bad], None).is_err());
        assert!(rows_from_ranges(&[], None).is_err());
    }
}
