//! Closed-loop drift correction between repeated stacks of the same view.
//!
//! For every stack of a drift-compensated row the engine calls
//!
//! ```text
//! start_new_stack  tally_slice*  finish_stack
//! ```
//!
//! on that row's [`AntiDrift`] accumulator. `finish_stack` hands the
//! correction to the registered callback. The engine converts X/Y from
//! pixels to microns and translates the row so its next visit starts
//! pre-corrected.
//!
//! [`CentroidAntiDrift`] tracks the thresholded intensity centroid of each
//! stack and reports how far it moved from the first stack's centroid.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::experiment::row::{Row, Vector3};
use crate::hardware::Frame;

/// Receives the correction computed at the end of a stack.
///
/// X and Y are in pixels, Z in microns.
pub type CorrectionCallback = Box<dyn FnMut(Vector3) + Send>;

/// Per-row drift accumulator.
pub trait AntiDrift: Send {
    /// Reset the per-stack tallies.
    fn start_new_stack(&mut self);

    /// Add one slice. `offset_hint` locates the slice relative to the
    /// stack's start (Z is the distance from the first slice).
    fn tally_slice(&mut self, offset_hint: Vector3, frame: &Frame);

    /// Close the stack and report the correction to the callback.
    fn finish_stack(&mut self);

    /// Register where corrections go.
    fn set_callback(&mut self, callback: CorrectionCallback);
}

/// Creates an accumulator for a row the first time it is visited.
pub trait AntiDriftFactory: Send + Sync {
    /// Accumulator for the row at `row_index`.
    fn create(&self, row_index: usize, row: &Row) -> Box<dyn AntiDrift>;
}

impl<F> AntiDriftFactory for F
where
    F: Fn(usize, &Row) -> Box<dyn AntiDrift> + Send + Sync,
{
    fn create(&self, row_index: usize, row: &Row) -> Box<dyn AntiDrift> {
        self(row_index, row)
    }
}

/// Tuning for [`CentroidAntiDrift`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentroidParams {
    /// Thresholds are fractions of each frame's dynamic range instead of
    /// absolute pixel values
    pub auto_threshold: bool,
    /// Lower intensity threshold
    pub low_threshold: f64,
    /// Upper intensity threshold
    pub high_threshold: f64,
    /// Weight of the previous centroid when blending in a new stack
    pub old_weight: f64,
    /// Centroid jumps larger than this are halved; 0 disables the check
    pub reset_magnitude: f64,
    /// Correct toward the middle of the stack instead of the first centroid
    pub absolute: bool,
}

impl Default for CentroidParams {
    fn default() -> Self {
        Self {
            auto_threshold: true,
            low_threshold: 0.5,
            high_threshold: 1.0,
            old_weight: 0.0,
            reset_magnitude: 0.0,
            absolute: false,
        }
    }
}

/// Intensity-centroid drift tracker.
pub struct CentroidAntiDrift {
    params: CentroidParams,
    mid_z: f64,
    initial_mean: Option<Vector3>,
    cached_mean: Option<Vector3>,
    running_mean: Vector3,
    running_intensity: f64,
    slices: usize,
    pixels: u64,
    counted: u64,
    callback: Option<CorrectionCallback>,
}

impl CentroidAntiDrift {
    /// A tracker for stacks `stack_depth` microns deep.
    pub fn new(params: CentroidParams, stack_depth: f64) -> Self {
        Self {
            params,
            mid_z: stack_depth / 2.0,
            initial_mean: None,
            cached_mean: None,
            running_mean: Vector3::ZERO,
            running_intensity: 0.0,
            slices: 0,
            pixels: 0,
            counted: 0,
            callback: None,
        }
    }

    /// A factory building one tracker per row, sized to the row's Z range.
    pub fn factory(params: CentroidParams) -> Arc<dyn AntiDriftFactory> {
        Arc::new(move |_index: usize, row: &Row| -> Box<dyn AntiDrift> {
            let depth = match (row.z_start(), row.z_end()) {
                (Some(start), Some(end)) => (end - start).abs(),
                _ => 0.0,
            };
            Box::new(CentroidAntiDrift::new(params, depth))
        })
    }

    /// Centroid of the stack just tallied.
    ///
    /// Falls back to the first stack's centroid when too few pixels passed
    /// the thresholds.
    pub fn intensity_center(&self) -> Vector3 {
        let initial = self.initial_mean.unwrap_or(Vector3::ZERO);
        let fraction = if self.pixels == 0 {
            0.0
        } else {
            self.counted as f64 / self.pixels as f64
        };
        if fraction < 0.0001 || self.running_intensity <= 0.0 {
            tracing::info!(
                counted = self.counted,
                pixels = self.pixels,
                "Insufficient data to calculate anti-drift"
            );
            return initial;
        }

        let mut center = self.running_mean * (1.0 / self.running_intensity);
        if self.params.reset_magnitude > 0.0
            && self.initial_mean.is_some()
            && (initial - center).norm() > self.params.reset_magnitude
        {
            tracing::info!(
                magnitude = (initial - center).norm(),
                "Centroid shift exceeded reset magnitude; halving"
            );
            center = (center + initial) * 0.5;
        }
        center
    }

    /// Correction to add to the row's targets.
    pub fn correction(&self) -> Vector3 {
        let (Some(initial), Some(cached)) = (self.initial_mean, self.cached_mean) else {
            return Vector3::ZERO;
        };
        if self.params.absolute {
            if initial != cached {
                initial + cached - Vector3::new(0.0, 0.0, 2.0 * self.mid_z)
            } else {
                initial - Vector3::new(0.0, 0.0, self.mid_z)
            }
        } else {
            cached - initial
        }
    }

    fn threshold(&self, value: f64, min: f64, max: f64) -> Option<f64> {
        let CentroidParams {
            auto_threshold,
            low_threshold: low,
            high_threshold: high,
            ..
        } = self.params;
        if auto_threshold {
            let range = max - min;
            let shifted = value - (min + range * low);
            if shifted <= 0.0 || shifted > range * (high - low) {
                None
            } else {
                Some(shifted)
            }
        } else if value < low || value > high {
            None
        } else {
            Some(low)
        }
    }
}

impl AntiDrift for CentroidAntiDrift {
    fn start_new_stack(&mut self) {
        self.running_mean = Vector3::ZERO;
        self.running_intensity = 0.0;
        self.slices = 0;
        self.pixels = 0;
        self.counted = 0;
    }

    fn tally_slice(&mut self, offset_hint: Vector3, frame: &Frame) {
        let Some((min, max)) = frame.min_max() else {
            return;
        };
        let (min, max) = (f64::from(min), f64::from(max));
        let cx = f64::from(frame.width) / 2.0 - offset_hint.x;
        let cy = f64::from(frame.height) / 2.0 - offset_hint.y;

        let mut sum = Vector3::ZERO;
        let mut intensity = 0.0;
        for y in 0..frame.height {
            for x in 0..frame.width {
                let Some(raw) = frame.get(x, y) else { continue };
                if let Some(weight) = self.threshold(f64::from(raw), min, max) {
                    self.counted += 1;
                    sum.x += (f64::from(x) - cx) * weight;
                    sum.y += (f64::from(y) - cy) * weight;
                    intensity += weight;
                }
            }
        }

        sum.z = offset_hint.z * intensity;
        self.running_mean = self.running_mean + sum;
        self.running_intensity += intensity;
        self.slices += 1;
        self.pixels += u64::from(frame.width) * u64::from(frame.height);
    }

    fn finish_stack(&mut self) {
        let center = self.intensity_center();
        let weight = self.params.old_weight / 2.0;
        let cached = match self.cached_mean {
            None => center,
            Some(previous) => previous * weight + center * (1.0 - weight),
        };
        self.cached_mean = Some(cached);
        if self.initial_mean.is_none() {
            self.initial_mean = Some(cached);
        }

        tracing::debug!(
            counted = self.counted,
            pixels = self.pixels,
            slices = self.slices,
            centroid = %cached,
            "Anti-drift stack finished"
        );

        let correction = self.correction();
        if let Some(callback) = self.callback.as_mut() {
            callback(correction);
        }
    }

    fn set_callback(&mut self, callback: CorrectionCallback) {
        self.callback = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn spot(width: u32, height: u32, cx: u32, cy: u32) -> Frame {
        let mut pixels = vec![10u16; (width * height) as usize];
        for dy in 0..3 {
            for dx in 0..3 {
                let x = cx + dx - 1;
                let y = cy + dy - 1;
                pixels[(y * width + x) as usize] = 1000;
            }
        }
        Frame::from_u16(width, height, &pixels)
    }

    fn run_stack(drift: &mut CentroidAntiDrift, frame: &Frame) {
        drift.start_new_stack();
        drift.tally_slice(Vector3::ZERO, frame);
        drift.finish_stack();
    }

    #[test]
    fn first_stack_sets_reference() {
        let mut drift = CentroidAntiDrift::new(CentroidParams::default(), 0.0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        drift.set_callback(Box::new(move |v| sink.lock().push(v)));

        run_stack(&mut drift, &spot(20, 20, 10, 10));
        assert_eq!(seen.lock().as_slice(), &[Vector3::ZERO]);
    }

    #[test]
    fn reports_centroid_motion_in_pixels() {
        let mut drift = CentroidAntiDrift::new(CentroidParams::default(), 0.0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        drift.set_callback(Box::new(move |v| sink.lock().push(v)));

        run_stack(&mut drift, &spot(20, 20, 10, 10));
        run_stack(&mut drift, &spot(20, 20, 12, 9));

        let correction = seen.lock()[1];
        assert!((correction.x - 2.0).abs() < 1e-9, "{correction}");
        assert!((correction.y + 1.0).abs() < 1e-9, "{correction}");
        assert_eq!(correction.z, 0.0);
    }

    #[test]
    fn blank_frames_fall_back_to_reference() {
        let mut drift = CentroidAntiDrift::new(CentroidParams::default(), 0.0);
        run_stack(&mut drift, &spot(20, 20, 10, 10));
        let reference = drift.cached_mean.unwrap();

        drift.start_new_stack();
        drift.tally_slice(Vector3::ZERO, &Frame::from_u16(4, 4, &[5; 16]));
        assert_eq!(drift.intensity_center(), reference);
    }

    #[test]
    fn fixed_thresholds_weight_uniformly() {
        let params = CentroidParams {
            auto_threshold: false,
            low_threshold: 500.0,
            high_threshold: 2000.0,
            ..Default::default()
        };
        let mut drift = CentroidAntiDrift::new(params, 0.0);
        drift.start_new_stack();
        drift.tally_slice(Vector3::ZERO, &spot(20, 20, 10, 10));
        assert_eq!(drift.counted, 9);
        assert_eq!(drift.running_intensity, 9.0 * 500.0);
    }

    #[test]
    fn factory_sizes_to_row_depth() {
        use crate::experiment::row::ValueSet;
        let factory = CentroidAntiDrift::factory(CentroidParams {
            absolute: true,
            ..Default::default()
        });
        let row = Row::stack(0.0, 0.0, ValueSet::stepped(10.0, 30.0, 5.0).unwrap(), 0.0);
        let mut drift = factory.create(0, &row);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        drift.set_callback(Box::new(move |v| sink.lock().push(v)));
        drift.start_new_stack();
        drift.tally_slice(Vector3::new(0.0, 0.0, 10.0), &spot(20, 20, 10, 10));
        drift.finish_stack();
        // Centroid at z=10 in a 20 µm stack is already centred.
        let correction = seen.lock()[0];
        assert!(correction.z.abs() < 1e-9, "{correction}");
    }
}
