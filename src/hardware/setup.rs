//! The instrument's device set.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::experiment::row::Vector3;
use crate::hardware::capabilities::{EmissionControl, FrameProducer, Movable, ShutterControl};

/// Identifies one motorized axis of the instrument.
///
/// The ordering is significant: rows list and move their axes X, Y, Z, Theta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisId {
    /// Sample stage X, microns
    X,
    /// Sample stage Y, microns
    Y,
    /// Sample stage Z (the stack axis), microns
    Z,
    /// Sample rotation, degrees
    Theta,
}

impl AxisId {
    /// All axes in canonical order.
    pub const ALL: [AxisId; 4] = [AxisId::X, AxisId::Y, AxisId::Z, AxisId::Theta];
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AxisId::X => "X",
            AxisId::Y => "Y",
            AxisId::Z => "Z",
            AxisId::Theta => "Theta",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for AxisId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x" => Ok(AxisId::X),
            "y" => Ok(AxisId::Y),
            "z" => Ok(AxisId::Z),
            "theta" | "t" | "angle" => Ok(AxisId::Theta),
            other => Err(format!("unknown axis '{}'", other)),
        }
    }
}

/// Devices available to an acquisition.
///
/// The camera is mandatory; axes, laser and shutter are whatever the
/// instrument has.
#[derive(Clone)]
pub struct Setup {
    axes: BTreeMap<AxisId, Arc<dyn Movable>>,
    camera: Arc<dyn FrameProducer>,
    laser: Option<Arc<dyn EmissionControl>>,
    shutter: Option<Arc<dyn ShutterControl>>,
    pixel_size_um: f64,
}

impl Setup {
    /// Create a setup around a camera with a 1 µm pixel size.
    pub fn new(camera: Arc<dyn FrameProducer>) -> Self {
        Self {
            axes: BTreeMap::new(),
            camera,
            laser: None,
            shutter: None,
            pixel_size_um: 1.0,
        }
    }

    /// Attach a motorized axis.
    pub fn with_axis(mut self, axis: AxisId, device: Arc<dyn Movable>) -> Self {
        self.axes.insert(axis, device);
        self
    }

    /// Attach the illumination laser.
    pub fn with_laser(mut self, laser: Arc<dyn EmissionControl>) -> Self {
        self.laser = Some(laser);
        self
    }

    /// Attach the core shutter.
    pub fn with_shutter(mut self, shutter: Arc<dyn ShutterControl>) -> Self {
        self.shutter = Some(shutter);
        self
    }

    /// Set the camera's pixel size at the sample, microns.
    pub fn with_pixel_size(mut self, pixel_size_um: f64) -> Self {
        self.pixel_size_um = pixel_size_um;
        self
    }

    /// The device driving `axis`, if installed.
    pub fn axis(&self, axis: AxisId) -> Option<&Arc<dyn Movable>> {
        self.axes.get(&axis)
    }

    /// Installed axes in canonical order.
    pub fn axis_ids(&self) -> impl Iterator<Item = AxisId> + '_ {
        self.axes.keys().copied()
    }

    /// The camera.
    pub fn camera(&self) -> &Arc<dyn FrameProducer> {
        &self.camera
    }

    /// The laser, if installed.
    pub fn laser(&self) -> Option<&Arc<dyn EmissionControl>> {
        self.laser.as_ref()
    }

    /// The shutter, if installed.
    pub fn shutter(&self) -> Option<&Arc<dyn ShutterControl>> {
        self.shutter.as_ref()
    }

    /// Camera pixel size at the sample, microns.
    pub fn pixel_size_um(&self) -> f64 {
        self.pixel_size_um
    }

    /// Current position of one axis, or 0 when it is not installed.
    pub async fn axis_position(&self, axis: AxisId) -> Result<f64> {
        match self.axes.get(&axis) {
            Some(device) => device.position().await,
            None => Ok(0.0),
        }
    }

    /// Current X/Y/Z stage position.
    pub async fn position(&self) -> Result<Vector3> {
        Ok(Vector3::new(
            self.axis_position(AxisId::X).await?,
            self.axis_position(AxisId::Y).await?,
            self.axis_position(AxisId::Z).await?,
        ))
    }

    /// Positions of every installed axis.
    pub async fn snapshot(&self) -> Result<BTreeMap<AxisId, f64>> {
        let mut positions = BTreeMap::new();
        for (axis, device) in &self.axes {
            positions.insert(*axis, device.position().await?);
        }
        Ok(positions)
    }
}

impl fmt::Debug for Setup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Setup")
            .field("axes", &self.axes.keys().collect::<Vec<_>>())
            .field("camera", &self.camera.resolution())
            .field("laser", &self.laser.is_some())
            .field("shutter", &self.shutter.is_some())
            .field("pixel_size_um", &self.pixel_size_um)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCamera, MockStage};

    #[test]
    fn axis_names_round_trip() {
        for axis in AxisId::ALL {
            assert_eq!(axis.to_string().parse::<AxisId>().unwrap(), axis);
        }
        assert!("w".parse::<AxisId>().is_err());
    }

    #[tokio::test]
    async fn position_defaults_missing_axes_to_zero() {
        let setup = Setup::new(Arc::new(MockCamera::new(2, 2)))
            .with_axis(AxisId::X, Arc::new(MockStage::with_position(12.5)));
        let pos = setup.position().await.unwrap();
        assert_eq!(pos, Vector3::new(12.5, 0.0, 0.0));
        assert_eq!(setup.snapshot().await.unwrap().len(), 1);
    }
}
