//! Run configuration: everything the engine needs for one acquisition.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::data::output::{OutputHandler, TaggedFrame};
use crate::error::{AppResult, DaqError};
use crate::experiment::anti_drift::AntiDriftFactory;
use crate::experiment::row::Row;
use crate::experiment::state::AcqStatus;
use crate::hardware::Setup;

/// When the laser is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IlluminationPolicy {
    /// Pulse the laser around each snap.
    #[default]
    PerFrame,
    /// Keep the laser on for the whole stack.
    FullStack,
}

/// Receives overall progress after each slice and each stack.
pub trait ProgressListener: Send + Sync {
    /// `overall` is the completed fraction of the run, 0..=1.
    fn report_progress(&self, timepoint: usize, row: usize, overall: f64);
}

impl<F> ProgressListener for F
where
    F: Fn(usize, usize, f64) + Send + Sync,
{
    fn report_progress(&self, timepoint: usize, row: usize, overall: f64) {
        self(timepoint, row, overall)
    }
}

/// Receives every captured frame for on-screen display.
pub trait LivePreview: Send + Sync {
    /// Show `frame`. Must not block.
    fn show(&self, frame: &TaggedFrame);
}

impl<F> LivePreview for F
where
    F: Fn(&TaggedFrame) + Send + Sync,
{
    fn show(&self, frame: &TaggedFrame) {
        self(frame)
    }
}

/// Immutable snapshot of one run's configuration.
///
/// Owns the output handler and shares the [`AcqStatus`] with whoever built it.
pub struct AcquisitionParams {
    pub(crate) setup: Setup,
    pub(crate) rows: Vec<Row>,
    pub(crate) timepoints: usize,
    pub(crate) interval: Duration,
    pub(crate) continuous: bool,
    pub(crate) settle_delay: Duration,
    pub(crate) illumination: IlluminationPolicy,
    pub(crate) live: Option<Arc<dyn LivePreview>>,
    pub(crate) anti_drift: Option<Arc<dyn AntiDriftFactory>>,
    pub(crate) output: Box<dyn OutputHandler>,
    pub(crate) progress: Option<Arc<dyn ProgressListener>>,
    pub(crate) status: Arc<AcqStatus>,
    pub(crate) profile: bool,
    pub(crate) pause_poll: Duration,
    pub(crate) restore_positions: bool,
    pub(crate) summary_path: Option<PathBuf>,
}

impl AcquisitionParams {
    /// Start building parameters for `setup`, writing to `output`.
    pub fn builder(setup: Setup, output: Box<dyn OutputHandler>) -> AcquisitionParamsBuilder {
        AcquisitionParamsBuilder {
            params: AcquisitionParams {
                setup,
                rows: Vec::new(),
                timepoints: 1,
                interval: Duration::ZERO,
                continuous: false,
                settle_delay: Duration::ZERO,
                illumination: IlluminationPolicy::PerFrame,
                live: None,
                anti_drift: None,
                output,
                progress: None,
                status: Arc::new(AcqStatus::new()),
                profile: false,
                pause_poll: Duration::from_millis(10),
                restore_positions: true,
                summary_path: None,
            },
        }
    }

    /// Rows in acquisition order.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Number of timepoints.
    pub fn timepoints(&self) -> usize {
        self.timepoints
    }

    /// Shared status token.
    pub fn status(&self) -> Arc<AcqStatus> {
        self.status.clone()
    }

    /// Whether drift compensation is configured.
    pub fn is_anti_drift_on(&self) -> bool {
        self.anti_drift.is_some()
    }

    /// Slices expected over the whole run; sweeps count as one.
    pub fn estimated_frames(&self) -> usize {
        self.timepoints * self.rows.iter().map(Row::estimated_depth).sum::<usize>()
    }

    /// Reject combinations the engine cannot run.
    ///
    /// Called by the builder and again at the start of every run, before
    /// any device moves.
    pub fn validate(&self) -> AppResult<()> {
        if self.rows.is_empty() {
            return Err(DaqError::Configuration("no rows to acquire".into()));
        }
        if self.timepoints == 0 {
            return Err(DaqError::Configuration(
                "timepoint count must be at least 1".into(),
            ));
        }
        if self.continuous && self.anti_drift.is_some() {
            return Err(DaqError::Configuration(
                "No continuous acquisition with anti-drift".into(),
            ));
        }
        if self.pause_poll.is_zero() {
            return Err(DaqError::Configuration(
                "pause poll interval must be positive".into(),
            ));
        }

        for (index, row) in self.rows.iter().enumerate() {
            for axis in row.axes() {
                if self.setup.axis(axis).is_none() {
                    return Err(DaqError::Configuration(format!(
                        "row {} uses axis {} but the setup has no such device",
                        index, axis
                    )));
                }
            }
            if row.is_z_continuous() {
                if !self.continuous {
                    return Err(DaqError::Configuration(format!(
                        "row {} is a continuous sweep but the run is in stepped mode",
                        index
                    )));
                }
                if self.setup.laser().is_none() {
                    return Err(DaqError::Configuration(format!(
                        "row {} is a continuous sweep, which needs a laser",
                        index
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for AcquisitionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionParams")
            .field("setup", &self.setup)
            .field("rows", &self.rows.len())
            .field("timepoints", &self.timepoints)
            .field("interval", &self.interval)
            .field("continuous", &self.continuous)
            .field("settle_delay", &self.settle_delay)
            .field("illumination", &self.illumination)
            .field("update_live", &self.live.is_some())
            .field("anti_drift", &self.anti_drift.is_some())
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

/// Builder for [`AcquisitionParams`].
pub struct AcquisitionParamsBuilder {
    params: AcquisitionParams,
}

impl AcquisitionParamsBuilder {
    /// Rows in acquisition order.
    pub fn rows(mut self, rows: Vec<Row>) -> Self {
        self.params.rows = rows;
        self
    }

    /// Number of timepoints and the interval between their starts.
    pub fn time_series(mut self, timepoints: usize, interval: Duration) -> Self {
        self.params.timepoints = timepoints;
        self.params.interval = interval;
        self
    }

    /// Capture sweeps at constant velocity.
    pub fn continuous(mut self, continuous: bool) -> Self {
        self.params.continuous = continuous;
        self
    }

    /// Wait after every move before capturing.
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.params.settle_delay = delay;
        self
    }

    /// Laser policy.
    pub fn illumination(mut self, policy: IlluminationPolicy) -> Self {
        self.params.illumination = policy;
        self
    }

    /// Show frames live while acquiring.
    pub fn live_preview(mut self, preview: Arc<dyn LivePreview>) -> Self {
        self.params.live = Some(preview);
        self
    }

    /// Enable drift compensation.
    pub fn anti_drift(mut self, factory: Arc<dyn AntiDriftFactory>) -> Self {
        self.params.anti_drift = Some(factory);
        self
    }

    /// Progress sink.
    pub fn progress(mut self, listener: Arc<dyn ProgressListener>) -> Self {
        self.params.progress = Some(listener);
        self
    }

    /// Use an existing status token (e.g. one a UI already holds).
    pub fn status(mut self, status: Arc<AcqStatus>) -> Self {
        self.params.status = status;
        self
    }

    /// Time sections of the run and log a report at the end.
    pub fn profile(mut self, profile: bool) -> Self {
        self.params.profile = profile;
        self
    }

    /// How often a paused run checks whether it may continue.
    pub fn pause_poll(mut self, interval: Duration) -> Self {
        self.params.pause_poll = interval;
        self
    }

    /// Return axes to their starting positions after the run.
    pub fn restore_positions(mut self, restore: bool) -> Self {
        self.params.restore_positions = restore;
        self
    }

    /// Write a JSON run summary to this path when the run ends.
    pub fn summary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.params.summary_path = Some(path.into());
        self
    }

    /// Validate and finish.
    pub fn build(self) -> AppResult<AcquisitionParams> {
        self.params.validate()?;
        Ok(self.params)
    }

    /// Finish without validating; the engine still validates before moving.
    pub fn build_unchecked(self) -> AcquisitionParams {
        self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::stack_handler::StackHandler;
    use crate::experiment::anti_drift::{CentroidAntiDrift, CentroidParams};
    use crate::experiment::row::{AxisId, ValueSet};
    use crate::hardware::mock::{MockCamera, MockLaser, MockStage};

    fn setup(with_laser: bool) -> Setup {
        let mut setup = Setup::new(Arc::new(MockCamera::new(4, 4)));
        for axis in AxisId::ALL {
            setup = setup.with_axis(axis, Arc::new(MockStage::new()));
        }
        if with_laser {
            setup = setup.with_laser(Arc::new(MockLaser::new()));
        }
        setup
    }

    fn sweep_row() -> Row {
        Row::stack(0.0, 0.0, ValueSet::continuous(0.0, 10.0, 5.0).unwrap(), 0.0)
    }

    #[test]
    fn continuous_with_drift_is_rejected() {
        let err = AcquisitionParams::builder(setup(true), Box::new(StackHandler::new()))
            .rows(vec![sweep_row()])
            .continuous(true)
            .anti_drift(CentroidAntiDrift::factory(CentroidParams::default()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("anti-drift"), "{err}");
    }

    #[test]
    fn sweep_rows_need_continuous_mode_and_laser() {
        assert!(AcquisitionParams::builder(setup(true), Box::new(StackHandler::new()))
            .rows(vec![sweep_row()])
            .build()
            .is_err());
        assert!(AcquisitionParams::builder(setup(false), Box::new(StackHandler::new()))
            .rows(vec![sweep_row()])
            .continuous(true)
            .build()
            .is_err());
        assert!(AcquisitionParams::builder(setup(true), Box::new(StackHandler::new()))
            .rows(vec![sweep_row()])
            .continuous(true)
            .build()
            .is_ok());
    }

    #[test]
    fn rows_must_reference_installed_axes() {
        let setup = Setup::new(Arc::new(MockCamera::new(4, 4)))
            .with_axis(AxisId::Z, Arc::new(MockStage::new()));
        let err = AcquisitionParams::builder(setup, Box::new(StackHandler::new()))
            .rows(vec![Row::at(1.0, 2.0, 3.0, 0.0)])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("axis X"), "{err}");
    }

    #[test]
    fn empty_runs_are_rejected() {
        assert!(AcquisitionParams::builder(setup(false), Box::new(StackHandler::new()))
            .build()
            .is_err());
        assert!(AcquisitionParams::builder(setup(false), Box::new(StackHandler::new()))
            .rows(vec![Row::at(0.0, 0.0, 0.0, 0.0)])
            .time_series(0, Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn estimated_frames_counts_sweeps_once() {
        let params = AcquisitionParams::builder(setup(true), Box::new(StackHandler::new()))
            .rows(vec![
                sweep_row(),
                Row::stack(0.0, 0.0, ValueSet::stepped(0.0, 4.0, 1.0).unwrap(), 0.0),
            ])
            .continuous(true)
            .time_series(3, Duration::ZERO)
            .build()
            .unwrap();
        assert_eq!(params.estimated_frames(), 3 * (1 + 5));
    }
}
