//! AcquisitionEngine: walks timepoints × rows × slices.
//!
//! The engine owns the capture loop. For every timepoint and every row it
//! drives the row's axes to their start positions, captures a single frame,
//! a stepped Z stack or a continuous sweep, tags each frame with where and
//! when it was taken, and pushes it through the configured
//! [`OutputHandler`](crate::data::output::OutputHandler).
//!
//! # Lifecycle
//!
//! ```text
//! Setup ─> ( Moving ─> Acquiring )* ─> Teardown ─> Done
//!              ▲           │
//!              └─ Waiting / Paused
//! ```
//!
//! Cancellation is cooperative: the token is checked at the top of every
//! row, before every slice, during device waits and during the wait between
//! timepoints. Cancelled and failed runs take the same teardown path as
//! completed ones, so `finalize_acquisition` is called exactly once per run.
//!
//! # Example
//!
//! ```rust,ignore
//! let params = AcquisitionParams::builder(setup, Box::new(StackHandler::new()))
//!     .rows(rows)
//!     .time_series(10, Duration::from_secs(60))
//!     .build()?;
//! let mut engine = AcquisitionEngine::new(params);
//! let outcome = engine.run(&CancellationToken::new()).await?;
//! ```

use futures::future::try_join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::data::output::{ImageStack, SliceMetadata, TaggedFrame};
use crate::error::{AppResult, DaqError};
use crate::experiment::anti_drift::AntiDrift;
use crate::experiment::params::{AcquisitionParams, IlluminationPolicy};
use crate::experiment::profiler::Profiler;
use crate::experiment::row::{AxisId, Row, Vector3};
use crate::experiment::state::{AcqState, AcqStatus};
use crate::experiment::summary::{RunEnd, RunSummary};
use crate::hardware::capabilities::{EmissionControl, FrameProducer, Movable};
use crate::hardware::{Frame, Setup};

/// Poll interval while draining the camera buffer during a sweep.
const SWEEP_POLL: Duration = Duration::from_millis(2);

/// Result of a run that was not aborted by an error.
#[derive(Debug)]
pub struct RunOutcome {
    /// What the output handler accumulated, if it keeps frames in memory
    pub image: Option<ImageStack>,
    /// Completed or cancelled
    pub end: RunEnd,
    /// Fraction of the run acquired
    pub progress: f64,
    /// Frames delivered to the output handler
    pub frames: u64,
    /// Rows as they stand after drift correction
    pub rows: Vec<Row>,
    /// Summary of the run
    pub summary: RunSummary,
}

impl RunOutcome {
    /// Whether every timepoint was acquired.
    pub fn is_complete(&self) -> bool {
        self.end == RunEnd::Completed
    }
}

struct DriftSlot {
    accumulator: Box<dyn AntiDrift>,
    corrections: Arc<Mutex<Vec<Vector3>>>,
}

/// Device state recorded during setup and restored during teardown.
#[derive(Default)]
struct RestorePoint {
    positions: BTreeMap<AxisId, f64>,
    auto_shutter: Option<bool>,
}

/// Sequencing engine for one acquisition.
///
/// An engine runs once; build a new one from fresh parameters for the next
/// acquisition.
pub struct AcquisitionEngine {
    params: AcquisitionParams,
    drift: BTreeMap<usize, DriftSlot>,
    profiler: Option<Profiler>,
    started: Instant,
    cursor: (usize, usize),
    progress: f64,
    frames: u64,
    ran: bool,
}

impl AcquisitionEngine {
    /// Create an engine for `params`.
    pub fn new(params: AcquisitionParams) -> Self {
        Self {
            params,
            drift: BTreeMap::new(),
            profiler: None,
            started: Instant::now(),
            cursor: (0, 0),
            progress: 0.0,
            frames: 0,
            ran: false,
        }
    }

    /// The shared status token.
    pub fn status(&self) -> Arc<AcqStatus> {
        self.params.status.clone()
    }

    /// Run parameters, including the rows as corrected so far.
    pub fn params(&self) -> &AcquisitionParams {
        &self.params
    }

    /// Execute the acquisition.
    ///
    /// Returns `Ok` for completed and cancelled runs. Configuration problems
    /// are reported before any device moves; device and output failures are
    /// returned as [`DaqError::AcquisitionFailed`] carrying the progress made.
    pub async fn run(&mut self, cancel: &CancellationToken) -> AppResult<RunOutcome> {
        if self.ran {
            return Err(DaqError::Configuration(
                "this engine has already run; build a new one".into(),
            ));
        }
        self.ran = true;

        let status = self.params.status.clone();
        status.set_state(AcqState::Setup);

        if let Err(e) = self.params.validate() {
            error!(error = %e, "Rejecting acquisition before any motion");
            if let Err(fin) = self.params.output.finalize_acquisition().await {
                warn!(error = %fin, "Output handler failed to finalize after rejected run");
            }
            status.set_state(AcqState::Done);
            return Err(e);
        }

        self.started = Instant::now();
        if self.params.profile {
            self.profiler = Some(Profiler::new("acquisition"));
        }
        let mut summary = RunSummary::begin(self.params.timepoints, self.params.rows.len());
        info!(
            run_id = %summary.run_id,
            timepoints = self.params.timepoints,
            rows = self.params.rows.len(),
            continuous = self.params.continuous,
            anti_drift = self.params.anti_drift.is_some(),
            "Starting acquisition"
        );

        let mut restore = RestorePoint::default();
        self.profile_start("setup");
        let prepared = self.prepare(&mut restore).await;
        self.profile_stop("setup");
        let result = match prepared {
            Ok(()) => self.acquire(cancel).await,
            Err(e) => Err(e),
        };

        self.profile_start("teardown");
        self.teardown(&restore).await;

        let end = match &result {
            Ok(()) => RunEnd::Completed,
            Err(DaqError::Cancelled) => RunEnd::Cancelled,
            Err(_) => RunEnd::Failed,
        };
        if end != RunEnd::Completed {
            let (timepoint, row) = self.cursor;
            if let Some(listener) = &self.params.progress {
                listener.report_progress(timepoint, row, 1.0);
            }
        }

        let finalized = self.params.output.finalize_acquisition().await;
        let image = match self.params.output.image().await {
            Ok(image) => image,
            Err(e) => {
                warn!(error = %e, "Output handler could not produce an image");
                None
            }
        };
        status.set_state(AcqState::Done);
        self.profile_stop("teardown");

        let failure = match result {
            Ok(()) | Err(DaqError::Cancelled) => finalized.err(),
            Err(e) => {
                if let Err(fin) = finalized {
                    error!(error = %fin, "Output handler failed to finalize");
                }
                Some(e)
            }
        };
        let end = if failure.is_some() { RunEnd::Failed } else { end };
        summary.finish(
            end,
            self.frames,
            self.progress,
            failure.as_ref().map(ToString::to_string),
        );

        if let Some(path) = &self.params.summary_path {
            if let Err(e) = summary.write_to(path).await {
                warn!(path = ?path, error = %e, "Couldn't write run summary");
            }
        }
        if let Some(profiler) = &self.profiler {
            info!("Acquisition profile:\n{}", profiler.report());
        }

        match failure {
            Some(source) => {
                error!(
                    progress = self.progress,
                    error = %source,
                    "Acquisition failed"
                );
                Err(DaqError::AcquisitionFailed {
                    progress: self.progress,
                    source: Box::new(source),
                })
            }
            None => {
                info!(
                    outcome = ?end,
                    frames = self.frames,
                    progress = self.progress,
                    seconds = summary.duration_secs(),
                    "Acquisition finished"
                );
                Ok(RunOutcome {
                    image,
                    end,
                    progress: self.progress,
                    frames: self.frames,
                    rows: self.params.rows.clone(),
                    summary,
                })
            }
        }
    }

    async fn prepare(&mut self, restore: &mut RestorePoint) -> AppResult<()> {
        if self.params.restore_positions {
            restore.positions = self
                .params
                .setup
                .snapshot()
                .await
                .map_err(DaqError::instrument)?;
        }
        if let Some(shutter) = self.params.setup.shutter().cloned() {
            let auto = shutter.auto_shutter().await.map_err(DaqError::instrument)?;
            restore.auto_shutter = Some(auto);
            if auto {
                shutter
                    .set_auto_shutter(false)
                    .await
                    .map_err(DaqError::instrument)?;
            }
            shutter.open_shutter().await.map_err(DaqError::instrument)?;
        }
        Ok(())
    }

    /// Best effort: every step runs even if an earlier one failed.
    async fn teardown(&mut self, restore: &RestorePoint) {
        self.params.status.set_state(AcqState::Teardown);
        self.params.status.clear_wake();

        if let Some(laser) = self.params.setup.laser() {
            if let Err(e) = laser.disable_emission().await {
                warn!(error = %e, "Couldn't switch off illumination");
            }
        }

        if let Some(shutter) = self.params.setup.shutter() {
            if let Err(e) = shutter.close_shutter().await {
                warn!(error = %e, "Couldn't close shutter");
            }
            if let Some(auto) = restore.auto_shutter {
                if let Err(e) = shutter.set_auto_shutter(auto).await {
                    warn!(error = %e, "Couldn't restore auto-shutter");
                }
            }
        }

        let mut moved = Vec::new();
        for (axis, position) in &restore.positions {
            let Some(device) = self.params.setup.axis(*axis) else {
                continue;
            };
            match device.move_abs(*position).await {
                Ok(()) => moved.push(device.clone()),
                Err(e) => warn!(%axis, position, error = %e, "Couldn't restore axis position"),
            }
        }
        if let Err(e) = try_join_all(moved.iter().map(|d| d.wait_settled())).await {
            warn!(error = %e, "Axes did not settle after restoring positions");
        }
    }

    async fn acquire(&mut self, cancel: &CancellationToken) -> AppResult<()> {
        let timepoints = self.params.timepoints;
        let row_count = self.params.rows.len();

        for timepoint in 0..timepoints {
            for row_index in 0..row_count {
                wait_while_paused(&self.params.status, self.params.pause_poll, cancel).await?;
                if cancel.is_cancelled() {
                    return Err(DaqError::Cancelled);
                }
                self.cursor = (timepoint, row_index);

                self.profile_start("stack");
                self.acquire_row(timepoint, row_index, cancel).await?;
                self.profile_stop("stack");

                self.report(timepoint, row_index, 1.0);
            }

            if timepoint + 1 < timepoints {
                self.profile_start("wait");
                let waited = self.wait_for_timepoint(timepoint, cancel).await;
                self.profile_stop("wait");
                waited?;
            }
        }
        Ok(())
    }

    async fn acquire_row(
        &mut self,
        timepoint: usize,
        row_index: usize,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let row = self.params.rows[row_index].clone();
        let drift_on = self.params.anti_drift.is_some() && !row.is_z_continuous();
        if drift_on {
            if let Some(slot) = self.drift_slot(row_index, &row) {
                slot.accumulator.start_new_stack();
            }
        }

        debug!(timepoint, row = row_index, targets = %row, "Moving to row start");
        self.params.status.set_state(AcqState::Moving);
        self.profile_start("stack/move");
        let moved = self.move_to_start(&row, cancel).await;
        self.profile_stop("stack/move");
        moved?;
        self.params.status.set_state(AcqState::Acquiring);

        let full_stack = self.params.illumination == IlluminationPolicy::FullStack;
        if full_stack {
            switch_laser(&self.params.setup, true).await?;
        }

        self.params.output.begin_stack(timepoint, row_index).await?;

        self.profile_start("stack/capture");
        let captured = if row.is_z_continuous() && self.params.continuous {
            self.sweep(timepoint, row_index, &row, cancel).await
        } else if row.is_single_slice() {
            self.snap_slice(timepoint, row_index, 0, 0.0, drift_on)
                .await
        } else {
            self.step_through(timepoint, row_index, &row, drift_on, cancel)
                .await
        };
        self.profile_stop("stack/capture");
        captured?;

        self.params.output.finalize_stack(timepoint, row_index).await?;
        if full_stack {
            switch_laser(&self.params.setup, false).await?;
        }

        if drift_on {
            self.profile_start("stack/drift");
            self.apply_drift(row_index);
            self.profile_stop("stack/drift");
        }
        Ok(())
    }

    async fn move_to_start(&mut self, row: &Row, cancel: &CancellationToken) -> AppResult<()> {
        let mut devices = Vec::new();
        for (axis, set) in row.iter() {
            let device = self.axis(axis)?;
            device
                .move_abs(set.start())
                .await
                .map_err(DaqError::instrument)?;
            devices.push(device);
        }
        interruptible(cancel, try_join_all(devices.iter().map(|d| d.wait_settled()))).await?;
        settle(self.params.settle_delay, cancel).await
    }

    async fn step_through(
        &mut self,
        timepoint: usize,
        row_index: usize,
        row: &Row,
        drift_on: bool,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let Some(z_set) = row.value_set(AxisId::Z) else {
            return self.snap_slice(timepoint, row_index, 0, 0.0, drift_on).await;
        };
        let positions = z_set.values().to_vec();
        let z_start = z_set.start();
        let z = self.axis(AxisId::Z)?;

        for (slice, position) in positions.iter().enumerate() {
            wait_while_paused(&self.params.status, self.params.pause_poll, cancel).await?;
            if cancel.is_cancelled() {
                return Err(DaqError::Cancelled);
            }

            self.params.status.set_state(AcqState::Moving);
            z.move_abs(*position).await.map_err(DaqError::instrument)?;
            interruptible(cancel, z.wait_settled()).await?;
            settle(self.params.settle_delay, cancel).await?;
            self.params.status.set_state(AcqState::Acquiring);

            self.snap_slice(timepoint, row_index, slice, position - z_start, drift_on)
                .await?;
            self.report(
                timepoint,
                row_index,
                (slice + 1) as f64 / positions.len() as f64,
            );
        }
        Ok(())
    }

    /// Continuous sweep: stream frames while Z travels to the end position.
    async fn sweep(
        &mut self,
        timepoint: usize,
        row_index: usize,
        row: &Row,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let (Some(start), Some(end), Some(speed)) = (row.z_start(), row.z_end(), row.z_velocity())
        else {
            return Err(DaqError::Configuration(format!(
                "row {} has no continuous Z sweep",
                row_index
            )));
        };
        let z = self.axis(AxisId::Z)?;
        let camera = self.params.setup.camera().clone();
        let laser = self.params.setup.laser().cloned();
        let pulse = self.params.illumination == IlluminationPolicy::PerFrame;

        let previous = z.velocity().await.map_err(DaqError::instrument)?;
        if pulse {
            if let Some(laser) = &laser {
                laser.enable_emission().await.map_err(DaqError::instrument)?;
            }
        }
        debug!(start, end, speed, previous_velocity = previous, "Starting sweep");

        let mut streaming = false;
        let result = async {
            camera.start_stream().await.map_err(DaqError::instrument)?;
            streaming = true;
            z.set_velocity(speed).await.map_err(DaqError::instrument)?;
            z.move_abs(end).await.map_err(DaqError::instrument)?;
            self.drain_sweep(
                timepoint,
                row_index,
                (start, end),
                &z,
                camera.as_ref(),
                &mut streaming,
                cancel,
            )
            .await
        }
        .await;

        let stopped = if streaming {
            camera.stop_stream().await.map_err(DaqError::instrument)
        } else {
            Ok(())
        };
        let restored = z
            .set_velocity(previous)
            .await
            .map_err(DaqError::instrument);
        if pulse {
            if let Some(laser) = &laser {
                if let Err(e) = laser.disable_emission().await {
                    warn!(error = %e, "Couldn't switch off illumination after sweep");
                }
            }
        }

        result?;
        stopped?;
        restored
    }

    #[allow(clippy::too_many_arguments)]
    async fn drain_sweep(
        &mut self,
        timepoint: usize,
        row_index: usize,
        (start, end): (f64, f64),
        z: &Arc<dyn Movable>,
        camera: &dyn FrameProducer,
        streaming: &mut bool,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let span = (end - start).abs();
        let mut slice = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(DaqError::Cancelled);
            }
            match camera.pop_frame().await.map_err(DaqError::instrument)? {
                Some(frame) => {
                    let z_pos = z.position().await.map_err(DaqError::instrument)?;
                    self.deliver(timepoint, row_index, slice, frame, z_pos - start, false)
                        .await?;
                    slice += 1;
                    let fraction = if span > 0.0 {
                        ((z_pos - start).abs() / span).clamp(0.0, 1.0)
                    } else {
                        1.0
                    };
                    self.report(timepoint, row_index, fraction);
                }
                None if !*streaming => break,
                None => {
                    if z.is_busy().await.map_err(DaqError::instrument)? {
                        sleep(SWEEP_POLL).await;
                    } else {
                        camera.stop_stream().await.map_err(DaqError::instrument)?;
                        *streaming = false;
                    }
                }
            }
        }
        debug!(frames = slice, "Sweep drained");
        Ok(())
    }

    async fn snap_slice(
        &mut self,
        timepoint: usize,
        row_index: usize,
        slice: usize,
        z_offset: f64,
        drift_on: bool,
    ) -> AppResult<()> {
        let pulse = self.params.illumination == IlluminationPolicy::PerFrame;
        if pulse {
            switch_laser(&self.params.setup, true).await?;
        }
        let snapped = self.params.setup.camera().snap().await;
        if pulse {
            switch_laser(&self.params.setup, false).await?;
        }
        let frame = snapped.map_err(DaqError::instrument)?;
        self.deliver(timepoint, row_index, slice, frame, z_offset, drift_on)
            .await
    }

    async fn deliver(
        &mut self,
        timepoint: usize,
        row_index: usize,
        slice: usize,
        frame: Frame,
        z_offset: f64,
        drift_on: bool,
    ) -> AppResult<()> {
        let setup = &self.params.setup;
        let position = setup.position().await.map_err(DaqError::instrument)?;
        let theta = setup
            .axis_position(AxisId::Theta)
            .await
            .map_err(DaqError::instrument)?;
        let meta = SliceMetadata {
            timepoint,
            row: row_index,
            slice,
            x: position.x,
            y: position.y,
            z: position.z,
            theta,
            elapsed_ms: self.started.elapsed().as_secs_f64() * 1000.0,
        };
        let tagged = TaggedFrame { frame, meta };

        if let Some(live) = &self.params.live {
            live.show(&tagged);
        }
        if drift_on {
            if let Some(slot) = self.drift.get_mut(&row_index) {
                slot.accumulator
                    .tally_slice(Vector3::new(0.0, 0.0, z_offset), &tagged.frame);
            }
        }

        self.params.output.process_slice(tagged).await?;
        self.frames += 1;
        debug!(timepoint, row = row_index, slice, z = meta.z, "Slice delivered");
        Ok(())
    }

    fn drift_slot(&mut self, row_index: usize, row: &Row) -> Option<&mut DriftSlot> {
        let factory = self.params.anti_drift.clone()?;
        Some(self.drift.entry(row_index).or_insert_with(|| {
            let mut accumulator = factory.create(row_index, row);
            let corrections = Arc::new(Mutex::new(Vec::new()));
            let sink = corrections.clone();
            accumulator.set_callback(Box::new(move |correction| sink.lock().push(correction)));
            DriftSlot {
                accumulator,
                corrections,
            }
        }))
    }

    /// Close the row's drift tally and shift the row by the reported
    /// correction. X and Y arrive in pixels.
    fn apply_drift(&mut self, row_index: usize) {
        let Some(slot) = self.drift.get_mut(&row_index) else {
            return;
        };
        slot.accumulator.finish_stack();
        let corrections: Vec<Vector3> = slot.corrections.lock().drain(..).collect();

        let pixel = self.params.setup.pixel_size_um();
        for correction in corrections {
            let shift = Vector3::new(correction.x * pixel, correction.y * pixel, correction.z);
            if shift == Vector3::ZERO {
                continue;
            }
            self.params.rows[row_index].translate(shift);
            info!(row = row_index, %shift, "Applied drift correction");
        }
    }

    async fn wait_for_timepoint(
        &mut self,
        timepoint: usize,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let target = timepoint_deadline(self.params.interval, timepoint);
        let elapsed = self.started.elapsed();
        if elapsed >= target {
            if !self.params.interval.is_zero() {
                warn!(
                    timepoint,
                    behind_ms = (elapsed - target).as_millis() as u64,
                    "Behind schedule"
                );
            }
            return Ok(());
        }

        let wait = target - elapsed;
        let wakes_at = chrono::Duration::from_std(wait)
            .ok()
            .and_then(|d| chrono::Utc::now().checked_add_signed(d))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);
        self.params.status.set_waiting_until(wakes_at);
        debug!(timepoint, wait_ms = wait.as_millis() as u64, "Waiting for next timepoint");

        let waited = interruptible(cancel, async {
            sleep(wait).await;
            Ok::<(), anyhow::Error>(())
        })
        .await;
        self.params.status.clear_wake();
        waited
    }

    fn axis(&self, axis: AxisId) -> AppResult<Arc<dyn Movable>> {
        self.params.setup.axis(axis).cloned().ok_or_else(|| {
            DaqError::Configuration(format!("no device installed for axis {}", axis))
        })
    }

    fn report(&mut self, timepoint: usize, row_index: usize, fraction: f64) {
        let rows = self.params.rows.len() as f64;
        let overall = (rows * timepoint as f64 + row_index as f64 + fraction)
            / (rows * self.params.timepoints as f64);
        self.progress = overall;
        if let Some(listener) = &self.params.progress {
            listener.report_progress(timepoint, row_index, overall);
        }
    }

    fn profile_start(&mut self, section: &str) {
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.start(section);
        }
    }

    fn profile_stop(&mut self, section: &str) {
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.stop(section);
        }
    }
}

/// Hold while the pause flag is set, polling every `poll`.
async fn wait_while_paused(
    status: &AcqStatus,
    poll: Duration,
    cancel: &CancellationToken,
) -> AppResult<()> {
    if !status.is_paused() {
        return Ok(());
    }
    status.enter_paused();
    info!("Acquisition paused");
    while status.is_paused() {
        tokio::select! {
            _ = cancel.cancelled() => {
                status.leave_paused();
                return Err(DaqError::Cancelled);
            }
            _ = sleep(poll) => {}
        }
    }
    status.leave_paused();
    info!("Acquisition resumed");
    Ok(())
}

async fn settle(delay: Duration, cancel: &CancellationToken) -> AppResult<()> {
    if delay.is_zero() {
        return Ok(());
    }
    interruptible(cancel, async {
        sleep(delay).await;
        Ok::<(), anyhow::Error>(())
    })
    .await
}

/// Switch the laser, if the setup has one.
async fn switch_laser(setup: &Setup, on: bool) -> AppResult<()> {
    let Some(laser) = setup.laser() else {
        return Ok(());
    };
    let laser: &dyn EmissionControl = laser.as_ref();
    let switched = if on {
        laser.enable_emission().await
    } else {
        laser.disable_emission().await
    };
    switched.map_err(DaqError::instrument)
}

/// Offset from the run start at which the timepoint after `timepoint` begins.
///
/// Saturates at `Duration::MAX` for intervals too large to multiply.
fn timepoint_deadline(interval: Duration, timepoint: usize) -> Duration {
    u32::try_from(timepoint + 1)
        .ok()
        .and_then(|n| interval.checked_mul(n))
        .unwrap_or(Duration::MAX)
}

/// Await a device operation unless `cancel` fires first.
async fn interruptible<T, F>(cancel: &CancellationToken, operation: F) -> AppResult<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(DaqError::Cancelled),
        result = operation => result.map_err(DaqError::instrument),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::stack_handler::StackHandler;
    use crate::experiment::row::ValueSet;
    use crate::hardware::mock::{MockCamera, MockLaser, MockShutter, MockStage};

    fn setup() -> (Setup, Arc<MockLaser>, Arc<MockShutter>) {
        let laser = Arc::new(MockLaser::new());
        let shutter = Arc::new(MockShutter::new(true));
        let mut setup = Setup::new(Arc::new(
            MockCamera::new(8, 8).with_exposure(Duration::from_millis(5)),
        ))
        .with_laser(laser.clone())
        .with_shutter(shutter.clone());
        for axis in AxisId::ALL {
            setup = setup.with_axis(axis, Arc::new(MockStage::new()));
        }
        (setup, laser, shutter)
    }

    #[tokio::test(start_paused = true)]
    async fn stepped_stack_tags_every_slice() {
        let (setup, laser, shutter) = setup();
        let row = Row::stack(10.0, 20.0, ValueSet::stepped(0.0, 4.0, 2.0).unwrap(), 0.0);
        let params = AcquisitionParams::builder(setup, Box::new(StackHandler::new()))
            .rows(vec![row])
            .build()
            .unwrap();
        let mut engine = AcquisitionEngine::new(params);
        let outcome = engine.run(&CancellationToken::new()).await.unwrap();

        assert!(outcome.is_complete());
        assert_eq!(outcome.frames, 3);
        assert!((outcome.progress - 1.0).abs() < 1e-12);
        let image = outcome.image.unwrap();
        let z: Vec<f64> = image.frames.iter().map(|f| f.meta.z).collect();
        assert_eq!(z, vec![0.0, 2.0, 4.0]);
        assert!(image.frames.iter().all(|f| f.meta.x == 10.0 && f.meta.y == 20.0));
        assert_eq!(laser.enable_count(), 3);
        assert!(!laser.is_on());
        assert!(shutter.is_auto());
        assert_eq!(engine.status().state(), AcqState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn full_stack_illumination_stays_on() {
        let (setup, laser, _) = setup();
        let row = Row::stack(0.0, 0.0, ValueSet::stepped(0.0, 4.0, 1.0).unwrap(), 0.0);
        let params = AcquisitionParams::builder(setup, Box::new(StackHandler::new()))
            .rows(vec![row])
            .illumination(IlluminationPolicy::FullStack)
            .build()
            .unwrap();
        AcquisitionEngine::new(params)
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(laser.enable_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_runs_once() {
        let (setup, _, _) = setup();
        let params = AcquisitionParams::builder(setup, Box::new(StackHandler::new()))
            .rows(vec![Row::at(0.0, 0.0, 0.0, 0.0)])
            .build()
            .unwrap();
        let mut engine = AcquisitionEngine::new(params);
        engine.run(&CancellationToken::new()).await.unwrap();
        assert!(matches!(
            engine.run(&CancellationToken::new()).await,
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn deadline_saturates_for_huge_intervals() {
        assert_eq!(
            timepoint_deadline(Duration::from_secs(2), 2),
            Duration::from_secs(6)
        );
        assert_eq!(timepoint_deadline(Duration::MAX, 1), Duration::MAX);
        assert_eq!(
            timepoint_deadline(Duration::from_secs(u64::MAX / 2), 4),
            Duration::MAX
        );
        assert_eq!(timepoint_deadline(Duration::from_secs(1), usize::MAX - 1), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_interval_waits_until_cancelled() {
        let (setup, _, _) = setup();
        let params = AcquisitionParams::builder(setup, Box::new(StackHandler::new()))
            .rows(vec![Row::at(0.0, 0.0, 0.0, 0.0)])
            .time_series(2, Duration::MAX)
            .build()
            .unwrap();
        let mut engine = AcquisitionEngine::new(params);
        let status = engine.status();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let run = tokio::spawn(async move { engine.run(&token).await });

        sleep(Duration::from_secs(1)).await;
        assert_eq!(status.state(), AcqState::Waiting);
        assert!(status.wakes_at().is_some());
        cancel.cancel();

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome.end, RunEnd::Cancelled);
        assert_eq!(outcome.frames, 1);
    }
}
