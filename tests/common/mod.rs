//! Shared fixtures for integration tests: a recording output handler and a
//! mock instrument.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use spim_daq::data::output::{ImageStack, OutputHandler, SliceMetadata, TaggedFrame};
use spim_daq::experiment::AxisId;
use spim_daq::hardware::mock::{MockCamera, MockLaser, MockShutter, MockStage};
use spim_daq::hardware::{Frame, Setup};
use spim_daq::{AppResult, DaqError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// One call into the handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Begin(usize, usize),
    Slice(usize, usize, usize),
    End(usize, usize),
    FinalizeAcquisition,
}

/// Everything the handler saw, shared with the test.
#[derive(Default)]
pub struct Journal {
    pub calls: Mutex<Vec<Call>>,
    pub frames: Mutex<Vec<TaggedFrame>>,
}

impl Journal {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn finalize_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| **c == Call::FinalizeAcquisition)
            .count()
    }

    pub fn slice_order(&self) -> Vec<usize> {
        self.frames.lock().iter().map(|f| f.meta.slice).collect()
    }
}

/// Output handler that records every call.
///
/// With a gate, each `process_slice` first takes one permit, so the test
/// decides when the consumer may make progress.
pub struct RecordingHandler {
    journal: Arc<Journal>,
    gate: Option<Arc<Semaphore>>,
    fail_on_slice: Option<usize>,
}

impl RecordingHandler {
    pub fn new() -> (Self, Arc<Journal>) {
        let journal = Arc::new(Journal::default());
        (
            Self {
                journal: journal.clone(),
                gate: None,
                fail_on_slice: None,
            },
            journal,
        )
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn failing_on_slice(mut self, index: usize) -> Self {
        self.fail_on_slice = Some(index);
        self
    }
}

#[async_trait]
impl OutputHandler for RecordingHandler {
    async fn begin_stack(&mut self, timepoint: usize, row: usize) -> AppResult<()> {
        self.journal.calls.lock().push(Call::Begin(timepoint, row));
        Ok(())
    }

    async fn process_slice(&mut self, frame: TaggedFrame) -> AppResult<()> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| DaqError::Output(e.to_string()))?
                .forget();
        }
        let received = self.journal.frames.lock().len();
        if self.fail_on_slice == Some(received) {
            return Err(DaqError::Output("disk full".into()));
        }
        let SliceMetadata {
            timepoint,
            row,
            slice,
            ..
        } = frame.meta;
        self.journal
            .calls
            .lock()
            .push(Call::Slice(timepoint, row, slice));
        self.journal.frames.lock().push(frame);
        Ok(())
    }

    async fn finalize_stack(&mut self, timepoint: usize, row: usize) -> AppResult<()> {
        self.journal.calls.lock().push(Call::End(timepoint, row));
        Ok(())
    }

    async fn finalize_acquisition(&mut self) -> AppResult<()> {
        self.journal.calls.lock().push(Call::FinalizeAcquisition);
        Ok(())
    }

    async fn image(&mut self) -> AppResult<Option<ImageStack>> {
        Ok(Some(ImageStack {
            frames: self.journal.frames.lock().clone(),
        }))
    }
}

/// Mock devices the tests inspect after a run.
pub struct Rig {
    pub setup: Setup,
    pub stages: Vec<(AxisId, Arc<MockStage>)>,
    pub camera: Arc<MockCamera>,
    pub laser: Arc<MockLaser>,
    pub shutter: Arc<MockShutter>,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_camera(MockCamera::new(16, 16).with_exposure(Duration::from_millis(1)))
    }

    pub fn with_camera(camera: MockCamera) -> Self {
        let camera = Arc::new(camera);
        let laser = Arc::new(MockLaser::new());
        let shutter = Arc::new(MockShutter::new(true));
        let mut setup = Setup::new(camera.clone())
            .with_laser(laser.clone())
            .with_shutter(shutter.clone());
        let mut stages = Vec::new();
        for axis in AxisId::ALL {
            let stage = Arc::new(MockStage::with_velocity(0.0, 10_000.0));
            setup = setup.with_axis(axis, stage.clone());
            stages.push((axis, stage));
        }
        Self {
            setup,
            stages,
            camera,
            laser,
            shutter,
        }
    }

    pub fn with_pixel_size(mut self, pixel_size_um: f64) -> Self {
        self.setup = self.setup.with_pixel_size(pixel_size_um);
        self
    }

    pub fn stage(&self, axis: AxisId) -> Arc<MockStage> {
        self.stages
            .iter()
            .find(|(a, _)| *a == axis)
            .map(|(_, s)| s.clone())
            .unwrap()
    }

    pub fn total_moves(&self) -> usize {
        self.stages.iter().map(|(_, s)| s.moves().len()).sum()
    }
}

pub fn tagged(timepoint: usize, row: usize, slice: usize) -> TaggedFrame {
    TaggedFrame {
        frame: Frame::from_u16(4, 4, &[slice as u16; 16]),
        meta: SliceMetadata {
            timepoint,
            row,
            slice,
            x: 0.0,
            y: 0.0,
            z: slice as f64,
            theta: 0.0,
            elapsed_ms: 0.0,
        },
    }
}
