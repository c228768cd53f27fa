//! Output handler contract.
//!
//! The engine pushes every captured frame through an [`OutputHandler`]. The
//! call sequence for one run is always
//!
//! ```text
//! ( begin_stack  process_slice*  finalize_stack )*  finalize_acquisition
//! ```
//!
//! with `finalize_acquisition` called exactly once, also when the run is
//! cancelled or fails. Handlers are never called concurrently.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::hardware::Frame;

/// Where and when a frame was captured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SliceMetadata {
    /// Timepoint index
    pub timepoint: usize,
    /// Row (view) index within the timepoint
    pub row: usize,
    /// Slice index within the stack
    pub slice: usize,
    /// Stage X at capture, microns
    pub x: f64,
    /// Stage Y at capture, microns
    pub y: f64,
    /// Stage Z at capture, microns
    pub z: f64,
    /// Rotation at capture, degrees
    pub theta: f64,
    /// Milliseconds since the run started
    pub elapsed_ms: f64,
}

/// A frame plus its capture metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedFrame {
    /// Pixel data
    pub frame: Frame,
    /// Capture metadata
    pub meta: SliceMetadata,
}

/// Frames accumulated by a handler, in delivery order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageStack {
    /// Frames in the order they were received
    pub frames: Vec<TaggedFrame>,
}

impl ImageStack {
    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the stack holds no frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames belonging to one stack.
    pub fn stack(&self, timepoint: usize, row: usize) -> impl Iterator<Item = &TaggedFrame> {
        self.frames
            .iter()
            .filter(move |f| f.meta.timepoint == timepoint && f.meta.row == row)
    }
}

/// Consumer of captured frames.
///
/// `image` may be called at any time, including mid-run, and returns what the
/// handler has accumulated so far (or `None` if it keeps nothing in memory).
#[async_trait]
pub trait OutputHandler: Send {
    /// A stack for `(timepoint, row)` starts.
    async fn begin_stack(&mut self, timepoint: usize, row: usize) -> AppResult<()>;

    /// One captured frame.
    async fn process_slice(&mut self, frame: TaggedFrame) -> AppResult<()>;

    /// The stack for `(timepoint, row)` is complete.
    async fn finalize_stack(&mut self, timepoint: usize, row: usize) -> AppResult<()>;

    /// The run is over; flush and close everything.
    async fn finalize_acquisition(&mut self) -> AppResult<()>;

    /// Accumulated result so far.
    async fn image(&mut self) -> AppResult<Option<ImageStack>>;
}

#[async_trait]
impl<T: OutputHandler + ?Sized> OutputHandler for Box<T> {
    async fn begin_stack(&mut self, timepoint: usize, row: usize) -> AppResult<()> {
        (**self).begin_stack(timepoint, row).await
    }

    async fn process_slice(&mut self, frame: TaggedFrame) -> AppResult<()> {
        (**self).process_slice(frame).await
    }

    async fn finalize_stack(&mut self, timepoint: usize, row: usize) -> AppResult<()> {
        (**self).finalize_stack(timepoint, row).await
    }

    async fn finalize_acquisition(&mut self) -> AppResult<()> {
        (**self).finalize_acquisition().await
    }

    async fn image(&mut self) -> AppResult<Option<ImageStack>> {
        (**self).image().await
    }
}
