//! In-memory stack builder.

use async_trait::async_trait;

use crate::data::output::{ImageStack, OutputHandler, TaggedFrame};
use crate::error::{AppResult, DaqError};

/// Keeps every frame in memory and hands the whole set back from `image`.
#[derive(Debug, Default)]
pub struct StackHandler {
    stack: ImageStack,
    open_stack: Option<(usize, usize)>,
    stacks_completed: usize,
    finalized: bool,
}

impl StackHandler {
    /// An empty handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stacks finished so far.
    pub fn stacks_completed(&self) -> usize {
        self.stacks_completed
    }
}

#[async_trait]
impl OutputHandler for StackHandler {
    async fn begin_stack(&mut self, timepoint: usize, row: usize) -> AppResult<()> {
        if let Some((tp, r)) = self.open_stack {
            return Err(DaqError::Output(format!(
                "stack ({}, {}) begun while ({}, {}) is still open",
                timepoint, row, tp, r
            )));
        }
        self.open_stack = Some((timepoint, row));
        Ok(())
    }

    async fn process_slice(&mut self, frame: TaggedFrame) -> AppResult<()> {
        if self.finalized {
            return Err(DaqError::Output("slice received after finalize".into()));
        }
        self.stack.frames.push(frame);
        Ok(())
    }

    async fn finalize_stack(&mut self, timepoint: usize, row: usize) -> AppResult<()> {
        self.open_stack = None;
        self.stacks_completed += 1;
        tracing::debug!(
            timepoint,
            row,
            frames = self.stack.stack(timepoint, row).count(),
            "Stack complete"
        );
        Ok(())
    }

    async fn finalize_acquisition(&mut self) -> AppResult<()> {
        self.finalized = true;
        self.open_stack = None;
        Ok(())
    }

    async fn image(&mut self) -> AppResult<Option<ImageStack>> {
        Ok(Some(self.stack.clone()))
    }
}
