//! Output pipeline: the handler contract, concrete handlers and the async
//! quota-bounded wrapper.

pub mod async_output;
pub mod output;
pub mod resources;
pub mod stack_handler;
#[cfg(feature = "storage_tiff")]
pub mod tiff_handler;

pub use async_output::{AsyncOutputConfig, AsyncOutputWrapper, AsyncStats};
pub use output::{ImageStack, OutputHandler, SliceMetadata, TaggedFrame};
pub use stack_handler::StackHandler;
