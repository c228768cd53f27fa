//! Atomic Hardware Capabilities
//!
//! The acquisition engine never sees a concrete driver. Each device on the
//! instrument implements the small capability traits it actually supports:
//!
//! - A translation or rotation stage implements `Movable`
//! - The camera implements `FrameProducer`
//! - The illumination laser implements `EmissionControl`
//! - The core shutter implements `ShutterControl`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! Optional operations come with a default implementation that returns an
//! error, so a driver only has to provide what its hardware can do.

use anyhow::Result;
use async_trait::async_trait;

use crate::hardware::Frame;

/// Capability: Motion Control
///
/// Devices that can move to positions (X/Y/Z stages, rotation stages).
///
/// # Contract
/// - Positions are in microns for linear axes and degrees for rotation
/// - `move_abs` initiates motion and may return before completion
/// - `is_busy` reports whether motion is still in progress
/// - `wait_settled` blocks until motion completes
/// - `position` returns current position (may be approximate during motion)
///
/// # Thread Safety
/// - All methods are async and require `&self` (immutable reference)
/// - Interior mutability (Mutex/RwLock) should be used for state
#[async_trait]
pub trait Movable: Send + Sync {
    /// Start moving to an absolute position.
    ///
    /// # Returns
    /// - Ok(()) if motion initiated successfully
    /// - Err if position is out of range or hardware error
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Current position; approximate while moving.
    async fn position(&self) -> Result<f64>;

    /// Whether the axis is still in motion.
    async fn is_busy(&self) -> Result<bool>;

    /// Wait for motion to settle
    ///
    /// Blocks until device reports motion is complete.
    /// Should have internal timeout to prevent infinite blocking.
    async fn wait_settled(&self) -> Result<()>;

    /// Set the motion velocity used by subsequent moves.
    ///
    /// # Default Implementation
    /// Returns an error indicating velocity control is not supported.
    async fn set_velocity(&self, _velocity: f64) -> Result<()> {
        anyhow::bail!("Velocity control not supported by this device")
    }

    /// Current motion velocity.
    ///
    /// # Default Implementation
    /// Returns an error indicating velocity control is not supported.
    async fn velocity(&self) -> Result<f64> {
        anyhow::bail!("Velocity query not supported by this device")
    }

    /// Drive the axis to its reference position.
    ///
    /// # Default Implementation
    /// Returns an error indicating homing is not supported.
    async fn home(&self) -> Result<()> {
        anyhow::bail!("Homing not supported by this device")
    }
}

/// Capability: Frame/Image Production
///
/// Devices that produce 2D image frames.
///
/// # Contract
/// - `snap()` acquires exactly one frame and returns it
/// - `start_stream()` begins sequence acquisition into the device's frame buffer
/// - `pop_frame()` drains the oldest buffered frame; `None` when the buffer is empty
/// - `stop_stream()` halts acquisition; frames already buffered stay poppable
#[async_trait]
pub trait FrameProducer: Send + Sync {
    /// Acquire a single frame.
    async fn snap(&self) -> Result<Frame>;

    /// Start continuous sequence acquisition.
    ///
    /// # Returns
    /// - Ok(()) if streaming started
    /// - Err if already streaming or hardware error
    async fn start_stream(&self) -> Result<()>;

    /// Stop sequence acquisition.
    async fn stop_stream(&self) -> Result<()>;

    /// Take the oldest frame from the device buffer.
    async fn pop_frame(&self) -> Result<Option<Frame>>;

    /// Get frame resolution (width, height)
    fn resolution(&self) -> (u32, u32);

    /// Frames captured since the device was created.
    ///
    /// # Default Implementation
    /// Returns 0 (no frame count tracking)
    fn frame_count(&self) -> u64 {
        0
    }
}

/// Capability: Emission Control
///
/// Light sources whose output can be switched (the illumination laser).
#[async_trait]
pub trait EmissionControl: Send + Sync {
    /// Enable emission (turn on the source)
    async fn enable_emission(&self) -> Result<()>;

    /// Disable emission (turn off the source)
    async fn disable_emission(&self) -> Result<()>;

    /// Query emission state
    ///
    /// # Default Implementation
    /// Returns error indicating state query is not supported.
    async fn is_emission_enabled(&self) -> Result<bool> {
        anyhow::bail!("Emission state query not supported by this device")
    }
}

/// Capability: Shutter Control
///
/// The instrument's core shutter. With auto-shutter enabled the shutter opens
/// for every snap on its own; the engine turns this off for the duration of a
/// run and restores it afterwards.
#[async_trait]
pub trait ShutterControl: Send + Sync {
    /// Open the shutter (allow beam to pass)
    async fn open_shutter(&self) -> Result<()>;

    /// Close the shutter (block beam)
    async fn close_shutter(&self) -> Result<()>;

    /// Query shutter state
    async fn is_shutter_open(&self) -> Result<bool>;

    /// Whether the shutter follows camera exposures automatically.
    async fn auto_shutter(&self) -> Result<bool>;

    /// Enable or disable automatic shuttering.
    async fn set_auto_shutter(&self, enabled: bool) -> Result<()>;
}
