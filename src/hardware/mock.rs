//! Mock Hardware Implementations
//!
//! Provides simulated devices for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep),
//! so tests can run them under a paused tokio clock.
//!
//! # Available Mocks
//!
//! - `MockStage` - Simulated axis with velocity-limited, non-blocking moves
//! - `MockCamera` - Simulated camera with snap and buffered streaming
//! - `MockLaser` - Switchable light source that counts its pulses
//! - `MockShutter` - Core shutter with auto-shutter flag

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

use crate::hardware::capabilities::{EmissionControl, FrameProducer, Movable, ShutterControl};
use crate::hardware::Frame;

// =============================================================================
// MockStage - Simulated Motion Stage
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Motion {
    from: f64,
    to: f64,
    started: Instant,
    velocity: f64,
}

impl Motion {
    fn position_at(&self, now: Instant) -> (f64, bool) {
        let distance = self.to - self.from;
        let travelled = now.duration_since(self.started).as_secs_f64() * self.velocity;
        if travelled >= distance.abs() {
            (self.to, true)
        } else {
            (self.from + travelled.copysign(distance), false)
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        let elapsed = now.duration_since(self.started).as_secs_f64();
        let total = (self.to - self.from).abs() / self.velocity;
        Duration::from_secs_f64((total - elapsed).max(0.0))
    }
}

#[derive(Debug)]
struct StageState {
    position: f64,
    velocity: f64,
    motion: Option<Motion>,
    moves: Vec<f64>,
    velocity_log: Vec<f64>,
    fail_after: Option<usize>,
}

impl StageState {
    fn refresh(&mut self, now: Instant) {
        if let Some(motion) = self.motion {
            let (pos, done) = motion.position_at(now);
            self.position = pos;
            if done {
                self.motion = None;
            }
        }
    }
}

/// Mock motion stage
///
/// `move_abs` returns immediately; the simulated position then travels toward
/// the target at the configured velocity (units per second) on the tokio
/// clock. Every commanded target is recorded for inspection.
///
/// # Example
///
/// ```rust,ignore
/// let stage = MockStage::with_velocity(0.0, 100.0);
/// stage.move_abs(50.0).await?; // returns immediately
/// assert!(stage.is_busy().await?);
/// stage.wait_settled().await?; // ~0.5 s of tokio time
/// ```
pub struct MockStage {
    state: Mutex<StageState>,
    settle_time: Duration,
}

impl MockStage {
    /// Create new mock stage at position 0.0 moving at 1000 units/s
    pub fn new() -> Self {
        Self::with_velocity(0.0, 1000.0)
    }

    /// Create new mock stage at the given position
    pub fn with_position(initial_position: f64) -> Self {
        Self::with_velocity(initial_position, 1000.0)
    }

    /// Create mock stage with custom position and velocity
    pub fn with_velocity(initial_position: f64, velocity: f64) -> Self {
        Self {
            state: Mutex::new(StageState {
                position: initial_position,
                velocity,
                motion: None,
                moves: Vec::new(),
                velocity_log: Vec::new(),
                fail_after: None,
            }),
            settle_time: Duration::from_millis(5),
        }
    }

    /// Make every move after the first `count` fail.
    pub fn fail_after(self, count: usize) -> Self {
        self.state.lock().fail_after = Some(count);
        self
    }

    /// All targets commanded so far, in order.
    pub fn moves(&self) -> Vec<f64> {
        self.state.lock().moves.clone()
    }

    /// All velocities set so far, in order.
    pub fn velocity_log(&self) -> Vec<f64> {
        self.state.lock().velocity_log.clone()
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Movable for MockStage {
    async fn move_abs(&self, target: f64) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if let Some(limit) = state.fail_after {
            if state.moves.len() >= limit {
                return Err(anyhow!("MockStage: simulated fault moving to {target:.3}"));
            }
        }
        state.refresh(now);
        state.moves.push(target);
        let velocity = state.velocity;
        if velocity <= 0.0 || (state.position - target).abs() < f64::EPSILON {
            state.position = target;
            state.motion = None;
        } else {
            state.motion = Some(Motion {
                from: state.position,
                to: target,
                started: now,
                velocity,
            });
        }
        tracing::trace!(target_position = target, "MockStage: move started");
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        let mut state = self.state.lock();
        state.refresh(Instant::now());
        Ok(state.position)
    }

    async fn is_busy(&self) -> Result<bool> {
        let mut state = self.state.lock();
        state.refresh(Instant::now());
        Ok(state.motion.is_some())
    }

    async fn wait_settled(&self) -> Result<()> {
        loop {
            let remaining = {
                let mut state = self.state.lock();
                let now = Instant::now();
                state.refresh(now);
                match state.motion {
                    Some(motion) => motion.remaining(now),
                    None => break,
                }
            };
            sleep(remaining.max(Duration::from_millis(1))).await;
        }
        // CRITICAL: Use tokio::time::sleep, NOT std::thread::sleep
        sleep(self.settle_time).await;
        Ok(())
    }

    async fn set_velocity(&self, velocity: f64) -> Result<()> {
        if velocity <= 0.0 {
            anyhow::bail!("MockStage: velocity must be positive, got {velocity}");
        }
        let mut state = self.state.lock();
        state.velocity = velocity;
        state.velocity_log.push(velocity);
        Ok(())
    }

    async fn velocity(&self) -> Result<f64> {
        Ok(self.state.lock().velocity)
    }

    async fn home(&self) -> Result<()> {
        self.move_abs(0.0).await?;
        self.wait_settled().await
    }
}

// =============================================================================
// MockCamera - Simulated Camera
// =============================================================================

/// Image content produced by [`MockCamera`].
#[derive(Debug, Clone, Copy)]
pub enum MockPattern {
    /// Horizontal ramp offset by the frame sequence number.
    Gradient,
    /// Gaussian spot on a dark background.
    Spot {
        /// Spot center, pixels
        x: f64,
        /// Spot center, pixels
        y: f64,
        /// Standard deviation, pixels
        sigma: f64,
        /// Peak value above background
        amplitude: f64,
    },
}

/// Mock camera with snap and streaming support
///
/// Simulates a 16-bit camera with:
/// - Configurable resolution and exposure
/// - A frame buffer filled by a background task while streaming
/// - Optional failure after a given number of snaps
pub struct MockCamera {
    resolution: (u32, u32),
    exposure: Duration,
    pattern: Mutex<MockPattern>,
    frame_count: Arc<AtomicU64>,
    streaming: Arc<AtomicBool>,
    buffer: Arc<Mutex<VecDeque<Frame>>>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
    fail_after: Option<u64>,
}

impl MockCamera {
    /// Create a camera with the given resolution and a 10 ms exposure.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            resolution: (width, height),
            exposure: Duration::from_millis(10),
            pattern: Mutex::new(MockPattern::Gradient),
            frame_count: Arc::new(AtomicU64::new(0)),
            streaming: Arc::new(AtomicBool::new(false)),
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            stream_task: Mutex::new(None),
            fail_after: None,
        }
    }

    /// Set the exposure, which is also the streaming frame interval.
    pub fn with_exposure(mut self, exposure: Duration) -> Self {
        self.exposure = exposure;
        self
    }

    /// Make every snap after the first `count` fail.
    pub fn fail_after(mut self, count: u64) -> Self {
        self.fail_after = Some(count);
        self
    }

    /// Change what subsequent frames show.
    pub fn set_pattern(&self, pattern: MockPattern) {
        *self.pattern.lock() = pattern;
    }

    fn render(resolution: (u32, u32), pattern: MockPattern, sequence: u64) -> Frame {
        let (width, height) = resolution;
        let mut pixels = Vec::with_capacity((width as usize) * (height as usize));
        for y in 0..height {
            for x in 0..width {
                let value = match pattern {
                    MockPattern::Gradient => ((u64::from(x) + sequence) % 4096) as f64,
                    MockPattern::Spot {
                        x: cx,
                        y: cy,
                        sigma,
                        amplitude,
                    } => {
                        let dx = f64::from(x) - cx;
                        let dy = f64::from(y) - cy;
                        100.0 + amplitude * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
                    }
                };
                pixels.push(value.clamp(0.0, f64::from(u16::MAX)) as u16);
            }
        }
        Frame::from_u16(width, height, &pixels)
    }
}

#[async_trait]
impl FrameProducer for MockCamera {
    async fn snap(&self) -> Result<Frame> {
        let sequence = self.frame_count.load(Ordering::SeqCst);
        if let Some(limit) = self.fail_after {
            if sequence >= limit {
                return Err(anyhow!("MockCamera: simulated readout failure"));
            }
        }
        sleep(self.exposure).await;
        self.frame_count.fetch_add(1, Ordering::SeqCst);
        let pattern = *self.pattern.lock();
        Ok(Self::render(self.resolution, pattern, sequence))
    }

    async fn start_stream(&self) -> Result<()> {
        if self.streaming.swap(true, Ordering::SeqCst) {
            anyhow::bail!("MockCamera: already streaming");
        }

        let streaming = self.streaming.clone();
        let buffer = self.buffer.clone();
        let frame_count = self.frame_count.clone();
        let resolution = self.resolution;
        let pattern = *self.pattern.lock();
        let interval = self.exposure.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            while streaming.load(Ordering::SeqCst) {
                sleep(interval).await;
                if !streaming.load(Ordering::SeqCst) {
                    break;
                }
                let sequence = frame_count.fetch_add(1, Ordering::SeqCst);
                buffer
                    .lock()
                    .push_back(Self::render(resolution, pattern, sequence));
            }
        });
        *self.stream_task.lock() = Some(handle);
        Ok(())
    }

    async fn stop_stream(&self) -> Result<()> {
        self.streaming.store(false, Ordering::SeqCst);
        let handle = self.stream_task.lock().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| anyhow!("MockCamera: stream task failed: {e}"))?;
        }
        Ok(())
    }

    async fn pop_frame(&self) -> Result<Option<Frame>> {
        Ok(self.buffer.lock().pop_front())
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }
}

// =============================================================================
// MockLaser / MockShutter
// =============================================================================

/// Mock laser that counts how often it was switched on.
#[derive(Default)]
pub struct MockLaser {
    emitting: AtomicBool,
    enable_count: AtomicU64,
}

impl MockLaser {
    /// Create a laser with emission off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of off-to-on transitions.
    pub fn enable_count(&self) -> u64 {
        self.enable_count.load(Ordering::SeqCst)
    }

    /// Current emission state.
    pub fn is_on(&self) -> bool {
        self.emitting.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmissionControl for MockLaser {
    async fn enable_emission(&self) -> Result<()> {
        if !self.emitting.swap(true, Ordering::SeqCst) {
            self.enable_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn disable_emission(&self) -> Result<()> {
        self.emitting.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_emission_enabled(&self) -> Result<bool> {
        Ok(self.is_on())
    }
}

/// Mock core shutter.
pub struct MockShutter {
    open: AtomicBool,
    auto: AtomicBool,
}

impl MockShutter {
    /// Create a closed shutter with the given auto-shutter setting.
    pub fn new(auto: bool) -> Self {
        Self {
            open: AtomicBool::new(false),
            auto: AtomicBool::new(auto),
        }
    }

    /// Current auto-shutter flag.
    pub fn is_auto(&self) -> bool {
        self.auto.load(Ordering::SeqCst)
    }
}

impl Default for MockShutter {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl ShutterControl for MockShutter {
    async fn open_shutter(&self) -> Result<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close_shutter(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_shutter_open(&self) -> Result<bool> {
        Ok(self.open.load(Ordering::SeqCst))
    }

    async fn auto_shutter(&self) -> Result<bool> {
        Ok(self.is_auto())
    }

    async fn set_auto_shutter(&self, enabled: bool) -> Result<()> {
        self.auto.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stage_moves_at_configured_velocity() {
        let stage = MockStage::with_velocity(0.0, 100.0);
        stage.move_abs(50.0).await.unwrap();
        assert!(stage.is_busy().await.unwrap());

        sleep(Duration::from_millis(250)).await;
        let mid = stage.position().await.unwrap();
        assert!((mid - 25.0).abs() < 1.0, "mid-travel position {mid}");

        stage.wait_settled().await.unwrap();
        assert!(!stage.is_busy().await.unwrap());
        assert_eq!(stage.position().await.unwrap(), 50.0);
        assert_eq!(stage.moves(), vec![50.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn stage_fault_injection() {
        let stage = MockStage::new().fail_after(1);
        stage.move_abs(1.0).await.unwrap();
        assert!(stage.move_abs(2.0).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn camera_streams_into_buffer() {
        let camera = MockCamera::new(4, 4).with_exposure(Duration::from_millis(10));
        camera.start_stream().await.unwrap();
        sleep(Duration::from_millis(55)).await;
        camera.stop_stream().await.unwrap();

        let mut popped = 0;
        while camera.pop_frame().await.unwrap().is_some() {
            popped += 1;
        }
        assert!(popped >= 4, "popped {popped}");
        assert_eq!(camera.frame_count(), popped);
    }

    #[tokio::test(start_paused = true)]
    async fn spot_pattern_peaks_at_center() {
        let camera = MockCamera::new(9, 9);
        camera.set_pattern(MockPattern::Spot {
            x: 4.0,
            y: 4.0,
            sigma: 1.0,
            amplitude: 1000.0,
        });
        let frame = camera.snap().await.unwrap();
        assert_eq!(frame.get(4, 4), Some(1100));
        assert!(frame.get(0, 0).unwrap() < 200);
    }

    #[tokio::test]
    async fn laser_counts_pulses() {
        let laser = MockLaser::new();
        laser.enable_emission().await.unwrap();
        laser.enable_emission().await.unwrap();
        laser.disable_emission().await.unwrap();
        laser.enable_emission().await.unwrap();
        assert_eq!(laser.enable_count(), 2);
        assert!(laser.is_on());
    }
}
