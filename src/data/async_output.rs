//! Asynchronous, quota-bounded output pipeline.
//!
//! [`AsyncOutputWrapper`] decorates any [`OutputHandler`] so the capture loop
//! never waits on storage I/O under normal conditions:
//!
//! - Every call becomes a [`Message`] in a bounded FIFO queue.
//! - Frames stay in memory while the process is under its memory quota and
//!   are spilled to `async-temp/` beside the output otherwise.
//! - A single background worker replays messages against the wrapped
//!   handler in order, reading spilled frames back and deleting their files.
//! - When both the memory and the disk quota are exceeded, the producer
//!   drains one message itself before queueing another (backpressure).
//!
//! Failures on the worker are stored and returned by the next call into the
//! wrapper.
//!
//! ```rust,ignore
//! let wrapper = AsyncOutputWrapper::builder(Box::new(StackHandler::new()))
//!     .output_dir("/data/run-42")
//!     .config(AsyncOutputConfig::default())
//!     .spawn()
//!     .await?;
//! ```

use async_trait::async_trait;
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::data::output::{ImageStack, OutputHandler, SliceMetadata, TaggedFrame};
use crate::data::resources::{ResourceProbe, SysinfoProbe};
use crate::error::{AppResult, DaqError};
use crate::hardware::Frame;

/// Name of the spill directory created inside the output directory.
pub const TEMP_DIR_NAME: &str = "async-temp";

const IDLE_POLL: Duration = Duration::from_millis(50);
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Tuning for [`AsyncOutputWrapper`].
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncOutputConfig {
    /// Memory fraction above which frames are spilled to disk
    pub memory_quota: f64,
    /// Disk fraction above which (together with memory) the producer drains
    pub disk_quota: f64,
    /// Freed-to-buffered ratio that triggers a reclaim hint
    pub freed_gc_ratio: f64,
    /// Queue bound
    pub queue_capacity: usize,
    /// Worker pause between messages while a stack is being captured
    pub slowed_interval: Duration,
    /// How long `finalize_acquisition` waits for the worker to drain
    pub finalize_timeout: Duration,
    /// Log queue statistics at this interval
    pub monitor_interval: Option<Duration>,
}

impl Default for AsyncOutputConfig {
    fn default() -> Self {
        Self {
            memory_quota: 0.75,
            disk_quota: 0.9,
            freed_gc_ratio: 0.5,
            queue_capacity: 1024,
            slowed_interval: Duration::from_millis(250),
            finalize_timeout: Duration::from_secs(300),
            monitor_interval: None,
        }
    }
}

impl AsyncOutputConfig {
    /// Check ranges.
    pub fn validate(&self) -> AppResult<()> {
        for (name, value) in [
            ("memory_quota", self.memory_quota),
            ("disk_quota", self.disk_quota),
            ("freed_gc_ratio", self.freed_gc_ratio),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(DaqError::Configuration(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.queue_capacity == 0 {
            return Err(DaqError::Configuration(
                "queue_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Unit of work in the async queue.
#[derive(Debug)]
pub enum Message {
    /// `begin_stack(timepoint, row)`
    BeginStack {
        #[allow(missing_docs)]
        timepoint: usize,
        #[allow(missing_docs)]
        row: usize,
    },
    /// `finalize_stack(timepoint, row)`
    EndStack {
        #[allow(missing_docs)]
        timepoint: usize,
        #[allow(missing_docs)]
        row: usize,
    },
    /// A frame held in memory.
    InMemory(TaggedFrame),
    /// A frame spilled to a temp file.
    OnDisk {
        /// Spill file
        path: PathBuf,
        /// File size, counted against the disk quota
        bytes: u64,
        /// Capture metadata
        meta: SliceMetadata,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
/// What the consumer is currently replaying.
pub enum Writing {
    #[allow(missing_docs)]
    Idle = 0,
    #[allow(missing_docs)]
    BeginStack = 1,
    #[allow(missing_docs)]
    Memory = 2,
    #[allow(missing_docs)]
    Disk = 3,
    #[allow(missing_docs)]
    EndStack = 4,
}

impl Writing {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Writing::BeginStack,
            2 => Writing::Memory,
            3 => Writing::Disk,
            4 => Writing::EndStack,
            _ => Writing::Idle,
        }
    }
}

/// Snapshot of the pipeline's counters.
#[derive(Debug, Clone, Serialize)]
pub struct AsyncStats {
    /// Messages waiting in the queue
    pub queued: usize,
    /// Frames waiting in memory
    pub in_memory: usize,
    /// Frames waiting on disk
    pub on_disk: usize,
    /// Bytes currently held in spill files
    pub spilled_bytes: u64,
    /// Frames delivered to the wrapped handler
    pub frames_delivered: u64,
    /// Frames written to spill files over the whole run
    pub frames_spilled: u64,
    /// Freed-to-buffered ratio since the last reclaim
    pub freed_ratio: f64,
    /// Reclaim hints issued
    pub reclaims: u64,
    /// Whether a stack is being captured
    pub slowed: bool,
    /// What the consumer is doing
    pub writing: Writing,
}

type ReclaimHook = Arc<dyn Fn() + Send + Sync>;

struct Shared {
    queue: ArrayQueue<Message>,
    handler: tokio::sync::Mutex<Box<dyn OutputHandler>>,
    probe: Arc<dyn ResourceProbe>,
    reclaim: Option<ReclaimHook>,
    config: AsyncOutputConfig,
    temp_dir: PathBuf,
    in_memory: AtomicUsize,
    on_disk: AtomicUsize,
    freed: AtomicUsize,
    delivered: AtomicU64,
    spilled: AtomicU64,
    reclaims: AtomicU64,
    used_bytes: AtomicU64,
    slowed: AtomicBool,
    finishing: AtomicBool,
    writing: AtomicU8,
    failure: Mutex<Option<String>>,
    wake: Notify,
    release: Notify,
}

impl Shared {
    fn check_failure(&self) -> AppResult<()> {
        match self.failure.lock().as_ref() {
            Some(message) => Err(DaqError::AsyncWriter(message.clone())),
            None => Ok(()),
        }
    }

    fn record_failure(&self, err: &DaqError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err.to_string());
        }
    }

    fn memory_fraction(&self) -> f64 {
        self.probe.memory_fraction()
    }

    fn disk_fraction(&self) -> f64 {
        let used = self.used_bytes.load(Ordering::SeqCst);
        match self.probe.free_disk_bytes(&self.temp_dir) {
            Some(free) => used as f64 / (used as f64 + free as f64 + 1.0),
            None => 0.0,
        }
    }

    fn stats(&self) -> AsyncStats {
        let in_memory = self.in_memory.load(Ordering::SeqCst);
        let freed = self.freed.load(Ordering::SeqCst);
        AsyncStats {
            queued: self.queue.len(),
            in_memory,
            on_disk: self.on_disk.load(Ordering::SeqCst),
            spilled_bytes: self.used_bytes.load(Ordering::SeqCst),
            frames_delivered: self.delivered.load(Ordering::SeqCst),
            frames_spilled: self.spilled.load(Ordering::SeqCst),
            freed_ratio: freed as f64 / (in_memory + freed + 1) as f64,
            reclaims: self.reclaims.load(Ordering::SeqCst),
            slowed: self.slowed.load(Ordering::SeqCst),
            writing: Writing::from_u8(self.writing.load(Ordering::SeqCst)),
        }
    }

    /// Replay the oldest message. Returns `false` when the queue was empty.
    ///
    /// The handler lock is taken before popping, so concurrent consumers
    /// deliver in queue order.
    async fn handle_next(&self, triage: bool) -> AppResult<bool> {
        let mut handler = self.handler.lock().await;
        let Some(message) = self.queue.pop() else {
            return Ok(false);
        };

        let result = self.dispatch(handler.as_mut(), message).await;
        self.writing.store(Writing::Idle as u8, Ordering::SeqCst);
        drop(handler);
        result?;

        self.maybe_reclaim(triage);
        Ok(true)
    }

    async fn dispatch(&self, handler: &mut dyn OutputHandler, message: Message) -> AppResult<()> {
        match message {
            Message::BeginStack { timepoint, row } => {
                self.writing.store(Writing::BeginStack as u8, Ordering::SeqCst);
                handler.begin_stack(timepoint, row).await
            }
            Message::InMemory(frame) => {
                self.writing.store(Writing::Memory as u8, Ordering::SeqCst);
                self.in_memory.fetch_sub(1, Ordering::SeqCst);
                handler.process_slice(frame).await?;
                self.freed.fetch_add(1, Ordering::SeqCst);
                self.delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Message::OnDisk { path, bytes, meta } => {
                self.writing.store(Writing::Disk as u8, Ordering::SeqCst);
                let frame = read_spill(&path).await;
                self.on_disk.fetch_sub(1, Ordering::SeqCst);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = ?path, error = %e, "Couldn't delete temporary async image");
                } else {
                    self.used_bytes.fetch_sub(bytes, Ordering::SeqCst);
                }
                handler.process_slice(TaggedFrame { frame: frame?, meta }).await?;
                self.delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Message::EndStack { timepoint, row } => {
                self.writing.store(Writing::EndStack as u8, Ordering::SeqCst);
                handler.finalize_stack(timepoint, row).await
            }
        }
    }

    fn maybe_reclaim(&self, triage: bool) {
        let freed = self.freed.load(Ordering::SeqCst);
        if freed == 0 {
            return;
        }
        let ratio = freed as f64 / (self.in_memory.load(Ordering::SeqCst) + freed + 1) as f64;
        let threshold = self.config.freed_gc_ratio;
        let slowed = self.slowed.load(Ordering::SeqCst);
        if (triage && ratio > threshold / 4.0) || (!slowed && ratio > threshold) {
            self.freed.store(0, Ordering::SeqCst);
            self.reclaims.fetch_add(1, Ordering::SeqCst);
            if let Some(hook) = &self.reclaim {
                hook();
            }
            debug!(ratio, triage, "Async output reclaim");
        }
    }

    async fn handle_all(&self) -> AppResult<()> {
        while self.handle_next(false).await? {}
        Ok(())
    }

    async fn enqueue(&self, message: Message) -> AppResult<()> {
        let mut pending = message;
        loop {
            match self.queue.push(pending) {
                Ok(()) => break,
                Err(rejected) => {
                    pending = rejected;
                    if let Err(e) = self.handle_next(true).await {
                        self.record_failure(&e);
                        return Err(e);
                    }
                }
            }
        }
        self.wake.notify_one();
        Ok(())
    }

    async fn spill(&self, tagged: TaggedFrame) -> AppResult<Message> {
        let path = self
            .temp_dir
            .join(format!("async_{}.bin", uuid::Uuid::new_v4().simple()));
        let bytes = bincode::serialize(&tagged.frame)?;
        tokio::fs::write(&path, &bytes).await?;

        let size = bytes.len() as u64;
        self.used_bytes.fetch_add(size, Ordering::SeqCst);
        self.on_disk.fetch_add(1, Ordering::SeqCst);
        self.spilled.fetch_add(1, Ordering::SeqCst);
        Ok(Message::OnDisk {
            path,
            bytes: size,
            meta: tagged.meta,
        })
    }
}

async fn read_spill(path: &Path) -> AppResult<Frame> {
    let bytes = tokio::fs::read(path).await?;
    Ok(bincode::deserialize::<Frame>(&bytes)?)
}

async fn worker_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let finishing = shared.finishing.load(Ordering::SeqCst);
        if shared.slowed.load(Ordering::SeqCst) && !finishing {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = shared.release.notified() => {}
                _ = tokio::time::sleep(shared.config.slowed_interval) => {}
            }
        }

        match shared.handle_next(false).await {
            Ok(true) => {}
            Ok(false) if finishing => break,
            Ok(false) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shared.wake.notified() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Async writer failed");
                shared.record_failure(&e);
                break;
            }
        }
    }
}

async fn monitor_loop(shared: Arc<Shared>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let stats = shared.stats();
                info!(
                    queued = stats.queued,
                    in_memory = stats.in_memory,
                    memory_pct = shared.memory_fraction() * 100.0,
                    on_disk = stats.on_disk,
                    disk_pct = shared.disk_fraction() * 100.0,
                    freed_pct = stats.freed_ratio * 100.0,
                    writing = ?stats.writing,
                    "Async output status"
                );
            }
        }
    }
}

/// Builder for [`AsyncOutputWrapper`].
pub struct AsyncOutputBuilder {
    handler: Box<dyn OutputHandler>,
    output_dir: PathBuf,
    temp_dir: Option<PathBuf>,
    config: AsyncOutputConfig,
    probe: Option<Arc<dyn ResourceProbe>>,
    reclaim: Option<ReclaimHook>,
}

impl AsyncOutputBuilder {
    /// Directory whose `async-temp/` subdirectory receives spill files.
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Spill directory, overriding `<output_dir>/async-temp`.
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Queue and quota tuning.
    pub fn config(mut self, config: AsyncOutputConfig) -> Self {
        self.config = config;
        self
    }

    /// Resource probe; defaults to [`SysinfoProbe`].
    pub fn probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Called whenever enough buffered memory has been released.
    pub fn on_reclaim(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.reclaim = Some(Arc::new(hook));
        self
    }

    /// Prepare the spill directory and start the worker.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn spawn(self) -> AppResult<AsyncOutputWrapper> {
        self.config.validate()?;

        let temp_dir = self
            .temp_dir
            .unwrap_or_else(|| self.output_dir.join(TEMP_DIR_NAME));
        tokio::fs::create_dir_all(&temp_dir).await?;
        let mut entries = tokio::fs::read_dir(&temp_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                tokio::fs::remove_file(entry.path()).await.map_err(|e| {
                    DaqError::Configuration(format!(
                        "Unable to clean file {}: {}",
                        entry.path().display(),
                        e
                    ))
                })?;
            }
        }

        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(SysinfoProbe::new()) as Arc<dyn ResourceProbe>);

        let shared = Arc::new(Shared {
            queue: ArrayQueue::new(self.config.queue_capacity),
            handler: tokio::sync::Mutex::new(self.handler),
            probe,
            reclaim: self.reclaim,
            config: self.config.clone(),
            temp_dir,
            in_memory: AtomicUsize::new(0),
            on_disk: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
            delivered: AtomicU64::new(0),
            spilled: AtomicU64::new(0),
            reclaims: AtomicU64::new(0),
            used_bytes: AtomicU64::new(0),
            slowed: AtomicBool::new(false),
            finishing: AtomicBool::new(false),
            writing: AtomicU8::new(Writing::Idle as u8),
            failure: Mutex::new(None),
            wake: Notify::new(),
            release: Notify::new(),
        });

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(worker_loop(shared.clone(), cancel.clone()));
        let monitor = self.config.monitor_interval.map(|interval| {
            tokio::spawn(monitor_loop(shared.clone(), interval, cancel.child_token()))
        });

        debug!(temp_dir = ?shared.temp_dir, capacity = self.config.queue_capacity, "Async output started");

        Ok(AsyncOutputWrapper {
            shared,
            cancel,
            worker: Some(worker),
            monitor,
            finalized: false,
        })
    }
}

/// Buffers output in a bounded queue drained by a background worker.
pub struct AsyncOutputWrapper {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
    finalized: bool,
}

impl AsyncOutputWrapper {
    /// Start building a wrapper around `handler`.
    pub fn builder(handler: Box<dyn OutputHandler>) -> AsyncOutputBuilder {
        AsyncOutputBuilder {
            handler,
            output_dir: PathBuf::from("."),
            temp_dir: None,
            config: AsyncOutputConfig::default(),
            probe: None,
            reclaim: None,
        }
    }

    /// Current counters.
    pub fn stats(&self) -> AsyncStats {
        self.shared.stats()
    }

    /// The spill directory.
    pub fn temp_dir(&self) -> &Path {
        &self.shared.temp_dir
    }

    async fn stop_worker(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };

        self.shared.finishing.store(true, Ordering::SeqCst);
        self.shared.slowed.store(false, Ordering::SeqCst);
        self.shared.wake.notify_one();
        self.shared.release.notify_one();

        let timeout = self.shared.config.finalize_timeout;
        if tokio::time::timeout(timeout, &mut worker).await.is_err() {
            warn!(
                queued = self.shared.queue.len(),
                timeout_secs = timeout.as_secs(),
                "Async writer did not drain in time; cancelling"
            );
            self.cancel.cancel();
            if tokio::time::timeout(CANCEL_GRACE, &mut worker).await.is_err() {
                worker.abort();
                warn!("Asynchronous writer may have been cancelled before completing");
            }
        }

        if let Some(monitor) = self.monitor.take() {
            self.cancel.cancel();
            let _ = monitor.await;
        }
    }
}

#[async_trait]
impl OutputHandler for AsyncOutputWrapper {
    async fn begin_stack(&mut self, timepoint: usize, row: usize) -> AppResult<()> {
        self.shared.check_failure()?;
        self.shared.slowed.store(true, Ordering::SeqCst);
        self.shared
            .enqueue(Message::BeginStack { timepoint, row })
            .await
    }

    async fn process_slice(&mut self, tagged: TaggedFrame) -> AppResult<()> {
        self.shared.check_failure()?;

        while self.shared.memory_fraction() > self.shared.config.memory_quota
            && self.shared.disk_fraction() > self.shared.config.disk_quota
        {
            match self.shared.handle_next(true).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.shared.record_failure(&e);
                    return Err(e);
                }
            }
        }

        let message = if self.shared.memory_fraction() < self.shared.config.memory_quota {
            self.shared.in_memory.fetch_add(1, Ordering::SeqCst);
            Message::InMemory(tagged)
        } else {
            self.shared.spill(tagged).await?
        };

        self.shared.enqueue(message).await
    }

    async fn finalize_stack(&mut self, timepoint: usize, row: usize) -> AppResult<()> {
        self.shared.check_failure()?;
        self.shared
            .enqueue(Message::EndStack { timepoint, row })
            .await?;
        self.shared.slowed.store(false, Ordering::SeqCst);
        self.shared.release.notify_one();
        Ok(())
    }

    async fn finalize_acquisition(&mut self) -> AppResult<()> {
        if self.finalized {
            return self.shared.check_failure();
        }
        self.finalized = true;

        self.stop_worker().await;

        let drained = if self.shared.failure.lock().is_none() {
            self.shared.handle_all().await
        } else {
            Ok(())
        };
        if let Err(e) = &drained {
            self.shared.record_failure(e);
        }

        let inner = self.shared.handler.lock().await.finalize_acquisition().await;

        let leftover = self.shared.used_bytes.load(Ordering::SeqCst);
        if leftover > 0 {
            warn!(
                bytes = leftover,
                temp_dir = ?self.shared.temp_dir,
                "Async exited with disk space still used; check the temporary async files"
            );
        }
        if let Err(e) = tokio::fs::remove_dir(&self.shared.temp_dir).await {
            if leftover == 0 {
                info!(error = %e, "Couldn't delete temporary async directory, though it seems to be empty");
            }
        }

        let stats = self.shared.stats();
        info!(
            delivered = stats.frames_delivered,
            spilled = stats.frames_spilled,
            reclaims = stats.reclaims,
            "Async output finalized"
        );

        self.shared.check_failure()?;
        inner
    }

    async fn image(&mut self) -> AppResult<Option<ImageStack>> {
        self.shared.check_failure()?;
        if let Err(e) = self.shared.handle_all().await {
            self.shared.record_failure(&e);
            return Err(e);
        }
        self.shared.handler.lock().await.image().await
    }
}

impl Drop for AsyncOutputWrapper {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::resources::ManualProbe;
    use crate::data::stack_handler::StackHandler;

    fn tagged(slice: usize) -> TaggedFrame {
        TaggedFrame {
            frame: Frame::from_u16(2, 2, &[slice as u16; 4]),
            meta: SliceMetadata {
                timepoint: 0,
                row: 0,
                slice,
                x: 0.0,
                y: 0.0,
                z: slice as f64,
                theta: 0.0,
                elapsed_ms: 0.0,
            },
        }
    }

    #[test]
    fn config_validation() {
        assert!(AsyncOutputConfig::default().validate().is_ok());
        let bad = AsyncOutputConfig {
            memory_quota: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let empty = AsyncOutputConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(empty.validate().is_err());
    }

    #[tokio::test]
    async fn spawn_cleans_stale_spill_files() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join(TEMP_DIR_NAME);
        std::fs::create_dir_all(&temp).unwrap();
        std::fs::write(temp.join("async_stale.bin"), b"old").unwrap();

        let mut wrapper = AsyncOutputWrapper::builder(Box::new(StackHandler::new()))
            .output_dir(dir.path())
            .probe(Arc::new(ManualProbe::new(0.1, 1 << 30)))
            .spawn()
            .await
            .unwrap();
        assert_eq!(std::fs::read_dir(&temp).unwrap().count(), 0);

        wrapper.finalize_acquisition().await.unwrap();
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn full_queue_drains_on_producer() {
        let dir = tempfile::tempdir().unwrap();
        let mut wrapper = AsyncOutputWrapper::builder(Box::new(StackHandler::new()))
            .output_dir(dir.path())
            .probe(Arc::new(ManualProbe::new(0.1, 1 << 30)))
            .config(AsyncOutputConfig {
                queue_capacity: 2,
                slowed_interval: Duration::from_secs(60),
                ..Default::default()
            })
            .spawn()
            .await
            .unwrap();

        wrapper.begin_stack(0, 0).await.unwrap();
        for slice in 0..8 {
            wrapper.process_slice(tagged(slice)).await.unwrap();
        }
        wrapper.finalize_stack(0, 0).await.unwrap();
        wrapper.finalize_acquisition().await.unwrap();

        let image = wrapper.image().await.unwrap().unwrap();
        let order: Vec<usize> = image.frames.iter().map(|f| f.meta.slice).collect();
        assert_eq!(order, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn spilled_frames_come_back_intact() {
        let dir = tempfile::tempdir().unwrap();
        let reclaimed = Arc::new(AtomicU64::new(0));
        let counter = reclaimed.clone();
        let mut wrapper = AsyncOutputWrapper::builder(Box::new(StackHandler::new()))
            .output_dir(dir.path())
            .probe(Arc::new(ManualProbe::new(0.95, 1 << 30)))
            .on_reclaim(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .spawn()
            .await
            .unwrap();

        wrapper.begin_stack(0, 0).await.unwrap();
        wrapper.process_slice(tagged(3)).await.unwrap();
        wrapper.finalize_stack(0, 0).await.unwrap();
        wrapper.finalize_acquisition().await.unwrap();

        let stats = wrapper.stats();
        assert_eq!(stats.frames_spilled, 1);
        assert_eq!(stats.spilled_bytes, 0);
        let image = wrapper.image().await.unwrap().unwrap();
        assert_eq!(image.frames[0], tagged(3));
        // Spilled frames never count toward the in-memory freed ratio.
        assert_eq!(reclaimed.load(Ordering::SeqCst), 0);
    }
}
