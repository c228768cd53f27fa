//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. A TOML file (base configuration, `config/spim.toml` by default)
//! 2. Environment variables prefixed with `SPIM_DAQ_`, with `__` separating
//!    nested keys
//!
//! # Example
//! ```no_run
//! use spim_daq::config::SpimConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SpimConfig::load()?;
//! config.validate()?;
//! println!("Acquiring {} timepoints", config.acquisition.timepoints);
//! # Ok(())
//! # }
//! ```
//!
//! `SPIM_DAQ_OUTPUT__MEMORY_QUOTA=0.5` overrides `output.memory_quota`.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::data::async_output::AsyncOutputConfig;
use crate::error::{AppResult, DaqError};
use crate::experiment::anti_drift::CentroidParams;
use crate::experiment::params::IlluminationPolicy;
use crate::experiment::row::Row;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/spim.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpimConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// What to acquire
    pub acquisition: AcquisitionConfig,
    /// Where frames go
    pub output: OutputConfig,
    /// Drift compensation
    pub anti_drift: AntiDriftConfig,
    /// Simulated instrument
    pub instrument: InstrumentConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Acquisition sequence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Wait after each move, milliseconds
    #[serde(default)]
    pub settle_delay_ms: u64,
    /// Number of timepoints
    #[serde(default = "default_timepoints")]
    pub timepoints: usize,
    /// Interval between timepoint starts, seconds
    #[serde(default)]
    pub interval_seconds: f64,
    /// Sweep Z continuously for rows given as `start-end@speed`
    #[serde(default)]
    pub continuous: bool,
    /// Laser policy
    #[serde(default)]
    pub illumination: IlluminationPolicy,
    /// Log each frame as it arrives
    #[serde(default)]
    pub update_live: bool,
    /// Time each section of the run
    #[serde(default)]
    pub profile: bool,
    /// Rows: tables of axis name to value-set text, e.g. `{ x = 10, z = "0:2:20" }`
    #[serde(default)]
    pub rows: Vec<Row>,
    /// Pause polling interval, milliseconds
    #[serde(default = "default_pause_poll")]
    pub pause_poll_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 0,
            timepoints: default_timepoints(),
            interval_seconds: 0.0,
            continuous: false,
            illumination: IlluminationPolicy::default(),
            update_live: false,
            profile: false,
            rows: Vec::new(),
            pause_poll_ms: default_pause_poll(),
        }
    }
}

impl AcquisitionConfig {
    /// Settle delay as a duration.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Timepoint interval as a duration, saturating at `Duration::MAX`.
    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.interval_seconds.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Pause polling interval as a duration.
    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }
}

/// Which handler receives the frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Keep every frame in memory
    #[default]
    Stack,
    /// Write one TIFF per frame
    Tiff,
}

/// Output pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output directory; also hosts spill files and the run summary
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Handler kind
    #[serde(default)]
    pub handler: HandlerKind,
    /// Decouple storage from capture with the async wrapper
    #[serde(default = "default_true")]
    pub async_output: bool,
    /// Memory fraction above which frames spill to disk
    #[serde(default = "default_memory_quota")]
    pub memory_quota: f64,
    /// Disk fraction above which the producer drains the queue itself
    #[serde(default = "default_disk_quota")]
    pub disk_quota: f64,
    /// Freed-to-buffered ratio that triggers a reclaim
    #[serde(default = "default_freed_gc_ratio")]
    pub freed_gc_ratio: f64,
    /// Async queue bound
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Worker pause between messages mid-stack, milliseconds
    #[serde(default = "default_slowed_interval")]
    pub slowed_interval_ms: u64,
    /// Statistics logging interval, milliseconds (0 = disabled)
    #[serde(default)]
    pub monitor_interval_ms: u64,
    /// Bound on the final drain, seconds
    #[serde(default = "default_finalize_timeout")]
    pub finalize_timeout_secs: u64,
    /// File naming scheme for the TIFF handler
    #[serde(default = "default_naming_scheme")]
    pub naming_scheme: String,
    /// Spill directory (defaults to `<directory>/async-temp`)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: None,
            handler: HandlerKind::default(),
            async_output: true,
            memory_quota: default_memory_quota(),
            disk_quota: default_disk_quota(),
            freed_gc_ratio: default_freed_gc_ratio(),
            queue_capacity: default_queue_capacity(),
            slowed_interval_ms: default_slowed_interval(),
            monitor_interval_ms: 0,
            finalize_timeout_secs: default_finalize_timeout(),
            naming_scheme: default_naming_scheme(),
            temp_dir: None,
        }
    }
}

impl OutputConfig {
    /// Tuning for the async wrapper.
    pub fn async_config(&self) -> AsyncOutputConfig {
        AsyncOutputConfig {
            memory_quota: self.memory_quota,
            disk_quota: self.disk_quota,
            freed_gc_ratio: self.freed_gc_ratio,
            queue_capacity: self.queue_capacity,
            slowed_interval: Duration::from_millis(self.slowed_interval_ms),
            finalize_timeout: Duration::from_secs(self.finalize_timeout_secs),
            monitor_interval: (self.monitor_interval_ms > 0)
                .then(|| Duration::from_millis(self.monitor_interval_ms)),
        }
    }
}

/// Drift compensation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AntiDriftConfig {
    /// Enable drift compensation
    #[serde(default)]
    pub enabled: bool,
    /// Centroid tuning
    #[serde(flatten)]
    pub centroid: CentroidParams,
}

/// Simulated instrument configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Camera pixel size at the sample, microns
    #[serde(default = "default_pixel_size")]
    pub pixel_size_um: f64,
    /// Camera width, pixels
    #[serde(default = "default_camera_size")]
    pub camera_width: u32,
    /// Camera height, pixels
    #[serde(default = "default_camera_size")]
    pub camera_height: u32,
    /// Camera exposure, milliseconds
    #[serde(default = "default_exposure")]
    pub exposure_ms: u64,
    /// Stage travel velocity, microns per second
    #[serde(default = "default_stage_velocity")]
    pub stage_velocity_um_s: f64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            pixel_size_um: default_pixel_size(),
            camera_width: default_camera_size(),
            camera_height: default_camera_size(),
            exposure_ms: default_exposure(),
            stage_velocity_um_s: default_stage_velocity(),
        }
    }
}

// Default value functions
fn default_name() -> String {
    "SPIM DAQ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_timepoints() -> usize {
    1
}

fn default_pause_poll() -> u64 {
    20
}

fn default_true() -> bool {
    true
}

fn default_memory_quota() -> f64 {
    0.75
}

fn default_disk_quota() -> f64 {
    0.9
}

fn default_freed_gc_ratio() -> f64 {
    0.5
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_slowed_interval() -> u64 {
    250
}

fn default_finalize_timeout() -> u64 {
    300
}

fn default_naming_scheme() -> String {
    "spim_TL$(TP)_Angle$(A)_S$(S).tiff".to_string()
}

fn default_pixel_size() -> f64 {
    1.0
}

fn default_camera_size() -> u32 {
    64
}

fn default_exposure() -> u64 {
    10
}

fn default_stage_velocity() -> f64 {
    1000.0
}

impl SpimConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment variables
    /// still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SPIM_DAQ_").split("__"))
            .extract()
    }

    /// Load and validate.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Self::load_from(path)?;
        config.validate().map_err(DaqError::Configuration)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        self.output
            .async_config()
            .validate()
            .map_err(|e| e.to_string())?;

        if self.acquisition.timepoints == 0 {
            return Err("acquisition.timepoints must be at least 1".to_string());
        }
        if !(self.acquisition.interval_seconds.is_finite()
            && self.acquisition.interval_seconds >= 0.0)
        {
            return Err(format!(
                "acquisition.interval_seconds must be a finite, non-negative number, got {}",
                self.acquisition.interval_seconds
            ));
        }
        if self.acquisition.pause_poll_ms == 0 {
            return Err("acquisition.pause_poll_ms must be positive".to_string());
        }
        if self.acquisition.continuous && self.anti_drift.enabled {
            return Err("No continuous acquisition with anti-drift".to_string());
        }
        if self.instrument.pixel_size_um <= 0.0 {
            return Err(format!(
                "instrument.pixel_size_um must be positive, got {}",
                self.instrument.pixel_size_um
            ));
        }
        if self.output.handler == HandlerKind::Tiff && self.output.directory.is_none() {
            return Err("output.directory is required for the tiff handler".to_string());
        }

        Ok(())
    }
}
