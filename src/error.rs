//! Custom error types for the acquisition engine.
//!
//! `DaqError` is the single error type surfaced to callers of the engine and the
//! output pipeline. It is built with `thiserror` and groups failures by how the
//! engine reacts to them:
//!
//! - **`Config`** / **`Configuration`**: problems found before any hardware moves.
//!   `Config` wraps figment parsing errors; `Configuration` carries semantic
//!   validation failures such as a continuous sweep combined with drift
//!   compensation.
//! - **`Instrument`**: a device move or capture failed. Fatal to the run; the engine
//!   takes its clean-abort path and reports this error.
//! - **`Output`** / **`AsyncWriter`**: the output handler failed. `AsyncWriter` marks an
//!   error captured on the async worker and re-raised on the next pipeline call.
//! - **`AcquisitionFailed`**: wraps any of the above together with the fraction of
//!   the run that completed before the failure.
//!
//! Device capability traits return `anyhow::Result`; the engine converts those into
//! `DaqError::Instrument` at the call site.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Output handler error: {0}")]
    Output(String),

    #[error("Async writer error: {0}")]
    AsyncWriter(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid value set '{input}': {reason}")]
    ValueSetParse { input: String, reason: String },

    #[error("Acquisition cancelled")]
    Cancelled,

    #[error("Acquisition failed at {:.1}%: {source}", .progress * 100.0)]
    AcquisitionFailed {
        progress: f64,
        #[source]
        source: Box<DaqError>,
    },
}

impl DaqError {
    /// Wraps a device-level failure.
    pub fn instrument(err: impl std::fmt::Display) -> Self {
        DaqError::Instrument(err.to_string())
    }

    /// Wraps an output-handler failure.
    pub fn output(err: impl std::fmt::Display) -> Self {
        DaqError::Output(err.to_string())
    }

    /// Fraction of the run completed before this error, if known.
    pub fn progress(&self) -> Option<f64> {
        match self {
            DaqError::AcquisitionFailed { progress, .. } => Some(*progress),
            _ => None,
        }
    }

    /// Creates a duplicate suitable for handing to more than one caller.
    ///
    /// Non-cloneable sources (I/O, figment) are flattened into their message.
    pub fn duplicate(&self) -> Self {
        match self {
            DaqError::Config(e) => DaqError::Configuration(e.to_string()),
            DaqError::Configuration(s) => DaqError::Configuration(s.clone()),
            DaqError::Io(e) => DaqError::Io(std::io::Error::new(e.kind(), e.to_string())),
            DaqError::Instrument(s) => DaqError::Instrument(s.clone()),
            DaqError::Output(s) => DaqError::Output(s.clone()),
            DaqError::AsyncWriter(s) => DaqError::AsyncWriter(s.clone()),
            DaqError::Serialization(s) => DaqError::Serialization(s.clone()),
            DaqError::ValueSetParse { input, reason } => DaqError::ValueSetParse {
                input: input.clone(),
                reason: reason.clone(),
            },
            DaqError::Cancelled => DaqError::Cancelled,
            DaqError::AcquisitionFailed { progress, source } => DaqError::AcquisitionFailed {
                progress: *progress,
                source: Box::new(source.duplicate()),
            },
        }
    }
}

impl From<bincode::Error> for DaqError {
    fn from(err: bincode::Error) -> Self {
        DaqError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DaqError {
    fn from(err: serde_json::Error) -> Self {
        DaqError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquisition_failed_reports_progress() {
        let err = DaqError::AcquisitionFailed {
            progress: 0.25,
            source: Box::new(DaqError::Instrument("stage fault".into())),
        };
        assert_eq!(err.progress(), Some(0.25));
        assert_eq!(
            err.to_string(),
            "Acquisition failed at 25.0%: Instrument error: stage fault"
        );
    }

    #[test]
    fn duplicate_keeps_io_kind() {
        let err = DaqError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        match err.duplicate() {
            DaqError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
    }
}
