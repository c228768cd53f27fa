//! Acquisition sequencing.
//!
//! [`Row`]s describe views, [`AcquisitionParams`] describe a run and the
//! [`AcquisitionEngine`] executes it, reporting through [`AcqStatus`].

pub mod anti_drift;
pub mod grid;
pub mod params;
pub mod profiler;
pub mod row;
pub mod run_engine;
pub mod state;
pub mod summary;

pub use anti_drift::{AntiDrift, AntiDriftFactory, CentroidAntiDrift, CentroidParams};
pub use params::{AcquisitionParams, IlluminationPolicy, LivePreview, ProgressListener};
pub use row::{AxisId, Row, ValueSet, Vector3};
pub use run_engine::{AcquisitionEngine, RunOutcome};
pub use state::{AcqState, AcqStatus};
pub use summary::{RunEnd, RunSummary};
