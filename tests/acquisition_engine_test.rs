//! Integration tests for the acquisition engine
//!
//! These drive complete runs against the mock instrument and check the
//! contract the engine keeps with its output handler and controllers:
//! - exactly one `finalize_acquisition` per run, also on cancel and failure
//! - progress reaching 100% on the abort path
//! - drift corrections applied to the next visit of a row
//! - pause, schedule and sweep behaviour

mod common;

use common::{Call, RecordingHandler, Rig};
use parking_lot::Mutex;
use spim_daq::data::async_output::{AsyncOutputConfig, AsyncOutputWrapper, TEMP_DIR_NAME};
use spim_daq::data::resources::ManualProbe;
use spim_daq::data::StackHandler;
use spim_daq::experiment::anti_drift::{AntiDrift, CorrectionCallback};
use spim_daq::experiment::{
    AcqState, AcquisitionEngine, AcquisitionParams, AxisId, CentroidAntiDrift, CentroidParams,
    IlluminationPolicy, Row, RunEnd, ValueSet, Vector3,
};
use spim_daq::hardware::capabilities::FrameProducer;
use spim_daq::hardware::mock::{MockCamera, MockPattern};
use spim_daq::hardware::Frame;
use spim_daq::DaqError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

fn three_slice_row(x: f64) -> Row {
    Row::stack(x, 0.0, ValueSet::stepped(0.0, 2.0, 1.0).unwrap(), 0.0)
}

#[tokio::test]
async fn cancel_mid_stack_takes_clean_abort_path() {
    let dir = tempfile::tempdir().unwrap();
    let rig = Rig::new();
    let (handler, journal) = RecordingHandler::new();
    let wrapper = AsyncOutputWrapper::builder(Box::new(handler))
        .output_dir(dir.path())
        .probe(Arc::new(ManualProbe::new(0.9, 1 << 40)))
        .config(AsyncOutputConfig {
            slowed_interval: Duration::from_millis(1),
            ..Default::default()
        })
        .spawn()
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = progress.clone();
    let trigger = cancel.clone();

    let params = AcquisitionParams::builder(rig.setup.clone(), Box::new(wrapper))
        .rows(vec![three_slice_row(0.0), three_slice_row(50.0)])
        .time_series(2, Duration::ZERO)
        .progress(Arc::new(move |timepoint: usize, row: usize, overall: f64| {
            seen.lock().push(overall);
            // First report inside timepoint 0 / row 1 comes after slice 0.
            if timepoint == 0 && row == 1 {
                trigger.cancel();
            }
        }))
        .build()
        .unwrap();

    let mut engine = AcquisitionEngine::new(params);
    let status = engine.status();
    let outcome = engine.run(&cancel).await.unwrap();

    assert_eq!(outcome.end, RunEnd::Cancelled);
    assert_eq!(outcome.frames, 4);
    assert_eq!(journal.finalize_count(), 1);
    assert_eq!(
        journal.calls(),
        vec![
            Call::Begin(0, 0),
            Call::Slice(0, 0, 0),
            Call::Slice(0, 0, 1),
            Call::Slice(0, 0, 2),
            Call::End(0, 0),
            Call::Begin(0, 1),
            Call::Slice(0, 1, 0),
            Call::FinalizeAcquisition,
        ]
    );
    assert_eq!(progress.lock().last().copied(), Some(1.0));
    assert_eq!(outcome.image.map(|i| i.len()), Some(4));
    assert!(!dir.path().join(TEMP_DIR_NAME).exists());

    assert_eq!(status.state(), AcqState::Done);
    assert!(!rig.laser.is_on());
    assert!(rig.shutter.is_auto());
    // Stage returned to where it started.
    assert_eq!(rig.stage(AxisId::X).moves().last().copied(), Some(0.0));
}

/// Reports a fixed correction after every stack.
struct FixedDrift {
    correction: Vector3,
    callback: Option<CorrectionCallback>,
    stacks: usize,
}

impl AntiDrift for FixedDrift {
    fn start_new_stack(&mut self) {
        self.stacks += 1;
    }

    fn tally_slice(&mut self, _offset_hint: Vector3, _frame: &Frame) {}

    fn finish_stack(&mut self) {
        if let Some(callback) = self.callback.as_mut() {
            callback(self.correction);
        }
    }

    fn set_callback(&mut self, callback: CorrectionCallback) {
        self.callback = Some(callback);
    }
}

#[tokio::test(start_paused = true)]
async fn drift_correction_shifts_next_visit() {
    let rig = Rig::new().with_pixel_size(0.5);
    let factory = Arc::new(|_index: usize, _row: &Row| -> Box<dyn AntiDrift> {
        Box::new(FixedDrift {
            correction: Vector3::new(2.0, -1.0, 0.0),
            callback: None,
            stacks: 0,
        })
    });

    let params = AcquisitionParams::builder(rig.setup.clone(), Box::new(StackHandler::new()))
        .rows(vec![Row::at(100.0, 100.0, 50.0, 0.0)])
        .time_series(2, Duration::ZERO)
        .anti_drift(factory)
        .build()
        .unwrap();
    let outcome = AcquisitionEngine::new(params)
        .run(&CancellationToken::new())
        .await
        .unwrap();

    let image = outcome.image.unwrap();
    let first = &image.frames[0].meta;
    let second = &image.frames[1].meta;
    assert_eq!((first.x, first.y, first.z), (100.0, 100.0, 50.0));
    assert_eq!(second.timepoint, 1);
    assert_eq!((second.x, second.y, second.z), (101.0, 99.5, 50.0));

    // Both stacks reported a correction.
    let row = &outcome.rows[0];
    assert_eq!(row.x(), Some(102.0));
    assert_eq!(row.y(), Some(99.0));
    assert_eq!(row.z_start(), Some(50.0));
}

#[tokio::test(start_paused = true)]
async fn centroid_drift_follows_a_moving_spot() {
    let camera = MockCamera::new(32, 32);
    let rig = Rig::with_camera(camera).with_pixel_size(2.0);
    let row = Row::stack(0.0, 0.0, ValueSet::stepped(0.0, 2.0, 1.0).unwrap(), 0.0);

    let progress_camera = rig.camera.clone();
    let params = AcquisitionParams::builder(rig.setup.clone(), Box::new(StackHandler::new()))
        .rows(vec![row])
        .time_series(2, Duration::ZERO)
        .anti_drift(CentroidAntiDrift::factory(CentroidParams::default()))
        .progress(Arc::new(move |timepoint: usize, _row: usize, overall: f64| {
            // After the first stack the spot moves 3 px right.
            if timepoint == 0 && overall >= 0.5 {
                progress_camera.set_pattern(MockPattern::Spot {
                    x: 19.0,
                    y: 16.0,
                    sigma: 1.5,
                    amplitude: 3000.0,
                });
            }
        }))
        .build()
        .unwrap();
    rig.camera.set_pattern(MockPattern::Spot {
        x: 16.0,
        y: 16.0,
        sigma: 1.5,
        amplitude: 3000.0,
    });

    let outcome = AcquisitionEngine::new(params)
        .run(&CancellationToken::new())
        .await
        .unwrap();

    // The first stack only sets the reference; the second reports +3 px.
    let x = outcome.rows[0].x().unwrap();
    assert!((x - 6.0).abs() < 0.5, "row x after correction: {x}");
    let y = outcome.rows[0].y().unwrap();
    assert!(y.abs() < 0.5, "row y after correction: {y}");
}

#[tokio::test(start_paused = true)]
async fn continuous_with_drift_is_rejected_before_motion() {
    let rig = Rig::new();
    let (handler, journal) = RecordingHandler::new();
    let row = Row::stack(0.0, 0.0, ValueSet::continuous(0.0, 10.0, 5.0).unwrap(), 0.0);
    let params = AcquisitionParams::builder(rig.setup.clone(), Box::new(handler))
        .rows(vec![row])
        .continuous(true)
        .anti_drift(CentroidAntiDrift::factory(CentroidParams::default()))
        .build_unchecked();

    let mut engine = AcquisitionEngine::new(params);
    let err = engine.run(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, DaqError::Configuration(_)), "{err}");
    assert_eq!(rig.total_moves(), 0);
    assert_eq!(rig.camera.frame_count(), 0);
    assert!(rig.shutter.is_auto());
    assert_eq!(journal.calls(), vec![Call::FinalizeAcquisition]);
    assert_eq!(engine.status().state(), AcqState::Done);
}

#[tokio::test(start_paused = true)]
async fn device_failure_aborts_with_partial_progress() {
    let rig = Rig::with_camera(
        MockCamera::new(8, 8)
            .with_exposure(Duration::from_millis(1))
            .fail_after(4),
    );
    let (handler, journal) = RecordingHandler::new();
    let last = Arc::new(Mutex::new(0.0));
    let sink = last.clone();
    let params = AcquisitionParams::builder(rig.setup.clone(), Box::new(handler))
        .rows(vec![three_slice_row(0.0), three_slice_row(10.0)])
        .progress(Arc::new(move |_t: usize, _r: usize, overall: f64| {
            *sink.lock() = overall;
        }))
        .build()
        .unwrap();

    let err = AcquisitionEngine::new(params)
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    let progress = err.progress().unwrap();
    assert!((progress - 4.0 / 6.0).abs() < 1e-9, "progress {progress}");
    match &err {
        DaqError::AcquisitionFailed { source, .. } => {
            assert!(matches!(**source, DaqError::Instrument(_)), "{source}");
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(err.to_string().contains("66.7%"), "{err}");
    assert_eq!(*last.lock(), 1.0);
    assert_eq!(journal.finalize_count(), 1);
    assert_eq!(journal.frames.lock().len(), 4);
    assert!(!rig.laser.is_on());
    assert!(rig.shutter.is_auto());
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn slow_timepoints_log_behind_schedule() {
    let rig = Rig::with_camera(MockCamera::new(8, 8).with_exposure(Duration::from_millis(30)));
    let params = AcquisitionParams::builder(rig.setup.clone(), Box::new(StackHandler::new()))
        .rows(vec![Row::at(0.0, 0.0, 0.0, 0.0)])
        .time_series(3, Duration::from_millis(10))
        .build()
        .unwrap();

    let outcome = AcquisitionEngine::new(params)
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.frames, 3);
    assert!(logs_contain("Behind schedule"));
}

#[tokio::test(start_paused = true)]
async fn interval_spaces_timepoints() {
    let rig = Rig::new();
    let params = AcquisitionParams::builder(rig.setup.clone(), Box::new(StackHandler::new()))
        .rows(vec![Row::at(0.0, 0.0, 0.0, 0.0)])
        .time_series(3, Duration::from_secs(5))
        .build()
        .unwrap();
    let mut engine = AcquisitionEngine::new(params);
    let status = engine.status();

    let run = tokio::spawn(async move { engine.run(&CancellationToken::new()).await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(status.state(), AcqState::Waiting);
    assert!(status.wakes_at().is_some());

    let outcome = run.await.unwrap().unwrap();
    let starts: Vec<f64> = outcome
        .image
        .unwrap()
        .frames
        .iter()
        .map(|f| f.meta.elapsed_ms)
        .collect();
    assert!(starts[1] >= 5000.0 && starts[1] < 5500.0, "{starts:?}");
    assert!(starts[2] >= 10000.0 && starts[2] < 10500.0, "{starts:?}");
    assert!(status.wakes_at().is_none());
}

#[tokio::test(start_paused = true)]
async fn pause_flag_holds_the_run() {
    let rig = Rig::with_camera(MockCamera::new(8, 8).with_exposure(Duration::from_millis(10)));
    let (handler, journal) = RecordingHandler::new();
    let row = Row::stack(0.0, 0.0, ValueSet::stepped(0.0, 19.0, 1.0).unwrap(), 0.0);
    let params = AcquisitionParams::builder(rig.setup.clone(), Box::new(handler))
        .rows(vec![row])
        .pause_poll(Duration::from_millis(5))
        .build()
        .unwrap();
    let mut engine = AcquisitionEngine::new(params);
    let status = engine.status();
    let run = tokio::spawn(async move { engine.run(&CancellationToken::new()).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_ne!(status.state(), AcqState::Paused);
    status.pause();

    let mut paused = false;
    for _ in 0..100 {
        if status.state() == AcqState::Paused {
            paused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(paused, "engine never reported Paused");

    let held = journal.frames.lock().len();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(journal.frames.lock().len(), held);
    assert!(held < 20);

    status.resume();
    assert_ne!(status.state(), AcqState::Paused);

    let outcome = run.await.unwrap().unwrap();
    assert!(outcome.is_complete());
    assert_eq!(outcome.frames, 20);
}

#[tokio::test(start_paused = true)]
async fn continuous_sweep_streams_until_stage_stops() {
    let rig = Rig::with_camera(MockCamera::new(8, 8).with_exposure(Duration::from_millis(10)));
    let row = Row::stack(0.0, 0.0, ValueSet::continuous(0.0, 100.0, 1000.0).unwrap(), 0.0);
    let params = AcquisitionParams::builder(rig.setup.clone(), Box::new(StackHandler::new()))
        .rows(vec![row])
        .continuous(true)
        .illumination(IlluminationPolicy::PerFrame)
        .build()
        .unwrap();

    let outcome = AcquisitionEngine::new(params)
        .run(&CancellationToken::new())
        .await
        .unwrap();

    let image = outcome.image.unwrap();
    assert!(image.len() >= 5, "only {} frames", image.len());
    let z: Vec<f64> = image.frames.iter().map(|f| f.meta.z).collect();
    assert!(z.windows(2).all(|w| w[0] <= w[1]), "{z:?}");
    assert!(z.iter().all(|v| (0.0..=100.0).contains(v)), "{z:?}");
    let slices: Vec<usize> = image.frames.iter().map(|f| f.meta.slice).collect();
    assert_eq!(slices, (0..image.len()).collect::<Vec<_>>());

    // Sweep speed applied, then the previous velocity restored.
    assert_eq!(rig.stage(AxisId::Z).velocity_log(), vec![1000.0, 10_000.0]);
    assert_eq!(rig.laser.enable_count(), 1);
    assert!(!rig.laser.is_on());
}

#[tokio::test(start_paused = true)]
async fn summary_is_written_next_to_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run-summary.json");
    let rig = Rig::new();
    let params = AcquisitionParams::builder(rig.setup.clone(), Box::new(StackHandler::new()))
        .rows(vec![three_slice_row(0.0)])
        .time_series(2, Duration::ZERO)
        .profile(true)
        .summary_path(&path)
        .build()
        .unwrap();
    let outcome = AcquisitionEngine::new(params)
        .run(&CancellationToken::new())
        .await
        .unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["outcome"], "completed");
    assert_eq!(json["frames"], 6);
    assert_eq!(json["timepoints"], 2);
    assert_eq!(json["run_id"], outcome.summary.run_id.to_string());
}
