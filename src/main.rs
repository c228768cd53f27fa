//! CLI Entry Point for spim_daq
//!
//! Provides command-line access to:
//! - Running an acquisition described by a configuration file against the
//!   simulated instrument
//! - Parsing value-set text the way the row editor does
//! - Expanding a position grid into rows
//!
//! # Usage
//!
//! ```bash
//! spim_daq run --config config/spim.toml
//! spim_daq parse "0-100@25"
//! spim_daq grid --x 0:100:300 --y 0:100:100 --z 10:2:30
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spim_daq::config::{HandlerKind, SpimConfig, DEFAULT_CONFIG_PATH};
use spim_daq::data::output::{OutputHandler, TaggedFrame};
use spim_daq::data::{AsyncOutputWrapper, StackHandler};
use spim_daq::experiment::grid::{rows_from_ranges, GridAxis};
use spim_daq::experiment::{
    AcquisitionEngine, AcquisitionParams, AxisId, CentroidAntiDrift, ValueSet,
};
use spim_daq::hardware::mock::{MockCamera, MockLaser, MockPattern, MockShutter, MockStage};
use spim_daq::hardware::Setup;
use spim_daq::logging;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "spim_daq")]
#[command(about = "SPIM acquisition sequencing with an async output pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured acquisition on simulated hardware
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Parse value-set text and show what it expands to
    Parse {
        /// e.g. `5`, `1;2;3`, `0:2:10` or `0-100@25`
        text: String,
    },

    /// Expand per-axis `min:step:max` ranges into rows
    Grid {
        /// X range
        #[arg(long)]
        x: Option<String>,
        /// Y range
        #[arg(long)]
        y: Option<String>,
        /// Theta range
        #[arg(long)]
        theta: Option<String>,
        /// Z value set given to every row
        #[arg(long)]
        z: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_acquisition(config).await,
        Commands::Parse { text } => parse_value_set(&text),
        Commands::Grid { x, y, theta, z } => print_grid(x, y, theta, z),
    }
}

async fn run_acquisition(path: PathBuf) -> Result<()> {
    let config = SpimConfig::load_validated(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    info!(config = %path.display(), name = %config.application.name, "Configuration loaded");

    let setup = mock_setup(&config);
    let handler = build_handler(&config).await?;

    let mut builder = AcquisitionParams::builder(setup, handler)
        .rows(config.acquisition.rows.clone())
        .time_series(config.acquisition.timepoints, config.acquisition.interval())
        .continuous(config.acquisition.continuous)
        .settle_delay(config.acquisition.settle_delay())
        .illumination(config.acquisition.illumination)
        .pause_poll(config.acquisition.pause_poll())
        .profile(config.acquisition.profile)
        .progress(Arc::new(|timepoint: usize, row: usize, overall: f64| {
            info!(timepoint, row, percent = overall * 100.0, "Progress");
        }));
    if config.acquisition.update_live {
        builder = builder.live_preview(Arc::new(|tagged: &TaggedFrame| {
            let range = tagged.frame.min_max();
            info!(
                timepoint = tagged.meta.timepoint,
                row = tagged.meta.row,
                slice = tagged.meta.slice,
                z = tagged.meta.z,
                range = ?range,
                "Live"
            );
        }));
    }
    if config.anti_drift.enabled {
        builder = builder.anti_drift(CentroidAntiDrift::factory(config.anti_drift.centroid));
    }
    if let Some(dir) = &config.output.directory {
        builder = builder.summary_path(dir.join("run-summary.json"));
    }
    let params = builder.build()?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; aborting acquisition");
            on_signal.cancel();
        }
    });

    let mut engine = AcquisitionEngine::new(params);
    let outcome = engine.run(&cancel).await?;
    info!(
        outcome = ?outcome.end,
        frames = outcome.frames,
        held = outcome.image.as_ref().map(|i| i.len()).unwrap_or(0),
        run_id = %outcome.summary.run_id,
        "Done"
    );
    Ok(())
}

fn mock_setup(config: &SpimConfig) -> Setup {
    let instrument = &config.instrument;
    let camera = MockCamera::new(instrument.camera_width, instrument.camera_height)
        .with_exposure(Duration::from_millis(instrument.exposure_ms));
    camera.set_pattern(MockPattern::Spot {
        x: f64::from(instrument.camera_width) / 2.0,
        y: f64::from(instrument.camera_height) / 2.0,
        sigma: f64::from(instrument.camera_width.min(instrument.camera_height)) / 10.0,
        amplitude: 2000.0,
    });

    let mut setup = Setup::new(Arc::new(camera))
        .with_laser(Arc::new(MockLaser::new()))
        .with_shutter(Arc::new(MockShutter::default()))
        .with_pixel_size(instrument.pixel_size_um);
    for axis in AxisId::ALL {
        setup = setup.with_axis(
            axis,
            Arc::new(MockStage::with_velocity(0.0, instrument.stage_velocity_um_s)),
        );
    }
    setup
}

async fn build_handler(config: &SpimConfig) -> Result<Box<dyn OutputHandler>> {
    let output = &config.output;
    let inner: Box<dyn OutputHandler> = match output.handler {
        HandlerKind::Stack => Box::new(StackHandler::new()),
        #[cfg(feature = "storage_tiff")]
        HandlerKind::Tiff => {
            let dir = output
                .directory
                .clone()
                .context("output.directory is required for the tiff handler")?;
            tokio::fs::create_dir_all(&dir).await?;
            Box::new(spim_daq::data::tiff_handler::TiffHandler::new(
                dir,
                output.naming_scheme.clone(),
            )?)
        }
        #[cfg(not(feature = "storage_tiff"))]
        HandlerKind::Tiff => anyhow::bail!("built without the storage_tiff feature"),
    };

    if !output.async_output {
        return Ok(inner);
    }

    let spool_root = output
        .directory
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    let mut builder = AsyncOutputWrapper::builder(inner)
        .output_dir(spool_root)
        .config(output.async_config());
    if let Some(temp_dir) = &output.temp_dir {
        builder = builder.temp_dir(temp_dir.clone());
    }
    Ok(Box::new(builder.spawn().await?))
}

fn parse_value_set(text: &str) -> Result<()> {
    let set: ValueSet = text.parse()?;
    println!("value set : {}", set);
    println!("mode      : {:?}", set.mode());
    println!("start/end : {} -> {}", set.start(), set.end());
    if set.is_continuous() {
        println!("steps     : continuous (estimated as 1)");
    } else {
        println!("steps     : {}", set.steps());
        println!("values    : {:?}", set.values());
    }
    Ok(())
}

fn print_grid(
    x: Option<String>,
    y: Option<String>,
    theta: Option<String>,
    z: Option<String>,
) -> Result<()> {
    let mut ranges = Vec::new();
    for (axis, text) in [(AxisId::X, x), (AxisId::Y, y), (AxisId::Theta, theta)] {
        if let Some(text) = text {
            ranges.push(parse_grid_axis(axis, &text)?);
        }
    }
    let z: Option<ValueSet> = z.map(|text| text.parse()).transpose()?;

    let rows = rows_from_ranges(&ranges, z.as_ref())?;
    for (index, row) in rows.iter().enumerate() {
        println!("{:>4}: {}", index, row);
    }
    Ok(())
}

fn parse_grid_axis(axis: AxisId, text: &str) -> Result<GridAxis> {
    let parts: Vec<f64> = text
        .split(':')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("range for {} must be min:step:max, got '{}'", axis, text))?;
    let [min, step, max] = parts[..] else {
        anyhow::bail!("range for {} must be min:step:max, got '{}'", axis, text);
    };
    Ok(GridAxis {
        axis,
        min,
        step,
        max,
    })
}
