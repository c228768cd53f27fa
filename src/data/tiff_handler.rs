//! One TIFF file per captured slice.
//!
//! File names come from a naming scheme with these substitutions:
//!
//! | token   | value                  |
//! |---------|------------------------|
//! | `$(TP)` | timepoint index        |
//! | `$(A)`  | row (view) index       |
//! | `$(S)`  | slice index            |
//! | `$(X)`  | stage X, microns       |
//! | `$(Y)`  | stage Y, microns       |
//! | `$(Z)`  | stage Z, microns       |
//! | `$(T)`  | rotation, degrees      |
//! | `$(dt)` | elapsed ms since start |

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use image::{GrayImage, ImageBuffer};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::data::output::{ImageStack, OutputHandler, SliceMetadata, TaggedFrame};
use crate::error::{AppResult, DaqError};
use crate::hardware::Frame;

/// Which metadata fields to put in generated file names.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemeFields {
    #[allow(missing_docs)]
    pub elapsed: bool,
    #[allow(missing_docs)]
    pub x: bool,
    #[allow(missing_docs)]
    pub y: bool,
    #[allow(missing_docs)]
    pub z: bool,
    #[allow(missing_docs)]
    pub theta: bool,
}

/// Build a naming scheme from a header and the fields to include.
///
/// `names` overrides the labels used for X, Y, Z and theta.
pub fn short_names_to_scheme(header: &str, fields: SchemeFields, names: Option<[&str; 4]>) -> String {
    let [x, y, z, t] = names.unwrap_or(["X", "Y", "Z", "Theta"]);
    let mut scheme = header.to_string();

    if fields.elapsed {
        scheme.push_str("-t=$(dt)");
    }
    if fields.x {
        scheme.push_str(&format!("-{}=$(X)", x));
    }
    if fields.y {
        scheme.push_str(&format!("-{}=$(Y)", y));
    }
    if fields.z {
        scheme.push_str(&format!("-{}=$(Z)", z));
    }
    if fields.theta {
        scheme.push_str(&format!("-{}=$(T)", t));
    }

    scheme.push_str(".tif");
    scheme
}

/// Expand a naming scheme for one slice.
pub fn name_slice(scheme: &str, meta: &SliceMetadata) -> String {
    scheme
        .replace("$(TP)", &meta.timepoint.to_string())
        .replace("$(A)", &meta.row.to_string())
        .replace("$(S)", &meta.slice.to_string())
        .replace("$(X)", &meta.x.to_string())
        .replace("$(Y)", &meta.y.to_string())
        .replace("$(Z)", &meta.z.to_string())
        .replace("$(T)", &meta.theta.to_string())
        .replace("$(dt)", &meta.elapsed_ms.to_string())
}

/// Writes every slice to its own TIFF file in a directory.
#[derive(Debug)]
pub struct TiffHandler {
    directory: PathBuf,
    scheme: String,
    written: Vec<PathBuf>,
}

impl TiffHandler {
    /// Create a handler writing into an existing directory.
    pub fn new(directory: impl Into<PathBuf>, scheme: impl Into<String>) -> AppResult<Self> {
        let directory = directory.into();
        if !directory.is_dir() {
            return Err(DaqError::Configuration(format!(
                "Invalid path or not a directory: {}",
                directory.display()
            )));
        }
        Ok(Self {
            directory,
            scheme: scheme.into(),
            written: Vec::new(),
        })
    }

    /// Paths written so far.
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    fn write_frame(frame: &Frame, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        let writer = BufWriter::new(file);
        let encoder = image::codecs::tiff::TiffEncoder::new(writer);

        match frame.bit_depth {
            8 => {
                let img: GrayImage =
                    ImageBuffer::from_raw(frame.width, frame.height, frame.data.clone())
                        .ok_or_else(|| anyhow!("Failed to create image buffer from frame data"))?;
                encoder
                    .encode(&img, frame.width, frame.height, image::ExtendedColorType::L8)
                    .with_context(|| format!("Failed to encode TIFF to {:?}", path))?;
            }
            12 | 16 => {
                let expected = (frame.width as usize) * (frame.height as usize) * 2;
                if frame.data.len() != expected {
                    anyhow::bail!(
                        "16-bit frame holds {} bytes, expected {}",
                        frame.data.len(),
                        expected
                    );
                }
                encoder
                    .encode(&frame.data, frame.width, frame.height, image::ExtendedColorType::L16)
                    .with_context(|| format!("Failed to encode 16-bit TIFF to {:?}", path))?;
            }
            other => anyhow::bail!("Unsupported bit depth {}", other),
        }
        Ok(())
    }
}

#[async_trait]
impl OutputHandler for TiffHandler {
    async fn begin_stack(&mut self, _timepoint: usize, _row: usize) -> AppResult<()> {
        Ok(())
    }

    async fn process_slice(&mut self, tagged: TaggedFrame) -> AppResult<()> {
        let path = self.directory.join(name_slice(&self.scheme, &tagged.meta));
        let target = path.clone();
        tokio::task::spawn_blocking(move || Self::write_frame(&tagged.frame, &target))
            .await
            .map_err(DaqError::output)?
            .map_err(DaqError::output)?;

        tracing::debug!(path = ?path, "Wrote slice TIFF");
        self.written.push(path);
        Ok(())
    }

    async fn finalize_stack(&mut self, _timepoint: usize, _row: usize) -> AppResult<()> {
        Ok(())
    }

    async fn finalize_acquisition(&mut self) -> AppResult<()> {
        tracing::info!(
            directory = ?self.directory,
            files = self.written.len(),
            "Individual image output complete"
        );
        Ok(())
    }

    async fn image(&mut self) -> AppResult<Option<ImageStack>> {
        Ok(None)
    }
}
