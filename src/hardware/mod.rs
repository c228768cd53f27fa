//! Hardware abstractions consumed by the acquisition engine.
//!
//! Device drivers live outside this crate; the engine only talks to the
//! capability traits in [`capabilities`]. Simulated devices for tests and the
//! CLI's dry runs are in [`mock`].

pub mod capabilities;
pub mod mock;
pub mod setup;

pub use setup::Setup;

use serde::{Deserialize, Serialize};

/// Represents a single image frame.
///
/// # Storage
/// Data is stored as a raw byte vector (`Vec<u8>`).
/// - 8-bit images: 1 byte per pixel.
/// - 12/16-bit images: 2 bytes per pixel, Little Endian.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Bits per pixel (e.g., 8, 12, 16)
    pub bit_depth: u32,

    /// Raw pixel data
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a new frame from 16-bit pixel data.
    pub fn from_u16(width: u32, height: u32, pixels: &[u16]) -> Self {
        let mut data = Vec::with_capacity(pixels.len() * 2);
        for pixel in pixels {
            data.extend_from_slice(&pixel.to_le_bytes());
        }

        Self {
            width,
            height,
            bit_depth: 16,
            data,
        }
    }

    /// Create a new frame from 8-bit pixel data.
    pub fn from_u8(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            bit_depth: 8,
            data,
        }
    }

    /// Get pixel value at (x, y), handling bit depth conversion.
    pub fn get(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }

        let idx = (y as usize) * (self.width as usize) + x as usize;

        match self.bit_depth {
            8 => self.data.get(idx).map(|&v| u32::from(v)),
            12 | 16 => {
                let start = idx * 2;
                match (self.data.get(start), self.data.get(start + 1)) {
                    (Some(&lo), Some(&hi)) => Some(u32::from(u16::from_le_bytes([lo, hi]))),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Payload size in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Minimum and maximum pixel values, or `None` for an empty frame.
    pub fn min_max(&self) -> Option<(u32, u32)> {
        let mut range: Option<(u32, u32)> = None;
        for y in 0..self.height {
            for x in 0..self.width {
                if let Some(v) = self.get(x, y) {
                    range = Some(match range {
                        None => (v, v),
                        Some((lo, hi)) => (lo.min(v), hi.max(v)),
                    });
                }
            }
        }
        range
    }
}
