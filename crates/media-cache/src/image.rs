//! Image values held by the image cache and their memory cost

use serde::{Deserialize, Serialize};

/// Bytes per pixel assumed when the row stride is unknown
pub const DEFAULT_BYTES_PER_PIXEL: u64 = 4;

/// Memory cost of a value held in the image cache's memory tier
pub trait PixelCost {
    fn pixel_cost(&self) -> u64;
}

/// Decoded pixel buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Raster {
    pub bytes_per_row: u32,
    pub rows: u32,
    pub pixels: Vec<u8>,
}

/// An image with its logical size and, when decoded, its pixels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bitmap {
    /// Width in points
    pub width: f64,
    /// Height in points
    pub height: f64,
    /// Pixels per point
    pub scale: f64,
    pub raster: Option<Raster>,
}

impl Bitmap {
    pub fn new(width: f64, height: f64, scale: f64) -> Self {
        Self {
            width,
            height,
            scale,
            raster: None,
        }
    }

    pub fn with_raster(mut self, raster: Raster) -> Self {
        self.raster = Some(raster);
        self
    }
}

impl PixelCost for Bitmap {
    /// Row stride times rows when decoded, otherwise the pixel count at
    /// `scale` times four bytes
    fn pixel_cost(&self) -> u64 {
        if let Some(raster) = &self.raster {
            return u64::from(raster.bytes_per_row) * u64::from(raster.rows);
        }
        let pixels = (self.width * self.scale * self.height * self.scale).max(0.0);
        (pixels as u64).saturating_mul(DEFAULT_BYTES_PER_PIXEL)
    }
}

/// Encoded image bytes cost their length
impl PixelCost for Vec<u8> {
    fn pixel_cost(&self) -> u64 {
        self.len() as u64
    }
}
