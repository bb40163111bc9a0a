//! Palette quantization with perceptual weighting and edge-aware dithering.
//!
//! Reduces a 32-bit RGBA raster to an indexed image of up to 256 palette
//! entries. The pipeline weights colors by a noise map so flat areas get
//! accurate colors, searches for the palette with a feedback loop around
//! median-cut and K-means refinement, and remaps with optional
//! Floyd–Steinberg dithering steered away from edges.
//!
//! ```
//! use palquant::{Attributes, Image, RGBA};
//!
//! # fn main() -> Result<(), palquant::Error> {
//! let mut attr = Attributes::new();
//! attr.set_quality(70, 0)?;
//!
//! let pixels = vec![RGBA::new(120, 60, 30, 255); 64 * 64];
//! let mut image = Image::new(&attr, &pixels, 64, 64, 0.)?;
//!
//! let mut result = attr.quantize(&mut image)?;
//! result.set_dithering_level(1.0)?;
//!
//! let (palette, indices) = result.remapped(&mut image)?;
//! assert!(!palette.is_empty());
//! assert_eq!(indices.len(), 64 * 64);
//! # Ok(()) }
//! ```

mod attr;
mod blur;
mod error;
mod hist;
mod image;
mod kmeans;
mod mediancut;
mod nearest;
mod pal;
mod quant;
mod remap;

pub use crate::attr::{Attributes, LogCallback, LogFlushCallback};
pub use crate::error::Error;
pub use crate::image::Image;
pub use crate::pal::{Palette, RGBA};
pub use crate::quant::QuantizationResult;

use std::cmp::Ordering;

/// Total-order wrapper so floats can be used as sort keys.
#[derive(PartialEq, Clone, Copy)]
pub(crate) struct OrdFloat(f32);

impl OrdFloat {
    #[inline]
    pub fn new(v: f32) -> Self {
        Self(v)
    }
}

impl Eq for OrdFloat {}

impl PartialOrd for OrdFloat {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdFloat {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}
