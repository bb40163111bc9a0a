use crate::error::Error;
use crate::hist::histogram_from_image;
use crate::image::Image;
use crate::pal::{MAX_COLORS, PalLen};
use crate::quant::{quality_to_mse, QuantizationResult};
use std::fmt;

/// Receives the engine's progress and diagnostic messages.
pub type LogCallback = Box<dyn Fn(&Attributes, &str) + Send + Sync>;
/// Signals a good moment to flush buffered log output.
pub type LogFlushCallback = Box<dyn Fn(&Attributes) + Send + Sync>;

/// Quantization configuration: palette size, quality window, speed/quality
/// trade-off, and transparency handling.
///
/// An `Attributes` value is the entry point of the pipeline; see
/// [`Attributes::quantize`].
pub struct Attributes {
    pub(crate) max_colors: PalLen,
    pub(crate) target_mse: f64,
    pub(crate) max_mse: Option<f64>,
    pub(crate) min_opaque_val: f32,
    pub(crate) last_index_transparent: bool,
    pub(crate) kmeans_iterations: u16,
    pub(crate) kmeans_iteration_limit: f64,
    pub(crate) feedback_loop_trials: u16,
    pub(crate) max_histogram_entries: u32,
    pub(crate) min_posterization: u8,
    pub(crate) use_contrast_maps: bool,
    pub(crate) use_dither_map: bool,
    log_callback: Option<LogCallback>,
    log_flush_callback: Option<LogFlushCallback>,
}

impl Default for Attributes {
    fn default() -> Self {
        let mut attr = Self {
            max_colors: MAX_COLORS as PalLen,
            target_mse: 0.,
            max_mse: None,
            // 1.0 = no workaround; lowering it keeps almost-opaque colors opaque
            min_opaque_val: 1.,
            last_index_transparent: false,
            kmeans_iterations: 0,
            kmeans_iteration_limit: 0.,
            feedback_loop_trials: 0,
            max_histogram_entries: 0,
            min_posterization: 0,
            use_contrast_maps: false,
            use_dither_map: false,
            log_callback: None,
            log_flush_callback: None,
        };
        let _ = attr.set_speed(3);
        attr
    }
}

impl Attributes {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Palette size limit, 2–256.
    pub fn set_max_colors(&mut self, colors: u32) -> Result<(), Error> {
        if !(2..=256).contains(&colors) {
            return Err(Error::ValueOutOfRange);
        }
        self.max_colors = colors as PalLen;
        Ok(())
    }

    /// `target` is the quality to aim for, `minimum` the floor below which
    /// quantization fails with [`Error::QualityTooLow`]. Both 0–100,
    /// `minimum ≤ target`. A minimum of 0 disables the floor.
    pub fn set_quality(&mut self, target: u8, minimum: u8) -> Result<(), Error> {
        if target > 100 || minimum > 100 || target < minimum {
            return Err(Error::ValueOutOfRange);
        }
        self.target_mse = quality_to_mse(target);
        self.max_mse = (minimum > 0).then(|| quality_to_mse(minimum));
        Ok(())
    }

    /// 1–10. Lower is slower and higher quality; 3 is the default.
    pub fn set_speed(&mut self, speed: u8) -> Result<(), Error> {
        if !(1..=10).contains(&speed) {
            return Err(Error::ValueOutOfRange);
        }

        let iterations = u16::from(8u8.saturating_sub(speed));
        self.kmeans_iterations = iterations + iterations * iterations / 2;
        self.kmeans_iteration_limit = 1. / f64::from(1u32 << (23 - speed));
        self.feedback_loop_trials = (56i16 - 9 * i16::from(speed)).max(0) as u16;
        self.max_histogram_entries = (1 << 17) + (1 << 18) * (10 - u32::from(speed));
        self.min_posterization = if speed >= 8 { 1 } else { 0 };
        self.use_contrast_maps = speed <= 7;
        self.use_dither_map = speed <= 5;
        Ok(())
    }

    /// 0–255. Below 255 enables the workaround for renderers that drop
    /// partially transparent pixels entirely: alpha of almost-opaque pixels
    /// is raised so they quantize to opaque entries.
    pub fn set_min_opacity(&mut self, min: u8) -> Result<(), Error> {
        self.min_opaque_val = f32::from(min) / 255.;
        Ok(())
    }

    /// Keep the single fully transparent entry at the end of the palette.
    pub fn set_last_index_transparent(&mut self, is_last: bool) {
        self.last_index_transparent = is_last;
    }

    pub fn set_log_callback(&mut self, callback: LogCallback) {
        self.verbose_flush();
        self.log_callback = Some(callback);
    }

    pub fn set_log_flush_callback(&mut self, callback: LogFlushCallback) {
        self.log_flush_callback = Some(callback);
    }

    /// Runs the whole pipeline on `image`: importance maps, histogram,
    /// palette search, refinement. Remapping is done separately by the
    /// returned [`QuantizationResult`].
    pub fn quantize(&self, image: &mut Image<'_>) -> Result<QuantizationResult, Error> {
        if self.use_contrast_maps {
            image.contrast_maps()?;
        }
        let hist = histogram_from_image(self, image)?;
        self.verbose_print(format!("  made histogram...{} colors found", hist.items.len()));
        QuantizationResult::new(self, hist, image.gamma)
    }

    pub(crate) fn verbose_print(&self, msg: impl AsRef<str>) {
        if let Some(cb) = &self.log_callback {
            cb(self, msg.as_ref());
        }
    }

    pub(crate) fn verbose_flush(&self) {
        if let Some(cb) = &self.log_flush_callback {
            cb(self);
        }
    }

    /// K-means pass count and the error delta below which iteration stops.
    /// A single pass is forced when a quality floor must be measured.
    pub(crate) fn refinement_iterations(&self, palette_error_known: bool) -> (u16, f64) {
        let mut iterations = self.kmeans_iterations;
        if iterations == 0 && !palette_error_known && self.max_mse.is_some() {
            iterations = 1;
        }
        (iterations, self.kmeans_iteration_limit)
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attributes")
            .field("max_colors", &self.max_colors)
            .field("target_mse", &self.target_mse)
            .field("max_mse", &self.max_mse)
            .field("feedback_loop_trials", &self.feedback_loop_trials)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_validate_ranges() {
        let mut attr = Attributes::new();
        assert_eq!(attr.set_max_colors(1), Err(Error::ValueOutOfRange));
        assert_eq!(attr.set_max_colors(257), Err(Error::ValueOutOfRange));
        assert_eq!(attr.set_quality(50, 80), Err(Error::ValueOutOfRange));
        assert_eq!(attr.set_speed(0), Err(Error::ValueOutOfRange));
        assert_eq!(attr.set_speed(11), Err(Error::ValueOutOfRange));
        assert!(attr.set_max_colors(2).is_ok());
        assert!(attr.set_quality(80, 50).is_ok());
        assert!(attr.set_speed(10).is_ok());
    }

    #[test]
    fn quality_zero_disables_floor() {
        let mut attr = Attributes::new();
        attr.set_quality(70, 0).unwrap();
        assert!(attr.max_mse.is_none());
        attr.set_quality(70, 70).unwrap();
        assert!(attr.max_mse.is_some());
    }

    #[test]
    fn work_shrinks_as_speed_grows() {
        let mut prev: Option<(u16, u16, u32)> = None;
        for speed in 1..=10 {
            let mut attr = Attributes::new();
            attr.set_speed(speed).unwrap();
            let now = (
                attr.feedback_loop_trials,
                attr.kmeans_iterations,
                attr.max_histogram_entries,
            );
            if let Some(prev) = prev {
                assert!(now.0 <= prev.0);
                assert!(now.1 <= prev.1);
                assert!(now.2 <= prev.2);
            }
            prev = Some(now);
        }
    }

    #[test]
    fn speed_derivations_toggle_maps() {
        let mut attr = Attributes::new();
        attr.set_speed(5).unwrap();
        assert!(attr.use_contrast_maps && attr.use_dither_map);
        attr.set_speed(7).unwrap();
        assert!(attr.use_contrast_maps && !attr.use_dither_map);
        attr.set_speed(8).unwrap();
        assert!(!attr.use_contrast_maps);
        assert_eq!(attr.min_posterization, 1);
    }
}
