use crate::attr::Attributes;
use crate::error::Error;
use crate::hist::HistogramInternal;
use crate::image::Image;
use crate::kmeans::Kmeans;
use crate::mediancut::mediancut;
use crate::pal::{PalF, PalLen, PalPop, Palette, MAX_COLORS, MAX_DIFF, MAX_TRANSP_A, RGBA};
use crate::remap::{mse_to_standard_mse, Remapped};
use fallible_collections::FallibleVec;
use std::fmt;

/// Outcome of quantization: the palette plus everything needed to remap
/// images against it. One result can remap any number of images.
pub struct QuantizationResult {
    remapped: Option<Box<Remapped>>,
    pub(crate) palette: PalF,
    int_palette: Palette,
    pub(crate) dither_level: f32,
    pub(crate) gamma: f64,
    pub(crate) palette_error: Option<f64>,
    pub(crate) min_opaque_val: f32,
    pub(crate) use_dither_map: bool,
}

impl QuantizationResult {
    pub(crate) fn new(attr: &Attributes, mut hist: HistogramInternal, gamma: f64) -> Result<Self, Error> {
        let (mut palette, mut palette_error) = find_best_palette(attr, &mut hist);
        refine_palette(&mut palette, attr, &mut hist, &mut palette_error);

        if let (Some(palette_error), Some(max_mse)) = (palette_error, attr.max_mse) {
            if palette_error > max_mse {
                attr.verbose_print(format!(
                    "  image degradation MSE={:0.3} (Q={}) exceeded limit of {:0.3} ({})",
                    mse_to_standard_mse(palette_error),
                    mse_to_quality(palette_error),
                    mse_to_standard_mse(max_mse),
                    mse_to_quality(max_mse)
                ));
                return Err(Error::QualityTooLow);
            }
        }

        sort_palette(attr, &mut palette);
        attr.verbose_flush();

        Ok(Self {
            remapped: None,
            palette,
            int_palette: Palette {
                count: 0,
                entries: [Default::default(); MAX_COLORS],
            },
            dither_level: 0.,
            gamma,
            palette_error,
            min_opaque_val: attr.min_opaque_val,
            use_dither_map: attr.use_dither_map,
        })
    }

    /// Set to 1.0 for a nice smooth image. 0 disables dithering.
    pub fn set_dithering_level(&mut self, value: f32) -> Result<(), Error> {
        if !(0. ..=1.).contains(&value) {
            return Err(Error::ValueOutOfRange);
        }
        self.remapped = None;
        self.dither_level = value;
        Ok(())
    }

    /// The default is sRGB gamma (~1/2.2).
    pub fn set_output_gamma(&mut self, value: f64) -> Result<(), Error> {
        if value <= 0. || value >= 1. {
            return Err(Error::ValueOutOfRange);
        }
        self.remapped = None;
        self.gamma = value;
        Ok(())
    }

    /// Gamma the output palette is encoded with.
    #[inline]
    #[must_use]
    pub fn output_gamma(&self) -> f64 {
        self.gamma
    }

    /// Number 0–100 guessing how nice the input image will look when
    /// remapped to this palette.
    #[must_use]
    pub fn quantization_quality(&self) -> Option<u8> {
        self.palette_error.map(mse_to_quality)
    }

    /// Mean squared error of the palette, in the conventional 8-bit scale.
    #[must_use]
    pub fn quantization_error(&self) -> Option<f64> {
        self.palette_error.map(mse_to_standard_mse)
    }

    /// Error actually measured while remapping the last image.
    #[must_use]
    pub fn remapping_error(&self) -> Option<f64> {
        self.remapped
            .as_ref()
            .and_then(|re| re.palette_error)
            .map(mse_to_standard_mse)
    }

    #[must_use]
    pub fn remapping_quality(&self) -> Option<u8> {
        self.remapped
            .as_ref()
            .and_then(|re| re.palette_error)
            .map(mse_to_quality)
    }

    /// Final 8-bit palette. Read it after remapping, not before: remapping
    /// refines the palette to the image.
    pub fn palette(&mut self) -> &[RGBA] {
        self.int_palette().as_slice()
    }

    /// Remaps `image` and returns the palette plus one index byte per
    /// pixel, row-major.
    pub fn remapped(&mut self, image: &mut Image<'_>) -> Result<(Vec<RGBA>, Vec<u8>), Error> {
        let len = image.width() * image.height();
        let mut buf: Vec<u8> = FallibleVec::try_with_capacity(len).map_err(|_| Error::OutOfMemory)?;
        buf.resize(len, 0);
        self.remap_into(image, &mut buf)?;
        let palette = self.palette().to_vec();
        Ok((palette, buf))
    }

    /// Remaps into a caller-supplied buffer of at least width×height bytes.
    pub fn remap_into(&mut self, image: &mut Image<'_>, output_buf: &mut [u8]) -> Result<(), Error> {
        let required_size = image.width() * image.height();
        let output_buf = output_buf.get_mut(..required_size).ok_or(Error::BufferTooSmall)?;

        if image.edges.is_none() && image.dither_map.is_none() && self.use_dither_map {
            image.contrast_maps()?;
        }
        self.remapped = Some(Box::new(Remapped::new(self, image, output_buf)?));
        Ok(())
    }

    fn int_palette(&mut self) -> &Palette {
        match self.remapped.as_ref() {
            Some(remapped) => &remapped.int_palette,
            None => {
                if self.int_palette.count == 0 {
                    self.int_palette = crate::remap::make_int_palette(&mut self.palette, self.gamma);
                }
                &self.int_palette
            }
        }
    }
}

impl fmt::Debug for QuantizationResult {
    #[cold]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QuantizationResult(q={})", self.quantization_quality().unwrap_or(0))
    }
}

/// Moves the single fully transparent entry last (when requested), or
/// pushes partially transparent entries to the front so the transparency
/// segment of the output stays short; both segments end up in ascending
/// popularity, which compresses slightly better.
fn sort_palette(attr: &Attributes, palette: &mut PalF) {
    if attr.last_index_transparent {
        let transparent = palette.as_slice().iter().position(|c| c.a < MAX_TRANSP_A);
        if let Some(transparent) = transparent {
            let last = palette.len() - 1;
            palette.swap(transparent, last);
            palette.sort_range_by_popularity(0..last);
            return;
        }
    }

    palette.sort_by_trns_and_popularity();
    let num_transparent = palette
        .as_slice()
        .iter()
        .take_while(|c| c.a < crate::pal::MIN_OPAQUE_A)
        .count();
    attr.verbose_print(format!(
        "  eliminated opaque tRNS-chunk entries...{} entr{} transparent",
        num_transparent,
        if num_transparent == 1 { "y" } else { "ies" }
    ));
}

/// Repeats mediancut with different histogram weights to find the palette
/// with minimum error. Each kept trial is also one K-means pass, so
/// mediancut is made to deliberately overshoot the target.
fn find_best_palette(attr: &Attributes, hist: &mut HistogramInternal) -> (PalF, Option<f64>) {
    // when the image has few colors and no quality target, the histogram is the palette
    if hist.items.len() <= attr.max_colors as usize && attr.target_mse == 0. {
        let mut palette = PalF::new();
        for item in hist.items.iter() {
            palette.push(item.color, PalPop::new(item.perceptual_weight));
        }
        return (palette, Some(0.));
    }

    let target_mse = attr.target_mse;
    let mut max_colors = attr.max_colors;
    let total_trials = i32::from(attr.feedback_loop_trials);
    let mut trials_left = total_trials;
    let mut target_mse_overshoot = if total_trials > 0 { 1.05 } else { 1. };
    let mut best_palette: Option<PalF> = None;
    let mut least_error: Option<f64> = None;

    loop {
        let max_mse_per_color =
            (90. / 65536f64).max(target_mse).max(least_error.unwrap_or(0.)) * 1.2;
        let mut new_palette = mediancut(
            hist,
            attr.min_opaque_val,
            max_colors,
            target_mse * target_mse_overshoot,
            max_mse_per_color,
        );

        if trials_left <= 0 {
            // error stays unknown: no K-means pass ever measured this palette
            return (new_palette, least_error);
        }

        // total error of the trial is measured to keep the best palette;
        // the same pass doubles as one K-means step, and failed trials
        // shift the histogram weights toward the poorly matched colors
        let first_run_of_target_mse = best_palette.is_none() && target_mse > 0.;
        let total_error =
            Kmeans::iteration(hist, &mut new_palette, attr.min_opaque_val, !first_run_of_target_mse);

        // better quality wins, as does good-enough quality with fewer colors
        if best_palette.is_none()
            || total_error < least_error.unwrap_or(MAX_DIFF)
            || (total_error <= target_mse && (new_palette.len() as PalLen) < max_colors)
        {
            if total_error < target_mse && total_error > 0. {
                // the K-means pass improves on what mediancut aims for;
                // compensate by letting mediancut aim proportionally worse
                target_mse_overshoot = (target_mse_overshoot * 1.25).min(target_mse / total_error);
            }
            // if the number of colors could be reduced, keep it that way,
            // with one entry of wiggle room
            max_colors = max_colors.min(new_palette.len() as PalLen + 1);
            least_error = Some(total_error);
            best_palette = Some(new_palette);
            trials_left -= 1;
        } else {
            for item in hist.items.iter_mut() {
                item.adjusted_weight = (item.perceptual_weight + item.adjusted_weight) / 2.;
            }
            target_mse_overshoot = 1.;
            trials_left -= 6;
            // a really bad trial is unlikely to recover, end sooner
            if total_error > least_error.unwrap_or(MAX_DIFF) * 4. {
                trials_left -= 3;
            }
        }

        let done = 100 - (trials_left.max(0) * 100) / (total_trials + 1);
        attr.verbose_print(format!("  selecting colors...{done}%"));

        if trials_left <= 0 {
            break;
        }
    }

    (best_palette.expect("at least one trial ran"), least_error)
}

/// K-means passes after the controller settled, approaching the local
/// minimum for the chosen palette.
fn refine_palette(
    palette: &mut PalF,
    attr: &Attributes,
    hist: &mut HistogramInternal,
    palette_error: &mut Option<f64>,
) {
    let (mut iterations, iteration_limit) = attr.refinement_iterations(palette_error.is_some());
    if iterations == 0 {
        return;
    }

    attr.verbose_print("  moving colormap towards local minimum");
    let max_mse = attr.max_mse.unwrap_or(MAX_DIFF);
    let mut previous_error = palette_error.unwrap_or(MAX_DIFF);
    let mut i = 0;
    while i < iterations {
        let pal_err = Kmeans::iteration(hist, palette, attr.min_opaque_val, false);
        debug_assert!(pal_err < 1e20);
        *palette_error = Some(pal_err);

        if (previous_error - pal_err).abs() < iteration_limit {
            break;
        }
        if pal_err > max_mse * 1.5 {
            // probably hopeless; one extra pass may still save it
            if pal_err > max_mse * 3. {
                break;
            }
            iterations += 1;
        }
        previous_error = pal_err;
        i += 1;
    }
}

/// Curve fudged to be roughly similar to the quality scale of libjpeg.
pub(crate) fn quality_to_mse(quality: u8) -> f64 {
    if quality == 0 {
        return MAX_DIFF;
    }
    if quality >= 100 {
        return 0.;
    }
    2.5 / (210. + f64::from(quality)).powf(1.2) * (100.1 - f64::from(quality)) / 100.
}

pub(crate) fn mse_to_quality(mse: f64) -> u8 {
    for i in (1..101u8).rev() {
        if mse <= quality_to_mse(i) + 0.000001 {
            return i;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_curve_is_monotone() {
        for q in 1..100u8 {
            assert!(quality_to_mse(q) > quality_to_mse(q + 1), "q={q}");
        }
        assert_eq!(quality_to_mse(100), 0.);
        assert_eq!(quality_to_mse(0), MAX_DIFF);
    }

    #[test]
    fn mse_quality_roundtrip_is_tight() {
        for q in 1..=99u8 {
            let back = mse_to_quality(quality_to_mse(q));
            assert!(back >= q, "q={q} back={back}");
            assert!(back <= q.saturating_add(1), "q={q} back={back}");
        }
    }
}
