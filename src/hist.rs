use crate::attr::Attributes;
use crate::error::Error;
use crate::image::Image;
use crate::pal::{f_pixel, gamma_lut, PalIndex, RGBA};
use fallible_collections::FallibleVec;
use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hasher};

/// One distinct (possibly posterized) input color.
pub(crate) struct HistItem {
    pub color: f_pixel,
    /// Invariant importance: summed noise-map values (or pixel count).
    pub perceptual_weight: f32,
    /// The weight the feedback controller mutates between trials.
    pub adjusted_weight: f32,
    /// Last palette entry this color mapped to; seeds the nearest search.
    pub likely_colormap_index: PalIndex,
}

pub(crate) struct HistogramInternal {
    pub items: Box<[HistItem]>,
    pub total_perceptual_weight: f64,
}

/// Keys are already well-mixed color bits; hash by multiplication only.
#[derive(Default)]
struct U32Hasher(u32);

impl Hasher for U32Hasher {
    #[inline]
    fn finish(&self) -> u64 {
        u64::from(self.0)
    }

    #[inline]
    fn write_u32(&mut self, i: u32) {
        self.0 = i.wrapping_mul(0x9E37_79B9);
    }

    fn write(&mut self, _: &[u8]) {
        unreachable!("only u32 keys are hashed");
    }
}

type WeightMap = HashMap<u32, f32, BuildHasherDefault<U32Hasher>>;

/// Counts colors weighted by the noise map. Starts at the configured
/// posterization level; every time the distinct-color cap overflows, one
/// more low bit is dropped from each channel and the count restarts, which
/// bounds the table at 65536 entries worst case.
pub(crate) fn histogram_from_image(
    attr: &Attributes,
    image: &mut Image<'_>,
) -> Result<HistogramInternal, Error> {
    let pixels = image.pixels();
    let noise = image.noise.as_deref();
    let maxcolors = attr.max_histogram_entries as usize;

    let mut ignorebits = attr.min_posterization;
    let counts = loop {
        match compute_color_weights(pixels, noise, ignorebits, maxcolors)? {
            Some(counts) => break counts,
            None => {
                ignorebits += 1;
                attr.verbose_print("  too many colors! Scaling colors to improve clustering...");
            }
        }
    };

    // color accuracy in noisy areas does not matter, so the noise map is
    // done once the weights are in
    image.noise = None;

    // deterministic item order regardless of hash iteration
    let mut sorted: Vec<(u32, f32)> = FallibleVec::try_with_capacity(counts.len()).map_err(|_| Error::OutOfMemory)?;
    sorted.extend(counts);
    sorted.sort_unstable_by_key(|&(key, _)| key);

    let lut = gamma_lut(image.gamma);
    let mut items: Vec<HistItem> = FallibleVec::try_with_capacity(sorted.len()).map_err(|_| Error::OutOfMemory)?;
    let mut total_perceptual_weight = 0.;
    items.extend(sorted.into_iter().map(|(key, weight)| {
        let weight = weight * (1. + 1. / 256.);
        total_perceptual_weight += f64::from(weight);
        HistItem {
            color: f_pixel::from_rgba(&lut, color_from_key(key)),
            perceptual_weight: weight,
            adjusted_weight: weight,
            likely_colormap_index: 0,
        }
    }));

    Ok(HistogramInternal {
        items: items.into_boxed_slice(),
        total_perceptual_weight,
    })
}

/// One attempt at the given posterization level; `None` when the cap
/// overflows and the caller must retry with fewer bits.
fn compute_color_weights(
    pixels: &[RGBA],
    noise: Option<&[f32]>,
    ignorebits: u8,
    maxcolors: usize,
) -> Result<Option<WeightMap>, Error> {
    let mask = 0xFFu32 >> ignorebits << ignorebits;
    let mut map = WeightMap::default();
    map.try_reserve(maxcolors.min(pixels.len())).map_err(|_| Error::OutOfMemory)?;

    for (i, px) in pixels.iter().enumerate() {
        let key = (u32::from(px.r) & mask)
            | (u32::from(px.g) & mask) << 8
            | (u32::from(px.b) & mask) << 16
            | (u32::from(px.a) & mask) << 24;
        let weight = noise.map_or(1., |n| n[i]);
        *map.entry(key).or_insert(0.) += weight;

        if map.len() > maxcolors {
            return Ok(None);
        }
    }
    Ok(Some(map))
}

#[inline]
fn color_from_key(key: u32) -> RGBA {
    RGBA {
        r: key as u8,
        g: (key >> 8) as u8,
        b: (key >> 16) as u8,
        a: (key >> 24) as u8,
    }
}
