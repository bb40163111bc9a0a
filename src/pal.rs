use crate::OrdFloat;
use arrayvec::ArrayVec;
use std::ops::{Deref, DerefMut};

pub type RGBA = rgb::RGBA8;
pub(crate) type ARGBF = rgb::RGBA<f32>;

pub(crate) type PalIndex = u8;
pub(crate) type PalLen = u16;

pub(crate) const MAX_COLORS: usize = 256;

/// Entries with alpha at or below this are treated as fully transparent.
pub(crate) const MAX_TRANSP_A: f32 = 1. / 256.;
/// Boundary of the tRNS segment: entries with alpha below this still need a transparency byte.
pub(crate) const MIN_OPAQUE_A: f32 = 255. / 256.;

pub(crate) const MAX_DIFF: f64 = 1e20;

/// Pixel in the linear, alpha-premultiplied working space.
///
/// Gamma expansion plus premultiplication make the plain squared distance
/// of [`f_pixel::diff`] approximate perceptual difference, and mixing
/// partially transparent colors blend correctly.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(transparent)]
pub(crate) struct f_pixel(pub ARGBF);

impl f_pixel {
    /// Squared distance over all four components.
    #[inline(always)]
    pub fn diff(&self, other: &Self) -> f32 {
        let x = self.0;
        let y = other.0;
        (x.a - y.a) * (x.a - y.a)
            + (x.r - y.r) * (x.r - y.r)
            + (x.g - y.g) * (x.g - y.g)
            + (x.b - y.b) * (x.b - y.b)
    }

    #[inline]
    pub fn from_rgba(lut: &[f32; 256], px: RGBA) -> Self {
        let a = f32::from(px.a) / 255.;
        Self(ARGBF {
            r: lut[px.r as usize] * a,
            g: lut[px.g as usize] * a,
            b: lut[px.b as usize] * a,
            a,
        })
    }

    /// Inverse of [`f_pixel::from_rgba`]: unpremultiply, gamma-compress, round to 8 bits.
    pub fn to_rgb(&self, gamma: f64) -> RGBA {
        if self.0.a < MAX_TRANSP_A {
            return RGBA::new(0, 0, 0, 0);
        }

        let gamma = gamma as f32;
        let r = (self.0.r / self.0.a).clamp(0., 1.).powf(gamma);
        let g = (self.0.g / self.0.a).clamp(0., 1.).powf(gamma);
        let b = (self.0.b / self.0.a).clamp(0., 1.).powf(gamma);

        // 256, to counteract the rounding error the forward conversion introduced
        RGBA {
            r: (r * 256.).min(255.) as u8,
            g: (g * 256.).min(255.) as u8,
            b: (b * 256.).min(255.) as u8,
            a: (self.0.a * 256.).min(255.) as u8,
        }
    }
}

impl Deref for f_pixel {
    type Target = ARGBF;

    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for f_pixel {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Expansion table from 8-bit gamma-compressed samples to linear floats.
///
/// `gamma` is the encoding exponent of the source (0.45455 for sRGB-like
/// data), so expansion raises to `1/gamma`.
pub(crate) fn gamma_lut(gamma: f64) -> [f32; 256] {
    debug_assert!(gamma > 0. && gamma <= 1.);
    std::array::from_fn(|i| ((i as f64 / 255.).powf(gamma.recip())) as f32)
}

pub(crate) const INTERNAL_GAMMA: f64 = 0.45455;

/// Popularity of a palette entry, with a marker for entries that the
/// refinement passes must leave untouched.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) struct PalPop {
    popularity: f32,
    fixed: bool,
}

impl PalPop {
    #[inline]
    pub fn new(popularity: f32) -> Self {
        Self { popularity, fixed: false }
    }

    #[inline]
    pub fn popularity(self) -> f32 {
        self.popularity
    }

    #[inline]
    pub fn is_fixed(self) -> bool {
        self.fixed
    }
}

/// Palette in the working color space, together with entry popularities.
#[derive(Debug, Clone, Default)]
pub(crate) struct PalF {
    colors: ArrayVec<f_pixel, MAX_COLORS>,
    pops: ArrayVec<PalPop, MAX_COLORS>,
}

impl PalF {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, color: f_pixel, pop: PalPop) {
        self.colors.push(color);
        self.pops.push(pop);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.colors.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[f_pixel] {
        &self.colors
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&mut f_pixel, &mut PalPop)> {
        self.colors.iter_mut().zip(self.pops.iter_mut())
    }

    pub fn swap(&mut self, a: usize, b: usize) {
        self.colors.swap(a, b);
        self.pops.swap(a, b);
    }

    /// Sorts entries so the tRNS segment shrinks and popular colors land last,
    /// which compresses slightly better.
    pub fn sort_by_trns_and_popularity(&mut self) {
        let mut tmp: ArrayVec<_, MAX_COLORS> =
            self.colors.iter().copied().zip(self.pops.iter().copied()).collect();
        tmp.sort_unstable_by_key(|&(color, pop)| {
            (color.a >= MIN_OPAQUE_A, OrdFloat::new(pop.popularity()))
        });
        for ((dcol, dpop), (scol, spop)) in self.iter_mut().zip(tmp) {
            *dcol = scol;
            *dpop = spop;
        }
    }

    /// Ascending-popularity sort of `range` only.
    pub fn sort_range_by_popularity(&mut self, range: std::ops::Range<usize>) {
        let mut tmp: ArrayVec<_, MAX_COLORS> = self.colors[range.clone()]
            .iter()
            .copied()
            .zip(self.pops[range.clone()].iter().copied())
            .collect();
        tmp.sort_unstable_by_key(|&(_, pop)| OrdFloat::new(pop.popularity()));
        for (i, (scol, spop)) in range.zip(tmp) {
            self.colors[i] = scol;
            self.pops[i] = spop;
        }
    }
}

/// Final 8-bit palette handed to the caller.
#[derive(Clone)]
pub struct Palette {
    pub(crate) count: PalLen,
    pub(crate) entries: [RGBA; MAX_COLORS],
}

impl Palette {
    #[inline]
    pub fn as_slice(&self) -> &[RGBA] {
        &self.entries[..self.count as usize]
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [RGBA] {
        &mut self.entries[..self.count as usize]
    }
}
