use crate::attr::Attributes;
use crate::blur::{blur, max3, min3};
use crate::error::Error;
use crate::pal::{f_pixel, gamma_lut, INTERNAL_GAMMA, RGBA};
use fallible_collections::FallibleVec;
use std::borrow::Cow;

/// An RGBA raster attached to the pipeline, plus the importance maps the
/// preprocessing stages derive from it.
///
/// Pixels can be borrowed or owned; the image never mutates caller memory
/// (the opacity workaround copies on write).
pub struct Image<'pixels> {
    px: Cow<'pixels, [RGBA]>,
    width: usize,
    height: usize,
    pub(crate) gamma: f64,
    /// 1.0 = flat area where quantization error hides well; excludes edges.
    pub(crate) noise: Option<Box<[f32]>>,
    /// 1.0 = flat, 0.0 = edge; doubles as the base dither-strength map.
    pub(crate) edges: Option<Box<[f32]>>,
    /// Refined dither strength, produced from `edges` after a flat remap.
    pub(crate) dither_map: Option<Box<[f32]>>,
}

impl<'pixels> Image<'pixels> {
    /// Borrowing constructor. `pixels` must hold exactly `width * height`
    /// entries, row-major. `gamma` is the encoding gamma of the data;
    /// pass 0 for the sRGB-like default.
    pub fn new(
        attr: &Attributes,
        pixels: &'pixels [RGBA],
        width: usize,
        height: usize,
        gamma: f64,
    ) -> Result<Self, Error> {
        Self::new_internal(attr, Cow::Borrowed(pixels), width, height, gamma)
    }

    /// Same as [`Image::new`] but takes ownership of the buffer.
    pub fn new_owned(
        attr: &Attributes,
        pixels: Vec<RGBA>,
        width: usize,
        height: usize,
        gamma: f64,
    ) -> Result<Self, Error> {
        Self::new_internal(attr, Cow::Owned(pixels), width, height, gamma)
    }

    fn new_internal(
        attr: &Attributes,
        px: Cow<'pixels, [RGBA]>,
        width: usize,
        height: usize,
        gamma: f64,
    ) -> Result<Self, Error> {
        if width == 0 || height == 0 || !(0. ..=1.).contains(&gamma) {
            return Err(Error::ValueOutOfRange);
        }
        if px.len() != width * height {
            return Err(Error::BufferTooSmall);
        }

        let mut img = Self {
            px,
            width,
            height,
            gamma: if gamma > 0. { gamma } else { INTERNAL_GAMMA },
            noise: None,
            edges: None,
            dither_map: None,
        };
        if attr.min_opaque_val <= 254. / 255. {
            attr.verbose_print("  Working around IE6 bug by making image less transparent...");
            img.modify_alpha(attr.min_opaque_val);
        }
        Ok(img)
    }

    #[inline]
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub(crate) fn pixels(&self) -> &[RGBA] {
        &self.px
    }

    /// Renderers affected by the opacity bug show any partial transparency
    /// as fully transparent. Raise alpha of almost-opaque pixels linearly
    /// so they reach full opacity at `min_opaque_val`, without a visible
    /// step.
    fn modify_alpha(&mut self, min_opaque_val: f32) {
        let lut = gamma_lut(self.gamma);
        let almost_opaque_val = min_opaque_val * 169. / 256.;
        let almost_opaque_val_int = (almost_opaque_val * 255.) as u8;

        let px = self.px.to_mut();
        for p in px.iter_mut() {
            if p.a >= almost_opaque_val_int {
                let fpx = f_pixel::from_rgba(&lut, *p);
                let al = almost_opaque_val
                    + (fpx.a - almost_opaque_val) * (1. - almost_opaque_val)
                        / (min_opaque_val - almost_opaque_val);
                p.a = (al.min(1.) * 256.).min(255.) as u8;
            }
        }
    }

    /// Builds the `noise` and `edges` maps. Tiny images are left without
    /// maps; every consumer treats a missing map as uniform importance.
    pub(crate) fn contrast_maps(&mut self) -> Result<(), Error> {
        let (cols, rows) = (self.width, self.height);
        if cols < 4 || rows < 4 || self.edges.is_some() {
            return Ok(());
        }

        let mut noise: Vec<f32> = FallibleVec::try_with_capacity(cols * rows).map_err(|_| Error::OutOfMemory)?;
        noise.resize(cols * rows, 0.);
        let mut edges = noise.clone();
        let mut tmp = noise.clone();

        let lut = gamma_lut(self.gamma);
        let px = self.pixels();
        let at = |row: usize, col: usize| f_pixel::from_rgba(&lut, px[row * cols + col]);

        for j in 0..rows {
            let mut prev;
            let mut curr = at(j, 0);
            let mut next = curr;
            for i in 0..cols {
                prev = curr;
                curr = next;
                next = at(j, (i + 1).min(cols - 1));

                // contrast is the second difference of neighbors, horizontally and vertically
                let a = (prev.a + next.a - curr.a * 2.).abs();
                let r = (prev.r + next.r - curr.r * 2.).abs();
                let g = (prev.g + next.g - curr.g * 2.).abs();
                let b = (prev.b + next.b - curr.b * 2.).abs();

                let above = at(j.saturating_sub(1), i);
                let below = at((j + 1).min(rows - 1), i);

                let a1 = (above.a + below.a - curr.a * 2.).abs();
                let r1 = (above.r + below.r - curr.r * 2.).abs();
                let g1 = (above.g + below.g - curr.g * 2.).abs();
                let b1 = (above.b + below.b - curr.b * 2.).abs();

                let horiz = a.max(r).max(g.max(b));
                let vert = a1.max(r1).max(g1.max(b1));
                let edge = horiz.max(vert);
                let mut z = edge - (horiz - vert).abs() * 0.5;
                z = 1. - z.max(horiz.min(vert));
                z *= z; // noise is amplified
                z *= z;

                noise[j * cols + i] = z;
                edges[j * cols + i] = 1. - edge;
            }
        }

        // noise areas are first grown, then shrunk, to drop thin edges from the map
        max3(&noise, &mut tmp, cols, rows);
        max3(&tmp, &mut noise, cols, rows);

        blur(&mut noise, &mut tmp, cols, rows, 3);

        max3(&noise, &mut tmp, cols, rows);
        min3(&tmp, &mut noise, cols, rows);
        min3(&noise, &mut tmp, cols, rows);
        min3(&tmp, &mut noise, cols, rows);

        min3(&edges, &mut tmp, cols, rows);
        max3(&tmp, &mut edges, cols, rows);
        for (e, n) in edges.iter_mut().zip(&noise) {
            *e = e.min(*n);
        }

        self.noise = Some(noise.into_boxed_slice());
        self.edges = Some(edges.into_boxed_slice());
        Ok(())
    }

    /// Turns `edges` into the final dither map by damping runs of pixels
    /// that map to the same palette entry; visible dither patterns on large
    /// flat fills are the alternative.
    ///
    /// Runs are counted horizontally with a one-pixel peek above and below;
    /// a full 2-D flood fill does not improve the result.
    pub(crate) fn update_dither_map(&mut self, remapped: &[u8]) {
        let (width, height) = (self.width, self.height);
        let Some(edges) = self.edges.as_deref_mut() else { return };

        for row in 0..height {
            let mut lastpixel = remapped[row * width];
            let mut lastcol = 0;

            for col in 1..width {
                let px = remapped[row * width + col];

                if px != lastpixel || col == width - 1 {
                    let mut neighbor_count = 2.5 + (col - lastcol) as f32;

                    for i in lastcol..col {
                        if row > 0 && remapped[(row - 1) * width + i] == lastpixel {
                            neighbor_count += 1.;
                        }
                        if row < height - 1 && remapped[(row + 1) * width + i] == lastpixel {
                            neighbor_count += 1.;
                        }
                    }

                    while lastcol <= col {
                        edges[row * width + lastcol] *= 1. - 2.5 / neighbor_count;
                        lastcol += 1;
                    }
                    lastpixel = px;
                }
            }
        }

        self.dither_map = self.edges.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_mismatched_input() {
        let attr = Attributes::new();
        let px = vec![RGBA::new(0, 0, 0, 255); 4];
        assert!(matches!(Image::new(&attr, &px, 0, 4, 0.), Err(Error::ValueOutOfRange)));
        assert!(matches!(Image::new(&attr, &px, 3, 2, 0.), Err(Error::BufferTooSmall)));
        assert!(Image::new(&attr, &px, 2, 2, 0.).is_ok());
    }

    #[test]
    fn flat_image_is_all_noise_free_flatness() {
        let attr = Attributes::new();
        let px = vec![RGBA::new(90, 90, 90, 255); 8 * 8];
        let mut img = Image::new(&attr, &px, 8, 8, 0.).unwrap();
        img.contrast_maps().unwrap();
        let noise = img.noise.as_deref().unwrap();
        let edges = img.edges.as_deref().unwrap();
        assert!(noise.iter().all(|&v| v > 0.99), "flat area must count as flat");
        assert!(edges.iter().all(|&v| v > 0.99), "flat area has no edges");
    }

    #[test]
    fn tiny_images_get_no_maps() {
        let attr = Attributes::new();
        let px = vec![RGBA::new(1, 2, 3, 255); 3 * 3];
        let mut img = Image::new(&attr, &px, 3, 3, 0.).unwrap();
        img.contrast_maps().unwrap();
        assert!(img.noise.is_none() && img.edges.is_none());
    }

    #[test]
    fn opacity_workaround_rounds_almost_opaque_up() {
        let mut attr = Attributes::new();
        attr.set_min_opacity(238).unwrap();
        let px = vec![RGBA::new(10, 20, 30, 250); 4];
        let img = Image::new(&attr, &px, 2, 2, 0.).unwrap();
        assert_eq!(img.pixels()[0].a, 255);
    }

    #[test]
    fn dither_map_damps_long_runs() {
        let attr = Attributes::new();
        let px = vec![RGBA::new(0, 0, 0, 255); 8 * 8];
        let mut img = Image::new(&attr, &px, 8, 8, 0.).unwrap();
        img.contrast_maps().unwrap();
        let remapped = vec![0u8; 8 * 8]; // one giant flat run
        img.update_dither_map(&remapped);
        let map = img.dither_map.as_deref().unwrap();
        assert!(img.edges.is_none());
        assert!(map.iter().all(|&v| v < 0.9), "flat runs must dither less");
    }
}
