use crate::error::Error;
use crate::image::Image;
use crate::kmeans::Kmeans;
use crate::nearest::Nearest;
use crate::pal::{f_pixel, gamma_lut, PalF, PalIndex, Palette, MAX_COLORS, MAX_TRANSP_A};
use crate::quant::{quality_to_mse, QuantizationResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

pub(crate) struct Remapped {
    pub(crate) int_palette: Palette,
    pub(crate) palette_error: Option<f64>,
}

impl Remapped {
    pub fn new(result: &QuantizationResult, image: &mut Image<'_>, output: &mut [u8]) -> Result<Self, Error> {
        let mut palette = result.palette.clone();
        let mut palette_error = result.palette_error;
        let int_palette;

        if result.dither_level == 0. {
            int_palette = make_int_palette(&mut palette, result.gamma);
            palette_error = Some(remap_to_palette(image, output, &mut palette, result.min_opaque_val)?);
        } else {
            let generate_dither_map =
                result.use_dither_map && image.edges.is_some() && image.dither_map.is_none();
            if generate_dither_map {
                // the undithered remap finds the areas that need dithering,
                // and as a side effect runs one more K-means pass
                palette_error = Some(remap_to_palette(image, output, &mut palette, result.min_opaque_val)?);
                image.update_dither_map(output);
            }

            // that remap was the last chance to improve the palette, so the
            // final rounding happens only now, and dithering works with the
            // colors exactly as they will be emitted
            int_palette = make_int_palette(&mut palette, result.gamma);
            let max_dither_error =
                (palette_error.unwrap_or(quality_to_mse(80)) * 2.4).max(quality_to_mse(35)) as f32;
            remap_to_palette_floyd(
                image,
                output,
                &palette,
                result,
                max_dither_error,
                generate_dither_map,
            )?;
        }

        Ok(Self { int_palette, palette_error })
    }
}

/// Rounds the palette to 8 bits and keeps the rounded value as the working
/// color, so remapping and dithering measure against what is actually
/// emitted.
pub(crate) fn make_int_palette(palette: &mut PalF, gamma: f64) -> Palette {
    let mut int_palette = Palette {
        count: palette.len() as _,
        entries: [Default::default(); MAX_COLORS],
    };
    let lut = gamma_lut(gamma);
    for ((f_color, _), int_pal) in palette.iter_mut().zip(int_palette.as_mut_slice()) {
        let px = f_color.to_rgb(gamma);
        *f_color = f_pixel::from_rgba(&lut, px);
        *int_pal = px;
    }
    int_palette
}

/// Plain nearest-entry remap. Also accumulates a K-means update while it
/// goes, squeezing residual error out of the palette for free.
/// Returns the mean error of the assignment.
pub(crate) fn remap_to_palette(
    image: &Image<'_>,
    output: &mut [u8],
    palette: &mut PalF,
    min_opaque_val: f32,
) -> Result<f64, Error> {
    let width = image.width();
    let height = image.height();
    let pixels = image.pixels();

    let n = Nearest::new(palette, min_opaque_val);
    let pal_len = palette.len();
    let transparent_index = n.search(&f_pixel::default(), 0).0;
    let lut = gamma_lut(image.gamma);

    // rows are processed in parallel only when the image is big enough for
    // the fork to pay off; chunk results merge in row order either way
    let rows_per_chunk = if width * height > 3000 {
        (height + 255) / 256
    } else {
        height
    };

    let partials: Vec<(Kmeans, f64, u64)> = output
        .par_chunks_mut(width * rows_per_chunk)
        .enumerate()
        .map(|(chunk_index, out_rows)| {
            let mut kmeans = Kmeans::new(pal_len);
            let mut error_sum = 0.;
            let mut remapped_pixels = 0u64;
            let mut last_match = 0 as PalIndex;
            let base = chunk_index * rows_per_chunk * width;
            let out_rows_len = out_rows.len();

            for (out, px) in out_rows.iter_mut().zip(&pixels[base..base + out_rows_len]) {
                let px = f_pixel::from_rgba(&lut, *px);
                let matched = if px.a < MAX_TRANSP_A {
                    transparent_index
                } else {
                    let (matched, diff) = n.search(&px, last_match);
                    error_sum += f64::from(diff);
                    remapped_pixels += 1;
                    matched
                };
                last_match = matched;
                *out = matched;
                kmeans.update_color(px, 1., matched);
            }
            (kmeans, error_sum, remapped_pixels)
        })
        .collect();

    let mut error_sum = 0.;
    let mut remapped_pixels = 0u64;
    let mut merged: Option<Kmeans> = None;
    for (kmeans, err, count) in partials {
        error_sum += err;
        remapped_pixels += count;
        merged = Some(match merged {
            Some(m) => m.merge(kmeans),
            None => kmeans,
        });
    }
    if let Some(kmeans) = merged {
        kmeans.finalize(palette);
    }

    Ok(error_sum / remapped_pixels.max(1) as f64)
}

/// Scales the error being injected into a pixel so that no channel leaves
/// the representable range, which would otherwise show up as bands of
/// unexpected colors next to saturated areas.
fn get_dithered_pixel(dither_level: f32, max_dither_error: f32, thiserr: f_pixel, px: f_pixel) -> f_pixel {
    let sr = thiserr.r * dither_level;
    let sg = thiserr.g * dither_level;
    let sb = thiserr.b * dither_level;
    let sa = thiserr.a * dither_level;

    let dither_error = sr * sr + sg * sg + sb * sb + sa * sa;
    if dither_error < 2. / 256. / 256. {
        // areas without noticeable error stay untouched, which also keeps the file smaller
        return px;
    }

    let clamp_ratio = |s: f32, v: f32| {
        if s < 0. {
            v / -s
        } else if s > 0. {
            (1. - v) / s
        } else {
            1.
        }
    };
    let mut ratio = clamp_ratio(sr, px.r)
        .min(clamp_ratio(sg, px.g))
        .min(clamp_ratio(sb, px.b))
        .min(clamp_ratio(sa, px.a));

    if dither_error > max_dither_error {
        // insane errors are not propagated in full, that would make single
        // pixels pop out of flat areas
        ratio *= 0.8;
    }
    ratio = ratio.clamp(0., 1.);

    f_pixel(crate::pal::ARGBF {
        r: px.r + sr * ratio,
        g: px.g + sg * ratio,
        b: px.b + sb * ratio,
        a: px.a + sa * ratio,
    })
}

fn distance_from_closest_other_color(palette: &[f_pixel], i: usize) -> f32 {
    let mut second_best = f32::INFINITY;
    for (j, other) in palette.iter().enumerate() {
        if i == j {
            continue;
        }
        second_best = second_best.min(palette[i].diff(other));
    }
    second_best
}

/// Floyd–Steinberg error diffusion in zig-zag order, steered by the
/// edge/noise map: dithering edges draws jagged lines and noisy areas are
/// dithered by their own content already, so both receive less.
///
/// With `output_image_is_remapped`, pixels whose dithered color is still
/// within tolerance of the palette entry they already map to keep that
/// entry, which holds large flat areas perfectly flat.
pub(crate) fn remap_to_palette_floyd(
    image: &Image<'_>,
    output: &mut [u8],
    palette: &PalF,
    quant: &QuantizationResult,
    max_dither_error: f32,
    output_image_is_remapped: bool,
) -> Result<(), Error> {
    let width = image.width();
    let pixels = image.pixels();
    let colors = palette.as_slice();

    let n = Nearest::new(palette, quant.min_opaque_val);
    let transparent_index = n.search(&f_pixel::default(), 0).0;

    let dither_map: &[f32] = if quant.use_dither_map {
        image
            .dither_map
            .as_deref()
            .or(image.edges.as_deref())
            .unwrap_or(&[])
    } else {
        &[]
    };

    let mut difference_tolerance = vec![0f32; colors.len()];
    if output_image_is_remapped {
        for (i, tolerance) in difference_tolerance.iter_mut().enumerate() {
            *tolerance = distance_from_closest_other_color(colors, i) / 4.; // half of the squared distance
        }
    }

    // the response to the level is non-linear; without the remapping any
    // setting below 0.8 would produce almost no dithering at all
    let base_dithering_level =
        (1. - (1. - quant.dither_level) * (1. - quant.dither_level)) * (15. / 16.);

    let errwidth = width + 2; // the padding saves bounds checks at both row ends
    let mut thiserr_data = vec![f_pixel::default(); errwidth * 2];
    let (mut thiserr, mut nexterr) = thiserr_data.split_at_mut(errwidth);

    // deterministic dithering beats zero-initialized rows, which would
    // leave the first row entirely undithered
    let mut rng = StdRng::seed_from_u64(12345);
    for err in thiserr.iter_mut() {
        err.0.r = (rng.gen::<f32>() - 0.5) / 255.;
        err.0.g = (rng.gen::<f32>() - 0.5) / 255.;
        err.0.b = (rng.gen::<f32>() - 0.5) / 255.;
        err.0.a = (rng.gen::<f32>() - 0.5) / 255.;
    }

    let lut = gamma_lut(image.gamma);
    let mut scan_forward = true;

    for (row, out_row) in output.chunks_exact_mut(width).enumerate() {
        nexterr.fill(f_pixel::default());
        let row_pixels = &pixels[row * width..][..width];
        let dither_map_row = dither_map.get(row * width..row * width + width);

        let mut col = if scan_forward { 0 } else { width - 1 };
        let mut last_match = 0 as PalIndex;

        loop {
            let mut dither_level = base_dithering_level;
            if let Some(map) = dither_map_row {
                dither_level *= map[col];
            }

            let px = f_pixel::from_rgba(&lut, row_pixels[col]);
            let spx = get_dithered_pixel(dither_level, max_dither_error, thiserr[col + 1], px);

            let matched = if spx.a < MAX_TRANSP_A {
                transparent_index
            } else {
                let guessed_match = if output_image_is_remapped { out_row[col] } else { last_match };
                if output_image_is_remapped
                    && colors[guessed_match as usize].diff(&spx) < difference_tolerance[guessed_match as usize]
                {
                    guessed_match
                } else {
                    n.search(&spx, guessed_match).0
                }
            };
            last_match = matched;
            out_row[col] = matched;

            let output_px = colors[matched as usize];
            let mut err = spx.0 - output_px.0;
            // wild errors don't propagate in full either, same reason as in the injection
            if err.r * err.r + err.g * err.g + err.b * err.b + err.a * err.a > max_dither_error {
                dither_level *= 0.75;
            }

            let colorimp = (3. + output_px.a) / 4. * dither_level;
            err.r *= colorimp;
            err.g *= colorimp;
            err.b *= colorimp;
            err.a *= dither_level;

            if scan_forward {
                thiserr[col + 2].0 += err * (7. / 16.);
                nexterr[col].0 += err * (3. / 16.);
                nexterr[col + 1].0 += err * (5. / 16.);
                nexterr[col + 2].0 += err * (1. / 16.);
            } else {
                thiserr[col].0 += err * (7. / 16.);
                nexterr[col + 2].0 += err * (3. / 16.);
                nexterr[col + 1].0 += err * (5. / 16.);
                nexterr[col].0 += err * (1. / 16.);
            }

            if scan_forward {
                col += 1;
                if col >= width {
                    break;
                }
            } else {
                if col == 0 {
                    break;
                }
                col -= 1;
            }
        }

        std::mem::swap(&mut thiserr, &mut nexterr);
        scan_forward = !scan_forward;
    }

    Ok(())
}

pub(crate) fn mse_to_standard_mse(mse: f64) -> f64 {
    mse * 65536. / 6.
}
