//! End-to-end pipeline scenarios.

use palquant::{Attributes, Error, Image, RGBA};

fn quantize(
    attr: &Attributes,
    pixels: &[RGBA],
    width: usize,
    height: usize,
    dither: f32,
) -> (Vec<RGBA>, Vec<u8>) {
    let mut image = Image::new(attr, pixels, width, height, 0.).unwrap();
    let mut result = attr.quantize(&mut image).unwrap();
    result.set_dithering_level(dither).unwrap();
    result.remapped(&mut image).unwrap()
}

/// Deterministic noise generator for test images.
fn xorshift_pixels(n: usize, mut state: u32) -> Vec<RGBA> {
    (0..n)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let [r, g, b, a] = state.to_le_bytes();
            RGBA::new(r, g, b, a)
        })
        .collect()
}

#[test]
fn solid_color_produces_single_exact_entry() {
    let color = RGBA::new(128, 64, 32, 255);
    let pixels = vec![color; 16 * 16];
    let attr = Attributes::new();

    let mut image = Image::new(&attr, &pixels, 16, 16, 0.).unwrap();
    let mut result = attr.quantize(&mut image).unwrap();
    let (palette, indices) = result.remapped(&mut image).unwrap();

    assert_eq!(palette, vec![color]);
    assert!(indices.iter().all(|&i| i == 0));
    assert_eq!(result.quantization_error(), Some(0.));
    assert_eq!(result.remapping_error(), Some(0.));
}

#[test]
fn two_color_checkerboard_is_reproduced_exactly() {
    let black = RGBA::new(0, 0, 0, 255);
    let white = RGBA::new(255, 255, 255, 255);
    let pixels: Vec<RGBA> = (0..16).map(|i| if (i / 4 + i % 4) % 2 == 0 { black } else { white }).collect();

    for dither in [0.0f32, 1.0] {
        let mut attr = Attributes::new();
        attr.set_max_colors(2).unwrap();
        let mut image = Image::new(&attr, &pixels, 4, 4, 0.).unwrap();
        let mut result = attr.quantize(&mut image).unwrap();
        result.set_dithering_level(dither).unwrap();
        let (palette, indices) = result.remapped(&mut image).unwrap();

        assert_eq!(palette.len(), 2);
        let decoded: Vec<RGBA> = indices.iter().map(|&i| palette[i as usize]).collect();
        assert_eq!(decoded, pixels, "dither={dither}");
        assert_eq!(result.quantization_error(), Some(0.));
    }
}

#[test]
fn gradient_without_dither_is_monotone_and_accurate() {
    let pixels: Vec<RGBA> = (0..=255u8).map(|v| RGBA::new(v, v, v, 255)).collect();
    let mut attr = Attributes::new();
    attr.set_max_colors(16).unwrap();

    let mut image = Image::new(&attr, &pixels, 256, 1, 0.).unwrap();
    let mut result = attr.quantize(&mut image).unwrap();
    let (palette, indices) = result.remapped(&mut image).unwrap();

    assert_eq!(palette.len(), 16);
    // raw indices follow popularity order, the gray levels must follow the ramp
    let grays: Vec<u8> = indices.iter().map(|&i| palette[i as usize].r).collect();
    assert!(grays.windows(2).all(|w| w[0] <= w[1]), "ramp must stay monotone");
    let mse = result.remapping_error().unwrap();
    assert!(mse <= 21.3, "16-entry ramp must beat uniform quantization, got {mse}");
}

#[test]
fn gradient_with_dither_breaks_monotonicity() {
    let pixels: Vec<RGBA> = (0..=255u8).map(|v| RGBA::new(v, v, v, 255)).collect();
    let mut attr = Attributes::new();
    attr.set_max_colors(16).unwrap();

    let (palette, indices) = quantize(&attr, &pixels, 256, 1, 1.0);

    assert_eq!(palette.len(), 16);
    let grays: Vec<u8> = indices.iter().map(|&i| palette[i as usize].r).collect();
    assert!(
        grays.windows(2).any(|w| w[0] > w[1]),
        "dithering must alternate between neighboring entries"
    );
}

#[test]
fn fully_transparent_image_collapses_to_one_entry() {
    let pixels = vec![RGBA::new(0, 0, 0, 0); 8 * 8];
    let attr = Attributes::new();
    let (palette, indices) = quantize(&attr, &pixels, 8, 8, 0.);

    assert_eq!(palette.len(), 1);
    assert_eq!(palette[0].a, 0);
    assert!(indices.iter().all(|&i| i == 0));
}

#[test]
fn transparent_pixels_always_get_a_transparent_entry() {
    // opaque noise with a transparent hole in the middle
    let mut pixels = xorshift_pixels(32 * 32, 0xBEEF);
    for px in pixels.iter_mut() {
        px.a = 255;
    }
    for row in 12..20 {
        for col in 12..20 {
            pixels[row * 32 + col] = RGBA::new(0, 0, 0, 0);
        }
    }
    let mut attr = Attributes::new();
    attr.set_max_colors(16).unwrap();
    let (palette, indices) = quantize(&attr, &pixels, 32, 32, 0.);

    for (px, &idx) in pixels.iter().zip(&indices) {
        if px.a == 0 {
            assert!(palette[idx as usize].a < 1, "alpha 0 must stay transparent");
        }
    }
}

#[test]
fn quality_floor_rejects_hopeless_images() {
    let pixels = xorshift_pixels(64 * 64, 0x1234_5678);
    let mut attr = Attributes::new();
    attr.set_max_colors(4).unwrap();
    attr.set_quality(95, 90).unwrap();

    let mut image = Image::new(&attr, &pixels, 64, 64, 0.).unwrap();
    assert_eq!(attr.quantize(&mut image).err(), Some(Error::QualityTooLow));
}

#[test]
fn last_index_transparent_puts_the_hole_last() {
    let a = RGBA::new(200, 0, 0, 255);
    let b = RGBA::new(0, 200, 0, 255);
    let c = RGBA::new(0, 0, 200, 255);
    let hole = RGBA::new(0, 0, 0, 0);
    let mut pixels = Vec::with_capacity(16 * 16);
    for _row in 0..16 {
        for col in 0..16 {
            pixels.push(match col {
                0..=7 => a,
                8..=11 => b,
                12..=14 => c,
                _ => hole,
            });
        }
    }
    let mut attr = Attributes::new();
    attr.set_max_colors(4).unwrap();
    attr.set_last_index_transparent(true);
    let (palette, indices) = quantize(&attr, &pixels, 16, 16, 0.);

    assert_eq!(palette.len(), 4);
    assert_eq!(palette[3].a, 0, "transparent entry must sit at the last index");
    assert!(palette[..3].iter().all(|p| p.a == 255));
    // the widest stripe is by far the most popular, and popularity ascends
    assert_eq!(palette[2], a);
    assert!(palette[..2].contains(&b) && palette[..2].contains(&c));
    for (px, &idx) in pixels.iter().zip(&indices) {
        assert_eq!(palette[idx as usize], *px);
    }
}

#[test]
fn palette_sort_moves_transparency_first() {
    // transparent + translucent + opaque colors, no flag: tRNS segment first
    let mut pixels = Vec::new();
    for i in 0..64u32 {
        let px = match i % 4 {
            0 => RGBA::new(255, 0, 0, 255),
            1 => RGBA::new(0, 255, 0, 255),
            2 => RGBA::new(0, 0, 255, 128),
            _ => RGBA::new(0, 0, 0, 0),
        };
        pixels.push(px);
    }
    let mut attr = Attributes::new();
    attr.set_max_colors(8).unwrap();
    let (palette, _) = quantize(&attr, &pixels, 8, 8, 0.);

    let first_opaque = palette.iter().position(|p| p.a == 255).unwrap_or(palette.len());
    assert!(
        palette[first_opaque..].iter().all(|p| p.a == 255),
        "all transparent entries must precede opaque ones: {palette:?}"
    );
    assert!(palette[..first_opaque].iter().all(|p| p.a < 255));
}

#[test]
fn indices_are_always_valid() {
    let pixels = xorshift_pixels(48 * 48, 0xACE1);
    let mut attr = Attributes::new();
    attr.set_max_colors(7).unwrap();
    let (palette, indices) = quantize(&attr, &pixels, 48, 48, 0.);

    assert!(!palette.is_empty() && palette.len() <= 7);
    assert!(indices.iter().all(|&i| (i as usize) < palette.len()));
}

#[test]
fn pipeline_is_deterministic() {
    // gradient plus structured noise, dithered: exercises maps, the
    // feedback loop, parallel remap and the serpentine pass
    let pixels: Vec<RGBA> = (0..64 * 64)
        .map(|i| {
            let x = (i % 64) as u8;
            let y = (i / 64) as u8;
            RGBA::new(x.wrapping_mul(4), y.wrapping_mul(4), x ^ y, 255)
        })
        .collect();

    let run = || {
        let mut attr = Attributes::new();
        attr.set_max_colors(64).unwrap();
        quantize(&attr, &pixels, 64, 64, 1.0)
    };
    let (pal_a, idx_a) = run();
    let (pal_b, idx_b) = run();
    assert_eq!(pal_a, pal_b);
    assert_eq!(idx_a, idx_b);
}

#[test]
fn remap_into_validates_buffer_size() {
    let pixels = vec![RGBA::new(10, 20, 30, 255); 8 * 8];
    let attr = Attributes::new();
    let mut image = Image::new(&attr, &pixels, 8, 8, 0.).unwrap();
    let mut result = attr.quantize(&mut image).unwrap();

    let mut too_small = vec![0u8; 63];
    assert_eq!(result.remap_into(&mut image, &mut too_small), Err(Error::BufferTooSmall));
    let mut ok = vec![0u8; 64];
    assert_eq!(result.remap_into(&mut image, &mut ok), Ok(()));
}

#[test]
fn result_remaps_multiple_images() {
    let base = vec![RGBA::new(40, 90, 160, 255); 16 * 16];
    let attr = Attributes::new();
    let mut image = Image::new(&attr, &base, 16, 16, 0.).unwrap();
    let mut result = attr.quantize(&mut image).unwrap();

    let (_, first) = result.remapped(&mut image).unwrap();
    let other_pixels = vec![RGBA::new(42, 88, 161, 255); 16 * 16];
    let mut other = Image::new(&attr, &other_pixels, 16, 16, 0.).unwrap();
    let (palette, second) = result.remapped(&mut other).unwrap();

    assert_eq!(first.len(), second.len());
    assert!(second.iter().all(|&i| (i as usize) < palette.len()));
}
