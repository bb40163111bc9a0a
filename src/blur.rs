//! Grayscale morphology and box blur for the importance maps.

/// One pass of a sliding box blur along rows, writing the result transposed.
/// The window holds `2*size` samples; rows are edge-clamped.
fn transposing_1d_blur(src: &[f32], dst: &mut [f32], width: usize, height: usize, size: usize) {
    debug_assert!(width > 0 && size > 0);
    let inv = 1. / (size * 2) as f32;
    for (j, row) in src.chunks_exact(width).enumerate() {
        let at = |i: isize| row[i.clamp(0, width as isize - 1) as usize];

        let mut sum = 0.;
        for i in -(size as isize)..size as isize {
            sum += at(i);
        }
        for i in 0..width {
            sum -= at(i as isize - size as isize);
            sum += at(i as isize + size as isize);
            dst[i * height + j] = sum * inv;
        }
    }
}

/// In-place box blur of radius `size`, both axes; `tmp` holds the
/// transposed intermediate.
pub(crate) fn blur(buf: &mut [f32], tmp: &mut [f32], width: usize, height: usize, size: usize) {
    transposing_1d_blur(buf, tmp, width, height, size);
    transposing_1d_blur(tmp, buf, height, width, size);
}

macro_rules! cross_morphology {
    ($name:ident, $pick:ident) => {
        pub(crate) fn $name(src: &[f32], dst: &mut [f32], width: usize, height: usize) {
            for j in 0..height {
                let row = &src[j * width..][..width];
                let prevrow = &src[j.saturating_sub(1) * width..][..width];
                let nextrow = &src[(j + 1).min(height - 1) * width..][..width];
                for i in 0..width {
                    let horiz = row[i.saturating_sub(1)].$pick(row[(i + 1).min(width - 1)]);
                    let vert = prevrow[i].$pick(nextrow[i]);
                    dst[j * width + i] = row[i].$pick(horiz).$pick(vert);
                }
            }
        }
    };
}

cross_morphology!(max3, max);
cross_morphology!(min3, min);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max3_spreads_single_peak() {
        let mut src = vec![0f32; 25];
        src[12] = 1.; // center of 5x5
        let mut dst = vec![0f32; 25];
        max3(&src, &mut dst, 5, 5);
        assert_eq!(dst[12], 1.);
        assert_eq!(dst[11], 1.);
        assert_eq!(dst[13], 1.);
        assert_eq!(dst[7], 1.);
        assert_eq!(dst[17], 1.);
        // diagonal neighbor is not in the cross
        assert_eq!(dst[6], 0.);
    }

    #[test]
    fn min3_erodes_single_hole() {
        let mut src = vec![1f32; 25];
        src[12] = 0.;
        let mut dst = vec![1f32; 25];
        min3(&src, &mut dst, 5, 5);
        assert_eq!(dst[12], 0.);
        assert_eq!(dst[11], 0.);
        assert_eq!(dst[7], 0.);
        assert_eq!(dst[6], 1.);
    }

    #[test]
    fn blur_preserves_constant_field() {
        let mut buf = vec![0.5f32; 8 * 8];
        let mut tmp = vec![0f32; 8 * 8];
        blur(&mut buf, &mut tmp, 8, 8, 3);
        for &v in &buf {
            assert!((v - 0.5).abs() < 1e-6);
        }
    }
}
