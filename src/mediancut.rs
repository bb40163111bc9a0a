use crate::hist::{HistItem, HistogramInternal};
use crate::pal::{f_pixel, PalF, PalIndex, PalLen, PalPop, ARGBF};

/// Axis-aligned box over a contiguous range of (reordered) histogram items.
struct MBox {
    begin: usize,
    end: usize,
    /// Weighted mean of the range.
    color: f_pixel,
    /// Per-channel weighted variance of the range.
    variance: ARGBF,
    /// Sum of adjusted weights.
    sum: f64,
    /// Worst single-color squared distance to the mean.
    max_error: f64,
    /// Weighted total error of the range; recomputed lazily.
    total_error: Option<f64>,
}

impl MBox {
    fn new(items: &[HistItem], begin: usize, end: usize, min_opaque_val: f32) -> Self {
        let range = &items[begin..end];
        let (color, sum) = weighed_average_color(range, min_opaque_val);
        let variance = box_variance(range, &color, sum);
        let max_error = range
            .iter()
            .map(|i| f64::from(i.color.diff(&color)))
            .fold(0., f64::max);
        Self { begin, end, color, variance, sum, max_error, total_error: None }
    }

    #[inline]
    fn colors(&self) -> usize {
        self.end - self.begin
    }
}

/// Heckbert median-cut over the weighted histogram.
///
/// Boxes are split at the weighted median of their highest-variance
/// channel until `max_colors` is reached or the total error of all boxes
/// drops under the target. `max_mse_per_color` forces splitting of boxes
/// whose worst color is badly represented even when their overall
/// priority is low, so single odd pixels still get an entry.
pub(crate) fn mediancut(
    hist: &mut HistogramInternal,
    min_opaque_val: f32,
    max_colors: PalLen,
    target_mse: f64,
    max_mse_per_color: f64,
) -> PalF {
    let items = &mut hist.items[..];
    let mut boxes: Vec<MBox> = Vec::with_capacity(max_colors as usize);
    boxes.push(MBox::new(items, 0, items.len(), min_opaque_val));

    while boxes.len() < max_colors as usize {
        let Some(bi) = best_splittable_box(&boxes, max_mse_per_color) else {
            break;
        };

        let (begin, end) = (boxes[bi].begin, boxes[bi].end);
        let range = &mut items[begin..end];
        sort_by_principal_channel(range, &boxes[bi].variance);
        let break_at = weighted_median_split(range);

        boxes[bi] = MBox::new(items, begin, begin + break_at, min_opaque_val);
        boxes.push(MBox::new(items, begin + break_at, end, min_opaque_val));

        if target_mse > 0. && total_box_error_below_target(target_mse, &mut boxes, items, hist.total_perceptual_weight) {
            break;
        }
    }

    colormap_from_boxes(&boxes, items)
}

/// Picks the box with the largest (weight sum × max channel variance),
/// breaking ties toward the heavier box.
fn best_splittable_box(boxes: &[MBox], max_mse_per_color: f64) -> Option<usize> {
    let mut best = None;
    let mut best_priority = (0., 0.);
    for (i, b) in boxes.iter().enumerate() {
        if b.colors() < 2 {
            continue;
        }
        // only the maximum matters, since that channel is the one that will split
        let cv = b.variance.r.max(b.variance.g).max(b.variance.b).max(b.variance.a);
        let mut priority = b.sum * f64::from(cv);
        if b.max_error > max_mse_per_color {
            priority = priority * b.max_error / max_mse_per_color;
        }
        if (priority, b.sum) > best_priority {
            best_priority = (priority, b.sum);
            best = Some(i);
        }
    }
    best
}

/// Orders the box's items along the channel with the largest variance.
/// The secondary key blends the two least-varying channels so reruns with
/// different histogram weights do not shuffle equal primary values.
fn sort_by_principal_channel(range: &mut [HistItem], variance: &ARGBF) {
    let mut channels: [(f32, fn(&f_pixel) -> f32); 4] = [
        (variance.r, |px| px.r),
        (variance.g, |px| px.g),
        (variance.b, |px| px.b),
        (variance.a, |px| px.a),
    ];
    channels.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));
    let (primary, low1, low2) = (channels[0].1, channels[2].1, channels[3].1);

    range.sort_unstable_by_key(|item| {
        let c = &item.color;
        ((primary(c) * 65535.) as u32) << 16 | ((low1(c) + low2(c)) / 2. * 65535.) as u32
    });
}

/// Index splitting the sorted range at half of its total weight,
/// clamped so neither side is empty.
fn weighted_median_split(range: &[HistItem]) -> usize {
    let half_weight: f64 = range.iter().map(|i| f64::from(i.adjusted_weight)).sum::<f64>() / 2.;
    let mut accum = 0.;
    for (i, item) in range.iter().enumerate() {
        accum += f64::from(item.adjusted_weight);
        if accum >= half_weight {
            return i.max(1).min(range.len() - 1);
        }
    }
    range.len() - 1
}

fn total_box_error_below_target(
    target_mse: f64,
    boxes: &mut [MBox],
    items: &[HistItem],
    total_weight: f64,
) -> bool {
    let target = target_mse * total_weight;
    let mut total = 0.;
    for b in boxes.iter() {
        if let Some(e) = b.total_error {
            total += e;
        }
        if total > target {
            return false;
        }
    }
    for b in boxes.iter_mut() {
        if b.total_error.is_none() {
            let e = items[b.begin..b.end]
                .iter()
                .map(|i| f64::from(i.color.diff(&b.color)) * f64::from(i.perceptual_weight))
                .sum();
            b.total_error = Some(e);
            total += e;
        }
        if total > target {
            return false;
        }
    }
    true
}

fn colormap_from_boxes(boxes: &[MBox], items: &mut [HistItem]) -> PalF {
    let mut palette = PalF::new();
    for (bi, b) in boxes.iter().enumerate() {
        palette.push(b.color, PalPop::new(b.sum as f32));
        for item in &mut items[b.begin..b.end] {
            item.likely_colormap_index = bi as PalIndex;
        }
    }
    palette
}

/// Weighted mean in premultiplied space, so mixed opacities blend
/// correctly. Alpha rounds up to fully opaque when the average is above
/// the opacity threshold and the box holds at least one opaque color.
fn weighed_average_color(range: &[HistItem], min_opaque_val: f32) -> (f_pixel, f64) {
    let mut sum = 0.;
    let mut r = 0.;
    let mut g = 0.;
    let mut b = 0.;
    let mut a = 0.;
    let mut max_a = 0f32;
    for item in range {
        let w = f64::from(item.adjusted_weight);
        let px = &item.color;
        r += f64::from(px.r) * w;
        g += f64::from(px.g) * w;
        b += f64::from(px.b) * w;
        a += f64::from(px.a) * w;
        max_a = max_a.max(px.a);
        sum += w;
    }
    let div = if sum > 0. { sum } else { 1. };
    let mut avg_a = (a / div) as f32;
    if avg_a >= min_opaque_val && max_a >= 255. / 256. {
        avg_a = 1.;
    }
    (
        f_pixel(ARGBF {
            r: (r / div) as f32,
            g: (g / div) as f32,
            b: (b / div) as f32,
            a: avg_a,
        }),
        sum,
    )
}

fn box_variance(range: &[HistItem], mean: &f_pixel, sum: f64) -> ARGBF {
    let mut vr = 0.;
    let mut vg = 0.;
    let mut vb = 0.;
    let mut va = 0.;
    for item in range {
        let w = f64::from(item.adjusted_weight);
        let px = &item.color;
        vr += f64::from((px.r - mean.r) * (px.r - mean.r)) * w;
        vg += f64::from((px.g - mean.g) * (px.g - mean.g)) * w;
        vb += f64::from((px.b - mean.b) * (px.b - mean.b)) * w;
        va += f64::from((px.a - mean.a) * (px.a - mean.a)) * w;
    }
    let div = if sum > 0. { sum } else { 1. };
    ARGBF {
        r: (vr / div) as f32,
        g: (vg / div) as f32,
        b: (vb / div) as f32,
        a: (va / div) as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hist::HistItem;
    use crate::pal::{gamma_lut, INTERNAL_GAMMA, RGBA};

    fn items_of(colors: &[(RGBA, f32)]) -> HistogramInternal {
        let lut = gamma_lut(INTERNAL_GAMMA);
        let mut total = 0.;
        let items: Vec<HistItem> = colors
            .iter()
            .map(|&(c, w)| {
                total += f64::from(w);
                HistItem {
                    color: f_pixel::from_rgba(&lut, c),
                    perceptual_weight: w,
                    adjusted_weight: w,
                    likely_colormap_index: 0,
                }
            })
            .collect();
        HistogramInternal {
            items: items.into_boxed_slice(),
            total_perceptual_weight: total,
        }
    }

    #[test]
    fn splits_two_clusters_apart() {
        let mut hist = items_of(&[
            (RGBA::new(10, 10, 10, 255), 4.),
            (RGBA::new(14, 12, 10, 255), 4.),
            (RGBA::new(250, 240, 230, 255), 4.),
            (RGBA::new(240, 240, 240, 255), 4.),
        ]);
        let pal = mediancut(&mut hist, 1., 2, 0., 1e20);
        assert_eq!(pal.len(), 2);
        let mut lums: Vec<f32> = pal.as_slice().iter().map(|c| c.r + c.g + c.b).collect();
        lums.sort_by(f32::total_cmp);
        assert!(lums[0] < 0.2, "dark cluster mean expected, got {}", lums[0]);
        assert!(lums[1] > 2.2, "bright cluster mean expected, got {}", lums[1]);
    }

    #[test]
    fn stops_at_max_colors() {
        let colors: Vec<(RGBA, f32)> = (0..64).map(|i| (RGBA::new(i * 4, 0, 0, 255), 1.)).collect();
        let mut hist = items_of(&colors);
        let pal = mediancut(&mut hist, 1., 16, 0., 1e20);
        assert_eq!(pal.len(), 16);
    }

    #[test]
    fn target_mse_stops_early() {
        let colors: Vec<(RGBA, f32)> = (0..64).map(|i| (RGBA::new(i * 4, 0, 0, 255), 1.)).collect();
        let mut hist = items_of(&colors);
        // generous target: a handful of boxes is already good enough
        let pal = mediancut(&mut hist, 1., 64, 0.01, 1e20);
        assert!(pal.len() < 64, "expected early stop, got {}", pal.len());
    }

    #[test]
    fn likely_index_points_to_own_box() {
        let mut hist = items_of(&[
            (RGBA::new(0, 0, 0, 255), 1.),
            (RGBA::new(255, 255, 255, 255), 1.),
        ]);
        let pal = mediancut(&mut hist, 1., 2, 0., 1e20);
        for item in hist.items.iter() {
            let own = pal.as_slice()[item.likely_colormap_index as usize];
            let other = pal.as_slice()[1 - item.likely_colormap_index as usize];
            assert!(item.color.diff(&own) <= item.color.diff(&other));
        }
    }

    #[test]
    fn opaque_boxes_round_alpha_up() {
        let mut hist = items_of(&[
            (RGBA::new(100, 0, 0, 255), 1.),
            (RGBA::new(120, 0, 0, 250), 1.),
        ]);
        let pal = mediancut(&mut hist, 0.98, 1, 0., 1e20);
        assert_eq!(pal.as_slice()[0].a, 1.);
    }
}
