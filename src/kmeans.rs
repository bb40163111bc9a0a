use crate::hist::HistogramInternal;
use crate::nearest::Nearest;
use crate::pal::{f_pixel, PalF, PalIndex, ARGBF};
use rayon::prelude::*;

/// Per-entry running means for one Voronoi (K-means) update step.
///
/// Accumulators are per-shard and merged in shard order, so the result
/// does not depend on how rayon schedules the work.
pub(crate) struct Kmeans {
    averages: Vec<ColorAvg>,
    weighed_diff_sum: f64,
}

#[derive(Clone, Copy, Default)]
struct ColorAvg {
    r: f64,
    g: f64,
    b: f64,
    a: f64,
    total: f64,
}

/// Histogram entries per parallel shard; small enough to spread across
/// cores, large enough that per-shard accumulators stay cheap.
const SHARD: usize = 1024;

impl Kmeans {
    pub fn new(pal_len: usize) -> Self {
        Self {
            averages: vec![ColorAvg::default(); pal_len],
            weighed_diff_sum: 0.,
        }
    }

    #[inline]
    pub fn update_color(&mut self, px: f_pixel, value: f32, matched: PalIndex) {
        let avg = &mut self.averages[matched as usize];
        let w = f64::from(value);
        avg.r += f64::from(px.r) * w;
        avg.g += f64::from(px.g) * w;
        avg.b += f64::from(px.b) * w;
        avg.a += f64::from(px.a) * w;
        avg.total += w;
    }

    pub fn merge(mut self, other: Self) -> Self {
        for (a, b) in self.averages.iter_mut().zip(other.averages) {
            a.r += b.r;
            a.g += b.g;
            a.b += b.b;
            a.a += b.a;
            a.total += b.total;
        }
        self.weighed_diff_sum += other.weighed_diff_sum;
        self
    }

    /// Replaces every non-fixed entry that attracted any weight by the
    /// mean of its cell; popularity always becomes the attracted weight.
    pub fn finalize(self, palette: &mut PalF) {
        for (avg, (color, pop)) in self.averages.iter().zip(palette.iter_mut()) {
            if avg.total > 0. && !pop.is_fixed() {
                *color = f_pixel(ARGBF {
                    r: (avg.r / avg.total) as f32,
                    g: (avg.g / avg.total) as f32,
                    b: (avg.b / avg.total) as f32,
                    a: (avg.a / avg.total) as f32,
                });
            }
            *pop = crate::pal::PalPop::new(avg.total as f32);
        }
    }

    /// One assignment + averaging pass. Returns the weighted mean error of
    /// the assignment (before the averaging moved the entries).
    ///
    /// With `adjust_weights` set, entries matched badly gain adjusted
    /// weight, which steers the next median-cut trial toward them.
    pub fn iteration(
        hist: &mut HistogramInternal,
        palette: &mut PalF,
        min_opaque_val: f32,
        adjust_weights: bool,
    ) -> f64 {
        if hist.items.is_empty() {
            return 0.;
        }
        let n = Nearest::new(palette, min_opaque_val);
        let pal_len = palette.len();

        let merged = hist
            .items
            .par_chunks_mut(SHARD)
            .map(|shard| {
                let mut kmeans = Kmeans::new(pal_len);
                for item in shard {
                    let (matched, diff) = n.search(&item.color, item.likely_colormap_index);
                    item.likely_colormap_index = matched;
                    kmeans.weighed_diff_sum += f64::from(diff) * f64::from(item.perceptual_weight);
                    kmeans.update_color(item.color, item.perceptual_weight, matched);
                    if adjust_weights {
                        item.adjusted_weight =
                            (item.perceptual_weight + item.adjusted_weight) * (1. + diff).sqrt();
                    }
                }
                kmeans
            })
            .collect::<Vec<_>>()
            .into_iter()
            .reduce(Kmeans::merge);

        let Some(merged) = merged else { return 0. };
        let total_error = merged.weighed_diff_sum / hist.total_perceptual_weight.max(f64::MIN_POSITIVE);
        merged.finalize(palette);
        total_error
    }
}
