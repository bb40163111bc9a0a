use crate::pal::{f_pixel, PalF, PalIndex};
use arrayvec::ArrayVec;

const LEAF_CAP: usize = 4;
const NO_NODE: u16 = u16::MAX;

/// Space partition over the palette for nearest-entry queries.
///
/// Each node keeps one entry as its center and the greatest distance from
/// that center to anything stored below it; search walks the closer half
/// first and prunes the other by the triangle inequality (distances are
/// compared as square roots, which makes the metric a real one).
///
/// Queries are gated by opacity: a pixel on one side of `min_opaque_val`
/// never matches an entry on the other side, so opaque pixels cannot turn
/// transparent. When the gate leaves no candidate at all, the search is
/// repeated without it.
pub(crate) struct Nearest<'pal> {
    palette: &'pal [f_pixel],
    min_opaque_val: f32,
    nodes: Vec<Node>,
    root: u16,
}

struct Node {
    center: f_pixel,
    center_idx: PalIndex,
    radius: f32,
    near: u16,
    far: u16,
    leaf: ArrayVec<PalIndex, LEAF_CAP>,
}

struct Best {
    index: PalIndex,
    distance_sq: f32,
    found: bool,
}

impl<'pal> Nearest<'pal> {
    pub fn new(palette: &'pal PalF, min_opaque_val: f32) -> Self {
        let colors = palette.as_slice();
        debug_assert!(!colors.is_empty());
        let mut n = Self {
            palette: colors,
            min_opaque_val,
            nodes: Vec::with_capacity(colors.len()),
            root: NO_NODE,
        };
        let mut members: Vec<PalIndex> = (0..colors.len() as u16).map(|i| i as PalIndex).collect();
        n.root = n.build(&mut members);
        n
    }

    /// Index of the entry closest to `px` and the squared distance to it.
    /// `likely` seeds the search; passing the previous match of a similar
    /// pixel prunes most of the tree straight away.
    pub fn search(&self, px: &f_pixel, likely: PalIndex) -> (PalIndex, f32) {
        let want_transparent = px.a < self.min_opaque_val;
        let mut best = Best {
            index: 0,
            distance_sq: f32::INFINITY,
            found: false,
        };
        if (likely as usize) < self.palette.len() && self.eligible(likely, want_transparent) {
            best.index = likely;
            best.distance_sq = px.diff(&self.palette[likely as usize]);
            best.found = true;
        }
        self.search_node(self.root, px, Some(want_transparent), &mut best);

        if !best.found {
            // palette has no entry on this side of the opacity gate
            best.distance_sq = f32::INFINITY;
            self.search_node(self.root, px, None, &mut best);
        }
        (best.index, best.distance_sq)
    }

    #[inline]
    fn eligible(&self, idx: PalIndex, want_transparent: bool) -> bool {
        (self.palette[idx as usize].a < self.min_opaque_val) == want_transparent
    }

    fn consider(&self, idx: PalIndex, px: &f_pixel, gate: Option<bool>, best: &mut Best) -> f32 {
        let dist_sq = px.diff(&self.palette[idx as usize]);
        if gate.map_or(true, |want| self.eligible(idx, want)) && dist_sq < best.distance_sq {
            best.index = idx;
            best.distance_sq = dist_sq;
            best.found = true;
        }
        dist_sq
    }

    fn search_node(&self, id: u16, px: &f_pixel, gate: Option<bool>, best: &mut Best) {
        let node = &self.nodes[id as usize];
        let center_dist_sq = self.consider(node.center_idx, px, gate, best);
        for &idx in &node.leaf {
            self.consider(idx, px, gate, best);
        }

        if node.near == NO_NODE && node.far == NO_NODE {
            return;
        }

        // lower bound for anything below this node
        if center_dist_sq.sqrt() - node.radius > best.distance_sq.sqrt() {
            return;
        }

        let mut children = [node.near, node.far];
        if children.iter().all(|&c| c != NO_NODE) {
            let dn = px.diff(&self.nodes[node.near as usize].center);
            let df = px.diff(&self.nodes[node.far as usize].center);
            if df < dn {
                children.swap(0, 1);
            }
        }
        for child in children {
            if child == NO_NODE {
                continue;
            }
            let c = &self.nodes[child as usize];
            if px.diff(&c.center).sqrt() - c.radius <= best.distance_sq.sqrt() {
                self.search_node(child, px, gate, best);
            }
        }
    }

    /// Consumes `members`, returns the node id. The center is the member
    /// farthest from the first one; splitting picks a partner farthest from
    /// the center and divides the rest by which of the two is closer.
    fn build(&mut self, members: &mut Vec<PalIndex>) -> u16 {
        debug_assert!(!members.is_empty());
        let first = self.palette[members[0] as usize];
        let center_pos = Self::farthest_from(self.palette, members, &first);
        let center_idx = members.swap_remove(center_pos);
        let center = self.palette[center_idx as usize];

        let radius = members
            .iter()
            .map(|&m| center.diff(&self.palette[m as usize]).sqrt())
            .fold(0f32, f32::max);

        let mut node = Node {
            center,
            center_idx,
            radius,
            near: NO_NODE,
            far: NO_NODE,
            leaf: ArrayVec::new(),
        };

        if members.len() <= LEAF_CAP {
            node.leaf = members.iter().copied().collect();
        } else {
            let partner_pos = Self::farthest_from(self.palette, members, &center);
            let partner = self.palette[members[partner_pos] as usize];
            let (mut near, mut far): (Vec<PalIndex>, Vec<PalIndex>) = members.iter().partition(|&&m| {
                let px = &self.palette[m as usize];
                px.diff(&center) <= px.diff(&partner)
            });
            // identical distances could starve one side; fall back to a leafless split
            if near.is_empty() {
                std::mem::swap(&mut near, &mut far);
            }
            node.near = self.build(&mut near);
            if !far.is_empty() {
                node.far = self.build(&mut far);
            }
        }

        let id = self.nodes.len() as u16;
        self.nodes.push(node);
        id
    }

    fn farthest_from(palette: &[f_pixel], members: &[PalIndex], from: &f_pixel) -> usize {
        let mut best = 0;
        let mut best_dist = -1f32;
        for (pos, &m) in members.iter().enumerate() {
            let d = from.diff(&palette[m as usize]);
            if d > best_dist {
                best_dist = d;
                best = pos;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pal::{gamma_lut, PalPop, INTERNAL_GAMMA, RGBA};

    fn palette_of(colors: &[RGBA]) -> PalF {
        let lut = gamma_lut(INTERNAL_GAMMA);
        let mut pal = PalF::new();
        for &c in colors {
            pal.push(f_pixel::from_rgba(&lut, c), PalPop::new(1.));
        }
        pal
    }

    /// Deterministic pseudo-random bytes for exercising the tree.
    fn xorshift_colors(n: usize) -> Vec<RGBA> {
        let mut state = 0x2545_F491u32;
        (0..n)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                let [r, g, b, a] = state.to_le_bytes();
                RGBA::new(r, g, b, a.saturating_add(64))
            })
            .collect()
    }

    #[test]
    fn matches_brute_force() {
        let colors = xorshift_colors(96);
        let pal = palette_of(&colors);
        let n = Nearest::new(&pal, 1.);
        let lut = gamma_lut(INTERNAL_GAMMA);
        let slice = pal.as_slice();

        for q in xorshift_colors(512).iter().skip(96) {
            let px = f_pixel::from_rgba(&lut, *q);
            let want_transparent = px.a < 1.;
            let brute = slice
                .iter()
                .enumerate()
                .filter(|(_, c)| (c.a < 1.) == want_transparent)
                .map(|(i, c)| (i, px.diff(c)))
                .min_by(|a, b| a.1.total_cmp(&b.1));
            let (idx, diff) = n.search(&px, 0);
            if let Some((_, brute_diff)) = brute {
                assert!(diff <= brute_diff + 1e-6, "{diff} vs {brute_diff}");
            }
            assert!((px.diff(&slice[idx as usize]) - diff).abs() < 1e-6);
        }
    }

    #[test]
    fn exact_member_query_returns_itself() {
        let colors = xorshift_colors(64);
        let pal = palette_of(&colors);
        let n = Nearest::new(&pal, 1.);
        for (i, c) in pal.as_slice().iter().enumerate() {
            let (idx, diff) = n.search(c, 0);
            assert_eq!(diff, 0.);
            assert_eq!(pal.as_slice()[idx as usize], *c, "entry {i}");
        }
    }

    #[test]
    fn opacity_gate_keeps_sides_apart() {
        let pal = palette_of(&[
            RGBA::new(250, 250, 250, 255), // opaque near-white
            RGBA::new(0, 0, 0, 0),         // transparent
        ]);
        let n = Nearest::new(&pal, 1.);
        let lut = gamma_lut(INTERNAL_GAMMA);
        // almost transparent white is much closer (in raw distance) to the
        // opaque entry, but the gate must route it to the transparent one
        let ghost = f_pixel::from_rgba(&lut, RGBA::new(255, 255, 255, 2));
        let (idx, _) = n.search(&ghost, 0);
        assert_eq!(pal.as_slice()[idx as usize].a, 0.);
        // fully opaque stays opaque
        let solid = f_pixel::from_rgba(&lut, RGBA::new(1, 1, 1, 255));
        let (idx, _) = n.search(&solid, 1);
        assert!(pal.as_slice()[idx as usize].a >= 1.);
    }

    #[test]
    fn gate_falls_back_when_one_sided() {
        // all-opaque palette must still answer transparent queries
        let pal = palette_of(&[RGBA::new(10, 10, 10, 255), RGBA::new(200, 200, 200, 255)]);
        let n = Nearest::new(&pal, 1.);
        let (idx, _) = n.search(&f_pixel::default(), 0);
        assert_eq!(idx, 0);
    }
}
