//! Pure builder for the comparison plan.
//!
//! The Cartesian product of catalog keys is tiled into blocks of at most
//! `edge x edge` pairs. Each block owns exactly one cache slot, identified
//! by its `cache_index` (the emission order), so restarting a run is just
//! "skip every block at or below the finished index".
//!
//! Coordinates are absolute catalog keys: after repopulation partition A
//! occupies `[0, na)` and partition B `[na, na + nb)`.

/// One tile of the comparison plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// First x key covered by this block.
    pub x_start: usize,
    /// First y key covered by this block.
    pub y_start: usize,
    pub x_len: usize,
    pub y_len: usize,
    /// Emission order; doubles as the cache slot id.
    pub cache_index: usize,
}

impl Block {
    /// Diagonal blocks share one thumbnail window between x and y.
    pub fn is_diagonal(&self) -> bool {
        self.x_start == self.y_start
    }

    /// Number of pairs this block contributes.
    ///
    /// On the diagonal only the strict upper triangle counts; off the
    /// diagonal (and on two-partition plans) the full rectangle does.
    pub fn pair_count(&self) -> usize {
        if self.is_diagonal() {
            self.x_len * self.x_len.saturating_sub(1) / 2
        } else {
            self.x_len * self.y_len
        }
    }
}

/// Plan for a single partition of `n` keys: tiles of the upper-triangular
/// half, emitted row-major over `(x_start, y_start)`.
pub fn build_blocks_single(n: usize, edge: usize) -> Vec<Block> {
    let edge = edge.max(1);
    let mut blocks = Vec::new();
    let mut cache_index = 0;
    let mut x_start = 0;
    while x_start < n {
        let x_len = edge.min(n - x_start);
        let mut y_start = x_start;
        while y_start < n {
            let y_len = edge.min(n - y_start);
            blocks.push(Block {
                x_start,
                y_start,
                x_len,
                y_len,
                cache_index,
            });
            cache_index += 1;
            y_start += edge;
        }
        x_start += edge;
    }
    blocks
}

/// Plan for two partitions: the full rectangle `[0, na) x [na, na + nb)`,
/// emitted row-major.
pub fn build_blocks_pair(na: usize, nb: usize, edge: usize) -> Vec<Block> {
    let edge = edge.max(1);
    let mut blocks = Vec::new();
    let mut cache_index = 0;
    let mut x_start = 0;
    while x_start < na {
        let x_len = edge.min(na - x_start);
        let mut y_start = na;
        while y_start < na + nb {
            let y_len = edge.min(na + nb - y_start);
            blocks.push(Block {
                x_start,
                y_start,
                x_len,
                y_len,
                cache_index,
            });
            cache_index += 1;
            y_start += edge;
        }
        x_start += edge;
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Expand a block into the concrete pairs a worker would visit.
    fn pairs_of(block: &Block, single_partition: bool) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for x in block.x_start..block.x_start + block.x_len {
            for y in block.y_start..block.y_start + block.y_len {
                if single_partition && y <= x {
                    continue;
                }
                out.push((x, y));
            }
        }
        out
    }

    #[test]
    fn single_partition_covers_each_unordered_pair_once() {
        for (n, edge) in [(1, 3), (5, 2), (10, 3), (10, 10), (7, 1)] {
            let blocks = build_blocks_single(n, edge);
            let mut seen = HashSet::new();
            for block in &blocks {
                for pair in pairs_of(block, true) {
                    assert!(seen.insert(pair), "pair {pair:?} covered twice (n={n}, edge={edge})");
                }
            }
            assert_eq!(seen.len(), n * (n - 1) / 2, "n={n}, edge={edge}");
        }
    }

    #[test]
    fn pair_partitions_cover_each_ordered_pair_once() {
        for (na, nb, edge) in [(3, 5, 2), (4, 4, 4), (1, 9, 3), (6, 1, 2)] {
            let blocks = build_blocks_pair(na, nb, edge);
            let mut seen = HashSet::new();
            for block in &blocks {
                for (x, y) in pairs_of(block, false) {
                    assert!(x < na, "x key {x} outside partition A");
                    assert!((na..na + nb).contains(&y), "y key {y} outside partition B");
                    assert!(seen.insert((x, y)));
                }
            }
            assert_eq!(seen.len(), na * nb, "na={na}, nb={nb}, edge={edge}");
        }
    }

    #[test]
    fn three_by_five_with_edge_two_emits_six_blocks() {
        let blocks = build_blocks_pair(3, 5, 2);
        assert_eq!(blocks.len(), 6);
        let indices: Vec<usize> = blocks.iter().map(|b| b.cache_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
        let total: usize = blocks.iter().map(Block::pair_count).sum();
        assert_eq!(total, 15);
    }

    #[test]
    fn cache_indices_follow_row_major_emission_order() {
        let blocks = build_blocks_single(10, 3);
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.cache_index, i);
        }
        for pair in blocks.windows(2) {
            let earlier = (pair[0].x_start, pair[0].y_start);
            let later = (pair[1].x_start, pair[1].y_start);
            assert!(earlier < later);
        }
    }

    #[test]
    fn diagonal_blocks_are_square_and_flagged() {
        let blocks = build_blocks_single(10, 4);
        for block in &blocks {
            if block.is_diagonal() {
                assert_eq!(block.x_len, block.y_len);
            }
        }
        assert!(blocks.iter().any(Block::is_diagonal));
        assert!(blocks.iter().any(|b| !b.is_diagonal()));
    }

    #[test]
    fn trailing_blocks_are_clipped_to_partition_bounds() {
        let blocks = build_blocks_single(5, 2);
        let last = blocks.last().unwrap();
        assert_eq!(last.x_start, 4);
        assert_eq!(last.x_len, 1);
        assert_eq!(last.y_len, 1);
    }

    #[test]
    fn empty_partitions_yield_empty_plans() {
        assert!(build_blocks_single(0, 4).is_empty());
        assert!(build_blocks_pair(0, 5, 4).is_empty());
        assert!(build_blocks_pair(5, 0, 4).is_empty());
    }

    #[test]
    fn zero_edge_is_treated_as_one() {
        let blocks = build_blocks_single(3, 0);
        assert_eq!(blocks.len(), 6);
        assert!(blocks.iter().all(|b| b.x_len == 1 && b.y_len == 1));
    }
}
