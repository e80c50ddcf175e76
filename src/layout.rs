use serde::{Deserialize, Serialize};

use crate::index_space::IndexSpace;




/**
 * A level's parallel decomposition: an ordered collection of patch boxes
 * together with the rank that owns each one. The domain is periodic, so
 * point queries accept raw indexes and wrap them into `0..dim_n` first.
 */
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Layout {
    boxes: Vec<IndexSpace>,
    owners: Vec<usize>,
}




// ============================================================================
impl Layout {


    pub fn new() -> Self {
        Self::default()
    }


    /**
     * Build a layout from a list of boxes, assigning owners round-robin over
     * the given number of ranks.
     */
    pub fn from_boxes(boxes: Vec<IndexSpace>, num_ranks: usize) -> Self {
        let owners = (0..boxes.len()).map(|n| n % num_ranks.max(1)).collect();
        Self { boxes, owners }
    }


    pub fn len(&self) -> usize {
        self.boxes.len()
    }


    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }


    pub fn boxes(&self) -> &[IndexSpace] {
        &self.boxes
    }


    pub fn box_at(&self, n: usize) -> &IndexSpace {
        &self.boxes[n]
    }


    pub fn owner(&self, n: usize) -> usize {
        self.owners[n]
    }


    pub fn push(&mut self, space: IndexSpace, owner: usize) {
        self.boxes.push(space);
        self.owners.push(owner);
    }


    /**
     * Return the total number of cells covered by this layout.
     */
    pub fn num_points(&self) -> u64 {
        self.boxes.iter().map(|b| b.len() as u64).sum()
    }


    /**
     * Determine whether any box contains the given index, after wrapping it
     * periodically into `0..dim_n` on each axis.
     */
    pub fn contains_wrapped(&self, index: (i64, i64, i64), dim_n: i64) -> bool {
        let p = wrap_point(index, dim_n);
        self.boxes.iter().any(|b| b.contains(p))
    }


    /**
     * Return the index of the box containing the given (wrapped) point, if
     * one exists.
     */
    pub fn find_containing(&self, index: (i64, i64, i64), dim_n: i64) -> Option<usize> {
        let p = wrap_point(index, dim_n);
        self.boxes.iter().position(|b| b.contains(p))
    }


    /**
     * Determine whether the given space, extended by a buffer and coarsened
     * by two, is fully covered by this layout's boxes (periodically). Used
     * to check proper nesting of a fine level inside its parent.
     */
    pub fn covers_coarsened(&self, space: &IndexSpace, buffer: i64, dim_n: i64) -> bool {
        space
            .extend_all(buffer)
            .coarsen(2)
            .iter()
            .all(|p| self.contains_wrapped(p, dim_n))
    }


    /**
     * Append every box of another layout, preserving its owner assignment.
     */
    pub fn join(&mut self, other: &Layout) {
        self.boxes.extend_from_slice(&other.boxes);
        self.owners.extend_from_slice(&other.owners);
    }


    /**
     * Reassign owners round-robin. Called after boxes have been added so no
     * rank ends up with a disproportionate share of new work.
     */
    pub fn rebalance(&mut self, num_ranks: usize) {
        for (n, owner) in self.owners.iter_mut().enumerate() {
            *owner = n % num_ranks.max(1);
        }
    }


    pub fn iter(&self) -> impl Iterator<Item = (&IndexSpace, usize)> {
        self.boxes.iter().zip(self.owners.iter().copied())
    }
}




/**
 * Wrap an index into the periodic domain `0..dim_n` on each axis.
 */
pub fn wrap_point(index: (i64, i64, i64), dim_n: i64) -> (i64, i64, i64) {
    (index.0.rem_euclid(dim_n),
     index.1.rem_euclid(dim_n),
     index.2.rem_euclid(dim_n))
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::Layout;
    use crate::index_space::range3d;

    #[test]
    fn point_queries_wrap_periodically() {
        let layout = Layout::from_boxes(vec![range3d(0..4, 0..4, 0..4)], 1);
        assert!(layout.contains_wrapped((0, 0, 0), 8));
        assert!(layout.contains_wrapped((8, 8, 8), 8));
        assert!(layout.contains_wrapped((-5, 2, 2), 8));
        assert!(!layout.contains_wrapped((5, 2, 2), 8));
    }

    #[test]
    fn nesting_check_requires_buffered_coverage() {
        // parent covers the lower octant of a 16^3 coarse level
        let parent = Layout::from_boxes(vec![range3d(0..8, 0..8, 0..8)], 1);

        // fine box well inside: nested even with a buffer
        assert!(parent.covers_coarsened(&range3d(4..8, 4..8, 4..8), 2, 16));

        // fine box flush against the parent edge: buffer pushes it out
        assert!(!parent.covers_coarsened(&range3d(12..16, 4..8, 4..8), 2, 16));
    }

    #[test]
    fn rebalance_spreads_owners() {
        let mut layout = Layout::from_boxes(
            vec![
                range3d(0..2, 0..2, 0..2),
                range3d(2..4, 0..2, 0..2),
                range3d(4..6, 0..2, 0..2),
            ],
            1,
        );
        layout.rebalance(2);
        assert_eq!(layout.owner(0), 0);
        assert_eq!(layout.owner(1), 1);
        assert_eq!(layout.owner(2), 0);
    }
}
