use core::ops::Range;
use serde::{Deserialize, Serialize};




/**
 * Identifier for a Cartesian axis
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    I,
    J,
    K,
}




/**
 * Represents a rectangular region in a discrete 3D index space. The index
 * type is signed 64-bit integer. Mesh patches, candidate refinement blocks
 * and ghost regions are all described by values of this type.
 */
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSpace {
    di: Range<i64>,
    dj: Range<i64>,
    dk: Range<i64>,
}




// ============================================================================
impl IndexSpace {


    pub fn new(di: Range<i64>, dj: Range<i64>, dk: Range<i64>) -> Self {

        assert!(
            di.start <= di.end && dj.start <= dj.end && dk.start <= dk.end,
            "index space has negative volume");

        Self { di, dj, dk }
    }


    /**
     * Return the cube `n.start..n.end` on every axis.
     */
    pub fn cube(n: Range<i64>) -> Self {
        Self::new(n.clone(), n.clone(), n)
    }


    /**
     * Return the number of indexes on each axis.
     */
    pub fn dim(&self) -> (usize, usize, usize) {
        ((self.di.end - self.di.start) as usize,
         (self.dj.end - self.dj.start) as usize,
         (self.dk.end - self.dk.start) as usize)
    }


    /**
     * Return the number of elements in this index space.
     */
    pub fn len(&self) -> usize {
        let (l, m, n) = self.dim();
        l * m * n
    }


    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }


    /**
     * Return the minimum index (inclusive).
     */
    pub fn start(&self) -> (i64, i64, i64) {
        (self.di.start, self.dj.start, self.dk.start)
    }


    /**
     * Return the maximum index (exclusive).
     */
    pub fn end(&self) -> (i64, i64, i64) {
        (self.di.end, self.dj.end, self.dk.end)
    }


    /**
     * Determine whether this index space contains the given index.
     */
    pub fn contains(&self, index: (i64, i64, i64)) -> bool {
        self.di.contains(&index.0) && self.dj.contains(&index.1) && self.dk.contains(&index.2)
    }


    /**
     * Determine whether another index space is a subset of this one.
     */
    pub fn contains_space(&self, other: &Self) -> bool {
        other.di.start >= self.di.start && other.di.end <= self.di.end &&
        other.dj.start >= self.dj.start && other.dj.end <= self.dj.end &&
        other.dk.start >= self.dk.start && other.dk.end <= self.dk.end
    }


    /**
     * Expand this index space by the given number of elements on each axis.
     */
    pub fn extend_all(&self, delta: i64) -> Self {
        Self::new(
            self.di.start - delta .. self.di.end + delta,
            self.dj.start - delta .. self.dj.end + delta,
            self.dk.start - delta .. self.dk.end + delta)
    }


    /**
     * Trim this index space by the given number of elements on each axis.
     */
    pub fn trim_all(&self, delta: i64) -> Self {
        self.extend_all(-delta)
    }


    /**
     * Increase the size of this index space by the given factor.
     */
    pub fn refine(&self, factor: i64) -> Self {
        Self::new(
            self.di.start * factor .. self.di.end * factor,
            self.dj.start * factor .. self.dj.end * factor,
            self.dk.start * factor .. self.dk.end * factor)
    }


    /**
     * Decrease the size of this index space by the given factor. The result
     * covers every coarse cell touched by this space, so coarsening is the
     * outer (conservative) inverse of `refine`.
     */
    pub fn coarsen(&self, factor: i64) -> Self {
        let down = |a: i64| a.div_euclid(factor);
        let up = |a: i64| -(-a).div_euclid(factor);
        Self::new(
            down(self.di.start) .. up(self.di.end),
            down(self.dj.start) .. up(self.dj.end),
            down(self.dk.start) .. up(self.dk.end))
    }


    /**
     * Return the intersection of this index space with another one, if it is
     * not empty.
     */
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let di = self.di.start.max(other.di.start) .. self.di.end.min(other.di.end);
        let dj = self.dj.start.max(other.dj.start) .. self.dj.end.min(other.dj.end);
        let dk = self.dk.start.max(other.dk.start) .. self.dk.end.min(other.dk.end);

        if di.start < di.end && dj.start < dj.end && dk.start < dk.end {
            Some(Self { di, dj, dk })
        } else {
            None
        }
    }


    /**
     * Determine whether this index space shares at least one index with
     * another one.
     */
    pub fn intersects(&self, other: &Self) -> bool {
        self.intersect(other).is_some()
    }


    /**
     * Return the squared distance from the given index to this index space;
     * zero if the index lies inside.
     */
    pub fn distance_squared(&self, index: (i64, i64, i64)) -> i64 {
        let axis = |x: i64, r: &Range<i64>| {
            if r.contains(&x) {
                0
            } else {
                (x - r.start).pow(2).min((x - (r.end - 1)).pow(2))
            }
        };
        axis(index.0, &self.di) + axis(index.1, &self.dj) + axis(index.2, &self.dk)
    }


    /**
     * Return the linear offset for the given index, in a row-major memory
     * buffer aligned with the start of this index space.
     */
    pub fn row_major_offset(&self, index: (i64, i64, i64)) -> usize {
        let i = (index.0 - self.di.start) as usize;
        let j = (index.1 - self.dj.start) as usize;
        let k = (index.2 - self.dk.start) as usize;
        let (_l, m, n) = self.dim();
        (i * m + j) * n + k
    }


    /**
     * Return an iterator which traverses the index space in row-major order
     * (C-like; the final index increases fastest).
     */
    pub fn iter(&self) -> impl Iterator<Item = (i64, i64, i64)> + '_ {
        self.di.clone().flat_map(move |i| {
            self.dj.clone().flat_map(move |j| {
                self.dk.clone().map(move |k| (i, j, k))
            })
        })
    }
}




// ============================================================================
impl From<(Range<i64>, Range<i64>, Range<i64>)> for IndexSpace {
    fn from(range: (Range<i64>, Range<i64>, Range<i64>)) -> Self {
        Self { di: range.0, dj: range.1, dk: range.2 }
    }
}

impl From<IndexSpace> for (Range<i64>, Range<i64>, Range<i64>) {
    fn from(space: IndexSpace) -> Self {
        (space.di, space.dj, space.dk)
    }
}




/**
 * Less imposing factory function to construct an IndexSpace object.
 */
pub fn range3d(di: Range<i64>, dj: Range<i64>, dk: Range<i64>) -> IndexSpace {
    IndexSpace::new(di, dj, dk)
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::range3d;

    #[test]
    fn index_space_has_correct_len_and_offsets() {
        let space = range3d(0..4, 0..6, 0..8);
        assert_eq!(space.len(), 4 * 6 * 8);
        assert_eq!(space.row_major_offset((0, 0, 0)), 0);
        assert_eq!(space.row_major_offset((0, 0, 7)), 7);
        assert_eq!(space.row_major_offset((1, 0, 0)), 48);
        assert_eq!(space.iter().count(), space.len());
    }

    #[test]
    fn coarsen_covers_partial_cells() {
        let space = range3d(1..5, 0..4, -3..4);
        let coarse = space.coarsen(2);
        assert_eq!(coarse, range3d(0..3, 0..2, -2..2));
        assert!(coarse.refine(2).contains_space(&space));
    }

    #[test]
    fn distance_squared_is_zero_inside() {
        let space = range3d(0..4, 0..4, 0..4);
        assert_eq!(space.distance_squared((2, 2, 2)), 0);
        assert_eq!(space.distance_squared((-2, 2, 2)), 4);
        assert_eq!(space.distance_squared((5, 5, 2)), 4 + 4);
    }

    #[test]
    fn intersection_is_symmetric() {
        let a = range3d(0..4, 0..4, 0..4);
        let b = range3d(2..6, 2..6, 2..6);
        assert_eq!(a.intersect(&b), b.intersect(&a));
        assert_eq!(a.intersect(&b).unwrap().len(), 8);
        assert!(a.intersect(&range3d(4..5, 0..4, 0..4)).is_none());
    }
}
