use core::ops::Range;
use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::index_space::{Axis, IndexSpace};
use crate::message::comm::Communicator;

/**
 * A distributed, duplicate-free set of refinement block indexes. Blocks are
 * stored per x-plane, with each plane holding a sorted map from y to the set
 * of z values present at that (x, y) column. Ranks accumulate blocks
 * independently (including blocks another rank also found), then `distribute`
 * reconciles the set so that every block is held exactly once, by the rank
 * that owns its plane.
 */
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UniqueLayout {
    planes: Vec<BTreeMap<u16, BTreeSet<u16>>>,
    rank: usize,
    num_ranks: usize,
}




// ============================================================================
impl UniqueLayout {
    /**
     * Create an empty layout over the given number of x-planes. The plane
     * count is fixed for the lifetime of the layout; it is the level size in
     * blocking-factor units along the x-axis.
     */
    pub fn new(num_planes: usize, rank: usize, num_ranks: usize) -> Self {
        assert!(rank < num_ranks);
        Self {
            planes: (0..num_planes).map(|_| BTreeMap::new()).collect(),
            rank,
            num_ranks,
        }
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    /**
     * The rank responsible for the given x-plane. Planes are dealt out in
     * contiguous slabs; if there are more ranks than planes, plane p belongs
     * to rank p and the surplus ranks own nothing.
     */
    pub fn owner_of(&self, plane: usize) -> usize {
        let npn = self.planes.len() / self.num_ranks;
        if npn == 0 {
            plane
        } else {
            (plane / npn).min(self.num_ranks - 1)
        }
    }

    /**
     * Insert a block index, returning whether it was newly added. Inserting
     * an index that is already present is a no-op.
     */
    pub fn add(&mut self, index: (usize, usize, usize)) -> bool {
        let (x, y, z) = index;
        self.planes[x]
            .entry(y as u16)
            .or_insert_with(BTreeSet::new)
            .insert(z as u16)
    }

    pub fn contains(&self, index: (usize, usize, usize)) -> bool {
        let (x, y, z) = index;
        self.planes[x]
            .get(&(y as u16))
            .map_or(false, |zs| zs.contains(&(z as u16)))
    }

    /**
     * Fold another layout into this one. Planes are disjoint containers, so
     * the merge runs plane-parallel; the operation is commutative, which is
     * what lets thread-local partial layouts be reduced in any order.
     */
    pub fn merge(&mut self, other: Self) {
        assert_eq!(self.planes.len(), other.planes.len());
        self.planes
            .par_iter_mut()
            .zip(other.planes)
            .for_each(|(mine, theirs)| {
                for (y, zs) in theirs {
                    mine.entry(y).or_insert_with(BTreeSet::new).extend(zs)
                }
            })
    }

    /// The number of blocks currently held on this rank.
    pub fn size(&self) -> usize {
        self.planes
            .iter()
            .map(|plane| plane.values().map(BTreeSet::len).sum::<usize>())
            .sum()
    }

    /// The number of blocks held across all ranks.
    pub fn size_all(&self, comm: &dyn Communicator) -> u64 {
        crate::message::comm::all_reduce_sum(comm, self.size() as u64)
    }

    pub fn clear(&mut self) {
        for plane in &mut self.planes {
            plane.clear()
        }
    }

    /// Visit every block held on this rank, in plane-major order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        self.planes.iter().enumerate().flat_map(|(x, plane)| {
            plane.iter().flat_map(move |(&y, zs)| {
                zs.iter().map(move |&z| (x, y as usize, z as usize))
            })
        })
    }

    /**
     * Reconcile the set across all ranks. The pairing matrix schedules one
     * pairwise exchange per round so that over the full schedule every pair
     * of ranks meets exactly once; in each round a rank sends the blocks it
     * holds in planes its peer owns, and merges what the peer sends back.
     * Afterwards this rank retains exactly the planes it owns, with every
     * rank's contributions folded in, and all other planes are dropped.
     */
    pub fn distribute(&mut self, comm: &dyn Communicator, matrix: &[Vec<usize>]) {
        if self.num_ranks == 1 {
            return;
        }
        for round in 1..matrix[self.rank].len() {
            let peer = matrix[self.rank][round];

            if peer >= self.num_ranks {
                continue;
            }
            let outgoing: Vec<(usize, &BTreeMap<u16, BTreeSet<u16>>)> = self
                .planes
                .iter()
                .enumerate()
                .filter(|(x, plane)| self.owner_of(*x) == peer && !plane.is_empty())
                .collect();

            let message = rmp_serde::encode::to_vec(&outgoing).unwrap();
            let reply = comm.exchange(peer, message);
            let incoming: Vec<(usize, BTreeMap<u16, BTreeSet<u16>>)> =
                rmp_serde::decode::from_slice(&reply).unwrap();

            for (x, plane) in incoming {
                for (y, zs) in plane {
                    self.planes[x]
                        .entry(y)
                        .or_insert_with(BTreeSet::new)
                        .extend(zs)
                }
            }
        }
        for x in 0..self.planes.len() {
            if self.owner_of(x) != self.rank {
                self.planes[x].clear()
            }
        }
    }

    /**
     * Collapse the blocks held on this rank into a minimal-ish list of
     * rectangular boxes in cell units. Runs of consecutive z values collapse
     * first, then boxes with identical extents merge along y and finally
     * along x. The result covers exactly this rank's blocks, each scaled up
     * by the blocking factor.
     */
    pub fn box_list(&self, blocking_factor: i64) -> Vec<IndexSpace> {
        let mut boxes = Vec::new();

        for (x, plane) in self.planes.iter().enumerate() {
            let x = x as i64;
            for (&y, zs) in plane {
                let y = y as i64;
                let mut run: Option<Range<i64>> = None;
                for &z in zs {
                    let z = z as i64;
                    run = match run {
                        Some(r) if z == r.end => Some(r.start..z + 1),
                        Some(r) => {
                            boxes.push(IndexSpace::new(x..x + 1, y..y + 1, r));
                            Some(z..z + 1)
                        }
                        None => Some(z..z + 1),
                    }
                }
                if let Some(r) = run {
                    boxes.push(IndexSpace::new(x..x + 1, y..y + 1, r))
                }
            }
        }
        let boxes = merge_along(boxes, Axis::J);
        let boxes = merge_along(boxes, Axis::I);
        boxes.iter().map(|b| b.refine(blocking_factor)).collect()
    }
}




// ============================================================================
/**
 * The pairing schedule used by `UniqueLayout::distribute`. Entry `[i][c]` is
 * the peer of rank i in round c, computed as `i ^ c` over the next power of
 * two above the rank count. XOR pairing is an involution, so both members of
 * a pair agree on the round in which they meet, and rounds 1.. cover every
 * pair exactly once. Peers at or beyond the true rank count are phantoms and
 * must be skipped by the caller.
 */
pub fn comm_matrix(num_ranks: usize) -> Vec<Vec<usize>> {
    let p2 = num_ranks.next_power_of_two();
    (0..p2)
        .map(|i| (0..p2).map(|c| i ^ c).collect())
        .collect()
}


fn axis_range(space: &IndexSpace, axis: Axis) -> (i64, i64) {
    let (i0, j0, k0) = space.start();
    let (i1, j1, k1) = space.end();
    match axis {
        Axis::I => (i0, i1),
        Axis::J => (j0, j1),
        Axis::K => (k0, k1),
    }
}


fn cross_ranges(space: &IndexSpace, axis: Axis) -> [(i64, i64); 2] {
    match axis {
        Axis::I => [axis_range(space, Axis::J), axis_range(space, Axis::K)],
        Axis::J => [axis_range(space, Axis::I), axis_range(space, Axis::K)],
        Axis::K => [axis_range(space, Axis::I), axis_range(space, Axis::J)],
    }
}


fn with_axis_range(space: &IndexSpace, axis: Axis, r: (i64, i64)) -> IndexSpace {
    let (i0, j0, k0) = space.start();
    let (i1, j1, k1) = space.end();
    match axis {
        Axis::I => IndexSpace::new(r.0..r.1, j0..j1, k0..k1),
        Axis::J => IndexSpace::new(i0..i1, r.0..r.1, k0..k1),
        Axis::K => IndexSpace::new(i0..i1, j0..j1, r.0..r.1),
    }
}


/**
 * Merge boxes that are flush along the given axis and identical along the
 * other two. One sorted sweep suffices because after sorting, mergeable
 * boxes are adjacent.
 */
fn merge_along(mut boxes: Vec<IndexSpace>, axis: Axis) -> Vec<IndexSpace> {
    boxes.sort_by_key(|b| (cross_ranges(b, axis), axis_range(b, axis)));

    let mut merged: Vec<IndexSpace> = Vec::new();
    for b in boxes {
        if let Some(last) = merged.last_mut() {
            let (l0, l1) = axis_range(last, axis);
            let (b0, b1) = axis_range(&b, axis);
            if cross_ranges(last, axis) == cross_ranges(&b, axis) && l1 == b0 {
                *last = with_axis_range(last, axis, (l0, b1));
                continue;
            }
        }
        merged.push(b)
    }
    merged
}
