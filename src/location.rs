use serde::{Deserialize, Serialize};

use crate::message::comm::Communicator;

/**
 * A cell index paired with its squared distance to some query point. Used by
 * the local regrid pass to remember, per level, the tagged cell closest to a
 * candidate block, so that the delay heuristic can reason about how soon
 * refinement could reach the block. A `Location` with no observation yet
 * carries a sentinel distance that loses to any real one.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub i: i64,
    pub j: i64,
    pub k: i64,
    pub distance_sq: i64,
}




// ============================================================================
impl Location {
    pub fn new(index: (i64, i64, i64), distance_sq: i64) -> Self {
        Self {
            i: index.0,
            j: index.1,
            k: index.2,
            distance_sq,
        }
    }

    /// A location that compares farther than any observed one.
    pub fn none() -> Self {
        Self {
            i: 0,
            j: 0,
            k: 0,
            distance_sq: i64::MAX,
        }
    }

    pub fn is_none(&self) -> bool {
        self.distance_sq == i64::MAX
    }

    /// Replace this location if the other one is strictly closer.
    pub fn select_closest(&mut self, other: Self) {
        if other.distance_sq < self.distance_sq {
            *self = other
        }
    }
}


/**
 * Reduce per-level closest locations across all ranks: entry `lev` of the
 * result is the globally closest of every rank's entry `lev`. All ranks
 * return the same vector.
 */
pub fn find_closest_globally(local: &[Location], comm: &dyn Communicator) -> Vec<Location> {
    if comm.size() == 1 {
        return local.to_vec();
    }
    let f = |a: Vec<u8>, b: Vec<u8>| {
        let mut x: Vec<Location> = rmp_serde::decode::from_slice(&a).unwrap();
        let y: Vec<Location> = rmp_serde::decode::from_slice(&b).unwrap();
        for (mine, theirs) in x.iter_mut().zip(y) {
            mine.select_closest(theirs)
        }
        rmp_serde::encode::to_vec(&x).unwrap()
    };
    let bytes = comm.all_reduce(&f, rmp_serde::encode::to_vec(&local).unwrap());
    rmp_serde::decode::from_slice(&bytes).unwrap()
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{find_closest_globally, Location};
    use crate::message::channel::ChannelCommunicator;

    #[test]
    fn select_closest_keeps_the_nearer_observation() {
        let mut loc = Location::none();
        assert!(loc.is_none());

        loc.select_closest(Location::new((4, 5, 6), 25));
        loc.select_closest(Location::new((1, 2, 3), 9));
        loc.select_closest(Location::new((7, 8, 9), 49));

        assert_eq!(loc, Location::new((1, 2, 3), 9));
    }

    #[test]
    fn the_global_reduction_picks_the_closest_per_level() {
        let handles: Vec<_> = ChannelCommunicator::group(3)
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                std::thread::spawn(move || {
                    let local = vec![
                        Location::new((rank as i64, 0, 0), (rank as i64 + 1) * 10),
                        Location::new((0, rank as i64, 0), 30 - rank as i64 * 10),
                    ];
                    find_closest_globally(&local, &comm)
                })
            })
            .collect();

        for handle in handles {
            let global = handle.join().unwrap();
            assert_eq!(global[0], Location::new((0, 0, 0), 10));
            assert_eq!(global[1], Location::new((0, 2, 0), 10));
        }
    }
}
