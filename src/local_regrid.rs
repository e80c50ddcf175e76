use log::{debug, info};
use rayon::prelude::*;

use crate::layout::Layout;
use crate::level::FieldState;
use crate::location::{find_closest_globally, Location};
use crate::message::comm::all_gather_vec;
use crate::sim::Sim;
use crate::synchronizer::LevelSynchronizer;
use crate::unique_layout::{comm_matrix, UniqueLayout};

/**
 * The incremental alternative to rebuilding the hierarchy from scratch: a
 * local regrid only ever adds blocks to existing levels, which keeps all
 * current patch data valid and avoids the full re-tag and re-fill of a
 * global regrid. An attempt can conclude three ways: the missing blocks are
 * appended (possibly none), the additions are postponed because a vetoed
 * finer level already forces a global regrid soon and every level can wait
 * for it, or the veto cannot be rooted coarser than the attempt and the
 * caller must fall back to a global regrid right away.
 */
pub struct LocalRegrid {
    do_global_regrid: Vec<bool>,
    no_local_regrid: Vec<bool>,
    nregrids: usize,
    last_num_points: Vec<u64>,
    comm_matrix: Vec<Vec<usize>>,
}




// ============================================================================
impl LocalRegrid {
    pub fn new(num_ranks: usize) -> Self {
        Self {
            do_global_regrid: Vec::new(),
            no_local_regrid: Vec::new(),
            nregrids: 0,
            last_num_points: Vec::new(),
            comm_matrix: comm_matrix(num_ranks),
        }
    }

    /// Whether an earlier veto demands that the next regrid rooted at this
    /// level be global.
    pub fn wants_global(&self, level: usize) -> bool {
        self.do_global_regrid.get(level).copied().unwrap_or(false)
    }

    /**
     * Reset the bookkeeping after a global regrid rooted at `level`: the
     * volume baselines restart from the fresh layouts, accumulated vetoes
     * and deferrals are discharged, and a regrid rooted at the coarse
     * level also clears the restart escape hatch.
     */
    pub fn note_global_regrid(&mut self, sim: &mut Sim, level: usize) {
        self.nregrids = 0;
        self.do_global_regrid = vec![false; sim.levels.len()];
        self.no_local_regrid = vec![false; sim.levels.len()];
        self.last_num_points = sim.levels.iter().map(|l| l.layout.num_points()).collect();
        if level == 0 {
            sim.config.force_global_regrid_at_restart = false;
        }
    }

    /**
     * Try to satisfy the regrid rooted at `level` by only adding blocks.
     * Returns true when the regrid is fully handled here (blocks added,
     * nothing missing, or safely deferred) and false when the caller must
     * perform a global regrid instead.
     */
    pub fn attempt_regrid(
        &mut self,
        sim: &mut Sim,
        sync: &LevelSynchronizer,
        level: usize,
    ) -> bool {
        self.do_global_regrid.resize(sim.levels.len(), false);
        self.no_local_regrid.resize(sim.levels.len(), false);

        if sim.config.volume_threshold_strong <= 1.0 {
            return false;
        }
        if sim.config.force_global_regrid_at_restart {
            return false;
        }
        if self.nregrids >= sim.config.max_local_regrids {
            debug!("{} local regrids since the last global one, going global", self.nregrids);
            return false;
        }
        if self.do_global_regrid[level] {
            return false;
        }
        if level == sim.finest_level() {
            // a deeper level can only come into existence globally
            return false;
        }

        let (mut layouts, closest) = self.determine_new_blocks(sim, level);
        self.fix_nesting(sim, level, &mut layouts);

        // every decision below must come out the same on every rank, so it
        // is made from globally reduced counts and distances only
        let bf = sim.config.blocking_factor as u64;
        let added_points: Vec<u64> = layouts
            .iter()
            .map(|l| l.size_all(sim.comm.as_ref()) * bf * bf * bf)
            .collect();

        if added_points.iter().sum::<u64>() == 0 {
            return true;
        }
        let closest = find_closest_globally(&closest, sim.comm.as_ref());

        if let Some(veto_level) = self.growth_veto(sim, level, &added_points) {
            if veto_level >= level {
                return false;
            }
            // the needed global regrid is rooted above the current
            // subcycle; remember it, and skip the local additions when
            // every level can live without its blocks until then
            self.do_global_regrid[veto_level] = true;

            if self.global_regrid_can_wait(sim, level, veto_level, &closest) {
                for flag in &mut self.no_local_regrid[level..] {
                    *flag = true
                }
                sim.stats.deferred_regrids += 1;
                debug!(
                    "deferred the regrid at level {} until the global one at level {}",
                    level, veto_level
                );
                return true;
            }
        }
        self.add_boxes(sim, sync, level, layouts);
        self.nregrids += 1;
        sim.stats.local_regrids += 1;
        true
    }

    /**
     * Scan each level above `level` for tagged cells whose buffered
     * neighborhoods touch blocks the child layout does not hold yet. Also
     * tracks, per child level, the missing block closest to any tagged
     * cell, which drives the deferral heuristic.
     */
    fn determine_new_blocks(
        &self,
        sim: &Sim,
        level: usize,
    ) -> (Vec<UniqueLayout>, Vec<Location>) {
        let bf = sim.config.blocking_factor as i64;
        let buf = sim.config.n_error_buf;
        let rank = sim.comm.rank();
        let num_ranks = sim.comm.size();

        let mut layouts: Vec<UniqueLayout> = (0..sim.levels.len())
            .map(|c| {
                let planes = (sim.config.dim_n(c) / bf) as usize;
                UniqueLayout::new(planes, rank, num_ranks)
            })
            .collect();
        let mut closest = vec![Location::none(); sim.levels.len()];

        for child in level + 1..sim.levels.len() {
            if self.no_local_regrid.get(child - 1).copied().unwrap_or(false) {
                // a pending deferral already covers this level and below
                break;
            }
            let parent = &sim.levels[child - 1];
            let child_layout = &sim.levels[child].layout;
            let dim_child = sim.config.dim_n(child);
            let nb = dim_child / bf;
            let with_te = parent.contains_truncation_errors;
            let num_planes = nb as usize;

            let (blocks, near) = parent
                .new_state
                .patches
                .par_iter()
                .fold(
                    || (UniqueLayout::new(num_planes, rank, num_ranks), Location::none()),
                    |(mut acc, mut near), patch| {
                        let te_patch = if with_te {
                            parent
                                .old_state
                                .patches
                                .iter()
                                .find(|p| p.index_space() == patch.index_space())
                        } else {
                            None
                        };
                        for index in patch.index_space().iter() {
                            if !sim.cell_is_tagged(child - 1, patch, te_patch, index) {
                                continue;
                            }
                            let lo = |x: i64| (2 * (x - buf)).div_euclid(bf);
                            let hi = |x: i64| (2 * (x + buf + 1) + bf - 1).div_euclid(bf);
                            let cell = (2 * index.0, 2 * index.1, 2 * index.2);

                            for bx in lo(index.0)..hi(index.0) {
                                for by in lo(index.1)..hi(index.1) {
                                    for bz in lo(index.2)..hi(index.2) {
                                        let b = (
                                            bx.rem_euclid(nb),
                                            by.rem_euclid(nb),
                                            bz.rem_euclid(nb),
                                        );
                                        let start = (b.0 * bf, b.1 * bf, b.2 * bf);
                                        if child_layout.contains_wrapped(start, dim_child) {
                                            continue;
                                        }
                                        acc.add((b.0 as usize, b.1 as usize, b.2 as usize));
                                        let d = block_distance_squared(cell, b, bf, dim_child);
                                        near.select_closest(Location::new(start, d));
                                    }
                                }
                            }
                        }
                        (acc, near)
                    },
                )
                .reduce(
                    || (UniqueLayout::new(num_planes, rank, num_ranks), Location::none()),
                    |(mut a, mut na), (b, nb)| {
                        a.merge(b);
                        na.select_closest(nb);
                        (a, na)
                    },
                );
            layouts[child] = blocks;
            closest[child] = near;
        }
        (layouts, closest)
    }

    /**
     * Grow the pending block sets downward so that every new child block
     * remains properly nested: any parent block its ghost-extended
     * footprint needs, and which neither the current parent layout nor the
     * pending parent set holds, becomes pending too. Runs fine-to-coarse
     * so support requirements cascade.
     */
    fn fix_nesting(&self, sim: &Sim, level: usize, layouts: &mut [UniqueLayout]) {
        let bf = sim.config.blocking_factor as i64;
        let margin = sim.config.num_ghost + sim.config.delay_buffer_cells;

        for child in (level + 2..sim.levels.len()).rev() {
            let dim_parent = sim.config.dim_n(child - 1);
            let nb_parent = dim_parent / bf;
            let parent_layout = &sim.levels[child - 1].layout;
            let mut support = Vec::new();

            for (x, y, z) in layouts[child].iter() {
                let lo = |c: i64| (c * bf - margin).div_euclid(2 * bf);
                let hi = |c: i64| ((c + 1) * bf + margin + 2 * bf - 1).div_euclid(2 * bf);

                for px in lo(x as i64)..hi(x as i64) {
                    for py in lo(y as i64)..hi(y as i64) {
                        for pz in lo(z as i64)..hi(z as i64) {
                            let p = (
                                px.rem_euclid(nb_parent),
                                py.rem_euclid(nb_parent),
                                pz.rem_euclid(nb_parent),
                            );
                            let start = (p.0 * bf, p.1 * bf, p.2 * bf);
                            if !parent_layout.contains_wrapped(start, dim_parent) {
                                support.push((p.0 as usize, p.1 as usize, p.2 as usize));
                            }
                        }
                    }
                }
            }
            for block in support {
                layouts[child - 1].add(block);
            }
        }
    }

    /**
     * Check the growth of each level, pending additions included, against
     * its volume baseline from the last global regrid. Growth past the
     * strong threshold on any level vetoes the local regrid; the weak
     * threshold then picks the root of the required global regrid, one
     * level coarser than the first (coarsest) level that breaches it.
     */
    fn growth_veto(&self, sim: &Sim, level: usize, added_points: &[u64]) -> Option<usize> {
        let mut veto = false;
        let mut first_weak = None;
        let mut first_strong = None;

        for child in 1..sim.levels.len() {
            let added = added_points.get(child).copied().unwrap_or(0);
            let current = sim.levels[child].layout.num_points();
            let baseline = self
                .last_num_points
                .get(child)
                .copied()
                .filter(|n| *n > 0)
                .unwrap_or(current)
                .max(1);
            let growth = (current + added) as f64 / baseline as f64;

            if growth > sim.config.volume_threshold_strong {
                info!(
                    "level {} would reach {:.3}x of its volume baseline, vetoing the regrid at level {}",
                    child, growth, level
                );
                veto = true;
                first_strong.get_or_insert(child - 1);
            }
            if growth > sim.config.volume_threshold_weak {
                first_weak.get_or_insert(child - 1);
            }
        }
        if veto {
            first_weak.or(first_strong)
        } else {
            None
        }
    }

    /**
     * Whether every level can live without its pending blocks until a
     * global regrid rooted at `root` has had the chance to run. Tagged
     * features move at most one cell per step, so the closest missing
     * block's distance, scaled by the regrid cadence of its level, bounds
     * how long that level can wait.
     */
    fn global_regrid_can_wait(
        &self,
        sim: &Sim,
        level: usize,
        root: usize,
        closest: &[Location],
    ) -> bool {
        let nsteps = if sim.config.shadow_hierarchy {
            0
        } else if sim.levels[root].istep % 2 == 0 {
            1
        } else {
            2
        };
        let target = sim.levels[root].time() + nsteps as f64 * sim.config.dt(root);
        let buf = sim.config.n_error_buf.max(1) as f64;

        (level + 1..sim.levels.len()).all(|child| {
            if closest[child].is_none() {
                return true;
            }
            let regrid_dt = sim.config.regrid_interval as f64 * sim.config.dt(child);
            let slack = (closest[child].distance_sq as f64).sqrt() / buf * regrid_dt;
            sim.levels[child].time() + slack >= target
        })
    }

    /**
     * Append the pending blocks to their levels: reconcile each block set
     * across ranks, collapse to boxes, fill fresh patches at the level's
     * two time slices, and splice them into the layout and both states.
     */
    fn add_boxes(
        &mut self,
        sim: &mut Sim,
        sync: &LevelSynchronizer,
        level: usize,
        mut layouts: Vec<UniqueLayout>,
    ) {
        let bf = sim.config.blocking_factor as i64;
        let num_ranks = sim.comm.size();

        for child in level + 1..sim.levels.len() {
            let blocks = &mut layouts[child];
            if blocks.size_all(sim.comm.as_ref()) == 0 {
                continue;
            }
            blocks.distribute(sim.comm.as_ref(), &self.comm_matrix);
            let local_boxes = blocks.box_list(bf);
            let boxes = all_gather_vec(sim.comm.as_ref(), local_boxes);
            if boxes.is_empty() {
                continue;
            }
            info!(
                "local regrid adds {} boxes to level {} at t = {:.6}",
                boxes.len(),
                child,
                sim.time()
            );
            let sub_layout = Layout::from_boxes(boxes, num_ranks);
            let t_new = sim.levels[child].new_state.time;
            let t_old = sim.levels[child].old_state.time;

            let new_patches = sync.fill_patch(sim, child, t_new, &sub_layout).patches;
            let old_patches = if t_old.is_finite() {
                sync.fill_patch(sim, child, t_old, &sub_layout).patches
            } else {
                FieldState::from_layout(
                    &sub_layout,
                    sim.config.num_fields,
                    sim.config.num_ghost,
                    t_old,
                )
                .patches
            };
            let level = &mut sim.levels[child];
            level.layout.join(&sub_layout);
            level.layout.rebalance(num_ranks);
            level.new_state.patches.extend(new_patches);
            level.old_state.patches.extend(old_patches);
            level.contains_truncation_errors = false;
        }
    }
}


/**
 * Squared periodic distance from a cell to a block's cell region, zero if
 * the cell lies inside it.
 */
fn block_distance_squared(
    cell: (i64, i64, i64),
    block: (i64, i64, i64),
    bf: i64,
    dim_n: i64,
) -> i64 {
    let axis = |x: i64, b: i64| {
        let lo = b * bf;
        let hi = (b + 1) * bf;
        let x = x.rem_euclid(dim_n);
        if x >= lo && x < hi {
            return 0;
        }
        let d1 = (lo - x).rem_euclid(dim_n);
        let d2 = (x - (hi - 1)).rem_euclid(dim_n);
        d1.min(d2)
    };
    let dx = axis(cell.0, block.0);
    let dy = axis(cell.1, block.1);
    let dz = axis(cell.2, block.2);
    dx * dx + dy * dy + dz * dz
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::LocalRegrid;
    use crate::config::Config;
    use crate::index_space::range3d;
    use crate::layout::Layout;
    use crate::level::Level;
    use crate::message::comm::NullCommunicator;
    use crate::patch::Patch;
    use crate::sim::{Physics, Sim};
    use crate::synchronizer::LevelSynchronizer;

    struct TagWhere(Box<dyn Fn((i64, i64, i64), usize) -> bool + Send + Sync>);

    impl Physics for TagWhere {
        fn rhs(
            &self,
            deriv: &mut [f64],
            _patch: &Patch,
            _index: (i64, i64, i64),
            _time: f64,
            _level: i32,
            _dx: f64,
        ) {
            for d in deriv.iter_mut() {
                *d = 0.0
            }
        }

        fn tag_cell(
            &self,
            _patch: &Patch,
            index: (i64, i64, i64),
            _time: f64,
            level: usize,
        ) -> bool {
            (self.0)(index, level)
        }
    }

    /// A 16-cell coarse level with one refined level whose layout is given
    /// in fine cells.
    fn sim_with_child(tag: Box<dyn Fn((i64, i64, i64), usize) -> bool + Send + Sync>, child_boxes: Vec<crate::index_space::IndexSpace>) -> Sim {
        let config = Config {
            coarse_size: 16,
            patch_size: 16,
            blocking_factor: 4,
            max_level: 1,
            n_error_buf: 2,
            ..Config::default()
        };
        let mut sim = Sim::new(config, Box::new(TagWhere(tag)), Box::new(NullCommunicator)).unwrap();
        let layout = Layout::from_boxes(child_boxes, 1);
        let sync = LevelSynchronizer::new(&sim.config);
        let mut fine = Level::new(1, layout.clone(), 1, 2, 0.0);
        fine.new_state = sync.fill_patch(&sim, 1, 0.0, &layout);
        sim.levels.push(fine);
        sim
    }

    #[test]
    fn runaway_growth_is_vetoed_in_favor_of_a_global_regrid() {
        let mut sim = sim_with_child(
            Box::new(|_, level| level == 0),
            vec![range3d(4..12, 4..12, 4..12)],
        );
        let sync = LevelSynchronizer::new(&sim.config);
        let mut regrid = LocalRegrid::new(1);
        regrid.note_global_regrid(&mut sim, 0);

        // tagging the whole coarse level wants far more than a 1.1x growth
        assert!(!regrid.attempt_regrid(&mut sim, &sync, 0));
        assert_eq!(sim.stats.local_regrids, 0);
    }

    /// Three levels with level 1 covering its whole domain and level 2
    /// covering cells 4..16 except the corner block at 12..16^3. A tag on
    /// level 1 at (5, 5, 5) wants that corner block, at squared distance 12.
    fn sim_with_two_children(tag: Box<dyn Fn((i64, i64, i64), usize) -> bool + Send + Sync>) -> Sim {
        let config = Config {
            coarse_size: 16,
            patch_size: 16,
            blocking_factor: 4,
            max_level: 2,
            n_error_buf: 2,
            ..Config::default()
        };
        let mut sim = Sim::new(config, Box::new(TagWhere(tag)), Box::new(NullCommunicator)).unwrap();
        let sync = LevelSynchronizer::new(&sim.config);

        let mid_layout = Layout::from_boxes(vec![range3d(0..32, 0..32, 0..32)], 1);
        let mut mid = Level::new(1, mid_layout.clone(), 1, 2, 0.0);
        mid.new_state = sync.fill_patch(&sim, 1, 0.0, &mid_layout);
        sim.levels.push(mid);

        let top_layout = Layout::from_boxes(
            vec![
                range3d(4..16, 4..16, 4..12),
                range3d(4..16, 4..12, 12..16),
                range3d(4..12, 12..16, 12..16),
            ],
            1,
        );
        let mut top = Level::new(2, top_layout.clone(), 1, 2, 0.0);
        top.new_state = sync.fill_patch(&sim, 2, 0.0, &top_layout);
        sim.levels.push(top);
        sim
    }

    #[test]
    fn a_vetoed_regrid_waits_when_no_block_is_needed_soon() {
        let mut sim = sim_with_two_children(
            Box::new(|index, level| level == 1 && index == (5, 5, 5)),
        );
        let sync = LevelSynchronizer::new(&sim.config);
        let mut regrid = LocalRegrid::new(1);
        regrid.note_global_regrid(&mut sim, 0);

        // growth baselines that put level 1 over the weak threshold and
        // level 2 over the strong one, so the veto roots at level 0
        regrid.last_num_points = vec![4096, 30000, 1500];
        let boxes_before = sim.levels[2].layout.len();

        assert!(regrid.attempt_regrid(&mut sim, &sync, 1));
        assert_eq!(sim.stats.deferred_regrids, 1);
        assert_eq!(sim.stats.local_regrids, 0);
        assert_eq!(sim.levels[2].layout.len(), boxes_before);
        assert!(regrid.wants_global(0));

        // the deferral suppresses further scans until the global regrid
        assert!(regrid.attempt_regrid(&mut sim, &sync, 1));
        assert_eq!(sim.stats.deferred_regrids, 1);

        regrid.note_global_regrid(&mut sim, 0);
        assert!(!regrid.wants_global(0));
    }

    #[test]
    fn a_vetoed_regrid_that_cannot_wait_adds_blocks_first() {
        let mut sim = sim_with_two_children(
            Box::new(|index, level| level == 1 && index == (5, 5, 5)),
        );
        sim.config.shadow_hierarchy = false;
        sim.levels[0].istep = 1;
        let sync = LevelSynchronizer::new(&sim.config);
        let mut regrid = LocalRegrid::new(1);
        regrid.note_global_regrid(&mut sim, 0);
        regrid.last_num_points = vec![4096, 30000, 1500];

        // two coarse steps until the global regrid, but the corner block
        // is about sqrt(12) / 2 regrid intervals of level 2 away
        assert!(regrid.attempt_regrid(&mut sim, &sync, 1));
        assert_eq!(sim.stats.deferred_regrids, 0);
        assert_eq!(sim.stats.local_regrids, 1);
        assert!(regrid.wants_global(0));

        let dim = sim.config.dim_n(2);
        assert!(sim.levels[2].layout.contains_wrapped((12, 12, 12), dim));
    }

    #[test]
    fn a_weak_breach_alone_does_not_veto() {
        let mut sim = sim_with_child(
            Box::new(|index, level| level == 0 && index == (3, 3, 3)),
            vec![range3d(4..8, 4..8, 4..8)],
        );
        sim.config.volume_threshold_strong = 100.0;
        sim.config.volume_threshold_weak = 1.0001;
        let sync = LevelSynchronizer::new(&sim.config);
        let mut regrid = LocalRegrid::new(1);
        regrid.note_global_regrid(&mut sim, 0);

        assert!(regrid.attempt_regrid(&mut sim, &sync, 0));
        assert_eq!(sim.stats.local_regrids, 1);

        let dim = sim.config.dim_n(1);
        assert!(sim.levels[1].layout.contains_wrapped((0, 0, 0), dim));
    }

    #[test]
    fn a_mandatory_missing_block_is_added_in_place() {
        // the child holds a single block; a tag next to it needs neighbors
        let mut sim = sim_with_child(
            Box::new(|index, level| level == 0 && index == (3, 3, 3)),
            vec![range3d(4..8, 4..8, 4..8)],
        );
        sim.config.volume_threshold_strong = 100.0;
        sim.config.volume_threshold_weak = 100.0;
        let sync = LevelSynchronizer::new(&sim.config);
        let mut regrid = LocalRegrid::new(1);
        regrid.note_global_regrid(&mut sim, 0);

        assert!(regrid.attempt_regrid(&mut sim, &sync, 0));
        assert_eq!(sim.stats.local_regrids, 1);

        // every block of the buffered neighborhood of (6, 6, 6) is covered
        let dim = sim.config.dim_n(1);
        for b in [(0, 0, 0), (0, 4, 4), (8, 8, 8), (8, 0, 4)] {
            assert!(sim.levels[1].layout.contains_wrapped(b, dim));
        }
        assert!(!sim.levels[1].layout.contains_wrapped((12, 0, 4), dim));
    }

    #[test]
    fn a_unit_strong_threshold_disables_local_regrids() {
        let mut sim = sim_with_child(
            Box::new(|index, level| level == 0 && index == (3, 3, 3)),
            vec![range3d(4..8, 4..8, 4..8)],
        );
        sim.config.volume_threshold_strong = 1.0;
        let sync = LevelSynchronizer::new(&sim.config);
        let mut regrid = LocalRegrid::new(1);
        let boxes_before = sim.levels[1].layout.len();

        assert!(!regrid.attempt_regrid(&mut sim, &sync, 0));
        assert_eq!(sim.levels[1].layout.len(), boxes_before);
    }

    #[test]
    fn an_exhausted_local_budget_goes_global() {
        let mut sim = sim_with_child(
            Box::new(|_, _| false),
            vec![range3d(4..8, 4..8, 4..8)],
        );
        sim.config.max_local_regrids = 0;
        let sync = LevelSynchronizer::new(&sim.config);
        let mut regrid = LocalRegrid::new(1);

        assert!(!regrid.attempt_regrid(&mut sim, &sync, 0));
    }
}
