use crate::config::{Config, InterpolationKind};
use crate::layout::{wrap_point, Layout};
use crate::level::{FieldState, LevelSlot};
use crate::scheduler::times_match;
use crate::sim::Sim;

/**
 * The data-motion side of the level hierarchy: filling ghost cells and
 * newly created patches from coarser data, restricting fine data onto the
 * level below, and estimating truncation errors against a coarser solution
 * of the same instant. Stateless apart from the interpolation choice; each
 * method borrows the simulation it operates on.
 */
pub struct LevelSynchronizer {
    interpolation: InterpolationKind,
}




// ============================================================================
impl LevelSynchronizer {
    pub fn new(config: &Config) -> Self {
        Self {
            interpolation: config.interpolation,
        }
    }

    /**
     * The value of one field at one cell of the given level at the given
     * time. If the level holds the cell at that instant (exactly at either
     * of its two time slices, or between them, in which case the slices
     * are combined linearly), that value is used; otherwise the query
     * falls through to the parent at the overlying coarse cell. Panics if
     * not even the coarse level covers the cell, which cannot happen on a
     * periodic domain.
     */
    pub fn value_at(
        &self,
        sim: &Sim,
        level: usize,
        time: f64,
        index: (i64, i64, i64),
        field: usize,
    ) -> f64 {
        if let Some(value) = self.try_value_at(sim, level, time, index, field) {
            return value;
        }
        if level == 0 {
            panic!("the coarse level does not cover cell {:?}", index)
        }
        let coarse = (
            index.0.div_euclid(2),
            index.1.div_euclid(2),
            index.2.div_euclid(2),
        );
        match self.interpolation {
            InterpolationKind::PiecewiseConstant => {
                self.value_at(sim, level - 1, time, coarse, field)
            }
        }
    }

    fn try_value_at(
        &self,
        sim: &Sim,
        level: usize,
        time: f64,
        index: (i64, i64, i64),
        field: usize,
    ) -> Option<f64> {
        let level = sim.levels.get(level)?;
        let dim_n = sim.config.dim_n(level.index);
        let index = wrap_point(index, dim_n);
        let t_new = level.new_state.time;
        let t_old = level.old_state.time;

        if times_match(time, t_new) {
            level
                .new_state
                .patch_containing(index, dim_n)
                .map(|p| p.get(index, field))
        } else if times_match(time, t_old) {
            level
                .old_state
                .patch_containing(index, dim_n)
                .map(|p| p.get(index, field))
        } else if t_old.is_finite() && t_old < time && time < t_new {
            let new_p = level.new_state.patch_containing(index, dim_n)?;
            let old_p = level.old_state.patch_containing(index, dim_n)?;
            let w = (time - t_old) / (t_new - t_old);
            Some((1.0 - w) * old_p.get(index, field) + w * new_p.get(index, field))
        } else {
            None
        }
    }

    /**
     * Build a field state over the given layout, at the given time, from
     * whatever data the hierarchy holds: the level's own data where it
     * covers a cell at that instant, the parent's otherwise. Used to
     * populate remade and newly created levels. Ghost cells are left zero;
     * they are refilled before any integration.
     */
    pub fn fill_patch(&self, sim: &Sim, level: usize, time: f64, layout: &Layout) -> FieldState {
        let num_fields = sim.config.num_fields;
        let num_ghost = sim.config.num_ghost;
        let mut state = FieldState::from_layout(layout, num_fields, num_ghost, time);

        for patch in &mut state.patches {
            patch.for_each_mut(|index, slice| {
                for (field, value) in slice.iter_mut().enumerate() {
                    *value = self.value_at(sim, level, time, index, field)
                }
            })
        }
        state
    }

    /**
     * Fill the ghost cells of a state in place, at the state's own time.
     * Ghosts covered by a sibling patch copy from it (periodically); the
     * rest come from the parent level, which for a mid-subcycle instant
     * means combining the parent's two time slices. The shadow and the
     * coarse level have no parent, but they tile the whole domain, so
     * every ghost resolves periodically.
     */
    pub fn fill_intermediate_patch(&self, sim: &Sim, slot: LevelSlot, state: &mut FieldState) {
        let (dim_n, parent) = match slot {
            LevelSlot::Shadow => (sim.config.dim_n(0) / 2, None),
            LevelSlot::Level(0) => (sim.config.dim_n(0), None),
            LevelSlot::Level(lev) => (sim.config.dim_n(lev), Some(lev - 1)),
        };
        let time = state.time;
        let snapshot = state.patches.clone();

        for patch in &mut state.patches {
            let interior = patch.index_space().clone();

            for index in patch.extended_space().iter() {
                if interior.contains(index) {
                    continue;
                }
                let wrapped = wrap_point(index, dim_n);

                if let Some(src) = snapshot.iter().find(|p| p.index_space().contains(wrapped)) {
                    let values: Vec<f64> = src.get_slice(wrapped).to_vec();
                    patch.get_slice_mut(index).copy_from_slice(&values);
                } else if let Some(parent_level) = parent {
                    let coarse = (
                        wrapped.0.div_euclid(2),
                        wrapped.1.div_euclid(2),
                        wrapped.2.div_euclid(2),
                    );
                    for field in 0..sim.config.num_fields {
                        let value = self.value_at(sim, parent_level, time, coarse, field);
                        patch.get_slice_mut(index)[field] = value;
                    }
                } else {
                    panic!("ghost cell {:?} not covered on a parentless level", index)
                }
            }
        }
    }

    /**
     * Restrict the fine level `level + 1` onto `level`: every coarse cell
     * under the fine level becomes the average of its eight fine cells.
     * Run at each instant the two levels coincide, unless a truncation
     * error estimate subsumes it. Any estimates stored on the fine level
     * refer to data this pass invalidates.
     */
    pub fn average_down_to(&self, sim: &mut Sim, level: usize) {
        let dim_fine = sim.config.dim_n(level + 1);
        let (coarse_side, fine_side) = sim.levels.split_at_mut(level + 1);
        let coarse = &mut coarse_side[level];
        let fine = &mut fine_side[0];

        for patch in &mut coarse.new_state.patches {
            patch.for_each_mut(|index, slice| {
                let corner = (2 * index.0, 2 * index.1, 2 * index.2);
                if let Some(fp) = fine.new_state.patch_containing(corner, dim_fine) {
                    for (field, value) in slice.iter_mut().enumerate() {
                        *value = fp.sample_coarsened(index, field, 2)
                    }
                }
            })
        }
        fine.contains_truncation_errors = false;
    }

    /**
     * Estimate truncation errors for the given level by comparing its
     * restriction against an independently advanced coarse solution of the
     * same instant: the level below for `level >= 1`, the shadow hierarchy
     * for the coarse level. Per covered coarse cell, the absolute
     * difference is stored at the corresponding even-index corner of the
     * level's old state (whose data is stale by now and serves as
     * scratch), and the coarse cell simultaneously receives the
     * restriction, standing in for the plain average-down. Consumes the
     * shadow when `level == 0`.
     */
    pub fn compute_truncation_errors(&self, sim: &mut Sim, level: usize) {
        sim.stats.truncation_estimates += 1;

        if level == 0 {
            let shadow = sim
                .shadow
                .take()
                .unwrap_or_else(|| panic!("truncation errors at level 0 require a shadow"));
            let fine = &mut sim.levels[0];

            if !times_match(shadow.time(), fine.time()) {
                panic!(
                    "shadow at t = {} cannot be compared against the coarse level at t = {}",
                    shadow.time(),
                    fine.time()
                )
            }
            let dim_fine = sim.config.dim_n(0);
            let fine_new = &fine.new_state;
            let fine_old = &mut fine.old_state;

            for patch in &shadow.new_state.patches {
                for index in patch.index_space().iter() {
                    let corner = wrap_point((2 * index.0, 2 * index.1, 2 * index.2), dim_fine);
                    let fp = match fine_new.patch_containing(corner, dim_fine) {
                        Some(fp) => fp,
                        None => continue,
                    };
                    let store = fine_old
                        .patches
                        .iter_mut()
                        .find(|p| p.index_space().contains(corner));
                    if let Some(store) = store {
                        for field in 0..patch.num_fields() {
                            let avg = fp.sample_coarsened(index, field, 2);
                            let te = (patch.get(index, field) - avg).abs();
                            store.set(corner, field, te);
                        }
                    }
                }
            }
            fine.contains_truncation_errors = true;
        } else {
            let dim_fine = sim.config.dim_n(level);
            let (coarse_side, fine_side) = sim.levels.split_at_mut(level);
            let coarse = &mut coarse_side[level - 1];
            let fine = &mut fine_side[0];

            if !times_match(coarse.time(), fine.time()) {
                panic!(
                    "level {} at t = {} cannot be compared against level {} at t = {}",
                    level - 1,
                    coarse.time(),
                    level,
                    fine.time()
                )
            }
            let fine_new = &fine.new_state;
            let fine_old = &mut fine.old_state;

            for patch in &mut coarse.new_state.patches {
                patch.for_each_mut(|index, slice| {
                    let corner = wrap_point((2 * index.0, 2 * index.1, 2 * index.2), dim_fine);
                    let fp = match fine_new.patch_containing(corner, dim_fine) {
                        Some(fp) => fp,
                        None => return,
                    };
                    let mut store = fine_old
                        .patches
                        .iter_mut()
                        .find(|p| p.index_space().contains(corner));
                    for (field, value) in slice.iter_mut().enumerate() {
                        let avg = fp.sample_coarsened(index, field, 2);
                        let te = (*value - avg).abs();
                        *value = avg;
                        if let Some(store) = store.as_deref_mut() {
                            store.set(corner, field, te);
                        }
                    }
                })
            }
            fine.contains_truncation_errors = true;
        }
    }
}
