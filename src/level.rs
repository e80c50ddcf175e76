use serde::{Deserialize, Serialize};

use crate::layout::{wrap_point, Layout};
use crate::patch::Patch;

/**
 * The field data of one mesh level at one time: a patch per layout box, plus
 * the time the data represents. Two of these per level (old and new) make up
 * the rotating pair the integrator writes into.
 */
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldState {
    pub patches: Vec<Patch>,
    pub time: f64,
}




// ============================================================================
impl FieldState {
    /// A state with one zeroed patch per layout box.
    pub fn from_layout(layout: &Layout, num_fields: usize, num_ghost: i64, time: f64) -> Self {
        Self {
            patches: layout
                .boxes()
                .iter()
                .map(|b| Patch::zeros(b.clone(), num_fields, num_ghost))
                .collect(),
            time,
        }
    }

    pub fn empty(time: f64) -> Self {
        Self {
            patches: Vec::new(),
            time,
        }
    }

    /// The patch whose interior contains the given cell index, after
    /// periodic wrapping at the level size.
    pub fn patch_containing(&self, index: (i64, i64, i64), dim_n: i64) -> Option<&Patch> {
        let index = wrap_point(index, dim_n);
        self.patches.iter().find(|p| p.index_space().contains(index))
    }

    /// Read one field component at a cell, wrapping periodically. Panics if
    /// no patch covers the cell.
    pub fn sample(&self, index: (i64, i64, i64), field: usize, dim_n: i64) -> f64 {
        let index = wrap_point(index, dim_n);
        self.patch_containing(index, dim_n)
            .unwrap_or_else(|| panic!("no patch contains cell {:?}", index))
            .get(index, field)
    }

    /**
     * A state at half the resolution: one patch per source patch, each cell
     * the conservative average of the underlying 2x2x2 fine cells. Used to
     * seed the shadow of the coarse level.
     */
    pub fn coarsened(&self, num_ghost: i64) -> Self {
        Self {
            patches: self
                .patches
                .iter()
                .map(|p| {
                    let area = p.index_space().coarsen(2);
                    let mut q = Patch::zeros(area, p.num_fields(), num_ghost);
                    q.for_each_mut(|index, slice| {
                        for (field, value) in slice.iter_mut().enumerate() {
                            *value = p.sample_coarsened(index, field, 2)
                        }
                    });
                    q
                })
                .collect(),
            time: self.time,
        }
    }
}




// ============================================================================
/**
 * One refinement level: its box layout, the old/new rotating pair of field
 * states, and the step counter used to phase regrids. `istep` counts level
 * steps, so a level advances twice per step of the level above it.
 */
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Level {
    pub index: usize,
    pub layout: Layout,
    pub new_state: FieldState,
    pub old_state: FieldState,
    pub istep: u64,
    pub contains_truncation_errors: bool,
}


impl Level {
    pub fn new(index: usize, layout: Layout, num_fields: usize, num_ghost: i64, time: f64) -> Self {
        let new_state = FieldState::from_layout(&layout, num_fields, num_ghost, time);
        let old_state = FieldState::from_layout(&layout, num_fields, num_ghost, f64::NEG_INFINITY);
        Self {
            index,
            layout,
            new_state,
            old_state,
            istep: 0,
            contains_truncation_errors: false,
        }
    }

    pub fn time(&self) -> f64 {
        self.new_state.time
    }

    /**
     * Rotate the state pair before a step: the current state becomes the
     * old state and will be integrated into the other buffer. Any
     * truncation error estimates stored in the old state are invalidated by
     * the rotation.
     */
    pub fn swap_states(&mut self) {
        std::mem::swap(&mut self.new_state, &mut self.old_state);
        self.contains_truncation_errors = false;
    }
}


/**
 * Identifies the coarse side of a synchronization: either a regular level or
 * the shadow of level 0.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LevelSlot {
    Shadow,
    Level(usize),
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{FieldState, Level};
    use crate::index_space::range3d;
    use crate::layout::Layout;

    #[test]
    fn sampling_wraps_periodically() {
        let layout = Layout::from_boxes(vec![range3d(0..4, 0..4, 0..4)], 1);
        let mut state = FieldState::from_layout(&layout, 1, 1, 0.0);
        state.patches[0].set((3, 0, 0), 0, 7.0);

        assert_eq!(state.sample((-1, 0, 0), 0, 4), 7.0);
        assert_eq!(state.sample((3, 4, 4), 0, 4), 7.0);
    }

    #[test]
    fn coarsening_averages_over_octants() {
        let layout = Layout::from_boxes(vec![range3d(0..4, 0..4, 0..4)], 1);
        let mut state = FieldState::from_layout(&layout, 1, 1, 0.0);
        state.patches[0].for_each_mut(|_, slice| slice[0] = 3.0);
        state.patches[0].set((0, 0, 0), 0, 11.0);

        let coarse = state.coarsened(1);
        assert_eq!(coarse.patches[0].index_space(), &range3d(0..2, 0..2, 0..2));
        assert_eq!(coarse.patches[0].get((0, 0, 0), 0), 4.0);
        assert_eq!(coarse.patches[0].get((1, 1, 1), 0), 3.0);
    }

    #[test]
    fn swapping_states_invalidates_truncation_errors() {
        let layout = Layout::from_boxes(vec![range3d(0..4, 0..4, 0..4)], 1);
        let mut level = Level::new(1, layout, 1, 1, 0.5);
        level.contains_truncation_errors = true;
        level.swap_states();

        assert!(!level.contains_truncation_errors);
        assert_eq!(level.old_state.time, 0.5);
    }
}
