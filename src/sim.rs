use std::fs::File;
use std::io;
use std::path::Path;

use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{Config, ConfigError};
use crate::index_space::IndexSpace;
use crate::layout::Layout;
use crate::level::{FieldState, Level};
use crate::message::comm::{all_gather_vec, Communicator};
use crate::patch::Patch;
use crate::synchronizer::LevelSynchronizer;
use crate::unique_layout::{comm_matrix, UniqueLayout};

/**
 * The problem-specific part of a simulation. Implementations supply the
 * right-hand side of the evolution equation, the refinement criterion, and
 * optionally the initial data. Everything else (stepping, regridding,
 * synchronization) is generic.
 */
pub trait Physics: Send + Sync {
    /// Write the time derivative of each field at one cell. The patch's
    /// ghost cells are filled, so stencil neighbors may be read freely.
    /// Level -1 is the half-resolution shadow of the coarse level.
    fn rhs(
        &self,
        deriv: &mut [f64],
        patch: &Patch,
        index: (i64, i64, i64),
        time: f64,
        level: i32,
        dx: f64,
    );

    /// Whether the given cell needs refinement, judged from the field data
    /// alone. Truncation error tagging is applied separately by the engine.
    fn tag_cell(&self, patch: &Patch, index: (i64, i64, i64), time: f64, level: usize) -> bool;

    /// Write the initial value of each field at one cell.
    fn initial(&self, _slice: &mut [f64], _index: (i64, i64, i64), _dx: f64) {}

    /// Whether a not-yet-existing level may come into existence at the
    /// given time. Lets a problem delay deep refinement until it matters.
    fn can_create_level(&self, _level: usize, _t_next: f64) -> bool {
        true
    }
}


/**
 * Counters describing the regrid activity of a run.
 */
#[derive(Clone, Debug, Default)]
pub struct Stats {
    pub truncation_estimates: u64,
    pub local_regrids: u64,
    pub global_regrids: u64,
    pub deferred_regrids: u64,
}




// ============================================================================
/**
 * The complete state of a running simulation: the level hierarchy, the
 * shadow of the coarse level when one is alive, and the process group the
 * run is distributed over. Field data is replicated on every rank; the
 * communicator is exercised by the block-reconciliation and reduction steps
 * of regridding, which are the parts that must agree across ranks.
 */
pub struct Sim {
    pub config: Config,
    pub comm: Box<dyn Communicator>,
    pub physics: Box<dyn Physics>,
    pub levels: Vec<Level>,
    pub shadow: Option<Level>,
    pub stats: Stats,
}




// ============================================================================
impl Sim {
    /**
     * Build a simulation with just the coarse level, decomposed into
     * patch-sized boxes and filled with the physics' initial data.
     */
    pub fn new(
        config: Config,
        physics: Box<dyn Physics>,
        comm: Box<dyn Communicator>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let dim = config.dim_n(0);
        let ps = config.patch_size as i64;
        let mut boxes = Vec::new();

        for i in (0..dim).step_by(config.patch_size) {
            for j in (0..dim).step_by(config.patch_size) {
                for k in (0..dim).step_by(config.patch_size) {
                    boxes.push(IndexSpace::new(i..i + ps, j..j + ps, k..k + ps))
                }
            }
        }
        let layout = Layout::from_boxes(boxes, comm.size());
        let mut level = Level::new(0, layout, config.num_fields, config.num_ghost, config.t_start);
        let dx = config.dx(0);

        for patch in &mut level.new_state.patches {
            patch.for_each_mut(|index, slice| physics.initial(slice, index, dx))
        }
        Ok(Self {
            config,
            comm,
            physics,
            levels: vec![level],
            shadow: None,
            stats: Stats::default(),
        })
    }

    pub fn finest_level(&self) -> usize {
        self.levels.len() - 1
    }

    pub fn time(&self) -> f64 {
        self.levels[0].time()
    }

    /**
     * Whether one cell of the given level wants refinement, combining the
     * physics' criterion with truncation error tagging. `te_patch` is the
     * old-state patch holding truncation error estimates at even-index
     * corners, present only while the level's estimates are current.
     */
    pub fn cell_is_tagged(
        &self,
        level: usize,
        patch: &Patch,
        te_patch: Option<&Patch>,
        index: (i64, i64, i64),
    ) -> bool {
        let time = self.levels[level].time();

        if self.physics.tag_cell(patch, index, time, level) {
            return true;
        }
        if let Some(te) = te_patch {
            let corner = (
                index.0 - index.0.rem_euclid(2),
                index.1 - index.1.rem_euclid(2),
                index.2 - index.2.rem_euclid(2),
            );
            return (0..self.config.num_fields).any(|f| te.get(corner, f) > self.config.te_crit);
        }
        false
    }

    /**
     * Scan the parent of `child_level` for tagged cells and collect the
     * child-level blocks their buffered neighborhoods touch. The scan is
     * patch-parallel, with thread-local partial layouts merged at the end.
     * For grandchild levels and deeper, blocks whose footprint is not
     * properly nested inside the parent layout are left out.
     */
    pub fn tagged_block_layout(&self, child_level: usize) -> UniqueLayout {
        let parent = &self.levels[child_level - 1];
        let bf = self.config.blocking_factor as i64;
        let dim_child = self.config.dim_n(child_level);
        let num_planes = (dim_child / bf) as usize;
        let buf = self.config.n_error_buf;
        let rank = self.comm.rank();
        let num_ranks = self.comm.size();
        let with_te = parent.contains_truncation_errors;
        let nest = if child_level >= 2 {
            Some(&parent.layout)
        } else {
            None
        };

        parent
            .new_state
            .patches
            .par_iter()
            .fold(
                || UniqueLayout::new(num_planes, rank, num_ranks),
                |mut acc, patch| {
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
                        if self.cell_is_tagged(child_level - 1, patch, te_patch, index) {
                            self.add_blocks_around(&mut acc, index, buf, bf, dim_child, nest)
                        }
                    }
                    acc
                },
            )
            .reduce(
                || UniqueLayout::new(num_planes, rank, num_ranks),
                |mut a, b| {
                    a.merge(b);
                    a
                },
            )
    }

    /**
     * Add to the layout every child-level block touched by the buffered
     * neighborhood of one tagged parent cell, wrapping periodically. Blocks
     * failing the nesting check against `nest` are skipped.
     */
    pub(crate) fn add_blocks_around(
        &self,
        layout: &mut UniqueLayout,
        index: (i64, i64, i64),
        buf: i64,
        bf: i64,
        dim_child: i64,
        nest: Option<&Layout>,
    ) {
        let nb = dim_child / bf;
        let lo = |x: i64| (2 * (x - buf)).div_euclid(bf);
        let hi = |x: i64| (2 * (x + buf + 1) + bf - 1).div_euclid(bf);

        for bx in lo(index.0)..hi(index.0) {
            for by in lo(index.1)..hi(index.1) {
                for bz in lo(index.2)..hi(index.2) {
                    let b = (
                        bx.rem_euclid(nb),
                        by.rem_euclid(nb),
                        bz.rem_euclid(nb),
                    );
                    if let Some(parent_layout) = nest {
                        let space = IndexSpace::new(
                            b.0 * bf..(b.0 + 1) * bf,
                            b.1 * bf..(b.1 + 1) * bf,
                            b.2 * bf..(b.2 + 1) * bf,
                        );
                        if !parent_layout.covers_coarsened(
                            &space,
                            self.config.num_ghost,
                            dim_child / 2,
                        ) {
                            continue;
                        }
                    }
                    layout.add((b.0 as usize, b.1 as usize, b.2 as usize));
                }
            }
        }
    }

    /**
     * Rebuild the refinement levels finer than `root` from scratch, top
     * down; `root` itself and everything coarser keep their layouts. Each
     * level's new layout comes from re-tagging its parent, reconciling the
     * block set across ranks, and collapsing it to boxes; boxes that would
     * break proper nesting inside the (freshly rebuilt) parent are
     * discarded. A level whose tag set comes up empty is removed along
     * with everything beneath it. At most one brand-new level is created
     * per regrid.
     */
    pub fn global_regrid(&mut self, sync: &LevelSynchronizer, root: usize) {
        self.stats.global_regrids += 1;
        info!("global regrid rooted at level {} at t = {:.6}", root, self.time());

        let matrix = comm_matrix(self.comm.size());
        let num_fields = self.config.num_fields;
        let num_ghost = self.config.num_ghost;
        let max_child = self.config.max_level.min(self.levels.len());

        for child in root + 1..=max_child {
            let creating = child == self.levels.len();
            let time = self.levels[child - 1].time();

            if creating && !self.physics.can_create_level(child, time) {
                break;
            }
            let mut blocks = self.tagged_block_layout(child);
            blocks.distribute(self.comm.as_ref(), &matrix);

            let local_boxes = blocks.box_list(self.config.blocking_factor as i64);
            let boxes = all_gather_vec(self.comm.as_ref(), local_boxes);

            if boxes.is_empty() {
                self.levels.truncate(child);
                break;
            }
            let layout = Layout::from_boxes(boxes, self.comm.size());

            if creating {
                let new_state = sync.fill_patch(self, child, time, &layout);
                let mut level = Level::new(child, layout, num_fields, num_ghost, time);
                level.istep = 2 * self.levels[child - 1].istep;
                level.new_state = new_state;
                self.levels.push(level);
            } else {
                let time = self.levels[child].time();
                let new_state = sync.fill_patch(self, child, time, &layout);
                let level = &mut self.levels[child];
                level.old_state =
                    FieldState::from_layout(&layout, num_fields, num_ghost, f64::NEG_INFINITY);
                level.layout = layout;
                level.new_state = new_state;
            }
        }
        for level in &mut self.levels {
            level.contains_truncation_errors = false
        }
    }

    /**
     * Snap every level's clock to the coarse level's, absorbing the float
     * drift accumulated over a subcycle. Called after each coarse step.
     */
    pub fn synchronize_times(&mut self) {
        let t0 = self.time();
        for level in &mut self.levels {
            level.new_state.time = t0
        }
    }

    pub fn restart_seed(&self, last_regrid_time: &[f64]) -> RestartSeed {
        RestartSeed {
            time: self.time(),
            istep: self.levels[0].istep,
            blocking_factor: self.config.blocking_factor,
            last_regrid_time: last_regrid_time.to_vec(),
        }
    }

    /**
     * Re-seed the coordination state from a restart file. A seed written
     * with a different blocking factor carries block indexes in the wrong
     * units, so rather than failing the run, the first regrid opportunity
     * is forced to be global.
     */
    pub fn apply_restart(&mut self, seed: &RestartSeed) {
        if seed.blocking_factor != self.config.blocking_factor {
            warn!(
                "restart was written with blocking factor {}, this run uses {}; forcing a global regrid",
                seed.blocking_factor, self.config.blocking_factor
            );
            self.config.force_global_regrid_at_restart = true;
        }
        self.levels[0].istep = seed.istep;
        self.levels[0].new_state.time = seed.time;
        self.synchronize_times();
    }
}


// ============================================================================
/**
 * The coordination state persisted across a restart. Field data snapshots
 * are written separately by the application; this seed only carries what
 * the stepping and regrid machinery needs to resume coherently.
 */
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestartSeed {
    pub time: f64,
    pub istep: u64,
    pub blocking_factor: usize,
    pub last_regrid_time: Vec<f64>,
}


impl RestartSeed {
    pub fn write(&self, path: &Path) -> io::Result<()> {
        let file = File::create(path)?;
        ciborium::ser::into_writer(self, file)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    pub fn read(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        ciborium::de::from_reader(file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{Physics, RestartSeed, Sim};
    use crate::config::Config;
    use crate::message::comm::NullCommunicator;
    use crate::patch::Patch;
    use crate::synchronizer::LevelSynchronizer;

    /// Tags a ball of cells around the domain center, in the cell units of
    /// whatever level is being scanned.
    pub struct TagBall {
        pub radius: f64,
    }

    impl Physics for TagBall {
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
            let dx = 1.0 / (64 << level) as f64;
            let x = (index.0 as f64 + 0.5) * dx - 0.5;
            let y = (index.1 as f64 + 0.5) * dx - 0.5;
            let z = (index.2 as f64 + 0.5) * dx - 0.5;
            (x * x + y * y + z * z).sqrt() < self.radius
        }
    }

    pub fn ball_sim(max_level: usize) -> Sim {
        let config = Config {
            max_level,
            ..Config::default()
        };
        Sim::new(
            config,
            Box::new(TagBall { radius: 0.1 }),
            Box::new(NullCommunicator),
        )
        .unwrap()
    }

    #[test]
    fn a_new_sim_decomposes_the_coarse_level_into_patches() {
        let sim = ball_sim(1);
        assert_eq!(sim.levels.len(), 1);
        assert_eq!(sim.levels[0].layout.len(), 8);
        assert_eq!(sim.time(), 0.0);
    }

    #[test]
    fn global_regrids_build_a_properly_nested_hierarchy() {
        let mut sim = ball_sim(2);
        let sync = LevelSynchronizer::new(&sim.config);

        sim.global_regrid(&sync, 0);
        assert_eq!(sim.levels.len(), 2);

        sim.global_regrid(&sync, 0);
        assert_eq!(sim.levels.len(), 3);

        for lev in 2..sim.levels.len() {
            let dim_parent = sim.config.dim_n(lev - 1);
            for b in sim.levels[lev].layout.boxes() {
                assert!(sim.levels[lev - 1].layout.covers_coarsened(
                    b,
                    sim.config.num_ghost,
                    dim_parent
                ));
            }
        }
    }

    #[test]
    fn a_regrid_rooted_above_the_coarse_level_keeps_coarser_layouts() {
        let mut sim = ball_sim(2);
        let sync = LevelSynchronizer::new(&sim.config);
        sim.global_regrid(&sync, 0);
        sim.global_regrid(&sync, 0);
        assert_eq!(sim.levels.len(), 3);

        let boxes_1 = sim.levels[1].layout.len();
        let points_1 = sim.levels[1].layout.num_points();
        let points_2 = sim.levels[2].layout.num_points();

        // a smaller tag ball shrinks level 2 but may not touch level 1
        sim.physics = Box::new(TagBall { radius: 0.05 });
        sim.global_regrid(&sync, 1);

        assert_eq!(sim.levels[1].layout.len(), boxes_1);
        assert_eq!(sim.levels[1].layout.num_points(), points_1);
        assert!(sim.levels[2].layout.num_points() < points_2);
    }

    #[test]
    fn a_level_with_no_tags_left_is_removed() {
        let mut sim = ball_sim(1);
        let sync = LevelSynchronizer::new(&sim.config);

        sim.global_regrid(&sync, 0);
        assert_eq!(sim.levels.len(), 2);

        sim.physics = Box::new(TagBall { radius: 0.0 });
        sim.global_regrid(&sync, 0);
        assert_eq!(sim.levels.len(), 1);
    }

    #[test]
    fn a_restart_seed_round_trips_through_a_file() {
        let sim = ball_sim(1);
        let seed = sim.restart_seed(&[0.0, 0.25]);
        let path = std::env::temp_dir().join("subgrid-restart-seed-test.cbor");

        seed.write(&path).unwrap();
        let back = RestartSeed::read(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(back.istep, seed.istep);
        assert_eq!(back.blocking_factor, seed.blocking_factor);
        assert_eq!(back.last_regrid_time, seed.last_regrid_time);
    }

    #[test]
    fn a_mismatched_blocking_factor_forces_a_global_regrid() {
        let mut sim = ball_sim(1);
        let seed = RestartSeed {
            time: 1.0,
            istep: 4,
            blocking_factor: 4,
            last_regrid_time: vec![0.0, 0.0],
        };
        sim.apply_restart(&seed);

        assert!(sim.config.force_global_regrid_at_restart);
        assert_eq!(sim.levels[0].istep, 4);
        assert_eq!(sim.time(), 1.0);
    }
}
