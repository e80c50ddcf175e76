use log::debug;

use crate::config::Config;
use crate::integrator::Integrator;
use crate::layout::Layout;
use crate::level::{FieldState, Level, LevelSlot};
use crate::local_regrid::LocalRegrid;
use crate::scheduler::RegridScheduler;
use crate::sim::Sim;
use crate::synchronizer::LevelSynchronizer;

/**
 * Drives the recursive, subcycled advance of the level hierarchy. One call
 * to `step` moves the whole hierarchy forward by one coarse time step: each
 * level takes one step at its own rate, recursing twice into the level
 * above it, synchronizing fine data back down when the clocks meet, and
 * performing whatever regrids were scheduled along the way.
 */
pub struct TimeStepper {
    pub local_regrid: LocalRegrid,
    pub scheduler: RegridScheduler,
    pub sync: LevelSynchronizer,
    integrator: Box<dyn Integrator>,
    regrid_dt: Vec<f64>,
    last_regrid_time: Vec<f64>,
}




// ============================================================================
impl TimeStepper {
    pub fn new(config: &Config, num_ranks: usize, integrator: Box<dyn Integrator>) -> Self {
        let regrid_dt = (0..=config.max_level)
            .map(|lev| config.regrid_interval as f64 * config.dt(lev))
            .collect();
        Self {
            local_regrid: LocalRegrid::new(num_ranks),
            scheduler: RegridScheduler::new(),
            sync: LevelSynchronizer::new(config),
            integrator,
            regrid_dt,
            last_regrid_time: vec![config.t_start; config.max_level + 1],
        }
    }

    /// The per-level times of the most recent regrids, for restart seeds.
    pub fn last_regrid_time(&self) -> &[f64] {
        &self.last_regrid_time
    }

    pub fn restore_regrid_times(&mut self, times: &[f64]) {
        for (mine, theirs) in self.last_regrid_time.iter_mut().zip(times) {
            *mine = *theirs
        }
    }

    /// Advance the whole hierarchy by one coarse step.
    pub fn step(&mut self, sim: &mut Sim) {
        self.advance(sim, 0);
        sim.synchronize_times();
    }

    fn advance(&mut self, sim: &mut Sim, lev: usize) {
        if sim.config.shadow_hierarchy {
            self.schedule_regrid(sim, lev);
        } else {
            self.no_shadow_regrid(sim, lev);
        }
        self.advance_level(sim, lev);

        if lev + 1 < sim.levels.len() {
            self.advance(sim, lev + 1);
            self.advance(sim, lev + 1);
        }
        self.synchronize_levels(sim, lev);
        self.do_regrid_if_scheduled(sim, lev);
    }

    /**
     * Take one step of a single level: rotate the state pair, fill the
     * ghost cells of what is now the old state, and integrate into the new.
     */
    fn advance_level(&self, sim: &mut Sim, lev: usize) {
        let dt = sim.config.dt(lev);
        let dx = sim.config.dx(lev);

        sim.levels[lev].swap_states();

        let mut old = std::mem::replace(&mut sim.levels[lev].old_state, FieldState::empty(0.0));
        self.sync.fill_intermediate_patch(sim, LevelSlot::Level(lev), &mut old);
        sim.levels[lev].old_state = old;

        let physics = sim.physics.as_ref();
        let level = &mut sim.levels[lev];
        self.integrator.integrate(
            physics,
            &level.old_state,
            &mut level.new_state,
            lev as i32,
            dt,
            dx,
        );
        level.istep += 1;
    }

    /**
     * Decide whether a regrid rooted at this level should happen at the end
     * of the step about to be taken, and if so put it on the schedule. At
     * the coarse level this is also the moment the shadow hierarchy comes
     * into existence, so that it reaches the regrid instant alongside the
     * coarse level itself.
     */
    fn schedule_regrid(&mut self, sim: &mut Sim, lev: usize) {
        let time = sim.levels[lev].time();
        let dt = sim.config.dt(lev);

        if self.scheduler.need_truncation_error(lev, time + dt) {
            return;
        }
        if lev >= sim.config.max_level {
            return;
        }
        if lev > 0 && sim.levels[lev].istep % 2 == 0 {
            // a child regrid must land on a parent sync point
            return;
        }
        if lev == 0 && !sim.levels[0].old_state.time.is_finite() {
            // no earlier state to seed a shadow from yet
            return;
        }
        // the opportunity after the one being considered; skipping this one
        // must not let the level overshoot its regrid interval
        let t_next = time + if lev > 0 { 3.0 * dt } else { 2.0 * dt };
        if !self.local_regrid.wants_global(lev)
            && t_next <= self.last_regrid_time[lev] + self.regrid_dt[lev]
        {
            return;
        }
        if lev == sim.finest_level() && !sim.physics.can_create_level(lev + 1, t_next) {
            return;
        }
        debug!("scheduling a regrid of levels {}.. at t = {:.6}", lev, time + dt);
        self.scheduler.schedule(lev, time + dt);

        if lev == 0 {
            self.create_shadow(sim);
        }
    }

    /**
     * The regrid policy for runs without a shadow hierarchy: every level
     * regrids immediately at its own cadence, from the physics tags alone,
     * instead of scheduling a step ahead for truncation errors.
     */
    fn no_shadow_regrid(&mut self, sim: &mut Sim, lev: usize) {
        let time = sim.levels[lev].time();
        let dt = sim.config.dt(lev);

        if lev >= sim.config.max_level {
            return;
        }
        if !self.local_regrid.wants_global(lev)
            && time + dt <= self.last_regrid_time[lev] + self.regrid_dt[lev]
        {
            return;
        }
        if lev == sim.finest_level() && !sim.physics.can_create_level(lev + 1, time + dt) {
            return;
        }
        self.perform_regrid(sim, lev, time);
    }

    /**
     * Build the shadow: the coarse level's previous state, coarsened by
     * two, advanced in a single double-length step to the instant the
     * scheduled regrid will compare it at.
     */
    fn create_shadow(&self, sim: &mut Sim) {
        let num_fields = sim.config.num_fields;
        let num_ghost = sim.config.num_ghost;
        let boxes = sim.levels[0]
            .layout
            .boxes()
            .iter()
            .map(|b| b.coarsen(2))
            .collect();
        let layout = Layout::from_boxes(boxes, sim.comm.size());
        let old_state = sim.levels[0].old_state.coarsened(num_ghost);
        let new_state = FieldState::from_layout(&layout, num_fields, num_ghost, old_state.time);

        let mut shadow = Level {
            index: 0,
            layout,
            new_state,
            old_state,
            istep: 0,
            contains_truncation_errors: false,
        };
        self.sync
            .fill_intermediate_patch(sim, LevelSlot::Shadow, &mut shadow.old_state);
        self.integrator.integrate(
            sim.physics.as_ref(),
            &shadow.old_state,
            &mut shadow.new_state,
            -1,
            2.0 * sim.config.dt(0),
            2.0 * sim.config.dx(0),
        );
        sim.shadow = Some(shadow);
    }

    /**
     * After a level and its whole subtree have reached the same instant,
     * carry fine data back down: a truncation error estimate where one is
     * about to be consumed by a regrid (it applies the restriction as a
     * side effect), the plain average otherwise. The coarse level compares
     * against its shadow the same way.
     */
    fn synchronize_levels(&mut self, sim: &mut Sim, lev: usize) {
        let t = sim.levels[lev].time();

        if lev + 1 < sim.levels.len() {
            if self.scheduler.need_truncation_error(lev + 1, t) {
                self.sync.compute_truncation_errors(sim, lev + 1);
            } else {
                self.sync.average_down_to(sim, lev);
            }
        }
        if lev == 0 && self.scheduler.need_truncation_error(0, t) {
            self.sync.compute_truncation_errors(sim, 0);
        }
    }

    fn do_regrid_if_scheduled(&mut self, sim: &mut Sim, lev: usize) {
        let t = sim.levels[lev].time();

        if !self.scheduler.do_regrid(lev, t) {
            return;
        }
        self.perform_regrid(sim, lev, t);
        self.scheduler.did_regrid(t);
    }

    fn perform_regrid(&mut self, sim: &mut Sim, lev: usize, t: f64) {
        if !self.local_regrid.attempt_regrid(sim, &self.sync, lev) {
            sim.global_regrid(&self.sync, lev);
            self.local_regrid.note_global_regrid(sim, lev);
        }
        for l in lev..sim.levels.len().min(self.last_regrid_time.len()) {
            self.last_regrid_time[l] = t
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::TimeStepper;
    use crate::config::Config;
    use crate::index_space::range3d;
    use crate::integrator::ForwardEuler;
    use crate::layout::Layout;
    use crate::level::Level;
    use crate::message::comm::NullCommunicator;
    use crate::patch::Patch;
    use crate::scheduler::times_match;
    use crate::sim::{Physics, Sim};

    /// A field that decays in place and wants refinement wherever it is
    /// still large.
    struct DecayingBlob;

    impl Physics for DecayingBlob {
        fn rhs(
            &self,
            deriv: &mut [f64],
            patch: &Patch,
            index: (i64, i64, i64),
            _time: f64,
            _level: i32,
            _dx: f64,
        ) {
            deriv[0] = -0.1 * patch.get(index, 0)
        }

        fn tag_cell(
            &self,
            patch: &Patch,
            index: (i64, i64, i64),
            _time: f64,
            _level: usize,
        ) -> bool {
            patch.get(index, 0) > 0.5
        }

        fn initial(&self, slice: &mut [f64], index: (i64, i64, i64), dx: f64) {
            let x = (index.0 as f64 + 0.5) * dx - 0.5;
            let y = (index.1 as f64 + 0.5) * dx - 0.5;
            let z = (index.2 as f64 + 0.5) * dx - 0.5;
            let r2 = x * x + y * y + z * z;
            slice[0] = (-r2 / 0.02).exp()
        }
    }

    fn blob_sim() -> Sim {
        let config = Config {
            coarse_size: 16,
            patch_size: 16,
            blocking_factor: 4,
            max_level: 1,
            dt_coarse: 0.25,
            regrid_interval: 2,
            ..Config::default()
        };
        Sim::new(config, Box::new(DecayingBlob), Box::new(NullCommunicator)).unwrap()
    }

    #[test]
    fn a_coarse_step_leaves_all_level_clocks_aligned() {
        let mut sim = blob_sim();
        let mut stepper = TimeStepper::new(&sim.config, 1, Box::new(ForwardEuler));

        for _ in 0..6 {
            stepper.step(&mut sim);
        }
        let t0 = sim.time();
        assert!(times_match(t0, 6.0 * 0.25));
        for level in &sim.levels {
            assert_eq!(level.time(), t0);
        }
    }

    #[test]
    fn the_first_regrid_is_global_and_uses_the_shadow() {
        let mut sim = blob_sim();
        let mut stepper = TimeStepper::new(&sim.config, 1, Box::new(ForwardEuler));

        for _ in 0..4 {
            stepper.step(&mut sim);
        }
        assert_eq!(sim.levels.len(), 2);
        assert!(sim.stats.global_regrids >= 1);
        assert!(sim.stats.truncation_estimates >= 1);
    }

    #[test]
    fn a_settled_hierarchy_stops_paying_for_global_regrids() {
        let mut sim = blob_sim();
        let mut stepper = TimeStepper::new(&sim.config, 1, Box::new(ForwardEuler));

        for _ in 0..4 {
            stepper.step(&mut sim);
        }
        let globals_after_startup = sim.stats.global_regrids;

        for _ in 0..8 {
            stepper.step(&mut sim);
        }
        // the blob only shrinks, so later regrid work is handled locally
        assert_eq!(sim.stats.global_regrids, globals_after_startup);
        assert_eq!(sim.levels.len(), 2);
    }

    #[test]
    fn without_a_shadow_the_coarse_level_regrids_from_tags_alone() {
        let mut sim = blob_sim();
        sim.config.shadow_hierarchy = false;
        let mut stepper = TimeStepper::new(&sim.config, 1, Box::new(ForwardEuler));

        for _ in 0..4 {
            stepper.step(&mut sim);
        }
        assert_eq!(sim.levels.len(), 2);
        assert!(sim.shadow.is_none());
        assert_eq!(sim.stats.truncation_estimates, 0);
    }

    #[test]
    fn without_a_shadow_every_level_regrids_at_its_own_cadence() {
        let mut sim = blob_sim();
        sim.config.shadow_hierarchy = false;
        sim.config.max_level = 2;
        let mut stepper = TimeStepper::new(&sim.config, 1, Box::new(ForwardEuler));

        for _ in 0..8 {
            stepper.step(&mut sim);
        }
        // level 1 regrids on its own and brings level 2 into existence,
        // still without ever estimating truncation errors
        assert_eq!(sim.levels.len(), 3);
        assert!(sim.shadow.is_none());
        assert_eq!(sim.stats.truncation_estimates, 0);
    }

    /// Decays like `DecayingBlob` but never tags a cell by value, so any
    /// refinement must come from the truncation error estimates.
    struct QuietBlob;

    impl Physics for QuietBlob {
        fn rhs(
            &self,
            deriv: &mut [f64],
            patch: &Patch,
            index: (i64, i64, i64),
            _time: f64,
            _level: i32,
            _dx: f64,
        ) {
            deriv[0] = -0.1 * patch.get(index, 0)
        }

        fn tag_cell(
            &self,
            _patch: &Patch,
            _index: (i64, i64, i64),
            _time: f64,
            _level: usize,
        ) -> bool {
            false
        }

        fn initial(&self, slice: &mut [f64], index: (i64, i64, i64), dx: f64) {
            let x = (index.0 as f64 + 0.5) * dx - 0.5;
            let y = (index.1 as f64 + 0.5) * dx - 0.5;
            let z = (index.2 as f64 + 0.5) * dx - 0.5;
            let r2 = x * x + y * y + z * z;
            slice[0] = (-r2 / 0.02).exp()
        }
    }

    #[test]
    fn refinement_can_come_from_truncation_errors_alone() {
        let config = Config {
            coarse_size: 16,
            patch_size: 16,
            blocking_factor: 4,
            max_level: 1,
            dt_coarse: 0.25,
            regrid_interval: 2,
            te_crit: 1e-6,
            ..Config::default()
        };
        let mut sim = Sim::new(config, Box::new(QuietBlob), Box::new(NullCommunicator)).unwrap();
        let mut stepper = TimeStepper::new(&sim.config, 1, Box::new(ForwardEuler));

        stepper.step(&mut sim);
        stepper.step(&mut sim);

        // the second step schedules the regrid, estimates the error against
        // the shadow exactly once, and consumes both at t = 0.5
        assert_eq!(sim.stats.truncation_estimates, 1);
        assert_eq!(sim.stats.global_regrids, 1);
        assert_eq!(sim.levels.len(), 2);
        assert!(sim.shadow.is_none());
        assert!(!sim.levels[0].contains_truncation_errors);
    }

    #[test]
    fn a_fine_level_regrid_is_scheduled_before_its_interval_can_lapse() {
        let config = Config {
            coarse_size: 16,
            patch_size: 16,
            blocking_factor: 4,
            max_level: 2,
            dt_coarse: 0.25,
            regrid_interval: 3,
            ..Config::default()
        };
        let mut sim = Sim::new(config, Box::new(DecayingBlob), Box::new(NullCommunicator)).unwrap();
        let mut stepper = TimeStepper::new(&sim.config, 1, Box::new(ForwardEuler));

        let layout = Layout::from_boxes(vec![range3d(4..8, 4..8, 4..8)], 1);
        let mut fine = Level::new(1, layout, 1, 2, 0.125);
        fine.istep = 1;
        sim.levels.push(fine);

        // level 1 sits at t = 0.125 with a 0.375 interval; the opportunity
        // after this one is at t = 0.5, too late, so this one must be taken
        stepper.schedule_regrid(&mut sim, 1);
        assert!(stepper.scheduler.do_regrid(1, 0.25));
    }

    #[test]
    #[should_panic(expected = "truncation errors at level 0 require a shadow")]
    fn a_scheduled_coarse_regrid_without_a_shadow_is_fatal() {
        let mut sim = blob_sim();
        let mut stepper = TimeStepper::new(&sim.config, 1, Box::new(ForwardEuler));

        stepper.scheduler.schedule(0, sim.time());
        stepper.synchronize_levels(&mut sim, 0);
    }
}
