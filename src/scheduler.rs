/**
 * One pending regrid: every level at or above `lowest_level` will be
 * regridded when its clock reaches `t`. Times are compared with a relative
 * tolerance because levels reach the same instant through different numbers
 * of half-sized steps.
 */
#[derive(Clone, Copy, Debug)]
struct ScheduledRegrid {
    lowest_level: usize,
    t: f64,
}


impl ScheduledRegrid {
    fn matches(&self, t: f64) -> bool {
        times_match(self.t, t)
    }
}


/**
 * Whether two level clocks refer to the same instant. Levels reach a shared
 * instant through different numbers of half-sized steps, so exact equality
 * is too strict; the tolerance is relative to the magnitude of the times.
 */
pub fn times_match(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-12 * a.abs().max(b.abs()).max(1.0)
}




// ============================================================================
/**
 * Tracks regrids that have been decided on but not yet performed. A regrid
 * at time t is owned by the lowest scheduled level; finer levels reaching t
 * contribute truncation error estimates but do not regrid themselves.
 */
#[derive(Clone, Debug, Default)]
pub struct RegridScheduler {
    schedule: Vec<ScheduledRegrid>,
}


impl RegridScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * Schedule a regrid of levels `lowest_level..` at time t. If a regrid
     * is already scheduled at t, the two collapse into one owned by the
     * lower of the two levels.
     */
    pub fn schedule(&mut self, lowest_level: usize, t: f64) {
        for entry in &mut self.schedule {
            if entry.matches(t) {
                entry.lowest_level = entry.lowest_level.min(lowest_level);
                return;
            }
        }
        self.schedule.push(ScheduledRegrid { lowest_level, t })
    }

    /// Whether the given level should perform the regrid at time t. Only
    /// the owning (lowest) level does.
    pub fn do_regrid(&self, level: usize, t: f64) -> bool {
        self.schedule
            .iter()
            .any(|entry| entry.matches(t) && entry.lowest_level == level)
    }

    /// Whether the given level needs truncation error estimates at time t,
    /// which it does if any level at or below it regrids then.
    pub fn need_truncation_error(&self, level: usize, t: f64) -> bool {
        self.schedule
            .iter()
            .any(|entry| entry.matches(t) && level >= entry.lowest_level)
    }

    /// Discharge the regrid scheduled at time t.
    pub fn did_regrid(&mut self, t: f64) {
        self.schedule.retain(|entry| !entry.matches(t))
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::RegridScheduler;

    #[test]
    fn two_schedules_at_one_time_collapse_to_the_lowest_level() {
        let mut scheduler = RegridScheduler::new();
        scheduler.schedule(2, 0.75);
        scheduler.schedule(1, 0.75 + 1e-15);

        assert!(scheduler.do_regrid(1, 0.75));
        assert!(!scheduler.do_regrid(2, 0.75));
        assert!(scheduler.need_truncation_error(2, 0.75));
        assert!(scheduler.need_truncation_error(1, 0.75));
        assert!(!scheduler.need_truncation_error(0, 0.75));
    }

    #[test]
    fn a_discharged_regrid_no_longer_triggers() {
        let mut scheduler = RegridScheduler::new();
        scheduler.schedule(0, 0.5);
        scheduler.schedule(1, 1.0);
        scheduler.did_regrid(0.5);

        assert!(!scheduler.do_regrid(0, 0.5));
        assert!(scheduler.do_regrid(1, 1.0));
    }
}
