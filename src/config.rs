use std::error;
use std::fmt;

use serde::{Deserialize, Serialize};

/**
 * How ghost and newly created cells are filled from a coarser level.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterpolationKind {
    /// Copy the overlying coarse value into each fine cell.
    PiecewiseConstant,
}

/**
 * Static parameters of a simulation run. These are fixed once the run
 * starts; the only one checked against a restart file is the blocking
 * factor, because a changed blocking factor invalidates saved block indexes.
 */
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Number of cells along each axis of the coarse level.
    pub coarse_size: usize,

    /// Deepest refinement level that may be created. Level 0 is the coarse
    /// level.
    pub max_level: usize,

    /// Number of field components stored per cell.
    pub num_fields: usize,

    /// Ghost cell width around each patch.
    pub num_ghost: i64,

    /// Side length of a refinement block in cells. Every patch edge is a
    /// multiple of this.
    pub blocking_factor: usize,

    /// Side length of the patches the coarse level is decomposed into. Must
    /// be a multiple of the blocking factor and divide the coarse size.
    pub patch_size: usize,

    /// Time at the start of the run.
    pub t_start: f64,

    /// Time step of the coarse level. Finer levels step at half the rate of
    /// the level above.
    pub dt_coarse: f64,

    /// Whether to maintain a half-resolution shadow of the coarse level for
    /// truncation error estimates.
    pub shadow_hierarchy: bool,

    /// Number of coarse-level steps between regrid opportunities.
    pub regrid_interval: u64,

    /// Buffer width, in cells, around a tagged cell that must also be
    /// covered by refinement.
    pub n_error_buf: i64,

    /// Local regrids are abandoned for a global one when the level volume
    /// would grow by more than this factor.
    pub volume_threshold_strong: f64,

    /// Weaker growth bound applied to the cumulative growth since the last
    /// global regrid.
    pub volume_threshold_weak: f64,

    /// Number of local regrids after which the next regrid is forced global.
    pub max_local_regrids: usize,

    /// Force a global regrid on the first opportunity after a restart.
    pub force_global_regrid_at_restart: bool,

    /// Truncation error magnitude above which a cell is tagged.
    pub te_crit: f64,

    /// How fine cells are filled from coarse ones.
    pub interpolation: InterpolationKind,

    /// Extra cells of margin used when estimating whether refinement could
    /// reach a candidate block before the next regrid opportunity.
    pub delay_buffer_cells: i64,
}




// ============================================================================
impl Config {
    /// Cells along each axis of the given level.
    pub fn dim_n(&self, level: usize) -> i64 {
        (self.coarse_size << level) as i64
    }

    /// Time step of the given level.
    pub fn dt(&self, level: usize) -> f64 {
        self.dt_coarse / (1 << level) as f64
    }

    /// Cell spacing of the given level, on a unit domain.
    pub fn dx(&self, level: usize) -> f64 {
        1.0 / self.dim_n(level) as f64
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coarse_size == 0 || self.coarse_size % self.blocking_factor != 0 {
            return Err(ConfigError::BadCoarseSize(
                self.coarse_size,
                self.blocking_factor,
            ));
        }
        if self.blocking_factor < 2 || self.blocking_factor % 2 != 0 {
            return Err(ConfigError::BadBlockingFactor(self.blocking_factor));
        }
        if self.patch_size % self.blocking_factor != 0 || self.coarse_size % self.patch_size != 0 {
            return Err(ConfigError::BadPatchSize(
                self.patch_size,
                self.blocking_factor,
            ));
        }
        if self.num_fields == 0 {
            return Err(ConfigError::NoFields);
        }
        if self.num_ghost < 1 {
            return Err(ConfigError::BadGhostWidth(self.num_ghost));
        }
        if self.dt_coarse <= 0.0 {
            return Err(ConfigError::BadTimeStep(self.dt_coarse));
        }
        if self.volume_threshold_strong < 1.0 || self.volume_threshold_weak < 1.0 {
            return Err(ConfigError::BadVolumeThreshold(
                self.volume_threshold_strong,
                self.volume_threshold_weak,
            ));
        }
        Ok(())
    }
}


impl Default for Config {
    fn default() -> Self {
        Self {
            coarse_size: 64,
            max_level: 2,
            num_fields: 1,
            num_ghost: 2,
            blocking_factor: 8,
            patch_size: 32,
            t_start: 0.0,
            dt_coarse: 1.0,
            shadow_hierarchy: true,
            regrid_interval: 2,
            n_error_buf: 2,
            volume_threshold_strong: 1.1,
            volume_threshold_weak: 1.05,
            max_local_regrids: 10,
            force_global_regrid_at_restart: false,
            te_crit: 1e-3,
            interpolation: InterpolationKind::PiecewiseConstant,
            delay_buffer_cells: 4,
        }
    }
}




// ============================================================================
#[derive(Debug)]

/**
 * Error to represent an inconsistent simulation configuration.
 */
pub enum ConfigError {
    BadCoarseSize(usize, usize),
    BadBlockingFactor(usize),
    BadPatchSize(usize, usize),
    NoFields,
    BadGhostWidth(i64),
    BadTimeStep(f64),
    BadVolumeThreshold(f64, f64),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        use ConfigError::*;

        match self {
            BadCoarseSize(n, bf) => writeln!(
                fmt,
                "coarse size {} is not a positive multiple of the blocking factor {}",
                n, bf
            ),
            BadBlockingFactor(bf) => {
                writeln!(fmt, "blocking factor {} is not an even number >= 2", bf)
            }
            BadPatchSize(ps, bf) => writeln!(
                fmt,
                "patch size {} must be a multiple of the blocking factor {} and divide the coarse size",
                ps, bf
            ),
            NoFields => writeln!(fmt, "at least one field component is required"),
            BadGhostWidth(ng) => writeln!(fmt, "ghost width {} is not positive", ng),
            BadTimeStep(dt) => writeln!(fmt, "coarse time step {} is not positive", dt),
            BadVolumeThreshold(s, w) => writeln!(
                fmt,
                "volume thresholds ({}, {}) must both be at least 1",
                s, w
            ),
        }
    }
}

impl error::Error for ConfigError {}




// ============================================================================
#[cfg(test)]
mod test {

    use super::Config;

    #[test]
    fn the_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn a_coarse_size_off_the_blocking_factor_is_rejected() {
        let config = Config {
            coarse_size: 60,
            blocking_factor: 8,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn level_sizes_and_steps_scale_by_powers_of_two() {
        let config = Config::default();
        assert_eq!(config.dim_n(0), 64);
        assert_eq!(config.dim_n(2), 256);
        assert_eq!(config.dt(1), 0.5);
        assert_eq!(config.dx(0), 1.0 / 64.0);
    }
}
