use clap::Parser;
use log::info;

use subgrid::config::Config;
use subgrid::integrator::ForwardEuler;
use subgrid::message::comm::NullCommunicator;
use subgrid::patch::Patch;
use subgrid::sim::{Physics, RestartSeed, Sim};
use subgrid::time_stepper::TimeStepper;

/**
 * Relax a hot spot by explicit diffusion, with the refined levels tracking
 * the part of the domain that is still hot. A demonstration of the stepping
 * and regrid machinery more than of numerics.
 */
#[derive(Debug, Parser)]
#[clap(version, about = "diffuse a hot spot while refinement tracks it")]
struct Opts {
    /// Cells along each axis of the coarse level
    #[clap(long, default_value_t = 32)]
    num_cells: usize,

    /// Side length of a refinement block in cells
    #[clap(long, default_value_t = 4)]
    block_size: usize,

    /// Side length of the coarse-level patches in cells
    #[clap(long, default_value_t = 16)]
    patch_size: usize,

    /// Deepest refinement level
    #[clap(long, default_value_t = 2)]
    max_level: usize,

    /// Time to run until
    #[clap(long, default_value_t = 0.05)]
    end_time: f64,

    /// Diffusion coefficient
    #[clap(long, default_value_t = 1.0)]
    diffusivity: f64,

    /// Fraction of the explicit stability limit to step at
    #[clap(long, default_value_t = 0.4)]
    cfl: f64,

    /// Temperature above which a cell is kept refined
    #[clap(long, default_value_t = 0.1)]
    tag_threshold: f64,

    /// Coarse steps between progress reports
    #[clap(long, default_value_t = 10)]
    fold: u64,

    /// Disable the shadow hierarchy and regrid from tags alone
    #[clap(long)]
    no_shadow: bool,

    /// Resume the run clock from an earlier seed file
    #[clap(long)]
    restart: Option<std::path::PathBuf>,

    /// Where to leave the seed file for a later restart
    #[clap(long, default_value = "relax.seed.cbor")]
    seed_file: std::path::PathBuf,
}




// ============================================================================
struct HotSpot {
    diffusivity: f64,
    tag_threshold: f64,
    width: f64,
}

impl Physics for HotSpot {
    fn rhs(
        &self,
        deriv: &mut [f64],
        patch: &Patch,
        index: (i64, i64, i64),
        _time: f64,
        _level: i32,
        dx: f64,
    ) {
        let (i, j, k) = index;
        let u = |di, dj, dk| patch.get((i + di, j + dj, k + dk), 0);
        let lap = u(1, 0, 0) + u(-1, 0, 0) + u(0, 1, 0) + u(0, -1, 0) + u(0, 0, 1) + u(0, 0, -1)
            - 6.0 * u(0, 0, 0);
        deriv[0] = self.diffusivity * lap / (dx * dx)
    }

    fn tag_cell(&self, patch: &Patch, index: (i64, i64, i64), _time: f64, _level: usize) -> bool {
        patch.get(index, 0) > self.tag_threshold
    }

    fn initial(&self, slice: &mut [f64], index: (i64, i64, i64), dx: f64) {
        let x = (index.0 as f64 + 0.5) * dx - 0.5;
        let y = (index.1 as f64 + 0.5) * dx - 0.5;
        let z = (index.2 as f64 + 0.5) * dx - 0.5;
        let r2 = x * x + y * y + z * z;
        slice[0] = (-r2 / (self.width * self.width)).exp()
    }
}




// ============================================================================
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = Opts::parse();
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()?;

    // the finest level is the one pinned to the explicit stability limit;
    // each coarser level then steps further inside its own limit
    let dx_fine = 1.0 / (opts.num_cells << opts.max_level) as f64;
    let dt_fine = opts.cfl * dx_fine * dx_fine / (6.0 * opts.diffusivity);
    let dt_coarse = dt_fine * (1 << opts.max_level) as f64;

    let config = Config {
        coarse_size: opts.num_cells,
        blocking_factor: opts.block_size,
        patch_size: opts.patch_size,
        max_level: opts.max_level,
        dt_coarse,
        shadow_hierarchy: !opts.no_shadow,
        ..Config::default()
    };
    let physics = HotSpot {
        diffusivity: opts.diffusivity,
        tag_threshold: opts.tag_threshold,
        width: 0.1,
    };
    let mut sim = Sim::new(config, Box::new(physics), Box::new(NullCommunicator))?;
    let mut stepper = TimeStepper::new(&sim.config, 1, Box::new(ForwardEuler));

    if let Some(path) = &opts.restart {
        let seed = RestartSeed::read(path)?;
        stepper.restore_regrid_times(&seed.last_regrid_time);
        sim.apply_restart(&seed);
        info!("resumed run clock from {} at t = {:.6}", path.display(), sim.time());
    }

    while sim.time() < opts.end_time {
        stepper.step(&mut sim);

        if sim.levels[0].istep % opts.fold == 0 {
            let cells: u64 = sim.levels.iter().map(|l| l.layout.num_points()).sum();
            info!(
                "[{}] t = {:.6} levels = {} cells = {}",
                sim.levels[0].istep,
                sim.time(),
                sim.levels.len(),
                cells,
            );
        }
    }
    info!(
        "done: {} global regrids, {} local, {} deferred, {} truncation error estimates",
        sim.stats.global_regrids,
        sim.stats.local_regrids,
        sim.stats.deferred_regrids,
        sim.stats.truncation_estimates,
    );
    sim.restart_seed(stepper.last_regrid_time()).write(&opts.seed_file)?;
    info!("wrote restart seed to {}", opts.seed_file.display());
    Ok(())
}
