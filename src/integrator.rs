use rayon::prelude::*;

use crate::level::FieldState;
use crate::sim::Physics;

/**
 * Advances one level's field state by a single time step. The old state has
 * its ghost cells filled before this is called, so implementations may read
 * stencil neighbors freely; they must write only patch interiors of the new
 * state. Level -1 denotes the shadow of the coarse level.
 */
pub trait Integrator: Send + Sync {
    fn integrate(
        &self,
        physics: &dyn Physics,
        old: &FieldState,
        new: &mut FieldState,
        level: i32,
        dt: f64,
        dx: f64,
    );
}




// ============================================================================
/**
 * First-order explicit update, patch-parallel: `new = old + dt * rhs(old)`.
 */
pub struct ForwardEuler;


impl Integrator for ForwardEuler {
    fn integrate(
        &self,
        physics: &dyn Physics,
        old: &FieldState,
        new: &mut FieldState,
        level: i32,
        dt: f64,
        dx: f64,
    ) {
        let time = old.time;

        new.patches
            .par_iter_mut()
            .zip(&old.patches)
            .for_each(|(new_p, old_p)| {
                let num_fields = old_p.num_fields();
                let mut deriv = vec![0.0; num_fields];

                new_p.for_each_mut(|index, slice| {
                    physics.rhs(&mut deriv, old_p, index, time, level, dx);
                    for field in 0..num_fields {
                        slice[field] = old_p.get(index, field) + dt * deriv[field]
                    }
                })
            });
        new.time = time + dt;
    }
}
