use serde::{Deserialize, Serialize};

use crate::index_space::IndexSpace;




/**
 * A patch is a mapping from a rectangular subset of a level's index space to
 * associated field values. The mapping is backed by a single row-major array
 * of data holding `num_fields` components per cell, over the patch interior
 * plus a margin of `num_ghost` cells on every side. Ghost cells duplicate
 * neighbor or coarser-level data so that local stencils never need to reach
 * off-patch.
 */
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Patch {
    area: IndexSpace,
    num_fields: usize,
    num_ghost: i64,
    data: Vec<f64>,
}




// ============================================================================
impl Patch {


    /**
     * Generate a zero-filled patch covering the given interior area.
     */
    pub fn zeros(area: IndexSpace, num_fields: usize, num_ghost: i64) -> Self {
        let data = vec![0.0; area.extend_all(num_ghost).len() * num_fields];
        Self {
            area,
            num_fields,
            num_ghost,
            data,
        }
    }


    /**
     * Generate a patch whose values (interior and ghost) are defined from a
     * closure writing one cell's field slice at a time.
     */
    pub fn from_slice_function<F>(area: IndexSpace, num_fields: usize, num_ghost: i64, f: F) -> Self
    where
        F: Fn((i64, i64, i64), &mut [f64])
    {
        let mut patch = Self::zeros(area, num_fields, num_ghost);
        let extended = patch.extended_space();

        for index in extended.iter() {
            let s = patch.num_fields;
            let n = extended.row_major_offset(index) * s;
            f(index, &mut patch.data[n..n + s]);
        }
        patch
    }


    /**
     * Return the interior (valid) region of this patch.
     */
    pub fn index_space(&self) -> &IndexSpace {
        &self.area
    }


    /**
     * Return the full region backed by memory, interior plus ghost margin.
     */
    pub fn extended_space(&self) -> IndexSpace {
        self.index_space().extend_all(self.num_ghost)
    }


    pub fn num_fields(&self) -> usize {
        self.num_fields
    }


    pub fn num_ghost(&self) -> i64 {
        self.num_ghost
    }


    /**
     * Return the field slice at the given index, which may lie in the ghost
     * margin.
     */
    pub fn get_slice(&self, index: (i64, i64, i64)) -> &[f64] {
        let n = self.extended_space().row_major_offset(index) * self.num_fields;
        &self.data[n..n + self.num_fields]
    }


    pub fn get_slice_mut(&mut self, index: (i64, i64, i64)) -> &mut [f64] {
        let s = self.num_fields;
        let n = self.extended_space().row_major_offset(index) * s;
        &mut self.data[n..n + s]
    }


    pub fn get(&self, index: (i64, i64, i64), field: usize) -> f64 {
        self.get_slice(index)[field]
    }


    pub fn set(&mut self, index: (i64, i64, i64), field: usize, value: f64) {
        self.get_slice_mut(index)[field] = value;
    }


    /**
     * Copy field values from another patch wherever the two interiors
     * overlap. Used to preserve already-refined data when a level's patch
     * set is rebuilt.
     */
    pub fn assign_overlap_from(&mut self, other: &Patch) {
        assert_eq!(self.num_fields, other.num_fields);

        if let Some(overlap) = self.index_space().intersect(other.index_space()) {
            for index in overlap.iter() {
                let src = other.get_slice(index).to_vec();
                self.get_slice_mut(index).copy_from_slice(&src);
            }
        }
    }


    /**
     * Visit every interior cell in row-major order together with its mutable
     * field slice.
     */
    pub fn for_each_mut<F>(&mut self, mut f: F)
    where
        F: FnMut((i64, i64, i64), &mut [f64])
    {
        let interior = self.index_space().clone();
        for index in interior.iter() {
            f(index, self.get_slice_mut(index))
        }
    }


    /**
     * Sample the given field at a coarser granularity: the value is the
     * conservative average over the `factor^3` child cells covered by the
     * coarse cell at `index` (measured in coarse ticks).
     */
    pub fn sample_coarsened(&self, index: (i64, i64, i64), field: usize, factor: i64) -> f64 {
        let mut sum = 0.0;
        for di in 0..factor {
            for dj in 0..factor {
                for dk in 0..factor {
                    sum += self.get(
                        (index.0 * factor + di,
                         index.1 * factor + dj,
                         index.2 * factor + dk),
                        field);
                }
            }
        }
        sum / (factor * factor * factor) as f64
    }
}
