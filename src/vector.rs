//! Allocation and view-factory for per-patch cell data on a `Domain`.
//!
//! The managed mode allocates one contiguous buffer across all local
//! patches, many field components, and a ghost margin shared by the whole
//! `Domain`. The unmanaged mode exists for drivers that already own
//! per-patch buffers (e.g. handed in by an octree library) and just want
//! `Vector`'s view factory over them.

use crate::patch_info::PatchInfo;
use crate::view::{View, ViewMut};

/// Flat offset, in elements, from a patch's ghost-inclusive block start to
/// its logical index `0` on every spatial axis — the same stride math
/// `View::from_patch` uses internally, computed here so the pointer handed
/// to `View`/`ViewMut` is already past the lower ghost margin as their
/// contract requires.
fn margin_offset(ns: &[usize], num_components: usize, num_ghost_cells: usize) -> usize {
    let ndims = ns.len();
    let mut extents = Vec::with_capacity(ndims + 1);
    extents.push(num_components);
    extents.extend(ns.iter().map(|n| n + 2 * num_ghost_cells));

    let mut strides = vec![0isize; ndims + 1];
    let mut acc: isize = 1;
    for axis in (0..=ndims).rev() {
        strides[axis] = acc;
        acc *= extents[axis] as isize;
    }

    strides[1..].iter().map(|&s| s as usize * num_ghost_cells).sum()
}

enum Storage {
    Managed { ndims: usize, num_components: usize, num_ghost_cells: usize, buffer: Vec<f64> },
    Unmanaged { ndims: usize, num_components: usize, num_ghost_cells: usize, bases: Vec<*mut f64> },
}

/// Owns (or borrows) the cell data for every local patch of a `Domain` and
/// hands out `View`/`ViewMut` windows into it.
pub struct Vector {
    storage: Storage,
    patch_lens: Vec<Vec<usize>>,
    patch_offsets: Vec<usize>,
}

unsafe impl Send for Vector {}
unsafe impl Sync for Vector {}

impl Vector {
    /// Allocates `num_local_patches * num_components * Π(n_i +
    /// 2*num_ghost_cells)` doubles in one contiguous buffer, zero-initialized.
    pub fn managed(patches: &[PatchInfo], num_components: usize, num_ghost_cells: usize) -> Self {
        let ndims = patches.first().map(|p| p.ndims()).unwrap_or(0);
        let patch_lens: Vec<Vec<usize>> = patches.iter().map(|p| p.ns.clone()).collect();

        let mut patch_offsets = Vec::with_capacity(patches.len());
        let mut total = 0usize;
        for ns in &patch_lens {
            patch_offsets.push(total);
            let cells: usize = ns.iter().map(|n| n + 2 * num_ghost_cells).product();
            total += cells * num_components;
        }

        Self {
            storage: Storage::Managed { ndims, num_components, num_ghost_cells, buffer: vec![0.0; total] },
            patch_lens,
            patch_offsets,
        }
    }

    /// Wraps externally-owned per-patch buffers. `bases[i]` must point at
    /// logical index `0` (past the lower ghost margin) of patch `i`, and
    /// must remain valid for the lifetime of this `Vector`.
    ///
    /// # Safety
    /// Every pointer in `bases` must be non-dangling, non-aliased with any
    /// other `Vector` over the same memory used mutably at the same time,
    /// and point at a buffer at least as large as `patch_lens[i]` implies.
    pub unsafe fn unmanaged(bases: Vec<*mut f64>, patch_lens: Vec<Vec<usize>>, num_components: usize, num_ghost_cells: usize) -> Self {
        let ndims = patch_lens.first().map(|ns| ns.len()).unwrap_or(0);
        let n = bases.len();
        Self {
            storage: Storage::Unmanaged { ndims, num_components, num_ghost_cells, bases },
            patch_lens,
            patch_offsets: vec![0; n],
        }
    }

    pub fn num_local_patches(&self) -> usize {
        self.patch_lens.len()
    }

    fn ndims(&self) -> usize {
        match &self.storage {
            Storage::Managed { ndims, .. } => *ndims,
            Storage::Unmanaged { ndims, .. } => *ndims,
        }
    }

    pub fn num_components(&self) -> usize {
        match &self.storage {
            Storage::Managed { num_components, .. } => *num_components,
            Storage::Unmanaged { num_components, .. } => *num_components,
        }
    }

    fn num_ghost_cells(&self) -> usize {
        match &self.storage {
            Storage::Managed { num_ghost_cells, .. } => *num_ghost_cells,
            Storage::Unmanaged { num_ghost_cells, .. } => *num_ghost_cells,
        }
    }

    fn base_ptr(&self, patch_index: usize) -> *const f64 {
        match &self.storage {
            Storage::Managed { buffer, num_components, num_ghost_cells, .. } => {
                let margin = margin_offset(&self.patch_lens[patch_index], *num_components, *num_ghost_cells);
                unsafe { buffer.as_ptr().add(self.patch_offsets[patch_index] + margin) }
            }
            Storage::Unmanaged { bases, .. } => bases[patch_index],
        }
    }

    fn base_ptr_mut(&mut self, patch_index: usize) -> *mut f64 {
        let margin = match &self.storage {
            Storage::Managed { num_components, num_ghost_cells, .. } => {
                Some(margin_offset(&self.patch_lens[patch_index], *num_components, *num_ghost_cells))
            }
            Storage::Unmanaged { .. } => None,
        };
        match &mut self.storage {
            Storage::Managed { buffer, .. } => unsafe {
                buffer.as_mut_ptr().add(self.patch_offsets[patch_index] + margin.unwrap())
            },
            Storage::Unmanaged { bases, .. } => bases[patch_index],
        }
    }

    /// A `(D+1)`-D view over patch `i`, indexed `[component, x, y, z]`.
    pub fn get_patch_view(&self, i: usize) -> View<'_, f64> {
        View::from_patch(self.base_ptr(i), &self.patch_lens[i], self.num_components(), self.num_ghost_cells())
    }

    pub fn get_patch_view_mut(&mut self, i: usize) -> ViewMut<'_, f64> {
        let ns = self.patch_lens[i].clone();
        let num_components = self.num_components();
        let num_ghost_cells = self.num_ghost_cells();
        ViewMut::from_patch(self.base_ptr_mut(i), &ns, num_components, num_ghost_cells)
    }

    /// A `D`-D view over a single component `c` of patch `i`.
    pub fn get_component_view(&self, c: usize, i: usize) -> View<'_, f64> {
        self.get_patch_view(i).drop_component_axis(c)
    }

    pub fn get_component_view_mut(&mut self, c: usize, i: usize) -> ViewMut<'_, f64> {
        let full = self.get_patch_view_mut(i);
        full.drop_component_axis_mut(c)
    }

    /// Disjoint, per-patch mutable views over every local patch, for
    /// parallel dispatch over rayon chunks. Built from raw per-patch base
    /// pointers computed up front, rather than by calling
    /// `get_patch_view_mut` in a loop, since the latter would need to
    /// reborrow `&mut self` once per patch.
    pub fn patch_views_mut(&mut self) -> Vec<ViewMut<'_, f64>> {
        let num_components = self.num_components();
        let num_ghost_cells = self.num_ghost_cells();
        let lens = self.patch_lens.clone();
        let offsets = &self.patch_offsets;

        let bases: Vec<*mut f64> = match &mut self.storage {
            Storage::Managed { buffer, .. } => {
                let ptr = buffer.as_mut_ptr();
                offsets
                    .iter()
                    .zip(&lens)
                    .map(|(&off, ns)| {
                        let margin = margin_offset(ns, num_components, num_ghost_cells);
                        unsafe { ptr.add(off + margin) }
                    })
                    .collect()
            }
            Storage::Unmanaged { bases, .. } => bases.clone(),
        };

        bases
            .into_iter()
            .zip(lens)
            .map(|(base, ns)| ViewMut::from_patch(base, &ns, num_components, num_ghost_cells))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn two_patches(ndims: usize) -> Vec<PatchInfo> {
        let mut a = PatchInfo::new(ndims);
        a.ns = vec![4; ndims];
        let mut b = PatchInfo::new(ndims);
        b.ns = vec![3; ndims];
        vec![a, b]
    }

    #[test]
    fn managed_vector_allocates_expected_size() {
        let patches = two_patches(2);
        let v = Vector::managed(&patches, 2, 1);
        // patch 0: 2 * (4+2)*(4+2) = 72, patch 1: 2*(3+2)*(3+2) = 50
        match &v.storage {
            Storage::Managed { buffer, .. } => assert_eq!(buffer.len(), 72 + 50),
            _ => panic!("expected managed storage"),
        }
    }

    #[test]
    fn patch_views_are_independent() {
        let patches = two_patches(2);
        let mut v = Vector::managed(&patches, 1, 1);
        {
            let mut view0 = v.get_patch_view_mut(0);
            *view0.get_mut(&[0, 0, 0]) = 42.0;
        }
        let view1 = v.get_patch_view(1);
        assert_eq!(*view1.get(&[0, 0, 0]), 0.0);
        let view0 = v.get_patch_view(0);
        assert_eq!(*view0.get(&[0, 0, 0]), 42.0);
    }
}
