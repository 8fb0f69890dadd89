//! Strided, ghost-aware N-D windows into patch data.
//!
//! A `View` never owns memory; it is a `(pointer, strides, lengths,
//! num_ghost_cells)` tuple over a buffer owned elsewhere, generalized to an
//! arbitrary number of axes (one per spatial dimension, plus one for field
//! components) with ghost-inclusive addressing.
//!
//! `View` is the read-only flavor, `ViewMut` the mutable one; both are thin
//! wrappers over a raw pointer because Rust's borrow checker cannot express
//! "many overlapping, independently-strided windows into one buffer" any
//! other way without unsafe code — the same reason `ndarray`'s
//! `ArrayView`/`ArrayViewMut` exist.

use crate::face::{Edge, Orthant, Side};
use std::marker::PhantomData;

/// Axes fixed by a face-like feature (a `Side`, `Edge`, or `Corner`),
/// sorted by ascending spatial axis index. `true` means the feature sits on
/// the lower-valued end of that axis.
pub trait FixedAxes {
    fn fixed_axes(&self) -> Vec<(usize, bool)>;
}

impl FixedAxes for Side {
    fn fixed_axes(&self) -> Vec<(usize, bool)> {
        vec![(self.axis_index(), self.is_lower_on_axis())]
    }
}

impl FixedAxes for Edge {
    fn fixed_axes(&self) -> Vec<(usize, bool)> {
        let mut axes: Vec<(usize, bool)> = self
            .get_sides()
            .into_iter()
            .map(|s| (s.axis_index(), s.is_lower_on_axis()))
            .collect();
        axes.sort_by_key(|&(axis, _)| axis);
        axes
    }
}

impl FixedAxes for Orthant {
    fn fixed_axes(&self) -> Vec<(usize, bool)> {
        (0..self.ndims())
            .map(|axis| (axis as usize, !self.is_upper_on_axis(axis)))
            .collect()
    }
}

/// Shared geometry for a view: strides/lengths/ghost flags per axis, with
/// axis 0 always the field-component axis (no ghost margin) and axes
/// `1..K` the spatial axes in `x, y, z` order.
#[derive(Clone, Debug)]
struct Geometry {
    strides: Vec<isize>,
    lengths: Vec<usize>,
    has_ghost: Vec<bool>,
    num_ghost_cells: usize,
}

impl Geometry {
    fn num_axes(&self) -> usize {
        self.strides.len()
    }

    fn check_bounds(&self, coord: &[i64]) {
        debug_assert_eq!(coord.len(), self.num_axes(), "coordinate rank mismatch");
        for (i, &c) in coord.iter().enumerate() {
            let lo = if self.has_ghost[i] { -(self.num_ghost_cells as i64) } else { 0 };
            let hi = self.lengths[i] as i64 + if self.has_ghost[i] { self.num_ghost_cells as i64 } else { 0 };
            debug_assert!(
                c >= lo && c < hi,
                "coordinate {} on axis {} out of range [{}, {})",
                c,
                i,
                lo,
                hi
            );
        }
    }

    fn offset(&self, coord: &[i64]) -> isize {
        self.check_bounds(coord);
        coord
            .iter()
            .zip(&self.strides)
            .map(|(&c, &s)| c as isize * s)
            .sum()
    }

    /// Reduce geometry by fixing a set of axes at concrete (possibly
    /// ghost-region) indices, removing those axes and returning the extra
    /// pointer offset they contribute.
    fn reduce(&self, fixed: &[(usize, i64)]) -> (Geometry, isize) {
        let mut extra_offset = 0isize;
        let mut strides = Vec::with_capacity(self.num_axes() - fixed.len());
        let mut lengths = Vec::with_capacity(self.num_axes() - fixed.len());
        let mut has_ghost = Vec::with_capacity(self.num_axes() - fixed.len());

        for axis in 0..self.num_axes() {
            if let Some(&(_, idx)) = fixed.iter().find(|&&(a, _)| a == axis) {
                extra_offset += idx as isize * self.strides[axis];
            } else {
                strides.push(self.strides[axis]);
                lengths.push(self.lengths[axis]);
                has_ghost.push(self.has_ghost[axis]);
            }
        }

        (
            Geometry {
                strides,
                lengths,
                has_ghost,
                num_ghost_cells: self.num_ghost_cells,
            },
            extra_offset,
        )
    }

    /// Translate a feature's fixed spatial axes (1-indexed into this
    /// geometry, since axis 0 is the component axis) plus per-axis
    /// interior-cell offsets into concrete indices, `into_ghost` selecting
    /// whether `offset=0` lands on the innermost interior cell or the first
    /// ghost layer.
    fn face_indices(&self, fixed_axes: &[(usize, bool)], offsets: &[usize], into_ghost: bool) -> Vec<(usize, i64)> {
        assert_eq!(fixed_axes.len(), offsets.len(), "offsets must match the feature's dimensionality");
        fixed_axes
            .iter()
            .zip(offsets)
            .map(|(&(spatial_axis, is_lower), &offset)| {
                let view_axis = spatial_axis + 1;
                let n = self.lengths[view_axis] as i64;
                let o = offset as i64;
                let idx = match (is_lower, into_ghost) {
                    (true, false) => o,
                    (true, true) => -(o + 1),
                    (false, false) => n - 1 - o,
                    (false, true) => n + o,
                };
                (view_axis, idx)
            })
            .collect()
    }
}

/// A read-only strided window into patch data.
#[derive(Clone)]
pub struct View<'a, T> {
    base: *const T,
    geom: Geometry,
    _marker: PhantomData<&'a T>,
}

/// A mutable strided window into patch data.
pub struct ViewMut<'a, T> {
    base: *mut T,
    geom: Geometry,
    _marker: PhantomData<&'a mut T>,
}

unsafe impl<'a, T: Sync> Sync for View<'a, T> {}
unsafe impl<'a, T: Sync> Send for View<'a, T> {}
unsafe impl<'a, T: Send> Send for ViewMut<'a, T> {}
unsafe impl<'a, T: Sync> Sync for ViewMut<'a, T> {}

impl<'a, T> View<'a, T> {
    /// Build a view whose axis 0 is the component axis (`num_components`
    /// long, no ghost margin) and whose axes `1..=ndims` are the spatial
    /// axes in `x, y, z` order, each `ns[i]` long with `num_ghost_cells`
    /// ghost cells on either side. Strides are standard ghost-inclusive
    /// row-major, components slowest-varying.
    pub fn from_patch(base: *const T, ns: &[usize], num_components: usize, num_ghost_cells: usize) -> Self {
        let ndims = ns.len();
        let mut lengths = Vec::with_capacity(ndims + 1);
        lengths.push(num_components);
        lengths.extend_from_slice(ns);

        let mut extents = Vec::with_capacity(ndims + 1);
        extents.push(num_components);
        extents.extend(ns.iter().map(|n| n + 2 * num_ghost_cells));

        let mut strides = vec![0isize; ndims + 1];
        let mut acc: isize = 1;
        for axis in (0..=ndims).rev() {
            strides[axis] = acc;
            acc *= extents[axis] as isize;
        }

        let mut has_ghost = vec![true; ndims + 1];
        has_ghost[0] = false;

        // `base` must already point at logical index 0 on every spatial
        // axis, i.e. past the lower ghost margin.
        Self {
            base,
            geom: Geometry { strides, lengths, has_ghost, num_ghost_cells },
            _marker: PhantomData,
        }
    }

    pub fn num_ghost_cells(&self) -> usize {
        self.geom.num_ghost_cells
    }

    pub fn rank(&self) -> usize {
        self.geom.num_axes()
    }

    pub fn lengths(&self) -> &[usize] {
        &self.geom.lengths
    }

    pub fn get(&self, coord: &[i64]) -> &'a T {
        let off = self.geom.offset(coord);
        unsafe { &*self.base.offset(off) }
    }

    /// A `D`-D view over a single component, fixing axis 0 (the component
    /// axis) at `c`.
    pub fn drop_component_axis(&self, c: usize) -> View<'a, T> {
        let (geom, extra_offset) = self.geom.reduce(&[(0, c as i64)]);
        View { base: unsafe { self.base.offset(extra_offset) }, geom, _marker: PhantomData }
    }

    /// A lower-rank view one cell deep from `face`, with `offset=0` the
    /// innermost interior cell (reflected so this holds on both sides of
    /// an axis).
    pub fn get_slice_on<F: FixedAxes>(&self, face: &F, offsets: &[usize]) -> View<'a, T> {
        let fixed_axes = face.fixed_axes();
        let fixed = self.geom.face_indices(&fixed_axes, offsets, false);
        let (geom, extra_offset) = self.geom.reduce(&fixed);
        View {
            base: unsafe { self.base.offset(extra_offset) },
            geom,
            _marker: PhantomData,
        }
    }

    /// A lower-rank view into the ghost region outside `face`, with
    /// `offset=0` the first ghost layer and `offset=num_ghost_cells-1` the
    /// outermost.
    pub fn get_ghost_slice_on<F: FixedAxes>(&self, face: &F, offsets: &[usize]) -> View<'a, T> {
        let fixed_axes = face.fixed_axes();
        let fixed = self.geom.face_indices(&fixed_axes, offsets, true);
        let (geom, extra_offset) = self.geom.reduce(&fixed);
        View {
            base: unsafe { self.base.offset(extra_offset) },
            geom,
            _marker: PhantomData,
        }
    }
}

impl<'a, T> ViewMut<'a, T> {
    pub fn from_patch(base: *mut T, ns: &[usize], num_components: usize, num_ghost_cells: usize) -> Self {
        let view = View::<T>::from_patch(base as *const T, ns, num_components, num_ghost_cells);
        Self {
            base,
            geom: view.geom,
            _marker: PhantomData,
        }
    }

    pub fn num_ghost_cells(&self) -> usize {
        self.geom.num_ghost_cells
    }

    pub fn rank(&self) -> usize {
        self.geom.num_axes()
    }

    pub fn lengths(&self) -> &[usize] {
        &self.geom.lengths
    }

    pub fn as_view(&self) -> View<'_, T> {
        View {
            base: self.base as *const T,
            geom: self.geom.clone(),
            _marker: PhantomData,
        }
    }

    pub fn get(&self, coord: &[i64]) -> &T {
        let off = self.geom.offset(coord);
        unsafe { &*self.base.offset(off) }
    }

    pub fn get_mut(&mut self, coord: &[i64]) -> &mut T {
        let off = self.geom.offset(coord);
        unsafe { &mut *self.base.offset(off) }
    }

    /// A `D`-D view over a single component, fixing axis 0 at `c`.
    pub fn drop_component_axis_mut(&mut self, c: usize) -> ViewMut<'_, T> {
        let (geom, extra_offset) = self.geom.reduce(&[(0, c as i64)]);
        ViewMut { base: unsafe { self.base.offset(extra_offset) }, geom, _marker: PhantomData }
    }

    pub fn get_slice_on<F: FixedAxes>(&self, face: &F, offsets: &[usize]) -> View<'_, T> {
        self.as_view().get_slice_on(face, offsets)
    }

    pub fn get_ghost_slice_on<F: FixedAxes>(&self, face: &F, offsets: &[usize]) -> View<'_, T> {
        self.as_view().get_ghost_slice_on(face, offsets)
    }

    pub fn get_slice_on_mut<F: FixedAxes>(&mut self, face: &F, offsets: &[usize]) -> ViewMut<'_, T> {
        let fixed_axes = face.fixed_axes();
        let fixed = self.geom.face_indices(&fixed_axes, offsets, false);
        let (geom, extra_offset) = self.geom.reduce(&fixed);
        ViewMut {
            base: unsafe { self.base.offset(extra_offset) },
            geom,
            _marker: PhantomData,
        }
    }

    pub fn get_ghost_slice_on_mut<F: FixedAxes>(&mut self, face: &F, offsets: &[usize]) -> ViewMut<'_, T> {
        let fixed_axes = face.fixed_axes();
        let fixed = self.geom.face_indices(&fixed_axes, offsets, true);
        let (geom, extra_offset) = self.geom.reduce(&fixed);
        ViewMut {
            base: unsafe { self.base.offset(extra_offset) },
            geom,
            _marker: PhantomData,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::face::Side;

    fn make_buffer(ns: &[usize], num_components: usize, num_ghost_cells: usize) -> Vec<f64> {
        let total: usize = ns.iter().map(|n| n + 2 * num_ghost_cells).product::<usize>() * num_components;
        vec![0.0; total]
    }

    #[test]
    fn slice_is_pointer_equal_to_parent_element() {
        let ns = [6usize, 5];
        let mut buf = make_buffer(&ns, 2, 1);

        // Compute the pointer to logical (0,0) using the same row-major
        // convention as `Geometry::offset`, then skip one ghost layer on
        // each spatial axis.
        let extents = [2usize, ns[0] + 2, ns[1] + 2];
        let mut strides = [0isize; 3];
        let mut acc = 1isize;
        for axis in (0..3).rev() {
            strides[axis] = acc;
            acc *= extents[axis] as isize;
        }
        let base_ptr = unsafe { buf.as_mut_ptr().offset(strides[1] + strides[2]) };

        let view = ViewMut::<f64>::from_patch(base_ptr, &ns, 2, 1);
        let slice = view.get_slice_on(&Side::East, &[0]);

        let parent_ptr = view.get(&[0, ns[0] as i64 - 1, 0]) as *const f64;
        let slice_ptr = slice.get(&[0, 0]) as *const f64;
        assert_eq!(parent_ptr, slice_ptr);
    }

    #[test]
    fn ghost_slice_offset_zero_is_first_layer() {
        let ns = [4usize, 4];
        let mut buf = make_buffer(&ns, 1, 2);
        let extents = [1usize, ns[0] + 4, ns[1] + 4];
        let mut strides = [0isize; 3];
        let mut acc = 1isize;
        for axis in (0..3).rev() {
            strides[axis] = acc;
            acc *= extents[axis] as isize;
        }
        let base_ptr = unsafe { buf.as_mut_ptr().offset(2 * strides[1] + 2 * strides[2]) };
        let view = ViewMut::<f64>::from_patch(base_ptr, &ns, 1, 2);

        let ghost0 = view.get_ghost_slice_on(&Side::West, &[0]);
        let ghost1 = view.get_ghost_slice_on(&Side::West, &[1]);

        let expect0 = view.get(&[0, -1, 0]) as *const f64;
        let expect1 = view.get(&[0, -2, 0]) as *const f64;
        assert_eq!(ghost0.get(&[0, 0]) as *const f64, expect0);
        assert_eq!(ghost1.get(&[0, 0]) as *const f64, expect1);
    }
}
