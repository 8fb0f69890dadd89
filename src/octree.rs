//! The octree/quadtree external collaborator.
//!
//! The real tree library is out of scope for this crate; a C-style
//! traversal callback surface with per-quadrant user data is reshaped here
//! into a small query-style trait that returns owned data rather than
//! invoking caller-supplied callbacks mid-traversal, sidestepping the
//! pointer-lifetime bookkeeping a callback-based user-data pointer would
//! need.

use std::collections::HashMap;

/// One leaf cell of the tree: a globally unique id, owning rank, refine
/// level, and physical-unit-cube extent (`[0,1]^ndims`, before `bmf`).
#[derive(Clone, Debug, PartialEq)]
pub struct Leaf {
    pub id: i64,
    pub rank: i32,
    pub level: i32,
    /// Which root tree of the forest this leaf belongs to; `bmf` takes this
    /// alongside the unit-cube corners to support multi-block geometries.
    /// `UniformOctree` only ever has one tree (`0`).
    pub tree_id: i64,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

/// The result of coarsening one leaf (or family of `2^D` sibling leaves)
/// by one level.
#[derive(Clone, Debug, PartialEq)]
pub struct CoarsenedLeaf {
    pub leaf: Leaf,
    /// Ids of the finer-level children merged into this leaf, in `Orthant`
    /// child-index order (`bsw`/`lower`-most first). Empty if this leaf was
    /// already at or coarser than the requested level and was left alone.
    pub merged_children: Vec<i64>,
}

/// The tree traversal and coarsening surface `DomainGenerator` (C7) needs.
/// `patchgrid` ships one implementation, `UniformOctree`, for tests and
/// small examples; a production binary supplies its own backed by a real
/// octree/quadtree library (p4est, `forest-of-octrees`, etc.).
pub trait Octree {
    fn ndims(&self) -> usize;

    /// The finest refine level present anywhere in the tree at
    /// construction time.
    fn max_level(&self) -> i32;

    /// This rank's leaves at the tree's current refinement state, in a
    /// stable order.
    fn local_leaves(&self) -> Vec<Leaf>;

    /// Merge every complete family of `2^ndims` sibling leaves whose level
    /// is greater than `keep_above` into their parent (the parent inherits
    /// the lowest-orthant sibling's id); leaves already at or below
    /// `keep_above` pass through unchanged. Mutates the tree in place and
    /// returns the resulting leaves (this rank's only).
    fn coarsen_one_level(&mut self, keep_above: i32) -> Vec<CoarsenedLeaf>;

    /// Redistribute leaves across ranks for load balance; `rank_of` maps a
    /// leaf id to its new owning rank. A no-op is a valid implementation.
    fn repartition(&mut self, rank_of: &dyn Fn(i64) -> i32);
}

/// A reference octree/quadtree that uniformly refines the unit cube to
/// `max_level`, used by tests and small examples. Not a production
/// backend; it exists so `DomainGenerator` has something concrete to run
/// against without an external dependency.
///
/// Unlike a real distributed octree, an instance keeps every rank's leaves
/// in memory (not just its own) — cheap at the sizes this reference
/// implementation targets, and it sidesteps needing inter-process
/// communication just to keep sibling families intact across a coarsen
/// when ranks happen to split a family. One instance per simulated rank,
/// built with the same `(ndims, max_level, num_ranks)` on every rank and
/// distinguished only by `my_rank`, sees identical tree state throughout.
pub struct UniformOctree {
    ndims: usize,
    max_level: i32,
    num_ranks: i32,
    my_rank: i32,
    leaves: HashMap<i64, Leaf>,
}

impl UniformOctree {
    pub fn new(ndims: usize, max_level: i32, num_ranks: i32, my_rank: i32) -> Self {
        assert!((1..=3).contains(&ndims), "ndims must be 1, 2, or 3");
        assert!(max_level >= 0, "max_level must be non-negative");
        let num_ranks = num_ranks.max(1);
        let per_axis = 1usize << max_level;
        let total: usize = std::iter::repeat(per_axis).take(ndims).product();

        let mut leaves = HashMap::with_capacity(total);
        for flat in 0..total {
            let idx = unflatten(flat, per_axis, ndims);
            let lower: Vec<f64> = idx.iter().map(|&i| i as f64 / per_axis as f64).collect();
            let upper: Vec<f64> = idx.iter().map(|&i| (i + 1) as f64 / per_axis as f64).collect();
            let id = flat as i64;
            let rank = (id as i32).rem_euclid(num_ranks);
            leaves.insert(id, Leaf { id, rank, level: max_level, tree_id: 0, lower, upper });
        }

        Self { ndims, max_level, num_ranks, my_rank, leaves }
    }
}

/// Row-major multi-index of `flat` in an `ndims`-cube of side `per_axis`.
fn unflatten(flat: usize, per_axis: usize, ndims: usize) -> Vec<usize> {
    let mut idx = vec![0usize; ndims];
    let mut rem = flat;
    for axis in (0..ndims).rev() {
        idx[axis] = rem % per_axis;
        rem /= per_axis;
    }
    idx
}

/// Inverse of `unflatten`: the row-major flat index of `idx` in an
/// `ndims`-cube of side `per_axis`.
fn flatten(idx: &[usize], per_axis: usize) -> usize {
    idx.iter().fold(0, |acc, &i| acc * per_axis + i)
}

impl Octree for UniformOctree {
    fn ndims(&self) -> usize {
        self.ndims
    }

    fn max_level(&self) -> i32 {
        self.max_level
    }

    fn local_leaves(&self) -> Vec<Leaf> {
        let mut leaves: Vec<Leaf> = self.leaves.values().filter(|l| l.rank == self.my_rank).cloned().collect();
        leaves.sort_by_key(|l| l.id);
        leaves
    }

    fn coarsen_one_level(&mut self, keep_above: i32) -> Vec<CoarsenedLeaf> {
        let current_level = self.leaves.values().map(|l| l.level).max().unwrap_or(0);
        if current_level <= keep_above {
            return self
                .local_leaves()
                .into_iter()
                .map(|leaf| CoarsenedLeaf { leaf, merged_children: Vec::new() })
                .collect();
        }

        let per_axis_fine = 1usize << current_level;
        let per_axis_coarse = 1usize << (current_level - 1);
        let ndims = self.ndims;

        // Group every leaf by its parent's multi-index.
        let mut families: HashMap<Vec<usize>, Vec<Leaf>> = HashMap::new();
        for leaf in self.leaves.values() {
            let idx = unflatten(leaf.id as usize, per_axis_fine, ndims);
            let parent_idx: Vec<usize> = idx.iter().map(|&i| i / 2).collect();
            families.entry(parent_idx).or_default().push(leaf.clone());
        }

        let mut new_leaves = HashMap::with_capacity(families.len());
        let mut results = Vec::with_capacity(families.len());
        for (parent_idx, mut siblings) in families {
            siblings.sort_by_key(|s| orthant_bits(&unflatten(s.id as usize, per_axis_fine, ndims)));
            let bsw = siblings[0].clone();

            let lower: Vec<f64> = parent_idx.iter().map(|&i| i as f64 / per_axis_coarse as f64).collect();
            let upper: Vec<f64> = parent_idx.iter().map(|&i| (i + 1) as f64 / per_axis_coarse as f64).collect();

            let parent_id = flatten(&parent_idx, per_axis_coarse) as i64;
            let parent = Leaf { id: parent_id, rank: bsw.rank, level: current_level - 1, tree_id: bsw.tree_id, lower, upper };
            let merged_children: Vec<i64> = siblings.iter().map(|s| s.id).collect();

            new_leaves.insert(parent.id, parent.clone());
            results.push(CoarsenedLeaf { leaf: parent, merged_children });
        }

        self.leaves = new_leaves;
        let mut results: Vec<CoarsenedLeaf> = results.into_iter().filter(|r| r.leaf.rank == self.my_rank).collect();
        results.sort_by_key(|r| r.leaf.id);
        results
    }

    fn repartition(&mut self, rank_of: &dyn Fn(i64) -> i32) {
        for leaf in self.leaves.values_mut() {
            leaf.rank = rank_of(leaf.id);
        }
    }
}

/// `0` if `idx` is the lower corner on every axis (the "bsw" sibling), else
/// a bitmask identifying which axes it is on the upper half of — the same
/// encoding `Orthant` uses.
fn orthant_bits(idx: &[usize]) -> u8 {
    idx.iter().enumerate().fold(0u8, |acc, (axis, &i)| acc | (((i % 2) as u8) << axis))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uniform_octree_has_the_expected_leaf_count() {
        let tree = UniformOctree::new(2, 2, 1, 0);
        assert_eq!(tree.local_leaves().len(), 16);
    }

    #[test]
    fn coarsen_one_level_quarters_the_leaf_count_in_2d() {
        let mut tree = UniformOctree::new(2, 2, 1, 0);
        let coarsened = tree.coarsen_one_level(1);
        assert_eq!(coarsened.len(), 4);
        for c in &coarsened {
            assert_eq!(c.merged_children.len(), 4);
            assert_eq!(c.leaf.level, 1);
        }
        assert_eq!(tree.local_leaves().len(), 4);
    }

    #[test]
    fn coarsen_below_current_level_is_a_no_op() {
        let mut tree = UniformOctree::new(2, 1, 1, 0);
        let result = tree.coarsen_one_level(5);
        for c in &result {
            assert!(c.merged_children.is_empty());
        }
        assert_eq!(tree.local_leaves().len(), 4);
    }

    #[test]
    fn coarsening_twice_renumbers_ids_onto_the_new_coarse_grid() {
        let mut tree = UniformOctree::new(2, 2, 1, 0);
        tree.coarsen_one_level(1);
        let coarsened = tree.coarsen_one_level(0);
        assert_eq!(coarsened.len(), 1);
        assert_eq!(coarsened[0].leaf.id, 0);
        assert_eq!(coarsened[0].leaf.level, 0);
        assert_eq!(coarsened[0].merged_children.len(), 4);
        for leaf in tree.local_leaves() {
            assert_eq!(leaf.id, 0);
        }
    }

    #[test]
    fn repartition_reassigns_ranks() {
        let mut tree = UniformOctree::new(1, 2, 1, 0);
        tree.repartition(&|id| (id % 2) as i32);
        for leaf in tree.local_leaves() {
            assert_eq!(leaf.rank, (leaf.id % 2) as i32);
        }
    }
}
