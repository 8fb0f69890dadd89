//! Builds a sequence of `Domain`s, finest to coarsest, from an `Octree`.
//!
//! A lazy, dispense-one-level-at-a-time design would need aliased mutable
//! access to already-handed-out finer-level patches (to backpatch
//! `parent_id`/`parent_rank` once the coarser level is built), which this
//! crate's `Domain` doesn't offer — `Domain::patches()` hands out an owned
//! `Vec<PatchInfo>`, not a shared, interior-mutable handle per patch.
//! `DomainGenerator::new` instead walks the whole coarsening sequence up
//! front, finishing every level's backpatch while the data is still
//! internally owned, and only then exposes the finished `Domain`s one at a
//! time through `has_coarser_domain`/`get_finest_domain`/
//! `get_coarser_domain`.

use crate::comm::Communicator;
use crate::error::Result;
use crate::face::{Edge, Orthant, Side};
use crate::neighbor_info::{CoarseNbrInfo, FineNbrInfo, NeighborInfo, NormalNbrInfo};
use crate::octree::{CoarsenedLeaf, Leaf, Octree};
use crate::patch_info::{NbrMapKey, PatchInfo};
use crate::view::FixedAxes;
use crate::Domain;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

const TAG_LEVEL_DIRECTORY: u32 = 100;

/// Maps a quadrant's `(tree_id, unit_coord)` to a physical-space
/// coordinate.
pub type BlockMap = Box<dyn Fn(i64, &[f64]) -> Vec<f64>>;

/// A small, topology-only snapshot of one quadrant broadcast across ranks
/// so every rank can detect cross-rank adjacency and recover the children
/// of a quadrant repartition may have moved to a different rank.
#[derive(Clone, Serialize, Deserialize)]
struct QuadrantRecord {
    rank: i32,
    level: i32,
    tree_id: i64,
    lower: Vec<f64>,
    upper: Vec<f64>,
    child_ids: Vec<i64>,
    child_ranks: Vec<i32>,
}

pub struct DomainGenerator<T: Octree, C: Communicator + Clone> {
    comm: C,
    ns: Vec<usize>,
    num_ghost_cells: usize,
    levels: VecDeque<Vec<PatchInfo>>,
    next_domain_id: usize,
    _tree: std::marker::PhantomData<T>,
}

impl<T: Octree, C: Communicator + Clone> DomainGenerator<T, C> {
    /// Runs the full coarsening sequence against `tree` and buffers every
    /// level's linked, backpatched `PatchInfo`s (finest at the back,
    /// coarsest at the front — `get_finest_domain` pops the back first).
    pub fn new(mut tree: T, bmf: BlockMap, ns: Vec<usize>, num_ghost_cells: usize, comm: C) -> Self {
        let ndims = tree.ndims();
        let mut curr_level = tree.max_level();
        let mut levels: VecDeque<Vec<PatchInfo>> = VecDeque::new();
        let mut previous: Option<Vec<PatchInfo>> = None;

        while curr_level >= 0 {
            let coarsen_results: Vec<CoarsenedLeaf> = if previous.is_some() {
                tree.coarsen_one_level(curr_level)
            } else {
                tree.local_leaves().into_iter().map(|leaf| CoarsenedLeaf { leaf, merged_children: Vec::new() }).collect()
            };

            let local_records: HashMap<i64, QuadrantRecord> = coarsen_results
                .iter()
                .map(|c| {
                    let child_ranks = c
                        .merged_children
                        .iter()
                        .map(|cid| previous.as_ref().and_then(|p| p.iter().find(|pi| pi.id == *cid)).map(|pi| pi.rank).unwrap_or(-1))
                        .collect();
                    (
                        c.leaf.id,
                        QuadrantRecord {
                            rank: c.leaf.rank,
                            level: c.leaf.level,
                            tree_id: c.leaf.tree_id,
                            lower: c.leaf.lower.clone(),
                            upper: c.leaf.upper.clone(),
                            child_ids: c.merged_children.clone(),
                            child_ranks,
                        },
                    )
                })
                .collect();

            let global = gather_and_broadcast_records(&comm, local_records);

            let size = comm.size() as i32;
            tree.repartition(&|id| (id as i32).rem_euclid(size.max(1)));

            let my_rank = comm.rank() as i32;
            let mut level_patches: Vec<PatchInfo> = Vec::new();
            for (&id, rec) in global.iter().filter(|(_, rec)| rec.rank == my_rank) {
                let mut p = PatchInfo::new(ndims);
                p.id = id;
                p.rank = rec.rank;
                p.ns = ns.clone();
                p.num_ghost_cells = num_ghost_cells;
                p.refine_level = rec.level;
                p.child_ids = rec.child_ids.clone();
                p.child_ranks = rec.child_ranks.clone();

                let lower_phys = bmf(rec.tree_id, &rec.lower);
                let upper_phys = bmf(rec.tree_id, &rec.upper);
                p.spacings = lower_phys.iter().zip(upper_phys.iter()).zip(p.ns.iter()).map(|((&lo, &hi), &n)| (hi - lo) / n as f64).collect();
                p.starts = lower_phys;

                level_patches.push(p);
            }
            level_patches.sort_by_key(|p| p.id);

            link_neighbors(&mut level_patches, &global, ndims);

            if let Some(mut finer) = previous.take() {
                backpatch_parents(&mut finer, &global);
                levels.push_back(finer);
            }

            previous = Some(level_patches);
            curr_level -= 1;
        }

        if let Some(coarsest) = previous {
            levels.push_back(coarsest);
        }

        // Each flush above appends the level just finished with, in
        // finest-to-coarsest order, so `levels` already reads finest-at-
        // front, coarsest-at-back — `get_finest_domain` pops the front.
        Self { comm, ns, num_ghost_cells, levels, next_domain_id: 0, _tree: std::marker::PhantomData }
    }

    pub fn has_coarser_domain(&self) -> bool {
        self.levels.len() > 1
    }

    pub fn get_finest_domain(&mut self) -> Result<Domain<C>> {
        self.next_level_domain()
    }

    pub fn get_coarser_domain(&mut self) -> Result<Domain<C>> {
        self.next_level_domain()
    }

    fn next_level_domain(&mut self) -> Result<Domain<C>> {
        let patches = self.levels.pop_front().expect("no more levels to dispense");
        let id = self.next_domain_id;
        self.next_domain_id += 1;
        Domain::new(self.comm.clone(), id, self.ns.clone(), self.num_ghost_cells, patches)
    }
}

/// Gathers every rank's local `QuadrantRecord`s to rank 0, unions them, and
/// broadcasts the combined directory back out — the same idiom
/// `domain::gather_and_broadcast_directory` uses, generalized to carry a
/// whole record instead of just `(rank, global_index)`.
fn gather_and_broadcast_records<C: Communicator>(comm: &C, local: HashMap<i64, QuadrantRecord>) -> HashMap<i64, QuadrantRecord> {
    use crate::comm::{recv_tagged, send_tagged};

    let rank = comm.rank();
    let size = comm.size();

    let mut combined = local.clone();
    if rank == 0 {
        for _ in 1..size {
            let bytes = recv_tagged(comm, TAG_LEVEL_DIRECTORY);
            let other: HashMap<i64, QuadrantRecord> = ciborium::de::from_reader(&bytes[..]).expect("malformed level directory fragment");
            combined.extend(other);
        }
    } else {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&local, &mut buf).expect("level directory fragment always encodes");
        send_tagged(comm, 0, TAG_LEVEL_DIRECTORY, buf);
    }

    let combined_bytes = if rank == 0 {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&combined, &mut buf).expect("level directory always encodes");
        comm.broadcast(Some(buf))
    } else {
        comm.broadcast(None)
    };
    ciborium::de::from_reader(&combined_bytes[..]).expect("malformed broadcast level directory")
}

/// Tolerance for unit-coordinate comparisons; quadrant extents are powers
/// of two so exact equality would do for `UniformOctree`, but a real
/// octree backend's `bmf` inputs may carry floating-point noise.
const EPS: f64 = 1e-9;

fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < EPS
}

fn range_subset(inner: (f64, f64), outer: (f64, f64)) -> bool {
    inner.0 >= outer.0 - EPS && inner.1 <= outer.1 + EPS
}

/// Whether `candidate` touches `me` along every one of `fixed`'s axes, from
/// `me`'s outward side.
fn touches(me: &Leaf, candidate: &Leaf, fixed: &[(usize, bool)]) -> bool {
    fixed.iter().all(|&(axis, is_lower)| {
        if is_lower {
            approx_eq(candidate.upper[axis], me.lower[axis])
        } else {
            approx_eq(candidate.lower[axis], me.upper[axis])
        }
    })
}

/// Whether `candidate`'s extent along every free (non-fixed) axis overlaps
/// `me`'s, in the direction `relation` (same level: equal; finer:
/// `candidate` ⊆ `me`; coarser: `me` ⊆ `candidate`).
fn free_axes_relate(me: &Leaf, candidate: &Leaf, fixed: &[(usize, bool)], ndims: usize, same_level: bool, candidate_is_finer: bool) -> bool {
    (0..ndims).filter(|axis| !fixed.iter().any(|&(a, _)| a == *axis)).all(|axis| {
        let me_range = (me.lower[axis], me.upper[axis]);
        let cand_range = (candidate.lower[axis], candidate.upper[axis]);
        if same_level {
            approx_eq(me_range.0, cand_range.0) && approx_eq(me_range.1, cand_range.1)
        } else if candidate_is_finer {
            range_subset(cand_range, me_range)
        } else {
            range_subset(me_range, cand_range)
        }
    })
}

/// Bitmask (the `Orthant` encoding) of where `inner`'s free-axis extent
/// sits within `outer`'s, one bit per free axis in ascending axis order.
fn sub_orthant_bits(inner: &Leaf, outer: &Leaf, free_axes: &[usize]) -> u8 {
    free_axes.iter().enumerate().fold(0u8, |acc, (bit, &axis)| {
        let lower_half = inner.lower[axis] < (outer.lower[axis] + outer.upper[axis]) / 2.0;
        acc | (((!lower_half) as u8) << bit)
    })
}

/// Installs `NormalNbrInfo`/`CoarseNbrInfo`/`FineNbrInfo` on every local
/// patch's side (and, in 3D, edge and corner) neighbor maps, by comparing
/// unit-cube extents against the level's full directory. Generalized over
/// `Side`/`Edge`/`Orthant` via `FixedAxes` rather than writing the same
/// three-case logic three times.
fn link_neighbors(patches: &mut [PatchInfo], global: &HashMap<i64, QuadrantRecord>, ndims: usize) {
    let all: Vec<Leaf> = global
        .iter()
        .map(|(&id, r)| Leaf { id, rank: r.rank, level: r.level, tree_id: r.tree_id, lower: r.lower.clone(), upper: r.upper.clone() })
        .collect();

    for p in patches.iter_mut() {
        let rec = &global[&p.id];
        let me = Leaf { id: p.id, rank: rec.rank, level: rec.level, tree_id: rec.tree_id, lower: rec.lower.clone(), upper: rec.upper.clone() };

        link_feature::<Side>(p, &me, &all, ndims, Side::for_dim(ndims).collect());
        if ndims == 3 {
            link_feature::<Edge>(p, &me, &all, ndims, Edge::iter_all().collect());
        }
        link_feature::<Orthant>(p, &me, &all, ndims, Orthant::iter_all(ndims as u8).collect());
    }
}

fn link_feature<K: NbrMapKey + FixedAxes + Copy>(p: &mut PatchInfo, me: &Leaf, all: &[Leaf], ndims: usize, features: Vec<K>) {
    for feature in features {
        let fixed = feature.fixed_axes();
        let free_axes: Vec<usize> = (0..ndims).filter(|axis| !fixed.iter().any(|&(a, _)| a == *axis)).collect();

        let mut normal = None;
        let mut finer: Vec<&Leaf> = Vec::new();
        let mut coarser = None;

        for cand in all {
            if cand.id == me.id || !touches(me, cand, &fixed) {
                continue;
            }
            if cand.level == me.level && free_axes_relate(me, cand, &fixed, ndims, true, false) {
                normal = Some(cand);
            } else if cand.level == me.level + 1 && free_axes_relate(me, cand, &fixed, ndims, false, true) {
                finer.push(cand);
            } else if cand.level == me.level - 1 && free_axes_relate(me, cand, &fixed, ndims, false, false) {
                coarser = Some(cand);
            }
        }

        if let Some(n) = normal {
            p.set_nbr_info(feature, NeighborInfo::Normal(NormalNbrInfo::new(n.id)));
        } else if !finer.is_empty() {
            finer.sort_by_key(|c| sub_orthant_bits(c, me, &free_axes));
            p.set_nbr_info(feature, NeighborInfo::Fine(FineNbrInfo::new(finer.iter().map(|c| c.id).collect())));
        } else if let Some(c) = coarser {
            let orth = if free_axes.is_empty() { None } else { Some(Orthant::new(free_axes.len() as u8, sub_orthant_bits(me, c, &free_axes))) };
            p.set_nbr_info(feature, NeighborInfo::Coarse(CoarseNbrInfo::new(c.id, orth)));
        }
    }
}

/// Sets `parent_id`/`orth_on_parent` on every patch of the just-finished
/// (finer) level, and `parent_rank` once the coarser level's directory is
/// known.
fn backpatch_parents(finer: &mut [PatchInfo], coarser_global: &HashMap<i64, QuadrantRecord>) {
    let mut parent_of: HashMap<i64, (i64, u8)> = HashMap::new();
    for (&parent_id, rec) in coarser_global {
        for (child_index, &child_id) in rec.child_ids.iter().enumerate() {
            parent_of.insert(child_id, (parent_id, child_index as u8));
        }
    }

    for p in finer.iter_mut() {
        match parent_of.get(&p.id) {
            Some(&(parent_id, child_index)) => {
                p.parent_id = parent_id;
                p.orth_on_parent = if parent_id == p.id { None } else { Some(Orthant::new(p.ns.len() as u8, child_index)) };
                p.parent_rank = coarser_global.get(&parent_id).map(|r| r.rank).unwrap_or(-1);
            }
            None => {
                // No family merged this quadrant: it carries itself forward
                // unchanged.
                p.parent_id = p.id;
                p.orth_on_parent = None;
                p.parent_rank = p.rank;
            }
        }
    }
}

/// The reference `UniformOctree`'s `bmf`: the identity map, scaled so the
/// whole forest covers `[0, extent]^ndims` instead of the unit cube.
pub fn identity_block_map(extent: f64) -> BlockMap {
    Box::new(move |_tree_id, unit_coord| unit_coord.iter().map(|&u| u * extent).collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::comm::local::LocalCommunicator;
    use crate::octree::UniformOctree;

    #[test]
    fn single_rank_two_levels_link_and_coarsen() {
        let group = LocalCommunicator::new_group(1);
        let comm = group.into_iter().next().unwrap();
        let tree = UniformOctree::new(2, 1, 1, 0);
        let mut gen = DomainGenerator::new(tree, identity_block_map(1.0), vec![4, 4], 1, comm);

        assert!(gen.has_coarser_domain());
        let finest = gen.get_finest_domain().unwrap();
        assert_eq!(finest.get_num_global_patches(), 4);

        assert!(!gen.has_coarser_domain());
        let coarsest = gen.get_coarser_domain().unwrap();
        assert_eq!(coarsest.get_num_global_patches(), 1);

        for side in Side::for_dim(2) {
            assert!(!coarsest.patches()[0].has_nbr(side));
        }
    }

    #[test]
    fn finest_level_patches_know_their_parent() {
        let group = LocalCommunicator::new_group(1);
        let comm = group.into_iter().next().unwrap();
        let tree = UniformOctree::new(2, 1, 1, 0);
        let mut gen = DomainGenerator::new(tree, identity_block_map(1.0), vec![4, 4], 1, comm);

        let finest = gen.get_finest_domain().unwrap();
        let parent_ids: std::collections::HashSet<i64> = finest.patches().iter().map(|p| p.parent_id).collect();
        // all four finest patches were merged into the single coarsest patch
        assert_eq!(parent_ids.len(), 1);
        for p in finest.patches() {
            assert!(p.orth_on_parent.is_some());
        }
    }

    #[test]
    fn two_ranks_link_a_cross_rank_normal_neighbor() {
        let mut group = LocalCommunicator::new_group(2);
        let comm1 = group.pop().unwrap();
        let comm0 = group.pop().unwrap();

        let h0 = std::thread::spawn(move || {
            let tree = UniformOctree::new(2, 1, 2, 0);
            let mut gen = DomainGenerator::new(tree, identity_block_map(1.0), vec![4, 4], 1, comm0);
            gen.get_finest_domain().unwrap()
        });
        let h1 = std::thread::spawn(move || {
            let tree = UniformOctree::new(2, 1, 2, 1);
            let mut gen = DomainGenerator::new(tree, identity_block_map(1.0), vec![4, 4], 1, comm1);
            gen.get_finest_domain().unwrap()
        });

        let d0 = h0.join().unwrap();
        let d1 = h1.join().unwrap();
        assert_eq!(d0.get_num_global_patches(), 4);
        assert_eq!(d1.get_num_global_patches(), 4);
    }

    fn record(level: i32, lower: Vec<f64>, upper: Vec<f64>) -> QuadrantRecord {
        QuadrantRecord { rank: 0, level, tree_id: 0, lower, upper, child_ids: Vec::new(), child_ranks: Vec::new() }
    }

    fn patch(id: i64) -> PatchInfo {
        let mut p = PatchInfo::new(2);
        p.id = id;
        p.ns = vec![4, 4];
        p
    }

    /// A coarse patch (west) against two fine siblings (east) sharing its
    /// east face: a hanging-node T-junction that `UniformOctree` can never
    /// produce on its own.
    #[test]
    fn link_neighbors_resolves_a_coarse_fine_t_junction() {
        let coarse = record(0, vec![0.0, 0.0], vec![1.0, 1.0]);
        let fine_sw = record(1, vec![1.0, 0.0], vec![1.5, 0.5]);
        let fine_nw = record(1, vec![1.0, 0.5], vec![1.5, 1.0]);

        let mut global = HashMap::new();
        global.insert(0, coarse);
        global.insert(1, fine_sw);
        global.insert(2, fine_nw);

        let mut patches = vec![patch(0), patch(1), patch(2)];
        link_neighbors(&mut patches, &global, 2);

        let c = patches.iter().find(|p| p.id == 0).unwrap();
        let fine = c.get_fine_nbr_info(Side::East).unwrap();
        assert_eq!(fine.ids, vec![1, 2]);

        let sw = patches.iter().find(|p| p.id == 1).unwrap();
        let coarse_nbr = sw.get_coarse_nbr_info(Side::West).unwrap();
        assert_eq!(coarse_nbr.id, 0);
        assert_eq!(coarse_nbr.orth_on_coarse, Some(Orthant::new(1, 0)));

        let nw = patches.iter().find(|p| p.id == 2).unwrap();
        let coarse_nbr = nw.get_coarse_nbr_info(Side::West).unwrap();
        assert_eq!(coarse_nbr.id, 0);
        assert_eq!(coarse_nbr.orth_on_coarse, Some(Orthant::new(1, 1)));
    }
}
