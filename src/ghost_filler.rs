//! Halo-exchange driver and abstract filler operations.
//!
//! `fill_ghost` walks each local patch's neighbor maps once, exactly the
//! way `domain.rs`'s construction walks them to resolve indexes, and
//! splits the work into three cases per feature: same-rank (call the
//! filler directly against a split-borrowed pair of `ViewMut`s), remote
//! (pack into a buffer-backed view and send), and no neighbor at all
//! (left untouched — physical-boundary ghost cells stay at whatever the
//! `Vector` initialized them to). `GhostFiller` itself is deliberately
//! thin: the two callbacks are the only place interpolation/restriction
//! math belongs, kept out of the driver and in the caller's closures.

use crate::comm::{recv_tagged, send_tagged, Communicator};
use crate::domain::Domain;
use crate::face::{Edge, NbrType, Orthant, Side};
use crate::patch_info::{NbrMapKey, PatchInfo};
use crate::vector::Vector;
use crate::view::{FixedAxes, View, ViewMut};
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const TAG_GHOST: u32 = 0;

/// Which feature kinds a `fill_ghost` call fills. `Corners` implies
/// `Edges` implies `Faces`; sides are always filled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GhostFillingType {
    Faces,
    Edges,
    Corners,
}

impl GhostFillingType {
    fn includes_edges(self) -> bool {
        matches!(self, GhostFillingType::Edges | GhostFillingType::Corners)
    }

    fn includes_corners(self) -> bool {
        matches!(self, GhostFillingType::Corners)
    }
}

/// A `Side`, `Edge`, or `Corner`, type-erased for wire transport and for
/// driving `View`/`ViewMut`'s `FixedAxes`-generic slicing from one call
/// site instead of three.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Feature {
    Side(Side),
    Edge(Edge),
    Corner(Orthant),
}

impl Feature {
    /// The matching feature on the other side of the boundary: neighbors
    /// always sit on opposite ends of the same fixed axes.
    fn opposite(self) -> Feature {
        match self {
            Feature::Side(s) => Feature::Side(s.opposite()),
            Feature::Edge(e) => Feature::Edge(e.opposite()),
            Feature::Corner(o) => Feature::Corner(o.opposite()),
        }
    }
}

impl FixedAxes for Feature {
    fn fixed_axes(&self) -> Vec<(usize, bool)> {
        match self {
            Feature::Side(s) => s.fixed_axes(),
            Feature::Edge(e) => e.fixed_axes(),
            Feature::Corner(o) => o.fixed_axes(),
        }
    }
}

fn mirror_nbr_type(t: NbrType) -> NbrType {
    match t {
        NbrType::Normal => NbrType::Normal,
        NbrType::Coarse => NbrType::Fine,
        NbrType::Fine => NbrType::Coarse,
    }
}

/// Operations a concrete ghost-filling scheme supplies; `fill_ghost`
/// supplies everything else (slicing, packing, message routing).
/// `Sync` so step 4 can dispatch across patches with `rayon`.
pub trait GhostFiller: Sync {
    /// Fill the ghost layers of `pinfo`'s own faces/edges/corners that
    /// `fill_ghost` will not separately overwrite from a neighbor this
    /// call: physical-boundary conditions, and (for neighbors resolved to
    /// a remote rank) zeroing the slice step 5 is about to accumulate
    /// into. Faces with a same-rank neighbor are left alone — the
    /// synchronous neighbor step already wrote them.
    fn fill_ghost_cells_for_local_patch(&self, pinfo: &PatchInfo, view: &mut ViewMut<f64>);

    /// Compute what `pinfo`'s interior contributes to one neighbor's
    /// ghost region. `local` is a full view over `pinfo`; `nbr_ghost` is
    /// always slice-shaped (the component axis plus the feature's free
    /// spatial axes, offset already resolved to the first ghost layer) —
    /// either a real neighbor's own ghost slice (same rank) or a pack
    /// buffer of the same shape (remote). Implementations *write*, they
    /// do not accumulate; `fill_ghost` owns the add-on-receipt step.
    fn fill_ghost_cells_for_nbr_patch(
        &self,
        pinfo: &PatchInfo,
        local: &View<f64>,
        nbr_ghost: &mut ViewMut<f64>,
        feature: Feature,
        nbr_type: NbrType,
        orthant: Option<Orthant>,
    );
}

/// One neighbor-relation's worth of ghost data in flight between ranks.
/// `sender_feature`/`sender_nbr_type` are from the sender's point of view;
/// the receiver inverts both (`Feature::opposite`, `mirror_nbr_type`)
/// since two patches across a shared boundary always see each other on
/// opposite ends of the same fixed axes. `orthant` needs no inversion: it
/// names the same sub-region (the fine child's position within the coarse
/// face) on either side.
#[derive(Clone, Serialize, Deserialize)]
struct GhostPacket {
    dest_patch_id: i64,
    sender_feature: Feature,
    sender_nbr_type: NbrType,
    orthant: Option<Orthant>,
    data: Vec<f64>,
}

/// Row-major multi-index of `flat` given per-axis `lengths`, the same
/// convention `Geometry`'s strides use (component axis slowest).
fn multi_index(flat: usize, lengths: &[usize]) -> Vec<i64> {
    let mut idx = vec![0i64; lengths.len()];
    let mut rem = flat;
    for axis in (0..lengths.len()).rev() {
        idx[axis] = (rem % lengths[axis]) as i64;
        rem /= lengths[axis];
    }
    idx
}

fn zero_fill(view: &mut ViewMut<f64>) {
    let lengths = view.lengths().to_vec();
    let total: usize = lengths.iter().product();
    for flat in 0..total {
        *view.get_mut(&multi_index(flat, &lengths)) = 0.0;
    }
}

fn accumulate(view: &mut ViewMut<f64>, data: &[f64]) {
    let lengths = view.lengths().to_vec();
    for (flat, &value) in data.iter().enumerate() {
        *view.get_mut(&multi_index(flat, &lengths)) += value;
    }
}

/// Visits every neighbor relation of `pinfo` in the fill type's scope:
/// `(feature, nbr_type, neighbor id, neighbor rank, orthant)`, one call
/// per `Fine` child as well as per `Normal`/`Coarse` singleton.
fn for_each_relation(pinfo: &PatchInfo, fill_type: GhostFillingType, mut visit: impl FnMut(Feature, NbrType, i64, i32, Option<Orthant>)) {
    let ndims = pinfo.ndims();
    for side in Side::for_dim(ndims) {
        visit_key(pinfo, side, Feature::Side(side), &mut visit);
    }
    if fill_type.includes_edges() && ndims == 3 {
        for edge in Edge::iter_all() {
            visit_key(pinfo, edge, Feature::Edge(edge), &mut visit);
        }
    }
    if fill_type.includes_corners() {
        for corner in Orthant::iter_all(ndims as u8) {
            visit_key(pinfo, corner, Feature::Corner(corner), &mut visit);
        }
    }
}

fn visit_key<K: NbrMapKey + FixedAxes + Copy>(
    pinfo: &PatchInfo,
    key: K,
    feature: Feature,
    visit: &mut impl FnMut(Feature, NbrType, i64, i32, Option<Orthant>),
) {
    match pinfo.get_nbr_type(key) {
        None => {}
        Some(NbrType::Normal) => {
            let n = pinfo.get_normal_nbr_info(key).expect("nbr_type checked above");
            visit(feature, NbrType::Normal, n.id, n.rank, None);
        }
        Some(NbrType::Coarse) => {
            let n = pinfo.get_coarse_nbr_info(key).expect("nbr_type checked above");
            visit(feature, NbrType::Coarse, n.id, n.rank, n.orth_on_coarse);
        }
        Some(NbrType::Fine) => {
            let n = pinfo.get_fine_nbr_info(key).expect("nbr_type checked above");
            let free_ndims = (pinfo.ndims() - key.fixed_axes().len()) as u8;
            for (k, (&id, &rank)) in n.ids.iter().zip(&n.ranks).enumerate() {
                visit(feature, NbrType::Fine, id, rank, Some(Orthant::from_index(free_ndims, k)));
            }
        }
    }
}

/// The driver: packs and exchanges ghost data for every local patch of
/// `domain` into `vector`'s ghost margins. `vector`'s patches must be
/// `domain.patches()` in the same order (the same assumption
/// `Vector::patch_views_mut` callers already make elsewhere).
pub fn fill_ghost<C: Communicator>(domain: &Domain<C>, vector: &mut Vector, fill_type: GhostFillingType, filler: &dyn GhostFiller) {
    let my_rank = domain.comm().rank() as i32;
    let num_components = vector.num_components();
    let mut outgoing: HashMap<i32, Vec<GhostPacket>> = HashMap::new();

    // Steps 1 & 3: pack remote neighbor contributions, and synchronously
    // invoke the filler for same-rank neighbors.
    {
        let patches = domain.patches();
        let mut views = vector.patch_views_mut();

        for i in 0..patches.len() {
            let pinfo = &patches[i];
            for_each_relation(pinfo, fill_type, |feature, nbr_type, id, rank, orthant| {
                if rank == my_rank {
                    let j = match domain.local_index_of(id) {
                        Some(j) => j as usize,
                        None => return,
                    };
                    if i == j {
                        return;
                    }
                    let recv_feature = feature.opposite();
                    let offsets = vec![0usize; recv_feature.fixed_axes().len()];
                    let (local_view, nbr_full) = if i < j {
                        let (left, right) = views.split_at_mut(j);
                        (left[i].as_view(), &mut right[0])
                    } else {
                        let (left, right) = views.split_at_mut(i);
                        (right[0].as_view(), &mut left[j])
                    };
                    let mut nbr_ghost = nbr_full.get_ghost_slice_on_mut(&recv_feature, &offsets);
                    filler.fill_ghost_cells_for_nbr_patch(pinfo, &local_view, &mut nbr_ghost, feature, nbr_type, orthant);
                } else {
                    let local_view = views[i].as_view();
                    let free_lengths: Vec<usize> = (0..pinfo.ndims())
                        .filter(|axis| !feature.fixed_axes().iter().any(|&(a, _)| a == *axis))
                        .map(|axis| pinfo.ns[axis])
                        .collect();
                    let total = num_components * free_lengths.iter().product::<usize>();
                    let mut buf = vec![0.0f64; total];
                    {
                        let mut buf_view = ViewMut::from_patch(buf.as_mut_ptr(), &free_lengths, num_components, 0);
                        filler.fill_ghost_cells_for_nbr_patch(pinfo, &local_view, &mut buf_view, feature, nbr_type, orthant);
                    }
                    outgoing.entry(rank).or_default().push(GhostPacket {
                        dest_patch_id: id,
                        sender_feature: feature,
                        sender_nbr_type: nbr_type,
                        orthant,
                        data: buf,
                    });
                }
            });
        }
    }

    // Step 2: send one batched message per destination rank.
    let dest_ranks: Vec<i32> = outgoing.keys().copied().collect();
    for (rank, packets) in &outgoing {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(packets, &mut buf).expect("ghost packet batch always encodes");
        send_tagged(domain.comm(), *rank as usize, TAG_GHOST, buf);
    }
    debug!("fill_ghost on rank {}: sent batches to {} rank(s)", my_rank, dest_ranks.len());

    // Step 4: physical-boundary fill and zeroing of slices about to be
    // accumulated into below. Each patch's own ghost layers depend only on
    // that patch, never on one mutated concurrently by this same step, so
    // it dispatches across patches with rayon rather than a lock.
    {
        let mut views = vector.patch_views_mut();
        views.par_iter_mut().zip(domain.patches().par_iter()).for_each(|(view, pinfo)| {
            filler.fill_ghost_cells_for_local_patch(pinfo, view);
        });
    }

    // Step 5: receive and accumulate. Every relation recorded on one side
    // exists on the other (domain.rs's construction-time invariant), so
    // the set of ranks we receive from is exactly the set we sent to.
    {
        let mut views = vector.patch_views_mut();
        for _ in 0..dest_ranks.len() {
            let bytes = recv_tagged(domain.comm(), TAG_GHOST);
            let packets: Vec<GhostPacket> = ciborium::de::from_reader(&bytes[..]).expect("malformed ghost packet batch");
            for packet in packets {
                let j = domain
                    .local_index_of(packet.dest_patch_id)
                    .expect("ghost packet addressed to a non-local patch") as usize;
                let feature = packet.sender_feature.opposite();
                let offsets = vec![0usize; feature.fixed_axes().len()];
                let mut nbr_ghost = views[j].get_ghost_slice_on_mut(&feature, &offsets);
                accumulate(&mut nbr_ghost, &packet.data);
            }
        }
    }
}

/// A reference filler: every ghost cell adjacent to a real neighbor ends up
/// holding that neighbor's `id`, cast to `f64`; physical-boundary ghost
/// cells stay zero. Exists for tests and small examples, the way
/// `octree::UniformOctree` stands in for a real tree library.
pub struct IdGhostFiller {
    pub fill_type: GhostFillingType,
}

impl GhostFiller for IdGhostFiller {
    fn fill_ghost_cells_for_local_patch(&self, pinfo: &PatchInfo, view: &mut ViewMut<f64>) {
        for_each_relation(pinfo, self.fill_type, |feature, _nbr_type, _id, rank, _orthant| {
            if rank != pinfo.rank {
                let offsets = vec![0usize; feature.fixed_axes().len()];
                let mut slice = view.get_ghost_slice_on_mut(&feature, &offsets);
                zero_fill(&mut slice);
            }
        });
    }

    fn fill_ghost_cells_for_nbr_patch(
        &self,
        pinfo: &PatchInfo,
        _local: &View<f64>,
        nbr_ghost: &mut ViewMut<f64>,
        _feature: Feature,
        _nbr_type: NbrType,
        _orthant: Option<Orthant>,
    ) {
        let lengths = nbr_ghost.lengths().to_vec();
        let total: usize = lengths.iter().product();
        for flat in 0..total {
            *nbr_ghost.get_mut(&multi_index(flat, &lengths)) = pinfo.id as f64;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::comm::local::LocalCommunicator;
    use crate::face::Side;
    use crate::neighbor_info::{NeighborInfo, NormalNbrInfo};

    fn patch(ndims: usize, id: i64, ns: usize) -> PatchInfo {
        let mut p = PatchInfo::new(ndims);
        p.id = id;
        p.ns = vec![ns; ndims];
        p
    }

    #[test]
    fn ghost_filling_type_nests_as_spec_describes() {
        assert!(!GhostFillingType::Faces.includes_edges());
        assert!(GhostFillingType::Edges.includes_edges());
        assert!(!GhostFillingType::Edges.includes_corners());
        assert!(GhostFillingType::Corners.includes_edges());
        assert!(GhostFillingType::Corners.includes_corners());
    }

    #[test]
    fn single_rank_normal_neighbor_gets_its_id_and_is_idempotent() {
        let mut group = LocalCommunicator::new_group(1);
        let comm = group.pop().unwrap();

        let mut a = patch(2, 10, 4);
        a.set_nbr_info(Side::East, NeighborInfo::Normal(NormalNbrInfo::new(20)));
        let mut b = patch(2, 20, 4);
        b.set_nbr_info(Side::West, NeighborInfo::Normal(NormalNbrInfo::new(10)));

        let domain = Domain::new(comm, 0, vec![4, 4], 1, vec![a, b]).unwrap();
        let mut vector = Vector::managed(domain.patches(), 1, 1);
        let filler = IdGhostFiller { fill_type: GhostFillingType::Faces };

        for _ in 0..2 {
            fill_ghost(&domain, &mut vector, GhostFillingType::Faces, &filler);

            let view_a = vector.get_patch_view(0);
            let east_ghost = view_a.get_ghost_slice_on(&Side::East, &[0]);
            for y in 0..4 {
                assert_eq!(*east_ghost.get(&[0, y]), 20.0);
            }
            let west_ghost_a = view_a.get_ghost_slice_on(&Side::West, &[0]);
            for y in 0..4 {
                assert_eq!(*west_ghost_a.get(&[0, y]), 0.0);
            }

            let view_b = vector.get_patch_view(1);
            let west_ghost_b = view_b.get_ghost_slice_on(&Side::West, &[0]);
            for y in 0..4 {
                assert_eq!(*west_ghost_b.get(&[0, y]), 10.0);
            }
        }
    }

    #[test]
    fn two_ranks_remote_normal_neighbor_is_idempotent() {
        let mut group = LocalCommunicator::new_group(2);
        let comm1 = group.pop().unwrap();
        let comm0 = group.pop().unwrap();

        let run = |comm, own_id: i64, nbr_id: i64, side: Side| {
            let mut p = patch(2, own_id, 4);
            p.set_nbr_info(side, NeighborInfo::Normal(NormalNbrInfo::new(nbr_id)));
            let domain = Domain::new(comm, 0, vec![4, 4], 1, vec![p]).unwrap();
            let mut vector = Vector::managed(domain.patches(), 1, 1);
            let filler = IdGhostFiller { fill_type: GhostFillingType::Faces };
            let mut last = Vec::new();
            for _ in 0..2 {
                fill_ghost(&domain, &mut vector, GhostFillingType::Faces, &filler);
                let view = vector.get_patch_view(0);
                let ghost = view.get_ghost_slice_on(&side, &[0]);
                last = (0..4).map(|y| *ghost.get(&[0, y])).collect();
            }
            last
        };

        let h0 = std::thread::spawn(move || run(comm0, 100, 200, Side::East));
        let h1 = std::thread::spawn(move || run(comm1, 200, 100, Side::West));

        let east_ghost = h0.join().unwrap();
        let west_ghost = h1.join().unwrap();
        assert!(east_ghost.iter().all(|&v| v == 200.0));
        assert!(west_ghost.iter().all(|&v| v == 100.0));
    }

    /// Stamps the sender's own `id` everywhere when filling a fine child's
    /// ghost cells from its coarse neighbor, but restricts a fine child's
    /// contribution to the coarse ghost slice to its own `orthant` half —
    /// otherwise two fine siblings would each overwrite the other's half of
    /// the shared coarse boundary.
    struct HangingNodeFiller;

    impl GhostFiller for HangingNodeFiller {
        fn fill_ghost_cells_for_local_patch(&self, _pinfo: &PatchInfo, _view: &mut ViewMut<f64>) {}

        fn fill_ghost_cells_for_nbr_patch(
            &self,
            pinfo: &PatchInfo,
            _local: &View<f64>,
            nbr_ghost: &mut ViewMut<f64>,
            _feature: Feature,
            nbr_type: NbrType,
            orthant: Option<Orthant>,
        ) {
            let lengths = nbr_ghost.lengths().to_vec();
            match nbr_type {
                NbrType::Fine => {
                    let total: usize = lengths.iter().product();
                    for flat in 0..total {
                        *nbr_ghost.get_mut(&multi_index(flat, &lengths)) = pinfo.id as f64;
                    }
                }
                NbrType::Coarse => {
                    let o = orthant.expect("a coarse-directed fill always carries an orthant");
                    let half = lengths[1] / 2;
                    let lo = if o.is_upper_on_axis(0) { half } else { 0 };
                    for y in lo..lo + half {
                        *nbr_ghost.get_mut(&[0, y as i64]) = pinfo.id as f64;
                    }
                }
                NbrType::Normal => unreachable!("this filler is only exercised on a coarse/fine mesh"),
            }
        }
    }

    #[test]
    fn single_rank_coarse_fine_hanging_node_fills_both_directions() {
        use crate::neighbor_info::{CoarseNbrInfo, FineNbrInfo};

        let mut group = LocalCommunicator::new_group(1);
        let comm = group.pop().unwrap();

        let mut c = patch(2, 100, 4);
        c.set_nbr_info(Side::East, NeighborInfo::Fine(FineNbrInfo::new(vec![101, 102])));
        let mut f_sw = patch(2, 101, 4);
        f_sw.set_nbr_info(Side::West, NeighborInfo::Coarse(CoarseNbrInfo::new(100, Some(Orthant::new(1, 0)))));
        let mut f_nw = patch(2, 102, 4);
        f_nw.set_nbr_info(Side::West, NeighborInfo::Coarse(CoarseNbrInfo::new(100, Some(Orthant::new(1, 1)))));

        let domain = Domain::new(comm, 0, vec![4, 4], 1, vec![c, f_sw, f_nw]).unwrap();
        let mut vector = Vector::managed(domain.patches(), 1, 1);
        let filler = HangingNodeFiller;
        fill_ghost(&domain, &mut vector, GhostFillingType::Faces, &filler);

        // Both fine children see the coarse patch's id on their whole West
        // ghost face.
        let view_sw = vector.get_patch_view(1);
        let west_sw = view_sw.get_ghost_slice_on(&Side::West, &[0]);
        for y in 0..4 {
            assert_eq!(*west_sw.get(&[0, y]), 100.0);
        }
        let view_nw = vector.get_patch_view(2);
        let west_nw = view_nw.get_ghost_slice_on(&Side::West, &[0]);
        for y in 0..4 {
            assert_eq!(*west_nw.get(&[0, y]), 100.0);
        }

        // The coarse patch's East ghost face is split: the lower half holds
        // the SW child's id, the upper half the NW child's.
        let view_c = vector.get_patch_view(0);
        let east_c = view_c.get_ghost_slice_on(&Side::East, &[0]);
        for y in 0..2 {
            assert_eq!(*east_c.get(&[0, y]), 101.0);
        }
        for y in 2..4 {
            assert_eq!(*east_c.get(&[0, y]), 102.0);
        }
    }
}
