//! Derived `(D-1)`-dimensional interface topology over a `Domain`, and the
//! `PatchSolverWrapper` that turns a per-patch solver into a Schur-
//! complement operator acting on interface vectors.
//!
//! Interfaces are enumerated from *local* information only: every
//! neighbor's `id`/`rank` is already resolved by `Domain::new`, so deciding
//! who "owns" a shared interface never needs an extra round of
//! communication — just a deterministic tie-break. A `Normal`-type relation
//! is owned by the lower-id patch; a `Coarse`/`Fine` relation is always
//! owned by the coarse side, since only the coarse patch's `FineNbrInfo`
//! already lists every fine child (the fine side only knows the single
//! coarse neighbor it touches, not its siblings). Global indices are a
//! prefix sum of each rank's owned-interface count, the same scheme
//! `domain.rs` uses for `PatchInfo::global_index`.
//!
//! Only `Side`-type faces produce interfaces: a `Side`'s one free axis
//! count (`D-1`) is exactly the interface dimensionality this module's
//! `Vector` factory produces, and `Edge`/`Corner` boundaries (`M < D-1`) do
//! not fit.
//!
//! Cross-rank interfaces (one participant local, the other not) are still
//! enumerated and indexed, so an external matrix-assembly layer can
//! reference them consistently. `apply` itself only reads/writes this
//! rank's own participant of each local interface — there is no ghost
//! exchange of interface values, since the distributed sparse-matrix
//! back-end that would consume them is out of scope for this crate.

use crate::comm::{recv_tagged, send_tagged, Communicator};
use crate::domain::Domain;
use crate::error::{Result, RuntimeError};
use crate::face::{NbrType, Orthant, Side};
use crate::patch_info::PatchInfo;
use crate::vector::Vector;
use crate::view::{View, ViewMut};

const TAG_IFACE_SCAN: u32 = 3;

/// A participant's own level relative to the interface it sits on: equal
/// level (`Normal`), the coarse side of a coarse/fine boundary (`Coarse`),
/// or one of the `2^(D-1)` fine children (`Fine`). Distinct from
/// [`crate::face::NbrType`], which instead describes the *neighbor's*
/// level as seen from one patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceRole {
    Normal,
    Coarse,
    Fine,
}

/// One patch's participation in an interface: which local patch (if this
/// rank owns it), which face of it, and its role.
#[derive(Clone, Debug)]
pub struct InterfaceParticipant {
    pub patch_local_index: Option<usize>,
    pub patch_id: i64,
    pub patch_rank: i32,
    pub feature: Side,
    pub role: InterfaceRole,
    pub orthant: Option<Orthant>,
}

/// One logical `(D-1)`-dimensional interface between patches.
#[derive(Clone, Debug)]
pub struct Interface {
    pub global_index: i64,
    pub lengths: Vec<usize>,
    pub participants: Vec<InterfaceParticipant>,
}

fn free_lengths(p: &PatchInfo, side: Side) -> Vec<usize> {
    (0..p.ndims()).filter(|&axis| axis != side.axis_index()).map(|axis| p.ns[axis]).collect()
}

fn local_participant(p: &PatchInfo, side: Side, role: InterfaceRole, orthant: Option<Orthant>) -> InterfaceParticipant {
    InterfaceParticipant {
        patch_local_index: Some(p.local_index as usize),
        patch_id: p.id,
        patch_rank: p.rank,
        feature: side,
        role,
        orthant,
    }
}

/// Exclusive prefix sum of `local_count`, mirroring `domain.rs`'s own scan
/// over a distinct tag so the two never interleave on the same wire.
fn exclusive_prefix_sum<C: Communicator>(comm: &C, local_count: usize) -> i64 {
    let rank = comm.rank();
    let exclusive: i64 = if rank == 0 {
        0
    } else {
        let bytes = recv_tagged(comm, TAG_IFACE_SCAN);
        i64::from_le_bytes(bytes.try_into().expect("scan message must be 8 bytes"))
    };
    if rank + 1 < comm.size() {
        let running = exclusive + local_count as i64;
        send_tagged(comm, rank + 1, TAG_IFACE_SCAN, running.to_le_bytes().to_vec());
    }
    exclusive
}

/// Enumerates the interfaces of a `Domain` and assigns them contiguous
/// global indices.
pub struct InterfaceDomain {
    interfaces: Vec<Interface>,
}

impl InterfaceDomain {
    pub fn new<C: Communicator>(domain: &Domain<C>) -> Self {
        let mut local: Vec<Interface> = Vec::new();

        for p in domain.patches() {
            for side in Side::for_dim(p.ndims()) {
                if !p.has_nbr(side) {
                    continue;
                }
                match p.get_nbr_type(side).expect("has_nbr checked above") {
                    NbrType::Normal => {
                        let n = p.get_normal_nbr_info(side).expect("nbr_type checked above");
                        if p.id < n.id {
                            local.push(Interface {
                                global_index: -1,
                                lengths: free_lengths(p, side),
                                participants: vec![
                                    local_participant(p, side, InterfaceRole::Normal, None),
                                    InterfaceParticipant {
                                        patch_local_index: None,
                                        patch_id: n.id,
                                        patch_rank: n.rank,
                                        feature: side.opposite(),
                                        role: InterfaceRole::Normal,
                                        orthant: None,
                                    },
                                ],
                            });
                        }
                    }
                    NbrType::Coarse => {
                        // Owned by the coarse side below; nothing to do here.
                    }
                    NbrType::Fine => {
                        let n = p.get_fine_nbr_info(side).expect("nbr_type checked above");
                        let lengths = free_lengths(p, side);
                        let free_ndims = lengths.len() as u8;

                        let mut coarse_participants = vec![local_participant(p, side, InterfaceRole::Coarse, None)];
                        for (k, (&id, &rank)) in n.ids.iter().zip(&n.ranks).enumerate() {
                            coarse_participants.push(InterfaceParticipant {
                                patch_local_index: None,
                                patch_id: id,
                                patch_rank: rank,
                                feature: side.opposite(),
                                role: InterfaceRole::Fine,
                                orthant: Some(Orthant::from_index(free_ndims, k)),
                            });
                        }
                        local.push(Interface { global_index: -1, lengths: lengths.clone(), participants: coarse_participants });

                        for (k, (&id, &rank)) in n.ids.iter().zip(&n.ranks).enumerate() {
                            let orth = Orthant::from_index(free_ndims, k);
                            local.push(Interface {
                                global_index: -1,
                                lengths: lengths.clone(),
                                participants: vec![
                                    local_participant(p, side, InterfaceRole::Coarse, Some(orth)),
                                    InterfaceParticipant {
                                        patch_local_index: None,
                                        patch_id: id,
                                        patch_rank: rank,
                                        feature: side.opposite(),
                                        role: InterfaceRole::Fine,
                                        orthant: Some(orth),
                                    },
                                ],
                            });
                        }
                    }
                }
            }
        }

        let exclusive = exclusive_prefix_sum(domain.comm(), local.len());
        for (k, iface) in local.iter_mut().enumerate() {
            iface.global_index = exclusive + k as i64;
        }

        Self { interfaces: local }
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// A scalar `Vector` with one cell per interface per `(D-1)`-face cell,
    /// no ghost margin (an interface value has no neighbor of its own).
    pub fn get_new_vector(&self) -> Vector {
        let fake: Vec<PatchInfo> = self
            .interfaces
            .iter()
            .map(|iface| {
                let mut p = PatchInfo::new(iface.lengths.len());
                p.ns = iface.lengths.clone();
                p
            })
            .collect();
        Vector::managed(&fake, 1, 0)
    }
}

fn multi_index(flat: usize, lengths: &[usize]) -> Vec<i64> {
    let mut idx = vec![0i64; lengths.len()];
    let mut rem = flat;
    for axis in (0..lengths.len()).rev() {
        idx[axis] = (rem % lengths[axis]) as i64;
        rem /= lengths[axis];
    }
    idx
}

fn copy_into(src: &View<f64>, dst: &mut ViewMut<f64>) {
    let lengths = dst.lengths().to_vec();
    let total: usize = lengths.iter().product();
    for flat in 0..total {
        let coord = multi_index(flat, &lengths);
        *dst.get_mut(&coord) = *src.get(&coord);
    }
}

fn subtract_into(x: &View<f64>, u_ghost: &View<f64>, b: &mut ViewMut<f64>) {
    let lengths = b.lengths().to_vec();
    let total: usize = lengths.iter().product();
    for flat in 0..total {
        let coord = multi_index(flat, &lengths);
        *b.get_mut(&coord) = *x.get(&coord) - *u_ghost.get(&coord);
    }
}

/// A solver over single patches of the underlying `Domain<D>`, the
/// collaborator `PatchSolverWrapper` turns into a Schur-complement operator.
/// `rhs` and `u` are full patch views (component axis plus every spatial
/// axis, ghost-inclusive); implementations write `u`'s interior in place.
pub trait PatchSolver: Sync {
    fn solve_single_patch(&self, pinfo: &PatchInfo, rhs: &View<f64>, u: &mut ViewMut<f64>);
}

/// Wraps a [`PatchSolver`] plus the ordinary [`crate::ghost_filler::GhostFiller`]
/// its solve step relies on, turning them into a linear operator on
/// `InterfaceDomain` vectors: `apply(x, b)` scatters the trial interface
/// values `x` into the domain vector's ghost cells, runs one domain-level
/// ghost fill and one patch solve, then reads the resulting ghost values
/// back out as the Schur complement residual `b = x - (filled ghost)`.
pub struct PatchSolverWrapper<'a, C: Communicator> {
    domain: &'a Domain<C>,
    iface_domain: &'a InterfaceDomain,
    ghost_filler: &'a dyn crate::ghost_filler::GhostFiller,
    solver: &'a dyn PatchSolver,
}

impl<'a, C: Communicator> PatchSolverWrapper<'a, C> {
    /// Fails with [`RuntimeError::NonCubePatch`] if any patch in `domain`
    /// is not cube-shaped (its `ns` values differ by axis).
    pub fn new(
        iface_domain: &'a InterfaceDomain,
        domain: &'a Domain<C>,
        ghost_filler: &'a dyn crate::ghost_filler::GhostFiller,
        solver: &'a dyn PatchSolver,
    ) -> Result<Self> {
        for p in domain.patches() {
            if let Some(&first) = p.ns.first() {
                if p.ns.iter().any(|&n| n != first) {
                    return Err(RuntimeError::NonCubePatch);
                }
            }
        }
        Ok(Self { domain, iface_domain, ghost_filler, solver })
    }

    /// `x` and `b` must both have been built by
    /// `self.iface_domain`'s [`InterfaceDomain::get_new_vector`].
    pub fn apply(&self, x: &Vector, b: &mut Vector) {
        let mut u = Vector::managed(self.domain.patches(), 1, self.domain.num_ghost_cells());
        self.scatter_interface_to_ghost(x, &mut u);
        self.run_solve(&mut u);
        self.gather_schur_rhs(x, &u, b);
    }

    fn scatter_interface_to_ghost(&self, x: &Vector, u: &mut Vector) {
        let mut views = u.patch_views_mut();
        for (k, iface) in self.iface_domain.interfaces().iter().enumerate() {
            let x_view = x.get_patch_view(k);
            for part in &iface.participants {
                if let Some(i) = part.patch_local_index {
                    let mut ghost = views[i].get_ghost_slice_on_mut(&part.feature, &[0]);
                    copy_into(&x_view, &mut ghost);
                }
            }
        }
    }

    fn run_solve(&self, u: &mut Vector) {
        crate::ghost_filler::fill_ghost(self.domain, u, crate::ghost_filler::GhostFillingType::Faces, self.ghost_filler);

        let patches = self.domain.patches();
        let num_ghost_cells = self.domain.num_ghost_cells();
        let mut views = u.patch_views_mut();
        for (i, pinfo) in patches.iter().enumerate() {
            let total: usize = pinfo.ns.iter().map(|n| n + 2 * num_ghost_cells).product();
            let rhs_buf = vec![0.0f64; total];
            let rhs_view = View::from_patch(rhs_buf.as_ptr(), &pinfo.ns, 1, num_ghost_cells);
            self.solver.solve_single_patch(pinfo, &rhs_view, &mut views[i]);
        }
    }

    fn gather_schur_rhs(&self, x: &Vector, u: &Vector, b: &mut Vector) {
        for (k, iface) in self.iface_domain.interfaces().iter().enumerate() {
            let x_view = x.get_patch_view(k);
            let mut b_view = b.get_patch_view_mut(k);
            if let Some(part) = iface.participants.iter().find(|p| p.patch_local_index.is_some()) {
                let i = part.patch_local_index.expect("filtered above");
                let u_view = u.get_patch_view(i);
                let u_ghost = u_view.get_ghost_slice_on(&part.feature, &[0]);
                subtract_into(&x_view, &u_ghost, &mut b_view);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::comm::local::LocalCommunicator;
    use crate::ghost_filler::{GhostFiller, GhostFillingType};
    use crate::neighbor_info::NormalNbrInfo;
    use crate::patch_info::PatchInfo as PI;
    use crate::view::{FixedAxes, View as V, ViewMut as VM};

    fn uniform_1x2(n: usize) -> Vec<PI> {
        let mut a = PI::new(2);
        a.id = 0;
        a.ns = vec![n, n];
        a.set_nbr_info(Side::East, crate::neighbor_info::NeighborInfo::Normal(NormalNbrInfo::new(1)));
        let mut b = PI::new(2);
        b.id = 1;
        b.ns = vec![n, n];
        b.set_nbr_info(Side::West, crate::neighbor_info::NeighborInfo::Normal(NormalNbrInfo::new(0)));
        vec![a, b]
    }

    #[test]
    fn uniform_1x2_mesh_has_exactly_one_interface_of_the_right_size() {
        let mut group = LocalCommunicator::new_group(1);
        let comm = group.pop().unwrap();
        let domain = Domain::new(comm, 0, vec![5, 5], 1, uniform_1x2(5)).unwrap();
        let iface_domain = InterfaceDomain::new(&domain);

        assert_eq!(iface_domain.interfaces().len(), 1);
        assert_eq!(iface_domain.interfaces()[0].lengths, vec![5]);
        assert_eq!(iface_domain.interfaces()[0].participants.len(), 2);
    }

    /// A ghost filler that writes a fixed constant into every ghost cell,
    /// standing in for `PatchSolverWrapper_MOCKS.h`'s `PatchFillingGhostFiller`.
    struct ConstantGhostFiller {
        value: f64,
    }

    impl GhostFiller for ConstantGhostFiller {
        fn fill_ghost_cells_for_local_patch(&self, pinfo: &crate::patch_info::PatchInfo, view: &mut VM<f64>) {
            // Ignores same-rank vs. remote and just stamps the constant
            // everywhere.
            for side in Side::for_dim(pinfo.ndims()) {
                let mut slice = view.get_ghost_slice_on_mut(&side, &vec![0usize; side.fixed_axes().len()]);
                let lengths = slice.lengths().to_vec();
                let total: usize = lengths.iter().product();
                for flat in 0..total {
                    *slice.get_mut(&multi_index(flat, &lengths)) = self.value;
                }
            }
        }

        fn fill_ghost_cells_for_nbr_patch(
            &self,
            _pinfo: &crate::patch_info::PatchInfo,
            _local: &V<f64>,
            nbr_ghost: &mut VM<f64>,
            _feature: crate::ghost_filler::Feature,
            _nbr_type: crate::face::NbrType,
            _orthant: Option<Orthant>,
        ) {
            let lengths = nbr_ghost.lengths().to_vec();
            let total: usize = lengths.iter().product();
            for flat in 0..total {
                *nbr_ghost.get_mut(&multi_index(flat, &lengths)) = self.value;
            }
        }
    }

    struct NoopPatchSolver;

    impl PatchSolver for NoopPatchSolver {
        fn solve_single_patch(&self, _pinfo: &crate::patch_info::PatchInfo, _rhs: &View<f64>, _u: &mut ViewMut<f64>) {}
    }

    #[test]
    fn apply_gives_zero_rhs_when_x_matches_the_ghost_filler_constant() {
        let mut group = LocalCommunicator::new_group(1);
        let comm = group.pop().unwrap();
        let domain = Domain::new(comm, 0, vec![5, 5], 1, uniform_1x2(5)).unwrap();
        let iface_domain = InterfaceDomain::new(&domain);
        let k = 3.5;
        let filler = ConstantGhostFiller { value: k };
        let solver = NoopPatchSolver;
        let wrapper = PatchSolverWrapper::new(&iface_domain, &domain, &filler, &solver).unwrap();

        let mut x = iface_domain.get_new_vector();
        let mut b = iface_domain.get_new_vector();
        for i in 0..x.num_local_patches() {
            let mut view = x.get_patch_view_mut(i);
            for coord in 0..5i64 {
                *view.get_mut(&[0, coord]) = k;
            }
        }

        wrapper.apply(&x, &mut b);

        for i in 0..b.num_local_patches() {
            let view = b.get_patch_view(i);
            for coord in 0..5i64 {
                assert_eq!(*view.get(&[0, coord]), 0.0);
            }
        }
    }

    #[test]
    fn non_cube_patch_is_rejected() {
        let mut group = LocalCommunicator::new_group(1);
        let comm = group.pop().unwrap();
        let mut p = PI::new(2);
        p.ns = vec![5, 7];
        let domain = Domain::new(comm, 0, vec![5, 7], 1, vec![p]).unwrap();
        let iface_domain = InterfaceDomain::new(&domain);
        let filler = ConstantGhostFiller { value: 0.0 };
        let solver = NoopPatchSolver;

        let err = PatchSolverWrapper::new(&iface_domain, &domain, &filler, &solver).unwrap_err();
        assert!(matches!(err, RuntimeError::NonCubePatch));
    }
}
