//! Neighbor descriptors.
//!
//! `Normal`/`Coarse`/`Fine` are modeled as a single tagged enum rather than
//! as subclasses behind a trait object — a closed, three-way choice of
//! neighbor shapes needs no runtime inheritance.

use crate::face::Orthant;
use serde::{Deserialize, Serialize};

/// One neighbor of equal refinement level.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalNbrInfo {
    pub id: i64,
    pub rank: i32,
    pub local_index: i64,
    pub global_index: i64,
}

impl NormalNbrInfo {
    pub fn new(id: i64) -> Self {
        Self { id, rank: -1, local_index: -1, global_index: -1 }
    }
}

/// One neighbor one level coarser than this patch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoarseNbrInfo {
    pub id: i64,
    pub rank: i32,
    pub local_index: i64,
    pub global_index: i64,
    /// Which sub-orthant of the coarse neighbor's feature this patch
    /// occupies. `None` means a corner-type coarse neighbor, which has no
    /// sub-orthant to choose since the shared feature is zero-dimensional.
    pub orth_on_coarse: Option<Orthant>,
}

impl CoarseNbrInfo {
    pub fn new(id: i64, orth_on_coarse: Option<Orthant>) -> Self {
        Self { id, rank: -1, local_index: -1, global_index: -1, orth_on_coarse }
    }
}

/// `2^M` neighbors one level finer than this patch, `M` the shared
/// feature's dimension (0 for a corner, 1 for an edge, `D-1` for a side).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FineNbrInfo {
    pub ids: Vec<i64>,
    pub ranks: Vec<i32>,
    pub local_indexes: Vec<i64>,
    pub global_indexes: Vec<i64>,
}

impl FineNbrInfo {
    pub fn new(ids: Vec<i64>) -> Self {
        let n = ids.len();
        Self {
            ids,
            ranks: vec![-1; n],
            local_indexes: vec![-1; n],
            global_indexes: vec![-1; n],
        }
    }
}

/// A tagged neighbor descriptor: exactly one of the three flavors C3
/// describes, installed in a `PatchInfo`'s neighbor map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeighborInfo {
    Normal(NormalNbrInfo),
    Coarse(CoarseNbrInfo),
    Fine(FineNbrInfo),
}

impl NeighborInfo {
    pub fn nbr_type(&self) -> crate::face::NbrType {
        use crate::face::NbrType;
        match self {
            NeighborInfo::Normal(_) => NbrType::Normal,
            NeighborInfo::Coarse(_) => NbrType::Coarse,
            NeighborInfo::Fine(_) => NbrType::Fine,
        }
    }

    /// Every id this descriptor refers to, in canonical (declaration) order.
    pub fn ids(&self) -> Vec<i64> {
        match self {
            NeighborInfo::Normal(n) => vec![n.id],
            NeighborInfo::Coarse(n) => vec![n.id],
            NeighborInfo::Fine(n) => n.ids.clone(),
        }
    }

    pub fn ranks(&self) -> Vec<i32> {
        match self {
            NeighborInfo::Normal(n) => vec![n.rank],
            NeighborInfo::Coarse(n) => vec![n.rank],
            NeighborInfo::Fine(n) => n.ranks.clone(),
        }
    }

    /// Fill `local_index` for every id present in `map`; ids absent from
    /// `map` are left at -1.
    pub fn set_local_indexes(&mut self, map: &std::collections::HashMap<i64, i64>) {
        match self {
            NeighborInfo::Normal(n) => {
                if let Some(&li) = map.get(&n.id) {
                    n.local_index = li;
                }
            }
            NeighborInfo::Coarse(n) => {
                if let Some(&li) = map.get(&n.id) {
                    n.local_index = li;
                }
            }
            NeighborInfo::Fine(n) => {
                for (id, li) in n.ids.iter().zip(n.local_indexes.iter_mut()) {
                    if let Some(&v) = map.get(id) {
                        *li = v;
                    }
                }
            }
        }
    }

    /// Fill `rank`/`global_index` for every id present in `map`.
    pub fn set_global_indexes(&mut self, map: &std::collections::HashMap<i64, (i32, i64)>) {
        match self {
            NeighborInfo::Normal(n) => {
                if let Some(&(rank, gi)) = map.get(&n.id) {
                    n.rank = rank;
                    n.global_index = gi;
                }
            }
            NeighborInfo::Coarse(n) => {
                if let Some(&(rank, gi)) = map.get(&n.id) {
                    n.rank = rank;
                    n.global_index = gi;
                }
            }
            NeighborInfo::Fine(n) => {
                for ((id, rank), gi) in n.ids.iter().zip(n.ranks.iter_mut()).zip(n.global_indexes.iter_mut()) {
                    if let Some(&(r, g)) = map.get(id) {
                        *rank = r;
                        *gi = g;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn fine_nbr_info_defaults_to_sentinels() {
        let fine = FineNbrInfo::new(vec![3, 4, 5, 6]);
        assert_eq!(fine.ranks, vec![-1, -1, -1, -1]);
        assert_eq!(fine.local_indexes, vec![-1, -1, -1, -1]);
        assert_eq!(fine.global_indexes, vec![-1, -1, -1, -1]);
    }

    #[test]
    fn set_local_indexes_leaves_unmapped_ids_at_sentinel() {
        let mut nbr = NeighborInfo::Fine(FineNbrInfo::new(vec![3, 4, 5, 6]));
        let mut map = HashMap::new();
        map.insert(3i64, 10i64);
        map.insert(5i64, 12i64);
        nbr.set_local_indexes(&map);
        if let NeighborInfo::Fine(f) = nbr {
            assert_eq!(f.local_indexes, vec![10, -1, 12, -1]);
        } else {
            panic!("expected Fine");
        }
    }

    #[test]
    fn coarse_corner_neighbor_has_no_orthant() {
        let nbr = CoarseNbrInfo::new(42, None);
        assert!(nbr.orth_on_coarse.is_none());
    }
}
