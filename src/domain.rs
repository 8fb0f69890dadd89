//! Owned collection of local patches plus the process-wide communicator.
//!
//! Construction runs a two-phase gather: an exclusive prefix sum of local
//! patch counts (the sequential-chain equivalent of `MPI_Scan`) to assign
//! `global_index`, then a gather of every rank's `id -> (rank,
//! global_index)` directory to rank 0 followed by a broadcast of the
//! combined directory, which both resolves every neighbor id's `(rank,
//! global_index)` and yields the global patch count as a side effect
//! (`directory.len()`). This trades a larger one-time message for a simpler
//! implementation than a real range-partitioned lookup, and the topology
//! core only pays this cost once per `Domain`.

use crate::comm::{recv_tagged, send_tagged, Communicator};
use crate::error::{Result, RuntimeError};
use crate::patch_info::PatchInfo;
use log::debug;
use std::collections::{HashMap, HashSet};

const TAG_SCAN: u32 = 1;
const TAG_DIRECTORY: u32 = 2;

pub struct Domain<C: Communicator> {
    comm: C,
    id: usize,
    ns: Vec<usize>,
    num_ghost_cells: usize,
    patches: Vec<PatchInfo>,
    id_to_local: HashMap<i64, i64>,
    num_global_patches: usize,
}

impl<C: Communicator> Domain<C> {
    /// Builds a `Domain` from this rank's patches, assigning
    /// `local_index`/`global_index` and resolving every neighbor's
    /// `local_index`/`global_index`/`rank`. Returns
    /// `RuntimeError::UnknownNeighbor` if some patch's neighbor id is owned
    /// by no rank.
    pub fn new(comm: C, id: usize, ns: Vec<usize>, num_ghost_cells: usize, patches: impl IntoIterator<Item = PatchInfo>) -> Result<Self> {
        let mut patches: Vec<PatchInfo> = patches.into_iter().collect();
        for (i, p) in patches.iter_mut().enumerate() {
            p.local_index = i as i64;
        }

        let exclusive = exclusive_prefix_sum(&comm, patches.len());
        for (i, p) in patches.iter_mut().enumerate() {
            p.global_index = exclusive + i as i64;
        }

        let id_to_local: HashMap<i64, i64> = patches.iter().map(|p| (p.id, p.local_index)).collect();
        for p in patches.iter_mut() {
            p.set_neighbor_local_indexes(&id_to_local);
        }

        let mut non_local: HashSet<i64> = HashSet::new();
        for p in &patches {
            for nbr_id in p.nbr_ids() {
                if !id_to_local.contains_key(&nbr_id) {
                    non_local.insert(nbr_id);
                }
            }
        }

        let local_directory: HashMap<i64, (i32, i64)> =
            patches.iter().map(|p| (p.id, (comm.rank() as i32, p.global_index))).collect();
        let directory = gather_and_broadcast_directory(&comm, local_directory);

        for &nbr_id in &non_local {
            if !directory.contains_key(&nbr_id) {
                return Err(RuntimeError::UnknownNeighbor { id: nbr_id });
            }
        }

        for p in patches.iter_mut() {
            p.set_neighbor_global_indexes(&directory);
        }

        debug!(
            "domain {} on rank {}: {} local patches, {} global patches",
            id,
            comm.rank(),
            patches.len(),
            directory.len()
        );

        Ok(Self {
            comm,
            id,
            ns,
            num_ghost_cells,
            patches,
            id_to_local,
            num_global_patches: directory.len(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn ns(&self) -> &[usize] {
        &self.ns
    }

    pub fn num_ghost_cells(&self) -> usize {
        self.num_ghost_cells
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn patches(&self) -> &[PatchInfo] {
        &self.patches
    }

    pub fn patches_mut(&mut self) -> &mut [PatchInfo] {
        &mut self.patches
    }

    pub fn get_num_local_patches(&self) -> usize {
        self.patches.len()
    }

    pub fn get_num_global_patches(&self) -> usize {
        self.num_global_patches
    }

    pub fn local_index_of(&self, id: i64) -> Option<i64> {
        self.id_to_local.get(&id).copied()
    }
}

/// Exclusive prefix sum of `local_count` across ranks, via a sequential
/// chain: rank `r` waits on rank `r-1`'s running total, adds its own count,
/// and forwards to rank `r+1`.
fn exclusive_prefix_sum<C: Communicator>(comm: &C, local_count: usize) -> i64 {
    let rank = comm.rank();
    let exclusive: i64 = if rank == 0 {
        0
    } else {
        let bytes = recv_tagged(comm, TAG_SCAN);
        i64::from_le_bytes(bytes.try_into().expect("scan message must be 8 bytes"))
    };
    if rank + 1 < comm.size() {
        let running = exclusive + local_count as i64;
        send_tagged(comm, rank + 1, TAG_SCAN, running.to_le_bytes().to_vec());
    }
    exclusive
}

/// Gathers every rank's `id -> (rank, global_index)` map to rank 0, unions
/// them, then broadcasts the combined directory back out.
fn gather_and_broadcast_directory<C: Communicator>(
    comm: &C,
    local: HashMap<i64, (i32, i64)>,
) -> HashMap<i64, (i32, i64)> {
    let rank = comm.rank();
    let size = comm.size();

    let mut combined = local.clone();
    if rank == 0 {
        for _ in 1..size {
            let bytes = recv_tagged(comm, TAG_DIRECTORY);
            let other: HashMap<i64, (i32, i64)> =
                ciborium::de::from_reader(&bytes[..]).expect("malformed directory fragment");
            combined.extend(other);
        }
    } else {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&local, &mut buf).expect("directory fragment always encodes");
        send_tagged(comm, 0, TAG_DIRECTORY, buf);
    }

    let combined_bytes = if rank == 0 {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&combined, &mut buf).expect("directory always encodes");
        comm.broadcast(Some(buf))
    } else {
        comm.broadcast(None)
    };
    ciborium::de::from_reader(&combined_bytes[..]).expect("malformed broadcast directory")
}
