//! `patchgrid`: the topology core for solving elliptic PDEs on adaptively
//! refined, block-structured Cartesian grids distributed across many
//! processes.
//!
//! Nine components, leaves first: face algebra (`face`), the strided
//! ghost-aware `view`, the three `neighbor_info` flavors, `patch_info`
//! (geometry plus neighbor map), `domain` (owned patches plus a
//! `comm::Communicator`), `vector` (per-patch cell data), `domain_generator`
//! (coarsening-level iterator over an `octree::Octree`), `ghost_filler`
//! (the halo-exchange driver), and `schur` (the derived interface topology
//! and Schur-complement patch-solver wrapper).

pub use domain::Domain;

pub mod comm;
pub mod domain;
pub mod domain_generator;
pub mod error;
pub mod face;
pub mod ghost_filler;
pub mod neighbor_info;
pub mod octree;
pub mod patch_info;
pub mod schur;
pub mod vector;
pub mod view;
