//! Schur-complement interface topology built on top of a `Domain`.
//!
//! Everything lives in `interface_domain`; this module only re-exports it,
//! the way `comm/mod.rs` re-exports `local`/`tcp` under one namespace.

mod interface_domain;

pub use interface_domain::{Interface, InterfaceDomain, InterfaceRole, PatchSolver, PatchSolverWrapper};
