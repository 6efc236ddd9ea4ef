// crates/karman-numerics/src/lib.rs

//! Numerics kernels: per-edge convective and viscous fluxes, MUSCL
//! reconstruction with limiters, and per-point source terms.
//!
//! Every kernel fills a [`KernelOutput`] (`residual`, `jac_i`, `jac_j`,
//! `status`); the solver only applies contributions whose status is
//! [`karman_core::KernelStatus::Ok`]. Scheme dispatch happens once per
//! iteration outside the edge loop: the chosen kernel is a concrete type,
//! not a virtual call per edge.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod convective;
pub mod flux;
pub mod limiters;
pub mod muscl;
pub mod sources;
pub mod viscous;

pub use convective::{AusmKernel, CenteredKernel, ConvKernel, HllcKernel, RoeKernel};
pub use flux::{inviscid_flux, inviscid_jacobian, spectral_radius_inv, spectral_radius_visc, EdgeState, KernelOutput};
pub use muscl::EdgeRecon;
pub use sources::{SourceCounters, SourceKind, SourceTerms};
pub use viscous::ViscousKernel;
