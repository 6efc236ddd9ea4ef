// crates/karman-smooth/src/lib.rs

//! Sobolev gradient smoothing.
//!
//! Maps raw nodal sensitivities `s` to a smoothed field `z` through the weak
//! elliptic problem
//!
//! ```text
//! int_Omega (eps^2 grad z . grad phi + z phi) dOmega = int_Omega s phi dOmega
//! ```
//!
//! assembled element by element over {Line, Triangle, Quadrilateral,
//! Tetrahedron, Hexahedron, Pyramid, Prism} with 1-point or higher-order
//! quadrature. Three operating modes: volume block-diagonal (one diagonal
//! per Cartesian direction), volume per-dimension sweep, and surface
//! (normal-component smoothing over a marker). The elliptic problem gets a
//! strong Dirichlet row on the "boundary of the boundary" (points shared by
//! two or more markers) and natural zero-Neumann elsewhere.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod assemble;
pub mod hessian;

pub use assemble::{smooth_surface, smooth_volume, SmoothOptions};
pub use hessian::{recover_dp, reduced_hessian, write_hessian_csv};
