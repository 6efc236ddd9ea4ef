// crates/karman-mesh/src/lib.rs

//! Partitioned unstructured mesh.
//!
//! Two views share the point arena:
//! - [`dual::DualMesh`]: the median-dual grid the finite-volume pipeline
//!   iterates (interior edges, boundary vertices, dual volumes and normals),
//!   with halo points in a contiguous tail and an exchange plan fixed at
//!   partition time.
//! - [`dg::FemMesh`]: the hierarchical element/face catalog for the
//!   discontinuous-Galerkin discretization, keyed by VTK kind and polynomial
//!   order, with canonicalized face connectivities and per-time-level
//!   cumulative counts for time-accurate local time stepping.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod dg;
pub mod dual;
pub mod topo;

pub use dg::{
    create_connectivities_face, FemElement, FemElementSpec, FemFace, FemMesh, StandardCatalog,
    StandardElement,
};
pub use dual::{DualMesh, Edge, Marker, MeshBuilder, SurfElem, Vertex, VolElem};
