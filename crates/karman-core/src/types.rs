// crates/karman-core/src/types.rs

//! Canonical core types used across the karman workspace.
//!
//! These live in `karman-core` and are broadly re-exported at the crate root
//! so other crates can import via `karman_core::VtkKind`, `karman_core::Scalar`, etc.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Working floating-point type of the solver.
pub type Scalar = f64;

/// Index of a point in the mesh arena (owned points come before halos).
pub type PointId = usize;

/// Index of an edge of the dual grid.
pub type EdgeId = usize;

/// Index of a volume element.
pub type ElemId = usize;

/// Index of a boundary marker.
pub type MarkerId = usize;

/// Index of a vertex (a boundary point instance on a specific marker).
pub type VertexId = usize;

/// Global (pre-partition) point identifier, stable across ranks.
pub type GlobalId = u64;

/// Sentinel for "no periodic donor" on a point.
pub const NO_DONOR: i64 = -1;

/// Maximum spatial dimension supported; 2-D meshes leave the z slot zero.
pub const MAX_DIM: usize = 3;

/// VTK cell kind of a volume or surface element.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum VtkKind {
    Line,
    Triangle,
    Quadrilateral,
    Tetrahedron,
    Hexahedron,
    Prism,
    Pyramid,
}

impl VtkKind {
    /// Number of corner nodes of the linear element.
    #[inline]
    #[must_use]
    pub const fn n_corners(self) -> usize {
        match self {
            Self::Line => 2,
            Self::Triangle => 3,
            Self::Quadrilateral | Self::Tetrahedron => 4,
            Self::Pyramid => 5,
            Self::Prism => 6,
            Self::Hexahedron => 8,
        }
    }

    /// Parametric dimension of the element.
    #[inline]
    #[must_use]
    pub const fn dim(self) -> usize {
        match self {
            Self::Line => 1,
            Self::Triangle | Self::Quadrilateral => 2,
            _ => 3,
        }
    }

    /// Number of faces of the volume element (edges for 2-D kinds).
    #[inline]
    #[must_use]
    pub const fn n_faces(self) -> usize {
        match self {
            Self::Line => 2,
            Self::Triangle => 3,
            Self::Quadrilateral => 4,
            Self::Tetrahedron => 4,
            Self::Pyramid | Self::Prism => 5,
            Self::Hexahedron => 6,
        }
    }

    /// Number of solution DOFs for nodal polynomial order `p`.
    #[must_use]
    pub fn n_dofs(self, p: usize) -> usize {
        let p1 = p + 1;
        match self {
            Self::Line => p1,
            Self::Triangle => p1 * (p + 2) / 2,
            Self::Quadrilateral => p1 * p1,
            Self::Tetrahedron => p1 * (p + 2) * (p + 3) / 6,
            Self::Hexahedron => p1 * p1 * p1,
            Self::Prism => p1 * p1 * (p + 2) / 2,
            Self::Pyramid => p1 * (p + 2) * (2 * p + 3) / 6,
        }
    }
}

impl fmt::Display for VtkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Line => "LINE",
            Self::Triangle => "TRIANGLE",
            Self::Quadrilateral => "QUADRILATERAL",
            Self::Tetrahedron => "TETRAHEDRON",
            Self::Hexahedron => "HEXAHEDRON",
            Self::Prism => "PRISM",
            Self::Pyramid => "PYRAMID",
        };
        write!(f, "{s}")
    }
}

/// Outcome of a kernel evaluation. Residual/Jacobian contributions are only
/// applied on `Ok`; the other states increment counters and are skipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelStatus {
    /// Contribution is valid and may be accumulated.
    Ok,
    /// A reconstructed or derived state violated a physical bound.
    NonPhysical,
    /// A NaN appeared in the residual or a Jacobian block.
    NanDetected,
}

/// Universal gas constant [J/(kmol K)].
pub const R_UNIVERSAL: Scalar = 8314.462_618;

/// Square of the Euclidean norm of the first `n_dim` entries.
#[inline]
#[must_use]
pub fn norm2_sq(v: &[Scalar], n_dim: usize) -> Scalar {
    v[..n_dim].iter().map(|x| x * x).sum()
}

/// Euclidean norm of the first `n_dim` entries.
#[inline]
#[must_use]
pub fn norm2(v: &[Scalar], n_dim: usize) -> Scalar {
    norm2_sq(v, n_dim).sqrt()
}

/// Dot product over the first `n_dim` entries.
#[inline]
#[must_use]
pub fn dot(a: &[Scalar], b: &[Scalar], n_dim: usize) -> Scalar {
    (0..n_dim).map(|d| a[d] * b[d]).sum()
}

/// True if any entry of `v` is NaN.
#[inline]
#[must_use]
pub fn any_nan(v: &[Scalar]) -> bool {
    v.iter().any(|x| x.is_nan())
}
