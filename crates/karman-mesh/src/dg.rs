// crates/karman-mesh/src/dg.rs

//! Hierarchical element/face catalog for the discontinuous-Galerkin
//! discretization.
//!
//! Standard elements are keyed by (VTK kind, polynomial order). The geometry
//! basis is P1 (straight-sided elements); the solution order is carried per
//! element and only sizes DOF blocks. Faces are canonicalized against the
//! standard element of their adjacent volume element: the face connectivity
//! is renumbered to the canonical corner order, except for the triangular
//! faces of a pyramid and the quadrilateral faces of a prism, where a
//! `swap_face_in_element` flag is set instead and the volume connectivity is
//! renumbered on retrieval.
//!
//! Matching internal faces are sorted by (time-level bucket, internal-vs-halo
//! bucket, side-0 element id) for cache-friendly traversal, and elements are
//! stored owned-first, grouped by time level with cumulative counts, to
//! support time-accurate local time stepping.

use crate::topo;
use karman_core::{CoreResult, KarmanError, PointId, Scalar, VtkKind, MAX_DIM};
use std::collections::HashMap;

/* --------------------------- standard elements ----------------------------- */

/// Integration rule + P1 basis data of a reference element.
#[derive(Clone, Debug)]
pub struct StandardElement {
    pub vtk: VtkKind,
    /// Solution polynomial order this entry serves.
    pub n_poly: usize,
    /// Solution DOFs per element at `n_poly`.
    pub n_dofs_sol: usize,
    /// Integration points in reference coordinates, `n_int * MAX_DIM`.
    pub int_points: Vec<Scalar>,
    /// Quadrature weights, `n_int`.
    pub weights: Vec<Scalar>,
    /// P1 basis values at the integration points, `n_int * n_corners`.
    pub basis: Vec<Scalar>,
    /// P1 basis reference-gradient at the integration points,
    /// `n_int * n_corners * MAX_DIM`.
    pub d_basis: Vec<Scalar>,
}

impl StandardElement {
    /// Build the reference element for (kind, solution order).
    #[must_use]
    pub fn build(vtk: VtkKind, n_poly: usize) -> Self {
        let (pts, weights) = quadrature(vtk);
        let n_corners = vtk.n_corners();
        let n_int = weights.len();
        let mut basis = vec![0.0; n_int * n_corners];
        let mut d_basis = vec![0.0; n_int * n_corners * MAX_DIM];
        for q in 0..n_int {
            let r = &pts[q * MAX_DIM..(q + 1) * MAX_DIM];
            let (vals, grads) = p1_shape(vtk, r);
            for k in 0..n_corners {
                basis[q * n_corners + k] = vals[k];
                for d in 0..MAX_DIM {
                    d_basis[(q * n_corners + k) * MAX_DIM + d] = grads[k][d];
                }
            }
        }
        Self { vtk, n_poly, n_dofs_sol: vtk.n_dofs(n_poly), int_points: pts, weights, basis, d_basis }
    }

    #[inline]
    #[must_use]
    pub fn n_int(&self) -> usize {
        self.weights.len()
    }

    /// `dx/dr` at integration point `q` for corner coordinates `xs`
    /// (`n_corners * n_dim`, element-local). Row-major `n_dim x pdim`.
    #[must_use]
    pub fn dxdr(&self, q: usize, xs: &[Scalar], n_dim: usize) -> [[Scalar; MAX_DIM]; MAX_DIM] {
        let n_corners = self.vtk.n_corners();
        let pdim = self.vtk.dim();
        let mut out = [[0.0; MAX_DIM]; MAX_DIM];
        for k in 0..n_corners {
            for d in 0..n_dim {
                let x = xs[k * n_dim + d];
                for p in 0..pdim {
                    out[d][p] += x * self.d_basis[(q * n_corners + k) * MAX_DIM + p];
                }
            }
        }
        out
    }
}

/// Catalog of standard elements keyed by (VTK kind, polynomial order).
#[derive(Debug, Default)]
pub struct StandardCatalog {
    table: HashMap<(VtkKind, usize), StandardElement>,
}

impl StandardCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (building on first use) the standard element for a key.
    pub fn get(&mut self, vtk: VtkKind, n_poly: usize) -> &StandardElement {
        self.table.entry((vtk, n_poly)).or_insert_with(|| StandardElement::build(vtk, n_poly))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// P1 shape functions and reference gradients at point `r`.
///
/// Reference domains: line/quad/hex on `[-1,1]^d`; triangle `(0,0)-(1,0)-(0,1)`;
/// tet the unit simplex; prism simplex x `[-1,1]`; pyramid the VTK reference
/// with apex at `t = 1`.
#[allow(clippy::too_many_lines)]
#[must_use]
pub fn p1_shape(vtk: VtkKind, r: &[Scalar]) -> (Vec<Scalar>, Vec<[Scalar; MAX_DIM]>) {
    let (u, v, w) = (r[0], r[1], r[2]);
    match vtk {
        VtkKind::Line => (
            vec![0.5 * (1.0 - u), 0.5 * (1.0 + u)],
            vec![[-0.5, 0.0, 0.0], [0.5, 0.0, 0.0]],
        ),
        VtkKind::Triangle => (
            vec![1.0 - u - v, u, v],
            vec![[-1.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        ),
        VtkKind::Quadrilateral => {
            let vals = vec![
                0.25 * (1.0 - u) * (1.0 - v),
                0.25 * (1.0 + u) * (1.0 - v),
                0.25 * (1.0 + u) * (1.0 + v),
                0.25 * (1.0 - u) * (1.0 + v),
            ];
            let grads = vec![
                [-0.25 * (1.0 - v), -0.25 * (1.0 - u), 0.0],
                [0.25 * (1.0 - v), -0.25 * (1.0 + u), 0.0],
                [0.25 * (1.0 + v), 0.25 * (1.0 + u), 0.0],
                [-0.25 * (1.0 + v), 0.25 * (1.0 - u), 0.0],
            ];
            (vals, grads)
        }
        VtkKind::Tetrahedron => (
            vec![1.0 - u - v - w, u, v, w],
            vec![
                [-1.0, -1.0, -1.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
            ],
        ),
        VtkKind::Hexahedron => {
            let signs: [(Scalar, Scalar, Scalar); 8] = [
                (-1.0, -1.0, -1.0),
                (1.0, -1.0, -1.0),
                (1.0, 1.0, -1.0),
                (-1.0, 1.0, -1.0),
                (-1.0, -1.0, 1.0),
                (1.0, -1.0, 1.0),
                (1.0, 1.0, 1.0),
                (-1.0, 1.0, 1.0),
            ];
            let mut vals = Vec::with_capacity(8);
            let mut grads = Vec::with_capacity(8);
            for (su, sv, sw) in signs {
                vals.push(0.125 * (1.0 + su * u) * (1.0 + sv * v) * (1.0 + sw * w));
                grads.push([
                    0.125 * su * (1.0 + sv * v) * (1.0 + sw * w),
                    0.125 * sv * (1.0 + su * u) * (1.0 + sw * w),
                    0.125 * sw * (1.0 + su * u) * (1.0 + sv * v),
                ]);
            }
            (vals, grads)
        }
        VtkKind::Prism => {
            // Triangle (u,v) x line w in [-1,1].
            let tri = [1.0 - u - v, u, v];
            let dtri = [[-1.0, -1.0], [1.0, 0.0], [0.0, 1.0]];
            let (lo, hi) = (0.5 * (1.0 - w), 0.5 * (1.0 + w));
            let mut vals = Vec::with_capacity(6);
            let mut grads = Vec::with_capacity(6);
            for (lw, dl) in [(lo, -0.5), (hi, 0.5)] {
                for k in 0..3 {
                    vals.push(tri[k] * lw);
                    grads.push([dtri[k][0] * lw, dtri[k][1] * lw, tri[k] * dl]);
                }
            }
            (vals, grads)
        }
        VtkKind::Pyramid => {
            // Rational pyramid basis, base quad at w=0, apex node 4 at w=1.
            let om = (1.0 - w).max(1e-12);
            let a = 1.0 - u - w;
            let b = 1.0 - v - w;
            let vals = vec![
                a * b / om,
                u * b / om,
                u * v / om,
                a * v / om,
                w,
            ];
            let om2 = om * om;
            let grads = vec![
                [-b / om, -a / om, (-b * om - a * om + a * b) / om2],
                [b / om, -u / om, (-u * om + u * b) / om2],
                [v / om, u / om, u * v / om2],
                [-v / om, a / om, (-v * om + a * v) / om2],
                [0.0, 0.0, 1.0],
            ];
            (vals, grads)
        }
    }
}

/// Quadrature rule (reference points with `MAX_DIM` stride, weights).
#[must_use]
fn quadrature(vtk: VtkKind) -> (Vec<Scalar>, Vec<Scalar>) {
    let g = 1.0 / (3.0 as Scalar).sqrt();
    match vtk {
        VtkKind::Line => (vec![-g, 0.0, 0.0, g, 0.0, 0.0], vec![1.0, 1.0]),
        VtkKind::Triangle => {
            // 3-point rule, degree 2.
            let pts = [
                [1.0 / 6.0, 1.0 / 6.0],
                [2.0 / 3.0, 1.0 / 6.0],
                [1.0 / 6.0, 2.0 / 3.0],
            ];
            let mut flat = Vec::new();
            for p in pts {
                flat.extend_from_slice(&[p[0], p[1], 0.0]);
            }
            (flat, vec![1.0 / 6.0; 3])
        }
        VtkKind::Quadrilateral => {
            let mut flat = Vec::new();
            for v in [-g, g] {
                for u in [-g, g] {
                    flat.extend_from_slice(&[u, v, 0.0]);
                }
            }
            (flat, vec![1.0; 4])
        }
        VtkKind::Tetrahedron => {
            let a = (5.0 - (5.0 as Scalar).sqrt()) / 20.0;
            let b = (5.0 + 3.0 * (5.0 as Scalar).sqrt()) / 20.0;
            let pts = [[a, a, a], [b, a, a], [a, b, a], [a, a, b]];
            let mut flat = Vec::new();
            for p in pts {
                flat.extend_from_slice(&p);
            }
            (flat, vec![1.0 / 24.0; 4])
        }
        VtkKind::Hexahedron => {
            let mut flat = Vec::new();
            for w in [-g, g] {
                for v in [-g, g] {
                    for u in [-g, g] {
                        flat.extend_from_slice(&[u, v, w]);
                    }
                }
            }
            (flat, vec![1.0; 8])
        }
        VtkKind::Prism => {
            let tri = [[1.0 / 6.0, 1.0 / 6.0], [2.0 / 3.0, 1.0 / 6.0], [1.0 / 6.0, 2.0 / 3.0]];
            let mut flat = Vec::new();
            let mut wts = Vec::new();
            for w in [-g, g] {
                for p in tri {
                    flat.extend_from_slice(&[p[0], p[1], w]);
                    wts.push(1.0 / 6.0);
                }
            }
            (flat, wts)
        }
        VtkKind::Pyramid => {
            // Conical product: 2x2 Gauss on the (shrinking) base quad times
            // 2-pt Gauss in the apex direction; the base side is 1-t.
            let h = 0.5 / (3.0 as Scalar).sqrt();
            let mut flat = Vec::new();
            let mut wts = Vec::new();
            for t in [0.5 - h, 0.5 + h] {
                let s: Scalar = 1.0 - t;
                for v in [-g, g] {
                    for u in [-g, g] {
                        flat.extend_from_slice(&[s * 0.5 * (u + 1.0), s * 0.5 * (v + 1.0), t]);
                        wts.push(0.5 * s * s / 4.0);
                    }
                }
            }
            (flat, wts)
        }
    }
}

/* ------------------------------ face catalog ------------------------------- */

/// Kinds whose canonical standard face does not match natively: the face is
/// flagged for a volume-connectivity swap instead of being reordered.
#[inline]
#[must_use]
fn needs_swap(elem: VtkKind, face: VtkKind) -> bool {
    matches!((elem, face), (VtkKind::Pyramid, VtkKind::Triangle) | (VtkKind::Prism, VtkKind::Quadrilateral))
}

/// Renumber `face_nodes` so that it matches a canonical face of the adjacent
/// element. Returns `(i_face, connectivity, swap_face_in_element)`.
///
/// A connectivity that matches no canonical face is a fatal mesh error.
pub fn create_connectivities_face(
    face_vtk: VtkKind,
    face_nodes: &[PointId],
    elem_vtk: VtkKind,
    elem_nodes: &[PointId],
) -> CoreResult<(usize, Vec<PointId>, bool)> {
    for (i_face, corners) in topo::elem_faces(elem_vtk).iter().enumerate() {
        if corners.len() != face_nodes.len() || topo::face_kind(elem_vtk, i_face) != face_vtk {
            continue;
        }
        let canonical: Vec<PointId> = corners.iter().map(|&k| elem_nodes[k]).collect();
        let mut sorted_a = canonical.clone();
        let mut sorted_b = face_nodes.to_vec();
        sorted_a.sort_unstable();
        sorted_b.sort_unstable();
        if sorted_a != sorted_b {
            continue;
        }
        if canonical == face_nodes {
            // Already canonical; never swap twice.
            return Ok((i_face, canonical, false));
        }
        if needs_swap(elem_vtk, face_vtk) {
            // Keep the caller's order; the volume connectivity is adjusted.
            return Ok((i_face, face_nodes.to_vec(), true));
        }
        return Ok((i_face, canonical, false));
    }
    Err(KarmanError::Mesh(format!(
        "face {face_nodes:?} ({face_vtk}) matches no canonical face of {elem_vtk} {elem_nodes:?}"
    )))
}

/* -------------------------------- FEM mesh --------------------------------- */

/// DG volume element record.
#[derive(Clone, Debug)]
pub struct FemElement {
    pub vtk: VtkKind,
    pub n_poly_grid: usize,
    pub n_poly_sol: usize,
    pub owned: bool,
    pub orig_rank: usize,
    pub time_level: u8,
    pub global_id: u64,
    /// First solution DOF in the rank-local numbering.
    pub offset_dof_local: usize,
    /// First solution DOF within this element's time level.
    pub offset_dof_level: usize,
    /// Grid node ids (P1 corners).
    pub nodes: Vec<PointId>,
    /// Constant-Jacobian flag per face (always true for P1 simplex faces).
    pub const_jac_faces: Vec<bool>,
}

/// Matching internal or boundary face.
#[derive(Clone, Debug)]
pub struct FemFace {
    pub vtk: VtkKind,
    /// Face index within the side-0 element's standard element.
    pub std_face: usize,
    /// Adjacent element ids; `elems[0] < elems[1]` for internal faces,
    /// `elems[1] == usize::MAX` for boundary faces.
    pub elems: [usize; 2],
    /// Grid DOF lists per side, canonicalized.
    pub dofs_grid: [Vec<PointId>; 2],
    /// Solution DOF offsets per side (`offset..offset + n_dofs`).
    pub dofs_sol: [usize; 2],
    /// Swap flags per side (triangular pyramid / quadrilateral prism faces).
    pub swap_in_elem: [bool; 2],
    /// Face normals at integration points, `n_int * MAX_DIM`, side 0 -> side 1
    /// (outward for boundary faces), scaled by the surface Jacobian and weight.
    pub normals: Vec<Scalar>,
    /// Per-side constant `dr/dx` of the adjacent elements, `2 * MAX_DIM * MAX_DIM`.
    pub drdx: Vec<Scalar>,
    pub time_level: u8,
}

impl FemFace {
    #[inline]
    #[must_use]
    pub fn is_boundary(&self) -> bool {
        self.elems[1] == usize::MAX
    }
}

/// DG mesh view: elements grouped owned-first by time level, canonicalized
/// faces sorted for traversal, and the standard-element catalog.
#[derive(Debug)]
pub struct FemMesh {
    pub n_dim: usize,
    pub n_time_levels: usize,
    pub elements: Vec<FemElement>,
    /// Cumulative owned-element counts per level (exclusive upper bounds).
    pub count_per_level_owned: Vec<usize>,
    /// Cumulative counts per level over the halo tail.
    pub count_per_level_halo: Vec<usize>,
    pub faces: Vec<FemFace>,
    pub catalog: StandardCatalog,
}

/// Per-element input to [`FemMesh::build`].
#[derive(Clone, Debug)]
pub struct FemElementSpec {
    pub vtk: VtkKind,
    pub nodes: Vec<PointId>,
    pub n_poly_sol: usize,
    pub time_level: u8,
    pub owned: bool,
    pub orig_rank: usize,
    pub global_id: u64,
}

impl FemMesh {
    /// Assemble the DG view from element specs and grid coordinates
    /// (`n_point * n_dim`).
    pub fn build(
        n_dim: usize,
        n_time_levels: usize,
        specs: &[FemElementSpec],
        coords: &[Scalar],
    ) -> CoreResult<Self> {
        for s in specs {
            if usize::from(s.time_level) >= n_time_levels {
                return Err(KarmanError::Mesh(format!(
                    "element {} has time level {} of {n_time_levels}",
                    s.global_id, s.time_level
                )));
            }
        }

        // Owned-first, grouped by time level, stable in global id.
        let mut order: Vec<usize> = (0..specs.len()).collect();
        order.sort_by_key(|&e| (!specs[e].owned, specs[e].time_level, specs[e].global_id));

        let mut elements = Vec::with_capacity(specs.len());
        let mut count_per_level_owned = vec![0usize; n_time_levels];
        let mut count_per_level_halo = vec![0usize; n_time_levels];
        let mut dof_local = 0usize;
        let mut dof_level = vec![0usize; n_time_levels];
        for &e in &order {
            let s = &specs[e];
            let lvl = usize::from(s.time_level);
            if s.owned {
                count_per_level_owned[lvl] += 1;
            } else {
                count_per_level_halo[lvl] += 1;
            }
            let n_dofs = s.vtk.n_dofs(s.n_poly_sol);
            let const_jac = matches!(s.vtk, VtkKind::Triangle | VtkKind::Tetrahedron);
            elements.push(FemElement {
                vtk: s.vtk,
                n_poly_grid: 1,
                n_poly_sol: s.n_poly_sol,
                owned: s.owned,
                orig_rank: s.orig_rank,
                time_level: s.time_level,
                global_id: s.global_id,
                offset_dof_local: dof_local,
                offset_dof_level: dof_level[lvl],
                nodes: s.nodes.clone(),
                const_jac_faces: vec![const_jac; s.vtk.n_faces()],
            });
            dof_local += n_dofs;
            dof_level[lvl] += n_dofs;
        }
        // Exclusive cumulative bounds.
        for k in 1..n_time_levels {
            count_per_level_owned[k] += count_per_level_owned[k - 1];
            count_per_level_halo[k] += count_per_level_halo[k - 1];
        }

        let mut mesh = Self {
            n_dim,
            n_time_levels,
            elements,
            count_per_level_owned,
            count_per_level_halo,
            faces: Vec::new(),
            catalog: StandardCatalog::new(),
        };
        mesh.build_faces(coords)?;
        Ok(mesh)
    }

    /// Enumerate, canonicalize, sort, and attach metric terms to faces.
    fn build_faces(&mut self, coords: &[Scalar]) -> CoreResult<()> {
        // Match element faces by sorted corner sets.
        let mut open: HashMap<Vec<PointId>, (usize, usize)> = HashMap::new();
        let mut pairs: Vec<(usize, usize, usize, usize)> = Vec::new(); // (e0, f0, e1, f1)
        let mut boundary: Vec<(usize, usize)> = Vec::new();
        for (e, el) in self.elements.iter().enumerate() {
            for (f, corners) in topo::elem_faces(el.vtk).iter().enumerate() {
                let mut key: Vec<PointId> = corners.iter().map(|&k| el.nodes[k]).collect();
                key.sort_unstable();
                if let Some((e0, f0)) = open.remove(&key) {
                    pairs.push((e0, f0, e, f));
                } else {
                    open.insert(key, (e, f));
                }
            }
        }
        boundary.extend(open.into_values());

        let mut faces = Vec::with_capacity(pairs.len() + boundary.len());
        for (e0, f0, e1, f1) in pairs {
            // Side 0 owns the lower element id.
            let (e0, f0, e1, f1) = if e0 <= e1 { (e0, f0, e1, f1) } else { (e1, f1, e0, f0) };
            faces.push(self.make_face(coords, e0, f0, Some((e1, f1)))?);
        }
        for (e, f) in boundary {
            faces.push(self.make_face(coords, e, f, None)?);
        }

        // Traversal order: time level, halo-neighbor bucket, owning element.
        faces.sort_by_key(|fc| {
            let halo_bucket = usize::from(!fc.is_boundary() && !self.elements[fc.elems[1]].owned);
            (fc.time_level, halo_bucket, fc.elems[0])
        });
        self.faces = faces;
        Ok(())
    }

    fn make_face(
        &mut self,
        coords: &[Scalar],
        e0: usize,
        f0: usize,
        other: Option<(usize, usize)>,
    ) -> CoreResult<FemFace> {
        let n_dim = self.n_dim;
        let el0 = self.elements[e0].clone();
        let face_vtk = topo::face_kind(el0.vtk, f0);
        let desired: Vec<PointId> = topo::elem_faces(el0.vtk)[f0].iter().map(|&k| el0.nodes[k]).collect();

        let (std_face, conn0, swap0) = create_connectivities_face(face_vtk, &desired, el0.vtk, &el0.nodes)?;
        let (conn1, swap1, elems, dofs_sol, time_level) = match other {
            Some((e1, _f1)) => {
                let el1 = self.elements[e1].clone();
                let (_, c1, s1) = create_connectivities_face(face_vtk, &desired, el1.vtk, &el1.nodes)?;
                (
                    c1,
                    s1,
                    [e0, e1],
                    [el0.offset_dof_local, el1.offset_dof_local],
                    el0.time_level.min(el1.time_level),
                )
            }
            None => (conn0.clone(), false, [e0, usize::MAX], [el0.offset_dof_local, usize::MAX], el0.time_level),
        };

        // Metric terms at the face integration points (P1 geometry).
        let std = StandardElement::build(face_vtk, 1);
        let n_corners = face_vtk.n_corners();
        let mut xs = vec![0.0; n_corners * n_dim];
        for (k, &p) in conn0.iter().enumerate() {
            xs[k * n_dim..(k + 1) * n_dim].copy_from_slice(&coords[p * n_dim..(p + 1) * n_dim]);
        }
        let mut normals = vec![0.0; std.n_int() * MAX_DIM];
        for q in 0..std.n_int() {
            let dxdr = std.dxdr(q, &xs, n_dim);
            let n = if n_dim == 2 {
                [dxdr[1][0], -dxdr[0][0], 0.0]
            } else {
                [
                    dxdr[1][0] * dxdr[2][1] - dxdr[2][0] * dxdr[1][1],
                    dxdr[2][0] * dxdr[0][1] - dxdr[0][0] * dxdr[2][1],
                    dxdr[0][0] * dxdr[1][1] - dxdr[1][0] * dxdr[0][1],
                ]
            };
            for d in 0..MAX_DIM {
                normals[q * MAX_DIM + d] = n[d] * std.weights[q];
            }
        }
        // Orient side 0 -> side 1 (outward from side 0 on the boundary).
        let c0 = centroid_of(&self.elements[e0].nodes, coords, n_dim);
        let target = match other {
            Some((e1, _)) => {
                let c1 = centroid_of(&self.elements[e1].nodes, coords, n_dim);
                [c1[0] - c0[0], c1[1] - c0[1], c1[2] - c0[2]]
            }
            None => {
                let fc = centroid_of(&conn0, coords, n_dim);
                [fc[0] - c0[0], fc[1] - c0[1], fc[2] - c0[2]]
            }
        };
        let mut along = 0.0;
        for d in 0..n_dim {
            along += normals[d] * target[d];
        }
        if along < 0.0 {
            for v in &mut normals {
                *v = -*v;
            }
        }

        // Per-side constant dr/dx from the adjacent elements' P1 Jacobians.
        let mut drdx = vec![0.0; 2 * MAX_DIM * MAX_DIM];
        for (side, e) in [(0usize, Some(e0)), (1, other.map(|(e1, _)| e1))] {
            let Some(e) = e else { continue };
            let el = &self.elements[e];
            let vstd = self.catalog.get(el.vtk, 1).clone();
            let mut exs = vec![0.0; el.nodes.len() * n_dim];
            for (k, &p) in el.nodes.iter().enumerate() {
                exs[k * n_dim..(k + 1) * n_dim].copy_from_slice(&coords[p * n_dim..(p + 1) * n_dim]);
            }
            let dxdr = vstd.dxdr(0, &exs, n_dim);
            let inv = invert_small(&dxdr, n_dim).ok_or_else(|| {
                KarmanError::Mesh(format!("degenerate Jacobian in element {}", el.global_id))
            })?;
            for a in 0..n_dim {
                for b in 0..n_dim {
                    drdx[(side * MAX_DIM + a) * MAX_DIM + b] = inv[a][b];
                }
            }
        }

        Ok(FemFace {
            vtk: face_vtk,
            std_face,
            elems,
            dofs_grid: [conn0, conn1],
            dofs_sol,
            swap_in_elem: [swap0, swap1],
            normals,
            drdx,
            time_level,
        })
    }

    /// Exclusive upper element bound for owned elements of `level`.
    pub fn owned_bound(&self, level: usize) -> CoreResult<usize> {
        self.count_per_level_owned
            .get(level)
            .copied()
            .ok_or_else(|| KarmanError::Mesh(format!("time level {level} out of range")))
    }
}

fn centroid_of(nodes: &[PointId], coords: &[Scalar], n_dim: usize) -> [Scalar; MAX_DIM] {
    let mut c = [0.0; MAX_DIM];
    for &p in nodes {
        for d in 0..n_dim {
            c[d] += coords[p * n_dim + d];
        }
    }
    #[allow(clippy::cast_precision_loss)]
    let inv = 1.0 / nodes.len() as Scalar;
    for v in &mut c {
        *v *= inv;
    }
    c
}

fn invert_small(m: &[[Scalar; MAX_DIM]; MAX_DIM], n: usize) -> Option<[[Scalar; MAX_DIM]; MAX_DIM]> {
    let mut out = [[0.0; MAX_DIM]; MAX_DIM];
    if n == 2 {
        let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
        if det.abs() < 1e-300 {
            return None;
        }
        out[0][0] = m[1][1] / det;
        out[0][1] = -m[0][1] / det;
        out[1][0] = -m[1][0] / det;
        out[1][1] = m[0][0] / det;
    } else {
        let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
        if det.abs() < 1e-300 {
            return None;
        }
        let cof = |a: usize, b: usize, c: usize, d: usize| m[a][b] * m[c][d] - m[a][d] * m[c][b];
        out[0][0] = cof(1, 1, 2, 2) / det;
        out[0][1] = -cof(0, 1, 2, 2) / det;
        out[0][2] = cof(0, 1, 1, 2) / det;
        out[1][0] = -cof(1, 0, 2, 2) / det;
        out[1][1] = cof(0, 0, 2, 2) / det;
        out[1][2] = -cof(0, 0, 1, 2) / det;
        out[2][0] = cof(1, 0, 2, 1) / det;
        out[2][1] = -cof(0, 0, 2, 1) / det;
        out[2][2] = cof(0, 0, 1, 1) / det;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_functions_are_partitions_of_unity() {
        for vtk in [
            VtkKind::Line,
            VtkKind::Triangle,
            VtkKind::Quadrilateral,
            VtkKind::Tetrahedron,
            VtkKind::Hexahedron,
            VtkKind::Prism,
            VtkKind::Pyramid,
        ] {
            let std = StandardElement::build(vtk, 1);
            for q in 0..std.n_int() {
                let sum: Scalar = (0..vtk.n_corners()).map(|k| std.basis[q * vtk.n_corners() + k]).sum();
                assert!((sum - 1.0).abs() < 1e-12, "{vtk} q={q}: sum {sum}");
                // Gradients of a partition of unity sum to zero.
                for d in 0..vtk.dim() {
                    let gsum: Scalar = (0..vtk.n_corners())
                        .map(|k| std.d_basis[(q * vtk.n_corners() + k) * MAX_DIM + d])
                        .sum();
                    assert!(gsum.abs() < 1e-12, "{vtk} q={q} d={d}: grad sum {gsum}");
                }
            }
        }
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let elem_nodes = [10, 11, 12, 13]; // tetrahedron
        for corners in topo::elem_faces(VtkKind::Tetrahedron) {
            let rotated: Vec<usize> = {
                let c: Vec<usize> = corners.iter().map(|&k| elem_nodes[k]).collect();
                let mut r = c.clone();
                r.rotate_left(1);
                r
            };
            let (i1, conn1, swap1) =
                create_connectivities_face(VtkKind::Triangle, &rotated, VtkKind::Tetrahedron, &elem_nodes).unwrap();
            let (i2, conn2, swap2) =
                create_connectivities_face(VtkKind::Triangle, &conn1, VtkKind::Tetrahedron, &elem_nodes).unwrap();
            assert_eq!((i1, &conn1, swap1), (i2, &conn2, swap2));
            assert!(!swap1);
        }
    }

    #[test]
    fn pyramid_triangle_sets_swap_flag() {
        let elem_nodes = [0, 1, 2, 3, 4];
        // Face (0,1,4) listed with reversed winding.
        let (_, conn, swap) =
            create_connectivities_face(VtkKind::Triangle, &[4, 1, 0], VtkKind::Pyramid, &elem_nodes).unwrap();
        assert!(swap, "non-native pyramid face must set the swap flag");
        assert_eq!(conn, vec![4, 1, 0], "connectivity is preserved when swapped");
    }

    #[test]
    fn unmatched_face_is_fatal() {
        let err = create_connectivities_face(VtkKind::Triangle, &[7, 8, 9], VtkKind::Tetrahedron, &[0, 1, 2, 3]);
        assert!(err.is_err());
    }

    fn two_tet_mesh() -> (Vec<FemElementSpec>, Vec<Scalar>) {
        let coords = vec![
            0.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, //
            0.0, 0.0, 1.0, //
            1.0, 1.0, 1.0, //
        ];
        let specs = vec![
            FemElementSpec {
                vtk: VtkKind::Tetrahedron,
                nodes: vec![0, 1, 2, 3],
                n_poly_sol: 2,
                time_level: 0,
                owned: true,
                orig_rank: 0,
                global_id: 0,
            },
            FemElementSpec {
                vtk: VtkKind::Tetrahedron,
                nodes: vec![1, 2, 3, 4],
                n_poly_sol: 2,
                time_level: 1,
                owned: true,
                orig_rank: 0,
                global_id: 1,
            },
        ];
        (specs, coords)
    }

    #[test]
    fn internal_face_normal_points_side0_to_side1() {
        let (specs, coords) = two_tet_mesh();
        let mesh = FemMesh::build(3, 2, &specs, &coords).unwrap();
        let internal: Vec<&FemFace> = mesh.faces.iter().filter(|f| !f.is_boundary()).collect();
        assert_eq!(internal.len(), 1);
        let f = internal[0];
        assert!(f.elems[0] < f.elems[1]);
        let c0 = centroid_of(&mesh.elements[f.elems[0]].nodes, &coords, 3);
        let c1 = centroid_of(&mesh.elements[f.elems[1]].nodes, &coords, 3);
        let mut along = 0.0;
        for q in 0..f.normals.len() / MAX_DIM {
            for d in 0..3 {
                along += f.normals[q * MAX_DIM + d] * (c1[d] - c0[d]);
            }
        }
        assert!(along > 0.0);
    }

    #[test]
    fn faces_sorted_by_level_then_owner() {
        let (specs, coords) = two_tet_mesh();
        let mesh = FemMesh::build(3, 2, &specs, &coords).unwrap();
        let keys: Vec<(u8, usize)> = mesh.faces.iter().map(|f| (f.time_level, f.elems[0])).collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
        assert_eq!(mesh.owned_bound(0).unwrap(), 1);
        assert_eq!(mesh.owned_bound(1).unwrap(), 2);
        assert!(mesh.owned_bound(2).is_err(), "out-of-range time level is fatal");
    }

    #[test]
    fn out_of_range_time_level_rejected_at_build() {
        let (mut specs, coords) = two_tet_mesh();
        specs[1].time_level = 5;
        assert!(FemMesh::build(3, 2, &specs, &coords).is_err());
    }
}
