// crates/karman-interp/src/lib.rs

//! Interpolation between two meshes on overlapping surfaces.
//!
//! Two flavors: nearest-neighbor over globally gathered candidate lists, and
//! isoparametric, which projects the target point onto the plane of the
//! nearest donor face and recovers barycentric-style coefficients from a
//! reduced QR of a Vandermonde-style system, reverting to nearest-neighbor
//! when the projection falls outside the face.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]

use karman_core::{CoreResult, KarmanError, PointId, Scalar, MAX_DIM};
use karman_mesh::DualMesh;

/// Coefficients snap to zero below this tolerance.
pub const COEFF_ZERO_TOL: Scalar = 1.0e-13;
/// Fallback window: a coefficient outside `[OUTSIDE_LO, OUTSIDE_HI]` means
/// the projected point lies outside the donor face and nearest-neighbor is
/// used instead. Tunable; the historical values are -0.1 and 1.1.
pub const OUTSIDE_LO: Scalar = -0.1;
pub const OUTSIDE_HI: Scalar = 1.1;

/// Interpolation stencil for one target vertex.
#[derive(Clone, Debug)]
pub struct Stencil {
    /// Donor point ids on the donor mesh.
    pub donors: Vec<PointId>,
    /// Matching coefficients; they sum to 1.
    pub coeffs: Vec<Scalar>,
}

/// Transfer operator: one stencil per vertex of the target marker.
#[derive(Clone, Debug)]
pub struct Interpolator {
    pub stencils: Vec<Stencil>,
}

fn dist2(a: &[Scalar], b: &[Scalar], nd: usize) -> Scalar {
    (0..nd).map(|d| (a[d] - b[d]).powi(2)).sum()
}

/// Nearest-neighbor transfer: each target vertex takes the closest donor
/// vertex with coefficient 1.
pub fn nearest_neighbor(
    donor: &DualMesh,
    donor_marker: usize,
    target: &DualMesh,
    target_marker: usize,
) -> CoreResult<Interpolator> {
    let nd = target.n_dim;
    let donors: Vec<PointId> = donor.markers[donor_marker].vertices.iter().map(|v| v.point).collect();
    if donors.is_empty() {
        return Err(KarmanError::Mesh("donor marker has no vertices".into()));
    }
    let mut stencils = Vec::new();
    for v in &target.markers[target_marker].vertices {
        let x = target.coord(v.point);
        let mut best = donors[0];
        let mut best_d = Scalar::MAX;
        for &dp in &donors {
            let d = dist2(donor.coord(dp), x, nd);
            if d < best_d {
                best_d = d;
                best = dp;
            }
        }
        stencils.push(Stencil { donors: vec![best], coeffs: vec![1.0] });
    }
    Ok(Interpolator { stencils })
}

/// Isoparametric transfer: project onto the nearest donor face and solve for
/// the face-node coefficients, with nearest-neighbor fallback.
pub fn isoparametric(
    donor: &DualMesh,
    donor_marker: usize,
    target: &DualMesh,
    target_marker: usize,
) -> CoreResult<Interpolator> {
    let nd = target.n_dim;
    let surfs = &donor.markers[donor_marker].surf_elems;
    if surfs.is_empty() {
        return Err(KarmanError::Mesh("donor marker has no surface elements".into()));
    }
    let mut stencils = Vec::new();
    for v in &target.markers[target_marker].vertices {
        let x = target.coord(v.point);

        // Nearest donor face by centroid distance.
        let mut best_face = 0;
        let mut best_d = Scalar::MAX;
        for (f, se) in surfs.iter().enumerate() {
            let mut c = [0.0; MAX_DIM];
            for &p in &se.nodes {
                for d in 0..nd {
                    c[d] += donor.coord(p)[d];
                }
            }
            #[allow(clippy::cast_precision_loss)]
            let inv = 1.0 / se.nodes.len() as Scalar;
            for cd in &mut c {
                *cd *= inv;
            }
            let d2 = dist2(&c, x, nd);
            if d2 < best_d {
                best_d = d2;
                best_face = f;
            }
        }
        let face = &surfs[best_face];
        let coords: Vec<Vec<Scalar>> = face.nodes.iter().map(|&p| donor.coord(p).to_vec()).collect();

        // Project the target onto the face plane (3-D only; 2-D faces are
        // lines and the ratio form below handles them directly).
        let mut xp = [0.0; MAX_DIM];
        xp[..nd].copy_from_slice(&x[..nd]);
        if nd == 3 {
            let e1: Vec<Scalar> = (0..3).map(|d| coords[1][d] - coords[0][d]).collect();
            let e2: Vec<Scalar> = (0..3).map(|d| coords[face.nodes.len() - 1][d] - coords[0][d]).collect();
            let n = [
                e1[1] * e2[2] - e1[2] * e2[1],
                e1[2] * e2[0] - e1[0] * e2[2],
                e1[0] * e2[1] - e1[1] * e2[0],
            ];
            let n2: Scalar = n.iter().map(|c| c * c).sum();
            if n2 > 0.0 {
                let mut along = 0.0;
                for d in 0..3 {
                    along += (xp[d] - coords[0][d]) * n[d];
                }
                for d in 0..3 {
                    xp[d] -= along * n[d] / n2;
                }
            }
        }

        let mut coeffs = isoparameters(nd, &coords, &xp[..nd]);

        // Zero-snap, then the outside-face check and fallback.
        for c in &mut coeffs {
            if c.abs() < COEFF_ZERO_TOL {
                *c = 0.0;
            }
        }
        let inside = coeffs.iter().all(|&c| (OUTSIDE_LO..=OUTSIDE_HI).contains(&c));
        if inside {
            // Rescale the surviving coefficients to unit sum.
            let sum: Scalar = coeffs.iter().sum();
            if sum.abs() > COEFF_ZERO_TOL {
                for c in &mut coeffs {
                    *c /= sum;
                }
            }
        } else {
            let mut best_k = 0;
            let mut best_d = Scalar::MAX;
            for (k, c) in coords.iter().enumerate() {
                let d2 = dist2(c, x, nd);
                if d2 < best_d {
                    best_d = d2;
                    best_k = k;
                }
            }
            for (k, c) in coeffs.iter_mut().enumerate() {
                *c = Scalar::from(u8::from(k == best_k));
            }
        }
        stencils.push(Stencil { donors: face.nodes.clone(), coeffs });
    }
    Ok(Interpolator { stencils })
}

/// Solve for the isoparametric coefficients of `xj` within the face whose
/// node coordinates are `coords`.
///
/// 2-D faces (lines) use the direct length-ratio form. 3-D faces build the
/// Vandermonde-style system `A c = [1, xj]`, drop degenerate rows, and solve
/// through a reduced QR (modified Gram-Schmidt), back-substituting the upper
/// triangular factor.
#[must_use]
pub fn isoparameters(nd: usize, coords: &[Vec<Scalar>], xj: &[Scalar]) -> Vec<Scalar> {
    let m = coords.len();
    if nd == 2 {
        let len = dist2(&coords[0], &coords[1], 2).sqrt().max(Scalar::MIN_POSITIVE);
        let d0 = dist2(&coords[0], xj, 2).sqrt();
        let d1 = dist2(&coords[1], xj, 2).sqrt();
        return vec![d1 / len, d0 / len];
    }

    let n0 = nd + 1;
    // A: n0 x m, row 0 all ones, rows 1.. the donor coordinates.
    let mut a = vec![0.0; n0 * m];
    for k in 0..m {
        a[k] = 1.0;
        for d in 0..nd {
            a[(d + 1) * m + k] = coords[k][d];
        }
    }
    let mut rhs = vec![0.0; n0];
    rhs[0] = 1.0;
    rhs[1..=nd].copy_from_slice(&xj[..nd]);

    // Drop rows that are scalar multiples of an earlier row (a constant
    // coordinate makes the system degenerate).
    let mut keep = vec![true; n0];
    for i in 1..n0 {
        for k in 0..i {
            if !keep[k] {
                continue;
            }
            let ni: Scalar = (0..m).map(|c| a[i * m + c] * a[i * m + c]).sum::<Scalar>().sqrt();
            let nk: Scalar = (0..m).map(|c| a[k * m + c] * a[k * m + c]).sum::<Scalar>().sqrt();
            if ni <= 0.0 || nk <= 0.0 {
                continue;
            }
            let mut same = true;
            for c in 0..m {
                if (a[i * m + c] / ni - a[k * m + c] / nk).abs() > 1.0e-12 {
                    same = false;
                    break;
                }
            }
            if same {
                keep[i] = false;
                break;
            }
        }
    }
    let rows: Vec<usize> = (0..n0).filter(|&i| keep[i]).collect();
    let n = rows.len();
    let mut a2 = vec![0.0; n * m];
    let mut x2 = vec![0.0; n];
    for (r, &i) in rows.iter().enumerate() {
        for c in 0..m {
            a2[r * m + c] = a[i * m + c];
        }
        x2[r] = rhs[i];
    }

    // Reduced QR by modified Gram-Schmidt over the columns of A2.
    let mut q = vec![0.0; n * m];
    let mut r_mat = vec![0.0; m * m];
    for i in 0..m {
        let mut nrm = 0.0;
        for j in 0..n {
            nrm += a2[j * m + i] * a2[j * m + i];
        }
        r_mat[i * m + i] = nrm.sqrt();
        if nrm.sqrt() > 1.0e-12 && i < n {
            for j in 0..n {
                q[j * m + i] = a2[j * m + i] / r_mat[i * m + i];
            }
        }
        for jcol in i + 1..m {
            let mut proj = 0.0;
            for j in 0..n {
                proj += a2[j * m + jcol] * q[j * m + i];
            }
            r_mat[i * m + jcol] = proj;
            for j in 0..n {
                a2[j * m + jcol] -= q[j * m + i] * proj;
            }
        }
    }
    // x_tmp = Q^T x2.
    let mut x_tmp = vec![0.0; m];
    for i in 0..m {
        for j in 0..n {
            x_tmp[i] += q[j * m + i] * x2[j];
        }
    }
    // Back-substitute R c = x_tmp.
    let mut coeffs = vec![0.0; m];
    for i in (0..m).rev() {
        if r_mat[i * m + i] > 1.0e-12 {
            coeffs[i] = x_tmp[i] / r_mat[i * m + i];
        } else {
            coeffs[i] = 0.0;
        }
        for j in 0..i {
            x_tmp[j] -= r_mat[j * m + i] * coeffs[i];
        }
    }
    coeffs
}

impl Interpolator {
    /// Apply the transfer to a scalar donor field.
    #[must_use]
    pub fn apply(&self, donor_field: &[Scalar]) -> Vec<Scalar> {
        self.stencils
            .iter()
            .map(|s| s.donors.iter().zip(&s.coeffs).map(|(&p, &c)| c * donor_field[p]).sum())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Unit triangle with vertices (0,0,0), (1,0,0), (0,1,0); target
    /// (0.25, 0.25, 0) must yield coefficients (0.5, 0.25, 0.25).
    #[test]
    fn unit_triangle_barycentric_coefficients() {
        let coords = vec![vec![0.0, 0.0, 0.0], vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]];
        let c = isoparameters(3, &coords, &[0.25, 0.25, 0.0]);
        assert!((c[0] - 0.5).abs() < 1e-12, "c0 = {}", c[0]);
        assert!((c[1] - 0.25).abs() < 1e-12, "c1 = {}", c[1]);
        assert!((c[2] - 0.25).abs() < 1e-12, "c2 = {}", c[2]);
        let sum: Scalar = c.iter().sum();
        assert!((sum - 1.0).abs() < 1e-13);
    }

    #[test]
    fn line_face_partition_of_unity() {
        let coords = vec![vec![0.0, 0.0], vec![2.0, 0.0]];
        let c = isoparameters(2, &coords, &[0.5, 0.0]);
        assert!((c[0] - 0.75).abs() < 1e-12);
        assert!((c[1] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn quad_face_center() {
        let coords = vec![
            vec![0.0, 0.0, 0.0],
            vec![1.0, 0.0, 0.0],
            vec![1.0, 1.0, 0.0],
            vec![0.0, 1.0, 0.0],
        ];
        let target = [0.5, 0.5, 0.0];
        let c = isoparameters(3, &coords, &target);
        let sum: Scalar = c.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12, "sum = {sum}");
        // The stencil must reproduce the projected point.
        for d in 0..2 {
            let rec: Scalar = c.iter().enumerate().map(|(k, ck)| ck * coords[k][d]).sum();
            assert!((rec - target[d]).abs() < 1e-10, "axis {d}: {rec}");
        }
    }

    #[test]
    fn marker_transfer_with_fallback() {
        use karman_mesh::MeshBuilder;
        let donor = MeshBuilder::rect_2d(2, 2, 1.0, 1.0).build().unwrap();
        let target = MeshBuilder::rect_2d(4, 1, 1.0, 0.2).build().unwrap();
        let bottom_donor = donor.markers.iter().position(|m| m.tag == "bottom").unwrap();
        let bottom_target = target.markers.iter().position(|m| m.tag == "bottom").unwrap();

        let interp = isoparametric(&donor, bottom_donor, &target, bottom_target).unwrap();
        for s in &interp.stencils {
            let sum: Scalar = s.coeffs.iter().sum();
            assert!((sum - 1.0).abs() < 1e-12, "stencil sums to {sum}");
            // Either an interior stencil or an exact nearest-neighbor one.
            let n_one = s.coeffs.iter().filter(|&&c| (c - 1.0).abs() < 1e-13).count();
            let n_zero = s.coeffs.iter().filter(|&&c| c == 0.0).count();
            assert!(n_one != 1 || n_zero == s.coeffs.len() - 1);
        }

        let nn = nearest_neighbor(&donor, bottom_donor, &target, bottom_target).unwrap();
        for s in &nn.stencils {
            assert_eq!(s.coeffs, vec![1.0]);
        }
    }
}
