// crates/karman-smooth/src/hessian.rs

//! Reduced-Hessian construction: `H = P K P^T` with `P` the parameterization
//! Jacobian (design variable -> mesh node), assembled column by column
//! through matrix-vector products, written to CSV, and inverted against the
//! raw gradient projection by Householder QR.

use anyhow::{Context, Result};
use karman_core::Scalar;
use karman_linsys::BlockMatrix;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// `H = P K P^T`, dense `n_dv x n_dv`, column by column.
///
/// `param_jac` holds one row per design variable with `K.n_scalar()`
/// entries (the sensitivity of every mesh DOF to that variable).
#[must_use]
pub fn reduced_hessian(k_mat: &BlockMatrix, param_jac: &[Vec<Scalar>]) -> Vec<Vec<Scalar>> {
    let n_dv = param_jac.len();
    let n = k_mat.n_scalar();
    let mut h = vec![vec![0.0; n_dv]; n_dv];
    let mut kp = vec![0.0; n];
    for col in 0..n_dv {
        debug_assert_eq!(param_jac[col].len(), n);
        k_mat.matvec(&param_jac[col], &mut kp);
        for (row, h_row) in h.iter_mut().enumerate() {
            h_row[col] = param_jac[row].iter().zip(&kp).map(|(p, k)| p * k).sum();
        }
    }
    h
}

/// Write the Hessian in CSV form, one row per line.
pub fn write_hessian_csv<P: AsRef<Path>>(path: P, h: &[Vec<Scalar>]) -> Result<()> {
    let f = File::create(path.as_ref()).with_context(|| format!("create {}", path.as_ref().display()))?;
    let mut w = BufWriter::new(f);
    for row in h {
        let line = row.iter().map(|v| format!("{v:.16e}")).collect::<Vec<_>>().join(", ");
        writeln!(w, "{line}")?;
    }
    w.flush()?;
    Ok(())
}

/// Solve `H dp = g` by Householder QR (the Hessian is small and dense).
#[must_use]
pub fn recover_dp(h: &[Vec<Scalar>], g: &[Scalar]) -> Vec<Scalar> {
    let n = h.len();
    // Column-major working copy.
    let mut a = vec![0.0; n * n];
    for (r, row) in h.iter().enumerate() {
        for c in 0..n {
            a[c * n + r] = row[c];
        }
    }
    let mut b = g.to_vec();

    for k in 0..n {
        // Householder vector for column k.
        let mut norm = 0.0;
        for r in k..n {
            norm += a[k * n + r] * a[k * n + r];
        }
        let norm = norm.sqrt();
        if norm < 1.0e-300 {
            continue;
        }
        let alpha = -norm * a[k * n + k].signum();
        let mut v = vec![0.0; n];
        v[k] = a[k * n + k] - alpha;
        for r in k + 1..n {
            v[r] = a[k * n + r];
        }
        let vtv: Scalar = v[k..].iter().map(|x| x * x).sum();
        if vtv < 1.0e-300 {
            continue;
        }
        // Apply to remaining columns and the right-hand side.
        for c in k..n {
            let mut dot = 0.0;
            for r in k..n {
                dot += v[r] * a[c * n + r];
            }
            let f = 2.0 * dot / vtv;
            for r in k..n {
                a[c * n + r] -= f * v[r];
            }
        }
        let mut dot = 0.0;
        for r in k..n {
            dot += v[r] * b[r];
        }
        let f = 2.0 * dot / vtv;
        for r in k..n {
            b[r] -= f * v[r];
        }
    }

    // Back substitution on the R factor.
    let mut dp = vec![0.0; n];
    for r in (0..n).rev() {
        let mut acc = b[r];
        for c in r + 1..n {
            acc -= a[c * n + r] * dp[c];
        }
        let diag = a[r * n + r];
        dp[r] = if diag.abs() > 1.0e-300 { acc / diag } else { 0.0 };
    }
    dp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_solves_small_system() {
        // H = [[4,1],[1,3]], g = [1, 2] -> dp = [1/11, 7/11].
        let h = vec![vec![4.0, 1.0], vec![1.0, 3.0]];
        let dp = recover_dp(&h, &[1.0, 2.0]);
        assert!((dp[0] - 1.0 / 11.0).abs() < 1e-12);
        assert!((dp[1] - 7.0 / 11.0).abs() < 1e-12);
    }

    #[test]
    fn hessian_of_identity_parameterization_is_k() {
        // K = 2x2 scalar blocks on a single edge; P = identity.
        let mut k = BlockMatrix::from_edges(2, 2, 1, &[[0, 1]]);
        k.add_val_to_diag(0, 2.0);
        k.add_val_to_diag(1, 3.0);
        k.add_block(0, 1, &[-1.0]);
        k.add_block(1, 0, &[-1.0]);
        let p = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let h = reduced_hessian(&k, &p);
        assert_eq!(h[0], vec![2.0, -1.0]);
        assert_eq!(h[1], vec![-1.0, 3.0]);
    }

    #[test]
    fn csv_roundtrip_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hessian.csv");
        let h = vec![vec![1.0, 2.5], vec![-3.0, 4.0]];
        write_hessian_csv(&path, &h).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("2.5"));
    }
}
