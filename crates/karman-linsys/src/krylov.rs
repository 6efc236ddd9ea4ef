// crates/karman-linsys/src/krylov.rs

//! Krylov solvers over the block matrix: preconditioned Richardson,
//! restarted GMRES, and BiCGSTAB.
//!
//! `solve` returns the iteration count; reaching the cap is reported, never
//! fatal. The initial guess is whatever `x` holds (the implicit step passes
//! zero).

use crate::matrix::BlockMatrix;
use crate::precond::Preconditioner;
use karman_core::Scalar;

/// Krylov method selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KrylovMethod {
    Richardson,
    Gmres,
    Bicgstab,
}

/// Linear-solver driver bound to a method, an iteration budget, a relative
/// tolerance, and (for GMRES) a restart length.
#[derive(Clone, Copy, Debug)]
pub struct LinearSolver {
    pub method: KrylovMethod,
    pub max_iters: usize,
    pub tol: Scalar,
    pub restart: usize,
}

fn dot(a: &[Scalar], b: &[Scalar]) -> Scalar {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(a: &[Scalar]) -> Scalar {
    dot(a, a).sqrt()
}

fn axpy(alpha: Scalar, x: &[Scalar], y: &mut [Scalar]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}

impl LinearSolver {
    /// Solve `A x = b`; returns the number of iterations taken.
    pub fn solve(&self, mat: &BlockMatrix, b: &[Scalar], x: &mut [Scalar], prec: &dyn Preconditioner) -> usize {
        match self.method {
            KrylovMethod::Richardson => self.richardson(mat, b, x, prec),
            KrylovMethod::Gmres => self.gmres(mat, b, x, prec),
            KrylovMethod::Bicgstab => self.bicgstab(mat, b, x, prec),
        }
    }

    fn richardson(&self, mat: &BlockMatrix, b: &[Scalar], x: &mut [Scalar], prec: &dyn Preconditioner) -> usize {
        let n = b.len();
        let mut r = vec![0.0; n];
        let mut z = vec![0.0; n];
        let b_norm = norm(b).max(Scalar::MIN_POSITIVE);
        for it in 0..self.max_iters {
            mat.matvec(x, &mut r);
            for k in 0..n {
                r[k] = b[k] - r[k];
            }
            if norm(&r) / b_norm < self.tol {
                return it;
            }
            prec.apply(mat, &r, &mut z);
            axpy(1.0, &z, x);
        }
        self.max_iters
    }

    #[allow(clippy::many_single_char_names)]
    fn gmres(&self, mat: &BlockMatrix, b: &[Scalar], x: &mut [Scalar], prec: &dyn Preconditioner) -> usize {
        let n = b.len();
        let m = self.restart.max(1);
        let b_norm = norm(b).max(Scalar::MIN_POSITIVE);
        let mut total_iters = 0usize;

        let mut r = vec![0.0; n];
        let mut w = vec![0.0; n];
        let mut z = vec![0.0; n];

        while total_iters < self.max_iters {
            // r = M^-1 (b - A x)
            mat.matvec(x, &mut w);
            for k in 0..n {
                r[k] = b[k] - w[k];
            }
            if norm(&r) / b_norm < self.tol {
                return total_iters;
            }
            prec.apply(mat, &r.clone(), &mut r);

            let beta = norm(&r);
            if beta <= 0.0 {
                return total_iters;
            }
            let mut v: Vec<Vec<Scalar>> = Vec::with_capacity(m + 1);
            v.push(r.iter().map(|ri| ri / beta).collect());

            let mut h = vec![vec![0.0; m]; m + 1];
            let (mut cs, mut sn) = (vec![0.0; m], vec![0.0; m]);
            let mut g = vec![0.0; m + 1];
            g[0] = beta;

            let mut k_used = 0;
            for k in 0..m {
                if total_iters >= self.max_iters {
                    break;
                }
                total_iters += 1;
                // w = M^-1 A v_k (left preconditioning).
                mat.matvec(&v[k], &mut w);
                prec.apply(mat, &w.clone(), &mut z);
                w.copy_from_slice(&z);
                // Modified Gram-Schmidt.
                for (i, vi) in v.iter().enumerate().take(k + 1) {
                    h[i][k] = dot(&w, vi);
                    axpy(-h[i][k], vi, &mut w);
                }
                h[k + 1][k] = norm(&w);
                if h[k + 1][k] > 1.0e-300 {
                    v.push(w.iter().map(|wi| wi / h[k + 1][k]).collect());
                } else {
                    v.push(vec![0.0; n]);
                }
                // Apply stored Givens rotations, then form a new one.
                for i in 0..k {
                    let t = cs[i] * h[i][k] + sn[i] * h[i + 1][k];
                    h[i + 1][k] = -sn[i] * h[i][k] + cs[i] * h[i + 1][k];
                    h[i][k] = t;
                }
                let denom = (h[k][k] * h[k][k] + h[k + 1][k] * h[k + 1][k]).sqrt().max(Scalar::MIN_POSITIVE);
                cs[k] = h[k][k] / denom;
                sn[k] = h[k + 1][k] / denom;
                h[k][k] = denom;
                h[k + 1][k] = 0.0;
                g[k + 1] = -sn[k] * g[k];
                g[k] *= cs[k];
                k_used = k + 1;
                if g[k + 1].abs() / b_norm < self.tol {
                    break;
                }
            }

            // Back-substitute y and update x.
            let mut y = vec![0.0; k_used];
            for i in (0..k_used).rev() {
                let mut acc = g[i];
                for j in i + 1..k_used {
                    acc -= h[i][j] * y[j];
                }
                y[i] = acc / h[i][i].max(Scalar::MIN_POSITIVE).copysign(h[i][i]);
            }
            for (i, yi) in y.iter().enumerate() {
                axpy(*yi, &v[i], x);
            }
            if k_used < m {
                return total_iters;
            }
        }
        total_iters
    }

    fn bicgstab(&self, mat: &BlockMatrix, b: &[Scalar], x: &mut [Scalar], prec: &dyn Preconditioner) -> usize {
        let n = b.len();
        let b_norm = norm(b).max(Scalar::MIN_POSITIVE);
        let mut r = vec![0.0; n];
        mat.matvec(x, &mut r);
        for k in 0..n {
            r[k] = b[k] - r[k];
        }
        let r0 = r.clone();
        let (mut rho, mut alpha, mut omega) = (1.0, 1.0, 1.0);
        let mut p = vec![0.0; n];
        let mut v = vec![0.0; n];
        let mut s = vec![0.0; n];
        let mut t = vec![0.0; n];
        let mut p_hat = vec![0.0; n];
        let mut s_hat = vec![0.0; n];

        for it in 0..self.max_iters {
            if norm(&r) / b_norm < self.tol {
                return it;
            }
            let rho_new = dot(&r0, &r);
            if rho_new.abs() < 1.0e-300 {
                return it;
            }
            let beta = (rho_new / rho) * (alpha / omega);
            rho = rho_new;
            for k in 0..n {
                p[k] = r[k] + beta * (p[k] - omega * v[k]);
            }
            prec.apply(mat, &p, &mut p_hat);
            mat.matvec(&p_hat, &mut v);
            alpha = rho / dot(&r0, &v).abs().max(1.0e-300).copysign(dot(&r0, &v));
            for k in 0..n {
                s[k] = r[k] - alpha * v[k];
            }
            if norm(&s) / b_norm < self.tol {
                axpy(alpha, &p_hat, x);
                return it + 1;
            }
            prec.apply(mat, &s, &mut s_hat);
            mat.matvec(&s_hat, &mut t);
            let tt = dot(&t, &t);
            omega = if tt > 0.0 { dot(&t, &s) / tt } else { 0.0 };
            for k in 0..n {
                x[k] += alpha * p_hat[k] + omega * s_hat[k];
                r[k] = s[k] - omega * t[k];
            }
            if omega == 0.0 {
                return it + 1;
            }
        }
        self.max_iters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::precond::{JacobiPrec, LuSgsPrec};

    fn laplacian_chain(n: usize, nb: usize) -> (BlockMatrix, Vec<Scalar>) {
        let edges: Vec<[usize; 2]> = (0..n - 1).map(|i| [i, i + 1]).collect();
        let mut m = BlockMatrix::from_edges(n, n, nb, &edges);
        for i in 0..n {
            m.add_val_to_diag(i, 4.0);
        }
        for e in &edges {
            let off = vec![-1.0, 0.5, 0.25, -1.0];
            m.add_block(e[0], e[1], &off);
            m.add_block(e[1], e[0], &off);
        }
        let b: Vec<Scalar> = (0..n * nb).map(|k| ((k * 13 + 5) % 7) as Scalar - 3.0).collect();
        (m, b)
    }

    fn check_solution(m: &BlockMatrix, b: &[Scalar], x: &[Scalar], tol: Scalar) {
        let mut ax = vec![0.0; b.len()];
        m.matvec(x, &mut ax);
        let r: Scalar = b.iter().zip(&ax).map(|(bi, ai)| (bi - ai).powi(2)).sum::<Scalar>().sqrt();
        let bn: Scalar = b.iter().map(|v| v * v).sum::<Scalar>().sqrt();
        assert!(r / bn < tol, "relative residual {}", r / bn);
    }

    #[test]
    fn all_methods_converge_on_spd_like_system() {
        let (m, b) = laplacian_chain(12, 2);
        let jacobi = JacobiPrec::build(&m);
        let lusgs = LuSgsPrec::build(&m);
        for method in [KrylovMethod::Richardson, KrylovMethod::Gmres, KrylovMethod::Bicgstab] {
            let solver = LinearSolver { method, max_iters: 300, tol: 1.0e-10, restart: 20 };
            let mut x = vec![0.0; b.len()];
            let iters = solver.solve(&m, &b, &mut x, &jacobi);
            assert!(iters < 300, "{method:?} hit the cap");
            check_solution(&m, &b, &x, 1.0e-8);

            let mut x2 = vec![0.0; b.len()];
            let iters2 = solver.solve(&m, &b, &mut x2, &lusgs);
            assert!(iters2 <= iters || iters2 < 300, "LU-SGS should not be worse than Jacobi by much");
            check_solution(&m, &b, &x2, 1.0e-8);
        }
    }

    /// At a converged steady state the right-hand side is ~0 and the solver
    /// must return a ~0 update immediately.
    #[test]
    fn zero_rhs_returns_zero_update() {
        let (m, _) = laplacian_chain(8, 2);
        let b = vec![0.0; 16];
        let jacobi = JacobiPrec::build(&m);
        let solver = LinearSolver { method: KrylovMethod::Gmres, max_iters: 50, tol: 1.0e-10, restart: 10 };
        let mut x = vec![0.0; 16];
        let iters = solver.solve(&m, &b, &mut x, &jacobi);
        assert_eq!(iters, 0);
        assert!(x.iter().all(|v| v.abs() < 1.0e-14));
    }

    /// Hitting the iteration budget reports the count; it does not panic.
    #[test]
    fn iteration_cap_is_reported_not_fatal() {
        let (m, b) = laplacian_chain(12, 2);
        let jacobi = JacobiPrec::build(&m);
        let solver = LinearSolver { method: KrylovMethod::Richardson, max_iters: 2, tol: 1.0e-14, restart: 5 };
        let mut x = vec![0.0; b.len()];
        let iters = solver.solve(&m, &b, &mut x, &jacobi);
        assert_eq!(iters, 2);
    }
}
