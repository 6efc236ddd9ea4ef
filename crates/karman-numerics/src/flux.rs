// crates/karman-numerics/src/flux.rs

//! Projected inviscid flux, its Jacobian, spectral radii, and the kernel
//! input/output containers shared by every edge kernel.

use karman_core::{any_nan, dot, norm2, KernelStatus, Scalar};
use karman_state::VarIndices;

/// Borrowed per-edge kernel inputs. The solver fills one of these per edge
/// (possibly from reconstructed states) and hands it to the active kernel.
#[derive(Clone, Copy, Debug)]
pub struct EdgeState<'a> {
    pub ix: VarIndices,
    /// Dual-face area vector, side i -> side j.
    pub normal: &'a [Scalar],
    pub u_i: &'a [Scalar],
    pub u_j: &'a [Scalar],
    pub v_i: &'a [Scalar],
    pub v_j: &'a [Scalar],
    pub dpdu_i: &'a [Scalar],
    pub dpdu_j: &'a [Scalar],
    pub dtdu_i: &'a [Scalar],
    pub dtdu_j: &'a [Scalar],
    pub dtvedu_i: &'a [Scalar],
    pub dtvedu_j: &'a [Scalar],
    pub eve_i: &'a [Scalar],
    pub eve_j: &'a [Scalar],
    pub cvve_i: &'a [Scalar],
    pub cvve_j: &'a [Scalar],

    /// Primitive gradients (`n_prim_grad * n_dim`), required by the viscous
    /// kernel and the JST sensor path.
    pub grad_i: Option<&'a [Scalar]>,
    pub grad_j: Option<&'a [Scalar]>,
    /// Undivided Laplacians and sensors for the JST kernel.
    pub und_lapl_i: Option<&'a [Scalar]>,
    pub und_lapl_j: Option<&'a [Scalar]>,
    pub sensor_i: Scalar,
    pub sensor_j: Scalar,
    /// Point spectral radii for the centered dissipation scaling.
    pub lambda_i: Scalar,
    pub lambda_j: Scalar,

    /// Transport properties for the viscous kernel.
    pub mu_i: Scalar,
    pub mu_j: Scalar,
    pub ktr_i: Scalar,
    pub ktr_j: Scalar,
    pub kve_i: Scalar,
    pub kve_j: Scalar,
    pub diff_i: Option<&'a [Scalar]>,
    pub diff_j: Option<&'a [Scalar]>,

    pub coord_i: &'a [Scalar],
    pub coord_j: &'a [Scalar],
}

impl<'a> EdgeState<'a> {
    /// Distance between the two edge endpoints.
    #[must_use]
    pub fn dist(&self) -> Scalar {
        let nd = self.ix.n_dim;
        (0..nd).map(|d| (self.coord_j[d] - self.coord_i[d]).powi(2)).sum::<Scalar>().sqrt()
    }
}

/// Kernel result: residual plus the two block Jacobians.
#[derive(Clone, Debug)]
pub struct KernelOutput {
    pub res: Vec<Scalar>,
    pub jac_i: Vec<Scalar>,
    pub jac_j: Vec<Scalar>,
    pub status: KernelStatus,
}

impl KernelOutput {
    #[must_use]
    pub fn new(n_var: usize) -> Self {
        Self {
            res: vec![0.0; n_var],
            jac_i: vec![0.0; n_var * n_var],
            jac_j: vec![0.0; n_var * n_var],
            status: KernelStatus::Ok,
        }
    }

    pub fn reset(&mut self) {
        self.res.fill(0.0);
        self.jac_i.fill(0.0);
        self.jac_j.fill(0.0);
        self.status = KernelStatus::Ok;
    }

    /// Scan residual (and Jacobians when `implicit`) for NaN; downgrades the
    /// status so the solver skips this contribution.
    pub fn guard_nan(&mut self, implicit: bool) {
        if any_nan(&self.res) || (implicit && (any_nan(&self.jac_i) || any_nan(&self.jac_j))) {
            self.status = KernelStatus::NanDetected;
        }
    }
}

/// Projected inviscid flux `F(U, V) · n` for an area vector `n`.
pub fn inviscid_flux(ix: VarIndices, u: &[Scalar], v: &[Scalar], normal: &[Scalar], out: &mut [Scalar]) {
    let ns = ix.n_species;
    let nd = ix.n_dim;
    let vn = dot(&v[ix.vel()], normal, nd);
    let p = v[ix.p()];
    for s in 0..ns {
        out[s] = u[s] * vn;
    }
    for d in 0..nd {
        out[ix.u_mom().start + d] = u[ix.u_mom().start + d] * vn + p * normal[d];
    }
    out[ix.u_rho_e()] = (u[ix.u_rho_e()] + p) * vn;
    out[ix.u_rho_eve()] = u[ix.u_rho_eve()] * vn;
}

/// Jacobian of the projected inviscid flux, using the pressure derivative
/// vector `dP/dU`. Row-major `n_var x n_var` into `jac`.
pub fn inviscid_jacobian(
    ix: VarIndices,
    u: &[Scalar],
    v: &[Scalar],
    dpdu: &[Scalar],
    normal: &[Scalar],
    scale: Scalar,
    jac: &mut [Scalar],
) {
    let ns = ix.n_species;
    let nd = ix.n_dim;
    let nv = ix.n_var();
    let rho = v[ix.rho()].max(Scalar::MIN_POSITIVE);
    let vn = dot(&v[ix.vel()], normal, nd);
    let h = v[ix.h()];
    let eve_mix = u[ix.u_rho_eve()] / rho;

    // Species rows.
    for s in 0..ns {
        let y_s = u[s] / rho;
        for r in 0..ns {
            jac[s * nv + r] = scale * vn * (Scalar::from(u8::from(s == r)) - y_s);
        }
        for d in 0..nd {
            jac[s * nv + ix.u_mom().start + d] = scale * y_s * normal[d];
        }
        jac[s * nv + ix.u_rho_e()] = 0.0;
        jac[s * nv + ix.u_rho_eve()] = 0.0;
    }
    // Momentum rows.
    for d in 0..nd {
        let row = ix.u_mom().start + d;
        let u_d = v[ix.vel().start + d];
        for r in 0..ns {
            jac[row * nv + r] = scale * (dpdu[r] * normal[d] - u_d * vn);
        }
        for e in 0..nd {
            let col = ix.u_mom().start + e;
            let mut val = u_d * normal[e] + dpdu[col] * normal[d];
            if d == e {
                val += vn;
            }
            jac[row * nv + col] = scale * val;
        }
        jac[row * nv + ix.u_rho_e()] = scale * dpdu[ix.u_rho_e()] * normal[d];
        jac[row * nv + ix.u_rho_eve()] = scale * dpdu[ix.u_rho_eve()] * normal[d];
    }
    // Total-energy row.
    {
        let row = ix.u_rho_e();
        for r in 0..ns {
            jac[row * nv + r] = scale * vn * (dpdu[r] - h);
        }
        for d in 0..nd {
            let col = ix.u_mom().start + d;
            jac[row * nv + col] = scale * (vn * dpdu[col] + h * normal[d]);
        }
        jac[row * nv + ix.u_rho_e()] = scale * vn * (1.0 + dpdu[ix.u_rho_e()]);
        jac[row * nv + ix.u_rho_eve()] = scale * vn * dpdu[ix.u_rho_eve()];
    }
    // Vibrational-electronic energy row.
    {
        let row = ix.u_rho_eve();
        for r in 0..ns {
            jac[row * nv + r] = scale * (-eve_mix * vn);
        }
        for d in 0..nd {
            jac[row * nv + ix.u_mom().start + d] = scale * eve_mix * normal[d];
        }
        jac[row * nv + ix.u_rho_e()] = 0.0;
        jac[row * nv + ix.u_rho_eve()] = scale * vn;
    }
}

/// Inviscid spectral radius of an edge: `|v_bar . n| + a_bar |n|`.
#[must_use]
pub fn spectral_radius_inv(ix: VarIndices, v_i: &[Scalar], v_j: &[Scalar], normal: &[Scalar]) -> Scalar {
    let nd = ix.n_dim;
    let vn_i = dot(&v_i[ix.vel()], normal, nd);
    let vn_j = dot(&v_j[ix.vel()], normal, nd);
    let area = norm2(normal, nd);
    let a_bar = 0.5 * (v_i[ix.a()] + v_j[ix.a()]);
    (0.5 * (vn_i + vn_j)).abs() + a_bar * area
}

/// Viscous spectral radius of an edge:
/// `((4/3) mu_bar + (k_tr + k_ve)/cv_bar) |n|^2 / rho_bar`.
#[must_use]
pub fn spectral_radius_visc(
    ix: VarIndices,
    v_i: &[Scalar],
    v_j: &[Scalar],
    mu_bar: Scalar,
    ktr_bar: Scalar,
    kve_bar: Scalar,
    normal: &[Scalar],
) -> Scalar {
    let nd = ix.n_dim;
    let area2 = norm2(normal, nd).powi(2);
    let rho_bar = 0.5 * (v_i[ix.rho()] + v_j[ix.rho()]);
    let cv_bar = 0.5 * (v_i[ix.rho_cv_tr()] + v_j[ix.rho_cv_tr()]) / rho_bar.max(Scalar::MIN_POSITIVE);
    let lam_1 = 4.0 / 3.0 * mu_bar;
    let lam_2 = (ktr_bar + kve_bar) / cv_bar.max(Scalar::MIN_POSITIVE);
    (lam_1 + lam_2) * area2 / rho_bar.max(Scalar::MIN_POSITIVE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use karman_state::{cons2prim, prim2cons, GasModel, PrimDerived};

    fn state(vel: [Scalar; 2]) -> (GasModel, VarIndices, Vec<Scalar>, Vec<Scalar>, PrimDerived) {
        let gas = GasModel::from_names(&["N2", "O2"]).unwrap();
        let ix = VarIndices::new(2, 2);
        let mut u = vec![0.0; ix.n_var()];
        prim2cons(&gas, ix, &[0.9, 0.3], 500.0, 600.0, &vel, &mut u);
        let mut v = vec![0.0; ix.n_prim()];
        let mut der = PrimDerived::new(ix);
        assert!(!cons2prim(&gas, ix, &u, &mut v, &mut der));
        (gas, ix, u, v, der)
    }

    #[test]
    fn flux_jacobian_matches_finite_difference() {
        let (gas, ix, u, v, der) = state([220.0, -35.0]);
        let normal = [0.7, 0.3];
        let nv = ix.n_var();

        let mut f0 = vec![0.0; nv];
        inviscid_flux(ix, &u, &v, &normal, &mut f0);
        let mut jac = vec![0.0; nv * nv];
        inviscid_jacobian(ix, &u, &v, &der.dpdu, &normal, 1.0, &mut jac);

        let mut v_p = vec![0.0; ix.n_prim()];
        let mut der_p = PrimDerived::new(ix);
        for k in 0..nv {
            let eps = 1.0e-6 * u[k].abs().max(1.0);
            let mut u_p = u.clone();
            u_p[k] += eps;
            cons2prim(&gas, ix, &u_p, &mut v_p, &mut der_p);
            let mut f1 = vec![0.0; nv];
            inviscid_flux(ix, &u_p, &v_p, &normal, &mut f1);
            for row in 0..nv {
                let fd = (f1[row] - f0[row]) / eps;
                let an = jac[row * nv + k];
                assert!(
                    (fd - an).abs() <= 2.0e-3 * an.abs().max(1.0),
                    "dF[{row}]/dU[{k}]: fd {fd} vs analytic {an}"
                );
            }
        }
    }

    #[test]
    fn spectral_radius_positive_and_symmetric() {
        let (_, ix, _u, v, _) = state([100.0, 50.0]);
        let n = [0.0, 2.0];
        let lam = spectral_radius_inv(ix, &v, &v, &n);
        assert!(lam > 0.0);
        assert_eq!(lam, spectral_radius_inv(ix, &v, &v, &n));
    }
}
