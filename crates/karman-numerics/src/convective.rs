// crates/karman-numerics/src/convective.rs

//! Convective flux kernels: Roe and AUSM and HLLC upwinding, and the
//! Lax/JST centered family.
//!
//! All kernels fill the same [`KernelOutput`]; implicit Jacobians use the
//! projected-flux Jacobian with a spectral-radius dissipation term,
//! `Jac_i = 1/2 (A_i + lambda I)`, `Jac_j = 1/2 (A_j - lambda I)`.

use crate::flux::{inviscid_flux, inviscid_jacobian, spectral_radius_inv, EdgeState, KernelOutput};
use karman_core::{dot, norm2, Scalar};

/// A convective kernel, monomorphized and selected once per iteration.
pub trait ConvKernel {
    fn compute(&self, st: &EdgeState<'_>, out: &mut KernelOutput);
}

/// Common implicit Jacobian: central part plus scalar dissipation.
fn dissipative_jacobians(st: &EdgeState<'_>, lambda: Scalar, out: &mut KernelOutput) {
    let ix = st.ix;
    let nv = ix.n_var();
    inviscid_jacobian(ix, st.u_i, st.v_i, st.dpdu_i, st.normal, 0.5, &mut out.jac_i);
    inviscid_jacobian(ix, st.u_j, st.v_j, st.dpdu_j, st.normal, 0.5, &mut out.jac_j);
    for k in 0..nv {
        out.jac_i[k * nv + k] += 0.5 * lambda;
        out.jac_j[k * nv + k] -= 0.5 * lambda;
    }
}

/* ---------------------------------- Roe ------------------------------------ */

/// Roe flux-difference splitting with the two acoustic waves carried
/// explicitly and the convective bundle under `|vn|`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RoeKernel;

impl ConvKernel for RoeKernel {
    fn compute(&self, st: &EdgeState<'_>, out: &mut KernelOutput) {
        let ix = st.ix;
        let ns = ix.n_species;
        let nd = ix.n_dim;
        let nv = ix.n_var();
        out.reset();

        let area = norm2(st.normal, nd).max(Scalar::MIN_POSITIVE);
        let mut unit = [0.0; 3];
        for d in 0..nd {
            unit[d] = st.normal[d] / area;
        }

        // Roe averages (sqrt-rho weighting).
        let rho_i = st.v_i[ix.rho()];
        let rho_j = st.v_j[ix.rho()];
        let ri = rho_i.max(Scalar::MIN_POSITIVE).sqrt();
        let rj = rho_j.max(Scalar::MIN_POSITIVE).sqrt();
        let wi = ri / (ri + rj);
        let wj = 1.0 - wi;
        let rho_roe = ri * rj;

        let mut u_roe = [0.0; 3];
        for d in 0..nd {
            u_roe[d] = wi * st.v_i[ix.vel().start + d] + wj * st.v_j[ix.vel().start + d];
        }
        let vn_roe = dot(&u_roe, &unit, nd);
        let h_roe = wi * st.v_i[ix.h()] + wj * st.v_j[ix.h()];
        let eve_roe = wi * st.u_i[ix.u_rho_eve()] / rho_i.max(Scalar::MIN_POSITIVE)
            + wj * st.u_j[ix.u_rho_eve()] / rho_j.max(Scalar::MIN_POSITIVE);
        let mut y_roe = vec![0.0; ns];
        for s in 0..ns {
            y_roe[s] = wi * st.u_i[s] / rho_i.max(Scalar::MIN_POSITIVE)
                + wj * st.u_j[s] / rho_j.max(Scalar::MIN_POSITIVE);
        }
        // Frozen sound speed from the averaged state.
        let gamma_bar = 0.5
            * (st.dpdu_i[ix.u_rho_e()] + st.dpdu_j[ix.u_rho_e()]); // Gamma = dP/d(rhoE)
        let a_roe2 = (1.0 + gamma_bar) * 0.5 * (st.v_i[ix.p()] + st.v_j[ix.p()]) / rho_roe;
        let a_roe = a_roe2.max(Scalar::MIN_POSITIVE).sqrt();

        // Jumps.
        let dp = st.v_j[ix.p()] - st.v_i[ix.p()];
        let vn_i = dot(&st.v_i[ix.vel()], &unit, nd);
        let vn_j = dot(&st.v_j[ix.vel()], &unit, nd);
        let dvn = vn_j - vn_i;
        let alpha_m = (dp - rho_roe * a_roe * dvn) / (2.0 * a_roe2);
        let alpha_p = (dp + rho_roe * a_roe * dvn) / (2.0 * a_roe2);

        // Acoustic right eigenvectors (species, momentum, E, Eve slots).
        let mut r_m = vec![0.0; nv];
        let mut r_p = vec![0.0; nv];
        for s in 0..ns {
            r_m[s] = y_roe[s];
            r_p[s] = y_roe[s];
        }
        for d in 0..nd {
            r_m[ix.u_mom().start + d] = u_roe[d] - a_roe * unit[d];
            r_p[ix.u_mom().start + d] = u_roe[d] + a_roe * unit[d];
        }
        r_m[ix.u_rho_e()] = h_roe - a_roe * vn_roe;
        r_p[ix.u_rho_e()] = h_roe + a_roe * vn_roe;
        r_m[ix.u_rho_eve()] = eve_roe;
        r_p[ix.u_rho_eve()] = eve_roe;

        let lam_m = (vn_roe - a_roe).abs() * area;
        let lam_0 = vn_roe.abs() * area;
        let lam_p = (vn_roe + a_roe).abs() * area;

        // |A| dU = lam_0 (dU - dU_m - dU_p) + lam_m dU_m + lam_p dU_p.
        let mut f_i = vec![0.0; nv];
        let mut f_j = vec![0.0; nv];
        inviscid_flux(ix, st.u_i, st.v_i, st.normal, &mut f_i);
        inviscid_flux(ix, st.u_j, st.v_j, st.normal, &mut f_j);
        for k in 0..nv {
            let du = st.u_j[k] - st.u_i[k];
            let du_m = alpha_m * r_m[k];
            let du_p = alpha_p * r_p[k];
            let diss = lam_0 * (du - du_m - du_p) + lam_m * du_m + lam_p * du_p;
            out.res[k] = 0.5 * (f_i[k] + f_j[k]) - 0.5 * diss;
        }

        dissipative_jacobians(st, (vn_roe.abs() + a_roe) * area, out);
    }
}

/* ---------------------------------- AUSM ----------------------------------- */

/// AUSM with Mach/pressure polynomial splitting.
#[derive(Clone, Copy, Debug, Default)]
pub struct AusmKernel;

impl ConvKernel for AusmKernel {
    fn compute(&self, st: &EdgeState<'_>, out: &mut KernelOutput) {
        let ix = st.ix;
        let ns = ix.n_species;
        let nd = ix.n_dim;
        out.reset();

        let area = norm2(st.normal, nd).max(Scalar::MIN_POSITIVE);
        let mut unit = [0.0; 3];
        for d in 0..nd {
            unit[d] = st.normal[d] / area;
        }
        let a_half = 0.5 * (st.v_i[ix.a()] + st.v_j[ix.a()]);
        let m_i = dot(&st.v_i[ix.vel()], &unit, nd) / a_half;
        let m_j = dot(&st.v_j[ix.vel()], &unit, nd) / a_half;

        let (m_plus, p_plus) = if m_i.abs() <= 1.0 {
            (0.25 * (m_i + 1.0).powi(2), 0.25 * (m_i + 1.0).powi(2) * (2.0 - m_i))
        } else {
            (0.5 * (m_i + m_i.abs()), 0.5 * (m_i + m_i.abs()) / m_i)
        };
        let (m_minus, p_minus) = if m_j.abs() <= 1.0 {
            (-0.25 * (m_j - 1.0).powi(2), 0.25 * (m_j - 1.0).powi(2) * (2.0 + m_j))
        } else {
            (0.5 * (m_j - m_j.abs()), 0.5 * (m_j - m_j.abs()) / m_j)
        };
        let m_half = m_plus + m_minus;
        let p_half = p_plus * st.v_i[ix.p()] + p_minus * st.v_j[ix.p()];

        // Upwinded convected bundle.
        let (u_up, v_up) = if m_half >= 0.0 { (st.u_i, st.v_i) } else { (st.u_j, st.v_j) };
        let rho_up = v_up[ix.rho()].max(Scalar::MIN_POSITIVE);
        let mdot = a_half * m_half * rho_up * area;
        for s in 0..ns {
            out.res[s] = mdot * u_up[s] / rho_up;
        }
        for d in 0..nd {
            out.res[ix.u_mom().start + d] = mdot * v_up[ix.vel().start + d] + p_half * st.normal[d];
        }
        out.res[ix.u_rho_e()] = mdot * v_up[ix.h()];
        out.res[ix.u_rho_eve()] = mdot * u_up[ix.u_rho_eve()] / rho_up;

        let lambda = spectral_radius_inv(ix, st.v_i, st.v_j, st.normal);
        dissipative_jacobians(st, lambda, out);
    }
}

/* ---------------------------------- HLLC ----------------------------------- */

/// HLLC with Davis wave-speed estimates and species-resolved star states.
#[derive(Clone, Copy, Debug, Default)]
pub struct HllcKernel;

impl ConvKernel for HllcKernel {
    fn compute(&self, st: &EdgeState<'_>, out: &mut KernelOutput) {
        let ix = st.ix;
        let ns = ix.n_species;
        let nd = ix.n_dim;
        let nv = ix.n_var();
        out.reset();

        let area = norm2(st.normal, nd).max(Scalar::MIN_POSITIVE);
        let mut unit = [0.0; 3];
        for d in 0..nd {
            unit[d] = st.normal[d] / area;
        }
        let rho_i = st.v_i[ix.rho()].max(Scalar::MIN_POSITIVE);
        let rho_j = st.v_j[ix.rho()].max(Scalar::MIN_POSITIVE);
        let vn_i = dot(&st.v_i[ix.vel()], &unit, nd);
        let vn_j = dot(&st.v_j[ix.vel()], &unit, nd);
        let p_i = st.v_i[ix.p()];
        let p_j = st.v_j[ix.p()];

        let s_l = (vn_i - st.v_i[ix.a()]).min(vn_j - st.v_j[ix.a()]);
        let s_r = (vn_i + st.v_i[ix.a()]).max(vn_j + st.v_j[ix.a()]);
        let s_m = (p_j - p_i + rho_i * vn_i * (s_l - vn_i) - rho_j * vn_j * (s_r - vn_j))
            / (rho_i * (s_l - vn_i) - rho_j * (s_r - vn_j));

        let flux_side = |u: &[Scalar], v: &[Scalar], vn: Scalar, p: Scalar, s: Scalar, out_res: &mut [Scalar]| {
            // F_side + S (U* - U), with the standard HLLC star state.
            let rho = v[ix.rho()].max(Scalar::MIN_POSITIVE);
            let factor = rho * (s - vn) / (s - s_m);
            let p_star = p + rho * (s - vn) * (s_m - vn);
            let mut f = vec![0.0; nv];
            inviscid_flux(ix, u, v, st.normal, &mut f);
            for s_idx in 0..ns {
                let u_star = factor * u[s_idx] / rho;
                out_res[s_idx] = f[s_idx] + s * area * (u_star - u[s_idx]);
            }
            for d in 0..nd {
                let k = ix.u_mom().start + d;
                let u_star = factor * (v[ix.vel().start + d] + (s_m - vn) * unit[d]);
                out_res[k] = f[k] + s * area * (u_star - u[k]);
            }
            {
                let k = ix.u_rho_e();
                let e = u[k] / rho;
                let u_star = factor * (e + (s_m - vn) * (s_m + p / (rho * (s - vn))));
                out_res[k] = f[k] + s * area * (u_star - u[k]);
                let _ = p_star;
            }
            {
                let k = ix.u_rho_eve();
                let u_star = factor * u[k] / rho;
                out_res[k] = f[k] + s * area * (u_star - u[k]);
            }
        };

        if s_l >= 0.0 {
            inviscid_flux(ix, st.u_i, st.v_i, st.normal, &mut out.res);
        } else if s_r <= 0.0 {
            inviscid_flux(ix, st.u_j, st.v_j, st.normal, &mut out.res);
        } else if s_m >= 0.0 {
            let mut res = vec![0.0; nv];
            flux_side(st.u_i, st.v_i, vn_i, p_i, s_l, &mut res);
            out.res.copy_from_slice(&res);
        } else {
            let mut res = vec![0.0; nv];
            flux_side(st.u_j, st.v_j, vn_j, p_j, s_r, &mut res);
            out.res.copy_from_slice(&res);
        }

        let lambda = spectral_radius_inv(ix, st.v_i, st.v_j, st.normal);
        dissipative_jacobians(st, lambda, out);
    }
}

/* --------------------------------- centered -------------------------------- */

/// Lax-Friedrichs / JST centered kernel. With `jst = false` the dissipation
/// is first-difference scalar; with `jst = true` it blends the
/// sensor-scaled second difference with a fourth difference built from the
/// undivided Laplacians.
#[derive(Clone, Copy, Debug)]
pub struct CenteredKernel {
    pub jst: bool,
    pub kappa2: Scalar,
    pub kappa4: Scalar,
}

impl CenteredKernel {
    #[must_use]
    pub fn lax() -> Self {
        Self { jst: false, kappa2: 0.5, kappa4: 0.0 }
    }

    #[must_use]
    pub fn jst(kappa2: Scalar, kappa4: Scalar) -> Self {
        Self { jst: true, kappa2, kappa4 }
    }
}

impl ConvKernel for CenteredKernel {
    fn compute(&self, st: &EdgeState<'_>, out: &mut KernelOutput) {
        let ix = st.ix;
        let nv = ix.n_var();
        out.reset();

        let mut f_i = vec![0.0; nv];
        let mut f_j = vec![0.0; nv];
        inviscid_flux(ix, st.u_i, st.v_i, st.normal, &mut f_i);
        inviscid_flux(ix, st.u_j, st.v_j, st.normal, &mut f_j);

        let lambda = 0.5 * (st.lambda_i + st.lambda_j).max(spectral_radius_inv(ix, st.v_i, st.v_j, st.normal));
        let (eps2, eps4) = if self.jst {
            let sensor = 0.5 * (st.sensor_i + st.sensor_j);
            let e2 = self.kappa2 * sensor;
            (e2, (self.kappa4 - e2 / 8.0).max(0.0))
        } else {
            (self.kappa2, 0.0)
        };

        for k in 0..nv {
            let du = st.u_j[k] - st.u_i[k];
            let mut diss = eps2 * du;
            if self.jst {
                if let (Some(li), Some(lj)) = (st.und_lapl_i, st.und_lapl_j) {
                    diss -= eps4 * (lj[k] - li[k]);
                }
            }
            out.res[k] = 0.5 * (f_i[k] + f_j[k]) - lambda * diss;
        }

        dissipative_jacobians(st, 2.0 * eps2 * lambda, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karman_core::KernelStatus;
    use karman_state::{cons2prim, prim2cons, GasModel, PrimDerived, VarIndices};

    struct Fixture {
        ix: VarIndices,
        u_i: Vec<Scalar>,
        u_j: Vec<Scalar>,
        v_i: Vec<Scalar>,
        v_j: Vec<Scalar>,
        der_i: PrimDerived,
        der_j: PrimDerived,
        normal: Vec<Scalar>,
        coord_i: Vec<Scalar>,
        coord_j: Vec<Scalar>,
    }

    impl Fixture {
        fn uniform(vel: [Scalar; 2], normal: [Scalar; 2]) -> Self {
            let gas = GasModel::from_names(&["N2", "O2"]).unwrap();
            let ix = VarIndices::new(2, 2);
            let mut u = vec![0.0; ix.n_var()];
            prim2cons(&gas, ix, &[0.9, 0.3], 400.0, 400.0, &vel, &mut u);
            let mut v = vec![0.0; ix.n_prim()];
            let mut der = PrimDerived::new(ix);
            cons2prim(&gas, ix, &u, &mut v, &mut der);
            Self {
                ix,
                u_i: u.clone(),
                u_j: u,
                v_i: v.clone(),
                v_j: v,
                der_i: der.clone(),
                der_j: der,
                normal: normal.to_vec(),
                coord_i: vec![0.0, 0.0],
                coord_j: vec![1.0, 0.0],
            }
        }

        fn edge(&self) -> EdgeState<'_> {
            EdgeState {
                ix: self.ix,
                normal: &self.normal,
                u_i: &self.u_i,
                u_j: &self.u_j,
                v_i: &self.v_i,
                v_j: &self.v_j,
                dpdu_i: &self.der_i.dpdu,
                dpdu_j: &self.der_j.dpdu,
                dtdu_i: &self.der_i.dtdu,
                dtdu_j: &self.der_j.dtdu,
                dtvedu_i: &self.der_i.dtvedu,
                dtvedu_j: &self.der_j.dtvedu,
                eve_i: &self.der_i.eve,
                eve_j: &self.der_j.eve,
                cvve_i: &self.der_i.cvve,
                cvve_j: &self.der_j.cvve,
                grad_i: None,
                grad_j: None,
                und_lapl_i: None,
                und_lapl_j: None,
                sensor_i: 0.0,
                sensor_j: 0.0,
                lambda_i: 0.0,
                lambda_j: 0.0,
                mu_i: 0.0,
                mu_j: 0.0,
                ktr_i: 0.0,
                ktr_j: 0.0,
                kve_i: 0.0,
                kve_j: 0.0,
                diff_i: None,
                diff_j: None,
                coord_i: &self.coord_i,
                coord_j: &self.coord_j,
            }
        }
    }

    /// One edge, aligned flow: the convective mass flux through the face is
    /// exactly `rho u |A|`, and the caller applies it with opposite signs to
    /// the two endpoints.
    #[test]
    fn aligned_edge_mass_flux_is_rho_u_area() {
        let area = 2.5;
        let fx = Fixture::uniform([120.0, 0.0], [area, 0.0]);
        let st = fx.edge();
        let mut out = KernelOutput::new(fx.ix.n_var());
        AusmKernel.compute(&st, &mut out);
        let rho = fx.v_i[fx.ix.rho()];
        let expect = rho * 120.0 * area;
        let got: Scalar = out.res[..fx.ix.n_species].iter().sum();
        assert!((got - expect).abs() < 1.0e-9 * expect, "mass flux {got} vs {expect}");
    }

    /// At a uniform state every upwind flux collapses to the exact
    /// projected flux (no dissipation), so all kernels agree.
    #[test]
    fn kernels_are_consistent_at_uniform_state() {
        let fx = Fixture::uniform([150.0, 30.0], [0.4, 1.1]);
        let st = fx.edge();
        let nv = fx.ix.n_var();
        let mut exact = vec![0.0; nv];
        inviscid_flux(fx.ix, &fx.u_i, &fx.v_i, &fx.normal, &mut exact);

        let mut out = KernelOutput::new(nv);
        let lax = CenteredKernel::lax();
        for kernel in [&RoeKernel as &dyn ConvKernel, &AusmKernel, &HllcKernel, &lax] {
            kernel.compute(&st, &mut out);
            out.guard_nan(true);
            assert_eq!(out.status, KernelStatus::Ok);
            for k in 0..nv {
                assert!(
                    (out.res[k] - exact[k]).abs() <= 1.0e-8 * exact[k].abs().max(1.0),
                    "component {k}: {} vs {}",
                    out.res[k],
                    exact[k]
                );
            }
        }
    }

    /// Supersonic flow aligned with the normal: upwind kernels must return
    /// exactly the upstream flux.
    #[test]
    fn supersonic_upwinding_takes_upstream_state() {
        let mut fx = Fixture::uniform([900.0, 0.0], [1.0, 0.0]);
        // Perturb the downstream side; the flux must ignore it.
        fx.u_j[0] *= 1.05;
        let gas = GasModel::from_names(&["N2", "O2"]).unwrap();
        let mut der = PrimDerived::new(fx.ix);
        cons2prim(&gas, fx.ix, &fx.u_j, &mut fx.v_j, &mut der);
        fx.der_j = der;

        let st = fx.edge();
        let nv = fx.ix.n_var();
        let mut exact = vec![0.0; nv];
        inviscid_flux(fx.ix, &fx.u_i, &fx.v_i, &fx.normal, &mut exact);
        let mut out = KernelOutput::new(nv);
        for kernel in [&AusmKernel as &dyn ConvKernel, &HllcKernel] {
            kernel.compute(&st, &mut out);
            for k in 0..nv {
                assert!(
                    (out.res[k] - exact[k]).abs() <= 1.0e-8 * exact[k].abs().max(1.0),
                    "component {k}"
                );
            }
        }
    }

    #[test]
    fn nan_guard_flags_poisoned_jacobian() {
        let fx = Fixture::uniform([10.0, 0.0], [1.0, 0.0]);
        let mut out = KernelOutput::new(fx.ix.n_var());
        RoeKernel.compute(&fx.edge(), &mut out);
        out.jac_i[0] = Scalar::NAN;
        out.guard_nan(true);
        assert_eq!(out.status, KernelStatus::NanDetected);
    }
}
