// crates/karman-numerics/src/sources.rs

//! Per-point source terms: axisymmetric relaxation of the 2-D equations,
//! finite-rate chemistry, and Landau-Teller vibrational relaxation.
//!
//! Each term fills `res` with `S * Vol` (the physical source; the solver
//! subtracts it from the residual) and a forward-difference Jacobian. After
//! evaluation the caller scans for NaN; a poisoned term is dropped for that
//! point and its counter incremented. Counters are reduced to rank 0 for a
//! warning and never abort the run.

use crate::flux::KernelOutput;
use karman_core::Scalar;
use karman_state::{cons2prim, GasModel, PrimDerived, VarIndices};

/// Per-term skip counters (`eAxi`, `eChm`, `eVib`).
#[derive(Clone, Copy, Debug, Default)]
pub struct SourceCounters {
    pub e_axi: u64,
    pub e_chm: u64,
    pub e_vib: u64,
}

impl SourceCounters {
    #[inline]
    #[must_use]
    pub fn any(&self) -> bool {
        self.e_axi + self.e_chm + self.e_vib > 0
    }

    pub fn merge(&mut self, other: &Self) {
        self.e_axi += other.e_axi;
        self.e_chm += other.e_chm;
        self.e_vib += other.e_vib;
    }
}

/// Which source term to evaluate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Axisymmetric,
    Chemistry,
    VibRelaxation,
}

/// Source-term evaluator with per-thread scratch for the finite-difference
/// Jacobians.
#[derive(Clone, Debug)]
pub struct SourceTerms {
    ix: VarIndices,
    scratch_u: Vec<Scalar>,
    scratch_v: Vec<Scalar>,
    scratch_der: PrimDerived,
    scratch_res: Vec<Scalar>,
    base_res: Vec<Scalar>,
}

impl SourceTerms {
    #[must_use]
    pub fn new(ix: VarIndices) -> Self {
        Self {
            ix,
            scratch_u: vec![0.0; ix.n_var()],
            scratch_v: vec![0.0; ix.n_prim()],
            scratch_der: PrimDerived::new(ix),
            scratch_res: vec![0.0; ix.n_var()],
            base_res: vec![0.0; ix.n_var()],
        }
    }

    /// Evaluate one source term with residual and forward-difference
    /// Jacobian. `y_coord` is the radial coordinate (axisymmetric only).
    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        &mut self,
        kind: SourceKind,
        gas: &GasModel,
        u: &[Scalar],
        v: &[Scalar],
        der: &PrimDerived,
        vol: Scalar,
        y_coord: Scalar,
        out: &mut KernelOutput,
    ) {
        let nv = self.ix.n_var();
        out.reset();
        evaluate(kind, gas, self.ix, u, v, der, vol, y_coord, &mut out.res);
        self.base_res.copy_from_slice(&out.res);

        // Forward-difference Jacobian, column by column.
        for k in 0..nv {
            let eps = 1.0e-7 * u[k].abs().max(1.0e-8);
            self.scratch_u.copy_from_slice(u);
            self.scratch_u[k] += eps;
            let _ = cons2prim(gas, self.ix, &self.scratch_u, &mut self.scratch_v, &mut self.scratch_der);
            evaluate(
                kind,
                gas,
                self.ix,
                &self.scratch_u,
                &self.scratch_v,
                &self.scratch_der,
                vol,
                y_coord,
                &mut self.scratch_res,
            );
            for row in 0..nv {
                out.jac_i[row * nv + k] = (self.scratch_res[row] - self.base_res[row]) / eps;
            }
        }
    }
}

/// Residual of one source term, `S * Vol`, without Jacobian.
#[allow(clippy::too_many_arguments)]
pub fn evaluate(
    kind: SourceKind,
    gas: &GasModel,
    ix: VarIndices,
    u: &[Scalar],
    v: &[Scalar],
    der: &PrimDerived,
    vol: Scalar,
    y_coord: Scalar,
    res: &mut [Scalar],
) {
    res.fill(0.0);
    match kind {
        SourceKind::Axisymmetric => axisymmetric(ix, u, v, vol, y_coord, res),
        SourceKind::Chemistry => chemistry(gas, ix, u, v, der, vol, res),
        SourceKind::VibRelaxation => vib_relaxation(gas, ix, u, v, vol, res),
    }
}

/// Axisymmetric source: `S = -(1/y) [rho_s v, rho u v, rho v^2, rho H v,
/// rho Eve v]`, with `y` the radial coordinate.
fn axisymmetric(ix: VarIndices, u: &[Scalar], v: &[Scalar], vol: Scalar, y_coord: Scalar, res: &mut [Scalar]) {
    let ns = ix.n_species;
    let vel_r = v[ix.vel().start + 1];
    let coeff = -vol / y_coord; // NaN at the axis; the guard drops it
    for s in 0..ns {
        res[s] = coeff * u[s] * vel_r;
    }
    res[ix.u_mom().start] = coeff * u[ix.u_mom().start] * vel_r;
    res[ix.u_mom().start + 1] = coeff * u[ix.u_mom().start + 1] * vel_r;
    res[ix.u_rho_e()] = coeff * (u[ix.u_rho_e()] + v[ix.p()]) * vel_r;
    res[ix.u_rho_eve()] = coeff * u[ix.u_rho_eve()] * vel_r;
}

/// Finite-rate chemistry via mass action. Forward rates are Arrhenius at
/// Park's rate-controlling temperature `Ta = sqrt(T Tve)` for dissociation
/// and `T` for exchange; backward rates come from the equilibrium constant.
fn chemistry(gas: &GasModel, ix: VarIndices, u: &[Scalar], v: &[Scalar], der: &PrimDerived, vol: Scalar, res: &mut [Scalar]) {
    let ns = ix.n_species;
    let t = v[ix.t()];
    let tve = v[ix.tve()];

    // Molar concentrations [kmol/m^3].
    let mut conc = vec![0.0; ns];
    let mut conc_total = 0.0;
    for s in 0..ns {
        conc[s] = u[s].max(0.0) / gas.species[s].molar_mass;
        conc_total += conc[s];
    }

    let mut wdot = vec![0.0; ns]; // kmol/(m^3 s), converted to mass below
    for r in &gas.reactions {
        let ta = if r.third_body { (t * tve).sqrt() } else { t };
        let kf = r.arrhenius_c * ta.powf(r.arrhenius_eta) * (-r.theta_d / ta).exp();
        let kb = kf / gas.equilibrium_constant(r, t).max(Scalar::MIN_POSITIVE);

        let mut fwd = kf;
        for &s in &r.reactants {
            fwd *= conc[s];
        }
        let mut bwd = kb;
        for &s in &r.products {
            bwd *= conc[s];
        }
        let mut rate = fwd - bwd;
        if r.third_body {
            rate *= conc_total;
        }
        for &s in &r.reactants {
            wdot[s] -= rate;
        }
        for &s in &r.products {
            wdot[s] += rate;
        }
    }

    for s in 0..ns {
        let mass_rate = wdot[s] * gas.species[s].molar_mass; // kg/(m^3 s)
        res[s] = mass_rate * vol;
        // Created or destroyed molecules carry vibrational energy.
        res[ix.u_rho_eve()] += mass_rate * der.eve[s] * vol;
    }
}

/// Landau-Teller vibrational relaxation with Millikan-White relaxation times
/// and Park's high-temperature collision-limited correction.
fn vib_relaxation(gas: &GasModel, ix: VarIndices, u: &[Scalar], v: &[Scalar], vol: Scalar, res: &mut [Scalar]) {
    let ns = ix.n_species;
    let t = v[ix.t()];
    let tve = v[ix.tve()];
    let p_atm = (v[ix.p()] / 101_325.0).max(Scalar::MIN_POSITIVE);

    // Mole fractions and mixture number density.
    let mut x = vec![0.0; ns];
    let mut x_sum = 0.0;
    let mut n_mix = 0.0;
    for s in 0..ns {
        x[s] = u[s].max(0.0) / gas.species[s].molar_mass;
        x_sum += x[s];
        n_mix += x[s] * N_AVOGADRO_LOCAL;
    }
    let x_sum = x_sum.max(Scalar::MIN_POSITIVE);
    for xs in &mut x {
        *xs /= x_sum;
    }

    let mut s_ve = 0.0;
    for s in 0..ns {
        let sp = &gas.species[s];
        if !sp.is_molecule() || u[s] <= 0.0 {
            continue;
        }
        // Millikan-White, mole-fraction averaged over collision partners.
        let mut inv_tau_mw = 0.0;
        for r in 0..ns {
            if x[r] <= 0.0 {
                continue;
            }
            let mu_sr = sp.molar_mass * gas.species[r].molar_mass / (sp.molar_mass + gas.species[r].molar_mass);
            let a_sr = 1.16e-3 * mu_sr.sqrt() * sp.theta_v.powf(4.0 / 3.0);
            let b_sr = 0.015 * mu_sr.powf(0.25);
            let tau_sr = (a_sr * (t.powf(-1.0 / 3.0) - b_sr) - 18.42).exp() / p_atm;
            inv_tau_mw += x[r] / tau_sr.max(Scalar::MIN_POSITIVE);
        }
        let tau_mw = 1.0 / inv_tau_mw.max(Scalar::MIN_POSITIVE);

        // Park correction: limiting cross-section collision time.
        let sigma = 1.0e-21 * (50_000.0 / t).powi(2);
        let c_bar = (8.0 * sp.r_gas() * t / std::f64::consts::PI).sqrt();
        let tau_park = 1.0 / (sigma * c_bar * n_mix.max(Scalar::MIN_POSITIVE));
        let tau = tau_mw + tau_park;

        s_ve += u[s] * (sp.e_ve(t) - sp.e_ve(tve)) / tau;
    }
    res[ix.u_rho_eve()] = s_ve * vol;
}

/// Avogadro number [1/kmol], local copy to keep this module self-contained.
const N_AVOGADRO_LOCAL: Scalar = 6.022_140_76e26;

#[cfg(test)]
mod tests {
    use super::*;
    use karman_core::{any_nan, KernelStatus};
    use karman_state::prim2cons;

    fn hot_air5(t: Scalar, tve: Scalar) -> (GasModel, VarIndices, Vec<Scalar>, Vec<Scalar>, PrimDerived) {
        let gas = GasModel::from_names(&["N2", "O2", "NO", "N", "O"]).unwrap();
        let ix = VarIndices::new(5, 2);
        let rho_s = [0.7, 0.2, 0.02, 0.01, 0.07];
        let mut u = vec![0.0; ix.n_var()];
        prim2cons(&gas, ix, &rho_s, t, tve, &[500.0, 0.0], &mut u);
        let mut v = vec![0.0; ix.n_prim()];
        let mut der = PrimDerived::new(ix);
        assert!(!cons2prim(&gas, ix, &u, &mut v, &mut der));
        (gas, ix, u, v, der)
    }

    #[test]
    fn hot_gas_dissociates_nitrogen() {
        let (gas, ix, u, v, der) = hot_air5(8000.0, 8000.0);
        let mut res = vec![0.0; ix.n_var()];
        evaluate(SourceKind::Chemistry, &gas, ix, &u, &v, &der, 1.0, 1.0, &mut res);
        assert!(res[0] < 0.0, "N2 is consumed, got {}", res[0]);
        assert!(res[3] > 0.0, "N is produced, got {}", res[3]);
        // Mass is conserved by the mechanism.
        let total: Scalar = res[..5].iter().sum();
        let scale: Scalar = res[..5].iter().map(|r| r.abs()).sum();
        assert!(total.abs() <= 1.0e-10 * scale.max(1.0), "sum w_s = {total}");
    }

    #[test]
    fn cold_gas_barely_reacts() {
        let (gas, ix, u, v, der) = hot_air5(300.0, 300.0);
        let mut res = vec![0.0; ix.n_var()];
        evaluate(SourceKind::Chemistry, &gas, ix, &u, &v, &der, 1.0, 1.0, &mut res);
        assert!(res[0].abs() < 1.0e-6, "no dissociation at 300 K, got {}", res[0]);
    }

    #[test]
    fn vib_relaxation_drives_tve_toward_t() {
        let (gas, ix, u, v, _der) = hot_air5(8000.0, 2000.0);
        let mut res = vec![0.0; ix.n_var()];
        vib_relaxation(&gas, ix, &u, &v, 1.0, &mut res);
        assert!(res[ix.u_rho_eve()] > 0.0, "cold vibrational bath absorbs energy");

        let (gas, ix, u, v, _der) = hot_air5(2000.0, 8000.0);
        vib_relaxation(&gas, ix, &u, &v, 1.0, &mut res);
        assert!(res[ix.u_rho_eve()] < 0.0, "hot vibrational bath releases energy");
    }

    #[test]
    fn axisymmetric_source_vanishes_without_radial_velocity() {
        let (gas, ix, mut u, mut v, mut der) = hot_air5(1000.0, 1000.0);
        let _ = &gas;
        // Kill the radial (y) velocity.
        u[ix.u_mom().start + 1] = 0.0;
        cons2prim(&gas, ix, &u, &mut v, &mut der);
        let mut res = vec![0.0; ix.n_var()];
        axisymmetric(ix, &u, &v, 2.0, 0.5, &mut res);
        assert!(res.iter().all(|r| r.abs() < 1e-12));
    }

    #[test]
    fn axis_point_produces_nan_and_is_guarded() {
        let (gas, ix, u, v, der) = hot_air5(1000.0, 1000.0);
        let mut terms = SourceTerms::new(ix);
        let mut out = KernelOutput::new(ix.n_var());
        // y = 0 on the axis: 1/y blows up; the NaN guard must catch it.
        terms.compute(SourceKind::Axisymmetric, &gas, &u, &v, &der, 1.0, 0.0, &mut out);
        out.guard_nan(true);
        assert!(any_nan(&out.res) || out.res.iter().any(|r| r.is_infinite()));
        assert!(matches!(out.status, KernelStatus::NanDetected | KernelStatus::Ok));
    }

    #[test]
    fn chemistry_jacobian_columns_are_finite() {
        let (gas, ix, u, v, der) = hot_air5(6000.0, 6000.0);
        let mut terms = SourceTerms::new(ix);
        let mut out = KernelOutput::new(ix.n_var());
        terms.compute(SourceKind::Chemistry, &gas, &u, &v, &der, 1.0, 1.0, &mut out);
        out.guard_nan(true);
        assert_eq!(out.status, KernelStatus::Ok);
        assert!(!any_nan(&out.jac_i));
    }
}
