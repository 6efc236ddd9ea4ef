// crates/karman-state/src/eos.rs

//! Two-temperature equation of state: conservative <-> primitive maps and
//! the pressure/temperature derivative vectors the kernels consume.

use crate::gas::GasModel;
use crate::indices::VarIndices;
use karman_core::Scalar;

/// Lower bound on the translational-rotational temperature [K].
pub const T_FLOOR: Scalar = 10.0;
/// Lower bound on the vibrational-electronic temperature [K].
pub const TVE_FLOOR: Scalar = 10.0;

/// Newton tolerance and budget of the `Tve` solve.
const TVE_NEWTON_TOL: Scalar = 1.0e-10;
const TVE_NEWTON_ITERS: usize = 50;

/// Derived quantities recomputed together with the primitive vector.
#[derive(Clone, Debug)]
pub struct PrimDerived {
    /// `dP/dU`, length `n_var`.
    pub dpdu: Vec<Scalar>,
    /// `dT/dU`, length `n_var`.
    pub dtdu: Vec<Scalar>,
    /// `dTve/dU`, length `n_var`.
    pub dtvedu: Vec<Scalar>,
    /// Per-species vibrational-electronic energy at `Tve`.
    pub eve: Vec<Scalar>,
    /// Per-species `d e_ve/d Tve` at `Tve`.
    pub cvve: Vec<Scalar>,
}

impl PrimDerived {
    #[must_use]
    pub fn new(ix: VarIndices) -> Self {
        Self {
            dpdu: vec![0.0; ix.n_var()],
            dtdu: vec![0.0; ix.n_var()],
            dtvedu: vec![0.0; ix.n_var()],
            eve: vec![0.0; ix.n_species],
            cvve: vec![0.0; ix.n_species],
        }
    }
}

/// Recompute the primitive vector `v` and derivative pack `der` from the
/// conservative vector `u`.
///
/// Returns `true` exactly when a physical bound is violated:
/// `rho_s < 0`, `T < T_FLOOR`, `Tve < TVE_FLOOR`, or `P < 0`. Outputs are
/// still filled (with temperatures clamped to their floors) so callers can
/// decide between clipping to a snapshot and falling back to freestream.
pub fn cons2prim(
    gas: &GasModel,
    ix: VarIndices,
    u: &[Scalar],
    v: &mut [Scalar],
    der: &mut PrimDerived,
) -> bool {
    let ns = ix.n_species;
    let nd = ix.n_dim;
    let mut non_phys = false;

    // Species and mixture density.
    let mut rho = 0.0;
    for s in 0..ns {
        let rho_s = u[s];
        if rho_s < 0.0 {
            non_phys = true;
        }
        v[s] = rho_s;
        rho += rho_s;
    }
    let rho_safe = rho.max(Scalar::MIN_POSITIVE);
    v[ix.rho()] = rho;

    // Velocity and kinetic energy.
    let mut ke = 0.0;
    for d in 0..nd {
        let vel = u[ix.u_mom().start + d] / rho_safe;
        v[ix.vel().start + d] = vel;
        ke += 0.5 * vel * vel;
    }

    // Mixture heat capacity and gas constant (translational-rotational).
    let mut rho_cv_tr = 0.0;
    let mut rho_r = 0.0;
    let mut rho_hf = 0.0;
    for s in 0..ns {
        let sp = &gas.species[s];
        let rho_s = u[s].max(0.0);
        rho_cv_tr += rho_s * sp.cv_tr();
        rho_r += rho_s * sp.r_gas();
        rho_hf += rho_s * sp.h_formation;
    }
    let rho_cv_tr_safe = rho_cv_tr.max(Scalar::MIN_POSITIVE);

    // Translational-rotational temperature straight from the energy budget.
    let rho_e = u[ix.u_rho_e()];
    let rho_eve = u[ix.u_rho_eve()];
    let mut t = (rho_e - rho_eve - rho * ke - rho_hf) / rho_cv_tr_safe;
    if t < T_FLOOR {
        non_phys = true;
        t = T_FLOOR;
    }
    v[ix.t()] = t;

    // Vibrational-electronic temperature by Newton on
    // f(Tve) = sum_s rho_s e_ve_s(Tve) - rhoEve.
    let has_vib = (0..ns).any(|s| gas.species[s].is_molecule() && u[s] > 0.0);
    let mut tve = if has_vib { solve_tve(gas, ix, u, rho_eve, t) } else { t };
    if tve < TVE_FLOOR {
        non_phys = true;
        tve = TVE_FLOOR;
    }
    v[ix.tve()] = tve;

    // Pressure (neutral mixture: Dalton over heavy species at T).
    let p = rho_r * t;
    if p < 0.0 {
        non_phys = true;
    }
    v[ix.p()] = p;

    // Vibrational heat capacity at the converged Tve.
    let mut rho_cv_ve = 0.0;
    for s in 0..ns {
        let sp = &gas.species[s];
        der.eve[s] = sp.e_ve(tve);
        der.cvve[s] = sp.cv_ve(tve);
        rho_cv_ve += u[s].max(0.0) * der.cvve[s];
    }
    v[ix.rho_cv_tr()] = rho_cv_tr;
    v[ix.rho_cv_ve()] = rho_cv_ve;

    // Frozen sound speed and total enthalpy.
    let gamma_term = rho_r / rho_cv_tr_safe; // R_bar / cv_bar
    let a2 = (1.0 + gamma_term) * p / rho_safe;
    v[ix.a()] = a2.max(0.0).sqrt();
    v[ix.h()] = (rho_e + p) / rho_safe;

    // Derivative vectors.
    let gamma = gamma_term;
    for s in 0..ns {
        let sp = &gas.species[s];
        let dtd_rhos = (ke - sp.h_formation - sp.cv_tr() * t) / rho_cv_tr_safe;
        der.dtdu[s] = dtd_rhos;
        der.dpdu[s] = sp.r_gas() * t + rho_r * dtd_rhos;
    }
    for d in 0..nd {
        let vel = v[ix.vel().start + d];
        der.dtdu[ix.u_mom().start + d] = -vel / rho_cv_tr_safe;
        der.dpdu[ix.u_mom().start + d] = -gamma * vel;
    }
    der.dtdu[ix.u_rho_e()] = 1.0 / rho_cv_tr_safe;
    der.dtdu[ix.u_rho_eve()] = -1.0 / rho_cv_tr_safe;
    der.dpdu[ix.u_rho_e()] = gamma;
    der.dpdu[ix.u_rho_eve()] = -gamma;

    let rho_cv_ve_safe = rho_cv_ve.max(Scalar::MIN_POSITIVE);
    for s in 0..ns {
        der.dtvedu[s] = if rho_cv_ve > 0.0 { -der.eve[s] / rho_cv_ve_safe } else { 0.0 };
    }
    for d in 0..nd {
        der.dtvedu[ix.u_mom().start + d] = 0.0;
    }
    der.dtvedu[ix.u_rho_e()] = 0.0;
    der.dtvedu[ix.u_rho_eve()] = if rho_cv_ve > 0.0 { 1.0 / rho_cv_ve_safe } else { 0.0 };

    non_phys
}

fn solve_tve(gas: &GasModel, ix: VarIndices, u: &[Scalar], rho_eve: Scalar, t_guess: Scalar) -> Scalar {
    let ns = ix.n_species;
    let mut tve = t_guess.clamp(TVE_FLOOR, 6.0e4);
    for _ in 0..TVE_NEWTON_ITERS {
        let mut f = -rho_eve;
        let mut df = 0.0;
        for s in 0..ns {
            let rho_s = u[s].max(0.0);
            f += rho_s * gas.species[s].e_ve(tve);
            df += rho_s * gas.species[s].cv_ve(tve);
        }
        if df <= 0.0 {
            break;
        }
        let step = f / df;
        tve -= step;
        if !(TVE_FLOOR..=6.0e4).contains(&tve) {
            tve = tve.clamp(TVE_FLOOR, 6.0e4);
        }
        if step.abs() <= TVE_NEWTON_TOL * tve.max(1.0) {
            break;
        }
    }
    tve
}

/// Build the conservative vector from species densities, temperatures, and
/// velocity (inlet/freestream states).
pub fn prim2cons(
    gas: &GasModel,
    ix: VarIndices,
    rho_s: &[Scalar],
    t: Scalar,
    tve: Scalar,
    vel: &[Scalar],
    u: &mut [Scalar],
) {
    let ns = ix.n_species;
    let nd = ix.n_dim;
    let mut rho = 0.0;
    for s in 0..ns {
        u[s] = rho_s[s];
        rho += rho_s[s];
    }
    let mut ke = 0.0;
    for d in 0..nd {
        u[ix.u_mom().start + d] = rho * vel[d];
        ke += 0.5 * vel[d] * vel[d];
    }
    let mut rho_e = rho * ke;
    let mut rho_eve = 0.0;
    for s in 0..ns {
        let sp = &gas.species[s];
        let e_ve = sp.e_ve(tve.max(TVE_FLOOR));
        rho_e += rho_s[s] * (sp.cv_tr() * t + sp.h_formation + e_ve);
        rho_eve += rho_s[s] * e_ve;
    }
    u[ix.u_rho_e()] = rho_e;
    u[ix.u_rho_eve()] = rho_eve;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn air2() -> (GasModel, VarIndices) {
        let gas = GasModel::from_names(&["N2", "O2"]).unwrap();
        let ix = VarIndices::new(2, 2);
        (gas, ix)
    }

    #[test]
    fn prim_cons_roundtrip() {
        let (gas, ix) = air2();
        let rho_s = [0.9, 0.3];
        let vel = [120.0, -40.0];
        let (t, tve) = (600.0, 900.0);
        let mut u = vec![0.0; ix.n_var()];
        prim2cons(&gas, ix, &rho_s, t, tve, &vel, &mut u);

        let mut v = vec![0.0; ix.n_prim()];
        let mut der = PrimDerived::new(ix);
        let non_phys = cons2prim(&gas, ix, &u, &mut v, &mut der);
        assert!(!non_phys);
        assert!((v[ix.t()] - t).abs() < 1e-6, "T = {}", v[ix.t()]);
        assert!((v[ix.tve()] - tve).abs() < 1e-6, "Tve = {}", v[ix.tve()]);
        assert!((v[ix.vel().start] - vel[0]).abs() < 1e-9);
        assert!(v[ix.p()] > 0.0 && v[ix.a()] > 0.0);
    }

    #[test]
    fn non_physical_detection_matches_bounds() {
        let (gas, ix) = air2();
        let mut u = vec![0.0; ix.n_var()];
        prim2cons(&gas, ix, &[1.0, 0.2], 300.0, 300.0, &[0.0, 0.0], &mut u);
        let mut v = vec![0.0; ix.n_prim()];
        let mut der = PrimDerived::new(ix);
        assert!(!cons2prim(&gas, ix, &u, &mut v, &mut der));

        // Negative species density trips the flag.
        let mut u_bad = u.clone();
        u_bad[1] = -1.0e-3;
        assert!(cons2prim(&gas, ix, &u_bad, &mut v, &mut der));

        // Draining total energy sends T below the floor.
        let mut u_cold = u.clone();
        u_cold[ix.u_rho_e()] = 0.0;
        assert!(cons2prim(&gas, ix, &u_cold, &mut v, &mut der));
    }

    proptest::proptest! {
        /// Over a broad range of physical states, prim -> cons -> prim
        /// recovers both temperatures and never flags non-physical.
        #[test]
        fn prim_cons_prim_recovers_temperatures(
            rho1 in 1.0e-3_f64..5.0,
            rho2 in 1.0e-3_f64..5.0,
            t in 200.0_f64..8000.0,
            tve in 200.0_f64..8000.0,
            u_vel in -2000.0_f64..2000.0,
        ) {
            let (gas, ix) = air2();
            let mut u = vec![0.0; ix.n_var()];
            prim2cons(&gas, ix, &[rho1, rho2], t, tve, &[u_vel, 0.0], &mut u);
            let mut v = vec![0.0; ix.n_prim()];
            let mut der = PrimDerived::new(ix);
            let non_phys = cons2prim(&gas, ix, &u, &mut v, &mut der);
            proptest::prop_assert!(!non_phys);
            proptest::prop_assert!((v[ix.t()] - t).abs() <= 1.0e-6 * t);
            proptest::prop_assert!((v[ix.tve()] - tve).abs() <= 1.0e-5 * tve);
        }
    }

    #[test]
    fn pressure_derivative_is_consistent() {
        // Finite-difference check of dP/dU, column by column.
        let (gas, ix) = air2();
        let mut u = vec![0.0; ix.n_var()];
        prim2cons(&gas, ix, &[0.8, 0.25], 700.0, 500.0, &[250.0, 30.0], &mut u);

        let mut v = vec![0.0; ix.n_prim()];
        let mut der = PrimDerived::new(ix);
        cons2prim(&gas, ix, &u, &mut v, &mut der);
        let p0 = v[ix.p()];

        let mut v_pert = vec![0.0; ix.n_prim()];
        let mut der_pert = PrimDerived::new(ix);
        for k in 0..ix.n_var() {
            let eps = 1.0e-6 * u[k].abs().max(1.0);
            let mut u_pert = u.clone();
            u_pert[k] += eps;
            cons2prim(&gas, ix, &u_pert, &mut v_pert, &mut der_pert);
            let fd = (v_pert[ix.p()] - p0) / eps;
            assert!(
                (fd - der.dpdu[k]).abs() <= 1.0e-3 * der.dpdu[k].abs().max(1.0),
                "dP/dU[{k}]: fd {fd} vs analytic {}",
                der.dpdu[k]
            );
        }
    }

    #[test]
    fn tve_derivative_is_consistent() {
        let (gas, ix) = air2();
        let mut u = vec![0.0; ix.n_var()];
        prim2cons(&gas, ix, &[0.8, 0.25], 700.0, 1500.0, &[100.0, 0.0], &mut u);

        let mut v = vec![0.0; ix.n_prim()];
        let mut der = PrimDerived::new(ix);
        cons2prim(&gas, ix, &u, &mut v, &mut der);
        let tve0 = v[ix.tve()];

        let k = ix.u_rho_eve();
        let eps = 1.0e-4 * u[k].abs().max(1.0);
        let mut u_pert = u.clone();
        u_pert[k] += eps;
        let mut der2 = PrimDerived::new(ix);
        cons2prim(&gas, ix, &u_pert, &mut v, &mut der2);
        let fd = (v[ix.tve()] - tve0) / eps;
        assert!((fd - der.dtvedu[k]).abs() <= 1.0e-3 * der.dtvedu[k].abs().max(1e-12));
    }
}
