// crates/karman-state/src/transport.rs

//! Transport properties of the mixture: Blottner species viscosities with
//! Wilke mixing, Eucken thermal conductivities split into
//! translational-rotational and vibrational-electronic parts, and
//! constant-Lewis-number species diffusion.

use crate::gas::GasModel;
use crate::indices::VarIndices;
use karman_core::Scalar;

/// Transport state of one node.
#[derive(Clone, Debug, Default)]
pub struct TransportProps {
    /// Mixture laminar viscosity [kg/(m s)].
    pub viscosity: Scalar,
    /// Translational-rotational conductivity [W/(m K)].
    pub k_tr: Scalar,
    /// Vibrational-electronic conductivity [W/(m K)].
    pub k_ve: Scalar,
    /// Per-species mass diffusion coefficient [m^2/s].
    pub diffusion: Vec<Scalar>,
}

/// Blottner curve fit: `mu_s = 0.1 exp[(A ln T + B) ln T + C]` (SI).
#[inline]
#[must_use]
pub fn blottner_viscosity(coeffs: &[Scalar; 3], t: Scalar) -> Scalar {
    let ln_t = t.ln();
    0.1 * ((coeffs[0] * ln_t + coeffs[1]) * ln_t + coeffs[2]).exp()
}

/// Evaluate mixture transport properties from the primitive vector.
pub fn evaluate(gas: &GasModel, ix: VarIndices, v: &[Scalar], out: &mut TransportProps) {
    let ns = ix.n_species;
    let t = v[ix.t()];
    let tve = v[ix.tve()];
    let rho = v[ix.rho()].max(Scalar::MIN_POSITIVE);

    // Mole fractions.
    let mut x = vec![0.0; ns];
    let mut x_sum = 0.0;
    for s in 0..ns {
        x[s] = v[s].max(0.0) / gas.species[s].molar_mass;
        x_sum += x[s];
    }
    let x_sum = x_sum.max(Scalar::MIN_POSITIVE);
    for xs in &mut x {
        *xs /= x_sum;
    }

    // Species viscosities + Wilke interaction factors.
    let mu: Vec<Scalar> = gas.species.iter().map(|s| blottner_viscosity(&s.blottner, t)).collect();
    let mut mu_mix = 0.0;
    let mut k_tr = 0.0;
    let mut k_ve = 0.0;
    for s in 0..ns {
        if x[s] <= 0.0 {
            continue;
        }
        let mut phi = 0.0;
        for r in 0..ns {
            let m_ratio = gas.species[s].molar_mass / gas.species[r].molar_mass;
            let num = (1.0 + (mu[s] / mu[r]).sqrt() * m_ratio.powf(-0.25)).powi(2);
            let den = (8.0 * (1.0 + m_ratio)).sqrt();
            phi += x[r] * num / den;
        }
        let sp = &gas.species[s];
        mu_mix += x[s] * mu[s] / phi;
        // Eucken: translational gets 5/2 cv_t, rotational and vibrational 1.
        let cv_t = 1.5 * sp.r_gas();
        let cv_r = sp.cv_tr() - cv_t;
        k_tr += x[s] * mu[s] * (2.5 * cv_t + cv_r) / phi;
        k_ve += x[s] * mu[s] * sp.cv_ve(tve) / phi;
    }
    out.viscosity = mu_mix;
    out.k_tr = k_tr;
    out.k_ve = k_ve;

    // Constant Lewis number: one diffusion coefficient for every species.
    let mut cp = 0.0;
    for s in 0..ns {
        let sp = &gas.species[s];
        cp += (v[s].max(0.0) / rho) * (sp.cv_tr() + sp.r_gas() + sp.cv_ve(tve));
    }
    let d = gas.lewis * k_tr / (rho * cp.max(Scalar::MIN_POSITIVE));
    out.diffusion.clear();
    out.diffusion.resize(ns, d);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eos::{prim2cons, cons2prim, PrimDerived};

    #[test]
    fn air_viscosity_near_reference() {
        // Air at 300 K is about 1.8e-5 kg/(m s).
        let gas = GasModel::from_names(&["N2", "O2"]).unwrap();
        let ix = VarIndices::new(2, 2);
        let mut u = vec![0.0; ix.n_var()];
        prim2cons(&gas, ix, &[0.9, 0.27], 300.0, 300.0, &[0.0, 0.0], &mut u);
        let mut v = vec![0.0; ix.n_prim()];
        let mut der = PrimDerived::new(ix);
        cons2prim(&gas, ix, &u, &mut v, &mut der);

        let mut props = TransportProps::default();
        evaluate(&gas, ix, &v, &mut props);
        assert!((1.0e-5..4.0e-5).contains(&props.viscosity), "mu = {}", props.viscosity);
        assert!(props.k_tr > 0.0 && props.k_ve >= 0.0);
        assert_eq!(props.diffusion.len(), 2);
        assert!(props.diffusion[0] > 0.0);
    }

    #[test]
    fn viscosity_grows_with_temperature() {
        let gas = GasModel::from_names(&["N2"]).unwrap();
        let mu_300 = blottner_viscosity(&gas.species[0].blottner, 300.0);
        let mu_2000 = blottner_viscosity(&gas.species[0].blottner, 2000.0);
        assert!(mu_2000 > mu_300);
    }
}
