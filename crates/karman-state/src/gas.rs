// crates/karman-state/src/gas.rs

//! Two-temperature mixture gas model.
//!
//! Species carry the data the equation of state and the source terms need:
//! molar mass, formation enthalpy, characteristic vibrational and rotational
//! temperatures. Translational-rotational energy relaxes at `T`; vibrational
//! (harmonic-oscillator) energy at `Tve`. Ionized species are rejected at
//! configuration time, so every species here is neutral.

use karman_core::{CoreResult, KarmanError, Scalar, R_UNIVERSAL};

/// Boltzmann constant [J/K].
pub const K_BOLTZMANN: Scalar = 1.380_649e-23;
/// Planck constant [J s].
pub const H_PLANCK: Scalar = 6.626_070_15e-34;
/// Avogadro number [1/kmol].
pub const N_AVOGADRO: Scalar = 6.022_140_76e26;

/// One neutral species of the mixture.
#[derive(Clone, Debug)]
pub struct Species {
    pub name: &'static str,
    /// Molar mass [kg/kmol].
    pub molar_mass: Scalar,
    /// Formation enthalpy at 0 K [J/kg].
    pub h_formation: Scalar,
    /// Characteristic vibrational temperature [K]; 0 for atoms.
    pub theta_v: Scalar,
    /// Characteristic rotational temperature [K]; 0 for atoms.
    pub theta_r: Scalar,
    /// Rotational symmetry factor; 0 for atoms.
    pub sigma_rot: Scalar,
    /// Blottner viscosity curve-fit coefficients (A, B, C).
    pub blottner: [Scalar; 3],
}

impl Species {
    #[inline]
    #[must_use]
    pub fn is_molecule(&self) -> bool {
        self.theta_v > 0.0
    }

    /// Specific gas constant [J/(kg K)].
    #[inline]
    #[must_use]
    pub fn r_gas(&self) -> Scalar {
        R_UNIVERSAL / self.molar_mass
    }

    /// Translational-rotational specific heat at constant volume.
    #[inline]
    #[must_use]
    pub fn cv_tr(&self) -> Scalar {
        let dof = if self.is_molecule() { 2.5 } else { 1.5 };
        dof * self.r_gas()
    }

    /// Vibrational-electronic energy per unit mass at `t_ve` (harmonic
    /// oscillator; atoms carry none).
    #[must_use]
    pub fn e_ve(&self, t_ve: Scalar) -> Scalar {
        if !self.is_molecule() {
            return 0.0;
        }
        let x = self.theta_v / t_ve;
        self.r_gas() * self.theta_v / (x.exp() - 1.0)
    }

    /// `d e_ve / d T_ve` at `t_ve`.
    #[must_use]
    pub fn cv_ve(&self, t_ve: Scalar) -> Scalar {
        if !self.is_molecule() {
            return 0.0;
        }
        let x = self.theta_v / t_ve;
        let ex = x.exp();
        self.r_gas() * x * x * ex / ((ex - 1.0) * (ex - 1.0))
    }

    /// Per-volume molecular partition function `Q/V` at `t` [1/m^3],
    /// translational x rotational x vibrational.
    #[must_use]
    pub fn partition_per_volume(&self, t: Scalar) -> Scalar {
        let m = self.molar_mass / N_AVOGADRO;
        let q_tr = (2.0 * std::f64::consts::PI * m * K_BOLTZMANN * t / (H_PLANCK * H_PLANCK)).powf(1.5);
        let q_rot = if self.is_molecule() { t / (self.sigma_rot * self.theta_r) } else { 1.0 };
        let q_vib = if self.is_molecule() { 1.0 / (1.0 - (-self.theta_v / t).exp()) } else { 1.0 };
        q_tr * q_rot * q_vib
    }
}

/// Known neutral air species. Molar masses in kg/kmol, formation enthalpies
/// in J/kg, characteristic temperatures in K.
fn species_table(name: &str) -> Option<Species> {
    let s = match name.to_ascii_uppercase().as_str() {
        "N2" => Species {
            name: "N2",
            molar_mass: 28.0134,
            h_formation: 0.0,
            theta_v: 3395.0,
            theta_r: 2.88,
            sigma_rot: 2.0,
            blottner: [0.026_814_2, 0.317_783_8, -11.315_551_3],
        },
        "O2" => Species {
            name: "O2",
            molar_mass: 31.9988,
            h_formation: 0.0,
            theta_v: 2239.0,
            theta_r: 2.08,
            sigma_rot: 2.0,
            blottner: [0.044_929_0, -0.082_615_8, -9.201_947_5],
        },
        "NO" => Species {
            name: "NO",
            molar_mass: 30.0061,
            h_formation: 3.0091e6,
            theta_v: 2817.0,
            theta_r: 2.45,
            sigma_rot: 1.0,
            blottner: [0.043_637_8, -0.033_551_1, -9.576_743_0],
        },
        "N" => Species {
            name: "N",
            molar_mass: 14.0067,
            h_formation: 3.3747e7,
            theta_v: 0.0,
            theta_r: 0.0,
            sigma_rot: 0.0,
            blottner: [0.011_557_2, 0.603_167_9, -12.432_749_5],
        },
        "O" => Species {
            name: "O",
            molar_mass: 15.9994,
            h_formation: 1.5574e7,
            theta_v: 0.0,
            theta_r: 0.0,
            sigma_rot: 0.0,
            blottner: [0.020_314_4, 0.429_440_4, -11.603_140_3],
        },
        _ => return None,
    };
    Some(s)
}

/// A dissociation or exchange reaction among mixture species.
#[derive(Clone, Debug)]
pub struct Reaction {
    /// Reactant species indices (a collision partner `M` is expanded over
    /// all species by the source term).
    pub reactants: Vec<usize>,
    pub products: Vec<usize>,
    /// Third-body reaction: one slot of reactants/products is the partner.
    pub third_body: bool,
    /// Arrhenius pre-exponential [m^3/(kmol s)] basis.
    pub arrhenius_c: Scalar,
    /// Temperature exponent.
    pub arrhenius_eta: Scalar,
    /// Activation temperature [K].
    pub theta_d: Scalar,
}

/// The mixture: species set plus the finite-rate reaction mechanism.
#[derive(Clone, Debug)]
pub struct GasModel {
    pub species: Vec<Species>,
    pub reactions: Vec<Reaction>,
    /// Constant Lewis number for species diffusion.
    pub lewis: Scalar,
}

impl GasModel {
    /// Build a mixture from configured species names. Unknown names are a
    /// configuration error. The reaction mechanism keeps every reaction
    /// whose participants are all present.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> CoreResult<Self> {
        let mut species = Vec::with_capacity(names.len());
        for n in names {
            let s = species_table(n.as_ref())
                .ok_or_else(|| KarmanError::Config(format!("unknown species {:?}", n.as_ref())))?;
            species.push(s);
        }
        let find = |name: &str| species.iter().position(|s| s.name == name);

        let mut reactions = Vec::new();
        // Dissociations: X2 + M <-> products + M.
        for (mol, a, b, c_f, eta, theta) in [
            ("N2", "N", "N", 7.0e18, -1.6, 113_200.0),
            ("O2", "O", "O", 2.0e18, -1.5, 59_500.0),
            ("NO", "N", "O", 5.0e12, 0.0, 75_500.0),
        ] {
            if let (Some(r), Some(p0), Some(p1)) = (find(mol), find(a), find(b)) {
                reactions.push(Reaction {
                    reactants: vec![r],
                    products: vec![p0, p1],
                    third_body: true,
                    arrhenius_c: c_f,
                    arrhenius_eta: eta,
                    theta_d: theta,
                });
            }
        }
        // Exchange reactions.
        for (r0, r1, p0, p1, c_f, eta, theta) in [
            ("N2", "O", "NO", "N", 6.4e14, -1.0, 38_400.0),
            ("NO", "O", "O2", "N", 8.4e9, 0.0, 19_450.0),
        ] {
            if let (Some(a), Some(b), Some(c), Some(d)) = (find(r0), find(r1), find(p0), find(p1)) {
                reactions.push(Reaction {
                    reactants: vec![a, b],
                    products: vec![c, d],
                    third_body: false,
                    arrhenius_c: c_f,
                    arrhenius_eta: eta,
                    theta_d: theta,
                });
            }
        }
        Ok(Self { species, reactions, lewis: 1.4 })
    }

    #[inline]
    #[must_use]
    pub fn n_species(&self) -> usize {
        self.species.len()
    }

    /// Equilibrium constant of `reaction` in molar concentration units,
    /// from the species partition functions and 0 K formation enthalpies.
    #[must_use]
    pub fn equilibrium_constant(&self, r: &Reaction, t: Scalar) -> Scalar {
        let mut ln_kc = 0.0;
        let mut delta_e0 = 0.0; // J/kmol
        for &p in &r.products {
            let s = &self.species[p];
            ln_kc += (s.partition_per_volume(t) / N_AVOGADRO).ln();
            delta_e0 += s.h_formation * s.molar_mass;
        }
        for &q in &r.reactants {
            let s = &self.species[q];
            ln_kc -= (s.partition_per_volume(t) / N_AVOGADRO).ln();
            delta_e0 -= s.h_formation * s.molar_mass;
        }
        (ln_kc - delta_e0 / (R_UNIVERSAL * t)).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_species_air_mechanism() {
        let gas = GasModel::from_names(&["N2", "O2", "NO", "N", "O"]).unwrap();
        assert_eq!(gas.n_species(), 5);
        assert_eq!(gas.reactions.len(), 5);
    }

    #[test]
    fn two_species_air_keeps_no_reactions() {
        let gas = GasModel::from_names(&["N2", "O2"]).unwrap();
        assert!(gas.reactions.is_empty(), "no dissociation partners present");
    }

    #[test]
    fn unknown_species_is_config_error() {
        assert!(GasModel::from_names(&["XE"]).is_err());
    }

    #[test]
    fn vib_energy_monotone_in_tve() {
        let gas = GasModel::from_names(&["N2", "O2"]).unwrap();
        let n2 = &gas.species[0];
        assert!(n2.e_ve(2000.0) > n2.e_ve(500.0));
        assert!(n2.cv_ve(2000.0) > 0.0);
        // Classical limit: e_ve -> R*theta_v near large T.
        assert!(n2.e_ve(1.0e6) / (n2.r_gas() * n2.theta_v) > 0.99);
    }

    #[test]
    fn dissociation_equilibrium_grows_with_t() {
        let gas = GasModel::from_names(&["N2", "O2", "NO", "N", "O"]).unwrap();
        let r = &gas.reactions[0]; // N2 dissociation
        let k4000 = gas.equilibrium_constant(r, 4000.0);
        let k8000 = gas.equilibrium_constant(r, 8000.0);
        assert!(k8000 > k4000, "hotter gas dissociates more");
    }
}
