// crates/karman-numerics/src/muscl.rs

//! MUSCL reconstruction on the conservative vector.
//!
//! The edge interface states are
//! `U_i* = U_i + lim_ij (grad U_i . v~)`, `U_j* = U_j - lim_ij (grad U_j . v~)`
//! with `v~ = 0.5 (x_j - x_i)` and `lim_ij` the minimum limiter component of
//! both sides. Each reconstructed side is pushed through the equation of
//! state; if either side comes back non-physical, both sides revert to the
//! unreconstructed node states.

use karman_core::Scalar;
use karman_state::{cons2prim, GasModel, PrimDerived, VarIndices};

/// Scratch buffers and result of one edge reconstruction.
#[derive(Clone, Debug)]
pub struct EdgeRecon {
    pub ix: VarIndices,
    pub u_i: Vec<Scalar>,
    pub u_j: Vec<Scalar>,
    pub v_i: Vec<Scalar>,
    pub v_j: Vec<Scalar>,
    pub der_i: PrimDerived,
    pub der_j: PrimDerived,
}

impl EdgeRecon {
    #[must_use]
    pub fn new(ix: VarIndices) -> Self {
        Self {
            ix,
            u_i: vec![0.0; ix.n_var()],
            u_j: vec![0.0; ix.n_var()],
            v_i: vec![0.0; ix.n_prim()],
            v_j: vec![0.0; ix.n_prim()],
            der_i: PrimDerived::new(ix),
            der_j: PrimDerived::new(ix),
        }
    }

    /// Reconstruct the interface states of edge (i, j).
    ///
    /// Returns `true` when the kernel must use the first-order node states
    /// (either reconstructed side failed the physical bounds). On `false`
    /// the scratch buffers hold the reconstructed states and their re-derived
    /// primitives.
    #[allow(clippy::too_many_arguments)]
    pub fn reconstruct(
        &mut self,
        gas: &GasModel,
        u_i: &[Scalar],
        u_j: &[Scalar],
        grad_u_i: &[Scalar],
        grad_u_j: &[Scalar],
        limiters: Option<(&[Scalar], &[Scalar])>,
        coord_i: &[Scalar],
        coord_j: &[Scalar],
    ) -> bool {
        let ix = self.ix;
        let nv = ix.n_var();
        let nd = ix.n_dim;

        // Shared limiter floor: the minimum component over both sides.
        let lim_ij = match limiters {
            Some((li, lj)) => {
                let mut lim = 1.0_f64;
                for k in 0..nv {
                    lim = lim.min(li[k]).min(lj[k]);
                }
                lim
            }
            None => 1.0,
        };

        for k in 0..nv {
            let mut proj_i = 0.0;
            let mut proj_j = 0.0;
            for d in 0..nd {
                let half = 0.5 * (coord_j[d] - coord_i[d]);
                proj_i += half * grad_u_i[k * nd + d];
                proj_j += half * grad_u_j[k * nd + d];
            }
            self.u_i[k] = u_i[k] + lim_ij * proj_i;
            self.u_j[k] = u_j[k] - lim_ij * proj_j;
        }

        let bad_i = cons2prim(gas, ix, &self.u_i, &mut self.v_i, &mut self.der_i);
        let bad_j = cons2prim(gas, ix, &self.u_j, &mut self.v_j, &mut self.der_j);
        bad_i || bad_j
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karman_state::prim2cons;

    fn setup() -> (GasModel, VarIndices, Vec<Scalar>) {
        let gas = GasModel::from_names(&["N2", "O2"]).unwrap();
        let ix = VarIndices::new(2, 2);
        let mut u = vec![0.0; ix.n_var()];
        prim2cons(&gas, ix, &[0.9, 0.3], 400.0, 400.0, &[100.0, 0.0], &mut u);
        (gas, ix, u)
    }

    #[test]
    fn smooth_gradient_reconstructs_second_order() {
        let (gas, ix, u) = setup();
        let nv = ix.n_var();
        let nd = ix.n_dim;
        // Small linear variation in x for the first species only.
        let mut grad = vec![0.0; nv * nd];
        grad[0] = 0.02;

        let mut recon = EdgeRecon::new(ix);
        let first_order = recon.reconstruct(&gas, &u, &u, &grad, &grad, None, &[0.0, 0.0], &[1.0, 0.0]);
        assert!(!first_order);
        assert!((recon.u_i[0] - (u[0] + 0.01)).abs() < 1e-14);
        assert!((recon.u_j[0] - (u[0] - 0.01)).abs() < 1e-14);
    }

    /// A gradient steep enough to drive rho_1 negative on side i must force
    /// the first-order fallback for BOTH sides.
    #[test]
    fn non_physical_reconstruction_reverts_to_first_order() {
        let (gas, ix, u) = setup();
        let nv = ix.n_var();
        let nd = ix.n_dim;
        let mut grad_i = vec![0.0; nv * nd];
        grad_i[0] = -4.0 * u[0]; // U_i* = U_i - 2 rho_1 < 0
        let grad_j = vec![0.0; nv * nd];

        let mut recon = EdgeRecon::new(ix);
        let first_order = recon.reconstruct(&gas, &u, &u, &grad_i, &grad_j, None, &[0.0, 0.0], &[1.0, 0.0]);
        assert!(first_order, "kernel must receive the unreconstructed states");
    }

    #[test]
    fn limiter_floor_applies_to_both_sides() {
        let (gas, ix, u) = setup();
        let nv = ix.n_var();
        let nd = ix.n_dim;
        let mut grad = vec![0.0; nv * nd];
        grad[0] = 0.02;
        let lim_i = vec![1.0; nv];
        let mut lim_j = vec![1.0; nv];
        lim_j[3] = 0.25; // the shared floor is the min over all components

        let mut recon = EdgeRecon::new(ix);
        let first_order = recon.reconstruct(
            &gas,
            &u,
            &u,
            &grad,
            &grad,
            Some((&lim_i, &lim_j)),
            &[0.0, 0.0],
            &[1.0, 0.0],
        );
        assert!(!first_order);
        assert!((recon.u_i[0] - (u[0] + 0.25 * 0.01)).abs() < 1e-14);
    }
}
