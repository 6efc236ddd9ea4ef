// crates/karman-state/src/store.rs

//! Flat per-node variable containers.
//!
//! Every field is a structure-of-arrays slab over the point arena (owned
//! first, halos in the tail). Boundary-only fields are indexed through a
//! vertex map; off-boundary reads return 0 and writes are dropped, so
//! whole-domain passes stay safe.

use crate::eos::{self, PrimDerived};
use crate::gas::GasModel;
use crate::indices::VarIndices;
use crate::transport::{self, TransportProps};
use karman_core::{Config, CoreResult, PointId, Scalar};
use karman_mesh::DualMesh;

/// Single-point freestream instance sharing the node-store interface shape.
#[derive(Clone, Debug)]
pub struct FreestreamState {
    pub u: Vec<Scalar>,
    pub v: Vec<Scalar>,
    pub der: PrimDerived,
    pub props: TransportProps,
    /// Freestream velocity magnitude.
    pub vel_mag: Scalar,
}

impl FreestreamState {
    /// Build the freestream state from the configuration: density from the
    /// perfect-gas law at the configured pressure/temperature, velocity from
    /// Mach and the frozen sound speed, direction from AoA/AoS.
    pub fn from_config(cfg: &Config, gas: &GasModel, ix: VarIndices) -> CoreResult<Self> {
        let ns = ix.n_species;
        let mut r_bar = 0.0;
        for s in 0..ns {
            r_bar += cfg.freestream_massfrac[s] * gas.species[s].r_gas();
        }
        let rho = if cfg.freestream_density > 0.0 {
            cfg.freestream_density
        } else {
            cfg.freestream_pressure / (r_bar * cfg.freestream_temperature)
        };
        let rho_s: Vec<Scalar> = (0..ns).map(|s| rho * cfg.freestream_massfrac[s]).collect();

        // Frozen sound speed at the freestream composition.
        let mut cv_bar = 0.0;
        for s in 0..ns {
            cv_bar += cfg.freestream_massfrac[s] * gas.species[s].cv_tr();
        }
        let a = ((1.0 + r_bar / cv_bar) * r_bar * cfg.freestream_temperature).sqrt();
        let vel_mag = cfg.mach * a;
        let aoa = cfg.aoa.to_radians();
        let aos = cfg.aos.to_radians();
        let mut vel = vec![0.0; ix.n_dim];
        if ix.n_dim == 2 {
            vel[0] = vel_mag * aoa.cos();
            vel[1] = vel_mag * aoa.sin();
        } else {
            vel[0] = vel_mag * aoa.cos() * aos.cos();
            vel[1] = vel_mag * aos.sin();
            vel[2] = vel_mag * aoa.sin() * aos.cos();
        }

        let mut u = vec![0.0; ix.n_var()];
        eos::prim2cons(gas, ix, &rho_s, cfg.freestream_temperature, cfg.freestream_temperature_ve, &vel, &mut u);
        let mut v = vec![0.0; ix.n_prim()];
        let mut der = PrimDerived::new(ix);
        let non_phys = eos::cons2prim(gas, ix, &u, &mut v, &mut der);
        if non_phys {
            return Err(karman_core::KarmanError::Config("freestream state is non-physical".into()));
        }
        let mut props = TransportProps::default();
        transport::evaluate(gas, ix, &v, &mut props);
        Ok(Self { u, v, der, props, vel_mag })
    }
}

/// Per-node solver variables.
#[derive(Clone, Debug)]
pub struct NodeVars {
    pub ix: VarIndices,
    pub n_point: usize,
    pub n_point_owned: usize,

    /// Conservative solution, `n_point * n_var`.
    pub solution: Vec<Scalar>,
    /// Previous accepted solution (clip target for non-physical points).
    pub solution_old: Vec<Scalar>,
    /// Time level n and n-1 snapshots for dual time stepping.
    pub solution_time_n: Vec<Scalar>,
    pub solution_time_n1: Vec<Scalar>,
    /// Primitive vector, `n_point * n_prim`.
    pub primitive: Vec<Scalar>,
    /// Gradients of the leading primitives, `n_point * n_prim_grad * n_dim`.
    pub grad_prim: Vec<Scalar>,
    /// Gradients of the conservative vector, `n_point * n_var * n_dim`.
    pub grad_sol: Vec<Scalar>,
    /// Slope limiter per conservative variable.
    pub limiter: Vec<Scalar>,
    /// Per-variable neighborhood extrema used by the limiter.
    pub solution_max: Vec<Scalar>,
    pub solution_min: Vec<Scalar>,
    /// Centered-scheme dissipation sensor and undivided Laplacian.
    pub sensor: Vec<Scalar>,
    pub und_lapl: Vec<Scalar>,

    /// Spectral-radius accumulators and the local time step.
    pub max_lambda_inv: Vec<Scalar>,
    pub max_lambda_visc: Vec<Scalar>,
    pub delta_time: Vec<Scalar>,
    /// Residual truncation error, zeroed on strong-Dirichlet rows.
    pub res_trunc_error: Vec<Scalar>,

    /// EOS derivative pack, flattened per node.
    pub dpdu: Vec<Scalar>,
    pub dtdu: Vec<Scalar>,
    pub dtvedu: Vec<Scalar>,
    pub eve: Vec<Scalar>,
    pub cvve: Vec<Scalar>,

    /// Transport properties.
    pub viscosity: Vec<Scalar>,
    pub k_tr: Vec<Scalar>,
    pub k_ve: Vec<Scalar>,
    pub diffusion: Vec<Scalar>,

    /// Volume sensitivity field for the smoothing post-process,
    /// `n_point * n_dim`.
    pub sensitivity: Vec<Scalar>,

    /// Vertex-index map: `-1` off the boundary, otherwise an index into the
    /// boundary-only slabs below.
    vertex_map: Vec<i64>,
    n_vertex: usize,
    /// Boundary-only surface sensitivity, `n_vertex * n_dim`.
    surf_sensitivity: Vec<Scalar>,
}

impl NodeVars {
    /// Allocate all slabs for `n_point` nodes and build the vertex map.
    #[must_use]
    pub fn new(ix: VarIndices, mesh: &DualMesh) -> Self {
        let n_point = mesh.n_point;
        let nv = ix.n_var();
        let np = ix.n_prim();
        let nd = ix.n_dim;
        let ns = ix.n_species;

        let mut vertex_map = vec![-1_i64; n_point];
        let mut n_vertex = 0usize;
        for m in &mesh.markers {
            for v in &m.vertices {
                if vertex_map[v.point] < 0 {
                    vertex_map[v.point] = n_vertex as i64;
                    n_vertex += 1;
                }
            }
        }

        Self {
            ix,
            n_point,
            n_point_owned: mesh.n_point_owned,
            solution: vec![0.0; n_point * nv],
            solution_old: vec![0.0; n_point * nv],
            solution_time_n: vec![0.0; n_point * nv],
            solution_time_n1: vec![0.0; n_point * nv],
            primitive: vec![0.0; n_point * np],
            grad_prim: vec![0.0; n_point * ix.n_prim_grad() * nd],
            grad_sol: vec![0.0; n_point * nv * nd],
            limiter: vec![1.0; n_point * nv],
            solution_max: vec![0.0; n_point * nv],
            solution_min: vec![0.0; n_point * nv],
            sensor: vec![0.0; n_point],
            und_lapl: vec![0.0; n_point * nv],
            max_lambda_inv: vec![0.0; n_point],
            max_lambda_visc: vec![0.0; n_point],
            delta_time: vec![0.0; n_point],
            res_trunc_error: vec![0.0; n_point * nv],
            dpdu: vec![0.0; n_point * nv],
            dtdu: vec![0.0; n_point * nv],
            dtvedu: vec![0.0; n_point * nv],
            eve: vec![0.0; n_point * ns],
            cvve: vec![0.0; n_point * ns],
            viscosity: vec![0.0; n_point],
            k_tr: vec![0.0; n_point],
            k_ve: vec![0.0; n_point],
            diffusion: vec![0.0; n_point * ns],
            sensitivity: vec![0.0; n_point * nd],
            vertex_map,
            n_vertex,
            surf_sensitivity: vec![0.0; n_vertex * nd],
        }
    }

    /// Fill every node (and the snapshots) from the freestream state.
    pub fn init_from_freestream(&mut self, infty: &FreestreamState) {
        let nv = self.ix.n_var();
        for p in 0..self.n_point {
            self.solution[p * nv..(p + 1) * nv].copy_from_slice(&infty.u);
            self.solution_old[p * nv..(p + 1) * nv].copy_from_slice(&infty.u);
        }
        self.solution_time_n.copy_from_slice(&self.solution);
        self.solution_time_n1.copy_from_slice(&self.solution);
    }

    /* ----- slab accessors ----- */

    #[inline]
    #[must_use]
    pub fn u(&self, p: PointId) -> &[Scalar] {
        let nv = self.ix.n_var();
        &self.solution[p * nv..(p + 1) * nv]
    }

    #[inline]
    pub fn u_mut(&mut self, p: PointId) -> &mut [Scalar] {
        let nv = self.ix.n_var();
        &mut self.solution[p * nv..(p + 1) * nv]
    }

    #[inline]
    #[must_use]
    pub fn v(&self, p: PointId) -> &[Scalar] {
        let np = self.ix.n_prim();
        &self.primitive[p * np..(p + 1) * np]
    }

    #[inline]
    #[must_use]
    pub fn grad_v(&self, p: PointId) -> &[Scalar] {
        let w = self.ix.n_prim_grad() * self.ix.n_dim;
        &self.grad_prim[p * w..(p + 1) * w]
    }

    #[inline]
    #[must_use]
    pub fn grad_u(&self, p: PointId) -> &[Scalar] {
        let w = self.ix.n_var() * self.ix.n_dim;
        &self.grad_sol[p * w..(p + 1) * w]
    }

    #[inline]
    #[must_use]
    pub fn limiter_of(&self, p: PointId) -> &[Scalar] {
        let nv = self.ix.n_var();
        &self.limiter[p * nv..(p + 1) * nv]
    }

    #[inline]
    #[must_use]
    pub fn dpdu_of(&self, p: PointId) -> &[Scalar] {
        let nv = self.ix.n_var();
        &self.dpdu[p * nv..(p + 1) * nv]
    }

    #[inline]
    #[must_use]
    pub fn dtdu_of(&self, p: PointId) -> &[Scalar] {
        let nv = self.ix.n_var();
        &self.dtdu[p * nv..(p + 1) * nv]
    }

    #[inline]
    #[must_use]
    pub fn dtvedu_of(&self, p: PointId) -> &[Scalar] {
        let nv = self.ix.n_var();
        &self.dtvedu[p * nv..(p + 1) * nv]
    }

    #[inline]
    #[must_use]
    pub fn eve_of(&self, p: PointId) -> &[Scalar] {
        let ns = self.ix.n_species;
        &self.eve[p * ns..(p + 1) * ns]
    }

    #[inline]
    #[must_use]
    pub fn cvve_of(&self, p: PointId) -> &[Scalar] {
        let ns = self.ix.n_species;
        &self.cvve[p * ns..(p + 1) * ns]
    }

    #[inline]
    #[must_use]
    pub fn diffusion_of(&self, p: PointId) -> &[Scalar] {
        let ns = self.ix.n_species;
        &self.diffusion[p * ns..(p + 1) * ns]
    }

    /* ----- equation of state ----- */

    /// Recompute the primitive vector of `p` from its conservative state.
    /// Returns `true` when a physical bound is violated; the caller decides
    /// between clipping to the previous snapshot and reverting to freestream.
    pub fn set_prim_var_compressible(&mut self, p: PointId, gas: &GasModel) -> bool {
        let ix = self.ix;
        let nv = ix.n_var();
        let np = ix.n_prim();
        let ns = ix.n_species;
        let mut der = PrimDerived::new(ix);
        let u = &self.solution[p * nv..(p + 1) * nv];
        let v = &mut self.primitive[p * np..(p + 1) * np];
        let non_phys = eos::cons2prim(gas, ix, u, v, &mut der);
        self.dpdu[p * nv..(p + 1) * nv].copy_from_slice(&der.dpdu);
        self.dtdu[p * nv..(p + 1) * nv].copy_from_slice(&der.dtdu);
        self.dtvedu[p * nv..(p + 1) * nv].copy_from_slice(&der.dtvedu);
        self.eve[p * ns..(p + 1) * ns].copy_from_slice(&der.eve);
        self.cvve[p * ns..(p + 1) * ns].copy_from_slice(&der.cvve);
        non_phys
    }

    /// Recompute transport properties of `p` from its primitive state.
    pub fn set_transport(&mut self, p: PointId, gas: &GasModel) {
        let ix = self.ix;
        let np = ix.n_prim();
        let ns = ix.n_species;
        let mut props = TransportProps::default();
        transport::evaluate(gas, ix, &self.primitive[p * np..(p + 1) * np], &mut props);
        self.viscosity[p] = props.viscosity;
        self.k_tr[p] = props.k_tr;
        self.k_ve[p] = props.k_ve;
        self.diffusion[p * ns..(p + 1) * ns].copy_from_slice(&props.diffusion);
    }

    /// Clip the conservative state of `p` back to the previous accepted one.
    pub fn clip_to_old(&mut self, p: PointId) {
        let nv = self.ix.n_var();
        let (dst, src) = (p * nv, (p + 1) * nv);
        let old = self.solution_old[dst..src].to_vec();
        self.solution[dst..src].copy_from_slice(&old);
    }

    /// Overwrite the state of `p` with the freestream fallback.
    pub fn snap_to_freestream(&mut self, p: PointId, infty: &FreestreamState) {
        let nv = self.ix.n_var();
        self.solution[p * nv..(p + 1) * nv].copy_from_slice(&infty.u);
    }

    /// Accept the current solution as the new clip target.
    pub fn commit_solution(&mut self) {
        self.solution_old.copy_from_slice(&self.solution);
    }

    /// Rotate the dual-time snapshots: n -> n-1, current -> n.
    pub fn push_time_levels(&mut self) {
        std::mem::swap(&mut self.solution_time_n, &mut self.solution_time_n1);
        self.solution_time_n.copy_from_slice(&self.solution);
    }

    /* ----- boundary-only storage ----- */

    /// Vertex index of `p`, if it lies on a boundary.
    #[inline]
    #[must_use]
    pub fn vertex_of(&self, p: PointId) -> Option<usize> {
        let v = self.vertex_map[p];
        (v >= 0).then_some(v as usize)
    }

    /// Surface sensitivity component of `p`; 0 off the boundary.
    #[inline]
    #[must_use]
    pub fn surf_sensitivity(&self, p: PointId, d: usize) -> Scalar {
        match self.vertex_of(p) {
            Some(v) => self.surf_sensitivity[v * self.ix.n_dim + d],
            None => 0.0,
        }
    }

    /// Write a surface sensitivity component; no-op off the boundary.
    pub fn set_surf_sensitivity(&mut self, p: PointId, d: usize, val: Scalar) {
        if let Some(v) = self.vertex_of(p) {
            self.surf_sensitivity[v * self.ix.n_dim + d] = val;
        }
    }

    /// Number of distinct boundary vertices.
    #[inline]
    #[must_use]
    pub fn n_vertex(&self) -> usize {
        self.n_vertex
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karman_mesh::MeshBuilder;

    fn small_setup() -> (GasModel, VarIndices, DualMesh) {
        let gas = GasModel::from_names(&["N2", "O2"]).unwrap();
        let ix = VarIndices::new(2, 2);
        let mesh = MeshBuilder::rect_2d(3, 3, 1.0, 1.0).build().unwrap();
        (gas, ix, mesh)
    }

    #[test]
    fn freestream_init_and_eos_pass() {
        let (gas, ix, mesh) = small_setup();
        let cfg = Config::default();
        let infty = FreestreamState::from_config(&cfg, &gas, ix).unwrap();
        assert!(infty.vel_mag > 0.0);

        let mut nodes = NodeVars::new(ix, &mesh);
        nodes.init_from_freestream(&infty);
        for p in 0..nodes.n_point_owned {
            assert!(!nodes.set_prim_var_compressible(p, &gas));
            assert!(nodes.v(p)[ix.p()] > 0.0);
        }
    }

    #[test]
    fn boundary_only_storage_is_noop_off_boundary() {
        let (gas, ix, mesh) = small_setup();
        let _ = gas;
        let mut nodes = NodeVars::new(ix, &mesh);
        // The 3x3 rect has exactly one interior point (index 1,1) -> global 4.
        let interior: Vec<usize> = (0..mesh.n_point).filter(|&p| nodes.vertex_of(p).is_none()).collect();
        assert_eq!(interior.len(), 4, "3x3 quads leave a 2x2 interior block");
        let p_in = interior[0];
        nodes.set_surf_sensitivity(p_in, 0, 3.0);
        assert_eq!(nodes.surf_sensitivity(p_in, 0), 0.0);

        let p_bnd = (0..mesh.n_point).find(|&p| nodes.vertex_of(p).is_some()).unwrap();
        nodes.set_surf_sensitivity(p_bnd, 1, 2.5);
        assert_eq!(nodes.surf_sensitivity(p_bnd, 1), 2.5);
    }

    #[test]
    fn clip_and_snapshots() {
        let (gas, ix, mesh) = small_setup();
        let cfg = Config::default();
        let infty = FreestreamState::from_config(&cfg, &gas, ix).unwrap();
        let mut nodes = NodeVars::new(ix, &mesh);
        nodes.init_from_freestream(&infty);
        let before = nodes.u(0).to_vec();
        nodes.u_mut(0)[0] = -1.0;
        nodes.clip_to_old(0);
        assert_eq!(nodes.u(0), &before[..]);

        nodes.u_mut(0)[0] = 42.0;
        nodes.push_time_levels();
        assert_eq!(nodes.solution_time_n[0], 42.0);
        assert_eq!(nodes.solution_time_n1[0], before[0]);
    }
}
