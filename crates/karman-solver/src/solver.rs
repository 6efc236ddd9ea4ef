// crates/karman-solver/src/solver.rs

//! The flow solver: owns the variable store, the block-sparse system, and
//! the per-iteration pipeline.

use crate::bc::{self, BcContext, BcScratch};
use crate::gradients;
use crate::monitor::{self, IterationReport};
use karman_core::{
    allreduce_count, allreduce_scalar, restart, start_exchange, CenteredKind, Communicator, Config,
    ConvScheme, CoreResult, FieldLayout, GradientKind, KernelStatus, KrylovKind, PrecKind,
    ReduceOp, Scalar, SlopeLimit, TimeIntKind, TimeMarching, UpwindKind,
};
use karman_linsys::{BlockMatrix, JacobiPrec, KrylovMethod, LineletPrec, LinearSolver, LuSgsPrec};
use karman_mesh::DualMesh;
use karman_numerics::{
    limiters, sources::SourceKind, spectral_radius_inv, spectral_radius_visc, AusmKernel,
    CenteredKernel, ConvKernel, EdgeRecon, EdgeState, HllcKernel, KernelOutput, RoeKernel,
    SourceCounters, SourceTerms, ViscousKernel,
};
use karman_state::{FreestreamState, GasModel, NodeVars, VarIndices};
use rayon::prelude::*;
use std::path::Path;
use tracing::{info, warn};

/// Exchange tag for the conservative solution.
const TAG_SOLUTION: u64 = 1;

/// Low-storage Runge-Kutta stage coefficients.
fn rk_alphas(n_stages: usize) -> &'static [Scalar] {
    match n_stages {
        1 => &[1.0],
        4 => &[0.25, 1.0 / 3.0, 0.5, 1.0],
        _ => &[0.5, 0.5, 1.0],
    }
}

/// The convective kernel active this iteration; resolved once, outside the
/// edge loop.
enum ActiveKernel {
    Roe(RoeKernel),
    Ausm(AusmKernel),
    Hllc(HllcKernel),
    Centered(CenteredKernel),
}

impl ConvKernel for ActiveKernel {
    fn compute(&self, st: &EdgeState<'_>, out: &mut KernelOutput) {
        match self {
            Self::Roe(k) => k.compute(st, out),
            Self::Ausm(k) => k.compute(st, out),
            Self::Hllc(k) => k.compute(st, out),
            Self::Centered(k) => k.compute(st, out),
        }
    }
}

/// Per-iteration event counters.
#[derive(Clone, Copy, Debug, Default)]
struct IterCounters {
    non_physical: u64,
    non_physical_reconstr: u64,
    bc_skipped: u64,
    sources: SourceCounters,
    lin_iters: usize,
}

/// Orchestrator for one mesh zone.
pub struct FlowSolver<'a> {
    pub cfg: &'a Config,
    pub gas: GasModel,
    pub ix: VarIndices,
    pub mesh: &'a DualMesh,
    pub comm: &'a dyn Communicator,
    pub nodes: NodeVars,
    pub infty: FreestreamState,
    pub jacobian: BlockMatrix,
    pub lin_res: Vec<Scalar>,
    pub lin_sol: Vec<Scalar>,
    iter: u64,
    physical_time: Scalar,
}

impl<'a> FlowSolver<'a> {
    pub fn new(cfg: &'a Config, mesh: &'a DualMesh, comm: &'a dyn Communicator) -> CoreResult<Self> {
        let gas = GasModel::from_names(&cfg.gas_species)?;
        let ix = VarIndices::new(gas.n_species(), mesh.n_dim);
        let infty = FreestreamState::from_config(cfg, &gas, ix)?;

        let mut nodes = NodeVars::new(ix, mesh);
        nodes.init_from_freestream(&infty);

        let edges: Vec<[usize; 2]> = mesh.edges.iter().map(|e| e.nodes).collect();
        let jacobian = BlockMatrix::from_edges(mesh.n_point, mesh.n_point_owned, ix.n_var(), &edges);
        let n_scalar = mesh.n_point * ix.n_var();

        let mut solver = Self {
            cfg,
            gas,
            ix,
            mesh,
            comm,
            nodes,
            infty,
            jacobian,
            lin_res: vec![0.0; n_scalar],
            lin_sol: vec![0.0; n_scalar],
            iter: 0,
            physical_time: 0.0,
        };
        // Consistent primitives everywhere before the first iteration.
        for p in 0..solver.mesh.n_point {
            let _ = solver.nodes.set_prim_var_compressible(p, &solver.gas);
            if solver.cfg.viscous {
                solver.nodes.set_transport(p, &solver.gas);
            }
        }
        Ok(solver)
    }

    #[inline]
    #[must_use]
    pub fn iteration(&self) -> u64 {
        self.iter
    }

    #[inline]
    #[must_use]
    pub fn physical_time(&self) -> Scalar {
        self.physical_time
    }

    fn active_kernel(&self) -> ActiveKernel {
        match self.cfg.conv_scheme {
            ConvScheme::Upwind => match self.cfg.upwind_kind {
                UpwindKind::Roe => ActiveKernel::Roe(RoeKernel),
                UpwindKind::Ausm => ActiveKernel::Ausm(AusmKernel),
                UpwindKind::Hllc => ActiveKernel::Hllc(HllcKernel),
            },
            ConvScheme::Centered => match self.cfg.centered_kind {
                CenteredKind::Jst => {
                    ActiveKernel::Centered(CenteredKernel::jst(self.cfg.jst_kappa2, self.cfg.jst_kappa4))
                }
                CenteredKind::Lax => ActiveKernel::Centered(CenteredKernel {
                    jst: false,
                    kappa2: self.cfg.jst_kappa2,
                    kappa4: 0.0,
                }),
            },
        }
    }

    /* ------------------------------ passes --------------------------------- */

    /// Recompute primitives on every owned point; non-physical points clip
    /// back to the previous accepted state (first resort) and are counted.
    fn eos_pass(&mut self) -> u64 {
        let mut non_phys = 0;
        for p in 0..self.mesh.n_point_owned {
            if self.nodes.set_prim_var_compressible(p, &self.gas) {
                non_phys += 1;
                self.nodes.clip_to_old(p);
                if self.nodes.set_prim_var_compressible(p, &self.gas) {
                    // The snapshot is unusable too: fall back to freestream.
                    let infty = self.infty.clone();
                    self.nodes.snap_to_freestream(p, &infty);
                    let _ = self.nodes.set_prim_var_compressible(p, &self.gas);
                }
            }
            if self.cfg.viscous {
                self.nodes.set_transport(p, &self.gas);
            }
            // Zero this point's residual rows for the new assembly.
            let nv = self.ix.n_var();
            self.lin_res[p * nv..(p + 1) * nv].fill(0.0);
        }
        non_phys
    }

    /// Halo exchange of the conservative solution (single suspension point),
    /// then local primitive recovery on the halo tail.
    fn exchange_solution(&mut self) -> CoreResult<()> {
        let nv = self.ix.n_var();
        let layout = FieldLayout::with_vector(nv, self.ix.u_mom().start, self.ix.n_dim);
        let handle = start_exchange(self.comm, &self.mesh.plan, layout, &self.nodes.solution, TAG_SOLUTION)?;
        handle.wait(self.comm, &mut self.nodes.solution)?;
        for slot in &self.mesh.plan.entities_recv {
            for &h in slot {
                let _ = self.nodes.set_prim_var_compressible(h, &self.gas);
                if self.cfg.viscous {
                    self.nodes.set_transport(h, &self.gas);
                }
            }
        }
        Ok(())
    }

    /// Gradients, limiters, and centered-scheme sensors, in the fixed order.
    fn preprocessing(&mut self) {
        let muscl = self.cfg.muscl && self.cfg.conv_scheme == ConvScheme::Upwind;
        if muscl || self.cfg.viscous {
            match self.cfg.gradient_kind {
                GradientKind::GreenGauss => gradients::green_gauss(self.mesh, &mut self.nodes),
                GradientKind::Wls => gradients::weighted_least_squares(self.mesh, &mut self.nodes),
            }
        }
        if muscl && !matches!(self.cfg.slope_limit, SlopeLimit::None | SlopeLimit::VanAlbada) {
            gradients::compute_limiters(self.mesh, &mut self.nodes, self.cfg);
        }
        if self.cfg.conv_scheme == ConvScheme::Centered {
            gradients::compute_sensors(self.mesh, &mut self.nodes);
        }
    }

    /// Spectral-radius accumulation and the local time step; time-accurate
    /// marching broadcasts the global minimum.
    fn compute_time_step(&mut self) -> CoreResult<(Scalar, Scalar)> {
        let ix = self.ix;
        let nodes = &mut self.nodes;
        nodes.max_lambda_inv.fill(0.0);
        nodes.max_lambda_visc.fill(0.0);

        for e in &self.mesh.edges {
            let [i, j] = e.nodes;
            let lam = spectral_radius_inv(ix, nodes.v(i), nodes.v(j), &e.normal);
            if self.mesh.is_owned(i) {
                nodes.max_lambda_inv[i] += lam;
            }
            if self.mesh.is_owned(j) {
                nodes.max_lambda_inv[j] += lam;
            }
            if self.cfg.viscous {
                let mu = 0.5 * (nodes.viscosity[i] + nodes.viscosity[j]);
                let ktr = 0.5 * (nodes.k_tr[i] + nodes.k_tr[j]);
                let kve = 0.5 * (nodes.k_ve[i] + nodes.k_ve[j]);
                let lam_v = spectral_radius_visc(ix, nodes.v(i), nodes.v(j), mu, ktr, kve, &e.normal);
                if self.mesh.is_owned(i) {
                    nodes.max_lambda_visc[i] += lam_v;
                }
                if self.mesh.is_owned(j) {
                    nodes.max_lambda_visc[j] += lam_v;
                }
            }
        }
        for m in &self.mesh.markers {
            for v in &m.vertices {
                let p = v.point;
                let lam = spectral_radius_inv(ix, nodes.v(p), nodes.v(p), &v.normal);
                nodes.max_lambda_inv[p] += lam;
            }
        }

        let mut min_dt = Scalar::MAX;
        let mut max_dt: Scalar = 0.0;
        for p in 0..self.mesh.n_point_owned {
            let vol = self.mesh.volume[p];
            let mut dt = if nodes.max_lambda_inv[p] > 0.0 {
                self.cfg.cfl * vol / nodes.max_lambda_inv[p]
            } else {
                0.0
            };
            if self.cfg.viscous && nodes.max_lambda_visc[p] > 0.0 {
                let dt_visc = self.cfg.cfl * 0.25 * vol * vol / nodes.max_lambda_visc[p];
                dt = if dt > 0.0 { dt.min(dt_visc) } else { dt_visc };
            }
            if dt > 0.0 {
                min_dt = min_dt.min(dt);
                max_dt = max_dt.max(dt);
                dt = dt.min(self.cfg.max_delta_time);
            }
            nodes.delta_time[p] = dt;
        }
        min_dt = allreduce_scalar(self.comm, ReduceOp::Min, min_dt)?;
        max_dt = allreduce_scalar(self.comm, ReduceOp::Max, max_dt)?;

        if self.cfg.time_marching == TimeMarching::TimeStepping {
            // Time-accurate mode: every point advances by the global minimum.
            for p in 0..self.mesh.n_point_owned {
                nodes.delta_time[p] = min_dt;
            }
        }
        Ok((min_dt, max_dt))
    }

    /// Interior convective + viscous + source loops, dual-time terms, then
    /// the boundary conditions.
    #[allow(clippy::too_many_lines)]
    fn assemble_residual(&mut self, counters: &mut IterCounters) -> CoreResult<()> {
        let ix = self.ix;
        let nv = ix.n_var();
        let nd = ix.n_dim;
        let implicit = self.cfg.time_int == TimeIntKind::EulerImplicit;
        let muscl = self.cfg.muscl && self.cfg.conv_scheme == ConvScheme::Upwind;
        let use_limiter = !matches!(self.cfg.slope_limit, SlopeLimit::None);
        let kernel = self.active_kernel();

        self.jacobian.clear();
        for v in self.lin_res.iter_mut() {
            *v = 0.0;
        }

        let mesh = self.mesh;
        let nodes = &self.nodes;
        let gas = &self.gas;
        let lin_res = &mut self.lin_res;
        let jac = &mut self.jacobian;

        let mut out = KernelOutput::new(nv);
        let mut recon = EdgeRecon::new(ix);
        let mut va_lim_i = vec![1.0; nv];
        let mut va_lim_j = vec![1.0; nv];

        /* ---- convective edge loop ---- */
        for e in &mesh.edges {
            let [i, j] = e.nodes;
            let coord_i = mesh.coord(i);
            let coord_j = mesh.coord(j);

            let mut first_order = true;
            if muscl {
                let lim = if use_limiter {
                    if self.cfg.slope_limit == SlopeLimit::VanAlbada {
                        // Edge-form van Albada from the projected slopes.
                        for k in 0..nv {
                            let mut proj_i = 0.0;
                            let mut proj_j = 0.0;
                            for d in 0..nd {
                                let half = 0.5 * (coord_j[d] - coord_i[d]);
                                proj_i += half * nodes.grad_u(i)[k * nd + d];
                                proj_j += half * nodes.grad_u(j)[k * nd + d];
                            }
                            let du = 0.5 * (nodes.u(j)[k] - nodes.u(i)[k]);
                            va_lim_i[k] = limiters::van_albada(du, proj_i);
                            va_lim_j[k] = limiters::van_albada(du, proj_j);
                        }
                        Some((va_lim_i.as_slice(), va_lim_j.as_slice()))
                    } else {
                        Some((nodes.limiter_of(i), nodes.limiter_of(j)))
                    }
                } else {
                    None
                };
                let failed = recon.reconstruct(
                    gas,
                    nodes.u(i),
                    nodes.u(j),
                    nodes.grad_u(i),
                    nodes.grad_u(j),
                    lim,
                    coord_i,
                    coord_j,
                );
                if failed {
                    counters.non_physical_reconstr += 1;
                } else {
                    first_order = false;
                }
            }

            let st = if first_order {
                EdgeState {
                    ix,
                    normal: &e.normal,
                    u_i: nodes.u(i),
                    u_j: nodes.u(j),
                    v_i: nodes.v(i),
                    v_j: nodes.v(j),
                    dpdu_i: nodes.dpdu_of(i),
                    dpdu_j: nodes.dpdu_of(j),
                    dtdu_i: nodes.dtdu_of(i),
                    dtdu_j: nodes.dtdu_of(j),
                    dtvedu_i: nodes.dtvedu_of(i),
                    dtvedu_j: nodes.dtvedu_of(j),
                    eve_i: nodes.eve_of(i),
                    eve_j: nodes.eve_of(j),
                    cvve_i: nodes.cvve_of(i),
                    cvve_j: nodes.cvve_of(j),
                    grad_i: Some(nodes.grad_v(i)),
                    grad_j: Some(nodes.grad_v(j)),
                    und_lapl_i: Some(&nodes.und_lapl[i * nv..(i + 1) * nv]),
                    und_lapl_j: Some(&nodes.und_lapl[j * nv..(j + 1) * nv]),
                    sensor_i: nodes.sensor[i],
                    sensor_j: nodes.sensor[j],
                    lambda_i: nodes.max_lambda_inv[i],
                    lambda_j: nodes.max_lambda_inv[j],
                    mu_i: nodes.viscosity[i],
                    mu_j: nodes.viscosity[j],
                    ktr_i: nodes.k_tr[i],
                    ktr_j: nodes.k_tr[j],
                    kve_i: nodes.k_ve[i],
                    kve_j: nodes.k_ve[j],
                    diff_i: Some(nodes.diffusion_of(i)),
                    diff_j: Some(nodes.diffusion_of(j)),
                    coord_i,
                    coord_j,
                }
            } else {
                EdgeState {
                    ix,
                    normal: &e.normal,
                    u_i: &recon.u_i,
                    u_j: &recon.u_j,
                    v_i: &recon.v_i,
                    v_j: &recon.v_j,
                    dpdu_i: &recon.der_i.dpdu,
                    dpdu_j: &recon.der_j.dpdu,
                    dtdu_i: &recon.der_i.dtdu,
                    dtdu_j: &recon.der_j.dtdu,
                    dtvedu_i: &recon.der_i.dtvedu,
                    dtvedu_j: &recon.der_j.dtvedu,
                    eve_i: &recon.der_i.eve,
                    eve_j: &recon.der_j.eve,
                    cvve_i: &recon.der_i.cvve,
                    cvve_j: &recon.der_j.cvve,
                    grad_i: Some(nodes.grad_v(i)),
                    grad_j: Some(nodes.grad_v(j)),
                    und_lapl_i: None,
                    und_lapl_j: None,
                    sensor_i: nodes.sensor[i],
                    sensor_j: nodes.sensor[j],
                    lambda_i: nodes.max_lambda_inv[i],
                    lambda_j: nodes.max_lambda_inv[j],
                    mu_i: nodes.viscosity[i],
                    mu_j: nodes.viscosity[j],
                    ktr_i: nodes.k_tr[i],
                    ktr_j: nodes.k_tr[j],
                    kve_i: nodes.k_ve[i],
                    kve_j: nodes.k_ve[j],
                    diff_i: Some(nodes.diffusion_of(i)),
                    diff_j: Some(nodes.diffusion_of(j)),
                    coord_i,
                    coord_j,
                }
            };

            kernel.compute(&st, &mut out);
            out.guard_nan(implicit);
            if out.status != KernelStatus::Ok {
                continue;
            }
            if mesh.is_owned(i) {
                for k in 0..nv {
                    lin_res[i * nv + k] += out.res[k];
                }
            }
            if mesh.is_owned(j) {
                for k in 0..nv {
                    lin_res[j * nv + k] -= out.res[k];
                }
            }
            if implicit {
                jac.add_block(i, i, &out.jac_i);
                jac.add_block(i, j, &out.jac_j);
                jac.subtract_block(j, i, &out.jac_i);
                jac.subtract_block(j, j, &out.jac_j);
            }

            /* ---- viscous flux on the same edge ---- */
            if self.cfg.viscous {
                let visc = ViscousKernel::new(gas);
                visc.compute(&st, &mut out);
                out.guard_nan(implicit);
                if out.status != KernelStatus::Ok {
                    continue;
                }
                if mesh.is_owned(i) {
                    for k in 0..nv {
                        lin_res[i * nv + k] -= out.res[k];
                    }
                }
                if mesh.is_owned(j) {
                    for k in 0..nv {
                        lin_res[j * nv + k] += out.res[k];
                    }
                }
                if implicit {
                    jac.subtract_block(i, i, &out.jac_i);
                    jac.subtract_block(i, j, &out.jac_j);
                    jac.add_block(j, i, &out.jac_i);
                    jac.add_block(j, j, &out.jac_j);
                }
            }
        }

        /* ---- source loop: axisymmetric -> chemistry -> vib relaxation ---- */
        let mut terms = SourceTerms::new(ix);
        let mut enabled: Vec<(SourceKind, fn(&mut SourceCounters))> = Vec::new();
        if self.cfg.axisymmetric {
            enabled.push((SourceKind::Axisymmetric, |c| c.e_axi += 1));
        }
        if self.cfg.chemistry {
            enabled.push((SourceKind::Chemistry, |c| c.e_chm += 1));
        }
        if self.cfg.vib_relaxation {
            enabled.push((SourceKind::VibRelaxation, |c| c.e_vib += 1));
        }
        if !enabled.is_empty() {
            for p in 0..mesh.n_point_owned {
                let vol = mesh.volume[p];
                let y = mesh.coord(p).get(1).copied().unwrap_or(1.0);
                for (kind, bump) in &enabled {
                    let der = karman_state::PrimDerived {
                        dpdu: nodes.dpdu_of(p).to_vec(),
                        dtdu: nodes.dtdu_of(p).to_vec(),
                        dtvedu: nodes.dtvedu_of(p).to_vec(),
                        eve: nodes.eve_of(p).to_vec(),
                        cvve: nodes.cvve_of(p).to_vec(),
                    };
                    terms.compute(*kind, gas, nodes.u(p), nodes.v(p), &der, vol, y, &mut out);
                    out.guard_nan(implicit);
                    if out.status != KernelStatus::Ok {
                        bump(&mut counters.sources);
                        continue;
                    }
                    for k in 0..nv {
                        lin_res[p * nv + k] -= out.res[k];
                    }
                    if implicit {
                        jac.subtract_block(p, p, &out.jac_i);
                    }
                }
            }
        }

        /* ---- dual-time contribution ---- */
        match self.cfg.time_marching {
            TimeMarching::Dt1st => {
                let dt = self.cfg.time_step;
                for p in 0..mesh.n_point_owned {
                    let c = mesh.volume[p] / dt;
                    for k in 0..nv {
                        lin_res[p * nv + k] +=
                            c * (nodes.solution[p * nv + k] - nodes.solution_time_n[p * nv + k]);
                    }
                    if implicit {
                        jac.add_val_to_diag(p, c);
                    }
                }
            }
            TimeMarching::Dt2nd => {
                let dt = self.cfg.time_step;
                for p in 0..mesh.n_point_owned {
                    let c = mesh.volume[p] / dt;
                    for k in 0..nv {
                        let u = nodes.solution[p * nv + k];
                        let un = nodes.solution_time_n[p * nv + k];
                        let un1 = nodes.solution_time_n1[p * nv + k];
                        lin_res[p * nv + k] += c * (1.5 * u - 2.0 * un + 0.5 * un1);
                    }
                    if implicit {
                        jac.add_val_to_diag(p, 1.5 * c);
                    }
                }
            }
            _ => {}
        }

        /* ---- boundary conditions, after every interior loop ---- */
        let ctx = BcContext {
            cfg: self.cfg,
            gas,
            mesh,
            infty: &self.infty,
            implicit,
            viscous: self.cfg.viscous,
        };
        let mut scratch = BcScratch::new(ix);
        counters.bc_skipped += bc::apply_all(&ctx, &mut self.nodes, lin_res, jac, &kernel, &mut scratch)?;
        Ok(())
    }

    /// `U <- U_old - alpha dt/Vol (R + trunc)` over owned points, fanned out
    /// across the worker threads (each point's row is private to its task).
    fn explicit_update(&mut self, alpha: Scalar) {
        let nv = self.ix.n_var();
        let n_owned = self.mesh.n_point_owned;
        let vols = &self.mesh.volume;
        let dts = &self.nodes.delta_time;
        let old = &self.nodes.solution_old;
        let trunc = &self.nodes.res_trunc_error;
        let res = &self.lin_res;
        self.nodes.solution[..n_owned * nv]
            .par_chunks_mut(nv)
            .enumerate()
            .for_each(|(p, u)| {
                let f = alpha * dts[p] / vols[p].max(Scalar::MIN_POSITIVE);
                for k in 0..nv {
                    u[k] = old[p * nv + k] - f * (res[p * nv + k] + trunc[p * nv + k]);
                }
            });
    }

    /// Build and solve `(V/dt + J) dx = -(R + trunc)`, then relax the update.
    fn implicit_update(&mut self) -> usize {
        let nv = self.ix.n_var();
        let n_owned = self.mesh.n_point_owned;

        for p in 0..n_owned {
            let dt = self.nodes.delta_time[p];
            if dt > 0.0 {
                self.jacobian.add_val_to_diag(p, self.mesh.volume[p] / dt);
            } else {
                self.jacobian.set_val_to_diag(p, 1.0);
                for k in 0..nv {
                    self.lin_res[p * nv + k] = 0.0;
                    self.nodes.res_trunc_error[p * nv + k] = 0.0;
                }
            }
            for k in 0..nv {
                let idx = p * nv + k;
                self.lin_res[idx] = -(self.lin_res[idx] + self.nodes.res_trunc_error[idx]);
                self.lin_sol[idx] = 0.0;
            }
        }
        // Ghost rows: zero right-hand side, identity diagonal.
        for p in n_owned..self.mesh.n_point {
            self.jacobian.set_val_to_diag(p, 1.0);
            for k in 0..nv {
                self.lin_res[p * nv + k] = 0.0;
                self.lin_sol[p * nv + k] = 0.0;
            }
        }

        let solver = LinearSolver {
            method: match self.cfg.krylov_kind {
                KrylovKind::Richardson => KrylovMethod::Richardson,
                KrylovKind::Gmres => KrylovMethod::Gmres,
                KrylovKind::Bicgstab => KrylovMethod::Bicgstab,
            },
            max_iters: self.cfg.linear_solver_iters,
            tol: self.cfg.linear_solver_tol,
            restart: self.cfg.gmres_restart,
        };
        let iters = match self.cfg.prec_kind {
            PrecKind::Jacobi => {
                let prec = JacobiPrec::build(&self.jacobian);
                solver.solve(&self.jacobian, &self.lin_res, &mut self.lin_sol, &prec)
            }
            PrecKind::LuSgs => {
                let prec = LuSgsPrec::build(&self.jacobian);
                solver.solve(&self.jacobian, &self.lin_res, &mut self.lin_sol, &prec)
            }
            PrecKind::Linelet => {
                let seeds: Vec<usize> = self
                    .mesh
                    .markers
                    .iter()
                    .flat_map(|m| m.vertices.iter().map(|v| v.point))
                    .collect();
                let mesh = self.mesh;
                let (prec, avg_len) = LineletPrec::build(&self.jacobian, &seeds, |i, j| {
                    1.0 / mesh.distance(i, j).max(Scalar::MIN_POSITIVE)
                });
                info!(avg_line_length = avg_len, "linelet preconditioner");
                solver.solve(&self.jacobian, &self.lin_res, &mut self.lin_sol, &prec)
            }
        };

        let omega = self.cfg.relaxation_factor_flow;
        for p in 0..n_owned {
            for k in 0..nv {
                self.nodes.solution[p * nv + k] += omega * self.lin_sol[p * nv + k];
            }
        }
        iters
    }

    /* ----------------------------- iteration -------------------------------- */

    /// One outer iteration of the fixed pipeline. Returns the monitor
    /// report; recoverable numerical trouble is counted, never fatal.
    pub fn iterate(&mut self) -> CoreResult<IterationReport> {
        self.iter += 1;
        let mut counters = IterCounters::default();

        self.nodes.commit_solution();

        let stages: &[Scalar] = match self.cfg.time_int {
            TimeIntKind::EulerExplicit => &[1.0],
            TimeIntKind::Rk => rk_alphas(self.cfg.n_rk_stages),
            TimeIntKind::EulerImplicit => &[1.0],
        };

        let mut min_dt = 0.0;
        let mut max_dt = 0.0;
        for (stage, &alpha) in stages.iter().enumerate() {
            counters.non_physical += self.eos_pass();
            self.exchange_solution()?;
            self.preprocessing();
            if stage == 0 {
                let (lo, hi) = self.compute_time_step()?;
                min_dt = lo;
                max_dt = hi;
            }
            self.assemble_residual(&mut counters)?;
            match self.cfg.time_int {
                TimeIntKind::EulerImplicit => counters.lin_iters = self.implicit_update(),
                _ => self.explicit_update(alpha),
            }
        }
        self.exchange_solution()?;

        /* ---- monitors ---- */
        let mut report = IterationReport {
            iter: self.iter,
            min_delta_time: min_dt,
            max_delta_time: max_dt,
            linear_solver_iters: counters.lin_iters,
            ..IterationReport::default()
        };
        monitor::reduce_residuals(self.comm, self.mesh, &self.lin_res, self.ix.n_var(), &mut report)?;
        monitor::compute_forces(self.comm, self.cfg, self.mesh, &self.nodes, &self.infty, &mut report)?;

        report.non_physical_points = allreduce_count(self.comm, counters.non_physical)?;
        report.non_physical_reconstr = allreduce_count(self.comm, counters.non_physical_reconstr)?;
        report.e_axi = allreduce_count(self.comm, counters.sources.e_axi)?;
        report.e_chm = allreduce_count(self.comm, counters.sources.e_chm)?;
        report.e_vib = allreduce_count(self.comm, counters.sources.e_vib)?;

        if self.comm.rank() == 0 {
            if report.non_physical_points > 0 {
                warn!(points = report.non_physical_points, "non-physical points this iteration");
            }
            if report.e_axi + report.e_chm + report.e_vib > 0 {
                warn!(
                    e_axi = report.e_axi,
                    e_chm = report.e_chm,
                    e_vib = report.e_vib,
                    "skipped source-term contributions"
                );
            }
            info!(
                iter = report.iter,
                res0 = report.res_rms_log10.first().copied().unwrap_or(0.0),
                lin_iters = report.linear_solver_iters,
                "iteration"
            );
        }
        Ok(report)
    }

    /// Close a physical time step in dual-time mode: rotate the snapshots
    /// and advance the clock.
    pub fn advance_physical_time(&mut self) {
        self.nodes.push_time_levels();
        self.physical_time += self.cfg.time_step;
    }

    /* ------------------------------ restart --------------------------------- */

    /// Write the owned solution block plus resume metadata.
    pub fn save_restart(&self, path: &Path, cl: Scalar, cd: Scalar) -> anyhow::Result<()> {
        let nv = self.ix.n_var();
        let nd = self.ix.n_dim;
        let n = self.mesh.n_point_owned;
        let block = restart::RestartBlock {
            n_vars: nv,
            n_dim: nd,
            n_points: n,
            coords: self.mesh.coords[..n * nd].to_vec(),
            solution: self.nodes.solution[..n * nv].to_vec(),
            grid_vel: self.mesh.grid_vel.as_ref().map(|gv| gv[..n * nd].to_vec()),
        };
        let meta = restart::RestartMeta {
            iter: self.iter,
            time: self.physical_time,
            aoa: self.cfg.aoa,
            cl,
            cd,
        };
        restart::write_restart(path, &block, &meta)
    }

    /// Load a restart block written by this rank; populates the dual-time
    /// snapshots before the first step.
    pub fn load_restart(&mut self, path: &Path) -> CoreResult<()> {
        let nv = self.ix.n_var();
        let (block, meta) = restart::read_restart(path, self.ix.n_dim)?;
        if block.n_vars != nv || block.n_points != self.mesh.n_point_owned {
            return Err(karman_core::KarmanError::Mesh(format!(
                "restart block is {}x{}, expected {}x{}",
                block.n_points,
                block.n_vars,
                self.mesh.n_point_owned,
                nv
            )));
        }
        self.nodes.solution[..block.n_points * nv].copy_from_slice(&block.solution);
        self.nodes.commit_solution();
        self.nodes.solution_time_n[..block.n_points * nv].copy_from_slice(&block.solution);
        self.nodes.solution_time_n1[..block.n_points * nv].copy_from_slice(&block.solution);
        self.iter = meta.iter;
        self.physical_time = meta.time;
        for p in 0..self.mesh.n_point_owned {
            let _ = self.nodes.set_prim_var_compressible(p, &self.gas);
        }
        self.exchange_solution()?;
        Ok(())
    }
}
