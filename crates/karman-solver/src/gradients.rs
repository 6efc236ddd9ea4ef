// crates/karman-solver/src/gradients.rs

//! Reconstruction gradients (Green-Gauss and weighted least squares),
//! limiter computation with the edge min/max reductions, and the centered
//! scheme's pressure sensor / undivided Laplacian pass.

use karman_core::{Config, Scalar, SlopeLimit};
use karman_mesh::DualMesh;
use karman_numerics::limiters;
use karman_state::NodeVars;

/// Green-Gauss gradients of the conservative vector into `grad_sol` and of
/// the leading primitives into `grad_prim`.
pub fn green_gauss(mesh: &DualMesh, nodes: &mut NodeVars) {
    let ix = nodes.ix;
    let nv = ix.n_var();
    let npg = ix.n_prim_grad();
    let nd = ix.n_dim;
    let np = ix.n_prim();

    nodes.grad_sol.fill(0.0);
    nodes.grad_prim.fill(0.0);

    for e in &mesh.edges {
        let [i, j] = e.nodes;
        for k in 0..nv {
            let avg = 0.5 * (nodes.solution[i * nv + k] + nodes.solution[j * nv + k]);
            for d in 0..nd {
                let f = avg * e.normal[d];
                nodes.grad_sol[(i * nv + k) * nd + d] += f;
                nodes.grad_sol[(j * nv + k) * nd + d] -= f;
            }
        }
        for k in 0..npg {
            let avg = 0.5 * (nodes.primitive[i * np + k] + nodes.primitive[j * np + k]);
            for d in 0..nd {
                let f = avg * e.normal[d];
                nodes.grad_prim[(i * npg + k) * nd + d] += f;
                nodes.grad_prim[(j * npg + k) * nd + d] -= f;
            }
        }
    }
    // Close the dual cells on the boundary.
    for m in &mesh.markers {
        for v in &m.vertices {
            let p = v.point;
            for k in 0..nv {
                let val = nodes.solution[p * nv + k];
                for d in 0..nd {
                    nodes.grad_sol[(p * nv + k) * nd + d] += val * v.normal[d];
                }
            }
            for k in 0..npg {
                let val = nodes.primitive[p * np + k];
                for d in 0..nd {
                    nodes.grad_prim[(p * npg + k) * nd + d] += val * v.normal[d];
                }
            }
        }
    }
    for p in 0..mesh.n_point {
        let inv_vol = 1.0 / mesh.volume[p].max(Scalar::MIN_POSITIVE);
        for k in 0..nv * nd {
            nodes.grad_sol[p * nv * nd + k] *= inv_vol;
        }
        for k in 0..npg * nd {
            nodes.grad_prim[p * npg * nd + k] *= inv_vol;
        }
    }
}

/// Weighted (inverse-distance-squared) least-squares gradients.
pub fn weighted_least_squares(mesh: &DualMesh, nodes: &mut NodeVars) {
    let ix = nodes.ix;
    let nv = ix.n_var();
    let npg = ix.n_prim_grad();
    let nd = ix.n_dim;
    let np = ix.n_prim();

    nodes.grad_sol.fill(0.0);
    nodes.grad_prim.fill(0.0);

    for p in 0..mesh.n_point {
        // Normal matrix and right-hand sides over the edge neighbors.
        let mut a = [[0.0; 3]; 3];
        let mut rhs_u = vec![[0.0; 3]; nv];
        let mut rhs_v = vec![[0.0; 3]; npg];
        let mut any = false;
        for q in mesh.neighbors(p) {
            any = true;
            let mut dx = [0.0; 3];
            let mut w = 0.0;
            for d in 0..nd {
                dx[d] = mesh.coords[q * nd + d] - mesh.coords[p * nd + d];
                w += dx[d] * dx[d];
            }
            let w = 1.0 / w.max(Scalar::MIN_POSITIVE);
            for r in 0..nd {
                for c in 0..nd {
                    a[r][c] += w * dx[r] * dx[c];
                }
            }
            for k in 0..nv {
                let du = nodes.solution[q * nv + k] - nodes.solution[p * nv + k];
                for d in 0..nd {
                    rhs_u[k][d] += w * dx[d] * du;
                }
            }
            for k in 0..npg {
                let dv = nodes.primitive[q * np + k] - nodes.primitive[p * np + k];
                for d in 0..nd {
                    rhs_v[k][d] += w * dx[d] * dv;
                }
            }
        }
        if !any {
            continue;
        }
        let Some(inv) = invert(&a, nd) else { continue };
        for k in 0..nv {
            for d in 0..nd {
                let mut g = 0.0;
                for c in 0..nd {
                    g += inv[d][c] * rhs_u[k][c];
                }
                nodes.grad_sol[(p * nv + k) * nd + d] = g;
            }
        }
        for k in 0..npg {
            for d in 0..nd {
                let mut g = 0.0;
                for c in 0..nd {
                    g += inv[d][c] * rhs_v[k][c];
                }
                nodes.grad_prim[(p * npg + k) * nd + d] = g;
            }
        }
    }
}

fn invert(a: &[[Scalar; 3]; 3], n: usize) -> Option<[[Scalar; 3]; 3]> {
    let mut inv = [[0.0; 3]; 3];
    if n == 2 {
        let det = a[0][0] * a[1][1] - a[0][1] * a[1][0];
        if det.abs() < 1e-300 {
            return None;
        }
        inv[0][0] = a[1][1] / det;
        inv[1][1] = a[0][0] / det;
        inv[0][1] = -a[0][1] / det;
        inv[1][0] = -a[1][0] / det;
    } else {
        let det = a[0][0] * (a[1][1] * a[2][2] - a[1][2] * a[2][1])
            - a[0][1] * (a[1][0] * a[2][2] - a[1][2] * a[2][0])
            + a[0][2] * (a[1][0] * a[2][1] - a[1][1] * a[2][0]);
        if det.abs() < 1e-300 {
            return None;
        }
        let cof = |p: usize, q: usize, r: usize, s: usize| a[p][q] * a[r][s] - a[p][s] * a[r][q];
        inv[0][0] = cof(1, 1, 2, 2) / det;
        inv[0][1] = -cof(0, 1, 2, 2) / det;
        inv[0][2] = cof(0, 1, 1, 2) / det;
        inv[1][0] = -cof(1, 0, 2, 2) / det;
        inv[1][1] = cof(0, 0, 2, 2) / det;
        inv[1][2] = -cof(0, 0, 1, 2) / det;
        inv[2][0] = cof(1, 0, 2, 1) / det;
        inv[2][1] = -cof(0, 0, 2, 1) / det;
        inv[2][2] = cof(0, 0, 1, 1) / det;
    }
    Some(inv)
}

/// Limiter pass on the conservative vector: build `solution_max/min` over
/// the edge neighborhoods, then reduce each point's limiter over its edges.
pub fn compute_limiters(mesh: &DualMesh, nodes: &mut NodeVars, cfg: &Config) {
    let ix = nodes.ix;
    let nv = ix.n_var();
    let nd = ix.n_dim;
    let eps2 = (cfg.venkat_limiter_coeff * cfg.ref_length).powi(3);

    // Neighborhood extrema seeded with the point value.
    for p in 0..mesh.n_point {
        for k in 0..nv {
            nodes.solution_max[p * nv + k] = nodes.solution[p * nv + k];
            nodes.solution_min[p * nv + k] = nodes.solution[p * nv + k];
        }
    }
    for e in &mesh.edges {
        let [i, j] = e.nodes;
        for k in 0..nv {
            let ui = nodes.solution[i * nv + k];
            let uj = nodes.solution[j * nv + k];
            nodes.solution_max[i * nv + k] = nodes.solution_max[i * nv + k].max(uj);
            nodes.solution_min[i * nv + k] = nodes.solution_min[i * nv + k].min(uj);
            nodes.solution_max[j * nv + k] = nodes.solution_max[j * nv + k].max(ui);
            nodes.solution_min[j * nv + k] = nodes.solution_min[j * nv + k].min(ui);
        }
    }

    nodes.limiter.fill(1.0);
    for e in &mesh.edges {
        let [i, j] = e.nodes;
        for (p, q) in [(i, j), (j, i)] {
            for k in 0..nv {
                let mut dm = 0.0;
                for d in 0..nd {
                    dm += 0.5
                        * (mesh.coords[q * nd + d] - mesh.coords[p * nd + d])
                        * nodes.grad_sol[(p * nv + k) * nd + d];
                }
                let dp = if dm > 0.0 {
                    nodes.solution_max[p * nv + k] - nodes.solution[p * nv + k]
                } else {
                    nodes.solution_min[p * nv + k] - nodes.solution[p * nv + k]
                };
                let phi = match cfg.slope_limit {
                    SlopeLimit::Venkat => limiters::venkat(dp, dm, eps2),
                    SlopeLimit::Minmod => limiters::minmod(dp, dm),
                    SlopeLimit::None | SlopeLimit::VanAlbada => 1.0,
                };
                let slot = &mut nodes.limiter[p * nv + k];
                *slot = slot.min(phi);
            }
        }
    }
}

/// Centered-scheme preprocessing: undivided Laplacian of U and the pressure
/// dissipation sensor.
pub fn compute_sensors(mesh: &DualMesh, nodes: &mut NodeVars) {
    let ix = nodes.ix;
    let nv = ix.n_var();
    let np = ix.n_prim();
    let p_idx = ix.p();

    nodes.und_lapl.fill(0.0);
    let mut num = vec![0.0; mesh.n_point];
    let mut den = vec![0.0; mesh.n_point];
    for e in &mesh.edges {
        let [i, j] = e.nodes;
        for k in 0..nv {
            let du = nodes.solution[j * nv + k] - nodes.solution[i * nv + k];
            nodes.und_lapl[i * nv + k] += du;
            nodes.und_lapl[j * nv + k] -= du;
        }
        let dp = nodes.primitive[j * np + p_idx] - nodes.primitive[i * np + p_idx];
        let sp = nodes.primitive[j * np + p_idx] + nodes.primitive[i * np + p_idx];
        num[i] += dp;
        num[j] -= dp;
        den[i] += sp;
        den[j] += sp;
    }
    for p in 0..mesh.n_point {
        nodes.sensor[p] = num[p].abs() / den[p].max(Scalar::MIN_POSITIVE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karman_mesh::MeshBuilder;
    use karman_state::{FreestreamState, GasModel, VarIndices};

    fn setup() -> (DualMesh, NodeVars, GasModel) {
        let gas = GasModel::from_names(&["N2", "O2"]).unwrap();
        let ix = VarIndices::new(2, 2);
        let mesh = MeshBuilder::rect_2d(4, 4, 1.0, 1.0).build().unwrap();
        let cfg = Config::default();
        let infty = FreestreamState::from_config(&cfg, &gas, ix).unwrap();
        let mut nodes = NodeVars::new(ix, &mesh);
        nodes.init_from_freestream(&infty);
        for p in 0..mesh.n_point {
            nodes.set_prim_var_compressible(p, &gas);
        }
        (mesh, nodes, gas)
    }

    /// Both gradient methods must reproduce a linear field exactly at
    /// interior points.
    #[test]
    fn gradients_exact_for_linear_field() {
        let (mesh, mut nodes, gas) = setup();
        let ix = nodes.ix;
        let nv = ix.n_var();
        // u_0 := 2x + 3y on top of the freestream first species density.
        for p in 0..mesh.n_point {
            let (x, y) = (mesh.coord(p)[0], mesh.coord(p)[1]);
            nodes.u_mut(p)[0] = 1.0 + 2.0 * x + 3.0 * y;
        }
        for p in 0..mesh.n_point {
            nodes.set_prim_var_compressible(p, &gas);
        }

        for method in [green_gauss as fn(&DualMesh, &mut NodeVars), weighted_least_squares] {
            method(&mesh, &mut nodes);
            for p in 0..mesh.n_point {
                let on_boundary = nodes.vertex_of(p).is_some();
                if on_boundary {
                    continue; // one-sided stencils are first-order there
                }
                let g = &nodes.grad_sol[(p * nv) * 2..(p * nv) * 2 + 2];
                assert!((g[0] - 2.0).abs() < 1e-9, "d/dx = {}", g[0]);
                assert!((g[1] - 3.0).abs() < 1e-9, "d/dy = {}", g[1]);
            }
        }
    }

    #[test]
    fn limiter_is_one_on_uniform_field() {
        let (mesh, mut nodes, _gas) = setup();
        green_gauss(&mesh, &mut nodes);
        let cfg = Config::default();
        compute_limiters(&mesh, &mut nodes, &cfg);
        for v in &nodes.limiter {
            assert!((*v - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn sensor_vanishes_on_uniform_pressure() {
        let (mesh, mut nodes, _gas) = setup();
        compute_sensors(&mesh, &mut nodes);
        for p in 0..mesh.n_point_owned {
            assert!(nodes.sensor[p].abs() < 1e-12);
        }
    }
}
