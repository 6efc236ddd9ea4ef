// crates/karman-cli/src/main.rs

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, clippy::unwrap_used, clippy::expect_used)]

use anyhow::Context;
use clap::Parser;
use karman_core::{Config, CoreResult, KarmanError, LocalComm, Scalar};
use karman_mesh::MeshBuilder;
use karman_smooth::{smooth_volume, SmoothOptions};
use karman_solver::FlowSolver;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "karman",
    about = "karman compressible-flow solver",
    long_about = "karman compressible-flow solver.\n\nAdvances the configured conservation laws (Euler, Navier-Stokes, two-temperature NEMO) on the configured mesh and writes a restart solution.",
    version = env!("CARGO_PKG_VERSION"),
    disable_help_subcommand = true
)]
struct Cli {
    /// Path to the configuration file.
    config: PathBuf,

    /// Dry run: parse the configuration and allocate, but do not iterate.
    #[arg(short = 'd', long = "dry-run", default_value_t = false)]
    dry_run: bool,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("karman: {e}");
            #[allow(clippy::cast_sign_loss)]
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

/// Initialize tracing with an env-driven filter (default INFO).
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(false).with_level(true).compact();

    let _ = tracing_subscriber::registry().with(filter).with(fmt_layer).try_init();
}

fn run(cli: &Cli) -> CoreResult<()> {
    let cfg = Config::from_file(&cli.config)?;
    info!(config = %cli.config.display(), "configuration loaded");

    let mesh = MeshBuilder::rect_2d(cfg.mesh_nx, cfg.mesh_ny, cfg.mesh_lx, cfg.mesh_ly).build()?;
    info!(
        points = mesh.n_point,
        edges = mesh.edges.len(),
        markers = mesh.markers.len(),
        "mesh ready"
    );
    let comm = LocalComm::solo();

    let mut solver = FlowSolver::new(&cfg, &mesh, &comm)?;
    if !cfg.restart_file.is_empty() {
        solver.load_restart(Path::new(&cfg.restart_file))?;
        info!(iter = solver.iteration(), "restarted");
    }

    if cli.dry_run {
        // Also assemble the DG element/face catalog so a dry run validates
        // the full mesh hierarchy, not just the dual grid.
        let specs: Vec<karman_mesh::FemElementSpec> = mesh
            .elements
            .iter()
            .map(|el| karman_mesh::FemElementSpec {
                vtk: el.vtk,
                nodes: el.nodes.clone(),
                n_poly_sol: 1,
                time_level: el.time_level,
                owned: el.owned,
                orig_rank: 0,
                global_id: el.global_id,
            })
            .collect();
        let fem = karman_mesh::FemMesh::build(mesh.n_dim, 1, &specs, &mesh.coords)?;
        println!(
            "Dry run: {} points, {} variables per point, {} markers, {} DG faces",
            mesh.n_point,
            solver.ix.n_var(),
            cfg.markers.len(),
            fem.faces.len()
        );
        return Ok(());
    }

    let (mut cl, mut cd): (Scalar, Scalar) = (0.0, 0.0);
    for _ in 0..cfg.n_outer_iters {
        let report = solver.iterate()?;
        if let Some(f) = report.forces.first() {
            cl = f.cl;
            cd = f.cd;
        }
        println!(
            "iter {:>6}  log10(res) {:>9.4}  lin {:>4}  nonphys {:>4}  CL {:+.5}  CD {:+.5}",
            report.iter,
            report.res_rms_log10.first().copied().unwrap_or(0.0),
            report.linear_solver_iters,
            report.non_physical_points,
            cl,
            cd
        );
    }

    // Post-process: Sobolev-smooth the accumulated sensitivity field.
    let smooth_opts = SmoothOptions {
        epsilon: cfg.sobolev_epsilon,
        separate_dimensions: cfg.sobolev_sep_dim,
        second_order_quad: cfg.sobolev_second_order_quad,
        ..SmoothOptions::default()
    };
    let mut sens = solver.nodes.sensitivity.clone();
    if sens.iter().any(|s| *s != 0.0) {
        let iters = smooth_volume(&mesh, &smooth_opts, &mut sens)?;
        solver.nodes.sensitivity.copy_from_slice(&sens);
        info!(iters, "sensitivity field smoothed");
    }

    // Unrecoverable arithmetic failure: poisoned final state.
    if solver.nodes.solution.iter().any(|v| v.is_nan()) {
        return Err(KarmanError::Arithmetic("final solution contains NaN".into()));
    }

    // A failed solution write is reported, never fatal.
    let out = PathBuf::from(&cfg.solution_file);
    match solver.save_restart(&out, cl, cd).with_context(|| format!("writing {}", out.display())) {
        Ok(()) => println!("Wrote solution to {}", out.display()),
        Err(e) => warn!("solution write failed: {e:#}"),
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_dry_run_flag() {
        let cli = Cli::parse_from(["karman", "case.cfg", "-d"]);
        assert!(cli.dry_run);
        assert_eq!(cli.config, PathBuf::from("case.cfg"));
    }

    #[test]
    fn dry_run_allocates_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("case.cfg");
        std::fs::write(
            &path,
            "MESH_NX = 4\nMESH_NY = 4\nMARKER_FAR = ( left, right, bottom, top )\nOUTER_ITER = 3\n",
        )
        .unwrap();
        let cli = Cli { config: path, dry_run: true };
        run(&cli).unwrap();
    }

    #[test]
    fn missing_config_maps_to_exit_one() {
        let cli = Cli { config: PathBuf::from("/no/such/file.cfg"), dry_run: true };
        let err = run(&cli).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}
