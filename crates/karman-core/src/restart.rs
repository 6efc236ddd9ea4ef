// crates/karman-core/src/restart.rs

//! Restart file I/O.
//!
//! Data files are binary with a fixed-width little-endian header
//! `{ n_vars: u64, n_points: u64 }` followed by one record per point:
//! `coord[n_dim], U[n_vars]`, optionally followed by `grid_vel[n_dim]`.
//! Grid-velocity presence is inferred from the record width implied by the
//! file length. A sibling `<path>.meta.json` records the solver iteration,
//! physical time, and the aerodynamic state needed to resume (AoA, CL, CD).
//!
//! Reads of missing/corrupt files are fatal; a failed write is reported by
//! the caller and the run continues.

use crate::error::{CoreResult, KarmanError};
use crate::types::Scalar;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Aerodynamic resume state stored next to the binary block.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RestartMeta {
    /// Outer iteration at which the solution was written.
    pub iter: u64,
    /// Physical time for unsteady runs.
    pub time: Scalar,
    /// Angle of attack [deg].
    pub aoa: Scalar,
    /// Lift coefficient at write time.
    pub cl: Scalar,
    /// Drag coefficient at write time.
    pub cd: Scalar,
}

/// In-memory restart block for one rank.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RestartBlock {
    pub n_vars: usize,
    pub n_dim: usize,
    pub n_points: usize,
    /// `n_points * n_dim`, point-major.
    pub coords: Vec<Scalar>,
    /// `n_points * n_vars`, point-major.
    pub solution: Vec<Scalar>,
    /// `n_points * n_dim` when grid motion was active at write time.
    pub grid_vel: Option<Vec<Scalar>>,
}

fn meta_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".meta.json");
    PathBuf::from(p)
}

/// Write a restart block and its metadata sidecar.
pub fn write_restart(path: &Path, block: &RestartBlock, meta: &RestartMeta) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).with_context(|| format!("creating parent directory {}", dir.display()))?;
        }
    }
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = BufWriter::new(f);

    w.write_all(&(block.n_vars as u64).to_le_bytes())?;
    w.write_all(&(block.n_points as u64).to_le_bytes())?;
    for p in 0..block.n_points {
        for d in 0..block.n_dim {
            w.write_all(&block.coords[p * block.n_dim + d].to_le_bytes())?;
        }
        for v in 0..block.n_vars {
            w.write_all(&block.solution[p * block.n_vars + v].to_le_bytes())?;
        }
        if let Some(gv) = &block.grid_vel {
            for d in 0..block.n_dim {
                w.write_all(&gv[p * block.n_dim + d].to_le_bytes())?;
            }
        }
    }
    w.flush()?;

    let mf = File::create(meta_path(path)).with_context(|| format!("create {}", meta_path(path).display()))?;
    serde_json::to_writer_pretty(BufWriter::new(mf), meta).context("serialize restart metadata")?;
    Ok(())
}

/// Read a restart block written for a mesh of dimension `n_dim`.
pub fn read_restart(path: &Path, n_dim: usize) -> CoreResult<(RestartBlock, RestartMeta)> {
    let f = File::open(path)?;
    let file_len = f.metadata()?.len() as usize;
    let mut r = BufReader::new(f);

    let mut u64buf = [0u8; 8];
    r.read_exact(&mut u64buf)?;
    let n_vars = u64::from_le_bytes(u64buf) as usize;
    r.read_exact(&mut u64buf)?;
    let n_points = u64::from_le_bytes(u64buf) as usize;

    if n_vars == 0 || n_points == 0 {
        return Err(KarmanError::Mesh(format!("restart {}: empty block header", path.display())));
    }
    let body = file_len - 16;
    let base_rec = (n_dim + n_vars) * 8;
    let motion_rec = (2 * n_dim + n_vars) * 8;
    let has_grid_vel = if body == n_points * base_rec {
        false
    } else if body == n_points * motion_rec {
        true
    } else {
        return Err(KarmanError::Mesh(format!(
            "restart {}: body of {body} bytes matches neither {} static nor {} moving-grid records",
            path.display(),
            n_points,
            n_points
        )));
    };

    let mut block = RestartBlock {
        n_vars,
        n_dim,
        n_points,
        coords: vec![0.0; n_points * n_dim],
        solution: vec![0.0; n_points * n_vars],
        grid_vel: has_grid_vel.then(|| vec![0.0; n_points * n_dim]),
    };
    let mut f64buf = [0u8; 8];
    for p in 0..n_points {
        for d in 0..n_dim {
            r.read_exact(&mut f64buf)?;
            block.coords[p * n_dim + d] = Scalar::from_le_bytes(f64buf);
        }
        for v in 0..n_vars {
            r.read_exact(&mut f64buf)?;
            block.solution[p * n_vars + v] = Scalar::from_le_bytes(f64buf);
        }
        if let Some(gv) = block.grid_vel.as_mut() {
            for d in 0..n_dim {
                r.read_exact(&mut f64buf)?;
                gv[p * n_dim + d] = Scalar::from_le_bytes(f64buf);
            }
        }
    }

    let mf = File::open(meta_path(path))?;
    let meta: RestartMeta = serde_json::from_reader(BufReader::new(mf))
        .map_err(|e| KarmanError::Mesh(format!("restart metadata {}: {e}", meta_path(path).display())))?;
    Ok((block, meta))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block(grid_vel: bool) -> RestartBlock {
        let n_points = 3;
        let n_dim = 2;
        let n_vars = 5;
        RestartBlock {
            n_vars,
            n_dim,
            n_points,
            coords: (0..n_points * n_dim).map(|i| i as Scalar * 0.5).collect(),
            solution: (0..n_points * n_vars).map(|i| i as Scalar + 0.25).collect(),
            grid_vel: grid_vel.then(|| vec![0.125; n_points * n_dim]),
        }
    }

    #[test]
    fn roundtrip_static_grid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restart.dat");
        let block = sample_block(false);
        let meta = RestartMeta { iter: 17, time: 0.25, aoa: 2.0, cl: 0.4, cd: 0.01 };
        write_restart(&path, &block, &meta).unwrap();
        let (got, got_meta) = read_restart(&path, 2).unwrap();
        assert_eq!(got, block);
        assert_eq!(got_meta, meta);
    }

    #[test]
    fn roundtrip_moving_grid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restart.dat");
        let block = sample_block(true);
        write_restart(&path, &block, &RestartMeta::default()).unwrap();
        let (got, _) = read_restart(&path, 2).unwrap();
        assert!(got.grid_vel.is_some());
        assert_eq!(got, block);
    }

    proptest::proptest! {
        /// Any finite solution block survives the binary round trip bit-exactly.
        #[test]
        fn roundtrip_arbitrary_values(values in proptest::collection::vec(-1.0e12_f64..1.0e12, 10)) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("restart.dat");
            let block = RestartBlock {
                n_vars: 5,
                n_dim: 2,
                n_points: 2,
                coords: values[..4].to_vec(),
                solution: values[..10].to_vec(),
                grid_vel: None,
            };
            write_restart(&path, &block, &RestartMeta::default()).unwrap();
            let (got, _) = read_restart(&path, 2).unwrap();
            proptest::prop_assert_eq!(got, block);
        }
    }

    #[test]
    fn truncated_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restart.dat");
        let block = sample_block(false);
        write_restart(&path, &block, &RestartMeta::default()).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();
        assert!(read_restart(&path, 2).is_err());
    }
}
