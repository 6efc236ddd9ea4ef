// crates/karman-core/src/config.rs

//! Read-only key/value configuration store.
//!
//! The on-disk format is one `KEY = value` pair per line, `%` or `#` starting
//! a comment, and parenthesized comma-separated lists for marker options,
//! e.g. `MARKER_ISOTHERMAL = ( wall, 300.0 )`. Keys are case-insensitive.
//! Unknown keys and malformed enum values are fatal at startup.

use crate::error::{CoreResult, KarmanError};
use crate::types::Scalar;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

/// Convective scheme family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvScheme {
    Centered,
    Upwind,
}

/// Centered flux flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CenteredKind {
    Jst,
    Lax,
}

/// Upwind flux flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpwindKind {
    Roe,
    Ausm,
    Hllc,
}

/// Slope limiter applied to MUSCL reconstruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlopeLimit {
    None,
    Venkat,
    Minmod,
    VanAlbada,
}

/// Reconstruction-gradient method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GradientKind {
    GreenGauss,
    Wls,
}

/// Time-integration scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeIntKind {
    EulerExplicit,
    Rk,
    EulerImplicit,
}

/// Linear-solver preconditioner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrecKind {
    Jacobi,
    LuSgs,
    Linelet,
}

/// Krylov method used by the implicit step and the Sobolev solve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KrylovKind {
    Richardson,
    Gmres,
    Bicgstab,
}

/// Outer time-marching mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeMarching {
    Steady,
    Dt1st,
    Dt2nd,
    TimeStepping,
}

/// Boundary-condition kind attached to a marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BcKind {
    EulerWall,
    Symmetry,
    HeatFluxWall,
    IsothermalWall,
    CatalyticWall,
    FarField,
    SupersonicInlet,
    SubsonicOutlet,
    Periodic,
}

impl fmt::Display for BcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Per-marker boundary configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MarkerCfg {
    /// Marker tag string as it appears in the mesh.
    pub tag: String,
    /// Boundary-condition kind.
    pub kind: BcKind,
    /// Prescribed wall heat flux [W/m^2] (heat-flux walls).
    pub wall_heat_flux: Scalar,
    /// Prescribed wall temperature [K] (isothermal/catalytic walls).
    pub isothermal_temperature: Scalar,
    /// Inlet total pressure [Pa].
    pub inlet_pressure: Scalar,
    /// Inlet total temperature [K].
    pub inlet_temperature: Scalar,
    /// Inlet velocity vector [m/s].
    pub inlet_flow_dir: [Scalar; 3],
    /// Outlet back pressure [Pa].
    pub outlet_pressure: Scalar,
    /// Weight of this marker in the composite objective monitor.
    pub monitor_weight: Scalar,
}

impl MarkerCfg {
    fn new(tag: &str, kind: BcKind) -> Self {
        Self {
            tag: tag.to_owned(),
            kind,
            wall_heat_flux: 0.0,
            isothermal_temperature: 300.0,
            inlet_pressure: 101_325.0,
            inlet_temperature: 288.15,
            inlet_flow_dir: [1.0, 0.0, 0.0],
            outlet_pressure: 101_325.0,
            monitor_weight: 0.0,
        }
    }
}

/// Typed, read-only solver configuration.
///
/// Built by [`Config::from_file`] or [`Config::default`]; passed explicitly
/// through every constructor in the workspace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub conv_scheme: ConvScheme,
    pub centered_kind: CenteredKind,
    pub upwind_kind: UpwindKind,
    pub slope_limit: SlopeLimit,
    pub gradient_kind: GradientKind,
    pub time_int: TimeIntKind,
    pub prec_kind: PrecKind,
    pub krylov_kind: KrylovKind,
    pub time_marching: TimeMarching,

    /// Second-order MUSCL reconstruction on the finest mesh level.
    pub muscl: bool,
    /// Viscous (Navier-Stokes) terms enabled.
    pub viscous: bool,
    /// Axisymmetric source terms enabled.
    pub axisymmetric: bool,
    /// Finite-rate chemistry source enabled.
    pub chemistry: bool,
    /// Vibrational relaxation source enabled.
    pub vib_relaxation: bool,

    pub cfl: Scalar,
    pub max_delta_time: Scalar,
    /// Physical time step for dual-time and time-accurate marching.
    pub time_step: Scalar,
    pub relaxation_factor_flow: Scalar,
    pub venkat_limiter_coeff: Scalar,
    /// JST 2nd/4th difference coefficients.
    pub jst_kappa2: Scalar,
    pub jst_kappa4: Scalar,

    pub n_rk_stages: usize,
    pub n_outer_iters: usize,
    pub linear_solver_iters: usize,
    pub linear_solver_tol: Scalar,
    pub gmres_restart: usize,

    pub ref_area: Scalar,
    pub ref_length: Scalar,
    /// Angle of attack [deg].
    pub aoa: Scalar,
    /// Angle of sideslip [deg].
    pub aos: Scalar,
    pub mach: Scalar,
    pub reynolds: Scalar,

    pub freestream_pressure: Scalar,
    pub freestream_temperature: Scalar,
    pub freestream_temperature_ve: Scalar,
    pub freestream_density: Scalar,
    /// Freestream species mass fractions; length = number of species.
    pub freestream_massfrac: Vec<Scalar>,

    /// Species names of the mixture model (e.g. `["N2","O2"]`).
    pub gas_species: Vec<String>,

    /// Sobolev smoothing: smoothing radius factor (scales the identity term).
    pub sobolev_epsilon: Scalar,
    /// Sobolev smoothing: solve one scalar system per dimension.
    pub sobolev_sep_dim: bool,
    /// Sobolev smoothing: second-order quadrature rules for simplices.
    pub sobolev_second_order_quad: bool,

    /// Per-marker boundary configuration.
    pub markers: Vec<MarkerCfg>,

    /// Restart solution input path (empty = cold start from freestream).
    pub restart_file: String,
    /// Solution output path.
    pub solution_file: String,

    /// Built-in rectangle mesh source (geometry file readers are external
    /// collaborators that feed the mesh builder instead).
    pub mesh_nx: usize,
    pub mesh_ny: usize,
    pub mesh_lx: Scalar,
    pub mesh_ly: Scalar,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            conv_scheme: ConvScheme::Upwind,
            centered_kind: CenteredKind::Jst,
            upwind_kind: UpwindKind::Roe,
            slope_limit: SlopeLimit::Venkat,
            gradient_kind: GradientKind::GreenGauss,
            time_int: TimeIntKind::EulerImplicit,
            prec_kind: PrecKind::LuSgs,
            krylov_kind: KrylovKind::Gmres,
            time_marching: TimeMarching::Steady,
            muscl: true,
            viscous: false,
            axisymmetric: false,
            chemistry: false,
            vib_relaxation: false,
            cfl: 1.0,
            max_delta_time: 1.0e6,
            time_step: 1.0e-3,
            relaxation_factor_flow: 1.0,
            venkat_limiter_coeff: 0.05,
            jst_kappa2: 0.5,
            jst_kappa4: 0.02,
            n_rk_stages: 3,
            n_outer_iters: 1,
            linear_solver_iters: 100,
            linear_solver_tol: 1.0e-6,
            gmres_restart: 30,
            ref_area: 1.0,
            ref_length: 1.0,
            aoa: 0.0,
            aos: 0.0,
            mach: 0.3,
            reynolds: 0.0,
            freestream_pressure: 101_325.0,
            freestream_temperature: 288.15,
            freestream_temperature_ve: 288.15,
            freestream_density: 0.0,
            freestream_massfrac: vec![0.767, 0.233],
            gas_species: vec!["N2".into(), "O2".into()],
            sobolev_epsilon: 1.0,
            sobolev_sep_dim: false,
            sobolev_second_order_quad: false,
            markers: Vec::new(),
            restart_file: String::new(),
            solution_file: "solution.dat".into(),
            mesh_nx: 32,
            mesh_ny: 32,
            mesh_lx: 1.0,
            mesh_ly: 1.0,
        }
    }
}

impl Config {
    /// Parse a configuration file. Unknown keys and invalid enum values are
    /// fatal ([`KarmanError::Config`]).
    pub fn from_file<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_str_table(&text)
    }

    /// Parse configuration text (same format as the file contents).
    pub fn from_str_table(text: &str) -> CoreResult<Self> {
        let mut cfg = Self::default();
        let mut massfrac_set = false;

        for (lineno, raw) in text.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(KarmanError::Config(format!(
                    "line {}: expected KEY = value, got {:?}",
                    lineno + 1,
                    line
                )));
            };
            let key = key.trim().to_ascii_uppercase();
            let value = value.trim();
            cfg.apply(&key, value, &mut massfrac_set)
                .map_err(|e| KarmanError::Config(format!("line {}: {e}", lineno + 1)))?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn apply(&mut self, key: &str, value: &str, massfrac_set: &mut bool) -> Result<(), String> {
        match key {
            "KIND_CONVNUMSCHEME" => {
                self.conv_scheme = parse_enum(value, &[("CENTERED", ConvScheme::Centered), ("UPWIND", ConvScheme::Upwind)])?;
            }
            "KIND_CENTERED" => {
                self.centered_kind = parse_enum(value, &[("JST", CenteredKind::Jst), ("LAX", CenteredKind::Lax)])?;
            }
            "KIND_UPWIND" => {
                self.upwind_kind = parse_enum(
                    value,
                    &[("ROE", UpwindKind::Roe), ("AUSM", UpwindKind::Ausm), ("HLLC", UpwindKind::Hllc)],
                )?;
            }
            "KIND_SLOPELIMIT" => {
                self.slope_limit = parse_enum(
                    value,
                    &[
                        ("NONE", SlopeLimit::None),
                        ("VENKAT", SlopeLimit::Venkat),
                        ("MINMOD", SlopeLimit::Minmod),
                        ("VAN_ALBADA", SlopeLimit::VanAlbada),
                    ],
                )?;
            }
            "KIND_GRADIENT" => {
                self.gradient_kind = parse_enum(value, &[("GREEN_GAUSS", GradientKind::GreenGauss), ("WLS", GradientKind::Wls)])?;
            }
            "KIND_TIMEINT" => {
                self.time_int = parse_enum(
                    value,
                    &[
                        ("EULER_EXPLICIT", TimeIntKind::EulerExplicit),
                        ("RK", TimeIntKind::Rk),
                        ("EULER_IMPLICIT", TimeIntKind::EulerImplicit),
                    ],
                )?;
            }
            "KIND_LINEAR_SOLVER_PREC" => {
                self.prec_kind = parse_enum(
                    value,
                    &[("JACOBI", PrecKind::Jacobi), ("LU_SGS", PrecKind::LuSgs), ("LINELET", PrecKind::Linelet)],
                )?;
            }
            "KIND_LINEAR_SOLVER" => {
                self.krylov_kind = parse_enum(
                    value,
                    &[
                        ("RICHARDSON", KrylovKind::Richardson),
                        ("GMRES", KrylovKind::Gmres),
                        ("BICGSTAB", KrylovKind::Bicgstab),
                    ],
                )?;
            }
            "TIME_MARCHING" => {
                self.time_marching = parse_enum(
                    value,
                    &[
                        ("STEADY", TimeMarching::Steady),
                        ("DT_1ST", TimeMarching::Dt1st),
                        ("DT_2ND", TimeMarching::Dt2nd),
                        ("TIME_STEPPING", TimeMarching::TimeStepping),
                    ],
                )?;
            }
            "MUSCL" => self.muscl = parse_bool(value)?,
            "VISCOUS" => self.viscous = parse_bool(value)?,
            "AXISYMMETRIC" => self.axisymmetric = parse_bool(value)?,
            "CHEMISTRY" => self.chemistry = parse_bool(value)?,
            "VIB_RELAXATION" => self.vib_relaxation = parse_bool(value)?,
            "CFL" => self.cfl = parse_num(value)?,
            "MAXDELTATIME" | "MAX_DELTA_TIME" => self.max_delta_time = parse_num(value)?,
            "TIME_STEP" => self.time_step = parse_num(value)?,
            "RELAXATION_FACTOR_FLOW" => self.relaxation_factor_flow = parse_num(value)?,
            "VENKAT_LIMITERCOEFF" => self.venkat_limiter_coeff = parse_num(value)?,
            "JST_KAPPA2" => self.jst_kappa2 = parse_num(value)?,
            "JST_KAPPA4" => self.jst_kappa4 = parse_num(value)?,
            "RK_STAGES" => self.n_rk_stages = parse_num::<usize>(value)?,
            "OUTER_ITER" => self.n_outer_iters = parse_num::<usize>(value)?,
            "LINEAR_SOLVER_ITER" => self.linear_solver_iters = parse_num::<usize>(value)?,
            "LINEAR_SOLVER_ERROR" => self.linear_solver_tol = parse_num(value)?,
            "GMRES_RESTART" => self.gmres_restart = parse_num::<usize>(value)?,
            "REFAREA" | "REF_AREA" => self.ref_area = parse_num(value)?,
            "REFLENGTH" | "REF_LENGTH" => self.ref_length = parse_num(value)?,
            "AOA" => self.aoa = parse_num(value)?,
            "AOS" => self.aos = parse_num(value)?,
            "MACH" => self.mach = parse_num(value)?,
            "REYNOLDS" => self.reynolds = parse_num(value)?,
            "FREESTREAM_PRESSURE" => self.freestream_pressure = parse_num(value)?,
            "FREESTREAM_TEMPERATURE" => self.freestream_temperature = parse_num(value)?,
            "FREESTREAM_TEMPERATURE_VE" => self.freestream_temperature_ve = parse_num(value)?,
            "FREESTREAM_DENSITY" => self.freestream_density = parse_num(value)?,
            "FREESTREAM_MASSFRAC" => {
                self.freestream_massfrac = parse_list(value)?.iter().map(|s| parse_num(s)).collect::<Result<_, _>>()?;
                *massfrac_set = true;
            }
            "GAS_SPECIES" => {
                self.gas_species = parse_list(value)?.iter().map(|s| (*s).to_owned()).collect();
                if !*massfrac_set {
                    // Leave a uniform placeholder until FREESTREAM_MASSFRAC arrives.
                    let n = self.gas_species.len();
                    self.freestream_massfrac = vec![1.0 / n as Scalar; n];
                }
            }
            "SOBOLEV_EPSILON" => self.sobolev_epsilon = parse_num(value)?,
            "SOBOLEV_SEP_DIM" => self.sobolev_sep_dim = parse_bool(value)?,
            "SOBOLEV_SECOND_ORDER_QUAD" => self.sobolev_second_order_quad = parse_bool(value)?,
            "RESTART_FILE" => self.restart_file = value.to_owned(),
            "SOLUTION_FILE" => self.solution_file = value.to_owned(),
            "MESH_NX" => self.mesh_nx = parse_num::<usize>(value)?,
            "MESH_NY" => self.mesh_ny = parse_num::<usize>(value)?,
            "MESH_LX" => self.mesh_lx = parse_num(value)?,
            "MESH_LY" => self.mesh_ly = parse_num(value)?,
            "MARKER_EULER" => self.add_markers(value, BcKind::EulerWall, 0)?,
            "MARKER_SYM" => self.add_markers(value, BcKind::Symmetry, 0)?,
            "MARKER_FAR" => self.add_markers(value, BcKind::FarField, 0)?,
            "MARKER_HEATFLUX" => self.add_markers(value, BcKind::HeatFluxWall, 1)?,
            "MARKER_ISOTHERMAL" => self.add_markers(value, BcKind::IsothermalWall, 1)?,
            "MARKER_CATALYTIC" => self.add_markers(value, BcKind::CatalyticWall, 1)?,
            "MARKER_SUPERSONIC_INLET" => self.add_markers(value, BcKind::SupersonicInlet, 5)?,
            "MARKER_OUTLET" => self.add_markers(value, BcKind::SubsonicOutlet, 1)?,
            "MARKER_MONITORING" => {
                for tag in parse_list(value)? {
                    let m = self
                        .markers
                        .iter_mut()
                        .find(|m| m.tag == tag)
                        .ok_or_else(|| format!("MARKER_MONITORING references unknown marker {tag:?}"))?;
                    m.monitor_weight = 1.0;
                }
            }
            _ => return Err(format!("unknown configuration key {key:?}")),
        }
        Ok(())
    }

    /// Append markers from a `( tag, v0, .., tag, v0, .. )` list where each
    /// marker carries `n_vals` numeric values after its tag.
    fn add_markers(&mut self, value: &str, kind: BcKind, n_vals: usize) -> Result<(), String> {
        let items = parse_list(value)?;
        if items.len() % (n_vals + 1) != 0 {
            return Err(format!(
                "marker list for {kind} expects groups of {} entries, got {}",
                n_vals + 1,
                items.len()
            ));
        }
        for group in items.chunks(n_vals + 1) {
            let mut m = MarkerCfg::new(group[0], kind);
            match kind {
                BcKind::HeatFluxWall => m.wall_heat_flux = parse_num(group[1])?,
                BcKind::IsothermalWall | BcKind::CatalyticWall => {
                    m.isothermal_temperature = parse_num(group[1])?;
                }
                BcKind::SubsonicOutlet => m.outlet_pressure = parse_num(group[1])?,
                BcKind::SupersonicInlet => {
                    m.inlet_pressure = parse_num(group[1])?;
                    m.inlet_temperature = parse_num(group[2])?;
                    m.inlet_flow_dir = [parse_num(group[3])?, parse_num(group[4])?, parse_num(group[5])?];
                }
                _ => {}
            }
            self.markers.push(m);
        }
        Ok(())
    }

    fn validate(&self) -> CoreResult<()> {
        if self.gas_species.len() != self.freestream_massfrac.len() {
            return Err(KarmanError::Config(format!(
                "{} species but {} freestream mass fractions",
                self.gas_species.len(),
                self.freestream_massfrac.len()
            )));
        }
        let sum: Scalar = self.freestream_massfrac.iter().sum();
        if (sum - 1.0).abs() > 1.0e-8 {
            return Err(KarmanError::Config(format!("freestream mass fractions sum to {sum}, expected 1")));
        }
        // Ionized mixtures are unsupported; reject at startup rather than
        // producing inconsistent vib-electronic quantities downstream.
        for s in &self.gas_species {
            if s.ends_with('+') || s.ends_with('-') || s.eq_ignore_ascii_case("e") {
                return Err(KarmanError::Config(format!("ionized species {s:?} unsupported")));
            }
        }
        let mut seen = HashMap::new();
        for m in &self.markers {
            if seen.insert(m.tag.clone(), m.kind).is_some() {
                return Err(KarmanError::Config(format!("marker {:?} configured twice", m.tag)));
            }
        }
        if self.cfl <= 0.0 {
            return Err(KarmanError::Config(format!("CFL must be positive, got {}", self.cfl)));
        }
        Ok(())
    }

    /// Look up the marker configuration for a tag; fatal if absent.
    pub fn marker(&self, tag: &str) -> CoreResult<&MarkerCfg> {
        self.markers
            .iter()
            .find(|m| m.tag == tag)
            .ok_or_else(|| KarmanError::Config(format!("marker {tag:?} has no boundary condition")))
    }

    /// Number of species in the mixture model.
    #[inline]
    #[must_use]
    pub fn n_species(&self) -> usize {
        self.gas_species.len()
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find(['%', '#']) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_uppercase().as_str() {
        "YES" | "ON" | "TRUE" | "1" => Ok(true),
        "NO" | "OFF" | "FALSE" | "0" => Ok(false),
        other => Err(format!("expected a boolean, got {other:?}")),
    }
}

fn parse_num<T: std::str::FromStr>(value: &str) -> Result<T, String> {
    value.trim().parse::<T>().map_err(|_| format!("invalid number {value:?}"))
}

/// Split `( a, b, c )` (or a bare comma list) into trimmed items.
fn parse_list(value: &str) -> Result<Vec<&str>, String> {
    let inner = value.trim();
    let inner = inner.strip_prefix('(').and_then(|s| s.strip_suffix(')')).unwrap_or(inner);
    let items: Vec<&str> = inner.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    if items.is_empty() {
        return Err(format!("empty list {value:?}"));
    }
    Ok(items)
}

fn parse_enum<T: Copy>(value: &str, table: &[(&str, T)]) -> Result<T, String> {
    let up = value.trim().to_ascii_uppercase();
    for (name, v) in table {
        if up == *name {
            return Ok(*v);
        }
    }
    let names: Vec<&str> = table.iter().map(|(n, _)| *n).collect();
    Err(format!("invalid value {value:?}; expected one of {names:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "
% solver setup
KIND_CONVNUMSCHEME = UPWIND
KIND_UPWIND = AUSM
KIND_SLOPELIMIT = VENKAT
KIND_TIMEINT = EULER_IMPLICIT
MUSCL = YES
CFL = 2.5
MACH = 5.0
GAS_SPECIES = ( N2, O2 )
FREESTREAM_MASSFRAC = ( 0.767, 0.233 )
MARKER_ISOTHERMAL = ( wall, 1000.0 )
MARKER_FAR = ( farfield )
MARKER_MONITORING = ( wall )
";

    #[test]
    fn parses_sample_config() {
        let cfg = Config::from_str_table(SAMPLE).unwrap();
        assert_eq!(cfg.upwind_kind, UpwindKind::Ausm);
        assert_eq!(cfg.cfl, 2.5);
        assert_eq!(cfg.markers.len(), 2);
        let wall = cfg.marker("wall").unwrap();
        assert_eq!(wall.kind, BcKind::IsothermalWall);
        assert_eq!(wall.isothermal_temperature, 1000.0);
        assert_eq!(wall.monitor_weight, 1.0);
    }

    #[test]
    fn unknown_key_is_fatal() {
        assert!(Config::from_str_table("NOT_A_KEY = 1").is_err());
    }

    #[test]
    fn bad_enum_is_fatal() {
        assert!(Config::from_str_table("KIND_UPWIND = MAGIC").is_err());
    }

    #[test]
    fn ionized_species_rejected() {
        let text = "GAS_SPECIES = ( N2, N2+ )\nFREESTREAM_MASSFRAC = ( 0.9, 0.1 )";
        let err = Config::from_str_table(text).unwrap_err();
        assert!(err.to_string().contains("ionized"));
    }

    #[test]
    fn massfrac_mismatch_rejected() {
        let text = "GAS_SPECIES = ( N2, O2 )\nFREESTREAM_MASSFRAC = ( 1.0 )";
        assert!(Config::from_str_table(text).is_err());
    }
}
