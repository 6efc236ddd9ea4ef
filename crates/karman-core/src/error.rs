// crates/karman-core/src/error.rs

//! Fatal error taxonomy.
//!
//! Only unrecoverable conditions become `Err` values: configuration and mesh
//! setup problems, communication failures, and I/O on required files.
//! Recoverable numerical conditions (non-physical states, kernel NaNs,
//! linear-solver iteration caps) are represented as counters and status
//! values so the outer loop can continue.

use thiserror::Error;

/// Fatal failures, grouped by originating component.
#[derive(Debug, Error)]
pub enum KarmanError {
    /// Invalid or inconsistent configuration; fatal at startup.
    #[error("configuration: {0}")]
    Config(String),

    /// Mesh setup failure (unmatched face connectivity, halo gap, bad time level).
    #[error("mesh: {0}")]
    Mesh(String),

    /// Rank-to-rank exchange failure.
    #[error("communication: {0}")]
    Comm(String),

    /// Required file missing or corrupt.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Arithmetic failure the guards could not recover from.
    #[error("arithmetic: {0}")]
    Arithmetic(String),
}

impl KarmanError {
    /// Process exit code per the CLI contract: 1 for configuration/mesh/IO,
    /// 2 for unrecoverable arithmetic failures.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Arithmetic(_) => 2,
            _ => 1,
        }
    }
}

/// Shorthand used by setup paths in this workspace.
pub type CoreResult<T> = std::result::Result<T, KarmanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_cli_contract() {
        assert_eq!(KarmanError::Config("x".into()).exit_code(), 1);
        assert_eq!(KarmanError::Mesh("x".into()).exit_code(), 1);
        assert_eq!(KarmanError::Arithmetic("x".into()).exit_code(), 2);
    }
}
