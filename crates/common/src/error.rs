//! Error type shared by every crate in the workspace.
//!
//! Only [`TuneError::NoValidConfiguration`] and [`TuneError::Quantization`]
//! are meant to reach the caller of a tuning session. The candidate-local
//! kinds are recorded on the benchmark result and the session moves on.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used by the library crates.
pub type Result<T> = std::result::Result<T, TuneError>;

/// Everything that can go wrong while tuning.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TuneError {
    /// Illegal tiling for the target shape / instruction-set family.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// The emitter was handed something it cannot emit. Indicates a bug.
    #[error("kernel emission failed: {0}")]
    EmissionFailure(String),

    /// The host build system rejected the generated source.
    #[error("build failed (exit {status:?}): {diagnostic}")]
    BuildFailure {
        /// Exit code, `None` when killed by a signal.
        status: Option<i32>,
        /// Tail of the compiler output.
        diagnostic: String,
    },

    /// A build or benchmark step exceeded its time budget.
    #[error("{stage} timed out after {secs}s")]
    BenchmarkTimeout {
        /// `"build"` or `"benchmark"`.
        stage: &'static str,
        /// Budget that was exceeded.
        secs: u64,
    },

    /// The workload ran but its throughput report could not be read.
    #[error("could not parse throughput report: {0}")]
    BenchmarkParseFailure(String),

    /// The workload binary failed to start or exited non-zero.
    #[error("benchmark run failed: {0}")]
    BenchmarkRun(String),

    /// Every candidate of a session was illegal or failed.
    #[error("no valid kernel configuration among {attempted} candidates")]
    NoValidConfiguration {
        /// Number of candidates tried.
        attempted: usize,
    },

    /// Malformed or non-ternary weight data.
    #[error("quantization error: {0}")]
    Quantization(String),

    /// Matrix shape unusable for packed ternary weights.
    #[error("invalid matrix shape {m}x{k}: {reason}")]
    InvalidShape {
        /// Rows.
        m: usize,
        /// Columns.
        k: usize,
        /// Why it was rejected.
        reason: String,
    },

    /// Failure inside the tensor runtime while building reference tensors.
    #[error("tensor error: {0}")]
    Tensor(String),

    /// Unknown or inconsistent model profile.
    #[error("model profile error: {0}")]
    Profile(String),

    /// Missing prerequisite (model file, bench binary, ...).
    #[error("setup error: {0}")]
    Setup(String),

    /// I/O error with the path involved.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// (De)serialisation error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TuneError {
    /// Wrap an [`std::io::Error`] together with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors that only disqualify one candidate and never end a session.
    pub fn is_candidate_local(&self) -> bool {
        matches!(
            self,
            Self::ConstraintViolation(_)
                | Self::BuildFailure { .. }
                | Self::BenchmarkTimeout { .. }
                | Self::BenchmarkParseFailure(_)
                | Self::BenchmarkRun(_)
        )
    }
}
