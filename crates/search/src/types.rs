//! Core types for a tuning session.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use ternary_common::{BestConfig, KernelArch, TilePlan, TuneError};

/// How candidates are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// A handful of curated plans.
    Quick,
    /// Enumerated sweep, capped by `max_candidates`.
    Full,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Quick => "quick",
            Self::Full => "full",
        })
    }
}

impl FromStr for SearchMode {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(Self::Quick),
            "full" => Ok(Self::Full),
            other => Err(TuneError::Setup(format!(
                "unknown search mode '{other}' (expected quick or full)"
            ))),
        }
    }
}

/// One throughput reading of the workload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub tokens_per_second: f64,
    /// `± y` of a bench table row, when reported.
    pub spread: Option<f64>,
}

impl Measurement {
    pub fn new(tokens_per_second: f64) -> Self {
        Self {
            tokens_per_second,
            spread: None,
        }
    }
}

/// Pipeline stage a candidate failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Validate,
    Build,
    Benchmark,
    Confirm,
}

/// Why a candidate is not eligible for ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFailure {
    pub stage: Stage,
    pub message: String,
}

impl CandidateFailure {
    pub fn new(stage: Stage, err: &TuneError) -> Self {
        Self {
            stage,
            message: err.to_string(),
        }
    }
}

/// Outcome of benchmarking one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    /// Generation order; the last tie-breaker.
    pub index: usize,
    pub plan: TilePlan,
    /// Mean of `measurements`; 0.0 when nothing was measured.
    pub tokens_per_second: f64,
    pub measurements: Vec<f64>,
    pub valid: bool,
    pub failure: Option<CandidateFailure>,
}

impl BenchmarkResult {
    pub fn measured(index: usize, plan: TilePlan, m: Measurement) -> Self {
        Self {
            index,
            plan,
            tokens_per_second: m.tokens_per_second,
            measurements: vec![m.tokens_per_second],
            valid: true,
            failure: None,
        }
    }

    pub fn failed(index: usize, plan: TilePlan, failure: CandidateFailure) -> Self {
        Self {
            index,
            plan,
            tokens_per_second: 0.0,
            measurements: Vec::new(),
            valid: false,
            failure: Some(failure),
        }
    }

    /// Mark invalid, keeping whatever was measured for the report.
    pub fn invalidate(&mut self, failure: CandidateFailure) {
        self.valid = false;
        self.failure = Some(failure);
    }

    /// Append a reading and refresh the mean.
    pub fn add_measurement(&mut self, tps: f64) {
        self.measurements.push(tps);
        self.tokens_per_second = self.measurements.iter().sum::<f64>() / self.measurements.len() as f64;
    }
}

/// Controller state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Init,
    GeneratingCandidates,
    Validating,
    Emitting,
    Building,
    Benchmarking,
    Ranking,
    Persisted,
    NoValidConfig,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Persisted | Self::NoValidConfig | Self::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionOutcome {
    Persisted { best: BestConfig },
    NoValidConfig { attempted: usize },
    Cancelled,
}

impl SessionOutcome {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Persisted { .. } => 0,
            Self::NoValidConfig { .. } => 2,
            Self::Cancelled => 130,
        }
    }
}

/// Everything a session did, for logging and `--report` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub mode: SearchMode,
    pub arch: KernelArch,
    pub profile: String,
    pub outcome: SessionOutcome,
    pub results: Vec<BenchmarkResult>,
    pub transitions: Vec<SessionState>,
    pub elapsed_secs: f64,
}

impl SessionReport {
    pub fn valid_count(&self) -> usize {
        self.results.iter().filter(|r| r.valid).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_over_measurements() {
        let plan = TilePlan::uniform(KernelArch::Mad, 1, (160, 96, 32));
        let mut r = BenchmarkResult::measured(0, plan, Measurement::new(20.0));
        r.add_measurement(22.0);
        r.add_measurement(24.0);
        assert_eq!(r.tokens_per_second, 22.0);
        r.invalidate(CandidateFailure {
            stage: Stage::Confirm,
            message: "timed out".into(),
        });
        assert!(!r.valid);
        assert_eq!(r.measurements.len(), 3);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(SessionOutcome::Cancelled.exit_code(), 130);
        assert_eq!(SessionOutcome::NoValidConfig { attempted: 4 }.exit_code(), 2);
        assert_eq!("full".parse::<SearchMode>().unwrap(), SearchMode::Full);
        assert!("fast".parse::<SearchMode>().is_err());
    }
}
