//! # ternary-search: Tuning Engine
//!
//! Measures candidate tile plans on the host and keeps the fastest.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`candidates`] | quick and full candidate generation |
//! | [`harness`] | `BenchmarkHarness`, `ProcessHarness` (build + run under timeouts) |
//! | [`report`] | throughput report parsing |
//! | [`ranking`] | ranking and tie-break |
//! | [`workspace`] | `BuildTreeGuard` |
//! | [`coordinator`] | `Controller` session state machine, `CancelFlag` |
//! | [`types`] | results, states, outcomes |

pub mod candidates;
pub mod coordinator;
pub mod harness;
pub mod ranking;
pub mod report;
pub mod types;
pub mod workspace;

pub use coordinator::{CancelFlag, Controller};
pub use harness::{BenchmarkHarness, ProcessHarness, CFLAGS_ENV};
pub use ranking::{rank, select_best};
pub use report::{parse_throughput, ReportFormat, REPORT_FORMAT_VERSION};
pub use types::{
    BenchmarkResult, CandidateFailure, Measurement, SearchMode, SessionOutcome, SessionReport,
    SessionState, Stage,
};
pub use workspace::BuildTreeGuard;
