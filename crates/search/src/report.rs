//! Throughput report parsing (format version 1).
//!
//! Two shapes of workload output are understood:
//!
//! ```text
//! bench-table  | bitnet 3B I2_S | ... | tg128 |  24.01 ± 0.12 |
//! perf-log     llama_perf_context_print: eval time = 5000.00 ms / 127 runs (39.37 ms per token, 25.40 tokens per second)
//! ```
//!
//! The bench row is the one whose test column starts with `tg`; the
//! perf-log line is the last `eval time` line that is not `prompt eval time`.

use ternary_common::{Result, TuneError, WorkloadKind};

use crate::types::Measurement;

/// Version of the report grammar below.
pub const REPORT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    BenchTable,
    PerfLog,
}

impl From<WorkloadKind> for ReportFormat {
    fn from(kind: WorkloadKind) -> Self {
        match kind {
            WorkloadKind::Bench => Self::BenchTable,
            WorkloadKind::Cli => Self::PerfLog,
        }
    }
}

/// Extract generation throughput from the workload's combined output.
pub fn parse_throughput(format: ReportFormat, output: &str) -> Result<Measurement> {
    let m = match format {
        ReportFormat::BenchTable => parse_bench_table(output),
        ReportFormat::PerfLog => parse_perf_log(output),
    }
    .ok_or_else(|| {
        TuneError::BenchmarkParseFailure(format!(
            "no {} throughput found (report format v{REPORT_FORMAT_VERSION}); output tail: {}",
            match format {
                ReportFormat::BenchTable => "tg row",
                ReportFormat::PerfLog => "eval time",
            },
            tail(output, 3)
        ))
    })?;
    if !m.tokens_per_second.is_finite() || m.tokens_per_second <= 0.0 {
        return Err(TuneError::BenchmarkParseFailure(format!(
            "implausible throughput {}",
            m.tokens_per_second
        )));
    }
    Ok(m)
}

fn cells(line: &str) -> Vec<&str> {
    line.trim()
        .trim_matches('|')
        .split('|')
        .map(str::trim)
        .collect()
}

fn parse_bench_table(output: &str) -> Option<Measurement> {
    let mut test_col = None;
    let mut found = None;
    for line in output.lines().filter(|l| l.trim_start().starts_with('|')) {
        let row = cells(line);
        if let Some(i) = row.iter().position(|c| *c == "test") {
            test_col = Some(i);
            continue;
        }
        let is_tg = match test_col {
            Some(i) => row.get(i).is_some_and(|c| c.starts_with("tg")),
            None => row.iter().any(|c| c.starts_with("tg")),
        };
        if !is_tg {
            continue;
        }
        let Some(last) = row.iter().rev().find(|c| !c.is_empty()) else {
            continue;
        };
        if let Some(m) = parse_plus_minus(last) {
            found = Some(m);
        }
    }
    found
}

/// `"24.01 ± 0.12"`.
fn parse_plus_minus(cell: &str) -> Option<Measurement> {
    let (mean, spread) = cell.split_once('±')?;
    Some(Measurement {
        tokens_per_second: mean.trim().parse().ok()?,
        spread: Some(spread.trim().parse().ok()?),
    })
}

fn parse_perf_log(output: &str) -> Option<Measurement> {
    output
        .lines()
        .filter(|l| l.contains("eval time") && !l.contains("prompt eval time"))
        .filter_map(|l| {
            let (before, _) = l.split_once("tokens per second")?;
            let number = before
                .split(|c: char| c.is_whitespace() || c == ',' || c == '(')
                .filter(|t| !t.is_empty())
                .last()?;
            number.parse::<f64>().ok().map(Measurement::new)
        })
        .last()
}

fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(n)..].join(" / ")
}
