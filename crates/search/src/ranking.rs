//! Ranking of benchmark results.
//!
//! Only valid results are ranked, highest tokens/s first. Results within
//! `tie_tolerance` of the best tie; ties go to the plan closest to the prior
//! best for this family, then the smallest Σ BM×BK, then generation order.

use std::cmp::Ordering;

use ternary_common::TilePlan;

use crate::types::BenchmarkResult;

fn eligible(r: &BenchmarkResult) -> bool {
    r.valid && r.tokens_per_second.is_finite()
}

/// Valid results, best first.
pub fn rank<'a>(
    results: &'a [BenchmarkResult],
    prior: Option<&TilePlan>,
    tie_tolerance: f64,
) -> Vec<&'a BenchmarkResult> {
    let mut valid: Vec<&BenchmarkResult> = results.iter().filter(|r| eligible(r)).collect();
    valid.sort_by(|a, b| {
        b.tokens_per_second
            .partial_cmp(&a.tokens_per_second)
            .unwrap_or(Ordering::Equal)
            .then(a.index.cmp(&b.index))
    });
    let Some(top) = valid.first().map(|r| r.tokens_per_second) else {
        return valid;
    };

    let tol = tie_tolerance.max(0.0);
    let split = valid
        .iter()
        .position(|r| top - r.tokens_per_second > tol)
        .unwrap_or(valid.len());
    let tie_key = |r: &BenchmarkResult| {
        (
            prior
                .and_then(|p| r.plan.distance(p))
                .unwrap_or(usize::MAX),
            r.plan.footprint(),
            r.index,
        )
    };
    valid[..split].sort_by_key(|r| tie_key(*r));
    valid
}

/// The winner, if any result is valid.
pub fn select_best<'a>(
    results: &'a [BenchmarkResult],
    prior: Option<&TilePlan>,
    tie_tolerance: f64,
) -> Option<&'a BenchmarkResult> {
    rank(results, prior, tie_tolerance).into_iter().next()
}
