//! Tuning session controller.
//!
//! ```text
//! Init → GeneratingCandidates → (Validating → Emitting → Building → Benchmarking)*
//!      → Ranking → Persisted | NoValidConfig          (Cancelled from any stage)
//! ```
//!
//! Supports both synchronous [`run`](Controller::run) and tokio-based
//! [`run_async`](Controller::run_async). The async path runs the session in
//! [`tokio::task::spawn_blocking`]; the process harness drives its children
//! through a runtime handle from that thread.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use ternary_codegen::{emit_plan_cached, EmitCache};
use ternary_common::{
    BestConfig, ConfigStore, KernelArch, ModelProfile, Result, SearchKnobs, TilePlan, TuneError,
};
use ternary_core::validate_plan;

use crate::candidates;
use crate::harness::BenchmarkHarness;
use crate::ranking::{rank, select_best};
use crate::types::{
    BenchmarkResult, CandidateFailure, SearchMode, SessionOutcome, SessionReport, SessionState,
    Stage,
};
use crate::workspace::BuildTreeGuard;

/// Rows of the final result table.
const TABLE_ROWS: usize = 5;

// ── CancelFlag ──────────────────────────────────────────────────────────────

/// Shared user-interrupt flag, checked before every stage.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Set the flag on Ctrl-C. Must be called inside a tokio runtime.
    pub fn watch_ctrl_c(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; finishing current step and stopping");
                flag.cancel();
            }
        });
    }
}

// ── Controller ──────────────────────────────────────────────────────────────

/// Owns all state of one tuning session.
pub struct Controller<H> {
    profile: ModelProfile,
    arch: KernelArch,
    mode: SearchMode,
    knobs: SearchKnobs,
    store: ConfigStore,
    harness: H,
    cancel: CancelFlag,
    cache: EmitCache,
    guarded: Vec<PathBuf>,
    apply: bool,
    progress: bool,
    transitions: Vec<SessionState>,
    /// A candidate build touched the tree since it was last rebuilt.
    tree_dirty: bool,
}

impl<H: BenchmarkHarness> Controller<H> {
    pub fn new(
        profile: ModelProfile,
        arch: KernelArch,
        mode: SearchMode,
        store: ConfigStore,
        harness: H,
    ) -> Self {
        Self {
            profile,
            arch,
            mode,
            knobs: SearchKnobs::default(),
            store,
            harness,
            cancel: CancelFlag::new(),
            cache: EmitCache::default(),
            guarded: Vec::new(),
            apply: false,
            progress: false,
            transitions: Vec::new(),
            tree_dirty: false,
        }
    }

    pub fn with_knobs(mut self, knobs: SearchKnobs) -> Self {
        self.knobs = knobs;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build-tree files to snapshot at start and restore at the end.
    pub fn guard_files(mut self, paths: Vec<PathBuf>) -> Self {
        self.guarded = paths;
        self
    }

    /// Install and rebuild the winner after the tree is restored.
    pub fn with_apply(mut self, apply: bool) -> Self {
        self.apply = apply;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn harness(&self) -> &H {
        &self.harness
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.transitions.last(), to = %next, "Session transition");
        self.transitions.push(next);
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} candidates {msg}")
            .map(|s| s.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb
    }

    /// Stored plan for this profile and family, used to break ties.
    fn prior_plan(&self) -> Option<TilePlan> {
        match self.store.load() {
            Ok(Some(best)) if best.matches(&self.profile, self.arch) => Some(best.plan()),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable stored configuration");
                None
            }
        }
    }

    /// Run one session to a terminal state.
    ///
    /// Candidate-local failures are recorded on their results; only fatal
    /// errors (emission defects, I/O on the tree or store, harness setup)
    /// come back as `Err`. Unless a winner is applied, the tree is rebuilt
    /// from its restored sources once any candidate was built.
    pub fn run(&mut self) -> Result<SessionReport> {
        self.tree_dirty = false;
        let result = self.run_session();
        if result.is_err() {
            // The guard has put the original sources back by now.
            self.rebuild_restored();
        }
        result
    }

    fn run_session(&mut self) -> Result<SessionReport> {
        let start = Instant::now();
        self.transitions.clear();
        self.transition(SessionState::Init);
        self.profile.check()?;
        let mut guard = BuildTreeGuard::snapshot(&self.guarded)?;
        let prior = self.prior_plan();

        self.transition(SessionState::GeneratingCandidates);
        let plans = candidates::generate(&self.profile, self.arch, self.mode, self.knobs.max_candidates);
        info!(
            mode = %self.mode,
            arch = %self.arch,
            profile = %self.profile.name,
            candidates = plans.len(),
            "Tuning session started"
        );

        let pb = self.progress_bar(plans.len());
        let mut results = Vec::with_capacity(plans.len());
        for (index, plan) in plans.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                pb.abandon();
                return self.finish_cancelled(results, &mut guard, start);
            }
            pb.set_message(plan.key());
            let result = self.evaluate(index, plan)?;
            results.push(result);
            pb.inc(1);
        }
        pb.finish_with_message("done");

        self.confirm(&mut results, prior.as_ref())?;
        if self.cancel.is_cancelled() {
            return self.finish_cancelled(results, &mut guard, start);
        }

        self.transition(SessionState::Ranking);
        let best = select_best(&results, prior.as_ref(), self.knobs.tie_tolerance).cloned();
        self.log_table(&results, prior.as_ref());
        guard.restore()?;
        self.harness.invalidate();
        if self.apply && best.is_some() {
            self.tree_dirty = false;
        } else {
            self.rebuild_restored();
        }

        let outcome = match best {
            None => {
                warn!(attempted = results.len(), "No valid kernel configuration; store left untouched");
                self.transition(SessionState::NoValidConfig);
                SessionOutcome::NoValidConfig {
                    attempted: results.len(),
                }
            }
            Some(winner) => {
                let record = BestConfig::new(&self.profile, &winner.plan, winner.tokens_per_second);
                self.store.save(&record)?;
                if self.apply {
                    let bundle = emit_plan_cached(&self.cache, &winner.plan, &self.profile.kernels)?;
                    self.harness.build(&bundle)?;
                    info!(plan = %winner.plan, "Winning configuration applied");
                }
                self.transition(SessionState::Persisted);
                SessionOutcome::Persisted { best: record }
            }
        };
        Ok(self.report(outcome, results, start))
    }

    /// Validate → emit → build → benchmark one candidate.
    fn evaluate(&mut self, index: usize, plan: TilePlan) -> Result<BenchmarkResult> {
        self.transition(SessionState::Validating);
        if let Some(reason) = validate_plan(&plan, &self.profile.kernels).reason() {
            let err = TuneError::ConstraintViolation(reason);
            warn!(index, plan = %plan, error = %err, "Candidate rejected");
            return Ok(BenchmarkResult::failed(
                index,
                plan,
                CandidateFailure::new(Stage::Validate, &err),
            ));
        }

        self.transition(SessionState::Emitting);
        let bundle = emit_plan_cached(&self.cache, &plan, &self.profile.kernels)?;

        self.transition(SessionState::Building);
        self.tree_dirty = true;
        if let Err(e) = self.harness.build(&bundle) {
            return candidate_error(index, plan, Stage::Build, e);
        }

        self.transition(SessionState::Benchmarking);
        match self.harness.run() {
            Ok(m) => {
                info!(
                    index,
                    plan = %plan,
                    tokens_per_second = format!("{:.2}", m.tokens_per_second),
                    "Candidate measured"
                );
                Ok(BenchmarkResult::measured(index, plan, m))
            }
            Err(e) => candidate_error(index, plan, Stage::Benchmark, e),
        }
    }

    /// Re-benchmark the current top candidates; their score becomes the mean
    /// of every measurement, and a failed re-run invalidates them.
    fn confirm(&mut self, results: &mut [BenchmarkResult], prior: Option<&TilePlan>) -> Result<()> {
        let (top_k, runs) = (self.knobs.confirm_top_k, self.knobs.confirm_runs);
        if top_k == 0 || runs == 0 {
            return Ok(());
        }
        let top: Vec<usize> = rank(results, prior, self.knobs.tie_tolerance)
            .iter()
            .take(top_k)
            .map(|r| r.index)
            .collect();

        for index in top {
            let Some(pos) = results.iter().position(|r| r.index == index) else {
                continue;
            };
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let plan = results[pos].plan.clone();
            let bundle = emit_plan_cached(&self.cache, &plan, &self.profile.kernels)?;
            self.transition(SessionState::Building);
            self.tree_dirty = true;
            if let Err(e) = self.harness.build(&bundle) {
                if !e.is_candidate_local() {
                    return Err(e);
                }
                warn!(index, error = %e, "Confirmation build failed");
                results[pos].invalidate(CandidateFailure::new(Stage::Confirm, &e));
                continue;
            }
            for _ in 0..runs {
                self.transition(SessionState::Benchmarking);
                match self.harness.run() {
                    Ok(m) => results[pos].add_measurement(m.tokens_per_second),
                    Err(e) if e.is_candidate_local() => {
                        warn!(index, error = %e, "Confirmation run failed");
                        results[pos].invalidate(CandidateFailure::new(Stage::Confirm, &e));
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            debug!(
                index,
                runs = results[pos].measurements.len(),
                mean = results[pos].tokens_per_second,
                "Candidate confirmed"
            );
        }
        Ok(())
    }

    fn finish_cancelled(
        &mut self,
        results: Vec<BenchmarkResult>,
        guard: &mut BuildTreeGuard,
        start: Instant,
    ) -> Result<SessionReport> {
        warn!(completed = results.len(), "Session cancelled; nothing persisted");
        guard.restore()?;
        self.harness.invalidate();
        self.rebuild_restored();
        self.transition(SessionState::Cancelled);
        Ok(self.report(SessionOutcome::Cancelled, results, start))
    }

    /// Bring the binary back in line with the restored sources. A failure
    /// only warns; the session outcome stands.
    fn rebuild_restored(&mut self) {
        if !std::mem::take(&mut self.tree_dirty) {
            return;
        }
        match self.harness.rebuild() {
            Ok(()) => info!("Build tree rebuilt from its original kernels"),
            Err(e) => warn!(
                error = %e,
                "Rebuilding the restored tree failed; rebuild it before use"
            ),
        }
    }

    fn log_table(&self, results: &[BenchmarkResult], prior: Option<&TilePlan>) {
        let ranked = rank(results, prior, self.knobs.tie_tolerance);
        for (i, r) in ranked.iter().take(TABLE_ROWS).enumerate() {
            info!(
                rank = i + 1,
                plan = %r.plan,
                tokens_per_second = format!("{:.2}", r.tokens_per_second),
                runs = r.measurements.len(),
                "Result"
            );
        }
        let invalid = results.len() - ranked.len();
        if invalid > 0 {
            info!(invalid, "Candidates excluded from ranking");
        }
    }

    fn report(
        &self,
        outcome: SessionOutcome,
        results: Vec<BenchmarkResult>,
        start: Instant,
    ) -> SessionReport {
        SessionReport {
            mode: self.mode,
            arch: self.arch,
            profile: self.profile.name.clone(),
            outcome,
            results,
            transitions: self.transitions.clone(),
            elapsed_secs: start.elapsed().as_secs_f64(),
        }
    }
}

fn candidate_error(
    index: usize,
    plan: TilePlan,
    stage: Stage,
    err: TuneError,
) -> Result<BenchmarkResult> {
    if !err.is_candidate_local() {
        return Err(err);
    }
    warn!(index, plan = %plan, stage = ?stage, error = %err, "Candidate failed");
    Ok(BenchmarkResult::failed(
        index,
        plan,
        CandidateFailure::new(stage, &err),
    ))
}

impl<H: BenchmarkHarness + Send + 'static> Controller<H> {
    /// Run the session on the tokio runtime without blocking it.
    pub async fn run_async(mut self) -> Result<SessionReport> {
        tokio::task::spawn_blocking(move || self.run())
            .await
            .map_err(|e| TuneError::Setup(format!("session task join: {e}")))?
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
