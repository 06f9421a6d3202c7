//! Tuner configuration.
//!
//! Serialised as JSON. Every field has a default, so `{}` is a valid config
//! that tunes the 3B profile against a llama.cpp-style build tree in the
//! current directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TuneError};
use crate::tiling::KernelArch;

/// Top-level tuner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    // ── Build tree ──────────────────────────────────────────────────────────
    /// Root of the host build tree; relative paths below resolve against it.
    pub base_dir: PathBuf,
    /// Model used by the benchmark workload.
    pub model_path: PathBuf,
    /// Built-in profile name or path to a profile JSON.
    pub profile: String,
    /// Kernel family; `None` picks the host's.
    pub arch: Option<KernelArch>,
    /// Where the emitted kernel header goes.
    pub kernel_header: PathBuf,
    /// Key/value mirror read by the kernel-generation step.
    pub kernel_ini: PathBuf,
    /// Directory holding `best_kernel_config.json`.
    pub store_dir: PathBuf,

    // ── Build ───────────────────────────────────────────────────────────────
    /// Program and arguments that rebuild the runtime binary.
    pub build_command: Vec<String>,
    pub build_timeout_secs: u64,

    // ── Workload / search ───────────────────────────────────────────────────
    pub run: RunSettings,
    pub search: SearchKnobs,
}

/// Which report format the workload binary prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadKind {
    /// `llama-bench` style: markdown table with a `tg<N>` row.
    Bench,
    /// `llama-cli` style: perf log with `eval time ... tokens per second`.
    Cli,
}

/// The fixed canonical workload. Passed explicitly to the harness; nothing
/// here is read from or written to the process environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub kind: WorkloadKind,
    /// Workload binary, relative to `base_dir` unless absolute.
    pub binary: PathBuf,
    /// Prompt text (CLI workload only).
    pub prompt: String,
    /// Prompt length in tokens (bench workload only).
    pub prompt_tokens: usize,
    /// Tokens to generate.
    pub gen_tokens: usize,
    /// Repetitions inside one bench invocation.
    pub repetitions: usize,
    /// Compute threads of the benchmarked binary.
    pub threads: usize,
    pub timeout_secs: u64,
}

/// Search knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchKnobs {
    /// Upper bound on full-mode candidates.
    pub max_candidates: usize,
    /// Re-benchmark this many of the best candidates (0 = off).
    pub confirm_top_k: usize,
    /// Extra runs per confirmed candidate.
    pub confirm_runs: usize,
    /// Throughputs within this many tokens/s count as a tie.
    pub tie_tolerance: f64,
}

// ── Defaults ────────────────────────────────────────────────────────────────

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            model_path: PathBuf::from("models/BitNet-b1.58-2B-4T/ggml-model-i2_s.gguf"),
            profile: "bitnet_b1_58-3B".to_string(),
            arch: None,
            kernel_header: PathBuf::from("include/bitnet-lut-kernels.h"),
            kernel_ini: PathBuf::from("include/kernel_config.ini"),
            store_dir: PathBuf::from("."),
            build_command: vec!["bash".to_string(), "rebuild_bitnet.sh".to_string()],
            build_timeout_secs: 900,
            run: RunSettings::default(),
            search: SearchKnobs::default(),
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            kind: WorkloadKind::Bench,
            binary: PathBuf::from("build/bin/llama-bench"),
            prompt: "Explain quantum computing".to_string(),
            prompt_tokens: 512,
            gen_tokens: 128,
            repetitions: 3,
            threads: default_threads(),
            timeout_secs: 120,
        }
    }
}

impl Default for SearchKnobs {
    fn default() -> Self {
        Self {
            max_candidates: 24,
            confirm_top_k: 0,
            confirm_runs: 1,
            tie_tolerance: 0.0,
        }
    }
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl TunerConfig {
    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| TuneError::io(path, e))?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| TuneError::io(path, e))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Resolve a path against `base_dir` unless it is absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Kernel family to tune for.
    pub fn arch(&self) -> KernelArch {
        self.arch.unwrap_or_else(KernelArch::host)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_is_default() {
        let c: TunerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(c.profile, "bitnet_b1_58-3B");
        assert_eq!(c.run.kind, WorkloadKind::Bench);
        assert_eq!(c.run.gen_tokens, 128);
        assert_eq!(c.search.max_candidates, 24);
        assert_eq!(c.build_command, vec!["bash", "rebuild_bitnet.sh"]);
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let c: TunerConfig = serde_json::from_str(
            r#"{ "arch": "lut", "run": { "kind": "cli", "threads": 10 }, "search": { "confirm_top_k": 2 } }"#,
        )
        .unwrap();
        assert_eq!(c.arch(), KernelArch::Lut);
        assert_eq!(c.run.kind, WorkloadKind::Cli);
        assert_eq!(c.run.threads, 10);
        assert_eq!(c.run.timeout_secs, 120);
        assert_eq!(c.search.confirm_top_k, 2);
        assert_eq!(c.search.confirm_runs, 1);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tuner.json");
        let mut c = TunerConfig::default();
        c.base_dir = dir.path().to_path_buf();
        c.run.threads = 6;
        c.save(&path).unwrap();
        let back = TunerConfig::load(&path).unwrap();
        assert_eq!(back.run.threads, 6);
        assert_eq!(back.resolve(Path::new("include/x.h")), dir.path().join("include/x.h"));
    }
}
