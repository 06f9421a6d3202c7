//! Configuration store: the winning tiling of the last successful session.
//!
//! Two files are written, each replace-on-success (temp file, `fsync`,
//! rename), so a reader only ever sees a complete old or complete new copy:
//!
//! * `best_kernel_config.json`: the full [`BestConfig`] record.
//! * `kernel_config.ini`: the key/value mirror read by the build system's
//!   kernel-generation step:
//!
//! ```text
//! [Kernels_0]
//! m = 3200
//! k = 8640
//! bm = 160
//! bk = 64
//! bmm = 32
//! ```

use std::fmt::Write as _;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TuneError};
use crate::profile::ModelProfile;
use crate::tiling::{KernelArch, MatrixShape, TileLists, TilePlan};

/// File name of the JSON record inside the store directory.
pub const BEST_CONFIG_FILE: &str = "best_kernel_config.json";
/// Current record layout.
pub const BEST_CONFIG_VERSION: u32 = 1;

/// Persisted outcome of a tuning session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestConfig {
    pub version: u32,
    pub model: String,
    pub arch: KernelArch,
    /// `std::env::consts::ARCH` of the tuning host.
    pub host_arch: String,
    pub kernels: Vec<MatrixShape>,
    pub config: TileLists,
    pub tokens_per_second: f64,
    pub timestamp: DateTime<Utc>,
}

impl BestConfig {
    pub fn new(profile: &ModelProfile, plan: &TilePlan, tokens_per_second: f64) -> Self {
        Self {
            version: BEST_CONFIG_VERSION,
            model: profile.name.clone(),
            arch: plan.arch,
            host_arch: std::env::consts::ARCH.to_string(),
            kernels: profile.kernels.clone(),
            config: plan.lists.clone(),
            tokens_per_second,
            timestamp: Utc::now(),
        }
    }

    pub fn plan(&self) -> TilePlan {
        TilePlan {
            arch: self.arch,
            lists: self.config.clone(),
        }
    }

    /// Whether this record was tuned for `profile` on family `arch`.
    pub fn matches(&self, profile: &ModelProfile, arch: KernelArch) -> bool {
        self.model == profile.name && self.arch == arch && self.kernels == profile.kernels
    }
}

/// Render the key/value mirror for a plan.
pub fn render_kernel_ini(kernels: &[MatrixShape], plan: &TilePlan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "; ternary kernel tiling ({})", plan.arch);
    for (i, (shape, tile)) in kernels.iter().zip(plan.tiles()).enumerate() {
        let _ = writeln!(out);
        let _ = writeln!(out, "[Kernels_{i}]");
        let _ = writeln!(out, "m = {}", shape.m());
        let _ = writeln!(out, "k = {}", shape.k());
        let _ = writeln!(out, "bm = {}", tile.block_m);
        let _ = writeln!(out, "bk = {}", tile.block_k);
        let _ = writeln!(out, "bmm = {}", tile.micro_m);
    }
    out
}

/// Write `bytes` to `path` so readers never observe a partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| TuneError::io(parent, e))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp-{}", std::process::id()));
    {
        let mut f = File::create(&tmp).map_err(|e| TuneError::io(&tmp, e))?;
        f.write_all(bytes).map_err(|e| TuneError::io(&tmp, e))?;
        f.sync_all().map_err(|e| TuneError::io(&tmp, e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        TuneError::io(path, e)
    })
}

/// Durable home of the [`BestConfig`].
#[derive(Debug, Clone)]
pub struct ConfigStore {
    json_path: PathBuf,
    ini_path: PathBuf,
}

impl ConfigStore {
    /// `dir` holds the JSON record; `ini_path` is the build system's mirror.
    pub fn new(dir: &Path, ini_path: &Path) -> Self {
        Self {
            json_path: dir.join(BEST_CONFIG_FILE),
            ini_path: ini_path.to_path_buf(),
        }
    }

    pub fn json_path(&self) -> &Path {
        &self.json_path
    }

    pub fn ini_path(&self) -> &Path {
        &self.ini_path
    }

    /// `Ok(None)` when no session has succeeded yet.
    pub fn load(&self) -> Result<Option<BestConfig>> {
        let json = match std::fs::read_to_string(&self.json_path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TuneError::io(&self.json_path, e)),
        };
        let best: BestConfig = serde_json::from_str(&json)?;
        best.plan().check_lengths()?;
        if best.version > BEST_CONFIG_VERSION {
            return Err(TuneError::Profile(format!(
                "{} has record version {}, this tuner understands up to {}",
                self.json_path.display(),
                best.version,
                BEST_CONFIG_VERSION
            )));
        }
        Ok(Some(best))
    }

    /// Replace the stored record, then its mirror. A failed record write
    /// leaves both files untouched.
    pub fn save(&self, best: &BestConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(best)?;
        write_atomic(&self.json_path, json.as_bytes())?;
        let ini = render_kernel_ini(&best.kernels, &best.plan());
        write_atomic(&self.ini_path, ini.as_bytes())?;
        tracing::info!(
            path = %self.json_path.display(),
            arch = %best.arch,
            tokens_per_second = format!("{:.2}", best.tokens_per_second),
            "Best configuration stored"
        );
        Ok(())
    }

    /// Plan the build pipeline should generate: the stored one when it was
    /// tuned for this profile and family, else the family default.
    pub fn resolve_plan(&self, profile: &ModelProfile, arch: KernelArch) -> Result<TilePlan> {
        match self.load()? {
            Some(best) if best.matches(profile, arch) => Ok(best.plan()),
            Some(best) => {
                tracing::warn!(
                    stored_model = %best.model,
                    stored_arch = %best.arch,
                    "Stored configuration does not match; using default"
                );
                Ok(profile.default_plan(arch))
            }
            None => Ok(profile.default_plan(arch)),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ModelProfile {
        ModelProfile::builtin("bitnet_b1_58-3B").unwrap()
    }

    #[test]
    fn absent_store_loads_none_and_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path(), &dir.path().join("include/kernel_config.ini"));
        assert!(store.load().unwrap().is_none());
        let plan = store.resolve_plan(&profile(), KernelArch::Mad).unwrap();
        assert_eq!(plan, profile().default_plan(KernelArch::Mad));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path(), &dir.path().join("include/kernel_config.ini"));
        let plan = TilePlan::uniform(KernelArch::Mad, 3, (320, 96, 32));
        let best = BestConfig::new(&profile(), &plan, 24.0);
        store.save(&best).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, best);
        assert_eq!(store.resolve_plan(&profile(), KernelArch::Mad).unwrap(), plan);
        // Other family falls back to its default.
        assert_eq!(
            store.resolve_plan(&profile(), KernelArch::Lut).unwrap(),
            profile().default_plan(KernelArch::Lut)
        );

        let ini = std::fs::read_to_string(store.ini_path()).unwrap();
        assert!(ini.contains("[Kernels_2]"));
        assert!(ini.contains("m = 8640"));
        assert!(ini.contains("bk = 96"));
        // No temp files left behind.
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn overwrite_replaces_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path(), &dir.path().join("kernel_config.ini"));
        let first = BestConfig::new(&profile(), &TilePlan::uniform(KernelArch::Mad, 3, (160, 96, 32)), 18.0);
        let second = BestConfig::new(&profile(), &TilePlan::uniform(KernelArch::Mad, 3, (320, 96, 32)), 21.0);
        store.save(&first).unwrap();
        store.save(&second).unwrap();
        assert_eq!(store.load().unwrap().unwrap().tokens_per_second, 21.0);
    }

    #[test]
    fn failed_record_write_leaves_mirror_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path(), &dir.path().join("kernel_config.ini"));
        // A non-empty directory where the record goes makes the rename fail.
        std::fs::create_dir(store.json_path()).unwrap();
        std::fs::write(store.json_path().join("keep"), "x").unwrap();

        let best = BestConfig::new(&profile(), &TilePlan::uniform(KernelArch::Mad, 3, (320, 96, 32)), 21.0);
        assert!(store.save(&best).is_err());
        assert!(!store.ini_path().exists());
    }

    #[test]
    fn malformed_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path(), &dir.path().join("kernel_config.ini"));
        std::fs::write(store.json_path(), "{ not json").unwrap();
        assert!(store.load().is_err());
    }

    #[test]
    fn ini_layout() {
        let kernels = profile().kernels;
        let plan = profile().default_plan(KernelArch::Lut);
        let ini = render_kernel_ini(&kernels, &plan);
        let expected_first = "[Kernels_0]\nm = 3200\nk = 8640\nbm = 160\nbk = 64\nbmm = 32\n";
        assert!(ini.contains(expected_first));
        assert_eq!(ini.matches("[Kernels_").count(), 3);
    }
}
