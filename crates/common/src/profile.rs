//! Model profiles: which weight shapes a model's kernels cover, plus the
//! per-family defaults and curated quick-mode plans.
//!
//! Built-in profiles ship with the tuner; anything else is read from a JSON
//! file with the same layout:
//!
//! ```json
//! {
//!   "name": "my-model",
//!   "kernels": [[3200, 8640], [3200, 3200], [8640, 3200]],
//!   "default_lut": { "BM": [160, 320, 320], "BK": [64, 128, 64], "bm": [32, 64, 32] },
//!   "default_mad": { "BM": [160, 320, 320], "BK": [96, 96, 96], "bm": [32, 32, 32] }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TuneError};
use crate::tiling::{KernelArch, MatrixShape, TileLists, TilePlan};

/// Tensor-shape metadata of one model, as far as the kernels care.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    pub name: String,
    /// One entry per kernel instance, `[M, K]`.
    pub kernels: Vec<MatrixShape>,
    pub default_lut: TileLists,
    pub default_mad: TileLists,
    /// Curated quick-mode plans; empty means "use the generic list".
    #[serde(default)]
    pub quick_lut: Vec<TileLists>,
    #[serde(default)]
    pub quick_mad: Vec<TileLists>,
}

fn shapes(list: &[[usize; 2]]) -> Vec<MatrixShape> {
    list.iter()
        .filter_map(|&s| MatrixShape::try_from(s).ok())
        .collect()
}

fn lists(bm: &[usize], bk: &[usize], bmm: &[usize]) -> TileLists {
    TileLists {
        block_m: bm.to_vec(),
        block_k: bk.to_vec(),
        micro_m: bmm.to_vec(),
    }
}

/// Generic quick-mode tiles per family, used when a profile has none.
/// Callers keep only the ones legal for the profile's shapes.
const GENERIC_QUICK_LUT: [(usize, usize, usize); 6] = [
    (160, 64, 32),
    (128, 64, 32),
    (256, 128, 64),
    (320, 128, 64),
    (256, 64, 32),
    (512, 128, 32),
];
const GENERIC_QUICK_MAD: [(usize, usize, usize); 6] = [
    (160, 96, 32),
    (128, 128, 32),
    (256, 64, 32),
    (320, 96, 32),
    (256, 96, 32),
    (512, 96, 32),
];

impl ModelProfile {
    /// Names of the profiles compiled into the tuner.
    pub const BUILTIN: [&'static str; 3] = [
        "bitnet_b1_58-3B",
        "bitnet_b1_58-large",
        "Llama3-8B-1.58-100B-tokens",
    ];

    /// Look up a built-in profile by name.
    pub fn builtin(name: &str) -> Option<Self> {
        let profile = match name {
            "bitnet_b1_58-3B" => Self {
                name: name.to_string(),
                kernels: shapes(&[[3200, 8640], [3200, 3200], [8640, 3200]]),
                default_lut: lists(&[160, 320, 320], &[64, 128, 64], &[32, 64, 32]),
                default_mad: lists(&[160, 320, 320], &[96, 96, 96], &[32, 32, 32]),
                quick_lut: vec![
                    lists(&[160, 320, 320], &[64, 128, 64], &[32, 64, 32]),
                    lists(&[160, 160, 160], &[64, 64, 64], &[32, 32, 32]),
                    lists(&[320, 320, 320], &[64, 64, 64], &[64, 64, 64]),
                    lists(&[160, 320, 320], &[96, 128, 64], &[32, 32, 32]),
                ],
                quick_mad: vec![
                    lists(&[160, 160, 160], &[96, 96, 96], &[32, 32, 32]),
                    lists(&[160, 160, 160], &[128, 128, 128], &[32, 32, 32]),
                    lists(&[320, 320, 320], &[96, 96, 96], &[32, 32, 32]),
                    lists(&[160, 320, 320], &[64, 128, 64], &[32, 32, 32]),
                ],
            },
            "bitnet_b1_58-large" => Self {
                name: name.to_string(),
                kernels: shapes(&[[1536, 4096], [1536, 1536], [4096, 1536]]),
                default_lut: lists(&[256, 128, 256], &[128, 64, 128], &[32, 64, 32]),
                default_mad: lists(&[256, 128, 256], &[96, 96, 96], &[32, 32, 32]),
                quick_lut: vec![
                    lists(&[256, 128, 256], &[128, 64, 128], &[32, 64, 32]),
                    lists(&[128, 128, 128], &[64, 64, 64], &[32, 32, 32]),
                    lists(&[256, 256, 256], &[128, 128, 128], &[64, 64, 64]),
                    lists(&[512, 256, 512], &[64, 64, 64], &[32, 32, 32]),
                ],
                quick_mad: vec![
                    lists(&[256, 128, 256], &[96, 96, 96], &[32, 32, 32]),
                    lists(&[128, 128, 128], &[128, 128, 128], &[32, 32, 32]),
                    lists(&[256, 256, 256], &[64, 64, 64], &[32, 32, 32]),
                    lists(&[512, 256, 512], &[96, 96, 96], &[32, 32, 32]),
                ],
            },
            "Llama3-8B-1.58-100B-tokens" => Self {
                name: name.to_string(),
                kernels: shapes(&[[14336, 4096], [4096, 14336], [1024, 4096], [4096, 4096]]),
                default_lut: lists(&[256, 128, 256, 128], &[128, 64, 128, 64], &[32, 64, 32, 64]),
                default_mad: lists(&[256, 128, 256, 128], &[96, 96, 96, 96], &[32, 32, 32, 32]),
                quick_lut: vec![
                    lists(&[256, 128, 256, 128], &[128, 64, 128, 64], &[32, 64, 32, 64]),
                    lists(&[128, 128, 128, 128], &[64, 64, 64, 64], &[32, 32, 32, 32]),
                    lists(&[256, 256, 256, 256], &[128, 128, 128, 128], &[64, 64, 64, 64]),
                    lists(&[512, 512, 512, 512], &[128, 128, 128, 128], &[32, 32, 32, 32]),
                ],
                quick_mad: vec![
                    lists(&[256, 128, 256, 128], &[96, 96, 96, 96], &[32, 32, 32, 32]),
                    lists(&[128, 128, 128, 128], &[128, 128, 128, 128], &[32, 32, 32, 32]),
                    lists(&[256, 256, 256, 256], &[64, 64, 64, 64], &[32, 32, 32, 32]),
                    lists(&[512, 512, 512, 512], &[96, 96, 96, 96], &[32, 32, 32, 32]),
                ],
            },
            _ => return None,
        };
        Some(profile)
    }

    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| TuneError::io(path, e))?;
        let profile: Self = serde_json::from_str(&json)?;
        profile.check()?;
        Ok(profile)
    }

    /// Built-in name first, then a path to a JSON profile.
    pub fn resolve(name_or_path: &str) -> Result<Self> {
        if let Some(p) = Self::builtin(name_or_path) {
            return Ok(p);
        }
        let path = Path::new(name_or_path);
        if path.is_file() {
            return Self::load(path);
        }
        Err(TuneError::Profile(format!(
            "'{name_or_path}' is neither a built-in profile ({}) nor a profile file",
            Self::BUILTIN.join(", ")
        )))
    }

    /// Structural consistency: every list matches the kernel count.
    pub fn check(&self) -> Result<()> {
        if self.kernels.is_empty() {
            return Err(TuneError::Profile(format!("{}: no kernels", self.name)));
        }
        let n = self.kernels.len();
        let all = [&self.default_lut, &self.default_mad]
            .into_iter()
            .chain(self.quick_lut.iter())
            .chain(self.quick_mad.iter());
        for l in all {
            if l.block_m.len() != n || l.block_k.len() != n || l.micro_m.len() != n {
                return Err(TuneError::Profile(format!(
                    "{}: tile lists must have {n} entries, one per kernel",
                    self.name
                )));
            }
        }
        Ok(())
    }

    pub fn num_kernels(&self) -> usize {
        self.kernels.len()
    }

    /// Generic default plan for a family.
    pub fn default_plan(&self, arch: KernelArch) -> TilePlan {
        let lists = match arch {
            KernelArch::Lut => self.default_lut.clone(),
            KernelArch::Mad => self.default_mad.clone(),
        };
        TilePlan { arch, lists }
    }

    /// Curated quick-mode plans for a family; empty when the profile has none.
    pub fn curated_quick_plans(&self, arch: KernelArch) -> Vec<TilePlan> {
        let curated = match arch {
            KernelArch::Lut => &self.quick_lut,
            KernelArch::Mad => &self.quick_mad,
        };
        curated
            .iter()
            .map(|l| TilePlan {
                arch,
                lists: l.clone(),
            })
            .collect()
    }

    /// The default plan followed by the generic tiles, not yet checked
    /// against the profile's shapes.
    pub fn generic_quick_plans(&self, arch: KernelArch) -> Vec<TilePlan> {
        let generic: &[(usize, usize, usize)] = match arch {
            KernelArch::Lut => &GENERIC_QUICK_LUT,
            KernelArch::Mad => &GENERIC_QUICK_MAD,
        };
        std::iter::once(self.default_plan(arch))
            .chain(
                generic
                    .iter()
                    .map(|&t| TilePlan::uniform(arch, self.num_kernels(), t)),
            )
            .collect()
    }
}
