//! Matrix shapes, kernel families and tiling points.
//!
//! A [`TileConfig`] is one tuning point for one kernel instance; a
//! [`TilePlan`] holds one tile per kernel instance of a model and is the unit
//! that gets built and benchmarked, since every instance lives in the same
//! binary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TuneError};

/// Ternary symbols per codec block. Packed rows are whole blocks.
pub const TERNARY_BLOCK_LEN: usize = 32;

// ── MatrixShape ─────────────────────────────────────────────────────────────

/// Dimensions of one weight matrix: `m` output rows, `k` reduction columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "[usize; 2]", into = "[usize; 2]")]
pub struct MatrixShape {
    m: usize,
    k: usize,
}

impl MatrixShape {
    pub fn new(m: usize, k: usize) -> Result<Self> {
        let reject = |reason: &str| TuneError::InvalidShape {
            m,
            k,
            reason: reason.to_string(),
        };
        if m == 0 || k == 0 {
            return Err(reject("dimensions must be non-zero"));
        }
        if k % TERNARY_BLOCK_LEN != 0 {
            return Err(reject("K must be a whole number of 32-symbol blocks"));
        }
        Ok(Self { m, k })
    }

    #[inline]
    pub fn m(&self) -> usize {
        self.m
    }

    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Codec blocks per row.
    #[inline]
    pub fn blocks_per_row(&self) -> usize {
        self.k / TERNARY_BLOCK_LEN
    }
}

impl TryFrom<[usize; 2]> for MatrixShape {
    type Error = TuneError;

    fn try_from([m, k]: [usize; 2]) -> Result<Self> {
        Self::new(m, k)
    }
}

impl From<MatrixShape> for [usize; 2] {
    fn from(s: MatrixShape) -> Self {
        [s.m, s.k]
    }
}

impl fmt::Display for MatrixShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.m, self.k)
    }
}

// ── KernelArch ──────────────────────────────────────────────────────────────

/// Kernel family / instruction-set class. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelArch {
    /// Lookup-table kernels (ARM NEON class hosts).
    Lut,
    /// Multiply-accumulate kernels (x86 AVX2 class hosts).
    Mad,
}

impl KernelArch {
    /// Family used on the machine we are running on.
    pub fn host() -> Self {
        Self::for_target_arch(std::env::consts::ARCH)
    }

    /// `arm*` / `aarch64` → LUT, everything else → MAD.
    pub fn for_target_arch(arch: &str) -> Self {
        if arch.starts_with("arm") || arch.starts_with("aarch64") {
            Self::Lut
        } else {
            Self::Mad
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Lut => "lut",
            Self::Mad => "mad",
        }
    }

    /// Allowed micro-tile sizes.
    pub fn micro_tiles(&self) -> &'static [usize] {
        match self {
            Self::Lut => &[32, 64],
            Self::Mad => &[32],
        }
    }
}

impl fmt::Display for KernelArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KernelArch {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lut" | "tl1" => Ok(Self::Lut),
            "mad" | "tl2" => Ok(Self::Mad),
            other => Err(TuneError::Setup(format!(
                "unknown kernel architecture '{other}' (expected lut or mad)"
            ))),
        }
    }
}

// ── TileConfig ──────────────────────────────────────────────────────────────

/// One tiling point for one kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileConfig {
    /// Outer row block (BM).
    #[serde(rename = "BM")]
    pub block_m: usize,
    /// Outer reduction block (BK).
    #[serde(rename = "BK")]
    pub block_k: usize,
    /// Micro-tile rows (bm).
    #[serde(rename = "bm")]
    pub micro_m: usize,
    pub arch: KernelArch,
}

impl TileConfig {
    pub fn new(arch: KernelArch, block_m: usize, block_k: usize, micro_m: usize) -> Self {
        Self {
            block_m,
            block_k,
            micro_m,
            arch,
        }
    }

    /// BM × BK, the resource-frugality measure.
    pub fn area(&self) -> usize {
        self.block_m * self.block_k
    }

    /// L1 distance over (BM, BK, bm).
    pub fn distance(&self, other: &TileConfig) -> usize {
        self.block_m.abs_diff(other.block_m)
            + self.block_k.abs_diff(other.block_k)
            + self.micro_m.abs_diff(other.micro_m)
    }
}

impl fmt::Display for TileConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.block_m, self.block_k, self.micro_m)
    }
}

// ── TileLists / TilePlan ────────────────────────────────────────────────────

/// Per-kernel-instance lists as the build system reads them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileLists {
    #[serde(rename = "BM")]
    pub block_m: Vec<usize>,
    #[serde(rename = "BK")]
    pub block_k: Vec<usize>,
    #[serde(rename = "bm")]
    pub micro_m: Vec<usize>,
}

/// One tile per kernel instance, all of the same family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TilePlan {
    pub arch: KernelArch,
    #[serde(flatten)]
    pub lists: TileLists,
}

impl TilePlan {
    /// Build from per-kernel lists. All three lists must have equal length.
    pub fn new(
        arch: KernelArch,
        block_m: Vec<usize>,
        block_k: Vec<usize>,
        micro_m: Vec<usize>,
    ) -> Result<Self> {
        let plan = Self {
            arch,
            lists: TileLists {
                block_m,
                block_k,
                micro_m,
            },
        };
        plan.check_lengths()?;
        Ok(plan)
    }

    /// Same tile for every one of `kernels` instances.
    pub fn uniform(arch: KernelArch, kernels: usize, tile: (usize, usize, usize)) -> Self {
        Self {
            arch,
            lists: TileLists {
                block_m: vec![tile.0; kernels],
                block_k: vec![tile.1; kernels],
                micro_m: vec![tile.2; kernels],
            },
        }
    }

    pub fn from_tiles(arch: KernelArch, tiles: &[TileConfig]) -> Result<Self> {
        if let Some(t) = tiles.iter().find(|t| t.arch != arch) {
            return Err(TuneError::Profile(format!(
                "tile {t} is {} but the plan is {arch}",
                t.arch
            )));
        }
        Self::new(
            arch,
            tiles.iter().map(|t| t.block_m).collect(),
            tiles.iter().map(|t| t.block_k).collect(),
            tiles.iter().map(|t| t.micro_m).collect(),
        )
    }

    /// Deserialised plans are not length-checked by serde.
    pub fn check_lengths(&self) -> Result<()> {
        let n = self.lists.block_m.len();
        if self.lists.block_k.len() != n || self.lists.micro_m.len() != n {
            return Err(TuneError::Profile(format!(
                "BM/BK/bm lists differ in length ({}, {}, {})",
                n,
                self.lists.block_k.len(),
                self.lists.micro_m.len()
            )));
        }
        Ok(())
    }

    /// Number of kernel instances.
    pub fn len(&self) -> usize {
        self.lists.block_m.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tile(&self, index: usize) -> Option<TileConfig> {
        Some(TileConfig::new(
            self.arch,
            *self.lists.block_m.get(index)?,
            *self.lists.block_k.get(index)?,
            *self.lists.micro_m.get(index)?,
        ))
    }

    pub fn tiles(&self) -> impl Iterator<Item = TileConfig> + '_ {
        (0..self.len()).filter_map(|i| self.tile(i))
    }

    /// Replace the tile of one kernel instance.
    pub fn with_tile(mut self, index: usize, tile: TileConfig) -> Self {
        if index < self.len() {
            self.lists.block_m[index] = tile.block_m;
            self.lists.block_k[index] = tile.block_k;
            self.lists.micro_m[index] = tile.micro_m;
        }
        self
    }

    /// Σ BM×BK over all instances.
    pub fn footprint(&self) -> usize {
        self.tiles().map(|t| t.area()).sum()
    }

    /// L1 distance to another plan; `None` when they are not comparable.
    pub fn distance(&self, other: &TilePlan) -> Option<usize> {
        if self.arch != other.arch || self.len() != other.len() {
            return None;
        }
        Some(
            self.tiles()
                .zip(other.tiles())
                .map(|(a, b)| a.distance(&b))
                .sum(),
        )
    }

    /// Stable key, e.g. `lut:160x64x32,320x128x64`.
    pub fn key(&self) -> String {
        let tiles = self
            .tiles()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!("{}:{}", self.arch, tiles)
    }
}

impl fmt::Display for TilePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |v: &[usize]| {
            v.iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        write!(
            f,
            "[{}] BM={} BK={} bm={}",
            self.arch,
            join(&self.lists.block_m),
            join(&self.lists.block_k),
            join(&self.lists.micro_m)
        )
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_requires_whole_blocks() {
        assert!(MatrixShape::new(3200, 8640).is_ok());
        assert!(MatrixShape::new(3200, 100).is_err());
        assert!(MatrixShape::new(0, 64).is_err());
        assert_eq!(MatrixShape::new(8, 96).unwrap().blocks_per_row(), 3);
    }

    #[test]
    fn shape_serialises_as_pair() {
        let s = MatrixShape::new(3200, 8640).unwrap();
        assert_eq!(serde_json::to_string(&s).unwrap(), "[3200,8640]");
        let back: MatrixShape = serde_json::from_str("[3200,3200]").unwrap();
        assert_eq!(back.k(), 3200);
        assert!(serde_json::from_str::<MatrixShape>("[3200,33]").is_err());
    }

    #[test]
    fn arch_from_target() {
        assert_eq!(KernelArch::for_target_arch("aarch64"), KernelArch::Lut);
        assert_eq!(KernelArch::for_target_arch("arm"), KernelArch::Lut);
        assert_eq!(KernelArch::for_target_arch("x86_64"), KernelArch::Mad);
        assert_eq!("TL1".parse::<KernelArch>().unwrap(), KernelArch::Lut);
        assert!("gpu".parse::<KernelArch>().is_err());
    }

    #[test]
    fn plan_serialises_flat() {
        let plan = TilePlan::uniform(KernelArch::Mad, 2, (160, 96, 32));
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["arch"], "mad");
        assert_eq!(json["BM"], serde_json::json!([160, 160]));
        assert_eq!(json["bm"], serde_json::json!([32, 32]));
        let back: TilePlan = serde_json::from_value(json).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn plan_rejects_ragged_lists() {
        assert!(TilePlan::new(KernelArch::Lut, vec![160], vec![64, 64], vec![32]).is_err());
    }

    #[test]
    fn plan_key_and_distance() {
        let a = TilePlan::new(KernelArch::Lut, vec![160, 320], vec![64, 128], vec![32, 64]).unwrap();
        let b = a.clone().with_tile(1, TileConfig::new(KernelArch::Lut, 320, 64, 64));
        assert_eq!(a.key(), "lut:160x64x32,320x128x64");
        assert_eq!(a.distance(&b), Some(64));
        assert_eq!(a.footprint(), 160 * 64 + 320 * 128);
        let other_arch = TilePlan::uniform(KernelArch::Mad, 2, (160, 64, 32));
        assert_eq!(a.distance(&other_arch), None);
    }
}
