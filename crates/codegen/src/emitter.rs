//! Family dispatch and the emitted-kernel memo.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use ternary_common::{KernelArch, MatrixShape, Result, TileConfig, TuneError};
use ternary_core::validate;

use crate::{lut, mad};

/// Kernel family, chosen purely by [`KernelArch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Emitter {
    Lut,
    Mad,
}

/// One emitted kernel instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    pub index: usize,
    pub shape: MatrixShape,
    pub tile: TileConfig,
    /// C function name, e.g. `ternary_gemv_lut_0`.
    pub name: String,
    pub code: String,
}

impl Emitter {
    pub fn for_arch(arch: KernelArch) -> Self {
        match arch {
            KernelArch::Lut => Self::Lut,
            KernelArch::Mad => Self::Mad,
        }
    }

    pub fn arch(&self) -> KernelArch {
        match self {
            Self::Lut => KernelArch::Lut,
            Self::Mad => KernelArch::Mad,
        }
    }

    /// Family helpers emitted once before the kernels.
    pub fn prelude(&self) -> String {
        match self {
            Self::Lut => lut::LUT_PRELUDE.to_string(),
            Self::Mad => mad::prelude(),
        }
    }

    /// Emit kernel instance `index`. Illegal tiles are a caller bug and
    /// come back as [`TuneError::EmissionFailure`].
    pub fn emit_kernel(
        &self,
        index: usize,
        tile: &TileConfig,
        shape: &MatrixShape,
    ) -> Result<KernelSource> {
        if tile.arch != self.arch() {
            return Err(TuneError::EmissionFailure(format!(
                "{} tile {tile} handed to the {} emitter",
                tile.arch,
                self.arch()
            )));
        }
        let verdict = validate(tile, shape);
        if let Some(reason) = verdict.reason() {
            return Err(TuneError::EmissionFailure(format!(
                "kernel {index} ({shape}, {tile}): {reason}"
            )));
        }
        let name = format!("ternary_gemv_{}_{index}", self.arch());
        let code = match self {
            Self::Lut => lut::emit(&name, index, tile, shape),
            Self::Mad => mad::emit(&name, index, tile, shape),
        };
        if let Some(hole) = crate::template::unfilled(&code) {
            return Err(TuneError::EmissionFailure(format!(
                "template placeholder @{hole}@ left unfilled"
            )));
        }
        Ok(KernelSource {
            index,
            shape: *shape,
            tile: *tile,
            name,
            code,
        })
    }
}

// ── EmitCache ───────────────────────────────────────────────────────────────

type CacheKey = (usize, MatrixShape, TileConfig);

/// LRU memo of emitted kernel instances; full sweeps revisit the same
/// (kernel, tile) pairs many times.
pub struct EmitCache {
    inner: Mutex<LruCache<CacheKey, Arc<KernelSource>>>,
}

impl EmitCache {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get_or_emit(
        &self,
        emitter: Emitter,
        index: usize,
        tile: &TileConfig,
        shape: &MatrixShape,
    ) -> Result<Arc<KernelSource>> {
        let key = (index, *shape, *tile);
        if let Some(hit) = self.inner.lock().get(&key) {
            debug!(index, %tile, "Emit cache hit");
            return Ok(Arc::clone(hit));
        }
        let source = Arc::new(emitter.emit_kernel(index, tile, shape)?);
        self.inner.lock().put(key, Arc::clone(&source));
        Ok(source)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EmitCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
