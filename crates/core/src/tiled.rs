//! Rust models of the loop nests each kernel family emits.
//!
//! The models walk the weights in exactly the order the generated C does:
//! row blocks of `BM` (in parallel), K tiles of `BK`, micro-tiles of `bm`.
//! Integer partial sums are flushed into the float accumulator once per
//! codec block, in ascending block order, so every legal tiling is
//! bit-exact with [`crate::reference::ternary_gemv`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info};

use ternary_common::{KernelArch, MatrixShape, Result, TileConfig, TilePlan, TuneError};

use crate::codec::{code_to_level, PackedMatrix, BLOCK_LEN};
use crate::quantize::{quantize_activations, QuantizedActivations};
use crate::reference::{check_len, ternary_gemv};
use crate::validate::{validate, validate_plan};

/// Symbol pairs per codec block.
pub const PAIRS_PER_BLOCK: usize = BLOCK_LEN / 2;

// ── Tables ──────────────────────────────────────────────────────────────────

/// LUT entry for every 4-bit pair code: `lvl(lo) * a0 + lvl(hi) * a1`.
/// Nibbles that contain the reserved code hold 0.
pub fn pair_table(a0: i8, a1: i8) -> [i16; 16] {
    let mut table = [0i16; 16];
    for (nib, entry) in table.iter_mut().enumerate() {
        let lo = code_to_level(nib as u8 & 0b11);
        let hi = code_to_level((nib as u8 >> 2) & 0b11);
        if let (Some(lo), Some(hi)) = (lo, hi) {
            *entry = lo as i16 * a0 as i16 + hi as i16 * a1 as i16;
        }
    }
    table
}

/// Byte → four int8 levels, the MAD family's unpack table.
pub fn decode_table() -> [[i8; 4]; 256] {
    let mut table = [[0i8; 4]; 256];
    for (byte, lanes) in table.iter_mut().enumerate() {
        for (s, lane) in lanes.iter_mut().enumerate() {
            *lane = code_to_level((byte >> (s * 2)) as u8 & 0b11).unwrap_or(0);
        }
    }
    table
}

/// Pair range covered by K tile `t` of width `bk`.
#[inline]
fn tile_pairs(t: usize, bk: usize) -> std::ops::Range<usize> {
    (t * bk + 1) / 2..((t + 1) * bk + 1) / 2
}

// ── LUT model ───────────────────────────────────────────────────────────────

/// Lookup-table family.
pub fn lut_gemv(
    tile: &TileConfig,
    weights: &PackedMatrix,
    act: &QuantizedActivations,
) -> Result<Vec<f32>> {
    check_tile(tile, KernelArch::Lut, weights, act)?;
    let shape = weights.shape();
    let (bm_, bk, bmm) = (tile.block_m, tile.block_k, tile.micro_m);
    let k_tiles = shape.k() / bk;
    let mut out = vec![0f32; shape.m()];

    out.par_chunks_mut(bm_).enumerate().for_each(|(rb, y)| {
        let row0 = rb * bm_;
        let mut iacc = vec![0i32; bm_];
        let mut facc = vec![0f32; bm_];
        for t in 0..k_tiles {
            let pairs = tile_pairs(t, bk);
            let tables: Vec<[i16; 16]> = pairs
                .clone()
                .map(|p| pair_table(act.values[2 * p], act.values[2 * p + 1]))
                .collect();
            for micro in (0..bm_).step_by(bmm) {
                for r in micro..micro + bmm {
                    let blocks = weights.row_blocks(row0 + r);
                    for (j, p) in pairs.clone().enumerate() {
                        let block = &blocks[p / PAIRS_PER_BLOCK];
                        let nib = block.pair_nibble(p % PAIRS_PER_BLOCK);
                        iacc[r] += tables[j][nib as usize] as i32;
                        if (p + 1) % PAIRS_PER_BLOCK == 0 {
                            facc[r] += iacc[r] as f32 * block.scale();
                            iacc[r] = 0;
                        }
                    }
                }
            }
        }
        for (o, f) in y.iter_mut().zip(&facc) {
            *o = f * act.scale;
        }
    });
    Ok(out)
}

// ── MAD model ───────────────────────────────────────────────────────────────

/// Multiply-accumulate family. The last K tile may be a shorter remainder.
pub fn mad_gemv(
    tile: &TileConfig,
    weights: &PackedMatrix,
    act: &QuantizedActivations,
) -> Result<Vec<f32>> {
    check_tile(tile, KernelArch::Mad, weights, act)?;
    let shape = weights.shape();
    let (bm_, bmm) = (tile.block_m, tile.micro_m);
    let blocks_per_tile = tile.block_k / BLOCK_LEN;
    let nblocks = shape.blocks_per_row();
    let decode = decode_table();
    let mut out = vec![0f32; shape.m()];

    out.par_chunks_mut(bm_).enumerate().for_each(|(rb, y)| {
        let row0 = rb * bm_;
        let mut facc = vec![0f32; bm_];
        for b0 in (0..nblocks).step_by(blocks_per_tile) {
            let b1 = (b0 + blocks_per_tile).min(nblocks);
            for micro in (0..bm_).step_by(bmm) {
                for r in micro..micro + bmm {
                    let blocks = weights.row_blocks(row0 + r);
                    for (b, block) in blocks.iter().enumerate().take(b1).skip(b0) {
                        let a = &act.values[b * BLOCK_LEN..(b + 1) * BLOCK_LEN];
                        let mut isum = 0i32;
                        for (byte, quad) in block.codes().iter().zip(a.chunks_exact(4)) {
                            let lanes = &decode[*byte as usize];
                            for (w, x) in lanes.iter().zip(quad) {
                                isum += *w as i32 * *x as i32;
                            }
                        }
                        facc[r] += isum as f32 * block.scale();
                    }
                }
            }
        }
        for (o, f) in y.iter_mut().zip(&facc) {
            *o = f * act.scale;
        }
    });
    Ok(out)
}

fn check_tile(
    tile: &TileConfig,
    arch: KernelArch,
    weights: &PackedMatrix,
    act: &QuantizedActivations,
) -> Result<()> {
    if tile.arch != arch {
        return Err(TuneError::ConstraintViolation(format!(
            "{} tile handed to the {arch} model",
            tile.arch
        )));
    }
    validate(tile, &weights.shape()).into_result()?;
    check_len(weights, act)
}

/// Run the model matching the tile's family.
pub fn run_model(
    tile: &TileConfig,
    weights: &PackedMatrix,
    act: &QuantizedActivations,
) -> Result<Vec<f32>> {
    match tile.arch {
        KernelArch::Lut => lut_gemv(tile, weights, act),
        KernelArch::Mad => mad_gemv(tile, weights, act),
    }
}

// ── Verification ────────────────────────────────────────────────────────────

/// Outcome of checking one kernel instance against the reference.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelCheck {
    pub shape: MatrixShape,
    pub tile: TileConfig,
    /// Largest absolute difference to the reference (0.0 when exact).
    pub max_abs_diff: f32,
    pub exact: bool,
}

/// Per-kernel results for a whole plan.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyReport {
    pub seed: u64,
    pub kernels: Vec<KernelCheck>,
}

impl VerifyReport {
    pub fn all_exact(&self) -> bool {
        self.kernels.iter().all(|k| k.exact)
    }
}

/// Compare the tiled model of `tile` with the reference on seeded random data.
pub fn verify_tile(tile: &TileConfig, shape: MatrixShape, seed: u64) -> Result<KernelCheck> {
    let mut rng = StdRng::seed_from_u64(seed);
    let weights = PackedMatrix::random(shape, &mut rng);
    let x: Vec<f32> = (0..shape.k()).map(|_| rng.gen_range(-4.0f32..4.0)).collect();
    let act = quantize_activations(&x);

    let expected = ternary_gemv(&weights, &act)?;
    let got = run_model(tile, &weights, &act)?;
    let max_abs_diff = expected
        .iter()
        .zip(&got)
        .fold(0.0f32, |m, (a, b)| m.max((a - b).abs()));
    let exact = expected
        .iter()
        .zip(&got)
        .all(|(a, b)| a.to_bits() == b.to_bits());
    debug!(%shape, %tile, max_abs_diff, exact, "Kernel model checked");
    Ok(KernelCheck {
        shape,
        tile: *tile,
        max_abs_diff,
        exact,
    })
}

/// Verify every kernel instance of a plan. Illegal plans are rejected up front.
pub fn verify_plan(plan: &TilePlan, shapes: &[MatrixShape], seed: u64) -> Result<VerifyReport> {
    validate_plan(plan, shapes).into_result()?;
    let kernels = plan
        .tiles()
        .zip(shapes)
        .enumerate()
        .map(|(i, (tile, shape))| verify_tile(&tile, *shape, seed.wrapping_add(i as u64)))
        .collect::<Result<Vec<_>>>()?;
    let report = VerifyReport { seed, kernels };
    info!(
        plan = %plan,
        kernels = report.kernels.len(),
        exact = report.all_exact(),
        "Plan verified against reference"
    );
    Ok(report)
}

// ── Tests ───────────────────────────────────────────────────────────────────
