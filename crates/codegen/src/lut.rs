//! Lookup-table family (NEON-class hosts).
//!
//! Per K tile, every activation pair gets a 16-entry `int16` table indexed
//! by the packed pair nibble; the micro-tile rows then accumulate by table
//! lookups. Integer sums are flushed once per codec block.

use ternary_common::{MatrixShape, TileConfig};

use crate::template::fill;

/// Shared helpers, emitted once per LUT header.
pub const LUT_PRELUDE: &str = r#"// 2-bit code -> level; code 10 is reserved and never stored.
static const int8_t TERNARY_LEVEL[4] = { 0, 1, 0, -1 };

// table[nib] = level(nib & 3) * a0 + level(nib >> 2) * a1
static inline void ternary_lut_build(int16_t table[16], int8_t a0, int8_t a1) {
    for (int nib = 0; nib < 16; ++nib) {
        const int lo = nib & 3, hi = nib >> 2;
        table[nib] = (lo == 2 || hi == 2)
            ? 0
            : (int16_t)(TERNARY_LEVEL[lo] * a0 + TERNARY_LEVEL[hi] * a1);
    }
}
"#;

const LUT_KERNEL: &str = r#"// kernel @INDEX@: @M@x@K@, BM=@BM@ BK=@BK@ bm=@BMM@
static inline void @NAME@(const ternary_block_t *w, const int8_t *a, float a_scale, float *y) {
    enum { M = @M@, K = @K@, BM = @BM@, BK = @BK@, BMM = @BMM@, NB = K / TERNARY_BLOCK_LEN };
    enum { PAIRS = (BK + 2) / 2, PAIRS_PER_BLOCK = TERNARY_BLOCK_LEN / 2 };
    int16_t lut[PAIRS][16];
    int32_t iacc[BM];
    float facc[BM];
    for (int r0 = 0; r0 < M; r0 += BM) {
        for (int r = 0; r < BM; ++r) { iacc[r] = 0; facc[r] = 0.0f; }
        for (int t = 0; t < K / BK; ++t) {
            const int p0 = (t * BK + 1) / 2, p1 = ((t + 1) * BK + 1) / 2;
            for (int p = p0; p < p1; ++p) {
                ternary_lut_build(lut[p - p0], a[2 * p], a[2 * p + 1]);
            }
            for (int mi = 0; mi < BM; mi += BMM) {
                for (int r = mi; r < mi + BMM; ++r) {
                    const ternary_block_t *row = w + (size_t)(r0 + r) * NB;
                    for (int p = p0; p < p1; ++p) {
                        const ternary_block_t *b = row + p / PAIRS_PER_BLOCK;
                        const int q = p % PAIRS_PER_BLOCK;
                        const uint8_t nib = (b->qs[q / 2] >> ((q % 2) * 4)) & 0x0F;
                        iacc[r] += lut[p - p0][nib];
                        if ((p + 1) % PAIRS_PER_BLOCK == 0) {
                            facc[r] += (float)iacc[r] * b->d;
                            iacc[r] = 0;
                        }
                    }
                }
            }
        }
        for (int r = 0; r < BM; ++r) y[r0 + r] = facc[r] * a_scale;
    }
}
"#;

/// C source of one LUT kernel instance. The tile must already be legal.
pub fn emit(name: &str, index: usize, tile: &TileConfig, shape: &MatrixShape) -> String {
    fill(
        LUT_KERNEL,
        &[
            ("NAME", name.to_string()),
            ("INDEX", index.to_string()),
            ("M", shape.m().to_string()),
            ("K", shape.k().to_string()),
            ("BM", tile.block_m.to_string()),
            ("BK", tile.block_k.to_string()),
            ("BMM", tile.micro_m.to_string()),
        ],
    )
}
