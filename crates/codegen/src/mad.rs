//! Multiply-accumulate family (AVX2-class hosts).
//!
//! Codes are unpacked through a 256×4 byte table generated here, then
//! multiplied with the int8 activations via `sign_epi8` / `maddubs_epi16` /
//! `madd_epi16`. Without AVX2 the same integer sum is computed in scalar C.

use std::fmt::Write as _;

use ternary_common::{MatrixShape, TileConfig};
use ternary_core::decode_table;

use crate::template::fill;

const MAD_DOT: &str = r#"#if defined(__AVX2__)
#include <immintrin.h>

static inline int32_t ternary_block_dot(const ternary_block_t *b, const int8_t *a) {
    int8_t wq[TERNARY_BLOCK_LEN];
    for (int j = 0; j < 8; ++j) memcpy(wq + 4 * j, TERNARY_DECODE[b->qs[j]], 4);
    const __m256i w = _mm256_loadu_si256((const __m256i *)wq);
    const __m256i x = _mm256_loadu_si256((const __m256i *)a);
    // x * w for w in {-1, 0, +1}; x never holds -128.
    const __m256i wx = _mm256_sign_epi8(x, w);
    const __m256i s16 = _mm256_maddubs_epi16(_mm256_set1_epi8(1), wx);
    const __m256i s32 = _mm256_madd_epi16(s16, _mm256_set1_epi16(1));
    __m128i s = _mm_add_epi32(_mm256_castsi256_si128(s32), _mm256_extracti128_si256(s32, 1));
    s = _mm_hadd_epi32(s, s);
    s = _mm_hadd_epi32(s, s);
    return _mm_cvtsi128_si32(s);
}
#else
static inline int32_t ternary_block_dot(const ternary_block_t *b, const int8_t *a) {
    int32_t isum = 0;
    for (int j = 0; j < 8; ++j) {
        const int8_t *lanes = TERNARY_DECODE[b->qs[j]];
        for (int l = 0; l < 4; ++l) isum += lanes[l] * a[4 * j + l];
    }
    return isum;
}
#endif
"#;

const MAD_KERNEL: &str = r#"// kernel @INDEX@: @M@x@K@, BM=@BM@ BK=@BK@ bm=@BMM@
static inline void @NAME@(const ternary_block_t *w, const int8_t *a, float a_scale, float *y) {
    enum { M = @M@, K = @K@, BM = @BM@, BK = @BK@, BMM = @BMM@, NB = K / TERNARY_BLOCK_LEN };
    enum { TB = BK / TERNARY_BLOCK_LEN };
    float facc[BM];
    for (int r0 = 0; r0 < M; r0 += BM) {
        for (int r = 0; r < BM; ++r) facc[r] = 0.0f;
        for (int b0 = 0; b0 < NB; b0 += TB) {
            const int b1 = b0 + TB < NB ? b0 + TB : NB;
            for (int mi = 0; mi < BM; mi += BMM) {
                for (int r = mi; r < mi + BMM; ++r) {
                    const ternary_block_t *row = w + (size_t)(r0 + r) * NB;
                    for (int b = b0; b < b1; ++b) {
                        facc[r] += (float)ternary_block_dot(&row[b], a + b * TERNARY_BLOCK_LEN) * row[b].d;
                    }
                }
            }
        }
        for (int r = 0; r < BM; ++r) y[r0 + r] = facc[r] * a_scale;
    }
}
"#;

/// Decode table plus the block dot product, emitted once per MAD header.
pub fn prelude() -> String {
    let mut out = String::from("// byte of four 2-bit codes -> four int8 levels\n");
    out.push_str("static const int8_t TERNARY_DECODE[256][4] = {\n");
    for (byte, lanes) in decode_table().iter().enumerate() {
        let _ = writeln!(
            out,
            "    {{ {:2}, {:2}, {:2}, {:2} }}, // 0x{byte:02x}",
            lanes[0], lanes[1], lanes[2], lanes[3]
        );
    }
    out.push_str("};\n\n");
    out.push_str(MAD_DOT);
    out
}

/// C source of one MAD kernel instance. The tile must already be legal.
pub fn emit(name: &str, index: usize, tile: &TileConfig, shape: &MatrixShape) -> String {
    fill(
        MAD_KERNEL,
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
