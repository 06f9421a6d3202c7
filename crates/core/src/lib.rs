//! # ternary-core: Codec, Legality and Kernel Models
//!
//! The numeric ground truth every generated kernel is held to:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`codec`] | 2-bit ternary block codec, `TernaryBlock`, `PackedMatrix` |
//! | [`quantize`] | int8 absmax activation quantisation |
//! | [`validate`] | tiling rule table, `Verdict`, `validate_plan` |
//! | [`reference`] | naive reference GEMV, candle float cross-check |
//! | [`tiled`] | LUT / MAD loop-nest models, `verify_plan` |
//!
//! ## Design principles
//!
//! 1. **One layout.** The codec table is the only definition of a packed weight;
//!    emitter, models and reference all read it.
//! 2. **Bit-exact tiling.** Float accumulation order is fixed per codec block,
//!    so changing BM/BK/bm never changes an output bit.
//! 3. **Pure.** Nothing here touches the filesystem or spawns processes.

pub mod codec;
pub mod quantize;
pub mod reference;
pub mod tiled;
pub mod validate;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use codec::{PackedMatrix, TernaryBlock, BLOCK_BYTES, BLOCK_LEN};
pub use quantize::{quantize_activations, QuantizedActivations};
pub use reference::{dequant_matvec, ternary_gemv};
pub use tiled::{decode_table, pair_table, run_model, verify_plan, verify_tile, VerifyReport};
pub use validate::{validate, validate_plan, PlanVerdict, Rule, Verdict, Violation};
