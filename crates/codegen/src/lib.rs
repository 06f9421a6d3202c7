//! # ternary-codegen: Kernel Emitter
//!
//! Turns a legal [`TilePlan`](ternary_common::TilePlan) into the C header the
//! host build system compiles:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`emitter`] | `Emitter` (LUT / MAD), `KernelSource`, `EmitCache` |
//! | [`lut`] | lookup-table kernel template |
//! | [`mad`] | multiply-accumulate kernel template, decode table |
//! | [`bundle`] | `emit_plan` → `KernelBundle` (header, ini, flags, fingerprint) |
//!
//! Output is byte-identical for identical inputs: no timestamps, no host data.

pub mod bundle;
pub mod emitter;
pub mod lut;
pub mod mad;
mod template;

pub use bundle::{emit_plan, emit_plan_cached, simd_flags, KernelBundle};
pub use emitter::{EmitCache, Emitter, KernelSource};
