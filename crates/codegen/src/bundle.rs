//! Whole-plan emission: one header, its ini mirror and the flag manifest.

use std::fmt::Write as _;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::info;

use ternary_common::{render_kernel_ini, write_atomic, KernelArch, MatrixShape, Result, TilePlan, TuneError};
use ternary_core::validate_plan;

use crate::emitter::{EmitCache, Emitter, KernelSource};

/// Everything the build system needs for one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelBundle {
    pub arch: KernelArch,
    /// Complete C header: prelude, every kernel instance, dispatcher.
    pub header: String,
    /// `[Kernels_<i>]` key/value mirror.
    pub ini: String,
    /// SIMD compiler flags the header needs.
    pub flags: Vec<String>,
    /// SHA-256 hex of header and flags; the build-cache key.
    pub fingerprint: String,
}

impl KernelBundle {
    /// Flags joined for `TERNARY_KERNEL_CFLAGS`.
    pub fn cflags(&self) -> String {
        self.flags.join(" ")
    }

    /// Write header and ini, each replace-on-success.
    pub fn install(&self, header_path: &Path, ini_path: &Path) -> Result<()> {
        write_atomic(header_path, self.header.as_bytes())?;
        write_atomic(ini_path, self.ini.as_bytes())?;
        info!(
            header = %header_path.display(),
            fingerprint = &self.fingerprint[..12],
            "Kernel bundle installed"
        );
        Ok(())
    }
}

/// Compiler flags per family. `-ffp-contract=off` keeps the float flush
/// order from being fused into FMAs.
pub fn simd_flags(arch: KernelArch) -> Vec<String> {
    let flags: &[&str] = match arch {
        KernelArch::Mad => &["-mavx2", "-mfma", "-ffp-contract=off"],
        KernelArch::Lut => &["-march=armv8-a+simd", "-ffp-contract=off"],
    };
    flags.iter().map(|f| f.to_string()).collect()
}

fn fingerprint(header: &str, flags: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(header.as_bytes());
    hasher.update([0u8]);
    hasher.update(flags.join(" ").as_bytes());
    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}

const HEADER_TOP: &str = r#"// ternary-kernels.h - generated by ternary-tune, do not edit
#pragma once

#include <stddef.h>
#include <stdint.h>
#include <string.h>

#define TERNARY_BLOCK_LEN 32

// 32 packed 2-bit codes (symbol i at bits 2*(i%4) of qs[i/4]) and one scale.
typedef struct {
    uint8_t qs[TERNARY_BLOCK_LEN / 4];
    float d;
} ternary_block_t;
"#;

fn render_header(emitter: Emitter, kernels: &[KernelSource]) -> String {
    let mut out = String::from(HEADER_TOP);
    let _ = writeln!(out, "\n#define TERNARY_KERNEL_ARCH \"{}\"", emitter.arch());
    let _ = writeln!(out, "#define TERNARY_KERNEL_COUNT {}\n", kernels.len());
    out.push_str(&emitter.prelude());
    for k in kernels {
        out.push('\n');
        out.push_str(&k.code);
    }

    out.push_str(
        "\n// Returns 0 when a kernel for (m, k) exists, -1 otherwise.\n\
         static inline int ternary_gemv_dispatch(int m, int k, const ternary_block_t *w,\n\
         \x20                                       const int8_t *a, float a_scale, float *y) {\n",
    );
    for k in kernels {
        let _ = writeln!(
            out,
            "    if (m == {} && k == {}) {{ {}(w, a, a_scale, y); return 0; }}",
            k.shape.m(),
            k.shape.k(),
            k.name
        );
    }
    out.push_str("    return -1;\n}\n");
    out
}

/// Emit every kernel instance of `plan`.
///
/// The plan is expected to be legal; anything else is an
/// [`TuneError::EmissionFailure`].
pub fn emit_plan(plan: &TilePlan, shapes: &[MatrixShape]) -> Result<KernelBundle> {
    emit_plan_with(plan, shapes, None)
}

/// [`emit_plan`] going through an [`EmitCache`].
pub fn emit_plan_cached(
    cache: &EmitCache,
    plan: &TilePlan,
    shapes: &[MatrixShape],
) -> Result<KernelBundle> {
    emit_plan_with(plan, shapes, Some(cache))
}

fn emit_plan_with(
    plan: &TilePlan,
    shapes: &[MatrixShape],
    cache: Option<&EmitCache>,
) -> Result<KernelBundle> {
    let verdict = validate_plan(plan, shapes);
    if let Some(reason) = verdict.reason() {
        return Err(TuneError::EmissionFailure(format!("plan {plan}: {reason}")));
    }
    let emitter = Emitter::for_arch(plan.arch);
    let mut kernels = Vec::with_capacity(shapes.len());
    for (index, (tile, shape)) in plan.tiles().zip(shapes).enumerate() {
        let source = match cache {
            Some(c) => c.get_or_emit(emitter, index, &tile, shape)?.as_ref().clone(),
            None => emitter.emit_kernel(index, &tile, shape)?,
        };
        kernels.push(source);
    }

    let header = render_header(emitter, &kernels);
    let flags = simd_flags(plan.arch);
    let fingerprint = fingerprint(&header, &flags);
    tracing::debug!(plan = %plan, fingerprint = &fingerprint[..12], bytes = header.len(), "Plan emitted");
    Ok(KernelBundle {
        arch: plan.arch,
        ini: render_kernel_ini(shapes, plan),
        header,
        flags,
        fingerprint,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ternary_common::ModelProfile;

    fn profile() -> ModelProfile {
        ModelProfile::builtin("bitnet_b1_58-3B").unwrap()
    }

    #[test]
    fn bundle_is_deterministic() {
        let p = profile();
        for arch in [KernelArch::Lut, KernelArch::Mad] {
            let plan = p.default_plan(arch);
            let a = emit_plan(&plan, &p.kernels).unwrap();
            let b = emit_plan(&plan, &p.kernels).unwrap();
            assert_eq!(a, b);
            assert_eq!(a.fingerprint.len(), 64);

            let cache = EmitCache::default();
            let c = emit_plan_cached(&cache, &plan, &p.kernels).unwrap();
            assert_eq!(a, c);
            assert_eq!(cache.len(), p.kernels.len());
        }
    }

    #[test]
    fn header_has_every_kernel_and_dispatcher() {
        let p = profile();
        let b = emit_plan(&p.default_plan(KernelArch::Lut), &p.kernels).unwrap();
        assert!(b.header.contains("#define TERNARY_KERNEL_COUNT 3"));
        for i in 0..3 {
            assert!(b.header.contains(&format!("ternary_gemv_lut_{i}(w, a, a_scale, y)")));
        }
        assert!(b.header.contains("if (m == 3200 && k == 8640)"));
        assert!(b.header.contains("int ternary_gemv_dispatch(int m, int k"));
        assert!(b.ini.contains("[Kernels_2]"));
        assert_eq!(b.cflags(), "-march=armv8-a+simd -ffp-contract=off");
    }

    #[test]
    fn different_plans_differ_in_fingerprint() {
        let p = profile();
        let a = emit_plan(&p.default_plan(KernelArch::Mad), &p.kernels).unwrap();
        let plan = TilePlan::uniform(KernelArch::Mad, 3, (320, 128, 32));
        let b = emit_plan(&plan, &p.kernels).unwrap();
        assert_ne!(a.fingerprint, b.fingerprint);
        assert!(b.flags.contains(&"-mavx2".to_string()));
    }

    #[test]
    fn illegal_plan_rejected() {
        let p = profile();
        let plan = TilePlan::uniform(KernelArch::Lut, 3, (150, 64, 32));
        assert!(matches!(
            emit_plan(&plan, &p.kernels),
            Err(TuneError::EmissionFailure(_))
        ));
    }

    #[test]
    fn install_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let p = profile();
        let b = emit_plan(&p.default_plan(KernelArch::Mad), &p.kernels).unwrap();
        let (h, i) = (dir.path().join("include/k.h"), dir.path().join("include/k.ini"));
        b.install(&h, &i).unwrap();
        assert_eq!(std::fs::read_to_string(&h).unwrap(), b.header);
        assert_eq!(std::fs::read_to_string(&i).unwrap(), b.ini);
    }

    // ── Compiled kernels ────────────────────────────────────────────────────

    const DRIVER: &str = r#"#include <stdio.h>
#include <stdlib.h>
#include "kernels.h"

_Static_assert(sizeof(ternary_block_t) == 12, "block layout");

// driver M K weights.bin acts.bin out.bin SCALE_BITS
int main(int argc, char **argv) {
    if (argc != 7) return 2;
    const int m = atoi(argv[1]), k = atoi(argv[2]);
    const size_t nb = (size_t)m * (size_t)(k / TERNARY_BLOCK_LEN);
    ternary_block_t *w = malloc(nb * sizeof *w);
    int8_t *a = malloc((size_t)k);
    float *y = malloc((size_t)m * sizeof *y);
    FILE *f = fopen(argv[3], "rb");
    if (!f || fread(w, sizeof *w, nb, f) != nb) return 2;
    fclose(f);
    f = fopen(argv[4], "rb");
    if (!f || fread(a, 1, (size_t)k, f) != (size_t)k) return 2;
    fclose(f);
    const uint32_t bits = (uint32_t)strtoul(argv[6], NULL, 16);
    float a_scale;
    memcpy(&a_scale, &bits, sizeof a_scale);
    if (ternary_gemv_dispatch(m, k, w, a, a_scale, y) != 0) return 3;
    f = fopen(argv[5], "wb");
    if (!f || fwrite(y, sizeof *y, (size_t)m, f) != (size_t)m) return 2;
    fclose(f);
    return 0;
}
"#;

    fn have_cc() -> bool {
        std::process::Command::new("cc")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Flags of `bundle` this host can compile and run. Without them the
    /// LUT kernels are still plain C and MAD falls back to its scalar dot.
    fn host_flags(bundle: &KernelBundle) -> Vec<String> {
        let native = match bundle.arch {
            KernelArch::Lut => cfg!(target_arch = "aarch64"),
            #[cfg(target_arch = "x86_64")]
            KernelArch::Mad => std::is_x86_feature_detected!("avx2"),
            #[cfg(not(target_arch = "x86_64"))]
            KernelArch::Mad => false,
        };
        if native {
            bundle.flags.clone()
        } else {
            vec!["-ffp-contract=off".to_string()]
        }
    }

    fn compile_and_run(arch: KernelArch, m: usize, k: usize, tile: (usize, usize, usize), seed: u64) {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        use ternary_core::{quantize_activations, ternary_gemv, PackedMatrix};

        let shape = MatrixShape::new(m, k).unwrap();
        let bundle = emit_plan(&TilePlan::uniform(arch, 1, tile), &[shape]).unwrap();

        let mut rng = StdRng::seed_from_u64(seed);
        let weights = PackedMatrix::random(shape, &mut rng);
        let x: Vec<f32> = (0..k).map(|_| rng.gen_range(-4.0f32..4.0)).collect();
        let act = quantize_activations(&x);
        let expected = ternary_gemv(&weights, &act).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let d = dir.path();
        std::fs::write(d.join("kernels.h"), &bundle.header).unwrap();
        std::fs::write(d.join("driver.c"), DRIVER).unwrap();
        std::fs::write(d.join("weights.bin"), weights.to_bytes()).unwrap();
        let acts: Vec<u8> = act.values.iter().map(|&v| v as u8).collect();
        std::fs::write(d.join("acts.bin"), acts).unwrap();

        let cc = std::process::Command::new("cc")
            .current_dir(d)
            .args(["-std=c11", "-O1"])
            .args(host_flags(&bundle))
            .args(["driver.c", "-o", "driver"])
            .output()
            .unwrap();
        assert!(
            cc.status.success(),
            "{arch} {tile:?}: {}",
            String::from_utf8_lossy(&cc.stderr)
        );

        let run = std::process::Command::new(d.join("driver"))
            .current_dir(d)
            .args([m.to_string(), k.to_string()])
            .args(["weights.bin", "acts.bin", "out.bin"])
            .arg(format!("{:08x}", act.scale.to_bits()))
            .status()
            .unwrap();
        assert!(run.success(), "{arch} {tile:?}: driver exited with {run}");

        let out = std::fs::read(d.join("out.bin")).unwrap();
        let got: Vec<f32> = out
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(got.len(), m);
        for (row, (e, g)) in expected.iter().zip(&got).enumerate() {
            assert_eq!(e.to_bits(), g.to_bits(), "{arch} {tile:?} row {row}: {e} vs {g}");
        }
    }

    #[test]
    fn compiled_kernels_match_reference() {
        if !have_cc() {
            eprintln!("cc not found; skipping compiled kernel check");
            return;
        }
        compile_and_run(KernelArch::Lut, 128, 192, (64, 64, 32), 1);
        compile_and_run(KernelArch::Lut, 128, 192, (128, 96, 64), 2);
        // 160 % 64 = 32 leaves a partial last K tile.
        compile_and_run(KernelArch::Mad, 96, 160, (96, 64, 32), 3);
        compile_and_run(KernelArch::Mad, 96, 160, (32, 96, 32), 4);
    }
}
