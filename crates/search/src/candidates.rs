//! Candidate plan generation.
//!
//! Quick mode takes the profile's curated plans, or the legal subset of a
//! generic list when it has none. Full mode sweeps a grid of
//! (BM, BK, bm) triples; each triple is applied to every kernel instance it
//! is legal for and the profile default covers the rest.

use std::collections::{BTreeSet, HashSet};

use tracing::debug;

use ternary_common::{KernelArch, ModelProfile, TileConfig, TilePlan, TERNARY_BLOCK_LEN};
use ternary_core::{validate, validate_plan};

use crate::types::SearchMode;

/// Most plans a quick session tries.
pub const QUICK_LIMIT: usize = 4;

/// BM range of the full sweep.
pub const BM_RANGE: (usize, usize) = (64, 512);
/// BK range of the full sweep.
pub const BK_RANGE: (usize, usize) = (32, 256);

/// Row-block sizes: multiples of 32 in [`BM_RANGE`] dividing some M.
pub fn block_m_grid(profile: &ModelProfile) -> Vec<usize> {
    let mut out = BTreeSet::new();
    for shape in &profile.kernels {
        for bm_ in (BM_RANGE.0..=BM_RANGE.1).step_by(TERNARY_BLOCK_LEN) {
            if shape.m() % bm_ == 0 {
                out.insert(bm_);
            }
        }
    }
    out.into_iter().collect()
}

/// Reduction-block sizes: multiples of 32 in [`BK_RANGE`]; for LUT only
/// those dividing some K.
pub fn block_k_grid(profile: &ModelProfile, arch: KernelArch) -> Vec<usize> {
    (BK_RANGE.0..=BK_RANGE.1)
        .step_by(TERNARY_BLOCK_LEN)
        .filter(|bk| match arch {
            KernelArch::Lut => profile.kernels.iter().any(|s| s.k() % bk == 0),
            KernelArch::Mad => true,
        })
        .collect()
}

/// Full sweep, deduplicated, nearest-to-default first, capped.
pub fn full_sweep(profile: &ModelProfile, arch: KernelArch, max_candidates: usize) -> Vec<TilePlan> {
    let default = profile.default_plan(arch);
    let mut seen = HashSet::new();
    let mut plans = Vec::new();
    seen.insert(default.key());
    plans.push(default.clone());

    for &bm_ in &block_m_grid(profile) {
        for &bk in &block_k_grid(profile, arch) {
            for &bmm in arch.micro_tiles() {
                if bm_ % bmm != 0 {
                    continue;
                }
                let tile = TileConfig::new(arch, bm_, bk, bmm);
                let mut plan = default.clone();
                let mut applied = false;
                for (i, shape) in profile.kernels.iter().enumerate() {
                    if validate(&tile, shape).is_legal() {
                        plan = plan.with_tile(i, tile);
                        applied = true;
                    }
                }
                if applied && seen.insert(plan.key()) {
                    plans.push(plan);
                }
            }
        }
    }

    let total = plans.len();
    // Stable: equal distances keep grid order.
    plans.sort_by_key(|p| p.distance(&default).unwrap_or(usize::MAX));
    plans.truncate(max_candidates.max(1));
    debug!(total, kept = plans.len(), "Full sweep generated");
    plans
}

/// Curated plans as given; otherwise the generic plans legal for every
/// kernel shape. Deduplicated and capped at [`QUICK_LIMIT`].
pub fn quick_plans(profile: &ModelProfile, arch: KernelArch) -> Vec<TilePlan> {
    let mut seen = HashSet::new();
    let curated = profile.curated_quick_plans(arch);
    if !curated.is_empty() {
        return curated
            .into_iter()
            .filter(|p| seen.insert(p.key()))
            .take(QUICK_LIMIT)
            .collect();
    }
    let legal: Vec<TilePlan> = profile
        .generic_quick_plans(arch)
        .into_iter()
        .filter(|p| validate_plan(p, &profile.kernels).is_legal())
        .filter(|p| seen.insert(p.key()))
        .take(QUICK_LIMIT)
        .collect();
    if legal.is_empty() {
        // Nothing generic fits; the default still gets a verdict.
        return vec![profile.default_plan(arch)];
    }
    legal
}

/// Candidates for a session, in generation order.
pub fn generate(
    profile: &ModelProfile,
    arch: KernelArch,
    mode: SearchMode,
    max_candidates: usize,
) -> Vec<TilePlan> {
    match mode {
        SearchMode::Quick => quick_plans(profile, arch),
        SearchMode::Full => full_sweep(profile, arch, max_candidates),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ternary_core::validate_plan;

    fn profile() -> ModelProfile {
        ModelProfile::builtin("bitnet_b1_58-3B").unwrap()
    }

    #[test]
    fn grids() {
        let p = profile();
        let bm = block_m_grid(&p);
        // 3200 = 32 * 100, 8640 = 32 * 270
        assert_eq!(bm, vec![64, 96, 128, 160, 192, 288, 320, 480]);
        let bk_lut = block_k_grid(&p, KernelArch::Lut);
        assert!(bk_lut.iter().all(|bk| p.kernels.iter().any(|s| s.k() % bk == 0)));
        assert_eq!(bk_lut, vec![32, 64, 96, 128, 160, 192]);
        assert_eq!(block_k_grid(&p, KernelArch::Mad).len(), 8);
    }

    #[test]
    fn full_sweep_is_legal_unique_and_capped() {
        let p = profile();
        for arch in [KernelArch::Lut, KernelArch::Mad] {
            let plans = full_sweep(&p, arch, 24);
            assert_eq!(plans.len(), 24);
            assert_eq!(plans[0], p.default_plan(arch));
            let keys: HashSet<_> = plans.iter().map(|p| p.key()).collect();
            assert_eq!(keys.len(), plans.len());
            let default = p.default_plan(arch);
            let d: Vec<_> = plans.iter().map(|x| x.distance(&default).unwrap()).collect();
            assert!(d.windows(2).all(|w| w[0] <= w[1]));
            for plan in &plans {
                assert!(validate_plan(plan, &p.kernels).is_legal(), "{plan}");
            }
        }
    }

    #[test]
    fn quick_mode_uses_curated_plans() {
        for name in ModelProfile::BUILTIN {
            let p = ModelProfile::builtin(name).unwrap();
            for arch in [KernelArch::Lut, KernelArch::Mad] {
                let plans = generate(&p, arch, SearchMode::Quick, 24);
                assert!((3..=QUICK_LIMIT).contains(&plans.len()), "{name} {arch}");
                assert_eq!(plans, p.curated_quick_plans(arch));
                for plan in &plans {
                    assert!(validate_plan(plan, &p.kernels).is_legal(), "{name} {plan}");
                }
            }
        }
    }

    #[test]
    fn generic_quick_plans_keep_only_legal_tiles() {
        for name in ["bitnet_b1_58-large", "Llama3-8B-1.58-100B-tokens"] {
            let mut p = ModelProfile::builtin(name).unwrap();
            p.quick_lut.clear();
            p.quick_mad.clear();
            for arch in [KernelArch::Lut, KernelArch::Mad] {
                let plans = quick_plans(&p, arch);
                assert!((3..=QUICK_LIMIT).contains(&plans.len()), "{name} {arch}");
                assert_eq!(plans[0], p.default_plan(arch));
                for plan in &plans {
                    assert!(validate_plan(plan, &p.kernels).is_legal(), "{name} {plan}");
                    // 160 and 320 divide none of these row counts.
                    assert!(plan.tiles().all(|t| t.block_m != 160 && t.block_m != 320));
                }
            }
        }
    }
}
