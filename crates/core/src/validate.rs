//! Tiling legality, checked before anything is emitted or built.
//!
//! | Family | Rules |
//! |--------|-------|
//! | LUT | `M % BM == 0`, `K % BK == 0`, `BM % bm == 0`, `bm ∈ {32, 64}` |
//! | MAD | `M % BM == 0`, `(K % BK) % 32 == 0`, `BK % 32 == 0`, `BM % bm == 0`, `bm == 32` |
//!
//! Every broken rule is reported, not just the first one.

use std::fmt;

use ternary_common::{KernelArch, MatrixShape, Result, TileConfig, TilePlan, TuneError};

/// Alignment the MAD family needs on the reduction axis.
pub const MAD_K_ALIGN: usize = 32;

/// One row of the rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rule {
    /// BM, BK and bm are all non-zero.
    NonZero,
    /// `M % BM == 0`.
    RowsDivisible,
    /// LUT: `K % BK == 0`.
    ColsDivisible,
    /// MAD: `(K % BK) % 32 == 0`.
    RemainderAligned,
    /// MAD: `BK % 32 == 0`.
    BlockKAligned,
    /// `BM % bm == 0`.
    MicroDivides,
    /// bm is one of the family's micro-tile sizes.
    MicroAllowed,
}

/// A broken rule with its human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub rule: Rule,
    pub reason: String,
}

/// Outcome of checking one tile against one shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdict {
    pub violations: Vec<Violation>,
}

impl Verdict {
    pub fn is_legal(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violates(&self, rule: Rule) -> bool {
        self.violations.iter().any(|v| v.rule == rule)
    }

    /// `None` when legal, otherwise every reason joined by `"; "`.
    pub fn reason(&self) -> Option<String> {
        if self.is_legal() {
            return None;
        }
        Some(
            self.violations
                .iter()
                .map(|v| v.reason.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Legal → `Ok(())`, illegal → [`TuneError::ConstraintViolation`].
    pub fn into_result(self) -> Result<()> {
        match self.reason() {
            None => Ok(()),
            Some(r) => Err(TuneError::ConstraintViolation(r)),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            None => f.write_str("legal"),
            Some(r) => write!(f, "illegal: {r}"),
        }
    }
}

/// Check one tile against one shape. Pure.
pub fn validate(tile: &TileConfig, shape: &MatrixShape) -> Verdict {
    let (m, k) = (shape.m(), shape.k());
    let (bm_, bk, bmm) = (tile.block_m, tile.block_k, tile.micro_m);
    let mut v = Vec::new();
    let mut fail = |rule: Rule, reason: String| v.push(Violation { rule, reason });

    if bm_ == 0 || bk == 0 || bmm == 0 {
        fail(
            Rule::NonZero,
            format!("BM={bm_}, BK={bk}, bm={bmm}: tile sizes must be non-zero"),
        );
        return Verdict { violations: v };
    }

    if m % bm_ != 0 {
        fail(Rule::RowsDivisible, format!("M={m} is not a multiple of BM={bm_}"));
    }
    match tile.arch {
        KernelArch::Lut => {
            if k % bk != 0 {
                fail(Rule::ColsDivisible, format!("K={k} is not a multiple of BK={bk}"));
            }
        }
        KernelArch::Mad => {
            if (k % bk) % MAD_K_ALIGN != 0 {
                fail(
                    Rule::RemainderAligned,
                    format!("K % BK = {} is not a multiple of {MAD_K_ALIGN}", k % bk),
                );
            }
            if bk % MAD_K_ALIGN != 0 {
                fail(
                    Rule::BlockKAligned,
                    format!("BK={bk} is not a multiple of {MAD_K_ALIGN}"),
                );
            }
        }
    }
    if bm_ % bmm != 0 {
        fail(Rule::MicroDivides, format!("BM={bm_} is not a multiple of bm={bmm}"));
    }
    if !tile.arch.micro_tiles().contains(&bmm) {
        fail(
            Rule::MicroAllowed,
            format!("bm={bmm} not allowed for {} (allowed: {:?})", tile.arch, tile.arch.micro_tiles()),
        );
    }
    Verdict { violations: v }
}

/// Verdicts for every kernel instance of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanVerdict {
    pub kernels: Vec<Verdict>,
    /// Set when the plan does not even have one tile per kernel.
    pub arity: Option<String>,
}

impl PlanVerdict {
    pub fn is_legal(&self) -> bool {
        self.arity.is_none() && self.kernels.iter().all(Verdict::is_legal)
    }

    pub fn reason(&self) -> Option<String> {
        if let Some(a) = &self.arity {
            return Some(a.clone());
        }
        let parts: Vec<String> = self
            .kernels
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.reason().map(|r| format!("kernel {i}: {r}")))
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" | "))
        }
    }

    /// Legal → `Ok(())`, illegal → [`TuneError::ConstraintViolation`].
    pub fn into_result(self) -> Result<()> {
        match self.reason() {
            None => Ok(()),
            Some(r) => Err(TuneError::ConstraintViolation(r)),
        }
    }
}

/// Check a plan against the model's kernel shapes, instance by instance.
pub fn validate_plan(plan: &TilePlan, shapes: &[MatrixShape]) -> PlanVerdict {
    if plan.check_lengths().is_err() || plan.len() != shapes.len() {
        return PlanVerdict {
            kernels: Vec::new(),
            arity: Some(format!(
                "plan has {} tiles, model has {} kernels",
                plan.len(),
                shapes.len()
            )),
        };
    }
    PlanVerdict {
        kernels: plan
            .tiles()
            .zip(shapes)
            .map(|(t, s)| validate(&t, s))
            .collect(),
        arity: None,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ternary_common::ModelProfile;

    fn shape(m: usize, k: usize) -> MatrixShape {
        MatrixShape::new(m, k).unwrap()
    }

    #[test]
    fn lut_block_rows_3200x8640() {
        let s = shape(3200, 8640);
        let ok = TileConfig::new(KernelArch::Lut, 160, 64, 32);
        assert!(validate(&ok, &s).is_legal());

        let bad = TileConfig::new(KernelArch::Lut, 150, 64, 30);
        let v = validate(&bad, &s);
        assert!(!v.is_legal());
        assert!(v.violates(Rule::RowsDivisible));

        let bad_rows_only = TileConfig::new(KernelArch::Lut, 150, 64, 50);
        let v = validate(&bad_rows_only, &s);
        assert!(v.violates(Rule::RowsDivisible));
        assert!(v.reason().unwrap().contains("BM=150"));
    }

    #[test]
    fn mad_block_k_alignment() {
        let s = shape(3200, 8640);
        let bad = TileConfig::new(KernelArch::Mad, 160, 100, 32);
        let v = validate(&bad, &s);
        assert!(!v.is_legal());
        assert!(v.violates(Rule::BlockKAligned));

        let ok = TileConfig::new(KernelArch::Mad, 160, 128, 32);
        assert!(validate(&ok, &s).is_legal());
        // BK need not divide K for MAD: 8640 % 128 = 64, a whole number of 32s.
        assert_eq!(8640 % 128, 64);

        let square = shape(3200, 3200);
        assert!(!validate(&TileConfig::new(KernelArch::Mad, 160, 100, 32), &square).is_legal());
        assert!(validate(&TileConfig::new(KernelArch::Mad, 160, 128, 32), &square).is_legal());
    }

    #[test]
    fn micro_tile_sets() {
        let s = shape(3200, 3200);
        assert!(validate(&TileConfig::new(KernelArch::Lut, 320, 64, 64), &s).is_legal());
        let v = validate(&TileConfig::new(KernelArch::Mad, 320, 64, 64), &s);
        assert!(v.violates(Rule::MicroAllowed));
        assert!(!v.violates(Rule::MicroDivides));
    }

    #[test]
    fn zero_tiles_rejected() {
        let s = shape(64, 64);
        let v = validate(&TileConfig::new(KernelArch::Lut, 0, 64, 32), &s);
        assert_eq!(v.violations.len(), 1);
        assert!(v.violates(Rule::NonZero));
    }

    #[test]
    fn builtin_defaults_and_quick_plans_are_legal() {
        for name in ModelProfile::BUILTIN {
            let p = ModelProfile::builtin(name).unwrap();
            for arch in [KernelArch::Lut, KernelArch::Mad] {
                let v = validate_plan(&p.default_plan(arch), &p.kernels);
                assert!(v.is_legal(), "{name} {arch} default: {:?}", v.reason());
                for plan in p.curated_quick_plans(arch) {
                    assert!(validate_plan(&plan, &p.kernels).is_legal(), "{name} {plan}");
                }
            }
        }
    }

    #[test]
    fn tile_verdict_into_result() {
        let s = shape(3200, 8640);
        assert!(validate(&TileConfig::new(KernelArch::Lut, 160, 64, 32), &s)
            .into_result()
            .is_ok());
        match validate(&TileConfig::new(KernelArch::Lut, 150, 64, 32), &s).into_result() {
            Err(TuneError::ConstraintViolation(reason)) => assert!(reason.contains("BM=150")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn plan_arity_mismatch() {
        let p = ModelProfile::builtin("bitnet_b1_58-3B").unwrap();
        let plan = TilePlan::uniform(KernelArch::Lut, 2, (160, 64, 32));
        let v = validate_plan(&plan, &p.kernels);
        assert!(!v.is_legal());
        assert!(matches!(v.into_result(), Err(TuneError::ConstraintViolation(_))));
    }

    /// The rule table, restated independently of `validate`.
    fn table_says_legal(arch: KernelArch, m: usize, k: usize, bm_: usize, bk: usize, bmm: usize) -> bool {
        match arch {
            KernelArch::Lut => {
                m % bm_ == 0 && k % bk == 0 && bm_ % bmm == 0 && (bmm == 32 || bmm == 64)
            }
            KernelArch::Mad => {
                m % bm_ == 0 && (k % bk) % 32 == 0 && bk % 32 == 0 && bm_ % bmm == 0 && bmm == 32
            }
        }
    }

    proptest! {
        #[test]
        fn agrees_with_rule_table(
            lut in any::<bool>(),
            m in prop::sample::select(vec![1536usize, 3200, 4096, 8640, 14336]),
            k in prop::sample::select(vec![1536usize, 3200, 4096, 8640]),
            bm_ in 1usize..700,
            bk in 1usize..300,
            bmm in prop::sample::select(vec![16usize, 24, 32, 48, 64, 128]),
        ) {
            let arch = if lut { KernelArch::Lut } else { KernelArch::Mad };
            let verdict = validate(&TileConfig::new(arch, bm_, bk, bmm), &shape(m, k));
            prop_assert_eq!(verdict.is_legal(), table_says_legal(arch, m, k, bm_, bk, bmm));
            if verdict.is_legal() {
                prop_assert_eq!(m % bm_, 0);
            } else {
                prop_assert!(!verdict.violations.is_empty());
            }
        }
    }
}
