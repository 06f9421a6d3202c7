//! Activation quantisation: the int8 input both kernel families consume.
//!
//! Per-tensor absmax: `q = round(x / s)` with `s = max|x| / 127`, clamped to
//! `[-127, 127]`. `-128` is never produced, which keeps the MAD family's
//! `sign_epi8` products in range.

/// Largest int8 magnitude an activation may take.
pub const ACT_MAX: i8 = 127;

/// Quantised activation vector.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedActivations {
    pub values: Vec<i8>,
    /// `x ≈ values * scale`.
    pub scale: f32,
}

impl QuantizedActivations {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Absmax int8 quantisation of `x`.
pub fn quantize_activations(x: &[f32]) -> QuantizedActivations {
    let absmax = x
        .iter()
        .filter(|v| v.is_finite())
        .fold(0.0f32, |m, v| m.max(v.abs()));
    if absmax == 0.0 {
        return QuantizedActivations {
            values: vec![0; x.len()],
            scale: 1.0,
        };
    }
    let scale = absmax / ACT_MAX as f32;
    let inv = 1.0 / scale;
    let values = x
        .iter()
        .map(|&v| {
            let q = (v * inv).round();
            if q.is_nan() {
                0
            } else {
                q.clamp(-(ACT_MAX as f32), ACT_MAX as f32) as i8
            }
        })
        .collect();
    QuantizedActivations { values, scale }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absmax_maps_to_127() {
        let q = quantize_activations(&[-2.0, 0.0, 0.5, 2.0]);
        assert_eq!(q.values, vec![-127, 0, 32, 127]);
        assert!((q.scale - 2.0 / 127.0).abs() < 1e-9);
    }

    #[test]
    fn zeros_and_non_finite() {
        let q = quantize_activations(&[0.0, 0.0]);
        assert_eq!(q.values, vec![0, 0]);
        assert_eq!(q.scale, 1.0);

        let q = quantize_activations(&[f32::NAN, 1.0, f32::INFINITY]);
        assert_eq!(q.values, vec![0, 127, 127]);
    }

    #[test]
    fn never_minus_128() {
        let x: Vec<f32> = (0..256).map(|i| i as f32 - 128.0).collect();
        let q = quantize_activations(&x);
        assert!(q.values.iter().all(|&v| v >= -127));
    }
}
