//! Log2-scaled fake quantization with a straight-through backward pass.
use anyhow::{Result, ensure};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::{env, f32::consts::LN_2};

use crate::tensor::Tensor;

/// Bit widths of the three quantized roles of a PIM unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitWidths {
    pub weight: u32,
    pub bias: u32,
    pub acti: u32,
}

impl Default for BitWidths {
    fn default() -> Self {
        // QLC cells hold a signed 5-bit weight over even/odd rows, a bias spans the whole array
        Self {
            weight: 5,
            bias: 12,
            acti: 5,
        }
    }
}

impl BitWidths {
    /// Reads `PIMQAT_WEIGHT_BITS`, `PIMQAT_BIAS_BITS` and `PIMQAT_ACTI_BITS`, keeping the default
    /// for any variable that is unset or does not parse.
    pub fn from_env() -> Self {
        let default = Self::default();
        let read = |key: &str, fallback: u32| {
            env::var(key)
                .ok()
                .and_then(|val| val.parse::<u32>().ok())
                .filter(|bits| (2..=24).contains(bits))
                .unwrap_or(fallback)
        };
        Self {
            weight: read("PIMQAT_WEIGHT_BITS", default.weight),
            bias: read("PIMQAT_BIAS_BITS", default.bias),
            acti: read("PIMQAT_ACTI_BITS", default.acti),
        }
    }
}

// Get the bit widths from environment variables or use the default values
pub static BIT_WIDTHS: Lazy<BitWidths> = Lazy::new(BitWidths::from_env);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantMode {
    /// `[-alpha, alpha]` onto `2^(b-1) - 1` levels per side
    Signed,
    /// `[0, alpha]` onto `2^b - 1` levels
    Unsigned,
}

impl QuantMode {
    pub fn from_signed(signed: bool) -> Self {
        if signed {
            QuantMode::Signed
        } else {
            QuantMode::Unsigned
        }
    }

    fn levels(&self, bits: u32) -> f32 {
        match self {
            QuantMode::Signed => ((1u64 << (bits - 1)) - 1) as f32,
            QuantMode::Unsigned => ((1u64 << bits) - 1) as f32,
        }
    }

    fn clamp_range(&self) -> (f32, f32) {
        match self {
            QuantMode::Signed => (-1.0, 1.0),
            QuantMode::Unsigned => (0.0, 1.0),
        }
    }
}

/// Everything the quantizer needs besides the input.
#[derive(Debug, Clone, Copy)]
pub struct QuantParams {
    /// log2 of the clipping threshold
    pub log2_t: f32,
    pub bits: u32,
    pub mode: QuantMode,
    /// snap the threshold to a power of two (the scale an ADC can realize)
    pub round_threshold: bool,
}

impl QuantParams {
    pub fn alpha(&self) -> Result<f32> {
        let exponent = if self.round_threshold {
            self.log2_t.round_ties_even()
        } else {
            self.log2_t
        };
        let alpha = exponent.exp2();
        ensure!(
            alpha.is_finite() && alpha > 0.0,
            "invalid quantization scale 2^{} (log2 threshold {})",
            exponent,
            self.log2_t
        );
        Ok(alpha)
    }

    fn check_bits(&self) -> Result<()> {
        let min = match self.mode {
            QuantMode::Signed => 2,
            QuantMode::Unsigned => 1,
        };
        ensure!(
            self.bits >= min && self.bits <= 31,
            "unsupported bit width {} for {:?} quantization",
            self.bits,
            self.mode
        );
        Ok(())
    }
}

/// Fake-quantizes `x`: clamp to the threshold, round onto the integer grid, rescale.
pub fn fake_quant(x: &Tensor, params: &QuantParams) -> Result<Tensor> {
    params.check_bits()?;
    let alpha = params.alpha()?;
    let levels = params.mode.levels(params.bits);
    let (lo, hi) = params.mode.clamp_range();
    let step = alpha / levels;
    Ok(x.map(|v| ((v / alpha).clamp(lo, hi) * levels).round_ties_even() * step))
}

/// Gradients produced by [`fake_quant_backward`].
#[derive(Debug, Clone)]
pub struct QuantGrad {
    pub input: Tensor,
    /// summed over every element, ready to be accumulated into the threshold
    pub log2_t: f32,
}

/// Straight-through estimator for [`fake_quant`]. Rounding passes the gradient unchanged, the
/// clamp blocks it outside of the range. The threshold receives the gradient flowing through
/// `alpha`, none when the threshold is snapped to a power of two.
pub fn fake_quant_backward(x: &Tensor, params: &QuantParams, grad_out: &Tensor) -> Result<QuantGrad> {
    params.check_bits()?;
    ensure!(
        x.get_shape() == grad_out.get_shape(),
        "gradient shape {:?} does not match input shape {:?}",
        grad_out.get_shape(),
        x.get_shape()
    );
    let alpha = params.alpha()?;
    let levels = params.mode.levels(params.bits);
    let (lo, hi) = params.mode.clamp_range();
    let mut grad_input = Vec::with_capacity(x.len());
    let mut grad_t = 0.0f64;
    for (&v, &g) in x.get_data().iter().zip(grad_out.get_data()) {
        let scaled = v / alpha;
        let clamped = scaled.clamp(lo, hi);
        let q = (clamped * levels).round_ties_even() / levels;
        let in_range = scaled >= lo && scaled <= hi;
        grad_input.push(if in_range { g } else { 0.0 });
        if !params.round_threshold {
            let d_alpha = if in_range { q - scaled } else { q };
            grad_t += (g * LN_2 * alpha * d_alpha) as f64;
        }
    }
    Ok(QuantGrad {
        input: Tensor::new(x.get_shape().to_vec(), grad_input),
        log2_t: grad_t as f32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn params(log2_t: f32, bits: u32, mode: QuantMode, round_threshold: bool) -> QuantParams {
        QuantParams {
            log2_t,
            bits,
            mode,
            round_threshold,
        }
    }

    #[rstest]
    #[case(QuantMode::Signed, 5, 0.0)]
    #[case(QuantMode::Signed, 8, 1.3)]
    #[case(QuantMode::Unsigned, 5, -0.5)]
    #[case(QuantMode::Unsigned, 3, 2.0)]
    fn test_quantization_error_bound(
        #[case] mode: QuantMode,
        #[case] bits: u32,
        #[case] log2_t: f32,
    ) {
        let p = params(log2_t, bits, mode, false);
        let alpha = p.alpha().unwrap();
        let x = Tensor::random_seed(vec![256], 3).scalar_mul(alpha);
        let x = match mode {
            QuantMode::Signed => x,
            QuantMode::Unsigned => x.map(f32::abs),
        };
        let q = fake_quant(&x, &p).unwrap();
        let bound = alpha / mode.levels(bits);
        for (a, b) in x.get_data().iter().zip(q.get_data()) {
            assert!((a - b).abs() <= bound / 2.0 + 1e-6, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_clamping() {
        let x = Tensor::new(vec![3], vec![-5.0, 0.5, 5.0]);
        let q = fake_quant(&x, &params(0.0, 5, QuantMode::Signed, true)).unwrap();
        assert_eq!(q.get_data()[0], -1.0);
        assert_eq!(q.get_data()[2], 1.0);
        let q = fake_quant(&x, &params(0.0, 5, QuantMode::Unsigned, true)).unwrap();
        assert_eq!(q.get_data()[0], 0.0);
        assert_eq!(q.get_data()[2], 1.0);
    }

    #[test]
    fn test_rounded_threshold_uses_power_of_two() {
        let p = params(1.4, 5, QuantMode::Signed, true);
        assert_eq!(p.alpha().unwrap(), 2.0);
        let p = params(1.4, 5, QuantMode::Signed, false);
        assert!((p.alpha().unwrap() - 1.4f32.exp2()).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_scale_is_rejected() {
        let x = Tensor::zeros(vec![2]);
        assert!(fake_quant(&x, &params(f32::NAN, 5, QuantMode::Signed, false)).is_err());
        assert!(fake_quant(&x, &params(200.0, 5, QuantMode::Signed, false)).is_err());
        assert!(fake_quant(&x, &params(-200.0, 5, QuantMode::Signed, false)).is_err());
    }

    #[test]
    fn test_straight_through_gradient() {
        let x = Tensor::new(vec![4], vec![-3.0, -0.4, 0.7, 2.5]);
        let grad_out = Tensor::full(vec![4], 1.0);
        let g = fake_quant_backward(&x, &params(0.0, 5, QuantMode::Signed, false), &grad_out)
            .unwrap();
        assert_eq!(g.input.get_data(), &[0.0, 1.0, 1.0, 0.0]);

        let g = fake_quant_backward(&x, &params(0.0, 5, QuantMode::Unsigned, false), &grad_out)
            .unwrap();
        assert_eq!(g.input.get_data(), &[0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_threshold_gradient() {
        // clamped elements contribute ln2 * alpha * q, in-range ones ln2 * alpha * (q - x/alpha)
        let x = Tensor::new(vec![2], vec![4.0, 0.5]);
        let grad_out = Tensor::full(vec![2], 1.0);
        let p = params(0.0, 2, QuantMode::Signed, false);
        let g = fake_quant_backward(&x, &p, &grad_out).unwrap();
        // levels = 1: q(4.0) = 1, q(0.5) = round_ties_even(0.5) = 0
        let expected = LN_2 * (1.0 + (0.0 - 0.5));
        assert!((g.log2_t - expected).abs() < 1e-6);

        let p = params(0.0, 2, QuantMode::Signed, true);
        let g = fake_quant_backward(&x, &p, &grad_out).unwrap();
        assert_eq!(g.log2_t, 0.0);
    }

    #[test]
    fn test_default_bit_widths() {
        let bits = BitWidths::default();
        assert_eq!((bits.weight, bits.bias, bits.acti), (5, 12, 5));
    }
}
