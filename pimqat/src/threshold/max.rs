use anyhow::{Result, ensure};

pub const MAX_EPS: f32 = 1e-8;

/// `log2(max|x| + eps)`, so that the quantization range covers every value.
pub fn max_log2_t(values: &[f32]) -> Result<f32> {
    ensure!(!values.is_empty(), "max threshold of an empty tensor");
    let max = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    Ok((max + MAX_EPS).log2())
}
