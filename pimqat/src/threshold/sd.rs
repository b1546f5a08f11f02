use anyhow::{Result, ensure};

use crate::tensor::mean_std;

/// `log2(|mean| + 3 std)`, which leaves the tails of a bell-shaped distribution out of range.
pub fn three_sigma_log2_t(values: &[f32]) -> Result<f32> {
    ensure!(
        values.len() > 1,
        "3-sigma threshold needs at least two values, got {}",
        values.len()
    );
    let (mean, std) = mean_std(values);
    let log2_t = (mean.abs() + 3.0 * std).log2();
    ensure!(
        log2_t.is_finite(),
        "3-sigma threshold of constant zero values"
    );
    Ok(log2_t)
}
