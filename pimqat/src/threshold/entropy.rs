//! Entropy calibration: pick the clipping point whose quantized histogram loses the least
//! information (KL divergence) with respect to the observed one.
use anyhow::{Result, ensure};
use rayon::prelude::*;

use super::max::MAX_EPS;

pub const DEFAULT_BINS: usize = 2048;
pub const DEFAULT_QUANT_BINS: usize = 128;

const KL_EPS: f32 = 1e-10;

fn histogram(values: &[f32], bins: usize, width: f32) -> Vec<f32> {
    let mut hist = vec![0.0f32; bins];
    for v in values {
        let idx = ((v.abs() / width) as usize).min(bins - 1);
        hist[idx] += 1.0;
    }
    hist
}

/// `KL(p || q)` over unnormalized counts.
fn kl_divergence(p: &[f32], q: &[f32]) -> f32 {
    let (p_sum, q_sum) = (p.iter().sum::<f32>(), q.iter().sum::<f32>());
    if p_sum == 0.0 || q_sum == 0.0 {
        return f32::INFINITY;
    }
    p.iter()
        .zip(q)
        .filter(|(p, _)| **p > 0.0)
        .map(|(p, q)| {
            let p = p / p_sum;
            let q = (q / q_sum).max(KL_EPS);
            p * (p / q).ln()
        })
        .sum()
}

/// Divergence when keeping the first `keep` bins: values above are clipped into the last kept
/// bin, and the kept range is requantized onto `quant_bins` levels.
fn clipped_divergence(hist: &[f32], keep: usize, quant_bins: usize) -> f32 {
    let mut reference = hist[..keep].to_vec();
    reference[keep - 1] += hist[keep..].iter().sum::<f32>();

    let sliced = &hist[..keep];
    let mut candidate = vec![0.0f32; keep];
    for j in 0..quant_bins {
        let (start, end) = (j * keep / quant_bins, (j + 1) * keep / quant_bins);
        let chunk = &sliced[start..end];
        let nonzero = chunk.iter().filter(|c| **c > 0.0).count();
        if nonzero == 0 {
            continue;
        }
        let share = chunk.iter().sum::<f32>() / nonzero as f32;
        for (c, q) in chunk.iter().zip(&mut candidate[start..end]) {
            if *c > 0.0 {
                *q = share;
            }
        }
    }
    kl_divergence(&reference, &candidate)
}

/// Log2 of the clipping point minimizing the divergence over `bins` histogram bins of `|x|`
/// quantized onto `quant_bins` levels.
pub fn entropy_log2_t(values: &[f32], bins: usize, quant_bins: usize) -> Result<f32> {
    ensure!(!values.is_empty(), "entropy threshold of an empty tensor");
    ensure!(
        quant_bins >= 2 && bins >= quant_bins,
        "entropy calibration needs bins ({}) >= quantization bins ({}) >= 2",
        bins,
        quant_bins
    );
    let max = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    if max == 0.0 {
        return Ok(MAX_EPS.log2());
    }
    let width = max / bins as f32;
    let hist = histogram(values, bins, width);

    let (_, keep) = (quant_bins..=bins)
        .into_par_iter()
        .map(|keep| (clipped_divergence(&hist, keep, quant_bins), keep))
        .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
        .unwrap_or((0.0, bins));
    Ok((keep as f32 * width).log2())
}
