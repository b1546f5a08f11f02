use anyhow::{Result, ensure};
use itertools::izip;
use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

pub const DEFAULT_BN_EPS: f32 = 1e-5;

/// Inference-mode batch normalization over the channel axis, running statistics only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchNorm {
    pub(crate) gamma: Vec<f32>,
    pub(crate) beta: Vec<f32>,
    pub(crate) running_mean: Vec<f32>,
    pub(crate) running_var: Vec<f32>,
    pub(crate) eps: f32,
}

impl BatchNorm {
    pub fn new(
        gamma: Vec<f32>,
        beta: Vec<f32>,
        running_mean: Vec<f32>,
        running_var: Vec<f32>,
        eps: f32,
    ) -> Result<Self> {
        let channels = gamma.len();
        ensure!(
            beta.len() == channels && running_mean.len() == channels && running_var.len() == channels,
            "batch norm parameters disagree on the channel count"
        );
        ensure!(
            running_var.iter().all(|v| *v + eps > 0.0),
            "batch norm variance plus eps must be positive"
        );
        Ok(Self {
            gamma,
            beta,
            running_mean,
            running_var,
            eps,
        })
    }

    pub fn channels(&self) -> usize {
        self.gamma.len()
    }

    /// Per channel `(scale, shift)` such that `bn(x) = x * scale + shift`.
    pub fn affine(&self) -> (Vec<f32>, Vec<f32>) {
        izip!(&self.gamma, &self.beta, &self.running_mean, &self.running_var)
            .map(|(g, b, m, v)| {
                let scale = g / (v + self.eps).sqrt();
                (scale, b - m * scale)
            })
            .unzip()
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let (scale, shift) = self.affine();
        Ok(input.channel_affine(&scale, &shift)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_running_stats() {
        let bn = BatchNorm::new(vec![2.0], vec![1.0], vec![3.0], vec![4.0], 0.0).unwrap();
        let out = bn.forward(&Tensor::new(vec![1, 1, 1, 2], vec![3.0, 5.0])).unwrap();
        assert_eq!(out.get_data(), &[1.0, 3.0]);
    }

    #[test]
    fn test_rejects_mismatched_channels() {
        assert!(BatchNorm::new(vec![1.0, 1.0], vec![0.0], vec![0.0], vec![1.0], 1e-5).is_err());
    }
}
