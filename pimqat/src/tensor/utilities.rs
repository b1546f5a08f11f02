//! Module containing utility functions when dealing with tensors

use statrs::statistics::Statistics;

use super::{Tensor, TensorError};

/// Sums a list of tensors of identical shape, e.g. the partial outputs of several crossbar tiles.
pub fn sum_tensors(tensors: Vec<Tensor>) -> Result<Tensor, TensorError> {
    let mut iter = tensors.into_iter();
    let Some(first) = iter.next() else {
        return Err(TensorError::ParameterError(
            "cannot sum an empty list of tensors".to_string(),
        ));
    };
    iter.try_fold(first, |acc, t| acc.add(&t))
}

/// Mean and unbiased standard deviation of the values, computed in `f64`.
pub fn mean_std(values: &[f32]) -> (f32, f32) {
    let mean = values.iter().map(|v| *v as f64).mean();
    let std = values.iter().map(|v| *v as f64).std_dev();
    (mean as f32, std as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_tensors() {
        let a = Tensor::full(vec![2], 1.0);
        let b = Tensor::full(vec![2], 2.5);
        assert_eq!(sum_tensors(vec![a, b]).unwrap().get_data(), &[3.5, 3.5]);
        assert!(sum_tensors(vec![]).is_err());
    }

    #[test]
    fn test_mean_std() {
        let (mean, std) = mean_std(&[1.0, 2.0, 3.0, 4.0]);
        assert!((mean - 2.5).abs() < 1e-6);
        // unbiased: sqrt(5/3)
        assert!((std - (5.0f32 / 3.0).sqrt()).abs() < 1e-6);
    }
}
