use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

/// Collapses everything but the batch axis, e.g. between the features and the classifier.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Flatten;

impl Flatten {
    pub fn forward(&self, input: Tensor) -> Result<Tensor> {
        Ok(input.flatten_batch()?)
    }

    pub fn describe(&self) -> String {
        "Flatten".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_keeps_batch() {
        let out = Flatten
            .forward(Tensor::zeros(vec![2, 3, 2, 2]))
            .unwrap();
        assert_eq!(out.get_shape(), &[2, 12]);
    }
}
