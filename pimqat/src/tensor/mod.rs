//! Dense `f32` tensors in row-major (NCHW for images) layout, together with the small set of
//! kernels the quantized layers need.

mod conv;
mod error;
mod utilities;

pub use conv::Conv2dParams;
pub use error::TensorError;
pub use utilities::{mean_std, sum_tensors};

use rand::{Rng, SeedableRng, rngs::StdRng, thread_rng};
use serde::{Deserialize, Serialize};

pub type Shape = Vec<usize>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// The dimensions of the tensor
    shape: Shape,
    /// The actual data, row-major
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor from its shape and data. Panics when the data length does not match
    /// the shape, that is always a programming error.
    pub fn new(shape: Shape, data: Vec<f32>) -> Self {
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "tensor data length does not match shape {:?}",
            shape
        );
        Self { shape, data }
    }

    pub fn zeros(shape: Shape) -> Self {
        let len = shape.iter().product();
        Self::new(shape, vec![0.0; len])
    }

    pub fn full(shape: Shape, value: f32) -> Self {
        let len = shape.iter().product();
        Self::new(shape, vec![value; len])
    }

    /// Uniform values in `[-1, 1)`
    pub fn random(shape: Shape) -> Self {
        let mut rng = thread_rng();
        let len = shape.iter().product();
        let data = (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        Self::new(shape, data)
    }

    pub fn random_seed(shape: Shape, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let len = shape.iter().product();
        let data = (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        Self::new(shape, data)
    }

    pub fn get_shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn get_data(&self) -> &[f32] {
        &self.data
    }

    pub fn get_data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Element at the given coordinates.
    pub fn get(&self, coords: &[usize]) -> Result<f32, TensorError> {
        Ok(self.data[self.get_index(coords)?])
    }

    /// Converts a position given in "cartesian" form to the relevant index in `self.data`.
    pub fn get_index(&self, coords: &[usize]) -> Result<usize, TensorError> {
        if coords.len() != self.shape.len() {
            return Err(TensorError::ParameterError(format!(
                "coordinates {:?} do not match rank of shape {:?}",
                coords, self.shape
            )));
        }
        coords
            .iter()
            .zip(self.shape.iter())
            .try_fold(0usize, |index, (&coord, &dim)| {
                if coord >= dim {
                    return Err(TensorError::ParameterError(format!(
                        "coordinate {} out of bounds for axis of size {}",
                        coord, dim
                    )));
                }
                Ok(index * dim + coord)
            })
    }

    pub fn map<F: Fn(f32) -> f32>(&self, f: F) -> Tensor {
        Tensor::new(self.shape.clone(), self.data.iter().map(|v| f(*v)).collect())
    }

    /// Element-wise combination of two tensors of identical shape.
    pub fn zip_map<F: Fn(f32, f32) -> f32>(
        &self,
        other: &Tensor,
        f: F,
    ) -> Result<Tensor, TensorError> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch(format!(
                "{:?} vs {:?}",
                self.shape, other.shape
            )));
        }
        Ok(Tensor::new(
            self.shape.clone(),
            self.data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| f(*a, *b))
                .collect(),
        ))
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_map(other, |a, b| a + b)
    }

    pub fn scalar_mul(&self, scalar: f32) -> Tensor {
        self.map(|v| v * scalar)
    }

    pub fn relu(&self) -> Tensor {
        self.map(|v| v.max(0.0))
    }

    pub fn max_abs_output(&self) -> f32 {
        self.data.iter().fold(0.0f32, |acc, v| acc.max(v.abs()))
    }

    pub fn max_value(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn min_value(&self) -> f32 {
        self.data.iter().copied().fold(f32::INFINITY, f32::min)
    }

    /// Returns the same data under a new shape of identical size.
    pub fn reshape(self, shape: Shape) -> Result<Tensor, TensorError> {
        if shape.iter().product::<usize>() != self.data.len() {
            return Err(TensorError::ShapeMismatch(format!(
                "cannot reshape {:?} into {:?}",
                self.shape, shape
            )));
        }
        Ok(Tensor::new(shape, self.data))
    }

    /// Collapses every axis but the first: `[N, ...] -> [N, rest]`.
    pub fn flatten_batch(self) -> Result<Tensor, TensorError> {
        let Some(&batch) = self.shape.first() else {
            return Err(TensorError::ParameterError(
                "cannot flatten a scalar tensor".to_string(),
            ));
        };
        let rest = self.data.len() / batch.max(1);
        self.reshape(vec![batch, rest])
    }

    /// Slice `[start, start + len)` along `axis`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Tensor, TensorError> {
        if axis >= self.shape.len() {
            return Err(TensorError::ParameterError(format!(
                "axis {} out of range for shape {:?}",
                axis, self.shape
            )));
        }
        if start + len > self.shape[axis] {
            return Err(TensorError::ParameterError(format!(
                "range {}..{} exceeds axis {} of size {}",
                start,
                start + len,
                axis,
                self.shape[axis]
            )));
        }
        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();
        let axis_dim = self.shape[axis];
        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = o * axis_dim * inner;
            data.extend_from_slice(&self.data[base + start * inner..base + (start + len) * inner]);
        }
        let mut shape = self.shape.clone();
        shape[axis] = len;
        Ok(Tensor::new(shape, data))
    }

    /// `input [N, in] x weight[out, in]^T + bias[out]`
    pub fn linear(&self, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor, TensorError> {
        if self.rank() != 2 || weight.rank() != 2 || self.shape[1] != weight.shape[1] {
            return Err(TensorError::ShapeMismatch(format!(
                "linear input {:?} with weight {:?}",
                self.shape, weight.shape
            )));
        }
        let (batch, in_features) = (self.shape[0], self.shape[1]);
        let out_features = weight.shape[0];
        if let Some(b) = bias {
            if b.len() != out_features {
                return Err(TensorError::ShapeMismatch(format!(
                    "linear bias of length {} for {} outputs",
                    b.len(),
                    out_features
                )));
            }
        }
        let mut out = vec![0.0f32; batch * out_features];
        for n in 0..batch {
            let row = &self.data[n * in_features..(n + 1) * in_features];
            for o in 0..out_features {
                let w = &weight.data[o * in_features..(o + 1) * in_features];
                let acc: f32 = row.iter().zip(w.iter()).map(|(x, w)| x * w).sum();
                out[n * out_features + o] = acc + bias.map_or(0.0, |b| b.data[o]);
            }
        }
        Ok(Tensor::new(vec![batch, out_features], out))
    }

    /// Applies `x * scale[c] + shift[c]` over the channel axis (axis 1) of an NC... tensor.
    pub fn channel_affine(&self, scale: &[f32], shift: &[f32]) -> Result<Tensor, TensorError> {
        if self.rank() < 2 || self.shape[1] != scale.len() || scale.len() != shift.len() {
            return Err(TensorError::ShapeMismatch(format!(
                "channel affine over {:?} with {} scales and {} shifts",
                self.shape,
                scale.len(),
                shift.len()
            )));
        }
        let channels = self.shape[1];
        let inner: usize = self.shape[2..].iter().product();
        let data = self
            .data
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let c = (i / inner) % channels;
                v * scale[c] + shift[c]
            })
            .collect();
        Ok(Tensor::new(self.shape.clone(), data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_index() {
        let tensor = Tensor::zeros(vec![2, 2, 3]);
        assert_eq!(tensor.get_index(&[0, 1, 2]).unwrap(), 5);
        assert_eq!(tensor.get_index(&[1, 0, 0]).unwrap(), 6);
        assert!(tensor.get_index(&[2, 0, 0]).is_err());
        assert!(tensor.get_index(&[0, 0]).is_err());
    }

    #[test]
    fn test_narrow_channels() {
        let t = Tensor::new(vec![1, 3, 1, 2], vec![1., 2., 3., 4., 5., 6.]);
        let n = t.narrow(1, 1, 2).unwrap();
        assert_eq!(n.get_shape(), &[1, 2, 1, 2]);
        assert_eq!(n.get_data(), &[3., 4., 5., 6.]);
        assert!(t.narrow(1, 2, 2).is_err());
    }

    #[test]
    fn test_linear() {
        let input = Tensor::new(vec![1, 2], vec![1.0, 2.0]);
        let weight = Tensor::new(vec![2, 2], vec![1.0, 0.0, 0.5, -1.0]);
        let bias = Tensor::new(vec![2], vec![0.25, 0.0]);
        let out = input.linear(&weight, Some(&bias)).unwrap();
        assert_eq!(out.get_data(), &[1.25, -1.5]);
    }

    #[test]
    fn test_channel_affine() {
        let t = Tensor::new(vec![1, 2, 1, 1], vec![1.0, 1.0]);
        let out = t.channel_affine(&[2.0, 3.0], &[0.0, -1.0]).unwrap();
        assert_eq!(out.get_data(), &[2.0, 2.0]);
    }
}
