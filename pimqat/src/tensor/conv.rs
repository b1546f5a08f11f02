//! Direct NCHW convolution and pooling kernels.
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{Tensor, TensorError};

/// Geometry of a 2D convolution, `(height, width)` pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dParams {
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: (usize, usize),
}

impl Conv2dParams {
    pub fn new(stride: usize, padding: usize) -> Self {
        Self {
            stride: (stride, stride),
            padding: (padding, padding),
            dilation: (1, 1),
        }
    }

    fn output_dim(&self, input: usize, kernel: usize, axis: usize) -> Option<usize> {
        let (stride, padding, dilation) = if axis == 0 {
            (self.stride.0, self.padding.0, self.dilation.0)
        } else {
            (self.stride.1, self.padding.1, self.dilation.1)
        };
        let span = dilation * (kernel - 1) + 1;
        (input + 2 * padding)
            .checked_sub(span)
            .map(|v| v / stride + 1)
    }
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Self::new(1, 0)
    }
}

impl Tensor {
    /// `input [N, C, H, W]` convolved with `weight [O, C, KH, KW]`, optional `bias [O]`.
    pub fn conv2d(
        &self,
        weight: &Tensor,
        bias: Option<&Tensor>,
        params: &Conv2dParams,
    ) -> Result<Tensor, TensorError> {
        if self.rank() != 4 || weight.rank() != 4 || self.shape[1] != weight.shape[1] {
            return Err(TensorError::ShapeMismatch(format!(
                "conv2d input {:?} with weight {:?}",
                self.shape, weight.shape
            )));
        }
        let (batch, channels, height, width) =
            (self.shape[0], self.shape[1], self.shape[2], self.shape[3]);
        let (out_channels, kh, kw) = (weight.shape[0], weight.shape[2], weight.shape[3]);
        if let Some(b) = bias {
            if b.len() != out_channels {
                return Err(TensorError::ShapeMismatch(format!(
                    "conv2d bias of length {} for {} output channels",
                    b.len(),
                    out_channels
                )));
            }
        }
        let (Some(out_h), Some(out_w)) = (
            params.output_dim(height, kh, 0),
            params.output_dim(width, kw, 1),
        ) else {
            return Err(TensorError::ParameterError(format!(
                "kernel {}x{} does not fit input {}x{}",
                kh, kw, height, width
            )));
        };
        let plane = out_h * out_w;
        let mut out = vec![0.0f32; batch * out_channels * plane];
        out.par_chunks_mut(plane)
            .enumerate()
            .for_each(|(idx, out_plane)| {
                let n = idx / out_channels;
                let o = idx % out_channels;
                let b = bias.map_or(0.0, |b| b.data[o]);
                for oy in 0..out_h {
                    for ox in 0..out_w {
                        let mut acc = b;
                        for c in 0..channels {
                            let in_base = (n * channels + c) * height * width;
                            let w_base = (o * channels + c) * kh * kw;
                            for ky in 0..kh {
                                let iy = (oy * params.stride.0 + ky * params.dilation.0) as isize
                                    - params.padding.0 as isize;
                                if iy < 0 || iy >= height as isize {
                                    continue;
                                }
                                for kx in 0..kw {
                                    let ix = (ox * params.stride.1 + kx * params.dilation.1)
                                        as isize
                                        - params.padding.1 as isize;
                                    if ix < 0 || ix >= width as isize {
                                        continue;
                                    }
                                    acc += self.data[in_base + iy as usize * width + ix as usize]
                                        * weight.data[w_base + ky * kw + kx];
                                }
                            }
                        }
                        out_plane[oy * out_w + ox] = acc;
                    }
                }
            });
        Ok(Tensor::new(vec![batch, out_channels, out_h, out_w], out))
    }

    pub fn max_pool2d(
        &self,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> Result<Tensor, TensorError> {
        self.pool2d(kernel, stride, padding, f32::NEG_INFINITY, f32::max, |acc, _| acc)
    }

    pub fn avg_pool2d(&self, kernel: usize, stride: usize) -> Result<Tensor, TensorError> {
        self.pool2d(kernel, stride, 0, 0.0, |a, b| a + b, |acc, count| {
            acc / count as f32
        })
    }

    /// Averages every spatial plane: `[N, C, H, W] -> [N, C, 1, 1]`
    pub fn global_avg_pool(&self) -> Result<Tensor, TensorError> {
        if self.rank() != 4 {
            return Err(TensorError::ShapeMismatch(format!(
                "global average pool expects NCHW, got {:?}",
                self.shape
            )));
        }
        let plane = self.shape[2] * self.shape[3];
        let data = self
            .data
            .chunks(plane)
            .map(|c| c.iter().sum::<f32>() / plane as f32)
            .collect();
        Ok(Tensor::new(vec![self.shape[0], self.shape[1], 1, 1], data))
    }

    fn pool2d<R, F>(
        &self,
        kernel: usize,
        stride: usize,
        padding: usize,
        init: f32,
        reduce: R,
        finish: F,
    ) -> Result<Tensor, TensorError>
    where
        R: Fn(f32, f32) -> f32,
        F: Fn(f32, usize) -> f32,
    {
        if self.rank() != 4 || kernel == 0 || stride == 0 {
            return Err(TensorError::ParameterError(format!(
                "pooling {}x{}/{} over {:?}",
                kernel, kernel, stride, self.shape
            )));
        }
        let (batch, channels, height, width) =
            (self.shape[0], self.shape[1], self.shape[2], self.shape[3]);
        let params = Conv2dParams::new(stride, padding);
        let (Some(out_h), Some(out_w)) = (
            params.output_dim(height, kernel, 0),
            params.output_dim(width, kernel, 1),
        ) else {
            return Err(TensorError::ParameterError(format!(
                "pooling window {} does not fit input {}x{}",
                kernel, height, width
            )));
        };
        let mut out = Vec::with_capacity(batch * channels * out_h * out_w);
        for plane in self.data.chunks(height * width) {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = init;
                    let mut count = 0;
                    for ky in 0..kernel {
                        let iy = (oy * stride + ky) as isize - padding as isize;
                        if iy < 0 || iy >= height as isize {
                            continue;
                        }
                        for kx in 0..kernel {
                            let ix = (ox * stride + kx) as isize - padding as isize;
                            if ix < 0 || ix >= width as isize {
                                continue;
                            }
                            acc = reduce(acc, plane[iy as usize * width + ix as usize]);
                            count += 1;
                        }
                    }
                    out.push(finish(acc, count.max(1)));
                }
            }
        }
        Ok(Tensor::new(vec![batch, channels, out_h, out_w], out))
    }
}
