use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Pooling {
    Max {
        kernel: usize,
        stride: usize,
        padding: usize,
    },
    Avg {
        kernel: usize,
        stride: usize,
    },
    /// averages into a fixed `(h, w)` output grid whatever the input size
    AdaptiveAvg { output: (usize, usize) },
    GlobalAvg,
}

impl Pooling {
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Pooling::Max {
                kernel,
                stride,
                padding,
            } => input.max_pool2d(*kernel, *stride, *padding)?,
            Pooling::Avg { kernel, stride } => input.avg_pool2d(*kernel, *stride)?,
            Pooling::AdaptiveAvg { output } => adaptive_avg_pool(input, *output)?,
            Pooling::GlobalAvg => input.global_avg_pool()?,
        })
    }

    pub fn describe(&self) -> String {
        match self {
            Pooling::Max { kernel, stride, .. } => {
                format!("MaxPool2D{{ kernel size: {}, stride: {} }}", kernel, stride)
            }
            Pooling::Avg { kernel, stride } => {
                format!("AvgPool2D{{ kernel size: {}, stride: {} }}", kernel, stride)
            }
            Pooling::AdaptiveAvg { output } => {
                format!("AdaptiveAvgPool2D{{ output: {}x{} }}", output.0, output.1)
            }
            Pooling::GlobalAvg => "GlobalAvgPool".to_string(),
        }
    }
}

/// Bin `i` of `n` over an axis of `size` covers `[floor(i*size/n), ceil((i+1)*size/n))`.
fn adaptive_avg_pool(input: &Tensor, output: (usize, usize)) -> Result<Tensor> {
    let shape = input.get_shape();
    ensure!(
        shape.len() == 4 && output.0 > 0 && output.1 > 0,
        "adaptive pooling to {:?} over {:?}",
        output,
        shape
    );
    let (height, width) = (shape[2], shape[3]);
    let bins = |i: usize, n: usize, size: usize| (i * size / n, ((i + 1) * size).div_ceil(n));
    let mut data = Vec::with_capacity(shape[0] * shape[1] * output.0 * output.1);
    for plane in input.get_data().chunks(height * width) {
        for oy in 0..output.0 {
            let (y0, y1) = bins(oy, output.0, height);
            for ox in 0..output.1 {
                let (x0, x1) = bins(ox, output.1, width);
                let mut acc = 0.0;
                for y in y0..y1 {
                    acc += plane[y * width + x0..y * width + x1].iter().sum::<f32>();
                }
                data.push(acc / ((y1 - y0) * (x1 - x0)) as f32);
            }
        }
    }
    Ok(Tensor::new(
        vec![shape[0], shape[1], output.0, output.1],
        data,
    ))
}
