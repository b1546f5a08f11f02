use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use super::{LayerOutput, WeightQuantized};
use crate::{
    hardware::{BoundUnit, PimContext, QuantPhase, ThresholdId},
    tensor::{Conv2dParams, Tensor, mean_std},
};

/// 2D convolution mapped onto crossbars, `weight [out, in, kh, kw]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conv {
    pub(crate) weight: Tensor,
    pub(crate) bias: Option<Tensor>,
    pub(crate) params: Conv2dParams,
    pub(crate) weight_t: ThresholdId,
    pub(crate) bias_t: ThresholdId,
    pub(crate) normalize: bool,
    pub(crate) last: bool,
}

impl Conv {
    pub fn new(
        weight: Tensor,
        bias: Option<Tensor>,
        params: Conv2dParams,
        weight_t: ThresholdId,
        bias_t: ThresholdId,
    ) -> Result<Self> {
        ensure!(
            weight.rank() == 4,
            "convolution weight must be [out, in, kh, kw], got {:?}",
            weight.get_shape()
        );
        if let Some(b) = &bias {
            ensure!(
                b.len() == weight.get_shape()[0],
                "convolution bias has {} entries for {} output channels",
                b.len(),
                weight.get_shape()[0]
            );
        }
        Ok(Self {
            weight,
            bias,
            params,
            weight_t,
            bias_t,
            normalize: true,
            last: false,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.weight.get_shape()[1]
    }

    pub fn out_channels(&self) -> usize {
        self.weight.get_shape()[0]
    }

    pub fn kernel_size(&self) -> (usize, usize) {
        (self.weight.get_shape()[2], self.weight.get_shape()[3])
    }

    pub fn params(&self) -> &Conv2dParams {
        &self.params
    }

    /// The weight fed to the quantizer: zero mean, unit (unbiased) std when normalization is on.
    pub fn effective_weight(&self) -> Result<Tensor> {
        if !self.normalize {
            return Ok(self.weight.clone());
        }
        let (mean, std) = mean_std(self.weight.get_data());
        ensure!(
            std.is_finite() && std > 0.0,
            "cannot normalize a convolution weight with std {}",
            std
        );
        Ok(self.weight.map(|w| (w - mean) / std))
    }

    pub fn forward(
        &self,
        input: &Tensor,
        unit: Option<BoundUnit<'_>>,
        ctx: &PimContext,
    ) -> Result<LayerOutput> {
        if self.last || ctx.phase == QuantPhase::Float {
            return Ok(LayerOutput::Whole(input.conv2d(
                &self.weight,
                self.bias.as_ref(),
                &self.params,
            )?));
        }
        let unit = unit.context("quantized convolution has no PIM unit attached")?;
        let weight = unit.quant_weight(&self.effective_weight()?)?;
        let bias = self
            .bias
            .as_ref()
            .map(|b| unit.quant_bias(b))
            .transpose()?;
        conv_on_crossbars(input, &weight, bias.as_ref(), &self.params, ctx)
    }
}

impl WeightQuantized for Conv {
    fn weight_threshold(&self) -> ThresholdId {
        self.weight_t
    }

    fn bias_threshold(&self) -> ThresholdId {
        self.bias_t
    }

    fn current_weight(&self) -> &Tensor {
        &self.weight
    }

    fn current_bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }
}

/// Runs an already quantized convolution. During hardware inference the input channels are
/// split into groups of `rows / (kh * kw)`, one group per crossbar tile, and every tile yields
/// its own partial sum. Only the first tile adds the bias.
pub(crate) fn conv_on_crossbars(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    params: &Conv2dParams,
    ctx: &PimContext,
) -> Result<LayerOutput> {
    if ctx.phase != QuantPhase::HardwareInference {
        return Ok(LayerOutput::Whole(input.conv2d(weight, bias, params)?));
    }
    let shape = weight.get_shape();
    let granularity = (ctx.spec.num_rows / (shape[2] * shape[3])).max(1);
    let channels = input.get_shape().get(1).copied().unwrap_or(0);
    let mut partials = Vec::with_capacity(channels.div_ceil(granularity));
    let mut start = 0;
    while start < channels {
        let len = granularity.min(channels - start);
        let tile_input = input.narrow(1, start, len)?;
        let tile_weight = weight.narrow(1, start, len)?;
        let tile_bias = if start == 0 { bias } else { None };
        partials.push(tile_input.conv2d(&tile_weight, tile_bias, params)?);
        start += len;
    }
    Ok(LayerOutput::Partials(partials))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hardware::{PimUnit, ThresholdStore},
        tensor::sum_tensors,
    };

    fn conv(store: &mut ThresholdStore, in_c: usize) -> Conv {
        let weight = Tensor::random_seed(vec![4, in_c, 3, 3], 11);
        let bias = Tensor::random_seed(vec![4], 12);
        Conv::new(
            weight,
            Some(bias),
            Conv2dParams::new(1, 1),
            store.alloc("w", 1.0),
            store.alloc("b", 1.0),
        )
        .unwrap()
    }

    #[test]
    fn test_partials_add_up() {
        let mut store = ThresholdStore::new();
        let conv = conv(&mut store, 40);
        let input = Tensor::random_seed(vec![1, 40, 5, 5], 13);
        let ctx = PimContext::default();
        let whole = conv_on_crossbars(&input, &conv.weight, conv.bias.as_ref(), &conv.params, &ctx)
            .unwrap()
            .into_whole()
            .unwrap();

        let ctx = ctx.with_phase(QuantPhase::HardwareInference);
        let LayerOutput::Partials(parts) =
            conv_on_crossbars(&input, &conv.weight, conv.bias.as_ref(), &conv.params, &ctx)
                .unwrap()
        else {
            panic!("hardware inference must yield partial sums");
        };
        // 128 rows / 9 = 14 channels per tile
        assert_eq!(parts.len(), 3);
        let summed = sum_tensors(parts).unwrap();
        for (a, b) in whole.get_data().iter().zip(summed.get_data()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_quantized_forward_requires_unit() {
        let mut store = ThresholdStore::new();
        let conv = conv(&mut store, 2);
        let input = Tensor::random_seed(vec![1, 2, 4, 4], 1);
        let ctx = PimContext::default().with_phase(QuantPhase::BaselineTrain);
        assert!(conv.forward(&input, None, &ctx).is_err());

        let unit = PimUnit::with_weights(
            store.alloc("a", 0.0),
            conv.weight_threshold(),
            conv.bias_threshold(),
        );
        let out = conv
            .forward(&input, Some(BoundUnit::new(&unit, &store, &ctx)), &ctx)
            .unwrap();
        assert_eq!(out.into_whole().unwrap().get_shape(), &[1, 4, 4, 4]);
    }

    #[test]
    fn test_normalized_weight() {
        let mut store = ThresholdStore::new();
        let conv = conv(&mut store, 3);
        let (mean, std) = mean_std(conv.effective_weight().unwrap().get_data());
        assert!(mean.abs() < 1e-5);
        assert!((std - 1.0).abs() < 1e-4);
    }
}
