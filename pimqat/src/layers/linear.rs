use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use super::{LayerOutput, WeightQuantized};
use crate::{
    hardware::{BoundUnit, PimContext, QuantPhase, ThresholdId},
    tensor::Tensor,
};

/// Fully connected layer, `weight [out, in]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Linear {
    pub(crate) weight: Tensor,
    pub(crate) bias: Option<Tensor>,
    pub(crate) weight_t: ThresholdId,
    pub(crate) bias_t: ThresholdId,
    pub(crate) last: bool,
}

impl Linear {
    pub fn new(
        weight: Tensor,
        bias: Option<Tensor>,
        weight_t: ThresholdId,
        bias_t: ThresholdId,
    ) -> Result<Self> {
        ensure!(
            weight.rank() == 2,
            "linear weight must be [out, in], got {:?}",
            weight.get_shape()
        );
        if let Some(b) = &bias {
            ensure!(
                b.len() == weight.get_shape()[0],
                "linear bias has {} entries for {} outputs",
                b.len(),
                weight.get_shape()[0]
            );
        }
        Ok(Self {
            weight,
            bias,
            weight_t,
            bias_t,
            last: false,
        })
    }

    pub fn in_features(&self) -> usize {
        self.weight.get_shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.get_shape()[0]
    }

    pub fn forward(
        &self,
        input: &Tensor,
        unit: Option<BoundUnit<'_>>,
        ctx: &PimContext,
    ) -> Result<LayerOutput> {
        if self.last || ctx.phase == QuantPhase::Float {
            return Ok(LayerOutput::Whole(
                input.linear(&self.weight, self.bias.as_ref())?,
            ));
        }
        let unit = unit.context("quantized linear layer has no PIM unit attached")?;
        let weight = unit.quant_weight(&self.weight)?;
        let bias = self
            .bias
            .as_ref()
            .map(|b| unit.quant_bias(b))
            .transpose()?;
        if ctx.phase != QuantPhase::HardwareInference {
            return Ok(LayerOutput::Whole(input.linear(&weight, bias.as_ref())?));
        }
        // one crossbar tile per `num_rows` input features
        let granularity = ctx.spec.num_rows.max(1);
        let features = input.get_shape().get(1).copied().unwrap_or(0);
        let mut partials = Vec::with_capacity(features.div_ceil(granularity));
        let mut start = 0;
        while start < features {
            let len = granularity.min(features - start);
            let tile_bias = if start == 0 { bias.as_ref() } else { None };
            partials.push(
                input
                    .narrow(1, start, len)?
                    .linear(&weight.narrow(1, start, len)?, tile_bias)?,
            );
            start += len;
        }
        Ok(LayerOutput::Partials(partials))
    }
}

impl WeightQuantized for Linear {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{PimUnit, ThresholdStore};

    #[test]
    fn test_tiles_split_on_rows() {
        let mut store = ThresholdStore::new();
        let linear = Linear::new(
            Tensor::random_seed(vec![3, 300], 5),
            Some(Tensor::random_seed(vec![3], 6)),
            store.alloc("w", 0.0),
            store.alloc("b", 2.0),
        )
        .unwrap();
        let unit = PimUnit::with_weights(store.alloc("a", 0.0), linear.weight_t, linear.bias_t);
        let input = Tensor::random_seed(vec![2, 300], 7);

        let ctx = PimContext::default().with_phase(QuantPhase::RangeConstrained);
        let whole = linear
            .forward(&input, Some(BoundUnit::new(&unit, &store, &ctx)), &ctx)
            .unwrap()
            .into_whole()
            .unwrap();

        let ctx = ctx.with_phase(QuantPhase::HardwareInference);
        let out = linear
            .forward(&input, Some(BoundUnit::new(&unit, &store, &ctx)), &ctx)
            .unwrap();
        let LayerOutput::Partials(parts) = &out else {
            panic!("expected partial sums");
        };
        assert_eq!(parts.len(), 3);
        let summed = out.into_whole().unwrap();
        for (a, b) in whole.get_data().iter().zip(summed.get_data()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_last_layer_stays_float() {
        let mut store = ThresholdStore::new();
        let mut linear = Linear::new(
            Tensor::random_seed(vec![2, 4], 1),
            None,
            store.alloc("w", -3.0),
            store.alloc("b", 0.0),
        )
        .unwrap();
        linear.last = true;
        let input = Tensor::random_seed(vec![1, 4], 2);
        let ctx = PimContext::default().with_phase(QuantPhase::HardwareInference);
        let out = linear.forward(&input, None, &ctx).unwrap().into_whole().unwrap();
        assert_eq!(out, input.linear(&linear.weight, None).unwrap());
    }
}
