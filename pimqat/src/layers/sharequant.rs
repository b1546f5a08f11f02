use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{ActivationQuantized, LayerOutput};
use crate::{
    hardware::{BoundUnit, PimContext, QuantPhase, ThresholdId},
    tensor::sum_tensors,
};

/// Signed activation quantizer placed on each branch of a residual join, so that both
/// operands of the addition share a scale.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShareQuant {
    pub(crate) acti_t: ThresholdId,
}

impl ShareQuant {
    pub fn new(acti_t: ThresholdId) -> Self {
        Self { acti_t }
    }

    pub fn forward(
        &self,
        input: LayerOutput,
        unit: Option<BoundUnit<'_>>,
        ctx: &PimContext,
    ) -> Result<LayerOutput> {
        if ctx.phase == QuantPhase::Float {
            return Ok(LayerOutput::Whole(input.into_whole()?));
        }
        let unit = unit.context("share quantizer has no PIM unit attached")?;
        let out = match input {
            LayerOutput::Whole(t) => unit.quant_acti(&t, true)?,
            LayerOutput::Partials(parts) => sum_tensors(
                parts
                    .iter()
                    .map(|p| unit.quant_acti(p, true))
                    .collect::<Result<Vec<_>>>()?,
            )?,
        };
        Ok(LayerOutput::Whole(out))
    }
}

impl ActivationQuantized for ShareQuant {
    fn acti_threshold(&self) -> ThresholdId {
        self.acti_t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hardware::{PimUnit, ThresholdStore},
        tensor::Tensor,
    };

    #[test]
    fn test_signed_quantization() {
        let mut store = ThresholdStore::new();
        let share = ShareQuant::new(store.alloc("acti", 1.0));
        let unit = PimUnit::activation_only(share.acti_t);
        let ctx = PimContext::default().with_phase(QuantPhase::RangeConstrained);
        let out = share
            .forward(
                LayerOutput::Whole(Tensor::new(vec![3], vec![-4.0, 0.0, 4.0])),
                Some(BoundUnit::new(&unit, &store, &ctx)),
                &ctx,
            )
            .unwrap()
            .into_whole()
            .unwrap();
        let expected = [-2.0, 0.0, 2.0];
        for (a, b) in out.get_data().iter().zip(expected) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}
