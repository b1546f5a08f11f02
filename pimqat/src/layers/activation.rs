use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{ActivationQuantized, LayerOutput};
use crate::{
    hardware::{BoundUnit, PimContext, QuantPhase, ThresholdId},
    tensor::{Tensor, sum_tensors},
};

/// ReLU followed by the unsigned ADC quantization of its unit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Relu {
    pub(crate) acti_t: ThresholdId,
}

impl Relu {
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
            return Ok(LayerOutput::Whole(input.into_whole()?.relu()));
        }
        let unit = unit.context("quantized ReLU has no PIM unit attached")?;
        relu_quant(input, &unit).map(LayerOutput::Whole)
    }
}

impl ActivationQuantized for Relu {
    fn acti_threshold(&self) -> ThresholdId {
        self.acti_t
    }
}

/// Rectifies and quantizes every crossbar tile on its own before the digital accumulation.
pub(crate) fn relu_quant(input: LayerOutput, unit: &BoundUnit<'_>) -> Result<Tensor> {
    match input {
        LayerOutput::Whole(t) => unit.quant_acti(&t.relu(), false),
        LayerOutput::Partials(parts) => sum_tensors(
            parts
                .iter()
                .map(|p| unit.quant_acti(&p.relu(), false))
                .collect::<Result<Vec<_>>>()?,
        )
        .map_err(Into::into),
    }
}
