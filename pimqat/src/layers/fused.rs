//! Convolution fused with its batch norm (and ReLU). Until the batch norm is frozen both run
//! separately; once frozen, quantized phases fold the normalization into the convolution
//! parameters. Float evaluation always runs the raw convolution and the batch norm.
use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    ActivationQuantized, Layer, LayerOutput, WeightQuantized, activation::relu_quant,
    batchnorm::BatchNorm, conv::Conv, conv::conv_on_crossbars,
};
use crate::{
    hardware::{BoundUnit, PimContext, QuantPhase, ThresholdId, ThresholdStore},
    model::ModelError,
    tensor::Tensor,
};

const BIAS_EPS: f32 = 1e-8;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FoldedParams {
    pub weight: Tensor,
    pub bias: Tensor,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FusedConvBn {
    pub(crate) conv: Conv,
    pub(crate) bn: BatchNorm,
    pub(crate) fused_weight_t: ThresholdId,
    pub(crate) fused_bias_t: ThresholdId,
    pub(crate) folded: Option<FoldedParams>,
    pub(crate) frozen: bool,
}

impl FusedConvBn {
    /// Fuses a convolution with the batch norm following it. The fused thresholds start out as
    /// copies of the convolution's.
    pub fn from_parts(
        conv: Layer,
        bn: Layer,
        thresholds: &mut ThresholdStore,
        name: &str,
    ) -> Result<Self, ModelError> {
        let (conv, bn) = match (conv, bn) {
            (Layer::Conv(conv), Layer::BatchNorm(bn)) => (conv, bn),
            (a, b) => {
                return Err(ModelError::FoldError(format!(
                    "{}: expected Conv followed by BatchNorm, got {} and {}",
                    name,
                    a.kind(),
                    b.kind()
                )));
            }
        };
        if conv.out_channels() != bn.channels() {
            return Err(ModelError::FoldError(format!(
                "{}: batch norm over {} channels after a convolution with {} outputs",
                name,
                bn.channels(),
                conv.out_channels()
            )));
        }
        let fused_weight_t = thresholds.alloc(
            format!("{}.fused_weight_log2_t", name),
            thresholds.value(conv.weight_t),
        );
        let fused_bias_t = thresholds.alloc(
            format!("{}.fused_bias_log2_t", name),
            thresholds.value(conv.bias_t),
        );
        Ok(Self {
            conv,
            bn,
            fused_weight_t,
            fused_bias_t,
            folded: None,
            frozen: false,
        })
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn conv(&self) -> &Conv {
        &self.conv
    }

    pub fn folded(&self) -> Option<&FoldedParams> {
        self.folded.as_ref()
    }

    /// Scales `weight` and the convolution bias by the batch norm statistics.
    fn fold(&self, weight: &Tensor) -> FoldedParams {
        let (scale, shift) = self.bn.affine();
        let per_channel = weight.len() / scale.len();
        let folded_weight = Tensor::new(
            weight.get_shape().to_vec(),
            weight
                .get_data()
                .iter()
                .enumerate()
                .map(|(i, w)| w * scale[i / per_channel])
                .collect(),
        );
        let folded_bias = Tensor::new(
            vec![scale.len()],
            (0..scale.len())
                .map(|o| {
                    let b = self.conv.bias.as_ref().map_or(0.0, |b| b.get_data()[o]);
                    b * scale[o] + shift[o]
                })
                .collect(),
        );
        FoldedParams {
            weight: folded_weight,
            bias: folded_bias,
        }
    }

    /// `mode` selects the folded (true) or the separate (false) thresholds. With `mode` and
    /// `convert` the fused thresholds are recomputed from the raw convolution and the batch
    /// norm: the weight threshold moves by the log2 of the weight growth, the bias threshold is
    /// set from the largest folded bias. Without `convert` they keep their previous values.
    pub fn bn_freeze(
        &mut self,
        mode: bool,
        convert: bool,
        thresholds: &mut ThresholdStore,
    ) -> Result<()> {
        if mode && convert {
            let raw = self.fold(&self.conv.weight);
            let weight_scale = raw.weight.max_value() / self.conv.weight.max_value();
            ensure!(
                weight_scale.is_finite() && weight_scale > 0.0,
                "batch norm folding scales the weight range by {}",
                weight_scale
            );
            let weight_log2_t = thresholds.value(self.conv.weight_t) + weight_scale.log2();
            let bias_log2_t = (raw.bias.max_abs_output() + BIAS_EPS).log2();
            debug!(
                "bn fold: weight log2_t {} -> {}, bias log2_t {}",
                thresholds.value(self.conv.weight_t),
                weight_log2_t,
                bias_log2_t
            );
            thresholds.set_value(self.fused_weight_t, weight_log2_t);
            thresholds.set_value(self.fused_bias_t, bias_log2_t);
        }
        if mode {
            self.folded = Some(self.fold(&self.conv.effective_weight()?));
        }
        self.frozen = mode;
        Ok(())
    }

    pub fn forward(
        &self,
        input: LayerOutput,
        unit: Option<BoundUnit<'_>>,
        ctx: &PimContext,
    ) -> Result<LayerOutput> {
        let input = input.into_whole()?;
        if !self.frozen || self.conv.last || ctx.phase == QuantPhase::Float {
            let conv_out = self.conv.forward(&input, unit, ctx)?.into_whole()?;
            return Ok(LayerOutput::Whole(self.bn.forward(&conv_out)?));
        }
        let folded = self.fold(&self.conv.effective_weight()?);
        let unit = unit.context("folded convolution has no PIM unit attached")?;
        let weight = unit.quant_weight(&folded.weight)?;
        let bias = unit.quant_bias(&folded.bias)?;
        conv_on_crossbars(&input, &weight, Some(&bias), &self.conv.params, ctx)
    }
}

impl WeightQuantized for FusedConvBn {
    fn weight_threshold(&self) -> ThresholdId {
        if self.frozen {
            self.fused_weight_t
        } else {
            self.conv.weight_t
        }
    }

    fn bias_threshold(&self) -> ThresholdId {
        if self.frozen {
            self.fused_bias_t
        } else {
            self.conv.bias_t
        }
    }

    fn current_weight(&self) -> &Tensor {
        match (&self.folded, self.frozen) {
            (Some(folded), true) => &folded.weight,
            _ => &self.conv.weight,
        }
    }

    fn current_bias(&self) -> Option<&Tensor> {
        match (&self.folded, self.frozen) {
            (Some(folded), true) => Some(&folded.bias),
            _ => self.conv.bias.as_ref(),
        }
    }
}

/// [`FusedConvBn`] followed by a ReLU; owns the ADC of its crossbar.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FusedConvBnRelu {
    pub(crate) inner: FusedConvBn,
    pub(crate) acti_t: ThresholdId,
}

impl FusedConvBnRelu {
    pub fn from_parts(
        conv: Layer,
        bn: Layer,
        relu: Layer,
        thresholds: &mut ThresholdStore,
        name: &str,
    ) -> Result<Self, ModelError> {
        let Layer::Relu(relu) = relu else {
            return Err(ModelError::FoldError(format!(
                "{}: expected ReLU after the batch norm, got {}",
                name,
                relu.kind()
            )));
        };
        Ok(Self {
            inner: FusedConvBn::from_parts(conv, bn, thresholds, name)?,
            acti_t: relu.acti_t,
        })
    }

    pub fn inner(&self) -> &FusedConvBn {
        &self.inner
    }

    pub fn bn_freeze(
        &mut self,
        mode: bool,
        convert: bool,
        thresholds: &mut ThresholdStore,
    ) -> Result<()> {
        self.inner.bn_freeze(mode, convert, thresholds)
    }

    pub fn forward(
        &self,
        input: LayerOutput,
        unit: Option<BoundUnit<'_>>,
        ctx: &PimContext,
    ) -> Result<LayerOutput> {
        let out = self.inner.forward(input, unit, ctx)?;
        if ctx.phase == QuantPhase::Float {
            return Ok(LayerOutput::Whole(out.into_whole()?.relu()));
        }
        let unit = unit.context("fused conv-bn-relu has no PIM unit attached")?;
        relu_quant(out, &unit).map(LayerOutput::Whole)
    }
}

impl WeightQuantized for FusedConvBnRelu {
    fn weight_threshold(&self) -> ThresholdId {
        self.inner.weight_threshold()
    }

    fn bias_threshold(&self) -> ThresholdId {
        self.inner.bias_threshold()
    }

    fn current_weight(&self) -> &Tensor {
        self.inner.current_weight()
    }

    fn current_bias(&self) -> Option<&Tensor> {
        self.inner.current_bias()
    }
}

impl ActivationQuantized for FusedConvBnRelu {
    fn acti_threshold(&self) -> ThresholdId {
        self.acti_t
    }
}
