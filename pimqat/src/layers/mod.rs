pub mod activation;
pub mod batchnorm;
pub mod conv;
pub mod fused;
pub mod linear;
pub mod pooling;
pub mod reshape;
pub mod sharequant;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{
    hardware::{BoundUnit, PimContext, PimUnit, ThresholdId},
    layers::{
        activation::Relu,
        batchnorm::BatchNorm,
        conv::Conv,
        fused::{FusedConvBn, FusedConvBnRelu},
        linear::Linear,
        pooling::Pooling,
        reshape::Flatten,
        sharequant::ShareQuant,
    },
    model::ModelError,
    tensor::{Tensor, sum_tensors},
};

/// Layers whose weight and bias are programmed into a crossbar.
pub trait WeightQuantized {
    fn weight_threshold(&self) -> ThresholdId;
    fn bias_threshold(&self) -> ThresholdId;
    /// The weight currently fed to the quantizer (folded once a batch norm is frozen).
    fn current_weight(&self) -> &Tensor;
    fn current_bias(&self) -> Option<&Tensor>;
}

/// Layers whose output goes through an ADC.
pub trait ActivationQuantized {
    fn acti_threshold(&self) -> ThresholdId;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Layer {
    Conv(Conv),
    Linear(Linear),
    Relu(Relu),
    ShareQuant(ShareQuant),
    BatchNorm(BatchNorm),
    FusedConvBn(FusedConvBn),
    FusedConvBnRelu(FusedConvBnRelu),
    Pooling(Pooling),
    Flatten(Flatten),
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// Output of a layer: a single tensor, or one partial sum per crossbar tile during hardware
/// inference. Partial sums are only resolved by the next activation quantizer.
#[derive(Clone, Debug)]
pub enum LayerOutput {
    Whole(Tensor),
    Partials(Vec<Tensor>),
}

impl LayerOutput {
    /// Sums the partials digitally, without any quantization.
    pub fn into_whole(self) -> Result<Tensor> {
        match self {
            LayerOutput::Whole(t) => Ok(t),
            LayerOutput::Partials(parts) => Ok(sum_tensors(parts)?),
        }
    }
}

impl Layer {
    pub fn forward(
        &self,
        input: LayerOutput,
        unit: Option<BoundUnit<'_>>,
        ctx: &PimContext,
    ) -> Result<LayerOutput> {
        match self {
            Layer::Conv(conv) => conv.forward(&input.into_whole()?, unit, ctx),
            Layer::Linear(linear) => linear.forward(&input.into_whole()?, unit, ctx),
            Layer::Relu(relu) => relu.forward(input, unit, ctx),
            Layer::ShareQuant(share) => share.forward(input, unit, ctx),
            Layer::BatchNorm(bn) => Ok(LayerOutput::Whole(bn.forward(&input.into_whole()?)?)),
            Layer::FusedConvBn(fused) => fused.forward(input, unit, ctx),
            Layer::FusedConvBnRelu(fused) => fused.forward(input, unit, ctx),
            Layer::Pooling(pool) => Ok(LayerOutput::Whole(pool.forward(&input.into_whole()?)?)),
            Layer::Flatten(flatten) => Ok(LayerOutput::Whole(flatten.forward(input.into_whole()?)?)),
        }
    }

    /// Short variant name, used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Conv(_) => "Conv2d",
            Layer::Linear(_) => "Linear",
            Layer::Relu(_) => "ReLU",
            Layer::ShareQuant(_) => "ShareQuant",
            Layer::BatchNorm(_) => "BatchNorm2d",
            Layer::FusedConvBn(_) => "Conv2dBN",
            Layer::FusedConvBnRelu(_) => "Conv2dBNReLU",
            Layer::Pooling(_) => "Pooling",
            Layer::Flatten(_) => "Flatten",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Layer::Conv(conv) => {
                let (kh, kw) = conv.kernel_size();
                format!(
                    "Conv: ({},{},{},{})",
                    conv.out_channels(),
                    conv.in_channels(),
                    kh,
                    kw
                )
            }
            Layer::Linear(linear) => {
                format!("Dense: ({},{})", linear.out_features(), linear.in_features())
            }
            Layer::Relu(_) => "RELU".to_string(),
            Layer::ShareQuant(_) => "ShareQuant".to_string(),
            Layer::BatchNorm(bn) => format!("BatchNorm: {}", bn.channels()),
            Layer::FusedConvBn(fused) => format!(
                "Conv2dBN: {} ({})",
                fused.conv().out_channels(),
                if fused.is_frozen() { "folded" } else { "separate" }
            ),
            Layer::FusedConvBnRelu(fused) => format!(
                "Conv2dBNReLU: {} ({})",
                fused.inner().conv().out_channels(),
                if fused.inner().is_frozen() {
                    "folded"
                } else {
                    "separate"
                }
            ),
            Layer::Pooling(pool) => pool.describe(),
            Layer::Flatten(flatten) => flatten.describe(),
        }
    }

    pub fn as_weighted(&self) -> Option<&dyn WeightQuantized> {
        match self {
            Layer::Conv(conv) => Some(conv),
            Layer::Linear(linear) => Some(linear),
            Layer::FusedConvBn(fused) => Some(fused),
            Layer::FusedConvBnRelu(fused) => Some(fused),
            _ => None,
        }
    }

    pub fn as_activation(&self) -> Option<&dyn ActivationQuantized> {
        match self {
            Layer::Relu(relu) => Some(relu),
            Layer::ShareQuant(share) => Some(share),
            Layer::FusedConvBnRelu(fused) => Some(fused),
            _ => None,
        }
    }

    /// Whether the layer's crossbar feeds a downstream ADC, i.e. a ReLU or a share quantizer
    /// following it takes over its weight and bias thresholds.
    pub fn is_bare_crossbar(&self) -> bool {
        matches!(
            self,
            Layer::Conv(_) | Layer::Linear(_) | Layer::FusedConvBn(_)
        )
    }

    pub fn is_last(&self) -> bool {
        match self {
            Layer::Conv(conv) => conv.last,
            Layer::Linear(linear) => linear.last,
            Layer::FusedConvBn(fused) => fused.conv.last,
            Layer::FusedConvBnRelu(fused) => fused.inner.conv.last,
            _ => false,
        }
    }

    /// Returns false for layers that have no output quantization to disable.
    pub(crate) fn set_last(&mut self, last: bool) -> bool {
        match self {
            Layer::Conv(conv) => conv.last = last,
            Layer::Linear(linear) => linear.last = last,
            Layer::FusedConvBn(fused) => fused.conv.last = last,
            Layer::FusedConvBnRelu(fused) => fused.inner.conv.last = last,
            _ => return false,
        }
        true
    }

    pub(crate) fn set_normalize(&mut self, normalize: bool) {
        match self {
            Layer::Conv(conv) => conv.normalize = normalize,
            Layer::FusedConvBn(fused) => fused.conv.normalize = normalize,
            Layer::FusedConvBnRelu(fused) => fused.inner.conv.normalize = normalize,
            _ => {}
        }
    }

    /// Checks that the layer can take its role in `unit`: crossbar layers need the weight and
    /// bias thresholds, activation layers need their own activation threshold.
    pub fn check_unit(&self, unit: &PimUnit) -> Result<(), ModelError> {
        let weighted_ok = self
            .as_weighted()
            .map(|w| unit.weight == Some(w.weight_threshold()) && unit.bias == Some(w.bias_threshold()));
        let acti_ok = self.as_activation().map(|a| unit.acti == a.acti_threshold());
        match (weighted_ok, acti_ok) {
            (None, None) => Err(ModelError::CapabilityError(format!(
                "{} cannot be attached to a PIM unit",
                self.kind()
            ))),
            (Some(false), _) | (_, Some(false)) => Err(ModelError::CapabilityError(format!(
                "PIM unit does not carry the thresholds of this {}",
                self.kind()
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::ThresholdStore;

    #[test]
    fn test_capabilities() {
        let mut store = ThresholdStore::new();
        let relu = Layer::Relu(Relu::new(store.alloc("a", 0.0)));
        let bn = Layer::BatchNorm(BatchNorm::new(vec![1.0], vec![0.0], vec![0.0], vec![1.0], 1e-5).unwrap());
        assert!(relu.as_activation().is_some());
        assert!(relu.as_weighted().is_none());

        let unit = PimUnit::activation_only(relu.as_activation().unwrap().acti_threshold());
        assert!(relu.check_unit(&unit).is_ok());
        assert!(bn.check_unit(&unit).is_err());

        let other = PimUnit::activation_only(store.alloc("b", 0.0));
        assert!(relu.check_unit(&other).is_err());
    }
}
