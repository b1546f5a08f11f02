//! A PIM unit groups the thresholds of the nodes sharing one crossbar and its ADC.
use anyhow::{Context, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::{PimContext, ThresholdId, ThresholdStore};
use crate::{
    quantization::{QuantGrad, QuantMode, QuantParams, fake_quant, fake_quant_backward},
    tensor::Tensor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[display("u{_0}")]
pub struct UnitId(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PimUnit {
    pub acti: ThresholdId,
    pub weight: Option<ThresholdId>,
    pub bias: Option<ThresholdId>,
}

impl PimUnit {
    pub fn activation_only(acti: ThresholdId) -> Self {
        Self {
            acti,
            weight: None,
            bias: None,
        }
    }

    pub fn with_weights(acti: ThresholdId, weight: ThresholdId, bias: ThresholdId) -> Self {
        Self {
            acti,
            weight: Some(weight),
            bias: Some(bias),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UnitStore {
    units: Vec<PimUnit>,
}

impl UnitStore {
    pub fn push(&mut self, unit: PimUnit) -> UnitId {
        self.units.push(unit);
        UnitId(self.units.len() - 1)
    }

    pub fn get(&self, id: UnitId) -> &PimUnit {
        &self.units[id.0]
    }

    pub fn get_mut(&mut self, id: UnitId) -> &mut PimUnit {
        &mut self.units[id.0]
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (UnitId, &PimUnit)> {
        self.units.iter().enumerate().map(|(i, u)| (UnitId(i), u))
    }
}

/// A unit resolved against the threshold store and the current context, ready to quantize.
#[derive(Clone, Copy)]
pub struct BoundUnit<'a> {
    unit: &'a PimUnit,
    thresholds: &'a ThresholdStore,
    ctx: &'a PimContext,
}

impl<'a> BoundUnit<'a> {
    pub fn new(unit: &'a PimUnit, thresholds: &'a ThresholdStore, ctx: &'a PimContext) -> Self {
        Self {
            unit,
            thresholds,
            ctx,
        }
    }

    fn params(&self, threshold: ThresholdId, bits: u32, mode: QuantMode) -> QuantParams {
        QuantParams {
            log2_t: self.thresholds.value(threshold),
            bits,
            mode,
            round_threshold: self.ctx.phase.rounds_threshold(),
        }
    }

    pub fn weight_params(&self) -> Result<QuantParams> {
        let t = self.unit.weight.context("PIM unit carries no weight threshold")?;
        Ok(self.params(t, self.ctx.bits.weight, QuantMode::Signed))
    }

    pub fn bias_params(&self) -> Result<QuantParams> {
        let t = self.unit.bias.context("PIM unit carries no bias threshold")?;
        Ok(self.params(t, self.ctx.bits.bias, QuantMode::Signed))
    }

    pub fn acti_params(&self, signed: bool) -> QuantParams {
        self.params(
            self.unit.acti,
            self.ctx.bits.acti,
            QuantMode::from_signed(signed),
        )
    }

    pub fn quant_weight(&self, weight: &Tensor) -> Result<Tensor> {
        fake_quant(weight, &self.weight_params()?)
    }

    pub fn quant_bias(&self, bias: &Tensor) -> Result<Tensor> {
        fake_quant(bias, &self.bias_params()?)
    }

    pub fn quant_acti(&self, acti: &Tensor, signed: bool) -> Result<Tensor> {
        fake_quant(acti, &self.acti_params(signed))
    }

    /// Backward of [`Self::quant_acti`]; the threshold gradient is for `self.acti_threshold()`.
    pub fn quant_acti_backward(
        &self,
        acti: &Tensor,
        signed: bool,
        grad_out: &Tensor,
    ) -> Result<QuantGrad> {
        fake_quant_backward(acti, &self.acti_params(signed), grad_out)
    }

    pub fn acti_threshold(&self) -> ThresholdId {
        self.unit.acti
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::QuantPhase;

    #[test]
    fn test_rounding_follows_phase() {
        let mut store = ThresholdStore::new();
        let acti = store.alloc("acti", 0.4);
        let unit = PimUnit::activation_only(acti);
        let mut ctx = PimContext::default();
        let x = Tensor::new(vec![1], vec![2.0]);

        ctx.phase = QuantPhase::BaselineTrain;
        let q = BoundUnit::new(&unit, &store, &ctx)
            .quant_acti(&x, false)
            .unwrap();
        // clamped to 2^0.4
        assert!((q.get_data()[0] - 0.4f32.exp2()).abs() < 1e-6);

        ctx.phase = QuantPhase::RangeConstrained;
        let q = BoundUnit::new(&unit, &store, &ctx)
            .quant_acti(&x, false)
            .unwrap();
        assert_eq!(q.get_data()[0], 1.0);
    }

    #[test]
    fn test_missing_roles() {
        let mut store = ThresholdStore::new();
        let unit = PimUnit::activation_only(store.alloc("acti", 0.0));
        let ctx = PimContext::default();
        let bound = BoundUnit::new(&unit, &store, &ctx);
        assert!(bound.quant_weight(&Tensor::zeros(vec![1])).is_err());
        assert!(bound.quant_bias(&Tensor::zeros(vec![1])).is_err());
    }
}
