//! Constrains the rounded thresholds so that every ADC sees a range it can represent.
//!
//! For a node owning an ADC, the partial sums it digitizes carry the scale of the previous
//! activation times the weight. With rounded log2 thresholds, the ADC has to cover
//! `effective = acti - prev_acti - weight` up to `effective + acti_bits`, which must lie inside
//! `[min_range_log2, max_range_log2]`. The bias is added in the analog domain as well and has
//! to fit the same crossbar, which bounds its threshold from both sides.
//!
//! Only chains and residual blocks (VGG, ResNet) are handled: the previous activation is found
//! through the predecessor map, one hop for fused conv-bn-relu nodes and two hops for a ReLU or
//! share quantizer sitting behind a bare crossbar.
use anyhow::{Context, Result, bail, ensure};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    hardware::{PimContext, ThresholdId, ThresholdStore},
    layers::Layer,
    model::{Network, NodeId, Predecessor},
    quantization::BitWidths,
};

/// Thresholds of one ADC and of the activation feeding its crossbar.
#[derive(Debug, Clone, Copy)]
struct Lookup {
    acti: ThresholdId,
    prev_acti: ThresholdId,
    weight: ThresholdId,
    bias: ThresholdId,
}

/// Rounded log2 ranges around one ADC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RangeCheck {
    pub acti: i32,
    pub prev_acti: i32,
    pub weight: i32,
    pub bias: i32,
    /// lowest log2 the ADC has to resolve
    pub effective: i32,
}

impl RangeCheck {
    fn new(store: &ThresholdStore, lookup: &Lookup) -> Self {
        let round = |t: ThresholdId| store.value(t).round_ties_even() as i32;
        let (acti, prev_acti, weight) = (
            round(lookup.acti),
            round(lookup.prev_acti),
            round(lookup.weight),
        );
        Self {
            acti,
            prev_acti,
            weight,
            bias: round(lookup.bias),
            effective: acti - prev_acti - weight,
        }
    }

    /// `prev_acti + weight`, the scale of one crossbar product
    pub fn combined(&self) -> i32 {
        self.prev_acti + self.weight
    }

    pub fn bias_window(&self, bits: &BitWidths) -> (i32, i32) {
        let top = self.combined() + bits.bias as i32 - bits.weight as i32;
        (top - bits.acti as i32, top)
    }

    pub fn fits(&self, bits: &BitWidths, min_range_log2: i32, max_range_log2: i32) -> bool {
        min_range_log2 <= self.effective && self.effective + bits.acti as i32 <= max_range_log2
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TuneEntry {
    pub name: String,
    pub kind: &'static str,
    pub before: RangeCheck,
    pub after: RangeCheck,
    pub bias_window: (i32, i32),
}

/// Installs the ADC window into `ctx` and adjusts activation and bias thresholds of every
/// node owning an ADC so that it fits. Returns one entry per tuned node.
pub fn tune_network(
    network: &mut Network,
    ctx: &mut PimContext,
    precision: i32,
    min_range_log2: i32,
    max_range_log2: i32,
) -> Result<Vec<TuneEntry>> {
    ensure!(
        max_range_log2 >= precision + min_range_log2,
        "incorrect ADC range: max {} < precision {} + min {}",
        max_range_log2,
        precision,
        min_range_log2
    );
    ctx.spec.precision = Some(precision);
    ctx.spec.min_range_log2 = Some(min_range_log2);
    ctx.spec.max_range_log2 = Some(max_range_log2);
    let bits = ctx.bits;
    let acti_bits = bits.acti as i32;

    let mut entries = Vec::new();
    for id in network.visit_order() {
        let Some(lookup) = lookup(network, id)? else {
            continue;
        };
        let node = network.node(id)?;
        let (name, kind) = (node.name.clone(), node.layer.kind());
        let store = network.thresholds_mut();
        let before = RangeCheck::new(store, &lookup);

        let shift = if before.effective < min_range_log2 {
            before.effective - min_range_log2
        } else if before.effective + acti_bits > max_range_log2 {
            before.effective + acti_bits - max_range_log2
        } else {
            0
        };
        if shift != 0 {
            store.set_value(lookup.acti, (before.acti - shift) as f32);
            debug!("{}: activation log2 threshold {} -> {}", name, before.acti, before.acti - shift);
        }

        let adjusted = RangeCheck::new(store, &lookup);
        let (low, high) = adjusted.bias_window(&bits);
        store.set_value(lookup.bias, adjusted.bias.clamp(low, high) as f32);
        let after = RangeCheck::new(store, &lookup);

        ensure!(
            after.fits(&bits, min_range_log2, max_range_log2),
            "{}: effective range [{}, {}] still outside the ADC window [{}, {}]",
            name,
            after.effective,
            after.effective + acti_bits,
            min_range_log2,
            max_range_log2
        );
        info!(
            "{} ({}): effective {} -> {}, bias {} -> {} in [{}, {}]",
            name, kind, before.effective, after.effective, before.bias, after.bias, low, high
        );
        entries.push(TuneEntry {
            name,
            kind,
            before,
            after,
            bias_window: (low, high),
        });
    }
    Ok(entries)
}

/// Current rounded ranges around the ADC of `id`, or `None` when the node owns no ADC the
/// tuner knows how to constrain.
pub fn range_check(network: &Network, id: NodeId) -> Result<Option<RangeCheck>> {
    Ok(lookup(network, id)?.map(|l| RangeCheck::new(network.thresholds(), &l)))
}

fn lookup(network: &Network, id: NodeId) -> Result<Option<Lookup>> {
    let Some(pred) = network.predecessors().get(id) else {
        return Ok(None);
    };
    let node = network.node(id)?;
    let applies = match &node.layer {
        Layer::FusedConvBnRelu(_) => true,
        Layer::Relu(_) | Layer::ShareQuant(_) => match pred {
            Predecessor::Node(p) => network.node(p)?.layer.is_bare_crossbar(),
            Predecessor::Input => false,
        },
        _ => false,
    };
    if !applies {
        return Ok(None);
    }
    let Predecessor::Node(pred) = pred else {
        debug!("{}: first layer, no previous activation", node.name);
        return Ok(None);
    };
    let unit = network
        .unit_of(id)?
        .with_context(|| format!("{} has no PIM unit, fold the network first", node.name))?;
    let (Some(weight), Some(bias)) = (unit.weight, unit.bias) else {
        bail!("{}: PIM unit without crossbar thresholds", node.name);
    };

    let prev_acti = if matches!(node.layer, Layer::FusedConvBnRelu(_)) {
        let pred_node = network.node(pred)?;
        match pred_node.layer.as_activation() {
            Some(a) => a.acti_threshold(),
            None => bail!(
                "{}: predecessor {} ({}) has no activation threshold",
                node.name,
                pred_node.name,
                pred_node.layer.kind()
            ),
        }
    } else {
        let two_hops = match network.predecessors().predecessor_node(pred) {
            Some(pp) => network.unit_of(pp)?.map(|u| u.acti),
            None => None,
        };
        match two_hops {
            Some(acti) => acti,
            None => {
                warn!(
                    "{}: no PIM unit two hops back through {}, range left untouched",
                    node.name,
                    network.node(pred)?.name
                );
                return Ok(None);
            }
        }
    };
    Ok(Some(Lookup {
        acti: unit.acti,
        prev_acti,
        weight,
        bias,
    }))
}
