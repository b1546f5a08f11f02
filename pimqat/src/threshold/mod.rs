//! Initialization of the log2 thresholds, from the parameters for weights and biases and from
//! a calibration batch for activations.
mod entropy;
mod max;
mod sd;

pub use entropy::{DEFAULT_BINS, DEFAULT_QUANT_BINS, entropy_log2_t};
pub use max::max_log2_t;
pub use sd::three_sigma_log2_t;

use anyhow::{Context, Result, bail, ensure};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, str::FromStr};
use tracing::{debug, info, warn};

use crate::{
    hardware::{PimContext, QuantPhase, ThresholdId},
    layers::LayerOutput,
    model::{Network, Node, NodeId},
    tensor::Tensor,
};

/// log2(6), the activation seed of the ResNet recipes
pub const SEED_ACTI_LOG2_T: f32 = 2.5849625;
/// log2(3)
pub const SEED_WEIGHT_LOG2_T: f32 = 1.5849625;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum Strategy {
    #[display("max")]
    Max,
    #[display("3sd")]
    ThreeSigma,
    #[display("entropy")]
    Entropy,
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "max" => Ok(Strategy::Max),
            "3sd" | "3sigma" | "3-sigma" => Ok(Strategy::ThreeSigma),
            "entropy" | "entro" | "kl" => Ok(Strategy::Entropy),
            _ => bail!("unknown threshold strategy {:?}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum Role {
    #[display("weight")]
    Weight,
    #[display("bias")]
    Bias,
    #[display("acti")]
    Acti,
}

/// Strategy per role, plus the histogram sizes of the entropy search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitPolicy {
    pub weight: Strategy,
    pub bias: Strategy,
    pub acti: Strategy,
    pub bins: usize,
    pub quant_bins: usize,
}

impl Default for InitPolicy {
    fn default() -> Self {
        Self {
            weight: Strategy::Max,
            bias: Strategy::Max,
            acti: Strategy::Entropy,
            bins: DEFAULT_BINS,
            quant_bins: DEFAULT_QUANT_BINS,
        }
    }
}

impl InitPolicy {
    fn log2_t(&self, role: Role, values: &[f32]) -> Result<f32> {
        let strategy = match role {
            Role::Weight => self.weight,
            Role::Bias => self.bias,
            Role::Acti => self.acti,
        };
        match strategy {
            Strategy::Max => max_log2_t(values),
            Strategy::ThreeSigma => three_sigma_log2_t(values),
            Strategy::Entropy => entropy_log2_t(values, self.bins, self.quant_bins),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdEntry {
    pub name: String,
    pub role: Role,
    pub log2_t: f32,
}

/// Sets every threshold a node currently uses from its parameters and from its output on the
/// first calibration batch, evaluated in float. Output layers are left alone.
pub fn calibrate(
    network: &mut Network,
    ctx: &PimContext,
    batches: &[Tensor],
    policy: &InitPolicy,
) -> Result<Vec<ThresholdEntry>> {
    ensure!(
        policy.weight != Strategy::Entropy && policy.bias != Strategy::Entropy,
        "entropy calibration only applies to activations"
    );
    let Some(batch) = batches.first() else {
        bail!("calibration needs at least one batch");
    };
    if batches.len() > 1 {
        warn!(
            "calibrating on the first of {} batches, the others are ignored",
            batches.len()
        );
    }

    let float_ctx = ctx.with_phase(QuantPhase::Float);
    let mut outputs: HashMap<NodeId, LayerOutput> = HashMap::new();
    network
        .forward_observed(
            &float_ctx,
            batch,
            &mut |id: NodeId, node: &Node, out: &LayerOutput| {
                if node.layer.as_activation().is_some() {
                    outputs.insert(id, out.clone());
                }
            },
        )
        .context("calibration forward pass")?;

    let mut updates: Vec<(ThresholdId, ThresholdEntry)> = Vec::new();
    for id in network.visit_order() {
        let node = network.node(id)?;
        if node.layer.is_last() {
            debug!("{}: output layer, thresholds left as they are", node.name);
            continue;
        }
        let mut push = |threshold: ThresholdId, role: Role, values: &[f32]| -> Result<()> {
            let log2_t = policy
                .log2_t(role, values)
                .with_context(|| format!("{} threshold of {}", role, node.name))?;
            updates.push((
                threshold,
                ThresholdEntry {
                    name: node.name.clone(),
                    role,
                    log2_t,
                },
            ));
            Ok(())
        };
        if let Some(weighted) = node.layer.as_weighted() {
            push(
                weighted.weight_threshold(),
                Role::Weight,
                weighted.current_weight().get_data(),
            )?;
            if let Some(bias) = weighted.current_bias() {
                push(weighted.bias_threshold(), Role::Bias, bias.get_data())?;
            }
        }
        if let Some(activation) = node.layer.as_activation() {
            let output = outputs
                .remove(&id)
                .with_context(|| format!("no calibration output for {}", node.name))?
                .into_whole()?;
            push(activation.acti_threshold(), Role::Acti, output.get_data())?;
        }
    }

    let store = network.thresholds_mut();
    for (threshold, entry) in &updates {
        store.set_value(*threshold, entry.log2_t);
        debug!("{} {} log2_t = {}", entry.name, entry.role, entry.log2_t);
    }
    info!(
        "calibrated {} thresholds on a batch of {:?}",
        updates.len(),
        batch.get_shape()
    );
    Ok(updates.into_iter().map(|(_, entry)| entry).collect())
}

/// Seeds every activation threshold with `acti` and every weight and bias threshold with
/// `weight`, skipping output layers. Returns the number of thresholds written.
pub fn seed_constant(network: &mut Network, acti: f32, weight: f32) -> Result<usize> {
    let mut targets = Vec::new();
    for id in network.visit_order() {
        let node = network.node(id)?;
        if node.layer.is_last() {
            continue;
        }
        if let Some(weighted) = node.layer.as_weighted() {
            targets.push((weighted.weight_threshold(), weight));
            targets.push((weighted.bias_threshold(), weight));
        }
        if let Some(activation) = node.layer.as_activation() {
            targets.push((activation.acti_threshold(), acti));
        }
    }
    let store = network.thresholds_mut();
    for (threshold, value) in &targets {
        store.set_value(*threshold, *value);
    }
    info!(
        "seeded {} thresholds (acti {}, weight {})",
        targets.len(),
        acti,
        weight
    );
    Ok(targets.len())
}

/// Every threshold currently in use, in evaluation order.
pub fn profile(network: &Network) -> Result<Vec<ThresholdEntry>> {
    let mut entries = Vec::new();
    for id in network.visit_order() {
        let node = network.node(id)?;
        let store = network.thresholds();
        let mut push = |threshold: ThresholdId, role: Role| {
            entries.push(ThresholdEntry {
                name: node.name.clone(),
                role,
                log2_t: store.value(threshold),
            })
        };
        if let Some(weighted) = node.layer.as_weighted() {
            push(weighted.weight_threshold(), Role::Weight);
            if weighted.current_bias().is_some() {
                push(weighted.bias_threshold(), Role::Bias);
            }
        }
        if let Some(activation) = node.layer.as_activation() {
            push(activation.acti_threshold(), Role::Acti);
        }
    }
    for entry in &entries {
        info!("{}: {} threshold is {}", entry.name, entry.role, entry.log2_t);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fold::fold_network, testing::small_chain};

    fn calibration_batches() -> Vec<Tensor> {
        vec![
            Tensor::random_seed(vec![2, 3, 8, 8], 21),
            Tensor::random_seed(vec![2, 3, 8, 8], 22),
        ]
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!("3sd".parse::<Strategy>().unwrap(), Strategy::ThreeSigma);
        assert_eq!("Entro".parse::<Strategy>().unwrap(), Strategy::Entropy);
        assert!("median".parse::<Strategy>().is_err());
        assert_eq!(Strategy::ThreeSigma.to_string(), "3sd");
    }

    #[test]
    fn test_calibrate_sets_used_thresholds() {
        let mut net = small_chain(5);
        fold_network(&mut net).unwrap();
        net.set_last(&[".classifier.2"]).unwrap();
        let policy = InitPolicy {
            acti: Strategy::Max,
            ..InitPolicy::default()
        };
        let entries = calibrate(
            &mut net,
            &PimContext::default(),
            &calibration_batches(),
            &policy,
        )
        .unwrap();
        // two fused nodes with three roles each, the hidden linear and the classifier ReLU
        assert_eq!(entries.len(), 3 + 3 + 2 + 1);
        assert!(entries.iter().all(|e| e.name != ".classifier.2"));

        let fc = net.find(".classifier.0").unwrap();
        let weighted = net.node(fc).unwrap().layer.as_weighted().unwrap();
        let expected = max_log2_t(weighted.current_weight().get_data()).unwrap();
        assert_eq!(
            net.thresholds().value(weighted.weight_threshold()),
            expected
        );
    }

    #[test]
    fn test_calibration_uses_first_batch_only() {
        let policy = InitPolicy::default();
        let run = |batches: &[Tensor]| {
            let mut net = small_chain(6);
            fold_network(&mut net).unwrap();
            calibrate(&mut net, &PimContext::default(), batches, &policy).unwrap();
            net.threshold_snapshot()
        };
        let batches = calibration_batches();
        assert_eq!(run(&batches), run(&batches[..1]));
        assert!(
            calibrate(
                &mut small_chain(6),
                &PimContext::default(),
                &[],
                &policy
            )
            .is_err()
        );
    }

    #[test]
    fn test_entropy_rejected_for_weights() {
        let mut net = small_chain(0);
        let policy = InitPolicy {
            weight: Strategy::Entropy,
            ..InitPolicy::default()
        };
        assert!(calibrate(&mut net, &PimContext::default(), &calibration_batches(), &policy).is_err());
    }

    #[test]
    fn test_seed_and_profile() {
        let mut net = small_chain(7);
        fold_network(&mut net).unwrap();
        net.set_last(&[".classifier.2"]).unwrap();
        let written = seed_constant(&mut net, SEED_ACTI_LOG2_T, SEED_WEIGHT_LOG2_T).unwrap();
        assert_eq!(written, 9);

        let profile = profile(&net).unwrap();
        for entry in &profile {
            let expected = match (entry.name.as_str(), entry.role) {
                (".classifier.2", _) => 0.0,
                (_, Role::Acti) => SEED_ACTI_LOG2_T,
                _ => SEED_WEIGHT_LOG2_T,
            };
            assert_eq!(entry.log2_t, expected, "{} {}", entry.name, entry.role);
        }
        assert_eq!(profile.len(), 11);
    }
}
