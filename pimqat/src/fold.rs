//! Folds `Conv, BatchNorm, ReLU` and `Conv, BatchNorm` runs into fused nodes, then groups the
//! nodes sharing a crossbar into PIM units.
use anyhow::{Context, Result};
use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    hardware::PimUnit,
    layers::{
        Layer,
        fused::{FusedConvBn, FusedConvBnRelu},
    },
    model::{Module, Network, Node, NodeId},
};

#[derive(Debug, Clone, Serialize)]
pub struct FusedEntry {
    pub name: String,
    pub kind: &'static str,
    pub node: NodeId,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FoldReport {
    pub fused: Vec<FusedEntry>,
    pub units: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Tag {
    Conv,
    BatchNorm,
    Relu,
    Other,
}

/// Folds the whole network and creates its PIM units.
pub fn fold_network(network: &mut Network) -> Result<FoldReport> {
    let mut report = FoldReport::default();
    let root = network.take_root();
    let root = fold_module(network, root, &mut report)?;
    network.set_root(root);
    report.units = init_pim_units(network)?;
    info!(
        "folded {} conv/bn groups, created {} PIM units",
        report.fused.len(),
        report.units
    );
    Ok(report)
}

fn fold_module(network: &mut Network, module: Module, report: &mut FoldReport) -> Result<Module> {
    match module {
        Module::Layer(_) => Ok(module),
        Module::Sequential(children) => {
            Ok(Module::Sequential(fold_sequence(network, children, report)?))
        }
        Module::Residual(mut block) => {
            block.main = fold_module(network, block.main, report)?;
            block.shortcut = block
                .shortcut
                .map(|s| fold_module(network, s, report))
                .transpose()?;
            Ok(Module::Residual(block))
        }
    }
}

fn tag(network: &Network, module: &Module) -> Result<Tag> {
    let Module::Layer(id) = module else {
        return Ok(Tag::Other);
    };
    Ok(match network.node(*id)?.layer {
        Layer::Conv(_) => Tag::Conv,
        Layer::BatchNorm(_) => Tag::BatchNorm,
        Layer::Relu(_) => Tag::Relu,
        _ => Tag::Other,
    })
}

fn fold_sequence(
    network: &mut Network,
    children: Vec<Module>,
    report: &mut FoldReport,
) -> Result<Vec<Module>> {
    let children = children
        .into_iter()
        .map(|c| fold_module(network, c, report))
        .collect::<Result<Vec<_>>>()?;
    let tags = children
        .iter()
        .map(|c| tag(network, c))
        .collect::<Result<Vec<_>>>()?;
    let ids: Vec<Option<NodeId>> = children
        .iter()
        .map(|c| match c {
            Module::Layer(id) => Some(*id),
            _ => None,
        })
        .collect();

    let mut folded = Vec::with_capacity(children.len());
    let mut children = children.into_iter().map(Some).collect_vec();
    let mut i = 0;
    while i < children.len() {
        let window = &tags[i..tags.len().min(i + 3)];
        let run = match window {
            [Tag::Conv, Tag::BatchNorm, Tag::Relu] => 3,
            [Tag::Conv, Tag::BatchNorm, ..] => 2,
            _ => 0,
        };
        if run == 0 {
            if let Some(child) = children[i].take() {
                folded.push(child);
            }
            i += 1;
            continue;
        }
        let parts = ids[i..i + run].iter().flatten().copied().collect_vec();
        let fused = fuse(network, &parts, report)?;
        folded.push(Module::Layer(fused));
        i += run;
    }
    Ok(folded)
}

/// Replaces `parts` (conv, bn and optionally relu) by one fused node named after the conv.
fn fuse(network: &mut Network, parts: &[NodeId], report: &mut FoldReport) -> Result<NodeId> {
    let nodes = parts
        .iter()
        .map(|id| network.take_node(*id))
        .collect::<Result<Vec<_>, _>>()?;
    let name = nodes[0].name.clone();
    let mut layers = nodes.into_iter().map(|n| n.layer);
    let (conv, bn) = match (layers.next(), layers.next()) {
        (Some(conv), Some(bn)) => (conv, bn),
        _ => anyhow::bail!("{}: a fusion needs at least a conv and a batch norm", name),
    };
    let layer = match layers.next() {
        Some(relu) => Layer::FusedConvBnRelu(
            FusedConvBnRelu::from_parts(conv, bn, relu, network.thresholds_mut(), &name)
                .context("fusing conv, batch norm and relu")?,
        ),
        None => Layer::FusedConvBn(
            FusedConvBn::from_parts(conv, bn, network.thresholds_mut(), &name)
                .context("fusing conv and batch norm")?,
        ),
    };
    let kind = layer.kind();
    let fused = network.push_node(Node::new(name.clone(), layer));
    network.predecessors_mut().redirect(parts, fused);
    debug!("fold {} -> {} {}", name, kind, fused);
    report.fused.push(FusedEntry {
        name,
        kind,
        node: fused,
    });
    Ok(fused)
}

/// Creates one PIM unit per group of nodes sharing a crossbar, for the nodes registered in the
/// predecessor map. A fused conv-bn-relu owns its unit; a ReLU or share quantizer right after
/// a bare crossbar (conv, linear, fused conv-bn) shares one with it; any other ReLU or share
/// quantizer only quantizes its activation. Returns the number of units.
pub fn init_pim_units(network: &mut Network) -> Result<usize> {
    network.clear_units();
    for id in network.visit_order() {
        if !network.predecessors().contains(id) {
            continue;
        }
        let node = network.node(id)?;
        let (unit, partner) = match &node.layer {
            Layer::FusedConvBnRelu(fused) => {
                let weighted = node.layer.as_weighted().context("fused node without weights")?;
                (
                    PimUnit::with_weights(
                        fused.acti_t,
                        weighted.weight_threshold(),
                        weighted.bias_threshold(),
                    ),
                    None,
                )
            }
            Layer::Relu(_) | Layer::ShareQuant(_) => {
                let acti = node
                    .layer
                    .as_activation()
                    .context("activation node without threshold")?
                    .acti_threshold();
                let crossbar = match network.predecessors().predecessor_node(id) {
                    Some(p) if network.node(p)?.layer.is_bare_crossbar() => Some(p),
                    _ => None,
                };
                match crossbar {
                    Some(p) => {
                        let weighted = network
                            .node(p)?
                            .layer
                            .as_weighted()
                            .context("crossbar node without weights")?;
                        (
                            PimUnit::with_weights(
                                acti,
                                weighted.weight_threshold(),
                                weighted.bias_threshold(),
                            ),
                            Some(p),
                        )
                    }
                    None => (PimUnit::activation_only(acti), None),
                }
            }
            _ => continue,
        };
        let name = node.name.clone();
        let unit_id = network.add_unit(unit);
        network.attach_unit(id, unit_id)?;
        if let Some(p) = partner {
            network.attach_unit(p, unit_id)?;
            debug!("unit {} shared by {} and {}", unit_id, name, network.node(p)?.name);
        } else {
            debug!("unit {} owned by {}", unit_id, name);
        }
    }
    Ok(network.units().len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hardware::{PimContext, QuantPhase},
        model::{
            NetworkBuilder, Predecessor,
            zoo::{Family, ZooConfig, build_network},
        },
        tensor::Tensor,
        testing::small_chain,
    };

    #[test]
    fn test_conv_bn_relu_folds_into_one_node() {
        let mut net = small_chain(0);
        let conv0 = net.find(".features.0").unwrap();
        let next_conv = net.find(".features.3").unwrap();
        let report = fold_network(&mut net).unwrap();
        assert_eq!(report.fused.len(), 2);
        assert!(net.node(conv0).is_err(), "replaced slots are vacated");

        let fused0 = report.fused[0].node;
        assert!(matches!(
            net.node(fused0).unwrap().layer,
            Layer::FusedConvBnRelu(_)
        ));
        assert_eq!(net.predecessors().get(fused0), Some(Predecessor::Input));
        // the second conv pointed at the first ReLU, now at the fused node
        let fused1 = report.fused[1].node;
        assert_eq!(
            net.predecessors().get(fused1),
            Some(Predecessor::Node(fused0))
        );
        assert!(net.node(next_conv).is_err());
    }

    #[test]
    fn test_conv_relu_stays_unfused() {
        let mut b = NetworkBuilder::new(0);
        let conv = b.conv(".c", 3, 4, 3, 1, 1, true).unwrap();
        let relu = b.relu(".r");
        b.register(conv, Predecessor::Input);
        b.register(relu, Predecessor::Node(conv));
        let mut net = b
            .build(Module::Sequential(vec![Module::Layer(conv), Module::Layer(relu)]))
            .unwrap();
        let report = fold_network(&mut net).unwrap();
        assert!(report.fused.is_empty());
        // the relu shares its unit with the bare conv
        assert_eq!(report.units, 1);
        assert_eq!(net.node(conv).unwrap().unit, net.node(relu).unwrap().unit);
    }

    #[test]
    fn test_trailing_conv_is_not_folded() {
        let mut b = NetworkBuilder::new(0);
        let bn = b.batch_norm(".bn", 3).unwrap();
        let conv = b.conv(".c", 3, 4, 1, 1, 0, true).unwrap();
        let mut net = b
            .build(Module::Sequential(vec![Module::Layer(bn), Module::Layer(conv)]))
            .unwrap();
        assert!(fold_network(&mut net).unwrap().fused.is_empty());
    }

    #[test]
    fn test_units_follow_coupling() {
        let mut net = build_network(&ZooConfig {
            width_divisor: 16,
            ..ZooConfig::new(Family::ResNet18)
        })
        .unwrap();
        fold_network(&mut net).unwrap();
        let id = |name: &str| net.find(name).unwrap();

        // conv2 + bn2 became a fused conv-bn sharing its unit with share2
        let cb = id(".layer1.0.conv2");
        assert!(matches!(net.node(cb).unwrap().layer, Layer::FusedConvBn(_)));
        let share2 = net.node(id(".layer1.0.share2")).unwrap();
        assert_eq!(share2.unit, net.node(cb).unwrap().unit);
        assert!(net.unit_of(cb).unwrap().unwrap().weight.is_some());

        // share1 without downsample and the post relu quantize their activation only
        let share1 = net.unit_of(id(".layer1.0.share1")).unwrap().unwrap();
        assert!(share1.weight.is_none());
        let post = net.unit_of(id(".layer1.0.relu_post")).unwrap().unwrap();
        assert!(post.weight.is_none());

        // downsample conv-bn shares with share1 of the first block of layer2
        let ds = id(".layer2.0.downsample.0");
        assert_eq!(
            net.node(ds).unwrap().unit,
            net.node(id(".layer2.0.share1")).unwrap().unit
        );
        // the float fc gets nothing of its own
        assert!(net.node(id(".fc")).unwrap().unit.is_none());
    }

    #[test]
    fn test_folded_network_still_runs() {
        let mut net = build_network(&ZooConfig {
            width_divisor: 16,
            ..ZooConfig::new(Family::Vgg11)
        })
        .unwrap();
        let input = Tensor::random_seed(vec![1, 3, 32, 32], 8);
        let ctx = PimContext::default();
        let before = net.forward(&ctx, &input).unwrap();
        fold_network(&mut net).unwrap();
        let after = net.forward(&ctx, &input).unwrap();
        assert_eq!(before, after);

        let ctx = ctx.with_phase(QuantPhase::BaselineTrain);
        assert!(net.forward(&ctx, &input).is_ok());
    }
}
