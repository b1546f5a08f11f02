//! The network: an arena of nodes, the module tree that orders them, the predecessor map and
//! the threshold and PIM unit arenas everything refers into.
mod builder;
mod error;
mod node;
pub mod zoo;

pub use builder::NetworkBuilder;
pub use error::ModelError;
pub use node::{Node, NodeId, Predecessor, PredecessorMap};

use anyhow::{Context, Result, ensure};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

use crate::{
    hardware::{BoundUnit, PimContext, PimUnit, QuantPhase, ThresholdStore, UnitId, UnitStore},
    layers::{Layer, LayerOutput, WeightQuantized},
    tensor::Tensor,
};

/// A residual block computes `post(share_shortcut(shortcut(x)) + share_main(main(x)))`.
#[derive(Clone, Debug)]
pub struct ResidualBlock {
    pub main: Module,
    /// identity when absent
    pub shortcut: Option<Module>,
    pub share_shortcut: NodeId,
    pub share_main: NodeId,
    pub post: NodeId,
}

#[derive(Clone, Debug)]
pub enum Module {
    Layer(NodeId),
    Sequential(Vec<Module>),
    Residual(Box<ResidualBlock>),
}

impl Module {
    /// Node ids in evaluation order.
    pub fn visit_order(&self) -> Vec<NodeId> {
        let mut order = Vec::new();
        self.collect(&mut order);
        order
    }

    fn collect(&self, order: &mut Vec<NodeId>) {
        match self {
            Module::Layer(id) => order.push(*id),
            Module::Sequential(children) => children.iter().for_each(|c| c.collect(order)),
            Module::Residual(block) => {
                block.main.collect(order);
                if let Some(shortcut) = &block.shortcut {
                    shortcut.collect(order);
                }
                order.extend([block.share_shortcut, block.share_main, block.post]);
            }
        }
    }
}

/// Gets called with the output of every node of a forward pass.
pub trait ForwardObserver {
    fn observe(&mut self, id: NodeId, node: &Node, output: &LayerOutput);
}

impl<F> ForwardObserver for F
where
    F: FnMut(NodeId, &Node, &LayerOutput),
{
    fn observe(&mut self, id: NodeId, node: &Node, output: &LayerOutput) {
        self(id, node, output)
    }
}

#[derive(Clone, Debug)]
pub struct Network {
    nodes: Vec<Option<Node>>,
    root: Module,
    preds: PredecessorMap,
    thresholds: ThresholdStore,
    units: UnitStore,
}

impl Network {
    pub(crate) fn from_parts(
        nodes: Vec<Option<Node>>,
        root: Module,
        preds: PredecessorMap,
        thresholds: ThresholdStore,
    ) -> Result<Self> {
        let network = Self {
            nodes,
            root,
            preds,
            thresholds,
            units: UnitStore::default(),
        };
        let mut seen = HashSet::new();
        for id in network.root.visit_order() {
            network.node(id)?;
            ensure!(seen.insert(id), "node {} appears twice in the module tree", id);
        }
        for (id, pred) in network.preds.iter() {
            ensure!(
                seen.contains(&id),
                "node {} is registered as a predecessor target but not part of the module tree",
                id
            );
            if let Predecessor::Node(p) = pred {
                ensure!(
                    seen.contains(&p),
                    "predecessor {} of {} is not part of the module tree",
                    p,
                    id
                );
            }
        }
        Ok(network)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, ModelError> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| ModelError::UnknownNode(id.to_string()))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, ModelError> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| ModelError::UnknownNode(id.to_string()))
    }

    /// Live nodes in arena order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (NodeId(i), n)))
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes().find(|(_, n)| n.name == name).map(|(id, _)| id)
    }

    /// Vacates the slot of a node, e.g. when it gets fused into another one.
    pub(crate) fn take_node(&mut self, id: NodeId) -> Result<Node, ModelError> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| ModelError::UnknownNode(id.to_string()))
    }

    pub(crate) fn push_node(&mut self, node: Node) -> NodeId {
        self.nodes.push(Some(node));
        NodeId(self.nodes.len() - 1)
    }

    pub fn root(&self) -> &Module {
        &self.root
    }

    pub(crate) fn take_root(&mut self) -> Module {
        std::mem::replace(&mut self.root, Module::Sequential(Vec::new()))
    }

    pub(crate) fn set_root(&mut self, root: Module) {
        self.root = root;
    }

    pub fn visit_order(&self) -> Vec<NodeId> {
        self.root.visit_order()
    }

    pub fn predecessors(&self) -> &PredecessorMap {
        &self.preds
    }

    pub(crate) fn predecessors_mut(&mut self) -> &mut PredecessorMap {
        &mut self.preds
    }

    pub fn thresholds(&self) -> &ThresholdStore {
        &self.thresholds
    }

    pub fn thresholds_mut(&mut self) -> &mut ThresholdStore {
        &mut self.thresholds
    }

    pub fn units(&self) -> &UnitStore {
        &self.units
    }

    /// Unit attached to the node, if any.
    pub fn unit_of(&self, id: NodeId) -> Result<Option<&PimUnit>, ModelError> {
        Ok(self.node(id)?.unit.map(|u| self.units.get(u)))
    }

    pub(crate) fn clear_units(&mut self) {
        self.units = UnitStore::default();
        self.nodes
            .iter_mut()
            .flatten()
            .for_each(|n| n.unit = None);
    }

    pub(crate) fn add_unit(&mut self, unit: PimUnit) -> UnitId {
        self.units.push(unit)
    }

    /// Attaches a unit to a node after checking the node can take part in it.
    pub fn attach_unit(&mut self, id: NodeId, unit: UnitId) -> Result<(), ModelError> {
        let pim_unit = self.units.get(unit).clone();
        let node = self.node_mut(id)?;
        node.layer
            .check_unit(&pim_unit)
            .map_err(|e| ModelError::CapabilityError(format!("{}: {}", node.name, e)))?;
        node.unit = Some(unit);
        Ok(())
    }

    pub fn forward(&self, ctx: &PimContext, input: &Tensor) -> Result<Tensor> {
        self.forward_observed(ctx, input, &mut |_: NodeId, _: &Node, _: &LayerOutput| {})
    }

    pub fn forward_observed(
        &self,
        ctx: &PimContext,
        input: &Tensor,
        observer: &mut dyn ForwardObserver,
    ) -> Result<Tensor> {
        self.eval(&self.root, LayerOutput::Whole(input.clone()), ctx, observer)?
            .into_whole()
    }

    fn eval(
        &self,
        module: &Module,
        input: LayerOutput,
        ctx: &PimContext,
        observer: &mut dyn ForwardObserver,
    ) -> Result<LayerOutput> {
        match module {
            Module::Layer(id) => self.eval_node(*id, input, ctx, observer),
            Module::Sequential(children) => children
                .iter()
                .try_fold(input, |x, child| self.eval(child, x, ctx, observer)),
            Module::Residual(block) => {
                let x = input.into_whole()?;
                let main = self.eval(&block.main, LayerOutput::Whole(x.clone()), ctx, observer)?;
                let shortcut = match &block.shortcut {
                    Some(shortcut) => self.eval(shortcut, LayerOutput::Whole(x), ctx, observer)?,
                    None => LayerOutput::Whole(x),
                };
                let shortcut = self
                    .eval_node(block.share_shortcut, shortcut, ctx, observer)?
                    .into_whole()?;
                let main = self
                    .eval_node(block.share_main, main, ctx, observer)?
                    .into_whole()?;
                let joined = shortcut.add(&main)?;
                self.eval_node(block.post, LayerOutput::Whole(joined), ctx, observer)
            }
        }
    }

    fn eval_node(
        &self,
        id: NodeId,
        input: LayerOutput,
        ctx: &PimContext,
        observer: &mut dyn ForwardObserver,
    ) -> Result<LayerOutput> {
        let node = self.node(id)?;
        let unit = node
            .unit
            .map(|u| BoundUnit::new(self.units.get(u), &self.thresholds, ctx));
        let out = node
            .layer
            .forward(input, unit, ctx)
            .with_context(|| format!("forward through {} ({})", node.name, node.layer.kind()))?;
        observer.observe(id, node, &out);
        Ok(out)
    }

    /// Disables quantization on the named output layers.
    pub fn set_last(&mut self, names: &[&str]) -> Result<(), ModelError> {
        for name in names {
            let id = self
                .find(name)
                .ok_or_else(|| ModelError::UnknownNode(name.to_string()))?;
            let node = self.node_mut(id)?;
            if !node.layer.set_last(true) {
                return Err(ModelError::ParameterError(format!(
                    "{} is a {} and has no output quantization",
                    name,
                    node.layer.kind()
                )));
            }
            debug!("{} marked as last layer", name);
        }
        Ok(())
    }

    /// Toggles the weight normalization of every convolution.
    pub fn set_normalize(&mut self, normalize: bool) {
        self.nodes
            .iter_mut()
            .flatten()
            .for_each(|n| n.layer.set_normalize(normalize));
    }

    /// Switches the context to `phase`; thresholds are trainable only while training with
    /// quantization (baseline and folded batch norm phases).
    pub fn enter_phase(&mut self, ctx: &mut PimContext, phase: QuantPhase) {
        self.thresholds.set_trainable(phase.trains_thresholds());
        ctx.phase = phase;
        info!(
            "quantization phase {:?}, thresholds {}",
            phase,
            if phase.trains_thresholds() {
                "trainable"
            } else {
                "fixed"
            }
        );
    }

    /// Runs `bn_freeze` on every fused node and points the units at the thresholds now in
    /// use. Returns the number of fused nodes.
    pub fn bn_freeze(&mut self, mode: bool, convert: bool) -> Result<usize> {
        let mut count = 0;
        for slot in self.nodes.iter_mut() {
            let Some(node) = slot.as_mut() else {
                continue;
            };
            let (weight_t, bias_t) = match &mut node.layer {
                Layer::FusedConvBn(fused) => {
                    fused
                        .bn_freeze(mode, convert, &mut self.thresholds)
                        .with_context(|| format!("freezing batch norm of {}", node.name))?;
                    (fused.weight_threshold(), fused.bias_threshold())
                }
                Layer::FusedConvBnRelu(fused) => {
                    fused
                        .bn_freeze(mode, convert, &mut self.thresholds)
                        .with_context(|| format!("freezing batch norm of {}", node.name))?;
                    (fused.weight_threshold(), fused.bias_threshold())
                }
                _ => continue,
            };
            if let Some(unit) = node.unit {
                let unit = self.units.get_mut(unit);
                unit.weight = Some(weight_t);
                unit.bias = Some(bias_t);
            }
            count += 1;
        }
        info!(
            "bn_freeze(mode={}, convert={}) on {} fused nodes",
            mode, convert, count
        );
        Ok(count)
    }

    /// Name to log2 threshold value, for checkpointing outside of this crate.
    pub fn threshold_snapshot(&self) -> BTreeMap<String, f32> {
        self.thresholds.snapshot()
    }

    /// Restores thresholds from a snapshot; unknown names are ignored, returns how many matched.
    pub fn load_threshold_snapshot(&mut self, snapshot: &BTreeMap<String, f32>) -> usize {
        let ids: Vec<_> = self
            .thresholds
            .iter()
            .filter_map(|(id, t)| snapshot.get(&t.name).map(|v| (id, *v)))
            .collect();
        for (id, value) in &ids {
            self.thresholds.set_value(*id, *value);
        }
        ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fold::fold_network, testing::small_chain};

    #[test]
    fn test_visit_order_of_residual() {
        let block = ResidualBlock {
            main: Module::Sequential(vec![Module::Layer(NodeId(0)), Module::Layer(NodeId(1))]),
            shortcut: Some(Module::Layer(NodeId(2))),
            share_shortcut: NodeId(3),
            share_main: NodeId(4),
            post: NodeId(5),
        };
        let order = Module::Residual(Box::new(block)).visit_order();
        assert_eq!(order, (0..6).map(NodeId).collect::<Vec<_>>());
    }

    #[test]
    fn test_observer_sees_every_node() {
        let net = small_chain(1);
        let ctx = PimContext::default();
        let mut seen = Vec::new();
        let out = net
            .forward_observed(
                &ctx,
                &Tensor::random_seed(vec![2, 3, 8, 8], 2),
                &mut |id: NodeId, _: &Node, _: &LayerOutput| seen.push(id),
            )
            .unwrap();
        assert_eq!(out.get_shape(), &[2, 4]);
        assert_eq!(seen, net.visit_order());
    }

    #[test]
    fn test_set_last_rejects_unknown_and_passive_layers() {
        let mut net = small_chain(1);
        assert!(net.set_last(&[".nope"]).is_err());
        assert!(net.set_last(&[".features.1"]).is_err());
        assert!(net.set_last(&[".classifier.2"]).is_ok());
    }

    #[test]
    fn test_bn_freeze_repoints_units() {
        let mut net = small_chain(3);
        fold_network(&mut net).unwrap();
        net.bn_freeze(true, true).unwrap();
        for (_, node) in net.nodes() {
            if let Layer::FusedConvBnRelu(fused) = &node.layer {
                let unit = net.units().get(node.unit.unwrap());
                assert_eq!(unit.weight, Some(fused.weight_threshold()));
                assert_eq!(unit.weight, Some(fused.inner().fused_weight_t));
            }
        }
    }

    #[test]
    fn test_snapshot_roundtrip_by_name() {
        let mut net = small_chain(4);
        let mut snapshot = net.threshold_snapshot();
        for value in snapshot.values_mut() {
            *value = 1.5;
        }
        assert_eq!(net.load_threshold_snapshot(&snapshot), snapshot.len());
        assert!(net.thresholds().iter().all(|(_, t)| t.value == 1.5));
    }
}
