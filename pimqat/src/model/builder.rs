use anyhow::Result;
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{Module, Network, Node, NodeId, Predecessor, PredecessorMap};
use crate::{
    hardware::ThresholdStore,
    layers::{
        Layer,
        activation::Relu,
        batchnorm::{BatchNorm, DEFAULT_BN_EPS},
        conv::Conv,
        linear::Linear,
        pooling::Pooling,
        reshape::Flatten,
        sharequant::ShareQuant,
    },
    tensor::{Conv2dParams, Tensor},
};

/// Builds a raw (unfolded) network. Parameters are drawn from a seeded generator, so the same
/// seed always yields the same network.
pub struct NetworkBuilder {
    nodes: Vec<Option<Node>>,
    preds: PredecessorMap,
    thresholds: ThresholdStore,
    rng: StdRng,
}

impl NetworkBuilder {
    pub fn new(seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            preds: PredecessorMap::default(),
            thresholds: ThresholdStore::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn add_layer(&mut self, name: impl Into<String>, layer: Layer) -> NodeId {
        self.nodes.push(Some(Node::new(name, layer)));
        NodeId(self.nodes.len() - 1)
    }

    /// Records `pred` as the producer of the input of `node`.
    pub fn register(&mut self, node: NodeId, pred: Predecessor) {
        self.preds.register(node, pred);
    }

    pub fn thresholds_mut(&mut self) -> &mut ThresholdStore {
        &mut self.thresholds
    }

    fn uniform(&mut self, shape: Vec<usize>, bound: f32) -> Tensor {
        Tensor::random_seed(shape, self.rng.gen::<u64>()).scalar_mul(bound)
    }

    /// Square kernel convolution with uniform `1/sqrt(fan_in)` initialization.
    #[allow(clippy::too_many_arguments)]
    pub fn conv(
        &mut self,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        bias: bool,
    ) -> Result<NodeId> {
        let bound = 1.0 / ((in_channels * kernel * kernel) as f32).sqrt();
        let weight = self.uniform(vec![out_channels, in_channels, kernel, kernel], bound);
        let bias = bias.then(|| self.uniform(vec![out_channels], bound));
        let weight_t = self.thresholds.alloc(format!("{}.weight_log2_t", name), 0.0);
        let bias_t = self.thresholds.alloc(format!("{}.bias_log2_t", name), 0.0);
        let conv = Conv::new(
            weight,
            bias,
            Conv2dParams::new(stride, padding),
            weight_t,
            bias_t,
        )?;
        Ok(self.add_layer(name, Layer::Conv(conv)))
    }

    pub fn linear(
        &mut self,
        name: &str,
        in_features: usize,
        out_features: usize,
        bias: bool,
    ) -> Result<NodeId> {
        let bound = 1.0 / (in_features as f32).sqrt();
        let weight = self.uniform(vec![out_features, in_features], bound);
        let bias = bias.then(|| self.uniform(vec![out_features], bound));
        let weight_t = self.thresholds.alloc(format!("{}.weight_log2_t", name), 0.0);
        let bias_t = self.thresholds.alloc(format!("{}.bias_log2_t", name), 0.0);
        let linear = Linear::new(weight, bias, weight_t, bias_t)?;
        Ok(self.add_layer(name, Layer::Linear(linear)))
    }

    /// Batch norm with running statistics spread around the identity, as after some training.
    pub fn batch_norm(&mut self, name: &str, channels: usize) -> Result<NodeId> {
        let mut around = |center: f32, spread: f32| -> Vec<f32> {
            (0..channels)
                .map(|_| center + self.rng.gen_range(-spread..spread))
                .collect()
        };
        let gamma = around(1.0, 0.5);
        let beta = around(0.0, 0.1);
        let mean = around(0.0, 0.1);
        let var = around(1.0, 0.5);
        let bn = BatchNorm::new(gamma, beta, mean, var, DEFAULT_BN_EPS)?;
        Ok(self.add_layer(name, Layer::BatchNorm(bn)))
    }

    pub fn relu(&mut self, name: &str) -> NodeId {
        let acti_t = self.thresholds.alloc(format!("{}.acti_log2_t", name), 0.0);
        self.add_layer(name, Layer::Relu(Relu::new(acti_t)))
    }

    pub fn share_quant(&mut self, name: &str) -> NodeId {
        let acti_t = self.thresholds.alloc(format!("{}.acti_log2_t", name), 0.0);
        self.add_layer(name, Layer::ShareQuant(ShareQuant::new(acti_t)))
    }

    pub fn pool(&mut self, name: &str, pooling: Pooling) -> NodeId {
        self.add_layer(name, Layer::Pooling(pooling))
    }

    pub fn flatten(&mut self, name: &str) -> NodeId {
        self.add_layer(name, Layer::Flatten(Flatten))
    }

    pub fn build(self, root: Module) -> Result<Network> {
        Network::from_parts(self.nodes, root, self.preds, self.thresholds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_network() {
        let build = |seed| {
            let mut b = NetworkBuilder::new(seed);
            let conv = b.conv(".c", 2, 3, 3, 1, 1, true).unwrap();
            b.register(conv, Predecessor::Input);
            b.build(Module::Layer(conv)).unwrap()
        };
        let input = Tensor::random_seed(vec![1, 2, 4, 4], 0);
        let ctx = crate::hardware::PimContext::default();
        let a = build(5).forward(&ctx, &input).unwrap();
        let b = build(5).forward(&ctx, &input).unwrap();
        let c = build(6).forward(&ctx, &input).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_build_rejects_dangling_predecessor() {
        let mut b = NetworkBuilder::new(0);
        let relu = b.relu(".r");
        let orphan = b.relu(".orphan");
        b.register(relu, Predecessor::Node(orphan));
        assert!(b.build(Module::Layer(relu)).is_err());
    }
}
