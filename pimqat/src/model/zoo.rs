//! VGG and ResNet families, registered for range tuning the way their quantized training
//! scripts register them: only convolutions, linear layers and the residual quantizers get a
//! predecessor, batch norms and ReLUs are reached through the fold.
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use tracing::info;

use super::{Module, ModelError, Network, NetworkBuilder, NodeId, Predecessor, ResidualBlock};
use crate::layers::pooling::Pooling;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    Vgg11,
    Vgg13,
    Vgg16,
    Vgg19,
    ResNet18,
    ResNet34,
    ResNet50,
    ResNet101,
    ResNet152,
}

impl FromStr for Family {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vgg11" => Ok(Family::Vgg11),
            "vgg13" => Ok(Family::Vgg13),
            "vgg16" => Ok(Family::Vgg16),
            "vgg19" => Ok(Family::Vgg19),
            "resnet18" => Ok(Family::ResNet18),
            "resnet34" => Ok(Family::ResNet34),
            "resnet50" => Ok(Family::ResNet50),
            "resnet101" => Ok(Family::ResNet101),
            "resnet152" => Ok(Family::ResNet152),
            _ => Err(ModelError::UnsupportedFamily(s.to_string())),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Family::Vgg11 => "VGG11",
            Family::Vgg13 => "VGG13",
            Family::Vgg16 => "VGG16",
            Family::Vgg19 => "VGG19",
            Family::ResNet18 => "ResNet18",
            Family::ResNet34 => "ResNet34",
            Family::ResNet50 => "ResNet50",
            Family::ResNet101 => "ResNet101",
            Family::ResNet152 => "ResNet152",
        };
        write!(f, "{}", name)
    }
}

/// `M` stands for a 2x2 max pool.
const M: usize = 0;
const VGG11: &[usize] = &[64, M, 128, M, 256, 256, M, 512, 512, M, 512, 512, M];
const VGG13: &[usize] = &[64, 64, M, 128, 128, M, 256, 256, M, 512, 512, M, 512, 512, M];
const VGG16: &[usize] = &[
    64, 64, M, 128, 128, M, 256, 256, 256, M, 512, 512, 512, M, 512, 512, 512, M,
];
const VGG19: &[usize] = &[
    64, 64, M, 128, 128, M, 256, 256, 256, 256, M, 512, 512, 512, 512, M, 512, 512, 512, 512, M,
];

enum BlockKind {
    Basic,
    Bottleneck,
}

impl Family {
    /// Module path of the output layer, which always computes in float.
    pub fn last_layer(&self) -> &'static str {
        if self.is_vgg() { ".classifier.6" } else { ".fc" }
    }

    /// VGG weights are quantized as is, ResNet weights are normalized first.
    pub fn normalize(&self) -> bool {
        !self.is_vgg()
    }

    pub fn is_vgg(&self) -> bool {
        matches!(
            self,
            Family::Vgg11 | Family::Vgg13 | Family::Vgg16 | Family::Vgg19
        )
    }

    fn resnet_layout(&self) -> Option<(BlockKind, [usize; 4])> {
        match self {
            Family::ResNet18 => Some((BlockKind::Basic, [2, 2, 2, 2])),
            Family::ResNet34 => Some((BlockKind::Basic, [3, 4, 6, 3])),
            Family::ResNet50 => Some((BlockKind::Bottleneck, [3, 4, 6, 3])),
            Family::ResNet101 => Some((BlockKind::Bottleneck, [3, 4, 23, 3])),
            Family::ResNet152 => Some((BlockKind::Bottleneck, [3, 8, 36, 3])),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZooConfig {
    pub family: Family,
    pub num_classes: usize,
    /// every channel count is divided by this, for small simulations
    pub width_divisor: usize,
    pub seed: u64,
}

impl ZooConfig {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            num_classes: 10,
            width_divisor: 1,
            seed: 0,
        }
    }

    fn width(&self, channels: usize) -> usize {
        (channels / self.width_divisor.max(1)).max(1)
    }
}

/// Builds the raw network, marks its output layer and applies the family's normalization.
pub fn build_network(config: &ZooConfig) -> Result<Network> {
    let mut network = match config.family.resnet_layout() {
        Some((kind, blocks)) => build_resnet(config, kind, blocks)?,
        None => build_vgg(config)?,
    };
    network.set_last(&[config.family.last_layer()])?;
    network.set_normalize(config.family.normalize());
    info!(
        "built {} ({} classes, width / {}): {} nodes, {} registered",
        config.family,
        config.num_classes,
        config.width_divisor,
        network.nodes().count(),
        network.predecessors().len()
    );
    Ok(network)
}

fn pred_of(prev: Option<NodeId>) -> Predecessor {
    prev.map_or(Predecessor::Input, Predecessor::Node)
}

fn build_vgg(config: &ZooConfig) -> Result<Network> {
    let plan = match config.family {
        Family::Vgg11 => VGG11,
        Family::Vgg13 => VGG13,
        Family::Vgg16 => VGG16,
        _ => VGG19,
    };
    let mut b = NetworkBuilder::new(config.seed);
    let mut prev: Option<NodeId> = None;
    let mut features = Vec::new();
    let mut in_channels = 3;
    let mut index = 0;
    let name = |index: &mut usize| {
        let n = format!(".features.{}", index);
        *index += 1;
        n
    };
    for &entry in plan {
        match entry {
            M => {
                let pool = b.pool(
                    &name(&mut index),
                    Pooling::Max {
                        kernel: 2,
                        stride: 2,
                        padding: 0,
                    },
                );
                features.push(Module::Layer(pool));
            }
            channels => {
                let out_channels = config.width(channels);
                let conv = b.conv(&name(&mut index), in_channels, out_channels, 3, 1, 1, true)?;
                let bn = b.batch_norm(&name(&mut index), out_channels)?;
                let relu = b.relu(&name(&mut index));
                b.register(conv, pred_of(prev));
                prev = Some(relu);
                features.extend([conv, bn, relu].map(Module::Layer));
                in_channels = out_channels;
            }
        }
    }
    let cifar = config.num_classes == 10;
    let (head_pool, flat_features, hidden) = if cifar {
        (Pooling::Avg { kernel: 1, stride: 1 }, in_channels, config.width(512))
    } else {
        (
            Pooling::AdaptiveAvg { output: (7, 7) },
            7 * 7 * in_channels,
            config.width(4096),
        )
    };
    features.push(Module::Layer(b.pool(&name(&mut index), head_pool)));
    let flatten = b.flatten(".flatten");

    // indices 2 and 5 are dropouts, which inference skips
    let fc0 = b.linear(".classifier.0", flat_features, hidden, true)?;
    let relu1 = b.relu(".classifier.1");
    let fc3 = b.linear(".classifier.3", hidden, hidden, true)?;
    let relu4 = b.relu(".classifier.4");
    let fc6 = b.linear(".classifier.6", hidden, config.num_classes, true)?;
    let mut chain_prev = prev;
    for id in [fc0, relu1, fc3, relu4, fc6] {
        b.register(id, pred_of(chain_prev));
        chain_prev = Some(id);
    }
    let classifier = [fc0, relu1, fc3, relu4, fc6].map(Module::Layer).to_vec();
    b.build(Module::Sequential(vec![
        Module::Sequential(features),
        Module::Layer(flatten),
        Module::Sequential(classifier),
    ]))
}

struct ResNetState<'a> {
    b: NetworkBuilder,
    config: &'a ZooConfig,
    in_planes: usize,
    prev: NodeId,
}

impl ResNetState<'_> {
    fn basic_block(&mut self, prefix: &str, planes: usize, stride: usize) -> Result<Module> {
        let input = self.prev;
        let b = &mut self.b;
        let conv1 = b.conv(&format!("{}.conv1", prefix), self.in_planes, planes, 3, stride, 1, false)?;
        let bn1 = b.batch_norm(&format!("{}.bn1", prefix), planes)?;
        let relu1 = b.relu(&format!("{}.relu1", prefix));
        let conv2 = b.conv(&format!("{}.conv2", prefix), planes, planes, 3, 1, 1, false)?;
        let bn2 = b.batch_norm(&format!("{}.bn2", prefix), planes)?;
        b.register(conv1, Predecessor::Node(input));
        b.register(conv2, Predecessor::Node(relu1));
        let main = Module::Sequential([conv1, bn1, relu1, conv2, bn2].map(Module::Layer).to_vec());
        self.finish_block(prefix, main, conv2, planes, stride)
    }

    fn bottleneck(&mut self, prefix: &str, planes: usize, stride: usize) -> Result<Module> {
        let input = self.prev;
        let out_planes = planes * 4;
        let b = &mut self.b;
        let conv1 = b.conv(&format!("{}.conv1", prefix), self.in_planes, planes, 1, 1, 0, false)?;
        let bn1 = b.batch_norm(&format!("{}.bn1", prefix), planes)?;
        let relu1 = b.relu(&format!("{}.relu1", prefix));
        let conv2 = b.conv(&format!("{}.conv2", prefix), planes, planes, 3, stride, 1, false)?;
        let bn2 = b.batch_norm(&format!("{}.bn2", prefix), planes)?;
        let relu2 = b.relu(&format!("{}.relu2", prefix));
        let conv3 = b.conv(&format!("{}.conv3", prefix), planes, out_planes, 1, 1, 0, false)?;
        let bn3 = b.batch_norm(&format!("{}.bn3", prefix), out_planes)?;
        b.register(conv1, Predecessor::Node(input));
        b.register(conv2, Predecessor::Node(relu1));
        b.register(conv3, Predecessor::Node(relu2));
        let main = Module::Sequential(
            [conv1, bn1, relu1, conv2, bn2, relu2, conv3, bn3]
                .map(Module::Layer)
                .to_vec(),
        );
        self.finish_block(prefix, main, conv3, out_planes, stride)
    }

    /// Shortcut, the two share quantizers and the post ReLU common to both block kinds.
    fn finish_block(
        &mut self,
        prefix: &str,
        main: Module,
        main_tail: NodeId,
        out_planes: usize,
        stride: usize,
    ) -> Result<Module> {
        let input = self.prev;
        let b = &mut self.b;
        let (shortcut, shortcut_tail) = if stride != 1 || self.in_planes != out_planes {
            let conv = b.conv(
                &format!("{}.downsample.0", prefix),
                self.in_planes,
                out_planes,
                1,
                stride,
                0,
                false,
            )?;
            let bn = b.batch_norm(&format!("{}.downsample.1", prefix), out_planes)?;
            b.register(conv, Predecessor::Node(input));
            (
                Some(Module::Sequential(vec![Module::Layer(conv), Module::Layer(bn)])),
                conv,
            )
        } else {
            (None, input)
        };
        let share1 = b.share_quant(&format!("{}.share1", prefix));
        let share2 = b.share_quant(&format!("{}.share2", prefix));
        let post = b.relu(&format!("{}.relu_post", prefix));
        b.register(share1, Predecessor::Node(shortcut_tail));
        b.register(share2, Predecessor::Node(main_tail));
        b.register(post, Predecessor::Node(share2));
        self.in_planes = out_planes;
        self.prev = post;
        Ok(Module::Residual(Box::new(ResidualBlock {
            main,
            shortcut,
            share_shortcut: share1,
            share_main: share2,
            post,
        })))
    }
}

fn build_resnet(config: &ZooConfig, kind: BlockKind, blocks: [usize; 4]) -> Result<Network> {
    let mut b = NetworkBuilder::new(config.seed);
    let stem_planes = config.width(64);
    // CIFAR-sized inputs keep full resolution in the stem
    let conv1 = if config.num_classes == 10 {
        b.conv(".conv1", 3, stem_planes, 3, 1, 1, false)?
    } else {
        b.conv(".conv1", 3, stem_planes, 7, 2, 3, false)?
    };
    let bn1 = b.batch_norm(".bn1", stem_planes)?;
    let relu = b.relu(".relu");
    b.register(conv1, Predecessor::Input);
    let mut stem = [conv1, bn1, relu].map(Module::Layer).to_vec();
    if config.num_classes == 1000 {
        let maxpool = b.pool(
            ".maxpool",
            Pooling::Max {
                kernel: 3,
                stride: 2,
                padding: 1,
            },
        );
        stem.push(Module::Layer(maxpool));
    }
    let mut root = vec![Module::Sequential(stem)];

    let mut state = ResNetState {
        b,
        config,
        in_planes: stem_planes,
        prev: relu,
    };
    for (stage, (&count, planes)) in blocks.iter().zip([64, 128, 256, 512]).enumerate() {
        let planes = state.config.width(planes);
        let mut stage_blocks = Vec::with_capacity(count);
        for i in 0..count {
            let prefix = format!(".layer{}.{}", stage + 1, i);
            let stride = if stage > 0 && i == 0 { 2 } else { 1 };
            stage_blocks.push(match kind {
                BlockKind::Basic => state.basic_block(&prefix, planes, stride)?,
                BlockKind::Bottleneck => state.bottleneck(&prefix, planes, stride)?,
            });
        }
        root.push(Module::Sequential(stage_blocks));
    }

    let ResNetState {
        mut b,
        in_planes,
        prev,
        ..
    } = state;
    let avgpool = if config.num_classes == 10 {
        b.pool(".avgpool", Pooling::Avg { kernel: 4, stride: 4 })
    } else {
        b.pool(".avgpool", Pooling::GlobalAvg)
    };
    let flatten = b.flatten(".flatten");
    let fc = b.linear(".fc", in_planes, config.num_classes, true)?;
    b.register(fc, Predecessor::Node(prev));
    root.extend([avgpool, flatten, fc].map(Module::Layer));
    b.build(Module::Sequential(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hardware::PimContext, layers::Layer, tensor::Tensor};
    use rstest::rstest;

    #[rstest]
    #[case("vgg11", Family::Vgg11)]
    #[case("VGG19", Family::Vgg19)]
    #[case("ResNet50", Family::ResNet50)]
    fn test_family_names(#[case] name: &str, #[case] family: Family) {
        assert_eq!(name.parse::<Family>().unwrap(), family);
    }

    #[test]
    fn test_unknown_family() {
        assert!(matches!(
            "alexnet".parse::<Family>(),
            Err(ModelError::UnsupportedFamily(_))
        ));
    }

    #[rstest]
    #[case(Family::Vgg11, 10)]
    #[case(Family::ResNet18, 10)]
    #[case(Family::ResNet50, 7)]
    fn test_float_forward_shapes(#[case] family: Family, #[case] classes: usize) {
        let config = ZooConfig {
            family,
            num_classes: classes,
            width_divisor: 16,
            seed: 1,
        };
        let net = build_network(&config).unwrap();
        let out = net
            .forward(&PimContext::default(), &Tensor::random_seed(vec![2, 3, 32, 32], 3))
            .unwrap();
        assert_eq!(out.get_shape(), &[2, classes]);
        let last = net.find(family.last_layer()).unwrap();
        assert!(net.node(last).unwrap().layer.is_last());
    }

    #[rstest]
    #[case(10, (3, 3), false)]
    #[case(100, (7, 7), false)]
    #[case(1000, (7, 7), true)]
    fn test_resnet_stem_follows_class_count(
        #[case] num_classes: usize,
        #[case] kernel: (usize, usize),
        #[case] maxpool: bool,
    ) {
        let net = build_network(&ZooConfig {
            family: Family::ResNet18,
            num_classes,
            width_divisor: 16,
            seed: 2,
        })
        .unwrap();
        let conv1 = net.find(".conv1").unwrap();
        let Layer::Conv(conv) = &net.node(conv1).unwrap().layer else {
            panic!(".conv1 is not a convolution");
        };
        assert_eq!(conv.kernel_size(), kernel);
        assert_eq!(net.find(".maxpool").is_some(), maxpool);

        let out = net
            .forward(&PimContext::default(), &Tensor::random_seed(vec![1, 3, 32, 32], 4))
            .unwrap();
        assert_eq!(out.get_shape(), &[1, num_classes]);
    }

    #[test]
    fn test_resnet_registration() {
        let net = build_network(&ZooConfig {
            width_divisor: 16,
            ..ZooConfig::new(Family::ResNet18)
        })
        .unwrap();
        let preds = net.predecessors();
        let id = |name: &str| net.find(name).unwrap();
        assert_eq!(preds.get(id(".conv1")), Some(Predecessor::Input));
        assert_eq!(
            preds.get(id(".layer1.0.conv1")),
            Some(Predecessor::Node(id(".relu")))
        );
        assert_eq!(
            preds.get(id(".layer1.0.share1")),
            Some(Predecessor::Node(id(".relu")))
        );
        assert_eq!(
            preds.get(id(".layer2.0.share1")),
            Some(Predecessor::Node(id(".layer2.0.downsample.0")))
        );
        assert_eq!(
            preds.get(id(".layer2.0.share2")),
            Some(Predecessor::Node(id(".layer2.0.conv2")))
        );
        assert_eq!(
            preds.get(id(".fc")),
            Some(Predecessor::Node(id(".layer4.1.relu_post")))
        );
        assert!(!preds.contains(id(".layer1.0.bn1")));
        assert!(matches!(
            net.node(id(".layer1.0.bn1")).unwrap().layer,
            Layer::BatchNorm(_)
        ));
    }
}
