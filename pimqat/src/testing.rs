//! Small networks for unit tests.
use crate::{
    layers::pooling::Pooling,
    model::{Module, Network, NetworkBuilder, Predecessor},
};

/// A two-stage VGG-like chain for `[N, 3, 8, 8]` inputs with four outputs:
/// `.features.{0..6}` (conv, bn, relu twice, then a max pool), `.flatten` and
/// `.classifier.{0,1,2}` (linear, relu, linear).
pub fn small_chain(seed: u64) -> Network {
    let mut b = NetworkBuilder::new(seed);
    let conv0 = b.conv(".features.0", 3, 4, 3, 1, 1, true).unwrap();
    let bn1 = b.batch_norm(".features.1", 4).unwrap();
    let relu2 = b.relu(".features.2");
    let conv3 = b.conv(".features.3", 4, 4, 3, 1, 1, true).unwrap();
    let bn4 = b.batch_norm(".features.4", 4).unwrap();
    let relu5 = b.relu(".features.5");
    let pool = b.pool(
        ".features.6",
        Pooling::Max {
            kernel: 2,
            stride: 2,
            padding: 0,
        },
    );
    let flatten = b.flatten(".flatten");
    let fc0 = b.linear(".classifier.0", 4 * 4 * 4, 8, true).unwrap();
    let relu1 = b.relu(".classifier.1");
    let fc2 = b.linear(".classifier.2", 8, 4, true).unwrap();

    b.register(conv0, Predecessor::Input);
    b.register(conv3, Predecessor::Node(relu2));
    b.register(fc0, Predecessor::Node(relu5));
    b.register(relu1, Predecessor::Node(fc0));
    b.register(fc2, Predecessor::Node(relu1));

    let features = [conv0, bn1, relu2, conv3, bn4, relu5, pool].map(Module::Layer);
    let classifier = [fc0, relu1, fc2].map(Module::Layer);
    b.build(Module::Sequential(vec![
        Module::Sequential(features.to_vec()),
        Module::Layer(flatten),
        Module::Sequential(classifier.to_vec()),
    ]))
    .unwrap()
}
