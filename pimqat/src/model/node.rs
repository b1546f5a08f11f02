use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{hardware::UnitId, layers::Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[display("n{_0}")]
pub struct NodeId(pub(crate) usize);

#[derive(Clone, Debug)]
pub struct Node {
    /// Module path, e.g. `.layer1.0.conv1`
    pub name: String,
    pub layer: Layer,
    pub unit: Option<UnitId>,
}

impl Node {
    pub fn new(name: impl Into<String>, layer: Layer) -> Self {
        Self {
            name: name.into(),
            layer,
            unit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predecessor {
    /// first layer of the network
    Input,
    Node(NodeId),
}

/// Which node feeds which, for the nodes that take part in range tuning.
#[derive(Debug, Clone, Default)]
pub struct PredecessorMap {
    entries: Vec<Option<Predecessor>>,
}

impl PredecessorMap {
    pub fn register(&mut self, node: NodeId, pred: Predecessor) {
        if self.entries.len() <= node.0 {
            self.entries.resize(node.0 + 1, None);
        }
        self.entries[node.0] = Some(pred);
    }

    pub fn get(&self, node: NodeId) -> Option<Predecessor> {
        self.entries.get(node.0).copied().flatten()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.get(node).is_some()
    }

    /// The predecessor when it is a node, `None` for the input or unregistered nodes.
    pub fn predecessor_node(&self, node: NodeId) -> Option<NodeId> {
        match self.get(node) {
            Some(Predecessor::Node(p)) => Some(p),
            _ => None,
        }
    }

    pub fn remove(&mut self, node: NodeId) -> Option<Predecessor> {
        self.entries.get_mut(node.0).and_then(Option::take)
    }

    /// Replaces the nodes of a fusion by the fused node: it takes over the entry of the first
    /// replaced node, and whatever pointed at a replaced node now points at it.
    pub fn redirect(&mut self, replaced: &[NodeId], fused: NodeId) {
        let inherited = replaced.first().and_then(|first| self.get(*first));
        for r in replaced {
            self.remove(*r);
        }
        for entry in self.entries.iter_mut().flatten() {
            if let Predecessor::Node(p) = entry {
                if replaced.contains(p) {
                    *p = fused;
                }
            }
        }
        if let Some(pred) = inherited {
            self.register(fused, pred);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, Predecessor)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.map(|p| (NodeId(i), p)))
    }

    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect() {
        let (input_conv, conv, bn, relu, next, fused) =
            (NodeId(0), NodeId(1), NodeId(2), NodeId(3), NodeId(4), NodeId(5));
        let mut map = PredecessorMap::default();
        map.register(input_conv, Predecessor::Input);
        map.register(conv, Predecessor::Node(input_conv));
        map.register(next, Predecessor::Node(relu));

        map.redirect(&[conv, bn, relu], fused);
        assert_eq!(map.get(fused), Some(Predecessor::Node(input_conv)));
        assert_eq!(map.get(next), Some(Predecessor::Node(fused)));
        assert!(!map.contains(conv));
        assert!(!map.contains(relu));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_redirect_unregistered_conv() {
        let mut map = PredecessorMap::default();
        map.register(NodeId(3), Predecessor::Node(NodeId(0)));
        map.redirect(&[NodeId(0), NodeId(1)], NodeId(4));
        assert!(!map.contains(NodeId(4)));
        assert_eq!(map.predecessor_node(NodeId(3)), Some(NodeId(4)));
    }
}
