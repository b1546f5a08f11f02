//! Arena of the scalar log2 thresholds shared by layers and PIM units.
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[display("t{_0}")]
pub struct ThresholdId(usize);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log2Threshold {
    pub name: String,
    pub value: f32,
    pub grad: f32,
    pub trainable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ThresholdStore {
    thresholds: Vec<Log2Threshold>,
}

impl ThresholdStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, name: impl Into<String>, value: f32) -> ThresholdId {
        self.thresholds.push(Log2Threshold {
            name: name.into(),
            value,
            grad: 0.0,
            trainable: true,
        });
        ThresholdId(self.thresholds.len() - 1)
    }

    pub fn get(&self, id: ThresholdId) -> &Log2Threshold {
        &self.thresholds[id.0]
    }

    pub fn value(&self, id: ThresholdId) -> f32 {
        self.thresholds[id.0].value
    }

    pub fn set_value(&mut self, id: ThresholdId, value: f32) {
        self.thresholds[id.0].value = value;
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ThresholdId, &Log2Threshold)> {
        self.thresholds
            .iter()
            .enumerate()
            .map(|(i, t)| (ThresholdId(i), t))
    }

    /// Fixed thresholds silently drop their gradient.
    pub fn accumulate_grad(&mut self, id: ThresholdId, grad: f32) {
        let t = &mut self.thresholds[id.0];
        if t.trainable {
            t.grad += grad;
        }
    }

    pub fn zero_grad(&mut self) {
        self.thresholds.iter_mut().for_each(|t| t.grad = 0.0);
    }

    /// Plain gradient descent on every trainable threshold, then resets the gradients.
    pub fn sgd_step(&mut self, lr: f32) {
        for t in self.thresholds.iter_mut().filter(|t| t.trainable) {
            t.value -= lr * t.grad;
        }
        self.zero_grad();
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        self.thresholds
            .iter_mut()
            .for_each(|t| t.trainable = trainable);
    }

    pub fn snapshot(&self) -> BTreeMap<String, f32> {
        self.thresholds
            .iter()
            .map(|t| (t.name.clone(), t.value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgd_only_moves_trainable() {
        let mut store = ThresholdStore::new();
        let a = store.alloc("a", 1.0);
        let b = store.alloc("b", 1.0);
        store.accumulate_grad(a, 2.0);
        store.accumulate_grad(a, 1.0);
        store.sgd_step(0.5);
        assert_eq!(store.value(a), -0.5);
        assert_eq!(store.get(a).grad, 0.0);

        store.set_trainable(false);
        store.accumulate_grad(b, 4.0);
        store.sgd_step(1.0);
        assert_eq!(store.value(b), 1.0);
    }

    #[test]
    fn test_snapshot_by_name() {
        let mut store = ThresholdStore::new();
        store.alloc(".fc.weight_log2_t", 0.25);
        let snap = store.snapshot();
        assert_eq!(snap.get(".fc.weight_log2_t"), Some(&0.25));
    }
}
