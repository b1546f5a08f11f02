//! Quantization-aware simulation of neural networks on PIM crossbars: log2-scaled fake
//! quantization, Conv/BatchNorm folding, PIM units sharing one ADC and the range tuning that
//! makes every ADC window representable.
pub mod fold;
pub mod hardware;
pub mod layers;
pub mod model;
pub mod quantization;
pub mod tensor;
pub mod threshold;
pub mod tuner;

#[cfg(test)]
mod testing;

pub use fold::{FoldReport, fold_network, init_pim_units};
pub use hardware::{HardwareSpec, PimContext, QuantPhase};
pub use model::{Network, NetworkBuilder};
pub use quantization::BitWidths;
pub use tensor::Tensor;
pub use tuner::{TuneEntry, tune_network};
