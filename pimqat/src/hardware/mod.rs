//! Hardware-facing state: the quantization phase, the crossbar/ADC description and the
//! threshold and unit arenas.
mod pim;
mod threshold;

pub use pim::{BoundUnit, PimUnit, UnitId, UnitStore};
pub use threshold::{Log2Threshold, ThresholdId, ThresholdStore};

use serde::{Deserialize, Serialize};

use crate::quantization::{BIT_WIDTHS, BitWidths};

/// Rows of a crossbar tile, i.e. how many inputs accumulate into one bitline.
pub const DEFAULT_NUM_ROWS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantPhase {
    /// plain float network
    Float,
    /// quantized training with separate batch norms
    BaselineTrain,
    /// quantized training with batch norms folded into the convolutions
    BnFolded,
    /// thresholds snapped to powers of two and constrained to the ADC window
    RangeConstrained,
    /// crossbar-tiled inference, each tile quantized on its own
    HardwareInference,
}

impl QuantPhase {
    pub fn rounds_threshold(&self) -> bool {
        matches!(
            self,
            QuantPhase::RangeConstrained | QuantPhase::HardwareInference
        )
    }

    pub fn trains_thresholds(&self) -> bool {
        matches!(self, QuantPhase::BaselineTrain | QuantPhase::BnFolded)
    }
}

/// ADC and crossbar description. The range window stays unset until the tuner installs it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HardwareSpec {
    pub num_rows: usize,
    pub precision: Option<i32>,
    pub min_range_log2: Option<i32>,
    pub max_range_log2: Option<i32>,
}

impl Default for HardwareSpec {
    fn default() -> Self {
        Self {
            num_rows: DEFAULT_NUM_ROWS,
            precision: None,
            min_range_log2: None,
            max_range_log2: None,
        }
    }
}

/// Everything a forward pass or a network pass needs to know about the simulated hardware.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PimContext {
    pub phase: QuantPhase,
    pub spec: HardwareSpec,
    pub bits: BitWidths,
}

impl PimContext {
    pub fn new(bits: BitWidths) -> Self {
        Self {
            phase: QuantPhase::Float,
            spec: HardwareSpec::default(),
            bits,
        }
    }

    pub fn with_phase(mut self, phase: QuantPhase) -> Self {
        self.phase = phase;
        self
    }
}

impl Default for PimContext {
    fn default() -> Self {
        Self::new(*BIT_WIDTHS)
    }
}
