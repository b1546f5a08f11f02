//! Parasitic parameters of a 3D NAND cell for NVSim.
//!
//! The cell is described in an INI file whose values are numeric expressions that may refer to
//! earlier values. [`NandCell`] evaluates them, derives the wire resistances and fringe
//! capacitances, and renders the NVSim configuration files.
pub mod error;
pub mod expr;
pub mod ini;
pub mod params;
pub mod pyfmt;

pub use error::ParamError;
pub use expr::{Env, Value};
pub use ini::Ini;
pub use params::{ConfigFile, Line, NandCell, PERMITTIVITY};
