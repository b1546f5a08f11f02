//! Module containing code defining [`ModelError`] type and conversions.

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

#[derive(Debug, Clone, PartialEq)]
/// Errors relating to [`super::Network`] construction and rewriting.
pub enum ModelError {
    /// Error variant returned when parameters passed to a model are incorrect,
    /// i.e. input tensor dimensions are incorrect or types don't line up.
    ParameterError(String),
    /// A node id that is not (or no longer) part of the network.
    UnknownNode(String),
    /// The layers picked for a fusion do not form a Conv / BatchNorm (/ ReLU) sequence.
    FoldError(String),
    /// A PIM unit was attached to a layer that cannot take part in it.
    CapabilityError(String),
    /// Requested network family is not part of the zoo.
    UnsupportedFamily(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ModelError::ParameterError(s) => write!(f, "Incorrect Parameters fed to Model: {}", s),
            ModelError::UnknownNode(s) => write!(f, "Unknown node: {}", s),
            ModelError::FoldError(s) => write!(f, "Cannot fold layers: {}", s),
            ModelError::CapabilityError(s) => write!(f, "Invalid PIM unit attachment: {}", s),
            ModelError::UnsupportedFamily(s) => write!(f, "Unsupported network family: {}", s),
        }
    }
}

impl Error for ModelError {}
