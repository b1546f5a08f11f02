//! Error enum for [`super::Tensor`] and its related operations

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

#[derive(Debug, Clone, PartialEq)]
pub enum TensorError {
    /// The parameters to an operation were incorrect, e.g. an axis out of bounds.
    ParameterError(String),
    /// Two operands (or an operand and its expected layout) do not agree on shape.
    ShapeMismatch(String),
}

impl Display for TensorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TensorError::ParameterError(s) => {
                write!(f, "Parameters to Tensor method were incorrect: {}", s)
            }
            TensorError::ShapeMismatch(s) => {
                write!(f, "Tensor shapes are incompatible: {}", s)
            }
        }
    }
}

impl Error for TensorError {}
