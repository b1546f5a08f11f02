use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum ParamError {
    #[error("{path}:{line}: {msg}")]
    Ini {
        path: PathBuf,
        line: usize,
        msg: String,
    },
    #[error("missing section [{0}]")]
    MissingSection(String),
    #[error("missing option {key} in section [{section}]")]
    MissingOption { section: String, key: String },
    #[error("syntax error in {expr:?} at offset {pos}: {msg}")]
    Syntax {
        expr: String,
        pos: usize,
        msg: String,
    },
    #[error("name {0:?} is not defined")]
    UnknownName(String),
    #[error("ZeroDivisionError: {0}")]
    ZeroDivision(&'static str),
    #[error("math domain error in {0}")]
    Domain(String),
    #[error("integer overflow in {0}")]
    Overflow(&'static str),
    #[error("TypeError: {0}")]
    Type(String),
    #[error("evaluating {key}: {source}")]
    Eval {
        key: String,
        #[source]
        source: Box<ParamError>,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
