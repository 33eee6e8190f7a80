use thiserror::Error;

/// Errors raised when parsing a flattened component identity string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentError {
    #[error("missing '/' separator in component identity '{0}'")]
    MissingSeparator(String),

    #[error("empty package or class in component identity '{0}'")]
    EmptyPart(String),
}
