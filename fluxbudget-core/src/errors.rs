use crate::field::Dim;
use thiserror::Error;

/// Error type for invalid budget operations.
#[derive(Error, Debug)]
pub enum BudgetError {
    /// Invalid run or budget-method configuration. Always fatal.
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Required input field '{name}' is not available")]
    MissingInput { name: String },
    #[error("Dimension {dim} has length {left} on one side and {right} on the other")]
    ShapeMismatch { dim: Dim, left: usize, right: usize },
    #[error("Coordinates of dimension {dim} do not match exactly")]
    CoordinateMismatch { dim: Dim },
    #[error("Dimension {dim} is not present")]
    MissingDimension { dim: Dim },
    #[error("Dimension {dim} is already present")]
    DuplicateDimension { dim: Dim },
    #[error("Invalid field: {0}")]
    InvalidField(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Worker {worker} failed: {message}")]
    Worker { worker: usize, message: String },
}

impl BudgetError {
    pub fn missing(name: impl Into<String>) -> Self {
        BudgetError::MissingInput { name: name.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        BudgetError::Config(message.into())
    }
}

impl From<serde_json::Error> for BudgetError {
    fn from(e: serde_json::Error) -> Self {
        BudgetError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for BudgetError {
    fn from(e: toml::de::Error) -> Self {
        BudgetError::Config(e.to_string())
    }
}

/// Convenience type for `Result<T, BudgetError>`.
pub type BudgetResult<T> = Result<T, BudgetError>;
