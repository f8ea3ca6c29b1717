use thiserror::Error;

/// Errors produced by model construction, fitting and file I/O.
///
/// `InvalidArgument` and `ShapeMismatch` are the "value error" kinds: the caller
/// supplied inputs the model cannot accept. Each variant also carries the exit
/// code the `ivim` binary reports for it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IvimError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("shape mismatch for {what}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("fit failed: {0}")]
    Fit(String),
    #[error("{0}")]
    Io(String),
}

impl IvimError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    /// True for errors caused by unacceptable caller input.
    pub fn is_value_error(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::ShapeMismatch { .. })
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidArgument(_) | Self::Io(_) => 2,
            Self::ShapeMismatch { .. } => 3,
            Self::Fit(_) => 4,
        }
    }
}

pub type Result<T> = std::result::Result<T, IvimError>;
