use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire network engine.
pub type Result<T> = std::result::Result<T, NetError>;

/// Coarse classification of an engine failure. The HTTP boundary maps each
/// kind onto a response status without inspecting individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    TrainingTimeout,
    Internal,
}

/// The network engine's error type.
#[derive(Debug, Clone, PartialEq)]
pub enum NetError {
    BadTopology {
        reason: &'static str,
    },
    InsufficientData {
        got: usize,
        required: usize,
    },
    LengthMismatch {
        got: usize,
        expected: usize,
    },
    SnapshotMismatch {
        reason: String,
    },
    Timeout,
    NonFiniteLoss {
        epoch: usize,
    },
}

impl NetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetError::BadTopology { .. }
            | NetError::InsufficientData { .. }
            | NetError::LengthMismatch { .. }
            | NetError::SnapshotMismatch { .. } => ErrorKind::InvalidInput,
            NetError::Timeout => ErrorKind::TrainingTimeout,
            NetError::NonFiniteLoss { .. } => ErrorKind::Internal,
        }
    }
}

impl Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetError::BadTopology { reason } => format!("invalid topology: {reason}"),
            NetError::InsufficientData { got, required } => format!(
                "insufficient data: got {got} ticks, training needs at least {required}"
            ),
            NetError::LengthMismatch { got, expected } => {
                format!("input length {got} does not match the expected {expected}")
            }
            NetError::SnapshotMismatch { reason } => {
                format!("model snapshot is inconsistent: {reason}")
            }
            NetError::Timeout => "training exceeded its time budget".to_string(),
            NetError::NonFiniteLoss { epoch } => {
                format!("training diverged at epoch {epoch}: loss is not finite")
            }
        };

        write!(f, "{s}")
    }
}

impl Error for NetError {}
