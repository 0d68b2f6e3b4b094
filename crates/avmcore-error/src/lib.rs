use thiserror::Error;

/// Primary error type for the execution core.
///
/// The taxonomy is deliberately small: missing keys are routine (`NotFound`),
/// inbox mismatches are recoverable by the client (`NeedOlder`), exhausted
/// reorg retries surface as `Busy`, and anything that contradicts a stored
/// invariant is `Corruption` and fatal for the affected operation.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A requested key does not exist. Never fatal; callers decide whether
    /// absence is an error at their level.
    #[error("not found")]
    NotFound,

    /// Message delivery referenced an inbox accumulator that no longer
    /// matches the stored chain. The client must resend older messages.
    #[error("previous inbox accumulator mismatch, need older messages")]
    NeedOlder,

    /// An operation exhausted its reorg retry budget.
    #[error("reorg retry budget exhausted")]
    Busy,

    /// A stored invariant does not hold.
    #[error("corruption: {0}")]
    Corruption(String),

    /// A value had the wrong kind for the requested access.
    #[error("bad pop type: expected {expected}, got {actual}")]
    BadPopType {
        expected: &'static str,
        actual: &'static str,
    },

    /// A tuple index was out of range.
    #[error("bad tuple index: {index} (size {size})")]
    BadTupleIndex { index: usize, size: usize },

    /// An integer did not fit the requested narrower width.
    #[error("integer out of bounds")]
    IntOutOfBounds,

    /// A caller-supplied argument was out of range or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A serialized record ended before its declared contents.
    #[error("short buffer: needed {needed} more bytes, {remaining} remaining")]
    ShortBuffer { needed: usize, remaining: usize },

    /// A serialized value carried a tag outside the known set.
    #[error("unknown value tag: {0:#04x}")]
    UnknownValueTag(u8),

    /// Underlying key-value store failure, surfaced verbatim.
    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    /// Returns true for `NotFound`, the one error routinely treated as a
    /// non-error by lookup paths.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Build a `Corruption` error from anything displayable.
    pub fn corruption(detail: impl Into<String>) -> Self {
        Self::Corruption(detail.into())
    }
}

/// Workspace-wide result alias.
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_predicate() {
        assert!(CoreError::NotFound.is_not_found());
        assert!(!CoreError::Busy.is_not_found());
    }

    #[test]
    fn display_messages() {
        assert_eq!(CoreError::NotFound.to_string(), "not found");
        assert_eq!(
            CoreError::BadTupleIndex { index: 9, size: 3 }.to_string(),
            "bad tuple index: 9 (size 3)"
        );
        assert_eq!(
            CoreError::UnknownValueTag(0x2a).to_string(),
            "unknown value tag: 0x2a"
        );
        assert_eq!(
            CoreError::corruption("checkpoint inbox state mismatch").to_string(),
            "corruption: checkpoint inbox state mismatch"
        );
    }
}
