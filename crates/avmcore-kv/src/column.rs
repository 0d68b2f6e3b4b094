use std::fmt;

/// The column families used by the execution core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    /// Single-key counters and cursor positions.
    State,
    /// `be32(arb_gas_used)` → serialized machine state keys.
    Checkpoint,
    /// `be32(log_index)` → 32-byte value hash.
    Log,
    /// `be32(send_index)` → raw send bytes.
    Send,
    /// `be32(last_sequence_number)` → serialized sequencer batch item.
    SequencerBatchItem,
    /// `be32(delayed_index)` → serialized delayed message.
    DelayedMessage,
    /// `be32(block_number)` → `be32(arb_gas_used)` sideload position.
    Sideload,
    /// 32-byte value hash → refcounted shallow value body.
    Value,
    /// `be8(segment_id)` → serialized code segment (plus the id counter).
    Code,
}

impl Column {
    /// Every column family, in storage order.
    pub const ALL: [Self; 9] = [
        Self::State,
        Self::Checkpoint,
        Self::Log,
        Self::Send,
        Self::SequencerBatchItem,
        Self::DelayedMessage,
        Self::Sideload,
        Self::Value,
        Self::Code,
    ];

    /// Number of column families.
    pub const COUNT: usize = Self::ALL.len();

    /// Dense index of this family.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The family's storage name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::Checkpoint => "checkpoint",
            Self::Log => "log",
            Self::Send => "send",
            Self::SequencerBatchItem => "sequencer_batch_item",
            Self::DelayedMessage => "delayed_message",
            Self::Sideload => "sideload",
            Self::Value => "value",
            Self::Code => "code",
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_dense_and_stable() {
        for (i, col) in Column::ALL.iter().enumerate() {
            assert_eq!(col.index(), i);
        }
        assert_eq!(Column::COUNT, 9);
    }

    #[test]
    fn names_are_unique() {
        let mut names: Vec<_> = Column::ALL.iter().map(|c| c.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Column::COUNT);
    }
}
