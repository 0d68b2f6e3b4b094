//! Sequencer batch items and the delayed-message stream.
//!
//! The authoritative inbox is the batch-item stream, keyed by
//! `last_sequence_number`. Each item extends the accumulator chain and
//! carries either exactly one sequencer message or a contiguous range of
//! delayed messages (the range between the predecessor's
//! `total_delayed_count` and its own), never both. Delayed messages live in
//! their own stream with a parallel accumulator so a range commitment can be
//! computed without replaying every message.

use avmcore_error::{CoreError, Result};
use avmcore_kv::{Column, ReadView, WriteTx};
use avmcore_machine::InboxState;
use avmcore_types::codec::{put_h256, put_u256, take_h256, take_u256, take_u8, u256_be};
use avmcore_types::{H256, U256};
use keccak_hash::keccak;

/// Kind byte for an item extending the chain with a sequencer message.
const ACC_KIND_SEQUENCER: u8 = 0;
/// Kind byte for an item extending the chain with delayed messages.
const ACC_KIND_DELAYED: u8 = 1;

/// One entry of the batch-item stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerBatchItem {
    /// Sequence number of the last message this item covers.
    pub last_sequence_number: U256,
    /// Inbox accumulator after this item.
    pub accumulator: H256,
    /// Total delayed messages consumed by the chain up to and including
    /// this item.
    pub total_delayed_count: U256,
    /// The sequencer message, absent for a delayed-range item.
    pub sequencer_message: Option<Vec<u8>>,
}

impl SequencerBatchItem {
    /// Record body: `accumulator || be32(total_delayed_count) || flag [|| msg]`.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(65 + self.sequencer_message.as_ref().map_or(0, Vec::len));
        put_h256(&mut buf, &self.accumulator);
        put_u256(&mut buf, &self.total_delayed_count);
        match &self.sequencer_message {
            Some(message) => {
                buf.push(1);
                buf.extend_from_slice(message);
            }
            None => buf.push(0),
        }
        buf
    }

    pub fn unmarshal(last_sequence_number: U256, mut body: &[u8]) -> Result<Self> {
        let accumulator = take_h256(&mut body)?;
        let total_delayed_count = take_u256(&mut body)?;
        let sequencer_message = match take_u8(&mut body)? {
            0 if body.is_empty() => None,
            0 => {
                return Err(CoreError::corruption(
                    "delayed-range batch item has trailing message bytes",
                ))
            }
            1 => Some(body.to_vec()),
            other => {
                return Err(CoreError::corruption(format!(
                    "invalid batch item flag byte {other}"
                )))
            }
        };
        Ok(Self {
            last_sequence_number,
            accumulator,
            total_delayed_count,
            sequencer_message,
        })
    }
}

/// One entry of the delayed-message stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedMessage {
    pub index: U256,
    /// Delayed accumulator up to and including this message.
    pub delayed_acc: H256,
    pub message: Vec<u8>,
}

impl DelayedMessage {
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.message.len());
        put_h256(&mut buf, &self.delayed_acc);
        buf.extend_from_slice(&self.message);
        buf
    }

    pub fn unmarshal(index: U256, mut body: &[u8]) -> Result<Self> {
        let delayed_acc = take_h256(&mut body)?;
        Ok(Self {
            index,
            delayed_acc,
            message: body.to_vec(),
        })
    }
}

/// A message read back out of the inbox, paired with the accumulator of the
/// batch item that covers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessageAndAcc {
    pub message: Vec<u8>,
    pub accumulator: H256,
}

// ---------------------------------------------------------------------------
// Delivery envelope
// ---------------------------------------------------------------------------

/// Envelope kind byte: the payload is a sequencer message.
pub const MSG_KIND_SEQUENCER: u8 = 0;
/// Envelope kind byte: the payload is a delayed message.
pub const MSG_KIND_DELAYED: u8 = 1;

/// Wrap a payload as a sequencer message for `deliver_messages`.
#[must_use]
pub fn sequencer_envelope(payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(1 + payload.len());
    raw.push(MSG_KIND_SEQUENCER);
    raw.extend_from_slice(payload);
    raw
}

/// Wrap a payload as a delayed message for `deliver_messages`.
#[must_use]
pub fn delayed_envelope(payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(1 + payload.len());
    raw.push(MSG_KIND_DELAYED);
    raw.extend_from_slice(payload);
    raw
}

/// Split a delivered message into its kind byte and payload.
pub fn parse_envelope(raw: &[u8]) -> Result<(u8, &[u8])> {
    match raw.split_first() {
        Some((kind @ (&MSG_KIND_SEQUENCER | &MSG_KIND_DELAYED), payload)) => Ok((*kind, payload)),
        Some((kind, _)) => Err(CoreError::InvalidArgument(format!(
            "unknown inbox message kind {kind:#04x}"
        ))),
        None => Err(CoreError::InvalidArgument(
            "empty inbox message".to_string(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Accumulator chain
// ---------------------------------------------------------------------------

/// Chain extension for a sequencer-message item.
#[must_use]
pub fn sequencer_item_acc(prev_acc: H256, message: &[u8]) -> H256 {
    let mut buf = Vec::with_capacity(66);
    put_h256(&mut buf, &prev_acc);
    buf.push(ACC_KIND_SEQUENCER);
    put_h256(&mut buf, &keccak(message));
    keccak(&buf)
}

/// Chain extension for a delayed-range item covering everything up to
/// `total_delayed_count` (exclusive), committed by `delayed_acc`.
#[must_use]
pub fn delayed_item_acc(prev_acc: H256, total_delayed_count: &U256, delayed_acc: H256) -> H256 {
    let mut buf = Vec::with_capacity(98);
    put_h256(&mut buf, &prev_acc);
    buf.push(ACC_KIND_DELAYED);
    put_u256(&mut buf, total_delayed_count);
    put_h256(&mut buf, &delayed_acc);
    keccak(&buf)
}

/// Delayed-stream accumulator after appending `message`.
#[must_use]
pub fn next_delayed_acc(prev_delayed_acc: H256, message: &[u8]) -> H256 {
    let mut buf = Vec::with_capacity(64);
    put_h256(&mut buf, &prev_delayed_acc);
    put_h256(&mut buf, &keccak(message));
    keccak(&buf)
}

// ---------------------------------------------------------------------------
// Storage operations
// ---------------------------------------------------------------------------

pub fn put_batch_item(tx: &mut WriteTx<'_>, item: &SequencerBatchItem) {
    tx.put(
        Column::SequencerBatchItem,
        u256_be(&item.last_sequence_number).to_vec(),
        item.marshal(),
    );
}

pub fn put_delayed_message(tx: &mut WriteTx<'_>, message: &DelayedMessage) {
    tx.put(
        Column::DelayedMessage,
        u256_be(&message.index).to_vec(),
        message.marshal(),
    );
}

/// First batch item with `last_sequence_number >= seq`, i.e. the item
/// covering message `seq`. `NotFound` past the end of the stream.
pub fn next_batch_item(view: &impl ReadView, seq: &U256) -> Result<SequencerBatchItem> {
    let (key, body) = view
        .iter_from(Column::SequencerBatchItem, &u256_be(seq))
        .next()
        .ok_or(CoreError::NotFound)?;
    SequencerBatchItem::unmarshal(U256::from_big_endian(&key), &body)
}

/// The delayed message at `index`.
pub fn delayed_message(view: &impl ReadView, index: &U256) -> Result<DelayedMessage> {
    let body = view
        .get(Column::DelayedMessage, &u256_be(index))
        .ok_or(CoreError::NotFound)?;
    DelayedMessage::unmarshal(*index, &body)
}

/// Drop every batch item covering message `first_seq` or later. Returns the
/// surviving `total_delayed_count` so the caller can trim the delayed stream
/// to match.
pub fn delete_batch_items_from(tx: &mut WriteTx<'_>, first_seq: &U256) -> Result<U256> {
    let doomed: Vec<Vec<u8>> = tx
        .iter_from(Column::SequencerBatchItem, &u256_be(first_seq))
        .map(|(key, _)| key)
        .collect();
    for key in doomed {
        tx.delete(Column::SequencerBatchItem, key);
    }
    let surviving_delayed = match tx.last(Column::SequencerBatchItem) {
        Some((key, body)) => {
            SequencerBatchItem::unmarshal(U256::from_big_endian(&key), &body)?.total_delayed_count
        }
        None => U256::zero(),
    };

    let delayed_doomed: Vec<Vec<u8>> = tx
        .iter_from(Column::DelayedMessage, &u256_be(&surviving_delayed))
        .map(|(key, _)| key)
        .collect();
    for key in delayed_doomed {
        tx.delete(Column::DelayedMessage, key);
    }
    Ok(surviving_delayed)
}

/// Check that `inbox` matches the stored chain: the item covering its last
/// consumed message must carry the accumulator the machine recorded.
#[must_use]
pub fn is_valid(view: &impl ReadView, inbox: &InboxState) -> bool {
    if inbox.count.is_zero() {
        return true;
    }
    match next_batch_item(view, &(inbox.count - U256::one())) {
        Ok(item) => item.accumulator == inbox.accumulator,
        Err(_) => false,
    }
}

/// Read up to `count` messages starting at sequence number `index`.
///
/// When `index > 0` the item covering `index - 1` is fetched first and, when
/// `expected_prev_acc` is supplied, its accumulator must match. A mismatch
/// (or a missing predecessor) is `NotFound`, the signal that a reorg removed
/// the prefix the caller was standing on. The walk then emits each item's
/// sequencer message or delayed slice until `count` messages are produced or
/// the stream ends.
pub fn read_messages(
    view: &impl ReadView,
    index: &U256,
    count: usize,
    expected_prev_acc: Option<H256>,
) -> Result<Vec<RawMessageAndAcc>> {
    let mut messages = Vec::new();
    let mut needs_consistency_check = false;
    let mut start = *index;
    if *index > U256::zero() {
        start = *index - U256::one();
        needs_consistency_check = true;
    }

    let mut prev_delayed_count = U256::zero();
    for (key, body) in view.iter_from(Column::SequencerBatchItem, &u256_be(&start)) {
        let item = SequencerBatchItem::unmarshal(U256::from_big_endian(&key), &body)?;

        if needs_consistency_check {
            if let Some(expected) = expected_prev_acc {
                if item.accumulator != expected {
                    return Err(CoreError::NotFound);
                }
            }
            needs_consistency_check = false;
            if count == 0 {
                break;
            }
            prev_delayed_count = item.total_delayed_count;
            if item.last_sequence_number >= *index {
                // Restarting mid delayed batch: the predecessor item covers
                // our start index, so offset the delayed position by the
                // distance to the end of the batch.
                if item.sequencer_message.is_some() {
                    return Err(CoreError::corruption(
                        "sequencer-message batch item covers more than one message",
                    ));
                }
                prev_delayed_count -= item.last_sequence_number + U256::one() - *index;
            } else {
                if item.last_sequence_number + U256::one() != *index {
                    return Err(CoreError::corruption(format!(
                        "batch item covering message {} has last sequence number {}",
                        *index - U256::one(),
                        item.last_sequence_number
                    )));
                }
                continue;
            }
        }

        if let Some(message) = &item.sequencer_message {
            if prev_delayed_count != item.total_delayed_count {
                return Err(CoreError::corruption(
                    "batch item carries both a sequencer message and delayed messages",
                ));
            }
            messages.push(RawMessageAndAcc {
                message: message.clone(),
                accumulator: item.accumulator,
            });
        } else if item.total_delayed_count > prev_delayed_count {
            while prev_delayed_count < item.total_delayed_count && messages.len() < count {
                let delayed = delayed_message(view, &prev_delayed_count).map_err(|err| {
                    if err.is_not_found() {
                        CoreError::corruption(format!(
                            "batch item references missing delayed message {prev_delayed_count}"
                        ))
                    } else {
                        err
                    }
                })?;
                messages.push(RawMessageAndAcc {
                    message: delayed.message,
                    accumulator: item.accumulator,
                });
                prev_delayed_count += U256::one();
            }
        } else {
            return Err(CoreError::corruption(format!(
                "batch item {} covers no messages",
                item.last_sequence_number
            )));
        }

        if messages.len() >= count {
            break;
        }
        prev_delayed_count = item.total_delayed_count;
    }

    if needs_consistency_check {
        // The predecessor item does not exist: the requested start is past
        // the stream tip or the prefix was reorged away.
        return Err(CoreError::NotFound);
    }
    Ok(messages)
}

/// Number of messages in the inbox: one past the last covered sequence
/// number, zero for an empty stream.
pub fn message_count(view: &impl ReadView) -> Result<U256> {
    match view.last(Column::SequencerBatchItem) {
        Some((key, _)) => Ok(U256::from_big_endian(&key) + U256::one()),
        None => Ok(U256::zero()),
    }
}
