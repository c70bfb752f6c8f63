//! Transaction error types

use thiserror::Error;

use crate::object::ArraySlot;

/// Errors surfaced by the transaction buffer and its capture API.
///
/// The `Display` text of the undo/redo variants is the reason shown to the
/// user when the corresponding affordance is disabled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransactionError {
    /// Undo requested while a transaction is being captured
    #[error("can't undo during a transaction")]
    UndoDuringTransaction,

    /// Redo requested while a transaction is being captured
    #[error("can't redo during a transaction")]
    RedoDuringTransaction,

    /// Undo history was wiped
    #[error("can't undo after {0}")]
    UndoAfterReset(String),

    /// Nothing to undo
    #[error("nothing to undo")]
    NothingToUndo,

    /// Nothing to redo
    #[error("nothing to redo")]
    NothingToRedo,

    /// Capture attempted with no open transaction
    #[error("no transaction is being captured")]
    NotCapturing,

    /// Capture attempted on a transaction that has already ended
    #[error("transaction is sealed")]
    Sealed,

    /// Array slice outside the array's current bounds
    #[error("slice of {count} at {index} out of bounds for array of length {len}")]
    SliceOutOfBounds {
        index: usize,
        count: usize,
        len: usize,
    },

    /// Codec element type does not match the array handed to it
    #[error("codec does not match the element type of array slot {0}")]
    CodecMismatch(ArraySlot),

    /// The owner of a transactional array has been dropped
    #[error("array owner has been dropped")]
    DanglingOwner,

    /// Snapshot encode/decode failure
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Errors raised while reading a snapshot back into live objects.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SnapshotError {
    /// Payload ended early
    #[error("unexpected end of snapshot: needed {needed} bytes, {remaining} left")]
    UnexpectedEof { needed: usize, remaining: usize },

    /// Object index past the end of the reference table
    #[error("object index {index} out of range ({len} referenced objects)")]
    BadObjectIndex { index: u32, len: usize },

    /// Name index past the end of the name table
    #[error("name index {index} out of range ({len} referenced names)")]
    BadNameIndex { index: u32, len: usize },

    /// String payload is not UTF-8
    #[error("invalid UTF-8 in snapshot string")]
    InvalidUtf8,

    /// The object a record targets was dropped before the record replayed
    #[error("target object has been dropped")]
    DanglingReference,

    /// The target object exposes no array at the recorded slot
    #[error("object has no array at slot {0}")]
    MissingArraySlot(ArraySlot),

    /// Array element type differs from the codec's
    #[error("array does not match its codec")]
    TypeMismatch,

    /// Recorded range no longer fits the array
    #[error("range of {count} at {index} out of bounds for array of length {len}")]
    RangeOutOfBounds {
        index: usize,
        count: usize,
        len: usize,
    },
}
