//! Change records: one captured before-state each

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::FieldCodec;
use crate::error::{SnapshotError, TransactionError};
use crate::object::{ArraySlot, ObjectKey, ObjectRef, WeakRef};
use crate::snapshot::{PendingRestore, Snapshot, SnapshotReader, SnapshotWriter};

/// What happened to an array range after it was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArrayOp {
    /// The range was just added; restoring removes it
    Insert,
    /// The range is about to be removed; restoring puts it back
    Remove,
    /// The range is about to be overwritten
    Modify,
}

impl ArrayOp {
    /// The operation that undoes this one
    pub fn inverse(self) -> Self {
        match self {
            ArrayOp::Insert => ArrayOp::Remove,
            ArrayOp::Remove => ArrayOp::Insert,
            ArrayOp::Modify => ArrayOp::Modify,
        }
    }
}

/// Descriptor of one captured array region.
#[derive(Clone)]
pub struct ArrayRange {
    pub slot: ArraySlot,
    pub index: usize,
    pub count: usize,
    pub op: ArrayOp,
    pub codec: Arc<dyn FieldCodec>,
}

impl ArrayRange {
    pub fn new(
        slot: ArraySlot,
        index: usize,
        count: usize,
        op: ArrayOp,
        codec: Arc<dyn FieldCodec>,
    ) -> Self {
        Self {
            slot,
            index,
            count,
            op,
            codec,
        }
    }

    /// In-memory size of one element
    pub fn element_size(&self) -> usize {
        self.codec.element_size()
    }
}

impl fmt::Debug for ArrayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayRange")
            .field("slot", &self.slot)
            .field("index", &self.index)
            .field("count", &self.count)
            .field("op", &self.op)
            .field("element_size", &self.element_size())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum RecordKind {
    Object,
    Array(ArrayRange),
}

/// One captured diff: a whole object or a single array slice.
#[derive(Debug)]
pub struct ChangeRecord {
    target: WeakRef,
    key: ObjectKey,
    snapshot: Snapshot,
    kind: RecordKind,
    pub(crate) restored: bool,
}

impl ChangeRecord {
    /// Snapshot the whole object through its own serializer
    pub(crate) fn capture_object(target: &ObjectRef) -> Self {
        let mut writer = SnapshotWriter::new();
        target.read().serialize(&mut writer);

        Self {
            target: Arc::downgrade(target),
            key: ObjectKey::of(target),
            snapshot: writer.finish(),
            kind: RecordKind::Object,
            restored: false,
        }
    }

    /// Snapshot one region of `array`, an array field of `owner`
    pub(crate) fn capture_array(
        owner: &ObjectRef,
        array: &dyn Any,
        range: ArrayRange,
    ) -> Result<Self, TransactionError> {
        let len = range
            .codec
            .len(array)
            .ok_or(TransactionError::CodecMismatch(range.slot))?;
        if range.index.checked_add(range.count).map_or(true, |end| end > len) {
            return Err(TransactionError::SliceOutOfBounds {
                index: range.index,
                count: range.count,
                len,
            });
        }

        let mut writer = SnapshotWriter::new();
        if range.op != ArrayOp::Insert {
            range
                .codec
                .save(array, range.index, range.count, &mut writer)?;
        }

        Ok(Self {
            target: Arc::downgrade(owner),
            key: ObjectKey::of(owner),
            snapshot: writer.finish(),
            kind: RecordKind::Array(range),
            restored: false,
        })
    }

    /// The diffed object, if it is still alive
    pub fn target(&self) -> Option<ObjectRef> {
        self.target.upgrade()
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, RecordKind::Array(_))
    }

    /// Array descriptor, for array-slice records
    pub fn array_range(&self) -> Option<&ArrayRange> {
        match &self.kind {
            RecordKind::Array(range) => Some(range),
            RecordKind::Object => None,
        }
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.snapshot.len()
    }

    pub(crate) fn key(&self) -> ObjectKey {
        self.key
    }

    pub(crate) fn detach(&mut self) -> (Snapshot, RecordKind) {
        (std::mem::take(&mut self.snapshot), self.kind.clone())
    }

    pub(crate) fn reattach(&mut self, snapshot: Snapshot, kind: RecordKind) {
        self.snapshot = snapshot;
        self.kind = kind;
    }

    pub(crate) fn put_back(&mut self, snapshot: Snapshot) {
        self.snapshot = snapshot;
    }
}

/// Restore a detached record into its target.
///
/// With `flip`, the current state is captured first and returned so the
/// record can replay in the opposite direction next time; `kind` is then
/// inverted in place.
pub(crate) fn replay(
    target: &ObjectRef,
    kind: &mut RecordKind,
    snapshot: &Snapshot,
    flip: bool,
    pending: &mut dyn PendingRestore,
) -> Result<Option<Snapshot>, SnapshotError> {
    let mut state = target.write();

    match kind {
        RecordKind::Object => {
            let current = flip.then(|| {
                let mut writer = SnapshotWriter::new();
                state.serialize(&mut writer);
                writer.finish()
            });
            state.deserialize(&mut SnapshotReader::with_pending(snapshot, pending))?;
            Ok(current)
        }
        RecordKind::Array(range) => {
            let array = state
                .array_slot_mut(range.slot)
                .ok_or(SnapshotError::MissingArraySlot(range.slot))?;
            let mut current = SnapshotWriter::new();

            match range.op {
                ArrayOp::Insert => {
                    if flip {
                        range
                            .codec
                            .save(&*array, range.index, range.count, &mut current)?;
                    }
                    range.codec.remove(array, range.index, range.count)?;
                }
                ArrayOp::Remove => {
                    let mut reader = SnapshotReader::with_pending(snapshot, pending);
                    range
                        .codec
                        .insert(array, range.index, range.count, &mut reader)?;
                }
                ArrayOp::Modify => {
                    if flip {
                        range
                            .codec
                            .save(&*array, range.index, range.count, &mut current)?;
                    }
                    let mut reader = SnapshotReader::with_pending(snapshot, pending);
                    range
                        .codec
                        .overwrite(array, range.index, range.count, &mut reader)?;
                }
            }

            if flip {
                range.op = range.op.inverse();
                Ok(Some(current.finish()))
            } else {
                Ok(None)
            }
        }
    }
}
