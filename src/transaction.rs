//! Transactions: ordered groups of change records and their replay

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{SnapshotError, TransactionError};
use crate::object::{ObjectKey, ObjectRef};
use crate::record::{self, ArrayRange, ChangeRecord};
use crate::snapshot::PendingRestore;

/// Unique identifier of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Order in which the next [`Transaction::apply`] visits records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Capture order (redo)
    Forward,
    /// Reverse capture order (undo)
    Backward,
}

impl Direction {
    pub fn reversed(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }

    /// `+1` forward, `-1` backward
    pub fn sign(self) -> i32 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

/// Listing entry for a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub id: TransactionId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub record_count: usize,
    pub size_bytes: usize,
    pub direction: Direction,
}

/// One atomic, undoable group of captured diffs.
pub struct Transaction {
    id: TransactionId,
    title: String,
    created_at: DateTime<Utc>,
    records: Vec<ChangeRecord>,
    /// Whole-object saves per object; live only while capturing
    object_saves: HashMap<ObjectKey, usize>,
    direction: Direction,
    flip: bool,
    sealed: bool,
}

impl Transaction {
    /// Create an open transaction.
    ///
    /// With `flip`, every [`apply`](Self::apply) swaps the current state into
    /// the records, so alternate applies undo and redo. Without it, apply
    /// always restores the captured state (a one-shot rollback).
    pub fn new(title: impl Into<String>, flip: bool) -> Self {
        Self {
            id: TransactionId::new(),
            title: title.into(),
            created_at: Utc::now(),
            records: Vec::new(),
            object_saves: HashMap::new(),
            direction: Direction::Backward,
            flip,
            sealed: false,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Direction of the next apply
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_flipping(&self) -> bool {
        self.flip
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total payload bytes held by this transaction
    pub fn footprint(&self) -> usize {
        self.records.iter().map(ChangeRecord::size).sum()
    }

    /// Capture the whole object unless it was already captured here.
    ///
    /// Returns whether a new record was appended. Must not be called while
    /// the caller holds the object's write lock.
    pub fn save_object(&mut self, object: &ObjectRef) -> Result<bool, TransactionError> {
        if self.sealed {
            return Err(TransactionError::Sealed);
        }
        if !object.is_transactional() {
            return Ok(false);
        }

        let key = ObjectKey::of(object);
        if let Some(saves) = self.object_saves.get_mut(&key) {
            *saves += 1;
            return Ok(false);
        }

        let record = ChangeRecord::capture_object(object);
        debug!(
            transaction = %self.title,
            size = record.size(),
            "Captured object"
        );
        self.records.push(record);
        self.object_saves.insert(key, 1);
        Ok(true)
    }

    /// Capture one region of `array`, an array field of `owner`.
    ///
    /// Array captures are never deduplicated. Returns whether a record was
    /// appended.
    pub fn save_array(
        &mut self,
        owner: &ObjectRef,
        array: &dyn Any,
        range: ArrayRange,
    ) -> Result<bool, TransactionError> {
        if self.sealed {
            return Err(TransactionError::Sealed);
        }
        if !owner.is_transactional() {
            return Ok(false);
        }

        let record = ChangeRecord::capture_array(owner, array, range)?;
        debug!(
            transaction = %self.title,
            range = ?record.array_range(),
            size = record.size(),
            "Captured array slice"
        );
        self.records.push(record);
        Ok(true)
    }

    /// How many times `object` was saved whole while this transaction was open
    pub fn save_count(&self, object: &ObjectRef) -> usize {
        self.object_saves
            .get(&ObjectKey::of(object))
            .copied()
            .unwrap_or(0)
    }

    /// Number of records targeting `object`
    pub fn records_for(&self, object: &ObjectRef) -> usize {
        let key = ObjectKey::of(object);
        self.records.iter().filter(|r| r.key() == key).count()
    }

    pub fn summary(&self) -> TransactionSummary {
        TransactionSummary {
            id: self.id,
            title: self.title.clone(),
            created_at: self.created_at,
            record_count: self.records.len(),
            size_bytes: self.footprint(),
            direction: self.direction,
        }
    }

    /// Replay every record against the live objects, then reverse direction.
    pub fn apply(&mut self) {
        let order: Vec<usize> = match self.direction {
            Direction::Forward => (0..self.records.len()).collect(),
            Direction::Backward => (0..self.records.len()).rev().collect(),
        };

        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        let mut by_object: HashMap<ObjectKey, Vec<usize>> = HashMap::new();
        for &index in &order {
            let record = &self.records[index];
            by_object.entry(record.key()).or_default().push(index);
            if seen.insert(record.key()) {
                if let Some(target) = record.target() {
                    targets.push(target);
                }
            }
        }

        for target in &targets {
            target.write().pre_change();
        }

        let mut pass = ReplayPass {
            records: &mut self.records,
            by_object,
            active: HashSet::new(),
            flip: self.flip,
            title: &self.title,
        };
        for &index in &order {
            pass.restore(index);
        }

        for record in &mut self.records {
            record.restored = false;
        }

        for target in &targets {
            target.write().post_change();
        }

        debug!(
            transaction = %self.title,
            direction = self.direction.sign(),
            records = self.records.len(),
            objects = targets.len(),
            "Applied transaction"
        );
        self.direction = self.direction.reversed();
    }

    pub(crate) fn seal(&mut self) {
        self.sealed = true;
        self.object_saves.clear();
    }

    /// Drop records past `len`. Objects whose whole-object record survives
    /// keep their save counts; the rest can be captured afresh.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.records.truncate(len);
        let surviving: HashSet<ObjectKey> = self
            .records
            .iter()
            .filter(|r| !r.is_array())
            .map(ChangeRecord::key)
            .collect();
        self.object_saves.retain(|key, _| surviving.contains(key));
    }

    /// Every live object a record targets or its payload references
    pub(crate) fn visit_references(&self, visit: &mut dyn FnMut(&ObjectRef)) {
        for record in &self.records {
            if let Some(target) = record.target() {
                visit(&target);
            }
            for object in record.snapshot().referenced_objects() {
                visit(object);
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("records", &self.records.len())
            .field("direction", &self.direction)
            .field("sealed", &self.sealed)
            .finish()
    }
}

/// Stack left free before a forward-reference restore recurses
const RESTORE_RED_ZONE: usize = 64 * 1024;

/// Segment allocated when the red zone is reached
const RESTORE_STACK_GROWTH: usize = 1024 * 1024;

/// State of one apply: which records are done and which objects are
/// mid-restore (locked further up the stack).
struct ReplayPass<'t> {
    records: &'t mut [ChangeRecord],
    by_object: HashMap<ObjectKey, Vec<usize>>,
    active: HashSet<ObjectKey>,
    flip: bool,
    title: &'t str,
}

impl ReplayPass<'_> {
    fn restore(&mut self, index: usize) {
        let record = &mut self.records[index];
        if record.restored {
            return;
        }
        record.restored = true;

        let key = record.key();
        let target = record.target();
        let (snapshot, mut kind) = record.detach();
        let flip = self.flip;

        let outcome = match target {
            Some(target) => {
                self.active.insert(key);
                let outcome = record::replay(&target, &mut kind, &snapshot, flip, self);
                self.active.remove(&key);
                outcome
            }
            None => Err(SnapshotError::DanglingReference),
        };

        let record = &mut self.records[index];
        match outcome {
            Ok(Some(current)) => record.reattach(current, kind),
            Ok(None) => record.put_back(snapshot),
            Err(err) => {
                if cfg!(debug_assertions) {
                    panic!("failed to restore record {index} of '{}': {err}", self.title);
                }
                error!(transaction = %self.title, record = index, error = %err, "Failed to restore record");
                record.put_back(snapshot);
            }
        }
    }
}

impl PendingRestore for ReplayPass<'_> {
    fn restore_pending(&mut self, object: ObjectKey) {
        if self.active.contains(&object) {
            return;
        }
        let Some(indices) = self.by_object.get(&object).cloned() else {
            return;
        };
        // Reference chains recurse once per object
        for index in indices {
            stacker::maybe_grow(RESTORE_RED_ZONE, RESTORE_STACK_GROWTH, || self.restore(index));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::VecCodec;
    use crate::error::SnapshotError;
    use crate::object::{ArraySlot, ObjectCell, Transactional};
    use crate::record::ArrayOp;
    use crate::snapshot::{SnapshotReader, SnapshotWriter};
    use std::sync::Arc;

    const ITEMS: ArraySlot = ArraySlot(1);

    #[derive(Default)]
    struct Thing {
        value: i64,
        items: Vec<i64>,
        pre: usize,
        post: usize,
    }

    impl Transactional for Thing {
        fn serialize(&self, writer: &mut SnapshotWriter) {
            writer.write_i64(self.value);
        }

        fn deserialize(&mut self, reader: &mut SnapshotReader<'_>) -> Result<(), SnapshotError> {
            self.value = reader.read_i64()?;
            Ok(())
        }

        fn pre_change(&mut self) {
            self.pre += 1;
        }

        fn post_change(&mut self) {
            self.post += 1;
        }

        fn array_slot_mut(&mut self, slot: ArraySlot) -> Option<&mut dyn Any> {
            (slot == ITEMS).then_some(&mut self.items as &mut dyn Any)
        }
    }

    fn thing(value: i64) -> Arc<ObjectCell<Thing>> {
        ObjectCell::new(Thing {
            value,
            ..Default::default()
        })
    }

    fn items_range(index: usize, count: usize, op: ArrayOp) -> ArrayRange {
        ArrayRange::new(ITEMS, index, count, op, VecCodec::<i64>::shared())
    }

    // === Capture Tests ===

    #[test]
    fn test_new_transaction() {
        let transaction = Transaction::new("Move", true);
        assert_eq!(transaction.title(), "Move");
        assert!(transaction.is_empty());
        assert_eq!(transaction.direction(), Direction::Backward);
        assert_eq!(transaction.footprint(), 0);
    }

    #[test]
    fn test_save_object_dedup() {
        let object = thing(1);
        let handle: ObjectRef = object.clone();
        let mut transaction = Transaction::new("Edit", true);

        assert!(transaction.save_object(&handle).unwrap());
        assert!(!transaction.save_object(&handle).unwrap());
        assert!(!transaction.save_object(&handle).unwrap());

        assert_eq!(transaction.len(), 1);
        assert_eq!(transaction.records_for(&handle), 1);
        assert_eq!(transaction.save_count(&handle), 3);
    }

    #[test]
    fn test_array_saves_not_deduplicated() {
        let object = thing(0);
        let handle: ObjectRef = object.clone();
        let items = vec![1_i64, 2, 3];
        let mut transaction = Transaction::new("Edit", true);

        transaction
            .save_array(&handle, &items, items_range(0, 1, ArrayOp::Modify))
            .unwrap();
        transaction
            .save_array(&handle, &items, items_range(0, 1, ArrayOp::Modify))
            .unwrap();

        assert_eq!(transaction.records_for(&handle), 2);
        assert_eq!(transaction.footprint(), 16);
    }

    #[test]
    fn test_non_transactional_skipped() {
        let object = thing(0);
        object.set_transactional(false);
        let handle: ObjectRef = object.clone();
        let mut transaction = Transaction::new("Edit", true);

        assert!(!transaction.save_object(&handle).unwrap());
        assert!(!transaction
            .save_array(&handle, &vec![1_i64], items_range(0, 1, ArrayOp::Remove))
            .unwrap());
        assert!(transaction.is_empty());
    }

    #[test]
    fn test_sealed_rejects_capture() {
        let handle: ObjectRef = thing(0);
        let mut transaction = Transaction::new("Edit", true);
        transaction.seal();

        assert_eq!(transaction.save_object(&handle), Err(TransactionError::Sealed));
    }

    #[test]
    fn test_truncate_keeps_surviving_save_counts() {
        let a: ObjectRef = thing(1);
        let b: ObjectRef = thing(2);
        let mut transaction = Transaction::new("Edit", true);
        for _ in 0..3 {
            transaction.save_object(&a).unwrap();
        }
        transaction.save_object(&b).unwrap();

        transaction.truncate(1);

        assert_eq!(transaction.save_count(&a), 3);
        assert_eq!(transaction.save_count(&b), 0);
        assert!(transaction.save_object(&b).unwrap());
        assert_eq!(transaction.save_count(&b), 1);
    }

    // === Apply Tests ===

    #[test]
    fn test_apply_ping_pong() {
        let object = thing(1);
        let handle: ObjectRef = object.clone();
        let mut transaction = Transaction::new("Set", true);
        transaction.save_object(&handle).unwrap();
        object.write().value = 5;
        transaction.seal();

        transaction.apply();
        assert_eq!(object.read().value, 1);
        assert_eq!(transaction.direction(), Direction::Forward);

        transaction.apply();
        assert_eq!(object.read().value, 5);
        assert_eq!(transaction.direction(), Direction::Backward);
    }

    #[test]
    fn test_apply_without_flip_restores_captured_state() {
        let object = thing(1);
        let handle: ObjectRef = object.clone();
        let mut transaction = Transaction::new("Rollback", false);
        transaction.save_object(&handle).unwrap();
        object.write().value = 9;

        transaction.apply();
        assert_eq!(object.read().value, 1);

        object.write().value = 4;
        transaction.apply();
        assert_eq!(object.read().value, 1);
    }

    #[test]
    fn test_hooks_once_per_object() {
        let object = thing(0);
        let handle: ObjectRef = object.clone();
        let mut transaction = Transaction::new("Edit", true);
        transaction.save_object(&handle).unwrap();
        object.write().items.push(7);
        let items = object.read().items.clone();
        transaction
            .save_array(&handle, &items, items_range(0, 1, ArrayOp::Insert))
            .unwrap();

        transaction.apply();

        let state = object.read();
        assert_eq!(state.pre, 1);
        assert_eq!(state.post, 1);
        assert!(state.items.is_empty());
    }

    #[test]
    fn test_array_records_replay_in_reverse() {
        let object = thing(0);
        let handle: ObjectRef = object.clone();
        let mut transaction = Transaction::new("Edit", true);

        // insert 3 at the end, then overwrite index 0
        object.write().items.push(3);
        let items = object.read().items.clone();
        transaction
            .save_array(&handle, &items, items_range(0, 1, ArrayOp::Insert))
            .unwrap();
        let items = object.read().items.clone();
        transaction
            .save_array(&handle, &items, items_range(0, 1, ArrayOp::Modify))
            .unwrap();
        object.write().items[0] = 8;
        transaction.seal();

        transaction.apply();
        assert!(object.read().items.is_empty());

        transaction.apply();
        assert_eq!(object.read().items, vec![8]);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "target object has been dropped"))]
    fn test_dropped_target_fails_like_other_replay_errors() {
        let mut transaction = Transaction::new("Edit", true);
        {
            let handle: ObjectRef = thing(1);
            transaction.save_object(&handle).unwrap();
        }
        transaction.seal();

        transaction.apply();

        // release builds log, keep the record and still toggle direction
        assert_eq!(transaction.direction(), Direction::Forward);
        assert_eq!(transaction.footprint(), 8);
    }

    #[test]
    fn test_summary() {
        let handle: ObjectRef = thing(3);
        let mut transaction = Transaction::new("Summarize", true);
        transaction.save_object(&handle).unwrap();

        let summary = transaction.summary();
        assert_eq!(summary.id, transaction.id());
        assert_eq!(summary.title, "Summarize");
        assert_eq!(summary.record_count, 1);
        assert_eq!(summary.size_bytes, 8);
        assert_eq!(summary.direction, Direction::Backward);
    }
}
