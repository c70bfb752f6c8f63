//! Transactional array - a `Vec` that records its own slices

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::buffer::TransactionBuffer;
use crate::codec::{ArrayElement, FieldCodec, VecCodec};
use crate::error::TransactionError;
use crate::object::{ArraySlot, ObjectRef, WeakRef};
use crate::record::{ArrayOp, ArrayRange};

type Recorder<'b> = Option<(&'b mut TransactionBuffer, ObjectRef)>;

/// Array field of a participating object.
///
/// Every mutator takes an optional buffer: with one, the affected slice is
/// captured (after growing for inserts, before shrinking or overwriting
/// otherwise); without one the array changes silently. The owner must expose
/// [`as_any_mut`](Self::as_any_mut) from
/// [`Transactional::array_slot_mut`](crate::Transactional::array_slot_mut)
/// under the same slot.
pub struct TransArray<T: ArrayElement> {
    owner: WeakRef,
    slot: ArraySlot,
    items: Vec<T>,
    codec: Arc<dyn FieldCodec>,
}

impl<T: ArrayElement> TransArray<T> {
    pub fn new(owner: WeakRef, slot: ArraySlot) -> Self {
        Self::with_items(owner, slot, Vec::new())
    }

    pub fn with_items(owner: WeakRef, slot: ArraySlot, items: Vec<T>) -> Self {
        Self {
            owner,
            slot,
            items,
            codec: VecCodec::<T>::shared(),
        }
    }

    pub fn owner(&self) -> &WeakRef {
        &self.owner
    }

    pub fn set_owner(&mut self, owner: WeakRef) {
        self.owner = owner;
    }

    pub fn slot(&self) -> ArraySlot {
        self.slot
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Type-erased view for replay
    pub fn as_any_mut(&mut self) -> &mut dyn Any {
        &mut self.items
    }

    /// Append one element, returning its index
    pub fn push(
        &mut self,
        item: T,
        undo: Option<&mut TransactionBuffer>,
    ) -> Result<usize, TransactionError> {
        let recorder = self.recorder(undo)?;
        self.items.push(item);
        let index = self.items.len() - 1;
        self.record(recorder, index, 1, ArrayOp::Insert)?;
        Ok(index)
    }

    pub fn insert(
        &mut self,
        index: usize,
        item: T,
        undo: Option<&mut TransactionBuffer>,
    ) -> Result<(), TransactionError> {
        if index > self.items.len() {
            return Err(self.out_of_bounds(index, 1));
        }
        let recorder = self.recorder(undo)?;
        self.items.insert(index, item);
        self.record(recorder, index, 1, ArrayOp::Insert)
    }

    /// Remove `count` elements starting at `index`
    pub fn remove(
        &mut self,
        index: usize,
        count: usize,
        undo: Option<&mut TransactionBuffer>,
    ) -> Result<(), TransactionError> {
        self.check_range(index, count)?;
        let recorder = self.recorder(undo)?;
        self.record(recorder, index, count, ArrayOp::Remove)?;
        self.items.drain(index..index + count);
        Ok(())
    }

    pub fn clear(&mut self, undo: Option<&mut TransactionBuffer>) -> Result<(), TransactionError> {
        if self.items.is_empty() {
            return Ok(());
        }
        self.remove(0, self.items.len(), undo)
    }

    /// Remove every element equal to `item`, returning how many went
    pub fn remove_item(
        &mut self,
        item: &T,
        mut undo: Option<&mut TransactionBuffer>,
    ) -> Result<usize, TransactionError>
    where
        T: PartialEq,
    {
        let before = self.items.len();
        let mut index = 0;
        while index < self.items.len() {
            if &self.items[index] == item {
                self.remove(index, 1, undo.as_deref_mut())?;
            } else {
                index += 1;
            }
        }
        Ok(before - self.items.len())
    }

    /// Capture one element and hand it out for modification
    pub fn modify_item(
        &mut self,
        index: usize,
        undo: Option<&mut TransactionBuffer>,
    ) -> Result<&mut T, TransactionError> {
        self.check_range(index, 1)?;
        let recorder = self.recorder(undo)?;
        self.record(recorder, index, 1, ArrayOp::Modify)?;
        Ok(&mut self.items[index])
    }

    /// Capture every element and hand them out for modification
    pub fn modify_all(
        &mut self,
        undo: Option<&mut TransactionBuffer>,
    ) -> Result<&mut [T], TransactionError> {
        let recorder = self.recorder(undo)?;
        if !self.items.is_empty() {
            self.record(recorder, 0, self.items.len(), ArrayOp::Modify)?;
        }
        Ok(&mut self.items)
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }

    // === Private Methods ===

    fn recorder<'b>(
        &self,
        undo: Option<&'b mut TransactionBuffer>,
    ) -> Result<Recorder<'b>, TransactionError> {
        let Some(buffer) = undo else {
            return Ok(None);
        };
        if !buffer.is_active() {
            return Err(TransactionError::NotCapturing);
        }
        let owner = self.owner.upgrade().ok_or(TransactionError::DanglingOwner)?;
        Ok(Some((buffer, owner)))
    }

    fn record(
        &self,
        recorder: Recorder<'_>,
        index: usize,
        count: usize,
        op: ArrayOp,
    ) -> Result<(), TransactionError> {
        if let Some((buffer, owner)) = recorder {
            let range = ArrayRange::new(self.slot, index, count, op, self.codec.clone());
            buffer.save_array(&owner, &self.items, range)?;
        }
        Ok(())
    }

    fn check_range(&self, index: usize, count: usize) -> Result<(), TransactionError> {
        match index.checked_add(count) {
            Some(end) if end <= self.items.len() => Ok(()),
            _ => Err(self.out_of_bounds(index, count)),
        }
    }

    fn out_of_bounds(&self, index: usize, count: usize) -> TransactionError {
        TransactionError::SliceOutOfBounds {
            index,
            count,
            len: self.items.len(),
        }
    }
}

impl<T: ArrayElement> Deref for TransArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<T: ArrayElement + fmt::Debug> fmt::Debug for TransArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransArray")
            .field("slot", &self.slot)
            .field("items", &self.items)
            .finish()
    }
}
