//! Scoped transactions - begin on construction, end on drop

use std::ops::{Deref, DerefMut};

use crate::buffer::TransactionBuffer;

/// Keeps a transaction level open for the guard's lifetime.
///
/// Derefs to the buffer so mutators can capture through the guard. Nest by
/// building a guard from another guard.
pub struct ScopedTransaction<'a> {
    buffer: &'a mut TransactionBuffer,
    depth: usize,
    open: bool,
}

impl<'a> ScopedTransaction<'a> {
    pub fn new(buffer: &'a mut TransactionBuffer, title: impl Into<String>) -> Self {
        let depth = buffer.begin(title);
        Self {
            buffer,
            depth,
            open: true,
        }
    }

    /// Depth of the buffer before this guard began
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Discard everything captured under this guard
    pub fn cancel(mut self) {
        self.open = false;
        self.buffer.cancel(self.depth);
    }
}

impl Deref for ScopedTransaction<'_> {
    type Target = TransactionBuffer;

    fn deref(&self) -> &TransactionBuffer {
        self.buffer
    }
}

impl DerefMut for ScopedTransaction<'_> {
    fn deref_mut(&mut self) -> &mut TransactionBuffer {
        self.buffer
    }
}

impl Drop for ScopedTransaction<'_> {
    fn drop(&mut self) {
        if self.open {
            self.buffer.end();
        }
    }
}
