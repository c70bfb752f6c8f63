//! Transaction buffer - owns the undo stack and drives undo/redo

use std::any::Any;
use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::TransactionError;
use crate::object::{ObjectKey, ObjectRef};
use crate::record::ArrayRange;
use crate::transaction::{Transaction, TransactionId, TransactionSummary};

/// Reset reason used when the buffer repairs itself
const INVALID_STATE: &str = "invalid transaction state";

/// Configuration for the transaction buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Soft cap on captured payload bytes across the undo stack
    pub memory_budget: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            memory_budget: 16 * 1024 * 1024,
        }
    }
}

/// Manages the undo stack, the redo cursor and the open transaction
pub struct TransactionBuffer {
    /// Configuration
    config: BufferConfig,
    /// All transactions (oldest first)
    undo_stack: VecDeque<Transaction>,
    /// Transactions at the tail that have been undone
    redo_depth: usize,
    /// Begin/End nesting depth
    active_depth: usize,
    /// Record count of the open transaction at each nested begin
    depth_marks: Vec<usize>,
    /// Why the stack was last wiped
    reset_reason: Option<String>,
}

impl TransactionBuffer {
    /// Create an empty buffer
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            undo_stack: VecDeque::new(),
            redo_depth: 0,
            active_depth: 0,
            depth_marks: Vec::new(),
            reset_reason: None,
        }
    }

    /// Open a transaction, or nest into the open one.
    ///
    /// Returns the depth before the call; pass it to [`cancel`](Self::cancel)
    /// to abort just this level.
    pub fn begin(&mut self, title: impl Into<String>) -> usize {
        let title = title.into();
        let depth = self.active_depth;

        if depth == 0 {
            if self.redo_depth > 0 {
                let keep = self.undo_stack.len() - self.redo_depth;
                self.undo_stack.truncate(keep);
                debug!(dropped = self.redo_depth, "Discarded redo history");
                self.redo_depth = 0;
            }
            self.evict_over_budget();

            debug!(title = %title, "Began transaction");
            self.undo_stack.push_back(Transaction::new(title, true));
        } else {
            debug!(depth, title = %title, "Nested transaction folded into the open one");
        }

        let mark = self.undo_stack.back().map_or(0, Transaction::len);
        self.depth_marks.push(mark);
        self.active_depth += 1;

        self.check_state();
        depth
    }

    /// Close one nesting level; the transaction is sealed when the outermost
    /// level closes. Returns the remaining depth.
    pub fn end(&mut self) -> usize {
        if self.active_depth == 0 {
            warn!("Ended a transaction that was never begun");
            return 0;
        }

        self.active_depth -= 1;
        self.depth_marks.pop();

        if self.active_depth == 0 {
            if let Some(transaction) = self.undo_stack.back_mut() {
                transaction.seal();
                debug!(
                    title = %transaction.title(),
                    records = transaction.len(),
                    size = transaction.footprint(),
                    "Ended transaction"
                );
            }
        }

        self.check_state();
        self.active_depth
    }

    /// Abort the open transaction back to `start_depth`.
    ///
    /// `0` drops the whole transaction; otherwise records captured since the
    /// matching [`begin`](Self::begin) are discarded and that level is closed.
    pub fn cancel(&mut self, start_depth: usize) {
        if self.active_depth == 0 {
            warn!("Cancelled with no open transaction");
            return;
        }
        if start_depth >= self.active_depth {
            warn!(start_depth, active_depth = self.active_depth, "Cancel depth is not open");
            return;
        }

        if start_depth == 0 {
            if let Some(transaction) = self.undo_stack.pop_back() {
                debug!(title = %transaction.title(), "Cancelled transaction");
            }
            self.depth_marks.clear();
        } else {
            let mark = self.depth_marks[start_depth];
            if let Some(transaction) = self.undo_stack.back_mut() {
                debug!(
                    title = %transaction.title(),
                    discarded = transaction.len() - mark,
                    "Cancelled nested transaction"
                );
                transaction.truncate(mark);
            }
            self.depth_marks.truncate(start_depth);
        }
        self.active_depth = start_depth;

        self.check_state();
    }

    /// Wipe all history.
    pub fn reset(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.active_depth > 0 {
            warn!(
                reason = %reason,
                active_depth = self.active_depth,
                "Reset during an open transaction"
            );
        }

        self.clear(reason);
        info!(reason = ?self.reset_reason, "Reset undo history");
        self.check_state();
    }

    /// Whether [`undo`](Self::undo) would succeed; the error says why not
    pub fn can_undo(&self) -> Result<(), TransactionError> {
        if self.active_depth > 0 {
            return Err(TransactionError::UndoDuringTransaction);
        }
        if self.undo_stack.len() == self.redo_depth {
            return Err(match &self.reset_reason {
                Some(reason) => TransactionError::UndoAfterReset(reason.clone()),
                None => TransactionError::NothingToUndo,
            });
        }
        Ok(())
    }

    /// Whether [`redo`](Self::redo) would succeed; the error says why not
    pub fn can_redo(&self) -> Result<(), TransactionError> {
        if self.active_depth > 0 {
            return Err(TransactionError::RedoDuringTransaction);
        }
        if self.redo_depth == 0 {
            return Err(TransactionError::NothingToRedo);
        }
        Ok(())
    }

    /// Title of the transaction the next undo would replay; `None` while
    /// capturing
    pub fn undo_title(&self) -> Option<&str> {
        if self.active_depth > 0 {
            return None;
        }
        let index = self.undo_stack.len().checked_sub(self.redo_depth + 1)?;
        self.undo_stack.get(index).map(Transaction::title)
    }

    /// Title of the transaction the next redo would replay
    pub fn redo_title(&self) -> Option<&str> {
        if self.active_depth > 0 || self.redo_depth == 0 {
            return None;
        }
        self.undo_stack
            .get(self.undo_stack.len() - self.redo_depth)
            .map(Transaction::title)
    }

    /// Undo the most recent transaction that has not been undone
    pub fn undo(&mut self) -> Result<TransactionId, TransactionError> {
        self.can_undo()?;

        let index = self.undo_stack.len() - 1 - self.redo_depth;
        let transaction = &mut self.undo_stack[index];
        info!(title = %transaction.title(), "Undo");
        transaction.apply();
        let id = transaction.id();
        self.redo_depth += 1;

        self.check_state();
        Ok(id)
    }

    /// Redo the most recently undone transaction
    pub fn redo(&mut self) -> Result<TransactionId, TransactionError> {
        self.can_redo()?;

        let index = self.undo_stack.len() - self.redo_depth;
        let transaction = &mut self.undo_stack[index];
        info!(title = %transaction.title(), "Redo");
        transaction.apply();
        let id = transaction.id();
        self.redo_depth -= 1;

        self.check_state();
        Ok(id)
    }

    /// Capture the whole object into the open transaction.
    ///
    /// Returns whether a new record was appended; repeat saves of the same
    /// object within one transaction only bump its save count.
    pub fn save_object(&mut self, object: &ObjectRef) -> Result<bool, TransactionError> {
        self.open_mut()?.save_object(object)
    }

    /// Capture one region of `array` (an array field of `owner`) into the
    /// open transaction.
    pub fn save_array(
        &mut self,
        owner: &ObjectRef,
        array: &dyn Any,
        range: ArrayRange,
    ) -> Result<bool, TransactionError> {
        self.open_mut()?.save_array(owner, array, range)
    }

    /// Whether a transaction is being captured
    pub fn is_active(&self) -> bool {
        self.active_depth > 0
    }

    pub fn active_depth(&self) -> usize {
        self.active_depth
    }

    /// The transaction being captured, if any
    pub fn current(&self) -> Option<&Transaction> {
        if self.active_depth == 0 {
            return None;
        }
        self.undo_stack.back()
    }

    /// Number of transactions (undone ones included)
    pub fn len(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.undo_stack.is_empty()
    }

    /// Transactions available to undo
    pub fn undo_count(&self) -> usize {
        self.undo_stack.len() - self.redo_depth
    }

    /// Transactions available to redo
    pub fn redo_count(&self) -> usize {
        self.redo_depth
    }

    pub fn reset_reason(&self) -> Option<&str> {
        self.reset_reason.as_deref()
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Summaries of all transactions, oldest first
    pub fn history(&self) -> Vec<TransactionSummary> {
        self.undo_stack.iter().map(Transaction::summary).collect()
    }

    /// All transactions, oldest first
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.undo_stack.iter()
    }

    /// Captured payload bytes across the whole stack
    pub fn total_size(&self) -> usize {
        self.undo_stack.iter().map(Transaction::footprint).sum()
    }

    pub fn is_over_budget(&self) -> bool {
        self.total_size() > self.config.memory_budget
    }

    /// Bytes left before the budget is reached
    pub fn free_budget(&self) -> usize {
        self.config.memory_budget.saturating_sub(self.total_size())
    }

    /// Size of the newest transaction
    pub fn last_transaction_size(&self) -> usize {
        self.undo_stack.back().map_or(0, Transaction::footprint)
    }

    /// Visit every live object reachable from a record, once each.
    ///
    /// Hosts that reclaim objects must treat these as roots for as long as
    /// the history holds them.
    pub fn mark_roots(&self, mut mark: impl FnMut(&ObjectRef)) {
        let mut seen = HashSet::new();
        for transaction in &self.undo_stack {
            transaction.visit_references(&mut |object: &ObjectRef| {
                if seen.insert(ObjectKey::of(object)) {
                    mark(object);
                }
            });
        }
    }

    // === Private Methods ===

    fn open_mut(&mut self) -> Result<&mut Transaction, TransactionError> {
        if self.active_depth == 0 {
            return Err(TransactionError::NotCapturing);
        }
        self.undo_stack
            .back_mut()
            .ok_or(TransactionError::NotCapturing)
    }

    fn evict_over_budget(&mut self) {
        let mut total = self.total_size();
        while total > self.config.memory_budget {
            let Some(oldest) = self.undo_stack.pop_front() else {
                break;
            };
            total -= oldest.footprint();
            debug!(
                title = %oldest.title(),
                size = oldest.footprint(),
                "Evicted transaction over memory budget"
            );
        }
    }

    fn clear(&mut self, reason: String) {
        self.undo_stack.clear();
        self.redo_depth = 0;
        self.active_depth = 0;
        self.depth_marks.clear();
        self.reset_reason = Some(reason);
    }

    fn validate(&self) -> Result<(), String> {
        if self.redo_depth > self.undo_stack.len() {
            return Err(format!(
                "redo depth {} exceeds {} transactions",
                self.redo_depth,
                self.undo_stack.len()
            ));
        }
        if self.depth_marks.len() != self.active_depth {
            return Err(format!(
                "{} depth marks for active depth {}",
                self.depth_marks.len(),
                self.active_depth
            ));
        }
        match (self.active_depth, self.undo_stack.back()) {
            (0, Some(last)) if !last.is_sealed() => {
                Err("idle buffer holds an unsealed transaction".to_string())
            }
            (depth, None) if depth > 0 => Err("active buffer has no open transaction".to_string()),
            (depth, Some(last)) if depth > 0 && last.is_sealed() => {
                Err("active buffer's newest transaction is sealed".to_string())
            }
            (depth, _) if depth > 0 && self.redo_depth > 0 => {
                Err("redo history kept while capturing".to_string())
            }
            _ => Ok(()),
        }
    }

    fn check_state(&mut self) {
        if let Err(problem) = self.validate() {
            if cfg!(debug_assertions) {
                panic!("transaction buffer invariant violated: {problem}");
            }
            warn!(problem = %problem, "Transaction buffer state invalid, discarding history");
            self.clear(INVALID_STATE.to_string());
        }
    }
}

impl Default for TransactionBuffer {
    fn default() -> Self {
        Self::new(BufferConfig::default())
    }
}
