//! # Rewind
//!
//! Transactional undo/redo for in-memory object graphs.
//!
//! This crate provides:
//! - Change records that capture whole objects or slices of array fields
//! - Transactions that replay their records and flip between undo and redo
//! - A bounded undo buffer with nested begin/end, cancel and reset
//! - Scoped transactions and a self-recording array type
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                TransactionBuffer                 │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────┐ │
//! │  │ Transaction │ │ Transaction │ │ Transaction │ │
//! │  │   (undo)    │ │   (undo)    │ │   (redo)    │ │
//! │  └─────────────┘ └─────────────┘ └─────────────┘ │
//! │         │               │               │        │
//! │         ▼               ▼               ▼        │
//! │  ┌────────────────────────────────────────────┐  │
//! │  │               ChangeRecord                 │  │
//! │  │   object snapshot │ array slice + codec    │  │
//! │  └────────────────────────────────────────────┘  │
//! │                        │                         │
//! │                        ▼                         │
//! │  ┌────────────────────────────────────────────┐  │
//! │  │     ObjectCell<dyn Transactional>          │  │
//! │  │   serialize / deserialize / array slots    │  │
//! │  └────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use rewind::{ObjectCell, ObjectRef, TransactionBuffer};
//!
//! let mut buffer = TransactionBuffer::default();
//! let actor = ObjectCell::new(Actor::default());
//! let handle: ObjectRef = actor.clone();
//!
//! buffer.begin("Move Actor");
//! buffer.save_object(&handle)?;
//! actor.write().x = 10.0;
//! buffer.end();
//!
//! buffer.undo()?;
//! buffer.redo()?;
//! ```

pub mod buffer;
pub mod codec;
pub mod error;
pub mod object;
pub mod record;
pub mod scoped;
pub mod snapshot;
pub mod trans_array;
pub mod transaction;

pub use buffer::{BufferConfig, TransactionBuffer};
pub use codec::{ArrayElement, FieldCodec, VecCodec};
pub use error::{SnapshotError, TransactionError};
pub use object::{same_object, ArraySlot, ObjectCell, ObjectRef, Transactional, WeakRef};
pub use record::{ArrayOp, ArrayRange, ChangeRecord};
pub use scoped::ScopedTransaction;
pub use snapshot::{Snapshot, SnapshotReader, SnapshotWriter};
pub use trans_array::TransArray;
pub use transaction::{Direction, Transaction, TransactionId, TransactionSummary};
