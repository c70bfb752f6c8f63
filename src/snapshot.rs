//! Snapshot payloads and their reference tables
//!
//! A snapshot is a flat little-endian byte payload. Object handles and names
//! are not stored inline: the writer deduplicates them into side tables and
//! writes a `u32` index instead, which the reader resolves on the way back.
//!
//! The object table holds strong handles, so an object reachable only from
//! the undo history (an array element that was deleted, say) stays alive for
//! as long as the snapshot does.

use std::collections::HashMap;
use std::mem::size_of;
use std::sync::Arc;

use crate::error::SnapshotError;
use crate::object::{ObjectKey, ObjectRef, WeakRef};

/// Index written for an absent object reference
const NO_OBJECT: u32 = u32::MAX;

/// Captured state of one object or array region.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    bytes: Vec<u8>,
    objects: Vec<ObjectRef>,
    names: Vec<Arc<str>>,
}

impl Snapshot {
    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Raw payload
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Objects referenced from the payload, in first-seen order
    pub fn referenced_objects(&self) -> &[ObjectRef] {
        &self.objects
    }

    /// Names referenced from the payload, in first-seen order
    pub fn referenced_names(&self) -> &[Arc<str>] {
        &self.names
    }
}

/// Byte sink handed to [`Transactional::serialize`](crate::Transactional::serialize).
#[derive(Debug, Default)]
pub struct SnapshotWriter {
    bytes: Vec<u8>,
    objects: Vec<ObjectRef>,
    object_index: HashMap<ObjectKey, u32>,
    names: Vec<Arc<str>>,
    name_index: HashMap<Arc<str>, u32>,
}

macro_rules! write_le {
    ($($name:ident => $ty:ty),* $(,)?) => {
        $(
            #[doc = concat!("Append a little-endian `", stringify!($ty), "`")]
            pub fn $name(&mut self, value: $ty) {
                self.bytes.extend_from_slice(&value.to_le_bytes());
            }
        )*
    };
}

impl SnapshotWriter {
    pub fn new() -> Self {
        Self::default()
    }

    write_le! {
        write_u8 => u8,
        write_u16 => u16,
        write_u32 => u32,
        write_u64 => u64,
        write_i32 => i32,
        write_i64 => i64,
        write_f32 => f32,
        write_f64 => f64,
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(u8::from(value));
    }

    /// Append a length-prefixed byte blob
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_u64(value.len() as u64);
        self.bytes.extend_from_slice(value);
    }

    /// Append a length-prefixed UTF-8 string
    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    /// Append an object reference as an index into the object table
    pub fn write_object(&mut self, object: Option<&ObjectRef>) {
        let Some(object) = object else {
            self.write_u32(NO_OBJECT);
            return;
        };

        let key = ObjectKey::of(object);
        let index = match self.object_index.get(&key) {
            Some(&index) => index,
            None => {
                let index = self.objects.len() as u32;
                self.objects.push(object.clone());
                self.object_index.insert(key, index);
                index
            }
        };
        self.write_u32(index);
    }

    /// Append a back-reference; a dropped object is written as absent
    pub fn write_weak(&mut self, object: &WeakRef) {
        self.write_object(object.upgrade().as_ref());
    }

    /// Append a symbolic name as an index into the name table
    pub fn write_name(&mut self, name: &str) {
        let index = match self.name_index.get(name) {
            Some(&index) => index,
            None => {
                let index = self.names.len() as u32;
                let name: Arc<str> = Arc::from(name);
                self.names.push(name.clone());
                self.name_index.insert(name, index);
                index
            }
        };
        self.write_u32(index);
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Seal the payload and its tables
    pub fn finish(self) -> Snapshot {
        Snapshot {
            bytes: self.bytes,
            objects: self.objects,
            names: self.names,
        }
    }
}

/// Restores records an object reference depends on before it is resolved.
pub(crate) trait PendingRestore {
    fn restore_pending(&mut self, object: ObjectKey);
}

/// Byte source handed to [`Transactional::deserialize`](crate::Transactional::deserialize).
pub struct SnapshotReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    objects: &'a [ObjectRef],
    names: &'a [Arc<str>],
    pending: Option<&'a mut (dyn PendingRestore + 'a)>,
}

macro_rules! read_le {
    ($($name:ident => $ty:ty),* $(,)?) => {
        $(
            #[doc = concat!("Read a little-endian `", stringify!($ty), "`")]
            pub fn $name(&mut self) -> Result<$ty, SnapshotError> {
                let mut raw = [0u8; size_of::<$ty>()];
                raw.copy_from_slice(self.take(size_of::<$ty>())?);
                Ok(<$ty>::from_le_bytes(raw))
            }
        )*
    };
}

impl<'a> SnapshotReader<'a> {
    /// Read a snapshot outside of a replay; references resolve without
    /// triggering any restoration.
    pub fn new(snapshot: &'a Snapshot) -> Self {
        Self {
            bytes: &snapshot.bytes,
            pos: 0,
            objects: &snapshot.objects,
            names: &snapshot.names,
            pending: None,
        }
    }

    pub(crate) fn with_pending(
        snapshot: &'a Snapshot,
        pending: &'a mut (dyn PendingRestore + 'a),
    ) -> Self {
        Self {
            pending: Some(pending),
            ..Self::new(snapshot)
        }
    }

    read_le! {
        read_u8 => u8,
        read_u16 => u16,
        read_u32 => u32,
        read_u64 => u64,
        read_i32 => i32,
        read_i64 => i64,
        read_f32 => f32,
        read_f64 => f64,
    }

    pub fn read_bool(&mut self) -> Result<bool, SnapshotError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, SnapshotError> {
        let len = usize::try_from(self.read_u64()?).unwrap_or(usize::MAX);
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_str(&mut self) -> Result<String, SnapshotError> {
        String::from_utf8(self.read_bytes()?).map_err(|_| SnapshotError::InvalidUtf8)
    }

    /// Resolve an object reference.
    ///
    /// During replay, pending records of the referenced object are restored
    /// first so the returned object is never observed in its stale state.
    pub fn read_object(&mut self) -> Result<Option<ObjectRef>, SnapshotError> {
        let index = self.read_u32()?;
        if index == NO_OBJECT {
            return Ok(None);
        }

        let objects: &'a [ObjectRef] = self.objects;
        let object = objects
            .get(index as usize)
            .ok_or(SnapshotError::BadObjectIndex {
                index,
                len: objects.len(),
            })?;

        if let Some(pending) = self.pending.as_deref_mut() {
            pending.restore_pending(ObjectKey::of(object));
        }

        Ok(Some(object.clone()))
    }

    pub fn read_name(&mut self) -> Result<Arc<str>, SnapshotError> {
        let index = self.read_u32()?;
        self.names
            .get(index as usize)
            .cloned()
            .ok_or(SnapshotError::BadNameIndex {
                index,
                len: self.names.len(),
            })
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], SnapshotError> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(SnapshotError::UnexpectedEof { needed, remaining });
        }
        let bytes: &'a [u8] = self.bytes;
        let slice = &bytes[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectCell, Transactional};

    struct Blank;

    impl Transactional for Blank {
        fn serialize(&self, _writer: &mut SnapshotWriter) {}

        fn deserialize(&mut self, _reader: &mut SnapshotReader<'_>) -> Result<(), SnapshotError> {
            Ok(())
        }
    }

    // === Primitive Tests ===

    #[test]
    fn test_mixed_fields_read_back_in_order() {
        let mut writer = SnapshotWriter::new();
        writer.write_i32(-12);
        writer.write_f64(2.5);
        writer.write_bool(true);
        writer.write_str("brush");
        writer.write_u16(9);

        let snapshot = writer.finish();
        let mut reader = SnapshotReader::new(&snapshot);
        assert_eq!(reader.read_i32().unwrap(), -12);
        assert_eq!(reader.read_f64().unwrap(), 2.5);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_str().unwrap(), "brush");
        assert_eq!(reader.read_u16().unwrap(), 9);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_read_past_end() {
        let mut writer = SnapshotWriter::new();
        writer.write_u16(1);
        let snapshot = writer.finish();

        let mut reader = SnapshotReader::new(&snapshot);
        assert_eq!(
            reader.read_u32(),
            Err(SnapshotError::UnexpectedEof { needed: 4, remaining: 2 })
        );
    }

    #[test]
    fn test_invalid_utf8() {
        let mut writer = SnapshotWriter::new();
        writer.write_bytes(&[0xff, 0xfe]);
        let snapshot = writer.finish();

        assert_eq!(
            SnapshotReader::new(&snapshot).read_str(),
            Err(SnapshotError::InvalidUtf8)
        );
    }

    // === Reference Table Tests ===

    #[test]
    fn test_objects_deduplicated() {
        let a: ObjectRef = ObjectCell::new(Blank);
        let b: ObjectRef = ObjectCell::new(Blank);

        let mut writer = SnapshotWriter::new();
        writer.write_object(Some(&a));
        writer.write_object(Some(&b));
        writer.write_object(Some(&a));
        writer.write_object(None);
        let snapshot = writer.finish();

        assert_eq!(snapshot.referenced_objects().len(), 2);
        assert_eq!(snapshot.len(), 16);

        let mut reader = SnapshotReader::new(&snapshot);
        let first = reader.read_object().unwrap().unwrap();
        let second = reader.read_object().unwrap().unwrap();
        let third = reader.read_object().unwrap().unwrap();
        assert!(crate::same_object(&first, &a));
        assert!(crate::same_object(&second, &b));
        assert!(crate::same_object(&third, &a));
        assert!(reader.read_object().unwrap().is_none());
    }

    #[test]
    fn test_names_deduplicated() {
        let mut writer = SnapshotWriter::new();
        writer.write_name("Location");
        writer.write_name("Rotation");
        writer.write_name("Location");
        let snapshot = writer.finish();

        assert_eq!(snapshot.referenced_names().len(), 2);

        let mut reader = SnapshotReader::new(&snapshot);
        assert_eq!(&*reader.read_name().unwrap(), "Location");
        assert_eq!(&*reader.read_name().unwrap(), "Rotation");
        assert_eq!(&*reader.read_name().unwrap(), "Location");
    }

    #[test]
    fn test_bad_indices() {
        let mut writer = SnapshotWriter::new();
        writer.write_u32(3);
        writer.write_u32(0);
        let snapshot = writer.finish();

        let mut reader = SnapshotReader::new(&snapshot);
        assert_eq!(
            reader.read_object().unwrap_err(),
            SnapshotError::BadObjectIndex { index: 3, len: 0 }
        );
        assert_eq!(
            reader.read_name().unwrap_err(),
            SnapshotError::BadNameIndex { index: 0, len: 0 }
        );
    }

    #[test]
    fn test_snapshot_keeps_referenced_objects_alive() {
        let mut writer = SnapshotWriter::new();
        let weak = {
            let only_owner: ObjectRef = ObjectCell::new(Blank);
            writer.write_object(Some(&only_owner));
            Arc::downgrade(&only_owner)
        };
        let snapshot = writer.finish();
        assert!(weak.upgrade().is_some());

        let object = SnapshotReader::new(&snapshot).read_object().unwrap().unwrap();
        assert!(crate::same_object(&object, &snapshot.referenced_objects()[0]));

        drop(object);
        drop(snapshot);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_write_weak_of_dropped_object_is_absent() {
        let weak: WeakRef = {
            let gone: ObjectRef = ObjectCell::new(Blank);
            Arc::downgrade(&gone)
        };
        let mut writer = SnapshotWriter::new();
        writer.write_weak(&weak);
        let snapshot = writer.finish();

        assert!(snapshot.referenced_objects().is_empty());
        assert!(SnapshotReader::new(&snapshot).read_object().unwrap().is_none());
    }
}
