//! Type-erased codecs for array-slice capture

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

use crate::error::SnapshotError;
use crate::object::ObjectRef;
use crate::snapshot::{SnapshotReader, SnapshotWriter};

/// Serialize/destroy operations bound to one array's element type.
///
/// The array is handed over as `&dyn Any`; a codec must reject arrays of any
/// other type with [`SnapshotError::TypeMismatch`].
pub trait FieldCodec: Send + Sync {
    /// Size of one element in memory
    fn element_size(&self) -> usize;

    /// Current length, or `None` if the array is of the wrong type
    fn len(&self, array: &dyn Any) -> Option<usize>;

    /// Write `count` elements starting at `index`
    fn save(
        &self,
        array: &dyn Any,
        index: usize,
        count: usize,
        writer: &mut SnapshotWriter,
    ) -> Result<(), SnapshotError>;

    /// Drop `count` elements starting at `index`
    fn remove(&self, array: &mut dyn Any, index: usize, count: usize) -> Result<(), SnapshotError>;

    /// Decode `count` elements and splice them in at `index`
    fn insert(
        &self,
        array: &mut dyn Any,
        index: usize,
        count: usize,
        reader: &mut SnapshotReader<'_>,
    ) -> Result<(), SnapshotError>;

    /// Decode `count` elements over the existing ones at `index`
    fn overwrite(
        &self,
        array: &mut dyn Any,
        index: usize,
        count: usize,
        reader: &mut SnapshotReader<'_>,
    ) -> Result<(), SnapshotError>;
}

/// An element type that can live in a transactional array.
pub trait ArrayElement: Sized + Send + Sync + 'static {
    fn save(&self, writer: &mut SnapshotWriter);

    fn load(reader: &mut SnapshotReader<'_>) -> Result<Self, SnapshotError>;
}

macro_rules! primitive_element {
    ($($ty:ty => $write:ident, $read:ident);* $(;)?) => {
        $(
            impl ArrayElement for $ty {
                fn save(&self, writer: &mut SnapshotWriter) {
                    writer.$write(*self);
                }

                fn load(reader: &mut SnapshotReader<'_>) -> Result<Self, SnapshotError> {
                    reader.$read()
                }
            }
        )*
    };
}

primitive_element! {
    u8 => write_u8, read_u8;
    u16 => write_u16, read_u16;
    u32 => write_u32, read_u32;
    u64 => write_u64, read_u64;
    i32 => write_i32, read_i32;
    i64 => write_i64, read_i64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
    bool => write_bool, read_bool;
}

impl ArrayElement for String {
    fn save(&self, writer: &mut SnapshotWriter) {
        writer.write_str(self);
    }

    fn load(reader: &mut SnapshotReader<'_>) -> Result<Self, SnapshotError> {
        reader.read_str()
    }
}

impl ArrayElement for Option<ObjectRef> {
    fn save(&self, writer: &mut SnapshotWriter) {
        writer.write_object(self.as_ref());
    }

    fn load(reader: &mut SnapshotReader<'_>) -> Result<Self, SnapshotError> {
        reader.read_object()
    }
}

impl<A: ArrayElement, B: ArrayElement> ArrayElement for (A, B) {
    fn save(&self, writer: &mut SnapshotWriter) {
        self.0.save(writer);
        self.1.save(writer);
    }

    fn load(reader: &mut SnapshotReader<'_>) -> Result<Self, SnapshotError> {
        Ok((A::load(reader)?, B::load(reader)?))
    }
}

/// [`FieldCodec`] for a `Vec<T>`.
pub struct VecCodec<T>(PhantomData<fn() -> T>);

impl<T: ArrayElement> VecCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }

    /// Codec ready to hand to `save_array`
    pub fn shared() -> Arc<dyn FieldCodec> {
        Arc::new(Self::new())
    }

    fn array<'v>(&self, array: &'v dyn Any) -> Result<&'v Vec<T>, SnapshotError> {
        array.downcast_ref::<Vec<T>>().ok_or(SnapshotError::TypeMismatch)
    }

    fn array_mut<'v>(&self, array: &'v mut dyn Any) -> Result<&'v mut Vec<T>, SnapshotError> {
        array.downcast_mut::<Vec<T>>().ok_or(SnapshotError::TypeMismatch)
    }
}

impl<T: ArrayElement> Default for VecCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for VecCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VecCodec<{}>", std::any::type_name::<T>())
    }
}

fn check_range(len: usize, index: usize, count: usize) -> Result<(), SnapshotError> {
    match index.checked_add(count) {
        Some(end) if end <= len => Ok(()),
        _ => Err(SnapshotError::RangeOutOfBounds { index, count, len }),
    }
}

impl<T: ArrayElement> FieldCodec for VecCodec<T> {
    fn element_size(&self) -> usize {
        size_of::<T>()
    }

    fn len(&self, array: &dyn Any) -> Option<usize> {
        self.array(array).ok().map(Vec::len)
    }

    fn save(
        &self,
        array: &dyn Any,
        index: usize,
        count: usize,
        writer: &mut SnapshotWriter,
    ) -> Result<(), SnapshotError> {
        let items = self.array(array)?;
        check_range(items.len(), index, count)?;
        for item in &items[index..index + count] {
            item.save(writer);
        }
        Ok(())
    }

    fn remove(&self, array: &mut dyn Any, index: usize, count: usize) -> Result<(), SnapshotError> {
        let items = self.array_mut(array)?;
        check_range(items.len(), index, count)?;
        items.drain(index..index + count);
        Ok(())
    }

    fn insert(
        &self,
        array: &mut dyn Any,
        index: usize,
        count: usize,
        reader: &mut SnapshotReader<'_>,
    ) -> Result<(), SnapshotError> {
        let items = self.array_mut(array)?;
        check_range(items.len(), index, 0)?;
        let loaded = (0..count)
            .map(|_| T::load(reader))
            .collect::<Result<Vec<_>, _>>()?;
        items.splice(index..index, loaded);
        Ok(())
    }

    fn overwrite(
        &self,
        array: &mut dyn Any,
        index: usize,
        count: usize,
        reader: &mut SnapshotReader<'_>,
    ) -> Result<(), SnapshotError> {
        let items = self.array_mut(array)?;
        check_range(items.len(), index, count)?;
        for item in &mut items[index..index + count] {
            *item = T::load(reader)?;
        }
        Ok(())
    }
}
