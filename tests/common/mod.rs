//! Host object model shared by the integration tests
#![allow(dead_code)]

use std::any::Any;
use std::sync::{Arc, Once};

use rewind::{
    ArraySlot, ObjectCell, ObjectRef, SnapshotError, SnapshotReader, SnapshotWriter, TransArray,
    Transactional, TransactionBuffer, WeakRef,
};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Route crate logs to the test writer, filtered by `RUST_LOG`
pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// === Point ===

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Transactional for Point {
    fn serialize(&self, writer: &mut SnapshotWriter) {
        writer.write_i32(self.x);
        writer.write_i32(self.y);
    }

    fn deserialize(&mut self, reader: &mut SnapshotReader<'_>) -> Result<(), SnapshotError> {
        self.x = reader.read_i32()?;
        self.y = reader.read_i32()?;
        Ok(())
    }
}

pub fn point(x: i32, y: i32) -> Arc<ObjectCell<Point>> {
    ObjectCell::new(Point { x, y })
}

/// Capture `target` and move it in its own transaction
pub fn move_point(
    buffer: &mut TransactionBuffer,
    target: &Arc<ObjectCell<Point>>,
    title: &str,
    x: i32,
    y: i32,
) {
    let handle: ObjectRef = target.clone();
    buffer.begin(title);
    buffer.save_object(&handle).unwrap();
    *target.write() = Point { x, y };
    buffer.end();
}

// === Node ===

/// Graph node holding a strong link to a peer
#[derive(Default)]
pub struct Node {
    pub label: String,
    pub peer: Option<ObjectRef>,
}

impl Transactional for Node {
    fn serialize(&self, writer: &mut SnapshotWriter) {
        writer.write_str(&self.label);
        writer.write_object(self.peer.as_ref());
    }

    fn deserialize(&mut self, reader: &mut SnapshotReader<'_>) -> Result<(), SnapshotError> {
        self.label = reader.read_str()?;
        self.peer = reader.read_object()?;
        Ok(())
    }
}

pub fn node(label: &str) -> Arc<ObjectCell<Node>> {
    ObjectCell::new(Node {
        label: label.to_string(),
        peer: None,
    })
}

pub fn peer_label(node: &Arc<ObjectCell<Node>>) -> Option<String> {
    let peer = node.read().peer.clone()?;
    let mut writer = SnapshotWriter::new();
    peer.read().serialize(&mut writer);
    let snapshot = writer.finish();
    SnapshotReader::new(&snapshot).read_str().ok()
}

// === Watcher ===

/// Mirrors a point's `x` while being restored, exposing restore order
pub struct Watcher {
    pub point: Arc<ObjectCell<Point>>,
    pub observed_x: i32,
}

impl Transactional for Watcher {
    fn serialize(&self, writer: &mut SnapshotWriter) {
        let handle: ObjectRef = self.point.clone();
        writer.write_object(Some(&handle));
    }

    fn deserialize(&mut self, reader: &mut SnapshotReader<'_>) -> Result<(), SnapshotError> {
        reader.read_object()?;
        self.observed_x = self.point.read().x;
        Ok(())
    }
}

pub fn watcher(point: &Arc<ObjectCell<Point>>) -> Arc<ObjectCell<Watcher>> {
    ObjectCell::new(Watcher {
        point: point.clone(),
        observed_x: point.read().x,
    })
}

// === Shape ===

pub const VERTICES: ArraySlot = ArraySlot(0);

/// Object with a scalar field and a transactional array
pub struct Shape {
    pub name: String,
    pub vertices: TransArray<(i32, i32)>,
}

impl Transactional for Shape {
    fn serialize(&self, writer: &mut SnapshotWriter) {
        writer.write_str(&self.name);
    }

    fn deserialize(&mut self, reader: &mut SnapshotReader<'_>) -> Result<(), SnapshotError> {
        self.name = reader.read_str()?;
        Ok(())
    }

    fn array_slot_mut(&mut self, slot: ArraySlot) -> Option<&mut dyn Any> {
        (slot == VERTICES).then_some(self.vertices.as_any_mut())
    }
}

pub fn shape(name: &str, vertices: Vec<(i32, i32)>) -> Arc<ObjectCell<Shape>> {
    ObjectCell::new_cyclic(|weak| {
        let owner: WeakRef = weak.clone();
        Shape {
            name: name.to_string(),
            vertices: TransArray::with_items(owner, VERTICES, vertices),
        }
    })
}

pub fn vertices(shape: &Arc<ObjectCell<Shape>>) -> Vec<(i32, i32)> {
    shape.read().vertices.to_vec()
}
