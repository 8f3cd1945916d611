use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// A named blob of memory used to initialize the memory image of a thread or
/// process invocation
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotData {
    pub data: Arc<Vec<u8>>,
}

impl SnapshotData {
    pub fn new(data: Vec<u8>) -> SnapshotData {
        SnapshotData {
            data: Arc::new(data),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

lazy_static! {
    static ref SNAPSHOTS: RwLock<HashMap<String, SnapshotData>> = RwLock::new(HashMap::new());
}

pub fn take_snapshot(key: &str, snapshot: SnapshotData) {
    SNAPSHOTS.write().insert(key.to_owned(), snapshot);
}

pub fn get_snapshot(key: &str) -> Result<SnapshotData> {
    SNAPSHOTS
        .read()
        .get(key)
        .cloned()
        .ok_or_else(|| Error::KeyNotFound(key.to_owned()))
}

pub fn delete_snapshot(key: &str) {
    SNAPSHOTS.write().remove(key);
}

pub fn snapshot_count() -> usize {
    SNAPSHOTS.read().len()
}

pub fn clear_snapshots() {
    SNAPSHOTS.write().clear();
}
