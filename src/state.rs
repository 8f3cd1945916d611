use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{Error, Result};

/// Contract of the external key-value store used for cluster-wide metadata.
///
/// Keys are strings, payloads opaque bytes. Blob keys support a local
/// copy + authoritative copy split (`pull`/`push_full`), list keys support
/// append and blocking pop, set keys back the host-discovery registry and
/// the chained-function log.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&self, key: &str, value: &[u8]);
    fn delete(&self, key: &str);

    /// Refresh the local copy from the authoritative one
    fn pull(&self, key: &str);
    /// Publish the local copy as the authoritative one
    fn push_full(&self, key: &str);

    fn append(&self, key: &str, value: &[u8]);
    fn blocking_pop(&self, key: &str, timeout: Duration) -> Result<Vec<u8>>;
    fn list_length(&self, key: &str) -> usize;

    fn set_ttl(&self, key: &str, ttl_secs: u64);
    /// Remaining TTL in seconds, -1 when none is set
    fn get_ttl(&self, key: &str) -> i64;

    fn set_add(&self, key: &str, member: &str);
    fn set_remove(&self, key: &str, member: &str);
    fn set_members(&self, key: &str) -> Vec<String>;

    fn clear(&self);
}

#[derive(Default)]
struct InMemoryInner {
    blobs: HashMap<String, Vec<u8>>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    sets: HashMap<String, BTreeSet<String>>,
    ttls: HashMap<String, u64>,
}

/// Process-local store.
///
/// Every instance in a process shares one map, so several world or host
/// simulations in a test observe each other exactly as they would through a
/// real store. `pull`/`push_full` are therefore no-ops here.
#[derive(Default)]
pub struct InMemoryKvStore {
    inner: Mutex<InMemoryInner>,
    list_pushed: Condvar,
}

impl InMemoryKvStore {
    pub fn new() -> InMemoryKvStore {
        InMemoryKvStore::default()
    }
}

impl KvStore for InMemoryKvStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().blobs.get(key).cloned()
    }

    fn set(&self, key: &str, value: &[u8]) {
        self.inner.lock().blobs.insert(key.to_owned(), value.to_vec());
    }

    fn delete(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.blobs.remove(key);
        inner.lists.remove(key);
        inner.sets.remove(key);
        inner.ttls.remove(key);
    }

    fn pull(&self, _key: &str) {}

    fn push_full(&self, _key: &str) {}

    fn append(&self, key: &str, value: &[u8]) {
        let mut inner = self.inner.lock();
        inner
            .lists
            .entry(key.to_owned())
            .or_default()
            .push_back(value.to_vec());
        self.list_pushed.notify_all();
    }

    fn blocking_pop(&self, key: &str, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(value) = inner.lists.get_mut(key).and_then(|l| l.pop_front()) {
                return Ok(value);
            }
            if self.list_pushed.wait_until(&mut inner, deadline).timed_out() {
                return Err(Error::Timeout);
            }
        }
    }

    fn list_length(&self, key: &str) -> usize {
        self.inner.lock().lists.get(key).map_or(0, |l| l.len())
    }

    fn set_ttl(&self, key: &str, ttl_secs: u64) {
        self.inner.lock().ttls.insert(key.to_owned(), ttl_secs);
    }

    fn get_ttl(&self, key: &str) -> i64 {
        self.inner.lock().ttls.get(key).map_or(-1, |t| *t as i64)
    }

    fn set_add(&self, key: &str, member: &str) {
        self.inner
            .lock()
            .sets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned());
    }

    fn set_remove(&self, key: &str, member: &str) {
        if let Some(set) = self.inner.lock().sets.get_mut(key) {
            set.remove(member);
        }
    }

    fn set_members(&self, key: &str) -> Vec<String> {
        self.inner
            .lock()
            .sets
            .get(key)
            .map_or_else(Vec::new, |s| s.iter().cloned().collect())
    }

    fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.blobs.clear();
        inner.lists.clear();
        inner.sets.clear();
        inner.ttls.clear();
    }
}

lazy_static! {
    static ref GLOBAL_KV: RwLock<Arc<dyn KvStore>> = RwLock::new(Arc::new(InMemoryKvStore::new()));
}

/// Handle on the store backing this process
pub fn global_kv() -> Arc<dyn KvStore> {
    GLOBAL_KV.read().clone()
}

/// Swap the store implementation, e.g. for a networked deployment
pub fn set_global_kv(store: Arc<dyn KvStore>) {
    *GLOBAL_KV.write() = store;
}
