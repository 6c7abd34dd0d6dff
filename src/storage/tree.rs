//! JSON tree shared by the store backends.
//!
//! Holds the whole value tree under one lock so every write, its timestamp
//! and its notifications happen atomically with respect to other writes.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tokio::sync::broadcast;
use tracing::trace;

use super::{StoreError, StoreResult, Subscription};
use crate::model::WriteTimestamp;

/// Characters a path segment may not contain
const FORBIDDEN: &[char] = &['.', '#', '$', '[', ']'];

/// Top-level key with its value after a write; `None` when removed
pub(crate) type NodeWrite = (String, Option<Value>);

/// Hook called once per write with every top-level node it touched.
///
/// Must persist all nodes or none; the tree only commits after it succeeds.
pub(crate) trait Persist: Send + Sync {
    fn persist(&self, nodes: &[NodeWrite], write_at: i64, write_count: u64) -> StoreResult<()>;
}

/// Split a path into segments, rejecting forbidden characters
pub(crate) fn segments(path: &str) -> StoreResult<Vec<String>> {
    let segs: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if segs.iter().any(|s| s.contains(FORBIDDEN)) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(segs)
}

/// Whether a write at `a` can change the value at `b` (or the reverse)
fn overlaps(a: &[String], b: &[String]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

fn get_at<'a>(root: &'a Value, segs: &[String]) -> Option<&'a Value> {
    segs.iter().try_fold(root, |node, seg| node.get(seg.as_str()))
}

fn set_at(root: &mut Value, segs: &[String], value: Value) {
    if value.is_null() {
        remove_at(root, segs);
        return;
    }
    let Some((last, parents)) = segs.split_last() else {
        *root = value;
        return;
    };

    let mut node = root;
    for seg in parents {
        node = ensure_object(node)
            .entry(seg.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(node).insert(last.clone(), value);
}

/// Coerce a node into an object, discarding any scalar it held
fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was replaced with an object"),
    }
}

/// Remove a value and prune parents left empty
fn remove_at(root: &mut Value, segs: &[String]) {
    let Some((first, rest)) = segs.split_first() else {
        *root = Value::Object(Map::new());
        return;
    };
    let Some(map) = root.as_object_mut() else {
        return;
    };
    if rest.is_empty() {
        map.remove(first);
        return;
    }
    if let Some(child) = map.get_mut(first) {
        remove_at(child, rest);
        if child.as_object().map_or(false, Map::is_empty) {
            map.remove(first);
        }
    }
}

/// Replace every server sentinel inside `value` with `write_at`
pub(crate) fn resolve_server_values(value: &mut Value, write_at: i64) {
    if WriteTimestamp::is_sentinel(value) {
        *value = Value::from(write_at);
        return;
    }
    match value {
        Value::Object(map) => map
            .values_mut()
            .for_each(|child| resolve_server_values(child, write_at)),
        Value::Array(items) => items
            .iter_mut()
            .for_each(|child| resolve_server_values(child, write_at)),
        _ => {}
    }
}

/// Monotonic write clock
#[derive(Debug)]
struct WriteClock {
    last: i64,
}

impl WriteClock {
    fn next(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.last = now.max(self.last + 1);
        self.last
    }
}

struct TreeState {
    root: Value,
    clock: WriteClock,
    write_count: u64,
}

/// The shared tree with its subscribers
pub(crate) struct TreeCore {
    state: Mutex<TreeState>,
    subscribers: DashMap<String, broadcast::Sender<Option<Value>>>,
    capacity: usize,
    persist: Option<Box<dyn Persist>>,
}

impl TreeCore {
    pub(crate) fn new(capacity: usize) -> Self {
        Self::restore(Value::Object(Map::new()), 0, 0, capacity, None)
    }

    pub(crate) fn restore(
        root: Value,
        last_write_at: i64,
        write_count: u64,
        capacity: usize,
        persist: Option<Box<dyn Persist>>,
    ) -> Self {
        Self {
            state: Mutex::new(TreeState {
                root,
                clock: WriteClock {
                    last: last_write_at,
                },
                write_count,
            }),
            subscribers: DashMap::new(),
            capacity,
            persist,
        }
    }

    pub(crate) fn get(&self, path: &str) -> StoreResult<Option<Value>> {
        let segs = segments(path)?;
        let state = self.state.lock();
        Ok(get_at(&state.root, &segs).cloned())
    }

    pub(crate) fn set(&self, path: &str, value: Value) -> StoreResult<i64> {
        self.apply(vec![(segments(path)?, value)])
    }

    pub(crate) fn remove(&self, path: &str) -> StoreResult<()> {
        self.apply(vec![(segments(path)?, Value::Null)]).map(|_| ())
    }

    pub(crate) fn update(&self, path: &str, fields: Map<String, Value>) -> StoreResult<i64> {
        let base = segments(path)?;
        let mut writes = Vec::with_capacity(fields.len());
        for (key, value) in fields {
            let mut segs = base.clone();
            segs.extend(segments(&key)?);
            writes.push((segs, value));
        }
        self.apply(writes)
    }

    pub(crate) fn subscribe(&self, path: &str) -> StoreResult<Subscription> {
        let segs = segments(path)?;
        let key = segs.join("/");

        // Hold the tree lock so no write lands between snapshot and receiver.
        let state = self.state.lock();
        let initial = get_at(&state.root, &segs).cloned();
        let rx = self
            .subscribers
            .entry(key.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        drop(state);

        Ok(Subscription::new(key, initial, rx))
    }

    pub(crate) fn server_time(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    pub(crate) fn write_count(&self) -> u64 {
        self.state.lock().write_count
    }

    fn apply(&self, writes: Vec<(Vec<String>, Value)>) -> StoreResult<i64> {
        let mut state = self.state.lock();
        let write_at = state.clock.next();

        // Stage on a copy; the tree is untouched until persistence succeeds.
        let mut root = state.root.clone();
        let mut touched = BTreeSet::new();
        let mut changed = Vec::with_capacity(writes.len());
        for (segs, mut value) in writes {
            resolve_server_values(&mut value, write_at);
            match segs.first() {
                Some(top) => {
                    touched.insert(top.clone());
                    set_at(&mut root, &segs, value);
                }
                None => {
                    // A root write touches every key before and after it.
                    if let Some(map) = root.as_object() {
                        touched.extend(map.keys().cloned());
                    }
                    set_at(&mut root, &segs, value);
                    if let Some(map) = root.as_object() {
                        touched.extend(map.keys().cloned());
                    }
                }
            }
            changed.push(segs);
        }

        let write_count = state.write_count + 1;
        if let Some(persist) = &self.persist {
            let nodes: Vec<NodeWrite> = touched
                .into_iter()
                .map(|key| {
                    let node = root.get(key.as_str()).cloned();
                    (key, node)
                })
                .collect();
            persist.persist(&nodes, write_at, write_count)?;
        }

        state.root = root;
        state.write_count = write_count;

        // Drop channels nobody listens to any more.
        self.subscribers.retain(|_, tx| tx.receiver_count() > 0);

        for entry in self.subscribers.iter() {
            let sub_segs: Vec<String> = entry
                .key()
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if changed.iter().any(|segs| overlaps(segs, &sub_segs)) {
                trace!("Notifying subscribers of {}", entry.key());
                let _ = entry.value().send(get_at(&state.root, &sub_segs).cloned());
            }
        }

        Ok(write_at)
    }
}
