//! The shard tree node state machine (spec §3 "Shard node", §4.3, §4.4).
//!
//! A node starts `Undecided`: it has received no key yet and does not
//! know whether it routes to children (`Inner`) or holds records
//! directly (`Leaf`). The first operation to reach it decides its kind
//! for the rest of its life — once decided, a node never changes kind
//! (spec invariant: "a node's kind, once decided, is permanent").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use arc_swap::ArcSwap;
use log::{debug, error, warn};

use crate::codec::{Buffer, TableBuilder};
use crate::delta::ShardSnapshot;
use crate::error::{Error, Result};
use crate::key::KeyComponent;
use crate::schema::{MaterializedRecord, RecordLayout};

/// A staged write or delete, queued at a leaf until its next rebuild.
/// `seq` orders queued operations against each other so a rebuild can
/// apply last-writer-wins even when a key was both set and deleted
/// between two rebuilds (spec §8, scenario 6).
struct QueuedDelta<K> {
    seq: u64,
    key: K,
    op: PendingOp,
}

enum PendingOp {
    Set { buffer: Arc<[u8]>, layout: Arc<RecordLayout> },
    Delete,
}

/// The published, immutable state of one leaf shard: a packed record
/// list plus an index from key to that record's table offset, built
/// once at rebuild (or snapshot-adoption) time and never mutated after
/// publication (spec §4.5: readers never block on a writer).
pub(crate) struct LeafView<K> {
    pub buffer: Arc<[u8]>,
    pub layout: Arc<RecordLayout>,
    pub index: HashMap<K, u32>,
}

impl<K: KeyComponent> LeafView<K> {
    fn empty(layout: Arc<RecordLayout>) -> LeafView<K> {
        let bytes = TableBuilder::new().finish_list(&[]);
        LeafView {
            buffer: Arc::from(bytes),
            layout,
            index: HashMap::new(),
        }
    }
}

struct LeafState<K> {
    view: ArcSwap<LeafView<K>>,
    seq: AtomicU64,
    pending: Mutex<Vec<QueuedDelta<K>>>,
    /// Held for the duration of one rebuild. A second tick that arrives
    /// while a rebuild is in flight *blocks* on this mutex rather than
    /// skipping its turn: `feed_delta_bulk`'s guarantee ("on return, its
    /// deltas are visible — one rebuild has been forced", spec §5) only
    /// holds if the caller either performs the rebuild itself or waits
    /// for a rebuild that is guaranteed to drain everything it enqueued
    /// before calling `tick`. Since every rebuild holds this same mutex
    /// while draining `pending`, and nothing drains `pending` without
    /// holding it, whichever caller next acquires the mutex after this
    /// one enqueued its items is guaranteed to observe them still queued
    /// (if no one else got there first) or already folded into a
    /// published buffer (if someone did) — either way visible by the
    /// time that caller's own `tick` returns.
    rebuilding: Mutex<()>,
}

impl<K: KeyComponent> LeafState<K> {
    fn new(layout: Arc<RecordLayout>) -> LeafState<K> {
        LeafState {
            view: ArcSwap::new(Arc::new(LeafView::empty(layout))),
            seq: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
            rebuilding: Mutex::new(()),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, key: K, op: PendingOp) {
        let seq = self.next_seq();
        self.pending.lock().unwrap().push(QueuedDelta { seq, key, op });
    }
}

struct InnerState<K> {
    children: RwLock<HashMap<K, Arc<ShardNode<K>>>>,
}

impl<K: KeyComponent> InnerState<K> {
    fn new() -> InnerState<K> {
        InnerState {
            children: RwLock::new(HashMap::new()),
        }
    }

    fn child(&self, key: &K) -> Arc<ShardNode<K>> {
        if let Some(child) = self.children.read().unwrap().get(key) {
            return child.clone();
        }
        let mut children = self.children.write().unwrap();
        children
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ShardNode::undecided()))
            .clone()
    }
}

enum NodeState<K> {
    Undecided,
    Inner(InnerState<K>),
    Leaf(LeafState<K>),
}

pub struct ShardNode<K> {
    state: RwLock<NodeState<K>>,
}

impl<K: KeyComponent> ShardNode<K> {
    pub fn undecided() -> ShardNode<K> {
        ShardNode {
            state: RwLock::new(NodeState::Undecided),
        }
    }

    /// Decide this node's kind from the number of key components still
    /// to be routed *below* it. `remaining == 1` means this node's
    /// children, addressed by the single remaining component, are the
    /// records themselves — so this node is a leaf. `remaining > 1`
    /// means there is at least one more routing level beneath it.
    /// `remaining == 0` reaching an undecided node is a contradiction:
    /// every node, decided or not, is addressed by exactly one key
    /// component from its parent, so there is always at least one
    /// component left to place a record by.
    fn decide(&self, remaining: usize, layout: &Arc<RecordLayout>) -> Result<()> {
        {
            let state = self.state.read().unwrap();
            if !matches!(*state, NodeState::Undecided) {
                return Ok(());
            }
        }
        if remaining == 0 {
            return Err(Error::DecidedTypeContradiction);
        }
        let mut state = self.state.write().unwrap();
        if matches!(*state, NodeState::Undecided) {
            *state = if remaining == 1 {
                NodeState::Leaf(LeafState::new(layout.clone()))
            } else {
                NodeState::Inner(InnerState::new())
            };
        }
        Ok(())
    }

    fn enqueue(&self, keys: &[K], op: PendingOp, layout: &Arc<RecordLayout>) -> Result<()> {
        self.decide(keys.len(), layout)?;
        let state = self.state.read().unwrap();
        match &*state {
            NodeState::Leaf(leaf) => {
                leaf.enqueue(keys[0].clone(), op);
                Ok(())
            }
            NodeState::Inner(inner) => {
                let child = inner.child(&keys[0]);
                drop(state);
                child.enqueue(&keys[1..], op, layout)
            }
            NodeState::Undecided => unreachable!("decide() always resolves Undecided above"),
        }
    }

    pub fn set(&self, keys: &[K], buffer: Arc<[u8]>, layout: &Arc<RecordLayout>) -> Result<()> {
        self.enqueue(
            keys,
            PendingOp::Set {
                buffer,
                layout: layout.clone(),
            },
            layout,
        )
    }

    pub fn delete(&self, keys: &[K], layout: &Arc<RecordLayout>) -> Result<()> {
        self.enqueue(keys, PendingOp::Delete, layout)
    }

    pub fn get(&self, keys: &[K]) -> Option<MaterializedRecord> {
        let state = self.state.read().unwrap();
        match &*state {
            NodeState::Undecided => None,
            NodeState::Leaf(leaf) => {
                let view = leaf.view.load();
                let offset = *view.index.get(&keys[0])?;
                let buf = Buffer::parse(&view.buffer).ok()?;
                Some(buf.record_at(offset, view.layout.clone()).unpack())
            }
            NodeState::Inner(inner) => {
                let child = {
                    let children = inner.children.read().unwrap();
                    children.get(&keys[0])?.clone()
                };
                child.get(&keys[1..])
            }
        }
    }

    /// Walk to the leaf addressed by `path` (root-to-leaf, excluding the
    /// leaf's own final key component) and return its full resident
    /// buffer as a snapshot (spec §4.3/§4.6, producer side).
    ///
    /// `deep = false` shares the live leaf's currently-published buffer
    /// via a cheap `Arc` clone; `deep = true` copies it into a freshly
    /// allocated buffer so the snapshot does not keep the live
    /// generation pinned in memory across the leaf's later rebuilds.
    pub fn get_snapshot(&self, path: &[K], layout: &Arc<RecordLayout>, deep: bool) -> ShardSnapshot<K> {
        if path.is_empty() {
            let state = self.state.read().unwrap();
            return match &*state {
                NodeState::Leaf(leaf) => {
                    let view = leaf.view.load();
                    let buffer = if deep {
                        Arc::from(view.buffer.to_vec())
                    } else {
                        view.buffer.clone()
                    };
                    ShardSnapshot {
                        path: Vec::new(),
                        buffer,
                        layout: view.layout.clone(),
                    }
                }
                _ => ShardSnapshot {
                    path: Vec::new(),
                    buffer: Arc::from(TableBuilder::new().finish_list(&[])),
                    layout: layout.clone(),
                },
            };
        }
        let child = {
            let state = self.state.read().unwrap();
            match &*state {
                NodeState::Inner(inner) => inner.children.read().unwrap().get(&path[0]).cloned(),
                _ => None,
            }
        };
        match child {
            Some(child) => {
                let mut snap = child.get_snapshot(&path[1..], layout, deep);
                snap.path.insert(0, path[0].clone());
                snap
            }
            None => ShardSnapshot {
                path: path.to_vec(),
                buffer: Arc::from(TableBuilder::new().finish_list(&[])),
                layout: layout.clone(),
            },
        }
    }

    /// Adopt an externally produced shard buffer at the leaf addressed
    /// by `path` (spec §4.6, consumer side). The new index is built from
    /// the incoming buffer in full before the leaf's published view is
    /// replaced, so a concurrent reader never observes a view whose
    /// fields were cleared ahead of the replacement landing (the
    /// ordering bug recorded in DESIGN.md's Open Questions).
    pub fn set_snapshot(&self, path: &[K], snapshot: &ShardSnapshot<K>, key_slot: usize) -> Result<()> {
        self.decide(path.len() + 1, &snapshot.layout)?;
        if path.is_empty() {
            let state = self.state.read().unwrap();
            return match &*state {
                NodeState::Leaf(leaf) => {
                    let buf = Buffer::parse(&snapshot.buffer)?;
                    let mut index = HashMap::new();
                    for i in 0..buf.list_len() {
                        let offset = buf.list_elem_offset(i);
                        let record = buf.record_at(offset, snapshot.layout.clone());
                        index.insert(K::read_from(&record, key_slot), offset);
                    }
                    leaf.view.store(Arc::new(LeafView {
                        buffer: snapshot.buffer.clone(),
                        layout: snapshot.layout.clone(),
                        index,
                    }));
                    Ok(())
                }
                _ => Err(Error::DecidedTypeContradiction),
            };
        }
        let state = self.state.read().unwrap();
        match &*state {
            NodeState::Inner(inner) => {
                let child = inner.child(&path[0]);
                drop(state);
                child.set_snapshot(&path[1..], snapshot, key_slot)
            }
            _ => Err(Error::DecidedTypeContradiction),
        }
    }

    /// Walk the subtree rooted at `self` once, rebuilding any leaf with
    /// pending work. Children of an inner node are ticked concurrently
    /// and the inner node's own tick does not return until every child
    /// has finished — spec §9's "parent waits for children" rebuild
    /// barrier, implemented with a scope rather than a join-per-child
    /// loop so a panicking child unwinds the whole scope instead of
    /// leaving siblings orphaned.
    ///
    /// `path` is the route of key components taken from the root to
    /// reach `self` (empty at the root); it is threaded down purely so a
    /// leaf's rebuild can name its own shard path and depth in the size
    /// warning log (spec §4.3).
    pub fn tick(&self, layout: &Arc<RecordLayout>, warn_bytes: usize, path: &[K]) -> Result<()> {
        let snapshot_children: Option<Vec<(K, Arc<ShardNode<K>>)>> = {
            let state = self.state.read().unwrap();
            match &*state {
                NodeState::Undecided => return Ok(()),
                NodeState::Leaf(_) => None,
                NodeState::Inner(inner) => Some(
                    inner
                        .children
                        .read()
                        .unwrap()
                        .iter()
                        .map(|(k, c)| (k.clone(), c.clone()))
                        .collect(),
                ),
            }
        };

        match snapshot_children {
            None => self.rebuild_leaf(layout, warn_bytes, path),
            Some(children) => {
                let results: Mutex<Vec<Result<()>>> = Mutex::new(Vec::with_capacity(children.len()));
                rayon::scope(|scope| {
                    for (key, child) in &children {
                        let mut child_path = path.to_vec();
                        child_path.push(key.clone());
                        scope.spawn(move |_| {
                            let result = child.tick(layout, warn_bytes, &child_path);
                            results.lock().unwrap().push(result);
                        });
                    }
                });
                for r in results.into_inner().unwrap() {
                    r?;
                }
                Ok(())
            }
        }
    }

    fn rebuild_leaf(&self, layout: &Arc<RecordLayout>, warn_bytes: usize, path: &[K]) -> Result<()> {
        let state = self.state.read().unwrap();
        let leaf = match &*state {
            NodeState::Leaf(leaf) => leaf,
            _ => return Ok(()),
        };

        // Block for a rebuild already in flight rather than skipping our
        // turn: see `LeafState::rebuilding`'s doc comment for why this is
        // required for `feed_delta_bulk`'s visibility guarantee.
        let _guard = leaf.rebuilding.lock().unwrap();

        let queued = std::mem::take(&mut *leaf.pending.lock().unwrap());
        if queued.is_empty() {
            // Either nothing was pending, or a rebuild we waited out
            // already drained it — its `store()` happened-before this
            // thread acquiring `_guard`, so it is visible to us now too.
            return Ok(());
        }

        // 1. Resolve last-writer-wins among everything queued since the
        //    previous rebuild.
        let mut winners: HashMap<K, QueuedDelta<K>> = HashMap::with_capacity(queued.len());
        for item in queued {
            match winners.get(&item.key) {
                Some(existing) if existing.seq > item.seq => {}
                _ => {
                    winners.insert(item.key.clone(), item);
                }
            }
        }

        // 2. Start from every resident the new generation still carries
        //    forward (residents with no queued op are untouched).
        let old = leaf.view.load();
        let old_buf = Buffer::parse(&old.buffer)?;
        let mut merged: HashMap<K, MaterializedRecord> = HashMap::with_capacity(old.index.len());
        for (key, &offset) in old.index.iter() {
            if !winners.contains_key(key) {
                merged.insert(key.clone(), old_buf.record_at(offset, old.layout.clone()).unpack());
            }
        }

        // 3. Apply the winning set/delete for every key that had one. A
        //    delta that fails to decode is logged and dropped rather than
        //    aborting the whole rebuild (spec §7: "the offending delta is
        //    dropped; the rebuild continues").
        for (key, item) in winners {
            match item.op {
                PendingOp::Delete => {
                    merged.remove(&key);
                }
                PendingOp::Set { buffer, layout: rec_layout } => {
                    let buf = match Buffer::parse(&buffer) {
                        Ok(buf) => buf,
                        Err(err) => {
                            error!(
                                target: "flatmap::node",
                                "dropping undecodable delta for key {:?}: {}",
                                key, err
                            );
                            continue;
                        }
                    };
                    let record = buf.single_record(rec_layout).unpack();
                    merged.insert(key, record);
                }
            }
        }

        // 4. Pack the merged record set into one fresh buffer and
        //    publish it in a single atomic swap.
        let mut keys: Vec<K> = merged.keys().cloned().collect();
        keys.sort();
        let mut builder = TableBuilder::with_capacity(old.buffer.len());
        let mut offsets = Vec::with_capacity(keys.len());
        let mut index = HashMap::with_capacity(keys.len());
        for key in keys {
            let record = merged.remove(&key).unwrap();
            let off = builder.pack_record(layout, &record.fields);
            index.insert(key, off);
            offsets.push(off);
        }
        let bytes = builder.finish_list(&offsets);
        let size = bytes.len();
        if size > warn_bytes {
            warn!(
                target: "flatmap::node",
                "leaf buffer grew to {} bytes, above the {}-byte soft ceiling, \
                 level: {}, path: {:?}, element count: {}, keys: {:?}",
                size, warn_bytes, path.len(), path, index.len(), path
            );
        }
        debug!(
            target: "flatmap::node",
            "rebuilt leaf: {} records, {} bytes, level: {}, path: {:?}",
            index.len(), size, path.len(), path
        );
        leaf.view.store(Arc::new(LeafView {
            buffer: Arc::from(bytes),
            layout: layout.clone(),
            index,
        }));
        Ok(())
    }
}
