//! The public store: a hierarchically sharded, in-memory, read-optimized
//! key-value map whose leaf values are periodically rebuilt into packed
//! binary record lists (spec §1, §6).

use std::sync::Arc;

use crate::codec::{Buffer, RecordRef, TableBuilder};
use crate::config::StoreConfig;
use crate::delta::{DeleteItem, DeltaItem, ShardSnapshot, SnapshotMode};
use crate::error::{Error, Result};
use crate::key::KeyComponent;
use crate::node::ShardNode;
use crate::scheduler::Scheduler;
use crate::schema::{MaterializedRecord, RecordLayout, Value};

/// A hierarchically sharded map. `K` is the type of one key component;
/// every key passed to this store is a `Vec<K>` of length equal to the
/// configured key arity (`StoreConfig::depth`).
pub struct FlatMap<K> {
    root: Arc<ShardNode<K>>,
    layout: Arc<RecordLayout>,
    key_slots: Vec<usize>,
    snapshot_mode: SnapshotMode,
    check_for_delete: Option<Arc<dyn for<'a> Fn(&RecordRef<'a>) -> bool + Send + Sync>>,
    warn_bytes: usize,
    scheduler: Scheduler,
}

impl<K: KeyComponent> FlatMap<K> {
    /// Build a new, empty store from `config` and start its background
    /// rebuild scheduler.
    pub fn new(config: StoreConfig<K>) -> FlatMap<K> {
        let root: Arc<ShardNode<K>> = Arc::new(ShardNode::undecided());
        let scheduler = Scheduler::spawn(
            root.clone(),
            config.layout.clone(),
            config.update_interval,
            config.leaf_size_warn_bytes,
        );
        FlatMap {
            root,
            layout: config.layout,
            key_slots: config.key_slots,
            snapshot_mode: config.snapshot_mode,
            check_for_delete: config.check_for_delete,
            warn_bytes: config.leaf_size_warn_bytes,
            scheduler,
        }
    }

    fn validate(&self, keys: &[K]) -> Result<()> {
        if keys.is_empty() || keys.len() != self.key_slots.len() {
            return Err(Error::EmptyKeys);
        }
        Ok(())
    }

    /// Look up one record by its full key path. Returns `None` if the
    /// key is absent or its shard has not yet received any data —
    /// lookups never block on a pending rebuild (spec §4.5).
    pub fn get(&self, keys: &[K]) -> Option<MaterializedRecord> {
        if keys.len() != self.key_slots.len() {
            return None;
        }
        self.root.get(keys)
    }

    /// Return every record of the leaf shard addressed by `prefix`
    /// (root-to-leaf, excluding the leaf's own per-record key
    /// component). `prefix` must be one shorter than the full key
    /// arity to name a single leaf exactly; any other length — or a
    /// prefix whose leaf has not decided yet — returns an empty batch
    /// rather than aggregating across shards (this store does not do
    /// range scans: see spec Non-goals).
    pub fn get_batch(&self, prefix: &[K]) -> Vec<MaterializedRecord> {
        if self.key_slots.is_empty() || prefix.len() + 1 != self.key_slots.len() {
            return Vec::new();
        }
        let snapshot = self.root.get_snapshot(prefix, &self.layout, false);
        match crate::codec::Buffer::parse(&snapshot.buffer) {
            Ok(buf) => (0..buf.list_len())
                .map(|i| {
                    let offset = buf.list_elem_offset(i);
                    buf.record_at(offset, snapshot.layout.clone()).unpack()
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Stage a write. The write is visible to readers only after the
    /// key's leaf shard next rebuilds (spec §5: "suspension points").
    pub fn set(&self, keys: Vec<K>, fields: Vec<Value>) -> Result<()> {
        self.validate(&keys)?;
        let mut builder = TableBuilder::new();
        let table_off = builder.pack_record(&self.layout, &fields);
        let buffer: Arc<[u8]> = Arc::from(builder.finish_single(table_off));
        self.stage_set_or_delete(keys, buffer, self.layout.clone())
    }

    pub fn delete(&self, keys: Vec<K>) -> Result<()> {
        self.validate(&keys)?;
        self.root.delete(&keys, &self.layout)
    }

    /// Route a just-packed delta to either `set` or `delete`, consulting
    /// `check_for_delete` (if configured) against the delta's *decoded
    /// record view* — spec §4.3 step 5 / §6's `checkVForDelete?`, the same
    /// argument `original_source/pkg/flatmap/update.go`'s
    /// `CheckVForDelete(vObj)` is given, not the key path.
    fn stage_set_or_delete(
        &self,
        keys: Vec<K>,
        buffer: Arc<[u8]>,
        layout: Arc<RecordLayout>,
    ) -> Result<()> {
        if self.is_delete(&buffer, &layout) {
            return self.root.delete(&keys, &self.layout);
        }
        self.root.set(&keys, buffer, &layout)
    }

    fn is_delete(&self, buffer: &[u8], layout: &Arc<RecordLayout>) -> bool {
        let pred = match &self.check_for_delete {
            Some(pred) => pred,
            None => return false,
        };
        match Buffer::parse(buffer) {
            Ok(buf) => pred(&buf.single_record(layout.clone())),
            Err(_) => false,
        }
    }

    /// Stage many writes and deletes in one call, then force an
    /// immediate rebuild of every touched leaf before returning: unlike
    /// `set`/`delete`, whose visibility waits for the scheduler's next
    /// tick, a bulk feed's deltas are guaranteed visible on return (spec
    /// §4.3, §5: "feedDeltaBulk is stronger... one rebuild has been
    /// forced"). Each item still routes to its own leaf independently;
    /// there is no cross-shard atomicity.
    pub fn feed_delta_bulk(&self, sets: Vec<(Vec<K>, Vec<Value>)>, deletes: Vec<Vec<K>>) -> Result<()> {
        if sets.is_empty() && deletes.is_empty() {
            return Err(Error::EmptyKeys);
        }
        for (keys, fields) in sets {
            self.set(keys, fields)?;
        }
        for keys in deletes {
            self.delete(keys)?;
        }
        self.root.tick(&self.layout, self.warn_bytes, &[])
    }

    /// Pack a [`DeltaItem`] the way [`FlatMap::set`] does internally, for
    /// callers staging deltas produced elsewhere (e.g. replayed from a
    /// log) without going through the `Vec<Value>` API. The packed buffer
    /// is handed to `check_for_delete` when the item is later fed via
    /// [`FlatMap::feed_delta_item`], exactly as a `set()`-originated
    /// buffer would be.
    pub fn pack_delta(&self, keys: Vec<K>, fields: Vec<Value>) -> DeltaItem<K> {
        let mut builder = TableBuilder::new();
        let table_off = builder.pack_record(&self.layout, &fields);
        DeltaItem::new(keys, builder.finish_single(table_off), self.layout.clone())
    }

    pub fn feed_delta_item(&self, item: DeltaItem<K>) -> Result<()> {
        self.validate(&item.keys)?;
        self.stage_set_or_delete(item.keys, item.buffer, item.layout)
    }

    pub fn feed_delete_item(&self, item: DeleteItem<K>) -> Result<()> {
        self.validate(&item.keys)?;
        self.root.delete(&item.keys, &self.layout)
    }

    /// Emit the full resident buffer of the leaf shard addressed by
    /// `path` (spec §4.3/§6 `getSnapshot(path, deepCopy)`). Only available
    /// on a store configured as [`SnapshotMode::Producer`].
    ///
    /// `deep = false` hands back a snapshot whose buffer is a cheap
    /// `Arc` clone of the live leaf's currently-published generation —
    /// valid, per spec §4.3, only until that leaf has cycled twice more,
    /// since a third rebuild drops the last strong reference this crate's
    /// `ArcSwap`-based publication (§4.5) is keeping alive on the
    /// caller's behalf. `deep = true` copies the buffer into freshly
    /// allocated, independently-owned bytes first, so the returned
    /// snapshot outlives any number of further rebuilds of the shard it
    /// was taken from — the shape spec §8 scenario 5 requires for a
    /// snapshot shipped to another store.
    pub fn get_snapshot(&self, path: Vec<K>, deep: bool) -> Result<ShardSnapshot<K>> {
        if self.snapshot_mode != SnapshotMode::Producer {
            return Err(Error::ProducerOnly);
        }
        Ok(self.root.get_snapshot(&path, &self.layout, deep))
    }

    /// Adopt a shard snapshot produced by another store (spec §4.6).
    /// Only available on a store configured as [`SnapshotMode::Consumer`].
    pub fn set_snapshot(&self, snapshot: ShardSnapshot<K>) -> Result<()> {
        if self.snapshot_mode != SnapshotMode::Consumer {
            return Err(Error::ConsumerOnly);
        }
        let key_slot = *self.key_slots.last().ok_or(Error::EmptyKeys)?;
        self.root.set_snapshot(&snapshot.path, &snapshot, key_slot)
    }

    /// Bulk-load a batch of shard snapshots, typically used to populate a
    /// freshly started consumer store before it starts taking live
    /// traffic.
    pub fn initialize(&self, snapshots: Vec<ShardSnapshot<K>>) -> Result<()> {
        if self.snapshot_mode != SnapshotMode::Consumer {
            return Err(Error::ConsumerOnly);
        }
        for snapshot in snapshots {
            self.set_snapshot(snapshot)?;
        }
        Ok(())
    }

    /// Stop the background scheduler and wait for its current tick to
    /// finish. Dropping a `FlatMap` does this automatically; call it
    /// directly only to observe the join before the value goes away.
    pub fn close_wait(&mut self) {
        self.scheduler.close_wait();
    }
}
