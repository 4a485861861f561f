//! Types exchanged across the store's write and snapshot boundaries
//! (spec §3: "Delta item", "Shard snapshot").

use std::sync::Arc;

use crate::schema::RecordLayout;

/// A single staged write, queued against a leaf until its next rebuild.
///
/// `buffer` holds exactly one packed record (see
/// [`crate::codec::TableBuilder::finish_single`]); keeping deltas in the
/// same wire shape as resident shard buffers means `set()` never needs to
/// round-trip through a [`crate::schema::MaterializedRecord`] before the
/// value reaches the rebuild engine.
#[derive(Clone)]
pub struct DeltaItem<K> {
    pub keys: Vec<K>,
    pub buffer: Arc<[u8]>,
    pub layout: Arc<RecordLayout>,
}

impl<K> DeltaItem<K> {
    pub fn new(keys: Vec<K>, buffer: Vec<u8>, layout: Arc<RecordLayout>) -> DeltaItem<K> {
        DeltaItem {
            keys,
            buffer: Arc::from(buffer),
            layout,
        }
    }
}

/// A deletion staged against a leaf, carrying only the key (spec §4.3:
/// "a delete delta need not carry a value").
#[derive(Clone)]
pub struct DeleteItem<K> {
    pub keys: Vec<K>,
}

/// The bulk transfer unit for an entire leaf shard (spec §4.6).
///
/// `buffer` is the leaf's full resident record list in the same packed
/// shape a [`crate::node::LeafView`] publishes internally, so a consumer
/// can adopt it directly without re-running the rebuild algorithm.
#[derive(Clone)]
pub struct ShardSnapshot<K> {
    /// Key components identifying which shard this snapshot belongs to,
    /// from the root down to (but excluding) the leaf itself.
    pub path: Vec<K>,
    pub buffer: Arc<[u8]>,
    pub layout: Arc<RecordLayout>,
}

/// Whether a store emits shard snapshots for another store to consume,
/// or accepts them (spec §4.6). A store is permanently one or the other;
/// there is no mixed mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// `get_snapshot` is available; `set_snapshot`/`initialize` return
    /// [`crate::error::Error::ConsumerOnly`].
    Producer,
    /// `set_snapshot`/`initialize` are available; `get_snapshot` returns
    /// [`crate::error::Error::ProducerOnly`].
    Consumer,
}
