//! Store configuration (spec §6 configuration table).

use std::sync::Arc;
use std::time::Duration;

use crate::codec::RecordRef;
use crate::schema::RecordLayout;
use crate::delta::SnapshotMode;

/// Configuration for one [`crate::tree::FlatMap`] instance.
///
/// Built the way a `robt` or `bubt` config is: a `new()` with sane
/// defaults followed by `set_*` builders consumed and returned by value.
#[derive(Clone)]
pub struct StoreConfig<K> {
    /// Record type stored at leaves of this tree, bound against the
    /// registry the caller constructed.
    pub(crate) layout: Arc<RecordLayout>,
    /// Declared field slots, root-to-leaf, that make up the key. The
    /// tree's depth equals `key_slots.len()`.
    pub(crate) key_slots: Vec<usize>,
    /// How often the scheduler walks the tree looking for shards with
    /// pending work (spec §4.5: "periodic rebuild trigger").
    pub(crate) update_interval: Duration,
    pub(crate) snapshot_mode: SnapshotMode,
    /// Called once per incoming delta's decoded record view to decide
    /// whether it should be treated as a delete rather than a set (spec
    /// §4.3 step 5 / §6's `checkVForDelete?`, evaluated against the view
    /// exactly as `original_source/pkg/flatmap/update.go`'s
    /// `CheckVForDelete(vObj)` is — not against the key path: spec §9,
    /// Open Question 2 is about *scope* (incoming deltas only, never
    /// re-applied to shard residents at rebuild time), not about swapping
    /// the predicate's argument from value to key).
    pub(crate) check_for_delete: Option<Arc<dyn for<'a> Fn(&RecordRef<'a>) -> bool + Send + Sync>>,
    /// Soft ceiling, in bytes, above which a freshly rebuilt leaf buffer
    /// logs a size warning instead of failing (spec §4.3).
    pub(crate) leaf_size_warn_bytes: usize,
    pub(crate) name: String,
    _key: std::marker::PhantomData<fn() -> K>,
}

impl<K> StoreConfig<K> {
    pub const DEFAULT_LEAF_SIZE_WARN: usize = 1536 * 1024 * 1024; // 1.5GiB
    pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(100);

    /// New configuration for a store named `name`, holding records laid
    /// out by `layout`, keyed by `key_slots` (root-to-leaf order).
    pub fn new(name: &str, layout: Arc<RecordLayout>, key_slots: Vec<usize>) -> StoreConfig<K> {
        StoreConfig {
            layout,
            key_slots,
            update_interval: Self::DEFAULT_UPDATE_INTERVAL,
            snapshot_mode: SnapshotMode::Producer,
            check_for_delete: None,
            leaf_size_warn_bytes: Self::DEFAULT_LEAF_SIZE_WARN,
            name: name.to_string(),
            _key: std::marker::PhantomData,
        }
    }

    /// Override how often the background scheduler walks the tree
    /// looking for shards due a rebuild.
    pub fn set_update_interval(mut self, interval: Duration) -> StoreConfig<K> {
        self.update_interval = interval;
        self
    }

    /// Switch this store between emitting (`Producer`) and accepting
    /// (`Consumer`) shard snapshots. A store is one or the other for its
    /// whole lifetime.
    pub fn set_snapshot_mode(mut self, mode: SnapshotMode) -> StoreConfig<K> {
        self.snapshot_mode = mode;
        self
    }

    /// Install the predicate that classifies an incoming delta as a
    /// delete from its decoded record view. The engine does not interpret
    /// the predicate's decision beyond its boolean result.
    pub fn set_check_for_delete(
        mut self,
        pred: impl for<'a> Fn(&RecordRef<'a>) -> bool + Send + Sync + 'static,
    ) -> StoreConfig<K> {
        self.check_for_delete = Some(Arc::new(pred));
        self
    }

    /// Override the soft leaf-size ceiling that triggers a size-warning
    /// log line after rebuild (spec §4.3).
    pub fn set_leaf_size_warn_bytes(mut self, bytes: usize) -> StoreConfig<K> {
        self.leaf_size_warn_bytes = bytes;
        self
    }

    pub fn depth(&self) -> usize {
        self.key_slots.len()
    }
}
