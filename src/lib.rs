//! `flatmap` is a hierarchically sharded, in-memory, read-optimized
//! key-value store. Values are records of a single registered type
//! (see [`schema`]), packed into a random-access binary table so a read
//! never pays deserialization cost. Writes are staged against a leaf
//! shard and only become visible once that shard's periodic rebuild
//! folds them into a fresh, immutable generation (see [`node`], [`tree`]).
//!
//! A store is parametrized by one key component type `K` implementing
//! [`key::KeyComponent`]; a full key is an ordered `Vec<K>` whose length
//! equals the shard tree's depth.
//!
//! Schema parsing and code generation from an external `.flat` file are
//! out of scope here: callers describe a record type directly as a list
//! of [`schema::FieldDescriptor`], the way a generated module would.

pub mod codec;
pub mod config;
pub mod delta;
pub mod error;
pub mod key;
mod node;
mod scheduler;
pub mod schema;
pub mod tree;

pub use config::StoreConfig;
pub use delta::{DeleteItem, DeltaItem, ShardSnapshot, SnapshotMode};
pub use error::{Error, Result};
pub use key::KeyComponent;
pub use schema::{FieldDescriptor, FieldType, MaterializedRecord, RecordLayout, RecordRegistry, Value};
pub use tree::FlatMap;
