//! Error types returned by the `flatmap` store.

use std::{fmt, result};

/// Result type used throughout this crate.
pub type Result<T> = result::Result<T, Error>;

/// Error conditions raised by the shard tree, the record registry and the
/// buffer codec.
#[derive(Debug)]
pub enum Error {
    /// `set()`, `delete()`, `feed_delta_bulk()` or a snapshot path was
    /// called with an empty key list.
    EmptyKeys,
    /// A declared field has no bound accessor, or an enum field was
    /// declared over a non-integer type. Raised at registry construction.
    SchemaMismatch(String),
    /// `get_snapshot` called on a store configured in `SnapshotMode::Consumer`.
    ProducerOnly,
    /// `set_snapshot`/`initialize` called on a store configured in
    /// `SnapshotMode::Producer`.
    ConsumerOnly,
    /// A delta or snapshot buffer could not be decoded against the
    /// record registry it claims to belong to.
    InvalidBuffer(String),
    /// The first delta to reach an `Undecided` node carried zero key
    /// components; this is a programming error at the call site, not a
    /// data error, and callers should not retry.
    DecidedTypeContradiction,
    /// A slot index referenced by `key_slots` or by an accessor call
    /// falls outside the record's declared field list.
    SlotOutOfRange(usize),
    /// The rebuild thread pool or scheduler thread terminated
    /// unexpectedly; carries the panic message when one was available.
    ThreadFailure(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::EmptyKeys => write!(f, "operation called with no key components"),
            Error::SchemaMismatch(msg) => write!(f, "schema mismatch: {}", msg),
            Error::ProducerOnly => write!(f, "store is in consumer mode, cannot emit snapshot"),
            Error::ConsumerOnly => write!(f, "store is in producer mode, cannot accept snapshot"),
            Error::InvalidBuffer(msg) => write!(f, "invalid record buffer: {}", msg),
            Error::DecidedTypeContradiction => {
                write!(f, "first delta at an undecided node carried zero keys")
            }
            Error::SlotOutOfRange(slot) => write!(f, "field slot {} out of range", slot),
            Error::ThreadFailure(msg) => write!(f, "rebuild thread failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
