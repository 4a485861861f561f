//! `KeyComponent` binds a native Rust type to a single declared field slot so
//! it can be pulled straight out of a record view without an intermediate
//! [`crate::schema::Value`] allocation.
//!
//! A store's key is an ordered sequence of components of one comparable
//! type; the type is fixed for the lifetime of the store and equals the
//! depth of the shard tree (the key arity).

use crate::codec::RecordRef;

/// A type usable as a key component.
///
/// Implemented for the handful of scalar types that make sensible shard
/// keys. Bounded strings are supported via `String`/`Box<str>`; unbounded
/// blobs are deliberately not, since they would defeat hashing.
pub trait KeyComponent: Clone + Eq + std::hash::Hash + Ord + fmt_debug::Debug + Send + Sync + 'static {
    /// Read this component out of `view` at the given field slot.
    fn read_from(view: &RecordRef<'_>, slot: usize) -> Self;
}

// re-export so the trait bound above does not force every caller to
// `use std::fmt::Debug` just to name `KeyComponent`.
mod fmt_debug {
    pub use std::fmt::Debug;
}

macro_rules! impl_key_component_int {
    ($t:ty, $getter:ident) => {
        impl KeyComponent for $t {
            fn read_from(view: &RecordRef<'_>, slot: usize) -> Self {
                view.$getter(slot)
            }
        }
    };
}

impl_key_component_int!(bool, get_bool);
impl_key_component_int!(i8, get_i8);
impl_key_component_int!(i16, get_i16);
impl_key_component_int!(i32, get_i32);
impl_key_component_int!(i64, get_i64);
impl_key_component_int!(u8, get_u8);
impl_key_component_int!(u16, get_u16);
impl_key_component_int!(u32, get_u32);
impl_key_component_int!(u64, get_u64);

impl KeyComponent for String {
    fn read_from(view: &RecordRef<'_>, slot: usize) -> Self {
        view.get_str(slot).to_string()
    }
}
