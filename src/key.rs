//! Type-erased keys and values used at the [`Source`](crate::Source) trait
//! boundary, so a [`Loader`](crate::Loader) can hold sources with different
//! concrete key/value types side by side under a single string name.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

trait ErasedKey: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn ErasedKey) -> bool;
    fn dyn_hash(&self, state: &mut dyn Hasher);
}

impl<T> ErasedKey for T
where
    T: Any + Eq + Hash + Send + Sync + fmt::Debug,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn ErasedKey) -> bool {
        match other.as_any().downcast_ref::<T>() {
            Some(other) => self == other,
            None => false,
        }
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        self.hash(&mut state);
    }
}

/// A type-erased, hashable key. Any `T: Eq + Hash + Send + Sync + Debug +
/// 'static` can be wrapped; two `DynKey`s are equal only if they wrap the
/// same concrete type and that type's values compare equal.
#[derive(Clone)]
pub struct DynKey(Arc<dyn ErasedKey>);

impl DynKey {
    /// Wrap a concrete key value.
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Eq + Hash + Send + Sync + fmt::Debug,
    {
        DynKey(Arc::new(value))
    }

    /// Attempt to recover the concrete key type this `DynKey` was built
    /// from.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }
}

impl fmt::Debug for DynKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq for DynKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(other.0.as_ref())
    }
}

impl Eq for DynKey {}

impl Hash for DynKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Mix in the concrete type's identity so two different types that
        // happen to hash the same underlying bytes don't collide silently.
        self.0.as_any().type_id().hash(state);
        self.0.dyn_hash(state);
    }
}

/// A type-erased value, recovered by the source that produced it via
/// [`DynValue::downcast_ref`]. Unlike [`DynKey`], values don't need to be
/// hashable — only cloneable-by-reference, which `Arc` gives for free.
#[derive(Clone)]
pub struct DynValue(Arc<dyn Any + Send + Sync>);

impl DynValue {
    /// Wrap a concrete value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        DynValue(Arc::new(value))
    }

    /// Attempt to recover the concrete value type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Attempt to recover an owned copy of the concrete value type.
    pub fn downcast<T: Any + Clone>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }
}

impl fmt::Debug for DynValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynValue").finish_non_exhaustive()
    }
}
