use serde::{Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

/// Textual form of the reserved implicit-root identity.
pub const RESERVED_ROOT_NAME: &str = "<_RootState_>";

/// Opaque identity of a state within a tree.
///
/// Keys are cheap to clone and compare by their textual identity only.
/// The reserved root name cannot be constructed through [`StateKey::new`],
/// which keeps the implicit root non-forgeable.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateKey(Arc<str>);

impl StateKey {
    /// Creates a key from a user-chosen name.
    ///
    /// # Panics
    ///
    /// Panics if `name` is the reserved implicit-root identity.
    pub fn new(name: impl AsRef<str>) -> Self {
        let name = name.as_ref();
        assert!(
            name != RESERVED_ROOT_NAME,
            "'{RESERVED_ROOT_NAME}' is reserved for the implicit root"
        );
        StateKey(Arc::from(name))
    }

    pub(crate) fn reserved_root() -> Self {
        StateKey(Arc::from(RESERVED_ROOT_NAME))
    }

    /// The textual form of this key.
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Whether this key identifies the implicit root.
    pub fn is_reserved_root(&self) -> bool {
        &*self.0 == RESERVED_ROOT_NAME
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateKey({})", self.0)
    }
}

impl Serialize for StateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Identity of a state whose instances carry a value of type `D`.
///
/// Equality and hashing are by the underlying [`StateKey`] only; `D` is a
/// compile-time witness used to type descriptor composition against the
/// state's data.
pub struct DataKey<D> {
    key: StateKey,
    _data: PhantomData<fn() -> D>,
}

impl<D> DataKey<D> {
    /// Creates a data key from a user-chosen name.
    ///
    /// # Panics
    ///
    /// Panics if `name` is the reserved implicit-root identity.
    pub fn new(name: impl AsRef<str>) -> Self {
        DataKey {
            key: StateKey::new(name),
            _data: PhantomData,
        }
    }

    pub(crate) fn from_key(key: StateKey) -> Self {
        DataKey {
            key,
            _data: PhantomData,
        }
    }

    /// The untyped identity of this state.
    pub fn key(&self) -> &StateKey {
        &self.key
    }
}

// Manual impls so `D` needs no bounds.
impl<D> Clone for DataKey<D> {
    fn clone(&self) -> Self {
        DataKey {
            key: self.key.clone(),
            _data: PhantomData,
        }
    }
}

impl<D> PartialEq for DataKey<D> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<D> Eq for DataKey<D> {}

impl<D> Hash for DataKey<D> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl<D> fmt::Debug for DataKey<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataKey({})", self.key.name())
    }
}

impl<D> fmt::Display for DataKey<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key.name())
    }
}

impl<D> From<DataKey<D>> for StateKey {
    fn from(key: DataKey<D>) -> Self {
        key.key
    }
}
