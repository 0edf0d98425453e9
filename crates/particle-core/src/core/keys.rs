use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::trace;

use super::attributes::{AttributeColumns, AttributeTable, ObjectRef};
use super::ids::ParticleIndex;

/// The value category an attribute key belongs to.
///
/// Each category has its own independent name space: `FloatKey::new("x")` and
/// `IntKey::new("x")` are unrelated keys indexing unrelated columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Float,
    Int,
    String,
    Particle,
    Object,
    Floats,
    Ints,
    Strings,
    Particles,
    Objects,
}

impl Category {
    pub const COUNT: usize = 10;

    pub const ALL: [Category; Category::COUNT] = [
        Category::Float,
        Category::Int,
        Category::String,
        Category::Particle,
        Category::Object,
        Category::Floats,
        Category::Ints,
        Category::Strings,
        Category::Particles,
        Category::Objects,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Float => "float",
            Category::Int => "int",
            Category::String => "string",
            Category::Particle => "particle",
            Category::Object => "object",
            Category::Floats => "floats",
            Category::Ints => "ints",
            Category::Strings => "strings",
            Category::Particles => "particles",
            Category::Objects => "objects",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("No {category} key has been registered with index {index}")]
    UnknownIndex { category: Category, index: usize },
}

#[derive(Debug, Default)]
struct Interner {
    names: Vec<String>,
    lookup: HashMap<String, u32>,
}

/// Process-wide name tables, one per category.
///
/// Initialized on first access through [`LazyLock`], so a key declared as a function-local
/// static can never observe an uninitialized registry. It is never reset.
struct KeyRegistry {
    categories: [RwLock<Interner>; Category::COUNT],
}

impl KeyRegistry {
    fn new() -> Self {
        Self {
            categories: std::array::from_fn(|_| RwLock::new(Interner::default())),
        }
    }

    fn intern(&self, category: Category, name: &str) -> u32 {
        let table = &self.categories[category.slot()];
        if let Some(&index) = table.read().lookup.get(name) {
            return index;
        }

        let mut table = table.write();
        // Another thread may have interned the name between the two locks.
        if let Some(&index) = table.lookup.get(name) {
            return index;
        }
        let index = table.names.len() as u32;
        table.names.push(name.to_string());
        table.lookup.insert(name.to_string(), index);
        trace!(%category, name, index, "Interned attribute key");
        index
    }

    fn name(&self, category: Category, index: u32) -> Option<String> {
        self.categories[category.slot()]
            .read()
            .names
            .get(index as usize)
            .cloned()
    }

    fn len(&self, category: Category) -> usize {
        self.categories[category.slot()].read().names.len()
    }
}

static REGISTRY: LazyLock<KeyRegistry> = LazyLock::new(KeyRegistry::new);

/// A value category of the attribute store.
///
/// Implemented by the zero-sized marker types below; each marker ties a [`Category`] to the
/// Rust type stored in its columns and to the table holding them.
pub trait AttributeType: 'static {
    type Value: Clone + PartialEq + fmt::Debug;
    const CATEGORY: Category;

    #[doc(hidden)]
    fn table(columns: &AttributeColumns) -> &AttributeTable<Self::Value>;
    #[doc(hidden)]
    fn table_mut(columns: &mut AttributeColumns) -> &mut AttributeTable<Self::Value>;
}

macro_rules! attribute_types {
    ($($marker:ident => $value:ty, $category:ident, $field:ident;)*) => {
        $(
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $marker {}

            impl AttributeType for $marker {
                type Value = $value;
                const CATEGORY: Category = Category::$category;

                fn table(columns: &AttributeColumns) -> &AttributeTable<$value> {
                    &columns.$field
                }

                fn table_mut(columns: &mut AttributeColumns) -> &mut AttributeTable<$value> {
                    &mut columns.$field
                }
            }
        )*
    };
}

attribute_types! {
    FloatType => f64, Float, floats;
    IntType => i64, Int, ints;
    StringType => String, String, strings;
    ParticleType => ParticleIndex, Particle, particles;
    ObjectType => ObjectRef, Object, objects;
    FloatsType => Vec<f64>, Floats, float_lists;
    IntsType => Vec<i64>, Ints, int_lists;
    StringsType => Vec<String>, Strings, string_lists;
    ParticlesType => Vec<ParticleIndex>, Particles, particle_lists;
    ObjectsType => Vec<ObjectRef>, Objects, object_lists;
}

/// An interned, typed handle naming one attribute column.
///
/// Keys are cheap to copy and compare. Two keys built from the same name in the same
/// category are always equal and index the same column.
pub struct Key<T: AttributeType> {
    index: u32,
    _type: PhantomData<fn() -> T>,
}

pub type FloatKey = Key<FloatType>;
pub type IntKey = Key<IntType>;
pub type StringKey = Key<StringType>;
pub type ParticleKey = Key<ParticleType>;
pub type ObjectKey = Key<ObjectType>;
pub type FloatsKey = Key<FloatsType>;
pub type IntsKey = Key<IntsType>;
pub type StringsKey = Key<StringsType>;
pub type ParticlesKey = Key<ParticlesType>;
pub type ObjectsKey = Key<ObjectsType>;

impl<T: AttributeType> Key<T> {
    /// Returns the key for `name`, interning it on first use.
    pub fn new(name: &str) -> Self {
        Self::from_raw(REGISTRY.intern(T::CATEGORY, name))
    }

    /// Rebuilds a key from a column index, failing for an index never handed out.
    pub fn from_index(index: usize) -> Result<Self, KeyError> {
        if index < REGISTRY.len(T::CATEGORY) {
            Ok(Self::from_raw(index as u32))
        } else {
            Err(KeyError::UnknownIndex {
                category: T::CATEGORY,
                index,
            })
        }
    }

    /// All keys registered so far in this category, in interning order.
    pub fn all() -> Vec<Self> {
        (0..REGISTRY.len(T::CATEGORY) as u32)
            .map(Self::from_raw)
            .collect()
    }

    pub fn category() -> Category {
        T::CATEGORY
    }

    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn name(self) -> String {
        self.erase().name()
    }

    pub fn erase(self) -> AnyKey {
        AnyKey {
            category: T::CATEGORY,
            index: self.index,
        }
    }

    pub(crate) fn from_raw(index: u32) -> Self {
        Self {
            index,
            _type: PhantomData,
        }
    }
}

impl<T: AttributeType> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: AttributeType> Copy for Key<T> {}

impl<T: AttributeType> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T: AttributeType> Eq for Key<T> {}

impl<T: AttributeType> Hash for Key<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T: AttributeType> PartialOrd for Key<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: AttributeType> Ord for Key<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T: AttributeType> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key<{}>(\"{}\")", T::CATEGORY, self.name())
    }
}

impl<T: AttributeType> fmt::Display for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A key with its category erased, used in diagnostics and dependency declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnyKey {
    pub category: Category,
    index: u32,
}

impl AnyKey {
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn name(self) -> String {
        REGISTRY
            .name(self.category, self.index)
            .unwrap_or_else(|| format!("<{} key {}>", self.category, self.index))
    }
}

impl<T: AttributeType> From<Key<T>> for AnyKey {
    fn from(key: Key<T>) -> Self {
        key.erase()
    }
}

impl fmt::Display for AnyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} key '{}'", self.category, self.name())
    }
}

/// Expands to a key that is interned once and then memoized in a function-local static.
///
/// ```
/// use particle_kernel::core::keys::FloatKey;
/// use particle_kernel::static_key;
///
/// fn radius_key() -> FloatKey {
///     static_key!(FloatKey, "radius")
/// }
/// assert_eq!(radius_key(), FloatKey::new("radius"));
/// ```
#[macro_export]
macro_rules! static_key {
    ($key:ty, $name:expr) => {{
        static KEY: ::std::sync::OnceLock<$key> = ::std::sync::OnceLock::new();
        *KEY.get_or_init(|| <$key>::new($name))
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn same_name_yields_equal_keys() {
        let a = FloatKey::new("keys_test_same");
        let b = FloatKey::new("keys_test_same");
        assert_eq!(a, b);
        assert_eq!(a.index(), b.index());
        assert_eq!(a.name(), "keys_test_same");
    }

    #[test]
    fn distinct_names_yield_distinct_keys() {
        let x = FloatKey::new("keys_test_x");
        let y = FloatKey::new("keys_test_y");
        assert_ne!(x, y);
        assert_eq!(x.name(), "keys_test_x");
        assert_eq!(y.name(), "keys_test_y");
    }

    #[test]
    fn categories_have_independent_name_spaces() {
        let float = FloatKey::new("keys_test_shared");
        let int = IntKey::new("keys_test_shared");
        assert_eq!(float.erase().category, Category::Float);
        assert_eq!(int.erase().category, Category::Int);
        assert_ne!(float.erase(), int.erase());
        assert_eq!(float.name(), int.name());
    }

    #[test]
    fn from_index_round_trips_registered_keys() {
        let key = StringKey::new("keys_test_round_trip");
        let rebuilt = StringKey::from_index(key.index()).unwrap();
        assert_eq!(rebuilt, key);
    }

    #[test]
    fn from_index_rejects_unregistered_index() {
        let err = IntsKey::from_index(usize::MAX).unwrap_err();
        assert_eq!(
            err,
            KeyError::UnknownIndex {
                category: Category::Ints,
                index: usize::MAX
            }
        );
    }

    #[test]
    fn all_contains_every_interned_key() {
        let key = ParticlesKey::new("keys_test_listed");
        assert!(ParticlesKey::all().contains(&key));
    }

    #[test]
    fn static_key_macro_memoizes_the_interned_handle() {
        fn memoized() -> ObjectKey {
            static_key!(ObjectKey, "keys_test_static")
        }
        assert_eq!(memoized(), memoized());
        assert_eq!(memoized(), ObjectKey::new("keys_test_static"));
    }

    #[test]
    fn display_and_debug_show_the_name() {
        let key = FloatKey::new("keys_test_display");
        assert_eq!(key.to_string(), "keys_test_display");
        assert_eq!(format!("{key:?}"), "Key<float>(\"keys_test_display\")");
        assert_eq!(key.erase().to_string(), "float key 'keys_test_display'");
    }

    proptest! {
        #[test]
        fn interning_is_idempotent_and_reversible(name in "[a-z_]{1,16}") {
            let a = FloatKey::new(&name);
            let b = FloatKey::new(&name);
            prop_assert_eq!(a, b);
            prop_assert_eq!(a.name(), name);
        }

        #[test]
        fn distinct_names_never_collide(a in "[a-z]{1,8}", b in "[A-Z]{1,8}") {
            prop_assert_ne!(IntKey::new(&a), IntKey::new(&b));
        }
    }
}
