//! Keys identify one entity of one relation.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

/// The raw id of an entity. Ids of different types never compare equal, even
/// when they print the same (`Id::Int(1)` and `Id::Str("1")` are distinct
/// keys).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Id {
    Int(i64),
    Str(Arc<str>),
}

impl Id {
    /// Get the integer value of this id, if it is an integer id.
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match *self {
            Id::Int(id) => Some(id),
            Id::Str(..) => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Id::Int(..) => None,
            Id::Str(id) => Some(id),
        }
    }
}

/// The canonical form of an id. Integers print as `i:<n>`; strings print as
/// `s<len>:<str>`, where `len` is the byte length of the string. The type tag
/// and the length prefix make the form injective: no two distinct ids share a
/// canonical string.
impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Id::Int(id) => write!(f, "i:{}", id),
            Id::Str(id) => write!(f, "s{}:{}", id.len(), id),
        }
    }
}

impl From<i64> for Id {
    fn from(id: i64) -> Self {
        Id::Int(id)
    }
}

impl From<i32> for Id {
    fn from(id: i32) -> Self {
        Id::Int(id.into())
    }
}

impl From<u32> for Id {
    fn from(id: u32) -> Self {
        Id::Int(id.into())
    }
}

impl From<&str> for Id {
    fn from(id: &str) -> Self {
        Id::Str(id.into())
    }
}

impl From<String> for Id {
    fn from(id: String) -> Self {
        Id::Str(id.into())
    }
}

/// "One entity of relation `relation`, by `id`". Keys are immutable, and two
/// keys are the same cache slot exactly when their relation names and ids
/// are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    relation: &'static str,
    id: Id,
}

impl Key {
    pub fn new(relation: &'static str, id: impl Into<Id>) -> Self {
        Self {
            relation,
            id: id.into(),
        }
    }

    #[inline]
    pub fn relation(&self) -> &'static str {
        self.relation
    }

    #[inline]
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// The canonical string form of this key: `<relation>:<id>`.
    ///
    /// The form is injective for keys built by a [`Catalog`][crate::Catalog],
    /// which only accepts relation names made of `[A-Za-z0-9_]`, so the
    /// first `:` always ends the relation name. A [`Loader`][crate::Loader]
    /// built directly under a name containing `:` can produce two keys with
    /// the same canonical form. Cache slots compare the relation and the id
    /// themselves, so such keys still never share a slot.
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.relation, self.id)
    }
}

/// Check that a relation name is safe to use as the prefix of a canonical key.
pub(crate) fn is_valid_relation_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}
