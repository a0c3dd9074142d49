//! Data structures for passing keys into a batch function and results back
//! out of it.

use std::collections::hash_map::{Entry, HashMap};
use std::hash::Hash;
use std::mem;
use std::num::NonZeroUsize;

use crate::key::{Id, Key};

/// Associates a pending handle with its key in one window. Tokens are only
/// meaningful for the KeySet that created them, and the ValueSet made from it.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Token(NonZeroUsize);

/// A set of keys passed into a batch function. Use the `keys` method to get
/// the set of keys, all of which will be unique, so that you can execute your
/// request. Then, use one of the `into_*` methods to transform your response
/// data into a ValueSet, which is handed back to the loader.
#[derive(Debug)]
pub struct KeySet<K: Eq + Hash> {
    // Tokens are created from the len of keys, so keys are never removed
    // from this table.
    keys: HashMap<K, Token>,
}

impl<K: Eq + Hash> KeySet<K> {
    pub(crate) fn new() -> Self {
        Self {
            keys: HashMap::new(),
        }
    }

    /// Check if there are any keys in this keyset
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Get the number of unique keys in this keyset.
    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Get an iterator over all the keys in this keyset. These are guaranteed
    /// to be:
    ///
    /// - Unique
    /// - Between 1 and the configured max_keys of the loader's BatchRules
    /// - In an arbitrary order
    pub fn keys(&self) -> impl Iterator<Item = &K> + Clone {
        self.keys.keys()
    }

    /// Check whether a key is part of this set.
    pub fn contains(&self, key: &K) -> bool {
        self.keys.contains_key(key)
    }

    /// After you've completed your request, use this method to pair each value
    /// in your result with its key. This (and its fallible sibling) is the
    /// only way to create a ValueSet, which guarantees that every key in the
    /// set gets exactly one value.
    pub fn into_values<V>(self, mut get_value: impl FnMut(&K) -> V) -> ValueSet<V> {
        let values = self
            .keys
            .into_iter()
            .map(move |(key, token)| (token, get_value(&key)))
            .collect();

        ValueSet { values }
    }

    /// Fallible version of into_values. Same as into_values, but will return
    /// an error the first time `get_value` returns an error.
    pub fn try_into_values<V, E>(
        self,
        mut get_value: impl FnMut(&K) -> Result<V, E>,
    ) -> Result<ValueSet<V>, E> {
        self.keys
            .into_iter()
            .map(move |(key, token)| Ok((token, get_value(&key)?)))
            .collect::<Result<HashMap<Token, V>, E>>()
            .map(|values| ValueSet { values })
    }

    /// Add a key to this KeySet, and return the token associated with that
    /// key. Adding a key that is already present returns the existing token.
    pub(crate) fn add_key(&mut self, key: K) -> Token {
        let next = self.keys.len() + 1;

        *self.keys.entry(key).or_insert_with(|| {
            // len + 1 is never zero
            Token(NonZeroUsize::new(next).unwrap_or(NonZeroUsize::MIN))
        })
    }

    /// Take the keyset out of this particular &mut self instance, replacing it
    /// with an empty set. Helper method for when a window is dispatched.
    pub(crate) fn take(&mut self) -> Self {
        Self {
            keys: mem::take(&mut self.keys),
        }
    }
}

impl<K: Eq + Hash + Clone> KeySet<K> {
    /// Snapshot of every (key, token) pair, taken before the set is handed to
    /// the batch function so the results can be written back per key.
    pub(crate) fn index(&self) -> Vec<(K, Token)> {
        self.keys
            .iter()
            .map(|(key, &token)| (key.clone(), token))
            .collect()
    }
}

impl KeySet<Key> {
    /// The raw ids of every key in this set.
    pub fn ids(&self) -> impl Iterator<Item = &Id> + Clone {
        self.keys().map(Key::id)
    }

    /// Shape the rows of a one-to-one relation. Each key is paired with the
    /// row whose id (as reported by `id_of`) matches it, or `None` if the
    /// backing store returned nothing for that id. If several rows share an
    /// id, the first one wins.
    pub fn into_one_to_one<R>(
        self,
        rows: impl IntoIterator<Item = R>,
        id_of: impl Fn(&R) -> Id,
    ) -> ValueSet<Option<R>> {
        let mut by_id: HashMap<Id, R> = HashMap::new();

        for row in rows {
            if let Entry::Vacant(entry) = by_id.entry(id_of(&row)) {
                entry.insert(row);
            }
        }

        self.into_values(move |key| by_id.remove(key.id()))
    }

    /// Shape the rows of a one-to-many relation. Rows are grouped by their
    /// join key (as reported by `id_of`), preserving the order in which they
    /// were returned; keys with no rows get an empty list. Rows for ids that
    /// were never requested are discarded.
    pub fn into_one_to_many<R>(
        self,
        rows: impl IntoIterator<Item = R>,
        id_of: impl Fn(&R) -> Id,
    ) -> ValueSet<Vec<R>> {
        let mut by_id: HashMap<Id, Vec<R>> = HashMap::new();

        for row in rows {
            by_id.entry(id_of(&row)).or_default().push(row);
        }

        self.into_values(move |key| by_id.remove(key.id()).unwrap_or_default())
    }
}

/// A value set is an opaque data structure that contains the result of a batch
/// operation. It is created from a KeySet, and is used by the loader to
/// distribute the values to the correct waiting handles.
#[derive(Debug)]
pub struct ValueSet<V> {
    values: HashMap<Token, V>,
}

impl<V> ValueSet<V> {
    pub(crate) fn empty() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn get(&self, token: Token) -> Option<&V> {
        self.values.get(&token)
    }
}
