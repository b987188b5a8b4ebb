//! Sharded identifier-keyed map.
//!
//! Repositories with tens of millions of records make a single hash map
//! expensive to grow. [`ScopedIdTable`] splits its storage into 16 shards
//! selected by the last hex digit of the key, so each shard grows
//! independently.

use crate::error::{TransformError, TransformResult};
use reposync_repo::Id64;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

/// Number of shards in a [`ScopedIdTable`].
pub const SHARD_COUNT: usize = 16;

/// A key that selects a shard by the last digit of its hex rendering.
pub trait ShardKey {
    /// Shard index in `0..SHARD_COUNT`, or `None` if the key has no shard.
    fn shard(&self) -> Option<usize>;

    /// Rendering used in error messages.
    fn describe(&self) -> String;
}

impl ShardKey for Id64 {
    fn shard(&self) -> Option<usize> {
        Some(self.last_hex_digit())
    }

    fn describe(&self) -> String {
        self.to_hex()
    }
}

impl ShardKey for str {
    fn shard(&self) -> Option<usize> {
        match self.chars().last()? {
            c @ '0'..='9' => Some(c as usize - '0' as usize),
            c @ 'a'..='f' => Some(c as usize - 'a' as usize + 10),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

impl ShardKey for String {
    fn shard(&self) -> Option<usize> {
        self.as_str().shard()
    }

    fn describe(&self) -> String {
        self.clone()
    }
}

/// Map from identifiers to values, partitioned into 16 shards.
///
/// Iteration order is unspecified. The iterators borrow the table and
/// can be created again to restart.
#[derive(Debug, Clone)]
pub struct ScopedIdTable<K, V> {
    shards: Vec<HashMap<K, V>>,
    len: usize,
}

impl<K, V> ScopedIdTable<K, V>
where
    K: ShardKey + Eq + Hash,
{
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| HashMap::new()).collect(),
            len: 0,
        }
    }

    fn shard_of<Q>(&self, key: &Q) -> Option<&HashMap<K, V>>
    where
        Q: ShardKey + ?Sized,
    {
        key.shard().and_then(|index| self.shards.get(index))
    }

    /// Inserts or replaces the value for `key`, returning the previous one.
    ///
    /// Fails with `UnsupportedKey` if the key has no shard.
    pub fn set(&mut self, key: K, value: V) -> TransformResult<Option<V>> {
        let shard = key
            .shard()
            .and_then(|index| self.shards.get_mut(index))
            .ok_or_else(|| TransformError::UnsupportedKey {
                key: key.describe(),
            })?;
        let previous = shard.insert(key, value);
        if previous.is_none() {
            self.len += 1;
        }
        Ok(previous)
    }

    /// Returns the value for `key`.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ShardKey + Eq + Hash + ?Sized,
    {
        self.shard_of(key)?.get(key)
    }

    /// Returns a mutable reference to the value for `key`.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: ShardKey + Eq + Hash + ?Sized,
    {
        let index = key.shard()?;
        self.shards.get_mut(index)?.get_mut(key)
    }

    /// Returns true if `key` is present.
    pub fn has<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ShardKey + Eq + Hash + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Removes `key`, returning its value.
    pub fn delete<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ShardKey + Eq + Hash + ?Sized,
    {
        let index = key.shard()?;
        let removed = self.shards.get_mut(index)?.remove(key);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.shards.iter_mut().for_each(HashMap::clear);
        self.len = 0;
    }

    /// Number of shards holding at least one entry.
    pub fn occupied_shards(&self) -> usize {
        self.shards.iter().filter(|shard| !shard.is_empty()).count()
    }

    /// Iterates over the keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.shards.iter().flat_map(HashMap::keys)
    }

    /// Iterates over the values.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.shards.iter().flat_map(HashMap::values)
    }

    /// Iterates over the entries.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.shards.iter().flat_map(HashMap::iter)
    }
}

impl<V> ScopedIdTable<Id64, V> {
    /// Inserts or replaces the value for an identifier key, returning the
    /// previous one. Identifier keys always have a shard.
    pub fn insert(&mut self, key: Id64, value: V) -> Option<V> {
        let previous = self.shards[key.last_hex_digit()].insert(key, value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }
}

impl<K, V> Default for ScopedIdTable<K, V>
where
    K: ShardKey + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn ten_keys_spread_over_shards() {
        let mut table = ScopedIdTable::new();
        for value in 0x20u64..0x2a {
            table.set(Id64::new(value), value * 2).unwrap();
        }

        assert_eq!(table.len(), 10);
        assert!(table.occupied_shards() >= 2);
        assert_eq!(table.get(&Id64::new(0x25)), Some(&0x4a));

        let expected_keys: HashSet<Id64> = (0x20u64..0x2a).map(Id64::new).collect();
        let expected_values: HashSet<u64> = (0x20u64..0x2a).map(|v| v * 2).collect();
        let expected_entries: HashSet<(Id64, u64)> =
            (0x20u64..0x2a).map(|v| (Id64::new(v), v * 2)).collect();
        for _ in 0..2 {
            // iterators restart from the beginning
            assert_eq!(table.keys().copied().collect::<HashSet<_>>(), expected_keys);
            assert_eq!(table.values().copied().collect::<HashSet<_>>(), expected_values);
            assert_eq!(
                table.iter().map(|(k, v)| (*k, *v)).collect::<HashSet<_>>(),
                expected_entries
            );
        }
        assert_eq!(table.keys().count(), 10);
        assert_eq!(table.values().count(), 10);
        assert_eq!(table.iter().count(), 10);
    }

    #[test]
    fn identifier_insert_matches_set() {
        let mut table = ScopedIdTable::new();
        assert_eq!(table.insert(Id64::new(0x2f), 1), None);
        assert_eq!(table.insert(Id64::new(0x2f), 2), Some(1));
        table.set(Id64::new(0x30), 3).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&Id64::new(0x2f)), Some(&2));
        assert_eq!(table.delete(&Id64::new(0x30)), Some(3));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn string_keys() {
        let mut table: ScopedIdTable<String, u32> = ScopedIdTable::new();
        table.set("0x2a".to_string(), 1).unwrap();
        table.set("0x1f".to_string(), 2).unwrap();

        assert_eq!(table.get("0x2a"), Some(&1));
        assert!(table.has("0x1f"));
        assert_eq!(table.delete("0x1f"), Some(2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unsupported_keys() {
        let mut table: ScopedIdTable<String, u32> = ScopedIdTable::new();
        assert!(matches!(
            table.set("doc-17/sheet".to_string(), 1),
            Err(TransformError::UnsupportedKey { .. })
        ));
        assert!(matches!(
            table.set("0x2A".to_string(), 1),
            Err(TransformError::UnsupportedKey { .. })
        ));
        assert!(matches!(
            table.set(String::new(), 1),
            Err(TransformError::UnsupportedKey { .. })
        ));
        assert_eq!(table.get("zz"), None);
        assert!(!table.has("zz"));
        assert_eq!(table.delete("zz"), None);
        assert!(table.is_empty());
    }

    #[test]
    fn replace_keeps_len() {
        let mut table = ScopedIdTable::new();
        assert_eq!(table.set(Id64::new(0x31), "a").unwrap(), None);
        assert_eq!(table.set(Id64::new(0x31), "b").unwrap(), Some("a"));
        assert_eq!(table.len(), 1);

        *table.get_mut(&Id64::new(0x31)).unwrap() = "c";
        assert_eq!(table.get(&Id64::new(0x31)), Some(&"c"));

        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.occupied_shards(), 0);
    }

    proptest! {
        #[test]
        fn behaves_like_a_map(
            ops in proptest::collection::vec((1u64..200, any::<bool>()), 0..200)
        ) {
            let mut table = ScopedIdTable::new();
            let mut model = HashMap::new();
            for (value, insert) in ops {
                let id = Id64::new(value);
                if insert {
                    prop_assert_eq!(table.set(id, value).unwrap(), model.insert(id, value));
                } else {
                    prop_assert_eq!(table.delete(&id), model.remove(&id));
                }
                prop_assert_eq!(table.len(), model.len());
            }
            for (id, value) in &model {
                prop_assert_eq!(table.get(id), Some(value));
            }
            prop_assert_eq!(table.iter().count(), model.len());
        }
    }
}
