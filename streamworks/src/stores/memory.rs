use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{PoisonError, RwLock};

use bytes::Bytes;

use super::Store;

/// Volatile in-process store, ordered by key. State does not survive a
/// restart; the table's changelog replay rebuilds it.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Bytes, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: Bytes, value: Bytes) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
    }

    fn del(&self, key: &[u8]) -> bool {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    fn iter(&self) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + '_> {
        Box::new(MemoryIter {
            store: self,
            cursor: None,
        })
    }

    fn clear(&self) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn len(&self) -> usize {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Cursor over the ordered map. Takes the lock per step instead of holding
/// it across the walk, so reads and writes proceed between items.
struct MemoryIter<'a> {
    store: &'a MemoryStore,
    cursor: Option<Bytes>,
}

impl Iterator for MemoryIter<'_> {
    type Item = (Bytes, Bytes);

    fn next(&mut self) -> Option<(Bytes, Bytes)> {
        let data = self
            .store
            .data
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = match &self.cursor {
            Some(last) => data
                .range((Bound::Excluded(last.clone()), Bound::Unbounded))
                .next(),
            None => data.iter().next(),
        };
        let (key, value) = entry?;
        let item = (key.clone(), value.clone());
        self.cursor = Some(item.0.clone());
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_del_roundtrip() {
        let store = MemoryStore::new();
        store.set(Bytes::from_static(b"k"), Bytes::from_static(b"v"));
        assert_eq!(store.get(b"k"), Some(Bytes::from_static(b"v")));
        assert_eq!(store.len(), 1);

        assert!(store.del(b"k"));
        assert!(!store.del(b"k"));
        assert_eq!(store.get(b"k"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn lookup_by_borrowed_slice() {
        // Bytes keys must be addressable by borrowed slices.
        let store = MemoryStore::new();
        store.set(Bytes::copy_from_slice(b"key"), Bytes::from_static(b"1"));
        assert_eq!(store.get(b"key".as_slice()), Some(Bytes::from_static(b"1")));
    }

    #[test]
    fn iter_walks_keys_in_order() {
        let store = MemoryStore::new();
        store.set(Bytes::from_static(b"b"), Bytes::from_static(b"2"));
        store.set(Bytes::from_static(b"a"), Bytes::from_static(b"1"));
        store.set(Bytes::from_static(b"c"), Bytes::from_static(b"3"));

        let keys: Vec<Bytes> = store.iter().map(|(key, _)| key).collect();
        assert_eq!(
            keys,
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c"),
            ]
        );
        assert_eq!(store.snapshot().len(), 3);
    }

    #[test]
    fn iter_releases_the_lock_between_items() {
        let store = MemoryStore::new();
        store.set(Bytes::from_static(b"a"), Bytes::from_static(b"1"));
        store.set(Bytes::from_static(b"c"), Bytes::from_static(b"3"));

        let mut iter = store.iter();
        let (first, _) = iter.next().unwrap();
        assert_eq!(first, Bytes::from_static(b"a"));

        // Writing while the cursor is parked must not deadlock. Keys past
        // the cursor show up, keys behind it do not.
        store.set(Bytes::from_static(b"b"), Bytes::from_static(b"2"));
        store.set(Bytes::from_static(b"0"), Bytes::from_static(b"0"));

        let rest: Vec<Bytes> = iter.map(|(key, _)| key).collect();
        assert_eq!(rest, vec![Bytes::from_static(b"b"), Bytes::from_static(b"c")]);
    }
}
