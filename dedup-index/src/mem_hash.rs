use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::{bail, Error};

use crate::{IndexIterator, PersistentIndex, PutResult};

/// Volatile map behind the [PersistentIndex] interface.
///
/// Used as a low-traffic overflow stand-in and as a test double; it keeps
/// nothing across restarts.
#[derive(Default)]
pub struct MemHashIndex {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    version: std::sync::atomic::AtomicU64,
}

impl MemHashIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemHashIterator<'a> {
    index: &'a MemHashIndex,
    version: u64,
    entries: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl IndexIterator for MemHashIterator<'_> {
    fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error> {
        let current = self
            .index
            .version
            .load(std::sync::atomic::Ordering::SeqCst);
        if current != self.version {
            bail!("concurrent modification during index iteration");
        }
        Ok(self.entries.next())
    }
}

impl PersistentIndex for MemHashIndex {
    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.map.read().unwrap().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.map
            .write()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
        self.version
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<PutResult, Error> {
        let mut map = self.map.write().unwrap();
        if map.contains_key(key) {
            return Ok(PutResult::Keep);
        }
        map.insert(key.to_vec(), value.to_vec());
        self.version
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(PutResult::Ok)
    }

    fn delete(&self, key: &[u8]) -> Result<bool, Error> {
        let removed = self.map.write().unwrap().remove(key).is_some();
        if removed {
            self.version
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        Ok(removed)
    }

    fn iterate(&self) -> Result<Box<dyn IndexIterator + '_>, Error> {
        let entries: Vec<_> = self
            .map
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(MemHashIterator {
            index: self,
            version: self.version.load(std::sync::atomic::Ordering::SeqCst),
            entries: entries.into_iter(),
        }))
    }

    fn item_count(&self) -> u64 {
        self.map.read().unwrap().len() as u64
    }

    fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn basic_operations() {
        let index = MemHashIndex::new();
        assert!(index.lookup(b"a").unwrap().is_none());
        index.put(b"a", b"1").unwrap();
        assert_eq!(index.lookup(b"a").unwrap().unwrap(), b"1");
        assert_eq!(index.put_if_absent(b"a", b"2").unwrap(), PutResult::Keep);
        assert_eq!(index.put_if_absent(b"b", b"2").unwrap(), PutResult::Ok);
        assert_eq!(index.item_count(), 2);
        assert!(index.delete(b"a").unwrap());
        assert!(!index.delete(b"a").unwrap());
    }

    #[test]
    fn iterator_fails_on_concurrent_modification() {
        let index = MemHashIndex::new();
        index.put(b"a", b"1").unwrap();
        index.put(b"b", b"2").unwrap();

        let mut iter = index.iterate().unwrap();
        assert!(iter.next_entry().unwrap().is_some());
        index.put(b"c", b"3").unwrap();
        assert!(iter.next_entry().is_err());
    }
}
