use anyhow::{bail, Error};

use crate::page::DiskHashPage;

/// One cached key/value pair with its write-back state.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Later than the persistent page.
    pub dirty: bool,
    /// Must not be merged or evicted; the backing container is uncommitted.
    pub pinned: bool,
    /// The key existed in the persistent page when it was cached or last
    /// merged. Dirty entries with `on_disk == false` are dirty-new.
    pub on_disk: bool,
}

/// Cached form of one bucket page.
#[derive(Clone, Debug)]
pub struct CachePage {
    pub bucket_id: u64,
    pub entries: Vec<CacheEntry>,
    pub overflow: bool,
    /// Clock reference bit.
    pub used: bool,
    /// Second-chance bit for dirty pages.
    pub used2: bool,
}

impl CachePage {
    pub fn from_disk_page(bucket_id: u64, page: &DiskHashPage) -> Self {
        let entries = page
            .entries
            .iter()
            .map(|(key, value)| CacheEntry {
                key: key.clone(),
                value: value.clone(),
                dirty: false,
                pinned: false,
                on_disk: true,
            })
            .collect();
        Self {
            bucket_id,
            entries,
            overflow: page.overflow,
            used: true,
            used2: false,
        }
    }

    pub fn find(&self, key: &[u8]) -> Option<&CacheEntry> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    pub fn find_mut(&mut self, key: &[u8]) -> Option<&mut CacheEntry> {
        self.entries.iter_mut().find(|entry| entry.key == key)
    }

    /// Inserts or replaces a dirty entry. Returns true if a new dirty
    /// entry appeared (the key was absent or clean before).
    pub fn upsert_dirty(&mut self, key: &[u8], value: &[u8], pinned: bool) -> bool {
        self.used2 = true;
        if let Some(entry) = self.find_mut(key) {
            let was_clean = !entry.dirty;
            entry.value = value.to_vec();
            entry.dirty = true;
            entry.pinned = pinned;
            return was_clean;
        }
        self.entries.push(CacheEntry {
            key: key.to_vec(),
            value: value.to_vec(),
            dirty: true,
            pinned,
            on_disk: false,
        });
        true
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<CacheEntry> {
        let pos = self.entries.iter().position(|entry| entry.key == key)?;
        Some(self.entries.remove(pos))
    }

    pub fn is_dirty(&self) -> bool {
        self.entries.iter().any(|entry| entry.dirty)
    }

    pub fn is_pinned(&self) -> bool {
        self.entries.iter().any(|entry| entry.pinned)
    }

    pub fn dirty_count(&self) -> u64 {
        self.entries.iter().filter(|entry| entry.dirty).count() as u64
    }

    pub fn dirty_new_count(&self) -> u64 {
        self.entries
            .iter()
            .filter(|entry| entry.dirty && !entry.on_disk)
            .count() as u64
    }
}

/// The page slots of one lock stripe, evicted clock-wise.
pub struct CacheStripe {
    slots: Vec<Option<CachePage>>,
    next_victim: usize,
}

impl CacheStripe {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: (0..slot_count).map(|_| None).collect(),
            next_victim: 0,
        }
    }

    pub fn get_mut(&mut self, bucket_id: u64) -> Option<&mut CachePage> {
        for slot in self.slots.iter_mut().flatten() {
            if slot.bucket_id == bucket_id {
                slot.used = true;
                return Some(slot);
            }
        }
        None
    }

    pub fn contains(&self, bucket_id: u64) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|slot| slot.bucket_id == bucket_id)
    }

    pub fn remove(&mut self, bucket_id: u64) -> Option<CachePage> {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().map(|p| p.bucket_id) == Some(bucket_id) {
                return slot.take();
            }
        }
        None
    }

    /// Installs a page, evicting if necessary. Returns an evicted dirty
    /// page that the caller must write back (the stripe lock is held).
    pub fn insert(&mut self, page: CachePage) -> Result<Option<CachePage>, Error> {
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(page);
            return Ok(None);
        }
        let victim = self.find_victim()?;
        let evicted = self.slots[victim].take();
        self.slots[victim] = Some(page);
        match evicted {
            Some(old) if old.is_dirty() => Ok(Some(old)),
            _ => Ok(None),
        }
    }

    /// Clock scan: skip pinned slots, clear `used` on the first pass and
    /// `used2` (dirty pages only) on the second, take the first slot with
    /// both cleared. Fails when every slot is pinned.
    fn find_victim(&mut self) -> Result<usize, Error> {
        let slot_count = self.slots.len();
        for _ in 0..(3 * slot_count) {
            let idx = self.next_victim % slot_count;
            self.next_victim = (self.next_victim + 1) % slot_count;

            let page = match &mut self.slots[idx] {
                None => return Ok(idx),
                Some(page) => page,
            };
            if page.is_pinned() {
                continue;
            }
            if page.used {
                page.used = false;
                continue;
            }
            if page.is_dirty() && page.used2 {
                page.used2 = false;
                continue;
            }
            return Ok(idx);
        }
        bail!("cache eviction failed - all pages pinned");
    }

    pub fn pages(&self) -> impl Iterator<Item = &CachePage> {
        self.slots.iter().flatten()
    }

    pub fn pages_mut(&mut self) -> impl Iterator<Item = &mut CachePage> {
        self.slots.iter_mut().flatten()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn page(bucket_id: u64, dirty: bool, pinned: bool) -> CachePage {
        let mut page = CachePage::from_disk_page(bucket_id, &DiskHashPage::new(256));
        page.upsert_dirty(b"k", b"v", pinned);
        if !dirty && !pinned {
            page.entries[0].dirty = false;
        }
        page.used = false;
        page
    }

    #[test]
    fn free_slots_are_taken_first() {
        let mut stripe = CacheStripe::new(2);
        assert!(stripe.insert(page(1, false, false)).unwrap().is_none());
        assert!(stripe.insert(page(2, false, false)).unwrap().is_none());
        assert!(stripe.contains(1) && stripe.contains(2));
    }

    #[test]
    fn eviction_prefers_clean_pages() {
        let mut stripe = CacheStripe::new(2);
        stripe.insert(page(1, true, false)).unwrap();
        stripe.insert(page(2, false, false)).unwrap();

        // dirty page 1 gets a second chance via used2, clean page 2 goes
        let evicted = stripe.insert(page(3, false, false)).unwrap();
        assert!(evicted.is_none());
        assert!(stripe.contains(1));
        assert!(!stripe.contains(2));
    }

    #[test]
    fn dirty_eviction_returns_page_for_writeback() {
        let mut stripe = CacheStripe::new(1);
        stripe.insert(page(1, true, false)).unwrap();
        let evicted = stripe.insert(page(2, false, false)).unwrap();
        assert_eq!(evicted.unwrap().bucket_id, 1);
    }

    #[test]
    fn fully_pinned_stripe_fails() {
        let mut stripe = CacheStripe::new(2);
        stripe.insert(page(1, true, true)).unwrap();
        stripe.insert(page(2, true, true)).unwrap();
        assert!(stripe.insert(page(3, false, false)).is_err());
    }

    #[test]
    fn pinned_pages_are_skipped() {
        let mut stripe = CacheStripe::new(2);
        stripe.insert(page(1, true, true)).unwrap();
        stripe.insert(page(2, false, false)).unwrap();
        stripe.insert(page(3, false, false)).unwrap();
        assert!(stripe.contains(1));
        assert!(stripe.contains(3));
    }
}
