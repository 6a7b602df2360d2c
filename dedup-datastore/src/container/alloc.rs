use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use dedup_index::file::DataFile;

/// Physical location of a container blob.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ContainerAddress {
    pub file_index: u32,
    pub file_offset: u64,
}

/// Slots kept back for merge allocations so the container garbage
/// collector can always make progress under space pressure.
const MERGE_RESERVE: u64 = 2;

struct AllocState {
    bits: Vec<u8>,
    free_count: u64,
    next_search: u64,
}

/// Persistent bitmap of free container slots across the data files.
///
/// One bit per slot; a set bit means allocated. Changed bytes are written
/// through immediately, so the bitmap is authoritative after a restart
/// (modulo slots whose commit never reached the metadata index, which
/// startup verification releases again).
pub struct ContainerAllocator {
    bitmap: DataFile,
    container_size: u64,
    /// Slot count per data file.
    file_slots: Vec<u64>,
    total_slots: u64,
    state: Mutex<AllocState>,
}

impl ContainerAllocator {
    pub fn open<P: AsRef<Path>>(
        path: P,
        container_size: u64,
        file_slots: Vec<u64>,
        create: bool,
    ) -> Result<Self, Error> {
        let total_slots: u64 = file_slots.iter().sum();
        if total_slots == 0 {
            bail!("container allocator has no slots");
        }
        let bitmap_size = total_slots.div_ceil(8);
        let bitmap = DataFile::open(path, create)?;
        if bitmap.size()? < bitmap_size {
            bitmap.allocate(bitmap_size)?;
        }

        let mut bits = vec![0u8; bitmap_size as usize];
        if !create {
            bitmap.read_at(0, &mut bits)?;
        } else {
            bitmap.write_at(0, &bits)?;
        }
        let allocated: u64 = bits.iter().map(|b| b.count_ones() as u64).sum();

        Ok(Self {
            bitmap,
            container_size,
            file_slots,
            total_slots,
            state: Mutex::new(AllocState {
                bits,
                free_count: total_slots - allocated,
                next_search: 0,
            }),
        })
    }

    pub fn total_slots(&self) -> u64 {
        self.total_slots
    }

    pub fn free_count(&self) -> u64 {
        self.state.lock().unwrap().free_count
    }

    /// Physical address of a slot number.
    pub fn slot_address(&self, slot: u64) -> ContainerAddress {
        self.slot_to_address(slot)
    }

    fn slot_to_address(&self, slot: u64) -> ContainerAddress {
        let mut remaining = slot;
        for (file_index, count) in self.file_slots.iter().enumerate() {
            if remaining < *count {
                return ContainerAddress {
                    file_index: file_index as u32,
                    file_offset: remaining * self.container_size,
                };
            }
            remaining -= count;
        }
        unreachable!("slot {slot} out of range");
    }

    fn address_to_slot(&self, address: ContainerAddress) -> Result<u64, Error> {
        let file_index = address.file_index as usize;
        if file_index >= self.file_slots.len() {
            bail!("illegal container file index {}", address.file_index);
        }
        if address.file_offset % self.container_size != 0 {
            bail!("unaligned container offset {}", address.file_offset);
        }
        let in_file = address.file_offset / self.container_size;
        if in_file >= self.file_slots[file_index] {
            bail!("container offset {} out of range", address.file_offset);
        }
        Ok(self.file_slots[..file_index].iter().sum::<u64>() + in_file)
    }

    fn persist_slot(&self, bits: &[u8], slot: u64) -> Result<(), Error> {
        let byte = (slot / 8) as usize;
        self.bitmap.write_at(byte as u64, &bits[byte..byte + 1])
    }

    /// Allocates a slot. Non-merge requests fail once only the merge
    /// reserve is left; `None` means the store is full.
    pub fn allocate(&self, for_merge: bool) -> Result<Option<ContainerAddress>, Error> {
        let mut state = self.state.lock().unwrap();
        let reserve = if for_merge { 0 } else { MERGE_RESERVE };
        if state.free_count <= reserve {
            return Ok(None);
        }
        for probe in 0..self.total_slots {
            let slot = (state.next_search + probe) % self.total_slots;
            let byte = (slot / 8) as usize;
            let mask = 1u8 << (slot % 8);
            if state.bits[byte] & mask == 0 {
                state.bits[byte] |= mask;
                state.free_count -= 1;
                state.next_search = (slot + 1) % self.total_slots;
                let bits = state.bits.clone();
                drop(state);
                self.persist_slot(&bits, slot)?;
                return Ok(Some(self.slot_to_address(slot)));
            }
        }
        Ok(None)
    }

    pub fn free(&self, address: ContainerAddress) -> Result<(), Error> {
        let slot = self.address_to_slot(address)?;
        let mut state = self.state.lock().unwrap();
        let byte = (slot / 8) as usize;
        let mask = 1u8 << (slot % 8);
        if state.bits[byte] & mask == 0 {
            bail!("double free of container slot {slot}");
        }
        state.bits[byte] &= !mask;
        state.free_count += 1;
        let bits = state.bits.clone();
        drop(state);
        self.persist_slot(&bits, slot)
    }

    pub fn is_free(&self, address: ContainerAddress) -> Result<bool, Error> {
        let slot = self.address_to_slot(address)?;
        let state = self.state.lock().unwrap();
        let byte = (slot / 8) as usize;
        let mask = 1u8 << (slot % 8);
        Ok(state.bits[byte] & mask == 0)
    }

    /// Marks a slot allocated during startup verification.
    pub fn mark_allocated(&self, address: ContainerAddress) -> Result<(), Error> {
        let slot = self.address_to_slot(address)?;
        let mut state = self.state.lock().unwrap();
        let byte = (slot / 8) as usize;
        let mask = 1u8 << (slot % 8);
        if state.bits[byte] & mask == 0 {
            state.bits[byte] |= mask;
            state.free_count -= 1;
            let bits = state.bits.clone();
            drop(state);
            self.persist_slot(&bits, slot)?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<(), Error> {
        self.bitmap.sync()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::TestDir;

    #[test]
    fn allocate_free_cycle_persists() {
        let dir = TestDir::new("alloc-cycle");
        let path = dir.path().join("alloc.bitmap");

        let alloc = ContainerAllocator::open(&path, 4096, vec![4, 4], true).unwrap();
        assert_eq!(alloc.free_count(), 8);

        let a = alloc.allocate(false).unwrap().unwrap();
        let b = alloc.allocate(false).unwrap().unwrap();
        assert_ne!(a, b);
        assert_eq!(alloc.free_count(), 6);
        assert!(!alloc.is_free(a).unwrap());

        alloc.free(a).unwrap();
        assert_eq!(alloc.free_count(), 7);
        drop(alloc);

        // the free count survives the restart
        let alloc = ContainerAllocator::open(&path, 4096, vec![4, 4], false).unwrap();
        assert_eq!(alloc.free_count(), 7);
        assert!(alloc.is_free(a).unwrap());
        assert!(!alloc.is_free(b).unwrap());
    }

    #[test]
    fn merge_reserve_is_honored() {
        let dir = TestDir::new("alloc-reserve");
        let alloc =
            ContainerAllocator::open(dir.path().join("alloc.bitmap"), 512, vec![4], true).unwrap();

        assert!(alloc.allocate(false).unwrap().is_some());
        assert!(alloc.allocate(false).unwrap().is_some());
        // only the merge reserve is left now
        assert!(alloc.allocate(false).unwrap().is_none());
        assert!(alloc.allocate(true).unwrap().is_some());
        assert!(alloc.allocate(true).unwrap().is_some());
        assert!(alloc.allocate(true).unwrap().is_none());
    }

    #[test]
    fn addresses_map_across_files() {
        let dir = TestDir::new("alloc-addresses");
        let alloc =
            ContainerAllocator::open(dir.path().join("alloc.bitmap"), 1024, vec![2, 3], true)
                .unwrap();

        let mut addresses = Vec::new();
        while let Some(address) = alloc.allocate(true).unwrap() {
            addresses.push(address);
        }
        assert_eq!(addresses.len(), 5);
        assert_eq!(addresses.iter().filter(|a| a.file_index == 0).count(), 2);
        assert_eq!(addresses.iter().filter(|a| a.file_index == 1).count(), 3);
        assert!(addresses
            .iter()
            .all(|a| a.file_offset % 1024 == 0 && a.file_offset < 3 * 1024));

        alloc.free(addresses[3]).unwrap();
        assert!(alloc.free(addresses[3]).is_err());
    }
}
