use anyhow::{bail, Error};

/// Fixed page header prefix: entry count (u32), flags (u8), crc32 (u32).
pub const PAGE_HEADER_SIZE: usize = 4 + 1 + 4;

const PAGE_FLAG_OVERFLOW: u8 = 1;

/// In-memory form of one hash bucket page.
///
/// The serialized page is a header followed by packed
/// `(key_size, value_size, key, value)` entries. The serialized size must
/// never exceed the configured page size; insertions that would overflow
/// the page are routed to the overflow area by the index.
#[derive(Clone, Debug)]
pub struct DiskHashPage {
    page_size: usize,
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    /// Set once an insertion was displaced to the overflow area. Lookups
    /// and deletes must consult the overflow area when this is set.
    pub overflow: bool,
}

impl DiskHashPage {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            entries: Vec::new(),
            overflow: false,
        }
    }

    /// Parses a page buffer. An all-zero header denotes a never-written
    /// page and is valid regardless of the checksum setting.
    pub fn parse(buf: &[u8], verify_crc: bool) -> Result<Self, Error> {
        if buf.len() < PAGE_HEADER_SIZE {
            bail!("page buffer too small ({} bytes)", buf.len());
        }
        let entry_count = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let flags = buf[4];
        let crc = u32::from_le_bytes(buf[5..9].try_into().unwrap());

        let mut page = DiskHashPage::new(buf.len());
        page.overflow = flags & PAGE_FLAG_OVERFLOW != 0;

        if entry_count == 0 && flags == 0 {
            return Ok(page);
        }

        if verify_crc {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&buf[PAGE_HEADER_SIZE..]);
            let computed = hasher.finalize();
            if computed != crc {
                bail!("page crc mismatch (stored {crc:08x}, computed {computed:08x})");
            }
        }

        let mut pos = PAGE_HEADER_SIZE;
        for _ in 0..entry_count {
            if pos + 8 > buf.len() {
                bail!("page entry directory truncated");
            }
            let key_size = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            let value_size = u32::from_le_bytes(buf[pos + 4..pos + 8].try_into().unwrap()) as usize;
            pos += 8;
            if pos + key_size + value_size > buf.len() {
                bail!("page entry data truncated");
            }
            let key = buf[pos..pos + key_size].to_vec();
            pos += key_size;
            let value = buf[pos..pos + value_size].to_vec();
            pos += value_size;
            page.entries.push((key, value));
        }
        Ok(page)
    }

    /// Serialized byte size of the current entry set.
    pub fn byte_size(&self) -> usize {
        PAGE_HEADER_SIZE
            + self
                .entries
                .iter()
                .map(|(k, v)| 8 + k.len() + v.len())
                .sum::<usize>()
    }

    /// True if an entry of the given sizes still fits into the page.
    pub fn fits(&self, key_size: usize, value_size: usize) -> bool {
        self.byte_size() + 8 + key_size + value_size <= self.page_size
    }

    pub fn serialize(&self, checksum: bool) -> Result<Vec<u8>, Error> {
        if self.byte_size() > self.page_size {
            bail!(
                "serialized page size {} exceeds page size {}",
                self.byte_size(),
                self.page_size
            );
        }
        let mut buf = vec![0u8; self.page_size];
        buf[0..4].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        buf[4] = if self.overflow { PAGE_FLAG_OVERFLOW } else { 0 };

        let mut pos = PAGE_HEADER_SIZE;
        for (key, value) in &self.entries {
            buf[pos..pos + 4].copy_from_slice(&(key.len() as u32).to_le_bytes());
            buf[pos + 4..pos + 8].copy_from_slice(&(value.len() as u32).to_le_bytes());
            pos += 8;
            buf[pos..pos + key.len()].copy_from_slice(key);
            pos += key.len();
            buf[pos..pos + value.len()].copy_from_slice(value);
            pos += value.len();
        }

        if checksum {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&buf[PAGE_HEADER_SIZE..]);
            buf[5..9].copy_from_slice(&hasher.finalize().to_le_bytes());
        }
        Ok(buf)
    }

    pub fn find(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Inserts or replaces. Returns true if the key was new.
    pub fn upsert(&mut self, key: &[u8], value: &[u8]) -> bool {
        for entry in self.entries.iter_mut() {
            if entry.0 == key {
                entry.1 = value.to_vec();
                return false;
            }
        }
        self.entries.push((key.to_vec(), value.to_vec()));
        true
    }

    /// Removes the key. Returns true if it was present.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        self.entries.len() != before
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_round_trip_with_crc() {
        let mut page = DiskHashPage::new(4096);
        assert!(page.upsert(b"alpha", b"1"));
        assert!(page.upsert(b"beta", b"2"));
        assert!(!page.upsert(b"alpha", b"3"));

        let buf = page.serialize(true).unwrap();
        assert_eq!(buf.len(), 4096);

        let parsed = DiskHashPage::parse(&buf, true).unwrap();
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.find(b"alpha"), Some(&b"3"[..]));
        assert_eq!(parsed.find(b"beta"), Some(&b"2"[..]));
        assert_eq!(parsed.find(b"gamma"), None);
    }

    #[test]
    fn zero_page_is_empty() {
        let buf = vec![0u8; 512];
        let page = DiskHashPage::parse(&buf, true).unwrap();
        assert!(page.entries.is_empty());
        assert!(!page.overflow);
    }

    #[test]
    fn crc_mismatch_detected() {
        let mut page = DiskHashPage::new(512);
        page.upsert(b"key", b"value");
        let mut buf = page.serialize(true).unwrap();
        buf[PAGE_HEADER_SIZE + 9] ^= 0xff;
        assert!(DiskHashPage::parse(&buf, true).is_err());
        // without verification the corruption goes unnoticed
        assert!(DiskHashPage::parse(&buf, false).is_ok());
    }

    #[test]
    fn fits_respects_page_size() {
        let mut page = DiskHashPage::new(64);
        assert!(page.fits(8, 8));
        page.upsert(&[1u8; 8], &[2u8; 8]);
        assert!(!page.fits(20, 30));
        assert!(page.serialize(false).is_ok());
    }

    #[test]
    fn oversized_page_rejected() {
        let mut page = DiskHashPage::new(32);
        page.upsert(&[1u8; 30], &[2u8; 30]);
        assert!(page.serialize(false).is_err());
    }
}
