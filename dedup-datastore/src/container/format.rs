use std::io::{Read, Write};

use anyhow::{bail, format_err, Context, Error};

use dedup_api_types::{CompressionType, Fingerprint, FINGERPRINT_SIZE};

/// magic (u32), container id (u64), item count (u32), active data size
/// (u32), stored data size (u32), flags (u8), compression tag (u8),
/// crc32 (u32)
pub const CONTAINER_HEADER_SIZE: usize = 4 + 8 + 4 + 4 + 4 + 1 + 1 + 4;

pub const CONTAINER_MAGIC: u32 = 0x3143_4444; // "DDC1"

const CONTAINER_FLAG_CRC: u8 = 1;

/// fingerprint, offset (u32), size (u32), flags (u8)
const ITEM_DIRECTORY_ENTRY_SIZE: usize = FINGERPRINT_SIZE + 4 + 4 + 1;

const ITEM_FLAG_DELETED: u8 = 1;

/// One chunk stored in a container.
#[derive(Clone, Debug)]
pub struct ContainerItem {
    pub fingerprint: Fingerprint,
    pub payload: Vec<u8>,
    pub deleted: bool,
}

/// A fixed-size blob packing chunk payloads.
///
/// The serialized form is the header, the item directory and the packed
/// payloads; directory and payloads are compressed as one region when the
/// codec shrinks them. Item offsets are relative to the region start.
#[derive(Clone, Debug)]
pub struct Container {
    pub primary_id: u64,
    /// Former primary ids resolving to this container after merges.
    /// Tracked by the metadata index, not stored in the blob.
    pub secondary_ids: Vec<u64>,
    pub items: Vec<ContainerItem>,
    container_size: usize,
}

impl Container {
    pub fn new(primary_id: u64, container_size: usize) -> Self {
        Self {
            primary_id,
            secondary_ids: Vec::new(),
            items: Vec::new(),
            container_size,
        }
    }

    pub fn container_size(&self) -> usize {
        self.container_size
    }

    /// Bytes of the uncompressed directory + payload region.
    fn region_size(&self) -> usize {
        self.items.len() * ITEM_DIRECTORY_ENTRY_SIZE
            + self
                .items
                .iter()
                .map(|item| item.payload.len())
                .sum::<usize>()
    }

    /// True if a payload of `size` bytes still fits (uncompressed).
    pub fn has_room(&self, size: usize) -> bool {
        CONTAINER_HEADER_SIZE + self.region_size() + ITEM_DIRECTORY_ENTRY_SIZE + size
            <= self.container_size
    }

    pub fn add_item(&mut self, fingerprint: Fingerprint, payload: Vec<u8>) -> Result<(), Error> {
        if !self.has_room(payload.len()) {
            bail!(
                "container {} full ({} items)",
                self.primary_id,
                self.items.len()
            );
        }
        self.items.push(ContainerItem {
            fingerprint,
            payload,
            deleted: false,
        });
        Ok(())
    }

    pub fn find_item(&self, fingerprint: &Fingerprint) -> Option<&ContainerItem> {
        self.items
            .iter()
            .find(|item| !item.deleted && item.fingerprint == *fingerprint)
    }

    /// Marks the item deleted. Returns true if it was present and live.
    pub fn delete_item(&mut self, fingerprint: &Fingerprint) -> bool {
        for item in self.items.iter_mut() {
            if !item.deleted && item.fingerprint == *fingerprint {
                item.deleted = true;
                return true;
            }
        }
        false
    }

    pub fn active_item_count(&self) -> u32 {
        self.items.iter().filter(|item| !item.deleted).count() as u32
    }

    pub fn active_data_size(&self) -> u32 {
        self.items
            .iter()
            .filter(|item| !item.deleted)
            .map(|item| item.payload.len() as u32)
            .sum()
    }

    pub fn serialize(
        &self,
        compression: CompressionType,
        checksum: bool,
    ) -> Result<Vec<u8>, Error> {
        let mut region = Vec::with_capacity(self.region_size());
        let payload_base = self.items.len() * ITEM_DIRECTORY_ENTRY_SIZE;
        let mut payload_offset = payload_base;
        for item in &self.items {
            region.extend_from_slice(item.fingerprint.bytes());
            region.extend_from_slice(&(payload_offset as u32).to_le_bytes());
            region.extend_from_slice(&(item.payload.len() as u32).to_le_bytes());
            region.push(if item.deleted { ITEM_FLAG_DELETED } else { 0 });
            payload_offset += item.payload.len();
        }
        for item in &self.items {
            region.extend_from_slice(&item.payload);
        }

        let (stored, tag) = match compression {
            CompressionType::None => (region, CompressionType::None),
            codec => {
                let compressed = compress(codec, &region)?;
                // only use compression if the result is shorter
                if compressed.len() < region.len() {
                    (compressed, codec)
                } else {
                    (region, CompressionType::None)
                }
            }
        };

        if CONTAINER_HEADER_SIZE + stored.len() > self.container_size {
            bail!(
                "serialized container {} exceeds container size ({} > {})",
                self.primary_id,
                CONTAINER_HEADER_SIZE + stored.len(),
                self.container_size
            );
        }

        let mut buf = vec![0u8; self.container_size];
        buf[0..4].copy_from_slice(&CONTAINER_MAGIC.to_le_bytes());
        buf[4..12].copy_from_slice(&self.primary_id.to_le_bytes());
        buf[12..16].copy_from_slice(&(self.items.len() as u32).to_le_bytes());
        buf[16..20].copy_from_slice(&self.active_data_size().to_le_bytes());
        buf[20..24].copy_from_slice(&(stored.len() as u32).to_le_bytes());
        buf[24] = if checksum { CONTAINER_FLAG_CRC } else { 0 };
        buf[25] = tag.tag();
        if checksum {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&stored);
            buf[26..30].copy_from_slice(&hasher.finalize().to_le_bytes());
        }
        buf[CONTAINER_HEADER_SIZE..CONTAINER_HEADER_SIZE + stored.len()].copy_from_slice(&stored);
        Ok(buf)
    }

    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < CONTAINER_HEADER_SIZE {
            bail!("container buffer too small");
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != CONTAINER_MAGIC {
            bail!("unknown container magic {magic:08x}");
        }
        let primary_id = u64::from_le_bytes(buf[4..12].try_into().unwrap());
        let item_count = u32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize;
        let stored_size = u32::from_le_bytes(buf[20..24].try_into().unwrap()) as usize;
        let flags = buf[24];
        let tag = CompressionType::from_tag(buf[25])
            .with_context(|| format!("container {primary_id}"))?;
        let crc = u32::from_le_bytes(buf[26..30].try_into().unwrap());

        if CONTAINER_HEADER_SIZE + stored_size > buf.len() {
            bail!("container {primary_id} data truncated");
        }
        let stored = &buf[CONTAINER_HEADER_SIZE..CONTAINER_HEADER_SIZE + stored_size];

        if flags & CONTAINER_FLAG_CRC != 0 {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(stored);
            let computed = hasher.finalize();
            if computed != crc {
                bail!(
                    "container {primary_id} crc mismatch (stored {crc:08x}, computed {computed:08x})"
                );
            }
        }

        let region = decompress(tag, stored)?;
        let directory_size = item_count * ITEM_DIRECTORY_ENTRY_SIZE;
        if region.len() < directory_size {
            bail!("container {primary_id} directory truncated");
        }

        let mut items = Vec::with_capacity(item_count);
        for i in 0..item_count {
            let entry = &region[i * ITEM_DIRECTORY_ENTRY_SIZE..(i + 1) * ITEM_DIRECTORY_ENTRY_SIZE];
            let fingerprint = Fingerprint::from_slice(&entry[..FINGERPRINT_SIZE])?;
            let offset = u32::from_le_bytes(
                entry[FINGERPRINT_SIZE..FINGERPRINT_SIZE + 4].try_into().unwrap(),
            ) as usize;
            let size = u32::from_le_bytes(
                entry[FINGERPRINT_SIZE + 4..FINGERPRINT_SIZE + 8].try_into().unwrap(),
            ) as usize;
            let item_flags = entry[FINGERPRINT_SIZE + 8];
            if offset + size > region.len() {
                bail!("container {primary_id} item payload out of range");
            }
            items.push(ContainerItem {
                fingerprint,
                payload: region[offset..offset + size].to_vec(),
                deleted: item_flags & ITEM_FLAG_DELETED != 0,
            });
        }

        Ok(Self {
            primary_id,
            secondary_ids: Vec::new(),
            items,
            container_size: buf.len(),
        })
    }
}

/// True if the given live item count and data size fit one container.
pub fn merged_fits(container_size: usize, item_count: u32, data_size: u32) -> bool {
    CONTAINER_HEADER_SIZE
        + item_count as usize * ITEM_DIRECTORY_ENTRY_SIZE
        + data_size as usize
        <= container_size
}

pub fn compress(codec: CompressionType, data: &[u8]) -> Result<Vec<u8>, Error> {
    let result = match codec {
        CompressionType::None => data.to_vec(),
        CompressionType::Deflate => {
            let mut encoder =
                flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data)?;
            encoder.finish()?
        }
        CompressionType::Bz2 => {
            let mut encoder =
                bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            encoder.write_all(data)?;
            encoder.finish()?
        }
        CompressionType::Lz4 => lz4_flex::compress_prepend_size(data),
        CompressionType::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|err| format_err!("snappy compression failed - {err}"))?,
    };
    Ok(result)
}

pub fn decompress(codec: CompressionType, data: &[u8]) -> Result<Vec<u8>, Error> {
    let result = match codec {
        CompressionType::None => data.to_vec(),
        CompressionType::Deflate => {
            let mut decoder = flate2::read::DeflateDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            out
        }
        CompressionType::Bz2 => {
            let mut decoder = bzip2::read::BzDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            out
        }
        CompressionType::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|err| format_err!("lz4 decompression failed - {err}"))?,
        CompressionType::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|err| format_err!("snappy decompression failed - {err}"))?,
    };
    Ok(result)
}

#[cfg(test)]
mod test {
    use super::*;

    fn fp(b: u8) -> Fingerprint {
        Fingerprint::new([b; FINGERPRINT_SIZE])
    }

    #[test]
    fn container_round_trip_all_codecs() {
        for codec in [
            CompressionType::None,
            CompressionType::Deflate,
            CompressionType::Bz2,
            CompressionType::Lz4,
            CompressionType::Snappy,
        ] {
            let mut container = Container::new(42, 16 * 1024);
            container.add_item(fp(1), vec![0x11; 1000]).unwrap();
            container.add_item(fp(2), vec![0x22; 2000]).unwrap();
            container.delete_item(&fp(1));

            let buf = container.serialize(codec, true).unwrap();
            assert_eq!(buf.len(), 16 * 1024);

            let parsed = Container::parse(&buf).unwrap();
            assert_eq!(parsed.primary_id, 42);
            assert_eq!(parsed.items.len(), 2);
            assert_eq!(parsed.active_item_count(), 1);
            assert_eq!(parsed.active_data_size(), 2000);
            assert!(parsed.find_item(&fp(1)).is_none());
            assert_eq!(parsed.find_item(&fp(2)).unwrap().payload, vec![0x22; 2000]);
        }
    }

    #[test]
    fn incompressible_data_stays_uncompressed() {
        let mut container = Container::new(7, 8192);
        let noise: Vec<u8> = (0..2048u32).map(|i| (i * 2654435761) as u8).collect();
        container.add_item(fp(9), noise.clone()).unwrap();

        let buf = container.serialize(CompressionType::Deflate, false).unwrap();
        let parsed = Container::parse(&buf).unwrap();
        assert_eq!(parsed.find_item(&fp(9)).unwrap().payload, noise);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut container = Container::new(1, 1024);
        assert!(container.has_room(512));
        container.add_item(fp(1), vec![1; 512]).unwrap();
        assert!(!container.has_room(512));
        assert!(container.add_item(fp(2), vec![2; 512]).is_err());
    }

    #[test]
    fn corrupt_container_detected() {
        let mut container = Container::new(3, 4096);
        container.add_item(fp(4), vec![7; 128]).unwrap();
        let mut buf = container.serialize(CompressionType::None, true).unwrap();
        buf[CONTAINER_HEADER_SIZE + 40] ^= 0x01;
        assert!(Container::parse(&buf).is_err());
    }
}
