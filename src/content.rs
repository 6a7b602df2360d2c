use anyhow::{bail, Error};

use dedup_api_types::{ChunkMapping, Fingerprint, FINGERPRINT_SIZE};
use dedup_datastore::ChunkIndex;

/// One chunk of a block, before fingerprinting.
pub struct Chunk<'a> {
    pub offset: u32,
    pub data: &'a [u8],
}

/// Splits block data into fixed-size chunks.
///
/// The last chunk of a block may be shorter when the block size is not a
/// multiple of the chunk size.
pub struct FixedChunker {
    chunk_size: u32,
}

impl FixedChunker {
    pub fn new(chunk_size: u32) -> Result<Self, Error> {
        if chunk_size == 0 {
            bail!("chunk size must be positive");
        }
        Ok(Self { chunk_size })
    }

    pub fn split<'a>(&self, data: &'a [u8]) -> Vec<Chunk<'a>> {
        data.chunks(self.chunk_size as usize)
            .enumerate()
            .map(|(i, data)| Chunk {
                offset: i as u32 * self.chunk_size,
                data,
            })
            .collect()
    }
}

/// SHA-1 chunk fingerprint.
pub fn fingerprint(data: &[u8]) -> Fingerprint {
    let digest: [u8; FINGERPRINT_SIZE] = openssl::sha::sha1(data);
    Fingerprint::new(digest)
}

/// Classification of a chunk by the filter chain.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterResult {
    /// The chunk exists; the mapping references existing storage.
    Existing(ChunkMapping),
    /// The chunk is new and needs physical storage.
    NotExisting,
}

/// A member of the filter chain deciding duplicate / unique.
pub trait Filter: Send + Sync {
    fn check(&self, fingerprint: &Fingerprint) -> Result<FilterResult, Error>;
}

/// The chunk-index filter: a full fingerprint lookup.
///
/// This is the authoritative last member of the filter chain; earlier
/// members may only give weaker answers.
pub struct ChunkIndexFilter {
    chunk_index: std::sync::Arc<ChunkIndex>,
}

impl ChunkIndexFilter {
    pub fn new(chunk_index: std::sync::Arc<ChunkIndex>) -> Self {
        Self { chunk_index }
    }
}

impl Filter for ChunkIndexFilter {
    fn check(&self, fingerprint: &Fingerprint) -> Result<FilterResult, Error> {
        match self.chunk_index.lookup(fingerprint)? {
            Some(mapping) => Ok(FilterResult::Existing(mapping)),
            None => Ok(FilterResult::NotExisting),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixed_chunker_tiles_blocks() {
        let chunker = FixedChunker::new(4096).unwrap();
        let data = vec![7u8; 10000];
        let chunks = chunker.split(&data);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[1].offset, 4096);
        assert_eq!(chunks[2].offset, 8192);
        assert_eq!(chunks[2].data.len(), 10000 - 8192);
        assert_eq!(
            chunks.iter().map(|c| c.data.len() as u32).sum::<u32>(),
            10000
        );
    }

    #[test]
    fn fingerprints_identify_content() {
        let a = fingerprint(b"some chunk payload");
        let b = fingerprint(b"some chunk payload");
        let c = fingerprint(b"another chunk payload");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
