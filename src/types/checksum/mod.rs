#![forbid(unsafe_code)]

use xxhash_rust::xxh64::Xxh64;

const PAGE_HASH_SEED: u64 = 0x666f_6c69_6f00_0001;

/// Incremental hasher used for page content hashes.
pub trait Checksum {
    /// Feeds `bytes` into the hasher.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the hash of everything fed so far.
    fn finalize(&self) -> u64;
}

/// xxHash64 backed [`Checksum`].
pub struct XxHash64 {
    inner: Xxh64,
}

impl Default for XxHash64 {
    fn default() -> Self {
        Self {
            inner: Xxh64::new(PAGE_HASH_SEED),
        }
    }
}

impl Checksum for XxHash64 {
    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u64 {
        self.inner.digest()
    }
}

/// Hex-encoded content hash of a serialized page body.
pub fn content_hash(payload: &[u8]) -> String {
    let mut hasher = XxHash64::default();
    hasher.update(payload);
    hex::encode(hasher.finalize().to_be_bytes())
}
