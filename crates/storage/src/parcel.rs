//! Parcel streaming for large variable values
//!
//! Values above the inline limit travel as a sequence of parcels. The
//! uploader advertises the total size up front; [`ParcelUpload`] hashes every
//! parcel as it arrives and returns the hex SHA-256 so clients can verify the
//! value end-to-end. Downloads are cut into bounded chunks by [`parcels`].

use bytes::Bytes;
use futures::stream::{self, Stream};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

/// Largest value accepted inline in a JSON request
pub const INLINE_LIMIT: usize = 1024 * 1024;

/// Chunk size of parcel downloads
pub const PARCEL_SIZE: usize = 64 * 1024;

/// Hex SHA-256 of a value
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Single size cap applied to every variable write and read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimit {
    pub max: u64,
}

impl SizeLimit {
    pub fn new(max: usize) -> Self {
        Self { max: max as u64 }
    }

    pub fn check(&self, size: u64) -> Result<(), StoreError> {
        if size > self.max {
            return Err(StoreError::TooLarge {
                size,
                max: self.max,
            });
        }
        Ok(())
    }
}

impl Default for SizeLimit {
    fn default() -> Self {
        Self::new(32 * 1024 * 1024)
    }
}

/// In-progress parcel upload
#[derive(Debug)]
pub struct ParcelUpload {
    expected: u64,
    buffer: Vec<u8>,
    hasher: Sha256,
}

/// A completed upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParcelResult {
    pub data: Vec<u8>,
    pub checksum: String,
}

impl ParcelUpload {
    /// Start an upload of `total` bytes; fails when the total exceeds the cap
    pub fn new(total: u64, limit: SizeLimit) -> Result<Self, StoreError> {
        limit.check(total)?;
        Ok(Self {
            expected: total,
            buffer: Vec::with_capacity(total as usize),
            hasher: Sha256::new(),
        })
    }

    pub fn received(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn push(&mut self, parcel: &[u8]) -> Result<(), StoreError> {
        let received = self.received() + parcel.len() as u64;
        if received > self.expected {
            return Err(StoreError::SizeMismatch {
                expected: self.expected,
                received,
            });
        }
        self.hasher.update(parcel);
        self.buffer.extend_from_slice(parcel);
        Ok(())
    }

    pub fn finish(self) -> Result<ParcelResult, StoreError> {
        if self.received() != self.expected {
            return Err(StoreError::SizeMismatch {
                expected: self.expected,
                received: self.received(),
            });
        }
        Ok(ParcelResult {
            checksum: hex::encode(self.hasher.finalize()),
            data: self.buffer,
        })
    }

    /// Drain a byte stream into an upload
    pub async fn collect<S, E>(
        total: u64,
        limit: SizeLimit,
        mut body: S,
    ) -> Result<ParcelResult, StoreError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        use futures::StreamExt;

        let mut upload = ParcelUpload::new(total, limit)?;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| StoreError::Validation(format!("parcel stream: {e}")))?;
            upload.push(&chunk)?;
        }
        upload.finish()
    }
}

/// Split a stored value into parcels of at most `size` bytes
pub fn parcels(data: Vec<u8>, size: usize) -> impl Stream<Item = Result<Bytes, StoreError>> {
    let data = Bytes::from(data);
    let size = size.max(1);
    let count = data.len().div_ceil(size);
    stream::iter((0..count).map(move |i| {
        let start = i * size;
        let end = (start + size).min(data.len());
        Ok(data.slice(start..end))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_checksum_matches_known_digest() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_upload_then_download_checksum_agrees() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = checksum(&payload);

        let body = stream::iter(
            payload
                .chunks(7_000)
                .map(|c| Ok::<_, std::io::Error>(Bytes::copy_from_slice(c)))
                .collect::<Vec<_>>(),
        );
        let result = ParcelUpload::collect(payload.len() as u64, SizeLimit::default(), body)
            .await
            .unwrap();
        assert_eq!(result.checksum, expected);

        let chunks: Vec<Bytes> = parcels(result.data, PARCEL_SIZE)
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert!(chunks.iter().all(|c| c.len() <= PARCEL_SIZE));
        let joined: Vec<u8> = chunks.concat();
        assert_eq!(checksum(&joined), expected);
    }

    #[test]
    fn test_size_mismatch() {
        let mut up = ParcelUpload::new(4, SizeLimit::default()).unwrap();
        up.push(b"ab").unwrap();
        assert!(matches!(up.finish(), Err(StoreError::SizeMismatch { .. })));

        let mut up = ParcelUpload::new(1, SizeLimit::default()).unwrap();
        assert!(up.push(b"ab").is_err());
    }

    #[test]
    fn test_cap_applies_to_advertised_total() {
        let limit = SizeLimit::new(10);
        assert!(matches!(
            ParcelUpload::new(11, limit),
            Err(StoreError::TooLarge { size: 11, max: 10 })
        ));
    }

    #[tokio::test]
    async fn test_empty_value_has_no_parcels() {
        let chunks: Vec<_> = parcels(vec![], 4).collect().await;
        assert!(chunks.is_empty());
    }
}
