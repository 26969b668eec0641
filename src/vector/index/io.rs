//! Binary codec for index shards.
//!
//! Layout (little-endian):
//!
//! ```text
//! magic      [u8; 4]  "GLVX"
//! version    u32
//! metric     u8
//! dimension  u32
//! count      u64
//! ids        u64 * count
//! vectors    f32 * count * dimension
//! checksum   u32      CRC32 of every preceding byte
//! ```

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::error::Result;
use crate::vector::core::distance::DistanceMetric;
use crate::vector::index::AnnIndex;
use crate::vector::index::flat::FlatIndex;

/// Shard file magic.
pub const SHARD_MAGIC: [u8; 4] = *b"GLVX";

/// Current shard format version.
pub const SHARD_FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 1 + 4 + 8;

/// Reasons a shard cannot be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardDecodeError {
    #[error("bad magic {0:?}")]
    BadMagic([u8; 4]),

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),

    #[error("unknown metric code {0}")]
    UnknownMetric(u8),

    #[error("truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
}

/// Serialize a shard into its on-disk representation.
pub fn encode_shard(index: &FlatIndex) -> Result<Vec<u8>> {
    let count = index.ntotal();
    let mut buf = Vec::with_capacity(HEADER_LEN + count * (8 + 4 * index.dimension()) + 4);

    buf.extend_from_slice(&SHARD_MAGIC);
    buf.write_u32::<LittleEndian>(SHARD_FORMAT_VERSION)?;
    buf.write_u8(index.metric().code())?;
    buf.write_u32::<LittleEndian>(index.dimension() as u32)?;
    buf.write_u64::<LittleEndian>(count as u64)?;
    for id in index.ids() {
        buf.write_u64::<LittleEndian>(*id)?;
    }
    for value in index.data() {
        buf.write_f32::<LittleEndian>(*value)?;
    }

    let checksum = crc32fast::hash(&buf);
    buf.write_u32::<LittleEndian>(checksum)?;
    Ok(buf)
}

/// Decode a shard written by [`encode_shard`].
pub fn decode_shard(bytes: &[u8]) -> std::result::Result<FlatIndex, ShardDecodeError> {
    let truncated = |expected: usize| ShardDecodeError::Truncated {
        expected,
        found: bytes.len(),
    };

    if bytes.len() < HEADER_LEN + 4 {
        return Err(truncated(HEADER_LEN + 4));
    }

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&bytes[..4]);
    if magic != SHARD_MAGIC {
        return Err(ShardDecodeError::BadMagic(magic));
    }

    let mut cursor = Cursor::new(&bytes[4..HEADER_LEN]);
    let header = (|| -> std::io::Result<(u32, u8, u32, u64)> {
        Ok((
            cursor.read_u32::<LittleEndian>()?,
            cursor.read_u8()?,
            cursor.read_u32::<LittleEndian>()?,
            cursor.read_u64::<LittleEndian>()?,
        ))
    })()
    .map_err(|_| truncated(HEADER_LEN + 4))?;
    let (version, metric_code, dimension, count) = header;

    if version != SHARD_FORMAT_VERSION {
        return Err(ShardDecodeError::UnsupportedVersion(version));
    }
    let metric =
        DistanceMetric::from_code(metric_code).ok_or(ShardDecodeError::UnknownMetric(metric_code))?;

    let dimension = dimension as usize;
    let count = usize::try_from(count).map_err(|_| truncated(usize::MAX))?;
    let body_len = count
        .checked_mul(8 + 4 * dimension)
        .ok_or_else(|| truncated(usize::MAX))?;
    let expected = HEADER_LEN + body_len + 4;
    if bytes.len() != expected {
        return Err(truncated(expected));
    }

    let payload = &bytes[..expected - 4];
    let stored = u32::from_le_bytes([
        bytes[expected - 4],
        bytes[expected - 3],
        bytes[expected - 2],
        bytes[expected - 1],
    ]);
    let computed = crc32fast::hash(payload);
    if stored != computed {
        return Err(ShardDecodeError::ChecksumMismatch { stored, computed });
    }

    let mut body = Cursor::new(&payload[HEADER_LEN..]);
    let mut ids = vec![0u64; count];
    let mut data = vec![0f32; count * dimension];
    body.read_u64_into::<LittleEndian>(&mut ids)
        .and_then(|_| body.read_f32_into::<LittleEndian>(&mut data))
        .map_err(|_| truncated(expected))?;

    let mut rest = Vec::new();
    body.read_to_end(&mut rest).map_err(|_| truncated(expected))?;
    if !rest.is_empty() {
        return Err(truncated(expected));
    }

    FlatIndex::from_parts(dimension, metric, ids, data).map_err(|_| truncated(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::core::vector::Vector;

    fn sample_index() -> FlatIndex {
        let mut index = FlatIndex::new(3, DistanceMetric::L2);
        index
            .add_with_ids(
                &[
                    Vector::new(vec![0.0, 1.0, 2.0]),
                    Vector::new(vec![-1.5, 0.25, 8.0]),
                ],
                &[42, 7],
            )
            .unwrap();
        index
    }

    #[test]
    fn test_decode_restores_ids_vectors_and_metric() {
        let index = sample_index();
        let decoded = decode_shard(&encode_shard(&index).unwrap()).unwrap();

        assert_eq!(decoded.ids(), &[42, 7]);
        assert_eq!(decoded.data(), index.data());
        assert_eq!(decoded.dimension(), 3);
        assert_eq!(decoded.metric(), DistanceMetric::L2);
    }

    #[test]
    fn test_empty_shard() {
        let index = FlatIndex::new(4, DistanceMetric::L2);
        let decoded = decode_shard(&encode_shard(&index).unwrap()).unwrap();
        assert_eq!(decoded.ntotal(), 0);
        assert_eq!(decoded.dimension(), 4);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = encode_shard(&sample_index()).unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            decode_shard(&bytes),
            Err(ShardDecodeError::BadMagic(_))
        ));
    }

    #[test]
    fn test_flipped_payload_byte_fails_checksum() {
        let mut bytes = encode_shard(&sample_index()).unwrap();
        let last_payload = bytes.len() - 5;
        bytes[last_payload] ^= 0xff;
        assert!(matches!(
            decode_shard(&bytes),
            Err(ShardDecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_shard() {
        let bytes = encode_shard(&sample_index()).unwrap();
        assert!(matches!(
            decode_shard(&bytes[..bytes.len() - 8]),
            Err(ShardDecodeError::Truncated { .. })
        ));
        assert!(matches!(
            decode_shard(&bytes[..6]),
            Err(ShardDecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_version_mismatch() {
        let mut bytes = encode_shard(&sample_index()).unwrap();
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(
            decode_shard(&bytes).unwrap_err(),
            ShardDecodeError::UnsupportedVersion(99)
        );
    }
}
