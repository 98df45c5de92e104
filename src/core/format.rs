//! On-media format: the space header and the pool image header
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ Image header (32 bytes)                     │
//! │  - Magic: "VEAPOOL\0"                       │
//! │  - Version: 1.0                             │
//! │  - Body length, CRC32 of body               │
//! ├─────────────────────────────────────────────┤
//! │ Body (bincode)                              │
//! │  - Space header: magic 0xea201804, block    │
//! │    size, header blocks, total blocks        │
//! │  - Free extent table (B+ tree by offset)    │
//! │  - Extent vector table (B+ tree by id)      │
//! │  - Hint table (B+ tree by stream id)        │
//! └─────────────────────────────────────────────┘
//! ```

use crate::error::{Result, VeaError};
use serde::{Deserialize, Serialize};

/// Magic identifying a formatted allocator space
pub const VEA_MAGIC: u32 = 0xea20_1804;

pub const IMAGE_MAGIC: [u8; 8] = *b"VEAPOOL\0";
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;
pub const IMAGE_HEADER_SIZE: usize = 32;

/// Persistent space header
///
/// A zeroed header (magic 0) means the space has never been formatted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpaceDf {
    pub magic: u32,
    /// Compatibility flags, none defined yet
    pub compat: u32,
    pub block_size: u32,
    pub header_blocks: u32,
    /// Capacity in blocks, header blocks included
    pub total_blocks: u64,
    /// Id handed to the next published extent vector
    pub next_vector_id: u64,
}

impl SpaceDf {
    pub fn new(block_size: u32, header_blocks: u32, total_blocks: u64) -> Self {
        SpaceDf {
            magic: VEA_MAGIC,
            compat: 0,
            block_size,
            header_blocks,
            total_blocks,
            next_vector_id: 1,
        }
    }

    pub fn is_formatted(&self) -> bool {
        self.magic != 0
    }

    /// Blocks available for allocation
    pub fn usable_blocks(&self) -> u64 {
        self.total_blocks
            .saturating_sub(u64::from(self.header_blocks))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.is_formatted() {
            return Err(VeaError::NotFormatted);
        }

        if self.magic != VEA_MAGIC {
            return Err(VeaError::InvalidMagic);
        }

        if self.block_size == 0 || self.header_blocks == 0 {
            return Err(VeaError::integrity(format!(
                "invalid space geometry: block size {}, header blocks {}",
                self.block_size, self.header_blocks
            )));
        }

        if self.total_blocks <= u64::from(self.header_blocks) {
            return Err(VeaError::integrity(format!(
                "total blocks ({}) does not exceed header blocks ({})",
                self.total_blocks, self.header_blocks
            )));
        }

        Ok(())
    }
}

/// Fixed-size header in front of the serialized pool body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub magic: [u8; 8],
    pub version_major: u16,
    pub version_minor: u16,
    pub checksum: u32,
    pub body_len: u64,
    /// Commit sequence of the transaction that wrote this image
    pub generation: u64,
}

impl ImageHeader {
    pub fn new(body: &[u8], generation: u64) -> Self {
        ImageHeader {
            magic: IMAGE_MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            checksum: crc32fast::hash(body),
            body_len: body.len() as u64,
            generation,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != IMAGE_MAGIC {
            return Err(VeaError::InvalidMagic);
        }

        if self.version_major != VERSION_MAJOR || self.version_minor != VERSION_MINOR {
            return Err(VeaError::UnsupportedVersion {
                major: self.version_major,
                minor: self.version_minor,
            });
        }

        Ok(())
    }

    /// Check the body against the recorded length and checksum
    pub fn verify_body(&self, body: &[u8]) -> Result<()> {
        if body.len() as u64 != self.body_len {
            return Err(VeaError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "pool image body is {} bytes, header says {}",
                    body.len(),
                    self.body_len
                ),
            )));
        }

        if crc32fast::hash(body) != self.checksum {
            return Err(VeaError::ChecksumMismatch);
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; IMAGE_HEADER_SIZE] {
        let mut bytes = [0u8; IMAGE_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.magic);
        bytes[8..10].copy_from_slice(&self.version_major.to_le_bytes());
        bytes[10..12].copy_from_slice(&self.version_minor.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.body_len.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.generation.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < IMAGE_HEADER_SIZE {
            return Err(VeaError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Insufficient bytes for pool image header",
            )));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);

        let header = ImageHeader {
            magic,
            version_major: u16::from_le_bytes([bytes[8], bytes[9]]),
            version_minor: u16::from_le_bytes([bytes[10], bytes[11]]),
            checksum: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            body_len: read_u64(&bytes[16..24]),
            generation: read_u64(&bytes[24..32]),
        };

        header.validate()?;

        Ok(header)
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_df_validation() {
        let df = SpaceDf::new(4096, 1, 1024);
        assert!(df.validate().is_ok());
        assert_eq!(df.usable_blocks(), 1023);

        assert!(matches!(
            SpaceDf::default().validate(),
            Err(VeaError::NotFormatted)
        ));

        let mut bad = df;
        bad.magic = 0xdead_beef;
        assert!(matches!(bad.validate(), Err(VeaError::InvalidMagic)));

        let tiny = SpaceDf::new(4096, 8, 8);
        assert!(matches!(tiny.validate(), Err(VeaError::Integrity(_))));
    }

    #[test]
    fn test_image_header_roundtrip() {
        let body = b"free extents";
        let header = ImageHeader::new(body, 42);
        let parsed = ImageHeader::from_bytes(&header.to_bytes()).unwrap();

        assert_eq!(parsed, header);
        assert!(parsed.verify_body(body).is_ok());
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = ImageHeader::new(b"", 0).to_bytes();
        bytes[0..8].copy_from_slice(b"INVALID!");
        assert!(matches!(
            ImageHeader::from_bytes(&bytes),
            Err(VeaError::InvalidMagic)
        ));
    }

    #[test]
    fn test_invalid_version() {
        let mut header = ImageHeader::new(b"", 0);
        header.version_major = 99;
        assert!(matches!(
            ImageHeader::from_bytes(&header.to_bytes()),
            Err(VeaError::UnsupportedVersion { major: 99, .. })
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        let header = ImageHeader::new(b"abcd", 1);
        assert!(matches!(
            header.verify_body(b"abce"),
            Err(VeaError::ChecksumMismatch)
        ));
        assert!(matches!(header.verify_body(b"abc"), Err(VeaError::Io(_))));
    }

    #[test]
    fn test_short_header() {
        assert!(matches!(
            ImageHeader::from_bytes(&[0u8; 10]),
            Err(VeaError::Io(_))
        ));
    }
}
