//! Pool image persistence
//!
//! A pool image is one file: a fixed header followed by the bincode body.
//! Saves go to a sibling temp file which is synced and renamed over the
//! image, so a reader sees either the old or the new image.

use super::PoolImage;
use crate::error::Result;
use crate::format::{ImageHeader, IMAGE_HEADER_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Serialize and atomically replace the image at `path`
pub fn save_image(path: &Path, image: &PoolImage, generation: u64) -> Result<()> {
    let body = bincode::serialize(image)?;
    let header = ImageHeader::new(&body, generation);

    let tmp = temp_path(path);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&header.to_bytes())?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;

    debug!(
        "Saved pool image {} (generation {}, {} bytes)",
        path.display(),
        generation,
        body.len()
    );
    Ok(())
}

/// Read and verify the image at `path`, returning it with its generation
pub fn load_image(path: &Path) -> Result<(PoolImage, u64)> {
    let mut file = File::open(path)?;

    let mut header_bytes = [0u8; IMAGE_HEADER_SIZE];
    file.read_exact(&mut header_bytes)?;
    let header = ImageHeader::from_bytes(&header_bytes)?;

    let mut body = Vec::new();
    file.read_to_end(&mut body)?;
    header.verify_body(&body)?;

    let image: PoolImage = bincode::deserialize(&body)?;
    debug!(
        "Loaded pool image {} (generation {})",
        path.display(),
        header.generation
    );
    Ok((image, header.generation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VeaError;
    use crate::format::SpaceDf;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool.img");

        let mut image = PoolImage::default();
        image.df = SpaceDf::new(4096, 1, 100);
        save_image(&path, &image, 7).unwrap();

        let (loaded, generation) = load_image(&path).unwrap();
        assert_eq!(generation, 7);
        assert_eq!(loaded.df, image.df);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_corrupt_body_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool.img");
        save_image(&path, &PoolImage::default(), 1).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            load_image(&path),
            Err(VeaError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_temp_path_is_sibling() {
        let tmp = temp_path(Path::new("/data/pool.img"));
        assert_eq!(tmp, PathBuf::from("/data/pool.img.tmp"));
    }
}
