//! Disk I/O for archive files

use crate::core::error::Result;
use crate::core::image::{ArchiveImage, ArchiveLayout};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Write an archive image, replacing any existing file
pub fn write_archive<P: AsRef<Path>>(path: P, image: &ArchiveImage) -> Result<()> {
    let bytes = image.to_bytes();
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;

    file.write_all(&bytes)?;
    file.sync_all()?;

    info!(
        "Wrote archive {} ({} bytes)",
        path.as_ref().display(),
        bytes.len()
    );
    Ok(())
}

/// Read and validate a whole archive into memory
pub fn read_archive<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path)?;
    ArchiveLayout::parse(&bytes)?;
    Ok(bytes)
}

/// Map an archive copy-on-write. Relocation patches the mapping in place;
/// the file itself is never modified.
pub fn map_archive<P: AsRef<Path>>(path: P) -> Result<MmapMut> {
    let file = File::open(&path)?;
    // SAFETY: the mapping is private, so writes never reach the file. Another
    // process truncating the file while it is mapped is outside our control,
    // as with any file mapping.
    let mmap = unsafe { MmapOptions::new().map_copy(&file)? };
    Ok(mmap)
}
