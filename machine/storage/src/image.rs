//! Disk image handles mounted by the floppy slot and SCSI targets.

use std::fs;
use std::path::{Path, PathBuf};

use cortland_core::chkpt::{CheckpointReader, CheckpointWriter};

use crate::{SnapshotKind, Storage, StorageConfig, StorageError};

/// A mounted disk image: the backing file plus its overlay store.
pub struct Image {
    path: PathBuf,
    writable: bool,
    raw_size: u64,
    storage: Storage,
}

impl Image {
    /// Opens an image, placing its overlay under `overlay_dir`.
    pub fn open(path: &Path, writable: bool, overlay_dir: &Path, block_size: u32) -> Result<Self, StorageError> {
        let raw_size = fs::metadata(path)?.len();
        let storage = Storage::new(&StorageConfig {
            dir: overlay_dir.to_path_buf(),
            block_size,
            base: Some(path.to_path_buf()),
            consolidations_per_tick: 2,
        })?;
        Ok(Self { path: path.to_path_buf(), writable, raw_size, storage })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when guest writes are accepted.
    #[must_use]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Size of the backing file in bytes.
    #[must_use]
    pub fn raw_size(&self) -> u64 {
        self.raw_size
    }

    /// The overlay store.
    pub fn storage(&mut self) -> &mut Storage {
        &mut self.storage
    }

    /// Reads one block at byte offset `lba_bytes`.
    pub fn read_block(&self, lba_bytes: u64, out: &mut [u8]) -> Result<(), StorageError> {
        self.storage.read_block(lba_bytes, out)
    }

    /// Writes one block; rejected on read-only images.
    pub fn write_block(&mut self, lba_bytes: u64, data: &[u8]) -> Result<(), StorageError> {
        if !self.writable {
            return Err(StorageError::OutOfRange);
        }
        self.storage.write_block(lba_bytes, data)
    }

    /// Per-frame housekeeping, called from the VBL tick.
    pub fn tick(&mut self) -> Result<(), StorageError> {
        self.storage.tick()
    }

    /// Writes this image's entry of the image-list blob:
    /// `[path_len][path][writable][raw_size]` plus, for consolidated
    /// snapshots, the serialized block contents.
    pub fn checkpoint(&self, w: &mut CheckpointWriter, kind: SnapshotKind) -> Result<(), StorageError> {
        w.put_str(&self.path.to_string_lossy());
        w.put_u8(self.writable.into());
        w.put_u64(self.raw_size);
        match kind {
            SnapshotKind::Quick => w.put_u8(0),
            SnapshotKind::Consolidated => {
                w.put_u8(1);
                self.storage.save_state(w, kind)?;
            }
        }
        Ok(())
    }

    /// Reads one image-list entry and reopens the image.
    pub fn restore(r: &mut CheckpointReader, overlay_dir: &Path, block_size: u32) -> Result<Self, StorageError> {
        let path = PathBuf::from(r.get_str());
        let writable = r.get_u8() != 0;
        let raw_size = r.get_u64();
        let mut img = Self::open(&path, writable, overlay_dir, block_size)?;
        img.raw_size = raw_size;
        if r.get_u8() != 0 {
            img.storage.load_state(r)?;
        }
        Ok(img)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_image_rejects_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("floppy.img");
        fs::write(&path, vec![0u8; 819_200]).unwrap();
        let mut img = Image::open(&path, false, &tmp.path().join("ov"), 512).unwrap();
        assert!(img.write_block(0, &[1u8; 512]).is_err());
    }

    #[test]
    fn image_entry_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("disk.img");
        fs::write(&path, vec![0u8; 4096]).unwrap();
        let mut img = Image::open(&path, true, &tmp.path().join("ov"), 512).unwrap();
        img.write_block(512, &[9u8; 512]).unwrap();

        let mut w = CheckpointWriter::new(cortland_core::chkpt::VERSION_RLE);
        w.component(|w| img.checkpoint(w, SnapshotKind::Consolidated).unwrap());
        let mut r = CheckpointReader::new(w.finish()).unwrap();
        r.enter_component();
        let back = Image::restore(&mut r, &tmp.path().join("ov2"), 512).unwrap();
        r.exit_component();

        assert_eq!(back.path(), path);
        assert!(back.writable());
        assert_eq!(back.raw_size(), 4096);
        let mut out = [0u8; 512];
        back.read_block(512, &mut out).unwrap();
        assert_eq!(out, [9u8; 512]);
    }
}
