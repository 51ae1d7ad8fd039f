//! The versioned overlay block store.
//!
//! On-disk layout of the overlay directory:
//!
//! ```text
//! overlay/
//!   v00000001_l00000040_n0001.dat    one write: version 1, LBA 0x40
//!   v00000007_l00000040_n0008.dat    consolidated run of 8 blocks
//!   rollback/
//!     00000040.pre                   pre-image captured since the mark
//! ```
//!
//! Each `.dat` carries a small header with a crc32 over its payload; a
//! mismatch fails the read instead of handing out garbage. Reads resolve
//! through an in-memory newest-version index rebuilt from the directory
//! on open, so the directory itself is the durable truth.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use cortland_core::chkpt::{CheckpointReader, CheckpointWriter};
use walkdir::WalkDir;

use crate::StorageError;

const DAT_MAGIC: &[u8; 4] = b"GSBL";
/// Header: magic + crc32.
const DAT_HEADER: usize = 8;
/// Consolidation merges runs up to this many blocks.
const MAX_RUN: u64 = 64;

/// How a state snapshot treats the backing image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    /// Reference the backing file by path; only overlay blocks embed.
    Quick,
    /// Embed every block, including unmodified backing data.
    Consolidated,
}

/// Storage construction parameters.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Overlay directory; created if absent.
    pub dir: PathBuf,
    /// Fixed block size in bytes.
    pub block_size: u32,
    /// Backing image file consulted when no overlay version covers a
    /// block.
    pub base: Option<PathBuf>,
    /// Merge passes run per `tick`.
    pub consolidations_per_tick: u32,
}

#[derive(Debug, Clone)]
struct Extent {
    lba: u64,
    count: u64,
    path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
struct BlockRef {
    version: u64,
    /// Block index within the extent's payload.
    index: u64,
}

/// A directory-addressed overlay block store.
pub struct Storage {
    dir: PathBuf,
    block_size: u32,
    base: Option<PathBuf>,
    consolidations_per_tick: u32,
    next_version: u64,
    extents: BTreeMap<u64, Extent>,
    newest: HashMap<u64, BlockRef>,
    /// Set once a checkpoint mark opens a rollback generation.
    rollback_armed: bool,
}

impl Storage {
    /// Opens (or creates) the overlay directory and rebuilds the index.
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.dir)?;
        let mut s = Self {
            dir: config.dir.clone(),
            block_size: config.block_size,
            base: config.base.clone(),
            consolidations_per_tick: config.consolidations_per_tick,
            next_version: 1,
            extents: BTreeMap::new(),
            newest: HashMap::new(),
            rollback_armed: config.dir.join("rollback").is_dir(),
        };
        s.rebuild_index()?;
        Ok(s)
    }

    /// Fixed block size.
    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn rebuild_index(&mut self) -> Result<(), StorageError> {
        self.extents.clear();
        self.newest.clear();
        for entry in WalkDir::new(&self.dir).max_depth(1).into_iter().filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(parsed) = parse_dat_name(&name) else {
                continue;
            };
            let (version, lba, count) = parsed;
            self.extents.insert(version, Extent { lba, count, path: entry.path().to_path_buf() });
            self.next_version = self.next_version.max(version + 1);
        }
        let versions: Vec<u64> = self.extents.keys().copied().collect();
        for version in versions {
            let ext = self.extents[&version].clone();
            for i in 0..ext.count {
                self.newest.insert(ext.lba + i, BlockRef { version, index: i });
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Block I/O
    // -----------------------------------------------------------------------

    /// Reads one block at byte address `lba_bytes`.
    pub fn read_block(&self, lba_bytes: u64, out: &mut [u8]) -> Result<(), StorageError> {
        if out.len() != self.block_size as usize {
            return Err(StorageError::InvalidBuffer);
        }
        let lba = lba_bytes / u64::from(self.block_size);
        if let Some(r) = self.newest.get(&lba) {
            let ext = &self.extents[&r.version];
            let data = read_dat(&ext.path)?;
            let at = (r.index * u64::from(self.block_size)) as usize;
            out.copy_from_slice(&data[at..at + self.block_size as usize]);
            return Ok(());
        }
        self.read_base(lba, out)
    }

    fn read_base(&self, lba: u64, out: &mut [u8]) -> Result<(), StorageError> {
        out.fill(0);
        let Some(base) = &self.base else {
            return Ok(());
        };
        let mut f = fs::File::open(base)?;
        let offset = lba * u64::from(self.block_size);
        let len = f.metadata()?.len();
        if offset >= len {
            return Ok(());
        }
        f.seek(SeekFrom::Start(offset))?;
        let take = ((len - offset).min(u64::from(self.block_size))) as usize;
        f.read_exact(&mut out[..take])?;
        Ok(())
    }

    /// Writes one block at byte address `lba_bytes` as a new overlay
    /// version.
    pub fn write_block(&mut self, lba_bytes: u64, data: &[u8]) -> Result<(), StorageError> {
        if data.len() != self.block_size as usize {
            return Err(StorageError::InvalidBuffer);
        }
        let lba = lba_bytes / u64::from(self.block_size);
        if self.rollback_armed {
            self.capture_pre_image(lba)?;
        }
        let version = self.next_version;
        self.next_version += 1;
        let path = self.dat_path(version, lba, 1);
        write_dat(&path, data)?;
        self.extents.insert(version, Extent { lba, count: 1, path });
        self.newest.insert(lba, BlockRef { version, index: 0 });
        Ok(())
    }

    fn dat_path(&self, version: u64, lba: u64, count: u64) -> PathBuf {
        self.dir.join(format!("v{version:08}_l{lba:08}_n{count:04}.dat"))
    }

    // -----------------------------------------------------------------------
    // Consolidation
    // -----------------------------------------------------------------------

    /// Runs bounded merge passes; called from the VBL tick so foreground
    /// I/O never waits on a full-directory merge.
    pub fn tick(&mut self) -> Result<(), StorageError> {
        for _ in 0..self.consolidations_per_tick {
            if !self.consolidate_once()? {
                break;
            }
        }
        Ok(())
    }

    /// One merge pass. Deletes a fully superseded extent if one exists,
    /// otherwise coalesces a contiguous run of newest blocks spanning
    /// multiple extents. Returns false when nothing was done.
    fn consolidate_once(&mut self) -> Result<bool, StorageError> {
        // Pass 1: drop extents no block of which is current.
        let superseded: Option<u64> = self.extents.iter().find_map(|(&version, ext)| {
            let live = (0..ext.count)
                .any(|i| self.newest.get(&(ext.lba + i)).is_some_and(|r| r.version == version));
            if live { None } else { Some(version) }
        });
        if let Some(version) = superseded {
            let ext = self.extents.remove(&version).expect("found above");
            fs::remove_file(&ext.path)?;
            return Ok(true);
        }

        // Pass 2: merge a contiguous newest run that spans extents.
        let mut lbas: Vec<u64> = self.newest.keys().copied().collect();
        lbas.sort_unstable();
        for window_start in 0..lbas.len() {
            let start = lbas[window_start];
            let mut run = 1u64;
            let mut versions_seen = 1usize;
            while run < MAX_RUN {
                let next = start + run;
                let Some(r) = self.newest.get(&next) else { break };
                if self.newest[&(next - 1)].version != r.version {
                    versions_seen += 1;
                }
                run += 1;
            }
            if run > 1 && versions_seen > 1 {
                let mut payload = vec![0u8; (run * u64::from(self.block_size)) as usize];
                for i in 0..run {
                    let at = (i * u64::from(self.block_size)) as usize;
                    self.read_block((start + i) * u64::from(self.block_size), &mut payload[at..at + self.block_size as usize])?;
                }
                let version = self.next_version;
                self.next_version += 1;
                let path = self.dat_path(version, start, run);
                write_dat(&path, &payload)?;
                self.extents.insert(version, Extent { lba: start, count: run, path });
                for i in 0..run {
                    self.newest.insert(start + i, BlockRef { version, index: i });
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Rollback overlay
    // -----------------------------------------------------------------------

    fn rollback_dir(&self) -> PathBuf {
        self.dir.join("rollback")
    }

    /// Opens a rollback generation at the current state (a checkpoint
    /// mark). Subsequent writes capture pre-images until the next mark or
    /// an `apply_rollback`.
    pub fn checkpoint_mark(&mut self) -> Result<(), StorageError> {
        let dir = self.rollback_dir();
        if dir.is_dir() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        self.rollback_armed = true;
        Ok(())
    }

    fn capture_pre_image(&mut self, lba: u64) -> Result<(), StorageError> {
        let pre = self.rollback_dir().join(format!("{lba:08}.pre"));
        if pre.exists() {
            // At most one pre-image per LBA between marks.
            return Ok(());
        }
        let mut block = vec![0u8; self.block_size as usize];
        self.read_block(lba * u64::from(self.block_size), &mut block)?;
        fs::write(pre, &block)?;
        Ok(())
    }

    /// Reverts every block written since the mark to its pre-image and
    /// closes the rollback generation.
    pub fn apply_rollback(&mut self) -> Result<(), StorageError> {
        let dir = self.rollback_dir();
        if !dir.is_dir() {
            return Ok(());
        }
        // Disarm first so the reverting writes do not re-capture.
        self.rollback_armed = false;
        for entry in WalkDir::new(&dir).max_depth(1).into_iter().filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(lba_str) = name.strip_suffix(".pre") else {
                continue;
            };
            let Ok(lba) = lba_str.parse::<u64>() else {
                continue;
            };
            let block = fs::read(entry.path())?;
            if block.len() == self.block_size as usize {
                self.write_block(lba * u64::from(self.block_size), &block)?;
            }
        }
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // State streaming
    // -----------------------------------------------------------------------

    /// Serializes the store into a checkpoint stream.
    ///
    /// Quick snapshots embed only the overlay blocks; consolidated
    /// snapshots embed every block up to the device size so the stream
    /// restores without the backing image.
    pub fn save_state(&self, w: &mut CheckpointWriter, kind: SnapshotKind) -> Result<(), StorageError> {
        w.put_u32(self.block_size);
        match kind {
            SnapshotKind::Quick => {
                w.put_u8(0);
                let mut lbas: Vec<u64> = self.newest.keys().copied().collect();
                lbas.sort_unstable();
                w.put_u32(lbas.len() as u32);
                let mut block = vec![0u8; self.block_size as usize];
                for lba in lbas {
                    self.read_block(lba * u64::from(self.block_size), &mut block)?;
                    w.put_u64(lba);
                    w.put_bytes(&block);
                }
            }
            SnapshotKind::Consolidated => {
                w.put_u8(1);
                let total = self.device_blocks()?;
                w.put_u32(total as u32);
                let mut block = vec![0u8; self.block_size as usize];
                for lba in 0..total {
                    self.read_block(lba * u64::from(self.block_size), &mut block)?;
                    w.put_u64(lba);
                    w.put_bytes(&block);
                }
            }
        }
        Ok(())
    }

    /// Restores overlay contents from a checkpoint stream, replacing the
    /// current overlay.
    pub fn load_state(&mut self, r: &mut CheckpointReader) -> Result<(), StorageError> {
        let block_size = r.get_u32();
        if block_size != self.block_size {
            return Err(StorageError::Corrupt(format!(
                "block size {block_size} does not match configured {}",
                self.block_size
            )));
        }
        let _kind = r.get_u8();
        let count = r.get_u32();
        self.clear_overlay()?;
        for _ in 0..count {
            let lba = r.get_u64();
            let block = r.get_bytes(self.block_size as usize);
            if block.len() != self.block_size as usize {
                return Err(StorageError::Corrupt("truncated block in stream".into()));
            }
            self.write_block(lba * u64::from(self.block_size), &block)?;
        }
        Ok(())
    }

    fn clear_overlay(&mut self) -> Result<(), StorageError> {
        for ext in self.extents.values() {
            let _ = fs::remove_file(&ext.path);
        }
        self.extents.clear();
        self.newest.clear();
        self.next_version = 1;
        Ok(())
    }

    /// Blocks covered by base image plus overlay.
    fn device_blocks(&self) -> Result<u64, StorageError> {
        let bs = u64::from(self.block_size);
        let base_blocks = match &self.base {
            Some(p) => fs::metadata(p)?.len().div_ceil(bs),
            None => 0,
        };
        let overlay_top = self.newest.keys().max().map_or(0, |m| m + 1);
        Ok(base_blocks.max(overlay_top))
    }
}

fn parse_dat_name(name: &str) -> Option<(u64, u64, u64)> {
    let rest = name.strip_suffix(".dat")?;
    let mut parts = rest.split('_');
    let version = parts.next()?.strip_prefix('v')?.parse().ok()?;
    let lba = parts.next()?.strip_prefix('l')?.parse().ok()?;
    let count = parts.next()?.strip_prefix('n')?.parse().ok()?;
    Some((version, lba, count))
}

fn write_dat(path: &Path, payload: &[u8]) -> Result<(), StorageError> {
    let mut f = fs::File::create(path)?;
    f.write_all(DAT_MAGIC)?;
    f.write_all(&crc32fast::hash(payload).to_le_bytes())?;
    f.write_all(payload)?;
    Ok(())
}

fn read_dat(path: &Path) -> Result<Vec<u8>, StorageError> {
    let raw = fs::read(path)?;
    if raw.len() < DAT_HEADER || &raw[..4] != DAT_MAGIC {
        return Err(StorageError::Corrupt(path.display().to_string()));
    }
    let crc = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    let payload = raw[DAT_HEADER..].to_vec();
    if crc32fast::hash(&payload) != crc {
        return Err(StorageError::Corrupt(path.display().to_string()));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &Path) -> Storage {
        Storage::new(&StorageConfig {
            dir: dir.to_path_buf(),
            block_size: 512,
            base: None,
            consolidations_per_tick: 4,
        })
        .unwrap()
    }

    fn block(fill: u8) -> Vec<u8> {
        vec![fill; 512]
    }

    #[test]
    fn write_then_read_returns_written_data() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = storage(tmp.path());
        s.write_block(0x4000, &block(0xAB)).unwrap();
        let mut out = block(0);
        s.read_block(0x4000, &mut out).unwrap();
        assert_eq!(out, block(0xAB));
    }

    #[test]
    fn unwritten_blocks_read_zero_without_base() {
        let tmp = tempfile::tempdir().unwrap();
        let s = storage(tmp.path());
        let mut out = block(0xFF);
        s.read_block(0, &mut out).unwrap();
        assert_eq!(out, block(0));
    }

    #[test]
    fn newest_version_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = storage(tmp.path());
        s.write_block(512, &block(1)).unwrap();
        s.write_block(512, &block(2)).unwrap();
        let mut out = block(0);
        s.read_block(512, &mut out).unwrap();
        assert_eq!(out, block(2));
    }

    #[test]
    fn base_file_backs_unwritten_blocks() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("disk.img");
        let mut img = vec![0u8; 2048];
        img[512..1024].fill(0x77);
        fs::write(&base, &img).unwrap();
        let s = Storage::new(&StorageConfig {
            dir: tmp.path().join("overlay"),
            block_size: 512,
            base: Some(base),
            consolidations_per_tick: 4,
        })
        .unwrap();
        let mut out = block(0);
        s.read_block(512, &mut out).unwrap();
        assert_eq!(out, block(0x77));
    }

    #[test]
    fn index_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut s = storage(tmp.path());
            s.write_block(1024, &block(0x5A)).unwrap();
        }
        let s = storage(tmp.path());
        let mut out = block(0);
        s.read_block(1024, &mut out).unwrap();
        assert_eq!(out, block(0x5A));
    }

    #[test]
    fn consolidation_preserves_reads() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = storage(tmp.path());
        for i in 0..8u64 {
            s.write_block(i * 512, &block(i as u8 + 1)).unwrap();
        }
        // Rewrite a few so superseded versions exist.
        s.write_block(0, &block(0x10)).unwrap();
        s.write_block(512, &block(0x11)).unwrap();
        for _ in 0..16 {
            s.tick().unwrap();
        }
        let mut out = block(0);
        s.read_block(0, &mut out).unwrap();
        assert_eq!(out, block(0x10));
        s.read_block(512, &mut out).unwrap();
        assert_eq!(out, block(0x11));
        for i in 2..8u64 {
            s.read_block(i * 512, &mut out).unwrap();
            assert_eq!(out, block(i as u8 + 1), "block {i}");
        }
    }

    #[test]
    fn corrupt_dat_file_fails_read() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = storage(tmp.path());
        s.write_block(0, &block(9)).unwrap();
        // Flip a payload byte behind the store's back.
        let dat = WalkDir::new(tmp.path())
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .find(|e| e.file_name().to_string_lossy().ends_with(".dat"))
            .unwrap();
        let mut raw = fs::read(dat.path()).unwrap();
        raw[DAT_HEADER + 3] ^= 0xFF;
        fs::write(dat.path(), &raw).unwrap();
        let mut out = block(0);
        assert!(matches!(s.read_block(0, &mut out), Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn rollback_reverts_to_mark() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = storage(tmp.path());
        s.write_block(0, &block(0xAA)).unwrap();
        s.checkpoint_mark().unwrap();
        s.write_block(0, &block(0xBB)).unwrap();
        s.write_block(0, &block(0xCC)).unwrap();

        // Only one pre-image per LBA between marks.
        let pres = WalkDir::new(tmp.path().join("rollback"))
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".pre"))
            .count();
        assert_eq!(pres, 1);

        s.apply_rollback().unwrap();
        let mut out = block(0);
        s.read_block(0, &mut out).unwrap();
        assert_eq!(out, block(0xAA), "state at the mark restored");
    }

    #[test]
    fn save_load_state_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = storage(tmp.path());
        s.write_block(0, &block(1)).unwrap();
        s.write_block(512 * 5, &block(6)).unwrap();

        let mut w = CheckpointWriter::new(cortland_core::chkpt::VERSION_RLE);
        w.component(|w| {
            s.save_state(w, SnapshotKind::Quick).unwrap();
        });
        let stream = w.finish();

        let tmp2 = tempfile::tempdir().unwrap();
        let mut s2 = storage(tmp2.path());
        let mut r = CheckpointReader::new(stream).unwrap();
        r.enter_component();
        s2.load_state(&mut r).unwrap();
        r.exit_component();

        let mut out = block(0);
        s2.read_block(0, &mut out).unwrap();
        assert_eq!(out, block(1));
        s2.read_block(512 * 5, &mut out).unwrap();
        assert_eq!(out, block(6));
    }
}
