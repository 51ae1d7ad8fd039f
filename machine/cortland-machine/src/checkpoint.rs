//! The checkpoint engine: whole-machine snapshots on disk.
//!
//! A checkpoint file is the stream described in `cortland-core::chkpt`:
//! magic, version digit, then one length-prefixed blob per component in
//! the machine's fixed order. Loading never patches a live machine — the
//! old machine is dropped and a new one is built with the reader handed
//! to every component constructor, so a failed load leaves nothing
//! half-restored.

use std::fs;
use std::path::{Path, PathBuf};

use cortland_core::chkpt::{self, CheckpointReader, CheckpointWriter, ChkptError};
use cortland_core::cinfo;
use cortland_storage::SnapshotKind;
use walkdir::WalkDir;

use crate::config::MachineConfig;
use crate::machine::{Machine, MachineError};

/// File extension for checkpoint files.
pub const EXTENSION: &str = "gsc";

/// Saves `machine` to `path`.
///
/// `SnapshotKind::Quick` references disk images by path; `Consolidated`
/// embeds their block contents.
pub fn save(machine: &Machine, path: &Path, kind: SnapshotKind) -> Result<(), MachineError> {
    let mut w = CheckpointWriter::new(chkpt::VERSION_RLE);
    machine.save_to_writer(&mut w, kind)?;
    let data = w.finish();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| MachineError::Chkpt(e.into()))?;
    }
    fs::write(path, &data).map_err(|e| MachineError::Chkpt(e.into()))?;
    cinfo!("checkpoint", "saved {} bytes to {}", data.len(), path.display());
    Ok(())
}

/// Destroys nothing on failure: builds a fresh machine from the stream
/// at `path`, or reports why it could not.
pub fn load(config: &MachineConfig, path: &Path) -> Result<Machine, MachineError> {
    let data = fs::read(path).map_err(|e| MachineError::Chkpt(e.into()))?;
    let mut r = CheckpointReader::new(data)?;
    let machine = Machine::new(config, Some(&mut r))?;
    if r.failed() {
        // The sticky flag fired somewhere during the pass; the
        // half-restored machine is dropped here.
        return Err(MachineError::Chkpt(ChkptError::Corrupt("component deserialization failed")));
    }
    Ok(machine)
}

/// True iff `path` holds a recognizable, internally consistent
/// checkpoint.
#[must_use]
pub fn probe(path: &Path) -> bool {
    match fs::read(path) {
        Ok(data) => chkpt::probe(&data),
        Err(_) => false,
    }
}

/// The newest checkpoint file in `dir`, if any.
#[must_use]
pub fn newest(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|x| x == EXTENSION))
        .max_by_key(|e| e.metadata().ok().and_then(|m| m.modified().ok()))
        .map(|e| e.path().to_path_buf())
}

/// Deletes every checkpoint file in `dir` (the user declined to resume).
pub fn clear(dir: &Path) -> Result<(), MachineError> {
    for entry in WalkDir::new(dir).max_depth(1).into_iter().filter_map(Result::ok) {
        if entry.path().extension().is_some_and(|x| x == EXTENSION) {
            fs::remove_file(entry.path()).map_err(|e| MachineError::Chkpt(e.into()))?;
        }
    }
    Ok(())
}
