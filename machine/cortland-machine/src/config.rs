//! Machine configuration, loadable from TOML.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::profile::ModelId;

/// How emulated time maps to host time (mirrors the scheduler modes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speed {
    /// As fast as the host allows.
    #[default]
    Max,
    /// Paced to the configured frequency.
    Realtime,
    /// Paced to the original hardware clock.
    Hardware,
}

/// One disk to mount at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Image file path.
    pub path: PathBuf,
    /// Accept guest writes.
    #[serde(default = "default_true")]
    pub writable: bool,
    /// SCSI id; `None` mounts in the floppy drive.
    #[serde(default)]
    pub scsi_id: Option<u8>,
}

fn default_true() -> bool {
    true
}

/// Everything needed to build one machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Which machine to build.
    pub model: ModelId,
    /// RAM size in bytes; `None` takes the profile default.
    #[serde(default)]
    pub ram_size: Option<u32>,
    /// ROM image path; tests may instead hand bytes to the machine
    /// directly.
    #[serde(default)]
    pub rom_path: Option<PathBuf>,
    /// Directory for checkpoints and storage overlays.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Speed mode.
    #[serde(default)]
    pub speed: Speed,
    /// Overlay consolidation passes per frame tick.
    #[serde(default = "default_consolidations")]
    pub consolidations_per_tick: u32,
    /// Disks to mount.
    #[serde(default)]
    pub disks: Vec<DiskConfig>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_consolidations() -> u32 {
    2
}

impl MachineConfig {
    /// A bare configuration for `model` with profile defaults.
    #[must_use]
    pub fn for_model(model: ModelId) -> Self {
        Self {
            model,
            ram_size: None,
            rom_path: None,
            state_dir: default_state_dir(),
            speed: Speed::default(),
            consolidations_per_tick: default_consolidations(),
            disks: Vec::new(),
        }
    }

    /// Parses a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
        toml::from_str(&text).map_err(|e| format!("{}: {e}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_parses_with_defaults() {
        let cfg: MachineConfig = toml::from_str("model = \"plus\"").unwrap();
        assert_eq!(cfg.model, ModelId::Plus);
        assert_eq!(cfg.ram_size, None);
        assert_eq!(cfg.consolidations_per_tick, 2);
        assert_eq!(cfg.speed, Speed::Max);
    }

    #[test]
    fn disks_parse_with_scsi_ids() {
        let cfg: MachineConfig = toml::from_str(
            "model = \"se30\"\n[[disks]]\npath = \"hd.img\"\nscsi_id = 0\n[[disks]]\npath = \"floppy.img\"\nwritable = false\n",
        )
        .unwrap();
        assert_eq!(cfg.model, ModelId::Se30);
        assert_eq!(cfg.disks.len(), 2);
        assert_eq!(cfg.disks[0].scsi_id, Some(0));
        assert!(cfg.disks[0].writable);
        assert!(!cfg.disks[1].writable);
    }
}
