//! Machine profiles: the static descriptors and lifecycle callbacks that
//! distinguish one model from another.

use cortland_cpu::CpuModel;
use cortland_mem::{DeviceId, MemoryMap};
use serde::{Deserialize, Serialize};

use crate::config::MachineConfig;
use crate::machine::{Machine, MachineError};
use cortland_core::chkpt::CheckpointReader;

/// Supported machine models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelId {
    /// Macintosh Plus: 68000, 24-bit, one VIA.
    Plus,
    /// Macintosh SE/30: 68030, 32-bit, two VIAs, ADB, ASC.
    Se30,
}

/// Device ids as registered with the memory map. Creation order matches
/// checkpoint order, so these stay stable.
pub mod dev {
    use super::DeviceId;

    /// Primary VIA.
    pub const VIA1: DeviceId = DeviceId(0);
    /// Secondary VIA (SE/30).
    pub const VIA2: DeviceId = DeviceId(1);
    /// SCC.
    pub const SCC: DeviceId = DeviceId(2);
    /// SCSI controller.
    pub const SCSI: DeviceId = DeviceId(3);
    /// Floppy controller.
    pub const IWM: DeviceId = DeviceId(4);
    /// Apple Sound Chip (SE/30).
    pub const ASC: DeviceId = DeviceId(5);
}

/// A machine model: static descriptor plus the callbacks the generic
/// machinery dispatches through.
pub struct MachineProfile {
    /// Model identifier.
    pub model_id: ModelId,
    /// Human-readable name.
    pub model_name: &'static str,
    /// CPU variant.
    pub cpu_model: CpuModel,
    /// CPU clock in Hz.
    pub cpu_clock_hz: u64,
    /// 68030 PMMU fitted.
    pub mmu_present: bool,
    /// FPU fitted (not emulated; F-line traps into the guest).
    pub fpu_present: bool,
    /// Address bus width.
    pub address_bits: u8,
    /// Default RAM size.
    pub ram_size_default: u32,
    /// Maximum RAM size.
    pub ram_size_max: u32,
    /// ROM image size.
    pub rom_size: u32,
    /// Number of VIAs.
    pub via_count: u8,
    /// ADB fitted.
    pub has_adb: bool,
    /// NuBus fitted.
    pub has_nubus: bool,
    /// NuBus slot count.
    pub nubus_slot_count: u8,

    /// Physical base of the ROM window.
    pub rom_base: u32,
    /// End of the ROM window.
    pub rom_window_end: u32,

    /// Builds a machine of this model.
    pub init: fn(&'static MachineProfile, &MachineConfig, Option<&mut CheckpointReader>) -> Result<Machine, MachineError>,
    /// Installs the RAM/ROM page layout, honoring the boot-time ROM
    /// overlay.
    pub memory_layout_init: fn(&mut MemoryMap, overlay: bool),
    /// Folds active interrupt sources into an IPL.
    pub update_ipl: fn(u32) -> u8,
}

impl MachineProfile {
    /// Looks a profile up by id.
    #[must_use]
    pub fn by_id(id: ModelId) -> &'static Self {
        match id {
            ModelId::Plus => &PLUS,
            ModelId::Se30 => &SE30,
        }
    }
}

fn plus_layout(map: &mut MemoryMap, overlay: bool) {
    // ROM window with the 24-bit interleaved holes, RAM below it.
    map.populate_pages(0x40_0000, 0x50_0000);
    if overlay {
        // Reset runs from ROM mirrored at address zero; RAM answers high.
        map.map_rom(0x0, 0x40_0000);
        map.map_ram(0x60_0000, 0x40_0000);
    }
}

fn se30_layout(map: &mut MemoryMap, overlay: bool) {
    map.map_ram(0x0, 0x4000_0000);
    map.map_rom(0x4080_0000, 0x10_0000);
    if overlay {
        map.map_rom(0x0, 0x10_0000);
    }
}

/// The Macintosh Plus.
pub static PLUS: MachineProfile = MachineProfile {
    model_id: ModelId::Plus,
    model_name: "Macintosh Plus",
    cpu_model: CpuModel::Mc68000,
    cpu_clock_hz: 7_833_600,
    mmu_present: false,
    fpu_present: false,
    address_bits: 24,
    ram_size_default: 0x40_0000,
    ram_size_max: 0x40_0000,
    rom_size: 0x2_0000,
    via_count: 1,
    has_adb: false,
    has_nubus: false,
    nubus_slot_count: 0,
    rom_base: 0x40_0000,
    rom_window_end: 0x50_0000,
    init: crate::machine::init_machine,
    memory_layout_init: plus_layout,
    update_ipl: crate::irq::fold_plus,
};

/// The Macintosh SE/30.
pub static SE30: MachineProfile = MachineProfile {
    model_id: ModelId::Se30,
    model_name: "Macintosh SE/30",
    cpu_model: CpuModel::Mc68030,
    cpu_clock_hz: 15_667_200,
    mmu_present: true,
    fpu_present: true,
    address_bits: 32,
    ram_size_default: 0x80_0000,
    ram_size_max: 0x800_0000,
    rom_size: 0x4_0000,
    via_count: 2,
    has_adb: true,
    has_nubus: false,
    nubus_slot_count: 0,
    rom_base: 0x4080_0000,
    rom_window_end: 0x4090_0000,
    init: crate::machine::init_machine,
    memory_layout_init: se30_layout,
    update_ipl: crate::irq::fold_se30,
};

/// SE/30 MMIO window base; the hardware decodes it with `$20000`
/// mirroring.
pub const SE30_IO_BASE: u32 = 0x5000_0000;
/// SE/30 MMIO mirror stride.
pub const SE30_IO_STRIDE: u32 = 0x2_0000;
/// SE/30 MMIO mirrors mapped.
pub const SE30_IO_MIRRORS: u32 = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_id() {
        assert_eq!(MachineProfile::by_id(ModelId::Plus).model_name, "Macintosh Plus");
        assert_eq!(MachineProfile::by_id(ModelId::Se30).via_count, 2);
    }

    #[test]
    fn plus_descriptor_shape() {
        assert_eq!(PLUS.address_bits, 24);
        assert!(!PLUS.mmu_present);
        assert_eq!(PLUS.cpu_model, CpuModel::Mc68000);
    }

    #[test]
    fn se30_descriptor_shape() {
        assert_eq!(SE30.address_bits, 32);
        assert!(SE30.mmu_present);
        assert!(SE30.has_adb);
        assert_eq!(SE30.cpu_model, CpuModel::Mc68030);
    }
}
