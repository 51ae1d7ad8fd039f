//! Framebuffer checksums for headless display verification.
//!
//! The shell's `screenshot --checksum` folds a region of the 1-bit
//! framebuffer into a 32-bit value: pixels pack MSB-first (black = 1)
//! row by row, whole bytes emitted at every 8th column plus the final
//! partial byte of each row, each byte folded as `cs = cs * 31 + byte`.

use crate::machine::Machine;

/// Framebuffer width in pixels.
pub const SCREEN_WIDTH: u32 = 512;
/// Framebuffer height in pixels.
pub const SCREEN_HEIGHT: u32 = 342;
/// Offset of the main frame buffer below the top of RAM.
const VIDEO_MAIN_OFFSET: u32 = 0x5900;

/// A rectangular region, top/left inclusive, bottom/right exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First row.
    pub top: u32,
    /// First column.
    pub left: u32,
    /// One past the last row.
    pub bottom: u32,
    /// One past the last column.
    pub right: u32,
}

impl Region {
    /// The full 512x342 screen.
    #[must_use]
    pub fn full() -> Self {
        Self { top: 0, left: 0, bottom: SCREEN_HEIGHT, right: SCREEN_WIDTH }
    }
}

/// Computes the region checksum over the machine's current framebuffer.
#[must_use]
pub fn checksum(machine: &Machine, region: Region) -> u32 {
    let ram = machine.map().ram();
    let base = (machine.map().ram_size() - VIDEO_MAIN_OFFSET) as usize;
    let row_bytes = (SCREEN_WIDTH / 8) as usize;

    let mut cs: u32 = 0;
    let mut fold = |byte: u8| cs = cs.wrapping_mul(31).wrapping_add(byte.into());

    for y in region.top..region.bottom.min(SCREEN_HEIGHT) {
        let row = base + y as usize * row_bytes;
        let mut acc: u8 = 0;
        let mut bits = 0;
        for x in region.left..region.right.min(SCREEN_WIDTH) {
            let byte = ram.get(row + (x / 8) as usize).copied().unwrap_or(0);
            let bit = (byte >> (7 - (x % 8))) & 1;
            acc = (acc << 1) | bit;
            bits += 1;
            if bits == 8 {
                fold(acc);
                acc = 0;
                bits = 0;
            }
        }
        if bits > 0 {
            // Final partial byte of the row, high-aligned.
            fold(acc << (8 - bits));
        }
    }
    cs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;
    use crate::profile::ModelId;

    fn machine() -> Machine {
        let tmp = std::env::temp_dir().join(format!("cortland-shot-{}", std::process::id()));
        let mut cfg = MachineConfig::for_model(ModelId::Plus);
        cfg.state_dir = tmp;
        let mut m = Machine::new(&cfg, None).unwrap();
        m.set_overlay(false); // RAM answers the framebuffer window
        m
    }

    #[test]
    fn blank_screen_checksums_to_zero() {
        let m = machine();
        assert_eq!(checksum(&m, Region::full()), 0, "all-white screen folds zero bytes");
    }

    #[test]
    fn single_black_pixel_changes_sum() {
        let mut m = machine();
        let base = m.map().ram_size() - 0x5900;
        m.poke(base, cortland_mem::map::AccessSize::Byte, 0x80);
        let cs = checksum(&m, Region::full());
        assert_ne!(cs, 0);
    }

    #[test]
    fn partial_region_emits_partial_bytes() {
        let mut m = machine();
        let base = m.map().ram_size() - 0x5900;
        m.poke(base, cortland_mem::map::AccessSize::Byte, 0xFF);
        // Region covering only the first 4 columns of row 0.
        let cs = checksum(&m, Region { top: 0, left: 0, bottom: 1, right: 4 });
        // Four black pixels high-aligned: 0xF0.
        assert_eq!(cs, 0xF0);
    }
}
