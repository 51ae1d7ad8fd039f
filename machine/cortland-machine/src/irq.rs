//! Interrupt aggregation: fold the machine's active source bits into the
//! 3-bit IPL the CPU samples.

use cortland_core::chkpt::{CheckpointReader, CheckpointWriter};

/// Interrupt source bits, one per device line. Profiles map them to
/// priority levels.
pub mod source {
    /// VIA1 (the only VIA on the Plus).
    pub const VIA1: u32 = 1 << 0;
    /// VIA2 (SE/30).
    pub const VIA2: u32 = 1 << 1;
    /// SCC.
    pub const SCC: u32 = 1 << 2;
    /// SCSI controller.
    pub const SCSI: u32 = 1 << 3;
    /// Apple Sound Chip (SE/30).
    pub const ASC: u32 = 1 << 4;
    /// Programmer switch NMI.
    pub const NMI: u32 = 1 << 31;
}

/// Active interrupt sources and the folded IPL.
#[derive(Debug, Clone, Copy, Default)]
pub struct IrqState {
    active: u32,
    ipl: u8,
}

impl IrqState {
    /// Cold state, or restored from a checkpoint component.
    #[must_use]
    pub fn new(chk: Option<&mut CheckpointReader>) -> Self {
        let mut s = Self::default();
        if let Some(r) = chk {
            r.enter_component();
            s.active = r.get_u32();
            s.ipl = r.get_u8();
            r.exit_component();
        }
        s
    }

    /// Current active-source bitmask.
    #[must_use]
    pub fn active(&self) -> u32 {
        self.active
    }

    /// The folded IPL last computed by the profile.
    #[must_use]
    pub fn ipl(&self) -> u8 {
        self.ipl
    }

    /// Updates one source bit and refolds through `fold`. Returns true
    /// when the IPL changed (caller propagates to the CPU and cuts the
    /// sprint).
    pub fn update(&mut self, source_bit: u32, active: bool, fold: fn(u32) -> u8) -> bool {
        if active {
            self.active |= source_bit;
        } else {
            self.active &= !source_bit;
        }
        let new = fold(self.active);
        let changed = new != self.ipl;
        self.ipl = new;
        changed
    }

    /// Serializes the aggregator as one component blob.
    pub fn checkpoint(&self, w: &mut CheckpointWriter) {
        w.component(|w| {
            w.put_u32(self.active);
            w.put_u8(self.ipl);
        });
    }
}

/// Plus priority table: VIA -> 1, SCC -> 2, highest active wins. SCSI on
/// the Plus interrupts through polling, not the IPL.
#[must_use]
pub fn fold_plus(active: u32) -> u8 {
    if active & source::NMI != 0 {
        return 7;
    }
    if active & source::SCC != 0 {
        return 2;
    }
    if active & source::VIA1 != 0 {
        return 1;
    }
    0
}

/// SE/30 priority table: VIA1 -> 1, VIA2 -> 2, SCC -> 4, NMI -> 7,
/// strict priority.
#[must_use]
pub fn fold_se30(active: u32) -> u8 {
    if active & source::NMI != 0 {
        return 7;
    }
    if active & source::SCC != 0 {
        return 4;
    }
    if active & (source::VIA2 | source::SCSI | source::ASC) != 0 {
        return 2;
    }
    if active & source::VIA1 != 0 {
        return 1;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plus_highest_active_wins() {
        assert_eq!(fold_plus(0), 0);
        assert_eq!(fold_plus(source::VIA1), 1);
        assert_eq!(fold_plus(source::SCC), 2);
        assert_eq!(fold_plus(source::VIA1 | source::SCC), 2);
        assert_eq!(fold_plus(source::NMI), 7);
    }

    #[test]
    fn se30_strict_priority() {
        assert_eq!(fold_se30(source::VIA1), 1);
        assert_eq!(fold_se30(source::VIA1 | source::VIA2), 2);
        assert_eq!(fold_se30(source::VIA2 | source::SCC), 4);
        assert_eq!(fold_se30(source::SCC | source::NMI), 7);
        assert_eq!(fold_se30(source::SCSI), 2, "SCSI rides the VIA2 level");
    }

    #[test]
    fn update_reports_ipl_changes() {
        let mut s = IrqState::new(None);
        assert!(s.update(source::VIA1, true, fold_plus));
        assert!(!s.update(source::VIA1, true, fold_plus), "no change, no report");
        assert!(s.update(source::SCC, true, fold_plus));
        assert_eq!(s.ipl(), 2);
        assert!(!s.update(source::VIA1, false, fold_plus), "lower source masked by higher");
        assert!(s.update(source::SCC, false, fold_plus));
        assert_eq!(s.ipl(), 0);
    }

    #[test]
    fn checkpoint_round_trip() {
        let mut s = IrqState::new(None);
        s.update(source::SCC, true, fold_plus);
        let mut w = CheckpointWriter::new(cortland_core::chkpt::VERSION_RLE);
        s.checkpoint(&mut w);
        let mut r = CheckpointReader::new(w.finish()).unwrap();
        let back = IrqState::new(Some(&mut r));
        assert_eq!(back.active(), source::SCC);
        assert_eq!(back.ipl(), 2);
    }
}
