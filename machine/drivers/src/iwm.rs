//! IWM/SWIM floppy controller and the 400/800 K drive model.
//!
//! The controller is addressed through soft latches: each access to one
//! of sixteen address lines sets or clears a line (CA0-CA2, LSTRB,
//! ENABLE, SELECT, Q6, Q7); the Q6/Q7 pair then decides whether a read
//! hits the data, status, or handshake register. The drive's SEL head
//! line is not an IWM latch at all — the VIA drives it, and the machine
//! relays it through [`Iwm::set_sel_signal`].
//!
//! The drive model works a track at a time: when the head steps or a
//! disk appears, the machine renders the track into a nibble buffer with
//! [`crate::gcr`]; reads stream from it, writes land in it and mark it
//! dirty for flush-back.

use cortland_core::chkpt::{CheckpointReader, CheckpointWriter};
use cortland_mem::MmioDevice;

/// Which controller generation the machine carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IwmKind {
    /// Plus-era IWM.
    Iwm,
    /// SE/30-era SWIM (IWM-compatible mode here).
    Swim,
}

/// Address lines, from offset bits 9-12: bit 0 of the index is the new
/// level, bits 3-1 select the line.
mod line {
    pub const CA0: u32 = 0;
    pub const CA1: u32 = 1;
    pub const CA2: u32 = 2;
    pub const LSTRB: u32 = 3;
    pub const ENABLE: u32 = 4;
    pub const SELECT: u32 = 5;
    pub const Q6: u32 = 6;
    pub const Q7: u32 = 7;
}

/// One drive's mechanical state.
#[derive(Debug, Clone)]
struct Drive {
    present: bool,
    disk_in: bool,
    write_protected: bool,
    motor_on: bool,
    track: u8,
    /// Step direction: true = toward track 0.
    step_outward: bool,
    /// Double-sided 800 K drive.
    double_sided: bool,
}

impl Drive {
    fn new(present: bool) -> Self {
        Self {
            present,
            disk_in: false,
            write_protected: false,
            motor_on: false,
            track: 0,
            step_outward: true,
            double_sided: true,
        }
    }
}

/// The floppy controller plus its two possible drives.
pub struct Iwm {
    kind: IwmKind,
    // Soft latches.
    ca0: bool,
    ca1: bool,
    ca2: bool,
    lstrb: bool,
    enable: bool,
    /// Internal drive-select latch (drive 1 vs 2).
    select_ext: bool,
    q6: bool,
    q7: bool,
    mode: u8,
    /// Head-select line driven by the VIA.
    sel: bool,

    drives: [Drive; 2],

    /// Current track nibble stream and read position.
    track_buf: Vec<u8>,
    track_pos: usize,
    track_dirty: bool,
    /// Set when the head moved or a disk changed; the machine re-renders
    /// the track buffer.
    track_stale: bool,
    /// Eject request latched for the machine.
    eject_pending: bool,
}

impl Iwm {
    /// Cold state, or restored from a checkpoint component.
    #[must_use]
    pub fn new(kind: IwmKind, chk: Option<&mut CheckpointReader>) -> Self {
        let mut iwm = Self {
            kind,
            ca0: false,
            ca1: false,
            ca2: false,
            lstrb: false,
            enable: false,
            select_ext: false,
            q6: false,
            q7: false,
            mode: 0,
            sel: false,
            drives: [Drive::new(true), Drive::new(false)],
            track_buf: Vec::new(),
            track_pos: 0,
            track_dirty: false,
            track_stale: true,
            eject_pending: false,
        };
        if let Some(r) = chk {
            r.enter_component();
            iwm.ca0 = r.get_u8() != 0;
            iwm.ca1 = r.get_u8() != 0;
            iwm.ca2 = r.get_u8() != 0;
            iwm.lstrb = r.get_u8() != 0;
            iwm.enable = r.get_u8() != 0;
            iwm.select_ext = r.get_u8() != 0;
            iwm.q6 = r.get_u8() != 0;
            iwm.q7 = r.get_u8() != 0;
            iwm.mode = r.get_u8();
            iwm.sel = r.get_u8() != 0;
            for d in &mut iwm.drives {
                d.present = r.get_u8() != 0;
                d.disk_in = r.get_u8() != 0;
                d.write_protected = r.get_u8() != 0;
                d.motor_on = r.get_u8() != 0;
                d.track = r.get_u8();
                d.step_outward = r.get_u8() != 0;
                d.double_sided = r.get_u8() != 0;
            }
            iwm.track_stale = true;
            r.exit_component();
        }
        iwm
    }

    /// Controller generation.
    #[must_use]
    pub fn kind(&self) -> IwmKind {
        self.kind
    }

    fn drive_mut(&mut self) -> &mut Drive {
        let i = usize::from(self.select_ext);
        &mut self.drives[i]
    }

    fn drive(&self) -> &Drive {
        &self.drives[usize::from(self.select_ext)]
    }

    /// The VIA's PA5 output line: selects the active head (side).
    pub fn set_sel_signal(&mut self, level: bool) {
        if self.sel != level {
            self.sel = level;
            self.track_stale = true;
        }
    }

    /// Current head position: (drive index, track, side).
    #[must_use]
    pub fn head(&self) -> (usize, u8, u8) {
        (usize::from(self.select_ext), self.drive().track, u8::from(self.sel))
    }

    /// True when the machine must re-render the track buffer.
    #[must_use]
    pub fn track_buffer_stale(&self) -> bool {
        self.track_stale
    }

    /// Installs a freshly rendered track nibble stream.
    pub fn load_track(&mut self, nibbles: Vec<u8>) {
        self.track_buf = nibbles;
        self.track_pos = 0;
        self.track_dirty = false;
        self.track_stale = false;
    }

    /// The track buffer and its dirty flag, for flush-back.
    pub fn take_dirty_track(&mut self) -> Option<Vec<u8>> {
        if self.track_dirty {
            self.track_dirty = false;
            Some(self.track_buf.clone())
        } else {
            None
        }
    }

    /// Mounts or ejects a disk in drive `index`.
    pub fn set_disk(&mut self, index: usize, present: bool, write_protected: bool) {
        let d = &mut self.drives[index];
        d.disk_in = present;
        d.write_protected = write_protected;
        self.track_stale = true;
    }

    /// Eject request latched since the last drain.
    pub fn take_eject(&mut self) -> bool {
        std::mem::take(&mut self.eject_pending)
    }

    /// Status register sense: the drive status bit addressed by
    /// CA2/CA1/CA0/SEL.
    fn sense(&self) -> bool {
        let reg = (u8::from(self.ca2) << 3) | (u8::from(self.ca1) << 2) | (u8::from(self.ca0) << 1) | u8::from(self.sel);
        let d = self.drive();
        match reg {
            0x0 => d.step_outward,          // head step direction
            0x2 => !d.disk_in,              // disk in place (active low)
            0x4 => false,                   // head stepping (instant steps)
            0x6 => !d.write_protected,      // write protect (active low)
            0x8 => !d.motor_on,             // motor on (active low)
            0xA => d.track == 0,            // track 0
            0xC => false,                   // disk switched
            0xE => !d.present,              // drive installed (active low)
            0x1 | 0x3 => false,             // tachometer lines
            0x9 => !d.double_sided,         // single/double sided
            _ => true,
        }
    }

    /// LSTRB rising edge executes the command addressed by CA2/CA1/CA0
    /// with SEL as the low bit.
    fn strobe(&mut self) {
        let cmd = (u8::from(self.ca2) << 3) | (u8::from(self.ca1) << 2) | (u8::from(self.ca0) << 1) | u8::from(self.sel);
        let d = self.drive_mut();
        match cmd {
            0x0 => d.step_outward = false, // step toward higher tracks
            0x8 => d.step_outward = true,  // step toward track 0
            0x2 => {
                // Execute one step.
                if d.step_outward {
                    d.track = d.track.saturating_sub(1);
                } else {
                    d.track = (d.track + 1).min(79);
                }
                self.track_stale = true;
            }
            0x4 => d.motor_on = true,
            0xC => d.motor_on = false,
            0xE => {
                d.disk_in = false;
                self.eject_pending = true;
                self.track_stale = true;
            }
            _ => {}
        }
    }

    fn touch_line(&mut self, index: u32) {
        let level = index & 1 != 0;
        match index >> 1 {
            line::CA0 => self.ca0 = level,
            line::CA1 => self.ca1 = level,
            line::CA2 => self.ca2 = level,
            line::LSTRB => {
                let rising = !self.lstrb && level;
                self.lstrb = level;
                if rising {
                    self.strobe();
                }
            }
            line::ENABLE => {
                self.enable = level;
                self.drive_mut().motor_on &= level;
            }
            line::SELECT => self.select_ext = level,
            line::Q6 => self.q6 = level,
            line::Q7 => self.q7 = level,
            _ => {}
        }
    }

    fn data_read(&mut self) -> u8 {
        if !self.enable || !self.drive().disk_in || self.track_buf.is_empty() {
            return 0xFF;
        }
        let v = self.track_buf[self.track_pos];
        self.track_pos = (self.track_pos + 1) % self.track_buf.len();
        v
    }

    fn data_write(&mut self, value: u8) {
        if self.track_buf.is_empty() || self.drive().write_protected {
            return;
        }
        let pos = self.track_pos;
        self.track_buf[pos] = value;
        self.track_pos = (pos + 1) % self.track_buf.len();
        self.track_dirty = true;
    }

    /// Serializes controller and drive state as one component blob.
    pub fn checkpoint(&self, w: &mut CheckpointWriter) {
        w.component(|w| {
            w.put_u8(self.ca0.into());
            w.put_u8(self.ca1.into());
            w.put_u8(self.ca2.into());
            w.put_u8(self.lstrb.into());
            w.put_u8(self.enable.into());
            w.put_u8(self.select_ext.into());
            w.put_u8(self.q6.into());
            w.put_u8(self.q7.into());
            w.put_u8(self.mode);
            w.put_u8(self.sel.into());
            for d in &self.drives {
                w.put_u8(d.present.into());
                w.put_u8(d.disk_in.into());
                w.put_u8(d.write_protected.into());
                w.put_u8(d.motor_on.into());
                w.put_u8(d.track);
                w.put_u8(d.step_outward.into());
                w.put_u8(d.double_sided.into());
            }
        });
    }

    /// Re-drives externally observable outputs after a restore.
    pub fn redrive_outputs(&mut self) {
        self.track_stale = true;
    }
}

impl MmioDevice for Iwm {
    fn read_u8(&mut self, offset: u32) -> u8 {
        self.touch_line((offset >> 9) & 0xF);
        match (self.q7, self.q6) {
            (false, false) => self.data_read(),
            (false, true) => {
                // Status: sense bit in bit 7, mode low bits below.
                (u8::from(self.sense()) << 7) | (u8::from(self.enable) << 5) | (self.mode & 0x1F)
            }
            (true, false) => 0x80, // handshake: ready
            (true, true) => self.mode,
        }
    }

    fn write_u8(&mut self, offset: u32, value: u8) {
        self.touch_line((offset >> 9) & 0xF);
        match (self.q7, self.q6) {
            (true, true) => {
                if self.enable {
                    self.data_write(value);
                } else {
                    self.mode = value & 0x1F;
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(iwm: &mut Iwm, index: u32) {
        let _ = iwm.read_u8(index << 9);
    }

    fn line_on(l: u32) -> u32 {
        l * 2 + 1
    }

    fn line_off(l: u32) -> u32 {
        l * 2
    }

    fn step_once(iwm: &mut Iwm) {
        // Address the STEP command (CA2=0 CA1=0 CA0=1, SEL low) and strobe.
        touch(iwm, line_on(line::CA0));
        touch(iwm, line_off(line::CA1));
        touch(iwm, line_off(line::CA2));
        iwm.set_sel_signal(false);
        touch(iwm, line_on(line::LSTRB));
        touch(iwm, line_off(line::LSTRB));
    }

    #[test]
    fn stepping_moves_the_head() {
        let mut iwm = Iwm::new(IwmKind::Iwm, None);
        // Set direction toward higher tracks: CA2/CA1/CA0 = 0, strobe.
        touch(&mut iwm, line_off(line::CA0));
        touch(&mut iwm, line_off(line::CA1));
        touch(&mut iwm, line_off(line::CA2));
        iwm.set_sel_signal(false);
        touch(&mut iwm, line_on(line::LSTRB));
        touch(&mut iwm, line_off(line::LSTRB));

        step_once(&mut iwm);
        step_once(&mut iwm);
        assert_eq!(iwm.head().1, 2);
        assert!(iwm.track_buffer_stale());
    }

    #[test]
    fn status_reads_write_protect_sense() {
        let mut iwm = Iwm::new(IwmKind::Iwm, None);
        iwm.set_disk(0, true, true);
        // Address sense 0x6 (CA2=0 CA1=1 CA0=1, SEL=0), Q6 on for status.
        touch(&mut iwm, line_on(line::CA0));
        touch(&mut iwm, line_on(line::CA1));
        touch(&mut iwm, line_off(line::CA2));
        iwm.set_sel_signal(false);
        touch(&mut iwm, line_off(line::Q7));
        // The status access itself touches a line; use Q6-on so the
        // addressed sense bits stay put.
        let status = iwm.read_u8(line_on(line::Q6) << 9);
        assert_eq!(status & 0x80, 0, "write-protected reads as 0 (active low)");
    }

    #[test]
    fn data_register_streams_track_nibbles() {
        let mut iwm = Iwm::new(IwmKind::Iwm, None);
        iwm.set_disk(0, true, false);
        iwm.load_track(vec![0xAA, 0xBB, 0xCC]);
        touch(&mut iwm, line_on(line::ENABLE));
        touch(&mut iwm, line_off(line::Q6));
        touch(&mut iwm, line_off(line::Q7));
        let read = |iwm: &mut Iwm| iwm.read_u8(line_on(line::ENABLE) << 9);
        assert_eq!(read(&mut iwm), 0xAA);
        assert_eq!(read(&mut iwm), 0xBB);
        assert_eq!(read(&mut iwm), 0xCC);
        assert_eq!(read(&mut iwm), 0xAA, "wraps around the track");
    }

    #[test]
    fn eject_latches_for_the_machine() {
        let mut iwm = Iwm::new(IwmKind::Iwm, None);
        iwm.set_disk(0, true, false);
        // Eject command: CA2=1 CA1=1 CA0=1, SEL=0.
        touch(&mut iwm, line_on(line::CA0));
        touch(&mut iwm, line_on(line::CA1));
        touch(&mut iwm, line_on(line::CA2));
        iwm.set_sel_signal(false);
        touch(&mut iwm, line_on(line::LSTRB));
        touch(&mut iwm, line_off(line::LSTRB));
        assert!(iwm.take_eject());
        assert!(!iwm.take_eject());
    }

    #[test]
    fn checkpoint_round_trip_keeps_head_position() {
        let mut iwm = Iwm::new(IwmKind::Swim, None);
        iwm.set_disk(0, true, false);
        touch(&mut iwm, line_off(line::CA0));
        touch(&mut iwm, line_off(line::CA1));
        touch(&mut iwm, line_off(line::CA2));
        touch(&mut iwm, line_on(line::LSTRB));
        touch(&mut iwm, line_off(line::LSTRB));
        step_once(&mut iwm);
        let mut w = CheckpointWriter::new(cortland_core::chkpt::VERSION_RLE);
        iwm.checkpoint(&mut w);
        let mut r = CheckpointReader::new(w.finish()).unwrap();
        let back = Iwm::new(IwmKind::Swim, Some(&mut r));
        assert_eq!(back.head().1, 1);
        assert!(back.track_buffer_stale(), "restored controller re-renders its track");
    }
}
