//! PWM sound tap.
//!
//! The Macintosh has no sound chip on the Plus: the sound "device" is a
//! DMA tap that reads one byte per scanline from a buffer in RAM (main
//! or alternate, selected by a VIA bit), with the low bytes feeding the
//! floppy speed PWM. Audio output itself is out of scope; what matters
//! to the rest of the machine is the per-VBL phase advance and the
//! volume/enable lines the VIA drives.

use cortland_core::chkpt::{CheckpointReader, CheckpointWriter};

/// Bytes consumed from the sound buffer per frame (one per scanline).
pub const SAMPLES_PER_FRAME: u32 = 370;

/// The sound DMA tap.
pub struct Sound {
    enabled: bool,
    /// Alternate buffer selected (VIA PA3 on the Plus).
    alt_buffer: bool,
    /// Volume from VIA PA0-2.
    volume: u8,
    /// Sample phase within the buffer.
    phase: u32,
    /// Last sample observed at the tap (diagnostics).
    last_sample: u8,
}

impl Sound {
    /// Cold state, or restored from a checkpoint component.
    #[must_use]
    pub fn new(chk: Option<&mut CheckpointReader>) -> Self {
        let mut s = Self { enabled: true, alt_buffer: false, volume: 7, phase: 0, last_sample: 0 };
        if let Some(r) = chk {
            r.enter_component();
            s.enabled = r.get_u8() != 0;
            s.alt_buffer = r.get_u8() != 0;
            s.volume = r.get_u8();
            s.phase = r.get_u32();
            s.last_sample = r.get_u8();
            r.exit_component();
        }
        s
    }

    /// Enable line (VIA PB7 inverted on the Plus).
    pub fn set_enabled(&mut self, on: bool) {
        self.enabled = on;
    }

    /// Buffer select line.
    pub fn set_alt_buffer(&mut self, alt: bool) {
        self.alt_buffer = alt;
    }

    /// True when the alternate buffer is selected.
    #[must_use]
    pub fn alt_buffer(&self) -> bool {
        self.alt_buffer
    }

    /// Volume lines.
    pub fn set_volume(&mut self, volume: u8) {
        self.volume = volume & 7;
    }

    /// Current volume.
    #[must_use]
    pub fn volume(&self) -> u8 {
        self.volume
    }

    /// Current sample phase.
    #[must_use]
    pub fn phase(&self) -> u32 {
        self.phase
    }

    /// Advances one frame through the sound buffer in `ram` at
    /// `buffer_offset`, sampling every other byte the way the tap does.
    pub fn advance_vbl(&mut self, ram: &[u8], buffer_offset: usize) {
        if !self.enabled {
            return;
        }
        for _ in 0..SAMPLES_PER_FRAME {
            let at = buffer_offset + (self.phase as usize) * 2;
            if let Some(&b) = ram.get(at) {
                self.last_sample = b;
            }
            self.phase = (self.phase + 1) % SAMPLES_PER_FRAME;
        }
    }

    /// Serializes the tap as one component blob.
    pub fn checkpoint(&self, w: &mut CheckpointWriter) {
        w.component(|w| {
            w.put_u8(self.enabled.into());
            w.put_u8(self.alt_buffer.into());
            w.put_u8(self.volume);
            w.put_u32(self.phase);
            w.put_u8(self.last_sample);
        });
    }

    /// Re-drives output lines after a restore (volume and buffer select
    /// are re-read by their consumers).
    pub fn redrive_outputs(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vbl_advance_wraps_phase() {
        let mut s = Sound::new(None);
        let ram = vec![0u8; 0x1000];
        s.advance_vbl(&ram, 0);
        assert_eq!(s.phase(), 0, "full frame returns to phase 0");
    }

    #[test]
    fn disabled_tap_holds_phase() {
        let mut s = Sound::new(None);
        s.set_enabled(false);
        let ram = vec![0u8; 0x1000];
        s.advance_vbl(&ram, 0);
        assert_eq!(s.phase(), 0);
    }

    #[test]
    fn checkpoint_round_trip() {
        let mut s = Sound::new(None);
        s.set_volume(3);
        s.set_alt_buffer(true);
        let mut w = CheckpointWriter::new(cortland_core::chkpt::VERSION_RLE);
        s.checkpoint(&mut w);
        let mut r = CheckpointReader::new(w.finish()).unwrap();
        let back = Sound::new(Some(&mut r));
        assert_eq!(back.volume(), 3);
        assert!(back.alt_buffer());
    }
}
