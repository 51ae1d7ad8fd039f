//! Apple Sound Chip (SE/30): FIFO mode.
//!
//! Two 1 KiB FIFOs (left/right) fed by the guest through the MMIO
//! window, drained at the sample clock by the machine's frame tick. The
//! chip interrupts when a FIFO crosses half empty so the driver can top
//! it up. Wavetable mode is accepted register-wise but not synthesized
//! (audio output is out of scope).

use std::collections::VecDeque;

use cortland_core::chkpt::{CheckpointReader, CheckpointWriter};
use cortland_mem::MmioDevice;

/// FIFO capacity per channel.
pub const FIFO_CAPACITY: usize = 0x400;
/// Samples drained per frame tick at 22 kHz / 60 Hz.
pub const SAMPLES_PER_FRAME: usize = 370;

/// Register offsets within the 0x2000 window.
mod reg {
    /// FIFO A window start.
    pub const FIFO_A: u32 = 0x000;
    /// FIFO B window start.
    pub const FIFO_B: u32 = 0x400;
    /// Version register.
    pub const VERSION: u32 = 0x800;
    /// Mode: 0 off, 1 FIFO, 2 wavetable.
    pub const MODE: u32 = 0x801;
    /// Channel control.
    pub const CONTROL: u32 = 0x802;
    /// FIFO status: half-empty flags.
    pub const FIFO_STATUS: u32 = 0x804;
    /// Interrupt control.
    pub const INT_CONTROL: u32 = 0x805;
    /// Volume.
    pub const VOLUME: u32 = 0x806;
}

/// The ASC.
pub struct Asc {
    mode: u8,
    control: u8,
    volume: u8,
    int_enabled: bool,
    fifo_a: VecDeque<u8>,
    fifo_b: VecDeque<u8>,
    /// Latched half-empty status bits, cleared on status read.
    status: u8,
}

impl Asc {
    /// Cold state, or restored from a checkpoint component.
    #[must_use]
    pub fn new(chk: Option<&mut CheckpointReader>) -> Self {
        let mut asc = Self {
            mode: 0,
            control: 0,
            volume: 0,
            int_enabled: false,
            fifo_a: VecDeque::new(),
            fifo_b: VecDeque::new(),
            status: 0,
        };
        if let Some(r) = chk {
            r.enter_component();
            asc.mode = r.get_u8();
            asc.control = r.get_u8();
            asc.volume = r.get_u8();
            asc.int_enabled = r.get_u8() != 0;
            asc.status = r.get_u8();
            let n = r.get_u32() as usize;
            for _ in 0..n {
                asc.fifo_a.push_back(r.get_u8());
            }
            let n = r.get_u32() as usize;
            for _ in 0..n {
                asc.fifo_b.push_back(r.get_u8());
            }
            r.exit_component();
        }
        asc
    }

    /// IRQ line: a latched half-empty condition with interrupts enabled.
    #[must_use]
    pub fn irq_asserted(&self) -> bool {
        self.int_enabled && self.status != 0
    }

    /// Frame tick: drains both FIFOs and latches half-empty crossings.
    pub fn advance_frame(&mut self) {
        if self.mode != 1 {
            return;
        }
        for _ in 0..SAMPLES_PER_FRAME {
            self.fifo_a.pop_front();
            self.fifo_b.pop_front();
        }
        if self.fifo_a.len() < FIFO_CAPACITY / 2 {
            self.status |= 0x01;
        }
        if self.fifo_b.len() < FIFO_CAPACITY / 2 {
            self.status |= 0x02;
        }
    }

    /// Serializes the chip as one component blob.
    pub fn checkpoint(&self, w: &mut CheckpointWriter) {
        w.component(|w| {
            w.put_u8(self.mode);
            w.put_u8(self.control);
            w.put_u8(self.volume);
            w.put_u8(self.int_enabled.into());
            w.put_u8(self.status);
            w.put_u32(self.fifo_a.len() as u32);
            for b in &self.fifo_a {
                w.put_u8(*b);
            }
            w.put_u32(self.fifo_b.len() as u32);
            for b in &self.fifo_b {
                w.put_u8(*b);
            }
        });
    }
}

impl MmioDevice for Asc {
    fn read_u8(&mut self, offset: u32) -> u8 {
        match offset & 0xFFF {
            reg::VERSION => 0x00, // original ASC
            reg::MODE => self.mode,
            reg::CONTROL => self.control,
            reg::FIFO_STATUS => {
                let v = self.status;
                self.status = 0;
                v
            }
            reg::INT_CONTROL => u8::from(self.int_enabled),
            reg::VOLUME => self.volume,
            _ => 0,
        }
    }

    fn write_u8(&mut self, offset: u32, value: u8) {
        match offset & 0xFFF {
            o if o < reg::FIFO_B => {
                if self.fifo_a.len() < FIFO_CAPACITY {
                    self.fifo_a.push_back(value);
                }
            }
            o if o < reg::VERSION => {
                if self.fifo_b.len() < FIFO_CAPACITY {
                    self.fifo_b.push_back(value);
                }
            }
            reg::MODE => {
                self.mode = value & 3;
                if self.mode == 0 {
                    self.fifo_a.clear();
                    self.fifo_b.clear();
                    self.status = 0;
                }
            }
            reg::CONTROL => self.control = value,
            reg::INT_CONTROL => self.int_enabled = value & 1 != 0,
            reg::VOLUME => self.volume = value,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_half_empty_interrupts() {
        let mut asc = Asc::new(None);
        asc.write_u8(reg::MODE, 1);
        asc.write_u8(reg::INT_CONTROL, 1);
        for _ in 0..FIFO_CAPACITY {
            asc.write_u8(reg::FIFO_A, 0x80);
        }
        assert!(!asc.irq_asserted());
        asc.advance_frame();
        asc.advance_frame();
        assert!(asc.irq_asserted());
        // Reading status acknowledges.
        let s = asc.read_u8(reg::FIFO_STATUS);
        assert_ne!(s & 1, 0);
        assert!(!asc.irq_asserted());
    }

    #[test]
    fn mode_zero_flushes() {
        let mut asc = Asc::new(None);
        asc.write_u8(reg::MODE, 1);
        asc.write_u8(reg::FIFO_A, 1);
        asc.write_u8(reg::MODE, 0);
        asc.write_u8(reg::MODE, 1);
        asc.advance_frame();
        assert_eq!(asc.read_u8(reg::FIFO_STATUS) & 1, 1, "empty FIFO is half-empty");
    }

    #[test]
    fn checkpoint_round_trip() {
        let mut asc = Asc::new(None);
        asc.write_u8(reg::MODE, 1);
        asc.write_u8(reg::VOLUME, 5);
        asc.write_u8(reg::FIFO_A, 0x42);
        let mut w = CheckpointWriter::new(cortland_core::chkpt::VERSION_RLE);
        asc.checkpoint(&mut w);
        let mut r = CheckpointReader::new(w.finish()).unwrap();
        let mut back = Asc::new(Some(&mut r));
        assert_eq!(back.read_u8(reg::MODE), 1);
        assert_eq!(back.read_u8(reg::VOLUME), 5);
    }
}
