//! Rockwell 6522 VIA: two 8-bit ports with handshake lines, two interval
//! timers, a shift register, and the interrupt flag/enable pair that
//! feeds the machine's primary IRQ line.
//!
//! The Macintosh hangs most of its glue off this chip: the one-second
//! RTC line arrives on CA2, the VBL on CA1, the keyboard clocks through
//! the shift register, and port outputs drive the overlay bit, floppy
//! SEL, and sound volume. Timers count at CPU clock / 10; expiry is
//! event-driven through the scheduler rather than counted per cycle, so
//! the machine polls [`Via::take_timer_request`] after each access.

use bitflags::bitflags;
use cortland_core::chkpt::{CheckpointReader, CheckpointWriter};
use cortland_mem::MmioDevice;

/// Register indices (offset bits 9-12 on the Macintosh mappings).
mod reg {
    /// Port B data.
    pub const ORB: u32 = 0;
    /// Port A data (with handshake).
    pub const ORA: u32 = 1;
    /// Port B direction.
    pub const DDRB: u32 = 2;
    /// Port A direction.
    pub const DDRA: u32 = 3;
    /// Timer 1 counter low (read clears the T1 flag).
    pub const T1C_L: u32 = 4;
    /// Timer 1 counter high (write loads and starts).
    pub const T1C_H: u32 = 5;
    /// Timer 1 latch low.
    pub const T1L_L: u32 = 6;
    /// Timer 1 latch high.
    pub const T1L_H: u32 = 7;
    /// Timer 2 low.
    pub const T2C_L: u32 = 8;
    /// Timer 2 high (write loads and starts).
    pub const T2C_H: u32 = 9;
    /// Shift register.
    pub const SR: u32 = 10;
    /// Auxiliary control.
    pub const ACR: u32 = 11;
    /// Peripheral control.
    pub const PCR: u32 = 12;
    /// Interrupt flags.
    pub const IFR: u32 = 13;
    /// Interrupt enable.
    pub const IER: u32 = 14;
    /// Port A data, no handshake.
    pub const ORA_NH: u32 = 15;
}

bitflags! {
    /// Interrupt flag/enable bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Ifr: u8 {
        /// CA2 edge.
        const CA2 = 1 << 0;
        /// CA1 edge.
        const CA1 = 1 << 1;
        /// Shift register complete.
        const SR = 1 << 2;
        /// CB2 edge.
        const CB2 = 1 << 3;
        /// CB1 edge.
        const CB1 = 1 << 4;
        /// Timer 2 expiry.
        const T2 = 1 << 5;
        /// Timer 1 expiry.
        const T1 = 1 << 6;
    }
}

/// Which interval timer a scheduler event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViaTimer {
    /// Timer 1 (free-running with ACR bit 6).
    T1,
    /// Timer 2 (one-shot).
    T2,
}

/// A timer (re)arm request for the machine to convert into a scheduler
/// event. `via_ticks` counts VIA clocks (CPU clock / 10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    /// Which timer.
    pub timer: ViaTimer,
    /// Delay until expiry in VIA ticks.
    pub via_ticks: u32,
}

/// One 6522, as wired into a Macintosh.
pub struct Via {
    ora: u8,
    orb: u8,
    ddra: u8,
    ddrb: u8,
    /// External input levels on port A (bits not driven by ORA/DDRA).
    in_a: u8,
    in_b: u8,
    t1_latch: u16,
    t2_latch: u16,
    sr: u8,
    acr: u8,
    pcr: u8,
    ifr: Ifr,
    ier: Ifr,
    /// Latched CA/CB line levels for edge detection.
    ca1: bool,
    ca2: bool,
    cb1: bool,
    cb2: bool,
    /// Pending timer arm requests, drained by the machine.
    requests: Vec<TimerRequest>,
    /// Bytes shifted out (keyboard commands), drained by the machine.
    shift_out: Vec<u8>,
}

impl Via {
    /// Cold state, or restored from a checkpoint component.
    #[must_use]
    pub fn new(chk: Option<&mut CheckpointReader>) -> Self {
        let mut via = Self {
            ora: 0,
            orb: 0,
            ddra: 0,
            ddrb: 0,
            in_a: 0xFF,
            in_b: 0xFF,
            t1_latch: 0,
            t2_latch: 0,
            sr: 0,
            acr: 0,
            pcr: 0,
            ifr: Ifr::empty(),
            ier: Ifr::empty(),
            ca1: false,
            ca2: false,
            cb1: false,
            cb2: false,
            requests: Vec::new(),
            shift_out: Vec::new(),
        };
        if let Some(r) = chk {
            r.enter_component();
            via.ora = r.get_u8();
            via.orb = r.get_u8();
            via.ddra = r.get_u8();
            via.ddrb = r.get_u8();
            via.in_a = r.get_u8();
            via.in_b = r.get_u8();
            via.t1_latch = r.get_u16();
            via.t2_latch = r.get_u16();
            via.sr = r.get_u8();
            via.acr = r.get_u8();
            via.pcr = r.get_u8();
            via.ifr = Ifr::from_bits_truncate(r.get_u8());
            via.ier = Ifr::from_bits_truncate(r.get_u8());
            via.ca1 = r.get_u8() != 0;
            via.ca2 = r.get_u8() != 0;
            via.cb1 = r.get_u8() != 0;
            via.cb2 = r.get_u8() != 0;
            r.exit_component();
        }
        via
    }

    fn reg_index(offset: u32) -> u32 {
        (offset >> 9) & 0xF
    }

    // -----------------------------------------------------------------------
    // Machine-facing lines
    // -----------------------------------------------------------------------

    /// IRQ line level: any enabled flag set.
    #[must_use]
    pub fn irq_asserted(&self) -> bool {
        !(self.ifr & self.ier).is_empty()
    }

    /// Effective port A output byte (inputs read back external levels).
    #[must_use]
    pub fn port_a(&self) -> u8 {
        (self.ora & self.ddra) | (self.in_a & !self.ddra)
    }

    /// Effective port B output byte.
    #[must_use]
    pub fn port_b(&self) -> u8 {
        (self.orb & self.ddrb) | (self.in_b & !self.ddrb)
    }

    /// Drives external input bits on port A.
    pub fn set_in_a(&mut self, mask: u8, value: u8) {
        self.in_a = (self.in_a & !mask) | (value & mask);
    }

    /// Drives external input bits on port B.
    pub fn set_in_b(&mut self, mask: u8, value: u8) {
        self.in_b = (self.in_b & !mask) | (value & mask);
    }

    fn edge_flag(&mut self, flag: Ifr, old: bool, new: bool, positive: bool) {
        let fired = if positive { !old && new } else { old && !new };
        if fired {
            self.ifr |= flag;
        }
    }

    /// Drives the CA1 line (VBL on these machines).
    pub fn set_ca1(&mut self, level: bool) {
        let positive = self.pcr & 0x01 != 0;
        let old = self.ca1;
        self.ca1 = level;
        self.edge_flag(Ifr::CA1, old, level, positive);
    }

    /// Drives the CA2 line (RTC one-second on these machines).
    pub fn set_ca2(&mut self, level: bool) {
        let positive = self.pcr & 0x0C == 0x04 || self.pcr & 0x0E == 0x06;
        let old = self.ca2;
        self.ca2 = level;
        self.edge_flag(Ifr::CA2, old, level, positive);
    }

    /// Drives the CB1 line.
    pub fn set_cb1(&mut self, level: bool) {
        let positive = self.pcr & 0x10 != 0;
        let old = self.cb1;
        self.cb1 = level;
        self.edge_flag(Ifr::CB1, old, level, positive);
    }

    /// Drives the CB2 line.
    pub fn set_cb2(&mut self, level: bool) {
        let positive = self.pcr & 0xC0 == 0x40 || self.pcr & 0xE0 == 0x60;
        let old = self.cb2;
        self.cb2 = level;
        self.edge_flag(Ifr::CB2, old, level, positive);
    }

    /// Completes an external shift into the shift register (keyboard
    /// response byte).
    pub fn shift_in(&mut self, byte: u8) {
        self.sr = byte;
        self.ifr |= Ifr::SR;
    }

    /// Bytes the guest shifted out since the last drain.
    pub fn take_shift_out(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.shift_out)
    }

    /// Pending timer arm requests since the last drain.
    pub fn take_timer_requests(&mut self) -> Vec<TimerRequest> {
        std::mem::take(&mut self.requests)
    }

    /// Scheduler callback: a timer expired.
    pub fn timer_expired(&mut self, timer: ViaTimer) {
        match timer {
            ViaTimer::T1 => {
                self.ifr |= Ifr::T1;
                if self.acr & 0x40 != 0 {
                    // Free-run mode reloads from the latch.
                    self.requests.push(TimerRequest {
                        timer: ViaTimer::T1,
                        via_ticks: u32::from(self.t1_latch) + 2,
                    });
                }
            }
            ViaTimer::T2 => self.ifr |= Ifr::T2,
        }
    }

    /// Auxiliary control register (shift/timer modes).
    #[must_use]
    pub fn acr(&self) -> u8 {
        self.acr
    }

    /// Serializes this VIA as one component blob.
    pub fn checkpoint(&self, w: &mut CheckpointWriter) {
        w.component(|w| {
            w.put_u8(self.ora);
            w.put_u8(self.orb);
            w.put_u8(self.ddra);
            w.put_u8(self.ddrb);
            w.put_u8(self.in_a);
            w.put_u8(self.in_b);
            w.put_u16(self.t1_latch);
            w.put_u16(self.t2_latch);
            w.put_u8(self.sr);
            w.put_u8(self.acr);
            w.put_u8(self.pcr);
            w.put_u8(self.ifr.bits());
            w.put_u8(self.ier.bits());
            w.put_u8(self.ca1.into());
            w.put_u8(self.ca2.into());
            w.put_u8(self.cb1.into());
            w.put_u8(self.cb2.into());
        });
    }
}

impl MmioDevice for Via {
    fn read_u8(&mut self, offset: u32) -> u8 {
        match Self::reg_index(offset) {
            reg::ORB => {
                self.ifr &= !(Ifr::CB1 | Ifr::CB2);
                self.port_b()
            }
            reg::ORA => {
                self.ifr &= !(Ifr::CA1 | Ifr::CA2);
                self.port_a()
            }
            reg::DDRB => self.ddrb,
            reg::DDRA => self.ddra,
            reg::T1C_L => {
                self.ifr &= !Ifr::T1;
                (self.t1_latch & 0xFF) as u8
            }
            reg::T1C_H => (self.t1_latch >> 8) as u8,
            reg::T1L_L => (self.t1_latch & 0xFF) as u8,
            reg::T1L_H => (self.t1_latch >> 8) as u8,
            reg::T2C_L => {
                self.ifr &= !Ifr::T2;
                (self.t2_latch & 0xFF) as u8
            }
            reg::T2C_H => (self.t2_latch >> 8) as u8,
            reg::SR => {
                self.ifr &= !Ifr::SR;
                self.sr
            }
            reg::ACR => self.acr,
            reg::PCR => self.pcr,
            reg::IFR => {
                let mut v = self.ifr.bits();
                if self.irq_asserted() {
                    v |= 0x80;
                }
                v
            }
            reg::IER => self.ier.bits() | 0x80,
            _ => self.port_a(),
        }
    }

    fn write_u8(&mut self, offset: u32, value: u8) {
        match Self::reg_index(offset) {
            reg::ORB => {
                self.orb = value;
                self.ifr &= !(Ifr::CB1 | Ifr::CB2);
            }
            reg::ORA | reg::ORA_NH => {
                self.ora = value;
                if Self::reg_index(offset) == reg::ORA {
                    self.ifr &= !(Ifr::CA1 | Ifr::CA2);
                }
            }
            reg::DDRB => self.ddrb = value,
            reg::DDRA => self.ddra = value,
            reg::T1C_L | reg::T1L_L => {
                self.t1_latch = (self.t1_latch & 0xFF00) | u16::from(value);
            }
            reg::T1L_H => {
                self.t1_latch = (self.t1_latch & 0x00FF) | (u16::from(value) << 8);
            }
            reg::T1C_H => {
                self.t1_latch = (self.t1_latch & 0x00FF) | (u16::from(value) << 8);
                self.ifr &= !Ifr::T1;
                self.requests.push(TimerRequest {
                    timer: ViaTimer::T1,
                    via_ticks: u32::from(self.t1_latch) + 2,
                });
            }
            reg::T2C_L => {
                self.t2_latch = (self.t2_latch & 0xFF00) | u16::from(value);
            }
            reg::T2C_H => {
                self.t2_latch = (self.t2_latch & 0x00FF) | (u16::from(value) << 8);
                self.ifr &= !Ifr::T2;
                self.requests.push(TimerRequest {
                    timer: ViaTimer::T2,
                    via_ticks: u32::from(self.t2_latch) + 2,
                });
            }
            reg::SR => {
                self.sr = value;
                self.ifr &= !Ifr::SR;
                // Shift-out modes hand the byte to the keyboard path.
                if self.acr & 0x1C == 0x1C {
                    self.shift_out.push(value);
                    self.ifr |= Ifr::SR;
                }
            }
            reg::ACR => self.acr = value,
            reg::PCR => self.pcr = value,
            reg::IFR => {
                // Writing 1s clears flags.
                self.ifr &= !Ifr::from_bits_truncate(value);
            }
            reg::IER => {
                let bits = Ifr::from_bits_truncate(value);
                if value & 0x80 != 0 {
                    self.ier |= bits;
                } else {
                    self.ier &= !bits;
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(reg: u32) -> u32 {
        reg << 9
    }

    #[test]
    fn t1_write_high_arms_timer_and_clears_flag() {
        let mut via = Via::new(None);
        via.write_u8(at(reg::T1C_L), 0x34);
        via.write_u8(at(reg::T1C_H), 0x12);
        let reqs = via.take_timer_requests();
        assert_eq!(reqs, vec![TimerRequest { timer: ViaTimer::T1, via_ticks: 0x1234 + 2 }]);
        assert!(!via.irq_asserted());
    }

    #[test]
    fn t1_expiry_raises_enabled_interrupt_and_free_runs() {
        let mut via = Via::new(None);
        via.write_u8(at(reg::ACR), 0x40); // free-run
        via.write_u8(at(reg::IER), 0x80 | Ifr::T1.bits());
        via.write_u8(at(reg::T1C_L), 0x10);
        via.write_u8(at(reg::T1C_H), 0x00);
        via.take_timer_requests();
        via.timer_expired(ViaTimer::T1);
        assert!(via.irq_asserted());
        assert_eq!(via.take_timer_requests().len(), 1, "free-run rearms");
        // Reading T1C-L acknowledges.
        let _ = via.read_u8(at(reg::T1C_L));
        assert!(!via.irq_asserted());
    }

    #[test]
    fn t2_is_one_shot() {
        let mut via = Via::new(None);
        via.write_u8(at(reg::T2C_L), 0x10);
        via.write_u8(at(reg::T2C_H), 0x00);
        via.take_timer_requests();
        via.timer_expired(ViaTimer::T2);
        assert!(via.take_timer_requests().is_empty());
    }

    #[test]
    fn ca1_edge_respects_polarity() {
        let mut via = Via::new(None);
        via.write_u8(at(reg::PCR), 0x01); // positive edge
        via.write_u8(at(reg::IER), 0x80 | Ifr::CA1.bits());
        via.set_ca1(true);
        assert!(via.irq_asserted());
        let _ = via.read_u8(at(reg::ORA));
        assert!(!via.irq_asserted(), "reading ORA clears CA edges");
        via.set_ca1(false);
        assert!(!via.irq_asserted(), "negative edge ignored in positive mode");
    }

    #[test]
    fn port_directions_mix_inputs_and_outputs() {
        let mut via = Via::new(None);
        via.write_u8(at(reg::DDRA), 0xF0);
        via.write_u8(at(reg::ORA_NH), 0xAA);
        via.set_in_a(0x0F, 0x05);
        assert_eq!(via.port_a(), 0xA5);
    }

    #[test]
    fn ifr_write_ones_clears() {
        let mut via = Via::new(None);
        via.timer_expired(ViaTimer::T2);
        assert!(via.read_u8(at(reg::IFR)) & Ifr::T2.bits() != 0);
        via.write_u8(at(reg::IFR), Ifr::T2.bits());
        assert_eq!(via.read_u8(at(reg::IFR)) & Ifr::T2.bits(), 0);
    }

    #[test]
    fn ier_set_and_clear_protocol() {
        let mut via = Via::new(None);
        via.write_u8(at(reg::IER), 0x80 | 0x60);
        assert_eq!(via.read_u8(at(reg::IER)) & 0x7F, 0x60);
        via.write_u8(at(reg::IER), 0x40);
        assert_eq!(via.read_u8(at(reg::IER)) & 0x7F, 0x20);
    }

    #[test]
    fn checkpoint_round_trip() {
        let mut via = Via::new(None);
        via.write_u8(at(reg::DDRA), 0x7F);
        via.write_u8(at(reg::ORA_NH), 0x55);
        via.write_u8(at(reg::ACR), 0x40);
        via.timer_expired(ViaTimer::T1);
        let mut w = CheckpointWriter::new(cortland_core::chkpt::VERSION_RLE);
        via.checkpoint(&mut w);
        let mut r = CheckpointReader::new(w.finish()).unwrap();
        let mut back = Via::new(Some(&mut r));
        assert_eq!(back.read_u8(at(reg::DDRA)), 0x7F);
        assert_eq!(back.acr(), 0x40);
        assert!(back.read_u8(at(reg::IFR)) & Ifr::T1.bits() != 0);
    }
}
