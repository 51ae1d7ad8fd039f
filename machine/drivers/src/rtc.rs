//! Clock chip: 3-wire serial protocol on VIA port B, 20 bytes of
//! parameter RAM, a 32-bit seconds counter, and the one-second line that
//! pulses VIA CA2.
//!
//! The guest bit-bangs rTCClk (PB1) and rTCData (PB0) while rTCEnb (PB2)
//! is low: first a command byte (MSB first), then a data byte read or
//! written depending on the command's direction bit.

use cortland_core::chkpt::{CheckpointReader, CheckpointWriter};

/// Port B bit assignments.
const DATA_BIT: u8 = 0x01;
const CLOCK_BIT: u8 = 0x02;
const ENABLE_BIT: u8 = 0x04;

/// Size of parameter RAM.
pub const PRAM_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Command,
    WriteData,
    ReadData,
}

/// The real-time clock and PRAM.
pub struct Rtc {
    seconds: u32,
    pram: [u8; PRAM_SIZE],
    write_protected: bool,

    // Serial engine.
    phase: Phase,
    command: u8,
    shift: u8,
    bit_count: u8,
    last_b: u8,
    /// Level the RTC drives on rTCData during reads.
    data_out: bool,
    /// One-second line level, toggled by the scheduler tick.
    one_second: bool,
}

impl Rtc {
    /// Cold state, or restored from a checkpoint component.
    #[must_use]
    pub fn new(chk: Option<&mut CheckpointReader>) -> Self {
        let mut rtc = Self {
            seconds: 0,
            pram: [0; PRAM_SIZE],
            write_protected: false,
            phase: Phase::Command,
            command: 0,
            shift: 0,
            bit_count: 0,
            last_b: 0xFF,
            data_out: true,
            one_second: false,
        };
        if let Some(r) = chk {
            r.enter_component();
            rtc.seconds = r.get_u32();
            for b in &mut rtc.pram {
                *b = r.get_u8();
            }
            rtc.write_protected = r.get_u8() != 0;
            rtc.one_second = r.get_u8() != 0;
            r.exit_component();
        }
        rtc
    }

    /// Raw seconds counter.
    #[must_use]
    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    /// PRAM contents (diagnostics and tests).
    #[must_use]
    pub fn pram(&self) -> &[u8; PRAM_SIZE] {
        &self.pram
    }

    /// Scheduler one-second tick. Returns the new line level for the
    /// machine to drive onto VIA CA2.
    pub fn tick_second(&mut self) -> bool {
        self.seconds = self.seconds.wrapping_add(1);
        self.one_second = !self.one_second;
        self.one_second
    }

    /// Level the RTC drives on rTCData while the guest reads.
    #[must_use]
    pub fn data_line(&self) -> bool {
        self.data_out
    }

    /// Observes a VIA port B write (only bits 0-2 matter).
    pub fn port_b_written(&mut self, b: u8) {
        let rising_clock = (self.last_b & CLOCK_BIT) == 0 && (b & CLOCK_BIT) != 0;
        let enabled = b & ENABLE_BIT == 0;
        if b & ENABLE_BIT != 0 && self.last_b & ENABLE_BIT == 0 {
            // Deselect aborts any transaction in flight.
            self.phase = Phase::Command;
            self.bit_count = 0;
            self.shift = 0;
        }
        if enabled && rising_clock {
            match self.phase {
                Phase::Command | Phase::WriteData => {
                    self.shift = (self.shift << 1) | (b & DATA_BIT);
                    self.bit_count += 1;
                    if self.bit_count == 8 {
                        self.byte_complete();
                    }
                }
                Phase::ReadData => {
                    self.data_out = self.shift & 0x80 != 0;
                    self.shift <<= 1;
                    self.bit_count += 1;
                    if self.bit_count == 8 {
                        self.phase = Phase::Command;
                        self.bit_count = 0;
                    }
                }
            }
        }
        self.last_b = b;
    }

    fn byte_complete(&mut self) {
        let byte = self.shift;
        self.shift = 0;
        self.bit_count = 0;
        match self.phase {
            Phase::Command => {
                self.command = byte;
                if byte & 0x80 != 0 {
                    // Read command: preload the response shifter.
                    self.shift = self.execute_read(byte);
                    self.data_out = self.shift & 0x80 != 0;
                    self.shift <<= 1;
                    self.bit_count = 1;
                    self.phase = Phase::ReadData;
                } else {
                    self.phase = Phase::WriteData;
                }
            }
            Phase::WriteData => {
                self.execute_write(self.command, byte);
                self.phase = Phase::Command;
            }
            Phase::ReadData => unreachable!("handled in port_b_written"),
        }
    }

    /// Command byte layout: z00 aaaaa 1 with bit 7 = read. Seconds
    /// registers are 0-3, PRAM is 8-31 (0x10 offset into the address
    /// space for the upper bank).
    fn reg_addr(command: u8) -> u8 {
        (command >> 2) & 0x1F
    }

    /// PRAM layout: 4 bytes at addresses 8-11, 16 more at 16-31.
    fn pram_index(addr: u8) -> Option<usize> {
        match addr {
            8..=11 => Some((addr - 8) as usize),
            16..=31 => Some((4 + addr - 16) as usize),
            _ => None,
        }
    }

    fn execute_read(&self, command: u8) -> u8 {
        let addr = Self::reg_addr(command);
        match addr {
            0..=3 => (self.seconds >> (8 * addr)) as u8,
            _ => Self::pram_index(addr).map_or(0xFF, |i| self.pram[i]),
        }
    }

    fn execute_write(&mut self, command: u8, value: u8) {
        let addr = Self::reg_addr(command);
        if addr == 13 {
            // Write-protect register: bit 7 arms it (always writable).
            self.write_protected = value & 0x80 != 0;
            return;
        }
        if self.write_protected {
            return;
        }
        match addr {
            0..=3 => {
                let shift = 8 * u32::from(addr);
                self.seconds = (self.seconds & !(0xFF << shift)) | (u32::from(value) << shift);
            }
            _ => {
                if let Some(i) = Self::pram_index(addr) {
                    self.pram[i] = value;
                }
            }
        }
    }

    /// Serializes the RTC as one component blob.
    pub fn checkpoint(&self, w: &mut CheckpointWriter) {
        w.component(|w| {
            w.put_u32(self.seconds);
            for b in &self.pram {
                w.put_u8(*b);
            }
            w.put_u8(self.write_protected.into());
            w.put_u8(self.one_second.into());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Clocks one byte into the RTC, MSB first.
    fn send_byte(rtc: &mut Rtc, byte: u8) {
        for bit in (0..8).rev() {
            let d = (byte >> bit) & 1;
            rtc.port_b_written(d); // clock low, enabled
            rtc.port_b_written(d | CLOCK_BIT); // clock high
        }
    }

    /// Clocks one byte out of the RTC.
    fn recv_byte(rtc: &mut Rtc) -> u8 {
        let mut v = 0u8;
        for _ in 0..8 {
            v = (v << 1) | u8::from(rtc.data_line());
            rtc.port_b_written(0);
            rtc.port_b_written(CLOCK_BIT);
        }
        v
    }

    fn deselect(rtc: &mut Rtc) {
        rtc.port_b_written(ENABLE_BIT);
    }

    #[test]
    fn pram_write_then_read() {
        let mut rtc = Rtc::new(None);
        // Write 0x5A to PRAM address 8 (register address 8 -> command 0x20).
        send_byte(&mut rtc, 0x20);
        send_byte(&mut rtc, 0x5A);
        deselect(&mut rtc);
        assert_eq!(rtc.pram()[0], 0x5A);

        // Read it back: command with bit 7 set.
        rtc.port_b_written(0); // reselect
        send_byte(&mut rtc, 0xA0);
        assert_eq!(recv_byte(&mut rtc), 0x5A);
    }

    #[test]
    fn seconds_counter_reads_bytewise() {
        let mut rtc = Rtc::new(None);
        for _ in 0..0x0201 {
            rtc.tick_second();
        }
        assert_eq!(rtc.seconds(), 0x0201);
        send_byte(&mut rtc, 0x80); // read seconds byte 0
        assert_eq!(recv_byte(&mut rtc), 0x01);
        deselect(&mut rtc);
        rtc.port_b_written(0);
        send_byte(&mut rtc, 0x84); // read seconds byte 1
        assert_eq!(recv_byte(&mut rtc), 0x02);
    }

    #[test]
    fn one_second_line_toggles() {
        let mut rtc = Rtc::new(None);
        assert!(rtc.tick_second());
        assert!(!rtc.tick_second());
        assert_eq!(rtc.seconds(), 2);
    }

    #[test]
    fn deselect_aborts_partial_command() {
        let mut rtc = Rtc::new(None);
        // Half a command byte, then deselect.
        for _ in 0..4 {
            rtc.port_b_written(1);
            rtc.port_b_written(1 | CLOCK_BIT);
        }
        deselect(&mut rtc);
        rtc.port_b_written(0);
        // A full transaction still works.
        send_byte(&mut rtc, 0x20);
        send_byte(&mut rtc, 0x77);
        assert_eq!(rtc.pram()[0], 0x77);
    }

    #[test]
    fn checkpoint_round_trip() {
        let mut rtc = Rtc::new(None);
        rtc.tick_second();
        send_byte(&mut rtc, 0x24);
        send_byte(&mut rtc, 0x99);
        let mut w = CheckpointWriter::new(cortland_core::chkpt::VERSION_RLE);
        rtc.checkpoint(&mut w);
        let mut r = CheckpointReader::new(w.finish()).unwrap();
        let back = Rtc::new(Some(&mut r));
        assert_eq!(back.seconds(), 1);
        assert_eq!(back.pram()[1], 0x99);
    }
}
