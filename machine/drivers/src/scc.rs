//! Zilog 8530 SCC: two async serial channels.
//!
//! On these machines channel A carries AppleTalk framing and both
//! channels' DCD pins sample the mouse quadrature lines, so interrupt
//! behavior matters much more than baud-rate accuracy. The register file
//! is the usual pointer-latched scheme: a control write first selects a
//! register, the next access hits it.

use cortland_core::chkpt::{CheckpointReader, CheckpointWriter};
use cortland_mem::MmioDevice;

/// Channel index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Channel A (modem port).
    A,
    /// Channel B (printer port).
    B,
}

/// Per-channel state.
#[derive(Default)]
struct ChannelState {
    /// Write registers 0-15.
    wr: [u8; 16],
    /// Receive FIFO fed by the host side.
    rx: Vec<u8>,
    /// Transmitted bytes, drained by the host side.
    tx: Vec<u8>,
    /// DCD pin level (mouse quadrature).
    dcd: bool,
    /// Latched status-change interrupt.
    ext_ip: bool,
    rx_ip: bool,
}

impl ChannelState {
    fn rr0(&self) -> u8 {
        let mut v = 0x04; // tx buffer empty
        if !self.rx.is_empty() {
            v |= 0x01;
        }
        if self.dcd {
            v |= 0x08;
        }
        v
    }

    fn int_pending(&self) -> bool {
        let ext_enabled = self.wr[1] & 0x01 != 0;
        let rx_enabled = self.wr[1] & 0x18 != 0;
        (self.ext_ip && ext_enabled) || (self.rx_ip && rx_enabled)
    }
}

/// One 8530.
pub struct Scc {
    a: ChannelState,
    b: ChannelState,
    /// Pointer latched by the last control write.
    ptr: u8,
}

impl Scc {
    /// Cold state, or restored from a checkpoint component.
    #[must_use]
    pub fn new(chk: Option<&mut CheckpointReader>) -> Self {
        let mut scc = Self { a: ChannelState::default(), b: ChannelState::default(), ptr: 0 };
        if let Some(r) = chk {
            r.enter_component();
            for ch in [&mut scc.a, &mut scc.b] {
                for w in &mut ch.wr {
                    *w = r.get_u8();
                }
                ch.dcd = r.get_u8() != 0;
                ch.ext_ip = r.get_u8() != 0;
                ch.rx_ip = r.get_u8() != 0;
            }
            scc.ptr = r.get_u8();
            r.exit_component();
        }
        scc
    }

    fn chan_mut(&mut self, ch: Channel) -> &mut ChannelState {
        match ch {
            Channel::A => &mut self.a,
            Channel::B => &mut self.b,
        }
    }

    /// IRQ line: any channel's enabled condition pending, gated by the
    /// master interrupt enable (WR9 MIE, kept in channel A's file).
    #[must_use]
    pub fn irq_asserted(&self) -> bool {
        let mie = self.a.wr[9] & 0x08 != 0;
        mie && (self.a.int_pending() || self.b.int_pending())
    }

    /// Drives a channel's DCD pin; a change latches an external-status
    /// interrupt (this is how mouse motion interrupts the CPU).
    pub fn set_dcd(&mut self, ch: Channel, level: bool) {
        let c = self.chan_mut(ch);
        if c.dcd != level {
            c.dcd = level;
            c.ext_ip = true;
        }
    }

    /// Feeds a received byte into a channel's FIFO.
    pub fn receive(&mut self, ch: Channel, byte: u8) {
        let c = self.chan_mut(ch);
        c.rx.push(byte);
        c.rx_ip = true;
    }

    /// Drains bytes the guest transmitted.
    pub fn take_tx(&mut self, ch: Channel) -> Vec<u8> {
        std::mem::take(&mut self.chan_mut(ch).tx)
    }

    /// Decodes a Macintosh SCC offset: bit 1 selects the channel, bit 2
    /// selects data vs control.
    fn decode(offset: u32) -> (Channel, bool) {
        let ch = if offset & 2 != 0 { Channel::A } else { Channel::B };
        let data = offset & 4 != 0;
        (ch, data)
    }

    fn chan(&self, ch: Channel) -> &ChannelState {
        match ch {
            Channel::A => &self.a,
            Channel::B => &self.b,
        }
    }

    fn read_control(&mut self, ch: Channel) -> u8 {
        let ptr = self.ptr;
        self.ptr = 0;
        match ptr {
            0 => self.chan(ch).rr0(),
            1 => 0x01, // all sent
            2 => 0,    // vector (autovectored machines ignore it)
            3 => {
                // RR3: interrupt pending bits, channel A only.
                let mut v = 0;
                if self.a.rx_ip {
                    v |= 0x20;
                }
                if self.a.ext_ip {
                    v |= 0x08;
                }
                if self.b.rx_ip {
                    v |= 0x04;
                }
                if self.b.ext_ip {
                    v |= 0x01;
                }
                v
            }
            12 | 13 | 15 => self.chan(ch).wr[ptr as usize],
            _ => 0,
        }
    }

    fn write_control(&mut self, ch: Channel, value: u8) {
        if self.ptr == 0 {
            let reg = value & 0x0F;
            let cmd = (value >> 3) & 7;
            match cmd {
                2 => {
                    // Reset external/status interrupts.
                    self.chan_mut(ch).ext_ip = false;
                }
                _ => {}
            }
            if reg != 0 {
                self.ptr = reg;
                return;
            }
            // Plain WR0 write with no pointer: command handled above.
            return;
        }
        let ptr = self.ptr;
        self.ptr = 0;
        let c = self.chan_mut(ch);
        c.wr[ptr as usize] = value;
    }

    fn read_data(&mut self, ch: Channel) -> u8 {
        let c = self.chan_mut(ch);
        let v = if c.rx.is_empty() { 0 } else { c.rx.remove(0) };
        if c.rx.is_empty() {
            c.rx_ip = false;
        }
        v
    }

    fn write_data(&mut self, ch: Channel, value: u8) {
        self.chan_mut(ch).tx.push(value);
    }

    /// Serializes this SCC as one component blob.
    pub fn checkpoint(&self, w: &mut CheckpointWriter) {
        w.component(|w| {
            for ch in [&self.a, &self.b] {
                for v in &ch.wr {
                    w.put_u8(*v);
                }
                w.put_u8(ch.dcd.into());
                w.put_u8(ch.ext_ip.into());
                w.put_u8(ch.rx_ip.into());
            }
            w.put_u8(self.ptr);
        });
    }
}

impl MmioDevice for Scc {
    fn read_u8(&mut self, offset: u32) -> u8 {
        let (ch, data) = Self::decode(offset);
        if data { self.read_data(ch) } else { self.read_control(ch) }
    }

    fn write_u8(&mut self, offset: u32, value: u8) {
        let (ch, data) = Self::decode(offset);
        if data {
            self.write_data(ch, value);
        } else {
            self.write_control(ch, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A_CTRL: u32 = 2;
    const A_DATA: u32 = 6;

    fn enabled_scc() -> Scc {
        let mut scc = Scc::new(None);
        // WR9 MIE on channel A side.
        scc.write_u8(A_CTRL, 9);
        scc.write_u8(A_CTRL, 0x08);
        // WR1: ext + rx interrupts enabled.
        scc.write_u8(A_CTRL, 1);
        scc.write_u8(A_CTRL, 0x11);
        scc
    }

    #[test]
    fn pointer_latching_selects_register() {
        let mut scc = Scc::new(None);
        scc.write_u8(A_CTRL, 12);
        scc.write_u8(A_CTRL, 0x7E);
        scc.write_u8(A_CTRL, 12);
        assert_eq!(scc.read_u8(A_CTRL), 0x7E);
    }

    #[test]
    fn dcd_change_raises_interrupt_until_reset() {
        let mut scc = enabled_scc();
        assert!(!scc.irq_asserted());
        scc.set_dcd(Channel::A, true);
        assert!(scc.irq_asserted());
        // WR0 "reset external/status" command clears it.
        scc.write_u8(A_CTRL, 0x10);
        assert!(!scc.irq_asserted());
    }

    #[test]
    fn rx_byte_interrupts_and_drains() {
        let mut scc = enabled_scc();
        scc.receive(Channel::A, 0x42);
        assert!(scc.irq_asserted());
        assert_eq!(scc.read_u8(A_CTRL) & 0x01, 0x01, "RR0 rx available");
        assert_eq!(scc.read_u8(A_DATA), 0x42);
        assert!(!scc.irq_asserted());
    }

    #[test]
    fn tx_bytes_are_collected() {
        let mut scc = Scc::new(None);
        scc.write_u8(A_DATA, 0x12);
        scc.write_u8(A_DATA, 0x34);
        assert_eq!(scc.take_tx(Channel::A), vec![0x12, 0x34]);
        assert!(scc.take_tx(Channel::A).is_empty());
    }

    #[test]
    fn checkpoint_round_trip() {
        let mut scc = enabled_scc();
        scc.set_dcd(Channel::A, true);
        let mut w = CheckpointWriter::new(cortland_core::chkpt::VERSION_RLE);
        scc.checkpoint(&mut w);
        let mut r = CheckpointReader::new(w.finish()).unwrap();
        let back = Scc::new(Some(&mut r));
        assert!(back.irq_asserted(), "pending ext interrupt survives");
        assert!(back.chan(Channel::A).dcd);
    }
}
