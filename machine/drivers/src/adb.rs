//! ADB transceiver (SE/30).
//!
//! The 68HC05-less machines drive Apple Desktop Bus through the VIA
//! shift register plus two state lines (ST0/ST1). State 0 accepts a new
//! command byte; states 1 and 2 move data bytes; state 3 idles the bus.
//! A keyboard at address 2 and a mouse at address 3 answer Talk R0 with
//! their queued event bytes.

use std::collections::VecDeque;

use cortland_core::chkpt::{CheckpointReader, CheckpointWriter};

/// Keyboard default ADB address.
pub const KBD_ADDR: u8 = 2;
/// Mouse default ADB address.
pub const MOUSE_ADDR: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Idle,
    /// Device to host (Talk).
    In,
    /// Host to device (Listen).
    Out,
}

/// The transceiver and the two built-in bus devices.
pub struct Adb {
    state: u8,
    command: u8,
    dir: Dir,
    /// Response bytes queued for the current Talk.
    response: VecDeque<u8>,
    /// Bytes collected for the current Listen.
    listen: Vec<u8>,
    /// Keyboard register 0 event queue (pairs of key transition bytes).
    kbd_events: VecDeque<[u8; 2]>,
    /// Mouse register 0 event queue.
    mouse_events: VecDeque<[u8; 2]>,
    /// Service-request level: data waiting while the bus idles.
    srq: bool,
}

impl Adb {
    /// Cold state, or restored from a checkpoint component.
    #[must_use]
    pub fn new(chk: Option<&mut CheckpointReader>) -> Self {
        let mut adb = Self {
            state: 3,
            command: 0,
            dir: Dir::Idle,
            response: VecDeque::new(),
            listen: Vec::new(),
            kbd_events: VecDeque::new(),
            mouse_events: VecDeque::new(),
            srq: false,
        };
        if let Some(r) = chk {
            r.enter_component();
            adb.state = r.get_u8();
            adb.command = r.get_u8();
            adb.srq = r.get_u8() != 0;
            let n = r.get_u32();
            for _ in 0..n {
                let a = r.get_u8();
                let b = r.get_u8();
                adb.kbd_events.push_back([a, b]);
            }
            let n = r.get_u32();
            for _ in 0..n {
                let a = r.get_u8();
                let b = r.get_u8();
                adb.mouse_events.push_back([a, b]);
            }
            r.exit_component();
        }
        adb
    }

    /// Host key event: ADB key transition byte (bit 7 = release).
    pub fn push_key(&mut self, code: u8) {
        self.kbd_events.push_back([code, 0xFF]);
        self.srq = true;
    }

    /// Host mouse event: 7-bit deltas, button in bit 7 of the first byte
    /// (active low).
    pub fn push_mouse(&mut self, dx: i8, dy: i8, button: bool) {
        let b0 = (if button { 0 } else { 0x80 }) | (dy as u8 & 0x7F);
        let b1 = 0x80 | (dx as u8 & 0x7F);
        self.mouse_events.push_back([b0, b1]);
        self.srq = true;
    }

    /// Service-request line: a device has data while the bus is idle.
    #[must_use]
    pub fn srq_asserted(&self) -> bool {
        self.srq
    }

    /// Interrupt to the CPU: a transfer byte is ready.
    #[must_use]
    pub fn irq_asserted(&self) -> bool {
        self.dir == Dir::In && !self.response.is_empty()
    }

    /// State lines ST1:ST0 from the VIA.
    pub fn set_state(&mut self, state: u8) {
        self.state = state & 3;
        if self.state == 3 {
            self.finish_listen();
            self.dir = Dir::Idle;
        }
    }

    /// A byte moved through the VIA shift register. Returns the byte the
    /// transceiver shifts back, if any.
    pub fn shift_byte(&mut self, value: u8) -> Option<u8> {
        match self.state {
            0 => {
                self.begin_command(value);
                None
            }
            1 | 2 => match self.dir {
                Dir::In => self.response.pop_front(),
                Dir::Out => {
                    self.listen.push(value);
                    None
                }
                Dir::Idle => None,
            },
            _ => None,
        }
    }

    fn begin_command(&mut self, command: u8) {
        self.command = command;
        let addr = command >> 4;
        let op = (command >> 2) & 3;
        let reg = command & 3;
        self.response.clear();
        self.listen.clear();
        match op {
            3 => {
                // Talk.
                self.dir = Dir::In;
                if reg == 0 {
                    let ev = match addr {
                        KBD_ADDR => self.kbd_events.pop_front(),
                        MOUSE_ADDR => self.mouse_events.pop_front(),
                        _ => None,
                    };
                    if let Some(bytes) = ev {
                        self.response.extend(bytes);
                    }
                } else if reg == 3 {
                    // Register 3: handler id / address.
                    self.response.extend([0x60 | addr, 0x01]);
                }
                self.srq = !self.kbd_events.is_empty() || !self.mouse_events.is_empty();
            }
            2 => {
                // Listen.
                self.dir = Dir::Out;
            }
            _ => {
                // SendReset / Flush.
                self.dir = Dir::Idle;
                if op == 0 {
                    self.kbd_events.clear();
                    self.mouse_events.clear();
                    self.srq = false;
                }
            }
        }
    }

    fn finish_listen(&mut self) {
        // Listen data is accepted and dropped; the built-in devices keep
        // fixed configurations.
        self.listen.clear();
    }

    /// Serializes the transceiver as one component blob.
    pub fn checkpoint(&self, w: &mut CheckpointWriter) {
        w.component(|w| {
            w.put_u8(self.state);
            w.put_u8(self.command);
            w.put_u8(self.srq.into());
            w.put_u32(self.kbd_events.len() as u32);
            for e in &self.kbd_events {
                w.put_u8(e[0]);
                w.put_u8(e[1]);
            }
            w.put_u32(self.mouse_events.len() as u32);
            for e in &self.mouse_events {
                w.put_u8(e[0]);
                w.put_u8(e[1]);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn talk_r0(adb: &mut Adb, addr: u8) -> Vec<u8> {
        adb.set_state(0);
        adb.shift_byte((addr << 4) | 0x0C);
        let mut out = Vec::new();
        adb.set_state(1);
        while let Some(b) = adb.shift_byte(0) {
            out.push(b);
        }
        adb.set_state(3);
        out
    }

    #[test]
    fn key_event_round_trips_through_talk() {
        let mut adb = Adb::new(None);
        adb.push_key(0x04);
        assert!(adb.srq_asserted());
        let data = talk_r0(&mut adb, KBD_ADDR);
        assert_eq!(data, vec![0x04, 0xFF]);
        assert!(!adb.srq_asserted());
    }

    #[test]
    fn empty_talk_returns_nothing() {
        let mut adb = Adb::new(None);
        assert!(talk_r0(&mut adb, KBD_ADDR).is_empty());
    }

    #[test]
    fn mouse_packet_encodes_button_and_motion() {
        let mut adb = Adb::new(None);
        adb.push_mouse(3, -2, true);
        let data = talk_r0(&mut adb, MOUSE_ADDR);
        assert_eq!(data.len(), 2);
        assert_eq!(data[0] & 0x80, 0, "button down is active low");
        assert_eq!(data[1] & 0x7F, 3);
    }

    #[test]
    fn register3_identifies_device() {
        let mut adb = Adb::new(None);
        adb.set_state(0);
        adb.shift_byte((KBD_ADDR << 4) | 0x0F); // Talk R3
        adb.set_state(1);
        let hi = adb.shift_byte(0).unwrap();
        assert_eq!(hi & 0x0F, KBD_ADDR);
    }

    #[test]
    fn reset_flushes_queues() {
        let mut adb = Adb::new(None);
        adb.push_key(1);
        adb.push_mouse(1, 1, false);
        adb.set_state(0);
        adb.shift_byte(0x00); // SendReset
        assert!(!adb.srq_asserted());
        assert!(talk_r0(&mut adb, KBD_ADDR).is_empty());
    }
}
