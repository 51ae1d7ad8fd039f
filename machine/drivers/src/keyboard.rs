//! Plus-style keyboard on the VIA shift register.
//!
//! The guest shifts a command byte out; the keyboard answers with one
//! byte after a short delay (the machine schedules the response event
//! and feeds the byte back through the VIA shift register).

use std::collections::VecDeque;

use cortland_core::chkpt::{CheckpointReader, CheckpointWriter};

/// Keyboard protocol command bytes.
mod cmd {
    /// Ask for a keycode; waits up to a quarter second.
    pub const INQUIRY: u8 = 0x10;
    /// Ask for a keycode; answer immediately.
    pub const INSTANT: u8 = 0x14;
    /// Identify the keyboard model.
    pub const MODEL: u8 = 0x16;
    /// Self-test.
    pub const TEST: u8 = 0x36;
}

/// Response meaning "no key transition pending".
pub const NULL_KEY: u8 = 0x7B;

/// The keyboard and its pending keycode queue.
pub struct Keyboard {
    queue: VecDeque<u8>,
}

impl Keyboard {
    /// Cold state, or restored from a checkpoint component.
    #[must_use]
    pub fn new(chk: Option<&mut CheckpointReader>) -> Self {
        let mut kb = Self { queue: VecDeque::new() };
        if let Some(r) = chk {
            r.enter_component();
            let n = r.get_u32();
            for _ in 0..n {
                kb.queue.push_back(r.get_u8());
            }
            r.exit_component();
        }
        kb
    }

    /// Host-side key event: pushes the raw transition code.
    pub fn push_key(&mut self, code: u8) {
        self.queue.push_back(code);
    }

    /// Executes one protocol command, returning the response byte.
    pub fn command(&mut self, command: u8) -> u8 {
        match command {
            cmd::INQUIRY | cmd::INSTANT => self.queue.pop_front().unwrap_or(NULL_KEY),
            cmd::MODEL => 0x0B, // M0110A
            cmd::TEST => 0x7D,  // ACK
            _ => NULL_KEY,
        }
    }

    /// True when a keycode is waiting.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Serializes the pending queue as one component blob.
    pub fn checkpoint(&self, w: &mut CheckpointWriter) {
        w.component(|w| {
            w.put_u32(self.queue.len() as u32);
            for b in &self.queue {
                w.put_u8(*b);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inquiry_drains_keys_then_nulls() {
        let mut kb = Keyboard::new(None);
        kb.push_key(0x33);
        kb.push_key(0xB3);
        assert_eq!(kb.command(cmd::INQUIRY), 0x33);
        assert_eq!(kb.command(cmd::INQUIRY), 0xB3);
        assert_eq!(kb.command(cmd::INQUIRY), NULL_KEY);
    }

    #[test]
    fn model_and_test_commands() {
        let mut kb = Keyboard::new(None);
        assert_eq!(kb.command(cmd::MODEL), 0x0B);
        assert_eq!(kb.command(cmd::TEST), 0x7D);
    }

    #[test]
    fn checkpoint_keeps_pending_keys() {
        let mut kb = Keyboard::new(None);
        kb.push_key(0x45);
        let mut w = CheckpointWriter::new(cortland_core::chkpt::VERSION_RLE);
        kb.checkpoint(&mut w);
        let mut r = CheckpointReader::new(w.finish()).unwrap();
        let mut back = Keyboard::new(Some(&mut r));
        assert_eq!(back.command(cmd::INSTANT), 0x45);
    }
}
