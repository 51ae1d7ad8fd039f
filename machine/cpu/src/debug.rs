//! Breakpoints and logpoints.
//!
//! Both match on the address of the next instruction. A breakpoint pauses
//! the sprint and hands control back to the host; a logpoint emits a line
//! through the category logger and keeps running.

use std::collections::HashSet;

use cortland_core::clog;

/// A logpoint: log-and-continue at an instruction address.
#[derive(Debug, Clone)]
pub struct Logpoint {
    /// Instruction address to match.
    pub addr: u32,
    /// Extra message appended to the hit line (may be empty).
    pub message: String,
    /// Log category the line is emitted under.
    pub category: String,
    /// Log level of the line.
    pub level: u8,
    /// Times this logpoint has fired.
    pub hits: u64,
}

impl Logpoint {
    /// Creates a logpoint with the default category and level.
    #[must_use]
    pub fn new(addr: u32) -> Self {
        Self {
            addr,
            message: String::new(),
            category: "logpoint".to_owned(),
            level: cortland_core::log::INFO,
            hits: 0,
        }
    }
}

/// Debug hook state carried by the CPU.
#[derive(Debug, Default)]
pub(crate) struct DebugHooks {
    breakpoints: HashSet<u32>,
    logpoints: Vec<Logpoint>,
}

impl DebugHooks {
    pub(crate) fn add_breakpoint(&mut self, addr: u32) {
        self.breakpoints.insert(addr);
    }

    pub(crate) fn remove_breakpoint(&mut self, addr: u32) {
        self.breakpoints.remove(&addr);
    }

    pub(crate) fn breakpoint_at(&self, addr: u32) -> bool {
        !self.breakpoints.is_empty() && self.breakpoints.contains(&addr)
    }

    pub(crate) fn add_logpoint(&mut self, lp: Logpoint) {
        self.logpoints.push(lp);
    }

    /// Fires every logpoint matching `addr`.
    pub(crate) fn logpoints_at(&mut self, addr: u32) {
        if self.logpoints.is_empty() {
            return;
        }
        for lp in &mut self.logpoints {
            if lp.addr == addr {
                lp.hits += 1;
                if lp.message.is_empty() {
                    clog!(&lp.category, lp.level, "logpoint hit at {addr:#x}");
                } else {
                    clog!(&lp.category, lp.level, "logpoint hit at {addr:#x}: {}", lp.message);
                }
            }
        }
    }

    pub(crate) fn hits(&self, addr: u32) -> u64 {
        self.logpoints.iter().filter(|lp| lp.addr == addr).map(|lp| lp.hits).sum()
    }
}
