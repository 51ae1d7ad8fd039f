//! The CPU proper: state, bus access helpers, and the sprint loop.

use cortland_core::chkpt::{CheckpointReader, CheckpointWriter};

use crate::debug::{DebugHooks, Logpoint};
use crate::decode::DecodeTable;
use crate::exceptions::Exc;
use crate::regs::Registers;
use crate::{Bus, CpuModel, Size};

/// Why a sprint returned.
///
/// Bus and address errors are handled inside the emulated machine (a frame
/// is pushed and the handler runs); only a double fault surfaces here as
/// [`SprintExit::Halted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SprintExit {
    /// The cycle budget ran out; execution resumes next quantum.
    BudgetExhausted,
    /// A breakpoint matched before executing the instruction at this
    /// address.
    Breakpoint(u32),
    /// STOP executed; the CPU waits for an interrupt.
    Stopped,
    /// A reschedule request cut the sprint short.
    Rescheduled,
    /// Double bus fault; the CPU is halted until reset.
    Halted,
}

/// A 68000-family CPU.
pub struct Cpu {
    /// Architectural register file.
    pub regs: Registers,
    model: CpuModel,

    // 68030 control registers (zero and unreachable on the 68000).
    pub(crate) vbr: u32,
    pub(crate) sfc: u32,
    pub(crate) dfc: u32,
    pub(crate) cacr: u32,
    pub(crate) caar: u32,

    /// Prefetch word: the word at PC, refilled after each instruction.
    pub(crate) prefetch: u16,
    /// Opcode currently executing (group-0 frames stack it).
    pub(crate) current_opcode: u16,

    /// External IPL input as last sampled.
    ipl_input: u8,
    /// Level-7 edge detector; NMI retriggers only on a 0->7 transition.
    nmi_taken: bool,

    pub(crate) stopped: bool,
    halted: bool,
    pending_reschedule: bool,
    /// Set while a group-0 exception is being processed; a second fault
    /// in that window halts the CPU.
    pub(crate) in_group0: bool,

    /// Remaining cycles in the current sprint (may go slightly negative).
    pub(crate) cycles: i64,
    /// Instructions retired since power-on or restore.
    instr_count: u64,

    /// Breakpoint address to skip exactly once when resuming.
    resume_pc: Option<u32>,
    pub(crate) debug: DebugHooks,

    decode: DecodeTable,
}

impl Cpu {
    /// Creates a CPU, cold or from a checkpoint component.
    #[must_use]
    pub fn new(model: CpuModel, chk: Option<&mut CheckpointReader>) -> Self {
        let mut cpu = Self {
            regs: Registers::new(),
            model,
            vbr: 0,
            sfc: 0,
            dfc: 0,
            cacr: 0,
            caar: 0,
            prefetch: 0,
            current_opcode: 0,
            ipl_input: 0,
            nmi_taken: false,
            stopped: false,
            halted: false,
            pending_reschedule: false,
            in_group0: false,
            cycles: 0,
            instr_count: 0,
            resume_pc: None,
            debug: DebugHooks::default(),
            decode: DecodeTable::build(model),
        };
        if let Some(r) = chk {
            r.enter_component();
            cpu.regs = Registers::restore(r);
            cpu.vbr = r.get_u32();
            cpu.sfc = r.get_u32();
            cpu.dfc = r.get_u32();
            cpu.cacr = r.get_u32();
            cpu.caar = r.get_u32();
            cpu.prefetch = r.get_u16();
            cpu.ipl_input = r.get_u8();
            cpu.stopped = r.get_u8() != 0;
            cpu.halted = r.get_u8() != 0;
            cpu.instr_count = r.get_u64();
            r.exit_component();
        }
        cpu
    }

    /// The modelled CPU.
    #[must_use]
    pub fn model(&self) -> CpuModel {
        self.model
    }

    /// Instructions retired so far.
    #[must_use]
    pub fn instr_count(&self) -> u64 {
        self.instr_count
    }

    /// True after a double bus fault.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// True while parked by STOP.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Stores the external interrupt priority level input.
    pub fn set_ipl(&mut self, level: u8) {
        self.ipl_input = level & 7;
    }

    /// Asks the current/next sprint to exit as soon as possible without
    /// executing another instruction.
    pub fn reschedule(&mut self) {
        self.pending_reschedule = true;
    }

    /// Cold-boot reset: fetch initial SSP and PC from vectors 0/1.
    pub fn reset(&mut self, bus: &mut dyn Bus) {
        self.regs.sr = 0x2700;
        bus.set_supervisor(true);
        self.halted = false;
        self.stopped = false;
        self.in_group0 = false;
        self.regs.ssp = bus.read_u32(0).unwrap_or(0);
        self.regs.pc = bus.read_u32(4).unwrap_or(0);
        self.prefetch = bus.read_u16(self.regs.pc).unwrap_or(0);
    }

    // -----------------------------------------------------------------------
    // Sprint execution
    // -----------------------------------------------------------------------

    /// Runs instructions until the budget is spent or something stops the
    /// sprint. On return `budget` holds the unspent remainder, so the
    /// caller advances its clock by exactly `initial - remaining`.
    pub fn run_sprint(&mut self, budget: &mut i64, bus: &mut dyn Bus) -> SprintExit {
        self.cycles = *budget;
        // A reschedule requested between sprints is satisfied by the
        // boundary we are at now.
        self.pending_reschedule = false;
        let exit = loop {
            if self.halted {
                self.cycles = 0;
                break SprintExit::Halted;
            }

            // Interrupts are sampled at instruction boundaries. Level 7 is
            // non-maskable but edge-triggered.
            let ipl = bus.ipl();
            let take = if ipl == 7 {
                !self.nmi_taken
            } else {
                self.nmi_taken = false;
                ipl > self.regs.interrupt_mask()
            };
            self.ipl_input = ipl;
            if take && ipl != 0 {
                if ipl == 7 {
                    self.nmi_taken = true;
                }
                self.stopped = false;
                if self.enter_interrupt(bus, ipl).is_err() {
                    self.halted = true;
                    continue;
                }
            }

            if self.pending_reschedule {
                self.pending_reschedule = false;
                break SprintExit::Rescheduled;
            }
            if self.stopped {
                break SprintExit::Stopped;
            }

            // Breakpoints pause before the instruction; the address is
            // skipped exactly once on resume.
            if self.resume_pc != Some(self.regs.pc) && self.debug.breakpoint_at(self.regs.pc) {
                self.resume_pc = Some(self.regs.pc);
                break SprintExit::Breakpoint(self.regs.pc);
            }
            self.resume_pc = None;
            self.debug.logpoints_at(self.regs.pc);

            let trace = self.regs.is_trace();
            if let Err(exc) = self.step(bus) {
                if self.process_exception(bus, exc).is_err() {
                    self.halted = true;
                    continue;
                }
            }
            self.instr_count += 1;
            self.prefetch = bus.read_u16(self.regs.pc).unwrap_or(self.prefetch);

            if trace && !self.stopped && self.process_exception(bus, Exc::Trace).is_err() {
                self.halted = true;
                continue;
            }

            if bus.take_reschedule() {
                break SprintExit::Rescheduled;
            }
            if self.cycles <= 0 {
                break SprintExit::BudgetExhausted;
            }
        };
        *budget = self.cycles.max(0);
        exit
    }

    /// Fetches, decodes, and executes exactly one instruction.
    fn step(&mut self, bus: &mut dyn Bus) -> Result<(), Exc> {
        let opcode = self.fetch_u16(bus)?;
        self.current_opcode = opcode;
        self.cycles -= 4;
        self.decode.handler(opcode)(self, bus, opcode)
    }

    // -----------------------------------------------------------------------
    // Bus access helpers (alignment policy lives here)
    // -----------------------------------------------------------------------

    fn check_align(&self, addr: u32, read: bool) -> Result<(), Exc> {
        if self.model.is_68000() && addr & 1 != 0 {
            return Err(Exc::Address { addr, read, fetch: false });
        }
        Ok(())
    }

    pub(crate) fn read_u8(&mut self, bus: &mut dyn Bus, addr: u32) -> Result<u32, Exc> {
        bus.read_u8(addr).map(u32::from).map_err(|_| Exc::Bus { addr, read: true, fetch: false })
    }

    pub(crate) fn read_u16(&mut self, bus: &mut dyn Bus, addr: u32) -> Result<u32, Exc> {
        self.check_align(addr, true)?;
        bus.read_u16(addr).map(u32::from).map_err(|_| Exc::Bus { addr, read: true, fetch: false })
    }

    pub(crate) fn read_u32(&mut self, bus: &mut dyn Bus, addr: u32) -> Result<u32, Exc> {
        self.check_align(addr, true)?;
        bus.read_u32(addr).map_err(|_| Exc::Bus { addr, read: true, fetch: false })
    }

    pub(crate) fn write_u8(&mut self, bus: &mut dyn Bus, addr: u32, v: u32) -> Result<(), Exc> {
        bus.write_u8(addr, v as u8).map_err(|_| Exc::Bus { addr, read: false, fetch: false })
    }

    pub(crate) fn write_u16(&mut self, bus: &mut dyn Bus, addr: u32, v: u32) -> Result<(), Exc> {
        self.check_align(addr, false)?;
        bus.write_u16(addr, v as u16).map_err(|_| Exc::Bus { addr, read: false, fetch: false })
    }

    pub(crate) fn write_u32(&mut self, bus: &mut dyn Bus, addr: u32, v: u32) -> Result<(), Exc> {
        self.check_align(addr, false)?;
        bus.write_u32(addr, v).map_err(|_| Exc::Bus { addr, read: false, fetch: false })
    }

    pub(crate) fn read_sized(&mut self, bus: &mut dyn Bus, addr: u32, size: Size) -> Result<u32, Exc> {
        match size {
            Size::Byte => self.read_u8(bus, addr),
            Size::Word => self.read_u16(bus, addr),
            Size::Long => self.read_u32(bus, addr),
        }
    }

    pub(crate) fn write_sized(&mut self, bus: &mut dyn Bus, addr: u32, v: u32, size: Size) -> Result<(), Exc> {
        match size {
            Size::Byte => self.write_u8(bus, addr, v),
            Size::Word => self.write_u16(bus, addr, v),
            Size::Long => self.write_u32(bus, addr, v),
        }
    }

    /// Fetches the next instruction stream word. Faults here are
    /// program-space accesses in the group-0 frame.
    pub(crate) fn fetch_u16(&mut self, bus: &mut dyn Bus) -> Result<u16, Exc> {
        let addr = self.regs.pc;
        let v = self.read_u16(bus, addr).map_err(Exc::mark_fetch)?;
        self.regs.pc = self.regs.pc.wrapping_add(2);
        Ok(v as u16)
    }

    /// Fetches two instruction stream words as a long.
    pub(crate) fn fetch_u32(&mut self, bus: &mut dyn Bus) -> Result<u32, Exc> {
        let hi = self.fetch_u16(bus)?;
        let lo = self.fetch_u16(bus)?;
        Ok((u32::from(hi) << 16) | u32::from(lo))
    }

    // -----------------------------------------------------------------------
    // Stack helpers
    // -----------------------------------------------------------------------

    pub(crate) fn push_u16(&mut self, bus: &mut dyn Bus, v: u32) -> Result<(), Exc> {
        let sp = self.regs.sp().wrapping_sub(2);
        *self.regs.sp_mut() = sp;
        self.write_u16(bus, sp, v)
    }

    pub(crate) fn push_u32(&mut self, bus: &mut dyn Bus, v: u32) -> Result<(), Exc> {
        let sp = self.regs.sp().wrapping_sub(4);
        *self.regs.sp_mut() = sp;
        self.write_u32(bus, sp, v)
    }

    pub(crate) fn pop_u16(&mut self, bus: &mut dyn Bus) -> Result<u32, Exc> {
        let sp = self.regs.sp();
        let v = self.read_u16(bus, sp)?;
        *self.regs.sp_mut() = sp.wrapping_add(2);
        Ok(v)
    }

    pub(crate) fn pop_u32(&mut self, bus: &mut dyn Bus) -> Result<u32, Exc> {
        let sp = self.regs.sp();
        let v = self.read_u32(bus, sp)?;
        *self.regs.sp_mut() = sp.wrapping_add(4);
        Ok(v)
    }

    /// Writes the full SR, propagating privilege changes to the bus.
    pub(crate) fn write_sr(&mut self, bus: &mut dyn Bus, value: u16) {
        let was_sup = self.regs.is_supervisor();
        self.regs.sr = value;
        let is_sup = self.regs.is_supervisor();
        if was_sup != is_sup {
            bus.set_supervisor(is_sup);
        }
    }

    // -----------------------------------------------------------------------
    // Debug hooks
    // -----------------------------------------------------------------------

    /// Adds a breakpoint.
    pub fn add_breakpoint(&mut self, addr: u32) {
        self.debug.add_breakpoint(addr);
    }

    /// Removes a breakpoint.
    pub fn remove_breakpoint(&mut self, addr: u32) {
        self.debug.remove_breakpoint(addr);
    }

    /// Adds a logpoint.
    pub fn add_logpoint(&mut self, lp: Logpoint) {
        self.debug.add_logpoint(lp);
    }

    /// Total hits across logpoints at `addr`.
    #[must_use]
    pub fn logpoint_hits(&self, addr: u32) -> u64 {
        self.debug.hits(addr)
    }

    // -----------------------------------------------------------------------
    // Checkpoint
    // -----------------------------------------------------------------------

    /// Serializes the CPU component blob.
    pub fn checkpoint(&self, w: &mut CheckpointWriter) {
        w.component(|w| {
            self.regs.checkpoint(w);
            w.put_u32(self.vbr);
            w.put_u32(self.sfc);
            w.put_u32(self.dfc);
            w.put_u32(self.cacr);
            w.put_u32(self.caar);
            w.put_u16(self.prefetch);
            w.put_u8(self.ipl_input);
            w.put_u8(self.stopped.into());
            w.put_u8(self.halted.into());
            w.put_u64(self.instr_count);
        });
    }
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("model", &self.model)
            .field("pc", &format_args!("{:#010x}", self.regs.pc))
            .field("sr", &format_args!("{:#06x}", self.regs.sr))
            .field("instr_count", &self.instr_count)
            .field("stopped", &self.stopped)
            .field("halted", &self.halted)
            .finish_non_exhaustive()
    }
}

/// Privilege gate for supervisor-only instructions.
pub(crate) fn supervisor_check(cpu: &Cpu) -> Result<(), Exc> {
    if cpu.regs.is_supervisor() { Ok(()) } else { Err(Exc::Privilege) }
}

/// Rough extra cycle cost of an effective-address calculation.
pub(crate) fn ea_cycles(mode: u16, reg: u16, size: Size) -> i64 {
    let long_extra = if matches!(size, Size::Long) { 4 } else { 0 };
    match mode {
        0 | 1 => 0,
        2 | 3 => 4 + long_extra,
        4 => 6 + long_extra,
        5 => 8 + long_extra,
        6 => 10 + long_extra,
        7 => match reg {
            0 => 8 + long_extra,
            1 => 12 + long_extra,
            2 => 8 + long_extra,
            3 => 10 + long_extra,
            _ => 4 + long_extra,
        },
        _ => 0,
    }
}
