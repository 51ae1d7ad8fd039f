//! The machine: ownership of every component and mediation of all
//! inter-device traffic.
//!
//! The CPU never sees devices directly. At each sprint boundary the
//! machine assembles a [`MachineBus`] over borrowed views of the memory
//! map, devices, scheduler, and interrupt state; MMIO dispatch lands in
//! [`BusEnv`], which also propagates device side effects (timer arms,
//! port lines, IRQ levels) immediately after each access. Between
//! sprints the scheduler's due events dispatch back into the machine.

use std::fs;

use cortland_core::chkpt::{CheckpointReader, CheckpointWriter, ChkptError};
use cortland_core::cinfo;
use cortland_cpu::{Bus, BusError, Cpu, MmuReg, SprintExit};
use cortland_drivers::scc::Channel;
use cortland_drivers::scsi::{BLOCK_SIZE, ScsiRequest};
use cortland_drivers::via::TimerRequest;
use cortland_drivers::{Adb, Asc, Iwm, IwmKind, Keyboard, Mouse, Rtc, Scc, Scsi, Sound, Via, ViaTimer, gcr};
use cortland_mem::map::AccessSize;
use cortland_mem::page::Mode;
use cortland_mem::{DeviceBank, DeviceId, MemoryMap, MmioDevice, Mmu};
use cortland_sched::{Event, EventTypeId, Scheduler, SpeedMode, Status};
use cortland_storage::{Image, SnapshotKind, StorageError};

use crate::config::{MachineConfig, Speed};
use crate::irq::{IrqState, source};
use crate::profile::{MachineProfile, ModelId, SE30_IO_BASE, SE30_IO_MIRRORS, SE30_IO_STRIDE, dev};

/// VIA port A bit driving the boot-time ROM overlay.
const OVERLAY_BIT: u8 = 0x10;
/// VIA port A bit selecting the floppy head (SEL).
const SEL_BIT: u8 = 0x20;
/// VIA port A bit selecting the alternate sound buffer (active low).
const ALT_SND_BIT: u8 = 0x08;
/// VIA port B bit carrying the mouse button (input, active low).
const MOUSE_BTN_BIT: u8 = 0x08;
/// VIA port B bits carrying mouse quadrature levels.
const MOUSE_X2_BIT: u8 = 0x10;
const MOUSE_Y2_BIT: u8 = 0x20;
/// VIA port B bit gating sound output (active low).
const SND_ENABLE_BIT: u8 = 0x80;
/// VIA clock divider relative to the CPU clock.
const VIA_CLOCK_DIV: u64 = 10;
/// Keyboard response latency in CPU cycles.
const KBD_RESPONSE_CYCLES: u64 = 8_000;
/// Frames per second for the VBL tick.
const VBL_HZ: u64 = 60;
/// Offset of the main sound buffer below the top of RAM.
const SOUND_MAIN_OFFSET: u32 = 0x300;
/// Offset of the alternate sound buffer below the top of RAM.
const SOUND_ALT_OFFSET: u32 = 0x5F00;

/// Errors surfaced by machine construction and checkpointing.
#[derive(Debug)]
pub enum MachineError {
    /// Checkpoint stream problems.
    Chkpt(ChkptError),
    /// Storage problems while mounting or restoring images.
    Storage(StorageError),
    /// Configuration problems.
    Config(String),
}

impl std::fmt::Display for MachineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chkpt(e) => write!(f, "checkpoint: {e}"),
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::Config(s) => write!(f, "configuration: {s}"),
        }
    }
}

impl std::error::Error for MachineError {}

impl From<ChkptError> for MachineError {
    fn from(e: ChkptError) -> Self {
        Self::Chkpt(e)
    }
}

impl From<StorageError> for MachineError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// Scheduler event types, registered once in a fixed order so ids are
/// stable across checkpoints.
pub(crate) struct EventIds {
    via1_t1: EventTypeId,
    via1_t2: EventTypeId,
    via2_t1: EventTypeId,
    via2_t2: EventTypeId,
    rtc_second: EventTypeId,
    kbd_response: EventTypeId,
    vbl: EventTypeId,
}

impl EventIds {
    fn register(sched: &mut Scheduler) -> Self {
        Self {
            via1_t1: sched.new_event_type("via", "via1", "timer1"),
            via1_t2: sched.new_event_type("via", "via1", "timer2"),
            via2_t1: sched.new_event_type("via", "via2", "timer1"),
            via2_t2: sched.new_event_type("via", "via2", "timer2"),
            rtc_second: sched.new_event_type("rtc", "rtc", "one-second"),
            kbd_response: sched.new_event_type("keyboard", "kbd", "response"),
            vbl: sched.new_event_type("video", "vbl", "frame"),
        }
    }
}

/// How a mounted image is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attach {
    Floppy,
    Scsi(u8),
}

struct ImageSlot {
    image: Image,
    attach: Attach,
}

/// All device instances, owned by the machine.
pub(crate) struct Devices {
    via1: Via,
    via2: Option<Via>,
    scc: Scc,
    rtc: Rtc,
    scsi: Scsi,
    iwm: Iwm,
    sound: Sound,
    adb: Option<Adb>,
    asc: Option<Asc>,
    keyboard: Keyboard,
    mouse: Mouse,
}

/// One emulated Macintosh.
pub struct Machine {
    profile: &'static MachineProfile,
    config: MachineConfig,
    map: MemoryMap,
    cpu: Cpu,
    sched: Scheduler,
    irq: IrqState,
    devs: Devices,
    images: Vec<ImageSlot>,
    events: EventIds,
    overlay: bool,
}

/// Profile `init` callback: wires every component in checkpoint order.
pub(crate) fn init_machine(
    profile: &'static MachineProfile,
    config: &MachineConfig,
    mut chk: Option<&mut CheckpointReader>,
) -> Result<Machine, MachineError> {
    let ram_size = config.ram_size.unwrap_or(profile.ram_size_default).min(profile.ram_size_max);

    // Components come up in checkpoint order; each consumes its blob when
    // a reader is present.
    let mut map = MemoryMap::new(profile.address_bits, ram_size, profile.rom_size, chk.as_deref_mut())
        .map_err(MachineError::Config)?;
    if profile.mmu_present && map.mmu_mut().is_none() {
        map.attach_mmu(Mmu::new(0, ram_size, profile.rom_base, profile.rom_size, profile.rom_base));
    }
    let cpu = Cpu::new(profile.cpu_model, chk.as_deref_mut());
    let mut sched = Scheduler::new(profile.cpu_clock_hz, chk.as_deref_mut());
    sched.set_speed(match config.speed {
        Speed::Max => SpeedMode::Max,
        Speed::Realtime => SpeedMode::Realtime,
        Speed::Hardware => SpeedMode::Hardware,
    });
    let irq = IrqState::new(chk.as_deref_mut());

    let rtc = Rtc::new(chk.as_deref_mut());
    let scc = Scc::new(chk.as_deref_mut());
    let sound = Sound::new(chk.as_deref_mut());
    let via1 = Via::new(chk.as_deref_mut());
    let mouse = Mouse::new(chk.as_deref_mut());

    let images = restore_images(config, chk.as_deref_mut())?;

    let mut scsi = Scsi::new(chk.as_deref_mut());
    let keyboard = Keyboard::new(chk.as_deref_mut());
    let kind = if profile.model_id == ModelId::Se30 { IwmKind::Swim } else { IwmKind::Iwm };
    let iwm = Iwm::new(kind, chk.as_deref_mut());

    let (via2, adb, asc) = if profile.via_count > 1 {
        (
            Some(Via::new(chk.as_deref_mut())),
            Some(Adb::new(chk.as_deref_mut())),
            Some(Asc::new(chk.as_deref_mut())),
        )
    } else {
        (None, None, None)
    };

    // SCSI targets mirror the mounted images.
    for slot in &images {
        if let Attach::Scsi(id) = slot.attach {
            scsi.attach_target(id, slot.image.raw_size() / u64::from(BLOCK_SIZE));
        }
    }

    let events = EventIds::register(&mut sched);

    let mut machine = Machine {
        profile,
        config: config.clone(),
        map,
        cpu,
        sched,
        irq,
        devs: Devices { via1, via2, scc, rtc, scsi, iwm, sound, adb, asc, keyboard, mouse },
        images,
        events,
        overlay: true,
    };

    machine.register_mmio();
    if let Some(rom_path) = &machine.config.rom_path {
        let rom = fs::read(rom_path).map_err(|e| MachineError::Config(format!("{}: {e}", rom_path.display())))?;
        machine.map.set_rom(&rom);
    }

    let restoring = chk.is_some();
    machine.overlay = if restoring { machine.devs.via1.port_a() & OVERLAY_BIT != 0 } else { true };
    (profile.memory_layout_init)(&mut machine.map, machine.overlay);
    machine.map.set_mode(if machine.cpu.regs.is_supervisor() { Mode::Supervisor } else { Mode::User });

    // Floppy drive 0 reflects the mounted floppy image.
    let has_floppy = machine.images.iter().any(|s| s.attach == Attach::Floppy);
    if has_floppy {
        let wp = machine.images.iter().find(|s| s.attach == Attach::Floppy).is_some_and(|s| !s.image.writable());
        machine.devs.iwm.set_disk(0, true, wp);
    }

    if restoring {
        machine.redrive_outputs();
    } else {
        machine.cold_boot();
    }
    Ok(machine)
}

fn restore_images(
    config: &MachineConfig,
    chk: Option<&mut CheckpointReader>,
) -> Result<Vec<ImageSlot>, MachineError> {
    let overlay_root = config.state_dir.join("overlays");
    let mut slots = Vec::new();
    match chk {
        Some(r) => {
            r.enter_component();
            let count = r.get_u32();
            for i in 0..count {
                let attach = match r.get_u8() {
                    0 => Attach::Floppy,
                    id => Attach::Scsi(id - 1),
                };
                let image = Image::restore(r, &overlay_root.join(i.to_string()), BLOCK_SIZE)?;
                slots.push(ImageSlot { image, attach });
            }
            r.exit_component();
        }
        None => {
            for (i, disk) in config.disks.iter().enumerate() {
                let attach = disk.scsi_id.map_or(Attach::Floppy, Attach::Scsi);
                let image = Image::open(&disk.path, disk.writable, &overlay_root.join(i.to_string()), BLOCK_SIZE)?;
                slots.push(ImageSlot { image, attach });
            }
        }
    }
    Ok(slots)
}

impl Machine {
    /// Builds a machine for `config`, cold or from a checkpoint stream.
    pub fn new(config: &MachineConfig, chk: Option<&mut CheckpointReader>) -> Result<Self, MachineError> {
        let profile = MachineProfile::by_id(config.model);
        (profile.init)(profile, config, chk)
    }

    /// The machine's profile.
    #[must_use]
    pub fn profile(&self) -> &'static MachineProfile {
        self.profile
    }

    /// The configuration this machine was built from.
    #[must_use]
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// The CPU.
    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    /// The CPU, shared.
    #[must_use]
    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    /// The scheduler.
    #[must_use]
    pub fn sched(&self) -> &Scheduler {
        &self.sched
    }

    /// The scheduler, mutable.
    pub fn sched_mut(&mut self) -> &mut Scheduler {
        &mut self.sched
    }

    /// The memory map.
    #[must_use]
    pub fn map(&self) -> &MemoryMap {
        &self.map
    }

    /// Loads ROM bytes directly (tests and the `load-rom` command).
    pub fn load_rom(&mut self, bytes: &[u8]) {
        self.map.set_rom(bytes);
    }

    /// Forces the boot-time ROM overlay on or off (normally the guest
    /// clears it through its VIA).
    pub fn set_overlay(&mut self, on: bool) {
        if self.overlay != on {
            self.overlay = on;
            (self.profile.memory_layout_init)(&mut self.map, on);
        }
    }

    /// Reads guest memory without device side effects suppressed (shell
    /// `get` command).
    pub fn peek(&mut self, addr: u32, size: AccessSize) -> u32 {
        let Machine { map, devs, sched, irq, images, profile, events, overlay, .. } = self;
        let mut env = BusEnv { devs, sched, irq, images, profile: *profile, events, reschedule: false, overlay: *overlay, overlay_request: None };
        map.read(addr, size, &mut env).unwrap_or(0)
    }

    /// Writes guest memory (shell `set` command).
    pub fn poke(&mut self, addr: u32, size: AccessSize, value: u32) {
        let Machine { map, devs, sched, irq, images, profile, events, overlay, .. } = self;
        let mut env = BusEnv { devs, sched, irq, images, profile: *profile, events, reschedule: false, overlay: *overlay, overlay_request: None };
        let _ = map.write(addr, size, value, &mut env);
    }

    fn register_mmio(&mut self) {
        match self.profile.model_id {
            ModelId::Plus => {
                self.map.add_device(0x58_0000, 0x1_0000, dev::SCSI);
                self.map.add_device(0x9F_F000, 0x1000, dev::SCC);
                self.map.add_device(0xBF_F000, 0x1000, dev::SCC);
                self.map.add_device(0xDF_E000, 0x2000, dev::IWM);
                self.map.add_device(0xEF_E000, 0x2000, dev::VIA1);
            }
            ModelId::Se30 => {
                // One I/O block, mirrored on a $20000 stride.
                for m in 0..SE30_IO_MIRRORS {
                    let base = SE30_IO_BASE + m * SE30_IO_STRIDE;
                    self.map.add_device(base, 0x2000, dev::VIA1);
                    self.map.add_device(base + 0x2000, 0x2000, dev::VIA2);
                    self.map.add_device(base + 0x4000, 0x1000, dev::SCC);
                    self.map.add_device(base + 0x1_0000, 0x1000, dev::SCSI);
                    self.map.add_device(base + 0x1_4000, 0x2000, dev::ASC);
                    self.map.add_device(base + 0x1_6000, 0x2000, dev::IWM);
                }
            }
        }
    }

    fn cold_boot(&mut self) {
        let second = self.profile.cpu_clock_hz;
        self.sched.schedule(self.events.rtc_second, 0, 0, second, 0);
        self.sched.schedule(self.events.vbl, 0, 0, second / VBL_HZ, 0);
        self.reset_cpu();
    }

    /// Re-runs the CPU reset sequence: initial SSP and PC fetch from the
    /// vector table (needed again after a late `load_rom`).
    pub fn reset_cpu(&mut self) {
        let Machine { map, cpu, devs, sched, irq, images, profile, events, overlay, .. } = self;
        let mut bus = MachineBus {
            map,
            env: BusEnv { devs, sched, irq, images, profile: *profile, events, reschedule: false, overlay: *overlay, overlay_request: None },
        };
        cpu.reset(&mut bus);
    }

    /// Invokes every device's output-redrive pass after a restore, so
    /// externally observable lines settle consistently.
    fn redrive_outputs(&mut self) {
        self.devs.iwm.redrive_outputs();
        self.devs.sound.redrive_outputs();
        let pa = self.devs.via1.port_a();
        self.devs.iwm.set_sel_signal(pa & SEL_BIT != 0);
        self.devs.sound.set_volume(pa & 7);
        self.devs.sound.set_alt_buffer(pa & ALT_SND_BIT == 0);
        self.refresh_irq();
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Runs one scheduler quantum: sprint, clock advance, event drain.
    pub fn run_quantum(&mut self) -> SprintExit {
        let budget = self.sched.next_budget();
        if budget == 0 {
            // An event is due at this very cycle; fire it before running
            // another instruction.
            while let Some(ev) = self.sched.pop_due() {
                self.dispatch_event(ev);
            }
            return SprintExit::BudgetExhausted;
        }
        self.run_quantum_with_budget(budget)
    }

    fn run_quantum_with_budget(&mut self, budget: i64) -> SprintExit {
        let mut remaining = budget;
        let exit = {
            let Machine { map, cpu, devs, sched, irq, images, profile, events, overlay, .. } = self;
            let mut bus = MachineBus {
                map,
                env: BusEnv { devs, sched, irq, images, profile: *profile, events, reschedule: false, overlay: *overlay, overlay_request: None },
            };
            let exit = cpu.run_sprint(&mut remaining, &mut bus);
            bus.apply_deferred();
            *overlay = bus.env.overlay;
            exit
        };
        self.sched.advance(budget - remaining);
        if matches!(exit, SprintExit::Stopped | SprintExit::Halted) {
            // A parked CPU idles through the rest of the quantum; events
            // must keep firing or nothing would ever wake it.
            self.sched.advance(remaining);
        }
        self.sched.set_idle(exit == SprintExit::Stopped);
        while let Some(ev) = self.sched.pop_due() {
            self.dispatch_event(ev);
        }
        exit
    }

    /// Advances by `cycles` (or until a breakpoint or halt when `None`).
    pub fn run(&mut self, cycles: Option<u64>) -> SprintExit {
        self.sched.start();
        let target = cycles.map(|n| self.sched.now() + n);
        loop {
            let exit = self.run_quantum();
            match exit {
                SprintExit::Breakpoint(_) | SprintExit::Halted => {
                    self.sched.stop();
                    return exit;
                }
                _ => {}
            }
            if let Some(t) = target {
                if self.sched.now() >= t {
                    return exit;
                }
            }
        }
    }

    /// Single-steps `n` instructions.
    pub fn step(&mut self, n: u64) {
        let target = self.cpu.instr_count() + n;
        let mut guard = 0u64;
        while self.cpu.instr_count() < target {
            self.run_quantum_with_budget(1);
            guard += 1;
            if guard > n * 1000 + 10_000 {
                // A halted CPU retires nothing; do not spin forever.
                break;
            }
        }
    }

    /// Recomputes all interrupt source bits and propagates the folded IPL
    /// to the CPU.
    fn refresh_irq(&mut self) {
        let fold = self.profile.update_ipl;
        let mut changed = false;
        changed |= self.irq.update(source::VIA1, self.devs.via1.irq_asserted(), fold);
        if let Some(via2) = &self.devs.via2 {
            changed |= self.irq.update(source::VIA2, via2.irq_asserted(), fold);
        }
        changed |= self.irq.update(source::SCC, self.devs.scc.irq_asserted(), fold);
        changed |= self.irq.update(source::SCSI, self.devs.scsi.irq_asserted(), fold);
        if let Some(asc) = &self.devs.asc {
            changed |= self.irq.update(source::ASC, asc.irq_asserted(), fold);
        }
        if changed {
            self.cpu.set_ipl(self.irq.ipl());
            self.cpu.reschedule();
        }
    }

    /// Raises or clears the programmer-switch NMI line.
    pub fn set_nmi(&mut self, active: bool) {
        let fold = self.profile.update_ipl;
        if self.irq.update(source::NMI, active, fold) {
            self.cpu.set_ipl(self.irq.ipl());
            self.cpu.reschedule();
        }
    }

    fn dispatch_event(&mut self, ev: Event) {
        let (via1_t1, via1_t2) = (self.events.via1_t1, self.events.via1_t2);
        let (via2_t1, via2_t2) = (self.events.via2_t1, self.events.via2_t2);
        let (rtc_second, kbd_response, vbl) = (self.events.rtc_second, self.events.kbd_response, self.events.vbl);
        if ev.kind == via1_t1 {
            self.devs.via1.timer_expired(ViaTimer::T1);
            self.drain_via_timers(false);
        } else if ev.kind == via1_t2 {
            self.devs.via1.timer_expired(ViaTimer::T2);
            self.drain_via_timers(false);
        } else if ev.kind == via2_t1 {
            if let Some(v) = self.devs.via2.as_mut() {
                v.timer_expired(ViaTimer::T1);
            }
            self.drain_via_timers(true);
        } else if ev.kind == via2_t2 {
            if let Some(v) = self.devs.via2.as_mut() {
                v.timer_expired(ViaTimer::T2);
            }
            self.drain_via_timers(true);
        } else if ev.kind == rtc_second {
            let level = self.devs.rtc.tick_second();
            self.devs.via1.set_ca2(level);
            let second = self.profile.cpu_clock_hz;
            self.sched.schedule(rtc_second, 0, 0, second, 0);
        } else if ev.kind == kbd_response {
            self.devs.via1.shift_in(ev.data as u8);
        } else if ev.kind == vbl {
            self.trigger_vbl();
        }
        self.refresh_irq();
    }

    fn drain_via_timers(&mut self, second: bool) {
        let (via, t1, t2, src) = if second {
            let Some(v) = self.devs.via2.as_mut() else { return };
            (v, self.events.via2_t1, self.events.via2_t2, 1u32)
        } else {
            (&mut self.devs.via1, self.events.via1_t1, self.events.via1_t2, 0u32)
        };
        for req in via.take_timer_requests() {
            let (kind, delay) = match req.timer {
                ViaTimer::T1 => (t1, u64::from(req.via_ticks) * VIA_CLOCK_DIV),
                ViaTimer::T2 => (t2, u64::from(req.via_ticks) * VIA_CLOCK_DIV),
            };
            self.sched.remove_event(kind, src);
            self.sched.schedule(kind, src, 0, delay, 0);
        }
    }

    /// Frame tick: pulses the VBL line, advances sound DMA, steps the
    /// mouse quadrature, and ticks mounted images.
    pub fn trigger_vbl(&mut self) {
        self.devs.via1.set_ca1(true);
        self.devs.via1.set_ca1(false);

        // Sound tap reads straight out of RAM.
        let ram_size = self.map.ram_size();
        let offset = if self.devs.sound.alt_buffer() {
            ram_size - SOUND_ALT_OFFSET
        } else {
            ram_size - SOUND_MAIN_OFFSET
        };
        {
            let Machine { map, devs, .. } = self;
            devs.sound.advance_vbl(map.ram(), offset as usize);
            if let Some(asc) = devs.asc.as_mut() {
                asc.advance_frame();
            }
        }

        // One quadrature step per axis per frame.
        if let Some(step) = self.devs.mouse.take_x_step() {
            self.devs.scc.set_dcd(Channel::A, step.irq_level);
            self.devs.via1.set_in_b(MOUSE_X2_BIT, if step.quad_level { MOUSE_X2_BIT } else { 0 });
        }
        if let Some(step) = self.devs.mouse.take_y_step() {
            self.devs.scc.set_dcd(Channel::B, step.irq_level);
            self.devs.via1.set_in_b(MOUSE_Y2_BIT, if step.quad_level { MOUSE_Y2_BIT } else { 0 });
        }
        let btn = self.devs.mouse.button_line();
        self.devs.via1.set_in_b(MOUSE_BTN_BIT, if btn { MOUSE_BTN_BIT } else { 0 });

        // Per-frame image housekeeping and floppy track maintenance.
        for slot in &mut self.images {
            let _ = slot.image.tick();
        }
        flush_dirty_track(&mut self.devs.iwm, &mut self.images);
        render_track_if_stale(&mut self.devs.iwm, &mut self.images);

        let frame = self.profile.cpu_clock_hz / VBL_HZ;
        self.sched.schedule(self.events.vbl, 0, 0, frame, 0);
    }

    // -----------------------------------------------------------------------
    // Checkpoint serialization
    // -----------------------------------------------------------------------

    /// Writes every component blob in checkpoint order.
    pub fn save_to_writer(&self, w: &mut CheckpointWriter, kind: SnapshotKind) -> Result<(), MachineError> {
        self.map.checkpoint(w);
        self.cpu.checkpoint(w);
        self.sched.checkpoint(w);
        self.irq.checkpoint(w);
        self.devs.rtc.checkpoint(w);
        self.devs.scc.checkpoint(w);
        self.devs.sound.checkpoint(w);
        self.devs.via1.checkpoint(w);
        self.devs.mouse.checkpoint(w);

        let mut failed = None;
        w.component(|w| {
            w.put_u32(self.images.len() as u32);
            for slot in &self.images {
                w.put_u8(match slot.attach {
                    Attach::Floppy => 0,
                    Attach::Scsi(id) => id + 1,
                });
                if let Err(e) = slot.image.checkpoint(w, kind) {
                    failed = Some(e);
                }
            }
        });
        if let Some(e) = failed {
            return Err(e.into());
        }

        self.devs.scsi.checkpoint(w);
        self.devs.keyboard.checkpoint(w);
        self.devs.iwm.checkpoint(w);
        if let (Some(via2), Some(adb), Some(asc)) = (&self.devs.via2, &self.devs.adb, &self.devs.asc) {
            via2.checkpoint(w);
            adb.checkpoint(w);
            asc.checkpoint(w);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Host-facing device access
    // -----------------------------------------------------------------------

    /// Host key event (Plus protocol code or ADB transition).
    pub fn key_event(&mut self, code: u8) {
        if let Some(adb) = self.devs.adb.as_mut() {
            adb.push_key(code);
        } else {
            self.devs.keyboard.push_key(code);
        }
    }

    /// Host mouse motion.
    pub fn mouse_motion(&mut self, dx: i32, dy: i32) {
        if let Some(adb) = self.devs.adb.as_mut() {
            adb.push_mouse(dx.clamp(-64, 63) as i8, dy.clamp(-64, 63) as i8, false);
        } else {
            self.devs.mouse.add_motion(dx, dy);
        }
    }

    /// Mounts a floppy image (the `insert-fd` command).
    pub fn insert_floppy(&mut self, path: &std::path::Path, writable: bool) -> Result<(), MachineError> {
        let overlay = self.config.state_dir.join("overlays").join(format!("fd{}", self.images.len()));
        let image = Image::open(path, writable, &overlay, BLOCK_SIZE)?;
        self.images.push(ImageSlot { image, attach: Attach::Floppy });
        self.devs.iwm.set_disk(0, true, !writable);
        cinfo!("floppy", "inserted {}", path.display());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Floppy track plumbing
// ---------------------------------------------------------------------------

/// First LBA of `(track, side)` on an 800 K double-sided layout.
fn track_start_lba(track: u8, side: u8) -> u64 {
    let mut lba = 0u64;
    for t in 0..track {
        lba += u64::from(gcr::sectors_on_track(t)) * 2;
    }
    lba + u64::from(side) * u64::from(gcr::sectors_on_track(track))
}

fn render_track_if_stale(iwm: &mut Iwm, images: &mut [ImageSlot]) {
    if !iwm.track_buffer_stale() {
        return;
    }
    let (_, track, side) = iwm.head();
    let Some(slot) = images.iter_mut().find(|s| s.attach == Attach::Floppy) else {
        iwm.load_track(Vec::new());
        return;
    };
    let mut nibbles = Vec::new();
    let base = track_start_lba(track, side);
    let tag = [0u8; gcr::TAG_LEN];
    for sector in 0..gcr::sectors_on_track(track) {
        let mut data = [0u8; gcr::DATA_LEN];
        let lba = base + u64::from(sector);
        let _ = slot.image.read_block(lba * u64::from(BLOCK_SIZE), &mut data);
        nibbles.extend(gcr::encode_sector(track, side, sector, 0x22, &tag, &data));
    }
    iwm.load_track(nibbles);
}

fn flush_dirty_track(iwm: &mut Iwm, images: &mut [ImageSlot]) {
    let Some(buf) = iwm.take_dirty_track() else { return };
    let (_, track, side) = iwm.head();
    let Some(slot) = images.iter_mut().find(|s| s.attach == Attach::Floppy) else {
        return;
    };
    let base = track_start_lba(track, side);
    let mut at = 0usize;
    while at < buf.len() {
        let Some(sector) = gcr::decode_sector(&buf[at..]) else { break };
        let lba = base + u64::from(sector.sector);
        let _ = slot.image.write_block(lba * u64::from(BLOCK_SIZE), &sector.data);
        // Skip past this sector's data mark before searching again.
        match buf[at..].windows(3).position(|w| w == [0xD5, 0xAA, 0xAD]) {
            Some(p) => at += p + 3,
            None => break,
        }
    }
}

// ---------------------------------------------------------------------------
// The bus
// ---------------------------------------------------------------------------

/// Borrowed views handed to the memory map for slow-path dispatch.
pub(crate) struct BusEnv<'a> {
    devs: &'a mut Devices,
    sched: &'a mut Scheduler,
    irq: &'a mut IrqState,
    images: &'a mut Vec<ImageSlot>,
    profile: &'static MachineProfile,
    events: &'a EventIds,
    /// An event landed inside the sprint window or the IPL changed.
    reschedule: bool,
    /// Current ROM-overlay state, mirrored from the machine.
    overlay: bool,
    /// Overlay switch requested by a VIA write; applied after the access
    /// returns (the map is borrowed during dispatch).
    overlay_request: Option<bool>,
}

fn dev_read(d: &mut impl MmioDevice, offset: u32, size: AccessSize) -> u32 {
    match size {
        AccessSize::Byte => d.read_u8(offset).into(),
        AccessSize::Word => d.read_u16(offset).into(),
        AccessSize::Long => d.read_u32(offset),
    }
}

fn dev_write(d: &mut impl MmioDevice, offset: u32, size: AccessSize, value: u32) {
    match size {
        AccessSize::Byte => d.write_u8(offset, value as u8),
        AccessSize::Word => d.write_u16(offset, value as u16),
        AccessSize::Long => d.write_u32(offset, value),
    }
}

impl BusEnv<'_> {
    /// Propagates side effects after an access to `id`.
    fn sync_device(&mut self, id: DeviceId) {
        match id {
            dev::VIA1 => {
                self.sync_via1();
            }
            dev::VIA2 => {
                self.drain_via2_timers();
            }
            dev::SCSI => {
                self.service_scsi();
            }
            dev::IWM => {
                render_track_if_stale(&mut self.devs.iwm, self.images);
            }
            _ => {}
        }
        self.refresh_irq_inline();
    }

    fn sync_via1(&mut self) {
        // Timer arms.
        for TimerRequest { timer, via_ticks } in self.devs.via1.take_timer_requests() {
            let kind = match timer {
                ViaTimer::T1 => self.events.via1_t1,
                ViaTimer::T2 => self.events.via1_t2,
            };
            self.sched.remove_event(kind, 0);
            if self.sched.schedule(kind, 0, 0, u64::from(via_ticks) * VIA_CLOCK_DIV, 0) {
                self.reschedule = true;
            }
        }

        // Shift-register bytes: ADB transceiver on ADB machines, the
        // keyboard protocol otherwise.
        for byte in self.devs.via1.take_shift_out() {
            if let Some(adb) = self.devs.adb.as_mut() {
                if let Some(resp) = adb.shift_byte(byte) {
                    self.devs.via1.shift_in(resp);
                }
            } else {
                let resp = self.devs.keyboard.command(byte);
                self.sched.remove_event(self.events.kbd_response, 0);
                if self.sched.schedule(self.events.kbd_response, 0, u64::from(resp), KBD_RESPONSE_CYCLES, 0) {
                    self.reschedule = true;
                }
            }
        }

        // Port A outputs fan out to their consumers.
        let pa = self.devs.via1.port_a();
        self.devs.iwm.set_sel_signal(pa & SEL_BIT != 0);
        render_track_if_stale(&mut self.devs.iwm, self.images);
        self.devs.sound.set_volume(pa & 7);
        self.devs.sound.set_alt_buffer(pa & ALT_SND_BIT == 0);
        let want = pa & OVERLAY_BIT != 0;
        if want != self.overlay {
            self.overlay = want;
            self.overlay_request = Some(want);
        }

        // Port B: RTC serial lines and sound enable; ADB state lines on
        // ADB machines.
        let pb = self.devs.via1.port_b();
        self.devs.rtc.port_b_written(pb);
        let data = self.devs.rtc.data_line();
        self.devs.via1.set_in_b(0x01, u8::from(data));
        self.devs.sound.set_enabled(pb & SND_ENABLE_BIT == 0);
        if let Some(adb) = self.devs.adb.as_mut() {
            adb.set_state((pb >> 4) & 3);
        }
    }

    fn drain_via2_timers(&mut self) {
        let Some(via2) = self.devs.via2.as_mut() else { return };
        for req in via2.take_timer_requests() {
            let kind = match req.timer {
                ViaTimer::T1 => self.events.via2_t1,
                ViaTimer::T2 => self.events.via2_t2,
            };
            self.sched.remove_event(kind, 1);
            if self.sched.schedule(kind, 1, 0, u64::from(req.via_ticks) * VIA_CLOCK_DIV, 0) {
                self.reschedule = true;
            }
        }
    }

    fn service_scsi(&mut self) {
        for req in self.devs.scsi.take_requests() {
            match req {
                ScsiRequest::Read { id, lba, count } => {
                    let mut data = Vec::with_capacity((count * BLOCK_SIZE) as usize);
                    if let Some(slot) = self.images.iter_mut().find(|s| s.attach == Attach::Scsi(id)) {
                        let mut block = vec![0u8; BLOCK_SIZE as usize];
                        for i in 0..u64::from(count) {
                            let _ = slot.image.read_block((lba + i) * u64::from(BLOCK_SIZE), &mut block);
                            data.extend_from_slice(&block);
                        }
                    } else {
                        data.resize((count * BLOCK_SIZE) as usize, 0);
                    }
                    self.devs.scsi.provide_read_data(data);
                }
                ScsiRequest::Write { id, lba, data } => {
                    if let Some(slot) = self.images.iter_mut().find(|s| s.attach == Attach::Scsi(id)) {
                        for (i, block) in data.chunks(BLOCK_SIZE as usize).enumerate() {
                            let _ = slot.image.write_block((lba + i as u64) * u64::from(BLOCK_SIZE), block);
                        }
                    }
                    self.devs.scsi.write_complete();
                }
            }
        }
    }

    /// IRQ fold inside a sprint: the CPU observes the new level through
    /// `Bus::ipl` at the next instruction boundary.
    fn refresh_irq_inline(&mut self) {
        let fold = self.profile.update_ipl;
        let mut changed = false;
        changed |= self.irq.update(source::VIA1, self.devs.via1.irq_asserted(), fold);
        if let Some(via2) = &self.devs.via2 {
            changed |= self.irq.update(source::VIA2, via2.irq_asserted(), fold);
        }
        changed |= self.irq.update(source::SCC, self.devs.scc.irq_asserted(), fold);
        changed |= self.irq.update(source::SCSI, self.devs.scsi.irq_asserted(), fold);
        if let Some(asc) = &self.devs.asc {
            changed |= self.irq.update(source::ASC, asc.irq_asserted(), fold);
        }
        if changed {
            self.reschedule = true;
        }
    }
}

impl DeviceBank for BusEnv<'_> {
    fn mmio_read(&mut self, id: DeviceId, offset: u32, size: AccessSize) -> u32 {
        let v = match id {
            dev::VIA1 => dev_read(&mut self.devs.via1, offset, size),
            dev::VIA2 => self.devs.via2.as_mut().map_or(0, |d| dev_read(d, offset, size)),
            dev::SCC => dev_read(&mut self.devs.scc, offset, size),
            dev::SCSI => dev_read(&mut self.devs.scsi, offset, size),
            dev::IWM => dev_read(&mut self.devs.iwm, offset, size),
            dev::ASC => self.devs.asc.as_mut().map_or(0, |d| dev_read(d, offset, size)),
            _ => 0,
        };
        self.sync_device(id);
        v
    }

    fn mmio_write(&mut self, id: DeviceId, offset: u32, size: AccessSize, value: u32) {
        match id {
            dev::VIA1 => dev_write(&mut self.devs.via1, offset, size, value),
            dev::VIA2 => {
                if let Some(d) = self.devs.via2.as_mut() {
                    dev_write(d, offset, size, value);
                }
            }
            dev::SCC => dev_write(&mut self.devs.scc, offset, size, value),
            dev::SCSI => dev_write(&mut self.devs.scsi, offset, size, value),
            dev::IWM => dev_write(&mut self.devs.iwm, offset, size, value),
            dev::ASC => {
                if let Some(d) = self.devs.asc.as_mut() {
                    dev_write(d, offset, size, value);
                }
            }
            _ => {}
        }
        self.sync_device(id);
    }
}

/// The CPU's view of the machine for one sprint.
pub(crate) struct MachineBus<'a> {
    map: &'a mut MemoryMap,
    env: BusEnv<'a>,
}

impl MachineBus<'_> {
    /// Applies effects that could not touch the map mid-dispatch.
    fn apply_deferred(&mut self) {
        if let Some(overlay) = self.env.overlay_request.take() {
            // Re-laying out pages is idempotent; only do it on a change.
            (self.env.profile.memory_layout_init)(self.map, overlay);
        }
    }
}

impl Bus for MachineBus<'_> {
    fn read_u8(&mut self, addr: u32) -> Result<u8, BusError> {
        let r = self.map.read(addr, AccessSize::Byte, &mut self.env).map(|v| v as u8).map_err(|_| BusError);
        self.apply_deferred();
        r
    }

    fn read_u16(&mut self, addr: u32) -> Result<u16, BusError> {
        let r = self.map.read(addr, AccessSize::Word, &mut self.env).map(|v| v as u16).map_err(|_| BusError);
        self.apply_deferred();
        r
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, BusError> {
        let r = self.map.read(addr, AccessSize::Long, &mut self.env).map_err(|_| BusError);
        self.apply_deferred();
        r
    }

    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), BusError> {
        let r = self.map.write(addr, AccessSize::Byte, value.into(), &mut self.env).map_err(|_| BusError);
        self.apply_deferred();
        r
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), BusError> {
        let r = self.map.write(addr, AccessSize::Word, value.into(), &mut self.env).map_err(|_| BusError);
        self.apply_deferred();
        r
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), BusError> {
        let r = self.map.write(addr, AccessSize::Long, value, &mut self.env).map_err(|_| BusError);
        self.apply_deferred();
        r
    }

    fn ipl(&mut self) -> u8 {
        self.env.irq.ipl()
    }

    fn set_supervisor(&mut self, supervisor: bool) {
        self.map.set_mode(if supervisor { Mode::Supervisor } else { Mode::User });
    }

    fn take_reschedule(&mut self) -> bool {
        std::mem::take(&mut self.env.reschedule)
    }

    fn reset_devices(&mut self) {
        // The RESET instruction pulses every peripheral's reset line; the
        // devices here re-latch their idle levels.
        self.env.devs.via1 = Via::new(None);
        if self.env.devs.via2.is_some() {
            self.env.devs.via2 = Some(Via::new(None));
        }
    }

    fn pmove_read(&mut self, reg: MmuReg) -> u64 {
        let Some(mmu) = self.map.mmu_mut() else { return 0 };
        match reg {
            MmuReg::Tc => mmu.tc().into(),
            MmuReg::Crp | MmuReg::Srp => mmu.crp(),
            MmuReg::Tt0 => mmu.tt0().into(),
            MmuReg::Tt1 => mmu.tt1().into(),
            MmuReg::Mmusr => mmu.mmusr().bits().into(),
        }
    }

    fn pmove_write(&mut self, reg: MmuReg, value: u64) {
        match reg {
            MmuReg::Tc => self.map.mmu_set_tc(value as u32),
            MmuReg::Crp | MmuReg::Srp => self.map.mmu_set_crp(value),
            MmuReg::Tt0 => self.map.mmu_set_tt0(value as u32),
            MmuReg::Tt1 => self.map.mmu_set_tt1(value as u32),
            MmuReg::Mmusr => {
                if let Some(mmu) = self.map.mmu_mut() {
                    mmu.set_mmusr(value as u16);
                }
            }
        }
    }

    fn ptest(&mut self, addr: u32, is_write: bool, supervisor: bool) -> u16 {
        self.map.mmu_test_address(addr, is_write, supervisor).map_or(0, |sr| sr.bits())
    }

    fn pflush(&mut self) {
        self.map.mmu_invalidate();
    }
}

/// Scheduler status, re-exported for the shell layer.
#[must_use]
pub fn status_code(status: Status) -> i32 {
    match status {
        Status::Stopped => 0,
        Status::Running => 1,
        Status::Idle => 2,
    }
}
