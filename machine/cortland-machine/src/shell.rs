//! Typed shell-command handlers.
//!
//! The interactive shell itself lives outside the core; these functions
//! are the stable contracts it calls into. Argument errors come back as
//! [`ShellError::Usage`] and never touch machine state; results that the
//! shell reports as exit codes come back as plain integers.

use std::fmt;
use std::path::Path;

use cortland_core::log;
use cortland_cpu::Logpoint;
use cortland_mem::map::AccessSize;
use cortland_storage::SnapshotKind;

use crate::checkpoint;
use crate::config::MachineConfig;
use crate::machine::{Machine, status_code};
use crate::screenshot::{self, Region};

/// Shell-command failures.
#[derive(Debug)]
pub enum ShellError {
    /// Bad arguments; machine state untouched.
    Usage(String),
    /// The operation itself failed.
    Failed(String),
}

impl fmt::Display for ShellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usage(s) => write!(f, "usage: {s}"),
            Self::Failed(s) => f.write_str(s),
        }
    }
}

impl std::error::Error for ShellError {}

/// Parses a numeric argument: `0x` hex, `$` hex, or decimal.
pub fn parse_value(s: &str) -> Result<u32, ShellError> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if let Some(hex) = s.strip_prefix('$') {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| ShellError::Usage(format!("bad number {s:?}")))
}

/// `run [N]`: advance by N cycles, or until a breakpoint or halt.
pub fn run(m: &mut Machine, cycles: Option<u64>) -> i32 {
    m.run(cycles);
    0
}

/// `stop`: stop the scheduler.
pub fn stop(m: &mut Machine) -> i32 {
    m.sched_mut().stop();
    0
}

/// `status`: 0 stopped, 1 running, 2 idle.
pub fn status(m: &Machine) -> i32 {
    status_code(m.sched().status())
}

/// `s [N]`: single-step N instructions (default 1).
pub fn step(m: &mut Machine, n: Option<u64>) -> i32 {
    m.step(n.unwrap_or(1));
    0
}

/// One `get`/`set` target.
enum Target {
    D(usize),
    A(u8),
    Usp,
    Ssp,
    Pc,
    Sr,
    Ccr,
    Flag(u16),
    Instr,
    Mem(u32, AccessSize),
}

fn parse_target(s: &str) -> Result<Target, ShellError> {
    let lower = s.to_ascii_lowercase();
    if let Some((addr, size)) = lower.rsplit_once('.') {
        if let Ok(addr) = parse_value(addr) {
            let size = match size {
                "b" => AccessSize::Byte,
                "w" => AccessSize::Word,
                "l" => AccessSize::Long,
                _ => return Err(ShellError::Usage(format!("bad size suffix in {s:?}"))),
            };
            return Ok(Target::Mem(addr, size));
        }
    }
    Ok(match lower.as_str() {
        "d0" | "d1" | "d2" | "d3" | "d4" | "d5" | "d6" | "d7" => {
            Target::D((lower.as_bytes()[1] - b'0') as usize)
        }
        "a0" | "a1" | "a2" | "a3" | "a4" | "a5" | "a6" | "a7" => Target::A(lower.as_bytes()[1] - b'0'),
        "sp" => Target::A(7),
        "usp" => Target::Usp,
        "ssp" => Target::Ssp,
        "pc" => Target::Pc,
        "sr" => Target::Sr,
        "ccr" => Target::Ccr,
        "x" => Target::Flag(1 << 4),
        "n" => Target::Flag(1 << 3),
        "z" => Target::Flag(1 << 2),
        "v" => Target::Flag(1 << 1),
        "c" => Target::Flag(1 << 0),
        "instr" => Target::Instr,
        _ => return Err(ShellError::Usage(format!("unknown register {s:?}"))),
    })
}

/// `get <reg|addr.size>`: the value, zero-extended.
pub fn get(m: &mut Machine, target: &str) -> Result<u32, ShellError> {
    Ok(match parse_target(target)? {
        Target::D(i) => m.cpu().regs.d[i],
        Target::A(i) => m.cpu().regs.a(i),
        Target::Usp => m.cpu().regs.usp,
        Target::Ssp => m.cpu().regs.ssp,
        Target::Pc => m.cpu().regs.pc,
        Target::Sr => m.cpu().regs.sr.into(),
        Target::Ccr => m.cpu().regs.ccr().into(),
        Target::Flag(bit) => u32::from(m.cpu().regs.sr & bit != 0),
        Target::Instr => m.cpu().instr_count() as u32,
        Target::Mem(addr, size) => m.peek(addr, size),
    })
}

/// `set <reg|addr.size> <value>`.
pub fn set(m: &mut Machine, target: &str, value: &str) -> Result<(), ShellError> {
    let v = parse_value(value)?;
    match parse_target(target)? {
        Target::D(i) => m.cpu_mut().regs.d[i] = v,
        Target::A(i) => m.cpu_mut().regs.set_a(i, v),
        Target::Usp => m.cpu_mut().regs.usp = v,
        Target::Ssp => m.cpu_mut().regs.ssp = v,
        Target::Pc => m.cpu_mut().regs.pc = v,
        Target::Sr => m.cpu_mut().regs.sr = v as u16,
        Target::Ccr => m.cpu_mut().regs.set_ccr(v as u8),
        Target::Flag(bit) => {
            let sr = m.cpu().regs.sr;
            m.cpu_mut().regs.sr = if v != 0 { sr | bit } else { sr & !bit };
        }
        Target::Instr => return Err(ShellError::Usage("instr is read-only".into())),
        Target::Mem(addr, size) => m.poke(addr, size, v),
    }
    Ok(())
}

/// `br <addr>`: add a breakpoint.
pub fn breakpoint(m: &mut Machine, addr: &str) -> Result<(), ShellError> {
    let addr = parse_value(addr)?;
    m.cpu_mut().add_breakpoint(addr);
    Ok(())
}

/// `logpoint <addr> [message] [category=<name>] [level=<n>]`.
pub fn logpoint(
    m: &mut Machine,
    addr: &str,
    message: Option<&str>,
    category: Option<&str>,
    level: Option<u8>,
) -> Result<(), ShellError> {
    let mut lp = Logpoint::new(parse_value(addr)?);
    if let Some(msg) = message {
        lp.message = msg.to_owned();
    }
    if let Some(cat) = category {
        lp.category = cat.to_owned();
    }
    if let Some(lvl) = level {
        lp.level = lvl;
    }
    m.cpu_mut().add_logpoint(lp);
    Ok(())
}

/// `log <category> <level>`: set a per-category threshold.
pub fn log_threshold(category: &str, level: u8) -> i32 {
    log::set_threshold(category, level);
    0
}

/// `save-state <path> [refs]`: `refs` saves the quick kind.
pub fn save_state(m: &Machine, path: &Path, refs: bool) -> Result<(), ShellError> {
    let kind = if refs { SnapshotKind::Quick } else { SnapshotKind::Consolidated };
    checkpoint::save(m, path, kind).map_err(|e| ShellError::Failed(e.to_string()))
}

/// `load-state [<path>]`: rebuilds the machine from a checkpoint (the
/// newest in the state directory when no path is given).
pub fn load_state(config: &MachineConfig, path: Option<&Path>) -> Result<Machine, ShellError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => checkpoint::newest(&config.state_dir)
            .ok_or_else(|| ShellError::Failed("no checkpoint found".into()))?,
    };
    checkpoint::load(config, &path).map_err(|e| ShellError::Failed(e.to_string()))
}

/// `load-state probe`: 0 iff a valid newest checkpoint exists.
pub fn load_state_probe(config: &MachineConfig) -> i32 {
    match checkpoint::newest(&config.state_dir) {
        Some(p) if checkpoint::probe(&p) => 0,
        _ => 1,
    }
}

/// `checkpoint clear`.
pub fn checkpoint_clear(config: &MachineConfig) -> Result<(), ShellError> {
    checkpoint::clear(&config.state_dir).map_err(|e| ShellError::Failed(e.to_string()))
}

/// `screenshot --checksum [top left bottom right]`.
pub fn screenshot_checksum(m: &Machine, region: Option<(u32, u32, u32, u32)>) -> u32 {
    let region = region.map_or_else(Region::full, |(top, left, bottom, right)| Region {
        top,
        left,
        bottom,
        right,
    });
    screenshot::checksum(m, region)
}

/// `insert-fd --probe <path>`: recognized floppy image sizes.
#[must_use]
pub fn insert_fd_probe(path: &Path) -> bool {
    matches!(
        std::fs::metadata(path).map(|m| m.len()),
        Ok(409_600 | 819_200 | 1_474_560)
    )
}

/// `load-rom --probe <path>`: plausible ROM image sizes.
#[must_use]
pub fn load_rom_probe(path: &Path) -> bool {
    matches!(
        std::fs::metadata(path).map(|m| m.len()),
        Ok(0x1_0000 | 0x2_0000 | 0x4_0000 | 0x8_0000)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ModelId;

    fn machine() -> Machine {
        let mut cfg = MachineConfig::for_model(ModelId::Plus);
        cfg.state_dir = std::env::temp_dir().join(format!("cortland-shell-{}", std::process::id()));
        Machine::new(&cfg, None).unwrap()
    }

    #[test]
    fn register_round_trips() {
        let mut m = machine();
        set(&mut m, "D5", "0x12345678").unwrap();
        assert_eq!(get(&mut m, "d5").unwrap(), 0x1234_5678);
        set(&mut m, "a3", "0xCAFE").unwrap();
        assert_eq!(get(&mut m, "A3").unwrap(), 0xCAFE);
        set(&mut m, "pc", "4096").unwrap();
        assert_eq!(get(&mut m, "pc").unwrap(), 4096);
    }

    #[test]
    fn sp_aliases_a7() {
        let mut m = machine();
        set(&mut m, "sp", "0x2000").unwrap();
        assert_eq!(get(&mut m, "a7").unwrap(), 0x2000);
        // Supervisor at boot, so SSP moved.
        assert_eq!(get(&mut m, "ssp").unwrap(), 0x2000);
    }

    #[test]
    fn flags_set_and_clear() {
        let mut m = machine();
        set(&mut m, "z", "1").unwrap();
        assert_eq!(get(&mut m, "z").unwrap(), 1);
        set(&mut m, "z", "0").unwrap();
        assert_eq!(get(&mut m, "z").unwrap(), 0);
    }

    #[test]
    fn memory_round_trips_all_sizes() {
        let mut m = machine();
        m.set_overlay(false); // RAM answers low addresses
        set(&mut m, "0x1000.b", "0x42").unwrap();
        assert_eq!(get(&mut m, "0x1000.b").unwrap(), 0x42);
        set(&mut m, "0x2000.w", "0x1234").unwrap();
        assert_eq!(get(&mut m, "0x2000.w").unwrap(), 0x1234);
        set(&mut m, "0x3000.l", "0xDEADBEEF").unwrap();
        assert_eq!(get(&mut m, "0x3000.l").unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn bad_arguments_do_not_touch_state() {
        let mut m = machine();
        let pc = get(&mut m, "pc").unwrap();
        assert!(get(&mut m, "q9").is_err());
        assert!(set(&mut m, "pc", "zzz").is_err());
        assert!(set(&mut m, "0x1000.q", "1").is_err());
        assert_eq!(get(&mut m, "pc").unwrap(), pc);
    }

    #[test]
    fn status_reports_stopped_initially() {
        let m = machine();
        assert_eq!(status(&m), 0);
    }

    #[test]
    fn dollar_hex_parses() {
        assert_eq!(parse_value("$FF").unwrap(), 255);
        assert_eq!(parse_value("0x10").unwrap(), 16);
        assert_eq!(parse_value("42").unwrap(), 42);
    }
}
