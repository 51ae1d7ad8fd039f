//! orchard: command-line runner for Cortland machines.
//!
//! Maps argv onto the typed shell handlers in `cortland-machine::shell`
//! and translates results into the documented exit codes. One invocation
//! builds one machine (cold or from a checkpoint), performs its command,
//! and optionally saves state back out; the interactive debugger shell
//! lives elsewhere.

mod cli;

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use cortland_machine::config::MachineConfig;
use cortland_machine::machine::Machine;
use cortland_machine::profile::ModelId;
use cortland_machine::{checkpoint, shell};

use cli::{Cli, Command};

fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("orchard: {e:#}");
            ExitCode::from(255)
        }
    }
}

fn load_config(path: &Path) -> Result<MachineConfig> {
    if path.exists() {
        MachineConfig::load(path).map_err(|e| anyhow::anyhow!(e))
    } else {
        Ok(MachineConfig::for_model(ModelId::Plus))
    }
}

/// Builds the machine, resuming from the newest checkpoint if asked and
/// one exists.
fn build_machine(config: &MachineConfig, resume: bool) -> Result<Machine> {
    if resume {
        if let Some(newest) = checkpoint::newest(&config.state_dir) {
            return checkpoint::load(config, &newest).context("resuming checkpoint");
        }
    }
    Machine::new(config, None).map_err(|e| anyhow::anyhow!(e))
}

fn dispatch(cli: &Cli) -> Result<u8> {
    let config = load_config(&cli.config)?;
    match &cli.command {
        Command::Run { cycles, resume } => {
            let mut m = build_machine(&config, *resume)?;
            shell::run(&mut m, *cycles);
            println!("pc={:#010x} instr={}", m.cpu().regs.pc, m.cpu().instr_count());
            Ok(0)
        }
        Command::Status => {
            let m = build_machine(&config, true)?;
            Ok(shell::status(&m) as u8)
        }
        Command::Step { n } => {
            let mut m = build_machine(&config, true)?;
            shell::step(&mut m, *n);
            println!("pc={:#010x} instr={}", m.cpu().regs.pc, m.cpu().instr_count());
            Ok(0)
        }
        Command::Get { target } => {
            let mut m = build_machine(&config, true)?;
            let value = shell::get(&mut m, target)?;
            println!("{value:#x}");
            Ok(value as u8)
        }
        Command::Set { target, value } => {
            let mut m = build_machine(&config, true)?;
            shell::set(&mut m, target, value)?;
            Ok(0)
        }
        Command::Br { addr } => {
            let mut m = build_machine(&config, true)?;
            shell::breakpoint(&mut m, addr)?;
            shell::run(&mut m, None);
            println!("pc={:#010x}", m.cpu().regs.pc);
            Ok(0)
        }
        Command::Logpoint { addr, message, category, level } => {
            let mut m = build_machine(&config, true)?;
            shell::logpoint(&mut m, addr, message.as_deref(), category.as_deref(), *level)?;
            Ok(0)
        }
        Command::Log { category, level } => {
            shell::log_threshold(category, *level);
            Ok(0)
        }
        Command::SaveState { path, refs } => {
            let m = build_machine(&config, true)?;
            shell::save_state(&m, path, *refs)?;
            Ok(0)
        }
        Command::LoadState { path } => match path.as_deref() {
            Some("probe") => Ok(shell::load_state_probe(&config) as u8),
            Some(p) => {
                let m = shell::load_state(&config, Some(Path::new(p)))?;
                println!("restored pc={:#010x} instr={}", m.cpu().regs.pc, m.cpu().instr_count());
                Ok(0)
            }
            None => {
                let m = shell::load_state(&config, None)?;
                println!("restored pc={:#010x} instr={}", m.cpu().regs.pc, m.cpu().instr_count());
                Ok(0)
            }
        },
        Command::Checkpoint { action } => {
            if action != "clear" {
                bail!("unknown checkpoint action {action:?}");
            }
            shell::checkpoint_clear(&config)?;
            Ok(0)
        }
        Command::Screenshot { checksum, region } => {
            if !checksum {
                bail!("only --checksum is supported");
            }
            let region = match region.as_slice() {
                [] => None,
                [t, l, b, r] => Some((*t, *l, *b, *r)),
                _ => bail!("region wants: top left bottom right"),
            };
            let m = build_machine(&config, true)?;
            let cs = shell::screenshot_checksum(&m, region);
            println!("{cs:#010x}");
            Ok(0)
        }
        Command::InsertFd { probe, path } => {
            if *probe {
                return Ok(u8::from(!shell::insert_fd_probe(path)));
            }
            let mut m = build_machine(&config, true)?;
            m.insert_floppy(path, true).map_err(|e| anyhow::anyhow!(e))?;
            Ok(0)
        }
        Command::LoadRom { probe, path } => {
            if *probe {
                return Ok(u8::from(!shell::load_rom_probe(path)));
            }
            let mut m = build_machine(&config, true)?;
            let rom = std::fs::read(path).with_context(|| path.display().to_string())?;
            m.load_rom(&rom);
            m.reset_cpu();
            Ok(0)
        }
    }
}
