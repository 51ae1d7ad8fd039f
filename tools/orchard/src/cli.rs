//! Command-line interface definitions for orchard.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Cortland machine runner.
#[derive(Parser)]
#[command(name = "orchard", version, about)]
pub struct Cli {
    /// Machine configuration file (TOML).
    #[arg(long, short = 'c', global = true, default_value = "cortland.toml")]
    pub config: PathBuf,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands; exit codes follow the shell contract.
#[derive(Subcommand)]
pub enum Command {
    /// Advance the machine by N cycles (or until a breakpoint).
    Run {
        /// Cycles to advance.
        cycles: Option<u64>,
        /// Resume from the newest checkpoint first.
        #[arg(long)]
        resume: bool,
    },
    /// Report scheduler status (exit 0=stopped, 1=running, 2=idle).
    Status,
    /// Single-step N instructions (default 1), then print the PC.
    Step {
        /// Instructions to execute.
        n: Option<u64>,
    },
    /// Read a register or memory location; the value is the exit code.
    Get {
        /// `D0`-`D7`, `A0`-`A7`, `SP`, `USP`, `SSP`, `PC`, `SR`, `CCR`,
        /// a flag (`X`/`N`/`Z`/`V`/`C`), `instr`, or `addr.b/.w/.l`.
        target: String,
    },
    /// Write a register or memory location.
    Set {
        /// Target, as for `get`.
        target: String,
        /// Value (`0x` hex, `$` hex, or decimal).
        value: String,
    },
    /// Run to a breakpoint and print the PC there.
    Br {
        /// Breakpoint address.
        addr: String,
    },
    /// Add a logpoint.
    Logpoint {
        /// Instruction address.
        addr: String,
        /// Message appended to the hit line.
        message: Option<String>,
        /// Log category (default `logpoint`).
        #[arg(long)]
        category: Option<String>,
        /// Log level (default 30).
        #[arg(long)]
        level: Option<u8>,
    },
    /// Set a per-category log threshold.
    Log {
        /// Category name.
        category: String,
        /// Threshold level.
        level: u8,
    },
    /// Save machine state.
    SaveState {
        /// Destination file.
        path: PathBuf,
        /// Reference disk images by path instead of embedding them.
        #[arg(long)]
        refs: bool,
    },
    /// Load machine state (newest checkpoint when no path given), or
    /// probe for one.
    LoadState {
        /// Checkpoint file, or the literal `probe`.
        path: Option<String>,
    },
    /// Checkpoint maintenance.
    Checkpoint {
        /// Only `clear` is defined.
        action: String,
    },
    /// Framebuffer checksum over a region (default full screen).
    Screenshot {
        /// Compute the checksum (the only supported mode).
        #[arg(long)]
        checksum: bool,
        /// Region: top left bottom right.
        region: Vec<u32>,
    },
    /// Floppy image operations.
    InsertFd {
        /// Only probe the file format.
        #[arg(long)]
        probe: bool,
        /// Image path.
        path: PathBuf,
    },
    /// ROM image operations.
    LoadRom {
        /// Only probe the file format.
        #[arg(long)]
        probe: bool,
        /// ROM path.
        path: PathBuf,
    },
}
