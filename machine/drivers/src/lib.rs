//! Register-level peripheral devices.
//!
//! Every device implements [`cortland_mem::MmioDevice`] for the uniform
//! 8/16/32-bit access contract and keeps its side effects observable
//! through typed methods: the machine polls line outputs, pending timer
//! requests, and interrupt status after each dispatched access and routes
//! them to their consumers. No device holds a reference to another; the
//! machine is the mediator.

pub mod adb;
pub mod asc;
pub mod gcr;
pub mod iwm;
pub mod keyboard;
pub mod mouse;
pub mod rtc;
pub mod scc;
pub mod scsi;
pub mod sound;
pub mod via;

pub use adb::Adb;
pub use asc::Asc;
pub use iwm::{Iwm, IwmKind};
pub use keyboard::Keyboard;
pub use mouse::Mouse;
pub use rtc::Rtc;
pub use scc::Scc;
pub use scsi::Scsi;
pub use sound::Sound;
pub use via::{Via, ViaTimer};
