//! Control flow: branches, jumps, subroutine linkage, traps.

use crate::cpu::{Cpu, ea_cycles};
use crate::decode::{ea_mode, ea_reg};
use crate::ea::{self};
use crate::exceptions::Exc;
use crate::flags::{self, Size, V};
use crate::Bus;

pub(crate) fn op_bcc(cpu: &mut Cpu, bus: &mut dyn Bus, op: u16) -> Result<(), Exc> {
    let cond = (op >> 8) & 0xF;
    let disp8 = op & 0xFF;
    let base = cpu.regs.pc;
    let disp: u32 = match disp8 {
        0x00 => cpu.fetch_u16(bus)? as i16 as i32 as u32,
        0xFF => cpu.fetch_u32(bus)?,
        d => d as u8 as i8 as i32 as u32,
    };
    match cond {
        0x1 => {
            // BSR: return address is past any displacement words.
            cpu.push_u32(bus, cpu.regs.pc)?;
            cpu.regs.pc = base.wrapping_add(disp);
            cpu.cycles -= 14;
        }
        c if flags::condition(cpu.regs.sr, c) => {
            cpu.regs.pc = base.wrapping_add(disp);
            cpu.cycles -= 6;
        }
        _ => {
            cpu.cycles -= 4;
        }
    }
    Ok(())
}

pub(crate) fn op_dbcc(cpu: &mut Cpu, bus: &mut dyn Bus, op: u16) -> Result<(), Exc> {
    let cond = (op >> 8) & 0xF;
    let base = cpu.regs.pc;
    let disp = cpu.fetch_u16(bus)? as i16 as i32 as u32;
    if flags::condition(cpu.regs.sr, cond) {
        cpu.cycles -= 8;
        return Ok(());
    }
    let reg = ea_reg(op) as u8;
    let count = (cpu.regs.d[reg as usize] as u16).wrapping_sub(1);
    cpu.regs.set_d_sized(reg, count.into(), Size::Word);
    if count != 0xFFFF {
        cpu.regs.pc = base.wrapping_add(disp);
        cpu.cycles -= 6;
    } else {
        cpu.cycles -= 10;
    }
    Ok(())
}

pub(crate) fn op_scc(cpu: &mut Cpu, bus: &mut dyn Bus, op: u16) -> Result<(), Exc> {
    let cond = (op >> 8) & 0xF;
    let value = if flags::condition(cpu.regs.sr, cond) { 0xFF } else { 0x00 };
    let ea = ea::resolve(cpu, bus, ea_mode(op), ea_reg(op), Size::Byte)?;
    ea::write(cpu, bus, ea, Size::Byte, value)?;
    cpu.cycles -= ea_cycles(ea_mode(op), ea_reg(op), Size::Byte);
    Ok(())
}

pub(crate) fn op_jmp(cpu: &mut Cpu, bus: &mut dyn Bus, op: u16) -> Result<(), Exc> {
    let ea = ea::resolve(cpu, bus, ea_mode(op), ea_reg(op), Size::Long)?;
    cpu.regs.pc = ea.addr();
    cpu.cycles -= 4;
    Ok(())
}

pub(crate) fn op_jsr(cpu: &mut Cpu, bus: &mut dyn Bus, op: u16) -> Result<(), Exc> {
    let ea = ea::resolve(cpu, bus, ea_mode(op), ea_reg(op), Size::Long)?;
    cpu.push_u32(bus, cpu.regs.pc)?;
    cpu.regs.pc = ea.addr();
    cpu.cycles -= 12;
    Ok(())
}

pub(crate) fn op_rts(cpu: &mut Cpu, bus: &mut dyn Bus, _op: u16) -> Result<(), Exc> {
    cpu.regs.pc = cpu.pop_u32(bus)?;
    cpu.cycles -= 12;
    Ok(())
}

/// RTD (68010+): return and deallocate parameters.
pub(crate) fn op_rtd(cpu: &mut Cpu, bus: &mut dyn Bus, _op: u16) -> Result<(), Exc> {
    let disp = cpu.fetch_u16(bus)? as i16 as i32 as u32;
    cpu.regs.pc = cpu.pop_u32(bus)?;
    let sp = cpu.regs.sp();
    *cpu.regs.sp_mut() = sp.wrapping_add(disp);
    cpu.cycles -= 12;
    Ok(())
}

pub(crate) fn op_rtr(cpu: &mut Cpu, bus: &mut dyn Bus, _op: u16) -> Result<(), Exc> {
    let ccr = cpu.pop_u16(bus)?;
    cpu.regs.set_ccr(ccr as u8);
    cpu.regs.pc = cpu.pop_u32(bus)?;
    cpu.cycles -= 16;
    Ok(())
}

pub(crate) fn op_rte(cpu: &mut Cpu, bus: &mut dyn Bus, _op: u16) -> Result<(), Exc> {
    crate::cpu::supervisor_check(cpu)?;
    let sr = cpu.pop_u16(bus)?;
    let pc = cpu.pop_u32(bus)?;
    if !cpu.model().is_68000() {
        let fmt = cpu.pop_u16(bus)?;
        match fmt >> 12 {
            0x0 => {}
            0x2 => {
                let _ = cpu.pop_u32(bus)?;
            }
            0xA => {
                // Short bus fault frame: 24 more bytes.
                for _ in 0..6 {
                    let _ = cpu.pop_u32(bus)?;
                }
            }
            _ => return Err(Exc::Format),
        }
    }
    cpu.regs.pc = pc;
    cpu.write_sr(bus, sr as u16);
    cpu.cycles -= 20;
    Ok(())
}

pub(crate) fn op_link(cpu: &mut Cpu, bus: &mut dyn Bus, op: u16) -> Result<(), Exc> {
    let reg = ea_reg(op) as u8;
    let disp = cpu.fetch_u16(bus)? as i16 as i32 as u32;
    cpu.push_u32(bus, cpu.regs.a(reg))?;
    let sp = cpu.regs.sp();
    cpu.regs.set_a(reg, sp);
    *cpu.regs.sp_mut() = sp.wrapping_add(disp);
    cpu.cycles -= 12;
    Ok(())
}

pub(crate) fn op_unlk(cpu: &mut Cpu, bus: &mut dyn Bus, op: u16) -> Result<(), Exc> {
    let reg = ea_reg(op) as u8;
    *cpu.regs.sp_mut() = cpu.regs.a(reg);
    let v = cpu.pop_u32(bus)?;
    cpu.regs.set_a(reg, v);
    cpu.cycles -= 8;
    Ok(())
}

pub(crate) fn op_chk(cpu: &mut Cpu, bus: &mut dyn Bus, op: u16) -> Result<(), Exc> {
    let size = if (op >> 6) & 7 == 4 { Size::Long } else { Size::Word };
    let ea = ea::resolve(cpu, bus, ea_mode(op), ea_reg(op), size)?;
    let bound = size.sign_extend(ea::read(cpu, bus, ea, size)?) as i32;
    let dn = size.sign_extend(cpu.regs.d[((op >> 9) & 7) as usize] & size.mask()) as i32;
    cpu.cycles -= 6;
    // Flags here are architecturally undefined; N tracks the compared
    // register's sign on every path, Z/V/C clear.
    cpu.regs.sr &= !(flags::N | flags::Z | flags::V | flags::C);
    if dn < 0 {
        cpu.regs.sr |= flags::N;
    }
    if dn < 0 || dn > bound {
        return Err(Exc::Chk);
    }
    Ok(())
}

pub(crate) fn op_trap(_cpu: &mut Cpu, _bus: &mut dyn Bus, op: u16) -> Result<(), Exc> {
    Err(Exc::Trap((op & 0xF) as u8))
}

pub(crate) fn op_trapv(cpu: &mut Cpu, _bus: &mut dyn Bus, _op: u16) -> Result<(), Exc> {
    if cpu.regs.sr & V != 0 { Err(Exc::TrapV) } else { Ok(()) }
}

pub(crate) fn op_nop(_cpu: &mut Cpu, _bus: &mut dyn Bus, _op: u16) -> Result<(), Exc> {
    Ok(())
}

pub(crate) fn op_illegal(_cpu: &mut Cpu, _bus: &mut dyn Bus, _op: u16) -> Result<(), Exc> {
    Err(Exc::Illegal)
}

pub(crate) fn op_aline(_cpu: &mut Cpu, _bus: &mut dyn Bus, _op: u16) -> Result<(), Exc> {
    Err(Exc::ALine)
}

pub(crate) fn op_fline(_cpu: &mut Cpu, _bus: &mut dyn Bus, _op: u16) -> Result<(), Exc> {
    Err(Exc::FLine)
}
