//! Opcode decode: a 65,536-entry dispatch table built once per CPU.
//!
//! Every possible opcode word is classified ahead of time, so the
//! per-instruction cost is a single table load. Opcodes the active model
//! does not implement dispatch to the illegal-instruction handler (or the
//! A-line/F-line emulator vectors for those two groups).

use crate::cpu::Cpu;
use crate::exceptions::Exc;
use crate::{Bus, CpuModel, exec_alu, exec_bits, exec_flow, exec_move, exec_sys};

/// An instruction execution routine.
pub(crate) type Handler = fn(&mut Cpu, &mut dyn Bus, u16) -> Result<(), Exc>;

/// The full dispatch table.
pub(crate) struct DecodeTable {
    table: Vec<Handler>,
}

impl DecodeTable {
    /// Classifies all 65,536 opcode words for `model`.
    pub(crate) fn build(model: CpuModel) -> Self {
        let mut table: Vec<Handler> = Vec::with_capacity(0x1_0000);
        for op in 0..=0xFFFFu16 {
            table.push(classify(model, op));
        }
        Self { table }
    }

    /// The handler for one opcode.
    #[inline]
    pub(crate) fn handler(&self, opcode: u16) -> Handler {
        self.table[opcode as usize]
    }
}

/// Field helpers shared with the execution modules.
pub(crate) fn ea_mode(op: u16) -> u16 {
    (op >> 3) & 7
}

pub(crate) fn ea_reg(op: u16) -> u16 {
    op & 7
}

fn classify(model: CpuModel, op: u16) -> Handler {
    let is030 = model == CpuModel::Mc68030;
    let mode = ea_mode(op);
    let reg = ea_reg(op);
    let bits96 = (op >> 9) & 7; // register / opcode field
    let opmode = (op >> 6) & 7;

    match op >> 12 {
        0x0 => classify_group0(is030, op, mode, reg, bits96, opmode),
        0x1 | 0x2 | 0x3 => {
            // MOVE / MOVEA; destination mode is bits 8-6, register 11-9.
            let dst_mode = opmode;
            let size_ok = crate::Size::from_move_bits(op >> 12).is_some();
            if !size_ok || !valid_src(mode, reg) {
                return exec_flow::op_illegal;
            }
            if dst_mode == 1 {
                if op >> 12 == 0x1 {
                    exec_flow::op_illegal // no MOVEA.B
                } else {
                    exec_move::op_movea
                }
            } else if crate::ea::is_alterable(dst_mode, bits96) {
                exec_move::op_move
            } else {
                exec_flow::op_illegal
            }
        }
        0x4 => classify_group4(is030, op, mode, reg, bits96, opmode),
        0x5 => {
            if opmode & 3 == 3 {
                // Scc / DBcc share the 11 size field.
                if mode == 1 {
                    exec_flow::op_dbcc
                } else if crate::ea::is_data(mode, reg) && crate::ea::is_alterable(mode, reg) {
                    exec_flow::op_scc
                } else {
                    exec_flow::op_illegal
                }
            } else if valid_src(mode, reg) && mode != 7 || (mode == 7 && reg <= 1) {
                if op & 0x0100 == 0 { exec_alu::op_addq } else { exec_alu::op_subq }
            } else {
                exec_flow::op_illegal
            }
        }
        0x6 => {
            let disp = op & 0xFF;
            if disp == 0xFF && !is030 {
                // Bcc.L does not exist on the 68000.
                exec_flow::op_illegal
            } else {
                exec_flow::op_bcc
            }
        }
        0x7 => {
            if op & 0x0100 == 0 { exec_move::op_moveq } else { exec_flow::op_illegal }
        }
        0x8 => match opmode {
            3 => exec_alu::op_divu_w,
            7 => exec_alu::op_divs_w,
            4 if mode <= 1 => exec_alu::op_sbcd,
            0 | 1 | 2 if mode != 1 => exec_alu::op_or_to_reg,
            _ => {
                if crate::ea::is_memory_alterable(mode, reg) {
                    exec_alu::op_or_to_mem
                } else {
                    exec_flow::op_illegal
                }
            }
        },
        0x9 => classify_addsub(op, mode, reg, opmode, exec_alu::op_sub_to_reg, exec_alu::op_sub_to_mem, exec_alu::op_subx, exec_alu::op_suba),
        0xA => exec_flow::op_aline,
        0xB => match opmode {
            0 | 1 | 2 => exec_alu::op_cmp,
            3 | 7 => exec_alu::op_cmpa,
            _ => {
                if mode == 1 {
                    exec_alu::op_cmpm
                } else if crate::ea::is_data(mode, reg) && crate::ea::is_alterable(mode, reg) {
                    exec_alu::op_eor
                } else {
                    exec_flow::op_illegal
                }
            }
        },
        0xC => match opmode {
            3 => exec_alu::op_mulu_w,
            7 => exec_alu::op_muls_w,
            4 if mode <= 1 => exec_alu::op_abcd,
            5 if mode <= 1 => exec_move::op_exg,
            6 if mode == 1 => exec_move::op_exg,
            0 | 1 | 2 if mode != 1 => exec_alu::op_and_to_reg,
            _ => {
                if crate::ea::is_memory_alterable(mode, reg) {
                    exec_alu::op_and_to_mem
                } else {
                    exec_flow::op_illegal
                }
            }
        },
        0xD => classify_addsub(op, mode, reg, opmode, exec_alu::op_add_to_reg, exec_alu::op_add_to_mem, exec_alu::op_addx, exec_alu::op_adda),
        0xE => classify_shifts(is030, op, mode, reg, bits96, opmode),
        _ => {
            // 0xF line: MMU operations on the 68030 (coprocessor id 0),
            // the F-line emulator vector otherwise.
            if is030 && op & 0x0FC0 == 0 {
                exec_sys::op_mmu
            } else {
                exec_flow::op_fline
            }
        }
    }
}

fn valid_src(mode: u16, reg: u16) -> bool {
    mode < 7 || reg <= 4
}

fn classify_group0(is030: bool, op: u16, mode: u16, reg: u16, bits96: u16, opmode: u16) -> Handler {
    if op & 0x0100 != 0 {
        // Dynamic bit ops, or MOVEP when the EA field says (d16,An).
        if mode == 1 {
            return exec_move::op_movep;
        }
        let ok = match opmode & 3 {
            0 => crate::ea::is_data(mode, reg) && valid_src(mode, reg), // BTST allows pc-rel
            _ => crate::ea::is_data(mode, reg) && crate::ea::is_alterable(mode, reg),
        };
        return if ok { exec_bits::op_bitop_dyn } else { exec_flow::op_illegal };
    }
    let size_bits = opmode & 3;
    match bits96 {
        4 => {
            // Static bit ops.
            let ok = match size_bits {
                0 => mode != 1 && (mode < 7 || reg <= 3),
                _ => crate::ea::is_data(mode, reg) && crate::ea::is_alterable(mode, reg),
            };
            if ok { exec_bits::op_bitop_imm } else { exec_flow::op_illegal }
        }
        0 | 1 | 5 => {
            // ORI / ANDI / EORI, including the CCR/SR forms.
            if mode == 7 && reg == 4 {
                return match size_bits {
                    0 => exec_sys::op_logic_to_ccr,
                    1 => exec_sys::op_logic_to_sr,
                    _ => exec_flow::op_illegal,
                };
            }
            if size_bits == 3 || !crate::ea::is_data(mode, reg) || !crate::ea::is_alterable(mode, reg) {
                return exec_flow::op_illegal;
            }
            exec_alu::op_logic_imm
        }
        2 | 3 | 6 => {
            // SUBI / ADDI / CMPI.
            if size_bits == 3 {
                return exec_flow::op_illegal;
            }
            let cmpi_pcrel = is030 && mode == 7 && reg <= 3;
            if bits96 == 6 && (crate::ea::is_data(mode, reg) && (crate::ea::is_alterable(mode, reg) || cmpi_pcrel)) {
                return exec_alu::op_cmpi;
            }
            if crate::ea::is_data(mode, reg) && crate::ea::is_alterable(mode, reg) {
                if bits96 == 2 { exec_alu::op_subi } else { exec_alu::op_addi }
            } else {
                exec_flow::op_illegal
            }
        }
        _ => exec_flow::op_illegal,
    }
}

fn classify_group4(is030: bool, op: u16, mode: u16, reg: u16, bits96: u16, opmode: u16) -> Handler {
    // Fixed encodings first.
    match op {
        0x4AFC => return exec_flow::op_illegal,
        0x4E70 => return exec_sys::op_reset,
        0x4E71 => return exec_flow::op_nop,
        0x4E72 => return exec_sys::op_stop,
        0x4E73 => return exec_flow::op_rte,
        0x4E74 => {
            return if is030 { exec_flow::op_rtd } else { exec_flow::op_illegal };
        }
        0x4E75 => return exec_flow::op_rts,
        0x4E76 => return exec_flow::op_trapv,
        0x4E77 => return exec_flow::op_rtr,
        0x4E7A | 0x4E7B => {
            return if is030 { exec_sys::op_movec } else { exec_flow::op_illegal };
        }
        _ => {}
    }
    if op & 0xFFF0 == 0x4E40 {
        return exec_flow::op_trap;
    }
    if op & 0xFFF8 == 0x4E50 {
        return exec_flow::op_link;
    }
    if op & 0xFFF8 == 0x4E58 {
        return exec_flow::op_unlk;
    }
    if op & 0xFFF0 == 0x4E60 {
        return exec_sys::op_move_usp;
    }
    if op & 0xFFC0 == 0x4E80 {
        return if crate::ea::is_control(mode, reg) { exec_flow::op_jsr } else { exec_flow::op_illegal };
    }
    if op & 0xFFC0 == 0x4EC0 {
        return if crate::ea::is_control(mode, reg) { exec_flow::op_jmp } else { exec_flow::op_illegal };
    }
    if op & 0xFFF8 == 0x4840 {
        return exec_move::op_swap;
    }
    if op & 0xFFF8 == 0x4880 || op & 0xFFF8 == 0x48C0 {
        return exec_move::op_ext;
    }
    if op & 0xFFF8 == 0x49C0 {
        return if is030 { exec_move::op_extb } else { exec_flow::op_illegal };
    }
    if op & 0xFFC0 == 0x4840 {
        return if crate::ea::is_control(mode, reg) { exec_move::op_pea } else { exec_flow::op_illegal };
    }
    if op & 0xFFC0 == 0x4800 {
        return if crate::ea::is_data(mode, reg) && crate::ea::is_alterable(mode, reg) {
            exec_alu::op_nbcd
        } else {
            exec_flow::op_illegal
        };
    }
    if op & 0xFB80 == 0x4880 && mode != 0 {
        // MOVEM: 0100 1d00 1s mmmrrr.
        let to_mem = op & 0x0400 == 0;
        let ok = if to_mem {
            matches!(mode, 2 | 4 | 5 | 6) || (mode == 7 && reg <= 1)
        } else {
            matches!(mode, 2 | 3 | 5 | 6) || (mode == 7 && reg <= 3)
        };
        if ok {
            return if to_mem { exec_move::op_movem_to_mem } else { exec_move::op_movem_to_reg };
        }
        return exec_flow::op_illegal;
    }
    match (bits96, opmode) {
        (0, 3) => {
            // MOVE from SR.
            if crate::ea::is_data(mode, reg) && crate::ea::is_alterable(mode, reg) {
                return exec_sys::op_move_from_sr;
            }
            return exec_flow::op_illegal;
        }
        (1, 3) => {
            // MOVE from CCR (68010+).
            if is030 && crate::ea::is_data(mode, reg) && crate::ea::is_alterable(mode, reg) {
                return exec_sys::op_move_from_ccr;
            }
            return exec_flow::op_illegal;
        }
        (2, 3) => {
            if crate::ea::is_data(mode, reg) && valid_src(mode, reg) {
                return exec_sys::op_move_to_ccr;
            }
            return exec_flow::op_illegal;
        }
        (3, 3) => {
            if crate::ea::is_data(mode, reg) && valid_src(mode, reg) {
                return exec_sys::op_move_to_sr;
            }
            return exec_flow::op_illegal;
        }
        _ => {}
    }
    if opmode == 7 {
        // LEA.
        return if crate::ea::is_control(mode, reg) { exec_move::op_lea } else { exec_flow::op_illegal };
    }
    if opmode == 6 || (is030 && opmode == 4) {
        // CHK.W (and CHK.L on the 68030).
        return if crate::ea::is_data(mode, reg) && valid_src(mode, reg) {
            exec_flow::op_chk
        } else {
            exec_flow::op_illegal
        };
    }
    if op & 0xFF00 == 0x4A00 {
        // TST / TAS.
        if opmode & 3 == 3 {
            return if crate::ea::is_data(mode, reg) && crate::ea::is_alterable(mode, reg) {
                exec_alu::op_tas
            } else {
                exec_flow::op_illegal
            };
        }
        let pcrel_ok = is030 && mode == 7 && reg <= 4;
        return if (crate::ea::is_data(mode, reg) && crate::ea::is_alterable(mode, reg)) || pcrel_ok {
            exec_alu::op_tst
        } else {
            exec_flow::op_illegal
        };
    }
    if op & 0xFF00 == 0x4000 || op & 0xFF00 == 0x4400 || op & 0xFF00 == 0x4600 || op & 0xFF00 == 0x4200 {
        // NEGX / NEG / NOT / CLR share shape.
        if opmode & 3 == 3 || !crate::ea::is_data(mode, reg) || !crate::ea::is_alterable(mode, reg) {
            return exec_flow::op_illegal;
        }
        return match op >> 8 {
            0x40 => exec_alu::op_negx,
            0x42 => exec_move::op_clr,
            0x44 => exec_alu::op_neg,
            _ => exec_alu::op_not,
        };
    }
    if is030 && (op & 0xFFC0 == 0x4C00 || op & 0xFFC0 == 0x4C40) {
        // MULx.L / DIVx.L with extension word.
        if crate::ea::is_data(mode, reg) && valid_src(mode, reg) {
            return if op & 0x0040 == 0 { exec_alu::op_mul_l } else { exec_alu::op_div_l };
        }
        return exec_flow::op_illegal;
    }
    exec_flow::op_illegal
}

fn classify_addsub(
    op: u16,
    mode: u16,
    reg: u16,
    opmode: u16,
    to_reg: Handler,
    to_mem: Handler,
    extended: Handler,
    to_addr: Handler,
) -> Handler {
    match opmode {
        3 | 7 => {
            if valid_src(mode, reg) { to_addr } else { exec_flow::op_illegal }
        }
        0 | 1 | 2 => {
            // Byte form cannot read An directly.
            if opmode == 0 && mode == 1 {
                return exec_flow::op_illegal;
            }
            if valid_src(mode, reg) { to_reg } else { exec_flow::op_illegal }
        }
        _ => {
            if mode <= 1 {
                extended
            } else if crate::ea::is_memory_alterable(mode, reg) {
                to_mem
            } else {
                exec_flow::op_illegal
            }
        }
    }
}

fn classify_shifts(is030: bool, op: u16, mode: u16, reg: u16, bits96: u16, opmode: u16) -> Handler {
    if opmode & 3 != 3 {
        return exec_bits::op_shift_reg;
    }
    if bits96 < 4 {
        // Memory shift by one, word only.
        return if crate::ea::is_memory_alterable(mode, reg) {
            exec_bits::op_shift_mem
        } else {
            exec_flow::op_illegal
        };
    }
    // Bit-field operations, 68020+.
    if is030 {
        let ok = mode == 0 || crate::ea::is_control(mode, reg);
        if ok {
            return exec_bits::op_bitfield;
        }
    }
    exec_flow::op_illegal
}
