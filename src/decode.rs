//! Handler resolution and scalar instruction handlers.
//!
//! The pre-decoder interns one handler per decoded instruction into the
//! segment's handler table; the fast-sim dispatch and the `execute` /
//! `execute_handler` callbacks run them. Handlers mutate the machine and set
//! `cpu.pc` only when they change control flow; the dispatch loop advances
//! the PC of straight-line instructions itself.

use crate::error::Error;
use crate::instr::{opcodes, CInstr, Instr, SYSTEM_IMM_STOP, SYSTEM_IMM_WFI};
use crate::machine::Machine;

/// What an instruction did to control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Fall through; the dispatch loop advances the PC.
    Next,
    /// The handler wrote `cpu.pc` (possibly to the same address).
    Jump,
}

/// One interpreter handler. `cpu.pc` addresses the executing instruction on
/// entry; control-flow handlers overwrite it and report [`Flow::Jump`], all
/// others leave it alone.
pub type InstrHandler = fn(&mut Machine, Instr) -> Result<Flow, Error>;

/// Resolve the handler for an instruction word.
pub fn resolve(instr: Instr) -> InstrHandler {
    if instr.0 == 0 {
        return handle_illegal;
    }
    if instr.is_compressed() {
        return handle_compressed;
    }
    match instr.opcode() {
        opcodes::LUI => handle_lui,
        opcodes::AUIPC => handle_auipc,
        opcodes::JAL => handle_jal,
        opcodes::JALR => handle_jalr,
        opcodes::BRANCH => handle_branch,
        opcodes::LOAD => handle_load,
        opcodes::STORE => handle_store,
        opcodes::OP_IMM => handle_op_imm,
        opcodes::OP => handle_op,
        opcodes::OP_IMM32 => handle_op_imm32,
        opcodes::OP32 => handle_op32,
        opcodes::FENCE => handle_fence,
        opcodes::SYSTEM => handle_system,
        opcodes::LOAD_FP => handle_fp_load,
        opcodes::STORE_FP => handle_fp_store,
        opcodes::OP_FP => handle_fp_op,
        opcodes::FMADD | opcodes::FMSUB | opcodes::FNMSUB | opcodes::FNMADD => handle_fp_fma,
        opcodes::ATOMIC => handle_atomic,
        _ => handle_illegal,
    }
}

/// Idiom rewriter: substitute an equivalent, faster-to-dispatch form.
///
/// Canonicalizes register moves: `ADD rd, rs1, x0` and `ADD rd, x0, rs2`
/// become the `ADDI rd, rs, 0` move form. Disabled when a translation is
/// attached, because the translator encoded the original words.
pub fn rewrite_idioms(instr: Instr) -> Instr {
    if instr.opcode() == opcodes::OP && instr.op_key() == 0x0 {
        if instr.rs2() == 0 {
            return Instr((instr.rs1() << 15) | (instr.rd() << 7) | opcodes::OP_IMM);
        }
        if instr.rs1() == 0 {
            return Instr((instr.rs2() << 15) | (instr.rd() << 7) | opcodes::OP_IMM);
        }
    }
    instr
}

/// The slot-0 sentinel: reached through unset or zeroed decoder entries.
pub fn handle_illegal(m: &mut Machine, _instr: Instr) -> Result<Flow, Error> {
    Err(Error::IllegalOpcode(m.cpu.pc))
}

fn handle_lui(m: &mut Machine, instr: Instr) -> Result<Flow, Error> {
    m.set_reg(instr.rd(), instr.upper_imm() as u64);
    Ok(Flow::Next)
}

fn handle_auipc(m: &mut Machine, instr: Instr) -> Result<Flow, Error> {
    m.set_reg(instr.rd(), m.cpu.pc.wrapping_add(instr.upper_imm() as u64));
    Ok(Flow::Next)
}

fn handle_jal(m: &mut Machine, instr: Instr) -> Result<Flow, Error> {
    let target = m.cpu.pc.wrapping_add(instr.jump_offset() as u64);
    m.check_alignment(target)?;
    m.set_reg(instr.rd(), m.cpu.pc.wrapping_add(4));
    m.cpu.pc = target;
    Ok(Flow::Jump)
}

fn handle_jalr(m: &mut Machine, instr: Instr) -> Result<Flow, Error> {
    // RS1 may alias RD, so compute the target first.
    let target = m.reg(instr.rs1()).wrapping_add(instr.signed_imm_i() as u64) & !1u64;
    m.check_alignment(target)?;
    m.set_reg(instr.rd(), m.cpu.pc.wrapping_add(4));
    m.cpu.pc = target;
    Ok(Flow::Jump)
}

fn handle_branch(m: &mut Machine, instr: Instr) -> Result<Flow, Error> {
    let rs1 = m.reg(instr.rs1());
    let rs2 = m.reg(instr.rs2());
    let taken = match instr.funct3() {
        0x0 => rs1 == rs2,
        0x1 => rs1 != rs2,
        0x4 => (rs1 as i64) < (rs2 as i64),
        0x5 => (rs1 as i64) >= (rs2 as i64),
        0x6 => rs1 < rs2,
        0x7 => rs1 >= rs2,
        _ => return Err(Error::IllegalOpcode(m.cpu.pc)),
    };
    if taken {
        let target = m.cpu.pc.wrapping_add(instr.signed_imm_b() as u64);
        m.check_alignment(target)?;
        m.cpu.pc = target;
        return Ok(Flow::Jump);
    }
    Ok(Flow::Next)
}

fn handle_load(m: &mut Machine, instr: Instr) -> Result<Flow, Error> {
    let addr = m.reg(instr.rs1()).wrapping_add(instr.signed_imm_i() as u64);
    let value = match instr.funct3() {
        0x0 => m.mem_read(addr, 1)? as i8 as i64 as u64,
        0x1 => m.mem_read(addr, 2)? as i16 as i64 as u64,
        0x2 => m.mem_read(addr, 4)? as i32 as i64 as u64,
        0x3 => m.mem_read(addr, 8)?,
        0x4 => m.mem_read(addr, 1)?,
        0x5 => m.mem_read(addr, 2)?,
        0x6 => m.mem_read(addr, 4)?,
        _ => return Err(Error::IllegalOpcode(m.cpu.pc)),
    };
    m.set_reg(instr.rd(), value);
    Ok(Flow::Next)
}

fn handle_store(m: &mut Machine, instr: Instr) -> Result<Flow, Error> {
    let addr = m.reg(instr.rs1()).wrapping_add(instr.signed_imm_s() as u64);
    let value = m.reg(instr.rs2());
    match instr.funct3() {
        0x0 => m.mem_write(addr, value, 1)?,
        0x1 => m.mem_write(addr, value, 2)?,
        0x2 => m.mem_write(addr, value, 4)?,
        0x3 => m.mem_write(addr, value, 8)?,
        _ => return Err(Error::IllegalOpcode(m.cpu.pc)),
    }
    Ok(Flow::Next)
}

fn handle_op_imm(m: &mut Machine, instr: Instr) -> Result<Flow, Error> {
    let src = m.reg(instr.rs1());
    let imm = instr.signed_imm_i();
    let xlen = 64u32;
    let value = match instr.funct3() {
        0x0 => src.wrapping_add(imm as u64),
        0x1 => match instr.imm_i() {
            0x604 => src as i8 as i64 as u64,           // SEXT.B
            0x605 => src as i16 as i64 as u64,          // SEXT.H
            0x600 => src.leading_zeros() as u64,        // CLZ
            0x601 => src.trailing_zeros() as u64,       // CTZ
            0x602 => src.count_ones() as u64,           // CPOP
            _ => match instr.high_bits() {
                0x000 => src << instr.shift64_imm(), // SLLI
                0x280 => src | 1u64 << (instr.imm_i() & (xlen - 1)), // BSETI
                0x480 => src & !(1u64 << (instr.imm_i() & (xlen - 1))), // BCLRI
                0x680 => src ^ 1u64 << (instr.imm_i() & (xlen - 1)), // BINVI
                _ => return Err(Error::IllegalOpcode(m.cpu.pc)),
            },
        },
        0x2 => ((src as i64) < imm) as u64,
        0x3 => (src < imm as u64) as u64,
        0x4 => src ^ imm as u64,
        0x5 => {
            if instr.is_rori() {
                src.rotate_right(instr.shift64_imm())
            } else if instr.imm_i() == 0x287 {
                // ORC.B
                let mut out = 0u64;
                for i in 0..8 {
                    if src >> (i * 8) & 0xFF != 0 {
                        out |= 0xFFu64 << (i * 8);
                    }
                }
                out
            } else if instr.is_rev8(xlen) {
                src.swap_bytes()
            } else {
                match instr.high_bits() {
                    0x000 => src >> instr.shift64_imm(), // SRLI
                    0x400 => ((src as i64) >> instr.shift64_imm()) as u64, // SRAI
                    0x480 => src >> (instr.imm_i() & (xlen - 1)) & 1, // BEXTI
                    _ => return Err(Error::IllegalOpcode(m.cpu.pc)),
                }
            }
        }
        0x6 => src | imm as u64,
        0x7 => src & imm as u64,
        _ => return Err(Error::IllegalOpcode(m.cpu.pc)),
    };
    m.set_reg(instr.rd(), value);
    Ok(Flow::Next)
}

fn handle_op(m: &mut Machine, instr: Instr) -> Result<Flow, Error> {
    let a = m.reg(instr.rs1());
    let b = m.reg(instr.rs2());
    let value = match instr.op_key() {
        0x0 => a.wrapping_add(b),
        0x200 => a.wrapping_sub(b),
        0x1 => a << (b & 63),
        0x2 => ((a as i64) < b as i64) as u64,
        0x3 => (a < b) as u64,
        0x4 => a ^ b,
        0x5 => a >> (b & 63),
        0x205 => ((a as i64) >> (b & 63)) as u64,
        0x6 => a | b,
        0x7 => a & b,
        // M extension
        0x10 => a.wrapping_mul(b),
        0x11 => ((a as i64 as i128).wrapping_mul(b as i64 as i128) >> 64) as u64,
        0x12 => ((a as i64 as i128).wrapping_mul(b as u128 as i128) >> 64) as u64,
        0x13 => ((a as u128).wrapping_mul(b as u128) >> 64) as u64,
        0x14 => {
            // Division by zero is not an exception.
            if b == 0 {
                u64::MAX
            } else if a as i64 == i64::MIN && b as i64 == -1 {
                a
            } else {
                (a as i64).wrapping_div(b as i64) as u64
            }
        }
        0x15 => {
            if b == 0 {
                u64::MAX
            } else {
                a / b
            }
        }
        0x16 => {
            if b == 0 {
                a
            } else if a as i64 == i64::MIN && b as i64 == -1 {
                0
            } else {
                (a as i64).wrapping_rem(b as i64) as u64
            }
        }
        0x17 => {
            if b == 0 {
                a
            } else {
                a % b
            }
        }
        // Zba / Zbb / Zbs / Zbc
        0x44 => a as u16 as u64,  // ZEXT.H
        0x51 => clmul(a, b),      // CLMUL
        0x52 => clmulr(a, b),     // CLMULR
        0x53 => clmulh(a, b),     // CLMULH
        0x102 => b.wrapping_add(a << 1), // SH1ADD
        0x104 => b.wrapping_add(a << 2), // SH2ADD
        0x106 => b.wrapping_add(a << 3), // SH3ADD
        0x141 => a | 1u64 << (b & 63),   // BSET
        0x142 => a & !(1u64 << (b & 63)), // BCLR
        0x143 => a ^ 1u64 << (b & 63),   // BINV
        0x204 => !(a ^ b),               // XNOR
        0x206 => a | !b,                 // ORN
        0x207 => a & !b,                 // ANDN
        0x245 => a >> (b & 63) & 1,      // BEXT
        0x54 => (a as i64).min(b as i64) as u64, // MIN
        0x55 => a.min(b),                        // MINU
        0x56 => (a as i64).max(b as i64) as u64, // MAX
        0x57 => a.max(b),                        // MAXU
        0x301 => a.rotate_left((b & 63) as u32), // ROL
        0x305 => a.rotate_right((b & 63) as u32), // ROR
        _ => return Err(Error::IllegalOpcode(m.cpu.pc)),
    };
    m.set_reg(instr.rd(), value);
    Ok(Flow::Next)
}

fn handle_op_imm32(m: &mut Machine, instr: Instr) -> Result<Flow, Error> {
    let src = m.reg(instr.rs1()) as u32;
    let value = match instr.funct3() {
        0x0 => src.wrapping_add(instr.signed_imm_i() as u32) as i32 as i64 as u64,
        0x1 => match instr.high_bits() {
            0x000 => (src << instr.shift_imm()) as i32 as i64 as u64,
            0x080 => (src as u64) << instr.shift_imm(), // SLLI.UW
            _ => match instr.imm_i() {
                0x600 => src.leading_zeros() as u64,
                0x601 => src.trailing_zeros() as u64,
                0x602 => src.count_ones() as u64,
                _ => return Err(Error::IllegalOpcode(m.cpu.pc)),
            },
        },
        0x5 => match instr.high_bits() {
            0x000 => (src >> instr.shift_imm()) as i32 as i64 as u64,
            0x400 => ((src as i32) >> instr.shift_imm()) as i64 as u64,
            0x600 => src.rotate_right(instr.shift_imm()) as i32 as i64 as u64, // RORIW
            _ => return Err(Error::IllegalOpcode(m.cpu.pc)),
        },
        _ => return Err(Error::IllegalOpcode(m.cpu.pc)),
    };
    m.set_reg(instr.rd(), value);
    Ok(Flow::Next)
}

fn handle_op32(m: &mut Machine, instr: Instr) -> Result<Flow, Error> {
    let a = m.reg(instr.rs1()) as u32;
    let b = m.reg(instr.rs2()) as u32;
    let sext = |v: u32| v as i32 as i64 as u64;
    let value = match instr.op_key() {
        0x0 => sext(a.wrapping_add(b)),
        0x200 => sext(a.wrapping_sub(b)),
        0x1 => sext(a << (b & 31)),
        0x5 => sext(a >> (b & 31)),
        0x205 => ((a as i32) >> (b & 31)) as i64 as u64,
        0x10 => sext(a.wrapping_mul(b)),
        0x14 => {
            if b == 0 {
                u64::MAX
            } else if a as i32 == i32::MIN && b as i32 == -1 {
                sext(a)
            } else {
                ((a as i32).wrapping_div(b as i32)) as i64 as u64
            }
        }
        0x15 => {
            if b == 0 {
                u64::MAX
            } else {
                sext(a / b)
            }
        }
        0x16 => {
            if b == 0 {
                sext(a)
            } else if a as i32 == i32::MIN && b as i32 == -1 {
                0
            } else {
                ((a as i32).wrapping_rem(b as i32)) as i64 as u64
            }
        }
        0x17 => {
            if b == 0 {
                sext(a)
            } else {
                sext(a % b)
            }
        }
        0x40 => m.reg(instr.rs2()).wrapping_add(a as u64), // ADD.UW
        0x44 => a as u16 as u64,                            // ZEXT.H
        0x102 => m.reg(instr.rs2()).wrapping_add((a as u64) << 1), // SH1ADD.UW
        0x104 => m.reg(instr.rs2()).wrapping_add((a as u64) << 2), // SH2ADD.UW
        0x106 => m.reg(instr.rs2()).wrapping_add((a as u64) << 3), // SH3ADD.UW
        0x301 => sext(a.rotate_left(b & 31)),
        0x305 => sext(a.rotate_right(b & 31)),
        _ => return Err(Error::IllegalOpcode(m.cpu.pc)),
    };
    m.set_reg(instr.rd(), value);
    Ok(Flow::Next)
}

fn handle_fence(_m: &mut Machine, _instr: Instr) -> Result<Flow, Error> {
    Ok(Flow::Next)
}

fn handle_system(m: &mut Machine, instr: Instr) -> Result<Flow, Error> {
    if instr.funct3() == 0 {
        match instr.imm_i() {
            0 => {
                let pc_before = m.cpu.pc;
                m.system_call_current()?;
                if m.cpu.pc != pc_before {
                    Ok(Flow::Jump)
                } else {
                    Ok(Flow::Next)
                }
            }
            1 => {
                m.system_call(crate::machine::SYSCALL_EBREAK)?;
                Ok(Flow::Next)
            }
            SYSTEM_IMM_WFI | SYSTEM_IMM_STOP => {
                m.stop();
                m.cpu.pc = m.cpu.pc.wrapping_add(4);
                Ok(Flow::Jump)
            }
            _ => {
                m.system(instr)?;
                Ok(Flow::Next)
            }
        }
    } else {
        m.system(instr)?;
        Ok(Flow::Next)
    }
}

fn handle_fp_load(m: &mut Machine, instr: Instr) -> Result<Flow, Error> {
    let addr = m.reg(instr.rs1()).wrapping_add(instr.signed_imm_i() as u64);
    match instr.funct3() {
        0x2 => {
            let bits = m.mem_read(addr, 4)?;
            m.cpu.fregs[instr.rd() as usize].set_f32_bits(bits as u32);
            Ok(Flow::Next)
        }
        0x3 => {
            let bits = m.mem_read(addr, 8)?;
            m.cpu.fregs[instr.rd() as usize].bits = bits;
            Ok(Flow::Next)
        }
        _ => Err(Error::IllegalOpcode(m.cpu.pc)),
    }
}

fn handle_fp_store(m: &mut Machine, instr: Instr) -> Result<Flow, Error> {
    let addr = m.reg(instr.rs1()).wrapping_add(instr.signed_imm_s() as u64);
    let bits = m.cpu.fregs[instr.rs2() as usize].bits;
    match instr.funct3() {
        0x2 => m.mem_write(addr, bits & 0xFFFF_FFFF, 4)?,
        0x3 => m.mem_write(addr, bits, 8)?,
        _ => return Err(Error::IllegalOpcode(m.cpu.pc)),
    }
    Ok(Flow::Next)
}

fn handle_fp_op(m: &mut Machine, instr: Instr) -> Result<Flow, Error> {
    let rd = instr.rd() as usize;
    let rs1 = instr.rs1() as usize;
    let rs2 = instr.rs2() as usize;
    let double = instr.fp_funct2() == 1;
    macro_rules! binop_f {
        ($op:tt) => {{
            if double {
                let v = m.cpu.fregs[rs1].f64() $op m.cpu.fregs[rs2].f64();
                m.cpu.fregs[rd].set_f64(v);
            } else {
                let v = m.cpu.fregs[rs1].f32() $op m.cpu.fregs[rs2].f32();
                m.cpu.fregs[rd].set_f32(v);
            }
        }};
    }
    match instr.fpfunc() {
        0x00 => binop_f!(+),
        0x01 => binop_f!(-),
        0x02 => binop_f!(*),
        0x03 => binop_f!(/),
        0x05 => {
            if double {
                let v = if instr.funct3() == 0 {
                    m.cpu.fregs[rs1].f64().min(m.cpu.fregs[rs2].f64())
                } else {
                    m.cpu.fregs[rs1].f64().max(m.cpu.fregs[rs2].f64())
                };
                m.cpu.fregs[rd].set_f64(v);
            } else {
                let v = if instr.funct3() == 0 {
                    m.cpu.fregs[rs1].f32().min(m.cpu.fregs[rs2].f32())
                } else {
                    m.cpu.fregs[rs1].f32().max(m.cpu.fregs[rs2].f32())
                };
                m.cpu.fregs[rd].set_f32(v);
            }
        }
        0x0B => {
            if double {
                let v = m.cpu.fregs[rs1].f64().sqrt();
                m.cpu.fregs[rd].set_f64(v);
            } else {
                let v = m.cpu.fregs[rs1].f32().sqrt();
                m.cpu.fregs[rd].set_f32(v);
            }
        }
        0x04 => {
            // FSGNJ / FSGNJN / FSGNJX
            let (sbit, mask) = if double {
                (1u64 << 63, (1u64 << 63) - 1)
            } else {
                (1u64 << 31, (1u64 << 31) - 1)
            };
            let sign = m.cpu.fregs[rs2].bits & sbit;
            let sign = match instr.funct3() {
                0x0 => sign,
                0x1 => sign ^ sbit,
                0x2 => (m.cpu.fregs[rs1].bits & sbit) ^ sign,
                _ => return Err(Error::IllegalOpcode(m.cpu.pc)),
            };
            let bits = (m.cpu.fregs[rs1].bits & mask) | sign;
            if double {
                m.cpu.fregs[rd].bits = bits;
            } else {
                m.cpu.fregs[rd].set_f32_bits(bits as u32);
            }
        }
        0x08 => {
            // FCVT.S.D / FCVT.D.S
            if double {
                let v = m.cpu.fregs[rs1].f32() as f64;
                m.cpu.fregs[rd].set_f64(v);
            } else {
                let v = m.cpu.fregs[rs1].f64() as f32;
                m.cpu.fregs[rd].set_f32(v);
            }
        }
        0x14 => {
            // FLE / FLT / FEQ
            let v = if double {
                let (a, b) = (m.cpu.fregs[rs1].f64(), m.cpu.fregs[rs2].f64());
                match instr.funct3() {
                    0x0 => a <= b,
                    0x1 => a < b,
                    0x2 => a == b,
                    _ => return Err(Error::IllegalOpcode(m.cpu.pc)),
                }
            } else {
                let (a, b) = (m.cpu.fregs[rs1].f32(), m.cpu.fregs[rs2].f32());
                match instr.funct3() {
                    0x0 => a <= b,
                    0x1 => a < b,
                    0x2 => a == b,
                    _ => return Err(Error::IllegalOpcode(m.cpu.pc)),
                }
            };
            m.set_reg(instr.rd(), v as u64);
        }
        0x18 => {
            // FCVT.W/WU/L/LU from float
            let signed = instr.rs2() & 1 == 0;
            let v = if double {
                let f = m.cpu.fregs[rs1].f64();
                if signed {
                    f as i64 as u64
                } else {
                    f as u64
                }
            } else {
                let f = m.cpu.fregs[rs1].f32();
                if signed {
                    f as i64 as u64
                } else {
                    f as u64
                }
            };
            m.set_reg(instr.rd(), v);
        }
        0x1A => {
            // FCVT to float from integer register
            let signed = instr.rs2() & 1 == 0;
            let src = m.reg(instr.rs1());
            if double {
                let v = if signed { src as i64 as f64 } else { src as f64 };
                m.cpu.fregs[rd].set_f64(v);
            } else {
                let v = if signed { src as i64 as f32 } else { src as f32 };
                m.cpu.fregs[rd].set_f32(v);
            }
        }
        0x1C => {
            // FMV.X.W / FMV.X.D
            let bits = m.cpu.fregs[rs1].bits;
            if double {
                m.set_reg(instr.rd(), bits);
            } else {
                m.set_reg(instr.rd(), bits as u32 as i32 as i64 as u64);
            }
        }
        0x1E => {
            // FMV.W.X / FMV.D.X
            let src = m.reg(instr.rs1());
            if double {
                m.cpu.fregs[rd].bits = src;
            } else {
                m.cpu.fregs[rd].set_f32_bits(src as u32);
            }
        }
        _ => return Err(Error::IllegalOpcode(m.cpu.pc)),
    }
    Ok(Flow::Next)
}

fn handle_fp_fma(m: &mut Machine, instr: Instr) -> Result<Flow, Error> {
    let rd = instr.rd() as usize;
    let (a, b, c) = (
        instr.rs1() as usize,
        instr.rs2() as usize,
        instr.rs3() as usize,
    );
    let negate = matches!(instr.opcode(), opcodes::FNMADD | opcodes::FNMSUB);
    let subtract = matches!(instr.opcode(), opcodes::FMSUB | opcodes::FNMSUB);
    if instr.r4_funct2() == 0x1 {
        let mut v = m.cpu.fregs[a].f64() * m.cpu.fregs[b].f64();
        let addend = m.cpu.fregs[c].f64();
        v = if subtract { v - addend } else { v + addend };
        if negate {
            v = -v;
        }
        m.cpu.fregs[rd].set_f64(v);
    } else {
        let mut v = m.cpu.fregs[a].f32() * m.cpu.fregs[b].f32();
        let addend = m.cpu.fregs[c].f32();
        v = if subtract { v - addend } else { v + addend };
        if negate {
            v = -v;
        }
        m.cpu.fregs[rd].set_f32(v);
    }
    Ok(Flow::Next)
}

fn handle_atomic(m: &mut Machine, _instr: Instr) -> Result<Flow, Error> {
    Err(Error::IllegalOpcode(m.cpu.pc))
}

/// Compressed-instruction executor for the common RVC forms. Less common
/// encodings surface as illegal opcodes; the translator never expands them
/// either.
fn handle_compressed(m: &mut Machine, instr: Instr) -> Result<Flow, Error> {
    use crate::instr::{C_BEQZ, C_BNEZ, C_JMP, C_VARIOUS};
    let ci = CInstr(instr.half());
    let w = ci.0 as u32;
    match ci.opcode() {
        // C.ADDI (quadrant 01, funct3 000)
        0x0001 => {
            let rd = ci.cr_rd() as u32;
            let imm = (((w >> 12 & 1) << 5 | (w >> 2 & 0x1F)) << 26) as i32 >> 26;
            let v = m.reg(rd).wrapping_add(imm as i64 as u64);
            m.set_reg(rd, v);
            Ok(Flow::Next)
        }
        // C.LI (quadrant 01, funct3 010)
        0x4001 => {
            let rd = ci.cr_rd() as u32;
            let imm = (((w >> 12 & 1) << 5 | (w >> 2 & 0x1F)) << 26) as i32 >> 26;
            m.set_reg(rd, imm as i64 as u64);
            Ok(Flow::Next)
        }
        C_JMP => {
            let target = m.cpu.pc.wrapping_add(ci.cj_signed_imm() as u64);
            m.check_alignment(target)?;
            m.cpu.pc = target;
            Ok(Flow::Jump)
        }
        C_BEQZ | C_BNEZ => {
            let rs1 = 8 + (ci.0 >> 7 & 0x7) as u32;
            let zero = m.reg(rs1) == 0;
            let taken = if ci.opcode() == C_BEQZ { zero } else { !zero };
            if taken {
                let target = m.cpu.pc.wrapping_add(ci.cb_signed_imm() as u64);
                m.check_alignment(target)?;
                m.cpu.pc = target;
                return Ok(Flow::Jump);
            }
            Ok(Flow::Next)
        }
        C_VARIOUS => {
            let rd = ci.cr_rd() as u32;
            let rs2 = ci.cr_rs2() as u32;
            if ci.is_jump_register() {
                let target = m.reg(rd) & !1u64;
                if ci.is_jalr() {
                    m.set_reg(1, m.cpu.pc.wrapping_add(2));
                }
                m.check_alignment(target)?;
                m.cpu.pc = target;
                Ok(Flow::Jump)
            } else if rs2 != 0 {
                // C.MV / C.ADD
                let v = if w & 1 << 12 != 0 {
                    m.reg(rd).wrapping_add(m.reg(rs2))
                } else {
                    m.reg(rs2)
                };
                m.set_reg(rd, v);
                Ok(Flow::Next)
            } else {
                // C.EBREAK and reserved forms
                m.stop();
                Ok(Flow::Next)
            }
        }
        _ => Err(Error::IllegalOpcode(m.cpu.pc)),
    }
}

/// Soft carry-less multiply helpers shared with the callback table.
pub(crate) fn clmul(a: u64, b: u64) -> u64 {
    let mut out = 0u64;
    for i in 0..64 {
        if b >> i & 1 != 0 {
            out ^= a << i;
        }
    }
    out
}

pub(crate) fn clmulr(a: u64, b: u64) -> u64 {
    let mut out = 0u64;
    for i in 0..63 {
        if b >> i & 1 != 0 {
            out ^= a >> (63 - i);
        }
    }
    out
}

pub(crate) fn clmulh(a: u64, b: u64) -> u64 {
    let mut out = 0u64;
    for i in 1..64 {
        if b >> i & 1 != 0 {
            out ^= a >> (64 - i);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::enc;

    #[test]
    fn test_resolve_distinguishes_opcode_classes() {
        let addi = resolve(Instr(enc::addi(1, 0, 1)));
        let beq = resolve(Instr(enc::beq(0, 0, 8)));
        let jalr = resolve(Instr(enc::jalr(0, 1, 0)));
        assert!(addi as usize != beq as usize);
        assert!(beq as usize != jalr as usize);
        assert!(resolve(Instr(0)) as usize == handle_illegal as usize);
    }

    #[test]
    fn test_rewrite_add_zero_to_move() {
        // ADD x5, x6, x0 -> ADDI x5, x6, 0
        let rewritten = rewrite_idioms(Instr(enc::op(0, 0, 5, 6, 0)));
        assert_eq!(rewritten.opcode(), opcodes::OP_IMM);
        assert_eq!(rewritten.rd(), 5);
        assert_eq!(rewritten.rs1(), 6);
        assert_eq!(rewritten.signed_imm_i(), 0);
        // Non-idioms pass through untouched.
        let sub = Instr(enc::op(0x20, 0, 5, 6, 7));
        assert_eq!(rewrite_idioms(sub), sub);
    }

    #[test]
    fn test_clmul_helpers() {
        assert_eq!(clmul(0, 0xFFFF), 0);
        assert_eq!(clmul(1, 0b1011), 0b1011);
        assert_eq!(clmul(0b11, 0b11), 0b101);
        // CLMULH of small operands has no high bits.
        assert_eq!(clmulh(0b11, 0b11), 0);
        assert_eq!(clmulr(1 << 63, 1 << 63), 1 << 63);
    }
}
