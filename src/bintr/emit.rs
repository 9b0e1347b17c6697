//! Host-code emitter: one C function per translation unit.
//!
//! Each block becomes `static ReturnValues f_<hex>(CPU*, uint64_t counter,
//! uint64_t max_counter, addr_t pc)`. Every jump target gets a local label so
//! branches inside the block are plain `goto`s; functions with more than one
//! entry point open with a `switch (pc)` that jumps into the body. Backward
//! jumps are guarded by the instruction budget unless counting is disabled.
//!
//! The emitter owns no long-lived state: it produces a string and a mapping
//! vector.

use std::collections::BTreeSet;

use crate::error::Error;
use crate::instr::{opcodes, Instr, REG_ECALL, REG_GP, SYSTEM_IMM_STOP, SYSTEM_IMM_WFI};
use crate::machine::{ArenaKind, SYSCALL_EBREAK};

use super::types::{TransInfo, TransMapping, TranslateContext};

/// Counter guard used for backward jumps.
const LOOP_EXPRESSION: &str = "LIKELY(counter < max_counter)";
/// Cast chain that sign-extends a 32-bit result on RV64.
const SIGNEXTW: &str = "(saddr_t)(int32_t)";

fn funclabel(func: &str, addr: u64) -> String {
    format!("{func}_{addr:x}")
}

fn func_for(addr: u64) -> String {
    format!("f_{addr:x}")
}

fn straddr(addr: u64) -> String {
    format!("{addr}UL")
}

struct BranchInfo {
    sign: bool,
    ignore_instruction_limit: bool,
    jump_pc: u64,
}

/// Result of emitting one translation unit.
pub struct EmittedBlock {
    /// Forward declarations, function header and body.
    pub code: String,
    /// Guest PCs reachable through this function's `switch (pc)` header.
    pub mappings: Vec<TransMapping>,
}

/// Emit one block. The mappings all share the block's function symbol.
pub fn emit(ctx: &TranslateContext, tinfo: &TransInfo) -> Result<EmittedBlock, Error> {
    let mut e = Emitter::new(ctx, tinfo);
    e.run()?;

    let mut out = String::new();
    for target in &e.forward_declared {
        out.push_str(&format!(
            "static ReturnValues {target}(CPU*, uint64_t, uint64_t, addr_t);\n"
        ));
    }
    out.push_str(&format!(
        "static ReturnValues {}(CPU* cpu, uint64_t counter, uint64_t max_counter, addr_t pc) {{\n",
        e.func
    ));
    if e.mappings.len() > 1 {
        out.push_str("switch (pc) {\n");
        for mapping in &e.mappings {
            out.push_str(&format!(
                "case {}: goto {};\n",
                mapping.addr,
                funclabel(&e.func, mapping.addr)
            ));
        }
        out.push_str(
            "default: api.trigger_exception(cpu, pc, INVALID_PROGRAM); \
             return (ReturnValues){0, 0};\n}\n",
        );
    }
    out.push_str(&e.code);
    Ok(EmittedBlock {
        code: out,
        mappings: e.mappings,
    })
}

struct Emitter<'a> {
    ctx: &'a TranslateContext,
    tinfo: &'a TransInfo,
    code: String,
    func: String,
    pc: u64,
    idx: usize,
    instr: Instr,
    instr_len: u64,
    instr_counter: u64,
    labels: BTreeSet<u64>,
    mapping_labels: BTreeSet<usize>,
    mappings: Vec<TransMapping>,
    forward_declared: Vec<String>,
}

impl<'a> Emitter<'a> {
    fn new(ctx: &'a TranslateContext, tinfo: &'a TransInfo) -> Self {
        Self {
            ctx,
            tinfo,
            code: String::new(),
            func: func_for(tinfo.basepc),
            pc: tinfo.basepc,
            idx: 0,
            instr: Instr(0),
            instr_len: 4,
            instr_counter: 0,
            labels: BTreeSet::new(),
            mapping_labels: BTreeSet::new(),
            mappings: Vec::new(),
            forward_declared: Vec::new(),
        }
    }

    fn xlen(&self) -> u32 {
        self.ctx.options.xlen.bits()
    }

    fn add(&mut self, line: impl AsRef<str>) {
        self.code.push_str(line.as_ref());
        self.code.push('\n');
    }

    fn pcrel(&self, offset: i64) -> u64 {
        self.pc.wrapping_add(offset as u64)
    }

    fn pcrel_s(&self, offset: i64) -> String {
        straddr(self.pcrel(offset))
    }

    fn begin_pc(&self) -> u64 {
        self.tinfo.basepc
    }

    fn end_pc(&self) -> u64 {
        self.tinfo.endpc
    }

    fn from_reg(&self, reg: u32) -> String {
        if reg == REG_GP && self.tinfo.gp != 0 {
            format!("(addr_t){}UL", self.tinfo.gp)
        } else if reg != 0 {
            format!("REG({reg})")
        } else {
            "(addr_t)0".to_string()
        }
    }

    fn to_reg(&self, reg: u32) -> String {
        if reg != 0 {
            format!("REG({reg})")
        } else {
            "(addr_t)0".to_string()
        }
    }

    fn from_fpreg(&self, reg: u32) -> String {
        format!("FREG({reg})")
    }

    fn from_rvvreg(&self, reg: u32) -> String {
        format!("VREG({reg})")
    }

    fn from_imm(&self, imm: i64) -> String {
        imm.to_string()
    }

    fn emit_op(&mut self, op: &str, sop: &str, rd: u32, rs1: u32, rs2: &str) {
        if rd == 0 {
            // NOP
        } else if rd == rs1 {
            let line = format!("{}{sop}{rs2};", self.to_reg(rd));
            self.add(line);
        } else {
            let line = format!("{} = {}{op}{rs2};", self.to_reg(rd), self.from_reg(rs1));
            self.add(line);
        }
    }

    fn exit_function(&mut self, new_pc: &str, add_bracket: bool) {
        if new_pc != "cpu->pc" {
            self.add(format!("cpu->pc = {new_pc};"));
        }
        let return_code = if self.tinfo.ignore_instruction_limit {
            "return (ReturnValues){0, max_counter};"
        } else {
            "return (ReturnValues){counter, max_counter};"
        };
        if add_bracket {
            self.add(format!("{return_code} }}"));
        } else {
            self.add(return_code);
        }
    }

    fn increment_counter_so_far(&mut self) {
        let count = self.instr_counter;
        self.instr_counter = 0;
        if count > 0 && !self.tinfo.ignore_instruction_limit {
            self.add(format!("counter += {count};"));
        }
    }

    fn add_mapping(&mut self, addr: u64) {
        self.mappings.push(TransMapping {
            addr,
            symbol: self.func.clone(),
        });
    }

    /// Request a re-entry point at the next instruction. Nothing is added at
    /// the end of the function, where there is no next instruction.
    fn add_reentry_next(&mut self) -> bool {
        if self.pc + self.instr_len >= self.end_pc() {
            return false;
        }
        self.mapping_labels.insert(self.idx + 1);
        true
    }

    fn add_forward(&mut self, target: &str) {
        if !self.forward_declared.iter().any(|f| f == target) {
            self.forward_declared.push(target.to_string());
        }
    }

    fn in_process_absolute_arena(&self) -> bool {
        self.ctx.options.in_process_compiler.is_some()
            && !self.tinfo.use_shared_execute_segments
            && self.tinfo.arena_ptr != 0
    }

    fn arena_at(&self, address: &str) -> String {
        match self.ctx.effective_arena() {
            ArenaKind::Encompassing { bits } => {
                let mask = (1u128 << bits) - 1;
                if self.in_process_absolute_arena() {
                    if bits == 32 {
                        format!("({}ull + (uint32_t)({address}))", self.tinfo.arena_ptr)
                    } else {
                        format!(
                            "({}ull + (({address}) & {mask}ull))",
                            self.tinfo.arena_ptr
                        )
                    }
                } else if bits == 32 {
                    format!("ARENA_AT(cpu, (uint32_t)({address}))")
                } else {
                    format!("ARENA_AT(cpu, ({address}) & {mask}ull)")
                }
            }
            _ => {
                if self.in_process_absolute_arena() {
                    format!("({}ull + SPECSAFE({address}))", self.tinfo.arena_ptr)
                } else {
                    format!("ARENA_AT(cpu, SPECSAFE({address}))")
                }
            }
        }
    }

    fn arena_at_fixed(&self, address: u64) -> String {
        match self.ctx.effective_arena() {
            ArenaKind::Encompassing { bits } => {
                let masked = address & ((1u64 << bits.min(63)) - 1);
                if self.in_process_absolute_arena() {
                    format!("({}ull)", self.tinfo.arena_ptr.wrapping_add(masked))
                } else {
                    format!("ARENA_AT(cpu, {masked}ull)")
                }
            }
            _ => {
                if self.in_process_absolute_arena() {
                    format!("({}ull)", self.tinfo.arena_ptr.wrapping_add(address))
                } else {
                    format!("ARENA_AT(cpu, SPECSAFE({address}ull))")
                }
            }
        }
    }

    fn memory_load(&mut self, dst: String, ctype: &str, signed: bool, reg: u32, imm: i64, size: u64) {
        let cast = if signed { "(saddr_t)" } else { "" };
        let arena = self.ctx.effective_arena();

        // GP-relative loads with a recovered GP fold to a fixed address when
        // the target provably lies in the readable arena window.
        if reg == REG_GP && self.tinfo.gp != 0 && matches!(arena, ArenaKind::Flat) {
            let absolute = self.tinfo.gp.wrapping_add(imm as u64);
            if absolute >= 0x1000 && absolute + size <= self.ctx.arena_size {
                let at = self.arena_at_fixed(absolute);
                self.add(format!("{dst} = {cast}*({ctype}*){at};"));
                return;
            }
        }

        let address = format!("{} + {}", self.from_reg(reg), self.from_imm(imm));
        match arena {
            ArenaKind::Encompassing { .. } => {
                let at = self.arena_at(&address);
                self.add(format!("{dst} = {cast}*({ctype}*){at};"));
            }
            ArenaKind::Flat => {
                let at = self.arena_at(&address);
                self.add(format!("if (LIKELY(ARENA_READABLE({address})))"));
                self.add(format!("  {dst} = {cast}*({ctype}*){at};"));
                self.add("else {");
                self.add(format!(
                    "  {dst} = {cast}({ctype})api.mem_ld(cpu, {address}, {size});"
                ));
                self.add("}");
            }
            ArenaKind::None => {
                self.add(format!(
                    "{dst} = {cast}({ctype})api.mem_ld(cpu, {address}, {size});"
                ));
            }
        }
    }

    fn memory_store(&mut self, ctype: &str, reg: u32, imm: i64, value: String, size: u64) {
        let arena = self.ctx.effective_arena();

        if reg == REG_GP && self.tinfo.gp != 0 && matches!(arena, ArenaKind::Flat) {
            let absolute = self.tinfo.gp.wrapping_add(imm as u64);
            if absolute >= self.ctx.rodata_end && absolute + size <= self.ctx.arena_size {
                self.add(format!(
                    "*({ctype}*)ARENA_AT(cpu, SPECSAFE({absolute}ull)) = {value};"
                ));
                return;
            }
        }

        let address = format!("{} + {}", self.from_reg(reg), self.from_imm(imm));
        match arena {
            ArenaKind::Encompassing { .. } => {
                let at = self.arena_at(&address);
                self.add(format!("*({ctype}*){at} = {value};"));
            }
            ArenaKind::Flat => {
                let at = self.arena_at(&address);
                self.add(format!("if (LIKELY(ARENA_WRITABLE({address})))"));
                self.add(format!("  *({ctype}*){at} = {value};"));
                self.add("else {");
                self.add(format!("  api.mem_st(cpu, {address}, {value}, {size});"));
                self.add("}");
            }
            ArenaKind::None => {
                self.add(format!("api.mem_st(cpu, {address}, {value}, {size});"));
            }
        }
    }

    /// Unsupported instruction: route through the interpreter, memoizing the
    /// interned handler index in a function-local static.
    fn unknown_instruction(&mut self) {
        let word = self.instr.0;
        if word != 0 {
            // The interpreter handler may read PC; reveal it first.
            let pc = self.pcrel_s(0);
            self.add(format!("cpu->pc = {pc};"));
            let var = format!("hidx_{:x}", self.pc);
            self.add(format!("{{ static uint32_t {var} = 0;"));
            self.add(format!(
                "if ({var}) {{ if (api.execute_handler(cpu, {var}, {word}u)) \
                 return (ReturnValues){{0, 0}}; }}"
            ));
            self.add(format!(
                "else {{ {var} = api.execute(cpu, {word}u); \
                 if (UNLIKELY(CPU_EXCEPTION(cpu))) return (ReturnValues){{0, 0}}; }} }}"
            ));
        } else {
            let pc = straddr(self.pc);
            self.add(format!(
                "api.trigger_exception(cpu, {pc}, ILLEGAL_OPCODE); return (ReturnValues){{0, 0}};"
            ));
        }
    }

    fn add_branch(&mut self, binfo: BranchInfo, op: &str) {
        let rs1 = self.from_reg(self.instr.rs1());
        let rs2 = self.from_reg(self.instr.rs2());
        if binfo.sign {
            self.add(format!("if ((saddr_t){rs1} {op} (saddr_t){rs2}) {{"));
        } else {
            self.add(format!("if ({rs1} {op} {rs2}) {{"));
        }

        let offset = self.instr.signed_imm_b();
        if self.pcrel(offset) & self.ctx.options.align_mask() != 0 {
            let pc = self.pcrel_s(0);
            self.add(format!(
                "api.trigger_exception(cpu, {pc}, MISALIGNED_INSTRUCTION); \
                 return (ReturnValues){{0, 0}};"
            ));
            self.add("}");
            return;
        }

        if binfo.jump_pc != 0 {
            let label = funclabel(&self.func, binfo.jump_pc);
            if binfo.jump_pc > self.pc || binfo.ignore_instruction_limit {
                // Unconditional forward jump, closing the branch bracket.
                self.add(format!("goto {label}; }}"));
                return;
            }
            // Backward jump: guarded by the remaining budget.
            self.add(format!("if ({LOOP_EXPRESSION}) goto {label};"));
        }
        // Budget exhausted or unknown target: leave with the branch target.
        let target = self.pcrel_s(offset);
        self.exit_function(&target, true);
    }

    fn run(&mut self) -> Result<(), Error> {
        let func = self.func.clone();
        self.add_mapping(self.begin_pc());
        self.add(format!("{}:;", funclabel(&func, self.begin_pc())));

        let instructions = self.tinfo.instructions.clone();
        let compressed = self.ctx.options.compressed;
        let mut next_pc = self.tinfo.basepc;

        for (i, instr) in instructions.iter().enumerate() {
            self.idx = i;
            self.instr = *instr;
            self.pc = next_pc;
            self.instr_len = if compressed { instr.length() } else { 4 };
            next_pc = self.pc + self.instr_len;

            // Re-entry points and jump targets get labels; re-entry points
            // additionally become function entries.
            if i > 0
                && (self.mapping_labels.contains(&i)
                    || self.tinfo.global_jump_locations.contains(&self.pc))
            {
                self.increment_counter_so_far();
                self.add(format!("{}:;", funclabel(&func, self.pc)));
                self.add_mapping(self.pc);
            } else if i > 0
                && (self.tinfo.jump_locations.contains(&self.pc) || self.labels.contains(&self.pc))
            {
                self.increment_counter_so_far();
                self.add(format!("{}:;", funclabel(&func, self.pc)));
            }

            // Somebody may try to jump between the halves of a full-width
            // instruction; give them a trap instead of garbage.
            if compressed
                && self.instr_len == 4
                && self.tinfo.jump_locations.contains(&(self.pc + 2))
            {
                let label = funclabel(&func, self.pc + 2);
                let addr = straddr(self.pc + 2);
                self.add(format!("goto {label}_skip;"));
                self.add(format!("{label}:;"));
                self.add(format!(
                    "api.trigger_exception(cpu, {addr}, MISALIGNED_INSTRUCTION); \
                     return (ReturnValues){{0, 0}};"
                ));
                self.add(format!("{label}_skip:;"));
            }

            if self.tinfo.trace_instructions {
                let pc = straddr(self.pc);
                let word = self.instr.0;
                self.add(format!("api.trace(cpu, \"{func}\", {pc}, {word}u);"));
            }

            self.instr_counter += 1;

            if compressed && self.instr.is_compressed() {
                // No compressed expander: dispatch through the interpreter.
                // Irregular forms modify PC, so the function exits through
                // whatever the handler wrote.
                let half = self.instr.half();
                let irregular = !crate::instr::CInstr(half).is_regular(self.xlen());
                if irregular {
                    self.increment_counter_so_far();
                }
                self.add(format!("cpu->pc = {};", self.pcrel_s(0)));
                self.add(format!("api.execute(cpu, {:#06x});", half));
                self.add("if (UNLIKELY(CPU_EXCEPTION(cpu))) return (ReturnValues){0, 0};");
                if irregular {
                    self.exit_function("cpu->pc", false);
                    self.add_reentry_next();
                }
                continue;
            }

            self.emit_instruction()?;
        }

        // A block may end on a plain instruction; finish gracefully.
        self.increment_counter_so_far();
        let end = straddr(self.end_pc());
        self.exit_function(&end, true);
        Ok(())
    }

    fn emit_instruction(&mut self) -> Result<(), Error> {
        let instr = self.instr;
        match instr.opcode() {
            opcodes::LOAD => self.emit_load(),
            opcodes::STORE => self.emit_store(),
            opcodes::BRANCH => self.emit_branch(),
            opcodes::JALR => self.emit_jalr(),
            opcodes::JAL => self.emit_jal(),
            opcodes::OP_IMM => self.emit_op_imm(),
            opcodes::OP => self.emit_op_reg(),
            opcodes::LUI => {
                if instr.rd() != 0 {
                    let line = format!(
                        "{} = {};",
                        self.to_reg(instr.rd()),
                        self.from_imm(instr.upper_imm())
                    );
                    self.add(line);
                }
            }
            opcodes::AUIPC => {
                if instr.rd() != 0 {
                    let line = format!(
                        "{} = {};",
                        self.to_reg(instr.rd()),
                        self.pcrel_s(instr.upper_imm())
                    );
                    self.add(line);
                }
            }
            opcodes::FENCE => {}
            opcodes::SYSTEM => self.emit_system(),
            opcodes::OP_IMM32 => self.emit_op_imm32(),
            opcodes::OP32 => self.emit_op32(),
            opcodes::LOAD_FP => self.emit_fp_load(),
            opcodes::STORE_FP => self.emit_fp_store(),
            opcodes::FMADD | opcodes::FMSUB | opcodes::FNMSUB | opcodes::FNMADD => {
                self.emit_fp_fma()
            }
            opcodes::OP_FP => self.emit_fp_op(),
            opcodes::OP_V => self.emit_vector(),
            opcodes::ATOMIC => self.unknown_instruction(),
            _ => self.unknown_instruction(),
        }
        Ok(())
    }

    fn emit_load(&mut self) {
        let instr = self.instr;
        let imm = instr.signed_imm_i();
        let rs1 = instr.rs1();
        if instr.rd() != 0 {
            let dst = self.to_reg(instr.rd());
            match instr.funct3() {
                0x0 => self.memory_load(dst, "int8_t", true, rs1, imm, 1),
                0x1 => self.memory_load(dst, "int16_t", true, rs1, imm, 2),
                0x2 => self.memory_load(dst, "int32_t", true, rs1, imm, 4),
                0x3 if self.xlen() == 64 => self.memory_load(dst, "int64_t", true, rs1, imm, 8),
                0x4 => self.memory_load(dst, "uint8_t", false, rs1, imm, 1),
                0x5 => self.memory_load(dst, "uint16_t", false, rs1, imm, 2),
                0x6 => self.memory_load(dst, "uint32_t", false, rs1, imm, 4),
                _ => self.unknown_instruction(),
            }
        } else {
            // rd=0: keep the access for its fault side effect only.
            let temp = format!("tmp_{:x}", self.pc);
            self.add(format!("{{ uint8_t {temp};"));
            self.memory_load(temp.clone(), "volatile uint8_t", false, rs1, imm, 1);
            self.add(format!("(void){temp}; }}"));
        }
    }

    fn emit_store(&mut self) {
        let instr = self.instr;
        let imm = instr.signed_imm_s();
        let rs1 = instr.rs1();
        let value = self.from_reg(instr.rs2());
        match instr.funct3() {
            0x0 => self.memory_store("int8_t", rs1, imm, value, 1),
            0x1 => self.memory_store("int16_t", rs1, imm, value, 2),
            0x2 => self.memory_store("int32_t", rs1, imm, value, 4),
            0x3 if self.xlen() == 64 => self.memory_store("int64_t", rs1, imm, value, 8),
            _ => self.unknown_instruction(),
        }
    }

    fn emit_branch(&mut self) {
        self.increment_counter_so_far();
        let instr = self.instr;
        let offset = instr.signed_imm_b();
        let dest_pc = self.pcrel(offset);
        let mut jump_pc = 0u64;
        if dest_pc == self.begin_pc() {
            // Branching back to the top restarts the function.
            jump_pc = dest_pc;
        } else if offset > 0 && dest_pc < self.end_pc() {
            self.labels.insert(dest_pc);
            jump_pc = dest_pc;
        } else if self.tinfo.jump_locations.contains(&dest_pc)
            && dest_pc >= self.begin_pc()
            && dest_pc < self.end_pc()
        {
            jump_pc = dest_pc;
        }
        let ignore = self.tinfo.ignore_instruction_limit;
        match instr.funct3() {
            0x0 => self.add_branch(BranchInfo { sign: false, ignore_instruction_limit: ignore, jump_pc }, "=="),
            0x1 => self.add_branch(BranchInfo { sign: false, ignore_instruction_limit: ignore, jump_pc }, "!="),
            0x4 => self.add_branch(BranchInfo { sign: true, ignore_instruction_limit: ignore, jump_pc }, "<"),
            0x5 => self.add_branch(BranchInfo { sign: true, ignore_instruction_limit: ignore, jump_pc }, ">="),
            0x6 => self.add_branch(BranchInfo { sign: false, ignore_instruction_limit: ignore, jump_pc }, "<"),
            0x7 => self.add_branch(BranchInfo { sign: false, ignore_instruction_limit: ignore, jump_pc }, ">="),
            _ => self.unknown_instruction(),
        }
    }

    fn emit_jalr(&mut self) {
        self.increment_counter_so_far();
        let instr = self.instr;
        let imm = self.from_imm(instr.signed_imm_i());
        if instr.rd() != 0 {
            // RS1 can be clobbered by RD, so latch it first.
            let rs1 = self.from_reg(instr.rs1());
            let link = self.pcrel_s(self.instr_len as i64);
            let rd = self.to_reg(instr.rd());
            self.add(format!("{{ addr_t rs1_ = {rs1};"));
            self.add(format!("{rd} = {link};"));
            self.add(format!("JUMP_TO(cpu, rs1_ + {imm}); }}"));
        } else {
            let rs1 = self.from_reg(instr.rs1());
            self.add(format!("JUMP_TO(cpu, {rs1} + {imm});"));
        }
        self.exit_function("cpu->pc", false);
        self.add_reentry_next();
    }

    fn emit_jal(&mut self) {
        self.increment_counter_so_far();
        let instr = self.instr;
        if instr.rd() != 0 {
            let rd = self.to_reg(instr.rd());
            let link = self.pcrel_s(self.instr_len as i64);
            self.add(format!("{rd} = {link};"));
        }
        let dest_pc = self.pcrel(instr.jump_offset()) & !self.ctx.options.align_mask();
        let next_pc = self.pc + self.instr_len;
        let mut add_reentry = instr.rd() != 0;
        let mut already_exited = false;

        if dest_pc >= self.begin_pc() && dest_pc < self.end_pc() {
            let label = funclabel(&self.func, dest_pc);
            if dest_pc > self.pc {
                self.labels.insert(dest_pc);
                self.add(format!("goto {label};"));
            } else if self.tinfo.ignore_instruction_limit {
                self.add(format!("goto {label};"));
                // Code right after a backward jump is often a jump target
                // itself; keep it reachable.
                if instr.rd() == 0 {
                    add_reentry = true;
                }
            } else {
                self.add(format!("if ({LOOP_EXPRESSION}) goto {label};"));
                if instr.rd() == 0 {
                    add_reentry = true;
                }
            }
        } else if self.tinfo.global_jump_locations.contains(&dest_pc)
            && self.tinfo.within_segment(dest_pc)
        {
            let target_funcaddr = self.tinfo.find_block_base(dest_pc);
            // Call an already-discovered block directly, forward only.
            if target_funcaddr != 0 && dest_pc > self.pc {
                let target_func = func_for(target_funcaddr);
                self.add_forward(&target_func);
                self.add("{ ReturnValues rv_;");
                let dest = straddr(dest_pc);
                if self.tinfo.ignore_instruction_limit {
                    self.add(format!("rv_ = {target_func}(cpu, 0, max_counter, {dest});"));
                } else {
                    self.add(format!(
                        "rv_ = {target_func}(cpu, counter, max_counter, {dest});"
                    ));
                    self.add("counter = rv_.counter;");
                }
                self.add("max_counter = rv_.max_counter; }");
                if instr.rd() != 0 && self.add_reentry_next() {
                    // Fast path back into this function after the call.
                    let label = funclabel(&self.func, next_pc);
                    let next = straddr(next_pc);
                    if self.tinfo.ignore_instruction_limit {
                        self.add(format!("if (cpu->pc == {next}) goto {label};"));
                    } else {
                        self.add(format!(
                            "if ({LOOP_EXPRESSION} && cpu->pc == {next}) goto {label};"
                        ));
                    }
                }
                self.exit_function("cpu->pc", false);
                already_exited = true;
            }
        }

        if !already_exited {
            let dest = straddr(dest_pc);
            self.exit_function(&dest, false);
        }
        if add_reentry {
            self.add_reentry_next();
        }
    }

    fn emit_system(&mut self) {
        let instr = self.instr;
        if instr.funct3() == 0 {
            self.increment_counter_so_far();
            if instr.imm_i() < 2 {
                // ECALL and EBREAK
                let sysno = if instr.imm_i() == 0 {
                    self.from_reg(REG_ECALL)
                } else {
                    SYSCALL_EBREAK.to_string()
                };
                let pc = self.pcrel_s(0);
                self.add(format!("cpu->pc = {pc};"));
                if !self.tinfo.ignore_instruction_limit {
                    self.add(format!(
                        "if (UNLIKELY(do_syscall(cpu, counter, max_counter, {sysno}))) {{"
                    ));
                    // Correct for the +4 expectation outside translated code.
                    self.add("  cpu->pc += 4; return (ReturnValues){counter, MAX_COUNTER(cpu)}; }");
                    self.add("counter = INS_COUNTER(cpu);");
                } else {
                    self.add(format!(
                        "if (UNLIKELY(do_syscall(cpu, 0, max_counter, {sysno}))) {{"
                    ));
                    self.add("  cpu->pc += 4; return (ReturnValues){0, MAX_COUNTER(cpu)}; }");
                }
                self.add("max_counter = MAX_COUNTER(cpu);");
            } else if instr.imm_i() == SYSTEM_IMM_WFI || instr.imm_i() == SYSTEM_IMM_STOP {
                // Immediate stop, resuming at the following instruction.
                self.add("max_counter = 0;");
                let next = self.pcrel_s(4);
                self.exit_function(&next, false);
                self.add_reentry_next();
            } else {
                let pc = self.pcrel_s(0);
                self.add(format!("cpu->pc = {pc};"));
                self.add(format!("api.system(cpu, {}u);", instr.0));
            }
        } else {
            // CSR and the other non-zero funct3 system functions.
            let pc = self.pcrel_s(0);
            self.add(format!("cpu->pc = {pc};"));
            if !self.tinfo.ignore_instruction_limit {
                self.add("INS_COUNTER(cpu) = counter;");
            }
            self.add("MAX_COUNTER(cpu) = max_counter;");
            self.add(format!("api.system(cpu, {}u);", instr.0));
            self.add("if (UNLIKELY(CPU_EXCEPTION(cpu))) return (ReturnValues){0, 0};");
        }
    }

    fn emit_op_imm(&mut self) {
        let instr = self.instr;
        if instr.rd() == 0 {
            return; // no side effects
        }
        let xlen = self.xlen();
        let dst = self.to_reg(instr.rd());
        let src = self.from_reg(instr.rs1());
        match instr.funct3() {
            0x0 => {
                // ADDI; the zero immediate is a register move.
                if instr.signed_imm_i() == 0 {
                    self.add(format!("{dst} = {src};"));
                } else {
                    let imm = self.from_imm(instr.signed_imm_i());
                    self.emit_op(" + ", " += ", instr.rd(), instr.rs1(), &imm);
                }
            }
            0x1 => match instr.imm_i() {
                0x604 => self.add(format!("{dst} = (saddr_t)(int8_t){src};")),
                0x605 => self.add(format!("{dst} = (saddr_t)(int16_t){src};")),
                0x600 => {
                    let clz = if xlen == 32 { "do_clz" } else { "do_clzl" };
                    self.add(format!("{dst} = {src} ? {clz}({src}) : XLEN;"));
                }
                0x601 => {
                    let ctz = if xlen == 32 { "do_ctz" } else { "do_ctzl" };
                    self.add(format!("{dst} = {src} ? {ctz}({src}) : XLEN;"));
                }
                0x602 => {
                    let cpop = if xlen == 32 { "do_cpop" } else { "do_cpopl" };
                    self.add(format!("{dst} = {cpop}({src});"));
                }
                _ => match instr.high_bits() {
                    0x000 => {
                        let shamt = (instr.shift64_imm() & (xlen - 1)).to_string();
                        self.emit_op(" << ", " <<= ", instr.rd(), instr.rs1(), &shamt);
                    }
                    0x280 => {
                        let bit = instr.imm_i() & (xlen - 1);
                        self.add(format!("{dst} = {src} | ((addr_t)1 << {bit});"));
                    }
                    0x480 => {
                        let bit = instr.imm_i() & (xlen - 1);
                        self.add(format!("{dst} = {src} & ~((addr_t)1 << {bit});"));
                    }
                    0x680 => {
                        let bit = instr.imm_i() & (xlen - 1);
                        self.add(format!("{dst} = {src} ^ ((addr_t)1 << {bit});"));
                    }
                    _ => self.unknown_instruction(),
                },
            },
            0x2 => {
                let imm = self.from_imm(instr.signed_imm_i());
                self.add(format!("{dst} = ((saddr_t){src} < {imm}) ? 1 : 0;"));
            }
            0x3 => {
                let imm = self.from_imm(instr.signed_imm_i());
                self.add(format!("{dst} = ({src} < (addr_t){imm}) ? 1 : 0;"));
            }
            0x4 => {
                let imm = self.from_imm(instr.signed_imm_i());
                self.emit_op(" ^ ", " ^= ", instr.rd(), instr.rs1(), &imm);
            }
            0x5 => {
                if instr.is_rori() {
                    let shift = instr.imm_i() & (xlen - 1);
                    self.add(format!("{{ const unsigned shift_ = {shift};"));
                    self.add(format!(
                        "{dst} = ({src} >> shift_) | ({src} << (XLEN - shift_)); }}"
                    ));
                } else if instr.imm_i() == 0x287 {
                    // ORC.B: OR-combine each byte.
                    self.add("for (unsigned i_ = 0; i_ < sizeof(addr_t); i_++)".to_string());
                    self.add(format!(
                        "  ((char*)&{dst})[i_] = ((char*)&{src})[i_] ? 0xFF : 0x0;"
                    ));
                } else if instr.is_rev8(xlen) {
                    let bswap = if xlen == 32 { "do_bswap32" } else { "do_bswap64" };
                    self.add(format!("{dst} = {bswap}({src});"));
                } else if instr.high_bits() == 0x0 {
                    let shamt = (instr.shift64_imm() & (xlen - 1)).to_string();
                    self.emit_op(" >> ", " >>= ", instr.rd(), instr.rs1(), &shamt);
                } else if instr.high_bits() == 0x400 {
                    let shamt = instr.shift64_imm() & (xlen - 1);
                    self.add(format!("{dst} = (saddr_t){src} >> {shamt};"));
                } else if instr.high_bits() == 0x480 {
                    let bit = instr.imm_i() & (xlen - 1);
                    self.add(format!("{dst} = ({src} >> {bit}) & 1;"));
                } else {
                    self.unknown_instruction();
                }
            }
            0x6 => {
                let imm = self.from_imm(instr.signed_imm_i());
                self.add(format!("{dst} = {src} | {imm};"));
            }
            0x7 => {
                let imm = self.from_imm(instr.signed_imm_i());
                self.add(format!("{dst} = {src} & {imm};"));
            }
            _ => self.unknown_instruction(),
        }
    }

    fn emit_op_reg(&mut self) {
        let instr = self.instr;
        if instr.rd() == 0 {
            return;
        }
        let xlen = self.xlen();
        let dst = self.to_reg(instr.rd());
        let rs1 = self.from_reg(instr.rs1());
        let rs2 = self.from_reg(instr.rs2());
        match instr.op_key() {
            0x0 => self.emit_op(" + ", " += ", instr.rd(), instr.rs1(), &rs2),
            0x200 => self.emit_op(" - ", " -= ", instr.rd(), instr.rs1(), &rs2),
            0x1 => self.add(format!("{dst} = {rs1} << ({rs2} & (XLEN-1));")),
            0x2 => self.add(format!("{dst} = ((saddr_t){rs1} < (saddr_t){rs2}) ? 1 : 0;")),
            0x3 => self.add(format!("{dst} = ({rs1} < {rs2}) ? 1 : 0;")),
            0x4 => self.emit_op(" ^ ", " ^= ", instr.rd(), instr.rs1(), &rs2),
            0x5 => self.add(format!("{dst} = {rs1} >> ({rs2} & (XLEN-1));")),
            0x205 => self.add(format!("{dst} = (saddr_t){rs1} >> ({rs2} & (XLEN-1));")),
            0x6 => self.emit_op(" | ", " |= ", instr.rd(), instr.rs1(), &rs2),
            0x7 => self.emit_op(" & ", " &= ", instr.rd(), instr.rs1(), &rs2),
            // M extension
            0x10 => self.add(format!("{dst} = (saddr_t){rs1} * (saddr_t){rs2};")),
            0x11 => {
                if xlen == 32 {
                    self.add(format!(
                        "{dst} = (uint64_t)((int64_t)(saddr_t){rs1} * (int64_t)(saddr_t){rs2}) >> 32u;"
                    ));
                } else {
                    self.add(format!("{dst} = MULH64({rs1}, {rs2});"));
                }
            }
            0x12 => {
                if xlen == 32 {
                    self.add(format!(
                        "{dst} = (uint64_t)((int64_t)(saddr_t){rs1} * (uint64_t){rs2}) >> 32u;"
                    ));
                } else {
                    self.add(format!("{dst} = MULHSU64({rs1}, {rs2});"));
                }
            }
            0x13 => {
                if xlen == 32 {
                    self.add(format!(
                        "{dst} = ((uint64_t){rs1} * (uint64_t){rs2}) >> 32u;"
                    ));
                } else {
                    self.add(format!("{dst} = MULHU64({rs1}, {rs2});"));
                }
            }
            0x14 => {
                // Division by zero is not an exception.
                let min = if xlen == 32 {
                    "{rs1} == 2147483648u && {rs2} == 4294967295u".to_string()
                } else {
                    "{rs1} == 9223372036854775808ull && {rs2} == 18446744073709551615ull"
                        .to_string()
                };
                let overflow = min.replace("{rs1}", &rs1).replace("{rs2}", &rs2);
                self.add(format!("if (LIKELY({rs2} != 0)) {{"));
                self.add(format!("  if (LIKELY(!({overflow})))"));
                self.add(format!("    {dst} = (saddr_t){rs1} / (saddr_t){rs2};"));
                self.add("}");
            }
            0x15 => {
                self.add(format!("if (LIKELY({rs2} != 0))"));
                self.add(format!("  {dst} = {rs1} / {rs2};"));
            }
            0x16 => {
                let min = if xlen == 32 {
                    "{rs1} == 2147483648u && {rs2} == 4294967295u".to_string()
                } else {
                    "{rs1} == 9223372036854775808ull && {rs2} == 18446744073709551615ull"
                        .to_string()
                };
                let overflow = min.replace("{rs1}", &rs1).replace("{rs2}", &rs2);
                self.add(format!("if (LIKELY({rs2} != 0)) {{"));
                self.add(format!("  if (LIKELY(!({overflow})))"));
                self.add(format!("    {dst} = (saddr_t){rs1} % (saddr_t){rs2};"));
                self.add("}");
            }
            0x17 => {
                self.add(format!("if (LIKELY({rs2} != 0))"));
                self.add(format!("  {dst} = {rs1} % {rs2};"));
            }
            // Zba / Zbb / Zbs / Zbc
            0x44 => self.add(format!("{dst} = (uint16_t){rs1};")),
            0x51 => {
                self.add("{ addr_t result_ = 0;");
                self.add("for (unsigned i_ = 0; i_ < XLEN; i_++)");
                self.add(format!("  if (({rs2} >> i_) & 1) result_ ^= ({rs1} << i_);"));
                self.add(format!("{dst} = result_; }}"));
            }
            0x52 => {
                self.add("{ addr_t result_ = 0;");
                self.add("for (unsigned i_ = 0; i_ < XLEN-1; i_++)");
                self.add(format!(
                    "  if (({rs2} >> i_) & 1) result_ ^= ({rs1} >> (XLEN - i_ - 1));"
                ));
                self.add(format!("{dst} = result_; }}"));
            }
            0x53 => {
                self.add("{ addr_t result_ = 0;");
                self.add("for (unsigned i_ = 1; i_ < XLEN; i_++)");
                self.add(format!(
                    "  if (({rs2} >> i_) & 1) result_ ^= ({rs1} >> (XLEN - i_));"
                ));
                self.add(format!("{dst} = result_; }}"));
            }
            0x102 => self.add(format!("{dst} = {rs2} + ({rs1} << 1);")),
            0x104 => self.add(format!("{dst} = {rs2} + ({rs1} << 2);")),
            0x106 => self.add(format!("{dst} = {rs2} + ({rs1} << 3);")),
            0x141 => self.add(format!("{dst} = {rs1} | ((addr_t)1 << ({rs2} & (XLEN-1)));")),
            0x142 => self.add(format!("{dst} = {rs1} & ~((addr_t)1 << ({rs2} & (XLEN-1)));")),
            0x143 => self.add(format!("{dst} = {rs1} ^ ((addr_t)1 << ({rs2} & (XLEN-1)));")),
            0x204 => self.add(format!("{dst} = ~({rs1} ^ {rs2});")),
            0x206 => self.add(format!("{dst} = ({rs1} | ~{rs2});")),
            0x207 => self.add(format!("{dst} = ({rs1} & ~{rs2});")),
            0x245 => self.add(format!("{dst} = ({rs1} >> ({rs2} & (XLEN-1))) & 1;")),
            0x54 => self.add(format!(
                "{dst} = ((saddr_t){rs1} < (saddr_t){rs2}) ? {rs1} : {rs2};"
            )),
            0x55 => self.add(format!("{dst} = ({rs1} < {rs2}) ? {rs1} : {rs2};")),
            0x56 => self.add(format!(
                "{dst} = ((saddr_t){rs1} > (saddr_t){rs2}) ? {rs1} : {rs2};"
            )),
            0x57 => self.add(format!("{dst} = ({rs1} > {rs2}) ? {rs1} : {rs2};")),
            0x301 => {
                self.add(format!("{{ const unsigned shift_ = {rs2} & (XLEN-1);"));
                self.add(format!(
                    "{dst} = ({rs1} << shift_) | ({rs1} >> (XLEN - shift_)); }}"
                ));
            }
            0x305 => {
                self.add(format!("{{ const unsigned shift_ = {rs2} & (XLEN-1);"));
                self.add(format!(
                    "{dst} = ({rs1} >> shift_) | ({rs1} << (XLEN - shift_)); }}"
                ));
            }
            _ => self.unknown_instruction(),
        }
    }

    fn emit_op_imm32(&mut self) {
        let instr = self.instr;
        if self.xlen() < 64 {
            self.unknown_instruction();
            return;
        }
        if instr.rd() == 0 {
            return;
        }
        let dst = self.to_reg(instr.rd());
        let src = format!("(uint32_t){}", self.from_reg(instr.rs1()));
        match instr.funct3() {
            0x0 => {
                let imm = self.from_imm(instr.signed_imm_i());
                self.add(format!("{dst} = {SIGNEXTW} ({src} + {imm});"));
            }
            0x1 => {
                if instr.high_bits() == 0x000 {
                    let shamt = instr.shift_imm();
                    self.add(format!("{dst} = {SIGNEXTW} ({src} << {shamt});"));
                } else if instr.high_bits() == 0x080 {
                    // SLLI.UW
                    let shamt = instr.shift_imm();
                    self.add(format!("{dst} = ((addr_t){src} << {shamt});"));
                } else {
                    match instr.imm_i() {
                        0x600 => self.add(format!("{dst} = {src} ? do_clz({src}) : 32;")),
                        0x601 => self.add(format!("{dst} = {src} ? do_ctz({src}) : 32;")),
                        0x602 => self.add(format!("{dst} = do_cpop({src});")),
                        _ => self.unknown_instruction(),
                    }
                }
            }
            0x5 => {
                if instr.high_bits() == 0x0 {
                    let shamt = instr.shift_imm();
                    self.add(format!("{dst} = {SIGNEXTW} ({src} >> {shamt});"));
                } else if instr.high_bits() == 0x400 {
                    let shamt = instr.shift_imm();
                    self.add(format!("{dst} = (int32_t){src} >> {shamt};"));
                } else if instr.high_bits() == 0x600 {
                    // RORIW
                    let shamt = instr.shift_imm() & 31;
                    self.add(format!("{{ const unsigned shift_ = {shamt};"));
                    self.add(format!(
                        "{dst} = (int32_t)(({src} >> shift_) | ({src} << (32 - shift_))); }}"
                    ));
                } else {
                    self.unknown_instruction();
                }
            }
            _ => self.unknown_instruction(),
        }
    }

    fn emit_op32(&mut self) {
        let instr = self.instr;
        if self.xlen() < 64 {
            self.unknown_instruction();
            return;
        }
        if instr.rd() == 0 {
            return;
        }
        let dst = self.to_reg(instr.rd());
        let src1 = format!("(uint32_t){}", self.from_reg(instr.rs1()));
        let src2 = format!("(uint32_t){}", self.from_reg(instr.rs2()));
        let wide2 = self.from_reg(instr.rs2());
        match instr.op_key() {
            0x0 => self.add(format!("{dst} = {SIGNEXTW} ({src1} + {src2});")),
            0x200 => self.add(format!("{dst} = {SIGNEXTW} ({src1} - {src2});")),
            0x1 => self.add(format!("{dst} = {SIGNEXTW} ({src1} << ({src2} & 31));")),
            0x5 => self.add(format!("{dst} = {SIGNEXTW} ({src1} >> ({src2} & 31));")),
            0x205 => self.add(format!("{dst} = (int32_t){src1} >> ({src2} & 31);")),
            0x10 => self.add(format!("{dst} = {SIGNEXTW} ({src1} * {src2});")),
            0x14 => {
                self.add(format!("if (LIKELY({src2} != 0))"));
                self.add(format!(
                    "if (LIKELY(!((int32_t){src1} == -2147483648 && (int32_t){src2} == -1)))"
                ));
                self.add(format!(
                    "{dst} = {SIGNEXTW} ((int32_t){src1} / (int32_t){src2});"
                ));
            }
            0x15 => {
                self.add(format!("if (LIKELY({src2} != 0))"));
                self.add(format!("{dst} = {SIGNEXTW} ({src1} / {src2});"));
            }
            0x16 => {
                self.add(format!("if (LIKELY({src2} != 0))"));
                self.add(format!(
                    "if (LIKELY(!((int32_t){src1} == -2147483648 && (int32_t){src2} == -1)))"
                ));
                self.add(format!(
                    "{dst} = {SIGNEXTW} ((int32_t){src1} % (int32_t){src2});"
                ));
            }
            0x17 => {
                self.add(format!("if (LIKELY({src2} != 0))"));
                self.add(format!("{dst} = {SIGNEXTW} ({src1} % {src2});"));
            }
            0x40 => self.add(format!("{dst} = {wide2} + {src1};")),
            0x44 => self.add(format!("{dst} = (uint16_t)({src1});")),
            0x102 => self.add(format!("{dst} = {wide2} + ((addr_t){src1} << 1);")),
            0x104 => self.add(format!("{dst} = {wide2} + ((addr_t){src1} << 2);")),
            0x106 => self.add(format!("{dst} = {wide2} + ((addr_t){src1} << 3);")),
            0x301 => {
                self.add(format!("{{ const unsigned shift_ = {src2} & 31;"));
                self.add(format!(
                    "{dst} = (int32_t)(({src1} << shift_) | ({src1} >> (32 - shift_))); }}"
                ));
            }
            0x305 => {
                self.add(format!("{{ const unsigned shift_ = {src2} & 31;"));
                self.add(format!(
                    "{dst} = (int32_t)(({src1} >> shift_) | ({src1} << (32 - shift_))); }}"
                ));
            }
            _ => self.unknown_instruction(),
        }
    }

    fn emit_fp_load(&mut self) {
        let instr = self.instr;
        let imm = instr.signed_imm_i();
        let rs1 = instr.rs1();
        match instr.funct3() {
            0x2 => {
                let dst = format!("{}.i32[0]", self.from_fpreg(instr.rd()));
                self.memory_load(dst, "int32_t", false, rs1, imm, 4);
                let hi = format!("{}.i32[1]", self.from_fpreg(instr.rd()));
                self.add(format!("{hi} = 0;"));
            }
            0x3 => {
                let dst = format!("{}.i64", self.from_fpreg(instr.rd()));
                self.memory_load(dst, "int64_t", false, rs1, imm, 8);
            }
            0x6 if self.ctx.options.vector_extension > 0 => {
                // VLE32: vector lane load through the arena or the callback.
                let vd = instr.rd();
                if matches!(self.ctx.effective_arena(), ArenaKind::None) {
                    let addr = self.from_reg(rs1);
                    self.add(format!("api.vec_load(cpu, {vd}, {addr});"));
                } else {
                    let dst = self.from_rvvreg(vd);
                    let at = self.arena_at(&self.from_reg(rs1));
                    self.add(format!("{dst} = *(vlane_t*){at};"));
                }
            }
            _ => self.unknown_instruction(),
        }
    }

    fn emit_fp_store(&mut self) {
        let instr = self.instr;
        let imm = instr.signed_imm_s();
        let rs1 = instr.rs1();
        match instr.funct3() {
            0x2 => {
                let value = format!("{}.i32[0]", self.from_fpreg(instr.rs2()));
                self.memory_store("int32_t", rs1, imm, value, 4);
            }
            0x3 => {
                let value = format!("{}.i64", self.from_fpreg(instr.rs2()));
                self.memory_store("int64_t", rs1, imm, value, 8);
            }
            0x6 if self.ctx.options.vector_extension > 0 => {
                let vd = instr.rd();
                if matches!(self.ctx.effective_arena(), ArenaKind::None) {
                    let addr = self.from_reg(rs1);
                    self.add(format!("api.vec_store(cpu, {addr}, {vd});"));
                } else {
                    let src = self.from_rvvreg(vd);
                    let at = self.arena_at(&self.from_reg(rs1));
                    self.add(format!("*(vlane_t*){at} = {src};"));
                }
            }
            _ => self.unknown_instruction(),
        }
    }

    fn emit_fp_fma(&mut self) {
        let instr = self.instr;
        let dst = self.from_fpreg(instr.rd());
        let rs1 = self.from_fpreg(instr.rs1());
        let rs2 = self.from_fpreg(instr.rs2());
        let rs3 = self.from_fpreg(instr.rs3());
        let sign = if matches!(instr.opcode(), opcodes::FNMADD | opcodes::FNMSUB) {
            "-"
        } else {
            ""
        };
        let add = if matches!(instr.opcode(), opcodes::FMSUB | opcodes::FNMSUB) {
            " - "
        } else {
            " + "
        };
        match instr.r4_funct2() {
            0x0 => self.add(format!(
                "set_fl(&{dst}, {sign}({rs1}.f32[0] * {rs2}.f32[0]{add}{rs3}.f32[0]));"
            )),
            0x1 => self.add(format!(
                "set_dbl(&{dst}, {sign}({rs1}.f64 * {rs2}.f64{add}{rs3}.f64));"
            )),
            _ => self.unknown_instruction(),
        }
    }

    fn emit_fp_op(&mut self) {
        let instr = self.instr;
        let funct2 = instr.fp_funct2();
        if funct2 >= 0x2 {
            self.unknown_instruction();
            return;
        }
        let double = funct2 == 0x1;
        let dst = self.from_fpreg(instr.rd());
        let rs1 = self.from_fpreg(instr.rs1());
        let rs2 = self.from_fpreg(instr.rs2());
        match instr.fpfunc() {
            0x00 | 0x01 | 0x02 | 0x03 => {
                let op = match instr.fpfunc() {
                    0x00 => " + ",
                    0x01 => " - ",
                    0x02 => " * ",
                    _ => " / ",
                };
                if double {
                    self.add(format!("set_dbl(&{dst}, {rs1}.f64{op}{rs2}.f64);"));
                } else {
                    self.add(format!("set_fl(&{dst}, {rs1}.f32[0]{op}{rs2}.f32[0]);"));
                }
            }
            0x0B => {
                if double {
                    self.add(format!("set_dbl(&{dst}, api.sqrtf64({rs1}.f64));"));
                } else {
                    self.add(format!("set_fl(&{dst}, api.sqrtf32({rs1}.f32[0]));"));
                }
            }
            0x05 => match (instr.funct3(), double) {
                (0x0, false) => {
                    self.add(format!(
                        "set_fl(&{dst}, ({rs1}.f32[0] < {rs2}.f32[0]) ? {rs1}.f32[0] : {rs2}.f32[0]);"
                    ));
                }
                (0x1, false) => {
                    self.add(format!(
                        "set_fl(&{dst}, ({rs1}.f32[0] > {rs2}.f32[0]) ? {rs1}.f32[0] : {rs2}.f32[0]);"
                    ));
                }
                (0x0, true) => {
                    self.add(format!(
                        "set_dbl(&{dst}, ({rs1}.f64 < {rs2}.f64) ? {rs1}.f64 : {rs2}.f64);"
                    ));
                }
                (0x1, true) => {
                    self.add(format!(
                        "set_dbl(&{dst}, ({rs1}.f64 > {rs2}.f64) ? {rs1}.f64 : {rs2}.f64);"
                    ));
                }
                _ => self.unknown_instruction(),
            },
            0x14 => {
                if instr.rd() == 0 {
                    self.unknown_instruction();
                    return;
                }
                let out = self.to_reg(instr.rd());
                let (a, b) = if double {
                    (format!("{rs1}.f64"), format!("{rs2}.f64"))
                } else {
                    (format!("{rs1}.f32[0]"), format!("{rs2}.f32[0]"))
                };
                match instr.funct3() {
                    0x0 => self.add(format!("{out} = ({a} <= {b}) ? 1 : 0;")),
                    0x1 => self.add(format!("{out} = ({a} < {b}) ? 1 : 0;")),
                    0x2 => self.add(format!("{out} = ({a} == {b}) ? 1 : 0;")),
                    _ => self.unknown_instruction(),
                }
            }
            0x04 => match instr.funct3() {
                0x0 => {
                    if instr.rs1() == instr.rs2() {
                        self.add(format!("{dst}.i64 = {rs1}.i64;"));
                    } else if double {
                        self.add(format!(
                            "load_dbl(&{dst}, ((uint64_t){rs2}.usign.sign << 63) | {rs1}.usign.bits);"
                        ));
                    } else {
                        self.add(format!(
                            "load_fl(&{dst}, ({rs2}.lsign.sign << 31) | {rs1}.lsign.bits);"
                        ));
                    }
                }
                0x1 => {
                    if double {
                        self.add(format!(
                            "load_dbl(&{dst}, (~(uint64_t){rs2}.usign.sign << 63) | {rs1}.usign.bits);"
                        ));
                    } else {
                        self.add(format!(
                            "load_fl(&{dst}, (~{rs2}.lsign.sign << 31) | {rs1}.lsign.bits);"
                        ));
                    }
                }
                0x2 => {
                    if double {
                        self.add(format!(
                            "load_dbl(&{dst}, ((uint64_t)({rs1}.usign.sign ^ {rs2}.usign.sign) << 63) | {rs1}.usign.bits);"
                        ));
                    } else {
                        self.add(format!(
                            "load_fl(&{dst}, (({rs1}.lsign.sign ^ {rs2}.lsign.sign) << 31) | {rs1}.lsign.bits);"
                        ));
                    }
                }
                _ => self.unknown_instruction(),
            },
            0x08 => {
                if double {
                    self.add(format!("set_dbl(&{dst}, {rs1}.f32[0]);"));
                } else {
                    self.add(format!("set_fl(&{dst}, {rs1}.f64);"));
                }
            }
            0x1A => {
                let sign = if instr.rs2() == 0 { "(saddr_t)" } else { "" };
                let src = self.from_reg(instr.rs1());
                if double {
                    self.add(format!("set_dbl(&{dst}, {sign}{src});"));
                } else {
                    self.add(format!("set_fl(&{dst}, {sign}{src});"));
                }
            }
            0x18 => {
                if instr.rd() == 0 {
                    self.unknown_instruction();
                    return;
                }
                let out = self.to_reg(instr.rd());
                let sign = if instr.rs2() == 0 {
                    "(int32_t)"
                } else {
                    "(uint32_t)"
                };
                if double {
                    self.add(format!("{out} = {sign}{rs1}.f64;"));
                } else {
                    self.add(format!("{out} = {sign}{rs1}.f32[0];"));
                }
            }
            0x1E => {
                let src = self.from_reg(instr.rs1());
                if double && self.xlen() == 64 {
                    self.add(format!("load_dbl(&{dst}, {src});"));
                } else if !double {
                    self.add(format!("load_fl(&{dst}, {src});"));
                } else {
                    self.unknown_instruction();
                }
            }
            0x1C => {
                if instr.funct3() != 0 || instr.rd() == 0 {
                    // FCLASS and friends stay in the interpreter.
                    self.unknown_instruction();
                    return;
                }
                let out = self.to_reg(instr.rd());
                if double && self.xlen() == 64 {
                    self.add(format!("{out} = {rs1}.i64;"));
                } else if !double {
                    self.add(format!("{out} = {rs1}.i32[0];"));
                } else {
                    self.unknown_instruction();
                }
            }
            _ => self.unknown_instruction(),
        }
    }

    fn emit_vector(&mut self) {
        let instr = self.instr;
        let vlen = self.ctx.options.vector_extension / 4;
        if vlen == 0 {
            self.unknown_instruction();
            return;
        }
        let vd = instr.rd();
        match instr.vwidth() {
            0x1 => {
                // OPF.VV
                let vs1 = self.from_rvvreg(instr.rs1());
                let vs2 = self.from_rvvreg(instr.rs2());
                let dst = self.from_rvvreg(vd);
                let op = match instr.vfunct6() {
                    0b000000 => " + ",
                    0b100100 => " * ",
                    _ => {
                        self.unknown_instruction();
                        return;
                    }
                };
                for i in 0..vlen {
                    self.add(format!(
                        "{dst}.f32[{i}] = {vs1}.f32[{i}]{op}{vs2}.f32[{i}];"
                    ));
                }
            }
            0x5 => {
                // OPF.VF: scalar operand from the float register file.
                let scalar = format!("scalar_{:x}", self.pc);
                let fs1 = self.from_fpreg(instr.rs1());
                let vs2 = self.from_rvvreg(instr.rs2());
                let dst = self.from_rvvreg(vd);
                let op = match instr.vfunct6() {
                    0b000000 => " + ",
                    0b100100 => " * ",
                    _ => {
                        self.unknown_instruction();
                        return;
                    }
                };
                self.add(format!("{{ const float {scalar} = {fs1}.f32[0];"));
                for i in 0..vlen {
                    self.add(format!("{dst}.f32[{i}] = {vs2}.f32[{i}]{op}{scalar};"));
                }
                self.add("}");
            }
            _ => self.unknown_instruction(),
        }
    }
}
