//! Minimal machine: guest CPU record, memory arena, fast-sim dispatch and
//! the callback table consumed by translated code.
//!
//! The CPU record is `#[repr(C)]`: its layout is a versioned contract with
//! the emitted C, which indexes registers directly and reaches the counters
//! and the arena pointer through byte offsets passed as `-D` macros. The
//! offsets are computed with `offset_of!` and asserted again inside the
//! generated C.
//!
//! Exceptions raised inside translated code never unwind across the FFI
//! boundary. Callbacks capture them into `cpu.current_exception`, stop the
//! machine, and the dispatch loop re-raises at its next safe point.

use std::ffi::{c_char, CStr};
use std::mem::offset_of;
use std::sync::Arc;

use crate::bintr::types::{CallbackTable, ReturnValues};
use crate::config::TranslatorOptions;
use crate::decoder::bytecodes;
use crate::decoder::DecoderTable;
use crate::error::{Error, ExceptionKind};
use crate::instr::{Instr, REG_ECALL};
use crate::segment::{ExecuteSegment, SegmentList};
use crate::{bintr, decode, predecode};

/// Maximum number of guest system call slots.
pub const SYSCALLS_MAX: usize = 512;

/// System call slot dispatched for EBREAK.
pub const SYSCALL_EBREAK: usize = SYSCALLS_MAX - 1;

/// Default bound on live execute segments per machine.
pub const MAX_EXECUTE_SEGMENTS: usize = 8;

/// One 64-bit float register with named lanes, 8 bytes like the C union.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct FpReg {
    pub bits: u64,
}

impl FpReg {
    #[inline]
    pub fn f32(self) -> f32 {
        f32::from_bits(self.bits as u32)
    }

    #[inline]
    pub fn f64(self) -> f64 {
        f64::from_bits(self.bits)
    }

    #[inline]
    pub fn set_f32(&mut self, v: f32) {
        self.set_f32_bits(v.to_bits());
    }

    #[inline]
    pub fn set_f32_bits(&mut self, bits: u32) {
        self.bits = bits as u64;
    }

    #[inline]
    pub fn set_f64(&mut self, v: f64) {
        self.bits = v.to_bits();
    }
}

/// One vector register lane group (VLEN = 128).
pub type VectorLane = [u32; 4];

/// The guest CPU record shared with emitted code. Field order is ABI.
#[repr(C)]
pub struct Cpu {
    pub pc: u64,
    pub regs: [u64; 32],
    pub fregs: [FpReg; 32],
    pub counter: u64,
    pub max_counter: u64,
    pub arena_ptr: *mut u8,
    /// Captured exception kind, or -1 when none is pending.
    pub current_exception: i32,
    pub(crate) machine: *mut Machine,
    pub rvv: [VectorLane; 32],
}

impl Cpu {
    fn new() -> Self {
        Self {
            pc: 0,
            regs: [0; 32],
            fregs: [FpReg::default(); 32],
            counter: 0,
            max_counter: 0,
            arena_ptr: std::ptr::null_mut(),
            current_exception: -1,
            machine: std::ptr::null_mut(),
            rvv: [[0; 4]; 32],
        }
    }
}

/// Byte offsets from the CPU base, fed to the translation as `-D` macros.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuOffsets {
    pub pc: usize,
    pub regs: usize,
    pub fregs: usize,
    pub counter: usize,
    pub max_counter: usize,
    pub arena: usize,
    pub exception: usize,
    pub rvv: usize,
}

impl CpuOffsets {
    pub fn current() -> Self {
        Self {
            pc: offset_of!(Cpu, pc),
            regs: offset_of!(Cpu, regs),
            fregs: offset_of!(Cpu, fregs),
            counter: offset_of!(Cpu, counter),
            max_counter: offset_of!(Cpu, max_counter),
            arena: offset_of!(Cpu, arena_ptr),
            exception: offset_of!(Cpu, current_exception),
            rvv: offset_of!(Cpu, rvv),
        }
    }
}

/// How the emitter may lower guest memory accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaKind {
    /// No arena assumptions: every access goes through a callback.
    None,
    /// Flat arena with readable/writable boundary checks.
    Flat,
    /// Power-of-two window over a host buffer: lowering is a mask and add.
    Encompassing { bits: u32 },
}

/// Guest memory backing store.
pub struct Arena {
    data: Vec<u8>,
    rodata_end: u64,
    kind: ArenaKind,
}

impl Arena {
    pub fn flat(size: usize, rodata_end: u64) -> Self {
        Self {
            data: vec![0; size],
            rodata_end,
            kind: ArenaKind::Flat,
        }
    }

    pub fn callbacks_only(size: usize) -> Self {
        Self {
            data: vec![0; size],
            rodata_end: 0,
            kind: ArenaKind::None,
        }
    }

    pub fn encompassing(bits: u32) -> Self {
        Self {
            data: vec![0; 1usize << bits],
            rodata_end: 0,
            kind: ArenaKind::Encompassing { bits },
        }
    }

    #[inline]
    pub fn kind(&self) -> ArenaKind {
        self.kind
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// End of the initially read-only data; GP-relative stores below it are
    /// never folded to fixed addresses.
    #[inline]
    pub fn rodata_end(&self) -> u64 {
        self.rodata_end
    }

    #[inline]
    fn resolve(&self, addr: u64, len: u64) -> Option<usize> {
        let addr = match self.kind {
            ArenaKind::Encompassing { bits } => addr & ((1u64 << bits) - 1),
            _ => addr,
        };
        if addr.checked_add(len)? <= self.size() {
            Some(addr as usize)
        } else {
            None
        }
    }

    pub fn read(&self, addr: u64, size: u64) -> Result<u64, Error> {
        let off = self
            .resolve(addr, size)
            .ok_or(Error::InvalidProgram("memory read outside arena"))?;
        let mut value = 0u64;
        for i in 0..size as usize {
            value |= (self.data[off + i] as u64) << (i * 8);
        }
        Ok(value)
    }

    pub fn write(&mut self, addr: u64, value: u64, size: u64) -> Result<(), Error> {
        let off = self
            .resolve(addr, size)
            .ok_or(Error::InvalidProgram("memory write outside arena"))?;
        for i in 0..size as usize {
            self.data[off + i] = (value >> (i * 8)) as u8;
        }
        Ok(())
    }

    pub fn base_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }
}

/// Guest system call handler.
pub type SyscallHandler = fn(&mut Machine) -> Result<(), Error>;

fn default_syscall(_m: &mut Machine) -> Result<(), Error> {
    // Unhandled system calls are ignored, like the default unknown-syscall
    // hook of the interpreter.
    Ok(())
}

fn stopping_syscall(m: &mut Machine) -> Result<(), Error> {
    m.stop();
    Ok(())
}

/// A single-threaded guest machine owning its execute segments.
pub struct Machine {
    pub cpu: Cpu,
    pub arena: Arena,
    pub options: TranslatorOptions,
    segments: SegmentList,
    syscall_handlers: Vec<SyscallHandler>,
    stopped: bool,
    start_address: u64,
    current_segment: Option<Arc<ExecuteSegment>>,
}

impl Machine {
    /// The machine is boxed so the CPU's back-pointer stays valid.
    pub fn new(options: TranslatorOptions, arena: Arena) -> Box<Self> {
        let mut m = Box::new(Self {
            cpu: Cpu::new(),
            arena,
            options,
            segments: SegmentList::new(MAX_EXECUTE_SEGMENTS),
            syscall_handlers: {
                let mut handlers = vec![default_syscall as SyscallHandler; SYSCALLS_MAX];
                handlers[SYSCALL_EBREAK] = stopping_syscall;
                handlers
            },
            stopped: false,
            start_address: 0,
            current_segment: None,
        });
        let machine_ptr: *mut Machine = &mut *m;
        m.cpu.machine = machine_ptr;
        m.cpu.arena_ptr = m.arena.base_ptr();
        m
    }

    #[inline]
    pub fn reg(&self, reg: u32) -> u64 {
        self.cpu.regs[reg as usize]
    }

    #[inline]
    pub fn set_reg(&mut self, reg: u32, value: u64) {
        if reg != 0 {
            self.cpu.regs[reg as usize] = value;
        }
    }

    pub fn check_alignment(&self, target: u64) -> Result<(), Error> {
        if target & self.options.align_mask() != 0 {
            return Err(Error::MisalignedInstruction(target));
        }
        Ok(())
    }

    pub fn mem_read(&self, addr: u64, size: u64) -> Result<u64, Error> {
        self.arena.read(addr, size)
    }

    pub fn mem_write(&mut self, addr: u64, value: u64, size: u64) -> Result<(), Error> {
        self.arena.write(addr, value, size)
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Program entry point; seeded into the global jump locations of any
    /// segment that contains it.
    pub fn set_start_address(&mut self, addr: u64) {
        self.start_address = addr;
    }

    pub fn start_address(&self) -> u64 {
        self.start_address
    }

    pub fn set_syscall_handler(&mut self, sysno: usize, handler: SyscallHandler) {
        if sysno < SYSCALLS_MAX {
            self.syscall_handlers[sysno] = handler;
        }
    }

    /// Dispatch the system call selected by register a7.
    pub fn system_call_current(&mut self) -> Result<(), Error> {
        let sysno = self.reg(REG_ECALL) as usize;
        self.system_call(sysno)
    }

    pub fn system_call(&mut self, sysno: usize) -> Result<(), Error> {
        let handler = self
            .syscall_handlers
            .get(sysno)
            .copied()
            .unwrap_or(default_syscall);
        handler(self)
    }

    /// CSR and other funct3 != 0 SYSTEM instructions.
    pub fn system(&mut self, _instr: Instr) -> Result<(), Error> {
        Err(Error::IllegalOpcode(self.cpu.pc))
    }

    pub fn segments(&self) -> &SegmentList {
        &self.segments
    }

    /// Evict execute segments from the tail of the list.
    pub fn evict_execute_segments(&mut self, remaining: usize) {
        self.segments.evict(remaining);
    }

    pub fn current_segment(&self) -> Option<&Arc<ExecuteSegment>> {
        self.current_segment.as_ref()
    }

    /// Context snapshot handed to the translation pipeline.
    pub fn translate_context(&mut self) -> bintr::types::TranslateContext {
        bintr::types::TranslateContext {
            options: self.options.clone(),
            arena_kind: self.arena.kind(),
            arena_size: self.arena.size(),
            rodata_end: self.arena.rodata_end(),
            arena_ptr: self.arena.base_ptr() as u64,
            start_address: self.start_address,
            offsets: CpuOffsets::current(),
        }
    }

    /// Realize a new execute segment for `data` at `vaddr`.
    ///
    /// Runs the whole pipeline: translation loading (embedded table, cached
    /// shared object, or a fresh compile), pre-decoding, and fast-sim
    /// realization. With a background executor configured, the compile and
    /// live-patch activation run after the segment is published.
    pub fn create_execute_segment(
        &mut self,
        vaddr: u64,
        data: &[u8],
    ) -> Result<Arc<ExecuteSegment>, Error> {
        let mut seg = ExecuteSegment::new(vaddr, data, &self.options)?;
        let ctx = self.translate_context();
        let table = self.callback_table();

        // Translation first: a synchronously activated translation marks its
        // decoder entries before the pre-decoder fills the rest.
        let deferred = bintr::translate::load_and_translate(&ctx, &mut seg, table)?;

        predecode::generate_decoder(&mut seg, &self.options)?;
        predecode::realize_fastsim(&mut seg, &self.options);

        let seg = self.segments.insert(Arc::new(seg));
        if let Some(job) = deferred {
            bintr::translate::schedule_compile(&ctx, seg.clone(), job, table);
        }
        Ok(seg)
    }

    /// Fast-sim dispatch: run up to `max_instructions` guest instructions.
    ///
    /// Straight-line runs execute `instruction_count()` handlers without
    /// per-step block checks; translated entries dispatch into host code;
    /// `BC_LIVEPATCH` swaps to the patched decoder and re-enters.
    pub fn simulate(&mut self, max_instructions: u64) -> Result<(), Error> {
        self.cpu.max_counter = self.cpu.counter.saturating_add(max_instructions);
        self.stopped = false;

        while !self.stopped && self.cpu.counter < self.cpu.max_counter {
            let seg = match self.segments.find(self.cpu.pc) {
                Some(seg) => seg.clone(),
                None => {
                    // Leaving every execute segment terminates execution.
                    self.stopped = true;
                    break;
                }
            };
            self.current_segment = Some(seg.clone());
            self.run_in_segment(&seg)?;
        }
        Ok(())
    }

    fn run_in_segment(&mut self, seg: &Arc<ExecuteSegment>) -> Result<(), Error> {
        let mut decoder: &DecoderTable = seg.decoder();
        while !self.stopped && self.cpu.counter < self.cpu.max_counter {
            let pc = self.cpu.pc;
            if !seg.is_within(pc) {
                return Ok(());
            }
            let entry = decoder.entry_at(pc);
            match entry.bytecode() {
                bytecodes::BC_LIVEPATCH => {
                    // The patched table was published before the flip became
                    // visible; reload the decoder and re-enter.
                    decoder = seg.decoder();
                    debug_assert!(seg.patched_decoder().is_some());
                    continue;
                }
                bytecodes::BC_BLOCK_END => {
                    let mapping = entry.raw_instr;
                    let func = seg
                        .mapping(mapping)
                        .ok_or(Error::InvalidProgram("translation mapping is missing"))?;
                    let rv: ReturnValues = unsafe {
                        func(&mut self.cpu, self.cpu.counter, self.cpu.max_counter, pc)
                    };
                    self.cpu.counter = rv.counter;
                    self.cpu.max_counter = rv.max_counter;
                    self.raise_pending_exception()?;
                    continue;
                }
                _ => {
                    let count = entry.instruction_count().max(1);
                    self.run_straight_line(seg, decoder, count)?;
                }
            }
        }
        Ok(())
    }

    /// Execute `count` instructions with no per-step block-boundary checks.
    /// Only the last instruction of the run may change control flow.
    fn run_straight_line(
        &mut self,
        seg: &Arc<ExecuteSegment>,
        decoder: &DecoderTable,
        count: u64,
    ) -> Result<(), Error> {
        for _ in 0..count {
            let pc = self.cpu.pc;
            let entry = decoder.entry_at(pc);
            let (index, raw, len) = (entry.handler, entry.raw_instr, entry.opcode_length as u64);
            if index == 0 {
                return Err(Error::IllegalOpcode(pc));
            }
            let handler = seg.handlers().get(index);
            let flow = handler(self, Instr(raw))?;
            self.cpu.counter += 1;
            if self.stopped || flow == decode::Flow::Jump {
                return Ok(());
            }
            self.cpu.pc = pc + len.max(2);
            if self.cpu.counter >= self.cpu.max_counter {
                return Ok(());
            }
        }
        Ok(())
    }

    fn raise_pending_exception(&mut self) -> Result<(), Error> {
        if self.cpu.current_exception >= 0 {
            let kind = ExceptionKind::from_code(self.cpu.current_exception);
            self.cpu.current_exception = -1;
            self.stopped = true;
            return Err(match kind {
                ExceptionKind::MisalignedInstruction => {
                    Error::MisalignedInstruction(self.cpu.pc)
                }
                ExceptionKind::IllegalOpcode => Error::IllegalOpcode(self.cpu.pc),
                other => other.into(),
            });
        }
        Ok(())
    }

    /// The callback table handed to translated code through `init`.
    pub fn callback_table(&mut self) -> CallbackTable {
        CallbackTable {
            mem_ld: cb_mem_ld,
            mem_st: cb_mem_st,
            vec_load: cb_vec_load,
            vec_store: cb_vec_store,
            syscalls: std::ptr::null(),
            system_call: cb_system_call,
            system: cb_system,
            execute: cb_execute,
            execute_handler: cb_execute_handler,
            handlers: std::ptr::null(),
            trigger_exception: cb_trigger_exception,
            trace: cb_trace,
            sqrtf32: cb_sqrtf32,
            sqrtf64: cb_sqrtf64,
            clz: cb_clz,
            clzl: cb_clzl,
            ctz: cb_ctz,
            ctzl: cb_ctzl,
            cpop: cb_cpop,
            cpopl: cb_cpopl,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Callback implementations
//
// Every callback is a plain function so the table can be built on any
// thread. Failures are captured into the CPU record, never unwound.
// ═══════════════════════════════════════════════════════════════════════════

unsafe fn machine_of<'a>(cpu: *mut Cpu) -> &'a mut Machine {
    &mut *(*cpu).machine
}

fn capture(m: &mut Machine, err: &Error) {
    m.cpu.current_exception = match err {
        Error::IllegalOpcode(_) => ExceptionKind::IllegalOpcode as i32,
        Error::IllegalOperation(_) => ExceptionKind::IllegalOperation as i32,
        Error::MisalignedInstruction(_) => ExceptionKind::MisalignedInstruction as i32,
        Error::MaxInstructionsReached(_) => ExceptionKind::MaxInstructionsReached as i32,
        _ => ExceptionKind::InvalidProgram as i32,
    };
    m.stop();
}

pub(crate) unsafe extern "C" fn cb_mem_ld(cpu: *mut Cpu, addr: u64, size: u32) -> u64 {
    let m = machine_of(cpu);
    if !matches!(size, 1 | 2 | 4 | 8) {
        capture(m, &Error::IllegalOperation("invalid memory read size"));
        return 0;
    }
    match m.mem_read(addr, size as u64) {
        Ok(v) => v,
        Err(err) => {
            capture(m, &err);
            0
        }
    }
}

pub(crate) unsafe extern "C" fn cb_mem_st(cpu: *mut Cpu, addr: u64, value: u64, size: u32) {
    let m = machine_of(cpu);
    if !matches!(size, 1 | 2 | 4 | 8) {
        capture(m, &Error::IllegalOperation("invalid memory write size"));
        return;
    }
    if let Err(err) = m.mem_write(addr, value, size as u64) {
        capture(m, &err);
    }
}

pub(crate) unsafe extern "C" fn cb_vec_load(cpu: *mut Cpu, vd: i32, addr: u64) {
    let m = machine_of(cpu);
    for i in 0..4usize {
        match m.mem_read(addr + 4 * i as u64, 4) {
            Ok(v) => m.cpu.rvv[vd as usize][i] = v as u32,
            Err(err) => {
                capture(m, &err);
                return;
            }
        }
    }
}

pub(crate) unsafe extern "C" fn cb_vec_store(cpu: *mut Cpu, addr: u64, vd: i32) {
    let m = machine_of(cpu);
    for i in 0..4usize {
        let v = m.cpu.rvv[vd as usize][i] as u64;
        if let Err(err) = m.mem_write(addr + 4 * i as u64, v, 4) {
            capture(m, &err);
            return;
        }
    }
}

/// Returns nonzero when the PC changed or the machine stopped.
pub(crate) unsafe extern "C" fn cb_system_call(cpu: *mut Cpu, sysno: i32) -> i32 {
    let m = machine_of(cpu);
    let pc_before = m.cpu.pc;
    match m.system_call(sysno as usize) {
        Ok(()) => (m.cpu.pc != pc_before || m.stopped()) as i32,
        Err(err) => {
            capture(m, &err);
            1
        }
    }
}

pub(crate) unsafe extern "C" fn cb_system(cpu: *mut Cpu, instr: u32) {
    let m = machine_of(cpu);
    if let Err(err) = m.system(Instr(instr)) {
        capture(m, &err);
    }
}

/// Decode and execute an instruction the translator could not lower,
/// returning its interned handler index for future reuse.
pub(crate) unsafe extern "C" fn cb_execute(cpu: *mut Cpu, instr: u32) -> u32 {
    let m = machine_of(cpu);
    let word = Instr(instr);
    let handler = decode::resolve(word);
    if let Err(err) = handler(m, word) {
        capture(m, &err);
        return 0;
    }
    m.current_segment
        .as_ref()
        .and_then(|seg| seg.handlers().index_of(handler))
        .unwrap_or(0) as u32
}

/// Run a previously interned handler; returns nonzero on exception.
pub(crate) unsafe extern "C" fn cb_execute_handler(cpu: *mut Cpu, index: u32, instr: u32) -> u32 {
    let m = machine_of(cpu);
    let Some(seg) = m.current_segment.clone() else {
        capture(m, &Error::InvalidProgram("no active execute segment"));
        return 1;
    };
    let handler = seg.handlers().get(index as u8);
    match handler(m, Instr(instr)) {
        Ok(_) => 0,
        Err(err) => {
            capture(m, &err);
            1
        }
    }
}

pub(crate) unsafe extern "C" fn cb_trigger_exception(cpu: *mut Cpu, pc: u64, kind: i32) {
    let m = machine_of(cpu);
    m.cpu.pc = pc;
    m.cpu.current_exception = kind;
    m.stop();
}

pub(crate) unsafe extern "C" fn cb_trace(cpu: *mut Cpu, name: *const c_char, pc: u64, instr: u32) {
    let _ = cpu;
    let func = if name.is_null() {
        "?"
    } else {
        CStr::from_ptr(name).to_str().unwrap_or("?")
    };
    tracing::trace!(target: "bintr", func, pc = format_args!("{pc:#x}"), instr = format_args!("{instr:08x}"));
}

pub(crate) unsafe extern "C" fn cb_sqrtf32(v: f32) -> f32 {
    v.sqrt()
}

pub(crate) unsafe extern "C" fn cb_sqrtf64(v: f64) -> f64 {
    v.sqrt()
}

pub(crate) unsafe extern "C" fn cb_clz(v: u32) -> i32 {
    v.leading_zeros() as i32
}

pub(crate) unsafe extern "C" fn cb_clzl(v: u64) -> i32 {
    v.leading_zeros() as i32
}

pub(crate) unsafe extern "C" fn cb_ctz(v: u32) -> i32 {
    v.trailing_zeros() as i32
}

pub(crate) unsafe extern "C" fn cb_ctzl(v: u64) -> i32 {
    v.trailing_zeros() as i32
}

pub(crate) unsafe extern "C" fn cb_cpop(v: u32) -> i32 {
    v.count_ones() as i32
}

pub(crate) unsafe extern "C" fn cb_cpopl(v: u64) -> i32 {
    v.count_ones() as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::enc;

    fn machine() -> Box<Machine> {
        let options = TranslatorOptions {
            translate_enabled: false,
            translate_enable_embedded: false,
            ..Default::default()
        };
        Machine::new(options, Arena::flat(0x10000, 0x2000))
    }

    fn exit_syscall(m: &mut Machine) -> Result<(), Error> {
        m.stop();
        Ok(())
    }

    #[test]
    fn test_minimal_loop_scenario() {
        // ADDI x1, x0, 10; ADDI x1, x1, -1; BNE x1, x0, -4; JALR x0, x0, 0
        let code = enc::to_bytes(&[
            enc::addi(1, 0, 10),
            enc::addi(1, 1, -1),
            enc::bne(1, 0, -4),
            enc::jalr(0, 0, 0),
        ]);
        let mut m = machine();
        let seg = m.create_execute_segment(0x1000, &code).unwrap();

        // The first ADDI heads a straight-line run of two instructions.
        assert_eq!(seg.decoder().entry_at(0x1000).idxend, 1);

        m.cpu.pc = 0x1000;
        m.simulate(1000).unwrap();
        assert!(m.stopped());
        assert_eq!(m.reg(1), 0);
        assert_eq!(m.cpu.pc, 0);
        // 1 li + 10 * (addi, bne) + jalr
        assert_eq!(m.cpu.counter, 22);
    }

    #[test]
    fn test_forward_branch_scenario() {
        // BEQ x0, x0, +8; ADDI x2, x0, 1; ADDI x3, x0, 2; JALR x0, x0, 0
        let code = enc::to_bytes(&[
            enc::beq(0, 0, 8),
            enc::addi(2, 0, 1),
            enc::addi(3, 0, 2),
            enc::jalr(0, 0, 0),
        ]);
        let mut m = machine();
        m.create_execute_segment(0x1000, &code).unwrap();
        m.cpu.pc = 0x1000;
        m.simulate(100).unwrap();
        assert_eq!(m.reg(2), 0);
        assert_eq!(m.reg(3), 2);
    }

    #[test]
    fn test_misaligned_branch_raises() {
        // BEQ x0, x0, +6 is misaligned without compressed decoding.
        let code = enc::to_bytes(&[enc::beq(0, 0, 6), enc::jalr(0, 0, 0)]);
        let mut m = machine();
        m.create_execute_segment(0x1000, &code).unwrap();
        m.cpu.pc = 0x1000;
        let err = m.simulate(10).unwrap_err();
        assert!(matches!(err, Error::MisalignedInstruction(_)));
    }

    #[test]
    fn test_instruction_budget_pauses_execution() {
        // An infinite loop: JAL x0, 0 jumps to itself.
        let code = enc::to_bytes(&[enc::jal(0, 0)]);
        let mut m = machine();
        m.create_execute_segment(0x1000, &code).unwrap();
        m.cpu.pc = 0x1000;
        m.simulate(50).unwrap();
        assert!(!m.stopped());
        assert_eq!(m.cpu.counter, 50);
        assert_eq!(m.cpu.pc, 0x1000);
        // Execution resumes where it paused.
        m.simulate(25).unwrap();
        assert_eq!(m.cpu.counter, 75);
    }

    #[test]
    fn test_ecall_dispatches_syscall_handler() {
        // ADDI x17, x0, 93; ECALL; (unreachable) ADDI x1, x0, 7
        let code = enc::to_bytes(&[enc::addi(17, 0, 93), 0x0000_0073, enc::addi(1, 0, 7)]);
        let mut m = machine();
        m.set_syscall_handler(93, exit_syscall);
        m.create_execute_segment(0x1000, &code).unwrap();
        m.cpu.pc = 0x1000;
        m.simulate(10).unwrap();
        assert!(m.stopped());
        assert_eq!(m.reg(1), 0);
    }

    #[test]
    fn test_wfi_stops_at_next_pc() {
        let code = enc::to_bytes(&[crate::instr::INSTR_WFI, enc::addi(1, 0, 7)]);
        let mut m = machine();
        m.create_execute_segment(0x1000, &code).unwrap();
        m.cpu.pc = 0x1000;
        m.simulate(10).unwrap();
        assert!(m.stopped());
        assert_eq!(m.cpu.pc, 0x1004);
    }

    #[test]
    fn test_straight_line_property() {
        // For every decoded slot, running `idxend + 1` slots never crosses a
        // stopping instruction.
        let code = enc::to_bytes(&[
            enc::addi(1, 0, 1),
            enc::addi(2, 0, 2),
            enc::addi(3, 0, 3),
            enc::beq(0, 0, 8),
            enc::addi(4, 0, 4),
            enc::jalr(0, 0, 0),
        ]);
        let mut m = machine();
        let seg = m.create_execute_segment(0x1000, &code).unwrap();
        let stoppers = [0x100Cu64, 0x1014];
        for pc in (0x1000u64..0x1018).step_by(4) {
            let entry = seg.decoder().entry_at(pc);
            let run = entry.idxend as u64;
            // The first slot of a run may itself be the stopper (its own
            // single-slot block); the slots after it never are.
            for step in 1..=run {
                let covered = pc + step * 4;
                assert!(
                    !stoppers.contains(&covered),
                    "run from {pc:#x} crosses stopper {covered:#x}"
                );
            }
        }
        // The spec's worked example: three ADDIs head a run of length 3.
        assert_eq!(seg.decoder().entry_at(0x1000).idxend, 2);
        assert_eq!(seg.decoder().entry_at(0x1008).idxend, 0);
    }

    #[test]
    fn test_cpu_offsets_are_stable_contract() {
        let off = CpuOffsets::current();
        assert_eq!(off.pc, 0);
        assert_eq!(off.regs, 8);
        assert_eq!(off.fregs, 8 + 32 * 8);
        assert_eq!(off.counter, off.fregs + 32 * 8);
        assert_eq!(off.max_counter, off.counter + 8);
        assert_eq!(off.arena, off.max_counter + 8);
        assert_eq!(off.exception, off.arena + 8);
    }

    #[test]
    fn test_mem_callbacks_capture_invalid_size() {
        let mut m = machine();
        let cpu_ptr = &mut m.cpu as *mut Cpu;
        let v = unsafe { cb_mem_ld(cpu_ptr, 0x100, 3) };
        assert_eq!(v, 0);
        assert_eq!(
            m.cpu.current_exception,
            ExceptionKind::IllegalOperation as i32
        );
        assert!(m.stopped());
    }

    #[test]
    fn test_arena_encompassing_masks_addresses() {
        let arena = Arena::encompassing(16);
        // Address bits above the window are masked off.
        assert_eq!(arena.read(0xFFFF_0004, 4).unwrap(), 0);
        assert!(matches!(arena.kind(), ArenaKind::Encompassing { bits: 16 }));
    }
}
