//! Shared types of the translation pipeline and the dylib ABI.
//!
//! Everything `#[repr(C)]` here is a versioned contract with the C preamble:
//! the emitted code and the loader must agree on `ReturnValues`, `Mapping`
//! and the callback table layout. The preamble carries `_Static_assert`s of
//! the CPU field offsets fed in as defines.

use std::collections::HashSet;
use std::ffi::{c_char, c_void};
use std::sync::Arc;

use crate::config::TranslatorOptions;
use crate::machine::{ArenaKind, Cpu, CpuOffsets};

/// Counter pair returned by every translated block function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ReturnValues {
    pub counter: u64,
    pub max_counter: u64,
}

/// Signature of a translated block function.
pub type BintrFunc = unsafe extern "C" fn(*mut Cpu, u64, u64, u64) -> ReturnValues;

/// One `(addr, unique_handler_index)` record in the dylib's manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Mapping {
    pub addr: u64,
    pub mapping_index: u32,
}

/// A guest-PC-to-host-symbol pair produced by the emitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransMapping {
    pub addr: u64,
    pub symbol: String,
}

/// Callback table into the interpreter, stored by the dylib's `init`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CallbackTable {
    pub mem_ld: unsafe extern "C" fn(*mut Cpu, u64, u32) -> u64,
    pub mem_st: unsafe extern "C" fn(*mut Cpu, u64, u64, u32),
    pub vec_load: unsafe extern "C" fn(*mut Cpu, i32, u64),
    pub vec_store: unsafe extern "C" fn(*mut Cpu, u64, i32),
    /// Raw pointer to the syscall handler table; unused by emitted code,
    /// which routes through `system_call`.
    pub syscalls: *const c_void,
    pub system_call: unsafe extern "C" fn(*mut Cpu, i32) -> i32,
    pub system: unsafe extern "C" fn(*mut Cpu, u32),
    pub execute: unsafe extern "C" fn(*mut Cpu, u32) -> u32,
    pub execute_handler: unsafe extern "C" fn(*mut Cpu, u32, u32) -> u32,
    /// Raw pointer to the interpreter handler table; reserved.
    pub handlers: *const c_void,
    pub trigger_exception: unsafe extern "C" fn(*mut Cpu, u64, i32),
    pub trace: unsafe extern "C" fn(*mut Cpu, *const c_char, u64, u32),
    pub sqrtf32: unsafe extern "C" fn(f32) -> f32,
    pub sqrtf64: unsafe extern "C" fn(f64) -> f64,
    pub clz: unsafe extern "C" fn(u32) -> i32,
    pub clzl: unsafe extern "C" fn(u64) -> i32,
    pub ctz: unsafe extern "C" fn(u32) -> i32,
    pub ctzl: unsafe extern "C" fn(u64) -> i32,
    pub cpop: unsafe extern "C" fn(u32) -> i32,
    pub cpopl: unsafe extern "C" fn(u64) -> i32,
}

// The embedded raw pointers are always null; the function pointers are
// free functions, so the table may cross threads with the compile step.
unsafe impl Send for CallbackTable {}
unsafe impl Sync for CallbackTable {}

/// Snapshot of the machine state the pipeline needs; owning no references,
/// it can travel with a background compile job.
#[derive(Clone)]
pub struct TranslateContext {
    pub options: TranslatorOptions,
    pub arena_kind: ArenaKind,
    pub arena_size: u64,
    pub rodata_end: u64,
    pub arena_ptr: u64,
    pub start_address: u64,
    pub offsets: CpuOffsets,
}

impl TranslateContext {
    /// The memory-lowering strategy the emitter may use.
    pub fn effective_arena(&self) -> ArenaKind {
        if self.options.translation_use_arena {
            self.arena_kind
        } else {
            ArenaKind::None
        }
    }
}

/// Input to the emitter: one translation unit.
pub struct TransInfo {
    /// Raw instruction sequence of the block.
    pub instructions: Vec<crate::instr::Instr>,
    pub basepc: u64,
    pub endpc: u64,
    pub segment_basepc: u64,
    pub segment_endpc: u64,
    /// Recovered global pointer, 0 if none.
    pub gp: u64,
    pub trace_instructions: bool,
    pub ignore_instruction_limit: bool,
    pub use_shared_execute_segments: bool,
    /// Branch and jump targets inside this block.
    pub jump_locations: HashSet<u64>,
    /// `(basepc, endpc)` of every discovered block in the segment.
    pub blocks: Vec<(u64, u64)>,
    /// Every JAL target anywhere in the segment, plus the program entry.
    pub global_jump_locations: Arc<HashSet<u64>>,
    /// Host address of the arena base, for in-process absolute lowering.
    pub arena_ptr: u64,
}

impl TransInfo {
    pub fn block_exists(&self, pc: u64) -> bool {
        self.blocks.iter().any(|&(base, _)| base == pc)
    }

    /// Base PC of the discovered block containing `pc`, or 0.
    pub fn find_block_base(&self, pc: u64) -> u64 {
        self.blocks
            .iter()
            .find(|&&(base, end)| pc >= base && pc < end)
            .map(|&(base, _)| base)
            .unwrap_or(0)
    }

    pub fn within_segment(&self, addr: u64) -> bool {
        addr >= self.segment_basepc && addr < self.segment_endpc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_values_layout() {
        assert_eq!(std::mem::size_of::<ReturnValues>(), 16);
        assert_eq!(std::mem::size_of::<Mapping>(), 16);
        assert_eq!(std::mem::align_of::<Mapping>(), 8);
    }

    #[test]
    fn test_find_block_base() {
        let info = TransInfo {
            instructions: Vec::new(),
            basepc: 0x1000,
            endpc: 0x2000,
            segment_basepc: 0x1000,
            segment_endpc: 0x4000,
            gp: 0,
            trace_instructions: false,
            ignore_instruction_limit: false,
            use_shared_execute_segments: false,
            jump_locations: HashSet::new(),
            blocks: vec![(0x1000, 0x2000), (0x2000, 0x3000)],
            global_jump_locations: Arc::new(HashSet::new()),
            arena_ptr: 0,
        };
        assert!(info.block_exists(0x2000));
        assert!(!info.block_exists(0x2800));
        assert_eq!(info.find_block_base(0x2800), 0x2000);
        assert_eq!(info.find_block_base(0x3800), 0);
        assert!(info.within_segment(0x3800));
        assert!(!info.within_segment(0x4000));
    }
}
