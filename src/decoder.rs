//! Decoder cache: one fixed-stride entry per addressable instruction slot.
//!
//! The table covers a whole execute segment. Dividing a guest PC by the
//! stride and subtracting the rebased page base yields the slot index, so the
//! interpreter dispatches with one load. Entries cache the (possibly
//! rewritten) instruction word, an index into the per-segment handler table,
//! a threaded-dispatch bytecode, and the fast-sim block-length metadata.
//!
//! The bytecode field is an atomic cell: live-patching flips it from another
//! thread while the interpreter runs, and that is the only concurrent write
//! the table permits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::decode::InstrHandler;
use crate::error::Error;

/// Host page granularity of the table allocation.
pub const PAGE_SIZE: u64 = 4096;

/// Sentinel stored in `raw_instr` for entries replaced by a translated
/// block's first instruction. Reserved: as a 16-bit word it would carry the
/// `11` length prefix of a 32-bit instruction, so it can never be a valid
/// compressed entry start.
pub const FASTSIM_BLOCK_END: u32 = 0xFFFF;

/// Bytecodes understood by the dispatch loop.
pub mod bytecodes {
    /// Ordinary entry: dispatch through the handler table.
    pub const BC_NORMAL: u8 = 0;
    /// Translated entry: `raw_instr` holds a mapping index.
    pub const BC_BLOCK_END: u8 = 1;
    /// Live-patched entry: swap to the patched decoder and re-enter.
    pub const BC_LIVEPATCH: u8 = 2;
}

/// One decoder slot.
#[derive(Debug, Default)]
pub struct DecoderEntry {
    /// Cached instruction word, a mapping index once translated, or
    /// [`FASTSIM_BLOCK_END`].
    pub raw_instr: u32,
    /// Index into the segment handler table; 0 means unset.
    pub handler: u8,
    /// Distance to the end of the straight-line run, in stride units.
    pub idxend: u8,
    /// Packing helper for compressed mode; see [`DecoderEntry::instruction_count`].
    pub icount: u8,
    /// Byte length of the instruction at this slot (2 or 4).
    pub opcode_length: u8,
    bytecode: AtomicU8,
}

impl DecoderEntry {
    #[inline]
    pub fn is_set(&self) -> bool {
        self.handler != 0
    }

    #[inline]
    pub fn bytecode(&self) -> u8 {
        self.bytecode.load(Ordering::Acquire)
    }

    /// Plain store for single-threaded construction and activation.
    #[inline]
    pub fn set_bytecode(&mut self, bc: u8) {
        *self.bytecode.get_mut() = bc;
    }

    /// Release-ordered store; used by the live-patch flip, which must happen
    /// after the patched table has been published.
    #[inline]
    pub fn set_bytecode_atomic(&self, bc: u8) {
        self.bytecode.store(bc, Ordering::Release);
    }

    /// Bytes from this slot to the end of its straight-line run.
    #[inline]
    pub fn block_bytes(&self, stride: u64) -> u64 {
        self.idxend as u64 * stride
    }

    /// Guest instructions remaining in the run starting at this slot.
    ///
    /// Without compressed decoding `icount` is zero and this is `idxend + 1`.
    /// With compressed decoding the halfword count and the instruction count
    /// differ, and `icount` packs the difference.
    #[inline]
    pub fn instruction_count(&self) -> u64 {
        (self.idxend as u64 + 1).saturating_sub(self.icount as u64)
    }
}

impl Clone for DecoderEntry {
    fn clone(&self) -> Self {
        Self {
            raw_instr: self.raw_instr,
            handler: self.handler,
            idxend: self.idxend,
            icount: self.icount,
            opcode_length: self.opcode_length,
            bytecode: AtomicU8::new(self.bytecode.load(Ordering::Acquire)),
        }
    }
}

/// The full decoder table for one execute segment.
///
/// Conceptually `ceil(plen / page_size)` page-sized arrays concatenated. The
/// owning allocation lives here; lookups go through [`DecoderTable::entry_at`]
/// instead of a rebased raw pointer.
#[derive(Clone, Debug)]
pub struct DecoderTable {
    entries: Vec<DecoderEntry>,
    pagedata_base: u64,
    stride: u64,
}

impl DecoderTable {
    /// Allocate a zero-initialized table covering `plen` bytes starting at
    /// the page-aligned `pagedata_base`.
    pub fn new(pagedata_base: u64, plen: u64, stride: u64) -> Result<Self, Error> {
        debug_assert!(plen % PAGE_SIZE == 0);
        let n_pages = plen / PAGE_SIZE;
        if n_pages == 0 {
            return Err(Error::InvalidProgram(
                "program produced an empty decoder cache",
            ));
        }
        let slots = (n_pages * PAGE_SIZE / stride) as usize;
        let mut entries = Vec::with_capacity(slots);
        entries.resize_with(slots, DecoderEntry::default);
        Ok(Self {
            entries,
            pagedata_base,
            stride,
        })
    }

    #[inline]
    pub fn stride(&self) -> u64 {
        self.stride
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    fn index_of(&self, pc: u64) -> usize {
        debug_assert!(pc >= self.pagedata_base);
        ((pc - self.pagedata_base) / self.stride) as usize
    }

    #[inline]
    pub fn entry_at(&self, pc: u64) -> &DecoderEntry {
        &self.entries[self.index_of(pc)]
    }

    #[inline]
    pub fn entry_mut(&mut self, pc: u64) -> &mut DecoderEntry {
        let idx = self.index_of(pc);
        &mut self.entries[idx]
    }

    /// PC of the slot `n` strides before `pc`; used by the live-patch
    /// backward walk.
    #[inline]
    pub fn pc_back(&self, pc: u64, n: u64) -> u64 {
        pc - n * self.stride
    }
}

/// Per-segment interning table mapping handler functions to small indices.
///
/// Slot 0 always holds the illegal/unset sentinel, so a zeroed decoder entry
/// dispatches to it. The table holds at most 255 further handlers; running
/// out fails the segment load.
#[derive(Debug)]
pub struct HandlerTable {
    handlers: Vec<InstrHandler>,
    indices: HashMap<usize, u8>,
}

impl HandlerTable {
    pub fn new(illegal: InstrHandler) -> Self {
        Self {
            handlers: vec![illegal],
            indices: HashMap::new(),
        }
    }

    /// Intern a handler, returning its stable index.
    pub fn intern(&mut self, handler: InstrHandler) -> Result<u8, Error> {
        let key = handler as usize;
        if let Some(&idx) = self.indices.get(&key) {
            return Ok(idx);
        }
        if self.handlers.len() >= u8::MAX as usize + 1 {
            return Err(Error::MaxInstructionsReached(self.handlers.len()));
        }
        let idx = self.handlers.len() as u8;
        self.handlers.push(handler);
        self.indices.insert(key, idx);
        Ok(idx)
    }

    #[inline]
    pub fn get(&self, index: u8) -> InstrHandler {
        self.handlers[index as usize]
    }

    /// Index of a previously interned handler, if any.
    pub fn index_of(&self, handler: InstrHandler) -> Option<u8> {
        self.indices.get(&(handler as usize)).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{self, Flow};
    use crate::instr::Instr;
    use crate::machine::Machine;

    fn h1(_m: &mut Machine, _i: Instr) -> Result<Flow, Error> {
        Ok(Flow::Next)
    }
    fn h2(_m: &mut Machine, _i: Instr) -> Result<Flow, Error> {
        Ok(Flow::Next)
    }

    #[test]
    fn test_interning_assigns_stable_indices() {
        let mut table = HandlerTable::new(decode::handle_illegal);
        let a = table.intern(h1).unwrap();
        let b = table.intern(h2).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        // Re-interning returns the same index.
        assert_eq!(table.intern(h1).unwrap(), 1);
        assert_eq!(table.index_of(h2), Some(2));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_interning_overflow() {
        let mut table = HandlerTable::new(decode::handle_illegal);
        // Fake distinct pointers by exhausting the index map with real
        // handlers is impractical; instead fill the vector directly.
        while table.handlers.len() < 256 {
            table.handlers.push(h1);
        }
        let err = table.intern(h2).unwrap_err();
        assert!(matches!(err, Error::MaxInstructionsReached(256)));
    }

    #[test]
    fn test_table_lookup_is_rebased() {
        let table = DecoderTable::new(0x1000, 0x2000, 4).unwrap();
        assert_eq!(table.len(), 0x2000 / 4);
        let entry = table.entry_at(0x1000);
        assert!(!entry.is_set());
        assert_eq!(entry.bytecode(), bytecodes::BC_NORMAL);
    }

    #[test]
    fn test_empty_table_rejected() {
        let err = DecoderTable::new(0x1000, 0, 4).unwrap_err();
        assert!(matches!(err, Error::InvalidProgram(_)));
    }

    #[test]
    fn test_instruction_count_packing() {
        let mut entry = DecoderEntry::default();
        entry.idxend = 5;
        assert_eq!(entry.instruction_count(), 6);
        // Compressed packing: 6 halfwords remaining, 3 instructions.
        entry.icount = 3;
        assert_eq!(entry.instruction_count(), 3);
        assert_eq!(entry.block_bytes(2), 10);
        assert_eq!(entry.block_bytes(4), 20);
    }

    #[test]
    fn test_clone_preserves_bytecode() {
        let mut entry = DecoderEntry::default();
        entry.set_bytecode(bytecodes::BC_BLOCK_END);
        entry.raw_instr = 7;
        let copy = entry.clone();
        assert_eq!(copy.bytecode(), bytecodes::BC_BLOCK_END);
        assert_eq!(copy.raw_instr, 7);
    }
}
