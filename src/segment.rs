//! Execute segments: immutable instruction ranges plus derived decoder state.
//!
//! A segment owns the padded instruction bytes, the decoder table, the
//! per-segment handler table, the segment hash, and — once translated — the
//! mapping functions and the backing code object. Segments are immutable
//! after realization; modified code creates a new segment.
//!
//! Translation state is published through `OnceLock`s so a background
//! activation can attach it while the interpreter is running: the patched
//! decoder table must be fully constructed and published before any bytecode
//! is flipped to `BC_LIVEPATCH`.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use crate::bintr::types::BintrFunc;
use crate::config::TranslatorOptions;
use crate::decoder::{DecoderTable, HandlerTable, PAGE_SIZE};
use crate::error::Error;
use crate::decode;
use crate::instr::Instr;

/// A translation attached to a segment.
pub struct Translation {
    /// Unique block functions, plus one trailing guard slot.
    pub mappings: Vec<BintrFunc>,
    /// Keeps the code object (shared library or in-process module) alive for
    /// as long as the segment; dropped exactly once with the segment.
    pub keepalive: Option<Arc<dyn Any + Send + Sync>>,
    /// Built by the in-process backend: exceptions cannot unwind through it
    /// and are captured into the CPU record instead.
    pub in_process: bool,
}

impl std::fmt::Debug for Translation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translation")
            .field("mappings", &self.mappings)
            .field("keepalive", &self.keepalive.is_some())
            .field("in_process", &self.in_process)
            .finish()
    }
}

/// A contiguous guest range of instruction bytes with its decoder cache.
#[derive(Debug)]
pub struct ExecuteSegment {
    pagedata_base: u64,
    plen: u64,
    exec_begin: u64,
    exec_end: u64,
    exec_data: Vec<u8>,
    crc: u32,
    translation_hash: u32,
    decoder: DecoderTable,
    handlers: HandlerTable,
    translation: OnceLock<Translation>,
    patched: OnceLock<DecoderTable>,
}

impl ExecuteSegment {
    /// Build a segment for `data` loaded at virtual address `vaddr`.
    ///
    /// The instruction bytes land in the middle of a page-aligned buffer with
    /// zeroed edges, so unaligned 4-byte reads near the boundaries stay in
    /// bounds. The decoder table is allocated zeroed; the pre-decoder fills
    /// it afterwards.
    pub fn new(vaddr: u64, data: &[u8], options: &TranslatorOptions) -> Result<Self, Error> {
        if data.is_empty() {
            return Err(Error::InvalidProgram("empty execute segment"));
        }
        let pmask = PAGE_SIZE - 1;
        let pbase = vaddr & !pmask;
        let prelen = vaddr - pbase;
        let exlen = data.len() as u64;
        let midlen = exlen + prelen;
        let plen = (midlen + pmask) & !pmask;
        let postlen = plen - midlen;
        if prelen > plen || prelen + exlen > plen {
            return Err(Error::InvalidProgram("segment virtual base was bogus"));
        }
        if pbase.checked_add(plen).is_none() {
            return Err(Error::InvalidProgram("segment virtual base was bogus"));
        }

        let mut exec_data = Vec::with_capacity(plen as usize);
        exec_data.resize(prelen as usize, 0);
        exec_data.extend_from_slice(data);
        exec_data.resize(exec_data.len() + postlen as usize, 0);

        let stride = options.stride();
        Ok(Self {
            pagedata_base: pbase,
            plen,
            exec_begin: vaddr,
            exec_end: vaddr + exlen,
            crc: crc32c::crc32c(data),
            translation_hash: 0,
            decoder: DecoderTable::new(pbase, plen, stride)?,
            handlers: HandlerTable::new(decode::handle_illegal),
            exec_data,
            translation: OnceLock::new(),
            patched: OnceLock::new(),
        })
    }

    #[inline]
    pub fn pagedata_base(&self) -> u64 {
        self.pagedata_base
    }

    #[inline]
    pub fn padded_len(&self) -> u64 {
        self.plen
    }

    #[inline]
    pub fn exec_begin(&self) -> u64 {
        self.exec_begin
    }

    #[inline]
    pub fn exec_end(&self) -> u64 {
        self.exec_end
    }

    #[inline]
    pub fn is_within(&self, addr: u64) -> bool {
        addr >= self.exec_begin && addr < self.exec_end
    }

    /// CRC32-C of the original instruction bytes.
    #[inline]
    pub fn crc32c_hash(&self) -> u32 {
        self.crc
    }

    #[inline]
    pub fn translation_hash(&self) -> u32 {
        self.translation_hash
    }

    pub fn set_translation_hash(&mut self, hash: u32) {
        self.translation_hash = hash;
    }

    /// Read the instruction word at `pc`. Reads 4 bytes (possibly unaligned)
    /// when they fit before `exec_end`, otherwise the trailing 2 bytes, so
    /// the last halfword of a segment still decodes as a compressed
    /// instruction.
    pub fn read_instr(&self, pc: u64) -> Instr {
        let off = (pc - self.pagedata_base) as usize;
        if pc + 4 <= self.exec_end {
            let b = &self.exec_data[off..off + 4];
            Instr(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        } else {
            let b = &self.exec_data[off..off + 2];
            Instr(u16::from_le_bytes([b[0], b[1]]) as u32)
        }
    }

    /// The decoder the dispatch loop should use: the patched copy once a
    /// live-patch has been published, the original otherwise.
    #[inline]
    pub fn decoder(&self) -> &DecoderTable {
        self.patched.get().unwrap_or(&self.decoder)
    }

    /// The original (unpatched) decoder table.
    #[inline]
    pub fn base_decoder(&self) -> &DecoderTable {
        &self.decoder
    }

    pub fn base_decoder_mut(&mut self) -> &mut DecoderTable {
        &mut self.decoder
    }

    /// Publish the patched decoder copy. Must happen before any bytecode is
    /// flipped to `BC_LIVEPATCH`.
    pub fn set_patched_decoder(&self, table: DecoderTable) -> Result<(), Error> {
        self.patched
            .set(table)
            .map_err(|_| Error::IllegalOperation("segment already live-patched"))
    }

    #[inline]
    pub fn patched_decoder(&self) -> Option<&DecoderTable> {
        self.patched.get()
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerTable {
        &mut self.handlers
    }

    #[inline]
    pub fn is_binary_translated(&self) -> bool {
        self.translation.get().is_some()
    }

    pub fn translation(&self) -> Option<&Translation> {
        self.translation.get()
    }

    /// Attach a translation. Fails if one is already attached; activation on
    /// shared segments must check [`ExecuteSegment::is_binary_translated`]
    /// first and re-use the existing code object.
    pub fn set_translation(&self, translation: Translation) -> Result<(), Error> {
        self.translation
            .set(translation)
            .map_err(|_| Error::IllegalOperation("execute segment already binary translated"))
    }

    /// Mapping function for a translated entry's `raw_instr` index.
    #[inline]
    pub fn mapping(&self, index: u32) -> Option<BintrFunc> {
        self.translation
            .get()
            .and_then(|t| t.mappings.get(index as usize))
            .copied()
    }
}

/// Machine-owned, ordered, bounded list of execute segments.
///
/// Lookup is linear; eviction truncates from the tail.
pub struct SegmentList {
    segments: Vec<Arc<ExecuteSegment>>,
    max_segments: usize,
}

impl SegmentList {
    pub fn new(max_segments: usize) -> Self {
        Self {
            segments: Vec::new(),
            max_segments: max_segments.max(1),
        }
    }

    /// Configured bound; enforced by explicit [`SegmentList::evict`] calls.
    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    pub fn insert(&mut self, segment: Arc<ExecuteSegment>) -> Arc<ExecuteSegment> {
        self.segments.push(segment.clone());
        segment
    }

    pub fn find(&self, addr: u64) -> Option<&Arc<ExecuteSegment>> {
        self.segments.iter().find(|seg| seg.is_within(addr))
    }

    /// Truncate the list from the tail down to `remaining` segments.
    pub fn evict(&mut self, remaining: usize) {
        while self.segments.len() > remaining {
            self.segments.pop();
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn first(&self) -> Option<&Arc<ExecuteSegment>> {
        self.segments.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::enc;

    fn options() -> TranslatorOptions {
        TranslatorOptions::default()
    }

    #[test]
    fn test_padding_layout() {
        let words = enc::to_bytes(&[enc::addi(1, 0, 1), enc::addi(2, 0, 2)]);
        let seg = ExecuteSegment::new(0x1100, &words, &options()).unwrap();
        assert_eq!(seg.pagedata_base(), 0x1000);
        assert_eq!(seg.exec_begin(), 0x1100);
        assert_eq!(seg.exec_end(), 0x1108);
        assert_eq!(seg.padded_len(), 0x1000);
        assert!(seg.is_within(0x1100));
        assert!(!seg.is_within(0x1108));
        // Zeroed edges.
        assert_eq!(seg.read_instr(0x1000).0, 0);
    }

    #[test]
    fn test_empty_segment_rejected() {
        let err = ExecuteSegment::new(0x1000, &[], &options()).unwrap_err();
        assert!(matches!(err, Error::InvalidProgram(_)));
    }

    #[test]
    fn test_bogus_base_rejected() {
        let words = enc::to_bytes(&[enc::addi(1, 0, 1)]);
        let err = ExecuteSegment::new(u64::MAX - 8, &words, &options()).unwrap_err();
        assert!(matches!(err, Error::InvalidProgram(_)));
    }

    #[test]
    fn test_trailing_halfword_read() {
        // Two full words then a lone halfword: the final 2 bytes must decode
        // as a 16-bit read.
        let mut bytes = enc::to_bytes(&[enc::addi(1, 0, 1), enc::addi(2, 0, 2)]);
        bytes.extend_from_slice(&0x4501u16.to_le_bytes()); // C.LI x10, 0
        let seg = ExecuteSegment::new(0x1000, &bytes, &options()).unwrap();
        let last = seg.read_instr(0x1008);
        assert_eq!(last.0, 0x4501);
        assert!(last.is_compressed());
        // A full word before the end still reads 32 bits across the boundary
        // of its own slot.
        assert_eq!(seg.read_instr(0x1004).0, enc::addi(2, 0, 2));
    }

    #[test]
    fn test_hash_is_deterministic() {
        let words = enc::to_bytes(&[enc::addi(1, 0, 1), enc::jalr(0, 1, 0)]);
        let a = ExecuteSegment::new(0x1000, &words, &options()).unwrap();
        let b = ExecuteSegment::new(0x1000, &words, &options()).unwrap();
        assert_eq!(a.crc32c_hash(), b.crc32c_hash());
        assert_ne!(a.crc32c_hash(), 0);
    }

    #[test]
    fn test_translation_attaches_once() {
        let words = enc::to_bytes(&[enc::addi(1, 0, 1)]);
        let seg = ExecuteSegment::new(0x1000, &words, &options()).unwrap();
        assert!(!seg.is_binary_translated());
        seg.set_translation(Translation {
            mappings: Vec::new(),
            keepalive: None,
            in_process: false,
        })
        .unwrap();
        assert!(seg.is_binary_translated());
        let err = seg
            .set_translation(Translation {
                mappings: Vec::new(),
                keepalive: None,
                in_process: false,
            })
            .unwrap_err();
        assert!(matches!(err, Error::IllegalOperation(_)));
    }

    #[test]
    fn test_segment_list_eviction_truncates_tail() {
        let words = enc::to_bytes(&[enc::addi(1, 0, 1)]);
        let mut list = SegmentList::new(8);
        for base in [0x1000u64, 0x3000, 0x5000] {
            let seg = ExecuteSegment::new(base, &words, &options()).unwrap();
            list.insert(Arc::new(seg));
        }
        assert_eq!(list.len(), 3);
        list.evict(2);
        assert_eq!(list.len(), 2);
        // The oldest segments survive; the tail was truncated.
        assert!(list.find(0x1000).is_some());
        assert!(list.find(0x3000).is_some());
        assert!(list.find(0x5000).is_none());
    }
}
