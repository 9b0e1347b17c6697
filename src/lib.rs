//! RISC-V execution-segment pipeline.
//!
//! Converts a contiguous range of guest instruction bytes into a
//! fast-dispatchable representation, and optionally ahead-of-time
//! translates it to native code through emitted C.
//!
//! ## Architecture
//!
//! - **Decoder cache** ([`decoder`]): one fixed-stride entry per addressable
//!   instruction slot, covering a whole execute segment.
//! - **Pre-decoder** ([`predecode`]): resolves and interns a handler for
//!   every valid instruction start, then realizes the fast-sim metadata so
//!   the dispatch loop can run straight-line blocks without per-step
//!   boundary checks.
//! - **Binary translator** ([`bintr`]): partitions the segment into
//!   translation units, emits a self-contained C translation unit per
//!   block, compiles it (host compiler, in-process backend, or embeddable
//!   source), and activates the result by patching decoder entries —
//!   synchronously before first dispatch, or live while the interpreter
//!   runs.
//! - **Machine** ([`machine`]): the minimal collaborator surface: the
//!   `#[repr(C)]` CPU record translated code indexes into, the guest memory
//!   arena, the fast-sim dispatch loop, and the callback table.
//!
//! Execute segments are immutable once realized; modified code creates a
//! new segment. Translations attach at most once per segment and may be
//! shared across machines when the configuration allows it.

pub mod bintr;
pub mod cache;
pub mod config;
pub mod decode;
pub mod decoder;
pub mod error;
pub mod instr;
pub mod machine;
pub mod predecode;
pub mod segment;

pub use cache::{CacheStats, TranslationCache};
pub use config::{CrossOutput, TranslatorOptions, Xlen};
pub use decoder::{DecoderEntry, DecoderTable, HandlerTable, FASTSIM_BLOCK_END};
pub use error::{Error, ExceptionKind};
pub use instr::{CInstr, Instr};
pub use machine::{Arena, ArenaKind, Cpu, CpuOffsets, FpReg, Machine, SYSCALLS_MAX};
pub use segment::{ExecuteSegment, SegmentList, Translation};

pub use bintr::{
    register_embedded_translation, CallbackTable, EmbeddedTranslation, InProcessCompiler,
    Mapping, ReturnValues, TransInfo, TransMapping, TranslateContext,
};
