//! Binary translation pipeline: block discovery, C-source emission, and the
//! translation loader/activator.
//!
//! ## Pipeline
//!
//! 1. **Hashing** ([`translate`]): CRC32-C of the segment bytes, continued
//!    over the normalized code-generation defines. Toggling any flag that
//!    changes the emitted code changes the hash.
//! 2. **Embedded table** ([`translate`]): pre-registered translations are
//!    matched by hash and activated without touching the filesystem.
//! 3. **Block discovery** ([`blocks`]): the segment is partitioned into
//!    translation units at stopping instructions, with intra-block jump
//!    targets and global JAL targets recorded.
//! 4. **Emission** ([`emit`]): each unit becomes one C function over the
//!    [`preamble`] runtime header.
//! 5. **Compilation** ([`compile`]): the host C compiler, an in-process
//!    backend, or the embeddable-source sink.
//! 6. **Activation** ([`loader`]): manifest validation and decoder rewrites,
//!    either synchronously before the segment is published or through the
//!    live-patching protocol while the interpreter runs.

pub mod blocks;
pub mod compile;
pub mod emit;
pub mod loader;
pub mod preamble;
pub mod translate;
pub mod types;

pub use blocks::{discover_blocks, is_stopping_instruction, scan_for_gp, ITS_TIME_TO_SPLIT};
pub use compile::{CompiledModule, InProcessCompiler};
pub use emit::{emit, EmittedBlock};
pub use loader::{DylibSymbols, LoadedDylib};
pub use preamble::BINTR_CODE;
pub use translate::{
    register_embedded_translation, CompileJob, EmbeddedTranslation, InitFn, MAX_EMBEDDED,
};
pub use types::{
    BintrFunc, CallbackTable, Mapping, ReturnValues, TransInfo, TransMapping, TranslateContext,
};
