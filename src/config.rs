//! Translator configuration.
//!
//! All knobs recognized by the pipeline, with safe defaults. The flags that
//! change generated code (`translate_trace`, `translate_ignore_instruction_limit`,
//! XLEN, extensions, arena widths) also change the translation hash, so a
//! cached shared object is never reused across incompatible configurations.

use std::fmt;
use std::sync::Arc;

use crate::bintr::compile::InProcessCompiler;

/// Register width of the guest program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Xlen {
    Rv32,
    Rv64,
}

impl Xlen {
    /// Width in bits.
    pub fn bits(self) -> u32 {
        match self {
            Xlen::Rv32 => 32,
            Xlen::Rv64 => 64,
        }
    }

    /// Width in bytes, the `W` the define string carries.
    pub fn bytes(self) -> u32 {
        self.bits() / 8
    }
}

/// Executor used to run the compile step off the caller's thread.
pub type BackgroundExecutor = Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

/// One additional output produced next to the host shared object.
#[derive(Clone, Debug)]
pub enum CrossOutput {
    /// Invoke a cross compiler, writing a shared object for another platform
    /// to `prefix + hex(hash) + suffix`.
    SharedObject {
        command: String,
        prefix: String,
        suffix: String,
    },
    /// Write a self-registering C source file for compile-time linking.
    EmbeddableSource { prefix: String, suffix: String },
}

/// Configuration for decoding and binary translation.
#[derive(Clone)]
pub struct TranslatorOptions {
    /// Allow dynamic compilation of translations.
    pub translate_enabled: bool,
    /// Consult the embedded-translation table before anything else.
    pub translate_enable_embedded: bool,
    /// Allow invoking a compiler when no cached artifact exists.
    pub translate_invoke_compiler: bool,
    /// Hard cap on translation units per segment.
    pub translate_blocks_max: usize,
    /// Hard cap on total translated instructions per segment.
    pub translate_instr_max: usize,
    /// Emit a per-instruction trace callback (changes the hash).
    pub translate_trace: bool,
    /// Omit instruction-counter checks in emitted code (changes the hash).
    pub translate_ignore_instruction_limit: bool,
    /// Run the compile step on this executor; when set, activation uses the
    /// live-patching protocol instead of mutating the running decoder.
    pub translate_background_callback: Option<BackgroundExecutor>,
    /// Let the emitter lower loads and stores through the arena pointer.
    pub translation_use_arena: bool,
    /// Cache filename prefix.
    pub translation_prefix: String,
    /// Cache filename suffix.
    pub translation_suffix: String,
    /// Keep the built shared object on disk; unlink it when false.
    pub translation_cache: bool,
    /// Additional cross-compiled or embeddable-source outputs.
    pub cross_compile: Vec<CrossOutput>,
    /// Permit sharing execute segments between machines. Changes how the
    /// emitter lowers arena access (no absolute host pointers).
    pub use_shared_execute_segments: bool,
    /// Log loader progress.
    pub verbose_loader: bool,
    /// Log per-phase timing.
    pub translate_timing: bool,

    /// Host C compiler command for the dynamic path.
    pub cc_command: String,
    /// Extra flags appended to the compile command.
    pub cc_extra_flags: Vec<String>,
    /// In-process compiler backend. When present the loader always compiles
    /// in-process instead of going through the filesystem.
    pub in_process_compiler: Option<Arc<dyn InProcessCompiler>>,

    /// Guest register width.
    pub xlen: Xlen,
    /// Decode compressed instructions (decoder stride 2 instead of 4).
    pub compressed: bool,
    /// Translate atomic extension instructions (stubbed to callbacks).
    pub atomics: bool,
    /// Vector lane width in bytes per register; 0 disables the extension.
    pub vector_extension: u32,
    /// Pass pre-decoded instructions through the idiom rewriter.
    pub decoder_rewriter_enabled: bool,
}

impl Default for TranslatorOptions {
    fn default() -> Self {
        Self {
            translate_enabled: true,
            translate_enable_embedded: true,
            translate_invoke_compiler: true,
            translate_blocks_max: 4000,
            translate_instr_max: 500_000,
            translate_trace: false,
            translate_ignore_instruction_limit: false,
            translate_background_callback: None,
            translation_use_arena: true,
            translation_prefix: "/tmp/rvbintr-".into(),
            translation_suffix: ".so".into(),
            translation_cache: true,
            cross_compile: Vec::new(),
            use_shared_execute_segments: false,
            verbose_loader: false,
            translate_timing: false,
            cc_command: "cc".into(),
            cc_extra_flags: Vec::new(),
            in_process_compiler: None,
            xlen: Xlen::Rv64,
            compressed: false,
            atomics: false,
            vector_extension: 0,
            decoder_rewriter_enabled: true,
        }
    }
}

impl TranslatorOptions {
    /// Decoder stride in bytes: compressed halfwords or full words.
    pub fn stride(&self) -> u64 {
        if self.compressed {
            2
        } else {
            4
        }
    }

    /// Alignment mask for branch and jump targets.
    pub fn align_mask(&self) -> u64 {
        if self.compressed {
            0x1
        } else {
            0x3
        }
    }

    /// Cache artifact path for a translation hash.
    pub fn translation_filename(prefix: &str, hash: u32, suffix: &str) -> String {
        format!("{prefix}{hash:08X}{suffix}")
    }
}

impl fmt::Debug for TranslatorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslatorOptions")
            .field("translate_enabled", &self.translate_enabled)
            .field("translate_enable_embedded", &self.translate_enable_embedded)
            .field("translate_blocks_max", &self.translate_blocks_max)
            .field("translate_instr_max", &self.translate_instr_max)
            .field("translate_trace", &self.translate_trace)
            .field(
                "translate_ignore_instruction_limit",
                &self.translate_ignore_instruction_limit,
            )
            .field(
                "background",
                &self.translate_background_callback.is_some(),
            )
            .field("translation_use_arena", &self.translation_use_arena)
            .field("translation_prefix", &self.translation_prefix)
            .field("translation_suffix", &self.translation_suffix)
            .field("translation_cache", &self.translation_cache)
            .field(
                "use_shared_execute_segments",
                &self.use_shared_execute_segments,
            )
            .field("xlen", &self.xlen)
            .field("compressed", &self.compressed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = TranslatorOptions::default();
        assert!(opts.translate_enabled);
        assert!(opts.translate_invoke_compiler);
        assert_eq!(opts.translate_blocks_max, 4000);
        assert_eq!(opts.xlen, Xlen::Rv64);
        assert!(!opts.compressed);
        assert_eq!(opts.stride(), 4);
        assert_eq!(opts.align_mask(), 0x3);
    }

    #[test]
    fn test_compressed_stride() {
        let opts = TranslatorOptions {
            compressed: true,
            ..Default::default()
        };
        assert_eq!(opts.stride(), 2);
        assert_eq!(opts.align_mask(), 0x1);
    }

    #[test]
    fn test_translation_filename() {
        let name = TranslatorOptions::translation_filename("rv64-", 0x1A2B3C4D, ".so");
        assert_eq!(name, "rv64-1A2B3C4D.so");
        // Short hashes are zero-padded to eight hex digits.
        let name = TranslatorOptions::translation_filename("rv64-", 0xBEEF, ".so");
        assert_eq!(name, "rv64-0000BEEF.so");
    }
}
