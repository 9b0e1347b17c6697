//! Translation loading and orchestration.
//!
//! Hashes the segment together with the code-generation defines, consults
//! the embedded-translation table, tries a cached shared object, and finally
//! drives block discovery, emission and compilation. The compile step runs
//! synchronously unless a background executor is configured, in which case
//! activation uses the live-patching protocol.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{CrossOutput, TranslatorOptions};
use crate::decoder::bytecodes;
use crate::error::Error;
use crate::machine::{ArenaKind, SYSCALLS_MAX};
use crate::segment::{ExecuteSegment, Translation};

use super::compile;
use super::emit;
use super::loader;
use super::preamble::BINTR_CODE;
use super::types::{BintrFunc, CallbackTable, Mapping, TransMapping, TranslateContext};
use super::blocks;

/// Capacity of the embedded-translation table.
pub const MAX_EMBEDDED: usize = 12;

/// Signature of a translation's `init` export.
pub type InitFn = unsafe extern "C" fn(*const CallbackTable, *mut u8);

/// A translation registered at link time.
#[derive(Clone, Copy)]
pub struct EmbeddedTranslation {
    pub hash: u32,
    pub mappings: &'static [Mapping],
    pub handlers: &'static [BintrFunc],
    pub init: InitFn,
}

static EMBEDDED_TRANSLATIONS: Mutex<Vec<EmbeddedTranslation>> = Mutex::new(Vec::new());

/// Register an embedded translation; consulted by hash before any dynamic
/// loading. The table holds at most [`MAX_EMBEDDED`] entries.
pub fn register_embedded_translation(translation: EmbeddedTranslation) -> Result<(), Error> {
    let mut table = EMBEDDED_TRANSLATIONS.lock();
    if table.len() >= MAX_EMBEDDED {
        return Err(Error::InvalidProgram("too many embedded translations"));
    }
    table.push(translation);
    Ok(())
}

fn lookup_embedded(hash: u32) -> Option<EmbeddedTranslation> {
    EMBEDDED_TRANSLATIONS
        .lock()
        .iter()
        .find(|t| t.hash == hash)
        .copied()
}

/// Registration entry point for self-registering embeddable sources, which
/// run it from a global constructor when linked into the process.
///
/// # Safety
/// `mappings` and `handlers` must point at static arrays of the given
/// lengths that outlive the process.
#[no_mangle]
pub unsafe extern "C" fn riscv_bintr_register_translation(
    hash: u32,
    mappings: *const Mapping,
    nmappings: u32,
    handlers: *const BintrFunc,
    nhandlers: u32,
    init: InitFn,
) {
    if mappings.is_null() || handlers.is_null() {
        return;
    }
    let translation = EmbeddedTranslation {
        hash,
        mappings: std::slice::from_raw_parts(mappings, nmappings as usize),
        handlers: std::slice::from_raw_parts(handlers, nhandlers as usize),
        init,
    };
    if register_embedded_translation(translation).is_err() {
        tracing::warn!(target: "bintr", hash, "embedded translation table is full");
    }
}

/// Code-generation defines; every entry participates in the hash so toggling
/// any of them recompiles the translation.
pub fn create_defines(ctx: &TranslateContext) -> BTreeMap<String, String> {
    let options = &ctx.options;
    let mut defines: BTreeMap<String, String> = BTreeMap::new();
    if cfg!(target_os = "linux") {
        defines.insert("RISCV_PLATFORM_LINUX".into(), "1".into());
    } else if cfg!(target_os = "macos") {
        defines.insert("RISCV_PLATFORM_DARWIN".into(), "1".into());
    } else if cfg!(target_os = "windows") {
        defines.insert("RISCV_PLATFORM_WINDOWS".into(), "1".into());
    } else if cfg!(target_os = "freebsd") {
        defines.insert("RISCV_PLATFORM_FREEBSD".into(), "1".into());
    }
    defines.insert(
        "RISCV_TRANSLATION_DYLIB".into(),
        options.xlen.bytes().to_string(),
    );
    defines.insert("RISCV_MAX_SYSCALLS".into(), SYSCALLS_MAX.to_string());

    // Executables loaded above the arena keep the window empty.
    let (arena_end, rodata_end) = if options.translation_use_arena {
        (ctx.arena_size, ctx.rodata_end)
    } else {
        (0x1000, 0)
    };
    defines.insert("RISCV_ARENA_END".into(), arena_end.to_string());
    defines.insert("RISCV_ARENA_ROEND".into(), rodata_end.to_string());
    let specsafe = arena_end.max(0x1000).next_power_of_two() - 1;
    defines.insert("RISCV_SPECSAFE_MASK".into(), specsafe.to_string());

    let off = &ctx.offsets;
    defines.insert("RISCV_REGS_OFF".into(), off.regs.to_string());
    defines.insert("RISCV_FREGS_OFF".into(), off.fregs.to_string());
    defines.insert("RISCV_INS_COUNTER_OFF".into(), off.counter.to_string());
    defines.insert("RISCV_MAX_COUNTER_OFF".into(), off.max_counter.to_string());
    defines.insert("RISCV_ARENA_OFF".into(), off.arena.to_string());
    defines.insert("RISCV_EXCEPTION_OFF".into(), off.exception.to_string());

    if options.atomics {
        defines.insert("RISCV_EXT_A".into(), "1".into());
    }
    if options.compressed {
        defines.insert("RISCV_EXT_C".into(), "1".into());
    }
    if options.vector_extension > 0 {
        defines.insert(
            "RISCV_EXT_VECTOR".into(),
            options.vector_extension.to_string(),
        );
    }
    if options.translate_trace {
        // Changes the hash, so toggling tracing recompiles.
        defines.insert("RISCV_TRACING".into(), "1".into());
    }
    if options.translate_ignore_instruction_limit {
        defines.insert("RISCV_IGNORE_INSTRUCTION_LIMIT".into(), "1".into());
    }
    if let ArenaKind::Encompassing { bits } = ctx.effective_arena() {
        defines.insert("RISCV_NBIT_UNBOUNDED".into(), bits.to_string());
    }
    defines
}

/// Normalized `-D` string; sorted keys keep the hash deterministic.
pub fn defines_to_string(defines: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in defines {
        out.push_str(" -D");
        out.push_str(key);
        out.push('=');
        out.push_str(value);
    }
    out
}

/// Translation hash: CRC32-C of the segment bytes continued over the
/// normalized define string.
pub fn compute_translation_hash(segment_crc: u32, cflags: &str) -> u32 {
    crc32c::crc32c_append(segment_crc, cflags.as_bytes())
}

/// Deferred compile work, shipped to the background executor when present.
#[derive(Debug)]
pub struct CompileJob {
    pub source: String,
    pub defines: BTreeMap<String, String>,
    pub filename: String,
    pub hash: u32,
}

/// Load or produce a translation for a freshly created segment.
///
/// Returns a [`CompileJob`] when the compile step must run after the segment
/// is published (background executor configured); everything else happens
/// synchronously against `&mut seg`.
pub fn load_and_translate(
    ctx: &TranslateContext,
    seg: &mut ExecuteSegment,
    table: CallbackTable,
) -> Result<Option<CompileJob>, Error> {
    let options = &ctx.options;
    if options.translate_blocks_max == 0
        || (!options.translate_enabled && !options.translate_enable_embedded)
    {
        if options.verbose_loader {
            tracing::info!(target: "bintr", "binary translation disabled");
        }
        return Ok(None);
    }
    if seg.is_binary_translated() {
        return Err(Error::IllegalOperation(
            "execute segment already binary translated",
        ));
    }

    // Checksum the execute segment plus the compiler flags.
    let hash_start = std::time::Instant::now();
    let defines = create_defines(ctx);
    let cflags = defines_to_string(&defines);
    let checksum = seg.crc32c_hash();
    if checksum == 0 {
        return Err(Error::InvalidProgram(
            "invalid execute segment hash for translation",
        ));
    }
    let hash = compute_translation_hash(checksum, &cflags);
    seg.set_translation_hash(hash);
    if options.translate_timing {
        tracing::debug!(
            target: "bintr",
            elapsed_ns = hash_start.elapsed().as_nanos() as u64,
            "execute segment hashing"
        );
    }

    if options.translate_enable_embedded {
        if let Some(embedded) = lookup_embedded(hash) {
            if options.verbose_loader {
                tracing::info!(
                    target: "bintr",
                    hash = format_args!("{hash:08X}"),
                    mappings = embedded.mappings.len(),
                    handlers = embedded.handlers.len(),
                    "found embedded translation"
                );
            }
            activate_embedded(ctx, seg, &embedded, table)?;
            return Ok(None);
        }
        if options.verbose_loader {
            tracing::info!(
                target: "bintr",
                hash = format_args!("{hash:08X}"),
                "no embedded translation found"
            );
        }
    }
    if !options.translate_enabled {
        return Ok(None);
    }

    let filename = TranslatorOptions::translation_filename(
        &options.translation_prefix,
        hash,
        &options.translation_suffix,
    );

    // With an in-process backend the loader always compiles in-process
    // instead of going through the filesystem.
    let mut must_compile = true;
    if options.in_process_compiler.is_none() && Path::new(&filename).exists() {
        match loader::open_dylib(&filename, hash) {
            Ok(lib) => {
                let symbols = loader::read_symbols(&lib)?;
                loader::activate_sync(ctx, seg, &symbols, Some(lib), false, table)?;
                must_compile = false;
            }
            Err(err) => {
                if options.verbose_loader {
                    tracing::warn!(target: "bintr", %err, "failed to load cached translation");
                }
            }
        }
    }

    // Cross-compiled artifacts must all exist, and embeddable source output
    // always requires the compile step.
    for cross in &options.cross_compile {
        match cross {
            CrossOutput::SharedObject { prefix, suffix, .. } => {
                let name = TranslatorOptions::translation_filename(prefix, hash, suffix);
                if !Path::new(&name).exists() {
                    must_compile = true;
                }
            }
            CrossOutput::EmbeddableSource { .. } => must_compile = true,
        }
    }

    if !must_compile || !options.translate_invoke_compiler {
        return Ok(None);
    }

    // Discovery and emission are cheap enough to run inline.
    let scan_start = std::time::Instant::now();
    let basepc = seg.exec_begin();
    let endpc = seg.exec_end();
    let discovered = blocks::discover_blocks(seg, ctx, basepc, endpc);
    if options.translate_timing {
        tracing::debug!(
            target: "bintr",
            blocks = discovered.len(),
            elapsed_ns = scan_start.elapsed().as_nanos() as u64,
            "code block detection"
        );
    }
    if discovered.is_empty() {
        return Ok(None);
    }

    let emit_start = std::time::Instant::now();
    let mut code = String::from(BINTR_CODE);
    let mut dlmappings: Vec<TransMapping> = Vec::new();
    for block in &discovered {
        let emitted = emit::emit(ctx, block)?;
        code.push_str(&emitted.code);
        dlmappings.extend(emitted.mappings);
    }
    if options.translate_timing {
        tracing::debug!(
            target: "bintr",
            elapsed_ns = emit_start.elapsed().as_nanos() as u64,
            "code generation"
        );
    }
    if dlmappings.is_empty() {
        if options.verbose_loader {
            tracing::info!(target: "bintr", "nothing to compile, no mappings");
        }
        return Ok(None);
    }
    if options.verbose_loader {
        tracing::info!(
            target: "bintr",
            functions = discovered.len(),
            mappings = dlmappings.len(),
            "emitted translation source"
        );
    }

    let (footer, unique_symbols) = build_footer(&dlmappings);
    if unique_symbols.len() != discovered.len() {
        return Err(Error::InvalidProgram("mismatch in unique mappings"));
    }
    code.push_str(&footer);

    // Embeddable source outputs are written immediately.
    for cross in &options.cross_compile {
        if let CrossOutput::EmbeddableSource { prefix, suffix } = cross {
            let name = TranslatorOptions::translation_filename(prefix, hash, suffix);
            compile::write_embeddable_source(&name, &defines, &code, &dlmappings, hash)?;
        }
    }

    let job = CompileJob {
        source: code,
        defines,
        filename,
        hash,
    };

    if options.translate_background_callback.is_some() {
        return Ok(Some(job));
    }

    // Synchronous compile and activation. A failed compile or load leaves
    // the segment in interpreter mode with no partial state; only manifest
    // validation errors are fatal.
    match compile_and_activate_sync(ctx, seg, &job, table) {
        Ok(()) => {}
        Err(err @ (Error::Compile(_) | Error::DylibLoad(_) | Error::Io(_))) => {
            if options.verbose_loader {
                tracing::warn!(target: "bintr", %err, "translation failed, continuing interpreted");
            }
        }
        Err(other) => return Err(other),
    }
    Ok(None)
}

fn compile_and_activate_sync(
    ctx: &TranslateContext,
    seg: &mut ExecuteSegment,
    job: &CompileJob,
    table: CallbackTable,
) -> Result<(), Error> {
    let options = &ctx.options;
    if let Some(backend) = options.in_process_compiler.clone() {
        let module = compile::compile_in_process(&*backend, job)?;
        let symbols = loader::read_module_symbols(&*module)?;
        let keepalive: Arc<dyn std::any::Any + Send + Sync> = Arc::new(module);
        return loader::activate_sync(ctx, seg, &symbols, Some(keepalive), true, table);
    }
    compile::compile_shared_object(ctx, job)?;
    for cross in &options.cross_compile {
        if let CrossOutput::SharedObject {
            command,
            prefix,
            suffix,
        } = cross
        {
            let name = TranslatorOptions::translation_filename(prefix, job.hash, suffix);
            compile::cross_compile_shared_object(ctx, job, command, &name)?;
        }
    }
    let lib = loader::open_dylib(&job.filename, job.hash)?;
    let symbols = loader::read_symbols(&lib)?;
    loader::activate_sync(ctx, seg, &symbols, Some(lib), false, table)?;
    if options.verbose_loader {
        tracing::info!(
            target: "bintr",
            hash = format_args!("{:08X}", job.hash),
            "activated full binary translation"
        );
    }
    if !options.translation_cache {
        // Unwanted artifact; the loaded mapping stays valid.
        let _ = std::fs::remove_file(&job.filename);
    }
    Ok(())
}

/// Run the deferred compile step, activating with the live-patch protocol.
pub fn schedule_compile(
    ctx: &TranslateContext,
    seg: Arc<ExecuteSegment>,
    job: CompileJob,
    table: CallbackTable,
) {
    let ctx = ctx.clone();
    let Some(executor) = ctx.options.translate_background_callback.clone() else {
        return;
    };
    executor(Box::new(move || {
        if seg.is_binary_translated() {
            return;
        }
        let result = compile_and_activate_live(&ctx, &seg, &job, table);
        if let Err(err) = result {
            tracing::warn!(target: "bintr", %err, "background translation failed");
        }
    }));
}

fn compile_and_activate_live(
    ctx: &TranslateContext,
    seg: &Arc<ExecuteSegment>,
    job: &CompileJob,
    table: CallbackTable,
) -> Result<(), Error> {
    if let Some(backend) = ctx.options.in_process_compiler.clone() {
        let module = compile::compile_in_process(&*backend, job)?;
        let symbols = loader::read_module_symbols(&*module)?;
        let keepalive: Arc<dyn std::any::Any + Send + Sync> = Arc::new(module);
        return loader::activate_live(ctx, seg, &symbols, Some(keepalive), true, table);
    }
    compile::compile_shared_object(ctx, job)?;
    let lib = loader::open_dylib(&job.filename, job.hash)?;
    let symbols = loader::read_symbols(&lib)?;
    let result = loader::activate_live(ctx, seg, &symbols, Some(lib), false, table);
    if !ctx.options.translation_cache {
        let _ = std::fs::remove_file(&job.filename);
    }
    result
}

fn activate_embedded(
    ctx: &TranslateContext,
    seg: &mut ExecuteSegment,
    embedded: &EmbeddedTranslation,
    table: CallbackTable,
) -> Result<(), Error> {
    // Point the precompiled code back at this machine.
    unsafe { (embedded.init)(&table, ctx.arena_ptr as *mut u8) };

    let mappings: Vec<BintrFunc> = embedded.handlers.to_vec();
    for mapping in embedded.mappings {
        if seg.is_within(mapping.addr) {
            let entry = seg.base_decoder_mut().entry_mut(mapping.addr);
            entry.raw_instr = mapping.mapping_index;
            entry.set_bytecode(bytecodes::BC_BLOCK_END);
        } else {
            tracing::warn!(
                target: "bintr",
                addr = format_args!("{:#x}", mapping.addr),
                "embedded mapping outside execute area"
            );
        }
    }
    seg.set_translation(Translation {
        mappings,
        keepalive: None,
        in_process: false,
    })
}

/// Append the mapping manifest: `no_mappings`, `mappings[]`, `no_handlers`
/// and `unique_mappings[]`. Returns the unique symbols in index order.
pub fn build_footer(dlmappings: &[TransMapping]) -> (String, Vec<String>) {
    let mut footer = String::new();
    footer.push_str(&format!(
        "VISIBLE const uint32_t no_mappings = {};\n",
        dlmappings.len()
    ));
    footer.push_str("VISIBLE const Mapping mappings[] = {\n");

    let mut indices: BTreeMap<&str, u32> = BTreeMap::new();
    let mut unique: Vec<String> = Vec::new();
    for mapping in dlmappings {
        let index = match indices.get(mapping.symbol.as_str()) {
            Some(&idx) => idx,
            None => {
                let idx = unique.len() as u32;
                indices.insert(mapping.symbol.as_str(), idx);
                unique.push(mapping.symbol.clone());
                idx
            }
        };
        footer.push_str(&format!("{{0x{:X}, {}}},\n", mapping.addr, index));
    }
    footer.push_str("};\n");
    footer.push_str(&format!(
        "VISIBLE const uint32_t no_handlers = {};\n",
        unique.len()
    ));
    footer.push_str("VISIBLE const bintr_func unique_mappings[] = {\n");
    for symbol in &unique {
        footer.push_str(&format!("    {symbol},\n"));
    }
    footer.push_str("};\n");
    (footer, unique)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Xlen;
    use crate::instr::enc;
    use crate::machine::CpuOffsets;

    fn context() -> TranslateContext {
        TranslateContext {
            options: TranslatorOptions::default(),
            arena_kind: ArenaKind::Flat,
            arena_size: 0x100000,
            rodata_end: 0x2000,
            arena_ptr: 0,
            start_address: 0x1000,
            offsets: CpuOffsets::current(),
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        let ctx = context();
        let cflags = defines_to_string(&create_defines(&ctx));
        let a = compute_translation_hash(0xDEADBEEF, &cflags);
        let b = compute_translation_hash(0xDEADBEEF, &cflags);
        assert_eq!(a, b);
        assert_ne!(a, 0xDEADBEEF);
    }

    #[test]
    fn test_hash_changes_with_codegen_flags() {
        let ctx = context();
        let base = defines_to_string(&create_defines(&ctx));

        let mut traced = context();
        traced.options.translate_trace = true;
        let traced = defines_to_string(&create_defines(&traced));
        assert_ne!(base, traced);
        assert_ne!(
            compute_translation_hash(1, &base),
            compute_translation_hash(1, &traced)
        );

        let mut unlimited = context();
        unlimited.options.translate_ignore_instruction_limit = true;
        let unlimited = defines_to_string(&create_defines(&unlimited));
        assert_ne!(
            compute_translation_hash(1, &base),
            compute_translation_hash(1, &unlimited)
        );

        let mut rv32 = context();
        rv32.options.xlen = Xlen::Rv32;
        let rv32 = defines_to_string(&create_defines(&rv32));
        assert_ne!(
            compute_translation_hash(1, &base),
            compute_translation_hash(1, &rv32)
        );
    }

    #[test]
    fn test_defines_carry_cpu_offsets() {
        let ctx = context();
        let defines = create_defines(&ctx);
        let off = CpuOffsets::current();
        assert_eq!(
            defines.get("RISCV_INS_COUNTER_OFF"),
            Some(&off.counter.to_string())
        );
        assert_eq!(defines.get("RISCV_ARENA_OFF"), Some(&off.arena.to_string()));
        assert_eq!(defines.get("RISCV_TRANSLATION_DYLIB"), Some(&"8".to_string()));
    }

    #[test]
    fn test_footer_dedups_symbols() {
        let dlmappings = vec![
            TransMapping {
                addr: 0x1000,
                symbol: "f_1000".into(),
            },
            TransMapping {
                addr: 0x1004,
                symbol: "f_1000".into(),
            },
            TransMapping {
                addr: 0x2000,
                symbol: "f_2000".into(),
            },
        ];
        let (footer, unique) = build_footer(&dlmappings);
        assert_eq!(unique, vec!["f_1000".to_string(), "f_2000".to_string()]);
        assert!(footer.contains("VISIBLE const uint32_t no_mappings = 3;"));
        assert!(footer.contains("{0x1000, 0},"));
        assert!(footer.contains("{0x1004, 0},"));
        assert!(footer.contains("{0x2000, 1},"));
        assert!(footer.contains("VISIBLE const uint32_t no_handlers = 2;"));
        assert!(footer.contains("    f_2000,\n};"));
    }

    #[test]
    fn test_disabled_translation_is_a_noop() {
        let mut ctx = context();
        ctx.options.translate_enabled = false;
        ctx.options.translate_enable_embedded = false;
        let mut seg = ExecuteSegment::new(
            0x1000,
            &enc::to_bytes(&[enc::addi(1, 0, 1), enc::jalr(0, 1, 0)]),
            &ctx.options,
        )
        .unwrap();
        let table = dummy_table();
        let job = load_and_translate(&ctx, &mut seg, table).unwrap();
        assert!(job.is_none());
        assert!(!seg.is_binary_translated());
        assert_eq!(seg.translation_hash(), 0);
    }

    #[test]
    fn test_retranslating_is_illegal() {
        let ctx = context();
        let mut seg = ExecuteSegment::new(
            0x1000,
            &enc::to_bytes(&[enc::addi(1, 0, 1), enc::jalr(0, 1, 0)]),
            &ctx.options,
        )
        .unwrap();
        seg.set_translation(Translation {
            mappings: Vec::new(),
            keepalive: None,
            in_process: false,
        })
        .unwrap();
        let err = load_and_translate(&ctx, &mut seg, dummy_table()).unwrap_err();
        assert!(matches!(err, Error::IllegalOperation(_)));
    }

    #[test]
    fn test_embedded_translation_activation() {
        unsafe extern "C" fn fake_block(
            _cpu: *mut crate::machine::Cpu,
            counter: u64,
            max_counter: u64,
            _pc: u64,
        ) -> super::super::types::ReturnValues {
            super::super::types::ReturnValues {
                counter,
                max_counter,
            }
        }
        unsafe extern "C" fn fake_init(_table: *const CallbackTable, _arena: *mut u8) {}

        let mut ctx = context();
        ctx.options.translate_enabled = false;
        // Stable code so the hash can be precomputed the way a build script
        // registering an embedded translation would.
        let code = enc::to_bytes(&[enc::addi(1, 0, 1), enc::jalr(0, 1, 0)]);
        let mut seg = ExecuteSegment::new(0x1000, &code, &ctx.options).unwrap();
        let cflags = defines_to_string(&create_defines(&ctx));
        let hash = compute_translation_hash(seg.crc32c_hash(), &cflags);

        static MAPPINGS: &[Mapping] = &[
            Mapping {
                addr: 0x1000,
                mapping_index: 0,
            },
            // Outside the segment: logged and skipped.
            Mapping {
                addr: 0x9000,
                mapping_index: 0,
            },
        ];
        let handlers: &'static [BintrFunc] =
            Box::leak(vec![fake_block as BintrFunc].into_boxed_slice());
        register_embedded_translation(EmbeddedTranslation {
            hash,
            mappings: MAPPINGS,
            handlers,
            init: fake_init,
        })
        .unwrap();

        let job = load_and_translate(&ctx, &mut seg, dummy_table()).unwrap();
        assert!(job.is_none());
        assert!(seg.is_binary_translated());
        assert_eq!(seg.translation_hash(), hash);
        let entry = seg.base_decoder().entry_at(0x1000);
        assert_eq!(entry.bytecode(), bytecodes::BC_BLOCK_END);
        assert_eq!(entry.raw_instr, 0);
        assert!(seg.mapping(0).is_some());
    }

    fn dummy_table() -> CallbackTable {
        let mut machine = crate::machine::Machine::new(
            TranslatorOptions {
                translate_enabled: false,
                translate_enable_embedded: false,
                ..Default::default()
            },
            crate::machine::Arena::flat(0x1000, 0),
        );
        machine.callback_table()
    }
}
