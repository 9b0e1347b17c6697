//! Translation loading and activation.
//!
//! Opens the shared object (serialized process-wide), resolves the manifest
//! symbols, validates them, and installs the mappings into the segment's
//! decoder. Synchronous activation mutates the decoder directly; live
//! activation builds a fully patched copy, publishes it, and only then flips
//! the original entries' bytecodes so a running interpreter re-enters
//! through the patched table.

use std::any::Any;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;

use crate::cache::with_translation_cache;
use crate::decoder::{bytecodes, DecoderTable};
use crate::error::{Error, ExceptionKind};
use crate::machine::{cb_trigger_exception, Cpu};
use crate::segment::{ExecuteSegment, Translation};

use super::compile::CompiledModule;
use super::translate::InitFn;
use super::types::{BintrFunc, CallbackTable, Mapping, ReturnValues, TranslateContext};

/// Mappings past this count are rejected as a corrupt manifest.
const MAX_MAPPINGS: u32 = 500_000;

// dlopen is not reliably reentrant everywhere; serialize it.
static DLOPEN_MUTEX: Mutex<()> = Mutex::new(());

/// An open translation shared object. Dropping the last reference closes
/// the handle exactly once.
pub struct LoadedDylib {
    library: Option<Library>,
}

impl LoadedDylib {
    fn library(&self) -> Result<&Library, Error> {
        self.library
            .as_ref()
            .ok_or(Error::InvalidProgram("translation has no backing library"))
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self { library: None }
    }
}

/// Open a translation, re-using a cached handle for the same hash.
pub fn open_dylib(path: &str, hash: u32) -> Result<Arc<LoadedDylib>, Error> {
    if let Some(cached) = with_translation_cache(|cache| cache.get(hash)) {
        return Ok(cached);
    }
    let _guard = DLOPEN_MUTEX.lock();
    let library = unsafe { Library::new(path)? };
    let lib = Arc::new(LoadedDylib {
        library: Some(library),
    });
    with_translation_cache(|cache| cache.insert(hash, lib.clone()));
    Ok(lib)
}

/// The resolved dylib manifest, copied out of the code object.
pub struct DylibSymbols {
    pub init: InitFn,
    pub mappings: Vec<Mapping>,
    pub handlers: Vec<BintrFunc>,
}

/// Resolve `init`, `no_mappings`, `mappings`, `no_handlers` and
/// `unique_mappings`, validating the manifest shape.
pub fn read_symbols(lib: &Arc<LoadedDylib>) -> Result<DylibSymbols, Error> {
    let library = lib.library()?;
    unsafe {
        let init_sym = library.get::<InitFn>(b"init\0")?;
        let init: InitFn = *init_sym;
        let no_mappings = **library.get::<*const u32>(b"no_mappings\0")?;
        let mappings_ptr = *library.get::<*const Mapping>(b"mappings\0")?;
        let no_handlers = **library.get::<*const u32>(b"no_handlers\0")?;
        let handlers_ptr = *library.get::<*const BintrFunc>(b"unique_mappings\0")?;

        if mappings_ptr.is_null() || no_mappings > MAX_MAPPINGS {
            return Err(Error::InvalidProgram(
                "invalid mappings in binary translation program",
            ));
        }
        let mappings = std::slice::from_raw_parts(mappings_ptr, no_mappings as usize).to_vec();
        let handlers = std::slice::from_raw_parts(handlers_ptr, no_handlers as usize).to_vec();
        Ok(DylibSymbols {
            init,
            mappings,
            handlers,
        })
    }
}

/// Resolve the same manifest from an in-process compiled module.
pub fn read_module_symbols(module: &dyn CompiledModule) -> Result<DylibSymbols, Error> {
    let lookup = |name: &str| {
        module
            .lookup(name)
            .ok_or(Error::InvalidProgram("translation module missing symbol"))
    };
    unsafe {
        let init: InitFn = std::mem::transmute(lookup("init")?);
        let no_mappings = *(lookup("no_mappings")? as *const u32);
        let mappings_ptr = lookup("mappings")? as *const Mapping;
        let no_handlers = *(lookup("no_handlers")? as *const u32);
        let handlers_ptr = lookup("unique_mappings")? as *const BintrFunc;
        if no_mappings > MAX_MAPPINGS {
            return Err(Error::InvalidProgram(
                "invalid mappings in binary translation program",
            ));
        }
        Ok(DylibSymbols {
            init,
            mappings: std::slice::from_raw_parts(mappings_ptr, no_mappings as usize).to_vec(),
            handlers: std::slice::from_raw_parts(handlers_ptr, no_handlers as usize).to_vec(),
        })
    }
}

/// Guard installed in the slot after the last real mapping; dispatching it
/// means a translated entry referenced an index outside the manifest.
unsafe extern "C" fn invalid_mapping_guard(
    cpu: *mut Cpu,
    _counter: u64,
    _max_counter: u64,
    pc: u64,
) -> ReturnValues {
    cb_trigger_exception(cpu, pc, ExceptionKind::InvalidProgram as i32);
    ReturnValues {
        counter: 0,
        max_counter: 0,
    }
}

fn build_mapping_table(symbols: &DylibSymbols) -> Vec<BintrFunc> {
    let mut mappings = symbols.handlers.clone();
    mappings.push(invalid_mapping_guard);
    mappings
}

/// Activate a translation on a segment that is not executing yet.
pub fn activate_sync(
    ctx: &TranslateContext,
    seg: &mut ExecuteSegment,
    symbols: &DylibSymbols,
    keepalive: Option<Arc<dyn Any + Send + Sync>>,
    in_process: bool,
    table: CallbackTable,
) -> Result<(), Error> {
    unsafe { (symbols.init)(&table, ctx.arena_ptr as *mut u8) };

    let handler_count = symbols.handlers.len() as u32;
    for mapping in &symbols.mappings {
        if !seg.is_within(mapping.addr) {
            tracing::warn!(
                target: "bintr",
                addr = format_args!("{:#x}", mapping.addr),
                "translation mapping outside execute area"
            );
            continue;
        }
        let entry = seg.base_decoder_mut().entry_mut(mapping.addr);
        if mapping.mapping_index < handler_count {
            entry.raw_instr = mapping.mapping_index;
            entry.set_bytecode(bytecodes::BC_BLOCK_END);
        } else {
            entry.set_bytecode(bytecodes::BC_NORMAL);
        }
    }
    seg.set_translation(Translation {
        mappings: build_mapping_table(symbols),
        keepalive,
        in_process,
    })?;
    tracing::debug!(
        target: "bintr",
        mappings = symbols.mappings.len(),
        handlers = symbols.handlers.len(),
        "activated binary translation"
    );
    Ok(())
}

/// Activate a translation on a segment the interpreter may be running.
///
/// The live decoder is never mutated. A patched copy receives the mapping
/// rewrites plus corrected `idxend` chains; it is published, a full fence is
/// issued, and only then each original entry's bytecode is atomically set to
/// `BC_LIVEPATCH`. A reader observing the flip acquires the patched table
/// fully populated.
pub fn activate_live(
    ctx: &TranslateContext,
    seg: &Arc<ExecuteSegment>,
    symbols: &DylibSymbols,
    keepalive: Option<Arc<dyn Any + Send + Sync>>,
    in_process: bool,
    table: CallbackTable,
) -> Result<(), Error> {
    unsafe { (symbols.init)(&table, ctx.arena_ptr as *mut u8) };

    let stride = ctx.options.stride();
    let mut patched: DecoderTable = seg.base_decoder().clone();
    let mut flips: Vec<u64> = Vec::with_capacity(symbols.mappings.len());
    let handler_count = symbols.handlers.len() as u32;

    for mapping in &symbols.mappings {
        if !seg.is_within(mapping.addr) {
            tracing::warn!(
                target: "bintr",
                addr = format_args!("{:#x}", mapping.addr),
                "translation mapping outside execute area"
            );
            continue;
        }
        if mapping.mapping_index >= handler_count {
            patched
                .entry_mut(mapping.addr)
                .set_bytecode(bytecodes::BC_NORMAL);
            continue;
        }

        // The mapping replaces the last instruction of its straight-line
        // block. Walk back to the block head, following strictly growing
        // block_bytes(), then shorten every run to end at the patched slot.
        let mut current = mapping.addr;
        let mut last_block_bytes = patched.entry_at(current).block_bytes(stride);
        while current > seg.exec_begin() {
            let prev = patched.entry_at(current - stride).block_bytes(stride);
            if prev > last_block_bytes {
                current -= stride;
                last_block_bytes = prev;
            } else {
                break;
            }
        }
        if current < seg.exec_begin() || current >= seg.exec_end() {
            return Err(Error::InvalidProgram(
                "translation mapping outside execute area",
            ));
        }
        // Runs starting before the patched slot must end just before it, so
        // the next dispatch lands on the translated entry.
        let mut slot = current;
        while slot < mapping.addr {
            let entry = patched.entry_mut(slot);
            let distance = (mapping.addr - slot) / stride;
            entry.idxend = distance.saturating_sub(1).min(255) as u8;
            entry.icount = 0;
            slot += stride;
        }

        let entry = patched.entry_mut(mapping.addr);
        entry.set_bytecode(bytecodes::BC_BLOCK_END);
        entry.raw_instr = mapping.mapping_index;
        entry.idxend = 0;
        entry.icount = 0;
        flips.push(mapping.addr);
    }

    seg.set_translation(Translation {
        mappings: build_mapping_table(symbols),
        keepalive,
        in_process,
    })?;
    seg.set_patched_decoder(patched)?;

    // Publish before any flip becomes visible.
    fence(Ordering::SeqCst);
    for addr in &flips {
        seg.base_decoder()
            .entry_at(*addr)
            .set_bytecode_atomic(bytecodes::BC_LIVEPATCH);
    }
    tracing::debug!(
        target: "bintr",
        mappings = symbols.mappings.len(),
        patched = flips.len(),
        "live-patched binary translation"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TranslatorOptions;
    use crate::instr::enc;
    use crate::machine::{Arena, ArenaKind, CpuOffsets, Machine};
    use crate::predecode;

    unsafe extern "C" fn noop_init(_table: *const CallbackTable, _arena: *mut u8) {}

    unsafe extern "C" fn fake_block(
        cpu: *mut Cpu,
        counter: u64,
        max_counter: u64,
        _pc: u64,
    ) -> ReturnValues {
        // Models "ADDI x1, x0, 42; JALR x0, x0, 0".
        (*cpu).regs[1] = 42;
        (*cpu).pc = 0;
        ReturnValues {
            counter: counter + 2,
            max_counter,
        }
    }

    fn context(options: &TranslatorOptions) -> TranslateContext {
        TranslateContext {
            options: options.clone(),
            arena_kind: ArenaKind::Flat,
            arena_size: 0x10000,
            rodata_end: 0x2000,
            arena_ptr: 0,
            start_address: 0x1000,
            offsets: CpuOffsets::current(),
        }
    }

    fn interpreter_options() -> TranslatorOptions {
        TranslatorOptions {
            translate_enabled: false,
            translate_enable_embedded: false,
            ..Default::default()
        }
    }

    fn symbols(mappings: Vec<Mapping>) -> DylibSymbols {
        DylibSymbols {
            init: noop_init,
            mappings,
            handlers: vec![fake_block as BintrFunc],
        }
    }

    fn table() -> CallbackTable {
        Machine::new(interpreter_options(), Arena::flat(0x1000, 0)).callback_table()
    }

    #[test]
    fn test_activate_sync_installs_mappings_and_guard() {
        let options = interpreter_options();
        let code = enc::to_bytes(&[enc::addi(1, 0, 5), enc::jalr(0, 0, 0)]);
        let mut seg = ExecuteSegment::new(0x1000, &code, &options).unwrap();
        let ctx = context(&options);
        let syms = symbols(vec![Mapping {
            addr: 0x1000,
            mapping_index: 0,
        }]);
        activate_sync(&ctx, &mut seg, &syms, None, false, table()).unwrap();

        let entry = seg.base_decoder().entry_at(0x1000);
        assert_eq!(entry.bytecode(), bytecodes::BC_BLOCK_END);
        assert_eq!(entry.raw_instr, 0);
        assert!(seg.is_binary_translated());
        // One real mapping plus the guard slot.
        assert_eq!(seg.translation().unwrap().mappings.len(), 2);
        assert!(seg.mapping(1).is_some());
    }

    #[test]
    fn test_outside_mapping_is_skipped() {
        let options = interpreter_options();
        let code = enc::to_bytes(&[enc::addi(1, 0, 5), enc::jalr(0, 0, 0)]);
        let mut seg = ExecuteSegment::new(0x1000, &code, &options).unwrap();
        let ctx = context(&options);
        let syms = symbols(vec![Mapping {
            addr: 0x4000,
            mapping_index: 0,
        }]);
        activate_sync(&ctx, &mut seg, &syms, None, false, table()).unwrap();
        assert!(seg.is_binary_translated());
        assert_eq!(
            seg.base_decoder().entry_at(0x1000).bytecode(),
            bytecodes::BC_NORMAL
        );
    }

    #[test]
    fn test_live_patch_builds_patched_decoder() {
        let options = interpreter_options();
        let code = enc::to_bytes(&[
            enc::addi(1, 1, 1),
            enc::addi(2, 2, 2),
            enc::addi(3, 3, 3),
            enc::jalr(0, 0, 0),
        ]);
        let mut seg = ExecuteSegment::new(0x1000, &code, &options).unwrap();
        predecode::generate_decoder(&mut seg, &options).unwrap();
        predecode::realize_fastsim(&mut seg, &options);
        let seg = Arc::new(seg);

        let ctx = context(&options);
        let syms = symbols(vec![Mapping {
            addr: 0x1008,
            mapping_index: 0,
        }]);
        activate_live(&ctx, &seg, &syms, None, false, table()).unwrap();

        // The original table is untouched apart from the atomic flip.
        let original = seg.base_decoder();
        assert_eq!(original.entry_at(0x1008).bytecode(), bytecodes::BC_LIVEPATCH);
        assert_eq!(original.entry_at(0x1000).bytecode(), bytecodes::BC_NORMAL);
        assert_eq!(original.entry_at(0x1000).idxend, 2);

        // The patched copy ends every earlier run just before the patched
        // slot, so dispatch lands on the translated entry.
        let patched = seg.patched_decoder().unwrap();
        assert_eq!(patched.entry_at(0x1000).idxend, 1);
        assert_eq!(patched.entry_at(0x1004).idxend, 0);
        let hot = patched.entry_at(0x1008);
        assert_eq!(hot.bytecode(), bytecodes::BC_BLOCK_END);
        assert_eq!(hot.raw_instr, 0);
        assert_eq!(hot.idxend, 0);
        // The active decoder is now the patched one.
        assert!(std::ptr::eq(seg.decoder(), patched));
    }

    #[test]
    fn test_live_patch_handoff_dispatches_translated_code() {
        let mut machine = Machine::new(interpreter_options(), Arena::flat(0x10000, 0x2000));
        let code = enc::to_bytes(&[enc::addi(1, 0, 5), enc::jalr(0, 0, 0)]);
        let seg = machine.create_execute_segment(0x1000, &code).unwrap();

        let ctx = context(&interpreter_options());
        let syms = symbols(vec![Mapping {
            addr: 0x1000,
            mapping_index: 0,
        }]);
        let table = machine.callback_table();
        activate_live(&ctx, &seg, &syms, None, false, table).unwrap();

        machine.cpu.pc = 0x1000;
        machine.simulate(100).unwrap();
        // The fake translated block ran instead of the interpreter.
        assert_eq!(machine.reg(1), 42);
        assert_eq!(machine.cpu.pc, 0);
        assert!(machine.stopped());
        assert_eq!(machine.cpu.counter, 2);
    }

    #[test]
    fn test_guard_reports_invalid_program() {
        let mut machine = Machine::new(interpreter_options(), Arena::flat(0x1000, 0));
        let rv = unsafe {
            invalid_mapping_guard(&mut machine.cpu as *mut Cpu, 0, 0, 0x1234)
        };
        assert_eq!(rv.counter, 0);
        assert_eq!(
            machine.cpu.current_exception,
            ExceptionKind::InvalidProgram as i32
        );
        assert_eq!(machine.cpu.pc, 0x1234);
        assert!(machine.stopped());
    }
}
