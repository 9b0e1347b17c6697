//! Compilation backends for emitted translations.
//!
//! Three sinks: the host C compiler producing a shared object, a pluggable
//! in-process compiler producing an in-memory module, and the embeddable
//! source writer for compile-time linking. In-process compilation is
//! serialized by a process-wide mutex because such backends tend to keep
//! global state.

use std::collections::BTreeMap;
use std::ffi::c_void;
use std::path::Path;
use std::process::Command;

use parking_lot::Mutex;

use crate::error::Error;

use super::translate::CompileJob;
use super::types::TranslateContext;

/// An in-process compiler backend (for example a bundled TCC).
///
/// Implementations cannot rely on stack unwinding inside generated code;
/// the loader marks their modules so guest exceptions are captured into the
/// CPU record instead.
pub trait InProcessCompiler: Send + Sync {
    fn compile(
        &self,
        source: &str,
        defines: &BTreeMap<String, String>,
    ) -> Result<Box<dyn CompiledModule>, Error>;
}

/// A compiled in-memory module; symbols stay valid for its lifetime.
pub trait CompiledModule: Send + Sync {
    fn lookup(&self, symbol: &str) -> Option<*const c_void>;
}

static IN_PROCESS_MUTEX: Mutex<()> = Mutex::new(());

/// Compile through the in-process backend, serialized process-wide.
pub fn compile_in_process(
    backend: &dyn InProcessCompiler,
    job: &CompileJob,
) -> Result<Box<dyn CompiledModule>, Error> {
    let _guard = IN_PROCESS_MUTEX.lock();
    backend.compile(&job.source, &job.defines)
}

fn define_args(defines: &BTreeMap<String, String>) -> Vec<String> {
    defines
        .iter()
        .map(|(key, value)| format!("-D{key}={value}"))
        .collect()
}

fn run_compiler(command: &mut Command, what: &str) -> Result<(), Error> {
    let output = command
        .output()
        .map_err(|err| Error::Compile(format!("failed to run {what}: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Compile(format!(
            "{what} failed ({}): {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

/// Compile the translation into a shared object at `job.filename` with the
/// host compiler.
pub fn compile_shared_object(ctx: &TranslateContext, job: &CompileJob) -> Result<(), Error> {
    invoke_cc(
        &ctx.options.cc_command,
        &ctx.options.cc_extra_flags,
        job,
        Path::new(&job.filename),
    )
}

/// Produce one cross-compiled shared object with the given compiler.
pub fn cross_compile_shared_object(
    ctx: &TranslateContext,
    job: &CompileJob,
    command: &str,
    filename: &str,
) -> Result<(), Error> {
    invoke_cc(command, &ctx.options.cc_extra_flags, job, Path::new(filename))
}

fn invoke_cc(cc: &str, extra: &[String], job: &CompileJob, out: &Path) -> Result<(), Error> {
    let source_path = out.with_extension("c");
    std::fs::write(&source_path, &job.source)?;

    let start = std::time::Instant::now();
    let mut command = Command::new(cc);
    command
        .arg("-shared")
        .arg("-fPIC")
        .arg("-O2")
        .arg("-fvisibility=hidden")
        .arg("-w")
        .args(define_args(&job.defines))
        .arg("-x")
        .arg("c")
        .arg(&source_path)
        .arg("-o")
        .arg(out);
    for flag in extra {
        command.arg(flag);
    }
    let result = run_compiler(&mut command, cc);
    let _ = std::fs::remove_file(&source_path);
    tracing::debug!(
        target: "bintr",
        compiler = cc,
        output = %out.display(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        ok = result.is_ok(),
        "compiled translation"
    );
    result
}

/// Write a self-registering C source file for compile-time linking. When the
/// file is built into the embedder, its global constructor registers the
/// translation under the same hash the loader computes.
pub fn write_embeddable_source(
    path: &str,
    defines: &BTreeMap<String, String>,
    code: &str,
    dlmappings: &[super::types::TransMapping],
    hash: u32,
) -> Result<(), Error> {
    let mut out = String::new();
    out.push_str("#define EMBEDDABLE_CODE 1\n");
    for (key, value) in defines {
        out.push_str(&format!("#define {key} {value}\n"));
    }
    out.push_str(code);

    // Self-registration footer: mirror of the loader-side manifest.
    let mut indices: BTreeMap<&str, u32> = BTreeMap::new();
    let mut unique: Vec<&str> = Vec::new();
    let mut mapping_rows = String::new();
    for mapping in dlmappings {
        let index = match indices.get(mapping.symbol.as_str()) {
            Some(&idx) => idx,
            None => {
                let idx = unique.len() as u32;
                indices.insert(mapping.symbol.as_str(), idx);
                unique.push(mapping.symbol.as_str());
                idx
            }
        };
        mapping_rows.push_str(&format!("{{0x{:X}, {}}},\n", mapping.addr, index));
    }

    out.push_str(
        "\nextern void riscv_bintr_register_translation(uint32_t, const Mapping*, uint32_t, \
         const bintr_func*, uint32_t, void (*)(const struct CallbackTable*, uint8_t*));\n",
    );
    out.push_str("static __attribute__((constructor)) void register_translation(void) {\n");
    out.push_str("static const Mapping embedded_mappings[] = {\n");
    out.push_str(&mapping_rows);
    out.push_str("};\nstatic const bintr_func embedded_handlers[] = {\n");
    for symbol in &unique {
        out.push_str(&format!("    {symbol},\n"));
    }
    out.push_str("};\n");
    out.push_str(&format!(
        "riscv_bintr_register_translation({hash}u, embedded_mappings, {}, embedded_handlers, {}, init);\n",
        dlmappings.len(),
        unique.len()
    ));
    out.push_str("}\n");

    std::fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bintr::types::TransMapping;

    #[test]
    fn test_define_args_are_sorted_flags() {
        let mut defines = BTreeMap::new();
        defines.insert("RISCV_TRACING".to_string(), "1".to_string());
        defines.insert("RISCV_ARENA_END".to_string(), "4096".to_string());
        let args = define_args(&defines);
        assert_eq!(args, vec!["-DRISCV_ARENA_END=4096", "-DRISCV_TRACING=1"]);
    }

    #[test]
    fn test_embeddable_source_registers_itself() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rv64-00001234.c");
        let mut defines = BTreeMap::new();
        defines.insert("RISCV_TRANSLATION_DYLIB".to_string(), "8".to_string());
        let mappings = vec![
            TransMapping {
                addr: 0x1000,
                symbol: "f_1000".into(),
            },
            TransMapping {
                addr: 0x1008,
                symbol: "f_1000".into(),
            },
        ];
        write_embeddable_source(
            path.to_str().unwrap(),
            &defines,
            "/* code */\n",
            &mappings,
            0x1234,
        )
        .unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("#define EMBEDDABLE_CODE 1"));
        assert!(written.contains("#define RISCV_TRANSLATION_DYLIB 8"));
        assert!(written.contains("__attribute__((constructor))"));
        assert!(written.contains("{0x1000, 0},"));
        assert!(written.contains("{0x1008, 0},"));
        assert!(written.contains(
            "riscv_bintr_register_translation(4660u, embedded_mappings, 2, embedded_handlers, 1, init);"
        ));
    }

    #[test]
    fn test_missing_compiler_reports_error() {
        let job = CompileJob {
            source: "int main(void) { return 0; }\n".into(),
            defines: BTreeMap::new(),
            filename: "/tmp/never-written.so".into(),
            hash: 1,
        };
        let err = invoke_cc(
            "definitely-not-a-compiler-7f3a",
            &[],
            &job,
            Path::new("/tmp/never-written.so"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Compile(_)));
    }
}
