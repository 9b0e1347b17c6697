use thiserror::Error;

/// Exception kinds surfaced to emitted code through the callback table.
///
/// The numeric values are part of the translation ABI: the C preamble defines
/// matching constants and emitted code passes them to `api.trigger_exception`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExceptionKind {
    IllegalOpcode = 0,
    IllegalOperation = 1,
    InvalidProgram = 2,
    MisalignedInstruction = 3,
    MaxInstructionsReached = 4,
}

impl ExceptionKind {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ExceptionKind::IllegalOperation,
            2 => ExceptionKind::InvalidProgram,
            3 => ExceptionKind::MisalignedInstruction,
            4 => ExceptionKind::MaxInstructionsReached,
            _ => ExceptionKind::IllegalOpcode,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Empty segment, zero hash, mapping address outside the segment,
    /// or a bogus segment base address.
    #[error("invalid program: {0}")]
    InvalidProgram(&'static str),

    /// Re-translating an already-translated segment, or an invalid memory
    /// size reaching a callback.
    #[error("illegal operation: {0}")]
    IllegalOperation(&'static str),

    /// The per-segment handler-index table is full.
    #[error("handler table exhausted ({0} entries)")]
    MaxInstructionsReached(usize),

    /// A branch or jump target violates the alignment mask.
    #[error("misaligned instruction target: {0:#x}")]
    MisalignedInstruction(u64),

    /// A decoder slot resolved to the all-zero sentinel.
    #[error("illegal opcode at {0:#x}")]
    IllegalOpcode(u64),

    #[error("machine stopped by guest")]
    Stopped,

    #[error("compiler invocation failed: {0}")]
    Compile(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to load translation: {0}")]
    DylibLoad(#[from] libloading::Error),
}

impl From<ExceptionKind> for Error {
    fn from(kind: ExceptionKind) -> Self {
        match kind {
            ExceptionKind::IllegalOpcode => Error::IllegalOpcode(0),
            ExceptionKind::IllegalOperation => Error::IllegalOperation("guest exception"),
            ExceptionKind::InvalidProgram => Error::InvalidProgram("guest exception"),
            ExceptionKind::MisalignedInstruction => Error::MisalignedInstruction(0),
            ExceptionKind::MaxInstructionsReached => Error::MaxInstructionsReached(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_kind_roundtrip() {
        for kind in [
            ExceptionKind::IllegalOpcode,
            ExceptionKind::IllegalOperation,
            ExceptionKind::InvalidProgram,
            ExceptionKind::MisalignedInstruction,
            ExceptionKind::MaxInstructionsReached,
        ] {
            assert_eq!(ExceptionKind::from_code(kind as i32), kind);
        }
    }

    #[test]
    fn test_error_display() {
        let err = Error::MisalignedInstruction(0x1005);
        assert!(err.to_string().contains("0x1005"));
    }
}
