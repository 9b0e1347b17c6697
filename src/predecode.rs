//! Pre-decoder and fast-sim realizer.
//!
//! The pre-decoder walks the segment once, resolving and interning a handler
//! for every valid instruction start and caching the (possibly rewritten)
//! instruction word. The realizer then computes per-entry `idxend` so the
//! dispatch loop can run a whole straight-line block without per-step
//! boundary checks.

use crate::config::TranslatorOptions;
use crate::decoder::{bytecodes, FASTSIM_BLOCK_END};
use crate::error::Error;
use crate::instr::{opcodes, CInstr, Instr};
use crate::segment::ExecuteSegment;
use crate::decode;

/// Opcodes that end a straight-line run: everything that can modify PC, plus
/// AUIPC (rewriting concerns) and SYSTEM.
fn ends_block(opcode: u32) -> bool {
    matches!(
        opcode,
        opcodes::BRANCH | opcodes::SYSTEM | opcodes::JAL | opcodes::JALR | opcodes::AUIPC
    )
}

/// Fill the decoder table for every valid instruction start in the segment.
///
/// Entries set by a translation activation (bytecode `BC_BLOCK_END`) are
/// preserved and stepped over by 4, so the interpreter can never fall
/// through into a slot whose semantics live in host code. With compressed
/// decoding, the slot between the halves of a 4-byte instruction is left at
/// its zero default and is therefore illegal to enter.
pub fn generate_decoder(
    seg: &mut ExecuteSegment,
    options: &TranslatorOptions,
) -> Result<(), Error> {
    let begin = seg.exec_begin();
    let end = seg.exec_end();
    let translated = seg.is_binary_translated();
    let compressed = options.compressed;

    let mut pc = begin;
    while pc < end {
        if translated {
            let entry = seg.base_decoder().entry_at(pc);
            if entry.bytecode() == bytecodes::BC_BLOCK_END {
                // The mapping index lives in raw_instr; keep it and make the
                // slot a block end for the realizer.
                let entry = seg.base_decoder_mut().entry_mut(pc);
                entry.opcode_length = 4;
                entry.idxend = 0;
                pc += 4;
                continue;
            }
        }

        let instruction = seg.read_instr(pc);
        // The rewriter may substitute an equivalent form, but never once a
        // translation is attached: the translator encoded original words.
        let rewritten = if options.decoder_rewriter_enabled && !translated {
            decode::rewrite_idioms(instruction)
        } else {
            instruction
        };
        let handler = decode::resolve(rewritten);
        let index = seg.handlers_mut().intern(handler)?;

        let entry = seg.base_decoder_mut().entry_mut(pc);
        entry.raw_instr = rewritten.0;
        entry.handler = index;
        entry.idxend = 0;
        entry.icount = 0;
        entry.opcode_length = instruction.length() as u8;

        if compressed {
            // Stepping by the instruction length leaves the slot between the
            // halves of a full instruction zeroed (illegal).
            pc += instruction.length();
        } else {
            pc += 4;
        }
    }
    Ok(())
}

/// Compute `idxend` (and `icount`) so the interpreter can execute a
/// straight-line run with a single dispatch.
pub fn realize_fastsim(seg: &mut ExecuteSegment, options: &TranslatorOptions) {
    if options.compressed {
        realize_compressed(seg, options);
    } else {
        realize_full_width(seg);
    }
}

/// Single backward pass: store the running distance, then reset at stoppers.
fn realize_full_width(seg: &mut ExecuteSegment) {
    let begin = seg.exec_begin();
    let end = seg.exec_end();
    let len = end - begin;
    if len < 4 {
        return;
    }
    let last = begin + (len - 1) / 4 * 4;
    let decoder = seg.base_decoder_mut();

    let mut idxend: u64 = 0;
    let mut pc = last;
    loop {
        let entry = decoder.entry_mut(pc);
        let instr = Instr(entry.raw_instr);
        let translated = entry.bytecode() == bytecodes::BC_BLOCK_END;
        entry.idxend = idxend.min(255) as u8;
        if translated || entry.raw_instr == FASTSIM_BLOCK_END || ends_block(instr.opcode()) {
            idxend = 0;
        } else {
            idxend = (idxend + 1).min(255);
        }
        if pc == begin {
            break;
        }
        pc -= 4;
    }
}

/// Forward pass that groups slots into blocks, recording total halfword
/// lengths, then fills `idxend`/`icount` per entry.
fn realize_compressed(seg: &mut ExecuteSegment, options: &TranslatorOptions) {
    let begin = seg.exec_begin();
    let end = seg.exec_end();
    let xlen = options.xlen.bits();
    let decoder = seg.base_decoder_mut();

    let mut pc = begin;
    while pc < end {
        // Gather one block: instruction starts and the total halfword count.
        let mut starts: Vec<u64> = Vec::new();
        let mut datalength: u64 = 0;
        while pc < end {
            let entry = decoder.entry_at(pc);
            let length = (entry.opcode_length as u64).max(2);
            starts.push(pc);
            datalength += length / 2;
            let translated = entry.bytecode() == bytecodes::BC_BLOCK_END;
            let raw = entry.raw_instr;
            pc += length;
            if translated || raw == FASTSIM_BLOCK_END {
                break;
            }
            if length == 2 {
                if !CInstr(raw as u16).is_regular(xlen) {
                    break;
                }
            } else if ends_block(Instr(raw).opcode()) {
                break;
            }
        }

        // Fill the recorded entries: idxend counts remaining halfwords,
        // icount packs the remaining-instruction difference.
        let total = starts.len() as u64;
        let mut remaining_halves = datalength;
        for (i, &spc) in starts.iter().enumerate() {
            let entry = decoder.entry_mut(spc);
            let length = (entry.opcode_length as u64).max(2);
            entry.idxend = remaining_halves.min(255) as u8;
            let remaining_instrs = total - i as u64;
            entry.icount = (remaining_halves + 1)
                .saturating_sub(remaining_instrs)
                .min(255) as u8;
            remaining_halves -= length / 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::enc;

    fn options() -> TranslatorOptions {
        TranslatorOptions {
            translate_enabled: false,
            translate_enable_embedded: false,
            ..Default::default()
        }
    }

    fn build(code: &[u8], options: &TranslatorOptions) -> ExecuteSegment {
        let mut seg = ExecuteSegment::new(0x1000, code, options).unwrap();
        generate_decoder(&mut seg, options).unwrap();
        realize_fastsim(&mut seg, options);
        seg
    }

    #[test]
    fn test_every_instruction_start_has_a_handler() {
        let code = enc::to_bytes(&[
            enc::addi(1, 0, 10),
            enc::addi(1, 1, -1),
            enc::bne(1, 0, -4),
            enc::jalr(0, 0, 0),
        ]);
        let opts = options();
        let seg = build(&code, &opts);
        for pc in (0x1000u64..0x1010).step_by(4) {
            assert!(seg.base_decoder().entry_at(pc).is_set(), "{pc:#x}");
        }
    }

    #[test]
    fn test_idxend_backward_pass() {
        let code = enc::to_bytes(&[
            enc::addi(1, 0, 10), // idxend 1: heads a run of two
            enc::addi(1, 1, -1), // idxend 0
            enc::bne(1, 0, -4),  // idxend 0: stopper, then JALR resets again
            enc::jalr(0, 0, 0),  // idxend 0
        ]);
        let opts = options();
        let seg = build(&code, &opts);
        let dec = seg.base_decoder();
        assert_eq!(dec.entry_at(0x1000).idxend, 1);
        assert_eq!(dec.entry_at(0x1004).idxend, 0);
        assert_eq!(dec.entry_at(0x1008).idxend, 0);
        assert_eq!(dec.entry_at(0x100C).idxend, 0);
        // Monotonic decrease by one across the straight-line run.
        assert_eq!(dec.entry_at(0x1000).instruction_count(), 2);
    }

    #[test]
    fn test_auipc_ends_runs() {
        let code = enc::to_bytes(&[
            enc::addi(1, 0, 1),
            enc::auipc(3, 0x10),
            enc::addi(2, 0, 2),
            enc::jalr(0, 0, 0),
        ]);
        let opts = options();
        let seg = build(&code, &opts);
        // The ADDI before AUIPC must not run past it.
        assert_eq!(seg.base_decoder().entry_at(0x1000).idxend, 0);
        // AUIPC heads the fall-through run to the next stopper.
        assert_eq!(seg.base_decoder().entry_at(0x1004).idxend, 1);
    }

    #[test]
    fn test_idxend_saturates_at_255() {
        let mut words = vec![enc::addi(1, 1, 1); 300];
        words.push(enc::jalr(0, 0, 0));
        let code = enc::to_bytes(&words);
        let opts = options();
        let seg = build(&code, &opts);
        assert_eq!(seg.base_decoder().entry_at(0x1000).idxend, 255);
        // Entries close to the end carry exact distances.
        assert_eq!(seg.base_decoder().entry_at(0x1000 + 299 * 4).idxend, 1);
    }

    #[test]
    fn test_rewriter_canonicalizes_moves() {
        // ADD x5, x6, x0 is cached as the ADDI move form.
        let code = enc::to_bytes(&[enc::op(0, 0, 5, 6, 0), enc::jalr(0, 0, 0)]);
        let opts = options();
        let seg = build(&code, &opts);
        let cached = Instr(seg.base_decoder().entry_at(0x1000).raw_instr);
        assert_eq!(cached.opcode(), opcodes::OP_IMM);
        // With the rewriter disabled the original word is cached.
        let mut opts = options();
        opts.decoder_rewriter_enabled = false;
        let seg = build(&code, &opts);
        let cached = Instr(seg.base_decoder().entry_at(0x1000).raw_instr);
        assert_eq!(cached.opcode(), opcodes::OP);
    }

    #[test]
    fn test_translated_entries_are_preserved() {
        use crate::segment::Translation;
        let code = enc::to_bytes(&[
            enc::addi(1, 0, 1),
            enc::addi(2, 0, 2),
            enc::jalr(0, 0, 0),
        ]);
        let opts = options();
        let mut seg = ExecuteSegment::new(0x1000, &code, &opts).unwrap();
        // Simulate an activation that mapped 0x1004 to mapping index 0.
        seg.set_translation(Translation {
            mappings: Vec::new(),
            keepalive: None,
            in_process: false,
        })
        .unwrap();
        {
            let entry = seg.base_decoder_mut().entry_mut(0x1004);
            entry.raw_instr = 0;
            entry.set_bytecode(bytecodes::BC_BLOCK_END);
        }
        generate_decoder(&mut seg, &opts).unwrap();
        realize_fastsim(&mut seg, &opts);

        let dec = seg.base_decoder();
        // The mapping slot survived pre-decoding and stays unset.
        assert_eq!(dec.entry_at(0x1004).bytecode(), bytecodes::BC_BLOCK_END);
        assert!(!dec.entry_at(0x1004).is_set());
        // The preceding entry must not run into the translated slot.
        assert_eq!(dec.entry_at(0x1000).idxend, 0);
        // Ordinary entries were still decoded.
        assert!(dec.entry_at(0x1000).is_set());
        assert!(dec.entry_at(0x1008).is_set());
    }

    // ── Compressed mode ────────────────────────────────────────────────────

    fn compressed_options() -> TranslatorOptions {
        TranslatorOptions {
            compressed: true,
            translate_enabled: false,
            translate_enable_embedded: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_compressed_midslot_is_illegal() {
        // A full-width ADDI followed by C.NOP and a C.JR.
        let mut code = enc::to_bytes(&[enc::addi(1, 0, 5)]);
        code.extend_from_slice(&0x0001u16.to_le_bytes()); // C.NOP
        code.extend_from_slice(&0x8082u16.to_le_bytes()); // C.JR x1
        let opts = compressed_options();
        let seg = build(&code, &opts);
        let dec = seg.base_decoder();
        assert!(dec.entry_at(0x1000).is_set());
        // Slot between the halves of the ADDI stays zeroed.
        assert!(!dec.entry_at(0x1002).is_set());
        assert!(dec.entry_at(0x1004).is_set());
        assert!(dec.entry_at(0x1006).is_set());
    }

    #[test]
    fn test_compressed_block_packing() {
        // ADDI (4 bytes) + C.NOP (2) + C.JR (2): one block of 4 halfwords
        // holding three instructions.
        let mut code = enc::to_bytes(&[enc::addi(1, 0, 5)]);
        code.extend_from_slice(&0x0001u16.to_le_bytes());
        code.extend_from_slice(&0x8082u16.to_le_bytes());
        let opts = compressed_options();
        let seg = build(&code, &opts);
        let dec = seg.base_decoder();

        let first = dec.entry_at(0x1000);
        assert_eq!(first.idxend, 4);
        assert_eq!(first.opcode_length, 4);
        // idxend + 1 - icount = instructions remaining in the block.
        assert_eq!(first.instruction_count(), 3);

        let second = dec.entry_at(0x1004);
        assert_eq!(second.idxend, 2);
        assert_eq!(second.opcode_length, 2);
        assert_eq!(second.instruction_count(), 2);

        let last = dec.entry_at(0x1006);
        assert_eq!(last.idxend, 1);
        assert_eq!(last.instruction_count(), 1);
    }

    #[test]
    fn test_compressed_trailing_halfword_decodes() {
        // Segment ending in a lone halfword: the last 2 bytes still decode.
        let mut code = enc::to_bytes(&[enc::addi(1, 0, 5)]);
        code.extend_from_slice(&0x4505u16.to_le_bytes()); // C.LI x10, 1
        let opts = compressed_options();
        let seg = build(&code, &opts);
        let entry = seg.base_decoder().entry_at(0x1004);
        assert!(entry.is_set());
        assert_eq!(entry.opcode_length, 2);
    }

    #[test]
    fn test_compressed_irregular_ends_block() {
        // C.NOP, C.J +0, C.NOP: the jump ends the first block.
        let mut code = Vec::new();
        code.extend_from_slice(&0x0001u16.to_le_bytes()); // C.NOP
        code.extend_from_slice(&0xA001u16.to_le_bytes()); // C.J .
        code.extend_from_slice(&0x0001u16.to_le_bytes()); // C.NOP
        code.extend_from_slice(&0x8082u16.to_le_bytes()); // C.JR x1
        let opts = compressed_options();
        let seg = build(&code, &opts);
        let dec = seg.base_decoder();
        // First block spans the first two halfwords.
        assert_eq!(dec.entry_at(0x1000).idxend, 2);
        assert_eq!(dec.entry_at(0x1002).idxend, 1);
        // Second block restarts after the jump.
        assert_eq!(dec.entry_at(0x1004).idxend, 2);
        assert_eq!(dec.entry_at(0x1006).idxend, 1);
    }
}
