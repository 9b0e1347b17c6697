//! Block discovery: partition a segment into translation units.
//!
//! The scan accumulates instructions until a block is large enough to split
//! at a stopping instruction, collects intra-block branch targets and global
//! JAL targets, and optionally recovers the global pointer so the emitter
//! can fold GP-relative accesses to fixed addresses.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::TranslatorOptions;
use crate::instr::{opcodes, CInstr, Instr, INSTR_STOP, REG_GP, SYSTEM_IMM_WFI};
use crate::instr::{C_ADDIW_OR_JAL, C_BEQZ, C_BNEZ, C_JMP};
use crate::segment::ExecuteSegment;

use super::types::{TransInfo, TranslateContext};

/// Minimum block size, in instructions, before a stopping instruction is
/// allowed to end the block.
pub const ITS_TIME_TO_SPLIT: usize = 1250;

/// JALR, the STOP pseudo, WFI, and C.JR/C.JALR end a translation unit.
pub fn is_stopping_instruction(instr: Instr, compressed: bool) -> bool {
    if instr.opcode() == opcodes::JALR
        || instr.0 == INSTR_STOP
        || (instr.opcode() == opcodes::SYSTEM
            && instr.funct3() == 0
            && instr.imm_i() == SYSTEM_IMM_WFI)
    {
        return true;
    }
    if compressed && instr.is_compressed() {
        return CInstr(instr.half()).is_jump_register();
    }
    false
}

/// Recover the global pointer from the `AUIPC gp` / `ADDI gp, gp` prologue
/// idiom. Returns 0 when no GP initialization is found.
pub fn scan_for_gp(
    seg: &ExecuteSegment,
    basepc: u64,
    endpc: u64,
    options: &TranslatorOptions,
) -> u64 {
    let mut pc = basepc;
    while pc < endpc {
        let instruction = seg.read_instr(pc);
        if instruction.opcode() == opcodes::AUIPC && instruction.rd() == REG_GP {
            let next = if pc + instruction.length() < endpc {
                Some(seg.read_instr(pc + 4))
            } else {
                None
            };
            if let Some(addi) = next {
                if addi.opcode() == opcodes::OP_IMM && addi.funct3() == 0 {
                    if addi.rd() == REG_GP && addi.rs1() == REG_GP {
                        return pc
                            .wrapping_add(instruction.upper_imm() as u64)
                            .wrapping_add(addi.signed_imm_i() as u64);
                    }
                } else {
                    return pc.wrapping_add(instruction.upper_imm() as u64);
                }
            } else {
                return pc.wrapping_add(instruction.upper_imm() as u64);
            }
        }
        pc += if options.compressed {
            instruction.length()
        } else {
            4
        };
    }
    0
}

/// Branch/jump classification used during target extraction.
fn jump_target(instr: Instr, pc: u64, compressed: bool, xlen: u32) -> Option<(bool, u64)> {
    match instr.opcode() {
        opcodes::JAL => Some((true, pc.wrapping_add(instr.jump_offset() as u64))),
        opcodes::BRANCH => Some((false, pc.wrapping_add(instr.signed_imm_b() as u64))),
        _ if compressed && instr.is_compressed() => {
            let ci = CInstr(instr.half());
            match ci.opcode() {
                C_JMP => Some((true, pc.wrapping_add(ci.cj_signed_imm() as u64))),
                // The same encoding is C.ADDIW on 64-bit, C.JAL on 32-bit.
                C_ADDIW_OR_JAL if xlen == 32 => {
                    Some((true, pc.wrapping_add(ci.cj_signed_imm() as u64)))
                }
                C_BEQZ | C_BNEZ => Some((false, pc.wrapping_add(ci.cb_signed_imm() as u64))),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Partition `[basepc, endpc)` into translation units.
///
/// Stops at `endpc`, at the instruction cap, or at the block cap. Each
/// returned `TransInfo` carries the full block list and the shared global
/// jump locations.
pub fn discover_blocks(
    seg: &ExecuteSegment,
    ctx: &TranslateContext,
    basepc: u64,
    endpc: u64,
) -> Vec<TransInfo> {
    let options = &ctx.options;
    let compressed = options.compressed;
    let gp = scan_for_gp(seg, basepc, endpc, options);
    tracing::debug!(target: "bintr", gp = format_args!("{gp:#x}"), "global pointer scan");

    let mut icounter: usize = 0;
    let mut global_jump_locations: HashSet<u64> = HashSet::new();
    let mut blocks: Vec<TransInfo> = Vec::new();

    // The program entry point is a global jump location when it is ours.
    if ctx.start_address >= basepc && ctx.start_address < endpc {
        global_jump_locations.insert(ctx.start_address);
    }

    let mut pc = basepc;
    while pc < endpc && icounter < options.translate_instr_max {
        let block = pc;
        let mut block_insns: usize = 0;

        while pc < endpc {
            let instruction = seg.read_instr(pc);
            pc += if compressed { instruction.length() } else { 4 };
            block_insns += 1;
            if block_insns >= ITS_TIME_TO_SPLIT && is_stopping_instruction(instruction, compressed)
            {
                break;
            }
        }
        let block_end = pc;

        // Collect the instruction sequence and the jump targets.
        let mut jump_locations: HashSet<u64> = HashSet::new();
        let mut instructions: Vec<Instr> = Vec::with_capacity(block_insns);
        let mut ipc = block;
        while ipc < block_end {
            let instruction = seg.read_instr(ipc);
            if let Some((is_jal, location)) =
                jump_target(instruction, ipc, compressed, options.xlen.bits())
            {
                if is_jal {
                    // Every JAL target is recorded to detect function calls.
                    global_jump_locations.insert(location);
                    if location >= block && location < block_end {
                        jump_locations.insert(location);
                    }
                } else if location >= block && location < block_end {
                    // Branches count only relative to the current block.
                    jump_locations.insert(location);
                }
            }
            instructions.push(instruction);
            ipc += if compressed { instruction.length() } else { 4 };
        }

        let length = instructions.len();
        if length > 0 && icounter + length < options.translate_instr_max {
            blocks.push(TransInfo {
                instructions,
                basepc: block,
                endpc: block_end,
                segment_basepc: basepc,
                segment_endpc: endpc,
                gp,
                trace_instructions: options.translate_trace,
                ignore_instruction_limit: options.translate_ignore_instruction_limit,
                use_shared_execute_segments: options.use_shared_execute_segments,
                jump_locations,
                blocks: Vec::new(),
                global_jump_locations: Arc::new(HashSet::new()),
                arena_ptr: ctx.arena_ptr,
            });
            icounter += length;
            if blocks.len() >= options.translate_blocks_max {
                break;
            }
        }
        pc = block_end;
    }

    // Fill in the cross-block context now that all blocks are known.
    let ranges: Vec<(u64, u64)> = blocks.iter().map(|b| (b.basepc, b.endpc)).collect();
    let global = Arc::new(global_jump_locations);
    for block in &mut blocks {
        block.blocks = ranges.clone();
        block.global_jump_locations = global.clone();
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::enc;
    use crate::machine::{ArenaKind, CpuOffsets};

    fn context(start: u64) -> TranslateContext {
        TranslateContext {
            options: TranslatorOptions::default(),
            arena_kind: ArenaKind::Flat,
            arena_size: 0x100000,
            rodata_end: 0x2000,
            arena_ptr: 0,
            start_address: start,
            offsets: CpuOffsets::current(),
        }
    }

    fn segment(words: &[u32]) -> ExecuteSegment {
        ExecuteSegment::new(0x1000, &enc::to_bytes(words), &TranslatorOptions::default()).unwrap()
    }

    #[test]
    fn test_stopping_instructions() {
        assert!(is_stopping_instruction(Instr(enc::jalr(0, 1, 0)), false));
        assert!(is_stopping_instruction(Instr(INSTR_STOP), false));
        assert!(is_stopping_instruction(
            Instr(crate::instr::INSTR_WFI),
            false
        ));
        assert!(!is_stopping_instruction(Instr(enc::addi(1, 0, 1)), false));
        assert!(!is_stopping_instruction(Instr(enc::jal(1, 8)), false));
        // C.JR only counts with compressed decoding.
        assert!(is_stopping_instruction(Instr(0x8082), true));
        assert!(!is_stopping_instruction(Instr(0x8082), false));
    }

    #[test]
    fn test_gp_recovery_with_addi() {
        // AUIPC x3, 0x10; ADDI x3, x3, 0x20; LW x5, 0(x3)
        let seg = segment(&[
            enc::auipc(3, 0x10),
            enc::addi(3, 3, 0x20),
            enc::load(0x2, 5, 3, 0),
            enc::jalr(0, 0, 0),
        ]);
        let gp = scan_for_gp(&seg, 0x1000, 0x1010, &TranslatorOptions::default());
        assert_eq!(gp, 0x1000 + 0x10000 + 0x20);
    }

    #[test]
    fn test_gp_recovery_auipc_only() {
        // AUIPC x3 followed by a non-OP-IMM instruction.
        let seg = segment(&[
            enc::auipc(3, 0x10),
            enc::load(0x2, 5, 3, 0),
            enc::jalr(0, 0, 0),
        ]);
        let gp = scan_for_gp(&seg, 0x1000, 0x100C, &TranslatorOptions::default());
        assert_eq!(gp, 0x1000 + 0x10000);
    }

    #[test]
    fn test_no_gp_found() {
        let seg = segment(&[enc::addi(1, 0, 1), enc::jalr(0, 0, 0)]);
        assert_eq!(
            scan_for_gp(&seg, 0x1000, 0x1008, &TranslatorOptions::default()),
            0
        );
    }

    #[test]
    fn test_single_block_discovery() {
        let seg = segment(&[
            enc::addi(1, 0, 10),
            enc::addi(1, 1, -1),
            enc::bne(1, 0, -4),
            enc::jalr(0, 0, 0),
        ]);
        let blocks = discover_blocks(&seg, &context(0x1000), 0x1000, 0x1010);
        assert_eq!(blocks.len(), 1);
        let b = &blocks[0];
        assert_eq!(b.basepc, 0x1000);
        assert_eq!(b.endpc, 0x1010);
        assert_eq!(b.instructions.len(), 4);
        // The backward branch target is an intra-block jump location.
        assert!(b.jump_locations.contains(&0x1004));
        // The entry point was seeded into the global set.
        assert!(b.global_jump_locations.contains(&0x1000));
        assert_eq!(b.blocks, vec![(0x1000, 0x1010)]);
    }

    #[test]
    fn test_jal_targets_are_global() {
        // JAL over the JALR into a second function.
        let seg = segment(&[
            enc::jal(1, 8),       // 0x1000 -> 0x1008
            enc::jalr(0, 1, 0),   // 0x1004
            enc::addi(2, 0, 7),   // 0x1008
            enc::jalr(0, 1, 0),   // 0x100C
        ]);
        let blocks = discover_blocks(&seg, &context(0x1000), 0x1000, 0x1010);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].global_jump_locations.contains(&0x1008));
        assert!(blocks[0].jump_locations.contains(&0x1008));
    }

    #[test]
    fn test_branch_target_at_endpc_is_not_local() {
        // BNE forward to exactly endpc: outside the block.
        let seg = segment(&[enc::bne(1, 0, 8), enc::jalr(0, 0, 0)]);
        let blocks = discover_blocks(&seg, &context(0x1000), 0x1000, 0x1008);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].jump_locations.is_empty());
    }

    #[test]
    fn test_block_splits_after_minimum_size() {
        // More than ITS_TIME_TO_SPLIT instructions followed by a JALR, twice.
        let mut words = Vec::new();
        for _ in 0..ITS_TIME_TO_SPLIT {
            words.push(enc::addi(1, 1, 1));
        }
        words.push(enc::jalr(0, 1, 0));
        let first_block_len = words.len();
        for _ in 0..8 {
            words.push(enc::addi(2, 2, 1));
        }
        words.push(enc::jalr(0, 1, 0));
        let seg = segment(&words);
        let end = 0x1000 + 4 * words.len() as u64;
        let blocks = discover_blocks(&seg, &context(0x1000), 0x1000, end);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].endpc, 0x1000 + 4 * first_block_len as u64);
        assert_eq!(blocks[1].basepc, blocks[0].endpc);
        assert_eq!(blocks[1].endpc, end);
        // Every block sees the full range list.
        assert_eq!(blocks[0].blocks.len(), 2);
    }

    #[test]
    fn test_instruction_cap_halts_scan() {
        let mut words = vec![enc::addi(1, 1, 1); 64];
        words.push(enc::jalr(0, 1, 0));
        let seg = segment(&words);
        let mut ctx = context(0x1000);
        ctx.options.translate_instr_max = 32;
        let end = 0x1000 + 4 * words.len() as u64;
        let blocks = discover_blocks(&seg, &ctx, 0x1000, end);
        // The single oversized block cannot be admitted under the cap.
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_block_cap() {
        let mut words = Vec::new();
        for _ in 0..2 {
            for _ in 0..ITS_TIME_TO_SPLIT {
                words.push(enc::addi(1, 1, 1));
            }
            words.push(enc::jalr(0, 1, 0));
        }
        let seg = segment(&words);
        let mut ctx = context(0x1000);
        ctx.options.translate_blocks_max = 1;
        let end = 0x1000 + 4 * words.len() as u64;
        let blocks = discover_blocks(&seg, &ctx, 0x1000, end);
        assert_eq!(blocks.len(), 1);
    }
}
