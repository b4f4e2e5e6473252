//! Prologue capture and relocation
//!
//! The patcher overwrites the first five bytes of the target with a
//! relative jump, so those instructions must keep living somewhere: the
//! stub builder walks whole instructions until at least five bytes are
//! covered, captures them verbatim, and re-encodes them position
//! independently for the trampoline. Targets whose prologue branches
//! back into the replaced bytes cannot be hooked.

use iced_x86::{BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, Instruction, InstructionBlock, OpKind};

use crate::error::{EngineError, EngineResult};
use crate::memory;

/// Bytes replaced by the `JMP rel32` at the entry point.
pub const JUMP_TO_HOOK_SIZE: usize = 5;

/// Verbatim prologue bytes captured before patching.
pub const MAX_CAPTURE: usize = 32;

/// Captured prologue of one hook target.
pub struct StubInfo {
    /// Original bytes at the hooked address.
    pub original: [u8; MAX_CAPTURE],
    pub captured_len: usize,
    /// Bytes covered by the instruction walk (>= 5).
    pub original_len: usize,
    /// Decoded prologue, relocated lazily once the slot address is known.
    pub instructions: Vec<Instruction>,
}

/// Step over unconditional jumps at `addr` so import thunks and
/// hot-patch stubs resolve to the real function body.
pub fn skip_jump_instructions(addr: usize, word: usize) -> usize {
    let mut addr = addr;
    // Bounded: thunk chains are short, loops here mean garbage.
    for _ in 0..8 {
        let mut bytes = [0u8; 6];
        if !memory::try_read_bytes(addr, &mut bytes) {
            break;
        }
        let next = match bytes[0] {
            0xE9 => {
                let rel = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
                Some(addr.wrapping_add(5).wrapping_add(rel as isize as usize))
            }
            0xEB => {
                let rel = bytes[1] as i8;
                Some(addr.wrapping_add(2).wrapping_add(rel as isize as usize))
            }
            0xFF if bytes[1] == 0x25 => {
                let disp = i32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
                let slot = if word == 8 {
                    // RIP-relative pointer slot.
                    addr.wrapping_add(6).wrapping_add(disp as isize as usize)
                } else {
                    // Absolute pointer slot.
                    disp as u32 as usize
                };
                memory::try_read_word(slot)
            }
            _ => None,
        };
        match next {
            Some(n) if n != 0 && n != addr => addr = n,
            _ => break,
        }
    }
    addr
}

/// Capture and decode the prologue at `hooked_addr`.
pub fn build_stub(hooked_addr: usize, bitness: u32) -> EngineResult<StubInfo> {
    let mut original = [0u8; MAX_CAPTURE];
    // A target near the end of a mapping may not have 32 readable bytes;
    // 19 still covers five bytes of maximal instructions.
    let captured_len = if memory::try_read_bytes(hooked_addr, &mut original) {
        MAX_CAPTURE
    } else if memory::try_read_bytes(hooked_addr, &mut original[..19]) {
        19
    } else {
        return Err(EngineError::DisassembleFailed(hooked_addr));
    };

    let mut decoder = Decoder::with_ip(
        bitness,
        &original[..captured_len],
        hooked_addr as u64,
        DecoderOptions::NONE,
    );
    let mut instructions: Vec<Instruction> = Vec::new();
    let mut original_len = 0usize;
    while original_len < JUMP_TO_HOOK_SIZE {
        if !decoder.can_decode() {
            return Err(EngineError::DisassembleFailed(hooked_addr));
        }
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(EngineError::DisassembleFailed(hooked_addr));
        }
        original_len += instr.len();
        instructions.push(instr);
    }

    // A branch whose target lands inside the replaced bytes would execute
    // the patch mid-jump after relocation; such prologues are unhookable.
    let replaced = hooked_addr as u64..(hooked_addr + original_len) as u64;
    for instr in &instructions {
        if let Some(target) = near_branch_target(instr) {
            if replaced.contains(&target) {
                return Err(EngineError::DisassembleFailed(hooked_addr));
            }
        }
    }

    Ok(StubInfo {
        original,
        captured_len,
        original_len,
        instructions,
    })
}

fn near_branch_target(instr: &Instruction) -> Option<u64> {
    for i in 0..instr.op_count() {
        match instr.op_kind(i) {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                return Some(instr.near_branch_target());
            }
            _ => {}
        }
    }
    None
}

/// Re-encode the captured prologue to run at `new_ip`, rewriting every
/// IP-relative operand.
pub fn relocate(instructions: &[Instruction], new_ip: u64, bitness: u32) -> EngineResult<Vec<u8>> {
    let block = InstructionBlock::new(instructions, new_ip);
    let result = BlockEncoder::encode(bitness, block, BlockEncoderOptions::NONE)
        .map_err(|_| EngineError::DisassembleFailed(new_ip as usize))?;
    Ok(result.code_buffer)
}

/// First 8 bytes of the patched entry point: `E9 rel32` into the
/// trampoline followed by the surviving original bytes.
pub fn make_modified_stub(
    original: &[u8; MAX_CAPTURE],
    hooked_addr: usize,
    trampoline: usize,
) -> EngineResult<[u8; 8]> {
    let rel = (trampoline as i64)
        .wrapping_sub(hooked_addr as i64)
        .wrapping_sub(JUMP_TO_HOOK_SIZE as i64);
    if rel > i32::MAX as i64 || rel < i32::MIN as i64 {
        return Err(EngineError::OutOfMemory);
    }
    let mut stub = [0u8; 8];
    stub.copy_from_slice(&original[..8]);
    stub[0] = 0xE9;
    stub[1..5].copy_from_slice(&(rel as i32).to_le_bytes());
    Ok(stub)
}
