//! Trampoline instantiation
//!
//! Copies the architecture template into an allocated slot and sweeps it
//! word by word, replacing each sentinel with the concrete value it
//! names. The two machine words behind the executable part become the
//! flags word and the usage counter.

use crate::entry::TrampolineInfo;
use crate::error::{EngineError, EngineResult};
use crate::memory;
use crate::stub;
use crate::template::{self, Sentinel, Template};

/// Per-hook inputs for one instantiation.
pub struct TrampolineSpec<'a> {
    pub engine_ptr: usize,
    pub entry_ptr: usize,
    pub pre_call: usize,
    pub post_call: usize,
    pub hooked_addr: usize,
    pub original: &'a [u8; stub::MAX_CAPTURE],
    pub original_stub_len: usize,
    pub stack_return_size: Option<u32>,
    pub instructions: &'a [iced_x86::Instruction],
}

/// Instantiate `tpl` into `slot` and return the resolved addresses.
///
/// The modified entry-point stub is part of the result so install and
/// uninstall compare against exactly what was written.
pub fn write_trampoline(
    tpl: &Template,
    slot: usize,
    slot_size: usize,
    spec: &TrampolineSpec<'_>,
) -> EngineResult<TrampolineInfo> {
    let word = tpl.word;
    let base_len = tpl.base_len();
    let total_len = tpl.raw_slot_len();
    if total_len > slot_size {
        return Err(EngineError::OutOfMemory);
    }

    unsafe {
        std::ptr::copy_nonoverlapping(tpl.code().as_ptr(), slot as *mut u8, base_len);
        std::ptr::write_bytes((slot + base_len) as *mut u8, 0, 2 * word);
    }
    let flags_addr = slot + base_len;
    let counter_addr = slot + base_len + word;

    let mut after_call_mark = 0usize;
    let mut stub_written = false;
    let mut k = 0usize;
    while k + word <= base_len {
        let here = slot + k;
        let value = read_word(word, here);
        let sentinel = match sentinel_id(word, value) {
            Some(s) => s,
            None => {
                k += 1;
                continue;
            }
        };
        match sentinel {
            Sentinel::UsageCounter => write_word(word, here, counter_addr as u64),
            Sentinel::FlagsWord => write_word(word, here, flags_addr as u64),
            Sentinel::Engine => write_word(word, here, spec.engine_ptr as u64),
            Sentinel::Entry => write_word(word, here, spec.entry_ptr as u64),
            Sentinel::PreCall => write_word(word, here, spec.pre_call as u64),
            Sentinel::PostCall => write_word(word, here, spec.post_call as u64),
            Sentinel::Stub => {
                write_stub_block(word, here, spec)?;
                stub_written = true;
                k += template::stub_block_len(word);
                continue;
            }
            Sentinel::AfterCallMark => {
                // The sentinel bytes stay; they are never executed.
                after_call_mark = here + word;
            }
            Sentinel::StackPreserve => {
                let preserve = template::calc_stack_preserve(word, spec.stack_return_size);
                write_word(word, here, preserve as u64);
            }
            Sentinel::StackPreserve2 => {
                // `ret imm16` operand: bytes the skip path pops.
                write_word(word, here, 0);
                let pop = spec.stack_return_size.unwrap_or(0) as u16;
                unsafe { (here as *mut u8).cast::<u16>().write_unaligned(pop.to_le()) };
            }
        }
        k += word;
    }

    if !stub_written || after_call_mark == 0 {
        return Err(EngineError::DisassembleFailed(spec.hooked_addr));
    }
    // The mark must sit strictly inside the trampoline.
    if after_call_mark <= slot || after_call_mark >= slot + total_len {
        return Err(EngineError::DisassembleFailed(spec.hooked_addr));
    }

    memory::flush_instruction_cache(slot, total_len);

    let modified_stub = stub::make_modified_stub(spec.original, spec.hooked_addr, slot)?;

    Ok(TrampolineInfo {
        base: slot,
        len: total_len,
        after_call_mark,
        flags_addr,
        counter_addr,
        modified_stub,
    })
}

/// Relocate the captured prologue into the reserved block and emit the
/// jump back into the target body.
fn write_stub_block(word: usize, at: usize, spec: &TrampolineSpec<'_>) -> EngineResult<()> {
    let bitness = if word == 8 { 64 } else { 32 };
    let relocated = stub::relocate(spec.instructions, at as u64, bitness)?;
    if relocated.len() > template::STUB_RESERVE {
        return Err(EngineError::DisassembleFailed(spec.hooked_addr));
    }
    unsafe {
        std::ptr::copy_nonoverlapping(relocated.as_ptr(), at as *mut u8, relocated.len());
    }
    let resume = spec.hooked_addr + spec.original_stub_len;
    let jump_at = at + relocated.len();
    if word == 8 {
        // JMP [RIP+0] with the absolute target appended.
        let mut tail = [0u8; 14];
        tail[..6].copy_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
        tail[6..].copy_from_slice(&(resume as u64).to_le_bytes());
        unsafe { std::ptr::copy_nonoverlapping(tail.as_ptr(), jump_at as *mut u8, tail.len()) };
    } else {
        let rel = (resume as i64)
            .wrapping_sub(jump_at as i64)
            .wrapping_sub(5);
        let mut tail = [0u8; 5];
        tail[0] = 0xE9;
        tail[1..].copy_from_slice(&(rel as i32).to_le_bytes());
        unsafe { std::ptr::copy_nonoverlapping(tail.as_ptr(), jump_at as *mut u8, tail.len()) };
    }
    Ok(())
}

fn sentinel_id(word: usize, value: u64) -> Option<Sentinel> {
    let base = template::sentinel_value(word, 0);
    if value & !0xFF != base {
        return None;
    }
    match (value & 0xFF) as u8 {
        0x01 => Some(Sentinel::UsageCounter),
        0x02 => Some(Sentinel::FlagsWord),
        0x03 => Some(Sentinel::Engine),
        0x04 => Some(Sentinel::Entry),
        0x05 => Some(Sentinel::PreCall),
        0x06 => Some(Sentinel::PostCall),
        0x07 => Some(Sentinel::Stub),
        0x08 => Some(Sentinel::AfterCallMark),
        0x09 => Some(Sentinel::StackPreserve),
        0x10 => Some(Sentinel::StackPreserve2),
        _ => None,
    }
}

fn read_word(word: usize, addr: usize) -> u64 {
    unsafe {
        if word == 8 {
            (addr as *const u64).read_unaligned()
        } else {
            (addr as *const u32).read_unaligned() as u64
        }
    }
}

fn write_word(word: usize, addr: usize, value: u64) {
    unsafe {
        if word == 8 {
            (addr as *mut u64).write_unaligned(value);
        } else {
            (addr as *mut u32).write_unaligned(value as u32);
        }
    }
}
