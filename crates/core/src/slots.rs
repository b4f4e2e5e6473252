//! Near-target executable slot allocator
//!
//! Trampolines must be reachable from the hooked function with a 32-bit
//! relative jump, so executable memory is reserved in 64 KiB blocks
//! inside a ±1 GiB window around the first hook that needs the block.
//! Each block sub-allocates fixed-size slots through a free list threaded
//! through the slots themselves: the first machine word of a free slot
//! holds the address of the next free slot.

use crate::error::{EngineError, EngineResult};

/// Reserved-committed block size.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Window radius around the reference address.
pub const NEAR_WINDOW: usize = 0x4000_0000;

const WORD: usize = std::mem::size_of::<usize>();

struct Block {
    base: usize,
    slot_count: usize,
    free_count: usize,
    /// Address of the first free slot, 0 when the block is exhausted.
    free_head: usize,
}

// SAFETY: blocks are raw memory owned by the allocator, which itself
// lives behind the engine lock.
unsafe impl Send for Block {}

pub struct SlotAllocator {
    slot_size: usize,
    blocks: Vec<Block>,
}

impl SlotAllocator {
    /// Create an allocator for slots able to hold `raw_len` bytes.
    ///
    /// The slot size is `raw_len` rounded up to a power of two, floored
    /// at one machine word so the free-list link fits, and is fixed for
    /// the lifetime of the allocator.
    pub fn new(raw_len: usize) -> EngineResult<Self> {
        let mut size = raw_len.max(WORD);
        // Round up to a power of two.
        size = size.checked_next_power_of_two().ok_or(EngineError::OutOfMemory)?;
        if size > BLOCK_SIZE {
            return Err(EngineError::OutOfMemory);
        }
        Ok(Self {
            slot_size: size,
            blocks: Vec::new(),
        })
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Reserve a slot within ±1 GiB of `near`. Returns `None` only when
    /// the window contains no free virtual memory.
    pub fn alloc(&mut self, near: usize) -> Option<usize> {
        let idx = match self.find_block(near) {
            Some(idx) => idx,
            None => {
                let base = alloc_block_near(near)?;
                self.blocks.push(Block::init(base, self.slot_size));
                self.blocks.len() - 1
            }
        };
        let block = &mut self.blocks[idx];
        let slot = block.free_head;
        debug_assert!(slot != 0);
        // The first word of the free slot links to the next one.
        block.free_head = unsafe { (slot as *const usize).read() };
        block.free_count -= 1;
        Some(slot)
    }

    /// Return a slot to its owning block; fully free blocks are released
    /// back to the OS.
    pub fn free(&mut self, slot: usize) {
        let Some(idx) = self
            .blocks
            .iter()
            .position(|b| slot >= b.base && slot < b.base + BLOCK_SIZE)
        else {
            tracing::warn!("freeing slot {slot:#x} not owned by any block");
            return;
        };
        let block = &mut self.blocks[idx];
        debug_assert_eq!((slot - block.base) % self.slot_size, 0);
        unsafe { (slot as *mut usize).write(block.free_head) };
        block.free_head = slot;
        block.free_count += 1;
        if block.free_count == block.slot_count {
            let base = block.base;
            self.blocks.swap_remove(idx);
            free_block(base);
        }
    }

    /// Whether `addr` lies inside any live block.
    pub fn owns(&self, addr: usize) -> bool {
        self.blocks
            .iter()
            .any(|b| addr >= b.base && addr < b.base + BLOCK_SIZE)
    }

    fn find_block(&self, near: usize) -> Option<usize> {
        self.blocks.iter().position(|b| {
            b.free_head != 0 && in_window(b.base, near)
        })
    }
}

impl Drop for SlotAllocator {
    fn drop(&mut self) {
        // Blocks still holding live slots stay mapped: installed or
        // leaked trampolines may be mid-execution on another thread.
        for block in self.blocks.drain(..) {
            if block.free_count == block.slot_count {
                free_block(block.base);
            }
        }
    }
}

impl Block {
    fn init(base: usize, slot_size: usize) -> Self {
        let slot_count = BLOCK_SIZE / slot_size;
        // Thread the free list through the slots.
        unsafe {
            let mut slot = base;
            for _ in 0..slot_count - 1 {
                (slot as *mut usize).write(slot + slot_size);
                slot += slot_size;
            }
            (slot as *mut usize).write(0);
        }
        Self {
            base,
            slot_count,
            free_count: slot_count,
            free_head: base,
        }
    }
}

fn in_window(base: usize, near: usize) -> bool {
    // On 32-bit every address is reachable with a rel32.
    if WORD == 4 {
        return true;
    }
    near.abs_diff(base) < NEAR_WINDOW
}

#[cfg(unix)]
fn alloc_block_near(near: usize) -> Option<usize> {
    use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
    use std::num::NonZeroUsize;

    let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC;
    let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
    let len = NonZeroUsize::new(BLOCK_SIZE)?;

    if WORD == 8 {
        let start = near.saturating_sub(NEAR_WINDOW) & !(BLOCK_SIZE - 1);
        let end = near.saturating_add(NEAR_WINDOW);
        let step = BLOCK_SIZE.max(page_size::get());
        let mut hint = start.max(step);
        while hint < end {
            let mapped = unsafe { mmap_anonymous(NonZeroUsize::new(hint), len, prot, flags) };
            if let Ok(ptr) = mapped {
                let base = ptr.as_ptr() as usize;
                if in_window(base, near) {
                    return Some(base);
                }
                // The kernel ignored the hint and placed us out of range.
                unsafe {
                    let _ = munmap(ptr, BLOCK_SIZE);
                }
            }
            hint += step;
        }
        tracing::error!("no executable block available near {near:#x}");
        return None;
    }

    match unsafe { mmap_anonymous(None, len, prot, flags) } {
        Ok(ptr) => Some(ptr.as_ptr() as usize),
        Err(e) => {
            tracing::error!("executable block reservation failed: {e}");
            None
        }
    }
}

#[cfg(windows)]
fn alloc_block_near(near: usize) -> Option<usize> {
    use windows::Win32::System::Memory::{
        VirtualAlloc, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_FREE, MEM_RESERVE,
        PAGE_EXECUTE_READWRITE,
    };

    if WORD == 8 {
        let mut probe = (near.saturating_sub(NEAR_WINDOW)) & !(BLOCK_SIZE - 1);
        let end = near.saturating_add(NEAR_WINDOW);
        while probe < end {
            let mut info = MEMORY_BASIC_INFORMATION::default();
            let got = unsafe {
                VirtualQuery(
                    Some(probe as *const _),
                    &mut info,
                    std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if got != 0 && info.State == MEM_FREE {
                let base = unsafe {
                    VirtualAlloc(
                        Some(probe as *const _),
                        BLOCK_SIZE,
                        MEM_RESERVE | MEM_COMMIT,
                        PAGE_EXECUTE_READWRITE,
                    )
                };
                if !base.is_null() && in_window(base as usize, near) {
                    return Some(base as usize);
                }
            }
            probe += BLOCK_SIZE;
        }
        tracing::error!("no executable block available near {near:#x}");
        return None;
    }

    let base = unsafe {
        VirtualAlloc(None, BLOCK_SIZE, MEM_RESERVE | MEM_COMMIT, PAGE_EXECUTE_READWRITE)
    };
    if base.is_null() {
        None
    } else {
        Some(base as usize)
    }
}

#[cfg(unix)]
fn free_block(base: usize) {
    if let Some(ptr) = std::ptr::NonNull::new(base as *mut std::ffi::c_void) {
        unsafe {
            let _ = nix::sys::mman::munmap(ptr, BLOCK_SIZE);
        }
    }
}

#[cfg(windows)]
fn free_block(base: usize) {
    use windows::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
    unsafe {
        let _ = VirtualFree(base as *mut _, 0, MEM_RELEASE);
    }
}
