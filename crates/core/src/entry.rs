//! Hook entry data model
//!
//! One `HookEntry` per installed hook. After publication an entry is
//! immutable except for the atomics (`state`, the overwrite-report flag,
//! the per-entry call counter) and the two words living inside the
//! trampoline itself; the registry mutex guards everything else.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::flags::EntryFlags;
use crate::handlers::AttachedHandler;
use crate::host::{FunctionInfo, ModuleRange};
use crate::stub::MAX_CAPTURE;

/// Lifecycle of one entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HookState {
    Allocated = 0,
    Installed = 1,
    Uninstalling = 2,
    Leaked = 3,
}

/// Addresses resolved once the template has been instantiated.
#[derive(Clone, Copy, Debug)]
pub struct TrampolineInfo {
    pub base: usize,
    pub len: usize,
    /// Forged return address: the instruction just past the after-call
    /// sentinel.
    pub after_call_mark: usize,
    /// Two bytes inside the trampoline: `[0]` disabled, `[1]` uninstalled.
    pub flags_addr: usize,
    /// Machine word inside the trampoline counting threads between
    /// PreCall entry and PostCall exit.
    pub counter_addr: usize,
    /// First 8 bytes of the patched entry point.
    pub modified_stub: [u8; 8],
}

pub struct HookEntry {
    pub id: u32,
    /// Address the caller supplied.
    pub orig_proc: usize,
    /// `orig_proc` after stepping over leading unconditional jumps.
    pub hooked_addr: usize,
    pub name: Arc<str>,
    pub flags: EntryFlags,
    pub stack_return_size: Option<u32>,
    pub module: Option<ModuleRange>,
    pub db_func: Option<Arc<dyn FunctionInfo>>,
    pub original_stub: [u8; MAX_CAPTURE],
    pub original_captured: usize,
    /// Bytes covered by the relocated prologue (>= 5).
    pub original_stub_len: usize,
    pub(crate) instructions: Vec<iced_x86::Instruction>,
    pub handlers: Vec<AttachedHandler>,
    state: AtomicU8,
    overwrite_reported: AtomicBool,
    call_counter: AtomicU32,
    tramp: OnceLock<TrampolineInfo>,
}

// SAFETY: the raw addresses inside an entry are either immutable after
// publication or accessed through atomics; the registry mutex serialises
// everything else.
unsafe impl Send for HookEntry {}
unsafe impl Sync for HookEntry {}

impl HookEntry {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u32,
        orig_proc: usize,
        hooked_addr: usize,
        name: Arc<str>,
        flags: EntryFlags,
        stack_return_size: Option<u32>,
        module: Option<ModuleRange>,
        db_func: Option<Arc<dyn FunctionInfo>>,
        original_stub: [u8; MAX_CAPTURE],
        original_captured: usize,
        original_stub_len: usize,
        instructions: Vec<iced_x86::Instruction>,
        handlers: Vec<AttachedHandler>,
    ) -> Self {
        Self {
            id,
            orig_proc,
            hooked_addr,
            name,
            flags,
            stack_return_size,
            module,
            db_func,
            original_stub,
            original_captured,
            original_stub_len,
            instructions,
            handlers,
            state: AtomicU8::new(HookState::Allocated as u8),
            overwrite_reported: AtomicBool::new(false),
            call_counter: AtomicU32::new(0),
            tramp: OnceLock::new(),
        }
    }

    pub fn state(&self) -> HookState {
        match self.state.load(Ordering::Acquire) {
            1 => HookState::Installed,
            2 => HookState::Uninstalling,
            3 => HookState::Leaked,
            _ => HookState::Allocated,
        }
    }

    pub(crate) fn set_state(&self, state: HookState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Per-entry call number; wraps but never lands on zero.
    pub fn next_call_id(&self) -> u32 {
        loop {
            let id = self.call_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    pub(crate) fn set_trampoline(&self, info: TrampolineInfo) {
        // Set exactly once before publication.
        let _ = self.tramp.set(info);
    }

    pub fn tramp(&self) -> Option<&TrampolineInfo> {
        self.tramp.get()
    }

    pub fn tramp_range(&self) -> Option<(usize, usize)> {
        self.tramp.get().map(|t| (t.base, t.len))
    }

    /// Flip the disabled byte inside the trampoline.
    pub(crate) fn set_disabled(&self, disabled: bool) {
        if let Some(t) = self.tramp.get() {
            unsafe { &*(t.flags_addr as *const AtomicU8) }
                .store(disabled as u8, Ordering::Release);
        }
    }

    /// Set the uninstalled byte; any later template entry bypasses the
    /// dispatcher.
    pub(crate) fn set_uninstalled(&self) {
        if let Some(t) = self.tramp.get() {
            unsafe { &*((t.flags_addr + 1) as *const AtomicU8) }.store(1, Ordering::Release);
        }
    }

    /// Threads currently between PreCall entry and PostCall exit.
    pub fn usage_counter(&self) -> usize {
        match self.tramp.get() {
            Some(t) => unsafe { &*(t.counter_addr as *const AtomicUsize) }.load(Ordering::Acquire),
            None => 0,
        }
    }

    pub(crate) fn overwrite_reported(&self) -> bool {
        self.overwrite_reported.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_overwrite_reported(&self) {
        self.overwrite_reported.store(true, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for HookEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("hooked_addr", &format_args!("{:#x}", self.hooked_addr))
            .field("state", &self.state())
            .finish()
    }
}
