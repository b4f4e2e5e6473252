//! Entry-point patching
//!
//! The 5-byte `JMP rel32` is written only while every other thread is
//! suspended with its instruction pointer verified to be outside the
//! patched range; that is what makes the multi-byte write atomic.
//! Uninstall additionally waits for the trampoline's usage counter to
//! drain, and prefers leaking the slot over restoring bytes under a
//! thread's feet.

use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::entry::{HookEntry, HookState};
use crate::error::{EngineError, EngineResult};
use crate::memory::{self, PatchGuard};
use crate::stub::JUMP_TO_HOOK_SIZE;
use crate::suspend::{IpRange, ThreadSuspender};
use crate::template::NOP_SLIDE;

/// Install a prepared batch, at most `max_ranges` targets per suspension
/// window. Entries successfully patched before a failure keep their
/// `Installed` state; the registry rolls them back through the normal
/// uninstall path.
pub(crate) fn install_batch(
    suspender: &mut dyn ThreadSuspender,
    entries: &[Arc<HookEntry>],
    max_ranges: usize,
) -> EngineResult<()> {
    let mut idx = 0;
    let mut window = 0usize;
    while idx < entries.len() {
        if window == 0 {
            let count = (entries.len() - idx).min(max_ranges);
            let ranges: Vec<IpRange> = entries[idx..idx + count]
                .iter()
                .map(|e| IpRange::new(e.hooked_addr, JUMP_TO_HOOK_SIZE))
                .collect();
            suspender.suspend(&ranges)?;
            window = count;
        }
        for entry in &entries[idx..idx + window] {
            if let Err(err) = write_jump(entry) {
                suspender.resume();
                return Err(err);
            }
            entry.set_state(HookState::Installed);
            tracing::info!("installed hook {:#x} '{}' at {:#x}", entry.id, entry.name, entry.hooked_addr);
        }
        idx += window;

        // Keep the window open for upcoming targets no parked thread
        // sits in; otherwise resume and open a fresh one.
        window = 0;
        for entry in &entries[idx..] {
            if suspender.any_thread_in_range(IpRange::new(entry.hooked_addr, JUMP_TO_HOOK_SIZE)) {
                break;
            }
            window += 1;
        }
        if window == 0 {
            suspender.resume();
        }
    }
    suspender.resume();
    Ok(())
}

fn write_jump(entry: &Arc<HookEntry>) -> EngineResult<()> {
    let tramp = entry
        .tramp()
        .ok_or(EngineError::InvalidArgument("entry has no trampoline"))?;
    {
        let _guard = PatchGuard::unprotect(entry.hooked_addr, JUMP_TO_HOOK_SIZE)?;
        if !memory::try_write_bytes(entry.hooked_addr, &tramp.modified_stub[..JUMP_TO_HOOK_SIZE]) {
            return Err(EngineError::ProtectFailed(format!(
                "entry point {:#x} not writable",
                entry.hooked_addr
            )));
        }
    }
    memory::flush_instruction_cache(entry.hooked_addr, 32);
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UninstallOutcome {
    /// Original bytes are back; the slot can be reused.
    Restored,
    /// A thread never left the trampoline (or the bytes were tampered
    /// with); the slot must stay mapped forever.
    Leaked,
}

/// Drain and neutralise one installed entry.
///
/// `window_active` carries an open suspension window between consecutive
/// uninstalls of a batch; it is dropped the moment a parked thread sits
/// in one of this entry's ranges.
pub(crate) fn uninstall_entry(
    suspender: &mut dyn ThreadSuspender,
    window_active: &mut bool,
    entry: &HookEntry,
    cfg: &EngineConfig,
) -> UninstallOutcome {
    entry.set_state(HookState::Uninstalling);
    // Future template entries short-circuit to the body from here on.
    entry.set_uninstalled();

    let Some(tramp) = entry.tramp() else {
        // Never instantiated; nothing to drain or restore.
        return UninstallOutcome::Restored;
    };
    let ranges = [
        IpRange::new(entry.hooked_addr, entry.original_stub_len),
        IpRange::new(tramp.base, tramp.len),
    ];

    if *window_active
        && (suspender.any_thread_in_range(ranges[0]) || suspender.any_thread_in_range(ranges[1]))
    {
        suspender.resume();
        *window_active = false;
    }

    let mut in_use = true;
    if *window_active {
        in_use = entry.usage_counter() != 0;
    } else {
        for attempt in (1..=cfg.drain_retries.max(1)).rev() {
            if suspender.suspend(&ranges).is_err() {
                break;
            }
            *window_active = true;
            if entry.usage_counter() == 0 {
                in_use = false;
                break;
            }
            suspender.resume();
            *window_active = false;
            if attempt > 1 {
                std::thread::sleep(Duration::from_millis(cfg.drain_backoff_ms));
            }
        }
    }

    if in_use {
        tracing::warn!(
            "hook {:#x} '{}' still in flight after drain, leaking trampoline {:#x}",
            entry.id,
            entry.name,
            tramp.base
        );
        entry.set_state(HookState::Leaked);
        return UninstallOutcome::Leaked;
    }

    // Restore only if the entry point still carries our jump and nobody
    // hooked the trampoline itself in the meantime.
    let stub_intact = !memory::is_memory_diff(entry.hooked_addr, &tramp.modified_stub)
        && nop_slide_intact(tramp.base);
    let mut restored = false;
    if stub_intact {
        if let Ok(_guard) = PatchGuard::unprotect(entry.hooked_addr, JUMP_TO_HOOK_SIZE) {
            restored = memory::try_write_bytes(
                entry.hooked_addr,
                &entry.original_stub[..JUMP_TO_HOOK_SIZE],
            );
        }
        memory::flush_instruction_cache(entry.hooked_addr, 32);
    }

    if restored {
        tracing::info!("restored entry point of hook {:#x} '{}'", entry.id, entry.name);
        UninstallOutcome::Restored
    } else {
        tracing::warn!(
            "entry point of hook {:#x} changed under us, leaving bytes and leaking trampoline",
            entry.id
        );
        entry.set_state(HookState::Leaked);
        UninstallOutcome::Leaked
    }
}

fn nop_slide_intact(trampoline: usize) -> bool {
    let mut head = [0u8; NOP_SLIDE];
    memory::try_read_bytes(trampoline, &mut head) && head == [0x90; NOP_SLIDE]
}
