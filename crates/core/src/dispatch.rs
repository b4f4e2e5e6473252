//! PreCall/PostCall dispatcher
//!
//! Runs on whatever thread hits an installed hook, at arbitrary points in
//! user code: re-entrant, allocation-light, and defensive against
//! loader-lock and thread-exit races. Errors never propagate into the
//! intercepted program; the call degrades to "ignore" and the host hears
//! about it through `on_error`.

use divert_sdk::{CallInfo, CallPhase, CallbackAction, RegisterSet, STACK_TRACE_DEPTH};

use crate::engine::HookEngine;
use crate::entry::HookEntry;
use crate::flags::EntryFlags;
use crate::handlers;
use crate::memory;
use crate::records::{self, CallRecord, MAX_STACK_SNAPSHOT};
use crate::timing::{diff_ms, TimeSample};

const WORD: usize = std::mem::size_of::<usize>();

/// PreCall verdicts consumed by the template.
pub const PRE_IGNORE: usize = 0;
pub const PRE_CONTINUE: usize = 1;
pub const PRE_SKIP_FLAG: usize = 0x8000_0000;

/// Entry point patched into the template's PreCall sentinel.
///
/// The OS last-error value is preserved around everything the engine
/// does and updated only with what an observer wrote.
pub extern "system" fn pre_call_common(
    engine: *const HookEngine,
    entry: *const HookEntry,
    stack_ptr: usize,
) -> usize {
    let mut os_err = memory::last_os_error();
    let ret = match records::try_enter_dispatcher() {
        Ok(Some(_token)) => {
            if engine.is_null() || entry.is_null() {
                PRE_IGNORE
            } else {
                // SAFETY: the template only calls here while its entry is
                // published and not yet reclaimed (usage counter held).
                unsafe { pre_call(&*engine, &*entry, stack_ptr, &mut os_err) }
            }
        }
        // An observer called a hooked API: pass it through untouched.
        Ok(None) => PRE_IGNORE,
        // Thread is tearing down its TLS; not an error.
        Err(_) => PRE_IGNORE,
    };
    memory::set_last_os_error(os_err);
    ret
}

/// Entry point patched into the template's PostCall sentinel. Returns
/// the real return address; the template stores it into the slot it
/// pushed at the after-call mark and returns through it.
pub extern "system" fn post_call_common(
    engine: *const HookEngine,
    entry: *const HookEntry,
    stack_ptr: usize,
) -> usize {
    let mut os_err = memory::last_os_error();
    let ret = match records::try_enter_dispatcher() {
        Ok(Some(_token)) => {
            if engine.is_null() || entry.is_null() {
                fatal("null dispatch arguments in PostCall");
            }
            // SAFETY: as in pre_call_common.
            unsafe { post_call(&*engine, &*entry, stack_ptr, &mut os_err) }
        }
        Ok(None) => fatal("dispatcher re-entered in PostCall"),
        Err(_) => fatal("thread storage gone in PostCall"),
    };
    memory::set_last_os_error(os_err);
    ret
}

/// Unbalanced PostCall means the LIFO no longer mirrors the thread's
/// real stack; silently unwinding would corrupt the caller.
fn fatal(msg: &str) -> ! {
    tracing::error!("{msg}; terminating process");
    std::process::abort();
}

pub(crate) fn pre_call(
    engine: &HookEngine,
    entry: &HookEntry,
    stack_ptr: usize,
    os_err: &mut u32,
) -> usize {
    let t_enter = TimeSample::now(engine.epoch());
    let callbacks = engine.callbacks();
    tracing::trace!(
        "pre call: hook {:#x} '{}' sp {:#x}",
        entry.id,
        entry.name,
        stack_ptr
    );

    let result = records::with_call_data(|tls| {
        tls.thread_times.accumulate(&t_enter);
        if callbacks.is_system_thread() {
            return PRE_IGNORE;
        }
        if entry.flags.contains(EntryFlags::INVALIDATE_CACHE) {
            callbacks.invalidate_module_cache();
        }
        let Some(tramp) = entry.tramp() else {
            return PRE_IGNORE;
        };
        let after_call_mark = tramp.after_call_mark;

        let mut rec = tls.take_record();
        let (regs, return_addr) = unsafe { load_registers(stack_ptr, entry, false) };
        rec.hook_entry = entry as *const _ as usize;
        rec.call_id = entry.next_call_id();
        rec.cookie = engine.next_cookie();
        rec.chain_depth = tls.in_use.last().map(|p| p.chain_depth + 1).unwrap_or(1);
        rec.state.registers = regs;
        rec.state.os_last_error = *os_err;
        rec.state.skip_call = 0;
        rec.return_addr = return_addr;
        rec.after_call_addr = after_call_mark;
        rec.current_time_ms = t_enter.time_ms;
        if !entry.flags.contains(EntryFlags::DISABLE_STACK_WALK) {
            walk_stack(&regs, return_addr, &mut rec.state.stack_trace);
        }

        let info = build_call_info(entry, &rec, CallPhase::PreCall, 0.0, 0.0, &t_enter, tls);

        tls.in_use.push(rec);
        let rec = match tls.in_use.last_mut() {
            Some(r) => r,
            None => return PRE_IGNORE,
        };

        // Observer phase: custom handlers first, then the outer callback.
        let ldr_locked = callbacks.is_loader_lock_held();
        let mut failed = None;
        let mut ignore = false;
        let mut pre_called = false;
        if entry.flags.contains(EntryFlags::CALL_PRE_CALL)
            && (!entry.flags.contains(EntryFlags::DONT_CALL_ON_LDR_LOCK) || !ldr_locked)
        {
            let chain = if !entry
                .flags
                .contains(EntryFlags::DONT_CALL_CUSTOM_HANDLERS_ON_LDR_LOCK)
                || !ldr_locked
            {
                handlers::run_handler_chain(&entry.handlers, &info, &mut rec.state, &mut rec.scratch)
            } else {
                Ok(CallbackAction::Continue)
            };
            match chain {
                Err(e) => {
                    failed = Some(e);
                    ignore = true;
                }
                // A handler asked us not to notify the outer observer.
                Ok(CallbackAction::Suppress) => {}
                Ok(CallbackAction::Continue) => {
                    if entry.flags.contains(EntryFlags::ASYNC_CALLBACKS) {
                        engine.queue_notification(&info, &rec.state, &rec.scratch);
                    } else {
                        match callbacks.on_hook_called(&info, &mut rec.state, &mut rec.scratch) {
                            Err(e) => {
                                failed = Some(e);
                                ignore = true;
                            }
                            // The outer observer can also bow out of this
                            // call entirely.
                            Ok(CallbackAction::Suppress) => ignore = true,
                            Ok(CallbackAction::Continue) => pre_called = true,
                        }
                    }
                }
            }
        }

        // Snapshot what PostCall needs to undo caller-stack scribbling,
        // against the possibly-mutated registers.
        rec.state.pre_call_registers = rec.state.registers;
        snapshot_stack_params(rec, entry);

        if ignore {
            let rec = tls.in_use.pop();
            if let Some(rec) = rec {
                tls.release_record(rec);
            }
            if let Some(err) = failed {
                callbacks.on_error(err);
            }
            let t = TimeSample::now(engine.epoch());
            tls.thread_times.set_last(&t);
            return PRE_IGNORE;
        }

        // Skip-call synthesis needs a known pop count.
        if rec.state.skip_call != 0 {
            if let Some(pop) = entry.stack_return_size {
                unsafe { save_registers(stack_ptr, &rec.state.registers) };
                *os_err = rec.state.os_last_error;
                if let Some(rec) = tls.in_use.pop() {
                    tls.release_record(rec);
                }
                let t = TimeSample::now(engine.epoch());
                tls.thread_times.set_last(&t);
                return PRE_SKIP_FLAG | pop as usize;
            }
            tracing::warn!(
                "hook {:#x} requested skip but the pop count is unknown; running the body",
                entry.id
            );
        }

        rec.timing[0] = t_enter;
        rec.timing[1] = TimeSample::now(engine.epoch());
        rec.childs_elapsed_ms = 0.0;
        rec.child_overhead_ms = 0.0;
        let last = rec.timing[1];
        if pre_called {
            unsafe { save_registers(stack_ptr, &rec.state.registers) };
            *os_err = rec.state.os_last_error;
        }
        // Divert the body's return into the after-call mark.
        unsafe { (sp_of(&rec.state.registers) as *mut usize).write(after_call_mark) };
        tls.thread_times.set_last(&last);
        PRE_CONTINUE
    });

    result.unwrap_or(PRE_IGNORE)
}

pub(crate) fn post_call(
    engine: &HookEngine,
    entry: &HookEntry,
    stack_ptr: usize,
    os_err: &mut u32,
) -> usize {
    let t_return = TimeSample::now(engine.epoch());
    let callbacks = engine.callbacks();
    tracing::trace!(
        "post call: hook {:#x} '{}' sp {:#x}",
        entry.id,
        entry.name,
        stack_ptr
    );

    let result = records::with_call_data(|tls| {
        tls.thread_times.accumulate(&t_return);
        let (regs, _) = unsafe { load_registers(stack_ptr, entry, true) };

        // Pop records orphaned by frames an exception unwound past; the
        // matching record for this hook must be on top afterwards.
        loop {
            match tls.in_use.last() {
                None => return None,
                Some(r) if r.hook_entry == entry as *const _ as usize => break,
                Some(_) => {
                    if let Some(orphan) = tls.in_use.pop() {
                        tls.release_record(orphan);
                    }
                }
            }
        }
        let mut rec = match tls.in_use.pop() {
            Some(r) => r,
            None => return None,
        };

        // Some APIs scribble over their own argument stack; put the
        // caller's words back before anyone inspects them.
        restore_stack_params(&rec);

        let raw = diff_ms(t_return.time_ms, rec.timing[1].time_ms);
        let elapsed = diff_ms(raw, rec.child_overhead_ms);
        let ret_addr = rec.return_addr;
        rec.state.skip_call = 0;
        rec.state.os_last_error = *os_err;
        rec.state.registers = regs;

        let mut post_called = false;
        let ldr_locked = callbacks.is_loader_lock_held();
        if entry.flags.contains(EntryFlags::CALL_POST_CALL)
            && (!entry.flags.contains(EntryFlags::DONT_CALL_ON_LDR_LOCK) || !ldr_locked)
        {
            let info = build_call_info(
                entry,
                &rec,
                CallPhase::PostCall,
                elapsed,
                rec.childs_elapsed_ms,
                &t_return,
                tls,
            );
            let chain = if !entry
                .flags
                .contains(EntryFlags::DONT_CALL_CUSTOM_HANDLERS_ON_LDR_LOCK)
                || !ldr_locked
            {
                handlers::run_handler_chain(&entry.handlers, &info, &mut rec.state, &mut rec.scratch)
            } else {
                Ok(CallbackAction::Continue)
            };
            let mut failed = None;
            match chain {
                Err(e) => failed = Some(e),
                Ok(CallbackAction::Suppress) => {}
                Ok(CallbackAction::Continue) => {
                    if entry.flags.contains(EntryFlags::ASYNC_CALLBACKS) {
                        engine.queue_notification(&info, &rec.state, &rec.scratch);
                    } else {
                        match callbacks.on_hook_called(&info, &mut rec.state, &mut rec.scratch) {
                            Err(e) => failed = Some(e),
                            Ok(_) => post_called = true,
                        }
                    }
                }
            }
            if let Some(err) = failed {
                callbacks.on_error(err);
            }
        }

        let t_done = TimeSample::now(engine.epoch());
        if let Some(parent) = tls.in_use.last_mut() {
            parent.childs_elapsed_ms += elapsed;
            // The engine's own time in this call must not count against
            // the parent's body.
            parent.child_overhead_ms += diff_ms(t_done.time_ms, t_return.time_ms);
            parent.child_overhead_ms += diff_ms(rec.timing[1].time_ms, rec.timing[0].time_ms);
        }
        tls.thread_times.set_last(&t_done);

        if post_called {
            unsafe { save_registers(stack_ptr, &rec.state.registers) };
            *os_err = rec.state.os_last_error;
        }
        tls.release_record(rec);
        Some(ret_addr)
    });

    match result {
        Ok(Some(addr)) => addr,
        Ok(None) => fatal("in-flight call LIFO empty in PostCall"),
        Err(_) => fatal("thread storage gone in PostCall"),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_call_info(
    entry: &HookEntry,
    rec: &CallRecord,
    phase: CallPhase,
    elapsed_ms: f64,
    childs_elapsed_ms: f64,
    sample: &TimeSample,
    tls: &records::TlsData,
) -> CallInfo {
    CallInfo {
        hook_id: entry.id,
        cookie: rec.cookie,
        phase,
        function_name: entry.name.clone(),
        thread_id: current_thread_id(),
        chain_depth: rec.chain_depth,
        async_callbacks: entry.flags.contains(EntryFlags::ASYNC_CALLBACKS),
        current_time_ms: if phase == CallPhase::PreCall {
            sample.time_ms
        } else {
            rec.current_time_ms
        },
        elapsed_time_ms: elapsed_ms,
        childs_elapsed_time_ms: childs_elapsed_ms,
        kernel_time_ms: tls.thread_times.kernel_ms,
        user_time_ms: tls.thread_times.user_ms,
        cpu_cycles: tls.thread_times.cycles,
    }
}

#[cfg(target_os = "linux")]
fn current_thread_id() -> u64 {
    unsafe { libc::gettid() as u64 }
}

#[cfg(windows)]
fn current_thread_id() -> u64 {
    unsafe { windows::Win32::System::Threading::GetCurrentThreadId() as u64 }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn current_thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

/// Overlay the template's save area and build the observer view.
///
/// In the post phase the stack pointer is one word lower than at entry:
/// the template pushed the slot that will receive the real return
/// address.
#[cfg(target_pointer_width = "64")]
unsafe fn load_registers(stack_ptr: usize, entry: &HookEntry, post: bool) -> (RegisterSet, usize) {
    use divert_sdk::{SavedFrame64, SAVED_FRAME64_SIZE};

    let frame = &*(stack_ptr as *const SavedFrame64);
    let rsp = stack_ptr + SAVED_FRAME64_SIZE + if post { WORD } else { 0 };
    let xmm = [
        f64::from_le_bytes(frame.xmm[0][..8].try_into().unwrap_or_default()),
        f64::from_le_bytes(frame.xmm[1][..8].try_into().unwrap_or_default()),
        f64::from_le_bytes(frame.xmm[2][..8].try_into().unwrap_or_default()),
        f64::from_le_bytes(frame.xmm[3][..8].try_into().unwrap_or_default()),
    ];
    let regs = RegisterSet {
        rip: entry.orig_proc as u64,
        rax: frame.rax,
        rbx: frame.rbx,
        rcx: frame.rcx,
        rdx: frame.rdx,
        rbp: frame.rbp,
        rsp: rsp as u64,
        rsi: frame.rsi,
        rdi: frame.rdi,
        r8: frame.r8,
        r9: frame.r9,
        r10: frame.r10,
        r11: frame.r11,
        xmm,
        original_xmm: xmm,
    };
    let return_addr = if post { 0 } else { (rsp as *const usize).read() };
    (regs, return_addr)
}

/// Write observer mutations back into the save area. Integer registers
/// go back unconditionally; float registers only when changed, so an
/// untouched x87/SSE state stays bit-identical.
#[cfg(target_pointer_width = "64")]
unsafe fn save_registers(stack_ptr: usize, regs: &RegisterSet) {
    use divert_sdk::SavedFrame64;

    let frame = &mut *(stack_ptr as *mut SavedFrame64);
    frame.rax = regs.rax;
    frame.rbx = regs.rbx;
    frame.rcx = regs.rcx;
    frame.rdx = regs.rdx;
    frame.rbp = regs.rbp;
    frame.rsi = regs.rsi;
    frame.rdi = regs.rdi;
    frame.r8 = regs.r8;
    frame.r9 = regs.r9;
    frame.r10 = regs.r10;
    frame.r11 = regs.r11;
    for i in 0..4 {
        if regs.xmm[i] != regs.original_xmm[i] {
            frame.xmm[i][..8].copy_from_slice(&regs.xmm[i].to_le_bytes());
            frame.xmm[i][8..].fill(0);
        }
    }
}

#[cfg(target_pointer_width = "32")]
unsafe fn load_registers(stack_ptr: usize, entry: &HookEntry, post: bool) -> (RegisterSet, usize) {
    use divert_sdk::{SavedFrame32, SAVED_FRAME32_SIZE};

    use crate::template::calc_stack_preserve;

    let frame = &*(stack_ptr as *const SavedFrame32);
    let alignment = frame.alignment & !SavedFrame32::ST0_MODIFIED;
    let base = stack_ptr + alignment as usize;
    let mut esp = base + SAVED_FRAME32_SIZE;
    if post {
        // Skip the preserve gap and the pushed return slot.
        esp += calc_stack_preserve(4, entry.stack_return_size) + WORD;
    }
    let st0 = frame.st0_f64();
    let regs = RegisterSet {
        eip: entry.orig_proc as u32,
        eax: frame.eax,
        ebx: frame.ebx,
        ecx: frame.ecx,
        edx: frame.edx,
        ebp: frame.ebp,
        esp: esp as u32,
        esi: frame.esi,
        edi: frame.edi,
        st0,
        original_st0: st0,
        alignment,
    };
    let return_addr = if post { 0 } else { (esp as *const usize).read() };
    (regs, return_addr)
}

#[cfg(target_pointer_width = "32")]
unsafe fn save_registers(stack_ptr: usize, regs: &RegisterSet) {
    use divert_sdk::SavedFrame32;

    let frame = &mut *(stack_ptr as *mut SavedFrame32);
    if regs.st0 != regs.original_st0 {
        frame.set_st0_f64(regs.st0);
        frame.alignment |= SavedFrame32::ST0_MODIFIED;
    }
    frame.eax = regs.eax;
    frame.ebx = regs.ebx;
    frame.ecx = regs.ecx;
    frame.edx = regs.edx;
    frame.ebp = regs.ebp;
    frame.esi = regs.esi;
    frame.edi = regs.edi;
}

#[cfg(target_pointer_width = "64")]
fn sp_of(regs: &RegisterSet) -> usize {
    regs.rsp as usize
}

#[cfg(target_pointer_width = "32")]
fn sp_of(regs: &RegisterSet) -> usize {
    regs.esp as usize
}

#[cfg(target_pointer_width = "64")]
fn frame_pointer(regs: &RegisterSet) -> usize {
    regs.rbp as usize
}

#[cfg(target_pointer_width = "32")]
fn frame_pointer(regs: &RegisterSet) -> usize {
    regs.ebp as usize
}

/// Best-effort frame-pointer walk; unused entries stay zero.
fn walk_stack(regs: &RegisterSet, return_addr: usize, out: &mut [usize; STACK_TRACE_DEPTH]) {
    *out = [0; STACK_TRACE_DEPTH];
    out[0] = return_addr;
    let mut fp = frame_pointer(regs);
    for slot in out.iter_mut().skip(1) {
        let Some(ra) = memory::try_read_word(fp + WORD) else {
            break;
        };
        let Some(next) = memory::try_read_word(fp) else {
            break;
        };
        if ra == 0 {
            break;
        }
        *slot = ra;
        // Frames must ascend or the chain is garbage.
        if next <= fp {
            break;
        }
        fp = next;
    }
}

/// Capture the caller stack words the body may overwrite; sized from the
/// callee pop count, with the same fixed slack the preserve gap uses.
fn snapshot_stack_params(rec: &mut CallRecord, entry: &HookEntry) {
    let words = match entry.stack_return_size {
        Some(n) => n as usize / WORD + 4,
        None => 4,
    }
    .min(MAX_STACK_SNAPSHOT);
    let base = sp_of(&rec.state.pre_call_registers) + WORD;
    rec.saved_stack_base = base;
    rec.saved_stack_len = 0;
    for i in 0..words {
        match memory::try_read_word(base + i * WORD) {
            Some(w) => {
                rec.saved_stack[i] = w;
                rec.saved_stack_len = i + 1;
            }
            None => break,
        }
    }
}

fn restore_stack_params(rec: &CallRecord) {
    for i in 0..rec.saved_stack_len {
        let addr = rec.saved_stack_base + i * WORD;
        memory::try_write_bytes(addr, &rec.saved_stack[i].to_ne_bytes());
    }
}
