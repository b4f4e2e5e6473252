//! The hook engine
//!
//! Owns the registry of installed hooks, the slot allocator and the
//! notification queue, and exposes the public management surface. All
//! list mutation happens under one mutex; the dispatcher never takes it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use divert_sdk::{CallInfo, CallState, INTERCALL_SCRATCH_SIZE};

use crate::config::EngineConfig;
use crate::dispatch;
use crate::entry::{HookEntry, HookState};
use crate::error::{EngineError, EngineResult};
use crate::flags::{EntryFlags, HookFlags};
use crate::handlers;
use crate::host::{EngineCallbacks, FunctionInfo, ModuleRange};
use crate::memory;
use crate::notify::{Notification, NotifyQueue};
use crate::patcher::{self, UninstallOutcome};
use crate::slots::SlotAllocator;
use crate::stub;
use crate::template;
use crate::trampoline::{self, TrampolineSpec};

const WORD: usize = std::mem::size_of::<usize>();

#[cfg(target_pointer_width = "64")]
const BITNESS: u32 = 64;

#[cfg(target_pointer_width = "32")]
const BITNESS: u32 = 32;

/// Overwrite reports delivered per scan.
const MAX_OVERWRITE_BATCH: usize = 1024;

/// One hook to install.
pub struct HookRequest {
    /// Caller-assigned identifier, unique within the engine. Ids with
    /// bit 31 set are exempt from overwrite checking.
    pub id: u32,
    /// Absolute address of the function to intercept.
    pub target: usize,
    /// Display name; falls back to the catalogue name, then the address.
    pub function_name: Option<String>,
    pub flags: HookFlags,
    /// Catalogue metadata; its stack-return size enables skip-call.
    pub db_func: Option<Arc<dyn FunctionInfo>>,
    /// Serialized custom-handler descriptors (see `handlers`).
    pub custom_handlers: Option<Vec<u8>>,
}

struct EngineState {
    hooks: Vec<Arc<HookEntry>>,
    slots: Option<SlotAllocator>,
    /// Entries whose trampoline could not be reclaimed; kept so
    /// `check_if_in_trampoline` stays truthful about their slots.
    leaked: Vec<Arc<HookEntry>>,
}

pub struct HookEngine {
    callbacks: Arc<dyn EngineCallbacks>,
    config: EngineConfig,
    epoch: Instant,
    cookie: AtomicU64,
    notifications: NotifyQueue,
    state: Mutex<EngineState>,
}

impl HookEngine {
    /// The engine address is patched into every trampoline, so instances
    /// always live behind an `Arc` and never move.
    pub fn new(callbacks: Arc<dyn EngineCallbacks>) -> Arc<Self> {
        Self::with_config(callbacks, EngineConfig::default())
    }

    pub fn with_config(callbacks: Arc<dyn EngineCallbacks>, config: EngineConfig) -> Arc<Self> {
        let notifications = NotifyQueue::new(config.notify_queue_capacity);
        Arc::new(Self {
            callbacks,
            config,
            epoch: Instant::now(),
            cookie: AtomicU64::new(0),
            notifications,
            state: Mutex::new(EngineState {
                hooks: Vec::new(),
                slots: None,
                leaked: Vec::new(),
            }),
        })
    }

    /// Reset the engine: any surviving hooks are removed and the call
    /// cookie starts over. Idempotent.
    pub fn initialize(&self) -> EngineResult<()> {
        self.unhook_all();
        self.cookie.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Remove every hook and drop per-hook resources.
    pub fn finalize(&self) {
        self.unhook_all();
    }

    /// Install a batch of hooks. On any failure nothing stays installed:
    /// entries already patched are rolled back and the first error is
    /// returned.
    pub fn hook(self: &Arc<Self>, requests: &[HookRequest]) -> EngineResult<()> {
        if requests.is_empty() {
            return Err(EngineError::InvalidArgument("empty hook batch"));
        }
        if !self.callbacks.platform_supported() {
            return Err(EngineError::NotImplemented);
        }
        let mut state = self.state.lock();

        for (i, request) in requests.iter().enumerate() {
            if request.target == 0 {
                return Err(EngineError::InvalidArgument("null hook target"));
            }
            EntryFlags::from_request(request.flags)?;
            if state.hooks.iter().any(|h| h.id == request.id)
                || requests[..i].iter().any(|r| r.id == request.id)
            {
                return Err(EngineError::AlreadyExists(request.id));
            }
        }

        let mut new_entries = Vec::with_capacity(requests.len());
        for request in requests {
            let entry = match self.build_entry(&mut state, request) {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::error!("hook {:#x} preparation failed: {err}", request.id);
                    let ids: Vec<u32> = new_entries.iter().map(|e: &Arc<HookEntry>| e.id).collect();
                    state.hooks.extend(new_entries);
                    self.unhook_ids_locked(&mut state, &ids, false);
                    return Err(err);
                }
            };
            new_entries.push(entry);
        }

        // Publish before patching so rollback finds the entries.
        state.hooks.extend(new_entries.iter().cloned());

        let mut suspender = self.callbacks.create_suspender();
        if let Err(err) = patcher::install_batch(
            suspender.as_mut(),
            &new_entries,
            self.config.max_suspend_ranges,
        ) {
            tracing::error!("batch install failed: {err}, rolling back");
            let ids: Vec<u32> = new_entries.iter().map(|e| e.id).collect();
            self.unhook_ids_locked(&mut state, &ids, false);
            return Err(err);
        }
        Ok(())
    }

    fn build_entry(
        self: &Arc<Self>,
        state: &mut EngineState,
        request: &HookRequest,
    ) -> EngineResult<Arc<HookEntry>> {
        let flags = EntryFlags::from_request(request.flags)?;
        let hooked_addr = if request.flags.contains(HookFlags::DONT_SKIP_JUMPS) {
            request.target
        } else {
            stub::skip_jump_instructions(request.target, WORD)
        };
        let name: Arc<str> = match &request.function_name {
            Some(n) if !n.is_empty() => Arc::from(n.as_str()),
            _ => match &request.db_func {
                Some(f) => Arc::from(f.name()),
                None => Arc::from(format!("{:#x}", request.target).as_str()),
            },
        };
        let stack_return_size = request.db_func.as_ref().and_then(|f| f.stack_return_size());
        let module = self.callbacks.find_module(request.target);

        let descriptors = match &request.custom_handlers {
            Some(blob) => handlers::parse_handler_blob(blob)?,
            None => Vec::new(),
        };
        let attached = handlers::attach_handlers(descriptors, self.callbacks.as_ref())?;

        let stub_info = stub::build_stub(hooked_addr, BITNESS)?;
        tracing::debug!(
            "creating hook {:#x} '{}' at {:#x} ({} prologue bytes)",
            request.id,
            name,
            hooked_addr,
            stub_info.original_len
        );

        let entry = Arc::new(HookEntry::new(
            request.id,
            request.target,
            hooked_addr,
            name,
            flags,
            stack_return_size,
            module,
            request.db_func.clone(),
            stub_info.original,
            stub_info.captured_len,
            stub_info.original_len,
            stub_info.instructions,
            attached,
        ));

        let tpl = template::native();
        if state.slots.is_none() {
            state.slots = Some(SlotAllocator::new(tpl.raw_slot_len())?);
        }
        let slots = match state.slots.as_mut() {
            Some(s) => s,
            None => return Err(EngineError::OutOfMemory),
        };
        let slot = slots.alloc(entry.hooked_addr).ok_or(EngineError::OutOfMemory)?;
        let spec = TrampolineSpec {
            engine_ptr: Arc::as_ptr(self) as usize,
            entry_ptr: Arc::as_ptr(&entry) as usize,
            pre_call: dispatch::pre_call_common as usize,
            post_call: dispatch::post_call_common as usize,
            hooked_addr: entry.hooked_addr,
            original: &entry.original_stub,
            original_stub_len: entry.original_stub_len,
            stack_return_size,
            instructions: &entry.instructions,
        };
        match trampoline::write_trampoline(tpl, slot, slots.slot_size(), &spec) {
            Ok(info) => {
                entry.set_trampoline(info);
                Ok(entry)
            }
            Err(err) => {
                slots.free(slot);
                Err(err)
            }
        }
    }

    /// Remove hooks by id; unknown ids are skipped silently. Per-entry
    /// failures degrade to a leaked slot, never to an error.
    pub fn unhook(&self, ids: &[u32]) -> EngineResult<()> {
        if ids.is_empty() {
            return Err(EngineError::InvalidArgument("empty unhook list"));
        }
        let mut state = self.state.lock();
        self.unhook_ids_locked(&mut state, ids, false);
        Ok(())
    }

    fn unhook_ids_locked(&self, state: &mut EngineState, ids: &[u32], force_free: bool) {
        let mut suspender = self.callbacks.create_suspender();
        let mut window = false;
        for &id in ids {
            let Some(pos) = state.hooks.iter().position(|h| h.id == id) else {
                continue;
            };
            let entry = state.hooks.remove(pos);
            match entry.state() {
                HookState::Allocated => {
                    // Prepared but never patched (rollback path).
                    if let (Some(t), Some(slots)) = (entry.tramp(), state.slots.as_mut()) {
                        slots.free(t.base);
                    }
                }
                HookState::Leaked => {
                    state.leaked.push(entry);
                    continue;
                }
                HookState::Installed | HookState::Uninstalling => {
                    let outcome = patcher::uninstall_entry(
                        suspender.as_mut(),
                        &mut window,
                        &entry,
                        &self.config,
                    );
                    match outcome {
                        UninstallOutcome::Restored => {
                            if let (Some(t), Some(slots)) = (entry.tramp(), state.slots.as_mut()) {
                                slots.free(t.base);
                            }
                        }
                        UninstallOutcome::Leaked if force_free => {
                            // The module is going away; reclaim the slot
                            // even though the bytes could not be restored.
                            if let (Some(t), Some(slots)) = (entry.tramp(), state.slots.as_mut()) {
                                slots.free(t.base);
                            }
                        }
                        UninstallOutcome::Leaked => {
                            state.leaked.push(entry.clone());
                        }
                    }
                }
            }
            tracing::info!("unhooked {id:#x}");
        }
        if window {
            suspender.resume();
        }
    }

    /// Park or resume a hook without touching the target bytes.
    pub fn enable(&self, id: u32, enable: bool) -> EngineResult<()> {
        let state = self.state.lock();
        match state.hooks.iter().find(|h| h.id == id) {
            Some(entry) => {
                entry.set_disabled(!enable);
                tracing::info!("hook {id:#x} {}", if enable { "enabled" } else { "disabled" });
                Ok(())
            }
            None => Err(EngineError::NotFound),
        }
    }

    /// Remove every hook, newest first, in bounded chunks.
    pub fn unhook_all(&self) {
        let mut state = self.state.lock();
        for entry in state.hooks.iter() {
            entry.set_uninstalled();
        }
        while !state.hooks.is_empty() {
            let ids: Vec<u32> = state
                .hooks
                .iter()
                .rev()
                .take(self.config.unhook_chunk)
                .map(|e| e.id)
                .collect();
            self.unhook_ids_locked(&mut state, &ids, false);
        }
    }

    /// Scan installed entries for third-party overwrites; newly changed
    /// entries are reported once through `on_hook_overwritten`.
    pub fn check_overwritten_hooks(&self) -> EngineResult<()> {
        let mut ids = Vec::new();
        {
            let state = self.state.lock();
            for entry in state.hooks.iter() {
                if ids.len() >= MAX_OVERWRITE_BATCH {
                    break;
                }
                if entry.overwrite_reported() || entry.id & 0x8000_0000 != 0 {
                    continue;
                }
                let Some(tramp) = entry.tramp() else { continue };
                if memory::is_memory_diff(entry.hooked_addr, &tramp.modified_stub[..5]) {
                    entry.mark_overwrite_reported();
                    ids.push(entry.id);
                }
            }
        }
        if !ids.is_empty() {
            tracing::warn!("{} hook(s) overwritten by a third party", ids.len());
            self.callbacks.on_hook_overwritten(&ids);
        }
        Ok(())
    }

    /// Per-id overwrite status: 1 if the entry point differs from what
    /// was installed, 0 otherwise (including unknown and exempt ids).
    pub fn query_overwritten_hooks(&self, ids: &[u32]) -> Vec<u8> {
        let state = self.state.lock();
        ids.iter()
            .map(|&id| {
                if id == 0 || id & 0x8000_0000 != 0 {
                    return 0;
                }
                let Some(entry) = state.hooks.iter().find(|h| h.id == id) else {
                    return 0;
                };
                match entry.tramp() {
                    Some(t) if memory::is_memory_diff(entry.hooked_addr, &t.modified_stub[..5]) => 1,
                    _ => 0,
                }
            })
            .collect()
    }

    /// Mass-unhook everything living in a module that is about to
    /// disappear. Byte restoration is allowed to fail; the slots are
    /// reclaimed regardless.
    pub fn dll_unload_unhook(&self, module: ModuleRange) {
        let mut state = self.state.lock();
        for entry in state.hooks.iter() {
            if entry_in_module(entry, &module) {
                entry.set_uninstalled();
            }
        }
        loop {
            let ids: Vec<u32> = state
                .hooks
                .iter()
                .rev()
                .filter(|e| entry_in_module(e, &module))
                .take(self.config.unhook_chunk)
                .map(|e| e.id)
                .collect();
            if ids.is_empty() {
                break;
            }
            self.unhook_ids_locked(&mut state, &ids, true);
        }
    }

    /// Whether `ip` lies inside any live or leaked trampoline.
    pub fn check_if_in_trampoline(&self, ip: usize) -> bool {
        let state = self.state.lock();
        state
            .hooks
            .iter()
            .chain(state.leaked.iter())
            .any(|e| match e.tramp_range() {
                Some((base, len)) => ip >= base && ip < base + len,
                None => false,
            })
    }

    /// Look up a live entry by id.
    pub fn hook_entry(&self, id: u32) -> Option<Arc<HookEntry>> {
        self.state.lock().hooks.iter().find(|h| h.id == id).cloned()
    }

    pub fn hook_count(&self) -> usize {
        self.state.lock().hooks.len()
    }

    /// Deliver queued async notifications on the calling thread.
    pub fn pump_notifications(&self) -> usize {
        self.notifications.pump(self.callbacks.as_ref())
    }

    pub fn pending_notifications(&self) -> usize {
        self.notifications.len()
    }

    pub(crate) fn queue_notification(
        &self,
        info: &CallInfo,
        state: &CallState,
        scratch: &[u8; INTERCALL_SCRATCH_SIZE],
    ) {
        self.notifications.push(Notification {
            info: info.clone(),
            state: state.clone(),
            scratch: Box::new(*scratch),
        });
    }

    /// Process-wide call cookie: strictly monotonic, never zero.
    pub(crate) fn next_cookie(&self) -> u64 {
        self.cookie.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn epoch(&self) -> Instant {
        self.epoch
    }

    pub(crate) fn callbacks(&self) -> &dyn EngineCallbacks {
        self.callbacks.as_ref()
    }
}

impl Drop for HookEngine {
    fn drop(&mut self) {
        self.unhook_all();
    }
}

fn entry_in_module(entry: &HookEntry, module: &ModuleRange) -> bool {
    match entry.module {
        Some(m) => m.base == module.base,
        None => module.contains(entry.hooked_addr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use divert_sdk::CallbackAction;

    struct NullCallbacks;

    impl EngineCallbacks for NullCallbacks {
        fn on_hook_called(
            &self,
            _info: &CallInfo,
            _state: &mut CallState,
            _scratch: &mut [u8; INTERCALL_SCRATCH_SIZE],
        ) -> EngineResult<CallbackAction> {
            Ok(CallbackAction::Continue)
        }
    }

    fn request(id: u32, target: usize) -> HookRequest {
        HookRequest {
            id,
            target,
            function_name: None,
            flags: HookFlags::empty(),
            db_func: None,
            custom_handlers: None,
        }
    }

    #[test]
    fn empty_batch_is_invalid() {
        let engine = HookEngine::new(Arc::new(NullCallbacks));
        assert!(matches!(
            engine.hook(&[]),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn null_target_is_invalid() {
        let engine = HookEngine::new(Arc::new(NullCallbacks));
        assert!(matches!(
            engine.hook(&[request(1, 0)]),
            Err(EngineError::InvalidArgument(_))
        ));
        assert_eq!(engine.hook_count(), 0);
    }

    #[test]
    fn contradictory_phase_flags_are_rejected() {
        let engine = HookEngine::new(Arc::new(NullCallbacks));
        let mut r = request(1, 0x1000);
        r.flags = HookFlags::ONLY_PRE_CALL | HookFlags::ONLY_POST_CALL;
        assert!(matches!(
            engine.hook(&[r]),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn duplicate_ids_within_batch_are_rejected() {
        let engine = HookEngine::new(Arc::new(NullCallbacks));
        let r1 = request(7, 0x1000);
        let r2 = request(7, 0x2000);
        assert_eq!(
            engine.hook(&[r1, r2]),
            Err(EngineError::AlreadyExists(7))
        );
        assert_eq!(engine.hook_count(), 0);
    }

    #[test]
    fn malformed_handler_blob_rejects_batch() {
        let engine = HookEngine::new(Arc::new(NullCallbacks));
        let buf = vec![0x90u8; 64];
        let mut r = request(0x1001, buf.as_ptr() as usize);
        // Declared two handlers, buffer holds none.
        r.custom_handlers = Some(vec![2, 0, 0, 0]);
        assert_eq!(engine.hook(&[r]), Err(EngineError::InvalidTransportData));
        assert_eq!(engine.hook_count(), 0);
    }

    #[test]
    fn unsupported_platform_is_rejected() {
        struct NoPlatform;
        impl EngineCallbacks for NoPlatform {
            fn on_hook_called(
                &self,
                _info: &CallInfo,
                _state: &mut CallState,
                _scratch: &mut [u8; INTERCALL_SCRATCH_SIZE],
            ) -> EngineResult<CallbackAction> {
                Ok(CallbackAction::Continue)
            }
            fn platform_supported(&self) -> bool {
                false
            }
        }
        let engine = HookEngine::new(Arc::new(NoPlatform));
        assert_eq!(
            engine.hook(&[request(1, 0x1000)]),
            Err(EngineError::NotImplemented)
        );
    }

    #[test]
    fn unknown_unhook_ids_are_silently_skipped() {
        let engine = HookEngine::new(Arc::new(NullCallbacks));
        assert!(engine.unhook(&[0xDEAD, 0xBEEF]).is_ok());
    }

    #[test]
    fn enable_unknown_id_is_not_found() {
        let engine = HookEngine::new(Arc::new(NullCallbacks));
        assert_eq!(engine.enable(9, true), Err(EngineError::NotFound));
    }

    #[test]
    fn cookies_are_monotonic_and_nonzero() {
        let engine = HookEngine::new(Arc::new(NullCallbacks));
        let mut last = 0;
        for _ in 0..100 {
            let c = engine.next_cookie();
            assert!(c > last);
            last = c;
        }
    }
}
