//! Hook flag sets
//!
//! `HookFlags` is what callers pass to `hook()`; `EntryFlags` is the
//! per-entry set the dispatcher consults. The translation mirrors the
//! request semantics: entries observe both phases unless one of the
//! `ONLY_*` bits narrows them.

use bitflags::bitflags;

use crate::error::EngineError;

bitflags! {
    /// Flags accepted on a hook request.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct HookFlags: u32 {
        /// Observe the pre phase only.
        const ONLY_PRE_CALL = 1 << 0;
        /// Observe the post phase only.
        const ONLY_POST_CALL = 1 << 1;
        /// Queue observer notifications instead of calling inline.
        const ASYNC_CALLBACKS = 1 << 2;
        /// Skip handlers and callback while the OS loader lock is held.
        const DONT_CALL_ON_LDR_LOCK = 1 << 3;
        /// Skip only custom handlers while the loader lock is held.
        const DONT_CALL_CUSTOM_HANDLERS_ON_LDR_LOCK = 1 << 4;
        /// Dirty the host's module enumerator on every pre call.
        const INVALIDATE_CACHE = 1 << 5;
        /// Do not capture a stack trace.
        const DISABLE_STACK_WALK = 1 << 6;
        /// Hook the given address literally instead of stepping over
        /// leading unconditional jumps.
        const DONT_SKIP_JUMPS = 1 << 7;
    }
}

bitflags! {
    /// Per-entry flags consulted by the dispatcher.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const CALL_PRE_CALL = 1 << 0;
        const CALL_POST_CALL = 1 << 1;
        const ASYNC_CALLBACKS = 1 << 2;
        const DONT_CALL_ON_LDR_LOCK = 1 << 3;
        const DONT_CALL_CUSTOM_HANDLERS_ON_LDR_LOCK = 1 << 4;
        const INVALIDATE_CACHE = 1 << 5;
        const DISABLE_STACK_WALK = 1 << 6;
    }
}

impl EntryFlags {
    /// Translate request flags, rejecting contradictory phase narrowing.
    pub fn from_request(flags: HookFlags) -> Result<Self, EngineError> {
        if flags.contains(HookFlags::ONLY_PRE_CALL | HookFlags::ONLY_POST_CALL) {
            return Err(EngineError::InvalidArgument(
                "ONLY_PRE_CALL and ONLY_POST_CALL are mutually exclusive",
            ));
        }
        let mut out = EntryFlags::CALL_PRE_CALL | EntryFlags::CALL_POST_CALL;
        if flags.contains(HookFlags::ONLY_PRE_CALL) {
            out.remove(EntryFlags::CALL_POST_CALL);
        } else if flags.contains(HookFlags::ONLY_POST_CALL) {
            out.remove(EntryFlags::CALL_PRE_CALL);
        }
        if flags.contains(HookFlags::ASYNC_CALLBACKS) {
            out.insert(EntryFlags::ASYNC_CALLBACKS);
        }
        if flags.contains(HookFlags::DONT_CALL_ON_LDR_LOCK) {
            out.insert(EntryFlags::DONT_CALL_ON_LDR_LOCK);
        }
        if flags.contains(HookFlags::DONT_CALL_CUSTOM_HANDLERS_ON_LDR_LOCK) {
            out.insert(EntryFlags::DONT_CALL_CUSTOM_HANDLERS_ON_LDR_LOCK);
        }
        if flags.contains(HookFlags::INVALIDATE_CACHE) {
            out.insert(EntryFlags::INVALIDATE_CACHE);
        }
        if flags.contains(HookFlags::DISABLE_STACK_WALK) {
            out.insert(EntryFlags::DISABLE_STACK_WALK);
        }
        Ok(out)
    }
}
