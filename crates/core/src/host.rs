//! Host-facing interfaces
//!
//! The engine mediates calls; everything it learns or decides goes out
//! through [`EngineCallbacks`]. All methods except `on_hook_called` have
//! conservative defaults so a minimal host only implements one method.

use std::sync::Arc;

use divert_sdk::{CallInfo, CallState, CallbackAction, INTERCALL_SCRATCH_SIZE};

use crate::error::{EngineError, EngineResult};
use crate::suspend::{SingleThreadSuspender, ThreadSuspender};

/// Address range of a loaded module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModuleRange {
    pub base: usize,
    pub len: usize,
}

impl ModuleRange {
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.len
    }
}

/// A user-supplied observer living in a named external module, attached
/// per hook and invoked before the outer callback.
pub trait CustomHandler: Send + Sync {
    fn on_call(
        &self,
        info: &CallInfo,
        state: &mut CallState,
        scratch: &mut [u8; INTERCALL_SCRATCH_SIZE],
    ) -> EngineResult<CallbackAction>;
}

/// Everything the engine consumes from its host.
pub trait EngineCallbacks: Send + Sync {
    /// Outer observer notification, both phases. May be invoked
    /// concurrently from different threads.
    fn on_hook_called(
        &self,
        info: &CallInfo,
        state: &mut CallState,
        scratch: &mut [u8; INTERCALL_SCRATCH_SIZE],
    ) -> EngineResult<CallbackAction>;

    /// Batched report from the overwrite detector.
    fn on_hook_overwritten(&self, _ids: &[u32]) {}

    /// Dispatcher-side errors that must not propagate into the
    /// intercepted program.
    fn on_error(&self, _error: EngineError) {}

    /// Calls made on threads the host considers internal are passed
    /// through unobserved.
    fn is_system_thread(&self) -> bool {
        false
    }

    /// Whether the OS loader lock is currently held by this thread.
    fn is_loader_lock_held(&self) -> bool {
        false
    }

    /// Hooks flagged `INVALIDATE_CACHE` dirty the host's module
    /// enumerator on every pre call.
    fn invalidate_module_cache(&self) {}

    /// Module containing `addr`, if the host tracks one; drives the
    /// unload reaper.
    fn find_module(&self, _addr: usize) -> Option<ModuleRange> {
        None
    }

    /// Whether the platform supports the patch protocol at all.
    fn platform_supported(&self) -> bool {
        true
    }

    /// Resolve a custom handler named by the transport blob.
    fn resolve_custom_handler(
        &self,
        _dll_name: &str,
        _handler_name: &str,
        _flags: u32,
    ) -> EngineResult<Arc<dyn CustomHandler>> {
        Err(EngineError::NotFound)
    }

    /// Suspension utility for one install or uninstall operation.
    fn create_suspender(&self) -> Box<dyn ThreadSuspender> {
        Box::new(SingleThreadSuspender::default())
    }
}

/// Metadata catalogue view of one function ("DbFunc").
pub trait FunctionInfo: Send + Sync {
    fn name(&self) -> &str;

    /// Bytes the target pops on return, `None` when unknown. Zero for
    /// caller-clean conventions.
    fn stack_return_size(&self) -> Option<u32>;
}
