//! Per-call records shared with observers

use std::sync::Arc;

use crate::registers::RegisterSet;

/// Bytes of scratch space custom handlers may use to pass state from the
/// pre phase to the post phase of the same call.
pub const INTERCALL_SCRATCH_SIZE: usize = 256;

/// Frames captured when stack walking is enabled.
pub const STACK_TRACE_DEPTH: usize = 10;

/// Which side of the intercepted call an observer is seeing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallPhase {
    PreCall,
    PostCall,
}

/// Outcome of a custom handler or the outer callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    /// Keep going: run the remaining handlers and the outer callback.
    Continue,
    /// Do not forward this call to the outer callback.
    Suppress,
}

/// Mutable state of one intercepted call.
///
/// Observers may rewrite `registers`, `skip_call` and `os_last_error`
/// during the pre phase; the dispatcher applies the changes before the
/// real body runs (or instead of it, when `skip_call` is set).
#[derive(Clone, Debug)]
pub struct CallState {
    pub registers: RegisterSet,
    /// Snapshot of `registers` taken after the pre-phase observers ran;
    /// used to restore caller stack words after the body returns.
    pub pre_call_registers: RegisterSet,
    /// Non-zero asks the engine not to enter the real body.
    pub skip_call: u32,
    /// OS last-error value as seen by (and written back for) the caller.
    pub os_last_error: u32,
    /// Return addresses walked from the interception point; unused
    /// entries are zero.
    pub stack_trace: [usize; STACK_TRACE_DEPTH],
}

impl Default for CallState {
    fn default() -> Self {
        Self {
            registers: RegisterSet::default(),
            pre_call_registers: RegisterSet::default(),
            skip_call: 0,
            os_last_error: 0,
            stack_trace: [0; STACK_TRACE_DEPTH],
        }
    }
}

/// Immutable description of one observer notification.
#[derive(Clone, Debug)]
pub struct CallInfo {
    pub hook_id: u32,
    /// Process-wide, never-zero, strictly increasing call cookie.
    pub cookie: u64,
    pub phase: CallPhase,
    /// Display name of the hooked function.
    pub function_name: Arc<str>,
    pub thread_id: u64,
    /// 1 for a top-level intercepted call, parent depth + 1 for calls
    /// made beneath another intercepted call on the same thread.
    pub chain_depth: u32,
    /// Observer notifications for this hook are queued, not inline.
    pub async_callbacks: bool,
    pub current_time_ms: f64,
    /// Post phase only: body time minus accumulated child overhead.
    pub elapsed_time_ms: f64,
    pub childs_elapsed_time_ms: f64,
    pub kernel_time_ms: f64,
    pub user_time_ms: f64,
    pub cpu_cycles: u64,
}
