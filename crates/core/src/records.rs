//! Per-thread call storage
//!
//! Every thread owns a pool of per-call records: a free list and a LIFO
//! of in-flight calls. The dispatcher also holds a per-thread token while
//! it runs so a hooked API called from inside an observer passes straight
//! through instead of recursing into the engine.

use std::cell::{Cell, RefCell};

use divert_sdk::{CallState, INTERCALL_SCRATCH_SIZE};

use crate::error::EngineError;
use crate::timing::{ThreadTimes, TimeSample};

/// Stack words snapshotted at PreCall for PostCall restoration.
pub const MAX_STACK_SNAPSHOT: usize = 16;

/// State of one in-flight intercepted call.
pub struct CallRecord {
    /// Owning hook entry; compared by address when pairing PostCall.
    pub hook_entry: usize,
    /// Per-entry call number.
    pub call_id: u32,
    /// Process-wide cookie.
    pub cookie: u64,
    pub chain_depth: u32,
    pub state: CallState,
    /// Real return address captured before redirection.
    pub return_addr: usize,
    pub after_call_addr: usize,
    /// Caller stack words captured after the pre phase.
    pub saved_stack: [usize; MAX_STACK_SNAPSHOT],
    pub saved_stack_len: usize,
    pub saved_stack_base: usize,
    /// Wall clock at PreCall entry, reported in both phases.
    pub current_time_ms: f64,
    /// Samples at PreCall entry and PreCall exit.
    pub timing: [TimeSample; 2],
    pub childs_elapsed_ms: f64,
    pub child_overhead_ms: f64,
    /// Shared between the pre and post phase of the same call.
    pub scratch: Box<[u8; INTERCALL_SCRATCH_SIZE]>,
}

impl CallRecord {
    pub(crate) fn new() -> Self {
        Self {
            hook_entry: 0,
            call_id: 0,
            cookie: 0,
            chain_depth: 0,
            state: CallState::default(),
            return_addr: 0,
            after_call_addr: 0,
            saved_stack: [0; MAX_STACK_SNAPSHOT],
            saved_stack_len: 0,
            saved_stack_base: 0,
            current_time_ms: 0.0,
            timing: [TimeSample::default(); 2],
            childs_elapsed_ms: 0.0,
            child_overhead_ms: 0.0,
            scratch: Box::new([0; INTERCALL_SCRATCH_SIZE]),
        }
    }

    /// Reset everything except the allocations themselves.
    pub fn reset(&mut self) {
        self.hook_entry = 0;
        self.call_id = 0;
        self.cookie = 0;
        self.chain_depth = 0;
        self.state = CallState::default();
        self.return_addr = 0;
        self.after_call_addr = 0;
        self.saved_stack = [0; MAX_STACK_SNAPSHOT];
        self.saved_stack_len = 0;
        self.saved_stack_base = 0;
        self.current_time_ms = 0.0;
        self.timing = [TimeSample::default(); 2];
        self.childs_elapsed_ms = 0.0;
        self.child_overhead_ms = 0.0;
        self.scratch.fill(0);
    }
}

/// Per-thread pools plus the thread-time accumulators.
pub struct TlsData {
    pub free_list: Vec<Box<CallRecord>>,
    /// In-flight calls, innermost last.
    pub in_use: Vec<Box<CallRecord>>,
    pub thread_times: ThreadTimes,
}

impl TlsData {
    fn new() -> Self {
        Self {
            free_list: Vec::new(),
            in_use: Vec::new(),
            thread_times: ThreadTimes::default(),
        }
    }

    /// Take a record from the free list, or allocate one lazily.
    pub fn take_record(&mut self) -> Box<CallRecord> {
        match self.free_list.pop() {
            Some(mut r) => {
                r.reset();
                r
            }
            None => Box::new(CallRecord::new()),
        }
    }

    pub fn release_record(&mut self, record: Box<CallRecord>) {
        self.free_list.push(record);
    }
}

thread_local! {
    static DISPATCH_TOKEN: Cell<bool> = const { Cell::new(false) };
    static CALL_DATA: RefCell<TlsData> = RefCell::new(TlsData::new());
}

/// Token proving this thread is inside the dispatcher.
pub struct DispatchGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        let _ = DISPATCH_TOKEN.try_with(|t| t.set(false));
    }
}

/// Try to enter the dispatcher on this thread.
///
/// `Ok(None)` means the dispatcher is already running here (an observer
/// called a hooked API) and the call must pass through untouched.
/// `Err(Cancelled)` means the thread is tearing down its TLS.
pub fn try_enter_dispatcher() -> Result<Option<DispatchGuard>, EngineError> {
    DISPATCH_TOKEN
        .try_with(|t| {
            if t.get() {
                None
            } else {
                t.set(true);
                Some(DispatchGuard {
                    _not_send: std::marker::PhantomData,
                })
            }
        })
        .map_err(|_| EngineError::Cancelled)
}

/// Run `f` against this thread's call storage.
pub fn with_call_data<R>(f: impl FnOnce(&mut TlsData) -> R) -> Result<R, EngineError> {
    CALL_DATA
        .try_with(|d| f(&mut d.borrow_mut()))
        .map_err(|_| EngineError::Cancelled)
}
