//! Engine-level behaviour: install/uninstall fidelity, dispatcher
//! pairing, skip synthesis, overwrite detection and leak handling.
//!
//! The dispatcher is driven through fabricated save frames rather than
//! by executing generated code, so every observable contract is checked
//! without leaving safe ground.

#![cfg(all(unix, target_pointer_width = "64"))]

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use divert_core::dispatch::{self, PRE_CONTINUE, PRE_IGNORE, PRE_SKIP_FLAG};
use divert_core::sdk::{
    CallInfo, CallPhase, CallState, CallbackAction, SavedFrame64, INTERCALL_SCRATCH_SIZE,
};
use divert_core::{
    EngineCallbacks, EngineConfig, EngineError, EngineResult, FunctionInfo, HookEngine,
    HookFlags, HookRequest, ModuleRange,
};

// --- fixtures ---------------------------------------------------------

/// RWX arena holding fake function bodies, 64 bytes apart.
struct Arena {
    base: usize,
    len: usize,
}

impl Arena {
    fn new() -> Self {
        use nix::sys::mman::{mmap_anonymous, MapFlags, ProtFlags};
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let len = 0x1000;
        let mapped = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(len).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
        .expect("test arena");
        let base = mapped.as_ptr() as usize;
        for i in 0..len / 64 {
            let at = (base + i * 64) as *mut u8;
            unsafe {
                // mov eax, 42 ; nop pad ; ret
                at.write(0xB8);
                at.add(1).write(0x2A);
                at.add(2).write(0x00);
                at.add(3).write(0x00);
                at.add(4).write(0x00);
                for j in 5..63 {
                    at.add(j).write(0x90);
                }
                at.add(63).write(0xC3);
            }
        }
        Self { base, len }
    }

    fn target(&self, i: usize) -> usize {
        self.base + i * 64
    }

    fn bytes(&self, i: usize) -> [u8; 8] {
        let mut b = [0u8; 8];
        unsafe { std::ptr::copy_nonoverlapping(self.target(i) as *const u8, b.as_mut_ptr(), 8) };
        b
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Some(ptr) = std::ptr::NonNull::new(self.base as *mut std::ffi::c_void) {
            unsafe {
                let _ = nix::sys::mman::munmap(ptr, self.len);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Event {
    phase: CallPhase,
    hook_id: u32,
    cookie: u64,
    depth: u32,
}

type PreHook = Box<dyn Fn(&CallInfo, &mut CallState) -> EngineResult<CallbackAction> + Send + Sync>;

/// Records every observer delivery; an optional closure mutates state
/// during the pre phase.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
    on_pre: Mutex<Option<PreHook>>,
    overwritten: Mutex<Vec<Vec<u32>>>,
    errors: Mutex<Vec<EngineError>>,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn set_on_pre(&self, f: PreHook) {
        *self.on_pre.lock().unwrap() = Some(f);
    }
}

impl EngineCallbacks for Recorder {
    fn on_hook_called(
        &self,
        info: &CallInfo,
        state: &mut CallState,
        _scratch: &mut [u8; INTERCALL_SCRATCH_SIZE],
    ) -> EngineResult<CallbackAction> {
        self.events.lock().unwrap().push(Event {
            phase: info.phase,
            hook_id: info.hook_id,
            cookie: info.cookie,
            depth: info.chain_depth,
        });
        if info.phase == CallPhase::PreCall {
            if let Some(f) = self.on_pre.lock().unwrap().as_ref() {
                return f(info, state);
            }
        }
        Ok(CallbackAction::Continue)
    }

    fn on_hook_overwritten(&self, ids: &[u32]) {
        self.overwritten.lock().unwrap().push(ids.to_vec());
    }

    fn on_error(&self, error: EngineError) {
        self.errors.lock().unwrap().push(error);
    }
}

struct Func(&'static str, Option<u32>);

impl FunctionInfo for Func {
    fn name(&self) -> &str {
        self.0
    }

    fn stack_return_size(&self) -> Option<u32> {
        self.1
    }
}

fn request(id: u32, target: usize) -> HookRequest {
    HookRequest {
        id,
        target,
        function_name: None,
        flags: HookFlags::empty(),
        db_func: Some(Arc::new(Func("test_fn", Some(0)))),
        custom_handlers: None,
    }
}

/// Fabricated template save frame plus the stack above it.
#[repr(C)]
struct TestStack {
    frame: SavedFrame64,
    ret_slot: usize,
    upper: [usize; 16],
}

impl TestStack {
    fn new(ret_addr: usize) -> Box<Self> {
        let mut s = Box::new(TestStack {
            frame: SavedFrame64::zeroed(),
            ret_slot: ret_addr,
            upper: [0; 16],
        });
        s.frame.rdi = 3;
        s.frame.rsi = 4;
        s
    }

    fn sp(&mut self) -> usize {
        self as *mut Self as usize
    }
}

fn drive_pre(engine: &Arc<HookEngine>, id: u32, stack: &mut TestStack) -> usize {
    let entry = engine.hook_entry(id).expect("installed entry");
    let sp = stack.sp();
    dispatch::pre_call_common(Arc::as_ptr(engine), Arc::as_ptr(&entry), sp)
}

fn drive_post(engine: &Arc<HookEngine>, id: u32, stack: &mut TestStack) -> usize {
    let entry = engine.hook_entry(id).expect("installed entry");
    let sp = stack.sp();
    dispatch::post_call_common(Arc::as_ptr(engine), Arc::as_ptr(&entry), sp)
}

// --- install / uninstall ---------------------------------------------

#[test]
fn install_uninstall_restores_bytes_bit_identically() {
    let arena = Arena::new();
    let recorder = Arc::new(Recorder::default());
    let engine = HookEngine::new(recorder);

    let before: Vec<[u8; 8]> = (0..3).map(|i| arena.bytes(i)).collect();
    let reqs: Vec<HookRequest> = (0..3).map(|i| request(0x10 + i as u32, arena.target(i))).collect();
    engine.hook(&reqs).unwrap();
    for i in 0..3 {
        assert_eq!(arena.bytes(i)[0], 0xE9, "target {i} not patched");
    }

    engine.unhook(&[0x10, 0x11, 0x12]).unwrap();
    for i in 0..3 {
        assert_eq!(arena.bytes(i), before[i], "target {i} bytes changed");
    }
    assert_eq!(engine.hook_count(), 0);
}

#[test]
fn unhooking_the_middle_hook_leaves_the_others_armed() {
    let arena = Arena::new();
    let engine = HookEngine::new(Arc::new(Recorder::default()));
    let before = arena.bytes(1);

    let reqs: Vec<HookRequest> = (0..3).map(|i| request(1 + i as u32, arena.target(i))).collect();
    engine.hook(&reqs).unwrap();
    engine.unhook(&[2]).unwrap();

    assert_eq!(arena.bytes(0)[0], 0xE9);
    assert_eq!(arena.bytes(1), before);
    assert_eq!(arena.bytes(2)[0], 0xE9);
    assert_eq!(engine.hook_count(), 2);
    engine.unhook_all();
}

#[test]
fn trampolines_are_within_near_jump_reach() {
    let arena = Arena::new();
    let engine = HookEngine::new(Arc::new(Recorder::default()));
    let reqs: Vec<HookRequest> = (0..8).map(|i| request(i as u32 + 1, arena.target(i))).collect();
    engine.hook(&reqs).unwrap();
    for i in 0..8u32 {
        let entry = engine.hook_entry(i + 1).unwrap();
        let (base, _) = entry.tramp_range().unwrap();
        assert!(
            entry.hooked_addr.abs_diff(base) < (1usize << 31) - 64,
            "trampoline out of rel32 reach"
        );
    }
    engine.unhook_all();
}

#[test]
fn duplicate_id_against_installed_hook_is_rejected() {
    let arena = Arena::new();
    let engine = HookEngine::new(Arc::new(Recorder::default()));
    engine.hook(&[request(5, arena.target(0))]).unwrap();
    let err = engine.hook(&[request(5, arena.target(1))]);
    assert_eq!(err, Err(EngineError::AlreadyExists(5)));
    // The failed batch installed nothing.
    assert_eq!(arena.bytes(1)[0], 0xB8);
    engine.unhook_all();
}

// --- dispatcher -------------------------------------------------------

#[test]
fn pre_and_post_pair_with_matching_cookies() {
    let arena = Arena::new();
    let recorder = Arc::new(Recorder::default());
    let engine = HookEngine::new(recorder.clone());
    engine.hook(&[request(0x42, arena.target(0))]).unwrap();

    let entry = engine.hook_entry(0x42).unwrap();
    let mark = entry.tramp().unwrap().after_call_mark;

    let mut pre_stack = TestStack::new(0xCAFE_0000);
    assert_eq!(drive_pre(&engine, 0x42, &mut pre_stack), PRE_CONTINUE);
    // The return slot now diverts the body's ret into the trampoline.
    assert_eq!(pre_stack.ret_slot, mark);

    let mut post_stack = TestStack::new(0);
    assert_eq!(drive_post(&engine, 0x42, &mut post_stack), 0xCAFE_0000);

    let events = recorder.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].phase, CallPhase::PreCall);
    assert_eq!(events[1].phase, CallPhase::PostCall);
    assert_eq!(events[0].cookie, events[1].cookie);
    assert_ne!(events[0].cookie, 0);
    assert_eq!(events[0].depth, 1);
    engine.unhook_all();
}

#[test]
fn nested_calls_report_depth_and_ordered_cookies() {
    let arena = Arena::new();
    let recorder = Arc::new(Recorder::default());
    let engine = HookEngine::new(recorder.clone());
    engine
        .hook(&[request(0x2001, arena.target(0)), request(0x2002, arena.target(1))])
        .unwrap();

    // f calls g: Pre(f), Pre(g), Post(g), Post(f).
    let mut f_pre = TestStack::new(0xAAAA_0000);
    let mut g_pre = TestStack::new(0xBBBB_0000);
    assert_eq!(drive_pre(&engine, 0x2001, &mut f_pre), PRE_CONTINUE);
    assert_eq!(drive_pre(&engine, 0x2002, &mut g_pre), PRE_CONTINUE);

    let mut g_post = TestStack::new(0);
    let mut f_post = TestStack::new(0);
    assert_eq!(drive_post(&engine, 0x2002, &mut g_post), 0xBBBB_0000);
    assert_eq!(drive_post(&engine, 0x2001, &mut f_post), 0xAAAA_0000);

    let events = recorder.events();
    let kinds: Vec<(CallPhase, u32, u32)> =
        events.iter().map(|e| (e.phase, e.hook_id, e.depth)).collect();
    assert_eq!(
        kinds,
        vec![
            (CallPhase::PreCall, 0x2001, 1),
            (CallPhase::PreCall, 0x2002, 2),
            (CallPhase::PostCall, 0x2002, 2),
            (CallPhase::PostCall, 0x2001, 1),
        ]
    );
    // Inner call drew the later cookie.
    assert!(events[1].cookie > events[0].cookie);
    assert_eq!(events[1].cookie, events[2].cookie);
    assert_eq!(events[0].cookie, events[3].cookie);
    engine.unhook_all();
}

#[test]
fn orphaned_records_are_discarded_at_the_next_post() {
    let arena = Arena::new();
    let recorder = Arc::new(Recorder::default());
    let engine = HookEngine::new(recorder.clone());
    engine
        .hook(&[request(1, arena.target(0)), request(2, arena.target(1))])
        .unwrap();

    let mut f_pre = TestStack::new(0x1111_0000);
    let mut g_pre = TestStack::new(0x2222_0000);
    drive_pre(&engine, 1, &mut f_pre);
    drive_pre(&engine, 2, &mut g_pre);

    // g's frame was unwound by an exception: Post(f) arrives next and
    // must still recover f's return address.
    let mut f_post = TestStack::new(0);
    assert_eq!(drive_post(&engine, 1, &mut f_post), 0x1111_0000);
    engine.unhook_all();
}

#[test]
fn untouched_registers_survive_the_round_trip() {
    let arena = Arena::new();
    let engine = HookEngine::new(Arc::new(Recorder::default()));
    engine.hook(&[request(7, arena.target(0))]).unwrap();

    let mut stack = TestStack::new(0x5555_0000);
    let mut expect = SavedFrame64::zeroed();
    expect.rdi = 3;
    expect.rsi = 4;
    drive_pre(&engine, 7, &mut stack);
    // Everything except the return slot is bit-identical.
    assert_eq!(stack.frame.rax, expect.rax);
    assert_eq!(stack.frame.rdi, expect.rdi);
    assert_eq!(stack.frame.rsi, expect.rsi);
    assert_eq!(stack.frame.r11, expect.r11);
    assert_eq!(stack.frame.xmm, expect.xmm);

    let mut post = TestStack::new(0);
    drive_post(&engine, 7, &mut post);
    engine.unhook_all();
}

#[test]
fn observer_mutations_reach_the_save_area() {
    let arena = Arena::new();
    let recorder = Arc::new(Recorder::default());
    recorder.set_on_pre(Box::new(|_info, state| {
        // Scenario: add 10 to the second integer argument.
        state.registers.rsi += 10;
        state.os_last_error = 77;
        Ok(CallbackAction::Continue)
    }));
    let engine = HookEngine::new(recorder.clone());
    engine.hook(&[request(0x1001, arena.target(0))]).unwrap();

    divert_core::memory::set_last_os_error(0);
    let mut stack = TestStack::new(0x9999_0000);
    assert_eq!(drive_pre(&engine, 0x1001, &mut stack), PRE_CONTINUE);
    assert_eq!(stack.frame.rsi, 14);
    assert_eq!(divert_core::memory::last_os_error(), 77);

    let mut post = TestStack::new(0);
    drive_post(&engine, 0x1001, &mut post);
    engine.unhook_all();
}

#[test]
fn skip_call_synthesises_the_return() {
    let arena = Arena::new();
    let recorder = Arc::new(Recorder::default());
    recorder.set_on_pre(Box::new(|_info, state| {
        state.skip_call = 1;
        state.registers.set_return_value(99);
        Ok(CallbackAction::Continue)
    }));
    let engine = HookEngine::new(recorder.clone());
    engine.hook(&[request(0x1002, arena.target(0))]).unwrap();

    let mut stack = TestStack::new(0x7777_0000);
    let verdict = drive_pre(&engine, 0x1002, &mut stack);
    assert_eq!(verdict, PRE_SKIP_FLAG); // stack_return_size = 0
    // The synthesised return value is in the save area...
    assert_eq!(stack.frame.rax, 99);
    // ...and the return slot was left alone: the body never runs and the
    // template returns straight to the caller.
    assert_eq!(stack.ret_slot, 0x7777_0000);
    // No record left in flight.
    assert_eq!(recorder.events().len(), 1);
    engine.unhook_all();
}

#[test]
fn skip_with_unknown_pop_count_runs_the_body() {
    let arena = Arena::new();
    let recorder = Arc::new(Recorder::default());
    recorder.set_on_pre(Box::new(|_info, state| {
        state.skip_call = 1;
        Ok(CallbackAction::Continue)
    }));
    let engine = HookEngine::new(recorder.clone());
    let mut req = request(3, arena.target(0));
    req.db_func = None; // pop count unknown
    engine.hook(&[req]).unwrap();

    let mut stack = TestStack::new(0x1234_0000);
    assert_eq!(drive_pre(&engine, 3, &mut stack), PRE_CONTINUE);
    let mut post = TestStack::new(0);
    assert_eq!(drive_post(&engine, 3, &mut post), 0x1234_0000);
    engine.unhook_all();
}

#[test]
fn observer_calling_a_hooked_api_passes_through() {
    let arena = Arena::new();
    let recorder = Arc::new(Recorder::default());
    let engine = HookEngine::new(recorder.clone());
    engine.hook(&[request(0x600, arena.target(0))]).unwrap();

    let engine_ptr = Arc::downgrade(&engine);
    let inner_result = Arc::new(AtomicUsize::new(usize::MAX));
    let inner_result_out = inner_result.clone();
    recorder.set_on_pre(Box::new(move |_info, _state| {
        // The observer itself hits a hooked function.
        if let Some(engine) = engine_ptr.upgrade() {
            let mut inner = TestStack::new(0x4444_0000);
            let entry = engine.hook_entry(0x600).expect("entry");
            let sp = inner.sp();
            let r = dispatch::pre_call_common(Arc::as_ptr(&engine), Arc::as_ptr(&entry), sp);
            inner_result_out.store(r, Ordering::SeqCst);
            // The inner call was ignored: no redirection happened.
            assert_eq!(inner.ret_slot, 0x4444_0000);
        }
        Ok(CallbackAction::Continue)
    }));

    let mut stack = TestStack::new(0x3333_0000);
    assert_eq!(drive_pre(&engine, 0x600, &mut stack), PRE_CONTINUE);
    assert_eq!(inner_result.load(Ordering::SeqCst), PRE_IGNORE);
    // Only the outer pre was observed.
    assert_eq!(recorder.events().len(), 1);

    let mut post = TestStack::new(0);
    drive_post(&engine, 0x600, &mut post);
    engine.unhook_all();
}

#[test]
fn disabled_hook_sets_the_template_flag_byte() {
    let arena = Arena::new();
    let engine = HookEngine::new(Arc::new(Recorder::default()));
    engine.hook(&[request(0x51, arena.target(0))]).unwrap();
    let entry = engine.hook_entry(0x51).unwrap();
    let flags_addr = entry.tramp().unwrap().flags_addr as *const u8;

    unsafe {
        assert_eq!(*flags_addr, 0, "hooks start enabled");
        engine.enable(0x51, false).unwrap();
        assert_eq!(*flags_addr, 1);
        engine.enable(0x51, true).unwrap();
        assert_eq!(*flags_addr, 0);
    }
    engine.unhook_all();
}

// --- async notifications ---------------------------------------------

#[test]
fn async_hooks_queue_instead_of_calling_inline() {
    let arena = Arena::new();
    let recorder = Arc::new(Recorder::default());
    let engine = HookEngine::new(recorder.clone());
    let mut req = request(0x70, arena.target(0));
    req.flags = HookFlags::ASYNC_CALLBACKS;
    engine.hook(&[req]).unwrap();

    let mut stack = TestStack::new(0x1212_0000);
    assert_eq!(drive_pre(&engine, 0x70, &mut stack), PRE_CONTINUE);
    // Nothing delivered inline.
    assert!(recorder.events().is_empty());
    assert_eq!(engine.pending_notifications(), 1);

    assert_eq!(engine.pump_notifications(), 1);
    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].phase, CallPhase::PreCall);
    assert_eq!(events[0].hook_id, 0x70);

    let mut post = TestStack::new(0);
    drive_post(&engine, 0x70, &mut post);
    engine.unhook_all();
}

// --- overwrite detection ---------------------------------------------

#[test]
fn overwritten_hooks_are_reported_exactly_once() {
    let arena = Arena::new();
    let recorder = Arc::new(Recorder::default());
    let engine = HookEngine::new(recorder.clone());
    engine
        .hook(&[request(0x90, arena.target(0)), request(0x91, arena.target(1))])
        .unwrap();

    engine.check_overwritten_hooks().unwrap();
    assert!(recorder.overwritten.lock().unwrap().is_empty());

    // A third party stomps the first target.
    unsafe { (arena.target(0) as *mut u8).write(0xCC) };

    engine.check_overwritten_hooks().unwrap();
    engine.check_overwritten_hooks().unwrap();
    let reports = recorder.overwritten.lock().unwrap().clone();
    assert_eq!(reports, vec![vec![0x90]], "one report, no repeats");

    assert_eq!(engine.query_overwritten_hooks(&[0x90, 0x91, 0x7F]), vec![1, 0, 0]);
    engine.unhook_all();
}

#[test]
fn high_bit_ids_are_exempt_from_overwrite_checks() {
    let arena = Arena::new();
    let recorder = Arc::new(Recorder::default());
    let engine = HookEngine::new(recorder.clone());
    engine.hook(&[request(0x8000_0001, arena.target(0))]).unwrap();

    unsafe { (arena.target(0) as *mut u8).write(0xCC) };
    engine.check_overwritten_hooks().unwrap();
    assert!(recorder.overwritten.lock().unwrap().is_empty());
    assert_eq!(engine.query_overwritten_hooks(&[0x8000_0001]), vec![0]);
    engine.unhook_all();
}

// --- leak handling ----------------------------------------------------

#[test]
fn busy_trampoline_leaks_and_stays_visible() {
    let arena = Arena::new();
    let engine = HookEngine::with_config(
        Arc::new(Recorder::default()),
        EngineConfig {
            drain_retries: 3,
            drain_backoff_ms: 1,
            ..EngineConfig::default()
        },
    );
    engine.hook(&[request(0xA0, arena.target(0))]).unwrap();
    let entry = engine.hook_entry(0xA0).unwrap();
    let tramp = entry.tramp().unwrap();
    let (tramp_base, _) = entry.tramp_range().unwrap();

    // A thread parked inside the trampoline forever.
    unsafe { (tramp.counter_addr as *mut usize).write(1) };

    // Unhook still reports success, the entry leaves the registry, the
    // bytes stay patched, and the trampoline remains known.
    engine.unhook(&[0xA0]).unwrap();
    assert_eq!(engine.hook_count(), 0);
    assert!(engine.hook_entry(0xA0).is_none());
    assert_eq!(arena.bytes(0)[0], 0xE9);
    assert!(engine.check_if_in_trampoline(tramp_base + 4));
    assert!(!engine.check_if_in_trampoline(arena.target(1)));

    // Clear the counter so engine drop does not wait.
    unsafe { (tramp.counter_addr as *mut usize).write(0) };
}

#[test]
fn drain_loop_retries_until_the_counter_clears() {
    use divert_core::{IpRange, ThreadSuspender};

    // Suspender that simulates the busy thread leaving the trampoline
    // after a couple of drain rounds.
    struct DrainingSuspender {
        counter_addr: Arc<AtomicUsize>,
        suspends: Arc<AtomicUsize>,
    }

    impl ThreadSuspender for DrainingSuspender {
        fn suspend(&mut self, _ranges: &[IpRange]) -> EngineResult<()> {
            let n = self.suspends.fetch_add(1, Ordering::SeqCst);
            if n >= 2 {
                let addr = self.counter_addr.load(Ordering::SeqCst);
                if addr != 0 {
                    unsafe { (addr as *mut usize).write(0) };
                }
            }
            Ok(())
        }

        fn resume(&mut self) {}

        fn any_thread_in_range(&self, _range: IpRange) -> bool {
            false
        }
    }

    struct DrainingCallbacks {
        counter_addr: Arc<AtomicUsize>,
        suspends: Arc<AtomicUsize>,
    }

    impl EngineCallbacks for DrainingCallbacks {
        fn on_hook_called(
            &self,
            _info: &CallInfo,
            _state: &mut CallState,
            _scratch: &mut [u8; INTERCALL_SCRATCH_SIZE],
        ) -> EngineResult<CallbackAction> {
            Ok(CallbackAction::Continue)
        }

        fn create_suspender(&self) -> Box<dyn ThreadSuspender> {
            Box::new(DrainingSuspender {
                counter_addr: self.counter_addr.clone(),
                suspends: self.suspends.clone(),
            })
        }
    }

    let arena = Arena::new();
    let before = arena.bytes(0);
    let counter_addr = Arc::new(AtomicUsize::new(0));
    let suspends = Arc::new(AtomicUsize::new(0));
    let engine = HookEngine::with_config(
        Arc::new(DrainingCallbacks {
            counter_addr: counter_addr.clone(),
            suspends: suspends.clone(),
        }),
        EngineConfig {
            drain_backoff_ms: 1,
            ..EngineConfig::default()
        },
    );
    engine.hook(&[request(0xC0, arena.target(0))]).unwrap();
    let entry = engine.hook_entry(0xC0).unwrap();
    let tramp = entry.tramp().unwrap();
    counter_addr.store(tramp.counter_addr, Ordering::SeqCst);
    unsafe { (tramp.counter_addr as *mut usize).write(1) };
    drop(entry);

    suspends.store(0, Ordering::SeqCst);
    engine.unhook(&[0xC0]).unwrap();
    // The drain loop went around more than once, then restored cleanly.
    assert!(suspends.load(Ordering::SeqCst) >= 3);
    assert_eq!(arena.bytes(0), before);
    assert_eq!(engine.hook_count(), 0);
}

// --- unload reaping ---------------------------------------------------

#[test]
fn module_unload_reaps_contained_hooks() {
    let arena = Arena::new();
    let engine = HookEngine::new(Arc::new(Recorder::default()));
    let before = arena.bytes(0);
    engine
        .hook(&[request(1, arena.target(0)), request(2, arena.target(1))])
        .unwrap();

    engine.dll_unload_unhook(ModuleRange {
        base: arena.base,
        len: 64, // only the first target
    });
    assert_eq!(engine.hook_count(), 1);
    assert_eq!(arena.bytes(0), before);
    assert_eq!(arena.bytes(1)[0], 0xE9);
    engine.unhook_all();
}

// --- last-error discipline -------------------------------------------

#[test]
fn last_error_is_preserved_when_nobody_touches_it() {
    let arena = Arena::new();
    let engine = HookEngine::new(Arc::new(Recorder::default()));
    engine.hook(&[request(0xB0, arena.target(0))]).unwrap();

    divert_core::memory::set_last_os_error(123);
    let mut stack = TestStack::new(0x6666_0000);
    drive_pre(&engine, 0xB0, &mut stack);
    assert_eq!(divert_core::memory::last_os_error(), 123);
    let mut post = TestStack::new(0);
    drive_post(&engine, 0xB0, &mut post);
    assert_eq!(divert_core::memory::last_os_error(), 123);
    engine.unhook_all();
}
