//! divert SDK - types shared between the interception engine and observers
//!
//! This crate contains the register save-area layouts written by the
//! trampoline templates, the register sets handed to observers, and the
//! per-call records. It has no dependencies so it can be consumed from any
//! host without pulling in the engine.

pub mod call;
pub mod frame;
pub mod registers;

pub use call::{CallInfo, CallPhase, CallState, CallbackAction, INTERCALL_SCRATCH_SIZE, STACK_TRACE_DEPTH};
pub use frame::{SavedFrame32, SavedFrame64, Xmm, SAVED_FRAME32_SIZE, SAVED_FRAME64_SIZE};
pub use registers::{RegisterSet, RegisterSet32, RegisterSet64};
