//! divert - in-process function interception
//!
//! Given the absolute address of a function, the engine diverts its first
//! bytes through a fabricated trampoline so observers are notified before
//! and after every future invocation. Observers may inspect and mutate
//! registers, parameter memory and the OS last-error value, or skip the
//! real body entirely while synthesising a return value. Hooks coexist,
//! can be enabled and disabled at runtime, and are removed safely while
//! other threads may be mid-call.
//!
//! # Re-exports
//!
//! The [`sdk`] crate (register frames and call records) is re-exported
//! for convenience.

pub use divert_sdk as sdk;

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod entry;
pub mod error;
pub mod flags;
pub mod handlers;
pub mod host;
pub mod memory;
pub mod notify;
pub mod records;
pub mod slots;
pub mod stub;
pub mod suspend;
pub mod template;
pub mod timing;
pub mod trampoline;

mod patcher;

// Re-export the public surface.
pub use config::{ConfigError, EngineConfig};
pub use engine::{HookEngine, HookRequest};
pub use entry::{HookEntry, HookState};
pub use error::{EngineError, EngineResult};
pub use flags::{EntryFlags, HookFlags};
pub use handlers::HandlerDescriptor;
pub use host::{CustomHandler, EngineCallbacks, FunctionInfo, ModuleRange};
pub use notify::Notification;
pub use suspend::{IpRange, SingleThreadSuspender, ThreadSuspender};

// Observer-facing types from the SDK.
pub use divert_sdk::{
    CallInfo, CallPhase, CallState, CallbackAction, RegisterSet, INTERCALL_SCRATCH_SIZE,
};
