//! Async observer notifications
//!
//! Hooks flagged `ASYNC_CALLBACKS` must not block the intercepted thread
//! on the observer, and the engine owns no threads of its own, so the
//! dispatcher drops a snapshot into a bounded channel and the host drains
//! it from whatever thread suits it. Register or skip mutations made on
//! queued deliveries are discarded by construction: the call has moved on.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use divert_sdk::{CallInfo, CallState, INTERCALL_SCRATCH_SIZE};

use crate::host::EngineCallbacks;

/// One queued observer delivery.
pub struct Notification {
    pub info: CallInfo,
    pub state: CallState,
    pub scratch: Box<[u8; INTERCALL_SCRATCH_SIZE]>,
}

pub(crate) struct NotifyQueue {
    sender: Sender<Notification>,
    receiver: Receiver<Notification>,
    capacity: usize,
}

impl NotifyQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self {
            sender,
            receiver,
            capacity: capacity.max(1),
        }
    }

    /// Queue one delivery; a full queue drops it with a warning rather
    /// than stalling the intercepted thread.
    pub fn push(&self, notification: Notification) {
        match self.sender.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                tracing::warn!(
                    "notification queue full, dropping cookie {} for hook {:#x}",
                    n.info.cookie,
                    n.info.hook_id
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::error!("notification queue disconnected");
            }
        }
    }

    /// Deliver up to one queue's worth of pending notifications.
    pub fn pump(&self, callbacks: &dyn EngineCallbacks) -> usize {
        let mut count = 0;
        while let Ok(mut n) = self.receiver.try_recv() {
            // Mutations on an async delivery have nothing to apply to.
            let _ = callbacks.on_hook_called(&n.info, &mut n.state, &mut n.scratch);
            count += 1;
            if count >= self.capacity {
                break;
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }
}
