//! Single-slot frame handoff between the acquisition thread and the consumer.
//!
//! The slot holds at most one frame. The consumer asks for a frame, the
//! producer fills it, the consumer takes it and thereby asks for the next.
//! Frames are never queued: if the consumer is slow the camera simply is not
//! grabbed, so memory and latency stay bounded.
//!
//! ```text
//!   Empty ──request──▶ Requested ──fill──▶ Filled ──take──▶ Requested
//!                          │
//!                          └──cancel──▶ Empty
//! ```

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use crate::types::Frame;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Slot {
    Empty,
    Requested,
    Filled(Frame),
}

/// The request/available flag pair as observed from outside.
///
/// Both are derived from one enum, so they are never true together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotFlags {
    pub requested: bool,
    pub available: bool,
}

#[derive(Debug)]
pub struct FrameSlot {
    slot: Mutex<Slot>,
    changed: Condvar,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Empty),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // Slot holds plain data; a panicked holder cannot leave it half-written.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn flags(&self) -> SlotFlags {
        let slot = self.lock();
        SlotFlags {
            requested: matches!(*slot, Slot::Requested),
            available: matches!(*slot, Slot::Filled(_)),
        }
    }

    /// Ask for a frame. No effect while a frame is waiting to be taken.
    pub fn request(&self) {
        let mut slot = self.lock();
        if matches!(*slot, Slot::Empty) {
            *slot = Slot::Requested;
            self.changed.notify_all();
        }
    }

    /// Withdraw an outstanding request, e.g. after the device disappeared.
    pub fn cancel_request(&self) {
        let mut slot = self.lock();
        if matches!(*slot, Slot::Requested) {
            *slot = Slot::Empty;
            self.changed.notify_all();
        }
    }

    pub fn is_requested(&self) -> bool {
        matches!(*self.lock(), Slot::Requested)
    }

    /// Producer side: block up to `timeout` until a frame is requested.
    pub fn wait_for_request(&self, timeout: Duration) -> bool {
        let slot = self.lock();
        let (slot, _) = self
            .changed
            .wait_timeout_while(slot, timeout, |s| !matches!(s, Slot::Requested))
            .unwrap_or_else(PoisonError::into_inner);
        matches!(*slot, Slot::Requested)
    }

    /// Producer side: build and publish a frame while holding the slot lock,
    /// so everything `build` reads is coherent with the published frame.
    ///
    /// Returns `false` without calling `build` if no frame was requested.
    pub fn fill_with<F>(&self, build: F) -> bool
    where
        F: FnOnce() -> Frame,
    {
        let mut slot = self.lock();
        if !matches!(*slot, Slot::Requested) {
            return false;
        }
        *slot = Slot::Filled(build());
        self.changed.notify_all();
        true
    }

    /// Consumer side, never blocks: take the waiting frame and request the
    /// next one. If the producer holds the lock right now the frame is picked
    /// up on a later call.
    pub fn try_take(&self) -> Option<Frame> {
        let mut slot = match self.slot.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return None,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
        };
        Self::take_locked(&mut slot, &self.changed)
    }

    /// Consumer side, blocking up to `timeout` for a frame.
    pub fn take_timeout(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if let Some(frame) = Self::take_locked(&mut slot, &self.changed) {
                return Some(frame);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            slot = self
                .changed
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn take_locked(slot: &mut Slot, changed: &Condvar) -> Option<Frame> {
        match *slot {
            Slot::Filled(frame) => {
                *slot = Slot::Requested;
                changed.notify_all();
                Some(frame)
            }
            _ => None,
        }
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}
