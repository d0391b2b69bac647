//! Session notifications for external consumers.
//!
//! Each subscriber gets its own channel and a mask of the events it cares
//! about. Publishing never blocks: a subscriber that stops draining loses new
//! events once its queue holds [`SUBSCRIBER_QUEUE`] of them, and subscribers
//! whose receiver was dropped are pruned on the next publish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::calibration::CalibrationOffset;

/// Events queued per subscriber before new ones are dropped.
pub const SUBSCRIBER_QUEUE: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// First transition into Ready for this session object.
    Ready,
    /// Ready again after a reset.
    Resumed,
    /// The camera stopped responding while Ready.
    Disconnected,
    /// Tracking init failed; frames are still served without device tracking.
    TrackingUnavailable,
    /// Init kept failing; no further attempts will be made until reset.
    OpeningAbandoned { attempts: u32 },
    CalibrationChanged(CalibrationOffset),
}

impl SessionEvent {
    pub fn kind(&self) -> EventMask {
        match self {
            SessionEvent::Ready => EventMask::READY,
            SessionEvent::Resumed => EventMask::RESUMED,
            SessionEvent::Disconnected => EventMask::DISCONNECTED,
            SessionEvent::TrackingUnavailable => EventMask::TRACKING_UNAVAILABLE,
            SessionEvent::OpeningAbandoned { .. } => EventMask::OPENING_ABANDONED,
            SessionEvent::CalibrationChanged(_) => EventMask::CALIBRATION_CHANGED,
        }
    }
}

bitflags::bitflags! {
    /// Event filter for a subscription.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(C)]
    pub struct EventMask: u32 {
        const READY = 1 << 0;
        const RESUMED = 1 << 1;
        const DISCONNECTED = 1 << 2;
        const TRACKING_UNAVAILABLE = 1 << 3;
        const OPENING_ABANDONED = 1 << 4;
        const CALIBRATION_CHANGED = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn from_u64(id: u64) -> Self {
        SubscriptionId(id)
    }
}

/// Receiving end of a subscription.
///
/// Dropping it is enough to stop receiving; [`EventHub::unsubscribe`] also
/// removes the sender right away.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    receiver: Receiver<SessionEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn try_recv(&self) -> Option<SessionEvent> {
        self.receiver.try_recv().ok()
    }

    /// `None` on timeout or after the hub went away.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SessionEvent> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Everything queued right now.
    pub fn drain(&self) -> Vec<SessionEvent> {
        self.receiver.try_iter().collect()
    }
}

struct Subscriber {
    id: SubscriptionId,
    mask: EventMask,
    sender: Sender<SessionEvent>,
}

#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, mask: EventMask) -> Subscription {
        let (sender, receiver) = crossbeam_channel::bounded(SUBSCRIBER_QUEUE);
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Subscriber { id, mask, sender });
        log::debug!("Event subscriber {} added (mask {:?})", id.0, mask);
        Subscription { id, receiver }
    }

    /// Returns whether the id was subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.lock();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        before != subs.len()
    }

    pub fn publish(&self, event: SessionEvent) {
        let kind = event.kind();
        log::debug!("Publishing {:?}", event);
        self.lock().retain(|s| {
            if !s.mask.intersects(kind) {
                return true;
            }
            match s.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    log::trace!("Event queue of subscriber {} full, dropping event", s.id.0);
                    true
                }
                Err(TrySendError::Disconnected(_)) => {
                    log::debug!("Event subscriber {} gone, removing", s.id.0);
                    false
                }
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
