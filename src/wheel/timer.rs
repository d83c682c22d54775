use log::warn;
use smallvec::SmallVec;

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// The current wall clock in whole seconds since the UNIX epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// A deadline accepted by the timer API.
///
/// All forms reduce to an integer count of seconds from now via
/// [`normalize`]. Whole numbers below the current UNIX time are taken as
/// seconds-from-now; larger ones as absolute timestamps. Absolute instants
/// in the past yield zero.
///
/// [`normalize`]: #method.normalize
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Expiration {
    /// Seconds from now, or an absolute UNIX timestamp if larger than now.
    Seconds(u64),
    /// A span of time from now.
    Span(Duration),
    /// An absolute point in time.
    At(SystemTime),
}

impl Expiration {
    /// Reduce to whole seconds from now.
    pub fn normalize(self) -> u64 {
        self.normalize_at(unix_now())
    }

    fn normalize_at(self, now: u64) -> u64 {
        match self {
            Expiration::Seconds(secs) => {
                if secs > now {
                    secs - now
                } else {
                    secs
                }
            }
            Expiration::Span(span) => span.as_secs(),
            Expiration::At(when) => match when.duration_since(UNIX_EPOCH) {
                Ok(elapsed) => elapsed.as_secs().saturating_sub(now),
                // Before the epoch, thus long expired.
                Err(_) => 0,
            },
        }
    }
}

impl From<u64> for Expiration {
    fn from(secs: u64) -> Self {
        Expiration::Seconds(secs)
    }
}

impl From<u32> for Expiration {
    fn from(secs: u32) -> Self {
        Expiration::Seconds(u64::from(secs))
    }
}

impl From<f64> for Expiration {
    fn from(secs: f64) -> Self {
        if secs.is_sign_negative() {
            Expiration::Seconds(0)
        } else {
            Expiration::Seconds(secs as u64)
        }
    }
}

impl From<Duration> for Expiration {
    fn from(span: Duration) -> Self {
        Expiration::Span(span)
    }
}

impl From<SystemTime> for Expiration {
    fn from(when: SystemTime) -> Self {
        Expiration::At(when)
    }
}

type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

struct TimerInner {
    callback: Mutex<Option<TimerCallback>>,
    /// Back reference to the slot currently holding this timer. Truthful
    /// or `None`; cleared whenever the timer leaves its slot.
    slot: Mutex<Option<Weak<SlotInner>>>,
    /// Visits of the owning slot left before the timer fires. Mutated
    /// only under the owning slot's mutex.
    remaining: AtomicU64,
}

/// A cancelable one-shot timer.
///
/// Returned by [`TimeWheel::schedule`]. The handle is cheap to clone; all
/// clones refer to the same timer.
///
/// [`TimeWheel::schedule`]: struct.TimeWheel.html#method.schedule
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    /// Create an unscheduled timer whose count starts at the normalized
    /// expiration.
    pub fn new<F, E>(callback: F, expires: E) -> Self
    where
        F: FnOnce() + Send + 'static,
        E: Into<Expiration>,
    {
        let remaining = expires.into().normalize();

        Self {
            inner: Arc::new(TimerInner {
                callback: Mutex::new(Some(Box::new(callback))),
                slot: Mutex::new(None),
                remaining: AtomicU64::new(remaining),
            }),
        }
    }

    /// Remove the timer from its slot, if it has one.
    ///
    /// A canceled timer never fires. Canceling twice, or canceling a timer
    /// that already fired, is a no-op.
    pub fn cancel(&self) {
        let slot = self.inner.slot.lock().unwrap().take();

        if let Some(slot) = slot.and_then(|weak| weak.upgrade()) {
            slot.remove(self);
        }
    }

    /// Invoke the callback, at most once.
    ///
    /// A panicking callback is caught and logged, never propagated to the
    /// wheel.
    pub fn fire(&self) {
        let callback = self.inner.callback.lock().unwrap().take();

        if let Some(callback) = callback {
            if let Err(panic) =
                panic::catch_unwind(AssertUnwindSafe(callback))
            {
                warn!("fail to execute timer callback, {:?}", panic);
            }
        }
    }

    pub(crate) fn remaining(&self) -> u64 {
        self.inner.remaining.load(Ordering::SeqCst)
    }

    pub(crate) fn set_remaining(&self, ticks: u64) {
        self.inner.remaining.store(ticks, Ordering::SeqCst);
    }

    fn clear_slot(&self) {
        self.inner.slot.lock().unwrap().take();
    }

    fn set_slot(&self, slot: &Arc<SlotInner>) {
        *self.inner.slot.lock().unwrap() = Some(Arc::downgrade(slot));
    }
}

impl PartialEq for Timer {
    /// Compares the two underlying timers for identity.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Timer {}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timer")
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[derive(Default)]
struct SlotInner {
    timers: Mutex<SmallVec<[Timer; 4]>>,
}

impl SlotInner {
    fn remove(&self, timer: &Timer) -> bool {
        let mut timers = self.timers.lock().unwrap();

        match timers.iter().position(|held| held == timer) {
            Some(index) => {
                let timer = timers.remove(index);
                timer.clear_slot();
                true
            }
            None => false,
        }
    }
}

/// One bucket of a [`TimeWheel`].
///
/// All reads and mutations of the held timers are serialized by the slot's
/// own mutex; the wheel holds no lock of its own.
///
/// [`TimeWheel`]: struct.TimeWheel.html
#[derive(Clone, Default)]
pub struct TimeSlot {
    inner: Arc<SlotInner>,
}

impl TimeSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a timer to the slot and point its back reference here.
    pub fn insert(&self, timer: &Timer) {
        let mut timers = self.inner.timers.lock().unwrap();

        timer.set_slot(&self.inner);
        timers.push(timer.clone());
    }

    /// Remove a timer, returning whether it was present.
    pub fn remove(&self, timer: &Timer) -> bool {
        self.inner.remove(timer)
    }

    /// Returns whether the given timer is currently held by this slot.
    pub fn contains(&self, timer: &Timer) -> bool {
        self.inner
            .timers
            .lock()
            .unwrap()
            .iter()
            .any(|held| held == timer)
    }

    /// Decrement the count of every held timer, removing and returning
    /// those that reach zero or below.
    ///
    /// The caller is expected to `fire` the returned timers once the slot
    /// lock is released.
    pub fn check(&self) -> Vec<Timer> {
        let mut timers = self.inner.timers.lock().unwrap();
        let mut fired = Vec::new();

        let mut index = 0;
        while index < timers.len() {
            let remaining = timers[index].remaining().saturating_sub(1);
            timers[index].set_remaining(remaining);

            if remaining == 0 {
                let timer = timers.remove(index);
                timer.clear_slot();
                fired.push(timer);
            } else {
                index += 1;
            }
        }

        fired
    }

    pub fn len(&self) -> usize {
        self.inner.timers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_normalize() {
        assert_eq!(10, Expiration::from(10u64).normalize());
        assert_eq!(10, Expiration::from(10.0).normalize());

        let now_secs = unix_now();
        assert_eq!(10, Expiration::from(now_secs + 10).normalize());

        assert_eq!(
            10,
            Expiration::from(Duration::from_secs(10)).normalize()
        );
        assert_eq!(
            10,
            Expiration::from(SystemTime::now() + Duration::from_secs(10))
                .normalize()
        );

        // An instant in the past expires immediately.
        assert_eq!(
            0,
            Expiration::from(SystemTime::now() - Duration::from_secs(60))
                .normalize()
        );
    }

    #[test]
    fn test_slot_cycle() {
        let slot = TimeSlot::new();
        assert!(slot.is_empty());

        let timer = Timer::new(|| (), 10u64);

        slot.insert(&timer);
        assert_eq!(1, slot.len());
        assert!(slot.contains(&timer));

        assert!(slot.remove(&timer));
        assert!(!slot.remove(&timer));

        slot.insert(&timer);

        for _ in 0..9 {
            assert_eq!(Vec::<Timer>::new(), slot.check());
        }

        assert_eq!(vec![timer.clone()], slot.check());
        assert!(slot.is_empty());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let slot = TimeSlot::new();
        let timer = Timer::new(|| (), 10u64);

        slot.insert(&timer);
        timer.cancel();
        assert!(slot.is_empty());

        timer.cancel();
        assert!(slot.is_empty());
    }

    #[test]
    fn test_fire_at_most_once() {
        let fired = Arc::new(AtomicU64::new(0));

        let timer = {
            let fired = fired.clone();
            Timer::new(
                move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                },
                0u64,
            )
        };

        timer.fire();
        timer.fire();
        assert_eq!(1, fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_callback_is_swallowed() {
        let timer = Timer::new(|| panic!("boom"), 0u64);

        // Must not propagate.
        timer.fire();
    }

    #[test]
    fn test_canceled_timer_never_fires() {
        let fired = Arc::new(AtomicBool::new(false));

        let timer = {
            let fired = fired.clone();
            Timer::new(move || fired.store(true, Ordering::SeqCst), 1u64)
        };

        let slot = TimeSlot::new();
        slot.insert(&timer);
        timer.cancel();

        assert_eq!(Vec::<Timer>::new(), slot.check());
        assert!(!fired.load(Ordering::SeqCst));
    }
}
