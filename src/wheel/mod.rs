//! A hashed timing wheel with a one second tick.
//!
//! The wheel (Varghese & Lauck, 1996) is a fixed array of [`TimeSlot`]
//! buckets. A timer expiring in `T` seconds lands in slot `(now + T) mod S`
//! together with a revolution count, which gives O(1) insertion and
//! cancellation however large `T` is. A tick thread visits one slot per
//! wall-clock second and delivers the timers that came due, either inline
//! or through a pool of dispatcher threads.
//!
//! [`TimeSlot`]: struct.TimeSlot.html

mod timer;

pub use timer::{Expiration, TimeSlot, Timer};

pub(crate) use timer::unix_now;

use crate::error::Error;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::Duration,
};

/// The number of slots of a wheel built without an explicit size.
pub const DEFAULT_SLOTS: usize = 360;

struct Shared {
    terminated: AtomicBool,
    // Signaled on terminate so the tick thread does not sleep out its
    // full second.
    lock: Mutex<bool>,
    cond: Condvar,
}

impl Shared {
    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// A hashed timing wheel able to track tens of thousands of in-flight
/// timeouts with one tick per second.
///
/// # Example
/// ```
/// # use failure::Error;
/// #
/// # fn main() -> Result<(), Error> {
/// use asyncdns::TimeWheel;
/// use std::sync::mpsc;
///
/// let wheel = TimeWheel::new()?;
/// let (tx, rx) = mpsc::channel();
///
/// wheel.schedule(move || tx.send(()).unwrap(), 1u64);
/// rx.recv_timeout(std::time::Duration::from_secs(5))?;
///
/// wheel.terminate();
/// #
/// #     Ok(())
/// # }
/// ```
pub struct TimeWheel {
    slots: Arc<Vec<TimeSlot>>,
    shared: Arc<Shared>,
    tick: Mutex<Option<thread::JoinHandle<()>>>,
    dispatchers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl TimeWheel {
    /// A wheel with [`DEFAULT_SLOTS`] slots and inline delivery.
    ///
    /// [`DEFAULT_SLOTS`]: constant.DEFAULT_SLOTS.html
    pub fn new() -> Result<Self, Error> {
        WheelConfig::new().build()
    }

    fn with_config(config: &WheelConfig) -> Result<Self, Error> {
        let slot_count = config.slots.unwrap_or(DEFAULT_SLOTS).max(1);
        let pool_size = config.dispatchers.unwrap_or(0);

        let slots = Arc::new(
            (0..slot_count).map(|_| TimeSlot::new()).collect::<Vec<_>>(),
        );
        let shared = Arc::new(Shared {
            terminated: AtomicBool::new(false),
            lock: Mutex::new(false),
            cond: Condvar::new(),
        });

        let mut dispatchers = Vec::with_capacity(pool_size);
        let dispatch = if pool_size > 0 {
            let (sender, receiver) = crossbeam_channel::unbounded();

            for _ in 0..pool_size {
                let receiver: Receiver<Timer> = receiver.clone();
                let handle = thread::Builder::new()
                    .name("asyncdns-dispatcher".to_owned())
                    .spawn(move || {
                        while let Ok(timer) = receiver.recv() {
                            timer.fire();
                        }
                    })?;
                dispatchers.push(handle);
            }

            Some(sender)
        } else {
            None
        };

        let tick = {
            let slots = slots.clone();
            let shared = shared.clone();
            thread::Builder::new()
                .name("asyncdns-timewheel".to_owned())
                .spawn(move || run_tick(&slots, &shared, dispatch))?
        };

        Ok(Self {
            slots,
            shared,
            tick: Mutex::new(Some(tick)),
            dispatchers: Mutex::new(dispatchers),
        })
    }

    /// Place a timer expiring in `expires`, O(1).
    ///
    /// The returned handle can be used to [`cancel`] the timer.
    ///
    /// [`cancel`]: struct.Timer.html#method.cancel
    pub fn schedule<F, E>(&self, callback: F, expires: E) -> Timer
    where
        F: FnOnce() + Send + 'static,
        E: Into<Expiration>,
    {
        let secs = expires.into().normalize();
        let slot_count = self.slots.len() as u64;

        let timer = Timer::new(callback, secs);
        // The slot is reached for the first time in `secs mod slot_count`
        // seconds; each earlier revolution burns one visit.
        timer.set_remaining(secs / slot_count + 1);

        let index = ((unix_now() + secs) % slot_count) as usize;
        self.slots[index].insert(&timer);

        timer
    }

    /// Run the slot owning wall-clock second `ts` through one visit,
    /// returning the timers that came due.
    ///
    /// This is the unit step of the tick thread, kept callable for tests.
    pub fn check(&self, ts: u64) -> Vec<Timer> {
        let index = (ts % self.slots.len() as u64) as usize;
        self.slots[index].check()
    }

    /// The slot that wall-clock second `ts` hashes to.
    pub fn slot(&self, ts: u64) -> &TimeSlot {
        &self.slots[(ts % self.slots.len() as u64) as usize]
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// The number of live timers across all slots.
    pub fn len(&self) -> usize {
        self.slots.iter().map(TimeSlot::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.is_terminated()
    }

    /// Stop the tick thread and the dispatcher pool.
    ///
    /// Pending timers are dropped without firing. The threads have exited
    /// by the time the call returns.
    pub fn terminate(&self) {
        self.shared.terminated.store(true, Ordering::SeqCst);
        {
            let mut stop = self.shared.lock.lock().unwrap();
            *stop = true;
        }
        self.shared.cond.notify_all();

        if let Some(tick) = self.tick.lock().unwrap().take() {
            let _ = tick.join();
        }
        // The tick thread owned the dispatch sender; its exit disconnects
        // the channel and drains the pool.
        for dispatcher in self.dispatchers.lock().unwrap().drain(..) {
            let _ = dispatcher.join();
        }
    }
}

impl Drop for TimeWheel {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn run_tick(
    slots: &[TimeSlot],
    shared: &Shared,
    dispatch: Option<Sender<Timer>>,
) {
    let slot_count = slots.len() as u64;
    let mut last_tick = unix_now();

    loop {
        {
            let stop = shared.lock.lock().unwrap();
            if !*stop {
                let _ = shared
                    .cond
                    .wait_timeout(stop, Duration::from_secs(1))
                    .unwrap();
            }
        }

        if shared.is_terminated() {
            break;
        }

        // Catch up one visit per wall-clock second in (last_tick, now].
        // A clock stepped backward advances nothing.
        let now = unix_now();
        let mut fired = Vec::new();

        let mut ts = last_tick;
        while ts < now {
            ts += 1;
            fired.extend(slots[(ts % slot_count) as usize].check());
        }
        if now > last_tick {
            last_tick = now;
        }

        for timer in fired {
            match &dispatch {
                Some(queue) => {
                    let _ = queue.send(timer);
                }
                None => timer.fire(),
            }
        }
    }
}

/// Configuration of a [`TimeWheel`].
///
/// Especially helpfull in config files.
///
/// # Example
/// ```
/// # use failure::Error;
/// #
/// # fn main() -> Result<(), Error> {
/// use asyncdns::config::WheelConfig;
///
/// let wheel = WheelConfig::new().slots(60).dispatchers(2).build()?;
/// wheel.terminate();
/// #
/// #     Ok(())
/// # }
/// ```
///
/// [`TimeWheel`]: struct.TimeWheel.html
#[derive(
    Debug, Default, Clone, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct WheelConfig {
    slots: Option<usize>,
    dispatchers: Option<usize>,
}

impl WheelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of slots `S`; defaults to 360.
    pub fn slots(&mut self, slots: usize) -> &mut Self {
        self.slots = Some(slots);
        self
    }

    /// The size of the dispatcher pool. Zero, the default, makes the tick
    /// thread fire callbacks inline; callbacks doing blocking work will
    /// then delay subsequent ticks.
    pub fn dispatchers(&mut self, dispatchers: usize) -> &mut Self {
        self.dispatchers = Some(dispatchers);
        self
    }

    pub fn build(&self) -> Result<TimeWheel, Error> {
        TimeWheel::with_config(self)
    }
}
