//! Synchronization helpers for blocking and bulk callers.

use crate::{
    error::Error,
    resolver::{LookupCallback, LookupResults},
};

use hashbrown::HashMap;
use hickory_proto::rr::Name;

use std::{
    net::SocketAddr,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

/// A count-down synchronizer.
///
/// Threads [`wait`] until [`count_down`] has been invoked as many times
/// as the initial count; both are safe from any thread.
///
/// # Example
/// ```
/// use asyncdns::CountDownLatch;
/// use std::{sync::Arc, thread};
///
/// let latch = Arc::new(CountDownLatch::new(2));
///
/// for _ in 0..2 {
///     let latch = latch.clone();
///     thread::spawn(move || latch.count_down());
/// }
///
/// latch.wait();
/// assert_eq!(0, latch.count());
/// ```
///
/// [`wait`]: #method.wait
/// [`count_down`]: #method.count_down
pub struct CountDownLatch {
    count: Mutex<usize>,
    cond: Condvar,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// The remaining count.
    pub fn count(&self) -> usize {
        *self.count.lock().unwrap()
    }

    /// Decrement the count, waking every waiter once it reaches zero.
    pub fn count_down(&self) {
        let mut count = self.count.lock().unwrap();
        *count = count.saturating_sub(1);

        if *count == 0 {
            self.cond.notify_all();
        }
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.cond.wait(count).unwrap();
        }
    }

    /// Block until the count reaches zero or the timeout elapses.
    ///
    /// Returns whether the count reached zero.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap();

        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let (guard, _) =
                self.cond.wait_timeout(count, deadline - now).unwrap();
            count = guard;
        }

        true
    }
}

/// Accumulated lookup outcomes, keyed by queried name then by nameserver.
pub type CollectedResults =
    HashMap<Name, HashMap<SocketAddr, Vec<LookupResults>>>;

/// Gathers the outcomes of a batch of lookups behind a latch.
///
/// Bulk callers submit N lookups through [`callback`] handles and then
/// [`wait`] for all of them to settle; successful projections accumulate
/// by `(qname, nameserver)` while errors land in a dedicated bucket. This
/// is also the admission-gating building block for crawlers that must not
/// outrun the network.
///
/// [`callback`]: #method.callback
/// [`wait`]: #method.wait
pub struct ResultCollector {
    latch: CountDownLatch,
    results: Mutex<CollectedResults>,
    errors: Mutex<Vec<(SocketAddr, Name, Error)>>,
}

impl ResultCollector {
    /// A collector expecting `count` callback invocations.
    pub fn new(count: usize) -> Self {
        Self {
            latch: CountDownLatch::new(count),
            results: Mutex::new(HashMap::default()),
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Record one outcome and count the latch down.
    pub fn on_finish(
        &self,
        nameserver: SocketAddr,
        qname: &Name,
        outcome: Result<LookupResults, Error>,
    ) {
        match outcome {
            Ok(results) => {
                self.results
                    .lock()
                    .unwrap()
                    .entry(qname.clone())
                    .or_insert_with(HashMap::default)
                    .entry(nameserver)
                    .or_insert_with(Vec::new)
                    .push(results);
            }
            Err(err) => {
                self.errors.lock().unwrap().push((
                    nameserver,
                    qname.clone(),
                    err,
                ));
            }
        }

        self.latch.count_down();
    }

    /// A lookup callback feeding this collector.
    pub fn callback(self: Arc<Self>) -> LookupCallback {
        Arc::new(move |nameserver, qname, outcome| {
            self.on_finish(nameserver, &qname, outcome)
        })
    }

    /// Block until every expected outcome arrived.
    pub fn wait(&self) {
        self.latch.wait();
    }

    /// Block up to `timeout`; returns whether every outcome arrived.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.latch.wait_timeout(timeout)
    }

    /// Drain the accumulated successful projections.
    pub fn take_results(&self) -> CollectedResults {
        std::mem::replace(
            &mut *self.results.lock().unwrap(),
            HashMap::default(),
        )
    }

    /// Drain the accumulated errors.
    pub fn take_errors(&self) -> Vec<(SocketAddr, Name, Error)> {
        std::mem::replace(&mut *self.errors.lock().unwrap(), Vec::new())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::error::ErrorKind;

    use std::{str::FromStr, thread};

    #[test]
    fn test_latch_counts_down_across_threads() {
        let latch = Arc::new(CountDownLatch::new(3));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let latch = latch.clone();
                thread::spawn(move || latch.count_down())
            })
            .collect();

        latch.wait();
        assert_eq!(0, latch.count());

        for handle in handles {
            handle.join().unwrap();
        }

        // Counting below zero stays at zero.
        latch.count_down();
        assert_eq!(0, latch.count());
    }

    #[test]
    fn test_latch_wait_timeout() {
        let latch = CountDownLatch::new(1);
        assert!(!latch.wait_timeout(Duration::from_millis(50)));

        latch.count_down();
        assert!(latch.wait_timeout(Duration::from_millis(50)));
    }

    #[test]
    fn test_collector_buckets_outcomes() {
        let collector = Arc::new(ResultCollector::new(2));
        let qname = Name::from_str("example.com.").unwrap();
        let nameserver: SocketAddr = "127.0.0.1:53".parse().unwrap();

        let callback = collector.clone().callback();
        (*callback)(nameserver, qname.clone(), Ok(LookupResults::default()));
        (*callback)(
            nameserver,
            qname.clone(),
            Err(ErrorKind::Timeout {
                nameserver,
                seconds: 2,
            }
            .into()),
        );

        collector.wait();

        let results = collector.take_results();
        assert_eq!(1, results[&qname][&nameserver].len());

        let errors = collector.take_errors();
        assert_eq!(1, errors.len());
        assert!(errors[0].2.is_timeout());
    }
}
