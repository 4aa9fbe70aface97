// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Coalesced change notification.
//!
//! Graph callbacks arrive in bursts (a device appearing brings a node,
//! a handful of ports and several links). Each callback marks the classes
//! it touched in a single atomic bitmask; a ticker thread turns the first
//! mark after an idle period into exactly one notification at the end of
//! the debounce window, carrying the union of everything marked meanwhile.

use parking_lot::{Condvar, Mutex};
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(30);

/// Classes of graph change carried by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChangeFlags(u8);

impl ChangeFlags {
    pub const NONE: Self = Self(0);
    /// Nodes, ports, links or modules appeared, changed or vanished.
    pub const TOPOLOGY: Self = Self(1 << 0);
    /// Volume or mute of some node changed.
    pub const CONTROLS: Self = Self(1 << 1);
    /// Default devices or clock settings changed.
    pub const METADATA: Self = Self(1 << 2);
    pub const PROFILER: Self = Self(1 << 3);
    pub const ALL: Self = Self(0b1111);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for ChangeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ChangeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

struct NotifierInner {
    pending: AtomicU8,
    shutdown: AtomicBool,
    window: Duration,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChangeFlags>>>,
    /// Wakes the ticker when the bitmask goes from empty to non-empty.
    wake_lock: Mutex<()>,
    wake: Condvar,
}

impl NotifierInner {
    fn deliver(&self) {
        let flags = ChangeFlags::from_bits(self.pending.swap(0, Ordering::AcqRel));
        if flags.is_empty() {
            return;
        }
        trace!("Delivering change notification: {:?}", flags);
        self.subscribers.lock().retain(|tx| tx.send(flags).is_ok());
    }
}

/// Debounced, coalescing change broadcaster.
pub struct ChangeNotifier {
    inner: Arc<NotifierInner>,
    ticker: Option<JoinHandle<()>>,
}

impl ChangeNotifier {
    pub fn new(window: Duration) -> Self {
        let inner = Arc::new(NotifierInner {
            pending: AtomicU8::new(0),
            shutdown: AtomicBool::new(false),
            window,
            subscribers: Mutex::new(Vec::new()),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        });

        let ticker_inner = inner.clone();
        let ticker = thread::Builder::new()
            .name("graph-notify".to_string())
            .spawn(move || run_ticker(ticker_inner));

        let ticker = match ticker {
            Ok(handle) => Some(handle),
            Err(e) => {
                // Without a ticker, marks are delivered by flush() only.
                warn!("Failed to spawn notification thread: {}", e);
                None
            }
        };

        Self { inner, ticker }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeFlags> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Record a change. Cheap and lock-free unless this is the first mark
    /// of a new window.
    pub fn mark(&self, flags: ChangeFlags) {
        if flags.is_empty() {
            return;
        }
        let previous = self.inner.pending.fetch_or(flags.bits(), Ordering::AcqRel);
        if previous == 0 {
            let _guard = self.inner.wake_lock.lock();
            self.inner.wake.notify_one();
        }
    }

    /// Changes marked but not yet delivered.
    pub fn pending(&self) -> ChangeFlags {
        ChangeFlags::from_bits(self.inner.pending.load(Ordering::Acquire))
    }

    /// Deliver pending changes now instead of at the end of the window.
    pub fn flush(&self) {
        self.inner.deliver();
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }
}

impl Drop for ChangeNotifier {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.inner.wake_lock.lock();
            self.inner.wake.notify_all();
        }
        if let Some(handle) = self.ticker.take() {
            let _ = handle.join();
        }
    }
}

fn run_ticker(inner: Arc<NotifierInner>) {
    debug!("Notification ticker started ({:?} window)", inner.window);
    loop {
        {
            let mut guard = inner.wake_lock.lock();
            while inner.pending.load(Ordering::Acquire) == 0
                && !inner.shutdown.load(Ordering::Acquire)
            {
                inner.wake.wait(&mut guard);
            }
        }
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        // Let the burst accumulate; a shutdown cuts the window short.
        {
            let mut guard = inner.wake_lock.lock();
            if !inner.shutdown.load(Ordering::Acquire) {
                inner.wake.wait_for(&mut guard, inner.window);
            }
        }
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        inner.deliver();
    }
    debug!("Notification ticker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_flags_union() {
        let mut flags = ChangeFlags::TOPOLOGY;
        flags |= ChangeFlags::METADATA;
        assert!(flags.contains(ChangeFlags::TOPOLOGY));
        assert!(flags.intersects(ChangeFlags::METADATA | ChangeFlags::PROFILER));
        assert!(!flags.contains(ChangeFlags::CONTROLS));
        assert_eq!(ChangeFlags::from_bits(0xff), ChangeFlags::ALL);
    }

    #[test]
    fn test_burst_coalesces_into_one_notification() {
        let notifier = ChangeNotifier::new(Duration::from_millis(100));
        let mut rx = notifier.subscribe();

        let start = Instant::now();
        for i in 0..200 {
            let flags = if i % 2 == 0 {
                ChangeFlags::TOPOLOGY
            } else {
                ChangeFlags::CONTROLS
            };
            notifier.mark(flags);
        }
        assert!(start.elapsed() < Duration::from_millis(100));

        let flags = rx.blocking_recv().unwrap();
        assert_eq!(flags, ChangeFlags::TOPOLOGY | ChangeFlags::CONTROLS);

        thread::sleep(Duration::from_millis(250));
        assert!(rx.try_recv().is_err());
        assert!(notifier.pending().is_empty());
    }

    #[test]
    fn test_separate_windows_notify_separately() {
        let notifier = ChangeNotifier::new(Duration::from_millis(20));
        let mut rx = notifier.subscribe();

        notifier.mark(ChangeFlags::TOPOLOGY);
        assert_eq!(rx.blocking_recv(), Some(ChangeFlags::TOPOLOGY));

        notifier.mark(ChangeFlags::PROFILER);
        assert_eq!(rx.blocking_recv(), Some(ChangeFlags::PROFILER));
    }

    #[test]
    fn test_flush_delivers_to_all_subscribers() {
        let notifier = ChangeNotifier::new(Duration::from_secs(60));
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();

        notifier.mark(ChangeFlags::METADATA);
        notifier.flush();
        assert_eq!(a.try_recv().ok(), Some(ChangeFlags::METADATA));
        assert_eq!(b.try_recv().ok(), Some(ChangeFlags::METADATA));

        // Nothing pending: flush is a no-op.
        notifier.flush();
        assert!(a.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let notifier = ChangeNotifier::new(Duration::from_secs(60));
        let rx = notifier.subscribe();
        drop(rx);
        notifier.mark(ChangeFlags::TOPOLOGY);
        notifier.flush();
        assert!(notifier.inner.subscribers.lock().is_empty());
    }
}
