//! Timeout Scheduler
//!
//! Hashed timer wheel driven by a single tokio task. Arming and cancelling
//! are O(1); each tick fires the due entries of one slot. Entries whose
//! deadline lies more than one revolution ahead stay in their slot until the
//! wheel comes around again.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error};

pub const DEFAULT_TICK: Duration = Duration::from_millis(10);
pub const DEFAULT_SLOTS: usize = 512;

const ARMED: u8 = 0;
const CANCELLED: u8 = 1;
const FIRED: u8 = 2;

type TimeoutAction = Box<dyn FnOnce() + Send + 'static>;

/// Handle to one armed timeout
#[derive(Debug, Clone)]
pub struct TimeoutHandle {
    state: Arc<AtomicU8>,
}

impl TimeoutHandle {
    /// Prevent the timeout from firing. Returns `false` if it already fired
    /// or was cancelled before; calling it repeatedly is safe.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn is_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }
}

struct TimerEntry {
    deadline_tick: u64,
    state: Arc<AtomicU8>,
    action: TimeoutAction,
}

impl TimerEntry {
    fn fire(self) {
        if self
            .state
            .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if catch_unwind(AssertUnwindSafe(self.action)).is_err() {
            error!("Timeout action panicked");
        }
    }
}

struct Wheel {
    tick: Duration,
    slots: Vec<Mutex<Vec<TimerEntry>>>,
    /// Last tick fully processed by the driver
    cursor: AtomicU64,
    started: Instant,
    pending: AtomicUsize,
    shutdown: AtomicBool,
}

impl Wheel {
    fn elapsed_ticks(&self) -> u64 {
        (self.started.elapsed().as_nanos() / self.tick.as_nanos()) as u64
    }

    fn insert(&self, duration: Duration, state: Arc<AtomicU8>, action: TimeoutAction) {
        let tick_nanos = self.tick.as_nanos();
        let ticks = ((duration.as_nanos() + tick_nanos - 1) / tick_nanos).max(1) as u64;
        let mut entry = Some(TimerEntry {
            deadline_tick: 0,
            state,
            action,
        });

        loop {
            let cursor = self.cursor.load(Ordering::Acquire);
            let deadline = (self.elapsed_ticks() + ticks).max(cursor + 1);
            let mut slot = self.slots[(deadline % self.slots.len() as u64) as usize].lock();
            // the driver advances the cursor while holding the slot lock, so
            // it cannot pass `deadline` before this entry is visible
            if self.cursor.load(Ordering::Acquire) < deadline {
                if let Some(mut entry) = entry.take() {
                    entry.deadline_tick = deadline;
                    slot.push(entry);
                    self.pending.fetch_add(1, Ordering::Relaxed);
                }
                return;
            }
        }
    }

    fn advance(&self) {
        let target = self.elapsed_ticks();
        let mut current = self.cursor.load(Ordering::Acquire);
        while current < target {
            let next = current + 1;
            let due = {
                let mut slot = self.slots[(next % self.slots.len() as u64) as usize].lock();
                let mut due = Vec::new();
                let mut i = 0;
                while i < slot.len() {
                    if slot[i].deadline_tick <= next {
                        due.push(slot.swap_remove(i));
                    } else {
                        i += 1;
                    }
                }
                self.cursor.store(next, Ordering::Release);
                due
            };
            self.pending.fetch_sub(due.len(), Ordering::Relaxed);
            for entry in due {
                entry.fire();
            }
            current = next;
        }
    }

    fn drain_all(&self) -> Vec<TimerEntry> {
        let mut drained = Vec::new();
        for slot in &self.slots {
            drained.append(&mut slot.lock());
        }
        self.pending.fetch_sub(drained.len(), Ordering::Relaxed);
        drained
    }
}

/// Process-wide (or per-client) timeout scheduler
pub struct TimeoutScheduler {
    wheel: Arc<Wheel>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutScheduler {
    /// Create a scheduler with the default 10ms tick. Must be called from
    /// within a tokio runtime.
    pub fn new() -> Self {
        Self::with_tick(DEFAULT_TICK, DEFAULT_SLOTS)
    }

    pub fn with_tick(tick: Duration, slots: usize) -> Self {
        let tick = tick.max(Duration::from_millis(1));
        let wheel = Arc::new(Wheel {
            tick,
            slots: (0..slots.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
            cursor: AtomicU64::new(0),
            started: Instant::now(),
            pending: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });
        let driver = tokio::spawn(drive(Arc::downgrade(&wheel), tick));
        Self {
            wheel,
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Run `on_fire` once `duration` has elapsed unless cancelled first.
    /// After shutdown the action runs immediately.
    pub fn arm<F>(&self, duration: Duration, on_fire: F) -> TimeoutHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(ARMED));
        let handle = TimeoutHandle {
            state: Arc::clone(&state),
        };
        if self.wheel.shutdown.load(Ordering::Acquire) {
            TimerEntry {
                deadline_tick: 0,
                state,
                action: Box::new(on_fire),
            }
            .fire();
        } else {
            self.wheel.insert(duration, state, Box::new(on_fire));
        }
        handle
    }

    /// Armed entries not yet fired or swept
    pub fn pending(&self) -> usize {
        self.wheel.pending.load(Ordering::Relaxed)
    }

    pub fn tick(&self) -> Duration {
        self.wheel.tick
    }

    /// Stop the driver and fire everything still armed
    pub fn shutdown(&self) {
        if self.wheel.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        let drained = self.wheel.drain_all();
        debug!(count = drained.len(), "Timeout scheduler shut down, firing armed timeouts");
        for entry in drained {
            entry.fire();
        }
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}

async fn drive(wheel: Weak<Wheel>, tick: Duration) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(wheel) = wheel.upgrade() else {
            return;
        };
        if wheel.shutdown.load(Ordering::Acquire) {
            return;
        }
        wheel.advance();
    }
}
