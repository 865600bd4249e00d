// SPDX-License-Identifier: CEPL-1.0
//! The simulated GPU: one worker thread retiring queued ops in FIFO order.

use super::{SimCommand, SimTrace};
use portable_atomic::{AtomicU64, AtomicUsize, Ordering};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Auto-reset event: a successful wait consumes the signal.
#[derive(Default)]
pub(crate) struct EventCell {
    fired: Mutex<bool>,
    cv: Condvar,
}

impl EventCell {
    pub fn fire(&self) {
        *lock(&self.fired) = true;
        self.cv.notify_all();
    }

    pub fn reset(&self) {
        *lock(&self.fired) = false;
    }

    /// `false` on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let guard = lock(&self.fired);
        let mut guard = match timeout {
            None => self
                .cv
                .wait_while(guard, |fired| !*fired)
                .unwrap_or_else(PoisonError::into_inner),
            Some(t) => {
                self.cv
                    .wait_timeout_while(guard, t, |fired| !*fired)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };
        let fired = *guard;
        *guard = false;
        fired
    }
}

pub(crate) struct FenceCell {
    value: AtomicU64,
    waiters: Mutex<Vec<(u64, Arc<EventCell>)>>,
}

impl FenceCell {
    pub fn new(initial: u64) -> Self {
        FenceCell {
            value: AtomicU64::new(initial),
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub fn completed(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    pub fn signal(&self, value: u64) {
        self.value.fetch_max(value, Ordering::AcqRel);
        let now = self.completed();
        lock(&self.waiters).retain(|(target, event)| {
            if *target <= now {
                event.fire();
                false
            } else {
                true
            }
        });
    }

    pub fn notify_at(&self, target: u64, event: Arc<EventCell>) {
        let mut waiters = lock(&self.waiters);
        // Checked under the waiter lock so a concurrent signal cannot slip between.
        if self.completed() >= target {
            event.fire();
        } else {
            waiters.push((target, event));
        }
    }
}

pub(crate) struct AllocatorCell {
    pub id: u64,
    pub in_flight: AtomicUsize,
}

pub(crate) enum GpuOp {
    Execute {
        allocator: Arc<AllocatorCell>,
        commands: Vec<SimCommand>,
    },
    Signal {
        fence: Arc<FenceCell>,
        fence_id: u64,
        value: u64,
    },
    Present {
        buffer: u32,
    },
}

#[derive(Default)]
struct TimelineState {
    ops: VecDeque<GpuOp>,
    paused: bool,
    stopping: bool,
}

pub(crate) struct Timeline {
    state: Mutex<TimelineState>,
    wake: Condvar,
    trace: Mutex<Vec<SimTrace>>,
    latency: Duration,
}

impl Timeline {
    pub fn spawn(latency: Duration) -> io::Result<(Arc<Self>, JoinHandle<()>)> {
        let tl = Arc::new(Timeline {
            state: Mutex::new(TimelineState::default()),
            wake: Condvar::new(),
            trace: Mutex::new(Vec::new()),
            latency,
        });
        let worker = Arc::clone(&tl);
        let handle = thread::Builder::new()
            .name("sim-gpu".into())
            .spawn(move || worker.run())?;
        Ok((tl, handle))
    }

    pub fn push(&self, op: GpuOp) {
        lock(&self.state).ops.push_back(op);
        self.wake.notify_all();
    }

    pub fn set_paused(&self, paused: bool) {
        lock(&self.state).paused = paused;
        self.wake.notify_all();
    }

    pub fn stop(&self) {
        lock(&self.state).stopping = true;
        self.wake.notify_all();
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).ops.len()
    }

    pub fn record(&self, entry: SimTrace) {
        lock(&self.trace).push(entry);
    }

    pub fn trace(&self) -> Vec<SimTrace> {
        lock(&self.trace).clone()
    }

    fn run(&self) {
        loop {
            let op = {
                let mut st = lock(&self.state);
                loop {
                    if st.stopping {
                        return;
                    }
                    if !st.paused {
                        if let Some(op) = st.ops.pop_front() {
                            break op;
                        }
                    }
                    st = self.wake.wait(st).unwrap_or_else(PoisonError::into_inner);
                }
            };
            self.retire(op);
        }
    }

    fn retire(&self, op: GpuOp) {
        match op {
            GpuOp::Execute {
                allocator,
                commands,
            } => {
                if !self.latency.is_zero() {
                    thread::sleep(self.latency);
                }
                self.record(SimTrace::ListExecuted {
                    allocator: allocator.id,
                    commands,
                });
                allocator.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            GpuOp::Signal {
                fence,
                fence_id,
                value,
            } => {
                fence.signal(value);
                self.record(SimTrace::FenceSignaled {
                    fence: fence_id,
                    value,
                });
            }
            GpuOp::Present { buffer } => self.record(SimTrace::Presented { buffer }),
        }
    }
}

/// Counts a live simulated object for the leak audit.
pub(crate) struct Tracked(Arc<AtomicUsize>);

impl Tracked {
    pub fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        Tracked(Arc::clone(live))
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn event_fires_when_fence_reaches_target() {
        let fence = FenceCell::new(0);
        let event = Arc::new(EventCell::default());
        fence.notify_at(2, Arc::clone(&event));
        fence.signal(1);
        assert!(!event.wait(Some(Duration::from_millis(10))));
        fence.signal(2);
        assert!(event.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn already_reached_target_fires_immediately() {
        let fence = FenceCell::new(5);
        let event = Arc::new(EventCell::default());
        fence.notify_at(3, Arc::clone(&event));
        assert!(event.wait(None));
    }

    #[test]
    fn fence_value_never_goes_backwards() {
        let fence = FenceCell::new(0);
        fence.signal(4);
        fence.signal(2);
        assert_eq!(fence.completed(), 4);
    }

    #[test]
    fn paused_timeline_holds_ops_until_resumed() {
        let (tl, handle) = Timeline::spawn(Duration::ZERO).unwrap();
        let fence = Arc::new(FenceCell::new(0));
        tl.set_paused(true);
        tl.push(GpuOp::Signal {
            fence: Arc::clone(&fence),
            fence_id: 0,
            value: 1,
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(fence.completed(), 0);
        assert_eq!(tl.pending(), 1);

        let event = Arc::new(EventCell::default());
        fence.notify_at(1, Arc::clone(&event));
        let start = Instant::now();
        tl.set_paused(false);
        assert!(event.wait(Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(fence.completed(), 1);

        tl.stop();
        handle.join().unwrap();
    }
}
