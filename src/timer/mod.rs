//! Single-timerfd timer service.
//!
//! Grounded on `util/timer_manager.{h,cc}`: one `timerfd`, one epoll
//! fd, a waiter thread blocked in `epoll_wait` and a separate
//! dispatcher thread that runs expired callbacks. The split across two
//! threads means a callback that re-entrantly schedules a new timer
//! never blocks on the same thread that would need to rearm the
//! `timerfd` for it.

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::unistd::write;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send>;

struct PendingEntry {
    deadline: Instant,
    id: u64,
    callback: Callback,
}

struct Inner {
    next_id: AtomicU64,
    heap: Mutex<BinaryHeap<Reverse<(Instant, u64)>>>,
    pending: Mutex<std::collections::HashMap<u64, PendingEntry>>,
    ready: Mutex<Vec<Callback>>,
    ready_cv: Condvar,
    stopped: AtomicBool,
    timerfd: Mutex<TimerFd>,
}

/// The shared timer service: one per process, constructed once in
/// `bt_hald::main` and handed out by reference or `Arc`.
pub struct TimerService {
    inner: Arc<Inner>,
    epoll: Arc<Epoll>,
    waiter: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

/// RAII handle to a single scheduled timer. Dropping it cancels the
/// timer if it has not already fired.
pub struct Timer {
    inner: Arc<Inner>,
    id: Mutex<Option<u64>>,
}

impl TimerService {
    pub fn new() -> nix::Result<Self> {
        let timerfd = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_NONBLOCK)?;
        let epoll = Epoll::new(EpollCreateFlags::empty())?;
        epoll.add(timerfd.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 0))?;

        let inner = Arc::new(Inner {
            next_id: AtomicU64::new(1),
            heap: Mutex::new(BinaryHeap::new()),
            pending: Mutex::new(std::collections::HashMap::new()),
            ready: Mutex::new(Vec::new()),
            ready_cv: Condvar::new(),
            stopped: AtomicBool::new(false),
            timerfd: Mutex::new(timerfd),
        });
        let epoll = Arc::new(epoll);

        let waiter = {
            let inner = inner.clone();
            let epoll = epoll.clone();
            std::thread::Builder::new()
                .name("bthal-timer-wait".to_string())
                .spawn(move || Self::wait_loop(inner, epoll))
                .expect("failed to spawn timer wait thread")
        };

        let dispatcher = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name("bthal-timer-dispatch".to_string())
                .spawn(move || Self::dispatch_loop(inner))
                .expect("failed to spawn timer dispatch thread")
        };

        Ok(TimerService {
            inner,
            epoll,
            waiter: Some(waiter),
            dispatcher: Some(dispatcher),
        })
    }

    /// Schedule `callback` to run after `delay`. The returned [`Timer`]
    /// must be kept alive for the callback to fire; dropping it cancels
    /// the schedule.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> Timer
    where
        F: FnOnce() + Send + 'static,
    {
        let timer = Timer {
            inner: self.inner.clone(),
            id: Mutex::new(None),
        };
        timer.schedule(delay, callback);
        timer
    }

    fn wait_loop(inner: Arc<Inner>, epoll: Arc<Epoll>) {
        let mut events = [EpollEvent::empty(); 8];
        while !inner.stopped.load(Ordering::Acquire) {
            let n = match epoll.wait(&mut events, 500u16) {
                Ok(n) => n,
                Err(nix::Error::EINTR) => continue,
                Err(_) => break,
            };
            if n == 0 {
                continue;
            }

            // Drain the timerfd's expiration counter.
            let _ = inner.timerfd.lock().wait();

            let now = Instant::now();
            let mut due = Vec::new();
            {
                let mut heap = inner.heap.lock();
                let mut pending = inner.pending.lock();
                while let Some(&Reverse((deadline, id))) = heap.peek() {
                    if deadline > now {
                        break;
                    }
                    heap.pop();
                    if let Some(entry) = pending.remove(&id) {
                        due.push(entry.callback);
                    }
                }
                Self::rearm(&inner, &heap);
            }

            if !due.is_empty() {
                let mut ready = inner.ready.lock();
                ready.extend(due);
                inner.ready_cv.notify_all();
            }
        }
    }

    fn dispatch_loop(inner: Arc<Inner>) {
        loop {
            let mut ready = inner.ready.lock();
            while ready.is_empty() && !inner.stopped.load(Ordering::Acquire) {
                inner.ready_cv.wait(&mut ready);
            }
            if ready.is_empty() && inner.stopped.load(Ordering::Acquire) {
                return;
            }
            let due: Vec<Callback> = ready.drain(..).collect();
            drop(ready);

            for callback in due {
                callback();
            }
        }
    }

    fn rearm(inner: &Inner, heap: &BinaryHeap<Reverse<(Instant, u64)>>) {
        let timerfd = inner.timerfd.lock();
        match heap.peek() {
            Some(&Reverse((deadline, _))) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let remaining = remaining.max(Duration::from_millis(1));
                let _ = timerfd.set(
                    Expiration::OneShot(remaining.into()),
                    TimerSetTimeFlags::empty(),
                );
            }
            None => {
                let _ = timerfd.set(
                    Expiration::OneShot(Duration::ZERO.into()),
                    TimerSetTimeFlags::empty(),
                );
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.ready_cv.notify_all();
        if let Some(handle) = self.waiter.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
        let _ = &self.epoll;
    }
}

impl Timer {
    /// (Re-)schedule this timer, cancelling any previous registration.
    pub fn schedule<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;

        {
            let mut pending = self.inner.pending.lock();
            pending.insert(
                id,
                PendingEntry {
                    deadline,
                    id,
                    callback: Box::new(callback),
                },
            );
        }
        {
            let mut heap = self.inner.heap.lock();
            heap.push(Reverse((deadline, id)));
            TimerService::rearm(&self.inner, &heap);
        }

        *self.id.lock() = Some(id);
    }

    /// Cancel this timer if it is still pending, guaranteeing its task
    /// will not run. Returns `false` (a no-op) if the task has already
    /// fired, is running, or was never scheduled.
    pub fn cancel(&self) -> bool {
        match self.id.lock().take() {
            Some(id) => self.inner.pending.lock().remove(&id).is_some(),
            None => false,
        }
    }

    /// Whether this handle currently has a task pending that has not
    /// yet fired or been cancelled.
    pub fn is_scheduled(&self) -> bool {
        match *self.id.lock() {
            Some(id) => self.inner.pending.lock().contains_key(&id),
            None => false,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_after_delay() {
        let service = TimerService::new().expect("timerfd unavailable in this sandbox");
        let (tx, rx) = mpsc::channel();
        let _timer = service.schedule(Duration::from_millis(20), move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn cancel_reports_whether_a_pending_task_was_removed() {
        let service = TimerService::new().expect("timerfd unavailable in this sandbox");
        let timer = service.schedule(Duration::from_millis(500), || {});
        assert!(timer.is_scheduled());
        assert!(timer.cancel());
        assert!(!timer.is_scheduled());
        assert!(!timer.cancel(), "cancelling twice is a no-op");
    }

    #[test]
    fn rescheduling_a_pending_handle_cancels_the_previous_task() {
        let service = TimerService::new().expect("timerfd unavailable in this sandbox");
        let (tx, rx) = mpsc::channel();
        let timer = service.schedule(Duration::from_millis(500), {
            let tx = tx.clone();
            move || tx.send("first").unwrap()
        });
        timer.schedule(Duration::from_millis(20), move || tx.send("second").unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "second");
        assert!(rx.recv_timeout(Duration::from_millis(700)).is_err(), "first task must not run");
    }

    #[test]
    fn dropping_cancels() {
        let service = TimerService::new().expect("timerfd unavailable in this sandbox");
        let (tx, rx) = mpsc::channel();
        {
            let _timer = service.schedule(Duration::from_millis(500), move || {
                tx.send(()).unwrap();
            });
            // dropped immediately
        }
        assert!(rx.recv_timeout(Duration::from_millis(700)).is_err());
    }
}
