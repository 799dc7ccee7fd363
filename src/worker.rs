//! A bounded, single-consumer task queue.
//!
//! Grounded on `util/worker.h`: `post` blocks the caller until there is
//! room in the queue or the post timeout elapses, in which case the
//! worker is considered wedged and this crate treats it the same way
//! the original does — a fatal configuration error, not a recoverable
//! one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const DEFAULT_QUEUE_DEPTH: usize = 10;
const DEFAULT_POST_TIMEOUT: Duration = Duration::from_secs(10);

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    stopped: AtomicBool,
}

/// A single named worker thread draining a bounded FIFO queue.
///
/// `T` is the task type; the handler given to [`Worker::new`] is
/// invoked once per posted task, in the order tasks were posted.
pub struct Worker<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    capacity: usize,
    post_timeout: Duration,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Worker<T> {
    pub fn new<F>(name: &str, handler: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        Self::with_capacity(name, DEFAULT_QUEUE_DEPTH, DEFAULT_POST_TIMEOUT, handler)
    }

    pub fn with_capacity<F>(
        name: &str,
        capacity: usize,
        post_timeout: Duration,
        mut handler: F,
    ) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            stopped: AtomicBool::new(false),
        });

        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                let mut queue = worker_shared.queue.lock().unwrap();
                while queue.is_empty() && !worker_shared.stopped.load(Ordering::Acquire) {
                    queue = worker_shared.not_empty.wait(queue).unwrap();
                }

                let task = queue.pop_front();
                let was_full = queue.len() + 1 >= capacity;
                drop(queue);

                if was_full {
                    worker_shared.not_full.notify_all();
                }

                match task {
                    Some(task) => handler(task),
                    None => {
                        if worker_shared.stopped.load(Ordering::Acquire) {
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn worker thread");

        Worker {
            shared,
            capacity,
            post_timeout,
            handle: Some(handle),
        }
    }

    /// Enqueue a task, blocking up to the configured post timeout if
    /// the queue is full. Panics if the queue never drains in time —
    /// the original treats this as `LOG(FATAL)`.
    pub fn post(&self, task: T) {
        let mut queue = self.shared.queue.lock().unwrap();

        while queue.len() >= self.capacity {
            let (guard, timeout_result) = self
                .shared
                .not_full
                .wait_timeout(queue, self.post_timeout)
                .unwrap();
            queue = guard;
            if timeout_result.timed_out() && queue.len() >= self.capacity {
                panic!("worker queue did not drain within the post timeout");
            }
        }

        queue.push_back(task);
        drop(queue);
        self.shared.not_empty.notify_one();
    }

    /// Stop the worker: remaining queued tasks are dropped unrun, and
    /// the consumer thread is woken and joined.
    pub fn stop(mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.queue.lock().unwrap().clear();
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl<T: Send + 'static> Drop for Worker<T> {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn tasks_run_in_fifo_order() {
        let (tx, rx) = mpsc::channel();
        let worker = Worker::new("test-worker", move |task: u32| {
            tx.send(task).unwrap();
        });

        for i in 0..5 {
            worker.post(i);
        }

        worker.stop();

        let received: Vec<u32> = rx.try_iter().collect();
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }
}
