use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::core::{FlowError, Result};

struct TaskInner {
    name: String,
    callback: Mutex<Box<dyn FnMut() + Send>>,
    stopped: AtomicBool,
    running_on: Mutex<Option<ThreadId>>,
    runs: AtomicUsize,
}

/// A cancellable callback run by a `TimerScheduler`
#[derive(Clone)]
pub struct TimerTask {
    inner: Arc<TaskInner>,
}

impl TimerTask {
    pub fn new(name: impl Into<String>, callback: impl FnMut() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                name: name.into(),
                callback: Mutex::new(Box::new(callback)),
                stopped: AtomicBool::new(false),
                running_on: Mutex::new(None),
                runs: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Number of completed callback runs
    pub fn runs(&self) -> usize {
        self.inner.runs.load(Ordering::Acquire)
    }

    /// Cancels the task. Idempotent; once it returns the callback will not
    /// start again, and an in-flight run on another thread has finished.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);

        let running_here = *self.inner.running_on
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            == Some(std::thread::current().id());
        if running_here {
            return;
        }

        drop(
            self.inner.callback
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
    }

    fn fire(&self) {
        let mut callback = self.inner.callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.is_stopped() {
            return;
        }

        self.set_running(Some(std::thread::current().id()));
        (*callback)();
        self.set_running(None);
        self.inner.runs.fetch_add(1, Ordering::AcqRel);
    }

    fn set_running(&self, thread: Option<ThreadId>) {
        *self.inner.running_on
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = thread;
    }
}

impl fmt::Debug for TimerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerTask")
            .field("name", &self.inner.name)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

enum Command {
    Schedule {
        task: TimerTask,
        deadline: Instant,
        period: Duration,
    },
    Shutdown,
}

struct Entry {
    deadline: Instant,
    seq: u64,
    period: Duration,
    task: TimerTask,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the heap pops the earliest deadline first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Runs timer callbacks on a dedicated thread
pub struct TimerScheduler {
    sender: Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
    scheduled: AtomicUsize,
    pending: Arc<AtomicUsize>,
}

impl TimerScheduler {
    pub fn new() -> Result<Self> {
        let (sender, receiver) = unbounded();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = pending.clone();

        let handle = std::thread::Builder::new()
            .name("flowbox-timer".to_string())
            .spawn(move || run_timer_loop(receiver, worker_pending))
            .map_err(|e| FlowError::fault(format!("failed to start timer thread: {e}")))?;

        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
            scheduled: AtomicUsize::new(0),
            pending,
        })
    }

    /// Runs `task` after `delay`, then every `period` unless it is zero
    pub fn schedule(&self, task: &TimerTask, delay: Duration, period: Duration) {
        self.scheduled.fetch_add(1, Ordering::AcqRel);
        let command = Command::Schedule {
            task: task.clone(),
            deadline: Instant::now() + delay,
            period,
        };
        if self.sender.send(command).is_err() {
            warn!(task = task.name(), "timer scheduler is shut down, task dropped");
        }
    }

    /// Total number of `schedule` calls
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Entries waiting for their deadline
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Drops every pending entry and joins the timer thread
    pub fn shutdown(&self) {
        let handle = self.handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(handle) = handle else {
            return;
        };

        let _ = self.sender.send(Command::Shutdown);
        if handle.join().is_err() {
            warn!("timer thread panicked");
        }
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timer_loop(receiver: crossbeam_channel::Receiver<Command>, pending: Arc<AtomicUsize>) {
    let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
    let mut seq = 0u64;

    loop {
        let command = match heap.peek() {
            Some(next) => match receiver.recv_deadline(next.deadline) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match receiver.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            },
        };

        match command {
            Some(Command::Schedule { task, deadline, period }) => {
                seq += 1;
                heap.push(Entry { deadline, seq, period, task });
                pending.fetch_add(1, Ordering::AcqRel);
            }
            Some(Command::Shutdown) => break,
            None => {
                let now = Instant::now();
                while heap.peek().is_some_and(|entry| entry.deadline <= now) {
                    let Some(entry) = heap.pop() else {
                        break;
                    };
                    pending.fetch_sub(1, Ordering::AcqRel);
                    if entry.task.is_stopped() {
                        continue;
                    }

                    entry.task.fire();

                    if !entry.period.is_zero() && !entry.task.is_stopped() {
                        seq += 1;
                        heap.push(Entry {
                            deadline: Instant::now() + entry.period,
                            seq,
                            ..entry
                        });
                        pending.fetch_add(1, Ordering::AcqRel);
                    }
                }
            }
        }
    }

    debug!(dropped = heap.len(), "timer thread exiting");
    pending.store(0, Ordering::Release);
}
