use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use tracing::{debug, trace, warn};

/// Callback executed exactly once on the owning thread.
pub type LoopCallback = Box<dyn FnOnce() + Send>;

/// Services the owning thread's loop provides to the primitives in this
/// crate. Implementations must accept calls from any thread, while running
/// every callback on the owning thread itself.
pub trait LoopHandle: Send + Sync {
    /// Run `callback` once on the owning thread's next turn.
    fn post(&self, callback: LoopCallback);

    /// Run `callback` once on the owning thread, no earlier than `delay`
    /// from now.
    fn post_delayed(&self, delay: Duration, callback: LoopCallback);

    /// Run `callback` once, as soon as the owning thread has no other
    /// pending work. The observer is deregistered after one invocation.
    fn add_idle_observer(&self, callback: LoopCallback);

    /// Current time as observed by this loop.
    fn now(&self) -> Instant {
        Instant::now()
    }

    /// Default fault handling for userland errors surfaced on this loop.
    /// Failing deferred tasks land here; they are never retried.
    fn report_fault(&self, context: &'static str, error: anyhow::Error) {
        tracing::error!("{context}: {error:?}");
    }
}

enum Message {
    Run(LoopCallback),
    RunDelayed(Instant, LoopCallback),
    RunWhenIdle(LoopCallback),
    Shutdown,
}

/// Cloneable, thread-safe handle to an [`EventLoop`].
///
/// Work posted after the loop has shut down is dropped with a warning;
/// posting is deliberately infallible for callers.
#[derive(Clone)]
pub struct EventLoopHandle {
    tx: Sender<Message>,
}

impl EventLoopHandle {
    fn send(&self, message: Message) {
        if self.tx.send(message).is_err() {
            warn!("event loop is gone, dropping posted work");
        }
    }

    /// Ask the loop to stop. Callbacks already posted or already due keep
    /// running first; delayed callbacks not yet due and idle observers are
    /// dropped.
    pub fn shutdown(&self) {
        self.send(Message::Shutdown);
    }
}

impl LoopHandle for EventLoopHandle {
    fn post(&self, callback: LoopCallback) {
        self.send(Message::Run(callback));
    }

    fn post_delayed(&self, delay: Duration, callback: LoopCallback) {
        self.send(Message::RunDelayed(Instant::now() + delay, callback));
    }

    fn add_idle_observer(&self, callback: LoopCallback) {
        self.send(Message::RunWhenIdle(callback));
    }
}

struct Delayed {
    due: Instant,
    seq: u64,
    callback: LoopCallback,
}

// BinaryHeap is a max-heap; order is reversed so the earliest due time
// wins, with the sequence number breaking ties in submission order.
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due).then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

/// Reference implementation of the owning thread's loop.
///
/// The loop itself is single-threaded: construct it, hand out as many
/// [`EventLoopHandle`] clones as needed, then park the owning thread in
/// [`EventLoop::run`]. Idle observers are serviced only when no posted
/// callback is ready and no delayed callback is due.
pub struct EventLoop {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    ready: VecDeque<LoopCallback>,
    delayed: BinaryHeap<Delayed>,
    idle: VecDeque<LoopCallback>,
    seq: u64,
}

impl EventLoop {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            ready: VecDeque::new(),
            delayed: BinaryHeap::new(),
            idle: VecDeque::new(),
            seq: 0,
        }
    }

    /// Handle through which any thread may submit work to this loop.
    pub fn handle(&self) -> Arc<EventLoopHandle> {
        Arc::new(EventLoopHandle {
            tx: self.tx.clone(),
        })
    }

    /// Drive the loop on the calling thread until a shutdown request
    /// arrives and the work already due has been drained.
    pub fn run(&mut self) {
        trace!("event loop started");
        let mut stopping = false;

        loop {
            // absorb everything already submitted without blocking
            loop {
                match self.rx.try_recv() {
                    Ok(message) => stopping |= !self.absorb(message),
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                }
            }

            let now = Instant::now();

            if let Some(callback) = self.ready.pop_front() {
                callback();
                continue;
            }

            match self.delayed.peek() {
                Some(delayed) if delayed.due <= now => {
                    if let Some(delayed) = self.delayed.pop() {
                        (delayed.callback)();
                    }
                    continue;
                }
                _ => {}
            }

            if stopping {
                self.finish();
                return;
            }

            if let Some(callback) = self.idle.pop_front() {
                trace!("loop idle, running idle observer");
                callback();
                continue;
            }

            // nothing runnable; park until a message arrives or the next
            // delayed callback comes due
            let wakeup = self
                .delayed
                .peek()
                .map(|delayed| delayed.due.saturating_duration_since(now));

            match wakeup {
                Some(timeout) => match self.rx.recv_timeout(timeout) {
                    Ok(message) => stopping |= !self.absorb(message),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        self.finish();
                        return;
                    }
                },
                None => match self.rx.recv() {
                    Ok(message) => stopping |= !self.absorb(message),
                    Err(_) => {
                        self.finish();
                        return;
                    }
                },
            }
        }
    }

    /// Returns `false` when the message asks the loop to stop.
    fn absorb(&mut self, message: Message) -> bool {
        match message {
            Message::Run(callback) => self.ready.push_back(callback),
            Message::RunDelayed(due, callback) => {
                self.seq += 1;
                self.delayed.push(Delayed {
                    due,
                    seq: self.seq,
                    callback,
                });
            }
            Message::RunWhenIdle(callback) => self.idle.push_back(callback),
            Message::Shutdown => return false,
        }

        true
    }

    fn finish(&mut self) {
        let dropped = self.ready.len() + self.delayed.len() + self.idle.len();
        if dropped > 0 {
            debug!("event loop shut down, dropping {dropped} queued callbacks");
        } else {
            trace!("event loop shut down");
        }

        self.ready.clear();
        self.delayed.clear();
        self.idle.clear();
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}
