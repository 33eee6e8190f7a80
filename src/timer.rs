use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::looper::LoopHandle;

/// Listener invoked on the owning thread when a [`Timer`] fires.
pub type TimerListener = Arc<dyn Fn() + Send + Sync>;

/// One-shot delay timer with coalescing re-arm semantics.
///
/// At most one delayed re-check is ever outstanding per instance. Re-arming
/// while a check is outstanding does not schedule a second one; the check
/// re-reads the trigger time when it fires, so the newest [`Timer::arm`]
/// wins. The listener fires at most once per arm that is not superseded by
/// a later arm or a [`Timer::cancel`], never before the requested delay
/// has elapsed, though possibly later under load.
pub struct Timer {
    handle: Arc<dyn LoopHandle>,
    weak: Weak<Timer>,
    state: Mutex<State>,
    listener: Mutex<Option<TimerListener>>,
}

#[derive(Default)]
struct State {
    /// Absolute trigger time; `None` once cancelled.
    trigger_at: Option<Instant>,
    /// Whether a delayed re-check is currently outstanding.
    waiting_for_callback: bool,
    /// Armed and not yet fired or cancelled.
    pending: bool,
}

impl Timer {
    pub fn new(handle: Arc<dyn LoopHandle>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            handle,
            weak: weak.clone(),
            state: Mutex::new(State::default()),
            listener: Mutex::new(None),
        })
    }

    /// Install the single listener. Replaces any previous one.
    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.listener.lock().unwrap() = Some(Arc::new(listener));
    }

    /// Arm the timer to fire after `delay`. Supersedes any earlier arm.
    pub fn arm(&self, delay: Duration) {
        let mut state = self.state.lock().unwrap();
        state.pending = true;
        state.trigger_at = Some(self.handle.now() + delay);

        if !state.waiting_for_callback {
            state.waiting_for_callback = true;
            trace!(delay_ms = delay.as_millis() as u64, "timer armed");
            self.schedule_check(delay);
        }
    }

    /// Clear the trigger. A re-check already in flight becomes a no-op.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        state.trigger_at = None;
        state.pending = false;
    }

    /// True iff the timer is armed and has not yet fired or been
    /// cancelled.
    pub fn is_pending(&self) -> bool {
        self.state.lock().unwrap().pending
    }

    fn schedule_check(&self, delay: Duration) {
        let weak = self.weak.clone();
        self.handle.post_delayed(
            delay,
            Box::new(move || {
                if let Some(timer) = weak.upgrade() {
                    timer.fire();
                }
            }),
        );
    }

    /// Invoked by the loop's delay facility once the scheduled delay has
    /// elapsed.
    fn fire(&self) {
        let mut state = self.state.lock().unwrap();
        state.waiting_for_callback = false;

        let Some(trigger_at) = state.trigger_at else {
            // cancelled while the check was in flight
            return;
        };

        let now = self.handle.now();
        if now < trigger_at {
            // a later arm moved the trigger; check again after the rest
            state.waiting_for_callback = true;
            let remaining = trigger_at - now;
            drop(state);
            self.schedule_check(remaining);
            return;
        }

        state.pending = false;
        drop(state);

        trace!("timer fired");
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::looper::manual::ManualLoop;

    fn counting_timer(looper: &Arc<ManualLoop>) -> (Arc<Timer>, Arc<AtomicUsize>) {
        let timer = Timer::new(looper.clone());
        let count = Arc::new(AtomicUsize::new(0));
        let fired = count.clone();
        timer.set_listener(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
        (timer, count)
    }

    #[test]
    fn test_fires_once_after_delay() {
        let looper = ManualLoop::new();
        let (timer, count) = counting_timer(&looper);

        timer.arm(Duration::from_millis(100));
        assert!(timer.is_pending());

        looper.advance(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(timer.is_pending());

        looper.advance(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());

        // one-shot: nothing further fires
        looper.advance(Duration::from_millis(500));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rearm_coalesces_into_one_check() {
        let looper = ManualLoop::new();
        let (timer, count) = counting_timer(&looper);

        timer.arm(Duration::from_millis(100));
        timer.arm(Duration::from_millis(500));

        // the second arm rides the check scheduled by the first
        assert_eq!(looper.delayed_len(), 1);

        looper.advance(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(timer.is_pending());

        looper.advance(Duration::from_millis(400));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[test]
    fn test_shortened_rearm_fires_with_original_check() {
        let looper = ManualLoop::new();
        let (timer, count) = counting_timer(&looper);

        timer.arm(Duration::from_millis(500));
        timer.arm(Duration::from_millis(100));

        // the outstanding check still fires at the original deadline; the
        // listener is invoked then, late but exactly once
        looper.advance(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        looper.advance(Duration::from_millis(400));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_suppresses_firing() {
        let looper = ManualLoop::new();
        let (timer, count) = counting_timer(&looper);

        timer.arm(Duration::from_millis(100));
        timer.cancel();
        assert!(!timer.is_pending());

        looper.advance(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rearm_after_fire() {
        let looper = ManualLoop::new();
        let (timer, count) = counting_timer(&looper);

        timer.arm(Duration::from_millis(10));
        looper.advance(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        timer.arm(Duration::from_millis(10));
        assert!(timer.is_pending());
        looper.advance(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_may_rearm() {
        let looper = ManualLoop::new();
        let timer = Timer::new(looper.clone());
        let count = Arc::new(AtomicUsize::new(0));

        let fired = count.clone();
        let weak = Arc::downgrade(&timer);
        timer.set_listener(move || {
            if fired.fetch_add(1, Ordering::SeqCst) == 0
                && let Some(timer) = weak.upgrade()
            {
                timer.arm(Duration::from_millis(20));
            }
        });

        timer.arm(Duration::from_millis(20));
        looper.advance(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(timer.is_pending());

        looper.advance(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!timer.is_pending());
    }

    #[test]
    fn test_dropped_timer_never_fires() {
        let looper = ManualLoop::new();
        let (timer, count) = counting_timer(&looper);

        timer.arm(Duration::from_millis(10));
        drop(timer);

        looper.advance(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
