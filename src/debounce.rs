/// Outcome of evaluating an armed debouncer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome<T> {
    /// The wait has elapsed since the most recent call; run the action with
    /// the last recorded call data.
    Invoke(T),
    /// A call landed inside the window; arm a new timer for the remainder.
    Reschedule { remaining_ms: i64 },
    /// Nothing was pending.
    Idle,
}

/// Collapses rapid repeated calls into a single delayed evaluation carrying
/// the most recent call's data.
///
/// The debouncer owns no clock and arms no timers itself. `call` reports the
/// delay the caller must schedule; when that timer fires the caller invokes
/// `fire` with the current time and acts on the outcome. At most one
/// evaluation is pending at a time; concurrent calls coalesce and only the
/// last call's data survives.
#[derive(Debug, Clone)]
pub struct Debouncer<T> {
    wait_ms: i64,
    armed: bool,
    last_call_ms: i64,
    latest: Option<T>,
}

impl<T> Debouncer<T> {
    pub fn new(wait_ms: i64) -> Self {
        Self {
            wait_ms: wait_ms.max(0),
            armed: false,
            last_call_ms: 0,
            latest: None,
        }
    }

    pub fn wait_ms(&self) -> i64 {
        self.wait_ms
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// The most recent call's data, present while an evaluation is pending.
    pub fn latest(&self) -> Option<&T> {
        self.latest.as_ref()
    }

    /// Records a call. Returns `Some(delay)` when the caller must arm a timer
    /// for that many milliseconds; `None` when an evaluation is already
    /// pending and this call coalesced into it.
    ///
    /// A zero wait still goes through the timer path: evaluation happens on
    /// the next tick, never synchronously inside `call`.
    pub fn call(&mut self, now_ms: i64, args: T) -> Option<i64> {
        self.latest = Some(args);
        self.last_call_ms = now_ms;
        if self.armed {
            None
        } else {
            self.armed = true;
            Some(self.wait_ms)
        }
    }

    /// Evaluates the pending schedule at `now_ms`.
    pub fn fire(&mut self, now_ms: i64) -> FireOutcome<T> {
        if !self.armed {
            return FireOutcome::Idle;
        }
        let elapsed = now_ms.saturating_sub(self.last_call_ms);
        if elapsed < self.wait_ms {
            FireOutcome::Reschedule {
                remaining_ms: self.wait_ms - elapsed,
            }
        } else {
            self.armed = false;
            match self.latest.take() {
                Some(args) => FireOutcome::Invoke(args),
                None => FireOutcome::Idle,
            }
        }
    }
}
