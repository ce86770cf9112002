//! Trailing-edge debouncing for the search box.
//!
//! The debouncer never sleeps or spawns: callers feed it inputs with a timestamp and
//! poll it from their own tick loop, so tests drive it with a [`ManualClock`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_QUIESCENCE: Duration = Duration::from_millis(300);

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

impl ManualClock {
    pub fn new(start: Instant) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone, Debug)]
enum DebounceState<T> {
    Idle,
    Pending { value: T, last_input: Instant, deadline: Instant },
}

/// Emits the most recent input once no new input has arrived for `window`.
#[derive(Clone, Debug)]
pub struct Debouncer<T> {
    window: Duration,
    state: DebounceState<T>,
}

impl<T> Debouncer<T> {
    pub fn new(window: Duration) -> Self {
        Self { window, state: DebounceState::Idle }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, DebounceState::Pending { .. })
    }

    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            DebounceState::Idle => None,
            DebounceState::Pending { deadline, .. } => Some(*deadline),
        }
    }

    /// Replaces any pending value and restarts the quiet window.
    pub fn input(&mut self, value: T, now: Instant) {
        self.state = DebounceState::Pending { value, last_input: now, deadline: now + self.window };
    }

    /// Returns the pending value once its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        let due = matches!(&self.state, DebounceState::Pending { deadline, .. } if now >= *deadline);
        if due {
            self.flush()
        } else {
            None
        }
    }

    /// Emits the pending value immediately.
    pub fn flush(&mut self) -> Option<T> {
        match std::mem::replace(&mut self.state, DebounceState::Idle) {
            DebounceState::Pending { value, .. } => Some(value),
            DebounceState::Idle => None,
        }
    }

    pub fn cancel(&mut self) {
        self.state = DebounceState::Idle;
    }

    /// Changes the quiet window. A pending value keeps its last input time and gets a
    /// deadline measured from it with the new window.
    pub fn reconfigure(&mut self, window: Duration) {
        if window == self.window {
            return;
        }
        self.window = window;
        if let DebounceState::Pending { last_input, deadline, .. } = &mut self.state {
            *deadline = *last_input + window;
        }
    }
}

/// Search input pairing an immediate echo with a debounced committed value.
pub struct DebouncedInput {
    typed: String,
    debouncer: Debouncer<String>,
    clock: Arc<dyn Clock>,
}

impl DebouncedInput {
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { typed: String::new(), debouncer: Debouncer::new(window), clock }
    }

    /// What the user sees in the search box right now.
    pub fn typed(&self) -> &str {
        &self.typed
    }

    pub fn is_pending(&self) -> bool {
        self.debouncer.is_pending()
    }

    pub fn handle_input(&mut self, value: impl Into<String>) {
        self.typed = value.into();
        self.debouncer.input(self.typed.clone(), self.clock.now());
    }

    pub fn poll(&mut self) -> Option<String> {
        self.debouncer.poll(self.clock.now())
    }

    pub fn flush(&mut self) -> Option<String> {
        self.debouncer.flush()
    }

    /// Sets both the echo and the committed value without waiting.
    pub fn reset(&mut self, value: impl Into<String>) {
        self.typed = value.into();
        self.debouncer.cancel();
    }

    pub fn reconfigure(&mut self, window: Duration) {
        self.debouncer.reconfigure(window);
    }

    pub fn window(&self) -> Duration {
        self.debouncer.window()
    }
}
