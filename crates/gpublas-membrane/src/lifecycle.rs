//! Once-only initialization and teardown for process-wide state.
//!
//! Uses a manual atomic state machine instead of `OnceLock::get_or_init`:
//! the initializer allocates, allocation re-enters the interceptor, and the
//! interceptor asks for the same state. `get_or_init`'s futex wait would
//! deadlock that same-thread reentry. Here a reentrant call from the
//! initializing thread gets `None` (passthrough), while other threads wait
//! for the initializer to finish and then observe the ready value.
//!
//! ```text
//! Uninit -> Initializing -> Ready -> TearingDown -> TornDown
//!              |
//!              +-> Uninit (initializer failed or panicked)
//! ```

use std::convert::Infallible;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_TEARING_DOWN: u8 = 3;
const STATE_TORN_DOWN: u8 = 4;

/// Observable lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninit,
    Initializing,
    Ready,
    TearingDown,
    TornDown,
}

impl LifecycleState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_UNINIT => Self::Uninit,
            STATE_INITIALIZING => Self::Initializing,
            STATE_READY => Self::Ready,
            STATE_TEARING_DOWN => Self::TearingDown,
            _ => Self::TornDown,
        }
    }
}

thread_local! {
    static THREAD_TOKEN: u8 = const { 0 };
}

/// Address of a thread-local byte: unique among live threads, never zero.
fn thread_token() -> usize {
    THREAD_TOKEN.with(|t| std::ptr::from_ref(t) as usize)
}

/// Process-wide value with guarded one-time init and one-time teardown.
pub struct Lifecycle<T> {
    state: AtomicU8,
    owner: AtomicUsize,
    value: OnceLock<T>,
}

impl<T> Lifecycle<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_UNINIT),
            owner: AtomicUsize::new(0),
            value: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// The value, only while `Ready`.
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == STATE_READY {
            self.value.get()
        } else {
            None
        }
    }

    /// The value once it was ever ready, including during and after
    /// teardown. Release paths use it for objects that outlive the session.
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        match self.state.load(Ordering::Acquire) {
            STATE_READY | STATE_TEARING_DOWN | STATE_TORN_DOWN => self.value.get(),
            _ => None,
        }
    }

    /// Initialize on first use.
    ///
    /// Returns `None` for a reentrant call from the initializing thread and
    /// after teardown has started.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> Option<&T> {
        match self.try_get_or_init(|| Ok::<T, Infallible>(init())) {
            Ok(v) => v,
            Err(never) => match never {},
        }
    }

    /// Fallible variant of [`get_or_init`](Self::get_or_init). On error the
    /// state returns to `Uninit` so a later call may retry.
    pub fn try_get_or_init<E>(
        &self,
        init: impl FnOnce() -> Result<T, E>,
    ) -> Result<Option<&T>, E> {
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_READY => return Ok(self.value.get()),
                STATE_TEARING_DOWN | STATE_TORN_DOWN => return Ok(None),
                STATE_INITIALIZING => {
                    if self.owner.load(Ordering::Acquire) == thread_token() {
                        return Ok(None);
                    }
                    std::thread::yield_now();
                }
                _ => {
                    if self
                        .state
                        .compare_exchange(
                            STATE_UNINIT,
                            STATE_INITIALIZING,
                            Ordering::SeqCst,
                            Ordering::Relaxed,
                        )
                        .is_err()
                    {
                        continue;
                    }
                    self.owner.store(thread_token(), Ordering::Release);
                    let reset = ResetOnUnwind(self);
                    let value = init();
                    std::mem::forget(reset);
                    self.owner.store(0, Ordering::Release);

                    return match value {
                        Ok(v) => {
                            let _ = self.value.set(v);
                            self.state.store(STATE_READY, Ordering::Release);
                            Ok(self.value.get())
                        }
                        Err(e) => {
                            self.state.store(STATE_UNINIT, Ordering::Release);
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    /// Run `fini` exactly once on the ready value. Returns false if the value
    /// was never ready or teardown already happened.
    pub fn shutdown(&self, fini: impl FnOnce(&T)) -> bool {
        if self
            .state
            .compare_exchange(
                STATE_READY,
                STATE_TEARING_DOWN,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return false;
        }
        if let Some(v) = self.value.get() {
            fini(v);
        }
        self.state.store(STATE_TORN_DOWN, Ordering::Release);
        true
    }
}

impl<T> Default for Lifecycle<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct ResetOnUnwind<'a, T>(&'a Lifecycle<T>);

impl<T> Drop for ResetOnUnwind<'_, T> {
    fn drop(&mut self) {
        self.0.owner.store(0, Ordering::Release);
        self.0.state.store(STATE_UNINIT, Ordering::Release);
    }
}
