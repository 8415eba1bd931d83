// SPDX-License-Identifier: MPL-2.0

//! Waiting for events that the peer completes asynchronously.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::{platform::Platform, prelude::*};

// # Explanation on the memory orders
//
// A waker first makes the condition true, then completes. A waiter that
// observes the completion with `Ordering::Acquire` must see the condition,
// so `complete()` stores with `Ordering::Release`.

/// Waits until `cond` returns `Some(_)`.
///
/// The caller yields the CPU between two evaluations of the condition.
pub fn wait_until<F, R>(platform: &dyn Platform, mut cond: F) -> R
where
    F: FnMut() -> Option<R>,
{
    loop {
        if let Some(res) = cond() {
            return res;
        }
        platform.yield_now();
    }
}

/// Waits until `cond` returns `Some(_)` or `timeout` elapses.
pub fn wait_until_or_timeout<F, R>(
    platform: &dyn Platform,
    timeout: Duration,
    mut cond: F,
) -> Result<R>
where
    F: FnMut() -> Option<R>,
{
    let deadline = platform.now().saturating_add(timeout);
    loop {
        if let Some(res) = cond() {
            return Ok(res);
        }
        if platform.now() >= deadline {
            return_errno_with_message!(ErrorKind::Timeout, "the peer did not answer in time");
        }
        platform.yield_now();
    }
}

/// A one-shot completion signal.
///
/// A completion starts incomplete. Once [`Completion::complete`] is called,
/// all current and future waiters return.
#[derive(Debug, Default)]
pub struct Completion {
    done: AtomicBool,
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
        }
    }

    /// Signals the completion.
    pub fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Returns whether the completion has been signaled.
    pub fn is_completed(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Re-arms the completion for another handshake.
    pub fn reinit(&self) {
        self.done.store(false, Ordering::Relaxed);
    }

    /// Waits for the completion, at most for `timeout`.
    pub fn wait_timeout(&self, platform: &dyn Platform, timeout: Duration) -> Result<()> {
        wait_until_or_timeout(platform, timeout, || self.is_completed().then_some(()))
    }
}
