//! Safepoint coordination.
//!
//! Every attached execution context is a mutator with a state:
//!
//! ```text
//!   Native ──resume──► Running ──poll (pause pending)──► AtSafepoint
//!     ▲                  │  ▲                                │
//!     └──────enter───────┘  └────────pause ends──────────────┘
//!                        │
//!                        └──enter(Blocked)──► Blocked (init wait, lock wait)
//! ```
//!
//! A stop-the-world request waits until every other mutator is in a safe
//! state (anything but `Running`) and keeps them there until its guard
//! drops. Requests serialize; the same context may nest them.
//!
//! Contexts publish their roots before entering any safe state, so a
//! collection running under the pause sees every frame.

use kiln_core::ContextId;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use tracing::trace;

/// Safepoint state of one mutator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutatorState {
    /// Executing code; must poll.
    Running,
    /// Parked at a safepoint for a pause.
    AtSafepoint,
    /// Waiting on another context (class initialization, a lock).
    Blocked,
    /// Outside managed code.
    Native,
}

impl MutatorState {
    /// Whether a pause may proceed while a mutator is in this state.
    #[inline]
    pub const fn is_safe(self) -> bool {
        !matches!(self, MutatorState::Running)
    }
}

#[derive(Debug, Clone, Copy)]
struct Owner {
    requester: Option<ContextId>,
    depth: u32,
}

#[derive(Debug, Default)]
struct Inner {
    mutators: FxHashMap<ContextId, MutatorState>,
    /// Thread that last moved each mutator to `Running`.
    threads: FxHashMap<ContextId, ThreadId>,
    owner: Option<Owner>,
}

impl Inner {
    /// Whether a pause owned by someone other than `ctx` is active.
    #[inline]
    fn stopped_by_other(&self, ctx: ContextId) -> bool {
        self.owner.is_some_and(|owner| owner.requester != Some(ctx))
    }

    fn all_others_safe(&self, requester: Option<ContextId>) -> bool {
        self.mutators
            .iter()
            .all(|(id, state)| Some(*id) == requester || state.is_safe())
    }
}

/// Coordinates stop-the-world pauses between execution contexts.
#[derive(Debug, Default)]
pub struct SafepointCoordinator {
    inner: Mutex<Inner>,
    changed: Condvar,
    pending: AtomicBool,
    pauses: AtomicU64,
}

impl SafepointCoordinator {
    /// A coordinator with no mutators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `ctx` in the `Native` state.
    pub fn register(&self, ctx: ContextId) {
        self.inner.lock().mutators.insert(ctx, MutatorState::Native);
    }

    /// Remove `ctx`.
    pub fn unregister(&self, ctx: ContextId) {
        let mut inner = self.inner.lock();
        inner.mutators.remove(&ctx);
        inner.threads.remove(&ctx);
        drop(inner);
        self.changed.notify_all();
    }

    /// Current state of `ctx`.
    pub fn state(&self, ctx: ContextId) -> Option<MutatorState> {
        self.inner.lock().mutators.get(&ctx).copied()
    }

    /// The context running managed code on the calling thread, if any.
    ///
    /// A pause requested from this thread without naming that context
    /// would wait for it forever.
    pub fn running_on_current_thread(&self) -> Option<ContextId> {
        let current = thread::current().id();
        let inner = self.inner.lock();
        inner
            .threads
            .iter()
            .find(|(ctx, thread)| {
                **thread == current && inner.mutators.get(ctx) == Some(&MutatorState::Running)
            })
            .map(|(ctx, _)| *ctx)
    }

    /// Number of registered mutators.
    pub fn mutator_count(&self) -> usize {
        self.inner.lock().mutators.len()
    }

    /// Whether a pause is requested or active.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Completed pauses.
    #[inline]
    pub fn pause_count(&self) -> u64 {
        self.pauses.load(Ordering::Relaxed)
    }

    /// Park `ctx` while another context's pause is active.
    ///
    /// `publish` runs before parking and must make the context's roots
    /// visible to the collector.
    pub fn poll(&self, ctx: ContextId, publish: impl FnOnce()) {
        if !self.is_pending() {
            return;
        }
        if !self.inner.lock().stopped_by_other(ctx) {
            return;
        }
        publish();
        let mut inner = self.inner.lock();
        inner.mutators.insert(ctx, MutatorState::AtSafepoint);
        self.changed.notify_all();
        trace!(%ctx, "parked at safepoint");
        while inner.stopped_by_other(ctx) {
            self.changed.wait(&mut inner);
        }
        inner.mutators.insert(ctx, MutatorState::Running);
    }

    /// Move `ctx` into a safe state. Roots must already be published.
    pub fn enter(&self, ctx: ContextId, state: MutatorState) {
        debug_assert!(state.is_safe());
        self.inner.lock().mutators.insert(ctx, state);
        self.changed.notify_all();
    }

    /// Move `ctx` back to `Running`, waiting out any active pause.
    pub fn resume(&self, ctx: ContextId) {
        let current = thread::current().id();
        let mut inner = self.inner.lock();
        while inner.stopped_by_other(ctx) {
            self.changed.wait(&mut inner);
        }
        inner.mutators.insert(ctx, MutatorState::Running);
        inner.threads.insert(ctx, current);
    }

    /// Stop every mutator except `requester` and keep them stopped until
    /// the guard drops.
    ///
    /// A requesting context counts as safe while it waits for another
    /// pause to end, so it must publish its roots before calling this.
    pub fn stop_the_world(&self, requester: Option<ContextId>) -> StopTheWorld<'_> {
        let mut inner = self.inner.lock();
        if let Some(owner) = inner.owner.as_mut() {
            if requester.is_some() && owner.requester == requester {
                owner.depth += 1;
                return StopTheWorld { coordinator: self };
            }
        }

        let previous = requester.and_then(|ctx| inner.mutators.get(&ctx).copied());
        if let Some(ctx) = requester.filter(|_| previous.is_some()) {
            inner.mutators.insert(ctx, MutatorState::AtSafepoint);
            self.changed.notify_all();
        }
        while inner.owner.is_some() {
            self.changed.wait(&mut inner);
        }

        inner.owner = Some(Owner {
            requester,
            depth: 1,
        });
        self.pending.store(true, Ordering::Release);
        while !inner.all_others_safe(requester) {
            self.changed.wait(&mut inner);
        }
        if let (Some(ctx), Some(state)) = (requester, previous) {
            inner.mutators.insert(ctx, state);
        }
        trace!(requester = ?requester, "world stopped");
        StopTheWorld { coordinator: self }
    }

    fn release(&self) {
        let mut inner = self.inner.lock();
        let finished = match inner.owner.as_mut() {
            Some(owner) if owner.depth > 1 => {
                owner.depth -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if finished {
            inner.owner = None;
            self.pending.store(false, Ordering::Release);
            self.pauses.fetch_add(1, Ordering::Relaxed);
            drop(inner);
            self.changed.notify_all();
            trace!("world resumed");
        }
    }
}

/// An active stop-the-world pause. Mutators resume when dropped.
#[must_use = "the pause ends when the guard is dropped"]
#[derive(Debug)]
pub struct StopTheWorld<'a> {
    coordinator: &'a SafepointCoordinator,
}

impl Drop for StopTheWorld<'_> {
    fn drop(&mut self) {
        self.coordinator.release();
    }
}
