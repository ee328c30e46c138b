//! The class initialization state machine.
//!
//! ```text
//!   NotInitialized ──begin──► Initializing ──complete──► Initialized
//!                                  │
//!                                  └──────fail────────► InitializationFailed
//! ```
//!
//! `NotInitialized → Initializing` is claimed under the cell's lock, so
//! exactly one context runs the static initializer. Every other context
//! sees [`InitAction::InProgress`] and parks on the condition variable
//! until the state is terminal. The failure is stored and handed to every
//! later caller unchanged.

use kiln_core::{ContextId, KilnError};
use parking_lot::{Condvar, Mutex};
use std::fmt;

/// Lifecycle stage of a type's static initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitState {
    /// The initializer has not started.
    NotInitialized,
    /// A context is running the initializer.
    Initializing,
    /// Initialization finished; statics are observable.
    Initialized,
    /// The initializer failed. Sticky.
    InitializationFailed,
}

impl InitState {
    /// Whether no further transition can happen.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Initialized | Self::InitializationFailed)
    }
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotInitialized => "not initialized",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::InitializationFailed => "initialization failed",
        };
        f.write_str(name)
    }
}

/// What a context asking to use a type must do next.
#[derive(Debug, Clone)]
pub enum InitAction {
    /// The caller claimed the type and must run the initializer, then
    /// call [`InitCell::complete`] or [`InitCell::fail`].
    Run,
    /// The type is initialized.
    Ready,
    /// The caller is the type's own initializer; the type is usable.
    Recursive,
    /// Another context is initializing; wait with
    /// [`InitCell::wait_terminal`].
    InProgress,
    /// Initialization failed earlier; the stored error.
    Failed(KilnError),
}

#[derive(Debug)]
struct InitInner {
    state: InitState,
    initializer: Option<ContextId>,
    error: Option<KilnError>,
}

/// Per-type initialization cell.
#[derive(Debug)]
pub struct InitCell {
    inner: Mutex<InitInner>,
    settled: Condvar,
}

impl InitCell {
    /// A cell in `NotInitialized`.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(InitInner {
                state: InitState::NotInitialized,
                initializer: None,
                error: None,
            }),
            settled: Condvar::new(),
        }
    }

    /// A cell that is already `Initialized`, for bootstrap types.
    pub fn initialized() -> Self {
        let cell = Self::new();
        cell.inner.lock().state = InitState::Initialized;
        cell
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> InitState {
        self.inner.lock().state
    }

    /// The context running the initializer, while `Initializing`.
    pub fn initializer(&self) -> Option<ContextId> {
        self.inner.lock().initializer
    }

    /// Ask to use the type from `ctx`, claiming it when uninitialized.
    pub fn try_begin(&self, ctx: ContextId) -> InitAction {
        let mut inner = self.inner.lock();
        Self::action(&mut inner, ctx)
    }

    /// Block until the state is terminal, then report it as
    /// [`try_begin`](Self::try_begin) would.
    pub fn wait_terminal(&self, ctx: ContextId) -> InitAction {
        let mut inner = self.inner.lock();
        while inner.state == InitState::Initializing && inner.initializer != Some(ctx) {
            self.settled.wait(&mut inner);
        }
        Self::action(&mut inner, ctx)
    }

    fn action(inner: &mut InitInner, ctx: ContextId) -> InitAction {
        match inner.state {
            InitState::NotInitialized => {
                inner.state = InitState::Initializing;
                inner.initializer = Some(ctx);
                InitAction::Run
            }
            InitState::Initializing if inner.initializer == Some(ctx) => InitAction::Recursive,
            InitState::Initializing => InitAction::InProgress,
            InitState::Initialized => InitAction::Ready,
            InitState::InitializationFailed => match &inner.error {
                Some(err) => InitAction::Failed(err.clone()),
                None => InitAction::Failed(KilnError::internal(
                    "initialization failed without a recorded cause",
                )),
            },
        }
    }

    /// Finish a successful initialization claimed by `ctx`.
    pub fn complete(&self, ctx: ContextId) -> Result<(), KilnError> {
        self.settle(ctx, InitState::Initialized, None)
    }

    /// Finish a failed initialization claimed by `ctx`.
    pub fn fail(&self, ctx: ContextId, error: KilnError) -> Result<(), KilnError> {
        self.settle(ctx, InitState::InitializationFailed, Some(error))
    }

    fn settle(
        &self,
        ctx: ContextId,
        state: InitState,
        error: Option<KilnError>,
    ) -> Result<(), KilnError> {
        let mut inner = self.inner.lock();
        if inner.state != InitState::Initializing || inner.initializer != Some(ctx) {
            return Err(KilnError::internal(format!(
                "{ctx} settled an initialization it does not own (state {})",
                inner.state
            )));
        }
        inner.state = state;
        inner.initializer = None;
        inner.error = error;
        drop(inner);
        self.settled.notify_all();
        Ok(())
    }
}

impl Default for InitCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const A: ContextId = ContextId(1);
    const B: ContextId = ContextId(2);

    #[test]
    fn test_first_caller_claims() {
        let cell = InitCell::new();
        assert!(matches!(cell.try_begin(A), InitAction::Run));
        assert_eq!(cell.state(), InitState::Initializing);
        assert_eq!(cell.initializer(), Some(A));
        assert!(matches!(cell.try_begin(A), InitAction::Recursive));
        assert!(matches!(cell.try_begin(B), InitAction::InProgress));

        cell.complete(A).unwrap();
        assert!(matches!(cell.try_begin(B), InitAction::Ready));
        assert_eq!(cell.initializer(), None);
    }

    #[test]
    fn test_failure_is_sticky() {
        let cell = InitCell::new();
        cell.try_begin(A);
        cell.fail(A, KilnError::division_by_zero()).unwrap();

        for ctx in [A, B, A] {
            match cell.try_begin(ctx) {
                InitAction::Failed(err) => assert!(err.to_string().contains("divide by zero")),
                other => panic!("expected failure, got {other:?}"),
            }
        }
        assert_eq!(cell.state(), InitState::InitializationFailed);
    }

    #[test]
    fn test_settle_requires_ownership() {
        let cell = InitCell::new();
        assert!(cell.complete(A).unwrap_err().is_fatal());
        cell.try_begin(A);
        assert!(cell.complete(B).is_err());
        assert!(cell.complete(A).is_ok());
    }

    #[test]
    fn test_bootstrap_cell() {
        assert_eq!(InitCell::initialized().state(), InitState::Initialized);
        assert!(InitState::Initialized.is_terminal());
        assert!(!InitState::Initializing.is_terminal());
    }

    #[test]
    fn test_exactly_one_initializer_under_contention() {
        let cell = Arc::new(InitCell::new());
        let runs = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for i in 0..8u64 {
                let cell = Arc::clone(&cell);
                let runs = Arc::clone(&runs);
                scope.spawn(move || {
                    let ctx = ContextId(i + 10);
                    let mut action = cell.try_begin(ctx);
                    if matches!(action, InitAction::InProgress) {
                        action = cell.wait_terminal(ctx);
                    }
                    match action {
                        InitAction::Run => {
                            runs.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            cell.complete(ctx).unwrap();
                        }
                        InitAction::Ready => {}
                        other => panic!("unexpected {other:?}"),
                    }
                });
            }
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cell.state(), InitState::Initialized);
    }
}
