//! Host Lock Management
//!
//! The host runtime serializes its threads behind one global lock. Calls
//! into the engine that cannot re-enter the host may release that lock for
//! their duration so other host threads keep running.
//!
//! ## Background
//!
//! - The calling thread always waits for the native call to finish
//! - A window may only wrap pure engine work: the closure must be `Send`,
//!   which host callables (`Proc`) are not
//! - Failures inside a window never cross it directly. Errors and panics
//!   are parked in a deferred slot and raised once the lock is held again,
//!   keeping only their message
//!
//! ## Pieces
//!
//! - **GvlGuard**: RAII marker that the current thread holds the lock
//! - **GvlState**: thread-local lock state
//! - **without_gvl**: run a closure inside a release window

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use mlx_engine::EngineResult;
use tracing::trace;

use crate::error::{BridgeError, BridgeResult};

// ============================================================================
// Lock State Tracking
// ============================================================================

/// Number of threads currently blocked inside a release window
static BLOCKED_THREADS: AtomicUsize = AtomicUsize::new(0);

/// Total number of release windows taken (for debugging)
static RELEASE_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Thread-local lock hold count
    static GVL_DEPTH: Cell<usize> = const { Cell::new(0) };

    /// Whether this thread currently holds the lock
    static GVL_HELD: Cell<bool> = const { Cell::new(false) };

    /// Whether this thread is inside a release window
    static GVL_RELEASED: Cell<bool> = const { Cell::new(false) };
}

/// State of the host lock for the current thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GvlState {
    /// Lock is not held by this thread
    NotHeld,
    /// Lock is held by this thread
    Held,
    /// Lock was given up for a native call
    Released,
}

impl GvlState {
    /// Get the current lock state for this thread
    pub fn current() -> Self {
        if GVL_RELEASED.with(|r| r.get()) {
            GvlState::Released
        } else if GVL_HELD.with(|h| h.get()) {
            GvlState::Held
        } else {
            GvlState::NotHeld
        }
    }

    /// Check if the lock is currently held
    pub fn is_held() -> bool {
        GVL_HELD.with(|held| held.get())
    }

    /// Get the current nesting depth
    pub fn depth() -> usize {
        GVL_DEPTH.with(|depth| depth.get())
    }
}

impl fmt::Display for GvlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GvlState::NotHeld => write!(f, "NotHeld"),
            GvlState::Held => write!(f, "Held"),
            GvlState::Released => write!(f, "Released"),
        }
    }
}

// ============================================================================
// GvlGuard - RAII Lock Marker
// ============================================================================

/// Marks the current thread as holding the host lock while alive.
///
/// Guards nest; the lock is only given up when the outermost guard drops.
#[derive(Debug)]
pub struct GvlGuard {
    /// Whether the lock was already held when this guard was created
    nested: bool,
    /// Marker to prevent Send/Sync
    _marker: PhantomData<*mut ()>,
}

impl GvlGuard {
    pub fn acquire() -> Self {
        let nested = GvlState::is_held();
        GVL_DEPTH.with(|depth| depth.set(depth.get() + 1));
        GVL_HELD.with(|held| held.set(true));
        Self {
            nested,
            _marker: PhantomData,
        }
    }

    /// Check if this is a nested acquisition
    pub fn is_nested(&self) -> bool {
        self.nested
    }
}

impl Drop for GvlGuard {
    fn drop(&mut self) {
        GVL_DEPTH.with(|depth| {
            let new_depth = depth.get().saturating_sub(1);
            depth.set(new_depth);
            if new_depth == 0 {
                GVL_HELD.with(|held| held.set(false));
            }
        });
    }
}

// ============================================================================
// Release Windows
// ============================================================================

/// Where released work runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseStrategy {
    /// On a scoped worker thread while the caller waits
    #[default]
    Worker,
    /// On the calling thread, with the lock marked released
    Inline,
}

/// Restores the caller's lock state and the blocked-thread count on every exit path
struct ReleasedWindow {
    was_held: bool,
}

impl ReleasedWindow {
    fn enter() -> Self {
        let was_held = GVL_HELD.with(|held| held.replace(false));
        GVL_RELEASED.with(|r| r.set(true));
        BLOCKED_THREADS.fetch_add(1, Ordering::SeqCst);
        RELEASE_COUNT.fetch_add(1, Ordering::Relaxed);
        Self { was_held }
    }
}

impl Drop for ReleasedWindow {
    fn drop(&mut self) {
        BLOCKED_THREADS.fetch_sub(1, Ordering::SeqCst);
        GVL_RELEASED.with(|r| r.set(false));
        GVL_HELD.with(|held| held.set(self.was_held));
    }
}

/// Failure captured inside a release window, raised after it closes
#[derive(Debug, Default)]
struct Deferred {
    message: Option<String>,
}

impl Deferred {
    fn capture(&mut self, message: String) {
        self.message.get_or_insert(message);
    }

    fn rethrow<T>(self, value: Option<T>) -> BridgeResult<T> {
        match (self.message, value) {
            (Some(message), _) => Err(BridgeError::engine(message)),
            (None, Some(value)) => Ok(value),
            (None, None) => Err(BridgeError::engine("native call produced no result")),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "native call panicked".to_string()
    }
}

/// Run `f` with the host lock released.
///
/// Engine errors and panics raised by `f` surface as message-only
/// [`BridgeError::Engine`] once the lock is held again.
pub fn without_gvl<F, T>(strategy: ReleaseStrategy, f: F) -> BridgeResult<T>
where
    F: FnOnce() -> EngineResult<T> + Send,
    T: Send,
{
    trace!(?strategy, "releasing host lock");
    let outcome = {
        let _window = ReleasedWindow::enter();
        match strategy {
            ReleaseStrategy::Worker => std::thread::scope(|scope| scope.spawn(f).join()),
            ReleaseStrategy::Inline => panic::catch_unwind(AssertUnwindSafe(f)),
        }
    };
    trace!("reacquired host lock");

    let mut deferred = Deferred::default();
    let value = match outcome {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            deferred.capture(err.to_string());
            None
        }
        Err(payload) => {
            deferred.capture(panic_message(payload));
            None
        }
    };
    deferred.rethrow(value)
}

/// Number of threads currently inside a release window
pub fn blocked_threads() -> usize {
    BLOCKED_THREADS.load(Ordering::SeqCst)
}

// ============================================================================
// Debug Utilities
// ============================================================================

/// Get statistics about lock usage (for debugging).
pub fn gvl_stats() -> GvlStats {
    GvlStats {
        total_releases: RELEASE_COUNT.load(Ordering::Relaxed),
        blocked_threads: blocked_threads(),
        current_depth: GvlState::depth(),
        is_held: GvlState::is_held(),
    }
}

/// Lock usage statistics.
#[derive(Debug, Clone)]
pub struct GvlStats {
    /// Total number of release windows taken
    pub total_releases: u64,
    /// Threads currently blocked in a window
    pub blocked_threads: usize,
    /// Current nesting depth on this thread
    pub current_depth: usize,
    /// Whether this thread holds the lock
    pub is_held: bool,
}

impl fmt::Display for GvlStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GVL Stats: releases={}, blocked={}, depth={}, held={}",
            self.total_releases, self.blocked_threads, self.current_depth, self.is_held
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_engine::EngineError;
    use pretty_assertions::assert_eq;

    fn reset_state() {
        GVL_DEPTH.with(|d| d.set(0));
        GVL_HELD.with(|h| h.set(false));
        GVL_RELEASED.with(|r| r.set(false));
    }

    #[test]
    fn test_guard_nesting() {
        reset_state();
        {
            let outer = GvlGuard::acquire();
            assert!(!outer.is_nested());
            assert_eq!(GvlState::depth(), 1);
            {
                let inner = GvlGuard::acquire();
                assert!(inner.is_nested());
                assert_eq!(GvlState::depth(), 2);
            }
            assert!(GvlState::is_held());
        }
        assert!(!GvlState::is_held());
        assert_eq!(GvlState::depth(), 0);
    }

    #[test]
    fn test_inline_window_releases_and_restores() {
        reset_state();
        let _gvl = GvlGuard::acquire();
        let state = without_gvl(ReleaseStrategy::Inline, || Ok(GvlState::current())).unwrap();
        assert_eq!(state, GvlState::Released);
        assert_eq!(GvlState::current(), GvlState::Held);
    }

    #[test]
    fn test_worker_window_returns_value() {
        reset_state();
        let _gvl = GvlGuard::acquire();
        let data = vec![1, 2, 3];
        let sum = without_gvl(ReleaseStrategy::Worker, move || Ok(data.iter().sum::<i32>())).unwrap();
        assert_eq!(sum, 6);
        assert!(GvlState::is_held());
    }

    #[test]
    fn test_engine_error_is_deferred() {
        reset_state();
        let _gvl = GvlGuard::acquire();
        let err = without_gvl::<_, ()>(ReleaseStrategy::Worker, || Err(EngineError::runtime("device lost")))
            .unwrap_err();
        assert!(err.is_engine_error());
        assert_eq!(err.to_string(), "device lost");
        assert!(GvlState::is_held());
    }

    #[test]
    fn test_panic_is_captured() {
        reset_state();
        for strategy in [ReleaseStrategy::Worker, ReleaseStrategy::Inline] {
            let err = without_gvl::<_, ()>(strategy, || panic!("kernel crashed")).unwrap_err();
            assert_eq!(err.to_string(), "kernel crashed");
            assert_eq!(GvlState::current(), GvlState::NotHeld);
        }
    }

    #[test]
    fn test_stats_count_releases() {
        reset_state();
        let before = gvl_stats().total_releases;
        without_gvl(ReleaseStrategy::Inline, || Ok(())).unwrap();
        assert!(gvl_stats().total_releases > before);
    }
}
