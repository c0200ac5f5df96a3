//! Nestable transaction scopes.
//!
//! Every scope on a session shares one depth counter. Entering a scope
//! increments it; only the scope whose clean exit brings it back to zero
//! commits (or rolls back when configured to). A failure rolls back at the
//! first scope that observes it and resets the counter, so enclosing scopes
//! see depth zero and do not roll back again.
//!
//! Scopes come in two forms:
//!
//! - [`Session::transaction`] runs a closure inside a scope.
//! - [`Session::begin_scope`] / [`Session::end_scope`] for callers that
//!   already hold the outcome they want to finish with.
//!
//! ```ignore
//! session
//!     .transaction(&cx, ScopeOptions::default(), |s, cx| {
//!         Box::pin(async move {
//!             s.add(&hero);
//!             s.flush(cx).await
//!         })
//!     })
//!     .await?;
//! ```
//!
//! If the future driving a scope is dropped before the scope ends, the
//! [`ScopeGuard`] resets the counter, restores autoflush and leaves a
//! rollback owed; the session issues it before its next store access.

use crate::Session;
use asupersync::{Cx, Outcome};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlservice_core::{Connection, Error};
use std::pin::Pin;
use std::sync::Arc;

/// Per-session scope bookkeeping, shared with live guards.
#[derive(Debug)]
pub(crate) struct ScopeState {
    pub(crate) depth: usize,
    pub(crate) autoflush: bool,
    pub(crate) rollback_pending: bool,
}

impl ScopeState {
    pub(crate) fn new(autoflush: bool) -> Self {
        Self {
            depth: 0,
            autoflush,
            rollback_pending: false,
        }
    }
}

/// How a scope finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeOptions {
    /// Commit when the outermost scope exits cleanly.
    pub commit: bool,
    /// Roll back instead of committing when the outermost scope exits cleanly.
    pub rollback: bool,
    /// Autoflush setting for the duration of the outermost scope.
    pub autoflush: Option<bool>,
}

impl Default for ScopeOptions {
    fn default() -> Self {
        Self {
            commit: true,
            rollback: false,
            autoflush: None,
        }
    }
}

impl ScopeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave the transaction open on clean exit.
    #[must_use]
    pub fn no_commit(mut self) -> Self {
        self.commit = false;
        self
    }

    #[must_use]
    pub fn rollback(mut self) -> Self {
        self.rollback = true;
        self
    }

    #[must_use]
    pub fn autoflush(mut self, enabled: bool) -> Self {
        self.autoflush = Some(enabled);
        self
    }
}

/// An entered scope. Pass it back to [`Session::end_scope`].
#[must_use = "a scope must be finished with Session::end_scope"]
#[derive(Debug)]
pub struct ScopeGuard {
    state: Arc<Mutex<ScopeState>>,
    options: ScopeOptions,
    saved_autoflush: bool,
    finished: bool,
}

impl ScopeGuard {
    pub fn options(&self) -> &ScopeOptions {
        &self.options
    }

    fn finish(mut self) {
        self.state.lock().autoflush = self.saved_autoflush;
        self.finished = true;
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.state.lock();
        tracing::warn!(
            depth = state.depth,
            "Transaction scope dropped before it finished; rollback deferred"
        );
        state.depth = 0;
        state.autoflush = self.saved_autoflush;
        state.rollback_pending = true;
    }
}

/// The future a [`Session::transaction`] body returns.
pub type ScopeFuture<'s, T> = Pin<Box<dyn Future<Output = Outcome<T, Error>> + 's>>;

impl<C: Connection> Session<C> {
    /// Number of scopes currently entered on this session.
    pub fn depth(&self) -> usize {
        self.scope.lock().depth
    }

    /// Enter a scope.
    ///
    /// The autoflush override only applies to the outermost scope; the
    /// setting it replaced is restored when that scope ends.
    pub fn begin_scope(&mut self, options: ScopeOptions) -> ScopeGuard {
        let mut state = self.scope.lock();
        let saved_autoflush = state.autoflush;
        if state.depth == 0 {
            if let Some(enabled) = options.autoflush {
                state.autoflush = enabled;
            }
        }
        state.depth += 1;
        tracing::debug!(depth = state.depth, "Entered transaction scope");
        ScopeGuard {
            state: Arc::clone(&self.scope),
            options,
            saved_autoflush,
            finished: false,
        }
    }

    /// Finish a scope with the outcome of the work done inside it.
    ///
    /// A non-`Ok` outcome rolls back if no inner scope has already done so
    /// and is returned unchanged. A clean exit from the outermost scope
    /// commits or rolls back according to its options; a failed commit is
    /// rolled back and its error returned.
    pub async fn end_scope<T>(
        &mut self,
        cx: &Cx,
        guard: ScopeGuard,
        outcome: Outcome<T, Error>,
    ) -> Outcome<T, Error> {
        let value = match outcome {
            Outcome::Ok(value) => value,
            failure => {
                let depth = self.depth();
                if depth > 0 {
                    tracing::debug!(depth, "Rolling back failed transaction scope");
                    if let Outcome::Err(err) = self.rollback(cx).await {
                        tracing::warn!(error = %err, "Rollback after failure also failed");
                    }
                }
                self.scope.lock().depth = 0;
                guard.finish();
                return failure;
            }
        };

        let depth = {
            let mut state = self.scope.lock();
            state.depth = state.depth.saturating_sub(1);
            state.depth
        };
        tracing::debug!(depth, "Leaving transaction scope");

        let finished = if depth > 0 {
            Outcome::Ok(())
        } else if guard.options.rollback {
            self.rollback(cx).await
        } else if guard.options.commit {
            match self.commit(cx).await {
                Outcome::Ok(()) => Outcome::Ok(()),
                failure => {
                    tracing::debug!("Commit failed; rolling back");
                    if let Outcome::Err(err) = self.rollback(cx).await {
                        tracing::warn!(error = %err, "Rollback after failed commit also failed");
                    }
                    failure
                }
            }
        } else {
            Outcome::Ok(())
        };

        guard.finish();
        finished.map(|()| value)
    }

    /// Run `body` inside a scope.
    pub async fn transaction<T, F>(
        &mut self,
        cx: &Cx,
        options: ScopeOptions,
        body: F,
    ) -> Outcome<T, Error>
    where
        F: for<'s> FnOnce(&'s mut Session<C>, &'s Cx) -> ScopeFuture<'s, T>,
    {
        let guard = self.begin_scope(options);
        let outcome = body(self, cx).await;
        self.end_scope(cx, guard, outcome).await
    }
}
