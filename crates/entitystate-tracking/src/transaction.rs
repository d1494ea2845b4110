//! Fix-up coordinator.
//!
//! Several tracking operations change behaviour while a larger operation is
//! in progress: member-changed notifications skip FK fix-up during the
//! property pass of detect-changes, detach suppresses relationship cascades,
//! and so on. Each such mode is a [`Scope`] counter. Scopes are entered
//! through [`ScopeGuard`]s, which decrement the counter when dropped, so
//! every exit path (including `?`) restores the previous mode.

use std::cell::Cell;
use std::rc::Rc;

/// A tracking mode that can be active for the duration of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// A detect-changes pass is running.
    DetectChanges,
    /// `add_object` is walking a graph.
    Adding,
    /// `attach` is walking a graph.
    Attaching,
    /// An entity is being detached.
    Detaching,
    /// Foreign key values are being written by relationship fix-up.
    ForeignKeyUpdate,
}

const SCOPE_COUNT: usize = 5;

impl Scope {
    const fn index(self) -> usize {
        match self {
            Scope::DetectChanges => 0,
            Scope::Adding => 1,
            Scope::Attaching => 2,
            Scope::Detaching => 3,
            Scope::ForeignKeyUpdate => 4,
        }
    }
}

/// Scope counters shared by a state manager and the guards it hands out.
#[derive(Debug, Default)]
pub struct TransactionManager {
    depth: [Cell<u32>; SCOPE_COUNT],
}

impl TransactionManager {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Enter `scope`; it stays active until the guard is dropped.
    pub fn enter(self: &Rc<Self>, scope: Scope) -> ScopeGuard {
        let cell = &self.depth[scope.index()];
        cell.set(cell.get() + 1);
        tracing::trace!(scope = ?scope, depth = cell.get(), "Entered tracking scope");
        ScopeGuard {
            manager: Rc::clone(self),
            scope,
        }
    }

    /// Enter `scope` only if it is not already active.
    ///
    /// Used for non-reentrant operations such as detect-changes.
    pub fn try_enter(self: &Rc<Self>, scope: Scope) -> Option<ScopeGuard> {
        if self.is_active(scope) {
            None
        } else {
            Some(self.enter(scope))
        }
    }

    pub fn is_active(&self, scope: Scope) -> bool {
        self.depth[scope.index()].get() > 0
    }

    pub fn depth(&self, scope: Scope) -> u32 {
        self.depth[scope.index()].get()
    }

    fn leave(&self, scope: Scope) {
        let cell = &self.depth[scope.index()];
        debug_assert!(cell.get() > 0, "scope {:?} left more often than entered", scope);
        cell.set(cell.get().saturating_sub(1));
    }
}

/// Keeps a [`Scope`] active while alive.
#[derive(Debug)]
#[must_use = "the scope ends as soon as the guard is dropped"]
pub struct ScopeGuard {
    manager: Rc<TransactionManager>,
    scope: Scope,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.manager.leave(self.scope);
    }
}
