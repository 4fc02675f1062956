//! Nested cancellation scopes
//!
//! Three levels exist per session: the process token, the session token
//! derived from it, and the after-ASR scope derived from the session token.
//! Cancelling the after-ASR scope is the barge-in mechanism: every task
//! belonging to the current assistant turn selects against it and stops at
//! its next suspension point. A fresh child is created lazily on the next
//! `get`, so the following utterance starts with a clean scope.

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// A lazily created child cancellation scope.
pub struct Scope {
    parent: CancellationToken,
    child: Mutex<Option<CancellationToken>>,
}

impl Scope {
    pub fn new(parent: CancellationToken) -> Self {
        Self {
            parent,
            child: Mutex::new(None),
        }
    }

    /// Current child token, created from the parent on first use and after
    /// every cancel.
    pub fn get(&self) -> CancellationToken {
        let mut child = self.child.lock().unwrap();
        child.get_or_insert_with(|| self.parent.child_token()).clone()
    }

    /// Cancel the current child and forget it; the next [`get`](Self::get)
    /// returns a fresh, non-cancelled token.
    pub fn cancel(&self) {
        let token = self.child.lock().unwrap().take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Equivalent to [`cancel`](Self::cancel).
    pub fn reset(&self) {
        self.cancel();
    }

    /// Whether the *current* child (if any) has been cancelled. A scope with
    /// no live child counts as not cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.child
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_is_lazy_and_stable() {
        let parent = CancellationToken::new();
        let scope = Scope::new(parent);
        let a = scope.get();
        let b = scope.get();
        assert!(!a.is_cancelled());
        // Same underlying child until a cancel happens.
        scope.cancel();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[test]
    fn test_cancel_then_get_returns_fresh_token() {
        let parent = CancellationToken::new();
        let scope = Scope::new(parent);
        let old = scope.get();
        scope.cancel();
        let fresh = scope.get();
        assert!(old.is_cancelled());
        assert!(!fresh.is_cancelled());
    }

    #[test]
    fn test_parent_cancel_reaches_child() {
        let parent = CancellationToken::new();
        let scope = Scope::new(parent.clone());
        let child = scope.get();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_three_level_hierarchy() {
        let process = CancellationToken::new();
        let session = process.child_token();
        let after_asr = Scope::new(session.clone());
        let token = after_asr.get();

        // Cancelling the innermost scope leaves the session running.
        after_asr.cancel();
        assert!(token.is_cancelled());
        assert!(!session.is_cancelled());

        // Cancelling the process reaches a freshly derived after-ASR token.
        let token = after_asr.get();
        process.cancel();
        assert!(session.is_cancelled());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_reset_alias() {
        let scope = Scope::new(CancellationToken::new());
        let t = scope.get();
        scope.reset();
        assert!(t.is_cancelled());
        assert!(!scope.is_cancelled());
    }
}
