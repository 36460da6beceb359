//! Session Seam
//!
//! The realtime layer only runs while a user is signed in. Sign-out tears
//! down every channel and stops heartbeats; sign-in brings them back.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    SignedIn,
    SignedOut,
}

/// Source of the current auth session
pub trait SessionProvider: Send + Sync {
    fn has_session(&self) -> bool;

    /// Receiver notified on every sign-in and sign-out
    fn watch(&self) -> watch::Receiver<SessionState>;
}

/// Session state held in a watch channel
#[derive(Debug)]
pub struct WatchSession {
    tx: watch::Sender<SessionState>,
}

impl WatchSession {
    pub fn new(initial: SessionState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn signed_in() -> Self {
        Self::new(SessionState::SignedIn)
    }

    pub fn signed_out() -> Self {
        Self::new(SessionState::SignedOut)
    }

    pub fn sign_in(&self) {
        self.tx.send_replace(SessionState::SignedIn);
    }

    pub fn sign_out(&self) {
        self.tx.send_replace(SessionState::SignedOut);
    }
}

impl SessionProvider for WatchSession {
    fn has_session(&self) -> bool {
        *self.tx.borrow() == SessionState::SignedIn
    }

    fn watch(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watchers_see_transitions() {
        let session = WatchSession::signed_out();
        let mut rx = session.watch();
        assert!(!session.has_session());

        session.sign_in();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionState::SignedIn);
        assert!(session.has_session());
    }
}
