//! Platform Keep-Alive
//!
//! A wake lock that keeps the host from throttling timers while the
//! application is in the foreground. Acquisition hands out a
//! [`KeepAliveLease`]; dropping the lease releases the lock.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeepAliveError {
    #[error("Keep-alive not supported on this platform")]
    Unsupported,

    #[error("Keep-alive request denied: {0}")]
    Denied(String),
}

/// The platform wake-lock primitive
#[async_trait]
pub trait KeepAlive: Send + Sync {
    /// Ask the platform for the lock
    async fn acquire(&self) -> Result<(), KeepAliveError>;

    /// Give the lock back
    fn release(&self);

    /// Whether the platform still honours the lock
    fn is_held(&self) -> bool;
}

/// Scoped ownership of an acquired keep-alive
pub struct KeepAliveLease {
    keep_alive: Option<Arc<dyn KeepAlive>>,
}

impl KeepAliveLease {
    pub async fn acquire(keep_alive: Arc<dyn KeepAlive>) -> Result<Self, KeepAliveError> {
        keep_alive.acquire().await?;
        Ok(Self {
            keep_alive: Some(keep_alive),
        })
    }

    /// False once the platform revoked the lock behind our back
    pub fn is_held(&self) -> bool {
        self.keep_alive.as_ref().is_some_and(|k| k.is_held())
    }

    /// Discard a lease the platform already took back, without releasing it
    pub fn into_revoked(mut self) {
        self.keep_alive = None;
    }
}

impl Drop for KeepAliveLease {
    fn drop(&mut self) {
        if let Some(keep_alive) = self.keep_alive.take() {
            keep_alive.release();
        }
    }
}

impl std::fmt::Debug for KeepAliveLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveLease")
            .field("held", &self.is_held())
            .finish()
    }
}

/// For hosts without a wake lock
#[derive(Debug, Default)]
pub struct NoopKeepAlive;

#[async_trait]
impl KeepAlive for NoopKeepAlive {
    async fn acquire(&self) -> Result<(), KeepAliveError> {
        Ok(())
    }

    fn release(&self) {}

    fn is_held(&self) -> bool {
        true
    }
}

/// In-memory keep-alive that counts acquisitions and can be revoked
#[derive(Debug, Default)]
pub struct MemoryKeepAlive {
    held: AtomicBool,
    acquired: AtomicUsize,
    released: AtomicUsize,
    deny: AtomicBool,
}

impl MemoryKeepAlive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the platform dropping the lock (e.g. screen off)
    pub fn revoke(&self) {
        self.held.store(false, Ordering::SeqCst);
    }

    pub fn set_deny(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeepAlive for MemoryKeepAlive {
    async fn acquire(&self) -> Result<(), KeepAliveError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(KeepAliveError::Denied("denied by test".to_string()));
        }
        self.held.store(true, Ordering::SeqCst);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lease_releases_on_drop() {
        let platform = Arc::new(MemoryKeepAlive::new());
        let lease = KeepAliveLease::acquire(platform.clone()).await.unwrap();
        assert!(lease.is_held());
        assert_eq!(platform.acquired(), 1);

        drop(lease);
        assert!(!platform.is_held());
        assert_eq!(platform.released(), 1);
    }

    #[tokio::test]
    async fn test_revoked_lease_reports_not_held() {
        let platform = Arc::new(MemoryKeepAlive::new());
        let lease = KeepAliveLease::acquire(platform.clone()).await.unwrap();

        platform.revoke();
        assert!(!lease.is_held());

        lease.into_revoked();
        assert_eq!(platform.released(), 0);
    }

    #[tokio::test]
    async fn test_denied_acquire() {
        let platform = Arc::new(MemoryKeepAlive::new());
        platform.set_deny(true);
        let result = KeepAliveLease::acquire(platform.clone()).await;
        assert!(matches!(result, Err(KeepAliveError::Denied(_))));
        assert_eq!(platform.released(), 0);
    }
}
