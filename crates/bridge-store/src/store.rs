//! Session store trait and the in-memory backend
//!
//! Values are stored as strings (callers serialize to JSON) with an
//! optional TTL. `take` is the operation transactions rely on: it reads
//! and deletes under one lock, so two concurrent callers can never both
//! observe the same value.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

/// Abstraction over transaction/session state backends.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn SessionStore>`).
pub trait SessionStore: Send + Sync {
    /// Read a value without consuming it. Expired entries read as absent.
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>>;

    /// Write a value, replacing any existing one. `ttl` of None means the
    /// entry lives until deleted.
    fn put<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Option<Duration>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Atomically read and delete. At most one concurrent caller gets
    /// `Some`; everyone else gets `None`.
    fn take<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>>;

    fn delete<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|e| e <= now)
    }
}

/// Default single-instance backend: a mutex-guarded map with lazy expiry.
/// Expired entries are dropped when touched; `put` also sweeps
/// opportunistically so abandoned transactions don't accumulate.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

impl SessionStore for MemoryStore {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            match entries.get(key) {
                Some(entry) if entry.expired(now) => {
                    entries.remove(key);
                    Ok(None)
                }
                Some(entry) => Ok(Some(entry.value.clone())),
                None => Ok(None),
            }
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Option<Duration>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            entries.retain(|_, e| !e.expired(now));
            entries.insert(
                key.to_string(),
                Entry {
                    value,
                    expires_at: ttl.map(|t| now + t),
                },
            );
            debug!(entries = entries.len(), "store entry written");
            Ok(())
        })
    }

    fn take<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            match entries.remove(key) {
                Some(entry) if entry.expired(now) => Ok(None),
                Some(entry) => Ok(Some(entry.value)),
                None => Ok(None),
            }
        })
    }

    fn delete<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.entries.lock().await.remove(key);
            Ok(())
        })
    }
}
