//! Cancellation bookkeeping for concurrent downloads.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// Tracks in-flight downloads and hands out their cancellation tokens.
#[derive(Debug, Default)]
pub struct DownloadTracker {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl DownloadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a download for `name` is in flight.
    pub fn has(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Register a download and return its token.
    ///
    /// Returns `None` when a download for `name` is already in flight.
    pub fn start(&self, name: &str) -> Option<CancellationToken> {
        let mut tokens = self.lock();
        if tokens.contains_key(name) {
            return None;
        }
        let token = CancellationToken::new();
        tokens.insert(name.to_string(), token.clone());
        Some(token)
    }

    /// Cancel a download if one is in flight.
    ///
    /// Idempotent; returns whether a download was found.
    pub fn cancel(&self, name: &str) -> bool {
        match self.lock().get(name) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Unregister a finished download.
    pub fn finish(&self, name: &str) {
        self.lock().remove(name);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.tokens.lock().expect("download tracker mutex poisoned")
    }
}
