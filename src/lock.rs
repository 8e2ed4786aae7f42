// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Cooperative FIFO locks keyed by document URI.
//!
//! Every message that names a `textDocument.uri` runs behind this lock, so
//! the analyzer observes `didOpen -> didChange -> request -> didClose` in
//! the order the client sent them, even though handlers run as independent
//! tasks. Permits are created synchronously at submission time; the queue
//! position is fixed then, not when the task first polls.
//!
//! Invariants:
//! - at most one permit per URI is acquired at any instant;
//! - permits for one URI are granted in creation order;
//! - a map entry is removed only when no permits for its URI remain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// FIFO lock map, one chain per URI. Cheap to clone.
#[derive(Clone, Default)]
pub struct UriLocks {
    inner: Arc<Mutex<HashMap<String, LockEntry>>>,
}

struct LockEntry {
    /// Completion handle of the most recently enqueued permit. The next
    /// permit waits on this before running.
    tail: Option<oneshot::Receiver<()>>,
    /// Permits outstanding (held or queued) for this URI.
    waiters: usize,
}

/// A queue position for one URI. Await [`UriPermit::acquired`] before doing
/// work; dropping the permit releases the lock and wakes the successor.
pub struct UriPermit {
    uri: String,
    inner: Arc<Mutex<HashMap<String, LockEntry>>>,
    predecessor: Option<oneshot::Receiver<()>>,
    done: Option<oneshot::Sender<()>>,
}

impl UriLocks {
    /// Creates an empty lock map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a permit for `uri`. Submission order fixes grant order.
    #[must_use]
    pub fn acquire(&self, uri: &str) -> UriPermit {
        let (done_tx, done_rx) = oneshot::channel();

        let predecessor = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let entry = map.entry(uri.to_string()).or_insert(LockEntry {
                tail: None,
                waiters: 0,
            });
            entry.waiters += 1;
            entry.tail.replace(done_rx)
        };

        UriPermit {
            uri: uri.to_string(),
            inner: self.inner.clone(),
            predecessor,
            done: Some(done_tx),
        }
    }

    /// Number of URIs with outstanding permits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// True if no URI has an outstanding permit.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UriPermit {
    /// Resolves once every earlier permit for this URI has been released.
    ///
    /// A predecessor that was dropped without running counts as released.
    pub async fn acquired(&mut self) {
        if let Some(prev) = self.predecessor.take() {
            // Err means the predecessor dropped its sender; either way the
            // slot ahead of us is free.
            let _ = prev.await;
        }
    }
}

impl Drop for UriPermit {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }

        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get_mut(&self.uri) {
            entry.waiters -= 1;
            if entry.waiters == 0 {
                map.remove(&self.uri);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn grants_in_submission_order() {
        let locks = UriLocks::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..10u64 {
            // Permits created here, in order, before any task runs.
            let mut permit = locks.acquire("file:///a.ts");
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                // Stagger polling so submission order, not poll order, decides.
                tokio::time::sleep(Duration::from_millis(10 - i)).await;
                permit.acquired().await;
                order.lock().unwrap().push(i);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let observed = order.lock().unwrap().clone();
        assert_eq!(observed, (0..10u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn at_most_one_holder_per_uri() {
        let locks = UriLocks::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let mut permit = locks.acquire("file:///b.go");
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                permit.acquired().await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_uris_do_not_block() {
        let locks = UriLocks::new();

        let mut blocker = locks.acquire("file:///a.ts");
        blocker.acquired().await;

        // Held lock on a.ts must not delay b.ts.
        let mut other = locks.acquire("file:///b.ts");
        tokio::time::timeout(Duration::from_millis(100), other.acquired())
            .await
            .expect("independent URI should acquire immediately");
    }

    #[tokio::test]
    async fn entry_removed_when_last_permit_drops() {
        let locks = UriLocks::new();

        {
            let mut first = locks.acquire("file:///c.js");
            let _second = locks.acquire("file:///c.js");
            first.acquired().await;
            assert_eq!(locks.len(), 1);
        }

        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn dropped_permit_unblocks_successor() {
        let locks = UriLocks::new();

        let abandoned = locks.acquire("file:///d.go");
        let mut next = locks.acquire("file:///d.go");
        drop(abandoned);

        tokio::time::timeout(Duration::from_millis(100), next.acquired())
            .await
            .expect("successor should run after predecessor is dropped");
    }
}
