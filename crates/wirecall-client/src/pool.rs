use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use wirecall_transport::{Connector, Endpoint};

use crate::error::{CallError, Result};
use crate::stub::Stub;

/// Tunables for a [`StubPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Budget for establishing a new connection.
    pub connect_timeout: Duration,
    /// Default per-call deadline for calls issued through this pool.
    pub call_timeout: Duration,
    /// How long an unreferenced stub may sit idle before a sweep closes it.
    pub idle_expiration: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            call_timeout: Duration::from_secs(10),
            idle_expiration: Duration::from_secs(30),
        }
    }
}

struct PoolEntry<S: wirecall_transport::ByteStream> {
    stub: Arc<Stub<S>>,
    refcount: usize,
    /// Set when `refcount` drops to zero; cleared on checkout.
    idle_since: Option<Instant>,
    /// An immediate return was requested while others still held the stub;
    /// close it once the last borrower is done.
    discard: bool,
}

/// A cache of client stubs keyed by endpoint.
///
/// At most one live stub exists per endpoint; callers borrowing the same
/// endpoint share it and multiplex their calls over one connection.
/// Checkouts are refcounted so a sweep never closes a connection that
/// still has borrowers. Unreferenced stubs linger for
/// [`PoolConfig::idle_expiration`] and are then closed by the next sweep;
/// sweeps run inline on every pool operation, so no background thread is
/// involved.
///
/// Broken stubs are evicted on sight: a checkout that finds one replaces
/// it with a fresh connection.
pub struct StubPool<C: Connector> {
    connector: C,
    config: PoolConfig,
    entries: Mutex<HashMap<Endpoint, PoolEntry<C::Stream>>>,
}

impl<C: Connector> StubPool<C> {
    /// Create an empty pool over `connector`.
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Default deadline for calls issued through this pool.
    pub fn get_timeout(&self) -> crate::Timeout {
        crate::Timeout::new(self.config.call_timeout)
    }

    /// Borrow the stub for `endpoint`, connecting if none is cached.
    ///
    /// Increments the refcount; every successful `get_stub` must be paired
    /// with a [`put_stub`](Self::put_stub).
    ///
    /// A broken stub that other callers still hold is handed out rather
    /// than replaced, keeping the refcounts consistent: its calls fail
    /// fast with [`CallError::Broken`], the last return evicts it, and a
    /// retry (for example through [`with_stub`](Self::with_stub)) then
    /// reconnects.
    pub fn get_stub(&self, endpoint: &Endpoint, tls: bool) -> Result<Arc<Stub<C::Stream>>> {
        self.sweep();

        {
            let mut entries = self.entries.lock().unwrap();
            let evict = matches!(
                entries.get(endpoint),
                Some(e) if (e.stub.is_broken() || e.discard) && e.refcount == 0
            );
            if evict {
                debug!(%endpoint, "evicting broken stub");
                entries.remove(endpoint);
            } else if let Some(entry) = entries.get_mut(endpoint) {
                // Still-borrowed broken entries are handed out as-is;
                // their calls fail fast and the last return evicts them.
                // Anything else would corrupt the refcounts.
                entry.refcount += 1;
                entry.idle_since = None;
                return Ok(Arc::clone(&entry.stub));
            }
        }

        // Connect outside the lock; other endpoints stay usable meanwhile.
        let stream = self
            .connector
            .connect(endpoint, tls, self.config.connect_timeout)?;
        let fresh = Arc::new(Stub::new(stream)?);

        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(endpoint) {
            // Lost the race to another caller; adopt the winner's stub.
            Some(entry) => {
                entry.refcount += 1;
                entry.idle_since = None;
                Ok(Arc::clone(&entry.stub))
            }
            None => {
                entries.insert(
                    endpoint.clone(),
                    PoolEntry {
                        stub: Arc::clone(&fresh),
                        refcount: 1,
                        idle_since: None,
                        discard: false,
                    },
                );
                Ok(fresh)
            }
        }
    }

    /// Return a borrowed stub.
    ///
    /// With `immediate` the entry is dropped from the pool right away and
    /// the connection closed once the last borrower returns it; otherwise
    /// the stub stays cached and the idle clock starts when the refcount
    /// reaches zero.
    pub fn put_stub(&self, endpoint: &Endpoint, immediate: bool) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(endpoint)
            .ok_or_else(|| CallError::UnknownEndpoint(endpoint.clone()))?;

        entry.refcount = entry.refcount.saturating_sub(1);
        if immediate || entry.stub.is_broken() {
            entry.discard = true;
        }
        if entry.refcount == 0 {
            if entry.discard {
                let entry = entries.remove(endpoint).unwrap();
                close_entry(endpoint, &entry);
            } else {
                entry.idle_since = Some(Instant::now());
            }
        }
        drop(entries);

        self.sweep();
        Ok(())
    }

    /// Non-creating lookup: borrow the cached stub for `endpoint` if one
    /// is live, without connecting. Broken unreferenced entries found here
    /// are evicted and `None` is returned.
    pub fn acquire(&self, endpoint: &Endpoint) -> Option<Arc<Stub<C::Stream>>> {
        let mut entries = self.entries.lock().unwrap();
        let unusable = matches!(
            entries.get(endpoint),
            Some(e) if e.stub.is_broken() || e.discard
        );
        if unusable {
            let evictable = entries.get(endpoint).map(|e| e.refcount == 0).unwrap_or(false);
            if evictable {
                if let Some(entry) = entries.remove(endpoint) {
                    close_entry(endpoint, &entry);
                }
            }
            return None;
        }
        let entry = entries.get_mut(endpoint)?;
        entry.refcount += 1;
        entry.idle_since = None;
        Some(Arc::clone(&entry.stub))
    }

    /// Run `f` with the stub for `endpoint`, handling checkout and return.
    ///
    /// A connection-level failure inside `f` drops the stub from the pool
    /// so the next caller reconnects; call-level failures (timeout, buffer
    /// budget) keep it cached.
    pub fn with_stub<T, F>(&self, endpoint: &Endpoint, tls: bool, f: F) -> Result<T>
    where
        F: FnOnce(&Stub<C::Stream>) -> Result<T>,
    {
        let stub = self.get_stub(endpoint, tls)?;
        let outcome = f(&stub);
        let discard = stub.is_broken()
            || matches!(
                outcome,
                Err(CallError::Io(_) | CallError::ConnectionClosed | CallError::Broken)
            );
        self.put_stub(endpoint, discard)?;
        outcome
    }

    /// Close and drop every idle-expired or broken unreferenced entry.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|endpoint, entry| {
            if entry.refcount > 0 {
                return true;
            }
            let expired = matches!(
                entry.idle_since,
                Some(since) if now.duration_since(since) >= self.config.idle_expiration
            );
            if expired || entry.discard || entry.stub.is_broken() {
                close_entry(endpoint, entry);
                false
            } else {
                true
            }
        });
    }

    /// Number of cached endpoints.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the pool caches no stubs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: Connector> Drop for StubPool<C> {
    fn drop(&mut self) {
        let entries = self.entries.lock().unwrap();
        for (endpoint, entry) in entries.iter() {
            close_entry(endpoint, entry);
        }
    }
}

fn close_entry<S: wirecall_transport::ByteStream>(endpoint: &Endpoint, entry: &PoolEntry<S>) {
    debug!(%endpoint, "closing pooled connection");
    if let Err(err) = entry.stub.close() {
        warn!(%endpoint, %err, "error closing pooled connection");
    }
}
