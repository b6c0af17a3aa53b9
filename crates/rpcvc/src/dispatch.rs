//! Connection registry and readiness tracking.
//!
//! The dispatcher owns one [`Registration`] per live connection, keyed by
//! [`ConnId`]. Transports hold only their id. A connection's driver calls the
//! receive entry point while its registration is active and otherwise waits
//! for the stream to signal or for someone to reactivate it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(uuid::Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dispatcher-side state of one connection.
#[derive(Debug, Default)]
pub struct Registration {
    active: AtomicBool,
    removed: AtomicBool,
    notify: Notify,
}

impl Registration {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Whether the connection has been unregistered.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Wait until the registration is reactivated or removed.
    pub async fn activated(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_active() || self.is_removed() {
                return;
            }
            notified.await;
        }
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
        if active {
            self.notify.notify_waiters();
        }
    }
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    registrations: DashMap<ConnId, Arc<Registration>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ConnId) -> Arc<Registration> {
        let registration = Arc::new(Registration::default());
        self.registrations.insert(id, Arc::clone(&registration));
        tracing::trace!(conn = %id, "Registered connection");
        registration
    }

    /// Remove `id`. Returns false if it was not registered.
    pub fn unregister(&self, id: ConnId) -> bool {
        let removed = self.registrations.remove(&id);
        if let Some((_, registration)) = &removed {
            registration.active.store(false, Ordering::Release);
            registration.removed.store(true, Ordering::Release);
            // Wake any driver parked on it so it can observe the teardown.
            registration.notify.notify_waiters();
            tracing::trace!(conn = %id, "Unregistered connection");
        }
        removed.is_some()
    }

    /// Mark `id` active or inactive. Unknown ids are ignored.
    pub fn set_active(&self, id: ConnId, active: bool) {
        if let Some(registration) = self.registrations.get(&id) {
            registration.set_active(active);
        }
    }

    pub fn is_active(&self, id: ConnId) -> bool {
        self.registrations
            .get(&id)
            .is_some_and(|registration| registration.is_active())
    }

    pub fn is_registered(&self, id: ConnId) -> bool {
        self.registrations.contains_key(&id)
    }

    pub fn registration(&self, id: ConnId) -> Option<Arc<Registration>> {
        self.registrations.get(&id).map(|r| Arc::clone(r.value()))
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
