//! Connectivity signal shared between the platform layer and the queue.
//!
//! Whatever observes the network (an OS callback, a periodic health
//! check) calls [`Connectivity::set_online`]; the queue reads the current
//! value and listens for offline-to-online transitions through a
//! [`tokio::sync::watch`] channel.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Cloneable online/offline flag with change notification.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connectivity")
            .field("online", &self.is_online())
            .finish()
    }
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record the current state. Returns `true` if it changed, in which
    /// case subscribers are woken.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            info!(online, "connectivity changed");
        }
        changed
    }

    /// Receiver that observes every future change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_online_reports_changes_only() {
        let connectivity = Connectivity::new(false);
        assert!(!connectivity.is_online());

        assert!(connectivity.set_online(true));
        assert!(!connectivity.set_online(true));
        assert!(connectivity.is_online());
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let connectivity = Connectivity::new(false);
        let mut rx = connectivity.subscribe();

        let clone = connectivity.clone();
        tokio::spawn(async move {
            clone.set_online(true);
        });

        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
    }
}
