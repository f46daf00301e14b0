//! Cancellation flag and link-state observable shared by a bridge's tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fleetbridge_types::LinkState;
use tokio::sync::watch;
use tracing::{info, warn};

/// Cooperative cancellation flag.
///
/// Clone it cheaply – all clones share the same flag.  Tasks never get
/// interrupted; they poll [`Shutdown::is_triggered`] between bounded waits.
#[derive(Clone, Debug, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag.  Returns `true` only for the call that actually set it.
    pub fn trigger(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Publishes a bridge's [`LinkState`] and logs every transition.
#[derive(Clone, Debug)]
pub struct LinkMonitor {
    bridge: &'static str,
    state: Arc<watch::Sender<LinkState>>,
}

impl LinkMonitor {
    pub fn new(bridge: &'static str) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            bridge,
            state: Arc::new(state),
        }
    }

    /// Record a new state.  Repeating the current state is a no-op.
    pub fn set(&self, next: LinkState) {
        let mut previous = next;
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            previous = std::mem::replace(current, next);
            true
        });
        if !changed {
            return;
        }
        if next == LinkState::Degraded {
            warn!(bridge = self.bridge, from = ?previous, "device link degraded");
        } else {
            info!(bridge = self.bridge, from = ?previous, to = ?next, "device link state changed");
        }
    }

    pub fn get(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_reports_first_caller_only() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        assert!(!clone.is_triggered());
        assert!(shutdown.trigger());
        assert!(!clone.trigger());
        assert!(clone.is_triggered());
    }

    #[tokio::test]
    async fn link_monitor_notifies_subscribers() {
        let monitor = LinkMonitor::new("test");
        let mut rx = monitor.subscribe();
        assert_eq!(*rx.borrow(), LinkState::Disconnected);

        monitor.set(LinkState::Discovering);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), LinkState::Discovering);

        monitor.set(LinkState::Discovering);
        assert!(!rx.has_changed().unwrap());

        monitor.set(LinkState::Connected);
        assert_eq!(monitor.get(), LinkState::Connected);
    }

    #[test]
    fn link_monitor_works_without_subscribers() {
        let monitor = LinkMonitor::new("test");
        monitor.set(LinkState::Degraded);
        assert_eq!(monitor.get(), LinkState::Degraded);
    }
}
