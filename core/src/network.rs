use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

pub type ObserverId = u64;

type Observer = Box<dyn Fn(bool) + Send>;

#[derive(Default)]
struct MonitorState {
    connected: bool,
    observers: HashMap<ObserverId, Observer>,
}

/// Connectivity status shared by the sessions of one host.
///
/// The host owns the instance and feeds it with `set_connected`; observers
/// are called on the thread that reports the change and stay registered
/// until they are removed with `unregister`. The monitor stays locked while
/// observers run, so an observer must not call back into it.
#[derive(Clone, Default)]
pub struct NetworkMonitor {
    state: Arc<Mutex<MonitorState>>,
    next_id: Arc<AtomicU64>,
}

impl NetworkMonitor {
    pub fn new(connected: bool) -> Self {
        let monitor = Self::default();
        if let Ok(mut state) = monitor.state.lock() {
            state.connected = connected;
        }
        monitor
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.connected)
            .unwrap_or(false)
    }

    pub fn register<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(bool) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut state) = self.state.lock() {
            state.observers.insert(id, Box::new(observer));
        }
        id
    }

    pub fn unregister(&self, id: ObserverId) -> bool {
        self.state
            .lock()
            .map(|mut state| state.observers.remove(&id).is_some())
            .unwrap_or(false)
    }

    pub fn unregister_all(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.observers.clear();
        }
    }

    pub fn observer_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.observers.len())
            .unwrap_or(0)
    }

    /// Notifies observers only when the value changes.
    pub fn set_connected(&self, connected: bool) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.connected == connected {
            return;
        }
        state.connected = connected;
        debug!(connected, observers = state.observers.len(), "network status changed");
        for observer in state.observers.values() {
            observer(connected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn observers_see_changes_until_unregistered() {
        let monitor = NetworkMonitor::new(true);
        let (tx, rx) = mpsc::channel();
        let id = monitor.register(move |connected| {
            let _ = tx.send(connected);
        });

        monitor.set_connected(true);
        assert!(rx.try_recv().is_err());

        monitor.set_connected(false);
        assert_eq!(rx.try_recv().unwrap(), false);
        assert!(!monitor.is_connected());

        assert!(monitor.unregister(id));
        assert!(!monitor.unregister(id));
        monitor.set_connected(true);
        assert!(rx.try_recv().is_err());
        assert_eq!(monitor.observer_count(), 0);
    }
}
