//! Synchronous listener registries.
//!
//! Components expose events (access unit received, stats available, offer /
//! answer / PLI received) through a [`Listeners`] registry. Handlers run on
//! the emitting thread in registration order. Emission iterates a snapshot,
//! so a handler may register further handlers without deadlocking.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Listeners<T> {
    handlers: RwLock<Vec<Handler<T>>>,
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Handler<T>> = self.handlers.read().clone();
        for handler in &snapshot {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners").field("count", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn emits_in_registration_order() {
        let listeners = Listeners::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = seen.clone();
            listeners.subscribe(move |v: &u32| seen.lock().push(format!("{tag}{v}")));
        }
        listeners.emit(&7);
        assert_eq!(*seen.lock(), vec!["a7", "b7"]);
    }

    #[test]
    fn handler_may_subscribe_during_emit() {
        let listeners = Arc::new(Listeners::<()>::new());
        let inner = listeners.clone();
        listeners.subscribe(move |_| inner.subscribe(|_| {}));
        listeners.emit(&());
        assert_eq!(listeners.len(), 2);
    }
}
