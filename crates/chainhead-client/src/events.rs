//! Typed publish/subscribe for chain-head notifications.
//!
//! Handlers run synchronously on the emitting task, in registration order,
//! one event at a time. Removing a handler takes effect for every event
//! emitted after [`Listener::unsubscribe`] returns.

use std::sync::{Arc, Mutex};

use crate::types::{BlockHash, PinnedBlock};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: u64,
    handlers: Vec<(u64, Handler<E>)>,
}

pub struct EventBus<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    /// Register a handler. It stays registered until the returned listener
    /// is unsubscribed or dropped.
    pub fn subscribe<F>(&self, handler: F) -> Listener
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut reg = self.registry.lock().unwrap();
            reg.next_id += 1;
            let id = reg.next_id;
            reg.handlers.push((id, Arc::new(handler)));
            id
        };
        let weak = Arc::downgrade(&self.registry);
        Listener {
            detach: Mutex::new(Some(Box::new(move || {
                if let Some(reg) = weak.upgrade() {
                    // Dropped outside the lock: the handler may own listeners.
                    let removed = {
                        let mut reg = reg.lock().unwrap();
                        let at = reg.handlers.iter().position(|(h, _)| *h == id);
                        at.map(|i| reg.handlers.remove(i))
                    };
                    drop(removed);
                }
            }))),
        }
    }

    /// Deliver `event` to every registered handler.
    pub fn emit(&self, event: &E) {
        let handlers: Vec<Handler<E>> = self
            .registry
            .lock()
            .unwrap()
            .handlers
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.registry.lock().unwrap().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a registered handler. Dropping it removes the handler.
pub struct Listener {
    detach: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Listener {
    /// Remove the handler. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        let detach = self.detach.lock().unwrap().take();
        if let Some(detach) = detach {
            detach();
        }
    }

    pub fn is_active(&self) -> bool {
        self.detach.lock().unwrap().is_some()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("active", &self.is_active())
            .finish()
    }
}

// ─── Chain-head notifications ─────────────────────────────────────────────────

/// Notifications emitted by [`crate::ChainHead`], in node order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainHeadEvent {
    NewBlock(PinnedBlock),
    BestBlock { hash: BlockHash },
    Finalized {
        hashes: Vec<BlockHash>,
        pruned: Vec<BlockHash>,
    },
    /// A block was announced with a runtime the node could not load.
    InvalidRuntime { hash: BlockHash, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewBlock,
    BestBlock,
    Finalized,
    InvalidRuntime,
}

impl ChainHeadEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewBlock(_) => EventKind::NewBlock,
            Self::BestBlock { .. } => EventKind::BestBlock,
            Self::Finalized { .. } => EventKind::Finalized,
            Self::InvalidRuntime { .. } => EventKind::InvalidRuntime,
        }
    }
}
