//! Single-flight recovery queue.
//!
//! At most one recovery future runs at a time. Callers that ask for a
//! recovery while one is in progress join the in-flight attempt instead of
//! starting another; once it has resolved, the next request starts a fresh one.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};

/// Handle to the in-flight (or just-finished) recovery.
pub type Recovery<T> = Shared<BoxFuture<'static, T>>;

/// Serialises recoveries so that only one runs chain-wide.
pub struct SingleFlight<T: Clone> {
    slot: Arc<Mutex<Option<(u64, Recovery<T>)>>>,
    generation: Arc<Mutex<u64>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            generation: Arc::new(Mutex::new(0)),
        }
    }

    /// Join the in-flight recovery, or start one built by `make`.
    ///
    /// `make` is only invoked when no recovery is running.
    pub fn run<F, Fut>(&self, make: F) -> Recovery<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut slot = self.slot.lock().unwrap();
        if let Some((_, fut)) = slot.as_ref() {
            if fut.peek().is_none() {
                tracing::debug!("joining in-flight recovery");
                return fut.clone();
            }
        }

        let gen = {
            let mut g = self.generation.lock().unwrap();
            *g += 1;
            *g
        };
        let release = Arc::clone(&self.slot);
        let fut = make();
        let shared = async move {
            let out = fut.await;
            // Free the slot as soon as the recovery resolves, unless a newer one replaced it.
            let mut slot = release.lock().unwrap();
            if matches!(slot.as_ref(), Some((g, _)) if *g == gen) {
                *slot = None;
            }
            out
        }
        .boxed()
        .shared();
        *slot = Some((gen, shared.clone()));
        tracing::debug!(generation = gen, "starting recovery");
        shared
    }

    /// Returns `true` while a recovery is in flight.
    pub fn is_busy(&self) -> bool {
        self.slot
            .lock()
            .unwrap()
            .as_ref()
            .map(|(_, f)| f.peek().is_none())
            .unwrap_or(false)
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
