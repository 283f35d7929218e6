//! Shared application state for the HTTP server.

use std::sync::Arc;

use runhost::core::types::InstanceEvent;
use runhost::events::InstanceObserver;
use runhost::lifecycle::LifecycleManager;
use tokio::sync::broadcast;

/// Buffered events per SSE subscriber before it starts lagging.
const EVENT_BUFFER: usize = 256;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<LifecycleManager>,
    /// Broadcast sender for instance change events.
    pub event_tx: Arc<broadcast::Sender<InstanceEvent>>,
    /// Expose internal error details in 500 responses.
    pub development: bool,
}

impl AppState {
    /// Build the state; `build` receives the observer the manager must report to.
    pub fn new(
        development: bool,
        build: impl FnOnce(Arc<dyn InstanceObserver>) -> LifecycleManager,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
        let event_tx = Arc::new(event_tx);
        let observer: Arc<dyn InstanceObserver> = Arc::new(BroadcastObserver {
            tx: Arc::clone(&event_tx),
        });
        Self {
            manager: Arc::new(build(observer)),
            event_tx,
            development,
        }
    }
}

/// Forwards instance changes to SSE subscribers.
pub struct BroadcastObserver {
    tx: Arc<broadcast::Sender<InstanceEvent>>,
}

impl InstanceObserver for BroadcastObserver {
    fn notify(&self, event: &InstanceEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event.clone());
    }
}
