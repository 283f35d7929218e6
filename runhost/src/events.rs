//! Change notifications for persisted instance updates.

use crate::core::types::InstanceEvent;

/// Receives every persisted instance change.
///
/// Implementations must not block: they are called from request handlers and
/// invocation threads.
pub trait InstanceObserver: Send + Sync {
    fn notify(&self, event: &InstanceEvent);
}

/// Observer that drops every event.
pub struct NullObserver;

impl InstanceObserver for NullObserver {
    fn notify(&self, _event: &InstanceEvent) {}
}
