use std::collections::HashMap;
use std::sync::Arc;

use super::message::InboundMessage;

pub type Handler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Handlers per message type, in registration order. Registering the same
/// handler twice is not prevented; it will then run twice.
#[derive(Default)]
pub struct SubscriptionRegistry {
    handlers: HashMap<String, Vec<Handler>>,
}

impl SubscriptionRegistry {
    pub fn subscribe(&mut self, kind: &str, handler: Handler) {
        self.handlers.entry(kind.to_string()).or_default().push(handler);
    }

    /// Removes every registration of `handler` (compared by allocation) for
    /// `kind`.
    pub fn unsubscribe(&mut self, kind: &str, handler: &Handler) {
        if let Some(list) = self.handlers.get_mut(kind) {
            list.retain(|h| !same_handler(h, handler));
            if list.is_empty() {
                self.handlers.remove(kind);
            }
        }
    }

    /// Snapshot of the handlers for `kind` so they can run without holding
    /// the registry.
    pub fn handlers_for(&self, kind: &str) -> Vec<Handler> {
        self.handlers.get(kind).cloned().unwrap_or_default()
    }
}

fn same_handler(a: &Handler, b: &Handler) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
