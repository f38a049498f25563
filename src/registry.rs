use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, PoisonError, RwLock},
};

use dashmap::DashMap;
use tracing::{debug, error};

use crate::types::{Envelope, EventKind, RealtimeEvent, Target};

pub type RefreshHandler = Arc<dyn Fn() + Send + Sync>;
pub type EventHandler = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;

// handlers are compared by Arc identity
#[derive(Default)]
pub struct SubscriptionRegistry {
    refresh: DashMap<Target, Vec<RefreshHandler>>,
    events: DashMap<EventKind, Vec<EventHandler>>,
    any: RwLock<Vec<EventHandler>>,
}

fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

fn remove_first<T: ?Sized>(handlers: &mut Vec<Arc<T>>, handler: &Arc<T>) -> bool {
    match handlers.iter().position(|h| same(h, handler)) {
        Some(index) => {
            handlers.remove(index);
            true
        }
        None => false,
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_refresh(&self, target: Target, handler: RefreshHandler) {
        self.refresh.entry(target).or_default().push(handler);
        debug!(feature = %target, "refresh handler registered");
    }

    pub fn off_refresh(&self, target: Target, handler: &RefreshHandler) {
        let removed = self
            .refresh
            .get_mut(&target)
            .map(|mut handlers| remove_first(handlers.value_mut(), handler))
            .unwrap_or(false);
        if removed {
            self.refresh.remove_if(&target, |_, v| v.is_empty());
            debug!(feature = %target, "refresh handler unregistered");
        }
    }

    pub fn on_event(&self, kind: EventKind, handler: EventHandler) {
        debug!(event = %kind, "event handler registered");
        self.events.entry(kind).or_default().push(handler);
    }

    pub fn off_event(&self, kind: &EventKind, handler: &EventHandler) {
        let removed = self
            .events
            .get_mut(kind)
            .map(|mut handlers| remove_first(handlers.value_mut(), handler))
            .unwrap_or(false);
        if removed {
            self.events.remove_if(kind, |_, v| v.is_empty());
        }
    }

    pub fn on_any(&self, handler: EventHandler) {
        self.any
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn off_any(&self, handler: &EventHandler) {
        let mut any = self.any.write().unwrap_or_else(PoisonError::into_inner);
        remove_first(&mut *any, handler);
    }

    pub fn handler_count(&self, target: Target) -> usize {
        self.refresh.get(&target).map(|h| h.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        self.refresh.clear();
        self.events.clear();
        self.any
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!("registry cleared");
    }

    /// Runs every handler interested in `envelope`, synchronously and in
    /// registration order. Returns how many handlers completed.
    ///
    /// Event envelopes reach the kind's handlers, then catch-all handlers,
    /// then the refresh handlers of the target the kind maps to.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        match envelope {
            Envelope::Refresh(refresh) => self.fire_refresh(refresh.target),
            Envelope::Event(event) => {
                let mut completed = 0;
                let kind_handlers = self
                    .events
                    .get(&event.kind)
                    .map(|h| h.value().clone())
                    .unwrap_or_default();
                let any_handlers = self
                    .any
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();

                let label = event.kind.as_wire();
                for handler in kind_handlers.iter().chain(any_handlers.iter()) {
                    if invoke(&label, || handler(event)) {
                        completed += 1;
                    }
                }

                if let Some(target) = event.kind.target() {
                    completed += self.fire_refresh(target);
                }
                completed
            }
        }
    }

    fn fire_refresh(&self, target: Target) -> usize {
        // snapshot so handlers may (un)register while we iterate
        let handlers = self
            .refresh
            .get(&target)
            .map(|h| h.value().clone())
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(feature = %target, "no refresh handlers");
        }

        let mut completed = 0;
        for handler in &handlers {
            if invoke(target.as_str(), || handler()) {
                completed += 1;
            }
        }
        completed
    }
}

fn invoke(label: &str, f: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(panic) => {
            error!(handler = label, panic = panic_message(panic.as_ref()), "push handler panicked");
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
