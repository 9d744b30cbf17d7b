use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::runtime::model::Variant;

/// Event names that are kept working for compatibility but forward to
/// their canonical counterparts.
const DEPRECATED_EVENTS: &[(&str, &str)] = &[
    ("nodes-started", "flows:started"),
    ("nodes-stopped", "flows:stopped"),
];

pub type EventPayload = Variant;

type ListenerFn = Arc<dyn Fn(&EventPayload) + Send + Sync>;

struct ListenerEntry {
    id: usize,
    once: bool,
    func: ListenerFn,
}

/// A handle returned by `on`/`once`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle {
    id: usize,
}

/// Process-wide named event emitter.
///
/// `once` listeners are consumed atomically when the event fires; emitting
/// returns whether any listener was present.
#[derive(Default)]
pub struct Events {
    listeners: Mutex<HashMap<String, Vec<ListenerEntry>>>,
    next_id: AtomicUsize,
    warned: Mutex<Vec<String>>,
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Events").finish()
    }
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    fn canonical(&self, event: &str, warn: bool) -> String {
        for (old, new) in DEPRECATED_EVENTS {
            if *old == event {
                if warn {
                    let mut warned = self.warned.lock().expect("events lock");
                    if !warned.iter().any(|x| x == event) {
                        warned.push(event.to_string());
                        log::warn!("[EVENTS] The event '{}' is deprecated, use '{}' instead", old, new);
                    }
                }
                return new.to_string();
            }
        }
        event.to_string()
    }

    fn add_entry(&self, event: &str, func: ListenerFn, once: bool) -> ListenerHandle {
        let event = self.canonical(event, true);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.listeners.lock().expect("events lock");
        let entry = ListenerEntry { id, once, func };
        listeners.entry(event).or_default().push(entry);
        ListenerHandle { id }
    }

    pub fn on<F>(&self, event: &str, func: F) -> ListenerHandle
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        self.add_entry(event, Arc::new(func), false)
    }

    pub fn add_listener<F>(&self, event: &str, func: F) -> ListenerHandle
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        self.on(event, func)
    }

    pub fn once<F>(&self, event: &str, func: F) -> ListenerHandle
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        self.add_entry(event, Arc::new(func), true)
    }

    pub fn remove_listener(&self, event: &str, handle: &ListenerHandle) -> bool {
        let event = self.canonical(event, false);
        let mut listeners = self.listeners.lock().expect("events lock");
        if let Some(entries) = listeners.get_mut(&event) {
            let before = entries.len();
            entries.retain(|e| e.id != handle.id);
            return entries.len() != before;
        }
        false
    }

    pub fn remove_all_listeners(&self, event: Option<&str>) {
        let mut listeners = self.listeners.lock().expect("events lock");
        match event {
            Some(event) => {
                let event = self.canonical(event, false);
                listeners.remove(&event);
            }
            None => listeners.clear(),
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        let event = self.canonical(event, false);
        let listeners = self.listeners.lock().expect("events lock");
        listeners.get(&event).map(|x| x.len()).unwrap_or(0)
    }

    /// Fires an event. Returns `true` when at least one listener received
    /// it. `once` listeners are taken out under the lock, so each fires at
    /// most one time even with concurrent emits.
    pub fn emit(&self, event: &str, payload: EventPayload) -> bool {
        let event = self.canonical(event, false);
        let to_call: Vec<ListenerFn> = {
            let mut listeners = self.listeners.lock().expect("events lock");
            match listeners.get_mut(&event) {
                Some(entries) => {
                    let fns: Vec<ListenerFn> = entries.iter().map(|e| e.func.clone()).collect();
                    entries.retain(|e| !e.once);
                    if entries.is_empty() {
                        listeners.remove(&event);
                    }
                    fns
                }
                None => Vec::new(),
            }
        };

        let had_listener = !to_call.is_empty();
        for func in to_call {
            func(&payload);
        }
        had_listener
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_returns_listener_presence() {
        let events = Events::new();
        assert!(!events.emit("flows:started", Variant::Null));

        let _h = events.on("flows:started", |_| {});
        assert!(events.emit("flows:started", Variant::Null));
    }

    #[test]
    fn test_once_listener_fires_exactly_once() {
        let events = Events::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        events.once("deploy", move |_| {
            counter2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(events.emit("deploy", Variant::Null));
        assert!(!events.emit("deploy", Variant::Null));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removed_listener_is_never_invoked() {
        let events = Events::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let handle = events.on("x", move |_| {
            counter2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(events.remove_listener("x", &handle));
        events.emit("x", Variant::Null);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_deprecated_name_forwards_to_canonical() {
        let events = Events::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let _h = events.on("nodes-started", move |_| {
            counter2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(events.listener_count("flows:started"), 1);
        assert!(events.emit("flows:started", Variant::Null));
        assert!(events.emit("nodes-started", Variant::Null));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_payload() {
        let events = Events::new();
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        events.on("evt", move |p| {
            *seen2.lock().unwrap() = Some(p.clone());
        });
        events.emit("evt", Variant::from("hello"));
        assert_eq!(*seen.lock().unwrap(), Some(Variant::from("hello")));
    }
}
